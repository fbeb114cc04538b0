//! Filesystem access rooted at the synced directory: enumerate, stat, read and write byte ranges.
//!
//! Names are relative, `/`-separated paths. Anything absolute or containing `..` is refused.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::signature;

/// Suffix of the temporary file used by [`FileStore::write_all`].
const PARTIAL_SUFFIX: &str = ".deltapod-partial";

/// Size and modification time of a stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub modified: i64,
}

/// Hidden if the leaf or any ancestor segment starts with `.`.
pub fn is_hidden(name: &str) -> bool {
    name.split('/').any(|seg| seg.starts_with('.'))
}

/// A name is acceptable if it is relative, non-empty and free of `.`/`..` segments.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !name.contains('\\')
        && name
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        if !is_valid_name(name) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid file name: {name:?}"),
            ));
        }
        Ok(self.root.join(name))
    }

    /// All regular files under the root, sorted by name.
    pub fn list(&self, include_hidden: bool) -> io::Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = relative_name(&self.root, entry.path()) else {
                continue;
            };
            if name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            if !include_hidden && is_hidden(&name) {
                continue;
            }
            out.push(name);
        }
        out.sort();
        Ok(out)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn stat(&self, name: &str) -> io::Result<FileStat> {
        let meta = fs::metadata(self.resolve(name)?)?;
        let modified: DateTime<Utc> = meta.modified()?.into();
        Ok(FileStat {
            size: meta.len(),
            modified: modified.timestamp_millis(),
        })
    }

    pub fn open(&self, name: &str) -> io::Result<File> {
        File::open(self.resolve(name)?)
    }

    /// Read up to `size` bytes at `offset`; shorter at end of file.
    pub fn read_range(&self, name: &str, offset: u64, size: u32) -> io::Result<Vec<u8>> {
        let mut file = self.open(name)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size as usize];
        let n = signature::read_full(&mut file, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn read_all(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(name)?)
    }

    /// Write `data` at `offset`, creating the file and parent directories if needed.
    pub fn write_range(&self, name: &str, offset: u64, data: &[u8]) -> io::Result<()> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()
    }

    pub fn set_len(&self, name: &str, len: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(self.resolve(name)?)?;
        file.set_len(len)
    }

    /// Replace the whole file: write a sibling temporary, then rename over the target.
    pub fn write_all(&self, name: &str, data: &[u8]) -> io::Result<()> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(PARTIAL_SUFFIX);
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)
    }

    pub fn remove(&self, name: &str) -> io::Result<()> {
        match fs::remove_file(self.resolve(name)?) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    pub fn strong_signature(&self, name: &str) -> io::Result<String> {
        signature::strong_signature_of_reader(BufReader::new(self.open(name)?))
    }

    pub fn weak_signatures(&self, name: &str, block_size: u32) -> io::Result<Vec<u32>> {
        signature::block_signatures(BufReader::new(self.open(name)?), block_size)
    }
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(s) => parts.push(s.to_str()?.to_string()),
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
