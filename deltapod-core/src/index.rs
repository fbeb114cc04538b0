//! Metadata index: file records, removal tombstones and the listing watermark.
//!
//! The engine only depends on the [`MetadataIndex`] trait; persistence is up to the host.
//! [`MemoryIndex`] is the in-process implementation used by the daemon and tests.

use std::collections::BTreeMap;

use crate::protocol::FileInfo;

/// Where the last observed content change of a file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub name: String,
    pub timestamp: i64,
    pub size: u64,
    pub strong_signature: String,
    pub owner: Owner,
}

impl FileRecord {
    pub fn info(&self) -> FileInfo {
        FileInfo {
            name: self.name.clone(),
            timestamp: self.timestamp,
            size: self.size,
            signature: self.strong_signature.clone(),
        }
    }

    pub fn from_info(info: &FileInfo, owner: Owner) -> Self {
        Self {
            name: info.name.clone(),
            timestamp: info.timestamp,
            size: info.size,
            strong_signature: info.signature.clone(),
            owner,
        }
    }
}

/// Tombstone: when a file was removed locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedRecord {
    pub name: String,
    pub timestamp: i64,
}

/// Operations the sync engine consumes from the metadata store.
pub trait MetadataIndex {
    fn get_file(&self, name: &str) -> Option<FileRecord>;
    fn get_files(&self) -> Vec<FileRecord>;
    fn insert_or_replace_file(&mut self, record: FileRecord);
    fn delete_file(&mut self, name: &str) -> Option<FileRecord>;
    fn get_removed(&self, name: &str) -> Option<RemovedRecord>;
    fn insert_or_replace_removed(&mut self, record: RemovedRecord);
    fn delete_removed(&mut self, name: &str) -> Option<RemovedRecord>;
    fn last_checked(&self) -> Option<i64>;
    fn set_last_checked(&mut self, timestamp: i64);

    fn insert_or_replace_files(&mut self, records: Vec<FileRecord>) {
        for r in records {
            self.insert_or_replace_file(r);
        }
    }

    fn insert_or_replace_removed_many(&mut self, records: Vec<RemovedRecord>) {
        for r in records {
            self.insert_or_replace_removed(r);
        }
    }
}

/// In-memory index, ordered by path.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    files: BTreeMap<String, FileRecord>,
    removed: BTreeMap<String, RemovedRecord>,
    last_checked: Option<i64>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataIndex for MemoryIndex {
    fn get_file(&self, name: &str) -> Option<FileRecord> {
        self.files.get(name).cloned()
    }

    fn get_files(&self) -> Vec<FileRecord> {
        self.files.values().cloned().collect()
    }

    fn insert_or_replace_file(&mut self, record: FileRecord) {
        self.files.insert(record.name.clone(), record);
    }

    fn delete_file(&mut self, name: &str) -> Option<FileRecord> {
        self.files.remove(name)
    }

    fn get_removed(&self, name: &str) -> Option<RemovedRecord> {
        self.removed.get(name).cloned()
    }

    fn insert_or_replace_removed(&mut self, record: RemovedRecord) {
        self.removed.insert(record.name.clone(), record);
    }

    fn delete_removed(&mut self, name: &str) -> Option<RemovedRecord> {
        self.removed.remove(name)
    }

    fn last_checked(&self) -> Option<i64> {
        self.last_checked
    }

    fn set_last_checked(&mut self, timestamp: i64) {
        self.last_checked = Some(timestamp);
    }
}
