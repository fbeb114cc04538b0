//! Correction assembler: stage incoming byte ranges per file, then commit them in one pass.

use std::collections::HashMap;
use std::io;

use crate::index::{FileRecord, MetadataIndex, Owner};
use crate::protocol::Block;
use crate::store::FileStore;

/// Raw bytes destined for `offset` of `file_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedDataChunk {
    pub file_name: String,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl StagedDataChunk {
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    /// Convert a correction block; blocks without data carry nothing to stage.
    pub fn from_block(block: Block) -> Option<Self> {
        let data = block.data?;
        Some(Self {
            file_name: block.file_name,
            offset: block.offset,
            data,
        })
    }
}

#[derive(Debug, Default)]
struct StagingArea {
    /// Length of the finished file, when known.
    target_size: Option<u64>,
    /// Sorted by offset. Overlaps are not checked.
    chunks: Vec<StagedDataChunk>,
}

/// Per-file staging of correction data.
#[derive(Debug, Default)]
pub struct CorrectionAssembler {
    staging: HashMap<String, StagingArea>,
}

impl CorrectionAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) staging for `file_name`, dropping anything staged before.
    pub fn begin(&mut self, file_name: &str, target_size: u64) {
        self.staging.insert(
            file_name.to_string(),
            StagingArea {
                target_size: Some(target_size),
                chunks: Vec::new(),
            },
        );
    }

    pub fn is_staging(&self, file_name: &str) -> bool {
        self.staging.contains_key(file_name)
    }

    pub fn target_size(&self, file_name: &str) -> Option<u64> {
        self.staging.get(file_name).and_then(|s| s.target_size)
    }

    /// Append chunks to their files' staging areas, keeping offset order. Chunks for
    /// files without a `begin` are dropped.
    pub fn stage(&mut self, chunks: Vec<StagedDataChunk>) {
        for chunk in chunks {
            let Some(area) = self.staging.get_mut(&chunk.file_name) else {
                tracing::debug!(file = chunk.file_name.as_str(), "chunk for unstaged file dropped");
                continue;
            };
            let at = area.chunks.partition_point(|c| c.offset <= chunk.offset);
            area.chunks.insert(at, chunk);
        }
    }

    /// Ranges of `[0, target_size)` not covered by any staged chunk, in offset order.
    pub fn data_spaces(&self, file_name: &str, target_size: u64) -> Vec<Block> {
        let mut out = Vec::new();
        let mut cursor = 0u64;
        let chunks = self
            .staging
            .get(file_name)
            .map(|s| s.chunks.as_slice())
            .unwrap_or(&[]);
        for chunk in chunks {
            if chunk.offset > cursor {
                push_space(&mut out, file_name, cursor, chunk.offset.min(target_size));
            }
            cursor = cursor.max(chunk.end());
            if cursor >= target_size {
                break;
            }
        }
        push_space(&mut out, file_name, cursor, target_size);
        out
    }

    /// Write every staged chunk into the real file, trim it to the target size, and refresh
    /// its index record. Staging for the file is cleared whether or not this succeeds.
    pub fn finalize<I: MetadataIndex + ?Sized>(
        &mut self,
        file_name: &str,
        store: &FileStore,
        index: &mut I,
    ) -> io::Result<FileRecord> {
        let area = self.staging.remove(file_name).unwrap_or_default();
        for chunk in &area.chunks {
            store.write_range(file_name, chunk.offset, &chunk.data)?;
        }
        if !store.exists(file_name) {
            store.write_range(file_name, 0, &[])?;
        }
        if let Some(size) = area.target_size {
            store.set_len(file_name, size)?;
        }
        let stat = store.stat(file_name)?;
        let record = FileRecord {
            name: file_name.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis().max(stat.modified),
            size: stat.size,
            strong_signature: store.strong_signature(file_name)?,
            owner: Owner::Remote,
        };
        index.insert_or_replace_file(record.clone());
        tracing::debug!(
            file = file_name,
            chunks = area.chunks.len(),
            size = record.size,
            "finalized"
        );
        Ok(record)
    }

    pub fn discard(&mut self, file_name: &str) {
        self.staging.remove(file_name);
    }
}

fn push_space(out: &mut Vec<Block>, file_name: &str, start: u64, end: u64) {
    let mut at = start;
    while at < end {
        let size = (end - at).min(u32::MAX as u64) as u32;
        out.push(Block {
            file_name: file_name.to_string(),
            offset: at,
            size,
            weak_signature: None,
            strong_signature: None,
            data: None,
        });
        at += size as u64;
    }
}
