//! SyncSystem: the per-file sync protocol. Takes decoded messages, returns replies.
//!
//! Exchange for one file, requester A and responder B:
//! - A sends `SyncRequest` with weak signatures of its blocks.
//! - B matches them against its copy. If A is newer, B asks for strong signatures of the
//!   matches and for A's bytes in the gaps, then verifies and commits. If B is newer (or
//!   equal), B ships its gap bytes as corrections and A commits.
//! - Missing copies fall back to whole-file transfer, tombstones answer "already removed".
//!
//! Every inbound request gets at least one reply; branches with nothing to say answer
//! `Received`. Errors are logged and never leave this module.

use std::collections::{HashMap, HashSet};
use std::io;

use tracing::{debug, info, warn};

use crate::assembler::{CorrectionAssembler, StagedDataChunk};
use crate::bus::MessageHandler;
use crate::index::{FileRecord, MemoryIndex, MetadataIndex, Owner, RemovedRecord};
use crate::matcher::{self, MAX_SPAN};
use crate::protocol::{
    Block, BlockPair, Corrections, FileInfo, ListOptions, Message, PartialMatch,
};
use crate::signature::{self, DEFAULT_BLOCK_SIZE};
use crate::store::{self, FileStore};
use crate::wire::{self, MAX_FRAME_LEN};

/// Files up to this size travel inline in a FileResponse.
pub const MAX_INLINE_FILE: u64 = 8 * 1024 * 1024;

/// Upper bound on payload bytes per Corrections batch.
pub const MAX_BATCH_BYTES: usize = 8 * 1024 * 1024;

/// Smallest message budget the engine accepts.
pub const MIN_MESSAGE_LEN: usize = 64 * 1024;

/// An exchange with no progress for this long no longer blocks a new one.
pub const SESSION_TIMEOUT_MS: i64 = 60_000;

/// Engine settings, passed in by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub block_size: u32,
    pub include_hidden: bool,
    /// Largest encoded message the engine emits. Deltas that would not fit fall back to
    /// batched whole-file transfer.
    pub max_message_len: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            include_hidden: false,
            max_message_len: MAX_FRAME_LEN as usize,
        }
    }
}

/// Where a file stands in its current exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    RequestIssued,
    PartialMatchComputed,
    SignaturesPending,
    CorrectionsPending,
    Synced,
    RemovedAcknowledged,
}

impl SyncState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncState::Synced | SyncState::RemovedAcknowledged)
    }
}

/// Per-file exchange state.
#[derive(Debug)]
struct Session {
    state: SyncState,
    /// Version being assembled locally, if any.
    target: Option<FileInfo>,
    /// Weak matches waiting for the requester's strong signatures.
    pending_matches: Vec<BlockPair>,
    /// Content arrives as whole-file corrections; gaps are re-requested before commit.
    whole_file: bool,
    updated: i64,
}

impl Session {
    fn new(state: SyncState) -> Self {
        Self {
            state,
            target: None,
            pending_matches: Vec::new(),
            whole_file: false,
            updated: now_millis(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of [`SyncSystem::rescan`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
}

/// Main coordinator. Host passes messages; core returns replies.
pub struct SyncSystem<I = MemoryIndex> {
    config: SyncConfig,
    index: I,
    store: FileStore,
    assembler: CorrectionAssembler,
    sessions: HashMap<String, Session>,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn check_name(name: &str) -> Result<(), SyncError> {
    if store::is_valid_name(name) {
        Ok(())
    } else {
        Err(SyncError::InvalidPath(name.to_string()))
    }
}

fn passes_filter(info: &FileInfo, options: &ListOptions) -> bool {
    (options.include_hidden || !store::is_hidden(&info.name))
        && options.changed_after.map_or(true, |w| info.timestamp > w)
}

/// File a message is about, for error cleanup.
fn subject(message: &Message) -> Option<String> {
    match message {
        Message::SyncRequest { file, .. } | Message::FileRequest { file } => {
            Some(file.name.clone())
        }
        Message::SyncResponse { requested_file, .. }
        | Message::FileResponse { requested_file, .. } => Some(requested_file.name.clone()),
        Message::SignatureAddendum { matched_file, .. } => Some(matched_file.name.clone()),
        Message::Corrections(c) => Some(c.file_name.clone()),
        Message::ShowFiles { .. } | Message::FileList { .. } | Message::Received => None,
    }
}

impl<I: MetadataIndex> SyncSystem<I> {
    pub fn new(index: I, store: FileStore, mut config: SyncConfig) -> Self {
        if config.block_size == 0 {
            warn!(default = DEFAULT_BLOCK_SIZE, "block size 0 replaced by default");
            config.block_size = DEFAULT_BLOCK_SIZE;
        }
        config.max_message_len = config
            .max_message_len
            .clamp(MIN_MESSAGE_LEN, MAX_FRAME_LEN as usize);
        Self {
            config,
            index,
            store,
            assembler: CorrectionAssembler::new(),
            sessions: HashMap::new(),
        }
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn fits(&self, message: &Message) -> bool {
        wire::encoded_len(message) <= self.config.max_message_len as u64
    }

    /// Data bytes per Corrections batch, leaving room for framing in the budget.
    fn batch_limit(&self) -> usize {
        MAX_BATCH_BYTES.min(self.config.max_message_len / 2)
    }

    /// Encoded size of a SignatureAddendum proving `count` matches of `file`.
    fn addendum_len(&self, file: &FileInfo, count: usize) -> u64 {
        let empty = Message::SignatureAddendum {
            matched_file: file.clone(),
            blocks: Vec::new(),
        };
        let block = Block {
            file_name: file.name.clone(),
            offset: 0,
            size: 0,
            weak_signature: None,
            strong_signature: Some("0".repeat(signature::STRONG_SIGNATURE_LEN * 2)),
            data: None,
        };
        wire::encoded_len(&empty)
            .saturating_add(wire::encoded_len(&block).saturating_mul(count as u64))
    }

    /// Current exchange state of `name`.
    pub fn state(&self, name: &str) -> SyncState {
        self.sessions
            .get(name)
            .map(|s| s.state)
            .unwrap_or(SyncState::Unsynced)
    }

    fn set_state(&mut self, name: &str, state: SyncState) {
        let session = self
            .sessions
            .entry(name.to_string())
            .or_insert_with(|| Session::new(state));
        session.state = state;
        session.updated = now_millis();
        if state.is_terminal() {
            session.target = None;
            session.pending_matches.clear();
            session.whole_file = false;
        }
    }

    fn in_flight(&self, name: &str) -> bool {
        self.sessions.get(name).is_some_and(|s| {
            !s.state.is_terminal()
                && s.state != SyncState::Unsynced
                && now_millis() - s.updated < SESSION_TIMEOUT_MS
        })
    }

    /// Bring the index in line with the filesystem: new paths get records, changed files
    /// get fresh signatures, vanished paths become tombstones.
    pub fn rescan(&mut self) -> Result<ScanReport, SyncError> {
        let names = self.store.list(true)?;
        let now = now_millis();
        let mut report = ScanReport::default();
        for name in &names {
            if self.assembler.is_staging(name) {
                continue;
            }
            match self.refresh_record(name) {
                Ok(Refresh::Added) => report.added += 1,
                Ok(Refresh::Changed) => report.changed += 1,
                Ok(Refresh::Unchanged) => {}
                Err(e) => warn!(file = name.as_str(), error = %e, "scan failed"),
            }
        }
        let present: HashSet<&str> = names.iter().map(String::as_str).collect();
        for record in self.index.get_files() {
            if present.contains(record.name.as_str()) || self.assembler.is_staging(&record.name) {
                continue;
            }
            self.index.delete_file(&record.name);
            self.index.insert_or_replace_removed(RemovedRecord {
                name: record.name.clone(),
                timestamp: now,
            });
            report.removed += 1;
        }
        if report != ScanReport::default() {
            info!(
                added = report.added,
                changed = report.changed,
                removed = report.removed,
                "index refreshed"
            );
        }
        Ok(report)
    }

    /// Re-stat one file and update its record if the disk copy moved on.
    fn refresh_record(&mut self, name: &str) -> Result<Refresh, SyncError> {
        let stat = self.store.stat(name)?;
        match self.index.get_file(name) {
            Some(rec) if rec.size == stat.size && stat.modified <= rec.timestamp => {
                Ok(Refresh::Unchanged)
            }
            Some(mut rec) => {
                let sig = self.store.strong_signature(name)?;
                let changed = sig != rec.strong_signature || stat.size != rec.size;
                if changed {
                    rec.strong_signature = sig;
                    rec.size = stat.size;
                    rec.owner = Owner::Local;
                }
                rec.timestamp = rec.timestamp.max(stat.modified);
                self.index.insert_or_replace_file(rec);
                Ok(if changed {
                    Refresh::Changed
                } else {
                    Refresh::Unchanged
                })
            }
            None => {
                let record = FileRecord {
                    name: name.to_string(),
                    timestamp: stat.modified,
                    size: stat.size,
                    strong_signature: self.store.strong_signature(name)?,
                    owner: Owner::Local,
                };
                self.index.insert_or_replace_file(record);
                self.index.delete_removed(name);
                Ok(Refresh::Added)
            }
        }
    }

    /// Listing request for the peer; moves the watermark to now.
    pub fn announce(&mut self) -> Message {
        let options = ListOptions {
            include_hidden: self.config.include_hidden,
            changed_after: self.index.last_checked(),
        };
        self.index.set_last_checked(now_millis());
        Message::ShowFiles { options }
    }

    /// Local files passing `options`, with the options echoed back.
    pub fn list(&self, options: ListOptions) -> Message {
        let files = self
            .index
            .get_files()
            .iter()
            .map(FileRecord::info)
            .filter(|info| passes_filter(info, &options))
            .collect();
        Message::FileList { files, options }
    }

    /// Outer join of the peer's listing with the local index.
    pub fn reconcile(
        &mut self,
        files: Vec<FileInfo>,
        options: ListOptions,
    ) -> Result<Vec<Message>, SyncError> {
        let mut out = Vec::new();
        let remote_names: HashSet<String> = files.iter().map(|f| f.name.clone()).collect();
        for remote in files {
            if let Err(e) = check_name(&remote.name) {
                warn!(error = %e, "listing entry skipped");
                continue;
            }
            if self.in_flight(&remote.name) {
                debug!(file = remote.name.as_str(), "exchange in flight, skipped");
                continue;
            }
            match self.reconcile_one(remote) {
                Ok(Some(msg)) => out.push(msg),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "reconcile failed"),
            }
        }
        for local in self.index.get_files() {
            if remote_names.contains(&local.name)
                || local.owner != Owner::Local
                || !passes_filter(&local.info(), &options)
                || self.in_flight(&local.name)
            {
                continue;
            }
            match self.start_sync(&local.name) {
                Ok(msg) => out.push(msg),
                Err(e) => warn!(file = local.name.as_str(), error = %e, "sync not started"),
            }
        }
        Ok(out)
    }

    fn reconcile_one(&mut self, remote: FileInfo) -> Result<Option<Message>, SyncError> {
        let name = remote.name.clone();
        if let Some(local) = self.index.get_file(&name) {
            if local.info().same_content(&remote) {
                self.set_state(&name, SyncState::Synced);
                return Ok(None);
            }
            return self.start_sync(&name).map(Some);
        }
        match self.index.get_removed(&name) {
            Some(tomb) if tomb.timestamp >= remote.timestamp => {
                debug!(file = name.as_str(), "peer copy predates removal");
                self.set_state(&name, SyncState::RemovedAcknowledged);
                Ok(Some(Message::SyncRequest {
                    file: FileInfo {
                        timestamp: tomb.timestamp,
                        ..remote
                    },
                    weak_signatures: Vec::new(),
                    removed: true,
                }))
            }
            tomb => {
                if tomb.is_some() {
                    self.index.delete_removed(&name);
                }
                info!(file = name.as_str(), "requesting file");
                self.set_state(&name, SyncState::RequestIssued);
                Ok(Some(Message::FileRequest { file: remote }))
            }
        }
    }

    /// SyncRequest for a locally known file.
    fn start_sync(&mut self, name: &str) -> Result<Message, SyncError> {
        self.refresh_record(name)?;
        let local = self
            .index
            .get_file(name)
            .ok_or_else(|| SyncError::NotFound(name.to_string()))?;
        let weak_signatures = self.store.weak_signatures(name, self.config.block_size)?;
        info!(file = name, blocks = weak_signatures.len(), "sync requested");
        self.set_state(name, SyncState::RequestIssued);
        let request = Message::SyncRequest {
            file: local.info(),
            weak_signatures,
            removed: false,
        };
        if self.fits(&request) {
            return Ok(request);
        }
        // No signatures: the peer sees one big gap and the file moves as corrections.
        debug!(file = name, "signature list over message budget, sent empty");
        Ok(Message::SyncRequest {
            file: local.info(),
            weak_signatures: Vec::new(),
            removed: false,
        })
    }

    /// Answer a peer's SyncRequest.
    pub fn respond_to_sync_request(
        &mut self,
        file: FileInfo,
        weak_signatures: Vec<u32>,
        removed: bool,
    ) -> Result<Vec<Message>, SyncError> {
        check_name(&file.name)?;
        let name = file.name.clone();
        if removed {
            self.apply_remote_removal(&file)?;
            return Ok(Vec::new());
        }
        if self.index.get_file(&name).is_some() && self.store.exists(&name) {
            self.refresh_record(&name)?;
        }

        let Some(local) = self.index.get_file(&name) else {
            if let Some(tomb) = self.index.get_removed(&name) {
                if tomb.timestamp >= file.timestamp {
                    self.set_state(&name, SyncState::RemovedAcknowledged);
                    return Ok(vec![sync_response(file, None, None, false, true)]);
                }
                self.index.delete_removed(&name);
            }
            info!(file = name.as_str(), "no local copy, asking for whole file");
            self.set_state(&name, SyncState::RequestIssued);
            return Ok(vec![sync_response(file, None, None, true, false)]);
        };

        if local.info().same_content(&file) {
            self.set_state(&name, SyncState::Synced);
            return Ok(Vec::new());
        }

        // Ties on timestamp fall back to the signature so exactly one side wins.
        let requester_newer = (file.timestamp, file.signature.as_str())
            > (local.timestamp, local.strong_signature.as_str());
        if !requester_newer
            && self.in_flight(&name)
            && self.state(&name) == SyncState::RequestIssued
        {
            // Both sides started; the peer answers our request and assembles our copy.
            debug!(file = name.as_str(), "crossed sync requests, deferring to ours");
            return Ok(Vec::new());
        }

        let matches = matcher::find_matching_blocks(
            &name,
            &weak_signatures,
            file.size,
            self.config.block_size,
            self.store.open(&name)?,
            local.size,
        )?;
        let gaps = matcher::get_block_pairs_between(&name, &matches, file.size, local.size);
        self.set_state(&name, SyncState::PartialMatchComputed);
        debug!(
            file = name.as_str(),
            matching = matches.len(),
            non_matching = gaps.len(),
            "partial match"
        );

        if requester_newer {
            // Requester is newer: assemble its version here.
            let wanted: Vec<BlockPair> = gaps.into_iter().filter(|g| g.size_client > 0).collect();
            let signature_requests = (!matches.is_empty()).then(|| matches.clone());
            let response = sync_response(
                file.clone(),
                Some(PartialMatch {
                    matched_file: file.clone(),
                    matches: Vec::new(),
                    signature_requests,
                    corrections: None,
                }),
                Some(wanted),
                false,
                false,
            );
            let budget = self.config.max_message_len as u64;
            if !self.fits(&response) || self.addendum_len(&file, matches.len()) > budget {
                info!(
                    file = name.as_str(),
                    matching = matches.len(),
                    "delta over message budget, asking for whole file"
                );
                self.assembler.discard(&name);
                self.set_state(&name, SyncState::RequestIssued);
                return Ok(vec![sync_response(file, None, None, true, false)]);
            }
            self.assembler.begin(&name, file.size);
            let state = if matches.is_empty() {
                SyncState::CorrectionsPending
            } else {
                SyncState::SignaturesPending
            };
            self.set_state(&name, state);
            if let Some(session) = self.sessions.get_mut(&name) {
                session.target = Some(file);
                session.pending_matches = matches;
            }
            return Ok(vec![response]);
        }

        // Local copy wins: ship the gap bytes in local coordinates.
        let ranges: Vec<(u64, u32, u64)> = gaps
            .iter()
            .map(|g| (g.offset_server, g.size_server, g.offset_server))
            .collect();
        let opening = Corrections {
            file_name: name.clone(),
            corrections: Vec::new(),
            is_final: false,
        };
        let mut response = sync_response(
            file.clone(),
            Some(PartialMatch {
                matched_file: local.info(),
                matches,
                signature_requests: None,
                corrections: Some(opening),
            }),
            None,
            false,
            false,
        );
        if !self.fits(&response) {
            info!(
                file = name.as_str(),
                "delta over message budget, sending whole file"
            );
            self.set_state(&name, SyncState::Synced);
            return self.deliver_file(file);
        }
        let mut batches = self.read_corrections(&name, &ranges, true)?;
        // Carry the first batch inline when both fit in one message.
        let skeleton_len = wire::encoded_len(&response);
        let first_len = batches.first().map_or(0, |b| wire::encoded_len(b));
        if skeleton_len.saturating_add(first_len) <= self.config.max_message_len as u64 {
            if let Message::SyncResponse {
                partial_match: Some(partial),
                ..
            } = &mut response
            {
                partial.corrections = Some(batches.remove(0));
            }
        }
        self.set_state(&name, SyncState::Synced);
        let mut out = vec![response];
        out.extend(batches.into_iter().map(Message::Corrections));
        Ok(out)
    }

    fn apply_remote_removal(&mut self, file: &FileInfo) -> Result<(), SyncError> {
        let name = file.name.as_str();
        if let Some(local) = self.index.get_file(name) {
            if local.timestamp > file.timestamp {
                info!(file = name, "local copy newer than removal, kept");
                return Ok(());
            }
            self.store.remove(name)?;
            self.index.delete_file(name);
            info!(file = name, "removed at peer's request");
        }
        let newer = self
            .index
            .get_removed(name)
            .map_or(true, |t| t.timestamp < file.timestamp);
        if newer {
            self.index.insert_or_replace_removed(RemovedRecord {
                name: name.to_string(),
                timestamp: file.timestamp,
            });
        }
        self.assembler.discard(name);
        self.set_state(name, SyncState::RemovedAcknowledged);
        Ok(())
    }

    /// Continue an exchange this side started.
    pub fn handle_sync_response(
        &mut self,
        requested_file: FileInfo,
        partial_match: Option<PartialMatch>,
        correction_request: Option<Vec<BlockPair>>,
        requesting_file: bool,
        removed: bool,
    ) -> Result<Vec<Message>, SyncError> {
        check_name(&requested_file.name)?;
        let name = requested_file.name.clone();
        if removed {
            info!(file = name.as_str(), "peer reports file removed");
            self.store.remove(&name)?;
            self.index.delete_file(&name);
            self.index.insert_or_replace_removed(RemovedRecord {
                name: name.clone(),
                timestamp: now_millis(),
            });
            self.assembler.discard(&name);
            self.set_state(&name, SyncState::RemovedAcknowledged);
            return Ok(Vec::new());
        }
        if requesting_file {
            return self.deliver_file(requested_file);
        }

        let mut out = Vec::new();
        if let Some(partial) = partial_match {
            if let Some(corrections) = partial.corrections {
                // Peer's copy wins: relocate our matching bytes, then take its corrections.
                self.assembler.begin(&name, partial.matched_file.size);
                let mut relocated = Vec::new();
                for m in partial
                    .matches
                    .iter()
                    .filter(|m| m.offset_client != m.offset_server)
                {
                    relocated.push(StagedDataChunk {
                        file_name: name.clone(),
                        offset: m.offset_server,
                        data: self.store.read_range(&name, m.offset_client, m.size_client)?,
                    });
                }
                self.assembler.stage(relocated);
                self.set_state(&name, SyncState::CorrectionsPending);
                if let Some(session) = self.sessions.get_mut(&name) {
                    session.target = Some(partial.matched_file);
                }
                return self.apply_corrections(corrections);
            }
            if let Some(requests) = partial.signature_requests {
                // Our copy wins: prove the matches, send the gaps, let the peer commit.
                if self.index.get_file(&name).is_none() {
                    return Err(SyncError::NotFound(name));
                }
                let mut blocks = Vec::with_capacity(requests.len());
                for pair in &requests {
                    let bytes =
                        self.store
                            .read_range(&name, pair.offset_client, pair.size_client)?;
                    blocks.push(Block {
                        file_name: name.clone(),
                        offset: pair.offset_client,
                        size: pair.size_client,
                        weak_signature: None,
                        strong_signature: Some(signature::strong_signature(&bytes)),
                        data: None,
                    });
                }
                let ranges = client_ranges(correction_request.as_deref().unwrap_or(&[]));
                let batches = self.read_corrections(&name, &ranges, false)?;
                out.extend(batches.into_iter().map(Message::Corrections));
                out.push(Message::SignatureAddendum {
                    matched_file: partial.matched_file,
                    blocks,
                });
                self.set_state(&name, SyncState::Synced);
                return Ok(out);
            }
        }

        if let Some(request) = correction_request {
            if self.index.get_file(&name).is_none() {
                return Err(SyncError::NotFound(name));
            }
            let batches = self.read_corrections(&name, &client_ranges(&request), true)?;
            out.extend(batches.into_iter().map(Message::Corrections));
            self.set_state(&name, SyncState::Synced);
        }
        Ok(out)
    }

    /// Check the requester's strong signatures against the local bytes of each weak match.
    /// Confirmed matches are staged from the local copy; the rest are requested as data.
    pub fn verify_signature_addendum(
        &mut self,
        matched_file: FileInfo,
        blocks: Vec<Block>,
    ) -> Result<Vec<Message>, SyncError> {
        check_name(&matched_file.name)?;
        let name = matched_file.name.clone();
        let pending = match self.sessions.get_mut(&name) {
            Some(s)
                if s.state == SyncState::SignaturesPending
                    && s.target.as_ref() == Some(&matched_file) =>
            {
                std::mem::take(&mut s.pending_matches)
            }
            _ => {
                debug!(file = name.as_str(), "stale signature addendum ignored");
                return Ok(Vec::new());
            }
        };
        let claimed: HashMap<u64, String> = blocks
            .into_iter()
            .filter_map(|b| b.strong_signature.map(|s| (b.offset, s)))
            .collect();

        let mut confirmed = Vec::new();
        let mut mismatched = Vec::new();
        for pair in pending {
            let local = self.store.read_range(&name, pair.offset_server, pair.size_server)?;
            if claimed.get(&pair.offset_client) == Some(&signature::strong_signature(&local)) {
                if pair.offset_client != pair.offset_server {
                    confirmed.push(StagedDataChunk {
                        file_name: name.clone(),
                        offset: pair.offset_client,
                        data: local,
                    });
                }
            } else {
                mismatched.push(pair);
            }
        }
        self.assembler.stage(confirmed);

        if mismatched.is_empty() {
            return self.finalize(&name);
        }
        info!(
            file = name.as_str(),
            collisions = mismatched.len(),
            "weak matches rejected, requesting data"
        );
        self.set_state(&name, SyncState::CorrectionsPending);
        Ok(vec![sync_response(
            matched_file,
            None,
            Some(mismatched),
            false,
            false,
        )])
    }

    /// Stage a batch of correction data; commit the file on the final batch.
    pub fn apply_corrections(
        &mut self,
        corrections: Corrections,
    ) -> Result<Vec<Message>, SyncError> {
        check_name(&corrections.file_name)?;
        let name = corrections.file_name;
        let state = self.state(&name);
        let live = self.assembler.is_staging(&name)
            && matches!(
                state,
                SyncState::CorrectionsPending | SyncState::SignaturesPending
            );
        if !live {
            debug!(
                file = name.as_str(),
                ?state,
                "corrections outside a live exchange ignored"
            );
            return Ok(Vec::new());
        }
        let chunks: Vec<StagedDataChunk> = corrections
            .corrections
            .into_iter()
            .filter(|b| b.file_name == name)
            .filter_map(StagedDataChunk::from_block)
            .collect();
        self.assembler.stage(chunks);
        if !corrections.is_final {
            return Ok(Vec::new());
        }
        if state == SyncState::SignaturesPending {
            // Commit waits for the addendum.
            return Ok(Vec::new());
        }
        self.finalize(&name)
    }

    fn finalize(&mut self, name: &str) -> Result<Vec<Message>, SyncError> {
        let (target, whole_file) = self
            .sessions
            .get(name)
            .map(|s| (s.target.clone(), s.whole_file))
            .unwrap_or((None, false));

        if let (true, Some(target)) = (whole_file, target.as_ref()) {
            let spaces = self.assembler.data_spaces(name, target.size);
            if !spaces.is_empty() {
                warn!(
                    file = name,
                    missing = spaces.len(),
                    "gaps in received data, re-requesting"
                );
                let request = spaces
                    .iter()
                    .map(|b| BlockPair {
                        file_name: name.to_string(),
                        offset_client: b.offset,
                        offset_server: b.offset,
                        size_client: b.size,
                        size_server: b.size,
                    })
                    .collect();
                return Ok(vec![sync_response(
                    target.clone(),
                    None,
                    Some(request),
                    false,
                    false,
                )]);
            }
        }

        let record = self.assembler.finalize(name, &self.store, &mut self.index)?;
        self.index.delete_removed(name);
        if let Some(target) = target {
            if record.strong_signature != target.signature {
                warn!(file = name, "assembled content does not match, requesting whole file");
                self.set_state(name, SyncState::RequestIssued);
                return Ok(vec![Message::FileRequest { file: target }]);
            }
        }
        info!(file = name, size = record.size, "file synced");
        self.set_state(name, SyncState::Synced);
        Ok(Vec::new())
    }

    /// Whole-file transfer, sender side.
    pub fn deliver_file(&mut self, file: FileInfo) -> Result<Vec<Message>, SyncError> {
        check_name(&file.name)?;
        let name = file.name.clone();
        if self.index.get_file(&name).is_none() || !self.store.exists(&name) {
            return Ok(vec![Message::FileResponse {
                requested_file: file,
                data: None,
                unknown: true,
            }]);
        }
        self.refresh_record(&name)?;
        let local = self
            .index
            .get_file(&name)
            .ok_or_else(|| SyncError::NotFound(name.clone()))?;
        debug!(file = name.as_str(), size = local.size, "delivering file");
        if local.size <= MAX_INLINE_FILE.min(self.batch_limit() as u64) {
            let data = self.store.read_all(&name)?;
            return Ok(vec![Message::FileResponse {
                requested_file: local.info(),
                data: Some(data),
                unknown: false,
            }]);
        }
        let mut ranges = Vec::new();
        let mut at = 0u64;
        while at < local.size {
            let size = (local.size - at).min(MAX_SPAN as u64) as u32;
            ranges.push((at, size, at));
            at += size as u64;
        }
        let mut out = vec![Message::FileResponse {
            requested_file: local.info(),
            data: None,
            unknown: false,
        }];
        out.extend(
            self.read_corrections(&name, &ranges, true)?
                .into_iter()
                .map(Message::Corrections),
        );
        Ok(out)
    }

    /// Whole-file transfer, receiver side.
    pub fn receive_file(
        &mut self,
        requested_file: FileInfo,
        data: Option<Vec<u8>>,
        unknown: bool,
    ) -> Result<Vec<Message>, SyncError> {
        check_name(&requested_file.name)?;
        let name = requested_file.name.clone();
        if unknown {
            info!(file = name.as_str(), "peer no longer has the file");
            self.sessions.remove(&name);
            return Ok(Vec::new());
        }
        match data {
            Some(bytes) => {
                self.assembler.discard(&name);
                self.store.write_all(&name, &bytes)?;
                let stat = self.store.stat(&name)?;
                self.index.insert_or_replace_file(FileRecord {
                    name: name.clone(),
                    timestamp: now_millis().max(stat.modified),
                    size: stat.size,
                    strong_signature: signature::strong_signature(&bytes),
                    owner: Owner::Remote,
                });
                self.index.delete_removed(&name);
                info!(file = name.as_str(), size = stat.size, "file received");
                self.set_state(&name, SyncState::Synced);
            }
            None => {
                self.assembler.begin(&name, requested_file.size);
                self.set_state(&name, SyncState::CorrectionsPending);
                if let Some(session) = self.sessions.get_mut(&name) {
                    session.target = Some(requested_file);
                    session.whole_file = true;
                }
            }
        }
        Ok(Vec::new())
    }

    /// Read local ranges `(read_offset, size, target_offset)` into Corrections batches. With
    /// `finish`, the last batch is final (an empty final batch if there is nothing to send).
    fn read_corrections(
        &self,
        name: &str,
        ranges: &[(u64, u32, u64)],
        finish: bool,
    ) -> Result<Vec<Corrections>, SyncError> {
        let limit = self.batch_limit();
        // Per-block framing, so batches of many small gaps stay in budget too.
        let overhead = wire::encoded_len(&Block::with_data(name, 0, Vec::new())) as usize;
        let mut batches = Vec::new();
        let mut current = Vec::new();
        let mut bytes = 0usize;
        for &(read_at, size, target) in ranges {
            let mut done = 0u32;
            while done < size {
                let piece = (size - done).min((limit - overhead) as u32);
                let data = self.store.read_range(name, read_at + done as u64, piece)?;
                if data.len() != piece as usize {
                    return Err(SyncError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{name} changed during exchange"),
                    )));
                }
                let cost = overhead + data.len();
                if bytes + cost > limit && !current.is_empty() {
                    batches.push(Corrections {
                        file_name: name.to_string(),
                        corrections: std::mem::take(&mut current),
                        is_final: false,
                    });
                    bytes = 0;
                }
                bytes += cost;
                current.push(Block::with_data(name, target + done as u64, data));
                done += piece;
            }
        }
        if !current.is_empty() || (finish && batches.is_empty()) {
            batches.push(Corrections {
                file_name: name.to_string(),
                corrections: current,
                is_final: false,
            });
        }
        if finish {
            if let Some(last) = batches.last_mut() {
                last.is_final = true;
            }
        }
        Ok(batches)
    }

    /// Dispatch one inbound message. Never fails: errors are logged and answered with
    /// `Received`.
    pub fn handle(&mut self, message: Message) -> Vec<Message> {
        let kind = message.kind();
        let is_ack = matches!(message, Message::Received);
        let file = subject(&message);
        let result = match message {
            Message::ShowFiles { options } => Ok(vec![self.list(options)]),
            Message::FileList { files, options } => self.reconcile(files, options),
            Message::SyncRequest {
                file,
                weak_signatures,
                removed,
            } => self.respond_to_sync_request(file, weak_signatures, removed),
            Message::SyncResponse {
                requested_file,
                partial_match,
                correction_request,
                requesting_file,
                removed,
            } => self.handle_sync_response(
                requested_file,
                partial_match,
                correction_request,
                requesting_file,
                removed,
            ),
            Message::SignatureAddendum {
                matched_file,
                blocks,
            } => self.verify_signature_addendum(matched_file, blocks),
            Message::Corrections(corrections) => self.apply_corrections(corrections),
            Message::FileRequest { file } => self.deliver_file(file),
            Message::FileResponse {
                requested_file,
                data,
                unknown,
            } => self.receive_file(requested_file, data, unknown),
            Message::Received => Ok(Vec::new()),
        };
        match result {
            Ok(replies) if replies.is_empty() && !is_ack => vec![Message::Received],
            Ok(replies) => replies,
            Err(SyncError::NotFound(name)) => {
                debug!(kind, file = name.as_str(), "record not found");
                vec![Message::Received]
            }
            Err(e) => {
                warn!(kind, error = %e, "exchange abandoned");
                if let Some(name) = file {
                    self.assembler.discard(&name);
                    self.sessions.remove(&name);
                }
                vec![Message::Received]
            }
        }
    }
}

impl<I: MetadataIndex> MessageHandler for SyncSystem<I> {
    fn handle_message(&mut self, message: Message) -> Vec<Message> {
        self.handle(message)
    }

    fn on_announce(&mut self) -> Vec<Message> {
        if let Err(e) = self.rescan() {
            warn!(error = %e, "rescan failed");
        }
        vec![self.announce()]
    }
}

enum Refresh {
    Added,
    Changed,
    Unchanged,
}

fn sync_response(
    requested_file: FileInfo,
    partial_match: Option<PartialMatch>,
    correction_request: Option<Vec<BlockPair>>,
    requesting_file: bool,
    removed: bool,
) -> Message {
    Message::SyncResponse {
        requested_file,
        partial_match,
        correction_request,
        requesting_file,
        removed,
    }
}

/// Requested pairs as `(read_offset, size, target_offset)` on the client axis.
fn client_ranges(pairs: &[BlockPair]) -> Vec<(u64, u32, u64)> {
    pairs
        .iter()
        .map(|p| (p.offset_client, p.size_client, p.offset_client))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use std::collections::VecDeque;
    use tempfile::TempDir;

    fn system() -> (TempDir, SyncSystem) {
        system_with(SyncConfig::default())
    }

    fn system_with(config: SyncConfig) -> (TempDir, SyncSystem) {
        let dir = tempfile::tempdir().unwrap();
        let sys = SyncSystem::new(MemoryIndex::new(), FileStore::new(dir.path()), config);
        (dir, sys)
    }

    /// Small blocks and the smallest message budget, so modest files produce oversized deltas.
    fn tight() -> SyncConfig {
        SyncConfig {
            block_size: 64,
            max_message_len: MIN_MESSAGE_LEN,
            ..SyncConfig::default()
        }
    }

    fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen()).collect()
    }

    fn put(sys: &mut SyncSystem, name: &str, data: &[u8], timestamp: i64) {
        sys.store.write_all(name, data).unwrap();
        sys.index.insert_or_replace_file(FileRecord {
            name: name.into(),
            timestamp,
            size: data.len() as u64,
            strong_signature: signature::strong_signature(data),
            owner: Owner::Local,
        });
    }

    /// Timestamp safely past every file's mtime, so rescans keep it.
    fn later(offset: i64) -> i64 {
        now_millis() + 3_600_000 + offset
    }

    fn info(name: &str, timestamp: i64, data: &[u8]) -> FileInfo {
        FileInfo {
            name: name.into(),
            timestamp,
            size: data.len() as u64,
            signature: signature::strong_signature(data),
        }
    }

    /// Deliver messages back and forth until both sides go quiet.
    fn pump(a: &mut SyncSystem, b: &mut SyncSystem, to_b: Vec<Message>) -> Vec<&'static str> {
        pump_within(a, b, to_b, MAX_FRAME_LEN as usize)
    }

    /// Like `pump`, failing on any message whose encoding exceeds `limit`.
    fn pump_within(
        a: &mut SyncSystem,
        b: &mut SyncSystem,
        to_b: Vec<Message>,
        limit: usize,
    ) -> Vec<&'static str> {
        let mut queue: VecDeque<(bool, Message)> = to_b.into_iter().map(|m| (true, m)).collect();
        let mut seen = Vec::new();
        while let Some((for_b, msg)) = queue.pop_front() {
            let len = wire::encoded_len(&msg);
            assert!(len <= limit as u64, "{} of {len} bytes over {limit}", msg.kind());
            assert!(wire::encode_frame(&msg).is_ok());
            seen.push(msg.kind());
            assert!(seen.len() < 10_000, "exchange did not settle");
            let replies = if for_b { b.handle(msg) } else { a.handle(msg) };
            queue.extend(replies.into_iter().map(|r| (!for_b, r)));
        }
        seen
    }

    #[test]
    fn report_example_second_block_differs() {
        let (_d, mut server) = system();
        let local: Vec<u8> = random_bytes(1, 12_000);
        put(&mut server, "report.txt", &local, later(0));
        let mut remote = local.clone();
        remote[6_000..].copy_from_slice(&random_bytes(2, 6_000));
        let weak = signature::block_signatures(&remote[..], DEFAULT_BLOCK_SIZE).unwrap();

        let replies = server
            .respond_to_sync_request(info("report.txt", later(1_000), &remote), weak, false)
            .unwrap();
        assert_eq!(replies.len(), 1);
        let Message::SyncResponse {
            partial_match: Some(partial),
            correction_request: Some(gaps),
            ..
        } = &replies[0]
        else {
            panic!("unexpected reply {:?}", replies[0].kind());
        };
        let pair = |oc, os, size| BlockPair {
            file_name: "report.txt".into(),
            offset_client: oc,
            offset_server: os,
            size_client: size,
            size_server: size,
        };
        assert!(partial.matches.is_empty());
        assert_eq!(partial.signature_requests, Some(vec![pair(0, 0, 6_000)]));
        assert_eq!(gaps, &vec![pair(6_000, 6_000, 6_000)]);
        assert_eq!(server.state("report.txt"), SyncState::SignaturesPending);
    }

    #[test]
    fn identical_request_is_acknowledged() {
        let (_d, mut sys) = system();
        let data = random_bytes(3, 9_000);
        put(&mut sys, "same.bin", &data, 500);
        let weak = signature::block_signatures(&data[..], DEFAULT_BLOCK_SIZE).unwrap();
        let request = Message::SyncRequest {
            file: info("same.bin", 500, &data),
            weak_signatures: weak,
            removed: false,
        };
        assert_eq!(sys.handle(request.clone()), vec![Message::Received]);
        assert_eq!(sys.handle(request), vec![Message::Received]);
        assert_eq!(sys.state("same.bin"), SyncState::Synced);
    }

    #[test]
    fn older_remote_copy_of_removed_file_is_refused() {
        let (_d, mut sys) = system();
        sys.index.insert_or_replace_removed(RemovedRecord {
            name: "gone.txt".into(),
            timestamp: 100,
        });
        let out = sys
            .reconcile(vec![info("gone.txt", 50, b"old")], ListOptions::default())
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Message::SyncRequest { removed: true, file, .. } if file.timestamp == 100));
        assert!(sys.index.get_removed("gone.txt").is_some());
    }

    #[test]
    fn newer_remote_copy_of_removed_file_is_requested() {
        let (_d, mut sys) = system();
        sys.index.insert_or_replace_removed(RemovedRecord {
            name: "gone.txt".into(),
            timestamp: 100,
        });
        let out = sys
            .reconcile(vec![info("gone.txt", 150, b"new")], ListOptions::default())
            .unwrap();
        assert!(matches!(&out[..], [Message::FileRequest { file }] if file.name == "gone.txt"));
        assert!(sys.index.get_removed("gone.txt").is_none());
        assert_eq!(sys.state("gone.txt"), SyncState::RequestIssued);
    }

    #[test]
    fn removal_request_deletes_older_local_copy() {
        let (_d, mut sys) = system();
        put(&mut sys, "a.txt", b"hello", 100);
        let reply = sys.handle(Message::SyncRequest {
            file: info("a.txt", 200, b""),
            weak_signatures: Vec::new(),
            removed: true,
        });
        assert_eq!(reply, vec![Message::Received]);
        assert!(!sys.store.exists("a.txt"));
        assert!(sys.index.get_file("a.txt").is_none());
        assert_eq!(sys.index.get_removed("a.txt").unwrap().timestamp, 200);
        assert_eq!(sys.state("a.txt"), SyncState::RemovedAcknowledged);
    }

    #[test]
    fn list_applies_watermark_and_hidden_policy() {
        let (_d, mut sys) = system();
        put(&mut sys, "old.txt", b"1", 100);
        put(&mut sys, "new.txt", b"2", 200);
        put(&mut sys, ".cache/x", b"3", 300);
        let names = |msg: Message| match msg {
            Message::FileList { files, .. } => {
                files.into_iter().map(|f| f.name).collect::<Vec<_>>()
            }
            other => panic!("unexpected {}", other.kind()),
        };
        let visible = ListOptions {
            include_hidden: false,
            changed_after: Some(150),
        };
        assert_eq!(names(sys.list(visible)), vec!["new.txt"]);
        let all = ListOptions {
            include_hidden: true,
            changed_after: None,
        };
        assert_eq!(names(sys.list(all)), vec![".cache/x", "new.txt", "old.txt"]);
    }

    #[test]
    fn announce_advances_watermark() {
        let (_d, mut sys) = system();
        let Message::ShowFiles { options } = sys.announce() else {
            panic!("expected ShowFiles");
        };
        assert_eq!(options.changed_after, None);
        let Message::ShowFiles { options } = sys.announce() else {
            panic!("expected ShowFiles");
        };
        assert!(options.changed_after.is_some());
    }

    #[test]
    fn rescan_tracks_additions_changes_and_removals() {
        let (dir, mut sys) = system();
        std::fs::write(dir.path().join("a.txt"), b"one").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"two").unwrap();
        let report = sys.rescan().unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(sys.index.get_file("sub/b.txt").unwrap().owner, Owner::Local);

        std::fs::remove_file(dir.path().join("a.txt")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"two, longer").unwrap();
        let report = sys.rescan().unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.changed, 1);
        assert!(sys.index.get_removed("a.txt").is_some());
        assert_eq!(sys.index.get_file("sub/b.txt").unwrap().size, 11);
        assert_eq!(sys.rescan().unwrap(), ScanReport::default());
    }

    #[test]
    fn newer_requester_pushes_its_version() {
        let (_da, mut a) = system();
        let (_db, mut b) = system();
        let base = random_bytes(4, 40_000);
        let mut edited = base[..3_000].to_vec();
        edited.extend_from_slice(&random_bytes(5, 123));
        edited.extend_from_slice(&base[3_000..30_000]);
        put(&mut a, "doc.bin", &edited, later(2_000));
        put(&mut b, "doc.bin", &base, later(1_000));

        let request = a.start_sync("doc.bin").unwrap();
        let kinds = pump(&mut a, &mut b, vec![request]);
        assert!(kinds.contains(&"SignatureAddendum"));
        assert_eq!(b.store.read_all("doc.bin").unwrap(), edited);
        let record = b.index.get_file("doc.bin").unwrap();
        assert_eq!(record.strong_signature, signature::strong_signature(&edited));
        assert_eq!(record.owner, Owner::Remote);
        assert_eq!(b.state("doc.bin"), SyncState::Synced);
    }

    #[test]
    fn older_requester_pulls_corrections() {
        let (_da, mut a) = system();
        let (_db, mut b) = system();
        let newest = random_bytes(6, 25_000);
        let mut stale = random_bytes(7, 500);
        stale.extend_from_slice(&newest[..18_000]);
        put(&mut a, "doc.bin", &newest, later(2_000));
        put(&mut b, "doc.bin", &stale, later(1_000));

        let request = b.start_sync("doc.bin").unwrap();
        let kinds = pump(&mut b, &mut a, vec![request]);
        assert!(!kinds.contains(&"SignatureAddendum"));
        assert_eq!(b.store.read_all("doc.bin").unwrap(), newest);
        assert_eq!(b.state("doc.bin"), SyncState::Synced);
    }

    #[test]
    fn crossed_requests_converge_on_newer_copy() {
        let (_da, mut a) = system();
        let (_db, mut b) = system();
        let newest = random_bytes(8, 14_000);
        let mut older = newest.clone();
        older[7_000..7_010].fill(0);
        put(&mut a, "x.bin", &newest, later(2_000));
        put(&mut b, "x.bin", &older, later(1_000));

        let from_a = a.start_sync("x.bin").unwrap();
        let from_b = b.start_sync("x.bin").unwrap();
        assert_eq!(a.handle(from_b), vec![Message::Received]);
        pump(&mut a, &mut b, vec![from_a]);
        assert_eq!(b.store.read_all("x.bin").unwrap(), newest);
        assert_eq!(a.store.read_all("x.bin").unwrap(), newest);
    }

    #[test]
    fn forged_strong_signatures_are_requested_as_data() {
        let (_d, mut sys) = system();
        let local = random_bytes(9, 12_000);
        put(&mut sys, "f.bin", &local, later(0));
        let weak = signature::block_signatures(&local[..], DEFAULT_BLOCK_SIZE).unwrap();
        let claimed = info("f.bin", later(1_000), &random_bytes(10, 12_000));
        sys.respond_to_sync_request(claimed.clone(), weak, false).unwrap();

        let blocks = [0u64, 6_000]
            .iter()
            .map(|&offset| Block {
                file_name: "f.bin".into(),
                offset,
                size: 6_000,
                weak_signature: None,
                strong_signature: Some("00".repeat(16)),
                data: None,
            })
            .collect();
        let replies = sys.verify_signature_addendum(claimed, blocks).unwrap();
        let Message::SyncResponse {
            correction_request: Some(request),
            ..
        } = &replies[0]
        else {
            panic!("expected a correction request");
        };
        assert_eq!(request.len(), 2);
        assert_eq!(sys.state("f.bin"), SyncState::CorrectionsPending);
    }

    #[test]
    fn missing_file_travels_whole() {
        let (_da, mut a) = system();
        let (_db, mut b) = system();
        let small = random_bytes(11, 1_000);
        put(&mut a, "dir/small.bin", &small, 1_000);
        let big = random_bytes(12, MAX_INLINE_FILE as usize + 300_000);
        put(&mut a, "big.bin", &big, 1_000);

        let show = b.announce();
        pump(&mut b, &mut a, vec![show]);
        assert_eq!(b.store.read_all("dir/small.bin").unwrap(), small);
        assert_eq!(b.store.read_all("big.bin").unwrap(), big);
        assert_eq!(b.index.get_file("big.bin").unwrap().owner, Owner::Remote);
        assert_eq!(b.state("big.bin"), SyncState::Synced);
    }

    #[test]
    fn unknown_file_request_is_answered() {
        let (_d, mut sys) = system();
        let replies = sys.handle(Message::FileRequest {
            file: info("nope", 1, b""),
        });
        assert!(matches!(&replies[..], [Message::FileResponse { unknown: true, .. }]));
    }

    #[test]
    fn traversal_names_are_rejected() {
        let (_d, mut sys) = system();
        let replies = sys.handle(Message::FileResponse {
            requested_file: info("../escape", 1, b"x"),
            data: Some(b"x".to_vec()),
            unknown: false,
        });
        assert_eq!(replies, vec![Message::Received]);
        let out = sys
            .reconcile(vec![info("/etc/passwd", 1, b"x")], ListOptions::default())
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn stray_final_corrections_are_ignored() {
        let (_d, mut sys) = system();
        let data = random_bytes(13, 20);
        put(&mut sys, "f.txt", &data, later(0));
        let before = sys.index.get_file("f.txt").unwrap();

        let replies = sys.handle(Message::Corrections(Corrections {
            file_name: "f.txt".into(),
            corrections: vec![Block::with_data("f.txt", 100, b"XYZ".to_vec())],
            is_final: true,
        }));
        assert_eq!(replies, vec![Message::Received]);
        assert_eq!(sys.store.read_all("f.txt").unwrap(), data);
        assert_eq!(sys.index.get_file("f.txt").unwrap(), before);
        assert_eq!(sys.state("f.txt"), SyncState::Unsynced);
    }

    #[test]
    fn leftover_batches_after_abandoned_pull_are_ignored() {
        let config = SyncConfig {
            max_message_len: MIN_MESSAGE_LEN,
            ..SyncConfig::default()
        };
        let (_da, mut a) = system_with(config);
        let (_db, mut b) = system_with(config);
        let newest = random_bytes(14, 300_000);
        let mut stale = random_bytes(15, 500);
        stale.extend_from_slice(&newest[..150_000]);
        put(&mut a, "doc.bin", &newest, later(2_000));
        put(&mut b, "doc.bin", &stale, later(1_000));

        let request = b.start_sync("doc.bin").unwrap();
        let before = b.index.get_file("doc.bin").unwrap();
        let replies = a.handle(request);
        assert!(replies.len() > 2, "expected several batches");
        assert!(matches!(replies[0], Message::SyncResponse { .. }));

        // The relocation read fails, abandoning the exchange before any batch lands.
        b.store.remove("doc.bin").unwrap();
        for reply in replies {
            assert_eq!(b.handle(reply), vec![Message::Received]);
        }
        assert!(!b.store.exists("doc.bin"));
        assert_eq!(b.index.get_file("doc.bin").unwrap(), before);
        assert_eq!(b.state("doc.bin"), SyncState::Unsynced);
    }

    #[test]
    fn zero_block_size_falls_back_to_default() {
        let (_d, mut sys) = system_with(SyncConfig {
            block_size: 0,
            max_message_len: 10,
            ..SyncConfig::default()
        });
        assert_eq!(sys.config().block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(sys.config().max_message_len, MIN_MESSAGE_LEN);

        let local = random_bytes(16, 9_000);
        put(&mut sys, "z.bin", &local, later(0));
        let weak = signature::block_signatures(&local[..], DEFAULT_BLOCK_SIZE).unwrap();
        let remote = info("z.bin", later(1_000), &random_bytes(17, 9_000));
        let replies = sys.respond_to_sync_request(remote, weak, false).unwrap();
        assert!(matches!(&replies[..], [Message::SyncResponse { .. }]));

        let (_d, big) = system_with(SyncConfig {
            max_message_len: usize::MAX,
            ..SyncConfig::default()
        });
        assert_eq!(big.config().max_message_len, MAX_FRAME_LEN as usize);
    }

    #[test]
    fn oversized_push_falls_back_to_whole_file() {
        let (_da, mut a) = system_with(tight());
        let (_db, mut b) = system_with(tight());
        let base = random_bytes(18, 400_000);
        let mut edited = base.clone();
        edited[200_000] ^= 0xff;
        put(&mut a, "doc.bin", &edited, later(2_000));
        put(&mut b, "doc.bin", &base, later(1_000));

        let request = a.start_sync("doc.bin").unwrap();
        let kinds = pump_within(&mut a, &mut b, vec![request], MIN_MESSAGE_LEN);
        assert!(kinds.contains(&"FileResponse"));
        assert!(!kinds.contains(&"SignatureAddendum"));
        assert_eq!(b.store.read_all("doc.bin").unwrap(), edited);
        assert_eq!(b.state("doc.bin"), SyncState::Synced);
    }

    #[test]
    fn oversized_pull_falls_back_to_whole_file() {
        let (_da, mut a) = system_with(tight());
        let (_db, mut b) = system_with(tight());
        let newest = random_bytes(19, 400_000);
        let mut stale = newest.clone();
        stale[100] ^= 0xff;
        put(&mut a, "doc.bin", &newest, later(2_000));
        put(&mut b, "doc.bin", &stale, later(1_000));

        let request = b.start_sync("doc.bin").unwrap();
        let kinds = pump_within(&mut b, &mut a, vec![request], MIN_MESSAGE_LEN);
        assert!(kinds.contains(&"FileResponse"));
        assert_eq!(b.store.read_all("doc.bin").unwrap(), newest);
        assert_eq!(b.state("doc.bin"), SyncState::Synced);
    }

    #[test]
    fn oversized_signature_list_is_sent_empty() {
        let (_da, mut a) = system_with(tight());
        let (_db, mut b) = system_with(tight());
        let newest = random_bytes(20, 2_000_000);
        let mut stale = newest.clone();
        stale[1_000_000..1_000_100].fill(0);
        put(&mut a, "big.bin", &newest, later(2_000));
        put(&mut b, "big.bin", &stale, later(1_000));

        let request = b.start_sync("big.bin").unwrap();
        let Message::SyncRequest { weak_signatures, .. } = &request else {
            panic!("expected a sync request");
        };
        assert!(weak_signatures.is_empty());
        pump_within(&mut b, &mut a, vec![request], MIN_MESSAGE_LEN);
        assert_eq!(b.store.read_all("big.bin").unwrap(), newest);
    }

    #[test]
    fn lost_batch_is_requested_again_before_commit() {
        let (_da, mut a) = system_with(tight());
        let (_db, mut b) = system_with(tight());
        let data = random_bytes(21, 100_000);
        put(&mut a, "big.bin", &data, later(0));

        let mut sent = a.deliver_file(info("big.bin", later(0), &data)).unwrap();
        assert!(matches!(sent[0], Message::FileResponse { data: None, .. }));
        assert!(sent.len() >= 4, "expected several batches");
        let Message::Corrections(lost) = sent.remove(2) else {
            panic!("expected a corrections batch");
        };
        assert!(!lost.is_final);
        let missing: Vec<BlockPair> = lost
            .corrections
            .iter()
            .map(|c| BlockPair {
                file_name: "big.bin".into(),
                offset_client: c.offset,
                offset_server: c.offset,
                size_client: c.size,
                size_server: c.size,
            })
            .collect();

        let mut last = Vec::new();
        for message in sent {
            last = b.handle(message);
        }
        let [Message::SyncResponse {
            correction_request: Some(request),
            ..
        }] = &last[..]
        else {
            panic!("expected a correction request");
        };
        assert_eq!(request, &missing);
        assert!(!b.store.exists("big.bin"));

        let resent = a.handle(last.remove(0));
        assert!(matches!(&resent[..], [Message::Corrections(c)] if c.is_final));
        for message in resent {
            assert_eq!(b.handle(message), vec![Message::Received]);
        }
        assert_eq!(b.store.read_all("big.bin").unwrap(), data);
        assert_eq!(b.state("big.bin"), SyncState::Synced);
    }
}
