//! DeltaPod wire protocol: message types and version.

use serde::{Deserialize, Serialize};

/// Current protocol version. Exchanged as a one-byte handshake when a connection opens.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default TCP port for peer connections.
pub const DEFAULT_PORT: u16 = 9876;

/// Wire projection of a file record: what peers compare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Relative `/`-separated path; unique key.
    pub name: String,
    /// Modification time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub size: u64,
    /// Strong signature of the whole file (lowercase hex).
    pub signature: String,
}

impl FileInfo {
    /// Same content: sizes and strong signatures agree.
    pub fn same_content(&self, other: &FileInfo) -> bool {
        self.size == other.size && self.signature == other.signature
    }
}

/// Listing filter shared by both sides of a ShowFiles / FileList exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    pub include_hidden: bool,
    /// Only files with a timestamp strictly after this watermark.
    pub changed_after: Option<i64>,
}

/// A byte range of one file, optionally carrying signatures or data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub file_name: String,
    pub offset: u64,
    pub size: u32,
    pub weak_signature: Option<u32>,
    pub strong_signature: Option<String>,
    pub data: Option<Vec<u8>>,
}

impl Block {
    /// Block carrying raw bytes at `offset`.
    pub fn with_data(file_name: &str, offset: u64, data: Vec<u8>) -> Self {
        Self {
            file_name: file_name.to_string(),
            offset,
            size: data.len() as u32,
            weak_signature: None,
            strong_signature: None,
            data: Some(data),
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size as u64
    }
}

/// Correspondence between a range of the requester's version (client) and a range of the
/// responder's version (server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPair {
    pub file_name: String,
    pub offset_client: u64,
    pub offset_server: u64,
    pub size_client: u32,
    pub size_server: u32,
}

impl BlockPair {
    pub fn client_end(&self) -> u64 {
        self.offset_client + self.size_client as u64
    }

    pub fn server_end(&self) -> u64 {
        self.offset_server + self.size_server as u64
    }
}

/// One batch of raw correction data for a file. Only the last batch of an exchange is final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Corrections {
    pub file_name: String,
    pub corrections: Vec<Block>,
    pub is_final: bool,
}

/// Partial-match payload of a SyncResponse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialMatch {
    /// Version the exchange converges to.
    pub matched_file: FileInfo,
    /// Matching pairs found by the weak-signature scan.
    pub matches: Vec<BlockPair>,
    /// Pairs whose client range should be answered with a strong signature.
    pub signature_requests: Option<Vec<BlockPair>>,
    /// Data for non-matching ranges, laid out in the matched file's coordinates.
    pub corrections: Option<Corrections>,
}

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Ask the peer for its file listing.
    ShowFiles { options: ListOptions },
    /// Listing reply, echoing the filter it was built with.
    FileList {
        files: Vec<FileInfo>,
        options: ListOptions,
    },
    /// Start a delta exchange for `file` (the sender's version).
    SyncRequest {
        file: FileInfo,
        weak_signatures: Vec<u32>,
        removed: bool,
    },
    SyncResponse {
        requested_file: FileInfo,
        partial_match: Option<PartialMatch>,
        /// Pairs whose client range the receiver should send as Corrections.
        correction_request: Option<Vec<BlockPair>>,
        /// The responder has no copy and wants the whole file.
        requesting_file: bool,
        /// The responder knows the file as removed.
        removed: bool,
    },
    /// Strong signatures for the requested client ranges.
    SignatureAddendum {
        matched_file: FileInfo,
        blocks: Vec<Block>,
    },
    Corrections(Corrections),
    /// Ask for the whole file.
    FileRequest { file: FileInfo },
    /// Whole-file reply. `data` is `None` when the content follows as Corrections or
    /// when the file is unknown.
    FileResponse {
        requested_file: FileInfo,
        data: Option<Vec<u8>>,
        unknown: bool,
    },
    /// Generic acknowledgment.
    Received,
}

impl Message {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ShowFiles { .. } => "ShowFiles",
            Message::FileList { .. } => "FileList",
            Message::SyncRequest { .. } => "SyncRequest",
            Message::SyncResponse { .. } => "SyncResponse",
            Message::SignatureAddendum { .. } => "SignatureAddendum",
            Message::Corrections(_) => "Corrections",
            Message::FileRequest { .. } => "FileRequest",
            Message::FileResponse { .. } => "FileResponse",
            Message::Received => "Received",
        }
    }
}
