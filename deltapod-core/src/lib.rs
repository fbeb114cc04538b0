//! DeltaPod sync engine.
//! Host-driven: the host feeds decoded messages in and sends the returned replies out.
//! Filesystem access goes through [`FileStore`]; no sockets in here.

pub mod assembler;
pub mod bus;
pub mod core;
pub mod index;
pub mod matcher;
pub mod pipe;
pub mod protocol;
pub mod signature;
pub mod store;
pub mod wire;

pub use crate::core::{ScanReport, SyncConfig, SyncError, SyncState, SyncSystem};
pub use bus::{spawn_worker, Command, Envelope, Inbox, MessageHandler, Outbox};
pub use index::{FileRecord, MemoryIndex, MetadataIndex, Owner, RemovedRecord};
pub use pipe::Pipe;
pub use protocol::{
    Block, BlockPair, Corrections, FileInfo, ListOptions, Message, PartialMatch, DEFAULT_PORT,
    PROTOCOL_VERSION,
};
pub use store::FileStore;
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
