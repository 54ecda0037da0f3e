//! Storage port and its implementations
//!
//! The engine's only touchpoint with the network and the filesystem.

mod fs;
mod mem;
mod port;

pub use fs::FsStorage;
pub use mem::{MemStorage, ScriptedOutcome};
pub use port::{
    derive_handle, Download, DownloadError, PersistedBlob, StorageHandle, StoragePort,
};
