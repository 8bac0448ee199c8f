//! Sync engine module

pub mod downloader;
pub mod engine;

pub use downloader::{DEFAULT_THREADS, DownloadPool};
pub use engine::{SyncEngine, SyncReport};
