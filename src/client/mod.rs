pub mod batch;
pub mod partition;
pub mod scheduler;
pub mod session;

use std::path::PathBuf;

/// Lifecycle of a queued file as the scheduler drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Error,
}

/// One logical file in the client queue. The id is generated client-side
/// and is unrelated to the server's staging id(s).
#[derive(Debug, Clone)]
pub struct QueuedFile {
    pub id: String,
    pub path: PathBuf,
    pub size: u64,
    /// Number of parallel TUS sessions this file occupies.
    pub parts: u32,
    pub status: UploadStatus,
    /// Display progress, 0..=100; held at 99 until every part succeeds.
    pub progress: u8,
    pub uploaded_bytes: u64,
}
