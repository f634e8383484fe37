//! Resumable TUS 1.0.0 upload engine with parallel multipart assembly.
//!
//! The [`server`] half stages uploads on local disk and reassembles
//! multipart sibling groups into single destination files; the [`client`]
//! half schedules concurrent uploads against a stream budget.

pub mod config;
pub mod error;
pub mod metadata;
pub mod paths;
pub mod strategy;

pub mod client;
pub mod server;
pub mod staging;

pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};

// Re-export commonly used types
pub use client::scheduler::Scheduler;
pub use client::{QueuedFile, UploadStatus};
pub use metadata::UploadMetadata;
pub use server::{AppState, router, serve};
