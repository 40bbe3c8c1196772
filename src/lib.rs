//! Stemforge Server Library
//!
//! This library exposes the internal modules for testing and potential reuse.

pub mod catalog;
pub mod config;
pub mod events;
pub mod jobs;
pub mod kie;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use jobs::{JobLauncher, JobRequest};
pub use server::{make_app, run_server, RequestsLoggingLevel, ServerConfig};
pub use storage::{GitHubStore, StorageSync};
