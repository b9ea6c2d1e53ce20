//! Per-job watcher
//!
//! One watcher process runs inside the execution context of each BridgeJob.
//! It submits the job to the remote scheduler named in the coordination
//! record, polls it until it reaches a terminal state, relays kill requests,
//! stages artifacts through object storage and writes every observation back
//! into the record for the controller to project.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod stager;
pub mod storage;

pub use backend::{create_backend, BackendAdapter};
pub use config::{WatcherArgs, WatcherSettings};
pub use engine::{Outcome, WatcherEngine};
pub use error::{BackendError, StorageError, WatcherError};
