//! State management module.
//!
//! This module provides persistent state storage for the resources the engine
//! manages: provider identities, last-applied properties, provider outputs
//! and run history, guarded by a version stamp and an advisory lock.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    DeposedObject, MAX_HISTORY, Outputs, RunHistoryEntry, RunOperation, STATE_FORMAT_VERSION,
    StateDocument, StateRecord,
};
