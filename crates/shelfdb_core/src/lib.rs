//! # ShelfDB Core
//!
//! Crash-safe document persistence over storage backends that may only
//! support whole-object PUT/GET/DELETE.
//!
//! This crate provides:
//! - Append emulation: incremental writes as immutable record objects
//! - Merged reads of a main object plus its pending records
//! - Crash-safe compaction through temp-then-rename
//! - A single-flight FIFO executor per datastore
//! - A small document datastore persisting through all of the above
//!
//! ## Layering
//!
//! ```text
//! Datastore ──► Executor ──► TableFiles ──► log::{AppendEmulator, LogReader, Compactor}
//!                                                        │
//!                                                        ▼
//!                                         shelfdb_storage::StorageDriver
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod datastore;
mod error;
mod executor;
pub mod layout;
pub mod log;
mod table;

pub use config::{Config, MIN_AUTOCOMPACTION_INTERVAL};
pub use datastore::{
    deletion_line, document_id, document_line, get_path, new_id, replay, validate, Datastore, Document,
    Persistence, Query, ReplayedLog, Request, Response, Update, UpdateOptions, UpdateOutcome,
    DELETED_MARKER, ID_FIELD,
};
pub use error::{CoreError, CoreResult};
pub use executor::{Executor, ExecutorState, Pending, Sink};
pub use layout::{OrderKey, OrderKeyGenerator};
pub use log::{CompactionReport, RecordRef};
pub use table::TableFiles;
