//! Append-emulated table file log.
//!
//! A logical file is a main object plus an append directory of immutable
//! records. See [`crate::layout`] for the naming scheme.

mod append;
mod compactor;
mod reader;

pub use append::{AppendEmulator, RecordRef};
pub use compactor::{CompactionReport, Compactor};
pub use reader::{list_records, LogReader, PendingRecord};
