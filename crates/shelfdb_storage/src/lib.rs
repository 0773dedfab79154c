//! # ShelfDB Storage
//!
//! Storage driver contract and reference drivers for ShelfDB.
//!
//! This crate is the lowest layer of ShelfDB. Drivers are **opaque object
//! stores**: they create, read, rename and delete whole objects addressed by
//! `/`-separated paths and do not interpret what they store.
//!
//! ## Design Principles
//!
//! - Drivers only need whole-object PUT/GET/DELETE plus listing
//! - No knowledge of table files, append records or documents
//! - Must be `Send + Sync` so one driver can serve many datastores
//! - Not-found on delete/list/exists is never an error
//! - ShelfDB core owns all naming and crash-safety protocols
//!
//! ## Available Drivers
//!
//! - [`InMemoryDriver`] - flat object store for tests and ephemeral data
//! - [`FileDriver`] - local filesystem with atomic rename
//!
//! ## Support utilities
//!
//! - [`DiagnosticRing`] - recent-event ring flushed to `tracing` on failure
//! - [`TokenCache`] - capability token cache with one retry on expiry
//!
//! ## Example
//!
//! ```rust
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! use bytes::Bytes;
//! use shelfdb_storage::{InMemoryDriver, StorageDriver, WriteOptions};
//!
//! let driver = InMemoryDriver::new();
//! driver.write_file("data/t.db", Bytes::from_static(b"hello"), WriteOptions::default()).await.unwrap();
//! assert_eq!(&driver.read_file("data/t.db").await.unwrap()[..], b"hello");
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod diagnostics;
mod driver;
mod error;
mod file;
mod memory;
mod session;

pub use diagnostics::{DiagnosticEvent, DiagnosticRing, DEFAULT_RING_CAPACITY};
pub use driver::{join_path, Capabilities, FileKind, FileStat, ListPage, StorageDriver, WriteOptions};
pub use error::{ErrorClass, StorageError, StorageResult};
pub use file::FileDriver;
pub use memory::{InMemoryDriver, DEFAULT_BATCH_LIMIT, DEFAULT_PAGE_SIZE};
pub use session::{IssuedToken, TokenCache};
