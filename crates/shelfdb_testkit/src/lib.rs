//! # ShelfDB Testkit
//!
//! Test utilities for ShelfDB.
//!
//! This crate provides:
//! - Test fixtures over in-memory and filesystem drivers
//! - A failure-injecting driver wrapper
//! - Crash recovery scenarios for the compaction protocol
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! use serde_json::json;
//! use shelfdb_testkit::prelude::*;
//!
//! init_tracing();
//! let store = TestStore::memory();
//! let db = store.open_datastore("data/users.db").await;
//! db.insert(doc(json!({"name": "ada"}))).await.unwrap();
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod failing;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::failing::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
}

pub use crash::*;
pub use failing::*;
pub use fixtures::*;
pub use generators::*;

/// Installs a test-friendly `tracing` subscriber once per process.
///
/// The filter comes from `RUST_LOG` and defaults to `warn`. Output goes
/// through the test writer so it is captured per test.
pub fn init_tracing() {
    use std::sync::Once;
    use tracing_subscriber::EnvFilter;

    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        // Another harness may already own the global subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
