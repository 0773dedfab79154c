//! Benchmark utilities.

#![warn(missing_docs)]

use bytes::Bytes;
use rand::Rng;
use serde_json::{json, Value};
use shelfdb_core::{Document, TableFiles};

/// Builds a multi-threaded runtime for driving async code from benchmarks.
///
/// # Panics
///
/// Panics if the runtime cannot be created.
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime")
}

/// Generate random fragment data of the specified size.
pub fn random_data(size: usize) -> Bytes {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen::<u8>()).collect::<Vec<_>>().into()
}

/// Generate a document with a payload string of roughly `payload_size` bytes.
pub fn generate_document(index: usize, payload_size: usize) -> Document {
    let payload: String = "x".repeat(payload_size);
    match json!({"n": index, "payload": payload}) {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

/// Generate a batch of documents.
pub fn generate_documents(count: usize, payload_size: usize) -> Vec<Document> {
    (0..count).map(|i| generate_document(i, payload_size)).collect()
}

/// Appends `count` fragments of `size` bytes to `path`.
///
/// # Panics
///
/// Panics if an append fails.
pub async fn fill_records(tables: &TableFiles, path: &str, count: usize, size: usize) {
    for _ in 0..count {
        tables
            .append_table_file(path, random_data(size))
            .await
            .expect("Failed to append fragment");
    }
}
