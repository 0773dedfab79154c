//! Document log format and persistence of a datastore.
//!
//! A datafile is UTF-8 JSON, one document per `\n`-terminated line. Removals
//! are written as `{"$$deleted":true,"_id":"<id>"}`. Loading replays lines in
//! order, last writer wins per `_id`, so appending a changed document is
//! enough to persist an update.

use crate::config::Config;
use crate::datastore::document::{document_id, Document, ID_FIELD};
use crate::error::{CoreError, CoreResult};
use crate::log::CompactionReport;
use crate::table::TableFiles;
use bytes::Bytes;
use serde_json::{Map, Value};
use shelfdb_storage::StorageDriver;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Field marking a removal line.
pub const DELETED_MARKER: &str = "$$deleted";

/// Encodes one document as a log line (with trailing newline).
///
/// # Errors
///
/// Returns a serialization error if the document cannot be encoded.
pub fn document_line(doc: &Document) -> CoreResult<String> {
    let mut line = serde_json::to_string(doc)?;
    line.push('\n');
    Ok(line)
}

/// Encodes a removal marker for `id` (with trailing newline).
#[must_use]
pub fn deletion_line(id: &str) -> String {
    let mut marker = Map::new();
    marker.insert(DELETED_MARKER.to_string(), Value::Bool(true));
    marker.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    format!("{}\n", Value::Object(marker))
}

/// Result of replaying a datafile.
#[derive(Debug, Clone, Default)]
pub struct ReplayedLog {
    /// Live documents keyed by `_id`.
    pub documents: BTreeMap<String, Document>,
    /// Non-empty lines seen.
    pub lines: usize,
    /// Lines that failed to parse.
    pub corrupt: usize,
}

/// Replays a datafile.
///
/// # Errors
///
/// Returns `CorruptData` if the share of unparseable non-empty lines exceeds
/// `threshold`.
pub fn replay(data: &[u8], threshold: f64) -> CoreResult<ReplayedLog> {
    let mut log = ReplayedLog::default();

    for raw in data.split(|&b| b == b'\n') {
        if raw.trim_ascii().is_empty() {
            continue;
        }
        log.lines += 1;

        // Invalid UTF-8 makes the whole line corrupt.
        let parsed = std::str::from_utf8(raw)
            .ok()
            .and_then(|line| serde_json::from_str::<Value>(line.trim()).ok());
        let Some(Value::Object(doc)) = parsed else {
            log.corrupt += 1;
            continue;
        };
        let Some(id) = document_id(&doc).map(str::to_string) else {
            continue;
        };
        if doc.get(DELETED_MARKER) == Some(&Value::Bool(true)) {
            log.documents.remove(&id);
        } else {
            log.documents.insert(id, doc);
        }
    }

    if log.lines > 0 {
        let ratio = log.corrupt as f64 / log.lines as f64;
        if ratio > threshold {
            return Err(CoreError::corrupt_data(format!(
                "{} of {} lines are corrupt ({:.0}% > {:.0}% threshold)",
                log.corrupt,
                log.lines,
                ratio * 100.0,
                threshold * 100.0
            )));
        }
        if log.corrupt > 0 {
            tracing::warn!(corrupt = log.corrupt, lines = log.lines, "skipped corrupt datafile lines");
        }
    }
    Ok(log)
}

/// Persistence of one datastore's documents through the table-file layer.
#[derive(Debug)]
pub struct Persistence {
    tables: TableFiles,
    filename: Option<String>,
    corrupt_alert_threshold: f64,
}

impl Persistence {
    /// Creates persistence for `config.filename`, or a no-op persistence for
    /// in-memory datastores.
    #[must_use]
    pub fn new(driver: Arc<dyn StorageDriver>, config: &Config) -> Self {
        Self {
            tables: TableFiles::with_config(driver, config),
            filename: config.filename.clone(),
            corrupt_alert_threshold: config.corrupt_alert_threshold,
        }
    }

    /// Logical path of the datafile, if any.
    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// The underlying table-file layer.
    #[must_use]
    pub fn tables(&self) -> &TableFiles {
        &self.tables
    }

    /// Recovers and replays the datafile.
    ///
    /// # Errors
    ///
    /// Returns any driver failure or `CorruptData`.
    pub async fn load(&self) -> CoreResult<ReplayedLog> {
        let Some(path) = self.filename.as_deref() else {
            return Ok(ReplayedLog::default());
        };
        self.tables.ensure_integrity(path).await?;
        self.tables.resume_order_keys(path).await?;
        let data = self.tables.read_table_file(path).await?;
        let log = replay(&data, self.corrupt_alert_threshold)?;
        tracing::info!(path = %path, documents = log.documents.len(), lines = log.lines, "datafile loaded");
        Ok(log)
    }

    /// Appends already encoded lines as one record.
    ///
    /// # Errors
    ///
    /// Returns any driver failure.
    pub async fn append_lines(&self, lines: String) -> CoreResult<()> {
        let Some(path) = self.filename.as_deref() else {
            return Ok(());
        };
        if lines.is_empty() {
            return Ok(());
        }
        self.tables.append_table_file(path, Bytes::from(lines)).await?;
        Ok(())
    }

    /// Persists new versions of documents.
    ///
    /// # Errors
    ///
    /// Returns a serialization or driver failure.
    pub async fn persist_documents<'a, I>(&self, docs: I) -> CoreResult<()>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        if self.filename.is_none() {
            return Ok(());
        }
        let mut lines = String::new();
        for doc in docs {
            lines.push_str(&document_line(doc)?);
        }
        self.append_lines(lines).await
    }

    /// Persists removals.
    ///
    /// # Errors
    ///
    /// Returns any driver failure.
    pub async fn persist_deletions(&self, ids: &[String]) -> CoreResult<()> {
        let lines: String = ids.iter().map(|id| deletion_line(id)).collect();
        self.append_lines(lines).await
    }

    /// Rewrites the datafile with exactly `docs`.
    ///
    /// Returns `None` for in-memory datastores.
    ///
    /// # Errors
    ///
    /// Returns a serialization or driver failure.
    pub async fn compact<'a, I>(&self, docs: I) -> CoreResult<Option<CompactionReport>>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        let Some(path) = self.filename.as_deref() else {
            return Ok(None);
        };
        let mut snapshot = String::new();
        for doc in docs {
            snapshot.push_str(&document_line(doc)?);
        }
        let report = self
            .tables
            .crash_safe_write_table_file(path, Bytes::from(snapshot))
            .await?;
        Ok(Some(report))
    }

    /// Deletes every object belonging to the datafile.
    ///
    /// # Errors
    ///
    /// Returns any driver failure.
    pub async fn destroy(&self) -> CoreResult<()> {
        match self.filename.as_deref() {
            Some(path) => self.tables.delete_table_files(path).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn deletion_line_format() {
        assert_eq!(deletion_line("abc"), "{\"$$deleted\":true,\"_id\":\"abc\"}\n");
    }

    #[test]
    fn replay_is_last_writer_wins() {
        let mut data = String::new();
        data.push_str(&document_line(&doc(json!({"_id": "1", "v": 1}))).unwrap());
        data.push_str(&document_line(&doc(json!({"_id": "2", "v": 1}))).unwrap());
        data.push_str(&document_line(&doc(json!({"_id": "1", "v": 2}))).unwrap());
        data.push_str(&deletion_line("2"));

        let log = replay(data.as_bytes(), 0.1).unwrap();
        assert_eq!(log.documents.len(), 1);
        assert_eq!(log.documents["1"]["v"], json!(2));
        assert_eq!(log.lines, 4);
        assert_eq!(log.corrupt, 0);
    }

    #[test]
    fn lines_without_id_are_ignored() {
        let log = replay(b"{\"a\":1}\n\n{\"_id\":\"x\"}\n", 0.1).unwrap();
        assert_eq!(log.documents.len(), 1);
        assert_eq!(log.lines, 2);
    }

    #[test]
    fn corrupt_threshold() {
        let mut good = String::new();
        for i in 0..9 {
            good.push_str(&format!("{{\"_id\":\"{i}\"}}\n"));
        }

        // 1 of 10 is exactly 10%, tolerated.
        let tolerated = format!("{good}garbage\n");
        let log = replay(tolerated.as_bytes(), 0.1).unwrap();
        assert_eq!(log.corrupt, 1);
        assert_eq!(log.documents.len(), 9);

        // 2 of 11 is above 10%.
        let rejected = format!("{good}garbage\n{{broken\n");
        let err = replay(rejected.as_bytes(), 0.1).unwrap_err();
        assert!(matches!(err, CoreError::CorruptData { .. }));
    }

    #[test]
    fn invalid_utf8_line_is_corrupt() {
        let mut data = b"{\"_id\":\"a\",\"name\":\"".to_vec();
        data.extend_from_slice(&[0xff, 0xfe]);
        data.extend_from_slice(b"\"}\n{\"_id\":\"b\"}\n");

        let log = replay(&data, 0.5).unwrap();
        assert_eq!(log.lines, 2);
        assert_eq!(log.corrupt, 1);
        assert_eq!(log.documents.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn empty_log_is_fine() {
        let log = replay(b"", 0.0).unwrap();
        assert!(log.documents.is_empty());
    }
}
