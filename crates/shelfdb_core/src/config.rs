//! Datastore configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shortest allowed autocompaction period.
pub const MIN_AUTOCOMPACTION_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration for opening a datastore.
///
/// Deserializing fills missing fields from [`Config::default`]. Values read
/// this way are not clamped; go through the setters for that.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logical path of the datafile. `None` keeps the datastore in memory.
    pub filename: Option<String>,

    /// Fraction of corrupt lines above which loading fails.
    pub corrupt_alert_threshold: f64,

    /// Whether loading rewrites the datafile as a compacted snapshot.
    pub persist_on_load: bool,

    /// Whether append record keys are forced strictly increasing.
    pub strict_order_keys: bool,

    /// Period for automatic compaction (`None` = never).
    pub autocompaction_interval: Option<Duration>,

    /// Maximum number of append records read concurrently.
    pub read_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            filename: None,
            corrupt_alert_threshold: 0.1,
            persist_on_load: false,
            strict_order_keys: true,
            autocompaction_interval: None,
            read_concurrency: 16,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the datafile path.
    #[must_use]
    pub fn filename(mut self, path: impl Into<String>) -> Self {
        self.filename = Some(path.into());
        self
    }

    /// Sets the corrupt line threshold (clamped to `0.0..=1.0`).
    #[must_use]
    pub fn corrupt_alert_threshold(mut self, value: f64) -> Self {
        self.corrupt_alert_threshold = value.clamp(0.0, 1.0);
        self
    }

    /// Sets whether loading compacts the datafile.
    #[must_use]
    pub const fn persist_on_load(mut self, value: bool) -> Self {
        self.persist_on_load = value;
        self
    }

    /// Sets whether record order keys are strictly increasing.
    #[must_use]
    pub const fn strict_order_keys(mut self, value: bool) -> Self {
        self.strict_order_keys = value;
        self
    }

    /// Sets the autocompaction period, clamped to at least 5 seconds.
    #[must_use]
    pub fn autocompaction_interval(mut self, interval: Duration) -> Self {
        self.autocompaction_interval = Some(interval.max(MIN_AUTOCOMPACTION_INTERVAL));
        self
    }

    /// Sets the record read concurrency (at least 1).
    #[must_use]
    pub fn read_concurrency(mut self, value: usize) -> Self {
        self.read_concurrency = value.max(1);
        self
    }

    /// Returns true if the datastore has no backing file.
    #[must_use]
    pub fn in_memory_only(&self) -> bool {
        self.filename.is_none()
    }
}
