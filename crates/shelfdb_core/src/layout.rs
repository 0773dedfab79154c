//! Persisted naming of table files.
//!
//! These names are part of the on-storage format and must stay bit-exact:
//!
//! ```text
//! data/users.db                        main object
//! data/users.db~                       temp object (in-flight compaction)
//! data/~users.db/                      append directory
//! data/~users.db/rec-417-1700000000123.adb   one append record
//! ```

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Prefix of every append record name.
pub const RECORD_PREFIX: &str = "rec-";

/// Extension of every append record name.
pub const RECORD_EXTENSION: &str = "adb";

/// Marker prepended to the base name to form the append directory.
pub const APPEND_DIR_MARKER: &str = "~";

/// Suffix appended to the logical path to form the temp object.
pub const TEMP_SUFFIX: &str = "~";

/// Largest random tie-break value in a record name.
pub const MAX_RAND: u16 = 1000;

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Splits a logical path into `(parent, base name)`.
///
/// The parent is empty for paths without a `/`.
#[must_use]
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

/// Append directory of a logical file.
///
/// `data/users.db` maps to `data/~users.db`, `users.db` to `~users.db`.
#[must_use]
pub fn append_dir(path: &str) -> String {
    let (parent, base) = split_path(path);
    shelfdb_storage::join_path(parent, &format!("{APPEND_DIR_MARKER}{base}"))
}

/// Temp object of a logical file.
#[must_use]
pub fn temp_path(path: &str) -> String {
    format!("{path}{TEMP_SUFFIX}")
}

/// Ordering key of an append record.
///
/// Compared by `millis` first and `rand` as tie-break; field order matters
/// for the derived `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    /// Epoch milliseconds at creation.
    pub millis: u64,
    /// Random tie-break in `0..=MAX_RAND`.
    pub rand: u16,
}

impl OrderKey {
    /// Creates a key.
    #[must_use]
    pub const fn new(millis: u64, rand: u16) -> Self {
        Self { millis, rand }
    }

    /// Object name of the record carrying this key.
    #[must_use]
    pub fn record_name(&self) -> String {
        format!(
            "{RECORD_PREFIX}{}-{}.{RECORD_EXTENSION}",
            self.rand, self.millis
        )
    }

    /// Parses a record name. Returns `None` for anything that is not a
    /// well-formed record name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let body = name
            .strip_prefix(RECORD_PREFIX)?
            .strip_suffix(RECORD_EXTENSION)?
            .strip_suffix('.')?;
        let (rand, millis) = body.split_once('-')?;
        if !is_digits(rand) || !is_digits(millis) {
            return None;
        }
        let rand: u16 = rand.parse().ok()?;
        if rand > MAX_RAND {
            return None;
        }
        Some(Self {
            millis: millis.parse().ok()?,
            rand,
        })
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.millis, self.rand)
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Largest step of the random part between two keys issued in the same
/// millisecond. Small steps keep strict keys on the wall clock for up to
/// `MAX_RAND / TIE_STEP` appends per millisecond.
const TIE_STEP: u16 = 16;

/// Issues order keys for new append records.
///
/// In strict mode every key is greater than the previous one issued by this
/// generator, and greater than any key passed to [`observe`], even when the
/// clock stalls or steps backwards. In loose mode keys are `(now, random)`
/// and same-millisecond appends may reorder.
///
/// [`observe`]: OrderKeyGenerator::observe
#[derive(Debug)]
pub struct OrderKeyGenerator {
    strict: bool,
    last: Mutex<Option<OrderKey>>,
}

impl OrderKeyGenerator {
    /// Creates a generator.
    #[must_use]
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            last: Mutex::new(None),
        }
    }

    /// Returns true if keys are strictly increasing.
    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Raises the floor of future keys to above `key`.
    ///
    /// Used to continue after records written by an earlier generator. No-op
    /// in loose mode.
    pub fn observe(&self, key: OrderKey) {
        if !self.strict {
            return;
        }
        let mut last = self.last.lock();
        if !matches!(*last, Some(prev) if prev >= key) {
            *last = Some(key);
        }
    }

    /// Highest key issued or observed so far. Always `None` in loose mode.
    #[must_use]
    pub fn last_issued(&self) -> Option<OrderKey> {
        *self.last.lock()
    }

    /// Issues a key for the current time.
    pub fn next_key(&self) -> OrderKey {
        self.next_at(now_millis(), &mut rand::thread_rng())
    }

    /// Issues a key for the given time.
    pub fn next_at<R: Rng>(&self, millis: u64, rng: &mut R) -> OrderKey {
        let drawn = OrderKey::new(millis, rng.gen_range(0..=MAX_RAND));
        if !self.strict {
            return drawn;
        }

        let mut last = self.last.lock();
        let key = match *last {
            Some(prev) if millis <= prev.millis => {
                if prev.rand < MAX_RAND {
                    let top = prev.rand.saturating_add(TIE_STEP).min(MAX_RAND);
                    OrderKey::new(prev.millis, rng.gen_range(prev.rand + 1..=top))
                } else {
                    OrderKey::new(prev.millis + 1, rng.gen_range(0..=TIE_STEP))
                }
            }
            _ => drawn,
        };
        *last = Some(key);
        key
    }
}
