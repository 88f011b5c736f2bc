// Expiration ledger

//! Durable username -> expiration map
//!
//! Stored as a single JSON object, `{"bob": "2030-01-01T00:00:00Z", "carol": null}`,
//! where `null` means the peer never expires. Every mutation reads the whole
//! map, applies the change and writes the whole map back under an exclusive
//! file lock, so concurrent writers in other processes are not lost. A
//! corrupt or unreadable file is treated as empty so the daemon keeps running.

use crate::error::{PeerError, Result};
use crate::state_file::{self, FileLock};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Expiration recorded for a user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Access does not expire
    Never,
    /// Access is revoked at this instant
    At(DateTime<Utc>),
}

impl Expiry {
    /// The instant, if any
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Expiry::Never => None,
            Expiry::At(at) => Some(*at),
        }
    }
}

impl From<Option<DateTime<Utc>>> for Expiry {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        value.map_or(Expiry::Never, Expiry::At)
    }
}

/// Parse a stored instant; naive timestamps are taken as UTC
fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// JSON-file backed expiration ledger
#[derive(Debug, Clone)]
pub struct ExpirationLedger {
    path: PathBuf,
}

impl ExpirationLedger {
    /// Create a ledger persisted at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the ledger file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> BTreeMap<String, Option<DateTime<Utc>>> {
        let contents = match state_file::read_optional(&self.path) {
            Ok(Some(contents)) => contents,
            Ok(None) => return BTreeMap::new(),
            Err(e) => {
                log::warn!("Expiration ledger unreadable, treating as empty: {}", e);
                return BTreeMap::new();
            }
        };

        if contents.trim().is_empty() {
            return BTreeMap::new();
        }

        let raw: BTreeMap<String, Option<String>> = match serde_json::from_str(&contents) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!(
                    "Corrupt expiration ledger {}, treating as empty: {}",
                    self.path.display(),
                    e
                );
                return BTreeMap::new();
            }
        };

        raw.into_iter()
            .filter_map(|(user, value)| match value {
                None => Some((user, None)),
                Some(text) => match parse_instant(&text) {
                    Some(at) => Some((user, Some(at))),
                    None => {
                        log::error!("Invalid expiration time for user {}: {}", user, text);
                        None
                    }
                },
            })
            .collect()
    }

    fn save(&self, entries: &BTreeMap<String, Option<DateTime<Utc>>>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries).map_err(|e| {
            PeerError::io("Failed to serialize expiration ledger", &self.path, e.into())
        })?;
        state_file::write_atomically(&self.path, json.as_bytes())
    }

    /// Record an expiration (`None` = never expires), replacing any previous one
    pub fn set(&self, username: &str, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        let _lock = FileLock::acquire(&self.path)?;
        let mut entries = self.load();
        entries.insert(username.to_string(), expires_at);
        self.save(&entries)
    }

    /// Drop a user's record, returning whether one existed
    pub fn remove(&self, username: &str) -> Result<bool> {
        let _lock = FileLock::acquire(&self.path)?;
        let mut entries = self.load();
        if entries.remove(username).is_none() {
            return Ok(false);
        }
        self.save(&entries)?;
        Ok(true)
    }

    /// `None` if the user has no record
    pub fn get(&self, username: &str) -> Option<Expiry> {
        self.load().get(username).map(|&at| Expiry::from(at))
    }

    /// Every record, ordered by username
    pub fn list_all(&self) -> Vec<(String, Expiry)> {
        self.load()
            .into_iter()
            .map(|(user, at)| (user, Expiry::from(at)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;

    fn ledger() -> (tempfile::TempDir, ExpirationLedger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ExpirationLedger::new(dir.path().join("expirations.json"));
        (dir, ledger)
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let (_dir, ledger) = ledger();
        assert!(ledger.list_all().is_empty());
        assert_eq!(ledger.get("bob"), None);
        assert!(!ledger.remove("bob").unwrap());
        assert!(!ledger.path().exists());
    }

    #[test]
    fn test_set_get_remove() {
        let (_dir, ledger) = ledger();
        ledger.set("bob", Some(at(2030, 1, 1))).unwrap();
        ledger.set("carol", None).unwrap();

        assert_eq!(ledger.get("bob"), Some(Expiry::At(at(2030, 1, 1))));
        assert_eq!(ledger.get("carol"), Some(Expiry::Never));
        assert_eq!(ledger.get("dave"), None);

        assert!(ledger.remove("bob").unwrap());
        assert_eq!(ledger.get("bob"), None);
        assert_eq!(
            ledger.list_all(),
            vec![("carol".to_string(), Expiry::Never)]
        );
    }

    #[test]
    fn test_set_replaces() {
        let (_dir, ledger) = ledger();
        ledger.set("bob", Some(at(2030, 1, 1))).unwrap();
        ledger.set("bob", None).unwrap();
        assert_eq!(ledger.get("bob"), Some(Expiry::Never));
        assert_eq!(ledger.list_all().len(), 1);
    }

    #[test]
    fn test_persisted_format() {
        let (_dir, ledger) = ledger();
        ledger.set("bob", Some(at(2030, 1, 1))).unwrap();
        ledger.set("carol", None).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(ledger.path()).unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"bob": "2030-01-01T00:00:00Z", "carol": null})
        );
    }

    #[test]
    fn test_reads_offset_and_naive_timestamps() {
        let (_dir, ledger) = ledger();
        fs::write(
            ledger.path(),
            r#"{"a": "2030-01-01T03:00:00+03:00", "b": "2030-01-01T00:00:00.500000", "c": null}"#,
        )
        .unwrap();

        assert_eq!(ledger.get("a"), Some(Expiry::At(at(2030, 1, 1))));
        let b = ledger.get("b").unwrap().instant().unwrap();
        assert_eq!(b.timestamp(), at(2030, 1, 1).timestamp());
        assert_eq!(ledger.get("c"), Some(Expiry::Never));
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let (_dir, ledger) = ledger();
        fs::write(ledger.path(), "{not json").unwrap();
        assert!(ledger.list_all().is_empty());

        // The next write starts over from an empty map
        ledger.set("bob", None).unwrap();
        assert_eq!(ledger.list_all(), vec![("bob".to_string(), Expiry::Never)]);
    }

    #[test]
    fn test_invalid_entry_skipped() {
        let (_dir, ledger) = ledger();
        fs::write(ledger.path(), r#"{"bob": "tomorrow", "carol": "2031-06-01T00:00:00Z"}"#)
            .unwrap();
        assert_eq!(
            ledger.list_all(),
            vec![("carol".to_string(), Expiry::At(at(2031, 6, 1)))]
        );
    }

    #[test]
    fn test_concurrent_writers_keep_every_record() {
        let (_dir, ledger) = ledger();
        let writers: Vec<_> = (0..8)
            .map(|i| {
                // Separate handles stand in for separate processes
                let ledger = ExpirationLedger::new(ledger.path());
                std::thread::spawn(move || {
                    for j in 0..5 {
                        ledger.set(&format!("user{}_{}", i, j), None).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(ledger.list_all().len(), 40);
    }
}
