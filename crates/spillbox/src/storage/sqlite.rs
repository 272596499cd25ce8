//! SQLite-backed archive handle
//!
//! One [`Spillbox`] owns the connection to an archive. Component operations
//! (mailboxes, blobs, contacts, messages, convos) are implemented in sibling
//! modules as free functions over a `&Connection` so they compose inside a
//! single transaction, and are exposed as methods on `Spillbox` that each
//! run as one atomic unit.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};

use super::contacts::{AddressMatcher, ContactMatcher};
use super::schema::migrations;
use crate::config::SpillboxConfig;
use crate::policy::{LinkTextDetector, UnsubscribeDetector};

/// Storage engine for one single-user archive
pub struct Spillbox {
    conn: Mutex<Connection>,
    config: SpillboxConfig,
    matcher: Box<dyn ContactMatcher>,
    unsubscribe: Box<dyn UnsubscribeDetector>,
}

impl Spillbox {
    /// Open (creating if needed) the archive stored in `dir`
    ///
    /// - `dir`: Directory holding the metadata and blob databases
    /// - `config`: Filenames and tunables
    pub fn open(dir: impl AsRef<Path>, config: SpillboxConfig) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create archive directory {:?}", dir))?;

        let db_path = dir.join(&config.db_file);
        let blobs_path = dir.join(&config.blobs_file);

        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open database at {:?}", db_path))?;

        let blobs_path = blobs_path
            .to_str()
            .with_context(|| format!("Blob database path is not UTF-8: {:?}", blobs_path))?;

        let store = Self::from_connection(conn, blobs_path, true, config)?;
        info!("[STORE] Opened archive at {:?}", dir);
        Ok(store)
    }

    /// Open a throwaway archive held entirely in memory
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with(SpillboxConfig::default())
    }

    pub fn open_in_memory_with(config: SpillboxConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, ":memory:", false, config)
    }

    fn from_connection(
        mut conn: Connection,
        blobs_target: &str,
        on_disk: bool,
        config: SpillboxConfig,
    ) -> Result<Self> {
        // WAL lets readers proceed while the ingestion pipeline writes.
        // foreign_keys is needed for the REFERENCES clauses to be enforced.
        if on_disk {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                "#,
            )?;
        }
        conn.execute_batch(
            r#"
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;

        conn.execute("ATTACH DATABASE ?1 AS blobs", [blobs_target])
            .context("Failed to attach blob database")?;
        if on_disk {
            conn.execute_batch("PRAGMA blobs.journal_mode = WAL;")?;
        }

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
            config,
            matcher: Box::new(AddressMatcher),
            unsubscribe: Box::new(LinkTextDetector),
        })
    }

    /// Replace the rule deciding which contact an incoming address belongs to
    pub fn with_contact_matcher(mut self, matcher: Box<dyn ContactMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Replace the rule computing `HasUnsubscribe`
    pub fn with_unsubscribe_detector(mut self, detector: Box<dyn UnsubscribeDetector>) -> Self {
        self.unsubscribe = detector;
        self
    }

    pub fn config(&self) -> &SpillboxConfig {
        &self.config
    }

    pub(crate) fn matcher(&self) -> &dyn ContactMatcher {
        self.matcher.as_ref()
    }

    pub(crate) fn unsubscribe_detector(&self) -> &dyn UnsubscribeDetector {
        self.unsubscribe.as_ref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Archive connection mutex poisoned"))
    }

    /// Run `f` in a read transaction
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` in a write transaction, replaying it if another writer holds
    /// the database lock.
    ///
    /// The write lock is taken up front (IMMEDIATE), so every counter read
    /// inside `f` is consistent with the write that consumes it. An error
    /// from `f` rolls back everything it did.
    pub(crate) fn write<T>(&self, mut f: impl FnMut(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            let result = {
                let mut conn = self.lock()?;
                run_write_tx(&mut conn, &mut f)
            };

            match result {
                Err(e) if is_busy(&e) && attempt < self.config.max_tx_retries => {
                    attempt += 1;
                    warn!(
                        "[STORE] Database busy, retrying transaction (attempt {}/{})",
                        attempt, self.config.max_tx_retries
                    );
                    std::thread::sleep(Duration::from_millis(10 * u64::from(attempt)));
                }
                other => return other,
            }
        }
    }
}

fn run_write_tx<T>(
    conn: &mut Connection,
    f: &mut impl FnMut(&Transaction<'_>) -> Result<T>,
) -> Result<T> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Whether an error is SQLite lock contention worth replaying
fn is_busy(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<rusqlite::Error>())
        .filter_map(rusqlite::Error::sqlite_error_code)
        .any(|code| matches!(code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked))
}

/// Unix seconds as stored in the database
pub(crate) fn to_unix(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Hex SHA-256 of `data`
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_both_databases() {
        let dir = tempdir().unwrap();
        let config = SpillboxConfig {
            db_file: "meta.test.sqlite".to_string(),
            blobs_file: "blobs.test.sqlite".to_string(),
            ..SpillboxConfig::default()
        };

        let _store = Spillbox::open(dir.path(), config).unwrap();

        assert!(dir.path().join("meta.test.sqlite").exists());
        assert!(dir.path().join("blobs.test.sqlite").exists());
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempdir().unwrap();
        drop(Spillbox::open(dir.path(), SpillboxConfig::default()).unwrap());
        // Second open must not re-run migration 1 (it would fail on the seed rows)
        Spillbox::open(dir.path(), SpillboxConfig::default()).unwrap();
    }

    #[test]
    fn test_write_rolls_back_on_error() {
        let store = Spillbox::open_in_memory().unwrap();

        let result: Result<()> = store.write(|tx| {
            tx.execute("INSERT INTO Contacts (Hidden, Robot) VALUES (FALSE, FALSE)", [])?;
            Err(anyhow!("boom"))
        });
        assert!(result.is_err());

        let count: i64 = store
            .read(|tx| Ok(tx.query_row("SELECT COUNT(*) FROM Contacts", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_is_busy_detects_lock_errors() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(is_busy(&anyhow::Error::from(busy)));
        assert!(!is_busy(&anyhow!("unrelated")));
    }
}
