//! Content-addressed blob storage
//!
//! Blobs are keyed by the SHA-256 of their exact bytes. A put of content
//! that already exists as a live blob returns the existing row. Blobs are
//! never rewritten: they are tombstoned, and garbage collection later erases
//! the content of tombstoned blobs no live message references.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, params};

use super::sqlite::{Spillbox, from_unix, sha256_hex, to_unix};
use crate::error::StoreError;
use crate::models::{BlobId, BlobInfo, GcStats, SweepStats};

/// Store `data`, reusing the live blob with the same hash if there is one
pub(crate) fn put(conn: &Connection, data: &[u8]) -> Result<BlobId> {
    let sha256 = sha256_hex(data);

    // The partial unique index turns a concurrent identical put into a
    // no-op here; both callers then read back the same row.
    let inserted = conn
        .prepare_cached(
            "INSERT INTO blobs.Blobs (SHA256, Content) VALUES (?1, ?2)
             ON CONFLICT (SHA256) WHERE Deleted IS NULL DO NOTHING",
        )?
        .execute(params![sha256, data])?;

    let id: BlobId = conn
        .prepare_cached("SELECT BlobID FROM blobs.Blobs WHERE SHA256 = ?1 AND Deleted IS NULL")?
        .query_row([&sha256], |row| row.get(0))?;

    if inserted == 0 {
        debug!("[BLOB] Dedup hit for {} -> blob {}", sha256, id);
    }

    Ok(id)
}

/// Read a blob's content.
///
/// A tombstoned blob stays readable until garbage collection erases it, so
/// readers that looked up the reference before the tombstone still succeed.
pub(crate) fn get(conn: &Connection, id: BlobId) -> Result<Vec<u8>> {
    let content: Option<Option<Vec<u8>>> = conn
        .prepare_cached("SELECT Content FROM blobs.Blobs WHERE BlobID = ?1")?
        .query_row([id], |row| row.get(0))
        .optional()?;

    match content {
        Some(Some(content)) => Ok(content),
        Some(None) => Err(StoreError::not_found(format!("blob {id} (erased)")).into()),
        None => Err(StoreError::not_found(format!("blob {id}")).into()),
    }
}

pub(crate) fn info(conn: &Connection, id: BlobId) -> Result<BlobInfo> {
    conn.prepare_cached(
        "SELECT BlobID, SHA256, Deleted, length(Content) FROM blobs.Blobs WHERE BlobID = ?1",
    )?
    .query_row([id], |row| {
        Ok(BlobInfo {
            id: row.get(0)?,
            sha256: row.get(1)?,
            deleted: row.get::<_, Option<i64>>(2)?.map(from_unix),
            size: row.get(3)?,
        })
    })
    .optional()?
    .ok_or_else(|| StoreError::not_found(format!("blob {id}")).into())
}

/// Mark a blob deleted. Tombstoning twice keeps the first timestamp.
pub(crate) fn tombstone(conn: &Connection, id: BlobId, now: DateTime<Utc>) -> Result<()> {
    let updated = conn
        .prepare_cached("UPDATE blobs.Blobs SET Deleted = ?1 WHERE BlobID = ?2 AND Deleted IS NULL")?
        .execute(params![to_unix(now), id])?;

    if updated == 0 {
        // Already tombstoned is fine; absent is not
        info(conn, id)?;
    }
    Ok(())
}

/// Live messages (expunged ones do not count) referencing a blob
fn live_references(conn: &Connection, id: BlobId) -> Result<i64> {
    Ok(conn
        .prepare_cached(
            "SELECT
                (SELECT COUNT(*) FROM MsgParts p JOIN Msgs m ON m.MsgID = p.MsgID
                  WHERE p.BlobID = ?1 AND m.Expunged IS NULL)
              + (SELECT COUNT(*) FROM Msgs WHERE HdrsBlobID = ?1 AND Expunged IS NULL)",
        )?
        .query_row([id], |row| row.get(0))?)
}

/// Tombstone every live blob referenced only by expunged messages
pub(crate) fn sweep_expunged(conn: &Connection, now: DateTime<Utc>) -> Result<SweepStats> {
    let tombstoned = conn.execute(
        "UPDATE blobs.Blobs SET Deleted = ?1
         WHERE Deleted IS NULL
           AND BlobID IN (
                SELECT p.BlobID FROM MsgParts p JOIN Msgs m ON m.MsgID = p.MsgID
                 WHERE m.Expunged IS NOT NULL AND p.BlobID IS NOT NULL
                UNION
                SELECT HdrsBlobID FROM Msgs
                 WHERE Expunged IS NOT NULL AND HdrsBlobID IS NOT NULL)
           AND BlobID NOT IN (
                SELECT p.BlobID FROM MsgParts p JOIN Msgs m ON m.MsgID = p.MsgID
                 WHERE m.Expunged IS NULL AND p.BlobID IS NOT NULL
                UNION
                SELECT HdrsBlobID FROM Msgs
                 WHERE Expunged IS NULL AND HdrsBlobID IS NOT NULL)",
        [to_unix(now)],
    )?;

    Ok(SweepStats { tombstoned })
}

/// One GC batch: blobs after `after`, tombstoned before `cutoff`, content
/// still present. Returns the last BlobID looked at, or `None` when done.
fn collect_batch(
    conn: &Connection,
    cutoff: DateTime<Utc>,
    after: BlobId,
    limit: usize,
    stats: &mut GcStats,
) -> Result<Option<BlobId>> {
    let candidates: Vec<BlobId> = conn
        .prepare_cached(
            "SELECT BlobID FROM blobs.Blobs
             WHERE Deleted IS NOT NULL AND Deleted < ?1
               AND Content IS NOT NULL AND BlobID > ?2
             ORDER BY BlobID
             LIMIT ?3",
        )?
        .query_map(params![to_unix(cutoff), after, limit as i64], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let Some(&last) = candidates.last() else {
        return Ok(None);
    };

    for id in candidates {
        stats.examined += 1;
        if live_references(conn, id)? > 0 {
            stats.referenced += 1;
            continue;
        }
        conn.prepare_cached("UPDATE blobs.Blobs SET Content = NULL WHERE BlobID = ?1")?
            .execute([id])?;
        stats.erased += 1;
    }

    Ok(Some(last))
}

impl Spillbox {
    /// Store content, deduplicating by SHA-256 against live blobs
    pub fn put_blob(&self, data: &[u8]) -> Result<BlobId> {
        self.write(|tx| put(tx, data))
    }

    /// Read a blob; fails with `NotFound` if absent or erased
    pub fn get_blob(&self, id: BlobId) -> Result<Vec<u8>> {
        self.read(|tx| get(tx, id))
    }

    pub fn blob_info(&self, id: BlobId) -> Result<BlobInfo> {
        self.read(|tx| info(tx, id))
    }

    /// Whether a blob's content can still be read
    pub fn blob_exists(&self, id: BlobId) -> Result<bool> {
        self.read(|tx| match info(tx, id) {
            Ok(info) => Ok(!info.is_erased()),
            Err(e) if matches!(e.downcast_ref::<StoreError>(), Some(StoreError::NotFound(_))) => {
                Ok(false)
            }
            Err(e) => Err(e),
        })
    }

    /// Mark a blob deleted; content stays until garbage collection
    pub fn tombstone_blob(&self, id: BlobId) -> Result<()> {
        self.write(|tx| tombstone(tx, id, Utc::now()))
    }

    /// Tombstone the content that only expunged messages still reference
    pub fn sweep_expunged(&self) -> Result<SweepStats> {
        let stats = self.write(|tx| sweep_expunged(tx, Utc::now()))?;
        info!("[GC] Tombstoned {} blobs of expunged messages", stats.tombstoned);
        Ok(stats)
    }

    /// Erase content of blobs tombstoned before `now - grace` that no live
    /// message references.
    ///
    /// Work is committed in batches of `gc_batch_size`. Setting `cancel`
    /// stops the run between batches; everything already erased stays
    /// erased and a later run picks up the rest.
    pub fn garbage_collect(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
        cancel: Option<&AtomicBool>,
    ) -> Result<GcStats> {
        let cutoff = now - grace;
        let limit = self.config().gc_batch_size.max(1);
        let mut stats = GcStats::default();
        let mut after = BlobId::new(0);

        loop {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                info!("[GC] Cancelled after examining {} blobs", stats.examined);
                stats.cancelled = true;
                break;
            }

            let mut batch = GcStats::default();
            let last = self.write(|tx| {
                batch = GcStats::default();
                collect_batch(tx, cutoff, after, limit, &mut batch)
            })?;

            stats.examined += batch.examined;
            stats.erased += batch.erased;
            stats.referenced += batch.referenced;

            match last {
                Some(id) => after = id,
                None => break,
            }
        }

        info!(
            "[GC] Examined {} blobs, erased {}, {} still referenced",
            stats.examined, stats.erased, stats.referenced
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::store_error;

    #[test]
    fn test_put_is_idempotent() {
        let store = Spillbox::open_in_memory().unwrap();

        let a = store.put_blob(b"hello").unwrap();
        let b = store.put_blob(b"hello").unwrap();
        let c = store.put_blob(b"world").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);

        let rows: i64 = store
            .read(|tx| Ok(tx.query_row("SELECT COUNT(*) FROM blobs.Blobs", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[test]
    fn test_get_missing() {
        let store = Spillbox::open_in_memory().unwrap();

        let err = store.get_blob(BlobId::new(42)).unwrap_err();
        assert!(matches!(store_error(&err), Some(StoreError::NotFound(_))));
        assert!(!store.blob_exists(BlobId::new(42)).unwrap());
    }

    #[test]
    fn test_put_after_tombstone_creates_new_row() {
        let store = Spillbox::open_in_memory().unwrap();

        let old = store.put_blob(b"content").unwrap();
        store.tombstone_blob(old).unwrap();
        let new = store.put_blob(b"content").unwrap();

        assert_ne!(old, new);
        assert_eq!(store.blob_info(old).unwrap().sha256, store.blob_info(new).unwrap().sha256);
    }

    #[test]
    fn test_tombstone_then_gc_respects_grace() {
        let store = Spillbox::open_in_memory().unwrap();
        let id = store.put_blob(b"attachment bytes").unwrap();
        store.tombstone_blob(id).unwrap();

        let grace = Duration::hours(1);

        // Inside the grace interval the content is still readable
        let stats = store.garbage_collect(Utc::now(), grace, None).unwrap();
        assert_eq!(stats.erased, 0);
        assert_eq!(store.get_blob(id).unwrap(), b"attachment bytes");

        // Past it, the content is erased
        let later = Utc::now() + grace + Duration::seconds(5);
        let stats = store.garbage_collect(later, grace, None).unwrap();
        assert_eq!(stats.erased, 1);

        let err = store.get_blob(id).unwrap_err();
        assert!(matches!(store_error(&err), Some(StoreError::NotFound(_))));

        // Re-running is a no-op for erased rows
        let stats = store.garbage_collect(later, grace, None).unwrap();
        assert_eq!(stats.examined, 0);
    }

    #[test]
    fn test_gc_cancelled_before_start() {
        let store = Spillbox::open_in_memory().unwrap();
        let id = store.put_blob(b"x").unwrap();
        store.tombstone_blob(id).unwrap();

        let cancel = AtomicBool::new(true);
        let later = Utc::now() + Duration::days(2);
        let stats = store
            .garbage_collect(later, Duration::days(1), Some(&cancel))
            .unwrap();

        assert!(stats.cancelled);
        assert_eq!(stats.erased, 0);
        assert!(store.blob_exists(id).unwrap());
    }

    #[test]
    fn test_gc_runs_in_batches() {
        let config = crate::SpillboxConfig {
            gc_batch_size: 2,
            ..Default::default()
        };
        let store = Spillbox::open_in_memory_with(config).unwrap();

        for i in 0..5u8 {
            let id = store.put_blob(&[i]).unwrap();
            store.tombstone_blob(id).unwrap();
        }

        let later = Utc::now() + Duration::days(2);
        let stats = store.garbage_collect(later, Duration::days(1), None).unwrap();
        assert_eq!(stats.examined, 5);
        assert_eq!(stats.erased, 5);
    }

    #[test]
    fn test_tombstone_missing_blob() {
        let store = Spillbox::open_in_memory().unwrap();
        let err = store.tombstone_blob(BlobId::new(9)).unwrap_err();
        assert!(matches!(store_error(&err), Some(StoreError::NotFound(_))));
    }
}
