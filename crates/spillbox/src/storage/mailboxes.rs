//! Mailbox sequencing: UIDs, mod-sequences and UIDVALIDITY
//!
//! IMAP identifies a message by (mailbox name, UIDVALIDITY, UID) and orders
//! changes by mod-sequence. None of these may ever be handed out twice:
//!
//! - `NextUID` belongs to the mailbox row and only counts up.
//! - `UIDValidity` is set to max(UIDValidity over every mailbox ever) + 1 on
//!   create and on rename, never derived from the mailbox's own old value.
//! - `NextModSequence` belongs to the *name* (MailboxSequencing), so a
//!   mailbox deleted and re-created under the same name keeps counting up.

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::messages;
use super::sqlite::Spillbox;
use crate::error::StoreError;
use crate::models::{
    Flags, Mailbox, MailboxAttrs, MailboxId, MailboxInfo, MailboxMessage, MessageQuery, MsgId,
};

const MAILBOX_COLUMNS: &str =
    "MailboxID, Name, DeletedName, NextUID, UIDValidity, Attrs, Subscribed";

fn mailbox_from_row(row: &Row<'_>) -> rusqlite::Result<Mailbox> {
    Ok(Mailbox {
        id: row.get(0)?,
        name: row.get(1)?,
        deleted_name: row.get(2)?,
        next_uid: row.get(3)?,
        uid_validity: row.get(4)?,
        attrs: MailboxAttrs::from_bits_truncate(row.get(5)?),
        subscribed: row.get(6)?,
    })
}

pub(crate) fn load(conn: &Connection, id: MailboxId) -> Result<Mailbox> {
    conn.prepare_cached(&format!(
        "SELECT {MAILBOX_COLUMNS} FROM Mailboxes WHERE MailboxID = ?1"
    ))?
    .query_row([id], mailbox_from_row)
    .optional()?
    .ok_or_else(|| StoreError::not_found(format!("mailbox {id}")).into())
}

/// Load a mailbox that has not been deleted, returning it with its name
pub(crate) fn load_live(conn: &Connection, id: MailboxId) -> Result<(Mailbox, String)> {
    let mailbox = load(conn, id)?;
    match mailbox.name.clone() {
        Some(name) => Ok((mailbox, name)),
        None => Err(StoreError::not_found(format!("mailbox {id} (deleted)")).into()),
    }
}

fn live_by_name(conn: &Connection, name: &str) -> Result<Option<Mailbox>> {
    Ok(conn
        .prepare_cached(&format!(
            "SELECT {MAILBOX_COLUMNS} FROM Mailboxes WHERE Name = ?1"
        ))?
        .query_row([name], mailbox_from_row)
        .optional()?)
}

fn next_uid_validity(conn: &Connection) -> Result<u32> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(UIDValidity), 0) + 1 FROM Mailboxes",
        [],
        |row| row.get(0),
    )?)
}

/// Make sure `name` has a sequencing row whose next value is at least
/// `floor`. Existing rows are never lowered.
fn ensure_sequencing(conn: &Connection, name: &str, floor: i64) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO MailboxSequencing (Name, NextModSequence) VALUES (?1, ?2)
         ON CONFLICT (Name) DO UPDATE
            SET NextModSequence = MAX(NextModSequence, excluded.NextModSequence)",
    )?
    .execute(params![name, floor])?;
    Ok(())
}

fn peek_mod_sequence(conn: &Connection, name: &str) -> Result<Option<i64>> {
    Ok(conn
        .prepare_cached("SELECT NextModSequence FROM MailboxSequencing WHERE Name = ?1")?
        .query_row([name], |row| row.get(0))
        .optional()?)
}

pub(crate) fn create(conn: &Connection, name: &str, attrs: MailboxAttrs) -> Result<MailboxId> {
    if live_by_name(conn, name)?.is_some() {
        return Err(StoreError::NameConflict(name.to_string()).into());
    }

    let uid_validity = next_uid_validity(conn)?;
    conn.execute(
        "INSERT INTO Mailboxes (NextUID, UIDValidity, Attrs, Name, Subscribed)
         VALUES (1, ?1, ?2, ?3, FALSE)",
        params![uid_validity, attrs.bits(), name],
    )?;
    let id = MailboxId::new(conn.last_insert_rowid());

    ensure_sequencing(conn, name, 1)?;

    Ok(id)
}

pub(crate) fn rename(conn: &Connection, id: MailboxId, new_name: &str) -> Result<u32> {
    let (_, old_name) = load_live(conn, id)?;

    if live_by_name(conn, new_name)?.is_some() {
        return Err(StoreError::NameConflict(new_name.to_string()).into());
    }

    // Messages already in this mailbox carry mod-sequences from the old
    // name; the new name must hand out larger ones.
    let carried = peek_mod_sequence(conn, &old_name)?.unwrap_or(1);

    let uid_validity = next_uid_validity(conn)?;
    conn.execute(
        "UPDATE Mailboxes SET Name = ?1, UIDValidity = ?2 WHERE MailboxID = ?3",
        params![new_name, uid_validity, id],
    )?;

    ensure_sequencing(conn, new_name, carried)?;

    Ok(uid_validity)
}

/// Mark a mailbox deleted, expunging the messages still in it. Returns the
/// old name and how many messages were expunged.
pub(crate) fn delete(
    conn: &Connection,
    id: MailboxId,
    now: DateTime<Utc>,
) -> Result<(String, usize)> {
    let (_, name) = load_live(conn, id)?;

    let live: Vec<MsgId> = conn
        .prepare_cached(
            "SELECT MsgID FROM Msgs WHERE MailboxID = ?1 AND Expunged IS NULL ORDER BY UID",
        )?
        .query_map([id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for msg_id in &live {
        messages::mark_expunged(conn, *msg_id, &name, now)?;
    }

    // MailboxSequencing stays: whoever reuses the name continues its counter
    conn.execute(
        "UPDATE Mailboxes SET DeletedName = Name, Name = NULL, Subscribed = FALSE
         WHERE MailboxID = ?1",
        [id],
    )?;

    Ok((name, live.len()))
}

/// Hand out the mailbox's next UID
pub(crate) fn next_uid(conn: &Connection, id: MailboxId) -> Result<u32> {
    let (mailbox, _) = load_live(conn, id)?;
    conn.prepare_cached("UPDATE Mailboxes SET NextUID = NextUID + 1 WHERE MailboxID = ?1")?
        .execute([id])?;
    debug!("[MAILBOX] Mailbox {} handed out UID {}", id, mailbox.next_uid);
    Ok(mailbox.next_uid)
}

/// Hand out the next mod-sequence for a mailbox name
pub(crate) fn next_mod_sequence(conn: &Connection, name: &str) -> Result<i64> {
    let value = peek_mod_sequence(conn, name)?
        .ok_or_else(|| StoreError::not_found(format!("mod-sequence for mailbox {name:?}")))?;
    conn.prepare_cached(
        "UPDATE MailboxSequencing SET NextModSequence = NextModSequence + 1 WHERE Name = ?1",
    )?
    .execute([name])?;
    Ok(value)
}

fn list(conn: &Connection) -> Result<Vec<MailboxInfo>> {
    let mut stmt = conn.prepare(
        "SELECT m.MailboxID, m.Name, m.UIDValidity, m.NextUID, m.Attrs, m.Subscribed,
                COALESCE(s.NextModSequence, 1)
         FROM Mailboxes m
         LEFT JOIN MailboxSequencing s ON s.Name = m.Name
         WHERE m.Name IS NOT NULL
         ORDER BY m.Name",
    )?;

    let mailboxes = stmt
        .query_map([], |row| {
            Ok(MailboxInfo {
                id: row.get(0)?,
                name: row.get(1)?,
                uid_validity: row.get(2)?,
                next_uid: row.get(3)?,
                attrs: MailboxAttrs::from_bits_truncate(row.get(4)?),
                subscribed: row.get(5)?,
                highest_mod_sequence: row.get::<_, i64>(6)? - 1,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(mailboxes)
}

fn list_messages(
    conn: &Connection,
    id: MailboxId,
    query: &MessageQuery,
) -> Result<Vec<MailboxMessage>> {
    load(conn, id)?;

    let mut stmt = conn.prepare_cached(
        "SELECT MsgID, UID, ModSequence, Flags, Expunged IS NOT NULL
         FROM Msgs
         WHERE MailboxID = ?1
           AND UID >= ?2 AND UID <= ?3
           AND ((?4 IS NULL AND Expunged IS NULL)
                OR (?4 IS NOT NULL AND ModSequence > ?4))
         ORDER BY UID",
    )?;

    let messages = stmt
        .query_map(
            params![
                id,
                query.min_uid.unwrap_or(1),
                query.max_uid.unwrap_or(u32::MAX),
                query.changed_since,
            ],
            |row| {
                Ok(MailboxMessage {
                    msg_id: row.get(0)?,
                    uid: row.get(1)?,
                    mod_sequence: row.get(2)?,
                    flags: row.get::<_, Option<Flags>>(3)?.unwrap_or_default(),
                    expunged: row.get(4)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(messages)
}

impl Spillbox {
    /// Create a mailbox; fails with `NameConflict` if a live mailbox has `name`
    pub fn create_mailbox(&self, name: &str) -> Result<MailboxId> {
        self.create_mailbox_with_attrs(name, MailboxAttrs::empty())
    }

    pub fn create_mailbox_with_attrs(&self, name: &str, attrs: MailboxAttrs) -> Result<MailboxId> {
        let id = self.write(|tx| create(tx, name, attrs))?;
        info!("[MAILBOX] Created mailbox {:?} ({})", name, id);
        Ok(id)
    }

    /// Rename a mailbox, bumping its UIDVALIDITY. Returns the new UIDVALIDITY.
    pub fn rename_mailbox(&self, id: MailboxId, new_name: &str) -> Result<u32> {
        let uid_validity = self.write(|tx| rename(tx, id, new_name))?;
        info!(
            "[MAILBOX] Renamed mailbox {} to {:?} (UIDVALIDITY {})",
            id, new_name, uid_validity
        );
        Ok(uid_validity)
    }

    /// Mark a mailbox deleted and expunge what it still holds. Its name's
    /// mod-sequence counter is kept.
    pub fn delete_mailbox(&self, id: MailboxId) -> Result<()> {
        let (name, expunged) = self.write(|tx| delete(tx, id, Utc::now()))?;
        info!(
            "[MAILBOX] Deleted mailbox {:?} ({}), expunged {} messages",
            name, id, expunged
        );
        Ok(())
    }

    /// Atomically take the next UID of a mailbox
    pub fn next_uid(&self, id: MailboxId) -> Result<u32> {
        self.write(|tx| next_uid(tx, id))
    }

    /// Atomically take the next mod-sequence of a mailbox name
    pub fn next_mod_sequence(&self, name: &str) -> Result<i64> {
        self.write(|tx| next_mod_sequence(tx, name))
    }

    /// A mailbox by ID, including deleted ones
    pub fn get_mailbox(&self, id: MailboxId) -> Result<Mailbox> {
        self.read(|tx| load(tx, id))
    }

    /// The live mailbox called `name`, if any
    pub fn mailbox_by_name(&self, name: &str) -> Result<Option<Mailbox>> {
        self.read(|tx| live_by_name(tx, name))
    }

    /// Live mailboxes ordered by name
    pub fn list_mailboxes(&self) -> Result<Vec<MailboxInfo>> {
        self.read(|tx| list(tx))
    }

    pub fn set_subscribed(&self, id: MailboxId, subscribed: bool) -> Result<()> {
        self.write(|tx| {
            load_live(tx, id)?;
            tx.execute(
                "UPDATE Mailboxes SET Subscribed = ?1 WHERE MailboxID = ?2",
                params![subscribed, id],
            )?;
            Ok(())
        })
    }

    pub fn set_mailbox_attrs(&self, id: MailboxId, attrs: MailboxAttrs) -> Result<()> {
        self.write(|tx| {
            load_live(tx, id)?;
            tx.execute(
                "UPDATE Mailboxes SET Attrs = ?1 WHERE MailboxID = ?2",
                params![attrs.bits(), id],
            )?;
            Ok(())
        })
    }

    /// Messages filed in a mailbox, ordered by UID.
    ///
    /// Without `changed_since` only live messages are returned. With it,
    /// every message stamped after that mod-sequence is returned, expunged
    /// ones included, so a client can apply removals in order.
    pub fn list_messages(&self, id: MailboxId, query: &MessageQuery) -> Result<Vec<MailboxMessage>> {
        self.read(|tx| list_messages(tx, id, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::store_error;

    fn conflict(err: &anyhow::Error) -> bool {
        matches!(store_error(err), Some(StoreError::NameConflict(_)))
    }

    #[test]
    fn test_create_assigns_increasing_uid_validity() {
        let store = Spillbox::open_in_memory().unwrap();

        let inbox = store.create_mailbox("INBOX").unwrap();
        let sent = store.create_mailbox("Sent").unwrap();

        let inbox = store.get_mailbox(inbox).unwrap();
        let sent = store.get_mailbox(sent).unwrap();
        assert_eq!(inbox.uid_validity, 1);
        assert_eq!(sent.uid_validity, 2);
        assert_eq!(inbox.next_uid, 1);
    }

    #[test]
    fn test_create_duplicate_name() {
        let store = Spillbox::open_in_memory().unwrap();
        store.create_mailbox("INBOX").unwrap();

        let err = store.create_mailbox("INBOX").unwrap_err();
        assert!(conflict(&err));
    }

    #[test]
    fn test_rename_bumps_past_global_max() {
        let store = Spillbox::open_in_memory().unwrap();
        let a = store.create_mailbox("A").unwrap();
        store.create_mailbox("B").unwrap();
        store.create_mailbox("C").unwrap();

        // A's own value is 1, but the new value must clear every mailbox
        assert_eq!(store.rename_mailbox(a, "A2").unwrap(), 4);
        assert_eq!(store.get_mailbox(a).unwrap().uid_validity, 4);
    }

    #[test]
    fn test_rename_to_taken_name() {
        let store = Spillbox::open_in_memory().unwrap();
        let a = store.create_mailbox("A").unwrap();
        store.create_mailbox("B").unwrap();

        let err = store.rename_mailbox(a, "B").unwrap_err();
        assert!(conflict(&err));
        assert_eq!(store.get_mailbox(a).unwrap().name.as_deref(), Some("A"));
    }

    #[test]
    fn test_deleted_name_is_reusable() {
        let store = Spillbox::open_in_memory().unwrap();
        let old = store.create_mailbox("Archive").unwrap();
        store.delete_mailbox(old).unwrap();

        let deleted = store.get_mailbox(old).unwrap();
        assert!(deleted.is_deleted());
        assert_eq!(deleted.deleted_name.as_deref(), Some("Archive"));

        let new = store.create_mailbox("Archive").unwrap();
        assert_ne!(old, new);
        assert!(store.get_mailbox(new).unwrap().uid_validity > deleted.uid_validity);
    }

    #[test]
    fn test_deleted_mailbox_rejects_operations() {
        let store = Spillbox::open_in_memory().unwrap();
        let id = store.create_mailbox("Old").unwrap();
        store.delete_mailbox(id).unwrap();

        for err in [
            store.next_uid(id).unwrap_err(),
            store.rename_mailbox(id, "New").unwrap_err(),
            store.delete_mailbox(id).unwrap_err(),
        ] {
            assert!(matches!(store_error(&err), Some(StoreError::NotFound(_))));
        }
    }

    #[test]
    fn test_next_uid_counts_up() {
        let store = Spillbox::open_in_memory().unwrap();
        let id = store.create_mailbox("INBOX").unwrap();

        assert_eq!(store.next_uid(id).unwrap(), 1);
        assert_eq!(store.next_uid(id).unwrap(), 2);
        assert_eq!(store.get_mailbox(id).unwrap().next_uid, 3);
    }

    #[test]
    fn test_mod_sequence_survives_delete_and_recreate() {
        let store = Spillbox::open_in_memory().unwrap();
        let id = store.create_mailbox("Lists").unwrap();

        assert_eq!(store.next_mod_sequence("Lists").unwrap(), 1);
        assert_eq!(store.next_mod_sequence("Lists").unwrap(), 2);

        store.delete_mailbox(id).unwrap();
        store.create_mailbox("Lists").unwrap();

        assert_eq!(store.next_mod_sequence("Lists").unwrap(), 3);
    }

    #[test]
    fn test_mod_sequence_unknown_name() {
        let store = Spillbox::open_in_memory().unwrap();
        let err = store.next_mod_sequence("Nowhere").unwrap_err();
        assert!(matches!(store_error(&err), Some(StoreError::NotFound(_))));
    }

    #[test]
    fn test_list_mailboxes_skips_deleted() {
        let store = Spillbox::open_in_memory().unwrap();
        let inbox = store.create_mailbox("INBOX").unwrap();
        let junk = store.create_mailbox_with_attrs("Junk", MailboxAttrs::JUNK).unwrap();
        store.set_subscribed(inbox, true).unwrap();
        store.next_mod_sequence("INBOX").unwrap();
        store.delete_mailbox(junk).unwrap();

        let listing = store.list_mailboxes().unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "INBOX");
        assert!(listing[0].subscribed);
        assert_eq!(listing[0].highest_mod_sequence, 1);
    }

    #[test]
    fn test_set_attrs() {
        let store = Spillbox::open_in_memory().unwrap();
        let id = store.create_mailbox("Drafts").unwrap();
        store
            .set_mailbox_attrs(id, MailboxAttrs::DRAFTS | MailboxAttrs::HAS_NO_CHILDREN)
            .unwrap();

        let mailbox = store.mailbox_by_name("Drafts").unwrap().unwrap();
        assert!(mailbox.attrs.contains(MailboxAttrs::DRAFTS));
    }
}
