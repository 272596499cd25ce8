//! Conversations, their participants and labels

use anyhow::{Context, Result};
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, params};

use super::sqlite::{Spillbox, from_unix};
use crate::error::StoreError;
use crate::models::{
    ContactId, Convo, ConvoId, ConvoParticipant, ConvoSummary, Flags, Label, LabelId, MsgId,
};

fn ensure_convo(conn: &Connection, id: ConvoId) -> Result<()> {
    if conn
        .prepare_cached("SELECT 1 FROM Convos WHERE ConvoID = ?1")?
        .exists([id])?
    {
        Ok(())
    } else {
        Err(StoreError::not_found(format!("convo {id}")).into())
    }
}

/// Link a message into a conversation, creating one when `convo_id` is
/// `None`. The message's contacts join the conversation's participants.
pub(crate) fn attach(conn: &Connection, msg_id: MsgId, convo_id: Option<ConvoId>) -> Result<ConvoId> {
    if !conn
        .prepare_cached("SELECT 1 FROM Msgs WHERE MsgID = ?1")?
        .exists([msg_id])?
    {
        return Err(StoreError::not_found(format!("message {msg_id}")).into());
    }

    let convo_id = match convo_id {
        Some(id) => {
            ensure_convo(conn, id)?;
            id
        }
        None => {
            conn.execute("INSERT INTO Convos (ConvoSummary) VALUES (NULL)", [])?;
            ConvoId::new(conn.last_insert_rowid())
        }
    };

    let previous: Option<ConvoId> = conn
        .prepare_cached("SELECT ConvoID FROM Msgs WHERE MsgID = ?1")?
        .query_row([msg_id], |row| row.get(0))?;

    conn.prepare_cached("UPDATE Msgs SET ConvoID = ?1 WHERE MsgID = ?2")?
        .execute(params![convo_id, msg_id])?;

    conn.prepare_cached(
        "INSERT OR IGNORE INTO ConvoContacts (ConvoID, ContactID)
         SELECT DISTINCT ?1, a.ContactID
         FROM MsgAddresses ma
         JOIN Addresses a ON a.AddressID = ma.AddressID
         WHERE ma.MsgID = ?2",
    )?
    .execute(params![convo_id, msg_id])?;

    refresh_summary(conn, convo_id)?;
    if let Some(previous) = previous.filter(|p| *p != convo_id) {
        rebuild_contacts(conn, previous)?;
        refresh_summary(conn, previous)?;
    }

    debug!("[CONVO] Message {} attached to convo {}", msg_id, convo_id);
    Ok(convo_id)
}

/// Derive a conversation's participants again from the messages still in it
fn rebuild_contacts(conn: &Connection, id: ConvoId) -> Result<()> {
    conn.prepare_cached("DELETE FROM ConvoContacts WHERE ConvoID = ?1")?
        .execute([id])?;
    conn.prepare_cached(
        "INSERT OR IGNORE INTO ConvoContacts (ConvoID, ContactID)
         SELECT DISTINCT m.ConvoID, a.ContactID
         FROM Msgs m
         JOIN MsgAddresses ma ON ma.MsgID = m.MsgID
         JOIN Addresses a ON a.AddressID = ma.AddressID
         WHERE m.ConvoID = ?1",
    )?
    .execute([id])?;
    Ok(())
}

/// Recompute and store the cached summary of a conversation
pub(crate) fn refresh_summary(conn: &Connection, id: ConvoId) -> Result<ConvoSummary> {
    let mut summary = ConvoSummary::default();

    let mut stmt = conn.prepare_cached(
        "SELECT Subject, Date, Flags, HasUnsubscribe
         FROM Msgs
         WHERE ConvoID = ?1 AND Expunged IS NULL
         ORDER BY Date, MsgID",
    )?;
    let rows = stmt
        .query_map([id], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<Flags>>(2)?,
                row.get::<_, bool>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (subject, date, flags, has_unsubscribe) in rows {
        let date = from_unix(date);
        summary.msg_count += 1;
        summary.first_date.get_or_insert(date);
        summary.last_date = Some(date);
        summary.has_unsubscribe |= has_unsubscribe;
        if summary.subject.is_none() {
            summary.subject = subject.filter(|s| !s.is_empty());
        }
        if flags.is_some_and(|flags| !flags.contains(Flags::SEEN)) {
            summary.unread_count += 1;
        }
    }

    // One line per participant, shown with their default address
    summary.participants = conn
        .prepare_cached(
            "SELECT cc.ContactID, a.Name, a.Address
             FROM ConvoContacts cc
             JOIN Addresses a ON a.AddressID = (
                 SELECT AddressID FROM Addresses
                 WHERE ContactID = cc.ContactID
                 ORDER BY DefaultAddr DESC, AddressID
                 LIMIT 1
             )
             WHERE cc.ConvoID = ?1
             ORDER BY cc.ContactID",
        )?
        .query_map([id], |row| {
            Ok(ConvoParticipant {
                contact_id: row.get(0)?,
                name: row.get(1)?,
                address: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    conn.prepare_cached("UPDATE Convos SET ConvoSummary = ?1 WHERE ConvoID = ?2")?
        .execute(params![serde_json::to_string(&summary)?, id])?;

    Ok(summary)
}

/// Refresh the summary of the conversation a message belongs to, if any
pub(crate) fn refresh_for_msg(conn: &Connection, msg_id: MsgId) -> Result<()> {
    let convo_id: Option<ConvoId> = conn
        .prepare_cached("SELECT ConvoID FROM Msgs WHERE MsgID = ?1")?
        .query_row([msg_id], |row| row.get(0))
        .optional()?
        .flatten();
    if let Some(convo_id) = convo_id {
        refresh_summary(conn, convo_id)?;
    }
    Ok(())
}

fn get_convo(conn: &Connection, id: ConvoId) -> Result<Convo> {
    let summary: Option<String> = conn
        .prepare_cached("SELECT ConvoSummary FROM Convos WHERE ConvoID = ?1")?
        .query_row([id], |row| row.get(0))
        .optional()?
        .ok_or_else(|| StoreError::not_found(format!("convo {id}")))?;

    let summary = match summary {
        Some(json) => serde_json::from_str(&json)
            .with_context(|| format!("Failed to decode summary of convo {id}"))?,
        None => ConvoSummary::default(),
    };

    Ok(Convo { id, summary })
}

fn load_label(conn: &Connection, id: LabelId) -> Result<Option<Label>> {
    Ok(conn
        .prepare_cached("SELECT LabelID, Label FROM Labels WHERE LabelID = ?1")?
        .query_row([id], |row| {
            Ok(Label {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })
        .optional()?)
}

fn live_label(conn: &Connection, id: LabelId) -> Result<Label> {
    match load_label(conn, id)? {
        Some(label) if !label.is_deleted() => Ok(label),
        _ => Err(StoreError::UnknownLabel(id).into()),
    }
}

fn label_name_taken(conn: &Connection, name: &str) -> Result<bool> {
    Ok(conn
        .prepare_cached("SELECT 1 FROM Labels WHERE Label = ?1")?
        .exists([name])?)
}

pub(crate) fn set_label(
    conn: &Connection,
    convo_id: ConvoId,
    label_id: LabelId,
    present: bool,
) -> Result<()> {
    ensure_convo(conn, convo_id)?;

    if present {
        live_label(conn, label_id)?;
        conn.prepare_cached("INSERT OR IGNORE INTO ConvoLabels (LabelID, ConvoID) VALUES (?1, ?2)")?
            .execute(params![label_id, convo_id])?;
    } else {
        // Removing a deleted label from a convo is still allowed
        if load_label(conn, label_id)?.is_none() {
            return Err(StoreError::UnknownLabel(label_id).into());
        }
        conn.prepare_cached("DELETE FROM ConvoLabels WHERE LabelID = ?1 AND ConvoID = ?2")?
            .execute(params![label_id, convo_id])?;
    }

    Ok(())
}

impl Spillbox {
    /// Put a message into a conversation. With `None` a new one is created.
    pub fn attach_to_convo(&self, msg_id: MsgId, convo_id: Option<ConvoId>) -> Result<ConvoId> {
        self.write(|tx| attach(tx, msg_id, convo_id))
    }

    pub fn get_convo(&self, id: ConvoId) -> Result<Convo> {
        self.read(|tx| get_convo(tx, id))
    }

    /// Recompute a conversation's cached summary
    pub fn refresh_convo_summary(&self, id: ConvoId) -> Result<ConvoSummary> {
        self.write(|tx| {
            ensure_convo(tx, id)?;
            refresh_summary(tx, id)
        })
    }

    pub fn convo_contacts(&self, id: ConvoId) -> Result<Vec<ContactId>> {
        self.read(|tx| {
            ensure_convo(tx, id)?;
            let contacts = tx
                .prepare_cached(
                    "SELECT ContactID FROM ConvoContacts WHERE ConvoID = ?1 ORDER BY ContactID",
                )?
                .query_map([id], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(contacts)
        })
    }

    /// Tag or untag a conversation.
    ///
    /// Tagging with a deleted label fails with `UnknownLabel`.
    pub fn set_label(&self, convo_id: ConvoId, label_id: LabelId, present: bool) -> Result<()> {
        self.write(|tx| set_label(tx, convo_id, label_id, present))
    }

    /// Labels on a conversation, deleted ones included
    pub fn convo_labels(&self, id: ConvoId) -> Result<Vec<Label>> {
        self.read(|tx| {
            ensure_convo(tx, id)?;
            let labels = tx
                .prepare_cached(
                    "SELECT l.LabelID, l.Label
                     FROM ConvoLabels cl
                     JOIN Labels l ON l.LabelID = cl.LabelID
                     WHERE cl.ConvoID = ?1
                     ORDER BY l.LabelID",
                )?
                .query_map([id], |row| {
                    Ok(Label {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(labels)
        })
    }

    pub fn create_label(&self, name: &str) -> Result<LabelId> {
        let id = self.write(|tx| {
            if label_name_taken(tx, name)? {
                return Err(StoreError::NameConflict(name.to_string()).into());
            }
            tx.execute("INSERT INTO Labels (Label) VALUES (?1)", [name])?;
            Ok(LabelId::new(tx.last_insert_rowid()))
        })?;
        info!("[CONVO] Created label {:?} ({})", name, id);
        Ok(id)
    }

    pub fn rename_label(&self, id: LabelId, name: &str) -> Result<()> {
        self.write(|tx| {
            let label = live_label(tx, id)?;
            if label.name.as_deref() == Some(name) {
                return Ok(());
            }
            if label_name_taken(tx, name)? {
                return Err(StoreError::NameConflict(name.to_string()).into());
            }
            tx.execute(
                "UPDATE Labels SET Label = ?1 WHERE LabelID = ?2",
                params![name, id],
            )?;
            Ok(())
        })
    }

    /// Soft-delete a label. Existing convo links are kept for history.
    pub fn delete_label(&self, id: LabelId) -> Result<()> {
        self.write(|tx| {
            live_label(tx, id)?;
            tx.execute("UPDATE Labels SET Label = NULL WHERE LabelID = ?1", [id])?;
            Ok(())
        })?;
        info!("[CONVO] Deleted label {}", id);
        Ok(())
    }

    /// Live labels ordered by ID
    pub fn list_labels(&self) -> Result<Vec<Label>> {
        self.read(|tx| {
            let labels = tx
                .prepare_cached(
                    "SELECT LabelID, Label FROM Labels WHERE Label IS NOT NULL ORDER BY LabelID",
                )?
                .query_map([], |row| {
                    Ok(Label {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(labels)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::store_error;
    use crate::models::{ContactRole, EmailAddress, IncomingMessage, IncomingPart};

    fn ingest(store: &Spillbox, staging_id: i64, from: &str, subject: &str) -> MsgId {
        let incoming = IncomingMessage::builder(staging_id, format!("Subject: {subject}\r\n\r\nhi"))
            .subject(subject)
            .address(ContactRole::From, EmailAddress::new(from))
            .address(ContactRole::To, EmailAddress::with_name("Me", "me@example.com"))
            .part(IncomingPart::body(0, "text/plain", "hi"))
            .build();
        store.ingest(incoming).unwrap()
    }

    #[test]
    fn test_attach_creates_convo_with_participants() {
        let store = Spillbox::open_in_memory().unwrap();
        let msg = ingest(&store, 1, "ada@example.com", "Engines");

        let convo_id = store.attach_to_convo(msg, None).unwrap();
        let convo = store.get_convo(convo_id).unwrap();

        assert_eq!(convo.summary.subject.as_deref(), Some("Engines"));
        assert_eq!(convo.summary.msg_count, 1);
        assert_eq!(convo.summary.participants.len(), 2);
        assert_eq!(store.convo_contacts(convo_id).unwrap().len(), 2);
        assert_eq!(store.get_msg(msg).unwrap().convo_id, Some(convo_id));
    }

    #[test]
    fn test_attach_is_idempotent_for_contacts() {
        let store = Spillbox::open_in_memory().unwrap();
        let first = ingest(&store, 1, "ada@example.com", "Engines");
        let reply = ingest(&store, 2, "ada@example.com", "Re: Engines");

        let convo_id = store.attach_to_convo(first, None).unwrap();
        store.attach_to_convo(reply, Some(convo_id)).unwrap();
        store.attach_to_convo(reply, Some(convo_id)).unwrap();

        let convo = store.get_convo(convo_id).unwrap();
        assert_eq!(convo.summary.msg_count, 2);
        assert_eq!(convo.summary.subject.as_deref(), Some("Engines"));
        assert_eq!(store.convo_contacts(convo_id).unwrap().len(), 2);
    }

    #[test]
    fn test_reattach_drops_participants_from_old_convo() {
        let store = Spillbox::open_in_memory().unwrap();
        let first = ingest(&store, 1, "ada@example.com", "Engines");
        let stray = ingest(&store, 2, "charles@example.com", "Looms");

        let old_convo = store.attach_to_convo(first, None).unwrap();
        store.attach_to_convo(stray, Some(old_convo)).unwrap();
        assert_eq!(store.convo_contacts(old_convo).unwrap().len(), 3);

        let new_convo = store.attach_to_convo(stray, None).unwrap();

        let charles = store
            .msg_addresses(stray)
            .unwrap()
            .into_iter()
            .find(|a| a.role == ContactRole::From)
            .unwrap()
            .address
            .contact_id;
        let old_contacts = store.convo_contacts(old_convo).unwrap();
        assert_eq!(old_contacts.len(), 2);
        assert!(!old_contacts.contains(&charles));
        assert!(store.convo_contacts(new_convo).unwrap().contains(&charles));

        let summary = store.get_convo(old_convo).unwrap().summary;
        assert_eq!(summary.msg_count, 1);
        assert!(summary.participants.iter().all(|p| p.contact_id != charles));
    }

    #[test]
    fn test_attach_unknown_convo() {
        let store = Spillbox::open_in_memory().unwrap();
        let msg = ingest(&store, 1, "ada@example.com", "Hi");

        let err = store.attach_to_convo(msg, Some(ConvoId::new(42))).unwrap_err();
        assert!(matches!(store_error(&err), Some(StoreError::NotFound(_))));
    }

    #[test]
    fn test_seeded_labels() {
        let store = Spillbox::open_in_memory().unwrap();
        let names: Vec<_> = store
            .list_labels()
            .unwrap()
            .into_iter()
            .filter_map(|l| l.name)
            .collect();
        assert_eq!(names, ["Personal Mail", "Subscriptions", "Spam and Trash"]);
    }

    #[test]
    fn test_set_label_and_remove() {
        let store = Spillbox::open_in_memory().unwrap();
        let msg = ingest(&store, 1, "ada@example.com", "Hi");
        let convo_id = store.attach_to_convo(msg, None).unwrap();

        store.set_label(convo_id, LabelId::new(1), true).unwrap();
        store.set_label(convo_id, LabelId::new(1), true).unwrap();
        assert_eq!(store.convo_labels(convo_id).unwrap().len(), 1);

        store.set_label(convo_id, LabelId::new(1), false).unwrap();
        assert!(store.convo_labels(convo_id).unwrap().is_empty());
    }

    #[test]
    fn test_deleted_label_rejected_but_history_kept() {
        let store = Spillbox::open_in_memory().unwrap();
        let msg = ingest(&store, 1, "ada@example.com", "Hi");
        let convo_id = store.attach_to_convo(msg, None).unwrap();

        let label = store.create_label("Travel").unwrap();
        store.set_label(convo_id, label, true).unwrap();
        store.delete_label(label).unwrap();

        let err = store.set_label(convo_id, label, true).unwrap_err();
        assert_eq!(store_error(&err), Some(&StoreError::UnknownLabel(label)));

        let labels = store.convo_labels(convo_id).unwrap();
        assert_eq!(labels.len(), 1);
        assert!(labels[0].is_deleted());

        // The name is free again
        store.create_label("Travel").unwrap();
    }

    #[test]
    fn test_label_name_conflicts() {
        let store = Spillbox::open_in_memory().unwrap();
        let err = store.create_label("Subscriptions").unwrap_err();
        assert!(matches!(store_error(&err), Some(StoreError::NameConflict(_))));

        let err = store.rename_label(LabelId::new(1), "Subscriptions").unwrap_err();
        assert!(matches!(store_error(&err), Some(StoreError::NameConflict(_))));

        store.rename_label(LabelId::new(1), "Friends").unwrap();
    }

    #[test]
    fn test_unknown_label() {
        let store = Spillbox::open_in_memory().unwrap();
        let msg = ingest(&store, 1, "ada@example.com", "Hi");
        let convo_id = store.attach_to_convo(msg, None).unwrap();

        let err = store.set_label(convo_id, LabelId::new(99), true).unwrap_err();
        assert_eq!(store_error(&err), Some(&StoreError::UnknownLabel(LabelId::new(99))));
    }
}
