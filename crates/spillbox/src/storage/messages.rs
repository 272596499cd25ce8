//! Message store
//!
//! Message lifecycle, parts and address links. Every transition below runs
//! inside one write transaction together with the counter allocations it
//! consumes, so a UID or mod-sequence is only ever spent on a committed
//! change.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::convos::refresh_for_msg;
use super::sqlite::{Spillbox, from_unix, sha256_hex, to_unix};
use super::{blob, contacts, mailboxes};
use crate::config::SpillboxConfig;
use crate::error::StoreError;
use crate::models::{
    AddressId, ContactId, ContactRole, DraftEdit, FiledPosition, FlagOp, Flags, IncomingMessage,
    IncomingPart, MailboxId, Msg, MsgAddress, MsgId, MsgPart, MsgState,
};

const MSG_COLUMNS: &str = "MsgID, StagingID, ModSequence, Seed, RawHash, ConvoID, State, \
     ParseError, MailboxID, UID, Flags, Subject, EncodedSize, Date, Expunged, HdrsBlobID, \
     HasUnsubscribe";

fn msg_from_row(row: &Row<'_>) -> rusqlite::Result<Msg> {
    Ok(Msg {
        id: row.get(0)?,
        staging_id: row.get(1)?,
        mod_sequence: row.get(2)?,
        seed: row.get(3)?,
        raw_hash: row.get(4)?,
        convo_id: row.get(5)?,
        state: row.get(6)?,
        parse_error: row.get(7)?,
        mailbox_id: row.get(8)?,
        uid: row.get(9)?,
        flags: row.get(10)?,
        subject: row.get(11)?,
        encoded_size: row.get(12)?,
        date: from_unix(row.get(13)?),
        expunged: row.get::<_, Option<i64>>(14)?.map(from_unix),
        hdrs_blob_id: row.get(15)?,
        has_unsubscribe: row.get(16)?,
    })
}

pub(crate) fn load(conn: &Connection, id: MsgId) -> Result<Msg> {
    conn.prepare_cached(&format!("SELECT {MSG_COLUMNS} FROM Msgs WHERE MsgID = ?1"))?
        .query_row([id], msg_from_row)
        .optional()?
        .ok_or_else(|| StoreError::not_found(format!("message {id}")).into())
}

fn require_state(msg: &Msg, state: MsgState, op: &'static str) -> Result<()> {
    if msg.state == state {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            msg_id: msg.id,
            state: msg.state,
            op,
        }
        .into())
    }
}

fn ensure_new_staging_id(conn: &Connection, staging_id: i64) -> Result<()> {
    if conn
        .prepare_cached("SELECT 1 FROM Msgs WHERE StagingID = ?1 AND Expunged IS NULL")?
        .exists([staging_id])?
    {
        return Err(StoreError::DuplicateStaging(staging_id).into());
    }
    Ok(())
}

pub(crate) fn create_draft(conn: &Connection, now: DateTime<Utc>) -> Result<MsgId> {
    conn.prepare_cached("INSERT INTO Msgs (Seed, State, Date) VALUES (?1, ?2, ?3)")?
        .execute(params![rand::random::<i64>(), MsgState::Draft, to_unix(now)])?;
    Ok(MsgId::new(conn.last_insert_rowid()))
}

pub(crate) fn update_draft(
    conn: &Connection,
    id: MsgId,
    edit: &DraftEdit,
    now: DateTime<Utc>,
) -> Result<()> {
    let msg = load(conn, id)?;
    require_state(&msg, MsgState::Draft, "edit")?;

    conn.prepare_cached(
        "UPDATE Msgs
         SET Subject = COALESCE(?1, Subject),
             EncodedSize = COALESCE(?2, EncodedSize),
             Date = ?3
         WHERE MsgID = ?4",
    )?
    .execute(params![edit.subject, edit.encoded_size, to_unix(now), id])?;
    Ok(())
}

/// How ingestion of a staged message ended
#[derive(Debug)]
enum IngestOutcome {
    Parsed(MsgId),
    /// The row was kept as Errored and must be committed before reporting
    Errored { msg_id: MsgId, reason: String },
}

fn stage_new(conn: &Connection, incoming: &IncomingMessage, now: DateTime<Utc>) -> Result<MsgId> {
    ensure_new_staging_id(conn, incoming.staging_id)?;

    conn.prepare_cached(
        "INSERT INTO Msgs (StagingID, Seed, RawHash, State, Subject, EncodedSize, Date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?
    .execute(params![
        incoming.staging_id,
        rand::random::<i64>(),
        sha256_hex(&incoming.raw),
        MsgState::Staged,
        incoming.subject,
        incoming.raw.len() as i64,
        to_unix(now),
    ])?;
    Ok(MsgId::new(conn.last_insert_rowid()))
}

/// Turn a draft into a staged message, keeping its row and seed
fn stage_draft(
    conn: &Connection,
    id: MsgId,
    incoming: &IncomingMessage,
    now: DateTime<Utc>,
) -> Result<()> {
    let msg = load(conn, id)?;
    require_state(&msg, MsgState::Draft, "send")?;
    ensure_new_staging_id(conn, incoming.staging_id)?;

    conn.prepare_cached(
        "UPDATE Msgs
         SET StagingID = ?1, RawHash = ?2, State = ?3,
             Subject = COALESCE(?4, Subject), EncodedSize = ?5, Date = ?6
         WHERE MsgID = ?7",
    )?
    .execute(params![
        incoming.staging_id,
        sha256_hex(&incoming.raw),
        MsgState::Staged,
        incoming.subject,
        incoming.raw.len() as i64,
        to_unix(now),
        id,
    ])?;
    Ok(())
}

/// Check the flattened part list handed over by the parser
fn validate_parts(parts: &[IncomingPart]) -> std::result::Result<(), String> {
    if parts.is_empty() {
        return Err("no MIME parts".to_string());
    }
    for (position, part) in parts.iter().enumerate() {
        if part.part_num as usize != position {
            return Err(format!(
                "part numbers must run 0, 1, 2, ...: found part {} at position {}",
                part.part_num, position
            ));
        }
        if part.is_body && part.is_attachment {
            return Err(format!(
                "part {} is both a body and an attachment",
                part.part_num
            ));
        }
    }
    Ok(())
}

fn count_lines(content: &[u8]) -> i64 {
    let newlines = content.iter().filter(|&&b| b == b'\n').count();
    let partial = !content.is_empty() && !content.ends_with(b"\n");
    (newlines + usize::from(partial)) as i64
}

/// Compress a body part when it is large enough and compression pays off
fn maybe_compress(config: &SpillboxConfig, part: &IncomingPart) -> Result<Option<Vec<u8>>> {
    if !config.compress_bodies || !part.is_body || part.content.len() < config.compress_min_size {
        return Ok(None);
    }
    let compressed = zstd::bulk::compress(&part.content, config.compression_level)
        .with_context(|| format!("Failed to compress part {}", part.part_num))?;
    Ok((compressed.len() < part.content.len()).then_some(compressed))
}

fn store_part(
    conn: &Connection,
    config: &SpillboxConfig,
    msg_id: MsgId,
    part: &IncomingPart,
) -> Result<()> {
    let compressed = maybe_compress(config, part)?;
    let stored = compressed.as_deref().unwrap_or(&part.content[..]);
    let blob_id = blob::put(conn, stored)?;

    conn.prepare_cached(
        "INSERT INTO MsgParts (
            MsgID, PartNum, Name, IsBody, IsAttachment, IsCompressed, CompressedSize,
            ContentType, ContentID, BlobID,
            ContentTransferEncoding, ContentTransferSize, ContentTransferLines
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
    )?
    .execute(params![
        msg_id,
        part.part_num,
        part.name,
        part.is_body,
        part.is_attachment,
        compressed.is_some(),
        compressed.as_ref().map(|c| c.len() as i64),
        part.content_type,
        part.content_id,
        blob_id,
        part.content_transfer_encoding,
        part.content.len() as i64,
        count_lines(&part.content),
    ])?;
    Ok(())
}

/// Staged -> Parsed, or Staged -> Errored when the parts are malformed
fn parse_staged(
    conn: &Connection,
    store: &Spillbox,
    msg_id: MsgId,
    incoming: &IncomingMessage,
) -> Result<IngestOutcome> {
    if let Err(reason) = validate_parts(&incoming.parts) {
        conn.prepare_cached("UPDATE Msgs SET State = ?1, ParseError = ?2 WHERE MsgID = ?3")?
            .execute(params![MsgState::Errored, reason, msg_id])?;
        return Ok(IngestOutcome::Errored { msg_id, reason });
    }

    let hdrs_blob_id = incoming
        .headers
        .as_deref()
        .map(|headers| blob::put(conn, headers))
        .transpose()?;

    let detector = store.unsubscribe_detector();
    let mut has_unsubscribe = false;
    for part in &incoming.parts {
        store_part(conn, store.config(), msg_id, part)?;
        if !has_unsubscribe && part.is_body && part.is_html() {
            has_unsubscribe = detector.has_unsubscribe(&String::from_utf8_lossy(&part.content));
        }
    }

    let mut sent_by_owner = false;
    let mut recipients = Vec::new();
    for (role, email) in &incoming.addresses {
        let address = contacts::resolve(
            conn,
            store.matcher(),
            email.name.as_deref(),
            &email.email,
        )?;
        conn.prepare_cached(
            "INSERT OR IGNORE INTO MsgAddresses (MsgID, AddressID, Role) VALUES (?1, ?2, ?3)",
        )?
        .execute(params![msg_id, address.id, role])?;

        if role.is_recipient() {
            recipients.push(address.id);
        } else if *role == ContactRole::From && address.contact_id == ContactId::OWNER {
            sent_by_owner = true;
        }
    }

    // Mail the owner sent makes its recipients visible
    if sent_by_owner {
        for address_id in recipients {
            contacts::mark_visible(conn, address_id)?;
        }
    }

    conn.prepare_cached(
        "UPDATE Msgs SET State = ?1, HdrsBlobID = ?2, HasUnsubscribe = ?3 WHERE MsgID = ?4",
    )?
    .execute(params![MsgState::Parsed, hdrs_blob_id, has_unsubscribe, msg_id])?;

    Ok(IngestOutcome::Parsed(msg_id))
}

fn file(conn: &Connection, id: MsgId, mailbox_id: MailboxId) -> Result<FiledPosition> {
    let msg = load(conn, id)?;
    match msg.state {
        MsgState::Parsed => {}
        MsgState::Filed => return Err(StoreError::AlreadyFiled(id).into()),
        state => {
            return Err(StoreError::InvalidTransition {
                msg_id: id,
                state,
                op: "file",
            }
            .into());
        }
    }

    place(conn, &msg, mailbox_id, Flags::new())
}

/// Give a message a fresh UID and mod-sequence in `mailbox_id`
fn place(conn: &Connection, msg: &Msg, mailbox_id: MailboxId, flags: Flags) -> Result<FiledPosition> {
    let (_, name) = mailboxes::load_live(conn, mailbox_id)?;
    let uid = mailboxes::next_uid(conn, mailbox_id)?;
    let mod_sequence = mailboxes::next_mod_sequence(conn, &name)?;

    conn.prepare_cached(
        "UPDATE Msgs
         SET MailboxID = ?1, UID = ?2, ModSequence = ?3, Flags = ?4, State = ?5
         WHERE MsgID = ?6",
    )?
    .execute(params![
        mailbox_id,
        uid,
        mod_sequence,
        flags,
        MsgState::Filed,
        msg.id
    ])?;

    refresh_for_msg(conn, msg.id)?;

    Ok(FiledPosition {
        mailbox_id,
        uid,
        mod_sequence,
    })
}

/// A filed message whose mailbox is still live, with that mailbox's name
fn load_filed(conn: &Connection, id: MsgId, op: &'static str) -> Result<(Msg, String)> {
    let msg = load(conn, id)?;
    require_state(&msg, MsgState::Filed, op)?;
    let mailbox_id = msg
        .mailbox_id
        .ok_or_else(|| StoreError::not_found(format!("mailbox of message {id}")))?;
    let (_, name) = mailboxes::load_live(conn, mailbox_id)?;
    Ok((msg, name))
}

/// Move a filed message. The source mailbox keeps an expunged row at the
/// old UID, stamped with a fresh mod-sequence of the source name, so its
/// clients see the removal in order.
fn move_to(
    conn: &Connection,
    id: MsgId,
    mailbox_id: MailboxId,
    now: DateTime<Utc>,
) -> Result<FiledPosition> {
    let (msg, source_name) = load_filed(conn, id, "move")?;
    let flags = msg.flags.clone().unwrap_or_default();
    let position = place(conn, &msg, mailbox_id, flags)?;

    // Allocated after the destination so moving within one mailbox still
    // stamps the removal above the new filing
    let removal = mailboxes::next_mod_sequence(conn, &source_name)?;
    conn.prepare_cached(
        "INSERT INTO Msgs (
            StagingID, ModSequence, Seed, RawHash, State, MailboxID, UID, Flags,
            Subject, EncodedSize, Date, Expunged
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )?
    .execute(params![
        msg.staging_id,
        removal,
        msg.seed,
        msg.raw_hash,
        MsgState::Expunged,
        msg.mailbox_id,
        msg.uid,
        msg.flags,
        msg.subject,
        msg.encoded_size,
        to_unix(msg.date),
        to_unix(now),
    ])?;

    Ok(position)
}

fn store_flags(conn: &Connection, id: MsgId, op: FlagOp, change: &Flags) -> Result<(Flags, i64)> {
    let (msg, name) = load_filed(conn, id, "store flags on")?;
    let flags = msg.flags.unwrap_or_default().apply(op, change);
    let mod_sequence = mailboxes::next_mod_sequence(conn, &name)?;

    conn.prepare_cached("UPDATE Msgs SET Flags = ?1, ModSequence = ?2 WHERE MsgID = ?3")?
        .execute(params![flags, mod_sequence, id])?;

    refresh_for_msg(conn, id)?;
    Ok((flags, mod_sequence))
}

fn expunge(conn: &Connection, id: MsgId, now: DateTime<Utc>) -> Result<i64> {
    let (_, name) = load_filed(conn, id, "expunge")?;
    mark_expunged(conn, id, &name, now)
}

/// Expunge a filed message whose mailbox is currently called `name`
pub(crate) fn mark_expunged(
    conn: &Connection,
    id: MsgId,
    name: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    let mod_sequence = mailboxes::next_mod_sequence(conn, name)?;

    conn.prepare_cached(
        "UPDATE Msgs SET Expunged = ?1, ModSequence = ?2, State = ?3 WHERE MsgID = ?4",
    )?
    .execute(params![to_unix(now), mod_sequence, MsgState::Expunged, id])?;

    refresh_for_msg(conn, id)?;
    Ok(mod_sequence)
}

fn parts(conn: &Connection, id: MsgId) -> Result<Vec<MsgPart>> {
    load(conn, id)?;
    let parts = conn
        .prepare_cached(
            "SELECT MsgID, PartNum, Name, IsBody, IsAttachment, IsCompressed, CompressedSize,
                    ContentType, ContentID, BlobID,
                    ContentTransferEncoding, ContentTransferSize, ContentTransferLines
             FROM MsgParts
             WHERE MsgID = ?1
             ORDER BY PartNum",
        )?
        .query_map([id], |row| {
            Ok(MsgPart {
                msg_id: row.get(0)?,
                part_num: row.get(1)?,
                name: row.get(2)?,
                is_body: row.get(3)?,
                is_attachment: row.get(4)?,
                is_compressed: row.get(5)?,
                compressed_size: row.get(6)?,
                content_type: row.get(7)?,
                content_id: row.get(8)?,
                blob_id: row.get(9)?,
                content_transfer_encoding: row.get(10)?,
                content_transfer_size: row.get(11)?,
                content_transfer_lines: row.get(12)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts)
}

fn addresses(conn: &Connection, id: MsgId) -> Result<Vec<MsgAddress>> {
    load(conn, id)?;
    let links: Vec<(ContactRole, AddressId)> = conn
        .prepare_cached(
            "SELECT Role, AddressID FROM MsgAddresses WHERE MsgID = ?1 ORDER BY Role, AddressID",
        )?
        .query_map([id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    links
        .into_iter()
        .map(|(role, address_id)| {
            Ok(MsgAddress {
                role,
                address: contacts::get_address(conn, address_id)?,
            })
        })
        .collect()
}

impl Spillbox {
    /// Start a new draft
    pub fn create_draft(&self) -> Result<MsgId> {
        let id = self.write(|tx| create_draft(tx, Utc::now()))?;
        debug!("[MSG] Created draft {}", id);
        Ok(id)
    }

    /// Edit a draft in place and bump its date
    pub fn update_draft(&self, id: MsgId, edit: &DraftEdit) -> Result<()> {
        self.write(|tx| update_draft(tx, id, edit, Utc::now()))
    }

    /// Store a server-received message and its parser decomposition.
    ///
    /// Fails with `DuplicateStaging` when a live message already has the
    /// staging ID. A malformed part list fails with `ParseFailure`, but the
    /// message is still committed as Errored with the reason recorded.
    pub fn ingest(&self, incoming: IncomingMessage) -> Result<MsgId> {
        let outcome = self.write(|tx| {
            let msg_id = stage_new(tx, &incoming, Utc::now())?;
            parse_staged(tx, self, msg_id, &incoming)
        })?;
        self.finish_ingest(outcome)
    }

    /// Send a draft: it is staged with the given content and parsed through
    /// the same path as received mail.
    pub fn send_draft(&self, id: MsgId, incoming: IncomingMessage) -> Result<MsgId> {
        let outcome = self.write(|tx| {
            stage_draft(tx, id, &incoming, Utc::now())?;
            parse_staged(tx, self, id, &incoming)
        })?;
        self.finish_ingest(outcome)
    }

    fn finish_ingest(&self, outcome: IngestOutcome) -> Result<MsgId> {
        match outcome {
            IngestOutcome::Parsed(msg_id) => {
                debug!("[MSG] Ingested message {}", msg_id);
                Ok(msg_id)
            }
            IngestOutcome::Errored { msg_id, reason } => {
                warn!("[MSG] Message {} kept as errored: {}", msg_id, reason);
                Err(StoreError::ParseFailure { msg_id, reason }.into())
            }
        }
    }

    /// File a parsed message, assigning its UID and mod-sequence
    pub fn file_into_mailbox(&self, id: MsgId, mailbox_id: MailboxId) -> Result<FiledPosition> {
        let position = self.write(|tx| file(tx, id, mailbox_id))?;
        debug!(
            "[MSG] Filed message {} into mailbox {} as UID {} (modseq {})",
            id, position.mailbox_id, position.uid, position.mod_sequence
        );
        Ok(position)
    }

    /// Move a filed message. It gets a new UID and mod-sequence in the
    /// destination and keeps its flags.
    pub fn move_to_mailbox(&self, id: MsgId, mailbox_id: MailboxId) -> Result<FiledPosition> {
        let position = self.write(|tx| move_to(tx, id, mailbox_id, Utc::now()))?;
        info!("[MSG] Moved message {} to mailbox {}", id, mailbox_id);
        Ok(position)
    }

    /// IMAP STORE. Returns the resulting flags and the new mod-sequence.
    pub fn store_flags(&self, id: MsgId, op: FlagOp, flags: &Flags) -> Result<(Flags, i64)> {
        self.write(|tx| store_flags(tx, id, op, flags))
    }

    /// Replace a filed message's flags, returning the new mod-sequence
    pub fn set_flags(&self, id: MsgId, flags: &Flags) -> Result<i64> {
        let (_, mod_sequence) = self.store_flags(id, FlagOp::Replace, flags)?;
        Ok(mod_sequence)
    }

    /// Mark a filed message expunged, returning the mod-sequence of the
    /// removal. Its rows and blobs stay until swept.
    pub fn expunge(&self, id: MsgId) -> Result<i64> {
        let mod_sequence = self.write(|tx| expunge(tx, id, Utc::now()))?;
        debug!("[MSG] Expunged message {} (modseq {})", id, mod_sequence);
        Ok(mod_sequence)
    }

    pub fn get_msg(&self, id: MsgId) -> Result<Msg> {
        self.read(|tx| load(tx, id))
    }

    /// Stored parts of a message, in order
    pub fn msg_parts(&self, id: MsgId) -> Result<Vec<MsgPart>> {
        self.read(|tx| parts(tx, id))
    }

    pub fn msg_addresses(&self, id: MsgId) -> Result<Vec<MsgAddress>> {
        self.read(|tx| addresses(tx, id))
    }

    /// Decoded content of one part, decompressed if needed
    pub fn read_part(&self, id: MsgId, part_num: u32) -> Result<Vec<u8>> {
        self.read(|tx| {
            let part = parts(tx, id)?
                .into_iter()
                .find(|p| p.part_num == part_num)
                .ok_or_else(|| StoreError::not_found(format!("part {part_num} of message {id}")))?;
            let blob_id = part
                .blob_id
                .ok_or_else(|| StoreError::not_found(format!("content of part {part_num}")))?;

            let stored = blob::get(tx, blob_id)?;
            if part.is_compressed {
                zstd::stream::decode_all(stored.as_slice())
                    .with_context(|| format!("Failed to decompress part {part_num} of message {id}"))
            } else {
                Ok(stored)
            }
        })
    }
}
