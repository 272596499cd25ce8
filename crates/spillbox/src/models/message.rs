//! Message model: lifecycle state, flags, flattened MIME parts, and the
//! ingestion input handed over by an external MIME parser

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{Address, BlobId, ContactRole, ConvoId, EmailAddress, MailboxId, MsgId};

/// Message lifecycle.
///
/// ```text
/// Draft -> Staged -> Parsed -> Filed -> Expunged
///            |         |
///            +---------+--> Errored
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgState {
    Draft,
    Staged,
    Parsed,
    Filed,
    Expunged,
    Errored,
}

impl MsgState {
    pub fn as_i64(self) -> i64 {
        match self {
            MsgState::Draft => 0,
            MsgState::Staged => 1,
            MsgState::Parsed => 2,
            MsgState::Filed => 3,
            MsgState::Expunged => 4,
            MsgState::Errored => 5,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(MsgState::Draft),
            1 => Some(MsgState::Staged),
            2 => Some(MsgState::Parsed),
            3 => Some(MsgState::Filed),
            4 => Some(MsgState::Expunged),
            5 => Some(MsgState::Errored),
            _ => None,
        }
    }
}

impl fmt::Display for MsgState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MsgState::Draft => "draft",
            MsgState::Staged => "staged",
            MsgState::Parsed => "parsed",
            MsgState::Filed => "filed",
            MsgState::Expunged => "expunged",
            MsgState::Errored => "errored",
        };
        f.write_str(name)
    }
}

impl ToSql for MsgState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_i64()))
    }
}

impl FromSql for MsgState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = i64::column_result(value)?;
        MsgState::from_i64(raw).ok_or(FromSqlError::OutOfRange(raw))
    }
}

/// IMAP flags of a filed message.
///
/// Persisted as a JSON object mapping each set flag to 1, e.g.
/// `{"\\Seen": 1, "$Forwarded": 1}`. Entries with a zero value are ignored
/// when reading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags(BTreeSet<String>);

impl Flags {
    pub const SEEN: &'static str = "\\Seen";
    pub const ANSWERED: &'static str = "\\Answered";
    pub const FLAGGED: &'static str = "\\Flagged";
    pub const DELETED: &'static str = "\\Deleted";
    pub const DRAFT: &'static str = "\\Draft";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, flag: &str) -> bool {
        self.0.contains(flag)
    }

    pub fn insert(&mut self, flag: impl Into<String>) {
        self.0.insert(flag.into());
    }

    pub fn remove(&mut self, flag: &str) {
        self.0.remove(flag);
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Result of applying a STORE operation to these flags
    pub fn apply(&self, op: FlagOp, flags: &Flags) -> Flags {
        match op {
            FlagOp::Replace => flags.clone(),
            FlagOp::Add => Flags(self.0.union(&flags.0).cloned().collect()),
            FlagOp::Remove => Flags(self.0.difference(&flags.0).cloned().collect()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl<S: Into<String>> FromIterator<S> for Flags {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Flags(iter.into_iter().map(Into::into).collect())
    }
}

impl Serialize for Flags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for flag in &self.0 {
            map.serialize_entry(flag, &1)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Flags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, i64>::deserialize(deserializer)?;
        Ok(Flags(
            raw.into_iter()
                .filter(|(_, set)| *set != 0)
                .map(|(flag, _)| flag)
                .collect(),
        ))
    }
}

impl ToSql for Flags {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let json = self
            .to_json()
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        Ok(ToSqlOutput::from(json))
    }
}

impl FromSql for Flags {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Flags::from_json(value.as_str()?).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// How a STORE applies its flag list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOp {
    /// FLAGS
    Replace,
    /// +FLAGS
    Add,
    /// -FLAGS
    Remove,
}

/// A message row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Msg {
    pub id: MsgId,
    /// Server staging ID; `None` for drafts
    pub staging_id: Option<i64>,
    /// Mod-sequence stamped by the last protocol-visible mutation
    pub mod_sequence: Option<i64>,
    /// Random seed for idempotent reprocessing
    pub seed: i64,
    /// SHA-256 of the raw input; `None` for drafts
    pub raw_hash: Option<String>,
    pub convo_id: Option<ConvoId>,
    pub state: MsgState,
    pub parse_error: Option<String>,
    pub mailbox_id: Option<MailboxId>,
    pub uid: Option<u32>,
    pub flags: Option<Flags>,
    pub subject: Option<String>,
    pub encoded_size: i64,
    /// Server receipt time, or last edit time for drafts
    pub date: DateTime<Utc>,
    pub expunged: Option<DateTime<Utc>>,
    pub hdrs_blob_id: Option<BlobId>,
    pub has_unsubscribe: bool,
}

impl Msg {
    pub fn is_draft(&self) -> bool {
        self.state == MsgState::Draft
    }

    pub fn is_expunged(&self) -> bool {
        self.expunged.is_some()
    }
}

/// One stored leaf of a message's MIME tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgPart {
    pub msg_id: MsgId,
    pub part_num: u32,
    pub name: String,
    /// Text or HTML body of the email
    pub is_body: bool,
    pub is_attachment: bool,
    /// Blob content is zstd compressed
    pub is_compressed: bool,
    pub compressed_size: Option<i64>,
    pub content_type: Option<String>,
    /// MIME header Content-ID
    pub content_id: Option<String>,
    pub blob_id: Option<BlobId>,
    pub content_transfer_encoding: Option<String>,
    /// Size of the decoded content
    pub content_transfer_size: i64,
    pub content_transfer_lines: i64,
}

/// An address link of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgAddress {
    pub role: ContactRole,
    pub address: Address,
}

/// One flattened MIME leaf produced by the external parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingPart {
    /// Position in the flattened tree; must run 0, 1, 2, ...
    pub part_num: u32,
    pub name: String,
    pub is_body: bool,
    pub is_attachment: bool,
    pub content_type: Option<String>,
    pub content_id: Option<String>,
    pub content_transfer_encoding: Option<String>,
    /// Decoded content
    pub content: Vec<u8>,
}

impl IncomingPart {
    /// A rendered text or HTML body
    pub fn body(part_num: u32, content_type: &str, content: impl Into<Vec<u8>>) -> Self {
        Self {
            part_num,
            name: String::new(),
            is_body: true,
            is_attachment: false,
            content_type: Some(content_type.to_string()),
            content_id: None,
            content_transfer_encoding: Some("quoted-printable".to_string()),
            content: content.into(),
        }
    }

    /// A named attachment
    pub fn attachment(
        part_num: u32,
        name: &str,
        content_type: &str,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            part_num,
            name: name.to_string(),
            is_body: false,
            is_attachment: true,
            content_type: Some(content_type.to_string()),
            content_id: None,
            content_transfer_encoding: Some("base64".to_string()),
            content: content.into(),
        }
    }

    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with("text/html"))
    }
}

/// Ingestion input: raw bytes plus the parser's decomposition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub staging_id: i64,
    pub raw: Vec<u8>,
    /// Raw header block, stored as a blob when present
    pub headers: Option<Vec<u8>>,
    pub subject: Option<String>,
    pub addresses: Vec<(ContactRole, EmailAddress)>,
    pub parts: Vec<IncomingPart>,
}

impl IncomingMessage {
    pub fn builder(staging_id: i64, raw: impl Into<Vec<u8>>) -> IncomingMessageBuilder {
        IncomingMessageBuilder {
            msg: IncomingMessage {
                staging_id,
                raw: raw.into(),
                headers: None,
                subject: None,
                addresses: Vec::new(),
                parts: Vec::new(),
            },
        }
    }
}

/// Builder for [`IncomingMessage`]
pub struct IncomingMessageBuilder {
    msg: IncomingMessage,
}

impl IncomingMessageBuilder {
    pub fn headers(mut self, headers: impl Into<Vec<u8>>) -> Self {
        self.msg.headers = Some(headers.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.msg.subject = Some(subject.into());
        self
    }

    pub fn address(mut self, role: ContactRole, address: EmailAddress) -> Self {
        self.msg.addresses.push((role, address));
        self
    }

    pub fn part(mut self, part: IncomingPart) -> Self {
        self.msg.parts.push(part);
        self
    }

    pub fn build(self) -> IncomingMessage {
        self.msg
    }
}

/// In-place edit of a draft
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DraftEdit {
    pub subject: Option<String>,
    pub encoded_size: Option<i64>,
}
