//! Mailbox model and the protocol-facing read model over it

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::{Flags, MailboxId, MsgId};

bitflags! {
    /// IMAP LIST attributes (RFC 3501, RFC 5258, RFC 6154)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct MailboxAttrs: u32 {
        const NOINFERIORS = 1 << 0;
        const NOSELECT = 1 << 1;
        const MARKED = 1 << 2;
        const UNMARKED = 1 << 3;
        const HAS_CHILDREN = 1 << 4;
        const HAS_NO_CHILDREN = 1 << 5;
        const ALL = 1 << 6;
        const ARCHIVE = 1 << 7;
        const DRAFTS = 1 << 8;
        const FLAGGED = 1 << 9;
        const JUNK = 1 << 10;
        const SENT = 1 << 11;
        const TRASH = 1 << 12;
    }
}

impl MailboxAttrs {
    /// Attribute names as they appear in a LIST response
    pub fn imap_names(self) -> Vec<&'static str> {
        const NAMES: &[(MailboxAttrs, &str)] = &[
            (MailboxAttrs::NOINFERIORS, "\\Noinferiors"),
            (MailboxAttrs::NOSELECT, "\\Noselect"),
            (MailboxAttrs::MARKED, "\\Marked"),
            (MailboxAttrs::UNMARKED, "\\Unmarked"),
            (MailboxAttrs::HAS_CHILDREN, "\\HasChildren"),
            (MailboxAttrs::HAS_NO_CHILDREN, "\\HasNoChildren"),
            (MailboxAttrs::ALL, "\\All"),
            (MailboxAttrs::ARCHIVE, "\\Archive"),
            (MailboxAttrs::DRAFTS, "\\Drafts"),
            (MailboxAttrs::FLAGGED, "\\Flagged"),
            (MailboxAttrs::JUNK, "\\Junk"),
            (MailboxAttrs::SENT, "\\Sent"),
            (MailboxAttrs::TRASH, "\\Trash"),
        ];

        NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

/// A mailbox row, live or deleted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: MailboxId,
    /// Current name; `None` once deleted
    pub name: Option<String>,
    /// Name the mailbox had when it was deleted
    pub deleted_name: Option<String>,
    pub next_uid: u32,
    pub uid_validity: u32,
    pub attrs: MailboxAttrs,
    pub subscribed: bool,
}

impl Mailbox {
    pub fn is_deleted(&self) -> bool {
        self.name.is_none()
    }
}

/// One entry of a mailbox listing (LIST/STATUS)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxInfo {
    pub id: MailboxId,
    pub name: String,
    pub uid_validity: u32,
    pub next_uid: u32,
    pub attrs: MailboxAttrs,
    pub subscribed: bool,
    /// HIGHESTMODSEQ; 0 when nothing has been handed out under this name
    pub highest_mod_sequence: i64,
}

/// Filter for listing the messages filed in a mailbox
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageQuery {
    /// Lowest UID to return
    pub min_uid: Option<u32>,
    /// Highest UID to return
    pub max_uid: Option<u32>,
    /// CONDSTORE CHANGEDSINCE: only rows stamped after this mod-sequence,
    /// expunged rows included
    pub changed_since: Option<i64>,
}

impl MessageQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn uids(min: u32, max: u32) -> Self {
        Self {
            min_uid: Some(min),
            max_uid: Some(max),
            changed_since: None,
        }
    }

    pub fn changed_since(mod_sequence: i64) -> Self {
        Self {
            changed_since: Some(mod_sequence),
            ..Self::default()
        }
    }
}

/// A message as the mailbox protocol sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxMessage {
    pub msg_id: MsgId,
    pub uid: u32,
    pub mod_sequence: i64,
    pub flags: Flags,
    pub expunged: bool,
}

/// Where a message landed after filing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiledPosition {
    pub mailbox_id: MailboxId,
    pub uid: u32,
    pub mod_sequence: i64,
}
