//! Conversations and labels

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ContactId, ConvoId, LabelId};

/// A user-defined tag (e.g. "Personal Mail")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: LabelId,
    /// `None` once the label has been deleted
    pub name: Option<String>,
}

impl Label {
    pub fn is_deleted(&self) -> bool {
        self.name.is_none()
    }
}

/// A participant as shown in a conversation summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvoParticipant {
    pub contact_id: ContactId,
    pub name: Option<String>,
    pub address: String,
}

/// Cached summary of a conversation, stored as JSON on the convo row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvoSummary {
    /// Subject of the earliest message that has one
    #[serde(default)]
    pub subject: Option<String>,
    /// Live (non-expunged) messages
    #[serde(default)]
    pub msg_count: usize,
    /// Filed messages without `\Seen`
    #[serde(default)]
    pub unread_count: usize,
    #[serde(default)]
    pub first_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub participants: Vec<ConvoParticipant>,
    #[serde(default)]
    pub has_unsubscribe: bool,
}

/// A conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Convo {
    pub id: ConvoId,
    pub summary: ConvoSummary,
}
