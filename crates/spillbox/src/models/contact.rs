//! Contacts and the addresses bound to them

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use super::{AddressId, ContactId};

impl ContactId {
    /// The archive's own owner; always present
    pub const OWNER: ContactId = ContactId(1);
}

/// A person or automated sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    /// No longer shown, but still referenced by stored mail
    pub hidden: bool,
    /// Not a human
    pub robot: bool,
}

/// One (display name, address) pair bound to a contact.
///
/// Name and address never change once the row exists. Edits produce a new
/// row so messages keep rendering the address they were delivered with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub id: AddressId,
    pub contact_id: ContactId,
    pub name: Option<String>,
    pub address: String,
    /// Default address for this contact
    pub default_addr: bool,
    /// The user has sent to or been shown this address
    pub visible: bool,
}

impl Address {
    /// Format the address for display
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.address),
            None => self.address.clone(),
        }
    }
}

/// An email address with optional display name, as handed over by a parser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub email: String,
}

impl EmailAddress {
    /// Create a new email address with just the email
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Create a new email address with a display name
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse an email address from a string like "John Doe <john@example.com>"
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"').trim();
            let email = s[angle_start + 1..angle_end].trim();
            return Self {
                name: if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                },
                email: email.to_string(),
            };
        }

        Self {
            name: None,
            email: s.to_string(),
        }
    }
}

/// The header an address appeared in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ContactRole {
    From,
    To,
    Cc,
    Bcc,
    ReplyTo,
    Sender,
}

impl ContactRole {
    pub fn as_i64(self) -> i64 {
        match self {
            ContactRole::From => 1,
            ContactRole::To => 2,
            ContactRole::Cc => 3,
            ContactRole::Bcc => 4,
            ContactRole::ReplyTo => 5,
            ContactRole::Sender => 6,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(ContactRole::From),
            2 => Some(ContactRole::To),
            3 => Some(ContactRole::Cc),
            4 => Some(ContactRole::Bcc),
            5 => Some(ContactRole::ReplyTo),
            6 => Some(ContactRole::Sender),
            _ => None,
        }
    }

    /// Recipient roles; the owner sending to these makes them visible
    pub fn is_recipient(self) -> bool {
        matches!(self, ContactRole::To | ContactRole::Cc | ContactRole::Bcc)
    }
}

impl ToSql for ContactRole {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_i64()))
    }
}

impl FromSql for ContactRole {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = i64::column_result(value)?;
        ContactRole::from_i64(raw).ok_or(FromSqlError::OutOfRange(raw))
    }
}
