//! Domain errors raised by store operations
//!
//! Store operations return `anyhow::Result`. When an operation is rejected
//! for a domain reason the error carries a [`StoreError`], which callers can
//! recover with `err.downcast_ref::<StoreError>()`.

use crate::models::{LabelId, MsgId, MsgState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A live mailbox or label already uses this name
    #[error("Name already in use: {0}")]
    NameConflict(String),

    /// The referenced entity does not exist, was deleted, or was erased
    #[error("Not found: {0}")]
    NotFound(String),

    /// A live message already carries this staging ID
    #[error("Staging ID {0} has already been ingested")]
    DuplicateStaging(i64),

    /// The part decomposition was malformed; the message was kept as Errored
    #[error("Message {msg_id} failed to parse: {reason}")]
    ParseFailure { msg_id: MsgId, reason: String },

    /// The message is already filed into a mailbox
    #[error("Message {0} is already filed")]
    AlreadyFiled(MsgId),

    /// The operation is not allowed from the message's current state
    #[error("Cannot {op} message {msg_id} in state {state}")]
    InvalidTransition {
        msg_id: MsgId,
        state: MsgState,
        op: &'static str,
    },

    /// The label does not exist or has been deleted
    #[error("Unknown label {0}")]
    UnknownLabel(LabelId),
}

impl StoreError {
    pub(crate) fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }
}

/// Extract the domain error from an `anyhow::Error`, if there is one
pub fn store_error(err: &anyhow::Error) -> Option<&StoreError> {
    err.downcast_ref::<StoreError>()
}
