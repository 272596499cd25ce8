//! Spillbox - storage engine for a single-user email archive
//!
//! This crate persists contacts, conversations, messages, their flattened
//! MIME parts and content-addressed blobs, and hands out the identifiers
//! the IMAP protocol relies on:
//! - Monotonic per-mailbox UIDs
//! - Per-name mod-sequences that survive mailbox deletion (CONDSTORE)
//! - UIDVALIDITY bumps on rename
//!
//! MIME parsing and the wire protocols live outside this crate; ingestion
//! takes an already decomposed [`IncomingMessage`].

pub mod config;
pub mod error;
pub mod models;
pub mod policy;
pub mod storage;

pub use crate::config::SpillboxConfig;
pub use crate::error::{StoreError, store_error};
pub use crate::models::{
    Address, AddressId, ApplePushDevice, BlobId, BlobInfo, Contact, ContactId, ContactRole,
    Convo, ConvoId, ConvoParticipant, ConvoSummary, DraftEdit, EmailAddress, FiledPosition,
    FlagOp, Flags, GcStats, IncomingMessage, IncomingPart, Label, LabelId, Mailbox,
    MailboxAttrs, MailboxId, MailboxInfo, MailboxMessage, MessageQuery, Msg, MsgAddress, MsgId,
    MsgPart, MsgState, SweepStats,
};
pub use crate::policy::{LinkTextDetector, UnsubscribeDetector, looks_like_robot};
pub use crate::storage::{AddressMatcher, ContactMatcher, Spillbox};
