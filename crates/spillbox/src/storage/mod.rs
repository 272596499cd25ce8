//! SQLite storage for the archive
//!
//! [`Spillbox`] owns the connection; each component lives in its own
//! module and adds its operations to `Spillbox`.

mod blob;
mod contacts;
mod convos;
mod mailboxes;
mod messages;
mod push;
mod schema;
mod sqlite;

pub use contacts::{AddressMatcher, ContactMatcher};
pub use sqlite::Spillbox;
