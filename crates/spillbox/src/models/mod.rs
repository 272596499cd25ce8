//! Domain models for archive entities

mod blob;
mod contact;
mod convo;
mod ids;
mod mailbox;
mod message;
mod push;

pub use blob::{BlobInfo, GcStats, SweepStats};
pub use contact::{Address, Contact, ContactRole, EmailAddress};
pub use convo::{Convo, ConvoParticipant, ConvoSummary, Label};
pub use ids::{AddressId, BlobId, ContactId, ConvoId, LabelId, MailboxId, MsgId};
pub use mailbox::{FiledPosition, Mailbox, MailboxAttrs, MailboxInfo, MailboxMessage, MessageQuery};
pub use message::{
    DraftEdit, FlagOp, Flags, IncomingMessage, IncomingMessageBuilder, IncomingPart, Msg,
    MsgAddress, MsgPart, MsgState,
};
pub use push::ApplePushDevice;
