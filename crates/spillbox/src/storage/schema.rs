//! Database migrations
//!
//! The metadata tables live in the main database. `Blobs` lives in a second
//! file attached as schema `blobs` before migrations run, so bulk content
//! never bloats the metadata file.

use rusqlite_migration::{M, Migrations};

/// Each migration is applied in order. The user_version pragma of the main
/// database tracks which migrations have been applied.
pub(crate) fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- For IMAP XAPPLEPUSHSERVICE
            CREATE TABLE ApplePushDevices (
                Mailbox          TEXT NOT NULL,
                AppleAccountID   TEXT NOT NULL,
                AppleDeviceToken TEXT NOT NULL,
                PRIMARY KEY (Mailbox, AppleAccountID, AppleDeviceToken)
            );

            -- ContactID 1 is always the owner of the archive
            CREATE TABLE Contacts (
                ContactID INTEGER PRIMARY KEY,
                Hidden    BOOLEAN NOT NULL DEFAULT FALSE,
                Robot     BOOLEAN NOT NULL DEFAULT FALSE
            );

            -- Name and Address never change; edits insert a new row
            CREATE TABLE Addresses (
                AddressID   INTEGER PRIMARY KEY,
                ContactID   INTEGER NOT NULL,
                Name        TEXT,
                Address     TEXT NOT NULL,
                DefaultAddr BOOLEAN NOT NULL,
                Visible     BOOLEAN NOT NULL,
                FOREIGN KEY (ContactID) REFERENCES Contacts(ContactID)
            );

            CREATE INDEX AddressesAddress ON Addresses (Address COLLATE NOCASE);
            CREATE INDEX AddressesContact ON Addresses (ContactID);

            -- Keyed by name, not MailboxID: a name reused after deletion
            -- must keep counting up from where it stopped
            CREATE TABLE MailboxSequencing (
                Name            TEXT PRIMARY KEY,
                NextModSequence INTEGER NOT NULL
            );

            CREATE TABLE Mailboxes (
                MailboxID   INTEGER PRIMARY KEY,
                NextUID     INTEGER NOT NULL,
                UIDValidity INTEGER NOT NULL,
                Attrs       INTEGER NOT NULL DEFAULT 0,
                Name        TEXT,
                DeletedName TEXT,
                Subscribed  BOOLEAN NOT NULL DEFAULT FALSE,
                UNIQUE (Name)
            );

            -- NULL Label means the label is deleted
            CREATE TABLE Labels (
                LabelID INTEGER PRIMARY KEY,
                Label   TEXT,
                UNIQUE (Label)
            );

            CREATE TABLE Convos (
                ConvoID      INTEGER PRIMARY KEY,
                ConvoSummary TEXT
            );

            CREATE TABLE ConvoContacts (
                ConvoID   INTEGER NOT NULL,
                ContactID INTEGER NOT NULL,
                PRIMARY KEY (ConvoID, ContactID),
                FOREIGN KEY (ConvoID) REFERENCES Convos(ConvoID),
                FOREIGN KEY (ContactID) REFERENCES Contacts(ContactID)
            );

            CREATE TABLE ConvoLabels (
                LabelID INTEGER NOT NULL,
                ConvoID INTEGER NOT NULL,
                PRIMARY KEY (LabelID, ConvoID),
                FOREIGN KEY (LabelID) REFERENCES Labels(LabelID),
                FOREIGN KEY (ConvoID) REFERENCES Convos(ConvoID)
            );

            CREATE TABLE Msgs (
                MsgID          INTEGER PRIMARY KEY,
                StagingID      INTEGER,           -- NULL for drafts
                ModSequence    INTEGER,
                Seed           INTEGER NOT NULL,
                RawHash        TEXT,              -- NULL for drafts
                ConvoID        INTEGER,
                State          INTEGER NOT NULL,
                ParseError     TEXT,
                MailboxID      INTEGER,
                UID            INTEGER,
                Flags          TEXT,              -- {"\\Seen": 1}
                Subject        TEXT,
                EncodedSize    INTEGER NOT NULL DEFAULT 0,
                Date           INTEGER NOT NULL,  -- unix seconds
                Expunged       INTEGER,           -- unix seconds
                HdrsBlobID     INTEGER,
                HasUnsubscribe BOOLEAN NOT NULL DEFAULT FALSE,
                FOREIGN KEY (ConvoID) REFERENCES Convos(ConvoID),
                FOREIGN KEY (MailboxID) REFERENCES Mailboxes(MailboxID)
            );

            CREATE UNIQUE INDEX MsgsLiveStagingID
                ON Msgs (StagingID)
                WHERE StagingID IS NOT NULL AND Expunged IS NULL;
            CREATE UNIQUE INDEX MsgsMailboxUID
                ON Msgs (MailboxID, UID)
                WHERE MailboxID IS NOT NULL;
            CREATE INDEX MsgsMailboxModSequence ON Msgs (MailboxID, ModSequence);
            CREATE INDEX MsgsConvo ON Msgs (ConvoID);
            CREATE INDEX MsgsHdrsBlob ON Msgs (HdrsBlobID);

            CREATE TABLE MsgAddresses (
                MsgID     INTEGER NOT NULL,
                AddressID INTEGER NOT NULL,
                Role      INTEGER NOT NULL,
                PRIMARY KEY (MsgID, AddressID, Role),
                FOREIGN KEY (MsgID) REFERENCES Msgs(MsgID),
                FOREIGN KEY (AddressID) REFERENCES Addresses(AddressID)
            );

            -- Flattened MIME leaves; BlobID points into blobs.Blobs
            CREATE TABLE MsgParts (
                MsgID          INTEGER NOT NULL,
                PartNum        INTEGER NOT NULL,
                Name           TEXT NOT NULL,
                IsBody         BOOLEAN NOT NULL,
                IsAttachment   BOOLEAN NOT NULL,
                IsCompressed   BOOLEAN NOT NULL DEFAULT FALSE,
                CompressedSize INTEGER,
                ContentType    TEXT,
                ContentID      TEXT,
                BlobID         INTEGER,

                ContentTransferEncoding TEXT,
                ContentTransferSize     INTEGER NOT NULL DEFAULT 0,
                ContentTransferLines    INTEGER NOT NULL DEFAULT 0,

                PRIMARY KEY (MsgID, PartNum),
                FOREIGN KEY (MsgID) REFERENCES Msgs(MsgID)
            );

            CREATE INDEX MsgPartsBlob ON MsgParts (BlobID);

            INSERT INTO Contacts (ContactID, Hidden, Robot) VALUES (1, FALSE, FALSE);
            INSERT INTO Labels (LabelID, Label) VALUES (1, 'Personal Mail');
            INSERT INTO Labels (LabelID, Label) VALUES (2, 'Subscriptions');
            INSERT INTO Labels (LabelID, Label) VALUES (3, 'Spam and Trash');

            -- Content is NULL once garbage collection erased it
            CREATE TABLE blobs.Blobs (
                BlobID  INTEGER PRIMARY KEY,
                SHA256  TEXT NOT NULL,
                Deleted INTEGER,
                Content BLOB
            );

            -- Dedup only among live blobs; tombstoned rows keep their hash
            CREATE UNIQUE INDEX blobs.BlobsLiveSHA256
                ON Blobs (SHA256)
                WHERE Deleted IS NULL;
            CREATE INDEX blobs.BlobsDeleted ON Blobs (Deleted);
            "#,
        ),
    ])
}
