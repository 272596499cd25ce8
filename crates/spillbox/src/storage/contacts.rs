//! Contact directory
//!
//! Address rows are immutable in their name and address; editing inserts a
//! new row so stored messages keep pointing at what they were delivered
//! with. Only the `DefaultAddr` and `Visible` flags are ever updated.

use anyhow::Result;
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::sqlite::Spillbox;
use crate::error::StoreError;
use crate::models::{Address, AddressId, Contact, ContactId};
use crate::policy::looks_like_robot;

/// Decides which existing contact, if any, an incoming address belongs to
pub trait ContactMatcher: Send + Sync {
    fn match_contact(
        &self,
        conn: &Connection,
        name: Option<&str>,
        address: &str,
    ) -> Result<Option<ContactId>>;
}

/// Matches on the address string, ignoring case. When several contacts
/// know the address, a default binding wins over a secondary one, then the
/// oldest row.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressMatcher;

impl ContactMatcher for AddressMatcher {
    fn match_contact(
        &self,
        conn: &Connection,
        _name: Option<&str>,
        address: &str,
    ) -> Result<Option<ContactId>> {
        Ok(conn
            .prepare_cached(
                "SELECT ContactID FROM Addresses
                 WHERE Address = ?1 COLLATE NOCASE
                 ORDER BY DefaultAddr DESC, AddressID
                 LIMIT 1",
            )?
            .query_row([address], |row| row.get(0))
            .optional()?)
    }
}

const ADDRESS_COLUMNS: &str = "AddressID, ContactID, Name, Address, DefaultAddr, Visible";

fn address_from_row(row: &Row<'_>) -> rusqlite::Result<Address> {
    Ok(Address {
        id: row.get(0)?,
        contact_id: row.get(1)?,
        name: row.get(2)?,
        address: row.get(3)?,
        default_addr: row.get(4)?,
        visible: row.get(5)?,
    })
}

pub(crate) fn get_contact(conn: &Connection, id: ContactId) -> Result<Contact> {
    conn.prepare_cached("SELECT ContactID, Hidden, Robot FROM Contacts WHERE ContactID = ?1")?
        .query_row([id], |row| {
            Ok(Contact {
                id: row.get(0)?,
                hidden: row.get(1)?,
                robot: row.get(2)?,
            })
        })
        .optional()?
        .ok_or_else(|| StoreError::not_found(format!("contact {id}")).into())
}

pub(crate) fn get_address(conn: &Connection, id: AddressId) -> Result<Address> {
    conn.prepare_cached(&format!(
        "SELECT {ADDRESS_COLUMNS} FROM Addresses WHERE AddressID = ?1"
    ))?
    .query_row([id], address_from_row)
    .optional()?
    .ok_or_else(|| StoreError::not_found(format!("address {id}")).into())
}

fn contact_addresses(conn: &Connection, id: ContactId) -> Result<Vec<Address>> {
    get_contact(conn, id)?;
    let addresses = conn
        .prepare_cached(&format!(
            "SELECT {ADDRESS_COLUMNS} FROM Addresses WHERE ContactID = ?1 ORDER BY AddressID"
        ))?
        .query_map([id], address_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(addresses)
}

fn has_default(conn: &Connection, contact_id: ContactId) -> Result<bool> {
    Ok(conn
        .prepare_cached("SELECT 1 FROM Addresses WHERE ContactID = ?1 AND DefaultAddr")?
        .exists([contact_id])?)
}

fn insert_address(
    conn: &Connection,
    contact_id: ContactId,
    name: Option<&str>,
    address: &str,
    default_addr: bool,
    visible: bool,
) -> Result<AddressId> {
    conn.prepare_cached(
        "INSERT INTO Addresses (ContactID, Name, Address, DefaultAddr, Visible)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?
    .execute(params![contact_id, name, address, default_addr, visible])?;
    Ok(AddressId::new(conn.last_insert_rowid()))
}

fn create_contact(conn: &Connection, robot: bool) -> Result<ContactId> {
    conn.prepare_cached("INSERT INTO Contacts (Hidden, Robot) VALUES (FALSE, ?1)")?
        .execute([robot])?;
    Ok(ContactId::new(conn.last_insert_rowid()))
}

/// Find or create the Address row for an incoming (name, address) pair
pub(crate) fn resolve(
    conn: &Connection,
    matcher: &dyn ContactMatcher,
    name: Option<&str>,
    address: &str,
) -> Result<Address> {
    let name = name.map(str::trim).filter(|n| !n.is_empty());

    let Some(contact_id) = matcher.match_contact(conn, name, address)? else {
        let robot = looks_like_robot(address);
        let contact_id = create_contact(conn, robot)?;
        let id = insert_address(conn, contact_id, name, address, true, false)?;
        debug!(
            "[CONTACT] New contact {} for {:?} (robot: {})",
            contact_id, address, robot
        );
        return get_address(conn, id);
    };

    let existing = conn
        .prepare_cached(&format!(
            "SELECT {ADDRESS_COLUMNS} FROM Addresses
             WHERE ContactID = ?1 AND Address = ?2 COLLATE NOCASE AND Name IS ?3
             ORDER BY AddressID
             LIMIT 1"
        ))?
        .query_row(params![contact_id, address, name], address_from_row)
        .optional()?;
    if let Some(existing) = existing {
        return Ok(existing);
    }

    let default_addr = !has_default(conn, contact_id)?;
    let id = insert_address(conn, contact_id, name, address, default_addr, false)?;
    get_address(conn, id)
}

pub(crate) fn add_address(
    conn: &Connection,
    contact_id: ContactId,
    name: Option<&str>,
    address: &str,
) -> Result<AddressId> {
    get_contact(conn, contact_id)?;
    let default_addr = !has_default(conn, contact_id)?;
    insert_address(conn, contact_id, name, address, default_addr, true)
}

/// Replace an address by a new row carrying its flags
pub(crate) fn edit_address(
    conn: &Connection,
    id: AddressId,
    name: Option<&str>,
    address: &str,
) -> Result<AddressId> {
    let old = get_address(conn, id)?;

    if old.default_addr {
        conn.execute(
            "UPDATE Addresses SET DefaultAddr = FALSE WHERE AddressID = ?1",
            [id],
        )?;
    }

    insert_address(
        conn,
        old.contact_id,
        name,
        address,
        old.default_addr,
        old.visible,
    )
}

pub(crate) fn mark_visible(conn: &Connection, id: AddressId) -> Result<()> {
    conn.prepare_cached("UPDATE Addresses SET Visible = TRUE WHERE AddressID = ?1")?
        .execute([id])?;
    Ok(())
}

fn set_contact_flag(conn: &Connection, id: ContactId, column: &str, value: bool) -> Result<()> {
    let changed = conn.execute(
        &format!("UPDATE Contacts SET {column} = ?1 WHERE ContactID = ?2"),
        params![value, id],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found(format!("contact {id}")).into());
    }
    Ok(())
}

impl Spillbox {
    /// Find or create the contact and address for a (name, address) pair
    pub fn resolve_address(&self, name: Option<&str>, address: &str) -> Result<Address> {
        self.write(|tx| resolve(tx, self.matcher(), name, address))
    }

    /// Stop showing a contact. Its rows stay for the mail that references it.
    pub fn hide_contact(&self, id: ContactId) -> Result<()> {
        self.write(|tx| set_contact_flag(tx, id, "Hidden", true))?;
        info!("[CONTACT] Hid contact {}", id);
        Ok(())
    }

    pub fn unhide_contact(&self, id: ContactId) -> Result<()> {
        self.write(|tx| set_contact_flag(tx, id, "Hidden", false))
    }

    pub fn set_robot(&self, id: ContactId, robot: bool) -> Result<()> {
        self.write(|tx| set_contact_flag(tx, id, "Robot", robot))
    }

    /// Bind another address to a contact. The first one becomes its default.
    pub fn add_address(
        &self,
        contact_id: ContactId,
        name: Option<&str>,
        address: &str,
    ) -> Result<AddressId> {
        self.write(|tx| add_address(tx, contact_id, name, address))
    }

    /// Edit an address, returning the ID of the row that replaces it.
    ///
    /// The old row is left as it was, apart from losing the default flag
    /// to its replacement.
    pub fn edit_address(
        &self,
        id: AddressId,
        name: Option<&str>,
        address: &str,
    ) -> Result<AddressId> {
        self.write(|tx| edit_address(tx, id, name, address))
    }

    pub fn get_contact(&self, id: ContactId) -> Result<Contact> {
        self.read(|tx| get_contact(tx, id))
    }

    pub fn get_address(&self, id: AddressId) -> Result<Address> {
        self.read(|tx| get_address(tx, id))
    }

    pub fn contact_addresses(&self, id: ContactId) -> Result<Vec<Address>> {
        self.read(|tx| contact_addresses(tx, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::store_error;

    #[test]
    fn test_owner_always_exists() {
        let store = Spillbox::open_in_memory().unwrap();
        let owner = store.get_contact(ContactId::OWNER).unwrap();
        assert!(!owner.hidden);
        assert!(!owner.robot);
    }

    #[test]
    fn test_resolve_creates_then_reuses() {
        let store = Spillbox::open_in_memory().unwrap();

        let first = store
            .resolve_address(Some("Ada"), "ada@example.com")
            .unwrap();
        assert!(first.default_addr);
        assert!(!first.visible);
        assert_ne!(first.contact_id, ContactId::OWNER);

        let again = store
            .resolve_address(Some("Ada"), "ADA@example.com")
            .unwrap();
        assert_eq!(again.id, first.id);
    }

    #[test]
    fn test_resolve_new_name_adds_row_to_same_contact() {
        let store = Spillbox::open_in_memory().unwrap();
        let first = store
            .resolve_address(Some("Ada"), "ada@example.com")
            .unwrap();

        let renamed = store
            .resolve_address(Some("Ada Lovelace"), "ada@example.com")
            .unwrap();
        assert_ne!(renamed.id, first.id);
        assert_eq!(renamed.contact_id, first.contact_id);
        assert!(!renamed.default_addr);

        let untouched = store.get_address(first.id).unwrap();
        assert_eq!(untouched, first);
    }

    #[test]
    fn test_robot_heuristic_on_new_contacts() {
        let store = Spillbox::open_in_memory().unwrap();
        let robot = store
            .resolve_address(None, "noreply@github.com")
            .unwrap();
        let human = store.resolve_address(None, "bob@example.com").unwrap();

        assert!(store.get_contact(robot.contact_id).unwrap().robot);
        assert!(!store.get_contact(human.contact_id).unwrap().robot);
    }

    #[test]
    fn test_edit_address_creates_new_row() {
        let store = Spillbox::open_in_memory().unwrap();
        let old_id = store
            .add_address(ContactId::OWNER, Some("Me"), "me@example.com")
            .unwrap();

        let new_id = store
            .edit_address(old_id, Some("Me Myself"), "me@example.com")
            .unwrap();
        assert_ne!(new_id, old_id);

        let old = store.get_address(old_id).unwrap();
        assert_eq!(old.name.as_deref(), Some("Me"));
        assert!(!old.default_addr);

        let new = store.get_address(new_id).unwrap();
        assert_eq!(new.name.as_deref(), Some("Me Myself"));
        assert!(new.default_addr);
        assert!(new.visible);
        assert_eq!(new.contact_id, ContactId::OWNER);
    }

    #[test]
    fn test_hide_and_unhide() {
        let store = Spillbox::open_in_memory().unwrap();
        let addr = store.resolve_address(None, "x@example.com").unwrap();

        store.hide_contact(addr.contact_id).unwrap();
        assert!(store.get_contact(addr.contact_id).unwrap().hidden);

        store.unhide_contact(addr.contact_id).unwrap();
        assert!(!store.get_contact(addr.contact_id).unwrap().hidden);

        // Hidden contacts keep their addresses
        assert_eq!(store.contact_addresses(addr.contact_id).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_contact() {
        let store = Spillbox::open_in_memory().unwrap();
        let err = store.hide_contact(ContactId::new(99)).unwrap_err();
        assert!(matches!(store_error(&err), Some(StoreError::NotFound(_))));
    }

    struct NeverMatch;

    impl ContactMatcher for NeverMatch {
        fn match_contact(
            &self,
            _conn: &Connection,
            _name: Option<&str>,
            _address: &str,
        ) -> Result<Option<ContactId>> {
            Ok(None)
        }
    }

    #[test]
    fn test_custom_matcher() {
        let store = Spillbox::open_in_memory()
            .unwrap()
            .with_contact_matcher(Box::new(NeverMatch));

        let a = store.resolve_address(None, "same@example.com").unwrap();
        let b = store.resolve_address(None, "same@example.com").unwrap();
        assert_ne!(a.contact_id, b.contact_id);
    }
}
