//! Push device registrations
//!
//! A plain membership table read by the external push dispatcher.

use anyhow::Result;
use log::debug;
use rusqlite::params;

use super::sqlite::Spillbox;
use crate::models::ApplePushDevice;

impl Spillbox {
    /// Register a device for a mailbox. Registering twice is a no-op.
    pub fn register_push_device(&self, device: &ApplePushDevice) -> Result<()> {
        self.write(|tx| {
            tx.prepare_cached(
                "INSERT OR IGNORE INTO ApplePushDevices (Mailbox, AppleAccountID, AppleDeviceToken)
                 VALUES (?1, ?2, ?3)",
            )?
            .execute(params![device.mailbox, device.account_id, device.device_token])?;
            Ok(())
        })?;
        debug!("[STORE] Registered push device for {:?}", device.mailbox);
        Ok(())
    }

    /// Remove a registration. Returns whether it existed.
    pub fn unregister_push_device(&self, device: &ApplePushDevice) -> Result<bool> {
        self.write(|tx| {
            let removed = tx
                .prepare_cached(
                    "DELETE FROM ApplePushDevices
                     WHERE Mailbox = ?1 AND AppleAccountID = ?2 AND AppleDeviceToken = ?3",
                )?
                .execute(params![device.mailbox, device.account_id, device.device_token])?;
            Ok(removed > 0)
        })
    }

    pub fn push_devices(&self, mailbox: &str) -> Result<Vec<ApplePushDevice>> {
        self.read(|tx| {
            let devices = tx
                .prepare_cached(
                    "SELECT Mailbox, AppleAccountID, AppleDeviceToken
                     FROM ApplePushDevices
                     WHERE Mailbox = ?1
                     ORDER BY AppleAccountID, AppleDeviceToken",
                )?
                .query_map([mailbox], |row| {
                    Ok(ApplePushDevice {
                        mailbox: row.get(0)?,
                        account_id: row.get(1)?,
                        device_token: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(devices)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let store = Spillbox::open_in_memory().unwrap();
        let device = ApplePushDevice::new("INBOX", "acct-1", "token-a");

        store.register_push_device(&device).unwrap();
        store.register_push_device(&device).unwrap();
        store
            .register_push_device(&ApplePushDevice::new("INBOX", "acct-1", "token-b"))
            .unwrap();
        store
            .register_push_device(&ApplePushDevice::new("Sent", "acct-1", "token-a"))
            .unwrap();

        let devices = store.push_devices("INBOX").unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0], device);
    }

    #[test]
    fn test_unregister() {
        let store = Spillbox::open_in_memory().unwrap();
        let device = ApplePushDevice::new("INBOX", "acct-1", "token-a");
        store.register_push_device(&device).unwrap();

        assert!(store.unregister_push_device(&device).unwrap());
        assert!(!store.unregister_push_device(&device).unwrap());
        assert!(store.push_devices("INBOX").unwrap().is_empty());
    }
}
