//! Push device registrations (XAPPLEPUSHSERVICE)

use serde::{Deserialize, Serialize};

/// A device that wants to hear about changes to a mailbox
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApplePushDevice {
    pub mailbox: String,
    pub account_id: String,
    pub device_token: String,
}

impl ApplePushDevice {
    pub fn new(
        mailbox: impl Into<String>,
        account_id: impl Into<String>,
        device_token: impl Into<String>,
    ) -> Self {
        Self {
            mailbox: mailbox.into(),
            account_id: account_id.into(),
            device_token: device_token.into(),
        }
    }
}
