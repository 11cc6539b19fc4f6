//! Campaign configuration.

use crate::error::{Error, Result};
use crate::message::Attachment;
use crate::relay::{Credential, RelaySettings, SmtpConnector};
use lettre::Address;
use std::time::Duration;

/// Number of recipients processed when test mode is on.
pub const TEST_MODE_LIMIT: usize = 3;

/// Longest accepted pause between two sends.
pub const MAX_DELAY: Duration = Duration::from_secs(10);

/// Everything one campaign run needs besides the dataset.
#[derive(Debug, Clone)]
pub struct CampaignConfig {
    pub relay: RelaySettings,
    pub sender: String,
    pub credential: Credential,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub delay: Duration,
    pub test_mode: bool,
}

impl CampaignConfig {
    /// Reject configurations that cannot work before any connection is made.
    pub fn validate(&self) -> Result<()> {
        if self.relay.host.trim().is_empty() {
            return Err(Error::Config("relay host is empty".to_string()));
        }
        if self.relay.port == 0 {
            return Err(Error::Config("relay port must be between 1 and 65535".to_string()));
        }
        if self.sender.trim().parse::<Address>().is_err() {
            return Err(Error::Config(format!(
                "sender '{}' is not a valid address",
                self.sender
            )));
        }
        if self.credential.username.is_empty() {
            return Err(Error::Config("relay username is empty".to_string()));
        }
        if self.delay > MAX_DELAY {
            return Err(Error::Config(format!(
                "delay {}s exceeds the {}s maximum",
                self.delay.as_secs_f64(),
                MAX_DELAY.as_secs()
            )));
        }
        Ok(())
    }

    /// Connector for the configured relay.
    #[must_use]
    pub fn connector(&self) -> SmtpConnector {
        SmtpConnector::new(self.relay.clone(), self.credential.clone())
    }
}
