//! Personalized bulk email over an authenticated SMTP relay.
//!
//! A [`Dataset`] supplies recipients, a [`Campaign`] renders the subject and
//! body templates for each row and delivers them one at a time through a
//! single relay session, pausing between sends and recording every outcome.

mod campaign;
mod config;
mod dataset;
mod error;
mod message;
mod relay;
pub mod template;

pub use campaign::{
    Campaign, CampaignState, CampaignSummary, Failure, Preview, ProgressEvent, SendOutcome,
    SendResult, Stage,
};
pub use config::{CampaignConfig, MAX_DELAY, TEST_MODE_LIMIT};
pub use dataset::{
    resolve_address_column, Dataset, DatasetStats, Recipient, Record, Value,
    DEFAULT_ADDRESS_COLUMN,
};
pub use error::{DeliveryError, Error, Result, SessionError};
pub use message::{Attachment, OutgoingMessage};
pub use relay::{
    Connector, Credential, RelaySession, RelaySettings, SmtpConnector, SmtpSession, TlsMode,
};
pub use template::render;
