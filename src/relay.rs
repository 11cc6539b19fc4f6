//! Authenticated SMTP relay session.
//!
//! A session owns one connection for the lifetime of a campaign. Opening it
//! connects, upgrades to TLS and authenticates, and reports authentication
//! failures separately from everything else so callers can tell the operator
//! which half of the configuration is wrong.

use crate::error::{DeliveryError, SessionError};
use crate::message::OutgoingMessage;
use async_trait::async_trait;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{AsyncSmtpConnection, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

const AUTH_MECHANISMS: &[Mechanism] = &[Mechanism::Plain, Mechanism::Login];

/// How the connection is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Connect unencrypted, then upgrade with STARTTLS (submission port 587)
    #[default]
    #[value(name = "starttls")]
    StartTls,
    /// TLS from the first byte (SMTPS port 465)
    Wrapper,
    /// No encryption. Only for local relays and tests.
    Plain,
}

/// Where and how to reach the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub host: String,
    pub port: u16,
    pub tls: TlsMode,
    pub timeout: Duration,
}

impl RelaySettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: TlsMode::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Login for the relay. The password is never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Opens relay sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: RelaySession;

    /// Connect, secure and authenticate.
    async fn open(&self) -> Result<Self::Session, SessionError>;
}

/// One open relay connection.
#[async_trait]
pub trait RelaySession: Send {
    /// Deliver one message. A failure here only concerns this message.
    async fn send(&mut self, message: &OutgoingMessage) -> Result<(), DeliveryError>;

    /// Terminate the connection. Safe to call after failed sends.
    async fn close(&mut self);
}

/// [`Connector`] backed by lettre's SMTP client.
#[derive(Debug, Clone)]
pub struct SmtpConnector {
    settings: RelaySettings,
    credential: Credential,
}

impl SmtpConnector {
    #[must_use]
    pub const fn new(settings: RelaySettings, credential: Credential) -> Self {
        Self {
            settings,
            credential,
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    fn tls_parameters(&self) -> Result<TlsParameters, SessionError> {
        TlsParameters::new(self.settings.host.clone())
            .map_err(|e| SessionError::Connection(format!("TLS setup: {e}")))
    }

    async fn establish(&self) -> Result<AsyncSmtpConnection, SessionError> {
        let hello = ClientId::default();
        let wrapper = match self.settings.tls {
            TlsMode::Wrapper => Some(self.tls_parameters()?),
            TlsMode::StartTls | TlsMode::Plain => None,
        };

        let mut conn = AsyncSmtpConnection::connect_tokio1(
            (self.settings.host.as_str(), self.settings.port),
            Some(self.settings.timeout),
            &hello,
            wrapper,
            None,
        )
        .await
        .map_err(|e| SessionError::Connection(e.to_string()))?;

        if self.settings.tls == TlsMode::StartTls {
            if !conn.can_starttls() {
                conn.abort().await;
                return Err(SessionError::Connection(format!(
                    "{} does not offer STARTTLS",
                    self.settings.host
                )));
            }
            conn.starttls(self.tls_parameters()?, &hello)
                .await
                .map_err(|e| SessionError::Connection(format!("STARTTLS: {e}")))?;
        }

        let credentials = Credentials::new(
            self.credential.username.clone(),
            self.credential.password.clone(),
        );
        if let Err(e) = conn.auth(AUTH_MECHANISMS, &credentials).await {
            conn.abort().await;
            // A reply from the relay (or no usable mechanism) means the
            // transport works and the login itself was refused.
            return Err(if e.is_permanent() || e.is_transient() || e.is_client() {
                SessionError::Auth(e.to_string())
            } else {
                SessionError::Connection(e.to_string())
            });
        }

        Ok(conn)
    }
}

#[async_trait]
impl Connector for SmtpConnector {
    type Session = SmtpSession;

    async fn open(&self) -> Result<SmtpSession, SessionError> {
        info!(
            "Connecting to {}:{} ({:?})",
            self.settings.host, self.settings.port, self.settings.tls
        );
        let conn = self.establish().await?;
        info!("Authenticated as {}", self.credential.username);
        Ok(SmtpSession {
            conn,
            connector: self.clone(),
            closed: false,
        })
    }
}

/// An authenticated SMTP connection.
///
/// lettre drops a connection after any failed command, so a send that finds
/// the connection broken re-establishes it first. Dropping the session closes
/// the socket even if [`RelaySession::close`] was never reached.
pub struct SmtpSession {
    conn: AsyncSmtpConnection,
    connector: SmtpConnector,
    closed: bool,
}

#[async_trait]
impl RelaySession for SmtpSession {
    async fn send(&mut self, message: &OutgoingMessage) -> Result<(), DeliveryError> {
        let mime = message.to_mime()?;

        if self.conn.has_broken() {
            warn!("Relay connection lost, reconnecting");
            self.conn = self
                .connector
                .establish()
                .await
                .map_err(DeliveryError::Reconnect)?;
        }

        let response = self
            .conn
            .send(mime.envelope(), &mime.formatted())
            .await
            .map_err(|e| DeliveryError::Rejected(e.to_string()))?;
        debug!("Relay accepted message for {}: {}", message.to, response.code());
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.conn.has_broken() {
            return;
        }
        if let Err(e) = self.conn.quit().await {
            debug!("QUIT failed: {e}");
            self.conn.abort().await;
        }
        info!("Relay connection closed");
    }
}
