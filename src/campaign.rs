//! Campaign runner: renders, sends and records one message per recipient.

use crate::config::{CampaignConfig, TEST_MODE_LIMIT};
use crate::dataset::{Dataset, Recipient};
use crate::error::{Error, Result, SessionError};
use crate::message::{Attachment, OutgoingMessage};
use crate::relay::{Connector, RelaySession};
use crate::template::render;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

/// Where a campaign is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CampaignState {
    Idle,
    Connecting,
    Sending,
    Completed,
    AbortedOnAuth,
    AbortedOnConnection,
    /// Stopped at a recipient boundary by a shutdown signal
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Connecting,
    Connected,
    Sent,
    Failed,
    Closed,
}

/// Emitted in recipient order as each outcome is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// 1-based position of the recipient
    pub index: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SendOutcome {
    Sent,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendResult {
    pub address: String,
    #[serde(flatten)]
    pub outcome: SendOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub address: String,
    pub reason: String,
}

/// Totals and per-recipient outcomes of one run.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignSummary {
    pub run_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub sent_count: usize,
    pub failed_count: usize,
    pub failures: Vec<Failure>,
    pub results: Vec<SendResult>,
}

impl CampaignSummary {
    fn new(run_id: String) -> Self {
        Self {
            run_id,
            started_at: None,
            finished_at: None,
            sent_count: 0,
            failed_count: 0,
            failures: Vec::new(),
            results: Vec::new(),
        }
    }

    fn record_sent(&mut self, address: &str) {
        self.sent_count += 1;
        self.results.push(SendResult {
            address: address.to_string(),
            outcome: SendOutcome::Sent,
        });
    }

    fn record_failed(&mut self, address: &str, reason: String) {
        self.failed_count += 1;
        self.failures.push(Failure {
            address: address.to_string(),
            reason: reason.clone(),
        });
        self.results.push(SendResult {
            address: address.to_string(),
            outcome: SendOutcome::Failed { reason },
        });
    }

    /// Number of recipients a send was attempted for.
    #[must_use]
    pub const fn attempted(&self) -> usize {
        self.sent_count + self.failed_count
    }
}

/// The first recipient's message, for review before confirming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Preview {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<String>,
}

/// One run of a [`CampaignConfig`] over a [`Dataset`].
///
/// Nothing is sent until [`Campaign::confirm`] has been called.
pub struct Campaign<'a> {
    config: CampaignConfig,
    dataset: &'a Dataset,
    attachments: Arc<[Attachment]>,
    state: CampaignState,
    confirmed: bool,
    summary: CampaignSummary,
    events: Option<mpsc::UnboundedSender<ProgressEvent>>,
    shutdown: Option<broadcast::Receiver<()>>,
}

impl<'a> Campaign<'a> {
    /// Validate `config` and prepare an idle campaign.
    pub fn new(config: CampaignConfig, dataset: &'a Dataset) -> Result<Self> {
        config.validate()?;
        let attachments = config.attachments.clone().into();
        Ok(Self {
            config,
            dataset,
            attachments,
            state: CampaignState::Idle,
            confirmed: false,
            summary: CampaignSummary::new(Uuid::new_v4().to_string()),
            events: None,
            shutdown: None,
        })
    }

    /// Report progress on `tx`. A dropped receiver is ignored.
    #[must_use]
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Stop at the next recipient boundary when `rx` fires.
    #[must_use]
    pub fn with_shutdown(mut self, rx: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(rx);
        self
    }

    /// Operator acknowledgement required before [`Campaign::run`].
    pub fn confirm(&mut self) {
        self.confirmed = true;
    }

    #[must_use]
    pub const fn state(&self) -> CampaignState {
        self.state
    }

    #[must_use]
    pub const fn summary(&self) -> &CampaignSummary {
        &self.summary
    }

    #[must_use]
    pub const fn config(&self) -> &CampaignConfig {
        &self.config
    }

    /// Eligible recipients in row order, capped in test mode.
    #[must_use]
    pub fn planned_recipients(&self) -> Vec<Recipient<'a>> {
        let eligible = self.dataset.recipients();
        if self.config.test_mode {
            eligible.take(TEST_MODE_LIMIT).collect()
        } else {
            eligible.collect()
        }
    }

    #[must_use]
    pub fn preview(&self) -> Option<Preview> {
        let recipient = self.dataset.recipients().next()?;
        let message = self.personalize(&recipient);
        Some(Preview {
            to: message.to,
            subject: message.subject,
            body: message.body,
            attachments: self
                .attachments
                .iter()
                .map(|a| a.filename().to_string())
                .collect(),
        })
    }

    /// Connect, deliver to every planned recipient and close.
    ///
    /// Only confirmation, authentication and connection failures return an
    /// error; per-recipient failures are recorded in the summary.
    pub async fn run<C: Connector>(&mut self, connector: &C) -> Result<CampaignSummary> {
        if !self.confirmed {
            return Err(Error::NotConfirmed);
        }
        if self.state != CampaignState::Idle {
            return Err(Error::Config(format!(
                "campaign already ran (state {:?})",
                self.state
            )));
        }

        let span = info_span!("campaign", run_id = %self.summary.run_id);
        self.execute(connector).instrument(span).await
    }

    async fn execute<C: Connector>(&mut self, connector: &C) -> Result<CampaignSummary> {
        self.summary.started_at = Some(Utc::now());
        let recipients = self.planned_recipients();
        let total = recipients.len();

        if recipients.is_empty() {
            info!("No eligible recipients, nothing to send");
            self.finish(CampaignState::Completed);
            return Ok(self.summary.clone());
        }

        self.state = CampaignState::Connecting;
        self.emit(Stage::Connecting, None, None, 0, total);
        let mut session = match connector.open().await {
            Ok(session) => session,
            Err(e) => {
                error!("Could not open relay session: {e}");
                let state = match e {
                    SessionError::Auth(_) => CampaignState::AbortedOnAuth,
                    SessionError::Connection(_) => CampaignState::AbortedOnConnection,
                };
                self.finish(state);
                return Err(e.into());
            }
        };
        self.emit(Stage::Connected, None, None, 0, total);

        self.state = CampaignState::Sending;
        info!("Sending to {total} recipients");
        let mut cancelled = false;
        for (idx, recipient) in recipients.iter().enumerate() {
            if self.shutdown_requested() {
                cancelled = true;
                break;
            }

            let message = self.personalize(recipient);
            match session.send(&message).await {
                Ok(()) => {
                    debug!("Sent to {}", recipient.address);
                    self.summary.record_sent(&recipient.address);
                    self.emit(Stage::Sent, Some(&*recipient.address), None, idx + 1, total);
                }
                Err(e) => {
                    error!("Failed to send to {}: {e}", recipient.address);
                    let reason = e.to_string();
                    self.emit(
                        Stage::Failed,
                        Some(&*recipient.address),
                        Some(reason.clone()),
                        idx + 1,
                        total,
                    );
                    self.summary.record_failed(&recipient.address, reason);
                }
            }

            if idx + 1 < total && !self.pause().await {
                cancelled = true;
                break;
            }
        }

        session.close().await;
        self.emit(Stage::Closed, None, None, self.summary.attempted(), total);

        if cancelled {
            info!(
                "Campaign cancelled after {} of {total} recipients",
                self.summary.attempted()
            );
            self.finish(CampaignState::Cancelled);
        } else {
            self.finish(CampaignState::Completed);
        }
        info!(
            "Campaign finished: {} sent, {} failed",
            self.summary.sent_count, self.summary.failed_count
        );
        Ok(self.summary.clone())
    }

    fn personalize(&self, recipient: &Recipient<'_>) -> OutgoingMessage {
        OutgoingMessage {
            from: self.config.sender.trim().to_string(),
            to: recipient.address.to_string(),
            subject: render(&self.config.subject, recipient.record),
            body: render(&self.config.body, recipient.record),
            attachments: Arc::clone(&self.attachments),
        }
    }

    /// Wait the configured delay. Returns `false` if a shutdown arrived first.
    async fn pause(&mut self) -> bool {
        let delay = sleep(self.config.delay);
        tokio::pin!(delay);

        let Some(shutdown) = self.shutdown.as_mut() else {
            delay.await;
            return true;
        };

        let (interrupted, closed) = tokio::select! {
            () = &mut delay => (false, false),
            res = shutdown.recv() => match res {
                Err(RecvError::Closed) => (false, true),
                Ok(()) | Err(RecvError::Lagged(_)) => (true, false),
            },
        };

        if closed {
            // Nobody can signal anymore; finish the wait.
            self.shutdown = None;
            delay.await;
        }
        if interrupted {
            info!("Shutdown requested during delay");
        }
        !interrupted
    }

    fn shutdown_requested(&mut self) -> bool {
        self.shutdown.as_mut().is_some_and(|rx| {
            matches!(rx.try_recv(), Ok(()) | Err(TryRecvError::Lagged(_)))
        })
    }

    fn emit(
        &self,
        stage: Stage,
        recipient: Option<&str>,
        detail: Option<String>,
        index: usize,
        total: usize,
    ) {
        if let Some(tx) = &self.events {
            let _ = tx.send(ProgressEvent {
                stage,
                recipient: recipient.map(str::to_string),
                detail,
                index,
                total,
            });
        }
    }

    fn finish(&mut self, state: CampaignState) {
        self.state = state;
        self.summary.finished_at = Some(Utc::now());
    }
}
