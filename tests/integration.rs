//! Integration tests for the SMTP session against an in-process relay.

#![allow(clippy::similar_names)]

use base64::prelude::*;
use bulk_mailer::{
    Attachment, Campaign, CampaignConfig, CampaignState, Connector, Credential, Dataset,
    DeliveryError, Error, OutgoingMessage, RelaySession, RelaySettings, SessionError,
    SmtpConnector, TlsMode,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const USER: &str = "team@example.com";
const PASSWORD: &str = "app-password";

/// A message accepted by the fake relay.
#[derive(Debug, Clone)]
struct Delivered {
    from: String,
    to: Vec<String>,
    data: String,
}

#[derive(Clone, Default)]
struct RelayLog {
    delivered: Arc<Mutex<Vec<Delivered>>>,
    connections: Arc<AtomicUsize>,
    quits: Arc<AtomicUsize>,
}

impl RelayLog {
    fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().unwrap().clone()
    }
}

/// Minimal submission server: EHLO, AUTH PLAIN/LOGIN, MAIL, RCPT, DATA, RSET, QUIT.
/// Recipients containing `reject` are refused with 550.
struct FakeRelay {
    addr: SocketAddr,
    log: RelayLog,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeRelay {
    async fn start(reject: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = RelayLog::default();
        let accept_log = log.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_log.connections.fetch_add(1, Ordering::SeqCst);
                let log = accept_log.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, log, reject).await;
                });
            }
        });
        Self { addr, log, handle }
    }

    fn connector(&self, password: &str) -> SmtpConnector {
        let mut settings = RelaySettings::new("127.0.0.1", self.addr.port());
        settings.tls = TlsMode::Plain;
        settings.timeout = Duration::from_secs(5);
        SmtpConnector::new(settings, Credential::new(USER, password))
    }

    /// Stop accepting connections. Sessions already open keep running.
    async fn refuse_new_connections(&mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }

    fn stop(self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    log: RelayLog,
    reject: &str,
) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    write.write_all(b"220 localhost ESMTP fake-relay\r\n").await?;

    let mut authenticated = false;
    let mut login_user: Option<String> = None;
    let mut awaiting_login_user = false;
    let mut mail_from: Option<String> = None;
    let mut rcpt_to: Vec<String> = Vec::new();

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end();
        let cmd = trimmed.to_uppercase();

        if awaiting_login_user {
            awaiting_login_user = false;
            login_user = Some(decode(trimmed));
            write.write_all(b"334 UGFzc3dvcmQ6\r\n").await?;
            continue;
        }
        if let Some(user) = login_user.take() {
            let ok = user == USER && decode(trimmed) == PASSWORD;
            authenticated = ok;
            write_auth_result(&mut write, ok).await?;
            continue;
        }

        if cmd.starts_with("EHLO") || cmd.starts_with("HELO") {
            write
                .write_all(b"250-localhost Hello\r\n250-AUTH PLAIN LOGIN\r\n250 8BITMIME\r\n")
                .await?;
        } else if cmd.starts_with("AUTH PLAIN ") {
            let decoded = BASE64_STANDARD.decode(trimmed[11..].trim()).unwrap_or_default();
            let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
            let ok = parts.len() == 3 && parts[1] == USER.as_bytes() && parts[2] == PASSWORD.as_bytes();
            authenticated = ok;
            write_auth_result(&mut write, ok).await?;
        } else if cmd.starts_with("AUTH LOGIN") {
            awaiting_login_user = true;
            write.write_all(b"334 VXNlcm5hbWU6\r\n").await?;
        } else if cmd.starts_with("MAIL FROM:") {
            if authenticated {
                mail_from = Some(extract_address(&trimmed[10..]));
                write.write_all(b"250 OK\r\n").await?;
            } else {
                write.write_all(b"530 Authentication required\r\n").await?;
            }
        } else if cmd.starts_with("RCPT TO:") {
            let addr = extract_address(&trimmed[8..]);
            if addr.contains(reject) {
                write.write_all(b"550 5.1.1 Mailbox unavailable\r\n").await?;
            } else {
                rcpt_to.push(addr);
                write.write_all(b"250 OK\r\n").await?;
            }
        } else if cmd == "DATA" {
            write.write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n").await?;
            let mut data = String::new();
            loop {
                let mut data_line = String::new();
                if reader.read_line(&mut data_line).await? == 0 {
                    return Ok(());
                }
                if data_line.trim_end() == "." {
                    break;
                }
                data.push_str(&data_line);
            }
            log.delivered.lock().unwrap().push(Delivered {
                from: mail_from.take().unwrap_or_default(),
                to: std::mem::take(&mut rcpt_to),
                data,
            });
            write.write_all(b"250 OK: queued\r\n").await?;
        } else if cmd == "RSET" {
            mail_from = None;
            rcpt_to.clear();
            write.write_all(b"250 OK\r\n").await?;
        } else if cmd == "NOOP" {
            write.write_all(b"250 OK\r\n").await?;
        } else if cmd == "QUIT" {
            log.quits.fetch_add(1, Ordering::SeqCst);
            write.write_all(b"221 Bye\r\n").await?;
            return Ok(());
        } else {
            write.write_all(b"500 Command not recognized\r\n").await?;
        }
    }
}

async fn write_auth_result(
    write: &mut tokio::net::tcp::OwnedWriteHalf,
    ok: bool,
) -> std::io::Result<()> {
    if ok {
        write.write_all(b"235 2.7.0 Authentication successful\r\n").await
    } else {
        write.write_all(b"535 5.7.8 Authentication credentials invalid\r\n").await
    }
}

fn decode(encoded: &str) -> String {
    BASE64_STANDARD
        .decode(encoded.trim())
        .map(|d| String::from_utf8_lossy(&d).into_owned())
        .unwrap_or_default()
}

fn extract_address(s: &str) -> String {
    let s = s.trim();
    match (s.find('<'), s.find('>')) {
        (Some(start), Some(end)) if end > start => s[start + 1..end].to_string(),
        _ => s.split_whitespace().next().unwrap_or_default().to_string(),
    }
}

fn message(to: &str, attachments: Vec<Attachment>) -> OutgoingMessage {
    OutgoingMessage {
        from: USER.to_string(),
        to: to.to_string(),
        subject: "Hello".to_string(),
        body: "Hi there".to_string(),
        attachments: attachments.into(),
    }
}

fn campaign_config(relay: &FakeRelay, password: &str, attachments: Vec<Attachment>) -> CampaignConfig {
    let connector = relay.connector(password);
    CampaignConfig {
        relay: connector.settings().clone(),
        sender: USER.to_string(),
        credential: Credential::new(USER, password),
        subject: "Welcome {Name}".to_string(),
        body: "Dear {Name},\n\nYour seat is {Seat}.\n".to_string(),
        attachments,
        delay: Duration::ZERO,
        test_mode: false,
    }
}

const CSV: &str = "\
Name, Email Address ,Seat
Ada,ada@example.com,A1
Bob,bob-reject@example.com,B2
Nobody,,C3
Cy,cy@example.com,
";

#[tokio::test]
async fn test_session_delivers_message_with_attachment() {
    let relay = FakeRelay::start("reject").await;
    let mut session = relay.connector(PASSWORD).open().await.unwrap();

    let payload = vec![0u8, 1, 2, 250, 251, 255];
    let attachment = Attachment::new("data.bin", payload.clone());
    session
        .send(&message("ada@example.com", vec![attachment]))
        .await
        .unwrap();
    session.close().await;

    let delivered = relay.log.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].from, USER);
    assert_eq!(delivered[0].to, ["ada@example.com"]);
    assert!(delivered[0].data.contains("Subject: Hello"));
    assert!(delivered[0].data.contains("Hi there"));
    assert!(delivered[0]
        .data
        .contains("Content-Disposition: attachment; filename=\"data.bin\""));
    assert!(delivered[0].data.contains(&BASE64_STANDARD.encode(&payload)));
    assert_eq!(relay.log.quits.load(Ordering::SeqCst), 1);

    relay.stop();
}

#[tokio::test]
async fn test_wrong_password_is_auth_error() {
    let relay = FakeRelay::start("reject").await;
    let err = relay.connector("wrong").open().await.err().unwrap();
    assert!(matches!(err, SessionError::Auth(_)), "got {err:?}");
    relay.stop();
}

#[tokio::test]
async fn test_refused_connection_is_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut settings = RelaySettings::new("127.0.0.1", port);
    settings.tls = TlsMode::Plain;
    settings.timeout = Duration::from_secs(2);
    let connector = SmtpConnector::new(settings, Credential::new(USER, PASSWORD));

    let err = connector.open().await.err().unwrap();
    assert!(matches!(err, SessionError::Connection(_)), "got {err:?}");
}

#[tokio::test]
async fn test_missing_starttls_is_connection_error() {
    let relay = FakeRelay::start("reject").await;
    let mut connector = relay.connector(PASSWORD);
    let mut settings = connector.settings().clone();
    settings.tls = TlsMode::StartTls;
    connector = SmtpConnector::new(settings, Credential::new(USER, PASSWORD));

    let err = connector.open().await.err().unwrap();
    match err {
        SessionError::Connection(msg) => assert!(msg.contains("STARTTLS")),
        other => panic!("expected connection error, got {other:?}"),
    }
    relay.stop();
}

#[tokio::test]
async fn test_rejected_recipient_then_session_recovers() {
    let relay = FakeRelay::start("reject").await;
    let mut session = relay.connector(PASSWORD).open().await.unwrap();

    let err = session
        .send(&message("bob-reject@example.com", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::Rejected(_)), "got {err:?}");

    session
        .send(&message("cy@example.com", vec![]))
        .await
        .unwrap();
    session.close().await;

    let delivered = relay.log.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].to, ["cy@example.com"]);
    assert_eq!(relay.log.connections.load(Ordering::SeqCst), 2);

    relay.stop();
}

#[tokio::test]
async fn test_failed_reconnect_is_reported_for_that_message() {
    let mut relay = FakeRelay::start("reject").await;
    let mut session = relay.connector(PASSWORD).open().await.unwrap();
    relay.refuse_new_connections().await;

    let err = session
        .send(&message("bob-reject@example.com", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::Rejected(_)), "got {err:?}");

    let err = session
        .send(&message("cy@example.com", vec![]))
        .await
        .unwrap_err();
    assert!(
        matches!(err, DeliveryError::Reconnect(SessionError::Connection(_))),
        "got {err:?}"
    );
    session.close().await;

    assert!(relay.log.delivered().is_empty());
    assert_eq!(relay.log.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalid_address_does_not_touch_connection() {
    let relay = FakeRelay::start("reject").await;
    let mut session = relay.connector(PASSWORD).open().await.unwrap();

    let err = session.send(&message("not-an-address", vec![])).await.unwrap_err();
    assert!(matches!(err, DeliveryError::InvalidAddress(_)));

    session.send(&message("ada@example.com", vec![])).await.unwrap();
    session.close().await;
    assert_eq!(relay.log.connections.load(Ordering::SeqCst), 1);

    relay.stop();
}

#[tokio::test]
async fn test_campaign_end_to_end() {
    let relay = FakeRelay::start("reject").await;
    let dataset = Dataset::from_csv_reader(CSV.as_bytes(), None).unwrap();
    assert_eq!(dataset.address_field(), "Email Address");

    let attachment = Attachment::new("cv.pdf", b"%PDF-1.4 fake cv".to_vec());
    let config = campaign_config(&relay, PASSWORD, vec![attachment]);
    let connector = config.connector();
    let mut campaign = Campaign::new(config, &dataset).unwrap();
    campaign.confirm();

    let summary = campaign.run(&connector).await.unwrap();

    assert_eq!(summary.sent_count, 2);
    assert_eq!(summary.failed_count, 1);
    assert_eq!(summary.failures[0].address, "bob-reject@example.com");
    assert_eq!(campaign.state(), CampaignState::Completed);

    let delivered = relay.log.delivered();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].to, ["ada@example.com"]);
    assert!(delivered[0].data.contains("Subject: Welcome Ada"));
    assert!(delivered[0].data.contains("Your seat is A1."));
    assert_eq!(delivered[1].to, ["cy@example.com"]);
    assert!(delivered[1].data.contains("Your seat is ."));

    let encoded = BASE64_STANDARD.encode(b"%PDF-1.4 fake cv");
    assert!(delivered.iter().all(|d| d.data.contains(&encoded)));

    relay.stop();
}

#[tokio::test]
async fn test_campaign_auth_failure_sends_nothing() {
    let relay = FakeRelay::start("reject").await;
    let dataset = Dataset::from_csv_reader(CSV.as_bytes(), None).unwrap();
    let config = campaign_config(&relay, "wrong", vec![]);
    let connector = config.connector();
    let mut campaign = Campaign::new(config, &dataset).unwrap();
    campaign.confirm();

    let err = campaign.run(&connector).await.unwrap_err();

    assert!(matches!(err, Error::Session(SessionError::Auth(_))));
    assert_eq!(campaign.state(), CampaignState::AbortedOnAuth);
    assert_eq!(campaign.summary().attempted(), 0);
    assert!(relay.log.delivered().is_empty());

    relay.stop();
}
