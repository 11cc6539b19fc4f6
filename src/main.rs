//! CLI entry point for bulk-mailer.

use bulk_mailer::{
    template, Attachment, Campaign, CampaignConfig, CampaignSummary, Credential, Dataset, Error,
    ProgressEvent, RelaySettings, SessionError, Stage, TlsMode, TEST_MODE_LIMIT,
};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bulk-mailer")]
#[command(about = "Send personalized emails to every row of a CSV file")]
struct Cli {
    /// CSV file with a header row
    #[arg(short = 'c', long)]
    csv: PathBuf,

    /// Column holding recipient addresses (default: "Email Address", else the first column)
    #[arg(short = 'a', long)]
    address_column: Option<String>,

    /// Subject template, may contain {Column} placeholders
    #[arg(short = 's', long)]
    subject: String,

    /// Body template, may contain {Column} placeholders
    #[arg(short = 'b', long, conflicts_with = "body_file", required_unless_present = "body_file")]
    body: Option<String>,

    /// Read the body template from a file
    #[arg(long)]
    body_file: Option<PathBuf>,

    /// File to attach to every message (repeatable)
    #[arg(long = "attach")]
    attachments: Vec<PathBuf>,

    /// SMTP relay host
    #[arg(long, env = "BULK_MAILER_HOST", default_value = "smtp.gmail.com")]
    host: String,

    /// SMTP relay port
    #[arg(short = 'p', long, default_value = "587", value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Connection security
    #[arg(long, value_enum, default_value_t = TlsMode::StartTls)]
    tls: TlsMode,

    /// Connection timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Sender address
    #[arg(short = 'f', long, env = "BULK_MAILER_FROM")]
    from: String,

    /// Relay username (defaults to the sender address)
    #[arg(short = 'u', long, env = "BULK_MAILER_USER")]
    user: Option<String>,

    /// Relay password or app password
    #[arg(long, env = "BULK_MAILER_PASSWORD", hide_env_values = true)]
    password: String,

    /// Seconds to wait between two sends
    #[arg(short = 'd', long, default_value = "1", value_parser = clap::value_parser!(u64).range(0..=10))]
    delay: u64,

    /// Send to at most three recipients (the default)
    #[arg(long, conflicts_with = "all")]
    test_mode: bool,

    /// Send to every eligible row instead of the first three
    #[arg(long)]
    all: bool,

    /// Actually send. Without it only the preview is printed.
    #[arg(long)]
    confirm: bool,

    /// Print the final summary as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> std::io::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let dataset = Dataset::load_csv(&cli.csv, cli.address_column.as_deref())?;
    let stats = dataset.stats();
    println!(
        "Loaded {} rows from {} ({} skipped)",
        stats.rows,
        cli.csv.display(),
        stats.skipped_rows
    );
    println!("Address column: {}", dataset.address_field());
    println!("Eligible recipients: {}", stats.eligible);
    if stats.missing_address > 0 {
        println!(
            "{} rows have no address and will be skipped",
            stats.missing_address
        );
    }
    for (i, sample) in stats.samples.iter().enumerate() {
        println!("  {}. {sample}", i + 1);
    }

    let body = match (cli.body, &cli.body_file) {
        (Some(body), _) => body,
        (None, Some(path)) => tokio::fs::read_to_string(path).await?,
        (None, None) => return Err(std::io::Error::other("--body or --body-file is required")),
    };

    let mut attachments = Vec::with_capacity(cli.attachments.len());
    for path in &cli.attachments {
        let attachment = Attachment::from_path(path).await?;
        println!(
            "Attachment: {} ({:.1} KB)",
            attachment.filename(),
            attachment.len() as f64 / 1024.0
        );
        attachments.push(attachment);
    }

    let mut relay = RelaySettings::new(cli.host, cli.port);
    relay.tls = cli.tls;
    relay.timeout = Duration::from_secs(cli.timeout);

    let config = CampaignConfig {
        relay,
        credential: Credential::new(cli.user.unwrap_or_else(|| cli.from.clone()), cli.password),
        sender: cli.from,
        subject: cli.subject,
        body,
        attachments,
        delay: Duration::from_secs(cli.delay),
        test_mode: cli.test_mode || !cli.all,
    };

    let mut campaign = Campaign::new(config, &dataset)?;

    println!("\nAvailable placeholders: {}", template::placeholders(dataset.columns()).join(" "));
    if let Some(preview) = campaign.preview() {
        println!("\n--- Preview (first eligible row) ---");
        println!("To: {}", preview.to);
        println!("Subject: {}", preview.subject);
        println!("\n{}", preview.body);
        for name in &preview.attachments {
            println!("Attachment: {name}");
        }
        println!("------------------------------------\n");
    }

    let planned = campaign.planned_recipients().len();
    if campaign.config().test_mode {
        println!("Test mode: sending to at most {TEST_MODE_LIMIT} recipients ({planned} planned)");
    } else {
        println!("Sending to {planned} recipients");
    }

    if !cli.confirm {
        println!("Nothing sent. Review the preview and re-run with --confirm to send.");
        return Ok(ExitCode::SUCCESS);
    }
    campaign.confirm();

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let mut campaign = campaign.with_events(event_tx).with_shutdown(shutdown_rx);

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event);
        }
    });
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(());
        }
    });

    let connector = campaign.config().connector();
    let result = campaign.run(&connector).await;
    drop(campaign);
    let _ = printer.await;

    match result {
        Ok(summary) => {
            print_summary(&summary, cli.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("{}", failure_message(&e));
            Ok(ExitCode::FAILURE)
        }
    }
}

fn failure_message(err: &Error) -> String {
    match err {
        Error::Session(SessionError::Auth(_)) => format!(
            "{err}\nCheck the username and password. Some providers require an app password."
        ),
        _ => err.to_string(),
    }
}

fn print_event(event: &ProgressEvent) {
    let who = event.recipient.as_deref().unwrap_or_default();
    match event.stage {
        Stage::Connecting => println!("Connecting to relay..."),
        Stage::Connected => println!("Connected"),
        Stage::Sent => println!("[{}/{}] sent to {who}", event.index, event.total),
        Stage::Failed => println!(
            "[{}/{}] failed to send to {who}: {}",
            event.index,
            event.total,
            event.detail.as_deref().unwrap_or_default()
        ),
        Stage::Closed => println!("Connection closed"),
    }
}

fn print_summary(summary: &CampaignSummary, json: bool) -> std::io::Result<()> {
    if json {
        let out = serde_json::to_string_pretty(summary).map_err(std::io::Error::other)?;
        println!("{out}");
        return Ok(());
    }

    println!("\nSent: {}", summary.sent_count);
    println!("Failed: {}", summary.failed_count);
    for failure in &summary.failures {
        println!("  {}: {}", failure.address, failure.reason);
    }
    Ok(())
}
