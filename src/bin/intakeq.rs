//! intakeq CLI — operator interface to the report-intake queue.

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::{Parser, Subcommand};

use intakeq::config::Config;
use intakeq::hooks::{FsAttachmentStore, LogNotifier};
use intakeq::model::{AttachmentInput, AttachmentSource, NewSubmission, ReportStatus};
use intakeq::queue::{QueueDir, TerminalOutcome};
use intakeq::store::DocumentStore;
use intakeq::telemetry;
use intakeq::worker::Worker;

#[derive(Parser)]
#[command(name = "intakeq", about = "Durable report-intake queue and commit worker")]
struct Cli {
    /// Path to a config file (default: intakeq.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker daemon
    Serve,
    /// Enqueue a submission
    Submit {
        /// The identity field (e.g. subject name)
        subject: String,
        /// Descriptive field as key=value (repeatable)
        #[arg(long = "field")]
        fields: Vec<String>,
        /// File to attach inline (repeatable)
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
        /// Already-stored attachment as name=location (repeatable)
        #[arg(long = "attach-ref")]
        attachment_refs: Vec<String>,
    },
    /// Queue inspection
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Committed report operations
    Report {
        #[command(subcommand)]
        action: ReportAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List pending entries
    List,
    /// List entries parked for operator inspection
    Parked,
    /// List archived (committed) entries
    Archived,
}

#[derive(Subcommand)]
enum ReportAction {
    /// List committed reports
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
    },
    /// Show a report
    Show {
        /// Report ID (full UUID or prefix)
        id: String,
    },
    /// Change a report's status
    SetStatus {
        /// Report ID (full UUID or prefix)
        id: String,
        /// One of: new, in-review, resolved, dismissed
        status: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => cmd_serve(config).await,
        Command::Submit {
            subject,
            fields,
            attachments,
            attachment_refs,
        } => cmd_submit(config, subject, fields, attachments, attachment_refs).await,
        Command::Queue { action } => cmd_queue(config, action).await,
        Command::Report { action } => cmd_report(config, action).await,
    }
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    telemetry::init(&config.log_level)?;

    let queue = Arc::new(QueueDir::open(&config.data_dir).await?);
    let store = Arc::new(DocumentStore::open(config.snapshot_path()).await?);
    let attachments = Arc::new(FsAttachmentStore::new(config.attachments_dir()));

    let worker = Worker::new(
        queue,
        store,
        attachments,
        Arc::new(LogNotifier),
        config.worker.clone(),
    );

    let handle = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    worker.run().await?;
    Ok(())
}

async fn cmd_submit(
    config: Config,
    subject: String,
    fields: Vec<String>,
    attachments: Vec<PathBuf>,
    attachment_refs: Vec<String>,
) -> anyhow::Result<()> {
    let mut submission = NewSubmission::new(subject);

    for field in &fields {
        let (key, value) = split_pair(field)?;
        submission = submission.field(key, value);
    }

    for path in &attachments {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("bad attachment path: {}", path.display()))?;
        submission = submission.attachment(AttachmentInput {
            name: name.to_string(),
            content_type: "application/octet-stream".to_string(),
            source: AttachmentSource::Inline {
                data: BASE64.encode(&bytes),
            },
        });
    }

    for reference in &attachment_refs {
        let (name, location) = split_pair(reference)?;
        submission = submission.attachment(AttachmentInput {
            name: name.to_string(),
            content_type: "application/octet-stream".to_string(),
            source: AttachmentSource::Reference {
                location: location.to_string(),
            },
        });
    }

    let queue = QueueDir::open(&config.data_dir).await?;
    let queue_id = queue.enqueue(submission.build()).await?;
    println!("Accepted: {queue_id}");
    Ok(())
}

async fn cmd_queue(config: Config, action: QueueAction) -> anyhow::Result<()> {
    let queue = QueueDir::open(&config.data_dir).await?;

    match action {
        QueueAction::List => {
            let entries = queue.list_pending().await?;
            if entries.is_empty() {
                println!("Queue is empty.");
                return Ok(());
            }
            println!("{:<22}  {:<7}  ENQUEUED", "QUEUE_ID", "ATTEMPT");
            println!("{}", "-".repeat(60));
            for entry in &entries {
                println!(
                    "{:<22}  {:<7}  {}",
                    entry.queue_id,
                    entry.attempt,
                    entry.enqueued_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!("\n{} entry(ies)", entries.len());
        }
        QueueAction::Parked => {
            let parked = queue.list_parked().await?;
            if parked.is_empty() {
                println!("No parked entries.");
                return Ok(());
            }
            for retired in &parked {
                if let TerminalOutcome::Parked {
                    parked_at,
                    error,
                    attempts,
                } = &retired.outcome
                {
                    println!(
                        "{}  parked {} after {} attempt(s): {}",
                        retired.queue_id,
                        parked_at.format("%Y-%m-%d %H:%M:%S"),
                        attempts,
                        error
                    );
                }
            }
        }
        QueueAction::Archived => {
            let archived = queue.list_archived().await?;
            if archived.is_empty() {
                println!("No archived entries.");
                return Ok(());
            }
            for retired in &archived {
                if let TerminalOutcome::Committed {
                    committed_at,
                    report_id,
                } = &retired.outcome
                {
                    println!(
                        "{}  committed {} -> report {}",
                        retired.queue_id,
                        committed_at.format("%Y-%m-%d %H:%M:%S"),
                        report_id
                    );
                }
            }
        }
    }
    Ok(())
}

async fn cmd_report(config: Config, action: ReportAction) -> anyhow::Result<()> {
    let store = DocumentStore::open(config.snapshot_path()).await?;

    match action {
        ReportAction::List { status } => {
            let status_filter: Option<ReportStatus> = status.map(|s| s.parse()).transpose()?;
            let snapshot = store.read().await;

            let reports: Vec<_> = snapshot
                .reports
                .values()
                .filter(|r| status_filter.is_none_or(|s| r.status == s))
                .collect();

            if reports.is_empty() {
                println!("No reports found.");
                return Ok(());
            }

            println!(
                "{:<8}  {:<10}  {:<30}  {:<5}  LAST_SEEN",
                "ID", "STATUS", "SUBJECT", "ATT"
            );
            println!("{}", "-".repeat(80));
            for report in &reports {
                let subject: String = report.subject.chars().take(30).collect();
                println!(
                    "{:<8}  {:<10}  {:<30}  {:<5}  {}",
                    report.id,
                    report.status.to_string(),
                    subject,
                    report.attachments.len(),
                    report.last_seen_at.format("%Y-%m-%d %H:%M")
                );
            }
            println!("\n{} report(s), snapshot v{}", reports.len(), snapshot.version);
        }
        ReportAction::Show { id } => {
            let snapshot = store.read().await;
            let report = snapshot.find_by_id(&id)?;

            println!("ID:          {}", report.id.0);
            println!("Subject:     {}", report.subject);
            println!("Identity:    {}", report.identity_key);
            println!("Status:      {}", report.status);
            println!("First Seen:  {}", report.first_seen_at);
            println!("Last Seen:   {}", report.last_seen_at);
            if !report.fields.is_empty() {
                println!("Fields:");
                for (key, value) in &report.fields {
                    println!("  {key}: {value}");
                }
            }
            if !report.attachments.is_empty() {
                println!("Attachments:");
                for attachment in &report.attachments {
                    println!(
                        "  {} ({}, {} bytes) -> {}",
                        attachment.name, attachment.content_type, attachment.size,
                        attachment.location
                    );
                }
            }
            println!(
                "Applied:     {} entry(ies)",
                report.applied_entries.len()
            );
        }
        ReportAction::SetStatus { id, status } => {
            let status: ReportStatus = status.parse()?;
            let report = store.set_status(&id, status).await?;
            println!("Report {} -> {}", report.id, report.status);
        }
    }
    Ok(())
}

fn split_pair(raw: &str) -> anyhow::Result<(&str, &str)> {
    raw.split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected key=value, got: {raw}"))
}
