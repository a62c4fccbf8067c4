mod config;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use config::Config;
use fixity_core::ingest::load_checksum_report_into_ledger;
use fixity_core::operations::{
    CorrectOperation, CorrectOperationRequest, ExportKind, ExportLedgerOperation,
    ExportLedgerOperationRequest, FindGoodReplicaOperation, FindGoodReplicaOperationOutcome,
    FindGoodReplicaOperationRequest, GetChecksumOperation, GetChecksumOperationOutcome,
    GetChecksumOperationRequest, IngestReportOperation, IngestReportOperationRequest,
    UpdateChecksumStatusOperation, UpdateChecksumStatusOperationRequest, UploadOperation,
    UploadOperationOutcome, UploadOperationRequest,
};
use fixity_core::{ReplicaSummary, ReportKind};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "fixity")]
#[command(about = "Checksum ledgers and replica consistency checks for archive storage")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "fixity.yaml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Operate on the local replica's checksum ledger
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
    /// Ingest reports and inspect cross-replica consistency
    Replicas {
        #[command(subcommand)]
        command: ReplicasCommand,
    },
}

#[derive(Subcommand)]
enum LedgerCommand {
    /// Archive the checksum of a file
    Upload {
        file: PathBuf,
        /// Name to archive under, defaults to the file name
        #[arg(long)]
        name: Option<String>,
    },
    /// Replace a ledger entry with the checksum of a good copy
    Correct {
        file: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Print the archived checksum of a file
    Checksum { filename: String },
    /// Print the whole ledger
    Export {
        /// Print only the filenames
        #[arg(long)]
        filenames: bool,
    },
    /// Seed the ledger from a checksum report
    Load { report: PathBuf },
    /// Check the free space margin of the ledger
    Space,
    /// Print superseded and quarantined entries
    DeadEntries,
}

#[derive(Subcommand)]
enum ReplicasCommand {
    /// Ingest a checksum report produced on a replica
    IngestChecksums { replica: String, report: PathBuf },
    /// Ingest the complete file list of a replica
    IngestFilelist { replica: String, report: PathBuf },
    /// Re-vote reported checksums and flag corrupt copies
    UpdateStatus {
        #[arg(long)]
        filename: Option<String>,
    },
    /// Print per-replica counters
    Status { replica: Option<String> },
    /// Find a bitarchive holding a verified copy of a file
    GoodCopy {
        filename: String,
        #[arg(long)]
        exclude: Option<String>,
    },
    /// Print every (file, replica) row
    Dump,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fixity=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let cfg = match Config::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Ledger { command } => run_ledger(&cfg, command).await,
        Commands::Replicas { command } => run_replicas(&cfg, command).await,
    };

    if let Err(e) = result {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run_ledger(cfg: &Config, command: LedgerCommand) -> anyhow::Result<()> {
    let ledger = cfg.open_ledger()?;

    match command {
        LedgerCommand::Upload { file, name } => {
            let filename = archive_name(&file, name)?;
            let content = open_archive_file(&file)?;
            let outcome = UploadOperation::new(ledger)
                .run(UploadOperationRequest { filename, content })
                .await?;
            match outcome {
                UploadOperationOutcome::Archived(result) => {
                    println!("archived {}##{}", result.filename, result.checksum)
                }
                UploadOperationOutcome::AlreadyArchived(result) => {
                    println!("already archived {}##{}", result.filename, result.checksum)
                }
            }
        }
        LedgerCommand::Correct { file, name } => {
            let filename = archive_name(&file, name)?;
            let content = open_archive_file(&file)?;
            let result = CorrectOperation::new(ledger)
                .run(CorrectOperationRequest { filename, content })
                .await?;
            println!(
                "removed {} (now {})",
                result.removed.to_line(),
                result.removed.replacement_checksum
            );
        }
        LedgerCommand::Checksum { filename } => {
            let outcome = GetChecksumOperation::new(ledger)
                .run(GetChecksumOperationRequest {
                    filename: filename.clone(),
                })
                .await?;
            match outcome {
                GetChecksumOperationOutcome::Found(result) => println!("{}", result.checksum),
                GetChecksumOperationOutcome::NotFound => {
                    anyhow::bail!("no checksum archived for '{}'", filename)
                }
            }
        }
        LedgerCommand::Export { filenames } => {
            let kind = if filenames {
                ExportKind::Filenames
            } else {
                ExportKind::Checksums
            };
            let result = ExportLedgerOperation::new(ledger)
                .run(ExportLedgerOperationRequest { kind })
                .await?;
            std::io::stdout()
                .write_all(&result.body)
                .context("failed to write export")?;
            tracing::info!("Exported {} ledger entries", result.entries);
        }
        LedgerCommand::Load { report } => {
            let file = File::open(&report)
                .with_context(|| format!("failed to open report {:?}", report))?;
            let summary = tokio::task::spawn_blocking(move || {
                load_checksum_report_into_ledger(ledger.as_ref(), BufReader::new(file))
            })
            .await??;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        LedgerCommand::Space => {
            let enough = tokio::task::spawn_blocking(move || ledger.has_enough_space()).await?;
            if !enough {
                anyhow::bail!(
                    "less than {} bytes left for the ledger",
                    cfg.ledger.min_space_left
                );
            }
            println!("ok");
        }
        LedgerCommand::DeadEntries => {
            let entries = tokio::task::spawn_blocking(move || ledger.dead_entries()).await??;
            for entry in entries {
                println!("{}", entry.to_line());
            }
        }
    }

    Ok(())
}

async fn run_replicas(cfg: &Config, command: ReplicasCommand) -> anyhow::Result<()> {
    let store = cfg.open_consistency_store()?;

    match command {
        ReplicasCommand::IngestChecksums { replica, report } => {
            ingest(&store, replica, ReportKind::Checksum, &report).await?;
        }
        ReplicasCommand::IngestFilelist { replica, report } => {
            ingest(&store, replica, ReportKind::Filelist, &report).await?;
        }
        ReplicasCommand::UpdateStatus { filename } => {
            let result = UpdateChecksumStatusOperation::new(store)
                .run(UpdateChecksumStatusOperationRequest { filename })
                .await?;
            println!("voted {} files", result.files_voted);
            for (replica, wrong) in &result.wrong_files {
                println!("{}: {} wrong files", replica, wrong);
            }
        }
        ReplicasCommand::Status { replica } => {
            let ids: Vec<String> = match replica {
                Some(id) => vec![id],
                None => store.replicas().iter().map(|r| r.id.clone()).collect(),
            };
            let summaries = tokio::task::spawn_blocking(move || {
                ids.iter()
                    .map(|id| store.replica_summary(id))
                    .collect::<fixity_core::Result<Vec<ReplicaSummary>>>()
            })
            .await??;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        ReplicasCommand::GoodCopy { filename, exclude } => {
            let outcome = FindGoodReplicaOperation::new(store)
                .run(FindGoodReplicaOperationRequest {
                    filename: filename.clone(),
                    exclude_replica: exclude,
                })
                .await?;
            match outcome {
                FindGoodReplicaOperationOutcome::Found(replica) => println!("{}", replica.id),
                FindGoodReplicaOperationOutcome::NoneAvailable => {
                    anyhow::bail!("no bitarchive holds a verified copy of '{}'", filename)
                }
            }
        }
        ReplicasCommand::Dump => {
            let text = tokio::task::spawn_blocking(move || store.retrieve_as_text()).await??;
            print!("{}", text);
        }
    }

    Ok(())
}

async fn ingest(
    store: &std::sync::Arc<fixity_core::ConsistencyStore>,
    replica_id: String,
    kind: ReportKind,
    report: &Path,
) -> anyhow::Result<()> {
    let body = read_file(report)?;
    let result = IngestReportOperation::new(store.clone())
        .run(IngestReportOperationRequest {
            replica_id,
            kind,
            body,
        })
        .await?;
    println!("{}", serde_json::to_string_pretty(&result.summary)?);
    Ok(())
}

fn open_archive_file(path: &Path) -> anyhow::Result<Box<dyn Read + Send>> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    Ok(Box::new(BufReader::new(file)))
}

fn read_file(path: &Path) -> anyhow::Result<Bytes> {
    let data = std::fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
    Ok(Bytes::from(data))
}

fn archive_name(file: &Path, name: Option<String>) -> anyhow::Result<String> {
    match name {
        Some(name) => Ok(name),
        None => file
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .with_context(|| format!("cannot derive an archive name from {:?}", file)),
    }
}
