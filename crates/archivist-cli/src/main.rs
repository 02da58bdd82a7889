//! Archivist CLI (archivectl)
//!
//! Command-line front end of the partition archiver.
//!
//! ## Overview
//!
//! - **archive**: archive a line-delimited file as one partition
//! - **resume-offset**: print where a restarted archiver would continue
//! - **index**: print the index the partition's pointer names
//! - **cat**: print every archived line of a partition in offset order
//!
//! ## Quick Start
//!
//! ```bash
//! # Archive into a local directory
//! archivectl --local-dir /tmp/archive archive --input events.log --topic events
//!
//! # Archive into S3 (credentials from AWS_* variables)
//! archivectl --bucket my-archive --prefix prod archive -i events.log -t events -p 3
//!
//! archivectl --local-dir /tmp/archive resume-offset --topic events
//! archivectl --local-dir /tmp/archive cat --topic events
//! ```
//!
//! ## Configuration
//!
//! Settings come from an optional TOML file (`--config`, `ARCHIVIST_CONFIG`)
//! holding `ArchiverConfig` fields, overridden by flags and their
//! environment variables. Log level is read from `RUST_LOG` (default `info`);
//! logs go to stderr so `cat` and `index` output stays clean.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use object_store::local::LocalFileSystem;
use object_store::ObjectStore;
use tokio::io::AsyncWriteExt;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use archivist_core::ObjectKeys;
use archivist_sink::{
    metrics, ArchiveReader, ArchiveSink, ArchiverConfig, ArchiverRuntime, RecoveryManager,
    RuntimeState, StoreClient, TopicPartition,
};

mod config;
mod source;

use source::{CheckpointCommitter, LineFileSource};

const SINK_NAME: &str = "archivectl";

#[derive(Parser)]
#[command(name = "archivectl")]
#[command(about = "Archivist partition archiver", long_about = None)]
struct Cli {
    /// Archiver config file (TOML)
    #[arg(short, long, env = "ARCHIVIST_CONFIG")]
    config: Option<PathBuf>,

    /// Use a local directory as the object store instead of S3
    #[arg(long, env = "ARCHIVIST_LOCAL_DIR")]
    local_dir: Option<PathBuf>,

    /// S3 bucket
    #[arg(long, env = "ARCHIVIST_BUCKET")]
    bucket: Option<String>,

    /// Key prefix of archived objects
    #[arg(long, env = "ARCHIVIST_PREFIX")]
    prefix: Option<String>,

    /// S3 region
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// S3-compatible endpoint (MinIO, localstack)
    #[arg(long, env = "AWS_ENDPOINT")]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive a line-delimited file as one partition
    Archive {
        /// Input file; line n is the record at offset n
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        topic: String,

        #[arg(short, long, default_value_t = 0)]
        partition: u32,

        /// File holding the committed offset
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Seal a chunk after this many records
        #[arg(long)]
        chunk_max_records: Option<usize>,

        /// Records handed to the sink per poll
        #[arg(long, default_value_t = 1000)]
        batch_size: usize,

        /// Print Prometheus metrics to stderr when done
        #[arg(long)]
        print_metrics: bool,
    },
    /// Print the offset a restarted archiver resumes from
    ResumeOffset {
        #[arg(short, long)]
        topic: String,

        #[arg(short, long, default_value_t = 0)]
        partition: u32,
    },
    /// Print the index named by the partition's pointer
    Index {
        #[arg(short, long)]
        topic: String,

        #[arg(short, long, default_value_t = 0)]
        partition: u32,
    },
    /// Print all archived lines of a partition
    Cat {
        #[arg(short, long)]
        topic: String,

        #[arg(short, long, default_value_t = 0)]
        partition: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .parse()
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    let chunk_max_records = match &cli.command {
        Commands::Archive {
            chunk_max_records, ..
        } => *chunk_max_records,
        _ => None,
    };
    let overrides = config::Overrides {
        bucket: cli.bucket.clone(),
        prefix: cli.prefix.clone(),
        region: cli.region.clone(),
        endpoint: cli.endpoint.clone(),
        chunk_max_records,
    };
    let config = config::load(cli.config.as_deref(), &overrides)?;
    let store = open_store(&cli, &config)?;

    match cli.command {
        Commands::Archive {
            input,
            topic,
            partition,
            checkpoint,
            batch_size,
            print_metrics,
            ..
        } => {
            let tp = TopicPartition::new(topic, partition);
            handle_archive(config, store, tp, input, checkpoint, batch_size, print_metrics).await?
        }
        Commands::ResumeOffset { topic, partition } => {
            let recovery = RecoveryManager::new(
                StoreClient::from_config(store, &config),
                ObjectKeys::new(&config.prefix),
            );
            let tp = TopicPartition::new(topic, partition);
            match recovery.resume_offset(&tp).await? {
                Some(offset) => println!("{}", offset),
                None => println!("none"),
            }
        }
        Commands::Index { topic, partition } => {
            let tp = TopicPartition::new(topic, partition);
            let latest = reader(store, &config)
                .latest(&tp)
                .await?
                .with_context(|| format!("No archive for {}", tp))?;
            tracing::info!(index_key = %latest.index_key, "Latest index");
            println!("{}", serde_json::to_string_pretty(&latest.index)?);
        }
        Commands::Cat { topic, partition } => {
            let tp = TopicPartition::new(topic, partition);
            let data = reader(store, &config).read_partition(&tp).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&data).await?;
            stdout.flush().await?;
        }
    }

    Ok(())
}

/// Pick the object store: a local directory if given, S3 otherwise.
fn open_store(cli: &Cli, config: &ArchiverConfig) -> Result<Arc<dyn ObjectStore>> {
    match &cli.local_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let store = LocalFileSystem::new_with_prefix(dir)
                .with_context(|| format!("Invalid local store directory {}", dir.display()))?;
            tracing::debug!(dir = %dir.display(), "Using local filesystem store");
            Ok(Arc::new(store))
        }
        None => Ok(config
            .build_s3_store()
            .context("Failed to connect to S3")?),
    }
}

fn reader(store: Arc<dyn ObjectStore>, config: &ArchiverConfig) -> ArchiveReader {
    ArchiveReader::new(
        StoreClient::from_config(store, config),
        ObjectKeys::new(&config.prefix),
    )
}

/// Archive `input` as partition `tp` until the file is consumed.
async fn handle_archive(
    config: ArchiverConfig,
    store: Arc<dyn ObjectStore>,
    tp: TopicPartition,
    input: PathBuf,
    checkpoint: Option<PathBuf>,
    batch_size: usize,
    print_metrics: bool,
) -> Result<()> {
    let checkpoint = checkpoint.unwrap_or_else(|| input.with_extension("checkpoint"));
    let committer = Arc::new(CheckpointCommitter::new(checkpoint));

    // The pointer wins over the checkpoint once the sink starts
    let start = committer.read()?.unwrap_or(0);
    let source = LineFileSource::open(&input, tp.clone(), batch_size)?.start_at(start);
    let lines = source.line_count();

    let flush_interval = config.flush_interval();
    let sink = ArchiveSink::new(SINK_NAME, config, committer.clone()).with_store(store);

    let mut runtime = ArchiverRuntime::new();
    let resume = runtime
        .start_sink(Box::new(sink), Box::new(source), vec![tp.clone()], flush_interval)
        .await
        .context("Failed to start archiver")?;
    tracing::info!(
        topic = %tp.topic,
        partition = tp.partition,
        resume_offset = ?resume.get(&tp).copied().flatten(),
        lines,
        "Archiving"
    );

    let state = runtime.wait(SINK_NAME).await?;

    if print_metrics {
        eprint!("{}", metrics::gather_text()?);
    }
    if state == RuntimeState::Failed {
        bail!("Archiving {} failed, see log for the cause", tp);
    }

    let committed = committer.read()?;
    println!(
        "archived {} up to offset {}",
        tp,
        committed.map(|o| o.to_string()).unwrap_or_else(|| "none".to_string())
    );
    Ok(())
}
