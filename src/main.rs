/*!
 * ostransfer CLI - multipart download and upload against S3
 *
 * Version: 0.3.0
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use ostransfer::{
    config::{CheckpointConfig, TransferConfig},
    logging, ByteRange, DownloadRequest, Downloader, ObjectKey, ProgressEvent, ProgressEventType,
    S3Store, TransferSummary, UploadRequest, Uploader,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ostransfer")]
#[command(version, about = "Resumable multipart transfers for S3-compatible storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Part size in bytes
    #[arg(long, global = true)]
    part_size: Option<u64>,

    /// Number of concurrent part workers
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Enable checkpointing so an interrupted transfer can resume
    #[arg(long, global = true)]
    checkpoint: bool,

    /// Directory holding checkpoint files (implies --checkpoint)
    #[arg(long, value_name = "DIR", global = true)]
    checkpoint_dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// AWS region
    #[arg(long, global = true)]
    region: Option<String>,

    /// Custom endpoint for S3-compatible services
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Use path-style addressing
    #[arg(long, global = true)]
    path_style: bool,

    /// Hide the progress bar
    #[arg(long, global = true)]
    no_progress: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download an object to a local file
    Download {
        bucket: String,
        key: String,
        dest: PathBuf,

        /// Byte range to download, `start-end` or `start-`
        #[arg(long)]
        range: Option<ByteRange>,
    },

    /// Upload a local file as an object
    Upload {
        src: PathBuf,
        bucket: String,
        key: String,
    },
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    if let Err(e) = logging::init_logging(&config) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let store = Arc::new(
        S3Store::from_env(cli.region.clone(), cli.endpoint.clone(), cli.path_style).await,
    );
    let bar = (!cli.no_progress).then(new_progress_bar);

    let summary = match cli.command {
        Commands::Download {
            bucket,
            key,
            dest,
            range,
        } => {
            let mut request = DownloadRequest::new(ObjectKey::new(bucket, key), dest);
            request.range = range;

            let mut downloader = Downloader::new(store, config);
            if let Some(bar) = &bar {
                downloader = downloader.with_progress(progress_listener(bar.clone()));
            }
            downloader
                .download(&request)
                .await
                .with_context(|| format!("download of {} failed", request.key))?
        }
        Commands::Upload { src, bucket, key } => {
            let request = UploadRequest::new(src, ObjectKey::new(bucket, key));

            let mut uploader = Uploader::new(store, config);
            if let Some(bar) = &bar {
                uploader = uploader.with_progress(progress_listener(bar.clone()));
            }
            uploader
                .upload(&request)
                .await
                .with_context(|| format!("upload to {} failed", request.key))?
        }
    };

    print_summary(&summary);
    Ok(())
}

fn build_config(cli: &Cli) -> Result<TransferConfig> {
    let mut config = match &cli.config {
        Some(path) => TransferConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => TransferConfig::default(),
    };

    if let Some(part_size) = cli.part_size {
        config.part_size = part_size;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if cli.checkpoint || cli.checkpoint_dir.is_some() {
        config.checkpoint = CheckpointConfig {
            enabled: true,
            path: config.checkpoint.path.take(),
            dir: cli.checkpoint_dir.clone().or(config.checkpoint.dir.take()),
        };
    }
    config.verbose |= cli.verbose;
    Ok(config)
}

fn new_progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    bar
}

fn progress_listener(bar: ProgressBar) -> impl Fn(&ProgressEvent) + Send + Sync {
    move |event: &ProgressEvent| match event.event_type {
        ProgressEventType::Started => {
            bar.set_length(event.total_bytes);
            bar.set_position(event.consumed_bytes);
        }
        ProgressEventType::Data => bar.set_position(event.consumed_bytes),
        ProgressEventType::Completed => bar.finish(),
        ProgressEventType::Failed => bar.abandon(),
    }
}

fn print_summary(summary: &TransferSummary) {
    let mut line = format!(
        "Transferred {} of {} bytes in {} parts ({:.1?}, {:.2} MB/s)",
        summary.transferred_bytes,
        summary.total_bytes,
        summary.parts,
        summary.duration,
        summary.throughput() / 1_048_576.0
    );
    if summary.resumed {
        line.push_str(&format!(", resumed {} bytes", summary.resumed_bytes));
    }
    if let Some(object) = &summary.object {
        if let Some(etag) = &object.etag {
            line.push_str(&format!(", etag {}", etag));
        }
    }
    println!("{}", line);
}
