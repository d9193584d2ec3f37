/*!
Spool CLI - inspect, enqueue, drain and purge staged OTLP uploads.

Staged payloads live under `<dir>/uploadFiles/<file type>/<id>`, where the file
type is the signal name unless the config overrides it; transfer session
journals live under `<dir>/sessions`.
*/

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use spool_core::{
    concat_encoded, open_exporter, BackgroundExporter, BackgroundHttpClient, DiskStorage,
    ExportResult, ExporterConfig, InMemoryTransport, KeyBuilder, LocalDiskStorage, SignalKind,
};
use tabled::{Table, Tabled};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Parser)]
#[command(name = "spool")]
#[command(about = "Inspect and drain durable background OTLP uploads")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Storage directory holding staged uploads
    #[arg(short, long, global = true, env = "SPOOL_DIR", default_value = "./spool")]
    dir: PathBuf,

    /// Collector base URL; signal paths such as /v1/traces are appended
    #[arg(
        short,
        long,
        global = true,
        env = "OTEL_EXPORTER_OTLP_ENDPOINT",
        default_value = "http://localhost:4318"
    )]
    endpoint: Url,

    /// Exporter configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Extra request header as NAME=VALUE; may be repeated
    #[arg(long = "header", global = true, value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Use an in-memory transfer session; nothing is sent
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List staged uploads
    Status {
        /// Only show one signal (trace, logs, logs_binary, metric)
        #[arg(short, long)]
        signal: Option<SignalKind>,
    },
    /// Stage an encoded OTLP request and schedule its upload
    Enqueue {
        #[arg(short, long)]
        signal: SignalKind,
        /// File holding a protobuf-encoded Export*ServiceRequest
        file: PathBuf,
    },
    /// Upload staged payloads until none are left
    Drain {
        /// Only drain one signal; required when the config sets `file_type`
        #[arg(short, long)]
        signal: Option<SignalKind>,
        /// Give up after this many seconds
        #[arg(short, long, default_value_t = 60)]
        timeout: u64,
    },
    /// Delete staged payloads without uploading them
    Purge {
        #[arg(short, long)]
        signal: Option<SignalKind>,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Tabled)]
struct StagedUpload {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    file_key_type: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Staged")]
    staged_at: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    let storage = Arc::new(LocalDiskStorage::new(&cli.dir));

    match &cli.command {
        Commands::Status { signal } => show_status(&storage, &config, *signal)?,
        Commands::Enqueue { signal, file } => {
            enqueue(&cli, &storage, config, *signal, file).await?
        }
        Commands::Drain { signal, timeout } => {
            drain(&cli, &storage, config, *signal, Duration::from_secs(*timeout)).await?
        }
        Commands::Purge { signal, force } => purge(&storage, &config, *signal, *force)?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn parse_header(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got {value:?}")),
    }
}

fn load_config(cli: &Cli) -> Result<ExporterConfig, anyhow::Error> {
    let mut config = match &cli.config {
        Some(path) => ExporterConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ExporterConfig::default(),
    }
    .with_env_headers();

    config.headers.extend(cli.headers.iter().cloned());
    config.validate()?;
    Ok(config)
}

fn signals(selected: Option<SignalKind>) -> Vec<SignalKind> {
    match selected {
        Some(kind) => vec![kind],
        None => SignalKind::ALL.to_vec(),
    }
}

/// Staging directories of the selected signals, each listed once
///
/// A `file_type` override sends every signal to the same directory.
fn staging_dirs(config: &ExporterConfig, selected: Option<SignalKind>) -> Vec<(String, KeyBuilder)> {
    let mut dirs: Vec<(String, KeyBuilder)> = Vec::new();
    for kind in signals(selected) {
        let file_key_type = config.file_key_type(kind);
        if dirs.iter().all(|(name, _)| *name != file_key_type) {
            let key = KeyBuilder::uploads().append(file_key_type.as_str());
            dirs.push((file_key_type, key));
        }
    }
    dirs
}

/// Signals `drain` opens exporters for
///
/// Exporters of different signals must not share a staging directory, or each
/// would take the others' payloads for orphans.
fn drain_signals(config: &ExporterConfig, selected: Option<SignalKind>) -> Result<Vec<SignalKind>, anyhow::Error> {
    let kinds = signals(selected);
    if let Some(file_type) = &config.file_type {
        if kinds.len() > 1 {
            bail!("file_type {file_type:?} puts every signal in one directory; pass --signal to drain it");
        }
    }
    Ok(kinds)
}

fn staged_count(storage: &LocalDiskStorage, dir: &KeyBuilder) -> usize {
    match storage.list(dir) {
        Ok(items) => items.len(),
        Err(e) => {
            warn!(dir = %dir, error = %e, "Failed to list staged uploads");
            0
        }
    }
}

/// Exporter for `kind`, with the in-memory session when `--dry-run` is set
fn build_exporter(
    cli: &Cli,
    storage: &Arc<LocalDiskStorage>,
    config: ExporterConfig,
    kind: SignalKind,
) -> Result<(Arc<BackgroundExporter<Bytes>>, Option<Arc<InMemoryTransport>>), anyhow::Error> {
    let endpoint = kind.endpoint_for(&cli.endpoint)?;

    if !cli.dry_run {
        let exporter = open_exporter(kind, endpoint, config, storage.clone())?;
        return Ok((exporter, None));
    }

    let transport = Arc::new(InMemoryTransport::new());
    let client = BackgroundHttpClient::new(
        storage.clone(),
        transport.clone(),
        config.retry.clone(),
        format!("dry-run.{kind}"),
    );
    let exporter = Arc::new(BackgroundExporter::new(
        kind,
        endpoint,
        config,
        storage.clone(),
        client,
        concat_encoded,
    ));
    Ok((exporter, Some(transport)))
}

fn print_dry_run(transport: &InMemoryTransport) {
    for (task_id, task) in transport.submitted() {
        println!(
            "would upload {} to {} (task {}, not before {})",
            task.file.display(),
            task.request.url,
            task_id,
            task.earliest_begin.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn show_status(
    storage: &LocalDiskStorage,
    config: &ExporterConfig,
    selected: Option<SignalKind>,
) -> Result<(), anyhow::Error> {
    let mut rows = Vec::new();
    for (file_key_type, dir) in staging_dirs(config, selected) {
        for item in storage.list(&dir)? {
            rows.push(StagedUpload {
                id: item.key,
                file_key_type: file_key_type.clone(),
                size: format_size(item.size),
                staged_at: item
                    .modified
                    .map(|modified| format_timestamp(modified.timestamp()))
                    .unwrap_or_else(|| "Unknown".to_string()),
            });
        }
    }

    if rows.is_empty() {
        println!("No staged uploads in {}", storage.root().display());
        return Ok(());
    }

    rows.sort_by(|a, b| a.staged_at.cmp(&b.staged_at));
    let total = rows.len();
    let table = Table::new(rows);
    println!("{table}");
    println!(
        "{total} staged upload(s), {} on disk",
        format_size(storage.used_size()?)
    );
    Ok(())
}

async fn enqueue(
    cli: &Cli,
    storage: &Arc<LocalDiskStorage>,
    mut config: ExporterConfig,
    kind: SignalKind,
    file: &Path,
) -> Result<(), anyhow::Error> {
    let payload = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let size = payload.len() as u64;
    config.perform_stalled_upload_check = false;

    let (exporter, dry_run) = build_exporter(cli, storage, config, kind)?;
    if exporter.export(&[Bytes::from(payload)], None) == ExportResult::Failure {
        bail!("failed to stage {}", file.display());
    }
    exporter.force_flush().await;

    info!(signal = %kind, size, "Enqueued payload");
    match dry_run {
        Some(transport) => print_dry_run(&transport),
        None => println!(
            "Staged {} for {kind}; run `spool drain` to upload it",
            format_size(size)
        ),
    }
    Ok(())
}

async fn drain(
    cli: &Cli,
    storage: &Arc<LocalDiskStorage>,
    config: ExporterConfig,
    selected: Option<SignalKind>,
    timeout: Duration,
) -> Result<(), anyhow::Error> {
    let kinds = drain_signals(&config, selected)?;
    let dirs = staging_dirs(&config, selected);

    let mut exporters = Vec::new();
    for kind in kinds {
        let (exporter, dry_run) = build_exporter(cli, storage, config.clone(), kind)?;
        if let Some(transport) = dry_run {
            exporter.reconcile().await;
            print_dry_run(&transport);
            continue;
        }
        exporters.push(exporter);
    }
    if cli.dry_run {
        return Ok(());
    }

    let remaining = || -> BTreeMap<String, usize> {
        dirs.iter()
            .map(|(name, dir)| (name.clone(), staged_count(storage, dir)))
            .filter(|(_, count)| *count > 0)
            .collect()
    };

    let deadline = tokio::time::Instant::now() + timeout;
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let left = remaining();
                if left.is_empty() {
                    println!("✓ All staged uploads delivered");
                    break;
                }
                debug!(?left, "Waiting for staged uploads");
                if tokio::time::Instant::now() >= deadline {
                    println!("Timed out with uploads still staged:");
                    for (name, count) in left {
                        println!("  {name}: {count}");
                    }
                    break;
                }
            }
            _ = &mut ctrl_c => {
                println!("Interrupted; staged uploads resume on the next drain");
                break;
            }
        }
    }

    for exporter in &exporters {
        exporter.force_flush().await;
        exporter.shutdown();
    }
    Ok(())
}

fn purge(
    storage: &LocalDiskStorage,
    config: &ExporterConfig,
    selected: Option<SignalKind>,
    force: bool,
) -> Result<(), anyhow::Error> {
    let dirs = staging_dirs(config, selected);
    let total: usize = dirs.iter().map(|(_, dir)| staged_count(storage, dir)).sum();
    if total == 0 {
        println!("Nothing to purge");
        return Ok(());
    }

    if !force {
        print!("Delete {total} staged upload(s)? (y/N): ");
        use std::io::{self, Write};
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().to_lowercase().starts_with('y') {
            println!("Purge cancelled");
            return Ok(());
        }
    }

    let mut deleted = 0;
    for (_, dir) in dirs {
        for item in storage.list(&dir)? {
            storage.delete(&dir.append(item.key))?;
            deleted += 1;
        }
    }
    println!("✓ Deleted {deleted} staged upload(s)");
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(timestamp: i64) -> String {
    use chrono::{Local, TimeZone};

    match Local.timestamp_opt(timestamp, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => timestamp.to_string(),
    }
}
