use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use wavecache::compression::CompressionScheme;
use wavecache::config::{AppConfig, EngineSettings};
use wavecache::db::Database;
use wavecache::{CacheEngine, Location, Query, QueryHandle, Urgency};

#[derive(Parser)]
#[command(name = "wavecache", version, about = "Waveform cache for audio libraries")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum UrgencyArg {
    Needed,
    Desired,
    Bulk,
}

impl From<UrgencyArg> for Urgency {
    fn from(arg: UrgencyArg) -> Self {
        match arg {
            UrgencyArg::Needed => Urgency::Needed,
            UrgencyArg::Desired => Urgency::Desired,
            UrgencyArg::Bulk => Urgency::Bulk,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compute waveforms for audio files and directories
    Analyze {
        /// Files or directories (defaults to config file music_dirs)
        paths: Vec<PathBuf>,

        /// Re-analyze even if a waveform is already stored
        #[arg(long)]
        force: bool,

        /// Scheduling tier for the submitted files
        #[arg(short, long, value_enum, default_value = "bulk")]
        urgency: UrgencyArg,
    },

    /// Print a summary of a stored waveform
    Show {
        /// File path or URL
        path: String,

        /// Subsong index within the file
        #[arg(short, long, default_value = "0")]
        subsong: u32,
    },

    /// Delete a stored waveform
    Remove {
        /// File path or URL
        path: String,

        /// Subsong index within the file
        #[arg(short, long, default_value = "0")]
        subsong: u32,
    },

    /// Remove waveforms whose files no longer exist
    Prune,

    /// Reclaim free space in the database
    Compact,

    /// Re-analyze every stored waveform
    Rescan,

    /// Finish jobs left over from an interrupted run
    Resume,

    /// List jobs persisted by the last run
    Jobs,

    /// Show database statistics
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = AppConfig::load();

    // Resolve database path: CLI > config > XDG default
    let db_path = cli
        .db_path
        .or(config.db_path.clone())
        .unwrap_or_else(wavecache::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    let settings = config.engine_settings();

    match cli.command {
        Commands::Analyze {
            paths,
            force,
            urgency,
        } => {
            // Resolve paths: CLI args > config music_dirs
            let roots = if !paths.is_empty() {
                paths
            } else if !config.music_dirs.is_empty() {
                config.music_dirs.clone()
            } else {
                anyhow::bail!(
                    "Nothing to analyze. Pass paths as arguments or set music_dirs in config."
                );
            };
            let roots = roots
                .iter()
                .map(|p| {
                    std::fs::canonicalize(p).with_context(|| format!("Cannot open {}", p.display()))
                })
                .collect::<Result<Vec<_>>>()?;

            let locations = wavecache::scanner::collect_audio_files(&roots);
            if locations.is_empty() {
                println!("No audio files found");
                return Ok(());
            }

            let mut engine = open_engine(&db_path, settings)?;
            engine.start().context("Failed to start cache engine")?;

            let queries: Vec<QueryHandle> = locations
                .into_iter()
                .map(|l| Query::new(l, urgency.into()).forced(force).into_handle())
                .collect();
            for query in &queries {
                engine.get_waveform(query);
            }

            track_queries(&engine, &queries)?;
            engine.shutdown().context("Failed to shut down cache engine")?;

            let failed = queries
                .iter()
                .filter(|q| !q.waveform().is_some_and(|w| w.is_complete()))
                .count();
            println!(
                "Analysis complete: {} files, {} failed",
                queries.len(),
                failed
            );
        }

        Commands::Show { path, subsong } => {
            let db = open_store(&db_path, config.compression)?;
            let location = resolve_location(&path, subsong);
            let waveform = db
                .get_waveform(&location)
                .context("Failed to read waveform")?
                .with_context(|| format!("No waveform stored for {}", location))?;

            println!("{}", location);
            println!(
                "Channels:      {} (map {:#06x})",
                waveform.channel_count(),
                waveform.channel_map()
            );
            println!("Valid buckets: {}", waveform.valid_buckets());
            println!();
            println!("{:>7} {:>10} {:>10} {:>8} {:>8}", "Channel", "Min", "Max", "Peak", "RMS");
            println!("{}", "-".repeat(47));
            for ch in 0..waveform.channel_count() {
                let min = waveform.minimum(ch).iter().copied().fold(f32::INFINITY, f32::min);
                let max = waveform.maximum(ch).iter().copied().fold(f32::NEG_INFINITY, f32::max);
                println!(
                    "{:>7} {:>10.4} {:>10.4} {:>8.4} {:>8.4}",
                    ch,
                    min,
                    max,
                    waveform.peak(ch),
                    waveform.mean_rms(ch)
                );
            }
        }

        Commands::Remove { path, subsong } => {
            let db = open_store(&db_path, config.compression)?;
            let location = resolve_location(&path, subsong);
            if db.remove_waveform(&location).context("Failed to remove waveform")? {
                println!("Removed {}", location);
            } else {
                println!("No waveform stored for {}", location);
            }
        }

        Commands::Prune => {
            run_maintenance(&db_path, settings, "Pruning", CacheEngine::remove_dead_waveforms)?;
        }

        Commands::Compact => {
            run_maintenance(&db_path, settings, "Compacting", CacheEngine::compact_storage)?;
        }

        Commands::Rescan => {
            run_maintenance(&db_path, settings, "Rescanning", CacheEngine::rescan_waveforms)?;
        }

        Commands::Resume => {
            run_maintenance(&db_path, settings, "Resuming", |_| {})?;
        }

        Commands::Jobs => {
            let db = open_store(&db_path, config.compression)?;
            let jobs = db.get_jobs().context("Failed to read jobs")?;
            if jobs.is_empty() {
                println!("No pending jobs");
            }
            for job in &jobs {
                let marker = if job.user_submitted { "user" } else { "auto" };
                println!("{:<5} {}", marker, job.location);
            }
        }

        Commands::Stats => {
            let db = open_store(&db_path, config.compression)?;
            let stats = db.stats().context("Failed to get stats")?;
            println!("Waveform Cache Statistics");
            println!("=========================");
            println!("Files:        {}", stats.files);
            println!("Waveforms:    {}", stats.waveforms);
            println!("Pending jobs: {}", stats.jobs);
            println!(
                "Blob size:    {:.1} MiB",
                stats.blob_bytes as f64 / (1024.0 * 1024.0)
            );
            println!();

            if !stats.by_compression.is_empty() {
                println!("Compression:");
                for (id, count) in &stats.by_compression {
                    let name = CompressionScheme::from_id(*id)
                        .map(|s| s.name())
                        .unwrap_or("unknown");
                    println!("  {:<8} {}", name, count);
                }
            }
        }
    }

    Ok(())
}

fn open_store(db_path: &Path, compression: CompressionScheme) -> Result<Database> {
    Ok(Database::open(db_path)
        .context("Failed to open database")?
        .with_compression(compression))
}

fn open_engine(db_path: &Path, settings: EngineSettings) -> Result<CacheEngine> {
    CacheEngine::open(db_path, settings).context("Failed to open database")
}

/// Bare paths are canonicalized so they match what `analyze` stored.
fn resolve_location(path: &str, subsong: u32) -> Location {
    let location = Location::new(path, subsong);
    match location.scheme() {
        None => match std::fs::canonicalize(path) {
            Ok(p) => Location::new(p.to_string_lossy().to_string(), subsong),
            Err(_) => location,
        },
        Some(_) => location,
    }
}

fn progress_style(template: &str) -> Result<ProgressStyle> {
    Ok(ProgressStyle::with_template(template)
        .context("Invalid progress template")?
        .progress_chars("#>-"))
}

/// Show a progress bar until every query has completed.
fn track_queries(engine: &CacheEngine, queries: &[QueryHandle]) -> Result<()> {
    let updates = engine.updates();
    let pb = ProgressBar::new(queries.len() as u64);
    pb.set_style(progress_style(
        "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )?);

    loop {
        let done = queries.iter().filter(|q| q.is_done()).count();
        pb.set_position(done as u64);
        if done == queries.len() {
            break;
        }
        if let Some(latest) = updates.as_ref().and_then(|rx| rx.drain_latest().pop()) {
            let name = Path::new(&latest.location.path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| latest.location.path.clone());
            pb.set_message(name);
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    pb.finish_with_message("done");
    Ok(())
}

/// Start an engine (replaying persisted jobs), trigger `action`, and wait
/// until the workers are idle.
fn run_maintenance(
    db_path: &Path,
    settings: EngineSettings,
    label: &str,
    action: impl FnOnce(&CacheEngine),
) -> Result<()> {
    let mut engine = open_engine(db_path, settings)?;
    let replayed = engine.start().context("Failed to start cache engine")?;
    if replayed > 0 {
        println!("Replaying {} pending jobs", replayed);
    }
    action(&engine);

    let pb = ProgressBar::new_spinner();
    pb.set_style(progress_style("{spinner:.green} {msg}")?);
    while !engine.wait_idle(Duration::from_millis(100)) {
        pb.set_message(format!("{}: {} tasks outstanding", label, engine.outstanding()));
        pb.tick();
    }
    pb.finish_and_clear();

    engine.shutdown().context("Failed to shut down cache engine")?;
    println!("{} complete", label);
    Ok(())
}
