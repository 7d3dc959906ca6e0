//! CLI entry point for clipshelf
//!
//! Parses command line arguments, builds the service and runs one operation,
//! printing results as JSON on stdout. Logs go to stderr.

use clap::{Parser, Subcommand};
use clipshelf::{
    AudioMode, ClipService, Config, ExportOutcome, ExportRequest, OutputKind, QualityMode,
    ResolveOptions, ServiceError, ThumbnailOptions, TrackConfig, TrackMap,
};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// clipshelf - cache-backed clip browser engine
#[derive(Parser, Debug)]
#[command(name = "clipshelf")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml); defaults apply when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cache directory, overrides `[cache] root`
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Skip startup checks (ffmpeg, ffprobe). For testing only.
    #[arg(long, global = true, default_value = "false")]
    skip_checks: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List video files under a folder
    Scan { folder: PathBuf },

    /// Print probe metadata for a clip
    Probe {
        source: PathBuf,
        #[arg(long)]
        refresh: bool,
    },

    /// Print the path of a clip's cached thumbnail
    Thumbnail {
        source: PathBuf,
        /// Timestamp in seconds
        #[arg(long)]
        at: Option<f64>,
        #[arg(long)]
        refresh: bool,
    },

    /// Print the paths of a clip's extracted audio tracks
    Audio {
        source: PathBuf,
        #[arg(long)]
        refresh: bool,
    },

    /// Export a trimmed clip
    Export {
        source: PathBuf,
        output: PathBuf,
        #[arg(long, default_value = "0")]
        start: f64,
        #[arg(long)]
        end: f64,
        /// Re-encode to fit this many megabytes
        #[arg(long)]
        target_mb: Option<f64>,
        #[arg(long)]
        audio_only: bool,
        /// Keep audio tracks as separate streams instead of mixing
        #[arg(long)]
        separate: bool,
        /// Track volume as IDX=VOL, repeatable
        #[arg(long = "track", value_parser = parse_track_volume)]
        tracks: Vec<(usize, f64)>,
        /// Mute a track by index, repeatable
        #[arg(long = "mute")]
        muted: Vec<usize>,
    },

    /// Print folder changes until interrupted
    Watch {
        #[arg(required = true)]
        folders: Vec<PathBuf>,
    },

    /// Evict cached artifacts until the cache fits a size
    Prune {
        #[arg(long)]
        max_bytes: u64,
    },
}

fn parse_track_volume(s: &str) -> Result<(usize, f64), String> {
    let (index, volume) = s
        .split_once('=')
        .ok_or_else(|| format!("expected IDX=VOL, got '{}'", s))?;
    let index = index
        .trim()
        .parse()
        .map_err(|e| format!("invalid track index '{}': {}", index, e))?;
    let volume: f64 = volume
        .trim()
        .parse()
        .map_err(|e| format!("invalid volume '{}': {}", volume, e))?;
    if !volume.is_finite() || volume < 0.0 {
        return Err(format!("volume must be a non-negative number, got {}", volume));
    }
    Ok((index, volume))
}

fn track_map(tracks: &[(usize, f64)], muted: &[usize]) -> TrackMap {
    let mut map = TrackMap::new();
    for &(index, volume) in tracks {
        map.entry(index).or_insert_with(TrackConfig::default).volume = volume;
    }
    for &index in muted {
        map.entry(index).or_insert_with(TrackConfig::default).muted = true;
    }
    map
}

fn resolve_options(refresh: bool) -> ResolveOptions {
    if refresh {
        ResolveOptions::refresh()
    } else {
        ResolveOptions::default()
    }
}

fn load_config(args: &Args) -> Result<Config, ServiceError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };
    if let Some(dir) = &args.cache_dir {
        config.cache.root = Some(dir.clone());
    }
    Ok(config)
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => error!(error = %e, "Cannot serialize output"),
    }
}

async fn run(args: Args) -> Result<(), ServiceError> {
    let config = load_config(&args)?;
    let service = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        ClipService::new_without_checks(config)
    } else {
        ClipService::with_config(config)?
    };
    let service = Arc::new(service);

    match args.command {
        Command::Scan { folder } => {
            print_json(&service.scan_videos(&folder).await?);
        }
        Command::Probe { source, refresh } => {
            let info = service
                .probe_metadata(&source, resolve_options(refresh))
                .await?;
            print_json(&info);
        }
        Command::Thumbnail {
            source,
            at,
            refresh,
        } => {
            let thumbnail = ThumbnailOptions {
                timestamp: at,
                ..ThumbnailOptions::default()
            };
            let path = service
                .thumbnail(&source, thumbnail, resolve_options(refresh))
                .await?;
            print_json(&json!({ "thumbnail": path }));
        }
        Command::Audio { source, refresh } => {
            let tracks = service
                .extracted_audio(&source, resolve_options(refresh))
                .await?;
            print_json(&json!({ "tracks": tracks }));
        }
        Command::Export {
            source,
            output,
            start,
            end,
            target_mb,
            audio_only,
            separate,
            tracks,
            muted,
        } => {
            let session = uuid::Uuid::new_v4().to_string();
            let request = ExportRequest {
                session: session.clone(),
                job_token: uuid::Uuid::new_v4().to_string(),
                source,
                output,
                trim_start: start,
                trim_end: end,
                quality: if target_mb.is_some() {
                    QualityMode::SizeTargeted
                } else {
                    QualityMode::Passthrough
                },
                target_size_mb: target_mb,
                audio_tracks: track_map(&tracks, &muted),
                audio_mode: if separate {
                    AudioMode::Separate
                } else {
                    AudioMode::Combine
                },
                output_kind: if audio_only {
                    OutputKind::AudioOnly
                } else {
                    OutputKind::Video
                },
                audio_streams: 0,
            };
            export(service, session, request).await?;
        }
        Command::Watch { folders } => {
            let mut events = service.subscribe_watch();
            for folder in &folders {
                service.watch_folder(folder).await?;
            }
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    received = events.recv() => match received {
                        Ok(event) => print_json(&event),
                        Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped watch events"),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            for folder in &folders {
                service.unwatch_folder(folder).await;
            }
        }
        Command::Prune { max_bytes } => {
            let report = service.prune_cache(max_bytes).await?;
            print_json(&json!({
                "removed": report.removed,
                "freedBytes": report.freed_bytes,
                "remainingBytes": report.remaining_bytes,
            }));
        }
    }

    Ok(())
}

/// Run an export, printing progress to stderr; Ctrl-C cancels it
async fn export(
    service: Arc<ClipService>,
    session: String,
    request: ExportRequest,
) -> Result<(), ServiceError> {
    let mut progress = service.subscribe_progress(&session);
    let job_token = request.job_token.clone();

    let reporter = tokio::spawn(async move {
        loop {
            match progress.recv().await {
                Ok(update) if update.job_token == job_token => {
                    eprint!("\rattempt {} {:5.1}%", update.attempt, update.percent);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let canceler = {
        let service = service.clone();
        let session = session.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, canceling export");
                service.cancel_export(&session);
            }
        })
    };

    let result = service.export(request).await;
    canceler.abort();
    reporter.abort();
    eprintln!();

    match result? {
        ExportOutcome::Completed {
            output,
            size_bytes,
            attempts,
            final_video_kbps,
            within_budget,
        } => print_json(&json!({
            "status": "completed",
            "output": output,
            "sizeBytes": size_bytes,
            "attempts": attempts,
            "finalVideoKbps": final_video_kbps,
            "withinBudget": within_budget,
        })),
        ExportOutcome::Canceled => print_json(&json!({ "status": "canceled" })),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
