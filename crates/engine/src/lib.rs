//! clipshelf
//!
//! Media engine behind a video clip browser: bounded task queue, fingerprinted
//! disk cache for derived artifacts, size-targeted export pipeline and folder
//! watching.

pub mod cache;
pub mod concurrency;
pub mod export;
pub mod media;
pub mod probe;
pub mod queue;
pub mod scan;
pub mod service;
pub mod startup;
pub mod watch;

pub use clipshelf_config as config;
pub use clipshelf_config::Config;
pub use cache::{
    Artifact, ArtifactRequest, CacheError, CacheStats, DiskCache, Priority, PruneReport,
    ResolveOptions, ThumbnailOptions,
};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use export::{
    AudioMode, ExportError, ExportOutcome, ExportPipeline, ExportProgress, ExportRequest,
    ExportState, OutputKind, QualityMode, TrackConfig, TrackMap,
};
pub use media::{CancelSignal, EngineError, Ffmpeg, MediaEngine};
pub use probe::{MediaInfo, ProbeError};
pub use queue::{QueueError, TaskHandle, TaskQueue};
pub use scan::{scan_videos, ScanError, VideoEntry};
pub use service::{ClipService, ServiceError};
pub use startup::{check_tool_available, parse_ffmpeg_version, run_startup_checks, StartupError};
pub use watch::{FolderWatcher, WatchError, WatchEvent};
