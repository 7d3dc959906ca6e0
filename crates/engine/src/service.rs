//! Service facade for clipshelf
//!
//! Owns every runtime component (task queue, artifact cache, export pipeline
//! and folder watcher) and exposes the request/response operations the
//! front-ends call.

use crate::cache::{CacheError, DiskCache, PruneReport, ResolveOptions, ThumbnailOptions};
use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::export::{
    ExportError, ExportOutcome, ExportPipeline, ExportProgress, ExportRequest, ExportState,
};
use crate::media::{Ffmpeg, MediaEngine};
use crate::probe::MediaInfo;
use crate::queue::TaskQueue;
use crate::scan::{scan_videos, ScanError, VideoEntry};
use crate::startup::{run_startup_checks, StartupError};
use crate::watch::{FolderWatcher, WatchError, WatchEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Cache root used when `[cache] root` is not configured
pub const DEFAULT_CACHE_DIR: &str = ".clipshelf-cache";

/// Error type for service operations
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Scan failed: {0}")]
    Scan(#[from] ScanError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Export failed: {0}")]
    Export(#[from] ExportError),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    /// A blocking worker panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),
}

/// Service state containing all runtime components
pub struct ClipService {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    queue: Arc<TaskQueue>,
    cache: DiskCache,
    exports: ExportPipeline,
    watcher: FolderWatcher,
}

impl ClipService {
    /// Initialize the service with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file
    /// 2. Apply environment overrides
    /// 3. Run startup checks (ffmpeg, ffprobe)
    /// 4. Derive concurrency plan and build components
    ///
    /// Must be called inside a tokio runtime.
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, ServiceError> {
        let config = Config::load(config_path)?;
        Self::with_config(config)
    }

    /// Initialize the service with an existing configuration, running startup checks
    pub fn with_config(config: Config) -> Result<Self, ServiceError> {
        run_startup_checks(&config)?;
        Ok(Self::new_without_checks(config))
    }

    /// Initialize the service without running startup checks
    ///
    /// Useful for testing when ffmpeg is not available.
    pub fn new_without_checks(config: Config) -> Self {
        let engine = Arc::new(Ffmpeg::new(&config.tools.ffmpeg, &config.tools.ffprobe));
        Self::with_engine(config, engine)
    }

    /// Build the service around an arbitrary media engine
    pub fn with_engine(config: Config, engine: Arc<dyn MediaEngine>) -> Self {
        let concurrency_plan = derive_plan(&config);
        let queue = Arc::new(TaskQueue::from_plan(&concurrency_plan));
        let cache_root = config
            .cache
            .root
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
        let cache = DiskCache::from_config(cache_root, &config.cache, engine.clone(), queue.clone());
        let exports = ExportPipeline::new(engine, config.export.clone());
        let watcher = FolderWatcher::from_config(&config.watch);

        info!(
            max_concurrent_tasks = concurrency_plan.max_concurrent_tasks,
            cache_root = %cache.layout().root().display(),
            "Service initialized"
        );

        Self {
            config,
            concurrency_plan,
            queue,
            cache,
            exports,
            watcher,
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    /// List video files under `folder`
    pub async fn scan_videos(&self, folder: &Path) -> Result<Vec<VideoEntry>, ServiceError> {
        let folder = folder.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || scan_videos(&folder))
            .await
            .map_err(|e| ServiceError::Task(e.to_string()))??;
        Ok(entries)
    }

    /// Probe metadata for `source`, cached
    pub async fn probe_metadata(
        &self,
        source: &Path,
        options: ResolveOptions,
    ) -> Result<MediaInfo, ServiceError> {
        let info = self.cache.media_info(source, options).await?;
        self.enforce_cache_cap().await;
        Ok(info)
    }

    /// Cached thumbnail JPEG for `source`
    pub async fn thumbnail(
        &self,
        source: &Path,
        thumbnail: ThumbnailOptions,
        options: ResolveOptions,
    ) -> Result<PathBuf, ServiceError> {
        let path = self.cache.thumbnail(source, thumbnail, options).await?;
        self.enforce_cache_cap().await;
        Ok(path)
    }

    /// Cached per-stream WAV files for `source`
    pub async fn extracted_audio(
        &self,
        source: &Path,
        options: ResolveOptions,
    ) -> Result<Vec<PathBuf>, ServiceError> {
        let tracks = self.cache.extracted_audio(source, options).await?;
        self.enforce_cache_cap().await;
        Ok(tracks)
    }

    /// Run an export; the source's audio stream count comes from cached metadata
    ///
    /// The job can be canceled through its session while metadata resolves.
    pub async fn export(&self, request: ExportRequest) -> Result<ExportOutcome, ServiceError> {
        let source = request.source.clone();
        let audio_streams = async {
            let info = self
                .probe_metadata(&source, ResolveOptions::high_priority())
                .await?;
            Ok::<_, ServiceError>(info.audio_stream_count())
        };
        self.exports
            .export_with_streams(request, audio_streams)
            .await
    }

    /// Cancel the running export of `session`; false when none is running
    pub fn cancel_export(&self, session: &str) -> bool {
        self.exports.cancel(session)
    }

    pub fn export_state(&self, job_token: &str) -> Option<ExportState> {
        self.exports.state(job_token)
    }

    pub fn subscribe_progress(&self, session: &str) -> broadcast::Receiver<ExportProgress> {
        self.exports.subscribe(session)
    }

    /// Start watching `root`; false when it is already watched
    pub async fn watch_folder(&self, root: &Path) -> Result<bool, ServiceError> {
        Ok(self.watcher.watch(root).await?)
    }

    pub async fn unwatch_folder(&self, root: &Path) -> bool {
        self.watcher.unwatch(root).await
    }

    pub fn subscribe_watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.watcher.subscribe()
    }

    /// Evict artifacts until the cache fits `max_bytes`
    pub async fn prune_cache(&self, max_bytes: u64) -> Result<PruneReport, ServiceError> {
        Ok(self.cache.prune(max_bytes).await?)
    }

    async fn enforce_cache_cap(&self) {
        let Some(max_bytes) = self.config.cache.max_bytes else {
            return;
        };
        if let Err(e) = self.cache.prune(max_bytes).await {
            warn!(error = %e, "Cache pruning failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{AudioMode, OutputKind, QualityMode, TrackMap};
    use crate::media::{CancelSignal, EngineError, ProgressFn};
    use async_trait::async_trait;
    use serde_json::json;
    use std::ffi::OsString;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Engine double reporting a fixed number of audio streams
    struct StubEngine {
        audio_streams: usize,
        metadata_delay: Duration,
        transcodes: AtomicUsize,
        last_args: std::sync::Mutex<Vec<String>>,
    }

    impl StubEngine {
        fn new(audio_streams: usize) -> Self {
            Self {
                audio_streams,
                metadata_delay: Duration::ZERO,
                transcodes: AtomicUsize::new(0),
                last_args: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MediaEngine for StubEngine {
        async fn probe(&self, _path: &Path) -> Result<serde_json::Value, EngineError> {
            tokio::time::sleep(self.metadata_delay).await;
            let mut streams = vec![json!({"index": 0, "codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080})];
            streams.extend(
                (0..self.audio_streams)
                    .map(|i| json!({"index": i + 1, "codec_type": "audio", "codec_name": "aac", "channels": 2})),
            );
            Ok(json!({"streams": streams, "format": {"duration": "12.0", "size": "4096"}}))
        }

        async fn extract_frame(
            &self,
            _path: &Path,
            _at_secs: f64,
            _width: u32,
            _height: u32,
            output: &Path,
        ) -> Result<(), EngineError> {
            tokio::fs::write(output, vec![0u8; 2048]).await?;
            Ok(())
        }

        async fn extract_audio(
            &self,
            _path: &Path,
            _audio_index: usize,
            _sample_rate: u32,
            _channels: u32,
            output: &Path,
            _timeout: Duration,
        ) -> Result<(), EngineError> {
            tokio::fs::write(output, b"RIFF").await?;
            Ok(())
        }

        async fn transcode(
            &self,
            args: &[OsString],
            _duration_secs: f64,
            progress: ProgressFn<'_>,
            _cancel: &CancelSignal,
        ) -> Result<(), EngineError> {
            self.transcodes.fetch_add(1, Ordering::SeqCst);
            *self.last_args.lock().unwrap() =
                args.iter().map(|a| a.to_string_lossy().to_string()).collect();
            progress(100.0);
            if let Some(output) = args.last() {
                tokio::fs::write(output, b"clip").await?;
            }
            Ok(())
        }
    }

    fn service(cache_root: &Path, engine: Arc<StubEngine>) -> ClipService {
        let mut config = Config::default();
        config.cache.root = Some(cache_root.to_path_buf());
        ClipService::with_engine(config, engine)
    }

    fn request(source: &Path, output: &Path) -> ExportRequest {
        ExportRequest {
            session: "session-1".to_string(),
            job_token: "job-1".to_string(),
            source: source.to_path_buf(),
            output: output.to_path_buf(),
            trim_start: 0.0,
            trim_end: 4.0,
            quality: QualityMode::Passthrough,
            target_size_mb: None,
            audio_tracks: TrackMap::new(),
            audio_mode: AudioMode::Combine,
            output_kind: OutputKind::Video,
            audio_streams: 0,
        }
    }

    #[tokio::test]
    async fn test_export_uses_probed_stream_count() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("in.mp4");
        fs::write(&source, b"source").unwrap();
        let engine = Arc::new(StubEngine::new(2));
        let svc = service(&temp_dir.path().join("cache"), engine.clone());

        let output = temp_dir.path().join("out").join("clip.mp4");
        let outcome = svc.export(request(&source, &output)).await.unwrap();

        assert!(matches!(outcome, ExportOutcome::Completed { attempts: 1, .. }));
        assert!(output.exists());
        let args = engine.last_args.lock().unwrap().clone();
        assert!(args.iter().any(|a| a.contains("amix=inputs=2")));
    }

    #[tokio::test]
    async fn test_scan_and_probe_through_service() {
        let temp_dir = TempDir::new().unwrap();
        let media = temp_dir.path().join("media");
        fs::create_dir_all(&media).unwrap();
        fs::write(media.join("a.mp4"), b"a").unwrap();
        fs::write(media.join("b.txt"), b"b").unwrap();
        let svc = service(&temp_dir.path().join("cache"), Arc::new(StubEngine::new(1)));

        let entries = svc.scan_videos(&media).await.unwrap();
        assert_eq!(entries.len(), 1);

        let info = svc
            .probe_metadata(&entries[0].path, ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(info.audio_stream_count(), 1);
        assert!(info.has_video());

        assert!(matches!(
            svc.scan_videos(&media.join("missing")).await,
            Err(ServiceError::Scan(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_cap_prunes_after_generation() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.cache.root = Some(temp_dir.path().join("cache"));
        config.cache.max_bytes = Some(3000);
        let svc = ClipService::with_engine(config, Arc::new(StubEngine::new(0)));

        let first = temp_dir.path().join("first.mp4");
        let second = temp_dir.path().join("second.mp4");
        fs::write(&first, b"1").unwrap();
        fs::write(&second, b"2").unwrap();

        let opts = ThumbnailOptions {
            timestamp: Some(1.0),
            ..ThumbnailOptions::default()
        };
        let first_thumb = svc
            .thumbnail(&first, opts, ResolveOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second_thumb = svc
            .thumbnail(&second, opts, ResolveOptions::default())
            .await
            .unwrap();

        assert!(!first_thumb.exists());
        assert!(second_thumb.exists());
    }

    #[tokio::test]
    async fn test_cancel_without_running_export() {
        let temp_dir = TempDir::new().unwrap();
        let svc = service(temp_dir.path(), Arc::new(StubEngine::new(1)));
        assert!(!svc.cancel_export("nobody"));
        assert_eq!(svc.prune_cache(u64::MAX).await.unwrap().removed, 0);
    }

    #[tokio::test]
    async fn test_cancel_while_metadata_resolves() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("in.mp4");
        fs::write(&source, b"source").unwrap();
        let engine = Arc::new(StubEngine {
            metadata_delay: Duration::from_millis(200),
            ..StubEngine::new(1)
        });
        let svc = Arc::new(service(&temp_dir.path().join("cache"), engine.clone()));
        let output = temp_dir.path().join("clip.mp4");

        let export = {
            let svc = svc.clone();
            let request = request(&source, &output);
            tokio::spawn(async move { svc.export(request).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(svc.cancel_export("session-1"));
        let outcome = export.await.unwrap().unwrap();
        assert_eq!(outcome, ExportOutcome::Canceled);
        assert_eq!(engine.transcodes.load(Ordering::SeqCst), 0);
        assert!(!output.exists());
        assert_eq!(svc.export_state("job-1"), Some(ExportState::Canceled));
    }
}
