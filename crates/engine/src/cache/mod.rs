//! Fingerprint & disk cache
//!
//! Turns "give me artifact K for file F" into at most one generation per
//! (fingerprint, kind). Artifacts live under a cache root and survive process
//! restarts until the source changes. Generation runs on the shared
//! [`TaskQueue`]; prerequisites (probe metadata for a thumbnail's duration or
//! an audio set's stream count) are resolved before the queue hop so a
//! generation never waits on the queue it is holding a slot of.

pub mod fingerprint;
pub mod layout;

pub use fingerprint::{fingerprint, Fingerprint};
pub use layout::{ArtifactKind, CacheLayout};

use crate::config::CacheConfig;
use crate::media::{EngineError, MediaEngine};
use crate::probe::{parse_probe_json, MediaInfo};
use crate::queue::{QueueError, TaskQueue};
use layout::{AudioManifest, PARTIAL_SUFFIX};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error type for cache resolution
///
/// Cloneable so every single-flight waiter receives the same failure.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The source could not be read
    #[error("Cannot read source {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    /// Reading or writing inside the cache root failed
    #[error("Cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    /// The media engine failed while generating
    #[error("Media engine error: {0}")]
    Engine(#[source] Arc<EngineError>),

    /// Probe output could not be interpreted
    #[error("Unusable probe metadata for {path}: {message}")]
    Metadata { path: PathBuf, message: String },

    /// A generated file is missing or empty
    #[error("Incomplete artifact at {path}")]
    Incomplete { path: PathBuf },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl CacheError {
    fn source(path: &Path, error: io::Error) -> Self {
        CacheError::Source {
            path: path.to_path_buf(),
            source: Arc::new(error),
        }
    }

    fn io(path: &Path, error: io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source: Arc::new(error),
        }
    }

    fn engine(error: EngineError) -> Self {
        CacheError::Engine(Arc::new(error))
    }
}

/// Caller hint recorded on in-flight generations
///
/// Never changes queue order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Delete any existing artifact for the key and regenerate
    pub force_refresh: bool,
    pub priority: Priority,
}

impl ResolveOptions {
    pub fn refresh() -> Self {
        Self {
            force_refresh: true,
            ..Self::default()
        }
    }

    pub fn high_priority() -> Self {
        Self {
            priority: Priority::High,
            ..Self::default()
        }
    }
}

/// Where to sample a thumbnail frame
///
/// One thumbnail is cached per source; asking for a different position needs
/// a force refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThumbnailOptions {
    /// Explicit timestamp in seconds; wins over everything else
    pub timestamp: Option<f64>,
    /// Trim window `(start, end)`; its midpoint is used when no timestamp is given
    pub trim: Option<(f64, f64)>,
    /// Known duration, saves a metadata lookup
    pub duration_hint: Option<f64>,
}

/// What to resolve for a source
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactRequest {
    Metadata,
    Thumbnail(ThumbnailOptions),
    ExtractedAudio,
}

impl ArtifactRequest {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactRequest::Metadata => ArtifactKind::Metadata,
            ArtifactRequest::Thumbnail(_) => ArtifactKind::Thumbnail,
            ArtifactRequest::ExtractedAudio => ArtifactKind::ExtractedAudio,
        }
    }
}

/// A resolved artifact; audio sets carry one path per audio stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub paths: Vec<PathBuf>,
}

impl Artifact {
    fn single(kind: ArtifactKind, path: PathBuf) -> Self {
        Self {
            kind,
            paths: vec![path],
        }
    }

    pub fn primary(&self) -> Option<&Path> {
        self.paths.first().map(PathBuf::as_path)
    }
}

/// Counters for cache behaviour since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Requests answered from memory or disk
    pub hits: u64,
    /// Requests that attached to an in-flight generation
    pub joins: u64,
    /// Joins made by high-priority callers
    pub high_priority_joins: u64,
    /// Generations submitted to the queue
    pub generations: u64,
    pub failures: u64,
}

/// Result of a prune pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub removed: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

/// Generation parameters taken from `[cache]`
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    /// Fraction of the duration used as the default thumbnail position
    pub thumbnail_position: f64,
    pub audio_sample_rate: u32,
    pub audio_channels: u32,
    /// Per-track extraction deadline
    pub audio_timeout: Duration,
}

impl From<&CacheConfig> for CacheSettings {
    fn from(cfg: &CacheConfig) -> Self {
        Self {
            thumbnail_width: cfg.thumbnail_width,
            thumbnail_height: cfg.thumbnail_height,
            thumbnail_position: cfg.thumbnail_position,
            audio_sample_rate: cfg.audio_sample_rate,
            audio_channels: cfg.audio_channels,
            audio_timeout: Duration::from_secs(cfg.audio_extract_timeout_secs),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    fingerprint: Fingerprint,
    kind: ArtifactKind,
}

/// Published once by the generation task; `None` until then
type Outcome = Option<Result<Artifact, CacheError>>;

struct InFlight {
    id: u64,
    outcome: watch::Receiver<Outcome>,
    priority: Priority,
}

/// Work handed to the queue once prerequisites are known
#[derive(Debug, Clone, Copy)]
enum Job {
    Metadata,
    Thumbnail { at_secs: f64 },
    ExtractedAudio { streams: usize },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the cache handle and its generation tasks
#[derive(Default)]
struct Shared {
    resolved: Mutex<HashMap<CacheKey, Artifact>>,
    in_flight: Mutex<HashMap<CacheKey, InFlight>>,
    stats: Mutex<CacheStats>,
    next_generation: AtomicU64,
}

/// Single-flight, disk-persisted artifact cache
///
/// Clones share the same in-memory state.
#[derive(Clone)]
pub struct DiskCache {
    layout: CacheLayout,
    generator: Generator,
    queue: Arc<TaskQueue>,
    shared: Arc<Shared>,
}

impl DiskCache {
    pub fn new(
        layout: CacheLayout,
        settings: CacheSettings,
        engine: Arc<dyn MediaEngine>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            generator: Generator {
                engine,
                layout: layout.clone(),
                settings,
            },
            layout,
            queue,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn from_config(
        root: impl Into<PathBuf>,
        cfg: &CacheConfig,
        engine: Arc<dyn MediaEngine>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self::new(CacheLayout::new(root), CacheSettings::from(cfg), engine, queue)
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn stats(&self) -> CacheStats {
        *lock(&self.shared.stats)
    }

    /// Number of generations currently registered as in flight
    pub fn in_flight(&self) -> usize {
        lock(&self.shared.in_flight).len()
    }

    /// Resolve an artifact, generating it at most once per (fingerprint, kind)
    ///
    /// An existing non-empty artifact is returned without a queue hop. A
    /// request for a key that is already generating waits for that generation,
    /// including force-refresh requests, whose output would be identical.
    ///
    /// The generation runs on its own task, so dropping any caller (the first
    /// one included) neither stops it nor starts a second one.
    pub fn resolve<'a>(
        &'a self,
        source: &'a Path,
        request: &'a ArtifactRequest,
        options: ResolveOptions,
    ) -> BoxFuture<'a, Result<Artifact, CacheError>> {
        Box::pin(async move {
            let key = CacheKey {
                fingerprint: fingerprint(source).await,
                kind: request.kind(),
            };

            if !options.force_refresh {
                if let Some(artifact) = self.cached(&key, source).await {
                    return Ok(artifact);
                }
            }

            let mut outcome = self.register(source, request, &key, options);
            let published = outcome.wait_for(Option::is_some).await;
            match published.as_deref() {
                Ok(Some(result)) => result.clone(),
                _ => Err(CacheError::Queue(QueueError::Aborted)),
            }
        })
    }

    /// Parsed probe metadata for a source
    pub async fn media_info(
        &self,
        source: &Path,
        options: ResolveOptions,
    ) -> Result<MediaInfo, CacheError> {
        let artifact = self
            .resolve(source, &ArtifactRequest::Metadata, options)
            .await?;
        let path = artifact.primary().ok_or_else(|| CacheError::Incomplete {
            path: source.to_path_buf(),
        })?;

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| CacheError::io(path, e))?;
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| CacheError::Metadata {
                path: source.to_path_buf(),
                message: e.to_string(),
            })?;
        parse_probe_json(&value).map_err(|e| CacheError::Metadata {
            path: source.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Path of the cached thumbnail JPEG
    pub async fn thumbnail(
        &self,
        source: &Path,
        thumbnail: ThumbnailOptions,
        options: ResolveOptions,
    ) -> Result<PathBuf, CacheError> {
        let artifact = self
            .resolve(source, &ArtifactRequest::Thumbnail(thumbnail), options)
            .await?;
        artifact
            .primary()
            .map(Path::to_path_buf)
            .ok_or_else(|| CacheError::Incomplete {
                path: source.to_path_buf(),
            })
    }

    /// One WAV path per audio stream, in stream order
    pub async fn extracted_audio(
        &self,
        source: &Path,
        options: ResolveOptions,
    ) -> Result<Vec<PathBuf>, CacheError> {
        let artifact = self
            .resolve(source, &ArtifactRequest::ExtractedAudio, options)
            .await?;
        Ok(artifact.paths)
    }

    /// Delete artifacts, oldest modified first, until the cache fits `max_bytes`
    pub async fn prune(&self, max_bytes: u64) -> Result<PruneReport, CacheError> {
        let root = self.layout.root().to_path_buf();
        let units = tokio::task::spawn_blocking(move || collect_units(&root))
            .await
            .map_err(|e| CacheError::io(self.layout.root(), io::Error::other(e)))?;

        let total: u64 = units.iter().map(|u| u.bytes).sum();
        let mut report = PruneReport {
            remaining_bytes: total,
            ..PruneReport::default()
        };

        let mut removed_paths = Vec::new();
        for index in select_evictions(&units, max_bytes) {
            let unit = &units[index];
            let result = if unit.is_dir {
                tokio::fs::remove_dir_all(&unit.path).await
            } else {
                tokio::fs::remove_file(&unit.path).await
            };
            match result {
                Ok(()) => {
                    report.removed += 1;
                    report.freed_bytes += unit.bytes;
                    report.remaining_bytes -= unit.bytes;
                    removed_paths.push(unit.path.clone());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(&unit.path, e)),
            }
        }

        if !removed_paths.is_empty() {
            lock(&self.shared.resolved).retain(|_, artifact| {
                !artifact
                    .paths
                    .iter()
                    .any(|p| removed_paths.iter().any(|removed| p.starts_with(removed)))
            });
            info!(
                removed = report.removed,
                freed_bytes = report.freed_bytes,
                remaining_bytes = report.remaining_bytes,
                "Pruned cache"
            );
        }

        Ok(report)
    }

    /// Delete every artifact and forget resolved paths
    pub async fn clear(&self) -> Result<(), CacheError> {
        lock(&self.shared.resolved).clear();
        for kind in ArtifactKind::ALL {
            let dir = self.layout.kind_dir(kind);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(&dir, e)),
            }
        }
        info!(root = %self.layout.root().display(), "Cleared cache");
        Ok(())
    }

    /// Memory mirror first, then disk
    async fn cached(&self, key: &CacheKey, source: &Path) -> Option<Artifact> {
        let remembered = lock(&self.shared.resolved).get(key).cloned();
        if let Some(artifact) = remembered {
            if all_non_empty(&artifact.paths).await {
                self.record(|s| s.hits += 1);
                debug!(kind = ?key.kind, fingerprint = %key.fingerprint, "Cache hit (memory)");
                return Some(artifact);
            }
            lock(&self.shared.resolved).remove(key);
        }

        let artifact = self.lookup_disk(key, source).await?;
        self.record(|s| s.hits += 1);
        debug!(kind = ?key.kind, fingerprint = %key.fingerprint, "Cache hit (disk)");
        lock(&self.shared.resolved).insert(key.clone(), artifact.clone());
        Some(artifact)
    }

    async fn lookup_disk(&self, key: &CacheKey, source: &Path) -> Option<Artifact> {
        let entry = self.layout.entry_path(key.kind, &key.fingerprint, source);
        match key.kind {
            ArtifactKind::Metadata | ArtifactKind::Thumbnail => {
                if is_non_empty(&entry).await {
                    Some(Artifact::single(key.kind, entry))
                } else {
                    None
                }
            }
            ArtifactKind::ExtractedAudio => {
                let paths = read_audio_set(&entry).await?;
                Some(Artifact {
                    kind: key.kind,
                    paths,
                })
            }
        }
    }

    /// Join the in-flight generation for `key` or register and spawn a new one
    fn register(
        &self,
        source: &Path,
        request: &ArtifactRequest,
        key: &CacheKey,
        options: ResolveOptions,
    ) -> watch::Receiver<Outcome> {
        let priority = options.priority;
        let mut in_flight = lock(&self.shared.in_flight);
        if let Some(entry) = in_flight.get_mut(key) {
            if priority == Priority::High {
                entry.priority = Priority::High;
            }
            self.record(|s| {
                s.joins += 1;
                if priority == Priority::High {
                    s.high_priority_joins += 1;
                }
            });
            debug!(
                kind = ?key.kind,
                fingerprint = %key.fingerprint,
                in_flight_priority = ?entry.priority,
                "Joining in-flight generation"
            );
            return entry.outcome.clone();
        }

        let id = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let (publish, outcome) = watch::channel(None);
        in_flight.insert(
            key.clone(),
            InFlight {
                id,
                outcome: outcome.clone(),
                priority,
            },
        );
        drop(in_flight);

        self.spawn_generation(
            id,
            source.to_path_buf(),
            request.clone(),
            key.clone(),
            options.force_refresh,
            publish,
        );
        outcome
    }

    /// Run one generation detached from its requesters
    ///
    /// The task clears its own in-flight entry, then publishes the result.
    fn spawn_generation(
        &self,
        id: u64,
        source: PathBuf,
        request: ArtifactRequest,
        key: CacheKey,
        force_refresh: bool,
        publish: watch::Sender<Outcome>,
    ) {
        let cache = self.clone();
        tokio::spawn(async move {
            let generation = {
                let cache = cache.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    cache
                        .generate(&source, &request, &key, force_refresh)
                        .await
                })
            };
            let result = generation.await.unwrap_or_else(|e| {
                warn!(kind = ?key.kind, error = %e, "Generation task did not finish");
                cache.record(|s| s.failures += 1);
                Err(CacheError::Queue(QueueError::Aborted))
            });

            if let Ok(artifact) = &result {
                lock(&cache.shared.resolved).insert(key.clone(), artifact.clone());
            }
            cache.unregister(&key, id);
            publish.send_replace(Some(result));
        });
    }

    fn unregister(&self, key: &CacheKey, id: u64) {
        let mut in_flight = lock(&self.shared.in_flight);
        if in_flight.get(key).is_some_and(|entry| entry.id == id) {
            in_flight.remove(key);
        }
    }

    fn record(&self, update: impl FnOnce(&mut CacheStats)) {
        update(&mut lock(&self.shared.stats));
    }

    async fn generate(
        &self,
        source: &Path,
        request: &ArtifactRequest,
        key: &CacheKey,
        force_refresh: bool,
    ) -> Result<Artifact, CacheError> {
        if force_refresh {
            self.discard(key, source).await?;
        } else if let Some(artifact) = self.lookup_disk(key, source).await {
            // Another caller finished between our lookup and registration
            self.record(|s| s.hits += 1);
            return Ok(artifact);
        }

        let job = match request {
            ArtifactRequest::Metadata => Job::Metadata,
            ArtifactRequest::Thumbnail(options) => Job::Thumbnail {
                at_secs: self.thumbnail_time(source, options).await?,
            },
            ArtifactRequest::ExtractedAudio => Job::ExtractedAudio {
                streams: self
                    .media_info(source, ResolveOptions::default())
                    .await?
                    .audio_stream_count(),
            },
        };

        self.record(|s| s.generations += 1);
        info!(
            source = %source.display(),
            kind = ?key.kind,
            fingerprint = %key.fingerprint,
            "Generating artifact"
        );

        let generator = self.generator.clone();
        let owned_source = source.to_path_buf();
        let fingerprint = key.fingerprint.clone();
        let result = self
            .queue
            .submit(async move { generator.run(&owned_source, &fingerprint, job).await })
            .await
            .unwrap_or_else(|e| Err(CacheError::from(e)));

        if let Err(e) = &result {
            self.record(|s| s.failures += 1);
            warn!(source = %source.display(), kind = ?key.kind, error = %e, "Artifact generation failed");
        }
        result
    }

    /// Timestamp for a thumbnail: explicit, then trim midpoint, then a fraction of the duration
    async fn thumbnail_time(
        &self,
        source: &Path,
        options: &ThumbnailOptions,
    ) -> Result<f64, CacheError> {
        if let Some(timestamp) = options.timestamp {
            return Ok(timestamp.max(0.0));
        }
        if let Some((start, end)) = options.trim {
            if end > start {
                return Ok(start + (end - start) / 2.0);
            }
        }

        let duration = match options.duration_hint {
            Some(duration) if duration > 0.0 => duration,
            _ => {
                self.media_info(source, ResolveOptions::default())
                    .await?
                    .duration_secs
            }
        };
        Ok((duration * self.generator.settings.thumbnail_position).max(0.0))
    }

    async fn discard(&self, key: &CacheKey, source: &Path) -> Result<(), CacheError> {
        lock(&self.shared.resolved).remove(key);
        let entry = self.layout.entry_path(key.kind, &key.fingerprint, source);
        let result = match key.kind {
            ArtifactKind::ExtractedAudio => tokio::fs::remove_dir_all(&entry).await,
            _ => tokio::fs::remove_file(&entry).await,
        };
        match result {
            Ok(()) => {
                debug!(path = %entry.display(), "Discarded artifact for refresh");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::io(&entry, e)),
        }
    }
}

/// The part of the cache that runs on the queue
#[derive(Clone)]
struct Generator {
    engine: Arc<dyn MediaEngine>,
    layout: CacheLayout,
    settings: CacheSettings,
}

impl Generator {
    async fn run(
        &self,
        source: &Path,
        fingerprint: &Fingerprint,
        job: Job,
    ) -> Result<Artifact, CacheError> {
        tokio::fs::metadata(source)
            .await
            .map_err(|e| CacheError::source(source, e))?;

        match job {
            Job::Metadata => self.probe(source, fingerprint).await,
            Job::Thumbnail { at_secs } => self.thumbnail(source, fingerprint, at_secs).await,
            Job::ExtractedAudio { streams } => self.audio_set(source, fingerprint, streams).await,
        }
    }

    async fn probe(&self, source: &Path, fingerprint: &Fingerprint) -> Result<Artifact, CacheError> {
        let raw = self.engine.probe(source).await.map_err(CacheError::engine)?;
        parse_probe_json(&raw).map_err(|e| CacheError::Metadata {
            path: source.to_path_buf(),
            message: e.to_string(),
        })?;

        let output = self
            .layout
            .entry_path(ArtifactKind::Metadata, fingerprint, source);
        let bytes = serde_json::to_vec_pretty(&raw).map_err(|e| CacheError::io(&output, e.into()))?;
        write_atomically(&output, &bytes).await?;
        Ok(Artifact::single(ArtifactKind::Metadata, output))
    }

    async fn thumbnail(
        &self,
        source: &Path,
        fingerprint: &Fingerprint,
        at_secs: f64,
    ) -> Result<Artifact, CacheError> {
        let output = self
            .layout
            .entry_path(ArtifactKind::Thumbnail, fingerprint, source);
        ensure_parent(&output).await?;

        let partial = CacheLayout::partial_path(&output);
        let extracted = self
            .engine
            .extract_frame(
                source,
                at_secs,
                self.settings.thumbnail_width,
                self.settings.thumbnail_height,
                &partial,
            )
            .await;

        if let Err(e) = extracted {
            remove_file_quietly(&partial).await;
            return Err(CacheError::engine(e));
        }
        if !is_non_empty(&partial).await {
            remove_file_quietly(&partial).await;
            return Err(CacheError::Incomplete { path: output });
        }

        tokio::fs::rename(&partial, &output)
            .await
            .map_err(|e| CacheError::io(&output, e))?;
        Ok(Artifact::single(ArtifactKind::Thumbnail, output))
    }

    /// Extract every audio stream; any failure discards the whole set
    async fn audio_set(
        &self,
        source: &Path,
        fingerprint: &Fingerprint,
        streams: usize,
    ) -> Result<Artifact, CacheError> {
        let dir = self
            .layout
            .entry_path(ArtifactKind::ExtractedAudio, fingerprint, source);
        remove_dir_quietly(&dir).await;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::io(&dir, e))?;

        match self.extract_tracks(source, &dir, streams).await {
            Ok(paths) => Ok(Artifact {
                kind: ArtifactKind::ExtractedAudio,
                paths,
            }),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Discarding incomplete audio set");
                remove_dir_quietly(&dir).await;
                Err(e)
            }
        }
    }

    async fn extract_tracks(
        &self,
        source: &Path,
        dir: &Path,
        streams: usize,
    ) -> Result<Vec<PathBuf>, CacheError> {
        let tracks: Vec<PathBuf> = (0..streams)
            .map(|i| dir.join(CacheLayout::track_file_name(i)))
            .collect();

        let mut extractions = JoinSet::new();
        for (index, output) in tracks.iter().cloned().enumerate() {
            let engine = self.engine.clone();
            let source = source.to_path_buf();
            let settings = self.settings.clone();
            extractions.spawn(async move {
                engine
                    .extract_audio(
                        &source,
                        index,
                        settings.audio_sample_rate,
                        settings.audio_channels,
                        &output,
                        settings.audio_timeout,
                    )
                    .await
            });
        }

        while let Some(joined) = extractions.join_next().await {
            let outcome = match joined {
                Ok(result) => result.map_err(CacheError::engine),
                Err(_) => Err(CacheError::Queue(QueueError::Aborted)),
            };
            if let Err(e) = outcome {
                extractions.abort_all();
                // Wait for the killed extractions so nothing writes after cleanup
                while extractions.join_next().await.is_some() {}
                return Err(e);
            }
        }

        for track in &tracks {
            if !is_non_empty(track).await {
                return Err(CacheError::Incomplete {
                    path: track.clone(),
                });
            }
        }

        let manifest = AudioManifest {
            tracks: (0..streams).map(CacheLayout::track_file_name).collect(),
        };
        let manifest_path = CacheLayout::manifest_path(dir);
        let bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| CacheError::io(&manifest_path, e.into()))?;
        write_atomically(&manifest_path, &bytes).await?;

        Ok(tracks)
    }
}

async fn is_non_empty(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

async fn all_non_empty(paths: &[PathBuf]) -> bool {
    for path in paths {
        if !is_non_empty(path).await {
            return false;
        }
    }
    true
}

/// Track paths of a complete audio set, or `None` when the set is unusable
async fn read_audio_set(dir: &Path) -> Option<Vec<PathBuf>> {
    let bytes = tokio::fs::read(CacheLayout::manifest_path(dir)).await.ok()?;
    let manifest: AudioManifest = serde_json::from_slice(&bytes).ok()?;
    let paths: Vec<PathBuf> = manifest.tracks.iter().map(|t| dir.join(t)).collect();
    if all_non_empty(&paths).await {
        Some(paths)
    } else {
        None
    }
}

async fn ensure_parent(path: &Path) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CacheError::io(parent, e))?;
    }
    Ok(())
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    ensure_parent(path).await?;
    let partial = CacheLayout::partial_path(path);
    tokio::fs::write(&partial, bytes)
        .await
        .map_err(|e| CacheError::io(&partial, e))?;
    tokio::fs::rename(&partial, path)
        .await
        .map_err(|e| CacheError::io(path, e))
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial file");
        }
    }
}

async fn remove_dir_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove directory");
        }
    }
}

/// One evictable artifact: a metadata file, a thumbnail, or an audio set directory
#[derive(Debug, Clone)]
struct CacheUnit {
    path: PathBuf,
    bytes: u64,
    modified: SystemTime,
    is_dir: bool,
}

fn is_partial(path: &Path) -> bool {
    let Some(name) = path.file_name() else {
        return false;
    };
    let name = name.to_string_lossy();
    // Partial files look like `<stem>.part.<ext>` or `<name>.part`
    name.ends_with(PARTIAL_SUFFIX)
        || name
            .rsplit_once('.')
            .is_some_and(|(stem, _)| stem.ends_with(PARTIAL_SUFFIX))
}

/// Complete artifacts under the cache root; in-progress files are skipped
fn collect_units(root: &Path) -> Vec<CacheUnit> {
    let mut units = Vec::new();

    for kind in [ArtifactKind::Metadata, ArtifactKind::Thumbnail] {
        let dir = root.join(kind.dir_name());
        for entry in walkdir::WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() || is_partial(entry.path()) {
                continue;
            }
            if let Ok(metadata) = entry.metadata() {
                units.push(CacheUnit {
                    path: entry.path().to_path_buf(),
                    bytes: metadata.len(),
                    modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    is_dir: false,
                });
            }
        }
    }

    let audio_root = root.join(ArtifactKind::ExtractedAudio.dir_name());
    for entry in walkdir::WalkDir::new(&audio_root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let manifest = CacheLayout::manifest_path(entry.path());
        let Ok(modified) = std::fs::metadata(&manifest).and_then(|m| m.modified()) else {
            continue;
        };
        let bytes = walkdir::WalkDir::new(entry.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum();
        units.push(CacheUnit {
            path: entry.path().to_path_buf(),
            bytes,
            modified,
            is_dir: true,
        });
    }

    units
}

/// Indices to delete, oldest first, until the remaining total fits `max_bytes`
fn select_evictions(units: &[CacheUnit], max_bytes: u64) -> Vec<usize> {
    let mut total: u64 = units.iter().map(|u| u.bytes).sum();
    let mut order: Vec<usize> = (0..units.len()).collect();
    order.sort_by_key(|&i| units[i].modified);

    let mut evicted = Vec::new();
    for index in order {
        if total <= max_bytes {
            break;
        }
        total -= units[index].bytes;
        evicted.push(index);
    }
    evicted
}
