//! Export pipeline
//!
//! Drives the media engine through one export job: plan construction, the
//! size-budget convergence loop, progress fan-out and per-session
//! cancellation. Exports do not go through the task queue; each job owns its
//! transcoding process directly.

pub mod plan;

pub use plan::{
    build_export_args, initial_video_kbps, plan_audio, shrink_video_kbps, target_bytes, AudioMode,
    AudioPlan, BitrateBudget, OutputKind, PassSpec, QualityMode, TrackConfig, TrackMap,
};

use crate::config::{ExportConfig, PartialOutputPolicy};
use crate::media::{CancelSignal, EngineError, MediaEngine};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Progress events buffered per session before slow subscribers lag
const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// Termination messages that mean the process was stopped on purpose
const CANCEL_PATTERNS: &[&str] = &[
    "sigkill",
    "sigterm",
    "signal 9",
    "signal 15",
    "killed",
];

/// Error type for export jobs
#[derive(Debug, Error)]
pub enum ExportError {
    /// Job tokens are single-use
    #[error("Job token {0} was already used")]
    TokenReused(String),

    #[error("Invalid trim window: start {start}s, end {end}s")]
    InvalidTrim { start: f64, end: f64 },

    #[error("Size-targeted export needs a positive target size")]
    MissingTargetSize,

    /// Audio-only export with nothing audible to encode
    #[error("No audible audio tracks in {0}")]
    NoAudio(PathBuf),

    #[error("Transcode failed: {0}")]
    Engine(#[from] EngineError),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Lifecycle of a job token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportState {
    Pending,
    Running,
    Succeeded,
    Canceled,
    Failed,
}

impl ExportState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExportState::Succeeded | ExportState::Canceled | ExportState::Failed
        )
    }
}

/// One export job
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    /// Caller session; cancellation and progress are scoped to it
    pub session: String,
    /// Caller-supplied correlation id, never reused
    pub job_token: String,
    pub source: PathBuf,
    pub output: PathBuf,
    pub trim_start: f64,
    pub trim_end: f64,
    pub quality: QualityMode,
    pub target_size_mb: Option<f64>,
    pub audio_tracks: TrackMap,
    pub audio_mode: AudioMode,
    pub output_kind: OutputKind,
    /// Audio streams present in the source
    pub audio_streams: usize,
}

impl ExportRequest {
    pub fn duration_secs(&self) -> f64 {
        self.trim_end - self.trim_start
    }
}

/// How an export settled; cancellation is an outcome, not an error
#[derive(Debug, Clone, PartialEq)]
pub enum ExportOutcome {
    Completed {
        output: PathBuf,
        size_bytes: u64,
        /// Transcoding passes run, at most `1 + max_extra_attempts`
        attempts: u32,
        /// Video bitrate of the final pass, `None` when video was copied or dropped
        final_video_kbps: Option<u32>,
        /// False when the size target was still exceeded after the last pass
        within_budget: bool,
    },
    Canceled,
}

/// Progress of one pass, tagged so subscribers can drop stale jobs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportProgress {
    pub job_token: String,
    pub attempt: u32,
    /// Percentage of the current pass in `[0, 100]`
    pub percent: f64,
}

struct ActiveJob {
    job_token: String,
    cancel: Arc<CancelSignal>,
}

struct Session {
    progress: broadcast::Sender<ExportProgress>,
    active: Option<ActiveJob>,
}

impl Session {
    fn new() -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            progress,
            active: None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// True when an engine failure looks like a deliberate stop
///
/// The cancel flag is authoritative; the message match covers processes
/// stopped by a signal from outside this pipeline.
pub fn is_cancellation(error: &EngineError, cancel_requested: bool) -> bool {
    if cancel_requested || matches!(error, EngineError::Killed { .. }) {
        return true;
    }
    match error {
        EngineError::Terminated { stderr, .. } | EngineError::Failed { stderr, .. } => {
            is_termination_message(stderr)
        }
        _ => false,
    }
}

/// Match a process-termination message against known signal wording
pub fn is_termination_message(message: &str) -> bool {
    let message = message.to_lowercase();
    CANCEL_PATTERNS.iter().any(|pattern| message.contains(pattern))
}

/// Size-targeted, cancelable, progress-reporting exporter
///
/// Sessions are dropped once they have no running job and no progress
/// subscriber. Job tokens are remembered for the pipeline's lifetime, one
/// small entry each, so a token is never accepted twice.
pub struct ExportPipeline {
    engine: Arc<dyn MediaEngine>,
    settings: ExportConfig,
    sessions: Mutex<HashMap<String, Session>>,
    jobs: Mutex<HashMap<String, ExportState>>,
}

impl ExportPipeline {
    pub fn new(engine: Arc<dyn MediaEngine>, settings: ExportConfig) -> Self {
        Self {
            engine,
            settings,
            sessions: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Receive progress for every job of `session`
    pub fn subscribe(&self, session: &str) -> broadcast::Receiver<ExportProgress> {
        lock(&self.sessions)
            .entry(session.to_string())
            .or_insert_with(Session::new)
            .progress
            .subscribe()
    }

    /// Cancel the running job of `session`; false when nothing is running
    pub fn cancel(&self, session: &str) -> bool {
        let sessions = lock(&self.sessions);
        match sessions.get(session).and_then(|s| s.active.as_ref()) {
            Some(active) => {
                info!(session, job_token = %active.job_token, "Canceling export");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Current state of a job token
    pub fn state(&self, job_token: &str) -> Option<ExportState> {
        lock(&self.jobs).get(job_token).copied()
    }

    /// Run one export to completion, cancellation or failure
    ///
    /// # Returns
    /// * `Ok(ExportOutcome::Completed { .. })` - Output written, possibly over budget
    /// * `Ok(ExportOutcome::Canceled)` - The session's job was canceled
    /// * `Err(ExportError)` - Invalid request or engine failure
    pub async fn export(&self, request: ExportRequest) -> Result<ExportOutcome, ExportError> {
        let audio_streams = request.audio_streams;
        self.export_with_streams(request, async move { Ok::<_, ExportError>(audio_streams) })
            .await
    }

    /// Run one export whose audio stream count is still being resolved
    ///
    /// The job is registered with its session before `audio_streams` is
    /// polled, so a cancel sent while the count resolves is honoured. When the
    /// count fails the job is marked failed and that error is returned as is.
    pub async fn export_with_streams<F, E>(
        &self,
        mut request: ExportRequest,
        audio_streams: F,
    ) -> Result<ExportOutcome, E>
    where
        F: Future<Output = Result<usize, E>>,
        E: From<ExportError>,
    {
        validate(&request)?;
        self.claim_token(&request.job_token)?;

        let cancel = Arc::new(CancelSignal::new());
        let progress = self.activate(&request, cancel.clone());

        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            count = audio_streams => Some(count),
        };
        match resolved {
            None => {
                self.deactivate(&request);
                self.settle_canceled(&request).await;
                return Ok(ExportOutcome::Canceled);
            }
            Some(Err(e)) => {
                self.deactivate(&request);
                self.set_state(&request.job_token, ExportState::Failed);
                return Err(e);
            }
            Some(Ok(count)) => request.audio_streams = count,
        }
        self.set_state(&request.job_token, ExportState::Running);

        let result = self.run(&request, &cancel, &progress).await;
        self.deactivate(&request);
        Ok(self.settle(&request, &cancel, result).await?)
    }

    async fn settle(
        &self,
        request: &ExportRequest,
        cancel: &CancelSignal,
        result: Result<ExportOutcome, ExportError>,
    ) -> Result<ExportOutcome, ExportError> {
        match result {
            Ok(ExportOutcome::Canceled) => {
                self.settle_canceled(request).await;
                Ok(ExportOutcome::Canceled)
            }
            Ok(outcome) => {
                self.set_state(&request.job_token, ExportState::Succeeded);
                Ok(outcome)
            }
            Err(ExportError::Engine(e)) if is_cancellation(&e, cancel.is_canceled()) => {
                debug!(job_token = %request.job_token, error = %e, "Transcode stopped by cancellation");
                self.settle_canceled(request).await;
                Ok(ExportOutcome::Canceled)
            }
            Err(e) => {
                warn!(job_token = %request.job_token, error = %e, "Export failed");
                self.set_state(&request.job_token, ExportState::Failed);
                self.apply_partial_policy(&request.output).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        request: &ExportRequest,
        cancel: &CancelSignal,
        progress: &broadcast::Sender<ExportProgress>,
    ) -> Result<ExportOutcome, ExportError> {
        let mode = match request.output_kind {
            OutputKind::AudioOnly => AudioMode::Combine,
            OutputKind::Video => request.audio_mode,
        };
        let audio = plan_audio(request.audio_streams, &request.audio_tracks, mode);
        if request.output_kind == OutputKind::AudioOnly && audio.is_empty() {
            return Err(ExportError::NoAudio(request.source.clone()));
        }

        if let Some(parent) = request.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ExportError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let budget = BitrateBudget::from(&self.settings);
        let duration = request.duration_secs();
        let target = match (request.output_kind, request.quality) {
            (OutputKind::Video, QualityMode::SizeTargeted) => {
                request.target_size_mb.map(target_bytes)
            }
            _ => None,
        };
        let max_attempts = if target.is_some() {
            1 + budget.max_extra_attempts
        } else {
            1
        };
        let mut video_kbps = target.map(|bytes| initial_video_kbps(bytes, duration, &budget));
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_canceled() {
                return Ok(ExportOutcome::Canceled);
            }

            let args = build_export_args(
                &PassSpec {
                    source: &request.source,
                    output: &request.output,
                    trim_start: request.trim_start,
                    trim_end: request.trim_end,
                    output_kind: request.output_kind,
                    audio: &audio,
                    video_kbps,
                },
                &self.settings,
            );

            info!(
                job_token = %request.job_token,
                attempt,
                video_kbps = ?video_kbps,
                output = %request.output.display(),
                "Starting export pass"
            );

            let job_token = request.job_token.clone();
            let sender = progress.clone();
            let report = move |percent: f64| {
                // No subscribers is fine
                let _ = sender.send(ExportProgress {
                    job_token: job_token.clone(),
                    attempt,
                    percent,
                });
            };
            self.engine
                .transcode(&args, duration, &report, cancel)
                .await?;

            let size_bytes = tokio::fs::metadata(&request.output)
                .await
                .map_err(|source| ExportError::Io {
                    path: request.output.clone(),
                    source,
                })?
                .len();
            let within_budget = target.map_or(true, |bytes| size_bytes <= bytes);

            if within_budget || attempt >= max_attempts {
                if !within_budget {
                    warn!(
                        job_token = %request.job_token,
                        size_bytes,
                        target_bytes = ?target,
                        attempts = attempt,
                        "Size target still exceeded, keeping best effort"
                    );
                }
                info!(job_token = %request.job_token, size_bytes, attempts = attempt, "Export complete");
                return Ok(ExportOutcome::Completed {
                    output: request.output.clone(),
                    size_bytes,
                    attempts: attempt,
                    final_video_kbps: video_kbps,
                    within_budget,
                });
            }

            info!(
                job_token = %request.job_token,
                size_bytes,
                target_bytes = ?target,
                "Output over budget, re-encoding at a lower bitrate"
            );
            remove_output(&request.output).await?;
            video_kbps = video_kbps.map(|kbps| shrink_video_kbps(kbps, &budget));
        }
    }

    fn claim_token(&self, job_token: &str) -> Result<(), ExportError> {
        let mut jobs = lock(&self.jobs);
        if jobs.contains_key(job_token) {
            return Err(ExportError::TokenReused(job_token.to_string()));
        }
        jobs.insert(job_token.to_string(), ExportState::Pending);
        Ok(())
    }

    /// Move a job to `state`; terminal states are final
    fn set_state(&self, job_token: &str, state: ExportState) {
        let mut jobs = lock(&self.jobs);
        let current = jobs
            .entry(job_token.to_string())
            .or_insert(ExportState::Pending);
        if current.is_terminal() {
            debug!(job_token, from = ?current, to = ?state, "Ignoring transition out of a terminal state");
            return;
        }
        *current = state;
    }

    /// Track the job as the session's live process and hand back its progress sender
    fn activate(
        &self,
        request: &ExportRequest,
        cancel: Arc<CancelSignal>,
    ) -> broadcast::Sender<ExportProgress> {
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .entry(request.session.clone())
            .or_insert_with(Session::new);
        if let Some(previous) = &session.active {
            warn!(
                session = %request.session,
                previous = %previous.job_token,
                job_token = %request.job_token,
                "Session already has a running export; tracking the new one"
            );
        }
        session.active = Some(ActiveJob {
            job_token: request.job_token.clone(),
            cancel,
        });
        session.progress.clone()
    }

    fn deactivate(&self, request: &ExportRequest) {
        let mut sessions = lock(&self.sessions);
        if let Some(session) = sessions.get_mut(&request.session) {
            if session
                .active
                .as_ref()
                .is_some_and(|a| a.job_token == request.job_token)
            {
                session.active = None;
            }
        }
        // Idle sessions nobody listens to are recreated on demand
        sessions.retain(|_, s| s.active.is_some() || s.progress.receiver_count() > 0);
    }

    async fn settle_canceled(&self, request: &ExportRequest) {
        info!(job_token = %request.job_token, "Export canceled");
        self.set_state(&request.job_token, ExportState::Canceled);
        self.apply_partial_policy(&request.output).await;
    }

    async fn apply_partial_policy(&self, output: &Path) {
        if self.settings.partial_output != PartialOutputPolicy::Delete {
            return;
        }
        match tokio::fs::remove_file(output).await {
            Ok(()) => debug!(output = %output.display(), "Removed partial output"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(output = %output.display(), error = %e, "Failed to remove partial output"),
        }
    }
}

fn validate(request: &ExportRequest) -> Result<(), ExportError> {
    let valid_trim = request.trim_start.is_finite()
        && request.trim_end.is_finite()
        && request.trim_start >= 0.0
        && request.trim_end > request.trim_start;
    if !valid_trim {
        return Err(ExportError::InvalidTrim {
            start: request.trim_start,
            end: request.trim_end,
        });
    }

    let needs_target =
        request.quality == QualityMode::SizeTargeted && request.output_kind == OutputKind::Video;
    if needs_target && !request.target_size_mb.is_some_and(|mb| mb > 0.0) {
        return Err(ExportError::MissingTargetSize);
    }
    Ok(())
}

async fn remove_output(output: &Path) -> Result<(), ExportError> {
    match tokio::fs::remove_file(output).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ExportError::Io {
            path: output.to_path_buf(),
            source,
        }),
    }
}
