//! External media engine seam
//!
//! Everything the cache and the export pipeline need from ffmpeg/ffprobe goes
//! through [`MediaEngine`], so tests can substitute a fake engine.

pub mod ffmpeg;
pub mod progress;

pub use ffmpeg::Ffmpeg;
pub use progress::parse_progress_line;

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

/// Error type for external engine invocations
#[derive(Debug, Error)]
pub enum EngineError {
    /// The tool could not be started at all
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool exited with a non-zero status
    #[error("{program} failed with exit code {code}: {stderr}")]
    Failed {
        program: String,
        code: i32,
        stderr: String,
    },

    /// The tool was terminated by a signal
    #[error("{program} was terminated by signal: {stderr}")]
    Terminated { program: String, stderr: String },

    /// The tool was killed because its cancel signal fired
    #[error("{program} was killed on request")]
    Killed { program: String },

    /// The tool ran past its deadline and was killed
    #[error("{program} timed out after {secs}s")]
    TimedOut { program: String, secs: u64 },

    /// The tool succeeded but its output could not be used
    #[error("{program} produced malformed output: {message}")]
    Malformed { program: String, message: String },

    /// IO error while talking to the process
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cancellation flag paired with a wakeup for whoever is waiting on a process
///
/// The flag is set before waiters are woken, so a process killed through this
/// signal can always be told apart from one that died on its own.
#[derive(Debug, Default)]
pub struct CancelSignal {
    canceled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every waiter
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

/// Callback receiving transcode progress as a percentage in `[0, 100]`
pub type ProgressFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// Operations the core needs from the external media engine
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Raw probe output for a source (ffprobe JSON)
    async fn probe(&self, path: &Path) -> Result<serde_json::Value, EngineError>;

    /// Write one frame at `at_secs`, scaled and padded to `width`x`height`, as JPEG
    async fn extract_frame(
        &self,
        path: &Path,
        at_secs: f64,
        width: u32,
        height: u32,
        output: &Path,
    ) -> Result<(), EngineError>;

    /// Decode the `audio_index`-th audio stream to PCM WAV, killed after `timeout`
    async fn extract_audio(
        &self,
        path: &Path,
        audio_index: usize,
        sample_rate: u32,
        channels: u32,
        output: &Path,
        timeout: Duration,
    ) -> Result<(), EngineError>;

    /// Run one transcoding pass with the given arguments
    ///
    /// `duration_secs` is the length of the clip being produced and scales
    /// progress. The pass is killed when `cancel` fires.
    async fn transcode(
        &self,
        args: &[OsString],
        duration_secs: f64,
        progress: ProgressFn<'_>,
        cancel: &CancelSignal,
    ) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cancel_signal_wakes_waiter() {
        let signal = Arc::new(CancelSignal::new());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };

        tokio::task::yield_now().await;
        assert!(!signal.is_canceled());
        signal.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(signal.is_canceled());
    }

    #[tokio::test]
    async fn test_cancel_before_wait_resolves_immediately() {
        let signal = CancelSignal::new();
        signal.cancel();
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("already-canceled signal should resolve");
    }
}
