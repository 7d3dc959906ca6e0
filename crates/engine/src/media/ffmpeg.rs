//! Process-backed media engine driving ffmpeg and ffprobe
//!
//! Builds the command lines for each engine operation and executes them on
//! `tokio::process`, capturing a stderr tail for error reporting.

use super::{parse_progress_line, CancelSignal, EngineError, MediaEngine, ProgressFn};
use async_trait::async_trait;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Number of stderr lines kept for error messages
const STDERR_TAIL_LINES: usize = 12;

/// ffmpeg/ffprobe located at configurable paths
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Ffmpeg {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    fn ffmpeg_name(&self) -> String {
        self.ffmpeg.display().to_string()
    }

    fn ffprobe_name(&self) -> String {
        self.ffprobe.display().to_string()
    }

    /// `ffprobe -v quiet -print_format json -show_streams -show_format <path>`
    pub fn build_probe_command(&self, path: &Path) -> Command {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path);
        cmd
    }

    /// Single-frame JPEG grab, letterboxed to a fixed size
    pub fn build_frame_command(
        &self,
        path: &Path,
        at_secs: f64,
        width: u32,
        height: u32,
        output: &Path,
    ) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"]);
        // Input seeking keeps frame grabs fast on long sources
        cmd.arg("-ss").arg(format!("{:.3}", at_secs.max(0.0)));
        cmd.arg("-i").arg(path);
        cmd.args(["-frames:v", "1"]);
        cmd.arg("-vf").arg(format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2",
            w = width,
            h = height
        ));
        cmd.args(["-q:v", "3"]);
        cmd.arg(output);
        cmd
    }

    /// Decode one audio stream to 16-bit PCM WAV
    pub fn build_audio_command(
        &self,
        path: &Path,
        audio_index: usize,
        sample_rate: u32,
        channels: u32,
        output: &Path,
    ) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"]);
        cmd.arg("-i").arg(path);
        cmd.arg("-map").arg(format!("0:a:{}", audio_index));
        cmd.arg("-vn");
        cmd.arg("-ac").arg(channels.to_string());
        cmd.arg("-ar").arg(sample_rate.to_string());
        cmd.args(["-c:a", "pcm_s16le"]);
        cmd.arg(output);
        cmd
    }

    /// Transcode pass reporting machine-readable progress on stdout
    pub fn build_transcode_command(&self, args: &[OsString]) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-y", "-nostats", "-progress", "pipe:1"]);
        cmd.args(args);
        cmd
    }

    async fn run_to_completion(&self, mut cmd: Command, program: String) -> Result<(), EngineError> {
        let output = cmd
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stderr = tail(&String::from_utf8_lossy(&output.stderr));
        check_status(program, output.status, stderr)
    }
}

#[async_trait]
impl MediaEngine for Ffmpeg {
    async fn probe(&self, path: &Path) -> Result<serde_json::Value, EngineError> {
        let program = self.ffprobe_name();
        let output = self
            .build_probe_command(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stderr = tail(&String::from_utf8_lossy(&output.stderr));
        check_status(program.clone(), output.status, stderr)?;

        serde_json::from_slice(&output.stdout).map_err(|e| EngineError::Malformed {
            program,
            message: e.to_string(),
        })
    }

    async fn extract_frame(
        &self,
        path: &Path,
        at_secs: f64,
        width: u32,
        height: u32,
        output: &Path,
    ) -> Result<(), EngineError> {
        let cmd = self.build_frame_command(path, at_secs, width, height, output);
        self.run_to_completion(cmd, self.ffmpeg_name()).await
    }

    async fn extract_audio(
        &self,
        path: &Path,
        audio_index: usize,
        sample_rate: u32,
        channels: u32,
        output: &Path,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let program = self.ffmpeg_name();
        let mut child = self
            .build_audio_command(path, audio_index, sample_rate, channels, output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stderr_task = tokio::spawn(collect_tail(child.stderr.take()));
        let waited = tokio::time::timeout(timeout, child.wait()).await;

        match waited {
            Ok(status) => {
                let stderr = stderr_task.await.unwrap_or_default();
                check_status(program, status?, stderr)
            }
            Err(_) => {
                debug!(path = %path.display(), audio_index, "audio extraction timed out, killing");
                let _ = child.kill().await;
                stderr_task.abort();
                Err(EngineError::TimedOut {
                    program,
                    secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn transcode(
        &self,
        args: &[OsString],
        duration_secs: f64,
        progress: ProgressFn<'_>,
        cancel: &CancelSignal,
    ) -> Result<(), EngineError> {
        let program = self.ffmpeg_name();
        let mut child = self
            .build_transcode_command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stderr_task = tokio::spawn(collect_tail(child.stderr.take()));
        let mut progress_lines = child.stdout.take().map(|out| BufReader::new(out).lines());

        enum Step {
            Exited(io::Result<ExitStatus>),
            Line(io::Result<Option<String>>),
            Cancel,
        }

        let status = loop {
            let step = tokio::select! {
                status = child.wait() => Step::Exited(status),
                line = next_line(&mut progress_lines), if progress_lines.is_some() => Step::Line(line),
                _ = cancel.cancelled() => Step::Cancel,
            };

            match step {
                Step::Exited(status) => break status?,
                Step::Line(Ok(Some(line))) => {
                    if let Some(pct) = parse_progress_line(&line, duration_secs) {
                        progress(pct);
                    }
                }
                Step::Line(_) => progress_lines = None,
                Step::Cancel => {
                    debug!("transcode canceled, killing {}", program);
                    let _ = child.kill().await;
                    stderr_task.abort();
                    return Err(EngineError::Killed { program });
                }
            }
        };

        let stderr = stderr_task.await.unwrap_or_default();
        check_status(program, status, stderr)
    }
}

async fn next_line<R>(
    lines: &mut Option<tokio::io::Lines<BufReader<R>>>,
) -> io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => Ok(None),
    }
}

async fn collect_tail<R>(stream: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return String::new();
    };

    let mut lines = BufReader::new(stream).lines();
    let mut kept: Vec<String> = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if kept.len() == STDERR_TAIL_LINES {
            kept.remove(0);
        }
        kept.push(line);
    }
    kept.join("\n")
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

fn check_status(program: String, status: ExitStatus, stderr: String) -> Result<(), EngineError> {
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(EngineError::Failed {
            program,
            code,
            stderr,
        }),
        None => Err(EngineError::Terminated { program, stderr }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    #[test]
    fn test_probe_command() {
        let engine = Ffmpeg::new("ffmpeg", "/opt/ffprobe");
        let cmd = engine.build_probe_command(Path::new("/clips/a.mp4"));
        let args = get_command_args(&cmd);

        assert_eq!(cmd.as_std().get_program(), OsStr::new("/opt/ffprobe"));
        assert!(has_flag_with_value(&args, "-print_format", "json"));
        assert!(args.contains(&"-show_streams".to_string()));
        assert_eq!(args.last().unwrap(), "/clips/a.mp4");
    }

    #[test]
    fn test_frame_command_seeks_and_sizes() {
        let engine = Ffmpeg::new("ffmpeg", "ffprobe");
        let cmd = engine.build_frame_command(
            Path::new("/clips/a.mp4"),
            12.5,
            320,
            180,
            Path::new("/cache/a.jpg"),
        );
        let args = get_command_args(&cmd);

        assert!(has_flag_with_value(&args, "-ss", "12.500"));
        assert!(has_flag_with_value(&args, "-frames:v", "1"));
        assert!(args
            .iter()
            .any(|a| a.starts_with("scale=320:180") && a.contains("pad=320:180")));
        assert_eq!(args.last().unwrap(), "/cache/a.jpg");
    }

    #[test]
    fn test_frame_command_clamps_negative_seek() {
        let engine = Ffmpeg::new("ffmpeg", "ffprobe");
        let cmd = engine.build_frame_command(
            Path::new("a.mp4"),
            -3.0,
            10,
            10,
            Path::new("a.jpg"),
        );
        assert!(has_flag_with_value(&get_command_args(&cmd), "-ss", "0.000"));
    }

    #[test]
    fn test_audio_command_maps_relative_stream() {
        let engine = Ffmpeg::new("ffmpeg", "ffprobe");
        let cmd = engine.build_audio_command(
            Path::new("/clips/a.mkv"),
            2,
            44_100,
            2,
            Path::new("/cache/track_2.wav"),
        );
        let args = get_command_args(&cmd);

        assert!(has_flag_with_value(&args, "-map", "0:a:2"));
        assert!(has_flag_with_value(&args, "-ar", "44100"));
        assert!(has_flag_with_value(&args, "-ac", "2"));
        assert!(has_flag_with_value(&args, "-c:a", "pcm_s16le"));
    }

    #[test]
    fn test_transcode_command_reports_progress() {
        let engine = Ffmpeg::new("ffmpeg", "ffprobe");
        let cmd = engine.build_transcode_command(&[OsString::from("-i"), OsString::from("in.mp4")]);
        let args = get_command_args(&cmd);

        assert!(has_flag_with_value(&args, "-progress", "pipe:1"));
        assert!(args.contains(&"-nostats".to_string()));
        assert!(has_flag_with_value(&args, "-i", "in.mp4"));
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let text: String = (0..30).map(|i| format!("line {}\n", i)).collect();
        let kept = tail(&text);
        assert!(kept.starts_with("line 18"));
        assert!(kept.ends_with("line 29"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let engine = Ffmpeg::new(
            "/nonexistent/clipshelf-ffmpeg",
            "/nonexistent/clipshelf-ffprobe",
        );
        let err = engine.probe(Path::new("a.mp4")).await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }

    /// Executable stand-in for ffmpeg that never finishes on its own
    #[cfg(unix)]
    fn stalled_tool(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("stalled-ffmpeg");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_transcode_cancel_kills_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = stalled_tool(dir.path());
        let engine = Ffmpeg::new(&tool, &tool);
        let cancel = std::sync::Arc::new(CancelSignal::new());

        let canceler = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            })
        };

        let args = vec![OsString::from("out.mp4")];
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            engine.transcode(&args, 10.0, &|_: f64| {}, &cancel),
        )
        .await
        .expect("transcode should stop soon after cancel");

        canceler.await.unwrap();
        assert!(matches!(result, Err(EngineError::Killed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_audio_extraction_deadline_kills_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = stalled_tool(dir.path());
        let engine = Ffmpeg::new(&tool, &tool);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            engine.extract_audio(
                Path::new("a.mp4"),
                0,
                44_100,
                2,
                &dir.path().join("track_0.wav"),
                Duration::from_millis(100),
            ),
        )
        .await
        .expect("extraction should stop at its deadline");

        assert!(matches!(result, Err(EngineError::TimedOut { .. })));
    }
}
