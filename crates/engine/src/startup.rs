//! Startup checks module for clipshelf
//!
//! Preflight checks run before the service accepts work:
//! - ffmpeg is runnable and reports a parseable version
//! - ffprobe is runnable

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{program} not available: {reason}")]
    ToolUnavailable { program: String, reason: String },

    #[error("Could not parse FFmpeg version from output: {0}")]
    FfmpegVersion(String),
}

/// Run `<program> -version` and return its stdout
///
/// # Arguments
/// * `program` - Executable name or path
///
/// # Returns
/// * `Ok(String)` - The tool ran and exited successfully
/// * `Err(StartupError::ToolUnavailable)` - Spawn failed or non-zero exit
pub fn check_tool_available(program: &Path) -> Result<String, StartupError> {
    let name = program.display().to_string();
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            program: name.clone(),
            reason: format!("{} -version failed; is it installed and in PATH? Error: {}", name, e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            program: name.clone(),
            reason: format!("{} -version exited with {}", name, output.status),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 7.1 ..."
/// - N-prefixed: "ffmpeg version n7.1-... ..."
///
/// The same banner shape is used by ffprobe ("ffprobe version ...").
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_part = version_output.lines().find_map(|line| {
        let lower = line.to_lowercase();
        let (_, rest) = lower
            .split_once("ffmpeg version")
            .or_else(|| lower.split_once("ffprobe version"))?;
        rest.split_whitespace().next().map(str::to_string)
    })?;

    // "n7.1-123-gabcdef" -> "7.1-123-gabcdef"
    let version_str = version_part.trim_start_matches('n');

    version_str
        .split(|c| c == '.' || c == '-')
        .next()?
        .parse()
        .ok()
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. ffmpeg availability and version banner
/// 2. ffprobe availability
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let banner = check_tool_available(&cfg.tools.ffmpeg)?;
    let major = parse_ffmpeg_version(&banner).ok_or_else(|| {
        StartupError::FfmpegVersion(banner.lines().next().unwrap_or("(empty)").to_string())
    })?;
    check_tool_available(&cfg.tools.ffprobe)?;

    info!(ffmpeg_major = major, "Startup checks passed");
    Ok(())
}
