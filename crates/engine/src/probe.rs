//! Probe metadata model
//!
//! The cache keeps ffprobe's raw JSON on disk verbatim; this module turns it
//! into the handful of facts the rest of the engine relies on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for probe parsing.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),
}

/// Information about a video stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoStream {
    /// Codec name (e.g., "hevc", "h264").
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    /// Bitrate in kbps (if available).
    pub bitrate_kbps: Option<f32>,
}

/// Information about an audio stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioStream {
    /// Absolute stream index inside the container.
    pub index: u32,
    /// Codec name (e.g., "aac", "opus").
    pub codec_name: String,
    pub channels: u32,
}

/// Parsed view of a source's probe metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    pub video_streams: Vec<VideoStream>,
    /// Audio streams in container order; position `i` is addressed as `0:a:i`.
    pub audio_streams: Vec<AudioStream>,
    pub duration_secs: f64,
    pub size_bytes: u64,
}

impl MediaInfo {
    pub fn audio_stream_count(&self) -> usize {
        self.audio_streams.len()
    }

    pub fn has_video(&self) -> bool {
        !self.video_streams.is_empty()
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub index: Option<u32>,
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
        pub channels: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
    }
}

/// Parses raw ffprobe JSON into a [`MediaInfo`].
pub fn parse_probe_json(value: &serde_json::Value) -> Result<MediaInfo, ProbeError> {
    let ffprobe = ffprobe_json::FfprobeOutput::deserialize(value)
        .map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let mut video_streams = Vec::new();
    let mut audio_streams = Vec::new();

    for (position, stream) in streams.into_iter().enumerate() {
        let codec_type = stream.codec_type.as_deref().unwrap_or("");
        let codec_name = stream.codec_name.clone().unwrap_or_default();

        match codec_type {
            "video" => {
                let bitrate_kbps = stream
                    .bit_rate
                    .as_ref()
                    .and_then(|br| br.parse::<f64>().ok())
                    .map(|bps| (bps / 1000.0) as f32);

                video_streams.push(VideoStream {
                    codec_name,
                    width: stream.width.unwrap_or(0),
                    height: stream.height.unwrap_or(0),
                    bitrate_kbps,
                });
            }
            "audio" => {
                audio_streams.push(AudioStream {
                    index: stream.index.unwrap_or(position as u32),
                    codec_name,
                    channels: stream.channels.unwrap_or(0),
                });
            }
            _ => {}
        }
    }

    let duration_secs = format
        .duration
        .as_ref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let size_bytes = format
        .size
        .as_ref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(MediaInfo {
        video_streams,
        audio_streams,
        duration_secs,
        size_bytes,
    })
}

/// Parses ffprobe JSON text into a [`MediaInfo`].
pub fn parse_probe_str(json_str: &str) -> Result<MediaInfo, ProbeError> {
    let value: serde_json::Value =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;
    parse_probe_json(&value)
}
