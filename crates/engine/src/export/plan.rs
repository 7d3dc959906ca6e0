//! Export planning
//!
//! Pure functions turning an export request into ffmpeg arguments: clip
//! bounds, audio routing and mixing, encoder settings and the size-targeted
//! video bitrate.

use crate::config::ExportConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::Path;

/// Volumes this close to 1.0 are treated as unity gain
const UNIT_VOLUME_EPSILON: f64 = 1e-6;

/// Label of the mixed audio stream
const MIX_LABEL: &str = "aout";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityMode {
    /// Copy the video stream untouched
    #[default]
    Passthrough,
    /// Re-encode video at a bitrate derived from a target file size
    SizeTargeted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioMode {
    /// Mix every audible track into one output stream
    #[default]
    Combine,
    /// One output stream per audible track
    Separate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    #[default]
    Video,
    /// Drop video; audio is always combined
    AudioOnly,
}

/// Per-track audio settings; tracks without an entry use the default
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackConfig {
    pub volume: f64,
    pub muted: bool,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            volume: 1.0,
            muted: false,
        }
    }
}

impl TrackConfig {
    pub fn is_unit_volume(&self) -> bool {
        (self.volume - 1.0).abs() < UNIT_VOLUME_EPSILON
    }
}

/// Audio-stream index (`0:a:<i>`) to its settings
pub type TrackMap = BTreeMap<usize, TrackConfig>;

/// Filter chains and `-map` targets for the audio of one export
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioPlan {
    /// Chains joined with `;` into `-filter_complex`
    pub filters: Vec<String>,
    /// Output audio streams in order
    pub maps: Vec<String>,
}

impl AudioPlan {
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn filter_complex(&self) -> Option<String> {
        if self.filters.is_empty() {
            None
        } else {
            Some(self.filters.join(";"))
        }
    }
}

fn format_volume(volume: f64) -> String {
    format!("{}", volume.max(0.0))
}

/// Gain stage for one stream, returning the chain and its output label
fn gain_stage(index: usize, volume: f64) -> (String, String) {
    let label = format!("a{}", index);
    let chain = format!("[0:a:{}]volume={}[{}]", index, format_volume(volume), label);
    (chain, label)
}

/// Route the source's audio streams into output streams
///
/// Muted tracks are left out entirely. Streams at unity volume are never sent
/// through a gain stage, and a lone unity stream in combine mode is mapped
/// directly so it needs no mix.
///
/// # Arguments
/// * `stream_count` - Audio streams present in the source
/// * `tracks` - Sparse per-track settings
/// * `mode` - Combine into one stream or keep separate
pub fn plan_audio(stream_count: usize, tracks: &TrackMap, mode: AudioMode) -> AudioPlan {
    let audible: Vec<(usize, TrackConfig)> = (0..stream_count)
        .map(|i| (i, tracks.get(&i).copied().unwrap_or_default()))
        .filter(|(_, track)| !track.muted)
        .collect();

    let mut plan = AudioPlan::default();
    if audible.is_empty() {
        return plan;
    }

    match mode {
        AudioMode::Separate => {
            for (index, track) in audible {
                if track.is_unit_volume() {
                    plan.maps.push(format!("0:a:{}", index));
                } else {
                    let (chain, label) = gain_stage(index, track.volume);
                    plan.filters.push(chain);
                    plan.maps.push(format!("[{}]", label));
                }
            }
        }
        AudioMode::Combine if audible.len() == 1 => {
            let (index, track) = audible[0];
            if track.is_unit_volume() {
                plan.maps.push(format!("0:a:{}", index));
            } else {
                let (chain, label) = gain_stage(index, track.volume);
                plan.filters.push(chain);
                plan.maps.push(format!("[{}]", label));
            }
        }
        AudioMode::Combine => {
            let mut inputs = String::new();
            for &(index, track) in &audible {
                if track.is_unit_volume() {
                    inputs.push_str(&format!("[0:a:{}]", index));
                } else {
                    let (chain, label) = gain_stage(index, track.volume);
                    plan.filters.push(chain);
                    inputs.push_str(&format!("[{}]", label));
                }
            }
            plan.filters.push(format!(
                "{}amix=inputs={}:duration=longest:normalize=0[{}]",
                inputs,
                audible.len(),
                MIX_LABEL
            ));
            plan.maps.push(format!("[{}]", MIX_LABEL));
        }
    }

    plan
}

/// Size-targeting parameters taken from `[export]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitrateBudget {
    pub safety_ratio: f64,
    pub assumed_audio_kbps: u32,
    pub min_video_kbps: u32,
    pub shrink_factor: f64,
    pub max_extra_attempts: u32,
}

impl From<&ExportConfig> for BitrateBudget {
    fn from(cfg: &ExportConfig) -> Self {
        Self {
            safety_ratio: cfg.size_safety_ratio,
            assumed_audio_kbps: cfg.assumed_audio_kbps,
            min_video_kbps: cfg.min_video_kbps,
            shrink_factor: cfg.bitrate_shrink_factor,
            max_extra_attempts: cfg.max_extra_attempts,
        }
    }
}

impl Default for BitrateBudget {
    fn default() -> Self {
        Self::from(&ExportConfig::default())
    }
}

/// Bytes in a target size given in megabytes
pub fn target_bytes(target_size_mb: f64) -> u64 {
    (target_size_mb.max(0.0) * 1024.0 * 1024.0) as u64
}

/// First-attempt video bitrate for a size target
///
/// `max(min_video, floor(target * safety * 8 / duration / 1000) - assumed_audio)`
pub fn initial_video_kbps(target_bytes: u64, duration_secs: f64, budget: &BitrateBudget) -> u32 {
    let target_bits = target_bytes as f64 * budget.safety_ratio * 8.0;
    let total_kbps = (target_bits / duration_secs / 1000.0).floor();
    let video_kbps = total_kbps - budget.assumed_audio_kbps as f64;
    video_kbps.max(budget.min_video_kbps as f64) as u32
}

/// Bitrate for the next attempt after an over-budget result
pub fn shrink_video_kbps(kbps: u32, budget: &BitrateBudget) -> u32 {
    ((kbps as f64 * budget.shrink_factor).floor() as u32).max(1)
}

/// Everything one transcoding pass needs
#[derive(Debug, Clone)]
pub struct PassSpec<'a> {
    pub source: &'a Path,
    pub output: &'a Path,
    pub trim_start: f64,
    pub trim_end: f64,
    pub output_kind: OutputKind,
    pub audio: &'a AudioPlan,
    /// Re-encode video at this bitrate; `None` copies the video stream
    pub video_kbps: Option<u32>,
}

fn arg(value: impl AsRef<OsStr>) -> OsString {
    value.as_ref().to_owned()
}

/// Build the ffmpeg arguments for one pass (global flags excluded)
pub fn build_export_args(pass: &PassSpec<'_>, cfg: &ExportConfig) -> Vec<OsString> {
    let duration = (pass.trim_end - pass.trim_start).max(0.0);
    let mut args = vec![
        arg("-ss"),
        arg(format!("{:.3}", pass.trim_start.max(0.0))),
        arg("-i"),
        arg(pass.source),
        arg("-t"),
        arg(format!("{:.3}", duration)),
    ];

    if let Some(filter) = pass.audio.filter_complex() {
        args.extend([arg("-filter_complex"), arg(filter)]);
    }

    let audio_maps = pass
        .audio
        .maps
        .iter()
        .flat_map(|map| [arg("-map"), arg(map)]);

    match pass.output_kind {
        OutputKind::Video => {
            args.extend([arg("-map"), arg("0:v:0?")]);
            match pass.video_kbps {
                Some(kbps) => args.extend([
                    arg("-c:v"),
                    arg(&cfg.video_codec),
                    arg("-preset"),
                    arg(&cfg.video_preset),
                    arg("-b:v"),
                    arg(format!("{}k", kbps)),
                    arg("-maxrate"),
                    arg(format!("{}k", kbps)),
                    arg("-bufsize"),
                    arg(format!("{}k", kbps.saturating_mul(2))),
                    arg("-movflags"),
                    arg("+faststart"),
                ]),
                None => args.extend([arg("-c:v"), arg("copy")]),
            }
            args.extend(audio_maps);
            if pass.audio.is_empty() {
                args.push(arg("-an"));
            } else {
                args.extend([
                    arg("-c:a"),
                    arg(&cfg.audio_codec),
                    arg("-b:a"),
                    arg(format!("{}k", cfg.audio_bitrate_kbps)),
                ]);
            }
        }
        OutputKind::AudioOnly => {
            args.push(arg("-vn"));
            args.extend(audio_maps);
            args.extend([
                arg("-c:a"),
                arg(&cfg.audio_only_codec),
                arg("-b:a"),
                arg(format!("{}k", cfg.audio_only_bitrate_kbps)),
            ]);
        }
    }

    args.push(arg(pass.output));
    args
}
