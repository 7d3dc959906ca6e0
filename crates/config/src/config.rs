//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Locations of the external media tools
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
        }
    }
}

/// Background task queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QueueConfig {
    /// Maximum concurrent background tasks (0 = auto-derive from core count)
    #[serde(default)]
    pub max_concurrent_tasks: u32,
}

/// Artifact cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Cache root directory (callers pick a default when unset)
    pub root: Option<PathBuf>,
    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: u32,
    #[serde(default = "default_thumbnail_height")]
    pub thumbnail_height: u32,
    /// Fraction of the duration sampled for thumbnails without an explicit timestamp
    #[serde(default = "default_thumbnail_position")]
    pub thumbnail_position: f64,
    #[serde(default = "default_audio_sample_rate")]
    pub audio_sample_rate: u32,
    #[serde(default = "default_audio_channels")]
    pub audio_channels: u32,
    /// Per-track timeout for audio extraction
    #[serde(default = "default_audio_extract_timeout_secs")]
    pub audio_extract_timeout_secs: u64,
    /// Size cap for the whole cache; no eviction when unset
    pub max_bytes: Option<u64>,
}

fn default_thumbnail_width() -> u32 {
    320
}

fn default_thumbnail_height() -> u32 {
    180
}

fn default_thumbnail_position() -> f64 {
    0.10
}

fn default_audio_sample_rate() -> u32 {
    44_100
}

fn default_audio_channels() -> u32 {
    2
}

fn default_audio_extract_timeout_secs() -> u64 {
    30
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            thumbnail_width: default_thumbnail_width(),
            thumbnail_height: default_thumbnail_height(),
            thumbnail_position: default_thumbnail_position(),
            audio_sample_rate: default_audio_sample_rate(),
            audio_channels: default_audio_channels(),
            audio_extract_timeout_secs: default_audio_extract_timeout_secs(),
            max_bytes: None,
        }
    }
}

/// What happens to a partially written export after cancel or failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartialOutputPolicy {
    /// Leave the partial file for the caller to inspect or remove
    #[default]
    Keep,
    /// Remove the partial file before the export settles
    Delete,
}

impl PartialOutputPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "keep" => Some(Self::Keep),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Export pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportConfig {
    /// Fraction of the size target actually budgeted for the stream
    #[serde(default = "default_size_safety_ratio")]
    pub size_safety_ratio: f64,
    /// Audio bitrate subtracted from the size budget
    #[serde(default = "default_assumed_audio_kbps")]
    pub assumed_audio_kbps: u32,
    #[serde(default = "default_min_video_kbps")]
    pub min_video_kbps: u32,
    /// Multiplier applied to the bitrate after an oversized attempt
    #[serde(default = "default_bitrate_shrink_factor")]
    pub bitrate_shrink_factor: f64,
    /// Re-encodes allowed after the first size-targeted attempt
    #[serde(default = "default_max_extra_attempts")]
    pub max_extra_attempts: u32,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_video_preset")]
    pub video_preset: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    #[serde(default = "default_audio_bitrate_kbps")]
    pub audio_bitrate_kbps: u32,
    #[serde(default = "default_audio_only_codec")]
    pub audio_only_codec: String,
    #[serde(default = "default_audio_bitrate_kbps")]
    pub audio_only_bitrate_kbps: u32,
    #[serde(default)]
    pub partial_output: PartialOutputPolicy,
}

fn default_size_safety_ratio() -> f64 {
    0.92
}

fn default_assumed_audio_kbps() -> u32 {
    128
}

fn default_min_video_kbps() -> u32 {
    100
}

fn default_bitrate_shrink_factor() -> f64 {
    0.85
}

fn default_max_extra_attempts() -> u32 {
    2
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_video_preset() -> String {
    "fast".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_audio_bitrate_kbps() -> u32 {
    192
}

fn default_audio_only_codec() -> String {
    "libmp3lame".to_string()
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            size_safety_ratio: default_size_safety_ratio(),
            assumed_audio_kbps: default_assumed_audio_kbps(),
            min_video_kbps: default_min_video_kbps(),
            bitrate_shrink_factor: default_bitrate_shrink_factor(),
            max_extra_attempts: default_max_extra_attempts(),
            video_codec: default_video_codec(),
            video_preset: default_video_preset(),
            audio_codec: default_audio_codec(),
            audio_bitrate_kbps: default_audio_bitrate_kbps(),
            audio_only_codec: default_audio_only_codec(),
            audio_only_bitrate_kbps: default_audio_bitrate_kbps(),
            partial_output: PartialOutputPolicy::default(),
        }
    }
}

/// Folder watch configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    /// Quiet period before a changed path is reconciled
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    500
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - CLIPSHELF_FFMPEG -> tools.ffmpeg
    /// - CLIPSHELF_FFPROBE -> tools.ffprobe
    /// - CLIPSHELF_MAX_CONCURRENT_TASKS -> queue.max_concurrent_tasks
    /// - CLIPSHELF_CACHE_DIR -> cache.root
    /// - CLIPSHELF_CACHE_MAX_BYTES -> cache.max_bytes
    /// - CLIPSHELF_DEBOUNCE_MS -> watch.debounce_ms
    /// - CLIPSHELF_PARTIAL_OUTPUT -> export.partial_output
    ///
    /// Values that fail to parse leave the existing setting untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CLIPSHELF_FFMPEG") {
            if !val.is_empty() {
                self.tools.ffmpeg = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("CLIPSHELF_FFPROBE") {
            if !val.is_empty() {
                self.tools.ffprobe = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("CLIPSHELF_MAX_CONCURRENT_TASKS") {
            if let Ok(tasks) = val.parse::<u32>() {
                self.queue.max_concurrent_tasks = tasks;
            }
        }

        if let Ok(val) = env::var("CLIPSHELF_CACHE_DIR") {
            if !val.is_empty() {
                self.cache.root = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("CLIPSHELF_CACHE_MAX_BYTES") {
            if let Ok(bytes) = val.parse::<u64>() {
                self.cache.max_bytes = Some(bytes);
            }
        }

        if let Ok(val) = env::var("CLIPSHELF_DEBOUNCE_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.watch.debounce_ms = ms;
            }
        }

        if let Ok(val) = env::var("CLIPSHELF_PARTIAL_OUTPUT") {
            if let Some(policy) = PartialOutputPolicy::parse(&val) {
                self.export.partial_output = policy;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Env var tests share process state
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        env::remove_var("CLIPSHELF_FFMPEG");
        env::remove_var("CLIPSHELF_FFPROBE");
        env::remove_var("CLIPSHELF_MAX_CONCURRENT_TASKS");
        env::remove_var("CLIPSHELF_CACHE_DIR");
        env::remove_var("CLIPSHELF_CACHE_MAX_BYTES");
        env::remove_var("CLIPSHELF_DEBOUNCE_MS");
        env::remove_var("CLIPSHELF_PARTIAL_OUTPUT");
    }

    // *For any* valid TOML configuration, every section parses into the matching fields.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            max_tasks in 0u32..64,
            timeout in 1u64..600,
            max_bytes in proptest::option::of(1u64..1_000_000_000),
            shrink in 0.1f64..1.0,
            extra in 0u32..5,
            debounce in 0u64..5000,
            delete_partial in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[tools]
ffmpeg = "/opt/ffmpeg/bin/ffmpeg"

[queue]
max_concurrent_tasks = {}

[cache]
audio_extract_timeout_secs = {}
{}

[export]
bitrate_shrink_factor = {}
max_extra_attempts = {}
partial_output = "{}"

[watch]
debounce_ms = {}
"#,
                max_tasks,
                timeout,
                max_bytes.map(|b| format!("max_bytes = {}", b)).unwrap_or_default(),
                shrink,
                extra,
                if delete_partial { "delete" } else { "keep" },
                debounce,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.tools.ffmpeg, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
            prop_assert_eq!(config.tools.ffprobe, PathBuf::from("ffprobe"));
            prop_assert_eq!(config.queue.max_concurrent_tasks, max_tasks);
            prop_assert_eq!(config.cache.audio_extract_timeout_secs, timeout);
            prop_assert_eq!(config.cache.max_bytes, max_bytes);
            prop_assert!((config.export.bitrate_shrink_factor - shrink).abs() < 1e-9);
            prop_assert_eq!(config.export.max_extra_attempts, extra);
            let expected_policy = if delete_partial {
                PartialOutputPolicy::Delete
            } else {
                PartialOutputPolicy::Keep
            };
            prop_assert_eq!(config.export.partial_output, expected_policy);
            prop_assert_eq!(config.watch.debounce_ms, debounce);
        }

        #[test]
        fn prop_env_overrides_max_concurrent_tasks(
            initial in 0u32..16,
            override_tasks in 0u32..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[queue]\nmax_concurrent_tasks = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("CLIPSHELF_MAX_CONCURRENT_TASKS", override_tasks.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.queue.max_concurrent_tasks, override_tasks);
        }

        #[test]
        fn prop_env_overrides_debounce(
            initial in 0u64..2000,
            override_ms in 0u64..10_000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[watch]\ndebounce_ms = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("CLIPSHELF_DEBOUNCE_MS", override_ms.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.watch.debounce_ms, override_ms);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.tools.ffmpeg, PathBuf::from("ffmpeg"));
        assert_eq!(config.queue.max_concurrent_tasks, 0);
        assert_eq!(config.cache.root, None);
        assert_eq!(config.cache.thumbnail_width, 320);
        assert!((config.cache.thumbnail_position - 0.10).abs() < 1e-9);
        assert_eq!(config.cache.audio_extract_timeout_secs, 30);
        assert_eq!(config.cache.max_bytes, None);
        assert!((config.export.size_safety_ratio - 0.92).abs() < 1e-9);
        assert_eq!(config.export.assumed_audio_kbps, 128);
        assert_eq!(config.export.min_video_kbps, 100);
        assert!((config.export.bitrate_shrink_factor - 0.85).abs() < 1e-9);
        assert_eq!(config.export.max_extra_attempts, 2);
        assert_eq!(config.export.partial_output, PartialOutputPolicy::Keep);
        assert_eq!(config.watch.debounce_ms, 500);
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[cache]
root = "/var/cache/clipshelf"
thumbnail_width = 640
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.cache.root, Some(PathBuf::from("/var/cache/clipshelf")));
        assert_eq!(config.cache.thumbnail_width, 640);
        assert_eq!(config.cache.thumbnail_height, 180);
        assert_eq!(config.export, ExportConfig::default());
    }

    #[test]
    fn test_env_overrides_paths_and_policy() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        env::set_var("CLIPSHELF_CACHE_DIR", "/tmp/shelf");
        env::set_var("CLIPSHELF_CACHE_MAX_BYTES", "1048576");
        env::set_var("CLIPSHELF_PARTIAL_OUTPUT", "DELETE");
        env::set_var("CLIPSHELF_FFPROBE", "/usr/local/bin/ffprobe");
        let config = Config::from_env();
        clear_env_vars();

        assert_eq!(config.cache.root, Some(PathBuf::from("/tmp/shelf")));
        assert_eq!(config.cache.max_bytes, Some(1_048_576));
        assert_eq!(config.export.partial_output, PartialOutputPolicy::Delete);
        assert_eq!(config.tools.ffprobe, PathBuf::from("/usr/local/bin/ffprobe"));
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        env::set_var("CLIPSHELF_MAX_CONCURRENT_TASKS", "lots");
        env::set_var("CLIPSHELF_PARTIAL_OUTPUT", "shred");
        let config = Config::from_env();
        clear_env_vars();

        assert_eq!(config.queue.max_concurrent_tasks, 0);
        assert_eq!(config.export.partial_output, PartialOutputPolicy::Keep);
    }

    #[test]
    fn test_unknown_policy_in_toml_is_a_parse_error() {
        let result = Config::parse_toml("[export]\npartial_output = \"shred\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
