//! On-disk cache layout
//!
//! ```text
//! <root>/metadata/<fp>_<name>.json
//! <root>/thumbnails/<fp>_<name>.jpg
//! <root>/audio/<fp>_<name>/track_<i>.wav
//! <root>/audio/<fp>_<name>/manifest.json
//! ```
//!
//! The manifest is written last, so an audio directory without one is never
//! treated as a valid set.

use super::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Longest source basename kept in cache entry names
const MAX_NAME_LEN: usize = 64;

/// File name of the audio set manifest
pub const MANIFEST_FILE: &str = "manifest.json";

/// Suffix of files still being written
pub const PARTIAL_SUFFIX: &str = ".part";

/// Kind of derived artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Metadata,
    Thumbnail,
    ExtractedAudio,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [
        ArtifactKind::Metadata,
        ArtifactKind::Thumbnail,
        ArtifactKind::ExtractedAudio,
    ];

    /// Subdirectory of the cache root holding this kind
    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::Metadata => "metadata",
            ArtifactKind::Thumbnail => "thumbnails",
            ArtifactKind::ExtractedAudio => "audio",
        }
    }
}

/// Track list written once every file of an audio set is complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioManifest {
    /// Track file names in audio-stream order
    pub tracks: Vec<String>,
}

/// Path arithmetic for the cache root
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn kind_dir(&self, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    /// `<fp>_<sanitized basename>`
    pub fn entry_stem(fingerprint: &Fingerprint, source: &Path) -> String {
        format!("{}_{}", fingerprint, sanitize_name(source))
    }

    /// Location of an artifact entry (a file, or a directory for audio sets)
    pub fn entry_path(&self, kind: ArtifactKind, fingerprint: &Fingerprint, source: &Path) -> PathBuf {
        let stem = Self::entry_stem(fingerprint, source);
        let dir = self.kind_dir(kind);
        match kind {
            ArtifactKind::Metadata => dir.join(format!("{}.json", stem)),
            ArtifactKind::Thumbnail => dir.join(format!("{}.jpg", stem)),
            ArtifactKind::ExtractedAudio => dir.join(stem),
        }
    }

    pub fn track_file_name(audio_index: usize) -> String {
        format!("track_{}.wav", audio_index)
    }

    pub fn manifest_path(audio_dir: &Path) -> PathBuf {
        audio_dir.join(MANIFEST_FILE)
    }

    /// Temporary sibling used while a file is written
    pub fn partial_path(path: &Path) -> PathBuf {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        // Keep the real extension last so ffmpeg still infers the format
        let partial_name = match file_name.rsplit_once('.') {
            Some((stem, ext)) => format!("{}{}.{}", stem, PARTIAL_SUFFIX, ext),
            None => format!("{}{}", file_name, PARTIAL_SUFFIX),
        };
        path.with_file_name(partial_name)
    }
}

/// Basename reduced to `[A-Za-z0-9._-]`, capped at [`MAX_NAME_LEN`]
fn sanitize_name(source: &Path) -> String {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "source".to_string());

    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::fingerprint_path_only;

    #[test]
    fn test_entry_paths_per_kind() {
        let layout = CacheLayout::new("/cache");
        let source = Path::new("/clips/My Clip.mp4");
        let fp = fingerprint_path_only(source);

        let metadata = layout.entry_path(ArtifactKind::Metadata, &fp, source);
        assert_eq!(
            metadata,
            PathBuf::from(format!("/cache/metadata/{}_My_Clip.mp4.json", fp))
        );

        let thumbnail = layout.entry_path(ArtifactKind::Thumbnail, &fp, source);
        assert!(thumbnail.starts_with("/cache/thumbnails"));
        assert_eq!(thumbnail.extension().unwrap(), "jpg");

        let audio = layout.entry_path(ArtifactKind::ExtractedAudio, &fp, source);
        assert_eq!(
            audio,
            PathBuf::from(format!("/cache/audio/{}_My_Clip.mp4", fp))
        );
        assert_eq!(
            CacheLayout::manifest_path(&audio),
            audio.join("manifest.json")
        );
    }

    #[test]
    fn test_partial_path_keeps_extension() {
        assert_eq!(
            CacheLayout::partial_path(Path::new("/cache/thumbnails/abc_clip.mp4.jpg")),
            PathBuf::from("/cache/thumbnails/abc_clip.mp4.part.jpg")
        );
        assert_eq!(
            CacheLayout::partial_path(Path::new("/cache/x")),
            PathBuf::from("/cache/x.part")
        );
    }

    #[test]
    fn test_long_names_are_capped() {
        let long = format!("/clips/{}.mp4", "a".repeat(200));
        assert_eq!(sanitize_name(Path::new(&long)).len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_track_file_names() {
        assert_eq!(CacheLayout::track_file_name(0), "track_0.wav");
        assert_eq!(CacheLayout::track_file_name(12), "track_12.wav");
    }
}
