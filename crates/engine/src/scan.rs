//! Scanner module for discovering video clips in a folder.
//!
//! Recursively walks a folder for video files, filtering by extension and
//! skipping hidden directories. The same extension check drives the folder
//! watcher.

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use walkdir::WalkDir;

/// Video file extensions recognized by the scanner (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "m4v", "mkv", "avi", "webm", "wmv", "flv", "ts", "m2ts", "mts", "3gp",
];

/// Error type for folder scans
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A video file discovered during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoEntry {
    /// File name including extension.
    pub name: String,
    pub path: PathBuf,
    /// File size in bytes at scan time.
    pub size: u64,
    /// Creation time in unix milliseconds (0 when the platform does not record it).
    pub created: u64,
    /// Last modified time in unix milliseconds.
    pub modified: u64,
    /// Path relative to the scanned folder.
    pub relative_path: PathBuf,
    /// Directory containing the file.
    pub folder_path: PathBuf,
}

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = ext.to_lowercase();
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

fn unix_millis(time: io::Result<SystemTime>) -> u64 {
    time.ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Walk `root` for video files without following hidden directories.
///
/// The root itself may be hidden. Entries that vanish or cannot be stat'ed
/// mid-walk are skipped.
pub(crate) fn walk_videos(root: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| {
            let hidden = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with('.'))
                .unwrap_or(false);
            !(entry.file_type().is_dir() && hidden && entry.depth() > 0)
        })
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file() && is_video_file(entry.path()))
}

/// Scans `folder` recursively for video files, sorted by path.
pub fn scan_videos(folder: &Path) -> Result<Vec<VideoEntry>, ScanError> {
    let metadata = std::fs::metadata(folder).map_err(|source| ScanError::Io {
        path: folder.to_path_buf(),
        source,
    })?;
    if !metadata.is_dir() {
        return Err(ScanError::NotADirectory(folder.to_path_buf()));
    }

    let mut entries: Vec<VideoEntry> = walk_videos(folder)
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            let path = entry.path().to_path_buf();
            Some(VideoEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
                created: unix_millis(metadata.created()),
                modified: unix_millis(metadata.modified()),
                relative_path: path.strip_prefix(folder).unwrap_or(&path).to_path_buf(),
                folder_path: path.parent().map(Path::to_path_buf).unwrap_or_default(),
                path,
            })
        })
        .collect();

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}
