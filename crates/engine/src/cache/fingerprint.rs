//! Change-sensitive source fingerprints
//!
//! A fingerprint is blake3 over the source path, size and modification time,
//! truncated to [`FINGERPRINT_HEX_LEN`] hex characters. Renaming a file yields
//! a new fingerprint even when the bytes are unchanged.

use std::fmt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Width of the hex fingerprint used in cache file names
pub const FINGERPRINT_HEX_LEN: usize = 16;

/// Truncated hex digest identifying one version of a source file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_hasher(hasher: &blake3::Hasher) -> Self {
        let hex = hasher.finalize().to_hex();
        Self(hex[..FINGERPRINT_HEX_LEN].to_string())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn path_hasher(path: &Path) -> blake3::Hasher {
    let mut hasher = blake3::Hasher::new();
    hasher.update(path.as_os_str().as_encoded_bytes());
    hasher
}

/// Fingerprint from already-known stat values
pub fn fingerprint_from_parts(path: &Path, size: u64, modified: Option<SystemTime>) -> Fingerprint {
    let mut hasher = path_hasher(path);
    hasher.update(&[0]);
    hasher.update(&size.to_le_bytes());
    let modified_nanos = modified
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    hasher.update(&modified_nanos.to_le_bytes());
    Fingerprint::from_hasher(&hasher)
}

/// Path-only fingerprint used when the source cannot be stat'ed
pub fn fingerprint_path_only(path: &Path) -> Fingerprint {
    Fingerprint::from_hasher(&path_hasher(path))
}

/// Stat the source and fingerprint it, degrading to path-only on failure
pub async fn fingerprint(path: &Path) -> Fingerprint {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => fingerprint_from_parts(path, metadata.len(), metadata.modified().ok()),
        Err(_) => fingerprint_path_only(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;

    fn at(secs: u64) -> Option<SystemTime> {
        Some(UNIX_EPOCH + Duration::from_secs(secs))
    }

    #[test]
    fn test_fingerprint_shape() {
        let fp = fingerprint_from_parts(Path::new("/clips/a.mp4"), 10, at(1_700_000_000));
        assert_eq!(fp.as_str().len(), FINGERPRINT_HEX_LEN);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_path_only_differs_from_stat_based() {
        let path = Path::new("/clips/a.mp4");
        assert_ne!(
            fingerprint_path_only(path),
            fingerprint_from_parts(path, 10, at(5))
        );
    }

    #[tokio::test]
    async fn test_missing_file_falls_back_to_path_only() {
        let path = PathBuf::from("/nonexistent/clipshelf/clip.mp4");
        assert_eq!(fingerprint(&path).await, fingerprint_path_only(&path));
    }

    #[tokio::test]
    async fn test_append_changes_fingerprint() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"frame").unwrap();
        let before = fingerprint(&path).await;

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"more frames").unwrap();
        drop(file);

        assert_ne!(before, fingerprint(&path).await);
    }

    // *For any* source, identical stat values give identical fingerprints and
    // changing size, mtime or path gives a different one.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_fingerprint_sensitivity(
            name in "[a-z0-9_]{1,16}",
            size in 0u64..u64::MAX / 2,
            secs in 0u64..4_000_000_000,
            size_delta in 1u64..1_000_000,
            secs_delta in 1u64..1_000_000,
        ) {
            let path = PathBuf::from(format!("/clips/{}.mp4", name));
            let base = fingerprint_from_parts(&path, size, at(secs));

            prop_assert_eq!(&base, &fingerprint_from_parts(&path, size, at(secs)));
            prop_assert_ne!(&base, &fingerprint_from_parts(&path, size + size_delta, at(secs)));
            prop_assert_ne!(&base, &fingerprint_from_parts(&path, size, at(secs + secs_delta)));

            let renamed = PathBuf::from(format!("/clips/{}_renamed.mp4", name));
            prop_assert_ne!(&base, &fingerprint_from_parts(&renamed, size, at(secs)));
        }
    }
}
