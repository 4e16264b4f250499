//! Per-book local progress.
//!
//! Each book gets a directory under the cache root named by the SHA-256 of
//! its id, holding a single `progress.json`.

use crate::progress::UnifiedProgress;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_CACHE_DIR: &str = ".cache";
const PROGRESS_FILE: &str = "progress.json";

#[derive(Debug, Clone)]
pub struct ProgressCache {
    root: PathBuf,
}

impl Default for ProgressCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_DIR)
    }
}

impl ProgressCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hash_dir(&self, book_id: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(book_id.as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        self.root.join(hash)
    }

    fn progress_path(&self, book_id: &str) -> PathBuf {
        self.hash_dir(book_id).join(PROGRESS_FILE)
    }

    /// Missing or malformed files both mean "no prior progress".
    pub fn load_progress(&self, book_id: &str) -> Option<UnifiedProgress> {
        let path = self.progress_path(book_id);
        let data = fs::read_to_string(&path).ok()?;
        let progress = UnifiedProgress::from_json(&data);
        match &progress {
            Some(p) => debug!(
                book_id,
                chapter = p.chapter_index,
                last_updated = p.last_updated,
                "Loaded cached progress"
            ),
            None => warn!(path = %path.display(), "Ignoring malformed progress file"),
        }
        progress
    }

    pub fn save_progress(&self, book_id: &str, progress: &UnifiedProgress) -> Result<()> {
        let path = self.progress_path(book_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating cache dir {}", parent.display()))?;
        }
        let contents = serde_json::to_vec_pretty(progress).context("serializing progress")?;
        // Atomic replace.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
        debug!(book_id, path = %path.display(), "Saved progress");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    pub(crate) fn temp_cache(label: &str) -> ProgressCache {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir().join(format!(
            "readalong-cache-{label}-{}-{nonce}",
            std::process::id()
        ));
        ProgressCache::new(dir)
    }

    #[test]
    fn save_then_load_restores_record() {
        let cache = temp_cache("roundtrip");
        let progress = UnifiedProgress {
            chapter_index: 2,
            element_id: Some("p12".into()),
            audio_timestamp_ms: 42_000,
            last_updated: 1_700_000_000_000,
            total_chapters: 9,
            ..UnifiedProgress::default()
        };
        cache.save_progress("moby-dick", &progress).expect("save");
        assert_eq!(cache.load_progress("moby-dick"), Some(progress));
        assert_eq!(cache.load_progress("other-book"), None);
        let _ = fs::remove_dir_all(cache.root());
    }

    #[test]
    fn malformed_file_means_no_progress() {
        let cache = temp_cache("malformed");
        let dir = cache.hash_dir("broken");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join(PROGRESS_FILE), "{\"chapterIndex\": ").expect("write");
        assert_eq!(cache.load_progress("broken"), None);
        let _ = fs::remove_dir_all(cache.root());
    }

    #[test]
    fn partial_record_fills_defaults() {
        let cache = temp_cache("partial");
        let dir = cache.hash_dir("partial");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join(PROGRESS_FILE), r#"{"chapterIndex": 3, "lastUpdated": 1700000000}"#)
            .expect("write");
        let loaded = cache.load_progress("partial").expect("partial record loads");
        assert_eq!(loaded.chapter_index, 3);
        assert_eq!(loaded.last_updated, 1_700_000_000_000);
        assert_eq!(loaded.audio_timestamp_ms, 0);
        assert_eq!(loaded.element_id, None);
        let _ = fs::remove_dir_all(cache.root());
    }

    #[test]
    fn hash_dir_is_stable_per_book() {
        let cache = ProgressCache::new("/tmp/x");
        assert_eq!(cache.hash_dir("a"), cache.hash_dir("a"));
        assert_ne!(cache.hash_dir("a"), cache.hash_dir("b"));
    }
}
