//! Book directory loading.
//!
//! A book is a directory with a `book.toml` container listing chapters, their
//! optional sync documents, the narration files and an optional authored
//! chapter manifest. Loading parses every sync document and builds the
//! timeline once; the result is immutable.

use crate::audio_sources::{AudioCatalog, AudioSource, normalize_path};
use crate::cancellation::{Cancelled, CancellationToken};
use crate::coordinator::BookHandle;
use crate::sync_document::SyncDocumentParser;
use crate::timeline::{ChapterInput, ManifestEntry, Timeline, TimelineBuilder};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CONTAINER_FILE: &str = "book.toml";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("book container not found at {0}")]
    MissingContainer(PathBuf),

    #[error("invalid book container {path}: {message}")]
    InvalidContainer { path: PathBuf, message: String },

    #[error("book lists no chapters")]
    NoChapters,

    #[error("book load {0}")]
    Cancelled(#[from] Cancelled),
}

#[derive(Debug, Deserialize)]
struct Container {
    id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    chapters: Vec<ChapterEntry>,
    #[serde(default)]
    audio: Vec<AudioEntry>,
    #[serde(default)]
    manifest: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ChapterEntry {
    href: String,
    title: Option<String>,
    sync: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AudioEntry {
    path: String,
    duration_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LoadedBook {
    pub id: String,
    pub title: String,
    pub root: PathBuf,
    pub audio: AudioCatalog,
    pub timeline: Arc<Timeline>,
}

impl LoadedBook {
    pub fn handle(&self) -> BookHandle {
        BookHandle {
            id: self.id.clone(),
            title: self.title.clone(),
            timeline: Arc::clone(&self.timeline),
        }
    }
}

pub fn load_book(root: &Path, stitch_epsilon_ms: u64) -> Result<LoadedBook, LoadError> {
    load_book_with_cancel(root, stitch_epsilon_ms, None)
}

pub fn load_book_with_cancel(
    root: &Path,
    stitch_epsilon_ms: u64,
    cancel: Option<&CancellationToken>,
) -> Result<LoadedBook, LoadError> {
    let check = |stage: &'static str| cancel.map_or(Ok(()), |token| token.checkpoint(stage));

    let container_path = root.join(CONTAINER_FILE);
    let raw = fs::read_to_string(&container_path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => LoadError::MissingContainer(container_path.clone()),
        _ => LoadError::InvalidContainer {
            path: container_path.clone(),
            message: err.to_string(),
        },
    })?;
    let container: Container = toml::from_str(&raw).map_err(|err| LoadError::InvalidContainer {
        path: container_path.clone(),
        message: err.to_string(),
    })?;
    if container.chapters.is_empty() {
        return Err(LoadError::NoChapters);
    }

    let id = container
        .id
        .filter(|id| !id.trim().is_empty())
        .or_else(|| {
            root.file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "book".to_string());
    let title = container
        .title
        .filter(|title| !title.trim().is_empty())
        .unwrap_or_else(|| id.clone());
    info!(path = %root.display(), %id, chapters = container.chapters.len(), "Loading book");

    let audio = AudioCatalog::new(
        container
            .audio
            .iter()
            .map(|entry| AudioSource::from_path(&entry.path, entry.duration_ms))
            .collect(),
    );
    let parser = SyncDocumentParser::new(&audio);

    let mut inputs = Vec::with_capacity(container.chapters.len());
    for (index, chapter) in container.chapters.into_iter().enumerate() {
        check("chapters")?;
        let segments = match chapter.sync.as_deref() {
            Some(sync) => {
                let document_path = normalize_path(sync);
                match fs::read_to_string(root.join(&document_path)) {
                    Ok(markup) => parser.parse(&markup, &document_path),
                    Err(err) => {
                        warn!(
                            chapter = index,
                            document = %document_path,
                            "Unreadable sync document; chapter will be silent: {err}"
                        );
                        Vec::new()
                    }
                }
            }
            None => {
                debug!(chapter = index, href = %chapter.href, "Chapter has no sync document");
                Vec::new()
            }
        };
        inputs.push(ChapterInput {
            href: normalize_path(&chapter.href),
            title: chapter.title,
            segments,
        });
    }

    check("timeline")?;
    let manifest = Some(container.manifest).filter(|entries| !entries.is_empty());
    let timeline = TimelineBuilder::new(stitch_epsilon_ms)
        .with_manifest(manifest)
        .build(&inputs, &audio);

    info!(
        %id,
        total_duration_ms = timeline.total_duration_ms,
        clips = timeline.clips.len(),
        "Finished loading book"
    );
    Ok(LoadedBook {
        id,
        title,
        root: root.to_path_buf(),
        audio,
        timeline: Arc::new(timeline),
    })
}
