//! Global playback timeline.
//!
//! Per-chapter sync segments are stitched into as few playable clips as
//! possible while sub-segments keep element-level seek granularity. Clips tile
//! `[0, total_duration_ms)` with no gaps: silence between unstitched segments is
//! dropped, silence inside a stitched clip is attributed to the preceding
//! element.

use crate::audio_sources::AudioCatalog;
use crate::sync_document::SyncSegment;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const DEFAULT_STITCH_EPSILON_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubSegment {
    pub element_id: String,
    pub relative_start_ms: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClipSegment {
    pub audio_source_id: String,
    pub clip_begin_ms: u64,
    pub clip_end_ms: u64,
    pub cumulative_start_ms: u64,
    pub chapter_index: usize,
    pub sub_segments: Vec<SubSegment>,
}

impl ClipSegment {
    pub fn duration_ms(&self) -> u64 {
        self.clip_end_ms.saturating_sub(self.clip_begin_ms)
    }

    pub fn end_ms(&self) -> u64 {
        self.cumulative_start_ms + self.duration_ms()
    }

    pub fn contains(&self, time_ms: u64) -> bool {
        time_ms >= self.cumulative_start_ms && time_ms < self.end_ms()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chapter {
    pub index: usize,
    pub title: String,
    pub start_offset_ms: u64,
    pub duration_ms: u64,
}

impl Chapter {
    pub fn end_ms(&self) -> u64 {
        self.start_offset_ms + self.duration_ms
    }
}

/// An element's position inside its section, relative to the section start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElementSpan {
    pub element_id: String,
    pub start_ms: u64,
    pub duration_ms: u64,
}

/// Narration-derived element table for one spine chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Section {
    pub index: usize,
    pub href: String,
    pub start_offset_ms: u64,
    pub duration_ms: u64,
    pub elements: Vec<ElementSpan>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterSource {
    Narration,
    Manifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Timeline {
    pub clips: Vec<ClipSegment>,
    pub chapters: Vec<Chapter>,
    pub sections: Vec<Section>,
    pub total_duration_ms: u64,
    pub chapter_source: ChapterSource,
}

impl Timeline {
    pub fn empty() -> Self {
        Self {
            clips: Vec::new(),
            chapters: Vec::new(),
            sections: Vec::new(),
            total_duration_ms: 0,
            chapter_source: ChapterSource::Narration,
        }
    }

    pub fn has_audio(&self) -> bool {
        !self.clips.is_empty()
    }

    pub fn chapter(&self, index: usize) -> Option<&Chapter> {
        self.chapters.get(index)
    }

    /// Sections line up one-to-one with chapters unless a manifest won.
    pub fn sections_align_with_chapters(&self) -> bool {
        self.chapter_source == ChapterSource::Narration
    }
}

/// One spine chapter handed to the builder.
#[derive(Debug, Clone, Default)]
pub struct ChapterInput {
    pub href: String,
    pub title: Option<String>,
    pub segments: Vec<SyncSegment>,
}

/// Authored chapter boundary, independent of narration segmentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub title: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// Source of chapter boundaries. Providers are consulted in priority order
/// and the first one that yields a list wins.
pub trait ChapterProvider {
    fn source(&self) -> ChapterSource;
    fn chapters(&self, total_duration_ms: u64) -> Option<Vec<Chapter>>;
}

pub struct NarrationChapters {
    chapters: Vec<Chapter>,
}

impl NarrationChapters {
    pub fn new(chapters: Vec<Chapter>) -> Self {
        Self { chapters }
    }
}

impl ChapterProvider for NarrationChapters {
    fn source(&self) -> ChapterSource {
        ChapterSource::Narration
    }

    fn chapters(&self, _total_duration_ms: u64) -> Option<Vec<Chapter>> {
        Some(self.chapters.clone())
    }
}

pub struct ManifestChapters {
    entries: Vec<ManifestEntry>,
}

impl ManifestChapters {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }
}

impl ChapterProvider for ManifestChapters {
    fn source(&self) -> ChapterSource {
        ChapterSource::Manifest
    }

    fn chapters(&self, total_duration_ms: u64) -> Option<Vec<Chapter>> {
        if self.entries.is_empty() {
            return None;
        }
        let mut entries = self.entries.clone();
        entries.sort_by_key(|entry| entry.start_ms);
        let chapters = entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                let start = entry.start_ms.min(total_duration_ms);
                let end = entry.end_ms.clamp(start, total_duration_ms);
                Chapter {
                    index,
                    title: non_blank_title(Some(entry.title), index),
                    start_offset_ms: start,
                    duration_ms: end - start,
                }
            })
            .collect();
        Some(chapters)
    }
}

pub struct TimelineBuilder {
    stitch_epsilon_ms: u64,
    manifest: Option<Vec<ManifestEntry>>,
}

impl Default for TimelineBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_STITCH_EPSILON_MS)
    }
}

impl TimelineBuilder {
    pub fn new(stitch_epsilon_ms: u64) -> Self {
        Self {
            stitch_epsilon_ms,
            manifest: None,
        }
    }

    pub fn with_manifest(mut self, entries: Option<Vec<ManifestEntry>>) -> Self {
        self.manifest = entries;
        self
    }

    pub fn build(&self, inputs: &[ChapterInput], catalog: &AudioCatalog) -> Timeline {
        let mut clips: Vec<ClipSegment> = Vec::new();
        let mut narration = Vec::with_capacity(inputs.len());
        let mut sections = Vec::with_capacity(inputs.len());
        let mut running = 0u64;

        for (chapter_index, input) in inputs.iter().enumerate() {
            let chapter_start = running;
            let first_clip = clips.len();
            let mut open: Option<OpenClip> = None;

            for segment in &input.segments {
                if catalog.get(&segment.audio_source_id).is_none() {
                    warn!(
                        chapter = chapter_index,
                        element = %segment.element_id,
                        source = %segment.audio_source_id,
                        "Segment references an unknown audio source; skipping"
                    );
                    continue;
                }
                match open.as_mut() {
                    Some(clip) if clip.accepts(segment, self.stitch_epsilon_ms) => {
                        clip.extend(segment)
                    }
                    _ => {
                        if let Some(done) = open.take() {
                            done.finish(chapter_index, &mut running, &mut clips);
                        }
                        open = Some(OpenClip::start(segment));
                    }
                }
            }
            if let Some(done) = open.take() {
                done.finish(chapter_index, &mut running, &mut clips);
            }

            let elements = clips[first_clip..]
                .iter()
                .flat_map(|clip| {
                    let clip_offset = clip.cumulative_start_ms - chapter_start;
                    clip.sub_segments.iter().map(move |sub| ElementSpan {
                        element_id: sub.element_id.clone(),
                        start_ms: clip_offset + sub.relative_start_ms,
                        duration_ms: sub.duration_ms,
                    })
                })
                .collect::<Vec<_>>();

            debug!(
                chapter = chapter_index,
                href = %input.href,
                clips = clips.len() - first_clip,
                elements = elements.len(),
                start_offset_ms = chapter_start,
                duration_ms = running - chapter_start,
                "Placed chapter on timeline"
            );

            narration.push(Chapter {
                index: chapter_index,
                title: non_blank_title(input.title.clone(), chapter_index),
                start_offset_ms: chapter_start,
                duration_ms: running - chapter_start,
            });
            sections.push(Section {
                index: chapter_index,
                href: input.href.clone(),
                start_offset_ms: chapter_start,
                duration_ms: running - chapter_start,
                elements,
            });
        }

        let narration = NarrationChapters::new(narration);
        let manifest = self.manifest.clone().map(ManifestChapters::new);
        let mut providers: Vec<&dyn ChapterProvider> = Vec::with_capacity(2);
        if let Some(manifest) = manifest.as_ref() {
            providers.push(manifest);
        }
        providers.push(&narration);

        let (chapters, chapter_source) = providers
            .iter()
            .find_map(|provider| {
                provider
                    .chapters(running)
                    .map(|chapters| (chapters, provider.source()))
            })
            .unwrap_or_else(|| (Vec::new(), ChapterSource::Narration));

        info!(
            chapters = chapters.len(),
            clips = clips.len(),
            total_duration_ms = running,
            chapter_source = ?chapter_source,
            "Built playback timeline"
        );

        Timeline {
            clips,
            chapters,
            sections,
            total_duration_ms: running,
            chapter_source,
        }
    }
}

struct OpenClip {
    audio_source_id: String,
    clip_begin_ms: u64,
    clip_end_ms: u64,
    last_begin_ms: u64,
    starts: Vec<(String, u64)>,
}

impl OpenClip {
    fn start(segment: &SyncSegment) -> Self {
        Self {
            audio_source_id: segment.audio_source_id.clone(),
            clip_begin_ms: segment.clip_begin_ms,
            clip_end_ms: segment.clip_end_ms,
            last_begin_ms: segment.clip_begin_ms,
            starts: vec![(segment.element_id.clone(), segment.clip_begin_ms)],
        }
    }

    fn accepts(&self, segment: &SyncSegment, epsilon_ms: u64) -> bool {
        segment.audio_source_id == self.audio_source_id
            && segment.clip_begin_ms >= self.last_begin_ms
            && segment.clip_begin_ms.abs_diff(self.clip_end_ms) <= epsilon_ms
    }

    fn extend(&mut self, segment: &SyncSegment) {
        self.starts
            .push((segment.element_id.clone(), segment.clip_begin_ms));
        self.last_begin_ms = segment.clip_begin_ms;
        self.clip_end_ms = self.clip_end_ms.max(segment.clip_end_ms);
    }

    fn finish(self, chapter_index: usize, running: &mut u64, clips: &mut Vec<ClipSegment>) {
        let duration = self.clip_end_ms.saturating_sub(self.clip_begin_ms);
        if duration == 0 {
            debug!(
                chapter = chapter_index,
                source = %self.audio_source_id,
                "Dropping zero-length clip"
            );
            return;
        }

        let relative: Vec<u64> = self
            .starts
            .iter()
            .map(|(_, begin)| begin - self.clip_begin_ms)
            .collect();
        let sub_segments = self
            .starts
            .into_iter()
            .enumerate()
            .map(|(idx, (element_id, _))| {
                let start = relative[idx];
                let next = relative.get(idx + 1).copied().unwrap_or(duration);
                SubSegment {
                    element_id,
                    relative_start_ms: start,
                    duration_ms: next - start,
                }
            })
            .collect();

        clips.push(ClipSegment {
            audio_source_id: self.audio_source_id,
            clip_begin_ms: self.clip_begin_ms,
            clip_end_ms: self.clip_end_ms,
            cumulative_start_ms: *running,
            chapter_index,
            sub_segments,
        });
        *running += duration;
    }
}

fn non_blank_title(title: Option<String>, index: usize) -> String {
    title
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| format!("Chapter {}", index + 1))
}
