//! Bidirectional lookups between timeline instants, text elements and
//! playable clips.

use crate::timeline::{Chapter, Section, Timeline};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElementLocation {
    pub chapter_index: usize,
    pub element_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClipPosition {
    pub clip_index: usize,
    pub offset_in_clip_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PositionMapper {
    timeline: Arc<Timeline>,
}

impl PositionMapper {
    pub fn new(timeline: Arc<Timeline>) -> Self {
        Self { timeline }
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn shared_timeline(&self) -> Arc<Timeline> {
        Arc::clone(&self.timeline)
    }

    /// Last chapter whose start is at or before `time_ms`.
    pub fn chapter_at(&self, time_ms: u64) -> Option<usize> {
        last_starting_at_or_before(&self.timeline.chapters, time_ms, |c: &Chapter| {
            c.start_offset_ms
        })
    }

    pub fn time_to_element(&self, time_ms: u64) -> Option<ElementLocation> {
        let time_ms = time_ms.min(self.timeline.total_duration_ms);
        let chapter_index = self.chapter_at(time_ms)?;
        let element_id = self.section_at(time_ms).and_then(|section| {
            let relative = time_ms.saturating_sub(section.start_offset_ms);
            let mut elapsed = 0u64;
            for span in &section.elements {
                elapsed = elapsed.max(span.start_ms);
                if relative >= elapsed && relative < elapsed + span.duration_ms {
                    return Some(span.element_id.clone());
                }
                elapsed += span.duration_ms;
            }
            section.elements.last().map(|span| span.element_id.clone())
        });
        Some(ElementLocation {
            chapter_index,
            element_id,
        })
    }

    pub fn element_to_time(&self, chapter_index: usize, element_id: &str) -> Option<u64> {
        if self.timeline.sections_align_with_chapters() {
            let section = self.timeline.sections.get(chapter_index)?;
            return section
                .elements
                .iter()
                .find(|span| span.element_id == element_id)
                .map(|span| section.start_offset_ms + span.start_ms);
        }

        let chapter = self.timeline.chapters.get(chapter_index)?;
        self.timeline
            .sections
            .iter()
            .flat_map(|section| {
                section
                    .elements
                    .iter()
                    .filter(|span| span.element_id == element_id)
                    .map(move |span| section.start_offset_ms + span.start_ms)
            })
            .find(|time| {
                *time >= chapter.start_offset_ms
                    && (*time < chapter.end_ms() || chapter.duration_ms == 0)
            })
    }

    /// Locate the clip containing `time_ms`. Requests past the end clamp to
    /// the last clip's end boundary.
    pub fn seek(&self, time_ms: u64) -> Option<ClipPosition> {
        let clips = &self.timeline.clips;
        let last = clips.last()?;
        if time_ms >= self.timeline.total_duration_ms {
            return Some(ClipPosition {
                clip_index: clips.len() - 1,
                offset_in_clip_ms: last.duration_ms(),
            });
        }
        let clip_index = clips
            .partition_point(|clip| clip.cumulative_start_ms <= time_ms)
            .saturating_sub(1);
        let clip = &clips[clip_index];
        Some(ClipPosition {
            clip_index,
            offset_in_clip_ms: time_ms.saturating_sub(clip.cumulative_start_ms),
        })
    }

    pub fn clip_to_time(&self, clip_index: usize, offset_in_clip_ms: u64) -> Option<u64> {
        let clip = self.timeline.clips.get(clip_index)?;
        Some(clip.cumulative_start_ms + offset_in_clip_ms.min(clip.duration_ms()))
    }

    /// Fraction of `chapter_index` covered at `time_ms`, clamped to `[0, 1]`.
    pub fn chapter_fraction(&self, chapter_index: usize, time_ms: u64) -> Option<f64> {
        let chapter = self.timeline.chapters.get(chapter_index)?;
        if chapter.duration_ms == 0 {
            return None;
        }
        let into = time_ms.saturating_sub(chapter.start_offset_ms) as f64;
        Some((into / chapter.duration_ms as f64).clamp(0.0, 1.0))
    }

    fn section_at(&self, time_ms: u64) -> Option<&Section> {
        let idx = last_starting_at_or_before(&self.timeline.sections, time_ms, |s: &Section| {
            s.start_offset_ms
        })?;
        self.timeline.sections.get(idx)
    }
}

fn last_starting_at_or_before<T>(items: &[T], time_ms: u64, start: impl Fn(&T) -> u64) -> Option<usize> {
    if items.is_empty() {
        return None;
    }
    Some(
        items
            .partition_point(|item| start(item) <= time_ms)
            .saturating_sub(1),
    )
}
