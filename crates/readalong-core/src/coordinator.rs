//! Single owner of the live reading/listening position.
//!
//! Every input (engine callbacks, user navigation, remote fetch results) is a
//! [`CoordinatorCommand`]. Applying one yields a [`CoordinatorEvent`] carrying
//! a fresh [`PlaybackSnapshot`] and the directives the audio engine must
//! follow. The coordinator never blocks on the network; persistence goes
//! through a [`ProgressSink`] whose local write is the only synchronous step.

use crate::position::{ClipPosition, PositionMapper};
use crate::progress::{
    ConflictChoice, ConflictDecision, MergeOutcome, MergePolicy, ProgressReconciler,
    SnapshotGate, SnapshotPolicy, SnapshotTrigger, UnifiedProgress,
};
use crate::sleep_timer::{SleepTimer, SleepTimerState, TimerContext};
use crate::sync::ProgressSink;
use crate::timeline::Timeline;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use ts_rs::TS;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ReadingMode {
    Text,
    Audio,
}

impl ReadingMode {
    fn media_type(self) -> &'static str {
        match self {
            ReadingMode::Text => "application/xhtml+xml",
            ReadingMode::Audio => "application/smil+xml",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[ts(export)]
pub enum EngineDirective {
    SeekTo {
        #[serde(rename = "clipIndex")]
        #[ts(type = "number")]
        clip_index: usize,
        #[serde(rename = "offsetInClipMs")]
        #[ts(type = "number")]
        offset_in_clip_ms: u64,
    },
    Play,
    Pause,
    Stop,
}

impl From<ClipPosition> for EngineDirective {
    fn from(position: ClipPosition) -> Self {
        EngineDirective::SeekTo {
            clip_index: position.clip_index,
            offset_in_clip_ms: position.offset_in_clip_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ChapterView {
    pub title: String,
    #[ts(type = "number")]
    pub start_offset_ms: u64,
    #[ts(type = "number")]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct PlaybackSnapshot {
    pub book_id: String,
    pub title: String,
    pub chapters: Vec<ChapterView>,
    pub current_element_id: Option<String>,
    #[ts(type = "number")]
    pub current_chapter_index: usize,
    #[ts(type = "number")]
    pub total_duration_ms: u64,
    #[ts(type = "number")]
    pub current_time_ms: u64,
    pub state: PlaybackState,
    pub mode: ReadingMode,
    pub scroll_percent: f64,
    pub overall_progress: f64,
    pub sleep_timer: SleepTimerState,
    pub pending_conflict: Option<ConflictDecision>,
    #[ts(type = "number | null")]
    pub previous_spot_time_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum CoordinatorCommand {
    GetSnapshot,
    Play,
    Pause,
    Tick {
        clip_index: usize,
        offset_in_clip_ms: u64,
        elapsed_ms: u64,
    },
    Seek {
        time_ms: u64,
    },
    SkipForward,
    SkipBack,
    JumpToChapter {
        chapter_index: usize,
    },
    JumpToElement {
        chapter_index: usize,
        element_id: String,
    },
    ClipStarted {
        clip_index: usize,
    },
    ScrollTo {
        chapter_index: usize,
        scroll_percent: f64,
        element_id: Option<String>,
    },
    SetMode {
        mode: ReadingMode,
    },
    SetSleepTimer {
        duration_ms: u64,
        finish_chapter: bool,
    },
    CancelSleepTimer,
    ReturnToPreviousSpot,
    RemotePositionFetched {
        progress: UnifiedProgress,
    },
    ResolveConflict {
        choice: ConflictChoice,
    },
    PlaybackFailed {
        reason: String,
    },
    Close,
}

impl CoordinatorCommand {
    pub fn action(&self) -> &'static str {
        match self {
            Self::GetSnapshot => "playback_get_snapshot",
            Self::Play => "playback_play",
            Self::Pause => "playback_pause",
            Self::Tick { .. } => "playback_tick",
            Self::Seek { .. } => "playback_seek",
            Self::SkipForward => "playback_skip_forward",
            Self::SkipBack => "playback_skip_back",
            Self::JumpToChapter { .. } => "playback_jump_to_chapter",
            Self::JumpToElement { .. } => "playback_jump_to_element",
            Self::ClipStarted { .. } => "playback_clip_started",
            Self::ScrollTo { .. } => "reader_scroll_to",
            Self::SetMode { .. } => "reader_set_mode",
            Self::SetSleepTimer { .. } => "sleep_timer_set",
            Self::CancelSleepTimer => "sleep_timer_cancel",
            Self::ReturnToPreviousSpot => "playback_return_to_previous_spot",
            Self::RemotePositionFetched { .. } => "sync_remote_position_fetched",
            Self::ResolveConflict { .. } => "sync_resolve_conflict",
            Self::PlaybackFailed { .. } => "playback_failed",
            Self::Close => "book_close",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorEvent {
    pub action: &'static str,
    pub snapshot: PlaybackSnapshot,
    pub directives: Vec<EngineDirective>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinatorSettings {
    pub skip_interval_ms: u64,
    pub end_of_book_margin_ms: u64,
    pub retry: RetryPolicy,
    pub merge: MergePolicy,
    pub snapshots: SnapshotPolicy,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            skip_interval_ms: 30_000,
            end_of_book_margin_ms: 1_500,
            retry: RetryPolicy::default(),
            merge: MergePolicy::default(),
            snapshots: SnapshotPolicy::default(),
        }
    }
}

/// Book identity handed to the coordinator.
#[derive(Debug, Clone)]
pub struct BookHandle {
    pub id: String,
    pub title: String,
    pub timeline: Arc<Timeline>,
}

pub struct PlaybackCoordinator {
    book_id: String,
    title: String,
    mapper: PositionMapper,
    reconciler: ProgressReconciler,
    gate: SnapshotGate,
    sink: Box<dyn ProgressSink>,
    settings: CoordinatorSettings,
    sleep_timer: SleepTimer,
    state: PlaybackState,
    mode: ReadingMode,
    current_time_ms: u64,
    chapter_index: usize,
    element_id: Option<String>,
    scroll_percent: f64,
    /// `current_time_ms` came from narration rather than a chapter start.
    narrated: bool,
    /// A local position exists (restored or produced by this session).
    established: bool,
    last_changed_ms: u64,
    previous_spot: Option<UnifiedProgress>,
    pending_conflict: Option<ConflictDecision>,
    failed_attempts: u32,
}

impl PlaybackCoordinator {
    pub fn new(book: BookHandle, settings: CoordinatorSettings, sink: Box<dyn ProgressSink>) -> Self {
        let mapper = PositionMapper::new(book.timeline);
        let mode = if mapper.timeline().has_audio() {
            ReadingMode::Audio
        } else {
            ReadingMode::Text
        };
        Self {
            book_id: book.id,
            title: book.title,
            reconciler: ProgressReconciler::new(Some(mapper.clone()), settings.merge),
            mapper,
            gate: SnapshotGate::new(settings.snapshots),
            sink,
            settings,
            sleep_timer: SleepTimer::new(settings.end_of_book_margin_ms),
            state: PlaybackState::Idle,
            mode,
            current_time_ms: 0,
            chapter_index: 0,
            element_id: None,
            scroll_percent: 0.0,
            narrated: false,
            established: false,
            last_changed_ms: 0,
            previous_spot: None,
            pending_conflict: None,
            failed_attempts: 0,
        }
    }

    pub fn book_id(&self) -> &str {
        &self.book_id
    }

    /// Adopt a persisted position without writing it back.
    pub fn restore(&mut self, progress: &UnifiedProgress) {
        let progress = progress.normalized();
        self.apply_progress(&progress);
        self.established = true;
        self.last_changed_ms = progress.last_updated;
        info!(
            book_id = %self.book_id,
            chapter = self.chapter_index,
            time_ms = self.current_time_ms,
            "Restored reading position"
        );
    }

    pub fn current_progress(&self) -> UnifiedProgress {
        let timeline = self.mapper.timeline();
        UnifiedProgress {
            chapter_index: self.chapter_index,
            element_id: self.element_id.clone(),
            audio_timestamp_ms: if timeline.has_audio() && self.narrated {
                self.current_time_ms
            } else {
                0
            },
            scroll_percent: self.scroll_percent,
            last_updated: self.last_changed_ms,
            total_chapters: timeline.chapters.len(),
            total_duration_ms: timeline.total_duration_ms,
            href: timeline
                .sections
                .get(self.chapter_index)
                .map(|section| section.href.clone()),
            media_type: Some(self.mode.media_type().to_string()),
        }
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        let timeline = self.mapper.timeline();
        let progress = self.current_progress();
        PlaybackSnapshot {
            book_id: self.book_id.clone(),
            title: self.title.clone(),
            chapters: timeline
                .chapters
                .iter()
                .map(|chapter| ChapterView {
                    title: chapter.title.clone(),
                    start_offset_ms: chapter.start_offset_ms,
                    duration_ms: chapter.duration_ms,
                })
                .collect(),
            current_element_id: self.element_id.clone(),
            current_chapter_index: self.chapter_index,
            total_duration_ms: timeline.total_duration_ms,
            current_time_ms: self.current_time_ms,
            state: self.state,
            mode: self.mode,
            scroll_percent: self.scroll_percent,
            overall_progress: self.reconciler.overall_progress(&progress),
            sleep_timer: self.sleep_timer.state(),
            pending_conflict: self.pending_conflict.clone(),
            previous_spot_time_ms: self
                .previous_spot
                .as_ref()
                .map(|spot| spot.audio_timestamp_ms),
        }
    }

    pub fn apply_command(&mut self, command: CoordinatorCommand, now_ms: u64) -> CoordinatorEvent {
        let action = command.action();
        let directives = match command {
            CoordinatorCommand::GetSnapshot => Vec::new(),
            CoordinatorCommand::Play => self.play(),
            CoordinatorCommand::Pause => self.pause(now_ms),
            CoordinatorCommand::Tick {
                clip_index,
                offset_in_clip_ms,
                elapsed_ms,
            } => self.tick(clip_index, offset_in_clip_ms, elapsed_ms, now_ms),
            CoordinatorCommand::Seek { time_ms } => self.jump_to_time(time_ms, now_ms),
            CoordinatorCommand::SkipForward => {
                let target = self.current_time_ms.saturating_add(self.settings.skip_interval_ms);
                self.jump_to_time(target, now_ms)
            }
            CoordinatorCommand::SkipBack => {
                let target = self.current_time_ms.saturating_sub(self.settings.skip_interval_ms);
                self.jump_to_time(target, now_ms)
            }
            CoordinatorCommand::JumpToChapter { chapter_index } => {
                self.jump_to_chapter(chapter_index, now_ms)
            }
            CoordinatorCommand::JumpToElement {
                chapter_index,
                element_id,
            } => self.jump_to_element(chapter_index, element_id, now_ms),
            CoordinatorCommand::ClipStarted { clip_index } => self.clip_started(clip_index, now_ms),
            CoordinatorCommand::ScrollTo {
                chapter_index,
                scroll_percent,
                element_id,
            } => self.scroll_to(chapter_index, scroll_percent, element_id, now_ms),
            CoordinatorCommand::SetMode { mode } => self.set_mode(mode, now_ms),
            CoordinatorCommand::SetSleepTimer {
                duration_ms,
                finish_chapter,
            } => {
                self.sleep_timer.start(duration_ms, finish_chapter);
                Vec::new()
            }
            CoordinatorCommand::CancelSleepTimer => {
                self.sleep_timer.cancel();
                Vec::new()
            }
            CoordinatorCommand::ReturnToPreviousSpot => self.return_to_previous_spot(now_ms),
            CoordinatorCommand::RemotePositionFetched { progress } => {
                self.remote_position_fetched(&progress, now_ms)
            }
            CoordinatorCommand::ResolveConflict { choice } => self.resolve_conflict(choice, now_ms),
            CoordinatorCommand::PlaybackFailed { reason } => self.playback_failed(&reason, now_ms),
            CoordinatorCommand::Close => self.close(now_ms),
        };
        CoordinatorEvent {
            action,
            snapshot: self.snapshot(),
            directives,
        }
    }

    fn play(&mut self) -> Vec<EngineDirective> {
        if !self.mapper.timeline().has_audio() {
            debug!(book_id = %self.book_id, "Ignoring play for a book without narration");
            return Vec::new();
        }
        if self.current_time_ms >= self.mapper.timeline().total_duration_ms {
            self.current_time_ms = 0;
        }
        self.sleep_timer.on_play();
        self.state = PlaybackState::Playing;
        self.mode = ReadingMode::Audio;
        self.failed_attempts = 0;
        let mut directives = self.seek_directive();
        directives.push(EngineDirective::Play);
        directives
    }

    fn pause(&mut self, now_ms: u64) -> Vec<EngineDirective> {
        if self.state != PlaybackState::Playing {
            return Vec::new();
        }
        self.state = PlaybackState::Paused;
        self.save(SnapshotTrigger::Pause, now_ms);
        vec![EngineDirective::Pause]
    }

    fn tick(
        &mut self,
        clip_index: usize,
        offset_in_clip_ms: u64,
        elapsed_ms: u64,
        now_ms: u64,
    ) -> Vec<EngineDirective> {
        if self.state != PlaybackState::Playing {
            return Vec::new();
        }
        let Some(time_ms) = self.mapper.clip_to_time(clip_index, offset_in_clip_ms) else {
            warn!(clip_index, "Tick for a clip outside the timeline");
            return Vec::new();
        };
        self.failed_attempts = 0;
        let previous_chapter = self.chapter_index;
        self.set_time(time_ms, now_ms);

        if self.sleep_timer.advance(elapsed_ms, true, self.timer_context()) {
            self.state = PlaybackState::Paused;
            self.save(SnapshotTrigger::Pause, now_ms);
            return vec![EngineDirective::Pause];
        }
        if time_ms >= self.mapper.timeline().total_duration_ms {
            info!(book_id = %self.book_id, "Reached end of narration");
            self.state = PlaybackState::Stopped;
            self.save(SnapshotTrigger::Pause, now_ms);
            return vec![EngineDirective::Stop];
        }
        let trigger = if previous_chapter != self.chapter_index {
            SnapshotTrigger::ChapterChange
        } else {
            SnapshotTrigger::Tick
        };
        self.save(trigger, now_ms);
        Vec::new()
    }

    fn clip_started(&mut self, clip_index: usize, now_ms: u64) -> Vec<EngineDirective> {
        let Some(time_ms) = self.mapper.clip_to_time(clip_index, 0) else {
            warn!(clip_index, "Engine started a clip outside the timeline");
            return Vec::new();
        };
        let previous_chapter = self.chapter_index;
        self.set_time(time_ms, now_ms);
        if previous_chapter == self.chapter_index {
            return Vec::new();
        }
        debug!(
            from = previous_chapter,
            to = self.chapter_index,
            "Engine crossed a chapter boundary"
        );
        let playing = self.state == PlaybackState::Playing;
        if self.sleep_timer.advance(0, playing, self.timer_context()) {
            self.state = PlaybackState::Paused;
            self.save(SnapshotTrigger::Pause, now_ms);
            return vec![EngineDirective::Pause];
        }
        self.save(SnapshotTrigger::ChapterChange, now_ms);
        Vec::new()
    }

    fn jump_to_time(&mut self, time_ms: u64, now_ms: u64) -> Vec<EngineDirective> {
        if !self.mapper.timeline().has_audio() {
            debug!("Ignoring time seek for a book without narration");
            return Vec::new();
        }
        self.remember_spot();
        self.set_time(time_ms, now_ms);
        self.save(SnapshotTrigger::Seek, now_ms);
        self.seek_directive()
    }

    fn jump_to_chapter(&mut self, chapter_index: usize, now_ms: u64) -> Vec<EngineDirective> {
        let Some(chapter) = self.mapper.timeline().chapter(chapter_index).cloned() else {
            warn!(chapter_index, "Jump to a chapter that does not exist");
            return Vec::new();
        };
        if self.mapper.timeline().has_audio() && chapter.duration_ms > 0 {
            return self.jump_to_time(chapter.start_offset_ms, now_ms);
        }
        self.remember_spot();
        self.place_in_text(chapter_index, None, 0.0, now_ms);
        self.save(SnapshotTrigger::ChapterChange, now_ms);
        Vec::new()
    }

    fn jump_to_element(
        &mut self,
        chapter_index: usize,
        element_id: String,
        now_ms: u64,
    ) -> Vec<EngineDirective> {
        if let Some(time_ms) = self.mapper.element_to_time(chapter_index, &element_id) {
            return self.jump_to_time(time_ms, now_ms);
        }
        if chapter_index >= self.chapter_count() {
            warn!(chapter_index, element = %element_id, "Jump to an element outside the book");
            return Vec::new();
        }
        self.remember_spot();
        self.place_in_text(chapter_index, Some(element_id), 0.0, now_ms);
        self.save(SnapshotTrigger::Seek, now_ms);
        Vec::new()
    }

    fn scroll_to(
        &mut self,
        chapter_index: usize,
        scroll_percent: f64,
        element_id: Option<String>,
        now_ms: u64,
    ) -> Vec<EngineDirective> {
        if chapter_index >= self.chapter_count() {
            warn!(chapter_index, "Scroll position outside the book");
            return Vec::new();
        }
        let previous_chapter = self.chapter_index;
        let scroll_percent = if scroll_percent.is_nan() {
            0.0
        } else {
            scroll_percent.clamp(0.0, 1.0)
        };
        self.place_in_text(chapter_index, element_id, scroll_percent, now_ms);
        let trigger = if previous_chapter != chapter_index {
            SnapshotTrigger::ChapterChange
        } else {
            SnapshotTrigger::Tick
        };
        self.save(trigger, now_ms);
        Vec::new()
    }

    fn set_mode(&mut self, mode: ReadingMode, now_ms: u64) -> Vec<EngineDirective> {
        if mode == self.mode {
            return Vec::new();
        }
        info!(from = ?self.mode, to = ?mode, "Switching reading mode");
        self.mode = mode;
        let mut directives = Vec::new();
        if mode == ReadingMode::Text && self.state == PlaybackState::Playing {
            self.state = PlaybackState::Paused;
            directives.push(EngineDirective::Pause);
        }
        self.save(SnapshotTrigger::Pause, now_ms);
        directives
    }

    fn return_to_previous_spot(&mut self, now_ms: u64) -> Vec<EngineDirective> {
        let Some(spot) = self.previous_spot.take() else {
            debug!("No previous spot to return to");
            return Vec::new();
        };
        self.previous_spot = Some(self.current_progress());
        self.apply_progress(&spot);
        self.last_changed_ms = now_ms;
        self.save(SnapshotTrigger::Seek, now_ms);
        self.seek_directive()
    }

    fn remote_position_fetched(
        &mut self,
        remote: &UnifiedProgress,
        now_ms: u64,
    ) -> Vec<EngineDirective> {
        if !self.established {
            info!(book_id = %self.book_id, "No local position; adopting remote");
            return self.adopt(&remote.normalized(), now_ms);
        }
        let local = self.current_progress();
        match self.reconciler.merge(&local, remote) {
            MergeOutcome::KeepLocal { reason, .. } => {
                debug!(?reason, "Keeping local position");
                Vec::new()
            }
            MergeOutcome::AdoptRemote(progress) => self.adopt(&progress, now_ms),
            MergeOutcome::Conflict(decision) => {
                self.pending_conflict = Some(decision);
                Vec::new()
            }
        }
    }

    fn resolve_conflict(&mut self, choice: ConflictChoice, now_ms: u64) -> Vec<EngineDirective> {
        let Some(decision) = self.pending_conflict.take() else {
            debug!("No pending conflict to resolve");
            return Vec::new();
        };
        let chosen = self.reconciler.resolve(&decision, choice, now_ms);
        self.adopt(&chosen, now_ms)
    }

    fn adopt(&mut self, progress: &UnifiedProgress, now_ms: u64) -> Vec<EngineDirective> {
        self.apply_progress(progress);
        self.last_changed_ms = progress.last_updated;
        self.save(SnapshotTrigger::Seek, now_ms);
        self.seek_directive()
    }

    fn playback_failed(&mut self, reason: &str, now_ms: u64) -> Vec<EngineDirective> {
        self.failed_attempts += 1;
        if self.failed_attempts <= self.settings.retry.max_attempts {
            warn!(
                attempt = self.failed_attempts,
                max = self.settings.retry.max_attempts,
                "Playback failed ({reason}); retrying current clip"
            );
            let mut directives = self.seek_directive();
            directives.push(EngineDirective::Play);
            return directives;
        }
        error!(attempts = self.failed_attempts, "Playback failed ({reason}); giving up");
        self.state = PlaybackState::Stopped;
        self.save(SnapshotTrigger::Pause, now_ms);
        vec![EngineDirective::Stop]
    }

    fn close(&mut self, now_ms: u64) -> Vec<EngineDirective> {
        let mut directives = Vec::new();
        if self.state == PlaybackState::Playing {
            self.state = PlaybackState::Paused;
            directives.push(EngineDirective::Pause);
        }
        self.save(SnapshotTrigger::Close, now_ms);
        self.sink.flush();
        directives
    }

    fn chapter_count(&self) -> usize {
        self.mapper.timeline().chapters.len()
    }

    fn timer_context(&self) -> TimerContext {
        TimerContext {
            chapter_index: self.chapter_index,
            remaining_in_book_ms: self
                .mapper
                .timeline()
                .total_duration_ms
                .saturating_sub(self.current_time_ms),
        }
    }

    fn remember_spot(&mut self) {
        self.previous_spot = Some(self.current_progress());
    }

    fn seek_directive(&self) -> Vec<EngineDirective> {
        self.mapper
            .seek(self.current_time_ms)
            .map(EngineDirective::from)
            .into_iter()
            .collect()
    }

    /// Move to a timeline instant and re-resolve chapter and element.
    fn set_time(&mut self, time_ms: u64, now_ms: u64) {
        let time_ms = time_ms.min(self.mapper.timeline().total_duration_ms);
        self.current_time_ms = time_ms;
        if let Some(location) = self.mapper.time_to_element(time_ms) {
            if location.chapter_index != self.chapter_index {
                self.scroll_percent = 0.0;
            }
            self.chapter_index = location.chapter_index;
            self.element_id = location.element_id;
        }
        self.narrated = true;
        self.established = true;
        self.last_changed_ms = now_ms;
    }

    fn place_in_text(
        &mut self,
        chapter_index: usize,
        element_id: Option<String>,
        scroll_percent: f64,
        now_ms: u64,
    ) {
        self.chapter_index = chapter_index;
        self.scroll_percent = scroll_percent;
        let narrated = element_id
            .as_deref()
            .and_then(|id| self.mapper.element_to_time(chapter_index, id));
        self.narrated = narrated.is_some();
        self.established = true;
        self.current_time_ms = narrated
            .or_else(|| {
                self.mapper
                    .timeline()
                    .chapter(chapter_index)
                    .map(|chapter| chapter.start_offset_ms)
            })
            .unwrap_or(0);
        self.element_id = element_id;
        self.last_changed_ms = now_ms;
    }

    fn apply_progress(&mut self, progress: &UnifiedProgress) {
        let chapters = self.chapter_count();
        if chapters == 0 {
            return;
        }
        let chapter_index = progress.chapter_index.min(chapters - 1);
        let has_audio = self.mapper.timeline().has_audio();
        let narrated = progress
            .element_id
            .as_deref()
            .and_then(|id| self.mapper.element_to_time(chapter_index, id));

        let changed_ms = self.last_changed_ms;
        if has_audio && progress.audio_timestamp_ms > 0 {
            self.set_time(progress.audio_timestamp_ms, changed_ms);
        } else if let Some(time_ms) = narrated.filter(|_| has_audio) {
            self.set_time(time_ms, changed_ms);
        } else {
            self.place_in_text(chapter_index, progress.element_id.clone(), 0.0, changed_ms);
        }
        self.scroll_percent = progress.scroll_percent.clamp(0.0, 1.0);
    }

    fn save(&mut self, trigger: SnapshotTrigger, now_ms: u64) {
        let progress = self.current_progress();
        let fraction = self.reconciler.overall_progress(&progress);
        if !self.gate.should_save(trigger, &progress, fraction, now_ms) {
            return;
        }
        match self.sink.push(&progress) {
            Ok(()) => self.gate.record(&progress, fraction, now_ms),
            Err(err) => warn!(book_id = %self.book_id, ?trigger, "Failed to persist progress: {err:#}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::timeline::tests::sample_timeline;
    use std::sync::Mutex;

    const NOW: u64 = 1_700_000_000_000;

    /// Sink that records every accepted push.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        pub pushed: Arc<Mutex<Vec<UnifiedProgress>>>,
    }

    impl ProgressSink for RecordingSink {
        fn push(&mut self, progress: &UnifiedProgress) -> anyhow::Result<()> {
            self.pushed.lock().expect("sink lock").push(progress.clone());
            Ok(())
        }
    }

    fn build_coordinator(timeline: Timeline) -> (PlaybackCoordinator, RecordingSink) {
        let sink = RecordingSink::default();
        let coordinator = PlaybackCoordinator::new(
            BookHandle {
                id: "book".into(),
                title: "Sample".into(),
                timeline: Arc::new(timeline),
            },
            CoordinatorSettings {
                skip_interval_ms: 1_000,
                ..CoordinatorSettings::default()
            },
            Box::new(sink.clone()),
        );
        (coordinator, sink)
    }

    fn pushes(sink: &RecordingSink) -> usize {
        sink.pushed.lock().expect("sink lock").len()
    }

    #[test]
    fn command_dispatch_emits_action_snapshot_and_directives() {
        let (mut coordinator, _sink) = build_coordinator(sample_timeline());

        let event = coordinator.apply_command(CoordinatorCommand::Seek { time_ms: 3_600 }, NOW);

        assert_eq!(event.action, "playback_seek");
        assert_eq!(event.snapshot.current_chapter_index, 2);
        assert_eq!(event.snapshot.current_element_id.as_deref(), Some("e4"));
        assert_eq!(event.snapshot.chapters.len(), 3);
        assert_eq!(
            event.directives,
            vec![EngineDirective::SeekTo {
                clip_index: 2,
                offset_in_clip_ms: 100
            }]
        );
    }

    #[test]
    fn play_then_tick_tracks_elements_and_throttles_saves() {
        let (mut coordinator, sink) = build_coordinator(sample_timeline());
        let event = coordinator.apply_command(CoordinatorCommand::Play, NOW);
        assert_eq!(event.snapshot.state, PlaybackState::Playing);
        assert_eq!(event.directives.last(), Some(&EngineDirective::Play));

        let tick = |offset| CoordinatorCommand::Tick {
            clip_index: 0,
            offset_in_clip_ms: offset,
            elapsed_ms: 1_000,
        };
        let event = coordinator.apply_command(tick(2_100), NOW + 1_000);
        assert_eq!(event.snapshot.current_element_id.as_deref(), Some("e2"));
        assert_eq!(pushes(&sink), 1);

        coordinator.apply_command(tick(2_200), NOW + 2_000);
        assert_eq!(pushes(&sink), 1);

        let event = coordinator.apply_command(CoordinatorCommand::Pause, NOW + 2_500);
        assert_eq!(event.directives, vec![EngineDirective::Pause]);
        assert_eq!(pushes(&sink), 2);
    }

    #[test]
    fn skip_records_previous_spot_and_return_swaps_back() {
        let (mut coordinator, _sink) = build_coordinator(sample_timeline());
        coordinator.apply_command(CoordinatorCommand::Seek { time_ms: 500 }, NOW);
        let event = coordinator.apply_command(CoordinatorCommand::SkipForward, NOW + 10);
        assert_eq!(event.snapshot.current_time_ms, 1_500);
        assert_eq!(event.snapshot.previous_spot_time_ms, Some(500));

        let event = coordinator.apply_command(CoordinatorCommand::ReturnToPreviousSpot, NOW + 20);
        assert_eq!(event.snapshot.current_time_ms, 500);
        assert_eq!(event.snapshot.previous_spot_time_ms, Some(1_500));
        assert_eq!(
            event.directives,
            vec![EngineDirective::SeekTo {
                clip_index: 0,
                offset_in_clip_ms: 500
            }]
        );
    }

    #[test]
    fn jump_to_empty_chapter_lands_in_text() {
        let (mut coordinator, _sink) = build_coordinator(sample_timeline());
        let event =
            coordinator.apply_command(CoordinatorCommand::JumpToChapter { chapter_index: 1 }, NOW);
        assert_eq!(event.snapshot.current_chapter_index, 1);
        assert_eq!(event.snapshot.current_element_id, None);
        assert!(event.directives.is_empty());

        let event = coordinator.apply_command(
            CoordinatorCommand::JumpToElement {
                chapter_index: 2,
                element_id: "e4".into(),
            },
            NOW + 1,
        );
        assert_eq!(event.snapshot.current_time_ms, 3_500);
    }

    #[test]
    fn retries_are_bounded_and_ticks_reset_them() {
        let (mut coordinator, _sink) = build_coordinator(sample_timeline());
        coordinator.apply_command(CoordinatorCommand::Play, NOW);
        let fail = || CoordinatorCommand::PlaybackFailed {
            reason: "decode error".into(),
        };

        for _ in 0..2 {
            let event = coordinator.apply_command(fail(), NOW);
            assert_eq!(event.directives.last(), Some(&EngineDirective::Play));
        }
        coordinator.apply_command(
            CoordinatorCommand::Tick {
                clip_index: 0,
                offset_in_clip_ms: 10,
                elapsed_ms: 10,
            },
            NOW,
        );
        for _ in 0..2 {
            let event = coordinator.apply_command(fail(), NOW);
            assert_eq!(event.directives.last(), Some(&EngineDirective::Play));
        }
        let event = coordinator.apply_command(fail(), NOW);
        assert_eq!(event.directives, vec![EngineDirective::Stop]);
        assert_eq!(event.snapshot.state, PlaybackState::Stopped);
    }

    #[test]
    fn sleep_timer_pauses_at_chapter_boundary() {
        let (mut coordinator, _sink) = build_coordinator(sample_timeline());
        coordinator.apply_command(CoordinatorCommand::Play, NOW);
        coordinator.apply_command(
            CoordinatorCommand::SetSleepTimer {
                duration_ms: 500,
                finish_chapter: true,
            },
            NOW,
        );
        let event = coordinator.apply_command(
            CoordinatorCommand::Tick {
                clip_index: 0,
                offset_in_clip_ms: 600,
                elapsed_ms: 600,
            },
            NOW + 600,
        );
        assert_eq!(
            event.snapshot.sleep_timer,
            SleepTimerState::EndOfChapterWait { chapter_index: 0 }
        );

        let event = coordinator.apply_command(CoordinatorCommand::ClipStarted { clip_index: 1 }, NOW + 2_500);
        assert_eq!(event.directives, vec![EngineDirective::Pause]);
        assert_eq!(event.snapshot.state, PlaybackState::Paused);
        assert_eq!(event.snapshot.sleep_timer, SleepTimerState::Paused);
    }

    #[test]
    fn remote_conflict_is_held_until_resolved() {
        let (mut coordinator, sink) = build_coordinator(sample_timeline());
        coordinator.apply_command(CoordinatorCommand::Seek { time_ms: 500 }, NOW);
        let remote = UnifiedProgress {
            chapter_index: 2,
            audio_timestamp_ms: 3_600,
            total_chapters: 3,
            last_updated: NOW + 600_000,
            ..UnifiedProgress::default()
        };
        let event = coordinator.apply_command(
            CoordinatorCommand::RemotePositionFetched { progress: remote },
            NOW + 1,
        );
        assert!(event.snapshot.pending_conflict.is_some());
        assert_eq!(event.snapshot.current_time_ms, 500);

        let event = coordinator.apply_command(
            CoordinatorCommand::ResolveConflict {
                choice: ConflictChoice::UseRemote,
            },
            NOW + 2,
        );
        assert!(event.snapshot.pending_conflict.is_none());
        assert_eq!(event.snapshot.current_chapter_index, 2);
        assert_eq!(event.snapshot.current_element_id.as_deref(), Some("e4"));
        let last = sink.pushed.lock().expect("sink lock").last().cloned();
        assert_eq!(last.map(|p| p.last_updated), Some(NOW + 600_000));
    }

    #[test]
    fn remote_is_adopted_when_no_local_position_exists() {
        let (mut coordinator, sink) = build_coordinator(sample_timeline());
        let remote = UnifiedProgress {
            chapter_index: 2,
            audio_timestamp_ms: 3_600,
            total_chapters: 3,
            last_updated: NOW,
            ..UnifiedProgress::default()
        };
        let event = coordinator.apply_command(
            CoordinatorCommand::RemotePositionFetched { progress: remote },
            NOW + 1,
        );
        assert!(event.snapshot.pending_conflict.is_none());
        assert_eq!(event.snapshot.current_time_ms, 3_600);
        assert_eq!(
            event.directives,
            vec![EngineDirective::SeekTo {
                clip_index: 2,
                offset_in_clip_ms: 100
            }]
        );
        assert_eq!(pushes(&sink), 1);
    }

    #[test]
    fn text_scrolls_in_a_narrated_chapter_are_persisted() {
        let (mut coordinator, sink) = build_coordinator(sample_timeline());
        coordinator.apply_command(CoordinatorCommand::SetMode { mode: ReadingMode::Text }, NOW);
        let scroll = |scroll_percent| CoordinatorCommand::ScrollTo {
            chapter_index: 2,
            scroll_percent,
            element_id: None,
        };

        let early = coordinator.apply_command(scroll(0.1), NOW + 10_000);
        let late = coordinator.apply_command(scroll(0.9), NOW + 60_000);
        assert!((early.snapshot.overall_progress - 2.1 / 3.0).abs() < 1e-9);
        assert!((late.snapshot.overall_progress - 2.9 / 3.0).abs() < 1e-9);

        coordinator.apply_command(CoordinatorCommand::Close, NOW + 61_000);
        let last = sink.pushed.lock().expect("sink lock").last().cloned();
        let last = last.expect("scroll was saved");
        assert_eq!(last.chapter_index, 2);
        assert_eq!(last.scroll_percent, 0.9);
        assert_eq!(last.audio_timestamp_ms, 0);
    }

    #[test]
    fn nearby_remote_is_adopted_silently() {
        let (mut coordinator, _sink) = build_coordinator(sample_timeline());
        coordinator.apply_command(CoordinatorCommand::Seek { time_ms: 3_600 }, NOW);
        let remote = UnifiedProgress {
            chapter_index: 2,
            audio_timestamp_ms: 3_700,
            total_chapters: 3,
            last_updated: NOW + 600_000,
            ..UnifiedProgress::default()
        };
        let event = coordinator.apply_command(
            CoordinatorCommand::RemotePositionFetched { progress: remote },
            NOW + 1,
        );
        assert!(event.snapshot.pending_conflict.is_none());
        assert_eq!(event.snapshot.current_time_ms, 3_700);
    }

    #[test]
    fn silent_book_tracks_text_position() {
        let (mut coordinator, sink) = build_coordinator(Timeline {
            chapters: vec![
                crate::timeline::Chapter {
                    index: 0,
                    title: "One".into(),
                    start_offset_ms: 0,
                    duration_ms: 0,
                },
                crate::timeline::Chapter {
                    index: 1,
                    title: "Two".into(),
                    start_offset_ms: 0,
                    duration_ms: 0,
                },
            ],
            ..Timeline::empty()
        });
        let event = coordinator.apply_command(CoordinatorCommand::Play, NOW);
        assert!(event.directives.is_empty());
        assert_eq!(event.snapshot.mode, ReadingMode::Text);

        let event = coordinator.apply_command(
            CoordinatorCommand::ScrollTo {
                chapter_index: 1,
                scroll_percent: 0.5,
                element_id: None,
            },
            NOW,
        );
        assert_eq!(event.snapshot.current_chapter_index, 1);
        assert!((event.snapshot.overall_progress - 0.75).abs() < 1e-9);
        assert_eq!(pushes(&sink), 1);
    }

    #[test]
    fn restore_does_not_write_back() {
        let (mut coordinator, sink) = build_coordinator(sample_timeline());
        coordinator.restore(&UnifiedProgress {
            chapter_index: 0,
            element_id: Some("e2".into()),
            total_chapters: 3,
            last_updated: 1_700_000_000,
            ..UnifiedProgress::default()
        });
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.current_time_ms, 2_000);
        assert_eq!(coordinator.current_progress().last_updated, NOW);
        assert_eq!(pushes(&sink), 0);
    }
}
