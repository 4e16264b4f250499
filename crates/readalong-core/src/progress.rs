//! Unified progress records and local/remote reconciliation.
//!
//! Every reading mode reduces to one [`UnifiedProgress`] and one overall
//! fraction, so a text-mode position saved on one device can be compared
//! against an audio-mode position saved on another.

use crate::position::PositionMapper;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};
use ts_rs::TS;

/// Timestamps below this are epoch seconds rather than milliseconds.
pub const SECONDS_MAGNITUDE_THRESHOLD: u64 = 100_000_000_000;

/// The single serializable position record for a book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default, TS)]
#[serde(rename_all = "camelCase", default)]
#[ts(export)]
pub struct UnifiedProgress {
    #[ts(type = "number")]
    pub chapter_index: usize,
    #[ts(optional)]
    pub element_id: Option<String>,
    #[ts(type = "number")]
    pub audio_timestamp_ms: u64,
    pub scroll_percent: f64,
    #[serde(deserialize_with = "deserialize_timestamp")]
    #[ts(type = "number")]
    pub last_updated: u64,
    #[ts(type = "number")]
    pub total_chapters: usize,
    #[ts(type = "number")]
    pub total_duration_ms: u64,
    #[ts(optional)]
    pub href: Option<String>,
    #[ts(optional)]
    pub media_type: Option<String>,
}

impl UnifiedProgress {
    /// Copy with the timestamp in milliseconds and the scroll percent in
    /// `[0, 1]`.
    pub fn normalized(&self) -> Self {
        let mut out = self.clone();
        out.last_updated = normalize_timestamp_ms(self.last_updated);
        out.scroll_percent = clamp_unit(self.scroll_percent);
        out
    }

    /// Parse a persisted record; anything unreadable counts as no progress.
    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str::<Self>(raw)
            .ok()
            .map(|progress| progress.normalized())
    }
}

pub fn normalize_timestamp_ms(timestamp: u64) -> u64 {
    if timestamp > 0 && timestamp < SECONDS_MAGNITUDE_THRESHOLD {
        timestamp.saturating_mul(1000)
    } else {
        timestamp
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let from_float = |raw: f64| -> u64 {
        if !raw.is_finite() || raw <= 0.0 {
            0
        } else if raw < SECONDS_MAGNITUDE_THRESHOLD as f64 && raw.fract() != 0.0 {
            (raw * 1000.0).round() as u64
        } else {
            raw.round() as u64
        }
    };
    Ok(match value {
        serde_json::Value::Number(number) => number
            .as_u64()
            .unwrap_or_else(|| number.as_f64().map(from_float).unwrap_or(0)),
        serde_json::Value::String(text) => text.trim().parse::<f64>().map(from_float).unwrap_or(0),
        _ => 0,
    })
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// `(chapter_index + within_chapter_fraction) / total_chapters` in `[0, 1]`.
pub fn overall_progress(progress: &UnifiedProgress, mapper: Option<&PositionMapper>) -> f64 {
    let total = if progress.total_chapters > 0 {
        progress.total_chapters
    } else {
        mapper.map(|m| m.timeline().chapters.len()).unwrap_or(0)
    };
    if total == 0 {
        return 0.0;
    }
    let chapter = progress.chapter_index.min(total - 1);
    let within = within_chapter_fraction(progress, mapper);
    ((chapter as f64 + within) / total as f64).clamp(0.0, 1.0)
}

/// Audio timestamp first, then the element's narrated start, then scroll.
pub fn within_chapter_fraction(progress: &UnifiedProgress, mapper: Option<&PositionMapper>) -> f64 {
    if let Some(mapper) = mapper {
        let chapter = progress.chapter_index;
        if progress.audio_timestamp_ms > 0 {
            if let Some(fraction) = mapper.chapter_fraction(chapter, progress.audio_timestamp_ms) {
                return fraction;
            }
        }
        if let Some(element_id) = progress.element_id.as_deref() {
            if let Some(fraction) = mapper
                .element_to_time(chapter, element_id)
                .and_then(|time| mapper.chapter_fraction(chapter, time))
            {
                return fraction;
            }
        }
    }
    clamp_unit(progress.scroll_percent)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergePolicy {
    pub debounce_guard_ms: u64,
    pub auto_merge_threshold_pct: f64,
    pub reset_guard_remote_max_pct: f64,
    pub reset_guard_local_min_pct: f64,
    pub reset_override_window_ms: u64,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            debounce_guard_ms: 10_000,
            auto_merge_threshold_pct: 5.0,
            reset_guard_remote_max_pct: 10.0,
            reset_guard_local_min_pct: 25.0,
            reset_override_window_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ConflictSource {
    Remote,
}

/// A deferred choice between two positions that disagree beyond tolerance.
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ConflictDecision {
    pub candidate_a: UnifiedProgress,
    pub candidate_b: UnifiedProgress,
    pub percent_a: f64,
    pub percent_b: f64,
    pub source: ConflictSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    KeepLocal,
    UseRemote,
}

impl ConflictDecision {
    /// The chosen record, re-stamped so it supersedes both candidates.
    pub fn resolve(&self, choice: ConflictChoice, now_ms: u64) -> UnifiedProgress {
        let mut chosen = match choice {
            ConflictChoice::KeepLocal => self.candidate_a.clone(),
            ConflictChoice::UseRemote => self.candidate_b.clone(),
        };
        chosen.last_updated = now_ms
            .max(self.candidate_a.last_updated)
            .max(self.candidate_b.last_updated);
        chosen
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepReason {
    RemoteNotNewer,
    StaleRemoteReset,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    KeepLocal {
        position: UnifiedProgress,
        reason: KeepReason,
    },
    AdoptRemote(UnifiedProgress),
    Conflict(ConflictDecision),
}

impl MergeOutcome {
    /// Position that stays active after the merge. A conflict leaves the
    /// local position active until the caller resolves it.
    pub fn active(&self) -> &UnifiedProgress {
        match self {
            MergeOutcome::KeepLocal { position, .. } => position,
            MergeOutcome::AdoptRemote(position) => position,
            MergeOutcome::Conflict(decision) => &decision.candidate_a,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressReconciler {
    mapper: Option<PositionMapper>,
    policy: MergePolicy,
}

impl ProgressReconciler {
    pub fn new(mapper: Option<PositionMapper>, policy: MergePolicy) -> Self {
        Self { mapper, policy }
    }

    pub fn overall_progress(&self, progress: &UnifiedProgress) -> f64 {
        overall_progress(progress, self.mapper.as_ref())
    }

    fn percent(&self, progress: &UnifiedProgress) -> f64 {
        self.overall_progress(progress) * 100.0
    }

    pub fn merge(&self, local: &UnifiedProgress, remote: &UnifiedProgress) -> MergeOutcome {
        let local = local.normalized();
        let remote = remote.normalized();

        if remote.last_updated <= local.last_updated.saturating_add(self.policy.debounce_guard_ms) {
            debug!(
                local_ts = local.last_updated,
                remote_ts = remote.last_updated,
                "Remote position is not newer than local; ignoring"
            );
            return MergeOutcome::KeepLocal {
                position: local,
                reason: KeepReason::RemoteNotNewer,
            };
        }

        let newer_by = remote.last_updated - local.last_updated;
        let local_pct = self.percent(&local);
        let remote_pct = self.percent(&remote);

        if remote_pct <= self.policy.reset_guard_remote_max_pct
            && local_pct >= self.policy.reset_guard_local_min_pct
            && newer_by <= self.policy.reset_override_window_ms
        {
            info!(
                local_pct,
                remote_pct, newer_by, "Remote looks like a fresh or stale reset; keeping local"
            );
            return MergeOutcome::KeepLocal {
                position: local,
                reason: KeepReason::StaleRemoteReset,
            };
        }

        if (remote_pct - local_pct).abs() <= self.policy.auto_merge_threshold_pct {
            debug!(local_pct, remote_pct, "Adopting nearby remote position");
            return MergeOutcome::AdoptRemote(remote);
        }

        info!(local_pct, remote_pct, "Local and remote positions disagree");
        MergeOutcome::Conflict(ConflictDecision {
            candidate_a: local,
            candidate_b: remote,
            percent_a: local_pct,
            percent_b: remote_pct,
            source: ConflictSource::Remote,
        })
    }

    pub fn resolve(
        &self,
        decision: &ConflictDecision,
        choice: ConflictChoice,
        now_ms: u64,
    ) -> UnifiedProgress {
        info!(?choice, "Resolving progress conflict");
        decision.resolve(choice, now_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotTrigger {
    Tick,
    Pause,
    ChapterChange,
    Seek,
    Close,
}

impl SnapshotTrigger {
    fn is_throttled(self) -> bool {
        matches!(self, SnapshotTrigger::Tick)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotPolicy {
    pub min_interval_ms: u64,
    pub position_epsilon_ms: u64,
    pub fraction_epsilon: f64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            min_interval_ms: 5_000,
            position_epsilon_ms: 1_000,
            fraction_epsilon: 0.001,
        }
    }
}

#[derive(Debug, Clone)]
struct SavedMark {
    at_ms: u64,
    chapter_index: usize,
    element_id: Option<String>,
    audio_timestamp_ms: u64,
    scroll_percent: f64,
    fraction: f64,
}

/// Decides which position changes are worth persisting.
#[derive(Debug, Clone)]
pub struct SnapshotGate {
    policy: SnapshotPolicy,
    last_saved: Option<SavedMark>,
}

impl SnapshotGate {
    pub fn new(policy: SnapshotPolicy) -> Self {
        Self {
            policy,
            last_saved: None,
        }
    }

    pub fn should_save(
        &self,
        trigger: SnapshotTrigger,
        candidate: &UnifiedProgress,
        fraction: f64,
        now_ms: u64,
    ) -> bool {
        let Some(last) = self.last_saved.as_ref() else {
            return true;
        };
        if trigger.is_throttled() && now_ms.saturating_sub(last.at_ms) < self.policy.min_interval_ms
        {
            return false;
        }
        let same_location = last.chapter_index == candidate.chapter_index
            && last.element_id == candidate.element_id;
        let position_close = last.audio_timestamp_ms.abs_diff(candidate.audio_timestamp_ms)
            < self.policy.position_epsilon_ms;
        let fraction_close = (last.fraction - fraction).abs() < self.policy.fraction_epsilon;
        let scroll_close =
            (last.scroll_percent - candidate.scroll_percent).abs() < self.policy.fraction_epsilon;
        !(same_location && position_close && fraction_close && scroll_close)
    }

    pub fn record(&mut self, saved: &UnifiedProgress, fraction: f64, now_ms: u64) {
        self.last_saved = Some(SavedMark {
            at_ms: now_ms,
            chapter_index: saved.chapter_index,
            element_id: saved.element_id.clone(),
            audio_timestamp_ms: saved.audio_timestamp_ms,
            scroll_percent: saved.scroll_percent,
            fraction,
        });
    }
}
