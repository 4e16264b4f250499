//! Sleep timer that pauses narration after a listening budget.
//!
//! The countdown only runs while audio is playing. With "finish chapter" set,
//! an expired timer waits for the next chapter boundary (or the end of the
//! book) before asking the coordinator to pause.

use serde::Serialize;
use tracing::{debug, info};
use ts_rs::TS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[serde(tag = "state", rename_all = "snake_case")]
#[ts(export)]
pub enum SleepTimerState {
    Idle,
    Counting {
        #[serde(rename = "remainingMs")]
        #[ts(type = "number")]
        remaining_ms: u64,
    },
    EndOfChapterWait {
        #[serde(rename = "chapterIndex")]
        #[ts(type = "number")]
        chapter_index: usize,
    },
    Paused,
}

/// Where playback is, as seen by the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerContext {
    pub chapter_index: usize,
    pub remaining_in_book_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SleepTimer {
    state: SleepTimerState,
    finish_chapter: bool,
    end_of_book_margin_ms: u64,
}

impl SleepTimer {
    pub fn new(end_of_book_margin_ms: u64) -> Self {
        Self {
            state: SleepTimerState::Idle,
            finish_chapter: false,
            end_of_book_margin_ms,
        }
    }

    pub fn state(&self) -> SleepTimerState {
        self.state
    }

    pub fn start(&mut self, duration_ms: u64, finish_chapter: bool) {
        info!(duration_ms, finish_chapter, "Sleep timer started");
        self.finish_chapter = finish_chapter;
        self.state = SleepTimerState::Counting {
            remaining_ms: duration_ms,
        };
    }

    pub fn cancel(&mut self) {
        if self.state != SleepTimerState::Idle {
            debug!("Sleep timer cancelled");
        }
        self.state = SleepTimerState::Idle;
    }

    /// Resuming after the timer fired clears it.
    pub fn on_play(&mut self) {
        if self.state == SleepTimerState::Paused {
            self.state = SleepTimerState::Idle;
        }
    }

    /// Advance by `elapsed_ms` of playback. Returns `true` exactly when the
    /// timer fires and playback should pause.
    pub fn advance(&mut self, elapsed_ms: u64, playing: bool, ctx: TimerContext) -> bool {
        if !playing {
            return false;
        }
        match self.state {
            SleepTimerState::Counting { remaining_ms } => {
                let remaining_ms = remaining_ms.saturating_sub(elapsed_ms);
                if remaining_ms > 0 {
                    self.state = SleepTimerState::Counting { remaining_ms };
                    return false;
                }
                if self.finish_chapter {
                    debug!(chapter = ctx.chapter_index, "Sleep timer waiting for chapter end");
                    self.state = SleepTimerState::EndOfChapterWait {
                        chapter_index: ctx.chapter_index,
                    };
                    return self.check_chapter_end(ctx);
                }
                self.fire()
            }
            SleepTimerState::EndOfChapterWait { .. } => self.check_chapter_end(ctx),
            SleepTimerState::Idle | SleepTimerState::Paused => false,
        }
    }

    fn check_chapter_end(&mut self, ctx: TimerContext) -> bool {
        let SleepTimerState::EndOfChapterWait { chapter_index } = self.state else {
            return false;
        };
        if ctx.chapter_index != chapter_index
            || ctx.remaining_in_book_ms <= self.end_of_book_margin_ms
        {
            return self.fire();
        }
        false
    }

    fn fire(&mut self) -> bool {
        info!("Sleep timer fired; pausing playback");
        self.state = SleepTimerState::Paused;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(chapter_index: usize) -> TimerContext {
        TimerContext {
            chapter_index,
            remaining_in_book_ms: 600_000,
        }
    }

    #[test]
    fn countdown_only_moves_while_playing() {
        let mut timer = SleepTimer::new(1_500);
        timer.start(10_000, false);
        assert!(!timer.advance(4_000, true, ctx(0)));
        assert!(!timer.advance(60_000, false, ctx(0)));
        assert_eq!(
            timer.state(),
            SleepTimerState::Counting {
                remaining_ms: 6_000
            }
        );
        assert!(timer.advance(6_000, true, ctx(0)));
        assert_eq!(timer.state(), SleepTimerState::Paused);
        assert!(!timer.advance(1_000, true, ctx(0)));
    }

    #[test]
    fn finish_chapter_waits_for_boundary() {
        let mut timer = SleepTimer::new(1_500);
        timer.start(1_000, true);
        assert!(!timer.advance(2_000, true, ctx(3)));
        assert_eq!(
            timer.state(),
            SleepTimerState::EndOfChapterWait { chapter_index: 3 }
        );
        assert!(!timer.advance(30_000, true, ctx(3)));
        assert!(timer.advance(0, true, ctx(4)));
        assert_eq!(timer.state(), SleepTimerState::Paused);
    }

    #[test]
    fn end_of_book_releases_chapter_wait() {
        let mut timer = SleepTimer::new(1_500);
        timer.start(1_000, true);
        timer.advance(1_000, true, ctx(7));
        let near_end = TimerContext {
            chapter_index: 7,
            remaining_in_book_ms: 900,
        };
        assert!(timer.advance(500, true, near_end));
    }

    #[test]
    fn play_after_fire_resets_and_cancel_clears() {
        let mut timer = SleepTimer::new(1_500);
        timer.start(500, false);
        assert!(timer.advance(500, true, ctx(0)));
        timer.on_play();
        assert_eq!(timer.state(), SleepTimerState::Idle);

        timer.start(5_000, true);
        timer.cancel();
        assert_eq!(timer.state(), SleepTimerState::Idle);
        assert!(!timer.advance(10_000, true, ctx(0)));
    }
}
