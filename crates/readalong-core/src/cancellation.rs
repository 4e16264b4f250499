use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use thiserror::Error;

/// Stage at which a cancelled job stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cancelled at stage={0}")]
pub struct Cancelled(pub &'static str);

/// Shared flag that lets an opened book tear down every task it spawned.
///
/// The host hands one token to the loader thread, the remote push worker and
/// the initial remote fetch. Closing the book or superseding the open request
/// flips it once for all of them.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Bail out of a multi-stage job between stages.
    pub fn checkpoint(&self, stage: &'static str) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled(stage));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_observe_the_same_cancellation() {
        let token = CancellationToken::new();
        let loader_view = token.clone();
        assert_eq!(loader_view.checkpoint("container"), Ok(()));

        token.cancel();

        assert!(loader_view.is_cancelled());
        let err = loader_view.checkpoint("timeline").unwrap_err();
        assert_eq!(err, Cancelled("timeline"));
        assert_eq!(err.to_string(), "cancelled at stage=timeline");
    }
}
