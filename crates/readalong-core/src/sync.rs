//! Progress push: local persistence first, remote replication in the
//! background.

use crate::cache::ProgressCache;
use crate::cancellation::CancellationToken;
use crate::progress::UnifiedProgress;
use crate::remote::{PutOutcome, RemoteProgressStore};
use anyhow::Result;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Destination for snapshots the coordinator decided to keep.
pub trait ProgressSink: Send {
    /// Returns once the record is durable locally.
    fn push(&mut self, progress: &UnifiedProgress) -> Result<()>;

    /// Wait for background replication of everything pushed so far. Later
    /// pushes are local only.
    fn flush(&mut self) {}
}

pub struct ProgressSync {
    book_id: String,
    cache: ProgressCache,
    remote_tx: Option<Sender<UnifiedProgress>>,
    worker: Option<JoinHandle<()>>,
}

impl ProgressSync {
    pub fn new(
        book_id: impl Into<String>,
        cache: ProgressCache,
        remote: Option<Arc<dyn RemoteProgressStore>>,
        token: CancellationToken,
    ) -> Self {
        let book_id = book_id.into();
        let (remote_tx, worker) = match remote {
            Some(store) => {
                let (tx, rx) = mpsc::channel();
                let worker_book = book_id.clone();
                let handle = thread::spawn(move || run_remote_worker(worker_book, store, rx, token));
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };
        Self {
            book_id,
            cache,
            remote_tx,
            worker,
        }
    }

    pub fn book_id(&self) -> &str {
        &self.book_id
    }

    /// Close the queue and wait for in-flight remote work to drain.
    pub fn finish(mut self) {
        self.flush();
    }
}

impl ProgressSink for ProgressSync {
    fn push(&mut self, progress: &UnifiedProgress) -> Result<()> {
        self.cache.save_progress(&self.book_id, progress)?;
        if let Some(tx) = &self.remote_tx {
            if tx.send(progress.clone()).is_err() {
                debug!(book_id = %self.book_id, "Remote worker gone; skipping replication");
            }
        }
        Ok(())
    }

    fn flush(&mut self) {
        self.remote_tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(book_id = %self.book_id, "Remote worker panicked");
            }
        }
    }
}

fn run_remote_worker(
    book_id: String,
    store: Arc<dyn RemoteProgressStore>,
    rx: Receiver<UnifiedProgress>,
    token: CancellationToken,
) {
    while let Ok(mut record) = rx.recv() {
        let mut coalesced = 0usize;
        while let Ok(newer) = rx.try_recv() {
            record = newer;
            coalesced += 1;
        }
        if token.is_cancelled() {
            debug!(%book_id, "Book closed; dropping pending remote pushes");
            break;
        }
        match store.put_position(&book_id, &record) {
            Ok(PutOutcome::Accepted) => {
                debug!(%book_id, coalesced, last_updated = record.last_updated, "Pushed position");
            }
            Ok(PutOutcome::Conflict) => {
                debug!(%book_id, "Remote already holds a newer position");
            }
            Err(err) => warn!(%book_id, "Remote push failed: {err}"),
        }
    }
}

/// Fetch the stored remote position, swallowing failures.
pub fn fetch_remote(
    store: &dyn RemoteProgressStore,
    book_id: &str,
    token: &CancellationToken,
) -> Option<UnifiedProgress> {
    if token.is_cancelled() {
        return None;
    }
    match store.get_position(book_id) {
        Ok(Some(progress)) => {
            info!(book_id, last_updated = progress.last_updated, "Fetched remote position");
            (!token.is_cancelled()).then_some(progress)
        }
        Ok(None) => {
            debug!(book_id, "No remote position stored");
            None
        }
        Err(err) => {
            warn!(book_id, "Remote fetch failed: {err}");
            None
        }
    }
}
