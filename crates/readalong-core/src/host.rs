//! Open/close lifecycle for one book at a time.
//!
//! Opening runs on a background thread tagged with a request id. A newer open
//! supersedes an older one: the older load is cancelled and, should it still
//! finish, its result is discarded instead of replacing the active book.

use crate::book::{LoadError, LoadedBook, load_book_with_cancel};
use crate::cache::ProgressCache;
use crate::cancellation::{Cancelled, CancellationToken};
use crate::coordinator::{
    CoordinatorCommand, CoordinatorEvent, CoordinatorSettings, PlaybackCoordinator,
    PlaybackSnapshot,
};
use crate::remote::RemoteProgressStore;
use crate::runtime::CoordinatorHandle;
use crate::sync::{ProgressSync, fetch_remote};
use anyhow::{Result, anyhow};
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct HostSettings {
    pub stitch_epsilon_ms: u64,
    pub coordinator: CoordinatorSettings,
}

#[derive(Debug, Clone)]
pub enum OpenStatus {
    Installed {
        request_id: u64,
        snapshot: Arc<PlaybackSnapshot>,
    },
    /// A newer open or a close superseded this request.
    Discarded { request_id: u64 },
}

struct OpenSession {
    book_id: String,
    runtime: CoordinatorHandle,
    events: Option<Receiver<CoordinatorEvent>>,
    token: CancellationToken,
}

struct HostState {
    next_request_id: u64,
    active_open_request: Option<u64>,
    open_cancel_token: Option<CancellationToken>,
    session: Option<OpenSession>,
}

#[derive(Clone)]
pub struct ReaderHost {
    state: Arc<Mutex<HostState>>,
    cache: ProgressCache,
    remote: Option<Arc<dyn RemoteProgressStore>>,
    settings: HostSettings,
}

impl ReaderHost {
    pub fn new(
        settings: HostSettings,
        cache: ProgressCache,
        remote: Option<Arc<dyn RemoteProgressStore>>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState {
                next_request_id: 1,
                active_open_request: None,
                open_cancel_token: None,
                session: None,
            })),
            cache,
            remote,
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load `root` in the background and install it if still current.
    pub fn open(&self, root: PathBuf) -> JoinHandle<Result<OpenStatus, LoadError>> {
        let (request_id, token) = self.begin_open_request();
        info!(request_id, path = %root.display(), "Starting book open request");
        let host = self.clone();
        thread::spawn(move || {
            let loaded =
                load_book_with_cancel(&root, host.settings.stitch_epsilon_ms, Some(&token));
            match loaded {
                Ok(book) => Ok(host.finish_open(request_id, &token, book)),
                Err(LoadError::Cancelled(Cancelled(stage))) => {
                    debug!(request_id, stage, "Book open cancelled");
                    Ok(OpenStatus::Discarded { request_id })
                }
                Err(err) => {
                    warn!(request_id, path = %root.display(), "Failed to open book: {err}");
                    host.clear_request_if_current(request_id);
                    Err(err)
                }
            }
        })
    }

    fn begin_open_request(&self) -> (u64, CancellationToken) {
        let mut state = self.lock();
        let request_id = state.next_request_id;
        state.next_request_id = state.next_request_id.wrapping_add(1).max(1);
        if let Some(previous) = state.open_cancel_token.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        state.active_open_request = Some(request_id);
        state.open_cancel_token = Some(token.clone());
        (request_id, token)
    }

    fn clear_request_if_current(&self, request_id: u64) {
        let mut state = self.lock();
        if state.active_open_request == Some(request_id) {
            state.active_open_request = None;
            state.open_cancel_token = None;
        }
    }

    fn finish_open(
        &self,
        request_id: u64,
        token: &CancellationToken,
        book: LoadedBook,
    ) -> OpenStatus {
        let mut state = self.lock();
        if state.active_open_request != Some(request_id) || token.is_cancelled() {
            info!(request_id, book_id = %book.id, "Discarded stale book open completion");
            return OpenStatus::Discarded { request_id };
        }
        state.active_open_request = None;
        state.open_cancel_token = None;
        if let Some(previous) = state.session.take() {
            close_session(previous);
        }

        let session = self.install(book, token.clone());
        let snapshot = session.runtime.snapshot();
        state.session = Some(session);
        OpenStatus::Installed {
            request_id,
            snapshot,
        }
    }

    fn install(&self, book: LoadedBook, token: CancellationToken) -> OpenSession {
        let sink = ProgressSync::new(
            book.id.clone(),
            self.cache.clone(),
            self.remote.clone(),
            token.clone(),
        );
        let mut coordinator =
            PlaybackCoordinator::new(book.handle(), self.settings.coordinator, Box::new(sink));
        if let Some(progress) = self.cache.load_progress(&book.id) {
            coordinator.restore(&progress);
        }
        let (runtime, events) = CoordinatorHandle::spawn(coordinator);

        if let Some(store) = self.remote.clone() {
            let sender = runtime.command_sender();
            let book_id = book.id.clone();
            let token = token.clone();
            thread::spawn(move || {
                if let Some(progress) = fetch_remote(store.as_ref(), &book_id, &token) {
                    if sender
                        .send(CoordinatorCommand::RemotePositionFetched { progress })
                        .is_err()
                    {
                        debug!(%book_id, "Book closed before remote position arrived");
                    }
                }
            });
        }

        info!(book_id = %book.id, title = %book.title, "Installed book");
        OpenSession {
            book_id: book.id,
            runtime,
            events: Some(events),
            token,
        }
    }

    pub fn send(&self, command: CoordinatorCommand) -> Result<()> {
        let state = self.lock();
        let session = state
            .session
            .as_ref()
            .ok_or_else(|| anyhow!("no book is open"))?;
        session.runtime.send(command)
    }

    pub fn snapshot(&self) -> Option<Arc<PlaybackSnapshot>> {
        self.lock()
            .session
            .as_ref()
            .map(|session| session.runtime.snapshot())
    }

    pub fn active_book_id(&self) -> Option<String> {
        self.lock()
            .session
            .as_ref()
            .map(|session| session.book_id.clone())
    }

    /// Event stream of the active book; can be taken once per open.
    pub fn take_events(&self) -> Option<Receiver<CoordinatorEvent>> {
        self.lock()
            .session
            .as_mut()
            .and_then(|session| session.events.take())
    }

    /// Cancel any in-flight open and close the active book. Returns whether a
    /// book was open.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        if let Some(token) = state.open_cancel_token.take() {
            token.cancel();
        }
        state.active_open_request = None;
        match state.session.take() {
            Some(session) => {
                close_session(session);
                true
            }
            None => false,
        }
    }
}

fn close_session(session: OpenSession) {
    info!(book_id = %session.book_id, "Closing book");
    session.runtime.shutdown();
    session.token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::load_book;
    use crate::book::tests::write_sample_book;
    use crate::cache::tests::temp_cache;
    use crate::progress::UnifiedProgress;
    use crate::remote::tests::MemoryStore;
    use std::time::{Duration, Instant};

    fn host_with(cache: ProgressCache, remote: Option<Arc<dyn RemoteProgressStore>>) -> ReaderHost {
        ReaderHost::new(
            HostSettings {
                stitch_epsilon_ms: 100,
                ..HostSettings::default()
            },
            cache,
            remote,
        )
    }

    #[test]
    fn stale_open_completion_is_discarded() {
        let cache = temp_cache("host-stale");
        let host = host_with(cache.clone(), None);
        let dir = write_sample_book("host-stale");
        let book = load_book(&dir, 100).expect("book loads");

        let (first_id, first_token) = host.begin_open_request();
        let (second_id, second_token) = host.begin_open_request();
        assert!(first_token.is_cancelled());

        let status = host.finish_open(first_id, &first_token, book.clone());
        assert!(matches!(status, OpenStatus::Discarded { request_id } if request_id == first_id));
        assert!(host.snapshot().is_none());

        let status = host.finish_open(second_id, &second_token, book);
        assert!(matches!(status, OpenStatus::Installed { .. }));
        assert_eq!(host.active_book_id().as_deref(), Some("sample"));

        assert!(host.close());
        assert!(second_token.is_cancelled());
        assert!(!host.close());
        let _ = std::fs::remove_dir_all(dir);
        let _ = std::fs::remove_dir_all(cache.root());
    }

    #[test]
    fn open_restores_cached_progress() {
        let cache = temp_cache("host-restore");
        cache
            .save_progress(
                "sample",
                &UnifiedProgress {
                    chapter_index: 0,
                    element_id: Some("p2".into()),
                    audio_timestamp_ms: 2_000,
                    total_chapters: 2,
                    last_updated: 1_700_000_000_000,
                    ..UnifiedProgress::default()
                },
            )
            .expect("seed cache");
        let host = host_with(cache.clone(), None);
        let dir = write_sample_book("host-restore");

        let status = host.open(dir.clone()).join().expect("join").expect("open");
        match status {
            OpenStatus::Installed { snapshot, .. } => {
                assert_eq!(snapshot.current_time_ms, 2_000);
                assert_eq!(snapshot.current_element_id.as_deref(), Some("p2"));
            }
            other => panic!("expected install, got {other:?}"),
        }
        host.close();
        let _ = std::fs::remove_dir_all(dir);
        let _ = std::fs::remove_dir_all(cache.root());
    }

    #[test]
    fn remote_position_is_delivered_after_install() {
        let cache = temp_cache("host-remote");
        let remote = MemoryStore::with_record(
            "sample",
            UnifiedProgress {
                chapter_index: 0,
                audio_timestamp_ms: 300,
                total_chapters: 2,
                last_updated: 1_700_000_000_000,
                ..UnifiedProgress::default()
            },
        );
        let host = host_with(cache.clone(), Some(Arc::new(remote)));
        let dir = write_sample_book("host-remote");
        host.open(dir.clone()).join().expect("join").expect("open");

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut adopted = false;
        while Instant::now() < deadline {
            if host.snapshot().is_some_and(|s| s.current_time_ms == 300) {
                adopted = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(adopted, "remote position was not adopted");
        host.close();
        let _ = std::fs::remove_dir_all(dir);
        let _ = std::fs::remove_dir_all(cache.root());
    }

    #[test]
    fn close_replicates_the_final_position() {
        let cache = temp_cache("host-close-flush");
        let store = Arc::new(MemoryStore::default());
        let host = host_with(
            cache.clone(),
            Some(store.clone() as Arc<dyn RemoteProgressStore>),
        );
        let dir = write_sample_book("host-close-flush");
        host.open(dir.clone()).join().expect("join").expect("open");

        host.send(CoordinatorCommand::Seek { time_ms: 3_000 })
            .expect("send seek");
        assert!(host.close());

        let held = store.get_position("sample").ok().flatten();
        assert_eq!(held.map(|p| p.audio_timestamp_ms), Some(3_000));
        let _ = std::fs::remove_dir_all(dir);
        let _ = std::fs::remove_dir_all(cache.root());
    }

    #[test]
    fn open_of_missing_book_reports_error() {
        let host = host_with(temp_cache("host-missing"), None);
        let result = host
            .open(std::env::temp_dir().join("readalong-definitely-missing-book"))
            .join()
            .expect("join");
        assert!(matches!(result, Err(LoadError::MissingContainer(_))));
        assert!(host.send(CoordinatorCommand::Play).is_err());
    }
}
