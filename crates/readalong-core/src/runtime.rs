//! Actor thread that owns a [`PlaybackCoordinator`].
//!
//! Commands arrive over an `mpsc` channel and are applied strictly in order.
//! After each one the latest snapshot is published behind an `RwLock` so any
//! thread can read it without queueing behind playback.

use crate::coordinator::{CoordinatorCommand, CoordinatorEvent, PlaybackCoordinator, PlaybackSnapshot};
use anyhow::{Result, anyhow};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace};

enum RuntimeMessage {
    Command(CoordinatorCommand),
    Shutdown,
}

/// Cloneable command entry point for threads other than the owner.
#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<RuntimeMessage>,
}

impl CommandSender {
    pub fn send(&self, command: CoordinatorCommand) -> Result<()> {
        self.tx
            .send(RuntimeMessage::Command(command))
            .map_err(|_| anyhow!("coordinator runtime has stopped"))
    }
}

pub struct CoordinatorHandle {
    tx: Sender<RuntimeMessage>,
    snapshot: Arc<RwLock<Arc<PlaybackSnapshot>>>,
    worker: Option<JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// Start the runtime. Events for the audio engine and presentation layer
    /// are delivered on the returned receiver; dropping it is allowed.
    pub fn spawn(coordinator: PlaybackCoordinator) -> (Self, Receiver<CoordinatorEvent>) {
        let (tx, rx) = mpsc::channel();
        let (events_tx, events_rx) = mpsc::channel();
        let snapshot = Arc::new(RwLock::new(Arc::new(coordinator.snapshot())));
        let published = Arc::clone(&snapshot);
        let worker = thread::spawn(move || run(coordinator, rx, events_tx, published));
        (
            Self {
                tx,
                snapshot,
                worker: Some(worker),
            },
            events_rx,
        )
    }

    pub fn send(&self, command: CoordinatorCommand) -> Result<()> {
        self.tx
            .send(RuntimeMessage::Command(command))
            .map_err(|_| anyhow!("coordinator runtime has stopped"))
    }

    pub fn command_sender(&self) -> CommandSender {
        CommandSender {
            tx: self.tx.clone(),
        }
    }

    pub fn snapshot(&self) -> Arc<PlaybackSnapshot> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Flush a final snapshot and stop the thread.
    pub fn shutdown(mut self) {
        let _ = self.tx.send(RuntimeMessage::Command(CoordinatorCommand::Close));
        let _ = self.tx.send(RuntimeMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run(
    mut coordinator: PlaybackCoordinator,
    rx: Receiver<RuntimeMessage>,
    events: Sender<CoordinatorEvent>,
    published: Arc<RwLock<Arc<PlaybackSnapshot>>>,
) {
    info!(book_id = %coordinator.book_id(), "Coordinator runtime started");
    while let Ok(message) = rx.recv() {
        let command = match message {
            RuntimeMessage::Command(command) => command,
            RuntimeMessage::Shutdown => break,
        };
        let event = coordinator.apply_command(command, now_ms());
        trace!(action = event.action, directives = event.directives.len(), "Applied command");
        let snapshot = Arc::new(event.snapshot.clone());
        match published.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
        if events.send(event).is_err() {
            debug!("No event listener attached");
        }
    }
    info!(book_id = %coordinator.book_id(), "Coordinator runtime stopped");
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::RecordingSink;
    use crate::coordinator::{BookHandle, CoordinatorSettings, PlaybackState};
    use crate::timeline::tests::sample_timeline;

    fn spawn_sample() -> (CoordinatorHandle, Receiver<CoordinatorEvent>, RecordingSink) {
        let sink = RecordingSink::default();
        let coordinator = PlaybackCoordinator::new(
            BookHandle {
                id: "book".into(),
                title: "Sample".into(),
                timeline: Arc::new(sample_timeline()),
            },
            CoordinatorSettings::default(),
            Box::new(sink.clone()),
        );
        let (handle, events) = CoordinatorHandle::spawn(coordinator);
        (handle, events, sink)
    }

    #[test]
    fn commands_are_applied_in_order_and_published() {
        let (handle, events, _sink) = spawn_sample();
        handle.send(CoordinatorCommand::Seek { time_ms: 2_100 }).expect("send");
        handle.send(CoordinatorCommand::Play).expect("send");

        let first = events.recv().expect("seek event");
        assert_eq!(first.action, "playback_seek");
        let second = events.recv().expect("play event");
        assert_eq!(second.action, "playback_play");
        assert_eq!(second.snapshot.current_element_id.as_deref(), Some("e2"));

        let published = handle.snapshot();
        assert_eq!(published.state, PlaybackState::Playing);
        assert_eq!(published.current_time_ms, 2_100);
        handle.shutdown();
    }

    #[test]
    fn shutdown_flushes_final_snapshot() {
        let (handle, events, sink) = spawn_sample();
        handle.send(CoordinatorCommand::Play).expect("send");
        let _ = events.recv();
        handle.shutdown();

        let actions: Vec<&str> = events.try_iter().map(|event| event.action).collect();
        assert_eq!(actions, vec!["book_close"]);
        assert_eq!(sink.pushed.lock().expect("sink lock").len(), 1);
    }
}
