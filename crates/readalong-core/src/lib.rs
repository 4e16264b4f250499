//! Audio/text synchronization and reading-progress reconciliation.
//!
//! Loading flows one way: sync documents are parsed into segments, stitched
//! into a [`timeline::Timeline`], and wrapped by a [`position::PositionMapper`].
//! At runtime a [`coordinator::PlaybackCoordinator`] owns the live position
//! and reconciles it against local and remote progress records.

pub mod audio_sources;
pub mod book;
pub mod cache;
pub mod cancellation;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod host;
pub mod position;
pub mod progress;
pub mod remote;
pub mod runtime;
pub mod sleep_timer;
pub mod sync;
pub mod sync_document;
pub mod timeline;
