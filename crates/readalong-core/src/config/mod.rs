//! Configuration loading for the read-along engine.
//!
//! Settings live in `conf/config.toml` as sectioned TOML and are flattened
//! into [`AppConfig`]. Missing or invalid entries fall back to defaults so a
//! book can always be opened.

mod defaults;
mod io;
mod models;
mod tables;

pub use io::{load_config, parse_config, serialize_config};
pub use models::{AppConfig, LogLevel};
