//! Command-line driver for the read-along engine.
//!
//! Opens a book directory, restores its saved position (local, then remote
//! when enabled), optionally seeks, and prints the presentation snapshot as
//! JSON before closing the book again.

use anyhow::{Context, Result, anyhow};
use readalong_core::cache::ProgressCache;
use readalong_core::clock::{format_clock_ms, try_parse_clock_ms};
use readalong_core::config::load_config;
use readalong_core::coordinator::CoordinatorCommand;
use readalong_core::host::{OpenStatus, ReaderHost};
use readalong_core::remote::{HttpProgressStore, RemoteProgressStore};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

struct CliArgs {
    book_dir: PathBuf,
    config_path: PathBuf,
    seek_ms: Option<u64>,
}

fn main() {
    let reload_handle = init_tracing();
    if let Err(err) = run(&reload_handle) {
        error!("{err:?}");
        std::process::exit(1);
    }
}

fn run(reload_handle: &ReloadHandle) -> Result<()> {
    let args = parse_args()?;
    let config = load_config(&args.config_path);
    set_log_level(reload_handle, config.log_level.as_filter_str());
    info!(
        path = %args.book_dir.display(),
        level = %config.log_level,
        cache_dir = %config.cache_dir,
        remote = config.remote_enabled,
        "Starting read-along"
    );

    let remote: Option<Arc<dyn RemoteProgressStore>> =
        match config.remote_store_config().map(HttpProgressStore::new) {
            Some(Ok(store)) => Some(Arc::new(store)),
            Some(Err(err)) => {
                warn!("Remote sync disabled; could not build HTTP client: {err}");
                None
            }
            None => None,
        };
    let host = ReaderHost::new(
        config.host_settings(),
        ProgressCache::new(&config.cache_dir),
        remote,
    );

    let status = host
        .open(args.book_dir.clone())
        .join()
        .map_err(|_| anyhow!("book loader thread panicked"))?
        .with_context(|| format!("Failed to open {}", args.book_dir.display()))?;
    if let OpenStatus::Discarded { request_id } = status {
        return Err(anyhow!("open request {request_id} was superseded"));
    }

    if let Some(time_ms) = args.seek_ms {
        let events = host
            .take_events()
            .ok_or_else(|| anyhow!("event stream unavailable"))?;
        let seek = CoordinatorCommand::Seek { time_ms };
        let expected = seek.action();
        host.send(seek)?;
        loop {
            let event = events
                .recv_timeout(EVENT_TIMEOUT)
                .context("Timed out waiting for seek to apply")?;
            if event.action == expected {
                break;
            }
        }
    }

    let snapshot = host
        .snapshot()
        .ok_or_else(|| anyhow!("no book is open"))?;
    info!(
        book_id = %snapshot.book_id,
        chapter = snapshot.current_chapter_index,
        position = %format_clock_ms(snapshot.current_time_ms),
        overall_progress = snapshot.overall_progress,
        "Current reading position"
    );
    println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
    host.close();
    Ok(())
}

fn parse_args() -> Result<CliArgs> {
    const USAGE: &str = "Usage: readalong <book-dir> [--seek <clock>] [--config <path>]";
    let mut args = env::args().skip(1);
    let mut book_dir = None;
    let mut seek_ms = None;
    let mut config_path = PathBuf::from("conf/config.toml");

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--seek" => {
                let raw = args.next().ok_or_else(|| anyhow!(USAGE))?;
                let ms = try_parse_clock_ms(&raw)
                    .ok_or_else(|| anyhow!("Invalid clock value for --seek: {raw}"))?;
                seek_ms = Some(ms);
            }
            "--config" => {
                config_path = PathBuf::from(args.next().ok_or_else(|| anyhow!(USAGE))?);
            }
            _ if book_dir.is_none() => book_dir = Some(PathBuf::from(arg)),
            _ => return Err(anyhow!(USAGE)),
        }
    }

    let book_dir = book_dir.ok_or_else(|| anyhow!(USAGE))?;
    if !Path::new(&book_dir).is_dir() {
        return Err(anyhow!("Book directory not found: {}", book_dir.display()));
    }
    Ok(CliArgs {
        book_dir,
        config_path,
        seek_ms,
    })
}

fn init_tracing() -> ReloadHandle {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(env_filter);
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter_layer),
        )
        .init();
    handle
}

fn set_log_level(handle: &ReloadHandle, level: &str) {
    if env::var_os("RUST_LOG").is_some() {
        info!(%level, "RUST_LOG is set; ignoring configured log level");
        return;
    }
    let parsed = EnvFilter::builder()
        .parse(level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(err) = handle.modify(|filter| *filter = parsed.clone()) {
        warn!(%level, "Failed to update log level from config: {err}");
    } else {
        info!(%level, "Applied log level from config");
    }
}
