//! Clock-value parsing for sync documents.
//!
//! Narration timings show up in several textual shapes depending on the tool
//! that authored the book: `12.5`, `12.5s`, `1500ms`, `2min`, `0:01:02.500`,
//! `01:02.5`, sometimes prefixed with `npt=`. Everything funnels into
//! [`parse_clock_ms`], which never fails.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

static RE_FULL_CLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+):([0-5]?\d):([0-5]?\d(?:\.\d+)?)$").unwrap());
static RE_PARTIAL_CLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+):([0-5]?\d(?:\.\d+)?)$").unwrap());
static RE_TIMECOUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+(?:\.\d+)?|\.\d+)\s*(h|min|s|ms)?$").unwrap());

/// Parse a clock value into milliseconds, returning `0` for anything
/// unrecognized.
pub fn parse_clock_ms(raw: &str) -> u64 {
    match try_parse_clock_ms(raw) {
        Some(ms) => ms,
        None => {
            debug!(value = raw, "Unparsable clock value; defaulting to 0");
            0
        }
    }
}

/// Fallible form of [`parse_clock_ms`].
pub fn try_parse_clock_ms(raw: &str) -> Option<u64> {
    let value = raw.trim();
    let value = value.strip_prefix("npt=").unwrap_or(value).trim();
    if value.is_empty() {
        return None;
    }

    if let Some(caps) = RE_FULL_CLOCK.captures(value) {
        let hours: f64 = caps[1].parse().ok()?;
        let minutes: f64 = caps[2].parse().ok()?;
        let seconds: f64 = caps[3].parse().ok()?;
        return seconds_to_ms(hours * 3600.0 + minutes * 60.0 + seconds);
    }

    if let Some(caps) = RE_PARTIAL_CLOCK.captures(value) {
        let minutes: f64 = caps[1].parse().ok()?;
        let seconds: f64 = caps[2].parse().ok()?;
        return seconds_to_ms(minutes * 60.0 + seconds);
    }

    let caps = RE_TIMECOUNT.captures(value)?;
    let amount: f64 = caps[1].parse().ok()?;
    let seconds = match caps.get(2).map(|unit| unit.as_str()) {
        Some("h") => amount * 3600.0,
        Some("min") => amount * 60.0,
        Some("ms") => amount / 1000.0,
        Some("s") | None => amount,
        Some(_) => return None,
    };
    seconds_to_ms(seconds)
}

/// Render milliseconds as `h:mm:ss.mmm` for logs and the CLI.
pub fn format_clock_ms(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms / 60_000) % 60;
    let seconds = (ms / 1000) % 60;
    let millis = ms % 1000;
    format!("{hours}:{minutes:02}:{seconds:02}.{millis:03}")
}

fn seconds_to_ms(seconds: f64) -> Option<u64> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some((seconds * 1000.0).round() as u64)
}
