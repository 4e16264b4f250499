//! Audio source catalog and reference resolution.
//!
//! Sync documents reference narration files with whatever path convention the
//! producing tool preferred. Resolution walks [`MatchStrategy::RANKED`] and
//! stops at the first strategy that finds a source.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, trace};
use unicode_normalization::UnicodeNormalization;

const COMMON_PREFIXES: &[&str] = &["oebps/", "ops/", "epub/", "audio/"];

/// One narration file known to the book, with its length when resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSource {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl AudioSource {
    /// Sources are identified by their normalized book-relative path.
    pub fn from_path(path: &str, duration_ms: Option<u64>) -> Self {
        let path = normalize_path(path);
        Self {
            id: path.clone(),
            path,
            duration_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    /// Reference resolved against the sync document's directory.
    Exact,
    /// Container prefixes stripped, NFC-normalized, case-insensitive.
    PrefixNormalized,
    /// File name only.
    SuffixOnly,
}

impl MatchStrategy {
    pub const RANKED: [MatchStrategy; 3] = [
        MatchStrategy::Exact,
        MatchStrategy::PrefixNormalized,
        MatchStrategy::SuffixOnly,
    ];

    pub fn label(self) -> &'static str {
        match self {
            MatchStrategy::Exact => "exact",
            MatchStrategy::PrefixNormalized => "prefix-normalized",
            MatchStrategy::SuffixOnly => "suffix-only",
        }
    }

    fn key(self, path: &str) -> String {
        match self {
            MatchStrategy::Exact => normalize_path(path),
            MatchStrategy::PrefixNormalized => prefix_normalized(path),
            MatchStrategy::SuffixOnly => file_name(path).nfc().collect::<String>().to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AudioMatch<'a> {
    pub source: &'a AudioSource,
    pub strategy: MatchStrategy,
}

#[derive(Debug, Clone, Default)]
pub struct AudioCatalog {
    sources: Vec<AudioSource>,
    by_id: HashMap<String, usize>,
}

impl AudioCatalog {
    pub fn new(sources: Vec<AudioSource>) -> Self {
        let by_id = sources
            .iter()
            .enumerate()
            .map(|(idx, source)| (source.id.clone(), idx))
            .collect();
        Self { sources, by_id }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&AudioSource> {
        self.by_id.get(id).and_then(|idx| self.sources.get(*idx))
    }

    pub fn duration_ms(&self, id: &str) -> Option<u64> {
        self.get(id).and_then(|source| source.duration_ms)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AudioSource> {
        self.sources.iter()
    }

    /// Resolve an audio reference found in the sync document at
    /// `document_path` (book-relative).
    ///
    /// The reference is tried both joined to the document's directory and
    /// as written, since some producers emit book-root-relative paths.
    pub fn resolve(&self, reference: &str, document_path: &str) -> Option<AudioMatch<'_>> {
        let reference = strip_fragment(reference);
        let decoded = percent_decode_str(reference).decode_utf8_lossy();
        let mut candidates = vec![join_relative(document_dir(document_path), &decoded)];
        let as_written = normalize_path(&decoded);
        if !candidates.contains(&as_written) {
            candidates.push(as_written);
        }

        for strategy in MatchStrategy::RANKED {
            let found = match strategy {
                MatchStrategy::SuffixOnly => self.closest_by_name(&candidates),
                _ => candidates
                    .iter()
                    .find_map(|candidate| self.first_with_key(strategy, candidate)),
            };
            if let Some(source) = found {
                trace!(
                    reference,
                    strategy = strategy.label(),
                    source = %source.id,
                    "Resolved audio reference"
                );
                return Some(AudioMatch { source, strategy });
            }
        }
        None
    }

    fn first_with_key(&self, strategy: MatchStrategy, candidate: &str) -> Option<&AudioSource> {
        let wanted = strategy.key(candidate);
        let mut hits = self
            .sources
            .iter()
            .filter(|source| strategy.key(&source.path) == wanted);
        let source = hits.next()?;
        if hits.next().is_some() {
            debug!(
                candidate,
                strategy = strategy.label(),
                chosen = %source.path,
                "Ambiguous audio reference; using first catalog entry"
            );
        }
        Some(source)
    }

    /// Same file name; among several, the one sharing the longest path tail.
    fn closest_by_name(&self, candidates: &[String]) -> Option<&AudioSource> {
        let wanted = candidates.first().map(|c| MatchStrategy::SuffixOnly.key(c))?;
        let mut best: Option<(&AudioSource, usize)> = None;
        for source in self
            .sources
            .iter()
            .filter(|source| MatchStrategy::SuffixOnly.key(&source.path) == wanted)
        {
            let tail = candidates
                .iter()
                .map(|candidate| shared_tail(candidate, &source.path))
                .max()
                .unwrap_or(0);
            if best.is_none_or(|(_, held)| tail > held) {
                best = Some((source, tail));
            }
        }
        best.map(|(source, _)| source)
    }
}

/// Collapse `.`/`..` segments and duplicate slashes.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn strip_fragment(reference: &str) -> &str {
    let end = reference.find(['#', '?']).unwrap_or(reference.len());
    reference[..end].trim()
}

fn document_dir(document_path: &str) -> &str {
    document_path
        .rfind(['/', '\\'])
        .map(|idx| &document_path[..idx])
        .unwrap_or("")
}

fn join_relative(base_dir: &str, reference: &str) -> String {
    if reference.starts_with('/') || base_dir.is_empty() {
        return normalize_path(reference);
    }
    normalize_path(&format!("{base_dir}/{reference}"))
}

fn prefix_normalized(path: &str) -> String {
    let mut key: String = normalize_path(path).nfc().collect::<String>().to_lowercase();
    loop {
        let Some(prefix) = COMMON_PREFIXES.iter().find(|prefix| key.starts_with(**prefix)) else {
            break;
        };
        key = key[prefix.len()..].to_string();
    }
    key
}

/// Number of trailing path segments two paths share, compared loosely.
fn shared_tail(a: &str, b: &str) -> usize {
    let segments = |path: &str| {
        normalize_path(path)
            .split('/')
            .map(|part| part.nfc().collect::<String>().to_lowercase())
            .collect::<Vec<_>>()
    };
    let (a, b) = (segments(a), segments(b));
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(left, right)| left == right)
        .count()
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
