//! Sync document parsing.
//!
//! A sync document pairs text elements with time ranges in narration audio:
//!
//! ```xml
//! <par id="p1">
//!   <text src="../text/ch01.xhtml#para-1"/>
//!   <audio src="../audio/ch01.mp3" clipBegin="0s" clipEnd="2.5s"/>
//! </par>
//! ```
//!
//! Parsing is fail-soft: a malformed document yields no segments and a
//! warning, an unresolvable audio reference drops only its own pair.

use crate::audio_sources::AudioCatalog;
use crate::clock::parse_clock_ms;
use quick_xml::Reader;
use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One text element's time range within one audio source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSegment {
    pub element_id: String,
    pub audio_source_id: String,
    pub clip_begin_ms: u64,
    pub clip_end_ms: u64,
}

impl SyncSegment {
    pub fn duration_ms(&self) -> u64 {
        self.clip_end_ms.saturating_sub(self.clip_begin_ms)
    }
}

#[derive(Debug, Default)]
struct PendingPar {
    text_src: Option<String>,
    audio_src: Option<String>,
    clip_begin: Option<String>,
    clip_end: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParseStats {
    pub pairs: usize,
    pub kept: usize,
    pub missing_fragment: usize,
    pub unresolved_audio: usize,
    pub open_ended: usize,
}

pub struct SyncDocumentParser<'a> {
    catalog: &'a AudioCatalog,
}

impl<'a> SyncDocumentParser<'a> {
    pub fn new(catalog: &'a AudioCatalog) -> Self {
        Self { catalog }
    }

    /// Parse one chapter's sync markup. `document_path` is the book-relative
    /// path of the sync document, used to resolve relative audio references.
    pub fn parse(&self, markup: &str, document_path: &str) -> Vec<SyncSegment> {
        match self.try_parse(markup, document_path) {
            Ok((segments, stats)) => {
                debug!(
                    document = document_path,
                    pairs = stats.pairs,
                    kept = stats.kept,
                    missing_fragment = stats.missing_fragment,
                    unresolved_audio = stats.unresolved_audio,
                    "Parsed sync document"
                );
                segments
            }
            Err(err) => {
                warn!(
                    document = document_path,
                    "Sync document is malformed; chapter will have no segments: {err}"
                );
                Vec::new()
            }
        }
    }

    pub fn try_parse(
        &self,
        markup: &str,
        document_path: &str,
    ) -> Result<(Vec<SyncSegment>, ParseStats), quick_xml::Error> {
        let mut reader = Reader::from_str(markup);
        reader.config_mut().trim_text(true);

        let mut segments = Vec::new();
        let mut stats = ParseStats::default();
        let mut current: Option<PendingPar> = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => match local_name(e.name().as_ref()) {
                    b"par" => current = Some(PendingPar::default()),
                    b"text" | b"audio" => {
                        if let Some(par) = current.as_mut() {
                            absorb_child(par, &e);
                        }
                    }
                    _ => {}
                },
                Event::Empty(e) => match local_name(e.name().as_ref()) {
                    b"text" | b"audio" => {
                        if let Some(par) = current.as_mut() {
                            absorb_child(par, &e);
                        }
                    }
                    _ => {}
                },
                Event::End(e) => {
                    if local_name(e.name().as_ref()) == b"par" {
                        if let Some(par) = current.take() {
                            stats.pairs += 1;
                            if let Some(segment) = self.finish_par(par, document_path, &mut stats)
                            {
                                segments.push(segment);
                            }
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        stats.kept = segments.len();
        Ok((segments, stats))
    }

    fn finish_par(
        &self,
        par: PendingPar,
        document_path: &str,
        stats: &mut ParseStats,
    ) -> Option<SyncSegment> {
        let text_src = par.text_src?;
        let audio_src = par.audio_src?;

        let Some(element_id) = fragment(&text_src) else {
            stats.missing_fragment += 1;
            return None;
        };

        let Some(hit) = self.catalog.resolve(&audio_src, document_path) else {
            stats.unresolved_audio += 1;
            warn!(
                document = document_path,
                audio = %audio_src,
                element = element_id,
                "Audio source not found; skipping segment"
            );
            return None;
        };

        let clip_begin_ms = par.clip_begin.as_deref().map(parse_clock_ms).unwrap_or(0);
        let clip_end_ms = match par.clip_end.as_deref() {
            Some(raw) => parse_clock_ms(raw),
            None => {
                stats.open_ended += 1;
                let Some(length) = hit.source.duration_ms else {
                    debug!(
                        element = element_id,
                        source = %hit.source.id,
                        "Open-ended clip on a source of unknown length; skipping"
                    );
                    return None;
                };
                length
            }
        };
        if clip_end_ms < clip_begin_ms {
            warn!(
                element = element_id,
                clip_begin_ms, clip_end_ms, "Clip ends before it begins; skipping"
            );
            return None;
        }

        Some(SyncSegment {
            element_id: element_id.to_string(),
            audio_source_id: hit.source.id.clone(),
            clip_begin_ms,
            clip_end_ms,
        })
    }
}

fn absorb_child(par: &mut PendingPar, element: &BytesStart<'_>) {
    let is_text = local_name(element.name().as_ref()) == b"text";
    for attr in element.attributes().flatten() {
        let value = attribute_value(&attr.value);
        match local_name(attr.key.as_ref()) {
            b"src" if is_text => par.text_src = Some(value),
            b"src" => par.audio_src = Some(value),
            b"clipBegin" | b"clip-begin" | b"clipbegin" => par.clip_begin = Some(value),
            b"clipEnd" | b"clip-end" | b"clipend" => par.clip_end = Some(value),
            _ => {}
        }
    }
}

fn attribute_value(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    match unescape(&text) {
        Ok(unescaped) => unescaped.into_owned(),
        Err(_) => text.into_owned(),
    }
}

fn fragment(src: &str) -> Option<&str> {
    src.split_once('#')
        .map(|(_, fragment)| fragment.trim())
        .filter(|fragment| !fragment.is_empty())
}

fn local_name(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|&b| b == b':')
        .map(|i| &name[i + 1..])
        .unwrap_or(name)
}
