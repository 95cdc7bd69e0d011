//! Folds a phase's activity buffer into the summary stored on its record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ActivityBuffer;

const EXCERPT_CHARS: usize = 100;
const MAX_HIGHLIGHTS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFocus {
    pub label: String,
    pub captures: u64,
    /// `captures * interval_secs`.
    pub approx_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub at: DateTime<Utc>,
    pub source_label: String,
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub samples_kept: u64,
    pub samples_discarded: u64,
    pub failures: u64,
    /// Sampling stopped early after repeated capture failures.
    pub degraded: bool,
    pub interval_secs: u64,
    /// In order of first appearance.
    pub sources: Vec<SourceFocus>,
    pub highlights: Vec<Highlight>,
}

impl ActivitySummary {
    pub fn empty(interval_secs: u64) -> Self {
        Self {
            samples_kept: 0,
            samples_discarded: 0,
            failures: 0,
            degraded: false,
            interval_secs,
            sources: Vec::new(),
            highlights: Vec::new(),
        }
    }

    pub fn summarize(buffer: &ActivityBuffer) -> Self {
        let mut summary = Self::empty(buffer.interval_secs);
        summary.samples_kept = buffer.entries.len() as u64;
        summary.samples_discarded = buffer.discarded;
        summary.failures = buffer.failures;
        summary.degraded = buffer.degraded;

        for entry in &buffer.entries {
            match summary.sources.iter_mut().find(|s| s.label == entry.source_label) {
                Some(source) => source.captures += 1,
                None => summary.sources.push(SourceFocus {
                    label: entry.source_label.clone(),
                    captures: 1,
                    approx_secs: 0,
                }),
            }

            let excerpt = excerpt(&entry.extracted_text);
            let repeat = summary
                .highlights
                .last()
                .is_some_and(|h| h.source_label == entry.source_label && h.excerpt == excerpt);
            if !repeat && summary.highlights.len() < MAX_HIGHLIGHTS {
                summary.highlights.push(Highlight {
                    at: entry.timestamp,
                    source_label: entry.source_label.clone(),
                    excerpt,
                });
            }
        }
        for source in &mut summary.sources {
            source.approx_secs = source.captures * buffer.interval_secs;
        }
        summary
    }
}

/// First 100 characters, with "..." appended when cut.
pub fn excerpt(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::ActivityEntry;

    fn entry(label: &str, text: &str) -> ActivityEntry {
        ActivityEntry {
            timestamp: Utc::now(),
            source_label: label.into(),
            extracted_text: text.into(),
            is_comprehensible: true,
            score: 1.0,
        }
    }

    #[test]
    fn sources_are_counted_in_capture_intervals() {
        let buffer = ActivityBuffer {
            entries: vec![
                entry("Editor", "write the report"),
                entry("Browser", "read the paper"),
                entry("Editor", "write the summary"),
            ],
            discarded: 2,
            failures: 1,
            degraded: false,
            interval_secs: 30,
        };
        let summary = ActivitySummary::summarize(&buffer);
        assert_eq!(summary.samples_kept, 3);
        assert_eq!(summary.samples_discarded, 2);
        assert_eq!(summary.sources[0].label, "Editor");
        assert_eq!(summary.sources[0].approx_secs, 60);
        assert_eq!(summary.sources[1].approx_secs, 30);
        assert_eq!(summary.highlights.len(), 3);
    }

    #[test]
    fn repeated_text_is_one_highlight() {
        let buffer = ActivityBuffer {
            entries: vec![entry("Editor", "same text"), entry("Editor", "same text")],
            interval_secs: 5,
            ..ActivityBuffer::default()
        };
        assert_eq!(ActivitySummary::summarize(&buffer).highlights.len(), 1);
    }

    #[test]
    fn excerpt_truncates_at_100_chars() {
        let long = "a".repeat(150);
        let cut = excerpt(&long);
        assert_eq!(cut.len(), 103);
        assert!(cut.ends_with("..."));
        assert_eq!(excerpt("short"), "short");
        assert_eq!(excerpt(&"b".repeat(100)), "b".repeat(100));
    }
}
