//! Citation extraction and resolution against known files.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::CitationFragment;

/// A file reference found in model output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    /// The reference exactly as written, without brackets.
    pub reference: String,
    /// Resolved file id, `None` when no known file carries that name.
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cited_text: Option<String>,
}

/// Result of [`resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CitationResolution {
    pub citations: Vec<Citation>,
    /// Resolved ids, de-duplicated, in first-occurrence order.
    pub matched_file_ids: Vec<String>,
}

fn bracket_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\[([^\[\]\r\n]{1,255})\]").ok())
        .as_ref()
}

/// Whether a bracketed reference looks like `name.ext`.
///
/// `[1]`, `[1.2]` and `[example]` are not file names; `[report.pdf]` is.
pub fn looks_like_file_name(reference: &str) -> bool {
    let Some((stem, ext)) = reference.rsplit_once('.') else {
        return false;
    };
    let stem_ok = !stem.trim().is_empty()
        && !stem.ends_with(char::is_whitespace)
        && !stem.chars().all(|c| c.is_ascii_digit() || c == '.');
    let ext_ok = (1..=10).contains(&ext.len())
        && ext.starts_with(|c: char| c.is_ascii_alphabetic())
        && ext.chars().all(|c| c.is_ascii_alphanumeric());
    stem_ok && ext_ok
}

/// Bracketed file-name references in `text`, in order of appearance.
pub fn extract_references(text: &str) -> Vec<String> {
    let Some(pattern) = bracket_pattern() else {
        warn!("citation pattern failed to compile; no citations extracted");
        return Vec::new();
    };
    pattern
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|reference| looks_like_file_name(reference))
        .map(str::to_string)
        .collect()
}

/// Resolve the file references in `text` against a name to id map.
///
/// Matching is case-sensitive. Unmatched references stay in the output with
/// no id. Repeated references are reported once.
pub fn resolve(text: &str, file_ids_by_name: &HashMap<String, String>) -> CitationResolution {
    let mut resolution = CitationResolution::default();
    for reference in extract_references(text) {
        push_citation(&mut resolution, reference, None, file_ids_by_name);
    }
    resolution
}

fn push_citation(
    resolution: &mut CitationResolution,
    reference: String,
    cited_text: Option<String>,
    file_ids_by_name: &HashMap<String, String>,
) {
    if resolution
        .citations
        .iter()
        .any(|existing| existing.reference == reference)
    {
        return;
    }
    let file_id = file_ids_by_name.get(&reference).cloned();
    if let Some(id) = &file_id {
        if !resolution.matched_file_ids.contains(id) {
            resolution.matched_file_ids.push(id.clone());
        }
    }
    resolution.citations.push(Citation {
        reference,
        file_id,
        cited_text,
    });
}

/// Collects answer text and structured citation fragments across every turn
/// of a run, then resolves them once at completion.
#[derive(Debug, Default, Clone)]
pub struct CitationAccumulator {
    text: String,
    fragments: Vec<CitationFragment>,
}

impl CitationAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(text);
    }

    pub fn push_fragment(&mut self, fragment: CitationFragment) {
        self.fragments.push(fragment);
    }

    pub fn extend_fragments(&mut self, fragments: impl IntoIterator<Item = CitationFragment>) {
        self.fragments.extend(fragments);
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.fragments.is_empty()
    }

    /// Structured fragments first (they carry the cited text), then inline
    /// bracketed references from the answer.
    pub fn resolve(&self, file_ids_by_name: &HashMap<String, String>) -> CitationResolution {
        let mut resolution = CitationResolution::default();
        for fragment in &self.fragments {
            let Some(title) = fragment
                .document_title
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
            else {
                continue;
            };
            push_citation(
                &mut resolution,
                title.to_string(),
                fragment.cited_text.clone(),
                file_ids_by_name,
            );
        }
        for reference in extract_references(&self.text) {
            push_citation(&mut resolution, reference, None, file_ids_by_name);
        }
        resolution
    }
}
