use std::collections::HashMap;

use super::types::{ResearchUnitResult, SourceIndexEntry, SourceNote};

/// Deduplicated, numbered list of sources used for citations.
///
/// URLs are numbered in the order they are first seen, starting at 1. The
/// index only ever grows: extending it with new notes appends unseen URLs and
/// never renumbers existing ones.
#[derive(Debug, Clone, Default)]
pub struct SourceIndex {
    entries: Vec<SourceIndexEntry>,
    by_url: HashMap<String, usize>,
}

impl SourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_notes<'a>(notes: impl IntoIterator<Item = &'a SourceNote>) -> Self {
        let mut index = Self::new();
        index.extend(notes);
        index
    }

    /// Append unseen URLs; returns how many were added
    pub fn extend<'a>(&mut self, notes: impl IntoIterator<Item = &'a SourceNote>) -> usize {
        let before = self.entries.len();
        for note in notes {
            let url = note.source_url.trim();
            if url.is_empty() || self.by_url.contains_key(url) {
                continue;
            }
            let number = self.entries.len() + 1;
            self.by_url.insert(url.to_string(), number);
            self.entries.push(SourceIndexEntry {
                index: number.to_string(),
                title: if note.source_title.trim().is_empty() {
                    url.to_string()
                } else {
                    note.source_title.clone()
                },
                url: url.to_string(),
                source_type: note.source_type.clone(),
            });
        }
        self.entries.len() - before
    }

    /// Citation number for a URL
    pub fn index_of(&self, url: &str) -> Option<usize> {
        self.by_url.get(url.trim()).copied()
    }

    pub fn entries(&self) -> &[SourceIndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Every note from every result, in result order
pub fn collect_all_notes(results: &[ResearchUnitResult]) -> Vec<SourceNote> {
    results.iter().flat_map(|r| r.notes.iter().cloned()).collect()
}
