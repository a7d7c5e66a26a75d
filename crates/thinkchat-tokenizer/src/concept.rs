//! Concept table and span detection.

use std::collections::{BTreeMap, BTreeSet};

use regex::{Regex, RegexBuilder};
use thinkchat_core::{Result, ThinkChatError};

/// Canonical concept key: words joined by `_`, upper-cased.
///
/// Names that differ only in case or spacing share one key, one id and one
/// concept token.
pub fn concept_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_uppercase()
}

/// Token string for a concept name: `[CONCEPT_<KEY>]`.
pub fn concept_token(name: &str) -> String {
    format!("[CONCEPT_{}]", concept_key(name))
}

/// A detected concept occurrence, byte offsets into the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConceptSpan {
    pub start: usize,
    pub end: usize,
    /// Canonical key of the matched concept.
    pub concept: String,
}

impl ConceptSpan {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

#[derive(Debug, Clone)]
struct ConceptEntry {
    /// Allocation order; ids are `base + ordinal`.
    ordinal: usize,
    terms: BTreeSet<String>,
}

/// Concept key -> related terms, with ids allocated after the subword range.
#[derive(Debug, Clone, Default)]
pub struct ConceptTable {
    base: u32,
    /// Keyed by [`concept_key`].
    concepts: BTreeMap<String, ConceptEntry>,
    /// One compiled alternation per concept, in key order.
    matchers: Vec<(String, Regex)>,
}

impl ConceptTable {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            ..Default::default()
        }
    }

    /// First concept id (the subword vocabulary size).
    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.concepts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty()
    }

    /// Register or extend a concept; returns its id.
    ///
    /// The id is fixed on first sight of the key. Terms accumulate by union,
    /// and the surface name itself is kept as a matchable term.
    pub fn add(&mut self, name: &str, related_terms: &[&str]) -> Result<u32> {
        let name = name.trim();
        let key = concept_key(name);
        if key.is_empty() {
            return Err(ThinkChatError::InvalidConfig(
                "concept name must not be empty".into(),
            ));
        }
        let next = self.concepts.len();
        let entry = self.concepts.entry(key).or_insert_with(|| ConceptEntry {
            ordinal: next,
            terms: BTreeSet::new(),
        });
        entry.terms.extend(
            std::iter::once(name)
                .chain(related_terms.iter().map(|t| t.trim()))
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        );
        let id = self.base + entry.ordinal as u32;
        self.rebuild_matchers()?;
        Ok(id)
    }

    /// Move every concept id to start at `base`, keeping allocation order.
    pub fn rebase(&mut self, base: u32) {
        self.base = base;
    }

    pub fn id(&self, name: &str) -> Option<u32> {
        self.concepts
            .get(&concept_key(name))
            .map(|entry| self.base + entry.ordinal as u32)
    }

    pub fn terms(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.concepts.get(&concept_key(name)).map(|entry| &entry.terms)
    }

    /// Concept key owning `id`, if any.
    pub fn name_of(&self, id: u32) -> Option<&str> {
        let ordinal = id.checked_sub(self.base)? as usize;
        self.concepts
            .iter()
            .find(|(_, entry)| entry.ordinal == ordinal)
            .map(|(name, _)| name.as_str())
    }

    /// Token string for `id`, if it is a concept id.
    pub fn token_of(&self, id: u32) -> Option<String> {
        self.name_of(id).map(concept_token)
    }

    pub fn is_concept_id(&self, id: u32) -> bool {
        id >= self.base && ((id - self.base) as usize) < self.concepts.len()
    }

    /// `(id, key)` pairs in id order.
    pub fn ids(&self) -> Vec<(u32, &str)> {
        let mut ids: Vec<(u32, &str)> = self
            .concepts
            .iter()
            .map(|(name, entry)| (self.base + entry.ordinal as u32, name.as_str()))
            .collect();
        ids.sort_by_key(|(id, _)| *id);
        ids
    }

    /// Non-overlapping concept spans sorted by start offset.
    ///
    /// Matching is case-insensitive and word-boundary anchored. When spans
    /// from different terms or concepts overlap, the earliest start wins,
    /// then the longest match, then the lexicographically smallest key.
    pub fn detect(&self, text: &str) -> Vec<ConceptSpan> {
        let mut candidates: Vec<ConceptSpan> = Vec::new();
        for (name, regex) in &self.matchers {
            for m in regex.find_iter(text) {
                if m.start() < m.end() {
                    candidates.push(ConceptSpan {
                        start: m.start(),
                        end: m.end(),
                        concept: name.clone(),
                    });
                }
            }
        }
        candidates.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then(b.len().cmp(&a.len()))
                .then(a.concept.cmp(&b.concept))
        });

        let mut accepted: Vec<ConceptSpan> = Vec::with_capacity(candidates.len());
        for span in candidates {
            // Candidates arrive by start, so only the last accepted span can overlap.
            if accepted.last().map_or(true, |last| span.start >= last.end) {
                accepted.push(span);
            }
        }
        accepted
    }

    fn rebuild_matchers(&mut self) -> Result<()> {
        let mut matchers = Vec::with_capacity(self.concepts.len());
        for (name, entry) in &self.concepts {
            let mut terms: Vec<&str> = entry.terms.iter().map(String::as_str).collect();
            terms.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
            terms.dedup();
            let alternatives: Vec<String> = terms.iter().map(|t| anchored(t)).collect();
            let regex = RegexBuilder::new(&alternatives.join("|"))
                .case_insensitive(true)
                .build()
                .map_err(|e| ThinkChatError::Other(format!("concept pattern for {}: {}", name, e)))?;
            matchers.push((name.clone(), regex));
        }
        self.matchers = matchers;
        Ok(())
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Escape `term`, adding `\b` at each end that is a word character.
fn anchored(term: &str) -> String {
    let mut pattern = String::new();
    if term.chars().next().is_some_and(is_word_char) {
        pattern.push_str(r"\b");
    }
    pattern.push_str(&regex::escape(term));
    if term.chars().last().is_some_and(is_word_char) {
        pattern.push_str(r"\b");
    }
    pattern
}
