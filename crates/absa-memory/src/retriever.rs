use absa_core::memory_contracts::{EpisodicMemoryEntry, InputSignature, StructureTag, MAX_TOPK};
use regex::Regex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::OnceLock;

const STRUCTURE_WEIGHT: f64 = 0.7;
const LEXICAL_WEIGHT: f64 = 0.3;

pub fn clamp_topk(requested: i64) -> u8 {
    requested.clamp(1, i64::from(MAX_TOPK)) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrieverConfig {
    pub topk: i64,
    pub require_same_language: bool,
    pub require_structure_overlap: bool,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            topk: i64::from(MAX_TOPK),
            require_same_language: true,
            require_structure_overlap: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredEpisode<'a> {
    #[serde(skip)]
    pub entry: &'a EpisodicMemoryEntry,
    pub episode_id: &'a str,
    pub structure_overlap: usize,
    pub lexical_score: f64,
    pub relevance: f64,
}

// Signature retriever: structural tag overlap first, lexical token overlap
// as the tie-break, store order after that.
#[derive(Debug, Clone)]
pub struct Retriever {
    topk: u8,
    require_same_language: bool,
    require_structure_overlap: bool,
}

impl Default for Retriever {
    fn default() -> Self {
        Self::new(RetrieverConfig::default())
    }
}

impl Retriever {
    pub fn new(config: RetrieverConfig) -> Self {
        Self {
            topk: clamp_topk(config.topk),
            require_same_language: config.require_same_language,
            require_structure_overlap: config.require_structure_overlap,
        }
    }

    pub fn topk(&self) -> u8 {
        self.topk
    }

    pub fn retrieve<'a>(
        &self,
        entries: &'a [EpisodicMemoryEntry],
        query: &InputSignature,
        query_lexical: Option<&str>,
    ) -> Vec<&'a EpisodicMemoryEntry> {
        self.retrieve_scored(entries, query, query_lexical)
            .into_iter()
            .map(|hit| hit.entry)
            .collect()
    }

    pub fn retrieve_scored<'a>(
        &self,
        entries: &'a [EpisodicMemoryEntry],
        query: &InputSignature,
        query_lexical: Option<&str>,
    ) -> Vec<ScoredEpisode<'a>> {
        let query_tags = query.structure_set();
        let query_tokens = query_lexical.map(tokenize).unwrap_or_default();

        let mut hits: Vec<ScoredEpisode<'a>> = entries
            .iter()
            .filter(|entry| self.passes_filters(entry, query, &query_tags))
            .map(|entry| {
                let structure_overlap = entry
                    .input_signature
                    .structure_set()
                    .intersection(&query_tags)
                    .count();
                let lexical_score = lexical_overlap(&query_tokens, entry);
                let structure_ratio = if query_tags.is_empty() {
                    0.0
                } else {
                    structure_overlap as f64 / query_tags.len() as f64
                };
                ScoredEpisode {
                    entry,
                    episode_id: &entry.episode_id,
                    structure_overlap,
                    lexical_score,
                    relevance: (STRUCTURE_WEIGHT * structure_ratio
                        + LEXICAL_WEIGHT * lexical_score)
                        .clamp(0.0, 1.0),
                }
            })
            .collect();

        hits.sort_by(|left, right| {
            right
                .structure_overlap
                .cmp(&left.structure_overlap)
                .then_with(|| {
                    right
                        .lexical_score
                        .partial_cmp(&left.lexical_score)
                        .unwrap_or(Ordering::Equal)
                })
        });
        hits.truncate(usize::from(self.topk));
        hits
    }

    fn passes_filters(
        &self,
        entry: &EpisodicMemoryEntry,
        query: &InputSignature,
        query_tags: &BTreeSet<StructureTag>,
    ) -> bool {
        if self.require_same_language && entry.input_signature.language != query.language {
            return false;
        }
        if self.require_structure_overlap && !query_tags.is_empty() {
            let entry_tags = entry.input_signature.structure_set();
            let none_only = entry_tags.len() == 1 && entry_tags.contains(&StructureTag::None);
            if !none_only && entry_tags.is_disjoint(query_tags) {
                return false;
            }
        }
        true
    }
}

fn lexical_overlap(query_tokens: &BTreeSet<String>, entry: &EpisodicMemoryEntry) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let mut entry_tokens = tokenize(&entry.case_summary.symptom);
    entry_tokens.extend(tokenize(&entry.case_summary.rationale_summary));
    if entry_tokens.is_empty() {
        return 0.0;
    }
    let shared = query_tokens.intersection(&entry_tokens).count();
    (shared as f64 / query_tokens.len() as f64).min(1.0)
}

fn punctuation() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^\w\s]").expect("valid regex"))
}

fn tokenize(text: &str) -> BTreeSet<String> {
    let lowered = text.to_lowercase();
    punctuation()
        .replace_all(&lowered, " ")
        .split_whitespace()
        .filter(|token| token.chars().count() >= 2)
        .map(str::to_string)
        .collect()
}
