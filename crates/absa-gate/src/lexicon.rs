use absa_core::memory_contracts::{canonical_payload_hash, ContractError};
use absa_core::stage_outputs::{normalize_term, AspectSpan, ExtractedAspect};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::GateError;

const DEFAULT_ALLOW_TERMS: [&str; 16] = [
    "ui", "ux", "앱", "폰", "맛", "값", "양", "질", "색", "핏", "창", "키", "펜", "뷰", "팬", "줄",
];

const DEFAULT_STOPWORDS: [&str; 24] = [
    "그냥", "진짜", "정말", "너무", "완전", "약간", "그거", "이거", "저거", "것", "거", "부분", "느낌",
    "생각", "하나", "뭔가", "the", "a", "an", "it", "this", "that", "thing", "stuff",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Empty,
    TooShort,
    Stopword,
    AlignmentFailure,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::Empty => "empty",
            DropReason::TooShort => "too_short",
            DropReason::Stopword => "stopword",
            DropReason::AlignmentFailure => "alignment_failure",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlignmentLexicon {
    #[serde(default)]
    pub allow_terms: BTreeSet<String>,
    #[serde(default)]
    pub stopwords: BTreeSet<String>,
}

impl Default for AlignmentLexicon {
    fn default() -> Self {
        Self {
            allow_terms: DEFAULT_ALLOW_TERMS.iter().map(|t| t.to_string()).collect(),
            stopwords: DEFAULT_STOPWORDS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl AlignmentLexicon {
    pub fn from_yaml_str(raw: &str) -> Result<Self, GateError> {
        let mut lexicon: Self = serde_yaml::from_str(raw)?;
        lexicon.allow_terms = lexicon.allow_terms.iter().map(|t| normalize_term(t)).collect();
        lexicon.stopwords = lexicon.stopwords.iter().map(|t| normalize_term(t)).collect();
        Ok(lexicon)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, GateError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| GateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn fingerprint(&self) -> Result<String, ContractError> {
        canonical_payload_hash(self)
    }

    pub fn drop_reason(&self, aspect: &ExtractedAspect, text: &str) -> Option<DropReason> {
        let term = aspect.term.trim();
        if term.is_empty() {
            return Some(DropReason::Empty);
        }
        let normalized = normalize_term(term);
        if !self.allow_terms.contains(&normalized) {
            if term.chars().count() < 2 {
                return Some(DropReason::TooShort);
            }
            if self.stopwords.contains(&normalized) {
                return Some(DropReason::Stopword);
            }
        }
        match aspect.span {
            Some(span) if !text.is_empty() && !span_matches(text, span, term) => {
                Some(DropReason::AlignmentFailure)
            }
            _ => None,
        }
    }
}

// Spans are character offsets, end-exclusive.
fn span_matches(text: &str, span: AspectSpan, term: &str) -> bool {
    if span.end <= span.start || span.end > text.chars().count() {
        return false;
    }
    let sliced: String = text
        .chars()
        .skip(span.start)
        .take(span.end - span.start)
        .collect();
    sliced.trim() == term
}
