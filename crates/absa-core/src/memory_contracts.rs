use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::leakage::{ensure_no_leakage, FORBIDDEN_RAW_KEYS};

pub const SCHEMA_VERSION: &str = "1.1";
pub const EPISODE_ID_PREFIX: &str = "epi_";
pub const ADVISORY_ID_PREFIX: &str = "adv_";
pub const ID_MIN_DIGITS: usize = 6;
pub const DEFAULT_LANGUAGE: &str = "ko";

pub const MAX_RATIONALE_SUMMARY_CHARS: usize = 500;
pub const MAX_CORRECTIVE_PRINCIPLE_CHARS: usize = 400;
pub const MAX_ANTI_PATTERN_CHARS: usize = 200;
pub const MAX_ADVISORY_MESSAGE_CHARS: usize = 800;
pub const MAX_BUNDLE_ADVISORIES: usize = 3;
pub const MAX_BUNDLE_WARNINGS: usize = 5;
pub const MAX_TOPK: u8 = 3;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("forbidden raw-content key `{key}` at {path}")]
    Leakage { key: String, path: String },
    #[error("invalid {field}: {value}")]
    InvalidId { field: &'static str, value: String },
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("{field} exceeds {max} chars ({actual})")]
    TooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} holds {actual} items, max {max}")]
    Overflow {
        field: &'static str,
        max: usize,
        actual: usize,
    },
    #[error("advisory constraints must all be true")]
    ConstraintsRelaxed,
    #[error("bundle inconsistent: {reason}")]
    InconsistentBundle { reason: String },
    #[error("invalid case trace: {reason}")]
    InvalidTrace { reason: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Condition {
    #[serde(rename = "C1")]
    C1,
    #[serde(rename = "C2")]
    C2,
    #[serde(rename = "C2_silent")]
    C2Silent,
}

impl Default for Condition {
    fn default() -> Self {
        Self::C1
    }
}

impl Condition {
    pub const ALL: [Condition; 3] = [Condition::C1, Condition::C2, Condition::C2Silent];

    pub fn as_str(self) -> &'static str {
        match self {
            Condition::C1 => "C1",
            Condition::C2 => "C2",
            Condition::C2Silent => "C2_silent",
        }
    }

    pub fn normalize(input: &str) -> (Self, bool) {
        match input.parse::<Self>() {
            Ok(condition) => (condition, false),
            Err(_) => (Condition::C1, true),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Condition {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "C1" => Ok(Condition::C1),
            "C2" => Ok(Condition::C2),
            "C2_silent" => Ok(Condition::C2Silent),
            other => Err(format!("Unknown condition: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StructureTag {
    Negation,
    Contrast,
    Irony,
    None,
}

impl StructureTag {
    pub fn as_str(self) -> &'static str {
        match self {
            StructureTag::Negation => "negation",
            StructureTag::Contrast => "contrast",
            StructureTag::Irony => "irony",
            StructureTag::None => "none",
        }
    }
}

impl fmt::Display for StructureTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LengthBucket {
    Short,
    Medium,
    Long,
}

impl LengthBucket {
    pub fn from_char_count(count: usize) -> Self {
        if count < 50 {
            LengthBucket::Short
        } else if count < 200 {
            LengthBucket::Medium
        } else {
            LengthBucket::Long
        }
    }
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

fn default_structure() -> Vec<StructureTag> {
    vec![StructureTag::None]
}

pub fn default_schema_version_string() -> String {
    SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputSignature {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_structure")]
    pub detected_structure: Vec<StructureTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contrast_marker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_negation: Option<bool>,
    #[serde(default)]
    pub num_aspects: u32,
    pub length_bucket: LengthBucket,
}

impl InputSignature {
    pub fn structure_set(&self) -> BTreeSet<StructureTag> {
        self.detected_structure.iter().copied().collect()
    }

    pub fn is_unstructured(&self) -> bool {
        let tags = self.structure_set();
        tags.len() == 1 && tags.contains(&StructureTag::None)
    }

    pub fn validate(&self) -> Result<(), ContractError> {
        if self.detected_structure.is_empty() {
            return Err(ContractError::Empty {
                field: "detected_structure",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageSnapshot {
    #[serde(default)]
    pub aspects_norm: Vec<String>,
    #[serde(default)]
    pub polarities: BTreeMap<String, String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

impl Default for StageSnapshot {
    fn default() -> Self {
        Self {
            aspects_norm: Vec::new(),
            polarities: BTreeMap::new(),
            confidence: default_confidence(),
        }
    }
}

impl StageSnapshot {
    pub fn validate(&self) -> Result<(), ContractError> {
        validate_unit_interval("confidence", self.confidence)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaseSummary {
    pub target_aspect_type: String,
    pub symptom: String,
    pub rationale_summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageSnapshots {
    pub stage1: StageSnapshot,
    #[serde(rename = "final")]
    pub final_snapshot: StageSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Correction {
    pub corrective_principle: String,
    pub applicable_conditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anti_pattern: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RiskVector {
    #[serde(default)]
    pub severity_sum: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    pub risk_before: RiskVector,
    pub risk_after: RiskVector,
    #[serde(default)]
    pub override_applied: bool,
    #[serde(default)]
    pub override_success: bool,
    #[serde(default)]
    pub override_harm: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Provenance {
    pub created_from_split: String,
    #[serde(default)]
    pub used_in_eval: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_schema_version_string")]
    pub version: String,
    #[serde(default)]
    pub has_gold: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeType {
    Success,
    Harm,
    Neutral,
}

impl EpisodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            EpisodeType::Success => "success",
            EpisodeType::Harm => "harm",
            EpisodeType::Neutral => "neutral",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpisodicMemoryEntry {
    #[serde(default = "default_schema_version_string")]
    pub schema_version: String,
    pub episode_id: String,
    pub episode_type: EpisodeType,
    #[serde(default = "default_error_category")]
    pub error_category: Vec<String>,
    pub input_signature: InputSignature,
    pub case_summary: CaseSummary,
    pub stage_snapshot: StageSnapshots,
    pub correction: Correction,
    pub evaluation: Evaluation,
    pub provenance: Provenance,
}

fn default_error_category() -> Vec<String> {
    vec!["none".to_string()]
}

impl EpisodicMemoryEntry {
    pub fn episode_number(&self) -> Option<u64> {
        parse_id_number(EPISODE_ID_PREFIX, &self.episode_id)
    }

    pub fn validate(&self) -> Result<(), ContractError> {
        if self.episode_number().is_none() {
            return Err(ContractError::InvalidId {
                field: "episode_id",
                value: self.episode_id.clone(),
            });
        }
        if self.error_category.is_empty() {
            return Err(ContractError::Empty {
                field: "error_category",
            });
        }
        self.input_signature.validate()?;
        validate_max_chars(
            "case_summary.rationale_summary",
            &self.case_summary.rationale_summary,
            MAX_RATIONALE_SUMMARY_CHARS,
        )?;
        validate_max_chars(
            "correction.corrective_principle",
            &self.correction.corrective_principle,
            MAX_CORRECTIVE_PRINCIPLE_CHARS,
        )?;
        if let Some(anti_pattern) = self.correction.anti_pattern.as_deref() {
            validate_max_chars(
                "correction.anti_pattern",
                anti_pattern,
                MAX_ANTI_PATTERN_CHARS,
            )?;
        }
        if self.correction.applicable_conditions.is_empty() {
            return Err(ContractError::Empty {
                field: "correction.applicable_conditions",
            });
        }
        self.stage_snapshot.stage1.validate()?;
        self.stage_snapshot.final_snapshot.validate()?;
        for (field, risk) in [
            ("evaluation.risk_before.severity_sum", &self.evaluation.risk_before),
            ("evaluation.risk_after.severity_sum", &self.evaluation.risk_after),
        ] {
            if !(risk.severity_sum >= 0.0) {
                return Err(ContractError::OutOfRange {
                    field,
                    value: risk.severity_sum,
                });
            }
        }
        ensure_no_leakage(&to_json_value(self)?, &FORBIDDEN_RAW_KEYS)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryType {
    SuccessfulOverride,
    FailedOverrideWarning,
    ConsistencyAnchor,
}

impl From<EpisodeType> for AdvisoryType {
    fn from(episode_type: EpisodeType) -> Self {
        match episode_type {
            EpisodeType::Success => AdvisoryType::SuccessfulOverride,
            EpisodeType::Harm => AdvisoryType::FailedOverrideWarning,
            EpisodeType::Neutral => AdvisoryType::ConsistencyAnchor,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryStrength {
    Weak,
    Moderate,
    Strong,
}

impl Default for AdvisoryStrength {
    fn default() -> Self {
        Self::Weak
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AdvisoryStats {
    pub historical_count: u32,
    pub consistency_score: f64,
    pub variance: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AdvisoryEvidence {
    pub source_episode_ids: Vec<String>,
    #[serde(default)]
    pub risk_tags: Vec<String>,
    #[serde(default)]
    pub principle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_before_tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_after_tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<AdvisoryStats>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdvisoryConstraints {
    pub no_label_hint: bool,
    pub no_forcing: bool,
    pub no_confidence_boost: bool,
}

impl AdvisoryConstraints {
    pub const fn enforced() -> Self {
        Self {
            no_label_hint: true,
            no_forcing: true,
            no_confidence_boost: true,
        }
    }

    pub fn is_enforced(&self) -> bool {
        self.no_label_hint && self.no_forcing && self.no_confidence_boost
    }
}

impl Default for AdvisoryConstraints {
    fn default() -> Self {
        Self::enforced()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Advisory {
    pub advisory_id: String,
    pub advisory_type: AdvisoryType,
    pub message: String,
    pub strength: AdvisoryStrength,
    pub relevance_score: f64,
    pub evidence: AdvisoryEvidence,
    #[serde(default)]
    pub constraints: AdvisoryConstraints,
}

impl Advisory {
    pub fn validate(&self) -> Result<(), ContractError> {
        if parse_id_number(ADVISORY_ID_PREFIX, &self.advisory_id).is_none() {
            return Err(ContractError::InvalidId {
                field: "advisory_id",
                value: self.advisory_id.clone(),
            });
        }
        validate_max_chars("message", &self.message, MAX_ADVISORY_MESSAGE_CHARS)?;
        validate_unit_interval("relevance_score", self.relevance_score)?;
        if !self.constraints.is_enforced() {
            return Err(ContractError::ConstraintsRelaxed);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    Off,
    On,
    Silent,
}

impl MemoryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryMode::Off => "off",
            MemoryMode::On => "on",
            MemoryMode::Silent => "silent",
        }
    }
}

impl fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleMeta {
    pub memory_mode: MemoryMode,
    pub topk: u8,
    pub masked_injection: bool,
    pub retrieval_executed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdvisoryBundle {
    pub memory_on: bool,
    #[serde(default)]
    pub retrieved: Vec<Advisory>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub meta: BundleMeta,
}

impl AdvisoryBundle {
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.retrieved.len() > MAX_BUNDLE_ADVISORIES {
            return Err(ContractError::Overflow {
                field: "retrieved",
                max: MAX_BUNDLE_ADVISORIES,
                actual: self.retrieved.len(),
            });
        }
        if self.warnings.len() > MAX_BUNDLE_WARNINGS {
            return Err(ContractError::Overflow {
                field: "warnings",
                max: MAX_BUNDLE_WARNINGS,
                actual: self.warnings.len(),
            });
        }
        if self.meta.topk > MAX_TOPK {
            return Err(ContractError::Overflow {
                field: "meta.topk",
                max: MAX_TOPK as usize,
                actual: self.meta.topk as usize,
            });
        }
        let expected_on = self.meta.memory_mode == MemoryMode::On && !self.meta.masked_injection;
        if self.memory_on != expected_on {
            return Err(ContractError::InconsistentBundle {
                reason: format!(
                    "memory_on={} but mode={} masked={}",
                    self.memory_on, self.meta.memory_mode, self.meta.masked_injection
                ),
            });
        }
        if self.meta.masked_injection && !self.retrieved.is_empty() {
            return Err(ContractError::InconsistentBundle {
                reason: "masked bundle carries advisories".to_string(),
            });
        }
        for advisory in &self.retrieved {
            advisory.validate()?;
        }
        Ok(())
    }
}

pub fn format_episode_id(number: u64) -> String {
    format!("{EPISODE_ID_PREFIX}{number:06}")
}

pub fn format_advisory_id(number: u64) -> String {
    format!("{ADVISORY_ID_PREFIX}{number:06}")
}

pub fn parse_id_number(prefix: &str, id: &str) -> Option<u64> {
    let digits = id.strip_prefix(prefix)?;
    if digits.len() < ID_MIN_DIGITS || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn validate_unit_interval(field: &'static str, value: f64) -> Result<(), ContractError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ContractError::OutOfRange { field, value });
    }
    Ok(())
}

fn validate_max_chars(field: &'static str, value: &str, max: usize) -> Result<(), ContractError> {
    let actual = value.chars().count();
    if actual > max {
        return Err(ContractError::TooLong { field, max, actual });
    }
    Ok(())
}

pub fn to_json_value<T: Serialize>(value: &T) -> Result<Value, ContractError> {
    serde_json::to_value(value).map_err(|err| ContractError::Serialization(err.to_string()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let canonical = canonicalize_value(to_json_value(value)?);
    serde_json::to_string(&canonical).map_err(|err| ContractError::Serialization(err.to_string()))
}

pub fn canonical_payload_hash<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let rendered = canonical_json(value)?;
    Ok(sha256_hex(rendered.as_bytes()))
}

fn canonicalize_value(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object.into_iter().collect();
            entries.sort_by(|left, right| left.0.cmp(&right.0));

            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize_value(value));
            }
            Value::Object(sorted)
        }
        Value::Array(values) => Value::Array(values.into_iter().map(canonicalize_value).collect()),
        scalar => scalar,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    pub(crate) fn sample_entry(episode_id: &str) -> EpisodicMemoryEntry {
        EpisodicMemoryEntry {
            schema_version: SCHEMA_VERSION.to_string(),
            episode_id: episode_id.to_string(),
            episode_type: EpisodeType::Harm,
            error_category: vec!["polarity_conflict".to_string()],
            input_signature: InputSignature {
                language: "ko".to_string(),
                detected_structure: vec![StructureTag::Negation],
                contrast_marker: None,
                has_negation: Some(true),
                num_aspects: 1,
                length_bucket: LengthBucket::Short,
            },
            case_summary: CaseSummary {
                target_aspect_type: "explicit".to_string(),
                symptom: "polarity_conflict".to_string(),
                rationale_summary: "negated praise flips polarity".to_string(),
            },
            stage_snapshot: StageSnapshots {
                stage1: StageSnapshot::default(),
                final_snapshot: StageSnapshot::default(),
            },
            correction: Correction {
                corrective_principle: "check negation scope before assigning polarity".to_string(),
                applicable_conditions: vec!["negation".to_string()],
                principle_id: None,
                anti_pattern: None,
            },
            evaluation: Evaluation::default(),
            provenance: Provenance {
                created_from_split: "valid".to_string(),
                used_in_eval: false,
                timestamp: Utc
                    .with_ymd_and_hms(2025, 3, 1, 12, 0, 0)
                    .single()
                    .expect("valid timestamp"),
                version: SCHEMA_VERSION.to_string(),
                has_gold: false,
            },
        }
    }

    #[test]
    fn condition_parse_and_normalize() {
        assert_eq!("C2_silent".parse::<Condition>(), Ok(Condition::C2Silent));
        assert_eq!(Condition::normalize("C2"), (Condition::C2, false));
        assert_eq!(Condition::normalize("c3"), (Condition::C1, true));
        assert_eq!(
            serde_json::to_string(&Condition::C2Silent).expect("serialize"),
            "\"C2_silent\""
        );
    }

    #[test]
    fn ids_require_prefix_and_six_digits() {
        assert_eq!(format_episode_id(7), "epi_000007");
        assert_eq!(parse_id_number(EPISODE_ID_PREFIX, "epi_000007"), Some(7));
        assert_eq!(parse_id_number(EPISODE_ID_PREFIX, "epi_1234567"), Some(1_234_567));
        assert_eq!(parse_id_number(EPISODE_ID_PREFIX, "epi_12345"), None);
        assert_eq!(parse_id_number(EPISODE_ID_PREFIX, "adv_000001"), None);
        assert_eq!(parse_id_number(ADVISORY_ID_PREFIX, "adv_00000x"), None);
    }

    #[test]
    fn length_bucket_thresholds() {
        assert_eq!(LengthBucket::from_char_count(0), LengthBucket::Short);
        assert_eq!(LengthBucket::from_char_count(49), LengthBucket::Short);
        assert_eq!(LengthBucket::from_char_count(50), LengthBucket::Medium);
        assert_eq!(LengthBucket::from_char_count(199), LengthBucket::Medium);
        assert_eq!(LengthBucket::from_char_count(200), LengthBucket::Long);
    }

    #[test]
    fn entry_serializes_final_snapshot_under_final_key() {
        let value = to_json_value(&sample_entry("epi_000001")).expect("serialize");
        assert!(value["stage_snapshot"].get("final").is_some());
        assert_eq!(value["schema_version"], json!("1.1"));
        assert_eq!(value["input_signature"]["detected_structure"], json!(["negation"]));
    }

    #[test]
    fn entry_validation_rejects_bad_ids_and_lengths() {
        sample_entry("epi_000001").validate().expect("sample is valid");

        let err = sample_entry("episode-1").validate().expect_err("bad id");
        assert!(matches!(err, ContractError::InvalidId { field: "episode_id", .. }));

        let mut long = sample_entry("epi_000002");
        long.correction.corrective_principle = "x".repeat(401);
        let err = long.validate().expect_err("principle too long");
        assert!(matches!(err, ContractError::TooLong { max: 400, .. }));

        let mut empty = sample_entry("epi_000003");
        empty.correction.applicable_conditions.clear();
        assert!(matches!(
            empty.validate(),
            Err(ContractError::Empty { .. })
        ));
    }

    #[test]
    fn missing_signature_language_defaults_to_korean() {
        let signature: InputSignature =
            serde_json::from_value(json!({"length_bucket": "short"})).expect("deserialize");
        assert_eq!(signature.language, "ko");
        assert_eq!(signature.detected_structure, vec![StructureTag::None]);
        assert!(signature.is_unstructured());
    }

    #[test]
    fn advisory_with_relaxed_constraints_fails_validation() {
        let mut advisory = Advisory {
            advisory_id: format_advisory_id(1),
            advisory_type: AdvisoryType::ConsistencyAnchor,
            message: "keep polarity stable".to_string(),
            strength: AdvisoryStrength::Weak,
            relevance_score: 0.4,
            evidence: AdvisoryEvidence::default(),
            constraints: AdvisoryConstraints::enforced(),
        };
        advisory.validate().expect("enforced advisory is valid");

        advisory.constraints.no_forcing = false;
        assert!(matches!(
            advisory.validate(),
            Err(ContractError::ConstraintsRelaxed)
        ));
    }

    #[test]
    fn bundle_memory_on_must_match_mode_and_mask() {
        let bundle = AdvisoryBundle {
            memory_on: true,
            retrieved: vec![],
            warnings: vec![],
            meta: BundleMeta {
                memory_mode: MemoryMode::Silent,
                topk: 3,
                masked_injection: true,
                retrieval_executed: true,
            },
        };
        assert!(matches!(
            bundle.validate(),
            Err(ContractError::InconsistentBundle { .. })
        ));
    }

    #[test]
    fn canonical_hash_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 1}});
        let b = json!({"a": {"x": 1, "y": 2}, "b": 1});
        assert_eq!(
            canonical_payload_hash(&a).expect("hash"),
            canonical_payload_hash(&b).expect("hash")
        );
        assert_eq!(
            canonical_json(&a).expect("canonical"),
            "{\"a\":{\"x\":1,\"y\":2},\"b\":1}"
        );
    }
}
