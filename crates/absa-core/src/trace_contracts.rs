use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::leakage::{ensure_no_leakage, FORBIDDEN_RAW_KEYS};
use crate::memory_contracts::{
    default_schema_version_string, to_json_value, validate_unit_interval, AdvisoryBundle,
    Condition, ContractError, InputSignature, MemoryMode, StageSnapshot,
};

pub const MAX_DEBATE_MESSAGE_CHARS: usize = 600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunMeta {
    pub run_id: String,
    pub condition: Condition,
    pub seed: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mode: Option<MemoryMode>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DebateStance {
    Pro,
    Con,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DebateTurn {
    pub round: u32,
    pub speaker: String,
    pub stance: DebateStance,
    pub message: String,
    #[serde(default = "default_turn_confidence")]
    pub confidence: f64,
}

fn default_turn_confidence() -> f64 {
    0.5
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrievalRecord {
    pub k: u8,
    pub hit: bool,
    #[serde(default)]
    pub returned_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RiskRecord {
    #[serde(default)]
    pub flagged: bool,
    #[serde(default)]
    pub residual: bool,
    #[serde(default)]
    pub severity_before: f64,
    #[serde(default)]
    pub severity_after: f64,
    #[serde(default)]
    pub tags_before: Vec<String>,
    #[serde(default)]
    pub tags_after: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverrideChange {
    pub aspect: String,
    pub from_polarity: String,
    pub to_polarity: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverrideRecord {
    #[serde(default)]
    pub eligible: bool,
    #[serde(default)]
    pub applied: bool,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub harm: bool,
    #[serde(default)]
    pub accepted_changes: Vec<OverrideChange>,
    #[serde(default)]
    pub rejected_changes: Vec<OverrideChange>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoverageRecord {
    #[serde(default)]
    pub risk_to_principle: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub hit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaseTrace {
    #[serde(default = "default_schema_version_string")]
    pub schema_version: String,
    pub run_meta: RunMeta,
    pub case_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_index: Option<u64>,
    pub input_signature: InputSignature,
    pub stage1_output: StageSnapshot,
    #[serde(default)]
    pub debate_log: Vec<DebateTurn>,
    pub memory_bundle: AdvisoryBundle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalRecord>,
    pub final_output: StageSnapshot,
    #[serde(default)]
    pub risk: RiskRecord,
    #[serde(default, rename = "override")]
    pub override_record: OverrideRecord,
    #[serde(default)]
    pub coverage: CoverageRecord,
}

impl CaseTrace {
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.case_id.trim().is_empty() {
            return Err(ContractError::Empty { field: "case_id" });
        }
        self.input_signature.validate()?;
        self.stage1_output.validate()?;
        self.final_output.validate()?;
        self.memory_bundle.validate()?;

        for turn in &self.debate_log {
            if turn.round < 1 {
                return Err(ContractError::InvalidTrace {
                    reason: format!("debate round must be >= 1 (speaker {})", turn.speaker),
                });
            }
            let chars = turn.message.chars().count();
            if chars > MAX_DEBATE_MESSAGE_CHARS {
                return Err(ContractError::TooLong {
                    field: "debate_log.message",
                    max: MAX_DEBATE_MESSAGE_CHARS,
                    actual: chars,
                });
            }
            validate_unit_interval("debate_log.confidence", turn.confidence)?;
        }

        for change in self
            .override_record
            .accepted_changes
            .iter()
            .chain(self.override_record.rejected_changes.iter())
        {
            if change.reasoning.trim().is_empty() {
                return Err(ContractError::InvalidTrace {
                    reason: format!("override change for `{}` lacks reasoning", change.aspect),
                });
            }
        }

        ensure_no_leakage(&to_json_value(self)?, &FORBIDDEN_RAW_KEYS)
    }
}
