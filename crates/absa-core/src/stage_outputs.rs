use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::memory_contracts::ContractError;

pub const NEUTRAL_POLARITY: &str = "neutral";
const DEFAULT_RISK_SEVERITY: f64 = 1.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AspectSpan {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractedAspect {
    #[serde(default, alias = "aspect")]
    pub term: String,
    #[serde(default, deserialize_with = "deserialize_span")]
    pub span: Option<AspectSpan>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AteOutput {
    #[serde(default, deserialize_with = "deserialize_list_or_null")]
    pub aspects: Vec<ExtractedAspect>,
}

impl AteOutput {
    pub fn normalized_terms(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.aspects
            .iter()
            .map(|aspect| normalize_term(&aspect.term))
            .filter(|term| !term.is_empty())
            .filter(|term| seen.insert(term.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AspectSentiment {
    #[serde(default, alias = "aspect", deserialize_with = "deserialize_term")]
    pub aspect_term: String,
    #[serde(default, deserialize_with = "deserialize_string_or_null")]
    pub polarity: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AtsaOutput {
    #[serde(default, deserialize_with = "deserialize_list_or_null")]
    pub aspect_sentiments: Vec<AspectSentiment>,
}

impl AtsaOutput {
    pub fn polarity_map(&self) -> BTreeMap<String, String> {
        self.aspect_sentiments
            .iter()
            .filter(|sentiment| !normalize_term(&sentiment.aspect_term).is_empty())
            .map(|sentiment| {
                (
                    normalize_term(&sentiment.aspect_term),
                    normalize_polarity(&sentiment.polarity),
                )
            })
            .collect()
    }

    pub fn polarities_by_term(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut grouped: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for sentiment in &self.aspect_sentiments {
            let term = normalize_term(&sentiment.aspect_term);
            let polarity = normalize_polarity(&sentiment.polarity);
            if term.is_empty() || polarity.is_empty() {
                continue;
            }
            grouped.entry(term).or_default().insert(polarity);
        }
        grouped
    }

    pub fn has_polarity_conflict(&self) -> bool {
        self.polarities_by_term()
            .values()
            .any(|polarities| polarities.len() >= 2)
    }

    pub fn mean_confidence(&self) -> Option<f64> {
        let values: Vec<f64> = self
            .aspect_sentiments
            .iter()
            .filter_map(|sentiment| sentiment.confidence)
            .filter(|value| value.is_finite())
            .collect();
        if values.is_empty() {
            return None;
        }
        Some((values.iter().sum::<f64>() / values.len() as f64).clamp(0.0, 1.0))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StructuralRisk {
    #[serde(
        default,
        alias = "type",
        alias = "risk_id",
        deserialize_with = "deserialize_string_or_null"
    )]
    pub risk_type: String,
    #[serde(default = "default_severity", deserialize_with = "deserialize_severity")]
    pub severity: f64,
    #[serde(default, deserialize_with = "deserialize_string_or_null")]
    pub description: String,
}

fn default_severity() -> f64 {
    DEFAULT_RISK_SEVERITY
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrectionProposal {
    #[serde(default, alias = "target")]
    pub target_aspect: Option<String>,
    #[serde(default, alias = "type")]
    pub proposal_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_string_or_null")]
    pub rationale: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidatorOutput {
    #[serde(default, deserialize_with = "deserialize_list_or_null")]
    pub structural_risks: Vec<StructuralRisk>,
    #[serde(default, deserialize_with = "deserialize_list_or_null")]
    pub correction_proposals: Vec<CorrectionProposal>,
}

impl ValidatorOutput {
    pub fn has_structural_risk(&self) -> bool {
        !self.structural_risks.is_empty()
    }

    pub fn severity_sum(&self) -> f64 {
        self.structural_risks
            .iter()
            .map(|risk| risk.severity.max(0.0))
            .sum()
    }

    pub fn risk_tags(&self) -> Vec<String> {
        self.structural_risks
            .iter()
            .map(|risk| {
                let tag = risk.risk_type.trim();
                if tag.is_empty() {
                    "unspecified".to_string()
                } else {
                    tag.to_string()
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModeratorOutput {
    #[serde(default)]
    pub final_label: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub applied_rules: Vec<String>,
}

pub fn parse_stage_output<T>(value: Value) -> Result<T, ContractError>
where
    T: DeserializeOwned + Default,
{
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value).map_err(|err| ContractError::Serialization(err.to_string()))
}

pub fn normalize_term(term: &str) -> String {
    term.trim().to_lowercase()
}

pub fn normalize_polarity(polarity: &str) -> String {
    match polarity.trim().to_lowercase().as_str() {
        "pos" | "positive" => "positive".to_string(),
        "neg" | "negative" => "negative".to_string(),
        "neu" | "neutral" => NEUTRAL_POLARITY.to_string(),
        other => other.to_string(),
    }
}

fn deserialize_list_or_null<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

fn deserialize_string_or_null<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn deserialize_term<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(String::new()),
        Value::String(term) => Ok(term),
        Value::Object(object) => Ok(object
            .get("term")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()),
        _ => Err(serde::de::Error::custom(
            "expected string or object for aspect_term",
        )),
    }
}

fn deserialize_span<'de, D>(deserializer: D) -> Result<Option<AspectSpan>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let (start, end) = match &value {
        Value::Null => return Ok(None),
        Value::Object(object) => (object.get("start"), object.get("end")),
        Value::Array(items) if items.len() == 2 => (items.first(), items.get(1)),
        _ => return Err(serde::de::Error::custom("expected span object or pair")),
    };
    let start = start.and_then(Value::as_u64);
    let end = end.and_then(Value::as_u64);
    Ok(match (start, end) {
        (Some(start), Some(end)) => Some(AspectSpan {
            start: start as usize,
            end: end as usize,
        }),
        _ => None,
    })
}

fn deserialize_severity<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(number) => number.as_f64().unwrap_or(DEFAULT_RISK_SEVERITY).max(0.0),
        Value::String(label) => match label.trim().to_lowercase().as_str() {
            "low" => 1.0,
            "medium" | "mid" => 2.0,
            "high" => 3.0,
            "critical" => 4.0,
            _ => DEFAULT_RISK_SEVERITY,
        },
        _ => DEFAULT_RISK_SEVERITY,
    })
}
