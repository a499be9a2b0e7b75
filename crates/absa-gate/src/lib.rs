pub mod lexicon;

use absa_core::stage_outputs::{
    normalize_polarity, AteOutput, AtsaOutput, ValidatorOutput, NEUTRAL_POLARITY,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub use lexicon::{AlignmentLexicon, DropReason};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("failed to read lexicon {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid lexicon yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct StageOneSignals<'a> {
    pub text: &'a str,
    pub ate: &'a AteOutput,
    pub atsa: &'a AtsaOutput,
    pub validator: &'a ValidatorOutput,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AspectFilterReport {
    pub total: usize,
    pub kept: usize,
    pub drops: BTreeMap<DropReason, usize>,
}

impl AspectFilterReport {
    pub fn dropped(&self) -> usize {
        self.drops.values().sum()
    }

    pub fn alignment_failures(&self) -> usize {
        self.drops
            .get(&DropReason::AlignmentFailure)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_explicit_grounding_failure(&self) -> bool {
        self.total > 0 && self.kept == 0 && self.alignment_failures() == self.total
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    Conflict,
    Validator,
    Alignment,
    NeutralOnly,
    ExplicitGroundingFailure,
}

impl GateReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GateReason::Conflict => "conflict",
            GateReason::Validator => "validator",
            GateReason::Alignment => "alignment",
            GateReason::NeutralOnly => "neutral_only",
            GateReason::ExplicitGroundingFailure => "explicit_grounding_failure",
        }
    }
}

impl fmt::Display for GateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct GateDecision {
    pub fired: bool,
    pub reason: Option<GateReason>,
}

impl GateDecision {
    fn from_reason(reason: Option<GateReason>) -> Self {
        Self {
            fired: reason.is_some(),
            reason,
        }
    }

    pub fn reason_str(&self) -> Option<&'static str> {
        self.reason.map(GateReason::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GateSignals {
    conflict: bool,
    validator: bool,
    alignment_failures: usize,
    neutral_only: bool,
    explicit_grounding_failure: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InjectionGate {
    lexicon: AlignmentLexicon,
}

impl InjectionGate {
    pub fn new(lexicon: AlignmentLexicon) -> Self {
        Self { lexicon }
    }

    pub fn lexicon(&self) -> &AlignmentLexicon {
        &self.lexicon
    }

    pub fn filter_aspects(&self, text: &str, ate: &AteOutput) -> AspectFilterReport {
        let mut report = AspectFilterReport {
            total: ate.aspects.len(),
            ..AspectFilterReport::default()
        };
        for aspect in &ate.aspects {
            match self.lexicon.drop_reason(aspect, text) {
                Some(reason) => *report.drops.entry(reason).or_insert(0) += 1,
                None => report.kept += 1,
            }
        }
        report
    }

    pub fn count_alignment_failure_drops(&self, text: &str, ate: &AteOutput) -> usize {
        self.filter_aspects(text, ate).alignment_failures()
    }

    // Debate-time gate. Priority: conflict, validator, alignment (>=2
    // drops), explicit grounding failure.
    pub fn should_inject_advisory_with_reason(&self, signals: StageOneSignals<'_>) -> GateDecision {
        let s = self.signals(signals);
        let reason = if s.conflict {
            Some(GateReason::Conflict)
        } else if s.validator {
            Some(GateReason::Validator)
        } else if s.alignment_failures >= 2 {
            Some(GateReason::Alignment)
        } else if s.explicit_grounding_failure {
            Some(GateReason::ExplicitGroundingFailure)
        } else {
            None
        };
        GateDecision::from_reason(reason)
    }

    // Stage-2 gate. Priority: validator, conflict, alignment (>=1 drop),
    // neutral-only, explicit grounding failure.
    pub fn should_inject_stage2_with_reason(&self, signals: StageOneSignals<'_>) -> GateDecision {
        let s = self.signals(signals);
        let reason = if s.validator {
            Some(GateReason::Validator)
        } else if s.conflict {
            Some(GateReason::Conflict)
        } else if s.alignment_failures >= 1 {
            Some(GateReason::Alignment)
        } else if s.neutral_only {
            Some(GateReason::NeutralOnly)
        } else if s.explicit_grounding_failure {
            Some(GateReason::ExplicitGroundingFailure)
        } else {
            None
        };
        GateDecision::from_reason(reason)
    }

    fn signals(&self, signals: StageOneSignals<'_>) -> GateSignals {
        let report = self.filter_aspects(signals.text, signals.ate);
        GateSignals {
            conflict: signals.atsa.has_polarity_conflict(),
            validator: signals.validator.has_structural_risk(),
            alignment_failures: report.alignment_failures(),
            neutral_only: is_neutral_only(signals.atsa),
            explicit_grounding_failure: report.is_explicit_grounding_failure(),
        }
    }
}

fn is_neutral_only(atsa: &AtsaOutput) -> bool {
    if atsa.aspect_sentiments.is_empty() {
        return false;
    }
    let non_neutral = atsa
        .aspect_sentiments
        .iter()
        .map(|sentiment| normalize_polarity(&sentiment.polarity))
        .filter(|polarity| !polarity.is_empty() && polarity != NEUTRAL_POLARITY)
        .count();
    non_neutral <= 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use absa_core::stage_outputs::parse_stage_output;
    use serde_json::json;

    struct Fixture {
        text: String,
        ate: AteOutput,
        atsa: AtsaOutput,
        validator: ValidatorOutput,
    }

    impl Fixture {
        fn new(
            text: &str,
            ate: serde_json::Value,
            atsa: serde_json::Value,
            validator: serde_json::Value,
        ) -> Self {
            Self {
                text: text.to_string(),
                ate: parse_stage_output(ate).expect("ate"),
                atsa: parse_stage_output(atsa).expect("atsa"),
                validator: parse_stage_output(validator).expect("validator"),
            }
        }

        fn signals(&self) -> StageOneSignals<'_> {
            StageOneSignals {
                text: &self.text,
                ate: &self.ate,
                atsa: &self.atsa,
                validator: &self.validator,
            }
        }
    }

    fn two_polarities() -> serde_json::Value {
        json!({"aspect_sentiments": [
            {"aspect_term": "배터리", "polarity": "positive"},
            {"aspect_term": "배터리", "polarity": "negative"},
            {"aspect_term": "화면", "polarity": "positive"},
        ]})
    }

    #[test]
    fn conflict_outranks_validator_in_debate_gate_only() {
        let fixture = Fixture::new(
            "배터리는 좋은데 배터리가 금방 닳아요",
            json!({"aspects": [{"term": "배터리", "span": [0, 3]}]}),
            two_polarities(),
            json!({"structural_risks": [{"type": "contrast_scope"}]}),
        );
        let gate = InjectionGate::default();

        let debate = gate.should_inject_advisory_with_reason(fixture.signals());
        assert!(debate.fired);
        assert_eq!(debate.reason, Some(GateReason::Conflict));

        let stage2 = gate.should_inject_stage2_with_reason(fixture.signals());
        assert_eq!(stage2.reason_str(), Some("validator"));
    }

    #[test]
    fn alignment_threshold_differs_between_gates() {
        let text = "화면이 선명하고 가격도 괜찮아요";
        let one_bad = Fixture::new(
            text,
            json!({"aspects": [
                {"term": "화면", "span": [0, 2]},
                {"term": "가격", "span": [0, 2]},
            ]}),
            json!({"aspect_sentiments": [
                {"aspect_term": "화면", "polarity": "positive"},
                {"aspect_term": "가격", "polarity": "positive"},
            ]}),
            json!({}),
        );
        let gate = InjectionGate::default();
        assert_eq!(gate.count_alignment_failure_drops(text, &one_bad.ate), 1);
        assert!(!gate.should_inject_advisory_with_reason(one_bad.signals()).fired);
        assert_eq!(
            gate.should_inject_stage2_with_reason(one_bad.signals()).reason,
            Some(GateReason::Alignment)
        );

        let two_bad = Fixture::new(
            text,
            json!({"aspects": [
                {"term": "화면", "span": [3, 5]},
                {"term": "가격", "span": [0, 2]},
                {"term": "선명", "span": [4, 6]},
            ]}),
            json!({"aspect_sentiments": [
                {"aspect_term": "화면", "polarity": "positive"},
                {"aspect_term": "가격", "polarity": "positive"},
            ]}),
            json!({}),
        );
        assert_eq!(
            gate.should_inject_advisory_with_reason(two_bad.signals()).reason,
            Some(GateReason::Alignment)
        );
    }

    #[test]
    fn neutral_only_fires_relaxed_gate_only() {
        let fixture = Fixture::new(
            "배송은 보통이고 포장은 괜찮아요",
            json!({"aspects": [{"term": "배송", "span": [0, 2]}, {"term": "포장", "span": [9, 11]}]}),
            json!({"aspect_sentiments": [
                {"aspect_term": "배송", "polarity": "neutral"},
                {"aspect_term": "포장", "polarity": "positive"},
            ]}),
            json!({}),
        );
        let gate = InjectionGate::default();
        assert!(!gate.should_inject_advisory_with_reason(fixture.signals()).fired);
        assert_eq!(
            gate.should_inject_stage2_with_reason(fixture.signals()).reason,
            Some(GateReason::NeutralOnly)
        );
    }

    #[test]
    fn no_sentiments_is_not_neutral_only() {
        let fixture = Fixture::new("좋아요", json!(null), json!(null), json!(null));
        let gate = InjectionGate::default();
        let decision = gate.should_inject_stage2_with_reason(fixture.signals());
        assert_eq!(decision, GateDecision::default());
    }

    #[test]
    fn single_misaligned_aspect_is_explicit_grounding_failure() {
        let fixture = Fixture::new(
            "디자인이 예뻐요",
            json!({"aspects": [{"term": "디자인", "span": [1, 4]}]}),
            json!({"aspect_sentiments": [
                {"aspect_term": "디자인", "polarity": "positive"},
                {"aspect_term": "색감", "polarity": "positive"},
            ]}),
            json!({}),
        );
        let gate = InjectionGate::default();
        let report = gate.filter_aspects(&fixture.text, &fixture.ate);
        assert!(report.is_explicit_grounding_failure());
        assert_eq!(
            gate.should_inject_advisory_with_reason(fixture.signals()).reason,
            Some(GateReason::ExplicitGroundingFailure)
        );
    }

    #[test]
    fn mixed_drop_reasons_are_not_grounding_failure() {
        let text = "진짜 디자인이 예뻐요";
        let ate: AteOutput = parse_stage_output(json!({"aspects": [
            {"term": "진짜", "span": [0, 2]},
            {"term": "디자인", "span": [0, 3]},
        ]}))
        .expect("ate");
        let report = InjectionGate::default().filter_aspects(text, &ate);
        assert_eq!(report.dropped(), 2);
        assert_eq!(report.drops.get(&DropReason::Stopword), Some(&1));
        assert!(!report.is_explicit_grounding_failure());
    }

    #[test]
    fn custom_lexicon_changes_drop_accounting() {
        let lexicon = AlignmentLexicon::from_yaml_str("allow_terms: []\nstopwords: []\n")
            .expect("lexicon");
        let gate = InjectionGate::new(lexicon);
        let ate: AteOutput =
            parse_stage_output(json!({"aspects": [{"term": "맛", "span": [0, 1]}]})).expect("ate");
        let report = gate.filter_aspects("맛있어요", &ate);
        assert_eq!(report.drops.get(&DropReason::TooShort), Some(&1));
    }
}
