pub mod advisory;
pub mod injection;
pub mod policy;
pub mod retriever;
pub mod signature;

use absa_core::memory_contracts::{
    format_episode_id, AdvisoryStrength, CaseSummary, Condition, ContractError, Correction,
    EpisodeType, EpisodicMemoryEntry, Evaluation, InputSignature, MemoryMode, Provenance,
    RiskVector, StageSnapshot, StageSnapshots, MAX_BUNDLE_WARNINGS, MAX_CORRECTIVE_PRINCIPLE_CHARS,
    MAX_RATIONALE_SUMMARY_CHARS, SCHEMA_VERSION,
};
use absa_core::stage_outputs::{AteOutput, AtsaOutput, ModeratorOutput, ValidatorOutput};
use absa_core::{truncate_chars, AdvisoryBundle};
use absa_gate::{AlignmentLexicon, GateError, GateReason, InjectionGate, StageOneSignals};
use absa_store::{MemoryStore, PruneConfig, StoreError};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use advisory::AdvisoryBuilder;
pub use injection::{ConditionProfile, InjectionController, SlotRequest, DEFAULT_SLOT_NAME};
pub use policy::{
    ConditionFlags, EffectivePolicy, LoadedPolicy, MemoryPolicy, PolicyError, DEFAULT_POLICY_PATH,
};
pub use retriever::{Retriever, RetrieverConfig, ScoredEpisode};
pub use signature::SignatureBuilder;

const NO_RISK_SYMPTOM: &str = "none";
const NO_CORRECTION: &str = "No correction";
const HARM_WARNING_PREFIX: &str = "similar_case_override_harm:";

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),
    #[error("gate error: {0}")]
    Gate(#[from] GateError),
}

#[derive(Debug, Clone, Copy)]
pub struct StageOutputs<'a> {
    pub ate: &'a AteOutput,
    pub atsa: &'a AtsaOutput,
    pub validator: &'a ValidatorOutput,
}

#[derive(Debug, Clone, Copy)]
pub struct CompletedSample<'a> {
    pub text: &'a str,
    pub text_id: &'a str,
    pub stage1: StageOutputs<'a>,
    pub stage2: StageOutputs<'a>,
    pub moderator: Option<&'a ModeratorOutput>,
    pub language_code: &'a str,
    pub split: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    pub condition: String,
    pub policy_path: Option<PathBuf>,
    pub store_path: Option<PathBuf>,
    pub keep_last_n: Option<usize>,
    pub topk: Option<i64>,
    pub slot_name: Option<String>,
    pub lexicon: Option<AlignmentLexicon>,
}

impl OrchestratorOptions {
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryMeta {
    pub condition: Condition,
    pub memory_mode: MemoryMode,
    pub retrieval_executed: bool,
    pub injection_mask: bool,
    pub exposed_to_debate: bool,
    pub topk: u8,
    pub retrieved_k: usize,
    pub retrieved_ids: Vec<String>,
    pub advisories_built: usize,
    pub gate_fired: bool,
    pub gate_reason: Option<GateReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotPayload {
    pub slot: BTreeMap<String, AdvisoryBundle>,
    pub memory_mode: MemoryMode,
    pub memory_meta: MemoryMeta,
}

impl SlotPayload {
    pub fn bundle(&self) -> Option<&AdvisoryBundle> {
        self.slot.values().next()
    }
}

pub struct EpisodicOrchestrator {
    condition: Condition,
    flags: ConditionFlags,
    profile: ConditionProfile,
    store: MemoryStore,
    signatures: SignatureBuilder,
    retriever: Retriever,
    advisories: AdvisoryBuilder,
    injection: InjectionController,
    gate: InjectionGate,
    topk: u8,
    next_episode: u64,
    effective: EffectivePolicy,
}

impl EpisodicOrchestrator {
    pub fn new(options: OrchestratorOptions) -> Result<Self, MemoryError> {
        let path = options
            .policy_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_POLICY_PATH));
        let loaded = MemoryPolicy::load(path)?;
        Self::with_policy(loaded, options)
    }

    pub fn with_policy(
        loaded: LoadedPolicy,
        options: OrchestratorOptions,
    ) -> Result<Self, MemoryError> {
        let (condition, normalized) = Condition::normalize(&options.condition);
        if normalized {
            warn!(
                event = "condition_normalized",
                input = %options.condition,
                condition = %condition
            );
        }

        let policy = &loaded.policy;
        let memory = policy.memory();
        let flags = policy.flags_for(condition);
        let profile = ConditionProfile::for_condition(condition);

        let store_path = options
            .store_path
            .clone()
            .unwrap_or_else(|| memory.store.path.clone());
        let prune = PruneConfig {
            enabled: memory.store.prune.enabled,
            keep_last_n: options
                .keep_last_n
                .unwrap_or(memory.store.prune.keep_last_n),
        };
        if memory.store.prune.strategy != crate::policy::DEFAULT_PRUNE_STRATEGY {
            warn!(
                event = "prune_strategy_unsupported",
                strategy = %memory.store.prune.strategy,
                "only fifo pruning is implemented"
            );
        }
        let store = MemoryStore::new(store_path, prune);

        let retriever = Retriever::new(RetrieverConfig {
            topk: options.topk.unwrap_or(memory.retrieval.topk),
            ..RetrieverConfig::default()
        });
        let topk = retriever.topk();
        let slot_name = options
            .slot_name
            .clone()
            .unwrap_or_else(|| memory.io.slot_memory_name.clone());

        let lexicon = match (options.lexicon.clone(), memory.gate.lexicon_path.as_ref()) {
            (Some(lexicon), _) => lexicon,
            (None, Some(path)) => AlignmentLexicon::load(resolve_beside(&loaded.path, path))?,
            (None, None) => AlignmentLexicon::default(),
        };

        // Conditions that never write must not depend on the store file.
        let next_episode = if flags.store_write {
            store.max_episode_number()?.unwrap_or(0) + 1
        } else {
            1
        };

        let effective = EffectivePolicy {
            condition,
            condition_input: options.condition.clone(),
            condition_normalized: normalized,
            policy_path: loaded.path.display().to_string(),
            policy_found: loaded.found,
            flags,
            memory_mode: profile.memory_mode,
            exposed_to_debate: exposed_to_debate(condition, flags),
            store_path: store.path().display().to_string(),
            prune_enabled: prune.enabled,
            prune_strategy: memory.store.prune.strategy.clone(),
            keep_last_n: prune.capacity(),
            retrieval_mode: memory.retrieval.mode.clone(),
            topk,
            slot_name: slot_name.clone(),
            lexicon_fingerprint: lexicon.fingerprint()?,
            policy_hash: String::new(),
        }
        .seal()?;
        info!(
            event = "memory_policy_resolved",
            condition = %condition,
            policy_found = loaded.found,
            retrieval_execute = flags.retrieval_execute,
            injection_mask = flags.injection_mask,
            store_write = flags.store_write,
            next_episode,
            policy_hash = %effective.policy_hash
        );

        Ok(Self {
            condition,
            flags,
            profile,
            store,
            signatures: SignatureBuilder::new(),
            retriever,
            advisories: AdvisoryBuilder::new(),
            injection: InjectionController::new(slot_name),
            gate: InjectionGate::new(lexicon),
            topk,
            next_episode,
            effective,
        })
    }

    pub fn condition(&self) -> Condition {
        self.condition
    }

    pub fn effective_policy(&self) -> &EffectivePolicy {
        &self.effective
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn gate(&self) -> &InjectionGate {
        &self.gate
    }

    pub fn next_episode_id(&self) -> String {
        format_episode_id(self.next_episode)
    }

    pub fn get_slot_payload_for_current_sample(
        &self,
        text: &str,
        stage1: StageOutputs<'_>,
        language_code: &str,
    ) -> Result<SlotPayload, MemoryError> {
        let signature = self.signature_for(text, stage1.ate, language_code);
        let retrieval_executed = self.flags.retrieval_execute && self.profile.retrieval_executed;
        let injection_mask = self.flags.injection_mask || self.profile.injection_mask;

        let decision = self.gate.should_inject_advisory_with_reason(StageOneSignals {
            text,
            ate: stage1.ate,
            atsa: stage1.atsa,
            validator: stage1.validator,
        });

        let entries = if retrieval_executed {
            self.store.load()?
        } else {
            Vec::new()
        };
        let hits = if retrieval_executed {
            self.retriever.retrieve_scored(&entries, &signature, Some(text))
        } else {
            Vec::new()
        };
        let retrieved_ids: Vec<String> =
            hits.iter().map(|hit| hit.episode_id.to_string()).collect();

        let mut request = SlotRequest {
            memory_mode: self.profile.memory_mode,
            retrieval_executed,
            injection_mask,
            retrieved: Vec::new(),
            warnings: Vec::new(),
            topk: i64::from(self.topk),
        };
        if !injection_mask {
            request.retrieved = self
                .advisories
                .build_from_retrieved(&hits, AdvisoryStrength::Weak);
            request.warnings = hits
                .iter()
                .filter(|hit| hit.entry.episode_type == EpisodeType::Harm)
                .map(|hit| format!("{HARM_WARNING_PREFIX}{}", hit.episode_id))
                .take(MAX_BUNDLE_WARNINGS)
                .collect();
        }
        let advisories_built = request.retrieved.len();
        let slot = self.injection.build_slot(request);

        let memory_meta = MemoryMeta {
            condition: self.condition,
            memory_mode: self.profile.memory_mode,
            retrieval_executed,
            injection_mask,
            exposed_to_debate: exposed_to_debate(self.condition, self.flags),
            topk: self.topk,
            retrieved_k: retrieved_ids.len(),
            retrieved_ids,
            advisories_built,
            gate_fired: decision.fired,
            gate_reason: decision.reason,
        };
        debug!(
            event = "slot_built",
            condition = %self.condition,
            memory_mode = %self.profile.memory_mode,
            retrieved_k = memory_meta.retrieved_k,
            advisories = advisories_built,
            gate_fired = decision.fired
        );

        Ok(SlotPayload {
            slot,
            memory_mode: self.profile.memory_mode,
            memory_meta,
        })
    }

    pub fn append_episode_if_needed(
        &mut self,
        sample: CompletedSample<'_>,
    ) -> Result<Option<String>, MemoryError> {
        if !self.flags.store_write {
            return Ok(None);
        }

        let episode_id = format_episode_id(self.next_episode);
        self.next_episode += 1;

        let signature = self.signature_for(sample.text, sample.stage1.ate, sample.language_code);
        let entry = build_episode(episode_id, signature, &sample);
        self.store.append(&entry)?;
        info!(
            event = "episode_appended",
            episode_id = %entry.episode_id,
            episode_type = entry.episode_type.as_str(),
            text_id = %sample.text_id,
            condition = %self.condition
        );
        Ok(Some(entry.episode_id))
    }

    fn signature_for(&self, text: &str, ate: &AteOutput, language_code: &str) -> InputSignature {
        let num_aspects = u32::try_from(ate.normalized_terms().len()).unwrap_or(u32::MAX);
        self.signatures.build(text, language_code, num_aspects)
    }
}

fn resolve_beside(policy_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match policy_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(path),
        _ => path.to_path_buf(),
    }
}

fn exposed_to_debate(condition: Condition, flags: ConditionFlags) -> bool {
    condition == Condition::C2 && !flags.injection_mask
}

fn build_episode(
    episode_id: String,
    signature: InputSignature,
    sample: &CompletedSample<'_>,
) -> EpisodicMemoryEntry {
    let stage1 = sample.stage1;
    let stage2 = sample.stage2;

    let symptom = stage1
        .validator
        .risk_tags()
        .into_iter()
        .next()
        .unwrap_or_else(|| NO_RISK_SYMPTOM.to_string());
    let rationale = stage1
        .validator
        .correction_proposals
        .first()
        .map(|proposal| proposal.rationale.trim())
        .filter(|rationale| !rationale.is_empty())
        .unwrap_or(NO_CORRECTION);
    let principle_id = stage1
        .validator
        .correction_proposals
        .first()
        .and_then(|proposal| proposal.proposal_type.clone())
        .filter(|kind| !kind.trim().is_empty());

    let mut error_category = stage1.validator.risk_tags();
    if error_category.is_empty() {
        error_category.push(NO_RISK_SYMPTOM.to_string());
    }
    let applicable_conditions = signature
        .detected_structure
        .iter()
        .map(|tag| tag.as_str().to_string())
        .collect();

    let stage1_snapshot = snapshot(stage1, None);
    let final_snapshot = snapshot(stage2, sample.moderator);

    let risk_before = RiskVector {
        severity_sum: stage1.validator.severity_sum(),
        tags: stage1.validator.risk_tags(),
    };
    let risk_after = RiskVector {
        severity_sum: stage2.validator.severity_sum(),
        tags: stage2.validator.risk_tags(),
    };
    let override_applied = stage1_snapshot.polarities != final_snapshot.polarities;
    let evaluation = Evaluation {
        override_applied,
        override_success: override_applied && risk_after.severity_sum < risk_before.severity_sum,
        override_harm: override_applied && risk_after.severity_sum > risk_before.severity_sum,
        risk_before,
        risk_after,
    };

    EpisodicMemoryEntry {
        schema_version: SCHEMA_VERSION.to_string(),
        episode_id,
        episode_type: if stage1.validator.has_structural_risk() {
            EpisodeType::Harm
        } else {
            EpisodeType::Success
        },
        error_category,
        case_summary: CaseSummary {
            target_aspect_type: if stage1.ate.aspects.is_empty() {
                "implicit".to_string()
            } else {
                "explicit".to_string()
            },
            symptom,
            rationale_summary: truncate_chars(rationale, MAX_RATIONALE_SUMMARY_CHARS),
        },
        input_signature: signature,
        stage_snapshot: StageSnapshots {
            stage1: stage1_snapshot,
            final_snapshot,
        },
        correction: Correction {
            corrective_principle: truncate_chars(rationale, MAX_CORRECTIVE_PRINCIPLE_CHARS),
            applicable_conditions,
            principle_id,
            anti_pattern: None,
        },
        evaluation,
        provenance: Provenance {
            created_from_split: sample.split.to_string(),
            used_in_eval: false,
            timestamp: Utc::now(),
            version: SCHEMA_VERSION.to_string(),
            has_gold: false,
        },
    }
}

fn snapshot(stage: StageOutputs<'_>, moderator: Option<&ModeratorOutput>) -> StageSnapshot {
    let confidence = stage
        .atsa
        .mean_confidence()
        .or_else(|| moderator.and_then(|moderator| moderator.confidence))
        .filter(|value| value.is_finite())
        .map(|value| value.clamp(0.0, 1.0))
        .unwrap_or(0.5);
    StageSnapshot {
        aspects_norm: stage.ate.normalized_terms(),
        polarities: stage.atsa.polarity_map(),
        confidence,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use absa_core::memory_contracts::{LengthBucket, StructureTag};
    use absa_core::stage_outputs::parse_stage_output;
    use chrono::TimeZone;
    use serde_json::json;

    pub(crate) fn episode(
        number: u64,
        language: &str,
        tags: &[StructureTag],
        symptom: &str,
        rationale: &str,
    ) -> EpisodicMemoryEntry {
        EpisodicMemoryEntry {
            schema_version: SCHEMA_VERSION.to_string(),
            episode_id: format_episode_id(number),
            episode_type: EpisodeType::Neutral,
            error_category: vec!["none".to_string()],
            input_signature: InputSignature {
                language: language.to_string(),
                detected_structure: tags.to_vec(),
                contrast_marker: None,
                has_negation: Some(tags.contains(&StructureTag::Negation)),
                num_aspects: 1,
                length_bucket: LengthBucket::Short,
            },
            case_summary: CaseSummary {
                target_aspect_type: "explicit".to_string(),
                symptom: symptom.to_string(),
                rationale_summary: rationale.to_string(),
            },
            stage_snapshot: StageSnapshots {
                stage1: StageSnapshot::default(),
                final_snapshot: StageSnapshot::default(),
            },
            correction: Correction {
                corrective_principle: "check the scope of negation before flipping polarity"
                    .to_string(),
                applicable_conditions: tags.iter().map(|tag| tag.as_str().to_string()).collect(),
                principle_id: Some("P-NEG-SCOPE".to_string()),
                anti_pattern: None,
            },
            evaluation: Evaluation {
                risk_before: RiskVector {
                    severity_sum: 2.0,
                    tags: vec![symptom.to_string()],
                },
                risk_after: RiskVector::default(),
                ..Evaluation::default()
            },
            provenance: Provenance {
                created_from_split: "valid".to_string(),
                used_in_eval: false,
                timestamp: Utc
                    .with_ymd_and_hms(2025, 3, 1, 0, 0, 0)
                    .single()
                    .expect("valid timestamp"),
                version: SCHEMA_VERSION.to_string(),
                has_gold: false,
            },
        }
    }

    #[test]
    fn episode_derivation_from_stage_outputs() {
        let ate: AteOutput =
            parse_stage_output(json!({"aspects": [{"term": "배터리", "span": [0, 3]}]}))
                .expect("ate");
        let atsa1: AtsaOutput = parse_stage_output(json!({"aspect_sentiments": [
            {"aspect_term": "배터리", "polarity": "positive", "confidence": 0.6}
        ]}))
        .expect("atsa1");
        let atsa2: AtsaOutput = parse_stage_output(json!({"aspect_sentiments": [
            {"aspect_term": "배터리", "polarity": "negative"}
        ]}))
        .expect("atsa2");
        let validator1: ValidatorOutput = parse_stage_output(json!({
            "structural_risks": [{"type": "negation_scope", "severity": "high"}],
            "correction_proposals": [{"type": "NEG_SCOPE", "rationale": "부정어 범위를 먼저 확인"}]
        }))
        .expect("validator1");
        let validator2 = ValidatorOutput::default();
        let moderator = ModeratorOutput {
            confidence: Some(0.9),
            ..ModeratorOutput::default()
        };

        let sample = CompletedSample {
            text: "배터리가 오래 가지 않아요",
            text_id: "t-1",
            stage1: StageOutputs {
                ate: &ate,
                atsa: &atsa1,
                validator: &validator1,
            },
            stage2: StageOutputs {
                ate: &ate,
                atsa: &atsa2,
                validator: &validator2,
            },
            moderator: Some(&moderator),
            language_code: "ko",
            split: "valid",
        };
        let signature = SignatureBuilder::new().build(sample.text, "ko", 1);
        let entry = build_episode(format_episode_id(4), signature, &sample);

        entry.validate().expect("derived episode is valid");
        assert_eq!(entry.episode_type, EpisodeType::Harm);
        assert_eq!(entry.case_summary.symptom, "negation_scope");
        assert_eq!(entry.case_summary.rationale_summary, "부정어 범위를 먼저 확인");
        assert_eq!(entry.correction.principle_id.as_deref(), Some("NEG_SCOPE"));
        assert_eq!(entry.correction.applicable_conditions, vec!["negation"]);
        assert_eq!(entry.error_category, vec!["negation_scope"]);
        assert!((entry.stage_snapshot.stage1.confidence - 0.6).abs() < 1e-9);
        assert!((entry.stage_snapshot.final_snapshot.confidence - 0.9).abs() < 1e-9);
        assert!(entry.evaluation.override_applied);
        assert!(entry.evaluation.override_success);
        assert!(!entry.evaluation.override_harm);
    }

    #[test]
    fn empty_signals_fall_back_to_sentinels() {
        let ate = AteOutput::default();
        let atsa = AtsaOutput::default();
        let validator = ValidatorOutput::default();
        let outputs = StageOutputs {
            ate: &ate,
            atsa: &atsa,
            validator: &validator,
        };
        let sample = CompletedSample {
            text: "좋아요",
            text_id: "t-2",
            stage1: outputs,
            stage2: outputs,
            moderator: None,
            language_code: "ko",
            split: "train",
        };
        let signature = SignatureBuilder::new().build(sample.text, "ko", 0);
        let entry = build_episode(format_episode_id(1), signature, &sample);

        entry.validate().expect("valid");
        assert_eq!(entry.episode_type, EpisodeType::Success);
        assert_eq!(entry.case_summary.symptom, "none");
        assert_eq!(entry.case_summary.rationale_summary, "No correction");
        assert_eq!(entry.case_summary.target_aspect_type, "implicit");
        assert_eq!(entry.error_category, vec!["none"]);
        assert_eq!(entry.stage_snapshot.final_snapshot.confidence, 0.5);
        assert!(!entry.evaluation.override_applied);
    }
}
