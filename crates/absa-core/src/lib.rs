pub mod leakage;
pub mod memory_contracts;
pub mod stage_outputs;
pub mod trace_contracts;

pub use leakage::{ensure_no_leakage, scan_for_forbidden_keys, LeakageHit, FORBIDDEN_RAW_KEYS};
pub use memory_contracts::{
    Advisory, AdvisoryBundle, AdvisoryConstraints, AdvisoryEvidence, AdvisoryStats,
    AdvisoryStrength, AdvisoryType, BundleMeta, CaseSummary, Condition, ContractError, Correction,
    EpisodeType, EpisodicMemoryEntry, Evaluation, InputSignature, LengthBucket, MemoryMode,
    Provenance, RiskVector, StageSnapshot, StageSnapshots, StructureTag, SCHEMA_VERSION,
};
pub use stage_outputs::{
    AspectSentiment, AspectSpan, AteOutput, AtsaOutput, CorrectionProposal, ExtractedAspect,
    ModeratorOutput, StructuralRisk, ValidatorOutput,
};
pub use trace_contracts::{
    CaseTrace, CoverageRecord, DebateStance, DebateTurn, OverrideChange, OverrideRecord,
    RetrievalRecord, RiskRecord, RunMeta,
};

pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}
