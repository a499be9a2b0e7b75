use absa_core::leakage::{ensure_no_leakage, FORBIDDEN_RAW_KEYS};
use absa_core::memory_contracts::{
    default_schema_version_string, AdvisoryBundle, Condition, InputSignature, MemoryMode,
    StageSnapshot,
};
use absa_core::trace_contracts::{
    CaseTrace, CoverageRecord, DebateTurn, OverrideRecord, RetrievalRecord, RiskRecord, RunMeta,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::StoreError;

#[derive(Debug, Clone, Deserialize)]
pub struct CaseTraceDraft {
    pub run_id: String,
    pub condition: Condition,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub memory_mode: Option<MemoryMode>,
    pub case_id: String,
    #[serde(default)]
    pub sample_index: Option<u64>,
    pub input_signature: InputSignature,
    pub stage1_output: StageSnapshot,
    #[serde(default)]
    pub debate_log: Vec<DebateTurn>,
    pub memory_bundle: AdvisoryBundle,
    #[serde(default)]
    pub retrieval: Option<RetrievalRecord>,
    pub final_output: StageSnapshot,
    #[serde(default)]
    pub risk: RiskRecord,
    #[serde(default, rename = "override")]
    pub override_record: OverrideRecord,
    #[serde(default)]
    pub coverage: CoverageRecord,
}

impl CaseTraceDraft {
    // Refuse forbidden raw-content keys before serde can drop them.
    pub fn from_value(value: Value) -> Result<Self, StoreError> {
        ensure_no_leakage(&value, &FORBIDDEN_RAW_KEYS)?;
        serde_json::from_value(value).map_err(|err| StoreError::Serialization(err.to_string()))
    }

    fn into_trace(self, now: DateTime<Utc>) -> CaseTrace {
        CaseTrace {
            schema_version: default_schema_version_string(),
            run_meta: RunMeta {
                run_id: self.run_id,
                condition: self.condition,
                seed: self.seed,
                timestamp: self.timestamp.unwrap_or(now),
                memory_mode: self.memory_mode,
            },
            case_id: self.case_id,
            sample_index: self.sample_index,
            input_signature: self.input_signature,
            stage1_output: self.stage1_output,
            debate_log: self.debate_log,
            memory_bundle: self.memory_bundle,
            retrieval: self.retrieval,
            final_output: self.final_output,
            risk: self.risk,
            override_record: self.override_record,
            coverage: self.coverage,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaseTraceLogger {
    path: PathBuf,
}

impl CaseTraceLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, draft: CaseTraceDraft) -> Result<CaseTrace, StoreError> {
        let trace = draft.into_trace(Utc::now());
        trace.validate()?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let line =
            serde_json::to_string(&trace).map_err(|err| StoreError::Serialization(err.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        debug!(
            event = "case_trace_logged",
            case_id = %trace.case_id,
            condition = %trace.run_meta.condition
        );
        Ok(trace)
    }

    pub fn log_value(&self, value: Value) -> Result<CaseTrace, StoreError> {
        self.log(CaseTraceDraft::from_value(value)?)
    }
}
