use absa_core::leakage::{ensure_no_leakage, FORBIDDEN_RAW_KEYS};
use absa_core::memory_contracts::{
    parse_id_number, to_json_value, ContractError, EpisodicMemoryEntry, EPISODE_ID_PREFIX,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub mod case_trace;

pub use case_trace::{CaseTraceDraft, CaseTraceLogger};

pub const DEFAULT_KEEP_LAST_N: usize = 5_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("malformed store line {line} in {path}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneConfig {
    pub enabled: bool,
    pub keep_last_n: usize,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keep_last_n: DEFAULT_KEEP_LAST_N,
        }
    }
}

impl PruneConfig {
    pub fn capacity(&self) -> usize {
        self.keep_last_n.max(1)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub kept: usize,
    pub evicted: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub path: String,
    pub entries: usize,
    pub by_episode_type: BTreeMap<String, usize>,
    pub max_episode_number: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    path: PathBuf,
    prune: PruneConfig,
}

impl MemoryStore {
    pub fn new(path: impl Into<PathBuf>, prune: PruneConfig) -> Self {
        Self {
            path: path.into(),
            prune,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn prune_config(&self) -> PruneConfig {
        self.prune
    }

    pub fn load(&self) -> Result<Vec<EpisodicMemoryEntry>, StoreError> {
        self.load_values()?
            .into_iter()
            .map(|(line, value)| {
                serde_json::from_value(value).map_err(|err| StoreError::Parse {
                    path: self.path.clone(),
                    line,
                    reason: err.to_string(),
                })
            })
            .collect()
    }

    pub fn append(&self, entry: &EpisodicMemoryEntry) -> Result<(), StoreError> {
        self.append_value(&to_json_value(entry)?)
    }

    // Guarded append for entries arriving as loose JSON. The leakage scan runs
    // before the shape check so smuggled raw content is always reported as such.
    pub fn append_value(&self, value: &Value) -> Result<(), StoreError> {
        ensure_no_leakage(value, &FORBIDDEN_RAW_KEYS)?;
        let entry: EpisodicMemoryEntry = serde_json::from_value(value.clone())
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        entry.validate()?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let line =
            serde_json::to_string(value).map_err(|err| StoreError::Serialization(err.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        file.flush()?;
        debug!(
            event = "store_append",
            path = %self.path.display(),
            episode_id = %entry.episode_id
        );

        if self.prune.enabled {
            self.prune_now()?;
        }
        Ok(())
    }

    pub fn prune_now(&self) -> Result<PruneReport, StoreError> {
        let values = self.load_values()?;
        let capacity = self.prune.capacity();
        if values.len() <= capacity {
            return Ok(PruneReport {
                kept: values.len(),
                evicted: 0,
            });
        }

        let evicted = values.len() - capacity;
        let mut rendered = String::new();
        for (_, value) in values.iter().skip(evicted) {
            let line = serde_json::to_string(value)
                .map_err(|err| StoreError::Serialization(err.to_string()))?;
            rendered.push_str(&line);
            rendered.push('\n');
        }

        let tmp_path = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp_path, rendered)?;
        fs::rename(&tmp_path, &self.path)?;
        info!(
            event = "store_pruned",
            path = %self.path.display(),
            kept = capacity,
            evicted
        );

        Ok(PruneReport {
            kept: capacity,
            evicted,
        })
    }

    pub fn max_episode_number(&self) -> Result<Option<u64>, StoreError> {
        Ok(self
            .load()?
            .iter()
            .filter_map(|entry| parse_id_number(EPISODE_ID_PREFIX, &entry.episode_id))
            .max())
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let entries = self.load()?;
        let mut by_episode_type = BTreeMap::new();
        for entry in &entries {
            *by_episode_type
                .entry(entry.episode_type.as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(StoreStats {
            path: self.path.display().to_string(),
            entries: entries.len(),
            by_episode_type,
            max_episode_number: entries
                .iter()
                .filter_map(EpisodicMemoryEntry::episode_number)
                .max(),
        })
    }

    pub fn validate(&self) -> Result<usize, StoreError> {
        let entries = self.load()?;
        for entry in &entries {
            entry.validate()?;
        }
        Ok(entries.len())
    }

    fn load_values(&self) -> Result<Vec<(usize, Value)>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&self.path)?);
        let mut values = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let line_number = index + 1;
            let value: Value = serde_json::from_str(&line).map_err(|err| StoreError::Parse {
                path: self.path.clone(),
                line: line_number,
                reason: err.to_string(),
            })?;
            ensure_no_leakage(&value, &FORBIDDEN_RAW_KEYS)?;
            values.push((line_number, value));
        }
        Ok(values)
    }
}
