use absa_core::memory_contracts::{canonical_payload_hash, Condition, ContractError, MemoryMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use crate::injection::DEFAULT_SLOT_NAME;

pub const DEFAULT_POLICY_PATH: &str = "configs/memory_policy.yaml";
pub const DEFAULT_STORE_PATH: &str = "memory/episodic_store.jsonl";
pub const DEFAULT_PRUNE_STRATEGY: &str = "fifo";
pub const DEFAULT_RETRIEVAL_MODE: &str = "signature";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid policy yaml {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionFlags {
    #[serde(default)]
    pub retrieval_execute: bool,
    #[serde(default = "default_true")]
    pub injection_mask: bool,
    #[serde(default)]
    pub store_write: bool,
}

impl Default for ConditionFlags {
    fn default() -> Self {
        Self {
            retrieval_execute: false,
            injection_mask: true,
            store_write: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionPolicy {
    #[serde(default)]
    pub episodic_memory: ConditionFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrunePolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_prune_strategy")]
    pub strategy: String,
    #[serde(default = "default_keep_last_n")]
    pub keep_last_n: usize,
}

impl Default for PrunePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: default_prune_strategy(),
            keep_last_n: default_keep_last_n(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorePolicy {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub prune: PrunePolicy,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            prune: PrunePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalPolicy {
    #[serde(default = "default_retrieval_mode")]
    pub mode: String,
    #[serde(default = "default_topk")]
    pub topk: i64,
}

impl Default for RetrievalPolicy {
    fn default() -> Self {
        Self {
            mode: default_retrieval_mode(),
            topk: default_topk(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoPolicy {
    #[serde(default = "default_slot_name")]
    pub slot_memory_name: String,
}

impl Default for IoPolicy {
    fn default() -> Self {
        Self {
            slot_memory_name: default_slot_name(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePolicy {
    #[serde(default)]
    pub lexicon_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalMemoryPolicy {
    #[serde(default)]
    pub store: StorePolicy,
    #[serde(default)]
    pub retrieval: RetrievalPolicy,
    #[serde(default)]
    pub io: IoPolicy,
    #[serde(default)]
    pub gate: GatePolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalPolicy {
    #[serde(default)]
    pub episodic_memory: GlobalMemoryPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPolicy {
    #[serde(default)]
    pub conditions: BTreeMap<String, ConditionPolicy>,
    #[serde(default)]
    pub global: GlobalPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedPolicy {
    pub policy: MemoryPolicy,
    pub path: PathBuf,
    pub found: bool,
}

impl MemoryPolicy {
    pub fn standard() -> Self {
        let flags = |retrieval_execute, injection_mask, store_write| ConditionPolicy {
            episodic_memory: ConditionFlags {
                retrieval_execute,
                injection_mask,
                store_write,
            },
        };
        let mut conditions = BTreeMap::new();
        conditions.insert(Condition::C1.as_str().to_string(), flags(false, true, false));
        conditions.insert(Condition::C2.as_str().to_string(), flags(true, false, true));
        conditions.insert(Condition::C2Silent.as_str().to_string(), flags(true, true, true));
        Self {
            conditions,
            global: GlobalPolicy::default(),
        }
    }

    pub fn from_yaml_str(raw: &str, path: &Path) -> Result<Self, PolicyError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|source| PolicyError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<LoadedPolicy, PolicyError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(raw) => Ok(LoadedPolicy {
                policy: Self::from_yaml_str(&raw, path)?,
                path: path.to_path_buf(),
                found: true,
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(
                    event = "policy_missing",
                    path = %path.display(),
                    "memory policy not found; all conditions fall back to memory-off flags"
                );
                Ok(LoadedPolicy {
                    policy: Self::default(),
                    path: path.to_path_buf(),
                    found: false,
                })
            }
            Err(source) => Err(PolicyError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn flags_for(&self, condition: Condition) -> ConditionFlags {
        self.conditions
            .get(condition.as_str())
            .map(|policy| policy.episodic_memory)
            .unwrap_or_default()
    }

    pub fn memory(&self) -> &GlobalMemoryPolicy {
        &self.global.episodic_memory
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectivePolicy {
    pub condition: Condition,
    pub condition_input: String,
    pub condition_normalized: bool,
    pub policy_path: String,
    pub policy_found: bool,
    pub flags: ConditionFlags,
    pub memory_mode: MemoryMode,
    pub exposed_to_debate: bool,
    pub store_path: String,
    pub prune_enabled: bool,
    pub prune_strategy: String,
    pub keep_last_n: usize,
    pub retrieval_mode: String,
    pub topk: u8,
    pub slot_name: String,
    pub lexicon_fingerprint: String,
    pub policy_hash: String,
}

impl EffectivePolicy {
    pub fn seal(mut self) -> Result<Self, ContractError> {
        self.policy_hash = String::new();
        self.policy_hash = canonical_payload_hash(&self)?;
        Ok(self)
    }
}

fn default_true() -> bool {
    true
}

fn default_prune_strategy() -> String {
    DEFAULT_PRUNE_STRATEGY.to_string()
}

fn default_keep_last_n() -> usize {
    absa_store::DEFAULT_KEEP_LAST_N
}

fn default_store_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORE_PATH)
}

fn default_retrieval_mode() -> String {
    DEFAULT_RETRIEVAL_MODE.to_string()
}

fn default_topk() -> i64 {
    3
}

fn default_slot_name() -> String {
    DEFAULT_SLOT_NAME.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let loaded = MemoryPolicy::load(dir.path().join("absent.yaml")).expect("load");
        assert!(!loaded.found);
        assert_eq!(loaded.policy, MemoryPolicy::default());
        for condition in Condition::ALL {
            assert_eq!(loaded.policy.flags_for(condition), ConditionFlags::default());
        }
        let memory = loaded.policy.memory();
        assert_eq!(memory.store.path, PathBuf::from(DEFAULT_STORE_PATH));
        assert_eq!(memory.store.prune.keep_last_n, 5000);
        assert_eq!(memory.retrieval.topk, 3);
        assert_eq!(memory.io.slot_memory_name, "DEBATE_CONTEXT__MEMORY");
    }

    #[test]
    fn parses_nested_policy_and_keeps_unset_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("memory_policy.yaml");
        fs::write(
            &path,
            r#"
conditions:
  C2:
    episodic_memory:
      retrieval_execute: true
      injection_mask: false
      store_write: true
  C2_silent:
    episodic_memory:
      retrieval_execute: true
global:
  episodic_memory:
    store:
      path: runs/store.jsonl
      prune:
        keep_last_n: 10
    retrieval:
      topk: 2
    io:
      slot_memory_name: MEMORY_SLOT
    gate:
      lexicon_path: alignment_lexicon.yaml
"#,
        )
        .expect("write policy");

        let loaded = MemoryPolicy::load(&path).expect("load");
        assert!(loaded.found);
        let policy = loaded.policy;
        assert!(policy.flags_for(Condition::C2).store_write);
        let silent = policy.flags_for(Condition::C2Silent);
        assert!(silent.retrieval_execute && silent.injection_mask && !silent.store_write);
        assert_eq!(policy.flags_for(Condition::C1), ConditionFlags::default());

        let memory = policy.memory();
        assert_eq!(memory.store.path, PathBuf::from("runs/store.jsonl"));
        assert!(memory.store.prune.enabled);
        assert_eq!(memory.store.prune.strategy, "fifo");
        assert_eq!(memory.store.prune.keep_last_n, 10);
        assert_eq!(memory.retrieval.mode, "signature");
        assert_eq!(memory.retrieval.topk, 2);
        assert_eq!(memory.io.slot_memory_name, "MEMORY_SLOT");
        assert!(memory.gate.lexicon_path.is_some());
    }

    #[test]
    fn malformed_existing_file_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "conditions: [not, a, map]\n").expect("write");
        assert!(matches!(
            MemoryPolicy::load(&path),
            Err(PolicyError::Yaml { .. })
        ));
    }

    #[test]
    fn empty_file_is_the_empty_policy() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("empty.yaml");
        fs::write(&path, "\n").expect("write");
        let loaded = MemoryPolicy::load(&path).expect("load");
        assert!(loaded.found);
        assert_eq!(loaded.policy, MemoryPolicy::default());
    }

    #[test]
    fn shipped_policy_file_matches_standard_flags() {
        let shipped = concat!(env!("CARGO_MANIFEST_DIR"), "/../../configs/memory_policy.yaml");
        let loaded = MemoryPolicy::load(shipped).expect("load shipped policy");
        assert!(loaded.found);
        for condition in Condition::ALL {
            assert_eq!(
                loaded.policy.flags_for(condition),
                MemoryPolicy::standard().flags_for(condition),
                "{condition}"
            );
        }
    }
}
