use absa_core::memory_contracts::{
    Advisory, AdvisoryBundle, BundleMeta, Condition, MemoryMode, MAX_BUNDLE_ADVISORIES,
    MAX_BUNDLE_WARNINGS,
};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::retriever::clamp_topk;

pub const DEFAULT_SLOT_NAME: &str = "DEBATE_CONTEXT__MEMORY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConditionProfile {
    pub retrieval_executed: bool,
    pub injection_mask: bool,
    pub memory_mode: MemoryMode,
    pub exposed_to_debate: bool,
}

impl ConditionProfile {
    pub const OFF: Self = Self {
        retrieval_executed: false,
        injection_mask: true,
        memory_mode: MemoryMode::Off,
        exposed_to_debate: false,
    };

    pub fn for_condition(condition: Condition) -> Self {
        match condition {
            Condition::C1 => Self::OFF,
            Condition::C2 => Self {
                retrieval_executed: true,
                injection_mask: false,
                memory_mode: MemoryMode::On,
                exposed_to_debate: true,
            },
            Condition::C2Silent => Self {
                retrieval_executed: true,
                injection_mask: true,
                memory_mode: MemoryMode::Silent,
                exposed_to_debate: false,
            },
        }
    }

    pub fn for_name(name: &str) -> Self {
        name.parse::<Condition>()
            .map(Self::for_condition)
            .unwrap_or(Self::OFF)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotRequest {
    pub memory_mode: MemoryMode,
    pub retrieval_executed: bool,
    pub injection_mask: bool,
    pub retrieved: Vec<Advisory>,
    pub warnings: Vec<String>,
    pub topk: i64,
}

impl SlotRequest {
    pub fn from_profile(profile: ConditionProfile, topk: i64) -> Self {
        Self {
            memory_mode: profile.memory_mode,
            retrieval_executed: profile.retrieval_executed,
            injection_mask: profile.injection_mask,
            retrieved: Vec::new(),
            warnings: Vec::new(),
            topk,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InjectionController {
    slot_name: String,
}

impl Default for InjectionController {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_NAME)
    }
}

impl InjectionController {
    pub fn new(slot_name: impl Into<String>) -> Self {
        Self {
            slot_name: slot_name.into(),
        }
    }

    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    pub fn build_slot(&self, request: SlotRequest) -> BTreeMap<String, AdvisoryBundle> {
        let topk = clamp_topk(request.topk);
        let (retrieved, warnings) = if request.injection_mask {
            (Vec::new(), Vec::new())
        } else {
            let mut retrieved = request.retrieved;
            retrieved.truncate(usize::from(topk).min(MAX_BUNDLE_ADVISORIES));
            let mut warnings = request.warnings;
            warnings.truncate(MAX_BUNDLE_WARNINGS);
            (retrieved, warnings)
        };

        let bundle = AdvisoryBundle {
            memory_on: request.memory_mode == MemoryMode::On && !request.injection_mask,
            retrieved,
            warnings,
            meta: BundleMeta {
                memory_mode: request.memory_mode,
                topk,
                masked_injection: request.injection_mask,
                retrieval_executed: request.retrieval_executed,
            },
        };

        let mut slot = BTreeMap::new();
        slot.insert(self.slot_name.clone(), bundle);
        slot
    }
}
