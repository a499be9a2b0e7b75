use absa_core::memory_contracts::{
    format_advisory_id, parse_id_number, Advisory, AdvisoryConstraints, AdvisoryEvidence,
    AdvisoryStrength, AdvisoryType, EpisodicMemoryEntry, ADVISORY_ID_PREFIX,
    MAX_ADVISORY_MESSAGE_CHARS,
};
use absa_core::truncate_chars;
use std::collections::BTreeSet;

use crate::retriever::ScoredEpisode;

pub const EMPTY_PRINCIPLE_MESSAGE: &str = "No principle text.";
pub const DEFAULT_RELEVANCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, Default)]
pub struct AdvisoryBuilder;

impl AdvisoryBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build_from_episodes(
        &self,
        episodes: &[&EpisodicMemoryEntry],
        advisory_type: AdvisoryType,
        strength: AdvisoryStrength,
    ) -> Vec<Advisory> {
        let mut batch = Vec::with_capacity(episodes.len());
        for episode in episodes {
            let advisory = build_one(episode, advisory_type, strength, DEFAULT_RELEVANCE, &batch);
            batch.push(advisory);
        }
        batch
    }

    pub fn build_from_retrieved(
        &self,
        hits: &[ScoredEpisode<'_>],
        strength: AdvisoryStrength,
    ) -> Vec<Advisory> {
        let mut batch = Vec::with_capacity(hits.len());
        for hit in hits {
            let advisory_type = AdvisoryType::from(hit.entry.episode_type);
            let advisory = build_one(hit.entry, advisory_type, strength, hit.relevance, &batch);
            batch.push(advisory);
        }
        batch
    }
}

pub fn next_advisory_id(allocated: &[Advisory]) -> String {
    let taken: BTreeSet<u64> = allocated
        .iter()
        .filter_map(|advisory| parse_id_number(ADVISORY_ID_PREFIX, &advisory.advisory_id))
        .collect();
    let mut candidate = 1;
    while taken.contains(&candidate) {
        candidate += 1;
    }
    format_advisory_id(candidate)
}

fn build_one(
    episode: &EpisodicMemoryEntry,
    advisory_type: AdvisoryType,
    strength: AdvisoryStrength,
    relevance: f64,
    allocated: &[Advisory],
) -> Advisory {
    let principle = episode.correction.corrective_principle.trim();
    let message = if principle.is_empty() {
        EMPTY_PRINCIPLE_MESSAGE.to_string()
    } else {
        truncate_chars(principle, MAX_ADVISORY_MESSAGE_CHARS)
    };
    let relevance_score = if relevance.is_finite() {
        relevance.clamp(0.0, 1.0)
    } else {
        0.0
    };

    Advisory {
        advisory_id: next_advisory_id(allocated),
        advisory_type,
        message,
        strength,
        relevance_score,
        evidence: AdvisoryEvidence {
            source_episode_ids: vec![episode.episode_id.clone()],
            risk_tags: episode.evaluation.risk_after.tags.clone(),
            principle_id: episode.correction.principle_id.clone(),
            risk_before_tags: Some(episode.evaluation.risk_before.tags.clone()),
            risk_after_tags: Some(episode.evaluation.risk_after.tags.clone()),
            stats: None,
        },
        constraints: AdvisoryConstraints::enforced(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::Retriever;
    use crate::signature::SignatureBuilder;
    use crate::tests::episode;
    use absa_core::leakage::{scan_for_nonempty_forbidden_keys, FORBIDDEN_RAW_KEYS};
    use absa_core::memory_contracts::{to_json_value, EpisodeType, StructureTag};

    #[test]
    fn one_advisory_per_episode_with_sequential_ids() {
        let first = episode(7, "ko", &[StructureTag::Negation], "negation_scope", "r");
        let mut second = episode(9, "ko", &[StructureTag::Negation], "negation_scope", "r");
        second.correction.corrective_principle = "  ".to_string();
        second.evaluation.risk_after.tags = vec!["residual_scope".to_string()];

        let advisories = AdvisoryBuilder::new().build_from_episodes(
            &[&first, &second],
            AdvisoryType::ConsistencyAnchor,
            AdvisoryStrength::Moderate,
        );

        assert_eq!(advisories.len(), 2);
        assert_eq!(advisories[0].advisory_id, "adv_000001");
        assert_eq!(advisories[1].advisory_id, "adv_000002");
        assert_eq!(advisories[0].evidence.source_episode_ids, vec!["epi_000007"]);
        assert_eq!(advisories[1].message, EMPTY_PRINCIPLE_MESSAGE);
        assert_eq!(advisories[1].evidence.risk_tags, vec!["residual_scope"]);
        for advisory in &advisories {
            advisory.validate().expect("built advisory is valid");
            assert!(advisory.constraints.is_enforced());
            let value = to_json_value(advisory).expect("serialize");
            assert!(scan_for_nonempty_forbidden_keys(&value, &FORBIDDEN_RAW_KEYS).is_none());
        }
    }

    #[test]
    fn long_principles_are_truncated_to_message_limit() {
        let mut entry = episode(1, "ko", &[StructureTag::None], "none", "r");
        entry.correction.corrective_principle = "원".repeat(900);
        let advisories = AdvisoryBuilder::new().build_from_episodes(
            &[&entry],
            AdvisoryType::SuccessfulOverride,
            AdvisoryStrength::Weak,
        );
        assert_eq!(advisories[0].message.chars().count(), MAX_ADVISORY_MESSAGE_CHARS);
    }

    #[test]
    fn next_id_fills_first_gap() {
        let entry = episode(1, "ko", &[StructureTag::None], "none", "r");
        let mut batch = AdvisoryBuilder::new().build_from_episodes(
            &[&entry, &entry, &entry],
            AdvisoryType::ConsistencyAnchor,
            AdvisoryStrength::Weak,
        );
        batch.remove(1);
        assert_eq!(next_advisory_id(&batch), "adv_000002");
        assert_eq!(next_advisory_id(&[]), "adv_000001");
    }

    #[test]
    fn retrieved_hits_map_episode_type_and_relevance() {
        let mut harm = episode(1, "ko", &[StructureTag::Negation], "negation_scope", "r");
        harm.episode_type = EpisodeType::Harm;
        let mut success = episode(2, "ko", &[StructureTag::Negation], "negation_scope", "r");
        success.episode_type = EpisodeType::Success;
        let entries = vec![harm, success];
        let query = SignatureBuilder::new().build("안 좋아요", "ko", 1);
        let hits = Retriever::default().retrieve_scored(&entries, &query, None);

        let advisories = AdvisoryBuilder::new().build_from_retrieved(&hits, AdvisoryStrength::Weak);
        assert_eq!(advisories[0].advisory_type, AdvisoryType::FailedOverrideWarning);
        assert_eq!(advisories[1].advisory_type, AdvisoryType::SuccessfulOverride);
        assert!((advisories[0].relevance_score - 0.7).abs() < 1e-9);
    }
}
