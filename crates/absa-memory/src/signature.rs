use absa_core::memory_contracts::{InputSignature, LengthBucket, StructureTag, DEFAULT_LANGUAGE};

const NEGATION_MARKERS: [&str; 12] = [
    "않", "없", "못", "아니", "안 ", "별로", "전혀", "not ", "n't", "never", "no ", "nothing",
];

const CONTRAST_MARKERS: [&str; 11] = [
    "지만", "는데", "그런데", "하지만", "그러나", "반면", "however", "but ", "although",
    "though", "whereas",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureBuilder;

impl SignatureBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, raw_text: &str, language: &str, num_aspects: u32) -> InputSignature {
        let trimmed = raw_text.trim();
        let lowered = trimmed.to_lowercase();

        let has_negation = NEGATION_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker));
        let contrast_marker = earliest_marker(&lowered, &CONTRAST_MARKERS);

        let mut detected_structure = Vec::new();
        if has_negation {
            detected_structure.push(StructureTag::Negation);
        }
        if contrast_marker.is_some() {
            detected_structure.push(StructureTag::Contrast);
        }
        if detected_structure.is_empty() {
            detected_structure.push(StructureTag::None);
        }

        let language = language.trim();
        InputSignature {
            language: if language.is_empty() {
                DEFAULT_LANGUAGE.to_string()
            } else {
                language.to_lowercase()
            },
            detected_structure,
            contrast_marker,
            has_negation: Some(has_negation),
            num_aspects,
            length_bucket: LengthBucket::from_char_count(trimmed.chars().count()),
        }
    }
}

fn earliest_marker(lowered: &str, markers: &[&str]) -> Option<String> {
    markers
        .iter()
        .filter_map(|marker| lowered.find(marker).map(|offset| (offset, *marker)))
        .min_by_key(|(offset, _)| *offset)
        .map(|(_, marker)| marker.trim().to_string())
}
