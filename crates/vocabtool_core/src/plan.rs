use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;

use crate::records::VocabularyRecord;

pub const TIER2_LEVEL: u8 = 2;
pub const TIER3_LEVEL: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedTag {
    pub level: u8,
    pub code: String,
    pub display_name: String,
    pub sort_order: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagTaxonomy {
    pub tier2: Vec<PlannedTag>,
    pub tier3: Vec<PlannedTag>,
}

impl TagTaxonomy {
    pub fn iter(&self) -> impl Iterator<Item = &PlannedTag> {
        self.tier2.iter().chain(self.tier3.iter())
    }

    pub fn len(&self) -> usize {
        self.tier2.len() + self.tier3.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One planned membership row. `first_occurrence` is false when an earlier
/// triple in this batch already references the same word, so the loader can
/// skip a second vocabulary lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipTriple {
    pub word: String,
    pub tier2: Option<String>,
    pub tier3: Option<String>,
    pub first_occurrence: bool,
}

impl MembershipTriple {
    /// Positional: a tier-3 tag without a tier-2 tag keeps an empty first slot.
    pub fn tag_path(&self) -> Vec<String> {
        match (&self.tier2, &self.tier3) {
            (Some(tier2), Some(tier3)) => vec![tier2.clone(), tier3.clone()],
            (None, Some(tier3)) => vec![String::new(), tier3.clone()],
            (Some(tier2), None) => vec![tier2.clone()],
            (None, None) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierCount {
    pub tag: String,
    pub words: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportPlan {
    pub taxonomy: TagTaxonomy,
    pub triples: Vec<MembershipTriple>,
    pub distinct_words: usize,
    pub tier2_distribution: Vec<TierCount>,
}

impl ImportPlan {
    /// Records that passed normalization; this is what the list row reports.
    pub fn total_words(&self) -> usize {
        self.triples.len()
    }

    pub fn new_words(&self) -> impl Iterator<Item = &str> {
        self.triples
            .iter()
            .filter(|triple| triple.first_occurrence)
            .map(|triple| triple.word.as_str())
    }
}

pub fn plan_import(records: &[VocabularyRecord]) -> ImportPlan {
    let taxonomy = TagTaxonomy {
        tier2: sorted_tags(TIER2_LEVEL, records.iter().filter_map(|r| r.tier2.as_deref())),
        tier3: sorted_tags(TIER3_LEVEL, records.iter().filter_map(|r| r.tier3.as_deref())),
    };

    let mut seen = HashSet::new();
    let triples = records
        .iter()
        .map(|record| MembershipTriple {
            word: record.word.clone(),
            tier2: record.tier2.clone(),
            tier3: record.tier3.clone(),
            first_occurrence: seen.insert(record.word.as_str()),
        })
        .collect::<Vec<_>>();

    let mut distribution = BTreeMap::<&str, usize>::new();
    for tier2 in records.iter().filter_map(|record| record.tier2.as_deref()) {
        *distribution.entry(tier2).or_default() += 1;
    }

    ImportPlan {
        taxonomy,
        distinct_words: seen.len(),
        tier2_distribution: distribution
            .into_iter()
            .map(|(tag, words)| TierCount {
                tag: tag.to_string(),
                words,
            })
            .collect(),
        triples,
    }
}

fn sorted_tags<'a>(level: u8, tags: impl Iterator<Item = &'a str>) -> Vec<PlannedTag> {
    tags.collect::<BTreeSet<_>>()
        .into_iter()
        .enumerate()
        .map(|(sort_order, tag)| PlannedTag {
            level,
            code: tag.to_string(),
            display_name: tag.to_string(),
            sort_order,
        })
        .collect()
}
