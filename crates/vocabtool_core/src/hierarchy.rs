//! Folds normalized records into the catalog's `tier2 -> tier3 -> [word]` tree.
//!
//! Records without a tier-3 tag land in [`Tier3Key::All`], a variant rather than
//! a string, so no real tag can address it in memory. On the wire the bucket is
//! spelled [`ALL_BUCKET_KEY`]; the normalizer rejects tier-3 tags with that exact
//! spelling, which keeps the serialized form unambiguous as well. Records
//! without a tier-2 tag are grouped under the empty string, which no trimmed
//! tag can equal.

use std::collections::HashMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::records::VocabularyRecord;

pub const ALL_BUCKET_KEY: &str = "_all";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tier3Key {
    Tag(String),
    All,
}

impl Tier3Key {
    fn from_wire(key: String) -> Self {
        if key == ALL_BUCKET_KEY {
            Self::All
        } else {
            Self::Tag(key)
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            Self::Tag(tag) => tag,
            Self::All => ALL_BUCKET_KEY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier3Bucket {
    pub key: Tier3Key,
    pub words: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier2Group {
    pub tag: String,
    pub buckets: Vec<Tier3Bucket>,
}

impl Tier2Group {
    pub fn bucket(&self, key: &Tier3Key) -> Option<&[String]> {
        self.buckets
            .iter()
            .find(|bucket| &bucket.key == key)
            .map(|bucket| bucket.words.as_slice())
    }

    pub fn word_count(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.words.len()).sum()
    }
}

/// Groups and buckets keep insertion order; words keep source order and are
/// not deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hierarchy {
    groups: Vec<Tier2Group>,
}

impl Hierarchy {
    pub fn groups(&self) -> &[Tier2Group] {
        &self.groups
    }

    pub fn group(&self, tag: &str) -> Option<&Tier2Group> {
        self.groups.iter().find(|group| group.tag == tag)
    }

    pub fn words_at(&self, tier2: &str, tier3: &Tier3Key) -> Option<&[String]> {
        self.group(tier2).and_then(|group| group.bucket(tier3))
    }

    pub fn leaf_count(&self) -> usize {
        self.groups.iter().map(Tier2Group::word_count).sum()
    }

    pub fn bucket_count(&self) -> usize {
        self.groups.iter().map(|group| group.buckets.len()).sum()
    }
}

pub fn build_hierarchy(records: &[VocabularyRecord]) -> Hierarchy {
    let mut builder = HierarchyBuilder::default();
    for record in records {
        let tier3 = match &record.tier3 {
            Some(tag) => Tier3Key::Tag(tag.clone()),
            None => Tier3Key::All,
        };
        builder.push(record.tier2.as_deref().unwrap_or(""), tier3, &record.word);
    }
    builder.finish()
}

#[derive(Default)]
struct HierarchyBuilder {
    groups: Vec<Tier2Group>,
    group_index: HashMap<String, usize>,
    bucket_index: Vec<HashMap<Tier3Key, usize>>,
}

impl HierarchyBuilder {
    fn push(&mut self, tier2: &str, tier3: Tier3Key, word: &str) {
        let group_slot = match self.group_index.get(tier2) {
            Some(slot) => *slot,
            None => {
                self.groups.push(Tier2Group {
                    tag: tier2.to_string(),
                    buckets: Vec::new(),
                });
                self.bucket_index.push(HashMap::new());
                let slot = self.groups.len() - 1;
                self.group_index.insert(tier2.to_string(), slot);
                slot
            }
        };

        let group = &mut self.groups[group_slot];
        let buckets = &mut self.bucket_index[group_slot];
        let bucket_slot = match buckets.get(&tier3) {
            Some(slot) => *slot,
            None => {
                group.buckets.push(Tier3Bucket {
                    key: tier3.clone(),
                    words: Vec::new(),
                });
                let slot = group.buckets.len() - 1;
                buckets.insert(tier3, slot);
                slot
            }
        };
        group.buckets[bucket_slot].words.push(word.to_string());
    }

    fn finish(self) -> Hierarchy {
        Hierarchy {
            groups: self.groups,
        }
    }
}

struct BucketMap<'a>(&'a [Tier3Bucket]);

impl Serialize for BucketMap<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for bucket in self.0 {
            map.serialize_entry(bucket.key.as_wire(), &bucket.words)?;
        }
        map.end()
    }
}

impl Serialize for Hierarchy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.groups.len()))?;
        for group in &self.groups {
            map.serialize_entry(&group.tag, &BucketMap(&group.buckets))?;
        }
        map.end()
    }
}

struct OrderedBuckets(Vec<Tier3Bucket>);

impl<'de> Deserialize<'de> for OrderedBuckets {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BucketVisitor;

        impl<'de> Visitor<'de> for BucketVisitor {
            type Value = OrderedBuckets;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of tier-3 keys to word arrays")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut buckets = Vec::new();
                while let Some((key, words)) = access.next_entry::<String, Vec<String>>()? {
                    buckets.push(Tier3Bucket {
                        key: Tier3Key::from_wire(key),
                        words,
                    });
                }
                Ok(OrderedBuckets(buckets))
            }
        }

        deserializer.deserialize_map(BucketVisitor)
    }
}

impl<'de> Deserialize<'de> for Hierarchy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HierarchyVisitor;

        impl<'de> Visitor<'de> for HierarchyVisitor {
            type Value = Hierarchy;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of tier-2 tags to tier-3 bucket maps")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut groups = Vec::new();
                while let Some((tag, buckets)) = access.next_entry::<String, OrderedBuckets>()? {
                    groups.push(Tier2Group {
                        tag,
                        buckets: buckets.0,
                    });
                }
                Ok(Hierarchy { groups })
            }
        }

        deserializer.deserialize_map(HierarchyVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::{Hierarchy, Tier3Key, build_hierarchy};
    use crate::records::VocabularyRecord;

    fn tag(value: &str) -> Tier3Key {
        Tier3Key::Tag(value.to_string())
    }

    #[test]
    fn folds_example_rows_into_two_and_three_level_groups() {
        let records = vec![
            VocabularyRecord::new("學", Some("單元一"), Some("課一")),
            VocabularyRecord::new("習", Some("單元一"), Some("課一")),
            VocabularyRecord::new("水", Some("單元二"), None),
        ];
        let hierarchy = build_hierarchy(&records);

        assert_eq!(
            hierarchy.words_at("單元一", &tag("課一")),
            Some(&["學".to_string(), "習".to_string()][..])
        );
        assert_eq!(
            hierarchy.words_at("單元二", &Tier3Key::All),
            Some(&["水".to_string()][..])
        );
        assert_eq!(hierarchy.leaf_count(), 3);
        assert_eq!(
            serde_json::to_string(&hierarchy).expect("serialize"),
            r#"{"單元一":{"課一":["學","習"]},"單元二":{"_all":["水"]}}"#
        );
    }

    #[test]
    fn sentinel_bucket_never_absorbs_tagged_words() {
        let records = vec![
            VocabularyRecord::new("w1", Some("T2"), Some("T3a")),
            VocabularyRecord::new("w2", Some("T2"), None),
        ];
        let hierarchy = build_hierarchy(&records);
        let group = hierarchy.group("T2").expect("group");

        assert_eq!(group.buckets.len(), 2);
        assert_eq!(group.bucket(&tag("T3a")), Some(&["w1".to_string()][..]));
        assert_eq!(group.bucket(&Tier3Key::All), Some(&["w2".to_string()][..]));
    }

    #[test]
    fn duplicates_are_kept_and_insertion_order_is_preserved() {
        let records = vec![
            VocabularyRecord::new("b", Some("Z"), None),
            VocabularyRecord::new("a", Some("A"), Some("x")),
            VocabularyRecord::new("b", Some("Z"), None),
            VocabularyRecord::new("c", Some("A"), None),
        ];
        let hierarchy = build_hierarchy(&records);
        let tags = hierarchy
            .groups()
            .iter()
            .map(|group| group.tag.as_str())
            .collect::<Vec<_>>();

        assert_eq!(tags, vec!["Z", "A"]);
        assert_eq!(
            hierarchy.words_at("Z", &Tier3Key::All),
            Some(&["b".to_string(), "b".to_string()][..])
        );
        assert_eq!(hierarchy.leaf_count(), records.len());
        assert_eq!(hierarchy.bucket_count(), 3);
    }

    #[test]
    fn missing_tier2_groups_under_empty_key() {
        let records = vec![VocabularyRecord::new("水", None, None)];
        let hierarchy = build_hierarchy(&records);
        assert_eq!(hierarchy.groups()[0].tag, "");
        assert_eq!(hierarchy.words_at("", &Tier3Key::All).map(<[String]>::len), Some(1));
    }

    #[test]
    fn mixed_buckets_round_trip_through_json_in_order() {
        let records = vec![
            VocabularyRecord::new("w2", Some("T2"), None),
            VocabularyRecord::new("w1", Some("T2"), Some("T3a")),
            VocabularyRecord::new("w3", Some("S2"), Some("S3")),
        ];
        let hierarchy = build_hierarchy(&records);
        let json = serde_json::to_string(&hierarchy).expect("serialize");
        assert_eq!(
            json,
            r#"{"T2":{"_all":["w2"],"T3a":["w1"]},"S2":{"S3":["w3"]}}"#
        );

        let parsed: Hierarchy = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, hierarchy);
    }
}
