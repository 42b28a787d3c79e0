//! The store seam. The loader talks only to [`VocabularyStore`]; adapters
//! decide how "insert unless it already exists" is carried out (conflict
//! clauses, pre-reads, or HTTP status codes).

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Result, anyhow};
use serde::Serialize;

use crate::config::{ListSection, VocabularyDefaults};
use crate::plan::{MembershipTriple, PlannedTag};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WordListRecord {
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub kind: String,
    pub owner_id: Option<String>,
    pub hierarchy_config: serde_json::Value,
    pub total_words: usize,
    pub is_public: bool,
}

impl WordListRecord {
    pub fn from_list(list: &ListSection, total_words: usize) -> Result<Self> {
        let code = list.require_code()?.to_string();
        Ok(Self {
            name: list.name.clone().unwrap_or_else(|| code.clone()),
            code,
            description: list.description.clone(),
            kind: list.kind.clone(),
            owner_id: list.owner_id.clone(),
            hierarchy_config: list.hierarchy_config(),
            total_words,
            is_public: list.is_public,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertedWordList {
    pub id: String,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagRecord {
    pub wordlist_id: String,
    pub level: u8,
    pub code: String,
    pub display_name: String,
    pub sort_order: usize,
}

impl TagRecord {
    pub fn from_planned(wordlist_id: &str, tag: &PlannedTag) -> Self {
        Self {
            wordlist_id: wordlist_id.to_string(),
            level: tag.level,
            code: tag.code.clone(),
            display_name: tag.display_name.clone(),
            sort_order: tag.sort_order,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewVocabulary {
    pub word: String,
    pub difficulty_level: i64,
    pub category: String,
    pub frequency: i64,
}

impl NewVocabulary {
    pub fn placeholder(word: &str, defaults: &VocabularyDefaults) -> Self {
        Self {
            word: word.to_string(),
            difficulty_level: defaults.difficulty_level,
            category: defaults.category.clone(),
            frequency: defaults.frequency,
        }
    }
}

/// Absent tags are stored as empty strings so the uniqueness key
/// `(wordlist_id, word, level_2_tag, level_3_tag)` holds even in stores where
/// NULLs compare distinct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipRecord {
    pub wordlist_id: String,
    pub vocabulary_id: String,
    pub word: String,
    pub level_2_tag: String,
    pub level_3_tag: String,
    pub tag_path: Vec<String>,
}

impl MembershipRecord {
    pub fn from_triple(wordlist_id: &str, vocabulary_id: &str, triple: &MembershipTriple) -> Self {
        Self {
            wordlist_id: wordlist_id.to_string(),
            vocabulary_id: vocabulary_id.to_string(),
            word: triple.word.clone(),
            level_2_tag: triple.tier2.clone().unwrap_or_default(),
            level_3_tag: triple.tier3.clone().unwrap_or_default(),
            tag_path: triple.tag_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VocabularyResolution {
    Created(String),
    Reused(String),
}

impl VocabularyResolution {
    pub fn id(&self) -> &str {
        match self {
            Self::Created(id) | Self::Reused(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub wordlists: usize,
    pub tags: usize,
    pub vocabulary: usize,
    pub mappings: usize,
}

pub trait VocabularyStore {
    /// Insert the list keyed by `code`, or update `name`, `description` and
    /// `total_words` of the existing row.
    fn upsert_wordlist(&mut self, list: &WordListRecord) -> Result<UpsertedWordList>;
    /// Insert keyed by `(wordlist_id, level, code)`; an existing row is left untouched.
    fn insert_tag(&mut self, tag: &TagRecord) -> Result<InsertOutcome>;
    fn find_vocabulary(&mut self, word: &str) -> Result<Option<String>>;
    /// Returns `None` when another writer created the word first.
    fn create_vocabulary(&mut self, entry: &NewVocabulary) -> Result<Option<String>>;
    fn insert_mapping(&mut self, mapping: &MembershipRecord) -> Result<InsertOutcome>;
    fn set_total_words(&mut self, wordlist_id: &str, total_words: usize) -> Result<()>;
    fn request_count(&self) -> usize;

    fn find_or_create_vocabulary(
        &mut self,
        word: &str,
        defaults: &VocabularyDefaults,
    ) -> Result<VocabularyResolution> {
        if let Some(id) = self.find_vocabulary(word)? {
            return Ok(VocabularyResolution::Reused(id));
        }
        match self.create_vocabulary(&NewVocabulary::placeholder(word, defaults))? {
            Some(id) => Ok(VocabularyResolution::Created(id)),
            None => self
                .find_vocabulary(word)?
                .map(VocabularyResolution::Reused)
                .ok_or_else(|| {
                    anyhow!("vocabulary insert for {word} conflicted but no row is visible")
                }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredWordList {
    pub id: String,
    pub record: WordListRecord,
}

/// In-process store with the same uniqueness keys as the relational schema.
#[derive(Debug, Default)]
pub struct MemoryStore {
    wordlists: Vec<StoredWordList>,
    tags: BTreeSet<(String, u8, String)>,
    vocabulary: BTreeMap<String, String>,
    mappings: BTreeSet<(String, String, String, String)>,
    next_id: usize,
    requests: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> StoreCounts {
        StoreCounts {
            wordlists: self.wordlists.len(),
            tags: self.tags.len(),
            vocabulary: self.vocabulary.len(),
            mappings: self.mappings.len(),
        }
    }

    pub fn wordlist(&self, code: &str) -> Option<&StoredWordList> {
        self.wordlists.iter().find(|list| list.record.code == code)
    }

    fn allocate_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

impl VocabularyStore for MemoryStore {
    fn upsert_wordlist(&mut self, list: &WordListRecord) -> Result<UpsertedWordList> {
        self.requests += 1;
        if let Some(existing) = self
            .wordlists
            .iter_mut()
            .find(|stored| stored.record.code == list.code)
        {
            existing.record.name = list.name.clone();
            existing.record.description = list.description.clone();
            existing.record.total_words = list.total_words;
            return Ok(UpsertedWordList {
                id: existing.id.clone(),
                created: false,
            });
        }
        let id = self.allocate_id("wordlist");
        self.wordlists.push(StoredWordList {
            id: id.clone(),
            record: list.clone(),
        });
        Ok(UpsertedWordList { id, created: true })
    }

    fn insert_tag(&mut self, tag: &TagRecord) -> Result<InsertOutcome> {
        self.requests += 1;
        let key = (tag.wordlist_id.clone(), tag.level, tag.code.clone());
        Ok(if self.tags.insert(key) {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyExists
        })
    }

    fn find_vocabulary(&mut self, word: &str) -> Result<Option<String>> {
        self.requests += 1;
        Ok(self.vocabulary.get(word).cloned())
    }

    fn create_vocabulary(&mut self, entry: &NewVocabulary) -> Result<Option<String>> {
        self.requests += 1;
        if self.vocabulary.contains_key(&entry.word) {
            return Ok(None);
        }
        let id = self.allocate_id("vocab");
        self.vocabulary.insert(entry.word.clone(), id.clone());
        Ok(Some(id))
    }

    fn insert_mapping(&mut self, mapping: &MembershipRecord) -> Result<InsertOutcome> {
        self.requests += 1;
        let key = (
            mapping.wordlist_id.clone(),
            mapping.word.clone(),
            mapping.level_2_tag.clone(),
            mapping.level_3_tag.clone(),
        );
        Ok(if self.mappings.insert(key) {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyExists
        })
    }

    fn set_total_words(&mut self, wordlist_id: &str, total_words: usize) -> Result<()> {
        self.requests += 1;
        let list = self
            .wordlists
            .iter_mut()
            .find(|stored| stored.id == wordlist_id)
            .ok_or_else(|| anyhow!("unknown wordlist id {wordlist_id}"))?;
        list.record.total_words = total_words;
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.requests
    }
}

#[cfg(test)]
mod tests {
    use super::{
        InsertOutcome, MemoryStore, MembershipRecord, TagRecord, VocabularyResolution,
        VocabularyStore, WordListRecord,
    };
    use crate::config::{ListSection, VocabularyDefaults};
    use crate::plan::MembershipTriple;

    fn list(code: &str, name: &str) -> WordListRecord {
        WordListRecord::from_list(
            &ListSection {
                code: Some(code.to_string()),
                name: Some(name.to_string()),
                ..ListSection::default()
            },
            0,
        )
        .expect("record")
    }

    #[test]
    fn wordlist_upsert_updates_instead_of_duplicating() {
        let mut store = MemoryStore::new();
        let first = store.upsert_wordlist(&list("hsk", "HSK")).expect("insert");
        let second = store.upsert_wordlist(&list("hsk", "HSK 2012")).expect("update");

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.counts().wordlists, 1);
        assert_eq!(store.wordlist("hsk").expect("list").record.name, "HSK 2012");
    }

    #[test]
    fn tag_insert_skips_existing_key() {
        let mut store = MemoryStore::new();
        let tag = TagRecord {
            wordlist_id: "wordlist-1".to_string(),
            level: 2,
            code: "HSK1級".to_string(),
            display_name: "HSK1級".to_string(),
            sort_order: 0,
        };
        assert_eq!(store.insert_tag(&tag).expect("insert"), InsertOutcome::Inserted);
        assert_eq!(
            store.insert_tag(&tag).expect("insert again"),
            InsertOutcome::AlreadyExists
        );
        assert_eq!(store.counts().tags, 1);
    }

    #[test]
    fn find_or_create_reuses_existing_word() {
        let mut store = MemoryStore::new();
        let defaults = VocabularyDefaults::default();
        let created = store.find_or_create_vocabulary("水", &defaults).expect("create");
        let reused = store.find_or_create_vocabulary("水", &defaults).expect("reuse");

        assert!(matches!(created, VocabularyResolution::Created(_)));
        assert_eq!(reused, VocabularyResolution::Reused(created.id().to_string()));
        assert_eq!(store.counts().vocabulary, 1);
    }

    #[test]
    fn mapping_key_treats_absent_tier3_as_one_position() {
        let mut store = MemoryStore::new();
        let triple = MembershipTriple {
            word: "水".to_string(),
            tier2: Some("單元二".to_string()),
            tier3: None,
            first_occurrence: true,
        };
        let mapping = MembershipRecord::from_triple("wordlist-1", "vocab-2", &triple);
        assert_eq!(mapping.level_3_tag, "");
        assert_eq!(mapping.tag_path, vec!["單元二"]);

        assert_eq!(store.insert_mapping(&mapping).expect("map"), InsertOutcome::Inserted);
        assert_eq!(
            store.insert_mapping(&mapping).expect("map again"),
            InsertOutcome::AlreadyExists
        );
        assert_eq!(store.request_count(), 2);
    }
}
