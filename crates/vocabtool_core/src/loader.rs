use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ImportSection, VocabularyDefaults};
use crate::plan::{ImportPlan, MembershipTriple};
use crate::store::{
    InsertOutcome, MembershipRecord, TagRecord, VocabularyResolution, VocabularyStore,
    WordListRecord,
};

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub progress_every: usize,
    pub error_log_limit: usize,
    pub vocabulary_defaults: VocabularyDefaults,
}

impl LoadOptions {
    pub fn new(import: &ImportSection, vocabulary_defaults: &VocabularyDefaults) -> Self {
        Self {
            progress_every: import.progress_every,
            error_log_limit: import.error_log_limit,
            vocabulary_defaults: vocabulary_defaults.clone(),
        }
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self::new(&ImportSection::default(), &VocabularyDefaults::default())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadFailure {
    pub word: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub wordlist_id: String,
    pub wordlist_created: bool,
    pub tags_inserted: usize,
    pub tags_existing: usize,
    pub vocabulary_created: usize,
    pub vocabulary_reused: usize,
    pub mappings_inserted: usize,
    pub mappings_existing: usize,
    pub failed: usize,
    /// Detailed failures, capped at `error_log_limit`; `failed` stays exact.
    pub failures: Vec<LoadFailure>,
    pub total_words: usize,
    pub total_words_updated: bool,
    pub requests: usize,
}

impl LoadReport {
    pub fn processed(&self) -> usize {
        self.mappings_inserted + self.mappings_existing + self.failed
    }
}

/// Run the import against `store` in list, tags, vocabulary+mappings, total order.
///
/// List and tag failures abort with an error since later steps need their
/// ids. Per-word failures are counted and the batch continues.
pub fn load_plan<S: VocabularyStore>(
    store: &mut S,
    list: &WordListRecord,
    plan: &ImportPlan,
    options: &LoadOptions,
) -> Result<LoadReport> {
    let mut report = LoadReport {
        total_words: plan.total_words(),
        ..LoadReport::default()
    };

    let upserted = store
        .upsert_wordlist(list)
        .with_context(|| format!("failed to create or update wordlist {}", list.code))?;
    info!(
        code = %list.code,
        id = %upserted.id,
        created = upserted.created,
        "wordlist ready"
    );
    report.wordlist_id = upserted.id;
    report.wordlist_created = upserted.created;

    for tag in plan.taxonomy.iter() {
        let record = TagRecord::from_planned(&report.wordlist_id, tag);
        let outcome = store.insert_tag(&record).with_context(|| {
            format!("failed to create tier-{} tag {}", tag.level, tag.code)
        })?;
        match outcome {
            InsertOutcome::Inserted => report.tags_inserted += 1,
            InsertOutcome::AlreadyExists => report.tags_existing += 1,
        }
    }
    info!(
        inserted = report.tags_inserted,
        existing = report.tags_existing,
        "taxonomy ready"
    );

    // `None` marks a word whose lookup already failed in this run.
    let mut resolved: HashMap<&str, Option<String>> = HashMap::new();
    let total = plan.triples.len();
    for (index, triple) in plan.triples.iter().enumerate() {
        let vocabulary_id = resolve_vocabulary(store, triple, &mut resolved, &mut report, options);
        if let Some(vocabulary_id) = vocabulary_id {
            let mapping =
                MembershipRecord::from_triple(&report.wordlist_id, &vocabulary_id, triple);
            match store.insert_mapping(&mapping) {
                Ok(InsertOutcome::Inserted) => report.mappings_inserted += 1,
                Ok(InsertOutcome::AlreadyExists) => report.mappings_existing += 1,
                Err(error) => record_failure(&mut report, &triple.word, &error, options),
            }
        }

        let done = index + 1;
        if options.progress_every > 0 && (done % options.progress_every == 0 || done == total) {
            info!(done, total, failed = report.failed, "import progress");
        }
    }

    match store.set_total_words(&report.wordlist_id, plan.total_words()) {
        Ok(()) => report.total_words_updated = true,
        Err(error) => warn!(error = %format!("{error:#}"), "failed to update wordlist total_words"),
    }

    report.requests = store.request_count();
    Ok(report)
}

fn resolve_vocabulary<'a, S: VocabularyStore>(
    store: &mut S,
    triple: &'a MembershipTriple,
    resolved: &mut HashMap<&'a str, Option<String>>,
    report: &mut LoadReport,
    options: &LoadOptions,
) -> Option<String> {
    if !triple.first_occurrence
        && let Some(cached) = resolved.get(triple.word.as_str())
    {
        if cached.is_none() {
            record_message(
                report,
                &triple.word,
                "vocabulary lookup failed earlier in this run".to_string(),
                options,
            );
        }
        return cached.clone();
    }

    match store.find_or_create_vocabulary(&triple.word, &options.vocabulary_defaults) {
        Ok(resolution) => {
            match &resolution {
                VocabularyResolution::Created(id) => {
                    debug!(word = %triple.word, id = %id, "vocabulary created");
                    report.vocabulary_created += 1;
                }
                VocabularyResolution::Reused(_) => report.vocabulary_reused += 1,
            }
            let id = resolution.id().to_string();
            resolved.insert(triple.word.as_str(), Some(id.clone()));
            Some(id)
        }
        Err(error) => {
            resolved.insert(triple.word.as_str(), None);
            record_failure(report, &triple.word, &error, options);
            None
        }
    }
}

fn record_failure(
    report: &mut LoadReport,
    word: &str,
    error: &anyhow::Error,
    options: &LoadOptions,
) {
    record_message(report, word, format!("{error:#}"), options);
}

fn record_message(report: &mut LoadReport, word: &str, message: String, options: &LoadOptions) {
    report.failed += 1;
    if report.failures.len() < options.error_log_limit {
        warn!(word, error = %message, "import row failed");
        report.failures.push(LoadFailure {
            word: word.to_string(),
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use anyhow::{Result, bail};

    use super::{LoadOptions, load_plan};
    use crate::config::ListSection;
    use crate::plan::plan_import;
    use crate::records::VocabularyRecord;
    use crate::store::{
        InsertOutcome, MemoryStore, MembershipRecord, NewVocabulary, StoreCounts, TagRecord,
        UpsertedWordList, VocabularyStore, WordListRecord,
    };

    fn list_record(code: &str, total_words: usize) -> WordListRecord {
        WordListRecord::from_list(
            &ListSection {
                code: Some(code.to_string()),
                ..ListSection::default()
            },
            total_words,
        )
        .expect("list record")
    }

    fn example_records() -> Vec<VocabularyRecord> {
        vec![
            VocabularyRecord::new("學", Some("單元一"), Some("課一")),
            VocabularyRecord::new("習", Some("單元一"), Some("課一")),
            VocabularyRecord::new("水", Some("單元二"), None),
        ]
    }

    /// Wraps a MemoryStore, failing selected operations and counting lookups.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_lookup_words: HashSet<String>,
        fail_mapping_words: HashSet<String>,
        fail_tags: bool,
        fail_total_words: bool,
        lookups: Vec<String>,
    }

    impl VocabularyStore for FlakyStore {
        fn upsert_wordlist(&mut self, list: &WordListRecord) -> Result<UpsertedWordList> {
            self.inner.upsert_wordlist(list)
        }

        fn insert_tag(&mut self, tag: &TagRecord) -> Result<InsertOutcome> {
            if self.fail_tags {
                bail!("connection reset");
            }
            self.inner.insert_tag(tag)
        }

        fn find_vocabulary(&mut self, word: &str) -> Result<Option<String>> {
            self.lookups.push(word.to_string());
            if self.fail_lookup_words.contains(word) {
                bail!("timeout looking up {word}");
            }
            self.inner.find_vocabulary(word)
        }

        fn create_vocabulary(&mut self, entry: &NewVocabulary) -> Result<Option<String>> {
            self.inner.create_vocabulary(entry)
        }

        fn insert_mapping(&mut self, mapping: &MembershipRecord) -> Result<InsertOutcome> {
            if self.fail_mapping_words.contains(&mapping.word) {
                bail!("HTTP 500");
            }
            self.inner.insert_mapping(mapping)
        }

        fn set_total_words(&mut self, wordlist_id: &str, total_words: usize) -> Result<()> {
            if self.fail_total_words {
                bail!("HTTP 503");
            }
            self.inner.set_total_words(wordlist_id, total_words)
        }

        fn request_count(&self) -> usize {
            self.inner.request_count()
        }
    }

    #[test]
    fn example_import_populates_every_table() {
        let mut store = MemoryStore::new();
        let plan = plan_import(&example_records());
        let report = load_plan(
            &mut store,
            &list_record("primary", 0),
            &plan,
            &LoadOptions::default(),
        )
        .expect("load");

        assert!(report.wordlist_created);
        assert_eq!(report.tags_inserted, 3);
        assert_eq!(report.vocabulary_created, 3);
        assert_eq!(report.mappings_inserted, 3);
        assert_eq!(report.failed, 0);
        assert!(report.total_words_updated);
        assert_eq!(
            store.counts(),
            StoreCounts {
                wordlists: 1,
                tags: 3,
                vocabulary: 3,
                mappings: 3
            }
        );
        assert_eq!(store.wordlist("primary").expect("list").record.total_words, 3);
    }

    #[test]
    fn reloading_same_input_creates_no_duplicates() {
        let mut store = MemoryStore::new();
        let plan = plan_import(&example_records());
        let list = list_record("primary", 3);
        load_plan(&mut store, &list, &plan, &LoadOptions::default()).expect("first load");
        let after_first = store.counts();

        let second =
            load_plan(&mut store, &list, &plan, &LoadOptions::default()).expect("second load");
        assert_eq!(store.counts(), after_first);
        assert!(!second.wordlist_created);
        assert_eq!(second.tags_existing, 3);
        assert_eq!(second.vocabulary_created, 0);
        assert_eq!(second.vocabulary_reused, 3);
        assert_eq!(second.mappings_existing, 3);
        assert_eq!(second.failed, 0);
    }

    #[test]
    fn shared_word_is_reused_across_lists() {
        let mut store = MemoryStore::new();
        let list_a = plan_import(&[VocabularyRecord::new("水", Some("單元二"), None)]);
        let list_b = plan_import(&[VocabularyRecord::new("水", Some("HSK1級"), None)]);

        let first = load_plan(&mut store, &list_record("a", 1), &list_a, &LoadOptions::default())
            .expect("list a");
        let second = load_plan(&mut store, &list_record("b", 1), &list_b, &LoadOptions::default())
            .expect("list b");

        assert_eq!(first.vocabulary_created, 1);
        assert_eq!(second.vocabulary_reused, 1);
        assert_eq!(store.counts().vocabulary, 1);
        assert_eq!(store.counts().mappings, 2);
        assert_eq!(store.counts().wordlists, 2);
    }

    #[test]
    fn repeated_word_is_looked_up_once_per_run() {
        let records = vec![
            VocabularyRecord::new("水", Some("單元一"), Some("課一")),
            VocabularyRecord::new("水", Some("單元一"), Some("課二")),
            VocabularyRecord::new("水", Some("單元二"), None),
        ];
        let mut store = FlakyStore::default();
        let report = load_plan(
            &mut store,
            &list_record("primary", 3),
            &plan_import(&records),
            &LoadOptions::default(),
        )
        .expect("load");

        assert_eq!(store.lookups, vec!["水".to_string()]);
        assert_eq!(report.vocabulary_created, 1);
        assert_eq!(report.mappings_inserted, 3);
    }

    #[test]
    fn per_word_failures_are_counted_and_batch_continues() {
        let records = vec![
            VocabularyRecord::new("學", Some("單元一"), Some("課一")),
            VocabularyRecord::new("習", Some("單元一"), Some("課一")),
            VocabularyRecord::new("學", Some("單元二"), None),
            VocabularyRecord::new("水", Some("單元二"), None),
        ];
        let mut store = FlakyStore {
            fail_lookup_words: HashSet::from(["學".to_string()]),
            fail_mapping_words: HashSet::from(["水".to_string()]),
            ..FlakyStore::default()
        };
        let options = LoadOptions {
            error_log_limit: 2,
            ..LoadOptions::default()
        };
        let report = load_plan(
            &mut store,
            &list_record("primary", 4),
            &plan_import(&records),
            &options,
        )
        .expect("load completes");

        assert_eq!(report.failed, 3);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].word, "學");
        assert!(report.failures[0].message.contains("timeout"));
        assert_eq!(report.mappings_inserted, 1);
        assert_eq!(report.processed(), 4);
        assert_eq!(store.lookups.iter().filter(|word| *word == "學").count(), 1);
        assert!(report.total_words_updated);
    }

    #[test]
    fn tag_failure_aborts_the_run() {
        let mut store = FlakyStore {
            fail_tags: true,
            ..FlakyStore::default()
        };
        let error = load_plan(
            &mut store,
            &list_record("primary", 3),
            &plan_import(&example_records()),
            &LoadOptions::default(),
        )
        .expect_err("must abort");
        assert!(format!("{error:#}").contains("connection reset"));
        assert_eq!(store.inner.counts().mappings, 0);
    }

    #[test]
    fn total_words_update_failure_is_reported_not_fatal() {
        let mut store = FlakyStore {
            fail_total_words: true,
            ..FlakyStore::default()
        };
        let report = load_plan(
            &mut store,
            &list_record("primary", 3),
            &plan_import(&example_records()),
            &LoadOptions::default(),
        )
        .expect("load");
        assert!(!report.total_words_updated);
        assert_eq!(report.mappings_inserted, 3);
    }
}
