use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::store::{
    InsertOutcome, MembershipRecord, NewVocabulary, StoreCounts, TagRecord, UpsertedWordList,
    VocabularyStore, WordListRecord,
};

const STORE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS wordlists (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    description TEXT,
    type TEXT NOT NULL,
    owner_id TEXT,
    hierarchy_config TEXT NOT NULL,
    total_words INTEGER NOT NULL,
    is_public INTEGER NOT NULL,
    created_at_unix INTEGER NOT NULL,
    updated_at_unix INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS wordlist_tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wordlist_id INTEGER NOT NULL,
    tag_level INTEGER NOT NULL,
    tag_code TEXT NOT NULL,
    tag_display_name TEXT NOT NULL,
    sort_order INTEGER NOT NULL,
    UNIQUE (wordlist_id, tag_level, tag_code),
    FOREIGN KEY (wordlist_id) REFERENCES wordlists(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS vocabulary (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    word TEXT NOT NULL UNIQUE,
    difficulty_level INTEGER NOT NULL,
    category TEXT NOT NULL,
    frequency INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS vocabulary_wordlist_mapping (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wordlist_id INTEGER NOT NULL,
    vocabulary_id INTEGER NOT NULL,
    word TEXT NOT NULL,
    level_2_tag TEXT NOT NULL,
    level_3_tag TEXT NOT NULL,
    tag_path TEXT NOT NULL,
    UNIQUE (wordlist_id, word, level_2_tag, level_3_tag),
    FOREIGN KEY (wordlist_id) REFERENCES wordlists(id) ON DELETE CASCADE,
    FOREIGN KEY (vocabulary_id) REFERENCES vocabulary(id)
);
CREATE INDEX IF NOT EXISTS idx_mapping_vocabulary ON vocabulary_wordlist_mapping(vocabulary_id);

CREATE TABLE IF NOT EXISTS import_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wordlist_code TEXT NOT NULL,
    source_path TEXT NOT NULL,
    source_sha256 TEXT NOT NULL,
    total_words INTEGER NOT NULL,
    mappings_inserted INTEGER NOT NULL,
    mappings_existing INTEGER NOT NULL,
    failed INTEGER NOT NULL,
    finished_at_unix INTEGER NOT NULL
);
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportRunRecord {
    pub wordlist_code: String,
    pub source_path: String,
    pub source_sha256: String,
    pub total_words: usize,
    pub mappings_inserted: usize,
    pub mappings_existing: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredImportRun {
    pub run: ImportRunRecord,
    pub finished_at_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WordListSummary {
    pub code: String,
    pub name: String,
    pub total_words: usize,
    pub mappings: usize,
    pub tags: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredStats {
    pub db_path: String,
    pub counts: StoreCounts,
    pub wordlists: Vec<WordListSummary>,
    pub last_run: Option<StoredImportRun>,
}

/// Local relational store with the same uniqueness keys as the hosted schema.
pub struct SqliteStore {
    connection: Connection,
    db_path: PathBuf,
    requests: usize,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        ensure_db_parent(db_path)?;
        let connection = open_connection(db_path)?;
        connection
            .execute_batch(STORE_SCHEMA_SQL)
            .context("failed to initialize vocabulary store schema")?;
        Ok(Self {
            connection,
            db_path: db_path.to_path_buf(),
            requests: 0,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        Ok(StoreCounts {
            wordlists: count_query(&self.connection, "SELECT COUNT(*) FROM wordlists")?,
            tags: count_query(&self.connection, "SELECT COUNT(*) FROM wordlist_tags")?,
            vocabulary: count_query(&self.connection, "SELECT COUNT(*) FROM vocabulary")?,
            mappings: count_query(
                &self.connection,
                "SELECT COUNT(*) FROM vocabulary_wordlist_mapping",
            )?,
        })
    }

    pub fn record_import_run(&mut self, run: &ImportRunRecord) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO import_runs (
                    wordlist_code, source_path, source_sha256, total_words,
                    mappings_inserted, mappings_existing, failed, finished_at_unix
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run.wordlist_code,
                    run.source_path,
                    run.source_sha256,
                    to_sql_count(run.total_words)?,
                    to_sql_count(run.mappings_inserted)?,
                    to_sql_count(run.mappings_existing)?,
                    to_sql_count(run.failed)?,
                    i64::try_from(unix_timestamp()?).context("timestamp does not fit into i64")?,
                ],
            )
            .with_context(|| format!("failed to record import run for {}", run.wordlist_code))?;
        Ok(())
    }

    pub fn last_import_run(&self, wordlist_code: Option<&str>) -> Result<Option<StoredImportRun>> {
        let row = self
            .connection
            .query_row(
                "SELECT wordlist_code, source_path, source_sha256, total_words,
                        mappings_inserted, mappings_existing, failed, finished_at_unix
                 FROM import_runs
                 WHERE ?1 IS NULL OR wordlist_code = ?1
                 ORDER BY id DESC
                 LIMIT 1",
                [wordlist_code],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()
            .context("failed to read import run ledger")?;
        let Some((code, path, sha, total, inserted, existing, failed, finished)) = row else {
            return Ok(None);
        };
        Ok(Some(StoredImportRun {
            run: ImportRunRecord {
                wordlist_code: code,
                source_path: path,
                source_sha256: sha,
                total_words: from_sql_count(total)?,
                mappings_inserted: from_sql_count(inserted)?,
                mappings_existing: from_sql_count(existing)?,
                failed: from_sql_count(failed)?,
            },
            finished_at_unix: u64::try_from(finished).context("finished_at_unix is negative")?,
        }))
    }

    pub fn stats(&self) -> Result<StoredStats> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT w.code, w.name, w.total_words,
                        (SELECT COUNT(*) FROM vocabulary_wordlist_mapping m WHERE m.wordlist_id = w.id),
                        (SELECT COUNT(*) FROM wordlist_tags t WHERE t.wordlist_id = w.id)
                 FROM wordlists w
                 ORDER BY w.code ASC",
            )
            .context("failed to prepare wordlist summary query")?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .context("failed to run wordlist summary query")?;

        let mut wordlists = Vec::new();
        for row in rows {
            let (code, name, total_words, mappings, tags) =
                row.context("failed to read wordlist summary row")?;
            wordlists.push(WordListSummary {
                code,
                name,
                total_words: from_sql_count(total_words)?,
                mappings: from_sql_count(mappings)?,
                tags: from_sql_count(tags)?,
            });
        }

        Ok(StoredStats {
            db_path: self.db_path.to_string_lossy().replace('\\', "/"),
            counts: self.counts()?,
            wordlists,
            last_run: self.last_import_run(None)?,
        })
    }
}

impl VocabularyStore for SqliteStore {
    fn upsert_wordlist(&mut self, list: &WordListRecord) -> Result<UpsertedWordList> {
        self.requests += 1;
        let now = i64::try_from(unix_timestamp()?).context("timestamp does not fit into i64")?;
        let existing: Option<i64> = self
            .connection
            .query_row(
                "SELECT id FROM wordlists WHERE code = ?1",
                [&list.code],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to look up wordlist {}", list.code))?;

        if let Some(id) = existing {
            self.connection
                .execute(
                    "UPDATE wordlists
                     SET name = ?1, description = ?2, total_words = ?3, updated_at_unix = ?4
                     WHERE id = ?5",
                    params![list.name, list.description, to_sql_count(list.total_words)?, now, id],
                )
                .with_context(|| format!("failed to update wordlist {}", list.code))?;
            return Ok(UpsertedWordList {
                id: id.to_string(),
                created: false,
            });
        }

        let hierarchy_config = serde_json::to_string(&list.hierarchy_config)
            .context("failed to serialize hierarchy_config")?;
        self.connection
            .execute(
                "INSERT INTO wordlists (
                    code, name, description, type, owner_id, hierarchy_config,
                    total_words, is_public, created_at_unix, updated_at_unix
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    list.code,
                    list.name,
                    list.description,
                    list.kind,
                    list.owner_id,
                    hierarchy_config,
                    to_sql_count(list.total_words)?,
                    list.is_public,
                    now,
                ],
            )
            .with_context(|| format!("failed to insert wordlist {}", list.code))?;
        Ok(UpsertedWordList {
            id: self.connection.last_insert_rowid().to_string(),
            created: true,
        })
    }

    fn insert_tag(&mut self, tag: &TagRecord) -> Result<InsertOutcome> {
        self.requests += 1;
        let changed = self
            .connection
            .execute(
                "INSERT INTO wordlist_tags (
                    wordlist_id, tag_level, tag_code, tag_display_name, sort_order
                 ) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (wordlist_id, tag_level, tag_code) DO NOTHING",
                params![
                    parse_id(&tag.wordlist_id)?,
                    tag.level,
                    tag.code,
                    tag.display_name,
                    to_sql_count(tag.sort_order)?,
                ],
            )
            .with_context(|| format!("failed to insert tag {}", tag.code))?;
        Ok(outcome_from_changes(changed))
    }

    fn find_vocabulary(&mut self, word: &str) -> Result<Option<String>> {
        self.requests += 1;
        let id: Option<i64> = self
            .connection
            .query_row("SELECT id FROM vocabulary WHERE word = ?1", [word], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("failed to look up vocabulary {word}"))?;
        Ok(id.map(|id| id.to_string()))
    }

    fn create_vocabulary(&mut self, entry: &NewVocabulary) -> Result<Option<String>> {
        self.requests += 1;
        let changed = self
            .connection
            .execute(
                "INSERT INTO vocabulary (word, difficulty_level, category, frequency)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (word) DO NOTHING",
                params![
                    entry.word,
                    entry.difficulty_level,
                    entry.category,
                    entry.frequency
                ],
            )
            .with_context(|| format!("failed to insert vocabulary {}", entry.word))?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(self.connection.last_insert_rowid().to_string()))
    }

    fn insert_mapping(&mut self, mapping: &MembershipRecord) -> Result<InsertOutcome> {
        self.requests += 1;
        let tag_path =
            serde_json::to_string(&mapping.tag_path).context("failed to serialize tag_path")?;
        let changed = self
            .connection
            .execute(
                "INSERT INTO vocabulary_wordlist_mapping (
                    wordlist_id, vocabulary_id, word, level_2_tag, level_3_tag, tag_path
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (wordlist_id, word, level_2_tag, level_3_tag) DO NOTHING",
                params![
                    parse_id(&mapping.wordlist_id)?,
                    parse_id(&mapping.vocabulary_id)?,
                    mapping.word,
                    mapping.level_2_tag,
                    mapping.level_3_tag,
                    tag_path,
                ],
            )
            .with_context(|| format!("failed to insert mapping for {}", mapping.word))?;
        Ok(outcome_from_changes(changed))
    }

    fn set_total_words(&mut self, wordlist_id: &str, total_words: usize) -> Result<()> {
        self.requests += 1;
        let changed = self
            .connection
            .execute(
                "UPDATE wordlists SET total_words = ?1, updated_at_unix = ?2 WHERE id = ?3",
                params![
                    to_sql_count(total_words)?,
                    i64::try_from(unix_timestamp()?).context("timestamp does not fit into i64")?,
                    parse_id(wordlist_id)?,
                ],
            )
            .with_context(|| format!("failed to update total_words of wordlist {wordlist_id}"))?;
        if changed == 0 {
            anyhow::bail!("wordlist {wordlist_id} does not exist");
        }
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.requests
    }
}

/// Full hex SHA-256 of the source, recorded in the import ledger.
pub fn compute_source_hash(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn outcome_from_changes(changed: usize) -> InsertOutcome {
    if changed == 0 {
        InsertOutcome::AlreadyExists
    } else {
        InsertOutcome::Inserted
    }
}

fn parse_id(id: &str) -> Result<i64> {
    id.parse::<i64>()
        .with_context(|| format!("invalid sqlite row id: {id}"))
}

fn to_sql_count(value: usize) -> Result<i64> {
    i64::try_from(value).context("count does not fit into i64")
}

fn from_sql_count(value: i64) -> Result<usize> {
    usize::try_from(value).context("count does not fit into usize")
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

fn ensure_db_parent(db_path: &Path) -> Result<()> {
    let parent = db_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

fn count_query(connection: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed query: {sql}"))?;
    from_sql_count(count)
}

fn unix_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")
        .map(|duration| duration.as_secs())
}
