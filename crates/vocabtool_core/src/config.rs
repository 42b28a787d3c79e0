use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LIST_TYPE: &str = "system";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PROGRESS_EVERY: usize = 100;
pub const DEFAULT_ERROR_LOG_LIMIT: usize = 10;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct VocabConfig {
    #[serde(default)]
    pub list: ListSection,
    #[serde(default)]
    pub columns: ColumnSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub import: ImportSection,
    #[serde(default)]
    pub vocabulary_defaults: VocabularyDefaults,
}

/// Declared metadata of the list being imported.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ListSection {
    pub code: Option<String>,
    pub name: Option<String>,
    pub id: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type", default = "default_list_type")]
    pub kind: String,
    pub owner_id: Option<String>,
    #[serde(default = "default_true")]
    pub is_public: bool,
    pub level_2_label: Option<String>,
    pub level_3_label: Option<String>,
    pub expected_words: Option<usize>,
}

impl Default for ListSection {
    fn default() -> Self {
        Self {
            code: None,
            name: None,
            id: None,
            description: None,
            kind: default_list_type(),
            owner_id: None,
            is_public: true,
            level_2_label: None,
            level_3_label: None,
            expected_words: None,
        }
    }
}

/// Accepted header spellings, in preference order.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ColumnSection {
    #[serde(default = "default_word_columns")]
    pub word: Vec<String>,
    #[serde(default = "default_tier2_columns")]
    pub tier2: Vec<String>,
    #[serde(default = "default_tier3_columns")]
    pub tier3: Vec<String>,
}

impl Default for ColumnSection {
    fn default() -> Self {
        Self {
            word: default_word_columns(),
            tier2: default_tier2_columns(),
            tier3: default_tier3_columns(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct StoreSection {
    pub url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ImportSection {
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
    #[serde(default = "default_error_log_limit")]
    pub error_log_limit: usize,
}

impl Default for ImportSection {
    fn default() -> Self {
        Self {
            progress_every: DEFAULT_PROGRESS_EVERY,
            error_log_limit: DEFAULT_ERROR_LOG_LIMIT,
        }
    }
}

/// Placeholder classification written for vocabulary the store has never seen.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct VocabularyDefaults {
    #[serde(default = "default_difficulty_level")]
    pub difficulty_level: i64,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_frequency")]
    pub frequency: i64,
}

impl Default for VocabularyDefaults {
    fn default() -> Self {
        Self {
            difficulty_level: default_difficulty_level(),
            category: default_category(),
            frequency: default_frequency(),
        }
    }
}

/// Command-line values that take precedence over `[list]`.
#[derive(Debug, Clone, Default)]
pub struct ListOverrides {
    pub code: Option<String>,
    pub name: Option<String>,
    pub id: Option<String>,
    pub description: Option<String>,
}

impl ListSection {
    pub fn with_overrides(&self, overrides: &ListOverrides) -> Self {
        let pick = |flag: &Option<String>, configured: &Option<String>| {
            flag.as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .or_else(|| configured.clone())
        };
        Self {
            code: pick(&overrides.code, &self.code),
            name: pick(&overrides.name, &self.name),
            id: pick(&overrides.id, &self.id),
            description: pick(&overrides.description, &self.description),
            ..self.clone()
        }
    }

    pub fn require_code(&self) -> Result<&str> {
        match self.code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => Ok(code),
            _ => bail!("list code is required (set [list].code or pass --code)"),
        }
    }

    pub fn hierarchy_config(&self) -> serde_json::Value {
        serde_json::json!({
            "level_2_label": self.level_2_label,
            "level_3_label": self.level_3_label,
        })
    }
}

impl VocabConfig {
    /// Resolve the remote store URL: env VOCAB_STORE_URL > config > None.
    pub fn store_url(&self) -> Option<String> {
        env_non_empty("VOCAB_STORE_URL").or_else(|| self.store.url.clone())
    }

    /// The store API key is never read from the config file.
    pub fn store_key(&self) -> Option<String> {
        env_non_empty("VOCAB_STORE_KEY")
    }
}

/// Load and parse a VocabConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<VocabConfig> {
    if !config_path.exists() {
        return Ok(VocabConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: VocabConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_non_empty(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn default_list_type() -> String {
    DEFAULT_LIST_TYPE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_word_columns() -> Vec<String> {
    vec!["詞語".to_string(), "词语".to_string(), "word".to_string()]
}

fn default_tier2_columns() -> Vec<String> {
    vec![
        "第二層級".to_string(),
        "第二层级".to_string(),
        "level_2_tag".to_string(),
    ]
}

fn default_tier3_columns() -> Vec<String> {
    vec![
        "第三層級".to_string(),
        "第三层级".to_string(),
        "level_3_tag".to_string(),
    ]
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_retries() -> usize {
    2
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_progress_every() -> usize {
    DEFAULT_PROGRESS_EVERY
}

fn default_error_log_limit() -> usize {
    DEFAULT_ERROR_LOG_LIMIT
}

fn default_difficulty_level() -> i64 {
    3
}

fn default_category() -> String {
    "待分類".to_string()
}

fn default_frequency() -> i64 {
    50
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_script_variant_aliases() {
        let config = VocabConfig::default();
        assert_eq!(config.columns.word, vec!["詞語", "词语", "word"]);
        assert_eq!(config.columns.tier2[1], "第二层级");
        assert_eq!(config.list.kind, "system");
        assert!(config.list.is_public);
        assert_eq!(config.vocabulary_defaults.category, "待分類");
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert!(config.list.code.is_none());
        assert_eq!(config.import.error_log_limit, 10);
    }

    #[test]
    fn load_config_parses_list_section() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[list]
code = "hsk_standard_2012"
name = "HSK標準詞表 2012版"
type = "custom"
level_2_label = "等級"
expected_words = 4991

[columns]
word = ["vocab"]

[vocabulary_defaults]
frequency = 10
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.list.code.as_deref(), Some("hsk_standard_2012"));
        assert_eq!(config.list.kind, "custom");
        assert_eq!(config.list.level_2_label.as_deref(), Some("等級"));
        assert!(config.list.level_3_label.is_none());
        assert_eq!(config.list.expected_words, Some(4991));
        assert_eq!(config.columns.word, vec!["vocab"]);
        assert_eq!(config.columns.tier3[0], "第三層級");
        assert_eq!(config.vocabulary_defaults.frequency, 10);
        assert_eq!(config.vocabulary_defaults.difficulty_level, 3);
    }

    #[test]
    fn list_overrides_win_over_config() {
        let list = ListSection {
            code: Some("from_config".to_string()),
            name: Some("Configured".to_string()),
            level_3_label: Some("課文".to_string()),
            ..ListSection::default()
        };
        let resolved = list.with_overrides(&ListOverrides {
            code: Some(" from_flag ".to_string()),
            name: Some("  ".to_string()),
            ..ListOverrides::default()
        });
        assert_eq!(resolved.require_code().expect("code"), "from_flag");
        assert_eq!(resolved.name.as_deref(), Some("Configured"));
        assert_eq!(resolved.level_3_label.as_deref(), Some("課文"));
        assert_eq!(
            resolved.hierarchy_config(),
            serde_json::json!({"level_2_label": null, "level_3_label": "課文"})
        );
    }

    #[test]
    fn missing_code_is_an_error() {
        let error = ListSection::default().require_code().expect_err("must fail");
        assert!(error.to_string().contains("list code is required"));
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[list\ncode = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }
}
