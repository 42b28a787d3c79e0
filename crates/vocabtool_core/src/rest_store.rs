use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::{Method, StatusCode, Url};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::VocabConfig;
use crate::store::{
    InsertOutcome, MembershipRecord, NewVocabulary, TagRecord, UpsertedWordList,
    VocabularyStore, WordListRecord,
};

const REST_PREFIX: &str = "rest/v1";
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl RestStoreConfig {
    pub fn from_config(config: &VocabConfig) -> Result<Self> {
        let Some(base_url) = config.store_url() else {
            bail!("remote store URL is not configured (set VOCAB_STORE_URL or [store].url)");
        };
        let Some(api_key) = config.store_key() else {
            bail!("remote store key is not configured (set VOCAB_STORE_KEY)");
        };
        Ok(Self {
            base_url,
            api_key,
            timeout_ms: config.store.timeout_ms,
            max_retries: config.store.retries,
            retry_delay_ms: config.store.retry_delay_ms,
        })
    }
}

enum RestOutcome {
    Rows(Vec<Value>),
    Conflict,
}

/// Final status and body of one logical call, after transport retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestResponse {
    pub status: StatusCode,
    pub body: String,
}

pub trait RestTransport {
    fn execute(
        &mut self,
        method: &Method,
        table: &str,
        filters: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<RestResponse>;
    fn request_count(&self) -> usize;
}

/// Blocking HTTP transport with `apikey` + bearer auth. Transient statuses and
/// connection errors are retried with exponential backoff.
pub struct HttpTransport {
    client: Client,
    config: RestStoreConfig,
    request_count: usize,
}

impl HttpTransport {
    pub fn new(config: RestStoreConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build remote store HTTP client")?;
        Ok(Self {
            client,
            config,
            request_count: 0,
        })
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl RestTransport for HttpTransport {
    fn execute(
        &mut self,
        method: &Method,
        table: &str,
        filters: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<RestResponse> {
        let url = table_url(&self.config.base_url, table)?;

        for attempt in 0..=self.config.max_retries {
            self.request_count += 1;
            let mut builder = self
                .client
                .request(method.clone(), url.clone())
                .header("apikey", self.config.api_key.clone())
                .header("Authorization", format!("Bearer {}", self.config.api_key))
                .header("Prefer", "return=representation")
                .query(filters);
            if let Some(body) = body {
                builder = builder.json(body);
            }

            match builder.send() {
                Ok(response) => {
                    let status = response.status();
                    let text = response
                        .text()
                        .context("failed to read remote store response body")?;
                    if attempt < self.config.max_retries && is_retryable_status(status) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Ok(RestResponse { status, body: text });
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error)
                        .with_context(|| format!("failed to call remote store {method} {table}"));
                }
            }
        }

        bail!("remote store request exhausted retry budget")
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// PostgREST-style remote store. Only unique violations (`23505`, or a bare
/// HTTP 409) count as "already exists".
pub struct RestStore<T = HttpTransport> {
    transport: T,
}

impl RestStore<HttpTransport> {
    pub fn new(config: RestStoreConfig) -> Result<Self> {
        Ok(Self::with_transport(HttpTransport::new(config)?))
    }
}

impl<T: RestTransport> RestStore<T> {
    pub fn with_transport(transport: T) -> Self {
        Self { transport }
    }

    fn request(
        &mut self,
        method: Method,
        table: &str,
        filters: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<RestOutcome> {
        let response = self.transport.execute(&method, table, filters, body)?;
        response_outcome(&method, table, &response)
    }

    fn select_id(&mut self, table: &str, column: &str, value: &str) -> Result<Option<String>> {
        let filters = [
            ("select", "id".to_string()),
            (column, format!("eq.{value}")),
            ("limit", "1".to_string()),
        ];
        match self.request(Method::GET, table, &filters, None)? {
            RestOutcome::Rows(rows) => rows.first().map(row_id).transpose(),
            RestOutcome::Conflict => bail!("unexpected conflict reading {table}"),
        }
    }
}

impl<T: RestTransport> VocabularyStore for RestStore<T> {
    fn upsert_wordlist(&mut self, list: &WordListRecord) -> Result<UpsertedWordList> {
        if let Some(id) = self.select_id("wordlists", "code", &list.code)? {
            let update = json!({
                "name": list.name,
                "description": list.description,
                "total_words": list.total_words,
            });
            self.request(
                Method::PATCH,
                "wordlists",
                &[("id", format!("eq.{id}"))],
                Some(&update),
            )?;
            return Ok(UpsertedWordList { id, created: false });
        }

        let insert = json!({
            "code": list.code,
            "name": list.name,
            "description": list.description,
            "type": list.kind,
            "owner_id": list.owner_id,
            "hierarchy_config": list.hierarchy_config,
            "total_words": list.total_words,
            "is_public": list.is_public,
        });
        match self.request(Method::POST, "wordlists", &[], Some(&insert))? {
            RestOutcome::Rows(rows) => {
                let row = rows
                    .first()
                    .ok_or_else(|| anyhow::anyhow!("wordlist insert returned no row"))?;
                Ok(UpsertedWordList {
                    id: row_id(row)?,
                    created: true,
                })
            }
            // Another writer created the list between the read and the insert.
            RestOutcome::Conflict => {
                let id = self
                    .select_id("wordlists", "code", &list.code)?
                    .ok_or_else(|| {
                        anyhow::anyhow!("wordlist {} conflicted but is not visible", list.code)
                    })?;
                Ok(UpsertedWordList { id, created: false })
            }
        }
    }

    fn insert_tag(&mut self, tag: &TagRecord) -> Result<InsertOutcome> {
        let body = json!({
            "wordlist_id": tag.wordlist_id,
            "tag_level": tag.level,
            "tag_code": tag.code,
            "tag_display_name": tag.display_name,
            "sort_order": tag.sort_order,
        });
        Ok(match self.request(Method::POST, "wordlist_tags", &[], Some(&body))? {
            RestOutcome::Rows(_) => InsertOutcome::Inserted,
            RestOutcome::Conflict => InsertOutcome::AlreadyExists,
        })
    }

    fn find_vocabulary(&mut self, word: &str) -> Result<Option<String>> {
        self.select_id("vocabulary", "word", word)
    }

    fn create_vocabulary(&mut self, entry: &NewVocabulary) -> Result<Option<String>> {
        let body = json!({
            "word": entry.word,
            "difficulty_level": entry.difficulty_level,
            "category": entry.category,
            "frequency": entry.frequency,
        });
        match self.request(Method::POST, "vocabulary", &[], Some(&body))? {
            RestOutcome::Rows(rows) => rows.first().map(row_id).transpose(),
            RestOutcome::Conflict => Ok(None),
        }
    }

    fn insert_mapping(&mut self, mapping: &MembershipRecord) -> Result<InsertOutcome> {
        let body = json!({
            "wordlist_id": mapping.wordlist_id,
            "vocabulary_id": mapping.vocabulary_id,
            "level_2_tag": mapping.level_2_tag,
            "level_3_tag": mapping.level_3_tag,
            "tag_path": mapping.tag_path,
        });
        Ok(
            match self.request(Method::POST, "vocabulary_wordlist_mapping", &[], Some(&body))? {
                RestOutcome::Rows(_) => InsertOutcome::Inserted,
                RestOutcome::Conflict => InsertOutcome::AlreadyExists,
            },
        )
    }

    fn set_total_words(&mut self, wordlist_id: &str, total_words: usize) -> Result<()> {
        let body = json!({ "total_words": total_words });
        match self.request(
            Method::PATCH,
            "wordlists",
            &[("id", format!("eq.{wordlist_id}"))],
            Some(&body),
        )? {
            RestOutcome::Rows(rows) if rows.is_empty() => {
                bail!("wordlist {wordlist_id} was not updated")
            }
            RestOutcome::Rows(_) => Ok(()),
            RestOutcome::Conflict => bail!("unexpected conflict updating wordlist {wordlist_id}"),
        }
    }

    fn request_count(&self) -> usize {
        self.transport.request_count()
    }
}

fn response_outcome(method: &Method, table: &str, response: &RestResponse) -> Result<RestOutcome> {
    if response.status.is_success() {
        return Ok(RestOutcome::Rows(parse_rows(&response.body)?));
    }
    if is_conflict(response.status, &response.body) {
        debug!(table, "remote store reported a uniqueness conflict");
        return Ok(RestOutcome::Conflict);
    }
    bail!(
        "remote store {method} {table} failed with HTTP {}: {}",
        response.status,
        error_message(&response.body)
    )
}

fn table_url(base_url: &str, table: &str) -> Result<Url> {
    let trimmed = base_url.trim().trim_end_matches('/');
    let joined = format!("{trimmed}/{REST_PREFIX}/{table}");
    Url::parse(&joined).with_context(|| format!("invalid remote store URL: {base_url}"))
}

fn parse_rows(text: &str) -> Result<Vec<Value>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let payload: Value =
        serde_json::from_str(text).context("failed to decode remote store JSON response")?;
    Ok(match payload {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => vec![other],
    })
}

fn row_id(row: &Value) -> Result<String> {
    match row.get("id") {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => bail!("remote store row has no id: {row}"),
    }
}

/// PostgREST answers 409 for foreign-key violations (`23503`) too, so a
/// Postgres error code in the body decides before the status does.
fn is_conflict(status: StatusCode, body: &str) -> bool {
    let code = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|payload| payload.get("code").and_then(Value::as_str).map(str::to_string));
    match code {
        Some(code) => code == UNIQUE_VIOLATION,
        None => status == StatusCode::CONFLICT,
    }
}

fn error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    parsed
        .as_ref()
        .and_then(|payload| payload.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}
