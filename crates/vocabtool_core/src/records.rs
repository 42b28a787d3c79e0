use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::config::ColumnSection;
use crate::hierarchy::ALL_BUCKET_KEY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Csv,
    Json,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }

    pub fn resolve(path: &str, explicit: Option<&str>) -> Option<Self> {
        if let Some(value) = explicit {
            let value = value.trim();
            if value.eq_ignore_ascii_case("csv") {
                return Some(Self::Csv);
            }
            if value.eq_ignore_ascii_case("json") {
                return Some(Self::Json);
            }
            return None;
        }

        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".csv") {
            return Some(Self::Csv);
        }
        if lower.ends_with(".json") {
            return Some(Self::Json);
        }
        None
    }
}

/// One canonical source row. `word` is trimmed and non-empty; tags are trimmed
/// and `None` when blank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VocabularyRecord {
    pub word: String,
    pub tier2: Option<String>,
    pub tier3: Option<String>,
}

impl VocabularyRecord {
    pub fn new(word: &str, tier2: Option<&str>, tier3: Option<&str>) -> Self {
        Self {
            word: word.to_string(),
            tier2: tier2.map(str::to_string),
            tier3: tier3.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    EmptyWord,
    Malformed,
    ReservedTier3Tag,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmptyWord => "empty_word",
            Self::Malformed => "malformed",
            Self::ReservedTier3Tag => "reserved_tier3_tag",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRow {
    pub row: usize,
    pub reason: SkipReason,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizedSource {
    pub records: Vec<VocabularyRecord>,
    pub skipped: Vec<SkippedRow>,
}

impl NormalizedSource {
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

type RawRow = Vec<(String, String)>;

#[derive(Debug)]
enum SourceRow {
    Fields(RawRow),
    Malformed(String),
}

pub fn load_source(
    path: &Path,
    source_type: SourceType,
    columns: &ColumnSection,
) -> Result<NormalizedSource> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read import source {}", path.display()))?;
    normalize_source(&content, source_type, columns)
        .with_context(|| format!("failed to normalize {}", path.display()))
}

pub fn normalize_source(
    content: &str,
    source_type: SourceType,
    columns: &ColumnSection,
) -> Result<NormalizedSource> {
    let rows = match source_type {
        SourceType::Csv => parse_csv(content, columns)?,
        SourceType::Json => parse_json(content, columns)?,
    };

    let mut output = NormalizedSource::default();
    for (index, row) in rows {
        let row_number = index + 1;
        match row {
            SourceRow::Malformed(detail) => output.skipped.push(SkippedRow {
                row: row_number,
                reason: SkipReason::Malformed,
                detail: Some(detail),
            }),
            SourceRow::Fields(fields) => match normalize_row(&fields, columns) {
                Ok(record) => output.records.push(record),
                Err(reason) => output.skipped.push(SkippedRow {
                    row: row_number,
                    reason,
                    detail: None,
                }),
            },
        }
    }
    Ok(output)
}

fn normalize_row(row: &RawRow, columns: &ColumnSection) -> Result<VocabularyRecord, SkipReason> {
    let word = pick_column(row, &columns.word).ok_or(SkipReason::EmptyWord)?;
    let tier2 = pick_column(row, &columns.tier2);
    let tier3 = pick_column(row, &columns.tier3);
    if tier3.as_deref() == Some(ALL_BUCKET_KEY) {
        return Err(SkipReason::ReservedTier3Tag);
    }
    Ok(VocabularyRecord { word, tier2, tier3 })
}

/// First alias (in preference order) whose trimmed value is non-empty.
fn pick_column(row: &RawRow, aliases: &[String]) -> Option<String> {
    aliases.iter().find_map(|alias| {
        row.iter()
            .find(|(name, _)| name == alias)
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

fn parse_csv(content: &str, columns: &ColumnSection) -> Result<Vec<(usize, SourceRow)>> {
    let rows = parse_csv_rows(strip_bom(content), ',');
    let Some(header_row) = rows.first() else {
        return Ok(Vec::new());
    };

    let headers = header_row
        .iter()
        .map(|value| value.trim().to_string())
        .collect::<Vec<_>>();
    if !headers.iter().any(|header| columns.word.contains(header)) {
        bail!(
            "schema mismatch: none of the word columns [{}] found in header [{}]",
            columns.word.join(", "),
            headers.join(", ")
        );
    }

    let mut output = Vec::new();
    for (index, row) in rows.iter().skip(1).enumerate() {
        if row.iter().all(|value| value.trim().is_empty()) {
            continue;
        }
        let overflow = row
            .iter()
            .skip(headers.len())
            .any(|value| !value.trim().is_empty());
        if overflow {
            output.push((
                index,
                SourceRow::Malformed(format!(
                    "row has {} fields but header has {}",
                    row.len(),
                    headers.len()
                )),
            ));
            continue;
        }
        let mut mapped = Vec::new();
        for (column, header) in headers.iter().enumerate() {
            if header.is_empty() {
                continue;
            }
            mapped.push((header.clone(), row.get(column).cloned().unwrap_or_default()));
        }
        output.push((index, SourceRow::Fields(mapped)));
    }
    Ok(output)
}

fn parse_json(content: &str, columns: &ColumnSection) -> Result<Vec<(usize, SourceRow)>> {
    let trimmed = strip_bom(content).trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let parsed: serde_json::Value =
        serde_json::from_str(trimmed).context("failed to parse JSON import source")?;
    let Some(rows) = parsed.as_array() else {
        bail!("JSON import source must be an array of objects");
    };

    let mut output = Vec::new();
    let mut saw_word_column = false;
    for (index, row) in rows.iter().enumerate() {
        let Some(object) = row.as_object() else {
            output.push((
                index,
                SourceRow::Malformed(format!("expected an object, found {}", json_kind(row))),
            ));
            continue;
        };
        saw_word_column |= columns.word.iter().any(|alias| object.contains_key(alias));
        let mut mapped = Vec::new();
        for (key, value) in object {
            let value = match value {
                serde_json::Value::Null => String::new(),
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            mapped.push((key.clone(), value));
        }
        output.push((index, SourceRow::Fields(mapped)));
    }

    let has_objects = output
        .iter()
        .any(|(_, row)| matches!(row, SourceRow::Fields(_)));
    if has_objects && !saw_word_column {
        bail!(
            "schema mismatch: no row carries any of the word columns [{}]",
            columns.word.join(", ")
        );
    }
    Ok(output)
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn parse_csv_rows(content: &str, delimiter: char) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(ch);
            }
            continue;
        }

        match ch {
            '"' => in_quotes = true,
            '\n' | '\r' => {
                if ch == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ if ch == delimiter => row.push(std::mem::take(&mut field)),
            _ => field.push(ch),
        }
    }

    row.push(field);
    if row.len() > 1 || row.first().is_some_and(|value| !value.trim().is_empty()) {
        rows.push(row);
    }
    rows
}

fn strip_bom(content: &str) -> &str {
    content.strip_prefix('\u{feff}').unwrap_or(content)
}

#[cfg(test)]
mod tests {
    use super::{SkipReason, SourceType, VocabularyRecord, normalize_source, parse_csv_rows};
    use crate::config::ColumnSection;

    fn columns() -> ColumnSection {
        ColumnSection::default()
    }

    #[test]
    fn source_type_resolves_from_extension_or_flag() {
        assert_eq!(SourceType::resolve("list.CSV", None), Some(SourceType::Csv));
        assert_eq!(SourceType::resolve("list.json", None), Some(SourceType::Json));
        assert_eq!(SourceType::resolve("list.txt", Some("json")), Some(SourceType::Json));
        assert_eq!(SourceType::resolve("list.txt", None), None);
        assert_eq!(SourceType::resolve("list.csv", Some("xls")), None);
    }

    #[test]
    fn parse_csv_rows_supports_quotes_crlf_and_newlines() {
        let rows = parse_csv_rows("a,b\r\n\"x,1\",\"line 1\nline 2\"\r\n\"say \"\"hi\"\"\",z", ',');
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], vec!["x,1", "line 1\nline 2"]);
        assert_eq!(rows[2], vec!["say \"hi\"", "z"]);
    }

    #[test]
    fn csv_trims_and_accepts_traditional_headers() {
        let source = "\u{feff}詞語,第二層級,第三層級\n 學 ,單元一,課一\n水,單元二,\n";
        let normalized = normalize_source(source, SourceType::Csv, &columns()).expect("normalize");
        assert_eq!(
            normalized.records,
            vec![
                VocabularyRecord::new("學", Some("單元一"), Some("課一")),
                VocabularyRecord::new("水", Some("單元二"), None),
            ]
        );
        assert!(normalized.skipped.is_empty());
    }

    #[test]
    fn csv_accepts_simplified_headers() {
        let source = "词语,第二层级,第三层级\n爱,HSK1級,\n";
        let normalized = normalize_source(source, SourceType::Csv, &columns()).expect("normalize");
        assert_eq!(
            normalized.records,
            vec![VocabularyRecord::new("爱", Some("HSK1級"), None)]
        );
    }

    #[test]
    fn preferred_alias_falls_back_when_empty() {
        let source = "詞語,词语,第二層級\n,習,單元一\n";
        let normalized = normalize_source(source, SourceType::Csv, &columns()).expect("normalize");
        assert_eq!(normalized.records[0].word, "習");
    }

    #[test]
    fn empty_and_malformed_rows_are_counted_not_fatal() {
        let source = "詞語,第二層級,第三層級\n  ,單元一,課一\n學,單元一,課一,extra\n習,單元一,課一\n";
        let normalized = normalize_source(source, SourceType::Csv, &columns()).expect("normalize");
        assert_eq!(normalized.records.len(), 1);
        assert_eq!(normalized.skipped_count(), 2);
        assert_eq!(normalized.skipped[0].row, 1);
        assert_eq!(normalized.skipped[0].reason, SkipReason::EmptyWord);
        assert_eq!(normalized.skipped[1].row, 2);
        assert_eq!(normalized.skipped[1].reason, SkipReason::Malformed);
    }

    #[test]
    fn reserved_tier3_tag_is_skipped() {
        let source = "詞語,第二層級,第三層級\n學,單元一,_all\n";
        let normalized = normalize_source(source, SourceType::Csv, &columns()).expect("normalize");
        assert!(normalized.records.is_empty());
        assert_eq!(normalized.skipped[0].reason, SkipReason::ReservedTier3Tag);
    }

    #[test]
    fn csv_without_word_column_is_schema_mismatch() {
        let error = normalize_source("title,level\nfoo,1\n", SourceType::Csv, &columns())
            .expect_err("must fail");
        assert!(error.to_string().contains("schema mismatch"));
    }

    #[test]
    fn json_rows_map_and_non_objects_are_malformed() {
        let source = r#"[{"word":"水","level_2_tag":"單元二","level_3_tag":null}, 42, {"word":""}]"#;
        let normalized = normalize_source(source, SourceType::Json, &columns()).expect("normalize");
        assert_eq!(
            normalized.records,
            vec![VocabularyRecord::new("水", Some("單元二"), None)]
        );
        assert_eq!(normalized.skipped.len(), 2);
        assert_eq!(normalized.skipped[0].reason, SkipReason::Malformed);
        assert_eq!(normalized.skipped[0].row, 2);
        assert_eq!(normalized.skipped[1].reason, SkipReason::EmptyWord);
    }

    #[test]
    fn json_without_word_column_is_schema_mismatch() {
        let error = normalize_source(r#"[{"title":"x"}]"#, SourceType::Json, &columns())
            .expect_err("must fail");
        assert!(error.to_string().contains("schema mismatch"));
    }
}
