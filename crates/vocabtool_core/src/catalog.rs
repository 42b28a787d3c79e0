use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ListSection;
use crate::hierarchy::{Hierarchy, build_hierarchy};
use crate::records::VocabularyRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogMetadata {
    pub id: String,
    pub name: String,
    pub code: String,
}

impl CatalogMetadata {
    pub fn from_list(list: &ListSection) -> Result<Self> {
        let code = list.require_code()?.to_string();
        Ok(Self {
            id: list.id.clone().unwrap_or_else(|| code.clone()),
            name: list.name.clone().unwrap_or_else(|| code.clone()),
            code,
        })
    }
}

/// The client-facing catalog document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub id: String,
    pub name: String,
    pub code: String,
    pub total_words: usize,
    pub hierarchy: Hierarchy,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogWriteReport {
    pub path: String,
    pub bytes: usize,
    pub tier2_groups: usize,
    pub tier3_buckets: usize,
}

/// `total_words` counts every normalized record, duplicates included.
pub fn build_catalog(metadata: &CatalogMetadata, records: &[VocabularyRecord]) -> Catalog {
    Catalog {
        id: metadata.id.clone(),
        name: metadata.name.clone(),
        code: metadata.code.clone(),
        total_words: records.len(),
        hierarchy: build_hierarchy(records),
    }
}

pub fn render_catalog(catalog: &Catalog) -> Result<String> {
    serde_json::to_string_pretty(catalog).context("failed to serialize catalog")
}

pub fn write_catalog(path: &Path, catalog: &Catalog) -> Result<CatalogWriteReport> {
    let rendered = render_catalog(catalog)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create catalog directory {}", parent.display()))?;
    }
    fs::write(path, &rendered).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(CatalogWriteReport {
        path: path.to_string_lossy().replace('\\', "/"),
        bytes: rendered.len(),
        tier2_groups: catalog.hierarchy.groups().len(),
        tier3_buckets: catalog.hierarchy.bucket_count(),
    })
}

pub fn read_catalog(path: &Path) -> Result<Catalog> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_catalog(&content).with_context(|| format!("invalid catalog {}", path.display()))
}

pub fn parse_catalog(content: &str) -> Result<Catalog> {
    let value: Value = serde_json::from_str(content).context("catalog is not valid JSON")?;
    validate_catalog_value(&value)?;
    // Decode from the text; a `Value` map would reorder keys.
    serde_json::from_str(content).context("failed to decode catalog")
}

/// Checks the fixed catalog schema: string `id`/`name`/`code`, non-negative
/// integer `total_words`, and a two-level map of string arrays under `hierarchy`.
pub fn validate_catalog_value(value: &Value) -> Result<()> {
    let Some(object) = value.as_object() else {
        bail!("catalog must be a JSON object");
    };
    for key in ["id", "name", "code"] {
        if !object.get(key).is_some_and(Value::is_string) {
            bail!("catalog.{key} must be a string");
        }
    }
    if !object.get("total_words").is_some_and(Value::is_u64) {
        bail!("catalog.total_words must be a non-negative integer");
    }
    let Some(hierarchy) = object.get("hierarchy").and_then(Value::as_object) else {
        bail!("catalog.hierarchy must be an object");
    };

    let mut leaves = 0usize;
    for (tier2, buckets) in hierarchy {
        let Some(buckets) = buckets.as_object() else {
            bail!("catalog.hierarchy[{tier2:?}] must be an object");
        };
        for (tier3, words) in buckets {
            let Some(words) = words.as_array() else {
                bail!("catalog.hierarchy[{tier2:?}][{tier3:?}] must be an array");
            };
            if !words.iter().all(Value::is_string) {
                bail!("catalog.hierarchy[{tier2:?}][{tier3:?}] must contain only strings");
            }
            leaves += words.len();
        }
    }

    let declared = object.get("total_words").and_then(Value::as_u64).unwrap_or(0);
    if u64::try_from(leaves).ok() != Some(declared) {
        bail!("catalog.total_words is {declared} but hierarchy holds {leaves} words");
    }
    Ok(())
}
