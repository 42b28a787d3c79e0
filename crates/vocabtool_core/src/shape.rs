use std::fmt;

use serde::Serialize;

use crate::config::ListSection;
use crate::records::VocabularyRecord;

/// A mismatch between the source and the list's declared metadata. Never
/// corrected automatically; the operator decides whether to proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShapeWarning {
    WordCountMismatch { expected: usize, actual: usize },
    DeclaredTier3Missing { label: String },
    UndeclaredTier3Present { records: usize },
    MissingTier2 { records: usize },
}

impl fmt::Display for ShapeWarning {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WordCountMismatch { expected, actual } => write!(
                formatter,
                "list declares {expected} words but the source holds {actual}"
            ),
            Self::DeclaredTier3Missing { label } => write!(
                formatter,
                "list declares a tier-3 level ({label}) but no record carries a tier-3 tag"
            ),
            Self::UndeclaredTier3Present { records } => write!(
                formatter,
                "{records} records carry a tier-3 tag but the list declares no level_3_label"
            ),
            Self::MissingTier2 { records } => {
                write!(formatter, "{records} records have no tier-2 tag")
            }
        }
    }
}

pub fn check_shape(list: &ListSection, records: &[VocabularyRecord]) -> Vec<ShapeWarning> {
    let mut warnings = Vec::new();

    if let Some(expected) = list.expected_words
        && expected != records.len()
    {
        warnings.push(ShapeWarning::WordCountMismatch {
            expected,
            actual: records.len(),
        });
    }

    let with_tier3 = records.iter().filter(|record| record.tier3.is_some()).count();
    match list.level_3_label.as_deref() {
        Some(label) if with_tier3 == 0 && !records.is_empty() => {
            warnings.push(ShapeWarning::DeclaredTier3Missing {
                label: label.to_string(),
            });
        }
        None if with_tier3 > 0 => {
            warnings.push(ShapeWarning::UndeclaredTier3Present {
                records: with_tier3,
            });
        }
        _ => {}
    }

    let without_tier2 = records.iter().filter(|record| record.tier2.is_none()).count();
    if without_tier2 > 0 {
        warnings.push(ShapeWarning::MissingTier2 {
            records: without_tier2,
        });
    }

    warnings
}
