//! Bulk-load SQL for PostgreSQL-compatible stores. The script is a single
//! transaction and every statement is safe to re-run.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::VocabularyDefaults;
use crate::plan::{ImportPlan, PlannedTag};
use crate::runtime::write_text_file;
use crate::store::WordListRecord;

#[derive(Debug, Clone, Serialize)]
pub struct ScriptWriteReport {
    pub path: String,
    pub bytes: usize,
    pub tags: usize,
    pub new_words: usize,
    pub mappings: usize,
}

pub fn render_import_script(
    list: &WordListRecord,
    plan: &ImportPlan,
    defaults: &VocabularyDefaults,
) -> Result<String> {
    let code = sql_text(&list.code);
    let list_id = format!("(SELECT id FROM wordlists WHERE code = {code})");
    let mut out = String::new();

    out.push_str(&format!(
        "-- wordlist {}: {} records, {} distinct words, {} tags\n\n",
        list.code,
        plan.total_words(),
        plan.distinct_words,
        plan.taxonomy.len()
    ));
    out.push_str("BEGIN;\n\n");

    let hierarchy_config = serde_json::to_string(&list.hierarchy_config)
        .context("failed to serialize hierarchy_config")?;
    out.push_str(
        "INSERT INTO wordlists (name, code, type, owner_id, hierarchy_config, description, total_words, is_public)\n",
    );
    out.push_str(&format!(
        "VALUES ({}, {code}, {}, {}, {}::jsonb, {}, {}, {})\n",
        sql_text(&list.name),
        sql_text(&list.kind),
        sql_optional_text(list.owner_id.as_deref()),
        sql_text(&hierarchy_config),
        sql_optional_text(list.description.as_deref()),
        plan.total_words(),
        list.is_public,
    ));
    out.push_str("ON CONFLICT (code) DO UPDATE\n");
    out.push_str("SET name = EXCLUDED.name,\n");
    out.push_str("    description = EXCLUDED.description,\n");
    out.push_str("    total_words = EXCLUDED.total_words,\n");
    out.push_str("    updated_at = NOW();\n\n");

    for tags in [&plan.taxonomy.tier2, &plan.taxonomy.tier3] {
        push_tag_insert(&mut out, &list_id, tags);
    }

    let new_words = plan.new_words().collect::<Vec<_>>();
    if !new_words.is_empty() {
        out.push_str("INSERT INTO vocabulary (word, difficulty_level, category, frequency)\n");
        out.push_str(&format!(
            "SELECT t.word, {}, {}, {}\n",
            defaults.difficulty_level,
            sql_text(&defaults.category),
            defaults.frequency
        ));
        out.push_str("FROM (VALUES\n");
        push_rows(&mut out, new_words.iter().map(|word| format!("({})", sql_text(word))));
        out.push_str(") AS t(word)\n");
        out.push_str("WHERE NOT EXISTS (SELECT 1 FROM vocabulary v WHERE v.word = t.word);\n\n");
    }

    if !plan.triples.is_empty() {
        let mut rows = Vec::with_capacity(plan.triples.len());
        for triple in &plan.triples {
            let tag_path =
                serde_json::to_string(&triple.tag_path()).context("failed to serialize tag_path")?;
            rows.push(format!(
                "({}, {}, {}, {})",
                sql_text(&triple.word),
                sql_text(triple.tier2.as_deref().unwrap_or_default()),
                sql_text(triple.tier3.as_deref().unwrap_or_default()),
                sql_text(&tag_path)
            ));
        }
        out.push_str(
            "INSERT INTO vocabulary_wordlist_mapping (wordlist_id, vocabulary_id, level_2_tag, level_3_tag, tag_path)\n",
        );
        out.push_str(&format!(
            "SELECT {list_id}, v.id, t.level_2_tag, t.level_3_tag, t.tag_path::jsonb\n"
        ));
        out.push_str("FROM (VALUES\n");
        push_rows(&mut out, rows.into_iter());
        out.push_str(") AS t(word, level_2_tag, level_3_tag, tag_path)\n");
        out.push_str("JOIN vocabulary v ON v.word = t.word\n");
        out.push_str(
            "ON CONFLICT (wordlist_id, vocabulary_id, level_2_tag, level_3_tag) DO NOTHING;\n\n",
        );
    }

    out.push_str(&format!(
        "UPDATE wordlists SET total_words = {}, updated_at = NOW() WHERE code = {code};\n\n",
        plan.total_words()
    ));
    out.push_str("COMMIT;\n");
    Ok(out)
}

pub fn write_import_script(
    path: &Path,
    list: &WordListRecord,
    plan: &ImportPlan,
    defaults: &VocabularyDefaults,
) -> Result<ScriptWriteReport> {
    let rendered = render_import_script(list, plan, defaults)?;
    write_text_file(path, &rendered, true)?;
    Ok(ScriptWriteReport {
        path: path.to_string_lossy().replace('\\', "/"),
        bytes: rendered.len(),
        tags: plan.taxonomy.len(),
        new_words: plan.distinct_words,
        mappings: plan.triples.len(),
    })
}

fn push_tag_insert(out: &mut String, list_id: &str, tags: &[PlannedTag]) {
    if tags.is_empty() {
        return;
    }
    out.push_str(
        "INSERT INTO wordlist_tags (wordlist_id, tag_level, tag_code, tag_display_name, sort_order)\n",
    );
    out.push_str(&format!(
        "SELECT {list_id}, t.tag_level, t.tag_code, t.tag_display_name, t.sort_order\n"
    ));
    out.push_str("FROM (VALUES\n");
    push_rows(
        out,
        tags.iter().map(|tag| {
            format!(
                "({}, {}, {}, {})",
                tag.level,
                sql_text(&tag.code),
                sql_text(&tag.display_name),
                tag.sort_order
            )
        }),
    );
    out.push_str(") AS t(tag_level, tag_code, tag_display_name, sort_order)\n");
    out.push_str("ON CONFLICT (wordlist_id, tag_level, tag_code) DO NOTHING;\n\n");
}

fn push_rows(out: &mut String, rows: impl Iterator<Item = String>) {
    let mut rows = rows.peekable();
    while let Some(row) = rows.next() {
        out.push_str("  ");
        out.push_str(&row);
        if rows.peek().is_some() {
            out.push(',');
        }
        out.push('\n');
    }
}

fn sql_text(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn sql_optional_text(value: Option<&str>) -> String {
    value.map(sql_text).unwrap_or_else(|| "NULL".to_string())
}
