use std::fs;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vocabtool_core::catalog::{CatalogMetadata, build_catalog, write_catalog};
use vocabtool_core::config::{ListOverrides, ListSection, VocabConfig, load_config};
use vocabtool_core::loader::{LoadOptions, LoadReport, load_plan};
use vocabtool_core::plan::{ImportPlan, plan_import};
use vocabtool_core::records::{NormalizedSource, SourceType, load_source};
use vocabtool_core::rest_store::{RestStore, RestStoreConfig};
use vocabtool_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, resolve_paths,
};
use vocabtool_core::script::write_import_script;
use vocabtool_core::shape::{ShapeWarning, check_shape};
use vocabtool_core::sqlite_store::{ImportRunRecord, SqliteStore, compute_source_hash};
use vocabtool_core::store::{MemoryStore, WordListRecord};

#[derive(Debug, Parser)]
#[command(
    name = "vocabtool",
    version,
    about = "Build hierarchical vocabulary catalogs and import them idempotently"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    #[command(about = "Write the nested JSON catalog for a source")]
    Catalog(CatalogArgs),
    #[command(about = "Show the taxonomy and membership plan for a source")]
    Plan(SourceArgs),
    #[command(about = "Write an idempotent SQL transaction script for a source")]
    Script(ScriptArgs),
    #[command(about = "Load a source into a vocabulary store")]
    Import(ImportArgs),
    Db(DbArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .vocabtool/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct SourceArgs {
    #[arg(value_name = "SOURCE")]
    source: PathBuf,
    #[arg(long, value_name = "csv|json", help = "Source format (default: from extension)")]
    format: Option<String>,
    #[arg(long, help = "List code (overrides [list].code)")]
    code: Option<String>,
    #[arg(long, help = "List display name")]
    name: Option<String>,
    #[arg(long, help = "Catalog id (defaults to the code)")]
    id: Option<String>,
    #[arg(long, help = "List description")]
    description: Option<String>,
}

impl SourceArgs {
    fn overrides(&self) -> ListOverrides {
        ListOverrides {
            code: self.code.clone(),
            name: self.name.clone(),
            id: self.id.clone(),
            description: self.description.clone(),
        }
    }
}

#[derive(Debug, Args)]
struct CatalogArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ScriptArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,
    #[arg(short, long, help = "Proceed despite shape warnings")]
    yes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Memory,
    Sqlite,
    Remote,
}

impl StoreKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
            Self::Remote => "remote",
        }
    }
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long, value_enum, default_value_t = StoreKind::Sqlite)]
    store: StoreKind,
    #[arg(long, help = "Run against an in-memory store and report counts only")]
    dry_run: bool,
    #[arg(short, long, help = "Proceed despite shape warnings")]
    yes: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Stats,
}

/// A normalized source with the list metadata it will be imported under.
struct PreparedSource {
    path: PathBuf,
    source_type: SourceType,
    list: ListSection,
    normalized: NormalizedSource,
}

impl PreparedSource {
    fn shape_warnings(&self) -> Vec<ShapeWarning> {
        check_shape(&self.list, &self.normalized.records)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Catalog(args)) => run_catalog(&runtime, args),
        Some(Commands::Plan(args)) => run_plan(&runtime, args),
        Some(Commands::Script(args)) => run_script(&runtime, args),
        Some(Commands::Import(args)) => run_import(&runtime, args),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Stats => run_db_stats(&runtime),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;

    println!("Initialized vocabtool runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("exports_dir: {}", normalize_path(&paths.exports_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", format_flag(report.wrote_config));
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_catalog(runtime: &RuntimeOptions, args: CatalogArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let prepared = prepare_source(&config, &args.source)?;

    let metadata = CatalogMetadata::from_list(&prepared.list)?;
    let catalog = build_catalog(&metadata, &prepared.normalized.records);
    let warnings = prepared.shape_warnings();
    let output = args
        .output
        .unwrap_or_else(|| paths.exports_dir.join(format!("{}.json", metadata.code)));
    let report = write_catalog(&output, &catalog)?;

    println!("catalog");
    print_source_summary(&prepared);
    println!("code: {}", catalog.code);
    println!("total_words: {}", catalog.total_words);
    println!("tier2_groups: {}", report.tier2_groups);
    println!("tier3_buckets: {}", report.tier3_buckets);
    println!("output: {}", report.path);
    println!("bytes: {}", report.bytes);
    print_shape_warnings(&warnings);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_plan(runtime: &RuntimeOptions, args: SourceArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let prepared = prepare_source(&config, &args)?;
    let plan = plan_import(&prepared.normalized.records);
    let warnings = prepared.shape_warnings();

    println!("import plan");
    print_source_summary(&prepared);
    println!(
        "code: {}",
        prepared.list.code.as_deref().unwrap_or("<unset>")
    );
    print_plan_summary(&plan);
    println!("tier2_distribution:");
    for count in &plan.tier2_distribution {
        println!("  {}: {}", count.tag, count.words);
    }
    print_shape_warnings(&warnings);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_script(runtime: &RuntimeOptions, args: ScriptArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let prepared = prepare_source(&config, &args.source)?;
    confirm_shape(&prepared, args.yes)?;

    let plan = plan_import(&prepared.normalized.records);
    let list = WordListRecord::from_list(&prepared.list, plan.total_words())?;
    let output = args
        .output
        .unwrap_or_else(|| paths.exports_dir.join(format!("{}.sql", list.code)));
    let report = write_import_script(&output, &list, &plan, &config.vocabulary_defaults)?;

    println!("import script");
    print_source_summary(&prepared);
    println!("code: {}", list.code);
    print_plan_summary(&plan);
    println!("output: {}", report.path);
    println!("bytes: {}", report.bytes);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_import(runtime: &RuntimeOptions, args: ImportArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let prepared = prepare_source(&config, &args.source)?;
    confirm_shape(&prepared, args.yes)?;

    let plan = plan_import(&prepared.normalized.records);
    let list = WordListRecord::from_list(&prepared.list, plan.total_words())?;
    let options = LoadOptions::new(&config.import, &config.vocabulary_defaults);
    let store_kind = if args.dry_run {
        StoreKind::Memory
    } else {
        args.store
    };
    info!(
        code = %list.code,
        store = store_kind.as_str(),
        triples = plan.triples.len(),
        "starting import"
    );

    let report = match store_kind {
        StoreKind::Memory => {
            let mut store = MemoryStore::new();
            load_plan(&mut store, &list, &plan, &options)?
        }
        StoreKind::Sqlite => {
            let mut store = SqliteStore::open(&paths.db_path)?;
            let report = load_plan(&mut store, &list, &plan, &options)?;
            let source_bytes = fs::read(&prepared.path)
                .with_context(|| format!("failed to read {}", prepared.path.display()))?;
            store.record_import_run(&ImportRunRecord {
                wordlist_code: list.code.clone(),
                source_path: normalize_path(&prepared.path),
                source_sha256: compute_source_hash(&source_bytes),
                total_words: report.total_words,
                mappings_inserted: report.mappings_inserted,
                mappings_existing: report.mappings_existing,
                failed: report.failed,
            })?;
            println!("db_path: {}", normalize_path(store.db_path()));
            report
        }
        StoreKind::Remote => {
            let mut store = RestStore::new(RestStoreConfig::from_config(&config)?)?;
            load_plan(&mut store, &list, &plan, &options)?
        }
    };

    println!("import");
    print_source_summary(&prepared);
    println!("code: {}", list.code);
    println!("store: {}", store_kind.as_str());
    println!("dry_run: {}", format_flag(args.dry_run));
    print_load_report(&report);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    if !paths.db_path.exists() {
        bail!(
            "vocabulary database not found at {} (run `vocabtool import` first)",
            normalize_path(&paths.db_path)
        );
    }
    let store = SqliteStore::open(&paths.db_path)?;
    let stats = store.stats()?;

    println!("db stats");
    println!("db_path: {}", stats.db_path);
    println!("wordlists: {}", stats.counts.wordlists);
    println!("tags: {}", stats.counts.tags);
    println!("vocabulary: {}", stats.counts.vocabulary);
    println!("mappings: {}", stats.counts.mappings);
    for list in &stats.wordlists {
        println!(
            "  {} ({}): total_words={} mappings={} tags={}",
            list.code, list.name, list.total_words, list.mappings, list.tags
        );
    }
    match &stats.last_run {
        Some(last) => {
            println!("last_run.code: {}", last.run.wordlist_code);
            println!("last_run.source: {}", last.run.source_path);
            println!("last_run.source_sha256: {}", last.run.source_sha256);
            println!("last_run.failed: {}", last.run.failed);
            println!("last_run.finished_at_unix: {}", last.finished_at_unix);
        }
        None => println!("last_run: <none>"),
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn prepare_source(config: &VocabConfig, args: &SourceArgs) -> Result<PreparedSource> {
    let path_text = args.source.to_string_lossy();
    let Some(source_type) = SourceType::resolve(&path_text, args.format.as_deref()) else {
        bail!(
            "cannot determine source format for {} (pass --format csv|json)",
            normalize_path(&args.source)
        );
    };
    let normalized = load_source(&args.source, source_type, &config.columns)?;
    Ok(PreparedSource {
        path: args.source.clone(),
        source_type,
        list: config.list.with_overrides(&args.overrides()),
        normalized,
    })
}

fn confirm_shape(prepared: &PreparedSource, assume_yes: bool) -> Result<()> {
    let warnings = prepared.shape_warnings();
    if warnings.is_empty() {
        return Ok(());
    }
    print_shape_warnings(&warnings);
    if assume_yes {
        return Ok(());
    }
    if !io::stdin().is_terminal() {
        bail!("source shape does not match the list metadata; pass --yes to proceed anyway");
    }

    print!("proceed anyway? [y/N] ");
    io::stdout().flush().context("failed to flush stdout")?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    if matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
        Ok(())
    } else {
        bail!("aborted by operator")
    }
}

fn print_source_summary(prepared: &PreparedSource) {
    println!("source: {}", normalize_path(&prepared.path));
    println!("format: {}", prepared.source_type.as_str());
    println!("records: {}", prepared.normalized.records.len());
    println!("skipped: {}", prepared.normalized.skipped_count());
    for skipped in prepared.normalized.skipped.iter().take(10) {
        match &skipped.detail {
            Some(detail) => println!(
                "  row {}: {} ({detail})",
                skipped.row,
                skipped.reason.as_str()
            ),
            None => println!("  row {}: {}", skipped.row, skipped.reason.as_str()),
        }
    }
}

fn print_plan_summary(plan: &ImportPlan) {
    println!("tier2_tags: {}", plan.taxonomy.tier2.len());
    println!("tier3_tags: {}", plan.taxonomy.tier3.len());
    println!("distinct_words: {}", plan.distinct_words);
    println!("memberships: {}", plan.triples.len());
    println!("total_words: {}", plan.total_words());
}

fn print_shape_warnings(warnings: &[ShapeWarning]) {
    if warnings.is_empty() {
        return;
    }
    println!("warnings:");
    for warning in warnings {
        println!("  - {warning}");
    }
}

fn print_load_report(report: &LoadReport) {
    println!("wordlist_id: {}", report.wordlist_id);
    println!("wordlist_created: {}", format_flag(report.wordlist_created));
    println!("tags_inserted: {}", report.tags_inserted);
    println!("tags_existing: {}", report.tags_existing);
    println!("vocabulary_created: {}", report.vocabulary_created);
    println!("vocabulary_reused: {}", report.vocabulary_reused);
    println!("mappings_inserted: {}", report.mappings_inserted);
    println!("mappings_existing: {}", report.mappings_existing);
    println!("failed: {}", report.failed);
    for failure in &report.failures {
        println!("  {}: {}", failure.word, failure.message);
    }
    if report.failed > report.failures.len() {
        println!(
            "  ... {} more failures not shown",
            report.failed - report.failures.len()
        );
    }
    println!("total_words: {}", report.total_words);
    println!(
        "total_words_updated: {}",
        format_flag(report.total_words_updated)
    );
    println!("requests: {}", report.requests);
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use vocabtool_core::config::ListSection;
    use vocabtool_core::records::{NormalizedSource, SourceType, VocabularyRecord};
    use vocabtool_core::shape::ShapeWarning;

    use super::PreparedSource;

    fn prepared(list: ListSection, records: Vec<VocabularyRecord>) -> PreparedSource {
        PreparedSource {
            path: PathBuf::from("words.csv"),
            source_type: SourceType::Csv,
            list,
            normalized: NormalizedSource {
                records,
                skipped: Vec::new(),
            },
        }
    }

    #[test]
    fn catalog_sources_report_shape_warnings() {
        let source = prepared(
            ListSection {
                code: Some("primary_chinese_2025".to_string()),
                expected_words: Some(3),
                ..ListSection::default()
            },
            vec![
                VocabularyRecord::new("學", Some("單元一"), None),
                VocabularyRecord::new("水", None, None),
            ],
        );

        let warnings = source.shape_warnings();
        assert!(warnings.contains(&ShapeWarning::WordCountMismatch {
            expected: 3,
            actual: 2
        }));
        assert!(warnings.contains(&ShapeWarning::MissingTier2 { records: 1 }));
    }

    #[test]
    fn consistent_sources_have_no_warnings() {
        let source = prepared(
            ListSection {
                code: Some("hsk_standard".to_string()),
                expected_words: Some(1),
                ..ListSection::default()
            },
            vec![VocabularyRecord::new("水", Some("HSK1級"), None)],
        );
        assert!(source.shape_warnings().is_empty());
    }
}
