use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use tabxtool_core::check::check_chunk_file;
use tabxtool_core::config::{ToolConfig, load_config};
use tabxtool_core::output::{WriteOptions, chunk_file_name, discover_chunk_files, write_chunks};
use tabxtool_core::pack::{PackOptions, PackingResult, pack};
use tabxtool_core::record::load_records;
use tabxtool_core::runtime::{PathOverrides, ResolutionContext, ResolvedPaths, resolve_paths};
use tabxtool_core::upload::{Credentials, UploadOptions, dry_run, upload_chunks};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "tabxtool",
    version,
    about = "Pack multilingual text records into size-bounded tabx chunk pages"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    output_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, action = ArgAction::Count, help = "Increase log verbosity")]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            output_dir: cli.output_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pack a merged record file into chunk files
    Pack(PackArgs),
    /// Check a written chunk file for cells the wiki may reject
    Check(CheckArgs),
    /// Upload chunk files to the wiki and prune stale chunk pages
    Upload(UploadArgs),
    /// Show resolved paths, configuration and local chunk files
    Status,
}

#[derive(Debug, Args)]
struct PackArgs {
    #[arg(long, short = 'i', value_name = "PATH", help = "JSON array of merged records")]
    input: PathBuf,
    #[arg(long, help = "Chunk file name prefix")]
    prefix: Option<String>,
    #[arg(long, value_name = "BYTES", allow_hyphen_values = true, help = "Per-chunk byte ceiling")]
    ceiling: Option<i64>,
    #[arg(long, value_name = "N", allow_hyphen_values = true, help = "Records per greedy batch")]
    batch_size: Option<i64>,
    #[arg(long, value_name = "CHARS", help = "Long-field report threshold")]
    threshold: Option<usize>,
    #[arg(long, help = "Write <prefix>_pack_report.json next to the chunks")]
    report: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
    file: PathBuf,
    #[arg(long, value_name = "CHARS", help = "Long-field threshold")]
    threshold: Option<usize>,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct UploadArgs {
    #[arg(short = 'n', long, help = "List chunk sizes without contacting the wiki")]
    dry_run: bool,
    #[arg(long, help = "Chunk file name prefix")]
    prefix: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Commands::Pack(args) => run_pack(&runtime, args),
        Commands::Check(args) => run_check(&runtime, args),
        Commands::Upload(args) => run_upload(&runtime, args),
        Commands::Status => run_status(&runtime),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

fn run_pack(runtime: &RuntimeOptions, args: PackArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let defaults = config.pack_options()?;
    let options = PackOptions::new(
        args.ceiling.unwrap_or(defaults.ceiling_bytes as i64),
        args.batch_size.unwrap_or(defaults.batch_size as i64),
        args.threshold.unwrap_or(defaults.long_field_threshold),
    )?;
    let prefix = args
        .prefix
        .clone()
        .unwrap_or_else(|| config.prefix().to_string());
    let layout = config.layout()?;

    let records = load_records(&args.input)?;
    info!(records = records.len(), input = %normalize_path(&args.input), "loaded records");
    let result = pack(&records, &layout, options)?;
    let written = write_chunks(
        &WriteOptions {
            output_dir: &paths.output_dir,
            prefix: &prefix,
            write_report: args.report,
        },
        &layout,
        &records,
        &result,
    )?;

    println!("pack");
    println!("input: {}", normalize_path(&args.input));
    println!("output_dir: {}", normalize_path(&paths.output_dir));
    println!("records: {}", records.len());
    println!("ceiling_bytes: {}", result.ceiling_bytes);
    println!("batch_size: {}", result.batch_size);
    println!("removed_stale_files: {}", written.removed.len());
    print_chunks(&prefix, &result);
    println!("chunks: {}", result.chunks.len());
    println!("estimate_calls: {}", result.estimate_calls);
    println!("elapsed_ms: {:.1}", result.elapsed.as_secs_f64() * 1000.0);

    if !result.overflows.is_empty() {
        println!("overflows:");
        for overflow in &result.overflows {
            println!(
                "  - chunk {} uid {}: {} bytes > {}",
                overflow.chunk_index, overflow.uid, overflow.byte_size, overflow.ceiling_bytes
            );
        }
    }
    if !result.long_fields.is_empty() {
        println!(
            "long_fields: {} fields in {} records (> {} chars)",
            result.long_fields.field_count(),
            result.long_fields.entries.len(),
            result.long_fields.threshold
        );
        for entry in result.long_fields.iter() {
            println!("  - {} {}: {}", entry.uid, entry.field, entry.length);
        }
    }
    if let Some(report_path) = &written.report_path {
        println!("report: {}", normalize_path(report_path));
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn print_chunks(prefix: &str, result: &PackingResult) {
    for chunk in &result.chunks {
        println!("[chunk {}]", chunk.index);
        println!("  file: {}", chunk_file_name(prefix, chunk.index));
        println!("  records: {}", chunk.len());
        println!("  bytes: {}", chunk.byte_size);
        println!("  elapsed_ms: {:.1}", chunk.elapsed.as_secs_f64() * 1000.0);
        println!("  estimate_calls: {}", chunk.estimate_calls);
        if chunk.overflow {
            println!("  overflow: yes");
        }
    }
}

fn run_check(runtime: &RuntimeOptions, args: CheckArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let threshold = args
        .threshold
        .unwrap_or(config.pack_options()?.long_field_threshold);
    let report = check_chunk_file(&args.file, threshold)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("check");
        println!("file: {}", normalize_path(&args.file));
        println!("rows: {}", report.rows);
        println!("bytes: {}", report.bytes);
        println!("threshold: {threshold}");
        println!("violations: {}", report.violations.len());
        for violation in &report.violations {
            println!(
                "  - row {} col {} ({}): length={} tab={} leading_space={} trailing_space={}",
                violation.row,
                violation.column,
                violation.column_name.as_deref().unwrap_or("?"),
                violation.length,
                format_flag(violation.has_tab),
                format_flag(violation.starts_with_space),
                format_flag(violation.ends_with_space),
            );
            println!("    sample: {:?}", violation.sample);
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    if !report.violations.is_empty() {
        bail!(
            "{} cells in {} violate chunk constraints",
            report.violations.len(),
            normalize_path(&args.file)
        );
    }
    Ok(())
}

fn run_upload(runtime: &RuntimeOptions, args: UploadArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let options = UploadOptions {
        prefix: args
            .prefix
            .clone()
            .unwrap_or_else(|| config.prefix().to_string()),
        namespace: config.namespace().to_string(),
        summary: config.summary().to_string(),
        limit_bytes: config.pack_options()?.ceiling_bytes,
        max_remote_chunks: config.max_remote_chunks(),
    };
    let dry = args.dry_run || env_flag("DRY_RUN");

    if dry {
        let checks = dry_run(&paths.output_dir, &options)?;
        println!("upload (dry run)");
        println!("output_dir: {}", normalize_path(&paths.output_dir));
        println!("limit_bytes: {}", options.limit_bytes);
        for check in &checks {
            println!(
                "  - {}: {} bytes{}",
                check.file_name,
                check.bytes,
                if check.exceeds { " (exceeds limit)" } else { "" }
            );
        }
        println!("files: {}", checks.len());
        println!(
            "exceeding: {}",
            checks.iter().filter(|check| check.exceeds).count()
        );
        if runtime.diagnostics {
            println!("\n[diagnostics]\n{}", paths.diagnostics());
        }
        return Ok(());
    }

    let credentials = Credentials::from_env()?;
    let report = upload_chunks(&paths.output_dir, &options, &config, &credentials)?;

    println!("upload");
    println!("output_dir: {}", normalize_path(&paths.output_dir));
    for task in &report.tasks {
        match &task.error {
            None => println!(
                "  - {} {}: ok ({:.0} ms)",
                task.action.as_str(),
                task.title,
                task.elapsed_ms
            ),
            Some(error) => println!("  - {} {}: failed: {error}", task.action.as_str(), task.title),
        }
    }
    println!("uploaded: {}", report.uploaded());
    println!("deleted: {}", report.deleted());
    println!("failed: {}", report.failed());
    if let Some(error) = &report.stale_query_error {
        println!("stale_query_error: {error}");
    }
    println!("requests: {}", report.request_count);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    if report.failed() > 0 {
        bail!("{} wiki operations failed", report.failed());
    }
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let options = config.pack_options()?;
    let files = discover_chunk_files(&paths.output_dir, config.prefix())?;

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!(
        "config_path: {} (exists: {})",
        normalize_path(&paths.config_path),
        format_flag(paths.config_path.exists())
    );
    println!(
        "output_dir: {} (exists: {})",
        normalize_path(&paths.output_dir),
        format_flag(paths.output_dir.exists())
    );
    println!("prefix: {}", config.prefix());
    println!("ceiling_bytes: {}", options.ceiling_bytes);
    println!("batch_size: {}", options.batch_size);
    println!("long_field_threshold: {}", options.long_field_threshold);
    println!("languages: {}", language_list(&config)?);
    println!("wiki_api_url: {}", config.api_url_owned().as_deref().unwrap_or("<unset>"));
    println!("chunk_files: {}", files.len());
    if let Some(last) = files.last() {
        println!("last_chunk: {}", last.file_name);
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn language_list(config: &ToolConfig) -> Result<String> {
    Ok(config
        .languages()?
        .iter()
        .map(|language| language.code())
        .collect::<Vec<_>>()
        .join(","))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        output_dir: runtime.output_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
