use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use irisscope_ai::{
    GenerationConfig, IrisPipeline, LLMProviderFactory, LogCallback, LogLevel, ProgressCallback,
    PromptStore, ProviderGateway, ReportAssembler,
};
use irisscope_core::analysis::{AnalysisReport, IrisAnalysis, ZoneStatus};
use irisscope_core::config_manager::{ConfigManager, IrisScopeConfig, PartialReportPolicy};
use irisscope_core::image::{IrisImage, Side};
use irisscope_core::questionnaire::QuestionnaireData;
use irisscope_core::store::{FileStore, ReportArchive};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "irisscope")]
#[command(about = "IrisScope CLI - staged LLM iris image analysis", long_about = None)]
#[command(version)]
struct Cli {
    /// Output format (json, pretty)
    #[arg(short, long, global = true, default_value = "pretty")]
    output: OutputFormat,

    /// Explicit config file (defaults to ./.irisscope.toml or ~/.irisscope/config.toml)
    #[arg(long, global = true, env = "IRISSCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyse a left and right iris image
    Analyze {
        /// Left eye image (png, jpeg, webp)
        #[arg(long)]
        left: PathBuf,

        /// Right eye image (png, jpeg, webp)
        #[arg(long)]
        right: PathBuf,

        /// Questionnaire JSON file
        #[arg(short, long)]
        questionnaire: Option<PathBuf>,

        /// Also write the report JSON to this file
        #[arg(long)]
        out: Option<PathBuf>,

        /// Keep the report when only one eye could be analysed
        #[arg(long)]
        allow_partial: bool,

        /// Do not persist the report in the data directory
        #[arg(long)]
        no_save: bool,
    },

    /// Show a stored report (latest by default)
    Report {
        /// Report id
        id: Option<String>,
    },

    /// List prompt templates with version and checksum
    Prompts,

    /// Write a default config file
    InitConfig {
        /// Destination (defaults to ~/.irisscope/config.toml)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Serialize)]
struct PromptInfo {
    stage: String,
    version: String,
    checksum: String,
    overridden: bool,
}

#[derive(Serialize)]
struct InitConfigResult {
    path: String,
    status: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let manager = match &cli.config {
        Some(path) => ConfigManager::load_from(path),
        None => ConfigManager::load(),
    }
    .context("Failed to load configuration")?;
    let config = manager.config().clone();

    init_tracing(&config, cli.verbose)?;

    match execute_command(&cli, config).await {
        Ok(output) => {
            print_output(&cli.output, &output)?;
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_tracing(config: &IrisScopeConfig, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };

    let registry = tracing_subscriber::registry().with(filter);
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    match config.logging.format.as_str() {
        "json" => registry.with(layer.json()).try_init(),
        "compact" => registry.with(layer.compact()).try_init(),
        _ => registry.with(layer.pretty()).try_init(),
    }
    .context("Failed to initialise logging")
}

async fn execute_command(cli: &Cli, config: IrisScopeConfig) -> Result<OutputValue> {
    match &cli.command {
        Commands::Analyze {
            left,
            right,
            questionnaire,
            out,
            allow_partial,
            no_save,
        } => {
            let report = execute_analyze(
                &config,
                left,
                right,
                questionnaire.as_deref(),
                *allow_partial,
                matches!(cli.output, OutputFormat::Pretty),
            )
            .await?;

            if let Some(path) = out {
                let json = serde_json::to_string_pretty(&report)?;
                std::fs::write(path, json)
                    .with_context(|| format!("Failed to write report to {}", path.display()))?;
            }
            if !*no_save {
                archive(&config)?.save(&report).context("Failed to store report")?;
                info!(report_id = %report.id, "Report stored");
            }
            Ok(OutputValue::Report(Box::new(report)))
        }
        Commands::Report { id } => {
            let archive = archive(&config)?;
            let report = match id {
                Some(id) => {
                    let id = Uuid::parse_str(id).context("Invalid report ID format")?;
                    archive.load(&id)?
                }
                None => archive.latest()?,
            };
            let report = report.ok_or_else(|| anyhow!("No stored report found"))?;
            Ok(OutputValue::Report(Box::new(report)))
        }
        Commands::Prompts => {
            let store = prompt_store(&config)?;
            let prompts: Vec<PromptInfo> = store
                .templates()
                .into_iter()
                .map(|t| PromptInfo {
                    stage: t.stage.as_str().to_string(),
                    version: t.version.clone(),
                    checksum: t.checksum.clone(),
                    overridden: t.overridden,
                })
                .collect();
            Ok(OutputValue::Json(serde_json::to_value(prompts)?))
        }
        Commands::InitConfig { path, force } => {
            let path = match path {
                Some(path) => path.clone(),
                None => dirs_config_path()?,
            };
            if path.exists() && !*force {
                return Err(anyhow!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                ));
            }
            ConfigManager::create_default_config(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            Ok(OutputValue::Json(serde_json::to_value(InitConfigResult {
                path: path.display().to_string(),
                status: "created".to_string(),
            })?))
        }
    }
}

enum OutputValue {
    Report(Box<AnalysisReport>),
    Json(serde_json::Value),
}

fn dirs_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| anyhow!("Cannot determine home directory; pass a path"))?;
    Ok(home.join(".irisscope").join("config.toml"))
}

fn archive(config: &IrisScopeConfig) -> Result<ReportArchive> {
    let dir = config.storage.resolved_data_dir();
    let store = FileStore::open(&dir)
        .with_context(|| format!("Failed to open data directory {}", dir.display()))?;
    Ok(ReportArchive::new(Arc::new(store)))
}

fn prompt_store(config: &IrisScopeConfig) -> Result<PromptStore> {
    let store = PromptStore::new();
    match &config.prompts.overrides_dir {
        Some(dir) => store
            .load_overrides(dir)
            .with_context(|| format!("Failed to load prompt overrides from {}", dir.display())),
        None => Ok(store),
    }
}

fn load_image(path: &Path, side: Side) -> Result<IrisImage> {
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => return Err(anyhow!("Unsupported image type: {}", path.display())),
    };
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    IrisImage::from_bytes(&bytes, mime, side)
        .with_context(|| format!("Invalid image {}", path.display()))
}

fn load_questionnaire(path: Option<&Path>) -> Result<QuestionnaireData> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Invalid questionnaire JSON in {}", path.display()))
        }
        None => Ok(QuestionnaireData::default()),
    }
}

async fn execute_analyze(
    config: &IrisScopeConfig,
    left: &Path,
    right: &Path,
    questionnaire: Option<&Path>,
    allow_partial: bool,
    show_progress: bool,
) -> Result<AnalysisReport> {
    let left_image = load_image(left, Side::Left)?;
    let right_image = load_image(right, Side::Right)?;
    let questionnaire = load_questionnaire(questionnaire)?;

    let provider = LLMProviderFactory::create_from_config(&config.llm)
        .context("Failed to create LLM provider")?;
    info!(
        provider = provider.provider_name(),
        model = provider.model_name(),
        "Using LLM provider"
    );
    if !LLMProviderFactory::check_availability(&provider).await {
        warn!(
            provider = provider.provider_name(),
            "LLM provider did not answer the availability check"
        );
    }
    let gateway = Arc::new(ProviderGateway::new(provider).with_generation_config(
        GenerationConfig {
            temperature: config.llm.temperature,
            max_tokens: Some(config.llm.max_tokens),
            ..GenerationConfig::default()
        },
    ));
    let prompts = Arc::new(prompt_store(config)?);

    let pipeline = IrisPipeline::new(
        gateway,
        prompts,
        &config.pipeline,
        config.aggregation.clone(),
    );
    let policy = if allow_partial {
        PartialReportPolicy::AllowPartial
    } else {
        config.report.partial_policy
    };
    let assembler = ReportAssembler::new(policy, pipeline.prompt_version());

    let multi_progress = MultiProgress::new();
    if !show_progress {
        multi_progress.set_draw_target(indicatif::ProgressDrawTarget::hidden());
    }
    let style = ProgressStyle::with_template("{prefix:>6.bold} [{bar:30.cyan/blue}] {pos:>3}% {msg}")?
        .progress_chars("█▉▊▋▌▍▎▏ ");
    let left_bar = progress_bar(&multi_progress, &style, Side::Left);
    let right_bar = progress_bar(&multi_progress, &style, Side::Right);

    let callbacks = |side: Side| -> (ProgressCallback, LogCallback) {
        let bar = match side {
            Side::Left => left_bar.clone(),
            Side::Right => right_bar.clone(),
        };
        let log_bar = bar.clone();
        (
            Arc::new(move |stage: &str, percent: u8| {
                bar.set_position(u64::from(percent));
                bar.set_message(stage.to_string());
            }),
            Arc::new(move |level: LogLevel, message: &str| {
                let tag = match level {
                    LogLevel::Info => "info".blue(),
                    LogLevel::Success => "ok".green(),
                    LogLevel::Warning => "warn".yellow(),
                    LogLevel::Error => "error".red().bold(),
                };
                log_bar.println(format!("[{}] {} {}", side, tag, message));
            }),
        )
    };

    let result = assembler
        .analyze_both(
            &pipeline,
            &left_image,
            &right_image,
            &questionnaire,
            &callbacks,
        )
        .await;

    left_bar.finish();
    right_bar.finish();

    Ok(result?)
}

fn progress_bar(multi: &MultiProgress, style: &ProgressStyle, side: Side) -> ProgressBar {
    let bar = multi.add(ProgressBar::new(100));
    bar.set_style(style.clone());
    bar.set_prefix(side.as_str());
    bar
}

fn print_output(format: &OutputFormat, value: &OutputValue) -> Result<()> {
    match (format, value) {
        (OutputFormat::Json, OutputValue::Report(report)) => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        (OutputFormat::Json, OutputValue::Json(value)) => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        (OutputFormat::Pretty, OutputValue::Report(report)) => print_report(report),
        (OutputFormat::Pretty, OutputValue::Json(value)) => print_pretty(value)?,
    }
    Ok(())
}

fn health_colored(score: u8) -> colored::ColoredString {
    let text = score.to_string();
    match score {
        80..=100 => text.green().bold(),
        60..=79 => text.yellow().bold(),
        _ => text.red().bold(),
    }
}

fn print_report(report: &AnalysisReport) {
    println!("{} {}", "Report".cyan().bold(), report.id);
    println!(
        "{}: {}   {}: {}",
        "Created".cyan(),
        report.created_at.to_rfc3339(),
        "Prompts".cyan(),
        report.prompt_version
    );
    println!(
        "{}: {}",
        "Overall health".cyan().bold(),
        health_colored(report.overall_health)
    );

    for system in &report.system_scores {
        println!(
            "  {:<15} {:>3}  {}",
            system.system.as_str(),
            health_colored(system.score),
            system.description.dimmed()
        );
    }

    for side in [Side::Left, Side::Right] {
        if let Some(analysis) = report.analysis(side) {
            print_analysis(analysis);
        }
    }

    for failure in &report.failures {
        println!(
            "\n{} {} eye failed at {} [{}]: {}",
            "!".red().bold(),
            failure.side,
            failure.stage,
            failure.code.red(),
            failure.message
        );
    }
}

fn print_analysis(analysis: &IrisAnalysis) {
    println!(
        "\n{} {} (health {}, image quality {:.0})",
        "Eye:".cyan().bold(),
        analysis.side.as_str().bold(),
        health_colored(analysis.overall_health),
        analysis.image_quality
    );
    for zone in &analysis.zones {
        let status = match zone.status {
            ZoneStatus::Normal => "normal".green(),
            ZoneStatus::Attention => "attention".yellow(),
            ZoneStatus::Concern => "concern".red().bold(),
        };
        println!(
            "  {:>2} {:<14} {:<28} {:<10} {}",
            zone.id,
            zone.name,
            zone.organ,
            status,
            zone.findings.dimmed()
        );
    }
    if !analysis.artifacts.is_empty() {
        println!("  {}", "Artifacts".cyan());
        for artifact in &analysis.artifacts {
            println!(
                "    {:<18} {:<12} {:<7} {}",
                artifact.kind,
                artifact.location,
                artifact.severity.as_str(),
                artifact.description
            );
        }
    }
}

fn print_pretty(value: &serde_json::Value) -> Result<()> {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map {
                let key_colored = key.cyan().bold();
                match val {
                    serde_json::Value::String(s) => {
                        println!("{}: {}", key_colored, s.green());
                    }
                    serde_json::Value::Number(n) => {
                        println!("{}: {}", key_colored, n.to_string().yellow());
                    }
                    serde_json::Value::Bool(b) => {
                        let val_colored = if *b {
                            "true".green()
                        } else {
                            "false".red()
                        };
                        println!("{}: {}", key_colored, val_colored);
                    }
                    _ => {
                        println!("{}: {}", key_colored, val);
                    }
                }
            }
        }
        serde_json::Value::Array(arr) => {
            for (i, item) in arr.iter().enumerate() {
                println!("\n{}{}:", "Item ".cyan(), (i + 1).to_string().yellow());
                print_pretty(item)?;
            }
        }
        _ => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
    }
    Ok(())
}
