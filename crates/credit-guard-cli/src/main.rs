use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use credit_guard_core::{
    gateway::HealthStatus, render_evaluation, supervisor::DEFAULT_REVIEW_WINDOW, AuditTrail,
    AzureOpenAiProvider, CompanyRecord, CompletionProvider, ContentFilter, FilterPolicy,
    ModelRouter, NoopProvider, Orchestrator, OutputFormat, OutputSanitizer, PipelineConfig,
    ProviderSettings, RecommendedAction,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "credit-guard",
    author,
    version,
    about = "SME credit-risk evaluation pipeline behind a guarded completion gateway"
)]
struct Cli {
    /// Pipeline configuration file (TOML, YAML or JSON)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Directory containing a filter policy pack (keywords.txt, patterns.json)
    #[arg(long = "rules-dir", value_name = "DIR", global = true)]
    rules_dir: Option<PathBuf>,

    /// Completion provider backing the gateway
    #[arg(long, value_enum, default_value_t = ProviderKind::Azure, global = true)]
    provider: ProviderKind,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProviderKind {
    /// Azure OpenAI, configured through CREDIT_GUARD_* variables
    Azure,
    /// Offline provider; every completion call fails
    Noop,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evaluate one company record
    Evaluate {
        /// Company record as JSON or YAML
        #[arg(long, value_name = "FILE")]
        input: PathBuf,
        /// Emit the evaluation result as JSON
        #[arg(long)]
        json: bool,
        /// Overall evaluation deadline, e.g. `90s` or `2m`
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
        /// Append every audit event to this JSONL file
        #[arg(long, value_name = "FILE")]
        audit_log: Option<PathBuf>,
    },
    /// Show the model tier recommended for a task
    Models {
        /// Task name; lists the whole routing table when omitted
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Run stdin through the inbound filter and the outbound sanitizer offline
    Check {
        #[arg(long)]
        json: bool,
    },
    /// Issue a minimal completion through the gateway
    Health,
    /// Review a JSONL audit log for anomalous activity
    Supervise {
        #[arg(long, value_name = "FILE")]
        audit_log: PathBuf,
        /// Number of most recent events to review
        #[arg(long, default_value_t = DEFAULT_REVIEW_WINDOW)]
        last: usize,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_pipeline_config(cli.config.as_deref(), cli.rules_dir.as_deref())?;

    match cli.command {
        Commands::Evaluate {
            input,
            json,
            timeout,
            audit_log,
        } => {
            let audit = match audit_log {
                Some(path) => AuditTrail::with_jsonl_sink(path)?,
                None => AuditTrail::new(),
            };
            evaluate(&config, cli.provider, Arc::new(audit), &input, json, timeout).await
        }
        Commands::Models { task, json } => models(&config, cli.provider, task.as_deref(), json),
        Commands::Check { json } => check(&config, json),
        Commands::Health => health(&config, cli.provider).await,
        Commands::Supervise {
            audit_log,
            last,
            json,
        } => supervise(&config, cli.provider, &audit_log, last, json).await,
    }
}

fn load_pipeline_config(path: Option<&Path>, rules_dir: Option<&Path>) -> Result<PipelineConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("CREDIT_GUARD")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );
    let settings = builder
        .build()
        .context("failed to load pipeline configuration")?;
    let mut pipeline: PipelineConfig = settings
        .try_deserialize()
        .context("invalid pipeline configuration")?;

    if let Some(dir) = rules_dir {
        let pack = FilterPolicy::from_dir(dir)
            .with_context(|| format!("failed to load rules from {}", dir.display()))?;
        pipeline.filter.blocked_keywords = pack.blocked_keywords;
        pipeline.filter.pii_patterns = pack.pii_patterns;
    }
    pipeline.validate()?;
    Ok(pipeline)
}

fn build_provider(
    kind: ProviderKind,
    config: &mut PipelineConfig,
) -> Result<Arc<dyn CompletionProvider>> {
    match kind {
        ProviderKind::Noop => Ok(Arc::new(NoopProvider)),
        ProviderKind::Azure => {
            let settings = ProviderSettings::from_env()?;
            config.gateway.fast_deployment = settings.fast_deployment.clone();
            config.gateway.capable_deployment = settings.capable_deployment.clone();
            Ok(Arc::new(AzureOpenAiProvider::new(&settings)?))
        }
    }
}

fn build_orchestrator(
    config: &PipelineConfig,
    kind: ProviderKind,
    audit: Arc<AuditTrail>,
) -> Result<Orchestrator> {
    let mut config = config.clone();
    let provider = build_provider(kind, &mut config)?;
    Orchestrator::new(provider, &config, audit)
}

fn read_record(path: &Path) -> Result<CompanyRecord> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read company record from {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );
    let record = if is_yaml {
        serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid YAML company record in {}", path.display()))?
    } else {
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON company record in {}", path.display()))?
    };
    Ok(record)
}

async fn evaluate(
    config: &PipelineConfig,
    kind: ProviderKind,
    audit: Arc<AuditTrail>,
    input: &Path,
    json: bool,
    timeout: Option<Duration>,
) -> Result<ExitCode> {
    let record = read_record(input)?;
    let orchestrator = build_orchestrator(config, kind, audit)?;
    let timeout = timeout.unwrap_or_else(|| config.evaluation_timeout());
    let result = orchestrator.evaluate_with_timeout(&record, timeout).await;

    if json {
        println!("{}", render_evaluation(&result, OutputFormat::Json)?);
    } else {
        print!("{}", render_evaluation(&result, OutputFormat::Human)?);
        if result.success {
            println!("{}", "evaluation completed".green().bold());
        } else {
            println!("{}", "evaluation failed".red().bold());
        }
    }
    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn models(
    config: &PipelineConfig,
    kind: ProviderKind,
    task: Option<&str>,
    json: bool,
) -> Result<ExitCode> {
    let mut config = config.clone();
    if kind == ProviderKind::Azure {
        // deployment names only; a missing key is not an error here
        if let Ok(settings) = ProviderSettings::from_env() {
            config.gateway.fast_deployment = settings.fast_deployment;
            config.gateway.capable_deployment = settings.capable_deployment;
        }
    }
    let router = ModelRouter::new(
        config.routing.clone(),
        config.gateway.fast_deployment.clone(),
        config.gateway.capable_deployment.clone(),
    );

    let recommendations: Vec<_> = match task {
        Some(task) => vec![router.recommend(task)],
        None => router
            .tasks()
            .map(|(task, _)| router.recommend(task))
            .collect(),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&recommendations)?);
        return Ok(ExitCode::SUCCESS);
    }
    for rec in recommendations {
        println!(
            "- {task:<24} {tier:<8} {deployment:<16} {reason}",
            task = rec.task,
            tier = rec.tier.to_string().cyan(),
            deployment = rec.deployment,
            reason = rec.reason
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn check(config: &PipelineConfig, json: bool) -> Result<ExitCode> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .context("failed to read text from stdin")?;
    if input.trim().is_empty() {
        bail!("no input provided on stdin");
    }

    let filter = ContentFilter::new(&config.filter).context("invalid filter policy")?;
    let inbound = filter.check_inbound(&input);
    let outbound = OutputSanitizer::new(filter).sanitize(&input);

    if json {
        let report = json!({
            "inbound": match &inbound {
                Ok(()) => json!({ "allowed": true }),
                Err(err) => json!({ "allowed": false, "kind": err.kind(), "message": err.to_string() }),
            },
            "outbound": outbound,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        match &inbound {
            Ok(()) => println!("Inbound: {}", "allowed".green()),
            Err(err) => println!("Inbound: {} ({}: {err})", "rejected".red(), err.kind()),
        }
        if outbound.is_safe {
            println!("Outbound: {}", "no redactions".green());
        } else {
            println!("Outbound: {}", "redacted".yellow());
            for detail in &outbound.details {
                println!("  - {} x{}", detail.rule_id, detail.count);
            }
        }
        println!();
        println!("{}", outbound.sanitized_text.trim_end());
    }
    Ok(if inbound.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

async fn health(config: &PipelineConfig, kind: ProviderKind) -> Result<ExitCode> {
    let orchestrator = build_orchestrator(config, kind, Arc::new(AuditTrail::new()))?;
    let gateway = orchestrator.gateway();
    println!("Checking provider {}...", gateway.usage().provider);
    let report = gateway.health_check().await;
    let usage = gateway.usage();

    let healthy = report.status == HealthStatus::Healthy;
    if healthy {
        println!("  status: {} ({} ms)", "healthy".green(), report.latency_ms);
    } else {
        println!("  status: {} ({} ms)", "unhealthy".red(), report.latency_ms);
    }
    if let Some(error) = &report.error {
        println!("  error: {error}");
    }
    println!(
        "  rate limit: {}/{} calls per {} s • token ceiling {}",
        usage.calls_in_window,
        usage.rate_limit_per_window,
        usage.rate_window_secs,
        usage.max_tokens_ceiling
    );
    println!(
        "  content filtering: {} • PII detection: {}",
        on_off(usage.content_filtering),
        on_off(usage.pii_detection)
    );
    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

async fn supervise(
    config: &PipelineConfig,
    kind: ProviderKind,
    audit_log: &Path,
    last: usize,
    json: bool,
) -> Result<ExitCode> {
    let audit = Arc::new(AuditTrail::from_jsonl(audit_log)?);
    let orchestrator = build_orchestrator(config, kind, audit)?;
    let report = orchestrator.supervisor().review(last).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let action = match report.recommended_action {
            RecommendedAction::None => "none".green(),
            RecommendedAction::ManualReview => "manual review".yellow(),
            RecommendedAction::CriticalAlert => "critical alert".red().bold(),
        };
        println!(
            "Anomaly detected: {} (confidence {:.2})",
            report.anomaly_detected, report.confidence_score
        );
        println!("Recommended action: {action}");
        println!("Summary: {}", report.summary);
        println!(
            "Reviewed {} event(s): {} failed validation(s), {} policy rejection(s), {} upstream failure(s)",
            report.signals.events_reviewed,
            report.signals.failed_validations,
            report.signals.policy_rejections,
            report.signals.upstream_failures
        );
    }
    Ok(match report.recommended_action {
        RecommendedAction::None => ExitCode::SUCCESS,
        _ => ExitCode::from(3),
    })
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tokio=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .try_init();
}
