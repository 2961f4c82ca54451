/// CAN Hydra CLI
///
/// Runs attack scenarios and single attacks against a simulated bus, watches
/// the bus for anomalies, and verifies audit logs.
///
/// SECURITY RESEARCH ONLY: Use only on authorized test systems.
use can_hydra::attack_sim::metrics::{AttackMetrics, ScenarioComparison};
use can_hydra::attack_sim::orchestrator::{Difficulty, ScenarioReport};
use can_hydra::monitor::CaptureWriter;
use can_hydra::security_log::verify_log_file;
use can_hydra::{
    AttackConfig, AttackEngine, BackgroundLogSink, BusTransport, HydraConfig, JsonlLogSink,
    LogSink, Monitor, MonitorHandle, SafetyValidator, ScenarioError, ScenarioOrchestrator,
    ScenarioOutcome, StopToken,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser, Debug)]
#[command(name = "can_hydra")]
#[command(version, about = "Controlled-harm CAN bus attack and monitoring toolkit", long_about = None)]
struct Cli {
    /// JSON configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available scenarios
    List {
        #[arg(long)]
        category: Option<String>,

        /// easy, medium or hard
        #[arg(long)]
        difficulty: Option<Difficulty>,
    },

    /// Run one or more named scenarios in order
    ///
    /// With several scenarios a side-by-side comparison is printed at the end.
    Run {
        #[arg(required = true)]
        scenarios: Vec<String>,

        /// Validate and log frames without transmitting
        #[arg(long)]
        dry_run: bool,

        /// Declare a prerequisite as reachable (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        /// Run the monitor on the same transport during the scenario
        #[arg(long)]
        monitor: bool,
    },

    /// Run a single attack described by a JSON file
    Attack {
        file: PathBuf,

        #[arg(long)]
        dry_run: bool,
    },

    /// Watch the bus and classify traffic
    Monitor {
        /// Stop after this many seconds (runs until Ctrl+C otherwise)
        #[arg(short, long)]
        duration: Option<u64>,

        /// Append observed frames to this replay-format capture file
        #[arg(long)]
        capture: Option<PathBuf>,
    },

    /// Verify the hash chain of an audit log
    VerifyLog { path: PathBuf },
}

#[tokio::main]
async fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => HydraConfig::load(path)?,
        None => HydraConfig::default(),
    };

    match cli.command {
        Command::List {
            category,
            difficulty,
        } => list_scenarios(&config, category.as_deref(), difficulty),
        Command::Run {
            scenarios,
            dry_run,
            capabilities,
            monitor,
        } => run_scenarios(config, &scenarios, dry_run, capabilities, monitor).await,
        Command::Attack { file, dry_run } => run_attack(config, &file, dry_run).await,
        Command::Monitor { duration, capture } => run_monitor(config, duration, capture).await,
        Command::VerifyLog { path } => verify_log(&path),
    }
}

fn print_banner(title: &str) {
    let rule = "═══════════════════════════════════════════════════════════════";
    println!("{}", rule.red().bold());
    println!("{}", format!("         {:<54}", title).red().bold());
    println!("{}", rule.red().bold());
    println!();
}

fn list_scenarios(
    config: &HydraConfig,
    category: Option<&str>,
    difficulty: Option<Difficulty>,
) -> CliResult<()> {
    let library = config.scenario_library()?;
    let scenarios = library.list(category, difficulty);

    print_banner("CAN HYDRA SCENARIOS");
    if scenarios.is_empty() {
        println!("{} No scenarios match the given filters", "ℹ".bright_blue());
        return Ok(());
    }

    for scenario in scenarios {
        let difficulty = match scenario.difficulty {
            Difficulty::Easy => scenario.difficulty.to_string().green(),
            Difficulty::Medium => scenario.difficulty.to_string().yellow(),
            Difficulty::Hard => scenario.difficulty.to_string().red(),
        };
        println!(
            "{} {} [{}] {}",
            "→".cyan(),
            scenario.name.bright_white().bold(),
            difficulty,
            scenario.category.bright_black()
        );
        println!("    {}", scenario.description);
        println!(
            "    steps: {}  planned: {}s",
            scenario.steps.len(),
            scenario.planned_duration().as_secs()
        );
        if !scenario.prerequisites.is_empty() {
            let prereqs: Vec<&str> = scenario.prerequisites.iter().map(String::as_str).collect();
            println!("    requires: {}", prereqs.join(", "));
        }
        if !scenario.expected_impact.is_empty() {
            println!("    impact: {}", scenario.expected_impact.bright_black());
        }
        println!();
    }
    Ok(())
}

/// JSONL log file under the audit directory, announced on stdout
fn create_log(config: &HydraConfig, prefix: &str) -> CliResult<JsonlLogSink> {
    let sink = JsonlLogSink::create(&config.audit_log_dir, prefix)?;
    println!(
        "{} {} log: {}",
        "ℹ".bright_blue(),
        prefix,
        sink.path().display().to_string().bright_white()
    );
    Ok(sink)
}

/// Transport, audit sink and engine for one run
///
/// Audit writes go through a background writer so concurrent attacks never
/// wait on the file.
async fn build_engine(config: &HydraConfig) -> CliResult<(AttackEngine, Arc<BackgroundLogSink>)> {
    let transport = config.transport.connect().await?;
    let sink = Arc::new(BackgroundLogSink::spawn(Arc::new(create_log(config, "audit")?)));

    let validator = Arc::new(SafetyValidator::new(
        config.safety.clone(),
        config.rate_limit.build(),
        sink.clone(),
    ));
    Ok((AttackEngine::new(transport, validator), sink))
}

/// Stop everything on Ctrl+C
fn stop_on_ctrl_c(stop: &StopToken) {
    let stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n{} Emergency stop requested", "⚠".yellow().bold());
            stop.stop();
        }
    });
}

async fn spawn_monitor(
    config: &HydraConfig,
    transport: &dyn BusTransport,
    sink: Arc<dyn LogSink>,
    capture: Option<&Path>,
    stop: &StopToken,
) -> CliResult<MonitorHandle> {
    let mut monitor = Monitor::new(config.monitor.clone(), sink);
    if let Some(path) = capture {
        monitor = monitor.with_capture(CaptureWriter::create(path)?);
        println!(
            "{} Capturing frames to {}",
            "ℹ".bright_blue(),
            path.display().to_string().bright_white()
        );
    }
    Ok(monitor.spawn(transport, stop).await?)
}

async fn run_scenarios(
    config: HydraConfig,
    names: &[String],
    dry_run: bool,
    capabilities: Vec<String>,
    with_monitor: bool,
) -> CliResult<()> {
    print_banner("CAN HYDRA SCENARIO RUNNER");

    let library = config.scenario_library()?;
    let mut registry = config.capability_registry();
    for capability in capabilities {
        registry.declare(capability);
    }

    let (engine, sink) = build_engine(&config).await?;
    let stop = StopToken::new();
    stop_on_ctrl_c(&stop);

    // The monitor writes its own file so it never contends with the audit writer
    let monitor = if with_monitor {
        Some(
            spawn_monitor(
                &config,
                engine.transport().as_ref(),
                Arc::new(create_log(&config, "monitor")?),
                config.monitor.capture_path.as_deref(),
                &stop,
            )
            .await?,
        )
    } else {
        None
    };

    let orchestrator = ScenarioOrchestrator::new(engine, Arc::new(registry))
        .with_budget_overhead(config.budget_overhead())
        .with_dry_run(dry_run);

    let mut comparison = ScenarioComparison::new();
    let mut failure = None;

    for name in names {
        if stop.is_stopped() {
            break;
        }

        println!(
            "{} Running scenario {}{}",
            "→".green(),
            name.bright_white().bold(),
            if dry_run { " (dry run)".yellow().to_string() } else { String::new() }
        );

        match orchestrator.run_named(&library, name, &stop).await {
            Ok(report) => {
                print_scenario_report(&report);
                comparison.add_scenario(&report);
            }
            Err(e) => {
                eprintln!("{} {}", "✗".red().bold(), e);
                if matches!(e, ScenarioError::UnknownScenario(_)) {
                    let mut available = library.names();
                    available.sort_unstable();
                    eprintln!("  available: {}", available.join(", "));
                }
                failure = Some(e);
                break;
            }
        }
    }

    if comparison.scenarios.len() > 1 {
        print!("{}", comparison.generate_report());
    }

    if let Some(monitor) = monitor {
        let stats = monitor.shutdown().await;
        print_monitor_stats(&stats);
    }

    sink.flush().await;
    info!(audit_records = sink.len(), "run complete");

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn print_scenario_report(report: &ScenarioReport) {
    for result in &report.results {
        let mark = if result.outcome == can_hydra::AttackOutcome::Completed {
            "✓".green()
        } else {
            "⚠".yellow()
        };
        println!(
            "  {} {:<20} {:<8} sent {:>6}  blocked {:>6}  {}",
            mark,
            result.name,
            result.kind,
            result.frames_sent,
            result.frames_blocked,
            result.outcome
        );
        if let Some(detail) = &result.detail {
            println!("      {}", detail.bright_black());
        }
    }

    match report.outcome {
        ScenarioOutcome::Completed => println!("{} Scenario completed", "✓".green().bold()),
        ScenarioOutcome::Stopped => println!("{} Scenario stopped", "⚠".yellow().bold()),
        ScenarioOutcome::BudgetExceeded => println!(
            "{} Scenario exceeded its {} ms budget",
            "✗".red().bold(),
            report.budget_ms
        ),
    }

    print!("{}", AttackMetrics::from_results(&report.results).generate_report());
}

async fn run_attack(config: HydraConfig, file: &Path, dry_run: bool) -> CliResult<()> {
    print_banner("CAN HYDRA ATTACK");

    let content = std::fs::read_to_string(file)?;
    let mut attack: AttackConfig = serde_json::from_str(&content)?;
    attack.dry_run |= dry_run;

    let (engine, sink) = build_engine(&config).await?;
    let stop = StopToken::new();
    stop_on_ctrl_c(&stop);

    println!(
        "{} {} attack '{}' for {} ms",
        "→".green(),
        attack.kind.label().bright_white().bold(),
        attack.display_name(),
        attack.duration_ms
    );

    let outcome = engine.run(&attack, &stop).await;
    sink.flush().await;
    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            eprintln!("{} Attack rejected: {}", "✗".red().bold(), e);
            return Err(e.into());
        }
    };

    println!(
        "{} {}: sent {}, blocked {} ({:.1}% blocked)",
        "✓".green(),
        result.outcome,
        result.frames_sent,
        result.frames_blocked,
        result.block_ratio() * 100.0
    );
    if let Some(detail) = &result.detail {
        println!("  {}", detail.bright_black());
    }
    Ok(())
}

async fn run_monitor(
    config: HydraConfig,
    duration: Option<u64>,
    capture: Option<PathBuf>,
) -> CliResult<()> {
    print_banner("CAN HYDRA MONITOR");

    let transport = config.transport.connect().await?;
    let sink = Arc::new(create_log(&config, "monitor")?);
    let stop = StopToken::new();
    stop_on_ctrl_c(&stop);

    let capture = capture.or_else(|| config.monitor.capture_path.clone());
    let handle = spawn_monitor(
        &config,
        transport.as_ref(),
        sink.clone(),
        capture.as_deref(),
        &stop,
    )
    .await?;

    println!(
        "{} Monitoring {} (Ctrl+C to stop)",
        "✓".green().bold(),
        transport.channel_name().bright_white()
    );

    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = stop.stopped() => break,
            _ = &mut deadline => break,
            _ = ticker.tick() => {
                let stats = handle.stats();
                info!(
                    observed = stats.frames_observed,
                    anomalies = stats.anomalies(),
                    dropped = stats.events_dropped,
                    pending = handle.pending(),
                    "monitor progress"
                );
            }
        }
    }

    let stats = handle.shutdown().await;
    print_monitor_stats(&stats);
    Ok(())
}

fn print_monitor_stats(stats: &can_hydra::MonitorStats) {
    println!();
    println!("{}", "MONITOR STATISTICS".bold());
    println!("------------------");
    println!("Frames Observed:           {}", stats.frames_observed);
    println!("Novel IDs:                 {}", stats.novel_id);
    println!("Rate Anomalies:            {}", stats.rate_anomaly);
    println!("Payload Anomalies:         {}", stats.payload_anomaly);
    println!("Nominal:                   {}", stats.nominal);
    println!("Events Dropped:            {}", stats.events_dropped);
    println!("Receiver Skipped:          {}", stats.receiver_skipped);
}

fn verify_log(path: &Path) -> CliResult<()> {
    let result = verify_log_file(path)?;

    if result.verified {
        println!(
            "{} {} verified ({} entries)",
            "✓".green().bold(),
            path.display(),
            result.total_entries
        );
        return Ok(());
    }

    println!(
        "{} {} failed verification ({} entries, {} issues)",
        "✗".red().bold(),
        path.display(),
        result.total_entries,
        result.issues.len()
    );
    for issue in &result.issues {
        println!("  {} {}", "⚠".yellow(), issue);
    }
    Err(format!("audit log {} failed verification", path.display()).into())
}
