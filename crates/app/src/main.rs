//! Entry point: load configuration, wire the components, start the bridge,
//! the scheduler, and the heartbeat, and shut everything down in order.

mod terminal;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use noema_architect::{ArchitectEngine, ProposalNotifier, RollbackManager};
use noema_channels::{ChannelManager, MessageBus, QuietHours};
use noema_config::Config;
use noema_insight::{
    MetricsTracker, ObserverEngine, ObserverScheduler, ReflectionEngine, SignalDetector,
    SignalPriority, SignalStore,
};
use noema_llm::{LlmGateway, ProviderRegistry, ProviderSpec};
use noema_runtime::{
    format_daily_briefing, AgentLoop, BusBridge, BusNotifier, PipelineStages, PostTaskPipeline,
};
use noema_scheduler::{CronService, HeartbeatService, JobCallback};
use noema_store::Workspace;

use terminal::{TerminalChannel, TERMINAL_CHANNEL, TERMINAL_USER};

#[derive(Debug, Parser)]
#[command(name = "noema", version, about = "A self-improving conversational agent")]
struct Cli {
    /// Workspace directory holding rules, memory, and all durable state.
    #[arg(long, default_value = "workspace")]
    workspace: String,
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: Option<String>,
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Interactive mode: talk on stdin/stdout, no background services.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let runtime = tokio::runtime::Runtime::new().context("build tokio runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path),
        None => Config::default(),
    };
    let workspace = Workspace::new(&cli.workspace);
    std::fs::create_dir_all(workspace.root())
        .with_context(|| format!("create workspace at {}", workspace.root().display()))?;

    // LLM gateway over the configured provider registry.
    let providers: HashMap<String, ProviderSpec> =
        config.section("llm.providers").unwrap_or_default();
    let aliases: HashMap<String, String> = config.section("llm.aliases").unwrap_or_default();
    if providers.is_empty() {
        warn!("no LLM providers configured; model calls will return empty replies");
    }
    let llm: Arc<LlmGateway> = Arc::new(LlmGateway::new(ProviderRegistry::new(providers, aliases)));

    // Post-task pipeline stages; presence is configuration, not probing.
    let signal_store = Arc::new(SignalStore::new(&workspace));
    let light_model = config.observer_light_model();
    let stages = PipelineStages {
        reflection: Some(ReflectionEngine::new(
            llm.clone(),
            light_model.clone(),
            workspace.clone(),
        )),
        detector: Some(SignalDetector::new(signal_store.clone(), &workspace)),
        observer: config
            .get_bool("observer.light_mode.enabled", true)
            .then(|| {
                ObserverEngine::new(
                    llm.clone(),
                    llm.clone(),
                    light_model.clone(),
                    config.observer_deep_model(),
                    workspace.clone(),
                )
            }),
        metrics: Some(MetricsTracker::new(&workspace)),
    };

    let mut agent = AgentLoop::new(
        workspace.clone(),
        llm.clone(),
        config.agent_loop_model(),
        light_model.clone(),
    )
    .with_max_history_rounds(config.max_history_rounds());
    agent.attach_pipeline(PostTaskPipeline::spawn(stages));
    let agent = Arc::new(Mutex::new(agent));

    if cli.dry_run {
        return dry_run_loop(agent).await;
    }

    // Bus, channels, bridge.
    let bus = Arc::new(MessageBus::new());
    let mut manager = ChannelManager::new(bus.clone());
    manager
        .register(Box::new(TerminalChannel::new()))
        .context("register terminal channel")?;
    let manager = Arc::new(manager);

    let (quiet_start, quiet_end) = config.quiet_hours();
    let notifier = Arc::new(BusNotifier::new(
        bus.clone(),
        TERMINAL_CHANNEL,
        TERMINAL_USER,
        QuietHours::new(&quiet_start, &quiet_end),
    ));

    // Improvement loop.
    let rollback = Arc::new(RollbackManager::new(workspace.clone()));
    let architect = Arc::new(ArchitectEngine::new(
        workspace.clone(),
        llm.clone(),
        config.architect_model(),
        rollback.clone(),
        Some(notifier.clone() as Arc<dyn ProposalNotifier>),
    ));

    let observer = Arc::new(ObserverEngine::new(
        llm.clone(),
        llm.clone(),
        light_model,
        config.observer_deep_model(),
        workspace.clone(),
    ));
    let observer_scheduler = Arc::new(ObserverScheduler::new(
        observer,
        signal_store.clone(),
        config.observer_schedule(),
        config.emergency_threshold(),
    ));
    let metrics = Arc::new(MetricsTracker::new(&workspace));

    // Cron jobs.
    let mut cron = CronService::new();
    cron.register(
        "observer_deep",
        &config.observer_cron(),
        observer_job(observer_scheduler, metrics.clone()),
    )?;
    let pattern_detector = Arc::new(SignalDetector::new(signal_store.clone(), &workspace));
    cron.register(
        "architect_run",
        &config.architect_cron(),
        architect_job(
            architect.clone(),
            pattern_detector,
            metrics.clone(),
            rollback.clone(),
            config.backup_retention_days(),
        ),
    )?;
    cron.register(
        "daily_briefing",
        &config.briefing_cron(),
        briefing_job(notifier.clone(), metrics.clone()),
    )?;

    let heartbeat = HeartbeatService::new(
        workspace.heartbeat_file(),
        config.heartbeat_interval_s(),
        heartbeat_callback(agent.clone()),
    );

    // Start everything.
    manager.start_all().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bridge = Arc::new(BusBridge::new(
        bus.clone(),
        manager.clone(),
        agent.clone(),
        architect.clone(),
    ));
    let bridge_task = {
        let bridge = bridge.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { bridge.run(shutdown).await })
    };
    let outbound_task = {
        let bridge = bridge.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { bridge.run_outbound(shutdown).await })
    };
    let cron_task = tokio::spawn(cron.run(shutdown_rx.clone()));
    let heartbeat_task = tokio::spawn(heartbeat.run(shutdown_rx.clone()));

    info!("noema is running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");

    // Cooperative shutdown: stop loops, drain the pipeline, stop channels.
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(bridge_task, outbound_task, cron_task, heartbeat_task);
    if let Some(pipeline) = agent.lock().await.take_pipeline() {
        pipeline.shutdown().await;
    }
    manager.stop_all().await;
    info!("noema stopped");
    Ok(())
}

/// Interactive loop against stdin/stdout, no channels or background jobs.
async fn dry_run_loop(agent: Arc<Mutex<AgentLoop>>) -> Result<()> {
    use tokio::io::AsyncBufReadExt;

    println!("noema dry-run: type a message, /quit to exit");
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" || text == "/exit" {
            break;
        }
        let trace = agent.lock().await.process_message(text, None, None).await;
        println!("noema> {}", trace.system_response);
    }
    if let Some(pipeline) = agent.lock().await.take_pipeline() {
        pipeline.shutdown().await;
    }
    Ok(())
}

fn observer_job(
    scheduler: Arc<ObserverScheduler>,
    metrics: Arc<MetricsTracker>,
) -> JobCallback {
    Arc::new(move || {
        let scheduler = scheduler.clone();
        let metrics = metrics.clone();
        Box::pin(async move {
            if let Some(report) = scheduler.check_and_run().await {
                metrics.record_signal("observer_deep_analysis", SignalPriority::Low, "observer");
                info!(findings = report.key_findings.len(), "deep analysis ran");
            }
            Ok(())
        })
    })
}

fn architect_job(
    architect: Arc<ArchitectEngine>,
    detector: Arc<SignalDetector>,
    metrics: Arc<MetricsTracker>,
    rollback: Arc<RollbackManager>,
    retention_days: i64,
) -> JobCallback {
    Arc::new(move || {
        let architect = architect.clone();
        let detector = detector.clone();
        let metrics = metrics.clone();
        let rollback = rollback.clone();
        Box::pin(async move {
            let proposals = architect.analyze_and_propose().await;
            let proposal_count = proposals.len();
            for proposal in proposals {
                let proposal_id = proposal.proposal_id.clone();
                let files = proposal.files_affected.clone();
                let level = architect.determine_approval_level(&proposal);
                let outcome = architect.execute_proposal(proposal).await;
                metrics.record_proposal(&proposal_id, level, outcome.status.as_str(), files);
            }
            info!(count = proposal_count, "architect pass complete");

            // Cross-task patterns accumulate on the architect's cadence.
            detector.detect_patterns(168);

            // Sweep proposals whose verification window may have closed.
            for proposal_id in architect.proposals_in_verification() {
                let outcome = architect.check_verification(&proposal_id).await;
                if outcome == noema_architect::VerificationOutcome::RolledBack {
                    metrics.record_proposal(&proposal_id, 0, "rolled_back", Vec::new());
                }
            }

            rollback.cleanup(retention_days);
            Ok(())
        })
    })
}

fn briefing_job(notifier: Arc<BusNotifier>, metrics: Arc<MetricsTracker>) -> JobCallback {
    Arc::new(move || {
        let notifier = notifier.clone();
        let metrics = metrics.clone();
        Box::pin(async move {
            notifier.flush_pending();
            let summary = metrics.get_daily_summary(None);
            notifier.send_text(format_daily_briefing(&summary));
            metrics.flush_daily(None)?;
            Ok(())
        })
    })
}

fn heartbeat_callback(agent: Arc<Mutex<AgentLoop>>) -> noema_scheduler::HeartbeatCallback {
    Arc::new(move |content| {
        let agent = agent.clone();
        Box::pin(async move {
            agent.lock().await.process_message(&content, None, None).await;
            Ok(())
        })
    })
}
