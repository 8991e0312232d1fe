#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::Parser;
use execsentry_agent::{JsonLinesSource, RuleEngine, RuleRegistry, rules};
use execsentry_eventbus::BusConfig;
use execsentry_lib::alerting::AlertManager;
use execsentry_lib::config::{Config, ConfigLoader};
use execsentry_lib::telemetry;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "execsentry-agent")]
#[command(about = "Runtime detection-rule engine for process execution events")]
#[command(version)]
struct Cli {
    /// Configuration file, merged above the system and user files
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Newline-delimited JSON events to read instead of stdin
    #[arg(short, long)]
    events: Option<PathBuf>,

    /// Log level (overrides configuration)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print the registered rules and exit
    #[arg(long)]
    list_rules: bool,

    /// Do not register the built-in rule catalog
    #[arg(long)]
    no_builtin_rules: bool,

    /// Pending events per rule before the oldest is dropped
    #[arg(long)]
    queue_capacity: Option<usize>,
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {e:#}");
            1
        }
    };
    // Exit explicitly: a stdin read parked on the blocking pool would
    // otherwise hold the runtime open after shutdown.
    std::process::exit(code);
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    telemetry::init_tracing(&config.logging).context("failed to initialize logging")?;

    let mut definitions = Vec::new();
    if config.engine.builtin_rules {
        definitions.extend(rules::builtin());
    }
    definitions.extend(config.rules.iter().cloned());

    let mut registry = RuleRegistry::new();
    let failures = registry.register_all(definitions);
    if !failures.is_empty() {
        warn!(
            failed = failures.len(),
            registered = registry.len(),
            "Some rules failed to register and will not run"
        );
    }

    if cli.list_rules {
        print_rules(&registry);
        return Ok(());
    }

    let alerts = AlertManager::from_configs(config.alerting.sinks.clone())
        .context("failed to configure alert sinks")?;
    let bus_config = BusConfig {
        queue_capacity: config.engine.queue_capacity,
        max_subscribers: config.engine.max_subscribers,
    };
    let mut engine = RuleEngine::new(registry, alerts, bus_config)?;
    let started = engine.start()?;
    if started == 0 {
        bail!("no detection rules could be started");
    }

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &cli.events {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open event input {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let bus = engine.bus();
    let token = engine.shutdown_token();
    // Replay is paced so a burst of input is evaluated rather than evicted.
    let source = JsonLinesSource::new(reader).paced();
    let timeout = Duration::from_millis(config.engine.shutdown_timeout_ms);

    let signal = shutdown_signal();
    tokio::pin!(signal);

    let mut input_error = None;
    let reason = tokio::select! {
        result = source.run(&bus, &token) => match result {
            Ok(_) => tokio::select! {
                idle = engine.wait_idle(timeout) => {
                    if !idle {
                        warn!("Queued events were not fully drained before shutdown");
                    }
                    "end of input"
                }
                reason = &mut signal => reason,
            },
            Err(e) => {
                error!(error = %e, "Event input failed");
                input_error = Some(e);
                "input error"
            }
        },
        reason = &mut signal => reason,
    };

    let summary = engine.shutdown(reason, timeout).await;
    info!(
        reason,
        alerts_emitted = summary.alerts_emitted(),
        timed_out = summary.timed_out.len(),
        events_dropped = engine.statistics().events_dropped,
        "execsentry-agent stopped"
    );

    match input_error {
        Some(e) => Err(e).context("event input failed"),
        None => Ok(()),
    }
}

/// Resolve when the process is asked to stop. Returns the signal name.
#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                "SIGTERM"
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
                "SIGINT"
            }
        },
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Failed to set up signal handlers, only end of input stops the agent");
            std::future::pending().await
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, initiating graceful shutdown");
            "interrupt"
        }
        Err(e) => {
            warn!(error = %e, "Failed to listen for Ctrl+C, only end of input stops the agent");
            std::future::pending().await
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut loader = ConfigLoader::new("execsentry-agent");
    if let Some(path) = &cli.config {
        loader = loader.with_config_file(path);
    }
    let mut config = loader.load().context("failed to load configuration")?;

    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(capacity) = cli.queue_capacity {
        config.engine.queue_capacity = capacity;
    }
    if cli.no_builtin_rules {
        config.engine.builtin_rules = false;
    }
    ConfigLoader::validate_config(&config).context("invalid command line override")?;
    Ok(config)
}

#[allow(clippy::print_stdout)]
fn print_rules(registry: &RuleRegistry) {
    for rule in registry.rules() {
        let definition = &rule.definition;
        println!(
            "{}\t{}\t{}",
            definition.id,
            definition.severity,
            definition.display_name()
        );
    }
}
