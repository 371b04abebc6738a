/*!
 * Tether CLI - Command Line Interface
 *
 * Inspect and validate provider configuration, or probe every configured
 * endpoint through the full resilience stack.
 */

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tether::{
    config::{LogLevel, ResilienceSettings, TetherConfig},
    error::{TetherError, EXIT_FATAL, EXIT_SUCCESS},
    logging, HttpConnection, HttpProvider, ProviderRegistry,
};
use tether_core_resilience::{ConnectionMetrics, ProviderHealth, ResilienceEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tether")]
#[command(version, about = "Resilient connections to LLM inference providers", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long = "log-level", value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Log file path (JSON lines; stdout when omitted)
    #[arg(long = "log", value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Connect to every provider with an endpoint and monitor it
    Probe {
        /// How long to monitor, in seconds
        #[arg(short = 'd', long, default_value_t = 60)]
        duration: u64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print effective settings as TOML
    Show {
        /// Only this provider
        #[arg(short = 'p', long)]
        provider: Option<String>,
    },

    /// Validate the defaults and every provider
    Validate,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

#[derive(Serialize)]
struct EffectiveConfig {
    defaults: ResilienceSettings,
    providers: BTreeMap<String, ResilienceSettings>,
}

#[derive(Serialize)]
struct ProbeReport {
    health: BTreeMap<String, ProviderHealth>,
    metrics: BTreeMap<String, ConnectionMetrics>,
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<TetherError>()
                .map(TetherError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => TetherConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TetherConfig::default(),
    };

    if let Some(level) = cli.log_level {
        config.logging.log_level = level.into();
    }
    if cli.log.is_some() {
        config.logging.log_file = cli.log.clone();
    }
    config.logging.verbose |= cli.verbose;
    logging::init_logging(&config.logging)?;

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show { provider } => show_config(&config, provider.as_deref()),
            ConfigAction::Validate => {
                config.validate()?;
                println!(
                    "Configuration valid ({} provider(s))",
                    config.providers.len()
                );
                Ok(())
            }
        },
        Commands::Probe { duration } => {
            config.validate()?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(probe(&config, Duration::from_secs(duration)))
        }
    }
}

fn show_config(config: &TetherConfig, provider: Option<&str>) -> anyhow::Result<()> {
    let rendered = match provider {
        Some(id) => toml::to_string_pretty(&config.resolve(id)?.settings)?,
        None => {
            let providers = config
                .resolve_all()?
                .into_iter()
                .map(|resolved| (resolved.id, resolved.settings))
                .collect();
            toml::to_string_pretty(&EffectiveConfig {
                defaults: config.defaults.clone(),
                providers,
            })?
        }
    };
    print!("{}", rendered);
    Ok(())
}

async fn probe(config: &TetherConfig, duration: Duration) -> anyhow::Result<()> {
    let registry: ProviderRegistry<HttpConnection> = ProviderRegistry::new(&config.defaults);

    let mut events = registry.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut registered = Vec::new();
    for resolved in config.resolve_all()? {
        let Some(endpoint) = resolved.endpoint.as_deref() else {
            info!(provider = %resolved.id, "No endpoint configured, skipping");
            continue;
        };
        let timeout = Duration::from_millis(resolved.settings.health.timeout_ms);
        let provider = Arc::new(HttpProvider::new(endpoint, timeout)?);
        registry
            .register(&resolved.id, provider, &resolved.settings)
            .await?;
        registered.push(resolved.id);
    }
    if registered.is_empty() {
        anyhow::bail!("no provider has an endpoint configured");
    }

    registry.start_maintenance(Duration::from_secs(60)).await;
    for id in &registered {
        if let Err(e) = registry.connect(id).await {
            warn!(provider = %id, error = %e, "Initial connect failed");
        }
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    let report = ProbeReport {
        health: registry.all_health().await,
        metrics: registry.all_metrics().await,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    registry.shutdown().await;
    event_log.abort();
    Ok(())
}

fn log_event(event: &ResilienceEvent) {
    match event {
        ResilienceEvent::MetricsUpdated { .. } => {}
        ResilienceEvent::Error { provider_id, message }
        | ResilienceEvent::HealthCheckFailed {
            provider_id,
            message,
        } => warn!(provider = %provider_id, event = event.name(), %message),
        _ => info!(
            provider = event.provider_id(),
            event = event.name(),
            payload = %serde_json::to_string(event).unwrap_or_default()
        ),
    }
}
