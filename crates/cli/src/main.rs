use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};

use delta_bridge_core::{AppConfig, ConfigLoader};
use delta_bridge_delta_store::DeltaStore;
use delta_bridge_dispatcher::{DispatcherConfig, SignalDispatcher};
use delta_bridge_engine::executor::EngineConfig;
use delta_bridge_engine::{AccountEngine, ContractSelector};
use delta_bridge_gateway::rate_limiter::RateBudget;
use delta_bridge_gateway::{BrokerGateway, EnvSession, MockGateway, RestGateway};
use delta_bridge_notifier::{NoopNotifier, Notifier, WecomNotifier};
use delta_bridge_poller::{PollerConfig, PollingManager};
use delta_bridge_web_api::{ApiServer, AppState};

#[derive(Parser)]
#[command(name = "delta-bridge")]
#[command(about = "Webhook-to-broker bridge for US equity options", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge: webhook ingress, execution, polling, operator API
    Run {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
    /// Validate the configuration file and exit
    CheckConfig {
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(&config).await,
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn load_config(path: &str) -> Result<AppConfig, ExitCode> {
    let config = match ConfigLoader::load(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path, error = %e, "failed to load configuration");
            return Err(ExitCode::from(1));
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!(path, error = %e, "configuration is invalid");
        return Err(ExitCode::from(2));
    }
    Ok(config)
}

fn check_config(path: &str) -> ExitCode {
    match load_config(path) {
        Ok(config) => {
            tracing::info!(
                accounts = config.accounts.len(),
                mock_mode = config.mock_mode,
                "configuration is valid"
            );
            ExitCode::SUCCESS
        }
        Err(code) => code,
    }
}

async fn run(config_path: &str) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(code) => return code,
    };

    match run_bridge(config).await {
        Ok(()) => {
            tracing::info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "unrecoverable startup error");
            ExitCode::from(1)
        }
    }
}

async fn run_bridge(config: AppConfig) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Persistent delta ledger plus its retention sweep. SQLite creates the
    // file but not its directory.
    if let Some(path) = config.database.url.strip_prefix("sqlite://") {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    let store = DeltaStore::connect(&config.database.url).await?;
    tokio::spawn(delta_bridge_delta_store::run_retention_task(
        store.clone(),
        config.delta.retention_days,
        shutdown_rx.clone(),
    ));

    // Gateway: the in-memory simulator in mock mode, the broker REST
    // contract otherwise. Everything downstream is oblivious to the choice.
    let gateway: Arc<dyn BrokerGateway> = if config.mock_mode {
        tracing::info!("mock mode: using the in-memory broker simulator");
        Arc::new(MockGateway::new())
    } else {
        let credentials_ref = config
            .enabled_accounts()
            .first()
            .map(|a| a.broker_credentials_ref.clone())
            .unwrap_or_default();
        let session = Arc::new(EnvSession::new(credentials_ref));
        Arc::new(RestGateway::new(
            config.gateway.base_url.clone(),
            session,
            RateBudget::from_config(
                config.gateway.read_rps,
                config.gateway.order_rps,
                config.gateway.cancel_rps,
            ),
            Duration::from_secs(config.gateway.call_timeout_seconds),
        ))
    };

    // Outbound notifications: engine/poller/dispatcher push into the sink,
    // the router fans out to per-account channels.
    let (events_tx, events_rx) = mpsc::channel(256);
    let channels: HashMap<String, String> = config
        .accounts
        .iter()
        .filter_map(|a| a.notifier_channel.clone().map(|url| (a.name.clone(), url)))
        .collect();
    let notifier: Arc<dyn Notifier> = if channels.is_empty() {
        Arc::new(NoopNotifier)
    } else {
        Arc::new(WecomNotifier::default())
    };
    tokio::spawn(delta_bridge_notifier::run_event_router(
        events_rx,
        channels,
        notifier,
        shutdown_rx.clone(),
    ));

    // One execution engine per enabled account.
    let engine_config = EngineConfig::from_app(&config);
    let engines: Vec<AccountEngine> = config
        .enabled_accounts()
        .iter()
        .map(|account| {
            AccountEngine::new(
                account.name.clone(),
                gateway.clone(),
                store.clone(),
                events_tx.clone(),
                engine_config.clone(),
                shutdown_rx.clone(),
            )
        })
        .collect();
    let engine_handles = engines.iter().map(AccountEngine::handle).collect();

    let selector = ContractSelector::new(
        gateway.clone(),
        config.contract_selection.clone(),
        config.spread.clone(),
    );

    let account_flags: Vec<(String, bool)> = config
        .accounts
        .iter()
        .map(|a| (a.name.clone(), a.enabled))
        .collect();
    let dispatcher = SignalDispatcher::new(
        DispatcherConfig::from_app(&config),
        selector,
        store.clone(),
        engines,
        account_flags,
        shutdown_rx.clone(),
    );

    let account_names: Vec<String> = config
        .enabled_accounts()
        .iter()
        .map(|a| a.name.clone())
        .collect();
    let poller = Arc::new(PollingManager::spawn(
        gateway.clone(),
        store.clone(),
        events_tx.clone(),
        account_names.clone(),
        engine_handles,
        PollerConfig::from_app(&config),
        shutdown_rx.clone(),
    ));

    let state = AppState::new(
        dispatcher,
        store,
        poller,
        gateway,
        account_names,
        config.mock_mode,
    );
    let server = ApiServer::new(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);

    // Ctrl-C flips the shutdown signal; every loop observes it at its next
    // suspension point.
    let shutdown_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_for_signal.send(true);
        }
    });

    server.serve(&addr, shutdown_rx).await?;

    // The server is down; give the loops and in-flight orders their grace
    // window to cancel and exit.
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_secs(config.shutdown_grace_seconds)).await;
    Ok(())
}
