//! # rszr
//!
//! Process entry point for both pipeline roles.
//!
//! - `rszr fan-out`: consume `image-uploaded`, publish one `image-resize` per preset
//! - `rszr dispatcher`: serve resize units over WebSockets and dispatch `image-resize`
//! - `rszr validate-config`: load, validate and print the effective configuration
//!
//! Missing or invalid configuration exits with status 2 before anything starts.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use rszr::config::{ConfigLoader, ConfigurationError, ProcessRole, RszrConfig};
use rszr::execution::{
    server, DispatcherConfig, HttpImageFetcher, S3BlobStore, WorkerPoolDispatcher,
};
use rszr::logging::init_structured_logging;
use rszr::messaging::DeadLetterPolicy;
use rszr::{EventBus, FanOutOrchestrator, MessagingProvider, RszrError};

const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "rszr")]
#[command(about = "Queue-driven image resize pipeline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (default: config/rszr.toml, or RSZR_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand uploads into resize jobs
    FanOut,

    /// Dispatch resize jobs to connected units
    Dispatcher {
        /// Override `dispatcher.bind_address`
        #[arg(long)]
        bind: Option<String>,
    },

    /// Validate configuration and print it
    ValidateConfig {
        /// Validate for one role only
        #[arg(long, value_enum)]
        role: Option<RoleArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    FanOut,
    Dispatcher,
}

impl From<RoleArg> for ProcessRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::FanOut => ProcessRole::FanOut,
            RoleArg::Dispatcher => ProcessRole::Dispatcher,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let role = match &cli.command {
        Commands::FanOut => ProcessRole::FanOut,
        Commands::Dispatcher { .. } => ProcessRole::Dispatcher,
        Commands::ValidateConfig { role } => return validate_config(&cli, *role),
    };

    let mut config = match load_config(&cli, role) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    init_structured_logging(&config.logging, &config.environment);

    let result = match cli.command {
        Commands::FanOut => run_fan_out(config).await,
        Commands::Dispatcher { bind } => {
            if let Some(bind) = bind {
                config.dispatcher.bind_address = bind;
            }
            run_dispatcher(config).await
        }
        Commands::ValidateConfig { .. } => Ok(()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_fatal_at_startup() => {
            error!(error = %e, "Refusing to start");
            ExitCode::from(EXIT_CONFIG)
        }
        Err(e) => {
            error!(error = %e, "Process failed");
            ExitCode::FAILURE
        }
    }
}

fn loader(cli: &Cli) -> ConfigLoader {
    match &cli.config {
        Some(path) => ConfigLoader::new().with_file(path),
        None => ConfigLoader::new(),
    }
}

fn load_config(cli: &Cli, role: ProcessRole) -> Result<RszrConfig, ConfigurationError> {
    let config = loader(cli).load_unvalidated()?;
    config.validate_for_role(role)?;
    Ok(config)
}

fn validate_config(cli: &Cli, role: Option<RoleArg>) -> ExitCode {
    println!("🔧 Validating rszr configuration");

    let config = match loader(cli).load_unvalidated() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let roles: Vec<ProcessRole> = match role {
        Some(role) => vec![role.into()],
        None => vec![ProcessRole::FanOut, ProcessRole::Dispatcher],
    };

    let mut failed = false;
    for role in roles {
        match config.validate_for_role(role) {
            Ok(()) => println!("✅ {role:?}: valid"),
            Err(e) => {
                failed = true;
                println!("❌ {role:?}: {e}");
            }
        }
    }

    match serde_json::to_string_pretty(&config) {
        Ok(rendered) => println!("\n{rendered}"),
        Err(e) => eprintln!("Could not render configuration: {e}"),
    }

    if failed {
        ExitCode::from(EXIT_CONFIG)
    } else {
        ExitCode::SUCCESS
    }
}

async fn connect(config: &RszrConfig) -> rszr::Result<Arc<MessagingProvider>> {
    let provider = MessagingProvider::from_config(&config.messaging)?;
    match provider.health_check().await {
        Ok(true) => info!(provider = provider.provider_name(), "Broker reachable"),
        Ok(false) => warn!(provider = provider.provider_name(), "Broker not reachable yet, will retry on demand"),
        Err(e) => warn!(provider = provider.provider_name(), error = %e, "Broker health check failed"),
    }
    Ok(Arc::new(provider))
}

async fn run_fan_out(config: RszrConfig) -> rszr::Result<()> {
    let provider = connect(&config).await?;
    let requeue_delay = config.fan_out.requeue_delay();
    let bus = EventBus::new(Arc::clone(&provider), requeue_delay);

    let catalog = Arc::new(config.preset_catalog()?);
    info!(presets = catalog.len(), "Preset catalog loaded");

    let orchestrator = Arc::new(FanOutOrchestrator::new(
        Arc::clone(&provider),
        catalog,
        DeadLetterPolicy::new(provider, requeue_delay, config.retry.max_attempts),
    ));
    orchestrator.register(&bus, &config.channels.fan_out);

    bus.start().await?;
    info!(channel = %config.channels.fan_out, "🚀 Fan-out running");

    shutdown_signal().await;
    info!("Shutting down fan-out");
    bus.stop().await?;
    Ok(())
}

async fn run_dispatcher(config: RszrConfig) -> rszr::Result<()> {
    let provider = connect(&config).await?;
    let requeue_delay = config.dispatcher.requeue_delay();
    let bus = EventBus::new(Arc::clone(&provider), requeue_delay);

    let fetcher = Arc::new(HttpImageFetcher::new(config.dispatcher.fetch_timeout())?);
    let store = Arc::new(S3BlobStore::from_config(&config.storage).await?);
    let (dispatcher, actor) = WorkerPoolDispatcher::spawn(
        DispatcherConfig::from_config(&config)?,
        fetcher,
        store,
        DeadLetterPolicy::new(provider, requeue_delay, config.retry.max_attempts),
    );
    dispatcher.register(&bus, &config.channels.dispatcher);

    let listener = TcpListener::bind(&config.dispatcher.bind_address)
        .await
        .map_err(|e| RszrError::server(format!("binding {}: {e}", config.dispatcher.bind_address)))?;
    let (server_shutdown, _) = broadcast::channel(1);
    let server = tokio::spawn(server::serve(
        listener,
        dispatcher.clone(),
        server_shutdown.clone(),
    ));

    bus.start().await?;
    info!(channel = %config.channels.dispatcher, "🚀 Dispatcher running");

    shutdown_signal().await;
    info!("Shutting down dispatcher");

    // stop reading first; in-flight jobs are then requeued while the broker
    // connection is still open
    bus.stop_consuming().await;
    if let Err(e) = dispatcher.shutdown().await {
        warn!(error = %e, "Dispatcher shutdown incomplete");
    }
    let _ = server_shutdown.send(());
    match server.await {
        Ok(result) => result?,
        Err(e) => warn!(error = %e, "Unit server task failed"),
    }
    bus.stop().await?;
    if let Err(e) = actor.await {
        warn!(error = %e, "Dispatcher task failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Ctrl-C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
