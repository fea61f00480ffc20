mod admin;
mod wiring;

use std::{
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};

use clap::Parser;
use config::{
    decoding::TomlDecoder,
    schema::AgentConfig,
    ConfigLoader,
};
use core_types::Sink;
use dispatcher::DispatcherHandle;
use errors::{
    ErrorCode,
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use futures::future::BoxFuture;
use runtime::prod::ProdRuntime;
use sources::{
    ContainerMonitor,
    FileMonitor,
    PositionStore,
};
use tokio::signal::unix::{
    signal,
    SignalKind,
};
use tracing_subscriber::{
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer,
};

#[derive(Parser, Debug)]
struct Cli {
    /// Path to the agent's TOML config file.
    #[arg(long, env = "AGENTD_CONFIG", default_value = "/etc/agent/config.toml")]
    config: PathBuf,
}

/// Which of the two shutdown signals actually fired, so `main` can report
/// `130` for an interactive interrupt versus `0` for an orchestrator-sent
/// termination.
enum ShutdownReason {
    Terminated,
    Interrupted,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let bootstrap_config = match load_config_for_bootstrap(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return exit_code_for_error(&e);
        },
    };
    init_logging(&bootstrap_config.logging);

    let tokio_rt = match ProdRuntime::init_tokio(None) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start the async runtime: {e:#}");
            return ExitCode::from(2);
        },
    };
    let runtime = ProdRuntime::new(&tokio_rt);
    match runtime.block_on(run(runtime.clone(), cli.config)) {
        Ok(ShutdownReason::Terminated) => ExitCode::SUCCESS,
        Ok(ShutdownReason::Interrupted) => ExitCode::from(130),
        Err(e) => {
            tracing::error!(error = %e, "agent exited with an error");
            exit_code_for_error(&e)
        },
    }
}

/// `BadConfig` maps to exit code `1` (configuration error); anything else
/// reaching this far is an unrecoverable startup failure, exit code `2`.
fn exit_code_for_error(err: &anyhow::Error) -> ExitCode {
    match err.error_metadata().map(|m| m.code) {
        Some(ErrorCode::BadConfig) => ExitCode::from(1),
        _ => ExitCode::from(2),
    }
}

fn load_config_for_bootstrap(path: &PathBuf) -> anyhow::Result<AgentConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ErrorMetadata::bad_config("ConfigUnreadable", format!("couldn't read config file {}: {e}", path.display())))?;
    let config: AgentConfig = toml::from_str(&contents)
        .map_err(|e| ErrorMetadata::bad_config("ConfigMalformed", format!("couldn't parse config file {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

fn init_logging(logging: &config::schema::LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let format_layer = match logging.format {
        config::schema::LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        config::schema::LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
    };
    let _ = tracing_subscriber::registry().with(filter).with(format_layer).try_init();
}

async fn run(runtime: ProdRuntime, config_path: PathBuf) -> anyhow::Result<ShutdownReason> {
    let loader = ConfigLoader::new(
        runtime.clone(),
        SignalKind::hangup(),
        config_path,
        TomlDecoder::<AgentConfig>::new(),
    )
    .await?;
    let config = loader.get_config();

    // Dispatcher/sink/monitor topology is built once at startup; a reload
    // only takes effect for fields re-read live (e.g. dynamic circuit
    // thresholds aren't re-read at all yet). Log so an operator notices a
    // reload didn't do what they expected instead of silently no-opping.
    let mut config_changes = loader.subscribe();
    tokio::spawn(async move {
        use futures::StreamExt;
        while config_changes.next().await.is_some() {
            tracing::warn!("config file reloaded; topology changes require a process restart to take effect");
        }
    });

    let wiring::WiredSinks { sinks, dlq_stores } = wiring::build_sinks(&runtime, &config)?;
    let dispatcher = DispatcherHandle::start(runtime.clone(), config.dispatcher.clone(), sinks.clone());

    let position_store = if config.file_monitor.enabled {
        Some(PositionStore::start(runtime.clone(), config.position_store.path.clone(), config.position_store.flush_interval())?)
    } else {
        None
    };
    let file_monitor = if config.file_monitor.enabled {
        let store = position_store.clone().expect("position store started above");
        Some(FileMonitor::start(runtime.clone(), config.file_monitor.clone(), dispatcher.clone(), store))
    } else {
        None
    };

    let container_monitor = if config.container_monitor.enabled {
        let docker = Arc::new(bollard::Docker::connect_with_local_defaults()?);
        Some(ContainerMonitor::start(runtime.clone(), config.container_monitor.clone(), dispatcher.clone(), docker))
    } else {
        None
    };

    let reprocess_handles = spawn_reprocessors(&config, &dlq_stores, &sinks);

    let admin_handle = if config.admin.enabled {
        let admin_dispatcher = dispatcher.clone();
        let admin_file_monitor = file_monitor.clone();
        let admin_container_monitor = container_monitor.clone();
        let admin_dlq_stores = dlq_stores.clone();
        let backpressure = config.dispatcher.backpressure;
        let bind_addr = config.admin.bind_addr;
        Some(tokio::spawn(async move {
            if let Err(e) = admin::serve(bind_addr, admin_dispatcher, admin_file_monitor, admin_container_monitor, admin_dlq_stores, backpressure).await {
                tracing::error!(error = %e, "admin server exited");
            }
        }))
    } else {
        None
    };

    let reason = wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");

    for handle in reprocess_handles {
        handle.abort();
    }
    if let Some(admin_handle) = admin_handle {
        admin_handle.abort();
    }
    if let Some(monitor) = container_monitor {
        monitor.stop().await;
    }
    if let Some(monitor) = file_monitor {
        monitor.stop().await;
    }
    dispatcher.shutdown().await;
    if let Some(store) = position_store {
        store.shutdown().await;
    }

    tracing::info!("shutdown complete");
    Ok(reason)
}

/// Periodically sweeps each sink's dead-letter queue, redelivering straight
/// to that sink (not back through the dispatcher, which would re-fan the
/// record out to every sink instead of just the one it originally failed
/// for). Gated on the sink's own circuit so a reprocessing sweep never
/// fights an already-overloaded sink.
fn spawn_reprocessors(
    config: &AgentConfig,
    dlq_stores: &[(String, Arc<dlq::FileDlqStore>)],
    sinks: &Arc<parking_lot::RwLock<std::collections::BTreeMap<String, Arc<dyn Sink>>>>,
) -> Vec<tokio::task::JoinHandle<()>> {
    if !config.dlq.reprocess.enabled {
        return Vec::new();
    }
    let interval = std::time::Duration::from_secs(config.dlq.reprocess.interval_secs);
    let rate_limit = config.dlq.reprocess.rate_limit;

    dlq_stores
        .iter()
        .filter_map(|(name, store)| {
            let sink = sinks.read().get(name).cloned()?;
            let store = store.clone();
            let name = name.clone();
            Some(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let sink = sink.clone();
                    let should_run = || sink.healthy();
                    let redeliver_sink = sink.clone();
                    let callback = move |entry: core_types::DlqEntry| -> BoxFuture<'static, anyhow::Result<()>> {
                        let sink = redeliver_sink.clone();
                        Box::pin(async move { sink.send(vec![Arc::new(entry.record)]).await.map_err(anyhow::Error::from) })
                    };
                    match store.reprocess(rate_limit, should_run, callback).await {
                        Ok(n) if n > 0 => tracing::info!(sink = %name, redelivered = n, "dead-letter reprocessing redelivered entries"),
                        Ok(_) => {},
                        Err(e) => tracing::warn!(sink = %name, error = %e, "dead-letter reprocessing sweep failed"),
                    }
                }
            }))
        })
        .collect()
}

async fn wait_for_shutdown_signal() -> ShutdownReason {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => ShutdownReason::Interrupted,
        _ = sigterm.recv() => ShutdownReason::Terminated,
    }
}
