use std::path::PathBuf;

use async_trait::async_trait;
use clap::{Arg, ArgAction, Command};
use eyre::WrapErr;
use phantun_manager::{
    Config, LogHub, LogRecord, LogSession, LogSink, ManagerResult, Supervisor,
    config::DEFAULT_CONFIG_PATH,
};
use tokio::signal;
use tracing::{error, info, warn};

/// Prints child output to stdout; the manager's own lines already reach the
/// terminal through the fmt layer
struct ConsoleSink;

#[async_trait]
impl LogSink for ConsoleSink {
    async fn record(&mut self, record: &LogRecord) -> ManagerResult<()> {
        if !record.is_system() {
            for line in record.content.lines() {
                println!("[{}/{:?}] {}", record.process_id, record.stream, line);
            }
        }
        Ok(())
    }

    async fn heartbeat(&mut self) -> ManagerResult<()> {
        Ok(())
    }
}

fn level_for(verbosity: u8, configured: &str) -> String {
    match verbosity {
        0 => configured.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

async fn shutdown_signal() -> eyre::Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .wrap_err("Failed to install SIGTERM handler")?;

    tokio::select! {
        res = signal::ctrl_c() => {
            res.wrap_err("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate.recv() => info!("Received SIGTERM, shutting down..."),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let matches = Command::new("phantun-manager")
        .version(env!("CARGO_PKG_VERSION"))
        .author("akagi201")
        .about("Supervisor for phantun tunnels and their firewall rules")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Increase logging verbosity"),
        )
        .arg(
            Arg::new("no-follow")
                .long("no-follow")
                .action(ArgAction::SetTrue)
                .help("Do not print tunnel output to the console"),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let verbosity = matches.get_count("verbose");
    let follow = !matches.get_flag("no-follow");

    // Logging needs the level from the file, so load errors are reported after init
    let loaded = Config::load(&config_path);
    let configured_level = loaded
        .as_ref()
        .map(|config| config.general.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());

    let hub = LogHub::new();
    phantun_manager::init_logging(&hub, &level_for(verbosity, &configured_level))?;

    let config = match loaded {
        Ok(config) => {
            info!("Loaded configuration from {}", config_path.display());
            config
        }
        Err(e) => {
            warn!("Failed to load config, using defaults: {}", e);
            Config::default_at(&config_path)
        }
    };
    info!(
        "Global switch {}, {} clients, {} servers",
        if config.general.enabled { "on" } else { "off" },
        config.clients.len(),
        config.servers.len()
    );

    let supervisor = Supervisor::from_system(config.into_shared(), hub.clone());

    // Rules left behind by a previous run that did not shut down cleanly
    match supervisor.firewall().cleanup_all().await {
        Ok(removed) => info!("Startup firewall cleanup removed {} rules", removed),
        Err(e) => warn!("Startup firewall cleanup failed: {}", e),
    }

    let console = follow.then(|| {
        let session = LogSession::new(hub.subscribe());
        tokio::spawn(async move {
            let mut sink = ConsoleSink;
            session.run(&mut sink, std::future::pending()).await
        })
    });

    supervisor.start_all().await?;
    info!("Supervisor running. Press Ctrl+C to stop.");

    shutdown_signal().await?;

    supervisor.stop_all().await;
    hub.close();

    if let Some(handle) = console {
        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Console log session failed: {}", e),
            Err(e) => error!("Console log task join error: {}", e),
        }
    }

    info!("Shutdown complete");
    Ok(())
}
