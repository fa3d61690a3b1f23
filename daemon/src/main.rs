use anyhow::{Context, Result};
use crashsense_daemon::{
    config::Config,
    coordinator::Coordinator,
    db::Database,
    notifier::Notifier,
    publisher::VerdictPublisher,
    sampler::LinuxSampler,
    socket::{serve_client, ControlSocket},
    system::SystemSampler,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn load_config() -> Result<Config> {
    let config_path = Config::config_path();
    let config = if config_path.exists() {
        Config::load(&config_path)
            .with_context(|| format!("failed to load {}", config_path.display()))?
    } else {
        info!("No config file at {}, using defaults", config_path.display());
        Config::default()
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("CrashSense daemon starting...");

    let config = load_config()?;
    if config.watch.is_empty() {
        warn!("No watch criteria configured; nothing will be monitored");
    }

    let coordinator = Arc::new(
        Coordinator::new(&config, Arc::new(LinuxSampler::new()))?
            .with_system_sampler(Arc::new(SystemSampler::new())),
    );

    // Initialize database and continue the verdict sequence
    let db = Database::open_default()?;
    db.init_schema()?;
    coordinator.rehydrate(db.latest_sequence()?).await;

    let socket = ControlSocket::bind(&ControlSocket::default_path()).await?;
    let publisher = VerdictPublisher::new(
        db,
        Notifier::new(config.general.notifications),
        socket.pushes(),
        config.history.retention_days,
    )?;

    let (monitor_stop, monitor_stop_rx) = watch::channel(false);
    let (publisher_stop, publisher_stop_rx) = watch::channel(false);
    let monitor = tokio::spawn(Arc::clone(&coordinator).run(monitor_stop_rx));
    let publisher = tokio::spawn(publisher.run(Arc::clone(&coordinator), publisher_stop_rx));

    info!("Daemon ready, listening for connections...");

    loop {
        tokio::select! {
            accepted = socket.accept() => match accepted {
                Ok(stream) => {
                    let coordinator = Arc::clone(&coordinator);
                    let pushes = socket.pushes().subscribe();
                    tokio::spawn(serve_client(stream, pushes, coordinator));
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    // The monitor finishes its in-flight tick first; the publisher then
    // stores whatever that tick produced.
    let _ = monitor_stop.send(true);
    if let Err(e) = monitor.await {
        error!("Monitoring loop panicked: {}", e);
    }
    let _ = publisher_stop.send(true);
    if let Err(e) = publisher.await {
        error!("Publisher panicked: {}", e);
    }
    info!("CrashSense daemon stopped");
    Ok(())
}
