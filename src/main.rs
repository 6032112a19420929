use enginegate::config::Config;
use enginegate::error::SupervisorError;
use enginegate::server::HostServer;
use enginegate::supervisor::EngineSupervisor;
use enginegate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("enginegate=debug".parse()?)
                .add_directive("engine=info".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let mut config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    // The engine calls back into this server unless told otherwise
    if config.apply_origin_fallback() {
        warn!(
            port = config.server.port,
            "No origin_url or backend_port configured; engine callbacks reach this \
             server's built-in handler, which answers 404"
        );
    }

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = EngineSupervisor::new(config.sidecar.clone(), config.engine.clone())?;

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = HostServer::new(bind_addr, supervisor.router(), shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Host server error");
        }
    });

    // Start the engine in the background so the host serves traffic meanwhile
    let starter = supervisor.clone();
    tokio::spawn(async move {
        match starter.start().await {
            Ok(port) => info!(port, "Engine started"),
            Err(e) => error!(error = %e, "Engine failed to start"),
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping engine...");
    match supervisor.stop().await {
        Ok(()) | Err(SupervisorError::NotRunning) => {}
        Err(e) => warn!(error = %e, "Failed to stop engine"),
    }

    // Wait for the server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting engine sidecar");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        endpoint = %config.sidecar.endpoint,
        backend_port = ?config.sidecar.backend_port,
        origin_url = ?config.sidecar.origin_url,
        dump_traffic = config.sidecar.dump_traffic,
        "Routing settings"
    );
    info!(
        startup_timeout_ms = config.sidecar.startup_timeout_ms,
        engine_restart = config.sidecar.engine_restart,
        shutdown_grace_period_secs = config.sidecar.shutdown_grace_period_secs,
        config_reissue_delay_ms = config.sidecar.config_reissue_delay_ms,
        "Supervisor settings"
    );
}
