use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use canopy_config::ConfigManager;
use canopy_gateway::{EchoPipeline, Gateway};
use canopy_observability::Observability;
use canopy_server::{apply_overrides, gateway_config, observability_config, serve_status, Overrides, StatusState};
use clap::Parser;
use tracing::{error, info};

#[derive(Parser, Debug, Clone)]
#[command(name = "canopy-server")]
#[command(about = "Canopy realtime session gateway")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(long, env = "CANOPY_CONFIG", default_value = "~/.canopy/config.json")]
    config: String,

    /// WebSocket listen address (overrides config)
    #[arg(long, env = "CANOPY_BIND")]
    bind: Option<String>,

    /// Status endpoint listen address (overrides config)
    #[arg(long, env = "CANOPY_STATUS_BIND")]
    status_bind: Option<String>,

    /// Log level (overrides config)
    #[arg(long, env = "CANOPY_LOG")]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, default_value = "false")]
    json_logs: bool,

    /// Per-session outbound queue size (overrides config)
    #[arg(long)]
    max_queue_size: Option<usize>,

    /// Delay between chunks of the demo echo pipeline, in milliseconds
    #[arg(long, default_value = "50")]
    echo_delay_ms: u64,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            bind: self.bind.clone(),
            status_bind: self.status_bind.clone(),
            log_level: self.log_level.clone(),
            json_logs: self.json_logs,
            max_queue_size: self.max_queue_size,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path =
        canopy_config::expand_tilde(&cli.config).unwrap_or_else(|| PathBuf::from(&cli.config));
    let manager = ConfigManager::load(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    let mut config = manager.get().await;
    apply_overrides(&mut config, &cli.overrides()).context("Invalid command-line override")?;

    let observability = Observability::init(&observability_config(&config))
        .context("Failed to initialize observability")?;

    info!(
        config = ?config_path,
        bind = %config.gateway.bind,
        max_connections = config.gateway.max_connections,
        max_queue_size = config.queue.max_queue_size,
        "Starting Canopy gateway"
    );

    let pipeline = Arc::new(EchoPipeline::new().with_delay(Duration::from_millis(cli.echo_delay_ms)));
    let gateway = Gateway::new(gateway_config(&config), pipeline);
    gateway.start_background();

    let mut listener = {
        let gateway = gateway.clone();
        let bind = config.gateway.bind.clone();
        tokio::spawn(async move { gateway.run(&bind).await })
    };

    let status_server = config.status.enabled.then(|| {
        let state = StatusState::new(gateway.clone(), observability.metrics())
            .with_log_manager(observability.log_manager());
        let bind = config.status.bind.clone();
        tokio::spawn(async move { serve_status(&bind, state).await })
    });

    let mut failure = None;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Ctrl-C received");
        }
        result = &mut listener => {
            match result {
                Ok(Ok(())) => info!("Gateway listener stopped"),
                Ok(Err(e)) => failure = Some(anyhow::Error::new(e).context("Gateway listener failed")),
                Err(e) => failure = Some(anyhow::Error::new(e).context("Gateway listener panicked")),
            }
        }
    }

    let closed = gateway.shutdown().await;
    info!(closed, "Sessions closed");

    if !listener.is_finished() {
        let _ = listener.await;
    }
    if let Some(status_server) = status_server {
        match status_server.await {
            Ok(Err(e)) => error!("Status server error: {}", e),
            Err(e) => error!("Status server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
