use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser; // For argument parsing
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use launchpad_alias::controller::DEFAULT_PORT_NAME;
use launchpad_alias::{palette, ControllerConfig, DispatchController, ExecutorConfig, MidirTransport};

// x, y, color, alias
const DEMO_MAPPINGS: [(u8, u8, u8, &str); 4] = [
    (4, 4, palette::RED, "claude1"),
    (1, 5, palette::BLUE, "claude3"),
    (1, 1, palette::GREEN, "claude2"),
    (5, 1, palette::YELLOW, "claude4"),
];

// --- Command Line Arguments ---
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct CliArgs {
    /// Substring of the MIDI port name to connect to
    #[clap(long, default_value = DEFAULT_PORT_NAME)]
    port_name: String,
    /// Directory for session telemetry
    #[clap(long, default_value = "logs")]
    log_dir: PathBuf,
    /// Shell used to resolve aliases
    #[clap(long, default_value = "/bin/zsh")]
    shell: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Setting default subscriber failed")?;

    let args = CliArgs::parse();
    info!("Starting Launchpad alias mapper with args: {:?}", args);

    let config = ControllerConfig {
        port_name: args.port_name,
        log_dir: Some(args.log_dir),
        executor: ExecutorConfig {
            shell: args.shell,
            ..ExecutorConfig::default()
        },
        ..ControllerConfig::default()
    };

    let transport = MidirTransport::new(&config.client_name).context("Failed to set up MIDI")?;
    let controller = DispatchController::new(config, Box::new(transport))
        .context("Failed to create session log files")?;

    for (x, y, color, alias) in DEMO_MAPPINGS {
        controller.add_mapping(x, y, color, Some(alias))?;
    }

    controller
        .connect()
        .context("Failed to connect to Launchpad")?;

    let token = controller.cancellation_token();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received");
        token.cancel();
    });

    info!("Application started - press Ctrl+C to exit");
    controller.run().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c().await;
}

/// Resolves on Ctrl+C. Never resolves if the handler cannot be installed,
/// so a missing handler does not end the session.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
