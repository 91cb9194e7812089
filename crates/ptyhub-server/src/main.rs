//! ptyhub-server: PTY session multiplexer.
//!
//! Serves the session contract as newline-delimited JSON on stdin/stdout.
//! Logs go to stderr.

use clap::Parser;
use ptyhub_server::config::{ConfigOverrides, ServerConfig};
use ptyhub_server::control;
use ptyhub_server::session::PtyManager;
use std::path::PathBuf;
use tokio::io::BufReader;
use tracing::{error, info};

/// ptyhub-server: PTY session multiplexer
#[derive(Parser, Debug)]
#[command(name = "ptyhub-server", version, about = "PTY session multiplexer")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.ptyhub/config.toml")]
    config: String,

    /// User that requests act on when they name none
    #[arg(long, env = "USER", default_value = "local")]
    user: String,

    /// Default shell for new sessions
    #[arg(long)]
    shell: Option<String>,

    /// Default working directory for new sessions
    #[arg(long)]
    cwd: Option<String>,

    /// Idle timeout in seconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Seconds between idle sweeps
    #[arg(long)]
    sweep_interval: Option<u64>,

    /// Maximum concurrent sessions per user
    #[arg(long)]
    max_sessions_per_user: Option<usize>,

    /// Maximum concurrent sessions overall
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), user = %cli.user, "starting ptyhub-server");

    let overrides = ConfigOverrides {
        idle_timeout_secs: cli.idle_timeout,
        sweep_interval_secs: cli.sweep_interval,
        max_sessions_per_user: cli.max_sessions_per_user,
        max_sessions: cli.max_sessions,
        shell: cli.shell.clone(),
        cwd: cli.cwd.clone(),
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let manager = PtyManager::new(server_config.manager_config());
    manager.start();

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    let mut failed = false;

    tokio::select! {
        result = control::serve(&manager, stdin, stdout, &cli.user) => {
            if let Err(e) = result {
                error!(error = %e, "control channel error");
                failed = true;
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    manager.shutdown().await;
    info!("ptyhub-server stopped");
    // Exit explicitly: a stdin read may still be parked on a blocking thread.
    std::process::exit(if failed { 1 } else { 0 });
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
