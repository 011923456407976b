use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use howl_xmpp::cluster::{Kv, MemoryKv};
use howl_xmpp::hook::Hooks;
use howl_xmpp::module::Modules;
use howl_xmpp::repository::{MemoryUserRepository, User, UserRepository};
use howl_xmpp::{ServerDeps, XmppServer};
use rustls::RootCertStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod telemetry;

use config::{Environ, ServerConfig};

/// Howl XMPP server node.
#[derive(Debug, Parser)]
#[command(name = "howl", version, about)]
struct Cli {
    /// Configuration file; missing files fall back to defaults.
    #[arg(short, long, default_value = "howl.toml")]
    config: PathBuf,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init().map_err(|err| anyhow::anyhow!(err))?;
    let _ = rustls::crypto::ring::default_provider().install_default();

    let file_config = ServerConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if cli.print_config {
        println!("{}", toml::to_string_pretty(&file_config)?);
        return Ok(());
    }

    info!("Howl starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let users = Arc::new(MemoryUserRepository::new());
    let iterations = file_config.c2s.sasl.scram_iterations;
    for user in &file_config.users {
        users
            .upsert_user(&User::with_password(user.username.as_str(), &user.password, iterations))
            .await
            .with_context(|| format!("Failed to provision user {}", user.username))?;
    }

    let environ = Environ::from_env();
    let config = file_config.into_server_config(&environ)?;
    info!(
        instance_id = %config.cluster.instance_id,
        hostname = %config.cluster.hostname,
        hosts = config.hosts.len(),
        "Node configured"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let deps = ServerDeps {
        users,
        kv: Arc::new(MemoryKv::new()) as Arc<dyn Kv>,
        roots: RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        },
        modules: Modules::with_defaults("howl", env!("CARGO_PKG_VERSION")),
        hooks: Arc::new(Hooks::new()),
        queue_transfer: None,
    };

    let server = XmppServer::start(config, deps, shutdown).await?;
    server.run().await?;

    info!("Howl stopped");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["howl"]);
        assert_eq!(cli.config, PathBuf::from("howl.toml"));
        assert!(!cli.print_config);

        let cli = Cli::parse_from(["howl", "--config", "/etc/howl.toml", "--print-config"]);
        assert_eq!(cli.config, PathBuf::from("/etc/howl.toml"));
        assert!(cli.print_config);
    }

    #[test]
    fn test_default_config_renders_as_toml() {
        let rendered = toml::to_string_pretty(&ServerConfig::default()).unwrap();
        assert!(rendered.contains("[c2s]"));
        assert!(rendered.contains("port = 5222"));
    }
}
