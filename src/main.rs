use edgegate::admin::{PKG_NAME, VERSION};
use edgegate::config::Config;
use edgegate::server::{run_until, Gateway};
use edgegate::store::{ConfigStore, ReloadOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("edgegate=debug".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let (config, routing) = Config::load_compiled(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let store = Arc::new(ConfigStore::with_source(routing, &config_path));
    let gateway = Gateway::new(config, Arc::clone(&store))?;

    run_until(gateway, wait_for_shutdown(store)).await?;

    info!("Shutdown complete");
    Ok(())
}

/// Reload on SIGHUP, return on SIGINT or SIGTERM
#[cfg(unix)]
async fn wait_for_shutdown(store: Arc<ConfigStore>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sighup) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(term), Ok(hup)) => (term, hup),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Failed to install signal handlers, waiting for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading configuration...");
                match store.reload().await {
                    Ok(ReloadOutcome::Reloaded { hosts, users }) => {
                        info!(hosts, users, "Configuration reloaded successfully");
                    }
                    Ok(ReloadOutcome::Skipped) => {
                        info!("Reload already in progress, skipped");
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to reload configuration, keeping previous");
                    }
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_store: Arc<ConfigStore>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C, shutting down...");
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting edge gateway");
    if config.dev {
        info!(
            bind = %config.server.bind,
            dev_port = config.server.dev_port,
            admin_port = config.server.admin_port,
            "Server configuration (development)"
        );
    } else {
        info!(
            bind = %config.server.bind,
            http_port = config.server.http_port,
            https_port = config.server.https_port,
            admin_port = config.server.admin_port,
            "Server configuration"
        );
        info!(
            email = ?config.acme.email,
            directory = ?config.acme.directory_url,
            cache_dir = %config.acme.cache_dir,
            renew_before_days = config.acme.renew_before_days,
            "Certificate settings"
        );
    }
    info!(
        static_dir = %config.site.static_dir.display(),
        shared_dir = %config.site.shared_dir.display(),
        secured_dir = %config.site.secured_dir.display(),
        "Site directories"
    );
    info!(
        subdomains = config.subdomains.len(),
        proxied = config.subdomains.iter().filter(|s| s.proxy.is_some()).count(),
        users = config.users.len(),
        "Routing configuration"
    );
}
