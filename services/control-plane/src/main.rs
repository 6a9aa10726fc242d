//! myshoes
//!
//! Auto-scaling control plane for ephemeral GitHub Actions runners. Jobs
//! arrive in the datastore at webhook ingress; this binary runs the three
//! loops that turn them into runners and reclaim those runners afterwards.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use myshoes_control_plane::{Config, Recoverer, RunnerManager, Starter};
use myshoes_datastore::{memory::MemoryDatastore, postgres::PgDatastore, Datastore};
use myshoes_github::{GitHubClient, HttpGitHubClient};
use myshoes_provider::{MockProvider, ProviderRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting myshoes control plane");

    let ds: Arc<dyn Datastore> = match &config.database_url {
        Some(url) => {
            let pg = PgDatastore::connect(url)
                .await
                .context("failed to connect to database")?;
            pg.init_schema().await.context("failed to initialize schema")?;
            info!("Database connection established");
            Arc::new(pg)
        }
        None => {
            warn!("MYSHOES_DATABASE_URL is not set, using the in-memory datastore");
            Arc::new(MemoryDatastore::new())
        }
    };

    let github: Arc<dyn GitHubClient> = Arc::new(
        HttpGitHubClient::new(&config.github_url, config.github_token.as_deref())
            .context("failed to build CI-service client")?,
    );

    let mut registry = ProviderRegistry::new();
    if config.dev_mode {
        registry
            .register("mock://local", Arc::new(MockProvider::new()))
            .context("failed to register mock driver")?;
        info!("Dev mode: mock provider registered at mock://local");
    }
    let registry = Arc::new(registry);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let starter = Arc::new(Starter::new(
        Arc::clone(&ds),
        Arc::clone(&registry),
        Arc::clone(&github),
        config.clone(),
    ));
    let manager = Arc::new(RunnerManager::new(
        Arc::clone(&ds),
        Arc::clone(&registry),
        Arc::clone(&github),
        config.clone(),
    ));
    let recoverer = Arc::new(Recoverer::new(
        Arc::clone(&ds),
        Arc::clone(&registry),
        Arc::clone(&github),
        config.clone(),
    ));

    let mut loops: Vec<(&str, JoinHandle<()>)> = Vec::new();
    {
        let starter = Arc::clone(&starter);
        let rx = shutdown_rx.clone();
        loops.push(("starter", tokio::spawn(async move { starter.run(rx).await })));
    }
    {
        let manager = Arc::clone(&manager);
        let rx = shutdown_rx.clone();
        loops.push(("runner-manager", tokio::spawn(async move { manager.run(rx).await })));
    }
    {
        let recoverer = Arc::clone(&recoverer);
        let rx = shutdown_rx.clone();
        loops.push(("recoverer", tokio::spawn(async move { recoverer.run(rx).await })));
    }

    wait_for_signal().await;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    for (name, handle) in loops {
        match tokio::time::timeout(config.shutdown_grace, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(task = name, error = %e, "loop task failed"),
            Err(_) => warn!(task = name, "loop did not stop within the shutdown grace"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
