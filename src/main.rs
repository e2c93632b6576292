use sql_webhook_gateway::audit::AuditSink;
use sql_webhook_gateway::config::GatewayConfig;
use sql_webhook_gateway::credentials::CredentialStore;
use sql_webhook_gateway::gateway::Gateway;
use sql_webhook_gateway::http_server;
use sql_webhook_gateway::instances::InstanceDirectory;
use sql_webhook_gateway::pool::PoolRegistry;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = GatewayConfig::from_env();
    tracing::info!(data_dir = %config.data_dir.display(), "starting sql webhook gateway");

    let credentials = Arc::new(CredentialStore::open(&config.data_dir)?);
    let instances = Arc::new(InstanceDirectory::open(&config.data_dir)?);
    let audit = Arc::new(AuditSink::open(&config.data_dir)?);

    let registry = Arc::new(PoolRegistry::new(config.pool.clone()));
    let sweeper = registry.spawn_sweeper(config.sweep_interval);

    let gateway = Arc::new(Gateway::new(
        config.clone(),
        credentials.clone(),
        instances,
        registry,
        audit,
    ));

    http_server::start(gateway, &config.bind_addr).await?;

    // Graceful shutdown: stop the sweep loop and flush the store.
    sweeper.abort();
    credentials.close();
    Ok(())
}
