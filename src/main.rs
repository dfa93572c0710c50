use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use funds_transfer::config::AppConfig;
use funds_transfer::db::Database;
use funds_transfer::transfer::{
    DirectTransfer, DurableExecutor, EventPublisher, MemoryStore, PgStore, RecoveryWorker, RestProxyPublisher,
    StepLogExecutor, TransferSaga, TransferService, TransferStore,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn TransferStore>> {
    match &config.postgres_url {
        Some(url) => {
            let db = Database::connect(url, &config.postgres)
                .await
                .context("Failed to connect to PostgreSQL")?;
            db.health_check().await.context("PostgreSQL health check failed")?;
            let store: Arc<dyn TransferStore> = Arc::new(PgStore::new(db.pool().clone()));
            Ok(store)
        }
        None => {
            tracing::warn!("No postgres_url configured, using in-memory store");
            let store: Arc<dyn TransferStore> = Arc::new(MemoryStore::new());
            Ok(store)
        }
    }
}

fn build_publisher(config: &AppConfig) -> anyhow::Result<Option<Arc<dyn EventPublisher>>> {
    let publisher = &config.publisher;
    if !publisher.enabled {
        tracing::info!("Event publishing disabled");
        return Ok(None);
    }

    let rest = RestProxyPublisher::new(
        &publisher.rest_proxy_url,
        &publisher.topic,
        Duration::from_millis(publisher.timeout_ms),
    )?;
    tracing::info!(endpoint = rest.endpoint(), "Publishing completion events");
    let publisher: Arc<dyn EventPublisher> = Arc::new(rest);
    Ok(Some(publisher))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = funds_transfer::logging::init_logging(&app_config);

    tracing::info!("Starting funds transfer core in {} mode", env);

    let store = build_store(&app_config).await?;
    let publisher = build_publisher(&app_config)?;
    let transfer_config = &app_config.transfer;

    let executor = Arc::new(StepLogExecutor::new(
        store.clone(),
        transfer_config.retry.policy(),
    ));
    tracing::info!(
        executor = executor.name(),
        max_attempts = executor.policy().max_attempts,
        step_timeout_ms = executor.policy().step_timeout.as_millis() as u64,
        "Step executor ready"
    );
    let saga = Arc::new(TransferSaga::new(
        store.clone(),
        executor,
        publisher.clone(),
        transfer_config.compensation,
    ));
    let direct = DirectTransfer::new(store.clone(), publisher);
    let service = TransferService::new(transfer_config.mode, direct, saga.clone());

    tracing::info!(
        store = store.name(),
        mode = ?service.mode(),
        compensation = ?transfer_config.compensation,
        "Transfer service ready"
    );

    if transfer_config.recovery.enabled {
        let worker = RecoveryWorker::new(saga, transfer_config.recovery.worker_config());
        tokio::spawn(async move {
            worker.run().await;
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    Ok(())
}
