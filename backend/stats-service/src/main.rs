use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use prometheus::Registry;
use stats_service::services::{
    run_worker_pool, BatcherConfig, KafkaRecordSource, RecordSource, WorkerSettings,
};
use stats_service::{handlers, shutdown, telemetry, Config, PipelineMetrics, StatsStore};
use tokio::sync::watch;
use tracing::{error, info};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init("info,actix_web=info,stats_service=debug");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        brokers = %config.kafka.brokers,
        topic = %config.kafka.topic,
        group_id = %config.kafka.group_id,
        workers = config.consumer.workers,
        storage = ?config.storage.backend,
        "Starting stats-service"
    );

    let registry = Registry::new();
    let metrics = PipelineMetrics::new(&registry);

    let store = StatsStore::from_config(&config.storage, &metrics)
        .await
        .context("Failed to initialize stats store")?;

    let mut sources: Vec<Arc<dyn RecordSource>> = Vec::with_capacity(config.consumer.workers);
    for worker_id in 1..=config.consumer.workers {
        let source = KafkaRecordSource::new(&config.kafka, worker_id)
            .with_context(|| format!("Failed to create Kafka consumer for worker {}", worker_id))?;
        sources.push(Arc::new(source));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    shutdown::spawn_signal_listener(shutdown_tx);

    let settings = WorkerSettings {
        max_poll_records: config.consumer.max_poll_records,
        batcher: BatcherConfig {
            batch_size: config.consumer.batch_size,
            flush_interval: config.consumer.flush_interval(),
        },
    };
    let pool = tokio::spawn(run_worker_pool(
        sources,
        store.clone(),
        settings,
        metrics.clone(),
        shutdown_rx,
    ));

    let http_port = config.http.port;
    info!("Starting HTTP server on 0.0.0.0:{}", http_port);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(store.clone()))
            .app_data(web::Data::new(registry.clone()))
            .configure(handlers::configure)
    })
    .bind(("0.0.0.0", http_port))
    .context("Failed to bind HTTP server")?
    .disable_signals()
    .run();
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // Workers exit once shutdown is signalled and their batchers have drained
    match pool.await {
        Ok(reports) => {
            let uncommitted: usize = reports.iter().map(|r| r.uncommitted).sum();
            info!(workers = reports.len(), uncommitted, "Consumer pool stopped");
        }
        Err(e) => error!("Consumer pool task failed: {}", e),
    }

    server_handle.stop(true).await;
    server_task
        .await
        .context("HTTP server task failed")?
        .context("HTTP server error")?;

    info!("stats-service stopped");
    Ok(())
}
