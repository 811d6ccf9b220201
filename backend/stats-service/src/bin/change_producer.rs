use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use prometheus::Registry;
use stats_service::services::{
    feed, stream_changes, KafkaRecordSink, ProducerSettings, ProducerSummary,
};
use stats_service::{handlers, shutdown, telemetry, Config, PipelineMetrics};
use tokio::sync::watch;
use tracing::info;

#[actix_web::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init("info,change_producer=debug,stats_service=debug");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        brokers = %config.kafka.brokers,
        topic = %config.kafka.topic,
        feed = %config.feed.url,
        "Starting change-producer"
    );

    let registry = Registry::new();
    let metrics = PipelineMetrics::new(&registry);

    let sink = KafkaRecordSink::new(&config.kafka.brokers, config.kafka.send_timeout())
        .context("Failed to create Kafka producer")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    shutdown::spawn_signal_listener(shutdown_tx);

    let metrics_port = config.http.metrics_port;
    info!("Serving metrics on 0.0.0.0:{}", metrics_port);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(registry.clone()))
            .route("/metrics", web::get().to(handlers::get_metrics))
            .route("/health", web::get().to(handlers::health))
    })
    .bind(("0.0.0.0", metrics_port))
    .context("Failed to bind metrics server")?
    .disable_signals()
    .run();
    let server_handle = server.handle();
    actix_web::rt::spawn(server);

    let result = relay(&config, &sink, &metrics, shutdown_rx).await;

    server_handle.stop(true).await;

    let summary = result.context("Change relay failed")?;
    info!(
        published = summary.published,
        rejected = summary.rejected,
        publish_failures = summary.publish_failures,
        "change-producer stopped"
    );
    Ok(())
}

async fn relay(
    config: &Config,
    sink: &KafkaRecordSink,
    metrics: &PipelineMetrics,
    mut shutdown_rx: watch::Receiver<bool>,
) -> stats_service::Result<ProducerSummary> {
    let settings = ProducerSettings {
        topic: config.kafka.topic.clone(),
        flush_timeout: config.kafka.send_timeout(),
    };

    let client = feed::http_client()?;
    match feed::connect_or_cancel(&client, &config.feed.url, &mut shutdown_rx).await? {
        Some(lines) => stream_changes(lines, sink, &settings, metrics, shutdown_rx).await,
        None => Ok(ProducerSummary::default()),
    }
}
