use actix_web::{web, HttpResponse};
use prometheus::Registry;

use crate::metrics;
use crate::stats::StatsStore;

/// `GET /stats`: current counters by domain and by user.
pub async fn get_stats(store: web::Data<StatsStore>) -> HttpResponse {
    let snapshot = store.snapshot().await;
    HttpResponse::Ok().json(snapshot)
}

pub async fn get_metrics(registry: web::Data<Registry>) -> HttpResponse {
    metrics::render(&registry)
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn ready() -> &'static str {
    "READY"
}

/// Routes of the stats reporting surface. Expects `StatsStore` and
/// `Registry` as app data.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/stats", web::get().to(get_stats))
        .route("/metrics", web::get().to(get_metrics))
        .route("/health", web::get().to(health))
        .route("/ready", web::get().to(ready));
}
