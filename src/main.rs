//! Rounds server
//!
//! Main entry point: configuration, store selection, and the HTTP/WS
//! surface over the queue and synchronization core.

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use tracing_actix_web::TracingLogger;

use rounds::alerts::CriticalAlertEngine;
use rounds::api::{self, AppState};
use rounds::config;
use rounds::consult::ConsultationService;
use rounds::store::{EntityStore, MemoryStore, ScopeFilter, SqliteStore};
use rounds::sync::{SyncConfig, SyncEngine};
use rounds::websocket;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::load_config()?;

    let store: Arc<dyn EntityStore> = match config.database.backend.as_str() {
        "memory" => Arc::new(MemoryStore::with_capacity(config.sync.feed_capacity)),
        "sqlite" => Arc::new(
            SqliteStore::connect_with(&config.database.url, config.sync.feed_capacity).await?,
        ),
        other => anyhow::bail!("Unsupported database backend: {other}"),
    };

    let consultations = ConsultationService::new(store.clone());
    let sync = SyncEngine::new(store.clone(), SyncConfig::from(&config.sync));
    let alerts = CriticalAlertEngine::attach(&sync, ScopeFilter::all()).await?;

    let state = web::Data::new(AppState {
        store,
        consultations,
        alerts,
        websocket: config.websocket.clone(),
    });

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        backend = %config.database.backend,
        "starting rounds server"
    );

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(TracingLogger::default())
            .wrap(Cors::permissive())
            .configure(api::configure)
            .route("/ws/changes", web::get().to(websocket::change_feed))
    })
    .bind((config.server.host.clone(), config.server.port))?
    .run()
    .await?;

    Ok(())
}
