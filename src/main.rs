use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use battle_command_backend::api;
use battle_command_backend::audit::{self, AuditQueue};
use battle_command_backend::auth;
use battle_command_backend::config::{self, Config};
use battle_command_backend::db::Database;
use battle_command_backend::gateway::{GeminiClient, LlmClient};
use battle_command_backend::metrics;
use battle_command_backend::rate_limit::RateLimiter;
use battle_command_backend::rules;

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "battle-command-backend" }))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cfg = Config::load();
    config::set_local_mode(cfg.local_mode);
    metrics::register_metrics();

    let db = Database::new(&cfg.database_url)
        .await
        .expect("Failed to initialize database");
    let db = Arc::new(db);

    if cfg.local_mode {
        db.ensure_local_user()
            .await
            .expect("Failed to create local user");
        tracing::info!("Local mode: auth and rate limits disabled");
    }

    let rules_text = Arc::new(rules::load_rules(&cfg.rules_path));
    let gateway: Arc<dyn LlmClient> = Arc::new(GeminiClient::from_env());
    let rate_limiter = RateLimiter::new();
    let audit_queue = AuditQueue::new();

    // Spawn background worker to drain pending audit writes
    audit::spawn_audit_worker(db.clone(), audit_queue.clone());

    let app = Router::new()
        .route("/health", get(health_check))
        // Auth routes (no auth required)
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/me", get(auth::me))
        .with_state(db.clone())
        .merge(api::router(
            db,
            gateway,
            audit_queue,
            rate_limiter,
            rules_text,
        ))
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(api::track_metrics));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.port))
        .await
        .expect("Failed to bind port");

    tracing::info!("Battle Command backend listening on port {}", cfg.port);
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
