use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use handsign_api::AppStateInner;
use handsign_db::Database;
use handsign_engine::photos::{DiskPhotoStore, MagicNumberValidator};
use handsign_engine::sqlite::SqliteStore;
use handsign_engine::{Collaborators, VerificationEngine};
use handsign_gateway::Dispatcher;
use handsign_gateway::connection;
use handsign_telegram::{Poller, TelegramClient};

mod config;
mod maintenance;

use config::Config;

#[derive(Clone)]
struct ServerState {
    dispatcher: Dispatcher,
    jwt_secret: String,
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "handsign=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Database::open(&config.db_path)?;
    let now = chrono::Utc::now().to_rfc3339();
    for telegram_id in &config.admin_ids {
        let id = uuid::Uuid::new_v4().to_string();
        db.ensure_admin(&id, *telegram_id, &format!("Admin {}", telegram_id), &now)?;
    }
    if !config.admin_ids.is_empty() {
        info!("Ensured {} bootstrap admin(s)", config.admin_ids.len());
    }

    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new();
    let telegram = Arc::new(TelegramClient::new(&config.telegram_api, &config.bot_token)?);

    let engine = Arc::new(VerificationEngine::new(
        Collaborators {
            store: Arc::new(SqliteStore::new(Arc::new(db))),
            transport: telegram.clone(),
            publisher: Arc::new(dispatcher.clone()),
            photos: Arc::new(DiskPhotoStore::new(config.photo_dir.clone()).await?),
            validator: Arc::new(MagicNumberValidator::default()),
        },
        config.engine.clone(),
        cancel.clone(),
    ));
    // Bootstrap may have promoted users the directory already saw.
    engine.admins().invalidate();

    let poller = tokio::spawn(Poller::new(telegram, engine.clone(), cancel.clone()).run());
    let sweeper = tokio::spawn(maintenance::run(engine.clone(), cancel.clone()));

    let api_routes = handsign_api::routes(Arc::new(AppStateInner {
        engine,
        jwt_secret: config.jwt_secret.clone(),
    }));

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(ServerState {
            dispatcher,
            jwt_secret: config.jwt_secret.clone(),
        });

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(api_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Handsign server listening on {}", config.addr);
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    // Let in-flight retries observe cancellation before the runtime drops.
    cancel.cancel();
    if let Err(e) = poller.await {
        warn!("Poller task ended abnormally: {}", e);
    }
    if let Err(e) = sweeper.await {
        warn!("Maintenance task ended abnormally: {}", e);
    }
    info!("Handsign server stopped");

    Ok(())
}

/// A token in the query string authenticates at upgrade time; without one
/// the client must send an Identify frame.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    match query.token {
        Some(token) => {
            let Some(claims) = connection::verify_token(&token, &state.jwt_secret) else {
                return axum::http::StatusCode::UNAUTHORIZED.into_response();
            };
            ws.on_upgrade(move |socket| {
                connection::handle_connection_authenticated(socket, state.dispatcher, claims)
            })
        }
        None => ws.on_upgrade(move |socket| {
            connection::handle_connection(socket, state.dispatcher, state.jwt_secret)
        }),
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = cancel.cancelled() => {},
    }

    info!("Shutdown signal received");
    cancel.cancel();
}
