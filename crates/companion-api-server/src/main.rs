use anyhow::Result;
use axum::{
    extract::Extension,
    http::HeaderValue,
    middleware,
    routing::{get, patch, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::info;

use companion_api_server::auth::{auth_middleware, JwtManager};
use companion_api_server::config::Settings;
use companion_api_server::database::{DbPool, Repository};
use companion_api_server::handlers;
use companion_api_server::services::{ConversationEngine, LlmService, MemoryService};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,companion_api_server=debug".to_string()),
        )
        .with_target(true)
        .json()
        .init();

    info!("🚀 Starting Companion API Server...");

    let settings = Settings::load()?;
    info!("✅ Configuration loaded");

    let db_pool = DbPool::new(&settings.database).await?;
    let repository = Arc::new(Repository::new(db_pool));
    repository.ensure_schema().await?;
    info!("✅ Database ready");

    let jwt = Arc::new(JwtManager::new(
        &settings.auth.jwt_secret,
        settings.auth.jwt_expire_days * 24 * 60 * 60,
    ));

    let memory_service = Arc::new(MemoryService::new(settings.memory.clone())?);
    let llm_service = Arc::new(LlmService::new(settings.llm.clone())?);

    let engine = Arc::new(ConversationEngine::new(
        repository.clone(),
        memory_service,
        llm_service,
        settings.llm.model.clone(),
    ));

    let app = build_router(repository, engine, jwt, &settings);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));
    info!("🎯 Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(
    repository: Arc<Repository>,
    engine: Arc<ConversationEngine>,
    jwt: Arc<JwtManager>,
    settings: &Settings,
) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check))
        .route("/api/v1/auth/register", post(handlers::auth::register))
        .route("/api/v1/auth/login", post(handlers::auth::login));

    let protected_routes = Router::new()
        .route("/api/v1/auth/me", get(handlers::auth::me))
        .route("/api/v1/chat", post(handlers::chat::chat_handler))
        .route(
            "/api/v1/chat/stream",
            post(handlers::chat::chat_stream_handler),
        )
        .route(
            "/api/v1/chat/sessions",
            post(handlers::sessions::create_session).get(handlers::sessions::list_sessions),
        )
        .route(
            "/api/v1/chat/sessions/{session_id}",
            patch(handlers::sessions::update_session)
                .delete(handlers::sessions::delete_session),
        )
        .route(
            "/api/v1/chat/sessions/{session_id}/messages",
            get(handlers::sessions::session_messages),
        )
        .layer(middleware::from_fn(auth_middleware));

    let origins: Vec<HeaderValue> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(Extension(repository))
        .layer(Extension(engine))
        .layer(Extension(jwt))
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default()))
}
