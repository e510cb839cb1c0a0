use std::sync::Arc;

use chat_service::auth::{DevVerifier, JwtVerifier, TokenVerifier};
use chat_service::store::{ConversationStore, MemoryStore, PostgresStore};
use chat_service::{config, connection, error, logging, routes, state::AppState};

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let store: Arc<dyn ConversationStore> = match cfg.database_url.as_deref() {
        Some(url) => {
            let store = PostgresStore::connect(url).await?;
            // Embedded migrations are idempotent; a schema mismatch is fatal.
            store.run_migrations().await?;
            tracing::info!("using postgres conversation store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory conversation store");
            Arc::new(MemoryStore::new())
        }
    };

    let verifier: Arc<dyn TokenVerifier> = if cfg.dev_allow_uuid_tokens {
        tracing::warn!("AUTH_DEV_ALLOW_UUID_TOKENS=true; accepting bare user-id tokens");
        Arc::new(DevVerifier)
    } else {
        let secret = cfg
            .jwt_secret
            .as_deref()
            .ok_or_else(|| error::AppError::Config("JWT_SECRET missing".into()))?;
        Arc::new(JwtVerifier::new(secret))
    };

    let state = AppState::new(cfg.clone(), store, verifier);

    // Liveness sweeps run independently of message traffic.
    let _sweeper = connection::spawn_liveness_sweeper(state.clone());

    let app = routes::build_router(state);
    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, "starting chat-service");

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| error::AppError::StartServer(e.to_string()))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| error::AppError::StartServer(e.to_string()))?;

    Ok(())
}
