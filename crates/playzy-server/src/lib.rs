//! playzy server: real-time direct messaging, conversation history, accounts
//! and LFG sessions over HTTP and WebSocket.

pub mod api;
pub mod api_conversations;
pub mod api_sessions;
pub mod api_users;
pub mod api_ws;
pub mod config;
pub mod connection;
pub mod middleware;
pub mod read_receipts;
pub mod registry;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Extension, Router,
};
use config::{Config, GatewayConfig};
use middleware::{ConnectCooldown, RateLimiter};
use playzy_db::DbPool;
use playzy_messages::{MessageStore, SqliteMessageStore};
use read_receipts::ReadReceipts;
use registry::{ConnectionRegistry, RegistrySettings};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Message persistence used by the gateway and conversation queries.
    pub store: Arc<dyn MessageStore>,
    /// Live connections, owned by the registry's control loop.
    pub registry: ConnectionRegistry,
    /// Background mark-read worker.
    pub read_receipts: ReadReceipts,
    /// HS256 signing secret for bearer tokens.
    pub jwt_secret: Arc<[u8]>,
    pub token_ttl_secs: u64,
    pub gateway: GatewayConfig,
    /// Per-IP limiter for the account endpoints.
    pub rate_limiter: RateLimiter,
    pub auth_requests_per_minute: u32,
    pub connect_cooldown: ConnectCooldown,
}

impl AppState {
    /// Builds state over the SQLite message store.
    ///
    /// Spawns the registry control loop and the read-receipt worker, so it
    /// must be called inside a Tokio runtime.
    pub fn new(pool: DbPool, config: &Config) -> Self {
        let store: Arc<dyn MessageStore> = Arc::new(SqliteMessageStore::new(pool.clone()));
        Self::with_store(pool, store, config)
    }

    /// Builds state over an arbitrary message store.
    pub fn with_store(pool: DbPool, store: Arc<dyn MessageStore>, config: &Config) -> Self {
        let registry = ConnectionRegistry::spawn(RegistrySettings::from(&config.registry));
        let read_receipts = ReadReceipts::spawn(store.clone(), config.read_receipts.queue_capacity);

        Self {
            pool,
            store,
            registry,
            read_receipts,
            jwt_secret: Arc::from(config.auth.jwt_secret.as_bytes()),
            token_ttl_secs: config.auth.token_ttl_secs,
            gateway: config.gateway.clone(),
            rate_limiter: RateLimiter::new(),
            auth_requests_per_minute: config.rate_limit.auth_requests_per_minute,
            connect_cooldown: ConnectCooldown::new(config.gateway.connect_cooldown()),
        }
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// Builds the application router with all routes.
///
/// Rate-limited routes read the client address, so serve with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn app(state: AppState, allowed_origins: &[String]) -> Router {
    let protected_routes = Router::new()
        .route(
            "/conversations",
            get(api_conversations::get_conversation_handler),
        )
        .route(
            "/sessions",
            post(api_sessions::create_session_handler).get(api_sessions::list_sessions_handler),
        )
        .layer(axum::middleware::from_fn(middleware::auth_middleware));

    let account_routes = Router::new()
        .route("/users", post(api_users::create_user_handler))
        .route("/auth", post(api_users::authenticate_handler))
        .layer(axum::middleware::from_fn(middleware::rate_limit_middleware));

    Router::new()
        .route("/health", get(api::health))
        .route("/ws", get(api_ws::ws_handler))
        .merge(protected_routes)
        .merge(account_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(allowed_origins))
        .layer(Extension(Arc::new(state)))
}
