#![allow(dead_code)]

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use playzy_messages::{Message, MessageStore};
use playzy_server::config::Config;
use playzy_server::{app, AppState};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

pub const TEST_SECRET: &str = "integration-test-secret-0123456789abcdef";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Config with a signing secret and no connect cooldown.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.auth.jwt_secret = TEST_SECRET.to_string();
    config.gateway.connect_cooldown_ms = 0;
    config
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    _db_dir: TempDir,
}

pub async fn spawn_server(config: Config) -> TestServer {
    spawn_server_inner(config, None).await
}

pub async fn spawn_server_with_store(config: Config, store: Arc<dyn MessageStore>) -> TestServer {
    spawn_server_inner(config, Some(store)).await
}

async fn spawn_server_inner(config: Config, store: Option<Arc<dyn MessageStore>>) -> TestServer {
    config.validate().expect("test config should be valid");

    let db_dir = tempfile::tempdir().expect("failed to create temp dir");
    let db_path = db_dir.path().join("playzy.db");
    let pool = playzy_db::open_pool(
        db_path.to_str().expect("utf-8 temp path"),
        playzy_db::DbRuntimeSettings::default(),
    )
    .expect("failed to open database");

    let state = match store {
        Some(store) => AppState::with_store(pool, store, &config),
        None => AppState::new(pool, &config),
    };

    let router = app(state.clone(), &config.server.allowed_origins);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("failed to read local addr");

    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("server error");
    });

    TestServer {
        addr,
        state,
        _db_dir: db_dir,
    }
}

impl TestServer {
    pub fn router(&self) -> Router {
        app(self.state.clone(), &[])
    }

    pub async fn connect(&self, user_id: &str) -> WsClient {
        let url = format!("ws://{}/ws?userID={}", self.addr, user_id);
        let (ws, _) = connect_async(url).await.expect("websocket connect failed");
        ws
    }

    /// Waits until the registry reports `user_id` as online.
    pub async fn wait_online(&self, user_id: &str) {
        let registry = self.state.registry.clone();
        let user = user_id.to_string();
        wait_for(|| {
            let registry = registry.clone();
            let user = user.clone();
            async move { registry.lookup(&user).await.is_some() }
        })
        .await;
    }

    /// Waits until the store holds `count` messages between `a` and `b`.
    pub async fn wait_for_history(&self, a: &str, b: &str, count: usize) -> Vec<Message> {
        let (a, b) = (a.to_string(), b.to_string());
        let mut found = Vec::new();
        for _ in 0..200 {
            let store = self.state.store.clone();
            let (qa, qb) = (a.clone(), b.clone());
            found = tokio::task::spawn_blocking(move || store.list_between(&qa, &qb, 500, 0))
                .await
                .expect("join")
                .expect("list");
            if found.len() >= count {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} messages between {a} and {b}, found {}", found.len());
    }

    /// Sends a request through the router as if it came from 127.0.0.1.
    pub async fn request(&self, mut req: Request<Body>) -> Response<Body> {
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40_000))));
        self.router().oneshot(req).await.expect("request failed")
    }

    pub fn token_for(&self, user_id: &str) -> String {
        playzy_accounts::issue_token(TEST_SECRET.as_bytes(), user_id, 3_600)
            .expect("token should issue")
    }

    pub async fn get_json(&self, uri: &str, token: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request");
        read_json(self.request(req).await).await
    }

    pub async fn post_json(
        &self,
        uri: &str,
        token: Option<&str>,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let req = builder
            .body(Body::from(body.to_string()))
            .expect("request");
        read_json(self.request(req).await).await
    }
}

pub async fn read_json(response: Response<Body>) -> (StatusCode, serde_json::Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

pub async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

/// Reads frames until a text frame arrives and parses it as JSON.
pub async fn next_json(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match frame {
            WsMessage::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("text frame should be json")
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// True if the socket reports a close (frame or end of stream) within `within`.
pub async fn closes_within(ws: &mut WsClient, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return false,
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(WsMessage::Close(_)))) => return true,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

/// Asserts no text frame arrives within `within`.
pub async fn assert_silent(ws: &mut WsClient, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                panic!("unexpected text frame: {}", text.as_str())
            }
            Ok(Some(Ok(_))) => continue,
            Ok(other) => panic!("connection ended unexpectedly: {other:?}"),
        }
    }
}

pub fn text(value: serde_json::Value) -> WsMessage {
    WsMessage::Text(value.to_string().into())
}
