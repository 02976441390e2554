use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::api::ApiError;
use crate::AppState;

/// The authenticated caller, inserted into request extensions by
/// [`auth_middleware`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityContext {
    pub user_id: String,
}

/// Extracts the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Middleware that requires a valid signed bearer token.
///
/// Signature, algorithm and expiry are checked by
/// [`playzy_accounts::verify_token`]; on success the token's `userID` claim
/// becomes the request's [`IdentityContext`].
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or_else(|| ApiError::InternalServerError("app state missing".to_string()))?
        .clone();

    let token = bearer_token(req.headers())
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?
        .to_string();

    let claims = playzy_accounts::verify_token(&state.jwt_secret, &token).map_err(|e| {
        tracing::debug!("rejected bearer token: {}", e);
        ApiError::Unauthorized("invalid or expired token".to_string())
    })?;

    req.extensions_mut().insert(IdentityContext {
        user_id: claims.user_id,
    });

    Ok(next.run(req).await)
}

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
const TRACKED_KEYS_BEFORE_EVICTION: usize = 10_000;

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            // Recover the guard; entries may be stale.
            tracing::error!("{} lock poisoned, recovering with stale state", what);
            poisoned.into_inner()
        }
    }
}

/// Fixed-window request counter keyed by client IP.
#[derive(Clone, Debug, Default)]
pub struct RateLimiter {
    state: Arc<Mutex<HashMap<IpAddr, (u32, Instant)>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a request from `ip`; `false` once `limit` is exceeded within
    /// the current one-minute window.
    pub fn check(&self, ip: IpAddr, limit: u32) -> bool {
        let mut state = lock_or_recover(&self.state, "rate limiter");
        let now = Instant::now();

        // Evict only expired windows so active limits survive cleanup.
        if state.len() > TRACKED_KEYS_BEFORE_EVICTION {
            state.retain(|_, (_, start)| now.duration_since(*start) <= RATE_LIMIT_WINDOW);
        }

        let (count, start) = state.entry(ip).or_insert((0, now));

        if now.duration_since(*start) > RATE_LIMIT_WINDOW {
            *count = 1;
            *start = now;
            true
        } else {
            *count += 1;
            *count <= limit
        }
    }
}

/// Per-IP rate limiting for the account endpoints.
pub async fn rate_limit_middleware(req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or_else(|| ApiError::InternalServerError("app state missing".to_string()))?
        .clone();

    // Serving without connect info is a wiring mistake; fail closed.
    let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() else {
        return Err(ApiError::InternalServerError(
            "client address unavailable".to_string(),
        ));
    };

    if !state
        .rate_limiter
        .check(addr.ip(), state.auth_requests_per_minute)
    {
        tracing::warn!(ip = %addr.ip(), path = req.uri().path(), "rate limit exceeded");
        return Err(ApiError::TooManyRequests {
            retry_after_secs: RATE_LIMIT_WINDOW.as_secs(),
        });
    }

    Ok(next.run(req).await)
}

/// Minimum spacing between accepted gateway connections per identity.
///
/// Rejected attempts do not push the window forward. An attempt that passes
/// the cooldown but is refused later (registry full, failed upgrade) hands
/// its [`CooldownStamp`] back through [`ConnectCooldown::release`].
#[derive(Clone, Debug)]
pub struct ConnectCooldown {
    cooldown: Duration,
    last_accepted: Arc<Mutex<HashMap<String, Instant>>>,
}

/// Proof of a recorded connect attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CooldownStamp(Instant);

impl ConnectCooldown {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_accepted: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Records the attempt, or returns how long the caller must still wait.
    pub fn try_acquire(&self, user_id: &str) -> Result<CooldownStamp, Duration> {
        let now = Instant::now();
        if self.cooldown.is_zero() {
            return Ok(CooldownStamp(now));
        }

        let mut last_accepted = lock_or_recover(&self.last_accepted, "connect cooldown");

        if last_accepted.len() > TRACKED_KEYS_BEFORE_EVICTION {
            let cooldown = self.cooldown;
            last_accepted.retain(|_, at| now.duration_since(*at) < cooldown);
        }

        if let Some(at) = last_accepted.get(user_id) {
            let elapsed = now.duration_since(*at);
            if elapsed < self.cooldown {
                return Err(self.cooldown - elapsed);
            }
        }

        last_accepted.insert(user_id.to_string(), now);
        Ok(CooldownStamp(now))
    }

    /// Forgets an attempt that was not admitted after all. A newer attempt
    /// recorded since `stamp` is left alone.
    pub fn release(&self, user_id: &str, stamp: CooldownStamp) {
        let mut last_accepted = lock_or_recover(&self.last_accepted, "connect cooldown");
        if last_accepted.get(user_id) == Some(&stamp.0) {
            last_accepted.remove(user_id);
        }
    }
}
