//! Per-client request limits on the task endpoints.
//!
//! Clients are keyed by peer address. Requests that arrive without
//! connection info (in-process routers) fall back to `X-Forwarded-For`,
//! then to one shared bucket.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::error::ApiError;
use super::routes::AppState;

const WINDOW: Duration = Duration::from_secs(60);
const UNKNOWN_CLIENT: &str = "unknown";
/// Above this many tracked clients, idle ones are dropped on the next hit.
const PRUNE_ABOVE: usize = 1024;

/// Sliding-window counter per client key.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// `limit` requests per `window`; 0 turns the limiter off.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, WINDOW)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Record a hit for `key`. On refusal returns how long until a slot frees.
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<(), Duration> {
        if self.limit == 0 {
            return Ok(());
        }
        let mut hits = match self.hits.lock() {
            Ok(hits) => hits,
            Err(poisoned) => poisoned.into_inner(),
        };
        if hits.len() > PRUNE_ABOVE {
            let window = self.window;
            hits.retain(|_, stamps| {
                stamps
                    .back()
                    .is_some_and(|last| now.duration_since(*last) < window)
            });
        }

        let stamps = hits.entry(key.to_string()).or_default();
        while stamps
            .front()
            .is_some_and(|first| now.duration_since(*first) >= self.window)
        {
            stamps.pop_front();
        }
        if stamps.len() >= self.limit as usize {
            let wait = stamps
                .front()
                .map(|first| self.window.saturating_sub(now.duration_since(*first)))
                .unwrap_or(self.window);
            return Err(wait);
        }
        stamps.push_back(now);
        Ok(())
    }
}

/// Limits for submission and listing.
pub struct RateLimits {
    pub submit: RateLimiter,
    pub list: RateLimiter,
}

impl RateLimits {
    pub fn per_minute(submit: u32, list: u32) -> Self {
        Self {
            submit: RateLimiter::per_minute(submit),
            list: RateLimiter::per_minute(list),
        }
    }
}

/// Middleware guarding `POST` and `GET` on `/api/research`.
pub async fn limit_requests(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path() != "/api/research" {
        return next.run(request).await;
    }
    let limiter = match *request.method() {
        Method::POST => &state.limits.submit,
        Method::GET => &state.limits.list,
        _ => return next.run(request).await,
    };

    let client = client_key(
        request.extensions().get::<ConnectInfo<SocketAddr>>(),
        request.headers(),
    );
    match limiter.check(&client) {
        Ok(()) => next.run(request).await,
        Err(wait) => {
            tracing::warn!(
                client = %client,
                method = %request.method(),
                limit = limiter.limit(),
                "Rate limit exceeded"
            );
            let mut response = ApiError::RateLimited(format!(
                "Rate limit exceeded: {} per 1 minute",
                limiter.limit()
            ))
            .into_response();
            let secs = wait.as_secs().max(1);
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
            response
        }
    }
}

fn client_key(peer: Option<&ConnectInfo<SocketAddr>>, headers: &HeaderMap) -> String {
    if let Some(ConnectInfo(addr)) = peer {
        return addr.ip().to_string();
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}
