use crate::error::AppError;
use crate::middleware::client_ip::TrustedProxies;
use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

/// Shared counter backend for fixed-window rate limiting.
///
/// Counters live outside the process so every instance behind a load
/// balancer sees the same totals.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and return the new value. The key expires after `ttl`.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, AppError>;
}

#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl RedisCounterStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, AppError> {
        let mut conn = self.conn.clone();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}

/// In-process counters for single-instance deployments and tests.
#[derive(Default)]
pub struct LocalCounterStore {
    counters: DashMap<String, (u64, Instant)>,
}

const LOCAL_PRUNE_THRESHOLD: usize = 10_000;

impl LocalCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for LocalCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, AppError> {
        let now = Instant::now();
        if self.counters.len() > LOCAL_PRUNE_THRESHOLD {
            self.counters.retain(|_, (_, expires)| *expires > now);
        }

        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert((0, now + ttl));
        if entry.1 <= now {
            *entry = (0, now + ttl);
        }
        entry.0 += 1;
        Ok(entry.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u64 },
    Limited { retry_after_secs: u64 },
}

/// Fixed-window limiter: at most `limit` hits per key per `window`.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    limit: u64,
    window: Duration,
    prefix: String,
    proxies: TrustedProxies,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        prefix: impl Into<String>,
        limit: u64,
        window: Duration,
    ) -> Self {
        Self {
            store,
            limit: limit.max(1),
            window: if window.is_zero() {
                Duration::from_secs(1)
            } else {
                window
            },
            prefix: prefix.into(),
            proxies: TrustedProxies::none(),
        }
    }

    /// Believe `x-forwarded-for` only from these peers.
    pub fn with_trusted_proxies(mut self, proxies: TrustedProxies) -> Self {
        self.proxies = proxies;
        self
    }

    pub async fn check(&self, key: &str) -> Result<RateDecision, AppError> {
        let window_secs = self.window.as_secs().max(1);
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let bucket = now / window_secs;
        let counter_key = format!("{}:{}:{}", self.prefix, key, bucket);

        let count = self.store.increment(&counter_key, self.window).await?;
        if count > self.limit {
            let retry_after_secs = (bucket + 1) * window_secs - now;
            Ok(RateDecision::Limited {
                retry_after_secs: retry_after_secs.max(1),
            })
        } else {
            Ok(RateDecision::Allowed {
                remaining: self.limit - count,
            })
        }
    }
}

/// Middleware for IP-based rate limiting. Counter store failures let the
/// request through.
pub async fn ip_rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let Some(ip) = limiter.proxies.client_ip(request.headers(), peer) else {
        tracing::warn!("Could not determine IP for rate limiting");
        return Ok(next.run(request).await);
    };

    match limiter.check(&ip.to_string()).await {
        Ok(RateDecision::Allowed { .. }) => Ok(next.run(request).await),
        Ok(RateDecision::Limited { retry_after_secs }) => {
            tracing::info!(ip = %ip, "Rate limit exceeded");
            Err(AppError::TooManyRequests(
                "Too many requests from this IP. Please try again later.".to_string(),
                Some(retry_after_secs),
            ))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Rate limit store unavailable, allowing request");
            Ok(next.run(request).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, routing::get, Router};
    use tower::ServiceExt;

    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64, AppError> {
            Err(AppError::ServiceUnavailable)
        }
    }

    fn app(limiter: RateLimiter) -> Router {
        Router::new().route("/", get(|| async { "ok" })).layer(
            axum::middleware::from_fn_with_state(Arc::new(limiter), ip_rate_limit_middleware),
        )
    }

    const PROXY: &str = "10.9.9.9";

    fn request(peer: &str, forwarded_for: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/");
        if let Some(forwarded_for) = forwarded_for {
            builder = builder.header("x-forwarded-for", forwarded_for);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        let peer: SocketAddr = format!("{}:40000", peer).parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        request
    }

    fn request_from(ip: &str) -> Request {
        request(PROXY, Some(ip))
    }

    fn limiter(store: Arc<dyn CounterStore>, prefix: &str, limit: u64) -> RateLimiter {
        RateLimiter::new(store, prefix, limit, Duration::from_secs(60))
            .with_trusted_proxies(PROXY.parse().unwrap())
    }

    #[tokio::test]
    async fn limits_after_threshold() {
        let limiter = RateLimiter::new(
            Arc::new(LocalCounterStore::new()),
            "test",
            2,
            Duration::from_secs(60),
        );

        assert!(matches!(
            limiter.check("k").await.unwrap(),
            RateDecision::Allowed { remaining: 1 }
        ));
        assert!(matches!(
            limiter.check("k").await.unwrap(),
            RateDecision::Allowed { remaining: 0 }
        ));
        assert!(matches!(
            limiter.check("k").await.unwrap(),
            RateDecision::Limited { .. }
        ));
        assert!(matches!(
            limiter.check("other").await.unwrap(),
            RateDecision::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn middleware_rejects_with_429() {
        let app = app(limiter(Arc::new(LocalCounterStore::new()), "mw", 1));

        let first = app.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.clone().oneshot(request_from("10.0.0.1")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(axum::http::header::RETRY_AFTER));

        let other = app.oneshot(request_from("10.0.0.2")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let app = app(limiter(Arc::new(FailingStore), "down", 1));

        for _ in 0..3 {
            let response = app.clone().oneshot(request_from("10.0.0.3")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn forwarded_header_from_untrusted_peer_is_ignored() {
        let app = app(limiter(Arc::new(LocalCounterStore::new()), "spoof", 1));

        let first = app
            .clone()
            .oneshot(request("203.0.113.50", Some("198.51.100.1")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        // Rotating the header does not reset the direct caller's budget.
        let rotated = app
            .oneshot(request("203.0.113.50", Some("198.51.100.2")))
            .await
            .unwrap();
        assert_eq!(rotated.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
