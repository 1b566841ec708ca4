use crate::{config::RateLimitConfig, models::ApiError};
use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{self, HeaderMap, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::{info, warn};

const REDIS_PREFIX: &str = "syllabus:rate:";

/// Fixed-window request counter per client identifier.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    records: Arc<Mutex<HashMap<String, RateRecord>>>,
    shared: Option<redis::Client>,
}

struct RateRecord {
    count: u32,
    reset_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateStatus {
    pub limit: u32,
    pub count: u32,
    pub reset_after: Duration,
}

impl RateStatus {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }

    fn apply_headers(&self, headers: &mut HeaderMap) {
        let reset = self.reset_after.as_secs_f64().ceil() as u64;
        headers.insert("X-RateLimit-Limit", header_number(self.limit as u64));
        headers.insert("X-RateLimit-Remaining", header_number(self.remaining() as u64));
        headers.insert("X-RateLimit-Reset", header_number(reset));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed(RateStatus),
    Limited(RateStatus),
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed(_))
    }

    pub fn status(&self) -> RateStatus {
        match self {
            RateDecision::Allowed(status) | RateDecision::Limited(status) => *status,
        }
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            records: Arc::new(Mutex::new(HashMap::new())),
            shared: None,
        }
    }

    pub fn with_redis(config: RateLimitConfig, client: redis::Client) -> Self {
        Self {
            shared: Some(client),
            ..Self::new(config)
        }
    }

    pub async fn check(&self, client_id: &str) -> RateDecision {
        if let Some(client) = &self.shared {
            match self.check_shared(client, client_id).await {
                Ok(decision) => return decision,
                Err(err) => {
                    warn!(target = "syllabus.guard", client_id, error = %err, "redis rate limiter unavailable; allowing request");
                    return RateDecision::Allowed(RateStatus {
                        limit: self.config.max_requests,
                        count: 0,
                        reset_after: self.config.window,
                    });
                }
            }
        }
        self.check_at(client_id, Instant::now()).await
    }

    /// Process-local check against an explicit clock reading.
    pub async fn check_at(&self, client_id: &str, now: Instant) -> RateDecision {
        let mut records = self.records.lock().await;
        let record = records
            .entry(client_id.to_string())
            .or_insert_with(|| RateRecord {
                count: 0,
                reset_at: now + self.config.window,
            });

        if now > record.reset_at {
            record.count = 0;
            record.reset_at = now + self.config.window;
        }
        record.count = record.count.saturating_add(1);

        let status = RateStatus {
            limit: self.config.max_requests,
            count: record.count,
            reset_after: record.reset_at.saturating_duration_since(now),
        };
        self.decide(status)
    }

    async fn check_shared(
        &self,
        client: &redis::Client,
        client_id: &str,
    ) -> redis::RedisResult<RateDecision> {
        let key = format!("{REDIS_PREFIX}{client_id}");
        let window_secs = self.config.window.as_secs().max(1);
        let mut conn = client.get_multiplexed_async_connection().await?;
        let count: u32 = redis::cmd("INCR").arg(&key).query_async(&mut conn).await?;
        if count == 1 {
            let _: i64 = redis::cmd("EXPIRE")
                .arg(&key)
                .arg(window_secs)
                .query_async(&mut conn)
                .await?;
        }
        let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut conn).await?;
        let reset_after = u64::try_from(ttl)
            .map(Duration::from_secs)
            .unwrap_or(self.config.window);
        Ok(self.decide(RateStatus {
            limit: self.config.max_requests,
            count,
            reset_after,
        }))
    }

    fn decide(&self, status: RateStatus) -> RateDecision {
        if status.count > status.limit {
            RateDecision::Limited(status)
        } else {
            RateDecision::Allowed(status)
        }
    }
}

pub async fn enforce_rate_limit(
    State(limiter): State<RateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let client_id = client_id(&request, limiter.config.trust_forwarded);
    let decision = limiter.check(&client_id).await;
    let status = decision.status();
    if decision.is_allowed() {
        let mut response = next.run(request).await;
        status.apply_headers(response.headers_mut());
        return Ok(response);
    }

    info!(target = "syllabus.api", client_id = %client_id, count = status.count, "rate_limited");
    let payload = ApiError {
        error: "rate_limited".into(),
        detail: Some("Too many requests, please try again later".into()),
    };
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(payload)).into_response();
    status.apply_headers(response.headers_mut());
    let retry = status.reset_after.as_secs_f64().ceil().max(1.0) as u64;
    response
        .headers_mut()
        .insert(http::header::RETRY_AFTER, header_number(retry));
    Ok(response)
}

/// With `trust_forwarded`, the proxy-supplied address first; then the socket
/// peer, then `"unknown"`.
fn client_id(request: &Request<Body>, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let headers = request.headers();
        if let Some(forwarded) = header_str(headers, "x-forwarded-for")
            .and_then(|raw| raw.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
        {
            return forwarded.to_string();
        }
        if let Some(real_ip) = header_str(headers, "x-real-ip") {
            return real_ip.to_string();
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn header_number(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            window: Duration::from_secs(window_secs),
            max_requests,
            trust_forwarded: false,
        })
    }

    #[tokio::test]
    async fn eleventh_request_in_window_is_rejected() {
        let limiter = limiter(10, 900);
        let now = Instant::now();
        for expected in 1..=10 {
            let decision = limiter.check_at("10.0.0.1", now).await;
            assert!(decision.is_allowed());
            assert_eq!(decision.status().count, expected);
        }
        let rejected = limiter.check_at("10.0.0.1", now).await;
        assert!(!rejected.is_allowed());
        assert_eq!(rejected.status().remaining(), 0);

        // other clients keep their own window
        assert!(limiter.check_at("10.0.0.2", now).await.is_allowed());
    }

    #[tokio::test]
    async fn window_reset_restarts_count_at_one() {
        let limiter = limiter(2, 60);
        let start = Instant::now();
        limiter.check_at("c", start).await;
        limiter.check_at("c", start).await;
        assert!(!limiter.check_at("c", start).await.is_allowed());

        let later = start + Duration::from_secs(61);
        let decision = limiter.check_at("c", later).await;
        assert!(decision.is_allowed());
        assert_eq!(decision.status().count, 1);
        assert_eq!(decision.status().reset_after, Duration::from_secs(60));
    }

    #[test]
    fn client_id_prefers_forwarded_header_when_trusted() {
        let request = Request::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .header("x-real-ip", "198.51.100.2")
            .body(Body::empty())
            .expect("request");
        assert_eq!(client_id(&request, true), "203.0.113.9");

        let request = Request::builder()
            .header("x-real-ip", "198.51.100.2")
            .body(Body::empty())
            .expect("request");
        assert_eq!(client_id(&request, true), "198.51.100.2");

        let mut request = Request::builder().body(Body::empty()).expect("request");
        assert_eq!(client_id(&request, true), "unknown");
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 4], 5000))));
        assert_eq!(client_id(&request, true), "192.0.2.4");
    }

    #[test]
    fn client_id_ignores_forwarded_headers_by_default() {
        let mut request = Request::builder()
            .header("x-forwarded-for", "203.0.113.9")
            .header("x-real-ip", "198.51.100.2")
            .body(Body::empty())
            .expect("request");
        assert_eq!(client_id(&request, false), "unknown");
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 4], 5000))));
        assert_eq!(client_id(&request, false), "192.0.2.4");
    }

    #[tokio::test]
    async fn unreachable_redis_fails_open() {
        let client = redis::Client::open("redis://127.0.0.1:1/").expect("client");
        let limiter = RateLimiter::with_redis(
            RateLimitConfig {
                window: Duration::from_secs(60),
                max_requests: 1,
                trust_forwarded: false,
            },
            client,
        );
        assert!(limiter.check("c").await.is_allowed());
        assert!(limiter.check("c").await.is_allowed());
    }
}
