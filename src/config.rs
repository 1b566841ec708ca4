use std::{env, str::FromStr, time::Duration};

/// How a multi-row ingestion commits its writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// One transaction around the whole batch; any failure rolls everything back.
    Batch,
    /// Every row is its own implicit transaction; a failure keeps the committed prefix.
    PerRow,
}

impl CommitPolicy {
    pub fn from_raw(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "batch" | "atomic" => Some(Self::Batch),
            "per_row" | "per-row" | "row" => Some(Self::PerRow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
    /// Key clients on `X-Forwarded-For` / `X-Real-IP`. Only safe behind a
    /// proxy that overwrites those headers.
    pub trust_forwarded: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            max_requests: 10,
            trust_forwarded: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Attempts made against the AI provider before falling back to mock data.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub redis_url: Option<String>,
    pub rate_limit: RateLimitConfig,
    pub guard_ttl: Duration,
    pub body_limit: usize,
    pub http: HttpConfig,
    pub retry: RetryPolicy,
    pub fetch_out_commit: CommitPolicy,
    pub metrics_key: Option<String>,
    pub openapi_key: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            database_url: None,
            database_max_connections: 5,
            redis_url: None,
            rate_limit: RateLimitConfig::default(),
            guard_ttl: Duration::from_secs(300),
            body_limit: 256 * 1024,
            http: HttpConfig::default(),
            retry: RetryPolicy::default(),
            fetch_out_commit: CommitPolicy::PerRow,
            metrics_key: None,
            openapi_key: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("PORT").unwrap_or(defaults.port),
            database_url: env_string("DATABASE_URL"),
            database_max_connections: env_parse("DATABASE_MAX_CONNECTIONS")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.database_max_connections),
            redis_url: env_string("REDIS_URL"),
            rate_limit: RateLimitConfig {
                window: env_parse("RATE_LIMIT_WINDOW_SECS")
                    .filter(|v| *v > 0)
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.rate_limit.window),
                max_requests: env_parse("RATE_LIMIT_MAX_REQUESTS")
                    .filter(|v| *v > 0)
                    .unwrap_or(defaults.rate_limit.max_requests),
                trust_forwarded: env_parse("TRUST_FORWARDED_HEADERS")
                    .unwrap_or(defaults.rate_limit.trust_forwarded),
            },
            guard_ttl: env_parse("GUARD_TTL_SECS")
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.guard_ttl),
            body_limit: env_parse("REQUEST_MAX_BYTES")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.body_limit),
            http: HttpConfig {
                timeout: env_parse("HTTP_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.http.timeout),
                connect_timeout: env_parse("HTTP_CONNECT_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.http.connect_timeout),
            },
            retry: RetryPolicy {
                max_attempts: env_parse("GENERATION_MAX_ATTEMPTS")
                    .filter(|v| *v > 0)
                    .unwrap_or(defaults.retry.max_attempts),
                base_backoff: env_parse("GENERATION_BACKOFF_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.base_backoff),
            },
            fetch_out_commit: env::var("FETCH_OUT_COMMIT")
                .ok()
                .and_then(|v| CommitPolicy::from_raw(&v))
                .unwrap_or(defaults.fetch_out_commit),
            metrics_key: env_string("METRICS_KEY"),
            openapi_key: env_string("OPENAPI_KEY"),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_policy_accepts_known_spellings() {
        assert_eq!(CommitPolicy::from_raw("batch"), Some(CommitPolicy::Batch));
        assert_eq!(CommitPolicy::from_raw(" PER_ROW "), Some(CommitPolicy::PerRow));
        assert_eq!(CommitPolicy::from_raw("per-row"), Some(CommitPolicy::PerRow));
        assert_eq!(CommitPolicy::from_raw("sometimes"), None);
    }

    #[test]
    fn defaults_match_documented_limits() {
        let config = AppConfig::default();
        assert_eq!(config.rate_limit.window, Duration::from_secs(900));
        assert_eq!(config.rate_limit.max_requests, 10);
        assert!(!config.rate_limit.trust_forwarded);
        assert_eq!(config.fetch_out_commit, CommitPolicy::PerRow);
        assert!(config.database_url.is_none());
    }
}
