use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

/// Admin API keys loaded from `ADMIN_API_KEYS` (`admin:key,...`).
#[derive(Clone, Default)]
pub struct AdminAuth {
    records: Arc<HashMap<String, AdminRecord>>,
}

#[derive(Clone, Debug)]
pub struct AdminContext {
    pub admin_id: String,
    pub key_id: String,
}

#[derive(Clone)]
struct AdminRecord {
    admin_id: String,
    key_id: String,
}

impl AdminAuth {
    pub fn from_env() -> Self {
        let raw = env::var("ADMIN_API_KEYS").unwrap_or_default();
        let auth = Self::from_pairs(&raw);
        if auth.records.is_empty() {
            warn!(
                target = "syllabus.api",
                "ADMIN_API_KEYS produced no keys; admin routes will reject every request"
            );
        } else {
            info!(
                target = "syllabus.api",
                key_count = auth.records.len(),
                "loaded admin keys from env"
            );
        }
        auth
    }

    pub fn from_pairs(raw: &str) -> Self {
        let mut entries = HashMap::new();
        for (idx, token) in raw.split(',').enumerate() {
            let trimmed = token.trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut parts = trimmed.splitn(2, ':');
            let admin_id = parts.next().map(str::trim).filter(|s| !s.is_empty());
            let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
            match (admin_id, key) {
                (Some(admin), Some(secret)) => {
                    entries.insert(
                        secret.to_string(),
                        AdminRecord {
                            admin_id: admin.to_string(),
                            key_id: format!("key-{:02}", idx + 1),
                        },
                    );
                }
                _ => warn!(
                    target = "syllabus.api",
                    "ignored malformed ADMIN_API_KEYS entry at position {}",
                    idx + 1
                ),
            }
        }
        Self {
            records: Arc::new(entries),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AdminContext> {
        self.records.get(presented).map(|record| AdminContext {
            admin_id: record.admin_id.clone(),
            key_id: record.key_id.clone(),
        })
    }
}

pub async fn require_admin(
    State(auth): State<AdminAuth>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_admin_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_admin_key",
            "Provide X-Admin-Key or Bearer token",
        ));
    };

    let Some(context) = auth.authenticate(&presented) else {
        return Ok(unauthorized_response("invalid_admin_key", "Key not recognized"));
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

fn extract_admin_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Admin-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn pairs_are_parsed_and_malformed_entries_skipped() {
        let auth = AdminAuth::from_pairs("ops:secret-1, broken ,editor:secret-2,:nokey");
        let ops = auth.authenticate("secret-1").expect("ops key");
        assert_eq!(ops.admin_id, "ops");
        assert_eq!(ops.key_id, "key-01");
        assert_eq!(
            auth.authenticate("secret-2").map(|ctx| ctx.admin_id),
            Some("editor".to_string())
        );
        assert!(auth.authenticate("nokey").is_none());
    }

    #[test]
    fn empty_configuration_locks_admin_routes() {
        let auth = AdminAuth::from_pairs("");
        assert!(auth.authenticate("").is_none());
        assert!(auth.authenticate("demo-key").is_none());
    }

    #[test]
    fn bearer_and_header_keys_are_extracted() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer  abc "),
        );
        assert_eq!(extract_admin_key(&headers), Some("abc".to_string()));

        let mut headers = http::HeaderMap::new();
        headers.insert("X-Admin-Key", HeaderValue::from_static("xyz"));
        assert_eq!(extract_admin_key(&headers), Some("xyz".to_string()));

        assert_eq!(extract_admin_key(&http::HeaderMap::new()), None);
    }
}
