//! Local stand-in for the AI provider's `generateContent` endpoint.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use serde_json::json;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::{net::TcpListener, time::Duration};

#[derive(Clone)]
pub enum ProviderReply {
    Text { text: String, delay: Duration },
    Status(u16),
}

pub fn gemini_reply(text: &str) -> ProviderReply {
    ProviderReply::Text {
        text: text.to_string(),
        delay: Duration::ZERO,
    }
}

pub fn slow_gemini_reply(text: &str, delay: Duration) -> ProviderReply {
    ProviderReply::Text {
        text: text.to_string(),
        delay,
    }
}

pub struct ProviderHandle {
    pub base_url: String,
    calls: Arc<AtomicUsize>,
}

impl ProviderHandle {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct ProviderState {
    reply: ProviderReply,
    calls: Arc<AtomicUsize>,
}

async fn generate_content(State(state): State<ProviderState>) -> axum::response::Response {
    state.calls.fetch_add(1, Ordering::SeqCst);
    match state.reply {
        ProviderReply::Text { text, delay } => {
            tokio::time::sleep(delay).await;
            Json(json!({
                "candidates": [{
                    "content": { "role": "model", "parts": [{ "text": text }] },
                    "finishReason": "STOP"
                }]
            }))
            .into_response()
        }
        ProviderReply::Status(code) => (
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            "provider unavailable",
        )
            .into_response(),
    }
}

pub async fn spawn_provider(reply: ProviderReply) -> ProviderHandle {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/models/{action}", post(generate_content))
        .with_state(ProviderState {
            reply,
            calls: calls.clone(),
        });
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind provider stub");
    let addr = listener.local_addr().expect("provider addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    ProviderHandle {
        base_url: format!("http://{addr}"),
        calls,
    }
}
