use super::envelope::{DecodeError, decode_items};
use super::provider::{LlmClient, LlmError, ProviderConfig, preview};
use crate::config::RetryPolicy;
use crate::store::TaxonomyStore;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

/// Items requested for a structure list (boards, subjects, ...).
pub const STRUCTURE_ITEM_COUNT: usize = 10;
/// MCQs requested per generation call.
pub const MCQ_ITEM_COUNT: usize = 5;
/// Prefix carried by every fallback item.
pub const MOCK_MARKER: &str = "[MOCK]";

const MOCK_ITEM_COUNT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedMcq {
    pub question: String,
    pub options: Vec<String>,
    pub correct_answer: String,
    #[serde(default)]
    pub explanation: Option<String>,
}

impl GeneratedMcq {
    fn is_well_formed(&self) -> bool {
        !self.question.trim().is_empty()
            && self.options.len() >= 2
            && self.options.iter().all(|option| !option.trim().is_empty())
            && !self.correct_answer.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    NotConfigured,
    ProviderFailed,
    EmptyResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationSource {
    Provider { model: String },
    Fallback { reason: FallbackReason },
}

impl GenerationSource {
    pub fn is_fallback(&self) -> bool {
        matches!(self, GenerationSource::Fallback { .. })
    }

    /// Short form stored in `ai_fetch_logs.source`.
    pub fn label(&self) -> String {
        match self {
            GenerationSource::Provider { model } => format!("provider:{model}"),
            GenerationSource::Fallback { reason } => match reason {
                FallbackReason::NotConfigured => "fallback:not_configured".into(),
                FallbackReason::ProviderFailed => "fallback:provider_failed".into(),
                FallbackReason::EmptyResult => "fallback:empty_result".into(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Generation<T> {
    pub items: Vec<T>,
    pub source: GenerationSource,
}

#[derive(Debug, Error)]
enum GenerationError {
    #[error(transparent)]
    Provider(#[from] LlmError),
    #[error("{error} (payload: {payload})")]
    Decode { error: DecodeError, payload: String },
}

/// Calls the active AI provider and always hands back a well-formed list:
/// any configuration, network or decode failure degrades to mock items.
pub struct GenerationClient {
    llm: LlmClient,
    store: Arc<dyn TaxonomyStore>,
    retry: RetryPolicy,
}

impl GenerationClient {
    pub fn new(llm: LlmClient, store: Arc<dyn TaxonomyStore>, retry: RetryPolicy) -> Self {
        Self { llm, store, retry }
    }

    /// Generates structure names; `kind` is a human label such as
    /// "school education boards".
    pub async fn generate(&self, kind: &str, context: &str) -> Generation<Candidate> {
        let prompt = structure_prompt(kind, context, STRUCTURE_ITEM_COUNT);
        self.generate_with(kind, &prompt, candidate_from_value, || mock_candidates(kind))
            .await
    }

    pub async fn generate_mcqs(&self, context: &str) -> Generation<GeneratedMcq> {
        let prompt = mcq_prompt(context, MCQ_ITEM_COUNT);
        self.generate_with("mcqs", &prompt, mcq_from_value, || mock_mcqs(context))
            .await
    }

    async fn generate_with<T>(
        &self,
        kind: &str,
        prompt: &str,
        convert: fn(Value) -> Option<T>,
        mock: impl Fn() -> Vec<T>,
    ) -> Generation<T> {
        let fallback = |reason: FallbackReason| Generation {
            items: mock(),
            source: GenerationSource::Fallback { reason },
        };

        let provider = match self.store.active_provider().await {
            Ok(Some(provider)) if provider.is_usable() => provider,
            Ok(_) => {
                info!(target = "syllabus.generation", kind, "no active ai provider; using mock data");
                return fallback(FallbackReason::NotConfigured);
            }
            Err(err) => {
                warn!(target = "syllabus.generation", kind, error = %err, "provider_lookup_failed");
                return fallback(FallbackReason::NotConfigured);
            }
        };

        match self.request_items(&provider, prompt).await {
            Ok(raw) => {
                let items: Vec<T> = raw.into_iter().filter_map(convert).collect();
                if items.is_empty() {
                    warn!(target = "syllabus.generation", kind, model = %provider.model, "provider_items_unusable");
                    return fallback(FallbackReason::EmptyResult);
                }
                info!(target = "syllabus.generation", kind, model = %provider.model, count = items.len(), "generation_succeeded");
                Generation {
                    items,
                    source: GenerationSource::Provider {
                        model: provider.model.clone(),
                    },
                }
            }
            Err(err) => {
                warn!(target = "syllabus.generation", kind, model = %provider.model, error = %err, "generation_fallback");
                fallback(FallbackReason::ProviderFailed)
            }
        }
    }

    /// Transport, 429 and 5xx failures are retried with jittered exponential
    /// backoff; other statuses and a payload that does not decode are final.
    async fn request_items(
        &self,
        provider: &ProviderConfig,
        prompt: &str,
    ) -> Result<Vec<Value>, GenerationError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        let text = loop {
            match self.llm.generate_text(provider, prompt).await {
                Ok(text) => break text,
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = backoff(self.retry.base_backoff, attempt);
                    warn!(
                        target = "syllabus.generation",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "provider_call_retry"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        };

        decode_items(&text).map_err(|error| GenerationError::Decode {
            error,
            payload: preview(&text),
        })
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt - 1).min(6));
    let jitter_cap = (base.as_millis() as u64 / 2).max(1);
    exp + Duration::from_millis(rand::rng().random_range(0..=jitter_cap))
}

fn structure_prompt(kind: &str, context: &str, count: usize) -> String {
    format!(
        "Generate exactly {count} {kind} for the following context: {context}.\n\
         Respond with a JSON array of objects shaped like {{\"name\": \"...\"}}, using official names only.\n\
         Do not number the entries and do not invent placeholder names.\n\
         Return only the JSON array, without markdown code fences or commentary."
    )
}

fn mcq_prompt(context: &str, count: usize) -> String {
    format!(
        "Generate exactly {count} multiple choice questions for: {context}.\n\
         Respond with a JSON array of objects shaped like \
         {{\"question\": \"...\", \"options\": [\"...\", \"...\", \"...\", \"...\"], \
         \"correct_answer\": \"...\", \"explanation\": \"...\"}} with exactly four options, \
         where correct_answer repeats the text of the correct option.\n\
         Return only the JSON array, without markdown code fences or commentary."
    )
}

fn candidate_from_value(value: Value) -> Option<Candidate> {
    value
        .get("name")
        .and_then(Value::as_str)
        .map(|name| Candidate {
            name: name.to_string(),
        })
}

fn mcq_from_value(value: Value) -> Option<GeneratedMcq> {
    serde_json::from_value::<GeneratedMcq>(value)
        .ok()
        .filter(GeneratedMcq::is_well_formed)
}

fn mock_candidates(kind: &str) -> Vec<Candidate> {
    (1..=MOCK_ITEM_COUNT)
        .map(|idx| Candidate {
            name: format!("{MOCK_MARKER} Sample {kind} {idx}"),
        })
        .collect()
}

fn mock_mcqs(context: &str) -> Vec<GeneratedMcq> {
    (1..=MCQ_ITEM_COUNT)
        .map(|idx| GeneratedMcq {
            question: format!("{MOCK_MARKER} Sample question {idx} about {context}"),
            options: ["A", "B", "C", "D"]
                .iter()
                .map(|label| format!("Sample option {label}"))
                .collect(),
            correct_answer: "Sample option A".into(),
            explanation: Some("Generated without an AI provider.".into()),
        })
        .collect()
}
