//! AI provider access: the wire client, payload decoding and the
//! fallback-aware generation front end.

mod envelope;
mod generate;
mod provider;

pub use generate::{GenerationClient, GenerationSource, MOCK_MARKER};
pub use provider::{LlmClient, ProviderConfig};
