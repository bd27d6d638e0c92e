//! LLM provider adapters.
//!
//! The runtime talks to models through [`LlmProvider`]; adapters translate
//! between internal types and each endpoint's wire format. One concrete
//! adapter ships here (OpenAI-compatible chat completions) plus a scripted
//! provider for tests.

pub mod mock;
pub mod openai;
pub mod registry;
mod sse;

pub use mock::ScriptedProvider;
pub use openai::OpenAiCompatProvider;
pub use registry::ProviderRegistry;

use pa_domain::stream::{BoxStream, StreamEvent};
use pa_domain::tool::{ChatMessage, ToolDefinition};
use pa_domain::Result;

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send.
    pub messages: Vec<ChatMessage>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Sampling temperature. `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response. `None` lets the provider choose.
    pub max_tokens: Option<u32>,
    /// Nucleus sampling cutoff.
    pub top_p: Option<f32>,
    /// Deterministic sampling seed, where the endpoint supports it.
    pub seed: Option<u64>,
    /// Model identifier. `None` uses the provider default.
    pub model: Option<String>,
}

/// Trait that every LLM adapter implements.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and return a stream of events.
    async fn chat_stream(&self, req: ChatRequest)
        -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}
