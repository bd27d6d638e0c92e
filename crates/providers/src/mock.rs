//! Scripted provider for tests: replays a fixed sequence of responses.

use std::collections::VecDeque;

use parking_lot::Mutex;

use pa_domain::stream::{BoxStream, StreamEvent, Usage};
use pa_domain::{Error, Result};

use crate::{ChatRequest, LlmProvider};

/// One scripted model response.
#[derive(Clone, Debug)]
pub enum ScriptedResponse {
    /// Stream the text as single-character-ish token chunks, then `Done`.
    Text(String),
    /// Emit a tool call, then `Done` with finish reason `tool_calls`.
    ToolCall {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    /// Fail the stream with a provider error.
    Fail(String),
}

/// Replays scripted responses in order; the last script repeats once the
/// queue drains, which keeps multi-call tests simple.
pub struct ScriptedProvider {
    id: String,
    script: Mutex<VecDeque<ScriptedResponse>>,
    fallback: ScriptedResponse,
    usage: Usage,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        let fallback = responses
            .last()
            .cloned()
            .unwrap_or_else(|| ScriptedResponse::Text("ok".into()));
        Self {
            id: "scripted".into(),
            script: Mutex::new(responses.into()),
            fallback,
            usage: Usage {
                prompt_tokens: 7,
                completion_tokens: 11,
                total_tokens: 18,
            },
        }
    }

    /// A provider that always answers with `text`.
    pub fn with_text(text: &str) -> Self {
        Self::new(vec![ScriptedResponse::Text(text.into())])
    }

    /// A provider that always fails.
    pub fn failing(message: &str) -> Self {
        Self::new(vec![ScriptedResponse::Fail(message.into())])
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat_stream(
        &self,
        _req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let next = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let usage = self.usage.clone();
        let id = self.id.clone();

        let stream = async_stream::stream! {
            match next {
                ScriptedResponse::Text(text) => {
                    // Two chunks exercise delta accumulation.
                    let mid = text.len() / 2;
                    let (a, b) = text.split_at(mid);
                    if !a.is_empty() {
                        yield Ok(StreamEvent::Token { text: a.to_string() });
                    }
                    if !b.is_empty() {
                        yield Ok(StreamEvent::Token { text: b.to_string() });
                    }
                    yield Ok(StreamEvent::Done {
                        usage: Some(usage),
                        finish_reason: Some("stop".into()),
                    });
                }
                ScriptedResponse::ToolCall { call_id, tool_name, arguments } => {
                    yield Ok(StreamEvent::ToolCallFinished {
                        call_id,
                        tool_name,
                        arguments,
                    });
                    yield Ok(StreamEvent::Done {
                        usage: Some(usage),
                        finish_reason: Some("tool_calls".into()),
                    });
                }
                ScriptedResponse::Fail(message) => {
                    yield Err(Error::Provider { provider: id, message });
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}
