//! OpenAI-compatible adapter.
//!
//! Works with any endpoint that follows the OpenAI chat completions
//! contract (OpenAI, Azure-compatible proxies, Ollama, vLLM, LM Studio).

use std::collections::BTreeMap;

use serde_json::Value;

use pa_domain::config::ProviderConfig;
use pa_domain::stream::{BoxStream, StreamEvent, Usage};
use pa_domain::tool::{ChatMessage, ToolDefinition};
use pa_domain::{Error, Result};

use crate::sse::sse_response_stream;
use crate::{ChatRequest, LlmProvider};

const DEFAULT_API_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Build from an `agent.yaml` provider entry. Fails when the key
    /// environment variable is unset or empty.
    pub fn from_config(id: &str, cfg: &ProviderConfig) -> Result<Self> {
        let api_key = std::env::var(&cfg.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Provider {
                provider: id.to_string(),
                message: format!("credential env var {} is not set", cfg.api_key_env),
            })?;

        let base_url = cfg
            .api_url
            .as_deref()
            .unwrap_or(DEFAULT_API_URL)
            .trim_end_matches('/')
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Provider {
                provider: id.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            id: id.to_string(),
            base_url,
            api_key,
            client,
        })
    }

    fn build_chat_body(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();

        let mut body = serde_json::json!({
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(model) = &req.model {
            body["model"] = Value::String(model.clone());
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if let Some(top_p) = req.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if let Some(seed) = req.seed {
            body["seed"] = serde_json::json!(seed);
        }
        body
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(&req);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider {
                provider: self.id.clone(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {status}: {text}"),
            });
        }

        let mut parser = ChunkParser::default();
        let provider = self.id.clone();
        Ok(sse_response_stream(
            provider.clone(),
            response,
            move |data| parser.parse(&provider, data),
        ))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn msg_to_openai(msg: &ChatMessage) -> Value {
    if msg.role == "tool" {
        return serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": msg.content,
        });
    }

    let mut obj = serde_json::json!({
        "role": msg.role,
        "content": msg.content,
    });
    if !msg.tool_calls.is_empty() {
        let calls: Vec<Value> = msg
            .tool_calls
            .iter()
            .map(|tc| {
                serde_json::json!({
                    "id": tc.call_id,
                    "type": "function",
                    "function": {
                        "name": tc.tool_name,
                        "arguments": tc.arguments.to_string(),
                    }
                })
            })
            .collect();
        obj["tool_calls"] = Value::Array(calls);
    }
    obj
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming response parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Assembles tool calls across chunks: the wire fragments arguments over
/// many deltas keyed by index.
#[derive(Default)]
struct ChunkParser {
    /// index -> (call_id, tool_name, argument buffer)
    tool_calls: BTreeMap<u64, (String, String, String)>,
    usage: Option<Usage>,
}

impl ChunkParser {
    fn parse(&mut self, provider: &str, data: &str) -> Vec<Result<StreamEvent>> {
        if data == "[DONE]" {
            let mut events = self.flush_tool_calls();
            events.push(Ok(StreamEvent::Done {
                usage: self.usage.take(),
                finish_reason: None,
            }));
            return events;
        }

        let chunk: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                return vec![Err(Error::Provider {
                    provider: provider.to_string(),
                    message: format!("bad stream chunk: {e}"),
                })]
            }
        };

        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(Usage {
                prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
                total_tokens: usage["total_tokens"].as_u64().unwrap_or(0) as u32,
            });
        }

        let mut events = Vec::new();
        let Some(choice) = chunk
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
        else {
            return events;
        };

        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    events.push(Ok(StreamEvent::Token {
                        text: text.to_string(),
                    }));
                }
            }
            if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for call in calls {
                    let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                    let entry = self.tool_calls.entry(index).or_default();
                    if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                        entry.0 = id.to_string();
                    }
                    if let Some(f) = call.get("function") {
                        if let Some(name) = f.get("name").and_then(|v| v.as_str()) {
                            entry.1 = name.to_string();
                        }
                        if let Some(args) = f.get("arguments").and_then(|v| v.as_str()) {
                            entry.2.push_str(args);
                        }
                    }
                }
            }
        }

        // Tool calls finish when the choice reports its finish reason.
        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            events.extend(self.flush_tool_calls());
            events.push(Ok(StreamEvent::Done {
                usage: self.usage.take(),
                finish_reason: Some(reason.to_string()),
            }));
        }

        events
    }

    fn flush_tool_calls(&mut self) -> Vec<Result<StreamEvent>> {
        let calls = std::mem::take(&mut self.tool_calls);
        calls
            .into_values()
            .map(|(call_id, tool_name, args)| {
                let arguments = if args.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&args).unwrap_or_else(|e| {
                        tracing::warn!(
                            tool = %tool_name,
                            error = %e,
                            "tool call arguments are not valid JSON; defaulting to empty object"
                        );
                        Value::Object(Default::default())
                    })
                };
                Ok(StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_deltas() {
        let mut parser = ChunkParser::default();
        let events = parser.parse(
            "openai",
            r#"{"choices":[{"delta":{"content":"hel"}}]}"#,
        );
        assert_eq!(events.len(), 1);
        match events[0].as_ref().unwrap() {
            StreamEvent::Token { text } => assert_eq!(text, "hel"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn assembles_fragmented_tool_call() {
        let mut parser = ChunkParser::default();
        parser.parse(
            "openai",
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"time.now","arguments":""}}]}}]}"#,
        );
        parser.parse(
            "openai",
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"a\""}}]}}]}"#,
        );
        parser.parse(
            "openai",
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":1}"}}]}}]}"#,
        );
        let events = parser.parse(
            "openai",
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        );

        let mut saw_call = false;
        for event in &events {
            if let Ok(StreamEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            }) = event
            {
                saw_call = true;
                assert_eq!(call_id, "call_1");
                assert_eq!(tool_name, "time.now");
                assert_eq!(arguments["a"], 1);
            }
        }
        assert!(saw_call);
        assert!(matches!(
            events.last().unwrap().as_ref().unwrap(),
            StreamEvent::Done { .. }
        ));
    }

    #[test]
    fn done_sentinel_carries_usage() {
        let mut parser = ChunkParser::default();
        parser.parse(
            "openai",
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
        );
        let events = parser.parse("openai", "[DONE]");
        match events.last().unwrap().as_ref().unwrap() {
            StreamEvent::Done { usage, .. } => {
                let usage = usage.as_ref().unwrap();
                assert_eq!(usage.prompt_tokens, 10);
                assert_eq!(usage.total_tokens, 15);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_chunk_is_a_provider_error() {
        let mut parser = ChunkParser::default();
        let events = parser.parse("openai", "{not json");
        assert!(events[0].is_err());
    }

    #[test]
    fn empty_arguments_default_to_object() {
        let mut parser = ChunkParser::default();
        parser.parse(
            "openai",
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c","function":{"name":"echo.text"}}]}}]}"#,
        );
        let events = parser.parse(
            "openai",
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        );
        match events.first().unwrap().as_ref().unwrap() {
            StreamEvent::ToolCallFinished { arguments, .. } => {
                assert!(arguments.as_object().unwrap().is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
