//! Built-in tools exposed to the model.
//!
//! Tools are variants of a sum type rather than a string-keyed map of
//! functions; the registry resolves a wire name to its variant and the
//! runtime wraps every invocation in governance checks.

mod math;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use pa_domain::tool::ToolDefinition;
use pa_domain::{Error, Result};

/// The closed set of built-in tools.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltinTool {
    /// `time.now` — current instant as ISO-8601.
    TimeNow,
    /// `math.calculate` — arithmetic over digits and `+-*/()`.
    MathCalculate,
    /// `echo.text` — returns its input verbatim.
    EchoText,
}

impl BuiltinTool {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "time.now" => Some(Self::TimeNow),
            "math.calculate" => Some(Self::MathCalculate),
            "echo.text" => Some(Self::EchoText),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::TimeNow => "time.now",
            Self::MathCalculate => "math.calculate",
            Self::EchoText => "echo.text",
        }
    }

    /// The sandbox operation class this tool belongs to.
    pub fn sandbox_operation(&self) -> &'static str {
        match self {
            Self::TimeNow => "clock",
            Self::MathCalculate => "calculator",
            Self::EchoText => "echo",
        }
    }

    /// Run the tool effect. `now` is injected so scheduled and replayed
    /// invocations stay deterministic under test.
    pub fn execute(&self, arguments: &Value, now: DateTime<Utc>) -> Result<Value> {
        match self {
            Self::TimeNow => Ok(Value::String(
                now.to_rfc3339_opts(SecondsFormat::Secs, true),
            )),
            Self::MathCalculate => {
                let expression = arguments
                    .get("expression")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| invalid_args("math.calculate requires an expression"))?;
                let value = math::evaluate(expression)?;
                Ok(serde_json::json!({ "expression": expression, "result": value }))
            }
            Self::EchoText => {
                let text = arguments
                    .get("text")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| invalid_args("echo.text requires text"))?;
                Ok(Value::String(text.to_string()))
            }
        }
    }
}

fn invalid_args(message: &str) -> Error {
    Error::InternalServerError {
        message: message.to_string(),
    }
}

/// Definitions for every built-in tool, in registry order.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "time.now".into(),
            description: "Get the current time as an ISO-8601 UTC timestamp.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {},
            }),
        },
        ToolDefinition {
            name: "math.calculate".into(),
            description: "Evaluate an arithmetic expression. Digits, + - * / and \
                          parentheses only."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "expression": {
                        "type": "string",
                        "description": "Expression to evaluate, e.g. \"(2+3)*4\""
                    }
                },
                "required": ["expression"]
            }),
        },
        ToolDefinition {
            name: "echo.text".into(),
            description: "Return the given text verbatim.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "Text to echo back" }
                },
                "required": ["text"]
            }),
        },
    ]
}
