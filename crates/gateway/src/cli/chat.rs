//! `agent chat` — interactive REPL against a running server.
//!
//! Opens (or resumes) a channel, POSTs each input line as a message, and
//! renders the SSE stream: assistant deltas to stdout, `[tool: ...]` and
//! `[result: ...]` markers for tool activity.

use futures_util::StreamExt;
use serde_json::Value;

use pa_domain::config::Config;
use uuid::Uuid;

use super::server_base_url;

pub async fn chat(config: &Config, channel: Option<String>) -> anyhow::Result<()> {
    let base_url = server_base_url(config);
    let channel_id = channel.unwrap_or_else(|| format!("cli-{}", &Uuid::new_v4().to_string()[..8]));
    let client = reqwest::Client::new();

    // Open (or resume) the channel; creation is idempotent.
    let create_url = format!("{base_url}/channels/{channel_id}/create");
    let response = client
        .post(&create_url)
        .json(&serde_json::json!({ "channel_type": "CLI", "agent_id": "default" }))
        .send()
        .await?;
    if !response.status().is_success() {
        anyhow::bail!(
            "channel create failed: HTTP {} — is the server running? (try `agent serve`)",
            response.status()
        );
    }

    eprintln!("personal-agent chat");
    eprintln!("Channel: {channel_id}  |  Ctrl+D to exit");
    eprintln!();

    let mut rl = rustyline::DefaultEditor::new()?;
    loop {
        match rl.readline("you> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                rl.add_history_entry(&line).ok();

                if let Err(e) = send_message(&client, &base_url, &channel_id, trimmed).await {
                    eprintln!("error: {e}");
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                eprintln!("(Ctrl+D to exit)");
                continue;
            }
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("readline error: {e}");
                break;
            }
        }
    }

    eprintln!("Goodbye!");
    Ok(())
}

/// POST one message and render the SSE frames as they arrive.
async fn send_message(
    client: &reqwest::Client,
    base_url: &str,
    channel_id: &str,
    content: &str,
) -> anyhow::Result<()> {
    let url = format!("{base_url}/channels/{channel_id}/messages");
    let response = client
        .post(&url)
        .json(&serde_json::json!({ "content": content }))
        .send()
        .await?;
    if !response.status().is_success() {
        anyhow::bail!("HTTP {}", response.status());
    }

    let mut buffer = String::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        buffer.push_str(&String::from_utf8_lossy(&chunk?));
        for (event_type, data) in drain_frames(&mut buffer) {
            render_event(&event_type, &data);
        }
    }
    println!();
    Ok(())
}

/// Pull complete SSE frames out of the buffer as `(event, data)` pairs.
fn drain_frames(buffer: &mut String) -> Vec<(String, String)> {
    let mut frames = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        let mut event_type = String::new();
        let mut data = String::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                event_type = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                data = rest.trim().to_string();
            }
        }
        if !event_type.is_empty() {
            frames.push((event_type, data));
        }
    }
    frames
}

fn render_event(event_type: &str, data: &str) {
    let body: Value = serde_json::from_str(data).unwrap_or(Value::Null);
    match event_type {
        "assistant.delta" => {
            if let Some(text) = body.get("text").and_then(|v| v.as_str()) {
                use std::io::Write;
                print!("{text}");
                std::io::stdout().flush().ok();
            }
        }
        "tool.call" => {
            let name = body.get("tool_name").and_then(|v| v.as_str()).unwrap_or("?");
            println!("[tool: {name}]");
        }
        "tool.result" => {
            let output = body.get("output").map(Value::to_string).unwrap_or_default();
            println!("[result: {output}]");
        }
        "turn.failed" => {
            let code = body.get("error_code").and_then(|v| v.as_str()).unwrap_or("?");
            let message = body.get("message").and_then(|v| v.as_str()).unwrap_or("");
            eprintln!("\n[turn failed: {code} — {message}]");
        }
        // turn.started / turn.completed render nothing.
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_frames_splits_event_and_data() {
        let mut buf = String::from(
            "event: assistant.delta\nid: 2\ndata: {\"text\":\"hi\"}\n\nevent: turn.comp",
        );
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, "assistant.delta");
        assert_eq!(frames[0].1, "{\"text\":\"hi\"}");
        assert_eq!(buf, "event: turn.comp");
    }
}
