//! OpenAI-compatible adapter.
//!
//! Works with any endpoint following the chat completions contract
//! (OpenAI, Azure fronting, vLLM, Together, …). API keys arrive per
//! request — the orchestrator forwards the caller's key rather than
//! holding a service credential.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use ed_domain::error::{Error, Result};

use crate::sse::sse_text_stream;
use crate::traits::{BoxStream, LlmClient, LlmMessage, StreamOpts};

pub struct HttpLlmClient {
    base_url: String,
    default_model: String,
    client: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new(base_url: &str, default_model: &str, request_timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model: default_model.to_string(),
            client,
        })
    }

    fn build_body(&self, messages: &[LlmMessage], opts: &StreamOpts, stream: bool) -> Value {
        let messages: Vec<Value> = messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
            .collect();

        let mut body = serde_json::json!({
            "model": opts.model.clone().unwrap_or_else(|| self.default_model.clone()),
            "messages": messages,
            "stream": stream,
        });
        if let Some(t) = opts.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(m) = opts.max_tokens {
            body["max_tokens"] = serde_json::json!(m);
        }
        if opts.json_mode {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        body
    }

    async fn post(&self, api_key: &str, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("LLM request: {e}"))
                } else {
                    Error::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Auth(format!("LLM endpoint returned {status}")));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited("LLM endpoint".into()));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Http(format!("LLM endpoint returned {status}: {text}")));
        }
        Ok(response)
    }
}

/// Extract the text delta from one streamed chat-completions frame.
fn delta_text(data: &str) -> Option<String> {
    let value: Value = serde_json::from_str(data).ok()?;
    let delta = value.get("choices")?.get(0)?.get("delta")?;
    delta
        .get("content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

#[async_trait::async_trait]
impl LlmClient for HttpLlmClient {
    async fn stream(
        &self,
        api_key: &str,
        messages: &[LlmMessage],
        signal: CancellationToken,
        opts: &StreamOpts,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let body = self.build_body(messages, opts, true);
        let response = self.post(api_key, &body).await?;
        Ok(sse_text_stream(response, signal, delta_text))
    }

    async fn generate(
        &self,
        api_key: &str,
        messages: &[LlmMessage],
        opts: &StreamOpts,
    ) -> Result<String> {
        let body = self.build_body(messages, opts, false);
        let response = self.post(api_key, &body).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| Error::Validation("LLM response has no message content".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_text_extracts_content() {
        let frame = r#"{"choices":[{"delta":{"content":"Hello"}}]}"#;
        assert_eq!(delta_text(frame).as_deref(), Some("Hello"));
    }

    #[test]
    fn delta_text_skips_role_and_empty_frames() {
        assert!(delta_text(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).is_none());
        assert!(delta_text(r#"{"choices":[{"delta":{"content":""}}]}"#).is_none());
        assert!(delta_text("not json").is_none());
    }

    #[test]
    fn body_includes_json_mode() {
        let client = HttpLlmClient::new(
            "https://api.example/v1/",
            "gpt-4o",
            std::time::Duration::from_secs(5),
        )
        .unwrap();
        let body = client.build_body(
            &[LlmMessage::user("hi")],
            &StreamOpts {
                json_mode: true,
                ..Default::default()
            },
            false,
        );
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], false);
    }
}
