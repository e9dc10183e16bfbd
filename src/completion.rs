//! Completion backend client.
//!
//! [`CompletionBackend`] is the network seam: it posts a chat request body
//! and returns the raw JSON response. [`HttpBackend`] implements it with
//! `reqwest` and a bounded timeout. [`CompletionClient`] wraps a backend and
//! does the bookkeeping every stage needs:
//!
//! 1. log the assembled request to the audit log,
//! 2. send it (no retries; failures surface as `CompletionTransport`),
//! 3. log the raw response,
//! 4. record token usage and cost in the ledger,
//! 5. parse the message content as strict JSON and return the designated field.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::CompletionConfig;
use crate::error::{PipelineError, Result};
use crate::prompt::Prompt;
use crate::session::{SessionContext, TokenUsage};

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Sends one chat request body and returns the decoded response body.
    async fn send(&self, body: &Value) -> Result<Value>;
}

/// OpenAI-compatible chat completions endpoint.
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl HttpBackend {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::CompletionTransport(e.to_string()))?;
        let api_key = config.api_key();
        if api_key.is_none() {
            warn!(
                env = %config.api_key_env,
                "no API key in environment; sending unauthenticated requests"
            );
        }
        Ok(Self {
            client,
            url: config.url.clone(),
            api_key,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    async fn send(&self, body: &Value) -> Result<Value> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::CompletionTransport(format!(
                    "request timed out after {}s",
                    self.timeout_secs
                ))
            } else {
                PipelineError::CompletionTransport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(PipelineError::CompletionTransport(format!(
                "backend returned {}: {}",
                status, body_text
            )));
        }

        response.json::<Value>().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::CompletionTransport(format!(
                    "response timed out after {}s",
                    self.timeout_secs
                ))
            } else {
                PipelineError::malformed("backend", format!("response body is not JSON: {}", e))
            }
        })
    }
}

#[derive(Clone)]
pub struct CompletionClient {
    backend: Arc<dyn CompletionBackend>,
    model: String,
    temperature: f64,
}

impl CompletionClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, model: impl Into<String>, temperature: f64) -> Self {
        Self {
            backend,
            model: model.into(),
            temperature,
        }
    }

    pub fn from_config(config: &CompletionConfig) -> Result<Self> {
        let backend = HttpBackend::new(config)?;
        Ok(Self::new(
            Arc::new(backend),
            config.model.clone(),
            config.temperature,
        ))
    }

    /// Runs one accounted completion call and returns the string value of
    /// `field` from the JSON message content.
    pub async fn complete(
        &self,
        ctx: &SessionContext,
        stage: &str,
        prompt: &Prompt,
        field: &str,
    ) -> Result<String> {
        prompt.validate()?;
        let body = prompt.to_request_body(&self.model, self.temperature);
        ctx.audit.record(&format!("{} - request", stage), &body)?;

        debug!(session = %ctx.session_id, stage, "sending completion request");
        let response = self.backend.send(&body).await?;
        ctx.audit.record(stage, &response)?;

        let usage = parse_usage(&response).unwrap_or_else(|| {
            warn!(stage, "completion response carries no usage block");
            TokenUsage::default()
        });
        let entry = ctx.ledger.record(stage, usage)?;
        debug!(
            stage,
            tokens = entry.total_tokens,
            cost = entry.total_cost,
            "completion usage recorded"
        );

        extract_field(&response, stage, field)
    }
}

fn parse_usage(response: &Value) -> Option<TokenUsage> {
    let usage = response.get("usage")?;
    let get = |k: &str| usage.get(k).and_then(|v| v.as_u64()).unwrap_or(0);
    let prompt_tokens = get("prompt_tokens");
    let completion_tokens = get("completion_tokens");
    let total = match usage.get("total_tokens").and_then(|v| v.as_u64()) {
        Some(t) => t,
        None => prompt_tokens + completion_tokens,
    };
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens: total,
    })
}

/// Pulls `choices[0].message.content`, parses it as JSON and returns `field`.
pub fn extract_field(response: &Value, stage: &str, field: &str) -> Result<String> {
    let content = response
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| PipelineError::malformed(stage, "missing choices[0].message.content"))?;

    let parsed: Value = serde_json::from_str(content)
        .map_err(|e| PipelineError::malformed(stage, format!("content is not JSON: {}", e)))?;

    match parsed.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) | None => Err(PipelineError::malformed(
            stage,
            format!("missing field `{}`", field),
        )),
        Some(other) => Ok(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CostRates;
    use serde_json::json;
    use std::sync::Mutex;

    struct FixedBackend {
        reply: Value,
        seen: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl CompletionBackend for FixedBackend {
        async fn send(&self, body: &Value) -> Result<Value> {
            self.seen.lock().unwrap().push(body.clone());
            Ok(self.reply.clone())
        }
    }

    struct DownBackend;

    #[async_trait]
    impl CompletionBackend for DownBackend {
        async fn send(&self, _body: &Value) -> Result<Value> {
            Err(PipelineError::CompletionTransport("connection refused".into()))
        }
    }

    fn reply(content: &str) -> Value {
        json!({
            "choices": [{ "message": { "content": content } }],
            "usage": { "prompt_tokens": 100, "completion_tokens": 20, "total_tokens": 120 }
        })
    }

    fn ctx() -> SessionContext {
        SessionContext::in_memory(
            "s1",
            CostRates {
                input_per_1k: 0.01,
                output_per_1k: 0.03,
            },
        )
    }

    #[tokio::test]
    async fn complete_logs_request_response_and_usage() {
        let backend = Arc::new(FixedBackend {
            reply: reply(r#"{"search": "Lulu at Palm Mall"}"#),
            seen: Mutex::new(Vec::new()),
        });
        let client = CompletionClient::new(backend.clone(), "gpt-4o", 0.3);
        let ctx = ctx();
        let prompt = Prompt::new("sys").text("q");
        let out = client
            .complete(&ctx, "search_term_extractor", &prompt, "search")
            .await
            .unwrap();
        assert_eq!(out, "Lulu at Palm Mall");
        assert_eq!(
            ctx.audit.processes().unwrap(),
            vec!["search_term_extractor - request", "search_term_extractor"]
        );
        let entries = ctx.ledger.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].total_tokens, 120);
        assert_eq!(backend.seen.lock().unwrap()[0]["model"], "gpt-4o");
    }

    #[tokio::test]
    async fn non_json_content_is_malformed() {
        let backend = Arc::new(FixedBackend {
            reply: reply("sure, here you go"),
            seen: Mutex::new(Vec::new()),
        });
        let client = CompletionClient::new(backend, "m", 0.3);
        let err = client
            .complete(&ctx(), "humanizer", &Prompt::new("s").text("q"), "response")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn missing_field_is_malformed() {
        let backend = Arc::new(FixedBackend {
            reply: reply(r#"{"answer": "x"}"#),
            seen: Mutex::new(Vec::new()),
        });
        let client = CompletionClient::new(backend, "m", 0.3);
        let err = client
            .complete(&ctx(), "sql", &Prompt::new("s").text("q"), "query")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "malformed_response");
    }

    #[tokio::test]
    async fn transport_errors_propagate_after_request_is_logged() {
        let client = CompletionClient::new(Arc::new(DownBackend), "m", 0.3);
        let ctx = ctx();
        let err = client
            .complete(&ctx, "stage", &Prompt::new("s").text("q"), "answer")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::CompletionTransport(_)));
        assert_eq!(ctx.audit.processes().unwrap(), vec!["stage - request"]);
        assert!(ctx.ledger.entries().unwrap().is_empty());
    }

    #[test]
    fn non_string_fields_are_rendered() {
        let out = extract_field(&reply(r#"{"answer": 31}"#), "s", "answer").unwrap();
        assert_eq!(out, "31");
    }
}
