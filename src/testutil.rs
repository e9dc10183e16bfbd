//! Scripted completion backend for unit tests.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::completion::{CompletionBackend, CompletionClient};
use crate::config::{parse_config, Config};
use crate::error::Result;
use crate::session::{CostRates, SessionContext};

type Responder = Box<dyn Fn(&Value) -> String + Send + Sync>;

/// Answers every request with the JSON content produced by `responder`.
pub struct ScriptedBackend {
    responder: Responder,
    pub requests: Mutex<Vec<Value>>,
}

impl ScriptedBackend {
    pub fn new(responder: impl Fn(&Value) -> String + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn send(&self, body: &Value) -> Result<Value> {
        self.requests.lock().unwrap().push(body.clone());
        let content = (self.responder)(body);
        Ok(json!({
            "choices": [{ "message": { "content": content } }],
            "usage": { "prompt_tokens": 1000, "completion_tokens": 100, "total_tokens": 1100 }
        }))
    }
}

pub fn client(backend: std::sync::Arc<ScriptedBackend>) -> CompletionClient {
    CompletionClient::new(backend, "test-model", 0.3)
}

pub fn ctx() -> SessionContext {
    SessionContext::in_memory(
        "test-session",
        CostRates {
            input_per_1k: 0.01,
            output_per_1k: 0.03,
        },
    )
}

/// Text of the final user turn of a request body.
pub fn last_user_text(body: &Value) -> String {
    let messages = body["messages"].as_array().cloned().unwrap_or_default();
    let last = messages.last().cloned().unwrap_or(Value::Null);
    match &last["content"] {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

pub fn config() -> Config {
    parse_config(
        r#"
[completion]
url = "http://127.0.0.1:9/v1/chat/completions"
model = "test-model"
"#,
    )
    .unwrap()
}
