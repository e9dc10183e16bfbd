//! Structured prompts for the completion backend.
//!
//! A [`Prompt`] is assembled by each stage and turned into the chat request
//! body by [`Prompt::to_request_body`]. Keeping it a plain value lets stages
//! be tested for prompt construction without a live backend.

use serde_json::{json, Value};

use crate::error::{PipelineError, Result};

/// One part of the user turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    /// `data:` URL or remote URL of an image.
    ImageUrl(String),
}

/// A few-shot example: user input and the assistant reply it should produce.
#[derive(Debug, Clone, PartialEq)]
pub struct FewShot {
    pub user: String,
    pub assistant: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub few_shots: Vec<FewShot>,
    pub user: Vec<ContentPart>,
}

impl Prompt {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            ..Default::default()
        }
    }

    pub fn few_shot(mut self, user: impl Into<String>, assistant: impl Into<String>) -> Self {
        self.few_shots.push(FewShot {
            user: user.into(),
            assistant: assistant.into(),
        });
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.user.push(ContentPart::Text(text.into()));
        self
    }

    pub fn image(mut self, url: impl Into<String>) -> Self {
        self.user.push(ContentPart::ImageUrl(url.into()));
        self
    }

    pub fn images<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.user
            .extend(urls.into_iter().map(|u| ContentPart::ImageUrl(u.into())));
        self
    }

    pub fn has_images(&self) -> bool {
        self.user
            .iter()
            .any(|p| matches!(p, ContentPart::ImageUrl(_)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.system.trim().is_empty() {
            return Err(PipelineError::InvalidPrompt(
                "system prompt must not be empty".to_string(),
            ));
        }
        let has_text = self
            .user
            .iter()
            .any(|p| matches!(p, ContentPart::Text(t) if !t.trim().is_empty()));
        if !has_text {
            return Err(PipelineError::InvalidPrompt(
                "user content must contain text".to_string(),
            ));
        }
        for part in &self.user {
            if let ContentPart::ImageUrl(url) = part {
                if !(url.starts_with("data:image/")
                    || url.starts_with("https://")
                    || url.starts_with("http://"))
                {
                    return Err(PipelineError::InvalidPrompt(format!(
                        "unsupported image url: {}",
                        truncate(url, 40)
                    )));
                }
            }
        }
        for shot in &self.few_shots {
            if shot.user.trim().is_empty() || shot.assistant.trim().is_empty() {
                return Err(PipelineError::InvalidPrompt(
                    "few-shot pairs must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Chat messages: system, then alternating few-shot user/assistant turns,
    /// then the user turn. A text-only user turn is sent as a plain string.
    pub fn to_messages(&self) -> Vec<Value> {
        let mut messages = Vec::with_capacity(2 + self.few_shots.len() * 2);
        messages.push(json!({ "role": "system", "content": self.system }));
        for shot in &self.few_shots {
            messages.push(json!({ "role": "user", "content": shot.user }));
            messages.push(json!({ "role": "assistant", "content": shot.assistant }));
        }
        let content = if self.has_images() {
            Value::Array(
                self.user
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text(t) => json!({ "type": "text", "text": t }),
                        ContentPart::ImageUrl(u) => {
                            json!({ "type": "image_url", "image_url": { "url": u } })
                        }
                    })
                    .collect(),
            )
        } else {
            let joined = self
                .user
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text(t) => Some(t.as_str()),
                    ContentPart::ImageUrl(_) => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            Value::String(joined)
        };
        messages.push(json!({ "role": "user", "content": content }));
        messages
    }

    pub fn to_request_body(&self, model: &str, temperature: f64) -> Value {
        json!({
            "model": model,
            "temperature": temperature,
            "response_format": { "type": "json_object" },
            "messages": self.to_messages(),
        })
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push_str("...");
        out
    }
}
