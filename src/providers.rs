use std::borrow::Cow;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};

/// Text used for an image message that arrives without any caption.
pub const DEFAULT_IMAGE_PROMPT: &str = "What do you think of this?";

// -- Conversation types -----------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One turn of a conversation as the client and the relay exchange it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(rename = "imageUrl", default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Participant who wrote a user turn in a shared conversation.
    #[serde(rename = "senderName", default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), image_url: None, sender_name: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), image_url: None, sender_name: None }
    }

    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    pub fn with_sender(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }

    /// Content as the model sees it: user turns with a sender read `[name]: content`.
    pub fn attributed_content(&self) -> Cow<'_, str> {
        match self.sender_name.as_deref().map(str::trim) {
            Some(name) if self.role == Role::User && !name.is_empty() => {
                Cow::Owned(format!("[{name}]: {}", self.content))
            }
            _ => Cow::Borrowed(&self.content),
        }
    }

    /// Copy with the sender folded into the content, ready for the relay.
    pub fn to_relay(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.attributed_content().into_owned(),
            image_url: self.image_url.clone(),
            sender_name: None,
        }
    }
}

/// Body of `POST /roleplay-chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(rename = "characterId", default)]
    pub character_id: String,
}

// -- Upstream chat-completion request ---------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamRole {
    System,
    User,
    Assistant,
}

impl From<Role> for UpstreamRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => UpstreamRole::User,
            Role::Assistant => UpstreamRole::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
}

/// One element of a multi-part message, for vision-capable models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageRef },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamMessage {
    pub role: UpstreamRole,
    pub content: MessageContent,
}

impl UpstreamMessage {
    pub fn system(prompt: impl Into<String>) -> Self {
        Self { role: UpstreamRole::System, content: MessageContent::Text(prompt.into()) }
    }
}

impl From<&ChatMessage> for UpstreamMessage {
    /// Messages carrying an image become `[text, image_url]` parts, in that order.
    fn from(msg: &ChatMessage) -> Self {
        let content = match &msg.image_url {
            Some(url) => {
                let text = if msg.content.trim().is_empty() {
                    DEFAULT_IMAGE_PROMPT.to_string()
                } else {
                    msg.attributed_content().into_owned()
                };
                MessageContent::Parts(vec![
                    ContentPart::Text { text },
                    ContentPart::ImageUrl { image_url: ImageRef { url: url.clone() } },
                ])
            }
            None => MessageContent::Text(msg.attributed_content().into_owned()),
        };
        Self { role: msg.role.into(), content }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<UpstreamMessage>,
    pub stream: bool,
}

// -- SSE chunk types --------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    pub delta: ChunkDelta,
    #[allow(dead_code)]
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// One `data:` payload of an OpenAI-compatible chat-completion stream.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    /// `choices[0].delta.content`, when present and non-empty.
    pub fn into_first_content(self) -> Option<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|s| !s.is_empty())
    }
}

// -- Error bodies -----------------------------------------------------------

/// `{"error": ..., "retryAfterSeconds"?: ...}` returned by the relay on failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: String,
    /// Number or numeric string; clients in the wild send both.
    #[serde(rename = "retryAfterSeconds", default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<serde_json::Value>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        Self {
            error: error.into(),
            retry_after_seconds: retry_after_secs.map(serde_json::Value::from),
        }
    }

    /// Positive `retryAfterSeconds`, rounded up to whole seconds.
    pub fn retry_after(&self) -> Option<u64> {
        match self.retry_after_seconds.as_ref()? {
            serde_json::Value::Number(n) => n.as_f64().and_then(positive_secs),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok().and_then(positive_secs),
            _ => None,
        }
    }
}

fn positive_secs(value: f64) -> Option<u64> {
    (value.is_finite() && value > 0.0).then(|| value.ceil() as u64)
}

/// Positive delay-seconds from a `Retry-After` header, rounded up.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .and_then(positive_secs)
}
