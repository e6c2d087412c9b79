//! The relay core: one chat request in, one upstream forward out.
//!
//! ## Flow
//! 1. resolve the persona and compose its system prompt
//! 2. map messages, expanding image attachments into multi-part content
//! 3. check the upstream credential (fail before any network call)
//! 4. POST `{model, messages, stream: true}` upstream
//! 5. translate failures, or hand the live response back for pass-through
//!
//! [`Relay`] holds no per-request state. It is cheap to clone and shared by every
//! connection the web server accepts. It never retries.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::characters;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result, MISSING_KEY_MESSAGE, UNAVAILABLE_MESSAGE};
use crate::providers::{parse_retry_after, ChatCompletionRequest, RelayRequest, UpstreamMessage};

/// Longest slice of an upstream error body that makes it into the logs.
const MAX_LOGGED_ERROR_BODY: usize = 512;

#[derive(Clone)]
pub struct Relay {
    http: reqwest::Client,
    config: Arc<RelayConfig>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self { http, config: Arc::new(config) })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout()
    }

    /// Build the upstream request body for `request`.
    pub fn prepare(&self, request: &RelayRequest) -> Result<ChatCompletionRequest> {
        if request.messages.is_empty() {
            return Err(RelayError::BadRequest("messages must not be empty".to_string()));
        }

        let persona = characters::resolve(&request.character_id);
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(UpstreamMessage::system(characters::system_prompt(persona)));
        messages.extend(request.messages.iter().map(UpstreamMessage::from));

        Ok(ChatCompletionRequest {
            model: self.config.model.clone(),
            messages,
            stream: true,
        })
    }

    /// Forward `request` upstream and return the streaming response untouched.
    pub async fn forward(&self, request: &RelayRequest) -> Result<reqwest::Response> {
        let body = self.prepare(request)?;
        let Some(api_key) = self.config.api_key() else {
            error!("refusing to forward: {MISSING_KEY_MESSAGE}");
            return Err(RelayError::Configuration(MISSING_KEY_MESSAGE.to_string()));
        };
        let persona = characters::resolve(&request.character_id);
        info!(
            character_id = %request.character_id,
            persona = persona.id,
            messages = request.messages.len(),
            model = %self.config.model,
            "forwarding chat request upstream"
        );

        let send = self
            .http
            .post(&self.config.upstream_url)
            .bearer_auth(api_key)
            .json(&body)
            .send();

        let response = match tokio::time::timeout(self.config.request_timeout(), send).await {
            Err(_) => {
                warn!(timeout = ?self.config.request_timeout(), "upstream did not answer in time");
                return Err(RelayError::Timeout(self.config.request_timeout()));
            }
            Ok(Err(e)) => {
                warn!(error = %e, "upstream request failed");
                return Err(e.into());
            }
            Ok(Ok(response)) => response,
        };

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }
        Ok(response)
    }
}

/// Map a non-success upstream response onto the relay's stable error set.
async fn upstream_error(response: reqwest::Response) -> RelayError {
    let status = response.status().as_u16();
    match status {
        429 => {
            let retry_after_secs = parse_retry_after(response.headers());
            warn!(status, ?retry_after_secs, "upstream rate limited");
            RelayError::UpstreamRateLimited { retry_after_secs }
        }
        402 => {
            warn!(status, "upstream quota exhausted");
            RelayError::UpstreamQuotaExhausted
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            error!(status, body = %truncate(&body, MAX_LOGGED_ERROR_BODY), "AI gateway error");
            RelayError::UpstreamUnavailable {
                status,
                message: UNAVAILABLE_MESSAGE.to_string(),
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
