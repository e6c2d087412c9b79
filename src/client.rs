//! Client side of the relay: issues the chat request and hands back a delta stream.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::consumer::{self, DeltaStream};
use crate::error::{RelayError, Result, UNAVAILABLE_MESSAGE};
use crate::providers::{parse_retry_after, ChatMessage, ErrorBody, RelayRequest};

pub struct RelayClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl RelayClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// POST the conversation to the relay and open its event stream.
    ///
    /// # Errors
    /// - [`RelayError::UpstreamRateLimited`] on 429, always carrying a cooldown
    /// - [`RelayError::UpstreamQuotaExhausted`] on 402
    /// - [`RelayError::UpstreamUnavailable`] on any other non-success status
    /// - [`RelayError::Network`] when the relay cannot be reached
    pub async fn open_stream(
        &self,
        messages: &[ChatMessage],
        character_id: &str,
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        let body = RelayRequest {
            messages: messages.iter().map(ChatMessage::to_relay).collect(),
            character_id: character_id.to_string(),
        };

        let mut request = self.http.post(&self.config.endpoint).json(&body);
        if let Some(credential) = &self.config.credential {
            request = request.bearer_auth(credential);
        }

        debug!(character_id, messages = messages.len(), "sending relay request");
        let response = request.send().await?;

        if !response.status().is_success() {
            let err = error_from_response(response, self.config.default_cooldown()).await;
            warn!(error = %err, "relay request failed");
            return Err(err);
        }

        Ok(consumer::from_response(response, cancel, self.config.read_timeout()))
    }
}

/// Translate a non-success relay response into a typed error.
pub async fn error_from_response(response: reqwest::Response, default_cooldown: Duration) -> RelayError {
    let status = response.status().as_u16();
    let header_secs = parse_retry_after(response.headers());
    let body = response.json::<ErrorBody>().await.unwrap_or_default();
    classify_status(status, header_secs, &body, default_cooldown)
}

/// Status plus retry hints to error. For 429 the cooldown is taken from the
/// `Retry-After` header, then the body's `retryAfterSeconds`, then the default.
pub fn classify_status(
    status: u16,
    header_secs: Option<u64>,
    body: &ErrorBody,
    default_cooldown: Duration,
) -> RelayError {
    match status {
        429 => {
            let secs = header_secs
                .or_else(|| body.retry_after())
                .unwrap_or_else(|| default_cooldown.as_secs());
            RelayError::UpstreamRateLimited { retry_after_secs: Some(secs) }
        }
        402 => RelayError::UpstreamQuotaExhausted,
        _ => RelayError::UpstreamUnavailable {
            status,
            message: if body.error.is_empty() {
                UNAVAILABLE_MESSAGE.to_string()
            } else {
                body.error.clone()
            },
        },
    }
}

/// Refuses re-sends until a rate-limit cooldown has elapsed.
#[derive(Debug, Default, Clone)]
pub struct Cooldown {
    until: Option<Instant>,
}

impl Cooldown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, duration: Duration) {
        let until = Instant::now() + duration;
        // A shorter hint never shortens an active cooldown.
        self.until = Some(self.until.map_or(until, |current| current.max(until)));
    }

    /// Arm from an error when it carries a retry hint.
    pub fn arm_from(&mut self, err: &RelayError) {
        if let RelayError::UpstreamRateLimited { retry_after_secs: Some(secs) } = err {
            self.arm(Duration::from_secs(*secs));
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }

    pub fn check(&self) -> Result<()> {
        match self.remaining() {
            Some(left) => Err(RelayError::CoolingDown {
                remaining_secs: left.as_secs() + u64::from(left.subsec_nanos() > 0),
            }),
            None => Ok(()),
        }
    }
}
