//! Per-conversation chat session.
//!
//! A [`ChatSession`] owns the local history of one conversation and runs one
//! exchange at a time against the relay:
//!
//! ```text
//! Idle -> Sending -> Streaming -> Completed
//!                  \           \-> Failed
//!                   \-> Failed
//! ```
//!
//! Sending a fresh message and regenerating after an edit both go through the
//! same exchange routine. A failed or cancelled exchange commits nothing: the
//! history keeps the user message and gains no partial assistant reply.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{Cooldown, RelayClient};
use crate::consumer;
use crate::error::{RelayError, Result};
use crate::providers::{ChatMessage, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Sending,
    Streaming,
    Completed,
    Failed,
}

/// A message as the store keeps it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub key: String,
    pub role: Role,
    pub sender_name: Option<String>,
    pub content: String,
}

/// Message history persistence, keyed by conversation.
pub trait MessageStore: Send + Sync {
    /// Append a message and return its key.
    fn append(
        &self,
        conversation: &str,
        role: Role,
        sender_name: Option<&str>,
        content: &str,
    ) -> impl Future<Output = Result<String>> + Send;

    /// All messages of `conversation`, oldest first.
    fn list(&self, conversation: &str) -> impl Future<Output = Result<Vec<StoredMessage>>> + Send;

    fn delete(&self, conversation: &str, keys: &[String]) -> impl Future<Output = Result<()>> + Send;

    fn clear(&self, conversation: &str) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    conversations: RwLock<HashMap<String, Vec<StoredMessage>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for InMemoryMessageStore {
    async fn append(
        &self,
        conversation: &str,
        role: Role,
        sender_name: Option<&str>,
        content: &str,
    ) -> Result<String> {
        let key = uuid::Uuid::new_v4().to_string();
        self.conversations
            .write()
            .await
            .entry(conversation.to_string())
            .or_default()
            .push(StoredMessage {
                key: key.clone(),
                role,
                sender_name: sender_name.map(str::to_string),
                content: content.to_string(),
            });
        Ok(key)
    }

    async fn list(&self, conversation: &str) -> Result<Vec<StoredMessage>> {
        Ok(self
            .conversations
            .read()
            .await
            .get(conversation)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete(&self, conversation: &str, keys: &[String]) -> Result<()> {
        if let Some(messages) = self.conversations.write().await.get_mut(conversation) {
            messages.retain(|m| !keys.contains(&m.key));
        }
        Ok(())
    }

    async fn clear(&self, conversation: &str) -> Result<()> {
        self.conversations.write().await.remove(conversation);
        Ok(())
    }
}

/// Stored form of a user message: the image reference rides along in the text.
fn stored_text(content: &str, image_url: Option<&str>) -> String {
    match image_url {
        Some(url) => format!("{content}\n[Image: {url}]"),
        None => content.to_string(),
    }
}

#[derive(Debug, Clone)]
struct Entry {
    key: String,
    message: ChatMessage,
}

#[derive(Debug)]
struct Inner {
    history: Vec<Entry>,
    state: ExchangeState,
    cooldown: Cooldown,
}

/// Resets the busy flag when the exchange ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ChatSession<S: MessageStore> {
    client: RelayClient,
    store: Arc<S>,
    conversation_id: String,
    character_id: String,
    sender_name: Option<String>,
    inner: Mutex<Inner>,
    busy: AtomicBool,
    cancel: std::sync::Mutex<CancellationToken>,
}

impl<S: MessageStore> ChatSession<S> {
    pub fn new(
        client: RelayClient,
        store: Arc<S>,
        conversation_id: impl Into<String>,
        character_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            store,
            conversation_id: conversation_id.into(),
            character_id: character_id.into(),
            sender_name: None,
            inner: Mutex::new(Inner {
                history: Vec::new(),
                state: ExchangeState::Idle,
                cooldown: Cooldown::new(),
            }),
            busy: AtomicBool::new(false),
            cancel: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    /// Attribute every user message sent from this session to `name`.
    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into()).filter(|n: &String| !n.trim().is_empty());
        self
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn character_id(&self) -> &str {
        &self.character_id
    }

    /// True while an exchange is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub async fn state(&self) -> ExchangeState {
        self.inner.lock().await.state
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.inner.lock().await.history.iter().map(|e| e.message.clone()).collect()
    }

    /// Abort the exchange in flight, if any.
    pub fn cancel(&self) {
        if !self.is_busy() {
            return;
        }
        if let Ok(token) = self.cancel.lock() {
            token.cancel();
        }
    }

    /// Replace the local history with what the store holds.
    pub async fn load(&self) -> Result<usize> {
        let stored = self.store.list(&self.conversation_id).await?;
        let history: Vec<Entry> = stored
            .into_iter()
            .map(|m| Entry {
                key: m.key,
                message: ChatMessage {
                    role: m.role,
                    content: m.content,
                    image_url: None,
                    sender_name: m.sender_name,
                },
            })
            .collect();
        let count = history.len();
        let mut inner = self.inner.lock().await;
        inner.history = history;
        inner.state = ExchangeState::Idle;
        debug!(conversation = %self.conversation_id, count, "history loaded");
        Ok(count)
    }

    /// Send a new user message and stream the reply through `on_delta`.
    ///
    /// Returns the complete assistant reply.
    pub async fn send_message<F>(&self, content: &str, image_url: Option<&str>, on_delta: F) -> Result<String>
    where
        F: FnMut(&str),
    {
        let _busy = self.acquire()?;
        self.check_cooldown().await?;

        if content.trim().is_empty() && image_url.is_none() {
            return Err(RelayError::BadRequest("message is empty".to_string()));
        }

        let key = self
            .store
            .append(
                &self.conversation_id,
                Role::User,
                self.sender_name.as_deref(),
                &stored_text(content, image_url),
            )
            .await?;
        let mut message = ChatMessage::user(content);
        if let Some(url) = image_url {
            message = message.with_image(url);
        }
        if let Some(name) = &self.sender_name {
            message = message.with_sender(name.as_str());
        }

        let history = {
            let mut inner = self.inner.lock().await;
            inner.history.push(Entry { key, message });
            inner.history.iter().map(|e| e.message.clone()).collect::<Vec<_>>()
        };

        self.run_exchange(history, on_delta).await
    }

    /// Replace the user message at `index` and regenerate everything after it.
    pub async fn edit_message<F>(&self, index: usize, new_content: &str, on_delta: F) -> Result<String>
    where
        F: FnMut(&str),
    {
        let _busy = self.acquire()?;
        self.check_cooldown().await?;

        let (original, dropped_keys) = {
            let inner = self.inner.lock().await;
            let entry = inner
                .history
                .get(index)
                .ok_or_else(|| RelayError::BadRequest(format!("no message at index {index}")))?;
            if entry.message.role != Role::User {
                return Err(RelayError::BadRequest("only user messages can be edited".to_string()));
            }
            let keys: Vec<String> = inner.history[index..].iter().map(|e| e.key.clone()).collect();
            (entry.message.clone(), keys)
        };

        self.store.delete(&self.conversation_id, &dropped_keys).await?;

        let edited = ChatMessage { content: new_content.to_string(), ..original };
        let key = self
            .store
            .append(
                &self.conversation_id,
                Role::User,
                edited.sender_name.as_deref(),
                &stored_text(&edited.content, edited.image_url.as_deref()),
            )
            .await?;

        let history = {
            let mut inner = self.inner.lock().await;
            inner.history.truncate(index);
            inner.history.push(Entry { key, message: edited });
            inner.history.iter().map(|e| e.message.clone()).collect::<Vec<_>>()
        };
        info!(
            conversation = %self.conversation_id,
            index,
            dropped = dropped_keys.len(),
            "regenerating from edited message"
        );

        self.run_exchange(history, on_delta).await
    }

    /// Re-run the exchange for a trailing user message that never got a reply.
    pub async fn retry_last<F>(&self, on_delta: F) -> Result<String>
    where
        F: FnMut(&str),
    {
        let _busy = self.acquire()?;
        self.check_cooldown().await?;

        let history = {
            let inner = self.inner.lock().await;
            match inner.history.last() {
                Some(e) if e.message.role == Role::User => {}
                _ => return Err(RelayError::BadRequest("nothing to retry".to_string())),
            }
            inner.history.iter().map(|e| e.message.clone()).collect::<Vec<_>>()
        };

        self.run_exchange(history, on_delta).await
    }

    /// Drop every message of this conversation, locally and in the store.
    pub async fn clear(&self) -> Result<()> {
        let _busy = self.acquire()?;
        self.store.clear(&self.conversation_id).await?;
        let mut inner = self.inner.lock().await;
        inner.history.clear();
        inner.state = ExchangeState::Idle;
        Ok(())
    }

    fn acquire(&self) -> Result<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RelayError::Busy)?;
        Ok(BusyGuard(&self.busy))
    }

    /// Install a fresh token for the exchange about to start and return it.
    fn arm_token(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        match self.cancel.lock() {
            Ok(mut token) => *token = fresh.clone(),
            Err(poisoned) => *poisoned.into_inner() = fresh.clone(),
        }
        fresh
    }

    async fn check_cooldown(&self) -> Result<()> {
        self.inner.lock().await.cooldown.check()
    }

    async fn set_state(&self, state: ExchangeState) {
        self.inner.lock().await.state = state;
    }

    #[cfg(test)]
    fn current_token(&self) -> CancellationToken {
        match self.cancel.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn run_exchange<F>(&self, history: Vec<ChatMessage>, on_delta: F) -> Result<String>
    where
        F: FnMut(&str),
    {
        let cancel = self.arm_token();
        self.set_state(ExchangeState::Sending).await;

        let outcome = self.stream_reply(&history, cancel.clone(), on_delta).await;
        let outcome = match outcome {
            Ok(_) if cancel.is_cancelled() => Err(RelayError::Cancelled),
            other => other,
        };

        match outcome {
            Ok(content) => {
                let key = if content.is_empty() {
                    None
                } else {
                    Some(
                        self.store
                            .append(&self.conversation_id, Role::Assistant, None, &content)
                            .await?,
                    )
                };
                let mut inner = self.inner.lock().await;
                if let Some(key) = key {
                    inner.history.push(Entry { key, message: ChatMessage::assistant(content.clone()) });
                }
                inner.state = ExchangeState::Completed;
                debug!(conversation = %self.conversation_id, chars = content.len(), "exchange completed");
                Ok(content)
            }
            Err(err) => {
                let mut inner = self.inner.lock().await;
                inner.cooldown.arm_from(&err);
                inner.state = ExchangeState::Failed;
                warn!(conversation = %self.conversation_id, error = %err, "exchange failed");
                Err(err)
            }
        }
    }

    async fn stream_reply<F>(&self, history: &[ChatMessage], cancel: CancellationToken, on_delta: F) -> Result<String>
    where
        F: FnMut(&str),
    {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            opened = self.client.open_stream(history, &self.character_id, cancel.clone()) => opened?,
        };
        self.set_state(ExchangeState::Streaming).await;
        consumer::collect_text(stream, on_delta).await
    }
}
