//! Provider-agnostic large-model client abstraction.
//!
//! Every model call the engine makes goes through the [`LLMClient`] trait. The
//! engine never speaks a vendor wire format itself: hosts plug in whatever
//! provider implementation they have, and the orchestrator, Narrator, Arbiter
//! and prefetch engine stay oblivious to where the tokens come from.
//!
//! The supporting types describe chat messages and token accounting in a
//! uniform shape. Message content is stored as `Arc<str>` so histories and
//! prompt contexts can be cloned cheaply while a turn is being assembled.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use claudmaster::claudmaster::llm_client::{LLMClient, Message, Role, ScriptedClient};
//!
//! # async {
//! let client = ScriptedClient::new("narrator-model", vec!["The cellar smells of wet stone."]);
//!
//! let response = client
//!     .generate(&[Message {
//!         role: Role::User,
//!         content: Arc::from("Describe the cellar."),
//!     }])
//!     .await
//!     .unwrap();
//!
//! assert!(response.content.contains("cellar"));
//! # };
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Represents the possible roles for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message (the player's utterance, or engine-built prompt text).
    User,
    /// An assistant authored message (model responses).
    Assistant,
}

/// How many tokens were spent on prompt vs. completion?
#[derive(Clone, Debug)]
pub struct TokenUsage {
    /// Number of prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Number of generated/output tokens billed by the provider.
    pub output_tokens: usize,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: usize,
}

/// A generic message to be sent to or received from a model.
#[derive(Clone, Debug)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body. Stored as `Arc<str>` so that prompt assemblies can be
    /// cheaply cloned by the orchestrator and downstream agents.
    pub content: Arc<str>,
}

impl Message {
    /// Convenience constructor.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Arc::from(content.into().as_str()),
        }
    }
}

/// Trait defining the interface to interact with a large-model provider.
///
/// Implementations **must** be thread-safe (`Send + Sync`) so they can be
/// shared between the agent runtime's parallel invocations. Where a provider
/// exposes token accounting information, wrappers should capture it and make
/// it visible via [`LLMClient::last_usage`].
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Send a full request/response style completion.
    ///
    /// The `messages` slice must include any system priming messages the
    /// caller wishes to send. On success the returned [`Message`] carries the
    /// assistant text.
    async fn generate(&self, messages: &[Message]) -> Result<Message, Box<dyn Error + Send + Sync>>;

    /// Return the identifier used to select the upstream model.
    fn model_name(&self) -> &str;

    /// Hook to retrieve usage from the most recent [`LLMClient::generate`] call.
    ///
    /// Implementations that propagate token accounting should override
    /// [`LLMClient::usage_slot`].
    async fn last_usage(&self) -> Option<TokenUsage> {
        if let Some(slot) = self.usage_slot() {
            slot.lock().await.clone()
        } else {
            None
        }
    }

    /// Expose a shared mutable slot where the implementation can persist token
    /// usage. By default clients report no usage data.
    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        None
    }
}

/// Deterministic client that replays a scripted sequence of responses.
///
/// Useful for tests and for offline play where the host supplies canned
/// narration. Once the script is exhausted, every further call returns the
/// fallback line.
pub struct ScriptedClient {
    name: String,
    script: Mutex<VecDeque<String>>,
    fallback: String,
    usage: Mutex<Option<TokenUsage>>,
}

impl ScriptedClient {
    /// Create a client that will answer with `script` entries in order.
    pub fn new(name: impl Into<String>, script: Vec<impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(script.into_iter().map(Into::into).collect()),
            fallback: String::from("..."),
            usage: Mutex::new(None),
        }
    }

    /// Override the line returned after the script runs out.
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }
}

#[async_trait]
impl LLMClient for ScriptedClient {
    async fn generate(&self, messages: &[Message]) -> Result<Message, Box<dyn Error + Send + Sync>> {
        let content = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        // Approximate accounting: one token per 4 characters, the same
        // heuristic the context budgeting uses elsewhere.
        let input: usize = messages.iter().map(|m| m.content.len() / 4).sum();
        let output = content.len() / 4;
        *self.usage.lock().await = Some(TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
        });

        Ok(Message::new(Role::Assistant, content))
    }

    fn model_name(&self) -> &str {
        &self.name
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.usage)
    }
}
