//! Agent contracts and the typed turn payloads they exchange.
//!
//! An agent is a capability consumer plugged into the orchestrator: the
//! Narrator voices the world, the Archivist answers deterministic state
//! queries, the Arbiter adjudicates rules, the Module Keeper surfaces
//! adventure-module context. Agents never see each other directly; the
//! runtime hands each one an [`AgentRequest`] plus an [`AgentContext`] with
//! read-only views of the world, and collects an [`AgentResponse`].
//!
//! Execution results are a closed sum ([`AgentOutcome`]) rather than
//! exceptions crossing task boundaries: an agent either completed, degraded
//! (timeout or error, with whatever partial output survived), was cancelled,
//! or failed outright. The orchestrator aggregates whatever arrived and keeps
//! the turn moving.

use crate::claudmaster::facts::FactStore;
use crate::claudmaster::intent::PlayerIntent;
use crate::claudmaster::knowledge::KnowledgeTracker;
use crate::claudmaster::session::SessionSettings;
use crate::claudmaster::storage::EntityCategory;
use crate::claudmaster::timeline::Timeline;
use crate::claudmaster::tools::StoreReader;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};

/// Who may see a piece of output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Everyone connected, including observers.
    Public,
    /// Every party member, but not observers.
    Party,
    /// Exactly one participant.
    Private(String),
    /// The DM alone.
    DmOnly,
}

/// One proposed mutation of an externally stored entity field.
///
/// Deltas are the only way agents change the world. They are applied in
/// declared agent priority order during aggregation; two deltas on the same
/// `(category, entity_id, field)` conflict and the higher-priority agent
/// wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    /// Which campaign file the entity lives in.
    pub category: EntityCategory,
    /// Entity id within the category.
    pub entity_id: String,
    /// Dotted field path, e.g. `"hp.current"`.
    pub field: String,
    /// New value for the field.
    pub value: serde_json::Value,
}

impl StateDelta {
    pub fn new(
        category: EntityCategory,
        entity_id: impl Into<String>,
        field: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            category,
            entity_id: entity_id.into(),
            field: field.into(),
            value,
        }
    }

    /// Conflict key: two deltas clash when this triple matches.
    pub fn conflict_key(&self) -> (EntityCategory, &str, &str) {
        (self.category, &self.entity_id, &self.field)
    }
}

/// A resolved dice roll attached to a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiceRoll {
    /// Dice notation, e.g. `"2d6+3"`.
    pub notation: String,
    /// What the roll was for, shown to players.
    pub label: String,
    /// Individual die results.
    pub rolls: Vec<i32>,
    /// Total after modifiers.
    pub total: i32,
}

/// The request handed to every agent participating in a turn.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Unique per turn; the runtime guarantees at-most-once delivery of a
    /// given request id to a given agent.
    pub request_id: String,
    pub session_id: String,
    /// The acting participant, when party mode is on.
    pub actor_id: Option<String>,
    /// The raw player utterance.
    pub text: String,
    /// Classifier output for this turn.
    pub intent: PlayerIntent,
}

/// What one agent produced for one turn.
#[derive(Debug, Clone, Default)]
pub struct AgentResponse {
    /// Name of the producing agent.
    pub agent_name: String,
    /// Narrative or answer text, when the agent speaks.
    pub text: Option<String>,
    /// Proposed state mutations, applied during aggregation.
    pub state_deltas: Vec<StateDelta>,
    /// Dice rolled while producing this response.
    pub dice_rolls: Vec<DiceRoll>,
    /// Who may see `text`.
    pub visibility: Option<Visibility>,
    /// Prompt context for downstream agents (Module Keeper output); never
    /// rendered to players.
    pub prompt_context: Option<String>,
    /// Adjudication reasoning (Arbiter); DM-only by default.
    pub rationale: Option<String>,
    /// Non-fatal problems hit along the way.
    pub errors: Vec<String>,
    /// Wall-clock cost of the invocation.
    pub latency_ms: u64,
}

impl AgentResponse {
    pub fn from_agent(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            ..Self::default()
        }
    }

    /// Attach response text with a visibility scope (builder pattern).
    pub fn with_text(mut self, text: impl Into<String>, visibility: Visibility) -> Self {
        self.text = Some(text.into());
        self.visibility = Some(visibility);
        self
    }

    /// Attach a proposed state delta (builder pattern).
    pub fn with_delta(mut self, delta: StateDelta) -> Self {
        self.state_deltas.push(delta);
        self
    }
}

/// Typed execution outcome; the runtime never lets agent errors escape as
/// panics or cross-task exceptions.
#[derive(Debug, Clone)]
pub enum AgentOutcome {
    /// The agent completed inside its budget.
    Ok(AgentResponse),
    /// The agent timed out or errored; whatever partial output the sink
    /// buffered is carried along and the turn continues.
    Degraded(AgentResponse),
    /// Cancellation was observed before completion.
    Cancelled,
    /// The agent could not run at all (missing capability, poisoned state).
    Failed(String),
}

impl AgentOutcome {
    /// The response carried by `Ok` or `Degraded` outcomes.
    pub fn response(&self) -> Option<&AgentResponse> {
        match self {
            AgentOutcome::Ok(r) | AgentOutcome::Degraded(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, AgentOutcome::Degraded(_))
    }
}

/// Error type agents return from [`Agent::invoke`].
#[derive(Debug, Clone)]
pub struct AgentError(pub String);

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Agent error: {}", self.0)
    }
}

impl Error for AgentError {}

impl From<Box<dyn Error + Send + Sync>> for AgentError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        AgentError(e.to_string())
    }
}

/// Retry discipline declared by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Never retry.
    None,
    /// Retry only agents that declare no side effects.
    NonIdempotentOnly,
    /// Deliver a given request id at most once, ever.
    AtMostOnce,
}

/// Whether an agent's deltas land before or after narrative text wraps them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// State-delta producers (Archivist, Arbiter, consistency): apply first.
    Ledger,
    /// Narrative producers (Narrator): wrap the result.
    Voice,
    /// Context producers (Module Keeper): injected as prompt context only.
    Context,
}

/// Static declaration an agent registers with the runtime.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    /// Unique registry name, e.g. `"narrator"`.
    pub name: String,
    /// Capability labels used by routing tables.
    pub capabilities: Vec<String>,
    /// Conflict-resolution priority; higher wins on clashing deltas.
    pub priority: i32,
    /// Per-invocation budget.
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    /// Whether invoking the agent mutates anything outside its response.
    pub side_effects: bool,
    pub kind: AgentKind,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, kind: AgentKind) -> Self {
        Self {
            name: name.into(),
            capabilities: Vec::new(),
            priority: 0,
            timeout_ms: 30_000,
            retry_policy: RetryPolicy::None,
            side_effects: false,
            kind,
        }
    }

    pub fn with_capability(mut self, cap: impl Into<String>) -> Self {
        self.capabilities.push(cap.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_side_effects(mut self) -> Self {
        self.side_effects = true;
        self
    }
}

/// Cooperative cancellation handle.
///
/// Cloneable; the runtime flips the source when a turn is cancelled and every
/// agent holding a token observes it at its next suspension point.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// The owning side of a [`CancelToken`].
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelToken { rx })
    }

    /// Signal cancellation to every token clone.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// Non-blocking check.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is signalled.
    pub async fn cancelled(&mut self) {
        // Already cancelled: return immediately.
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
        // Sender dropped without cancelling: treat as never-cancelled and
        // park forever; the runtime's timeout wins.
        std::future::pending::<()>().await;
    }
}

/// Sink through which an agent may stream partial results.
///
/// The runtime buffers everything sent here until turn aggregation; partial
/// text is only used when the agent degrades mid-stream, so whole turns stay
/// atomic even when the underlying engine streams.
#[derive(Debug, Clone)]
pub struct PartialSink {
    tx: mpsc::UnboundedSender<String>,
}

impl PartialSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Push a partial fragment; silently dropped after the turn closes.
    pub fn push(&self, fragment: impl Into<String>) {
        let _ = self.tx.send(fragment.into());
    }
}

/// Read-only world views handed to every agent invocation.
///
/// The runtime guarantees no agent observes a partially applied turn: the
/// locks here are only released to agents between turns.
#[derive(Clone)]
pub struct AgentContext {
    pub facts: Arc<RwLock<FactStore>>,
    pub knowledge: Arc<RwLock<KnowledgeTracker>>,
    pub timeline: Arc<RwLock<Timeline>>,
    pub store: Arc<dyn StoreReader>,
    pub settings: SessionSettings,
    /// Module Keeper output for this turn, present once it has run.
    pub module_context: Option<Arc<str>>,
    pub cancel: CancelToken,
    pub sink: PartialSink,
}

/// The capability contract every agent implements.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Static registration data; must be stable across calls.
    fn descriptor(&self) -> &AgentDescriptor;

    /// Process one turn request. Errors degrade the agent, never the turn.
    async fn invoke(
        &self,
        request: &AgentRequest,
        context: &AgentContext,
    ) -> Result<AgentResponse, AgentError>;
}
