//! Engine event system.
//!
//! A callback-based observability layer for hosts that embed the engine.
//! Implement [`EventHandler`] and attach it to the orchestrator to receive
//! real-time notifications about turn progress, agent degradation,
//! consistency blocks, persistence, recovery, TTS cascades, and prefetch
//! outcomes. The single method has a default no-op implementation, so hosts
//! only override what they care about; the handler is wrapped in
//! `Arc<dyn EventHandler>` and shared across the runtime, party server and
//! TTS router.
//!
//! Logging stays on the `log` macros; events exist for hosts that want
//! structured hooks (UI progress, metrics) rather than text.

use crate::claudmaster::consistency::Severity;
use crate::claudmaster::intent::IntentType;
use async_trait::async_trait;
use std::sync::Arc;

/// Events emitted across a turn's life and the engine's background surfaces.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A queued action entered the pipeline.
    TurnStarted {
        session_id: String,
        action_id: String,
        intent: IntentType,
    },
    /// An agent finished inside budget.
    AgentCompleted {
        session_id: String,
        agent: String,
        latency_ms: u64,
    },
    /// An agent timed out or errored; the turn continued without it.
    AgentDegraded {
        session_id: String,
        agent: String,
        reason: String,
    },
    /// The consistency gate rejected the turn.
    ConsistencyBlocked {
        session_id: String,
        action_id: String,
        contradictions: usize,
    },
    /// The consistency gate annotated the turn without blocking.
    ConsistencyFlagged {
        session_id: String,
        severity: Severity,
        count: usize,
    },
    /// A turn fully resolved and persisted.
    TurnCompleted {
        session_id: String,
        action_id: String,
        degraded: bool,
        duration_ms: u64,
    },
    /// A snapshot was committed.
    SnapshotWritten {
        session_id: String,
        turn_counter: u64,
    },
    /// Resume found a damaged snapshot and fell back to an earlier one.
    RecoveryPerformed {
        session_id: String,
        rolled_back_to: u64,
    },
    /// A TTS tier failed and the router moved on.
    TtsCascaded {
        stream_id: String,
        from_tier: String,
        to_tier: String,
    },
    /// Every TTS engine failed; text-only delivery.
    TtsExhausted { stream_id: String },
    /// A prefetched variant matched the real outcome.
    PrefetchHit { session_id: String, tag: String },
    /// No variant matched; generation fell back to on-demand.
    PrefetchMiss { session_id: String },
    /// A participant connected or dropped.
    ParticipantConnected { participant_id: String },
    ParticipantDisconnected { participant_id: String, reason: String },
}

/// Host-implemented observer. All methods default to no-ops.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, _event: &EngineEvent) {}
}

/// Shared handle used throughout the engine; `None` costs nothing.
pub type SharedEventHandler = Option<Arc<dyn EventHandler>>;

/// Emit to an optional handler without cluttering call sites.
pub async fn emit(handler: &SharedEventHandler, event: EngineEvent) {
    if let Some(handler) = handler {
        handler.on_event(&event).await;
    }
}
