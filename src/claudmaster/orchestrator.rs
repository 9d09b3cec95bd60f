//! The game loop: classify, route, execute, aggregate, gate, persist, deliver.
//!
//! One `Orchestrator` serves one campaign root and is constructable as many
//! times as tests need, each with its own storage. Sessions are cooperative
//! actors: all mutation of a session's world state happens inside
//! [`Orchestrator::process_next`], one queued action at a time, strictly in
//! submission order. Agents only ever see read views, so no agent observes a
//! partially applied turn.
//!
//! Pipeline per turn:
//!
//! 1. **Classify.** Deterministic intent labeling; never blocks, never fails.
//! 2. **Route.** The session's routing table maps the intent to staged agent
//!    sets; unregistered agents are dropped from the plan with a warning.
//! 3. **Execute.** The runtime forks each stage, enforcing per-agent timeouts
//!    and the turn budget; failures degrade, they never abort.
//! 4. **Aggregate.** Ledger deltas merge first (priority wins conflicts, the
//!    loser lands in `conflicts`), voice text wraps the result, context
//!    output is injected into later stages as prompt context.
//! 5. **Consistency gate.** Blocking contradictions abort with no state
//!    persisted; warnings record a fact and annotate the result.
//! 6. **Persist.** Deltas write through split storage; the action history and
//!    timeline advance; auto-save cadence may snapshot.
//! 7. **Filter and deliver.** The scoped payload goes to the party server
//!    (and optionally to TTS) for per-role projection.

use crate::claudmaster::agent::{
    Agent, AgentContext, AgentKind, AgentOutcome, AgentRequest, CancelSource, DiceRoll,
    PartialSink, StateDelta, Visibility,
};
use crate::claudmaster::config::EngineConfig;
use crate::claudmaster::consistency::{ContradictionChecker, ContradictionReport};
use crate::claudmaster::event::{emit, EngineEvent, SharedEventHandler};
use crate::claudmaster::facts::{Fact, FactCategory, FactStore};
use crate::claudmaster::intent::{IntentClassifier, IntentType, PlayerIntent};
use crate::claudmaster::knowledge::KnowledgeTracker;
use crate::claudmaster::output_filter::ScopedPayload;
use crate::claudmaster::party::protocol::{ActionStatus, PartyResponse};
use crate::claudmaster::party::server::PartyServer;
use crate::claudmaster::prefetch::PrefetchEngine;
use crate::claudmaster::runtime::{AgentRuntime, RoutingPlan, RuntimeError};
use crate::claudmaster::session::{
    ActionRecord, ActionSource, RecoveryWarning, Session, SessionConfig, SessionError,
    SessionState, SessionStatus, SessionStore,
};
use crate::claudmaster::storage::SplitStorage;
use crate::claudmaster::timeline::Timeline;
use crate::claudmaster::tools::{CampaignStore, StoreReader, StoreWriter};
use crate::claudmaster::tts::{SpeakerProfile, SpeechContext, TtsRouter};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Routing table: intent type -> staged agent plan. Configurable per session.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    plans: HashMap<IntentType, RoutingPlan>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        let mut plans = HashMap::new();
        let full = || {
            RoutingPlan::new(vec![
                vec!["module_keeper".to_string()],
                vec!["archivist".to_string(), "arbiter".to_string()],
                vec!["narrator".to_string()],
            ])
        };
        plans.insert(IntentType::Combat, full());
        plans.insert(IntentType::Action, full());
        plans.insert(IntentType::Exploration, full());
        plans.insert(
            IntentType::Question,
            RoutingPlan::new(vec![
                vec!["module_keeper".to_string()],
                vec!["archivist".to_string()],
                vec!["narrator".to_string()],
            ]),
        );
        plans.insert(
            IntentType::Roleplay,
            RoutingPlan::new(vec![
                vec!["module_keeper".to_string()],
                vec!["narrator".to_string()],
            ]),
        );
        plans.insert(
            IntentType::Social,
            RoutingPlan::new(vec![
                vec!["module_keeper".to_string()],
                vec!["arbiter".to_string()],
                vec!["narrator".to_string()],
            ]),
        );
        plans.insert(
            IntentType::System,
            RoutingPlan::new(vec![vec!["archivist".to_string()]]),
        );
        Self { plans }
    }
}

impl RoutingTable {
    pub fn plan_for(&self, intent: IntentType) -> RoutingPlan {
        self.plans.get(&intent).cloned().unwrap_or_default()
    }

    pub fn set(&mut self, intent: IntentType, plan: RoutingPlan) {
        self.plans.insert(intent, plan);
    }
}

/// The outcome of one processed turn, as returned to the host.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub action_id: String,
    pub intent: PlayerIntent,
    /// The public narrative, when a voice agent produced one.
    pub narrative: Option<String>,
    /// Visibility-scoped payloads, pre-filtering.
    pub payload: ScopedPayload,
    pub state_deltas: Vec<StateDelta>,
    /// Deltas that lost a priority conflict.
    pub conflicts: Vec<StateDelta>,
    pub dice_rolls: Vec<DiceRoll>,
    /// Agent-level failures captured along the way.
    pub agent_errors: Vec<String>,
    /// Consistency warnings and recovery notices.
    pub warnings: Vec<String>,
    pub degraded: bool,
    pub duration_ms: u64,
}

/// Turn-level and session-level failures.
#[derive(Debug)]
pub enum OrchestratorError {
    Session(SessionError),
    Runtime(RuntimeError),
    /// The consistency gate blocked the turn; nothing was persisted.
    Consistency(ContradictionReport),
    /// Persistence failed; the session is now degraded.
    Persistence(String),
    /// The party relay refused an operation.
    Party(String),
    Cancelled,
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::Session(e) => write!(f, "{}", e),
            OrchestratorError::Runtime(e) => write!(f, "{}", e),
            OrchestratorError::Consistency(report) => write!(
                f,
                "Consistency error: {} blocking contradiction(s)",
                report.blocking.len()
            ),
            OrchestratorError::Persistence(msg) => write!(f, "Persistence error: {}", msg),
            OrchestratorError::Party(msg) => write!(f, "Party error: {}", msg),
            OrchestratorError::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl Error for OrchestratorError {}

impl From<SessionError> for OrchestratorError {
    fn from(e: SessionError) -> Self {
        OrchestratorError::Session(e)
    }
}

struct QueuedAction {
    action_id: String,
    actor_id: Option<String>,
    text: String,
    source: ActionSource,
}

/// Everything one live session owns.
struct SessionHandle {
    session: Session,
    facts: Arc<RwLock<FactStore>>,
    knowledge: Arc<RwLock<KnowledgeTracker>>,
    timeline: Arc<RwLock<Timeline>>,
    runtime: AgentRuntime,
    routing: RoutingTable,
    queue: VecDeque<QueuedAction>,
    /// Cancellation for the in-flight turn, if any.
    cancel: Option<CancelSource>,
    pending_warning: Option<RecoveryWarning>,
    /// Event id of the previous turn, to chain timeline causes.
    last_event_id: Option<String>,
}

impl SessionHandle {
    /// Clone the world into a snapshot aggregate.
    async fn snapshot_state(&self) -> SessionState {
        SessionState {
            session: self.session.clone(),
            facts: self.facts.read().await.clone(),
            knowledge: self.knowledge.read().await.clone(),
            timeline: self.timeline.read().await.clone(),
        }
    }
}

/// The engine root. One instance per campaign root; cheap to construct.
pub struct Orchestrator {
    config: EngineConfig,
    classifier: IntentClassifier,
    checker: ContradictionChecker,
    store: Arc<CampaignStore>,
    session_store: SessionStore,
    sessions: HashMap<String, SessionHandle>,
    party: Option<Arc<PartyServer>>,
    tts: Option<Arc<TtsRouter>>,
    prefetch: Option<Arc<PrefetchEngine>>,
    events: SharedEventHandler,
}

impl Orchestrator {
    /// Open (or create) the campaign root and build an engine over it.
    pub fn open(config: EngineConfig) -> Result<Self, OrchestratorError> {
        let storage = SplitStorage::open(&config.storage_root)
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
        let storage = Arc::new(Mutex::new(storage));
        let store = Arc::new(CampaignStore::new(Arc::clone(&storage)));
        let session_store = SessionStore::new(storage, config.session.clone());
        let classifier = IntentClassifier::new().with_score_gap(config.score_gap);
        Ok(Self {
            config,
            classifier,
            checker: ContradictionChecker::new(),
            store,
            session_store,
            sessions: HashMap::new(),
            party: None,
            tts: None,
            prefetch: None,
            events: None,
        })
    }

    /// Attach an event handler (builder pattern).
    pub fn with_events(mut self, events: Arc<dyn crate::claudmaster::event::EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the consistency checker (builder pattern).
    pub fn with_checker(mut self, checker: ContradictionChecker) -> Self {
        self.checker = checker;
        self
    }

    /// Wire a party server for broadcast delivery.
    pub fn attach_party(&mut self, party: Arc<PartyServer>) {
        self.party = Some(party);
    }

    /// Wire a TTS router for audio delivery.
    pub fn attach_tts(&mut self, tts: Arc<TtsRouter>) {
        self.tts = Some(tts);
    }

    /// Wire the prefetch engine.
    pub fn attach_prefetch(&mut self, prefetch: Arc<PrefetchEngine>) {
        self.prefetch = Some(prefetch);
    }

    /// Build and attach a prefetch engine over `client` at the configured
    /// intensity. Returns the handle so the host can feed it turn-change
    /// triggers and resolve outcomes.
    pub fn enable_prefetch(
        &mut self,
        client: Arc<dyn crate::claudmaster::llm_client::LLMClient>,
    ) -> Arc<PrefetchEngine> {
        let prefetch = Arc::new(
            PrefetchEngine::new(client, self.events.clone())
                .with_intensity(self.config.prefetch_intensity),
        );
        self.prefetch = Some(Arc::clone(&prefetch));
        prefetch
    }

    /// Shared read access to the campaign store.
    pub fn store(&self) -> Arc<CampaignStore> {
        Arc::clone(&self.store)
    }

    /// Start a fresh session for `campaign_id`.
    ///
    /// Fails with [`SessionError::Conflict`] when another active session
    /// exists for the campaign and concurrent sessions are not allowed.
    pub async fn start_session(
        &mut self,
        campaign_id: &str,
        config: SessionConfig,
        agents: Vec<Arc<dyn Agent>>,
    ) -> Result<String, OrchestratorError> {
        if !config.allow_concurrent_sessions {
            let conflict = self.sessions.values().any(|h| {
                h.session.campaign_id == campaign_id && h.session.status == SessionStatus::Active
            });
            if conflict {
                return Err(SessionError::Conflict {
                    campaign_id: campaign_id.to_string(),
                }
                .into());
            }
        }

        // The campaign record is external; its absence is allowed but noted.
        match self.store.campaign_meta().await {
            Ok(Some(meta)) => {
                log::info!(
                    "loaded campaign '{}'",
                    meta.get("name").and_then(|n| n.as_str()).unwrap_or("?")
                );
            }
            Ok(None) => log::warn!("campaign.json missing under {:?}", self.config.storage_root),
            Err(e) => return Err(OrchestratorError::Persistence(e.to_string())),
        }

        let session_number = self.next_session_number(campaign_id);
        let session_id = format!("sess-{}", Uuid::new_v4());
        let session = Session::new(&session_id, campaign_id, session_number, config.settings);

        let mut runtime = AgentRuntime::new(self.events.clone());
        let mut session = session;
        for agent in agents {
            let name = agent.descriptor().name.clone();
            runtime
                .register(agent)
                .map_err(OrchestratorError::Runtime)?;
            session.active_agents.insert(name);
        }
        let mut handle = SessionHandle {
            session,
            facts: Arc::new(RwLock::new(FactStore::new())),
            knowledge: Arc::new(RwLock::new(KnowledgeTracker::new())),
            timeline: Arc::new(RwLock::new(Timeline::new())),
            runtime,
            routing: RoutingTable::default(),
            queue: VecDeque::new(),
            cancel: None,
            pending_warning: None,
            last_event_id: None,
        };

        // Seed the timeline with the session-start event.
        let seed_event = format!("session-start-{}", session_id);
        handle
            .timeline
            .write()
            .await
            .append(&seed_event, session_number, &[])
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
        handle.last_event_id = Some(seed_event);

        // Snapshot v0.
        let state = handle.snapshot_state().await;
        self.session_store.snapshot(&state).await?;

        log::info!(
            "session {} started for campaign {} ({} agents)",
            session_id,
            campaign_id,
            handle.runtime.list().len()
        );
        self.sessions.insert(session_id.clone(), handle);
        Ok(session_id)
    }

    /// Resume a persisted session, re-registering the agent set.
    ///
    /// If recovery rolled back to an earlier snapshot, the warning is
    /// attached to the next [`TurnResult`].
    pub async fn resume_session(
        &mut self,
        session_id: &str,
        agents: Vec<Arc<dyn Agent>>,
    ) -> Result<(), OrchestratorError> {
        let (state, warning) = self.session_store.load(session_id).await?;
        if let Some(warning) = &warning {
            emit(
                &self.events,
                EngineEvent::RecoveryPerformed {
                    session_id: session_id.to_string(),
                    rolled_back_to: warning.rolled_back_to,
                },
            )
            .await;
        }

        let mut runtime = AgentRuntime::new(self.events.clone());
        for agent in agents {
            runtime
                .register(agent)
                .map_err(OrchestratorError::Runtime)?;
        }

        let mut session = state.session;
        session.status = SessionStatus::Active;
        session.degraded = false;
        let last_event_id = state
            .timeline
            .entries()
            .last()
            .map(|e| e.event_id.clone());

        let handle = SessionHandle {
            session,
            facts: Arc::new(RwLock::new(state.facts)),
            knowledge: Arc::new(RwLock::new(state.knowledge)),
            timeline: Arc::new(RwLock::new(state.timeline)),
            runtime,
            routing: RoutingTable::default(),
            queue: VecDeque::new(),
            cancel: None,
            pending_warning: warning,
            last_event_id,
        };
        log::info!("session {} resumed", session_id);
        self.sessions.insert(session_id.to_string(), handle);
        Ok(())
    }

    /// Override the routing plan for one intent in one session.
    pub fn set_routing(
        &mut self,
        session_id: &str,
        intent: IntentType,
        plan: RoutingPlan,
    ) -> Result<(), OrchestratorError> {
        let handle = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        handle.routing.set(intent, plan);
        Ok(())
    }

    /// Enqueue an action; returns immediately with the action id.
    ///
    /// One action per session is processed at a time; everything else waits
    /// in the per-session FIFO.
    pub fn submit_action(
        &mut self,
        session_id: &str,
        actor_id: Option<String>,
        text: impl Into<String>,
        source: ActionSource,
    ) -> Result<String, OrchestratorError> {
        let handle = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if handle.session.status == SessionStatus::Ended {
            return Err(SessionError::Ended(session_id.to_string()).into());
        }
        if !handle.session.accepts_actions() {
            return Err(SessionError::Degraded(session_id.to_string()).into());
        }
        let action_id = format!("act-{}", Uuid::new_v4());
        handle.queue.push_back(QueuedAction {
            action_id: action_id.clone(),
            actor_id,
            text: text.into(),
            source,
        });
        Ok(action_id)
    }

    /// Bridge one queued party action into the pipeline and process it.
    ///
    /// Pops the oldest pending action from the attached party server (which
    /// marks it `Processing`), runs it through [`Orchestrator::process_next`]
    /// under the same action id so the relay's status updates line up, and
    /// returns the result. `Ok(None)` when no party server is attached or
    /// its queue is idle.
    pub async fn pump_party(
        &mut self,
        session_id: &str,
    ) -> Result<Option<TurnResult>, OrchestratorError> {
        let Some(party) = self.party.clone() else {
            return Ok(None);
        };
        let action = party
            .take_next_action()
            .await
            .map_err(|e| OrchestratorError::Party(e.to_string()))?;
        let Some(action) = action else {
            return Ok(None);
        };

        let handle = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if !handle.session.accepts_actions() {
            return Err(SessionError::Degraded(session_id.to_string()).into());
        }
        // Front of the queue: the relay already marked this action
        // `Processing`, so it must be the one the next drain resolves.
        handle.queue.push_front(QueuedAction {
            action_id: action.id.clone(),
            actor_id: Some(action.participant_id.clone()),
            text: action.text.clone(),
            source: action.source,
        });
        self.process_next(session_id).await
    }

    /// How many actions are waiting in a session's queue.
    pub fn queued_len(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|h| h.queue.len())
            .unwrap_or(0)
    }

    /// Drain one queued action synchronously. `Ok(None)` when idle.
    pub async fn process_next(
        &mut self,
        session_id: &str,
    ) -> Result<Option<TurnResult>, OrchestratorError> {
        let handle = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let Some(queued) = handle.queue.pop_front() else {
            return Ok(None);
        };
        if !handle.session.accepts_actions() {
            return Err(SessionError::Degraded(session_id.to_string()).into());
        }

        let started = std::time::Instant::now();

        // 1. Classify. Infallible by contract.
        let intent = self.classifier.classify(&queued.text);
        emit(
            &self.events,
            EngineEvent::TurnStarted {
                session_id: session_id.to_string(),
                action_id: queued.action_id.clone(),
                intent: intent.intent_type,
            },
        )
        .await;

        // 2. Route, dropping unregistered agents.
        let mut warnings: Vec<String> = Vec::new();
        let plan = {
            let full = handle.routing.plan_for(intent.intent_type);
            let mut stages = Vec::new();
            for stage in full.stages {
                let kept: Vec<String> = stage
                    .into_iter()
                    .filter(|name| {
                        let registered = handle.runtime.get(name).is_some();
                        if !registered {
                            warnings.push(format!("agent '{}' not registered; skipped", name));
                        }
                        registered
                    })
                    .collect();
                if !kept.is_empty() {
                    stages.push(kept);
                }
            }
            RoutingPlan::new(stages)
        };

        // 3. Execute under the turn budget with a fresh cancellation scope.
        let (cancel_source, cancel_token) = CancelSource::new();
        handle.cancel = Some(cancel_source);
        let (sink, _sink_rx) = PartialSink::channel();
        let context = AgentContext {
            facts: Arc::clone(&handle.facts),
            knowledge: Arc::clone(&handle.knowledge),
            timeline: Arc::clone(&handle.timeline),
            store: self.store.clone() as Arc<dyn StoreReader>,
            settings: handle.session.settings.clone(),
            module_context: None,
            cancel: cancel_token,
            sink,
        };
        let request = AgentRequest {
            request_id: queued.action_id.clone(),
            session_id: session_id.to_string(),
            actor_id: queued.actor_id.clone(),
            text: queued.text.clone(),
            intent: intent.clone(),
        };
        let outcomes = handle
            .runtime
            .execute_plan(
                &plan,
                &request,
                &context,
                Duration::from_millis(self.config.turn_budget_ms),
            )
            .await
            .map_err(OrchestratorError::Runtime)?;
        handle.cancel = None;

        if outcomes
            .iter()
            .all(|(_, o)| matches!(o, AgentOutcome::Cancelled))
            && !outcomes.is_empty()
        {
            return Err(OrchestratorError::Cancelled);
        }

        // 4. Aggregate.
        let mut aggregate = aggregate_outcomes(&handle.runtime, &outcomes);
        warnings.append(&mut aggregate.warnings);
        if let Some(pending) = handle.pending_warning.take() {
            warnings.push(format!(
                "recovered from snapshot {}: {}",
                pending.rolled_back_to, pending.detail
            ));
        }

        // 5. Consistency gate.
        let report = {
            let facts = handle.facts.read().await;
            self.checker.check(&aggregate.deltas, &facts)
        };
        if report.is_blocking() {
            emit(
                &self.events,
                EngineEvent::ConsistencyBlocked {
                    session_id: session_id.to_string(),
                    action_id: queued.action_id.clone(),
                    contradictions: report.blocking.len(),
                },
            )
            .await;
            // The caller gets the error; the table gets a DM-only note.
            if let Some(party) = &self.party {
                let detail = report
                    .blocking
                    .iter()
                    .map(|c| c.message.clone())
                    .collect::<Vec<_>>()
                    .join("; ");
                let _ = party
                    .publish(PartyResponse {
                        id: format!("resp-{}", Uuid::new_v4()),
                        action_id: queued.action_id.clone(),
                        public: None,
                        private_by_recipient: Default::default(),
                        dm_only: Some(format!("Consistency block: {}", detail)),
                        produced_at: Utc::now(),
                    })
                    .await;
                let _ = party
                    .update_action_status(&queued.action_id, ActionStatus::Rejected)
                    .await;
            }
            return Err(OrchestratorError::Consistency(report));
        }
        if !report.warn.is_empty() {
            let mut facts = handle.facts.write().await;
            for contradiction in &report.warn {
                warnings.push(contradiction.message.clone());
                let _ = facts.add(
                    Fact::new(FactCategory::Event, contradiction.message.clone(), 5)
                        .with_tag("consistency_warning")
                        .with_session(handle.session.session_number),
                );
            }
            emit(
                &self.events,
                EngineEvent::ConsistencyFlagged {
                    session_id: session_id.to_string(),
                    severity: crate::claudmaster::consistency::Severity::Warn,
                    count: report.warn.len(),
                },
            )
            .await;
        }

        // 6. Persist: deltas first, then history, timeline, auto-save.
        if let Err(e) = self.store.apply(&aggregate.deltas).await {
            handle.session.degraded = true;
            log::error!(
                "persistence failed for session {}; refusing further actions: {}",
                session_id,
                e
            );
            return Err(OrchestratorError::Persistence(e.to_string()));
        }
        if let Some(prefetch) = &self.prefetch {
            for delta in &aggregate.deltas {
                prefetch.invalidate_for(&delta.entity_id).await;
            }
        }

        let record = ActionRecord {
            action_id: queued.action_id.clone(),
            actor_id: queued.actor_id.clone(),
            text: queued.text.clone(),
            source: queued.source,
            turn: handle.session.turn_counter + 1,
            resolved_at: Utc::now(),
        };
        handle.session.record_action(record)?;

        {
            let mut timeline = handle.timeline.write().await;
            let causes: Vec<String> = handle.last_event_id.iter().cloned().collect();
            if let Err(e) = timeline.append(
                &queued.action_id,
                handle.session.session_number,
                &causes,
            ) {
                log::warn!("timeline append failed: {}", e);
            } else {
                handle.last_event_id = Some(queued.action_id.clone());
            }
        }

        let state = handle.snapshot_state().await;
        if self.session_store.note_turn(&state).await? {
            emit(
                &self.events,
                EngineEvent::SnapshotWritten {
                    session_id: session_id.to_string(),
                    turn_counter: state.session.turn_counter,
                },
            )
            .await;
        }

        // 7. Filter & deliver.
        let result = TurnResult {
            action_id: queued.action_id.clone(),
            intent: intent.clone(),
            narrative: aggregate.payload.public.clone(),
            payload: aggregate.payload.clone(),
            state_deltas: aggregate.deltas.clone(),
            conflicts: aggregate.conflicts.clone(),
            dice_rolls: aggregate.dice_rolls.clone(),
            agent_errors: aggregate.agent_errors.clone(),
            warnings,
            degraded: aggregate.degraded,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if let Some(party) = &self.party {
            let response = PartyResponse {
                id: format!("resp-{}", Uuid::new_v4()),
                action_id: queued.action_id.clone(),
                public: result.payload.public.clone(),
                private_by_recipient: result.payload.private.clone().into_iter().collect(),
                dm_only: result.payload.dm_only.clone(),
                produced_at: Utc::now(),
            };
            if let Err(e) = party.publish(response).await {
                log::warn!("party publish failed: {}", e);
            }
            let _ = party
                .update_action_status(&queued.action_id, ActionStatus::Resolved)
                .await;

            // Push refreshed character sheets for every character this turn
            // touched; the relay filters the record per recipient.
            let mut pushed: Vec<&str> = Vec::new();
            for delta in &result.state_deltas {
                if delta.category != crate::claudmaster::storage::EntityCategory::Character
                    || pushed.contains(&delta.entity_id.as_str())
                {
                    continue;
                }
                pushed.push(&delta.entity_id);
                match self.store.get(delta.category, &delta.entity_id).await {
                    Ok(Some(record)) => {
                        party
                            .publish_character_update(&delta.entity_id, record)
                            .await;
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("character refresh failed: {}", e),
                }
            }
        }

        if let (Some(tts), Some(party), Some(text)) =
            (&self.tts, &self.party, &result.payload.public)
        {
            let speech_context = if intent.intent_type == IntentType::Combat {
                SpeechContext::Combat
            } else {
                SpeechContext::Narration
            };
            let speaker = SpeakerProfile {
                name: "dm".to_string(),
                ..Default::default()
            };
            if let Some(stream) = tts.narrate(text, &speaker, speech_context).await {
                party.broadcast_audio(stream.to_messages()).await;
            }
        }

        emit(
            &self.events,
            EngineEvent::TurnCompleted {
                session_id: session_id.to_string(),
                action_id: result.action_id.clone(),
                degraded: result.degraded,
                duration_ms: result.duration_ms,
            },
        )
        .await;
        Ok(Some(result))
    }

    /// Pause or end a session, cancelling any in-flight turn and forcing a
    /// final snapshot.
    pub async fn end_session(
        &mut self,
        session_id: &str,
        end: bool,
        summary: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let handle = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if let Some(cancel) = handle.cancel.take() {
            cancel.cancel();
        }
        handle.queue.clear();
        handle.session.status = if end {
            SessionStatus::Ended
        } else {
            SessionStatus::Paused
        };
        if end {
            handle.session.final_notes = summary;
        }
        let state = handle.snapshot_state().await;
        self.session_store.snapshot(&state).await?;
        if end {
            self.sessions.remove(session_id);
            log::info!("session {} ended", session_id);
        } else {
            log::info!("session {} paused", session_id);
        }
        Ok(())
    }

    /// Direct access to a session's world views (read-mostly host surface).
    pub fn facts_of(&self, session_id: &str) -> Option<Arc<RwLock<FactStore>>> {
        self.sessions.get(session_id).map(|h| Arc::clone(&h.facts))
    }

    pub fn knowledge_of(&self, session_id: &str) -> Option<Arc<RwLock<KnowledgeTracker>>> {
        self.sessions
            .get(session_id)
            .map(|h| Arc::clone(&h.knowledge))
    }

    pub fn timeline_of(&self, session_id: &str) -> Option<Arc<RwLock<Timeline>>> {
        self.sessions
            .get(session_id)
            .map(|h| Arc::clone(&h.timeline))
    }

    pub fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        self.sessions.get(session_id).map(|h| h.session.status)
    }

    pub fn action_history_len(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|h| h.session.action_history.len())
            .unwrap_or(0)
    }

    fn next_session_number(&self, campaign_id: &str) -> u32 {
        self.sessions
            .values()
            .filter(|h| h.session.campaign_id == campaign_id)
            .map(|h| h.session.session_number + 1)
            .max()
            .unwrap_or(1)
    }
}

struct Aggregate {
    payload: ScopedPayload,
    deltas: Vec<StateDelta>,
    conflicts: Vec<StateDelta>,
    dice_rolls: Vec<DiceRoll>,
    agent_errors: Vec<String>,
    warnings: Vec<String>,
    degraded: bool,
}

/// Layered merge of agent outcomes.
///
/// Ledger deltas apply in declared priority order; on a conflict the higher
/// priority wins and the loser is reported. Voice text becomes the public
/// narrative; party-scoped and private text land in their lanes; rationale
/// goes DM-only.
fn aggregate_outcomes(
    runtime: &AgentRuntime,
    outcomes: &[(String, AgentOutcome)],
) -> Aggregate {
    let mut aggregate = Aggregate {
        payload: ScopedPayload::default(),
        deltas: Vec::new(),
        conflicts: Vec::new(),
        dice_rolls: Vec::new(),
        agent_errors: Vec::new(),
        warnings: Vec::new(),
        degraded: false,
    };

    // (delta, priority) per conflict key; winner kept, losers reported.
    let mut chosen: HashMap<(crate::claudmaster::storage::EntityCategory, String, String), (StateDelta, i32)> =
        HashMap::new();
    let mut party_lines: Vec<String> = Vec::new();
    let mut dm_lines: Vec<String> = Vec::new();

    for (name, outcome) in outcomes {
        if outcome.is_degraded() {
            aggregate.degraded = true;
        }
        let Some(response) = outcome.response() else {
            if let AgentOutcome::Failed(reason) = outcome {
                aggregate.agent_errors.push(format!("{}: {}", name, reason));
            }
            continue;
        };
        for error in &response.errors {
            aggregate.agent_errors.push(format!("{}: {}", name, error));
        }
        aggregate.dice_rolls.extend(response.dice_rolls.clone());

        let descriptor = runtime.get(name).map(|a| a.descriptor().clone());
        let (priority, kind) = descriptor
            .map(|d| (d.priority, d.kind))
            .unwrap_or((0, AgentKind::Ledger));

        for delta in &response.state_deltas {
            let key = (
                delta.category,
                delta.entity_id.clone(),
                delta.field.clone(),
            );
            let existing_priority = chosen.get(&key).map(|(_, p)| *p);
            match existing_priority {
                Some(p) if priority > p => {
                    if let Some((loser, _)) = chosen.insert(key, (delta.clone(), priority)) {
                        aggregate.conflicts.push(loser);
                    }
                }
                Some(_) => aggregate.conflicts.push(delta.clone()),
                None => {
                    chosen.insert(key, (delta.clone(), priority));
                }
            }
        }

        if let Some(text) = &response.text {
            match (kind, response.visibility.clone()) {
                (AgentKind::Voice, _) | (_, Some(Visibility::Public)) => {
                    // Voice output wraps the result as the public narrative;
                    // multiple voice agents concatenate in plan order.
                    match &mut aggregate.payload.public {
                        Some(existing) => {
                            existing.push_str("\n\n");
                            existing.push_str(text);
                        }
                        None => aggregate.payload.public = Some(text.clone()),
                    }
                }
                (_, Some(Visibility::Party)) => party_lines.push(text.clone()),
                (_, Some(Visibility::Private(recipient))) => {
                    aggregate
                        .payload
                        .private
                        .entry(recipient)
                        .and_modify(|t| {
                            t.push('\n');
                            t.push_str(text);
                        })
                        .or_insert_with(|| text.clone());
                }
                (_, Some(Visibility::DmOnly)) => dm_lines.push(text.clone()),
                (_, None) => {}
            }
        }
        if let Some(rationale) = &response.rationale {
            dm_lines.push(format!("[{}] {}", name, rationale));
        }
    }

    // Deltas in priority order, highest first, stable within a priority.
    let mut ordered: Vec<(StateDelta, i32)> = chosen.into_values().collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1));
    aggregate.deltas = ordered.into_iter().map(|(d, _)| d).collect();

    if !party_lines.is_empty() {
        aggregate.payload.party = Some(party_lines.join("\n"));
    }
    if !dm_lines.is_empty() {
        aggregate.payload.dm_only = Some(dm_lines.join("\n"));
    }
    aggregate
}
