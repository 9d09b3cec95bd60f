//! The Party Mode server.
//!
//! Owns the participant registry, the persistent action/response queues, and
//! one WebSocket per connected participant. HTTP endpoints follow the wire
//! contract:
//!
//! - `POST /action` with `Authorization: Bearer <token>` submits an action;
//! - `GET /character/{participant_id}?token=<t>` returns the filtered record;
//! - `POST /private` (DM only) sends a direct message;
//! - `GET /ws?token=<t>` upgrades to the push channel.
//!
//! Delivery model: responses are stored unfiltered and projected per
//! recipient at delivery time. Every deliverable message gets a session-wide
//! sequence number; participants carry a `last_acked_seq` and receive a
//! replay of everything after it on reconnect, so delivery is at-least-once
//! and clients dedupe by `message_id`. Audio is ephemeral: a disconnect
//! cancels the stream, only the narrative is replayed.
//!
//! Backpressure: each connection has a bounded outbound buffer. When it
//! fills, queued non-critical messages (combat-state refreshes) are coalesced
//! by key; if a critical message still does not fit, the slow consumer is
//! disconnected and picks the content back up via replay.

use crate::claudmaster::event::{emit, EngineEvent, SharedEventHandler};
use crate::claudmaster::output_filter::{OutputFilter, Recipient, ScopedPayload};
use crate::claudmaster::party::protocol::{
    ActionStatus, ClientMessage, Envelope, Participant, PartyAction, PartyResponse,
    PrivateMessageRequest, ServerMessage, SubmitActionRequest, SubmitActionResponse,
};
use crate::claudmaster::party::queue::{ActionQueue, ResponseQueue};
use crate::claudmaster::permissions::Role;
use crate::claudmaster::session::ActionSource;
use crate::claudmaster::storage::EntityCategory;
use crate::claudmaster::tools::StoreReader;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, Request, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use tower::ServiceBuilder;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct PartyServerConfig {
    /// Ping cadence; a peer missing pongs for 2x this is disconnected.
    pub heartbeat_interval: Duration,
    /// Outbound buffer capacity per connection.
    pub outbound_buffer: usize,
    /// When set, combat turn gating is disabled and everyone may act at once.
    pub simultaneous_mode: bool,
}

impl Default for PartyServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            outbound_buffer: 256,
            simultaneous_mode: false,
        }
    }
}

/// Errors surfaced by party operations.
#[derive(Debug)]
pub enum PartyError {
    NotAttached,
    UnknownToken,
    UnknownParticipant(String),
    NotOnTurn { participant_id: String },
    ObserversCannotAct,
    Transport(String),
    Queue(std::io::Error),
}

impl fmt::Display for PartyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartyError::NotAttached => write!(f, "Party server is not attached to a session"),
            PartyError::UnknownToken => write!(f, "Unknown token"),
            PartyError::UnknownParticipant(id) => write!(f, "Unknown participant: {}", id),
            PartyError::NotOnTurn { participant_id } => {
                write!(f, "Participant {} is not on turn", participant_id)
            }
            PartyError::ObserversCannotAct => write!(f, "Observers cannot submit actions"),
            PartyError::Transport(msg) => write!(f, "Transport error: {}", msg),
            PartyError::Queue(e) => write!(f, "Queue error: {}", e),
        }
    }
}

impl Error for PartyError {}

/// Combat turn gate.
#[derive(Debug, Clone, Default)]
pub struct CombatGate {
    pub active: bool,
    /// Participant ids in initiative order.
    pub order: Vec<String>,
    pub turn_index: usize,
}

impl CombatGate {
    pub fn current_turn(&self) -> Option<&str> {
        if !self.active {
            return None;
        }
        self.order.get(self.turn_index).map(String::as_str)
    }
}

/// Replayable history entry, stored unfiltered.
#[derive(Debug, Clone)]
enum HistoryEntry {
    /// Everyone sees it.
    Broadcast(ServerMessage),
    /// Projected per recipient at delivery time.
    Scoped {
        action_id: String,
        payload: ScopedPayload,
    },
    /// One participant only.
    Direct {
        to: String,
        message: ServerMessage,
    },
    /// A character record change; the record is filtered per recipient at
    /// delivery (and replay) time, never stored pre-filtered.
    CharacterRecord {
        character_id: String,
        record: serde_json::Value,
    },
}

struct Connection {
    buffer: Mutex<VecDeque<Envelope>>,
    notify: Arc<Notify>,
    /// Set when the send loop should drop the peer.
    doomed: std::sync::atomic::AtomicBool,
    last_pong: Mutex<Instant>,
    connection_id: String,
}

/// The relay. Constructed per campaign; cheap to clone via `Arc`.
pub struct PartyServer {
    config: PartyServerConfig,
    session_id: RwLock<Option<String>>,
    participants: RwLock<HashMap<String, Participant>>,
    actions: Mutex<Option<ActionQueue>>,
    responses: Mutex<Option<ResponseQueue>>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    history: RwLock<Vec<(u64, HistoryEntry)>>,
    last_acked: RwLock<HashMap<String, u64>>,
    next_seq: AtomicU64,
    filter: OutputFilter,
    combat: RwLock<CombatGate>,
    store: RwLock<Option<Arc<dyn StoreReader>>>,
    events: SharedEventHandler,
}

impl PartyServer {
    pub fn new(config: PartyServerConfig, events: SharedEventHandler) -> Arc<Self> {
        Arc::new(Self {
            config,
            session_id: RwLock::new(None),
            participants: RwLock::new(HashMap::new()),
            actions: Mutex::new(None),
            responses: Mutex::new(None),
            connections: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            last_acked: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            filter: OutputFilter::new(),
            combat: RwLock::new(CombatGate::default()),
            store: RwLock::new(None),
            events,
        })
    }

    /// Wire the server to a session: open (or reopen) the JSONL queues under
    /// `campaign_root/party/`, register participants, and remember the store
    /// view used by the character endpoint.
    pub async fn attach(
        &self,
        session_id: impl Into<String>,
        campaign_root: &Path,
        participants: Vec<Participant>,
        store: Arc<dyn StoreReader>,
    ) -> Result<(), PartyError> {
        let actions = ActionQueue::open(campaign_root.join("party/actions.jsonl"))
            .map_err(PartyError::Queue)?;
        let responses = ResponseQueue::open(campaign_root.join("party/responses.jsonl"))
            .map_err(PartyError::Queue)?;

        *self.session_id.write().await = Some(session_id.into());
        *self.actions.lock().await = Some(actions);
        *self.responses.lock().await = Some(responses);
        *self.store.write().await = Some(store);

        let mut registry = self.participants.write().await;
        registry.clear();
        for participant in participants {
            registry.insert(participant.id.clone(), participant);
        }
        log::info!("party server attached ({} participants)", registry.len());
        Ok(())
    }

    /// Resolve a bearer token to a participant id.
    ///
    /// The comparison is constant-time per candidate and every registered
    /// token is always examined, so timing does not reveal which token
    /// prefix matched.
    pub async fn authenticate(&self, token: &str) -> Result<Participant, PartyError> {
        let registry = self.participants.read().await;
        let mut found: Option<&Participant> = None;
        for participant in registry.values() {
            let matches = participant.token.as_bytes().ct_eq(token.as_bytes());
            if bool::from(matches) {
                found = Some(participant);
            }
        }
        found.cloned().ok_or(PartyError::UnknownToken)
    }

    /// Submit an action on behalf of a participant.
    ///
    /// Turn-gated: during combat a participant who is not on turn has their
    /// submission logged and immediately advanced to `Rejected`, with an
    /// `action_status` push explaining why. The HTTP call itself still
    /// succeeds and returns the action id.
    pub async fn submit(
        &self,
        participant_id: &str,
        text: impl Into<String>,
        source: ActionSource,
    ) -> Result<String, PartyError> {
        let role = {
            let registry = self.participants.read().await;
            registry
                .get(participant_id)
                .ok_or_else(|| PartyError::UnknownParticipant(participant_id.to_string()))?
                .role
        };
        if role == Role::Observer {
            return Err(PartyError::ObserversCannotAct);
        }

        let action = PartyAction {
            id: format!("act-{}", Uuid::new_v4()),
            participant_id: participant_id.to_string(),
            text: text.into(),
            source,
            status: ActionStatus::Queued,
            submitted_at: Utc::now(),
        };
        let action_id = action.id.clone();

        let gated = {
            let combat = self.combat.read().await;
            combat.active
                && !self.config.simultaneous_mode
                && role != Role::Dm
                && combat.current_turn() != Some(participant_id)
        };

        {
            let mut queue = self.actions.lock().await;
            let queue = queue.as_mut().ok_or(PartyError::NotAttached)?;
            queue.submit(action).map_err(PartyError::Queue)?;
            if gated {
                queue
                    .advance(&action_id, ActionStatus::Rejected)
                    .map_err(PartyError::Queue)?;
            }
        }

        if gated {
            log::info!(
                "rejected action {} from {}: not on turn",
                action_id,
                participant_id
            );
            self.push_direct(
                participant_id,
                ServerMessage::ActionStatus {
                    action_id: action_id.clone(),
                    status: ActionStatus::Rejected,
                    reason: Some("not your turn".to_string()),
                },
                true,
            )
            .await;
        }

        Ok(action_id)
    }

    /// Pop the oldest queued action for processing, marking it `Processing`.
    pub async fn take_next_action(&self) -> Result<Option<PartyAction>, PartyError> {
        let mut queue = self.actions.lock().await;
        let queue = queue.as_mut().ok_or(PartyError::NotAttached)?;
        let Some(action) = queue.next_pending().cloned() else {
            return Ok(None);
        };
        queue
            .advance(&action.id, ActionStatus::Processing)
            .map_err(PartyError::Queue)?;
        Ok(Some(action))
    }

    /// Advance an action's status and push an `action_status` update to its
    /// submitter.
    pub async fn update_action_status(
        &self,
        action_id: &str,
        status: ActionStatus,
    ) -> Result<(), PartyError> {
        let participant_id = {
            let mut queue = self.actions.lock().await;
            let queue = queue.as_mut().ok_or(PartyError::NotAttached)?;
            queue.advance(action_id, status).map_err(PartyError::Queue)?;
            queue
                .get(action_id)
                .map(|a| a.participant_id.clone())
                .unwrap_or_default()
        };
        if !participant_id.is_empty() {
            self.push_direct(
                &participant_id,
                ServerMessage::ActionStatus {
                    action_id: action_id.to_string(),
                    status,
                    reason: None,
                },
                true,
            )
            .await;
        }
        Ok(())
    }

    /// Publish a response: append to the durable log, record it for replay,
    /// and fan out a filtered projection to every connected participant.
    pub async fn publish(&self, response: PartyResponse) -> Result<(), PartyError> {
        {
            let mut queue = self.responses.lock().await;
            queue
                .as_mut()
                .ok_or(PartyError::NotAttached)?
                .publish(response.clone())
                .map_err(PartyError::Queue)?;
        }

        let payload = ScopedPayload {
            public: response.public.clone(),
            party: None,
            private: response.private_by_recipient.clone().into_iter().collect(),
            dm_only: response.dm_only.clone(),
        };
        let seq = self
            .record_history(HistoryEntry::Scoped {
                action_id: response.action_id.clone(),
                payload: payload.clone(),
            })
            .await;

        let connections = self.connections.read().await;
        let registry = self.participants.read().await;
        for (participant_id, connection) in connections.iter() {
            let Some(participant) = registry.get(participant_id) else {
                continue;
            };
            let recipient = recipient_of(participant);
            for envelope in self.project_scoped(seq, &response.action_id, &payload, &recipient) {
                self.enqueue(participant_id, connection, envelope).await;
            }
        }
        Ok(())
    }

    /// Current queue status of an action.
    pub async fn action_status(&self, action_id: &str) -> Option<ActionStatus> {
        let queue = self.actions.lock().await;
        queue
            .as_ref()
            .and_then(|q| q.get(action_id).map(|a| a.status))
    }

    /// Number of responses in the durable log.
    pub async fn response_count(&self) -> usize {
        let queue = self.responses.lock().await;
        queue.as_ref().map(|q| q.len()).unwrap_or(0)
    }

    /// Update the combat gate and broadcast the new state.
    pub async fn set_combat_state(&self, gate: CombatGate) {
        let message = ServerMessage::CombatState {
            active: gate.active,
            current_turn: gate.current_turn().map(str::to_string),
            order: gate.order.clone(),
        };
        *self.combat.write().await = gate;
        self.broadcast(message, false).await;
    }

    /// Push a changed character record to every connected participant,
    /// filtered per recipient.
    pub async fn publish_character_update(&self, character_id: &str, record: serde_json::Value) {
        let seq = self
            .record_history(HistoryEntry::CharacterRecord {
                character_id: character_id.to_string(),
                record: record.clone(),
            })
            .await;
        let connections = self.connections.read().await;
        let registry = self.participants.read().await;
        for (participant_id, connection) in connections.iter() {
            let Some(participant) = registry.get(participant_id) else {
                continue;
            };
            if let Some(env) =
                self.character_envelope(seq, character_id, &record, &recipient_of(participant))
            {
                self.enqueue(participant_id, connection, env).await;
            }
        }
    }

    fn character_envelope(
        &self,
        seq: u64,
        character_id: &str,
        record: &serde_json::Value,
        recipient: &Recipient,
    ) -> Option<Envelope> {
        let filtered = self.filter.filter_value(record, recipient)?;
        Some(envelope(
            seq,
            ServerMessage::CharacterUpdate {
                character_id: character_id.to_string(),
                record: filtered,
            },
        ))
    }

    /// DM-to-participant direct message.
    pub async fn send_private(&self, to: &str, text: impl Into<String>) -> Result<(), PartyError> {
        {
            let registry = self.participants.read().await;
            if !registry.contains_key(to) {
                return Err(PartyError::UnknownParticipant(to.to_string()));
            }
        }
        let message = ServerMessage::Private { text: text.into() };
        let seq = self
            .record_history(HistoryEntry::Direct {
                to: to.to_string(),
                message: message.clone(),
            })
            .await;
        let connections = self.connections.read().await;
        if let Some(connection) = connections.get(to) {
            self.enqueue(to, connection, envelope(seq, message)).await;
        }
        Ok(())
    }

    /// Push chunked audio to every connected participant. Ephemeral: not
    /// recorded for replay, a disconnect simply loses the stream.
    pub async fn broadcast_audio(&self, chunks: Vec<ServerMessage>) {
        let connections = self.connections.read().await;
        for (participant_id, connection) in connections.iter() {
            for chunk in &chunks {
                self.enqueue(participant_id, connection, envelope(0, chunk.clone()))
                    .await;
            }
        }
    }

    /// Broadcast a message to everyone, optionally recording it for replay.
    pub async fn broadcast(&self, message: ServerMessage, replayable: bool) {
        let seq = if replayable {
            self.record_history(HistoryEntry::Broadcast(message.clone()))
                .await
        } else {
            self.next_seq.fetch_add(1, Ordering::SeqCst)
        };
        let connections = self.connections.read().await;
        for (participant_id, connection) in connections.iter() {
            self.enqueue(participant_id, connection, envelope(seq, message.clone()))
                .await;
        }
    }

    async fn record_history(&self, entry: HistoryEntry) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.history.write().await.push((seq, entry));
        seq
    }

    fn project_scoped(
        &self,
        seq: u64,
        action_id: &str,
        payload: &ScopedPayload,
        recipient: &Recipient,
    ) -> Vec<Envelope> {
        use crate::claudmaster::agent::Visibility;
        self.filter
            .project(payload, recipient)
            .into_iter()
            .map(|visible| {
                let message = match visible.visibility {
                    Visibility::Private(_) | Visibility::DmOnly => ServerMessage::Private {
                        text: visible.text,
                    },
                    _ => ServerMessage::Narrative {
                        action_id: Some(action_id.to_string()),
                        text: visible.text,
                    },
                };
                envelope(seq, message)
            })
            .collect()
    }

    async fn push_direct(&self, participant_id: &str, message: ServerMessage, replayable: bool) {
        let seq = if replayable {
            self.record_history(HistoryEntry::Direct {
                to: participant_id.to_string(),
                message: message.clone(),
            })
            .await
        } else {
            self.next_seq.fetch_add(1, Ordering::SeqCst)
        };
        let connections = self.connections.read().await;
        if let Some(connection) = connections.get(participant_id) {
            self.enqueue(participant_id, connection, envelope(seq, message))
                .await;
        }
    }

    /// Enqueue an envelope on a connection's outbound buffer, applying the
    /// backpressure policy.
    async fn enqueue(&self, participant_id: &str, connection: &Arc<Connection>, env: Envelope) {
        let mut buffer = connection.buffer.lock().await;
        if buffer.len() >= self.config.outbound_buffer {
            // Coalesce: drop the oldest queued message sharing a coalesce key
            // with something newer, then any non-critical message.
            if let Some(pos) = buffer.iter().position(|e| {
                e.message.coalesce_key().is_some()
                    && buffer
                        .iter()
                        .filter(|other| other.message.coalesce_key() == e.message.coalesce_key())
                        .count()
                        > 1
            }) {
                buffer.remove(pos);
            } else if let Some(pos) = buffer.iter().position(|e| !e.message.is_critical()) {
                buffer.remove(pos);
            } else if env.message.is_critical() {
                // Nothing droppable and the new message must not be lost:
                // disconnect the slow consumer; replay covers the gap.
                log::warn!(
                    "outbound buffer full for {}; disconnecting slow consumer",
                    participant_id
                );
                connection
                    .doomed
                    .store(true, std::sync::atomic::Ordering::SeqCst);
                connection.notify.notify_one();
                return;
            } else {
                return;
            }
        }
        buffer.push_back(env);
        drop(buffer);
        connection.notify.notify_one();
    }

    /// Everything a participant would receive when replaying after
    /// `after_seq`, filtered for their role right now. This is the same
    /// projection the WebSocket path uses; hosts can use it to back a
    /// long-poll or test surface.
    pub async fn replay_envelopes(
        &self,
        participant_id: &str,
        after_seq: u64,
    ) -> Result<Vec<Envelope>, PartyError> {
        let participant = {
            let registry = self.participants.read().await;
            registry
                .get(participant_id)
                .cloned()
                .ok_or_else(|| PartyError::UnknownParticipant(participant_id.to_string()))?
        };
        Ok(self.replay_for(&participant, after_seq).await)
    }

    /// Envelopes the participant should receive again, everything after
    /// `after_seq`, filtered for their role at this moment.
    async fn replay_for(&self, participant: &Participant, after_seq: u64) -> Vec<Envelope> {
        let recipient = recipient_of(participant);
        let history = self.history.read().await;
        let mut out = Vec::new();
        for (seq, entry) in history.iter() {
            if *seq <= after_seq {
                continue;
            }
            match entry {
                HistoryEntry::Broadcast(message) => out.push(envelope(*seq, message.clone())),
                HistoryEntry::Scoped { action_id, payload } => {
                    out.extend(self.project_scoped(*seq, action_id, payload, &recipient));
                }
                HistoryEntry::Direct { to, message } => {
                    if to == &participant.id {
                        out.push(envelope(*seq, message.clone()));
                    }
                }
                HistoryEntry::CharacterRecord {
                    character_id,
                    record,
                } => {
                    if let Some(env) =
                        self.character_envelope(*seq, character_id, record, &recipient)
                    {
                        out.push(env);
                    }
                }
            }
        }
        out
    }

    /// Build the axum router exposing the party HTTP/WS surface.
    ///
    /// Every route sits behind the token-authentication layer: handlers run
    /// only for requests that resolved to a registered [`Participant`], which
    /// they receive through the request extensions.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/action", post(http_submit_action))
            .route("/character/{participant_id}", get(http_get_character))
            .route("/private", post(http_send_private))
            .route("/ws", get(ws_upgrade))
            .layer(
                ServiceBuilder::new().layer(axum::middleware::from_fn_with_state(
                    Arc::clone(self),
                    authenticate_request,
                )),
            )
            .with_state(Arc::clone(self))
    }

    /// Bind and serve until the listener fails. Most hosts spawn this.
    pub async fn serve(
        self: Arc<Self>,
        addr: std::net::SocketAddr,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        log::info!("party server listening on {}", addr);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

fn envelope(seq: u64, message: ServerMessage) -> Envelope {
    Envelope {
        seq,
        message_id: format!("msg-{}", Uuid::new_v4()),
        message,
    }
}

fn recipient_of(participant: &Participant) -> Recipient {
    Recipient {
        role: participant.role,
        participant_id: Some(participant.id.clone()),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn query_token(uri: &Uri) -> Option<String> {
    uri.query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(str::to_string)
}

/// Token check shared by every endpoint.
///
/// Accepts `Authorization: Bearer <token>` or the `token` query parameter
/// (the form browsers can attach to a WebSocket upgrade). The resolved
/// [`Participant`] is inserted into the request extensions; handlers never
/// see an unauthenticated request.
async fn authenticate_request(
    State(server): State<Arc<PartyServer>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = bearer_token(request.headers()).or_else(|| query_token(request.uri()));
    let Some(token) = token else {
        return unauthorized("missing token");
    };
    match server.authenticate(&token).await {
        Ok(participant) => {
            request.extensions_mut().insert(participant);
            next.run(request).await
        }
        Err(_) => unauthorized("invalid token"),
    }
}

fn unauthorized(error: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(SubmitActionResponse {
            success: false,
            action_id: None,
            error: Some(error.to_string()),
        }),
    )
        .into_response()
}

async fn http_submit_action(
    State(server): State<Arc<PartyServer>>,
    Extension(participant): Extension<Participant>,
    Json(body): Json<SubmitActionRequest>,
) -> impl IntoResponse {
    match server
        .submit(
            &participant.id,
            body.action,
            body.source.unwrap_or(ActionSource::Text),
        )
        .await
    {
        Ok(action_id) => (
            StatusCode::OK,
            Json(SubmitActionResponse {
                success: true,
                action_id: Some(action_id),
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::OK,
            Json(SubmitActionResponse {
                success: false,
                action_id: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn http_get_character(
    State(server): State<Arc<PartyServer>>,
    Extension(caller): Extension<Participant>,
    AxumPath(participant_id): AxumPath<String>,
) -> impl IntoResponse {
    // Players may only fetch their own sheet; the DM may fetch anyone's.
    if caller.role != Role::Dm && caller.id != participant_id {
        return (StatusCode::FORBIDDEN, Json(serde_json::Value::Null));
    }
    let registry = server.participants.read().await;
    let Some(target) = registry.get(&participant_id) else {
        return (StatusCode::NOT_FOUND, Json(serde_json::Value::Null));
    };
    let Some(character_id) = target.character_id.clone() else {
        return (StatusCode::NOT_FOUND, Json(serde_json::Value::Null));
    };
    drop(registry);

    let store = server.store.read().await;
    let Some(store) = store.as_ref() else {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::Value::Null));
    };
    match store.get(EntityCategory::Character, &character_id).await {
        Ok(Some(record)) => {
            let recipient = recipient_of(&caller);
            let filtered = server
                .filter
                .filter_value(&record, &recipient)
                .unwrap_or(serde_json::Value::Null);
            (StatusCode::OK, Json(filtered))
        }
        Ok(None) => (StatusCode::NOT_FOUND, Json(serde_json::Value::Null)),
        Err(e) => {
            log::error!("character fetch failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::Value::Null))
        }
    }
}

async fn http_send_private(
    State(server): State<Arc<PartyServer>>,
    Extension(caller): Extension<Participant>,
    Json(body): Json<PrivateMessageRequest>,
) -> impl IntoResponse {
    if caller.role != Role::Dm {
        return StatusCode::FORBIDDEN;
    }
    match server.send_private(&body.to, body.text).await {
        Ok(()) => StatusCode::OK,
        Err(PartyError::UnknownParticipant(_)) => StatusCode::NOT_FOUND,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn ws_upgrade(
    State(server): State<Arc<PartyServer>>,
    Extension(participant): Extension<Participant>,
    ws: WebSocketUpgrade,
) -> Response {
    // Authentication already happened in the middleware, before the upgrade.
    ws.on_upgrade(move |socket| handle_socket(socket, server, participant))
}

async fn handle_socket(socket: WebSocket, server: Arc<PartyServer>, participant: Participant) {
    let participant_id = participant.id.clone();
    let connection = Arc::new(Connection {
        buffer: Mutex::new(VecDeque::new()),
        notify: Arc::new(Notify::new()),
        doomed: std::sync::atomic::AtomicBool::new(false),
        last_pong: Mutex::new(Instant::now()),
        connection_id: format!("conn-{}", Uuid::new_v4()),
    });
    log::info!(
        "participant {} connected ({})",
        participant_id,
        connection.connection_id
    );
    emit(
        &server.events,
        EngineEvent::ParticipantConnected {
            participant_id: participant_id.clone(),
        },
    )
    .await;

    // Replace any previous connection for this participant.
    {
        let mut connections = server.connections.write().await;
        connections.insert(participant_id.clone(), Arc::clone(&connection));
    }

    // Greet and replay everything after the participant's acked cursor.
    let after = *server
        .last_acked
        .read()
        .await
        .get(&participant_id)
        .unwrap_or(&0);
    let greeting = envelope(
        0,
        ServerMessage::Connected {
            participant_id: participant_id.clone(),
            role: participant.role,
            resume_from: after,
        },
    );
    {
        let replay = server.replay_for(&participant, after).await;
        let mut buffer = connection.buffer.lock().await;
        buffer.push_back(greeting);
        buffer.extend(replay);
    }
    connection.notify.notify_one();

    let (mut sender, mut receiver) = socket.split();

    // Outbound loop: drain the buffer, heartbeat on the configured cadence.
    let send_connection = Arc::clone(&connection);
    let send_server = Arc::clone(&server);
    let send_participant = participant_id.clone();
    let send_task = tokio::spawn(async move {
        let heartbeat = send_server.config.heartbeat_interval;
        let mut ticker = tokio::time::interval(heartbeat);
        loop {
            tokio::select! {
                _ = send_connection.notify.notified() => {}
                _ = ticker.tick() => {
                    // Stale peer detection: missed pong past 2x interval.
                    let last = *send_connection.last_pong.lock().await;
                    if last.elapsed() > heartbeat * 2 {
                        log::info!("participant {} timed out", send_participant);
                        break;
                    }
                    let ping = envelope(0, ServerMessage::Ping);
                    if send_json(&mut sender, &ping).await.is_err() {
                        break;
                    }
                }
            }
            if send_connection.doomed.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            loop {
                let next = send_connection.buffer.lock().await.pop_front();
                match next {
                    Some(env) => {
                        if send_json(&mut sender, &env).await.is_err() {
                            return;
                        }
                    }
                    None => break,
                }
            }
        }
    });

    // Inbound loop: pongs, pings, history requests.
    while let Some(message) = receiver.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Pong) => {
                        *connection.last_pong.lock().await = Instant::now();
                    }
                    Ok(ClientMessage::Ping) => {
                        server
                            .enqueue(&participant_id, &connection, envelope(0, ServerMessage::Pong))
                            .await;
                    }
                    Ok(ClientMessage::HistoryRequest { last_acked_seq }) => {
                        server
                            .last_acked
                            .write()
                            .await
                            .insert(participant_id.clone(), last_acked_seq);
                        let replay = server.replay_for(&participant, last_acked_seq).await;
                        let mut buffer = connection.buffer.lock().await;
                        buffer.extend(replay);
                        drop(buffer);
                        connection.notify.notify_one();
                    }
                    Err(e) => {
                        log::debug!("ignoring malformed client message: {}", e);
                    }
                }
            }
            Ok(WsMessage::Ping(data)) => {
                // Protocol-level ping; axum answers with the split sender via
                // the queue to keep ordering.
                let _ = data;
            }
            Ok(WsMessage::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    send_task.abort();
    {
        let mut connections = server.connections.write().await;
        // Only remove if it is still our connection (a reconnect may have
        // replaced it already).
        if let Some(current) = connections.get(&participant_id) {
            if current.connection_id == connection.connection_id {
                connections.remove(&participant_id);
            }
        }
    }
    emit(
        &server.events,
        EngineEvent::ParticipantDisconnected {
            participant_id: participant_id.clone(),
            reason: "socket closed".to_string(),
        },
    )
    .await;
    log::info!("participant {} disconnected", participant_id);
}

async fn send_json(
    sender: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
    envelope: &Envelope,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(envelope).unwrap_or_default();
    sender.send(WsMessage::Text(text.into())).await
}
