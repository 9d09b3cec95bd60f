//! Session lifecycle, snapshots, and crash recovery.
//!
//! A [`Session`] moves through `absent -> active -> paused -> active | ended`.
//! The [`SessionStore`] owns persistence: it snapshots the full aggregate
//! (session, facts, knowledge, timeline, action history) through
//! [`SplitStorage`] batches, keeps a rolling chain of numbered snapshot files
//! for rollback, and validates a per-snapshot manifest at resume time. A
//! manifest mismatch (the signature of a crash between batch renames) rolls
//! the campaign back to the newest snapshot whose embedded checksum still
//! verifies and surfaces a [`RecoveryWarning`] on the next response.
//!
//! Auto-save cadence: a snapshot is forced every `auto_save_every_n` turns or
//! after `auto_save_max_age_ms`, whichever comes first.

use crate::claudmaster::facts::FactStore;
use crate::claudmaster::knowledge::KnowledgeTracker;
use crate::claudmaster::storage::{canonical_json, content_hash, Manifest, SplitStorage};
use crate::claudmaster::timeline::Timeline;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Ended,
}

/// How turns are presented to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    Classic,
    Narrated,
    Immersive,
}

/// Where a submitted action came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSource {
    Text,
    Voice,
}

/// Table-level knobs threaded into agent prompt context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub fudge_rolls: bool,
    pub difficulty: String,
    pub narrative_style: String,
    /// 0 (strictly by the book) through 4 (full improvisation).
    pub improvisation_level: u8,
    pub interaction_mode: InteractionMode,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            fudge_rolls: false,
            difficulty: "standard".to_string(),
            narrative_style: "descriptive".to_string(),
            improvisation_level: 2,
            interaction_mode: InteractionMode::Classic,
        }
    }
}

/// One fully processed action in the session history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_id: String,
    pub actor_id: Option<String>,
    pub text: String,
    pub source: ActionSource,
    /// Turn index this action resolved as.
    pub turn: u64,
    pub resolved_at: DateTime<Utc>,
}

/// The session aggregate root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub campaign_id: String,
    /// Campaign-level ordinal (the party's Nth sitting).
    pub session_number: u32,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_action_at: Option<DateTime<Utc>>,
    pub turn_counter: u64,
    pub action_history: Vec<ActionRecord>,
    pub active_agents: BTreeSet<String>,
    pub settings: SessionSettings,
    pub participants: BTreeSet<String>,
    /// Set after a persistence failure; the session refuses further actions
    /// until a manual recovery attempt succeeds.
    pub degraded: bool,
    /// DM closing notes, recorded when the session ends.
    pub final_notes: Option<String>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        campaign_id: impl Into<String>,
        session_number: u32,
        settings: SessionSettings,
    ) -> Self {
        Self {
            id: id.into(),
            campaign_id: campaign_id.into(),
            session_number,
            status: SessionStatus::Active,
            started_at: Utc::now(),
            last_action_at: None,
            turn_counter: 0,
            action_history: Vec::new(),
            active_agents: BTreeSet::new(),
            settings,
            participants: BTreeSet::new(),
            degraded: false,
            final_notes: None,
        }
    }

    /// Whether the session may accept another action record.
    ///
    /// Ended sessions never accept; degraded sessions refuse until recovered.
    pub fn accepts_actions(&self) -> bool {
        self.status == SessionStatus::Active && !self.degraded
    }

    /// Append a resolved action, advancing the turn counter.
    pub fn record_action(&mut self, record: ActionRecord) -> Result<(), SessionError> {
        if self.status == SessionStatus::Ended {
            return Err(SessionError::Ended(self.id.clone()));
        }
        if !self.accepts_actions() {
            return Err(SessionError::Degraded(self.id.clone()));
        }
        self.turn_counter += 1;
        self.last_action_at = Some(record.resolved_at);
        self.action_history.push(record);
        Ok(())
    }
}

/// Per-session configuration supplied at start.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Snapshot every N applied turns.
    pub auto_save_every_n: u64,
    /// Snapshot when the last one is older than this many milliseconds.
    pub auto_save_max_age_ms: u64,
    /// Lift the one-active-session-per-campaign rule.
    pub allow_concurrent_sessions: bool,
    /// How many numbered rollback snapshots to keep on disk.
    pub snapshot_retention: usize,
    pub settings: SessionSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_save_every_n: 5,
            auto_save_max_age_ms: 120_000,
            allow_concurrent_sessions: false,
            snapshot_retention: 3,
            settings: SessionSettings::default(),
        }
    }
}

/// Everything a snapshot captures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session: Session,
    pub facts: FactStore,
    pub knowledge: KnowledgeTracker,
    pub timeline: Timeline,
}

impl SessionState {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            facts: FactStore::new(),
            knowledge: KnowledgeTracker::new(),
            timeline: Timeline::new(),
        }
    }
}

/// Non-fatal resume diagnostics, surfaced on the next turn response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryWarning {
    pub session_id: String,
    /// Snapshot sequence the store rolled back to.
    pub rolled_back_to: u64,
    pub detail: String,
}

/// Errors of the session layer.
#[derive(Debug)]
pub enum SessionError {
    /// Another active session exists for the campaign.
    Conflict { campaign_id: String },
    NotFound(String),
    Ended(String),
    /// The session refused the action because a persistence failure left it
    /// degraded.
    Degraded(String),
    Persistence(String),
    /// No snapshot on disk survived checksum validation.
    Unrecoverable(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Conflict { campaign_id } => {
                write!(f, "Campaign '{}' already has an active session", campaign_id)
            }
            SessionError::NotFound(id) => write!(f, "Session not found: {}", id),
            SessionError::Ended(id) => write!(f, "Session '{}' has ended", id),
            SessionError::Degraded(id) => write!(
                f,
                "Session '{}' is degraded after a persistence failure",
                id
            ),
            SessionError::Persistence(msg) => write!(f, "Persistence error: {}", msg),
            SessionError::Unrecoverable(id) => {
                write!(f, "No valid snapshot found for session '{}'", id)
            }
        }
    }
}

impl Error for SessionError {}

/// Snapshot and resume machinery over one campaign's [`SplitStorage`].
pub struct SessionStore {
    storage: Arc<Mutex<SplitStorage>>,
    config: SessionConfig,
    /// Next numbered snapshot per session id.
    snapshot_seq: HashMap<String, u64>,
    /// Auto-save bookkeeping per session id.
    turns_since_save: HashMap<String, u64>,
    last_save_at: HashMap<String, DateTime<Utc>>,
}

impl SessionStore {
    pub fn new(storage: Arc<Mutex<SplitStorage>>, config: SessionConfig) -> Self {
        Self {
            storage,
            config,
            snapshot_seq: HashMap::new(),
            turns_since_save: HashMap::new(),
            last_save_at: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn meta_rel(session_id: &str) -> String {
        format!("claudmaster_sessions/{}/session_meta.json", session_id)
    }

    fn state_rel(session_id: &str) -> String {
        format!("claudmaster_sessions/{}/state_snapshot.json", session_id)
    }

    fn history_rel(session_id: &str) -> String {
        format!("claudmaster_sessions/{}/action_history.json", session_id)
    }

    fn manifest_rel(session_id: &str) -> String {
        format!("claudmaster_sessions/{}/manifest.json", session_id)
    }

    fn numbered_rel(seq: u64) -> String {
        format!("sessions/session-{:03}.json", seq)
    }

    /// Campaign entity files captured by snapshots and covered by manifests.
    fn entity_files() -> &'static [&'static str] {
        &[
            "campaign.json",
            "characters.json",
            "npcs.json",
            "locations.json",
            "quests.json",
            "encounters.json",
            "game_state.json",
        ]
    }

    /// The campaign files a snapshot manifest covers.
    fn covered_files(session_id: &str) -> Vec<String> {
        let mut rels = vec![
            Self::meta_rel(session_id),
            Self::state_rel(session_id),
            Self::history_rel(session_id),
        ];
        rels.extend(Self::entity_files().iter().map(|f| f.to_string()));
        rels
    }

    /// Persist a full snapshot of `state`, returning the snapshot sequence.
    ///
    /// The split files and the numbered rollback snapshot are committed as
    /// one batch, then the manifest (covering the split files *and* the
    /// entity category files as they exist on disk) is written last. A crash
    /// before the manifest lands is indistinguishable from a crash between
    /// renames and handled by the same rollback path.
    pub async fn snapshot(&mut self, state: &SessionState) -> Result<u64, SessionError> {
        let session_id = state.session.id.clone();
        let seq = self.snapshot_seq.entry(session_id.clone()).or_insert(0);
        let this_seq = *seq;

        let mut session_meta = state.session.clone();
        // History is persisted in its own file; the meta stays small.
        let history = std::mem::take(&mut session_meta.action_history);

        let meta_value = to_value(&session_meta)?;
        let state_value = json!({
            "snapshot_seq": this_seq,
            "turn_counter": state.session.turn_counter,
            "facts": to_value(&state.facts)?,
            "knowledge": to_value(&state.knowledge)?,
            "timeline": to_value(&state.timeline)?,
        });
        let history_value = to_value(&history)?;

        {
            let mut storage = self.storage.lock().await;

            // Capture the entity category files as they stand, so a rollback
            // can restore a half-committed turn batch, not just session state.
            let mut entities = serde_json::Map::new();
            for file in Self::entity_files() {
                if let Some(doc) = storage
                    .read_json(file)
                    .map_err(|e| SessionError::Persistence(e.to_string()))?
                {
                    entities.insert(file.to_string(), doc);
                }
            }

            // Numbered rollback snapshot embeds a checksum over its own payload.
            let payload = json!({
                "session_id": session_id,
                "snapshot_seq": this_seq,
                "meta": meta_value,
                "state": state_value,
                "history": history_value,
                "entities": serde_json::Value::Object(entities),
            });
            let payload_text =
                canonical_json(&payload).map_err(|e| SessionError::Persistence(e.to_string()))?;
            let numbered = json!({
                "payload": payload,
                "checksum": content_hash(&payload_text),
            });
            let meta_value = payload["meta"].clone();
            let state_value = payload["state"].clone();
            let history_value = payload["history"].clone();
            storage
                .write_batch(&[
                    (Self::meta_rel(&session_id), meta_value),
                    (Self::state_rel(&session_id), state_value),
                    (Self::history_rel(&session_id), history_value),
                    (Self::numbered_rel(this_seq), numbered),
                ])
                .map_err(|e| SessionError::Persistence(e.to_string()))?;

            let manifest = storage
                .manifest_for(&Self::covered_files(&session_id))
                .map_err(|e| SessionError::Persistence(e.to_string()))?;
            storage
                .write_json(&Self::manifest_rel(&session_id), &to_value(&manifest)?)
                .map_err(|e| SessionError::Persistence(e.to_string()))?;

            // Rolling retention of numbered snapshots.
            if this_seq + 1 > self.config.snapshot_retention as u64 {
                let stale = this_seq - self.config.snapshot_retention as u64;
                let _ = std::fs::remove_file(storage.path_of(&Self::numbered_rel(stale)));
            }
        }

        *self.snapshot_seq.get_mut(&session_id).unwrap() += 1;
        self.turns_since_save.insert(session_id.clone(), 0);
        self.last_save_at.insert(session_id, Utc::now());
        log::info!(
            "snapshot {} written for session {}",
            this_seq,
            state.session.id
        );
        Ok(this_seq)
    }

    /// Record one applied turn and snapshot if the cadence says so.
    /// Returns `true` when a snapshot was taken.
    pub async fn note_turn(&mut self, state: &SessionState) -> Result<bool, SessionError> {
        let session_id = state.session.id.clone();
        let turns = self
            .turns_since_save
            .entry(session_id.clone())
            .or_insert(0);
        *turns += 1;
        let due_by_count = *turns >= self.config.auto_save_every_n;
        let due_by_age = match self.last_save_at.get(&session_id) {
            Some(at) => {
                let age = Utc::now().signed_duration_since(*at);
                age.num_milliseconds() >= self.config.auto_save_max_age_ms as i64
            }
            None => true,
        };
        if due_by_count || due_by_age {
            self.snapshot(state).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Load a session, validating the manifest and rolling back if needed.
    ///
    /// On a clean manifest the split files are authoritative. On a mismatch
    /// the store walks the numbered snapshots newest-first, restores the
    /// first one whose embedded checksum verifies, rewrites the split files
    /// from it, and returns a [`RecoveryWarning`].
    pub async fn load(
        &mut self,
        session_id: &str,
    ) -> Result<(SessionState, Option<RecoveryWarning>), SessionError> {
        let storage = Arc::clone(&self.storage);
        let mut guard = storage.lock().await;

        let manifest_value = guard
            .read_json(&Self::manifest_rel(session_id))
            .map_err(|e| SessionError::Persistence(e.to_string()))?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let manifest: Manifest =
            from_value(manifest_value).map_err(|e| SessionError::Persistence(e.to_string()))?;

        let mismatched = guard
            .verify_manifest(&manifest)
            .map_err(|e| SessionError::Persistence(e.to_string()))?;

        if mismatched.is_empty() {
            let state = Self::read_split_state(&guard, session_id)?;
            let next = self
                .latest_numbered_seq(&guard, session_id)
                .map(|s| s + 1)
                .unwrap_or(0);
            drop(guard);
            self.prime_sequence(session_id, next);
            return Ok((state, None));
        }

        log::warn!(
            "manifest mismatch for session {}: {:?}; attempting rollback",
            session_id,
            mismatched
        );

        // Walk numbered snapshots newest-first.
        let mut candidate = self.latest_numbered_seq(&guard, session_id)?;
        loop {
            let rel = Self::numbered_rel(candidate);
            let snapshot = guard
                .read_json(&rel)
                .map_err(|e| SessionError::Persistence(e.to_string()))?;
            if let Some(snapshot) = snapshot {
                if let Some(state) = Self::validate_numbered(session_id, &snapshot) {
                    // Restore the split files and the captured entity files
                    // from the good snapshot as one batch.
                    let payload = &snapshot["payload"];
                    let mut batch = vec![
                        (Self::meta_rel(session_id), payload["meta"].clone()),
                        (Self::state_rel(session_id), payload["state"].clone()),
                        (Self::history_rel(session_id), payload["history"].clone()),
                    ];
                    let captured = payload.get("entities").and_then(|v| v.as_object());
                    if let Some(entities) = captured {
                        for (file, doc) in entities {
                            batch.push((file.clone(), doc.clone()));
                        }
                    }
                    // Entity files that did not exist at snapshot time are
                    // removed so the restored tree matches the snapshot.
                    for file in Self::entity_files() {
                        let absent_then = captured.map_or(true, |e| !e.contains_key(*file));
                        if absent_then {
                            let _ = std::fs::remove_file(guard.path_of(file));
                        }
                    }
                    guard.reset_dirty_tracking();
                    guard
                        .write_batch(&batch)
                        .map_err(|e| SessionError::Persistence(e.to_string()))?;
                    let manifest = guard
                        .manifest_for(&Self::covered_files(session_id))
                        .map_err(|e| SessionError::Persistence(e.to_string()))?;
                    guard
                        .write_json(&Self::manifest_rel(session_id), &to_value(&manifest)?)
                        .map_err(|e| SessionError::Persistence(e.to_string()))?;
                    drop(guard);

                    self.prime_sequence(session_id, candidate + 1);
                    let warning = RecoveryWarning {
                        session_id: session_id.to_string(),
                        rolled_back_to: candidate,
                        detail: format!(
                            "snapshot manifest mismatch on {:?}; restored snapshot {}",
                            mismatched, candidate
                        ),
                    };
                    return Ok((state, Some(warning)));
                }
                log::warn!("snapshot {} failed checksum validation", rel);
            }
            if candidate == 0 {
                return Err(SessionError::Unrecoverable(session_id.to_string()));
            }
            candidate -= 1;
        }
    }

    fn read_split_state(
        storage: &SplitStorage,
        session_id: &str,
    ) -> Result<SessionState, SessionError> {
        let meta = storage
            .read_json(&Self::meta_rel(session_id))
            .map_err(|e| SessionError::Persistence(e.to_string()))?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let state = storage
            .read_json(&Self::state_rel(session_id))
            .map_err(|e| SessionError::Persistence(e.to_string()))?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let history = storage
            .read_json(&Self::history_rel(session_id))
            .map_err(|e| SessionError::Persistence(e.to_string()))?
            .unwrap_or_else(|| json!([]));
        Self::assemble_state(meta, state, history)
    }

    fn assemble_state(
        meta: serde_json::Value,
        state: serde_json::Value,
        history: serde_json::Value,
    ) -> Result<SessionState, SessionError> {
        let mut session: Session =
            from_value(meta).map_err(|e| SessionError::Persistence(e.to_string()))?;
        session.action_history =
            from_value(history).map_err(|e| SessionError::Persistence(e.to_string()))?;

        let mut facts: FactStore = from_value(state["facts"].clone())
            .map_err(|e| SessionError::Persistence(e.to_string()))?;
        facts.rebuild_index();
        let knowledge: KnowledgeTracker = from_value(state["knowledge"].clone())
            .map_err(|e| SessionError::Persistence(e.to_string()))?;
        let mut timeline: Timeline = from_value(state["timeline"].clone())
            .map_err(|e| SessionError::Persistence(e.to_string()))?;
        timeline.rebuild_index();

        Ok(SessionState {
            session,
            facts,
            knowledge,
            timeline,
        })
    }

    fn validate_numbered(session_id: &str, snapshot: &serde_json::Value) -> Option<SessionState> {
        let payload = snapshot.get("payload")?;
        let recorded = snapshot.get("checksum")?.as_str()?;
        let text = canonical_json(payload).ok()?;
        if content_hash(&text) != recorded {
            return None;
        }
        if payload.get("session_id")?.as_str()? != session_id {
            return None;
        }
        Self::assemble_state(
            payload.get("meta")?.clone(),
            payload.get("state")?.clone(),
            payload.get("history")?.clone(),
        )
        .ok()
    }

    fn latest_numbered_seq(
        &self,
        storage: &SplitStorage,
        session_id: &str,
    ) -> Result<u64, SessionError> {
        if let Some(seq) = self.snapshot_seq.get(session_id) {
            return Ok(seq.saturating_sub(1));
        }
        // Cold start: scan the sessions directory.
        let dir = storage.path_of("sessions");
        let mut best: Option<u64> = None;
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(seq) = name
                    .strip_prefix("session-")
                    .and_then(|s| s.strip_suffix(".json"))
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    best = Some(best.map_or(seq, |b: u64| b.max(seq)));
                }
            }
        }
        best.ok_or_else(|| SessionError::Unrecoverable(session_id.to_string()))
    }

    fn prime_sequence(&mut self, session_id: &str, next_seq: u64) {
        self.snapshot_seq.insert(session_id.to_string(), next_seq);
        self.turns_since_save.insert(session_id.to_string(), 0);
        self.last_save_at.insert(session_id.to_string(), Utc::now());
    }

    /// Action records with turn index greater than `turn`, for replay audits.
    pub fn actions_since<'a>(state: &'a SessionState, turn: u64) -> &'a [ActionRecord] {
        let start = state
            .session
            .action_history
            .iter()
            .position(|r| r.turn > turn)
            .unwrap_or(state.session.action_history.len());
        &state.session.action_history[start..]
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, SessionError> {
    serde_json::to_value(value).map_err(|e| SessionError::Persistence(e.to_string()))
}

fn from_value<T: for<'de> Deserialize<'de>>(
    value: serde_json::Value,
) -> Result<T, serde_json::Error> {
    serde_json::from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(session_id: &str) -> SessionState {
        SessionState::new(Session::new(
            session_id,
            "campaign-1",
            1,
            SessionSettings::default(),
        ))
    }

    fn store(dir: &std::path::Path) -> SessionStore {
        let storage = Arc::new(Mutex::new(SplitStorage::open(dir).unwrap()));
        SessionStore::new(storage, SessionConfig::default())
    }

    #[test]
    fn ended_sessions_refuse_actions() {
        let mut session = Session::new("s1", "c1", 1, SessionSettings::default());
        session.status = SessionStatus::Ended;
        let err = session
            .record_action(ActionRecord {
                action_id: "a1".into(),
                actor_id: None,
                text: "hello".into(),
                source: ActionSource::Text,
                turn: 1,
                resolved_at: Utc::now(),
            })
            .unwrap_err();
        assert!(matches!(err, SessionError::Ended(_)));
    }

    #[tokio::test]
    async fn snapshot_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        let mut st = state("s1");
        st.session
            .record_action(ActionRecord {
                action_id: "a1".into(),
                actor_id: Some("pA".into()),
                text: "I open the door".into(),
                source: ActionSource::Text,
                turn: 1,
                resolved_at: Utc::now(),
            })
            .unwrap();

        store.snapshot(&st).await.unwrap();
        let (loaded, warning) = store.load("s1").await.unwrap();
        assert!(warning.is_none());
        assert_eq!(loaded.session.turn_counter, 1);
        assert_eq!(loaded.session.action_history.len(), 1);
    }

    #[tokio::test]
    async fn manifest_mismatch_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        let st = state("s1");
        store.snapshot(&st).await.unwrap();

        // Simulate a crash between renames: one covered file changes after
        // the manifest was committed.
        std::fs::write(
            dir.path().join("characters.json"),
            "{\"pA\": {\"hp\": 1}}\n",
        )
        .unwrap();

        let mut fresh = SessionStore::new(
            Arc::new(Mutex::new(SplitStorage::open(dir.path()).unwrap())),
            SessionConfig::default(),
        );
        let (loaded, warning) = fresh.load("s1").await.unwrap();
        let warning = warning.expect("expected a recovery warning");
        assert_eq!(warning.rolled_back_to, 0);
        assert_eq!(loaded.session.id, "s1");
    }

    #[tokio::test]
    async fn autosave_cadence_counts_turns() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Mutex::new(SplitStorage::open(dir.path()).unwrap()));
        let mut store = SessionStore::new(
            storage,
            SessionConfig {
                auto_save_every_n: 2,
                auto_save_max_age_ms: u64::MAX / 4,
                ..SessionConfig::default()
            },
        );
        let st = state("s1");
        store.snapshot(&st).await.unwrap();

        assert!(!store.note_turn(&st).await.unwrap());
        assert!(store.note_turn(&st).await.unwrap());
        assert!(!store.note_turn(&st).await.unwrap());
    }
}
