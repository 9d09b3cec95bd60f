use async_trait::async_trait;
use claudmaster::claudmaster::agent::{
    Agent, AgentContext, AgentDescriptor, AgentError, AgentKind, AgentRequest, AgentResponse,
    Visibility,
};
use claudmaster::claudmaster::event::{EngineEvent, EventHandler};
use claudmaster::claudmaster::party::protocol::{Participant, ServerMessage};
use claudmaster::claudmaster::party::server::{PartyServer, PartyServerConfig};
use claudmaster::claudmaster::session::{ActionSource, SessionConfig};
use claudmaster::claudmaster::tts::{AudioClip, SilenceEngine, TtsEngine, TtsRouter, TtsTier};
use claudmaster::{EngineConfig, Orchestrator};
use std::error::Error;
use std::sync::Arc;
use tokio::sync::Mutex;

struct Narrating;

#[async_trait]
impl Agent for Narrating {
    fn descriptor(&self) -> &AgentDescriptor {
        use std::sync::OnceLock;
        static DESCRIPTOR: OnceLock<AgentDescriptor> = OnceLock::new();
        DESCRIPTOR.get_or_init(|| AgentDescriptor::new("narrator", AgentKind::Voice))
    }

    async fn invoke(
        &self,
        _request: &AgentRequest,
        _context: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        Ok(AgentResponse::from_agent("narrator").with_text("Hello", Visibility::Public))
    }
}

struct BrokenEngine;

#[async_trait]
impl TtsEngine for BrokenEngine {
    fn id(&self) -> &str {
        "broken-quality"
    }
    async fn synthesize(
        &self,
        _text: &str,
        _voice: &str,
    ) -> Result<AudioClip, Box<dyn Error + Send + Sync>> {
        Err("always fails".into())
    }
}

#[derive(Default)]
struct CollectingHandler {
    events: Mutex<Vec<String>>,
}

#[async_trait]
impl EventHandler for CollectingHandler {
    async fn on_event(&self, event: &EngineEvent) {
        let label = match event {
            EngineEvent::TtsCascaded {
                from_tier, to_tier, ..
            } => format!("cascade:{}->{}", from_tier, to_tier),
            EngineEvent::TtsExhausted { .. } => "exhausted".to_string(),
            EngineEvent::TurnCompleted { .. } => "turn_completed".to_string(),
            _ => return,
        };
        self.events.lock().await.push(label);
    }
}

/// Quality tier always fails; narration must cascade exactly once to the
/// fallback, produce one audio stream, and deliver the same text as
/// narrative regardless.
#[tokio::test]
async fn tts_failure_cascades_and_never_drops_the_narrative() {
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(CollectingHandler::default());

    let mut orchestrator =
        Orchestrator::open(EngineConfig::default().with_storage_root(dir.path()))
            .unwrap()
            .with_events(handler.clone());

    let party = PartyServer::new(PartyServerConfig::default(), None);
    let tts = Arc::new(
        TtsRouter::new(Some(handler.clone()))
            .with_engine(TtsTier::Quality, Arc::new(BrokenEngine))
            .with_engine(TtsTier::Fallback, Arc::new(SilenceEngine::default())),
    );

    let session = orchestrator
        .start_session("campaign-1", SessionConfig::default(), vec![Arc::new(Narrating)])
        .await
        .unwrap();
    party
        .attach(
            session.as_str(),
            dir.path(),
            vec![Participant::player("pA", "pA")],
            orchestrator.store(),
        )
        .await
        .unwrap();
    orchestrator.attach_party(Arc::clone(&party));
    orchestrator.attach_tts(tts);

    orchestrator
        .submit_action(&session, Some("pA".into()), "I greet the innkeeper", ActionSource::Text)
        .unwrap();
    let result = orchestrator.process_next(&session).await.unwrap().unwrap();

    // The text was delivered whatever the audio did.
    assert_eq!(result.narrative.as_deref(), Some("Hello"));
    let replay = party.replay_envelopes("pA", 0).await.unwrap();
    assert!(replay
        .iter()
        .any(|e| matches!(&e.message, ServerMessage::Narrative { text, .. } if text == "Hello")));

    // Exactly one cascade, no exhaustion.
    let events = handler.events.lock().await;
    let cascades: Vec<_> = events.iter().filter(|e| e.starts_with("cascade:")).collect();
    assert_eq!(cascades.len(), 1);
    assert_eq!(cascades[0], "cascade:quality->fallback");
    assert!(!events.iter().any(|e| e == "exhausted"));
}

/// With no engines bound at all, the turn still completes and delivers text.
#[tokio::test]
async fn missing_tts_engines_never_fail_the_turn() {
    let dir = tempfile::tempdir().unwrap();
    let mut orchestrator =
        Orchestrator::open(EngineConfig::default().with_storage_root(dir.path())).unwrap();
    let tts = Arc::new(TtsRouter::new(None));
    orchestrator.attach_tts(tts);

    let session = orchestrator
        .start_session("campaign-1", SessionConfig::default(), vec![Arc::new(Narrating)])
        .await
        .unwrap();
    orchestrator
        .submit_action(&session, None, "I greet the innkeeper", ActionSource::Text)
        .unwrap();
    let result = orchestrator.process_next(&session).await.unwrap().unwrap();
    assert_eq!(result.narrative.as_deref(), Some("Hello"));
}
