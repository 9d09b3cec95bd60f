use async_trait::async_trait;
use claudmaster::claudmaster::agent::{
    Agent, AgentContext, AgentDescriptor, AgentError, AgentKind, AgentRequest, AgentResponse,
    StateDelta, Visibility,
};
use claudmaster::claudmaster::party::protocol::{ActionStatus, Participant, ServerMessage};
use claudmaster::claudmaster::party::server::{PartyServer, PartyServerConfig};
use claudmaster::claudmaster::session::{ActionSource, SessionConfig};
use claudmaster::claudmaster::storage::EntityCategory;
use claudmaster::claudmaster::tools::StoreWriter;
use claudmaster::{EngineConfig, Orchestrator};
use serde_json::json;
use std::sync::Arc;

struct Scripted {
    descriptor: AgentDescriptor,
    text: Option<(String, Visibility)>,
    deltas: Vec<StateDelta>,
}

#[async_trait]
impl Agent for Scripted {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn invoke(
        &self,
        _request: &AgentRequest,
        _context: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        let mut response = AgentResponse::from_agent(&self.descriptor.name);
        if let Some((text, visibility)) = &self.text {
            response = response.with_text(text.clone(), visibility.clone());
        }
        for delta in &self.deltas {
            response = response.with_delta(delta.clone());
        }
        Ok(response)
    }
}

/// The full bridge: a player submits over the relay, the orchestrator pumps
/// the queue, and exactly one history entry plus one durable response exist
/// afterwards, with statuses lined up under the same action id.
#[tokio::test]
async fn party_submission_pumps_through_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let mut orchestrator =
        Orchestrator::open(EngineConfig::default().with_storage_root(dir.path())).unwrap();

    // Seed a character record with a DM-only field.
    orchestrator
        .store()
        .apply(&[
            StateDelta::new(EntityCategory::Character, "pA", "name", json!("Aria")),
            StateDelta::new(EntityCategory::Character, "pA", "hp.current", json!(20)),
            StateDelta::new(
                EntityCategory::Character,
                "pA",
                "dm_only.secret",
                json!("cursed"),
            ),
        ])
        .await
        .unwrap();

    let narrator = Scripted {
        descriptor: AgentDescriptor::new("narrator", AgentKind::Voice),
        text: Some(("The blow lands hard.".to_string(), Visibility::Public)),
        deltas: Vec::new(),
    };
    let archivist = Scripted {
        descriptor: AgentDescriptor::new("archivist", AgentKind::Ledger).with_priority(10),
        text: None,
        deltas: vec![StateDelta::new(
            EntityCategory::Character,
            "pA",
            "hp.current",
            json!(14),
        )],
    };

    let session = orchestrator
        .start_session(
            "campaign-1",
            SessionConfig::default(),
            vec![Arc::new(narrator), Arc::new(archivist)],
        )
        .await
        .unwrap();

    let party = PartyServer::new(PartyServerConfig::default(), None);
    party
        .attach(
            session.as_str(),
            dir.path(),
            vec![
                Participant::dm("dm", "dm-token"),
                Participant::player("pA", "pA"),
            ],
            orchestrator.store(),
        )
        .await
        .unwrap();
    orchestrator.attach_party(Arc::clone(&party));

    // Idle pump is a no-op.
    assert!(orchestrator.pump_party(&session).await.unwrap().is_none());

    let action_id = party
        .submit("pA", "I take 6 damage", ActionSource::Text)
        .await
        .unwrap();
    assert_eq!(
        party.action_status(&action_id).await,
        Some(ActionStatus::Queued)
    );

    let result = orchestrator
        .pump_party(&session)
        .await
        .unwrap()
        .expect("a queued action should process");
    assert_eq!(result.action_id, action_id);
    assert_eq!(result.narrative.as_deref(), Some("The blow lands hard."));

    // Exactly one history entry and one matching durable response.
    assert_eq!(orchestrator.action_history_len(&session), 1);
    assert_eq!(party.response_count().await, 1);
    assert_eq!(
        party.action_status(&action_id).await,
        Some(ActionStatus::Resolved)
    );

    // The touched character was pushed, filtered per recipient.
    let for_pa = party.replay_envelopes("pA", 0).await.unwrap();
    let update = for_pa
        .iter()
        .find_map(|e| match &e.message {
            ServerMessage::CharacterUpdate { record, .. } => Some(record.clone()),
            _ => None,
        })
        .expect("expected a character update");
    assert_eq!(update["hp"]["current"], json!(14));
    assert!(update.get("dm_only").is_none());

    let for_dm = party.replay_envelopes("dm", 0).await.unwrap();
    let dm_update = for_dm
        .iter()
        .find_map(|e| match &e.message {
            ServerMessage::CharacterUpdate { record, .. } => Some(record.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(dm_update["dm_only"]["secret"], json!("cursed"));
}
