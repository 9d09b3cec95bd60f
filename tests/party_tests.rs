use claudmaster::claudmaster::party::protocol::{
    ActionStatus, Participant, PartyResponse, ServerMessage,
};
use claudmaster::claudmaster::party::server::{CombatGate, PartyServer, PartyServerConfig};
use claudmaster::claudmaster::session::ActionSource;
use claudmaster::claudmaster::storage::SplitStorage;
use claudmaster::claudmaster::tools::{CampaignStore, StoreReader};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

async fn attached_server(dir: &std::path::Path) -> Arc<PartyServer> {
    let _ = env_logger::builder().is_test(true).try_init();
    let storage = Arc::new(Mutex::new(SplitStorage::open(dir).unwrap()));
    let store: Arc<dyn StoreReader> = Arc::new(CampaignStore::new(storage));
    let server = PartyServer::new(PartyServerConfig::default(), None);
    server
        .attach(
            "sess-1",
            dir,
            vec![
                Participant::dm("dm", "dm-secret-token"),
                Participant::player("pA", "pA"),
                Participant::player("pB", "pB"),
                Participant::observer("spectator"),
            ],
            store,
        )
        .await
        .unwrap();
    server
}

#[tokio::test]
async fn tokens_resolve_to_participants() {
    let dir = tempfile::tempdir().unwrap();
    let server = attached_server(dir.path()).await;

    // A player token is their character id; the observer token is fixed.
    assert_eq!(server.authenticate("pA").await.unwrap().id, "pA");
    assert_eq!(
        server.authenticate("OBSERVER").await.unwrap().id,
        "spectator"
    );
    assert!(server.authenticate("nope").await.is_err());
}

#[tokio::test]
async fn combat_gating_rejects_out_of_turn_submissions() {
    let dir = tempfile::tempdir().unwrap();
    let server = attached_server(dir.path()).await;

    server
        .set_combat_state(CombatGate {
            active: true,
            order: vec!["pA".to_string(), "pB".to_string()],
            turn_index: 0,
        })
        .await;

    // pB is not on turn: the submission succeeds but lands rejected.
    let action_id = server
        .submit("pB", "I cast light", ActionSource::Text)
        .await
        .unwrap();
    assert_eq!(
        server.action_status(&action_id).await,
        Some(ActionStatus::Rejected)
    );

    // The submitter gets an action_status push carrying the reason.
    let envelopes = server.replay_envelopes("pB", 0).await.unwrap();
    let rejection = envelopes
        .iter()
        .find_map(|e| match &e.message {
            ServerMessage::ActionStatus {
                action_id: id,
                status,
                reason,
            } if id == &action_id => Some((*status, reason.clone())),
            _ => None,
        })
        .expect("expected an action_status push");
    assert_eq!(rejection.0, ActionStatus::Rejected);
    assert_eq!(rejection.1.as_deref(), Some("not your turn"));

    // Other participants never see the rejection.
    let for_pa = server.replay_envelopes("pA", 0).await.unwrap();
    assert!(for_pa.iter().all(|e| !matches!(
        &e.message,
        ServerMessage::ActionStatus { action_id: id, .. } if id == &action_id
    )));

    // The participant on turn submits normally.
    let ok_id = server
        .submit("pA", "I attack", ActionSource::Text)
        .await
        .unwrap();
    assert_eq!(server.action_status(&ok_id).await, Some(ActionStatus::Queued));

    // The DM bypasses the gate.
    let dm_id = server
        .submit("dm", "The ceiling collapses", ActionSource::Text)
        .await
        .unwrap();
    assert_eq!(server.action_status(&dm_id).await, Some(ActionStatus::Queued));
}

#[tokio::test]
async fn observers_cannot_submit() {
    let dir = tempfile::tempdir().unwrap();
    let server = attached_server(dir.path()).await;
    assert!(server
        .submit("spectator", "I shout advice", ActionSource::Text)
        .await
        .is_err());
}

#[tokio::test]
async fn published_responses_filter_per_recipient() {
    let dir = tempfile::tempdir().unwrap();
    let server = attached_server(dir.path()).await;

    let mut private = BTreeMap::new();
    private.insert("pA".to_string(), "You see a trap.".to_string());
    server
        .publish(PartyResponse {
            id: "resp-1".to_string(),
            action_id: "act-1".to_string(),
            public: Some("The room is dark.".to_string()),
            private_by_recipient: private,
            dm_only: Some("The trap is a real poison dart.".to_string()),
            produced_at: Utc::now(),
        })
        .await
        .unwrap();

    let texts = |envelopes: Vec<claudmaster::claudmaster::party::protocol::Envelope>| {
        envelopes
            .into_iter()
            .filter_map(|e| match e.message {
                ServerMessage::Narrative { text, .. } => Some(text),
                ServerMessage::Private { text } => Some(text),
                _ => None,
            })
            .collect::<Vec<_>>()
    };

    let for_pa = texts(server.replay_envelopes("pA", 0).await.unwrap());
    assert!(for_pa.contains(&"The room is dark.".to_string()));
    assert!(for_pa.contains(&"You see a trap.".to_string()));
    assert!(!for_pa.iter().any(|t| t.contains("poison dart")));

    let for_pb = texts(server.replay_envelopes("pB", 0).await.unwrap());
    assert_eq!(for_pb, vec!["The room is dark.".to_string()]);

    let for_dm = texts(server.replay_envelopes("dm", 0).await.unwrap());
    assert_eq!(for_dm.len(), 3);

    let for_observer = texts(server.replay_envelopes("spectator", 0).await.unwrap());
    assert_eq!(for_observer, vec!["The room is dark.".to_string()]);

    // The response is durable.
    assert_eq!(server.response_count().await, 1);
}

#[tokio::test]
async fn replay_respects_the_acked_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let server = attached_server(dir.path()).await;

    for i in 0..3 {
        server
            .publish(PartyResponse {
                id: format!("resp-{}", i),
                action_id: format!("act-{}", i),
                public: Some(format!("chapter {}", i)),
                private_by_recipient: BTreeMap::new(),
                dm_only: None,
                produced_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let all = server.replay_envelopes("pB", 0).await.unwrap();
    assert_eq!(all.len(), 3);
    // Ack past the second message: only the tail replays.
    let tail = server.replay_envelopes("pB", all[1].seq).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert!(matches!(
        &tail[0].message,
        ServerMessage::Narrative { text, .. } if text == "chapter 2"
    ));
}

#[tokio::test]
async fn private_messages_reach_only_their_recipient() {
    let dir = tempfile::tempdir().unwrap();
    let server = attached_server(dir.path()).await;

    server.send_private("pA", "Your ring hums faintly.").await.unwrap();
    assert!(server.send_private("ghost", "hello?").await.is_err());

    let for_pa = server.replay_envelopes("pA", 0).await.unwrap();
    assert!(for_pa
        .iter()
        .any(|e| matches!(&e.message, ServerMessage::Private { text } if text.contains("ring"))));
    let for_pb = server.replay_envelopes("pB", 0).await.unwrap();
    assert!(for_pb.is_empty());
}
