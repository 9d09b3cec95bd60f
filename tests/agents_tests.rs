use async_trait::async_trait;
use claudmaster::claudmaster::agents::{Arbiter, Archivist, ModuleKeeper, Narrator};
use claudmaster::claudmaster::llm_client::ScriptedClient;
use claudmaster::claudmaster::permissions::CallerContext;
use claudmaster::claudmaster::session::{ActionSource, SessionConfig};
use claudmaster::claudmaster::storage::EntityCategory;
use claudmaster::claudmaster::tools::{HostTool, StoreReader, StoreWriter, ToolRegistry, ToolResult};
use claudmaster::claudmaster::agent::StateDelta;
use claudmaster::{EngineConfig, Orchestrator};
use serde_json::{json, Value};
use std::sync::Arc;

struct FixedDice;

#[async_trait]
impl HostTool for FixedDice {
    fn name(&self) -> &str {
        "roll_dice"
    }
    fn schema(&self) -> Value {
        json!({"type": "object", "properties": {"notation": {"type": "string"}}})
    }
    async fn invoke(&self, _args: Value, _caller: &CallerContext) -> ToolResult {
        ToolResult::success(json!({"rolls": [18], "total": 18}))
    }
}

struct TinyLibrary;

#[async_trait]
impl HostTool for TinyLibrary {
    fn name(&self) -> &str {
        "query_library"
    }
    fn schema(&self) -> Value {
        json!({"type": "object", "properties": {"query": {"type": "string"}}})
    }
    async fn invoke(&self, _args: Value, _caller: &CallerContext) -> ToolResult {
        ToolResult::success(json!({
            "results": [{"text": "The goblin warrens lie beneath the old mill."}]
        }))
    }
}

fn agent_stack(tools: Arc<ToolRegistry>) -> Vec<Arc<dyn claudmaster::Agent>> {
    let narrator_client = Arc::new(ScriptedClient::new(
        "narrator-model",
        vec!["Steel rings out; the goblin staggers back."],
    ));
    vec![
        Arc::new(ModuleKeeper::new(Arc::clone(&tools))),
        Arc::new(Archivist::new()),
        Arc::new(Arbiter::new(Arc::clone(&tools))),
        Arc::new(Narrator::new(narrator_client)),
    ]
}

#[tokio::test]
async fn the_builtin_stack_adjudicates_and_narrates_a_combat_turn() {
    let dir = tempfile::tempdir().unwrap();
    let mut orchestrator =
        Orchestrator::open(EngineConfig::default().with_storage_root(dir.path())).unwrap();

    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(FixedDice));
    registry.register(Arc::new(TinyLibrary));
    let tools = Arc::new(registry);

    let session = orchestrator
        .start_session("campaign-1", SessionConfig::default(), agent_stack(tools))
        .await
        .unwrap();

    orchestrator
        .submit_action(
            &session,
            Some("pA".into()),
            "I attack the goblin with my axe",
            ActionSource::Text,
        )
        .unwrap();
    let result = orchestrator.process_next(&session).await.unwrap().unwrap();

    assert!(!result.degraded);
    // Narrator voice wraps the turn.
    assert_eq!(
        result.narrative.as_deref(),
        Some("Steel rings out; the goblin staggers back.")
    );
    // Arbiter rolled once and succeeded against the standard DC.
    assert_eq!(result.dice_rolls.len(), 1);
    assert_eq!(result.dice_rolls[0].total, 18);
    let party_text = result.payload.party.as_deref().unwrap_or_default();
    assert!(party_text.contains("succeeds"));
    // The ruling's rationale stays DM-only.
    let dm_text = result.payload.dm_only.as_deref().unwrap_or_default();
    assert!(dm_text.contains("d20=18"));
}

#[tokio::test]
async fn the_archivist_applies_damage_arithmetic() {
    let dir = tempfile::tempdir().unwrap();
    let mut orchestrator =
        Orchestrator::open(EngineConfig::default().with_storage_root(dir.path())).unwrap();
    orchestrator
        .store()
        .apply(&[
            StateDelta::new(EntityCategory::Character, "goblin", "hp.current", json!(12)),
            StateDelta::new(EntityCategory::Character, "goblin", "hp.max", json!(12)),
        ])
        .await
        .unwrap();

    let session = orchestrator
        .start_session(
            "campaign-1",
            SessionConfig::default(),
            vec![Arc::new(Archivist::new())],
        )
        .await
        .unwrap();

    orchestrator
        .submit_action(
            &session,
            Some("pA".into()),
            "I charge! The goblin takes 6 damage",
            ActionSource::Text,
        )
        .unwrap();
    let result = orchestrator.process_next(&session).await.unwrap().unwrap();

    assert_eq!(result.state_deltas.len(), 1);
    assert_eq!(result.state_deltas[0].field, "hp.current");
    assert_eq!(result.state_deltas[0].value, json!(6));

    let record = orchestrator
        .store()
        .get(EntityCategory::Character, "goblin")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record["hp"]["current"], json!(6));
}

#[tokio::test]
async fn a_missing_dice_tool_degrades_the_ruling_not_the_turn() {
    let dir = tempfile::tempdir().unwrap();
    let mut orchestrator =
        Orchestrator::open(EngineConfig::default().with_storage_root(dir.path())).unwrap();

    // Empty registry: no roll_dice, no library.
    let tools = Arc::new(ToolRegistry::default());
    let session = orchestrator
        .start_session("campaign-1", SessionConfig::default(), agent_stack(tools))
        .await
        .unwrap();

    orchestrator
        .submit_action(
            &session,
            Some("pA".into()),
            "I attack the goblin with my axe",
            ActionSource::Text,
        )
        .unwrap();
    let result = orchestrator.process_next(&session).await.unwrap().unwrap();

    // The Narrator still speaks; the Arbiter's missing capability shows up
    // as an agent-level error only.
    assert!(result.narrative.is_some());
    assert!(result.dice_rolls.is_empty());
    assert!(result
        .agent_errors
        .iter()
        .any(|e| e.contains("roll_dice") || e.contains("query_library")));
}
