//! Host tool surface and external storage contracts.
//!
//! The engine consumes capabilities the host runtime registers: dice, CRUD on
//! characters/NPCs/locations/quests, rules lookup, library queries for the
//! Module Keeper. Each tool is `{name, schema, invoke(args, caller)}`; the
//! registry routes calls through the [`PermissionResolver`] first and filters
//! output through the [`OutputFilter`] on the way back, so agents can invoke
//! tools without re-implementing either policy.
//!
//! Character, NPC, location, quest and game-state records are opaque to the
//! core. Reads go through [`StoreReader`], writes through [`StoreWriter`];
//! [`CampaignStore`] is the split-file implementation of both.
//!
//! # Example: registering a host tool
//!
//! ```rust,no_run
//! use claudmaster::claudmaster::tools::{HostTool, ToolRegistry, ToolResult};
//! use claudmaster::claudmaster::permissions::CallerContext;
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//!
//! struct FixedDice;
//!
//! #[async_trait]
//! impl HostTool for FixedDice {
//!     fn name(&self) -> &str { "roll_dice" }
//!     fn schema(&self) -> Value {
//!         json!({"type": "object", "properties": {"notation": {"type": "string"}}})
//!     }
//!     async fn invoke(&self, _args: Value, _caller: &CallerContext) -> ToolResult {
//!         ToolResult::success(json!({"rolls": [4], "total": 4}))
//!     }
//! }
//! ```

use crate::claudmaster::agent::{DiceRoll, StateDelta};
use crate::claudmaster::output_filter::{OutputFilter, Recipient};
use crate::claudmaster::permissions::{CallerContext, PermissionDenied, PermissionResolver};
use crate::claudmaster::storage::{EntityCategory, SplitStorage, StorageError};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Result of a tool execution.
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Whether the tool execution was successful.
    pub success: bool,
    /// The output data from the tool.
    pub output: Value,
    /// Optional error message if execution failed.
    pub error: Option<String>,
}

impl ToolResult {
    /// Convenience constructor for successful tool execution.
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    /// Convenience constructor for failed tool execution.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Errors surfaced by the tool layer.
#[derive(Debug)]
pub enum ToolError {
    /// No tool with that name is registered.
    NotFound(String),
    /// The permission matrix rejected the call.
    Denied(PermissionDenied),
    /// The tool ran and reported failure.
    ExecutionFailed(String),
    /// The tool output did not match the expected shape.
    MalformedOutput(String),
    /// Underlying storage failed.
    Storage(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "Tool not found: {}", name),
            ToolError::Denied(inner) => write!(f, "{}", inner),
            ToolError::ExecutionFailed(msg) => write!(f, "Tool execution failed: {}", msg),
            ToolError::MalformedOutput(msg) => write!(f, "Malformed tool output: {}", msg),
            ToolError::Storage(msg) => write!(f, "Store error: {}", msg),
        }
    }
}

impl Error for ToolError {}

impl From<StorageError> for ToolError {
    fn from(e: StorageError) -> Self {
        ToolError::Storage(e.to_string())
    }
}

/// A host-registered capability.
#[async_trait]
pub trait HostTool: Send + Sync {
    /// Registry name, also used as the permission operation.
    fn name(&self) -> &str;
    /// JSON Schema of the accepted arguments.
    fn schema(&self) -> Value;
    /// Execute. Behavior is opaque to the core.
    async fn invoke(&self, args: Value, caller: &CallerContext) -> ToolResult;
}

/// Registry of host tools with permission and output-filter enforcement.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn HostTool>>,
    permissions: PermissionResolver,
    filter: OutputFilter,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(PermissionResolver::standard())
    }
}

impl ToolRegistry {
    pub fn new(permissions: PermissionResolver) -> Self {
        Self {
            tools: HashMap::new(),
            permissions,
            filter: OutputFilter::new(),
        }
    }

    /// Register a tool, replacing any prior tool of the same name.
    pub fn register(&mut self, tool: Arc<dyn HostTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Names of every registered tool.
    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Invoke a tool on behalf of `caller`.
    ///
    /// The permission matrix is consulted with the tool name as the
    /// operation; `owner_participant_id` feeds conditional entries. Output is
    /// filtered for the caller's role before it is returned.
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        caller: &CallerContext,
        owner_participant_id: Option<&str>,
    ) -> Result<ToolResult, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        self.permissions
            .resolve(caller, name, owner_participant_id)
            .map_err(ToolError::Denied)?;

        let mut result = tool.invoke(args, caller).await;
        if !result.success {
            return Err(ToolError::ExecutionFailed(
                result.error.unwrap_or_else(|| "unspecified".to_string()),
            ));
        }

        let recipient = Recipient {
            role: caller.role,
            participant_id: caller.participant_id.clone(),
        };
        result.output = self
            .filter
            .filter_value(&result.output, &recipient)
            .unwrap_or(Value::Null);
        Ok(result)
    }

    /// Roll dice through the host's `roll_dice` tool.
    pub async fn roll_dice(
        &self,
        notation: &str,
        label: &str,
        caller: &CallerContext,
    ) -> Result<DiceRoll, ToolError> {
        let result = self
            .invoke(
                "roll_dice",
                serde_json::json!({"notation": notation, "label": label}),
                caller,
                None,
            )
            .await?;
        let rolls = result
            .output
            .get("rolls")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_i64).map(|v| v as i32).collect())
            .ok_or_else(|| ToolError::MalformedOutput("roll_dice: missing rolls".into()))?;
        let total = result
            .output
            .get("total")
            .and_then(Value::as_i64)
            .ok_or_else(|| ToolError::MalformedOutput("roll_dice: missing total".into()))?
            as i32;
        Ok(DiceRoll {
            notation: notation.to_string(),
            label: label.to_string(),
            rolls,
            total,
        })
    }

    /// Rules lookup through the host's `search_rules` tool.
    pub async fn search_rules(
        &self,
        query: &str,
        caller: &CallerContext,
    ) -> Result<Value, ToolError> {
        let result = self
            .invoke("search_rules", serde_json::json!({"query": query}), caller, None)
            .await?;
        Ok(result.output)
    }

    /// Adventure-module library query used by the Module Keeper.
    pub async fn query_library(
        &self,
        query: &str,
        caller: &CallerContext,
    ) -> Result<Value, ToolError> {
        let result = self
            .invoke("query_library", serde_json::json!({"query": query}), caller, None)
            .await?;
        Ok(result.output)
    }

    /// Spell lookup through the host's `get_spell_info` tool.
    pub async fn get_spell_info(
        &self,
        name: &str,
        caller: &CallerContext,
    ) -> Result<Value, ToolError> {
        let result = self
            .invoke("get_spell_info", serde_json::json!({"name": name}), caller, None)
            .await?;
        Ok(result.output)
    }

    /// Monster lookup through the host's `get_monster_info` tool.
    pub async fn get_monster_info(
        &self,
        name: &str,
        caller: &CallerContext,
    ) -> Result<Value, ToolError> {
        let result = self
            .invoke("get_monster_info", serde_json::json!({"name": name}), caller, None)
            .await?;
        Ok(result.output)
    }

    /// Field-level character write through the host's `update_character` tool.
    ///
    /// `owner_participant_id` feeds the conditional permission entry: players
    /// may only write characters they own.
    pub async fn update_character(
        &self,
        character_id: &str,
        field: &str,
        value: Value,
        caller: &CallerContext,
        owner_participant_id: Option<&str>,
    ) -> Result<(), ToolError> {
        self.invoke(
            "update_character",
            serde_json::json!({"id": character_id, "field": field, "value": value}),
            caller,
            owner_participant_id,
        )
        .await?;
        Ok(())
    }

    /// Inventory add through the host's `add_item` tool.
    pub async fn add_item(
        &self,
        character_id: &str,
        item: Value,
        caller: &CallerContext,
        owner_participant_id: Option<&str>,
    ) -> Result<(), ToolError> {
        self.invoke(
            "add_item",
            serde_json::json!({"id": character_id, "item": item}),
            caller,
            owner_participant_id,
        )
        .await?;
        Ok(())
    }

    /// Apply a named effect through the host's `apply_effect` tool.
    pub async fn apply_effect(
        &self,
        character_id: &str,
        effect: &str,
        caller: &CallerContext,
    ) -> Result<(), ToolError> {
        self.invoke(
            "apply_effect",
            serde_json::json!({"id": character_id, "effect": effect}),
            caller,
            None,
        )
        .await?;
        Ok(())
    }

    /// Remove a named effect through the host's `remove_effect` tool.
    pub async fn remove_effect(
        &self,
        character_id: &str,
        effect: &str,
        caller: &CallerContext,
    ) -> Result<(), ToolError> {
        self.invoke(
            "remove_effect",
            serde_json::json!({"id": character_id, "effect": effect}),
            caller,
            None,
        )
        .await?;
        Ok(())
    }
}

/// Read-only access to externally owned campaign records.
#[async_trait]
pub trait StoreReader: Send + Sync {
    /// Fetch one record by category and id. `Ok(None)` when absent.
    async fn get(&self, category: EntityCategory, id: &str) -> Result<Option<Value>, ToolError>;
    /// Ids present in a category.
    async fn list_ids(&self, category: EntityCategory) -> Result<Vec<String>, ToolError>;
    /// The `campaign.json` metadata record.
    async fn campaign_meta(&self) -> Result<Option<Value>, ToolError>;
}

/// Write access used exclusively by the persistence stage of a turn.
#[async_trait]
pub trait StoreWriter: Send + Sync {
    /// Apply a set of field-level deltas as one storage batch.
    async fn apply(&self, deltas: &[StateDelta]) -> Result<(), ToolError>;
}

/// Split-file implementation of [`StoreReader`] and [`StoreWriter`].
///
/// Each category file holds an object keyed by entity id. Deltas set dotted
/// field paths inside a record, and every category touched by one `apply`
/// call commits in a single [`SplitStorage`] batch.
pub struct CampaignStore {
    storage: Arc<Mutex<SplitStorage>>,
}

impl CampaignStore {
    pub fn new(storage: Arc<Mutex<SplitStorage>>) -> Self {
        Self { storage }
    }

    /// The shared storage handle (the session store commits through it too).
    pub fn storage(&self) -> Arc<Mutex<SplitStorage>> {
        Arc::clone(&self.storage)
    }
}

#[async_trait]
impl StoreReader for CampaignStore {
    async fn get(&self, category: EntityCategory, id: &str) -> Result<Option<Value>, ToolError> {
        let storage = self.storage.lock().await;
        let doc = storage.read_json(category.file_name())?;
        Ok(doc.and_then(|d| d.get(id).cloned()))
    }

    async fn list_ids(&self, category: EntityCategory) -> Result<Vec<String>, ToolError> {
        let storage = self.storage.lock().await;
        let doc = storage.read_json(category.file_name())?;
        Ok(match doc {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn campaign_meta(&self) -> Result<Option<Value>, ToolError> {
        let storage = self.storage.lock().await;
        Ok(storage.read_json("campaign.json")?)
    }
}

#[async_trait]
impl StoreWriter for CampaignStore {
    async fn apply(&self, deltas: &[StateDelta]) -> Result<(), ToolError> {
        if deltas.is_empty() {
            return Ok(());
        }
        let mut storage = self.storage.lock().await;

        // Load every touched category once, apply all deltas, commit as one
        // batch so a turn's writes land together.
        let mut docs: HashMap<EntityCategory, Value> = HashMap::new();
        for delta in deltas {
            let doc = match docs.entry(delta.category) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let loaded = storage
                        .read_json(delta.category.file_name())?
                        .unwrap_or_else(|| Value::Object(Map::new()));
                    entry.insert(loaded)
                }
            };
            let record = doc
                .as_object_mut()
                .ok_or_else(|| {
                    ToolError::Storage(format!(
                        "{} is not an object document",
                        delta.category.file_name()
                    ))
                })?
                .entry(delta.entity_id.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            set_field_path(record, &delta.field, delta.value.clone());
        }

        let batch: Vec<(String, Value)> = docs
            .into_iter()
            .map(|(category, doc)| (category.file_name().to_string(), doc))
            .collect();
        storage.write_batch(&batch)?;
        Ok(())
    }
}

/// Set `record[path] = value` where `path` is a dotted field path, creating
/// intermediate objects as needed.
pub fn set_field_path(record: &mut Value, path: &str, value: Value) {
    let mut current = record;
    let parts: Vec<&str> = path.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = current.as_object_mut().unwrap();
        if i == parts.len() - 1 {
            map.insert((*part).to_string(), value);
            return;
        }
        current = map
            .entry((*part).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Read a dotted field path out of a record.
pub fn get_field_path<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claudmaster::permissions::Role;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl HostTool for EchoTool {
        fn name(&self) -> &str {
            "read_location"
        }
        fn schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn invoke(&self, args: Value, _caller: &CallerContext) -> ToolResult {
            ToolResult::success(json!({"echo": args, "dm_only": {"note": "hidden"}}))
        }
    }

    #[tokio::test]
    async fn invoke_applies_permissions_and_filtering() {
        let mut registry = ToolRegistry::default();
        registry.register(Arc::new(EchoTool));

        let player = CallerContext::participant(Role::Player, "p1");
        let result = registry
            .invoke("read_location", json!({"id": "cellar"}), &player, None)
            .await
            .unwrap();
        assert!(result.output.get("dm_only").is_none());

        let observer = CallerContext::participant(Role::Observer, "o1");
        assert!(registry
            .invoke("read_location", json!({}), &observer, None)
            .await
            .is_ok());

        // Unregistered tool degrades with NotFound, never panics.
        let err = registry
            .invoke("roll_dice", json!({}), &player, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn deltas_persist_through_split_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Mutex::new(SplitStorage::open(dir.path()).unwrap()));
        let store = CampaignStore::new(storage);

        store
            .apply(&[
                StateDelta::new(EntityCategory::Character, "pA", "hp.current", json!(14)),
                StateDelta::new(EntityCategory::Character, "pA", "hp.max", json!(20)),
                StateDelta::new(EntityCategory::GameState, "state", "round", json!(2)),
            ])
            .await
            .unwrap();

        let record = store
            .get(EntityCategory::Character, "pA")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record["hp"]["current"], json!(14));
        assert_eq!(record["hp"]["max"], json!(20));

        let ids = store.list_ids(EntityCategory::GameState).await.unwrap();
        assert_eq!(ids, vec!["state".to_string()]);
    }

    #[test]
    fn field_paths_create_intermediate_objects() {
        let mut record = json!({});
        set_field_path(&mut record, "inventory.slots.0", json!("torch"));
        assert_eq!(record["inventory"]["slots"]["0"], json!("torch"));
        assert_eq!(
            get_field_path(&record, "inventory.slots.0"),
            Some(&json!("torch"))
        );
    }
}
