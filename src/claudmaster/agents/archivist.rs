//! The Archivist: deterministic state queries and pure arithmetic deltas.
//!
//! Zero model tokens ever. The Archivist reads campaign records through the
//! context's store view and answers questions about characters, combat and
//! inventory; for combat turns it scans the utterance for damage phrasing
//! ("takes 6 damage", "deals 4 damage to the goblin") and proposes the
//! resulting hit-point delta so the ledger stays exact while the Narrator is
//! free to be colourful.

use crate::claudmaster::agent::{
    Agent, AgentContext, AgentDescriptor, AgentError, AgentKind, AgentRequest, AgentResponse,
    RetryPolicy, StateDelta, Visibility,
};
use crate::claudmaster::intent::IntentType;
use crate::claudmaster::storage::EntityCategory;
use crate::claudmaster::tools::get_field_path;
use async_trait::async_trait;
use serde_json::json;

pub struct Archivist {
    descriptor: AgentDescriptor,
}

impl Default for Archivist {
    fn default() -> Self {
        Self::new()
    }
}

impl Archivist {
    pub fn new() -> Self {
        Self {
            descriptor: AgentDescriptor::new("archivist", AgentKind::Ledger)
                .with_capability("state_query")
                .with_capability("arithmetic")
                .with_priority(10)
                .with_timeout_ms(5_000)
                .with_retry(RetryPolicy::NonIdempotentOnly),
        }
    }

    /// Apply `amount` of damage to a record's `hp.current`, clamped at zero.
    pub fn damage_delta(record: &serde_json::Value, entity_id: &str, amount: i64) -> StateDelta {
        let current = get_field_path(record, "hp.current")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0);
        StateDelta::new(
            EntityCategory::Character,
            entity_id,
            "hp.current",
            json!((current - amount).max(0)),
        )
    }
}

/// Scan an utterance for a damage amount and optional target.
///
/// Recognizes `"<target>? takes|deals|suffers N damage (to <target>)?"`.
/// Plain string scanning, case handled by the caller's normalization.
pub fn parse_damage(text: &str) -> Option<(Option<String>, i64)> {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered.split_whitespace().collect();
    let verb_at = words
        .iter()
        .position(|w| matches!(*w, "takes" | "deals" | "suffers" | "take" | "deal"))?;
    let amount: i64 = words.get(verb_at + 1).and_then(|w| w.parse().ok())?;
    if words.get(verb_at + 2).copied() != Some("damage") {
        return None;
    }
    // "... damage to the goblin" names the target after the amount.
    let target = match words.get(verb_at + 3).copied() {
        Some("to") => {
            let mut rest = &words[verb_at + 4..];
            if rest.first().copied() == Some("the") {
                rest = &rest[1..];
            }
            rest.first()
                .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        }
        // "the goblin takes 6 damage" names it before the verb.
        _ => {
            if verb_at > 0 {
                words[..verb_at]
                    .last()
                    .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
            } else {
                None
            }
        }
    };
    Some((target.filter(|t| !t.is_empty()), amount))
}

#[async_trait]
impl Agent for Archivist {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn invoke(
        &self,
        request: &AgentRequest,
        context: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        let mut response = AgentResponse::from_agent(&self.descriptor.name);

        match request.intent.intent_type {
            IntentType::Combat => {
                if let Some((Some(target), amount)) = parse_damage(&request.text) {
                    // Damage application is pure arithmetic over the stored
                    // record; anything fancier belongs to the Arbiter.
                    let record = context
                        .store
                        .get(EntityCategory::Character, &target)
                        .await
                        .map_err(|e| AgentError(e.to_string()))?;
                    if let Some(record) = record {
                        response = response
                            .with_delta(Self::damage_delta(&record, &target, amount));
                    } else {
                        response
                            .errors
                            .push(format!("no character record for '{}'", target));
                    }
                }
            }
            IntentType::Question => {
                // Deterministic lookups: answer hp/inventory questions about
                // any character named in the utterance.
                let lowered = request.text.to_lowercase();
                let ids = context
                    .store
                    .list_ids(EntityCategory::Character)
                    .await
                    .map_err(|e| AgentError(e.to_string()))?;
                for id in ids {
                    if !lowered.contains(&id.to_lowercase()) {
                        continue;
                    }
                    if let Some(record) = context
                        .store
                        .get(EntityCategory::Character, &id)
                        .await
                        .map_err(|e| AgentError(e.to_string()))?
                    {
                        let current = get_field_path(&record, "hp.current")
                            .and_then(serde_json::Value::as_i64);
                        let max = get_field_path(&record, "hp.max")
                            .and_then(serde_json::Value::as_i64);
                        if let (Some(current), Some(max)) = (current, max) {
                            response = response.with_text(
                                format!("{} is at {} of {} hit points.", id, current, max),
                                Visibility::Party,
                            );
                        }
                    }
                    break;
                }
            }
            _ => {}
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_target_after_damage() {
        let (target, amount) = parse_damage("I deal 4 damage to the goblin").unwrap();
        assert_eq!(target.as_deref(), Some("goblin"));
        assert_eq!(amount, 4);
    }

    #[test]
    fn parses_target_before_verb() {
        let (target, amount) = parse_damage("The goblin takes 6 damage.").unwrap();
        assert_eq!(target.as_deref(), Some("goblin"));
        assert_eq!(amount, 6);
    }

    #[test]
    fn ignores_unrelated_text() {
        assert!(parse_damage("I open the door").is_none());
        assert!(parse_damage("takes some damage").is_none());
    }

    #[test]
    fn damage_clamps_at_zero() {
        let record = serde_json::json!({"hp": {"current": 3, "max": 20}});
        let delta = Archivist::damage_delta(&record, "pA", 10);
        assert_eq!(delta.value, serde_json::json!(0));
        assert_eq!(delta.field, "hp.current");
    }
}
