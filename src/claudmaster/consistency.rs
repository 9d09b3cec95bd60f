//! Contradiction detection between proposed deltas and established facts.
//!
//! The checker runs as a pseudo-agent after aggregation: it receives the
//! turn's merged state deltas and the current [`FactStore`] and reports
//! every conflict it finds, classified as blocking, warn, or info. Blocking
//! contradictions abort the turn before anything is persisted; warnings are
//! recorded as facts and annotate the response; info entries are silent.
//!
//! Rules are pluggable trait objects and the checker never mutates state.
//! The built-in [`FactAssertionRule`] understands assertion tags of the form
//! `asserts:<category>:<entity_id>:<field>=<json>` on facts: a delta that
//! writes a different value to that field contradicts the fact, with
//! severity scaled by the fact's relevance.

use crate::claudmaster::agent::StateDelta;
use crate::claudmaster::facts::{Fact, FactStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How severe a contradiction is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocking,
    Warn,
    Info,
}

/// One detected conflict between a delta and an established fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contradiction {
    /// Name of the rule that fired.
    pub rule: String,
    /// The fact being contradicted.
    pub fact_id: String,
    /// Entity and field the delta was writing.
    pub entity_id: String,
    pub field: String,
    /// What the fact asserts.
    pub established: String,
    /// What the delta tried to write.
    pub proposed: String,
    pub severity: Severity,
    /// Human-readable explanation, DM-facing.
    pub message: String,
}

/// The checker's verdict for one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContradictionReport {
    pub blocking: Vec<Contradiction>,
    pub warn: Vec<Contradiction>,
    pub info: Vec<Contradiction>,
}

impl ContradictionReport {
    pub fn is_blocking(&self) -> bool {
        !self.blocking.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.blocking.is_empty() && self.warn.is_empty() && self.info.is_empty()
    }

    fn push(&mut self, contradiction: Contradiction) {
        match contradiction.severity {
            Severity::Blocking => self.blocking.push(contradiction),
            Severity::Warn => self.warn.push(contradiction),
            Severity::Info => self.info.push(contradiction),
        }
    }
}

/// A declarative consistency rule.
///
/// Rules inspect, never mutate: both the delta set and the store are borrowed
/// immutably for the whole check.
pub trait ConsistencyRule: Send + Sync {
    fn name(&self) -> &str;
    /// Contradictions this rule finds for one delta.
    fn evaluate(&self, delta: &StateDelta, store: &FactStore) -> Vec<Contradiction>;
}

/// Prefix used by assertion tags on facts.
pub const ASSERTS_TAG_PREFIX: &str = "asserts:";

/// Build the assertion tag a fact should carry to pin an entity field.
///
/// Example: `asserts:npc:durgan:race="dwarf"`.
pub fn assertion_tag(
    category: crate::claudmaster::storage::EntityCategory,
    entity_id: &str,
    field: &str,
    value: &serde_json::Value,
) -> String {
    format!(
        "{}{}:{}:{}={}",
        ASSERTS_TAG_PREFIX,
        category_slug(category),
        entity_id.to_lowercase(),
        field.to_lowercase(),
        value
    )
}

fn category_slug(category: crate::claudmaster::storage::EntityCategory) -> &'static str {
    use crate::claudmaster::storage::EntityCategory::*;
    match category {
        Character => "character",
        Npc => "npc",
        Location => "location",
        Quest => "quest",
        Encounter => "encounter",
        GameState => "game_state",
    }
}

/// The canonical built-in rule: deltas must not rewrite fields that facts
/// with assertion tags have pinned.
///
/// Severity scales with the fact's relevance: `>= 8` blocks the turn,
/// `4..=7` warns, anything lower is informational.
#[derive(Debug, Default)]
pub struct FactAssertionRule;

impl ConsistencyRule for FactAssertionRule {
    fn name(&self) -> &str {
        "fact_assertion"
    }

    fn evaluate(&self, delta: &StateDelta, store: &FactStore) -> Vec<Contradiction> {
        let prefix = format!(
            "{}{}:{}:{}=",
            ASSERTS_TAG_PREFIX,
            category_slug(delta.category),
            delta.entity_id.to_lowercase(),
            delta.field.to_lowercase()
        );
        let proposed = delta.value.to_string();

        let mut found = Vec::new();
        for fact in store.live() {
            for tag in &fact.tags {
                let Some(established) = tag.strip_prefix(&prefix) else {
                    continue;
                };
                if established == proposed {
                    continue;
                }
                found.push(Contradiction {
                    rule: self.name().to_string(),
                    fact_id: fact.id.clone(),
                    entity_id: delta.entity_id.clone(),
                    field: delta.field.clone(),
                    established: established.to_string(),
                    proposed: proposed.clone(),
                    severity: severity_for(fact),
                    message: format!(
                        "'{}' of {} is established as {} (fact: \"{}\", relevance {}), \
                         but this turn writes {}",
                        delta.field,
                        delta.entity_id,
                        established,
                        fact.content,
                        fact.relevance,
                        proposed
                    ),
                });
            }
        }
        found
    }
}

fn severity_for(fact: &Fact) -> Severity {
    if fact.relevance >= 8 {
        Severity::Blocking
    } else if fact.relevance >= 4 {
        Severity::Warn
    } else {
        Severity::Info
    }
}

/// Runs every registered rule over every delta of a turn.
pub struct ContradictionChecker {
    rules: Vec<Arc<dyn ConsistencyRule>>,
}

impl Default for ContradictionChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl ContradictionChecker {
    /// Checker with the built-in rule set.
    pub fn new() -> Self {
        Self {
            rules: vec![Arc::new(FactAssertionRule)],
        }
    }

    /// Checker with no rules; every turn passes.
    pub fn permissive() -> Self {
        Self { rules: Vec::new() }
    }

    /// Register an additional rule (builder pattern).
    pub fn with_rule(mut self, rule: Arc<dyn ConsistencyRule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Check a turn's merged deltas against the store.
    pub fn check(&self, deltas: &[StateDelta], store: &FactStore) -> ContradictionReport {
        let mut report = ContradictionReport::default();
        for delta in deltas {
            for rule in &self.rules {
                for contradiction in rule.evaluate(delta, store) {
                    report.push(contradiction);
                }
            }
        }
        if report.is_blocking() {
            log::warn!(
                "consistency check blocked a turn: {} blocking contradiction(s)",
                report.blocking.len()
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claudmaster::facts::{Fact, FactCategory};
    use crate::claudmaster::storage::EntityCategory;
    use serde_json::json;

    fn store_with_durgan(relevance: u8) -> FactStore {
        let mut store = FactStore::new();
        let tag = assertion_tag(EntityCategory::Npc, "durgan", "race", &json!("dwarf"));
        store
            .add(
                Fact::new(
                    FactCategory::Npc,
                    "Durgan is a dwarven blacksmith in Ironforge Square",
                    relevance,
                )
                .with_tag(tag),
            )
            .unwrap();
        store
    }

    #[test]
    fn high_relevance_contradiction_blocks() {
        let store = store_with_durgan(9);
        let checker = ContradictionChecker::new();
        let delta = StateDelta::new(EntityCategory::Npc, "durgan", "race", json!("elf"));

        let report = checker.check(&[delta], &store);
        assert!(report.is_blocking());
        assert_eq!(report.blocking[0].established, "\"dwarf\"");
        assert_eq!(report.blocking[0].proposed, "\"elf\"");
    }

    #[test]
    fn matching_value_is_consistent() {
        let store = store_with_durgan(9);
        let checker = ContradictionChecker::new();
        let delta = StateDelta::new(EntityCategory::Npc, "durgan", "race", json!("dwarf"));
        assert!(checker.check(&[delta], &store).is_empty());
    }

    #[test]
    fn severity_scales_with_relevance() {
        let checker = ContradictionChecker::new();
        let delta = StateDelta::new(EntityCategory::Npc, "durgan", "race", json!("elf"));

        let report = checker.check(&[delta.clone()], &store_with_durgan(5));
        assert!(!report.is_blocking());
        assert_eq!(report.warn.len(), 1);

        let report = checker.check(&[delta], &store_with_durgan(2));
        assert_eq!(report.info.len(), 1);
    }

    #[test]
    fn superseded_assertions_stop_firing() {
        let mut store = store_with_durgan(9);
        let old_id = store.live().next().unwrap().id.clone();
        store
            .supersede(
                &old_id,
                Fact::new(FactCategory::Npc, "Durgan was an elf all along", 9).with_tag(
                    assertion_tag(EntityCategory::Npc, "durgan", "race", &json!("elf")),
                ),
            )
            .unwrap();

        let checker = ContradictionChecker::new();
        let delta = StateDelta::new(EntityCategory::Npc, "durgan", "race", json!("elf"));
        assert!(checker.check(&[delta], &store).is_empty());
    }
}
