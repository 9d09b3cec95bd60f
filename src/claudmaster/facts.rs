//! Append-only world-fact database.
//!
//! [`FactStore`] is the engine's single source of truth for what is true in
//! the campaign world. Facts are typed, tagged, weighted by relevance, and
//! never mutated after publication: a correction is a *new* fact created via
//! [`FactStore::supersede`], linked back to the entry it replaces. This keeps
//! the contradiction checker and the knowledge tracker stable: records that
//! point at a fact id keep pointing at exactly the statement that was made.
//!
//! # Example
//!
//! ```rust
//! use claudmaster::facts::{Fact, FactCategory, FactStore};
//!
//! let mut store = FactStore::new();
//! let id = store
//!     .add(Fact::new(
//!         FactCategory::Npc,
//!         "Durgan is a dwarven blacksmith in Ironforge Square",
//!         9,
//!     ))
//!     .unwrap();
//!
//! let hits = store.by_category(FactCategory::Npc);
//! assert_eq!(hits.len(), 1);
//! assert_eq!(hits[0].id, id);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::fmt;

/// Stable identifier of a fact. Allocated by the store on insertion.
pub type FactId = String;

/// Broad classification of a world fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactCategory {
    /// Something that happened during play.
    Event,
    /// A statement about a place.
    Location,
    /// A statement about a non-player character.
    Npc,
    /// A statement about an object.
    Item,
    /// A statement about quest state or structure.
    Quest,
    /// Background truth about the world at large.
    World,
}

/// A single immutable world statement.
///
/// `relevance` ranges 1..=10 and drives both query filtering and the
/// contradiction checker's severity decisions: a delta that contradicts a
/// relevance-9 fact blocks the turn, while a low-relevance mismatch is a
/// warning at most.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    /// Store-allocated id. Empty until [`FactStore::add`] assigns one.
    #[serde(default)]
    pub id: FactId,
    /// The statement itself, in plain prose.
    pub content: String,
    /// Broad classification.
    pub category: FactCategory,
    /// Free-form lowercase tags used for retrieval.
    pub tags: BTreeSet<String>,
    /// Importance weight, 1 (trivia) through 10 (load-bearing truth).
    pub relevance: u8,
    /// Session the fact was established in, when known.
    pub session_number: Option<u32>,
    /// When the fact entered the store.
    pub created_at: DateTime<Utc>,
    /// Ids of related facts. A superseding fact links to the entry it replaces.
    pub links: BTreeSet<FactId>,
    /// Whether the party as a whole is aware of this fact.
    pub party_known: bool,
    /// Set when a newer fact replaced this one via [`FactStore::supersede`].
    pub superseded: bool,
}

impl Fact {
    /// Build a fact with the given category, content and relevance. Tags,
    /// session number and party knowledge start empty and can be set with the
    /// builder methods.
    pub fn new(category: FactCategory, content: impl Into<String>, relevance: u8) -> Self {
        Self {
            id: FactId::new(),
            content: content.into(),
            category,
            tags: BTreeSet::new(),
            relevance,
            session_number: None,
            created_at: Utc::now(),
            links: BTreeSet::new(),
            party_known: false,
            superseded: false,
        }
    }

    /// Attach a tag (builder pattern). Tags are normalised to lowercase.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into().to_lowercase());
        self
    }

    /// Record which session established the fact (builder pattern).
    pub fn with_session(mut self, session_number: u32) -> Self {
        self.session_number = Some(session_number);
        self
    }

    /// Mark the fact as known to the whole party (builder pattern).
    pub fn party_known(mut self) -> Self {
        self.party_known = true;
        self
    }

    /// Link this fact to a related one (builder pattern).
    pub fn with_link(mut self, other: impl Into<FactId>) -> Self {
        self.links.insert(other.into());
        self
    }
}

/// Errors returned by [`FactStore`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactError {
    /// The referenced fact id does not exist in the store.
    UnknownFact(FactId),
    /// `relevance` was outside 1..=10.
    InvalidRelevance(u8),
}

impl fmt::Display for FactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactError::UnknownFact(id) => write!(f, "Unknown fact: {}", id),
            FactError::InvalidRelevance(r) => {
                write!(f, "Relevance {} out of range (expected 1..=10)", r)
            }
        }
    }
}

impl Error for FactError {}

/// Append-only store of [`Fact`]s with secondary lookup by category, tag,
/// session and relevance.
///
/// One store exists per active session and is owned by the session actor;
/// agents see it through a read-only view.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FactStore {
    facts: Vec<Fact>,
    #[serde(skip)]
    by_id: HashMap<FactId, usize>,
    next_seq: u64,
}

impl FactStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from previously serialized facts (snapshot restore).
    pub fn from_facts(facts: Vec<Fact>) -> Self {
        let by_id = facts
            .iter()
            .enumerate()
            .map(|(i, f)| (f.id.clone(), i))
            .collect();
        let next_seq = facts.len() as u64;
        Self {
            facts,
            by_id,
            next_seq,
        }
    }

    /// Insert a fact, allocating and returning its id.
    ///
    /// Ids are sequence-derived (`fact-000042`) so that snapshots replay to
    /// identical identifiers, which property tests rely on.
    pub fn add(&mut self, mut fact: Fact) -> Result<FactId, FactError> {
        if fact.relevance < 1 || fact.relevance > 10 {
            return Err(FactError::InvalidRelevance(fact.relevance));
        }
        let id = format!("fact-{:06}", self.next_seq);
        self.next_seq += 1;
        fact.id = id.clone();
        self.by_id.insert(id.clone(), self.facts.len());
        self.facts.push(fact);
        Ok(id)
    }

    /// Replace `old_id` with a new statement.
    ///
    /// The new fact is linked to the old one and the old one is flagged
    /// `superseded`; it stays in the store so existing knowledge records and
    /// timeline references remain valid.
    pub fn supersede(&mut self, old_id: &str, mut new_fact: Fact) -> Result<FactId, FactError> {
        let idx = *self
            .by_id
            .get(old_id)
            .ok_or_else(|| FactError::UnknownFact(old_id.to_string()))?;
        new_fact.links.insert(old_id.to_string());
        let new_id = self.add(new_fact)?;
        self.facts[idx].superseded = true;
        Ok(new_id)
    }

    /// Look up a fact by id.
    pub fn get(&self, id: &str) -> Option<&Fact> {
        self.by_id.get(id).map(|&i| &self.facts[i])
    }

    /// Mark a fact as known to the party.
    pub fn mark_party_known(&mut self, id: &str) -> Result<(), FactError> {
        let idx = *self
            .by_id
            .get(id)
            .ok_or_else(|| FactError::UnknownFact(id.to_string()))?;
        self.facts[idx].party_known = true;
        Ok(())
    }

    /// All live (non-superseded) facts in insertion order.
    pub fn live(&self) -> impl Iterator<Item = &Fact> {
        self.facts.iter().filter(|f| !f.superseded)
    }

    /// Every fact ever stored, including superseded entries.
    pub fn all(&self) -> &[Fact] {
        &self.facts
    }

    /// Live facts in a category.
    pub fn by_category(&self, category: FactCategory) -> Vec<&Fact> {
        self.live().filter(|f| f.category == category).collect()
    }

    /// Live facts carrying the given tag (case-insensitive).
    pub fn by_tag(&self, tag: &str) -> Vec<&Fact> {
        let tag = tag.to_lowercase();
        self.live().filter(|f| f.tags.contains(&tag)).collect()
    }

    /// Live facts the whole party knows.
    pub fn party_known_facts(&self) -> Vec<&Fact> {
        self.live().filter(|f| f.party_known).collect()
    }

    /// Live facts established in the given session.
    pub fn by_session(&self, session_number: u32) -> Vec<&Fact> {
        self.live()
            .filter(|f| f.session_number == Some(session_number))
            .collect()
    }

    /// Live facts with relevance greater than or equal to `k`.
    pub fn by_min_relevance(&self, k: u8) -> Vec<&Fact> {
        self.live().filter(|f| f.relevance >= k).collect()
    }

    /// Number of facts ever stored (including superseded).
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    /// True when no fact has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Restore the id index after deserialization.
    ///
    /// `serde` skips the index map; callers that deserialize a store directly
    /// (rather than through [`FactStore::from_facts`]) must invoke this once.
    pub fn rebuild_index(&mut self) {
        self.by_id = self
            .facts
            .iter()
            .enumerate()
            .map(|(i, f)| (f.id.clone(), i))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_allocates_sequential_ids() {
        let mut store = FactStore::new();
        let a = store.add(Fact::new(FactCategory::World, "The moon is red", 3)).unwrap();
        let b = store.add(Fact::new(FactCategory::World, "The sun is gone", 3)).unwrap();
        assert_eq!(a, "fact-000000");
        assert_eq!(b, "fact-000001");
    }

    #[test]
    fn relevance_is_validated() {
        let mut store = FactStore::new();
        let err = store.add(Fact::new(FactCategory::World, "x", 0)).unwrap_err();
        assert_eq!(err, FactError::InvalidRelevance(0));
        let err = store.add(Fact::new(FactCategory::World, "x", 11)).unwrap_err();
        assert_eq!(err, FactError::InvalidRelevance(11));
    }

    #[test]
    fn supersede_links_and_hides() {
        let mut store = FactStore::new();
        let old = store
            .add(Fact::new(FactCategory::Npc, "Durgan is alive", 7))
            .unwrap();
        let new = store
            .supersede(&old, Fact::new(FactCategory::Npc, "Durgan is dead", 8))
            .unwrap();

        assert!(store.get(&old).unwrap().superseded);
        assert!(store.get(&new).unwrap().links.contains(&old));
        // Superseded facts drop out of live queries but stay resolvable by id.
        assert_eq!(store.by_category(FactCategory::Npc).len(), 1);
        assert!(store.get(&old).is_some());
    }

    #[test]
    fn queries_filter_as_expected() {
        let mut store = FactStore::new();
        store
            .add(
                Fact::new(FactCategory::Location, "Ironforge Square is crowded", 5)
                    .with_tag("Ironforge")
                    .with_session(2)
                    .party_known(),
            )
            .unwrap();
        store
            .add(Fact::new(FactCategory::Npc, "Durgan naps at noon", 2).with_session(3))
            .unwrap();

        assert_eq!(store.by_tag("ironforge").len(), 1);
        assert_eq!(store.by_session(2).len(), 1);
        assert_eq!(store.party_known_facts().len(), 1);
        assert_eq!(store.by_min_relevance(5).len(), 1);
        assert_eq!(store.by_min_relevance(1).len(), 2);
    }
}
