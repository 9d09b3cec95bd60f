//! Who knows what, and how they learned it.
//!
//! [`KnowledgeTracker`] layers per-holder views on top of the
//! [`FactStore`](crate::facts::FactStore): an NPC only "recalls" facts it has
//! a [`KnowledgeRecord`] for, while the party is a pseudo-holder whose
//! knowledge is the union of its explicit records and every fact flagged
//! `party_known`. The Narrator consults these views so NPCs do not blurt out
//! secrets they never learned.
//!
//! Records are unique per `(fact, holder)`: learning the same fact twice
//! through a different channel keeps the earliest record.

use crate::claudmaster::facts::{Fact, FactId, FactStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who holds a piece of knowledge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Holder {
    /// The player party as a collective.
    Party,
    /// A single NPC, by id.
    Npc(String),
}

/// The channel through which a holder learned a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMethod {
    Told,
    Observed,
    Investigated,
    Read,
    Overheard,
    Deduced,
    Magical,
    CommonKnowledge,
}

/// One holder's acquisition of one fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    /// The fact that was learned.
    pub fact_id: FactId,
    /// Who learned it.
    pub holder: Holder,
    /// How they learned it.
    pub method: AcquisitionMethod,
    /// Session in which the acquisition happened.
    pub session_number: u32,
    /// Where it happened, when the location matters (overheard in the tavern).
    pub location_id: Option<String>,
    /// Wall-clock acquisition time.
    pub acquired_at: DateTime<Utc>,
}

/// Tracks [`KnowledgeRecord`]s and answers recall queries against a
/// [`FactStore`].
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct KnowledgeTracker {
    records: Vec<KnowledgeRecord>,
}

impl KnowledgeTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from serialized records (snapshot restore).
    pub fn from_records(records: Vec<KnowledgeRecord>) -> Self {
        Self { records }
    }

    /// Record that `holder` learned `fact_id` via `method`.
    ///
    /// Duplicate `(fact, holder)` pairs are ignored: the earliest record wins,
    /// whatever the later method was. Returns `true` when a new record was
    /// inserted.
    pub fn grant(
        &mut self,
        fact_id: impl Into<FactId>,
        holder: Holder,
        method: AcquisitionMethod,
        session_number: u32,
        location_id: Option<String>,
    ) -> bool {
        let fact_id = fact_id.into();
        if self.knows(&holder, &fact_id) {
            return false;
        }
        self.records.push(KnowledgeRecord {
            fact_id,
            holder,
            method,
            session_number,
            location_id,
            acquired_at: Utc::now(),
        });
        true
    }

    /// Whether `holder` has an explicit record for `fact_id`.
    pub fn knows(&self, holder: &Holder, fact_id: &str) -> bool {
        self.records
            .iter()
            .any(|r| &r.holder == holder && r.fact_id == fact_id)
    }

    /// Facts `holder` can recall about `topic`.
    ///
    /// Topic matching is a case-insensitive substring test against fact
    /// content and tags; an empty topic returns everything the holder knows.
    /// For [`Holder::Party`] the result is the union of explicit party records
    /// and facts flagged `party_known` on the store.
    pub fn query<'a>(&self, holder: &Holder, topic: &str, store: &'a FactStore) -> Vec<&'a Fact> {
        let topic = topic.to_lowercase();
        let matches_topic = |f: &Fact| {
            topic.is_empty()
                || f.content.to_lowercase().contains(&topic)
                || f.tags.iter().any(|t| t.contains(&topic))
        };

        let mut out: Vec<&Fact> = self
            .records
            .iter()
            .filter(|r| &r.holder == holder)
            .filter_map(|r| store.get(&r.fact_id))
            .filter(|f| !f.superseded && matches_topic(f))
            .collect();

        if *holder == Holder::Party {
            for fact in store.party_known_facts() {
                if matches_topic(fact) && !out.iter().any(|f| f.id == fact.id) {
                    out.push(fact);
                }
            }
        }
        out
    }

    /// Copy everything `from` knows to `to`, with method
    /// [`AcquisitionMethod::Told`]. Returns how many new records were created.
    pub fn share(&mut self, from: &Holder, to: Holder, session_number: u32) -> usize {
        let fact_ids: Vec<FactId> = self
            .records
            .iter()
            .filter(|r| &r.holder == from)
            .map(|r| r.fact_id.clone())
            .collect();
        let mut granted = 0;
        for fact_id in fact_ids {
            if self.grant(fact_id, to.clone(), AcquisitionMethod::Told, session_number, None) {
                granted += 1;
            }
        }
        granted
    }

    /// Remove a holder and every record it held (holder removal cascades).
    pub fn remove_holder(&mut self, holder: &Holder) -> usize {
        let before = self.records.len();
        self.records.retain(|r| &r.holder != holder);
        before - self.records.len()
    }

    /// Invalidate every record pointing at a retracted fact.
    pub fn retract_fact(&mut self, fact_id: &str) -> usize {
        let before = self.records.len();
        self.records.retain(|r| r.fact_id != fact_id);
        before - self.records.len()
    }

    /// All records, in acquisition order.
    pub fn records(&self) -> &[KnowledgeRecord] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claudmaster::facts::{Fact, FactCategory};

    fn store_with(content: &str, party_known: bool) -> (FactStore, FactId) {
        let mut store = FactStore::new();
        let mut fact = Fact::new(FactCategory::Npc, content, 5);
        if party_known {
            fact = fact.party_known();
        }
        let id = store.add(fact).unwrap();
        (store, id)
    }

    #[test]
    fn grant_is_unique_per_fact_and_holder() {
        let (_store, id) = store_with("Durgan hums while forging", false);
        let mut tracker = KnowledgeTracker::new();
        let npc = Holder::Npc("mira".into());

        assert!(tracker.grant(id.clone(), npc.clone(), AcquisitionMethod::Overheard, 1, None));
        assert!(!tracker.grant(id, npc, AcquisitionMethod::Told, 2, None));
        assert_eq!(tracker.records().len(), 1);
        assert_eq!(tracker.records()[0].method, AcquisitionMethod::Overheard);
    }

    #[test]
    fn party_query_unions_party_known_flags() {
        let (store, _id) = store_with("The mayor is a doppelganger", true);
        let tracker = KnowledgeTracker::new();
        // No explicit record, yet the party recalls the flagged fact.
        let recalled = tracker.query(&Holder::Party, "mayor", &store);
        assert_eq!(recalled.len(), 1);
    }

    #[test]
    fn share_copies_as_told() {
        let (store, id) = store_with("The bridge is out", false);
        let mut tracker = KnowledgeTracker::new();
        let mira = Holder::Npc("mira".into());
        let joren = Holder::Npc("joren".into());
        tracker.grant(id, mira.clone(), AcquisitionMethod::Observed, 1, None);

        assert_eq!(tracker.share(&mira, joren.clone(), 2), 1);
        let facts = tracker.query(&joren, "bridge", &store);
        assert_eq!(facts.len(), 1);
        let record = tracker
            .records()
            .iter()
            .find(|r| r.holder == joren)
            .unwrap();
        assert_eq!(record.method, AcquisitionMethod::Told);
    }

    #[test]
    fn retraction_and_removal_cascade() {
        let (_store, id) = store_with("A secret", false);
        let mut tracker = KnowledgeTracker::new();
        let mira = Holder::Npc("mira".into());
        tracker.grant(id.clone(), mira.clone(), AcquisitionMethod::Told, 1, None);
        tracker.grant(id.clone(), Holder::Party, AcquisitionMethod::Told, 1, None);

        assert_eq!(tracker.retract_fact(&id), 2);
        assert!(tracker.records().is_empty());

        tracker.grant("fact-000099", mira.clone(), AcquisitionMethod::Told, 1, None);
        assert_eq!(tracker.remove_holder(&mira), 1);
    }
}
