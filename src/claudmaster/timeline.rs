//! Monotonic event ordering with causal links.
//!
//! Every noteworthy event in a session gets a [`TimelineEntry`] with a
//! strictly increasing `order` and an optional set of causes. Causes form a
//! DAG: an entry may only cite events that already exist, which by
//! construction rules out cycles, and the invariant `cause.order < e.order`
//! holds for every entry. Before/after queries answer "had the party already
//! met Durgan when the fire started?" without trusting wall clocks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::error::Error;
use std::fmt;

/// Identifier of a timeline event, supplied by the caller (usually a fact id
/// or an action id).
pub type EventId = String;

/// One ordered event in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// Caller-supplied event identifier.
    pub event_id: EventId,
    /// Position in the session's total order. Strictly increasing.
    pub order: i64,
    /// Session the event belongs to.
    pub session_number: u32,
    /// Wall-clock time, informational only; ordering never depends on it.
    pub wall_time: DateTime<Utc>,
    /// Events that caused this one. Must already exist at insert time.
    pub causes: BTreeSet<EventId>,
}

/// Errors returned by [`Timeline::append`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CausalityError {
    /// A cited cause has never been appended.
    UnknownCause(EventId),
    /// The event id is already present.
    DuplicateEvent(EventId),
}

impl fmt::Display for CausalityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CausalityError::UnknownCause(id) => write!(f, "Unknown cause event: {}", id),
            CausalityError::DuplicateEvent(id) => write!(f, "Duplicate event: {}", id),
        }
    }
}

impl Error for CausalityError {}

/// Per-session total order of events.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
    #[serde(skip)]
    by_id: HashMap<EventId, usize>,
    next_order: i64,
}

impl Timeline {
    /// Create an empty timeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from serialized entries (snapshot restore).
    pub fn from_entries(entries: Vec<TimelineEntry>) -> Self {
        let by_id = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.event_id.clone(), i))
            .collect();
        let next_order = entries.iter().map(|e| e.order + 1).max().unwrap_or(0);
        Self {
            entries,
            by_id,
            next_order,
        }
    }

    /// Append an event, allocating the next order value.
    ///
    /// Rejects unknown causes and duplicate event ids. Since causes must
    /// already exist they necessarily carry a smaller order, so the causal
    /// graph stays acyclic without an explicit reachability walk on insert.
    pub fn append(
        &mut self,
        event_id: impl Into<EventId>,
        session_number: u32,
        causes: &[EventId],
    ) -> Result<i64, CausalityError> {
        let event_id = event_id.into();
        if self.by_id.contains_key(&event_id) {
            return Err(CausalityError::DuplicateEvent(event_id));
        }
        for cause in causes {
            if !self.by_id.contains_key(cause) {
                return Err(CausalityError::UnknownCause(cause.clone()));
            }
        }
        let order = self.next_order;
        self.next_order += 1;
        self.by_id.insert(event_id.clone(), self.entries.len());
        self.entries.push(TimelineEntry {
            event_id,
            order,
            session_number,
            wall_time: Utc::now(),
            causes: causes.iter().cloned().collect(),
        });
        Ok(order)
    }

    /// Look up an entry by event id.
    pub fn get(&self, event_id: &str) -> Option<&TimelineEntry> {
        self.by_id.get(event_id).map(|&i| &self.entries[i])
    }

    /// True when `a` happened before `b`. Unknown ids yield `None`.
    pub fn happened_before(&self, a: &str, b: &str) -> Option<bool> {
        Some(self.get(a)?.order < self.get(b)?.order)
    }

    /// All entries with order strictly less than that of `event_id`.
    pub fn before(&self, event_id: &str) -> Vec<&TimelineEntry> {
        match self.get(event_id) {
            Some(pivot) => self
                .entries
                .iter()
                .filter(|e| e.order < pivot.order)
                .collect(),
            None => Vec::new(),
        }
    }

    /// All entries with order strictly greater than that of `event_id`.
    pub fn after(&self, event_id: &str) -> Vec<&TimelineEntry> {
        match self.get(event_id) {
            Some(pivot) => self
                .entries
                .iter()
                .filter(|e| e.order > pivot.order)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Transitive causes of `event_id`, nearest first.
    ///
    /// Walks the cause DAG breadth-first; each ancestor appears once even
    /// when reachable along several paths.
    pub fn ancestry(&self, event_id: &str) -> Vec<&TimelineEntry> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: Vec<&str> = match self.get(event_id) {
            Some(e) => e.causes.iter().map(String::as_str).collect(),
            None => return Vec::new(),
        };
        let mut out = Vec::new();
        while let Some(id) = queue.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(entry) = self.get(id) {
                queue.extend(entry.causes.iter().map(String::as_str));
                out.push(entry);
            }
        }
        out.sort_by(|a, b| b.order.cmp(&a.order));
        out
    }

    /// Entries in append order.
    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// Restore the id index after direct deserialization.
    pub fn rebuild_index(&mut self) {
        self.by_id = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.event_id.clone(), i))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_are_strictly_increasing() {
        let mut tl = Timeline::new();
        let a = tl.append("a", 1, &[]).unwrap();
        let b = tl.append("b", 1, &[]).unwrap();
        assert!(a < b);
        assert_eq!(tl.happened_before("a", "b"), Some(true));
    }

    #[test]
    fn unknown_cause_is_rejected() {
        let mut tl = Timeline::new();
        let err = tl.append("b", 1, &["ghost".to_string()]).unwrap_err();
        assert_eq!(err, CausalityError::UnknownCause("ghost".into()));
    }

    #[test]
    fn duplicate_event_is_rejected() {
        let mut tl = Timeline::new();
        tl.append("a", 1, &[]).unwrap();
        let err = tl.append("a", 1, &[]).unwrap_err();
        assert_eq!(err, CausalityError::DuplicateEvent("a".into()));
    }

    #[test]
    fn causes_always_precede_effects() {
        let mut tl = Timeline::new();
        tl.append("spark", 1, &[]).unwrap();
        tl.append("fire", 1, &["spark".to_string()]).unwrap();
        tl.append("panic", 1, &["fire".to_string()]).unwrap();

        let panic = tl.get("panic").unwrap();
        for cause in &panic.causes {
            assert!(tl.get(cause).unwrap().order < panic.order);
        }
        let ancestry = tl.ancestry("panic");
        assert_eq!(ancestry.len(), 2);
        assert_eq!(ancestry[0].event_id, "fire");
        assert_eq!(ancestry[1].event_id, "spark");
    }

    #[test]
    fn restore_continues_the_sequence() {
        let mut tl = Timeline::new();
        tl.append("a", 1, &[]).unwrap();
        tl.append("b", 1, &[]).unwrap();

        let mut restored = Timeline::from_entries(tl.entries().to_vec());
        let c = restored.append("c", 1, &[]).unwrap();
        assert_eq!(c, 2);
    }
}
