//! Per-recipient projection of turn output.
//!
//! Everything that leaves the engine toward a browser goes through
//! [`OutputFilter`] first. Filtering is pure and deterministic: the same
//! response and the same recipient always produce the identical projection,
//! and responses are stored unfiltered, so the filter runs at delivery time
//! (including replays after reconnect).
//!
//! Two surfaces:
//!
//! - [`ScopedPayload`]: the narrative projection of a turn, split into
//!   public / party / per-participant private / DM-only lanes.
//! - [`OutputFilter::filter_value`]: a structural walk over arbitrary JSON
//!   (tool output, character sheets) honouring embedded visibility tags.
//! - [`OutputFilter::filter_location`]: location records additionally pass
//!   through the party's discovery view; undiscovered features are replaced
//!   by a deterministic sensory hint rather than omitted, so players know
//!   there is *something* there without learning what.

use crate::claudmaster::agent::Visibility;
use crate::claudmaster::permissions::Role;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

/// The audience of one projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub role: Role,
    pub participant_id: Option<String>,
}

impl Recipient {
    pub fn dm() -> Self {
        Self {
            role: Role::Dm,
            participant_id: None,
        }
    }

    pub fn player(participant_id: impl Into<String>) -> Self {
        Self {
            role: Role::Player,
            participant_id: Some(participant_id.into()),
        }
    }

    pub fn observer() -> Self {
        Self {
            role: Role::Observer,
            participant_id: None,
        }
    }
}

/// Narrative lanes of one published response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopedPayload {
    pub public: Option<String>,
    pub party: Option<String>,
    /// participant id -> private text.
    pub private: BTreeMap<String, String>,
    pub dm_only: Option<String>,
}

/// One projected message with the scope it survived under.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleMessage {
    pub visibility: Visibility,
    pub text: String,
}

/// Pure projection rules. Stateless; constructed once and shared.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputFilter;

impl OutputFilter {
    pub fn new() -> Self {
        Self
    }

    /// Project the narrative lanes of `payload` for `recipient`.
    ///
    /// - public: everyone.
    /// - party: players and the DM, not observers.
    /// - private: the named participant and the DM.
    /// - dm_only: the DM alone.
    pub fn project(&self, payload: &ScopedPayload, recipient: &Recipient) -> Vec<VisibleMessage> {
        let mut out = Vec::new();
        if let Some(text) = &payload.public {
            out.push(VisibleMessage {
                visibility: Visibility::Public,
                text: text.clone(),
            });
        }
        if recipient.role != Role::Observer {
            if let Some(text) = &payload.party {
                out.push(VisibleMessage {
                    visibility: Visibility::Party,
                    text: text.clone(),
                });
            }
        }
        match recipient.role {
            Role::Dm => {
                for (participant, text) in &payload.private {
                    out.push(VisibleMessage {
                        visibility: Visibility::Private(participant.clone()),
                        text: text.clone(),
                    });
                }
                if let Some(text) = &payload.dm_only {
                    out.push(VisibleMessage {
                        visibility: Visibility::DmOnly,
                        text: text.clone(),
                    });
                }
            }
            Role::Player => {
                if let Some(id) = &recipient.participant_id {
                    if let Some(text) = payload.private.get(id) {
                        out.push(VisibleMessage {
                            visibility: Visibility::Private(id.clone()),
                            text: text.clone(),
                        });
                    }
                }
            }
            Role::Observer => {}
        }
        out
    }

    /// Structurally filter a JSON tree for a recipient.
    ///
    /// Conventions honoured anywhere in the tree:
    ///
    /// - an object of the form `{"visibility": <tag>, "value": <v>}` is
    ///   unwrapped to `<v>` when visible and removed entirely when not;
    /// - a key named `"dm_only"` survives only for the DM;
    /// - a key named `"private"` must hold a participant-keyed object; each
    ///   entry survives for its participant and the DM.
    pub fn filter_value(&self, value: &Value, recipient: &Recipient) -> Option<Value> {
        match value {
            Value::Object(map) => {
                if let Some(tag) = map.get("visibility").and_then(Value::as_str) {
                    if let Some(inner) = map.get("value") {
                        return if self.tag_visible(tag, recipient) {
                            self.filter_value(inner, recipient)
                        } else {
                            None
                        };
                    }
                }
                let mut out = Map::new();
                for (key, inner) in map {
                    match key.as_str() {
                        "dm_only" => {
                            if recipient.role == Role::Dm {
                                if let Some(v) = self.filter_value(inner, recipient) {
                                    out.insert(key.clone(), v);
                                }
                            }
                        }
                        "private" => {
                            if let Value::Object(per_participant) = inner {
                                let kept: Map<String, Value> = per_participant
                                    .iter()
                                    .filter(|(participant, _)| match recipient.role {
                                        Role::Dm => true,
                                        Role::Player => {
                                            recipient.participant_id.as_deref()
                                                == Some(participant.as_str())
                                        }
                                        Role::Observer => false,
                                    })
                                    .filter_map(|(participant, v)| {
                                        self.filter_value(v, recipient)
                                            .map(|v| (participant.clone(), v))
                                    })
                                    .collect();
                                if !kept.is_empty() {
                                    out.insert(key.clone(), Value::Object(kept));
                                }
                            }
                        }
                        _ => {
                            if let Some(v) = self.filter_value(inner, recipient) {
                                out.insert(key.clone(), v);
                            }
                        }
                    }
                }
                Some(Value::Object(out))
            }
            Value::Array(items) => Some(Value::Array(
                items
                    .iter()
                    .filter_map(|v| self.filter_value(v, recipient))
                    .collect(),
            )),
            other => Some(other.clone()),
        }
    }

    fn tag_visible(&self, tag: &str, recipient: &Recipient) -> bool {
        match tag {
            "public" => true,
            "party" => recipient.role != Role::Observer,
            "dm_only" => recipient.role == Role::Dm,
            tag => {
                if let Some(participant) = tag.strip_prefix("private:") {
                    recipient.role == Role::Dm
                        || recipient.participant_id.as_deref() == Some(participant)
                } else {
                    // Unknown tags fail closed for everyone but the DM.
                    recipient.role == Role::Dm
                }
            }
        }
    }

    /// Filter a location record through the party's discovery view.
    ///
    /// `location.features` entries whose `id` is not in `discovered` are
    /// replaced by `{"hint": <sensory hint>}`. The hint is a pure function of
    /// the feature id so repeated queries cannot be mined for differences.
    /// The DM always sees the full record.
    pub fn filter_location(
        &self,
        location: &Value,
        discovered: &HashSet<String>,
        recipient: &Recipient,
    ) -> Option<Value> {
        let mut filtered = self.filter_value(location, recipient)?;
        if recipient.role == Role::Dm {
            return Some(filtered);
        }
        if let Some(features) = filtered
            .as_object_mut()
            .and_then(|o| o.get_mut("features"))
            .and_then(Value::as_array_mut)
        {
            for feature in features.iter_mut() {
                let id = feature
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if !discovered.contains(&id) {
                    let mut hidden = Map::new();
                    hidden.insert("id".to_string(), Value::String(id.clone()));
                    hidden.insert("hint".to_string(), Value::String(sensory_hint(&id)));
                    *feature = Value::Object(hidden);
                }
            }
        }
        Some(filtered)
    }
}

/// Deterministic sensory hint for an undiscovered feature.
fn sensory_hint(feature_id: &str) -> String {
    const HINTS: [&str; 6] = [
        "A faint draft stirs the air here.",
        "Something smells of old dust and iron.",
        "The stonework sounds hollow when you pass.",
        "A thin shadow lingers where the light should fall.",
        "You hear an occasional soft creak from somewhere close.",
        "The floor is subtly worn, as if something is often moved.",
    ];
    let sum: usize = feature_id.bytes().map(|b| b as usize).sum();
    HINTS[sum % HINTS.len()].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_payload() -> ScopedPayload {
        let mut private = BTreeMap::new();
        private.insert("pA".to_string(), "You see a trap.".to_string());
        ScopedPayload {
            public: Some("The room is dark.".to_string()),
            party: None,
            private,
            dm_only: Some("The trap is a real poison dart.".to_string()),
        }
    }

    #[test]
    fn players_see_public_and_their_private_only() {
        let filter = OutputFilter::new();
        let payload = sample_payload();

        let for_pa = filter.project(&payload, &Recipient::player("pA"));
        assert_eq!(for_pa.len(), 2);
        assert!(for_pa.iter().any(|m| m.text == "The room is dark."));
        assert!(for_pa.iter().any(|m| m.text == "You see a trap."));

        let for_pb = filter.project(&payload, &Recipient::player("pB"));
        assert_eq!(for_pb.len(), 1);
        assert_eq!(for_pb[0].text, "The room is dark.");
    }

    #[test]
    fn dm_sees_everything() {
        let filter = OutputFilter::new();
        let messages = filter.project(&sample_payload(), &Recipient::dm());
        assert_eq!(messages.len(), 3);
    }

    #[test]
    fn filtering_is_deterministic() {
        let filter = OutputFilter::new();
        let payload = sample_payload();
        let recipient = Recipient::player("pA");
        assert_eq!(
            filter.project(&payload, &recipient),
            filter.project(&payload, &recipient)
        );
    }

    #[test]
    fn value_tree_strips_dm_only_fields() {
        let filter = OutputFilter::new();
        let record = json!({
            "name": "Durgan",
            "dm_only": {"secret": "doppelganger"},
            "notes": {"visibility": "private:pA", "value": "owes you gold"}
        });

        let for_player = filter
            .filter_value(&record, &Recipient::player("pB"))
            .unwrap();
        assert!(for_player.get("dm_only").is_none());
        assert!(for_player.get("notes").is_none());

        let for_dm = filter.filter_value(&record, &Recipient::dm()).unwrap();
        assert!(for_dm.get("dm_only").is_some());
        assert_eq!(for_dm["notes"], json!("owes you gold"));
    }

    #[test]
    fn undiscovered_features_become_hints() {
        let filter = OutputFilter::new();
        let location = json!({
            "id": "cellar",
            "features": [
                {"id": "stairs", "description": "A broad stone stair."},
                {"id": "trapdoor", "description": "A hidden trapdoor."}
            ]
        });
        let discovered: HashSet<String> = ["stairs".to_string()].into_iter().collect();

        let seen = filter
            .filter_location(&location, &discovered, &Recipient::player("pA"))
            .unwrap();
        let features = seen["features"].as_array().unwrap();
        assert!(features[0].get("description").is_some());
        assert!(features[1].get("description").is_none());
        assert!(features[1].get("hint").is_some());

        // Same input, same hint.
        let again = filter
            .filter_location(&location, &discovered, &Recipient::player("pA"))
            .unwrap();
        assert_eq!(seen, again);

        // The DM is never hinted at.
        let dm = filter
            .filter_location(&location, &discovered, &Recipient::dm())
            .unwrap();
        assert!(dm["features"][1].get("description").is_some());
    }
}
