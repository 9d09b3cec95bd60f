//! Role and ownership based access control for tool calls.
//!
//! Every tool invocation that reaches the engine from a participant passes
//! through [`PermissionResolver::resolve`]. The resolver is a matrix from
//! `(role, operation)` to an [`Access`] decision; `Conditional` entries fall
//! back to ownership (a player may write a character only when they own it).
//! The DM role passes every operation, and when no participant id is supplied
//! at all the engine is in single-player mode and checks are skipped
//! entirely.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// Participant role, as carried on tokens and WebSocket registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Dm,
    Player,
    Observer,
}

/// Decision stored in the permission matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny,
    /// Allowed only when the target is owned by the caller.
    Conditional,
}

/// Identity attached to an incoming tool call.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub role: Role,
    /// `None` in single-player mode, where every operation is allowed.
    pub participant_id: Option<String>,
}

impl CallerContext {
    /// Single-player caller: no participant registry, no checks.
    pub fn single_player() -> Self {
        Self {
            role: Role::Dm,
            participant_id: None,
        }
    }

    /// A participant acting under a role.
    pub fn participant(role: Role, participant_id: impl Into<String>) -> Self {
        Self {
            role,
            participant_id: Some(participant_id.into()),
        }
    }
}

/// Rejection returned to the caller; never broadcast to other participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDenied {
    pub operation: String,
    pub role: Role,
}

impl fmt::Display for PermissionDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Permission denied: role {:?} may not perform '{}'",
            self.role, self.operation
        )
    }
}

impl Error for PermissionDenied {}

/// The `(role, operation)` matrix.
///
/// Unknown operations deny for non-DM roles; the matrix is therefore safe to
/// extend with host-specific tools without widening the default surface.
#[derive(Debug, Clone)]
pub struct PermissionResolver {
    matrix: HashMap<(Role, String), Access>,
}

impl Default for PermissionResolver {
    fn default() -> Self {
        Self::standard()
    }
}

impl PermissionResolver {
    /// Empty matrix: everything denied except for the DM.
    pub fn empty() -> Self {
        Self {
            matrix: HashMap::new(),
        }
    }

    /// The standard matrix for party play.
    pub fn standard() -> Self {
        let mut resolver = Self::empty();
        for (op, access) in [
            ("read_character", Access::Conditional),
            ("write_character", Access::Conditional),
            ("read_location", Access::Allow),
            ("read_quest", Access::Allow),
            ("roll_dice", Access::Allow),
            ("search_rules", Access::Allow),
            ("submit_action", Access::Allow),
        ] {
            resolver.set(Role::Player, op, access);
        }
        for (op, access) in [
            ("read_location", Access::Allow),
            ("read_quest", Access::Allow),
        ] {
            resolver.set(Role::Observer, op, access);
        }
        resolver
    }

    /// Insert or replace a matrix entry.
    pub fn set(&mut self, role: Role, operation: impl Into<String>, access: Access) {
        self.matrix.insert((role, operation.into()), access);
    }

    /// Decide whether `caller` may perform `operation` on a target owned by
    /// `owner_participant_id` (when ownership applies).
    pub fn resolve(
        &self,
        caller: &CallerContext,
        operation: &str,
        owner_participant_id: Option<&str>,
    ) -> Result<(), PermissionDenied> {
        // Single-player mode: no participant registry, zero overhead.
        let participant_id = match &caller.participant_id {
            Some(id) => id.as_str(),
            None => return Ok(()),
        };
        if caller.role == Role::Dm {
            return Ok(());
        }

        let denied = || PermissionDenied {
            operation: operation.to_string(),
            role: caller.role,
        };

        match self.matrix.get(&(caller.role, operation.to_string())) {
            Some(Access::Allow) => Ok(()),
            Some(Access::Conditional) => match owner_participant_id {
                Some(owner) if owner == participant_id => Ok(()),
                _ => Err(denied()),
            },
            Some(Access::Deny) | None => Err(denied()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dm_passes_everything() {
        let resolver = PermissionResolver::standard();
        let dm = CallerContext::participant(Role::Dm, "dm-1");
        assert!(resolver.resolve(&dm, "write_npc", None).is_ok());
    }

    #[test]
    fn single_player_skips_checks() {
        let resolver = PermissionResolver::empty();
        let caller = CallerContext::single_player();
        assert!(resolver.resolve(&caller, "anything", None).is_ok());
    }

    #[test]
    fn player_writes_only_their_own_character() {
        let resolver = PermissionResolver::standard();
        let player = CallerContext::participant(Role::Player, "p1");
        assert!(resolver
            .resolve(&player, "write_character", Some("p1"))
            .is_ok());
        assert!(resolver
            .resolve(&player, "write_character", Some("p2"))
            .is_err());
        assert!(resolver.resolve(&player, "write_character", None).is_err());
    }

    #[test]
    fn unknown_operations_deny_for_non_dm() {
        let resolver = PermissionResolver::standard();
        let observer = CallerContext::participant(Role::Observer, "o1");
        assert!(resolver.resolve(&observer, "submit_action", None).is_err());
        assert!(resolver.resolve(&observer, "read_location", None).is_ok());
    }
}
