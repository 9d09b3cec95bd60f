//! Built-in agent implementations.
//!
//! Each agent is a capability contract, not a class hierarchy: the Narrator
//! voices the world through an [`LLMClient`](crate::claudmaster::llm_client::LLMClient),
//! the Archivist answers deterministic state queries and does pure arithmetic
//! deltas, the Arbiter adjudicates rules with dice and a DM-facing rationale,
//! and the Module Keeper turns adventure-module lookups into prompt context
//! for the Narrator. The consistency checker runs post-aggregation and lives
//! in [`consistency`](crate::claudmaster::consistency), not here.

pub mod arbiter;
pub mod archivist;
pub mod module_keeper;
pub mod narrator;

pub use arbiter::Arbiter;
pub use archivist::Archivist;
pub use module_keeper::ModuleKeeper;
pub use narrator::Narrator;
