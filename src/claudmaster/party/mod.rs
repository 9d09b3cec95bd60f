//! Party Mode: the browser-facing relay.
//!
//! Party Mode lets N browser clients follow (and, for players, drive) a
//! session: token-authenticated HTTP submission, a turn-gated action queue,
//! per-role filtered fan-out over WebSockets with replay after reconnect, and
//! optional chunked audio. Everything durable lives in two append-only JSONL
//! logs under `party/` in the campaign directory.

pub mod protocol;
pub mod queue;
pub mod server;

pub use protocol::{PartyAction, PartyResponse, Participant};
pub use server::PartyServer;
