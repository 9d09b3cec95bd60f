// src/lib.rs

// Import the top-level `claudmaster` module.
pub mod claudmaster;

// Re-exporting key items for easier external access.
pub use claudmaster::agent::{
    Agent, AgentContext, AgentDescriptor, AgentOutcome, AgentRequest, AgentResponse, Visibility,
};
pub use claudmaster::config::EngineConfig;
pub use claudmaster::facts::{Fact, FactCategory, FactStore};
pub use claudmaster::intent::{IntentClassifier, IntentType, PlayerIntent};
pub use claudmaster::llm_client::{LLMClient, Message, Role};
pub use claudmaster::orchestrator::{Orchestrator, TurnResult};
pub use claudmaster::party::server::PartyServer;
pub use claudmaster::session::{SessionConfig, SessionStore};
pub use claudmaster::tts::TtsRouter;
