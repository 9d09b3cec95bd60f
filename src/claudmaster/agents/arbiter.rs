//! The Arbiter: rules adjudication.
//!
//! Rolls the dice the host provides, compares against a difficulty derived
//! from the session settings, and proposes outcome deltas at a priority above
//! the Archivist so adjudicated results win conflicts. The reasoning behind a
//! ruling goes into `rationale`, which the output filter keeps DM-only by
//! default.
//!
//! Degradation: a missing `roll_dice` tool records an error on the response
//! and produces no ruling; it never aborts the turn.

use crate::claudmaster::agent::{
    Agent, AgentContext, AgentDescriptor, AgentError, AgentKind, AgentRequest, AgentResponse,
    RetryPolicy, Visibility,
};
use crate::claudmaster::intent::IntentType;
use crate::claudmaster::permissions::CallerContext;
use crate::claudmaster::tools::ToolRegistry;
use async_trait::async_trait;
use std::sync::Arc;

pub struct Arbiter {
    descriptor: AgentDescriptor,
    tools: Arc<ToolRegistry>,
}

impl Arbiter {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self {
            descriptor: AgentDescriptor::new("arbiter", AgentKind::Ledger)
                .with_capability("rules")
                .with_capability("adjudication")
                .with_priority(20)
                .with_timeout_ms(10_000)
                .with_retry(RetryPolicy::AtMostOnce)
                .with_side_effects(),
            tools,
        }
    }

    /// Difficulty class implied by the table's difficulty setting.
    fn difficulty_class(difficulty: &str) -> i32 {
        match difficulty {
            "relaxed" => 8,
            "standard" => 12,
            "gritty" => 15,
            "brutal" => 18,
            _ => 12,
        }
    }
}

#[async_trait]
impl Agent for Arbiter {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn invoke(
        &self,
        request: &AgentRequest,
        context: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        let mut response = AgentResponse::from_agent(&self.descriptor.name);

        // Only contested intents need a ruling.
        if !matches!(
            request.intent.intent_type,
            IntentType::Combat | IntentType::Social | IntentType::Exploration
        ) {
            return Ok(response);
        }

        let caller = CallerContext::single_player();
        match self
            .tools
            .roll_dice("1d20", "adjudication", &caller)
            .await
        {
            Ok(roll) => {
                let dc = Self::difficulty_class(&context.settings.difficulty);
                let success = roll.total >= dc;
                let crit = roll.rolls.first().copied() == Some(20);
                response.rationale = Some(format!(
                    "d20={} vs DC {} ({}): {}{}",
                    roll.total,
                    dc,
                    context.settings.difficulty,
                    if success { "success" } else { "failure" },
                    if crit { ", critical" } else { "" }
                ));
                response.dice_rolls.push(roll);
                response = response.with_text(
                    if crit {
                        "A critical success.".to_string()
                    } else if success {
                        "The attempt succeeds.".to_string()
                    } else {
                        "The attempt fails.".to_string()
                    },
                    Visibility::Party,
                );
            }
            Err(e) => {
                // No dice capability: record and continue without a ruling.
                log::debug!("arbiter skipping ruling: {}", e);
                response.errors.push(e.to_string());
            }
        }

        Ok(response)
    }
}
