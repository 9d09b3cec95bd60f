//! The Narrator: the voice of the world.
//!
//! Produces narrative text and nothing else: no state deltas, no dice. The
//! prompt is assembled from the session's narrative settings, the Module
//! Keeper's context for this turn (when present), and the facts the party is
//! allowed to recall, so the narration can never leak what the table has not
//! discovered.

use crate::claudmaster::agent::{
    Agent, AgentContext, AgentDescriptor, AgentError, AgentKind, AgentRequest, AgentResponse,
    RetryPolicy, Visibility,
};
use crate::claudmaster::llm_client::{LLMClient, Message, Role};
use async_trait::async_trait;
use std::sync::Arc;

pub struct Narrator {
    descriptor: AgentDescriptor,
    client: Arc<dyn LLMClient>,
}

impl Narrator {
    pub fn new(client: Arc<dyn LLMClient>) -> Self {
        Self {
            descriptor: AgentDescriptor::new("narrator", AgentKind::Voice)
                .with_capability("narration")
                .with_timeout_ms(30_000)
                .with_retry(RetryPolicy::NonIdempotentOnly),
            client,
        }
    }

    async fn build_prompt(&self, request: &AgentRequest, context: &AgentContext) -> Vec<Message> {
        let settings = &context.settings;
        let mut system = format!(
            "You are the narrator of a tabletop RPG session. Style: {}. \
             Difficulty: {}. Improvisation level: {} of 4. \
             Never reveal information the party has not discovered.",
            settings.narrative_style, settings.difficulty, settings.improvisation_level
        );
        if let Some(module_context) = &context.module_context {
            system.push_str("\n\nAdventure module context:\n");
            system.push_str(module_context);
        }

        // Only party-known facts reach the prompt; private NPC knowledge and
        // DM secrets stay out of the narration entirely.
        let facts = context.facts.read().await;
        let known: Vec<String> = facts
            .party_known_facts()
            .into_iter()
            .map(|f| format!("- {}", f.content))
            .collect();
        if !known.is_empty() {
            system.push_str("\n\nWhat the party knows:\n");
            system.push_str(&known.join("\n"));
        }

        let user = format!(
            "Player action ({:?}): {}\n\nNarrate the outcome in 2-4 sentences.",
            request.intent.intent_type, request.text
        );

        vec![
            Message::new(Role::System, system),
            Message::new(Role::User, user),
        ]
    }
}

#[async_trait]
impl Agent for Narrator {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn invoke(
        &self,
        request: &AgentRequest,
        context: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        let messages = self.build_prompt(request, context).await;
        let reply = self.client.generate(&messages).await?;
        context.sink.push(reply.content.to_string());
        Ok(AgentResponse::from_agent(&self.descriptor.name)
            .with_text(reply.content.to_string(), Visibility::Public))
    }
}
