//! The Module Keeper: adventure-module retrieval.
//!
//! Queries the host's library tool with the player's utterance and returns
//! the hits as prompt context for the Narrator. The text it produces is never
//! rendered to players; the runtime injects it into the context of later
//! stages instead. Discovered module content is additionally proposed as
//! party-known facts so the discovery view can catch up.

use crate::claudmaster::agent::{
    Agent, AgentContext, AgentDescriptor, AgentError, AgentKind, AgentRequest, AgentResponse,
    RetryPolicy,
};
use crate::claudmaster::permissions::CallerContext;
use crate::claudmaster::tools::ToolRegistry;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub struct ModuleKeeper {
    descriptor: AgentDescriptor,
    tools: Arc<ToolRegistry>,
}

impl ModuleKeeper {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self {
            descriptor: AgentDescriptor::new("module_keeper", AgentKind::Context)
                .with_capability("module_lookup")
                .with_priority(5)
                .with_timeout_ms(8_000)
                .with_retry(RetryPolicy::NonIdempotentOnly),
            tools,
        }
    }
}

#[async_trait]
impl Agent for ModuleKeeper {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn invoke(
        &self,
        request: &AgentRequest,
        _context: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        let mut response = AgentResponse::from_agent(&self.descriptor.name);
        let caller = CallerContext::single_player();

        match self.tools.query_library(&request.text, &caller).await {
            Ok(hits) => {
                let snippets = collect_snippets(&hits);
                if !snippets.is_empty() {
                    response.prompt_context = Some(snippets.join("\n"));
                }
            }
            Err(e) => {
                // No module loaded or no library tool: silent degrade.
                log::debug!("module keeper lookup unavailable: {}", e);
                response.errors.push(e.to_string());
            }
        }
        Ok(response)
    }
}

/// Pull text snippets out of a library tool result, whatever its exact shape:
/// a string, an array of strings, or an array of `{text}` objects.
fn collect_snippets(hits: &Value) -> Vec<String> {
    match hits {
        Value::String(s) if !s.is_empty() => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(map) => map
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string()),
                _ => None,
            })
            .collect(),
        Value::Object(map) => map
            .get("results")
            .map(collect_snippets)
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snippets_from_mixed_shapes() {
        assert_eq!(collect_snippets(&json!("one")), vec!["one"]);
        assert_eq!(
            collect_snippets(&json!(["a", {"text": "b"}, 42])),
            vec!["a", "b"]
        );
        assert_eq!(
            collect_snippets(&json!({"results": ["x"]})),
            vec!["x"]
        );
        assert!(collect_snippets(&json!(null)).is_empty());
    }
}
