//! Agent registry and dispatch.
//!
//! The runtime owns every registered [`Agent`] and executes routing plans on
//! their behalf: independent agents of a stage are forked into parallel tokio
//! tasks, stages run sequentially with each stage seeing the context the
//! previous one produced (Module Keeper output becomes prompt context for the
//! Narrator, never output text). Each invocation is wrapped with the agent's
//! declared timeout and the turn's cancellation token; a timeout or error
//! degrades that agent only, and whatever the agent streamed through its
//! partial sink is salvaged into the degraded response.
//!
//! Guarantees:
//!
//! - at-most-once delivery of a given request id to agents that declare
//!   [`RetryPolicy::AtMostOnce`];
//! - retries only for agents without side effects under
//!   [`RetryPolicy::NonIdempotentOnly`];
//! - no agent observes a partially applied turn (the orchestrator only
//!   releases world locks between turns);
//! - cancellation propagates through the context token.

use crate::claudmaster::agent::{
    Agent, AgentContext, AgentOutcome, AgentRequest, AgentResponse, PartialSink, RetryPolicy,
};
use crate::claudmaster::event::{emit, EngineEvent, SharedEventHandler};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Errors raised while managing the registry.
#[derive(Debug, Clone)]
pub enum RuntimeError {
    /// An agent with the same name is already registered.
    DuplicateAgent(String),
    /// A routing plan referenced an unregistered agent.
    AgentNotFound(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::DuplicateAgent(name) => {
                write!(f, "Agent with name '{}' already exists", name)
            }
            RuntimeError::AgentNotFound(name) => write!(f, "Agent not found: {}", name),
        }
    }
}

impl Error for RuntimeError {}

/// An execution plan: stages run in order, agents inside a stage in parallel.
#[derive(Debug, Clone, Default)]
pub struct RoutingPlan {
    pub stages: Vec<Vec<String>>,
}

impl RoutingPlan {
    pub fn new(stages: Vec<Vec<String>>) -> Self {
        Self { stages }
    }

    /// Every agent name the plan mentions, in stage order.
    pub fn agent_names(&self) -> impl Iterator<Item = &String> {
        self.stages.iter().flatten()
    }
}

/// Registry plus dispatch machinery.
pub struct AgentRuntime {
    agents: HashMap<String, Arc<dyn Agent>>,
    order: Vec<String>,
    events: SharedEventHandler,
    /// `(request_id, agent)` pairs already delivered, for at-most-once agents.
    delivered: Mutex<HashSet<(String, String)>>,
}

impl AgentRuntime {
    pub fn new(events: SharedEventHandler) -> Self {
        Self {
            agents: HashMap::new(),
            order: Vec::new(),
            events,
            delivered: Mutex::new(HashSet::new()),
        }
    }

    /// Register a new agent. Registration order is preserved for reporting.
    pub fn register(&mut self, agent: Arc<dyn Agent>) -> Result<(), RuntimeError> {
        let name = agent.descriptor().name.clone();
        if self.agents.contains_key(&name) {
            return Err(RuntimeError::DuplicateAgent(name));
        }
        self.order.push(name.clone());
        self.agents.insert(name, agent);
        Ok(())
    }

    /// Remove and return an agent by name.
    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn Agent>> {
        self.order.retain(|n| n != name);
        self.agents.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Agent>> {
        self.agents.get(name)
    }

    /// Registered agent names in registration order.
    pub fn list(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    /// Execute a routing plan for one turn.
    ///
    /// `turn_budget` caps the whole plan; when it runs out, remaining stages
    /// are skipped and their agents reported as degraded-by-budget. Outcomes
    /// come back keyed by agent name, in plan order.
    pub async fn execute_plan(
        &self,
        plan: &RoutingPlan,
        request: &AgentRequest,
        base_context: &AgentContext,
        turn_budget: Duration,
    ) -> Result<Vec<(String, AgentOutcome)>, RuntimeError> {
        for name in plan.agent_names() {
            if !self.agents.contains_key(name) {
                return Err(RuntimeError::AgentNotFound(name.clone()));
            }
        }

        let deadline = Instant::now() + turn_budget;
        let mut context = base_context.clone();
        let mut outcomes: Vec<(String, AgentOutcome)> = Vec::new();

        for (stage_idx, stage) in plan.stages.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                for name in plan.stages[stage_idx..].iter().flatten() {
                    outcomes.push((
                        name.clone(),
                        AgentOutcome::Degraded(
                            degraded_response(name, "per-turn budget exhausted", Vec::new()),
                        ),
                    ));
                }
                break;
            }

            // Fork every agent of the stage into its own task.
            let mut tasks = Vec::new();
            for name in stage {
                let agent = Arc::clone(&self.agents[name]);
                let request = request.clone();
                let (sink, rx) = PartialSink::channel();
                let mut ctx = context.clone();
                ctx.sink = sink;
                let events = self.events.clone();
                let delivered = self.dedupe_guard(&request.request_id, name).await;
                let name_owned = name.clone();
                tasks.push(tokio::spawn(async move {
                    let outcome = invoke_with_policy(
                        agent, &request, &ctx, remaining, rx, delivered, &events,
                    )
                    .await;
                    (name_owned, outcome)
                }));
            }

            for task in tasks {
                let (name, outcome) = match task.await {
                    Ok(pair) => pair,
                    Err(e) => {
                        // A panicking agent degrades like any other failure.
                        log::error!("agent task join error: {}", e);
                        continue;
                    }
                };
                // Context producers feed the next stage's prompt context.
                if let Some(response) = outcome.response() {
                    if let Some(module_context) = &response.prompt_context {
                        context.module_context = Some(Arc::from(module_context.as_str()));
                    }
                }
                outcomes.push((name, outcome));
            }
        }

        Ok(outcomes)
    }

    /// Check-and-set the at-most-once guard. Returns `true` when this
    /// delivery is a duplicate that must be suppressed.
    async fn dedupe_guard(&self, request_id: &str, agent: &str) -> bool {
        let key = (request_id.to_string(), agent.to_string());
        let mut delivered = self.delivered.lock().await;
        !delivered.insert(key)
    }
}

fn degraded_response(agent: &str, reason: &str, partials: Vec<String>) -> AgentResponse {
    let mut response = AgentResponse::from_agent(agent);
    if !partials.is_empty() {
        response.text = Some(partials.concat());
    }
    response.errors.push(reason.to_string());
    response
}

async fn invoke_with_policy(
    agent: Arc<dyn Agent>,
    request: &AgentRequest,
    context: &AgentContext,
    stage_budget: Duration,
    mut partial_rx: tokio::sync::mpsc::UnboundedReceiver<String>,
    duplicate: bool,
    events: &SharedEventHandler,
) -> AgentOutcome {
    let descriptor = agent.descriptor().clone();

    if duplicate && descriptor.retry_policy == RetryPolicy::AtMostOnce {
        log::warn!(
            "suppressing duplicate delivery of request {} to agent {}",
            request.request_id,
            descriptor.name
        );
        return AgentOutcome::Failed(format!(
            "request {} already delivered to {}",
            request.request_id, descriptor.name
        ));
    }

    let budget = Duration::from_millis(descriptor.timeout_ms).min(stage_budget);
    let attempts = match descriptor.retry_policy {
        RetryPolicy::NonIdempotentOnly if !descriptor.side_effects => 2,
        _ => 1,
    };

    let started = Instant::now();
    let mut last_error = String::new();
    for attempt in 0..attempts {
        if context.cancel.is_cancelled() {
            return AgentOutcome::Cancelled;
        }

        let mut cancel = context.cancel.clone();
        let invocation = agent.invoke(request, context);
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("agent {} cancelled mid-invocation", descriptor.name);
                return AgentOutcome::Cancelled;
            }
            result = tokio::time::timeout(budget, invocation) => result,
        };

        match result {
            Ok(Ok(mut response)) => {
                response.agent_name = descriptor.name.clone();
                response.latency_ms = started.elapsed().as_millis() as u64;
                emit(
                    events,
                    EngineEvent::AgentCompleted {
                        session_id: request.session_id.clone(),
                        agent: descriptor.name.clone(),
                        latency_ms: response.latency_ms,
                    },
                )
                .await;
                return AgentOutcome::Ok(response);
            }
            Ok(Err(e)) => {
                last_error = e.to_string();
                log::warn!(
                    "agent {} attempt {} failed: {}",
                    descriptor.name,
                    attempt + 1,
                    last_error
                );
            }
            Err(_) => {
                last_error = format!("timed out after {:?}", budget);
                log::warn!("agent {} {}", descriptor.name, last_error);
                // A timeout consumes the whole budget; no retry is useful.
                break;
            }
        }
    }

    // Salvage any streamed partial output into the degraded response.
    let mut partials = Vec::new();
    while let Ok(fragment) = partial_rx.try_recv() {
        partials.push(fragment);
    }
    emit(
        events,
        EngineEvent::AgentDegraded {
            session_id: request.session_id.clone(),
            agent: descriptor.name.clone(),
            reason: last_error.clone(),
        },
    )
    .await;
    let mut response = degraded_response(&descriptor.name, &last_error, partials);
    response.latency_ms = started.elapsed().as_millis() as u64;
    AgentOutcome::Degraded(response)
}
