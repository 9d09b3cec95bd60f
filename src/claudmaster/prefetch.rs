//! Speculative narration variants.
//!
//! The engine is strictly speculative: everything works identically with it
//! disabled, it only shaves latency. A cheap deterministic trigger (a combat
//! turn change) asks the model for 2-3 short narrative variants tagged by the
//! likely outcome (hit / miss / critical). Variants are cached with a TTL and
//! invalidated by any state delta touching an involved combatant. When the
//! real resolution arrives, the variant whose tag matches is refined with one
//! short model pass and handed back; on a tag mismatch or a cold cache the
//! caller generates on demand as if prefetch never existed.

use crate::claudmaster::event::{emit, EngineEvent, SharedEventHandler};
use crate::claudmaster::intent::IntentType;
use crate::claudmaster::llm_client::{LLMClient, Message, Role};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// How eagerly to speculate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchIntensity {
    Off,
    /// Combat turns only.
    Conservative,
    /// Combat and exploration.
    Aggressive,
}

/// What the table is doing right now, as seen by the context observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneKind {
    Combat,
    Exploration,
    Dialogue,
    Idle,
}

/// Inputs the observer classifies. All cheap to produce from live state.
#[derive(Debug, Clone)]
pub struct ObservedState {
    pub combat_active: bool,
    pub last_intent: Option<IntentType>,
    pub ms_since_last_action: u64,
}

/// Deterministic classifier over live session state.
#[derive(Debug, Clone)]
pub struct ContextObserver {
    idle_after_ms: u64,
}

impl Default for ContextObserver {
    fn default() -> Self {
        Self {
            idle_after_ms: 120_000,
        }
    }
}

impl ContextObserver {
    pub fn observe(&self, state: &ObservedState) -> SceneKind {
        if state.combat_active {
            return SceneKind::Combat;
        }
        if state.ms_since_last_action >= self.idle_after_ms {
            return SceneKind::Idle;
        }
        match state.last_intent {
            Some(IntentType::Exploration) => SceneKind::Exploration,
            Some(IntentType::Roleplay) | Some(IntentType::Social) | Some(IntentType::Question) => {
                SceneKind::Dialogue
            }
            _ => SceneKind::Dialogue,
        }
    }
}

/// The outcome tags variants are generated for.
pub const VARIANT_TAGS: [&str; 3] = ["hit", "miss", "critical"];

#[derive(Debug, Clone)]
struct CachedVariant {
    tag: String,
    text: String,
}

struct CachedSet {
    variants: Vec<CachedVariant>,
    /// Entity ids whose mutation invalidates this set.
    involved: HashSet<String>,
    created: Instant,
}

/// Speculative variant generator and cache.
pub struct PrefetchEngine {
    client: Arc<dyn LLMClient>,
    intensity: PrefetchIntensity,
    ttl: Duration,
    observer: ContextObserver,
    cache: Mutex<HashMap<String, CachedSet>>,
    events: SharedEventHandler,
}

impl PrefetchEngine {
    pub fn new(client: Arc<dyn LLMClient>, events: SharedEventHandler) -> Self {
        Self {
            client,
            intensity: PrefetchIntensity::Conservative,
            ttl: Duration::from_secs(60),
            observer: ContextObserver::default(),
            cache: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn with_intensity(mut self, intensity: PrefetchIntensity) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn speculation_allowed(&self, scene: SceneKind) -> bool {
        match self.intensity {
            PrefetchIntensity::Off => false,
            PrefetchIntensity::Conservative => scene == SceneKind::Combat,
            PrefetchIntensity::Aggressive => {
                matches!(scene, SceneKind::Combat | SceneKind::Exploration)
            }
        }
    }

    fn cache_key(session_id: &str, attacker: &str, defender: &str) -> String {
        format!("{}:{}:{}", session_id, attacker, defender)
    }

    /// Cheap trigger: a combat turn changed. Pre-generates one short variant
    /// per outcome tag when the intensity and scene allow it.
    pub async fn on_turn_change(
        &self,
        session_id: &str,
        state: &ObservedState,
        attacker: &str,
        defender: &str,
    ) {
        let scene = self.observer.observe(state);
        if !self.speculation_allowed(scene) {
            return;
        }

        let mut variants = Vec::new();
        for tag in VARIANT_TAGS {
            let prompt = format!(
                "Write one short sentence narrating {} attacking {} with outcome '{}'. \
                 No dice numbers, no mechanics.",
                attacker, defender, tag
            );
            match self
                .client
                .generate(&[Message::new(Role::User, prompt)])
                .await
            {
                Ok(reply) => variants.push(CachedVariant {
                    tag: tag.to_string(),
                    text: reply.content.to_string(),
                }),
                Err(e) => {
                    // Speculation must never surface failures.
                    log::debug!("prefetch variant '{}' failed: {}", tag, e);
                }
            }
        }
        if variants.is_empty() {
            return;
        }

        log::debug!(
            "prefetched {} variant(s) for {} vs {}",
            variants.len(),
            attacker,
            defender
        );
        let involved: HashSet<String> =
            [attacker.to_string(), defender.to_string()].into_iter().collect();
        self.cache.lock().await.insert(
            Self::cache_key(session_id, attacker, defender),
            CachedSet {
                variants,
                involved,
                created: Instant::now(),
            },
        );
    }

    /// The real outcome arrived: hand back a refined variant if one matches.
    ///
    /// `None` means cold cache, expired TTL, or tag mismatch; the caller
    /// falls back to on-demand generation.
    pub async fn resolve(
        &self,
        session_id: &str,
        attacker: &str,
        defender: &str,
        outcome_tag: &str,
    ) -> Option<String> {
        let key = Self::cache_key(session_id, attacker, defender);
        let variant = {
            let mut cache = self.cache.lock().await;
            let expired = cache
                .get(&key)
                .is_some_and(|set| set.created.elapsed() > self.ttl);
            if expired {
                cache.remove(&key);
            }
            cache.get(&key).and_then(|set| {
                set.variants
                    .iter()
                    .find(|v| v.tag == outcome_tag)
                    .cloned()
            })
        };

        let Some(variant) = variant else {
            emit(
                &self.events,
                EngineEvent::PrefetchMiss {
                    session_id: session_id.to_string(),
                },
            )
            .await;
            return None;
        };

        emit(
            &self.events,
            EngineEvent::PrefetchHit {
                session_id: session_id.to_string(),
                tag: variant.tag.clone(),
            },
        )
        .await;

        // One short refinement pass; a refinement failure still counts as a
        // hit and delivers the raw variant.
        let prompt = format!(
            "Polish this combat narration, keeping it one sentence: {}",
            variant.text
        );
        match self
            .client
            .generate(&[Message::new(Role::User, prompt)])
            .await
        {
            Ok(refined) => Some(refined.content.to_string()),
            Err(e) => {
                log::debug!("refinement failed, using raw variant: {}", e);
                Some(variant.text)
            }
        }
    }

    /// A state delta touched `entity_id`: drop every variant set involving it.
    pub async fn invalidate_for(&self, entity_id: &str) {
        let mut cache = self.cache.lock().await;
        cache.retain(|_, set| !set.involved.contains(entity_id));
    }

    /// Number of live cached variant sets (test hook).
    pub async fn cached_sets(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claudmaster::llm_client::ScriptedClient;

    fn combat_state() -> ObservedState {
        ObservedState {
            combat_active: true,
            last_intent: Some(IntentType::Combat),
            ms_since_last_action: 100,
        }
    }

    #[test]
    fn observer_classifies_scenes() {
        let observer = ContextObserver::default();
        assert_eq!(observer.observe(&combat_state()), SceneKind::Combat);
        assert_eq!(
            observer.observe(&ObservedState {
                combat_active: false,
                last_intent: Some(IntentType::Exploration),
                ms_since_last_action: 100,
            }),
            SceneKind::Exploration
        );
        assert_eq!(
            observer.observe(&ObservedState {
                combat_active: false,
                last_intent: None,
                ms_since_last_action: 500_000,
            }),
            SceneKind::Idle
        );
    }

    #[tokio::test]
    async fn hit_resolves_to_refined_variant() {
        let client = Arc::new(ScriptedClient::new(
            "mini",
            vec![
                "The blade lands.",
                "The blade misses.",
                "A devastating critical.",
                "Refined: the blade lands true.",
            ],
        ));
        let engine = PrefetchEngine::new(client, None);
        engine
            .on_turn_change("s1", &combat_state(), "pA", "goblin")
            .await;
        assert_eq!(engine.cached_sets().await, 1);

        let text = engine.resolve("s1", "pA", "goblin", "hit").await.unwrap();
        assert!(text.contains("Refined"));
    }

    #[tokio::test]
    async fn mismatch_and_cold_cache_miss() {
        let client = Arc::new(ScriptedClient::new("mini", vec!["a", "b", "c"]));
        let engine = PrefetchEngine::new(client, None);
        // Cold cache.
        assert!(engine.resolve("s1", "pA", "goblin", "hit").await.is_none());

        engine
            .on_turn_change("s1", &combat_state(), "pA", "goblin")
            .await;
        // Unknown tag.
        assert!(engine
            .resolve("s1", "pA", "goblin", "fumble")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn invalidation_drops_involved_sets() {
        let client = Arc::new(ScriptedClient::new("mini", vec!["a", "b", "c"]));
        let engine = PrefetchEngine::new(client, None);
        engine
            .on_turn_change("s1", &combat_state(), "pA", "goblin")
            .await;
        engine.invalidate_for("goblin").await;
        assert_eq!(engine.cached_sets().await, 0);
    }

    #[tokio::test]
    async fn off_intensity_never_speculates() {
        let client = Arc::new(ScriptedClient::new("mini", vec!["a"]));
        let engine = PrefetchEngine::new(client, None).with_intensity(PrefetchIntensity::Off);
        engine
            .on_turn_change("s1", &combat_state(), "pA", "goblin")
            .await;
        assert_eq!(engine.cached_sets().await, 0);
    }
}
