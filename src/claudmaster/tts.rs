//! Text-to-speech routing: tiers, cascade, chunking, voices.
//!
//! Three tiers bind to host-supplied engines: `speed` (combat barks, low
//! latency), `quality` (dialogue and narration), `fallback` (always-works
//! last resort). Selection computes the preferred tier from the speech
//! context, then cascades through the remaining tiers in order whenever an
//! engine errors. If every engine fails the router records the event and the
//! caller delivers the text-only response unchanged; audio is never allowed
//! to fail a turn.
//!
//! Synthesized audio is chunked to a configurable size and encoded as the
//! wire `audio` messages; the receiver reassembles strictly by sequence and
//! tolerates out-of-order delivery.
//!
//! The per-campaign voice registry resolves `(speaker, archetype)` through a
//! cascade: exact speaker override, exact archetype, gender wildcard, race
//! wildcard, DM default.

use crate::claudmaster::event::{emit, EngineEvent, SharedEventHandler};
use crate::claudmaster::party::protocol::ServerMessage;
use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use uuid::Uuid;

/// A synthesized clip, engine-format agnostic.
#[derive(Debug, Clone)]
pub struct AudioClip {
    /// Container/codec label forwarded on the wire (e.g. `"wav"`, `"mp3"`).
    pub format: String,
    pub sample_rate: u32,
    pub duration_ms: u64,
    pub bytes: Vec<u8>,
}

/// A host-supplied synthesis engine.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Registry id (e.g. `"kokoro"`, `"piper"`, `"espeak"`).
    fn id(&self) -> &str;
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
    ) -> Result<AudioClip, Box<dyn Error + Send + Sync>>;
}

/// The three routing tiers, in cascade order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TtsTier {
    Speed,
    Quality,
    Fallback,
}

impl TtsTier {
    pub fn label(self) -> &'static str {
        match self {
            TtsTier::Speed => "speed",
            TtsTier::Quality => "quality",
            TtsTier::Fallback => "fallback",
        }
    }

    /// Cascade order starting from a preferred tier.
    fn cascade_from(start: TtsTier) -> Vec<TtsTier> {
        let all = [TtsTier::Speed, TtsTier::Quality, TtsTier::Fallback];
        let mut order = vec![start];
        for tier in all {
            if tier != start {
                order.push(tier);
            }
        }
        order
    }
}

/// What kind of speech is being produced; drives tier selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechContext {
    Combat,
    Dialogue,
    Narration,
}

impl SpeechContext {
    fn preferred_tier(self) -> TtsTier {
        match self {
            SpeechContext::Combat => TtsTier::Speed,
            SpeechContext::Dialogue | SpeechContext::Narration => TtsTier::Quality,
        }
    }
}

/// Identity of a speaking character, for voice resolution.
#[derive(Debug, Clone, Default)]
pub struct SpeakerProfile {
    /// Speaker name (NPC id or "dm").
    pub name: String,
    pub archetype: Option<String>,
    pub gender: Option<String>,
    pub race: Option<String>,
}

/// Per-campaign `(speaker, archetype) -> voice` bindings.
///
/// Persisted inside `campaign.json` under `voice_map` and loaded at attach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceRegistry {
    /// Exact speaker name overrides.
    #[serde(default)]
    pub speakers: HashMap<String, String>,
    /// Archetype bindings ("gruff_dwarf" etc.).
    #[serde(default)]
    pub archetypes: HashMap<String, String>,
    /// Gender wildcards ("female" -> voice).
    #[serde(default)]
    pub genders: HashMap<String, String>,
    /// Race wildcards ("dwarf" -> voice).
    #[serde(default)]
    pub races: HashMap<String, String>,
    /// The DM default, used when nothing else matches.
    #[serde(default = "default_voice")]
    pub default_voice: String,
}

fn default_voice() -> String {
    "narrator_default".to_string()
}

impl Default for VoiceRegistry {
    fn default() -> Self {
        Self {
            speakers: HashMap::new(),
            archetypes: HashMap::new(),
            genders: HashMap::new(),
            races: HashMap::new(),
            default_voice: default_voice(),
        }
    }
}

impl VoiceRegistry {
    /// Load the registry from a campaign record's `voice_map` key.
    ///
    /// Absent or malformed maps yield the default registry so a campaign
    /// without voice bindings still narrates.
    pub fn from_campaign(campaign: &serde_json::Value) -> Self {
        campaign
            .get("voice_map")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Resolve a speaker through the cascade.
    pub fn resolve(&self, profile: &SpeakerProfile) -> &str {
        if let Some(voice) = self.speakers.get(&profile.name) {
            return voice;
        }
        if let Some(voice) = profile
            .archetype
            .as_ref()
            .and_then(|a| self.archetypes.get(a))
        {
            return voice;
        }
        if let Some(voice) = profile.gender.as_ref().and_then(|g| self.genders.get(g)) {
            return voice;
        }
        if let Some(voice) = profile.race.as_ref().and_then(|r| self.races.get(r)) {
            return voice;
        }
        &self.default_voice
    }
}

/// One chunk of a synthesized stream, pre-encoding.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub stream_id: String,
    pub sequence: u32,
    pub total_chunks: u32,
    pub format: String,
    pub sample_rate: u32,
    pub bytes: Vec<u8>,
}

/// A complete synthesized stream ready for broadcast.
#[derive(Debug, Clone)]
pub struct AudioStream {
    pub stream_id: String,
    pub tier_used: TtsTier,
    pub engine_id: String,
    pub chunks: Vec<AudioChunk>,
    pub duration_ms: u64,
}

impl AudioStream {
    /// Encode the chunks as wire messages.
    pub fn to_messages(&self) -> Vec<ServerMessage> {
        let encoder = base64::engine::general_purpose::STANDARD;
        self.chunks
            .iter()
            .map(|chunk| ServerMessage::Audio {
                format: chunk.format.clone(),
                sample_rate: chunk.sample_rate,
                sequence: chunk.sequence,
                total_chunks: chunk.total_chunks,
                duration_ms: self.duration_ms,
                data: encoder.encode(&chunk.bytes),
            })
            .collect()
    }
}

/// Tier-bound engine router.
pub struct TtsRouter {
    bindings: HashMap<TtsTier, Arc<dyn TtsEngine>>,
    voices: VoiceRegistry,
    chunk_size: usize,
    events: SharedEventHandler,
}

impl TtsRouter {
    pub fn new(events: SharedEventHandler) -> Self {
        Self {
            bindings: HashMap::new(),
            voices: VoiceRegistry::default(),
            chunk_size: 32 * 1024,
            events,
        }
    }

    /// Bind an engine to a tier (builder pattern).
    pub fn with_engine(mut self, tier: TtsTier, engine: Arc<dyn TtsEngine>) -> Self {
        self.bindings.insert(tier, engine);
        self
    }

    /// Replace the voice registry (builder pattern).
    pub fn with_voices(mut self, voices: VoiceRegistry) -> Self {
        self.voices = voices;
        self
    }

    /// Override the audio chunk size in bytes (builder pattern).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn voices(&self) -> &VoiceRegistry {
        &self.voices
    }

    /// Synthesize `text`, cascading across tiers on failure.
    ///
    /// Returns `None` when every bound engine failed; the caller delivers the
    /// text-only response unchanged.
    pub async fn narrate(
        &self,
        text: &str,
        speaker: &SpeakerProfile,
        context: SpeechContext,
    ) -> Option<AudioStream> {
        let stream_id = format!("stream-{}", Uuid::new_v4());
        let voice = self.voices.resolve(speaker).to_string();
        let mut previous_tier: Option<TtsTier> = None;

        for tier in TtsTier::cascade_from(context.preferred_tier()) {
            let Some(engine) = self.bindings.get(&tier) else {
                continue;
            };
            if let Some(from) = previous_tier {
                emit(
                    &self.events,
                    EngineEvent::TtsCascaded {
                        stream_id: stream_id.clone(),
                        from_tier: from.label().to_string(),
                        to_tier: tier.label().to_string(),
                    },
                )
                .await;
            }
            match engine.synthesize(text, &voice).await {
                Ok(clip) => {
                    log::debug!(
                        "synthesized {}ms via {} ({})",
                        clip.duration_ms,
                        engine.id(),
                        tier.label()
                    );
                    return Some(self.chunk(stream_id, tier, engine.id(), clip));
                }
                Err(e) => {
                    log::warn!(
                        "tts engine {} ({}) failed: {}; cascading",
                        engine.id(),
                        tier.label(),
                        e
                    );
                    previous_tier = Some(tier);
                }
            }
        }

        emit(
            &self.events,
            EngineEvent::TtsExhausted {
                stream_id: stream_id.clone(),
            },
        )
        .await;
        log::warn!("all tts engines failed for stream {}", stream_id);
        None
    }

    fn chunk(
        &self,
        stream_id: String,
        tier: TtsTier,
        engine_id: &str,
        clip: AudioClip,
    ) -> AudioStream {
        let total = clip.bytes.chunks(self.chunk_size).count().max(1) as u32;
        let chunks = if clip.bytes.is_empty() {
            // A single-shot empty chunk keeps the wire contract intact.
            vec![AudioChunk {
                stream_id: stream_id.clone(),
                sequence: 0,
                total_chunks: 1,
                format: clip.format.clone(),
                sample_rate: clip.sample_rate,
                bytes: Vec::new(),
            }]
        } else {
            clip.bytes
                .chunks(self.chunk_size)
                .enumerate()
                .map(|(i, bytes)| AudioChunk {
                    stream_id: stream_id.clone(),
                    sequence: i as u32,
                    total_chunks: total,
                    format: clip.format.clone(),
                    sample_rate: clip.sample_rate,
                    bytes: bytes.to_vec(),
                })
                .collect()
        };
        AudioStream {
            stream_id,
            tier_used: tier,
            engine_id: engine_id.to_string(),
            chunks,
            duration_ms: clip.duration_ms,
        }
    }
}

/// Receiver-side reassembly of one chunked stream.
///
/// Chunks may arrive in any order; the clip is complete when every sequence
/// number up to `total_chunks` has been seen. Callers that give up after
/// their delivery window can ask which sequences are still missing before
/// aborting (the text was already delivered, so aborting loses nothing but
/// audio).
#[derive(Debug, Default)]
pub struct AudioReassembler {
    total: Option<u32>,
    chunks: HashMap<u32, Vec<u8>>,
}

impl AudioReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one chunk. Returns the reassembled bytes once every chunk of
    /// the stream has arrived; duplicates are ignored.
    pub fn accept(&mut self, chunk: &AudioChunk) -> Option<Vec<u8>> {
        self.total.get_or_insert(chunk.total_chunks);
        self.chunks
            .entry(chunk.sequence)
            .or_insert_with(|| chunk.bytes.clone());
        self.take_if_complete()
    }

    fn take_if_complete(&mut self) -> Option<Vec<u8>> {
        let total = self.total?;
        if (0..total).any(|seq| !self.chunks.contains_key(&seq)) {
            return None;
        }
        let mut out = Vec::new();
        for seq in 0..total {
            out.extend(self.chunks.remove(&seq).unwrap_or_default());
        }
        Some(out)
    }

    /// Sequence numbers still outstanding.
    pub fn missing(&self) -> Vec<u32> {
        match self.total {
            Some(total) => (0..total).filter(|s| !self.chunks.contains_key(s)).collect(),
            None => Vec::new(),
        }
    }
}

/// Deterministic engine that produces silence sized to the text length.
///
/// Useful as a last-resort fallback binding and in tests: it never fails and
/// costs nothing.
pub struct SilenceEngine {
    sample_rate: u32,
}

impl Default for SilenceEngine {
    fn default() -> Self {
        Self { sample_rate: 16_000 }
    }
}

impl SilenceEngine {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

#[async_trait]
impl TtsEngine for SilenceEngine {
    fn id(&self) -> &str {
        "silence"
    }

    async fn synthesize(
        &self,
        text: &str,
        _voice: &str,
    ) -> Result<AudioClip, Box<dyn Error + Send + Sync>> {
        // ~60ms of silence per character, 16-bit mono.
        let duration_ms = (text.chars().count() as u64) * 60;
        let samples = (self.sample_rate as u64 * duration_ms / 1000) as usize;
        Ok(AudioClip {
            format: "pcm_s16le".to_string(),
            sample_rate: self.sample_rate,
            duration_ms,
            bytes: vec![0u8; samples * 2],
        })
    }
}
