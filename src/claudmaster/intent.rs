//! Deterministic player-intent classification.
//!
//! The classifier is the first pipeline stage of every turn and the only one
//! that is guaranteed never to block or fail: it is a weighted pattern match
//! over a prioritized rule table, zero model tokens spent. Multi-word phrase
//! matches outweigh single tokens, which outweigh stem matches; ties between
//! intent categories break by a fixed precedence (combat first, plain action
//! last). Classification is invariant under case and surrounding whitespace,
//! and an empty or unmatched utterance falls back to a neutral
//! `{action, confidence 0}`.
//!
//! Scoring:
//!
//! - exact multi-word phrase match = 3
//! - whole-word token match = 2
//! - stem (word-prefix) match = 1
//! - `confidence = top / (top + runner_up + 0.25)`
//! - `ambiguous` when `top - runner_up <= score_gap` (default 1)
//!
//! # Example
//!
//! ```rust
//! use claudmaster::intent::{IntentClassifier, IntentType};
//!
//! let classifier = IntentClassifier::new();
//! let intent = classifier.classify("I attack the goblin with my axe");
//! assert_eq!(intent.intent_type, IntentType::Combat);
//! assert!(intent.confidence > 0.5);
//! ```

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// The fixed set of player-intent labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    Action,
    Question,
    Roleplay,
    Combat,
    Exploration,
    System,
    Social,
}

impl IntentType {
    /// Tie-break precedence: lower ranks win.
    /// combat > question > exploration > roleplay > social > system > action.
    fn precedence(self) -> u8 {
        match self {
            IntentType::Combat => 0,
            IntentType::Question => 1,
            IntentType::Exploration => 2,
            IntentType::Roleplay => 3,
            IntentType::Social => 4,
            IntentType::System => 5,
            IntentType::Action => 6,
        }
    }
}

/// Classification result attached to every turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerIntent {
    /// Winning label.
    pub intent_type: IntentType,
    /// `top / (top + runner_up + 0.25)`; 0.0 for unmatched input.
    pub confidence: f32,
    /// The rule patterns that fired for the winning label.
    pub matched_patterns: Vec<String>,
    /// True when the top two candidates are within the configured gap.
    pub ambiguous: bool,
    /// Runner-up label, populated when `ambiguous` is set.
    pub alternative: Option<IntentType>,
}

impl PlayerIntent {
    /// The neutral fallback for empty or unmatched input.
    pub fn neutral() -> Self {
        Self {
            intent_type: IntentType::Action,
            confidence: 0.0,
            matched_patterns: Vec::new(),
            ambiguous: false,
            alternative: None,
        }
    }
}

/// How a rule pattern is matched against the utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchKind {
    /// Whole-word phrase of two or more words, weight 3.
    Phrase,
    /// Whole-word single token, weight 2.
    Token,
    /// Word-prefix stem, weight 1.
    Stem,
}

impl MatchKind {
    fn weight(self) -> u32 {
        match self {
            MatchKind::Phrase => 3,
            MatchKind::Token => 2,
            MatchKind::Stem => 1,
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    kind: MatchKind,
    intent: IntentType,
}

macro_rules! rules {
    ($($kind:ident $pattern:literal => $intent:ident),* $(,)?) => {
        vec![$(Rule {
            pattern: $pattern.to_string(),
            kind: MatchKind::$kind,
            intent: IntentType::$intent,
        }),*]
    };
}

lazy_static! {
    /// Built-in rule table. Order is significant only for reporting; scoring
    /// sums every rule that fires.
    static ref DEFAULT_RULES: Vec<Rule> = rules![
        // Combat
        Phrase "roll initiative" => Combat,
        Phrase "attack the" => Combat,
        Phrase "draw my sword" => Combat,
        Phrase "cast at" => Combat,
        Token "attack" => Combat,
        Token "strike" => Combat,
        Token "stab" => Combat,
        Token "shoot" => Combat,
        Token "fight" => Combat,
        Token "parry" => Combat,
        Token "dodge" => Combat,
        Token "charge" => Combat,
        Stem "swing" => Combat,
        Stem "slash" => Combat,
        // Question
        Phrase "what is" => Question,
        Phrase "who is" => Question,
        Phrase "where is" => Question,
        Phrase "do i know" => Question,
        Phrase "do i remember" => Question,
        Phrase "can i see" => Question,
        Token "why" => Question,
        Token "how" => Question,
        Token "what" => Question,
        Token "who" => Question,
        Token "where" => Question,
        Token "when" => Question,
        // Exploration
        Phrase "look around" => Exploration,
        Phrase "search the" => Exploration,
        Phrase "open the door" => Exploration,
        Phrase "check for traps" => Exploration,
        Token "search" => Exploration,
        Token "explore" => Exploration,
        Token "investigate" => Exploration,
        Token "examine" => Exploration,
        Token "look" => Exploration,
        Token "listen" => Exploration,
        Token "enter" => Exploration,
        Token "climb" => Exploration,
        // Roleplay
        Phrase "i say" => Roleplay,
        Phrase "i tell" => Roleplay,
        Phrase "i ask" => Roleplay,
        Phrase "i reply" => Roleplay,
        Token "say" => Roleplay,
        Token "tell" => Roleplay,
        Token "whisper" => Roleplay,
        Token "shout" => Roleplay,
        Token "greet" => Roleplay,
        // Social
        Phrase "talk to" => Social,
        Phrase "speak with" => Social,
        Token "persuade" => Social,
        Token "intimidate" => Social,
        Token "deceive" => Social,
        Token "charm" => Social,
        Token "bargain" => Social,
        Token "haggle" => Social,
        Token "convince" => Social,
        // System
        Phrase "save the game" => System,
        Phrase "pause the session" => System,
        Phrase "end the session" => System,
        Token "save" => System,
        Token "pause" => System,
        Token "resume" => System,
        Token "undo" => System,
        Token "help" => System,
        // Action
        Token "grab" => Action,
        Token "take" => Action,
        Token "use" => Action,
        Token "push" => Action,
        Token "pull" => Action,
        Token "throw" => Action,
        Token "drink" => Action,
        Token "eat" => Action,
        Token "jump" => Action,
        Token "run" => Action,
        Token "ride" => Action,
    ];
}

/// Deterministic weighted pattern classifier.
///
/// Pure and infallible: the same input always yields the same intent,
/// confidence, and ambiguity flag, and no input can make it error.
#[derive(Debug, Clone)]
pub struct IntentClassifier {
    rules: Vec<Rule>,
    score_gap: u32,
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentClassifier {
    /// Classifier with the built-in rule table and a score gap of 1.
    pub fn new() -> Self {
        Self {
            rules: DEFAULT_RULES.clone(),
            score_gap: 1,
        }
    }

    /// Override the ambiguity gap (builder pattern).
    pub fn with_score_gap(mut self, score_gap: u32) -> Self {
        self.score_gap = score_gap;
        self
    }

    /// Append a custom whole-word phrase rule, weight 3 (builder pattern).
    pub fn with_phrase(mut self, phrase: impl Into<String>, intent: IntentType) -> Self {
        self.rules.push(Rule {
            pattern: phrase.into().to_lowercase(),
            kind: MatchKind::Phrase,
            intent,
        });
        self
    }

    /// Append a custom whole-word token rule, weight 2 (builder pattern).
    pub fn with_token(mut self, token: impl Into<String>, intent: IntentType) -> Self {
        self.rules.push(Rule {
            pattern: token.into().to_lowercase(),
            kind: MatchKind::Token,
            intent,
        });
        self
    }

    /// Label an utterance. Never fails; see [`PlayerIntent::neutral`] for the
    /// fallback semantics.
    pub fn classify(&self, text: &str) -> PlayerIntent {
        let normalized = text.trim().to_lowercase();
        if normalized.is_empty() {
            return PlayerIntent::neutral();
        }
        let words = tokenize(&normalized);

        // Score every intent by summing the weights of the rules that fire.
        let mut scores: Vec<(IntentType, u32, Vec<String>)> = Vec::new();
        for rule in &self.rules {
            let fired = match rule.kind {
                MatchKind::Phrase => phrase_matches(&words, &rule.pattern),
                MatchKind::Token => words.iter().any(|w| *w == rule.pattern),
                MatchKind::Stem => words
                    .iter()
                    .any(|w| w.starts_with(rule.pattern.as_str()) && *w != rule.pattern),
            };
            if !fired {
                continue;
            }
            match scores.iter().position(|(i, _, _)| *i == rule.intent) {
                Some(at) => {
                    scores[at].1 += rule.kind.weight();
                    scores[at].2.push(rule.pattern.clone());
                }
                None => scores.push((rule.intent, rule.kind.weight(), vec![rule.pattern.clone()])),
            }
        }

        if scores.is_empty() {
            return PlayerIntent::neutral();
        }

        // Highest score wins; equal scores fall back to category precedence.
        scores.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| a.0.precedence().cmp(&b.0.precedence()))
        });

        let (top_intent, top_score, matched_patterns) = scores[0].clone();
        let (runner_score, alternative) = match scores.get(1) {
            Some((intent, score, _)) => (*score, Some(*intent)),
            None => (0, None),
        };

        let confidence = top_score as f32 / (top_score as f32 + runner_score as f32 + 0.25);
        let ambiguous = runner_score > 0 && top_score - runner_score <= self.score_gap;

        PlayerIntent {
            intent_type: top_intent,
            confidence,
            matched_patterns,
            ambiguous,
            alternative: if ambiguous { alternative } else { None },
        }
    }
}

/// Split into lowercase alphanumeric words, stripping punctuation.
fn tokenize(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .collect()
}

/// Whole-word sequence match: every word of `phrase` must appear contiguously
/// in `words`.
fn phrase_matches(words: &[&str], phrase: &str) -> bool {
    let parts: Vec<&str> = phrase.split_whitespace().collect();
    if parts.is_empty() || words.len() < parts.len() {
        return false;
    }
    words.windows(parts.len()).any(|w| w == parts.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_neutral() {
        let c = IntentClassifier::new();
        let intent = c.classify("   ");
        assert_eq!(intent.intent_type, IntentType::Action);
        assert_eq!(intent.confidence, 0.0);
        assert!(!intent.ambiguous);
    }

    #[test]
    fn case_and_whitespace_invariant() {
        let c = IntentClassifier::new();
        let a = c.classify("  I ATTACK the goblin ");
        let b = c.classify("i attack the goblin");
        assert_eq!(a.intent_type, b.intent_type);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.ambiguous, b.ambiguous);
    }

    #[test]
    fn phrases_outweigh_tokens() {
        let c = IntentClassifier::new();
        // "look" alone is exploration; "i say" phrase should beat a lone token.
        let intent = c.classify("i say we look later");
        assert_eq!(intent.intent_type, IntentType::Roleplay);
    }

    #[test]
    fn ties_break_by_category_precedence() {
        let c = IntentClassifier::new();
        // "attack" (combat, 2) vs "look" (exploration, 2): combat precedes.
        let intent = c.classify("look then attack");
        assert_eq!(intent.intent_type, IntentType::Combat);
        assert!(intent.ambiguous);
        assert_eq!(intent.alternative, Some(IntentType::Exploration));
    }

    #[test]
    fn unmatched_text_is_neutral() {
        let c = IntentClassifier::new();
        let intent = c.classify("zzyzx frobnicates the quux");
        assert_eq!(intent.intent_type, IntentType::Action);
        assert_eq!(intent.confidence, 0.0);
    }

    #[test]
    fn classification_is_pure() {
        let c = IntentClassifier::new();
        let a = c.classify("I search the room for traps");
        let b = c.classify("I search the room for traps");
        assert_eq!(a.intent_type, b.intent_type);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.matched_patterns, b.matched_patterns);
    }

    #[test]
    fn custom_rules_extend_the_table() {
        let c = IntentClassifier::new().with_phrase("quaff the potion", IntentType::Action);
        let intent = c.classify("quaff the potion");
        assert_eq!(intent.intent_type, IntentType::Action);
        assert!(intent.confidence > 0.9);
    }
}
