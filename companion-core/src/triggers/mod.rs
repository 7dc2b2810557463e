//! Keyword and status triggers that nudge the character.
//!
//! A [`TriggerRule`] pairs a matcher with a message window and a suppression
//! policy. Matching is pure: it looks at recent messages and a snapshot of
//! observed state. Suppression is applied afterwards by the
//! [`TriggerEvaluator`], which keeps a durable [`Marker`] per rule and
//! character so that one-shot advisories stay one-shot across turns.

mod rules;

pub use rules::{
    KeywordGroup, CARE_GROUPS, DECLINED_CALL_PHRASES, DEFAULT_RULES, EMOTIONAL_PHRASES,
    MEMO_GROUPS,
};

use crate::message::{last_n, last_sent, FeaturePayload, FeatureStatus, Message, MessageKind};
use crate::relationship::LastOutcome;
use crate::store::{StateStore, StorageScope, StoreError, WriteOutcome};
use chrono::{DateTime, Duration, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Which context section an advisory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AdvisoryClass {
    /// Reminders about feature cards awaiting an answer or recently declined.
    FeatureStatus,
    /// Suggestions for how the character might react.
    Nudge,
}

/// Text a fired rule contributes to the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advisory {
    pub rule_id: &'static str,
    pub class: AdvisoryClass,
    pub priority: u8,
    pub text: String,
}

/// What a matcher found.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hit {
    /// The observed value suppression is keyed on.
    pub value: String,
    /// Matcher-specific pieces for the template.
    pub details: Vec<String>,
}

impl Hit {
    fn new(value: impl Into<String>, details: Vec<String>) -> Self {
        Self {
            value: value.into(),
            details,
        }
    }
}

/// State the triggers can see besides the messages.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub character_id: String,
    /// The user's current display name.
    pub nickname: Option<String>,
    /// How the last couple-space relationship finished, if it did.
    pub last_outcome: Option<LastOutcome>,
}

/// Which messages a rule looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Window {
    /// The last `n` messages of any kind.
    Messages(usize),
    /// The last `count` messages the user sent, optionally only short ones.
    Sent {
        count: usize,
        max_chars: Option<usize>,
    },
    /// No messages; the matcher reads observed state only.
    State,
}

impl Window {
    fn select<'a>(&self, history: &'a [Message]) -> Vec<&'a Message> {
        match self {
            Window::Messages(n) => last_n(history, *n).iter().collect(),
            Window::Sent { count, max_chars } => last_sent(history, *count)
                .into_iter()
                .filter(|m| match max_chars {
                    Some(max) => m.text().chars().count() <= *max,
                    None => true,
                })
                .collect(),
            Window::State => Vec::new(),
        }
    }
}

/// How a rule recognizes its situation.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// First keyword found, scanning messages oldest first and groups in order.
    KeywordGroups(&'static [KeywordGroup]),
    /// Every distinct phrase found anywhere in the window.
    Phrases(&'static [&'static str]),
    /// Feature cards the user sent that still await an answer.
    PendingFeatures,
    /// Features the user recently declined.
    FeatureRejections,
    /// The last couple-space relationship with this character finished.
    CoupleOutcome,
    /// The user's current nickname.
    Nickname,
}

impl Matcher {
    fn detect(&self, window: &[&Message], observed: &Observation) -> Option<Hit> {
        match self {
            Matcher::KeywordGroups(groups) => first_keyword(window, groups),
            Matcher::Phrases(phrases) => {
                let mut found: Vec<String> = Vec::new();
                for msg in window {
                    let text = Searchable::new(msg.text());
                    for phrase in phrases.iter() {
                        if text.contains(phrase) && !found.iter().any(|f| f == phrase) {
                            found.push(phrase.to_string());
                        }
                    }
                }
                (!found.is_empty()).then(|| Hit::new(found.join(","), found))
            }
            Matcher::PendingFeatures => {
                let lines = pending_features(window);
                (!lines.is_empty()).then(|| Hit::new(lines.join("\n"), lines))
            }
            Matcher::FeatureRejections => {
                let lines = feature_rejections(window);
                (!lines.is_empty()).then(|| Hit::new(lines.join("\n"), lines))
            }
            Matcher::CoupleOutcome => {
                let outcome = observed
                    .last_outcome
                    .as_ref()
                    .filter(|o| o.character_id == observed.character_id)?;
                Some(Hit::new(
                    format!("{}:{}", outcome.relationship_id, outcome.outcome.name()),
                    vec![
                        outcome.outcome.name().to_string(),
                        format!("{:?}", outcome.sender).to_lowercase(),
                    ],
                ))
            }
            Matcher::Nickname => {
                let nickname = observed.nickname.as_deref().map(str::trim)?;
                (!nickname.is_empty()).then(|| Hit::new(nickname, vec![nickname.to_string()]))
            }
        }
    }
}

/// Message text prepared for keyword lookups.
struct Searchable {
    lowered: String,
    /// Lowercased words separated by single spaces, padded with one space
    /// at each end.
    words: String,
}

impl Searchable {
    fn new(text: &str) -> Self {
        let lowered = text.to_lowercase();
        let folded: String = lowered
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();
        let words = format!(" {} ", folded.split_whitespace().collect::<Vec<_>>().join(" "));
        Self { lowered, words }
    }

    fn is_empty(&self) -> bool {
        self.lowered.trim().is_empty()
    }

    /// Whole-word match for ASCII keywords, substring match otherwise.
    fn contains(&self, keyword: &str) -> bool {
        if !keyword.is_ascii() {
            return self.lowered.contains(&keyword.to_lowercase());
        }
        let needle = Searchable::new(keyword).words;
        !needle.trim().is_empty() && self.words.contains(&needle)
    }
}

fn first_keyword(window: &[&Message], groups: &[KeywordGroup]) -> Option<Hit> {
    for msg in window {
        let text = Searchable::new(msg.text());
        if text.is_empty() {
            continue;
        }
        for group in groups {
            if let Some(word) = group.words.iter().find(|w| text.contains(w)) {
                return Some(Hit::new(*word, vec![word.to_string(), group.label.to_string()]));
            }
        }
    }
    None
}

const JUDGMENT_REASON_CAP: usize = 100;

fn pending_features(window: &[&Message]) -> Vec<String> {
    let pending: Vec<&FeaturePayload> = window
        .iter()
        .filter(|m| m.is_sent())
        .filter_map(|m| m.payload.as_ref())
        .filter(|p| p.is_pending())
        .collect();

    let mut lines = Vec::new();
    if pending.iter().any(|p| matches!(p, FeaturePayload::Transfer { .. })) {
        lines.push(
            "Transfer: the user sent you money. Accept it or return it, then say what you think."
                .to_string(),
        );
    }

    let payments: Vec<String> = pending
        .iter()
        .filter_map(|p| match p {
            FeaturePayload::PaymentRequest {
                item_name, amount, ..
            } => Some(format!("{item_name} {amount:.2}")),
            _ => None,
        })
        .collect();
    if !payments.is_empty() {
        lines.push(format!(
            "Payment requests: the user asked you to pay for {} order(s): {}. Answer each one separately.",
            payments.len(),
            payments.join(", ")
        ));
    }

    let carts: Vec<String> = pending
        .iter()
        .filter_map(|p| match p {
            FeaturePayload::CartPaymentRequest {
                items,
                total_amount,
                ..
            } => {
                let names: Vec<String> = items
                    .iter()
                    .map(|i| format!("{} x{}", i.name, i.quantity))
                    .collect();
                Some(format!("cart ({}) {total_amount:.2}", names.join(", ")))
            }
            _ => None,
        })
        .collect();
    if !carts.is_empty() {
        lines.push(format!(
            "Cart payments: the user asked you to pay for {} cart(s): {}. Answer each one separately.",
            carts.len(),
            carts.join("; ")
        ));
    }

    if pending.iter().any(|p| matches!(p, FeaturePayload::IntimatePay { .. })) {
        lines.push("Intimate pay: the user invited you to share a spending allowance. Accept or decline.".to_string());
    }
    if pending
        .iter()
        .any(|p| matches!(p, FeaturePayload::CoupleSpaceInvite { .. }))
    {
        lines.push("Couple space: the user invited you to open a couple space. Accept or decline.".to_string());
    }
    if pending.iter().any(|p| matches!(p, FeaturePayload::MusicInvite { .. })) {
        lines.push("Listen together: the user invited you to listen to music together. Accept or decline.".to_string());
    }

    let answered = window
        .iter()
        .any(|m| matches!(m.payload, Some(FeaturePayload::JudgmentResponse { .. })));
    let request = window.iter().find_map(|m| match &m.payload {
        Some(FeaturePayload::JudgmentRequest { user_reason }) if m.is_sent() => Some(user_reason),
        _ => None,
    });
    if let (Some(reason), false) = (request, answered) {
        let mut shown: String = reason.chars().take(JUDGMENT_REASON_CAP).collect();
        if reason.chars().count() > JUDGMENT_REASON_CAP {
            shown.push_str("...");
        }
        lines.push(format!(
            "Judgment: the user asked who is right and stated their side: \"{shown}\". Give your own view and feelings, even if you disagree."
        ));
    }

    lines
}

fn feature_rejections(window: &[&Message]) -> Vec<String> {
    let mut lines = Vec::new();

    let last_intimate = window.iter().rev().find_map(|m| match &m.payload {
        Some(p @ FeaturePayload::IntimatePay { .. }) if m.is_received() => Some(p),
        _ => None,
    });
    if let Some(FeaturePayload::IntimatePay {
        monthly_limit,
        status: FeatureStatus::Rejected,
    }) = last_intimate
    {
        lines.push(format!(
            "Intimate pay: the user declined your invitation (monthly limit {monthly_limit:.2})."
        ));
    }

    let last_music = window.iter().rev().find_map(|m| match &m.payload {
        Some(p @ FeaturePayload::MusicInvite { .. }) if m.is_received() => Some(p),
        _ => None,
    });
    if let Some(FeaturePayload::MusicInvite {
        song_title,
        song_artist,
        status: FeatureStatus::Rejected,
    }) = last_music
    {
        lines.push(format!(
            "Listen together: the user declined your invitation (\"{song_title}\" by {song_artist})."
        ));
    }

    let declined_call = window.iter().rev().any(|m| {
        m.kind == MessageKind::System
            && m.ai_readable
                .as_deref()
                .is_some_and(|text| DECLINED_CALL_PHRASES.iter().any(|p| text.contains(p)))
    });
    if declined_call {
        lines.push("Video call: the user declined your video call.".to_string());
    }

    lines
}

// ============================================================================
// Suppression
// ============================================================================

/// How often a matching rule may fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suppression {
    /// Every time it matches.
    None,
    /// Once per distinct observed value. With `require_baseline`, the first
    /// value ever observed is only recorded.
    OncePerValue { require_baseline: bool },
    /// At most once per period.
    Cooldown(Duration),
}

/// Durable record of what a rule has seen and advised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(default)]
    pub advised: Option<String>,
    #[serde(default)]
    pub fired_at: Option<DateTime<Utc>>,
}

/// Whether a hit fires, and the marker to store afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub fire: bool,
    pub marker: Marker,
}

/// Apply a suppression policy to a hit on `value`.
pub fn decide(
    suppression: &Suppression,
    marker: &Marker,
    value: &str,
    now: DateTime<Utc>,
) -> Decision {
    let mut next = marker.clone();
    let fire = match suppression {
        Suppression::None => true,
        Suppression::OncePerValue { require_baseline } => {
            next.last_seen = Some(value.to_string());
            let fire = match marker.last_seen.as_deref() {
                None => !require_baseline,
                Some(seen) => seen != value,
            } && marker.advised.as_deref() != Some(value);
            if fire {
                next.advised = Some(value.to_string());
                next.fired_at = Some(now);
            }
            fire
        }
        Suppression::Cooldown(period) => {
            let fire = match marker.fired_at {
                Some(at) => now - at >= *period,
                None => true,
            };
            if fire {
                next.fired_at = Some(now);
            }
            fire
        }
    };
    Decision { fire, marker: next }
}

// ============================================================================
// Rules
// ============================================================================

/// A declarative trigger.
#[derive(Debug, Clone)]
pub struct TriggerRule {
    pub id: &'static str,
    pub class: AdvisoryClass,
    /// Lower fires earlier within its section.
    pub priority: u8,
    pub window: Window,
    pub matcher: Matcher,
    pub suppression: Suppression,
    pub template: fn(&Hit) -> String,
}

impl TriggerRule {
    pub fn new(
        id: &'static str,
        class: AdvisoryClass,
        matcher: Matcher,
        template: fn(&Hit) -> String,
    ) -> Self {
        Self {
            id,
            class,
            priority: 50,
            window: Window::State,
            matcher,
            suppression: Suppression::None,
            template,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_window(mut self, window: Window) -> Self {
        self.window = window;
        self
    }

    pub fn with_suppression(mut self, suppression: Suppression) -> Self {
        self.suppression = suppression;
        self
    }

    /// Run the matcher over this rule's window.
    pub fn detect(&self, history: &[Message], observed: &Observation) -> Option<Hit> {
        let window = self.window.select(history);
        self.matcher.detect(&window, observed)
    }

    fn advisory(&self, hit: &Hit) -> Advisory {
        Advisory {
            rule_id: self.id,
            class: self.class,
            priority: self.priority,
            text: (self.template)(hit),
        }
    }

    fn marker_key(&self, character_id: &str) -> String {
        format!("marker:{}:{}", self.id, character_id)
    }
}

// ============================================================================
// Evaluator
// ============================================================================

/// Runs a rule table and applies suppression against stored markers.
#[derive(Clone)]
pub struct TriggerEvaluator {
    state: StateStore,
    rules: Vec<TriggerRule>,
}

impl TriggerEvaluator {
    pub fn new(state: StateStore, rules: Vec<TriggerRule>) -> Self {
        Self { state, rules }
    }

    /// An evaluator over [`DEFAULT_RULES`].
    pub fn with_default_rules(state: StateStore) -> Self {
        Self::new(state, DEFAULT_RULES.clone())
    }

    pub fn rules(&self) -> &[TriggerRule] {
        &self.rules
    }

    /// Every rule that matches, before suppression. Touches no state.
    pub fn detect<'a>(
        &'a self,
        history: &[Message],
        observed: &Observation,
    ) -> Vec<(&'a TriggerRule, Hit)> {
        self.rules
            .iter()
            .filter_map(|rule| rule.detect(history, observed).map(|hit| (rule, hit)))
            .collect()
    }

    /// Advisories that fire this turn, ordered by section then priority.
    ///
    /// Markers for suppressed rules are written before this returns.
    pub async fn evaluate(
        &self,
        scope: &StorageScope,
        history: &[Message],
        observed: &Observation,
        now: DateTime<Utc>,
    ) -> Result<Vec<Advisory>, StoreError> {
        let hits = self.detect(history, observed);

        let markers = try_join_all(hits.iter().map(|(rule, _)| async move {
            match rule.suppression {
                Suppression::None => Ok(None),
                _ => {
                    let key = rule.marker_key(&observed.character_id);
                    self.state.load::<Marker>(scope, &key).await.map(Some)
                }
            }
        }))
        .await?;

        let mut advisories = Vec::new();
        let mut updates = Vec::new();
        for ((rule, hit), marker) in hits.into_iter().zip(markers) {
            let fire = match marker {
                None => true,
                Some(marker) => {
                    let decision = decide(&rule.suppression, &marker, &hit.value, now);
                    if decision.marker != marker {
                        updates.push((rule.marker_key(&observed.character_id), decision.marker));
                    }
                    decision.fire
                }
            };
            if fire {
                debug!(rule = rule.id, character = %observed.character_id, "trigger fired");
                advisories.push(rule.advisory(&hit));
            }
        }

        let outcomes = try_join_all(
            updates
                .iter()
                .map(|(key, marker)| self.state.save(scope, key, marker)),
        )
        .await?;
        for ((key, _), outcome) in updates.iter().zip(outcomes) {
            if outcome == WriteOutcome::Dropped {
                warn!(%scope, key = %key, "trigger marker not saved, advisory may repeat");
            }
        }

        advisories.sort_by_key(|a| (a.class, a.priority));
        Ok(advisories)
    }
}
