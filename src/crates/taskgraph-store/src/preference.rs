//! Learned checkpoint-approval preferences
//!
//! Every explicit approval or rejection is recorded against
//! `(user_id, preference_key)` together with the checkpoint's preview
//! context. Future checkpoints with a compatible context can then be
//! auto-approved once the stored confidence clears the engine's threshold.
//!
//! Confidence dynamics: a new preference starts at 0.6, each consistent
//! repeat adds 0.1 (capped at 1.0), and a contradicting decision flips the
//! stored decision and resets confidence to 0.5.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Confidence assigned to a freshly recorded preference
pub const INITIAL_CONFIDENCE: f64 = 0.6;

/// Confidence gained per consistent repeat decision
pub const CONFIDENCE_STEP: f64 = 0.1;

/// Confidence after a contradicting decision flips the preference
pub const RESET_CONFIDENCE: f64 = 0.5;

/// The decision a preference encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceDecision {
    Approved,
    Rejected,
}

/// A stored decision rule for one `(user_id, preference_key)` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preference {
    pub id: String,
    pub user_id: String,
    pub preference_key: String,
    /// Context captured when the decision was made; a query context is
    /// compatible when no shared key disagrees
    #[serde(default)]
    pub context_pattern: HashMap<String, Value>,
    pub decision: PreferenceDecision,
    pub confidence: f64,
    /// Number of times this preference auto-approved a checkpoint
    #[serde(default)]
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Preference {
    pub fn new(
        user_id: impl Into<String>,
        preference_key: impl Into<String>,
        context_pattern: HashMap<String, Value>,
        decision: PreferenceDecision,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            preference_key: preference_key.into(),
            context_pattern,
            decision,
            confidence: INITIAL_CONFIDENCE,
            usage_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_usage_count(mut self, usage_count: u64) -> Self {
        self.usage_count = usage_count;
        self
    }

    /// Whether a query context is compatible with this preference
    ///
    /// Compatible means no key present in both the stored pattern and the
    /// query carries a different value. Keys on one side only never
    /// disqualify a match; the pattern is a partial description, not an
    /// exact fingerprint.
    pub fn matches_context(&self, context: &HashMap<String, Value>) -> bool {
        self.context_pattern.iter().all(|(key, stored)| {
            context.get(key).map(|queried| queried == stored).unwrap_or(true)
        })
    }

    /// Fold a new decision into this preference
    pub fn absorb_decision(&mut self, decision: PreferenceDecision) {
        if self.decision == decision {
            self.confidence = (self.confidence + CONFIDENCE_STEP).min(1.0);
        } else {
            self.decision = decision;
            self.confidence = RESET_CONFIDENCE;
        }
        self.updated_at = Utc::now();
    }
}

/// Result of a preference lookup
#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceMatch {
    pub preference: Preference,
    /// Confidence of the matched preference at lookup time
    pub confidence: f64,
}
