use serde::{Deserialize, Serialize};

/// Data classification tiers, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataClassification {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl DataClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataClassification::Public => "public",
            DataClassification::Internal => "internal",
            DataClassification::Confidential => "confidential",
            DataClassification::Restricted => "restricted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyAction {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "DP")]
    Dp,
    #[serde(rename = "DeID")]
    DeId,
    #[serde(rename = "REJECT")]
    Reject,
}

impl PolicyAction {
    /// Conflict-resolution precedence: REJECT > DP > DeID > PASS
    pub fn priority(&self) -> u8 {
        match self {
            PolicyAction::Reject => 4,
            PolicyAction::Dp => 3,
            PolicyAction::DeId => 2,
            PolicyAction::Pass => 1,
        }
    }
}

/// Mechanism-specific parameters carried by a decision
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epsilon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    #[serde(default)]
    pub params: DecisionParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<DataClassification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_applied: Option<String>,
}

impl PolicyDecision {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            action: PolicyAction::Reject,
            params: DecisionParams::default(),
            matched_rule: None,
            reason: reason.into(),
            classification: None,
            role_applied: None,
        }
    }

    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            action: PolicyAction::Pass,
            params: DecisionParams::default(),
            matched_rule: None,
            reason: reason.into(),
            classification: None,
            role_applied: None,
        }
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.matched_rule = Some(rule.into());
        self
    }
}
