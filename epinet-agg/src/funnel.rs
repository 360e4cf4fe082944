//! Funnel ("epinet") definitions
//!
//! A funnel is stored as `{id, title, options_payload}` where the payload is
//! JSON holding either a bare array of steps or `{steps: [...], promoted}`.
//! Each step is a tagged union discriminated by `gateType`.
//!
//! Parsing fails soft: a payload that does not fit the schema yields a funnel
//! with no steps. The failure is logged and the run carries on.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Gate discriminator, also the first segment of every node id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GateType {
    Belief,
    IdentifyAs,
    CommitmentAction,
    ConversionAction,
}

impl GateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateType::Belief => "belief",
            GateType::IdentifyAs => "identifyAs",
            GateType::CommitmentAction => "commitmentAction",
            GateType::ConversionAction => "conversionAction",
        }
    }
}

/// Belief and identifyAs gates
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BeliefGate {
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Commitment and conversion action gates
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionGate {
    /// Accepted action verbs
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Required content type (`Pane`, `StoryFragment`, ...); empty means any
    #[serde(default)]
    pub object_type: Option<String>,
    /// Required content ids; empty means any
    #[serde(default)]
    pub object_ids: Option<Vec<String>>,
}

impl ActionGate {
    /// Object type constraint, treating `""` as unconstrained
    pub fn required_object_type(&self) -> Option<&str> {
        self.object_type.as_deref().filter(|t| !t.is_empty())
    }

    /// Object id constraint, treating `[]` as unconstrained
    pub fn required_object_ids(&self) -> Option<&[String]> {
        self.object_ids.as_deref().filter(|ids| !ids.is_empty())
    }
}

/// One funnel stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "gateType", rename_all = "camelCase")]
pub enum Step {
    /// Matches held-belief rows whose `verb` is listed
    Belief(BeliefGate),
    /// Matches held-belief rows whose `object` is listed
    IdentifyAs(BeliefGate),
    CommitmentAction(ActionGate),
    /// Same matching as [`Step::CommitmentAction`], drawn differently downstream
    ConversionAction(ActionGate),
}

impl Step {
    pub fn gate_type(&self) -> GateType {
        match self {
            Step::Belief(_) => GateType::Belief,
            Step::IdentifyAs(_) => GateType::IdentifyAs,
            Step::CommitmentAction(_) => GateType::CommitmentAction,
            Step::ConversionAction(_) => GateType::ConversionAction,
        }
    }

    pub fn values(&self) -> &[String] {
        match self {
            Step::Belief(gate) | Step::IdentifyAs(gate) => &gate.values,
            Step::CommitmentAction(gate) | Step::ConversionAction(gate) => &gate.values,
        }
    }

    pub fn title(&self) -> Option<&str> {
        let title = match self {
            Step::Belief(gate) | Step::IdentifyAs(gate) => gate.title.as_deref(),
            Step::CommitmentAction(gate) | Step::ConversionAction(gate) => gate.title.as_deref(),
        };
        title.filter(|t| !t.is_empty())
    }

    pub fn as_action(&self) -> Option<&ActionGate> {
        match self {
            Step::CommitmentAction(gate) | Step::ConversionAction(gate) => Some(gate),
            _ => None,
        }
    }
}

/// A parsed funnel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Funnel {
    pub id: String,
    pub title: String,
    /// Ordered; position + 1 is the step index
    pub steps: Vec<Step>,
    pub promoted: bool,
}

impl Funnel {
    /// Build a funnel from its stored row, tolerating a broken payload
    pub fn from_stored(stored: &StoredFunnel) -> Self {
        let (steps, promoted) = parse_options_payload(&stored.id, stored.options_payload.as_deref());
        Self {
            id: stored.id.clone(),
            title: stored.title.clone(),
            steps,
            promoted,
        }
    }

    /// Steps paired with their 1-based step index
    pub fn indexed_steps(&self) -> impl Iterator<Item = (usize, &Step)> {
        self.steps.iter().enumerate().map(|(i, step)| (i + 1, step))
    }
}

/// Raw funnel row as kept by funnel storage
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFunnel {
    pub id: String,
    pub title: String,
    pub options_payload: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OptionsPayload {
    Steps(Vec<Step>),
    Options {
        #[serde(default)]
        steps: Vec<Step>,
        #[serde(default)]
        promoted: bool,
    },
}

/// Parse an `options_payload` into `(steps, promoted)`
///
/// Any schema mismatch (bad JSON, unknown `gateType`, wrong shapes) returns
/// `(vec![], false)` after logging a warning.
pub fn parse_options_payload(funnel_id: &str, payload: Option<&str>) -> (Vec<Step>, bool) {
    let Some(raw) = payload.filter(|p| !p.trim().is_empty()) else {
        return (Vec::new(), false);
    };

    match serde_json::from_str::<OptionsPayload>(raw) {
        Ok(OptionsPayload::Steps(steps)) => (steps, false),
        Ok(OptionsPayload::Options { steps, promoted }) => (steps, promoted),
        Err(e) => {
            warn!(
                funnel_id = %funnel_id,
                error = %e,
                "Unparseable options_payload, loading funnel with no steps"
            );
            (Vec::new(), false)
        }
    }
}
