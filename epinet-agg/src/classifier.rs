//! Event classification against funnel steps
//!
//! Matching is evaluated per (funnel, step) pair: the same raw row may satisfy
//! several steps in several funnels.
//!
//! Node identity is `gateType-value-contentId` for belief gates and
//! `gateType-objectType-verb-contentId` for action gates, where the value/verb
//! is the step's first listed value. Belief gates have no content of their
//! own, so their content part is the fixed [`NO_CONTENT_ID`] sentinel.
//!
//! The segment count is fixed per gate kind: a step with no values keeps an
//! empty value segment (`belief--none`) instead of dropping it.

use crate::funnel::{ActionGate, Step};
use crate::source::{ActionEvent, BeliefEvent, ContentMap};

/// Content-id placeholder for belief and identifyAs nodes
pub const NO_CONTENT_ID: &str = "none";

/// Label used when a content id has no known title
pub const UNKNOWN_CONTENT_TITLE: &str = "Unknown Content";

/// A row's classification into one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMatch {
    pub node_id: String,
    pub name: String,
}

/// Does a belief row satisfy `step`?
///
/// `belief` gates test the row's verb, `identifyAs` gates its object. Action
/// gates never match belief rows.
pub fn match_belief(row: &BeliefEvent, step: &Step) -> bool {
    match step {
        Step::Belief(gate) => gate.values.iter().any(|v| *v == row.verb),
        Step::IdentifyAs(gate) => row
            .object
            .as_deref()
            .is_some_and(|object| gate.values.iter().any(|v| v == object)),
        Step::CommitmentAction(_) | Step::ConversionAction(_) => false,
    }
}

/// Does an action row satisfy `step`?
pub fn match_action(row: &ActionEvent, step: &Step) -> bool {
    match step.as_action() {
        Some(gate) => action_gate_matches(gate, row),
        None => false,
    }
}

fn action_gate_matches(gate: &ActionGate, row: &ActionEvent) -> bool {
    if !gate.values.iter().any(|v| *v == row.verb) {
        return false;
    }
    if let Some(required) = gate.required_object_type() {
        if required != row.object_type {
            return false;
        }
    }
    if let Some(ids) = gate.required_object_ids() {
        if !ids.iter().any(|id| *id == row.object_id) {
            return false;
        }
    }
    true
}

/// Stable node id for a (step, content) pair
pub fn node_id(step: &Step, content_id: &str) -> String {
    let representative = step.values().first().map(String::as_str).unwrap_or("");
    let mut parts: Vec<&str> = vec![step.gate_type().as_str()];
    if let Some(gate) = step.as_action() {
        parts.push(gate.object_type.as_deref().unwrap_or(""));
    }
    parts.push(representative);
    parts.push(content_id);
    parts.join("-")
}

/// Human-readable node label
pub fn node_name(step: &Step, content_id: &str, content: &ContentMap) -> String {
    match step {
        Step::Belief(gate) => format!(
            "Believes: {}",
            step.title().map(str::to_string).unwrap_or_else(|| gate.values.join("/"))
        ),
        Step::IdentifyAs(gate) => format!(
            "Identifies as: {}",
            step.title().map(str::to_string).unwrap_or_else(|| gate.values.join("/"))
        ),
        Step::CommitmentAction(gate) | Step::ConversionAction(gate) => {
            let verb = gate.values.first().map(String::as_str).unwrap_or("");
            let title = content.title(content_id).unwrap_or(UNKNOWN_CONTENT_TITLE);
            format!("{verb}: {title}")
        }
    }
}

/// Classify a belief row against one step
pub fn classify_belief(row: &BeliefEvent, step: &Step, content: &ContentMap) -> Option<NodeMatch> {
    if !match_belief(row, step) {
        return None;
    }
    Some(NodeMatch {
        node_id: node_id(step, NO_CONTENT_ID),
        name: node_name(step, NO_CONTENT_ID, content),
    })
}

/// Classify an action row against one step; the row's object id becomes the
/// node's content id
pub fn classify_action(row: &ActionEvent, step: &Step, content: &ContentMap) -> Option<NodeMatch> {
    if !match_action(row, step) {
        return None;
    }
    Some(NodeMatch {
        node_id: node_id(step, &row.object_id),
        name: node_name(step, &row.object_id, content),
    })
}
