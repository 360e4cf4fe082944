//! Per-hour, per-funnel visitor aggregation
//!
//! A chunk of hours is aggregated with two consolidated queries (one for
//! belief rows, one for action rows) built from the union of every funnel's
//! match criteria. Classification then runs in memory against each
//! (funnel, step) pair.

use chrono::{DateTime, Utc};
use epinet_common::{HourKey, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::classifier::{classify_action, classify_belief, NodeMatch};
use crate::funnel::{Funnel, Step};
use crate::source::{ActionEvent, BeliefEvent, ContentMap, EpinetSource};
use crate::transitions::infer_transitions;

/// Distinct visitors who reached one node within one hour
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeData {
    pub visitors: BTreeSet<String>,
    pub name: String,
    pub step_index: usize,
}

/// Distinct visitors who moved between two nodes within one hour
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransitionData {
    pub visitors: BTreeSet<String>,
}

/// Aggregate for one funnel over one hour
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HourlyEpinetData {
    pub steps: BTreeMap<String, NodeData>,
    /// `from node → to node → visitors`
    pub transitions: BTreeMap<String, BTreeMap<String, TransitionData>>,
}

impl HourlyEpinetData {
    /// Record that `visitor` reached the node described by `node`
    ///
    /// Registering the same visitor twice for a node is a no-op.
    pub fn register_visitor(&mut self, node: NodeMatch, step_index: usize, visitor: &str) {
        let entry = self.steps.entry(node.node_id).or_insert_with(|| NodeData {
            visitors: BTreeSet::new(),
            name: node.name,
            step_index,
        });
        if !entry.visitors.contains(visitor) {
            entry.visitors.insert(visitor.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Visitors on the `from → to` edge, if any
    pub fn transition(&self, from: &str, to: &str) -> Option<&TransitionData> {
        self.transitions.get(from)?.get(to)
    }
}

/// Union of all funnels' matching criteria, used to build the consolidated
/// queries for one chunk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchCriteria {
    /// Verbs accepted by any `belief` step
    pub belief_values: BTreeSet<String>,
    /// Objects accepted by any `identifyAs` step
    pub identify_as_values: BTreeSet<String>,
    /// Verbs accepted by any action step
    pub action_verbs: BTreeSet<String>,
    /// Object types to push down into the action query; `None` when at least
    /// one action step accepts any type
    pub action_object_types: Option<BTreeSet<String>>,
}

impl MatchCriteria {
    pub fn from_funnels(funnels: &[Funnel]) -> Self {
        let mut criteria = MatchCriteria::default();
        let mut object_types = BTreeSet::new();
        let mut every_action_typed = true;
        let mut saw_action = false;

        for step in funnels.iter().flat_map(|f| f.steps.iter()) {
            match step {
                Step::Belief(gate) => criteria.belief_values.extend(gate.values.iter().cloned()),
                Step::IdentifyAs(gate) => {
                    criteria.identify_as_values.extend(gate.values.iter().cloned())
                }
                Step::CommitmentAction(gate) | Step::ConversionAction(gate) => {
                    saw_action = true;
                    criteria.action_verbs.extend(gate.values.iter().cloned());
                    match gate.required_object_type() {
                        Some(object_type) => {
                            object_types.insert(object_type.to_string());
                        }
                        None => every_action_typed = false,
                    }
                }
            }
        }

        if saw_action && every_action_typed {
            criteria.action_object_types = Some(object_types);
        }
        criteria
    }

    pub fn has_belief_criteria(&self) -> bool {
        !self.belief_values.is_empty() || !self.identify_as_values.is_empty()
    }

    pub fn has_action_criteria(&self) -> bool {
        !self.action_verbs.is_empty()
    }
}

/// Raw rows fetched for one chunk
#[derive(Debug, Clone, Default)]
pub struct ChunkEvents {
    pub beliefs: Vec<BeliefEvent>,
    pub actions: Vec<ActionEvent>,
}

/// Run the two consolidated queries for `[start, end)`
///
/// A query whose criteria are empty is skipped entirely.
pub async fn fetch_chunk_events(
    source: &dyn EpinetSource,
    criteria: &MatchCriteria,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<ChunkEvents> {
    let beliefs = if criteria.has_belief_criteria() {
        source.belief_events(criteria, start, end).await?
    } else {
        Vec::new()
    };
    let actions = if criteria.has_action_criteria() {
        source.action_events(criteria, start, end).await?
    } else {
        Vec::new()
    };
    Ok(ChunkEvents { beliefs, actions })
}

/// Classify a chunk's rows against one funnel and infer each hour's
/// transitions
///
/// Rows whose hour is not in `hours` are skipped. Only hours with at least
/// one matched row appear in the result.
pub fn aggregate_funnel(
    funnel: &Funnel,
    hours: &BTreeSet<HourKey>,
    events: &ChunkEvents,
    content: &ContentMap,
) -> BTreeMap<HourKey, HourlyEpinetData> {
    let mut by_hour: BTreeMap<HourKey, HourlyEpinetData> = BTreeMap::new();
    let mut skipped = 0usize;

    for row in &events.beliefs {
        let hour = HourKey::containing(row.updated_at);
        if !hours.contains(&hour) {
            skipped += 1;
            continue;
        }
        for (step_index, step) in funnel.indexed_steps() {
            if let Some(node) = classify_belief(row, step, content) {
                by_hour
                    .entry(hour)
                    .or_default()
                    .register_visitor(node, step_index, &row.fingerprint_id);
            }
        }
    }

    for row in &events.actions {
        let hour = HourKey::containing(row.created_at);
        if !hours.contains(&hour) {
            skipped += 1;
            continue;
        }
        for (step_index, step) in funnel.indexed_steps() {
            if let Some(node) = classify_action(row, step, content) {
                by_hour
                    .entry(hour)
                    .or_default()
                    .register_visitor(node, step_index, &row.fingerprint_id);
            }
        }
    }

    if skipped > 0 {
        debug!(funnel_id = %funnel.id, skipped, "Skipped rows outside the requested hours");
    }

    for data in by_hour.values_mut() {
        infer_transitions(data);
    }
    by_hour
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::{ActionGate, BeliefGate};
    use chrono::TimeZone;

    fn funnel(id: &str, steps: Vec<Step>) -> Funnel {
        Funnel {
            id: id.into(),
            title: id.into(),
            steps,
            promoted: false,
        }
    }

    fn belief(values: &[&str]) -> Step {
        Step::Belief(BeliefGate {
            values: values.iter().map(|v| v.to_string()).collect(),
            title: None,
        })
    }

    fn identify(values: &[&str]) -> Step {
        Step::IdentifyAs(BeliefGate {
            values: values.iter().map(|v| v.to_string()).collect(),
            title: None,
        })
    }

    fn clicked(object_type: Option<&str>) -> Step {
        Step::CommitmentAction(ActionGate {
            values: vec!["CLICKED".into()],
            object_type: object_type.map(str::to_string),
            ..Default::default()
        })
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn belief_row(visitor: &str, verb: &str, when: DateTime<Utc>) -> BeliefEvent {
        BeliefEvent {
            updated_at: when,
            fingerprint_id: visitor.into(),
            verb: verb.into(),
            object: None,
            belief_id: "b1".into(),
        }
    }

    fn click_row(visitor: &str, pane: &str, when: DateTime<Utc>) -> ActionEvent {
        ActionEvent {
            created_at: when,
            object_id: pane.into(),
            object_type: "Pane".into(),
            fingerprint_id: visitor.into(),
            verb: "CLICKED".into(),
        }
    }

    #[test]
    fn test_criteria_union_across_funnels() {
        let funnels = vec![
            funnel("a", vec![belief(&["Yes"]), clicked(Some("Pane"))]),
            funnel("b", vec![identify(&["Builder"]), belief(&["Maybe", "Yes"])]),
        ];
        let criteria = MatchCriteria::from_funnels(&funnels);
        assert_eq!(
            criteria.belief_values.iter().collect::<Vec<_>>(),
            vec!["Maybe", "Yes"]
        );
        assert!(criteria.identify_as_values.contains("Builder"));
        assert!(criteria.action_verbs.contains("CLICKED"));
        assert_eq!(
            criteria.action_object_types,
            Some(BTreeSet::from(["Pane".to_string()]))
        );
    }

    #[test]
    fn test_untyped_action_step_disables_type_pushdown() {
        let funnels = vec![
            funnel("a", vec![clicked(Some("Pane"))]),
            funnel("b", vec![clicked(None)]),
        ];
        let criteria = MatchCriteria::from_funnels(&funnels);
        assert_eq!(criteria.action_object_types, None);
        assert!(!criteria.has_belief_criteria());
        assert!(criteria.has_action_criteria());
    }

    #[test]
    fn test_register_visitor_is_idempotent() {
        let mut data = HourlyEpinetData::default();
        let node = NodeMatch {
            node_id: "belief-Yes-none".into(),
            name: "Believes: Yes".into(),
        };
        data.register_visitor(node.clone(), 1, "V1");
        data.register_visitor(node, 1, "V1");
        assert_eq!(data.steps["belief-Yes-none"].visitors.len(), 1);
    }

    #[test]
    fn test_belief_then_click_in_one_hour() {
        let f = funnel("f1", vec![belief(&["Yes"]), clicked(Some("Pane"))]);
        let hour = HourKey::containing(at(10, 0));
        let events = ChunkEvents {
            beliefs: vec![belief_row("V1", "Yes", at(10, 5))],
            actions: vec![click_row("V1", "P1", at(10, 20))],
        };

        let result = aggregate_funnel(&f, &BTreeSet::from([hour]), &events, &ContentMap::new());
        let data = &result[&hour];
        assert!(data.steps["belief-Yes-none"].visitors.contains("V1"));
        assert_eq!(data.steps["commitmentAction-Pane-CLICKED-P1"].step_index, 2);
        assert!(data
            .transition("belief-Yes-none", "commitmentAction-Pane-CLICKED-P1")
            .unwrap()
            .visitors
            .contains("V1"));
    }

    #[test]
    fn test_rows_are_bucketed_by_hour_and_outliers_skipped() {
        let f = funnel("f1", vec![belief(&["Yes"])]);
        let ten = HourKey::containing(at(10, 0));
        let eleven = HourKey::containing(at(11, 0));
        let events = ChunkEvents {
            beliefs: vec![
                belief_row("V1", "Yes", at(10, 59)),
                belief_row("V2", "Yes", at(11, 0)),
                belief_row("V3", "Yes", at(12, 30)),
            ],
            actions: vec![],
        };

        let result = aggregate_funnel(
            &f,
            &BTreeSet::from([ten, eleven]),
            &events,
            &ContentMap::new(),
        );
        assert_eq!(result.len(), 2);
        assert!(result[&ten].steps["belief-Yes-none"].visitors.contains("V1"));
        assert!(result[&eleven].steps["belief-Yes-none"].visitors.contains("V2"));
        assert!(!result
            .values()
            .any(|d| d.steps.values().any(|n| n.visitors.contains("V3"))));
    }

    #[test]
    fn test_funnel_without_steps_produces_nothing() {
        let f = funnel("broken", vec![]);
        let hour = HourKey::containing(at(10, 0));
        let events = ChunkEvents {
            beliefs: vec![belief_row("V1", "Yes", at(10, 5))],
            actions: vec![click_row("V1", "P1", at(10, 6))],
        };
        assert!(aggregate_funnel(&f, &BTreeSet::from([hour]), &events, &ContentMap::new())
            .is_empty());
    }

    #[test]
    fn test_one_row_can_match_steps_in_several_funnels() {
        let a = funnel("a", vec![belief(&["Yes"])]);
        let b = funnel("b", vec![identify(&["x"]), belief(&["Yes"])]);
        let hour = HourKey::containing(at(10, 0));
        let events = ChunkEvents {
            beliefs: vec![belief_row("V1", "Yes", at(10, 5))],
            actions: vec![],
        };
        let hours = BTreeSet::from([hour]);
        let content = ContentMap::new();

        assert_eq!(aggregate_funnel(&a, &hours, &events, &content)[&hour].steps["belief-Yes-none"].step_index, 1);
        assert_eq!(aggregate_funnel(&b, &hours, &events, &content)[&hour].steps["belief-Yes-none"].step_index, 2);
    }
}
