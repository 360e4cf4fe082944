//! Step-to-step transition inference for one hour bucket

use std::collections::{BTreeMap, BTreeSet};

use crate::aggregate::{HourlyEpinetData, TransitionData};

/// Rebuild `data.transitions` from `data.steps`
///
/// Each visitor's nodes are ordered by `(step_index, node_id)`. Every ordered
/// pair that does not go backwards in step order becomes an edge carrying the
/// visitor. Self edges are never produced.
pub fn infer_transitions(data: &mut HourlyEpinetData) {
    data.transitions.clear();

    let mut visited: BTreeMap<&str, Vec<(usize, &str)>> = BTreeMap::new();
    for (node_id, node) in &data.steps {
        for visitor in &node.visitors {
            visited
                .entry(visitor.as_str())
                .or_default()
                .push((node.step_index, node_id.as_str()));
        }
    }

    let mut edges: BTreeMap<String, BTreeMap<String, TransitionData>> = BTreeMap::new();
    for (visitor, mut nodes) in visited {
        if nodes.len() < 2 {
            continue;
        }
        nodes.sort_unstable();

        for (i, &(from_index, from)) in nodes.iter().enumerate() {
            for &(to_index, to) in &nodes[i + 1..] {
                if from == to || from_index > to_index {
                    continue;
                }
                edges
                    .entry(from.to_string())
                    .or_default()
                    .entry(to.to_string())
                    .or_insert_with(|| TransitionData {
                        visitors: BTreeSet::new(),
                    })
                    .visitors
                    .insert(visitor.to_string());
            }
        }
    }

    data.transitions = edges;
}
