//! Sankey read model
//!
//! Flattens the stored hours of one funnel into `{nodes, links}` for a chart
//! layer. Visitor sets are unioned across the selected hours, so a visitor
//! active in several hours is counted once.

use chrono::{DateTime, Duration, Utc};
use epinet_common::hour_key::{current_hour_key, hour_keys_between, hour_keys_for_range};
use epinet_common::{HourKey, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::aggregate::HourlyEpinetData;
use crate::store::EpinetStore;

/// Which hours a view covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HourWindow {
    /// The most recent `n` hours including the current one
    LastHours(usize),
    /// Hours between two "hours ago" offsets, inclusive, in either order
    Between { start_hours_ago: u32, end_hours_ago: u32 },
}

impl HourWindow {
    /// Hour keys of the window, never more than `max_hours`
    pub fn hour_keys(&self, now: DateTime<Utc>, max_hours: usize) -> Vec<HourKey> {
        match *self {
            HourWindow::LastHours(hours) => hour_keys_for_range(now, hours.min(max_hours)),
            HourWindow::Between {
                start_hours_ago,
                end_hours_ago,
            } => {
                let cap = u32::try_from(max_hours.saturating_sub(1)).unwrap_or(u32::MAX);
                let current = current_hour_key(now);
                let ago = |hours_ago: u32| {
                    let offset = Duration::hours(i64::from(hours_ago.min(cap)));
                    HourKey::containing(current.start() - offset)
                };
                hour_keys_between(ago(start_hours_ago), ago(end_hours_ago))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SankeyNode {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SankeyLink {
    /// Index into `nodes`
    pub source: usize,
    /// Index into `nodes`
    pub target: usize,
    /// Distinct visitors on this edge
    pub value: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SankeyView {
    pub id: String,
    pub title: String,
    pub nodes: Vec<SankeyNode>,
    pub links: Vec<SankeyLink>,
}

struct MergedNode<'a> {
    name: &'a str,
    step_index: usize,
    visitors: BTreeSet<&'a str>,
}

/// Build a view from already-loaded hours
///
/// With `visitor` set, every visitor set is restricted to that one visitor.
/// Only the `max_nodes` nodes with the most visitors are kept (ties broken
/// by node id); links touching a dropped node, and empty links, are omitted.
/// Nodes are listed by step index, then id.
pub fn build_sankey(
    funnel_id: &str,
    title: &str,
    hours: &[HourlyEpinetData],
    visitor: Option<&str>,
    max_nodes: usize,
) -> SankeyView {
    let keep_visitor = |v: &str| visitor.map_or(true, |only| only == v);

    let mut nodes: BTreeMap<&str, MergedNode<'_>> = BTreeMap::new();
    let mut edges: BTreeMap<(&str, &str), BTreeSet<&str>> = BTreeMap::new();

    for data in hours {
        for (node_id, node) in &data.steps {
            let merged = nodes.entry(node_id.as_str()).or_insert_with(|| MergedNode {
                name: &node.name,
                step_index: node.step_index,
                visitors: BTreeSet::new(),
            });
            merged
                .visitors
                .extend(node.visitors.iter().map(String::as_str).filter(|v| keep_visitor(*v)));
        }
        for (from, targets) in &data.transitions {
            for (to, transition) in targets {
                edges
                    .entry((from.as_str(), to.as_str()))
                    .or_default()
                    .extend(
                        transition
                            .visitors
                            .iter()
                            .map(String::as_str)
                            .filter(|v| keep_visitor(*v)),
                    );
            }
        }
    }

    let mut ranked: Vec<(&str, &MergedNode<'_>)> = nodes
        .iter()
        .filter(|(_, node)| !node.visitors.is_empty())
        .map(|(id, node)| (*id, node))
        .collect();
    ranked.sort_by(|(a_id, a), (b_id, b)| {
        b.visitors.len().cmp(&a.visitors.len()).then_with(|| a_id.cmp(b_id))
    });
    ranked.truncate(max_nodes);
    ranked.sort_by(|(a_id, a), (b_id, b)| {
        a.step_index.cmp(&b.step_index).then_with(|| a_id.cmp(b_id))
    });

    let index: HashMap<&str, usize> = ranked
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (*id, i))
        .collect();

    let links = edges
        .iter()
        .filter(|(_, visitors)| !visitors.is_empty())
        .filter_map(|((from, to), visitors)| {
            Some(SankeyLink {
                source: *index.get(from)?,
                target: *index.get(to)?,
                value: visitors.len(),
            })
        })
        .collect();

    SankeyView {
        id: funnel_id.to_string(),
        title: title.to_string(),
        nodes: ranked
            .into_iter()
            .map(|(id, node)| SankeyNode {
                id: id.to_string(),
                name: node.name.to_string(),
            })
            .collect(),
        links,
    }
}

/// Visitors seen in `hours`, most node memberships first, then by id
pub fn rank_visitors(hours: &[HourlyEpinetData]) -> Vec<String> {
    let mut memberships: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for data in hours {
        for (node_id, node) in &data.steps {
            for visitor in &node.visitors {
                memberships
                    .entry(visitor.as_str())
                    .or_default()
                    .insert(node_id.as_str());
            }
        }
    }

    let mut ranked: Vec<(&str, usize)> = memberships
        .into_iter()
        .map(|(visitor, nodes)| (visitor, nodes.len()))
        .collect();
    ranked.sort_by(|(a, a_count), (b, b_count)| b_count.cmp(a_count).then_with(|| a.cmp(b)));
    ranked.into_iter().map(|(visitor, _)| visitor.to_string()).collect()
}

async fn load_hours(
    store: &dyn EpinetStore,
    tenant: &str,
    funnel_id: &str,
    hour_keys: &[HourKey],
) -> Result<Vec<HourlyEpinetData>> {
    let mut hours = Vec::new();
    for key in hour_keys {
        if let Some(data) = store.get(tenant, funnel_id, *key).await? {
            hours.push(data);
        }
    }
    Ok(hours)
}

/// View of one funnel over `hour_keys`, or `None` when nothing is stored
/// for those hours
pub async fn compute_sankey(
    store: &dyn EpinetStore,
    tenant: &str,
    funnel_id: &str,
    title: &str,
    hour_keys: &[HourKey],
    visitor: Option<&str>,
    max_nodes: usize,
) -> Result<Option<SankeyView>> {
    let hours = load_hours(store, tenant, funnel_id, hour_keys).await?;
    if hours.is_empty() {
        return Ok(None);
    }
    Ok(Some(build_sankey(funnel_id, title, &hours, visitor, max_nodes)))
}

/// Visitor ids for the visitor filter dropdown
pub async fn filtered_visitor_ids(
    store: &dyn EpinetStore,
    tenant: &str,
    funnel_id: &str,
    hour_keys: &[HourKey],
) -> Result<Vec<String>> {
    let hours = load_hours(store, tenant, funnel_id, hour_keys).await?;
    Ok(rank_visitors(&hours))
}
