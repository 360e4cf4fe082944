//! Collaborator interfaces for raw data
//!
//! The aggregation engine reads funnels, raw events and content titles through
//! these traits. The production implementation lives in [`crate::db`]; tests
//! use in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use epinet_common::Result;
use std::collections::HashMap;
use std::sync::Arc;

use crate::aggregate::MatchCriteria;
use crate::funnel::StoredFunnel;

/// One held-belief row joined with its belief
#[derive(Debug, Clone, PartialEq)]
pub struct BeliefEvent {
    pub updated_at: DateTime<Utc>,
    /// Visitor identity
    pub fingerprint_id: String,
    pub verb: String,
    pub object: Option<String>,
    pub belief_id: String,
}

/// One content action row
#[derive(Debug, Clone, PartialEq)]
pub struct ActionEvent {
    pub created_at: DateTime<Utc>,
    /// Content id the action targeted
    pub object_id: String,
    pub object_type: String,
    /// Visitor identity
    pub fingerprint_id: String,
    pub verb: String,
}

/// Content id → title lookup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentMap {
    titles: HashMap<String, String>,
}

impl ContentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, title: impl Into<String>) {
        self.titles.insert(id.into(), title.into());
    }

    /// Title for `id`, if known and non-empty
    pub fn title(&self, id: &str) -> Option<&str> {
        self.titles.get(id).map(String::as_str).filter(|t| !t.is_empty())
    }

    pub fn len(&self) -> usize {
        self.titles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.titles.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ContentMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = ContentMap::new();
        for (id, title) in iter {
            map.insert(id, title);
        }
        map
    }
}

/// Per-tenant access to funnels, raw events and content titles
#[async_trait]
pub trait EpinetSource: Send + Sync {
    /// Every stored funnel row, payload unparsed
    async fn load_funnel_rows(&self) -> Result<Vec<StoredFunnel>>;

    /// Belief rows in `[start, end)` whose verb or object is named by `criteria`
    async fn belief_events(
        &self,
        criteria: &MatchCriteria,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BeliefEvent>>;

    /// Action rows in `[start, end)` whose verb (and type, when every action
    /// step constrains it) is named by `criteria`
    async fn action_events(
        &self,
        criteria: &MatchCriteria,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ActionEvent>>;

    /// Content titles for node naming
    async fn content_titles(&self) -> Result<ContentMap>;
}

/// Resolves the data source for a tenant at the start of each run
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn source_for(&self, tenant_id: &str) -> Result<Arc<dyn EpinetSource>>;
}
