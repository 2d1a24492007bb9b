use serde::{Deserialize, Serialize};

use crate::core::query::{Bound, FieldFilter, OrderBy, OrderDirection, Query};
use crate::model::{DocumentKey, FieldPath, ResourcePath, TargetId};

/// A canonicalized query: the unit the remote authority listens to.
/// Limit-to-last queries map to targets with flipped ordering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    order_by: Vec<OrderBy>,
    limit: Option<u32>,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Target {
    pub(crate) fn new(
        path: ResourcePath,
        collection_group: Option<String>,
        filters: Vec<FieldFilter>,
        order_by: Vec<OrderBy>,
        limit: Option<u32>,
        start_at: Option<Bound>,
        end_at: Option<Bound>,
    ) -> Self {
        Self {
            path,
            collection_group,
            filters,
            order_by,
            limit,
            start_at,
            end_at,
        }
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Query::document(key).to_target()
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    /// Collection id the target reads from, used to pick field indexes.
    pub fn collection_id(&self) -> Option<&str> {
        match &self.collection_group {
            Some(group) => Some(group.as_str()),
            None => self.path.last_segment(),
        }
    }

    pub fn filters_on(&self, field: &FieldPath) -> impl Iterator<Item = &FieldFilter> {
        let field = field.clone();
        self.filters.iter().filter(move |f| f.field() == &field)
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.field().canonical_string());
            id.push_str(match order.direction() {
                OrderDirection::Ascending => "asc",
                OrderDirection::Descending => "desc",
            });
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(bound) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&bound.canonical_id());
        }
        id
    }
}

/// Hands out target ids. Query targets take even ids, limbo-resolution
/// targets odd ids, so the two never collide.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    next_id: TargetId,
}

impl TargetIdGenerator {
    /// Even ids strictly above `highest`.
    pub fn for_target_cache(highest: TargetId) -> Self {
        let base = highest.max(0);
        let next_id = if base % 2 == 0 { base + 2 } else { base + 1 };
        Self { next_id }
    }

    pub fn for_sync_engine() -> Self {
        Self { next_id: 1 }
    }

    pub fn next(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}
