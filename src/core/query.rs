use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::Target;
use crate::error::{invalid_argument, SyncResult};
use crate::model::{DocumentKey, FieldPath, IntoFieldPath, MutableDocument, ResourcePath};
use crate::value::value_order::type_order;
use crate::value::{canonical_id, compare_values, values_equal, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThanOrEqual,
    GreaterThan,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    fn takes_array(&self) -> bool {
        matches!(
            self,
            FilterOperator::In | FilterOperator::NotIn | FilterOperator::ArrayContainsAny
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: Value,
}

impl FieldFilter {
    pub fn new(field: FieldPath, operator: FilterOperator, value: Value) -> SyncResult<Self> {
        if value.is_sentinel() {
            return Err(invalid_argument("Sentinel values cannot be used in filters"));
        }
        if operator.takes_array() {
            match value.as_array() {
                Some(values) if !values.is_empty() => {}
                _ => {
                    return Err(invalid_argument(format!(
                        "Operator '{}' requires a non-empty array value",
                        operator.as_str()
                    )))
                }
            }
        }
        if field.is_key_field() {
            if matches!(
                operator,
                FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny
            ) {
                return Err(invalid_argument(format!(
                    "Operator '{}' cannot be used on the document key",
                    operator.as_str()
                )));
            }
            let all_references = match value.as_array() {
                Some(values) if operator.takes_array() => {
                    values.iter().all(|v| v.as_reference().is_some())
                }
                _ => value.as_reference().is_some(),
            };
            if !all_references {
                return Err(invalid_argument(
                    "Document key filters require document reference values",
                ));
            }
        }
        Ok(Self {
            field,
            operator,
            value,
        })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_inequality(&self) -> bool {
        self.operator.is_inequality()
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        let key_value;
        let other = if self.field.is_key_field() {
            key_value = Value::from_reference(document.key().clone());
            Some(&key_value)
        } else {
            document.field(&self.field)
        };
        let Some(other) = other else {
            return false;
        };

        match self.operator {
            FilterOperator::ArrayContains => other
                .as_array()
                .is_some_and(|values| values.iter().any(|v| values_equal(v, &self.value))),
            FilterOperator::ArrayContainsAny => {
                let needles = self.value.as_array().unwrap_or_default();
                other.as_array().is_some_and(|values| {
                    values
                        .iter()
                        .any(|v| needles.iter().any(|needle| values_equal(v, needle)))
                })
            }
            FilterOperator::In => self
                .value
                .as_array()
                .unwrap_or_default()
                .iter()
                .any(|needle| values_equal(needle, other)),
            FilterOperator::NotIn => {
                let needles = self.value.as_array().unwrap_or_default();
                !other.is_null()
                    && !needles.iter().any(|needle| needle.is_null())
                    && !needles.iter().any(|needle| values_equal(needle, other))
            }
            FilterOperator::NotEqual => {
                !other.is_null() && !values_equal(other, &self.value)
            }
            FilterOperator::Equal => values_equal(other, &self.value),
            _ => {
                type_order(other) == type_order(&self.value)
                    && self.matches_comparison(compare_values(other, &self.value))
            }
        }
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self.operator {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.operator.as_str(),
            canonical_id(&self.value)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

impl OrderDirection {
    fn flipped(self) -> Self {
        match self {
            OrderDirection::Ascending => OrderDirection::Descending,
            OrderDirection::Descending => OrderDirection::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    field: FieldPath,
    direction: OrderDirection,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: OrderDirection) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> OrderDirection {
        self.direction
    }

    fn flipped(&self) -> Self {
        Self::new(self.field.clone(), self.direction.flipped())
    }

    /// Compares two documents by this ordering alone.
    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            OrderDirection::Ascending => ordering,
            OrderDirection::Descending => ordering.reverse(),
        }
    }
}

/// A cursor position over a query's order-by fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    values: Vec<Value>,
    inclusive: bool,
}

impl Bound {
    pub fn new(values: Vec<Value>, inclusive: bool) -> Self {
        Self { values, inclusive }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> Ordering {
        for (value, order) in self.values.iter().zip(order_by.iter()) {
            let ordering = if order.field.is_key_field() {
                match value.as_reference() {
                    Some(key) => key.cmp(document.key()),
                    None => Ordering::Equal,
                }
            } else {
                match document.field(&order.field) {
                    Some(field_value) => compare_values(value, field_value),
                    None => Ordering::Greater,
                }
            };
            let ordering = match order.direction {
                OrderDirection::Ascending => ordering,
                OrderDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub(crate) fn sorts_before_document(
        &self,
        order_by: &[OrderBy],
        document: &MutableDocument,
    ) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    pub(crate) fn sorts_after_document(
        &self,
        order_by: &[OrderBy],
        document: &MutableDocument,
    ) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        let values: Vec<String> = self.values.iter().map(canonical_id).collect();
        format!(
            "{}{}",
            if self.inclusive { "b:" } else { "a:" },
            values.join(",")
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    First,
    Last,
}

/// A user query over a collection, a collection group, or a single document.
///
/// Queries are immutable; builder methods return a new query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    pub(crate) fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    /// Query over the documents directly inside `collection_path`.
    pub fn collection(collection_path: &str) -> SyncResult<Self> {
        let path = ResourcePath::from_string(collection_path)?;
        if path.len() % 2 == 0 {
            return Err(invalid_argument(format!(
                "Queries must reference a collection (odd number of path segments): '{path}'"
            )));
        }
        Ok(Self::at_path(path))
    }

    /// Query over every collection named `collection_id`, at any depth.
    pub fn collection_group(collection_id: &str) -> SyncResult<Self> {
        if collection_id.is_empty() || collection_id.contains('/') {
            return Err(invalid_argument(format!(
                "Invalid collection group id '{collection_id}'"
            )));
        }
        let mut query = Self::at_path(ResourcePath::root());
        query.collection_group = Some(collection_id.to_string());
        Ok(query)
    }

    /// Query matching exactly one document.
    pub fn document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone())
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn where_field(
        &self,
        field: impl IntoFieldPath,
        operator: FilterOperator,
        value: impl Into<Value>,
    ) -> SyncResult<Self> {
        let filter = FieldFilter::new(field.into_field_path()?, operator, value.into())?;
        let mut next = self.clone();
        next.filters.push(filter);
        Ok(next)
    }

    pub fn order_by(&self, field: impl IntoFieldPath, direction: OrderDirection) -> SyncResult<Self> {
        if self.start_at.is_some() || self.end_at.is_some() {
            return Err(invalid_argument(
                "order_by() must be called before cursor methods",
            ));
        }
        let mut next = self.clone();
        next.explicit_order_by
            .push(OrderBy::new(field.into_field_path()?, direction));
        Ok(next)
    }

    pub fn limit_to_first(&self, limit: u32) -> Self {
        let mut next = self.clone();
        next.limit = Some(limit);
        next.limit_type = LimitType::First;
        next
    }

    pub fn limit_to_last(&self, limit: u32) -> Self {
        let mut next = self.clone();
        next.limit = Some(limit);
        next.limit_type = LimitType::Last;
        next
    }

    pub(crate) fn without_limit(&self) -> Self {
        let mut next = self.clone();
        next.limit = None;
        next.limit_type = LimitType::First;
        next
    }

    pub fn start_at_values(&self, values: Vec<Value>) -> SyncResult<Self> {
        self.with_bound(values, true, true)
    }

    pub fn start_after_values(&self, values: Vec<Value>) -> SyncResult<Self> {
        self.with_bound(values, false, true)
    }

    pub fn end_at_values(&self, values: Vec<Value>) -> SyncResult<Self> {
        self.with_bound(values, true, false)
    }

    pub fn end_before_values(&self, values: Vec<Value>) -> SyncResult<Self> {
        self.with_bound(values, false, false)
    }

    fn with_bound(&self, values: Vec<Value>, inclusive: bool, start: bool) -> SyncResult<Self> {
        if values.is_empty() {
            return Err(invalid_argument("Cursor requires at least one value"));
        }
        if values.len() > self.normalized_order_by().len() {
            return Err(invalid_argument(
                "Too many cursor values for the query's order-by clauses",
            ));
        }
        let mut next = self.clone();
        let bound = Some(Bound::new(values, inclusive));
        if start {
            next.start_at = bound;
        } else {
            next.end_at = bound;
        }
        Ok(next)
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    /// No filters, limits, bounds or orderings other than by key. Such a
    /// query is answered by a plain collection scan.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_key_field()))
    }

    /// Explicit ordering, then inequality fields, then the document key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> = result.iter().map(|o| o.field.clone()).collect();
        let last_direction = result
            .last()
            .map(|o| o.direction)
            .unwrap_or(OrderDirection::Ascending);

        let inequality_fields: BTreeSet<FieldPath> = self
            .filters
            .iter()
            .filter(|f| f.is_inequality())
            .map(|f| f.field.clone())
            .collect();
        for field in inequality_fields {
            if !field.is_key_field() && seen.insert(field.clone()) {
                result.push(OrderBy::new(field, last_direction));
            }
        }
        if !seen.contains(&FieldPath::key_path()) {
            result.push(OrderBy::new(FieldPath::key_path(), last_direction));
        }
        result
    }

    fn matches_path(&self, key: &DocumentKey) -> bool {
        match &self.collection_group {
            Some(group) => key.has_collection_id(group) && self.path.is_prefix_of(key.path()),
            None if DocumentKey::is_document_key(&self.path) => key.path() == &self.path,
            None => self.path.is_immediate_parent_of(key.path()),
        }
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        if !document.is_found_document() || !self.matches_path(document.key()) {
            return false;
        }
        let has_order_fields = self
            .explicit_order_by
            .iter()
            .all(|o| o.field.is_key_field() || document.field(&o.field).is_some());
        if !has_order_fields {
            return false;
        }
        if !self.filters.iter().all(|f| f.matches(document)) {
            return false;
        }
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Orders documents as the query's results are ordered.
    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        comparator(&self.normalized_order_by())(left, right)
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by,
                self.limit,
                self.start_at.clone(),
                self.end_at.clone(),
            ),
            LimitType::Last => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by.iter().map(OrderBy::flipped).collect(),
                self.limit,
                self.end_at.clone(),
                self.start_at.clone(),
            ),
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }

    /// Same query rooted at a concrete collection, used to expand
    /// collection-group queries.
    pub(crate) fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut next = self.clone();
        next.path = path;
        next.collection_group = None;
        next
    }
}

pub(crate) fn comparator(
    order_by: &[OrderBy],
) -> impl Fn(&MutableDocument, &MutableDocument) -> Ordering + '_ {
    move |left, right| {
        for order in order_by {
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        left.key().cmp(right.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SnapshotVersion;
    use crate::value::ObjectValue;

    fn doc(path: &str, fields: &[(&str, Value)]) -> MutableDocument {
        let mut data = ObjectValue::empty();
        for (field, value) in fields {
            data.set(&FieldPath::from_dot_separated(field).unwrap(), value.clone());
        }
        MutableDocument::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            data,
        )
    }

    #[test]
    fn collection_query_matches_direct_children_only() {
        let query = Query::collection("patients").unwrap();
        assert!(query.matches(&doc("patients/a", &[])));
        assert!(!query.matches(&doc("patients/a/visits/v", &[])));
        assert!(!query.matches(&doc("staff/a", &[])));
    }

    #[test]
    fn collection_group_matches_any_depth() {
        let query = Query::collection_group("visits").unwrap();
        assert!(query.matches(&doc("patients/a/visits/v", &[])));
        assert!(query.matches(&doc("visits/v", &[])));
        assert!(!query.matches(&doc("patients/a", &[])));
    }

    #[test]
    fn filters_respect_type_classes() {
        let query = Query::collection("patients")
            .unwrap()
            .where_field("age", FilterOperator::GreaterThan, 10)
            .unwrap();
        assert!(query.matches(&doc("patients/a", &[("age", Value::from(11.5))])));
        assert!(!query.matches(&doc("patients/b", &[("age", Value::from("old"))])));
        assert!(!query.matches(&doc("patients/c", &[])));
    }

    #[test]
    fn not_in_excludes_null_and_missing() {
        let query = Query::collection("patients")
            .unwrap()
            .where_field(
                "status",
                FilterOperator::NotIn,
                Value::from_array(vec![Value::from("closed")]),
            )
            .unwrap();
        assert!(query.matches(&doc("patients/a", &[("status", Value::from("open"))])));
        assert!(!query.matches(&doc("patients/b", &[("status", Value::null())])));
        assert!(!query.matches(&doc("patients/c", &[])));
    }

    #[test]
    fn array_filters() {
        let tags = Value::from_array(vec![Value::from("a"), Value::from("b")]);
        let contains = Query::collection("t")
            .unwrap()
            .where_field("tags", FilterOperator::ArrayContains, "b")
            .unwrap();
        let any = Query::collection("t")
            .unwrap()
            .where_field(
                "tags",
                FilterOperator::ArrayContainsAny,
                Value::from_array(vec![Value::from("z"), Value::from("a")]),
            )
            .unwrap();
        let document = doc("t/1", &[("tags", tags)]);
        assert!(contains.matches(&document));
        assert!(any.matches(&document));
    }

    #[test]
    fn in_requires_array_value() {
        let err = Query::collection("t")
            .unwrap()
            .where_field("x", FilterOperator::In, 1)
            .unwrap_err();
        assert_eq!(err.code_str(), "docsync/invalid-argument");
    }

    #[test]
    fn normalized_order_adds_inequality_and_key() {
        let query = Query::collection("t")
            .unwrap()
            .where_field("age", FilterOperator::LessThan, 5)
            .unwrap();
        let order = query.normalized_order_by();
        assert_eq!(order.len(), 2);
        assert_eq!(order[0].field().canonical_string(), "age");
        assert!(order[1].field().is_key_field());
    }

    #[test]
    fn compare_orders_by_field_then_key() {
        let query = Query::collection("t")
            .unwrap()
            .order_by("n", OrderDirection::Descending)
            .unwrap();
        let a = doc("t/a", &[("n", Value::from(1))]);
        let b = doc("t/b", &[("n", Value::from(2))]);
        assert_eq!(query.compare(&b, &a), Ordering::Less);
    }

    #[test]
    fn cursors_bound_results() {
        let query = Query::collection("t")
            .unwrap()
            .order_by("n", OrderDirection::Ascending)
            .unwrap()
            .start_after_values(vec![Value::from(1)])
            .unwrap()
            .end_at_values(vec![Value::from(3)])
            .unwrap();
        assert!(!query.matches(&doc("t/a", &[("n", Value::from(1))])));
        assert!(query.matches(&doc("t/b", &[("n", Value::from(2))])));
        assert!(query.matches(&doc("t/c", &[("n", Value::from(3))])));
        assert!(!query.matches(&doc("t/d", &[("n", Value::from(4))])));
    }

    #[test]
    fn limit_to_last_flips_target_order() {
        let query = Query::collection("t")
            .unwrap()
            .order_by("n", OrderDirection::Ascending)
            .unwrap()
            .limit_to_last(2);
        let target = query.to_target();
        assert_eq!(target.order_by()[0].direction(), OrderDirection::Descending);
        assert_ne!(
            query.canonical_id(),
            Query::collection("t")
                .unwrap()
                .order_by("n", OrderDirection::Descending)
                .unwrap()
                .limit_to_first(2)
                .canonical_id()
        );
    }

    #[test]
    fn unconstrained_queries_match_all_documents() {
        let base = Query::collection("t").unwrap();
        assert!(base.matches_all_documents());
        assert!(base
            .order_by(FieldPath::key_path(), OrderDirection::Ascending)
            .unwrap()
            .matches_all_documents());
        assert!(!base.limit_to_first(1).matches_all_documents());
        assert!(!base
            .where_field("a", FilterOperator::Equal, 1)
            .unwrap()
            .matches_all_documents());
    }
}
