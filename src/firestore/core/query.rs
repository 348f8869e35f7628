use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    Document, DocumentComparator, DocumentKey, FieldPath, IntoFieldPath, ResourcePath,
};
use crate::firestore::value::{FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    In,
    ArrayContainsAny,
    NotIn,
}

impl FilterOperator {
    /// Wire name of the operator.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "LESS_THAN",
            FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            FilterOperator::Equal => "EQUAL",
            FilterOperator::NotEqual => "NOT_EQUAL",
            FilterOperator::GreaterThan => "GREATER_THAN",
            FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            FilterOperator::ArrayContains => "ARRAY_CONTAINS",
            FilterOperator::In => "IN",
            FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
            FilterOperator::NotIn => "NOT_IN",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        Some(match value {
            "LESS_THAN" => FilterOperator::LessThan,
            "LESS_THAN_OR_EQUAL" => FilterOperator::LessThanOrEqual,
            "EQUAL" => FilterOperator::Equal,
            "NOT_EQUAL" => FilterOperator::NotEqual,
            "GREATER_THAN" => FilterOperator::GreaterThan,
            "GREATER_THAN_OR_EQUAL" => FilterOperator::GreaterThanOrEqual,
            "ARRAY_CONTAINS" => FilterOperator::ArrayContains,
            "IN" => FilterOperator::In,
            "ARRAY_CONTAINS_ANY" => FilterOperator::ArrayContainsAny,
            "NOT_IN" => FilterOperator::NotIn,
            _ => return None,
        })
    }

    fn symbol(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::In => "in",
            FilterOperator::ArrayContainsAny => "array-contains-any",
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

    fn expects_array(&self) -> bool {
        matches!(
            self,
            FilterOperator::In | FilterOperator::NotIn | FilterOperator::ArrayContainsAny
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(
        field: FieldPath,
        operator: FilterOperator,
        value: FirestoreValue,
    ) -> FirestoreResult<Self> {
        if operator.expects_array() && value.as_array().is_none() {
            return Err(invalid_argument(format!(
                "A non-empty array is required for '{}' filters.",
                operator.symbol()
            )));
        }
        if field.is_document_id() {
            let references_only = match value.kind() {
                ValueKind::Reference(_) => true,
                ValueKind::Array(values) => values
                    .values()
                    .iter()
                    .all(|value| matches!(value.kind(), ValueKind::Reference(_))),
                _ => false,
            };
            if !references_only {
                return Err(invalid_argument(
                    "Filters on the document id must use document references.",
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

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn matches(&self, doc: &Document) -> bool {
        let key_value;
        let other = if self.field.is_document_id() {
            key_value = FirestoreValue::from_reference(doc.key().path().canonical_string());
            Some(&key_value)
        } else {
            doc.field(&self.field)
        };

        match self.operator {
            FilterOperator::ArrayContains => other
                .and_then(FirestoreValue::as_array)
                .map(|array| array.contains(&self.value))
                .unwrap_or(false),
            FilterOperator::ArrayContainsAny => {
                let (Some(array), Some(needles)) =
                    (other.and_then(FirestoreValue::as_array), self.value.as_array())
                else {
                    return false;
                };
                needles.values().iter().any(|needle| array.contains(needle))
            }
            FilterOperator::In => match (other, self.value.as_array()) {
                (Some(other), Some(values)) => values.contains(other),
                _ => false,
            },
            FilterOperator::NotIn => match (other, self.value.as_array()) {
                (Some(other), Some(values)) => !other.is_null() && !values.contains(other),
                _ => false,
            },
            FilterOperator::NotEqual => match other {
                Some(other) => !other.is_null() && other.compare(&self.value) != Ordering::Equal,
                None => false,
            },
            _ => match other {
                Some(other) if other.type_order() == self.value.type_order() => {
                    self.matches_comparison(other.compare(&self.value))
                }
                _ => false,
            },
        }
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self.operator {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::Equal => ordering == Ordering::Equal,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }

    fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.operator.symbol(),
            self.value.canonical_id()
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

impl OrderDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderDirection::Ascending => "ASCENDING",
            OrderDirection::Descending => "DESCENDING",
        }
    }

    fn flipped(self) -> Self {
        match self {
            OrderDirection::Ascending => OrderDirection::Descending,
            OrderDirection::Descending => OrderDirection::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
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

    fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let ordering = if self.field.is_document_id() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => l.compare(r),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            OrderDirection::Ascending => ordering,
            OrderDirection::Descending => ordering.reverse(),
        }
    }

    fn canonical_id(&self) -> String {
        let dir = match self.direction {
            OrderDirection::Ascending => "asc",
            OrderDirection::Descending => "desc",
        };
        format!("{}{dir}", self.field.canonical_string())
    }
}

/// Cursor position in a query's ordering.
///
/// `before` says whether the position sits just before the documents equal
/// to it; a start bound with `before` is inclusive, an end bound with
/// `before` is exclusive.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    before: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, before: bool) -> Self {
        Self { position, before }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn before(&self) -> bool {
        self.before
    }

    /// Whether the bound falls before `doc` in the given ordering.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let mut comparison = Ordering::Equal;
        for (component, order) in self.position.iter().zip(order_by) {
            comparison = if order.field.is_document_id() {
                match component.kind() {
                    ValueKind::Reference(reference) => DocumentKey::from_string(reference)
                        .map(|key| key.cmp(doc.key()))
                        .unwrap_or(Ordering::Equal),
                    _ => Ordering::Equal,
                }
            } else {
                match doc.field(&order.field) {
                    Some(value) => component.compare(value),
                    None => Ordering::Greater,
                }
            };
            if order.direction == OrderDirection::Descending {
                comparison = comparison.reverse();
            }
            if comparison != Ordering::Equal {
                break;
            }
        }
        if self.before {
            comparison != Ordering::Greater
        } else {
            comparison == Ordering::Less
        }
    }

    fn canonical_id(&self) -> String {
        let values: Vec<String> = self.position.iter().map(FirestoreValue::canonical_id).collect();
        format!("{}{}", if self.before { "b:" } else { "a:" }, values.join(","))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// The server-facing shape of a query. Limit-to-last queries are expressed
/// with their ordering flipped.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub order_by: Vec<OrderBy>,
    pub filters: Vec<FieldFilter>,
    pub limit: Option<u32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
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
            id.push_str(&order.canonical_id());
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

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Target({})", self.canonical_id())
    }
}

/// A query over a collection, a collection group, or a single document.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    explicit_order_by: Vec<OrderBy>,
    filters: Vec<FieldFilter>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    /// Parses a slash separated collection or document path.
    pub fn at_path(path: &str) -> FirestoreResult<Self> {
        Ok(Self::new(ResourcePath::from_string(path)?))
    }

    pub fn collection_group(group: impl Into<String>) -> Self {
        let mut query = Self::new(ResourcePath::root());
        query.collection_group = Some(group.into());
        query
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

    pub fn start_bound(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_bound(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn has_limit_to_first(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::First
    }

    pub fn has_limit_to_last(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::Last
    }

    pub fn filter(
        &self,
        field: impl IntoFieldPath,
        operator: FilterOperator,
        value: FirestoreValue,
    ) -> FirestoreResult<Self> {
        let filter = FieldFilter::new(field.into_field_path()?, operator, value)?;
        if self.is_document_query() {
            return Err(invalid_argument("Filters cannot be added to a document query."));
        }
        if filter.operator.is_inequality() {
            if let Some(existing) = self.inequality_field() {
                if existing != &filter.field {
                    return Err(invalid_argument(format!(
                        "Inequality filters must all be on the same field, \
                         found '{existing}' and '{}'.",
                        filter.field
                    )));
                }
            }
        }
        let mut query = self.clone();
        query.filters.push(filter);
        Ok(query)
    }

    pub fn order_by(
        &self,
        field: impl IntoFieldPath,
        direction: OrderDirection,
    ) -> FirestoreResult<Self> {
        if self.start_at.is_some() || self.end_at.is_some() {
            return Err(invalid_argument(
                "order_by() must be called before any cursor is set.",
            ));
        }
        let mut query = self.clone();
        query
            .explicit_order_by
            .push(OrderBy::new(field.into_field_path()?, direction));
        Ok(query)
    }

    pub fn limit_to_first(&self, limit: u32) -> FirestoreResult<Self> {
        self.with_limit(limit, LimitType::First)
    }

    pub fn limit_to_last(&self, limit: u32) -> FirestoreResult<Self> {
        self.with_limit(limit, LimitType::Last)
    }

    fn with_limit(&self, limit: u32, limit_type: LimitType) -> FirestoreResult<Self> {
        if limit == 0 {
            return Err(invalid_argument("Query limit must be greater than zero."));
        }
        let mut query = self.clone();
        query.limit = Some(limit);
        query.limit_type = limit_type;
        Ok(query)
    }

    pub fn start_at(&self, values: Vec<FirestoreValue>) -> Self {
        self.with_start(Bound::new(values, true))
    }

    pub fn start_after(&self, values: Vec<FirestoreValue>) -> Self {
        self.with_start(Bound::new(values, false))
    }

    pub fn end_at(&self, values: Vec<FirestoreValue>) -> Self {
        self.with_end(Bound::new(values, false))
    }

    pub fn end_before(&self, values: Vec<FirestoreValue>) -> Self {
        self.with_end(Bound::new(values, true))
    }

    fn with_start(&self, bound: Bound) -> Self {
        let mut query = self.clone();
        query.start_at = Some(bound);
        query
    }

    fn with_end(&self, bound: Bound) -> Self {
        let mut query = self.clone();
        query.end_at = Some(bound);
        query
    }

    /// Field of the first inequality filter, if any.
    pub fn inequality_field(&self) -> Option<&FieldPath> {
        self.filters
            .iter()
            .find(|filter| filter.operator.is_inequality())
            .map(|filter| &filter.field)
    }

    /// Effective ordering: the explicit ordering, the inequality field when
    /// nothing is explicit, and always the document key last.
    pub fn order_by_constraints(&self) -> Vec<OrderBy> {
        let mut order = self.explicit_order_by.clone();
        if order.is_empty() {
            if let Some(field) = self.inequality_field() {
                if !field.is_document_id() {
                    order.push(OrderBy::new(field.clone(), OrderDirection::Ascending));
                }
            }
        }
        let ends_with_key = order
            .last()
            .map(|order| order.field.is_document_id())
            .unwrap_or(false);
        if !ends_with_key {
            let direction = order
                .last()
                .map(|order| order.direction)
                .unwrap_or(OrderDirection::Ascending);
            order.push(OrderBy::new(FieldPath::document_id(), direction));
        }
        order
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True when the query returns every document under its path, so a
    /// full scan is already the cheapest execution.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_document_id()))
    }

    /// The same query restricted to one collection, used to execute
    /// collection group queries one parent at a time.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.order_by_constraints();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                order_by,
                filters: self.filters.clone(),
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                order_by: order_by
                    .into_iter()
                    .map(|order| OrderBy::new(order.field, order.direction.flipped()))
                    .collect(),
                filters: self.filters.clone(),
                limit: self.limit,
                start_at: self
                    .end_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position.clone(), !bound.before)),
                end_at: self
                    .start_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position.clone(), !bound.before)),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.matches_path_and_collection_group(doc)
            && self.matches_order_by(doc)
            && self.filters.iter().all(|filter| filter.matches(doc))
            && self.matches_bounds(doc)
    }

    fn matches_path_and_collection_group(&self, doc: &Document) -> bool {
        let doc_path = doc.key().path();
        if let Some(group) = &self.collection_group {
            doc.key().collection_group() == group && self.path.is_prefix_of(doc_path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == doc_path
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    fn matches_order_by(&self, doc: &Document) -> bool {
        self.explicit_order_by
            .iter()
            .all(|order| order.field.is_document_id() || doc.field(&order.field).is_some())
    }

    fn matches_bounds(&self, doc: &Document) -> bool {
        let order_by = self.order_by_constraints();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if end.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        true
    }

    /// Orders documents the way this query returns them.
    pub fn comparator(&self) -> DocumentComparator {
        let order_by = self.order_by_constraints();
        Arc::new(move |left: &Document, right: &Document| {
            order_by
                .iter()
                .map(|order| order.compare(left, right))
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        })
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Query({})", self.canonical_id())
    }
}
