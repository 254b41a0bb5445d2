use std::cmp::Ordering;
use std::fmt::Write as _;

use crate::error::{invalid_argument, FirestoreResult};
use crate::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::value::{compare_values, values_equal, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
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
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    /// Name used by the structured query wire format.
    pub fn wire_name(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "LESS_THAN",
            FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            FilterOperator::Equal => "EQUAL",
            FilterOperator::NotEqual => "NOT_EQUAL",
            FilterOperator::GreaterThan => "GREATER_THAN",
            FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            FilterOperator::ArrayContains => "ARRAY_CONTAINS",
            FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
            FilterOperator::In => "IN",
            FilterOperator::NotIn => "NOT_IN",
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
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, operator: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        let needs_array = matches!(
            operator,
            FilterOperator::In | FilterOperator::NotIn | FilterOperator::ArrayContainsAny
        );
        if needs_array && value.as_array().is_none() {
            return Err(invalid_argument(format!(
                "Invalid query. A non-empty array is required for '{}' filters.",
                operator.as_str()
            )));
        }
        if field.is_document_id() && !matches!(value.kind(), ValueKind::Reference(_) | ValueKind::Array(_)) {
            return Err(invalid_argument(
                "Invalid query. Document id filters require a document reference value.",
            ));
        }
        Ok(Self { field, operator, value })
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

    pub fn matches(&self, document: &MutableDocument) -> bool {
        match field_value(document, &self.field) {
            Some(value) => self.matches_value(&value),
            None => false,
        }
    }

    fn matches_value(&self, value: &FirestoreValue) -> bool {
        match self.operator {
            FilterOperator::Equal => values_equal(value, &self.value),
            FilterOperator::NotEqual => !value.is_null() && !values_equal(value, &self.value),
            FilterOperator::LessThan => self.matches_comparison(value, |o| o == Ordering::Less),
            FilterOperator::LessThanOrEqual => self.matches_comparison(value, |o| o != Ordering::Greater),
            FilterOperator::GreaterThan => self.matches_comparison(value, |o| o == Ordering::Greater),
            FilterOperator::GreaterThanOrEqual => self.matches_comparison(value, |o| o != Ordering::Less),
            FilterOperator::ArrayContains => value.as_array().is_some_and(|array| array.contains(&self.value)),
            FilterOperator::ArrayContainsAny => match (value.as_array(), self.value.as_array()) {
                (Some(array), Some(needles)) => needles.values().iter().any(|needle| array.contains(needle)),
                _ => false,
            },
            FilterOperator::In => self.value.as_array().is_some_and(|values| values.contains(value)),
            FilterOperator::NotIn => {
                !value.is_null() && self.value.as_array().is_some_and(|values| !values.contains(value))
            }
        }
    }

    /// Range comparisons only match values of the same type.
    fn matches_comparison(&self, value: &FirestoreValue, accept: impl Fn(Ordering) -> bool) -> bool {
        value.type_order() == self.value.type_order() && !value.is_nan() && accept(compare_values(value, &self.value))
    }

    fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.operator.as_str(),
            canonical_value(&self.value)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_document_id() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                _ => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// A query over the local cache and the backend: a collection (or collection
/// group, or single document path), filters, order and limit.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
}

impl Query {
    /// Query at `path`. An even-length path selects the single document at that path.
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
        }
    }

    pub fn collection(path: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if path.len() % 2 != 1 {
            return Err(invalid_argument(format!(
                "Invalid collection path ({path}). Collection paths have an odd number of segments"
            )));
        }
        Ok(Self::at_path(path))
    }

    pub fn collection_group(collection_id: impl Into<String>) -> FirestoreResult<Self> {
        let collection_id = collection_id.into();
        if collection_id.is_empty() || collection_id.contains('/') {
            return Err(invalid_argument("Collection group ids must be a single non-empty segment"));
        }
        let mut query = Self::at_path(ResourcePath::root());
        query.collection_group = Some(collection_id);
        Ok(query)
    }

    pub fn document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone())
    }

    pub fn with_filter(mut self, field: &str, operator: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        let field = FieldPath::from_dot_separated(field)?;
        self.filters.push(FieldFilter::new(field, operator, value)?);
        Ok(self)
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> FirestoreResult<Self> {
        let field = FieldPath::from_dot_separated(field)?;
        self.explicit_order_by.push(OrderBy::new(field, direction));
        Ok(self)
    }

    pub fn limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
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

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path) && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True when every document at the query's path is a result, in key order.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self
                .explicit_order_by
                .iter()
                .all(|order| order.field().is_document_id())
    }

    /// The same query restricted to the single collection at `path`.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Query {
        Query {
            path,
            collection_group: None,
            ..self.clone()
        }
    }

    /// Explicit orderings, then the first inequality field when not already
    /// ordered, then the document key in the direction of the last ordering.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        if order_by.is_empty() {
            if let Some(inequality) = self
                .filters
                .iter()
                .find(|filter| filter.operator().is_inequality() && !filter.field().is_document_id())
            {
                order_by.push(OrderBy::new(inequality.field().clone(), Direction::Ascending));
            }
        }
        if !order_by.iter().any(|order| order.field().is_document_id()) {
            let direction = order_by.last().map(OrderBy::direction).unwrap_or(Direction::Ascending);
            order_by.push(OrderBy::new(FieldPath::document_id(), direction));
        }
        order_by
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path(document.key())
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
    }

    /// Whether `key` lies in the collection, group or document this query selects.
    pub fn matches_path(&self, key: &DocumentKey) -> bool {
        match &self.collection_group {
            Some(group) => key.has_collection_id(group) && self.path.is_prefix_of(key.path()),
            None if DocumentKey::is_document_key(&self.path) => key.path() == &self.path,
            None => self.path.is_immediate_parent_of(key.path()),
        }
    }

    /// Documents lacking an explicitly ordered field are excluded.
    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.explicit_order_by
            .iter()
            .all(|order| order.field().is_document_id() || document.field(order.field()).is_some())
    }

    pub fn compare_documents(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        for order in self.normalized_order_by() {
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Sorts the documents and applies the limit.
    pub fn apply_order_and_limit(&self, mut documents: Vec<MutableDocument>) -> Vec<MutableDocument> {
        let order_by = self.normalized_order_by();
        documents.sort_by(|l, r| {
            order_by
                .iter()
                .map(|order| order.compare(l, r))
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
        if let Some(limit) = self.limit.map(|limit| limit as usize) {
            if documents.len() > limit {
                match self.limit_type {
                    LimitType::First => documents.truncate(limit),
                    LimitType::Last => {
                        documents.drain(0..documents.len() - limit);
                    }
                }
            }
        }
        documents
    }

    /// Server-side form of the query. Limit-to-last queries are sent with their
    /// ordering flipped and re-ordered locally.
    pub fn to_target(&self) -> Target {
        let mut order_by = self.normalized_order_by();
        if self.limit_type == LimitType::Last {
            for order in &mut order_by {
                order.direction = match order.direction {
                    Direction::Ascending => Direction::Descending,
                    Direction::Descending => Direction::Ascending,
                };
            }
        }
        Target {
            path: self.path.clone(),
            collection_group: self.collection_group.clone(),
            filters: self.filters.clone(),
            order_by,
            limit: self.limit,
        }
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.to_target().canonical_id();
        if self.has_limit() {
            let _ = write!(id, "|lt:{:?}", self.limit_type);
        }
        id
    }
}

/// The canonical server-side representation of a query.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    order_by: Vec<OrderBy>,
    limit: Option<u32>,
}

impl Target {
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

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path) && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            let _ = write!(id, "|cg:{group}");
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.field().canonical_string());
            id.push_str(match order.direction() {
                Direction::Ascending => "asc",
                Direction::Descending => "desc",
            });
        }
        if let Some(limit) = self.limit {
            let _ = write!(id, "|l:{limit}");
        }
        id
    }
}

fn field_value(document: &MutableDocument, field: &FieldPath) -> Option<FirestoreValue> {
    if field.is_document_id() {
        return Some(FirestoreValue::from_reference(document.key().path().canonical_string()));
    }
    document.field(field).cloned()
}

fn canonical_value(value: &FirestoreValue) -> String {
    match value.kind() {
        ValueKind::Null => "null".to_string(),
        ValueKind::Boolean(b) => b.to_string(),
        ValueKind::Integer(i) => i.to_string(),
        ValueKind::Double(d) => format!("{d:?}"),
        ValueKind::Timestamp(t) => format!("time({},{})", t.seconds, t.nanos),
        ValueKind::String(s) => s.clone(),
        ValueKind::Bytes(b) => b.to_base64(),
        ValueKind::Reference(r) => r.clone(),
        ValueKind::GeoPoint(g) => format!("geo({},{})", g.latitude(), g.longitude()),
        ValueKind::Array(a) => format!(
            "[{}]",
            a.values().iter().map(canonical_value).collect::<Vec<_>>().join(",")
        ),
        ValueKind::Map(m) => format!(
            "{{{}}}",
            m.fields()
                .iter()
                .map(|(k, v)| format!("{k}:{}", canonical_value(v)))
                .collect::<Vec<_>>()
                .join(",")
        ),
    }
}
