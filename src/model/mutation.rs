use crate::error::{invalid_argument, FirestoreResult};
use crate::model::{DocumentKey, FieldMask, FieldPath, MutableDocument, SnapshotVersion, Timestamp};
use crate::value::{values_equal, FirestoreValue, MapValue, ValueKind};

/// A field-level operation resolved against the document it is applied to.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field_path: FieldPath,
    operation: TransformOperation,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    pub fn server_timestamp(field_path: FieldPath) -> Self {
        Self::new(field_path, TransformOperation::ServerTimestamp)
    }

    pub fn increment(field_path: FieldPath, operand: FirestoreValue) -> FirestoreResult<Self> {
        if !operand.is_number() {
            return Err(invalid_argument("increment() requires a numeric operand"));
        }
        Ok(Self::new(field_path, TransformOperation::NumericIncrement(operand)))
    }

    pub fn array_union(field_path: FieldPath, elements: Vec<FirestoreValue>) -> Self {
        Self::new(field_path, TransformOperation::ArrayUnion(elements))
    }

    pub fn array_remove(field_path: FieldPath, elements: Vec<FirestoreValue>) -> Self {
        Self::new(field_path, TransformOperation::ArrayRemove(elements))
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field_path
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }

    /// Local estimate of the transform result, used for latency compensation.
    fn apply_to_local_view(&self, previous: Option<&FirestoreValue>, local_write_time: Timestamp) -> FirestoreValue {
        match &self.operation {
            TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(local_write_time),
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => numeric_increment(previous, operand),
        }
    }

    /// Value that must be captured before a non-idempotent transform runs so that
    /// replays of the batch start from the same base.
    pub(crate) fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match &self.operation {
            TransformOperation::NumericIncrement(_) => match previous {
                Some(value) if value.is_number() => Some(value.clone()),
                _ => Some(FirestoreValue::from_integer(0)),
            },
            _ => None,
        }
    }
}

fn array_union(existing: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = existing
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default();

    for element in additions {
        if !values.iter().any(|candidate| values_equal(candidate, element)) {
            values.push(element.clone());
        }
    }

    FirestoreValue::from_array(values)
}

fn array_remove(existing: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = existing
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default();

    let filtered: Vec<FirestoreValue> = values
        .into_iter()
        .filter(|candidate| !removals.iter().any(|needle| values_equal(needle, candidate)))
        .collect();

    FirestoreValue::from_array(filtered)
}

fn numeric_increment(existing: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = existing.filter(|value| value.is_number());
    match (base.map(FirestoreValue::kind), operand.kind()) {
        (Some(ValueKind::Integer(current)), ValueKind::Integer(delta)) => match current.checked_add(*delta) {
            Some(sum) => FirestoreValue::from_integer(sum),
            None if *delta > 0 => FirestoreValue::from_integer(i64::MAX),
            None => FirestoreValue::from_integer(i64::MIN),
        },
        (Some(ValueKind::Integer(current)), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(*current as f64 + *delta)
        }
        (Some(ValueKind::Double(current)), ValueKind::Integer(delta)) => {
            FirestoreValue::from_double(*current + *delta as f64)
        }
        (Some(ValueKind::Double(current)), ValueKind::Double(delta)) => FirestoreValue::from_double(*current + *delta),
        _ => operand.clone(),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => document.is_found_document() && document.version() == *version,
        }
    }
}

/// Result of a single write as reported by the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

/// A write to a single document.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// Replaces the whole document.
    Set {
        key: DocumentKey,
        value: MapValue,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    /// Writes only the fields named in `field_mask`; masked fields absent from
    /// `value` are deleted.
    Patch {
        key: DocumentKey,
        value: MapValue,
        field_mask: FieldMask,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    /// Asserts the precondition without changing the document.
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    /// A patch over every leaf of `value` that requires the document to exist.
    pub fn patch(key: DocumentKey, value: MapValue) -> Self {
        let field_mask = value.field_mask();
        Mutation::Patch {
            key,
            value,
            field_mask,
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify { key, precondition }
    }

    pub fn with_precondition(mut self, new_precondition: Precondition) -> Self {
        match &mut self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition = new_precondition,
        }
        self
    }

    /// Adds a transform. Ignored for deletes and verifies.
    pub fn with_transform(mut self, transform: FieldTransform) -> Self {
        match &mut self {
            Mutation::Set { field_transforms, .. } | Mutation::Patch { field_transforms, .. } => {
                field_transforms.push(transform)
            }
            Mutation::Delete { .. } | Mutation::Verify { .. } => {}
        }
        self
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set { field_transforms, .. } | Mutation::Patch { field_transforms, .. } => field_transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => &[],
        }
    }

    /// Fields a patch touches; `None` for mutations that replace the document.
    pub fn field_mask(&self) -> Option<&FieldMask> {
        match self {
            Mutation::Patch { field_mask, .. } => Some(field_mask),
            _ => None,
        }
    }

    /// Applies the mutation to the local view of `document`.
    ///
    /// `previous_mask` describes the fields already changed by earlier mutations:
    /// `Some(mask)` lists touched fields, `None` means the whole document was
    /// replaced. Returns the updated mask in the same form.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition().is_valid_for(document) {
            return previous_mask;
        }

        match self {
            Mutation::Set {
                value, field_transforms, ..
            } => {
                let transform_results = local_transform_results(field_transforms, document, local_write_time);
                let mut new_data = value.clone();
                apply_transform_results(&mut new_data, field_transforms, transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, new_data)
                    .set_has_local_mutations();
                None
            }
            Mutation::Patch {
                value,
                field_mask,
                field_transforms,
                ..
            } => {
                let transform_results = local_transform_results(field_transforms, document, local_write_time);
                let mut new_data = document.data().clone();
                new_data.set_all(field_mask, value);
                apply_transform_results(&mut new_data, field_transforms, transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, new_data)
                    .set_has_local_mutations();
                previous_mask.map(|mask| {
                    mask.union_with(
                        field_mask
                            .iter()
                            .cloned()
                            .chain(field_transforms.iter().map(|t| t.field_path().clone())),
                    )
                })
            }
            Mutation::Delete { .. } => {
                let version = document.version();
                document.convert_to_no_document(version).set_has_local_mutations();
                None
            }
            Mutation::Verify { .. } => previous_mask,
        }
    }

    /// Applies the server's acknowledgement of this mutation to the remote view of
    /// `document`. When the backend returns no transform results the transforms are
    /// evaluated against the cached document and the commit time.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationResult) {
        match self {
            Mutation::Set {
                value, field_transforms, ..
            } => {
                let transform_results = server_transform_results(field_transforms, document, result);
                let mut new_data = value.clone();
                apply_transform_results(&mut new_data, field_transforms, transform_results);
                document
                    .convert_to_found_document(result.version, new_data)
                    .set_has_committed_mutations();
            }
            Mutation::Patch {
                value,
                field_mask,
                precondition,
                field_transforms,
                ..
            } => {
                if !precondition.is_valid_for(document) {
                    // The patch committed on the server against a base we never saw.
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transform_results = server_transform_results(field_transforms, document, result);
                let mut new_data = document.data().clone();
                new_data.set_all(field_mask, value);
                apply_transform_results(&mut new_data, field_transforms, transform_results);
                document
                    .convert_to_found_document(result.version, new_data)
                    .set_has_committed_mutations();
            }
            Mutation::Delete { .. } => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            Mutation::Verify { .. } => {}
        }
    }

    /// Patch holding the pre-transform values of non-idempotent transforms, or
    /// `None` when every transform is idempotent.
    pub(crate) fn extract_transform_base_value(&self, document: &MutableDocument) -> Option<MapValue> {
        let mut base = MapValue::empty();
        for transform in self.field_transforms() {
            let existing = document.field(transform.field_path());
            if let Some(value) = transform.compute_base_value(existing) {
                base.set(transform.field_path(), value);
            }
        }
        if base.is_empty() {
            None
        } else {
            Some(base)
        }
    }
}

/// Builds the mutation that turns the remote document into `document`, given the
/// mask produced by [`Mutation::apply_to_local_view`].
pub fn calculate_overlay_mutation(document: &MutableDocument, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !document.has_local_mutations() || mask.is_some_and(FieldMask::is_empty) {
        return None;
    }

    let Some(mask) = mask else {
        if document.is_no_document() {
            return Some(Mutation::delete(document.key().clone()));
        }
        return Some(Mutation::set(document.key().clone(), document.data().clone()));
    };

    let mut patch_value = MapValue::empty();
    let mut patch_mask = FieldMask::empty();
    for path in mask.iter() {
        if patch_mask.covers(path) {
            continue;
        }
        let mut path = path.clone();
        let mut value = document.field(&path);
        // A deleted nested field is expressed through its parent.
        if value.is_none() && path.len() > 1 {
            if let Ok(parent) = FieldPath::new(path.segments()[..path.len() - 1].iter().cloned()) {
                path = parent;
                value = document.field(&path);
            }
        }
        match value {
            Some(value) => patch_value.set(&path, value.clone()),
            None => patch_value.delete(&path),
        }
        patch_mask.insert(path);
    }

    Some(Mutation::Patch {
        key: document.key().clone(),
        value: patch_value,
        field_mask: patch_mask,
        precondition: Precondition::None,
        field_transforms: Vec::new(),
    })
}

fn local_transform_results(
    transforms: &[FieldTransform],
    document: &MutableDocument,
    local_write_time: Timestamp,
) -> Vec<FirestoreValue> {
    transforms
        .iter()
        .map(|transform| transform.apply_to_local_view(document.field(transform.field_path()), local_write_time))
        .collect()
}

fn server_transform_results(
    transforms: &[FieldTransform],
    document: &MutableDocument,
    result: &MutationResult,
) -> Vec<FirestoreValue> {
    if result.transform_results.len() == transforms.len() {
        return result.transform_results.clone();
    }
    local_transform_results(transforms, document, result.version.timestamp())
}

fn apply_transform_results(data: &mut MapValue, transforms: &[FieldTransform], results: Vec<FirestoreValue>) {
    for (transform, value) in transforms.iter().zip(results) {
        data.set(transform.field_path(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
        let mut fields = BTreeMap::new();
        for (name, value) in entries {
            fields.insert(name.to_string(), value.clone());
        }
        MapValue::new(fields)
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn set_replaces_document_and_marks_local() {
        let mut doc = MutableDocument::new_found_document(
            key("docs/a"),
            version(1),
            map(&[("old", FirestoreValue::from_bool(true))]),
        );
        let mutation = Mutation::set(key("docs/a"), map(&[("x", FirestoreValue::from_integer(1))]));
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert!(mask.is_none());
        assert!(doc.has_local_mutations());
        assert_eq!(doc.data(), &map(&[("x", FirestoreValue::from_integer(1))]));
    }

    #[test]
    fn patch_requires_existing_document() {
        let mut doc = MutableDocument::new_no_document(key("docs/a"), version(1));
        let mutation = Mutation::patch(key("docs/a"), map(&[("x", FirestoreValue::from_integer(1))]));
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(mask, Some(FieldMask::empty()));
        assert!(doc.is_no_document());
    }

    #[test]
    fn increment_applies_locally_and_falls_back_remotely() {
        let mut doc = MutableDocument::new_found_document(
            key("docs/a"),
            version(1),
            map(&[("count", FirestoreValue::from_integer(5))]),
        );
        let mutation = Mutation::Patch {
            key: key("docs/a"),
            value: MapValue::empty(),
            field_mask: FieldMask::empty(),
            precondition: Precondition::Exists(true),
            field_transforms: vec![FieldTransform::increment(field("count"), FirestoreValue::from_integer(1)).unwrap()],
        };

        let mut local = doc.clone();
        mutation.apply_to_local_view(&mut local, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(local.field(&field("count")), Some(&FirestoreValue::from_integer(6)));

        mutation.apply_to_remote_document(&mut doc, &MutationResult::new(version(2), Vec::new()));
        assert_eq!(doc.field(&field("count")), Some(&FirestoreValue::from_integer(6)));
        assert_eq!(doc.version(), version(2));
        assert!(doc.has_committed_mutations());
    }

    #[test]
    fn array_transforms_deduplicate() {
        let mut doc = MutableDocument::new_found_document(
            key("docs/a"),
            version(1),
            map(&[(
                "tags",
                FirestoreValue::from_array(vec![FirestoreValue::from_string("a"), FirestoreValue::from_string("b")]),
            )]),
        );
        let mutation = Mutation::patch(key("docs/a"), MapValue::empty())
            .with_transform(FieldTransform::array_union(
                field("tags"),
                vec![FirestoreValue::from_string("b"), FirestoreValue::from_string("c")],
            ))
            .with_transform(FieldTransform::array_remove(field("tags"), vec![FirestoreValue::from_string("a")]));
        mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        // Transforms see the pre-mutation document, so the remove wins over the union.
        assert_eq!(
            doc.field(&field("tags")),
            Some(&FirestoreValue::from_array(vec![FirestoreValue::from_string("b")]))
        );
    }

    #[test]
    fn overlay_for_nested_delete_uses_parent() {
        let mut doc = MutableDocument::new_found_document(
            key("docs/a"),
            version(1),
            map(&[(
                "a",
                FirestoreValue::from_map(BTreeMap::from([
                    ("b".to_string(), FirestoreValue::from_integer(1)),
                    ("c".to_string(), FirestoreValue::from_integer(2)),
                ])),
            )]),
        );
        let mutation = Mutation::Patch {
            key: key("docs/a"),
            value: MapValue::empty(),
            field_mask: FieldMask::new([field("a.b")]),
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        };
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        let overlay = calculate_overlay_mutation(&doc, mask.as_ref()).unwrap();
        match overlay {
            Mutation::Patch { value, field_mask, .. } => {
                assert!(field_mask.covers(&field("a.b")));
                assert_eq!(value.get(&field("a.c")), Some(&FirestoreValue::from_integer(2)));
            }
            other => panic!("unexpected overlay {other:?}"),
        }
    }

    #[test]
    fn delete_overlay_for_removed_document() {
        let mut doc = MutableDocument::new_found_document(key("docs/a"), version(1), MapValue::empty());
        let mask = Mutation::delete(key("docs/a")).apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(
            calculate_overlay_mutation(&doc, mask.as_ref()),
            Some(Mutation::delete(key("docs/a")))
        );
    }
}
