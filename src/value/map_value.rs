use std::collections::BTreeMap;

use crate::model::{FieldMask, FieldPath};
use crate::value::{FirestoreValue, ValueKind};

/// The fields of a document or of a nested map value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            current = match current.kind() {
                ValueKind::Map(child) => child.fields.get(segment)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Writes `value` at `path`, creating (or replacing non-map) intermediate maps.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_at_segments(&mut self.fields, path.segments(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        delete_at_segments(&mut self.fields, path.segments());
    }

    /// Applies `value` to each path of `mask`; paths missing from `data` are deleted.
    pub fn set_all(&mut self, mask: &FieldMask, data: &MapValue) {
        for path in mask.iter() {
            match data.get(path) {
                Some(value) => self.set(path, value.clone()),
                None => self.delete(path),
            }
        }
    }

    /// Every leaf path of this map. Empty nested maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut paths = Vec::new();
        collect_leaf_paths(&self.fields, &mut Vec::new(), &mut paths);
        FieldMask::new(paths)
    }
}

fn set_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String], value: FirestoreValue) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let mut child = match fields.get(first).map(FirestoreValue::kind) {
        Some(ValueKind::Map(existing)) => existing.fields.clone(),
        _ => BTreeMap::new(),
    };
    set_at_segments(&mut child, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}

fn delete_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }

    if let Some(ValueKind::Map(existing)) = fields.get(first).map(FirestoreValue::kind) {
        let mut child = existing.fields.clone();
        delete_at_segments(&mut child, rest);
        fields.insert(first.clone(), FirestoreValue::from_map(child));
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &mut Vec<String>,
    out: &mut Vec<FieldPath>,
) {
    for (name, value) in fields {
        prefix.push(name.clone());
        match value.kind() {
            ValueKind::Map(child) if !child.is_empty() => collect_leaf_paths(&child.fields, prefix, out),
            _ => {
                if let Ok(path) = FieldPath::new(prefix.iter().cloned()) {
                    out.push(path);
                }
            }
        }
        prefix.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn sets_and_reads_nested_fields() {
        let mut map = MapValue::empty();
        map.set(&path("a.b.c"), FirestoreValue::from_integer(1));
        map.set(&path("a.d"), FirestoreValue::from_bool(true));
        assert_eq!(map.get(&path("a.b.c")), Some(&FirestoreValue::from_integer(1)));
        assert_eq!(map.field_mask().len(), 2);

        map.delete(&path("a.b.c"));
        assert!(map.get(&path("a.b.c")).is_none());
        assert_eq!(map.get(&path("a.d")), Some(&FirestoreValue::from_bool(true)));
    }

    #[test]
    fn set_replaces_scalar_parents() {
        let mut map = MapValue::empty();
        map.set(&path("a"), FirestoreValue::from_integer(1));
        map.set(&path("a.b"), FirestoreValue::from_integer(2));
        assert_eq!(map.get(&path("a.b")), Some(&FirestoreValue::from_integer(2)));
    }
}
