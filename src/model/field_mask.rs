use std::collections::BTreeSet;

use crate::model::FieldPath;

/// A set of field paths used to describe which fields a patch touches.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    pub fn insert(&mut self, path: FieldPath) {
        self.fields.insert(path);
    }

    /// True when some path in the mask is a prefix of `path`.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|candidate| candidate.is_prefix_of(path))
    }

    pub fn union_with<I>(&self, extra: I) -> FieldMask
    where
        I: IntoIterator<Item = FieldPath>,
    {
        let mut fields = self.fields.clone();
        fields.extend(extra);
        FieldMask { fields }
    }
}

impl FromIterator<FieldPath> for FieldMask {
    fn from_iter<T: IntoIterator<Item = FieldPath>>(iter: T) -> Self {
        Self::new(iter)
    }
}
