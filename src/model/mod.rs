mod database_id;
mod document;
mod document_key;
mod field_mask;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod timestamp;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{DocumentKind, DocumentState, MutableDocument};
pub use document_key::DocumentKey;
pub use field_mask::FieldMask;
pub use field_path::{FieldPath, IntoFieldPath, DOCUMENT_KEY_NAME};
pub use geo_point::GeoPoint;
pub use mutation::{calculate_overlay_mutation, FieldTransform, Mutation, MutationResult, Precondition, TransformOperation};
pub use mutation_batch::{MutationBatch, MutationBatchResult, OverlayedDocument, BATCH_ID_UNKNOWN};
pub use overlay::Overlay;
pub use resource_path::ResourcePath;
pub use timestamp::{SnapshotVersion, Timestamp};

use std::collections::BTreeMap;

/// Documents keyed by path, the common currency between the caches.
pub type DocumentMap = BTreeMap<DocumentKey, MutableDocument>;
