use crate::core::Target;
use crate::model::SnapshotVersion;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    Listen,
    /// Re-listen after an existence filter disagreed with the cached results.
    ExistenceFilterMismatch,
    /// Re-listen after a bloom filter could not settle an existence filter.
    ExistenceFilterMismatchBloom,
    LimboResolution,
}

/// A target together with the state needed to resume it.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: i32,
    pub purpose: TargetPurpose,
    pub sequence_number: i64,
    /// Version of the last consistent snapshot received for this target.
    pub snapshot_version: SnapshotVersion,
    /// Latest snapshot version at which the target's view had no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: Vec<u8>,
    /// Number of documents the client expects to match when resuming.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(target: Target, target_id: i32, purpose: TargetPurpose, sequence_number: i64) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: i64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// Resumption state after a snapshot. Clears any expected count, which is
    /// only meaningful for the first request after resuming.
    pub fn with_resume_token(mut self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self.expected_count = None;
        self
    }

    pub fn with_expected_count(mut self, expected_count: i32) -> Self {
        self.expected_count = Some(expected_count);
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }

    pub fn with_purpose(mut self, purpose: TargetPurpose) -> Self {
        self.purpose = purpose;
        self
    }
}
