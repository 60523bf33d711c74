pub mod memory;
pub mod models;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::models::{
    CodeIntelligenceRange, LocationPage, Moniker, PackageInformation, Position, QualifiedMoniker, Range, RepositoryId,
    UploadId, UploadRecord,
};

/// Occurrence table a lookup reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationTable {
    Definitions,
    References,
    Implementations,
    Prototypes,
}

impl LocationTable {
    pub fn as_str(self) -> &'static str {
        match self {
            LocationTable::Definitions => "definitions",
            LocationTable::References => "references",
            LocationTable::Implementations => "implementations",
            LocationTable::Prototypes => "prototypes",
        }
    }
}

/// Uploads referencing a set of monikers, one bounded batch at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferencingUploads {
    pub ids: Vec<UploadId>,
    pub has_more: bool,
}

/// Per-bundle lookups against the occurrence data of individual uploads.
#[async_trait]
pub trait BundleStore: Send + Sync {
    /// Locations in `path` of the symbols found at `position`, plus the names
    /// of those symbols. `total` counts every matching location regardless of
    /// `limit` and `offset`.
    #[allow(clippy::too_many_arguments)]
    async fn extract_locations_from_position(
        &self,
        table: LocationTable,
        upload_id: UploadId,
        path: &str,
        position: Position,
        limit: usize,
        offset: usize,
    ) -> Result<LocationPage, DbError>;

    /// Locations of `monikers` across `upload_ids`, excluding the skipped path
    /// of each upload. Results are ordered by (upload id, path, range) so the
    /// same arguments always page through the same sequence.
    #[allow(clippy::too_many_arguments)]
    async fn bulk_moniker_lookup(
        &self,
        table: LocationTable,
        upload_ids: &[UploadId],
        skip_paths: &BTreeMap<UploadId, String>,
        monikers: &[Moniker],
        limit: usize,
        offset: usize,
    ) -> Result<LocationPage, DbError>;

    /// Distinct occurrence ranges of `path`, sorted.
    async fn get_stencil(&self, upload_id: UploadId, path: &str) -> Result<Vec<Range>, DbError>;

    /// Occurrence ranges of `path` starting on lines `start_line..end_line`,
    /// each with the locations of its symbols inside the same upload.
    async fn get_ranges(
        &self,
        upload_id: UploadId,
        path: &str,
        start_line: u32,
        end_line: u32,
    ) -> Result<Vec<CodeIntelligenceRange>, DbError>;
}

/// Translates coordinates of one file between two commits of a repository.
#[async_trait]
pub trait DiffTranslator: Send + Sync {
    async fn translate_position(
        &self,
        repository_id: RepositoryId,
        from_commit: &str,
        to_commit: &str,
        path: &str,
        position: Position,
    ) -> Result<Option<Position>, DbError>;

    async fn translate_range(
        &self,
        repository_id: RepositoryId,
        from_commit: &str,
        to_commit: &str,
        path: &str,
        range: Range,
    ) -> Result<Option<Range>, DbError>;
}

/// Upload metadata: which uploads cover a commit, declare a package or
/// reference one.
#[async_trait]
pub trait UploadDirectory: Send + Sync {
    async fn find_uploads_covering_commit(
        &self,
        repository_id: RepositoryId,
        commit: &str,
        path: &str,
    ) -> Result<Vec<UploadRecord>, DbError>;

    async fn find_uploads_declaring_package(
        &self,
        package: &PackageInformation,
    ) -> Result<Vec<UploadRecord>, DbError>;

    /// Uploads referencing any of `monikers`, skipping `ignore_ids` and
    /// uploads of `repository_id` other than those visible from `commit`.
    #[allow(clippy::too_many_arguments)]
    async fn find_uploads_referencing_package(
        &self,
        monikers: &[QualifiedMoniker],
        ignore_ids: &[UploadId],
        repository_id: RepositoryId,
        commit: &str,
        limit: usize,
        offset: usize,
    ) -> Result<ReferencingUploads, DbError>;

    /// Upload records for `ids`; unknown ids are omitted.
    async fn get_uploads_by_ids(&self, ids: &[UploadId]) -> Result<Vec<UploadRecord>, DbError>;
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Diff error: {0}")]
    Diff(String),
    #[error("Internal error: {0}")]
    Internal(String),
}
