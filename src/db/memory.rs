use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::models::{
    CodeIntelligenceRange, Location, LocationPage, Moniker, PackageInformation, Position, QualifiedMoniker, Range,
    RepositoryId, UploadId, UploadRecord,
};
use crate::db::{BundleStore, DbError, LocationTable, ReferencingUploads, UploadDirectory};
use crate::translate::CommitDiffer;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitVisibility {
    pub repository_id: RepositoryId,
    pub commit: String,
    pub upload_ids: Vec<UploadId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub upload_id: UploadId,
    #[serde(flatten)]
    pub package: PackageInformation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub upload_id: UploadId,
    pub path: String,
    pub range: Range,
    pub symbol: String,
    pub table: LocationTable,
}

/// Unified diff of one file between two commits. A missing patch means the
/// file does not exist at `to_commit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub repository_id: RepositoryId,
    pub from_commit: String,
    pub to_commit: String,
    pub path: String,
    pub patch: Option<String>,
}

/// Serializable picture of an index corpus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    #[serde(default)]
    pub uploads: Vec<UploadRecord>,
    #[serde(default)]
    pub visibility: Vec<CommitVisibility>,
    #[serde(default)]
    pub packages: Vec<PackageEntry>,
    #[serde(default)]
    pub references: Vec<PackageEntry>,
    #[serde(default)]
    pub occurrences: Vec<Occurrence>,
    #[serde(default)]
    pub diffs: Vec<FileDiff>,
}

/// Bundle store, upload directory and commit differ over an [`IndexSnapshot`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryIndex {
    snapshot: IndexSnapshot,
    uploads_by_id: HashMap<UploadId, UploadRecord>,
}

impl InMemoryIndex {
    pub fn new(snapshot: IndexSnapshot) -> Self {
        let uploads_by_id = snapshot
            .uploads
            .iter()
            .map(|upload| (upload.id, upload.clone()))
            .collect();
        Self {
            snapshot,
            uploads_by_id,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, DbError> {
        let snapshot: IndexSnapshot =
            serde_json::from_str(raw).map_err(|e| DbError::Serialization(e.to_string()))?;
        Ok(Self::new(snapshot))
    }

    pub fn load(path: &Path) -> Result<Self, DbError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DbError::Internal(format!("failed to read snapshot {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn snapshot(&self) -> &IndexSnapshot {
        &self.snapshot
    }

    fn is_visible_at(&self, upload_id: UploadId, repository_id: RepositoryId, commit: &str) -> bool {
        self.snapshot.visibility.iter().any(|entry| {
            entry.repository_id == repository_id
                && entry.commit == commit
                && entry.upload_ids.contains(&upload_id)
        })
    }
}

fn page<T>(items: Vec<T>, limit: usize, offset: usize) -> Vec<T> {
    items.into_iter().skip(offset).take(limit).collect()
}

#[async_trait]
impl BundleStore for InMemoryIndex {
    async fn extract_locations_from_position(
        &self,
        table: LocationTable,
        upload_id: UploadId,
        path: &str,
        position: Position,
        limit: usize,
        offset: usize,
    ) -> Result<LocationPage, DbError> {
        let in_document = || {
            self.snapshot
                .occurrences
                .iter()
                .filter(move |occ| occ.upload_id == upload_id && occ.path == path)
        };

        let symbols: BTreeSet<&str> = in_document()
            .filter(|occ| occ.range.contains(position))
            .map(|occ| occ.symbol.as_str())
            .collect();

        let locations: BTreeSet<Location> = in_document()
            .filter(|occ| occ.table == table && symbols.contains(occ.symbol.as_str()))
            .map(|occ| Location {
                upload_id,
                path: occ.path.clone(),
                range: occ.range,
            })
            .collect();

        let total = locations.len();
        Ok(LocationPage {
            locations: page(locations.into_iter().collect(), limit, offset),
            total,
            symbol_names: symbols.into_iter().map(str::to_string).collect(),
        })
    }

    async fn bulk_moniker_lookup(
        &self,
        table: LocationTable,
        upload_ids: &[UploadId],
        skip_paths: &BTreeMap<UploadId, String>,
        monikers: &[Moniker],
        limit: usize,
        offset: usize,
    ) -> Result<LocationPage, DbError> {
        let identifiers: HashSet<&str> = monikers.iter().map(|m| m.identifier.as_str()).collect();
        let uploads: HashSet<UploadId> = upload_ids.iter().copied().collect();

        let locations: BTreeSet<Location> = self
            .snapshot
            .occurrences
            .iter()
            .filter(|occ| occ.table == table)
            .filter(|occ| uploads.contains(&occ.upload_id))
            .filter(|occ| identifiers.contains(occ.symbol.as_str()))
            .filter(|occ| skip_paths.get(&occ.upload_id) != Some(&occ.path))
            .map(|occ| Location {
                upload_id: occ.upload_id,
                path: occ.path.clone(),
                range: occ.range,
            })
            .collect();

        let total = locations.len();
        Ok(LocationPage {
            locations: page(locations.into_iter().collect(), limit, offset),
            total,
            symbol_names: Vec::new(),
        })
    }

    async fn get_stencil(&self, upload_id: UploadId, path: &str) -> Result<Vec<Range>, DbError> {
        let ranges: BTreeSet<Range> = self
            .snapshot
            .occurrences
            .iter()
            .filter(|occ| occ.upload_id == upload_id && occ.path == path)
            .map(|occ| occ.range)
            .collect();
        Ok(ranges.into_iter().collect())
    }

    async fn get_ranges(
        &self,
        upload_id: UploadId,
        path: &str,
        start_line: u32,
        end_line: u32,
    ) -> Result<Vec<CodeIntelligenceRange>, DbError> {
        let mut symbols_by_range: BTreeMap<Range, BTreeSet<&str>> = BTreeMap::new();
        for occ in &self.snapshot.occurrences {
            let line = occ.range.start.line;
            if occ.upload_id == upload_id
                && occ.path == path
                && line >= start_line
                && line < end_line
            {
                symbols_by_range
                    .entry(occ.range)
                    .or_default()
                    .insert(occ.symbol.as_str());
            }
        }

        let locations_of = |symbols: &BTreeSet<&str>, table: LocationTable| -> Vec<Location> {
            self.snapshot
                .occurrences
                .iter()
                .filter(|occ| occ.upload_id == upload_id && occ.table == table)
                .filter(|occ| symbols.contains(occ.symbol.as_str()))
                .map(|occ| Location {
                    upload_id,
                    path: occ.path.clone(),
                    range: occ.range,
                })
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };

        Ok(symbols_by_range
            .iter()
            .map(|(range, symbols)| CodeIntelligenceRange {
                range: *range,
                definitions: locations_of(symbols, LocationTable::Definitions),
                references: locations_of(symbols, LocationTable::References),
                implementations: locations_of(symbols, LocationTable::Implementations),
            })
            .collect())
    }
}

#[async_trait]
impl UploadDirectory for InMemoryIndex {
    async fn find_uploads_covering_commit(
        &self,
        repository_id: RepositoryId,
        commit: &str,
        path: &str,
    ) -> Result<Vec<UploadRecord>, DbError> {
        let mut seen = HashSet::new();
        let uploads = self
            .snapshot
            .visibility
            .iter()
            .filter(|entry| entry.repository_id == repository_id && entry.commit == commit)
            .flat_map(|entry| entry.upload_ids.iter())
            .filter(|id| seen.insert(**id))
            .filter_map(|id| self.uploads_by_id.get(id))
            .filter(|upload| upload.path_within_root(path).is_some())
            .cloned()
            .collect();
        Ok(uploads)
    }

    async fn find_uploads_declaring_package(
        &self,
        package: &PackageInformation,
    ) -> Result<Vec<UploadRecord>, DbError> {
        let ids: BTreeSet<UploadId> = self
            .snapshot
            .packages
            .iter()
            .filter(|entry| &entry.package == package)
            .map(|entry| entry.upload_id)
            .collect();
        Ok(ids
            .iter()
            .filter_map(|id| self.uploads_by_id.get(id))
            .cloned()
            .collect())
    }

    async fn find_uploads_referencing_package(
        &self,
        monikers: &[QualifiedMoniker],
        ignore_ids: &[UploadId],
        repository_id: RepositoryId,
        commit: &str,
        limit: usize,
        offset: usize,
    ) -> Result<ReferencingUploads, DbError> {
        let packages: HashSet<&PackageInformation> = monikers.iter().map(|m| &m.package).collect();
        let ignored: HashSet<UploadId> = ignore_ids.iter().copied().collect();

        let ids: BTreeSet<UploadId> = self
            .snapshot
            .references
            .iter()
            .filter(|entry| packages.contains(&entry.package))
            .map(|entry| entry.upload_id)
            .filter(|id| !ignored.contains(id))
            .filter(|id| match self.uploads_by_id.get(id) {
                Some(upload) if upload.repository_id == repository_id => {
                    self.is_visible_at(*id, repository_id, commit)
                }
                Some(_) => true,
                None => false,
            })
            .collect();

        let total = ids.len();
        Ok(ReferencingUploads {
            ids: page(ids.into_iter().collect(), limit, offset),
            has_more: offset.saturating_add(limit) < total,
        })
    }

    async fn get_uploads_by_ids(&self, ids: &[UploadId]) -> Result<Vec<UploadRecord>, DbError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.uploads_by_id.get(id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CommitDiffer for InMemoryIndex {
    async fn diff(
        &self,
        repository_id: RepositoryId,
        from_commit: &str,
        to_commit: &str,
        path: &str,
    ) -> Result<Option<String>, DbError> {
        let entry = self.snapshot.diffs.iter().find(|diff| {
            diff.repository_id == repository_id
                && diff.from_commit == from_commit
                && diff.to_commit == to_commit
                && diff.path == path
        });
        Ok(match entry {
            Some(diff) => diff.patch.clone(),
            None => Some(String::new()),
        })
    }
}
