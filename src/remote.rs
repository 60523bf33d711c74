use std::collections::BTreeSet;
use std::time::Instant;

use tracing::debug;

use crate::cursor::SearchCursor;
use crate::db::models::{Location, Moniker, PackageInformation, QualifiedMoniker, RequestArgs, UploadId};
use crate::db::{BundleStore, LocationTable, UploadDirectory};
use crate::error::{CodeNavError, Result, SearchStage};
use crate::hydrate::UploadCache;

/// Which uploads the remote phase searches by moniker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadSearch {
    /// Only uploads declaring the monikers' packages.
    Declaring,
    /// Declaring uploads first, then every upload referencing the packages,
    /// one bounded batch at a time.
    DeclaringAndReferencing,
}

/// Discovers the uploads the remote phase looks at.
pub struct CrossIndexUploadFinder<'a> {
    directory: &'a dyn UploadDirectory,
    cache: &'a UploadCache,
    search: UploadSearch,
    batch_size: usize,
}

impl<'a> CrossIndexUploadFinder<'a> {
    pub fn new(
        directory: &'a dyn UploadDirectory,
        cache: &'a UploadCache,
        search: UploadSearch,
        batch_size: usize,
    ) -> Self {
        Self {
            directory,
            cache,
            search,
            batch_size: batch_size.max(1),
        }
    }

    /// Loads the next upload batch into the cursor when the current one is
    /// used up. The returned cursor has an empty batch only once every batch
    /// has been produced.
    pub async fn next_batch(
        &self,
        mut cursor: SearchCursor,
        args: &RequestArgs,
        monikers: &[QualifiedMoniker],
        packages: &[PackageInformation],
    ) -> Result<SearchCursor> {
        while cursor.upload_ids().is_empty() && !cursor.remote_uploads_exhausted() {
            let started = Instant::now();
            let mut batch = BTreeSet::new();

            let known = cursor.definition_upload_ids().map(<[UploadId]>::to_vec);
            let declaring = match known {
                Some(ids) => ids,
                None => {
                    let ids = self.declaring_uploads(packages).await?;
                    batch.extend(ids.iter().copied());
                    cursor = cursor.with_definition_upload_ids(ids.clone());
                    ids
                }
            };

            cursor = match self.search {
                UploadSearch::Declaring => cursor.bump_remote_upload_offset(0, false),
                UploadSearch::DeclaringAndReferencing => {
                    let referencing = self
                        .directory
                        .find_uploads_referencing_package(
                            monikers,
                            &declaring,
                            args.repository_id,
                            &args.commit,
                            self.batch_size,
                            cursor.remote_upload_offset(),
                        )
                        .await
                        .map_err(|err| {
                            CodeNavError::upstream(SearchStage::ReferencingUploads, None, err)
                        })?;
                    let fetched = referencing.ids.len();
                    batch.extend(referencing.ids);
                    cursor.bump_remote_upload_offset(fetched, referencing.has_more && fetched > 0)
                }
            };

            let ids: Vec<UploadId> = batch.into_iter().collect();
            let records = self
                .cache
                .hydrate(self.directory, &ids)
                .await
                .map_err(|err| CodeNavError::upstream(SearchStage::Hydrate, None, err))?;
            let hydrated: Vec<UploadId> = ids
                .into_iter()
                .filter(|id| records.contains_key(id))
                .collect();

            debug!(
                stage = "remote",
                event = "remote.batch.end",
                result = "ok",
                uploads = hydrated.len(),
                remote_upload_offset = cursor.remote_upload_offset(),
                exhausted = cursor.remote_uploads_exhausted(),
                duration_ms = started.elapsed().as_millis() as u64,
                "loaded upload batch"
            );
            cursor = cursor.with_upload_batch(hydrated);
        }

        Ok(cursor)
    }

    async fn declaring_uploads(&self, packages: &[PackageInformation]) -> Result<Vec<UploadId>> {
        let mut ids = BTreeSet::new();
        for package in packages {
            let uploads = self
                .directory
                .find_uploads_declaring_package(package)
                .await
                .map_err(|err| CodeNavError::upstream(SearchStage::DeclaringUploads, None, err))?;
            self.cache.prime(&uploads);
            ids.extend(uploads.iter().map(|upload| upload.id));
        }
        Ok(ids.into_iter().collect())
    }
}

/// Moniker lookups over the cursor's current upload batch.
pub struct BulkMonikerLocator<'a> {
    store: &'a dyn BundleStore,
    table: LocationTable,
    ceiling: usize,
}

impl<'a> BulkMonikerLocator<'a> {
    pub fn new(store: &'a dyn BundleStore, table: LocationTable, ceiling: usize) -> Self {
        Self {
            store,
            table,
            ceiling: ceiling.max(1),
        }
    }

    /// Up to `limit` locations of the current batch from the cursor's remote
    /// location offset, with the cursor advanced past them.
    pub async fn locate(
        &self,
        cursor: SearchCursor,
        monikers: &[Moniker],
        limit: usize,
    ) -> Result<(Vec<Location>, SearchCursor)> {
        let started = Instant::now();
        let offset = cursor.remote_location_offset();
        let page = self
            .store
            .bulk_moniker_lookup(
                self.table,
                cursor.upload_ids(),
                cursor.skip_paths(),
                monikers,
                self.ceiling,
                offset,
            )
            .await
            .map_err(|err| CodeNavError::upstream(SearchStage::BulkLookup, None, err))?;

        let mut locations = page.locations;
        locations.truncate(limit);
        let taken = locations.len();

        debug!(
            stage = "remote",
            event = "remote.lookup.end",
            result = "ok",
            table = self.table.as_str(),
            uploads = cursor.upload_ids().len(),
            offset,
            taken,
            total = page.total,
            duration_ms = started.elapsed().as_millis() as u64,
            "bulk moniker lookup finished"
        );

        let total = if taken == 0 { 0 } else { page.total };
        Ok((locations, cursor.bump_remote_location_offset(taken, total)))
    }
}
