use std::time::Instant;

use tracing::debug;

use crate::cursor::SearchCursor;
use crate::db::models::Location;
use crate::db::{BundleStore, LocationTable};
use crate::error::{CodeNavError, Result, SearchStage};
use crate::monikers::is_bundle_local_symbol;

/// Locations gathered from the visible uploads for one page.
#[derive(Debug)]
pub struct LocalExtraction {
    pub locations: Vec<Location>,
    pub cursor: SearchCursor,
    /// A stop-after-first search found its answer; nothing else is searched.
    pub settled: bool,
}

/// Position lookups inside the visible uploads carried by the cursor.
pub struct LocalLocationExtractor<'a> {
    store: &'a dyn BundleStore,
    table: LocationTable,
    stop_after_first: bool,
}

impl<'a> LocalLocationExtractor<'a> {
    pub fn new(store: &'a dyn BundleStore, table: LocationTable, stop_after_first: bool) -> Self {
        Self {
            store,
            table,
            stop_after_first,
        }
    }

    /// Walks the visible uploads from the cursor offsets until `limit`
    /// locations are collected or the uploads run out.
    pub async fn extract(&self, mut cursor: SearchCursor, limit: usize) -> Result<LocalExtraction> {
        let mut locations = Vec::new();

        while locations.len() < limit {
            let Some(upload) = cursor
                .visible_uploads()
                .get(cursor.local_upload_offset())
                .cloned()
            else {
                break;
            };

            let started = Instant::now();
            let offset = cursor.local_location_offset();
            let page = self
                .store
                .extract_locations_from_position(
                    self.table,
                    upload.upload_id,
                    &upload.target_path_without_root,
                    upload.target_position,
                    limit - locations.len(),
                    offset,
                )
                .await
                .map_err(|err| {
                    CodeNavError::upstream(SearchStage::LocalLookup, Some(upload.upload_id), err)
                })?;

            let found = page.locations.len();
            debug!(
                stage = "local",
                event = "local.lookup.end",
                result = "ok",
                table = self.table.as_str(),
                upload_id = upload.upload_id,
                offset,
                found,
                total = page.total,
                duration_ms = started.elapsed().as_millis() as u64,
                "position lookup finished"
            );

            cursor = cursor.with_symbol_names(
                page.symbol_names
                    .into_iter()
                    .filter(|name| !is_bundle_local_symbol(name)),
            );
            if found > 0 {
                cursor = cursor.with_skip_path(upload.upload_id, upload.target_path_without_root);
            }

            // An empty page means the upload has nothing left, whatever its total claims.
            let total = if found == 0 { 0 } else { page.total };
            let before = cursor.local_upload_offset();
            cursor = cursor.bump_local_location_offset(found, total);
            locations.extend(page.locations);

            if self.stop_after_first && found > 0 {
                let consumed = cursor.local_upload_offset() > before;
                return Ok(LocalExtraction {
                    locations,
                    cursor,
                    settled: consumed,
                });
            }
        }

        Ok(LocalExtraction {
            locations,
            cursor,
            settled: false,
        })
    }
}
