use std::collections::BTreeSet;
use std::time::Instant;

use tracing::debug;

use crate::db::models::{AdjustedLocation, Location, RequestArgs, UploadId};
use crate::db::{DiffTranslator, UploadDirectory};
use crate::error::{CodeNavError, Result, SearchStage};
use crate::hydrate::UploadCache;

/// Rewrites bundle locations into the coordinates of the requested commit.
///
/// Locations from other repositories stay at their upload commit. A range
/// that no longer exists at the requested commit is reported at the upload
/// commit and flagged `stale`.
pub struct LocationAdjuster<'a> {
    directory: &'a dyn UploadDirectory,
    translator: &'a dyn DiffTranslator,
    cache: &'a UploadCache,
}

impl<'a> LocationAdjuster<'a> {
    pub fn new(
        directory: &'a dyn UploadDirectory,
        translator: &'a dyn DiffTranslator,
        cache: &'a UploadCache,
    ) -> Self {
        Self {
            directory,
            translator,
            cache,
        }
    }

    pub async fn adjust(
        &self,
        args: &RequestArgs,
        locations: Vec<Location>,
    ) -> Result<Vec<AdjustedLocation>> {
        if locations.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let ids: Vec<UploadId> = locations
            .iter()
            .map(|location| location.upload_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let uploads = self
            .cache
            .hydrate(self.directory, &ids)
            .await
            .map_err(|err| CodeNavError::upstream(SearchStage::Hydrate, None, err))?;

        let mut adjusted = Vec::with_capacity(locations.len());
        let mut stale = 0usize;
        for location in locations {
            let Some(upload) = uploads.get(&location.upload_id) else {
                debug!(
                    stage = "adjust",
                    event = "adjust.upload.missing",
                    upload_id = location.upload_id,
                    "dropping location of unknown upload"
                );
                continue;
            };
            let path = upload.repository_path(&location.path);

            if upload.repository_id != args.repository_id {
                adjusted.push(AdjustedLocation {
                    upload: upload.clone(),
                    path,
                    target_commit: upload.commit.clone(),
                    target_range: location.range,
                    stale: false,
                });
                continue;
            }

            let translated = self
                .translator
                .translate_range(
                    args.repository_id,
                    &upload.commit,
                    &args.commit,
                    &path,
                    location.range,
                )
                .await
                .map_err(|err| CodeNavError::upstream(SearchStage::Adjust, Some(upload.id), err))?;

            let location = match translated {
                Some(range) => AdjustedLocation {
                    upload: upload.clone(),
                    path,
                    target_commit: args.commit.clone(),
                    target_range: range,
                    stale: false,
                },
                None => {
                    stale += 1;
                    AdjustedLocation {
                        upload: upload.clone(),
                        path,
                        target_commit: upload.commit.clone(),
                        target_range: location.range,
                        stale: true,
                    }
                }
            };
            adjusted.push(location);
        }

        debug!(
            stage = "adjust",
            event = "adjust.end",
            result = "ok",
            adjusted = adjusted.len(),
            stale,
            duration_ms = started.elapsed().as_millis() as u64,
            "adjusted locations"
        );
        Ok(adjusted)
    }
}
