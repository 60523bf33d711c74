use std::time::Instant;

use tracing::debug;

use crate::db::models::{RequestArgs, UploadRecord, VisibleUpload};
use crate::db::{DiffTranslator, UploadDirectory};
use crate::error::{CodeNavError, Result, SearchStage};
use crate::hydrate::UploadCache;

/// Maps a request position onto every upload whose commit covers it.
pub struct VisibleUploadResolver<'a> {
    directory: &'a dyn UploadDirectory,
    translator: &'a dyn DiffTranslator,
    cache: &'a UploadCache,
}

impl<'a> VisibleUploadResolver<'a> {
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

    /// Visible uploads in directory order. Uploads whose root does not contain
    /// the path, or whose commit lost the position, are left out.
    pub async fn resolve(&self, args: &RequestArgs) -> Result<Vec<VisibleUpload>> {
        let started = Instant::now();
        let candidates = self
            .directory
            .find_uploads_covering_commit(args.repository_id, &args.commit, &args.path)
            .await
            .map_err(|err| CodeNavError::upstream(SearchStage::VisibleUploads, None, err))?;
        self.cache.prime(&candidates);

        let mut visible = Vec::with_capacity(candidates.len());
        for upload in &candidates {
            let Some(path_without_root) = upload.path_within_root(&args.path) else {
                continue;
            };

            let position = self
                .translator
                .translate_position(
                    args.repository_id,
                    &args.commit,
                    &upload.commit,
                    &args.path,
                    args.position(),
                )
                .await
                .map_err(|err| {
                    CodeNavError::upstream(SearchStage::VisibleUploads, Some(upload.id), err)
                })?;

            let Some(target_position) = position else {
                debug!(
                    stage = "visible",
                    event = "visible.upload.skip",
                    upload_id = upload.id,
                    upload_commit = %upload.commit,
                    "position does not exist at upload commit"
                );
                continue;
            };

            visible.push(VisibleUpload {
                upload_id: upload.id,
                target_path: args.path.clone(),
                target_position,
                target_path_without_root: path_without_root.to_string(),
            });
        }

        debug!(
            stage = "visible",
            event = "visible.resolve.end",
            result = "ok",
            candidates = candidates.len(),
            visible = visible.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "resolved visible uploads"
        );
        Ok(visible)
    }

    /// Uploads whose root contains the requested path, each paired with the
    /// path relative to its root. The position is not consulted.
    pub async fn resolve_path(&self, args: &RequestArgs) -> Result<Vec<(UploadRecord, String)>> {
        let candidates = self
            .directory
            .find_uploads_covering_commit(args.repository_id, &args.commit, &args.path)
            .await
            .map_err(|err| CodeNavError::upstream(SearchStage::VisibleUploads, None, err))?;
        self.cache.prime(&candidates);

        Ok(candidates
            .into_iter()
            .filter_map(|upload| {
                let path = upload.path_within_root(&args.path)?.to_string();
                Some((upload, path))
            })
            .collect())
    }
}
