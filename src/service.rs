//! Navigation queries over the upload corpus.
//!
//! Every query runs the same traversal: the visible uploads are searched by
//! position first, then the monikers seen there are searched across the
//! uploads that declare or reference them. A [`LocationStrategy`] picks the
//! occurrence table and how far the traversal goes.

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use crate::adjust::LocationAdjuster;
use crate::config::CodeNavConfig;
use crate::cursor::{Phase, SearchCursor};
use crate::db::models::{
    AdjustedCodeIntelligenceRange, AdjustedLocation, Location, LocationsPage, Moniker, Range,
    RequestArgs, UploadRecord,
};
use crate::db::{BundleStore, DiffTranslator, LocationTable, UploadDirectory};
use crate::error::{CodeNavError, Result, SearchStage};
use crate::hydrate::UploadCache;
use crate::local::LocalLocationExtractor;
use crate::monikers::MonikerCollector;
use crate::remote::{BulkMonikerLocator, CrossIndexUploadFinder, UploadSearch};
use crate::visible::VisibleUploadResolver;

/// What a navigation query reads and when it stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationStrategy {
    pub name: &'static str,
    /// Table read by the position lookup inside visible uploads.
    pub position_table: LocationTable,
    /// Table read by the moniker lookup across remote uploads.
    pub bulk_table: LocationTable,
    /// The first visible upload with a local answer ends the search.
    pub stop_after_first: bool,
    pub upload_search: UploadSearch,
}

impl LocationStrategy {
    pub const DEFINITIONS: Self = Self {
        name: "definitions",
        position_table: LocationTable::Definitions,
        bulk_table: LocationTable::Definitions,
        stop_after_first: true,
        upload_search: UploadSearch::Declaring,
    };

    pub const REFERENCES: Self = Self {
        name: "references",
        position_table: LocationTable::References,
        bulk_table: LocationTable::References,
        stop_after_first: false,
        upload_search: UploadSearch::DeclaringAndReferencing,
    };

    pub const IMPLEMENTATIONS: Self = Self {
        name: "implementations",
        position_table: LocationTable::Implementations,
        bulk_table: LocationTable::Implementations,
        stop_after_first: true,
        upload_search: UploadSearch::Declaring,
    };

    // Remote uploads are searched through their definitions.
    pub const PROTOTYPES: Self = Self {
        name: "prototypes",
        position_table: LocationTable::Prototypes,
        bulk_table: LocationTable::Definitions,
        stop_after_first: true,
        upload_search: UploadSearch::Declaring,
    };
}

/// Size of a finished answer, for the completion event.
trait Answer {
    fn returned(&self) -> usize;

    fn more(&self) -> bool {
        false
    }
}

impl Answer for LocationsPage {
    fn returned(&self) -> usize {
        self.locations.len()
    }

    fn more(&self) -> bool {
        self.next_cursor.is_some()
    }
}

impl<T> Answer for Vec<T> {
    fn returned(&self) -> usize {
        self.len()
    }
}

pub struct CodeNavService {
    store: Arc<dyn BundleStore>,
    directory: Arc<dyn UploadDirectory>,
    translator: Arc<dyn DiffTranslator>,
    cache: Arc<UploadCache>,
    config: CodeNavConfig,
}

impl CodeNavService {
    pub fn new(
        store: Arc<dyn BundleStore>,
        directory: Arc<dyn UploadDirectory>,
        translator: Arc<dyn DiffTranslator>,
        config: CodeNavConfig,
    ) -> Self {
        let cache = Arc::new(UploadCache::new(config.upload_cache_capacity));
        Self {
            store,
            directory,
            translator,
            cache,
            config,
        }
    }

    /// Shares an upload cache with other services of the process.
    pub fn with_upload_cache(mut self, cache: Arc<UploadCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &CodeNavConfig {
        &self.config
    }

    /// Every definition of the symbol at the position. Definitions carry no
    /// cursor, so the traversal runs until it is done.
    pub async fn get_definitions(&self, args: &RequestArgs) -> Result<Vec<AdjustedLocation>> {
        let strategy = LocationStrategy::DEFINITIONS;
        let page = self
            .timed(strategy.name, args, self.exhaust(strategy, args))
            .await?;
        Ok(page.locations)
    }

    pub async fn get_references(
        &self,
        args: &RequestArgs,
        cursor: Option<&str>,
    ) -> Result<LocationsPage> {
        self.locations(LocationStrategy::REFERENCES, args, cursor)
            .await
    }

    pub async fn get_implementations(
        &self,
        args: &RequestArgs,
        cursor: Option<&str>,
    ) -> Result<LocationsPage> {
        self.locations(LocationStrategy::IMPLEMENTATIONS, args, cursor)
            .await
    }

    pub async fn get_prototypes(
        &self,
        args: &RequestArgs,
        cursor: Option<&str>,
    ) -> Result<LocationsPage> {
        self.locations(LocationStrategy::PROTOTYPES, args, cursor)
            .await
    }

    /// One page of `strategy` locations, resuming from `cursor`. The next
    /// cursor is `None` once the search is finished.
    pub async fn locations(
        &self,
        strategy: LocationStrategy,
        args: &RequestArgs,
        cursor: Option<&str>,
    ) -> Result<LocationsPage> {
        self.timed(strategy.name, args, self.page(strategy, args, cursor))
            .await
    }

    /// Uploads able to answer queries about `args.path` at `args.commit`:
    /// those visible from the commit whose root contains the path.
    pub async fn visible_uploads_for_path(&self, args: &RequestArgs) -> Result<Vec<UploadRecord>> {
        self.timed("uploads", args, async {
            let uploads = self.resolver().resolve_path(args).await?;
            Ok::<_, CodeNavError>(uploads.into_iter().map(|(upload, _)| upload).collect::<Vec<_>>())
        })
        .await
    }

    /// Occurrence ranges of `args.path` across its uploads, in the
    /// coordinates of `args.commit`. Ranges edited since the upload commit
    /// are dropped.
    pub async fn get_stencil(&self, args: &RequestArgs) -> Result<Vec<Range>> {
        self.timed("stencil", args, async {
            let mut ranges = BTreeSet::new();
            for (upload, path_without_root) in self.resolver().resolve_path(args).await? {
                let stencil = self
                    .store
                    .get_stencil(upload.id, &path_without_root)
                    .await
                    .map_err(|err| CodeNavError::upstream(SearchStage::Document, Some(upload.id), err))?;
                for range in stencil {
                    if let Some(range) = self.translate_to_request(args, &upload, range).await? {
                        ranges.insert(range);
                    }
                }
            }
            Ok::<_, CodeNavError>(ranges.into_iter().collect::<Vec<_>>())
        })
        .await
    }

    /// Ranges of `args.path` starting on lines `start_line..end_line`, each
    /// with the locations its upload records for the symbols there.
    pub async fn get_ranges(
        &self,
        args: &RequestArgs,
        start_line: u32,
        end_line: u32,
    ) -> Result<Vec<AdjustedCodeIntelligenceRange>> {
        self.timed("ranges", args, async {
            let adjuster = LocationAdjuster::new(
                self.directory.as_ref(),
                self.translator.as_ref(),
                self.cache.as_ref(),
            );
            let mut adjusted = Vec::new();
            for (upload, path_without_root) in self.resolver().resolve_path(args).await? {
                let ranges = self
                    .store
                    .get_ranges(upload.id, &path_without_root, start_line, end_line)
                    .await
                    .map_err(|err| CodeNavError::upstream(SearchStage::Document, Some(upload.id), err))?;
                for found in ranges {
                    let Some(range) = self.translate_to_request(args, &upload, found.range).await?
                    else {
                        continue;
                    };
                    adjusted.push(AdjustedCodeIntelligenceRange {
                        upload: upload.clone(),
                        range,
                        definitions: adjuster.adjust(args, found.definitions).await?,
                        references: adjuster.adjust(args, found.references).await?,
                        implementations: adjuster.adjust(args, found.implementations).await?,
                    });
                }
            }
            Ok::<_, CodeNavError>(adjusted)
        })
        .await
    }

    fn resolver(&self) -> VisibleUploadResolver<'_> {
        VisibleUploadResolver::new(
            self.directory.as_ref(),
            self.translator.as_ref(),
            self.cache.as_ref(),
        )
    }

    async fn translate_to_request(
        &self,
        args: &RequestArgs,
        upload: &UploadRecord,
        range: Range,
    ) -> Result<Option<Range>> {
        self.translator
            .translate_range(args.repository_id, &upload.commit, &args.commit, &args.path, range)
            .await
            .map_err(|err| CodeNavError::upstream(SearchStage::Adjust, Some(upload.id), err))
    }

    /// Runs `work` under the request timeout and reports how it went.
    async fn timed<T, F>(&self, operation: &'static str, args: &RequestArgs, work: F) -> Result<T>
    where
        T: Answer,
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let outcome = match self.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .unwrap_or(Err(CodeNavError::Timeout(limit))),
            None => work.await,
        };

        match &outcome {
            Ok(answer) => info!(
                stage = "codenav",
                event = "codenav.page.end",
                result = "ok",
                operation,
                repository_id = args.repository_id,
                commit = %args.commit,
                path = %args.path,
                returned = answer.returned(),
                more = answer.more(),
                duration_ms = started.elapsed().as_millis() as u64,
                "navigation page finished"
            ),
            Err(err) => error!(
                stage = "codenav",
                event = "codenav.page.end",
                result = "fail",
                operation,
                repository_id = args.repository_id,
                commit = %args.commit,
                path = %args.path,
                client_error = err.is_client_error(),
                error = %err,
                duration_ms = started.elapsed().as_millis() as u64,
                "navigation page failed"
            ),
        }
        outcome
    }

    async fn page(
        &self,
        strategy: LocationStrategy,
        args: &RequestArgs,
        token: Option<&str>,
    ) -> Result<LocationsPage> {
        let cursor = SearchCursor::from_token(token)?;
        let (locations, cursor) = self.next_page(strategy, args, cursor).await?;
        let next_cursor = if cursor.is_done() {
            None
        } else {
            Some(cursor.encode()?)
        };
        Ok(LocationsPage {
            locations,
            next_cursor,
        })
    }

    async fn exhaust(
        &self,
        strategy: LocationStrategy,
        args: &RequestArgs,
    ) -> Result<LocationsPage> {
        let mut cursor = SearchCursor::default();
        let mut locations = Vec::new();
        while !cursor.is_done() {
            let (page, next) = self.next_page(strategy, args, cursor).await?;
            locations.extend(page);
            cursor = next;
        }
        Ok(LocationsPage {
            locations,
            next_cursor: None,
        })
    }

    /// Runs the traversal from `cursor` until the page is full or the search
    /// is done.
    async fn next_page(
        &self,
        strategy: LocationStrategy,
        args: &RequestArgs,
        mut cursor: SearchCursor,
    ) -> Result<(Vec<AdjustedLocation>, SearchCursor)> {
        if cursor.is_done() {
            return Ok((Vec::new(), cursor));
        }
        let limit = self.config.page_limit(args.limit);

        if cursor.phase() == Phase::Local
            && cursor.visible_uploads().is_empty()
            && cursor.local_upload_offset() == 0
        {
            let visible = self.resolver().resolve(args).await?;
            cursor = cursor.with_visible_uploads(visible);
        }

        let mut locations = Vec::new();
        if cursor.phase() == Phase::Local {
            let extractor = LocalLocationExtractor::new(
                self.store.as_ref(),
                strategy.position_table,
                strategy.stop_after_first,
            );
            let local = extractor.extract(cursor, limit).await?;
            locations = local.locations;
            cursor = local.cursor;

            if local.settled {
                cursor = cursor.advance_to(Phase::Done);
            } else if cursor.local_upload_offset() >= cursor.visible_uploads().len() {
                cursor = cursor.advance_to(Phase::Remote);
            }
        }

        if cursor.phase() == Phase::Remote && locations.len() < limit {
            let remaining = limit - locations.len();
            let (remote, next) = self
                .remote_locations(strategy, args, cursor, remaining)
                .await?;
            locations.extend(remote);
            cursor = next;
        }

        let mut seen = HashSet::new();
        locations.retain(|location| seen.insert(location.clone()));

        let adjuster = LocationAdjuster::new(
            self.directory.as_ref(),
            self.translator.as_ref(),
            self.cache.as_ref(),
        );
        let adjusted = adjuster.adjust(args, locations).await?;
        Ok((adjusted, cursor))
    }

    async fn remote_locations(
        &self,
        strategy: LocationStrategy,
        args: &RequestArgs,
        mut cursor: SearchCursor,
        limit: usize,
    ) -> Result<(Vec<Location>, SearchCursor)> {
        let collector =
            MonikerCollector::from_symbol_names(cursor.symbol_names().iter().map(String::as_str))?;
        if collector.is_empty() {
            return Ok((Vec::new(), cursor.advance_to(Phase::Done)));
        }

        let packages = collector.packages();
        let monikers: Vec<Moniker> = collector
            .monikers()
            .iter()
            .map(|qualified| qualified.moniker.clone())
            .collect();
        let finder = CrossIndexUploadFinder::new(
            self.directory.as_ref(),
            self.cache.as_ref(),
            strategy.upload_search,
            self.config.max_indexes_per_moniker_search,
        );
        let locator = BulkMonikerLocator::new(
            self.store.as_ref(),
            strategy.bulk_table,
            self.config.bulk_lookup_ceiling,
        );

        let mut locations = Vec::new();
        while locations.len() < limit {
            cursor = finder
                .next_batch(cursor, args, collector.monikers(), &packages)
                .await?;
            if cursor.upload_ids().is_empty() {
                cursor = cursor.advance_to(Phase::Done);
                break;
            }

            let (found, next) = locator
                .locate(cursor, &monikers, limit - locations.len())
                .await?;
            locations.extend(found);
            cursor = next;
        }
        Ok((locations, cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::db::memory::{
        CommitVisibility, FileDiff, InMemoryIndex, IndexSnapshot, Occurrence, PackageEntry,
    };
    use crate::db::models::{
        CodeIntelligenceRange, LocationPage, PackageInformation, Position, QualifiedMoniker, Range, RepositoryId,
        UploadId, UploadRecord,
    };
    use crate::db::{DbError, ReferencingUploads};
    use crate::error::SearchStage;
    use crate::translate::GitTreeTranslator;
    use pretty_assertions::assert_eq;

    const PARSE: &str = "scip-rust cargo acme-lib 1.0.0 parse().";
    const SCRATCH: &str = "lsif . scratch";

    fn upload(id: UploadId, repository_id: RepositoryId, name: &str, commit: &str) -> UploadRecord {
        UploadRecord {
            id,
            repository_id,
            repository_name: name.into(),
            commit: commit.into(),
            root: String::new(),
            indexer: "rust-analyzer".into(),
            uploaded_at: None,
        }
    }

    fn occ(
        upload_id: UploadId,
        path: &str,
        line: u32,
        symbol: &str,
        table: LocationTable,
    ) -> Occurrence {
        Occurrence {
            upload_id,
            path: path.into(),
            range: Range::new(line, 3, line, 8),
            symbol: symbol.into(),
            table,
        }
    }

    fn acme_lib() -> PackageInformation {
        PackageInformation {
            manager: "cargo".into(),
            name: "acme-lib".into(),
            version: "1.0.0".into(),
        }
    }

    /// acme/app (upload 1) calls `parse` from acme/lib (upload 2); acme/cli
    /// (upload 3) calls it too.
    fn corpus() -> InMemoryIndex {
        use LocationTable::{Definitions, References};
        InMemoryIndex::new(IndexSnapshot {
            uploads: vec![
                upload(1, 1, "acme/app", "head"),
                upload(2, 2, "acme/lib", "v1"),
                upload(3, 3, "acme/cli", "main"),
            ],
            visibility: vec![CommitVisibility {
                repository_id: 1,
                commit: "head".into(),
                upload_ids: vec![1],
            }],
            packages: vec![PackageEntry {
                upload_id: 2,
                package: acme_lib(),
            }],
            references: vec![
                PackageEntry {
                    upload_id: 1,
                    package: acme_lib(),
                },
                PackageEntry {
                    upload_id: 3,
                    package: acme_lib(),
                },
            ],
            occurrences: vec![
                occ(1, "src/main.rs", 2, PARSE, References),
                occ(1, "src/main.rs", 2, SCRATCH, References),
                occ(1, "src/main.rs", 10, PARSE, References),
                occ(1, "src/other.rs", 5, PARSE, References),
                occ(2, "src/lib.rs", 1, PARSE, Definitions),
                occ(2, "src/lib.rs", 1, PARSE, References),
                occ(2, "src/lib.rs", 8, PARSE, References),
                occ(3, "src/bin.rs", 3, PARSE, References),
            ],
            diffs: Vec::new(),
        })
    }

    fn args(limit: usize) -> RequestArgs {
        RequestArgs {
            repository_id: 1,
            commit: "head".into(),
            path: "src/main.rs".into(),
            line: 2,
            character: 4,
            limit,
        }
    }

    /// Delegates to an [`InMemoryIndex`], recording what the traversal asks for.
    struct Recorder {
        inner: InMemoryIndex,
        position_lookups: Mutex<Vec<UploadId>>,
        bulk_lookups: Mutex<Vec<(Vec<UploadId>, BTreeMap<UploadId, String>)>>,
        referencing_monikers: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new(inner: InMemoryIndex) -> Self {
            Self {
                inner,
                position_lookups: Mutex::new(Vec::new()),
                bulk_lookups: Mutex::new(Vec::new()),
                referencing_monikers: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BundleStore for Recorder {
        async fn extract_locations_from_position(
            &self,
            table: LocationTable,
            upload_id: UploadId,
            path: &str,
            position: Position,
            limit: usize,
            offset: usize,
        ) -> Result<LocationPage, DbError> {
            self.position_lookups.lock().unwrap().push(upload_id);
            self.inner
                .extract_locations_from_position(table, upload_id, path, position, limit, offset)
                .await
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
            self.bulk_lookups
                .lock()
                .unwrap()
                .push((upload_ids.to_vec(), skip_paths.clone()));
            self.inner
                .bulk_moniker_lookup(table, upload_ids, skip_paths, monikers, limit, offset)
                .await
        }

        async fn get_stencil(&self, upload_id: UploadId, path: &str) -> Result<Vec<Range>, DbError> {
            self.inner.get_stencil(upload_id, path).await
        }

        async fn get_ranges(
            &self,
            upload_id: UploadId,
            path: &str,
            start_line: u32,
            end_line: u32,
        ) -> Result<Vec<CodeIntelligenceRange>, DbError> {
            self.inner
                .get_ranges(upload_id, path, start_line, end_line)
                .await
        }
    }

    #[async_trait]
    impl UploadDirectory for Recorder {
        async fn find_uploads_covering_commit(
            &self,
            repository_id: RepositoryId,
            commit: &str,
            path: &str,
        ) -> Result<Vec<UploadRecord>, DbError> {
            self.inner
                .find_uploads_covering_commit(repository_id, commit, path)
                .await
        }

        async fn find_uploads_declaring_package(
            &self,
            package: &PackageInformation,
        ) -> Result<Vec<UploadRecord>, DbError> {
            self.inner.find_uploads_declaring_package(package).await
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
            self.referencing_monikers
                .lock()
                .unwrap()
                .extend(monikers.iter().map(|m| m.moniker.identifier.clone()));
            self.inner
                .find_uploads_referencing_package(
                    monikers,
                    ignore_ids,
                    repository_id,
                    commit,
                    limit,
                    offset,
                )
                .await
        }

        async fn get_uploads_by_ids(&self, ids: &[UploadId]) -> Result<Vec<UploadRecord>, DbError> {
            self.inner.get_uploads_by_ids(ids).await
        }
    }

    fn service_over(recorder: Arc<Recorder>, config: CodeNavConfig) -> CodeNavService {
        let translator = Arc::new(GitTreeTranslator::new(recorder.inner.clone()));
        CodeNavService::new(recorder.clone(), recorder, translator, config)
    }

    fn service(index: InMemoryIndex) -> (CodeNavService, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::new(index));
        (service_over(recorder.clone(), CodeNavConfig::default()), recorder)
    }

    fn summary(locations: &[AdjustedLocation]) -> Vec<(String, String, u32)> {
        locations
            .iter()
            .map(|l| {
                (
                    l.upload.repository_name.clone(),
                    l.path.clone(),
                    l.target_range.start.line,
                )
            })
            .collect()
    }

    async fn all_pages(
        service: &CodeNavService,
        strategy: LocationStrategy,
        args: &RequestArgs,
    ) -> Vec<LocationsPage> {
        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = service
                .locations(strategy, args, cursor.as_deref())
                .await
                .expect("page");
            cursor = page.next_cursor.clone();
            pages.push(page);
            if cursor.is_none() || pages.len() > 20 {
                return pages;
            }
        }
    }

    fn expected_references() -> Vec<(String, String, u32)> {
        vec![
            ("acme/app".into(), "src/main.rs".into(), 2),
            ("acme/app".into(), "src/main.rs".into(), 10),
            ("acme/app".into(), "src/other.rs".into(), 5),
            ("acme/lib".into(), "src/lib.rs".into(), 1),
            ("acme/lib".into(), "src/lib.rs".into(), 8),
            ("acme/cli".into(), "src/bin.rs".into(), 3),
        ]
    }

    #[tokio::test]
    async fn references_span_repositories_in_one_page() {
        let (service, _) = service(corpus());
        let page = service.get_references(&args(10), None).await.expect("references");

        assert_eq!(summary(&page.locations), expected_references());
        assert_eq!(page.next_cursor, None);

        let lib = &page.locations[3];
        assert_eq!(lib.target_commit, "v1");
        assert!(!lib.stale);
        assert_eq!(page.locations[0].target_commit, "head");
    }

    #[tokio::test]
    async fn paginated_references_never_repeat() {
        let (service, _) = service(corpus());
        let pages = all_pages(&service, LocationStrategy::REFERENCES, &args(1)).await;

        let all: Vec<AdjustedLocation> = pages.iter().flat_map(|p| p.locations.clone()).collect();
        assert_eq!(summary(&all), expected_references());
        assert!(pages.iter().all(|p| p.locations.len() <= 1));
        assert_eq!(pages.len(), 7);
        assert!(pages.last().expect("pages").locations.is_empty());
    }

    #[tokio::test]
    async fn phases_only_move_forward() {
        let (service, _) = service(corpus());
        let mut cursor: Option<String> = None;
        let mut phases = Vec::new();
        loop {
            let page = service
                .get_references(&args(2), cursor.as_deref())
                .await
                .expect("page");
            let phase = match &page.next_cursor {
                Some(token) => SearchCursor::decode(token).expect("decode").phase(),
                None => Phase::Done,
            };
            phases.push(phase);
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        let mut sorted = phases.clone();
        sorted.sort();
        assert_eq!(phases, sorted);
        assert_eq!(phases.last(), Some(&Phase::Done));
    }

    #[tokio::test]
    async fn skipped_paths_never_reach_remote_results() {
        let (service, recorder) = service(corpus());
        let page = service.get_references(&args(10), None).await.expect("references");

        let lookups = recorder.bulk_lookups.lock().unwrap().clone();
        assert!(!lookups.is_empty());
        for (_, skip_paths) in &lookups {
            assert_eq!(skip_paths.get(&1).map(String::as_str), Some("src/main.rs"));
        }
        let local_doc = page
            .locations
            .iter()
            .filter(|l| l.upload.id == 1 && l.path == "src/main.rs")
            .count();
        assert_eq!(local_doc, 2);
    }

    #[tokio::test]
    async fn marker_symbols_never_reach_upload_discovery() {
        let (service, recorder) = service(corpus());
        service.get_references(&args(10), None).await.expect("references");

        let seen = recorder.referencing_monikers.lock().unwrap().clone();
        assert_eq!(seen, vec![PARSE.to_string()]);
    }

    #[tokio::test]
    async fn definitions_come_from_declaring_upload() {
        let (service, _) = service(corpus());
        let locations = service.get_definitions(&args(10)).await.expect("definitions");
        assert_eq!(
            summary(&locations),
            vec![("acme/lib".to_string(), "src/lib.rs".to_string(), 1)]
        );

        let implementations = service
            .get_implementations(&args(10), None)
            .await
            .expect("implementations");
        assert!(implementations.locations.is_empty());
        assert_eq!(implementations.next_cursor, None);
    }

    #[tokio::test]
    async fn prototypes_and_definitions_read_different_occurrences() {
        use LocationTable::{Definitions, Prototypes};
        let index = InMemoryIndex::new(IndexSnapshot {
            uploads: vec![upload(1, 1, "acme/app", "head")],
            visibility: vec![CommitVisibility {
                repository_id: 1,
                commit: "head".into(),
                upload_ids: vec![1],
            }],
            occurrences: vec![
                occ(1, "src/main.rs", 2, PARSE, Prototypes),
                occ(1, "src/main.rs", 20, PARSE, Definitions),
            ],
            ..IndexSnapshot::default()
        });
        let (service, _) = service(index);

        let prototypes = service.get_prototypes(&args(10), None).await.expect("prototypes");
        assert_eq!(
            summary(&prototypes.locations),
            vec![("acme/app".to_string(), "src/main.rs".to_string(), 2)]
        );

        let definitions = service.get_definitions(&args(10)).await.expect("definitions");
        assert_eq!(
            summary(&definitions),
            vec![("acme/app".to_string(), "src/main.rs".to_string(), 20)]
        );
    }

    #[tokio::test]
    async fn definitions_alone_yield_no_prototypes() {
        let (service, _) = service(layered_corpus(LocationTable::Definitions));
        let page = service.get_prototypes(&args(10), None).await.expect("prototypes");
        assert!(page.locations.is_empty());
        assert_eq!(page.next_cursor, None);
    }

    fn layered_corpus(table: LocationTable) -> InMemoryIndex {
        InMemoryIndex::new(IndexSnapshot {
            uploads: (1..=3).map(|id| upload(id, 1, "acme/app", "head")).collect(),
            visibility: vec![CommitVisibility {
                repository_id: 1,
                commit: "head".into(),
                upload_ids: vec![1, 2, 3],
            }],
            occurrences: vec![
                occ(2, "src/main.rs", 2, PARSE, table),
                occ(2, "src/main.rs", 30, PARSE, table),
                occ(2, "src/main.rs", 40, PARSE, table),
                occ(3, "src/main.rs", 2, PARSE, table),
            ],
            ..IndexSnapshot::default()
        })
    }

    #[tokio::test]
    async fn first_answering_upload_settles_definitions() {
        let (service, recorder) = service(layered_corpus(LocationTable::Definitions));
        let locations = service.get_definitions(&args(10)).await.expect("definitions");

        assert_eq!(locations.len(), 3);
        assert!(locations.iter().all(|l| l.upload.id == 2));
        assert_eq!(*recorder.position_lookups.lock().unwrap(), vec![1, 2]);
        assert!(recorder.bulk_lookups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn definitions_are_complete_beyond_the_page_limit() {
        let (service, recorder) = service(layered_corpus(LocationTable::Definitions));
        let locations = service.get_definitions(&args(2)).await.expect("definitions");

        let lines: Vec<_> = locations
            .iter()
            .map(|l| (l.upload.id, l.target_range.start.line))
            .collect();
        assert_eq!(lines, vec![(2, 2), (2, 30), (2, 40)]);
        assert!(!recorder.position_lookups.lock().unwrap().contains(&3));
    }

    #[tokio::test]
    async fn remote_definitions_are_complete_beyond_the_page_limit() {
        use LocationTable::Definitions;
        let mut snapshot = corpus().snapshot().clone();
        snapshot.occurrences.extend([
            occ(2, "src/lib.rs", 50, PARSE, Definitions),
            occ(2, "src/parse.rs", 7, PARSE, Definitions),
        ]);
        let (service, _) = service(InMemoryIndex::new(snapshot));

        let locations = service.get_definitions(&args(1)).await.expect("definitions");
        assert_eq!(
            summary(&locations),
            vec![
                ("acme/lib".to_string(), "src/lib.rs".to_string(), 1),
                ("acme/lib".to_string(), "src/lib.rs".to_string(), 50),
                ("acme/lib".to_string(), "src/parse.rs".to_string(), 7),
            ]
        );
    }

    #[tokio::test]
    async fn settled_search_returns_no_cursor() {
        let (service, _) = service(layered_corpus(LocationTable::Prototypes));
        let page = service
            .get_prototypes(&args(10), None)
            .await
            .expect("prototypes");
        assert_eq!(page.locations.len(), 3);
        assert_eq!(page.next_cursor, None);
    }

    #[tokio::test]
    async fn two_uploads_page_one_after_the_other() {
        use LocationTable::References;
        let index = InMemoryIndex::new(IndexSnapshot {
            uploads: vec![
                upload(1, 1, "acme/app", "head"),
                upload(2, 1, "acme/app", "head"),
            ],
            visibility: vec![CommitVisibility {
                repository_id: 1,
                commit: "head".into(),
                upload_ids: vec![1, 2],
            }],
            occurrences: vec![
                occ(1, "src/main.rs", 2, PARSE, References),
                occ(1, "src/main.rs", 4, PARSE, References),
                occ(2, "src/main.rs", 2, PARSE, References),
                occ(2, "src/main.rs", 6, PARSE, References),
            ],
            ..IndexSnapshot::default()
        });
        let (service, _) = service(index);

        let first = service.get_references(&args(2), None).await.expect("page 1");
        let ids: Vec<_> = first
            .locations
            .iter()
            .map(|l| (l.upload.id, l.target_range.start.line))
            .collect();
        assert_eq!(ids, vec![(1, 2), (1, 4)]);
        let token = first.next_cursor.expect("more pages");
        let cursor = SearchCursor::decode(&token).expect("decode");
        assert_eq!(cursor.phase(), Phase::Local);
        assert_eq!(
            (cursor.local_upload_offset(), cursor.local_location_offset()),
            (1, 0)
        );

        let second = service
            .get_references(&args(2), Some(&token))
            .await
            .expect("page 2");
        let ids: Vec<_> = second
            .locations
            .iter()
            .map(|l| (l.upload.id, l.target_range.start.line))
            .collect();
        assert_eq!(ids, vec![(2, 2), (2, 6)]);
    }

    #[tokio::test]
    async fn done_cursor_returns_an_empty_page() {
        let (service, recorder) = service(corpus());
        let token = SearchCursor::done().encode().expect("encode");

        let page = service
            .get_references(&args(10), Some(&token))
            .await
            .expect("references");
        assert!(page.locations.is_empty());
        assert_eq!(page.next_cursor, None);
        assert!(recorder.position_lookups.lock().unwrap().is_empty());

        let (locations, cursor) = service
            .next_page(LocationStrategy::REFERENCES, &args(10), SearchCursor::done())
            .await
            .expect("done page");
        assert!(locations.is_empty());
        assert_eq!(cursor, SearchCursor::done());
    }

    #[tokio::test]
    async fn uncovered_position_is_an_empty_success() {
        let (service, _) = service(corpus());
        let mut request = args(10);
        request.commit = "unknown".into();

        let page = service.get_references(&request, None).await.expect("references");
        assert!(page.locations.is_empty());
        assert_eq!(page.next_cursor, None);
    }

    #[tokio::test]
    async fn garbage_cursor_is_a_client_error() {
        let (service, _) = service(corpus());
        let err = service
            .get_references(&args(10), Some("%%%"))
            .await
            .expect_err("must reject");
        assert!(matches!(err, CodeNavError::InvalidCursor(_)));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn corrupt_symbol_fails_the_page() {
        use LocationTable::References;
        let index = InMemoryIndex::new(IndexSnapshot {
            uploads: vec![upload(1, 1, "acme/app", "head")],
            visibility: vec![CommitVisibility {
                repository_id: 1,
                commit: "head".into(),
                upload_ids: vec![1],
            }],
            occurrences: vec![occ(1, "src/main.rs", 2, "scip-rust cargo", References)],
            ..IndexSnapshot::default()
        });
        let (service, _) = service(index);

        let err = service
            .get_references(&args(10), None)
            .await
            .expect_err("must fail");
        assert!(matches!(err, CodeNavError::MalformedSymbol { .. }));
    }

    struct BrokenStore {
        delay: Option<Duration>,
    }

    #[async_trait]
    impl BundleStore for BrokenStore {
        async fn extract_locations_from_position(
            &self,
            _table: LocationTable,
            _upload_id: UploadId,
            _path: &str,
            _position: Position,
            _limit: usize,
            _offset: usize,
        ) -> Result<LocationPage, DbError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Err(DbError::Database("connection reset".into()))
        }

        async fn bulk_moniker_lookup(
            &self,
            _table: LocationTable,
            _upload_ids: &[UploadId],
            _skip_paths: &BTreeMap<UploadId, String>,
            _monikers: &[Moniker],
            _limit: usize,
            _offset: usize,
        ) -> Result<LocationPage, DbError> {
            Err(DbError::Database("connection reset".into()))
        }

        async fn get_stencil(&self, _upload_id: UploadId, _path: &str) -> Result<Vec<Range>, DbError> {
            Err(DbError::Database("connection reset".into()))
        }

        async fn get_ranges(
            &self,
            _upload_id: UploadId,
            _path: &str,
            _start_line: u32,
            _end_line: u32,
        ) -> Result<Vec<CodeIntelligenceRange>, DbError> {
            Err(DbError::Database("connection reset".into()))
        }
    }

    fn broken_service(delay: Option<Duration>, config: CodeNavConfig) -> CodeNavService {
        let index = Arc::new(corpus());
        let translator = Arc::new(GitTreeTranslator::new(corpus()));
        CodeNavService::new(Arc::new(BrokenStore { delay }), index, translator, config)
    }

    #[tokio::test]
    async fn upstream_failure_names_stage_and_upload() {
        let service = broken_service(None, CodeNavConfig::default());
        let err = service
            .get_references(&args(10), None)
            .await
            .expect_err("must fail");
        match err {
            CodeNavError::Upstream {
                stage, upload_id, ..
            } => {
                assert_eq!(stage, SearchStage::LocalLookup);
                assert_eq!(upload_id, Some(1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn slow_lookups_hit_the_request_timeout() {
        let config = CodeNavConfig {
            request_timeout: Some(Duration::from_millis(20)),
            ..CodeNavConfig::default()
        };
        let service = broken_service(Some(Duration::from_secs(5)), config);
        let err = service
            .get_references(&args(10), None)
            .await
            .expect_err("must time out");
        assert!(matches!(err, CodeNavError::Timeout(_)));
    }

    #[tokio::test]
    async fn document_lookups_name_the_failing_upload() {
        let service = broken_service(None, CodeNavConfig::default());
        let err = service
            .get_stencil(&args(10))
            .await
            .expect_err("must fail");
        match err {
            CodeNavError::Upstream {
                stage, upload_id, ..
            } => {
                assert_eq!(stage, SearchStage::Document);
                assert_eq!(upload_id, Some(1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// acme/app indexed at `head` (upload 1) and at `older` (upload 4). Since
    /// `older`, line 1 of src/main.rs was replaced by two lines.
    fn document_corpus() -> InMemoryIndex {
        use LocationTable::{Definitions, References};
        InMemoryIndex::new(IndexSnapshot {
            uploads: vec![
                upload(1, 1, "acme/app", "head"),
                upload(4, 1, "acme/app", "older"),
            ],
            visibility: vec![CommitVisibility {
                repository_id: 1,
                commit: "head".into(),
                upload_ids: vec![1, 4],
            }],
            occurrences: vec![
                occ(1, "src/main.rs", 2, PARSE, References),
                occ(1, "src/main.rs", 5, SCRATCH, Definitions),
                occ(1, "src/main.rs", 9, SCRATCH, References),
                occ(1, "src/other.rs", 1, SCRATCH, References),
                occ(4, "src/main.rs", 0, PARSE, References),
                occ(4, "src/main.rs", 1, PARSE, References),
                occ(4, "src/main.rs", 2, SCRATCH, Definitions),
            ],
            diffs: vec![FileDiff {
                repository_id: 1,
                from_commit: "older".into(),
                to_commit: "head".into(),
                path: "src/main.rs".into(),
                patch: Some(
                    "--- a/src/main.rs\n+++ b/src/main.rs\n@@ -2,1 +2,2 @@\n-fn b() {}\n+use std::fmt;\n+fn b() -> u8 { 0 }\n"
                        .into(),
                ),
            }],
            ..IndexSnapshot::default()
        })
    }

    #[tokio::test]
    async fn path_uploads_are_hydrated_records() {
        let (service, _) = service(document_corpus());
        let uploads = service
            .visible_uploads_for_path(&args(10))
            .await
            .expect("uploads");
        let summary: Vec<_> = uploads
            .iter()
            .map(|upload| (upload.id, upload.commit.as_str()))
            .collect();
        assert_eq!(summary, vec![(1, "head"), (4, "older")]);
    }

    #[tokio::test]
    async fn stencil_merges_uploads_at_the_requested_commit() {
        let (service, _) = service(document_corpus());
        let stencil = service.get_stencil(&args(10)).await.expect("stencil");
        let lines: Vec<u32> = stencil.iter().map(|range| range.start.line).collect();
        assert_eq!(lines, vec![0, 2, 3, 5, 9]);
        assert!(stencil.iter().all(|range| range.start.character == 3));
    }

    #[tokio::test]
    async fn ranges_carry_same_bundle_locations() {
        let (service, _) = service(document_corpus());
        let ranges = service.get_ranges(&args(10), 4, 10).await.expect("ranges");

        let summary: Vec<_> = ranges
            .iter()
            .map(|found| {
                let paths = |locations: &[AdjustedLocation]| -> Vec<(String, u32)> {
                    locations
                        .iter()
                        .map(|l| (l.path.clone(), l.target_range.start.line))
                        .collect()
                };
                (
                    found.upload.id,
                    found.range.start.line,
                    paths(&found.definitions[..]),
                    paths(&found.references[..]),
                )
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                (
                    1,
                    5,
                    vec![("src/main.rs".to_string(), 5)],
                    vec![("src/main.rs".to_string(), 9), ("src/other.rs".to_string(), 1)],
                ),
                (
                    1,
                    9,
                    vec![("src/main.rs".to_string(), 5)],
                    vec![("src/main.rs".to_string(), 9), ("src/other.rs".to_string(), 1)],
                ),
            ]
        );
        assert!(ranges.iter().all(|found| found.implementations.is_empty()));
    }

    #[tokio::test]
    async fn ranges_of_older_uploads_follow_the_diff() {
        let (service, _) = service(document_corpus());
        let ranges = service.get_ranges(&args(10), 0, 3).await.expect("ranges");

        let summary: Vec<_> = ranges
            .iter()
            .map(|found| {
                let lines = |locations: &[AdjustedLocation]| -> Vec<(u32, bool)> {
                    locations
                        .iter()
                        .map(|l| (l.target_range.start.line, l.stale))
                        .collect()
                };
                (
                    found.upload.id,
                    found.range.start.line,
                    lines(&found.definitions[..]),
                    lines(&found.references[..]),
                )
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, 2, vec![], vec![(2, false)]),
                (4, 0, vec![], vec![(0, false), (1, true)]),
                (4, 3, vec![(3, false)], vec![]),
            ]
        );
    }
}
