use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::db::models::{
    CodeIntelligenceRange, Location, LocationPage, Moniker, PackageInformation, Position, QualifiedMoniker, Range,
    RepositoryId, UploadId, UploadRecord,
};
use crate::db::{BundleStore, DbError, LocationTable, ReferencingUploads, UploadDirectory};

/// Bundle store and upload directory backed by the tables of
/// `migrations/0001_codenav.sql`.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), DbError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DbError::Database(e.to_string()))
    }
}

#[derive(sqlx::FromRow)]
struct UploadRow {
    id: i64,
    repository_id: i64,
    repository_name: String,
    commit_sha: String,
    root: String,
    indexer: String,
    uploaded_at: Option<DateTime<Utc>>,
}

impl From<UploadRow> for UploadRecord {
    fn from(row: UploadRow) -> Self {
        UploadRecord {
            id: row.id,
            repository_id: row.repository_id,
            repository_name: row.repository_name,
            commit: row.commit_sha,
            root: row.root,
            indexer: row.indexer,
            uploaded_at: row.uploaded_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LocationRow {
    upload_id: i64,
    path: String,
    start_line: i32,
    start_character: i32,
    end_line: i32,
    end_character: i32,
    total: i64,
}

impl LocationRow {
    fn into_location(self) -> Result<Location, DbError> {
        Ok(Location {
            upload_id: self.upload_id,
            path: self.path,
            range: Range {
                start: Position::new(
                    column(self.start_line, "start_line")?,
                    column(self.start_character, "start_character")?,
                ),
                end: Position::new(
                    column(self.end_line, "end_line")?,
                    column(self.end_character, "end_character")?,
                ),
            },
        })
    }
}

#[derive(sqlx::FromRow)]
struct RangeRow {
    start_line: i32,
    start_character: i32,
    end_line: i32,
    end_character: i32,
}

impl RangeRow {
    fn into_range(self) -> Result<Range, DbError> {
        Ok(Range {
            start: Position::new(
                column(self.start_line, "start_line")?,
                column(self.start_character, "start_character")?,
            ),
            end: Position::new(
                column(self.end_line, "end_line")?,
                column(self.end_character, "end_character")?,
            ),
        })
    }
}

#[derive(sqlx::FromRow)]
struct SymbolRangeRow {
    symbol: String,
    #[sqlx(flatten)]
    range: RangeRow,
}

#[derive(sqlx::FromRow)]
struct SymbolLocationRow {
    kind: String,
    symbol: String,
    path: String,
    #[sqlx(flatten)]
    range: RangeRow,
}

fn column(value: i32, name: &str) -> Result<u32, DbError> {
    u32::try_from(value).map_err(|_| DbError::Internal(format!("negative {name}: {value}")))
}

fn bind_count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn bind_coordinate(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn into_page(rows: Vec<LocationRow>, symbol_names: Vec<String>) -> Result<LocationPage, DbError> {
    let total = rows.first().map(|row| row.total).unwrap_or_default();
    let locations = rows
        .into_iter()
        .map(LocationRow::into_location)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LocationPage {
        locations,
        total: usize::try_from(total).unwrap_or_default(),
        symbol_names,
    })
}

const UPLOAD_COLUMNS: &str =
    "u.id, u.repository_id, u.repository_name, u.commit_sha, u.root, u.indexer, u.uploaded_at";

#[async_trait]
impl BundleStore for PostgresStore {
    async fn extract_locations_from_position(
        &self,
        table: LocationTable,
        upload_id: UploadId,
        path: &str,
        position: Position,
        limit: usize,
        offset: usize,
    ) -> Result<LocationPage, DbError> {
        let line = bind_coordinate(position.line);
        let character = bind_coordinate(position.character);

        let symbol_names: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT symbol FROM codenav_occurrences \
             WHERE upload_id = $1 AND path = $2 \
               AND (start_line, start_character) <= ($3, $4) \
               AND ($3, $4) <= (end_line, end_character) \
             ORDER BY symbol",
        )
        .bind(upload_id)
        .bind(path)
        .bind(line)
        .bind(character)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

        if symbol_names.is_empty() {
            return Ok(LocationPage::default());
        }

        let rows: Vec<LocationRow> = sqlx::query_as(
            "SELECT upload_id, path, start_line, start_character, end_line, end_character, \
                    COUNT(*) OVER () AS total \
             FROM ( \
                 SELECT DISTINCT upload_id, path, start_line, start_character, end_line, end_character \
                 FROM codenav_occurrences \
                 WHERE upload_id = $1 AND path = $2 AND kind = $3 AND symbol = ANY($4) \
             ) matches \
             ORDER BY start_line, start_character, end_line, end_character \
             LIMIT $5 OFFSET $6",
        )
        .bind(upload_id)
        .bind(path)
        .bind(table.as_str())
        .bind(&symbol_names)
        .bind(bind_count(limit))
        .bind(bind_count(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

        into_page(rows, symbol_names)
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
        if upload_ids.is_empty() || monikers.is_empty() {
            return Ok(LocationPage::default());
        }

        let identifiers: Vec<&str> = monikers.iter().map(|m| m.identifier.as_str()).collect();

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT upload_id, path, start_line, start_character, end_line, end_character, \
                    COUNT(*) OVER () AS total \
             FROM ( \
                 SELECT DISTINCT o.upload_id, o.path, o.start_line, o.start_character, o.end_line, o.end_character \
                 FROM codenav_occurrences o \
                 WHERE o.kind = ",
        );
        qb.push_bind(table.as_str())
            .push(" AND o.upload_id = ANY(")
            .push_bind(upload_ids)
            .push(") AND o.symbol = ANY(")
            .push_bind(identifiers)
            .push(")");

        if !skip_paths.is_empty() {
            let skip_ids: Vec<i64> = skip_paths.keys().copied().collect();
            let skip_docs: Vec<&str> = skip_paths.values().map(String::as_str).collect();
            qb.push(
                " AND (o.upload_id, o.path) NOT IN \
                 (SELECT s.upload_id, s.path FROM UNNEST(",
            )
            .push_bind(skip_ids)
            .push("::bigint[], ")
            .push_bind(skip_docs)
            .push("::text[]) AS s(upload_id, path))");
        }

        qb.push(
            " ) matches \
             ORDER BY upload_id, path, start_line, start_character, end_line, end_character \
             LIMIT ",
        )
        .push_bind(bind_count(limit))
        .push(" OFFSET ")
        .push_bind(bind_count(offset));

        let rows: Vec<LocationRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DbError::Database(e.to_string()))?;

        into_page(rows, Vec::new())
    }

    async fn get_stencil(&self, upload_id: UploadId, path: &str) -> Result<Vec<Range>, DbError> {
        let rows: Vec<RangeRow> = sqlx::query_as(
            "SELECT DISTINCT start_line, start_character, end_line, end_character \
             FROM codenav_occurrences \
             WHERE upload_id = $1 AND path = $2 \
             ORDER BY start_line, start_character, end_line, end_character",
        )
        .bind(upload_id)
        .bind(path)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

        rows.into_iter().map(RangeRow::into_range).collect()
    }

    async fn get_ranges(
        &self,
        upload_id: UploadId,
        path: &str,
        start_line: u32,
        end_line: u32,
    ) -> Result<Vec<CodeIntelligenceRange>, DbError> {
        let rows: Vec<SymbolRangeRow> = sqlx::query_as(
            "SELECT DISTINCT symbol, start_line, start_character, end_line, end_character \
             FROM codenav_occurrences \
             WHERE upload_id = $1 AND path = $2 AND start_line >= $3 AND start_line < $4",
        )
        .bind(upload_id)
        .bind(path)
        .bind(bind_coordinate(start_line))
        .bind(bind_coordinate(end_line))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut symbols_by_range: BTreeMap<Range, BTreeSet<String>> = BTreeMap::new();
        for row in rows {
            symbols_by_range
                .entry(row.range.into_range()?)
                .or_default()
                .insert(row.symbol);
        }
        let symbols: Vec<&str> = symbols_by_range
            .values()
            .flatten()
            .map(String::as_str)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let occurrences: Vec<SymbolLocationRow> = sqlx::query_as(
            "SELECT DISTINCT kind, symbol, path, start_line, start_character, end_line, end_character \
             FROM codenav_occurrences \
             WHERE upload_id = $1 AND symbol = ANY($2) \
               AND kind IN ('definitions', 'references', 'implementations')",
        )
        .bind(upload_id)
        .bind(&symbols)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

        let mut by_symbol: BTreeMap<String, Vec<(String, Location)>> = BTreeMap::new();
        for row in occurrences {
            let location = Location {
                upload_id,
                path: row.path,
                range: row.range.into_range()?,
            };
            by_symbol
                .entry(row.symbol)
                .or_default()
                .push((row.kind, location));
        }

        Ok(symbols_by_range
            .into_iter()
            .map(|(range, symbols)| {
                let mut definitions = BTreeSet::new();
                let mut references = BTreeSet::new();
                let mut implementations = BTreeSet::new();
                let matches = symbols
                    .iter()
                    .filter_map(|symbol| by_symbol.get(symbol))
                    .flatten();
                for (kind, location) in matches {
                    let bucket = match kind.as_str() {
                        "definitions" => &mut definitions,
                        "references" => &mut references,
                        _ => &mut implementations,
                    };
                    bucket.insert(location.clone());
                }
                CodeIntelligenceRange {
                    range,
                    definitions: definitions.into_iter().collect(),
                    references: references.into_iter().collect(),
                    implementations: implementations.into_iter().collect(),
                }
            })
            .collect())
    }
}

#[async_trait]
impl UploadDirectory for PostgresStore {
    async fn find_uploads_covering_commit(
        &self,
        repository_id: RepositoryId,
        commit: &str,
        path: &str,
    ) -> Result<Vec<UploadRecord>, DbError> {
        let rows: Vec<UploadRow> = sqlx::query_as(&format!(
            "SELECT {UPLOAD_COLUMNS} \
             FROM codenav_commit_visibility v \
             JOIN codenav_uploads u ON u.id = v.upload_id \
             WHERE v.repository_id = $1 AND v.commit_sha = $2 AND starts_with($3, u.root) \
             ORDER BY v.position, u.id"
        ))
        .bind(repository_id)
        .bind(commit)
        .bind(path)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(UploadRecord::from).collect())
    }

    async fn find_uploads_declaring_package(
        &self,
        package: &PackageInformation,
    ) -> Result<Vec<UploadRecord>, DbError> {
        let rows: Vec<UploadRow> = sqlx::query_as(&format!(
            "SELECT DISTINCT {UPLOAD_COLUMNS} \
             FROM codenav_packages p \
             JOIN codenav_uploads u ON u.id = p.upload_id \
             WHERE p.manager = $1 AND p.name = $2 AND p.version = $3 \
             ORDER BY u.id"
        ))
        .bind(&package.manager)
        .bind(&package.name)
        .bind(&package.version)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(UploadRecord::from).collect())
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
        if monikers.is_empty() {
            return Ok(ReferencingUploads::default());
        }

        let managers: Vec<&str> = monikers.iter().map(|m| m.package.manager.as_str()).collect();
        let names: Vec<&str> = monikers.iter().map(|m| m.package.name.as_str()).collect();
        let versions: Vec<&str> = monikers.iter().map(|m| m.package.version.as_str()).collect();

        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "WITH candidates AS ( \
                 SELECT DISTINCT r.upload_id \
                 FROM codenav_package_references r \
                 JOIN UNNEST($1::text[], $2::text[], $3::text[]) AS p(manager, name, version) \
                   ON r.manager = p.manager AND r.name = p.name AND r.version = p.version \
                 JOIN codenav_uploads u ON u.id = r.upload_id \
                 WHERE NOT (r.upload_id = ANY($4)) \
                   AND (u.repository_id <> $5 OR EXISTS ( \
                       SELECT 1 FROM codenav_commit_visibility v \
                       WHERE v.repository_id = $5 AND v.commit_sha = $6 AND v.upload_id = r.upload_id)) \
             ) \
             SELECT upload_id, COUNT(*) OVER () AS total \
             FROM candidates \
             ORDER BY upload_id \
             LIMIT $7 OFFSET $8",
        )
        .bind(&managers)
        .bind(&names)
        .bind(&versions)
        .bind(ignore_ids)
        .bind(repository_id)
        .bind(commit)
        .bind(bind_count(limit))
        .bind(bind_count(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

        let total = rows.first().map(|(_, total)| *total).unwrap_or_default();
        let ids: Vec<UploadId> = rows.into_iter().map(|(id, _)| id).collect();
        let seen = bind_count(offset).saturating_add(bind_count(ids.len()));
        Ok(ReferencingUploads {
            has_more: !ids.is_empty() && seen < total,
            ids,
        })
    }

    async fn get_uploads_by_ids(&self, ids: &[UploadId]) -> Result<Vec<UploadRecord>, DbError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<UploadRow> = sqlx::query_as(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM codenav_uploads u WHERE u.id = ANY($1) ORDER BY u.id"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(UploadRecord::from).collect())
    }
}
