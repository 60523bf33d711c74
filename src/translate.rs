//! Position and range translation between commits, derived from the unified
//! diff of the file between the two commits.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use diffy::{Line, Patch};
use lru::LruCache;
use tracing::debug;

use crate::db::models::{Position, Range, RepositoryId};
use crate::db::{DbError, DiffTranslator};

const DEFAULT_HUNK_CACHE_CAPACITY: usize = 1024;

/// Source of unified diffs for one file between two commits.
#[async_trait]
pub trait CommitDiffer: Send + Sync {
    /// `None` when the file does not exist at `to_commit`; an empty string
    /// when the file is unchanged.
    async fn diff(
        &self,
        repository_id: RepositoryId,
        from_commit: &str,
        to_commit: &str,
        path: &str,
    ) -> Result<Option<String>, DbError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HunkLine {
    Context,
    Delete,
    Insert,
}

/// Hunk with one-based begin lines. For an empty side the begin line is the
/// line after the one the diff header names.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Hunk {
    old_begin: usize,
    old_len: usize,
    new_begin: usize,
    new_len: usize,
    lines: Vec<HunkLine>,
}

fn parse_hunks(patch_text: &str) -> Result<Vec<Hunk>, DbError> {
    if patch_text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let patch = Patch::from_str(patch_text).map_err(|e| DbError::Diff(e.to_string()))?;
    let mut hunks: Vec<Hunk> = patch
        .hunks()
        .iter()
        .map(|hunk| {
            let old = hunk.old_range();
            let new = hunk.new_range();
            Hunk {
                old_begin: if old.len() == 0 { old.start() + 1 } else { old.start() },
                old_len: old.len(),
                new_begin: if new.len() == 0 { new.start() + 1 } else { new.start() },
                new_len: new.len(),
                lines: hunk
                    .lines()
                    .iter()
                    .map(|line| match line {
                        Line::Context(_) => HunkLine::Context,
                        Line::Delete(_) => HunkLine::Delete,
                        Line::Insert(_) => HunkLine::Insert,
                    })
                    .collect(),
            }
        })
        .collect();
    hunks.sort_by_key(|hunk| hunk.old_begin);
    Ok(hunks)
}

/// Maps a one-based line of the old file onto the new file.
fn translate_line(hunks: &[Hunk], line: usize) -> Option<usize> {
    let Some(hunk) = hunks.iter().take_while(|h| h.old_begin <= line).last() else {
        return Some(line);
    };

    let old_end = hunk.old_begin + hunk.old_len;
    if line >= old_end {
        return Some(line + hunk.new_begin + hunk.new_len - old_end);
    }

    let mut old_line = hunk.old_begin;
    let mut new_line = hunk.new_begin;
    for kind in &hunk.lines {
        if *kind != HunkLine::Insert && old_line == line {
            return (*kind == HunkLine::Context).then_some(new_line);
        }
        if *kind != HunkLine::Insert {
            old_line += 1;
        }
        if *kind != HunkLine::Delete {
            new_line += 1;
        }
    }
    None
}

fn translate_position_with(hunks: &[Hunk], position: Position) -> Option<Position> {
    let line = translate_line(hunks, position.line as usize + 1)?;
    Some(Position::new(
        u32::try_from(line - 1).ok()?,
        position.character,
    ))
}

type DiffKey = (RepositoryId, String, String, String);

/// [`DiffTranslator`] over any [`CommitDiffer`], caching parsed hunks.
pub struct GitTreeTranslator<D> {
    differ: D,
    hunks: Mutex<LruCache<DiffKey, Option<Arc<Vec<Hunk>>>>>,
}

impl<D: CommitDiffer> GitTreeTranslator<D> {
    pub fn new(differ: D) -> Self {
        Self::with_capacity(differ, DEFAULT_HUNK_CACHE_CAPACITY)
    }

    pub fn with_capacity(differ: D, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            differ,
            hunks: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn differ(&self) -> &D {
        &self.differ
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<DiffKey, Option<Arc<Vec<Hunk>>>>> {
        match self.hunks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn hunks_for(
        &self,
        repository_id: RepositoryId,
        from_commit: &str,
        to_commit: &str,
        path: &str,
    ) -> Result<Option<Arc<Vec<Hunk>>>, DbError> {
        let key = (
            repository_id,
            from_commit.to_string(),
            to_commit.to_string(),
            path.to_string(),
        );
        if let Some(cached) = self.lock().get(&key) {
            return Ok(cached.clone());
        }

        let hunks = match self
            .differ
            .diff(repository_id, from_commit, to_commit, path)
            .await?
        {
            Some(text) => Some(Arc::new(parse_hunks(&text)?)),
            None => None,
        };
        debug!(
            stage = "translate",
            event = "translate.hunks.load",
            repository_id,
            from_commit,
            to_commit,
            path,
            hunk_count = hunks.as_ref().map(|h| h.len()),
            "loaded diff hunks"
        );
        self.lock().put(key, hunks.clone());
        Ok(hunks)
    }
}

#[async_trait]
impl<D: CommitDiffer> DiffTranslator for GitTreeTranslator<D> {
    async fn translate_position(
        &self,
        repository_id: RepositoryId,
        from_commit: &str,
        to_commit: &str,
        path: &str,
        position: Position,
    ) -> Result<Option<Position>, DbError> {
        if from_commit == to_commit {
            return Ok(Some(position));
        }
        let Some(hunks) = self
            .hunks_for(repository_id, from_commit, to_commit, path)
            .await?
        else {
            return Ok(None);
        };
        Ok(translate_position_with(&hunks, position))
    }

    async fn translate_range(
        &self,
        repository_id: RepositoryId,
        from_commit: &str,
        to_commit: &str,
        path: &str,
        range: Range,
    ) -> Result<Option<Range>, DbError> {
        if from_commit == to_commit {
            return Ok(Some(range));
        }
        let Some(hunks) = self
            .hunks_for(repository_id, from_commit, to_commit, path)
            .await?
        else {
            return Ok(None);
        };
        let start = translate_position_with(&hunks, range.start);
        let end = translate_position_with(&hunks, range.end);
        Ok(start.zip(end).map(|(start, end)| Range { start, end }))
    }
}
