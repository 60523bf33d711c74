use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::try_join_all;
use lru::LruCache;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::db::models::{UploadId, UploadRecord};
use crate::db::{DbError, UploadDirectory};

type Slot = Arc<OnceCell<UploadRecord>>;

struct Slots {
    lru: LruCache<UploadId, Slot>,
    /// Slots created but not filled yet. A fetch in flight keeps its slot
    /// alive here even after the LRU evicts it.
    pending: HashMap<UploadId, Weak<OnceCell<UploadRecord>>>,
}

/// Process-wide cache of upload records.
///
/// Each id owns one slot; concurrent hydrations of the same id wait on that
/// slot, so the directory sees a single fetch. The ids missing from one
/// hydration are fetched with one directory call.
pub struct UploadCache {
    slots: Mutex<Slots>,
}

impl UploadCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: Mutex::new(Slots {
                lru: LruCache::new(capacity),
                pending: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn slot(&self, id: UploadId) -> Slot {
        let mut slots = self.lock();
        if let Some(slot) = slots.lru.get(&id) {
            return slot.clone();
        }

        let slot = slots
            .pending
            .get(&id)
            .and_then(Weak::upgrade)
            .unwrap_or_else(|| Arc::new(OnceCell::new()));
        slots.pending.retain(|_, weak| weak.strong_count() > 0);
        slots.pending.insert(id, Arc::downgrade(&slot));
        slots.lru.put(id, slot.clone());
        slot
    }

    fn settle(&self, id: UploadId) {
        self.lock().pending.remove(&id);
    }

    /// Stores records that arrived through another directory call.
    pub fn prime<'a>(&self, records: impl IntoIterator<Item = &'a UploadRecord>) {
        let mut slots = self.lock();
        for record in records {
            let ready = slots
                .lru
                .peek(&record.id)
                .is_some_and(|slot| slot.initialized());
            if !ready {
                slots
                    .lru
                    .put(record.id, Arc::new(OnceCell::new_with(Some(record.clone()))));
            }
        }
    }

    pub fn cached(&self, id: UploadId) -> Option<UploadRecord> {
        self.lock().lru.get(&id).and_then(|slot| slot.get().cloned())
    }

    /// Records for `ids`, fetching the ones not cached yet in a single
    /// directory call. Ids the directory does not know are left out of the
    /// result.
    pub async fn hydrate(
        &self,
        directory: &dyn UploadDirectory,
        ids: &[UploadId],
    ) -> Result<HashMap<UploadId, UploadRecord>, DbError> {
        let mut distinct = HashSet::new();
        let slots: Vec<(UploadId, Slot)> = ids
            .iter()
            .copied()
            .filter(|id| distinct.insert(*id))
            .map(|id| (id, self.slot(id)))
            .collect();
        let missing: Vec<UploadId> = slots
            .iter()
            .filter(|(_, slot)| !slot.initialized())
            .map(|(id, _)| *id)
            .collect();

        let batch: OnceCell<HashMap<UploadId, UploadRecord>> = OnceCell::new();
        let fetches = slots.into_iter().map(|(id, slot)| {
            let batch = &batch;
            let missing = &missing;
            async move {
                let fetched = slot
                    .get_or_try_init(|| async move {
                        match batch.get_or_try_init(|| fetch_many(directory, missing)).await {
                            Ok(records) => records.get(&id).cloned().ok_or(None),
                            Err(err) => Err(Some(err)),
                        }
                    })
                    .await;
                match fetched {
                    Ok(record) => {
                        let record = record.clone();
                        self.settle(id);
                        Ok(Some(record))
                    }
                    Err(None) => Ok(None),
                    Err(Some(err)) => Err(err),
                }
            }
        });

        let records = try_join_all(fetches).await?;
        Ok(records
            .into_iter()
            .flatten()
            .map(|record| (record.id, record))
            .collect())
    }
}

async fn fetch_many(
    directory: &dyn UploadDirectory,
    ids: &[UploadId],
) -> Result<HashMap<UploadId, UploadRecord>, DbError> {
    debug!(
        stage = "hydrate",
        event = "hydrate.fetch",
        uploads = ids.len(),
        "fetching upload records"
    );
    let records = directory.get_uploads_by_ids(ids).await?;
    Ok(records
        .into_iter()
        .map(|record| (record.id, record))
        .collect())
}
