use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::sleep;

use crate::{
    clock::{Clock, SystemClock},
    domain::QuotaKey,
    errors::Error,
    ports::{Collection, QuotaRecord, Store},
    Result,
};

use super::next_quota_record;

/// In-process `Store` for tests and single-process development.
///
/// Every operation runs under one lock, so `upsert_increment` is atomic with
/// respect to other callers of the same instance.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    latency: Mutex<Duration>,
}

#[derive(Default)]
struct MemoryState {
    quotas: HashMap<String, QuotaRecord>,
    documents: HashMap<Collection, BTreeMap<u64, StoredDocument>>,
    next_id: u64,
}

struct StoredDocument {
    created_at: DateTime<Utc>,
    body: serde_json::Value,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(MemoryState::default()),
            unavailable: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Simulate an unreachable backend: every call fails with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay applied before every call (to exercise caller timeouts).
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|p| p.into_inner()) = latency;
    }

    /// All documents of a collection, oldest first.
    pub fn documents(&self, collection: Collection) -> Vec<serde_json::Value> {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.documents
            .get(&collection)
            .map(|docs| docs.values().map(|d| d.body.clone()).collect())
            .unwrap_or_default()
    }

    async fn enter(&self) -> Result<()> {
        let latency = *self.latency.lock().unwrap_or_else(|p| p.into_inner());
        if !latency.is_zero() {
            sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::StoreUnavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_increment(
        &self,
        key: &QuotaKey,
        limit: u32,
        window: Duration,
    ) -> Result<QuotaRecord> {
        self.enter().await?;
        let now = self.clock.now();
        let mut st = self.lock()?;
        let doc_key = key.document_key();
        let next = next_quota_record(st.quotas.get(&doc_key), key, limit, window, now);
        st.quotas.insert(doc_key, next.clone());
        Ok(next)
    }

    async fn insert(&self, collection: Collection, document: serde_json::Value) -> Result<u64> {
        self.enter().await?;
        if collection == Collection::Quotas {
            return Err(Error::Config(
                "quota documents are written through upsert_increment".to_string(),
            ));
        }
        let created_at = self.clock.now();
        let mut st = self.lock()?;
        st.next_id += 1;
        let id = st.next_id;
        st.documents.entry(collection).or_default().insert(
            id,
            StoredDocument {
                created_at,
                body: document,
            },
        );
        Ok(id)
    }

    async fn find_one(
        &self,
        collection: Collection,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        self.enter().await?;
        let st = self.lock()?;
        if collection == Collection::Quotas {
            return match st.quotas.get(key) {
                Some(rec) => Ok(Some(serde_json::to_value(rec)?)),
                None => Ok(None),
            };
        }
        let Ok(id) = key.parse::<u64>() else {
            return Ok(None);
        };
        Ok(st
            .documents
            .get(&collection)
            .and_then(|docs| docs.get(&id))
            .map(|d| d.body.clone()))
    }

    async fn prune(&self, collection: Collection, older_than: DateTime<Utc>) -> Result<u64> {
        self.enter().await?;
        let mut st = self.lock()?;
        let Some(docs) = st.documents.get_mut(&collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|_, d| d.created_at >= older_than);
        Ok((before - docs.len()) as u64)
    }
}
