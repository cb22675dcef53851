//! Hexagonal ports consumed by the core.
//!
//! The forum reader/writer, the completion service and the persistent store
//! live behind these traits and are implemented in adapter crates.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{Action, QuotaKey, Subject},
    Result,
};

/// Per-(subject, action) attempt counter, as persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub subject: Subject,
    pub action: Action,
    pub count: u32,
    pub window_start: DateTime<Utc>,
    pub window_length: Duration,
    pub limit: u32,
    /// Store timestamp of the increment that produced this record.
    pub observed_at: DateTime<Utc>,
}

impl QuotaRecord {
    /// Time left in the current window as seen by the store.
    pub fn remaining_window(&self) -> Duration {
        let elapsed = (self.observed_at - self.window_start)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.window_length.saturating_sub(elapsed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Collection {
    Quotas,
    Activity,
    Errors,
}

impl Collection {
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Quotas => "quotas",
            Collection::Activity => "activity",
            Collection::Errors => "errors",
        }
    }
}

/// Persistent document store.
///
/// `upsert_increment` must be a single atomic step: load-or-create, reset the
/// window when `now - window_start > window`, increment, return the result.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_increment(
        &self,
        key: &QuotaKey,
        limit: u32,
        window: Duration,
    ) -> Result<QuotaRecord>;

    /// Append a document; returns the store-assigned id.
    async fn insert(&self, collection: Collection, document: serde_json::Value) -> Result<u64>;

    /// Point read. Quota documents are keyed by `subject:action`, log documents by id.
    async fn find_one(
        &self,
        collection: Collection,
        key: &str,
    ) -> Result<Option<serde_json::Value>>;

    /// Delete log documents older than `older_than`; returns the number removed.
    async fn prune(&self, collection: Collection, older_than: DateTime<Utc>) -> Result<u64>;
}

/// A forum/channel item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Content {
    pub id: String,
    pub title: String,
    pub body: String,
    pub score: i64,
}

/// A new top-level item to publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Draft {
    pub title: String,
    pub body: String,
}

/// Forum/channel reader.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Newest (or trending) items, at most `limit`.
    async fn latest(&self, subject: &Subject, limit: usize) -> Result<Vec<Content>>;

    /// Community rules for the subject, if the platform exposes any.
    async fn rules(&self, _subject: &Subject) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Language-model caller.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

/// Forum/channel writer.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, subject: &Subject, draft: &Draft) -> Result<String>;
    async fn reply(&self, content_id: &str, text: &str) -> Result<String>;
}
