//! Periodic pruning of old activity and error records.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;

use crate::{
    clock::Clock,
    errors::Error,
    jobs::{JobStep, StepContext, StepOutcome},
    ports::{Collection, Store},
    Result,
};

/// Subject under which the maintenance job is registered.
pub const MAINTENANCE_SUBJECT: &str = "store";

pub struct RetentionStep {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl RetentionStep {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self {
            store,
            clock,
            retention,
        }
    }
}

#[async_trait]
impl JobStep for RetentionStep {
    async fn run(&self, _ctx: &StepContext) -> Result<StepOutcome> {
        let retention = ChronoDuration::from_std(self.retention)
            .map_err(|e| Error::Config(format!("retention out of range: {e}")))?;
        let cutoff = self.clock.now() - retention;

        let activity = self.store.prune(Collection::Activity, cutoff).await?;
        let errors = self.store.prune(Collection::Errors, cutoff).await?;
        if activity + errors == 0 {
            return Ok(StepOutcome::Skipped("nothing to prune".to_string()));
        }
        Ok(StepOutcome::Completed(format!(
            "pruned {activity} activity and {errors} error records older than {}",
            cutoff.format("%Y-%m-%d %H:%M")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, domain::JobKind, domain::Subject, store::memory::MemoryStore};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn prunes_only_records_past_retention() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        store
            .insert(Collection::Activity, json!({"message": "old"}))
            .await
            .unwrap();
        store
            .insert(Collection::Errors, json!({"message": "old error"}))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(10 * 86_400));
        store
            .insert(Collection::Activity, json!({"message": "recent"}))
            .await
            .unwrap();

        let week = Duration::from_secs(7 * 86_400);
        let step = RetentionStep::new(store.clone(), clock.clone(), week);
        let ctx = StepContext {
            subject: Subject::new(MAINTENANCE_SUBJECT),
            kind: JobKind::Maintenance,
            iteration: 1,
        };

        let out = step.run(&ctx).await.unwrap();
        assert!(
            matches!(out, StepOutcome::Completed(ref m) if m.starts_with("pruned 1 activity and 1 error"))
        );
        let left = store.documents(Collection::Activity);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0]["message"], "recent");
        assert!(store.documents(Collection::Errors).is_empty());

        assert!(matches!(step.run(&ctx).await.unwrap(), StepOutcome::Skipped(_)));
    }
}
