//! Durable per-(subject, action) quota tracking.
//!
//! Concurrency control lives in the store's atomic upsert-increment: there is
//! no in-process lock, so several processes may share one store.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::time::timeout;
use tracing::{debug, error};

use crate::{
    activity::ActivityLog,
    config::{Config, QuotaRule},
    domain::{Action, QuotaKey, Subject},
    errors::Error,
    ports::{Collection, QuotaRecord, Store},
    Result,
};

/// Outcome of one metered attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allowed { count: u32, limit: u32 },
    Denied { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Whole seconds until the window reopens (rounded up), 0 when allowed.
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            Decision::Allowed { .. } => 0,
            Decision::Denied { retry_after } => {
                let secs = retry_after.as_secs();
                if retry_after.subsec_nanos() > 0 {
                    secs + 1
                } else {
                    secs
                }
            }
        }
    }

    /// User-facing denial text for one-shot commands.
    pub fn denial_message(&self) -> Option<String> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Denied { .. } => Some(format!(
                "⚠️ Rate limit exceeded. Please wait {} seconds before trying again.",
                self.retry_after_secs()
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct QuotaSettings {
    /// Bound on every store call.
    pub store_timeout: Duration,
    /// Retry hint returned when a gated check fails closed.
    pub fail_closed_retry: Duration,
    /// Consecutive store failures before a `fatal` escalation.
    pub escalate_after: u32,
}

impl QuotaSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            store_timeout: cfg.store_timeout,
            fail_closed_retry: cfg.fail_closed_retry,
            escalate_after: cfg.store_failure_escalation.max(1),
        }
    }
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct QuotaTracker {
    store: Arc<dyn Store>,
    log: ActivityLog,
    settings: QuotaSettings,
    consecutive_failures: AtomicU32,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn Store>, log: ActivityLog, settings: QuotaSettings) -> Self {
        Self {
            store,
            log,
            settings,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Record one attempt and decide whether it is permitted.
    ///
    /// The attempt is counted even when denied. Fails with `StoreUnavailable`
    /// if the store errors or does not answer within the configured timeout.
    pub async fn check_and_record(
        &self,
        subject: &Subject,
        action: &Action,
        limit: u32,
        window: Duration,
    ) -> Result<Decision> {
        let key = QuotaKey::new(subject.clone(), action.clone());
        let record = match timeout(
            self.settings.store_timeout,
            self.store.upsert_increment(&key, limit, window),
        )
        .await
        {
            Ok(Ok(record)) => record,
            Ok(Err(e)) => return Err(self.store_failed(subject, e).await),
            Err(_) => {
                let e = Error::StoreUnavailable(format!(
                    "quota store did not answer within {:?}",
                    self.settings.store_timeout
                ));
                return Err(self.store_failed(subject, e).await);
            }
        };
        self.consecutive_failures.store(0, Ordering::SeqCst);

        let decision = decide(&record);
        debug!(
            subject = %subject,
            action = %action,
            count = record.count,
            limit,
            allowed = decision.is_allowed(),
            "quota checked"
        );
        Ok(decision)
    }

    pub async fn check_rule(&self, subject: &Subject, rule: &QuotaRule) -> Result<Decision> {
        self.check_and_record(subject, &rule.action, rule.limit, rule.window)
            .await
    }

    /// Fail-closed variant for actions with external side effects: an
    /// unreachable store is treated as a denial.
    pub async fn check_gated(&self, subject: &Subject, rule: &QuotaRule) -> Decision {
        match self.check_rule(subject, rule).await {
            Ok(d) => d,
            Err(e) => {
                debug!(subject = %subject, action = %rule.action, "quota check failed closed: {e}");
                Decision::Denied {
                    retry_after: self.settings.fail_closed_retry,
                }
            }
        }
    }

    /// Current record for (subject, action), if any attempt was ever made.
    pub async fn status(&self, subject: &Subject, action: &Action) -> Result<Option<QuotaRecord>> {
        let key = QuotaKey::new(subject.clone(), action.clone());
        let doc = timeout(
            self.settings.store_timeout,
            self.store.find_one(Collection::Quotas, &key.document_key()),
        )
        .await
        .map_err(|_| Error::StoreUnavailable("quota status read timed out".to_string()))??;
        match doc {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    async fn store_failed(&self, subject: &Subject, err: Error) -> Error {
        let err = match err {
            e @ Error::StoreUnavailable(_) => e,
            other => Error::StoreUnavailable(other.to_string()),
        };
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures == self.settings.escalate_after {
            error!(failures, "quota store unreachable across repeated calls");
            self.log
                .fatal(
                    subject,
                    &format!("quota store unreachable for {failures} consecutive calls: {err}"),
                    Some("quota"),
                )
                .await;
        }
        err
    }
}

fn decide(record: &QuotaRecord) -> Decision {
    if record.count <= record.limit {
        Decision::Allowed {
            count: record.count,
            limit: record.limit,
        }
    } else {
        Decision::Denied {
            retry_after: record.remaining_window(),
        }
    }
}
