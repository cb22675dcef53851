//! Store helpers shared by adapters.

pub mod memory;

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{domain::QuotaKey, ports::QuotaRecord};

/// Whether a window that started at `window_start` has expired at `now`.
///
/// Clock drift that puts `now` before `window_start` counts as zero elapsed.
pub fn window_expired(window_start: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    let elapsed = (now - window_start).to_std().unwrap_or(Duration::ZERO);
    elapsed > window
}

/// The record produced by one upsert-increment at `now`.
pub fn next_quota_record(
    existing: Option<&QuotaRecord>,
    key: &QuotaKey,
    limit: u32,
    window: Duration,
    now: DateTime<Utc>,
) -> QuotaRecord {
    let (count, window_start) = match existing {
        Some(rec) if !window_expired(rec.window_start, now, window) => {
            (rec.count.saturating_add(1), rec.window_start)
        }
        _ => (1, now),
    };

    QuotaRecord {
        subject: key.subject.clone(),
        action: key.action.clone(),
        count,
        window_start,
        window_length: window,
        limit,
        observed_at: now,
    }
}
