//! Append-only activity and error records.
//!
//! Records go to the store (`activity` / `errors` collections) for the external
//! monitor, and optionally to a JSONL mirror file. Writing a record never fails
//! the caller: a store outage while logging is reported through `tracing` only.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{
    domain::Subject,
    errors::Error,
    ports::{Collection, Store},
    Result,
};

const MAX_TEXT: usize = 500;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub subject: Subject,
    pub kind: String,
    pub message: String,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub subject: Subject,
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub timestamp: String,
}

impl ActivityRecord {
    pub fn new(subject: &Subject, kind: &str, message: &str) -> Self {
        Self {
            subject: subject.clone(),
            kind: kind.to_string(),
            message: truncate_text(message, MAX_TEXT),
            timestamp: iso_timestamp(Utc::now()),
        }
    }
}

impl ErrorRecord {
    pub fn new(subject: &Subject, kind: &str, message: &str, context: Option<&str>) -> Self {
        Self {
            subject: subject.clone(),
            kind: kind.to_string(),
            message: truncate_text(message, MAX_TEXT),
            context: context.map(|c| truncate_text(c, MAX_TEXT)),
            timestamp: iso_timestamp(Utc::now()),
        }
    }

    pub fn from_error(subject: &Subject, err: &Error, context: Option<&str>) -> Self {
        Self::new(subject, err.label(), &err.to_string(), context)
    }
}

#[derive(Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum MirrorLine<'a> {
    Activity(&'a ActivityRecord),
    Error(&'a ErrorRecord),
}

/// Activity/error log handle. Cheap to clone.
#[derive(Clone)]
pub struct ActivityLog {
    store: Arc<dyn Store>,
    mirror: Option<Arc<Mutex<PathBuf>>>,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            mirror: None,
        }
    }

    /// Also append every record as one JSON line to `path`.
    pub fn with_mirror(mut self, path: impl Into<PathBuf>) -> Self {
        self.mirror = Some(Arc::new(Mutex::new(path.into())));
        self
    }

    pub async fn activity(&self, subject: &Subject, kind: &str, message: &str) {
        let record = ActivityRecord::new(subject, kind, message);
        info!(subject = %record.subject, kind = %record.kind, "{}", record.message);
        self.mirror_line(MirrorLine::Activity(&record));
        self.persist(Collection::Activity, serde_json::to_value(&record))
            .await;
    }

    pub async fn error(&self, subject: &Subject, err: &Error, context: Option<&str>) {
        self.write_error(ErrorRecord::from_error(subject, err, context))
            .await;
    }

    /// Record a `fatal` failure (crashed job, store escalation).
    pub async fn fatal(&self, subject: &Subject, message: &str, context: Option<&str>) {
        self.write_error(ErrorRecord::new(subject, "fatal", message, context))
            .await;
    }

    pub async fn write_error(&self, record: ErrorRecord) {
        if record.kind == "fatal" {
            error!(subject = %record.subject, kind = %record.kind, "{}", record.message);
        } else {
            warn!(subject = %record.subject, kind = %record.kind, "{}", record.message);
        }
        self.mirror_line(MirrorLine::Error(&record));
        self.persist(Collection::Errors, serde_json::to_value(&record))
            .await;
    }

    async fn persist(
        &self,
        collection: Collection,
        document: std::result::Result<serde_json::Value, serde_json::Error>,
    ) {
        let result = match document {
            Ok(doc) => self.store.insert(collection, doc).await.map(|_| ()),
            Err(e) => Err(Error::Json(e)),
        };
        if let Err(e) = result {
            error!(collection = collection.as_str(), "failed to persist log record: {e}");
        }
    }

    fn mirror_line(&self, line: MirrorLine<'_>) {
        let Some(mirror) = &self.mirror else {
            return;
        };
        let path = mirror.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = append_json_line(&path, &line) {
            error!(path = %path.display(), "failed to mirror log record: {e}");
        }
    }
}

fn append_json_line(path: &Path, line: &impl Serialize) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let text = serde_json::to_string(line)?;
    writeln!(file, "{text}")?;
    Ok(())
}

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

fn iso_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}
