use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::Action, errors::Error, Result};

/// Permitted attempts per window for one action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaRule {
    pub action: Action,
    pub limit: u32,
    pub window: Duration,
}

impl QuotaRule {
    pub fn new(action: &str, limit: u32, window: Duration) -> Self {
        Self {
            action: Action::new(action),
            limit,
            window,
        }
    }
}

/// Retry settings for outbound calls (see `backoff::RetryPolicy`).
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub max_elapsed: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_elapsed: Duration::from_secs(60),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Typed configuration, loaded from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Store
    pub database_path: PathBuf,
    pub store_timeout: Duration,
    pub store_failure_escalation: u32,
    pub fail_closed_retry: Duration,

    // Quotas
    pub quotas: BTreeMap<String, QuotaRule>,

    // Recurring jobs
    pub comment_interval: Duration,
    pub min_publish_interval: Duration,

    // Outbound retries
    pub retry: RetryConfig,

    // Retention
    pub retention: Duration,
    pub retention_interval: Duration,

    // Activity log
    pub activity_mirror_path: Option<PathBuf>,

    // Completion service
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub openrouter_base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("ftb.sqlite3"),
            store_timeout: Duration::from_millis(2000),
            store_failure_escalation: 3,
            fail_closed_retry: Duration::from_secs(60),
            quotas: default_quotas(),
            comment_interval: Duration::from_secs(1200),
            min_publish_interval: Duration::from_secs(30 * 60),
            retry: RetryConfig::default(),
            retention: Duration::from_secs(30 * 86_400),
            retention_interval: Duration::from_secs(86_400),
            activity_mirror_path: None,
            openrouter_api_key: None,
            openrouter_model: "mistralai/mistral-7b-instruct".to_string(),
            openrouter_base_url: "https://openrouter.ai/api/v1".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).and_then(non_empty);

        let database_path = get("FTB_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);
        let store_timeout = parse_u64(&get, "FTB_STORE_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.store_timeout);
        let store_failure_escalation = parse_u64(&get, "FTB_STORE_FAILURE_ESCALATION")?
            .map(|v| v.min(u32::MAX as u64) as u32)
            .unwrap_or(defaults.store_failure_escalation)
            .max(1);
        let fail_closed_retry = parse_u64(&get, "FTB_FAIL_CLOSED_RETRY_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.fail_closed_retry);

        // Quota table: defaults, each overridable with FTB_QUOTA_<ACTION>=limit/window_secs.
        let mut quotas = defaults.quotas;
        for rule in quotas.values_mut() {
            let var = format!("FTB_QUOTA_{}", rule.action.as_str().to_uppercase());
            if let Some(raw) = get(var.as_str()) {
                let (limit, window) = parse_quota_override(&var, &raw)?;
                rule.limit = limit;
                rule.window = window;
            }
        }

        let comment_interval = parse_u64(&get, "FTB_COMMENT_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.comment_interval);
        let min_publish_interval = parse_scaled_secs(&get, "FTB_MIN_PUBLISH_INTERVAL_MINS", 60)?
            .unwrap_or(defaults.min_publish_interval);

        let retry = RetryConfig {
            max_attempts: parse_u64(&get, "FTB_RETRY_MAX_ATTEMPTS")?
                .map(|v| v.min(u32::MAX as u64) as u32)
                .unwrap_or(defaults.retry.max_attempts),
            max_elapsed: parse_u64(&get, "FTB_RETRY_MAX_ELAPSED_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry.max_elapsed),
            base_delay: parse_u64(&get, "FTB_RETRY_BASE_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            max_delay: parse_u64(&get, "FTB_RETRY_MAX_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_delay),
        };
        if retry.max_attempts == 0 {
            return Err(Error::Config(
                "FTB_RETRY_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let retention = parse_scaled_secs(&get, "FTB_RETENTION_DAYS", 86_400)?
            .unwrap_or(defaults.retention);
        let retention_interval = parse_u64(&get, "FTB_RETENTION_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.retention_interval);

        let activity_mirror_path = get("FTB_ACTIVITY_MIRROR_PATH").map(PathBuf::from);

        let openrouter_api_key = get("OPENROUTER_API_KEY");
        let openrouter_model = get("OPENROUTER_MODEL").unwrap_or(defaults.openrouter_model);
        let openrouter_base_url =
            get("OPENROUTER_BASE_URL").unwrap_or(defaults.openrouter_base_url);

        Ok(Self {
            database_path,
            store_timeout,
            store_failure_escalation,
            fail_closed_retry,
            quotas,
            comment_interval,
            min_publish_interval,
            retry,
            retention,
            retention_interval,
            activity_mirror_path,
            openrouter_api_key,
            openrouter_model,
            openrouter_base_url,
        })
    }

    pub fn quota(&self, action: &str) -> Option<&QuotaRule> {
        self.quotas.get(action)
    }
}

/// Built-in quota table.
pub fn default_quotas() -> BTreeMap<String, QuotaRule> {
    let hour = Duration::from_secs(3600);
    [
        QuotaRule::new(Action::FORUM_POST, 5, hour),
        QuotaRule::new(Action::AUTO_COMMENT, 10, hour),
        QuotaRule::new(Action::VOICE_TO_TEXT, 20, hour),
        QuotaRule::new(Action::AUTO_POST, 3, hour),
    ]
    .into_iter()
    .map(|r| (r.action.as_str().to_string(), r))
    .collect()
}

fn parse_quota_override(var: &str, raw: &str) -> Result<(u32, Duration)> {
    let invalid =
        || Error::Config(format!("{var} must look like <limit>/<window_secs>, got {raw:?}"));
    let (limit, window) = raw.split_once('/').ok_or_else(invalid)?;
    let limit = limit.trim().parse::<u32>().map_err(|_| invalid())?;
    let window = window.trim().parse::<u64>().map_err(|_| invalid())?;
    if window == 0 {
        return Err(invalid());
    }
    Ok((limit, Duration::from_secs(window)))
}

fn parse_u64(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    let Some(raw) = get(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got {raw:?}")))
}

/// A count of `unit_secs`-long units (minutes, days) as a duration.
fn parse_scaled_secs(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    unit_secs: u64,
) -> Result<Option<Duration>> {
    let Some(count) = parse_u64(get, key)? else {
        return Ok(None);
    };
    count
        .checked_mul(unit_secs)
        .map(|secs| Some(Duration::from_secs(secs)))
        .ok_or_else(|| Error::Config(format!("{key} is too large: {count}")))
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
