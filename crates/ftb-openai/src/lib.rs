//! OpenRouter adapter (chat completions).
//!
//! Uses the OpenAI-compatible `chat/completions` endpoint. HTTP and transport
//! failures are classified into transient/permanent errors so callers can wrap
//! `complete` in the backoff executor.

use std::time::Duration;

use async_trait::async_trait;
use ftb_core::{
    config::Config,
    errors::{Error, FailureKind},
    ports::CompletionService,
    Result,
};
use reqwest::{header::RETRY_AFTER, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct OpenRouterClient {
    api_key: String,
    pub model: String,
    pub base_url: String,
    http: reqwest::Client,
}

impl OpenRouterClient {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("http client build failed: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// `None` when no API key is configured.
    pub fn from_config(cfg: &Config) -> Result<Option<Self>> {
        match &cfg.openrouter_api_key {
            Some(key) => Ok(Some(Self::new(
                key.clone(),
                cfg.openrouter_model.clone(),
                cfg.openrouter_base_url.clone(),
            )?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CompletionService for OpenRouterClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
        });

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after.as_deref(), &body));
        }

        let v: Value = resp.json().await.map_err(|e| {
            Error::permanent(FailureKind::Malformed, format!("completion json error: {e}"))
        })?;
        let text = extract_content(&v)?;
        debug!(model = %self.model, chars = text.len(), "completion received");
        Ok(text)
    }
}

/// Map a non-success HTTP status to a transient or permanent error.
pub fn classify_status(status: StatusCode, retry_after: Option<&str>, body: &str) -> Error {
    let snippet: String = body.chars().take(200).collect();
    let message = format!("completion request failed: {status} {snippet}");
    match status.as_u16() {
        429 => Error::rate_limited(message, retry_after.and_then(parse_retry_after)),
        408 => Error::transient(FailureKind::Timeout, message),
        500..=599 => Error::transient(FailureKind::ServerError, message),
        400 | 422 => Error::permanent(FailureKind::BadRequest, message),
        401 | 403 => Error::permanent(FailureKind::Unauthorized, message),
        404 => Error::permanent(FailureKind::NotFound, message),
        _ => Error::permanent(FailureKind::Other, message),
    }
}

fn classify_transport(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::transient(FailureKind::Timeout, format!("completion request timed out: {e}"))
    } else if e.is_builder() {
        Error::permanent(FailureKind::BadRequest, format!("completion request invalid: {e}"))
    } else {
        Error::transient(FailureKind::Connection, format!("completion request error: {e}"))
    }
}

/// `Retry-After` in delta-seconds form; HTTP dates are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn extract_content(v: &Value) -> Result<String> {
    v.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::permanent(
                FailureKind::Malformed,
                "completion response has no choices[0].message.content",
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_carries_retry_after() {
        let e = classify_status(StatusCode::TOO_MANY_REQUESTS, Some("7"), "slow down");
        assert_eq!(e.failure_kind(), FailureKind::RateLimited);
        assert_eq!(e.retry_after(), Some(Duration::from_secs(7)));

        let e = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some("Wed, 21 Oct 2015 07:28:00 GMT"),
            "",
        );
        assert_eq!(e.failure_kind(), FailureKind::RateLimited);
        assert_eq!(e.retry_after(), None);
    }

    #[test]
    fn statuses_map_to_failure_kinds() {
        let cases = [
            (StatusCode::REQUEST_TIMEOUT, FailureKind::Timeout),
            (StatusCode::BAD_GATEWAY, FailureKind::ServerError),
            (StatusCode::SERVICE_UNAVAILABLE, FailureKind::ServerError),
            (StatusCode::BAD_REQUEST, FailureKind::BadRequest),
            (StatusCode::UNPROCESSABLE_ENTITY, FailureKind::BadRequest),
            (StatusCode::UNAUTHORIZED, FailureKind::Unauthorized),
            (StatusCode::FORBIDDEN, FailureKind::Unauthorized),
            (StatusCode::NOT_FOUND, FailureKind::NotFound),
            (StatusCode::IM_A_TEAPOT, FailureKind::Other),
        ];
        for (status, kind) in cases {
            assert_eq!(classify_status(status, None, "").failure_kind(), kind, "{status}");
        }
    }

    #[test]
    fn only_transient_statuses_are_transient() {
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, None, ""),
            Error::Transient { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, ""),
            Error::Permanent { .. }
        ));
    }

    #[test]
    fn content_is_extracted_from_first_choice() {
        let v = json!({"choices": [{"message": {"role": "assistant", "content": "hi there"}}]});
        assert_eq!(extract_content(&v).unwrap(), "hi there");

        let err = extract_content(&json!({"choices": []})).unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::Malformed);
        let err = extract_content(&json!({"error": {"message": "nope"}})).unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::Malformed);
    }

    #[test]
    fn from_config_requires_api_key() {
        let mut cfg = Config::default();
        assert!(OpenRouterClient::from_config(&cfg).unwrap().is_none());

        cfg.openrouter_api_key = Some("sk-test".to_string());
        cfg.openrouter_base_url = "https://example.invalid/api/v1/".to_string();
        let client = OpenRouterClient::from_config(&cfg).unwrap().unwrap();
        assert_eq!(client.base_url, "https://example.invalid/api/v1");
        assert_eq!(client.model, cfg.openrouter_model);
    }
}
