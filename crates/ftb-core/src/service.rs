//! Command-handler facade: quota-gated one-shot commands and loop control.

use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use tracing::info;

use crate::{
    activity::ActivityLog,
    config::{Config, QuotaRule},
    domain::{Action, JobKind, Subject},
    errors::Error,
    jobs::{JobHandle, JobRegistry},
    quota::Decision,
    steps::{Collaborators, CommentLoop, PublishLoop},
    Result,
};

/// What the command handler should tell the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Denied(String),
    Done(String),
    Failed(String),
}

pub struct AutomationService {
    rules: BTreeMap<String, QuotaRule>,
    comment_interval: Duration,
    min_publish_interval: Duration,
    registry: Arc<JobRegistry>,
    log: ActivityLog,
    deps: Collaborators,
}

impl AutomationService {
    pub fn new(
        config: &Config,
        registry: Arc<JobRegistry>,
        log: ActivityLog,
        deps: Collaborators,
    ) -> Self {
        Self {
            rules: config.quotas.clone(),
            comment_interval: config.comment_interval,
            min_publish_interval: config.min_publish_interval,
            registry,
            log,
            deps,
        }
    }

    fn rule(&self, action: &str) -> Result<QuotaRule> {
        self.rules
            .get(action)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no quota configured for action {action}")))
    }

    async fn gate(&self, owner: &Subject, rule: &QuotaRule) -> Option<Reply> {
        let decision = self.deps.quotas.check_gated(owner, rule).await;
        if let Decision::Denied { .. } = decision {
            info!(owner = %owner, action = %rule.action, "command denied by quota");
        }
        decision.denial_message().map(Reply::Denied)
    }

    /// Run a metered one-shot command for `owner`.
    pub async fn one_shot<F, Fut>(&self, owner: &Subject, action: &str, op: F) -> Result<Reply>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let rule = self.rule(action)?;
        if let Some(denied) = self.gate(owner, &rule).await {
            return Ok(denied);
        }

        match op().await {
            Ok(text) => {
                self.log.activity(owner, action, &text).await;
                Ok(Reply::Done(text))
            }
            Err(e) => {
                self.log.error(owner, &e, Some(action)).await;
                Ok(Reply::Failed(format!("❌ Error: {e}")))
            }
        }
    }

    pub async fn start_auto_comment(&self, owner: &Subject, subject: &Subject) -> Result<Reply> {
        let rule = self.rule(Action::AUTO_COMMENT)?;
        if let Some(denied) = self.gate(owner, &rule).await {
            return Ok(denied);
        }

        let step = CommentLoop::new(owner.clone(), rule, self.deps.clone()).metered_at_start();
        let interval = self.comment_interval;
        self.registry
            .start(subject.clone(), JobKind::CommentLoop, interval, Arc::new(step))
            .await?;

        let minutes = interval.as_secs() / 60;
        self.log
            .activity(
                owner,
                JobKind::CommentLoop.as_str(),
                &format!("started auto-commenting in {subject} every {minutes} minutes"),
            )
            .await;
        Ok(Reply::Done(format!(
            "✅ Started auto-commenting in {subject} every {minutes} minutes"
        )))
    }

    pub async fn start_auto_post(
        &self,
        owner: &Subject,
        subject: &Subject,
        interval_minutes: u64,
    ) -> Result<Reply> {
        let interval = Duration::from_secs(interval_minutes.saturating_mul(60));
        if interval < self.min_publish_interval {
            return Err(Error::Config(format!(
                "minimum auto-post interval is {} minutes",
                self.min_publish_interval.as_secs() / 60
            )));
        }

        let rule = self.rule(Action::AUTO_POST)?;
        if let Some(denied) = self.gate(owner, &rule).await {
            return Ok(denied);
        }

        let step = PublishLoop::new(owner.clone(), rule, self.deps.clone()).metered_at_start();
        self.registry
            .start(subject.clone(), JobKind::PublishLoop, interval, Arc::new(step))
            .await?;

        self.log
            .activity(
                owner,
                JobKind::PublishLoop.as_str(),
                &format!("started auto-posting in {subject} every {interval_minutes} minutes"),
            )
            .await;
        Ok(Reply::Done(format!(
            "✅ Started auto-posting in {subject} every {interval_minutes} minutes"
        )))
    }

    pub async fn stop_auto(
        &self,
        owner: &Subject,
        subject: &Subject,
        kind: JobKind,
    ) -> Result<Reply> {
        let handle = self.registry.stop(subject, kind).await?;
        self.log
            .activity(
                owner,
                kind.as_str(),
                &format!(
                    "stopped {kind} in {subject} after {} iterations",
                    handle.iterations()
                ),
            )
            .await;
        Ok(Reply::Done(format!("🛑 Stopped {kind} in {subject}")))
    }

    pub async fn jobs(&self) -> Vec<JobHandle> {
        self.registry.list().await
    }
}
