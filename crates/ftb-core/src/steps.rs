//! Job steps for the auto-comment and auto-post loops.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    activity::truncate_text,
    backoff::BackoffExecutor,
    config::QuotaRule,
    domain::Subject,
    errors::{Error, FailureKind},
    jobs::{JobStep, StepContext, StepOutcome},
    ports::{CompletionService, Content, ContentSource, Draft, Publisher},
    quota::{Decision, QuotaTracker},
    Result,
};

const COMMENT_SYSTEM_PROMPT: &str =
    "Generate a relevant, concise Reddit comment that adds to the discussion.";
const POST_SYSTEM_PROMPT: &str = "You are a Reddit content creator who understands subreddit rules and creates engaging, compliant content.";

/// External collaborators shared by the loop steps.
#[derive(Clone)]
pub struct Collaborators {
    pub quotas: Arc<QuotaTracker>,
    pub source: Arc<dyn ContentSource>,
    pub completion: Arc<dyn CompletionService>,
    pub publisher: Arc<dyn Publisher>,
    pub executor: BackoffExecutor,
}

impl Collaborators {
    async fn gate(&self, owner: &Subject, rule: &QuotaRule) -> Option<StepOutcome> {
        match self.quotas.check_gated(owner, rule).await {
            Decision::Allowed { .. } => None,
            denied @ Decision::Denied { .. } => Some(StepOutcome::Skipped(format!(
                "{} quota exhausted for {owner}, retry in {}s",
                rule.action,
                denied.retry_after_secs()
            ))),
        }
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let text = self
            .executor
            .execute(|| self.completion.complete(system, prompt))
            .await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::permanent(
                FailureKind::Malformed,
                "completion service returned empty text",
            ));
        }
        Ok(text.to_string())
    }
}

/// Replies to the newest item of a subject, at most once per item.
pub struct CommentLoop {
    owner: Subject,
    rule: QuotaRule,
    deps: Collaborators,
    metered_at_start: bool,
    last_replied: Mutex<Option<String>>,
}

impl CommentLoop {
    pub fn new(owner: Subject, rule: QuotaRule, deps: Collaborators) -> Self {
        Self {
            owner,
            rule,
            deps,
            metered_at_start: false,
            last_replied: Mutex::new(None),
        }
    }

    /// The start command already spent a slot; the first iteration uses it.
    pub fn metered_at_start(mut self) -> Self {
        self.metered_at_start = true;
        self
    }

    fn already_replied(&self, content_id: &str) -> bool {
        self.last_replied
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_deref()
            == Some(content_id)
    }

    fn remember(&self, content_id: &str) {
        *self.last_replied.lock().unwrap_or_else(|p| p.into_inner()) = Some(content_id.to_string());
    }
}

#[async_trait]
impl JobStep for CommentLoop {
    async fn run(&self, ctx: &StepContext) -> Result<StepOutcome> {
        let prepaid = self.metered_at_start && ctx.iteration == 1;
        if !prepaid {
            if let Some(skip) = self.deps.gate(&self.owner, &self.rule).await {
                return Ok(skip);
            }
        }

        let deps = &self.deps;
        let items = deps
            .executor
            .execute(|| deps.source.latest(&ctx.subject, 1))
            .await?;
        let Some(item) = items.into_iter().next() else {
            return Ok(StepOutcome::Skipped(format!("no content in {}", ctx.subject)));
        };
        if self.already_replied(&item.id) {
            return Ok(StepOutcome::Skipped(format!("already replied to {}", item.id)));
        }

        let prompt = format!("Post: {}\n{}", item.title, item.body);
        let text = deps.complete(COMMENT_SYSTEM_PROMPT, &prompt).await?;
        let reply_id = deps
            .executor
            .execute(|| deps.publisher.reply(&item.id, &text))
            .await?;
        self.remember(&item.id);
        debug!(subject = %ctx.subject, content = %item.id, reply = %reply_id, "comment posted");

        Ok(StepOutcome::Completed(format!(
            "commented on {} ({reply_id}): {}",
            item.id,
            truncate_text(&text, 200)
        )))
    }
}

/// Publishes a generated post inspired by what is trending in a subject.
pub struct PublishLoop {
    owner: Subject,
    rule: QuotaRule,
    deps: Collaborators,
    metered_at_start: bool,
}

impl PublishLoop {
    pub fn new(owner: Subject, rule: QuotaRule, deps: Collaborators) -> Self {
        Self {
            owner,
            rule,
            deps,
            metered_at_start: false,
        }
    }

    /// See [`CommentLoop::metered_at_start`].
    pub fn metered_at_start(mut self) -> Self {
        self.metered_at_start = true;
        self
    }
}

#[async_trait]
impl JobStep for PublishLoop {
    async fn run(&self, ctx: &StepContext) -> Result<StepOutcome> {
        if !(self.metered_at_start && ctx.iteration == 1) {
            if let Some(skip) = self.deps.gate(&self.owner, &self.rule).await {
                return Ok(skip);
            }
        }

        let deps = &self.deps;
        let trending = deps
            .executor
            .execute(|| deps.source.latest(&ctx.subject, 5))
            .await?;
        if trending.is_empty() {
            return Ok(StepOutcome::Skipped(format!(
                "nothing trending in {}",
                ctx.subject
            )));
        }
        let rules = deps
            .executor
            .execute(|| deps.source.rules(&ctx.subject))
            .await?;

        let prompt = post_prompt(&rules, &trending);
        let text = deps.complete(POST_SYSTEM_PROMPT, &prompt).await?;
        let draft = parse_generated_post(&text)?;
        let post_id = deps
            .executor
            .execute(|| deps.publisher.publish(&ctx.subject, &draft))
            .await?;

        Ok(StepOutcome::Completed(format!(
            "published {post_id} in {}: {}",
            ctx.subject, draft.title
        )))
    }
}

fn post_prompt(rules: &[String], trending: &[Content]) -> String {
    let mut rules_text = String::from("Subreddit rules:\n");
    if rules.is_empty() {
        rules_text.push_str("- (none published)\n");
    }
    for rule in rules {
        rules_text.push_str(&format!("- {rule}\n"));
    }

    let mut trend_text = String::new();
    if let Some(top) = trending.first() {
        trend_text.push_str(&format!(
            "Trending post info:\nTitle: {}\nScore: {}\n",
            top.title, top.score
        ));
    }
    let related: Vec<&str> = trending
        .iter()
        .skip(1)
        .take(2)
        .map(|c| c.title.as_str())
        .collect();
    if !related.is_empty() {
        trend_text.push_str(&format!("Topics: {}\n", related.join(", ")));
    }

    format!(
        "Given these subreddit rules and trending post data, generate a new post that:\n\
         1. Follows all subreddit rules strictly\n\
         2. Is inspired by but not copying the trending content\n\
         3. Is original and engaging\n\n\
         {rules_text}\n{trend_text}\n\
         Format: TITLE: <title>\nCONTENT: <content>"
    )
}

/// Extract a draft from `TITLE: ..` / `CONTENT: ..` formatted completion text.
pub fn parse_generated_post(text: &str) -> Result<Draft> {
    const TITLE: &str = "TITLE:";
    const CONTENT: &str = "CONTENT:";

    let malformed =
        |what: &str| Error::permanent(FailureKind::Malformed, format!("generated post: {what}"));

    let title_at = text.find(TITLE).ok_or_else(|| malformed("missing TITLE"))?;
    let content_at = text
        .find(CONTENT)
        .ok_or_else(|| malformed("missing CONTENT"))?;

    let after_title = &text[title_at + TITLE.len()..];
    let title_end = after_title
        .find('\n')
        .unwrap_or(after_title.len())
        .min(after_title.find(CONTENT).unwrap_or(after_title.len()));
    let title = after_title[..title_end].trim();
    let body = text[content_at + CONTENT.len()..].trim();

    if title.is_empty() {
        return Err(malformed("empty title"));
    }
    if body.is_empty() {
        return Err(malformed("empty content"));
    }
    Ok(Draft {
        title: title.to_string(),
        body: body.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub struct FakeSource {
        pub items: Mutex<Vec<Content>>,
        pub rules: Vec<String>,
    }

    impl FakeSource {
        pub fn with_items(items: Vec<Content>) -> Self {
            Self {
                items: Mutex::new(items),
                rules: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl ContentSource for FakeSource {
        async fn latest(&self, _subject: &Subject, limit: usize) -> Result<Vec<Content>> {
            Ok(self.items.lock().unwrap().iter().take(limit).cloned().collect())
        }

        async fn rules(&self, _subject: &Subject) -> Result<Vec<String>> {
            Ok(self.rules.clone())
        }
    }

    /// Pops scripted results; once empty, answers with `fallback`.
    #[derive(Default)]
    pub struct FakeCompletion {
        pub script: Mutex<VecDeque<Result<String>>>,
        pub fallback: String,
        pub prompts: Mutex<Vec<String>>,
    }

    impl FakeCompletion {
        pub fn answering(text: &str) -> Self {
            Self {
                fallback: text.to_string(),
                ..Default::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CompletionService for FakeCompletion {
        async fn complete(&self, _system: &str, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            match self.script.lock().unwrap().pop_front() {
                Some(r) => r,
                None => Ok(self.fallback.clone()),
            }
        }
    }

    #[derive(Default)]
    pub struct FakePublisher {
        pub replies: Mutex<Vec<(String, String)>>,
        pub posts: Mutex<Vec<(Subject, Draft)>>,
    }

    #[async_trait]
    impl Publisher for FakePublisher {
        async fn publish(&self, subject: &Subject, draft: &Draft) -> Result<String> {
            let mut posts = self.posts.lock().unwrap();
            posts.push((subject.clone(), draft.clone()));
            Ok(format!("post{}", posts.len()))
        }

        async fn reply(&self, content_id: &str, text: &str) -> Result<String> {
            let mut replies = self.replies.lock().unwrap();
            replies.push((content_id.to_string(), text.to_string()));
            Ok(format!("reply{}", replies.len()))
        }
    }

    pub fn content(id: &str, title: &str, score: i64) -> Content {
        Content {
            id: id.to_string(),
            title: title.to_string(),
            body: format!("body of {id}"),
            score,
        }
    }
}
