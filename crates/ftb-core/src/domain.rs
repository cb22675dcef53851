use std::fmt;

use serde::{Deserialize, Serialize};

/// Entity a quota or job is scoped to: a user id, or a forum/channel name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subject(pub String);

impl Subject {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Subject for a messaging-platform user.
    pub fn user(user_id: i64) -> Self {
        Self(format!("user:{user_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metered action name (`forum_post`, `auto_comment`, ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Action(pub String);

impl Action {
    pub const FORUM_POST: &'static str = "forum_post";
    pub const AUTO_COMMENT: &'static str = "auto_comment";
    pub const VOICE_TO_TEXT: &'static str = "voice_to_text";
    pub const AUTO_POST: &'static str = "auto_post";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Uniqueness key of a quota record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QuotaKey {
    pub subject: Subject,
    pub action: Action,
}

impl QuotaKey {
    pub fn new(subject: Subject, action: Action) -> Self {
        Self { subject, action }
    }

    /// Document key used by stores (`subject:action`).
    pub fn document_key(&self) -> String {
        format!("{}:{}", self.subject, self.action)
    }
}

/// Kind of recurring job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    CommentLoop,
    PublishLoop,
    Maintenance,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::CommentLoop => "comment-loop",
            JobKind::PublishLoop => "publish-loop",
            JobKind::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
