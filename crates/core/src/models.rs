use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};

/// The kind of webhook event that caused an evaluation. Evaluators use it to
/// decide which policy rules are relevant.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// A commit status or check run changed.
    Status,
    /// A comment was created or edited.
    Comment,
    /// A review was submitted or dismissed.
    Review,
    /// The pull request itself changed.
    PullRequest,
}

impl TriggerKind {
    pub const fn variants() -> &'static [Self] {
        &[Self::Status, Self::Comment, Self::Review, Self::PullRequest]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Comment => "comment",
            Self::Review => "review",
            Self::PullRequest => "pull_request",
        }
    }
}

impl FromStr for TriggerKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::variants().iter().copied().find(|v| v.as_str() == s).ok_or(())
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Treats an explicit `null` like an absent field. Webhook payloads send
/// either for unset values.
pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Minimal pull request descriptor as attached to check run payloads.
/// Carries no open/closed state.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PullRequestRef {
    #[serde(default, deserialize_with = "null_as_default")]
    pub number: u64,
    #[serde(default)]
    pub base: Option<PullRequestBase>,
}

impl PullRequestRef {
    pub fn base_repo(&self) -> Option<&BaseRepository> {
        self.base.as_ref().and_then(|base| base.repo.as_ref())
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PullRequestBase {
    #[serde(default)]
    pub repo: Option<BaseRepository>,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BaseRepository {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
}

/// Identifies the pull request an evaluation runs against.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct PullRequestLocator {
    pub owner: String,
    pub repo: String,
    pub number: u64,
    /// The descriptor the locator was built from, passed through untouched.
    pub value: PullRequestRef,
}

impl fmt::Display for PullRequestLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}
