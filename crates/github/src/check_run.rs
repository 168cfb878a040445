use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use octocrab::models::InstallationId;
use prgate_core::models::{PullRequestLocator, PullRequestRef, TriggerKind, null_as_default};
use serde::Deserialize;
use tracing::Instrument;

use crate::{
    context::Context,
    dispatch::{DispatchError, EventHandler},
    evaluate::{EvaluationError, Evaluator},
    installation::{RepoContext, RepoContextResolver, RepositoryIdentity},
};

pub const EVENT_TYPE: &str = "check_run";

/// The subset of a `check_run` webhook payload needed to dispatch
/// evaluations. Every field is optional on the wire, so a sparse object
/// still decodes and the guard decides what to do with it.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckRunEvent {
    #[serde(default, deserialize_with = "null_as_default")]
    pub action: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub check_run: CheckRun,
    /// The repository that owns the checked commit.
    #[serde(default, deserialize_with = "null_as_default")]
    pub repository: Repository,
    pub installation: Option<EventInstallation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckRun {
    /// Unset until the run completes.
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub head_sha: String,
    /// Pull requests whose head contains `head_sha`, which may target other
    /// repositories.
    #[serde(default, deserialize_with = "null_as_default")]
    pub pull_requests: Vec<PullRequestRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub owner: RepositoryOwner,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepositoryOwner {
    #[serde(default, deserialize_with = "null_as_default")]
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventInstallation {
    #[serde(default)]
    pub id: Option<InstallationId>,
}

impl CheckRunEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, DispatchError> {
        serde_json::from_slice(payload)
            .map_err(|source| DispatchError::Decode { event_type: EVENT_TYPE, source })
    }

    /// Only successfully completed runs can change a policy outcome. Runs
    /// report progress several times before that.
    pub fn is_actionable(&self) -> bool {
        self.action == "completed" && self.check_run.conclusion.as_deref() == Some("success")
    }

    pub fn installation_id(&self) -> Option<InstallationId> {
        self.installation.as_ref().and_then(|i| i.id)
    }

    pub fn repository_identity(&self) -> RepositoryIdentity {
        RepositoryIdentity {
            id: self.repository.id,
            owner: self.repository.owner.login.clone(),
            name: self.repository.name.clone(),
        }
    }

    /// Locators for the associated pull requests that target this
    /// repository, in delivery order.
    pub fn evaluation_targets(&self) -> Vec<PullRequestLocator> {
        self.check_run
            .pull_requests
            .iter()
            .filter(|pr| {
                // The checked commit can also be the head of a pull request from
                // this repository into another one, e.g. a fork. A pull request
                // without a base repository id never matches.
                let base_repo = pr.base_repo();
                let base_repo_id = base_repo.and_then(|repo| repo.id);
                if base_repo_id.is_none() || base_repo_id != self.repository.id {
                    tracing::debug!(
                        "Skipping pull request '{}' from different repository '{}'",
                        pr.number,
                        base_repo.map_or("", |repo| repo.url.as_str())
                    );
                    return false;
                }
                true
            })
            .map(|pr| PullRequestLocator {
                owner: self.repository.owner.login.clone(),
                repo: self.repository.name.clone(),
                number: pr.number,
                value: pr.clone(),
            })
            .collect()
    }
}

/// Triggers a status evaluation for every pull request a successful check
/// run belongs to.
pub struct CheckRunHandler {
    resolver: Arc<dyn RepoContextResolver>,
    evaluator: Arc<dyn Evaluator>,
    max_concurrent_evaluations: usize,
}

impl CheckRunHandler {
    pub fn new(resolver: Arc<dyn RepoContextResolver>, evaluator: Arc<dyn Evaluator>) -> Self {
        Self { resolver, evaluator, max_concurrent_evaluations: 1 }
    }

    pub fn with_max_concurrent_evaluations(mut self, max: usize) -> Self {
        self.max_concurrent_evaluations = max.max(1);
        self
    }

    pub async fn dispatch(&self, ctx: &Context, payload: &[u8]) -> Result<(), DispatchError> {
        let event = CheckRunEvent::parse(payload)?;
        if !event.is_actionable() {
            return Ok(());
        }

        let installation_id = event.installation_id();
        let repo_ctx = self
            .resolver
            .prepare_repo_context(ctx, installation_id, &event.repository_identity())
            .await;
        let span = repo_ctx.span.clone();
        let failed = async {
            let targets = event.evaluation_targets();
            self.evaluate_all(&repo_ctx, installation_id, &event.check_run.head_sha, targets)
                .await
        }
        .instrument(span)
        .await;

        if failed == 0 { Ok(()) } else { Err(DispatchError::Evaluation { failed }) }
    }

    /// Returns the number of failed evaluations. Every target is attempted
    /// regardless of earlier failures.
    async fn evaluate_all(
        &self,
        repo_ctx: &RepoContext,
        installation_id: Option<InstallationId>,
        head_sha: &str,
        targets: Vec<PullRequestLocator>,
    ) -> usize {
        stream::iter(targets)
            .map(|target| self.evaluate_one(repo_ctx, installation_id, head_sha, target))
            .buffered(self.max_concurrent_evaluations)
            .fold(0, |failed, ok| async move { if ok { failed } else { failed + 1 } })
            .await
    }

    async fn evaluate_one(
        &self,
        repo_ctx: &RepoContext,
        installation_id: Option<InstallationId>,
        head_sha: &str,
        target: PullRequestLocator,
    ) -> bool {
        let number = target.number;
        let result = if repo_ctx.context.is_cancelled() {
            Err(EvaluationError::Cancelled)
        } else {
            self.evaluator.evaluate(repo_ctx, installation_id, TriggerKind::Status, target).await
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Failed to evaluate pull request '{}' for SHA '{}'",
                    number,
                    head_sha
                );
                false
            }
        }
    }
}

#[async_trait]
impl EventHandler for CheckRunHandler {
    fn handles(&self) -> &'static [&'static str] { &[EVENT_TYPE] }

    async fn handle(
        &self,
        ctx: &Context,
        _event_type: &str,
        payload: &[u8],
    ) -> Result<(), DispatchError> {
        self.dispatch(ctx, payload).await
    }
}
