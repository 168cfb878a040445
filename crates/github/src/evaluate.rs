use std::time::Duration;

use anyhow::{Context as _, Result, anyhow};
use async_trait::async_trait;
use octocrab::models::InstallationId;
use prgate_core::{
    config::EvaluatorConfig,
    models::{PullRequestLocator, PullRequestRef, TriggerKind},
};
use secrecy::ExposeSecret;
use serde::Serialize;
use thiserror::Error;

use crate::installation::RepoContext;

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("evaluation cancelled")]
    Cancelled,
    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Runs a policy evaluation for one pull request.
///
/// Implementations own their timeouts and must stop early once
/// `ctx.context` is cancelled.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        ctx: &RepoContext,
        installation_id: Option<InstallationId>,
        trigger: TriggerKind,
        target: PullRequestLocator,
    ) -> Result<(), EvaluationError>;
}

#[derive(Debug, Serialize)]
struct EvaluationRequest<'a> {
    delivery_id: &'a str,
    installation_id: Option<u64>,
    trigger: TriggerKind,
    owner: &'a str,
    repo: &'a str,
    number: u64,
    pull_request: &'a PullRequestRef,
}

/// Forwards evaluations to an HTTP endpoint as JSON. The installation token,
/// when there is one, is sent as a bearer token so the endpoint can call
/// GitHub on the installation's behalf.
pub struct HttpEvaluator {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpEvaluator {
    pub fn new(config: &EvaluatorConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create evaluator client")?;
        Ok(Self { client, url: config.url.clone(), timeout })
    }
}

#[async_trait]
impl Evaluator for HttpEvaluator {
    async fn evaluate(
        &self,
        ctx: &RepoContext,
        installation_id: Option<InstallationId>,
        trigger: TriggerKind,
        target: PullRequestLocator,
    ) -> Result<(), EvaluationError> {
        let body = EvaluationRequest {
            delivery_id: ctx.context.delivery_id(),
            installation_id: installation_id.map(|id| id.into_inner()),
            trigger,
            owner: &target.owner,
            repo: &target.repo,
            number: target.number,
            pull_request: &target.value,
        };
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = &ctx.token {
            request = request.bearer_auth(token.expose_secret());
        }
        let request = request.send();
        let response = tokio::select! {
            biased;
            _ = ctx.context.cancelled() => return Err(EvaluationError::Cancelled),
            result = request => match result {
                Ok(response) => response,
                Err(e) if e.is_timeout() => return Err(EvaluationError::Timeout(self.timeout)),
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("Failed to send evaluation request for {target}"))
                        .into());
                }
            },
        };
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Evaluator responded with {status} for {target}: {text}").into());
        }
        tracing::debug!("Evaluated {} ({})", target, trigger);
        Ok(())
    }
}
