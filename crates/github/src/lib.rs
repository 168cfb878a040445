pub mod check_run;
pub mod context;
pub mod dispatch;
pub mod evaluate;
pub mod installation;
pub mod webhook;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use prgate_core::config::Config;

use crate::{
    check_run::CheckRunHandler, dispatch::EventRouter, evaluate::HttpEvaluator,
    installation::AppInstallations,
};

/// Build the event router with every handler this service runs.
pub fn event_router(config: &Config) -> Result<EventRouter> {
    let resolver = Arc::new(
        AppInstallations::new(&config.github).context("Failed to set up GitHub installations")?,
    );
    let evaluator =
        Arc::new(HttpEvaluator::new(&config.evaluator).context("Failed to set up evaluator")?);
    let check_run = CheckRunHandler::new(resolver, evaluator)
        .with_max_concurrent_evaluations(config.dispatch.max_concurrent_evaluations);
    let router = EventRouter::new().register(Arc::new(check_run))?;
    for event_type in router.event_types() {
        tracing::info!("Handling webhook event type {}", event_type);
    }
    Ok(router)
}
