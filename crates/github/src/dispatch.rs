use std::{
    collections::{HashMap, hash_map::Entry},
    sync::Arc,
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use http::StatusCode;
use thiserror::Error;

use crate::context::Context;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The payload was not a well-formed event of the registered type.
    #[error("failed to parse {event_type} event payload")]
    Decode {
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
    /// One or more evaluations failed. Individual failures are logged where
    /// they happen.
    #[error("failed to evaluate {failed} pull requests")]
    Evaluation { failed: usize },
}

impl DispatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Decode { .. } => StatusCode::BAD_REQUEST,
            Self::Evaluation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Handles webhook deliveries for a fixed set of event types.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn handles(&self) -> &'static [&'static str];

    async fn handle(
        &self,
        ctx: &Context,
        event_type: &str,
        payload: &[u8],
    ) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RouteOutcome {
    Handled,
    Ignored,
}

/// Routes deliveries to the handler registered for their event type.
#[derive(Default, Clone)]
pub struct EventRouter {
    handlers: HashMap<&'static str, Arc<dyn EventHandler>>,
}

impl EventRouter {
    pub fn new() -> Self { Self::default() }

    pub fn register(mut self, handler: Arc<dyn EventHandler>) -> Result<Self> {
        for &event_type in handler.handles() {
            match self.handlers.entry(event_type) {
                Entry::Occupied(_) => {
                    bail!("Multiple handlers registered for event type {event_type}")
                }
                Entry::Vacant(entry) => {
                    entry.insert(handler.clone());
                }
            }
        }
        Ok(self)
    }

    pub fn event_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    pub async fn route(
        &self,
        ctx: &Context,
        event_type: &str,
        payload: &[u8],
    ) -> Result<RouteOutcome, DispatchError> {
        let Some(handler) = self.handlers.get(event_type) else {
            if event_type == "ping" {
                tracing::info!("Received ping {}", ctx.delivery_id());
            } else {
                tracing::debug!("No handler for event type {}", event_type);
            }
            return Ok(RouteOutcome::Ignored);
        };
        handler.handle(ctx, event_type, payload).await?;
        Ok(RouteOutcome::Handled)
    }
}
