use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use prgate_core::AppError;
use prgate_github::{dispatch::RouteOutcome, webhook::GitHubEvent};

use crate::AppState;

/// Hands a verified delivery to the handler registered for its event type.
pub async fn webhook(
    State(state): State<AppState>,
    GitHubEvent { event_type, delivery_id, payload }: GitHubEvent,
) -> Result<Response, AppError> {
    tracing::info!("Received webhook event {} ({})", event_type, delivery_id);
    let ctx = state.context.with_delivery_id(delivery_id);
    match state.events.route(&ctx, &event_type, &payload).await {
        Ok(RouteOutcome::Handled) => Ok((StatusCode::OK, "Event processed").into_response()),
        Ok(RouteOutcome::Ignored) => Ok((StatusCode::OK, "Event ignored").into_response()),
        Err(e) => {
            tracing::error!("Failed to handle {} event {}: {:?}", event_type, ctx.delivery_id(), e);
            Err(AppError::new(e.status_code(), e.to_string()))
        }
    }
}
