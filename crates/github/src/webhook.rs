use std::{fmt::Display, sync::Arc};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use prgate_core::config::Config;
use sha2::Sha256;

/// Verify and extract a GitHub webhook delivery.
///
/// The payload is left undecoded; each event handler parses the shape it
/// registered for.
#[derive(Clone)]
#[must_use]
pub struct GitHubEvent {
    pub event_type: String,
    pub delivery_id: String,
    pub payload: Bytes,
}

impl<S> FromRequest<S> for GitHubEvent
where
    Arc<Config>: FromRef<S>,
    S: Send + Sync + Clone,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        fn err(m: impl Display) -> Response {
            tracing::error!("{m}");
            (StatusCode::BAD_REQUEST, m.to_string()).into_response()
        }
        let event_type = req
            .headers()
            .get("X-GitHub-Event")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| err("X-GitHub-Event header missing"))?
            .to_string();
        let delivery_id = req
            .headers()
            .get("X-GitHub-Delivery")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let config = <Arc<Config>>::from_ref(state);
        let payload = if let Some(app_config) = &config.github.app {
            let signature = req
                .headers()
                .get("X-Hub-Signature-256")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| err("X-Hub-Signature-256 missing"))?
                .to_string();
            let body =
                Bytes::from_request(req, state).await.map_err(|_| err("error reading body"))?;
            verify_signature(app_config.webhook_secret.as_bytes(), &signature, &body)
                .map_err(err)?;
            body
        } else {
            Bytes::from_request(req, state).await.map_err(|_| err("error reading body"))?
        };
        Ok(GitHubEvent { event_type, delivery_id, payload })
    }
}

/// Check an `X-Hub-Signature-256` header value against the body.
pub fn verify_signature(secret: &[u8], header: &str, body: &[u8]) -> Result<(), &'static str> {
    let signature_sha256 =
        header.strip_prefix("sha256=").ok_or("X-Hub-Signature-256 sha256= prefix missing")?;
    let signature = hex::decode(signature_sha256).map_err(|_| "X-Hub-Signature-256 malformed")?;
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&signature).map_err(|_| "signature mismatch")
}
