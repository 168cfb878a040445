use std::{future::pending, sync::Arc};

use tokio::sync::watch;

/// Request-scoped ambient state threaded through event handling: the
/// delivery being processed and a shared cancellation signal.
#[derive(Debug, Clone)]
pub struct Context {
    delivery_id: Arc<str>,
    cancelled: watch::Receiver<bool>,
}

/// Cancels every [`Context`] derived from the one it was created with.
#[derive(Debug)]
pub struct Canceller(watch::Sender<bool>);

impl Canceller {
    pub fn cancel(&self) { self.0.send_replace(true); }
}

impl Context {
    /// A context that can be cancelled through the returned [`Canceller`].
    pub fn cancellable() -> (Canceller, Self) {
        let (tx, rx) = watch::channel(false);
        (Canceller(tx), Self { delivery_id: Arc::from(""), cancelled: rx })
    }

    /// A context that is never cancelled.
    pub fn background() -> Self { Self::cancellable().1 }

    /// Derive a context for a single delivery, sharing the cancellation signal.
    pub fn with_delivery_id(&self, delivery_id: impl Into<Arc<str>>) -> Self {
        Self { delivery_id: delivery_id.into(), cancelled: self.cancelled.clone() }
    }

    pub fn delivery_id(&self) -> &str { &self.delivery_id }

    pub fn is_cancelled(&self) -> bool { *self.cancelled.borrow() }

    /// Resolves once the context is cancelled. Never resolves for contexts
    /// whose canceller has been dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            pending::<()>().await;
        }
    }
}
