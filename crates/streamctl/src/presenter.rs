//! Seam to the presentation layer (dashboard, dialogs).
//!
//! The control plane only needs three things from whatever is drawing the
//! screen: show a blocking notice, ask whether a shutdown request should go
//! ahead, and stop.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

#[async_trait]
pub trait Presenter: Send + Sync {
    async fn alert(&self, title: &str, body: &str);

    /// Ask the operator to confirm a cancellable shutdown request.
    async fn confirm_shutdown(&self) -> bool;

    async fn stop(&self);
}

/// Headless presenter: alerts go to the log, shutdown requests are accepted.
#[derive(Default)]
pub struct LogPresenter {
    stopped: AtomicBool,
}

impl LogPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Presenter for LogPresenter {
    async fn alert(&self, title: &str, body: &str) {
        tracing::warn!(target: "streamctl::alert", %title, "{}", body);
    }

    async fn confirm_shutdown(&self) -> bool {
        tracing::info!("Shutdown requested (no interactive presenter, accepting)");
        true
    }

    async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("Presenter stopped");
        }
    }
}
