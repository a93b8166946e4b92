//! Background policy reload
//!
//! A [`PolicyWatcher`] owns one [`WatchStrategy`] chosen at startup:
//! [`FileWatch`] for the file source, [`Polling`] for sources without change
//! notification. Every signal from the strategy triggers a full
//! [`PolicyEngine::reload`]; failures are logged and the previous snapshot
//! keeps serving.

mod file_watch;
mod polling;

pub use file_watch::FileWatch;
pub use polling::Polling;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::PolicyEngine;
use crate::error::Result;

/// Source of "the rules may have changed" signals
#[async_trait]
pub trait WatchStrategy: Send {
    /// Name for logs
    fn name(&self) -> &'static str;

    /// Wait for the next change signal.
    ///
    /// An error means the strategy can no longer deliver signals.
    async fn changed(&mut self) -> Result<()>;
}

/// Reloads the engine whenever its strategy signals a change
pub struct PolicyWatcher {
    engine: Arc<PolicyEngine>,
    strategy: Box<dyn WatchStrategy>,
}

impl PolicyWatcher {
    /// Create a watcher for `engine`
    pub fn new(engine: Arc<PolicyEngine>, strategy: Box<dyn WatchStrategy>) -> Self {
        Self { engine, strategy }
    }

    /// Run on a new task until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Run until `cancel` fires or the strategy stops
    pub async fn run(mut self, cancel: CancellationToken) {
        let strategy = self.strategy.name();
        info!(strategy, "Policy watcher started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                signal = self.strategy.changed() => match signal {
                    Ok(()) => match self.engine.reload().await {
                        Ok(stats) => debug!(
                            strategy,
                            tuples = stats.tuples,
                            roles = stats.roles,
                            "Policy reload complete"
                        ),
                        Err(e) => warn!(
                            strategy,
                            error = %e,
                            "Policy reload failed, keeping previous policy"
                        ),
                    },
                    Err(e) => {
                        warn!(strategy, error = %e, "Policy change detection stopped");
                        break;
                    }
                },
            }
        }

        info!(strategy, "Policy watcher stopped");
    }
}
