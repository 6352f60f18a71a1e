//! Fire-later callbacks for backends with no native delayed delivery.

use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

pub trait Scheduler: Send + Sync {
    /// Runs `task` once `delay` has passed.
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>);
}

/// Runs scheduled work as tokio tasks. Dropping or shutting down the
/// scheduler abandons whatever has not fired yet.
#[derive(Debug, Clone, Default)]
pub struct TokioScheduler {
    shutdown: CancellationToken,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        let shutdown = self.shutdown.clone();
        tracing::debug!(?delay, "Scheduling delayed send");
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::warn!("Scheduler shut down, dropping a delayed send");
                }
                _ = tokio::time::sleep(delay) => task.await,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let scheduler = TokioScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));

        scheduler.schedule(Duration::from_secs(2), {
            let fired = fired.clone();
            Box::pin(async move { fired.store(true, Ordering::SeqCst) })
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending() {
        let scheduler = TokioScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));

        scheduler.schedule(Duration::from_secs(2), {
            let fired = fired.clone();
            Box::pin(async move { fired.store(true, Ordering::SeqCst) })
        });
        scheduler.shutdown();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
