//! Background lease refreshing.

use crate::error::LockError;
use std::{future::Future, pin::Pin, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::warn;

type RefreshFuture = Pin<Box<dyn Future<Output = Result<(), LockError>> + Send>>;
type RefreshFn = Box<dyn FnMut() -> RefreshFuture + Send + Sync>;

/// Periodically invokes a refresh callback while a lock is held.
///
/// The wait between ticks is interruptible: [`Refresher::stop`] wakes the
/// task immediately instead of letting the current sleep run out. Once
/// `stop` returns no new callback invocation will begin; an invocation
/// already in flight runs to completion, which [`Refresher::join`] can be
/// used to wait out.
///
/// A callback returning [`LockError::Lost`] terminates the loop: the lock
/// is gone and further refreshing would only assert ownership we no
/// longer have. The loss itself is reported through whatever state the
/// callback shares with its creator. Other errors are logged and retried
/// on the next tick, leaving the remaining lease slack to absorb
/// transient store failures.
pub struct Refresher {
    period: Duration,
    refresh_fn: Option<RefreshFn>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Refresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refresher")
            .field("period", &self.period)
            .field("running", &self.task.is_some())
            .finish_non_exhaustive()
    }
}

impl Refresher {
    /// Create a refresher invoking `refresh_fn` every `period`.
    ///
    /// # Panics
    /// Panics if `period` is zero.
    pub fn new<F, Fut>(mut refresh_fn: F, period: Duration) -> Self
    where
        F: FnMut() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), LockError>> + Send + 'static,
    {
        assert!(period > Duration::ZERO, "refresh period must be non-zero");
        let (stop_tx, _) = watch::channel(false);
        Self {
            period,
            refresh_fn: Some(Box::new(move || Box::pin(refresh_fn()))),
            stop_tx,
            task: None,
        }
    }

    /// Begin background execution. The first callback invocation happens
    /// one full period from now; the lease is fresh at start.
    ///
    /// Idempotent: further calls (and calls after `stop`) do nothing.
    pub fn start(&mut self) {
        let Some(mut refresh_fn) = self.refresh_fn.take() else {
            return;
        };
        if *self.stop_tx.borrow() {
            return;
        }

        let period = self.period;
        let mut stop_rx = self.stop_tx.subscribe();
        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    () = tokio::time::sleep(period) => {}
                }
                // Stop may have been signalled between the sleep elapsing
                // and this task resuming.
                if *stop_rx.borrow() {
                    break;
                }
                match refresh_fn().await {
                    Ok(()) => {}
                    Err(LockError::Lost) => {
                        warn!("lock ownership lost; stopping background refresh");
                        break;
                    }
                    Err(err) => {
                        warn!(%err, "background refresh failed; retrying next period");
                    }
                }
            }
        }));
    }

    /// Request cancellation. Non-blocking, idempotent, callable from any
    /// thread; wakes the refresher out of its current sleep.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Wait for the background task to finish. Returns immediately if it
    /// was never started or has already been awaited.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            // The task only ends by breaking its loop; a join error is a
            // panic inside the callback, already reported by the runtime.
            let _ = task.await;
        }
    }
}

impl Drop for Refresher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn counting_refresher(period: Duration) -> (Refresher, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let refresher = Refresher::new(
            move || {
                let counted = Arc::clone(&counted);
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            period,
        );
        (refresher, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_a_full_period() {
        let (mut refresher, calls) = counting_refresher(Duration::from_secs(10));
        refresher.start();
        settle().await;

        tokio::time::advance(Duration::from_secs(9)).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        refresher.stop();
        refresher.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_wakes_the_sleeping_task() {
        let (mut refresher, calls) = counting_refresher(Duration::from_secs(3600));
        refresher.start();
        settle().await;

        refresher.stop();
        // No time advance needed: the task must exit without sleeping out
        // the hour.
        refresher.join().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_tick_after_stop() {
        let (mut refresher, calls) = counting_refresher(Duration::from_secs(5));
        refresher.start();
        refresher.stop();
        refresher.stop(); // idempotent
        refresher.join().await;

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn terminates_when_lock_is_lost() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let mut refresher = Refresher::new(
            move || {
                let counted = Arc::clone(&counted);
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(LockError::Lost)
                }
            },
            Duration::from_secs(5),
        );
        refresher.start();
        settle().await;

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        refresher.join().await;

        // Loop ended on loss; further periods must not tick.
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let mut refresher = Refresher::new(
            move || {
                let counted = Arc::clone(&counted);
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(LockError::Store(crate::store::StoreError::Other(
                        anyhow::anyhow!("transient"),
                    )))
                }
            },
            Duration::from_secs(5),
        );
        refresher.start();
        settle().await;

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        refresher.stop();
        refresher.join().await;
    }
}
