//! Debounce/deadline primitive for batch flushes.
//!
//! The timer is Idle until the first pending transaction arrives; that first
//! notification arms a flush at `now + max_delay`. Further notifications
//! while armed are no-ops — the deadline is never pushed back. A flush can
//! also be triggered manually (the service does this when Ready reaches the
//! batch size) or cancelled without running.
//!
//! Completion waiting is an explicit list of pending oneshot channels keyed
//! by target completed-batch count, resolved by numeric comparison.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::txs::types::TxServiceError;

/// Flush callback invoked when the timer fires or is triggered.
pub type FlushFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<(), TxServiceError>> + Send + Sync>;

struct TimerState {
    /// Token for the scheduled flush task, present while Armed
    armed: Option<CancellationToken>,
    /// A flush is currently running
    firing: bool,
    completed_batches: u64,
    /// Pending waiters: (target count, resolver)
    waiters: Vec<(u64, oneshot::Sender<()>)>,
}

pub struct BatchTimer {
    max_delay: Duration,
    flush: FlushFn,
    state: Mutex<TimerState>,
}

impl BatchTimer {
    pub fn new(max_delay: Duration, flush: FlushFn) -> Arc<Self> {
        Arc::new(Self {
            max_delay,
            flush,
            state: Mutex::new(TimerState {
                armed: None,
                firing: false,
                completed_batches: 0,
                waiters: Vec::new(),
            }),
        })
    }

    /// Arm the flush deadline if the timer is idle. No-op while armed or
    /// firing; the deadline set by the first notification stands.
    pub fn notify_tx_waiting(self: &Arc<Self>) {
        let token = {
            let mut state = self.state.lock();
            if state.armed.is_some() || state.firing {
                return;
            }
            let token = CancellationToken::new();
            state.armed = Some(token.clone());
            token
        };

        log::debug!("[BatchTimer] armed, flush in {:?}", self.max_delay);
        let timer = Arc::clone(self);
        // The deadline is fixed here, not when the task first polls.
        let deadline = Instant::now() + self.max_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    log::debug!("[BatchTimer] deadline reached, flushing");
                    if let Err(e) = timer.trigger().await {
                        log::error!("[BatchTimer] scheduled flush failed: {}", e);
                    }
                }
            }
        });
    }

    /// Cancel any scheduled flush and run the flush callback now. The
    /// completed-batch counter increments whether or not the flush succeeded;
    /// the flush result is returned to the caller.
    pub async fn trigger(&self) -> Result<(), TxServiceError> {
        {
            let mut state = self.state.lock();
            if let Some(token) = state.armed.take() {
                token.cancel();
            }
            state.firing = true;
        }

        let result = (self.flush)().await;

        let satisfied = {
            let mut state = self.state.lock();
            state.firing = false;
            state.completed_batches += 1;
            let completed = state.completed_batches;
            let mut satisfied = Vec::new();
            let mut remaining = Vec::new();
            for (target, sender) in state.waiters.drain(..) {
                if completed >= target {
                    satisfied.push(sender);
                } else {
                    remaining.push((target, sender));
                }
            }
            state.waiters = remaining;
            satisfied
        };

        for sender in satisfied {
            let _ = sender.send(());
        }

        result
    }

    /// Cancel a scheduled flush without running it.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        if let Some(token) = state.armed.take() {
            token.cancel();
            log::debug!("[BatchTimer] cleared scheduled flush");
        }
    }

    pub fn completed_batches(&self) -> u64 {
        self.state.lock().completed_batches
    }

    /// Resolves once the completed-batch counter reaches `target`;
    /// immediately if already satisfied.
    pub async fn wait_for_completed_batches(&self, target: u64) {
        let receiver = {
            let mut state = self.state.lock();
            if state.completed_batches >= target {
                None
            } else {
                let (sender, receiver) = oneshot::channel();
                state.waiters.push((target, sender));
                Some(receiver)
            }
        };
        if let Some(receiver) = receiver {
            let _ = receiver.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{advance, timeout};

    fn counting_timer(max_delay: Duration) -> (Arc<BatchTimer>, Arc<AtomicUsize>) {
        let flushes = Arc::new(AtomicUsize::new(0));
        let counter = flushes.clone();
        let flush: FlushFn = Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        (BatchTimer::new(max_delay, flush), flushes)
    }

    #[tokio::test]
    async fn test_notify_arms_once_and_fires() {
        let (timer, flushes) = counting_timer(Duration::from_millis(20));
        timer.notify_tx_waiting();
        timer.notify_tx_waiting();
        timer.notify_tx_waiting();

        timeout(Duration::from_secs(1), timer.wait_for_completed_batches(1))
            .await
            .expect("flush should fire at the deadline");
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_not_extended_by_later_notifications() {
        let (timer, flushes) = counting_timer(Duration::from_millis(100));
        timer.notify_tx_waiting();

        advance(Duration::from_millis(60)).await;
        timer.notify_tx_waiting();

        // 100ms after the FIRST notification the flush must have run,
        // regardless of the second one.
        advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_cancels_scheduled_flush() {
        let (timer, flushes) = counting_timer(Duration::from_millis(20));
        timer.notify_tx_waiting();
        timer.clear();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(flushes.load(Ordering::SeqCst), 0);
        assert_eq!(timer.completed_batches(), 0);
    }

    #[tokio::test]
    async fn test_trigger_runs_immediately_and_cancels_deadline() {
        let (timer, flushes) = counting_timer(Duration::from_secs(60));
        timer.notify_tx_waiting();

        timer.trigger().await.unwrap();
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
        assert_eq!(timer.completed_batches(), 1);

        // the 60s deadline was cancelled, so no second flush appears
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_resolves_immediately_when_satisfied() {
        let (timer, _flushes) = counting_timer(Duration::from_secs(60));
        timer.trigger().await.unwrap();
        timer.trigger().await.unwrap();

        timeout(Duration::from_millis(50), timer.wait_for_completed_batches(2))
            .await
            .expect("already satisfied, must resolve at once");
    }

    #[tokio::test]
    async fn test_waiters_resolve_at_their_own_targets() {
        let (timer, _flushes) = counting_timer(Duration::from_secs(60));
        let timer_a = timer.clone();
        let timer_b = timer.clone();

        let wait_one = tokio::spawn(async move { timer_a.wait_for_completed_batches(1).await });
        let wait_three = tokio::spawn(async move { timer_b.wait_for_completed_batches(3).await });

        timer.trigger().await.unwrap();
        timeout(Duration::from_secs(1), wait_one)
            .await
            .expect("first waiter resolves after one batch")
            .unwrap();
        assert!(!wait_three.is_finished());

        timer.trigger().await.unwrap();
        timer.trigger().await.unwrap();
        timeout(Duration::from_secs(1), wait_three)
            .await
            .expect("second waiter resolves after three batches")
            .unwrap();
    }

    #[tokio::test]
    async fn test_counter_increments_even_when_flush_fails() {
        let flush: FlushFn = Arc::new(|| {
            Box::pin(async {
                Err(TxServiceError::Wallet(crate::wallet::WalletError::Rpc(
                    "boom".to_string(),
                )))
            })
        });
        let timer = BatchTimer::new(Duration::from_secs(60), flush);

        assert!(timer.trigger().await.is_err());
        assert_eq!(timer.completed_batches(), 1);
    }
}
