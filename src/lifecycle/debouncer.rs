//! Trailing-edge command debouncer
//!
//! Every submission replaces the pending one; only the last submission in a
//! quiet window runs. An action that already started is never interrupted.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Debug, Default)]
struct DebounceState {
    generation: u64,
    cancel: Option<oneshot::Sender<()>>,
}

fn lock(state: &Mutex<DebounceState>) -> MutexGuard<'_, DebounceState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct CommandDebouncer {
    delay: Duration,
    state: Arc<Mutex<DebounceState>>,
}

impl CommandDebouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedule `action` after the configured delay, superseding any pending action
    pub fn submit<F>(&self, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit_after(self.delay, action);
    }

    /// Schedule `action` after `delay`, superseding any pending action
    pub fn submit_after<F>(&self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let generation = {
            let mut state = lock(&self.state);
            state.generation += 1;
            if let Some(previous) = state.cancel.replace(cancel_tx) {
                let _ = previous.send(());
            }
            state.generation
        };

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel_rx => {
                    trace!(generation, "Debounced action superseded");
                    return;
                }
            }

            {
                let mut state = lock(&state);
                // Superseded between the timer firing and taking the lock
                if state.generation != generation {
                    return;
                }
                state.cancel = None;
            }

            trace!(generation, "Running debounced action");
            action.await;
        });
    }

    /// Drop the pending action, if any
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        state.generation += 1;
        if let Some(pending) = state.cancel.take() {
            let _ = pending.send(());
        }
    }

    pub fn has_pending(&self) -> bool {
        lock(&self.state).cancel.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(runs: &Arc<Mutex<Vec<u32>>>, n: u32) -> impl Future<Output = ()> + Send + 'static {
        let runs = runs.clone();
        async move {
            runs.lock().unwrap().push(n);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_last_submission_runs() {
        let debouncer = CommandDebouncer::new(Duration::from_millis(500));
        let runs = Arc::new(Mutex::new(Vec::new()));

        debouncer.submit(record(&runs, 1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        debouncer.submit(record(&runs, 2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        debouncer.submit(record(&runs, 3));
        assert!(debouncer.has_pending());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(*runs.lock().unwrap(), vec![3]);
        assert!(!debouncer.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_submissions_all_run() {
        let debouncer = CommandDebouncer::new(Duration::from_millis(500));
        let runs = Arc::new(Mutex::new(Vec::new()));

        debouncer.submit(record(&runs, 1));
        tokio::time::sleep(Duration::from_millis(600)).await;
        debouncer.submit(record(&runs, 2));
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(*runs.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_action() {
        let debouncer = CommandDebouncer::new(Duration::from_millis(500));
        let runs = Arc::new(Mutex::new(Vec::new()));

        debouncer.submit(record(&runs, 1));
        debouncer.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(runs.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_action_is_not_interrupted() {
        let debouncer = CommandDebouncer::new(Duration::from_millis(10));
        let finished = Arc::new(AtomicUsize::new(0));

        let done = finished.clone();
        debouncer.submit(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            done.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Starts after the first action is already running
        let done = finished.clone();
        debouncer.submit(async move {
            done.fetch_add(10, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(finished.load(Ordering::SeqCst), 11);
    }
}
