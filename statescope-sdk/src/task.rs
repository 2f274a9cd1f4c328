//! Owned background tasks.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Handle to a periodic background task.
///
/// Dropping the handle (or calling [`stop`](Self::stop)) signals the task and
/// aborts it, so no tick can run after the handle is gone.
#[derive(Debug)]
pub struct TaskHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawn `tick` every `period`. The first tick fires one period after spawning.
    pub fn spawn_periodic<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let period = period.max(Duration::from_millis(1));

        let join = tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => tick().await,
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self { stop_tx, join }
    }

    /// Stop the task.
    pub fn stop(self) {
        drop(self);
    }

    /// Check whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
        self.join.abort();
    }
}
