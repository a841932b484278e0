//! Background task delivering due timers.
//!
//! Sleeps until the earliest scheduled deadline (bounded by the poll
//! interval), wakes early when the schedule changes, and hands every due
//! timer to [`RuntimeManager::fire_due_timers`], which binds the owning
//! session exactly like any other signal.

use crate::manager::RuntimeManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct TimerDriver {
    manager: Arc<RuntimeManager>,
    poll_interval: Duration,
}

impl TimerDriver {
    pub fn new(manager: Arc<RuntimeManager>) -> Self {
        let poll_interval = Duration::from_millis(manager.environment().config.timer_poll_interval_ms.max(1));
        Self {
            manager,
            poll_interval,
        }
    }

    /// Run until the shutdown signal is received.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "TimerDriver started");
        let env = self.manager.environment().clone();

        loop {
            if *shutdown_rx.borrow() {
                tracing::info!("TimerDriver shutting down");
                break;
            }

            let fired = self.manager.fire_due_timers().await;
            if fired > 0 {
                tracing::debug!(fired, "TimerDriver: timers delivered");
            }

            let wait = match env.timers.next_deadline() {
                Some(due) => {
                    let ms = (due - env.now()).max(0) as u64;
                    Duration::from_millis(ms).min(self.poll_interval)
                }
                None => self.poll_interval,
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = env.timers.changed() => {}
                _ = shutdown_rx.changed() => {
                    tracing::info!("TimerDriver shutting down (during sleep)");
                    break;
                }
            }
        }

        tracing::info!("TimerDriver stopped");
    }

    /// Spawn onto the current runtime. Send `true` on the returned channel
    /// to stop.
    pub fn spawn(self) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { self.run(rx).await });
        (tx, handle)
    }
}
