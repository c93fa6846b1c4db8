// =============================================================================
// Clock / tick dispatcher (§4.L)
// =============================================================================
//
// Periodically invokes every registered handler with the current wall-clock
// time in milliseconds. Handlers run concurrently each tick; one handler's
// error is logged and never stops the others or the clock itself.
// =============================================================================

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, warn};

type TickFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type TickHandler = Arc<dyn Fn(u64) -> TickFuture + Send + Sync>;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct Clock {
    tick_size: Duration,
    handlers: RwLock<Vec<TickHandler>>,
    stop_signal: Arc<Notify>,
    task: RwLock<Option<JoinHandle<()>>>,
}

impl Clock {
    pub fn new(tick_size_secs: f64) -> Self {
        Self {
            tick_size: Duration::from_secs_f64(tick_size_secs.max(0.001)),
            handlers: RwLock::new(Vec::new()),
            stop_signal: Arc::new(Notify::new()),
            task: RwLock::new(None),
        }
    }

    pub fn add_tick_handler(&self, handler: TickHandler) {
        self.handlers.write().push(handler);
    }

    pub fn start(self: &Arc<Self>) {
        let mut task_slot = self.task.write();
        if task_slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let clock = self.clone();
        *task_slot = Some(tokio::spawn(async move { clock.run().await }));
    }

    async fn run(self: Arc<Self>) {
        loop {
            let tick_fut = async {
                let now = now_ms();
                let handlers = self.handlers.read().clone();
                if handlers.is_empty() {
                    return;
                }
                let results = join_all(handlers.iter().map(|h| h(now))).await;
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "tick handler error");
                    }
                }
            };

            tokio::select! {
                _ = tick_fut => {}
                _ = self.stop_signal.notified() => {
                    return;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.tick_size) => {}
                _ = self.stop_signal.notified() => {
                    return;
                }
            }
        }
    }

    pub async fn stop(&self) {
        self.stop_signal.notify_waiters();
        let handle = self.task.write().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "clock task join error on stop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn clock_invokes_handlers_and_stops_cleanly() {
        let clock = Arc::new(Clock::new(0.01));
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        clock.add_tick_handler(Arc::new(move |_now| {
            let counter = counter_clone.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));

        clock.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        clock.stop().await;

        assert!(counter.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn clock_with_no_handlers_still_stops() {
        let clock = Arc::new(Clock::new(0.01));
        clock.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        clock.stop().await;
    }
}
