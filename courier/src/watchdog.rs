use crate::error::Result;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

/// Watchdog calls a stop function once after a fixed delay.
///
/// The delay is measured on the monotonic clock from the moment
/// `arm` is called, and the timer runs on its own task so it never
/// waits on the loop it is guarding.
pub struct Watchdog {
    handle: JoinHandle<()>,
    fired: Arc<AtomicBool>,
}

impl Watchdog {
    pub fn arm<F>(delay: Duration, stop: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let armed_at = Instant::now();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            info!(
                "watchdog fired after {:?}, stopping",
                armed_at.elapsed()
            );
            flag.store(true, Ordering::SeqCst);
            stop();
        });
        Self { handle, fired }
    }

    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Cancels the timer if it has not fired yet.
    pub fn disarm(self) {
        if !self.fired() {
            info!("watchdog disarmed");
        }
        self.handle.abort();
    }

    /// Waits for the timer to fire and its stop function to return.
    pub async fn join(self) -> Result<()> {
        self.handle.await?;
        Ok(())
    }
}
