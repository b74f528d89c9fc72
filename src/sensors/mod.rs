use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod camera;
pub mod flow;
pub mod gps;
pub mod hal;
pub mod imu;
pub mod sim;

/// Common surface of every long-running acquisition source. Draining stays
/// concrete per source because the reading shapes differ.
#[async_trait]
pub trait SensorSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// True iff the acquisition loop is alive and the last successful
    /// hardware read is within the source's staleness window.
    fn is_healthy(&self) -> bool;

    /// Stop the acquisition loop, reopen the hardware handle and respawn.
    /// The health monitor owns the retry cap around this.
    async fn restart(&self) -> Result<(), hal::HardwareError>;

    /// Stop the acquisition loop and release the hardware handle.
    async fn stop(&self);
}

/// Handle + cancellation for one acquisition task. Replaced wholesale on
/// restart so the old loop can wind down on its own token.
pub(crate) struct TaskSlot {
    pub cancel: CancellationToken,
    pub handle: Option<JoinHandle<()>>,
}

impl TaskSlot {
    pub fn empty() -> Self {
        Self {
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    /// Cancel the running task and wait briefly for it to exit. The loop
    /// checks its token every iteration, so two seconds is generous.
    pub async fn shut_down(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }
}

/// Suppresses repeat log lines for recurring hardware faults.
pub(crate) struct RateLimited {
    every: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimited {
    pub fn new(every: Duration) -> Self {
        Self {
            every,
            last: Mutex::new(None),
        }
    }

    pub fn should_emit(&self) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) if at.elapsed() < self.every => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_emits_once_per_window() {
        let limiter = RateLimited::new(Duration::from_secs(10));
        assert!(limiter.should_emit());
        assert!(!limiter.should_emit());
        assert!(!limiter.should_emit());
    }

    #[test]
    fn rate_limiter_reopens_after_window() {
        let limiter = RateLimited::new(Duration::ZERO);
        assert!(limiter.should_emit());
        assert!(limiter.should_emit());
    }
}
