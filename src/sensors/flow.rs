//! Flow meter source: counts GPIO edges in the background; the collection
//! tick reads and resets the counter under the lock.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::hal::{HardwareError, PulseFactory, PulseInput};
use super::{RateLimited, SensorSource, TaskSlot};

struct FlowShared {
    pulses: Mutex<u64>,
    loop_alive: AtomicBool,
    edge_errors: RateLimited,
}

pub struct FlowSource {
    factory: PulseFactory,
    shared: Arc<FlowShared>,
    slot: tokio::sync::Mutex<TaskSlot>,
}

impl FlowSource {
    pub async fn spawn(factory: PulseFactory) -> Arc<Self> {
        let source = Arc::new(Self {
            factory,
            shared: Arc::new(FlowShared {
                pulses: Mutex::new(0),
                loop_alive: AtomicBool::new(false),
                edge_errors: RateLimited::new(Duration::from_secs(10)),
            }),
            slot: tokio::sync::Mutex::new(TaskSlot::empty()),
        });

        let mut slot = source.slot.lock().await;
        if let Err(e) = source.start_locked(&mut slot) {
            warn!(error = %e, "flow meter unavailable at startup, continuing without it");
        }
        drop(slot);
        source
    }

    fn start_locked(&self, slot: &mut TaskSlot) -> Result<(), HardwareError> {
        let input = (self.factory)()?;
        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        shared.loop_alive.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(count_edges(input, shared, cancel.clone()));
        slot.cancel = cancel;
        slot.handle = Some(handle);
        Ok(())
    }

    /// Read-and-reset. Zero means no pulses this window (or no hardware).
    pub fn drain(&self) -> u64 {
        let mut pulses = self.shared.pulses.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *pulses)
    }
}

#[async_trait]
impl SensorSource for FlowSource {
    fn name(&self) -> &'static str {
        "flow_meter"
    }

    // Edge-triggered input has no natural staleness: no flow means no
    // edges. Health is just the loop being alive.
    fn is_healthy(&self) -> bool {
        self.shared.loop_alive.load(Ordering::SeqCst)
    }

    async fn restart(&self) -> Result<(), HardwareError> {
        let mut slot = self.slot.lock().await;
        slot.shut_down().await;
        self.shared.loop_alive.store(false, Ordering::SeqCst);
        info!("restarting flow meter monitoring");
        self.start_locked(&mut slot)
    }

    async fn stop(&self) {
        let mut slot = self.slot.lock().await;
        slot.shut_down().await;
        self.shared.loop_alive.store(false, Ordering::SeqCst);
    }
}

async fn count_edges(
    mut input: Box<dyn PulseInput>,
    shared: Arc<FlowShared>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = input.wait_edge() => match result {
                Ok(()) => {
                    let mut pulses =
                        shared.pulses.lock().unwrap_or_else(|e| e.into_inner());
                    *pulses += 1;
                }
                Err(e) => {
                    if shared.edge_errors.should_emit() {
                        warn!(error = %e, "flow meter edge wait failed");
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
        }
    }
    shared.loop_alive.store(false, Ordering::SeqCst);
    debug!("flow meter loop stopped");
}

/// Pulses over one collection window converted to litres per hour.
pub fn litres_per_hour(pulses: u64, pulses_per_litre: u32, window: Duration) -> f64 {
    if pulses_per_litre == 0 || window.is_zero() {
        return 0.0;
    }
    let litres = pulses as f64 / pulses_per_litre as f64;
    litres / (window.as_secs_f64() / 3600.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct BurstInput {
        remaining: u32,
    }

    #[async_trait]
    impl PulseInput for BurstInput {
        async fn wait_edge(&mut self) -> Result<(), HardwareError> {
            if self.remaining == 0 {
                std::future::pending::<()>().await;
            }
            self.remaining -= 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn drain_reads_and_resets() {
        let factory: PulseFactory =
            Arc::new(|| Ok(Box::new(BurstInput { remaining: 7 }) as Box<dyn PulseInput>));
        let source = FlowSource::spawn(factory).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(source.drain(), 7);
        assert_eq!(source.drain(), 0);
        assert!(source.is_healthy());
        source.stop().await;
        assert!(!source.is_healthy());
    }

    #[tokio::test]
    async fn restart_reopens_the_input() {
        let opens = Arc::new(AtomicU32::new(0));
        let opens_in_factory = Arc::clone(&opens);
        let factory: PulseFactory = Arc::new(move || {
            opens_in_factory.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(BurstInput { remaining: 0 }) as Box<dyn PulseInput>)
        });
        let source = FlowSource::spawn(factory).await;
        source.restart().await.unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        source.stop().await;
    }

    #[test]
    fn litres_per_hour_uses_calibration_and_window() {
        // 450 pulses per litre, 900 pulses in one minute => 2 litres/min.
        let rate = litres_per_hour(900, 450, Duration::from_secs(60));
        assert!((rate - 120.0).abs() < 1e-9, "rate {rate}");
        assert_eq!(litres_per_hour(10, 0, Duration::from_secs(60)), 0.0);
    }
}
