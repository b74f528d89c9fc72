//! IMU source: samples accelerometer, gyroscope and magnetometer at the
//! configured rate, derives a tilt-compensated heading, and buffers samples
//! until the collection tick drains them.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::hal::{BusFactory, HardwareError, ImuBus};
use super::{RateLimited, SensorSource, TaskSlot};
use crate::types::ImuSample;

const STALE_AFTER: Duration = Duration::from_secs(30);
const MAX_CONSECUTIVE_CYCLE_FAILURES: u32 = 3;
const ERROR_LOG_WINDOW: Duration = Duration::from_secs(10);

struct ImuShared {
    buffer: Mutex<Vec<ImuSample>>,
    last_read: Mutex<Option<Instant>>,
    loop_alive: AtomicBool,
    cycle_failures: AtomicU32,
    accel_errors: RateLimited,
    gyro_errors: RateLimited,
    mag_errors: RateLimited,
}

pub struct ImuSource {
    factory: BusFactory,
    shared: Arc<ImuShared>,
    slot: tokio::sync::Mutex<TaskSlot>,
    sample_period: Duration,
    stale_after: Duration,
}

impl ImuSource {
    pub async fn spawn(factory: BusFactory, rate_per_second: u32) -> Arc<Self> {
        Self::spawn_with_staleness(factory, rate_per_second, STALE_AFTER).await
    }

    pub async fn spawn_with_staleness(
        factory: BusFactory,
        rate_per_second: u32,
        stale_after: Duration,
    ) -> Arc<Self> {
        let source = Arc::new(Self {
            factory,
            shared: Arc::new(ImuShared {
                buffer: Mutex::new(Vec::new()),
                last_read: Mutex::new(None),
                loop_alive: AtomicBool::new(false),
                cycle_failures: AtomicU32::new(0),
                accel_errors: RateLimited::new(ERROR_LOG_WINDOW),
                gyro_errors: RateLimited::new(ERROR_LOG_WINDOW),
                mag_errors: RateLimited::new(ERROR_LOG_WINDOW),
            }),
            slot: tokio::sync::Mutex::new(TaskSlot::empty()),
            sample_period: Duration::from_secs_f64(1.0 / rate_per_second.max(1) as f64),
            stale_after,
        });

        let mut slot = source.slot.lock().await;
        if let Err(e) = source.start_locked(&mut slot) {
            warn!(error = %e, "IMU unavailable at startup, continuing without it");
        }
        drop(slot);
        source
    }

    fn start_locked(&self, slot: &mut TaskSlot) -> Result<(), HardwareError> {
        let bus = (self.factory)()?;
        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        shared.loop_alive.store(true, Ordering::SeqCst);
        shared.cycle_failures.store(0, Ordering::SeqCst);
        let period = self.sample_period;
        let handle = tokio::spawn(acquisition_loop(bus, shared, period, cancel.clone()));
        slot.cancel = cancel;
        slot.handle = Some(handle);
        Ok(())
    }

    /// Swap the sample buffer out atomically. Possibly empty, never blocks.
    pub fn drain(&self) -> Vec<ImuSample> {
        let mut buffer = self.shared.buffer.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *buffer)
    }
}

#[async_trait]
impl SensorSource for ImuSource {
    fn name(&self) -> &'static str {
        "imu"
    }

    fn is_healthy(&self) -> bool {
        if !self.shared.loop_alive.load(Ordering::SeqCst) {
            return false;
        }
        let last = self
            .shared
            .last_read
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) => at.elapsed() < self.stale_after,
            None => false,
        }
    }

    async fn restart(&self) -> Result<(), HardwareError> {
        let mut slot = self.slot.lock().await;
        slot.shut_down().await;
        self.shared.loop_alive.store(false, Ordering::SeqCst);
        info!("restarting IMU acquisition");
        self.start_locked(&mut slot)
    }

    async fn stop(&self) {
        let mut slot = self.slot.lock().await;
        slot.shut_down().await;
        self.shared.loop_alive.store(false, Ordering::SeqCst);
    }
}

async fn acquisition_loop(
    mut bus: Box<dyn ImuBus>,
    shared: Arc<ImuShared>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match read_cycle(bus.as_mut(), &shared).await {
                    Some(sample) => {
                        shared.cycle_failures.store(0, Ordering::SeqCst);
                        {
                            let mut buffer =
                                shared.buffer.lock().unwrap_or_else(|e| e.into_inner());
                            buffer.push(sample);
                        }
                        *shared.last_read.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(Instant::now());
                    }
                    None => {
                        let failures =
                            shared.cycle_failures.fetch_add(1, Ordering::SeqCst) + 1;
                        if failures >= MAX_CONSECUTIVE_CYCLE_FAILURES {
                            warn!(failures, "IMU bus failing repeatedly, stopping loop for restart");
                            break;
                        }
                    }
                }
            }
        }
    }
    shared.loop_alive.store(false, Ordering::SeqCst);
    debug!("IMU acquisition loop stopped");
}

/// One full sample cycle. Any axis-group failure voids the whole cycle so a
/// sample is never half-populated.
async fn read_cycle(bus: &mut dyn ImuBus, shared: &ImuShared) -> Option<ImuSample> {
    let accel = match bus.read_accel().await {
        Ok(v) => v,
        Err(e) => {
            if shared.accel_errors.should_emit() {
                warn!(error = %e, "accelerometer read failed");
            }
            return None;
        }
    };
    let gyro = match bus.read_gyro().await {
        Ok(v) => v,
        Err(e) => {
            if shared.gyro_errors.should_emit() {
                warn!(error = %e, "gyroscope read failed");
            }
            return None;
        }
    };
    let mag = match bus.read_mag().await {
        Ok(v) => v,
        Err(e) => {
            if shared.mag_errors.should_emit() {
                warn!(error = %e, "magnetometer read failed");
            }
            return None;
        }
    };

    Some(ImuSample {
        gyr_x: gyro[0],
        gyr_y: gyro[1],
        gyr_z: gyro[2],
        mag_x: mag[0],
        mag_y: mag[1],
        mag_z: mag[2],
        acc_x: accel[0],
        acc_y: accel[1],
        acc_z: accel[2],
        heading_compensated_deg: tilt_compensated_heading(accel, mag),
    })
}

/// Standard tilt compensation: roll/pitch from the accelerometer project the
/// magnetometer vector onto the horizontal plane before taking the heading.
pub(crate) fn tilt_compensated_heading(accel: [f64; 3], mag: [f64; 3]) -> f64 {
    let [ax, ay, az] = accel;
    let [mx, my, mz] = mag;

    let roll = ay.atan2(az);
    let pitch = (-ax).atan2((ay * ay + az * az).sqrt());

    let mx_comp = mx * pitch.cos() + mz * pitch.sin();
    let my_comp =
        mx * roll.sin() * pitch.sin() + my * roll.cos() - mz * roll.sin() * pitch.cos();

    let mut heading = my_comp.atan2(mx_comp).to_degrees();
    if heading < 0.0 {
        heading += 360.0;
    }
    heading
}
