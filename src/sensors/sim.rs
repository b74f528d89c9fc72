//! Simulated hardware backends for running the session manager off-target.
//! Produces plausible-looking readings so the whole pipeline can be
//! exercised without a receiver, IMU, flow sensor or camera attached.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use super::hal::{
    BusFactory, FrameGrabber, GrabberFactory, HardwareError, ImuBus, LinkFactory, NmeaLink,
    PulseFactory, PulseInput,
};

fn nmea_checksum(body: &str) -> String {
    let sum = body.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("${body}*{sum:02X}")
}

/// Emits an RMC/GGA/GSA rotation at roughly sentence-per-second pace,
/// drifting slowly around a base coordinate.
pub struct SimNmeaLink {
    lat: f64,
    lon: f64,
    step: u32,
}

impl SimNmeaLink {
    fn new() -> Self {
        Self {
            lat: 4807.038,
            lon: 1131.0,
            step: 0,
        }
    }
}

#[async_trait]
impl NmeaLink for SimNmeaLink {
    async fn read_sentence(&mut self) -> Result<String, HardwareError> {
        tokio::time::sleep(Duration::from_millis(333)).await;
        let mut rng = rand::thread_rng();
        self.lat += rng.gen_range(-0.002..0.002);
        self.lon += rng.gen_range(-0.002..0.002);
        let speed_knots: f64 = rng.gen_range(0.0..12.0);
        let course: f64 = rng.gen_range(0.0..360.0);
        let body = match self.step % 3 {
            0 => format!(
                "GPRMC,120000,A,{:.3},N,{:0>9.3},E,{:05.1},{:05.1},010625,,",
                self.lat, self.lon, speed_knots, course
            ),
            1 => format!("GPGGA,120000,{:.3},N,{:0>9.3},E,1,08,0.9,545.4,M,46.9,M,,", self.lat, self.lon),
            _ => "GPGSA,A,3,04,05,,09,12,,,24,,,,,2.5,1.3,2.1".to_string(),
        };
        self.step = self.step.wrapping_add(1);
        Ok(nmea_checksum(&body))
    }
}

pub struct SimImuBus;

#[async_trait]
impl ImuBus for SimImuBus {
    async fn read_accel(&mut self) -> Result<[f64; 3], HardwareError> {
        let mut rng = rand::thread_rng();
        Ok([
            rng.gen_range(-0.05..0.05),
            rng.gen_range(-0.05..0.05),
            1.0 + rng.gen_range(-0.02..0.02),
        ])
    }

    async fn read_gyro(&mut self) -> Result<[f64; 3], HardwareError> {
        let mut rng = rand::thread_rng();
        Ok([
            rng.gen_range(-2.0..2.0),
            rng.gen_range(-2.0..2.0),
            rng.gen_range(-2.0..2.0),
        ])
    }

    async fn read_mag(&mut self) -> Result<[f64; 3], HardwareError> {
        let mut rng = rand::thread_rng();
        Ok([
            0.2 + rng.gen_range(-0.01..0.01),
            rng.gen_range(-0.01..0.01),
            0.05 + rng.gen_range(-0.01..0.01),
        ])
    }
}

/// Random trickle of pulses, as if water were moving most of the time.
pub struct SimPulseInput;

#[async_trait]
impl PulseInput for SimPulseInput {
    async fn wait_edge(&mut self) -> Result<(), HardwareError> {
        let wait = rand::thread_rng().gen_range(20..400);
        tokio::time::sleep(Duration::from_millis(wait)).await;
        Ok(())
    }
}

/// A fixed minimal JPEG so downstream base64/upload paths see real bytes.
pub struct SimFrameGrabber;

#[async_trait]
impl FrameGrabber for SimFrameGrabber {
    async fn grab_jpeg(&mut self) -> Result<Vec<u8>, HardwareError> {
        Ok(vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9])
    }
}

pub fn nmea_factory() -> LinkFactory {
    Arc::new(|| Ok(Box::new(SimNmeaLink::new()) as Box<dyn NmeaLink>))
}

pub fn imu_factory() -> BusFactory {
    Arc::new(|| Ok(Box::new(SimImuBus) as Box<dyn ImuBus>))
}

pub fn pulse_factory() -> PulseFactory {
    Arc::new(|| Ok(Box::new(SimPulseInput) as Box<dyn PulseInput>))
}

pub fn grabber_factory() -> GrabberFactory {
    Arc::new(|| Ok(Box::new(SimFrameGrabber) as Box<dyn FrameGrabber>))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::gps::apply_sentence;
    use crate::types::GpsSnapshot;

    #[tokio::test]
    async fn simulated_sentences_parse() {
        let mut link = SimNmeaLink::new();
        let mut state = GpsSnapshot::default();
        for _ in 0..3 {
            let sentence = link.read_sentence().await.unwrap();
            assert!(apply_sentence(&mut state, &sentence), "bad sim sentence {sentence}");
        }
        assert!(state.fix_valid());
    }
}
