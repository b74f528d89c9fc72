//! Hardware seams. The acquisition loops talk to serial ports, the I2C bus,
//! GPIO edges and the camera only through these traits, and reopen handles
//! through the factories so a restart gets a fresh device.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("device absent: {0}")]
    Absent(String),
    #[error("hardware i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("hardware fault: {0}")]
    Fault(String),
}

/// A serial link delivering NMEA sentences, one at a time.
#[async_trait]
pub trait NmeaLink: Send {
    async fn read_sentence(&mut self) -> Result<String, HardwareError>;
}

/// Three-axis reads off the IMU's I2C bus.
#[async_trait]
pub trait ImuBus: Send {
    async fn read_accel(&mut self) -> Result<[f64; 3], HardwareError>;
    async fn read_gyro(&mut self) -> Result<[f64; 3], HardwareError>;
    async fn read_mag(&mut self) -> Result<[f64; 3], HardwareError>;
}

/// Edge-triggered pulse line (flow meter). Resolves on the next edge.
#[async_trait]
pub trait PulseInput: Send {
    async fn wait_edge(&mut self) -> Result<(), HardwareError>;
}

/// One-shot camera capture returning an encoded JPEG.
#[async_trait]
pub trait FrameGrabber: Send {
    async fn grab_jpeg(&mut self) -> Result<Vec<u8>, HardwareError>;
}

pub type LinkFactory = Arc<dyn Fn() -> Result<Box<dyn NmeaLink>, HardwareError> + Send + Sync>;
pub type BusFactory = Arc<dyn Fn() -> Result<Box<dyn ImuBus>, HardwareError> + Send + Sync>;
pub type PulseFactory = Arc<dyn Fn() -> Result<Box<dyn PulseInput>, HardwareError> + Send + Sync>;
pub type GrabberFactory =
    Arc<dyn Fn() -> Result<Box<dyn FrameGrabber>, HardwareError> + Send + Sync>;
