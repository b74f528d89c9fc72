use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// How recently the position must have been refreshed for the fix to count.
const FIX_RECENCY: Duration = Duration::from_secs(30);

/// One IMU buffer entry. Field names match the ingest API exactly.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ImuSample {
    #[serde(rename = "GYRx")]
    pub gyr_x: f64,
    #[serde(rename = "GYRy")]
    pub gyr_y: f64,
    #[serde(rename = "GYRz")]
    pub gyr_z: f64,
    #[serde(rename = "MAGx")]
    pub mag_x: f64,
    #[serde(rename = "MAGy")]
    pub mag_y: f64,
    #[serde(rename = "MAGz")]
    pub mag_z: f64,
    #[serde(rename = "ACCx")]
    pub acc_x: f64,
    #[serde(rename = "ACCy")]
    pub acc_y: f64,
    #[serde(rename = "ACCz")]
    pub acc_z: f64,
    pub heading_compensated_deg: f64,
}

/// Merged snapshot of every sensor source for one collection tick.
/// Immutable once constructed; GPS fields are null without a fix.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub flow_meter_counter: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub heading: Option<f64>,
    #[serde(rename = "IMU")]
    pub imu: Vec<ImuSample>,
    pub image_base_64: Option<String>,
    pub gps_fix: bool,
}

/// The batch as it travels to the ingest endpoint (and to the offline
/// store, which persists the exact wire shape).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UploadEnvelope {
    pub device_uuid: String,
    #[serde(rename = "sessionTimestamp")]
    pub session_timestamp: DateTime<Utc>,
    pub sleep_time: u64,
    pub payload: Vec<DataPoint>,
}

/// GPS fix dimensionality as reported by GSA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FixQuality {
    #[default]
    NoFix,
    Fix2d,
    Fix3d,
}

/// Latest-value GPS state, merged across sentence types. Internal only;
/// the tick loop projects it into the nullable DataPoint fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpsSnapshot {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude_m: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub course_deg: Option<f64>,
    pub fix_quality: FixQuality,
    pub satellites_used: Option<u32>,
    pub satellites_in_view: Option<u32>,
    pub hdop: Option<f64>,
    /// UTC time assembled from the receiver's RMC date + time fields.
    pub receiver_time: Option<DateTime<Utc>>,
    /// When the position was last refreshed by an active RMC. GGA/GSA
    /// traffic alone does not touch this, so a receiver that stops fixing
    /// cannot coast on an old position.
    pub fix_updated: Option<Instant>,
}

impl GpsSnapshot {
    /// A fix counts only when we have a position, a receiver timestamp and
    /// a position refresh inside the recency window.
    pub fn fix_valid(&self) -> bool {
        self.latitude.is_some()
            && self.longitude.is_some()
            && self.receiver_time.is_some()
            && self
                .fix_updated
                .is_some_and(|at| at.elapsed() < FIX_RECENCY)
    }
}
