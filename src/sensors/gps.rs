//! GPS source: a background task reads NMEA sentences off the receiver's
//! serial link (~1 Hz) and folds them into a latest-value snapshot. The
//! collection tick drains the snapshot without ever touching the port.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::hal::{HardwareError, LinkFactory, NmeaLink};
use super::{RateLimited, SensorSource, TaskSlot};
use crate::types::{FixQuality, GpsSnapshot};

const STALE_AFTER: Duration = Duration::from_secs(30);
const READ_ERROR_PAUSE: Duration = Duration::from_secs(1);

struct GpsShared {
    state: Mutex<GpsSnapshot>,
    /// Set when a sentence lands, cleared by drain. A drain window with no
    /// traffic yields the no-data result.
    fresh: AtomicBool,
    last_read: Mutex<Option<Instant>>,
    loop_alive: AtomicBool,
    read_errors: RateLimited,
}

pub struct GpsSource {
    factory: LinkFactory,
    shared: Arc<GpsShared>,
    slot: tokio::sync::Mutex<TaskSlot>,
    stale_after: Duration,
}

impl GpsSource {
    /// Open the link and start the acquisition loop. A missing receiver is
    /// not fatal here: the source comes up unhealthy and the health monitor
    /// drives restarts.
    pub async fn spawn(factory: LinkFactory) -> Arc<Self> {
        Self::spawn_with_staleness(factory, STALE_AFTER).await
    }

    pub async fn spawn_with_staleness(factory: LinkFactory, stale_after: Duration) -> Arc<Self> {
        let source = Arc::new(Self {
            factory,
            shared: Arc::new(GpsShared {
                state: Mutex::new(GpsSnapshot::default()),
                fresh: AtomicBool::new(false),
                last_read: Mutex::new(None),
                loop_alive: AtomicBool::new(false),
                read_errors: RateLimited::new(Duration::from_secs(10)),
            }),
            slot: tokio::sync::Mutex::new(TaskSlot::empty()),
            stale_after,
        });

        let mut slot = source.slot.lock().await;
        if let Err(e) = source.start_locked(&mut slot) {
            warn!(error = %e, "GPS receiver unavailable at startup, continuing without it");
        }
        drop(slot);
        source
    }

    fn start_locked(&self, slot: &mut TaskSlot) -> Result<(), HardwareError> {
        let link = (self.factory)()?;
        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        shared.loop_alive.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(acquisition_loop(link, shared, cancel.clone()));
        slot.cancel = cancel;
        slot.handle = Some(handle);
        Ok(())
    }

    /// Return the latest snapshot if any sentence arrived since the last
    /// drain. Never blocks: the state lock is held only for the copy.
    pub fn drain(&self) -> Option<GpsSnapshot> {
        if self.shared.fresh.swap(false, Ordering::SeqCst) {
            let state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            Some(state.clone())
        } else {
            None
        }
    }
}

#[async_trait]
impl SensorSource for GpsSource {
    fn name(&self) -> &'static str {
        "gps"
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
        info!("restarting GPS acquisition");
        self.start_locked(&mut slot)
    }

    async fn stop(&self) {
        let mut slot = self.slot.lock().await;
        slot.shut_down().await;
        self.shared.loop_alive.store(false, Ordering::SeqCst);
    }
}

async fn acquisition_loop(
    mut link: Box<dyn NmeaLink>,
    shared: Arc<GpsShared>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = link.read_sentence() => match result {
                Ok(sentence) => {
                    let applied = {
                        let mut state =
                            shared.state.lock().unwrap_or_else(|e| e.into_inner());
                        apply_sentence(&mut state, &sentence)
                    };
                    if applied {
                        *shared.last_read.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(Instant::now());
                        shared.fresh.store(true, Ordering::SeqCst);
                    } else {
                        debug!(sentence = %sentence.trim(), "ignored NMEA sentence");
                    }
                }
                Err(e) => {
                    if shared.read_errors.should_emit() {
                        warn!(error = %e, "GPS serial read failed");
                    }
                    tokio::time::sleep(READ_ERROR_PAUSE).await;
                }
            },
        }
    }
    shared.loop_alive.store(false, Ordering::SeqCst);
    debug!("GPS acquisition loop stopped");
}

/// Fold one sentence into the snapshot. Later sentences overwrite earlier
/// values field by field. Returns false for unknown or corrupt sentences.
pub(crate) fn apply_sentence(state: &mut GpsSnapshot, sentence: &str) -> bool {
    let Some(body) = verify_checksum(sentence.trim()) else {
        return false;
    };
    let fields: Vec<&str> = body.split(',').collect();
    let Some(kind) = fields.first() else {
        return false;
    };
    // Talker prefix (GP/GN/GL) varies by constellation; dispatch on suffix.
    match kind.get(kind.len().saturating_sub(3)..) {
        Some("RMC") => parse_rmc(state, &fields),
        Some("GGA") => parse_gga(state, &fields),
        Some("GSA") => parse_gsa(state, &fields),
        Some("GSV") => parse_gsv(state, &fields),
        _ => false,
    }
}

/// Strip `$...*hh` framing and verify the XOR checksum.
fn verify_checksum(sentence: &str) -> Option<&str> {
    let inner = sentence.strip_prefix('$')?;
    let (body, given) = inner.rsplit_once('*')?;
    let given = u8::from_str_radix(given, 16).ok()?;
    let computed = body.bytes().fold(0u8, |acc, b| acc ^ b);
    (computed == given).then_some(body)
}

fn parse_rmc(state: &mut GpsSnapshot, fields: &[&str]) -> bool {
    if fields.len() < 10 {
        return false;
    }
    let active = fields[2] == "A";
    if active {
        if let Some(lat) = parse_coordinate(fields[3], fields[4], 2) {
            state.latitude = Some(lat);
        }
        if let Some(lon) = parse_coordinate(fields[5], fields[6], 3) {
            state.longitude = Some(lon);
        }
        if state.latitude.is_some() && state.longitude.is_some() {
            state.fix_updated = Some(Instant::now());
        }
    } else {
        state.latitude = None;
        state.longitude = None;
        state.fix_updated = None;
    }
    if let Ok(knots) = fields[7].parse::<f64>() {
        state.speed_kmh = Some(knots * 1.852);
    }
    if let Ok(course) = fields[8].parse::<f64>() {
        state.course_deg = Some(course);
    }
    state.receiver_time = parse_datetime(fields[9], fields[1]);
    true
}

fn parse_gga(state: &mut GpsSnapshot, fields: &[&str]) -> bool {
    if fields.len() < 10 {
        return false;
    }
    if let Ok(sats) = fields[7].parse::<u32>() {
        state.satellites_used = Some(sats);
    }
    if let Ok(hdop) = fields[8].parse::<f64>() {
        state.hdop = Some(hdop);
    }
    if let Ok(alt) = fields[9].parse::<f64>() {
        state.altitude_m = Some(alt);
    }
    true
}

fn parse_gsa(state: &mut GpsSnapshot, fields: &[&str]) -> bool {
    if fields.len() < 3 {
        return false;
    }
    state.fix_quality = match fields[2] {
        "2" => FixQuality::Fix2d,
        "3" => FixQuality::Fix3d,
        _ => FixQuality::NoFix,
    };
    true
}

fn parse_gsv(state: &mut GpsSnapshot, fields: &[&str]) -> bool {
    if fields.len() < 4 {
        return false;
    }
    if let Ok(sats) = fields[3].parse::<u32>() {
        state.satellites_in_view = Some(sats);
    }
    true
}

/// DDMM.MMMM (or DDDMM.MMMM for longitude) to signed decimal degrees.
fn parse_coordinate(value: &str, hemisphere: &str, degree_digits: usize) -> Option<f64> {
    if value.len() <= degree_digits {
        return None;
    }
    let degrees: f64 = value.get(..degree_digits)?.parse().ok()?;
    let minutes: f64 = value.get(degree_digits..)?.parse().ok()?;
    let mut decimal = degrees + minutes / 60.0;
    if hemisphere == "S" || hemisphere == "W" {
        decimal = -decimal;
    }
    Some(decimal)
}

/// RMC ddmmyy + hhmmss(.sss) into a UTC timestamp.
fn parse_datetime(date: &str, time: &str) -> Option<DateTime<Utc>> {
    if date.len() < 6 || time.len() < 6 {
        return None;
    }
    let day: u32 = date.get(..2)?.parse().ok()?;
    let month: u32 = date.get(2..4)?.parse().ok()?;
    let year: i32 = date.get(4..6)?.parse().ok()?;
    let hour: u32 = time.get(..2)?.parse().ok()?;
    let minute: u32 = time.get(2..4)?.parse().ok()?;
    let second: u32 = time.get(4..6)?.parse().ok()?;
    let naive = NaiveDate::from_ymd_opt(2000 + year, month, day)?
        .and_time(NaiveTime::from_hms_opt(hour, minute, second)?);
    Some(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use std::collections::VecDeque;

    // Live captures from the receiver, checksums intact.
    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

    fn checksummed(body: &str) -> String {
        let sum = body.bytes().fold(0u8, |acc, b| acc ^ b);
        format!("${body}*{sum:02X}")
    }

    #[test]
    fn rmc_parses_position_speed_and_time() {
        let mut state = GpsSnapshot::default();
        assert!(apply_sentence(&mut state, RMC));
        let lat = state.latitude.unwrap();
        let lon = state.longitude.unwrap();
        assert!((lat - 48.1173).abs() < 1e-3, "lat {lat}");
        assert!((lon - 11.5167).abs() < 1e-3, "lon {lon}");
        assert!((state.speed_kmh.unwrap() - 22.4 * 1.852).abs() < 1e-9);
        assert_eq!(state.course_deg, Some(84.4));
        let when = state.receiver_time.unwrap();
        assert_eq!(when.hour(), 12);
        assert_eq!(when.minute(), 35);
        assert!(state.fix_valid());
    }

    #[test]
    fn southern_and_western_hemispheres_negate() {
        let body = "GPRMC,123519,A,4807.038,S,01131.000,W,000.0,000.0,230394,,";
        let mut state = GpsSnapshot::default();
        assert!(apply_sentence(&mut state, &checksummed(body)));
        assert!(state.latitude.unwrap() < 0.0);
        assert!(state.longitude.unwrap() < 0.0);
    }

    #[test]
    fn void_rmc_clears_position() {
        let mut state = GpsSnapshot::default();
        assert!(apply_sentence(&mut state, RMC));
        let void = "GPRMC,123520,V,,,,,,,230394,,";
        assert!(apply_sentence(&mut state, &checksummed(void)));
        assert_eq!(state.latitude, None);
        assert!(!state.fix_valid());
    }

    #[test]
    fn gga_fills_altitude_and_satellites() {
        let mut state = GpsSnapshot::default();
        assert!(apply_sentence(&mut state, GGA));
        assert_eq!(state.altitude_m, Some(545.4));
        assert_eq!(state.satellites_used, Some(8));
        assert_eq!(state.hdop, Some(0.9));
    }

    #[test]
    fn gga_traffic_does_not_revalidate_an_old_fix() {
        let mut state = GpsSnapshot::default();
        assert!(apply_sentence(&mut state, RMC));
        assert!(state.fix_valid());

        // Position last refreshed beyond the recency window; the receiver
        // keeps chattering GGA without fixing.
        state.fix_updated = Instant::now().checked_sub(Duration::from_secs(31));
        assert!(apply_sentence(&mut state, GGA));
        assert!(!state.fix_valid(), "GGA alone must not revalidate the fix");
    }

    #[test]
    fn gsa_sets_fix_quality() {
        let body = "GPGSA,A,3,04,05,,09,12,,,24,,,,,2.5,1.3,2.1";
        let mut state = GpsSnapshot::default();
        assert!(apply_sentence(&mut state, &checksummed(body)));
        assert_eq!(state.fix_quality, FixQuality::Fix3d);
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let mut state = GpsSnapshot::default();
        let corrupted = RMC.replace("*6A", "*00");
        assert!(!apply_sentence(&mut state, &corrupted));
        assert_eq!(state, GpsSnapshot::default());
    }

    struct ScriptedLink {
        sentences: VecDeque<String>,
    }

    #[async_trait]
    impl NmeaLink for ScriptedLink {
        async fn read_sentence(&mut self) -> Result<String, HardwareError> {
            match self.sentences.pop_front() {
                Some(s) => Ok(s),
                None => {
                    // Quiet link: park until cancelled.
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    #[tokio::test]
    async fn drain_returns_snapshot_once_then_no_data() {
        let sentences: Vec<String> = vec![RMC.to_string(), GGA.to_string()];
        let factory: LinkFactory = Arc::new(move || {
            Ok(Box::new(ScriptedLink {
                sentences: sentences.clone().into(),
            }) as Box<dyn NmeaLink>)
        });
        let source = GpsSource::spawn(factory).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snap = source.drain().expect("sentence arrived");
        assert!(snap.fix_valid());
        assert_eq!(snap.altitude_m, Some(545.4));
        // Nothing new since: explicit no-data, not a stale copy.
        assert!(source.drain().is_none());
        source.stop().await;
    }

    #[tokio::test]
    async fn absent_hardware_leaves_source_unhealthy() {
        let factory: LinkFactory =
            Arc::new(|| Err(HardwareError::Absent("no /dev/ttyGSM1".into())));
        let source = GpsSource::spawn(factory).await;
        assert!(!source.is_healthy());
        assert!(source.drain().is_none());
        assert!(source.restart().await.is_err());
        source.stop().await;
    }
}
