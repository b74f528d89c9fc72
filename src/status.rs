//! Device status indication. The LED daemon and docking sensor are external
//! collaborators; this module owns only the priority contract: a pure
//! function from the current condition flags to the single state shown.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedState {
    Booting,
    Malfunctioning,
    Undocked,
    GpsNoFix,
    ImuCalibrating,
    CellularNoSignal,
    Ok,
    Charging,
}

impl LedState {
    pub fn wire_name(&self) -> &'static str {
        match self {
            LedState::Booting => "booting",
            LedState::Malfunctioning => "malfunctioning",
            LedState::Undocked => "undocked",
            LedState::GpsNoFix => "gps_no_fix",
            LedState::ImuCalibrating => "imu_calibrating",
            LedState::CellularNoSignal => "cellular_no_signal",
            LedState::Ok => "ok",
            LedState::Charging => "charging",
        }
    }
}

/// Everything the indicator decision depends on, sampled each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInputs {
    pub booting: bool,
    pub malfunctioning: bool,
    pub docked: bool,
    pub gps_fix: bool,
    pub imu_calibrating: bool,
    pub cellular_signal: bool,
    pub session_running: bool,
    pub charging: bool,
}

/// Highest-priority active condition wins; no hidden mutable priority list.
pub fn resolve(inputs: &StatusInputs) -> LedState {
    if inputs.booting {
        LedState::Booting
    } else if inputs.malfunctioning {
        LedState::Malfunctioning
    } else if !inputs.docked {
        LedState::Undocked
    } else if !inputs.gps_fix {
        LedState::GpsNoFix
    } else if inputs.imu_calibrating {
        LedState::ImuCalibrating
    } else if !inputs.cellular_signal {
        LedState::CellularNoSignal
    } else if inputs.session_running {
        LedState::Ok
    } else if inputs.charging {
        LedState::Charging
    } else {
        // Nothing we recognize is active; treat as a fault, not as ok.
        LedState::Malfunctioning
    }
}

pub trait StatusIndicator: Send + Sync {
    fn set_state(&self, state: LedState);
}

/// Talks to the LED daemon's one-shot line protocol on its unix socket.
pub struct UnixSocketIndicator {
    socket_path: PathBuf,
}

impl UnixSocketIndicator {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }
}

impl StatusIndicator for UnixSocketIndicator {
    fn set_state(&self, state: LedState) {
        let command = format!("{}\n", state.wire_name());
        match UnixStream::connect(&self.socket_path)
            .and_then(|mut stream| stream.write_all(command.as_bytes()))
        {
            Ok(()) => debug!(state = state.wire_name(), "LED state sent"),
            Err(e) => warn!(error = %e, state = state.wire_name(), "LED daemon unreachable"),
        }
    }
}

/// Fallback indicator when no LED daemon is present (bench runs).
pub struct LogIndicator;

impl StatusIndicator for LogIndicator {
    fn set_state(&self, state: LedState) {
        debug!(state = state.wire_name(), "status changed");
    }
}

/// Docking sensor collaborator: current docked/undocked level.
pub trait DockSensor: Send + Sync {
    fn docked(&self) -> bool;
}

pub struct FixedDockSensor(pub bool);

impl DockSensor for FixedDockSensor {
    fn docked(&self) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_clear() -> StatusInputs {
        StatusInputs {
            booting: false,
            malfunctioning: false,
            docked: true,
            gps_fix: true,
            imu_calibrating: false,
            cellular_signal: true,
            session_running: true,
            charging: false,
        }
    }

    #[test]
    fn all_clear_resolves_ok() {
        assert_eq!(resolve(&all_clear()), LedState::Ok);
    }

    #[test]
    fn booting_outranks_everything() {
        let inputs = StatusInputs {
            booting: true,
            malfunctioning: true,
            docked: false,
            gps_fix: false,
            ..all_clear()
        };
        assert_eq!(resolve(&inputs), LedState::Booting);
    }

    #[test]
    fn priority_order_holds_pairwise() {
        let mut inputs = all_clear();
        inputs.malfunctioning = true;
        inputs.docked = false;
        assert_eq!(resolve(&inputs), LedState::Malfunctioning);

        let mut inputs = all_clear();
        inputs.docked = false;
        inputs.gps_fix = false;
        assert_eq!(resolve(&inputs), LedState::Undocked);

        let mut inputs = all_clear();
        inputs.gps_fix = false;
        inputs.imu_calibrating = true;
        assert_eq!(resolve(&inputs), LedState::GpsNoFix);

        let mut inputs = all_clear();
        inputs.imu_calibrating = true;
        inputs.cellular_signal = false;
        assert_eq!(resolve(&inputs), LedState::ImuCalibrating);

        let mut inputs = all_clear();
        inputs.cellular_signal = false;
        assert_eq!(resolve(&inputs), LedState::CellularNoSignal);
    }

    #[test]
    fn charging_shows_only_when_session_idle() {
        let mut inputs = all_clear();
        inputs.charging = true;
        assert_eq!(resolve(&inputs), LedState::Ok);

        inputs.session_running = false;
        assert_eq!(resolve(&inputs), LedState::Charging);
    }

    #[test]
    fn nothing_active_is_a_fault() {
        let mut inputs = all_clear();
        inputs.session_running = false;
        assert_eq!(resolve(&inputs), LedState::Malfunctioning);
    }
}
