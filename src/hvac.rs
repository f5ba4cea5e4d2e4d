/*! HVAC zone runtime.

A zone is commanded as one packed byte (mode, heat source, fan) plus
two trip points in whole °F. The device is picky about trip point
consistency, so before sending anything the runtime nudges the pair
until it satisfies the active mode: heating wants the high trip at
least two degrees above the low, cooling the mirror image, and
heat/cool mode just wants them ordered.

Status comes back as eight bytes including the measured indoor and
outdoor temperatures in signed 8.8 fixed point.
 */
use std::sync::Mutex;
use std::time::Duration;

use crate::command::{self, FanMode, HeatSource, HvacMode};
use crate::device::{DeviceCommand, Runtime, StateUpdate};
use crate::{Error, Result};

/// Zone activity as reported in status byte 3 (low nibble).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
#[allow(missing_docs)] // The names are the documentation.
pub enum ZoneActivity {
    Idle = 0,
    Heating = 1,
    Cooling = 2,
    FanRunning = 3,
    Waiting = 4,
    HeatPumpHeating = 5,
    Dehumidifying = 6,
    Defrosting = 7,
    Standby = 8,
}

impl ZoneActivity {
    fn from_raw(value: u8) -> Option<Self> {
        use ZoneActivity::*;
        Some(match value {
            0 => Idle,
            1 => Heating,
            2 => Cooling,
            3 => FanRunning,
            4 => Waiting,
            5 => HeatPumpHeating,
            6 => Dehumidifying,
            7 => Defrosting,
            8 => Standby,
            _ => return None,
        })
    }
}

/// Zone status: what the zone is doing, and whether it reports the
/// matching failure variant (bit 7 of the status byte).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZoneStatus {
    /// Current activity.
    pub activity: ZoneActivity,
    /// The activity's failed variant was reported.
    pub failed: bool,
}

impl ZoneStatus {
    /// Decode status byte 3. Only bits 0..3 and 7 mean anything.
    pub fn from_raw(value: u8) -> Option<Self> {
        let masked = value & 0x8f;
        Some(Self {
            activity: ZoneActivity::from_raw(masked & 0x0f)?,
            failed: masked & 0x80 != 0,
        })
    }
}

/// A full decoded zone status broadcast.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HvacStatus {
    /// Commanded operating mode.
    pub mode: HvacMode,
    /// Commanded heat source.
    pub heat_source: HeatSource,
    /// Commanded fan mode.
    pub fan: FanMode,
    /// Low trip point, °F.
    pub low_trip_f: u8,
    /// High trip point, °F.
    pub high_trip_f: u8,
    /// What the zone is doing, if the status byte was recognized.
    pub zone: Option<ZoneStatus>,
    /// Measured indoor temperature, °F.
    pub indoor_f: f32,
    /// Measured outdoor temperature, °F.
    pub outdoor_f: f32,
}

/// Force a trip point pair to satisfy the mode's invariant:
/// heating `high >= low + 2`, cooling `low <= high - 2`, heat/cool
/// `high >= low`. The other trip moves toward the boundary; at the
/// ends of the range the input is clamped instead.
pub(crate) fn normalize_trips(mode: HvacMode, low: u8, high: u8) -> (u8, u8) {
    match mode {
        HvacMode::Heat => {
            let low = low.min(253);
            (low, high.max(low + 2))
        }
        HvacMode::Cool => {
            let high = high.max(2);
            (low.min(high - 2), high)
        }
        HvacMode::Both => (low, high.max(low)),
        HvacMode::Off | HvacMode::RunSchedule => (low, high),
    }
}

struct State {
    mode: HvacMode,
    source: HeatSource,
    fan: FanMode,
    low_f: u8,
    high_f: u8,
}

/// Runtime for one HVAC zone.
pub struct Hvac {
    rt: Runtime,
    state: Mutex<State>,
}

impl Hvac {
    // HVAC heads answer fast; lights get 5 s, this gets 2.
    pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

    pub(crate) fn new(rt: Runtime) -> Self {
        Self {
            rt,
            state: Mutex::new(State {
                mode: HvacMode::Off,
                source: HeatSource::Gas,
                fan: FanMode::Auto,
                low_f: 68,
                high_f: 74,
            }),
        }
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.rt
    }

    /// Translate one channel command, normalize, and send.
    pub fn handle_command(&self, command: &DeviceCommand) -> Result<()> {
        let payload = {
            let mut st = self.state.lock().unwrap();
            match command {
                DeviceCommand::HvacMode(mode) => st.mode = *mode,
                DeviceCommand::HvacHeatSource(source) => st.source = *source,
                DeviceCommand::HvacFan(fan) => st.fan = *fan,
                DeviceCommand::HvacLowTrip(f) => st.low_f = *f,
                DeviceCommand::HvacHighTrip(f) => st.high_f = *f,
                DeviceCommand::Power(on) => {
                    st.mode = if *on { HvacMode::Both } else { HvacMode::Off };
                }
                other => {
                    return Err(Error::Command(format!(
                        "hvac zone has no {other:?} channel"
                    )));
                }
            }
            let (low, high) = normalize_trips(st.mode, st.low_f, st.high_f);
            st.low_f = low;
            st.high_f = high;
            command::hvac(st.mode, st.source, st.fan, low, high)
        };
        self.rt.send_command(&payload)
    }

    /// Parse an 8-byte DeviceStatus payload and surface it whole.
    pub fn handle_status(&self, payload: &[u8]) {
        if payload.len() < 8 {
            return;
        }
        let status = HvacStatus {
            mode: HvacMode::from_raw(payload[0]),
            heat_source: HeatSource::from_raw(payload[0] >> 4),
            fan: FanMode::from_raw(payload[0] >> 6),
            low_trip_f: payload[1],
            high_trip_f: payload[2],
            zone: ZoneStatus::from_raw(payload[3]),
            indoor_f: f32::from(i16::from_be_bytes([payload[4], payload[5]])) / 256.0,
            outdoor_f: f32::from(i16::from_be_bytes([payload[6], payload[7]])) / 256.0,
        };
        {
            let mut st = self.state.lock().unwrap();
            st.mode = status.mode;
            st.source = status.heat_source;
            st.fan = status.fan;
            st.low_f = status.low_trip_f;
            st.high_f = status.high_trip_f;
        }
        self.rt.emit(StateUpdate::Hvac(status));
    }
}
