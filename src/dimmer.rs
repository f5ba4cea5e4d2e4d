/*! Dimmable light runtime.

Commands merge into a cached full state (mode, brightness, auto-off,
cycle times) because the device only takes complete 8-byte command
payloads; setting just the brightness still re-sends everything else
as last known.
 */
use std::sync::Mutex;
use std::time::Duration;

use crate::command::{self, LightMode, unscale_percent};
use crate::device::{DeviceCommand, Runtime, StateUpdate};
use crate::{Error, Result};

struct State {
    mode: LightMode,
    brightness_pct: u8,
    auto_off_s: u8,
    cycle1_ms: u16,
    cycle2_ms: u16,
}

/// Runtime for one dimmable light.
pub struct Dimmer {
    rt: Runtime,
    state: Mutex<State>,
}

impl Dimmer {
    pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

    pub(crate) fn new(rt: Runtime) -> Self {
        Self {
            rt,
            state: Mutex::new(State {
                mode: LightMode::Off,
                brightness_pct: 100,
                auto_off_s: 0,
                cycle1_ms: 0,
                cycle2_ms: 0,
            }),
        }
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.rt
    }

    /// Translate one channel command, then send the merged state.
    pub fn handle_command(&self, command: &DeviceCommand) -> Result<()> {
        let payload = {
            let mut st = self.state.lock().unwrap();
            match command {
                DeviceCommand::Power(true) => st.mode = LightMode::On,
                DeviceCommand::Power(false) => st.mode = LightMode::Off,
                DeviceCommand::Brightness(pct) => {
                    st.brightness_pct = (*pct).min(100);
                    st.mode = if *pct > 0 {
                        LightMode::On
                    } else {
                        LightMode::Off
                    };
                }
                DeviceCommand::LightMode(mode) => st.mode = *mode,
                DeviceCommand::Sleep(secs) => st.auto_off_s = *secs,
                DeviceCommand::CycleTimes(c1, c2) => {
                    st.cycle1_ms = *c1;
                    st.cycle2_ms = *c2;
                }
                other => {
                    return Err(Error::Command(format!(
                        "dimmable light has no {other:?} channel"
                    )));
                }
            }
            command::dimmer(
                st.mode,
                st.brightness_pct,
                st.auto_off_s,
                st.cycle1_ms,
                st.cycle2_ms,
            )
        };
        self.rt.send_command(&payload)
    }

    /// Parse a DeviceStatus payload and surface changes.
    pub fn handle_status(&self, payload: &[u8]) {
        let Some(&mode_raw) = payload.first() else {
            return;
        };
        let mode = LightMode::from_raw(mode_raw);
        let mut st = self.state.lock().unwrap();
        st.mode = mode;
        if payload.len() >= 4 {
            st.brightness_pct = unscale_percent(payload[1]);
            st.auto_off_s = payload[2];
        }
        if payload.len() >= 8 {
            st.cycle1_ms = u16::from_be_bytes([payload[4], payload[5]]);
            st.cycle2_ms = u16::from_be_bytes([payload[6], payload[7]]);
        }
        drop(st);

        self.rt.emit(StateUpdate::Power(mode_raw > 0));
        self.rt.emit(StateUpdate::LightMode(mode));
        if payload.len() >= 4 {
            self.rt
                .emit(StateUpdate::Brightness(unscale_percent(payload[3])));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::{harness, sent_command};
    use crate::device::Update;

    #[test]
    fn brightness_command_payload() {
        // S3: brightness 50 becomes mode 1, level 0x7F, rest zero.
        let (rt, sent, _updates) = harness(1, 92);
        let dimmer = Dimmer::new(rt);
        dimmer
            .handle_command(&DeviceCommand::Brightness(50))
            .unwrap();
        let cmd = sent_command(&sent);
        assert_eq!(cmd.message_data(), Some(0));
        assert_eq!(cmd.payload(), &[0x01, 0x7f, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn sleep_keeps_other_fields() {
        let (rt, sent, _updates) = harness(1, 92);
        let dimmer = Dimmer::new(rt);
        dimmer
            .handle_command(&DeviceCommand::Brightness(40))
            .unwrap();
        let _ = sent_command(&sent);
        dimmer.handle_command(&DeviceCommand::Sleep(30)).unwrap();
        let cmd = sent_command(&sent);
        // Mode and brightness ride along.
        assert_eq!(cmd.payload()[0], 1);
        assert_eq!(cmd.payload()[1], command::scale_percent(40));
        assert_eq!(cmd.payload()[2], 30);
    }

    #[test]
    fn unsupported_channel() {
        let (rt, _sent, _updates) = harness(1, 92);
        let dimmer = Dimmer::new(rt);
        assert!(
            dimmer
                .handle_command(&DeviceCommand::Drive(command::Direction::Forward))
                .is_err()
        );
    }

    #[test]
    fn status_parses_brightness() {
        let (rt, _sent, updates) = harness(1, 92);
        let dimmer = Dimmer::new(rt);
        // Mode on, max 255, 0 s, current 127, no cycle times.
        dimmer.handle_status(&[1, 255, 0, 127]);
        let got: Vec<Update> = updates.lock().unwrap().drain(..).collect();
        assert!(got.iter().any(|u| u.update == StateUpdate::Power(true)));
        assert!(got.iter().any(|u| u.update == StateUpdate::Brightness(49)));
    }

    #[test]
    fn short_status_is_on_off_only() {
        let (rt, _sent, updates) = harness(1, 92);
        let dimmer = Dimmer::new(rt);
        dimmer.handle_status(&[0]);
        let got: Vec<Update> = updates.lock().unwrap().drain(..).collect();
        assert!(got.iter().any(|u| u.update == StateUpdate::Power(false)));
        assert!(
            !got.iter()
                .any(|u| matches!(u.update, StateUpdate::Brightness(_)))
        );
    }
}
