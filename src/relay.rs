/*! Latching relay runtime, both wire dialects.

Type 1 relays take a bit-packed byte in the command payload and
report a one byte status. Type 2 relays take the command in
`message_data` and report a richer six byte status with position,
current draw, and a diagnostic code. The status length tells them
apart even if a device was registered under the wrong type.

Relays switch load circuits, so turning one ON counts as hazardous
under the in-motion lockout.
 */
use std::sync::Mutex;
use std::time::Duration;

use log::debug;

use crate::command;
use crate::device::{DeviceCommand, DeviceType, Runtime, StateUpdate};
use crate::lockout::CommandClass;
use crate::{Error, Result};

struct State {
    on: bool,
}

/// Runtime for one latching relay.
pub struct Relay {
    rt: Runtime,
    type2: bool,
    state: Mutex<State>,
}

impl Relay {
    pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

    pub(crate) fn new(rt: Runtime, type2: bool) -> Self {
        Self {
            rt,
            type2,
            state: Mutex::new(State { on: false }),
        }
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub(crate) fn device_type(&self) -> DeviceType {
        if self.type2 {
            DeviceType::LatchingRelayType2
        } else {
            DeviceType::LatchingRelay
        }
    }

    /// Translate one channel command and send it.
    pub fn handle_command(&self, command: &DeviceCommand) -> Result<()> {
        let payload = match command {
            DeviceCommand::Power(on) => {
                if *on {
                    self.rt.check_lockout(CommandClass::Hazardous)?;
                }
                self.state.lock().unwrap().on = *on;
                if self.type2 {
                    command::relay_type2(*on)
                } else {
                    command::relay_type1(*on, false)
                }
            }
            DeviceCommand::ClearFault => {
                if self.type2 {
                    return Err(Error::Command(
                        "type 2 relays clear faults on their own".into(),
                    ));
                }
                let on = self.state.lock().unwrap().on;
                command::relay_type1(on, true)
            }
            other => {
                return Err(Error::Command(format!("relay has no {other:?} channel")));
            }
        };
        self.rt.send_command(&payload)
    }

    /// Parse a DeviceStatus payload and surface changes.
    ///
    /// One byte is the type 1 shape, six or more the type 2 shape;
    /// anything in between carries nothing parseable.
    pub fn handle_status(&self, payload: &[u8]) {
        if payload.len() >= 6 {
            self.type2_status(payload);
        } else if let &[bits] = payload {
            let on = bits & 0x01 != 0;
            let fault = bits & 0x40 != 0;
            self.state.lock().unwrap().on = on;
            self.rt.emit(StateUpdate::Power(on));
            self.rt.emit(StateUpdate::Fault(fault));
        }
    }

    fn type2_status(&self, payload: &[u8]) {
        let raw_output = payload[0] & 0x0f;
        let disabled = payload[0] & 0x20 != 0;
        let position = match payload[1] {
            255 => None,
            p => Some(p.min(100)),
        };
        // Current draw is 8.8 fixed point amps; all ones means the
        // hardware cannot measure it.
        let current = match u16::from_be_bytes([payload[2], payload[3]]) {
            0xffff => None,
            c => Some(f32::from(c) / 256.0),
        };
        let dtc = u16::from_be_bytes([payload[4], payload[5]]);
        let faulted = disabled && dtc != 0;

        match raw_output {
            0 => {
                self.state.lock().unwrap().on = false;
                self.rt.emit(StateUpdate::Power(false));
            }
            1 => {
                self.state.lock().unwrap().on = true;
                self.rt.emit(StateUpdate::Power(true));
            }
            other => debug!("relay {} output state {other}", self.rt.target),
        }
        self.rt.emit(StateUpdate::Position(position));
        self.rt.emit(StateUpdate::CurrentDraw(current));
        self.rt.emit(StateUpdate::DiagnosticCode(dtc));
        self.rt.emit(StateUpdate::Fault(faulted));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Update;
    use crate::device::test_support::{harness, sent_command};

    #[test]
    fn type1_on_off_bytes() {
        let (rt, sent, _updates) = harness(1, 40);
        let relay = Relay::new(rt, false);
        relay.handle_command(&DeviceCommand::Power(true)).unwrap();
        assert_eq!(sent_command(&sent).payload(), &[0x83]);
        relay.handle_command(&DeviceCommand::Power(false)).unwrap();
        assert_eq!(sent_command(&sent).payload(), &[0x80]);
    }

    #[test]
    fn type2_command_in_message_data() {
        let (rt, sent, _updates) = harness(1, 41);
        let relay = Relay::new(rt, true);
        relay.handle_command(&DeviceCommand::Power(true)).unwrap();
        let cmd = sent_command(&sent);
        assert_eq!(cmd.message_data(), Some(1));
        assert!(cmd.payload().is_empty());
    }

    #[test]
    fn type1_status_bits() {
        let (rt, _sent, updates) = harness(1, 40);
        let relay = Relay::new(rt, false);
        relay.handle_status(&[0x41]);
        let got: Vec<Update> = updates.lock().unwrap().drain(..).collect();
        assert!(got.iter().any(|u| u.update == StateUpdate::Power(true)));
        assert!(got.iter().any(|u| u.update == StateUpdate::Fault(true)));
    }

    #[test]
    fn type2_status_fields() {
        let (rt, _sent, updates) = harness(1, 41);
        let relay = Relay::new(rt, true);
        // On, disabled, position 80, 1.5 A, DTC 0x0102.
        relay.handle_status(&[0x21, 80, 0x01, 0x80, 0x01, 0x02]);
        let got: Vec<Update> = updates.lock().unwrap().drain(..).collect();
        assert!(got.iter().any(|u| u.update == StateUpdate::Power(true)));
        assert!(got.iter().any(|u| u.update == StateUpdate::Position(Some(80))));
        assert!(got.iter().any(|u| u.update == StateUpdate::CurrentDraw(Some(1.5))));
        assert!(got.iter().any(|u| u.update == StateUpdate::DiagnosticCode(0x0102)));
        assert!(got.iter().any(|u| u.update == StateUpdate::Fault(true)));
    }

    #[test]
    fn type2_unsupported_markers() {
        let (rt, _sent, updates) = harness(1, 41);
        let relay = Relay::new(rt, true);
        // Position and current unsupported, no DTC, not disabled.
        relay.handle_status(&[0x01, 255, 0xff, 0xff, 0, 0]);
        let got: Vec<Update> = updates.lock().unwrap().drain(..).collect();
        assert!(got.iter().any(|u| u.update == StateUpdate::Position(None)));
        assert!(got.iter().any(|u| u.update == StateUpdate::CurrentDraw(None)));
        assert!(got.iter().any(|u| u.update == StateUpdate::Fault(false)));
    }

    #[test]
    fn lockout_blocks_on() {
        let (rt, _sent, _updates) = harness(1, 40);
        rt.lockout.observe(2);
        let relay = Relay::new(rt, false);
        assert!(relay.handle_command(&DeviceCommand::Power(true)).is_err());
        // Switching OFF stays allowed.
        assert!(relay.handle_command(&DeviceCommand::Power(false)).is_ok());
    }
}
