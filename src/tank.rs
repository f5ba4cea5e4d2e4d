//! Tank sensor runtime. Read-only: one status byte, a fill
//! percentage.
use std::time::Duration;

use crate::device::{DeviceCommand, Runtime, StateUpdate};
use crate::{Error, Result};

/// Runtime for one tank level sensor.
pub struct Tank {
    rt: Runtime,
}

impl Tank {
    pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

    pub(crate) fn new(rt: Runtime) -> Self {
        Self { rt }
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.rt
    }

    /// Tanks take no commands at all.
    pub fn handle_command(&self, command: &DeviceCommand) -> Result<()> {
        Err(Error::Command(format!(
            "tank sensors are read-only ({command:?})"
        )))
    }

    /// Parse a DeviceStatus payload: byte 0 is the level.
    pub fn handle_status(&self, payload: &[u8]) {
        let Some(&level) = payload.first() else {
            return;
        };
        self.rt.emit(StateUpdate::TankLevel(level.min(100)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::harness;

    #[test]
    fn level_clamped() {
        let (rt, _sent, updates) = harness(1, 30);
        let tank = Tank::new(rt);
        tank.handle_status(&[42]);
        tank.handle_status(&[130]);
        let got = updates.lock().unwrap().clone();
        assert_eq!(got[0].update, StateUpdate::TankLevel(42));
        assert_eq!(got[1].update, StateUpdate::TankLevel(100));
    }

    #[test]
    fn commands_rejected() {
        let (rt, _sent, _updates) = harness(1, 30);
        let tank = Tank::new(rt);
        assert!(tank.handle_command(&DeviceCommand::Power(true)).is_err());
    }
}
