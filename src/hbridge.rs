/*! Momentary H-bridge motor runtime (slides, awnings, jacks).

These devices are deliberately dead-man: they stop on their own if
they stop hearing the drive command for roughly 800 ms. While a
direction is held, the runtime re-sends it every 500 ms to keep the
motor alive.

On top of that sits a 200 ms auto-stop guard. Some host frameworks
only deliver a command on button release, or keep streaming the same
command while a button is held; every incoming drive command re-arms
the guard, and when commands stop arriving the guard sends one STOP
and cancels the repeater. Driving therefore needs a command stream at
better than 5 Hz, and a lone command moves the motor for 200 ms.

Motion is exactly what the in-motion lockout exists for; FORWARD and
REVERSE are blocked at lockout level 1, STOP never is.
 */
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::command::{self, Direction};
use crate::device::{DeviceCommand, DeviceType, Runtime, StateUpdate};
use crate::lockout::CommandClass;
use crate::task::Task;
use crate::{Error, Result};

/// Re-send cadence while a direction is held.
const REPEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Auto-stop fires this long after the last drive command.
const AUTO_STOP_GUARD: Duration = Duration::from_millis(200);

fn build(type2: bool, direction: Direction) -> command::CommandPayload {
    if type2 {
        command::hbridge_type2(direction)
    } else {
        command::hbridge_type1(direction, false)
    }
}

struct Timers {
    active: Direction,
    repeat: Option<Task>,
    auto_stop: Option<Task>,
}

/// Runtime for one momentary H-bridge.
pub struct HBridge {
    rt: Runtime,
    type2: bool,
    timers: Arc<Mutex<Timers>>,
}

impl HBridge {
    pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

    pub(crate) fn new(rt: Runtime, type2: bool) -> Self {
        Self {
            rt,
            type2,
            timers: Arc::new(Mutex::new(Timers {
                active: Direction::Stop,
                repeat: None,
                auto_stop: None,
            })),
        }
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub(crate) fn device_type(&self) -> DeviceType {
        if self.type2 {
            DeviceType::MomentaryHBridgeType2
        } else {
            DeviceType::MomentaryHBridge
        }
    }

    /// Translate one channel command and send it.
    pub fn handle_command(&self, command: &DeviceCommand) -> Result<()> {
        match command {
            DeviceCommand::Drive(direction) => self.drive(*direction),
            DeviceCommand::ClearFault => {
                let payload = if self.type2 {
                    command::hbridge_type2_clear_latch()
                } else {
                    command::hbridge_type1(Direction::Stop, true)
                };
                self.rt.send_command(&payload)
            }
            other => Err(Error::Command(format!(
                "h-bridge has no {other:?} channel"
            ))),
        }
    }

    fn drive(&self, direction: Direction) -> Result<()> {
        if direction == Direction::Stop {
            self.stop_timers();
            return self.rt.send_command(&build(self.type2, Direction::Stop));
        }

        self.rt.check_lockout(CommandClass::Mobile)?;
        self.rt.send_command(&build(self.type2, direction))?;

        let is_new = self.timers.lock().unwrap().active != direction;
        if is_new {
            // Direction changed: fresh repeater. An unchanged
            // direction keeps its repeater's cadence so held buttons
            // still see a send every 500 ms regardless of how fast
            // the host re-commands.
            let repeat = self.spawn_repeat(direction)?;
            let mut timers = self.timers.lock().unwrap();
            timers.active = direction;
            let old = timers.repeat.replace(repeat);
            drop(timers);
            drop(old);
        }
        self.rearm_auto_stop();
        Ok(())
    }

    fn spawn_repeat(&self, direction: Direction) -> Result<Task> {
        let send = self.rt.send.clone();
        let session = self.rt.session();
        let source = self.rt.source;
        let target = self.rt.target;
        let payload = build(self.type2, direction);
        Task::periodic(
            &format!("hbridge repeat {target}"),
            REPEAT_INTERVAL,
            move || {
                let msg = match payload.to_message(source, target) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("h-bridge repeat: {e}");
                        return false;
                    }
                };
                match send(&msg) {
                    Ok(()) => {
                        session.update_activity();
                        true
                    }
                    Err(e) => {
                        warn!("h-bridge repeat to {target}: {e}");
                        false
                    }
                }
            },
        )
    }

    fn rearm_auto_stop(&self) {
        let timers = self.timers.clone();
        let send = self.rt.send.clone();
        let source = self.rt.source;
        let target = self.rt.target;
        let type2 = self.type2;
        let guard_task = Task::one_shot(
            &format!("hbridge guard {target}"),
            AUTO_STOP_GUARD,
            move || {
                let (was, old_repeat) = {
                    let mut t = timers.lock().unwrap();
                    (
                        std::mem::replace(&mut t.active, Direction::Stop),
                        t.repeat.take(),
                    )
                };
                drop(old_repeat);
                if was == Direction::Stop {
                    return;
                }
                debug!("h-bridge {target}: no follow-up command, auto-stop");
                let stop = build(type2, Direction::Stop);
                match stop.to_message(source, target) {
                    Ok(msg) => {
                        if let Err(e) = send(&msg) {
                            warn!("h-bridge auto-stop to {target}: {e}");
                        }
                    }
                    Err(e) => warn!("h-bridge auto-stop: {e}"),
                }
            },
        );
        match guard_task {
            Ok(task) => {
                let mut t = self.timers.lock().unwrap();
                let old = t.auto_stop.replace(task);
                drop(t);
                drop(old);
            }
            Err(e) => warn!("h-bridge guard did not start: {e}"),
        }
    }

    /// Cancel the repeater and the guard. After this returns neither
    /// fires again.
    pub(crate) fn stop_timers(&self) {
        let (repeat, auto_stop) = {
            let mut t = self.timers.lock().unwrap();
            t.active = Direction::Stop;
            (t.repeat.take(), t.auto_stop.take())
        };
        drop(repeat);
        drop(auto_stop);
    }

    /// Parse a DeviceStatus payload and surface changes.
    pub fn handle_status(&self, payload: &[u8]) {
        let Some(&b) = payload.first() else {
            return;
        };
        let direction = if self.type2 {
            match b {
                1 => Direction::Forward,
                2 => Direction::Reverse,
                _ => Direction::Stop,
            }
        } else {
            if b & 0x01 != 0 {
                Direction::Forward
            } else if b & 0x04 != 0 {
                Direction::Reverse
            } else {
                Direction::Stop
            }
        };
        self.rt.emit(StateUpdate::Direction(direction));
        if !self.type2 {
            self.rt.emit(StateUpdate::Fault(b & 0x40 != 0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::{harness, sent_command};
    use crate::message::{Message, MessageType};

    fn commands_sent(sent: &crate::device::test_support::SentLog) -> Vec<Message> {
        sent.lock()
            .unwrap()
            .iter()
            .filter(|m| m.msg_type() == MessageType::Command)
            .cloned()
            .collect()
    }

    #[test]
    fn forward_byte() {
        let (rt, sent, _updates) = harness(1, 60);
        let hb = HBridge::new(rt, false);
        hb.handle_command(&DeviceCommand::Drive(Direction::Forward))
            .unwrap();
        assert_eq!(sent_command(&sent).payload(), &[0x01]);
        hb.stop_timers();
    }

    #[test]
    fn reverse_byte() {
        // S6: type 1 reverse is a single 0x04 with message_data 0.
        let (rt, sent, _updates) = harness(1, 60);
        let hb = HBridge::new(rt, false);
        hb.handle_command(&DeviceCommand::Drive(Direction::Reverse))
            .unwrap();
        let cmd = sent_command(&sent);
        assert_eq!(cmd.message_data(), Some(0));
        assert_eq!(cmd.payload(), &[0x04]);
        hb.stop_timers();
    }

    #[test]
    fn lone_command_auto_stops_once() {
        let (rt, sent, _updates) = harness(1, 60);
        let hb = HBridge::new(rt, false);
        hb.handle_command(&DeviceCommand::Drive(Direction::Forward))
            .unwrap();
        // Past the 200 ms guard, well before the 500 ms repeat.
        std::thread::sleep(Duration::from_millis(400));
        let cmds = commands_sent(&sent);
        assert_eq!(cmds.len(), 2, "forward then exactly one auto-stop");
        assert_eq!(cmds[0].payload(), &[0x01]);
        assert_eq!(cmds[1].payload(), &[0x00]);
        // And it stays stopped.
        std::thread::sleep(Duration::from_millis(600));
        assert_eq!(commands_sent(&sent).len(), 2);
    }

    #[test]
    fn held_direction_repeats() {
        let (rt, sent, _updates) = harness(1, 60);
        let hb = HBridge::new(rt, false);
        // Stream the command like a held button, 20 Hz for 1.2 s.
        for _ in 0..24 {
            hb.handle_command(&DeviceCommand::Drive(Direction::Forward))
                .unwrap();
            std::thread::sleep(Duration::from_millis(50));
        }
        hb.handle_command(&DeviceCommand::Drive(Direction::Stop))
            .unwrap();
        let cmds = commands_sent(&sent);
        // 24 host sends + 2 repeater fires (at 500 ms and 1000 ms)
        // + 1 stop, with some scheduling slack.
        assert!(cmds.len() >= 26, "got {}", cmds.len());
        assert_eq!(cmds.last().unwrap().payload(), &[0x00]);
        // Stop cancelled everything: nothing further.
        let n = cmds.len();
        std::thread::sleep(Duration::from_millis(700));
        assert_eq!(commands_sent(&sent).len(), n);
    }

    #[test]
    fn stop_sends_exactly_one_stop() {
        let (rt, sent, _updates) = harness(1, 60);
        let hb = HBridge::new(rt, true);
        hb.handle_command(&DeviceCommand::Drive(Direction::Forward))
            .unwrap();
        hb.handle_command(&DeviceCommand::Drive(Direction::Stop))
            .unwrap();
        std::thread::sleep(Duration::from_millis(400));
        let cmds = commands_sent(&sent);
        let stops = cmds
            .iter()
            .filter(|m| m.message_data() == Some(0))
            .count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn lockout_blocks_motion_not_stop() {
        let (rt, _sent, _updates) = harness(1, 60);
        rt.lockout.observe(1);
        let hb = HBridge::new(rt, false);
        assert!(
            hb.handle_command(&DeviceCommand::Drive(Direction::Forward))
                .is_err()
        );
        assert!(
            hb.handle_command(&DeviceCommand::Drive(Direction::Stop))
                .is_ok()
        );
    }

    #[test]
    fn type1_status_direction() {
        let (rt, _sent, updates) = harness(1, 60);
        let hb = HBridge::new(rt, false);
        hb.handle_status(&[0x04]);
        let got = updates.lock().unwrap().clone();
        assert!(
            got.iter()
                .any(|u| u.update == StateUpdate::Direction(Direction::Reverse))
        );
    }
}
