/*! Device runtimes: one per thing on the bus.

A runtime owns everything one device needs host-side: its session,
its state cache, its timers, and the translation between high level
commands ([DeviceCommand]) and the wire. State flows back out as
typed [Update]s through a sink the host injects.

"Device" is a closed sum of families, not an open hierarchy; shared
behavior (session upkeep, command timeout, presence) lives in the
[Runtime] helper underneath the variants.
 */
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;

use crate::command::{
    CommandPayload, Direction, FanMode, HeatSource, HvacMode, LightMode, RgbMode,
};
use crate::dimmer::Dimmer;
use crate::hbridge::HBridge;
use crate::hvac::{Hvac, HvacStatus};
use crate::lockout::{CommandClass, Lockout};
use crate::message::{Address, Message, MessageType};
use crate::relay::Relay;
use crate::rgb::RgbLight;
use crate::session::{SendMessage, Session};
use crate::tank::Tank;
use crate::task::Task;
use crate::{Error, Result};

/// How long to wait for a session to open, polling every 100 ms.
const SESSION_DEADLINE: Duration = Duration::from_secs(5);
const SESSION_POLL: Duration = Duration::from_millis(100);

/// The closed set of device types this controller speaks to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum DeviceType {
    /// Latching relay, command in the payload.
    LatchingRelay = 0x03,
    /// Momentary H-bridge motor, command in the payload.
    MomentaryHBridge = 0x06,
    /// Tank level sensor, read-only.
    TankSensor = 0x0a,
    /// RGB light.
    RgbLight = 0x0d,
    /// HVAC zone controller.
    HvacControl = 0x10,
    /// Dimmable light.
    DimmableLight = 0x14,
    /// Latching relay, command in `message_data`.
    LatchingRelayType2 = 0x1e,
    /// Momentary H-bridge, command in `message_data`.
    MomentaryHBridgeType2 = 0x21,
    /// Anything we have no runtime for.
    Unknown = 0xff,
}

impl DeviceType {
    /// Map a raw device type byte; reserved values come back Unknown.
    pub fn from_raw(value: u8) -> Self {
        match value {
            0x03 => Self::LatchingRelay,
            0x06 => Self::MomentaryHBridge,
            0x0a => Self::TankSensor,
            0x0d => Self::RgbLight,
            0x10 => Self::HvacControl,
            0x14 => Self::DimmableLight,
            0x1e => Self::LatchingRelayType2,
            0x21 => Self::MomentaryHBridgeType2,
            _ => Self::Unknown,
        }
    }
}

/// A command on one of a device's channels.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceCommand {
    /// On/off, for lights and relays.
    Power(bool),
    /// Dimmer brightness, 0..=100 percent.
    Brightness(u8),
    /// Dimmable light mode.
    LightMode(LightMode),
    /// RGB light mode.
    RgbMode(RgbMode),
    /// Color as hue (degrees), saturation, and brightness (0..=1).
    Color {
        /// Hue in degrees; wraps at 360.
        hue: f32,
        /// Saturation, 0..=1.
        saturation: f32,
        /// Brightness, 0..=1.
        brightness: f32,
    },
    /// Effect speed / interval in milliseconds.
    Speed(u16),
    /// Auto-off after this many seconds; 0 disables.
    Sleep(u8),
    /// Blink/swell cycle times in milliseconds.
    CycleTimes(u16, u16),
    /// Drive an H-bridge; re-issue while holding, Stop releases.
    Drive(Direction),
    /// Clear a latched fault.
    ClearFault,
    /// HVAC operating mode.
    HvacMode(HvacMode),
    /// HVAC heat source.
    HvacHeatSource(HeatSource),
    /// HVAC fan mode.
    HvacFan(FanMode),
    /// HVAC low trip point, whole °F.
    HvacLowTrip(u8),
    /// HVAC high trip point, whole °F.
    HvacHighTrip(u8),
}

/// One observable state change.
#[derive(Clone, Debug, PartialEq)]
pub enum StateUpdate {
    /// Device seen (or lost) on the bus.
    Online(bool),
    /// Output on or off.
    Power(bool),
    /// Brightness, 0..=100 percent.
    Brightness(u8),
    /// Dimmable light mode.
    LightMode(LightMode),
    /// RGB light mode.
    RgbMode(RgbMode),
    /// Current color.
    Color {
        /// Red, 0..=255.
        r: u8,
        /// Green, 0..=255.
        g: u8,
        /// Blue, 0..=255.
        b: u8,
    },
    /// Fault latch state.
    Fault(bool),
    /// Actuator position, 0..=100 percent; None when unreported.
    Position(Option<u8>),
    /// Load current in amps; None when unsupported.
    CurrentDraw(Option<f32>),
    /// Diagnostic trouble code; 0 means none known.
    DiagnosticCode(u16),
    /// H-bridge drive state.
    Direction(Direction),
    /// Full HVAC zone status.
    Hvac(HvacStatus),
    /// Tank fill level, 0..=100 percent.
    TankLevel(u8),
}

/// A state change on a specific device.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    /// The device it concerns.
    pub address: Address,
    /// What changed.
    pub update: StateUpdate,
}

/// Callback receiving every state change.
pub type UpdateSink = Arc<dyn Fn(Update) + Send + Sync>;

struct Waiting {
    waiting: bool,
    timeout: Option<Task>,
}

struct Presence {
    online: bool,
    last_seen: Option<Instant>,
}

/// The plumbing every family shares: session upkeep, sending,
/// command timeout, presence, and update emission.
pub(crate) struct Runtime {
    pub(crate) source: Address,
    pub(crate) target: Address,
    pub(crate) send: SendMessage,
    pub(crate) lockout: Arc<Lockout>,
    updates: UpdateSink,
    session: Mutex<Arc<Session>>,
    idle_timeout: Duration,
    command_timeout: Duration,
    waiting: Arc<Mutex<Waiting>>,
    presence: Mutex<Presence>,
}

impl Runtime {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        source: Address,
        target: Address,
        send: SendMessage,
        lockout: Arc<Lockout>,
        updates: UpdateSink,
        idle_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        let session = Session::new(source, target, send.clone());
        session.set_idle_timeout(idle_timeout);
        Self {
            source,
            target,
            send,
            lockout,
            updates,
            session: Mutex::new(session),
            idle_timeout,
            command_timeout,
            waiting: Arc::new(Mutex::new(Waiting {
                waiting: false,
                timeout: None,
            })),
            presence: Mutex::new(Presence {
                online: false,
                last_seen: None,
            }),
        }
    }

    pub(crate) fn session(&self) -> Arc<Session> {
        self.session.lock().unwrap().clone()
    }

    /// Make sure a session to `target` is open, or fail after the
    /// deadline. An already-open session just gets a heartbeat to
    /// refresh it; a session pointed at some other target is torn
    /// down and replaced.
    pub(crate) fn ensure_session(&self, target: Address) -> Result<()> {
        let mut session = self.session();
        if session.target() != target {
            session.close();
            let fresh = Session::new(self.source, target, self.send.clone());
            fresh.set_idle_timeout(self.idle_timeout);
            *self.session.lock().unwrap() = fresh.clone();
            session = fresh;
        }
        if session.is_open() {
            session.send_heartbeat()?;
            session.update_activity();
            return Ok(());
        }
        session.request_seed()?;
        let deadline = Instant::now() + SESSION_DEADLINE;
        while Instant::now() < deadline {
            std::thread::sleep(SESSION_POLL);
            if session.is_open() {
                return Ok(());
            }
        }
        Err(Error::Session(format!(
            "session with {target} did not open within {SESSION_DEADLINE:?}"
        )))
    }

    /// Ensure a session, send a built command, and arm the command
    /// timeout. The common spine of every family's handle_command.
    pub(crate) fn send_command(&self, command: &CommandPayload) -> Result<()> {
        self.ensure_session(self.target)?;
        let msg = command.to_message(self.source, self.target)?;
        (self.send)(&msg)?;
        self.session().update_activity();
        self.arm_command_timeout();
        Ok(())
    }

    /// Raise the waiting-for-status flag and (re)arm the one-shot
    /// that clears it if no status shows up.
    fn arm_command_timeout(&self) {
        self.waiting.lock().unwrap().waiting = true;
        let task = {
            let target = self.target;
            let waiting = self.waiting.clone();
            Task::one_shot(
                &format!("cmd timeout {target}"),
                self.command_timeout,
                move || {
                    let mut guard = waiting.lock().unwrap();
                    if guard.waiting {
                        debug!("no status from {target} after command");
                        guard.waiting = false;
                    }
                },
            )
        };
        match task {
            Ok(task) => {
                let mut guard = self.waiting.lock().unwrap();
                let old = guard.timeout.replace(task);
                drop(guard);
                drop(old);
            }
            Err(e) => debug!("command timeout task: {e}"),
        }
    }

    /// Whether a command is still waiting for its status echo.
    pub(crate) fn waiting_for_status(&self) -> bool {
        self.waiting.lock().unwrap().waiting
    }

    /// A status arrived: clear the waiting flag, refresh presence
    /// and session activity.
    pub(crate) fn status_received(&self) {
        {
            let mut guard = self.waiting.lock().unwrap();
            guard.waiting = false;
            let old = guard.timeout.take();
            drop(guard);
            drop(old);
        }
        self.session().update_activity();
        let came_online = {
            let mut presence = self.presence.lock().unwrap();
            presence.last_seen = Some(Instant::now());
            !std::mem::replace(&mut presence.online, true)
        };
        if came_online {
            self.emit(StateUpdate::Online(true));
        }
    }

    /// Mark the device offline (bridge lost its transport).
    pub(crate) fn set_offline(&self) {
        let was_online = {
            let mut presence = self.presence.lock().unwrap();
            std::mem::replace(&mut presence.online, false)
        };
        if was_online {
            self.emit(StateUpdate::Online(false));
        }
    }

    pub(crate) fn online(&self) -> bool {
        self.presence.lock().unwrap().online
    }

    pub(crate) fn last_seen(&self) -> Option<Instant> {
        self.presence.lock().unwrap().last_seen
    }

    /// Push one state change to the host.
    pub(crate) fn emit(&self, update: StateUpdate) {
        (self.updates)(Update {
            address: self.target,
            update,
        });
    }

    /// Consult the shared in-motion lockout before a command of this
    /// class goes out.
    pub(crate) fn check_lockout(&self, class: CommandClass) -> Result<()> {
        self.lockout.check(class)
    }

    /// Tear down: close the session, stop timers.
    pub(crate) fn shutdown(&self) {
        self.session().close();
        let task = self.waiting.lock().unwrap().timeout.take();
        drop(task);
    }
}

/// One device on the bus: address, family runtime, and state.
pub enum Device {
    /// Dimmable light.
    Dimmer(Dimmer),
    /// RGB light.
    Rgb(RgbLight),
    /// Latching relay, either type.
    Relay(Relay),
    /// Momentary H-bridge, either type.
    HBridge(HBridge),
    /// HVAC zone.
    Hvac(Hvac),
    /// Tank sensor.
    Tank(Tank),
}

impl Device {
    /// Build the runtime for a device type.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        device_type: DeviceType,
        source: Address,
        target: Address,
        send: SendMessage,
        lockout: Arc<Lockout>,
        updates: UpdateSink,
        idle_timeout: Duration,
        command_timeout: Option<Duration>,
    ) -> Result<Self> {
        let rt = |default_timeout: Duration| {
            Runtime::new(
                source,
                target,
                send.clone(),
                lockout.clone(),
                updates.clone(),
                idle_timeout,
                command_timeout.unwrap_or(default_timeout),
            )
        };
        Ok(match device_type {
            DeviceType::DimmableLight => Self::Dimmer(Dimmer::new(rt(Dimmer::COMMAND_TIMEOUT))),
            DeviceType::RgbLight => Self::Rgb(RgbLight::new(rt(RgbLight::COMMAND_TIMEOUT))),
            DeviceType::LatchingRelay => {
                Self::Relay(Relay::new(rt(Relay::COMMAND_TIMEOUT), false))
            }
            DeviceType::LatchingRelayType2 => {
                Self::Relay(Relay::new(rt(Relay::COMMAND_TIMEOUT), true))
            }
            DeviceType::MomentaryHBridge => {
                Self::HBridge(HBridge::new(rt(HBridge::COMMAND_TIMEOUT), false))
            }
            DeviceType::MomentaryHBridgeType2 => {
                Self::HBridge(HBridge::new(rt(HBridge::COMMAND_TIMEOUT), true))
            }
            DeviceType::HvacControl => Self::Hvac(Hvac::new(rt(Hvac::COMMAND_TIMEOUT))),
            DeviceType::TankSensor => Self::Tank(Tank::new(rt(Tank::COMMAND_TIMEOUT))),
            DeviceType::Unknown => {
                return Err(Error::Config(format!("no runtime for device {target}")));
            }
        })
    }

    fn runtime(&self) -> &Runtime {
        match self {
            Self::Dimmer(d) => d.runtime(),
            Self::Rgb(d) => d.runtime(),
            Self::Relay(d) => d.runtime(),
            Self::HBridge(d) => d.runtime(),
            Self::Hvac(d) => d.runtime(),
            Self::Tank(d) => d.runtime(),
        }
    }

    /// The device's bus address.
    pub fn address(&self) -> Address {
        self.runtime().target
    }

    /// The family this runtime drives.
    pub fn device_type(&self) -> DeviceType {
        match self {
            Self::Dimmer(_) => DeviceType::DimmableLight,
            Self::Rgb(_) => DeviceType::RgbLight,
            Self::Relay(r) => r.device_type(),
            Self::HBridge(h) => h.device_type(),
            Self::Hvac(_) => DeviceType::HvacControl,
            Self::Tank(_) => DeviceType::TankSensor,
        }
    }

    /// Whether the device has been heard from.
    pub fn online(&self) -> bool {
        self.runtime().online()
    }

    /// When the device was last heard from.
    pub fn last_seen(&self) -> Option<Instant> {
        self.runtime().last_seen()
    }

    /// True while a sent command still waits for its status echo.
    pub fn waiting_for_status(&self) -> bool {
        self.runtime().waiting_for_status()
    }

    /// Issue a command on one of the device's channels.
    pub fn handle_command(&self, command: &DeviceCommand) -> Result<()> {
        match self {
            Self::Dimmer(d) => d.handle_command(command),
            Self::Rgb(d) => d.handle_command(command),
            Self::Relay(d) => d.handle_command(command),
            Self::HBridge(d) => d.handle_command(command),
            Self::Hvac(d) => d.handle_command(command),
            Self::Tank(d) => d.handle_command(command),
        }
    }

    /// Feed an inbound message concerning this device.
    ///
    /// Responses addressed to our source go to the session; status
    /// broadcasts from our target go to the family parser.
    pub fn handle_message(&self, msg: &Message) {
        let rt = self.runtime();
        match msg.msg_type() {
            MessageType::Response => rt.session().process_response(msg),
            MessageType::DeviceStatus if msg.source() == rt.target => {
                rt.status_received();
                match self {
                    Self::Dimmer(d) => d.handle_status(msg.payload()),
                    Self::Rgb(d) => d.handle_status(msg.payload()),
                    Self::Relay(d) => d.handle_status(msg.payload()),
                    Self::HBridge(d) => d.handle_status(msg.payload()),
                    Self::Hvac(d) => d.handle_status(msg.payload()),
                    Self::Tank(d) => d.handle_status(msg.payload()),
                }
            }
            _ => {}
        }
    }

    /// Mark offline; the bridge calls this when the transport drops.
    pub(crate) fn set_offline(&self) {
        self.runtime().set_offline();
    }

    /// Close the session and stop all timers for this device.
    pub fn shutdown(&self) {
        if let Self::HBridge(h) = self {
            h.stop_timers();
        }
        self.runtime().shutdown();
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} at {}", self.device_type(), self.address())
    }
}
