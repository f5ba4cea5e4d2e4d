/*! Authenticated device sessions.

Nothing on the bus obeys a Command without an open session, and the
only session the controller speaks is id 4, "remote control". Opening
one is a seed/key exchange: ask the device for a 32-bit seed, run it
through the shared cipher, send the result back. After that a
heartbeat every four seconds keeps the device listening, and half a
minute of silence closes things down again locally.

The cipher is nothing cryptographically serious, a 32 round TEA-like
mixer with fixed constants, but it must match the device firmware bit
for bit or the key is simply wrong.
 */
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::message::{Address, Message, MessageType};
use crate::task::Task;
use crate::{Error, Result};

/// The one session id devices accept from a remote control.
pub const SESSION_ID: u16 = 4;

/// `message_data` opcode: ask for a seed.
pub const OP_REQUEST_SEED: u8 = 66;
/// `message_data` opcode: send back the key.
pub const OP_TRANSMIT_KEY: u8 = 67;
/// `message_data` opcode: keepalive.
pub const OP_HEARTBEAT: u8 = 68;
/// `message_data` opcode: close the session.
pub const OP_CLOSE: u8 = 69;

/// How often an open session pings its device.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);

/// Default idle timeout before a session closes itself locally.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Error codes devices return on session requests.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
#[allow(missing_docs)] // The names are the documentation.
pub enum SessionError {
    Success = 0,
    RequestNotSupported = 1,
    BadRequest = 2,
    ValueOutOfRange = 3,
    UnknownId = 4,
    WriteValueTooLarge = 5,
    InvalidAddress = 6,
    ReadOnly = 7,
    WriteOnly = 8,
    ConditionsNotCorrect = 9,
    FeatureNotSupported = 10,
    Busy = 11,
    SeedNotRequested = 12,
    KeyNotCorrect = 13,
    SessionNotOpen = 14,
    Timeout = 15,
    RemoteRequestNotSupported = 16,
    InMotionLockoutActive = 17,
}

impl SessionError {
    /// Map a raw code; unassigned values come back as None.
    pub fn from_raw(value: u8) -> Option<Self> {
        use SessionError::*;
        Some(match value {
            0 => Success,
            1 => RequestNotSupported,
            2 => BadRequest,
            3 => ValueOutOfRange,
            4 => UnknownId,
            5 => WriteValueTooLarge,
            6 => InvalidAddress,
            7 => ReadOnly,
            8 => WriteOnly,
            9 => ConditionsNotCorrect,
            10 => FeatureNotSupported,
            11 => Busy,
            12 => SeedNotRequested,
            13 => KeyNotCorrect,
            14 => SessionNotOpen,
            15 => Timeout,
            16 => RemoteRequestNotSupported,
            17 => InMotionLockoutActive,
            _ => return None,
        })
    }
}

/// Compute the session key for a seed.
///
/// 32 rounds over the session 4 cipher constant, all arithmetic
/// wrapping u32, shifts unsigned. Reproduced verbatim from the
/// protocol; do not "fix" the asymmetry of the round schedule.
#[must_use]
pub fn encrypt(seed: u32) -> u32 {
    const DELTA: u32 = 0x9e37_79b9;
    let mut num: u32 = 0xb169_b9b5;
    let mut sum = DELTA;
    let mut s = seed;
    let mut rounds = 32;
    loop {
        s = s.wrapping_add(
            (num << 4).wrapping_add(0x4369_dd79)
                ^ num.wrapping_add(sum)
                ^ (num >> 5).wrapping_add(0x726e_8ea8),
        );
        rounds -= 1;
        if rounds == 0 {
            break;
        }
        num = num.wrapping_add(
            (s << 4).wrapping_add(0x7421_9f84)
                ^ s.wrapping_add(sum)
                ^ (s >> 5).wrapping_add(0x5360_00e3),
        );
        sum = sum.wrapping_add(DELTA);
    }
    s
}

/// Session lifecycle states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// No session; commands will not be accepted.
    Closed,
    /// Seed requested, waiting for the device's response.
    SeedRequested,
    /// Key sent, waiting for the verdict.
    KeyTransmitted,
    /// Authenticated; heartbeats running.
    Open,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outbound path injected into a session; wraps the transport.
pub type SendMessage = Arc<dyn Fn(&Message) -> Result<()> + Send + Sync>;

struct Inner {
    state: State,
    last_activity: Instant,
    idle_timeout: Duration,
}

/// Session manager for one (source, target) pair.
///
/// All public operations are safe under concurrent access; the state
/// lives behind one mutex and the heartbeat task behind another, and
/// no lock is held across a send.
pub struct Session {
    source: Address,
    target: Address,
    send: SendMessage,
    inner: Mutex<Inner>,
    heartbeat: Mutex<Option<Task>>,
}

impl Session {
    /// New session manager in [State::Closed].
    pub fn new(source: Address, target: Address, send: SendMessage) -> Arc<Self> {
        Arc::new(Self {
            source,
            target,
            send,
            inner: Mutex::new(Inner {
                state: State::Closed,
                last_activity: Instant::now(),
                idle_timeout: DEFAULT_IDLE_TIMEOUT,
            }),
            heartbeat: Mutex::new(None),
        })
    }

    /// The device this session talks to.
    pub fn target(&self) -> Address {
        self.target
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    /// True once the handshake completed.
    pub fn is_open(&self) -> bool {
        self.state() == State::Open
    }

    /// Override the idle timeout (default 30 s).
    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.inner.lock().unwrap().idle_timeout = timeout;
    }

    /// Note activity (command sent, status seen) so the idle timer
    /// starts over.
    pub fn update_activity(&self) {
        self.inner.lock().unwrap().last_activity = Instant::now();
    }

    fn request(&self, op: u8, payload: &[u8]) -> Result<Message> {
        Message::p2p(MessageType::Request, self.source, self.target, op, payload)
    }

    /// Kick off the handshake: state to SeedRequested and ask the
    /// device for a seed. The rest happens in [Session::process_response].
    pub fn request_seed(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = State::SeedRequested;
            inner.last_activity = Instant::now();
        }
        debug!("session {}->{}: requesting seed", self.source, self.target);
        (self.send)(&self.request(OP_REQUEST_SEED, &SESSION_ID.to_be_bytes())?)
    }

    /// Send one heartbeat. Errors if the session is not open.
    pub fn send_heartbeat(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Session(format!(
                "no open session with {}",
                self.target
            )));
        }
        (self.send)(&self.request(OP_HEARTBEAT, &SESSION_ID.to_be_bytes())?)
    }

    /// Close the session: best-effort close request to the device,
    /// then local teardown. After this returns the heartbeat will
    /// not fire again.
    pub fn close(&self) {
        let was = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::replace(&mut inner.state, State::Closed)
        };
        if was == State::Open {
            if let Ok(msg) = self.request(OP_CLOSE, &SESSION_ID.to_be_bytes()) {
                if let Err(e) = (self.send)(&msg) {
                    debug!("close request to {} not sent: {e}", self.target);
                }
            }
        }
        self.stop_heartbeat();
    }

    /// Local teardown without telling the device.
    fn close_local(&self, why: &str) {
        warn!("session {}->{} closed: {why}", self.source, self.target);
        self.inner.lock().unwrap().state = State::Closed;
        self.stop_heartbeat();
    }

    fn stop_heartbeat(&self) {
        let task = self.heartbeat.lock().unwrap().take();
        // Joining happens outside the lock; the heartbeat body never
        // takes this lock, so this cannot deadlock.
        drop(task);
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let weak: Weak<Session> = Arc::downgrade(self);
        let name = format!("heartbeat {}", self.target);
        let task = Task::periodic(&name, HEARTBEAT_INTERVAL, move || {
            let Some(session) = weak.upgrade() else {
                return false;
            };
            session.heartbeat_tick()
        });
        match task {
            Ok(task) => {
                let mut guard = self.heartbeat.lock().unwrap();
                let old = guard.replace(task);
                drop(guard);
                drop(old);
            }
            Err(e) => {
                warn!("heartbeat for {} did not start: {e}", self.target);
                self.inner.lock().unwrap().state = State::Closed;
            }
        }
    }

    /// One heartbeat interval: enforce the idle timeout, then ping.
    /// Returns false to stop the periodic task.
    fn heartbeat_tick(&self) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != State::Open {
                return false;
            }
            if inner.last_activity.elapsed() >= inner.idle_timeout {
                info!("session with {} idle, closing", self.target);
                inner.state = State::Closed;
                return false;
            }
        }
        if let Err(e) = self.send_heartbeat() {
            warn!("heartbeat to {} failed: {e}", self.target);
            self.inner.lock().unwrap().state = State::Closed;
            return false;
        }
        true
    }

    /// Feed a Response message through the session state machine.
    ///
    /// Only Responses targeted at our own source address are
    /// considered. The response's *source* is deliberately not
    /// matched against the session target; some responses legally
    /// arrive relayed through intermediate nodes. Anything else,
    /// including non-session `message_data` values, is ignored.
    pub fn process_response(self: &Arc<Self>, msg: &Message) {
        if msg.msg_type() != MessageType::Response || msg.target() != Some(self.source) {
            return;
        }
        let payload = msg.payload();
        match msg.message_data() {
            Some(OP_REQUEST_SEED) => self.on_seed(payload),
            Some(OP_TRANSMIT_KEY) => self.on_key_verdict(payload),
            Some(OP_HEARTBEAT) => self.on_heartbeat_ack(payload),
            Some(OP_CLOSE) => {}
            _ => {}
        }
    }

    fn on_seed(&self, payload: &[u8]) {
        if self.inner.lock().unwrap().state != State::SeedRequested {
            return;
        }
        if payload.len() < 6 {
            self.close_local("seed response too short");
            return;
        }
        let seed = u32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]);
        let key = encrypt(seed);
        debug!(
            "session {}->{}: seed {seed:#010x}, sending key",
            self.source, self.target
        );
        let mut out = SESSION_ID.to_be_bytes().to_vec();
        out.extend_from_slice(&key.to_be_bytes());
        let sent = self
            .request(OP_TRANSMIT_KEY, &out)
            .and_then(|m| (self.send)(&m));
        match sent {
            Ok(()) => {
                let mut inner = self.inner.lock().unwrap();
                inner.state = State::KeyTransmitted;
                inner.last_activity = Instant::now();
            }
            Err(e) => self.close_local(&format!("key not sent: {e}")),
        }
    }

    fn on_key_verdict(self: &Arc<Self>, payload: &[u8]) {
        if self.inner.lock().unwrap().state != State::KeyTransmitted {
            return;
        }
        match payload.len() {
            // Two bytes echoing the session id: accepted.
            2 => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.state = State::Open;
                    inner.last_activity = Instant::now();
                }
                info!("session open with {}", self.target);
                self.start_heartbeat();
            }
            1 => {
                let code = SessionError::from_raw(payload[0]);
                self.close_local(&format!("key rejected ({code:?})"));
            }
            n => self.close_local(&format!("key verdict of {n} bytes")),
        }
    }

    fn on_heartbeat_ack(&self, payload: &[u8]) {
        let code = match payload.len() {
            0 | 2 => 0,
            1 => payload[0],
            _ => payload[2],
        };
        if code != 0 {
            self.close_local(&format!(
                "heartbeat refused ({:?})",
                SessionError::from_raw(code)
            ));
        } else {
            self.update_activity();
        }
    }
}
