/*! The bridge: one transport, one address book, one dispatcher.

Everything meets here. Inbound frames decode into messages and fan
out to the device runtimes (status by sender, responses by target);
outbound traffic funnels through one send path stamped with the
configured source address. The bridge also owns failure handling for
the transport: a lost connection schedules a single reconnect 30
seconds out, and sessions are left for the next command to re-open.

The bridge and its devices reference each other only through injected
callbacks and weak references; dropping the bridge tears everything
down.
 */
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::{Config, Connection};
use crate::device::{Device, DeviceCommand, DeviceType, Update, UpdateSink};
use crate::frame::CanFrame;
use crate::lockout::Lockout;
use crate::message::{Address, Message, MessageType};
use crate::session::SendMessage;
use crate::task::Task;
use crate::transport::{TcpTransport, Transport};
use crate::{Error, Result};

/// Fixed back-off before the single reconnect attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Counters {
    frames_in: AtomicU64,
    dropped: AtomicU64,
}

/// Host-side controller for one CAN segment.
pub struct Bridge {
    transport: Arc<dyn Transport>,
    devices: Mutex<HashMap<Address, Arc<Device>>>,
    source: Address,
    verbose: bool,
    idle_timeout: Duration,
    command_timeout: Option<Duration>,
    lockout: Arc<Lockout>,
    updates: UpdateSink,
    send: SendMessage,
    reconnect: Mutex<Option<Task>>,
    counters: Counters,
}

impl Bridge {
    /// Build a bridge from a validated config. Nothing is connected
    /// yet; call [Bridge::connect].
    ///
    /// `updates` receives every device state change, from whatever
    /// thread noticed it.
    pub fn new<F>(config: Config, updates: F) -> Result<Arc<Self>>
    where
        F: Fn(Update) + Send + Sync + 'static,
    {
        let connection = config.connection()?;
        let updates: UpdateSink = Arc::new(updates);

        let bridge = Arc::new_cyclic(|weak: &Weak<Bridge>| {
            let sink = {
                let weak = weak.clone();
                Arc::new(move |frame: CanFrame| {
                    if let Some(bridge) = weak.upgrade() {
                        bridge.handle_frame(&frame);
                    }
                })
            };
            let on_disconnect = {
                let weak = weak.clone();
                Arc::new(move || {
                    if let Some(bridge) = weak.upgrade() {
                        bridge.on_disconnect();
                    }
                })
            };
            let transport: Arc<dyn Transport> = match connection {
                Connection::Tcp { ref host, port } => {
                    Arc::new(TcpTransport::new(host, port, sink, on_disconnect))
                }
                #[cfg(target_os = "linux")]
                Connection::SocketCan { ref interface } => Arc::new(
                    crate::socketcan::SocketCanTransport::new(interface, sink, on_disconnect),
                ),
                #[cfg(not(target_os = "linux"))]
                Connection::SocketCan { .. } => {
                    unreachable!("rejected by Config::connection")
                }
            };
            let send: SendMessage = {
                let weak = weak.clone();
                Arc::new(move |msg: &Message| match weak.upgrade() {
                    Some(bridge) => bridge.send(msg),
                    None => Err(Error::NotConnected),
                })
            };
            Bridge {
                transport,
                devices: Mutex::new(HashMap::new()),
                source: Address::new(config.source_address),
                verbose: config.verbose,
                idle_timeout: Duration::from_secs(config.idle_timeout_s),
                command_timeout: config.command_timeout_s.map(Duration::from_secs),
                lockout: Arc::new(Lockout::new()),
                updates,
                send,
                reconnect: Mutex::new(None),
                counters: Counters::default(),
            }
        });
        Ok(bridge)
    }

    /// Open the transport. Also cancels any pending reconnect.
    pub fn connect(&self) -> Result<()> {
        let pending = self.reconnect.lock().unwrap().take();
        drop(pending);
        self.transport.connect()
    }

    /// Whether the transport is currently up.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// The controller's own address, stamped into outgoing frames.
    pub fn source(&self) -> Address {
        self.source
    }

    /// The shared in-motion lockout latch.
    pub fn lockout(&self) -> &Arc<Lockout> {
        &self.lockout
    }

    /// Register a device runtime at an address.
    pub fn add_device(&self, address: Address, device_type: DeviceType) -> Result<()> {
        if address.is_broadcast() {
            return Err(Error::Config("cannot register the broadcast address".into()));
        }
        let device = Device::new(
            device_type,
            self.source,
            address,
            self.send.clone(),
            self.lockout.clone(),
            self.updates.clone(),
            self.idle_timeout,
            self.command_timeout,
        )?;
        let mut devices = self.devices.lock().unwrap();
        if devices.contains_key(&address) {
            return Err(Error::Config(format!("address {address} already registered")));
        }
        info!("registered {device}");
        devices.insert(address, Arc::new(device));
        Ok(())
    }

    /// Remove a device, closing its session.
    pub fn remove_device(&self, address: Address) {
        let device = self.devices.lock().unwrap().remove(&address);
        if let Some(device) = device {
            device.shutdown();
        }
    }

    /// Look up a registered device.
    pub fn device(&self, address: Address) -> Option<Arc<Device>> {
        self.devices.lock().unwrap().get(&address).cloned()
    }

    /// Addresses currently registered.
    pub fn addresses(&self) -> Vec<Address> {
        self.devices.lock().unwrap().keys().copied().collect()
    }

    /// Issue a command to a registered device.
    ///
    /// May block up to the session deadline (5 s) when the device's
    /// session has to be opened first.
    pub fn command(&self, address: Address, command: DeviceCommand) -> Result<()> {
        let device = self
            .device(address)
            .ok_or_else(|| Error::Command(format!("no device at {address}")))?;
        device.handle_command(&command)
    }

    /// Send a message out the transport, if it is up.
    pub fn send(&self, msg: &Message) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(Error::NotConnected);
        }
        if self.verbose && msg.msg_type() != MessageType::TextConsole {
            debug!("tx {msg}");
        }
        self.transport.send(&msg.to_frame())
    }

    /// Inbound dispatch, called from the transport reader.
    fn handle_frame(&self, frame: &CanFrame) {
        self.counters.frames_in.fetch_add(1, Ordering::Relaxed);
        let msg = match Message::from_frame(frame) {
            Ok(msg) => msg,
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("dropping {frame}: {e}");
                return;
            }
        };
        if self.verbose && msg.msg_type() != MessageType::TextConsole {
            debug!("rx {msg}");
        }

        // The Network broadcast carries the bus-wide motion lockout
        // level in its first byte.
        if msg.msg_type() == MessageType::Network {
            if let Some(&level) = msg.payload().first() {
                self.lockout.observe(level & 0x03);
            }
        }

        let devices: Vec<Arc<Device>> = self.devices.lock().unwrap().values().cloned().collect();
        match msg.msg_type() {
            MessageType::DeviceStatus => {
                for device in devices {
                    if device.address() == msg.source() {
                        device.handle_message(&msg);
                    }
                }
            }
            MessageType::Response if msg.target() == Some(self.source) => {
                // Every runtime sees it; each session only consumes
                // what concerns it. Responses may arrive relayed, so
                // matching on the sender would lose traffic.
                for device in devices {
                    device.handle_message(&msg);
                }
            }
            _ => {}
        }
    }

    /// Transport lost: flag devices offline and line up one
    /// reconnect attempt.
    fn on_disconnect(self: &Arc<Self>) {
        warn!("transport lost; reconnecting in {RECONNECT_DELAY:?}");
        for device in self.devices.lock().unwrap().values() {
            device.set_offline();
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let task = Task::one_shot("reconnect", RECONNECT_DELAY, move || {
            let Some(bridge) = weak.upgrade() else {
                return;
            };
            match bridge.connect() {
                Ok(()) => info!("reconnected"),
                Err(e) => {
                    warn!("reconnect failed: {e}");
                    bridge.schedule_reconnect();
                }
            }
        });
        match task {
            Ok(task) => {
                let mut slot = self.reconnect.lock().unwrap();
                let old = slot.replace(task);
                drop(slot);
                drop(old);
            }
            Err(e) => warn!("reconnect timer: {e}"),
        }
    }

    /// Tear everything down: sessions, timers, transport.
    pub fn close(&self) {
        let pending = self.reconnect.lock().unwrap().take();
        drop(pending);
        let devices: Vec<Arc<Device>> = self.devices.lock().unwrap().values().cloned().collect();
        for device in devices {
            device.shutdown();
        }
        self.transport.close();
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.close();
        info!(
            "bridge: {} frames in, {} dropped",
            self.counters.frames_in.load(Ordering::Relaxed),
            self.counters.dropped.load(Ordering::Relaxed),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.ip_address = Some("127.0.0.1".into());
        config
    }

    #[test]
    fn rejects_broadcast_and_unknown() {
        let bridge = Bridge::new(test_config(), |_| {}).unwrap();
        assert!(
            bridge
                .add_device(Address::BROADCAST, DeviceType::DimmableLight)
                .is_err()
        );
        assert!(
            bridge
                .add_device(Address::new(9), DeviceType::Unknown)
                .is_err()
        );
    }

    #[test]
    fn duplicate_address_rejected() {
        let bridge = Bridge::new(test_config(), |_| {}).unwrap();
        bridge
            .add_device(Address::new(9), DeviceType::TankSensor)
            .unwrap();
        assert!(
            bridge
                .add_device(Address::new(9), DeviceType::TankSensor)
                .is_err()
        );
    }

    #[test]
    fn command_while_disconnected() {
        let bridge = Bridge::new(test_config(), |_| {}).unwrap();
        bridge
            .add_device(Address::new(9), DeviceType::TankSensor)
            .unwrap();
        // Tank rejects commands outright; a dimmer would fail on the
        // session send instead.
        assert!(
            bridge
                .command(Address::new(9), DeviceCommand::Power(true))
                .is_err()
        );
        assert!(matches!(
            bridge.send(
                &Message::broadcast(MessageType::Time, Address::new(1), &[]).unwrap()
            ),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn unknown_device_command() {
        let bridge = Bridge::new(test_config(), |_| {}).unwrap();
        assert!(matches!(
            bridge.command(Address::new(200), DeviceCommand::Power(true)),
            Err(Error::Command(_))
        ));
    }
}
