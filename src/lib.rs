#![warn(missing_docs)]
/*! Host-side controller for the IDS-CAN RV automation bus.

IDS-CAN is a 250 kbit/s CAN bus found in RVs, controlling lights,
relays, H-bridge motors (slides, awnings), HVAC zones, and tank
sensors. Devices only accept commands over an authenticated
point-to-point session, negotiated with a seed/key handshake and kept
alive with heartbeats.

This crate implements the full protocol stack and its runtime, and
exposes a small API on top: commands in, typed state updates out. What
it deliberately does *not* contain is host glue: no config file
parsing, no CLI, no logger installation. Those belong to whatever
shell (home automation integration, HTTP service, ...) embeds the
[`Bridge`].

# Architecture overview

Inbound data flows bottom up, outbound top down:

```text
   [ Device runtimes: dimmer, rgb, relay, ]
   [ hbridge, hvac, tank     (device::*)  ]
           ↕                ↕
   [ Sessions (session) ]  [ Command builders (command) ]
           ↕                ↕
        [ Bridge dispatcher (bridge) ]
                   ↕
        [ Typed messages (message) ]
                   ↕
        [ CAN frames + wire form (frame) ]
                   ↕
  [ COBS+CRC8 framing (cobs, crc8) ]   (TCP gateway only)
                   ↕
  [ Transport: TCP gateway or SocketCAN ]
```

A [`Bridge`] owns exactly one transport and an address book of device
runtimes. Each runtime owns its session and its state cache; cross
references are broken with injected send callbacks, so nothing in here
is global.

# Example

```no_run
use idscan::{Address, Bridge, Config, DeviceCommand, DeviceType};

# fn main() -> idscan::Result<()> {
let mut config = Config::default();
config.ip_address = Some("192.168.1.4".into());
let bridge = Bridge::new(config, |update| {
    println!("{}: {:?}", update.address, update.update);
})?;
bridge.connect()?;
bridge.add_device(Address::new(92), DeviceType::DimmableLight)?;
bridge.command(Address::new(92), DeviceCommand::Brightness(50))?;
# Ok(())
# }
```

All logging goes through the [`log`] facade; install whatever logger
the host prefers, or none.
 */

pub mod bridge;
pub mod cobs;
pub mod command;
pub mod config;
pub mod crc8;
pub mod device;
pub mod dimmer;
pub mod discovery;
pub mod frame;
pub mod hbridge;
pub mod hvac;
pub mod lockout;
pub mod message;
pub mod relay;
pub mod rgb;
pub mod session;
pub mod tank;
pub mod task;
pub mod transport;

#[cfg(target_os = "linux")]
pub mod socketcan;

pub use bridge::Bridge;
pub use config::{Config, ConnectionType};
pub use device::{DeviceCommand, DeviceType, StateUpdate, Update};
pub use discovery::Discovery;
pub use frame::{CanFrame, CanId};
pub use message::{Address, Message, MessageType};

/// Errors of the kinds in the controller's taxonomy.
///
/// Transport, framing, and protocol problems are normally absorbed
/// inside the stack (counted and logged); what callers of the public
/// API usually see are the session, command, and config kinds.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket open/read/write failed. The bridge goes offline and
    /// schedules a reconnect.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    /// COBS decode or CAN wire layout invalid.
    #[error("framing: {0}")]
    Framing(String),

    /// A frame decoded, but not into a valid message.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Handshake failed or timed out, or a heartbeat came back
    /// negative.
    #[error("session: {0}")]
    Session(String),

    /// A command could not be issued; retry per operation.
    #[error("command: {0}")]
    Command(String),

    /// Command issued while the transport is disconnected.
    #[error("not connected")]
    NotConnected,

    /// The bounded outbound queue is full; the caller should back
    /// off rather than block.
    #[error("outbound queue full")]
    QueueFull,

    /// Bad configuration; the bridge stays offline.
    #[error("config: {0}")]
    Config(String),
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
