/*! The configuration surface the bridge consumes.

Parsing a config *file* is the host's job; this is the typed struct
it should end up with, with serde derives so any format the host
likes deserializes straight into it. Validation happens here so a bad
config fails the bridge at construction instead of half-working.
 */
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default TCP port of the CAN-to-ethernet gateway.
pub const DEFAULT_TCP_PORT: u16 = 6969;

/// Which transport the bridge uses.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// COBS over TCP to a gateway.
    Tcp,
    /// Local SocketCAN interface (Linux).
    SocketCan,
}

/// Bridge configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Transport selection.
    pub connection_type: ConnectionType,
    /// Gateway IPv4 address; TCP only.
    pub ip_address: Option<String>,
    /// Gateway TCP port; TCP only.
    pub tcp_port: u16,
    /// CAN interface name; SocketCAN only.
    pub can_interface: Option<String>,
    /// The controller's own bus address; never 0.
    pub source_address: u8,
    /// Log every frame in and out (TEXT_CONSOLE excepted).
    pub verbose: bool,
    /// Per-session idle timeout in seconds.
    pub idle_timeout_s: u64,
    /// Override the per-family command timeout, in seconds.
    pub command_timeout_s: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_type: ConnectionType::Tcp,
            ip_address: None,
            tcp_port: DEFAULT_TCP_PORT,
            can_interface: None,
            source_address: 1,
            verbose: false,
            idle_timeout_s: 30,
            command_timeout_s: None,
        }
    }
}

/// A validated connection choice, ready to hand to a transport.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Connection {
    Tcp {
        host: String,
        port: u16,
    },
    SocketCan {
        #[allow(dead_code)] // Read by the linux-only transport.
        interface: String,
    },
}

impl Config {
    /// Validate and resolve the connection parameters.
    pub(crate) fn connection(&self) -> Result<Connection> {
        if self.source_address == 0 {
            return Err(Error::Config("source address 0 is the broadcast address".into()));
        }
        if self.idle_timeout_s == 0 {
            return Err(Error::Config("idle timeout must be positive".into()));
        }
        match self.connection_type {
            ConnectionType::Tcp => {
                let host = self
                    .ip_address
                    .as_deref()
                    .ok_or_else(|| Error::Config("tcp needs ip_address".into()))?;
                if host.parse::<Ipv4Addr>().is_err() {
                    return Err(Error::Config(format!("bad ip_address {host:?}")));
                }
                if self.tcp_port == 0 {
                    return Err(Error::Config("tcp_port 0".into()));
                }
                Ok(Connection::Tcp {
                    host: host.to_string(),
                    port: self.tcp_port,
                })
            }
            ConnectionType::SocketCan => {
                let interface = self
                    .can_interface
                    .as_deref()
                    .ok_or_else(|| Error::Config("socketcan needs can_interface".into()))?;
                if interface.is_empty() {
                    return Err(Error::Config("empty can_interface".into()));
                }
                if cfg!(not(target_os = "linux")) {
                    return Err(Error::Config("socketcan requires linux".into()));
                }
                Ok(Connection::SocketCan {
                    interface: interface.to_string(),
                })
            }
        }
    }

    /// Validate without resolving.
    pub fn validate(&self) -> Result<()> {
        self.connection().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_invalid_until_addressed() {
        // The default config has no gateway address.
        assert!(Config::default().validate().is_err());
        let mut config = Config::default();
        config.ip_address = Some("192.168.1.4".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_broadcast_source() {
        let mut config = Config::default();
        config.ip_address = Some("192.168.1.4".into());
        config.source_address = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_ip() {
        let mut config = Config::default();
        config.ip_address = Some("not an ip".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn socketcan_needs_interface() {
        let mut config = Config::default();
        config.connection_type = ConnectionType::SocketCan;
        assert!(config.validate().is_err());
        config.can_interface = Some("can0".into());
        #[cfg(target_os = "linux")]
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserializes_from_json() {
        let config: Config = serde_json::from_str(
            r#"{
                "connection_type": "tcp",
                "ip_address": "10.0.0.2",
                "tcp_port": 7070,
                "verbose": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.connection_type, ConnectionType::Tcp);
        assert_eq!(config.tcp_port, 7070);
        assert_eq!(config.source_address, 1);
        assert!(config.verbose);
        assert_eq!(
            config.connection().unwrap(),
            Connection::Tcp {
                host: "10.0.0.2".into(),
                port: 7070
            }
        );
    }

    #[test]
    fn socketcan_from_json() {
        let config: Config = serde_json::from_str(
            r#"{"connection_type": "socketcan", "can_interface": "can0"}"#,
        )
        .unwrap();
        assert_eq!(config.connection_type, ConnectionType::SocketCan);
    }
}
