/*! Gateway discovery: UDP beacons on port 47664.

CAN-to-ethernet gateways announce themselves about once a second
with a small JSON datagram:

```json
{"mfg":"IDS","product":"CAN_TO_ETHERNET_GATEWAY","name":"RV-01","port":"6969"}
```

The listener keeps a table of gateways seen in the last five seconds.
The beacon body is matched with a shallow string-key scanner rather
than a JSON parser; four known keys from a fixed firmware do not
justify one, and the scanner shrugs off anything malformed.
 */
use std::collections::HashMap;
use std::net::{IpAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::Result;
use crate::task::Task;

/// The gateways' announcement port.
pub const DISCOVERY_PORT: u16 = 47664;

/// Beacons expire this long after the last one.
const EXPIRY: Duration = Duration::from_secs(5);

/// Only this manufacturer is admitted.
const WANT_MFG: &str = "IDS";
/// Only this product is admitted.
const WANT_PRODUCT: &str = "CAN_TO_ETHERNET_GATEWAY";

/// One gateway heard on the network.
#[derive(Clone, Debug)]
pub struct Gateway {
    /// Where the beacon came from.
    pub ip: IpAddr,
    /// The gateway's TCP service port, from the beacon body.
    pub port: u16,
    /// Its self-reported name.
    pub name: String,
    /// Manufacturer string from the beacon.
    pub manufacturer: String,
    /// Product string from the beacon.
    pub product: String,
    /// When the last beacon arrived.
    pub last_seen: Instant,
}

/// Extract the string value of `key` from a flat JSON object body.
///
/// Exactly good enough for the beacon format: finds `"key"`, skips
/// the colon, takes the quoted value. No escapes, no nesting.
fn json_string_value(body: &str, key: &str) -> Option<String> {
    let needle = format!("\"{key}\"");
    let after_key = &body[body.find(&needle)? + needle.len()..];
    let after_colon = after_key.trim_start().strip_prefix(':')?.trim_start();
    let value = after_colon.strip_prefix('"')?;
    Some(value[..value.find('"')?].to_string())
}

/// Background listener for gateway beacons.
pub struct Discovery {
    gateways: Arc<Mutex<HashMap<IpAddr, Gateway>>>,
    expiry: Duration,
    local_port: u16,
    _listener: Task,
}

impl Discovery {
    /// Bind the discovery port and start listening.
    pub fn start() -> Result<Self> {
        Self::start_on(DISCOVERY_PORT, EXPIRY)
    }

    fn start_on(port: u16, expiry: Duration) -> Result<Self> {
        let socket = bind_reuse(port)?;
        // The read timeout doubles as the eviction tick and keeps
        // shutdown prompt.
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;
        let local_port = socket.local_addr()?.port();
        let gateways: Arc<Mutex<HashMap<IpAddr, Gateway>>> = Arc::new(Mutex::new(HashMap::new()));

        let listener = {
            let gateways = gateways.clone();
            Task::spawn("discovery", move |token| {
                let mut buf = [0u8; 1024];
                loop {
                    if token.is_cancelled() {
                        return;
                    }
                    match socket.recv_from(&mut buf) {
                        Ok((n, from)) => {
                            if let Some(gw) = parse_beacon(&buf[..n], from.ip()) {
                                let mut map = gateways.lock().unwrap();
                                if !map.contains_key(&gw.ip) {
                                    info!("gateway {} ({}) at {}:{}", gw.name, gw.product, gw.ip, gw.port);
                                }
                                map.insert(gw.ip, gw);
                            }
                        }
                        Err(e)
                            if matches!(
                                e.kind(),
                                std::io::ErrorKind::WouldBlock
                                    | std::io::ErrorKind::TimedOut
                                    | std::io::ErrorKind::Interrupted
                            ) => {}
                        Err(e) => {
                            debug!("discovery read: {e}");
                            return;
                        }
                    }
                    gateways
                        .lock()
                        .unwrap()
                        .retain(|_, gw| gw.last_seen.elapsed() < expiry);
                }
            })?
        };

        Ok(Self {
            gateways,
            expiry,
            local_port,
            _listener: listener,
        })
    }

    /// The UDP port the listener actually bound.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Gateways heard within the expiry window.
    pub fn gateways(&self) -> Vec<Gateway> {
        let map = self.gateways.lock().unwrap();
        map.values()
            .filter(|gw| gw.last_seen.elapsed() < self.expiry)
            .cloned()
            .collect()
    }

    /// Poll (every 100 ms) until any gateway shows up or the timeout
    /// passes.
    pub fn wait_for_gateway(&self, timeout: Duration) -> Option<Gateway> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(gw) = self.gateways().into_iter().next() {
                return Some(gw);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

fn parse_beacon(body: &[u8], ip: IpAddr) -> Option<Gateway> {
    let body = std::str::from_utf8(body).ok()?;
    let manufacturer = json_string_value(body, "mfg")?;
    let product = json_string_value(body, "product")?;
    if manufacturer != WANT_MFG || product != WANT_PRODUCT {
        debug!("ignoring beacon from {ip}: {manufacturer}/{product}");
        return None;
    }
    let name = json_string_value(body, "name")?;
    let port: u16 = json_string_value(body, "port")?.parse().ok()?;
    Some(Gateway {
        ip,
        port,
        name,
        manufacturer,
        product,
        last_seen: Instant::now(),
    })
}

/// Bind a UDP socket with SO_REUSEADDR, so the listener coexists
/// with anything else watching the beacon port.
#[cfg(unix)]
fn bind_reuse(port: u16) -> std::io::Result<UdpSocket> {
    use std::os::fd::FromRawFd;

    // SAFETY: plain socket(2) call.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let one: libc::c_int = 1;
    // SAFETY: the option value points at a c_int of the stated size.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&raw const one).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let e = std::io::Error::last_os_error();
        // SAFETY: fd from socket(2) above, not shared.
        unsafe { libc::close(fd) };
        return Err(e);
    }
    // SAFETY: sockaddr_in is valid all-zeroes; fields are set below.
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    // SAFETY: addr is a properly initialized sockaddr_in of the
    // stated length.
    let rc = unsafe {
        libc::bind(
            fd,
            (&raw const addr).cast::<libc::sockaddr>(),
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let e = std::io::Error::last_os_error();
        // SAFETY: as above.
        unsafe { libc::close(fd) };
        return Err(e);
    }
    // SAFETY: fd is a bound UDP socket we own exclusively.
    Ok(unsafe { UdpSocket::from_raw_fd(fd) })
}

#[cfg(not(unix))]
fn bind_reuse(port: u16) -> std::io::Result<UdpSocket> {
    UdpSocket::bind(("0.0.0.0", port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shallow_matcher() {
        let body = r#"{"mfg":"IDS","product":"CAN_TO_ETHERNET_GATEWAY","name":"RV-01","port":"6969"}"#;
        assert_eq!(json_string_value(body, "mfg").as_deref(), Some("IDS"));
        assert_eq!(json_string_value(body, "name").as_deref(), Some("RV-01"));
        assert_eq!(json_string_value(body, "port").as_deref(), Some("6969"));
        assert_eq!(json_string_value(body, "missing"), None);
        // Whitespace around the colon is fine.
        assert_eq!(
            json_string_value(r#"{ "name" :  "x" }"#, "name").as_deref(),
            Some("x")
        );
        // Non-string values and garbage do not panic.
        assert_eq!(json_string_value(r#"{"port":6969}"#, "port"), None);
        assert_eq!(json_string_value(r#"{"port""#, "port"), None);
    }

    #[test]
    fn beacon_filtering() {
        let ip: IpAddr = "192.168.1.9".parse().unwrap();
        let good = serde_json::json!({
            "mfg": "IDS",
            "product": "CAN_TO_ETHERNET_GATEWAY",
            "name": "RV-01",
            "port": "6969",
        });
        let gw = parse_beacon(good.to_string().as_bytes(), ip).unwrap();
        assert_eq!(gw.port, 6969);
        assert_eq!(gw.name, "RV-01");

        let wrong_mfg = serde_json::json!({
            "mfg": "ACME",
            "product": "CAN_TO_ETHERNET_GATEWAY",
            "name": "x",
            "port": "1",
        });
        assert!(parse_beacon(wrong_mfg.to_string().as_bytes(), ip).is_none());
        assert!(parse_beacon(b"not json at all", ip).is_none());
    }

    #[test]
    fn hears_and_expires_beacons() -> anyhow::Result<()> {
        // Ephemeral port and a short expiry to keep the test quick.
        let discovery = Discovery::start_on(0, Duration::from_millis(600))?;
        let sender = UdpSocket::bind("127.0.0.1:0")?;
        let beacon =
            br#"{"mfg":"IDS","product":"CAN_TO_ETHERNET_GATEWAY","name":"RV-01","port":"6969"}"#;
        sender.send_to(beacon, ("127.0.0.1", discovery.local_port))?;

        let gw = discovery
            .wait_for_gateway(Duration::from_secs(3))
            .expect("beacon not heard");
        assert_eq!(gw.name, "RV-01");
        assert_eq!(gw.port, 6969);
        assert_eq!(gw.manufacturer, "IDS");

        // No more beacons: the entry ages out.
        std::thread::sleep(Duration::from_millis(900));
        assert!(discovery.gateways().is_empty());
        Ok(())
    }
}
