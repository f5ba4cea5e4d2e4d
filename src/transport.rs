/*! Frame transports: how CAN frames get on and off the wire.

Two implementations exist: [TcpTransport] here, speaking the COBS
framed byte protocol to a CAN-to-ethernet gateway, and
[crate::socketcan::SocketCanTransport] talking to a local interface.
Both push inbound frames into an injected sink callback and take
outbound frames through [Transport::send], which is safe under
concurrent callers.

Sending is fail-fast: frames go through a bounded queue to a single
writer thread (so on-the-wire order matches send order), and a full
queue errors instead of blocking the caller.
 */
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, info, trace, warn};

use crate::cobs::{Deframer, encode};
use crate::frame::CanFrame;
use crate::task::{CancellationToken, Task};
use crate::{Error, Result};

/// Callback receiving every inbound frame.
pub type FrameSink = Arc<dyn Fn(CanFrame) + Send + Sync>;

/// Callback fired once when the transport loses its connection (not
/// on deliberate [Transport::close]).
pub type DisconnectSink = Arc<dyn Fn() + Send + Sync>;

/// Outbound queue depth. Deep enough for command bursts, shallow
/// enough that a wedged gateway surfaces as [Error::QueueFull] fast.
const QUEUE_DEPTH: usize = 64;

/// A connection carrying CAN frames in both directions.
pub trait Transport: Send + Sync {
    /// Open (or re-open) the connection and start the I/O tasks.
    fn connect(&self) -> Result<()>;

    /// Queue one frame for transmission.
    ///
    /// A successful return means the writer thread will hand the
    /// bytes to the OS in send order; [Error::QueueFull] and
    /// [Error::NotConnected] come back immediately instead of
    /// blocking.
    fn send(&self, frame: &CanFrame) -> Result<()>;

    /// Whether the connection is currently up.
    fn is_connected(&self) -> bool;

    /// Tear the connection down and stop the I/O tasks. Does not
    /// fire the disconnect callback.
    fn close(&self);
}

struct Conn {
    stream: TcpStream,
    tx: SyncSender<CanFrame>,
    reader: Task,
    writer: Task,
}

/// TCP client transport to a CAN-to-ethernet gateway.
///
/// A reader thread feeds the COBS deframer and decodes each payload
/// as a wire-form CAN frame; a writer thread drains the outbound
/// queue. Either side hitting a socket error flips the transport to
/// disconnected and fires the disconnect callback exactly once.
pub struct TcpTransport {
    host: String,
    port: u16,
    sink: FrameSink,
    on_disconnect: DisconnectSink,
    connected: Arc<AtomicBool>,
    conn: Mutex<Option<Conn>>,
}

impl TcpTransport {
    /// New transport; no connection is attempted yet.
    pub fn new(host: &str, port: u16, sink: FrameSink, on_disconnect: DisconnectSink) -> Self {
        Self {
            host: host.to_string(),
            port,
            sink,
            on_disconnect,
            connected: Arc::new(AtomicBool::new(false)),
            conn: Mutex::new(None),
        }
    }

    fn teardown(&self, conn: Conn) {
        conn.reader.token().cancel();
        conn.writer.token().cancel();
        let _ = conn.stream.shutdown(Shutdown::Both);
        // Dropping `conn` drops the queue sender (waking the writer)
        // and joins both tasks.
        drop(conn);
    }

    fn reader_loop(
        mut stream: TcpStream,
        sink: FrameSink,
        connected: Arc<AtomicBool>,
        on_disconnect: DisconnectSink,
        token: CancellationToken,
    ) {
        let mut deframer = Deframer::new();
        let mut framing_errors = 0u64;
        let mut buf = [0u8; 2048];
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => {
                    if !token.is_cancelled() {
                        warn!("gateway closed the connection");
                        if connected.swap(false, Ordering::SeqCst) {
                            on_disconnect();
                        }
                    }
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    if !token.is_cancelled() {
                        warn!("gateway read error: {e}");
                        if connected.swap(false, Ordering::SeqCst) {
                            on_disconnect();
                        }
                    }
                    break;
                }
            };
            let now = Instant::now();
            for &b in &buf[..n] {
                let Some(payload) = deframer.push(b) else {
                    continue;
                };
                match CanFrame::decode_wire(&payload) {
                    Ok(frame) => sink(frame.with_timestamp(now)),
                    Err(e) => {
                        // Bad frames are the gateway's problem, not
                        // ours; count and carry on.
                        framing_errors += 1;
                        debug!("dropping undecodable frame {payload:02x?}: {e}");
                    }
                }
            }
        }
        if framing_errors > 0 {
            warn!("{framing_errors} frames had an undecodable CAN layout");
        }
    }

    fn writer_loop(
        mut stream: TcpStream,
        rx: Receiver<CanFrame>,
        connected: Arc<AtomicBool>,
        on_disconnect: DisconnectSink,
        token: CancellationToken,
    ) {
        while let Ok(frame) = rx.recv() {
            let bytes = encode(&frame.encode_wire());
            trace!("tx {frame}");
            if let Err(e) = stream.write_all(&bytes) {
                if !token.is_cancelled() {
                    warn!("gateway write error: {e}");
                    if connected.swap(false, Ordering::SeqCst) {
                        on_disconnect();
                    }
                }
                return;
            }
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&self) -> Result<()> {
        // Never join the old tasks while holding the conn lock; the
        // reader's sink path can call back into send, which takes it.
        let old = self.conn.lock().unwrap().take();
        if let Some(old) = old {
            self.teardown(old);
        }
        info!("connecting to gateway {}:{}", self.host, self.port);
        let stream = TcpStream::connect((self.host.as_str(), self.port))?;
        stream.set_nodelay(true)?;

        let (tx, rx) = sync_channel(QUEUE_DEPTH);
        let reader = {
            let stream = stream.try_clone()?;
            let sink = self.sink.clone();
            let connected = self.connected.clone();
            let on_disconnect = self.on_disconnect.clone();
            Task::spawn("tcp reader", move |token| {
                Self::reader_loop(stream, sink, connected, on_disconnect, token)
            })?
        };
        let writer = {
            let stream = stream.try_clone()?;
            let connected = self.connected.clone();
            let on_disconnect = self.on_disconnect.clone();
            Task::spawn("tcp writer", move |token| {
                Self::writer_loop(stream, rx, connected, on_disconnect, token)
            })?
        };

        let lost_race = self.conn.lock().unwrap().replace(Conn {
            stream,
            tx,
            reader,
            writer,
        });
        if let Some(lost_race) = lost_race {
            self.teardown(lost_race);
        }
        self.connected.store(true, Ordering::SeqCst);
        info!("gateway connected");
        Ok(())
    }

    fn send(&self, frame: &CanFrame) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let guard = self.conn.lock().unwrap();
        let Some(conn) = guard.as_ref() else {
            return Err(Error::NotConnected);
        };
        match conn.tx.try_send(frame.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(Error::NotConnected),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let conn = self.conn.lock().unwrap().take();
        if let Some(conn) = conn {
            self.teardown(conn);
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CanId;
    use std::sync::mpsc::channel;

    fn test_frame(n: u8) -> CanFrame {
        CanFrame::new(CanId::Standard(0x123), &[n, 0x22, 0x33]).unwrap()
    }

    #[test]
    fn receives_frames_across_chunk_boundaries() -> anyhow::Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut bytes = vec![0x00];
            bytes.extend(encode(&test_frame(1).encode_wire()));
            bytes.extend(encode(&test_frame(2).encode_wire()));
            // Dribble it out in awkward pieces.
            for chunk in bytes.chunks(3) {
                stream.write_all(chunk).unwrap();
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
        });

        let (tx, rx) = channel();
        let transport = TcpTransport::new(
            "127.0.0.1",
            addr.port(),
            Arc::new(move |f| tx.send(f).unwrap()),
            Arc::new(|| {}),
        );
        transport.connect()?;
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5))?, test_frame(1));
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5))?, test_frame(2));
        transport.close();
        Ok(())
    }

    #[test]
    fn send_reaches_the_wire() -> anyhow::Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let (srv_tx, srv_rx) = channel();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut deframer = Deframer::new();
            let mut buf = [0u8; 256];
            loop {
                let n = match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                for &b in &buf[..n] {
                    if let Some(payload) = deframer.push(b) {
                        srv_tx.send(CanFrame::decode_wire(&payload).unwrap()).unwrap();
                    }
                }
            }
        });

        let transport = TcpTransport::new("127.0.0.1", addr.port(), Arc::new(|_| {}), Arc::new(|| {}));
        transport.connect()?;
        transport.send(&test_frame(7))?;
        assert_eq!(srv_rx.recv_timeout(std::time::Duration::from_secs(5))?, test_frame(7));
        transport.close();
        Ok(())
    }

    #[test]
    fn send_while_disconnected_fails_fast() {
        let transport = TcpTransport::new("127.0.0.1", 1, Arc::new(|_| {}), Arc::new(|| {}));
        assert!(matches!(
            transport.send(&test_frame(0)),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn disconnect_callback_fires_once() -> anyhow::Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
            drop(stream);
        });
        let (tx, rx) = channel();
        let transport = TcpTransport::new(
            "127.0.0.1",
            addr.port(),
            Arc::new(|_| {}),
            Arc::new(move || tx.send(()).unwrap()),
        );
        transport.connect()?;
        rx.recv_timeout(std::time::Duration::from_secs(5))?;
        assert!(!transport.is_connected());
        assert!(rx.recv_timeout(std::time::Duration::from_millis(200)).is_err());
        Ok(())
    }
}
