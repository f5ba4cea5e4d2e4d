/*! SocketCAN transport for a local CAN interface.

The Linux kernel exposes CAN adapters as network devices (see
`Documentation/networking/can.rst`); a raw `PF_CAN` socket reads and
writes native `can_frame` structs, so there is no COBS layer here at
all, just the mapping onto [crate::frame::CanFrame].

Reads run with a one second `SO_RCVTIMEO` so shutdown never waits on
a silent bus.
 */
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, info, trace, warn};

use crate::frame::{CanFrame, CanId};
use crate::task::{CancellationToken, Task};
use crate::transport::{DisconnectSink, FrameSink, Transport};
use crate::{Error, Result};

const CAN_RAW: libc::c_int = 1;
const CAN_EFF_FLAG: u32 = 0x8000_0000;
const CAN_RTR_FLAG: u32 = 0x4000_0000;
const CAN_ERR_FLAG: u32 = 0x2000_0000;
const CAN_SFF_MASK: u32 = 0x0000_07ff;
const CAN_EFF_MASK: u32 = 0x1fff_ffff;

const QUEUE_DEPTH: usize = 64;

/// `struct sockaddr_can`, the bind address of a raw CAN socket.
#[repr(C)]
struct CanAddr {
    can_family: libc::c_short,
    if_index: libc::c_int,
    rx_id: libc::c_uint,
    tx_id: libc::c_uint,
}

/// `struct can_frame` as the kernel reads and writes it.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct KernelFrame {
    can_id: u32,
    can_dlc: u8,
    pad: u8,
    res0: u8,
    res1: u8,
    data: [u8; 8],
}

impl KernelFrame {
    fn from_frame(frame: &CanFrame) -> Self {
        let can_id = match frame.id() {
            CanId::Standard(v) => u32::from(v),
            CanId::Extended(v) => v | CAN_EFF_FLAG,
        };
        let mut data = [0u8; 8];
        data[..frame.data().len()].copy_from_slice(frame.data());
        Self {
            can_id,
            can_dlc: frame.data().len() as u8,
            data,
            ..Default::default()
        }
    }

    fn to_frame(&self) -> Result<CanFrame> {
        let id = if self.can_id & CAN_EFF_FLAG != 0 {
            CanId::Extended(self.can_id & CAN_EFF_MASK)
        } else {
            CanId::Standard((self.can_id & CAN_SFF_MASK) as u16)
        };
        let len = usize::from(self.can_dlc.min(8));
        CanFrame::new(id, &self.data[..len])
    }
}

fn open_socket(interface: &str) -> Result<libc::c_int> {
    let ifname = std::ffi::CString::new(interface)
        .map_err(|_| Error::Config(format!("interface name {interface:?}")))?;
    // SAFETY: if_nametoindex only reads the NUL terminated name.
    let if_index = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
    if if_index == 0 {
        return Err(io::Error::last_os_error().into());
    }

    // SAFETY: plain socket(2) call, no pointers involved.
    let fd = unsafe { libc::socket(libc::PF_CAN, libc::SOCK_RAW, CAN_RAW) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }

    let addr = CanAddr {
        can_family: libc::AF_CAN as libc::c_short,
        if_index: if_index as libc::c_int,
        rx_id: 0,
        tx_id: 0,
    };
    // SAFETY: addr is a properly initialized sockaddr_can and the
    // length passed matches its size.
    let rc = unsafe {
        libc::bind(
            fd,
            (&raw const addr).cast::<libc::sockaddr>(),
            size_of::<CanAddr>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let e = io::Error::last_os_error();
        // SAFETY: fd came from socket(2) above and is not shared yet.
        unsafe { libc::close(fd) };
        return Err(e.into());
    }

    let timeout = libc::timeval {
        tv_sec: 1,
        tv_usec: 0,
    };
    // SAFETY: the option value points at a timeval of the stated
    // length.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            (&raw const timeout).cast(),
            size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let e = io::Error::last_os_error();
        // SAFETY: as above.
        unsafe { libc::close(fd) };
        return Err(e.into());
    }
    Ok(fd)
}

struct Conn {
    fd: libc::c_int,
    tx: SyncSender<CanFrame>,
    reader: Task,
    writer: Task,
}

/// Transport over a local SocketCAN interface such as `can0`.
pub struct SocketCanTransport {
    interface: String,
    sink: FrameSink,
    on_disconnect: DisconnectSink,
    connected: Arc<AtomicBool>,
    conn: Mutex<Option<Conn>>,
}

impl SocketCanTransport {
    /// New transport on the named interface; nothing is opened yet.
    pub fn new(
        interface: &str,
        sink: FrameSink,
        on_disconnect: DisconnectSink,
    ) -> Self {
        Self {
            interface: interface.to_string(),
            sink,
            on_disconnect,
            connected: Arc::new(AtomicBool::new(false)),
            conn: Mutex::new(None),
        }
    }

    fn teardown(&self, conn: Conn) {
        conn.reader.token().cancel();
        conn.writer.token().cancel();
        let Conn {
            fd, tx, reader, writer, ..
        } = conn;
        // Dropping the sender wakes the writer; the reader wakes on
        // its receive timeout.
        drop(tx);
        drop(reader);
        drop(writer);
        // Only close the fd once nobody can still be using it, or a
        // reused descriptor number would go to the wrong socket.
        // SAFETY: both threads using fd have been joined.
        unsafe { libc::close(fd) };
    }

    fn reader_loop(
        fd: libc::c_int,
        sink: FrameSink,
        connected: Arc<AtomicBool>,
        on_disconnect: DisconnectSink,
        token: CancellationToken,
    ) {
        loop {
            let mut kframe = KernelFrame::default();
            // SAFETY: the buffer is a can_frame sized struct owned by
            // this stack frame.
            let n = unsafe {
                libc::read(
                    fd,
                    (&raw mut kframe).cast::<libc::c_void>(),
                    size_of::<KernelFrame>(),
                )
            };
            if token.is_cancelled() {
                return;
            }
            if n < 0 {
                let e = io::Error::last_os_error();
                match e.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                        continue;
                    }
                    _ => {
                        warn!("CAN read error: {e}");
                        if connected.swap(false, Ordering::SeqCst) {
                            on_disconnect();
                        }
                        return;
                    }
                }
            }
            if n as usize != size_of::<KernelFrame>() {
                debug!("short CAN read of {n} bytes");
                continue;
            }
            if kframe.can_id & (CAN_ERR_FLAG | CAN_RTR_FLAG) != 0 {
                // Error and remote frames carry nothing for us.
                continue;
            }
            match kframe.to_frame() {
                Ok(frame) => sink(frame.with_timestamp(Instant::now())),
                Err(e) => debug!("dropping kernel frame: {e}"),
            }
        }
    }

    fn writer_loop(
        fd: libc::c_int,
        rx: Receiver<CanFrame>,
        connected: Arc<AtomicBool>,
        on_disconnect: DisconnectSink,
        token: CancellationToken,
    ) {
        while let Ok(frame) = rx.recv() {
            let kframe = KernelFrame::from_frame(&frame);
            trace!("tx {frame}");
            // SAFETY: writes one fully initialized can_frame struct.
            let n = unsafe {
                libc::write(
                    fd,
                    (&raw const kframe).cast::<libc::c_void>(),
                    size_of::<KernelFrame>(),
                )
            };
            if n as usize != size_of::<KernelFrame>() {
                let e = io::Error::last_os_error();
                if !token.is_cancelled() {
                    warn!("CAN write error: {e}");
                    if connected.swap(false, Ordering::SeqCst) {
                        on_disconnect();
                    }
                }
                return;
            }
        }
    }
}

impl Transport for SocketCanTransport {
    fn connect(&self) -> Result<()> {
        // As in the TCP transport: never join old tasks while
        // holding the conn lock.
        let old = self.conn.lock().unwrap().take();
        if let Some(old) = old {
            self.teardown(old);
        }
        info!("opening CAN interface {}", self.interface);
        let fd = open_socket(&self.interface)?;

        let (tx, rx) = sync_channel(QUEUE_DEPTH);
        let reader = {
            let sink = self.sink.clone();
            let connected = self.connected.clone();
            let on_disconnect = self.on_disconnect.clone();
            Task::spawn("can reader", move |token| {
                Self::reader_loop(fd, sink, connected, on_disconnect, token)
            })?
        };
        let writer = {
            let connected = self.connected.clone();
            let on_disconnect = self.on_disconnect.clone();
            Task::spawn("can writer", move |token| {
                Self::writer_loop(fd, rx, connected, on_disconnect, token)
            })?
        };

        let lost_race = self.conn.lock().unwrap().replace(Conn {
            fd,
            tx,
            reader,
            writer,
        });
        if let Some(lost_race) = lost_race {
            self.teardown(lost_race);
        }
        self.connected.store(true, Ordering::SeqCst);
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

impl Drop for SocketCanTransport {
    fn drop(&mut self) {
        self.close();
    }
}
