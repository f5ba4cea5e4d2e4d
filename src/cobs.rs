/*! COBS framing with an embedded CRC8, the TCP gateway's byte protocol.

[COBS][cobs] reserves 0x00 as a frame delimiter and never lets it
appear inside a frame. The gateway speaks a compact variant of it: the
code byte's low six bits count literal bytes, and the high two bits
count zeroes to reinsert after them, so a code byte of `0x47` means
"seven literals, then one zero". Runs longer than 63 literals or three
zeroes simply continue with another code byte.

Every frame carries the CAN frame's wire bytes followed by one CRC8
(see [crate::crc8]), and the encoder's trailing phantom zero means a
well formed frame always ends with a dropped overhead byte.

[cobs]: https://en.wikipedia.org/wiki/Consistent_Overhead_Byte_Stuffing
 */
use log::{debug, info, trace};

use crate::crc8::crc8;

/// Encoded frames never legitimately decode to more than this many
/// bytes (13 wire bytes + CRC + phantom zero, with margin). Anything
/// longer is line noise and gets dropped without buffering it all.
const MAX_DECODED: usize = 32;

/// Frame a payload: append CRC8, stuff, terminate with a single 0x00.
///
/// The inverse of [Deframer]. The payload here is a CAN frame in wire
/// form ([crate::frame::CanFrame::encode_wire]).
#[must_use]
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(payload.len() + 2);
    data.extend_from_slice(payload);
    data.push(crc8(payload));
    // Phantom zero. It lands in the last code byte's zero count, and
    // the deframer drops it again, so frames can end in a literal.
    data.push(0x00);

    let mut out = Vec::with_capacity(data.len() + data.len() / 0x3f + 2);
    let mut i = 0;
    while i < data.len() {
        let mut n = 0;
        while i + n < data.len() && data[i + n] != 0 && n < 0x3f {
            n += 1;
        }
        let mut z = 0;
        while i + n + z < data.len() && data[i + n + z] == 0 && z < 3 {
            z += 1;
        }
        out.push(((z as u8) << 6) | n as u8);
        out.extend_from_slice(&data[i..i + n]);
        i += n + z;
    }
    out.push(0x00);
    out
}

/// Streaming COBS+CRC deframer.
///
/// Push bytes in whatever chunking the socket hands out; a decoded,
/// checksummed payload pops out whenever a delimiter completes one.
/// Corrupt input is discarded silently (counted), and any number of
/// 0x00 bytes between frames is fine. Never panics on any input.
pub struct Deframer {
    buf: Vec<u8>,
    code: u8,
    seen_data: bool,
    decoded: u64,
    crc_errors: u64,
    discarded: u64,
}

impl Deframer {
    /// New deframer, between frames.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(MAX_DECODED),
            code: 0,
            seen_data: false,
            decoded: 0,
            crc_errors: 0,
            discarded: 0,
        }
    }

    /// Feed one byte. Returns a complete frame payload if this byte
    /// finished one.
    pub fn push(&mut self, b: u8) -> Option<Vec<u8>> {
        if b == 0 {
            let code = std::mem::replace(&mut self.code, 0);
            let seen = std::mem::replace(&mut self.seen_data, false);
            if self.buf.is_empty() {
                if code == 0 && !seen {
                    // Just a delimiter between frames.
                    return None;
                }
                trace!("Deframer: empty frame discarded");
                self.discarded += 1;
                return None;
            }
            // Drop the overhead byte the encoder's phantom zero left.
            self.buf.pop();
            if code != 0 {
                // The last code byte promised more bytes than arrived
                // before the delimiter.
                debug!("Deframer: truncated run (code {code} left), discarding");
                self.discarded += 1;
                self.buf.clear();
                return None;
            }
            let Some(crc) = self.buf.pop() else {
                self.discarded += 1;
                return None;
            };
            let frame = std::mem::replace(&mut self.buf, Vec::with_capacity(MAX_DECODED));
            if crc8(&frame) == crc {
                self.decoded += 1;
                Some(frame)
            } else {
                debug!("Deframer: CRC mismatch, got {crc:#04x} over {frame:02x?}");
                self.crc_errors += 1;
                None
            }
        } else {
            self.seen_data = true;
            if self.code == 0 {
                self.code = b;
            } else {
                self.code -= 1;
                self.buf.push(b);
            }
            while self.code & 0x3f == 0 && self.code > 0 {
                self.buf.push(0x00);
                self.code -= 64;
            }
            if self.buf.len() > MAX_DECODED {
                // Line noise with no delimiters; don't buffer it all.
                self.discarded += 1;
                self.buf.clear();
            }
            None
        }
    }

    /// Frames decoded successfully so far.
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    /// Frames dropped on checksum mismatch.
    pub fn crc_errors(&self) -> u64 {
        self.crc_errors
    }

    /// Frames dropped for malformed stuffing.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Deframer {
    fn drop(&mut self) {
        info!(
            "Deframer: decoded {}, CRC errors {}, discarded {}",
            self.decoded, self.crc_errors, self.discarded
        );
    }
}
