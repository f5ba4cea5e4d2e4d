/*! CAN frame model and its gateway wire form.

The same frame type is the common currency for both transports. The
TCP gateway renders frames in a compact wire form (length byte, big
endian id, payload) inside the COBS stream; the SocketCAN transport
maps kernel `can_frame`s straight onto this model.
 */
use std::fmt;
use std::time::Instant;

use crate::{Error, Result};

/// Mask applied to the wire length byte; bit 4 is an echo marker some
/// gateways set on frames reflected back to their sender.
const LEN_ECHO_MASK: u8 = 0xef;

/// A CAN identifier, 11 or 29 bits.
///
/// Extendedness is part of the identity: `Standard(5)` and
/// `Extended(5)` are different ids on the bus.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CanId {
    /// 11-bit identifier, 0..=0x7FF.
    Standard(u16),
    /// 29-bit identifier, 0..=0x1FFFFFFF.
    Extended(u32),
}

impl CanId {
    /// Largest standard id.
    pub const STANDARD_MAX: u16 = 0x7ff;
    /// Largest extended id.
    pub const EXTENDED_MAX: u32 = 0x1fff_ffff;

    /// Make a standard (11-bit) id.
    pub fn standard(raw: u16) -> Result<Self> {
        if raw > Self::STANDARD_MAX {
            return Err(Error::Framing(format!("standard id {raw:#x} over 11 bits")));
        }
        Ok(Self::Standard(raw))
    }

    /// Make an extended (29-bit) id.
    pub fn extended(raw: u32) -> Result<Self> {
        if raw > Self::EXTENDED_MAX {
            return Err(Error::Framing(format!("extended id {raw:#x} over 29 bits")));
        }
        Ok(Self::Extended(raw))
    }

    /// The raw id value, without the extended flag.
    pub fn raw(&self) -> u32 {
        match self {
            Self::Standard(v) => u32::from(*v),
            Self::Extended(v) => *v,
        }
    }

    /// Whether this is a 29-bit id.
    pub fn is_extended(&self) -> bool {
        matches!(self, Self::Extended(_))
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard(v) => write!(f, "{v:03X}"),
            Self::Extended(v) => write!(f, "{v:08X}"),
        }
    }
}

/// One CAN frame: id plus up to eight payload bytes.
///
/// Immutable once built. Frames in the receive direction may carry a
/// monotonic timestamp; it is bookkeeping, not identity, so equality
/// ignores it.
#[derive(Clone, Debug)]
pub struct CanFrame {
    id: CanId,
    data: [u8; 8],
    len: usize,
    timestamp: Option<Instant>,
}

impl CanFrame {
    /// Build a frame. Fails if the payload exceeds eight bytes.
    pub fn new(id: CanId, data: &[u8]) -> Result<Self> {
        if data.len() > 8 {
            return Err(Error::Framing(format!("payload of {} bytes", data.len())));
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            data: buf,
            len: data.len(),
            timestamp: None,
        })
    }

    /// Same frame, stamped with a receive time.
    #[must_use]
    pub fn with_timestamp(mut self, when: Instant) -> Self {
        self.timestamp = Some(when);
        self
    }

    /// The frame's identifier.
    pub fn id(&self) -> CanId {
        self.id
    }

    /// The payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Receive timestamp, if the transport stamped one.
    pub fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }

    /// Render into the gateway wire form.
    ///
    /// Byte 0 is the payload length, then the id big endian in two
    /// bytes (standard) or four with bit 31 set (extended), then
    /// exactly the payload. Total size 3..=13.
    #[must_use]
    pub fn encode_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 4 + self.len);
        out.push(self.len as u8);
        match self.id {
            CanId::Standard(v) => out.extend_from_slice(&v.to_be_bytes()),
            CanId::Extended(v) => out.extend_from_slice(&(v | 0x8000_0000).to_be_bytes()),
        }
        out.extend_from_slice(self.data());
        out
    }

    /// Parse the gateway wire form.
    ///
    /// The id width is not explicit on the wire; it falls out of the
    /// total length minus the payload length, and anything other than
    /// two or four id bytes is a framing error.
    pub fn decode_wire(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 3 {
            return Err(Error::Framing(format!("wire frame of {} bytes", bytes.len())));
        }
        let len = usize::from(bytes[0] & LEN_ECHO_MASK);
        if len > 8 {
            return Err(Error::Framing(format!("payload length {len}")));
        }
        let id = match bytes.len().checked_sub(1 + len) {
            Some(2) => {
                let raw = u16::from_be_bytes([bytes[1], bytes[2]]);
                CanId::standard(raw)?
            }
            Some(4) => {
                let raw = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
                if raw & 0x8000_0000 != 0 {
                    CanId::Extended(raw & CanId::EXTENDED_MAX)
                } else {
                    CanId::standard(u16::try_from(raw).map_err(|_| {
                        Error::Framing(format!("wide standard id {raw:#x}"))
                    })?)?
                }
            }
            other => {
                return Err(Error::Framing(format!(
                    "id width {other:?} for {} wire bytes, payload {len}",
                    bytes.len()
                )));
            }
        };
        Self::new(id, &bytes[bytes.len() - len..])
    }
}

impl PartialEq for CanFrame {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.data() == other.data()
    }
}

impl Eq for CanFrame {}

impl fmt::Display for CanFrame {
    /// candump-ish rendering, `123#112233`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#", self.id)?;
        for b in self.data() {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_ranges() {
        assert!(CanId::standard(0x7ff).is_ok());
        assert!(CanId::standard(0x800).is_err());
        assert!(CanId::extended(0x1fff_ffff).is_ok());
        assert!(CanId::extended(0x2000_0000).is_err());
    }

    #[test]
    fn same_value_different_width() {
        assert_ne!(CanId::Standard(5), CanId::Extended(5));
        let a = CanFrame::new(CanId::Standard(5), &[1]).unwrap();
        let b = CanFrame::new(CanId::Extended(5), &[1]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wire_example() {
        // S1: standard id 0x123, payload 11 22 33.
        let f = CanFrame::new(CanId::Standard(0x123), &[0x11, 0x22, 0x33]).unwrap();
        assert_eq!(f.encode_wire(), vec![0x03, 0x01, 0x23, 0x11, 0x22, 0x33]);
        assert_eq!(CanFrame::decode_wire(&f.encode_wire()).unwrap(), f);
    }

    #[test]
    fn wire_roundtrip_both_widths() {
        for id in [
            CanId::Standard(0),
            CanId::Standard(0x7ff),
            CanId::Extended(0),
            CanId::Extended(0x1fff_ffff),
            CanId::Extended(0x0434_5c5c),
        ] {
            for len in 0..=8usize {
                let data: Vec<u8> = (0..len as u8).map(|x| x.wrapping_mul(37)).collect();
                let f = CanFrame::new(id, &data).unwrap();
                let wire = f.encode_wire();
                assert_eq!(wire.len(), 1 + if id.is_extended() { 4 } else { 2 } + len);
                assert_eq!(CanFrame::decode_wire(&wire).unwrap(), f);
            }
        }
    }

    #[test]
    fn echo_bit_masked() {
        // Length byte 0x13 = echo flag + length 3.
        let wire = [0x13, 0x01, 0x23, 0x11, 0x22, 0x33];
        let f = CanFrame::decode_wire(&wire).unwrap();
        assert_eq!(f.data(), &[0x11, 0x22, 0x33]);
    }

    #[test]
    fn bad_wire_rejected() {
        assert!(CanFrame::decode_wire(&[]).is_err());
        assert!(CanFrame::decode_wire(&[0x00, 0x01]).is_err());
        // Three id bytes is not a thing.
        assert!(CanFrame::decode_wire(&[0x01, 0x01, 0x02, 0x03, 0xaa]).is_err());
        // Length over 8.
        assert!(CanFrame::decode_wire(&[0x09, 0x01, 0x23, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn timestamp_not_identity() {
        let a = CanFrame::new(CanId::Standard(1), &[0xaa]).unwrap();
        let b = a.clone().with_timestamp(Instant::now());
        assert_eq!(a, b);
    }
}
