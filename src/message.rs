/*! Typed IDS-CAN messages and their CAN id bit layout.

Two message shapes ride the bus. Broadcasts (status, ids, time) use
11-bit identifiers packing the type and the sender; point-to-point
traffic (requests, responses, commands) uses 29-bit identifiers that
additionally carry the target and a one byte `message_data` field,
which doubles as a sub-opcode for some device families.

Encoding and decoding here is pure bit shuffling over
[crate::frame::CanFrame]; no I/O, no state.
 */
use std::fmt;

use crate::frame::{CanFrame, CanId};
use crate::{Error, Result};

/// A node address on the bus.
///
/// One byte; 0 is the broadcast address and never a valid target. The
/// controller itself occupies one of these (conventionally 1).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Address(u8);

impl Address {
    /// The broadcast address.
    pub const BROADCAST: Address = Address(0);

    /// Wrap a raw address byte.
    pub fn new(value: u8) -> Self {
        Self(value)
    }

    /// The raw byte.
    pub fn value(&self) -> u8 {
        self.0
    }

    /// True for the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        self.0 == 0
    }
}

impl From<u8> for Address {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of message types.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum MessageType {
    /// Bus-wide network state broadcast.
    Network = 0,
    /// Circuit id broadcast.
    CircuitId = 1,
    /// Device id broadcast.
    DeviceId = 2,
    /// Device status broadcast; the main inbound state feed.
    DeviceStatus = 3,
    /// Product status broadcast.
    ProductStatus = 6,
    /// Time broadcast.
    Time = 7,
    /// Point-to-point request (sessions live on these).
    Request = 128,
    /// Point-to-point response.
    Response = 129,
    /// Point-to-point device command.
    Command = 130,
    /// Point-to-point extended status.
    ExtStatus = 131,
    /// Point-to-point text console traffic.
    TextConsole = 132,
}

impl MessageType {
    /// Map a raw type value back to the enum.
    pub fn from_raw(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Network,
            1 => Self::CircuitId,
            2 => Self::DeviceId,
            3 => Self::DeviceStatus,
            6 => Self::ProductStatus,
            7 => Self::Time,
            128 => Self::Request,
            129 => Self::Response,
            130 => Self::Command,
            131 => Self::ExtStatus,
            132 => Self::TextConsole,
            _ => return None,
        })
    }

    /// True for the point-to-point types (29-bit ids).
    pub fn is_p2p(&self) -> bool {
        (*self as u8) & 0x80 != 0
    }
}

/// One application message, broadcast or point-to-point.
///
/// The two shapes are kept as separate variants so a broadcast can
/// never carry a target or `message_data`, and point-to-point always
/// does.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    /// Broadcast, on an 11-bit id.
    Broadcast {
        /// One of the broadcast types.
        msg_type: MessageType,
        /// Sending node.
        source: Address,
        /// Up to eight payload bytes.
        payload: Vec<u8>,
    },
    /// Point-to-point, on a 29-bit id.
    PointToPoint {
        /// One of the point-to-point types.
        msg_type: MessageType,
        /// Sending node.
        source: Address,
        /// Addressed node; never broadcast.
        target: Address,
        /// Sub-opcode / session opcode byte from the id.
        message_data: u8,
        /// Up to eight payload bytes.
        payload: Vec<u8>,
    },
}

impl Message {
    /// Build a broadcast message. Rejects point-to-point types and
    /// oversized payloads.
    pub fn broadcast(msg_type: MessageType, source: Address, payload: &[u8]) -> Result<Self> {
        if msg_type.is_p2p() {
            return Err(Error::Protocol(format!("{msg_type:?} is not a broadcast type")));
        }
        if payload.len() > 8 {
            return Err(Error::Protocol(format!("payload of {} bytes", payload.len())));
        }
        Ok(Self::Broadcast {
            msg_type,
            source,
            payload: payload.to_vec(),
        })
    }

    /// Build a point-to-point message. Rejects broadcast types, the
    /// broadcast address as target, and oversized payloads.
    pub fn p2p(
        msg_type: MessageType,
        source: Address,
        target: Address,
        message_data: u8,
        payload: &[u8],
    ) -> Result<Self> {
        if !msg_type.is_p2p() {
            return Err(Error::Protocol(format!("{msg_type:?} is not point-to-point")));
        }
        if target.is_broadcast() {
            return Err(Error::Protocol("broadcast is not a valid target".into()));
        }
        if payload.len() > 8 {
            return Err(Error::Protocol(format!("payload of {} bytes", payload.len())));
        }
        Ok(Self::PointToPoint {
            msg_type,
            source,
            target,
            message_data,
            payload: payload.to_vec(),
        })
    }

    /// The message type.
    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::Broadcast { msg_type, .. } | Self::PointToPoint { msg_type, .. } => *msg_type,
        }
    }

    /// The sending node.
    pub fn source(&self) -> Address {
        match self {
            Self::Broadcast { source, .. } | Self::PointToPoint { source, .. } => *source,
        }
    }

    /// The addressed node; None for broadcasts.
    pub fn target(&self) -> Option<Address> {
        match self {
            Self::Broadcast { .. } => None,
            Self::PointToPoint { target, .. } => Some(*target),
        }
    }

    /// The `message_data` byte; None for broadcasts.
    pub fn message_data(&self) -> Option<u8> {
        match self {
            Self::Broadcast { .. } => None,
            Self::PointToPoint { message_data, .. } => Some(*message_data),
        }
    }

    /// The payload bytes.
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Broadcast { payload, .. } | Self::PointToPoint { payload, .. } => payload,
        }
    }

    /// Pack into a CAN frame.
    ///
    /// Broadcast ids are `type[2:0] << 8 | source`; point-to-point
    /// ids spread `type - 0x80` over bits 28..26 and 17..16 with the
    /// source, target, and `message_data` in between. The layout must
    /// stay bit-exact with the devices on the bus.
    #[must_use]
    pub fn to_frame(&self) -> CanFrame {
        match self {
            Self::Broadcast {
                msg_type,
                source,
                payload,
            } => {
                let ty = u16::from(*msg_type as u8);
                let id = (ty & 0x07) << 8 | u16::from(source.value());
                // Constructors bounded the payload, and the id is 11
                // bits by construction.
                CanFrame::new(CanId::Standard(id), payload).expect("checked at construction")
            }
            Self::PointToPoint {
                msg_type,
                source,
                target,
                message_data,
                payload,
            } => {
                let t = u32::from((*msg_type as u8) - 0x80);
                let id = (t >> 2) << 26
                    | u32::from(source.value()) << 18
                    | (t & 0x03) << 16
                    | u32::from(target.value()) << 8
                    | u32::from(*message_data);
                CanFrame::new(CanId::Extended(id), payload).expect("checked at construction")
            }
        }
    }

    /// Unpack from a CAN frame.
    pub fn from_frame(frame: &CanFrame) -> Result<Self> {
        match frame.id() {
            CanId::Standard(id) => {
                let ty = ((id >> 8) & 0x07) as u8;
                let msg_type = MessageType::from_raw(ty)
                    .ok_or_else(|| Error::Protocol(format!("broadcast type {ty}")))?;
                Self::broadcast(msg_type, Address::new((id & 0xff) as u8), frame.data())
            }
            CanId::Extended(id) => {
                let t = (((id >> 26) & 0x07) << 2 | (id >> 16) & 0x03) as u8;
                let msg_type = MessageType::from_raw(0x80 + t)
                    .ok_or_else(|| Error::Protocol(format!("p2p type {}", 0x80 + u16::from(t))))?;
                Self::p2p(
                    msg_type,
                    Address::new(((id >> 18) & 0xff) as u8),
                    Address::new(((id >> 8) & 0xff) as u8),
                    (id & 0xff) as u8,
                    frame.data(),
                )
            }
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast {
                msg_type,
                source,
                payload,
            } => write!(f, "{msg_type:?} from {source} {payload:02X?}"),
            Self::PointToPoint {
                msg_type,
                source,
                target,
                message_data,
                payload,
            } => write!(
                f,
                "{msg_type:?} {source}->{target} md={message_data} {payload:02X?}"
            ),
        }
    }
}
