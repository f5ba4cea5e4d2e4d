/*! Command builders, one pure function per command shape.

Each builder produces the `message_data` byte and payload of a
[MessageType::Command] frame for one device family. No I/O, no
session handling, no state; inputs out of range are clamped, never
rejected. The device runtimes own the rest (session, sending,
timeouts).

Most families put everything in the payload and leave `message_data`
zero; the "type 2" relay and H-bridge variants instead put the whole
command in `message_data` and send an empty payload.
 */
use crate::message::{Address, Message, MessageType};
use crate::Result;

/// A built command: `message_data` plus payload, ready to be wrapped
/// into a point-to-point Command message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandPayload {
    /// Goes into the 29-bit id's low byte.
    pub message_data: u8,
    /// Up to eight payload bytes.
    pub payload: Vec<u8>,
}

impl CommandPayload {
    /// Wrap into a Command message from `source` to `target`.
    pub fn to_message(&self, source: Address, target: Address) -> Result<Message> {
        Message::p2p(
            MessageType::Command,
            source,
            target,
            self.message_data,
            &self.payload,
        )
    }
}

/// Dimmable light modes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum LightMode {
    /// Output off.
    Off = 0,
    /// On, at the commanded brightness.
    On = 1,
    /// Blinking between off and the commanded brightness.
    Blink = 2,
    /// Swelling (ramping) between off and the commanded brightness.
    Swell = 3,
    /// Restore the last state the device remembers.
    Restore = 127,
}

impl LightMode {
    /// Map a raw mode byte; anything unassigned reads as Off.
    pub fn from_raw(value: u8) -> Self {
        match value {
            1 => Self::On,
            2 => Self::Blink,
            3 => Self::Swell,
            127 => Self::Restore,
            _ => Self::Off,
        }
    }
}

/// RGB light modes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum RgbMode {
    /// Output off.
    Off = 0,
    /// Solid color.
    On = 1,
    /// Blinking the commanded color.
    Blink = 2,
    /// Jumping between three colors.
    Jump3 = 4,
    /// Jumping between seven colors.
    Jump7 = 5,
    /// Fading between three colors.
    Fade3 = 6,
    /// Fading between seven colors.
    Fade7 = 7,
    /// Rainbow sweep.
    Rainbow = 8,
    /// Restore the last state the device remembers.
    Restore = 127,
}

impl RgbMode {
    /// Map a raw mode byte; anything unassigned reads as Off.
    pub fn from_raw(value: u8) -> Self {
        match value {
            1 => Self::On,
            2 => Self::Blink,
            4 => Self::Jump3,
            5 => Self::Jump7,
            6 => Self::Fade3,
            7 => Self::Fade7,
            8 => Self::Rainbow,
            127 => Self::Restore,
            _ => Self::Off,
        }
    }

    /// The transition modes animate colors on their own; a commanded
    /// color triple is meaningless and gets zeroed.
    pub fn is_transition(&self) -> bool {
        matches!(
            self,
            Self::Jump3 | Self::Jump7 | Self::Fade3 | Self::Fade7 | Self::Rainbow
        )
    }
}

/// H-bridge drive direction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Both relays open.
    Stop,
    /// Forward relay closed.
    Forward,
    /// Reverse relay closed.
    Reverse,
}

/// HVAC zone operating mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum HvacMode {
    /// Zone off.
    Off = 0,
    /// Heating toward the high trip point.
    Heat = 1,
    /// Cooling toward the low trip point.
    Cool = 2,
    /// Heating and cooling between both trip points.
    Both = 3,
    /// Run the device-side schedule.
    RunSchedule = 4,
}

impl HvacMode {
    /// Map the low three command bits; anything unassigned reads as
    /// Off.
    pub fn from_raw(value: u8) -> Self {
        match value & 0x07 {
            1 => Self::Heat,
            2 => Self::Cool,
            3 => Self::Both,
            4 => Self::RunSchedule,
            _ => Self::Off,
        }
    }
}

/// HVAC heat source.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum HeatSource {
    /// Gas furnace.
    Gas = 0,
    /// Heat pump.
    HeatPump = 1,
    /// Whatever else the zone has.
    Other = 2,
}

impl HeatSource {
    /// Map the two source bits.
    pub fn from_raw(value: u8) -> Self {
        match value & 0x03 {
            1 => Self::HeatPump,
            0 => Self::Gas,
            _ => Self::Other,
        }
    }
}

/// HVAC fan mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FanMode {
    /// Fan follows the compressor.
    Auto = 0,
    /// Fan forced high.
    High = 1,
    /// Fan forced low.
    Low = 2,
}

impl FanMode {
    /// Map the two fan bits.
    pub fn from_raw(value: u8) -> Self {
        match value & 0x03 {
            1 => Self::High,
            2 => Self::Low,
            _ => Self::Auto,
        }
    }
}

/// Scale a 0..=100 percentage to the 0..=255 wire range.
pub(crate) fn scale_percent(pct: u8) -> u8 {
    (u16::from(pct.min(100)) * 255 / 100) as u8
}

/// The way back: 0..=255 wire value to 0..=100 percent.
pub(crate) fn unscale_percent(raw: u8) -> u8 {
    (u16::from(raw) * 100 / 255) as u8
}

/// Dimmable light command, 8-byte payload.
///
/// `brightness_pct` is 0..=100 and scaled to 0..=255 on the wire;
/// the cycle times drive the blink and swell modes.
#[must_use]
pub fn dimmer(
    mode: LightMode,
    brightness_pct: u8,
    auto_off_s: u8,
    cycle1_ms: u16,
    cycle2_ms: u16,
) -> CommandPayload {
    let mut payload = vec![mode as u8, scale_percent(brightness_pct), auto_off_s];
    payload.extend_from_slice(&cycle1_ms.to_be_bytes());
    payload.extend_from_slice(&cycle2_ms.to_be_bytes());
    payload.push(0);
    CommandPayload {
        message_data: 0,
        payload,
    }
}

/// Latching relay, type 1. One bit-packed byte: bit 7 always set
/// (latching), bit 6 clears a fault latch, bits 1..0 carry the
/// commanded state twice (disconnect state mirrors the target state).
/// OFF is 0x80, ON is 0x83.
#[must_use]
pub fn relay_type1(on: bool, clear_fault: bool) -> CommandPayload {
    let mut b = 0x80u8;
    if clear_fault {
        b |= 0x40;
    }
    if on {
        b |= 0x03;
    }
    CommandPayload {
        message_data: 0,
        payload: vec![b],
    }
}

/// Latching relay, type 2. The command rides in `message_data`
/// (0 off, 1 on); the payload is empty.
#[must_use]
pub fn relay_type2(on: bool) -> CommandPayload {
    CommandPayload {
        message_data: u8::from(on),
        payload: vec![],
    }
}

/// RGB light command, 8-byte payload, for every mode except blink.
///
/// Transition modes zero the color triple; the device animates on its
/// own there.
#[must_use]
pub fn rgb(
    mode: RgbMode,
    color: (u8, u8, u8),
    auto_off_s: u8,
    interval_ms: u16,
) -> CommandPayload {
    let (r, g, b) = if mode.is_transition() { (0, 0, 0) } else { color };
    let mut payload = vec![mode as u8, r, g, b, auto_off_s];
    payload.extend_from_slice(&interval_ms.to_be_bytes());
    payload.push(0);
    CommandPayload {
        message_data: 0,
        payload,
    }
}

/// RGB light blink command. Blink is the one mode where the interval
/// field splits into separate on and off intervals, one byte each.
#[must_use]
pub fn rgb_blink(
    color: (u8, u8, u8),
    auto_off_s: u8,
    on_interval: u8,
    off_interval: u8,
) -> CommandPayload {
    let (r, g, b) = color;
    CommandPayload {
        message_data: 0,
        payload: vec![
            RgbMode::Blink as u8,
            r,
            g,
            b,
            auto_off_s,
            on_interval,
            off_interval,
            0,
        ],
    }
}

/// H-bridge, type 1. One bit-packed byte: bit 0 forward relay, bit 2
/// reverse relay, bit 6 fault clear. Stop 0x00, forward 0x01,
/// reverse 0x04.
#[must_use]
pub fn hbridge_type1(direction: Direction, clear_fault: bool) -> CommandPayload {
    let mut b = match direction {
        Direction::Stop => 0x00u8,
        Direction::Forward => 0x01,
        Direction::Reverse => 0x04,
    };
    if clear_fault {
        b |= 0x40;
    }
    CommandPayload {
        message_data: 0,
        payload: vec![b],
    }
}

/// H-bridge, type 2. The command rides in `message_data`: 0 stop,
/// 1 forward, 2 reverse; the payload is empty.
#[must_use]
pub fn hbridge_type2(direction: Direction) -> CommandPayload {
    CommandPayload {
        message_data: match direction {
            Direction::Stop => 0,
            Direction::Forward => 1,
            Direction::Reverse => 2,
        },
        payload: vec![],
    }
}

/// H-bridge, type 2: clear the disabled latch.
#[must_use]
pub fn hbridge_type2_clear_latch() -> CommandPayload {
    CommandPayload {
        message_data: 3,
        payload: vec![],
    }
}

/// HVAC zone command, 3-byte payload: packed mode byte, then the low
/// and high trip points in whole °F.
///
/// Trip point *consistency* (heat wants `high >= low + 2`, and so on)
/// is the runtime's business; this only packs the bits.
#[must_use]
pub fn hvac(
    mode: HvacMode,
    source: HeatSource,
    fan: FanMode,
    low_trip_f: u8,
    high_trip_f: u8,
) -> CommandPayload {
    let b = (mode as u8 & 0x07) | (source as u8 & 0x03) << 4 | (fan as u8 & 0x03) << 6;
    CommandPayload {
        message_data: 0,
        payload: vec![b, low_trip_f, high_trip_f],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimmer_half_brightness() {
        // 50% scales to floor(50*255/100) = 127.
        let c = dimmer(LightMode::On, 50, 0, 0, 0);
        assert_eq!(c.message_data, 0);
        assert_eq!(c.payload, vec![0x01, 0x7f, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn percent_scaling_clamps() {
        assert_eq!(scale_percent(0), 0);
        assert_eq!(scale_percent(100), 255);
        assert_eq!(scale_percent(200), 255);
        assert_eq!(scale_percent(1), 2);
    }

    #[test]
    fn dimmer_cycle_times_big_endian() {
        let c = dimmer(LightMode::Blink, 100, 5, 0x1234, 0xabcd);
        assert_eq!(
            c.payload,
            vec![0x02, 0xff, 0x05, 0x12, 0x34, 0xab, 0xcd, 0x00]
        );
    }

    #[test]
    fn relay_type1_bits() {
        assert_eq!(relay_type1(false, false).payload, vec![0x80]);
        assert_eq!(relay_type1(true, false).payload, vec![0x83]);
        assert_eq!(relay_type1(true, true).payload, vec![0xc3]);
    }

    #[test]
    fn relay_type2_in_message_data() {
        assert_eq!(relay_type2(true).message_data, 1);
        assert_eq!(relay_type2(false).message_data, 0);
        assert!(relay_type2(true).payload.is_empty());
    }

    #[test]
    fn rgb_transition_zeroes_color() {
        let c = rgb(RgbMode::Rainbow, (10, 20, 30), 0, 500);
        assert_eq!(c.payload, vec![8, 0, 0, 0, 0, 0x01, 0xf4, 0]);
        let c = rgb(RgbMode::On, (10, 20, 30), 0, 500);
        assert_eq!(c.payload, vec![1, 10, 20, 30, 0, 0x01, 0xf4, 0]);
    }

    #[test]
    fn rgb_blink_split_intervals() {
        let c = rgb_blink((1, 2, 3), 9, 100, 200);
        assert_eq!(c.payload, vec![2, 1, 2, 3, 9, 100, 200, 0]);
    }

    #[test]
    fn hbridge_type1_bits() {
        assert_eq!(hbridge_type1(Direction::Stop, false).payload, vec![0x00]);
        assert_eq!(hbridge_type1(Direction::Forward, false).payload, vec![0x01]);
        assert_eq!(hbridge_type1(Direction::Reverse, false).payload, vec![0x04]);
        assert_eq!(hbridge_type1(Direction::Stop, true).payload, vec![0x40]);
    }

    #[test]
    fn hbridge_type2_in_message_data() {
        assert_eq!(hbridge_type2(Direction::Stop).message_data, 0);
        assert_eq!(hbridge_type2(Direction::Forward).message_data, 1);
        assert_eq!(hbridge_type2(Direction::Reverse).message_data, 2);
        assert_eq!(hbridge_type2_clear_latch().message_data, 3);
    }

    #[test]
    fn hvac_packing() {
        // Heat, heat pump, fan high, 70..75 °F.
        let c = hvac(HvacMode::Heat, HeatSource::HeatPump, FanMode::High, 70, 75);
        assert_eq!(c.payload, vec![0x51, 0x46, 0x4b]);
    }
}
