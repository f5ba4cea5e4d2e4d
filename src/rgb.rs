/*! RGB light runtime.

Hosts think in HSB, the bus thinks in RGB triples, and the device
additionally has a pile of animation modes. The cache keeps the last
commanded color so mode and speed changes re-send something sensible.

Status traffic in the animation modes changes color constantly; those
color values go into the cache but are not surfaced to the host, or
every rainbow tick would spam whatever sits downstream.
 */
use std::sync::Mutex;
use std::time::Duration;

use crate::command::{self, RgbMode};
use crate::device::{DeviceCommand, Runtime, StateUpdate};
use crate::{Error, Result};

/// Standard HSV to RGB. Hue in degrees (wraps), saturation and value
/// clamped to 0..=1.
pub(crate) fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> (u8, u8, u8) {
    let h = hue.rem_euclid(360.0);
    let s = saturation.clamp(0.0, 1.0);
    let v = value.clamp(0.0, 1.0);

    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match h {
        h if h < 60.0 => (c, x, 0.0),
        h if h < 120.0 => (x, c, 0.0),
        h if h < 180.0 => (0.0, c, x),
        h if h < 240.0 => (0.0, x, c),
        h if h < 300.0 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    (
        ((r + m) * 255.0).round() as u8,
        ((g + m) * 255.0).round() as u8,
        ((b + m) * 255.0).round() as u8,
    )
}

struct State {
    mode: RgbMode,
    color: (u8, u8, u8),
    auto_off_s: u8,
    interval_ms: u16,
    blink_on: u8,
    blink_off: u8,
}

/// Runtime for one RGB light.
pub struct RgbLight {
    rt: Runtime,
    state: Mutex<State>,
}

impl RgbLight {
    pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

    pub(crate) fn new(rt: Runtime) -> Self {
        Self {
            rt,
            state: Mutex::new(State {
                mode: RgbMode::Off,
                color: (255, 255, 255),
                auto_off_s: 0,
                interval_ms: 500,
                blink_on: 100,
                blink_off: 100,
            }),
        }
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.rt
    }

    /// Translate one channel command, then send the merged state.
    pub fn handle_command(&self, command: &DeviceCommand) -> Result<()> {
        let payload = {
            let mut st = self.state.lock().unwrap();
            match command {
                DeviceCommand::Power(true) => st.mode = RgbMode::On,
                DeviceCommand::Power(false) => st.mode = RgbMode::Off,
                DeviceCommand::Color {
                    hue,
                    saturation,
                    brightness,
                } => {
                    st.color = hsv_to_rgb(*hue, *saturation, *brightness);
                    st.mode = RgbMode::On;
                }
                DeviceCommand::RgbMode(mode) => st.mode = *mode,
                DeviceCommand::Speed(ms) => {
                    st.interval_ms = *ms;
                    let split = (*ms).min(255) as u8;
                    st.blink_on = split;
                    st.blink_off = split;
                }
                DeviceCommand::Sleep(secs) => st.auto_off_s = *secs,
                other => {
                    return Err(Error::Command(format!(
                        "rgb light has no {other:?} channel"
                    )));
                }
            }
            if st.mode == RgbMode::Blink {
                command::rgb_blink(st.color, st.auto_off_s, st.blink_on, st.blink_off)
            } else {
                command::rgb(st.mode, st.color, st.auto_off_s, st.interval_ms)
            }
        };
        self.rt.send_command(&payload)
    }

    /// Parse a DeviceStatus payload and surface changes.
    ///
    /// Statuses run one to seven meaningful bytes; a trailing eighth
    /// byte, when present, carries nothing and is ignored.
    pub fn handle_status(&self, payload: &[u8]) {
        let Some(&mode_raw) = payload.first() else {
            return;
        };
        let mode = RgbMode::from_raw(mode_raw);
        let mut st = self.state.lock().unwrap();
        st.mode = mode;
        let mut color = None;
        if payload.len() >= 4 {
            st.color = (payload[1], payload[2], payload[3]);
            color = Some(st.color);
        }
        if payload.len() >= 5 {
            st.auto_off_s = payload[4];
        }
        if payload.len() >= 7 {
            if mode == RgbMode::Blink {
                st.blink_on = payload[5];
                st.blink_off = payload[6];
            } else {
                st.interval_ms = u16::from_be_bytes([payload[5], payload[6]]);
            }
        }
        drop(st);

        self.rt.emit(StateUpdate::Power(mode != RgbMode::Off));
        self.rt.emit(StateUpdate::RgbMode(mode));
        // Transition modes cycle colors on their own; surfacing every
        // tick would flood the host, so only on/off modes emit color.
        if matches!(mode, RgbMode::Off | RgbMode::On) {
            if let Some((r, g, b)) = color {
                self.rt.emit(StateUpdate::Color { r, g, b });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Update;
    use crate::device::test_support::{harness, sent_command};

    #[test]
    fn hsv_corners() {
        assert_eq!(hsv_to_rgb(0.0, 0.0, 1.0), (255, 255, 255));
        assert_eq!(hsv_to_rgb(0.0, 1.0, 1.0), (255, 0, 0));
        assert_eq!(hsv_to_rgb(120.0, 1.0, 1.0), (0, 255, 0));
        assert_eq!(hsv_to_rgb(240.0, 1.0, 1.0), (0, 0, 255));
        assert_eq!(hsv_to_rgb(60.0, 1.0, 1.0), (255, 255, 0));
        assert_eq!(hsv_to_rgb(0.0, 0.0, 0.0), (0, 0, 0));
        // Hue wraps.
        assert_eq!(hsv_to_rgb(360.0, 1.0, 1.0), hsv_to_rgb(0.0, 1.0, 1.0));
    }

    #[test]
    fn color_command_sends_rgb() {
        let (rt, sent, _updates) = harness(1, 93);
        let light = RgbLight::new(rt);
        light
            .handle_command(&DeviceCommand::Color {
                hue: 120.0,
                saturation: 1.0,
                brightness: 1.0,
            })
            .unwrap();
        let cmd = sent_command(&sent);
        assert_eq!(cmd.payload()[..4], [1, 0, 255, 0]);
    }

    #[test]
    fn blink_splits_interval() {
        let (rt, sent, _updates) = harness(1, 93);
        let light = RgbLight::new(rt);
        light.handle_command(&DeviceCommand::Speed(80)).unwrap();
        let _ = sent_command(&sent);
        light
            .handle_command(&DeviceCommand::RgbMode(RgbMode::Blink))
            .unwrap();
        let cmd = sent_command(&sent);
        assert_eq!(cmd.payload()[0], 2);
        assert_eq!(cmd.payload()[5], 80);
        assert_eq!(cmd.payload()[6], 80);
    }

    #[test]
    fn transition_mode_does_not_emit_color() {
        let (rt, _sent, updates) = harness(1, 93);
        let light = RgbLight::new(rt);
        light.handle_status(&[8, 10, 20, 30, 0, 1, 0]);
        let got: Vec<Update> = updates.lock().unwrap().drain(..).collect();
        assert!(got.iter().any(|u| u.update == StateUpdate::RgbMode(RgbMode::Rainbow)));
        assert!(!got.iter().any(|u| matches!(u.update, StateUpdate::Color { .. })));
        // But the cache did take the color.
        assert_eq!(light.state.lock().unwrap().color, (10, 20, 30));
    }

    #[test]
    fn on_mode_emits_color() {
        let (rt, _sent, updates) = harness(1, 93);
        let light = RgbLight::new(rt);
        light.handle_status(&[1, 10, 20, 30, 0, 1, 0, 0xaa]);
        let got: Vec<Update> = updates.lock().unwrap().drain(..).collect();
        assert!(
            got.iter()
                .any(|u| u.update == StateUpdate::Color { r: 10, g: 20, b: 30 })
        );
    }
}
