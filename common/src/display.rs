use serde::Serialize;

use crate::{
    config::{Color, Configuration},
    time::LocalTime,
};

/// What the LED fixture should show for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RenderInstruction {
    pub hour: u8,
    pub minute: u8,
    pub color: Color,
    #[serde(rename = "brightnessScale")]
    pub brightness_scale: f32,
    pub visible: bool,
}

impl RenderInstruction {
    /// Dark frame used while the time source has not synchronized.
    pub fn blank() -> Self {
        Self {
            hour: 0,
            minute: 0,
            color: Color::BLACK,
            brightness_scale: 0.0,
            visible: false,
        }
    }

    /// Color after brightness, or black when the frame is hidden.
    pub fn output_color(&self) -> Color {
        if self.visible {
            self.color.scaled(self.brightness_scale)
        } else {
            Color::BLACK
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkIndicator {
    NotConnected,
    Connected,
}

pub trait RenderSink {
    fn apply(&mut self, instruction: &RenderInstruction);

    fn indicate(&mut self, indicator: NetworkIndicator);
}

/// Pixel count of the LED ring; pixel 0 sits at twelve o'clock.
pub const RING_PIXELS: usize = 60;

const INDICATOR_NOT_CONNECTED: Color = Color {
    red: 64,
    green: 0,
    blue: 0,
};
const INDICATOR_CONNECTED: Color = Color {
    red: 0,
    green: 64,
    blue: 0,
};

/// Lays an instruction onto the ring: the minute pixel plus the hour pixel,
/// which advances one step every twelve minutes like an analog hour hand.
pub fn ring_frame(instruction: &RenderInstruction) -> [Color; RING_PIXELS] {
    let mut frame = [Color::BLACK; RING_PIXELS];
    if !instruction.visible {
        return frame;
    }

    let color = instruction.output_color();
    let minute = usize::from(instruction.minute) % RING_PIXELS;
    let hour = (usize::from(instruction.hour % 12) * 5 + minute / 12) % RING_PIXELS;
    frame[hour] = color;
    frame[minute] = color;
    frame
}

/// Lights the twelve hour marks in the indicator color.
pub fn indicator_frame(indicator: NetworkIndicator) -> [Color; RING_PIXELS] {
    let color = match indicator {
        NetworkIndicator::NotConnected => INDICATOR_NOT_CONNECTED,
        NetworkIndicator::Connected => INDICATOR_CONNECTED,
    };
    let mut frame = [Color::BLACK; RING_PIXELS];
    for pixel in frame.iter_mut().step_by(5) {
        *pixel = color;
    }
    frame
}

pub fn render(local: LocalTime, config: &Configuration) -> RenderInstruction {
    let Ok(minute) = u8::try_from(local.minute) else {
        return RenderInstruction::blank();
    };
    if local.hour > 23 || minute > 59 {
        return RenderInstruction::blank();
    }

    let mut instruction = RenderInstruction {
        hour: local.hour,
        minute,
        color: config.color,
        brightness_scale: 1.0,
        visible: true,
    };

    if config.night_off.active && config.night_off.contains(local.hour, minute) {
        instruction.visible = false;
        return instruction;
    }

    if config.dim.active {
        instruction.brightness_scale = config.dim.brightness();
    }

    instruction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Dim, NightOff};

    fn at(hour: u8, minute: i32) -> LocalTime {
        LocalTime { hour, minute }
    }

    fn night_config(off: (u8, u8), on: (u8, u8)) -> Configuration {
        Configuration {
            night_off: NightOff {
                active: true,
                off_hour: off.0,
                off_minute: off.1,
                on_hour: on.0,
                on_minute: on.1,
            },
            ..Configuration::default()
        }
    }

    #[test]
    fn default_config_renders_full_brightness() {
        let config = Configuration::default();
        let instruction = render(at(14, 5), &config);

        assert!(instruction.visible);
        assert_eq!(instruction.hour, 14);
        assert_eq!(instruction.minute, 5);
        assert_eq!(instruction.color, config.color);
        assert_eq!(instruction.brightness_scale, 1.0);
    }

    #[test]
    fn midnight_window_hides_display() {
        let config = night_config((22, 0), (6, 0));

        assert!(!render(at(23, 30), &config).visible);
        assert!(!render(at(22, 0), &config).visible);
        assert!(!render(at(3, 0), &config).visible);
        assert!(render(at(6, 0), &config).visible);
        assert!(render(at(21, 59), &config).visible);
    }

    #[test]
    fn daytime_window_boundaries() {
        let config = night_config((8, 0), (20, 0));

        assert!(!render(at(8, 0), &config).visible);
        assert!(!render(at(19, 59), &config).visible);
        assert!(render(at(20, 0), &config).visible);
        assert!(render(at(7, 59), &config).visible);
    }

    #[test]
    fn inactive_window_never_hides() {
        let mut config = night_config((0, 0), (23, 59));
        config.night_off.active = false;

        for hour in 0..24 {
            assert!(render(at(hour, 30), &config).visible);
        }
    }

    #[test]
    fn brightness_is_one_without_dimming() {
        let mut config = Configuration::default();
        config.dim = Dim {
            active: false,
            base: 1,
            scale: 255,
        };

        for hour in 0..24 {
            for minute in 0..60 {
                assert_eq!(render(at(hour, minute), &config).brightness_scale, 1.0);
            }
        }
    }

    #[test]
    fn dimming_applies_outside_night_window() {
        let mut config = night_config((22, 0), (6, 0));
        config.dim = Dim {
            active: true,
            base: 51,
            scale: 255,
        };

        let day = render(at(12, 0), &config);
        assert!(day.visible);
        assert_eq!(day.brightness_scale, 0.2);

        let night = render(at(23, 0), &config);
        assert!(!night.visible);
        assert_eq!(night.brightness_scale, 1.0);
    }

    #[test]
    fn out_of_range_minute_renders_blank() {
        let config = Configuration::default();

        assert_eq!(render(at(10, 60), &config), RenderInstruction::blank());
        assert_eq!(render(at(10, -1), &config), RenderInstruction::blank());
    }

    #[test]
    fn ring_frame_lights_hour_and_minute_pixels() {
        let instruction = RenderInstruction {
            hour: 15,
            minute: 40,
            color: Color {
                red: 10,
                green: 20,
                blue: 30,
            },
            brightness_scale: 1.0,
            visible: true,
        };
        let frame = ring_frame(&instruction);

        let lit: Vec<usize> = (0..RING_PIXELS)
            .filter(|&pixel| frame[pixel] != Color::BLACK)
            .collect();
        assert_eq!(lit, vec![18, 40]);
        assert_eq!(frame[40], instruction.color);
    }

    #[test]
    fn hidden_instruction_gives_dark_ring() {
        let frame = ring_frame(&RenderInstruction::blank());
        assert!(frame.iter().all(|pixel| *pixel == Color::BLACK));

        let mut hidden = render(at(12, 0), &Configuration::default());
        hidden.visible = false;
        assert!(ring_frame(&hidden).iter().all(|pixel| *pixel == Color::BLACK));
    }

    #[test]
    fn indicator_lights_hour_marks() {
        let frame = indicator_frame(NetworkIndicator::NotConnected);
        let lit = frame.iter().filter(|pixel| **pixel != Color::BLACK).count();

        assert_eq!(lit, 12);
        assert_eq!(frame[0], INDICATOR_NOT_CONNECTED);
        assert_eq!(frame[1], Color::BLACK);
        assert_eq!(indicator_frame(NetworkIndicator::Connected)[55], INDICATOR_CONNECTED);
    }

    #[test]
    fn output_color_follows_visibility_and_brightness() {
        let mut instruction = RenderInstruction {
            hour: 1,
            minute: 2,
            color: Color {
                red: 200,
                green: 100,
                blue: 0,
            },
            brightness_scale: 0.5,
            visible: true,
        };
        assert_eq!(
            instruction.output_color(),
            Color {
                red: 100,
                green: 50,
                blue: 0,
            }
        );

        instruction.visible = false;
        assert_eq!(instruction.output_color(), Color::BLACK);
    }
}
