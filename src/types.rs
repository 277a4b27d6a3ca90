// Shared types module - Colours and lamp state sent to the bridge

use serde::{Deserialize, Serialize};

use crate::error::{HueError, HueResult};

/// Default fade time in bridge units (multiples of 100ms)
pub const DEFAULT_TRANSITION_TIME: u16 = 5;

// D65 white point, used when a colour has no chromaticity (black)
const WHITE_POINT_XY: [f64; 2] = [0.3127, 0.3290];

// RGB color representation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn from_hex(hex: &str) -> HueResult<Self> {
        let digits = hex.trim().trim_start_matches('#');
        if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HueError::InvalidColour(hex.to_string()));
        }
        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&digits[range], 16).map_err(|_| HueError::InvalidColour(hex.to_string()))
        };
        Ok(Rgb {
            r: channel(0..2)?,
            g: channel(2..4)?,
            b: channel(4..6)?,
        })
    }

    /// Parse any CSS colour notation ("#33FF36", "33FF36", "red", "rgb(10,20,30)")
    pub fn parse(colour: &str) -> HueResult<Self> {
        let trimmed = colour.trim();
        if let Ok(rgb) = Self::from_hex(trimmed) {
            return Ok(rgb);
        }
        let parsed = colorgrad::Color::from_html(trimmed)
            .map_err(|_| HueError::InvalidColour(colour.to_string()))?;
        let [r, g, b, _] = parsed.to_rgba8();
        Ok(Rgb { r, g, b })
    }

    /// CIE 1931 xy chromaticity of this sRGB colour (D65)
    pub fn to_xy(&self) -> [f64; 2] {
        fn linear(channel: u8) -> f64 {
            let c = channel as f64 / 255.0;
            if c <= 0.04045 {
                c / 12.92
            } else {
                ((c + 0.055) / 1.055).powf(2.4)
            }
        }

        let (r, g, b) = (linear(self.r), linear(self.g), linear(self.b));
        let x = r * 0.4124564 + g * 0.3575761 + b * 0.1804375;
        let y = r * 0.2126729 + g * 0.7151522 + b * 0.0721750;
        let z = r * 0.0193339 + g * 0.1191920 + b * 0.9503041;

        let sum = x + y + z;
        if sum <= f64::EPSILON {
            return WHITE_POINT_XY;
        }
        [x / sum, y / sum]
    }
}

/// Body of a Hue `state` (light) or `action` (group) request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightState {
    pub on: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bri: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xy: Option<[f64; 2]>,
    pub transitiontime: u16,
}

impl LightState {
    /// Switch on at `bri`, tinted with `colour` when it parses
    pub fn on(colour: Option<&str>, bri: u8) -> Self {
        let xy = colour
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .and_then(|c| match Rgb::parse(c) {
                Ok(rgb) => Some(rgb.to_xy()),
                Err(e) => {
                    log::warn!("Ignoring colour: {}", e);
                    None
                }
            });
        LightState {
            on: true,
            bri: Some(bri),
            xy,
            transitiontime: DEFAULT_TRANSITION_TIME,
        }
    }

    pub fn off() -> Self {
        LightState {
            on: false,
            bri: None,
            xy: None,
            transitiontime: DEFAULT_TRANSITION_TIME,
        }
    }
}

/// The lamp (single light or group) a state is applied to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LampTarget {
    pub address: String,
    pub username: String,
    pub lamp_id: String,
    pub is_group: bool,
}
