/* Pure value conversions between semantic values and wire bytes.
 *
 * Every transformer here has a paired decoder so a round-trip through
 * the device is lossless for supported values. Vendor-specific lookup
 * tables (polling codes, register addresses) live with their protocol
 * module; this file carries the conversions shared across families. */

use serde_json::Value;

use crate::config::Rgb;
use crate::error::{MouseError, Result};
use crate::patch;

/* ------------------------------------------------------------------ */
/* Sensor angle: signed degrees, two's-complement 8-bit                */
/* ------------------------------------------------------------------ */

pub const SENSOR_ANGLE_MIN: i32 = -100;
pub const SENSOR_ANGLE_MAX: i32 = 100;

pub fn sensor_angle_to_wire(deg: i32) -> Result<u8> {
    if !(SENSOR_ANGLE_MIN..=SENSOR_ANGLE_MAX).contains(&deg) {
        return Err(MouseError::bad_param(
            "sensorAngle",
            deg,
            "expected -100..=100 degrees",
        ));
    }
    Ok(deg as i8 as u8)
}

pub fn sensor_angle_from_wire(byte: u8) -> i32 {
    i32::from(byte as i8)
}

/* ------------------------------------------------------------------ */
/* Sensor feel: custom packed 7-bit signed field                       */
/* ------------------------------------------------------------------ */

pub const SENSOR_FEEL_MIN: i32 = -62;
pub const SENSOR_FEEL_MAX: i32 = 65;

/* Negative values wrap into the upper half of the 7-bit space:
 * `f < 0 → (128 + f) & 0x7F`, so -62 packs to 66 and 65 packs to 65. */
pub fn sensor_feel_to_wire(feel: i32) -> Result<u8> {
    if !(SENSOR_FEEL_MIN..=SENSOR_FEEL_MAX).contains(&feel) {
        return Err(MouseError::bad_param(
            "sensorFeel",
            feel,
            "expected -62..=65",
        ));
    }
    if feel < 0 {
        Ok(((128 + feel) & 0x7F) as u8)
    } else {
        Ok((feel & 0x7F) as u8)
    }
}

pub fn sensor_feel_from_wire(byte: u8) -> i32 {
    let v = i32::from(byte & 0x7F);
    if v > SENSOR_FEEL_MAX {
        v - 128
    } else {
        v
    }
}

/* ------------------------------------------------------------------ */
/* LED registers                                                       */
/* ------------------------------------------------------------------ */

/* Brightness percent steps map to register codes 1..=4. */
pub fn led_brightness_to_wire(percent: u32) -> Result<u8> {
    match percent {
        25 => Ok(1),
        50 => Ok(2),
        75 => Ok(3),
        100 => Ok(4),
        _ => Err(MouseError::bad_param(
            "ledBrightness",
            percent,
            "expected one of 25/50/75/100",
        )),
    }
}

pub fn led_brightness_from_wire(code: u8) -> Option<u8> {
    match code {
        1 => Some(25),
        2 => Some(50),
        3 => Some(75),
        4 => Some(100),
        _ => None,
    }
}

/* The speed register is inverted: wire byte = 20 − semantic speed. */
pub fn led_speed_to_wire(speed: u32) -> Result<u8> {
    if speed > 20 {
        return Err(MouseError::bad_param("ledSpeed", speed, "expected 0..=20"));
    }
    Ok((20 - speed) as u8)
}

pub fn led_speed_from_wire(byte: u8) -> u8 {
    20u8.saturating_sub(byte)
}

/* Accepts `"#rrggbb"`, `"#rgb"`, `[r, g, b]` or `{r, g, b}`. */
pub fn led_color_from_value(v: &Value) -> Result<Rgb> {
    match v {
        Value::String(s) => Rgb::from_hex(s),
        Value::Array(arr) if arr.len() == 3 => {
            let byte = |item: &Value| {
                patch::as_u32("ledColor", item).and_then(|n| {
                    u8::try_from(n)
                        .map_err(|_| MouseError::bad_param("ledColor", n, "channel exceeds 255"))
                })
            };
            Ok(Rgb::new(byte(&arr[0])?, byte(&arr[1])?, byte(&arr[2])?))
        }
        Value::Object(map) => {
            let channel = |name: &str| {
                map.get(name)
                    .ok_or_else(|| {
                        MouseError::bad_param("ledColor", v, format!("missing channel {name}"))
                    })
                    .and_then(|item| patch::as_u32("ledColor", item))
                    .and_then(|n| {
                        u8::try_from(n).map_err(|_| {
                            MouseError::bad_param("ledColor", n, "channel exceeds 255")
                        })
                    })
            };
            Ok(Rgb::new(channel("r")?, channel("g")?, channel("b")?))
        }
        _ => Err(MouseError::BadHex(v.to_string())),
    }
}

/* ------------------------------------------------------------------ */
/* DPI values                                                          */
/* ------------------------------------------------------------------ */

pub fn clamp_dpi(value: u16, min: u16, max: u16) -> u16 {
    value.clamp(min, max)
}

pub fn dpi_to_le(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

pub fn dpi_from_le(lo: u8, hi: u8) -> u16 {
    u16::from_le_bytes([lo, hi])
}

/* Pixart packs a DPI table index together with the slot number:
 * high byte `((index >> 8) & 0x1F) | ((slot & 0x07) << 5)`, then the
 * low byte of the index. */
pub fn dpi_index_packed(slot: u8, index: u16) -> [u8; 2] {
    let hi = (((index >> 8) & 0x1F) as u8) | ((slot & 0x07) << 5);
    [hi, (index & 0xFF) as u8]
}

pub fn dpi_index_unpacked(hi: u8, lo: u8) -> (u8, u16) {
    let slot = (hi >> 5) & 0x07;
    let index = (u16::from(hi & 0x1F) << 8) | u16::from(lo);
    (slot, index)
}

/* ------------------------------------------------------------------ */
/* Debounce: string level, integer level, or milliseconds              */
/* ------------------------------------------------------------------ */

use crate::config::DebounceLevel;

/* Accepts `"low"`, level index 0..=2, or one of the paired millisecond
 * values. Returns the level; the planner always stores both forms. */
pub fn debounce_from_value(v: &Value) -> Result<DebounceLevel> {
    match v {
        Value::String(s) => DebounceLevel::parse(s),
        Value::Number(_) => {
            let n = patch::as_u32("debounce", v)?;
            match n {
                0 => Ok(DebounceLevel::Low),
                1 => Ok(DebounceLevel::Mid),
                2 => Ok(DebounceLevel::High),
                ms => DebounceLevel::from_ms(ms).ok_or_else(|| {
                    MouseError::bad_param(
                        "debounce",
                        ms,
                        "expected level 0..=2 or one of 2/5/10 ms",
                    )
                }),
            }
        }
        _ => Err(MouseError::bad_param(
            "debounce",
            v,
            "expected a level name, level index or milliseconds",
        )),
    }
}
