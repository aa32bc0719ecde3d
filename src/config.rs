/* Semantic device state: the cached snapshot the façade owns, the value
 * enums shared by every protocol family, and the per-vendor capability
 * record. Fields a vendor does not support stay `None`; the capability
 * record is what tells a UI which widgets to render. */

use serde::{Deserialize, Serialize};

use crate::error::{MouseError, Result};
use crate::protocol::Vendor;

/* Sensor performance mode. Each vendor supports a subset, and for the
 * nordic family the allowed subset further depends on the polling rate. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerfMode {
    Low,
    Std,
    Hp,
    Sport,
    Oc,
}

impl PerfMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "std" => Ok(Self::Std),
            "hp" => Ok(Self::Hp),
            "sport" => Ok(Self::Sport),
            "oc" => Ok(Self::Oc),
            other => Err(MouseError::bad_param(
                "performanceMode",
                other,
                "expected one of low/std/hp/sport/oc",
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Std => "std",
            Self::Hp => "hp",
            Self::Sport => "sport",
            Self::Oc => "oc",
        }
    }
}

/* Lift-off detection height. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LodHeight {
    Low,
    Mid,
    High,
}

impl LodHeight {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "mid" => Ok(Self::Mid),
            "high" => Ok(Self::High),
            other => Err(MouseError::bad_param(
                "lodHeight",
                other,
                "expected one of low/mid/high",
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Mid => "mid",
            Self::High => "high",
        }
    }
}

/* Click debounce level. Levels pair with fixed millisecond values
 * (low=2ms, mid=5ms, high=10ms); both representations are stored so a
 * decode is never lossy. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebounceLevel {
    Low,
    Mid,
    High,
}

impl DebounceLevel {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "mid" => Ok(Self::Mid),
            "high" => Ok(Self::High),
            other => Err(MouseError::bad_param(
                "debounceLevel",
                other,
                "expected one of low/mid/high",
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Mid => "mid",
            Self::High => "high",
        }
    }

    pub fn to_ms(self) -> u32 {
        match self {
            Self::Low => 2,
            Self::Mid => 5,
            Self::High => 10,
        }
    }

    pub fn from_ms(ms: u32) -> Option<Self> {
        match ms {
            2 => Some(Self::Low),
            5 => Some(Self::Mid),
            10 => Some(Self::High),
            _ => None,
        }
    }
}

/* 24-bit RGB colour. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /* Parse `#rrggbb` or the shorthand `#rgb`. */
    pub fn from_hex(s: &str) -> Result<Self> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        let expand = |c: u8| (c << 4) | c;
        match hex.len() {
            6 => {
                let v = u32::from_str_radix(hex, 16)
                    .map_err(|_| MouseError::BadHex(s.to_string()))?;
                Ok(Self::new((v >> 16) as u8, (v >> 8) as u8, v as u8))
            }
            3 => {
                let v = u16::from_str_radix(hex, 16)
                    .map_err(|_| MouseError::BadHex(s.to_string()))?;
                Ok(Self::new(
                    expand(((v >> 8) & 0xF) as u8),
                    expand(((v >> 4) & 0xF) as u8),
                    expand((v & 0xF) as u8),
                ))
            }
            _ => Err(MouseError::BadHex(s.to_string())),
        }
    }

    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/* LED zone state. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedState {
    pub enabled: bool,
    /* Percent steps: 25 / 50 / 75 / 100 on pixart hardware. */
    pub brightness: u8,
    pub mode: u8,
    /* Semantic 0..=20; some registers store it inverted. */
    pub speed: u8,
    pub color: Rgb,
}

impl Default for LedState {
    fn default() -> Self {
        Self {
            enabled: true,
            brightness: 100,
            mode: 0,
            speed: 10,
            color: Rgb::new(0xFF, 0xFF, 0xFF),
        }
    }
}

/* One physical button's wire mapping. For keyboard entries `funckey`
 * carries the HID modifier bitset and `keycode` the base usage; other
 * categories use reserved funckey code bytes (see `crate::funckey`). */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonMapping {
    pub funckey: u8,
    pub keycode: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatteryState {
    pub percent: u8,
    pub charging: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub main: String,
    pub wireless: String,
}

/* Full cached configuration snapshot. Begins as the vendor default,
 * is mutated only by successful command execution or successful
 * input-report parsing, and is broadcast after every mutation. */
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MouseConfig {
    pub polling_hz: Option<u32>,
    pub performance_mode: Option<PerfMode>,
    pub lod: Option<LodHeight>,
    pub debounce_level: Option<DebounceLevel>,
    pub debounce_ms: Option<u32>,
    pub motion_sync: Option<bool>,
    pub linear_correction: Option<bool>,
    pub ripple_control: Option<bool>,
    pub glass_mode: Option<bool>,
    pub hyperclick: Option<bool>,
    pub burst_delay_ms: Option<u32>,
    pub sensor_angle: Option<i32>,
    pub sensor_feel: Option<i32>,
    pub sleep_seconds: Option<u32>,
    pub dpi_slot_count: Option<u8>,
    pub current_dpi_index: Option<u8>,
    pub dpi_slots_x: Option<Vec<u16>>,
    pub dpi_slots_y: Option<Vec<u16>>,
    pub buttons: Option<Vec<ButtonMapping>>,
    pub led: Option<LedState>,
    pub battery: Option<BatteryState>,
    pub firmware: Option<FirmwareInfo>,
    pub device_name: Option<String>,
}

impl MouseConfig {
    /* The LED record with defaults filled in, for single-field patches
     * against a device whose LED state has not been read yet. */
    pub fn led_or_default(&self) -> LedState {
        self.led.unwrap_or_default()
    }
}

/* Per-vendor capability record: the supported value sets a UI consumes
 * and the validators enforce. */
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub vendor: Vendor,
    pub polling_rates: &'static [u32],
    /* Empty when performance modes do not depend on the polling rate. */
    pub perf_modes_by_polling: &'static [(u32, &'static [PerfMode])],
    pub perf_modes: &'static [PerfMode],
    pub dpi_min: u16,
    pub dpi_max: u16,
    pub dpi_slot_max: u8,
    pub button_count: u8,
    /* Inclusive minute range for the sleep timeout, when supported. */
    pub sleep_minutes: Option<(u32, u32)>,
    pub led_modes: &'static [u8],
    pub separate_xy_dpi: bool,
    pub patch_keys: &'static [crate::patch::FeatureKey],
}

impl Capabilities {
    pub fn supports(&self, key: crate::patch::FeatureKey) -> bool {
        self.patch_keys.contains(&key)
    }

    /* Performance modes allowed at the given polling rate. Falls back to
     * the flat mode list when no per-rate table exists. */
    pub fn perf_modes_for(&self, hz: u32) -> &'static [PerfMode] {
        self.perf_modes_by_polling
            .iter()
            .find(|(rate, _)| *rate == hz)
            .map(|(_, modes)| *modes)
            .unwrap_or(self.perf_modes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_parse_long_form() {
        assert_eq!(Rgb::from_hex("#ff8800").unwrap(), Rgb::new(0xFF, 0x88, 0x00));
        assert_eq!(Rgb::from_hex("00ff00").unwrap(), Rgb::new(0, 0xFF, 0));
    }

    #[test]
    fn hex_parse_short_form() {
        assert_eq!(Rgb::from_hex("#f80").unwrap(), Rgb::new(0xFF, 0x88, 0x00));
    }

    #[test]
    fn hex_parse_rejects_garbage() {
        assert!(matches!(Rgb::from_hex("#zzz"), Err(MouseError::BadHex(_))));
        assert!(matches!(Rgb::from_hex("#12345"), Err(MouseError::BadHex(_))));
        assert!(matches!(Rgb::from_hex(""), Err(MouseError::BadHex(_))));
    }

    #[test]
    fn hex_roundtrip() {
        let c = Rgb::new(0x12, 0xAB, 0xEF);
        assert_eq!(Rgb::from_hex(&c.to_hex()).unwrap(), c);
    }

    #[test]
    fn debounce_level_ms_pairing() {
        assert_eq!(DebounceLevel::Low.to_ms(), 2);
        assert_eq!(DebounceLevel::Mid.to_ms(), 5);
        assert_eq!(DebounceLevel::High.to_ms(), 10);
        assert_eq!(DebounceLevel::from_ms(5), Some(DebounceLevel::Mid));
        assert_eq!(DebounceLevel::from_ms(7), None);
    }

    #[test]
    fn perf_mode_parse_is_case_insensitive() {
        assert_eq!(PerfMode::parse("HP").unwrap(), PerfMode::Hp);
        assert!(PerfMode::parse("turbo").is_err());
    }
}
