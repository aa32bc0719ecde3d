/* Patches and semantic feature keys.
 *
 * A `Patch` is the UI-facing partial desired state: string keys, JSON
 * values. The planner normalises it through the alias tables into a
 * `ChangeSet` keyed by the closed `FeatureKey` enum; unknown keys fail
 * with `FeatureUnsupported` before any hardware I/O happens. */

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{MouseError, Result};

/* Every semantic field the engine knows how to plan. Per-vendor support
 * is declared by `Capabilities::patch_keys`. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureKey {
    PollingHz,
    PerformanceMode,
    LodHeight,
    DebounceLevel,
    DebounceMs,
    MotionSync,
    LinearCorrection,
    RippleControl,
    GlassMode,
    Hyperclick,
    BurstDelayMs,
    SensorAngle,
    SensorFeel,
    SleepSeconds,
    DpiSlotCount,
    CurrentDpiIndex,
    DpiSlotsX,
    DpiSlotsY,
    /* Single-slot write sugar: `{slot, dpi, select?}`. */
    DpiSlot,
    ButtonMappings,
    /* Single-button write sugar: `{slot, label}` or `{slot, funckey, keycode}`. */
    ButtonMapping,
    LedEnabled,
    LedBrightness,
    LedMode,
    LedSpeed,
    LedColor,
    /* Virtual trigger raised by the planner whenever any DPI-table field
     * changes; never accepted from a user patch. */
    DpiProfile,
}

impl FeatureKey {
    pub fn name(self) -> &'static str {
        match self {
            Self::PollingHz => "pollingHz",
            Self::PerformanceMode => "performanceMode",
            Self::LodHeight => "lodHeight",
            Self::DebounceLevel => "debounceLevel",
            Self::DebounceMs => "debounceMs",
            Self::MotionSync => "motionSync",
            Self::LinearCorrection => "linearCorrection",
            Self::RippleControl => "rippleControl",
            Self::GlassMode => "glassMode",
            Self::Hyperclick => "hyperclick",
            Self::BurstDelayMs => "burstDelayMs",
            Self::SensorAngle => "sensorAngle",
            Self::SensorFeel => "sensorFeel",
            Self::SleepSeconds => "sleepSeconds",
            Self::DpiSlotCount => "dpiSlotCount",
            Self::CurrentDpiIndex => "currentDpiIndex",
            Self::DpiSlotsX => "dpiSlotsX",
            Self::DpiSlotsY => "dpiSlotsY",
            Self::DpiSlot => "dpiSlot",
            Self::ButtonMappings => "buttonMappings",
            Self::ButtonMapping => "buttonMapping",
            Self::LedEnabled => "ledEnabled",
            Self::LedBrightness => "ledBrightness",
            Self::LedMode => "ledMode",
            Self::LedSpeed => "ledSpeed",
            Self::LedColor => "ledColor",
            Self::DpiProfile => "dpiProfile",
        }
    }
}

/* Global alias table applied before any vendor-specific aliases. */
const ALIASES: &[(&str, FeatureKey)] = &[
    ("pollingHz", FeatureKey::PollingHz),
    ("polling_rate", FeatureKey::PollingHz),
    ("pollingRate", FeatureKey::PollingHz),
    ("polling", FeatureKey::PollingHz),
    ("performanceMode", FeatureKey::PerformanceMode),
    ("performance_mode", FeatureKey::PerformanceMode),
    ("perf_mode", FeatureKey::PerformanceMode),
    ("lodHeight", FeatureKey::LodHeight),
    ("lod_height", FeatureKey::LodHeight),
    ("lod", FeatureKey::LodHeight),
    ("debounceLevel", FeatureKey::DebounceLevel),
    ("debounce_level", FeatureKey::DebounceLevel),
    ("debounceMs", FeatureKey::DebounceMs),
    ("debounce_ms", FeatureKey::DebounceMs),
    ("debounce_time", FeatureKey::DebounceMs),
    ("motionSync", FeatureKey::MotionSync),
    ("motion_sync", FeatureKey::MotionSync),
    ("linearCorrection", FeatureKey::LinearCorrection),
    ("linear_correction", FeatureKey::LinearCorrection),
    ("rippleControl", FeatureKey::RippleControl),
    ("ripple_control", FeatureKey::RippleControl),
    ("glassMode", FeatureKey::GlassMode),
    ("glass_mode", FeatureKey::GlassMode),
    ("hyperclick", FeatureKey::Hyperclick),
    ("burstDelayMs", FeatureKey::BurstDelayMs),
    ("burst_delay_ms", FeatureKey::BurstDelayMs),
    ("sensorAngle", FeatureKey::SensorAngle),
    ("sensor_angle", FeatureKey::SensorAngle),
    ("sensorFeel", FeatureKey::SensorFeel),
    ("sensor_feel", FeatureKey::SensorFeel),
    ("sleepSeconds", FeatureKey::SleepSeconds),
    ("sleep_seconds", FeatureKey::SleepSeconds),
    ("sleep_time", FeatureKey::SleepSeconds),
    ("dpiSlotCount", FeatureKey::DpiSlotCount),
    ("dpi_slot_count", FeatureKey::DpiSlotCount),
    ("currentDpiIndex", FeatureKey::CurrentDpiIndex),
    ("current_dpi_index", FeatureKey::CurrentDpiIndex),
    ("defaultDpiSlotIndex", FeatureKey::CurrentDpiIndex),
    ("dpiSlotsX", FeatureKey::DpiSlotsX),
    ("dpi_slots_x", FeatureKey::DpiSlotsX),
    ("dpiSlots", FeatureKey::DpiSlotsX),
    ("dpi_slots", FeatureKey::DpiSlotsX),
    ("dpiSlotsY", FeatureKey::DpiSlotsY),
    ("dpi_slots_y", FeatureKey::DpiSlotsY),
    ("dpiSlot", FeatureKey::DpiSlot),
    ("dpi_slot", FeatureKey::DpiSlot),
    ("buttonMappings", FeatureKey::ButtonMappings),
    ("button_mappings", FeatureKey::ButtonMappings),
    ("buttons", FeatureKey::ButtonMappings),
    ("buttonMapping", FeatureKey::ButtonMapping),
    ("button_mapping", FeatureKey::ButtonMapping),
    ("ledEnabled", FeatureKey::LedEnabled),
    ("led_enabled", FeatureKey::LedEnabled),
    ("ledBrightness", FeatureKey::LedBrightness),
    ("led_brightness", FeatureKey::LedBrightness),
    ("ledMode", FeatureKey::LedMode),
    ("led_mode", FeatureKey::LedMode),
    ("ledSpeed", FeatureKey::LedSpeed),
    ("led_speed", FeatureKey::LedSpeed),
    ("ledColor", FeatureKey::LedColor),
    ("led_color", FeatureKey::LedColor),
    ("rgb", FeatureKey::LedColor),
];

/* Resolve a raw patch key through the global alias table, then through
 * the vendor's extra aliases. */
pub fn resolve_key(raw: &str, vendor_aliases: &[(&str, FeatureKey)]) -> Option<FeatureKey> {
    ALIASES
        .iter()
        .chain(vendor_aliases.iter())
        .find(|(alias, _)| *alias == raw)
        .map(|(_, key)| *key)
}

/* Desired changes as supplied by the caller. */
#[derive(Debug, Clone, Default)]
pub struct Patch {
    entries: BTreeMap<String, Value>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /* Builder-style insert. */
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/* Normalised changes keyed by `FeatureKey`; what the planner and the
 * vendor expansion hooks actually operate on. */
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    map: BTreeMap<FeatureKey, Value>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: FeatureKey) -> Option<&Value> {
        self.map.get(&key)
    }

    pub fn set(&mut self, key: FeatureKey, value: Value) {
        self.map.insert(key, value);
    }

    pub fn remove(&mut self, key: FeatureKey) -> Option<Value> {
        self.map.remove(&key)
    }

    pub fn contains(&self, key: FeatureKey) -> bool {
        self.map.contains_key(&key)
    }

    pub fn contains_any(&self, keys: &[FeatureKey]) -> bool {
        keys.iter().any(|k| self.contains(*k))
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = FeatureKey> + '_ {
        self.map.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FeatureKey, &Value)> {
        self.map.iter().map(|(k, v)| (*k, v))
    }

    /* Typed getters: absent keys are `Ok(None)`, wrong-typed values are
     * `BadParam` naming the field. */

    pub fn u32_of(&self, key: FeatureKey) -> Result<Option<u32>> {
        match self.map.get(&key) {
            None => Ok(None),
            Some(v) => Ok(Some(as_u32(key.name(), v)?)),
        }
    }

    pub fn i32_of(&self, key: FeatureKey) -> Result<Option<i32>> {
        match self.map.get(&key) {
            None => Ok(None),
            Some(v) => Ok(Some(as_i32(key.name(), v)?)),
        }
    }

    pub fn bool_of(&self, key: FeatureKey) -> Result<Option<bool>> {
        match self.map.get(&key) {
            None => Ok(None),
            Some(v) => Ok(Some(as_bool(key.name(), v)?)),
        }
    }

    pub fn str_of(&self, key: FeatureKey) -> Result<Option<&str>> {
        match self.map.get(&key) {
            None => Ok(None),
            Some(v) => Ok(Some(as_str(key.name(), v)?)),
        }
    }
}

/* Value coercion helpers shared by the change set and the vendor
 * encoders. Numbers arriving as strings are accepted, matching what a
 * UI form produces. */

pub fn as_u32(field: &str, v: &Value) -> Result<u32> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| MouseError::bad_param(field, v, "expected an unsigned integer")),
        Value::String(s) => s
            .trim()
            .parse::<u32>()
            .map_err(|_| MouseError::bad_param(field, s, "expected an unsigned integer")),
        _ => Err(MouseError::bad_param(field, v, "expected an unsigned integer")),
    }
}

pub fn as_i32(field: &str, v: &Value) -> Result<i32> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(|| MouseError::bad_param(field, v, "expected an integer")),
        Value::String(s) => s
            .trim()
            .parse::<i32>()
            .map_err(|_| MouseError::bad_param(field, s, "expected an integer")),
        _ => Err(MouseError::bad_param(field, v, "expected an integer")),
    }
}

pub fn as_bool(field: &str, v: &Value) -> Result<bool> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) if n.as_u64() == Some(0) => Ok(false),
        Value::Number(n) if n.as_u64() == Some(1) => Ok(true),
        _ => Err(MouseError::bad_param(field, v, "expected a boolean")),
    }
}

pub fn as_str<'v>(field: &str, v: &'v Value) -> Result<&'v str> {
    v.as_str()
        .ok_or_else(|| MouseError::bad_param(field, v, "expected a string"))
}

pub fn as_u16_list(field: &str, v: &Value) -> Result<Vec<u16>> {
    let arr = v
        .as_array()
        .ok_or_else(|| MouseError::bad_param(field, v, "expected an array of integers"))?;
    arr.iter()
        .map(|item| {
            as_u32(field, item).and_then(|n| {
                u16::try_from(n)
                    .map_err(|_| MouseError::bad_param(field, n, "value exceeds 65535"))
            })
        })
        .collect()
}
