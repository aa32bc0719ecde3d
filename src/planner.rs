/* The semantic planner: `plan(prev_state, patch) → (next_state, commands)`.
 *
 * The algorithm is vendor-independent; everything protocol-specific
 * comes in through the `Protocol` table. Steps, in order: alias
 * normalisation, vendor dependency expansion, shared expansion, next
 * state overlay + normalisation, per-entry validation, stable priority
 * ordering, command production, secure-gate injection, last-write-wins
 * dedup. Validation failures abort before any command exists, so the
 * transport never sees a partially valid plan. */

use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

use crate::command::Command;
use crate::config::{ButtonMapping, Capabilities, MouseConfig, PerfMode};
use crate::convert;
use crate::error::{MouseError, Result};
use crate::features::{EntryAction, FeatureEntry, PlanCtx, Protocol};
use crate::funckey;
use crate::patch::{self, ChangeSet, FeatureKey, Patch};

#[derive(Debug)]
pub struct PlanResult {
    pub changes: ChangeSet,
    pub next: MouseConfig,
    pub commands: Vec<Command>,
}

pub fn plan(
    proto: &Protocol,
    caps: &Capabilities,
    prev: &MouseConfig,
    raw: &Patch,
) -> Result<PlanResult> {
    /* 1. Normalise keys through the alias tables. */
    let mut changes = normalize_keys(proto, caps, raw)?;

    /* 2. Vendor-specific dependency expansion, then the shared rules. */
    (proto.expand)(&mut changes, prev, caps)?;
    shared_expand(&mut changes, prev)?;

    /* 3. Build and normalise the next state. */
    let next = overlay(prev, &changes, caps)?;

    /* 4. Collect firing entries. */
    let mut selected: Vec<&FeatureEntry> = proto
        .entries
        .iter()
        .filter(|e| e.fires_for(&changes))
        .collect();

    /* 5. Validate everything before producing a single command. */
    for entry in &selected {
        if let Some(validate) = entry.validate {
            validate(&changes, &next, caps)?;
        }
    }

    /* 6. Stable order by priority; entry-table order breaks ties. */
    selected.sort_by_key(|e| e.priority);

    /* 7. Produce commands. */
    let ctx = PlanCtx { caps, prev };
    let mut commands = Vec::new();
    for entry in &selected {
        match &entry.action {
            EntryAction::Encode(encode) => {
                let value = changes.get(entry.key).cloned().unwrap_or(Value::Null);
                let spec = encode(&value, &next, caps)?;
                commands.push((proto.pack)(&spec));
            }
            EntryAction::Plan(plan_fn) => {
                commands.extend(plan_fn(&changes, &next, &ctx)?);
            }
        }
    }

    /* 8. Secure gate: bracket the sequence when sensitive writes exist. */
    if let Some(gate) = &proto.gate {
        if commands.iter().any(|c| c.sensitive) {
            commands.insert(0, gate.unlock_command());
            commands.push(gate.lock_command());
        }
    }

    /* 9. Last-write-wins dedup, preserving relative order otherwise. */
    let commands = dedup_last_wins(proto, commands);

    debug!(
        vendor = ?proto.vendor,
        commands = commands.len(),
        "plan complete"
    );

    Ok(PlanResult {
        changes,
        next,
        commands,
    })
}

fn normalize_keys(proto: &Protocol, caps: &Capabilities, raw: &Patch) -> Result<ChangeSet> {
    let mut changes = ChangeSet::new();
    for (key, value) in raw.iter() {
        let resolved = patch::resolve_key(key, proto.aliases)
            .ok_or_else(|| MouseError::unsupported(key))?;
        /* The virtual trigger is planner-internal. */
        if resolved == FeatureKey::DpiProfile {
            return Err(MouseError::unsupported(key));
        }
        if !caps.supports(resolved) {
            return Err(MouseError::unsupported_with(
                resolved.name(),
                supported_keys(caps),
            ));
        }
        changes.set(resolved, value.clone());
    }
    Ok(changes)
}

fn supported_keys(caps: &Capabilities) -> String {
    caps.patch_keys
        .iter()
        .map(|k| k.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/* Expansion rules shared by every vendor. */
fn shared_expand(changes: &mut ChangeSet, _prev: &MouseConfig) -> Result<()> {
    /* Any DPI-table field raises the virtual dpiProfile trigger. */
    const DPI_KEYS: &[FeatureKey] = &[
        FeatureKey::DpiSlotsX,
        FeatureKey::DpiSlotsY,
        FeatureKey::DpiSlotCount,
        FeatureKey::CurrentDpiIndex,
        FeatureKey::DpiSlot,
    ];
    if changes.contains_any(DPI_KEYS) {
        changes.set(FeatureKey::DpiProfile, Value::Bool(true));
    }

    /* Keep the debounce pair coherent: setting one derives the other. */
    if let Some(v) = changes.get(FeatureKey::DebounceMs).cloned() {
        if !changes.contains(FeatureKey::DebounceLevel) {
            let level = convert::debounce_from_value(&v)?;
            changes.set(FeatureKey::DebounceLevel, Value::from(level.as_str()));
        }
    } else if let Some(v) = changes.get(FeatureKey::DebounceLevel).cloned() {
        let level = convert::debounce_from_value(&v)?;
        changes.set(FeatureKey::DebounceMs, Value::from(level.to_ms()));
    }

    Ok(())
}

/* Parse one button mapping from a label string or a byte-pair object. */
pub fn button_from_value(v: &Value) -> Result<ButtonMapping> {
    match v {
        Value::String(label) => funckey::resolve_label(label),
        Value::Object(map) => {
            if let Some(label) = map.get("label").and_then(|l| l.as_str()) {
                return funckey::resolve_label(label);
            }
            let byte = |name: &str| {
                map.get(name)
                    .ok_or_else(|| {
                        MouseError::bad_param("buttonMapping", v, format!("missing {name}"))
                    })
                    .and_then(|item| patch::as_u32("buttonMapping", item))
                    .and_then(|n| {
                        u8::try_from(n).map_err(|_| {
                            MouseError::bad_param("buttonMapping", n, "byte exceeds 255")
                        })
                    })
            };
            Ok(ButtonMapping {
                funckey: byte("funckey")?,
                keycode: byte("keycode")?,
            })
        }
        _ => Err(MouseError::bad_param(
            "buttonMapping",
            v,
            "expected a label or {funckey, keycode}",
        )),
    }
}

/* Overlay the change set onto the previous state and normalise the
 * result (clamped indices, filled DPI slots, coherent debounce pair,
 * padded button table). */
fn overlay(prev: &MouseConfig, changes: &ChangeSet, caps: &Capabilities) -> Result<MouseConfig> {
    let mut next = prev.clone();

    for (key, value) in changes.iter() {
        match key {
            FeatureKey::PollingHz => {
                next.polling_hz = Some(patch::as_u32(key.name(), value)?);
            }
            FeatureKey::PerformanceMode => {
                next.performance_mode = Some(PerfMode::parse(patch::as_str(key.name(), value)?)?);
            }
            FeatureKey::LodHeight => {
                let s = patch::as_str(key.name(), value)?;
                next.lod = Some(crate::config::LodHeight::parse(s)?);
            }
            FeatureKey::DebounceLevel => {
                let level = convert::debounce_from_value(value)?;
                next.debounce_level = Some(level);
                next.debounce_ms = Some(level.to_ms());
            }
            FeatureKey::DebounceMs => {
                let level = convert::debounce_from_value(value)?;
                next.debounce_level = Some(level);
                next.debounce_ms = Some(level.to_ms());
            }
            FeatureKey::MotionSync => {
                next.motion_sync = Some(patch::as_bool(key.name(), value)?);
            }
            FeatureKey::LinearCorrection => {
                next.linear_correction = Some(patch::as_bool(key.name(), value)?);
            }
            FeatureKey::RippleControl => {
                next.ripple_control = Some(patch::as_bool(key.name(), value)?);
            }
            FeatureKey::GlassMode => {
                next.glass_mode = Some(patch::as_bool(key.name(), value)?);
            }
            FeatureKey::Hyperclick => {
                next.hyperclick = Some(patch::as_bool(key.name(), value)?);
            }
            FeatureKey::BurstDelayMs => {
                next.burst_delay_ms = Some(patch::as_u32(key.name(), value)?);
            }
            FeatureKey::SensorAngle => {
                next.sensor_angle = Some(patch::as_i32(key.name(), value)?);
            }
            FeatureKey::SensorFeel => {
                next.sensor_feel = Some(patch::as_i32(key.name(), value)?);
            }
            FeatureKey::SleepSeconds => {
                next.sleep_seconds = Some(patch::as_u32(key.name(), value)?);
            }
            FeatureKey::DpiSlotCount => {
                let n = patch::as_u32(key.name(), value)?;
                next.dpi_slot_count = Some(u8::try_from(n).unwrap_or(u8::MAX));
            }
            FeatureKey::CurrentDpiIndex => {
                let n = patch::as_u32(key.name(), value)?;
                next.current_dpi_index = Some(u8::try_from(n).unwrap_or(u8::MAX));
            }
            FeatureKey::DpiSlotsX => {
                let list = patch::as_u16_list(key.name(), value)?;
                /* A unified table patch moves both axes; an explicit Y
                 * list in the same patch still wins. */
                if caps.separate_xy_dpi && !changes.contains(FeatureKey::DpiSlotsY) {
                    next.dpi_slots_y = Some(list.clone());
                }
                next.dpi_slots_x = Some(list);
            }
            FeatureKey::DpiSlotsY => {
                next.dpi_slots_y = Some(patch::as_u16_list(key.name(), value)?);
            }
            FeatureKey::DpiSlot => apply_dpi_slot(&mut next, value, caps)?,
            FeatureKey::ButtonMappings => {
                let arr = value.as_array().ok_or_else(|| {
                    MouseError::bad_param(key.name(), value, "expected an array of mappings")
                })?;
                let mappings = arr
                    .iter()
                    .map(button_from_value)
                    .collect::<Result<Vec<_>>>()?;
                next.buttons = Some(mappings);
            }
            FeatureKey::ButtonMapping => apply_button_slot(&mut next, value, caps)?,
            FeatureKey::LedEnabled => {
                let mut led = next.led_or_default();
                led.enabled = patch::as_bool(key.name(), value)?;
                next.led = Some(led);
            }
            FeatureKey::LedBrightness => {
                let mut led = next.led_or_default();
                let pct = patch::as_u32(key.name(), value)?;
                led.brightness = u8::try_from(pct)
                    .map_err(|_| MouseError::bad_param(key.name(), pct, "expected a percent"))?;
                next.led = Some(led);
            }
            FeatureKey::LedMode => {
                let mut led = next.led_or_default();
                let mode = patch::as_u32(key.name(), value)?;
                led.mode = u8::try_from(mode)
                    .map_err(|_| MouseError::bad_param(key.name(), mode, "mode exceeds 255"))?;
                next.led = Some(led);
            }
            FeatureKey::LedSpeed => {
                let mut led = next.led_or_default();
                let speed = patch::as_u32(key.name(), value)?;
                if speed > 20 {
                    return Err(MouseError::bad_param(key.name(), speed, "expected 0..=20"));
                }
                led.speed = speed as u8;
                next.led = Some(led);
            }
            FeatureKey::LedColor => {
                let mut led = next.led_or_default();
                led.color = convert::led_color_from_value(value)?;
                next.led = Some(led);
            }
            FeatureKey::DpiProfile => {}
        }
    }

    normalize_next(&mut next, caps);
    Ok(next)
}

/* `{slot, dpi}` / `{slot, dpi_x, dpi_y}` with optional `select`. */
fn apply_dpi_slot(next: &mut MouseConfig, value: &Value, caps: &Capabilities) -> Result<()> {
    let obj = value.as_object().ok_or_else(|| {
        MouseError::bad_param("dpiSlot", value, "expected {slot, dpi}")
    })?;

    let slot = obj
        .get("slot")
        .ok_or_else(|| MouseError::bad_param("dpiSlot", value, "missing slot"))
        .and_then(|v| patch::as_u32("dpiSlot.slot", v))?;
    if slot == 0 || slot > u32::from(caps.dpi_slot_max) {
        return Err(MouseError::bad_param(
            "dpiSlot.slot",
            slot,
            format!("expected 1..={}", caps.dpi_slot_max),
        ));
    }
    let index = (slot - 1) as usize;

    let dpi_x = match obj.get("dpi").or_else(|| obj.get("dpi_x")) {
        Some(v) => patch::as_u32("dpiSlot.dpi", v)?,
        None => return Err(MouseError::bad_param("dpiSlot", value, "missing dpi")),
    };
    let dpi_y = match obj.get("dpi_y") {
        Some(v) => patch::as_u32("dpiSlot.dpi_y", v)?,
        None => dpi_x,
    };

    let fill = u16::try_from(dpi_x).unwrap_or(caps.dpi_max);
    let mut slots_x = next
        .dpi_slots_x
        .clone()
        .unwrap_or_else(|| vec![800; caps.dpi_slot_max as usize]);
    if slots_x.len() <= index {
        slots_x.resize(index + 1, fill);
    }
    slots_x[index] = u16::try_from(dpi_x).unwrap_or(caps.dpi_max);
    next.dpi_slots_x = Some(slots_x);

    if caps.separate_xy_dpi {
        let mut slots_y = next
            .dpi_slots_y
            .clone()
            .or_else(|| next.dpi_slots_x.clone())
            .unwrap_or_else(|| vec![800; caps.dpi_slot_max as usize]);
        if slots_y.len() <= index {
            slots_y.resize(index + 1, fill);
        }
        slots_y[index] = u16::try_from(dpi_y).unwrap_or(caps.dpi_max);
        next.dpi_slots_y = Some(slots_y);
    }

    if let Some(select) = obj.get("select") {
        if patch::as_bool("dpiSlot.select", select)? {
            next.current_dpi_index = Some(index as u8);
        }
    }

    Ok(())
}

/* `{slot, label}` or `{slot, funckey, keycode}`. */
fn apply_button_slot(next: &mut MouseConfig, value: &Value, caps: &Capabilities) -> Result<()> {
    let obj = value.as_object().ok_or_else(|| {
        MouseError::bad_param("buttonMapping", value, "expected {slot, label}")
    })?;

    let slot = obj
        .get("slot")
        .ok_or_else(|| MouseError::bad_param("buttonMapping", value, "missing slot"))
        .and_then(|v| patch::as_u32("buttonMapping.slot", v))?;
    if slot >= u32::from(caps.button_count) {
        return Err(MouseError::bad_param(
            "buttonMapping.slot",
            slot,
            format!("expected 0..{}", caps.button_count),
        ));
    }

    let mapping = button_from_value(value)?;

    let mut buttons = next.buttons.clone().unwrap_or_else(|| {
        (0..caps.button_count).map(funckey::default_mapping).collect()
    });
    if buttons.len() < caps.button_count as usize {
        let start = buttons.len() as u8;
        buttons.extend((start..caps.button_count).map(funckey::default_mapping));
    }
    buttons[slot as usize] = mapping;
    next.buttons = Some(buttons);

    Ok(())
}

fn normalize_next(next: &mut MouseConfig, caps: &Capabilities) {
    let slot_max = caps.dpi_slot_max.max(1) as usize;

    if let Some(slots) = next.dpi_slots_x.as_mut() {
        for v in slots.iter_mut() {
            *v = convert::clamp_dpi(*v, caps.dpi_min, caps.dpi_max);
        }
        let fill = slots.last().copied().unwrap_or(800);
        slots.resize(slot_max, fill);
    }
    if caps.separate_xy_dpi {
        if next.dpi_slots_y.is_none() {
            next.dpi_slots_y = next.dpi_slots_x.clone();
        }
        if let Some(slots) = next.dpi_slots_y.as_mut() {
            for v in slots.iter_mut() {
                *v = convert::clamp_dpi(*v, caps.dpi_min, caps.dpi_max);
            }
            let fill = slots.last().copied().unwrap_or(800);
            slots.resize(slot_max, fill);
        }
    } else {
        next.dpi_slots_y = None;
    }

    if let Some(count) = next.dpi_slot_count.as_mut() {
        *count = (*count).clamp(1, caps.dpi_slot_max);
    }
    if let Some(index) = next.current_dpi_index.as_mut() {
        let count = next.dpi_slot_count.unwrap_or(caps.dpi_slot_max);
        if *index >= count {
            *index = count.saturating_sub(1);
        }
    }

    if let Some(level) = next.debounce_level {
        next.debounce_ms = Some(level.to_ms());
    }

    if let Some(buttons) = next.buttons.as_mut() {
        let want = caps.button_count as usize;
        if buttons.len() < want {
            let start = buttons.len() as u8;
            buttons.extend((start..caps.button_count).map(funckey::default_mapping));
        } else {
            buttons.truncate(want);
        }
    }
}

/* Keep only the last occurrence of each dedup key, preserving the
 * relative order of the survivors. Profile-stream members are an
 * atomic unit and bypass the pass entirely (two chunks may well carry
 * identical bytes). */
fn dedup_last_wins(proto: &Protocol, commands: Vec<Command>) -> Vec<Command> {
    let mut seen: HashSet<crate::features::DedupKey> = HashSet::new();
    let mut kept: Vec<Command> = Vec::with_capacity(commands.len());
    for cmd in commands.into_iter().rev() {
        if cmd.profile_stream {
            kept.push(cmd);
            continue;
        }
        let key = (proto.dedup_key)(&cmd);
        if seen.insert(key) {
            kept.push(cmd);
        }
    }
    kept.reverse();
    kept
}
