/* Nordic-dongle protocol family (VID 0x1915).
 *
 * 64-byte frames on the command report: opcode, a constant four-byte
 * header, a length-or-index byte, a read/write flag, then left-aligned
 * data. Sensitive registers (DPI table, button map) only accept writes
 * between the secure unlock and lock payloads on the secure report.
 * The performance-mode register is the family quirk: its address is a
 * function of the current polling rate, so a mode write must always be
 * planned against the polling rate that will be in effect. */

use serde_json::Value;
use tracing::debug;

use crate::command::{Command, WriteSpec};
use crate::config::{
    BatteryState, Capabilities, DebounceLevel, FirmwareInfo, LodHeight, MouseConfig, PerfMode,
};
use crate::convert;
use crate::error::{MouseError, Result};
use crate::features::{
    DedupKey, EntryAction, EntryKind, FeatureEntry, GateSpec, PlanCtx, Protocol,
};
use crate::patch::{self, ChangeSet, FeatureKey};
use crate::protocol::{ConfigPush, InputEvent, Vendor};
use crate::transport::Transport;

/* ------------------------------------------------------------------ */
/* Wire constants                                                      */
/* ------------------------------------------------------------------ */

pub const REPORT_ID: u8 = 0x05;
pub const SECURE_REPORT_ID: u8 = 0x08;
pub const INPUT_REPORT_ID: u8 = 0x06;

pub const FRAME_LEN: usize = 64;
pub const FRAME_HEADER: [u8; 4] = [0x00, 0x00, 0x01, 0x00];

pub const RW_WRITE: u8 = 0x01;
pub const RW_READ: u8 = 0x00;

/* Register opcodes. */
pub const OP_FIRMWARE: u8 = 0x01;
pub const OP_DPI_VALUE: u8 = 0x03;
pub const OP_DPI_SELECT: u8 = 0x04;
pub const OP_POLLING: u8 = 0x05;
pub const OP_PERF_MODE: u8 = 0x06;
pub const OP_LOD: u8 = 0x07;
pub const OP_DEBOUNCE: u8 = 0x09;
pub const OP_SENSOR_FLAGS: u8 = 0x0A;
pub const OP_RIPPLE: u8 = 0x0B;
pub const OP_GLASS: u8 = 0x0C;
pub const OP_ANGLE: u8 = 0x0D;
pub const OP_FEEL: u8 = 0x0E;
pub const OP_SLEEP: u8 = 0x10;
pub const OP_BUTTON: u8 = 0x11;
pub const OP_BATTERY: u8 = 0x12;

pub const OP_UNLOCK: u8 = 0xA0;
pub const OP_LOCK: u8 = 0xA1;

/* Length-or-index bytes for the registers above. */
const IDX_DPI_WRITE: u8 = 0x04;
const IDX_DPI_SELECT: u8 = 0x02;
const IDX_BUTTON_WRITE: u8 = 0x03;
const IDX_ONE: u8 = 0x01;

/* Input push frame types. */
const PUSH_CONFIG: u8 = 0x02;
const PUSH_BATTERY: u8 = 0x03;

/* Polling rate ↔ register code. */
const POLLING_CODES: &[(u32, u8)] = &[
    (1000, 0x01),
    (2000, 0x02),
    (4000, 0x03),
    (8000, 0x04),
    (500, 0x05),
    (250, 0x06),
    (125, 0x07),
];

/* The performance-mode register address moves with the polling rate. */
const PERF_ADDR_BY_HZ: &[(u32, u8)] = &[
    (125, 0x10),
    (250, 0x10),
    (500, 0x10),
    (1000, 0x10),
    (2000, 0x11),
    (4000, 0x12),
    (8000, 0x13),
];

const MODE_ORDER: &[PerfMode] = &[
    PerfMode::Low,
    PerfMode::Std,
    PerfMode::Hp,
    PerfMode::Sport,
    PerfMode::Oc,
];

const fn gate_payload(opcode: u8) -> [u8; FRAME_LEN] {
    let mut buf = [0u8; FRAME_LEN];
    buf[0] = opcode;
    buf[2] = 0x01;
    buf[5] = 0x06;
    buf[6] = RW_WRITE;
    /* Firmware unlock magic. */
    buf[7] = 0x5A;
    buf[8] = 0xA5;
    buf[9] = 0x3C;
    buf[10] = 0xC3;
    buf[11] = 0x96;
    buf[12] = 0x69;
    buf
}

static UNLOCK_PAYLOAD: [u8; FRAME_LEN] = gate_payload(OP_UNLOCK);
static LOCK_PAYLOAD: [u8; FRAME_LEN] = gate_payload(OP_LOCK);

pub static GATE: GateSpec = GateSpec {
    report_id: SECURE_REPORT_ID,
    unlock_opcode: OP_UNLOCK,
    lock_opcode: OP_LOCK,
    unlock_payload: &UNLOCK_PAYLOAD,
    lock_payload: &LOCK_PAYLOAD,
    wait_ms: 20,
};

/* ------------------------------------------------------------------ */
/* Codec                                                               */
/* ------------------------------------------------------------------ */

pub fn write_frame(opcode: u8, len_or_idx: u8, data: &[u8]) -> Vec<u8> {
    frame(opcode, len_or_idx, RW_WRITE, data)
}

pub fn read_frame(opcode: u8, len_or_idx: u8) -> Vec<u8> {
    frame(opcode, len_or_idx, RW_READ, &[])
}

fn frame(opcode: u8, len_or_idx: u8, rw: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; FRAME_LEN];
    buf[0] = opcode;
    buf[1..5].copy_from_slice(&FRAME_HEADER);
    buf[5] = len_or_idx;
    buf[6] = rw;
    let n = data.len().min(FRAME_LEN - 7);
    buf[7..7 + n].copy_from_slice(&data[..n]);
    buf
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub opcode: u8,
    pub declared_len: u8,
    pub data: Vec<u8>,
    pub raw: Vec<u8>,
}

/* Response frames arrive in one of three layouts depending on firmware
 * generation: a report-id echo, a mirror of the write frame, or the
 * legacy `[opcode, len, data]` shape. The first layout whose
 * reconstructed opcode equals the expected one wins. */
pub fn parse_response(expected: u8, raw: &[u8]) -> Result<ParsedResponse> {
    /* Report-id echo: [report_id, opcode, len, data...] */
    if raw.len() >= 3 && raw[0] == REPORT_ID && raw[1] == expected {
        return Ok(extract(expected, raw[2], &raw[3..], raw));
    }
    /* Write-frame mirror: [opcode, header, len, rw, data...] */
    if raw.len() >= 7 && raw[0] == expected && raw[1..5] == FRAME_HEADER {
        return Ok(extract(expected, raw[5], &raw[7..], raw));
    }
    /* Legacy: [opcode, len, data...] */
    if raw.len() >= 2 && raw[0] == expected {
        return Ok(extract(expected, raw[1], &raw[2..], raw));
    }

    Err(MouseError::CmdMismatch {
        expected,
        observed: raw.first().copied().unwrap_or(0),
    })
}

fn extract(opcode: u8, declared_len: u8, body: &[u8], raw: &[u8]) -> ParsedResponse {
    let data = if declared_len > 0 {
        body.iter()
            .copied()
            .take(declared_len as usize)
            .collect::<Vec<u8>>()
    } else {
        /* No declared length: trim the zero padding. */
        let end = body
            .iter()
            .rposition(|b| *b != 0)
            .map(|pos| pos + 1)
            .unwrap_or(0);
        body[..end].to_vec()
    };
    ParsedResponse {
        opcode,
        declared_len,
        data,
        raw: raw.to_vec(),
    }
}

/* ------------------------------------------------------------------ */
/* Value tables                                                        */
/* ------------------------------------------------------------------ */

pub fn polling_code(hz: u32) -> Option<u8> {
    POLLING_CODES.iter().find(|(h, _)| *h == hz).map(|(_, c)| *c)
}

pub fn polling_from_code(code: u8) -> Option<u32> {
    POLLING_CODES.iter().find(|(_, c)| *c == code).map(|(h, _)| *h)
}

pub fn perf_addr(hz: u32) -> u8 {
    PERF_ADDR_BY_HZ
        .iter()
        .find(|(h, _)| *h == hz)
        .map(|(_, a)| *a)
        .unwrap_or(0x10)
}

fn mode_code(mode: PerfMode) -> u8 {
    mode as u8
}

fn mode_from_code(code: u8) -> Option<PerfMode> {
    MODE_ORDER.get(code as usize).copied()
}

fn mode_index(mode: PerfMode) -> usize {
    MODE_ORDER.iter().position(|m| *m == mode).unwrap_or(0)
}

fn lod_code(lod: LodHeight) -> u8 {
    match lod {
        LodHeight::Low => 0x01,
        LodHeight::Mid => 0x02,
        LodHeight::High => 0x03,
    }
}

fn lod_from_code(code: u8) -> Option<LodHeight> {
    match code {
        0x01 => Some(LodHeight::Low),
        0x02 => Some(LodHeight::Mid),
        0x03 => Some(LodHeight::High),
        _ => None,
    }
}

/* Motion sync and linear correction share one register, bits 0 and 1,
 * both inverted (0 = on). Unused bits stay set. */
fn sensor_flags_byte(next: &MouseConfig) -> u8 {
    let mut byte = 0xFFu8;
    if next.motion_sync.unwrap_or(false) {
        byte &= !0x01;
    }
    if next.linear_correction.unwrap_or(false) {
        byte &= !0x02;
    }
    byte
}

fn sensor_flags_decode(byte: u8) -> (bool, bool) {
    (byte & 0x01 == 0, byte & 0x02 == 0)
}

/* ------------------------------------------------------------------ */
/* Dependency expansion: polling / performance-mode coupling           */
/* ------------------------------------------------------------------ */

/* The requested `(polling, mode)` pair may be infeasible: each rate
 * allows only a subset of modes. Convergence policy: a user-explicit
 * mode wins (snap the rate to the nearest one supporting it), an
 * implicit mode follows the rate (snap to the nearest allowed mode).
 * Each round shrinks either the rate gap or the mode gap, so four
 * rounds always suffice. */
fn expand(changes: &mut ChangeSet, prev: &MouseConfig, caps: &Capabilities) -> Result<()> {
    let mode_explicit = changes.contains(FeatureKey::PerformanceMode);
    let polling_explicit = changes.contains(FeatureKey::PollingHz);

    /* The perf register's address depends on the polling rate, so a
     * mode write always plans against an explicit rate. */
    if mode_explicit && !polling_explicit {
        if let Some(hz) = prev.polling_hz {
            changes.set(FeatureKey::PollingHz, Value::from(hz));
        }
    }

    let mut hz = match changes.u32_of(FeatureKey::PollingHz)? {
        Some(hz) => hz,
        None => prev.polling_hz.unwrap_or(1000),
    };
    let mut mode = match changes.str_of(FeatureKey::PerformanceMode)? {
        Some(s) => Some(PerfMode::parse(s)?),
        None => prev.performance_mode,
    };

    let Some(mut current_mode) = mode.take() else {
        return Ok(());
    };

    if !caps.polling_rates.contains(&hz) {
        /* Leave the bad rate for validation to reject. */
        return Ok(());
    }

    let mut moved = false;
    for _ in 0..4 {
        let allowed = caps.perf_modes_for(hz);
        if allowed.is_empty() || allowed.contains(&current_mode) {
            break;
        }
        moved = true;
        if mode_explicit && !polling_explicit {
            /* Preserve the mode; snap the rate. */
            let Some(new_hz) = nearest_rate_for_mode(caps, hz, current_mode) else {
                break;
            };
            debug!(hz, new_hz, "snapping polling rate to preserve mode");
            hz = new_hz;
        } else {
            /* Follow the rate; snap the mode. */
            let Some(new_mode) = nearest_mode(allowed, current_mode) else {
                break;
            };
            debug!(?current_mode, ?new_mode, "snapping performance mode to rate");
            current_mode = new_mode;
        }
    }

    /* Re-assert both halves of the pair when a correction ran or the
     * mode was patched; a pure polling change with a still-valid mode
     * emits no mode write. */
    if moved || mode_explicit {
        changes.set(FeatureKey::PerformanceMode, Value::from(current_mode.as_str()));
        changes.set(FeatureKey::PollingHz, Value::from(hz));
    }

    Ok(())
}

fn nearest_rate_for_mode(caps: &Capabilities, hz: u32, mode: PerfMode) -> Option<u32> {
    caps.polling_rates
        .iter()
        .copied()
        .filter(|rate| caps.perf_modes_for(*rate).contains(&mode))
        .min_by_key(|rate| rate.abs_diff(hz))
}

fn nearest_mode(allowed: &[PerfMode], mode: PerfMode) -> Option<PerfMode> {
    let want = mode_index(mode);
    allowed
        .iter()
        .copied()
        .min_by_key(|m| (mode_index(*m).abs_diff(want), mode_index(*m)))
}

/* ------------------------------------------------------------------ */
/* Validators and encoders                                             */
/* ------------------------------------------------------------------ */

fn validate_polling(changes: &ChangeSet, _next: &MouseConfig, caps: &Capabilities) -> Result<()> {
    if let Some(hz) = changes.u32_of(FeatureKey::PollingHz)? {
        if !caps.polling_rates.contains(&hz) {
            return Err(MouseError::bad_param(
                "pollingHz",
                hz,
                format!("supported rates: {:?}", caps.polling_rates),
            ));
        }
    }
    Ok(())
}

fn validate_perf_mode(changes: &ChangeSet, next: &MouseConfig, caps: &Capabilities) -> Result<()> {
    if let Some(s) = changes.str_of(FeatureKey::PerformanceMode)? {
        let mode = PerfMode::parse(s)?;
        let hz = next.polling_hz.unwrap_or(1000);
        let allowed = caps.perf_modes_for(hz);
        if !allowed.contains(&mode) {
            return Err(MouseError::bad_param(
                "performanceMode",
                s,
                format!("not available at {hz} Hz"),
            ));
        }
    }
    Ok(())
}

/* Sleep input is never rounded: only whole minutes in the supported
 * window are accepted, anything else is rejected outright. */
fn validate_sleep(changes: &ChangeSet, _next: &MouseConfig, caps: &Capabilities) -> Result<()> {
    if let Some(secs) = changes.u32_of(FeatureKey::SleepSeconds)? {
        let (min_minutes, max_minutes) = caps.sleep_minutes.unwrap_or((2, 120));
        if secs % 60 != 0 {
            return Err(MouseError::bad_param(
                "sleepSeconds",
                secs,
                "expected a multiple of 60",
            ));
        }
        let minutes = secs / 60;
        if minutes < min_minutes || minutes > max_minutes {
            return Err(MouseError::bad_param(
                "sleepSeconds",
                secs,
                format!("expected {min_minutes}..={max_minutes} minutes"),
            ));
        }
    }
    Ok(())
}

fn enc_polling(v: &Value, _next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let hz = patch::as_u32("pollingHz", v)?;
    let code = polling_code(hz)
        .ok_or_else(|| MouseError::bad_param("pollingHz", hz, "no register code"))?;
    Ok(WriteSpec::new(OP_POLLING, IDX_ONE, vec![code]))
}

fn enc_perf_mode(_v: &Value, next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let mode = next
        .performance_mode
        .ok_or_else(|| MouseError::bad_param("performanceMode", "none", "mode unresolved"))?;
    let hz = next.polling_hz.unwrap_or(1000);
    Ok(WriteSpec::new(OP_PERF_MODE, perf_addr(hz), vec![mode_code(mode)]))
}

fn enc_lod(_v: &Value, next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let lod = next
        .lod
        .ok_or_else(|| MouseError::bad_param("lodHeight", "none", "missing value"))?;
    Ok(WriteSpec::new(OP_LOD, IDX_ONE, vec![lod_code(lod)]))
}

fn enc_debounce(v: &Value, _next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let level = convert::debounce_from_value(v)?;
    Ok(WriteSpec::new(OP_DEBOUNCE, IDX_ONE, vec![level.to_ms() as u8]))
}

fn enc_sensor_flags(_v: &Value, next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    Ok(WriteSpec::new(OP_SENSOR_FLAGS, IDX_ONE, vec![sensor_flags_byte(next)]))
}

fn enc_ripple(v: &Value, _next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let on = patch::as_bool("rippleControl", v)?;
    Ok(WriteSpec::new(OP_RIPPLE, IDX_ONE, vec![u8::from(on)]))
}

fn enc_glass(v: &Value, _next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let on = patch::as_bool("glassMode", v)?;
    Ok(WriteSpec::new(OP_GLASS, IDX_ONE, vec![u8::from(on)]))
}

fn enc_angle(v: &Value, _next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let deg = patch::as_i32("sensorAngle", v)?;
    Ok(WriteSpec::new(OP_ANGLE, IDX_ONE, vec![convert::sensor_angle_to_wire(deg)?]))
}

fn enc_feel(v: &Value, _next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let feel = patch::as_i32("sensorFeel", v)?;
    Ok(WriteSpec::new(OP_FEEL, IDX_ONE, vec![convert::sensor_feel_to_wire(feel)?]))
}

fn enc_sleep(v: &Value, _next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let secs = patch::as_u32("sleepSeconds", v)?;
    Ok(WriteSpec::new(OP_SLEEP, IDX_ONE, vec![(secs / 60) as u8]))
}

/* ------------------------------------------------------------------ */
/* Virtual plans                                                       */
/* ------------------------------------------------------------------ */

fn dpi_slot_write(slot: u8, dpi: u16) -> Command {
    let le = convert::dpi_to_le(dpi);
    let payload = write_frame(OP_DPI_VALUE, IDX_DPI_WRITE, &[slot, le[0], le[1]]);
    Command::new(REPORT_ID, OP_DPI_VALUE, payload).sensitive()
}

fn plan_dpi_profile(changes: &ChangeSet, next: &MouseConfig, ctx: &PlanCtx) -> Result<Vec<Command>> {
    let mut cmds = Vec::new();
    let slots = next.dpi_slots_x.clone().unwrap_or_default();

    if let Some(v) = changes.get(FeatureKey::DpiSlot) {
        /* Single-slot patch: write exactly the named slot. */
        let obj = v
            .as_object()
            .ok_or_else(|| MouseError::bad_param("dpiSlot", v, "expected {slot, dpi}"))?;
        let slot = obj
            .get("slot")
            .map(|s| patch::as_u32("dpiSlot.slot", s))
            .transpose()?
            .unwrap_or(1);
        let index = (slot.saturating_sub(1)) as usize;
        let dpi = slots.get(index).copied().unwrap_or(800);
        cmds.push(dpi_slot_write(index as u8, dpi));
    } else if changes.contains(FeatureKey::DpiSlotsX) || changes.contains(FeatureKey::DpiSlotsY) {
        /* Full-table patch: write every slot. */
        for (index, dpi) in slots.iter().enumerate().take(ctx.caps.dpi_slot_max as usize) {
            cmds.push(dpi_slot_write(index as u8, *dpi));
        }
    }

    if changes.contains(FeatureKey::DpiSlotCount) || changes.contains(FeatureKey::CurrentDpiIndex) {
        let count = next.dpi_slot_count.unwrap_or(ctx.caps.dpi_slot_max);
        let index = next.current_dpi_index.unwrap_or(0);
        let payload = write_frame(OP_DPI_SELECT, IDX_DPI_SELECT, &[count, index]);
        cmds.push(Command::new(REPORT_ID, OP_DPI_SELECT, payload).sensitive());
    }

    Ok(cmds)
}

fn plan_buttons(changes: &ChangeSet, next: &MouseConfig, ctx: &PlanCtx) -> Result<Vec<Command>> {
    let buttons = next.buttons.clone().unwrap_or_default();
    let mut cmds = Vec::new();

    let write_one = |slot: u8, mapping: crate::config::ButtonMapping| {
        let payload = write_frame(
            OP_BUTTON,
            IDX_BUTTON_WRITE,
            &[slot, mapping.funckey, mapping.keycode],
        );
        Command::new(REPORT_ID, OP_BUTTON, payload).sensitive()
    };

    if let Some(v) = changes.get(FeatureKey::ButtonMapping) {
        let obj = v
            .as_object()
            .ok_or_else(|| MouseError::bad_param("buttonMapping", v, "expected {slot, label}"))?;
        let slot = obj
            .get("slot")
            .map(|s| patch::as_u32("buttonMapping.slot", s))
            .transpose()?
            .unwrap_or(0) as usize;
        let mapping = buttons
            .get(slot)
            .copied()
            .ok_or_else(|| MouseError::bad_param("buttonMapping.slot", slot, "no such button"))?;
        cmds.push(write_one(slot as u8, mapping));
    } else if changes.contains(FeatureKey::ButtonMappings) {
        for (slot, mapping) in buttons.iter().enumerate().take(ctx.caps.button_count as usize) {
            cmds.push(write_one(slot as u8, *mapping));
        }
    }

    Ok(cmds)
}

/* ------------------------------------------------------------------ */
/* Protocol table                                                      */
/* ------------------------------------------------------------------ */

fn pack(spec: &WriteSpec) -> Command {
    let payload = write_frame(spec.opcode, spec.len_or_idx, &spec.data);
    let mut cmd = Command::new(REPORT_ID, spec.opcode, payload).wait_ms(spec.wait_ms);
    if spec.sensitive {
        cmd = cmd.sensitive();
    }
    cmd
}

/* Slot-indexed writes keep `data[0]` in the key so writes to distinct
 * slots survive the last-write-wins pass. */
fn dedup_key(cmd: &Command) -> DedupKey {
    let len_or_idx = cmd.payload.get(5).copied().unwrap_or(0);
    let data0 = match cmd.opcode {
        OP_DPI_VALUE | OP_BUTTON => cmd.payload.get(7).copied(),
        _ => None,
    };
    DedupKey {
        report_id: cmd.report_id,
        opcode: cmd.opcode,
        len_or_idx,
        data0,
    }
}

static ENTRIES: &[FeatureEntry] = &[
    FeatureEntry {
        key: FeatureKey::PollingHz,
        kind: EntryKind::Direct,
        priority: 10,
        triggers: &[],
        validate: Some(validate_polling),
        action: EntryAction::Encode(enc_polling),
    },
    FeatureEntry {
        key: FeatureKey::PerformanceMode,
        kind: EntryKind::Compound,
        priority: 20,
        triggers: &[],
        validate: Some(validate_perf_mode),
        action: EntryAction::Encode(enc_perf_mode),
    },
    FeatureEntry {
        key: FeatureKey::DebounceMs,
        kind: EntryKind::Direct,
        priority: 30,
        triggers: &[FeatureKey::DebounceLevel],
        validate: None,
        action: EntryAction::Encode(enc_debounce),
    },
    FeatureEntry {
        key: FeatureKey::MotionSync,
        kind: EntryKind::Compound,
        priority: 40,
        triggers: &[FeatureKey::LinearCorrection],
        validate: None,
        action: EntryAction::Encode(enc_sensor_flags),
    },
    FeatureEntry {
        key: FeatureKey::LodHeight,
        kind: EntryKind::Direct,
        priority: 50,
        triggers: &[],
        validate: None,
        action: EntryAction::Encode(enc_lod),
    },
    FeatureEntry {
        key: FeatureKey::RippleControl,
        kind: EntryKind::Direct,
        priority: 50,
        triggers: &[],
        validate: None,
        action: EntryAction::Encode(enc_ripple),
    },
    FeatureEntry {
        key: FeatureKey::GlassMode,
        kind: EntryKind::Direct,
        priority: 50,
        triggers: &[],
        validate: None,
        action: EntryAction::Encode(enc_glass),
    },
    FeatureEntry {
        key: FeatureKey::SensorAngle,
        kind: EntryKind::Direct,
        priority: 55,
        triggers: &[],
        validate: None,
        action: EntryAction::Encode(enc_angle),
    },
    FeatureEntry {
        key: FeatureKey::SensorFeel,
        kind: EntryKind::Direct,
        priority: 55,
        triggers: &[],
        validate: None,
        action: EntryAction::Encode(enc_feel),
    },
    FeatureEntry {
        key: FeatureKey::SleepSeconds,
        kind: EntryKind::Direct,
        priority: 60,
        triggers: &[],
        validate: Some(validate_sleep),
        action: EntryAction::Encode(enc_sleep),
    },
    FeatureEntry {
        key: FeatureKey::DpiProfile,
        kind: EntryKind::Virtual,
        priority: 70,
        triggers: &[
            FeatureKey::DpiSlotsX,
            FeatureKey::DpiSlotsY,
            FeatureKey::DpiSlotCount,
            FeatureKey::CurrentDpiIndex,
            FeatureKey::DpiSlot,
        ],
        validate: None,
        action: EntryAction::Plan(plan_dpi_profile),
    },
    FeatureEntry {
        key: FeatureKey::ButtonMappings,
        kind: EntryKind::Virtual,
        priority: 80,
        triggers: &[FeatureKey::ButtonMapping],
        validate: None,
        action: EntryAction::Plan(plan_buttons),
    },
];

static PATCH_KEYS: &[FeatureKey] = &[
    FeatureKey::PollingHz,
    FeatureKey::PerformanceMode,
    FeatureKey::LodHeight,
    FeatureKey::DebounceLevel,
    FeatureKey::DebounceMs,
    FeatureKey::MotionSync,
    FeatureKey::LinearCorrection,
    FeatureKey::RippleControl,
    FeatureKey::GlassMode,
    FeatureKey::SensorAngle,
    FeatureKey::SensorFeel,
    FeatureKey::SleepSeconds,
    FeatureKey::DpiSlotCount,
    FeatureKey::CurrentDpiIndex,
    FeatureKey::DpiSlotsX,
    FeatureKey::DpiSlot,
    FeatureKey::ButtonMappings,
    FeatureKey::ButtonMapping,
];

static MODES_FULL: &[PerfMode] = &[
    PerfMode::Low,
    PerfMode::Std,
    PerfMode::Hp,
    PerfMode::Sport,
    PerfMode::Oc,
];
static MODES_MID: &[PerfMode] = &[PerfMode::Low, PerfMode::Std, PerfMode::Hp, PerfMode::Sport];
static MODES_HIGH: &[PerfMode] = &[PerfMode::Hp, PerfMode::Sport, PerfMode::Oc];
static MODES_TOP: &[PerfMode] = &[PerfMode::Sport, PerfMode::Oc];

static CAPABILITIES: Capabilities = Capabilities {
    vendor: Vendor::Nordic,
    polling_rates: &[125, 250, 500, 1000, 2000, 4000, 8000],
    perf_modes_by_polling: &[
        (125, MODES_MID),
        (250, MODES_MID),
        (500, MODES_MID),
        (1000, MODES_FULL),
        (2000, MODES_HIGH),
        (4000, MODES_HIGH),
        (8000, MODES_TOP),
    ],
    perf_modes: MODES_FULL,
    dpi_min: 100,
    dpi_max: 26000,
    dpi_slot_max: 5,
    button_count: 5,
    sleep_minutes: Some((2, 120)),
    led_modes: &[],
    separate_xy_dpi: false,
    patch_keys: PATCH_KEYS,
};

static PROTOCOL: Protocol = Protocol {
    vendor: Vendor::Nordic,
    entries: ENTRIES,
    aliases: &[("reportRate", FeatureKey::PollingHz)],
    expand,
    pack,
    dedup_key,
    gate: Some(&GATE),
    keepalive: None,
};

pub fn protocol() -> &'static Protocol {
    &PROTOCOL
}

pub fn capabilities() -> &'static Capabilities {
    &CAPABILITIES
}

pub fn default_config() -> MouseConfig {
    MouseConfig {
        polling_hz: Some(1000),
        lod: Some(LodHeight::Mid),
        debounce_level: Some(DebounceLevel::Mid),
        debounce_ms: Some(DebounceLevel::Mid.to_ms()),
        motion_sync: Some(false),
        linear_correction: Some(false),
        ripple_control: Some(false),
        glass_mode: Some(false),
        sensor_angle: Some(0),
        sensor_feel: Some(0),
        sleep_seconds: Some(600),
        dpi_slot_count: Some(5),
        current_dpi_index: Some(0),
        dpi_slots_x: Some(vec![800, 1600, 3200, 6400, 12800]),
        buttons: Some((0..5).map(crate::funckey::default_mapping).collect()),
        ..MouseConfig::default()
    }
}

/* ------------------------------------------------------------------ */
/* Read paths                                                          */
/* ------------------------------------------------------------------ */

async fn read_register(t: &Transport, opcode: u8, len_or_idx: u8) -> Result<ParsedResponse> {
    t.request_feature(
        REPORT_ID,
        &read_frame(opcode, len_or_idx),
        REPORT_ID,
        10,
        move |raw| parse_response(opcode, raw),
    )
    .await
}

pub async fn read_config(t: &Transport) -> Result<MouseConfig> {
    let mut config = MouseConfig::default();

    let polling = read_register(t, OP_POLLING, IDX_ONE).await?;
    config.polling_hz = polling.data.first().and_then(|c| polling_from_code(*c));

    if let Some(hz) = config.polling_hz {
        let perf = read_register(t, OP_PERF_MODE, perf_addr(hz)).await?;
        config.performance_mode = perf.data.first().and_then(|c| mode_from_code(*c));
    }

    let lod = read_register(t, OP_LOD, IDX_ONE).await?;
    config.lod = lod.data.first().and_then(|c| lod_from_code(*c));

    let debounce = read_register(t, OP_DEBOUNCE, IDX_ONE).await?;
    if let Some(ms) = debounce.data.first() {
        config.debounce_level = DebounceLevel::from_ms(u32::from(*ms));
        config.debounce_ms = Some(u32::from(*ms));
    }

    let flags = read_register(t, OP_SENSOR_FLAGS, IDX_ONE).await?;
    if let Some(byte) = flags.data.first() {
        let (motion_sync, linear_correction) = sensor_flags_decode(*byte);
        config.motion_sync = Some(motion_sync);
        config.linear_correction = Some(linear_correction);
    }

    let ripple = read_register(t, OP_RIPPLE, IDX_ONE).await?;
    config.ripple_control = ripple.data.first().map(|b| *b != 0);

    let glass = read_register(t, OP_GLASS, IDX_ONE).await?;
    config.glass_mode = glass.data.first().map(|b| *b != 0);

    let angle = read_register(t, OP_ANGLE, IDX_ONE).await?;
    config.sensor_angle = angle.data.first().map(|b| convert::sensor_angle_from_wire(*b));

    let feel = read_register(t, OP_FEEL, IDX_ONE).await?;
    config.sensor_feel = feel.data.first().map(|b| convert::sensor_feel_from_wire(*b));

    let sleep = read_register(t, OP_SLEEP, IDX_ONE).await?;
    config.sleep_seconds = sleep.data.first().map(|m| u32::from(*m) * 60);

    let select = read_register(t, OP_DPI_SELECT, IDX_DPI_SELECT).await?;
    if select.data.len() >= 2 {
        config.dpi_slot_count = Some(select.data[0]);
        config.current_dpi_index = Some(select.data[1]);
    }

    let mut slots = Vec::new();
    for slot in 0..CAPABILITIES.dpi_slot_max {
        let reply = read_register(t, OP_DPI_VALUE, slot).await?;
        if reply.data.len() >= 3 {
            slots.push(convert::dpi_from_le(reply.data[1], reply.data[2]));
        }
    }
    if !slots.is_empty() {
        config.dpi_slots_x = Some(slots);
    }

    /* Button registers only answer inside the secure bracket, and a
     * stale frame there is a hard failure rather than a drain. */
    t.send_gate(&GATE, true).await?;
    let mut buttons = Vec::new();
    for slot in 0..CAPABILITIES.button_count {
        let reply = t
            .request_feature_strict(
                REPORT_ID,
                &read_frame(OP_BUTTON, slot),
                REPORT_ID,
                10,
                move |raw| parse_response(OP_BUTTON, raw),
            )
            .await;
        match reply {
            Ok(parsed) if parsed.data.len() >= 3 => {
                buttons.push(crate::config::ButtonMapping {
                    funckey: parsed.data[1],
                    keycode: parsed.data[2],
                });
            }
            Ok(_) => buttons.push(crate::funckey::default_mapping(slot)),
            Err(err) => {
                t.send_gate(&GATE, false).await.ok();
                return Err(err);
            }
        }
    }
    t.send_gate(&GATE, false).await?;
    config.buttons = Some(buttons);

    let firmware = read_register(t, OP_FIRMWARE, IDX_ONE).await?;
    if firmware.data.len() >= 2 {
        config.firmware = Some(FirmwareInfo {
            main: format!("{}.{}", firmware.data[0], firmware.data[1]),
            wireless: firmware
                .data
                .get(2)
                .zip(firmware.data.get(3))
                .map(|(a, b)| format!("{a}.{b}"))
                .unwrap_or_default(),
        });
    }

    let battery = read_register(t, OP_BATTERY, IDX_ONE).await?;
    if let Some(percent) = battery.data.first() {
        config.battery = Some(BatteryState {
            percent: (*percent).min(100),
            charging: battery.data.get(1).is_some_and(|b| *b != 0),
        });
    }

    Ok(config)
}

pub async fn read_battery(t: &Transport) -> Result<BatteryState> {
    let reply = read_register(t, OP_BATTERY, IDX_ONE).await?;
    let percent = reply
        .data
        .first()
        .copied()
        .ok_or_else(|| MouseError::IoReadFail("battery frame too short".to_string()))?;
    Ok(BatteryState {
        percent: percent.min(100),
        charging: reply.data.get(1).is_some_and(|b| *b != 0),
    })
}

/* Unsolicited pushes: `data[0]` selects the frame type. */
pub fn parse_input(report: &crate::hid::InputReport) -> Option<InputEvent> {
    if report.report_id != INPUT_REPORT_ID || report.data.is_empty() {
        return None;
    }
    match report.data[0] {
        PUSH_BATTERY => {
            let percent = report.data.get(1).copied()?;
            let charging = report.data.get(2).is_some_and(|b| *b != 0);
            Some(InputEvent::Battery(BatteryState {
                percent: percent.min(100),
                charging,
            }))
        }
        PUSH_CONFIG => Some(InputEvent::Config(ConfigPush {
            current_dpi_index: report.data.get(1).copied(),
            dpi_slot_count: report.data.get(2).copied(),
            polling_hz: report.data.get(3).and_then(|c| polling_from_code(*c)),
        })),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Patch;
    use crate::planner;
    use serde_json::json;

    /* ── Framing ────────────────────────────────────────────────────── */

    #[test]
    fn write_frame_shape() {
        let f = write_frame(OP_POLLING, 0x01, &[0x03]);
        assert_eq!(f.len(), FRAME_LEN);
        assert_eq!(f[0], OP_POLLING);
        assert_eq!(&f[1..5], &[0x00, 0x00, 0x01, 0x00]);
        assert_eq!(f[5], 0x01);
        assert_eq!(f[6], RW_WRITE);
        assert_eq!(f[7], 0x03);
        assert!(f[8..].iter().all(|b| *b == 0));
    }

    #[test]
    fn read_frame_clears_rw_flag() {
        let f = read_frame(OP_LOD, 0x01);
        assert_eq!(f[6], RW_READ);
        assert!(f[7..].iter().all(|b| *b == 0));
    }

    #[test]
    fn gate_payloads_are_full_frames() {
        assert_eq!(UNLOCK_PAYLOAD.len(), FRAME_LEN);
        assert_eq!(UNLOCK_PAYLOAD[0], OP_UNLOCK);
        assert_eq!(LOCK_PAYLOAD[0], OP_LOCK);
        assert_eq!(&UNLOCK_PAYLOAD[7..13], &[0x5A, 0xA5, 0x3C, 0xC3, 0x96, 0x69]);
    }

    /* ── Response parsing ───────────────────────────────────────────── */

    #[test]
    fn parse_report_id_echo_layout() {
        let raw = [REPORT_ID, OP_POLLING, 0x01, 0x03, 0x00, 0x00];
        let parsed = parse_response(OP_POLLING, &raw).unwrap();
        assert_eq!(parsed.opcode, OP_POLLING);
        assert_eq!(parsed.declared_len, 1);
        assert_eq!(parsed.data, vec![0x03]);
    }

    #[test]
    fn parse_frame_mirror_layout() {
        let raw = write_frame(OP_LOD, 0x01, &[0x02]);
        let parsed = parse_response(OP_LOD, &raw).unwrap();
        assert_eq!(parsed.declared_len, 1);
        assert_eq!(parsed.data, vec![0x02]);
    }

    #[test]
    fn parse_legacy_layout() {
        let raw = [OP_DEBOUNCE, 0x01, 0x05, 0x00];
        let parsed = parse_response(OP_DEBOUNCE, &raw).unwrap();
        assert_eq!(parsed.data, vec![0x05]);
    }

    #[test]
    fn parse_zero_len_trims_trailing_zeros() {
        let raw = [OP_FIRMWARE, 0x00, 0x01, 0x07, 0x00, 0x00, 0x00];
        let parsed = parse_response(OP_FIRMWARE, &raw).unwrap();
        assert_eq!(parsed.data, vec![0x01, 0x07]);
    }

    #[test]
    fn parse_mismatch_is_an_error() {
        let raw = write_frame(OP_LOD, 0x01, &[0x02]);
        let err = parse_response(OP_POLLING, &raw).unwrap_err();
        assert!(matches!(
            err,
            MouseError::CmdMismatch { expected: OP_POLLING, observed: OP_LOD }
        ));
    }

    /* ── Tables ─────────────────────────────────────────────────────── */

    #[test]
    fn polling_codes_roundtrip() {
        for hz in [125u32, 250, 500, 1000, 2000, 4000, 8000] {
            let code = polling_code(hz).unwrap();
            assert_eq!(polling_from_code(code), Some(hz));
        }
        assert_eq!(polling_code(4000), Some(0x03));
        assert!(polling_code(333).is_none());
    }

    #[test]
    fn perf_register_address_follows_rate() {
        assert_eq!(perf_addr(1000), 0x10);
        assert_eq!(perf_addr(2000), 0x11);
        assert_eq!(perf_addr(4000), 0x12);
        assert_eq!(perf_addr(8000), 0x13);
    }

    #[test]
    fn sensor_flags_register_is_inverted() {
        let mut config = MouseConfig::default();
        config.motion_sync = Some(true);
        config.linear_correction = Some(false);
        let byte = sensor_flags_byte(&config);
        assert_eq!(byte & 0x01, 0x00); /* on → 0 */
        assert_eq!(byte & 0x02, 0x02); /* off → 1 */
        assert_eq!(sensor_flags_decode(byte), (true, false));
    }

    #[test]
    fn single_flag_patch_preserves_the_sibling_flag() {
        let mut prev = default_config();
        prev.linear_correction = Some(true);
        let result = planner::plan(
            protocol(),
            capabilities(),
            &prev,
            &Patch::new().set("motionSync", true),
        )
        .unwrap();
        let cmd = result
            .commands
            .iter()
            .find(|c| c.opcode == OP_SENSOR_FLAGS)
            .unwrap();
        /* Both bits low: motion sync from the patch, linear correction
         * carried over from the cached state. */
        assert_eq!(cmd.payload[7] & 0x03, 0x00);
    }

    /* ── Planner scenarios ──────────────────────────────────────────── */

    #[test]
    fn set_polling_4000_emits_exactly_one_write() {
        let result = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("pollingHz", 4000),
        )
        .unwrap();
        assert_eq!(result.commands.len(), 1);
        let cmd = &result.commands[0];
        assert_eq!(cmd.opcode, OP_POLLING);
        assert_eq!(cmd.payload[5], 0x01);
        assert_eq!(cmd.payload[7], 0x03);
        assert!(!cmd.secure_gate && !cmd.sensitive);
        assert_eq!(result.next.polling_hz, Some(4000));
    }

    #[test]
    fn set_dpi_slot_is_gated() {
        let result = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("dpi_slot", json!({"slot": 1, "dpi": 800})),
        )
        .unwrap();
        assert_eq!(result.commands.len(), 3);
        assert_eq!(result.commands[0].opcode, OP_UNLOCK);
        assert_eq!(result.commands[0].report_id, SECURE_REPORT_ID);
        let dpi = &result.commands[1];
        assert_eq!(dpi.opcode, OP_DPI_VALUE);
        assert_eq!(dpi.payload[5], 0x04);
        assert_eq!(&dpi.payload[7..10], &[0x00, 0x20, 0x03]);
        assert_eq!(result.commands[2].opcode, OP_LOCK);
    }

    #[test]
    fn no_sensitive_opcode_outside_the_bracket() {
        let result = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new()
                .set("dpiSlots", json!([400, 800, 1600, 3200, 6400]))
                .set("pollingHz", 1000),
        )
        .unwrap();
        let unlock = result
            .commands
            .iter()
            .position(|c| c.opcode == OP_UNLOCK)
            .unwrap();
        let lock = result
            .commands
            .iter()
            .position(|c| c.opcode == OP_LOCK)
            .unwrap();
        assert_eq!(unlock, 0);
        assert_eq!(lock, result.commands.len() - 1);
        for (i, cmd) in result.commands.iter().enumerate() {
            if cmd.sensitive {
                assert!(i > unlock && i < lock, "sensitive write outside gate");
            }
        }
    }

    #[test]
    fn polling_write_precedes_mode_write_and_uses_new_address() {
        let mut prev = default_config();
        prev.polling_hz = Some(1000);
        prev.performance_mode = Some(PerfMode::Hp);
        let result = planner::plan(
            protocol(),
            capabilities(),
            &prev,
            &Patch::new()
                .set("performanceMode", "sport")
                .set("pollingHz", 4000),
        )
        .unwrap();
        let polling_pos = result
            .commands
            .iter()
            .position(|c| c.opcode == OP_POLLING)
            .unwrap();
        let perf_pos = result
            .commands
            .iter()
            .position(|c| c.opcode == OP_PERF_MODE)
            .unwrap();
        assert!(polling_pos < perf_pos);
        /* The mode write targets the 4000 Hz register, not 1000 Hz. */
        assert_eq!(result.commands[perf_pos].payload[5], perf_addr(4000));
    }

    #[test]
    fn duplicate_register_writes_keep_only_the_last() {
        let result = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("debounceMs", 10).set("debounceLevel", "high"),
        )
        .unwrap();
        let debounce: Vec<_> = result
            .commands
            .iter()
            .filter(|c| c.opcode == OP_DEBOUNCE)
            .collect();
        assert_eq!(debounce.len(), 1);
        assert_eq!(debounce[0].payload[7], 10);
    }

    #[test]
    fn distinct_dpi_slots_survive_dedup() {
        let result = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("dpiSlots", json!([400, 800, 1600, 3200, 6400])),
        )
        .unwrap();
        let dpi_writes: Vec<_> = result
            .commands
            .iter()
            .filter(|c| c.opcode == OP_DPI_VALUE)
            .collect();
        assert_eq!(dpi_writes.len(), 5);
    }

    #[test]
    fn sleep_rejects_non_minute_input() {
        let err = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("sleepSeconds", 90),
        )
        .unwrap_err();
        assert!(matches!(err, MouseError::BadParam { .. }));

        let err = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("sleepSeconds", 60),
        )
        .unwrap_err();
        assert!(matches!(err, MouseError::BadParam { .. }), "1 minute is below range");

        let ok = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("sleepSeconds", 600),
        )
        .unwrap();
        assert_eq!(ok.commands[0].payload[7], 10);
    }

    /* ── Convergence ────────────────────────────────────────────────── */

    /* The documented convergence cases, run against a reduced
     * capability table: 1000 Hz allows {low, hp, sport, oc}, 2000 Hz
     * allows {hp, sport, oc}. */
    static CONV_1000: &[PerfMode] = &[PerfMode::Low, PerfMode::Hp, PerfMode::Sport, PerfMode::Oc];
    static CONV_2000: &[PerfMode] = &[PerfMode::Hp, PerfMode::Sport, PerfMode::Oc];
    static CONV_PERF_MODES_BY_POLLING: &[(u32, &[PerfMode])] =
        &[(1000, CONV_1000), (2000, CONV_2000)];

    fn convergence_caps() -> Capabilities {
        Capabilities {
            vendor: Vendor::Nordic,
            polling_rates: &[1000, 2000],
            perf_modes_by_polling: CONV_PERF_MODES_BY_POLLING,
            perf_modes: MODES_FULL,
            dpi_min: 100,
            dpi_max: 26000,
            dpi_slot_max: 5,
            button_count: 5,
            sleep_minutes: Some((2, 120)),
            led_modes: &[],
            separate_xy_dpi: false,
            patch_keys: PATCH_KEYS,
        }
    }

    #[test]
    fn implicit_mode_snaps_to_the_new_rate() {
        let mut prev = default_config();
        prev.polling_hz = Some(1000);
        prev.performance_mode = Some(PerfMode::Low);
        let result = planner::plan(
            protocol(),
            &convergence_caps(),
            &prev,
            &Patch::new().set("pollingHz", 2000),
        )
        .unwrap();
        assert_eq!(result.next.polling_hz, Some(2000));
        assert_eq!(result.next.performance_mode, Some(PerfMode::Hp));
    }

    #[test]
    fn explicit_mode_snaps_the_rate_instead() {
        let mut prev = default_config();
        prev.polling_hz = Some(2000);
        prev.performance_mode = Some(PerfMode::Hp);
        let result = planner::plan(
            protocol(),
            &convergence_caps(),
            &prev,
            &Patch::new().set("performanceMode", "low"),
        )
        .unwrap();
        assert_eq!(result.next.polling_hz, Some(1000));
        assert_eq!(result.next.performance_mode, Some(PerfMode::Low));
    }

    #[test]
    fn feasible_pair_is_left_alone() {
        let mut prev = default_config();
        prev.polling_hz = Some(1000);
        prev.performance_mode = Some(PerfMode::Low);
        let result = planner::plan(
            protocol(),
            &convergence_caps(),
            &prev,
            &Patch::new().set("performanceMode", "oc"),
        )
        .unwrap();
        assert_eq!(result.next.polling_hz, Some(1000));
        assert_eq!(result.next.performance_mode, Some(PerfMode::Oc));
    }

    /* ── Input pushes ───────────────────────────────────────────────── */

    #[test]
    fn battery_push_decodes() {
        let report = crate::hid::InputReport {
            report_id: INPUT_REPORT_ID,
            data: vec![PUSH_BATTERY, 87, 0x01],
        };
        assert_eq!(
            parse_input(&report),
            Some(InputEvent::Battery(BatteryState {
                percent: 87,
                charging: true,
            }))
        );
    }

    #[test]
    fn config_push_decodes() {
        let report = crate::hid::InputReport {
            report_id: INPUT_REPORT_ID,
            data: vec![PUSH_CONFIG, 0x02, 0x05, 0x03],
        };
        let Some(InputEvent::Config(push)) = parse_input(&report) else {
            panic!("expected config push");
        };
        assert_eq!(push.current_dpi_index, Some(2));
        assert_eq!(push.dpi_slot_count, Some(5));
        assert_eq!(push.polling_hz, Some(4000));
    }

    #[test]
    fn foreign_report_ids_are_ignored() {
        let report = crate::hid::InputReport {
            report_id: 0x99,
            data: vec![PUSH_BATTERY, 50],
        };
        assert_eq!(parse_input(&report), None);
    }
}
