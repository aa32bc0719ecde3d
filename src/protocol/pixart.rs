/* Pixart-based wired family (VID 0x093A, PID 0xEB02).
 *
 * The simplest framing in the stable: 32-byte reports, opcode at byte
 * zero, payload left-aligned, zero padding, no length field. DPI is a
 * 50-step table index packed together with the slot number. The LED
 * speed register is stored inverted and the brightness register takes
 * quarter-step codes; both easy to get wrong, both covered by tests.
 * Reads are polled only; the family pushes no input reports. */

use serde_json::Value;

use crate::command::{Command, WriteSpec};
use crate::config::{
    BatteryState, Capabilities, DebounceLevel, FirmwareInfo, LedState, LodHeight, MouseConfig,
    PerfMode, Rgb,
};
use crate::convert;
use crate::error::{MouseError, Result};
use crate::features::{
    DedupKey, EntryAction, EntryKind, FeatureEntry, GateSpec, PlanCtx, Protocol,
};
use crate::patch::{self, ChangeSet, FeatureKey};
use crate::protocol::{InputEvent, Vendor};
use crate::transport::Transport;

pub const REPORT_ID: u8 = 0x04;
pub const FRAME_LEN: usize = 32;

pub const OP_POLLING: u8 = 0x01;
pub const OP_LOD: u8 = 0x02;
pub const OP_PERF_MODE: u8 = 0x03;
pub const OP_DEBOUNCE: u8 = 0x04;
pub const OP_HYPERCLICK: u8 = 0x05;
pub const OP_BURST: u8 = 0x06;
pub const OP_SLEEP: u8 = 0x07;
pub const OP_DPI_COUNT: u8 = 0x08;
pub const OP_DPI_INDEX: u8 = 0x09;
pub const OP_DPI_VALUE: u8 = 0x0A;
pub const OP_BUTTON: u8 = 0x0B;
pub const OP_LED_ENABLE: u8 = 0x0C;
pub const OP_LED_BRIGHTNESS: u8 = 0x0D;
pub const OP_LED_MODE: u8 = 0x0E;
pub const OP_LED_SPEED: u8 = 0x0F;
pub const OP_LED_COLOR: u8 = 0x10;
pub const OP_BATTERY: u8 = 0x12;
pub const OP_FIRMWARE_MAIN: u8 = 0x13;
pub const OP_FIRMWARE_WIRELESS: u8 = 0x14;
pub const OP_UNLOCK: u8 = 0x15;
pub const OP_LOCK: u8 = 0x16;

/* The DPI registers hold 50-cpi table indexes, not raw values. */
pub const DPI_STEP: u16 = 50;

/* Polling register stores the report interval in milliseconds. */
const POLLING_CODES: &[(u32, u8)] = &[(125, 8), (250, 4), (500, 2), (1000, 1)];

const fn gate_payload(opcode: u8) -> [u8; FRAME_LEN] {
    let mut buf = [0u8; FRAME_LEN];
    buf[0] = opcode;
    buf[1] = 0xAA;
    buf[2] = 0x55;
    buf
}

static UNLOCK_PAYLOAD: [u8; FRAME_LEN] = gate_payload(OP_UNLOCK);
static LOCK_PAYLOAD: [u8; FRAME_LEN] = gate_payload(OP_LOCK);

/* Only the button registers sit behind this bracket, and only on the
 * read path; the planner never injects it for this family. */
pub static READ_GATE: GateSpec = GateSpec {
    report_id: REPORT_ID,
    unlock_opcode: OP_UNLOCK,
    lock_opcode: OP_LOCK,
    unlock_payload: &UNLOCK_PAYLOAD,
    lock_payload: &LOCK_PAYLOAD,
    wait_ms: 10,
};

/* ------------------------------------------------------------------ */
/* Codec                                                               */
/* ------------------------------------------------------------------ */

pub fn frame(opcode: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; FRAME_LEN];
    buf[0] = opcode;
    let n = data.len().min(FRAME_LEN - 1);
    buf[1..1 + n].copy_from_slice(&data[..n]);
    buf
}

pub fn read_request(opcode: u8) -> Vec<u8> {
    frame(opcode, &[])
}

/* Responses echo the opcode at byte zero. */
pub fn parse_response(expected: u8, raw: &[u8]) -> Result<Vec<u8>> {
    match raw.first() {
        Some(op) if *op == expected => Ok(raw[1..].to_vec()),
        Some(op) => Err(MouseError::CmdMismatch {
            expected,
            observed: *op,
        }),
        None => Err(MouseError::IoReadFail("empty response frame".to_string())),
    }
}

pub fn polling_code(hz: u32) -> Option<u8> {
    POLLING_CODES.iter().find(|(h, _)| *h == hz).map(|(_, c)| *c)
}

pub fn polling_from_code(code: u8) -> Option<u32> {
    POLLING_CODES.iter().find(|(_, c)| *c == code).map(|(h, _)| *h)
}

pub fn dpi_to_index(dpi: u16) -> u16 {
    (dpi.max(DPI_STEP) / DPI_STEP).saturating_sub(1)
}

pub fn dpi_from_index(index: u16) -> u16 {
    (index + 1) * DPI_STEP
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

fn mode_code(mode: PerfMode) -> u8 {
    match mode {
        PerfMode::Low => 0x00,
        PerfMode::Std => 0x01,
        PerfMode::Hp => 0x02,
        _ => 0x01,
    }
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

fn validate_perf_mode(changes: &ChangeSet, _next: &MouseConfig, caps: &Capabilities) -> Result<()> {
    if let Some(s) = changes.str_of(FeatureKey::PerformanceMode)? {
        let mode = PerfMode::parse(s)?;
        if !caps.perf_modes.contains(&mode) {
            return Err(MouseError::unsupported_with(
                "performanceMode",
                "low, std, hp",
            ));
        }
    }
    Ok(())
}

fn validate_sleep(changes: &ChangeSet, _next: &MouseConfig, caps: &Capabilities) -> Result<()> {
    if let Some(secs) = changes.u32_of(FeatureKey::SleepSeconds)? {
        let (lo, hi) = caps.sleep_minutes.unwrap_or((1, 15));
        if secs % 60 != 0 || secs / 60 < lo || secs / 60 > hi {
            return Err(MouseError::bad_param(
                "sleepSeconds",
                secs,
                format!("expected whole minutes, {lo}..={hi}"),
            ));
        }
    }
    Ok(())
}

fn enc_polling(v: &Value, _next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let hz = patch::as_u32("pollingHz", v)?;
    let code = polling_code(hz)
        .ok_or_else(|| MouseError::bad_param("pollingHz", hz, "no register code"))?;
    Ok(WriteSpec::new(OP_POLLING, 0x01, vec![code]))
}

fn enc_lod(_v: &Value, next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let lod = next
        .lod
        .ok_or_else(|| MouseError::bad_param("lodHeight", "none", "missing value"))?;
    Ok(WriteSpec::new(OP_LOD, 0x01, vec![lod_code(lod)]))
}

fn enc_perf_mode(_v: &Value, next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let mode = next.performance_mode.unwrap_or(PerfMode::Std);
    Ok(WriteSpec::new(OP_PERF_MODE, 0x01, vec![mode_code(mode)]))
}

fn enc_debounce(v: &Value, _next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let level = convert::debounce_from_value(v)?;
    Ok(WriteSpec::new(OP_DEBOUNCE, 0x01, vec![level.to_ms() as u8]))
}

fn enc_hyperclick(v: &Value, _next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let on = patch::as_bool("hyperclick", v)?;
    Ok(WriteSpec::new(OP_HYPERCLICK, 0x01, vec![u8::from(on)]))
}

fn enc_burst(v: &Value, _next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let ms = patch::as_u32("burstDelayMs", v)?;
    if ms > 2550 || ms % 10 != 0 {
        return Err(MouseError::bad_param(
            "burstDelayMs",
            ms,
            "expected a multiple of 10, at most 2550",
        ));
    }
    Ok(WriteSpec::new(OP_BURST, 0x01, vec![(ms / 10) as u8]))
}

fn enc_sleep(v: &Value, _next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let secs = patch::as_u32("sleepSeconds", v)?;
    Ok(WriteSpec::new(OP_SLEEP, 0x01, vec![(secs / 60) as u8]))
}

fn enc_led_enable(_v: &Value, next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let led = next.led_or_default();
    Ok(WriteSpec::new(OP_LED_ENABLE, 0x01, vec![u8::from(led.enabled)]))
}

fn enc_led_brightness(_v: &Value, next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let led = next.led_or_default();
    let code = convert::led_brightness_to_wire(u32::from(led.brightness))?;
    Ok(WriteSpec::new(OP_LED_BRIGHTNESS, 0x01, vec![code]))
}

fn enc_led_mode(_v: &Value, next: &MouseConfig, caps: &Capabilities) -> Result<WriteSpec> {
    let led = next.led_or_default();
    if !caps.led_modes.contains(&led.mode) {
        return Err(MouseError::bad_param(
            "ledMode",
            led.mode,
            format!("supported modes: {:?}", caps.led_modes),
        ));
    }
    Ok(WriteSpec::new(OP_LED_MODE, 0x01, vec![led.mode]))
}

fn enc_led_speed(_v: &Value, next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let led = next.led_or_default();
    let wire = convert::led_speed_to_wire(u32::from(led.speed))?;
    Ok(WriteSpec::new(OP_LED_SPEED, 0x01, vec![wire]))
}

fn enc_led_color(_v: &Value, next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let c = next.led_or_default().color;
    Ok(WriteSpec::new(OP_LED_COLOR, 0x03, vec![c.r, c.g, c.b]))
}

/* ------------------------------------------------------------------ */
/* Virtual plans                                                       */
/* ------------------------------------------------------------------ */

fn plan_dpi_profile(changes: &ChangeSet, next: &MouseConfig, ctx: &PlanCtx) -> Result<Vec<Command>> {
    let mut cmds = Vec::new();
    let slots = next.dpi_slots_x.clone().unwrap_or_default();

    let slot_write = |slot: u8, dpi: u16| {
        let packed = convert::dpi_index_packed(slot, dpi_to_index(dpi));
        Command::new(REPORT_ID, OP_DPI_VALUE, frame(OP_DPI_VALUE, &packed))
    };

    if let Some(v) = changes.get(FeatureKey::DpiSlot) {
        let obj = v
            .as_object()
            .ok_or_else(|| MouseError::bad_param("dpiSlot", v, "expected {slot, dpi}"))?;
        let slot = obj
            .get("slot")
            .map(|s| patch::as_u32("dpiSlot.slot", s))
            .transpose()?
            .unwrap_or(1);
        let index = slot.saturating_sub(1) as usize;
        let dpi = slots.get(index).copied().unwrap_or(800);
        cmds.push(slot_write(index as u8, dpi));
    } else if changes.contains(FeatureKey::DpiSlotsX) {
        for (index, dpi) in slots.iter().enumerate().take(ctx.caps.dpi_slot_max as usize) {
            cmds.push(slot_write(index as u8, *dpi));
        }
    }

    if changes.contains(FeatureKey::DpiSlotCount) {
        let count = next.dpi_slot_count.unwrap_or(ctx.caps.dpi_slot_max);
        cmds.push(Command::new(
            REPORT_ID,
            OP_DPI_COUNT,
            frame(OP_DPI_COUNT, &[count]),
        ));
    }
    if changes.contains(FeatureKey::CurrentDpiIndex) {
        let index = next.current_dpi_index.unwrap_or(0);
        cmds.push(Command::new(
            REPORT_ID,
            OP_DPI_INDEX,
            frame(OP_DPI_INDEX, &[index]),
        ));
    }

    Ok(cmds)
}

fn plan_buttons(changes: &ChangeSet, next: &MouseConfig, ctx: &PlanCtx) -> Result<Vec<Command>> {
    let buttons = next.buttons.clone().unwrap_or_default();
    let mut cmds = Vec::new();

    let write_one = |slot: u8, m: crate::config::ButtonMapping| {
        Command::new(
            REPORT_ID,
            OP_BUTTON,
            frame(OP_BUTTON, &[slot, m.funckey, m.keycode]),
        )
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
    let mut cmd = Command::new(REPORT_ID, spec.opcode, frame(spec.opcode, &spec.data))
        .wait_ms(spec.wait_ms);
    if spec.sensitive {
        cmd = cmd.sensitive();
    }
    cmd
}

fn dedup_key(cmd: &Command) -> DedupKey {
    let data0 = match cmd.opcode {
        OP_DPI_VALUE | OP_BUTTON => cmd.payload.get(1).copied(),
        _ => None,
    };
    DedupKey {
        report_id: cmd.report_id,
        opcode: cmd.opcode,
        len_or_idx: 0,
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
        kind: EntryKind::Direct,
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
        key: FeatureKey::LodHeight,
        kind: EntryKind::Direct,
        priority: 40,
        triggers: &[],
        validate: None,
        action: EntryAction::Encode(enc_lod),
    },
    FeatureEntry {
        key: FeatureKey::Hyperclick,
        kind: EntryKind::Direct,
        priority: 45,
        triggers: &[],
        validate: None,
        action: EntryAction::Encode(enc_hyperclick),
    },
    FeatureEntry {
        key: FeatureKey::BurstDelayMs,
        kind: EntryKind::Direct,
        priority: 46,
        triggers: &[],
        validate: None,
        action: EntryAction::Encode(enc_burst),
    },
    FeatureEntry {
        key: FeatureKey::SleepSeconds,
        kind: EntryKind::Direct,
        priority: 50,
        triggers: &[],
        validate: Some(validate_sleep),
        action: EntryAction::Encode(enc_sleep),
    },
    FeatureEntry {
        key: FeatureKey::DpiProfile,
        kind: EntryKind::Virtual,
        priority: 60,
        triggers: &[
            FeatureKey::DpiSlotsX,
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
        priority: 70,
        triggers: &[FeatureKey::ButtonMapping],
        validate: None,
        action: EntryAction::Plan(plan_buttons),
    },
    FeatureEntry {
        key: FeatureKey::LedEnabled,
        kind: EntryKind::Compound,
        priority: 80,
        triggers: &[],
        validate: None,
        action: EntryAction::Encode(enc_led_enable),
    },
    FeatureEntry {
        key: FeatureKey::LedBrightness,
        kind: EntryKind::Compound,
        priority: 81,
        triggers: &[],
        validate: None,
        action: EntryAction::Encode(enc_led_brightness),
    },
    FeatureEntry {
        key: FeatureKey::LedMode,
        kind: EntryKind::Compound,
        priority: 82,
        triggers: &[],
        validate: None,
        action: EntryAction::Encode(enc_led_mode),
    },
    FeatureEntry {
        key: FeatureKey::LedSpeed,
        kind: EntryKind::Compound,
        priority: 83,
        triggers: &[],
        validate: None,
        action: EntryAction::Encode(enc_led_speed),
    },
    FeatureEntry {
        key: FeatureKey::LedColor,
        kind: EntryKind::Compound,
        priority: 84,
        triggers: &[],
        validate: None,
        action: EntryAction::Encode(enc_led_color),
    },
];

static PATCH_KEYS: &[FeatureKey] = &[
    FeatureKey::PollingHz,
    FeatureKey::PerformanceMode,
    FeatureKey::LodHeight,
    FeatureKey::DebounceLevel,
    FeatureKey::DebounceMs,
    FeatureKey::Hyperclick,
    FeatureKey::BurstDelayMs,
    FeatureKey::SleepSeconds,
    FeatureKey::DpiSlotCount,
    FeatureKey::CurrentDpiIndex,
    FeatureKey::DpiSlotsX,
    FeatureKey::DpiSlot,
    FeatureKey::ButtonMappings,
    FeatureKey::ButtonMapping,
    FeatureKey::LedEnabled,
    FeatureKey::LedBrightness,
    FeatureKey::LedMode,
    FeatureKey::LedSpeed,
    FeatureKey::LedColor,
];

static MODES: &[PerfMode] = &[PerfMode::Low, PerfMode::Std, PerfMode::Hp];

static CAPABILITIES: Capabilities = Capabilities {
    vendor: Vendor::Pixart,
    polling_rates: &[125, 250, 500, 1000],
    perf_modes_by_polling: &[],
    perf_modes: MODES,
    dpi_min: 50,
    dpi_max: 26000,
    dpi_slot_max: 5,
    button_count: 5,
    sleep_minutes: Some((1, 15)),
    led_modes: &[0x00, 0x01, 0x02, 0x03],
    separate_xy_dpi: false,
    patch_keys: PATCH_KEYS,
};

static PROTOCOL: Protocol = Protocol {
    vendor: Vendor::Pixart,
    entries: ENTRIES,
    aliases: &[],
    expand: crate::features::expand_none,
    pack,
    dedup_key,
    gate: None,
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
        lod: Some(LodHeight::Low),
        debounce_level: Some(DebounceLevel::Mid),
        debounce_ms: Some(DebounceLevel::Mid.to_ms()),
        performance_mode: Some(PerfMode::Std),
        hyperclick: Some(false),
        burst_delay_ms: Some(0),
        sleep_seconds: Some(300),
        dpi_slot_count: Some(5),
        current_dpi_index: Some(0),
        dpi_slots_x: Some(vec![400, 800, 1600, 3200, 6400]),
        buttons: Some((0..5).map(crate::funckey::default_mapping).collect()),
        led: Some(LedState::default()),
        ..MouseConfig::default()
    }
}

/* ------------------------------------------------------------------ */
/* Read paths                                                          */
/* ------------------------------------------------------------------ */

async fn read_register(t: &Transport, opcode: u8) -> Result<Vec<u8>> {
    t.request_feature(REPORT_ID, &read_request(opcode), REPORT_ID, 10, move |raw| {
        parse_response(opcode, raw)
    })
    .await
}

pub async fn read_config(t: &Transport) -> Result<MouseConfig> {
    let mut config = MouseConfig::default();

    let polling = read_register(t, OP_POLLING).await?;
    config.polling_hz = polling.first().and_then(|c| polling_from_code(*c));

    let lod = read_register(t, OP_LOD).await?;
    config.lod = lod.first().and_then(|c| lod_from_code(*c));

    let perf = read_register(t, OP_PERF_MODE).await?;
    config.performance_mode = perf.first().and_then(|c| match c {
        0x00 => Some(PerfMode::Low),
        0x01 => Some(PerfMode::Std),
        0x02 => Some(PerfMode::Hp),
        _ => None,
    });

    let debounce = read_register(t, OP_DEBOUNCE).await?;
    if let Some(ms) = debounce.first() {
        config.debounce_level = DebounceLevel::from_ms(u32::from(*ms));
        config.debounce_ms = Some(u32::from(*ms));
    }

    let hyperclick = read_register(t, OP_HYPERCLICK).await?;
    config.hyperclick = hyperclick.first().map(|b| *b != 0);

    let burst = read_register(t, OP_BURST).await?;
    config.burst_delay_ms = burst.first().map(|b| u32::from(*b) * 10);

    let sleep = read_register(t, OP_SLEEP).await?;
    config.sleep_seconds = sleep.first().map(|m| u32::from(*m) * 60);

    let count = read_register(t, OP_DPI_COUNT).await?;
    config.dpi_slot_count = count.first().copied();

    let index = read_register(t, OP_DPI_INDEX).await?;
    config.current_dpi_index = index.first().copied();

    let mut slots = Vec::new();
    for slot in 0..CAPABILITIES.dpi_slot_max {
        let reply = t
            .request_feature(
                REPORT_ID,
                &frame(OP_DPI_VALUE, &[slot]),
                REPORT_ID,
                10,
                move |raw| parse_response(OP_DPI_VALUE, raw),
            )
            .await?;
        if reply.len() >= 2 {
            let (_, dpi_index) = convert::dpi_index_unpacked(reply[0], reply[1]);
            slots.push(dpi_from_index(dpi_index));
        } else {
            slots.push(800);
        }
    }
    config.dpi_slots_x = Some(slots);

    /* Button registers answer only inside the unlock bracket, and a
     * stale frame there is a failure, not a drain. */
    t.send_gate(&READ_GATE, true).await?;
    let mut buttons = Vec::new();
    for slot in 0..CAPABILITIES.button_count {
        let reply = t
            .request_feature_strict(
                REPORT_ID,
                &frame(OP_BUTTON, &[slot]),
                REPORT_ID,
                10,
                move |raw| parse_response(OP_BUTTON, raw),
            )
            .await;
        match reply {
            Ok(data) if data.len() >= 3 => buttons.push(crate::config::ButtonMapping {
                funckey: data[1],
                keycode: data[2],
            }),
            Ok(_) => buttons.push(crate::funckey::default_mapping(slot)),
            Err(err) => {
                t.send_gate(&READ_GATE, false).await.ok();
                return Err(err);
            }
        }
    }
    t.send_gate(&READ_GATE, false).await?;
    config.buttons = Some(buttons);

    let led_enable = read_register(t, OP_LED_ENABLE).await?;
    let brightness = read_register(t, OP_LED_BRIGHTNESS).await?;
    let mode = read_register(t, OP_LED_MODE).await?;
    let speed = read_register(t, OP_LED_SPEED).await?;
    let color = read_register(t, OP_LED_COLOR).await?;
    config.led = Some(LedState {
        enabled: led_enable.first().is_some_and(|b| *b != 0),
        brightness: brightness
            .first()
            .and_then(|c| convert::led_brightness_from_wire(*c))
            .unwrap_or(100),
        mode: mode.first().copied().unwrap_or(0),
        speed: speed.first().map(|b| convert::led_speed_from_wire(*b)).unwrap_or(10),
        color: if color.len() >= 3 {
            Rgb::new(color[0], color[1], color[2])
        } else {
            Rgb::new(0xFF, 0xFF, 0xFF)
        },
    });

    let fw_main = read_register(t, OP_FIRMWARE_MAIN).await?;
    let fw_wireless = read_register(t, OP_FIRMWARE_WIRELESS).await?;
    config.firmware = Some(FirmwareInfo {
        main: firmware_string(&fw_main),
        wireless: firmware_string(&fw_wireless),
    });

    let battery = read_register(t, OP_BATTERY).await?;
    if let Some(percent) = battery.first() {
        config.battery = Some(BatteryState {
            percent: (*percent).min(100),
            charging: false,
        });
    }

    Ok(config)
}

fn firmware_string(data: &[u8]) -> String {
    match data {
        [major, minor, ..] => format!("{major}.{minor}"),
        _ => String::new(),
    }
}

/* Polled battery only: the percent byte leads the response data and
 * the family reports no charging bit. */
pub async fn read_battery(t: &Transport) -> Result<BatteryState> {
    let data = read_register(t, OP_BATTERY).await?;
    let percent = data
        .first()
        .copied()
        .ok_or_else(|| MouseError::IoReadFail("battery frame too short".to_string()))?;
    Ok(BatteryState {
        percent: percent.min(100),
        charging: false,
    })
}

/* Nothing is pushed by this family. */
pub fn parse_input(_report: &crate::hid::InputReport) -> Option<InputEvent> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Patch;
    use crate::planner;
    use crate::testing::{MockDevice, MockReaction};
    use crate::transport::TransportConfig;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn frame_is_fixed_length_with_opcode_first() {
        let f = frame(OP_POLLING, &[0x01]);
        assert_eq!(f.len(), FRAME_LEN);
        assert_eq!(f[0], OP_POLLING);
        assert_eq!(f[1], 0x01);
        assert!(f[2..].iter().all(|b| *b == 0));
    }

    #[test]
    fn dpi_index_table_roundtrip() {
        for dpi in [50u16, 400, 800, 1600, 3200, 26000] {
            assert_eq!(dpi_from_index(dpi_to_index(dpi)), dpi, "dpi {dpi}");
        }
        assert_eq!(dpi_to_index(800), 15);
    }

    #[test]
    fn polling_interval_codes() {
        assert_eq!(polling_code(1000), Some(1));
        assert_eq!(polling_code(125), Some(8));
        assert_eq!(polling_from_code(2), Some(500));
        assert!(polling_code(2000).is_none());
    }

    #[test]
    fn led_speed_write_uses_inverted_register() {
        for (semantic, wire) in [(0u64, 20u8), (20, 0), (13, 7)] {
            let result = planner::plan(
                protocol(),
                capabilities(),
                &default_config(),
                &Patch::new().set("ledSpeed", semantic),
            )
            .unwrap();
            let cmd = result
                .commands
                .iter()
                .find(|c| c.opcode == OP_LED_SPEED)
                .unwrap();
            assert_eq!(cmd.payload[1], wire, "speed {semantic}");
        }
    }

    #[test]
    fn led_brightness_uses_quarter_codes() {
        let result = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("ledBrightness", 75),
        )
        .unwrap();
        let cmd = result
            .commands
            .iter()
            .find(|c| c.opcode == OP_LED_BRIGHTNESS)
            .unwrap();
        assert_eq!(cmd.payload[1], 3);

        let err = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("ledBrightness", 60),
        )
        .unwrap_err();
        assert!(matches!(err, MouseError::BadParam { .. }));
    }

    #[test]
    fn sleep_minutes_validate_range() {
        for bad in [90u64, 16 * 60, 0] {
            let err = planner::plan(
                protocol(),
                capabilities(),
                &default_config(),
                &Patch::new().set("sleepSeconds", bad),
            )
            .unwrap_err();
            assert!(matches!(err, MouseError::BadParam { .. }), "input {bad}");
        }
        let ok = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("sleepSeconds", 15 * 60),
        )
        .unwrap();
        assert_eq!(ok.commands[0].payload[1], 15);
    }

    #[test]
    fn dpi_slot_write_packs_slot_and_index() {
        let result = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("dpi_slot", json!({"slot": 3, "dpi": 1600})),
        )
        .unwrap();
        let cmd = result
            .commands
            .iter()
            .find(|c| c.opcode == OP_DPI_VALUE)
            .unwrap();
        /* slot 2, index 31: hi = (31 >> 8) | (2 << 5) = 0x40, lo = 0x1F */
        assert_eq!(cmd.payload[1], 0x40);
        assert_eq!(cmd.payload[2], 0x1F);
    }

    #[tokio::test]
    async fn battery_read_parses_percent_from_feature_report() {
        let dev = Arc::new(MockDevice::new(0x093A, 0xEB02));
        dev.set_on_send(|_, data| {
            if data.first() == Some(&OP_BATTERY) {
                let mut reply = vec![0u8; 64];
                reply[0] = OP_BATTERY;
                reply[1] = 87;
                vec![MockReaction::FeatureReply(REPORT_ID, reply)]
            } else {
                vec![]
            }
        });
        let t = crate::transport::Transport::new(
            dev.clone(),
            TransportConfig {
                send_timeout_ms: 200,
                ack_timeout_ms: 40,
                drain_timeout_ms: 40,
                drain_reads: 2,
                ack_retry_count: 1,
            },
            None,
        );
        let battery = read_battery(&t).await.unwrap();
        assert_eq!(battery.percent, 87);
        assert!(!battery.charging);

        /* The request was a read frame carrying only the opcode. */
        let sent = dev.sent();
        assert_eq!(sent[0].1[0], OP_BATTERY);
        assert!(sent[0].1[1..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn button_reads_are_bracketed_by_the_gate() {
        let dev = Arc::new(MockDevice::new(0x093A, 0xEB02));
        dev.set_on_send(|_, data| {
            let opcode = data.first().copied().unwrap_or(0);
            match opcode {
                OP_UNLOCK | OP_LOCK => vec![],
                OP_BUTTON => {
                    let slot = data.get(1).copied().unwrap_or(0);
                    vec![MockReaction::FeatureReply(
                        REPORT_ID,
                        vec![OP_BUTTON, slot, 0x11, 0x01],
                    )]
                }
                OP_DPI_VALUE => {
                    let slot = data.get(1).copied().unwrap_or(0);
                    let packed = crate::convert::dpi_index_packed(slot, 15);
                    vec![MockReaction::FeatureReply(
                        REPORT_ID,
                        vec![OP_DPI_VALUE, packed[0], packed[1]],
                    )]
                }
                op => {
                    /* Every plain register read answers with its echo
                     * and a single plausible value byte. */
                    vec![MockReaction::FeatureReply(REPORT_ID, vec![op, 0x01, 0x00, 0x00])]
                }
            }
        });
        let t = crate::transport::Transport::new(
            dev.clone(),
            TransportConfig {
                send_timeout_ms: 200,
                ack_timeout_ms: 40,
                drain_timeout_ms: 40,
                drain_reads: 2,
                ack_retry_count: 1,
            },
            None,
        );
        let config = read_config(&t).await.unwrap();
        assert_eq!(config.buttons.as_ref().unwrap().len(), 5);

        let opcodes: Vec<u8> = dev.sent().iter().map(|(_, d)| d[0]).collect();
        let unlock = opcodes.iter().position(|o| *o == OP_UNLOCK).unwrap();
        let lock = opcodes.iter().position(|o| *o == OP_LOCK).unwrap();
        let first_button = opcodes.iter().position(|o| *o == OP_BUTTON).unwrap();
        let last_button = opcodes.iter().rposition(|o| *o == OP_BUTTON).unwrap();
        assert!(unlock < first_button && last_button < lock);
    }
}
