/* CompX dongle family (VID 0x373B / 0x3710).
 *
 * Same 64-byte framing and response layouts as the nordic family
 * (the codec is reused wholesale), but a smaller register map, no
 * secure gate, and wired-class polling rates only. */

use serde_json::Value;

use crate::command::{Command, WriteSpec};
use crate::config::{
    BatteryState, Capabilities, DebounceLevel, LodHeight, MouseConfig,
};
use crate::convert;
use crate::error::{MouseError, Result};
use crate::features::{DedupKey, EntryAction, EntryKind, FeatureEntry, PlanCtx, Protocol};
use crate::patch::{self, ChangeSet, FeatureKey};
use crate::protocol::nordic::{
    parse_response, read_frame, write_frame, OP_BATTERY, OP_DEBOUNCE, OP_DPI_SELECT, OP_DPI_VALUE,
    OP_LOD, OP_POLLING,
};
use crate::protocol::{InputEvent, Vendor};
use crate::transport::Transport;

pub const REPORT_ID: u8 = 0x05;

const IDX_ONE: u8 = 0x01;
const IDX_DPI_WRITE: u8 = 0x04;
const IDX_DPI_SELECT: u8 = 0x02;

/* Wired-class rates store the report interval directly. */
const POLLING_CODES: &[(u32, u8)] = &[(125, 8), (250, 4), (500, 2), (1000, 1)];

pub fn polling_code(hz: u32) -> Option<u8> {
    POLLING_CODES.iter().find(|(h, _)| *h == hz).map(|(_, c)| *c)
}

pub fn polling_from_code(code: u8) -> Option<u32> {
    POLLING_CODES.iter().find(|(_, c)| *c == code).map(|(h, _)| *h)
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

/* ------------------------------------------------------------------ */
/* Validators, encoders, plans                                         */
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

fn enc_polling(v: &Value, _next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let hz = patch::as_u32("pollingHz", v)?;
    let code = polling_code(hz)
        .ok_or_else(|| MouseError::bad_param("pollingHz", hz, "no register code"))?;
    Ok(WriteSpec::new(OP_POLLING, IDX_ONE, vec![code]))
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

fn plan_dpi_profile(changes: &ChangeSet, next: &MouseConfig, ctx: &PlanCtx) -> Result<Vec<Command>> {
    let mut cmds = Vec::new();
    let slots = next.dpi_slots_x.clone().unwrap_or_default();

    let slot_write = |slot: u8, dpi: u16| {
        let le = convert::dpi_to_le(dpi);
        Command::new(
            REPORT_ID,
            OP_DPI_VALUE,
            write_frame(OP_DPI_VALUE, IDX_DPI_WRITE, &[slot, le[0], le[1]]),
        )
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

    if changes.contains(FeatureKey::DpiSlotCount) || changes.contains(FeatureKey::CurrentDpiIndex) {
        let count = next.dpi_slot_count.unwrap_or(ctx.caps.dpi_slot_max);
        let index = next.current_dpi_index.unwrap_or(0);
        cmds.push(Command::new(
            REPORT_ID,
            OP_DPI_SELECT,
            write_frame(OP_DPI_SELECT, IDX_DPI_SELECT, &[count, index]),
        ));
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

fn dedup_key(cmd: &Command) -> DedupKey {
    let data0 = (cmd.opcode == OP_DPI_VALUE)
        .then(|| cmd.payload.get(7).copied())
        .flatten();
    DedupKey {
        report_id: cmd.report_id,
        opcode: cmd.opcode,
        len_or_idx: cmd.payload.get(5).copied().unwrap_or(0),
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
        priority: 50,
        triggers: &[],
        validate: None,
        action: EntryAction::Encode(enc_lod),
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
];

static PATCH_KEYS: &[FeatureKey] = &[
    FeatureKey::PollingHz,
    FeatureKey::LodHeight,
    FeatureKey::DebounceLevel,
    FeatureKey::DebounceMs,
    FeatureKey::DpiSlotCount,
    FeatureKey::CurrentDpiIndex,
    FeatureKey::DpiSlotsX,
    FeatureKey::DpiSlot,
];

static CAPABILITIES: Capabilities = Capabilities {
    vendor: Vendor::Compx,
    polling_rates: &[125, 250, 500, 1000],
    perf_modes_by_polling: &[],
    perf_modes: &[],
    dpi_min: 100,
    dpi_max: 12000,
    dpi_slot_max: 4,
    button_count: 5,
    sleep_minutes: None,
    led_modes: &[],
    separate_xy_dpi: false,
    patch_keys: PATCH_KEYS,
};

static PROTOCOL: Protocol = Protocol {
    vendor: Vendor::Compx,
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
        dpi_slot_count: Some(4),
        current_dpi_index: Some(0),
        dpi_slots_x: Some(vec![800, 1600, 3200, 6400]),
        ..MouseConfig::default()
    }
}

/* ------------------------------------------------------------------ */
/* Read paths                                                          */
/* ------------------------------------------------------------------ */

async fn read_register(t: &Transport, opcode: u8, len_or_idx: u8) -> Result<Vec<u8>> {
    t.request_feature(
        REPORT_ID,
        &read_frame(opcode, len_or_idx),
        REPORT_ID,
        10,
        move |raw| parse_response(opcode, raw).map(|r| r.data),
    )
    .await
}

pub async fn read_config(t: &Transport) -> Result<MouseConfig> {
    let mut config = MouseConfig::default();

    let polling = read_register(t, OP_POLLING, IDX_ONE).await?;
    config.polling_hz = polling.first().and_then(|c| polling_from_code(*c));

    let lod = read_register(t, OP_LOD, IDX_ONE).await?;
    config.lod = lod.first().and_then(|c| lod_from_code(*c));

    let debounce = read_register(t, OP_DEBOUNCE, IDX_ONE).await?;
    if let Some(ms) = debounce.first() {
        config.debounce_level = DebounceLevel::from_ms(u32::from(*ms));
        config.debounce_ms = Some(u32::from(*ms));
    }

    let select = read_register(t, OP_DPI_SELECT, IDX_DPI_SELECT).await?;
    if select.len() >= 2 {
        config.dpi_slot_count = Some(select[0]);
        config.current_dpi_index = Some(select[1]);
    }

    let mut slots = Vec::new();
    for slot in 0..CAPABILITIES.dpi_slot_max {
        let reply = read_register(t, OP_DPI_VALUE, slot).await?;
        if reply.len() >= 3 {
            slots.push(convert::dpi_from_le(reply[1], reply[2]));
        }
    }
    if !slots.is_empty() {
        config.dpi_slots_x = Some(slots);
    }

    Ok(config)
}

pub async fn read_battery(t: &Transport) -> Result<BatteryState> {
    let reply = read_register(t, OP_BATTERY, IDX_ONE).await?;
    let percent = reply
        .first()
        .copied()
        .ok_or_else(|| MouseError::IoReadFail("battery frame too short".to_string()))?;
    Ok(BatteryState {
        percent: percent.min(100),
        charging: reply.get(1).is_some_and(|b| *b != 0),
    })
}

/* This family pushes nothing of interest. */
pub fn parse_input(_report: &crate::hid::InputReport) -> Option<InputEvent> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Patch;
    use crate::planner;
    use serde_json::json;

    #[test]
    fn shares_the_nordic_frame_layout() {
        let result = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("pollingHz", 500),
        )
        .unwrap();
        let cmd = &result.commands[0];
        assert_eq!(cmd.payload.len(), 64);
        assert_eq!(cmd.payload[0], OP_POLLING);
        assert_eq!(&cmd.payload[1..5], &[0x00, 0x00, 0x01, 0x00]);
        assert_eq!(cmd.payload[7], 2);
    }

    #[test]
    fn no_secure_gate_on_dpi_writes() {
        let result = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("dpi_slot", json!({"slot": 2, "dpi": 1600})),
        )
        .unwrap();
        assert_eq!(result.commands.len(), 1);
        assert!(result.commands.iter().all(|c| !c.secure_gate));
        assert_eq!(result.commands[0].payload[7], 0x01);
    }

    #[test]
    fn dongle_rates_are_capped_at_wired_speeds() {
        let err = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("pollingHz", 8000),
        )
        .unwrap_err();
        assert!(matches!(err, MouseError::BadParam { .. }));
    }

    #[test]
    fn dpi_table_respects_the_four_slot_cap() {
        let result = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("dpiSlots", json!([400, 800, 1600, 3200, 6400, 12800])),
        )
        .unwrap();
        let writes: Vec<_> = result
            .commands
            .iter()
            .filter(|c| c.opcode == OP_DPI_VALUE)
            .collect();
        assert_eq!(writes.len(), 4);
    }
}
