/* Rapoo register family (VID 0x24AE).
 *
 * Bank/address register protocol behind an `A5 A5` (write) / `A5 A4`
 * (read) preamble: length, address, bank, two reserved bytes, then
 * data. Frames are built at their natural length and right-padded by
 * the transport to whatever report length the host stack accepts.
 * Firmware quirk: the DPI table must land in two banks, and the second
 * write only takes if it arrives a beat after the first; that delay
 * lives on the second command and nowhere else. */

use serde_json::Value;

use crate::command::{Command, WriteSpec};
use crate::config::{
    BatteryState, Capabilities, DebounceLevel, FirmwareInfo, LodHeight, MouseConfig,
};
use crate::convert;
use crate::error::{MouseError, Result};
use crate::features::{DedupKey, EntryAction, EntryKind, FeatureEntry, PlanCtx, Protocol};
use crate::patch::{self, ChangeSet, FeatureKey};
use crate::protocol::{InputEvent, Vendor};
use crate::transport::Transport;

pub const REPORT_ID: u8 = 0x07;
pub const FEATURE_REPORT_ID: u8 = 0x08;
pub const BATTERY_INPUT_ID: u8 = 0x07;

pub const PREAMBLE: u8 = 0xA5;
pub const DIR_WRITE: u8 = 0xA5;
pub const DIR_READ: u8 = 0xA4;

/* Banks. */
pub const BANK_FIRMWARE: u8 = 0x01;
pub const BANK_DPI_A: u8 = 0x04;
pub const BANK_DPI_B: u8 = 0x05;
pub const BANK_BUTTONS: u8 = 0x06;
pub const BANK_SETTINGS: u8 = 0x08;

/* Settings-bank addresses. */
pub const ADDR_POLLING: u8 = 0x80;
pub const ADDR_LOD: u8 = 0x84;
pub const ADDR_RIPPLE: u8 = 0x85;
pub const ADDR_DEBOUNCE: u8 = 0x88;
pub const ADDR_BATTERY: u8 = 0x90;

/* The second DPI bank only takes after this settle. */
pub const DPI_BANK_B_DELAY_MS: u16 = 20;

const POLLING_CODES: &[(u32, u8)] = &[(125, 8), (250, 4), (500, 2), (1000, 1)];

/* ------------------------------------------------------------------ */
/* Codec                                                               */
/* ------------------------------------------------------------------ */

pub fn write_frame(bank: u8, addr: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + data.len());
    buf.push(PREAMBLE);
    buf.push(DIR_WRITE);
    buf.push(data.len() as u8);
    buf.push(addr);
    buf.push(bank);
    buf.push(0x00);
    buf.push(0x00);
    buf.extend_from_slice(data);
    if buf.len() < 8 {
        buf.resize(8, 0x00);
    }
    buf
}

pub fn read_frame(bank: u8, addr: u8, len: u8) -> Vec<u8> {
    vec![PREAMBLE, DIR_READ, len, addr, bank, 0x00, 0x00, 0x00]
}

/* Read replies echo `[preamble, addr, bank, len, data...]`. */
pub fn parse_reply(bank: u8, addr: u8, raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < 4 || raw[0] != PREAMBLE {
        return Err(MouseError::IoReadFail(format!(
            "malformed register reply: {raw:02x?}"
        )));
    }
    if raw[1] != addr || raw[2] != bank {
        return Err(MouseError::CmdMismatch {
            expected: addr,
            observed: raw[1],
        });
    }
    let len = raw[3] as usize;
    let end = (4 + len).min(raw.len());
    Ok(raw[4..end].to_vec())
}

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

/* The alternate millimetre packing for the LOD register is
 * `round(mm * 10) - 6` over 0.7–1.7 mm. It shares the register with
 * the level codes above and the two encodings are mutually exclusive,
 * so millimetre input is rejected rather than silently guessed at;
 * the formula stays here for the day firmware demands it. */
fn expand(changes: &mut ChangeSet, _prev: &MouseConfig, _caps: &Capabilities) -> Result<()> {
    if let Some(v) = changes.get(FeatureKey::LodHeight) {
        if v.is_number() {
            return Err(MouseError::bad_param(
                "lodHeight",
                v,
                "expected one of low/mid/high (millimetre input is not accepted)",
            ));
        }
    }
    Ok(())
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

fn enc_polling(v: &Value, _next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let hz = patch::as_u32("pollingHz", v)?;
    let code = polling_code(hz)
        .ok_or_else(|| MouseError::bad_param("pollingHz", hz, "no register code"))?;
    Ok(WriteSpec::new(ADDR_POLLING, BANK_SETTINGS, vec![code]))
}

fn enc_lod(_v: &Value, next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let lod = next
        .lod
        .ok_or_else(|| MouseError::bad_param("lodHeight", "none", "missing value"))?;
    Ok(WriteSpec::new(ADDR_LOD, BANK_SETTINGS, vec![lod_code(lod)]))
}

fn enc_ripple(v: &Value, _next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let on = patch::as_bool("rippleControl", v)?;
    Ok(WriteSpec::new(ADDR_RIPPLE, BANK_SETTINGS, vec![u8::from(on)]))
}

fn enc_debounce(v: &Value, _next: &MouseConfig, _caps: &Capabilities) -> Result<WriteSpec> {
    let level = convert::debounce_from_value(v)?;
    Ok(WriteSpec::new(ADDR_DEBOUNCE, BANK_SETTINGS, vec![level.to_ms() as u8]))
}

/* ------------------------------------------------------------------ */
/* Virtual plans                                                       */
/* ------------------------------------------------------------------ */

/* The full DPI table image: slot count, active index, then the five
 * u16 LE slot values. */
fn dpi_table_image(next: &MouseConfig, caps: &Capabilities) -> Vec<u8> {
    let slots = next.dpi_slots_x.clone().unwrap_or_default();
    let mut image = vec![
        next.dpi_slot_count.unwrap_or(caps.dpi_slot_max),
        next.current_dpi_index.unwrap_or(0),
    ];
    for slot in 0..caps.dpi_slot_max as usize {
        let dpi = slots.get(slot).copied().unwrap_or(800);
        image.extend_from_slice(&convert::dpi_to_le(dpi));
    }
    image
}

/* The same table goes to both banks; only the bank byte and the
 * inter-write settle differ. */
fn plan_dpi_profile(_changes: &ChangeSet, next: &MouseConfig, ctx: &PlanCtx) -> Result<Vec<Command>> {
    let image = dpi_table_image(next, ctx.caps);
    Ok(vec![
        Command::new(REPORT_ID, 0x00, write_frame(BANK_DPI_A, 0x00, &image)),
        Command::new(REPORT_ID, 0x00, write_frame(BANK_DPI_B, 0x00, &image))
            .wait_ms(DPI_BANK_B_DELAY_MS),
    ])
}

fn plan_buttons(changes: &ChangeSet, next: &MouseConfig, ctx: &PlanCtx) -> Result<Vec<Command>> {
    let buttons = next.buttons.clone().unwrap_or_default();
    let mut cmds = Vec::new();

    let write_one = |slot: u8, m: crate::config::ButtonMapping| {
        Command::new(
            REPORT_ID,
            slot,
            write_frame(BANK_BUTTONS, slot, &[m.funckey, m.keycode]),
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
    /* WriteSpec reuse for a bank protocol: `opcode` is the address,
     * `len_or_idx` the bank. */
    let mut cmd = Command::new(
        REPORT_ID,
        spec.opcode,
        write_frame(spec.len_or_idx, spec.opcode, &spec.data),
    )
    .wait_ms(spec.wait_ms);
    if spec.sensitive {
        cmd = cmd.sensitive();
    }
    cmd
}

/* Key on `(address, bank)`; button writes also carry the slot. */
fn dedup_key(cmd: &Command) -> DedupKey {
    let addr = cmd.payload.get(3).copied().unwrap_or(0);
    let bank = cmd.payload.get(4).copied().unwrap_or(0);
    let data0 = (bank == BANK_BUTTONS).then_some(addr);
    DedupKey {
        report_id: cmd.report_id,
        opcode: addr,
        len_or_idx: bank,
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
        key: FeatureKey::RippleControl,
        kind: EntryKind::Direct,
        priority: 50,
        triggers: &[],
        validate: None,
        action: EntryAction::Encode(enc_ripple),
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
];

static PATCH_KEYS: &[FeatureKey] = &[
    FeatureKey::PollingHz,
    FeatureKey::LodHeight,
    FeatureKey::DebounceLevel,
    FeatureKey::DebounceMs,
    FeatureKey::RippleControl,
    FeatureKey::DpiSlotCount,
    FeatureKey::CurrentDpiIndex,
    FeatureKey::DpiSlotsX,
    FeatureKey::DpiSlot,
    FeatureKey::ButtonMappings,
    FeatureKey::ButtonMapping,
];

static CAPABILITIES: Capabilities = Capabilities {
    vendor: Vendor::Rapoo,
    polling_rates: &[125, 250, 500, 1000],
    perf_modes_by_polling: &[],
    perf_modes: &[],
    dpi_min: 100,
    dpi_max: 16000,
    dpi_slot_max: 5,
    button_count: 5,
    sleep_minutes: None,
    led_modes: &[],
    separate_xy_dpi: false,
    patch_keys: PATCH_KEYS,
};

static PROTOCOL: Protocol = Protocol {
    vendor: Vendor::Rapoo,
    entries: ENTRIES,
    aliases: &[],
    expand,
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
        ripple_control: Some(false),
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

async fn read_register(t: &Transport, bank: u8, addr: u8, len: u8) -> Result<Vec<u8>> {
    t.request_feature(
        REPORT_ID,
        &read_frame(bank, addr, len),
        FEATURE_REPORT_ID,
        10,
        move |raw| parse_reply(bank, addr, raw),
    )
    .await
}

pub async fn read_config(t: &Transport) -> Result<MouseConfig> {
    let mut config = MouseConfig::default();

    let polling = read_register(t, BANK_SETTINGS, ADDR_POLLING, 1).await?;
    config.polling_hz = polling.first().and_then(|c| polling_from_code(*c));

    let lod = read_register(t, BANK_SETTINGS, ADDR_LOD, 1).await?;
    config.lod = lod.first().and_then(|c| lod_from_code(*c));

    let ripple = read_register(t, BANK_SETTINGS, ADDR_RIPPLE, 1).await?;
    config.ripple_control = ripple.first().map(|b| *b != 0);

    let debounce = read_register(t, BANK_SETTINGS, ADDR_DEBOUNCE, 1).await?;
    if let Some(ms) = debounce.first() {
        config.debounce_level = DebounceLevel::from_ms(u32::from(*ms));
        config.debounce_ms = Some(u32::from(*ms));
    }

    let table = read_register(t, BANK_DPI_A, 0x00, 12).await?;
    if table.len() >= 2 {
        config.dpi_slot_count = Some(table[0]);
        config.current_dpi_index = Some(table[1]);
        let mut slots = Vec::new();
        for chunk in table[2..].chunks_exact(2) {
            slots.push(convert::dpi_from_le(chunk[0], chunk[1]));
        }
        if !slots.is_empty() {
            config.dpi_slots_x = Some(slots);
        }
    }

    let mut buttons = Vec::new();
    for slot in 0..CAPABILITIES.button_count {
        let reply = read_register(t, BANK_BUTTONS, slot, 2).await?;
        if reply.len() >= 2 {
            buttons.push(crate::config::ButtonMapping {
                funckey: reply[0],
                keycode: reply[1],
            });
        } else {
            buttons.push(crate::funckey::default_mapping(slot));
        }
    }
    config.buttons = Some(buttons);

    let firmware = read_register(t, BANK_FIRMWARE, 0x00, 2).await?;
    if firmware.len() >= 2 {
        config.firmware = Some(FirmwareInfo {
            main: format!("{}.{}", firmware[0], firmware[1]),
            wireless: String::new(),
        });
    }

    Ok(config)
}

pub async fn read_battery(t: &Transport) -> Result<BatteryState> {
    let reply = read_register(t, BANK_SETTINGS, ADDR_BATTERY, 2).await?;
    let percent = reply
        .first()
        .copied()
        .ok_or_else(|| MouseError::IoReadFail("battery frame too short".to_string()))?;
    Ok(BatteryState {
        percent: percent.min(100),
        charging: reply.get(1).is_some_and(|b| *b != 0),
    })
}

/* Battery rides on input report 7, percent at payload byte 7. */
pub fn parse_input(report: &crate::hid::InputReport) -> Option<InputEvent> {
    if report.report_id != BATTERY_INPUT_ID {
        return None;
    }
    let percent = report.data.get(7).copied()?;
    Some(InputEvent::Battery(BatteryState {
        percent: percent.min(100),
        charging: report.data.get(8).is_some_and(|b| *b != 0),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Patch;
    use crate::planner;
    use serde_json::json;

    #[test]
    fn write_frame_layout() {
        let f = write_frame(BANK_SETTINGS, ADDR_LOD, &[0x01]);
        assert_eq!(&f[..8], &[0xA5, 0xA5, 0x01, 0x84, 0x08, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn read_frame_uses_a4_direction() {
        let f = read_frame(BANK_SETTINGS, ADDR_POLLING, 1);
        assert_eq!(&f[..5], &[0xA5, 0xA4, 0x01, 0x80, 0x08]);
    }

    #[test]
    fn reply_parsing_checks_bank_and_addr() {
        let raw = [0xA5, ADDR_LOD, BANK_SETTINGS, 0x01, 0x02, 0x00];
        assert_eq!(parse_reply(BANK_SETTINGS, ADDR_LOD, &raw).unwrap(), vec![0x02]);

        let raw = [0xA5, ADDR_RIPPLE, BANK_SETTINGS, 0x01, 0x02];
        assert!(matches!(
            parse_reply(BANK_SETTINGS, ADDR_LOD, &raw),
            Err(MouseError::CmdMismatch { .. })
        ));

        assert!(parse_reply(BANK_SETTINGS, ADDR_LOD, &[0x00]).is_err());
    }

    #[test]
    fn lod_and_ripple_in_one_patch() {
        let result = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new()
                .set("lodHeight", "low")
                .set("rippleControl", true),
        )
        .unwrap();
        assert_eq!(result.commands.len(), 2);

        /* Same priority; entry-table order keeps the emission
         * deterministic: LOD then ripple. */
        let lod = &result.commands[0];
        assert_eq!(lod.payload[3], ADDR_LOD);
        assert_eq!(lod.payload[4], BANK_SETTINGS);
        assert_eq!(lod.payload[7], 0x01);

        let ripple = &result.commands[1];
        assert_eq!(ripple.payload[3], ADDR_RIPPLE);
        assert_eq!(ripple.payload[4], BANK_SETTINGS);
        assert_eq!(ripple.payload[7], 0x01);

        assert!(result.commands.iter().all(|c| !c.sensitive && !c.secure_gate));
    }

    #[test]
    fn millimetre_lod_input_is_rejected() {
        let err = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("lodHeight", 1.2),
        )
        .unwrap_err();
        let MouseError::BadParam { reason, .. } = err else {
            panic!("expected BadParam");
        };
        assert!(reason.contains("low/mid/high"));
    }

    #[test]
    fn dpi_table_is_written_to_both_banks_with_settle() {
        let result = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("dpiSlots", json!([400, 800, 1600, 3200, 6400])),
        )
        .unwrap();
        assert_eq!(result.commands.len(), 2);

        let a = &result.commands[0];
        let b = &result.commands[1];
        assert_eq!(a.payload[4], BANK_DPI_A);
        assert_eq!(b.payload[4], BANK_DPI_B);
        assert_eq!(a.wait_ms, 0);
        assert_eq!(b.wait_ms, DPI_BANK_B_DELAY_MS);

        /* Same image in both banks. */
        assert_eq!(a.payload[7..], b.payload[7..]);
        /* count, index, then 400 as u16 LE. */
        assert_eq!(&a.payload[7..11], &[5, 0, 0x90, 0x01]);
    }

    #[test]
    fn battery_input_report_decodes_byte_seven() {
        let report = crate::hid::InputReport {
            report_id: BATTERY_INPUT_ID,
            data: vec![0, 0, 0, 0, 0, 0, 0, 64, 1],
        };
        assert_eq!(
            parse_input(&report),
            Some(InputEvent::Battery(BatteryState {
                percent: 64,
                charging: true,
            }))
        );

        let other = crate::hid::InputReport {
            report_id: 0x02,
            data: vec![0; 9],
        };
        assert_eq!(parse_input(&other), None);
    }
}
