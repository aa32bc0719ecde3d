/* HID++ family (VID 0x046D).
 *
 * Short (7-byte) and long (19-byte) request payloads; the HID report id
 * (0x10 / 0x11) selects the frame and travels out of band. Settings
 * persist in a 256-byte on-board profile image that is rewritten
 * atomically: Start, Header, sixteen 16-byte chunks, Commit, each
 * acknowledged by an input report. Losing any ack fails the whole
 * stream; the transport replays it from Start, never chunk by chunk.
 * The image ends in a CRC-16/CCITT-FALSE over bytes 0..252, stored
 * big-endian at 253–254. */

use tracing::warn;

use crate::command::{AckMatcher, Command, WriteSpec};
use crate::config::{
    BatteryState, Capabilities, LodHeight, MouseConfig,
};
use crate::convert;
use crate::error::{MouseError, Result};
use crate::features::{DedupKey, EntryAction, EntryKind, FeatureEntry, PlanCtx, Protocol};
use crate::funckey;
use crate::patch::{ChangeSet, FeatureKey};
use crate::protocol::{InputEvent, Vendor};
use crate::transport::Transport;

pub const REPORT_ID_SHORT: u8 = 0x10;
pub const REPORT_ID_LONG: u8 = 0x11;

pub const SHORT_LEN: usize = 7;
pub const LONG_LEN: usize = 19;

pub const DEVICE_INDEX: u8 = 0x01;

/* Feature indexes. */
pub const FEATURE_NAME: u8 = 0x05;
pub const FEATURE_BATTERY: u8 = 0x06;
pub const FEATURE_ONBOARD: u8 = 0x0D;

/* Onboard-profile function bytes. */
pub const FUNC_START: u8 = 0x0F;
pub const FUNC_HEADER: u8 = 0x6F;
pub const FUNC_CHUNK: u8 = 0x7F;
pub const FUNC_COMMIT: u8 = 0x8F;
pub const FUNC_READ_CHUNK: u8 = 0x5F;
pub const FUNC_KEEPALIVE: u8 = 0x2F;

pub const FUNC_NAME_READ: u8 = 0x1F;
pub const FUNC_BATTERY_STATUS: u8 = 0x1F;

pub const PROFILE_ID: u8 = 0x01;
pub const IMAGE_LEN: usize = 256;
pub const CHUNK_LEN: usize = 16;
pub const CHUNK_COUNT: usize = 16;
/* CRC covers everything before its own two bytes. */
pub const CRC_SPAN: usize = 253;

/* Image offsets. */
const OFF_POLLING_WIRELESS: usize = 0;
const OFF_POLLING_WIRED: usize = 1;
const OFF_DEFAULT_SLOT: usize = 2;
const OFF_DPI_RECORDS: usize = 4;
const DPI_RECORD_STRIDE: usize = 5;
const OFF_BURST: usize = 0x25;
const OFF_BUTTONS: usize = 0x30;
const OFF_BUTTONS_MIRROR: usize = 0x70;
const BUTTON_SLOT_LEN: usize = 4;
const BUTTON_SLOTS: usize = 5;

/* DPI record flag byte: bit 7 enables the slot, low bits carry LOD. */
const FLAG_ENABLED: u8 = 0x80;
const LOD_LOW: u8 = 0x01;
const LOD_MID: u8 = 0x02;
const LOD_HIGH: u8 = 0x03;

/* Polling register stores the report interval in milliseconds. */
const POLLING_CODES: &[(u32, u8)] = &[(125, 8), (250, 4), (500, 2), (1000, 1)];

/* CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, no reflection, no
 * final xor. */
pub fn compute_ccitt_crc(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/* ------------------------------------------------------------------ */
/* Framing                                                             */
/* ------------------------------------------------------------------ */

pub fn build_short(feature: u8, function: u8, params: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; SHORT_LEN];
    buf[0] = DEVICE_INDEX;
    buf[1] = feature;
    buf[2] = function;
    let n = params.len().min(SHORT_LEN - 3);
    buf[3..3 + n].copy_from_slice(&params[..n]);
    buf
}

pub fn build_long(feature: u8, function: u8, params: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; LONG_LEN];
    buf[0] = DEVICE_INDEX;
    buf[1] = feature;
    buf[2] = function;
    let n = params.len().min(LONG_LEN - 3);
    buf[3..3 + n].copy_from_slice(&params[..n]);
    buf
}

/* Dongle heartbeat frames share the protocol report ids and must never
 * satisfy an ack matcher. */
pub fn is_keepalive(data: &[u8]) -> bool {
    data.len() >= 3 && data[0] == DEVICE_INDEX && data[1] == FEATURE_ONBOARD && data[2] == FUNC_KEEPALIVE
}

fn onboard_ack(function: u8) -> AckMatcher {
    AckMatcher::new(REPORT_ID_LONG, move |data| {
        data.len() >= 3
            && data[0] == DEVICE_INDEX
            && data[1] == FEATURE_ONBOARD
            && data[2] == function
    })
}

fn chunk_ack(index: u8) -> AckMatcher {
    AckMatcher::new(REPORT_ID_LONG, move |data| {
        data.len() >= 4
            && data[0] == DEVICE_INDEX
            && data[1] == FEATURE_ONBOARD
            && data[2] == FUNC_CHUNK
            && data[3] == index
    })
}

pub fn polling_code(hz: u32) -> Option<u8> {
    POLLING_CODES.iter().find(|(h, _)| *h == hz).map(|(_, c)| *c)
}

pub fn polling_from_code(code: u8) -> Option<u32> {
    POLLING_CODES.iter().find(|(_, c)| *c == code).map(|(h, _)| *h)
}

fn lod_bits(lod: LodHeight) -> u8 {
    match lod {
        LodHeight::Low => LOD_LOW,
        LodHeight::Mid => LOD_MID,
        LodHeight::High => LOD_HIGH,
    }
}

fn lod_from_bits(bits: u8) -> Option<LodHeight> {
    match bits & 0x03 {
        LOD_LOW => Some(LodHeight::Low),
        LOD_MID => Some(LodHeight::Mid),
        LOD_HIGH => Some(LodHeight::High),
        _ => None,
    }
}

/* ------------------------------------------------------------------ */
/* Profile image                                                       */
/* ------------------------------------------------------------------ */

/* Render the next state into the 256-byte on-board image. */
pub fn build_profile_image(next: &MouseConfig, caps: &Capabilities) -> Vec<u8> {
    let mut image = vec![0u8; IMAGE_LEN];

    let polling = next.polling_hz.unwrap_or(1000);
    let code = polling_code(polling).unwrap_or(1);
    image[OFF_POLLING_WIRELESS] = code;
    image[OFF_POLLING_WIRED] = code;
    image[OFF_DEFAULT_SLOT] = next.current_dpi_index.unwrap_or(0);

    let slots_x = next.dpi_slots_x.clone().unwrap_or_default();
    let slots_y = next
        .dpi_slots_y
        .clone()
        .unwrap_or_else(|| slots_x.clone());
    let count = next.dpi_slot_count.unwrap_or(caps.dpi_slot_max) as usize;
    let lod = lod_bits(next.lod.unwrap_or(LodHeight::Mid));

    for slot in 0..caps.dpi_slot_max as usize {
        let off = OFF_DPI_RECORDS + slot * DPI_RECORD_STRIDE;
        let x = slots_x.get(slot).copied().unwrap_or(800);
        let y = slots_y.get(slot).copied().unwrap_or(x);
        image[off..off + 2].copy_from_slice(&convert::dpi_to_le(x));
        image[off + 2..off + 4].copy_from_slice(&convert::dpi_to_le(y));
        image[off + 4] = if slot < count { FLAG_ENABLED | lod } else { 0x00 };
    }

    image[OFF_BURST] = (next.burst_delay_ms.unwrap_or(0) / 10).min(255) as u8;

    let buttons = next.buttons.clone().unwrap_or_else(|| {
        (0..BUTTON_SLOTS as u8).map(funckey::default_mapping).collect()
    });
    for base in [OFF_BUTTONS, OFF_BUTTONS_MIRROR] {
        for slot in 0..BUTTON_SLOTS {
            let off = base + slot * BUTTON_SLOT_LEN;
            let funckey = buttons.get(slot).map(|m| m.funckey).unwrap_or(0);
            image[off] = 0x80;
            image[off + 1] = 0x01;
            image[off + 2] = 0x00;
            image[off + 3] = funckey;
        }
    }

    let crc = compute_ccitt_crc(&image[..CRC_SPAN]);
    image[CRC_SPAN..CRC_SPAN + 2].copy_from_slice(&crc.to_be_bytes());
    image
}

/* Decode an on-board image back into the semantic snapshot. */
pub fn parse_profile_image(image: &[u8], caps: &Capabilities) -> MouseConfig {
    let mut config = MouseConfig::default();
    if image.len() < IMAGE_LEN {
        return config;
    }

    let stored = u16::from_be_bytes([image[CRC_SPAN], image[CRC_SPAN + 1]]);
    let computed = compute_ccitt_crc(&image[..CRC_SPAN]);
    if stored != computed {
        warn!(
            "profile image CRC mismatch: computed {computed:#06x}, stored {stored:#06x}"
        );
    }

    config.polling_hz = polling_from_code(image[OFF_POLLING_WIRED]);
    config.current_dpi_index = Some(image[OFF_DEFAULT_SLOT]);

    let mut slots_x = Vec::new();
    let mut slots_y = Vec::new();
    let mut count = 0u8;
    for slot in 0..caps.dpi_slot_max as usize {
        let off = OFF_DPI_RECORDS + slot * DPI_RECORD_STRIDE;
        slots_x.push(convert::dpi_from_le(image[off], image[off + 1]));
        slots_y.push(convert::dpi_from_le(image[off + 2], image[off + 3]));
        let flags = image[off + 4];
        if flags & FLAG_ENABLED != 0 {
            count += 1;
            if config.lod.is_none() {
                config.lod = lod_from_bits(flags);
            }
        }
    }
    config.dpi_slots_x = Some(slots_x);
    config.dpi_slots_y = Some(slots_y);
    config.dpi_slot_count = Some(count.max(1));
    config.burst_delay_ms = Some(u32::from(image[OFF_BURST]) * 10);

    let mut buttons = Vec::new();
    for slot in 0..BUTTON_SLOTS {
        let funckey_byte = image[OFF_BUTTONS + slot * BUTTON_SLOT_LEN + 3];
        buttons.push(
            funckey::mapping_for_funckey(funckey_byte)
                .unwrap_or_else(|| funckey::default_mapping(slot as u8)),
        );
    }
    config.buttons = Some(buttons);

    config
}

/* The 20-command rewrite stream. Every command carries an ack matcher
 * and the stream flag so a lost ack replays the lot. */
pub fn profile_stream(image: &[u8]) -> Vec<Command> {
    let mut cmds = Vec::with_capacity(3 + CHUNK_COUNT);

    cmds.push(
        Command::new(
            REPORT_ID_LONG,
            FUNC_START,
            build_long(FEATURE_ONBOARD, FUNC_START, &[]),
        )
        .ack(onboard_ack(FUNC_START))
        .profile_stream()
        .sensitive(),
    );

    let mut header = vec![0x00u8; 16];
    header[1] = PROFILE_ID;
    cmds.push(
        Command::new(
            REPORT_ID_LONG,
            FUNC_HEADER,
            build_long(FEATURE_ONBOARD, FUNC_HEADER, &header),
        )
        .ack(onboard_ack(FUNC_HEADER))
        .profile_stream()
        .sensitive(),
    );

    for index in 0..CHUNK_COUNT {
        let chunk = &image[index * CHUNK_LEN..(index + 1) * CHUNK_LEN];
        cmds.push(
            Command::new(
                REPORT_ID_LONG,
                FUNC_CHUNK,
                build_long(FEATURE_ONBOARD, FUNC_CHUNK, chunk),
            )
            .ack(chunk_ack(index as u8))
            .profile_stream()
            .sensitive(),
        );
    }

    cmds.push(
        Command::new(
            REPORT_ID_LONG,
            FUNC_COMMIT,
            build_long(FEATURE_ONBOARD, FUNC_COMMIT, &[]),
        )
        .ack(onboard_ack(FUNC_COMMIT))
        .profile_stream()
        .sensitive(),
    );

    cmds
}

/* ------------------------------------------------------------------ */
/* Protocol table                                                      */
/* ------------------------------------------------------------------ */

fn validate_profile(changes: &ChangeSet, _next: &MouseConfig, caps: &Capabilities) -> Result<()> {
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

fn plan_profile(_changes: &ChangeSet, next: &MouseConfig, ctx: &PlanCtx) -> Result<Vec<Command>> {
    let image = build_profile_image(next, ctx.caps);
    Ok(profile_stream(&image))
}

fn pack(spec: &WriteSpec) -> Command {
    /* Everything configurable on this family routes through the
     * profile stream; direct register packing only serves one-off
     * feature requests. */
    let payload = build_long(spec.len_or_idx, spec.opcode, &spec.data);
    Command::new(REPORT_ID_LONG, spec.opcode, payload).wait_ms(spec.wait_ms)
}

fn dedup_key(cmd: &Command) -> DedupKey {
    DedupKey {
        report_id: cmd.report_id,
        opcode: cmd.opcode,
        len_or_idx: cmd.payload.get(1).copied().unwrap_or(0),
        data0: cmd.payload.get(3).copied(),
    }
}

static ENTRIES: &[FeatureEntry] = &[FeatureEntry {
    key: FeatureKey::DpiProfile,
    kind: EntryKind::Virtual,
    priority: 50,
    triggers: &[
        FeatureKey::PollingHz,
        FeatureKey::LodHeight,
        FeatureKey::BurstDelayMs,
        FeatureKey::DpiSlotCount,
        FeatureKey::CurrentDpiIndex,
        FeatureKey::DpiSlotsX,
        FeatureKey::DpiSlotsY,
        FeatureKey::DpiSlot,
        FeatureKey::ButtonMappings,
        FeatureKey::ButtonMapping,
    ],
    validate: Some(validate_profile),
    action: EntryAction::Plan(plan_profile),
}];

static PATCH_KEYS: &[FeatureKey] = &[
    FeatureKey::PollingHz,
    FeatureKey::LodHeight,
    FeatureKey::BurstDelayMs,
    FeatureKey::DpiSlotCount,
    FeatureKey::CurrentDpiIndex,
    FeatureKey::DpiSlotsX,
    FeatureKey::DpiSlotsY,
    FeatureKey::DpiSlot,
    FeatureKey::ButtonMappings,
    FeatureKey::ButtonMapping,
];

static CAPABILITIES: Capabilities = Capabilities {
    vendor: Vendor::Hidpp,
    polling_rates: &[125, 250, 500, 1000],
    perf_modes_by_polling: &[],
    perf_modes: &[],
    dpi_min: 100,
    dpi_max: 25600,
    dpi_slot_max: 5,
    button_count: 5,
    sleep_minutes: None,
    led_modes: &[],
    separate_xy_dpi: true,
    patch_keys: PATCH_KEYS,
};

static PROTOCOL: Protocol = Protocol {
    vendor: Vendor::Hidpp,
    entries: ENTRIES,
    aliases: &[("dpiSlotsXY", FeatureKey::DpiSlotsX)],
    expand: crate::features::expand_none,
    pack,
    dedup_key,
    gate: None,
    keepalive: Some(is_keepalive),
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
        burst_delay_ms: Some(0),
        dpi_slot_count: Some(5),
        current_dpi_index: Some(0),
        dpi_slots_x: Some(vec![800, 1600, 3200, 6400, 12800]),
        dpi_slots_y: Some(vec![800, 1600, 3200, 6400, 12800]),
        buttons: Some((0..5).map(funckey::default_mapping).collect()),
        ..MouseConfig::default()
    }
}

/* ------------------------------------------------------------------ */
/* Read paths                                                          */
/* ------------------------------------------------------------------ */

/* Page-read the on-board image chunk by chunk and rebuild the
 * snapshot from it. */
pub async fn read_config(t: &Transport) -> Result<MouseConfig> {
    let mut image = vec![0u8; IMAGE_LEN];
    for index in 0..CHUNK_COUNT {
        let request = build_long(FEATURE_ONBOARD, FUNC_READ_CHUNK, &[index as u8]);
        let ack = AckMatcher::new(REPORT_ID_LONG, move |data| {
            data.len() >= 4 + CHUNK_LEN
                && data[0] == DEVICE_INDEX
                && data[1] == FEATURE_ONBOARD
                && data[2] == FUNC_READ_CHUNK
                && data[3] == index as u8
        });
        let reply = t.send_and_wait(REPORT_ID_LONG, &request, &ack).await?;
        image[index * CHUNK_LEN..(index + 1) * CHUNK_LEN]
            .copy_from_slice(&reply[4..4 + CHUNK_LEN]);
    }
    let mut config = parse_profile_image(&image, &CAPABILITIES);

    /* Device name rides its own feature. */
    let request = build_short(FEATURE_NAME, FUNC_NAME_READ, &[]);
    let ack = AckMatcher::new(REPORT_ID_LONG, |data| {
        data.len() >= 4 && data[0] == DEVICE_INDEX && data[1] == FEATURE_NAME
    });
    if let Ok(reply) = t.send_and_wait(REPORT_ID_SHORT, &request, &ack).await {
        let name: String = reply[3..]
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| char::from(*b))
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();
        if !name.is_empty() {
            config.device_name = Some(name);
        }
    }

    Ok(config)
}

pub async fn read_battery(t: &Transport) -> Result<BatteryState> {
    let request = build_short(FEATURE_BATTERY, FUNC_BATTERY_STATUS, &[]);
    let ack = AckMatcher::new(REPORT_ID_LONG, |data| {
        data.len() >= 5 && data[0] == DEVICE_INDEX && data[1] == FEATURE_BATTERY
    });
    let reply = t.send_and_wait(REPORT_ID_SHORT, &request, &ack).await?;
    Ok(BatteryState {
        percent: reply[3].min(100),
        charging: reply[4] != 0,
    })
}

/* Unsolicited battery broadcasts share the battery feature index. */
pub fn parse_input(report: &crate::hid::InputReport) -> Option<InputEvent> {
    if report.report_id != REPORT_ID_LONG && report.report_id != REPORT_ID_SHORT {
        return None;
    }
    let data = &report.data;
    if data.len() >= 5 && data[0] == DEVICE_INDEX && data[1] == FEATURE_BATTERY {
        return Some(InputEvent::Battery(BatteryState {
            percent: data[3].min(100),
            charging: data[4] != 0,
        }));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Patch;
    use crate::planner;
    use serde_json::json;

    /* ── CRC ────────────────────────────────────────────────────────── */

    #[test]
    fn crc_known_vector() {
        /* CRC-16/CCITT-FALSE("123456789") = 0x29B1. */
        assert_eq!(compute_ccitt_crc(b"123456789"), 0x29B1);
    }

    #[test]
    fn crc_empty_is_init() {
        assert_eq!(compute_ccitt_crc(&[]), 0xFFFF);
    }

    /* ── Framing ────────────────────────────────────────────────────── */

    #[test]
    fn short_and_long_frame_lengths() {
        let s = build_short(FEATURE_NAME, FUNC_NAME_READ, &[0xAA]);
        assert_eq!(s.len(), SHORT_LEN);
        assert_eq!(s[..4], [DEVICE_INDEX, FEATURE_NAME, FUNC_NAME_READ, 0xAA]);

        let l = build_long(FEATURE_ONBOARD, FUNC_CHUNK, &[0x55; 16]);
        assert_eq!(l.len(), LONG_LEN);
        assert_eq!(l[0], DEVICE_INDEX);
        assert_eq!(l[2], FUNC_CHUNK);
        assert_eq!(l[3..19], [0x55; 16]);
    }

    #[test]
    fn keepalive_detection() {
        assert!(is_keepalive(&[0x01, 0x0D, 0x2F, 0x00]));
        assert!(!is_keepalive(&[0x01, 0x0D, 0x7F, 0x00]));
        assert!(!is_keepalive(&[0x02, 0x0D, 0x2F]));
        assert!(!is_keepalive(&[0x01]));
    }

    /* ── Profile image ──────────────────────────────────────────────── */

    fn scenario_next() -> MouseConfig {
        planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new()
                .set("dpiSlots", json!([800, 1600, 3200, 3200, 3200]))
                .set("dpiSlotCount", 3)
                .set("defaultDpiSlotIndex", 0),
        )
        .unwrap()
        .next
    }

    #[test]
    fn profile_rewrite_emits_twenty_commands() {
        let result = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new()
                .set("dpiSlots", json!([800, 1600, 3200, 3200, 3200]))
                .set("dpiSlotCount", 3)
                .set("defaultDpiSlotIndex", 0),
        )
        .unwrap();
        assert_eq!(result.commands.len(), 20);
        assert_eq!(result.commands[0].opcode, FUNC_START);
        assert_eq!(result.commands[1].opcode, FUNC_HEADER);
        assert_eq!(result.commands[1].payload[4], PROFILE_ID);
        for (i, cmd) in result.commands[2..18].iter().enumerate() {
            assert_eq!(cmd.opcode, FUNC_CHUNK, "chunk {i}");
            assert!(cmd.profile_stream);
            assert!(cmd.ack.is_some());
        }
        assert_eq!(result.commands[19].opcode, FUNC_COMMIT);
    }

    #[test]
    fn image_encodes_dpi_records_and_flags() {
        let image = build_profile_image(&scenario_next(), capabilities());

        /* Chunk 0 byte 2: default slot. */
        assert_eq!(image[2], 0x00);

        /* Records at stride 5 from byte 4: x LE, y LE, flags. The
         * first three slots are enabled at mid LOD, the rest off. */
        let expect = [
            (800u16, FLAG_ENABLED | LOD_MID),
            (1600, FLAG_ENABLED | LOD_MID),
            (3200, FLAG_ENABLED | LOD_MID),
            (3200, 0x00),
            (3200, 0x00),
        ];
        for (slot, (dpi, flags)) in expect.iter().enumerate() {
            let off = 4 + slot * 5;
            let le = dpi.to_le_bytes();
            assert_eq!(image[off], le[0], "slot {slot} x lo");
            assert_eq!(image[off + 1], le[1], "slot {slot} x hi");
            assert_eq!(image[off + 2], le[0], "slot {slot} y lo");
            assert_eq!(image[off + 3], le[1], "slot {slot} y hi");
            assert_eq!(image[off + 4], *flags, "slot {slot} flags");
        }
    }

    #[test]
    fn image_crc_sits_at_the_tail_big_endian() {
        let image = build_profile_image(&scenario_next(), capabilities());
        assert_eq!(image.len(), IMAGE_LEN);
        let crc = compute_ccitt_crc(&image[..CRC_SPAN]);
        assert_eq!(image[253], (crc >> 8) as u8);
        assert_eq!(image[254], (crc & 0xFF) as u8);
    }

    #[test]
    fn image_mirrors_button_slots() {
        let image = build_profile_image(&default_config(), capabilities());
        for slot in 0..BUTTON_SLOTS {
            let a = &image[OFF_BUTTONS + slot * 4..OFF_BUTTONS + slot * 4 + 4];
            let b = &image[OFF_BUTTONS_MIRROR + slot * 4..OFF_BUTTONS_MIRROR + slot * 4 + 4];
            assert_eq!(a, b, "slot {slot}");
            assert_eq!(a[0], 0x80);
            assert_eq!(a[1], 0x01);
            assert_eq!(a[2], 0x00);
        }
        /* Default slots carry the conventional five buttons. */
        assert_eq!(
            image[OFF_BUTTONS + 3],
            funckey::resolve_label("left_click").unwrap().funckey
        );
    }

    #[test]
    fn burst_delay_is_stored_in_tens() {
        let mut next = default_config();
        next.burst_delay_ms = Some(250);
        let image = build_profile_image(&next, capabilities());
        assert_eq!(image[0x25], 25);
    }

    #[test]
    fn image_roundtrip_via_parse() {
        let next = scenario_next();
        let image = build_profile_image(&next, capabilities());
        let parsed = parse_profile_image(&image, capabilities());
        assert_eq!(parsed.polling_hz, next.polling_hz);
        assert_eq!(parsed.current_dpi_index, next.current_dpi_index);
        assert_eq!(parsed.dpi_slot_count, Some(3));
        assert_eq!(parsed.dpi_slots_x.as_ref().unwrap()[..3], [800, 1600, 3200]);
        assert_eq!(parsed.lod, Some(LodHeight::Mid));
    }

    #[test]
    fn polling_patch_rewrites_the_profile() {
        let result = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("pollingHz", 500),
        )
        .unwrap();
        assert_eq!(result.commands.len(), 20);
        /* Chunk 0 carries the new interval code in both slots. */
        let chunk0 = &result.commands[2];
        assert_eq!(chunk0.payload[3], 2);
        assert_eq!(chunk0.payload[4], 2);
    }

    #[test]
    fn unsupported_polling_rate_fails_validation() {
        let err = planner::plan(
            protocol(),
            capabilities(),
            &default_config(),
            &Patch::new().set("pollingHz", 2000),
        )
        .unwrap_err();
        assert!(matches!(err, MouseError::BadParam { .. }));
    }

    #[test]
    fn battery_broadcast_decodes() {
        let report = crate::hid::InputReport {
            report_id: REPORT_ID_LONG,
            data: vec![DEVICE_INDEX, FEATURE_BATTERY, 0x00, 42, 1],
        };
        assert_eq!(
            parse_input(&report),
            Some(InputEvent::Battery(BatteryState {
                percent: 42,
                charging: true,
            }))
        );
    }

    #[test]
    fn keepalive_frames_are_not_battery_events() {
        let report = crate::hid::InputReport {
            report_id: REPORT_ID_LONG,
            data: vec![0x01, 0x0D, 0x2F, 0x00, 0x00],
        };
        assert_eq!(parse_input(&report), None);
    }
}
