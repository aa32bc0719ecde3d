/* Button mapping label tables.
 *
 * Semantic button labels resolve to the `{funckey, keycode}` wire pair
 * shared by every protocol family. The funckey byte's high nibble is
 * the action category and its low nibble the action ordinal, so the
 * funckey alone identifies the action (the hidpp profile image stores
 * only that byte). The keycode byte carries the HID payload: button
 * bit, consumer/system usage, or keyboard usage. Keyboard entries
 * instead use `0x80 | modifier bitset` as the funckey so a combo like
 * `ctrl+c` fits in the pair (left-hand modifiers only, HID bits 0..=3). */

use crate::config::ButtonMapping;
use crate::error::{MouseError, Result};

pub const FUNCKEY_DISABLED: u8 = 0x00;
pub const FUNCKEY_MOUSE: u8 = 0x10;
pub const FUNCKEY_DPI: u8 = 0x20;
pub const FUNCKEY_WHEEL: u8 = 0x30;
pub const FUNCKEY_MEDIA: u8 = 0x40;
pub const FUNCKEY_SYSTEM: u8 = 0x50;
pub const FUNCKEY_KEYBOARD: u8 = 0x80;

pub fn funckey_category(funckey: u8) -> u8 {
    if funckey & FUNCKEY_KEYBOARD != 0 {
        FUNCKEY_KEYBOARD
    } else {
        funckey & 0xF0
    }
}

/* Simple labels with a fixed wire pair. Keycodes in the media and
 * system rows are the usage-page low byte. */
const LABELS: &[(&str, u8, u8)] = &[
    ("disabled", FUNCKEY_DISABLED, 0x00),
    ("left_click", FUNCKEY_MOUSE | 0x01, 0x01),
    ("right_click", FUNCKEY_MOUSE | 0x02, 0x02),
    ("middle_click", FUNCKEY_MOUSE | 0x03, 0x04),
    ("back", FUNCKEY_MOUSE | 0x04, 0x08),
    ("forward", FUNCKEY_MOUSE | 0x05, 0x10),
    ("dpi_loop", FUNCKEY_DPI | 0x01, 0x01),
    ("dpi_up", FUNCKEY_DPI | 0x02, 0x02),
    ("dpi_down", FUNCKEY_DPI | 0x03, 0x03),
    ("dpi_sniper", FUNCKEY_DPI | 0x04, 0x04),
    ("wheel_up", FUNCKEY_WHEEL | 0x01, 0x01),
    ("wheel_down", FUNCKEY_WHEEL | 0x02, 0x02),
    ("wheel_left", FUNCKEY_WHEEL | 0x03, 0x03),
    ("wheel_right", FUNCKEY_WHEEL | 0x04, 0x04),
    ("play_pause", FUNCKEY_MEDIA | 0x01, 0xCD),
    ("next_track", FUNCKEY_MEDIA | 0x02, 0xB5),
    ("prev_track", FUNCKEY_MEDIA | 0x03, 0xB6),
    ("stop", FUNCKEY_MEDIA | 0x04, 0xB7),
    ("mute", FUNCKEY_MEDIA | 0x05, 0xE2),
    ("volume_up", FUNCKEY_MEDIA | 0x06, 0xE9),
    ("volume_down", FUNCKEY_MEDIA | 0x07, 0xEA),
    ("power", FUNCKEY_SYSTEM | 0x01, 0x81),
    ("sleep", FUNCKEY_SYSTEM | 0x02, 0x82),
    ("wake", FUNCKEY_SYSTEM | 0x03, 0x83),
];

/* Reverse lookup for protocols that persist only the funckey byte. */
pub fn mapping_for_funckey(funckey: u8) -> Option<ButtonMapping> {
    LABELS
        .iter()
        .find(|(_, f, _)| *f == funckey)
        .map(|(_, f, k)| ButtonMapping {
            funckey: *f,
            keycode: *k,
        })
        .or_else(|| {
            (funckey & FUNCKEY_KEYBOARD != 0).then_some(ButtonMapping {
                funckey,
                keycode: 0,
            })
        })
}

/* HID keyboard usages for `key:<name>` and combo labels. */
const KEY_USAGES: &[(&str, u8)] = &[
    ("a", 0x04), ("b", 0x05), ("c", 0x06), ("d", 0x07), ("e", 0x08),
    ("f", 0x09), ("g", 0x0A), ("h", 0x0B), ("i", 0x0C), ("j", 0x0D),
    ("k", 0x0E), ("l", 0x0F), ("m", 0x10), ("n", 0x11), ("o", 0x12),
    ("p", 0x13), ("q", 0x14), ("r", 0x15), ("s", 0x16), ("t", 0x17),
    ("u", 0x18), ("v", 0x19), ("w", 0x1A), ("x", 0x1B), ("y", 0x1C),
    ("z", 0x1D),
    ("1", 0x1E), ("2", 0x1F), ("3", 0x20), ("4", 0x21), ("5", 0x22),
    ("6", 0x23), ("7", 0x24), ("8", 0x25), ("9", 0x26), ("0", 0x27),
    ("enter", 0x28), ("esc", 0x29), ("backspace", 0x2A), ("tab", 0x2B),
    ("space", 0x2C), ("minus", 0x2D), ("equal", 0x2E),
    ("f1", 0x3A), ("f2", 0x3B), ("f3", 0x3C), ("f4", 0x3D), ("f5", 0x3E),
    ("f6", 0x3F), ("f7", 0x40), ("f8", 0x41), ("f9", 0x42), ("f10", 0x43),
    ("f11", 0x44), ("f12", 0x45),
    ("print_screen", 0x46), ("insert", 0x49), ("home", 0x4A),
    ("page_up", 0x4B), ("delete", 0x4C), ("end", 0x4D), ("page_down", 0x4E),
    ("right", 0x4F), ("left", 0x50), ("down", 0x51), ("up", 0x52),
];

/* Left-hand HID modifier bits, folded into the keyboard funckey byte. */
const MODIFIERS: &[(&str, u8)] = &[
    ("ctrl", 0x01),
    ("shift", 0x02),
    ("alt", 0x04),
    ("meta", 0x08),
];

fn key_usage(name: &str) -> Option<u8> {
    KEY_USAGES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, usage)| *usage)
}

/* Resolve a semantic label into its wire pair.
 *
 * Accepted forms: a fixed label from the table, `key:<name>`, or a
 * `mod[+mod...]+<name>` keyboard combo. */
pub fn resolve_label(label: &str) -> Result<ButtonMapping> {
    let label = label.trim().to_ascii_lowercase();

    if let Some((_, funckey, keycode)) = LABELS.iter().find(|(l, _, _)| *l == label) {
        return Ok(ButtonMapping {
            funckey: *funckey,
            keycode: *keycode,
        });
    }

    if let Some(name) = label.strip_prefix("key:") {
        let usage = key_usage(name).ok_or_else(|| {
            MouseError::bad_param("buttonMapping", name, "unknown key name")
        })?;
        return Ok(ButtonMapping {
            funckey: FUNCKEY_KEYBOARD,
            keycode: usage,
        });
    }

    if label.contains('+') {
        let mut modifiers = 0u8;
        let mut base: Option<u8> = None;
        for part in label.split('+') {
            if let Some((_, bit)) = MODIFIERS.iter().find(|(n, _)| *n == part) {
                modifiers |= bit;
            } else if base.is_none() {
                base = Some(key_usage(part).ok_or_else(|| {
                    MouseError::bad_param("buttonMapping", part, "unknown key name")
                })?);
            } else {
                return Err(MouseError::bad_param(
                    "buttonMapping",
                    &label,
                    "more than one base key in combo",
                ));
            }
        }
        let base = base.ok_or_else(|| {
            MouseError::bad_param("buttonMapping", &label, "combo has no base key")
        })?;
        return Ok(ButtonMapping {
            funckey: FUNCKEY_KEYBOARD | modifiers,
            keycode: base,
        });
    }

    Err(MouseError::bad_param(
        "buttonMapping",
        &label,
        "unknown button label",
    ))
}

/* Best-effort reverse lookup for display. Keyboard combos come back in
 * the same `mod+key` form they were resolved from. */
pub fn label_for(mapping: ButtonMapping) -> Option<String> {
    if let Some((label, _, _)) = LABELS
        .iter()
        .find(|(_, f, k)| *f == mapping.funckey && *k == mapping.keycode)
    {
        return Some((*label).to_string());
    }

    if mapping.funckey & FUNCKEY_KEYBOARD != 0 {
        let name = KEY_USAGES
            .iter()
            .find(|(_, usage)| *usage == mapping.keycode)
            .map(|(n, _)| *n)?;
        let mods = mapping.funckey & 0x0F;
        if mods == 0 {
            return Some(format!("key:{name}"));
        }
        let mut parts: Vec<&str> = MODIFIERS
            .iter()
            .filter(|(_, bit)| mods & bit != 0)
            .map(|(n, _)| *n)
            .collect();
        parts.push(name);
        return Some(parts.join("+"));
    }

    None
}

/* Default mapping for a physical button index: the first five buttons
 * get their conventional roles, anything beyond is disabled. */
pub fn default_mapping(index: u8) -> ButtonMapping {
    let label = match index {
        0 => "left_click",
        1 => "right_click",
        2 => "middle_click",
        3 => "back",
        4 => "forward",
        _ => "disabled",
    };
    resolve_label(label).unwrap_or(ButtonMapping {
        funckey: FUNCKEY_DISABLED,
        keycode: 0,
    })
}
