//! USB HID boot-keyboard report encoding for the `hid_gadget` destination.
//! Byte 0 is the modifier bitmap (bit N set for HID
//! usage `0xE0 + N`); bytes 2..8 hold up to six active non-modifier usage
//! codes. Keys with no HID usage mapping are silently dropped.

use evdev::Key;

/// evdev `Key` code to USB HID keyboard usage ID (HUT 1.12 §10).
pub(crate) fn hid_usage(key: Key) -> Option<u8> {
    Some(match key {
        Key::KEY_A => 0x04,
        Key::KEY_B => 0x05,
        Key::KEY_C => 0x06,
        Key::KEY_D => 0x07,
        Key::KEY_E => 0x08,
        Key::KEY_F => 0x09,
        Key::KEY_G => 0x0A,
        Key::KEY_H => 0x0B,
        Key::KEY_I => 0x0C,
        Key::KEY_J => 0x0D,
        Key::KEY_K => 0x0E,
        Key::KEY_L => 0x0F,
        Key::KEY_M => 0x10,
        Key::KEY_N => 0x11,
        Key::KEY_O => 0x12,
        Key::KEY_P => 0x13,
        Key::KEY_Q => 0x14,
        Key::KEY_R => 0x15,
        Key::KEY_S => 0x16,
        Key::KEY_T => 0x17,
        Key::KEY_U => 0x18,
        Key::KEY_V => 0x19,
        Key::KEY_W => 0x1A,
        Key::KEY_X => 0x1B,
        Key::KEY_Y => 0x1C,
        Key::KEY_Z => 0x1D,
        Key::KEY_1 => 0x1E,
        Key::KEY_2 => 0x1F,
        Key::KEY_3 => 0x20,
        Key::KEY_4 => 0x21,
        Key::KEY_5 => 0x22,
        Key::KEY_6 => 0x23,
        Key::KEY_7 => 0x24,
        Key::KEY_8 => 0x25,
        Key::KEY_9 => 0x26,
        Key::KEY_0 => 0x27,
        Key::KEY_ENTER => 0x28,
        Key::KEY_ESC => 0x29,
        Key::KEY_BACKSPACE => 0x2A,
        Key::KEY_TAB => 0x2B,
        Key::KEY_SPACE => 0x2C,
        Key::KEY_MINUS => 0x2D,
        Key::KEY_EQUAL => 0x2E,
        Key::KEY_LEFTBRACE => 0x2F,
        Key::KEY_RIGHTBRACE => 0x30,
        Key::KEY_BACKSLASH => 0x31,
        Key::KEY_SEMICOLON => 0x33,
        Key::KEY_APOSTROPHE => 0x34,
        Key::KEY_GRAVE => 0x35,
        Key::KEY_COMMA => 0x36,
        Key::KEY_DOT => 0x37,
        Key::KEY_SLASH => 0x38,
        Key::KEY_CAPSLOCK => 0x39,
        Key::KEY_F1 => 0x3A,
        Key::KEY_F2 => 0x3B,
        Key::KEY_F3 => 0x3C,
        Key::KEY_F4 => 0x3D,
        Key::KEY_F5 => 0x3E,
        Key::KEY_F6 => 0x3F,
        Key::KEY_F7 => 0x40,
        Key::KEY_F8 => 0x41,
        Key::KEY_F9 => 0x42,
        Key::KEY_F10 => 0x43,
        Key::KEY_F11 => 0x44,
        Key::KEY_F12 => 0x45,
        Key::KEY_SYSRQ => 0x46,
        Key::KEY_SCROLLLOCK => 0x47,
        Key::KEY_PAUSE => 0x48,
        Key::KEY_INSERT => 0x49,
        Key::KEY_HOME => 0x4A,
        Key::KEY_PAGEUP => 0x4B,
        Key::KEY_DELETE => 0x4C,
        Key::KEY_END => 0x4D,
        Key::KEY_PAGEDOWN => 0x4E,
        Key::KEY_RIGHT => 0x4F,
        Key::KEY_LEFT => 0x50,
        Key::KEY_DOWN => 0x51,
        Key::KEY_UP => 0x52,
        _ => return None,
    })
}

/// Modifier bit index (0..8, usage `0xE0 + N`), if `key` is a modifier.
fn modifier_bit(key: Key) -> Option<u8> {
    Some(match key {
        Key::KEY_LEFTCTRL => 0,
        Key::KEY_LEFTSHIFT => 1,
        Key::KEY_LEFTALT => 2,
        Key::KEY_LEFTMETA => 3,
        Key::KEY_RIGHTCTRL => 4,
        Key::KEY_RIGHTSHIFT => 5,
        Key::KEY_RIGHTALT => 6,
        Key::KEY_RIGHTMETA => 7,
        _ => return None,
    })
}

/// Encode the currently pressed key set as an 8-byte boot-keyboard report.
/// Beyond six simultaneous non-modifier keys, later keys in `pressed` are
/// dropped (no rollover/error byte support, matching the boot protocol).
pub fn boot_keyboard_report(pressed: &[Key]) -> [u8; 8] {
    let mut report = [0u8; 8];
    let mut usage_slot = 2;
    for &key in pressed {
        if let Some(bit) = modifier_bit(key) {
            report[0] |= 1 << bit;
            continue;
        }
        if usage_slot >= report.len() {
            continue;
        }
        if let Some(usage) = hid_usage(key) {
            report[usage_slot] = usage;
            usage_slot += 1;
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_a_key_in_first_usage_slot() {
        let report = boot_keyboard_report(&[Key::KEY_A]);
        assert_eq!(report[2], 0x04);
    }

    #[test]
    fn encodes_modifier_in_byte_zero() {
        let report = boot_keyboard_report(&[Key::KEY_LEFTSHIFT, Key::KEY_A]);
        assert_eq!(report[0], 0b0000_0010);
        assert_eq!(report[2], 0x04);
    }

    #[test]
    fn unmapped_keys_are_dropped() {
        let report = boot_keyboard_report(&[Key::KEY_KPASTERISK]);
        assert_eq!(report, [0u8; 8]);
    }

    #[test]
    fn caps_at_six_non_modifier_keys() {
        let keys = vec![
            Key::KEY_A,
            Key::KEY_B,
            Key::KEY_C,
            Key::KEY_D,
            Key::KEY_E,
            Key::KEY_F,
            Key::KEY_G,
        ];
        let report = boot_keyboard_report(&keys);
        assert_eq!(&report[2..8], &[0x04, 0x05, 0x06, 0x07, 0x08, 0x09]);
    }
}
