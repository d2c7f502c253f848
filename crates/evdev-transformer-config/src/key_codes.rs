//! Key name <-> evdev key code mapping used by configuration validation.

use evdev::Key;

/// Parse a kernel key name (`"KEY_A"`, `"KEY_LEFTCTRL"`, ...) into its evdev
/// `Key`. Accepts the name with or without the `KEY_` prefix and is
/// case-insensitive, since hand-written configs are inconsistent about
/// casing.
pub fn parse_key_name(name: &str) -> Option<Key> {
    let upper = name.to_uppercase();
    let stripped = upper.strip_prefix("KEY_").unwrap_or(&upper);
    match stripped {
        "ESC" | "ESCAPE" => Some(Key::KEY_ESC),
        "1" => Some(Key::KEY_1),
        "2" => Some(Key::KEY_2),
        "3" => Some(Key::KEY_3),
        "4" => Some(Key::KEY_4),
        "5" => Some(Key::KEY_5),
        "6" => Some(Key::KEY_6),
        "7" => Some(Key::KEY_7),
        "8" => Some(Key::KEY_8),
        "9" => Some(Key::KEY_9),
        "0" => Some(Key::KEY_0),
        "MINUS" => Some(Key::KEY_MINUS),
        "EQUAL" => Some(Key::KEY_EQUAL),
        "BACKSPACE" => Some(Key::KEY_BACKSPACE),
        "TAB" => Some(Key::KEY_TAB),
        "Q" => Some(Key::KEY_Q),
        "W" => Some(Key::KEY_W),
        "E" => Some(Key::KEY_E),
        "R" => Some(Key::KEY_R),
        "T" => Some(Key::KEY_T),
        "Y" => Some(Key::KEY_Y),
        "U" => Some(Key::KEY_U),
        "I" => Some(Key::KEY_I),
        "O" => Some(Key::KEY_O),
        "P" => Some(Key::KEY_P),
        "LEFTBRACE" => Some(Key::KEY_LEFTBRACE),
        "RIGHTBRACE" => Some(Key::KEY_RIGHTBRACE),
        "ENTER" | "RETURN" => Some(Key::KEY_ENTER),
        "LEFTCTRL" | "LCTRL" | "CTRL" => Some(Key::KEY_LEFTCTRL),
        "A" => Some(Key::KEY_A),
        "S" => Some(Key::KEY_S),
        "D" => Some(Key::KEY_D),
        "F" => Some(Key::KEY_F),
        "G" => Some(Key::KEY_G),
        "H" => Some(Key::KEY_H),
        "J" => Some(Key::KEY_J),
        "K" => Some(Key::KEY_K),
        "L" => Some(Key::KEY_L),
        "SEMICOLON" => Some(Key::KEY_SEMICOLON),
        "APOSTROPHE" => Some(Key::KEY_APOSTROPHE),
        "GRAVE" => Some(Key::KEY_GRAVE),
        "LEFTSHIFT" | "LSHIFT" | "SHIFT" => Some(Key::KEY_LEFTSHIFT),
        "BACKSLASH" => Some(Key::KEY_BACKSLASH),
        "Z" => Some(Key::KEY_Z),
        "X" => Some(Key::KEY_X),
        "C" => Some(Key::KEY_C),
        "V" => Some(Key::KEY_V),
        "B" => Some(Key::KEY_B),
        "N" => Some(Key::KEY_N),
        "M" => Some(Key::KEY_M),
        "COMMA" => Some(Key::KEY_COMMA),
        "DOT" => Some(Key::KEY_DOT),
        "SLASH" => Some(Key::KEY_SLASH),
        "RIGHTSHIFT" | "RSHIFT" => Some(Key::KEY_RIGHTSHIFT),
        "KPASTERISK" => Some(Key::KEY_KPASTERISK),
        "LEFTALT" | "LALT" | "ALT" => Some(Key::KEY_LEFTALT),
        "SPACE" => Some(Key::KEY_SPACE),
        "CAPSLOCK" | "CAPS_LOCK" | "CAPS" => Some(Key::KEY_CAPSLOCK),
        "F1" => Some(Key::KEY_F1),
        "F2" => Some(Key::KEY_F2),
        "F3" => Some(Key::KEY_F3),
        "F4" => Some(Key::KEY_F4),
        "F5" => Some(Key::KEY_F5),
        "F6" => Some(Key::KEY_F6),
        "F7" => Some(Key::KEY_F7),
        "F8" => Some(Key::KEY_F8),
        "F9" => Some(Key::KEY_F9),
        "F10" => Some(Key::KEY_F10),
        "F11" => Some(Key::KEY_F11),
        "F12" => Some(Key::KEY_F12),
        "NUMLOCK" => Some(Key::KEY_NUMLOCK),
        "SCROLLLOCK" => Some(Key::KEY_SCROLLLOCK),
        "RIGHTCTRL" | "RCTRL" => Some(Key::KEY_RIGHTCTRL),
        "RIGHTALT" | "RALT" => Some(Key::KEY_RIGHTALT),
        "HOME" => Some(Key::KEY_HOME),
        "UP" => Some(Key::KEY_UP),
        "PAGEUP" => Some(Key::KEY_PAGEUP),
        "LEFT" => Some(Key::KEY_LEFT),
        "RIGHT" => Some(Key::KEY_RIGHT),
        "END" => Some(Key::KEY_END),
        "DOWN" => Some(Key::KEY_DOWN),
        "PAGEDOWN" => Some(Key::KEY_PAGEDOWN),
        "INSERT" => Some(Key::KEY_INSERT),
        "DELETE" => Some(Key::KEY_DELETE),
        "LEFTMETA" | "LMETA" | "SUPER" | "META" | "WIN" => Some(Key::KEY_LEFTMETA),
        "RIGHTMETA" | "RMETA" => Some(Key::KEY_RIGHTMETA),
        "COMPOSE" | "MENU" => Some(Key::KEY_COMPOSE),
        "MUTE" => Some(Key::KEY_MUTE),
        "VOLUMEDOWN" => Some(Key::KEY_VOLUMEDOWN),
        "VOLUMEUP" => Some(Key::KEY_VOLUMEUP),
        "PLAYPAUSE" => Some(Key::KEY_PLAYPAUSE),
        "NEXTSONG" => Some(Key::KEY_NEXTSONG),
        "PREVIOUSSONG" => Some(Key::KEY_PREVIOUSSONG),
        // mouse buttons, since a source's "key" set also covers EV_KEY button codes
        "BTN_LEFT" | "MOUSE_LEFT" => Some(Key::BTN_LEFT),
        "BTN_RIGHT" | "MOUSE_RIGHT" => Some(Key::BTN_RIGHT),
        "BTN_MIDDLE" | "MOUSE_MIDDLE" => Some(Key::BTN_MIDDLE),
        "BTN_SIDE" => Some(Key::BTN_SIDE),
        "BTN_EXTRA" => Some(Key::BTN_EXTRA),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_and_without_prefix() {
        assert_eq!(parse_key_name("KEY_A"), Some(Key::KEY_A));
        assert_eq!(parse_key_name("a"), Some(Key::KEY_A));
        assert_eq!(parse_key_name("KEY_CAPSLOCK"), Some(Key::KEY_CAPSLOCK));
    }

    #[test]
    fn rejects_unknown_names() {
        assert_eq!(parse_key_name("KEY_NOT_A_REAL_KEY"), None);
    }
}
