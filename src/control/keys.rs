//! Host key code to protocol key code translation.
//!
//! Host key codes follow the Android `KeyEvent` numbering.

/// Dummy key code sent as a key-down to probe server liveness.
pub const KEEP_ALIVE_KEY_CODE: i32 = 1000;

pub mod host {
    pub const KEYCODE_HOME: i32 = 3;
    pub const KEYCODE_BACK: i32 = 4;
    pub const KEYCODE_0: i32 = 7;
    pub const KEYCODE_1: i32 = 8;
    pub const KEYCODE_2: i32 = 9;
    pub const KEYCODE_3: i32 = 10;
    pub const KEYCODE_4: i32 = 11;
    pub const KEYCODE_5: i32 = 12;
    pub const KEYCODE_6: i32 = 13;
    pub const KEYCODE_7: i32 = 14;
    pub const KEYCODE_8: i32 = 15;
    pub const KEYCODE_9: i32 = 16;
    pub const KEYCODE_POUND: i32 = 18;
    pub const KEYCODE_DPAD_UP: i32 = 19;
    pub const KEYCODE_DPAD_DOWN: i32 = 20;
    pub const KEYCODE_DPAD_LEFT: i32 = 21;
    pub const KEYCODE_DPAD_RIGHT: i32 = 22;
    pub const KEYCODE_DPAD_CENTER: i32 = 23;
    pub const KEYCODE_DEL: i32 = 67;
    pub const KEYCODE_MENU: i32 = 82;
    pub const KEYCODE_SEARCH: i32 = 84;
    pub const KEYCODE_MEDIA_PLAY_PAUSE: i32 = 85;
    pub const KEYCODE_MEDIA_STOP: i32 = 86;
    pub const KEYCODE_MEDIA_NEXT: i32 = 87;
    pub const KEYCODE_MEDIA_PREVIOUS: i32 = 88;
    pub const KEYCODE_MEDIA_REWIND: i32 = 89;
    pub const KEYCODE_MEDIA_FAST_FORWARD: i32 = 90;
    pub const KEYCODE_F6: i32 = 136;
    pub const KEYCODE_F7: i32 = 137;
    pub const KEYCODE_F9: i32 = 139;
    pub const KEYCODE_F11: i32 = 141;
    pub const KEYCODE_F12: i32 = 142;
    pub const KEYCODE_GUIDE: i32 = 172;
    pub const KEYCODE_BOOKMARK: i32 = 174;
    pub const KEYCODE_PROG_RED: i32 = 183;
    pub const KEYCODE_PROG_GREEN: i32 = 184;
    pub const KEYCODE_PROG_YELLOW: i32 = 185;
    pub const KEYCODE_PROG_BLUE: i32 = 186;
}

/// Protocol key code for a host key, or `None` for keys the server does not take.
pub fn to_protocol(host_key: i32) -> Option<i32> {
    use host::*;

    let code = match host_key {
        KEYCODE_1 => 2,
        KEYCODE_2 => 3,
        KEYCODE_3 => 4,
        KEYCODE_4 => 5,
        KEYCODE_5 => 6,
        KEYCODE_6 => 7,
        KEYCODE_7 => 8,
        KEYCODE_8 => 9,
        KEYCODE_9 => 10,
        KEYCODE_0 => 11,
        KEYCODE_POUND => 13,
        KEYCODE_BACK => 14,
        KEYCODE_DPAD_CENTER => 28,
        KEYCODE_MEDIA_NEXT => 51,
        KEYCODE_MEDIA_PREVIOUS => 52,
        KEYCODE_SEARCH => 63,
        KEYCODE_GUIDE => 64,
        KEYCODE_MENU => 65,
        KEYCODE_BOOKMARK => 66,
        // Colour keys share codes with the media transport keys.
        KEYCODE_MEDIA_PLAY_PAUSE | KEYCODE_PROG_YELLOW => 67,
        KEYCODE_MEDIA_STOP | KEYCODE_PROG_GREEN => 68,
        KEYCODE_HOME => 71,
        KEYCODE_DPAD_UP => 72,
        KEYCODE_DPAD_LEFT => 75,
        KEYCODE_DPAD_RIGHT => 77,
        KEYCODE_DPAD_DOWN => 80,
        KEYCODE_DEL => 83,
        KEYCODE_MEDIA_REWIND | KEYCODE_PROG_RED => 87,
        KEYCODE_MEDIA_FAST_FORWARD | KEYCODE_PROG_BLUE => 88,
        KEYCODE_F6 => 90,
        KEYCODE_F9 => 91,
        KEYCODE_F7 => 97,
        KEYCODE_F11 => 98,
        KEYCODE_F12 => 99,
        _ => return None,
    };
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::host::*;
    use super::*;

    #[test]
    fn digits_map_to_contiguous_codes() {
        let digits = [KEYCODE_1, KEYCODE_2, KEYCODE_3, KEYCODE_4, KEYCODE_5, KEYCODE_6, KEYCODE_7, KEYCODE_8, KEYCODE_9];
        for (i, key) in digits.into_iter().enumerate() {
            assert_eq!(to_protocol(key), Some(i as i32 + 2));
        }
        assert_eq!(to_protocol(KEYCODE_0), Some(11));
    }

    #[test]
    fn navigation_and_shared_codes() {
        assert_eq!(to_protocol(KEYCODE_DPAD_CENTER), Some(28));
        assert_eq!(to_protocol(KEYCODE_DPAD_DOWN), Some(80));
        assert_eq!(to_protocol(KEYCODE_PROG_YELLOW), to_protocol(KEYCODE_MEDIA_PLAY_PAUSE));
        assert_eq!(to_protocol(KEYCODE_PROG_BLUE), Some(88));
        assert_eq!(to_protocol(KEYCODE_F12), Some(99));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert_eq!(to_protocol(0), None);
        assert_eq!(to_protocol(KEEP_ALIVE_KEY_CODE), None);
        assert_eq!(to_protocol(-1), None);
    }
}
