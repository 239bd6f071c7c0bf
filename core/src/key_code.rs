//! Logical key codes.
//!
//! A [`Keycode`] is an opaque 16-bit identifier. The executor never inspects
//! it; only pipelines configured for a given code react to it. A few numeric
//! bands are reserved so that keymaps can carry pipeline triggers inline:
//!
//! | band            | meaning                        |
//! |-----------------|--------------------------------|
//! | `0xE0..=0xE7`   | modifier keys                  |
//! | `0x5100 | l`    | switch to layer `l`            |
//! | `0x5200 | l`    | momentary layer `l`            |
//! | `0x5400 | m`    | one-shot modifier `m`          |
//! | `0x5500 | l`    | one-shot layer `l`             |
//! | `0x5600 | i`    | tap-dance behavior index `i`   |

use core::fmt;

/// An opaque 16-bit logical key identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Keycode(pub u16);

const LAYER_SWITCH_BASE: u16 = 0x5100;
const LAYER_MOMENTARY_BASE: u16 = 0x5200;
const ONE_SHOT_MOD_BASE: u16 = 0x5400;
const ONE_SHOT_LAYER_BASE: u16 = 0x5500;
const TAP_DANCE_BASE: u16 = 0x5600;

impl Keycode {
    pub const fn new(raw: u16) -> Self {
        Keycode(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == KC_NO.0
    }

    /// True for the HID modifier band (LCtrl..RGui).
    pub const fn is_modifier(self) -> bool {
        self.0 >= KC_LCTL.0 && self.0 <= KC_RGUI.0
    }

    /// Switch permanently to `layer`.
    pub const fn layer_switch(layer: u8) -> Self {
        Keycode(LAYER_SWITCH_BASE | layer as u16)
    }

    /// Activate `layer` while held.
    pub const fn layer_momentary(layer: u8) -> Self {
        Keycode(LAYER_MOMENTARY_BASE | layer as u16)
    }

    /// Trigger for a one-shot modifier.
    pub const fn one_shot_mod(index: u8) -> Self {
        Keycode(ONE_SHOT_MOD_BASE | index as u16)
    }

    /// Trigger for a one-shot layer.
    pub const fn one_shot_layer(layer: u8) -> Self {
        Keycode(ONE_SHOT_LAYER_BASE | layer as u16)
    }

    /// Trigger for the tap-dance behavior at `index`.
    pub const fn tap_dance(index: u8) -> Self {
        Keycode(TAP_DANCE_BASE | index as u16)
    }

    pub fn tap_dance_index(self) -> Option<u8> {
        if self.0 & 0xFF00 == TAP_DANCE_BASE {
            Some((self.0 & 0xFF) as u8)
        } else {
            None
        }
    }

    pub fn momentary_layer(self) -> Option<u8> {
        if self.0 & 0xFF00 == LAYER_MOMENTARY_BASE {
            Some((self.0 & 0xFF) as u8)
        } else {
            None
        }
    }
}

impl fmt::Debug for Keycode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keycode({:#06x})", self.0)
    }
}

pub const KC_NO: Keycode = Keycode(0x00);
pub const KC_TRNS: Keycode = Keycode(0x01);

pub const KC_A: Keycode = Keycode(0x04);
pub const KC_B: Keycode = Keycode(0x05);
pub const KC_C: Keycode = Keycode(0x06);
pub const KC_D: Keycode = Keycode(0x07);
pub const KC_E: Keycode = Keycode(0x08);
pub const KC_F: Keycode = Keycode(0x09);
pub const KC_G: Keycode = Keycode(0x0A);
pub const KC_Q: Keycode = Keycode(0x14);
pub const KC_R: Keycode = Keycode(0x15);
pub const KC_S: Keycode = Keycode(0x16);
pub const KC_X: Keycode = Keycode(0x1B);
pub const KC_Z: Keycode = Keycode(0x1D);

pub const KC_1: Keycode = Keycode(0x1E);
pub const KC_2: Keycode = Keycode(0x1F);
pub const KC_3: Keycode = Keycode(0x20);
pub const KC_4: Keycode = Keycode(0x21);
pub const KC_5: Keycode = Keycode(0x22);
pub const KC_0: Keycode = Keycode(0x27);

pub const KC_ENTER: Keycode = Keycode(0x28);
pub const KC_ESC: Keycode = Keycode(0x29);
pub const KC_TAB: Keycode = Keycode(0x2B);
pub const KC_SPACE: Keycode = Keycode(0x2C);

pub const KC_LCTL: Keycode = Keycode(0xE0);
pub const KC_LSFT: Keycode = Keycode(0xE1);
pub const KC_LALT: Keycode = Keycode(0xE2);
pub const KC_LGUI: Keycode = Keycode(0xE3);
pub const KC_RCTL: Keycode = Keycode(0xE4);
pub const KC_RSFT: Keycode = Keycode(0xE5);
pub const KC_RALT: Keycode = Keycode(0xE6);
pub const KC_RGUI: Keycode = Keycode(0xE7);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn modifier_band() {
        assert!(KC_LCTL.is_modifier());
        assert!(KC_RGUI.is_modifier());
        assert!(!KC_A.is_modifier());
        assert!(!Keycode(0xE8).is_modifier());
    }

    #[test]
    fn reserved_bands_round_trip() {
        assert_eq!(Keycode::tap_dance(3).tap_dance_index(), Some(3));
        assert_eq!(KC_A.tap_dance_index(), None);
        assert_eq!(Keycode::layer_momentary(2).momentary_layer(), Some(2));
        assert_eq!(Keycode::layer_switch(2).momentary_layer(), None);
    }
}
