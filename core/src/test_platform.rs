//! A mock platform for the in-crate tests: controllable clock, dense keymap,
//! a layer stack, and a recorded host-action log.

use std::vec::Vec;

use crate::key_code::{Keycode, KC_NO, KC_TRNS};
use crate::platform::{KeyPos, Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostOp {
    Down(Keycode),
    Up(Keycode),
    Report,
    LayerPushed(u8),
    LayerPopped(u8),
    LayerSet(u8),
}

pub(crate) struct TestPlatform {
    pub now: u32,
    pub layers: Vec<Vec<Vec<Keycode>>>,
    pub default_layer: u8,
    pub stack: Vec<u8>,
    pub log: Vec<(u32, HostOp)>,
}

impl TestPlatform {
    pub fn new(layers: Vec<Vec<Vec<Keycode>>>) -> Self {
        TestPlatform {
            now: 0,
            layers,
            default_layer: 0,
            stack: Vec::new(),
            log: Vec::new(),
        }
    }

    /// The log without report boundaries, which most assertions ignore.
    pub fn key_ops(&self) -> Vec<(u32, HostOp)> {
        self.log
            .iter()
            .copied()
            .filter(|(_, op)| !matches!(op, HostOp::Report))
            .collect()
    }
}

impl Platform for TestPlatform {
    fn now(&self) -> u32 {
        self.now
    }

    fn layer_current(&self) -> u8 {
        self.stack.last().copied().unwrap_or(self.default_layer)
    }

    fn layer_activate(&mut self, layer: u8) {
        self.default_layer = layer;
        self.stack.clear();
        self.log.push((self.now, HostOp::LayerSet(layer)));
    }

    fn layer_push(&mut self, layer: u8) {
        self.stack.push(layer);
        self.log.push((self.now, HostOp::LayerPushed(layer)));
    }

    fn layer_pop(&mut self) {
        if let Some(layer) = self.stack.pop() {
            self.log.push((self.now, HostOp::LayerPopped(layer)));
        }
    }

    fn keycode_at(&self, layer: u8, pos: KeyPos) -> Keycode {
        let kc = self
            .layers
            .get(layer as usize)
            .and_then(|l| l.get(pos.row as usize))
            .and_then(|r| r.get(pos.col as usize))
            .copied()
            .unwrap_or(KC_NO);
        // Transparent entries fall through to the base layer.
        if kc == KC_TRNS && layer != self.default_layer {
            self.keycode_at(self.default_layer, pos)
        } else {
            kc
        }
    }

    fn register(&mut self, keycode: Keycode) {
        self.log.push((self.now, HostOp::Down(keycode)));
    }

    fn unregister(&mut self, keycode: Keycode) {
        self.log.push((self.now, HostOp::Up(keycode)));
    }

    fn send_report(&mut self) {
        self.log.push((self.now, HostOp::Report));
    }
}
