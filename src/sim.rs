//! Keyboard simulator: a mock platform plus a scripted driver.
//!
//! `SimPlatform` implements the core's platform contract with a controllable
//! clock, a dense layers×rows×cols keymap, a layer stack and a recorded
//! host-action log. `Simulator` drives an executor with absolute-time press
//! and release calls, firing pending timeouts at their exact deadlines on the
//! way, so test output is deterministic to the millisecond.
//!
//! The script format is a whitespace-separated list of
//! `d:<row>,<col>` (press), `u:<row>,<col>` (release) and `t:<ms>` (advance
//! time) items, e.g. `d:0,0 t:150 u:0,0`.

use keyweave_core::executor::Executor;
use keyweave_core::key_code::{Keycode, KC_NO, KC_TRNS};
use keyweave_core::platform::{KeyPos, Platform};
use keyweave_core::scheduler::time_reached;
use log::info;

/// One recorded host-side effect, stamped with the clock value at which it
/// happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAction {
    Down(Keycode),
    Up(Keycode),
    Report,
    LayerPushed(u8),
    LayerPopped(u8),
    LayerSet(u8),
}

pub struct SimPlatform {
    pub now: u32,
    layers: Vec<Vec<Vec<Keycode>>>,
    default_layer: u8,
    stack: Vec<u8>,
    pub log: Vec<(u32, HostAction)>,
}

impl SimPlatform {
    /// `layers[layer][row][col]` is the keycode of a position; `KC_TRNS`
    /// entries fall through to the base layer.
    pub fn new(layers: Vec<Vec<Vec<Keycode>>>) -> Self {
        SimPlatform {
            now: 0,
            layers,
            default_layer: 0,
            stack: Vec::new(),
            log: Vec::new(),
        }
    }
}

impl Platform for SimPlatform {
    fn now(&self) -> u32 {
        self.now
    }

    fn layer_current(&self) -> u8 {
        self.stack.last().copied().unwrap_or(self.default_layer)
    }

    fn layer_activate(&mut self, layer: u8) {
        info!("layer set to {layer}");
        self.default_layer = layer;
        self.stack.clear();
        self.log.push((self.now, HostAction::LayerSet(layer)));
    }

    fn layer_push(&mut self, layer: u8) {
        info!("layer {layer} pushed");
        self.stack.push(layer);
        self.log.push((self.now, HostAction::LayerPushed(layer)));
    }

    fn layer_pop(&mut self) {
        if let Some(layer) = self.stack.pop() {
            info!("layer {layer} popped");
            self.log.push((self.now, HostAction::LayerPopped(layer)));
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
        if kc == KC_TRNS && layer != self.default_layer {
            self.keycode_at(self.default_layer, pos)
        } else {
            kc
        }
    }

    fn register(&mut self, keycode: Keycode) {
        self.log.push((self.now, HostAction::Down(keycode)));
    }

    fn unregister(&mut self, keycode: Keycode) {
        self.log.push((self.now, HostAction::Up(keycode)));
    }

    fn send_report(&mut self) {
        self.log.push((self.now, HostAction::Report));
    }
}

pub struct Simulator<'a> {
    exec: Executor<'a, SimPlatform>,
}

impl<'a> Simulator<'a> {
    pub fn new(exec: Executor<'a, SimPlatform>) -> Self {
        Simulator { exec }
    }

    /// Press the key at (row, col) at absolute time `t`, firing any timeouts
    /// due on the way there.
    pub fn press(&mut self, row: u8, col: u8, t: u32) -> bool {
        self.advance_to(t);
        self.exec.process_key(KeyPos::new(row, col), true, t)
    }

    pub fn release(&mut self, row: u8, col: u8, t: u32) -> bool {
        self.advance_to(t);
        self.exec.process_key(KeyPos::new(row, col), false, t)
    }

    /// Move the clock forward to `t`, delivering each pending timeout at its
    /// own deadline.
    pub fn advance_to(&mut self, t: u32) {
        loop {
            match self.exec.scheduler().next_deadline() {
                Some(d) if time_reached(t, d) => {
                    self.exec.platform.now = d;
                    self.exec.tick();
                }
                _ => break,
            }
        }
        self.exec.platform.now = t;
    }

    pub fn reset(&mut self) {
        self.exec.reset();
    }

    pub fn actions(&self) -> &[(u32, HostAction)] {
        &self.exec.platform.log
    }

    /// The log without report boundaries.
    pub fn key_actions(&self) -> Vec<(u32, HostAction)> {
        self.exec
            .platform
            .log
            .iter()
            .copied()
            .filter(|(_, a)| !matches!(a, HostAction::Report))
            .collect()
    }

    pub fn clear_log(&mut self) {
        self.exec.platform.log.clear();
    }

    pub fn executor(&self) -> &Executor<'a, SimPlatform> {
        &self.exec
    }

    /// Run a `d:`/`u:`/`t:` script, starting from the current clock.
    pub fn run_script(&mut self, script: &str) -> Result<(), ScriptError> {
        let mut t = self.exec.platform.now;
        for item in script.split_whitespace() {
            let (kind, val) = item
                .split_once(':')
                .ok_or_else(|| ScriptError::new(item, "expected kind:value"))?;
            match kind {
                "t" => {
                    let delta: u32 = val
                        .parse()
                        .map_err(|_| ScriptError::new(item, "bad time delta"))?;
                    t = t.wrapping_add(delta);
                    self.advance_to(t);
                }
                "d" | "u" => {
                    let (row, col) = val
                        .split_once(',')
                        .ok_or_else(|| ScriptError::new(item, "expected row,col"))?;
                    let row: u8 = row
                        .parse()
                        .map_err(|_| ScriptError::new(item, "bad row"))?;
                    let col: u8 = col
                        .parse()
                        .map_err(|_| ScriptError::new(item, "bad col"))?;
                    if kind == "d" {
                        self.press(row, col, t);
                    } else {
                        self.release(row, col, t);
                    }
                }
                _ => return Err(ScriptError::new(item, "unknown event kind")),
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ScriptError {
    pub item: String,
    pub reason: &'static str,
}

impl ScriptError {
    fn new(item: &str, reason: &'static str) -> Self {
        ScriptError {
            item: item.into(),
            reason,
        }
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bad sim item {:?}: {}", self.item, self.reason)
    }
}

impl std::error::Error for ScriptError {}
