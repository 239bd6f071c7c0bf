//! The combo pipeline.
//!
//! A combo is a set of key positions that, pressed together within a window,
//! produce a configured output instead of the individual keys. While a
//! candidate accumulates, its member presses are withheld from the rest of
//! the chain: on success they are discarded (the combo's own output replaces
//! them), on failure they replay in their original order and fall through as
//! plain keys.
//!
//! Per combo: Idle -> WaitingForKeys (some members down) ->
//! WaitingForConfirmation (all members down, window armed) -> Active ->
//! Idle once every member is back up. The release translation fires on the
//! first member release; member events are swallowed for as long as the
//! combo is active.

use heapless::Vec;
use log::debug;

use crate::executor::{Disposition, PipelineCtx, PipelineEvent};
use crate::key_buffer::KeyEvent;
use crate::key_code::Keycode;
use crate::platform::{KeyPos, Platform};

pub const COMBO_MAX: usize = 8;
pub const COMBO_MAX_KEYS: usize = 8;
const COMBO_WITHHELD_MAX: usize = 16;

pub const COMBO_DEFAULT_WINDOW_MS: u32 = 50;

/// What a combo does when it fully activates or releases.
#[derive(Debug, Clone, Copy)]
pub enum ComboAction<'a> {
    NoOp,
    /// Press and keep holding this keycode.
    Register(Keycode),
    /// Release a previously registered keycode.
    Unregister(Keycode),
    /// Press and immediately release.
    Tap(Keycode),
    /// Tap each keycode in order.
    Sequence(&'a [Keycode]),
}

/// One configured combo. Immutable after construction.
#[derive(Debug, Clone, Copy)]
pub struct Combo<'a> {
    pub keys: &'a [KeyPos],
    pub on_press: ComboAction<'a>,
    pub on_release: ComboAction<'a>,
    /// Minimum co-press window: all members must be down this long.
    pub window_ms: u32,
}

impl<'a> Combo<'a> {
    pub const fn new(
        keys: &'a [KeyPos],
        on_press: ComboAction<'a>,
        on_release: ComboAction<'a>,
    ) -> Self {
        Combo {
            keys,
            on_press,
            on_release,
            window_ms: COMBO_DEFAULT_WINDOW_MS,
        }
    }

    pub const fn with_window(mut self, window_ms: u32) -> Self {
        self.window_ms = window_ms;
        self
    }

    fn member_index(&self, pos: KeyPos) -> Option<usize> {
        self.keys.iter().position(|k| *k == pos)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ComboState {
    Idle,
    WaitingForKeys,
    WaitingForConfirmation,
    Active,
}

#[derive(Debug, Clone, Copy)]
struct ComboStatus {
    state: ComboState,
    /// Bitmask over the combo's key list of members currently down.
    down: u8,
    release_fired: bool,
}

impl ComboStatus {
    fn new() -> Self {
        ComboStatus {
            state: ComboState::Idle,
            down: 0,
            release_fired: false,
        }
    }
}

pub struct ComboPipeline<'a> {
    combos: &'a [Combo<'a>],
    statuses: Vec<ComboStatus, COMBO_MAX>,
    /// Member presses withheld while candidates accumulate.
    withheld: Vec<KeyEvent, COMBO_WITHHELD_MAX>,
    /// Positions accumulated so far.
    pressed: Vec<KeyPos, COMBO_MAX_KEYS>,
    /// Combos the accumulated presses could still complete.
    candidates: Vec<u8, COMBO_MAX>,
    accumulating: bool,
    deadline: u32,
}

impl<'a> ComboPipeline<'a> {
    pub fn new(combos: &'a [Combo<'a>]) -> Self {
        assert!(combos.len() <= COMBO_MAX);
        let mut statuses = Vec::new();
        for _ in combos {
            let _ = statuses.push(ComboStatus::new());
        }
        ComboPipeline {
            combos,
            statuses,
            withheld: Vec::new(),
            pressed: Vec::new(),
            candidates: Vec::new(),
            accumulating: false,
            deadline: 0,
        }
    }

    pub fn reset(&mut self) {
        for st in self.statuses.iter_mut() {
            *st = ComboStatus::new();
        }
        self.withheld.clear();
        self.pressed.clear();
        self.candidates.clear();
        self.accumulating = false;
    }

    pub fn is_quiescent(&self) -> bool {
        !self.accumulating && self.statuses.iter().all(|s| s.state == ComboState::Idle)
    }

    pub fn process<P: Platform>(
        &mut self,
        ev: &PipelineEvent,
        ctx: &mut PipelineCtx<'_, P>,
    ) -> Disposition {
        match ev {
            PipelineEvent::Timeout { .. } => {
                match self.best_complete_candidate() {
                    Some(c) => self.activate(c, ctx),
                    None => self.abort(None, ctx),
                }
                Disposition::Consumed
            }
            PipelineEvent::Key(kev) => {
                if self.accumulating {
                    self.on_event_accumulating(kev, ctx)
                } else {
                    self.on_event_quiet(kev, ctx)
                }
            }
        }
    }

    fn on_event_quiet<P: Platform>(
        &mut self,
        kev: &KeyEvent,
        ctx: &mut PipelineCtx<'_, P>,
    ) -> Disposition {
        if kev.is_press {
            // A member of an active combo pressed again: swallow, and track
            // it so the matching release is swallowed too.
            let repress = self.combos.iter().enumerate().find_map(|(c, combo)| {
                if self.statuses[c].state == ComboState::Active {
                    combo.member_index(kev.pos).map(|m| (c, m))
                } else {
                    None
                }
            });
            if let Some((c, m)) = repress {
                self.statuses[c].down |= 1 << m;
                return Disposition::Consumed;
            }
            let mut found = false;
            for (c, combo) in self.combos.iter().enumerate() {
                if self.statuses[c].state == ComboState::Idle && combo.member_index(kev.pos).is_some()
                {
                    let _ = self.candidates.push(c as u8);
                    found = true;
                }
            }
            if !found {
                return Disposition::Pass;
            }
            let _ = self.pressed.push(kev.pos);
            let _ = self.withheld.push(*kev);
            self.accumulating = true;
            self.mark_candidate_states();
            self.arm_window(kev.time, ctx);
            Disposition::Consumed
        } else {
            match self.active_member(kev.pos) {
                Some((c, m)) => {
                    if !self.statuses[c].release_fired {
                        self.statuses[c].release_fired = true;
                        let action = self.combos[c].on_release;
                        Self::apply(action, ctx);
                    }
                    let st = &mut self.statuses[c];
                    st.down &= !(1 << m);
                    if st.down == 0 {
                        *st = ComboStatus::new();
                        debug!("combo {}: all members up", c);
                    }
                    Disposition::Consumed
                }
                None => Disposition::Pass,
            }
        }
    }

    fn on_event_accumulating<P: Platform>(
        &mut self,
        kev: &KeyEvent,
        ctx: &mut PipelineCtx<'_, P>,
    ) -> Disposition {
        if kev.is_press {
            // Keep only candidates that contain every press so far plus this.
            let pressed = &self.pressed;
            let combos = self.combos;
            let mut next = Vec::<u8, COMBO_MAX>::new();
            for &c in self.candidates.iter() {
                let combo = &combos[c as usize];
                if combo.member_index(kev.pos).is_some()
                    && pressed.iter().all(|p| combo.member_index(*p).is_some())
                {
                    let _ = next.push(c);
                }
            }
            if next.is_empty() {
                // A key outside every candidate: the combo attempt failed.
                self.abort(Some(kev), ctx);
                return Disposition::Consumed;
            }
            self.candidates = next;
            let _ = self.pressed.push(kev.pos);
            if self.withheld.push(*kev).is_err() {
                debug!("combo withheld buffer full, aborting");
                self.abort(None, ctx);
                return Disposition::Consumed;
            }
            self.mark_candidate_states();
            self.arm_window(kev.time, ctx);
            Disposition::Consumed
        } else if self.pressed.contains(&kev.pos) {
            // A member came back up before the window: failure, replay.
            self.abort(Some(kev), ctx);
            Disposition::Consumed
        } else {
            // A release of some unrelated key: let it through and keep
            // accumulating for the rest of the window.
            let remaining = self.deadline.wrapping_sub(kev.time);
            if !ctx.capture_next_keys_or_timeout(remaining) {
                match self.best_complete_candidate() {
                    Some(c) => self.activate(c, ctx),
                    None => self.abort(None, ctx),
                }
            }
            Disposition::Pass
        }
    }

    /// The largest candidate whose members are all down.
    fn best_complete_candidate(&self) -> Option<usize> {
        self.candidates
            .iter()
            .map(|&c| c as usize)
            .filter(|&c| {
                self.combos[c]
                    .keys
                    .iter()
                    .all(|k| self.pressed.contains(k))
            })
            .max_by_key(|&c| self.combos[c].keys.len())
    }

    fn activate<P: Platform>(&mut self, c: usize, ctx: &mut PipelineCtx<'_, P>) {
        debug!("combo {}: activated", c);
        let combo = self.combos[c];
        Self::apply(combo.on_press, ctx);
        for &cand in self.candidates.iter() {
            self.statuses[cand as usize].state = ComboState::Idle;
        }
        let st = &mut self.statuses[c];
        st.state = ComboState::Active;
        st.down = full_mask(combo.keys.len());
        st.release_fired = false;
        // The members' own presses are discarded; the combo output replaced
        // them.
        self.withheld.clear();
        self.pressed.clear();
        self.candidates.clear();
        self.accumulating = false;
    }

    /// Replay everything withheld in original order, then the event that
    /// caused the failure, and go back to idle.
    fn abort<P: Platform>(&mut self, extra: Option<&KeyEvent>, ctx: &mut PipelineCtx<'_, P>) {
        let mut withheld = Vec::<KeyEvent, COMBO_WITHHELD_MAX>::new();
        core::mem::swap(&mut withheld, &mut self.withheld);
        for w in withheld.iter() {
            if w.is_press {
                ctx.replay_press(w.keycode, w.pos);
            } else {
                ctx.replay_release(w.keycode, w.pos);
            }
        }
        if let Some(kev) = extra {
            if kev.is_press {
                ctx.replay_press(kev.keycode, kev.pos);
            } else {
                ctx.replay_release(kev.keycode, kev.pos);
            }
        }
        for &cand in self.candidates.iter() {
            self.statuses[cand as usize].state = ComboState::Idle;
        }
        self.pressed.clear();
        self.candidates.clear();
        self.accumulating = false;
    }

    /// Members of an active combo, looked up by position.
    fn active_member(&self, pos: KeyPos) -> Option<(usize, usize)> {
        self.combos.iter().enumerate().find_map(|(c, combo)| {
            if self.statuses[c].state != ComboState::Active {
                return None;
            }
            combo
                .member_index(pos)
                .filter(|&m| self.statuses[c].down & (1 << m) != 0)
                .map(|m| (c, m))
        })
    }

    fn mark_candidate_states(&mut self) {
        for &c in self.candidates.iter() {
            let complete = self.combos[c as usize]
                .keys
                .iter()
                .all(|k| self.pressed.contains(k));
            self.statuses[c as usize].state = if complete {
                ComboState::WaitingForConfirmation
            } else {
                ComboState::WaitingForKeys
            };
        }
    }

    /// The co-press window restarts from the most recent member press.
    fn arm_window<P: Platform>(&mut self, time: u32, ctx: &mut PipelineCtx<'_, P>) {
        let window = self
            .candidates
            .iter()
            .map(|&c| self.combos[c as usize].window_ms)
            .min()
            .unwrap_or(COMBO_DEFAULT_WINDOW_MS);
        self.deadline = time.wrapping_add(window);
        if !ctx.capture_next_keys_or_timeout(window) {
            // No timer available: settle immediately instead of capturing.
            match self.best_complete_candidate() {
                Some(c) => self.activate(c, ctx),
                None => self.abort(None, ctx),
            }
        }
    }

    fn apply<P: Platform>(action: ComboAction<'_>, ctx: &mut PipelineCtx<'_, P>) {
        match action {
            ComboAction::NoOp => {}
            ComboAction::Register(kc) => ctx.emit_press(kc),
            ComboAction::Unregister(kc) => ctx.emit_release(kc),
            ComboAction::Tap(kc) => ctx.emit_tap(kc),
            ComboAction::Sequence(seq) => {
                for kc in seq {
                    ctx.emit_tap(*kc);
                }
            }
        }
    }
}

fn full_mask(len: usize) -> u8 {
    ((1u16 << len) - 1) as u8
}
