//! The tap-dance pipeline.
//!
//! One configured behavior per trigger keycode. Each behavior selects among
//! its actions by tap count and hold duration: tap once for one output, tap
//! twice for another, hold for a layer. The state machine per behavior:
//!
//! ```text
//! Idle --press--> WaitingForHold      (hold configured at this count)
//!             \-> WaitingForRelease   (no hold, but more taps possible,
//!              \                       or outcome already determined)
//!               \-> immediate emission (nothing left to decide)
//! WaitingForHold --release--> WaitingForTap | resolve tap
//!                --timeout--> Holding (hold action commits)
//!                --other key--> per hold-interruption strategy
//! WaitingForTap --press--> tap count += 1, re-evaluate
//!               --timeout--> resolve tap
//! Holding --release--> undo hold, Idle
//! ```
//!
//! While a decision is pending the behavior captures the chain and withholds
//! interrupting events; they replay on resolution, re-resolved under the hold
//! layer when a hold commits. When the outcome needs no deferral the trigger
//! bypasses the machine and output happens at the original timestamps.

use heapless::Vec;
use log::debug;

use crate::executor::{Disposition, PipelineCtx, PipelineEvent};
use crate::key_buffer::KeyEvent;
use crate::key_code::Keycode;
use crate::platform::{KeyPos, Platform};

pub const TAP_DANCE_MAX_BEHAVIORS: usize = 8;
const WITHHELD_MAX: usize = 8;

pub const DEFAULT_HOLD_TIMEOUT_MS: u32 = 200;
pub const DEFAULT_TAP_TIMEOUT_MS: u32 = 200;

/// What an action produces when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapDanceOutput {
    Key(Keycode),
    Layer(u8),
}

/// How a pending hold reacts to other keys arriving before its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldStrategy {
    /// Interruptions never commit the hold; only the timeout does.
    TapPreferred,
    /// A complete press-then-release of the same interrupting key commits
    /// the hold.
    Balanced,
    /// The first interrupting press commits the hold; that press is then
    /// reprocessed under the activated layer.
    HoldPreferred,
}

/// Is this the tap slot or the hold slot for its tap count?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Tap,
    Hold,
}

#[derive(Debug, Clone, Copy)]
pub struct TapDanceAction {
    /// 1-based. Gaps and sparsity are allowed.
    pub tap_count: u8,
    pub kind: ActionKind,
    pub output: TapDanceOutput,
    /// Only meaningful on hold actions.
    pub strategy: HoldStrategy,
}

impl TapDanceAction {
    pub const fn tap_key(tap_count: u8, keycode: Keycode) -> Self {
        TapDanceAction {
            tap_count,
            kind: ActionKind::Tap,
            output: TapDanceOutput::Key(keycode),
            strategy: HoldStrategy::TapPreferred,
        }
    }

    pub const fn tap_layer(tap_count: u8, layer: u8) -> Self {
        TapDanceAction {
            tap_count,
            kind: ActionKind::Tap,
            output: TapDanceOutput::Layer(layer),
            strategy: HoldStrategy::TapPreferred,
        }
    }

    pub const fn hold_layer(tap_count: u8, layer: u8, strategy: HoldStrategy) -> Self {
        TapDanceAction {
            tap_count,
            kind: ActionKind::Hold,
            output: TapDanceOutput::Layer(layer),
            strategy,
        }
    }

    pub const fn hold_key(tap_count: u8, keycode: Keycode, strategy: HoldStrategy) -> Self {
        TapDanceAction {
            tap_count,
            kind: ActionKind::Hold,
            output: TapDanceOutput::Key(keycode),
            strategy,
        }
    }
}

/// One configured behavior. Immutable after construction.
#[derive(Debug, Clone, Copy)]
pub struct TapDanceBehavior<'a> {
    pub trigger: Keycode,
    pub actions: &'a [TapDanceAction],
    pub hold_timeout: u32,
    pub tap_timeout: u32,
}

impl<'a> TapDanceBehavior<'a> {
    pub const fn new(trigger: Keycode, actions: &'a [TapDanceAction]) -> Self {
        TapDanceBehavior {
            trigger,
            actions,
            hold_timeout: DEFAULT_HOLD_TIMEOUT_MS,
            tap_timeout: DEFAULT_TAP_TIMEOUT_MS,
        }
    }

    pub const fn with_timeouts(mut self, hold_timeout: u32, tap_timeout: u32) -> Self {
        self.hold_timeout = hold_timeout;
        self.tap_timeout = tap_timeout;
        self
    }

    /// Hold actions match their exact tap count only; a hold beyond the
    /// highest configured one degrades to tap.
    fn hold_action_at(&self, count: u8) -> Option<&TapDanceAction> {
        self.actions
            .iter()
            .find(|a| a.kind == ActionKind::Hold && a.tap_count == count)
    }

    /// The tap action for `count`, falling back to the highest configured
    /// tap action below it.
    fn tap_action_up_to(&self, count: u8) -> Option<&TapDanceAction> {
        self.actions
            .iter()
            .filter(|a| a.kind == ActionKind::Tap && a.tap_count <= count)
            .max_by_key(|a| a.tap_count)
    }

    fn has_actions_above(&self, count: u8) -> bool {
        self.actions.iter().any(|a| a.tap_count > count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    WaitingForHold,
    WaitingForRelease,
    WaitingForTap,
    Holding,
}

#[derive(Debug, Clone, Copy)]
struct Withheld {
    pos: KeyPos,
    keycode: Keycode,
    is_press: bool,
}

struct BehaviorStatus {
    state: State,
    tap_count: u8,
    original_layer: u8,
    /// Keycode emitted on the immediate path, owed a release.
    resolved: Option<Keycode>,
    /// True once the outcome of the current press is fixed.
    determined: bool,
    /// What the committed hold activated, undone on release.
    hold_output: Option<TapDanceOutput>,
    /// Deadline of the armed hold or tap timeout.
    deadline: u32,
    withheld: Vec<Withheld, WITHHELD_MAX>,
}

impl BehaviorStatus {
    fn new() -> Self {
        BehaviorStatus {
            state: State::Idle,
            tap_count: 0,
            original_layer: 0,
            resolved: None,
            determined: false,
            hold_output: None,
            deadline: 0,
            withheld: Vec::new(),
        }
    }

    fn reset(&mut self) {
        *self = BehaviorStatus::new();
    }
}

pub struct TapDancePipeline<'a> {
    behaviors: &'a [TapDanceBehavior<'a>],
    statuses: Vec<BehaviorStatus, TAP_DANCE_MAX_BEHAVIORS>,
    /// The behavior currently deciding (and therefore capturing), if any.
    active: Option<usize>,
}

impl<'a> TapDancePipeline<'a> {
    pub fn new(behaviors: &'a [TapDanceBehavior<'a>]) -> Self {
        assert!(behaviors.len() <= TAP_DANCE_MAX_BEHAVIORS);
        let mut statuses = Vec::new();
        for _ in behaviors {
            let _ = statuses.push(BehaviorStatus::new());
        }
        TapDancePipeline {
            behaviors,
            statuses,
            active: None,
        }
    }

    pub fn reset(&mut self) {
        for st in self.statuses.iter_mut() {
            st.reset();
        }
        self.active = None;
    }

    /// True when every behavior is back in `Idle`.
    pub fn is_quiescent(&self) -> bool {
        self.statuses.iter().all(|s| s.state == State::Idle)
    }

    pub fn process<P: Platform>(
        &mut self,
        ev: &PipelineEvent,
        ctx: &mut PipelineCtx<'_, P>,
    ) -> Disposition {
        let disposition = match ev {
            PipelineEvent::Timeout { time } => {
                if let Some(i) = self.active {
                    self.on_timeout(i, *time, ctx);
                }
                Disposition::Consumed
            }
            PipelineEvent::Key(kev) => {
                if let Some(i) = self.active {
                    self.on_event_deciding(i, kev, ctx)
                } else {
                    self.on_event_quiet(kev, ctx)
                }
            }
        };
        self.active = self
            .statuses
            .iter()
            .position(|s| matches!(s.state, State::WaitingForHold | State::WaitingForTap));
        disposition
    }

    /// No behavior is deciding: route trigger presses and pending releases,
    /// pass everything else.
    fn on_event_quiet<P: Platform>(
        &mut self,
        kev: &KeyEvent,
        ctx: &mut PipelineCtx<'_, P>,
    ) -> Disposition {
        if kev.is_press {
            let idx = self
                .behaviors
                .iter()
                .position(|b| b.trigger == kev.keycode)
                .filter(|&i| self.statuses[i].state == State::Idle);
            match idx {
                Some(i) => {
                    let st = &mut self.statuses[i];
                    st.tap_count = 1;
                    st.original_layer = kev.layer;
                    self.eval_press(i, ctx);
                    Disposition::Consumed
                }
                None => Disposition::Pass,
            }
        } else {
            let idx = self
                .behaviors
                .iter()
                .zip(self.statuses.iter())
                .position(|(b, s)| {
                    b.trigger == kev.keycode
                        && matches!(s.state, State::WaitingForRelease | State::Holding)
                });
            match idx {
                Some(i) => {
                    self.on_trigger_release(i, kev.time, ctx);
                    Disposition::Consumed
                }
                None => Disposition::Pass,
            }
        }
    }

    /// Evaluate a trigger press at the current tap count; shared between the
    /// initial press and re-presses in WaitingForTap.
    fn eval_press<P: Platform>(&mut self, i: usize, ctx: &mut PipelineCtx<'_, P>) {
        let b = self.behaviors[i];
        let count = self.statuses[i].tap_count;
        if b.hold_action_at(count).is_some() {
            if ctx.capture_next_keys_or_timeout(b.hold_timeout) {
                let st = &mut self.statuses[i];
                st.state = State::WaitingForHold;
                st.deadline = ctx.time().wrapping_add(b.hold_timeout);
                debug!("tap-dance {}: waiting for hold, count {}", i, count);
                return;
            }
            // No timer slot; fall through and settle as a tap right away.
        } else if b.has_actions_above(count) {
            let st = &mut self.statuses[i];
            st.state = State::WaitingForRelease;
            st.determined = false;
            st.resolved = None;
            return;
        }
        // Outcome determined: emit at the original timestamp and only wait
        // for the release to mirror it.
        let st = &mut self.statuses[i];
        st.state = State::WaitingForRelease;
        st.determined = true;
        st.resolved = None;
        match b.tap_action_up_to(count).map(|a| a.output) {
            Some(TapDanceOutput::Key(kc)) => {
                st.resolved = Some(kc);
                ctx.emit_press(kc);
            }
            Some(TapDanceOutput::Layer(layer)) => ctx.layer_activate(layer),
            None => debug!("tap-dance {}: no action at count {}", i, count),
        }
    }

    /// Release of the trigger while not capturing (WaitingForRelease or
    /// Holding).
    fn on_trigger_release<P: Platform>(
        &mut self,
        i: usize,
        time: u32,
        ctx: &mut PipelineCtx<'_, P>,
    ) {
        let b = self.behaviors[i];
        match self.statuses[i].state {
            State::WaitingForRelease => {
                if self.statuses[i].determined {
                    if let Some(kc) = self.statuses[i].resolved {
                        ctx.emit_release(kc);
                    }
                    self.statuses[i].reset();
                } else if ctx.capture_next_keys_or_timeout(b.tap_timeout) {
                    let st = &mut self.statuses[i];
                    st.state = State::WaitingForTap;
                    st.deadline = time.wrapping_add(b.tap_timeout);
                } else {
                    self.resolve_tap(i, ctx);
                }
            }
            State::Holding => {
                match self.statuses[i].hold_output {
                    Some(TapDanceOutput::Layer(_)) => ctx.layer_pop(),
                    Some(TapDanceOutput::Key(kc)) => ctx.emit_release(kc),
                    None => {}
                }
                self.statuses[i].reset();
            }
            _ => {}
        }
    }

    /// An event delivered while behavior `i` is deciding (capturing).
    fn on_event_deciding<P: Platform>(
        &mut self,
        i: usize,
        kev: &KeyEvent,
        ctx: &mut PipelineCtx<'_, P>,
    ) -> Disposition {
        let is_trigger = self.behaviors[i].trigger == kev.keycode;
        match self.statuses[i].state {
            State::WaitingForHold => self.waiting_for_hold_event(i, kev, is_trigger, ctx),
            State::WaitingForTap => self.waiting_for_tap_event(i, kev, is_trigger, ctx),
            _ => Disposition::Pass,
        }
    }

    fn waiting_for_hold_event<P: Platform>(
        &mut self,
        i: usize,
        kev: &KeyEvent,
        is_trigger: bool,
        ctx: &mut PipelineCtx<'_, P>,
    ) -> Disposition {
        let b = self.behaviors[i];
        if is_trigger && !kev.is_press {
            // Tap candidate.
            let count = self.statuses[i].tap_count;
            if b.has_actions_above(count) {
                self.flush_withheld(i, ctx);
                if ctx.capture_next_keys_or_timeout(b.tap_timeout) {
                    let st = &mut self.statuses[i];
                    st.state = State::WaitingForTap;
                    st.deadline = kev.time.wrapping_add(b.tap_timeout);
                } else {
                    self.resolve_tap(i, ctx);
                }
            } else {
                self.resolve_tap_wrapping_withheld(i, ctx);
            }
            return Disposition::Consumed;
        }
        if !is_trigger {
            let strategy = b
                .hold_action_at(self.statuses[i].tap_count)
                .map(|a| a.strategy)
                .unwrap_or(HoldStrategy::TapPreferred);
            let completes_cycle = !kev.is_press
                && self.statuses[i]
                    .withheld
                    .iter()
                    .any(|w| w.is_press && w.pos == kev.pos);
            self.withhold(i, kev, ctx);
            match strategy {
                HoldStrategy::HoldPreferred if kev.is_press => {
                    self.commit_hold(i, ctx);
                }
                HoldStrategy::Balanced if completes_cycle => {
                    self.commit_hold(i, ctx);
                }
                _ => self.renew_capture(i, ctx),
            }
            return Disposition::Consumed;
        }
        // Trigger press while it is already down cannot happen; keep waiting.
        self.renew_capture(i, ctx);
        Disposition::Consumed
    }

    fn waiting_for_tap_event<P: Platform>(
        &mut self,
        i: usize,
        kev: &KeyEvent,
        is_trigger: bool,
        ctx: &mut PipelineCtx<'_, P>,
    ) -> Disposition {
        if is_trigger && kev.is_press {
            let st = &mut self.statuses[i];
            st.tap_count = st.tap_count.saturating_add(1);
            self.eval_press(i, ctx);
            return Disposition::Consumed;
        }
        if !is_trigger {
            // Other keys do not affect the sequence; they pass on unchanged
            // while the capture stays armed for the trigger.
            self.renew_capture(i, ctx);
            return Disposition::Pass;
        }
        self.renew_capture(i, ctx);
        Disposition::Consumed
    }

    fn on_timeout<P: Platform>(&mut self, i: usize, time: u32, ctx: &mut PipelineCtx<'_, P>) {
        let _ = time;
        match self.statuses[i].state {
            State::WaitingForHold => self.commit_hold(i, ctx),
            State::WaitingForTap => self.resolve_tap(i, ctx),
            _ => {}
        }
    }

    /// Emit the tap action for the current count as a press-release pair and
    /// go idle. Used when the trigger is already up.
    fn resolve_tap<P: Platform>(&mut self, i: usize, ctx: &mut PipelineCtx<'_, P>) {
        let b = self.behaviors[i];
        let st = &mut self.statuses[i];
        match b.tap_action_up_to(st.tap_count).map(|a| a.output) {
            Some(TapDanceOutput::Key(kc)) => ctx.emit_tap(kc),
            Some(TapDanceOutput::Layer(layer)) => ctx.layer_activate(layer),
            None => {}
        }
        st.reset();
    }

    /// Resolve a tap on trigger release: tap press, withheld replay, tap
    /// release, in that order.
    fn resolve_tap_wrapping_withheld<P: Platform>(
        &mut self,
        i: usize,
        ctx: &mut PipelineCtx<'_, P>,
    ) {
        let b = self.behaviors[i];
        let output = b
            .tap_action_up_to(self.statuses[i].tap_count)
            .map(|a| a.output);
        match output {
            Some(TapDanceOutput::Key(kc)) => {
                ctx.emit_press(kc);
                self.flush_withheld(i, ctx);
                ctx.emit_release(kc);
            }
            Some(TapDanceOutput::Layer(layer)) => {
                ctx.layer_activate(layer);
                self.flush_withheld(i, ctx);
            }
            None => self.flush_withheld(i, ctx),
        }
        self.statuses[i].reset();
    }

    /// Commit the hold action, replay withheld events under the activated
    /// layer, and move to Holding.
    fn commit_hold<P: Platform>(&mut self, i: usize, ctx: &mut PipelineCtx<'_, P>) {
        let b = self.behaviors[i];
        let output = b
            .hold_action_at(self.statuses[i].tap_count)
            .map(|a| a.output);
        match output {
            Some(TapDanceOutput::Layer(layer)) => {
                ctx.layer_push(layer);
                self.statuses[i].hold_output = Some(TapDanceOutput::Layer(layer));
            }
            Some(TapDanceOutput::Key(kc)) => {
                ctx.emit_press(kc);
                self.statuses[i].hold_output = Some(TapDanceOutput::Key(kc));
            }
            None => {}
        }
        self.flush_withheld_reresolved(i, ctx);
        let st = &mut self.statuses[i];
        st.state = State::Holding;
        st.withheld.clear();
        debug!(
            "tap-dance {}: hold committed at count {} (sequence began on layer {})",
            i, st.tap_count, st.original_layer
        );
    }

    fn withhold<P: Platform>(&mut self, i: usize, kev: &KeyEvent, ctx: &mut PipelineCtx<'_, P>) {
        let item = Withheld {
            pos: kev.pos,
            keycode: kev.keycode,
            is_press: kev.is_press,
        };
        if self.statuses[i].withheld.push(item).is_err() {
            // Bounded memory: hand the backlog through unchanged and keep
            // deciding with an empty withheld buffer.
            debug!("tap-dance {}: withheld buffer full, flushing", i);
            self.flush_withheld(i, ctx);
            let _ = self.statuses[i].withheld.push(item);
        }
    }

    /// Replay withheld events with their original keycodes, oldest first.
    fn flush_withheld<P: Platform>(&mut self, i: usize, ctx: &mut PipelineCtx<'_, P>) {
        let mut withheld = Vec::<Withheld, WITHHELD_MAX>::new();
        core::mem::swap(&mut withheld, &mut self.statuses[i].withheld);
        for w in withheld.iter() {
            if w.is_press {
                ctx.replay_press(w.keycode, w.pos);
            } else {
                ctx.replay_release(w.keycode, w.pos);
            }
        }
    }

    /// Replay withheld events re-resolved under the now-active layer, so the
    /// keys take effect as the layer the hold activated defines them.
    fn flush_withheld_reresolved<P: Platform>(&mut self, i: usize, ctx: &mut PipelineCtx<'_, P>) {
        let mut withheld = Vec::<Withheld, WITHHELD_MAX>::new();
        core::mem::swap(&mut withheld, &mut self.statuses[i].withheld);
        let layer = ctx.layer_current();
        let mut remapped = Vec::<(KeyPos, Keycode), WITHHELD_MAX>::new();
        for w in withheld.iter() {
            if w.is_press {
                let kc = ctx.keycode_at(layer, w.pos);
                let _ = remapped.push((w.pos, kc));
                ctx.replay_press(kc, w.pos);
            } else {
                let kc = remapped
                    .iter()
                    .rev()
                    .find(|(pos, _)| *pos == w.pos)
                    .map(|(_, kc)| *kc)
                    .unwrap_or(w.keycode);
                ctx.replay_release(kc, w.pos);
            }
        }
    }

    /// Keep capturing until the already-armed deadline.
    fn renew_capture<P: Platform>(&mut self, i: usize, ctx: &mut PipelineCtx<'_, P>) {
        let remaining = self.statuses[i].deadline.wrapping_sub(ctx.time());
        if !ctx.capture_next_keys_or_timeout(remaining) {
            // No timer slot left; settle now rather than hang.
            match self.statuses[i].state {
                State::WaitingForHold => {
                    let b = self.behaviors[i];
                    let output = b
                        .tap_action_up_to(self.statuses[i].tap_count)
                        .map(|a| a.output);
                    if let Some(TapDanceOutput::Key(kc)) = output {
                        ctx.emit_press(kc);
                        self.flush_withheld(i, ctx);
                        let st = &mut self.statuses[i];
                        st.state = State::WaitingForRelease;
                        st.determined = true;
                        st.resolved = Some(kc);
                    } else {
                        self.flush_withheld(i, ctx);
                        let st = &mut self.statuses[i];
                        st.state = State::WaitingForRelease;
                        st.determined = true;
                        st.resolved = None;
                    }
                }
                State::WaitingForTap => self.resolve_tap(i, ctx),
                _ => {}
            }
        }
    }
}
