//! The pipeline executor.
//!
//! Owns the ordered physical chain, the ordered virtual chain, the paired
//! key-event buffers and the deferred-callback scheduler. Matrix events enter
//! through [`Executor::process_key`]; timer expiry enters through
//! [`Executor::tick`]. Both end up in the same drain loop, which hands each
//! buffered event to the chain (or to the currently capturing pipeline) and
//! forwards whatever survives the physical chain across the virtual boundary
//! to host output.
//!
//! Capture is a single slot, not a stack. While a pipeline captures, every
//! event is delivered to it alone, with one exception: events that the
//! capturing pipeline emitted itself are its output, and re-enter the chain
//! at its successor. That is what the provenance stamp on emitted events is
//! for.

use arraydeque::ArrayDeque;
use heapless::Vec;
use log::{debug, warn};
use thiserror::Error;

use crate::combo::ComboPipeline;
use crate::key_buffer::{BufferError, EventSource, KeyBuffer, KeyEvent};
use crate::key_code::Keycode;
use crate::key_replacer::KeyReplacerPipeline;
use crate::one_shot::OneShotPipeline;
use crate::platform::{KeyPos, Platform};
use crate::scheduler::{time_reached, DeferredScheduler, Token, INVALID_TOKEN};
use crate::tap_dance::TapDancePipeline;

/// Maximum pipelines per chain.
pub const MAX_PIPELINES: usize = 4;

/// Row used for the synthetic positions of pipeline-produced keys. Real
/// matrix positions never collide with it, which keeps the active-press
/// bookkeeping of produced keys separate from the physical keys that caused
/// them.
pub const VIRTUAL_ROW: u8 = 0xFF;

const VIRT_QUEUE: usize = 16;
pub(crate) const VIRT_EMIT_MAX: usize = 8;

/// What a pipeline callback receives.
#[derive(Debug, Clone, Copy)]
pub enum PipelineEvent {
    Key(KeyEvent),
    /// The capture timeout this pipeline requested has expired. `time` is the
    /// deadline that was armed, not the instant `tick` happened to run.
    Timeout { time: u32 },
}

/// What a pipeline decided about the event it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The next stage sees the event unchanged.
    Pass,
    /// The event stops here; anything the pipeline emitted replaces it.
    Consumed,
}

/// A logical key event crossing the virtual boundary.
#[derive(Debug, Clone, Copy)]
pub struct VirtualEvent {
    pub keycode: Keycode,
    pub is_press: bool,
    pub time: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum VirtItem {
    Key(VirtualEvent),
    Report,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ArmedTimer {
    pub(crate) token: Token,
    pub(crate) deadline: u32,
}

/// Set by a pipeline callback through the capture API; an untouched outcome
/// is an implicit release of the chain.
#[derive(Default)]
pub(crate) struct CaptureOutcome {
    pub(crate) requested: Option<Option<ArmedTimer>>,
}

#[derive(Clone, Copy)]
struct Capture {
    pipeline: u8,
    timer: Option<ArmedTimer>,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("pipeline chain is full")]
    ChainFull,
}

/// A pipeline in the physical chain: sees keyposition events before the
/// keycode is final.
pub enum PhysicalPipeline<'a> {
    Combo(ComboPipeline<'a>),
    TapDance(TapDancePipeline<'a>),
}

impl<'a> PhysicalPipeline<'a> {
    fn process<P: Platform>(
        &mut self,
        ev: &PipelineEvent,
        ctx: &mut PipelineCtx<'_, P>,
    ) -> Disposition {
        match self {
            PhysicalPipeline::Combo(p) => p.process(ev, ctx),
            PhysicalPipeline::TapDance(p) => p.process(ev, ctx),
        }
    }

    fn reset(&mut self) {
        match self {
            PhysicalPipeline::Combo(p) => p.reset(),
            PhysicalPipeline::TapDance(p) => p.reset(),
        }
    }
}

/// A pipeline in the virtual chain: sees resolved keycodes after the
/// physical chain has decided what each key means.
pub enum VirtualPipeline<'a> {
    OneShot(OneShotPipeline<'a>),
    KeyReplacer(KeyReplacerPipeline<'a>),
}

impl<'a> VirtualPipeline<'a> {
    fn process<P: Platform>(
        &mut self,
        ev: &VirtualEvent,
        ctx: &mut VirtualCtx<'_, P>,
    ) -> Disposition {
        match self {
            VirtualPipeline::OneShot(p) => p.process(ev, ctx),
            VirtualPipeline::KeyReplacer(p) => p.process(ev, ctx),
        }
    }

    fn reset(&mut self) {
        match self {
            VirtualPipeline::OneShot(p) => p.reset(),
            VirtualPipeline::KeyReplacer(p) => p.reset(),
        }
    }
}

/// Side-effect API handed to physical pipeline callbacks.
pub struct PipelineCtx<'e, P: Platform> {
    pub(crate) buffer: &'e mut KeyBuffer,
    pub(crate) scheduler: &'e mut DeferredScheduler<u8>,
    pub(crate) platform: &'e mut P,
    pub(crate) outcome: &'e mut CaptureOutcome,
    pub(crate) index: u8,
    pub(crate) now: u32,
}

impl<'e, P: Platform> PipelineCtx<'e, P> {
    /// The timestamp of the event or timeout being processed. Emissions are
    /// stamped with it, which is what gives deferred resolutions their
    /// resolution-time timestamps.
    pub fn time(&self) -> u32 {
        self.now
    }

    /// Emit a press of a pipeline-produced key. The key lives at a synthetic
    /// position so it cannot be confused with the physical key that caused
    /// it.
    pub fn emit_press(&mut self, keycode: Keycode) {
        let layer = self.platform.layer_current();
        let pos = KeyPos::new(VIRTUAL_ROW, self.index);
        if let Err(e) = self.buffer.push_press(
            pos,
            keycode,
            layer,
            self.now,
            EventSource::Pipeline(self.index),
        ) {
            warn!("pipeline {} dropped emitted press: {}", self.index, e);
        }
    }

    pub fn emit_release(&mut self, keycode: Keycode) {
        if let Err(e) =
            self.buffer
                .push_release_by_keycode(keycode, self.now, EventSource::Pipeline(self.index))
        {
            warn!("pipeline {} dropped emitted release: {}", self.index, e);
        }
    }

    pub fn emit_tap(&mut self, keycode: Keycode) {
        self.emit_press(keycode);
        self.emit_release(keycode);
    }

    /// Replay a withheld press at its original position. If the key is still
    /// physically down its active-press entry is restamped rather than
    /// duplicated, so the key's eventual release resolves to `keycode`.
    pub fn replay_press(&mut self, keycode: Keycode, pos: KeyPos) {
        let layer = self.platform.layer_current();
        if let Err(e) = self.buffer.push_press_reusing(
            pos,
            keycode,
            layer,
            self.now,
            EventSource::Pipeline(self.index),
        ) {
            warn!("pipeline {} dropped replayed press: {}", self.index, e);
        }
    }

    /// Replay a withheld release. Falls back to an unpaired record when the
    /// original admission already retired the key's active-press entry.
    pub fn replay_release(&mut self, keycode: Keycode, pos: KeyPos) {
        let source = EventSource::Pipeline(self.index);
        if self
            .buffer
            .push_release_by_keycode(keycode, self.now, source)
            .is_ok()
        {
            return;
        }
        let layer = self.platform.layer_current();
        if let Err(e) = self
            .buffer
            .push_release_unpaired(pos, keycode, layer, self.now, source)
        {
            warn!("pipeline {} dropped replayed release: {}", self.index, e);
        }
    }

    /// Is a key resolving to `keycode` currently held?
    pub fn is_pressed(&self, keycode: Keycode) -> bool {
        self.buffer.is_pressed_keycode(keycode)
    }

    pub fn layer_current(&self) -> u8 {
        self.platform.layer_current()
    }

    pub fn layer_activate(&mut self, layer: u8) {
        self.platform.layer_activate(layer);
    }

    pub fn layer_push(&mut self, layer: u8) {
        self.platform.layer_push(layer);
    }

    pub fn layer_pop(&mut self) {
        self.platform.layer_pop();
    }

    pub fn keycode_at(&self, layer: u8, pos: KeyPos) -> Keycode {
        self.platform.keycode_at(layer, pos)
    }

    /// Own subsequent events until released. No timer.
    pub fn capture_next_keys(&mut self) {
        self.outcome.requested = Some(None);
    }

    /// Own subsequent events and request a wake `delay_ms` from now. A second
    /// call replaces the previous request. Returns false when the scheduler
    /// has no free slot, in which case nothing is captured and the caller
    /// should resolve immediately instead.
    pub fn capture_next_keys_or_timeout(&mut self, delay_ms: u32) -> bool {
        if let Some(Some(prev)) = self.outcome.requested.take() {
            self.scheduler.cancel(prev.token);
        }
        let token = self.scheduler.schedule(self.now, delay_ms, self.index);
        if token == INVALID_TOKEN {
            warn!("pipeline {} could not arm a timeout: scheduler full", self.index);
            return false;
        }
        self.outcome.requested = Some(Some(ArmedTimer {
            token,
            deadline: self.now.wrapping_add(delay_ms),
        }));
        true
    }
}

/// Side-effect API handed to virtual pipeline callbacks. Emitted events run
/// next, in emission order, entering the chain after the emitter.
pub struct VirtualCtx<'e, P: Platform> {
    pub(crate) emitted: &'e mut Vec<VirtItem, VIRT_EMIT_MAX>,
    pub(crate) platform: &'e mut P,
    pub(crate) now: u32,
}

impl<'e, P: Platform> VirtualCtx<'e, P> {
    pub fn time(&self) -> u32 {
        self.now
    }

    pub fn emit_press(&mut self, keycode: Keycode) {
        self.emit(VirtItem::Key(VirtualEvent {
            keycode,
            is_press: true,
            time: self.now,
        }));
    }

    pub fn emit_release(&mut self, keycode: Keycode) {
        self.emit(VirtItem::Key(VirtualEvent {
            keycode,
            is_press: false,
            time: self.now,
        }));
    }

    pub fn emit_tap(&mut self, keycode: Keycode) {
        self.emit_press(keycode);
        self.emit_release(keycode);
    }

    /// Force a host report boundary between emitted events.
    pub fn emit_report(&mut self) {
        self.emit(VirtItem::Report);
    }

    pub fn layer_current(&self) -> u8 {
        self.platform.layer_current()
    }

    fn emit(&mut self, item: VirtItem) {
        if self.emitted.push(item).is_err() {
            warn!("virtual pipeline emission overflow, event dropped");
        }
    }
}

pub struct Executor<'a, P: Platform> {
    physical: Vec<PhysicalPipeline<'a>, MAX_PIPELINES>,
    virtuals: Vec<VirtualPipeline<'a>, MAX_PIPELINES>,
    buffer: KeyBuffer,
    scheduler: DeferredScheduler<u8>,
    capture: Option<Capture>,
    pub platform: P,
}

impl<'a, P: Platform> Executor<'a, P> {
    pub fn new(platform: P) -> Self {
        Self {
            physical: Vec::new(),
            virtuals: Vec::new(),
            buffer: KeyBuffer::new(),
            scheduler: DeferredScheduler::new(),
            capture: None,
            platform,
        }
    }

    /// Install the next physical pipeline. Order is processing order.
    pub fn add_physical(&mut self, pipeline: PhysicalPipeline<'a>) -> Result<(), InstallError> {
        self.physical
            .push(pipeline)
            .map_err(|_| InstallError::ChainFull)
    }

    /// Install the next virtual pipeline. Order is processing order.
    pub fn add_virtual(&mut self, pipeline: VirtualPipeline<'a>) -> Result<(), InstallError> {
        self.virtuals
            .push(pipeline)
            .map_err(|_| InstallError::ChainFull)
    }

    /// Submit a matrix event. Returns false only when buffering failed and
    /// the event was dropped; a release with no matching press is spurious
    /// and silently discarded.
    pub fn process_key(&mut self, pos: KeyPos, is_press: bool, time: u32) -> bool {
        let layer = self.platform.layer_current();
        let admitted = if is_press {
            let keycode = self.platform.keycode_at(layer, pos);
            self.buffer
                .push_press(pos, keycode, layer, time, EventSource::Input)
        } else {
            self.buffer.push_release(pos, time, EventSource::Input)
        };
        match admitted {
            Ok(()) => {
                self.drain();
                true
            }
            Err(BufferError::UnmatchedRelease) => {
                debug!("spurious release at {:?} dropped", pos);
                true
            }
            Err(e) => {
                warn!("matrix event at {:?} dropped: {}", pos, e);
                false
            }
        }
    }

    /// Drive the scheduler. The firmware calls this when a deferred callback
    /// comes due (or periodically); expired timeouts are delivered to the
    /// pipeline that armed them.
    pub fn tick(&mut self) {
        let now = self.platform.now();
        while let Some(due) = self.scheduler.pop_due(now) {
            let matches = match self.capture {
                Some(cap) => cap.timer.map(|t| t.token) == Some(due.token),
                None => false,
            };
            if !matches {
                debug!("stale timeout token {} ignored", due.token);
                continue;
            }
            let idx = self.capture.as_mut().map(|c| {
                c.timer = None;
                c.pipeline
            });
            if let Some(idx) = idx {
                self.dispatch_physical(
                    idx as usize,
                    &PipelineEvent::Timeout {
                        time: due.execute_time,
                    },
                );
            }
            self.drain();
        }
    }

    /// Return to the freshly-initialized state for the same configuration:
    /// buffers cleared, timeouts cancelled, every pipeline status reset.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scheduler.clear();
        self.capture = None;
        for p in self.physical.iter_mut() {
            p.reset();
        }
        for p in self.virtuals.iter_mut() {
            p.reset();
        }
    }

    pub fn buffer(&self) -> &KeyBuffer {
        &self.buffer
    }

    pub fn scheduler(&self) -> &DeferredScheduler<u8> {
        &self.scheduler
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    pub fn physical_pipelines(&self) -> &[PhysicalPipeline<'a>] {
        &self.physical
    }

    pub fn virtual_pipelines(&self) -> &[VirtualPipeline<'a>] {
        &self.virtuals
    }

    /// Consume buffered events in insertion order.
    fn drain(&mut self) {
        loop {
            let ev = match self.buffer.front() {
                Some(ev) => *ev,
                None => break,
            };
            // A pending capture deadline at or before this event resolves
            // first; the hold/tap boundary is exact because of this.
            if let Some(cap) = self.capture {
                if let Some(t) = cap.timer {
                    if time_reached(ev.time, t.deadline) {
                        self.scheduler.cancel(t.token);
                        if let Some(c) = self.capture.as_mut() {
                            c.timer = None;
                        }
                        self.dispatch_physical(
                            cap.pipeline as usize,
                            &PipelineEvent::Timeout { time: t.deadline },
                        );
                        continue;
                    }
                }
            }
            let disposition = match self.capture {
                Some(cap) if !ev.emitted_by(cap.pipeline) => {
                    // The new event makes the pending timeout moot.
                    if let Some(t) = cap.timer {
                        self.scheduler.cancel(t.token);
                        if let Some(c) = self.capture.as_mut() {
                            c.timer = None;
                        }
                    }
                    match self.dispatch_physical(cap.pipeline as usize, &PipelineEvent::Key(ev)) {
                        Disposition::Consumed => Disposition::Consumed,
                        // Released and passed on: the rest of the chain sees it.
                        Disposition::Pass => self.walk_chain(cap.pipeline as usize + 1, ev),
                    }
                }
                _ => {
                    let start = match ev.source {
                        EventSource::Input => 0,
                        EventSource::Pipeline(i) => i as usize + 1,
                    };
                    self.walk_chain(start, ev)
                }
            };
            if disposition == Disposition::Pass {
                self.run_virtual(VirtualEvent {
                    keycode: ev.keycode,
                    is_press: ev.is_press,
                    time: ev.time,
                });
            }
            self.buffer.consume_front();
        }
    }

    fn walk_chain(&mut self, start: usize, ev: KeyEvent) -> Disposition {
        for i in start..self.physical.len() {
            let disposition = self.dispatch_physical(i, &PipelineEvent::Key(ev));
            if disposition == Disposition::Consumed {
                return Disposition::Consumed;
            }
            // Taking capture stops chain iteration; the capturer owns the
            // event stream from here.
            if self.capture.map(|c| c.pipeline as usize) == Some(i) {
                return Disposition::Consumed;
            }
        }
        Disposition::Pass
    }

    /// Run one physical pipeline callback and apply its capture outcome.
    fn dispatch_physical(&mut self, idx: usize, ev: &PipelineEvent) -> Disposition {
        let Executor {
            physical,
            buffer,
            scheduler,
            platform,
            capture,
            ..
        } = self;
        let now = match ev {
            PipelineEvent::Key(k) => k.time,
            PipelineEvent::Timeout { time } => *time,
        };
        let mut outcome = CaptureOutcome::default();
        let mut ctx = PipelineCtx {
            buffer,
            scheduler,
            platform,
            outcome: &mut outcome,
            index: idx as u8,
            now,
        };
        let disposition = physical[idx].process(ev, &mut ctx);
        match outcome.requested {
            Some(timer) => {
                match capture {
                    Some(cap) if cap.pipeline as usize != idx => {
                        // Nested capture is unsupported; losing request.
                        warn!("pipeline {} cannot capture: chain already captured", idx);
                        if let Some(t) = timer {
                            scheduler.cancel(t.token);
                        }
                    }
                    _ => {
                        *capture = Some(Capture {
                            pipeline: idx as u8,
                            timer,
                        });
                    }
                }
                disposition
            }
            None => {
                // Implicit release: a callback that does not renew capture
                // gives the chain back.
                if capture.map(|c| c.pipeline as usize) == Some(idx) {
                    if let Some(c) = capture {
                        if let Some(t) = c.timer {
                            scheduler.cancel(t.token);
                        }
                    }
                    *capture = None;
                }
                disposition
            }
        }
    }

    /// Feed one event that survived the physical chain through the virtual
    /// chain and on to host output.
    fn run_virtual(&mut self, first: VirtualEvent) {
        let mut queue: ArrayDeque<[(VirtItem, u8); VIRT_QUEUE], arraydeque::behavior::Wrapping> =
            ArrayDeque::new();
        let _ = queue.push_back((VirtItem::Key(first), 0));
        let mut dirty = false;
        while let Some((item, start)) = queue.pop_front() {
            let ve = match item {
                VirtItem::Report => {
                    self.platform.send_report();
                    dirty = false;
                    continue;
                }
                VirtItem::Key(ve) => ve,
            };
            let mut consumed = false;
            for i in start as usize..self.virtuals.len() {
                let mut emitted: Vec<VirtItem, VIRT_EMIT_MAX> = Vec::new();
                let disposition = {
                    let Executor {
                        virtuals, platform, ..
                    } = self;
                    let mut ctx = VirtualCtx {
                        emitted: &mut emitted,
                        platform,
                        now: ve.time,
                    };
                    virtuals[i].process(&ve, &mut ctx)
                };
                for item in emitted.iter().rev() {
                    if queue.push_front((*item, i as u8 + 1)).is_some() {
                        warn!("virtual queue overflow, event dropped");
                    }
                }
                if disposition == Disposition::Consumed {
                    consumed = true;
                    break;
                }
            }
            if !consumed {
                if ve.is_press {
                    self.platform.register(ve.keycode);
                } else {
                    self.platform.unregister(ve.keycode);
                }
                dirty = true;
            }
        }
        if dirty {
            self.platform.send_report();
        }
    }
}
