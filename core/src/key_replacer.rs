//! The key-replacer pipeline (virtual chain).
//!
//! Maps one trigger keycode to a scripted burst of key events on press and
//! another on release, each followed by a host report boundary. The usual use
//! is producing shifted or composed characters from a single key.

use crate::executor::{Disposition, VirtualCtx, VirtualEvent};
use crate::key_code::Keycode;
use crate::platform::Platform;

/// One scripted step of a replacement burst.
#[derive(Debug, Clone, Copy)]
pub enum SequenceEvent {
    Press(Keycode),
    Release(Keycode),
    /// Press then release.
    Tap(Keycode),
    /// Flush the host report mid-burst.
    Report,
}

/// One trigger and its press/release scripts. Immutable after construction.
#[derive(Debug, Clone, Copy)]
pub struct Replacement<'a> {
    pub trigger: Keycode,
    pub on_press: &'a [SequenceEvent],
    pub on_release: &'a [SequenceEvent],
}

impl<'a> Replacement<'a> {
    pub const fn new(
        trigger: Keycode,
        on_press: &'a [SequenceEvent],
        on_release: &'a [SequenceEvent],
    ) -> Self {
        Replacement {
            trigger,
            on_press,
            on_release,
        }
    }
}

pub struct KeyReplacerPipeline<'a> {
    replacements: &'a [Replacement<'a>],
}

impl<'a> KeyReplacerPipeline<'a> {
    pub fn new(replacements: &'a [Replacement<'a>]) -> Self {
        KeyReplacerPipeline { replacements }
    }

    pub fn reset(&mut self) {}

    pub fn process<P: Platform>(
        &mut self,
        ev: &VirtualEvent,
        ctx: &mut VirtualCtx<'_, P>,
    ) -> Disposition {
        let replacement = match self.replacements.iter().find(|r| r.trigger == ev.keycode) {
            Some(r) => r,
            None => return Disposition::Pass,
        };
        let script = if ev.is_press {
            replacement.on_press
        } else {
            replacement.on_release
        };
        for step in script {
            match step {
                SequenceEvent::Press(kc) => ctx.emit_press(*kc),
                SequenceEvent::Release(kc) => ctx.emit_release(*kc),
                SequenceEvent::Tap(kc) => ctx.emit_tap(*kc),
                SequenceEvent::Report => ctx.emit_report(),
            }
        }
        ctx.emit_report();
        Disposition::Consumed
    }
}
