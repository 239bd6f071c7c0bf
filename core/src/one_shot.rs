//! The one-shot modifier pipeline (virtual chain).
//!
//! Tapping a configured trigger latches its modifier for exactly one
//! following key: the modifier's press is inserted before that key's press
//! and its release immediately before that key's release. Any other modifier
//! event arriving while latched clears the latch without effect.

use log::debug;

use crate::executor::{Disposition, VirtualCtx, VirtualEvent};
use crate::key_code::Keycode;
use crate::platform::Platform;

/// A trigger-to-modifier assignment.
#[derive(Debug, Clone, Copy)]
pub struct OneShotModifier {
    pub trigger: Keycode,
    pub modifier: Keycode,
}

impl OneShotModifier {
    pub const fn new(trigger: Keycode, modifier: Keycode) -> Self {
        OneShotModifier { trigger, modifier }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    /// Trigger down, not yet tapped.
    TriggerDown { modifier: Keycode },
    /// Trigger tapped; modifier pending for the next key press.
    Armed { modifier: Keycode },
    /// The next key arrived; modifier registered until that key releases.
    Wrapping { modifier: Keycode, key: Keycode },
}

pub struct OneShotPipeline<'a> {
    assignments: &'a [OneShotModifier],
    state: State,
}

impl<'a> OneShotPipeline<'a> {
    pub fn new(assignments: &'a [OneShotModifier]) -> Self {
        OneShotPipeline {
            assignments,
            state: State::Idle,
        }
    }

    pub fn reset(&mut self) {
        self.state = State::Idle;
    }

    pub fn is_quiescent(&self) -> bool {
        self.state == State::Idle
    }

    fn modifier_for(&self, trigger: Keycode) -> Option<Keycode> {
        self.assignments
            .iter()
            .find(|a| a.trigger == trigger)
            .map(|a| a.modifier)
    }

    pub fn process<P: Platform>(
        &mut self,
        ev: &VirtualEvent,
        ctx: &mut VirtualCtx<'_, P>,
    ) -> Disposition {
        if ev.is_press {
            if let Some(modifier) = self.modifier_for(ev.keycode) {
                // A new trigger while armed replaces the latch; the old
                // one-shot ends without effect. A trigger pressed while a
                // wrap is in flight is ignored so the wrap can finish.
                match self.state {
                    State::Wrapping { .. } => {}
                    State::Armed { .. } => {
                        debug!("one-shot replaced by new trigger");
                        self.state = State::TriggerDown { modifier };
                    }
                    _ => self.state = State::TriggerDown { modifier },
                }
                return Disposition::Consumed;
            }
            match self.state {
                State::Armed { modifier } => {
                    if ev.keycode.is_modifier() {
                        // A plain modifier clears the latch without effect.
                        self.state = State::Idle;
                        Disposition::Pass
                    } else {
                        ctx.emit_press(modifier);
                        ctx.emit_press(ev.keycode);
                        self.state = State::Wrapping {
                            modifier,
                            key: ev.keycode,
                        };
                        Disposition::Consumed
                    }
                }
                _ => Disposition::Pass,
            }
        } else {
            if self.modifier_for(ev.keycode).is_some() {
                if let State::TriggerDown { modifier } = self.state {
                    self.state = State::Armed { modifier };
                }
                // Trigger releases never reach the host.
                return Disposition::Consumed;
            }
            match self.state {
                State::Wrapping { modifier, key } if key == ev.keycode => {
                    ctx.emit_release(modifier);
                    ctx.emit_release(ev.keycode);
                    self.state = State::Idle;
                    Disposition::Consumed
                }
                _ => Disposition::Pass,
            }
        }
    }
}
