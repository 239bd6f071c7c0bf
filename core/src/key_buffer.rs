//! The paired key-event buffers.
//!
//! Two bounded buffers back the executor. `only_press` tracks active presses
//! so pipelines can look back at what is currently held without scanning the
//! event log. `press` is the FIFO log of presses and releases that the
//! executor consumes in insertion order.
//!
//! Admission rules:
//! - a press needs a free `only_press` slot and two free `press` slots, so
//!   that its eventual release can never be locked out;
//! - a release must find a not-yet-released twin in `only_press`; it flips
//!   the twin's flag and inherits the twin's keycode and press-time layer, so
//!   later layer changes cannot reinterpret it.

use heapless::Vec;
use log::debug;
use thiserror::Error;

use crate::key_code::Keycode;
use crate::platform::KeyPos;

pub const ONLY_PRESS_MAX: usize = 5;
pub const PRESS_MAX: usize = 10;

/// Where an event record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// A matrix event submitted by the firmware.
    Input,
    /// Emitted by the pipeline at this index in its chain.
    Pipeline(u8),
}

/// An entry in the `only_press` buffer: one active (or releasing) press.
#[derive(Debug, Clone, Copy)]
pub struct PressedKey {
    pub pos: KeyPos,
    pub keycode: Keycode,
    pub layer: u8,
    pub pressed_at: u32,
    /// Set once the matching release has been buffered. The entry itself
    /// stays until the release is consumed by the chain.
    pub release_on_buffer: bool,
}

/// An entry in the `press` event log.
#[derive(Debug, Clone, Copy)]
pub struct KeyEvent {
    pub pos: KeyPos,
    pub keycode: Keycode,
    pub layer: u8,
    pub is_press: bool,
    pub time: u32,
    pub source: EventSource,
}

impl KeyEvent {
    pub fn emitted_by(&self, pipeline: u8) -> bool {
        matches!(self.source, EventSource::Pipeline(i) if i == pipeline)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("active-press buffer is full")]
    OnlyPressFull,
    #[error("event buffer is full")]
    PressFull,
    #[error("release without a matching press")]
    UnmatchedRelease,
}

#[derive(Default)]
pub struct KeyBuffer {
    only_press: Vec<PressedKey, ONLY_PRESS_MAX>,
    press: Vec<KeyEvent, PRESS_MAX>,
}

impl KeyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a press. Fails without side effects when either buffer cannot
    /// take it.
    pub fn push_press(
        &mut self,
        pos: KeyPos,
        keycode: Keycode,
        layer: u8,
        time: u32,
        source: EventSource,
    ) -> Result<(), BufferError> {
        // Reserve one event slot for the eventual release.
        if self.press.len() + 2 > PRESS_MAX {
            return Err(BufferError::PressFull);
        }
        if self.only_press.is_full() {
            return Err(BufferError::OnlyPressFull);
        }
        let _ = self.only_press.push(PressedKey {
            pos,
            keycode,
            layer,
            pressed_at: time,
            release_on_buffer: false,
        });
        let _ = self.press.push(KeyEvent {
            pos,
            keycode,
            layer,
            is_press: true,
            time,
            source,
        });
        Ok(())
    }

    /// Admit a release for the key at `pos`, matched against the newest
    /// not-yet-released twin.
    pub fn push_release(
        &mut self,
        pos: KeyPos,
        time: u32,
        source: EventSource,
    ) -> Result<(), BufferError> {
        self.push_release_with(time, source, |k| k.pos == pos)
    }

    /// Admit a release matched by keycode instead of position. Used by
    /// pipelines that emit releases for keys they registered themselves.
    pub fn push_release_by_keycode(
        &mut self,
        keycode: Keycode,
        time: u32,
        source: EventSource,
    ) -> Result<(), BufferError> {
        self.push_release_with(time, source, |k| k.keycode == keycode)
    }

    /// Admit a press that may be a pipeline's replay of an event already in
    /// flight: if the key still has a not-yet-released twin, that twin is
    /// restamped with `keycode` instead of a second one being created, so the
    /// key's eventual release resolves to what the replay made of it.
    pub fn push_press_reusing(
        &mut self,
        pos: KeyPos,
        keycode: Keycode,
        layer: u8,
        time: u32,
        source: EventSource,
    ) -> Result<(), BufferError> {
        let twin = self
            .only_press
            .iter_mut()
            .rev()
            .find(|k| !k.release_on_buffer && k.pos == pos);
        match twin {
            Some(twin) => {
                twin.keycode = keycode;
                twin.layer = layer;
                if self.press.is_full() {
                    return Err(BufferError::PressFull);
                }
                let _ = self.press.push(KeyEvent {
                    pos,
                    keycode,
                    layer,
                    is_press: true,
                    time,
                    source,
                });
                Ok(())
            }
            None => self.push_press(pos, keycode, layer, time, source),
        }
    }

    /// Admit a release record with no twin bookkeeping. Only for replaying a
    /// release whose original admission already consumed its twin.
    pub fn push_release_unpaired(
        &mut self,
        pos: KeyPos,
        keycode: Keycode,
        layer: u8,
        time: u32,
        source: EventSource,
    ) -> Result<(), BufferError> {
        if self.press.is_full() {
            return Err(BufferError::PressFull);
        }
        let _ = self.press.push(KeyEvent {
            pos,
            keycode,
            layer,
            is_press: false,
            time,
            source,
        });
        Ok(())
    }

    fn push_release_with(
        &mut self,
        time: u32,
        source: EventSource,
        matches: impl Fn(&PressedKey) -> bool,
    ) -> Result<(), BufferError> {
        if self.press.is_full() {
            return Err(BufferError::PressFull);
        }
        let twin = self
            .only_press
            .iter_mut()
            .rev()
            .find(|k| !k.release_on_buffer && matches(k))
            .ok_or(BufferError::UnmatchedRelease)?;
        twin.release_on_buffer = true;
        let (pos, keycode, layer) = (twin.pos, twin.keycode, twin.layer);
        let _ = self.press.push(KeyEvent {
            pos,
            keycode,
            // The press-time layer, not the current one.
            layer,
            is_press: false,
            time,
            source,
        });
        Ok(())
    }

    pub fn front(&self) -> Option<&KeyEvent> {
        self.press.first()
    }

    /// Remove the oldest event. A consumed release also erases its twin: the
    /// newest released entry at the same position.
    pub fn consume_front(&mut self) {
        self.remove(0);
    }

    /// Remove the event at `idx`, closing the hole.
    pub fn remove(&mut self, idx: usize) {
        if idx >= self.press.len() {
            return;
        }
        let ev = self.press.remove(idx);
        if !ev.is_press {
            let twin = self
                .only_press
                .iter()
                .enumerate()
                .rev()
                .find(|(_, k)| k.pos == ev.pos && k.release_on_buffer)
                .map(|(i, _)| i);
            match twin {
                Some(i) => {
                    self.only_press.remove(i);
                }
                // Unpaired replays legitimately have no twin.
                None => debug!("consumed release with no twin at {:?}", ev.pos),
            }
        }
    }

    /// Is a key producing `keycode` currently held (release not yet
    /// buffered)? Scanned newest-first.
    pub fn is_pressed_keycode(&self, keycode: Keycode) -> bool {
        self.only_press
            .iter()
            .rev()
            .any(|k| k.keycode == keycode && !k.release_on_buffer)
    }

    pub fn is_pressed_pos(&self, pos: KeyPos) -> bool {
        self.only_press
            .iter()
            .rev()
            .any(|k| k.pos == pos && !k.release_on_buffer)
    }

    pub fn active_presses(&self) -> &[PressedKey] {
        &self.only_press
    }

    pub fn events(&self) -> &[KeyEvent] {
        &self.press
    }

    pub fn is_empty(&self) -> bool {
        self.press.is_empty()
    }

    pub fn clear(&mut self) {
        self.only_press.clear();
        self.press.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::key_code::{KC_A, KC_B};

    const P1: KeyPos = KeyPos::new(0, 0);
    const P2: KeyPos = KeyPos::new(0, 1);

    #[test]
    fn press_then_release_pairs_up() {
        let mut buf = KeyBuffer::new();
        buf.push_press(P1, KC_A, 0, 10, EventSource::Input).unwrap();
        assert!(buf.is_pressed_keycode(KC_A));
        buf.push_release(P1, 20, EventSource::Input).unwrap();
        // Twin stays until the release is consumed.
        assert_eq!(buf.active_presses().len(), 1);
        assert!(buf.active_presses()[0].release_on_buffer);
        assert!(!buf.is_pressed_keycode(KC_A));

        assert!(buf.front().unwrap().is_press);
        buf.consume_front();
        assert!(!buf.front().unwrap().is_press);
        buf.consume_front();
        assert!(buf.is_empty());
        assert!(buf.active_presses().is_empty());
    }

    #[test]
    fn release_carries_press_time_layer_and_keycode() {
        let mut buf = KeyBuffer::new();
        buf.push_press(P1, KC_A, 2, 10, EventSource::Input).unwrap();
        buf.push_release(P1, 20, EventSource::Input).unwrap();
        let release = buf.events()[1];
        assert_eq!(release.layer, 2);
        assert_eq!(release.keycode, KC_A);
    }

    #[test]
    fn unmatched_release_is_rejected() {
        let mut buf = KeyBuffer::new();
        assert_eq!(
            buf.push_release(P1, 5, EventSource::Input),
            Err(BufferError::UnmatchedRelease)
        );
        buf.push_press(P1, KC_A, 0, 10, EventSource::Input).unwrap();
        buf.push_release(P1, 20, EventSource::Input).unwrap();
        // Twin already released; a second release has nothing to match.
        assert_eq!(
            buf.push_release(P1, 30, EventSource::Input),
            Err(BufferError::UnmatchedRelease)
        );
    }

    #[test]
    fn press_reserves_a_release_slot() {
        let mut buf = KeyBuffer::new();
        for i in 0..4 {
            buf.push_press(KeyPos::new(0, i), KC_A, 0, 0, EventSource::Input)
                .unwrap();
        }
        // 4 presses buffered, 6 slots left; a 5th press would leave space for
        // its release, but only_press is what fills up first here.
        buf.push_press(KeyPos::new(0, 4), KC_B, 0, 0, EventSource::Input)
            .unwrap();
        assert_eq!(
            buf.push_press(KeyPos::new(0, 5), KC_B, 0, 0, EventSource::Input),
            Err(BufferError::OnlyPressFull)
        );
        // Releases still fit.
        for i in 0..5 {
            buf.push_release(KeyPos::new(0, i), 1, EventSource::Input)
                .unwrap();
        }
        assert_eq!(buf.events().len(), 10);
    }

    #[test]
    fn event_log_capacity_rejects_press_near_full() {
        let mut buf = KeyBuffer::new();
        // Fill the log with four press/release pairs plus one press: 9 events.
        for i in 0..4 {
            buf.push_press(KeyPos::new(0, i), KC_A, 0, 0, EventSource::Input)
                .unwrap();
            buf.push_release(KeyPos::new(0, i), 0, EventSource::Input)
                .unwrap();
        }
        buf.push_press(P1, KC_A, 0, 0, EventSource::Input).unwrap();
        // 9 events: a press would need two slots.
        assert_eq!(
            buf.push_press(P2, KC_B, 0, 0, EventSource::Input),
            Err(BufferError::PressFull)
        );
        // The reserved slot is still there for the release.
        buf.push_release(P1, 1, EventSource::Input).unwrap();
    }

    #[test]
    fn same_position_repress_matches_newest_twin() {
        let mut buf = KeyBuffer::new();
        buf.push_press(P1, KC_A, 0, 0, EventSource::Input).unwrap();
        buf.push_release(P1, 1, EventSource::Input).unwrap();
        buf.push_press(P1, KC_B, 1, 2, EventSource::Input).unwrap();
        buf.push_release(P1, 3, EventSource::Input).unwrap();
        // Consume in order; each release must erase its own twin.
        for _ in 0..2 {
            buf.consume_front();
            buf.consume_front();
        }
        assert!(buf.active_presses().is_empty());
    }
}
