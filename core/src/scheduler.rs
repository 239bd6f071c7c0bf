//! Time-ordered queue of pending deferred callbacks.
//!
//! A small bounded table keyed by `(execute_time, add_order)`. Tokens are
//! nonzero `u16`s that wrap around skipping zero; zero is the "no timer"
//! value pipelines receive when the table is full. All deadline comparisons
//! are modular so the millisecond counter may wrap freely.

use heapless::Vec;

pub type Token = u16;

/// Returned by [`DeferredScheduler::schedule`] when every slot is taken.
pub const INVALID_TOKEN: Token = 0;

pub const SCHEDULER_SLOTS: usize = 16;

/// `deadline` has been reached at `now`, tolerating wraparound.
pub fn time_reached(now: u32, deadline: u32) -> bool {
    now.wrapping_sub(deadline) < 0x8000_0000
}

/// `a` is strictly earlier than `b` within a 2^31 window.
fn earlier(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000_0000
}

#[derive(Debug, Clone, Copy)]
pub struct Scheduled<T> {
    pub execute_time: u32,
    pub add_order: u32,
    pub token: Token,
    pub payload: T,
}

pub struct DeferredScheduler<T, const N: usize = SCHEDULER_SLOTS> {
    slots: Vec<Scheduled<T>, N>,
    next_token: Token,
    next_order: u32,
}

impl<T: Copy, const N: usize> DeferredScheduler<T, N> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            next_token: 1,
            next_order: 0,
        }
    }

    /// Queue `payload` to come due `delay_ms` after `now`. Returns
    /// [`INVALID_TOKEN`] when no slot is free.
    pub fn schedule(&mut self, now: u32, delay_ms: u32, payload: T) -> Token {
        if self.slots.is_full() {
            return INVALID_TOKEN;
        }
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        if self.next_token == INVALID_TOKEN {
            self.next_token = 1;
        }
        let entry = Scheduled {
            execute_time: now.wrapping_add(delay_ms),
            add_order: self.next_order,
            token,
            payload,
        };
        self.next_order = self.next_order.wrapping_add(1);
        // Keep sorted by (execute_time, add_order); equal deadlines keep
        // insertion order because add_order is monotonic.
        let at = self
            .slots
            .iter()
            .position(|s| earlier(entry.execute_time, s.execute_time))
            .unwrap_or(self.slots.len());
        let _ = self.slots.insert(at, entry);
        token
    }

    /// Remove the entry with `token`. Returns whether one was found.
    pub fn cancel(&mut self, token: Token) -> bool {
        if token == INVALID_TOKEN {
            return false;
        }
        match self.slots.iter().position(|s| s.token == token) {
            Some(i) => {
                self.slots.remove(i);
                true
            }
            None => false,
        }
    }

    /// Pop the earliest entry that is due at `now`, if any.
    pub fn pop_due(&mut self, now: u32) -> Option<Scheduled<T>> {
        match self.slots.first() {
            Some(s) if time_reached(now, s.execute_time) => Some(self.slots.remove(0)),
            _ => None,
        }
    }

    pub fn next_deadline(&self) -> Option<u32> {
        self.slots.first().map(|s| s.execute_time)
    }

    pub fn entries(&self) -> &[Scheduled<T>] {
        &self.slots
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

impl<T: Copy, const N: usize> Default for DeferredScheduler<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn due_in_time_order_with_stable_ties() {
        let mut s: DeferredScheduler<u8> = DeferredScheduler::new();
        let t_late = s.schedule(0, 100, 1);
        let t_early = s.schedule(0, 50, 2);
        let t_tie = s.schedule(0, 50, 3);
        assert_ne!(t_late, INVALID_TOKEN);
        assert_ne!(t_early, INVALID_TOKEN);
        assert_ne!(t_tie, INVALID_TOKEN);

        assert!(s.pop_due(49).is_none());
        assert_eq!(s.pop_due(50).unwrap().payload, 2);
        assert_eq!(s.pop_due(50).unwrap().payload, 3);
        assert!(s.pop_due(99).is_none());
        assert_eq!(s.pop_due(100).unwrap().payload, 1);
        assert!(s.is_empty());
    }

    #[test]
    fn sorted_invariant_holds_after_inserts() {
        let mut s: DeferredScheduler<u8> = DeferredScheduler::new();
        for (delay, p) in [(30, 0), (10, 1), (20, 2), (10, 3), (5, 4)] {
            s.schedule(0, delay, p);
        }
        let entries = s.entries();
        for w in entries.windows(2) {
            let a = &w[0];
            let b = &w[1];
            assert!(
                earlier(a.execute_time, b.execute_time)
                    || (a.execute_time == b.execute_time && a.add_order < b.add_order)
            );
        }
    }

    #[test]
    fn cancel_by_token() {
        let mut s: DeferredScheduler<u8> = DeferredScheduler::new();
        let t = s.schedule(0, 10, 7);
        assert!(s.cancel(t));
        assert!(!s.cancel(t));
        assert!(!s.cancel(INVALID_TOKEN));
        assert!(s.pop_due(1000).is_none());
    }

    #[test]
    fn full_table_yields_invalid_token() {
        let mut s: DeferredScheduler<u8> = DeferredScheduler::new();
        for _ in 0..SCHEDULER_SLOTS {
            assert_ne!(s.schedule(0, 10, 0), INVALID_TOKEN);
        }
        assert_eq!(s.schedule(0, 10, 0), INVALID_TOKEN);
    }

    #[test]
    fn token_allocation_skips_zero() {
        let mut s: DeferredScheduler<u8> = DeferredScheduler::new();
        let mut last = 0;
        for _ in 0..=u16::MAX as u32 {
            let t = s.schedule(0, 1, 0);
            assert_ne!(t, INVALID_TOKEN);
            s.cancel(t);
            last = t;
        }
        // Wrapped past u16::MAX exactly once without handing out zero.
        assert_eq!(last, 1);
    }

    #[test]
    fn deadlines_wrap_around_the_counter() {
        let mut s: DeferredScheduler<u8> = DeferredScheduler::new();
        let near_wrap = u32::MAX - 10;
        s.schedule(near_wrap, 20, 9);
        assert!(s.pop_due(near_wrap).is_none());
        assert!(s.pop_due(u32::MAX).is_none());
        // 10ms past the wrap point.
        assert_eq!(s.pop_due(9).unwrap().payload, 9);
    }
}
