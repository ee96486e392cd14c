/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Machine cycle scheduler.
//!
//! The [Scheduler] owns the monotonic 64-bit cycle counter `T` of the emulated machine and a set of
//! one-shot events. Each event is tagged with an [OwnerId] and a 32-bit event id. Whoever drives the
//! scheduler pops due events and routes them to their owners, so components never need to keep
//! a back-pointer to the scheduler itself.
use core::cell::Cell;
use core::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Rc;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace};

/// A machine cycle timestamp.
pub type Ticks = u64;

/// The NTSC machine clock frequency in Hz.
pub const NTSC_CPU_HZ: f64 = 1_789_772.5;
/// The PAL machine clock frequency in Hz.
pub const PAL_CPU_HZ: f64 = 1_773_447.0;
/// The number of machine cycles per scan line.
pub const CYCLES_PER_LINE: Ticks = 114;

/// Identifies the component that receives a scheduled event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u32);

/// A handle to a pending event.
///
/// Handles are cheap to copy. A handle whose event has already fired or was cancelled is simply
/// no longer pending; using it is harmless.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventHandle {
    slot: u32,
    generation: u32,
}

/// An event removed from the scheduler when it became due.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduledEvent {
    pub owner: OwnerId,
    pub id: u32,
    pub tick: Ticks,
}

/// A read-only view of the scheduler's cycle counter that can be shared with components
/// that only need to know the current time.
#[derive(Clone, Debug, Default)]
pub struct ClockHandle(Rc<Cell<Ticks>>);

impl ClockHandle {
    /// Returns the current machine cycle.
    #[inline]
    pub fn now(&self) -> Ticks {
        self.0.get()
    }
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    generation: u32,
    pending: Option<(OwnerId, u32, Ticks)>,
}

/// The machine cycle scheduler.
///
/// Insertion is `O(log n)`, cancelling is `O(1)`: cancelled events stay in the heap and are
/// discarded lazily when they reach its top.
#[derive(Debug, Default)]
pub struct Scheduler {
    clock: ClockHandle,
    slots: Vec<Slot>,
    free: Vec<u32>,
    heap: BinaryHeap<Reverse<(Ticks, u64, u32, u32)>>,
    seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler::default()
    }
    /// Returns the current machine cycle `T`.
    #[inline]
    pub fn now(&self) -> Ticks {
        self.clock.now()
    }
    /// Returns a shared read-only handle to the cycle counter.
    pub fn clock(&self) -> ClockHandle {
        self.clock.clone()
    }
    /// Schedules a new event `delta` cycles from now.
    pub fn add_event(&mut self, delta: Ticks, owner: OwnerId, id: u32) -> EventHandle {
        let tick = self.now().saturating_add(delta);
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot { generation: 0, pending: None });
                (self.slots.len() - 1) as u32
            }
        };
        let entry = &mut self.slots[slot as usize];
        entry.pending = Some((owner, id, tick));
        let generation = entry.generation;
        self.seq += 1;
        self.heap.push(Reverse((tick, self.seq, slot, generation)));
        EventHandle { slot, generation }
    }
    /// Replaces an event referenced by `handle` (if any) with a new one `delta` cycles from now.
    pub fn set_event(&mut self, delta: Ticks, owner: OwnerId, id: u32, handle: &mut Option<EventHandle>) {
        self.unset_event(handle);
        *handle = Some(self.add_event(delta, owner, id));
    }
    /// Cancels an event referenced by `handle` and clears the handle.
    pub fn unset_event(&mut self, handle: &mut Option<EventHandle>) {
        if let Some(h) = handle.take() {
            self.cancel(h);
        }
    }
    /// Cancels an event. Returns `true` if the event was pending.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        match self.slots.get_mut(handle.slot as usize) {
            Some(slot) if slot.generation == handle.generation && slot.pending.is_some() => {
                Self::release(slot);
                self.free.push(handle.slot);
                true
            }
            _ => false
        }
    }
    /// Returns `true` if the event referenced by `handle` has neither fired nor been cancelled.
    pub fn is_pending(&self, handle: EventHandle) -> bool {
        self.pending(handle).is_some()
    }
    /// Returns the number of cycles remaining until the event fires.
    pub fn ticks_to_event(&self, handle: EventHandle) -> Option<Ticks> {
        self.pending(handle).map(|(_, _, tick)| tick.saturating_sub(self.now()))
    }
    /// Returns the fire tick of the event.
    pub fn event_tick(&self, handle: EventHandle) -> Option<Ticks> {
        self.pending(handle).map(|(_, _, tick)| tick)
    }
    /// Returns the fire tick of the earliest pending event.
    pub fn next_event_tick(&mut self) -> Option<Ticks> {
        self.purge();
        self.heap.peek().map(|Reverse((tick, ..))| *tick)
    }
    /// Returns the number of cycles until the earliest pending event.
    pub fn ticks_to_next_event(&mut self) -> Option<Ticks> {
        let now = self.now();
        self.next_event_tick().map(|tick| tick.saturating_sub(now))
    }
    /// Returns the number of pending events.
    pub fn pending_count(&self) -> usize {
        self.slots.iter().filter(|s| s.pending.is_some()).count()
    }
    /// Advances `T` by `delta` cycles without dispatching events.
    pub fn advance(&mut self, delta: Ticks) {
        let t = self.now().saturating_add(delta);
        self.clock.0.set(t);
    }
    /// Advances `T` to `tick`. The counter never goes backwards.
    pub fn advance_to(&mut self, tick: Ticks) {
        if tick > self.now() {
            self.clock.0.set(tick);
        }
    }
    /// Removes and returns the earliest event if it is due at the current `T`.
    pub fn pop_due(&mut self) -> Option<ScheduledEvent> {
        let now = self.now();
        match self.next_event_tick() {
            Some(tick) if tick <= now => self.pop_head(),
            _ => None
        }
    }
    /// Advances `T` to the earliest pending event if it fires no later than `limit`, removes it
    /// and returns it. Otherwise advances `T` to `limit` and returns `None`.
    pub fn run_next(&mut self, limit: Ticks) -> Option<ScheduledEvent> {
        match self.next_event_tick() {
            Some(tick) if tick <= limit => {
                self.advance_to(tick);
                self.pop_head()
            }
            _ => {
                self.advance_to(limit);
                None
            }
        }
    }
    /// Runs the scheduler up to `limit`, calling `dispatch` for each event in firing order.
    ///
    /// `dispatch` may schedule and cancel events, including events due at the current tick.
    pub fn run_until<F>(&mut self, limit: Ticks, mut dispatch: F)
        where F: FnMut(&mut Scheduler, ScheduledEvent)
    {
        while let Some(ev) = self.run_next(limit) {
            trace!("event owner: {:?} id: {} at: {}", ev.owner, ev.id, ev.tick);
            dispatch(self, ev);
        }
    }
    /// Cancels all events belonging to `owner`.
    pub fn cancel_owner(&mut self, owner: OwnerId) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot.pending, Some((o, ..)) if o == owner) {
                Self::release(slot);
                self.free.push(index as u32);
            }
        }
    }

    fn pending(&self, handle: EventHandle) -> Option<(OwnerId, u32, Ticks)> {
        self.slots.get(handle.slot as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.pending)
    }

    fn release(slot: &mut Slot) {
        slot.pending = None;
        slot.generation = slot.generation.wrapping_add(1);
    }

    fn purge(&mut self) {
        while let Some(Reverse((_, _, slot, generation))) = self.heap.peek() {
            let entry = &self.slots[*slot as usize];
            if entry.generation == *generation && entry.pending.is_some() {
                break;
            }
            self.heap.pop();
        }
    }

    fn pop_head(&mut self) -> Option<ScheduledEvent> {
        let Reverse((_, _, slot, _)) = self.heap.pop()?;
        let entry = &mut self.slots[slot as usize];
        let (owner, id, tick) = entry.pending?;
        Self::release(entry);
        self.free.push(slot);
        Some(ScheduledEvent { owner, id, tick })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::SmallRng};

    const OWNER: OwnerId = OwnerId(1);

    #[test]
    fn scheduler_fires_in_order() {
        let mut sched = Scheduler::new();
        sched.add_event(30, OWNER, 3);
        sched.add_event(10, OWNER, 1);
        sched.add_event(20, OWNER, 2);
        let mut fired = Vec::new();
        sched.run_until(100, |s, ev| fired.push((ev.id, s.now())));
        assert_eq!(fired, vec![(1, 10), (2, 20), (3, 30)]);
        assert_eq!(sched.now(), 100);
        assert_eq!(sched.next_event_tick(), None);
    }

    #[test]
    fn scheduler_equal_ticks_fire_in_insertion_order() {
        let mut sched = Scheduler::new();
        for id in 0..16 {
            sched.add_event(5, OWNER, id);
        }
        let mut fired = Vec::new();
        sched.run_until(5, |_, ev| fired.push(ev.id));
        assert_eq!(fired, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn scheduler_set_and_unset_work() {
        let mut sched = Scheduler::new();
        let mut handle = None;
        sched.set_event(50, OWNER, 1, &mut handle);
        let first = handle.unwrap();
        assert_eq!(sched.ticks_to_event(first), Some(50));
        sched.set_event(20, OWNER, 2, &mut handle);
        assert!(!sched.is_pending(first));
        assert_eq!(sched.ticks_to_event(handle.unwrap()), Some(20));
        sched.advance(5);
        assert_eq!(sched.ticks_to_event(handle.unwrap()), Some(15));
        sched.unset_event(&mut handle);
        assert!(handle.is_none());
        assert_eq!(sched.run_next(1000), None);
        assert_eq!(sched.now(), 1000);
        // a stale handle never cancels a recycled slot
        let h = sched.add_event(1, OWNER, 3);
        assert!(!sched.cancel(first));
        assert!(sched.is_pending(h));
    }

    #[test]
    fn scheduler_dispatch_can_reschedule() {
        let mut sched = Scheduler::new();
        sched.add_event(0, OWNER, 0);
        let mut count = 0;
        sched.run_until(10, |s, ev| {
            count += 1;
            if ev.id < 10 {
                s.add_event(1, OWNER, ev.id + 1);
            }
        });
        assert_eq!(count, 11);
        assert_eq!(sched.now(), 10);
    }

    #[test]
    fn scheduler_random_cancel_works() {
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let mut sched = Scheduler::new();
        let mut live = Vec::new();
        for id in 0..500u32 {
            let delta = rng.gen_range(0..1000);
            let h = sched.add_event(delta, OWNER, id);
            live.push((h, delta, id));
        }
        let mut expected = Vec::new();
        for (h, delta, id) in live {
            if rng.gen_bool(0.5) {
                assert!(sched.cancel(h));
            }
            else {
                expected.push((delta, id));
            }
        }
        expected.sort();
        let mut fired = Vec::new();
        sched.run_until(1000, |_, ev| fired.push((ev.tick, ev.id)));
        assert_eq!(fired, expected);
    }

    #[test]
    fn clock_handle_follows_scheduler() {
        let mut sched = Scheduler::new();
        let clock = sched.clock();
        sched.advance(1234);
        assert_eq!(clock.now(), 1234);
        sched.advance_to(10);
        assert_eq!(clock.now(), 1234);
    }
}
