//! Cyclic timers for the event loop.
//!
//! Entries live in two indices at once: a time-ordered tree for cheap
//! minimum lookup and an id index for delete-by-id. The tree key is
//! `(next_time, id)` so that entries with the same deadline still have a
//! total order.
//!
//! While a timer fires, its callback box is checked out of the entry and
//! the entry is already reinserted at its next deadline. The firing
//! callback may therefore modify or remove its own timer through the
//! regular API.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::error::Error;

pub type TimerId = u64;
pub(crate) type TimerCallback = Box<dyn FnMut() + Send>;

/// How to choose the next deadline when a cyclic timer fired late
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPolicy {
    /// Keep the phase of the base time, skipping the missed cycles
    BaseTime,
    /// Schedule a full interval from the current time, dropping the phase
    CurrentTime,
}

pub(crate) struct TimerEntry {
    /// Interval in nanoseconds. Zero marks a one-shot entry that is
    /// removed after its execution.
    interval: u64,
    policy: TimerPolicy,
    callback: Option<TimerCallback>,
}

#[derive(Default)]
pub(crate) struct Timers {
    tree: BTreeMap<(u64, TimerId), TimerEntry>,
    ids: HashMap<TimerId, u64>,
    id_counter: TimerId,
}

/// Monotonic nanoseconds from a process-local epoch
pub fn now_monotonic() -> u64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// The next deadline that preserves the phase of `base` relative to `now`
fn calculate_next_time(now: u64, base: u64, interval: u64) -> u64 {
    let cycle_delay = if now >= base {
        (now - base) % interval
    } else {
        // Base time in the future. Wrap the delay into the positive range.
        let ahead = (base - now) % interval;
        if ahead == 0 {
            0
        } else {
            interval - ahead
        }
    };
    now + interval - cycle_delay
}

impl Timers {
    /// Adds an entry. A zero interval makes the entry one-shot with
    /// `base_time` interpreted as an absolute deadline.
    pub(crate) fn add(
        &mut self,
        callback: TimerCallback,
        interval: u64,
        base_time: Option<u64>,
        policy: TimerPolicy,
    ) -> TimerId {
        let now = now_monotonic();
        let next_time = if interval == 0 {
            base_time.unwrap_or(now)
        } else {
            match base_time {
                None => now + interval,
                Some(base) => calculate_next_time(now, base, interval),
            }
        };

        let id = self.next_unique_id();
        let entry = TimerEntry { interval, policy, callback: Some(callback) };
        self.tree.insert((next_time, id), entry);
        self.ids.insert(id, next_time);
        id
    }

    pub(crate) fn modify(
        &mut self,
        id: TimerId,
        interval: u64,
        base_time: Option<u64>,
        policy: TimerPolicy,
    ) -> Result<(), Error> {
        let next_time = *self.ids.get(&id).ok_or(Error::NotFound)?;
        let mut entry = match self.tree.remove(&(next_time, id)) {
            Some(entry) => entry,
            None => return Err(Error::NotFound),
        };

        // Same computation as for a fresh entry
        let now = now_monotonic();
        let next_time = match base_time {
            None => now + interval,
            Some(base) => calculate_next_time(now, base, interval),
        };

        entry.interval = interval;
        entry.policy = policy;
        self.tree.insert((next_time, id), entry);
        self.ids.insert(id, next_time);
        Ok(())
    }

    pub(crate) fn remove(&mut self, id: TimerId) -> Result<(), Error> {
        let next_time = self.ids.remove(&id).ok_or(Error::NotFound)?;
        self.tree.remove(&(next_time, id));
        Ok(())
    }

    /// Detaches the callback of the earliest due entry. Cyclic entries are
    /// reinserted at their advanced deadline before the callback runs;
    /// one-shot entries are removed for good. Returns `None` once no entry
    /// is due at `now`.
    pub(crate) fn pop_due(&mut self, now: u64) -> Option<(TimerId, TimerCallback)> {
        loop {
            let (&(next_time, id), _) = self.tree.iter().next()?;
            if next_time > now {
                return None;
            }

            let mut entry = self.tree.remove(&(next_time, id))?;
            let callback = entry.callback.take();

            if entry.interval == 0 {
                self.ids.remove(&id);
            } else {
                // Advance before executing, so the callback sees the entry
                // at its new position. Late fires follow the cycle-miss
                // policy.
                let mut advanced = next_time + entry.interval;
                if advanced < now {
                    advanced = match entry.policy {
                        TimerPolicy::BaseTime => calculate_next_time(now, advanced, entry.interval),
                        TimerPolicy::CurrentTime => now + entry.interval,
                    };
                }
                self.tree.insert((advanced, id), entry);
                self.ids.insert(id, advanced);
            }

            // A checked-out callback means the entry was popped reentrantly;
            // impossible from a single dispatch thread, but skip it rather
            // than fire twice.
            match callback {
                Some(callback) => return Some((id, callback)),
                None => continue,
            }
        }
    }

    /// Puts a checked-out callback back, unless the entry was removed while
    /// it executed.
    pub(crate) fn restore_callback(&mut self, id: TimerId, callback: TimerCallback) {
        if let Some(&next_time) = self.ids.get(&id) {
            if let Some(entry) = self.tree.get_mut(&(next_time, id)) {
                if entry.callback.is_none() {
                    entry.callback = Some(callback);
                }
            }
        }
    }

    /// Earliest remaining deadline
    pub(crate) fn next_deadline(&self) -> Option<u64> {
        self.tree.keys().next().map(|&(next_time, _)| next_time)
    }

    pub(crate) fn clear(&mut self) {
        self.tree.clear();
        self.ids.clear();
    }

    /// Ids are unique for the lifetime of the loop and never zero. The
    /// counter wraps but skips ids that are still alive.
    fn next_unique_id(&mut self) -> TimerId {
        loop {
            self.id_counter = self.id_counter.wrapping_add(1);
            if self.id_counter != 0 && !self.ids.contains_key(&self.id_counter) {
                return self.id_counter;
            }
        }
    }
}
