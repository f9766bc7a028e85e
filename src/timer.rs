//! One-shot timer group driven by a millisecond tick count.
//!
//! The run loop calls [`TimerGroup::run`] with the current tick count; every
//! timer whose deadline has passed is disarmed and handed back, oldest first.
//! Starting a running timer re-arms it.

use std::collections::HashMap;
use std::hash::Hash;

pub type Ticks = u64;

/// A timer that fired, along with whatever tag it was armed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired<H, T> {
    pub handle: H,
    pub tag: Option<T>,
}

#[derive(Debug, Clone, Copy)]
struct Armed<T> {
    deadline: Ticks,
    tag: Option<T>,
}

#[derive(Debug)]
pub struct TimerGroup<H, T> {
    now: Ticks,
    timers: HashMap<H, Armed<T>>,
}

impl<H, T> TimerGroup<H, T>
where
    H: Copy + Eq + Hash,
    T: Copy,
{
    pub fn new() -> Self {
        Self {
            now: 0,
            timers: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn now(&self) -> Ticks {
        self.now
    }

    pub fn start(&mut self, handle: H, ticks: Ticks, tag: Option<T>) {
        let deadline = self.now.saturating_add(ticks);
        self.timers.insert(handle, Armed { deadline, tag });
    }

    pub fn stop(&mut self, handle: H) {
        self.timers.remove(&handle);
    }

    pub fn is_running(&self, handle: H) -> bool {
        self.timers.contains_key(&handle)
    }

    pub fn next_deadline(&self) -> Option<Ticks> {
        self.timers.values().map(|armed| armed.deadline).min()
    }

    /// Advance the clock to `now` and collect every timer that expired.
    /// Time never runs backwards; an older `now` is ignored.
    pub fn run(&mut self, now: Ticks) -> Vec<Expired<H, T>> {
        self.now = self.now.max(now);

        let mut fired: Vec<(Ticks, H)> = self
            .timers
            .iter()
            .filter(|(_, armed)| armed.deadline <= self.now)
            .map(|(handle, armed)| (armed.deadline, *handle))
            .collect();
        fired.sort_by_key(|(deadline, _)| *deadline);

        fired
            .into_iter()
            .filter_map(|(_, handle)| {
                self.timers.remove(&handle).map(|armed| Expired {
                    handle,
                    tag: armed.tag,
                })
            })
            .collect()
    }
}

impl<H, T> Default for TimerGroup<H, T>
where
    H: Copy + Eq + Hash,
    T: Copy,
{
    fn default() -> Self {
        Self::new()
    }
}
