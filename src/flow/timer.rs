//! Deadline-ordered queue of deferred work, drained by its owning thread.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;

#[derive(Debug)]
pub struct Timer<T> {
    deadline: Instant,
    payload: T,
}

impl<T> Timer<T> {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn into_inner(self) -> T {
        self.payload
    }
}

impl<T> Ord for Timer<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

impl<T> PartialOrd for Timer<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Timer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Timer<T> {}

#[derive(Debug)]
pub struct TimerQueue<T>(BinaryHeap<Reverse<Timer<T>>>);

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        TimerQueue::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self(BinaryHeap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn schedule(&mut self, deadline: Instant, payload: T) {
        self.0.push(Reverse(Timer { deadline, payload }))
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.0.peek().map(|Reverse(timer)| timer.deadline)
    }

    /// Pop the earliest timer if its deadline is at or before `now`.
    pub fn poll_expired(&mut self, now: Instant) -> Option<Timer<T>> {
        match self.0.peek() {
            Some(Reverse(timer)) if timer.deadline <= now => self.0.pop().map(|Reverse(timer)| timer),
            _ => None,
        }
    }
}
