//! Logical clock and the serial command queue of a lesson run.
//!
//! Nothing here sleeps. The [`Scheduler`] holds future work keyed by logical
//! due time and the [`RunQueue`] holds work that is ready to apply. A run
//! moves entries from the first to the second as its clock advances, then
//! applies the queue strictly in FIFO order.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};

/// Position of a command in the run queue.
pub type Ticket = u64;

/// Who produced an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    User,
    Timer,
    Deferred,
}

/// A trigger aimed at a specific frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Frame the actor was looking at when the action was issued.
    pub frame: String,
    pub trigger: String,
    #[serde(default)]
    pub payload: Value,
    pub origin: Origin,
}

impl Action {
    #[must_use]
    pub fn user(frame: impl Into<String>, trigger: impl Into<String>, payload: Value) -> Self {
        Self {
            frame: frame.into(),
            trigger: trigger.into(),
            payload,
            origin: Origin::User,
        }
    }

    #[must_use]
    pub fn timer(frame: impl Into<String>, trigger: impl Into<String>) -> Self {
        Self {
            frame: frame.into(),
            trigger: trigger.into(),
            payload: Value::Null,
            origin: Origin::Timer,
        }
    }
}

/// Unit of work applied to a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Submit(Action),
    Tick {
        signal: String,
    },
    /// Automatic transition armed when `frame` was entered for the `visit`-th time.
    Deferred {
        frame: String,
        trigger: String,
        visit: u64,
    },
}

/// Due-time ordered store of future commands.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    now_ms: u64,
    seq: u64,
    pending: BTreeMap<(u64, u64), Command>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn now(&self) -> u64 {
        self.now_ms
    }

    /// Schedule `command` to become due `delay_ms` after the current logical time.
    /// Entries sharing a due time fire in the order they were scheduled.
    pub fn schedule_in(&mut self, delay_ms: u64, command: Command) -> u64 {
        let due = self.now_ms.saturating_add(delay_ms);
        self.pending.insert((due, self.seq), command);
        self.seq = self.seq.wrapping_add(1);
        due
    }

    /// Remove the earliest entry due at or before `until`, moving the clock to its due time.
    pub fn pop_due(&mut self, until: u64) -> Option<(u64, Command)> {
        let (&(due, seq), _) = self.pending.first_key_value()?;
        if due > until {
            return None;
        }
        let command = self.pending.remove(&(due, seq))?;
        self.now_ms = self.now_ms.max(due);
        Some((due, command))
    }

    /// Move the clock forward without firing anything. The clock never runs backwards.
    pub fn advance_to(&mut self, at_ms: u64) {
        self.now_ms = self.now_ms.max(at_ms);
    }

    #[must_use]
    pub fn next_due(&self) -> Option<u64> {
        self.pending.keys().next().map(|&(due, _)| due)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// FIFO queue of commands ready to apply.
#[derive(Debug, Clone, Default)]
pub struct RunQueue {
    next_ticket: Ticket,
    queue: VecDeque<(Ticket, Command)>,
}

impl RunQueue {
    pub fn push(&mut self, command: Command) -> Ticket {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.queue.push_back((ticket, command));
        ticket
    }

    pub fn pop(&mut self) -> Option<(Ticket, Command)> {
        self.queue.pop_front()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(name: &str) -> Command {
        Command::Tick {
            signal: name.to_string(),
        }
    }

    #[test]
    fn pops_in_due_order_with_fifo_ties() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_in(2_000, tick("b"));
        scheduler.schedule_in(1_000, tick("a"));
        scheduler.schedule_in(2_000, tick("c"));

        let order: Vec<(u64, Command)> =
            std::iter::from_fn(|| scheduler.pop_due(10_000)).collect();
        assert_eq!(
            order,
            vec![(1_000, tick("a")), (2_000, tick("b")), (2_000, tick("c"))]
        );
        assert_eq!(scheduler.now(), 2_000);
    }

    #[test]
    fn respects_the_horizon() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_in(1_500, tick("a"));
        assert!(scheduler.pop_due(1_499).is_none());
        assert_eq!(scheduler.next_due(), Some(1_500));
        scheduler.advance_to(1_000);
        assert_eq!(scheduler.now(), 1_000);
        assert_eq!(scheduler.schedule_in(1_000, tick("b")), 2_000);
        assert_eq!(scheduler.pop_due(1_500), Some((1_500, tick("a"))));
        scheduler.clear();
        assert!(scheduler.is_empty());
    }

    #[test]
    fn run_queue_is_fifo_with_increasing_tickets() {
        let mut queue = RunQueue::default();
        let first = queue.push(tick("a"));
        let second = queue.push(Command::Submit(Action::user("intro", "next", Value::Null)));
        assert!(second > first);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().map(|(t, _)| t), Some(first));
        assert_eq!(queue.pop().map(|(t, _)| t), Some(second));
        assert!(queue.pop().is_none());
    }
}
