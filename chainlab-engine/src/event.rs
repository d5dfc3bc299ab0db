//! Structured journal of everything that happened to a lesson run.
//!
//! The journal is append-only and fully deterministic for a given scenario,
//! seed and action sequence, which makes it the comparison unit for replay
//! tests and tester reports.
use serde::{Deserialize, Serialize};
use smallvec::smallvec;

use crate::outcome::Outcome;
use crate::scenario::TagSet;
use crate::scheduler::Origin;

/// Stable, deterministic identifier for a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    /// Zero-based position in the run's journal.
    pub seq: u32,
}

/// Severity tier for a run event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventKind {
    Started {
        scenario: String,
        mode: String,
        seed: u64,
    },
    Entered {
        frame: String,
        visit: u64,
    },
    Transitioned {
        from: String,
        to: String,
        trigger: String,
        origin: Origin,
    },
    Rejected {
        frame: String,
        trigger: String,
        origin: Origin,
        reason: String,
    },
    WentBack {
        from: String,
        to: String,
    },
    Evaluated {
        frame: String,
        outcome: Outcome,
        reward: u32,
    },
    Rewarded {
        frame: String,
        amount: u32,
        total: u32,
    },
    Ticked {
        signal: String,
        value: i64,
    },
    TimedOut {
        signal: String,
        trigger: String,
    },
    Completed {
        trigger: String,
        reward_total: u32,
    },
    Cancelled,
}

impl RunEventKind {
    #[must_use]
    pub const fn severity(&self) -> EventSeverity {
        match self {
            Self::Rejected { .. } | Self::TimedOut { .. } | Self::Cancelled => {
                EventSeverity::Warning
            }
            _ => EventSeverity::Info,
        }
    }

    fn tags(&self) -> TagSet {
        let tag = |label: &str| label.to_string();
        match self {
            Self::Started { .. } | Self::Completed { .. } | Self::Cancelled => {
                smallvec![tag("lifecycle")]
            }
            Self::Entered { .. } | Self::Transitioned { .. } | Self::WentBack { .. } => {
                smallvec![tag("navigation")]
            }
            Self::Rejected { .. } => smallvec![tag("navigation"), tag("rejected")],
            Self::Evaluated { .. } => smallvec![tag("outcome")],
            Self::Rewarded { .. } => smallvec![tag("outcome"), tag("reward")],
            Self::Ticked { .. } => smallvec![tag("signal")],
            Self::TimedOut { .. } => smallvec![tag("signal"), tag("timeout")],
        }
    }
}

/// One journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: EventId,
    /// Logical time of the run when the event was recorded.
    pub at_ms: u64,
    pub severity: EventSeverity,
    #[serde(flatten)]
    pub kind: RunEventKind,
    #[serde(default)]
    pub tags: TagSet,
}

/// Append-only event list owned by a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journal {
    events: Vec<RunEvent>,
}

impl Journal {
    pub fn record(&mut self, at_ms: u64, kind: RunEventKind) -> EventId {
        let id = EventId {
            seq: u32::try_from(self.events.len()).unwrap_or(u32::MAX),
        };
        self.events.push(RunEvent {
            id,
            at_ms,
            severity: kind.severity(),
            tags: kind.tags(),
            kind,
        });
        id
    }

    #[must_use]
    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events carrying `tag`, in journal order.
    pub fn tagged<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a RunEvent> + 'a {
        self.events
            .iter()
            .filter(move |event| event.tags.iter().any(|t| t == tag))
    }

    #[must_use]
    pub fn into_events(self) -> Vec<RunEvent> {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_sequential_ids_and_tags() {
        let mut journal = Journal::default();
        let first = journal.record(
            0,
            RunEventKind::Started {
                scenario: "gas-under-pressure".into(),
                mode: "standard".into(),
                seed: 7,
            },
        );
        let second = journal.record(
            1_000,
            RunEventKind::TimedOut {
                signal: "countdownSeconds".into(),
                trigger: "expired".into(),
            },
        );
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        let last = &journal.events()[1];
        assert_eq!(last.severity, EventSeverity::Warning);
        assert_eq!(journal.tagged("timeout").count(), 1);
        assert_eq!(journal.tagged("signal").count(), 1);
    }

    #[test]
    fn event_json_is_flat() {
        let mut journal = Journal::default();
        journal.record(
            250,
            RunEventKind::Rewarded {
                frame: "feedback".into(),
                amount: 100,
                total: 100,
            },
        );
        let json = serde_json::to_value(&journal.events()[0]).unwrap();
        assert_eq!(json["type"], "rewarded");
        assert_eq!(json["amount"], 100);
        assert_eq!(json["at_ms"], 250);
        let restored: RunEvent = serde_json::from_value(json).unwrap();
        assert_eq!(&restored, &journal.events()[0]);
    }
}
