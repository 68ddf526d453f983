//! Stream position tracking for the replication session.
//!
//! The tracker holds the one position the consumer both reads from and
//! reports back to the server. It only moves on commit boundaries: a
//! position taken from a message record may sit inside a transaction the
//! server has not yet finished sending, and acknowledging it would let the
//! server recycle WAL the consumer has not seen committed.

use crate::postgres::Lsn;

/// A position read off a decoded record, tagged with the record it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPosition {
    Begin(Lsn),
    Message(Lsn),
    Commit(Lsn),
}

/// What [`PositionTracker::advance`] did with a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Moved { from: Lsn, to: Lsn },
    /// Candidate equals the current position.
    Unchanged,
    /// Commit position behind the current one; rejected.
    Stale { current: Lsn, candidate: Lsn },
    /// Not a commit boundary; never moves the position.
    NotABoundary,
}

#[derive(Debug, Clone, Default)]
pub struct PositionTracker {
    current: Lsn,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the starting position. Only session (re)initialization calls this.
    pub fn seed(&mut self, initial: Lsn) {
        self.current = initial;
    }

    pub fn advance(&mut self, candidate: RecordPosition) -> Advance {
        let candidate = match candidate {
            RecordPosition::Commit(lsn) => lsn,
            RecordPosition::Begin(_) | RecordPosition::Message(_) => return Advance::NotABoundary,
        };

        if candidate > self.current {
            let from = self.current;
            self.current = candidate;
            Advance::Moved {
                from,
                to: candidate,
            }
        } else if candidate == self.current {
            Advance::Unchanged
        } else {
            Advance::Stale {
                current: self.current,
                candidate,
            }
        }
    }

    pub fn current(&self) -> Lsn {
        self.current
    }
}
