//! Reactions: the server's answer to an Action, either a single record or
//! a multi-record EventList.

use crate::record::{KeyValRecord, is_success_response};

/// The server's answer to an Action.
#[derive(Debug, Clone)]
pub enum Reaction {
    /// A single-record response.
    Single(KeyValRecord),
    /// A multi-record response: a head carrying `EventList: start` (or
    /// similar), zero or more middle event records, and a tail that
    /// carries the terminal `EventList` value.
    EventList {
        head: KeyValRecord,
        middles: Vec<KeyValRecord>,
        tail: Option<KeyValRecord>,
    },
}

impl Reaction {
    fn head(&self) -> &KeyValRecord {
        match self {
            Self::Single(record) => record,
            Self::EventList { head, .. } => head,
        }
    }

    /// `true` iff the head record's `Response` field is `Success` or
    /// `Goodbye`.
    pub fn is_success(&self) -> bool {
        is_success_response(self.head())
    }

    /// Number of middle records accumulated (0 for a `Single` reaction).
    pub fn event_count(&self) -> usize {
        match self {
            Self::Single(_) => 0,
            Self::EventList { middles, .. } => middles.len(),
        }
    }
}
