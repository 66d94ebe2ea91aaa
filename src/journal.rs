//! Request journal.
//!
//! Append-only record of every mock request the server received, queryable
//! and poppable by live position.

use crate::request::RecordedRequest;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Which journal entry a query addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalSelector {
    First,
    Last,
    /// 0-based live position
    Index(usize),
    Count,
}

/// Which end of the journal a pop removes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEnd {
    First,
    Last,
}

impl FromStr for JournalSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(JournalSelector::First),
            "last" | "latest" => Ok(JournalSelector::Last),
            "count" => Ok(JournalSelector::Count),
            other => other
                .parse()
                .map(JournalSelector::Index)
                .map_err(|_| format!("invalid journal selector: {other}")),
        }
    }
}

impl fmt::Display for JournalSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalSelector::First => f.write_str("first"),
            JournalSelector::Last => f.write_str("last"),
            JournalSelector::Index(n) => write!(f, "{n}"),
            JournalSelector::Count => f.write_str("count"),
        }
    }
}

impl FromStr for JournalEnd {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(JournalEnd::First),
            "last" | "latest" => Ok(JournalEnd::Last),
            other => Err(format!("cannot pop journal entry: {other}")),
        }
    }
}

impl fmt::Display for JournalEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalEnd::First => f.write_str("first"),
            JournalEnd::Last => f.write_str("last"),
        }
    }
}

/// Ordered journal of recorded requests.
#[derive(Debug, Default)]
pub struct Journal {
    entries: VecDeque<RecordedRequest>,
    /// Next sequence number; never rewound, not even by `clear`
    next_sequence: u64,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request, stamping it with the next sequence number.
    pub fn record(&mut self, mut request: RecordedRequest) -> &RecordedRequest {
        request.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push_back(request);
        &self.entries[self.entries.len() - 1]
    }

    pub fn first(&self) -> Option<&RecordedRequest> {
        self.entries.front()
    }

    pub fn last(&self) -> Option<&RecordedRequest> {
        self.entries.back()
    }

    pub fn at(&self, position: usize) -> Option<&RecordedRequest> {
        self.entries.get(position)
    }

    /// Resolve an entry selector. `Count` selects nothing.
    pub fn get(&self, selector: JournalSelector) -> Option<&RecordedRequest> {
        match selector {
            JournalSelector::First => self.first(),
            JournalSelector::Last => self.last(),
            JournalSelector::Index(n) => self.at(n),
            JournalSelector::Count => None,
        }
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pop(&mut self, end: JournalEnd) -> Option<RecordedRequest> {
        match end {
            JournalEnd::First => self.entries.pop_front(),
            JournalEnd::Last => self.entries.pop_back(),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecordedRequest> {
        self.entries.iter()
    }
}
