//! Core log types: proposal ids, log positions, replica addresses

use serde::{Deserialize, Serialize};
use std::fmt;

/// Leadership round counter.
///
/// Proposal ids are totally ordered and only ever move forward. The
/// `INVALID` sentinel marks "no proposal" on the wire; inside the crate an
/// absent id is usually carried as `Option<ProposalId>` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProposalId(pub u64);

impl ProposalId {
    pub const INVALID: ProposalId = ProposalId(u64::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// The next round id, or `None` once the id space is used up.
    pub fn next(self) -> Option<ProposalId> {
        self.0
            .checked_add(1)
            .map(ProposalId)
            .filter(|next| next.is_valid())
    }

    /// `None` for the sentinel, `Some(self)` otherwise.
    pub fn valid(self) -> Option<ProposalId> {
        self.is_valid().then_some(self)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "P{}", self.0)
        } else {
            write!(f, "P-")
        }
    }
}

/// Offset into the replicated log stream (LSN).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);
    pub const INVALID: Lsn = Lsn(u64::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for Lsn {
    fn default() -> Self {
        Lsn::INVALID
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "-")
        }
    }
}

/// Opaque identity of a group member (typically `host:port`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaAddress(String);

impl ReplicaAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// An address is usable once it is non-empty and free of whitespace.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && !self.0.chars().any(char::is_whitespace)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ReplicaAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Answer of a collaborator step that may need several polls to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Progress {
    Done,
    Pending,
}

impl Progress {
    pub fn is_done(self) -> bool {
        matches!(self, Progress::Done)
    }
}
