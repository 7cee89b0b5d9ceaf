//! Error types for minilog

use crate::common::types::{Lsn, ProposalId, ReplicaAddress};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Lifecycle Errors ===
    #[error("Reconfirm coordinator is not initialized")]
    NotInitialized,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("State not match: ack for round {round} while at round {current} in state {state}")]
    StateMismatch {
        round: ProposalId,
        current: ProposalId,
        state: String,
    },

    // === Fatal Errors (leader must step down) ===
    #[error("Self {node} is not in the current member list {members:?}")]
    SelfNotMember {
        node: ReplicaAddress,
        members: Vec<ReplicaAddress>,
    },

    #[error("Membership unavailable: {0}")]
    MembershipUnavailable(String),

    #[error("Max log position {observed} differs from saved start-working position {saved}")]
    PositionMismatch { saved: Lsn, observed: Lsn },

    #[error("No proposal id left above {0}")]
    ProposalIdExhausted(ProposalId),

    // === Collaborator Errors ===
    #[error("{component} failed: {reason}")]
    Collaborator {
        component: &'static str,
        reason: String,
    },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // === Codec Errors ===
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a failure reported by one of the collaborators.
    pub fn collaborator(component: &'static str, reason: impl Into<String>) -> Self {
        Error::Collaborator {
            component,
            reason: reason.into(),
        }
    }

    /// Does this error require the owner to step down from leadership?
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::SelfNotMember { .. }
                | Error::MembershipUnavailable(_)
                | Error::PositionMismatch { .. }
                | Error::ProposalIdExhausted(_)
        )
    }

    /// Is this error worth another poll?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Collaborator { .. } | Error::Timeout(_) | Error::StateMismatch { .. }
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::Internal(format!("lock poisoned: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let mismatch = Error::PositionMismatch {
            saved: Lsn(100),
            observed: Lsn(120),
        };
        assert!(mismatch.is_fatal());
        assert!(!mismatch.is_retryable());

        let not_member = Error::SelfNotMember {
            node: "a:1".into(),
            members: vec!["b:1".into()],
        };
        assert!(not_member.is_fatal());

        let exhausted = Error::ProposalIdExhausted(ProposalId(u64::MAX - 1));
        assert!(exhausted.is_fatal());
        assert!(!exhausted.is_retryable());

        let busy = Error::collaborator("transport", "queue full");
        assert!(!busy.is_fatal());
        assert!(busy.is_retryable());
        assert_eq!(busy.to_string(), "transport failed: queue full");

        assert!(!Error::NotInitialized.is_fatal());
        assert!(!Error::NotInitialized.is_retryable());
        assert!(!Error::InvalidArgument("x".into()).is_retryable());
    }
}
