//! Reconfirm state machine states and round-scoped data

use crate::common::{Lsn, ProposalId, ReplicaAddress};
use crate::reconfirm::fetch::FetchThrottle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Instant;

/// Reconfirm states, in the order a round walks through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconfirmState {
    /// Needs reconfirmation; nothing sampled yet.
    #[default]
    Initial,
    /// Waiting for every local entry to become durable before preparing.
    AwaitingLocalFlush,
    /// Prepare sent; gathering follower acks until a majority answered.
    CollectingPrepareAcks,
    /// Leader-mode metadata being reconciled across the majority.
    ReconcileMode,
    /// Pulling the missing suffix from the candidate-tail holder.
    FetchMissingLog,
    /// Appending the start-working marker.
    Reconciling,
    /// Waiting for the marker to reach a majority and the tail to slide out.
    AwaitingStartWorkingMajority,
    Finished,
}

impl ReconfirmState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReconfirmState::Finished)
    }
}

impl std::fmt::Display for ReconfirmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReconfirmState::Initial => "initial",
            ReconfirmState::AwaitingLocalFlush => "awaiting_local_flush",
            ReconfirmState::CollectingPrepareAcks => "collecting_prepare_acks",
            ReconfirmState::ReconcileMode => "reconcile_mode",
            ReconfirmState::FetchMissingLog => "fetch_missing_log",
            ReconfirmState::Reconciling => "reconciling",
            ReconfirmState::AwaitingStartWorkingMajority => "awaiting_start_working_majority",
            ReconfirmState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Best evidence so far of where the committed tail lies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateTail {
    pub holder: ReplicaAddress,
    pub accept_proposal_id: Option<ProposalId>,
    pub lsn: Lsn,
}

impl CandidateTail {
    pub fn new(holder: ReplicaAddress, accept_proposal_id: Option<ProposalId>, lsn: Lsn) -> Self {
        Self {
            holder,
            accept_proposal_id,
            lsn,
        }
    }

    /// Fold one replica's evidence in. Higher accept id wins outright; on an
    /// equal id the longer log wins and ties keep the current holder.
    /// Returns whether the candidate changed.
    pub fn observe(&mut self, from: &ReplicaAddress, accept_proposal_id: ProposalId, lsn: Lsn) -> bool {
        match self.accept_proposal_id {
            Some(current) if accept_proposal_id < current => false,
            Some(current) if accept_proposal_id == current => {
                if lsn > self.lsn {
                    self.holder = from.clone();
                    self.lsn = lsn;
                    true
                } else {
                    false
                }
            }
            _ => {
                self.holder = from.clone();
                self.accept_proposal_id = Some(accept_proposal_id);
                self.lsn = lsn;
                true
            }
        }
    }
}

/// Everything that lives for one reconfirmation attempt.
///
/// Guarded as a whole by the coordinator lock; candidate, ack set and
/// round id are always read together.
#[derive(Debug, Default)]
pub struct RoundState {
    pub state: ReconfirmState,
    /// Prepare id of the current round
    pub proposal_id: Option<ProposalId>,
    /// Members minus self, sampled at round start
    pub followers: BTreeSet<ReplicaAddress>,
    pub majority: usize,
    /// Followers that acked the current prepare (self never inserted)
    pub acks: BTreeSet<ReplicaAddress>,
    pub candidate: Option<CandidateTail>,
    pub last_prepare_at: Option<Instant>,
    pub fetch: FetchThrottle,
    /// Flushed end sampled when the start-working marker was submitted
    pub saved_end_lsn: Option<Lsn>,
}

impl RoundState {
    /// Ack count with self counted implicitly.
    pub fn votes(&self) -> usize {
        self.acks.len() + 1
    }

    pub fn has_majority(&self) -> bool {
        self.votes() >= self.majority
    }

    pub fn is_follower(&self, addr: &ReplicaAddress) -> bool {
        self.followers.contains(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> ReplicaAddress {
        ReplicaAddress::from(s)
    }

    #[test]
    fn test_observe_higher_accept_id_replaces_unconditionally() {
        let mut tail = CandidateTail::new(addr("self"), Some(ProposalId(1)), Lsn(100));
        assert!(tail.observe(&addr("f2"), ProposalId(2), Lsn(80)));
        assert_eq!(tail, CandidateTail::new(addr("f2"), Some(ProposalId(2)), Lsn(80)));
    }

    #[test]
    fn test_observe_lower_accept_id_ignored() {
        let mut tail = CandidateTail::new(addr("self"), Some(ProposalId(3)), Lsn(100));
        assert!(!tail.observe(&addr("f1"), ProposalId(2), Lsn(5000)));
        assert_eq!(tail.holder, addr("self"));
        assert_eq!(tail.lsn, Lsn(100));
    }

    #[test]
    fn test_observe_equal_accept_id_prefers_longer_log() {
        let mut tail = CandidateTail::new(addr("self"), Some(ProposalId(3)), Lsn(100));
        assert!(!tail.observe(&addr("f1"), ProposalId(3), Lsn(100)));
        assert_eq!(tail.holder, addr("self"));

        assert!(!tail.observe(&addr("f1"), ProposalId(3), Lsn(90)));
        assert!(tail.observe(&addr("f2"), ProposalId(3), Lsn(120)));
        assert_eq!(tail.holder, addr("f2"));
        assert_eq!(tail.lsn, Lsn(120));
    }

    #[test]
    fn test_observe_absent_accept_id_takes_first_evidence() {
        let mut tail = CandidateTail::new(addr("self"), None, Lsn(0));
        assert!(tail.observe(&addr("f1"), ProposalId(1), Lsn(10)));
        assert_eq!(tail.accept_proposal_id, Some(ProposalId(1)));
    }

    #[test]
    fn test_majority_counts_self() {
        let mut round = RoundState {
            majority: 2,
            ..Default::default()
        };
        assert!(!round.has_majority());
        round.acks.insert(addr("f1"));
        assert!(round.has_majority());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ReconfirmState::default(), ReconfirmState::Initial);
        assert_eq!(
            ReconfirmState::AwaitingStartWorkingMajority.to_string(),
            "awaiting_start_working_majority"
        );
        assert!(ReconfirmState::Finished.is_terminal());
    }
}
