//! Prepare round submission and ack aggregation

use crate::common::{Error, Lsn, PrepareRequest, ProposalId, ReplicaAddress, Result};
use crate::reconfirm::collaborators::Collaborators;
use crate::reconfirm::state::{CandidateTail, ReconfirmState, RoundState};
use std::time::Instant;

/// Result of folding a prepare ack into the round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Counted toward the majority and compared against the candidate tail.
    Recorded,
    /// Sender is not in the follower snapshot of this round; dropped.
    UnknownSender,
}

/// Starting accept id of the candidate tail.
///
/// The highest of the last flushed entry's id and the id this node accepted
/// through membership-configuration logs. Anchoring on the flushed entry
/// alone would let a later leader resurrect a prior leader's unconfirmed
/// suffix once an intermediate leader committed only its start-working marker.
pub fn initial_accept_proposal_id(
    flushed: Option<ProposalId>,
    accepted: Option<ProposalId>,
) -> Option<ProposalId> {
    match (flushed, accepted) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Inputs of one prepare submission.
pub(crate) struct PrepareContext<'a> {
    pub stream_id: u64,
    pub self_addr: &'a ReplicaAddress,
    pub collaborators: &'a Collaborators,
    /// Highest id this coordinator promised before, if any
    pub promise_floor: Option<ProposalId>,
}

/// (Re)start the prepare round: kick off mode reconciliation, reset acks
/// and candidate, pick a strictly higher proposal id, promise it locally and
/// broadcast the prepare.
pub(crate) fn submit_prepare(
    round: &mut RoundState,
    ctx: &PrepareContext<'_>,
    now: Instant,
) -> Result<ProposalId> {
    let log = &ctx.collaborators.log;
    let authority = &ctx.collaborators.authority;

    // Mode metadata reconciliation runs alongside the prepare round.
    let mode_progress = ctx.collaborators.mode.reconcile()?;

    let flushed = log.max_flushed_info()?;
    let accepted = authority.accepted_proposal_id();
    let initial_accept = initial_accept_proposal_id(flushed.proposal_id, accepted);

    round.acks.clear();
    round.candidate = Some(CandidateTail::new(
        ctx.self_addr.clone(),
        initial_accept,
        flushed.end_lsn,
    ));

    let old_proposal_id = authority.current_proposal_id();
    let mut new_proposal_id = match old_proposal_id.valid() {
        Some(current) => current
            .next()
            .ok_or(Error::ProposalIdExhausted(current))?,
        None => ProposalId(1),
    };
    if let Some(floor) = ctx.promise_floor {
        let above_floor = floor.next().ok_or(Error::ProposalIdExhausted(floor))?;
        new_proposal_id = new_proposal_id.max(above_floor);
    }
    round.proposal_id = Some(new_proposal_id);

    authority.register_promise(ctx.self_addr, new_proposal_id)?;

    if !round.followers.is_empty() {
        let followers: Vec<ReplicaAddress> = round.followers.iter().cloned().collect();
        ctx.collaborators.transport.send_prepare(
            &followers,
            PrepareRequest {
                stream_id: ctx.stream_id,
                from: ctx.self_addr.clone(),
                proposal_id: new_proposal_id,
            },
        )?;
    }

    let previous_submit = round.last_prepare_at.replace(now);
    tracing::info!(
        stream_id = ctx.stream_id,
        node = %ctx.self_addr,
        %old_proposal_id,
        %new_proposal_id,
        max_flushed_end = %flushed.end_lsn,
        max_flushed_pid = ?flushed.proposal_id,
        accepted_pid = ?accepted,
        followers = round.followers.len(),
        resubmit = previous_submit.is_some(),
        mode_done = mode_progress.is_done(),
        "Prepare submitted"
    );
    Ok(new_proposal_id)
}

/// Fold one follower's prepare ack into the round.
pub(crate) fn apply_ack(
    round: &mut RoundState,
    sender: &ReplicaAddress,
    round_proposal_id: ProposalId,
    accept_proposal_id: ProposalId,
    last_lsn: Lsn,
) -> Result<AckOutcome> {
    if !sender.is_valid()
        || !round_proposal_id.is_valid()
        || !accept_proposal_id.is_valid()
        || !last_lsn.is_valid()
    {
        return Err(Error::InvalidArgument(format!(
            "prepare ack from {:?}: round {}, accept {}, lsn {}",
            sender.as_str(),
            round_proposal_id,
            accept_proposal_id,
            last_lsn
        )));
    }

    if round.proposal_id != Some(round_proposal_id)
        || round.state != ReconfirmState::CollectingPrepareAcks
    {
        return Err(Error::StateMismatch {
            round: round_proposal_id,
            current: round.proposal_id.unwrap_or(ProposalId::INVALID),
            state: round.state.to_string(),
        });
    }

    if !round.is_follower(sender) {
        tracing::warn!("Prepare ack from {} which is not in the follower list", sender);
        return Ok(AckOutcome::UnknownSender);
    }

    round.acks.insert(sender.clone());

    let candidate = round.candidate.get_or_insert_with(|| {
        CandidateTail::new(sender.clone(), None, Lsn::INVALID)
    });
    if candidate.observe(sender, accept_proposal_id, last_lsn) {
        tracing::info!(
            "Candidate tail moved to {} (accept {}, lsn {})",
            sender,
            accept_proposal_id,
            last_lsn
        );
    } else {
        tracing::debug!(
            "Prepare ack from {} (accept {}, lsn {}) does not beat candidate {:?}",
            sender,
            accept_proposal_id,
            last_lsn,
            candidate
        );
    }
    Ok(AckOutcome::Recorded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> ReplicaAddress {
        ReplicaAddress::from(s)
    }

    fn collecting_round(proposal_id: u64, followers: &[&str]) -> RoundState {
        RoundState {
            state: ReconfirmState::CollectingPrepareAcks,
            proposal_id: Some(ProposalId(proposal_id)),
            followers: followers.iter().map(|f| addr(f)).collect(),
            majority: crate::common::majority_count(followers.len() + 1),
            candidate: Some(CandidateTail::new(addr("self"), None, Lsn(0))),
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_accept_takes_highest_present() {
        assert_eq!(
            initial_accept_proposal_id(Some(ProposalId(3)), Some(ProposalId(4))),
            Some(ProposalId(4))
        );
        assert_eq!(
            initial_accept_proposal_id(Some(ProposalId(5)), Some(ProposalId(4))),
            Some(ProposalId(5))
        );
        assert_eq!(
            initial_accept_proposal_id(None, Some(ProposalId(2))),
            Some(ProposalId(2))
        );
        assert_eq!(
            initial_accept_proposal_id(Some(ProposalId(2)), None),
            Some(ProposalId(2))
        );
        assert_eq!(initial_accept_proposal_id(None, None), None);
    }

    #[test]
    fn test_apply_ack_rejects_invalid_inputs() {
        let mut round = collecting_round(5, &["f1", "f2"]);
        let cases = [
            (addr(""), ProposalId(5), ProposalId(1), Lsn(10)),
            (addr("f1"), ProposalId::INVALID, ProposalId(1), Lsn(10)),
            (addr("f1"), ProposalId(5), ProposalId::INVALID, Lsn(10)),
            (addr("f1"), ProposalId(5), ProposalId(1), Lsn::INVALID),
        ];
        for (sender, round_id, accept, lsn) in cases {
            let err = apply_ack(&mut round, &sender, round_id, accept, lsn).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
        }
        assert!(round.acks.is_empty());
    }

    #[test]
    fn test_apply_ack_stale_round_leaves_candidate() {
        let mut round = collecting_round(5, &["f1", "f2"]);
        let before = round.candidate.clone();
        let err = apply_ack(&mut round, &addr("f1"), ProposalId(4), ProposalId(9), Lsn(900))
            .unwrap_err();
        assert!(matches!(err, Error::StateMismatch { .. }));
        assert_eq!(round.candidate, before);
        assert!(round.acks.is_empty());
    }

    #[test]
    fn test_apply_ack_wrong_state_rejected() {
        let mut round = collecting_round(5, &["f1", "f2"]);
        round.state = ReconfirmState::ReconcileMode;
        let err = apply_ack(&mut round, &addr("f1"), ProposalId(5), ProposalId(1), Lsn(10))
            .unwrap_err();
        assert!(matches!(err, Error::StateMismatch { .. }));
    }

    #[test]
    fn test_apply_ack_unknown_sender_not_counted() {
        let mut round = collecting_round(5, &["f1", "f2"]);
        let outcome =
            apply_ack(&mut round, &addr("stranger"), ProposalId(5), ProposalId(9), Lsn(10))
                .unwrap();
        assert_eq!(outcome, AckOutcome::UnknownSender);
        assert!(round.acks.is_empty());
        assert_eq!(round.candidate.as_ref().unwrap().holder, addr("self"));
    }

    #[test]
    fn test_apply_ack_is_idempotent_per_sender() {
        let mut round = collecting_round(5, &["f1", "f2", "f3", "f4"]);
        for _ in 0..3 {
            apply_ack(&mut round, &addr("f1"), ProposalId(5), ProposalId(1), Lsn(10)).unwrap();
        }
        assert_eq!(round.acks.len(), 1);
        assert_eq!(round.votes(), 2);
    }

    #[test]
    fn test_three_replica_candidate_scenario() {
        let mut round = collecting_round(5, &["f1", "f2"]);
        apply_ack(&mut round, &addr("f1"), ProposalId(5), ProposalId(1), Lsn(100)).unwrap();
        apply_ack(&mut round, &addr("f2"), ProposalId(5), ProposalId(2), Lsn(80)).unwrap();
        assert_eq!(
            round.candidate,
            Some(CandidateTail::new(addr("f2"), Some(ProposalId(2)), Lsn(80)))
        );
    }

    #[test]
    fn test_accept_id_never_decreases_within_round() {
        let mut round = collecting_round(9, &["f1", "f2", "f3", "f4"]);
        let acks = [("f1", 3, 50), ("f2", 1, 500), ("f3", 3, 70), ("f4", 2, 900)];
        let mut highest = None;
        for (from, accept, lsn) in acks {
            apply_ack(&mut round, &addr(from), ProposalId(9), ProposalId(accept), Lsn(lsn))
                .unwrap();
            let current = round.candidate.as_ref().unwrap().accept_proposal_id;
            assert!(current >= highest);
            highest = current;
        }
        assert_eq!(
            round.candidate,
            Some(CandidateTail::new(addr("f3"), Some(ProposalId(3)), Lsn(70)))
        );
    }
}
