//! Construction, reset and teardown of the reconfirm coordinator

use minilog::common::{Error, Lsn, ProposalId, ReconfirmConfig, ReplicaAddress};
use minilog::reconfirm::{
    AuthorityProvider, CollaboratorsBuilder, LogReconfirm, ReconfirmState, StepOutcome,
};
use minilog::sim::SimGroup;
use std::sync::{Arc, Mutex};

const STREAM: u64 = 7;

fn group() -> SimGroup {
    SimGroup::new(
        "a:1",
        &[ReplicaAddress::from("b:1"), ReplicaAddress::from("c:1")],
        Lsn(1000),
        Some(ProposalId(3)),
    )
}

#[test]
fn test_reset_matches_a_freshly_built_coordinator() {
    let group = group();
    let reconfirm = group.reconfirm(STREAM, ReconfirmConfig::default()).unwrap();
    reconfirm.step().unwrap();
    reconfirm.step().unwrap();
    let round = reconfirm.status().proposal_id.unwrap();
    reconfirm
        .handle_prepare_ack(&"b:1".into(), round, ProposalId(3), Lsn(1400))
        .unwrap();

    reconfirm.reset_state();
    assert!(reconfirm.needs_start_up());
    assert!(reconfirm.is_initialized());
    let status = reconfirm.status();
    assert_eq!(status.state, ReconfirmState::Initial);
    assert!(status.proposal_id.is_none());
    assert!(status.acks.is_empty());
    assert!(status.candidate.is_none());

    let fresh = group.reconfirm(STREAM, ReconfirmConfig::default()).unwrap();
    reconfirm.step().unwrap();
    fresh.step().unwrap();
    assert_eq!(reconfirm.status(), fresh.status());

    // The abandoned round's id is never reused.
    reconfirm.step().unwrap();
    let next = reconfirm.status().proposal_id.unwrap();
    assert!(next > round);
    reconfirm
        .handle_prepare_ack(&"c:1".into(), next, ProposalId(3), Lsn(1000))
        .unwrap();
    assert_eq!(reconfirm.step().unwrap(), StepOutcome::Converged);
}

#[test]
fn test_reset_in_initial_state_is_a_no_op() {
    let group = group();
    let reconfirm = group.reconfirm(STREAM, ReconfirmConfig::default()).unwrap();
    let before = reconfirm.status();
    reconfirm.reset_state();
    assert_eq!(reconfirm.status(), before);
}

/// Authority whose current id never moves, as if promises were not yet
/// visible when read back.
struct LaggingAuthority {
    promises: Mutex<Vec<ProposalId>>,
}

impl AuthorityProvider for LaggingAuthority {
    fn current_proposal_id(&self) -> ProposalId {
        ProposalId(3)
    }

    fn accepted_proposal_id(&self) -> Option<ProposalId> {
        None
    }

    fn register_promise(&self, _node: &ReplicaAddress, proposal_id: ProposalId) -> minilog::Result<()> {
        self.promises.lock().unwrap().push(proposal_id);
        Ok(())
    }
}

#[test]
fn test_promised_ids_stay_increasing_across_resets() {
    let group = group();
    let authority = Arc::new(LaggingAuthority {
        promises: Mutex::new(Vec::new()),
    });
    let collaborators = CollaboratorsBuilder::new()
        .membership(group.membership.clone())
        .mode(group.mode.clone())
        .log(group.log.clone())
        .authority(authority.clone())
        .start_working(group.start_working.clone())
        .transport(group.transport.clone())
        .build()
        .unwrap();
    let reconfirm =
        LogReconfirm::new(STREAM, "a:1".into(), ReconfirmConfig::default(), collaborators).unwrap();

    for _ in 0..3 {
        reconfirm.step().unwrap();
        reconfirm.step().unwrap();
        reconfirm.reset_state();
    }

    let promises = authority.promises.lock().unwrap().clone();
    assert_eq!(promises, vec![ProposalId(4), ProposalId(5), ProposalId(6)]);
}

#[test]
fn test_destroy_is_idempotent_and_disables_the_coordinator() {
    let group = group();
    let reconfirm = group.reconfirm(STREAM, ReconfirmConfig::default()).unwrap();
    reconfirm.step().unwrap();
    reconfirm.step().unwrap();
    let round = reconfirm.status().proposal_id.unwrap();

    reconfirm.destroy();
    reconfirm.destroy();

    assert!(!reconfirm.is_initialized());
    assert!(reconfirm.needs_start_up());
    assert!(!reconfirm.status().initialized);
    assert!(matches!(reconfirm.step(), Err(Error::NotInitialized)));
    assert!(matches!(
        reconfirm.handle_prepare_ack(&"b:1".into(), round, ProposalId(3), Lsn(1000)),
        Err(Error::NotInitialized)
    ));

    // Teardown does not touch collaborators.
    assert_eq!(group.log.committed_end(), Lsn::ZERO);
    assert_eq!(group.transport.sent().len(), 1);
}

#[test]
fn test_builder_reports_missing_collaborator() {
    let group = group();
    let result = CollaboratorsBuilder::new()
        .membership(group.membership.clone())
        .mode(group.mode.clone())
        .log(group.log.clone())
        .authority(group.authority.clone())
        .start_working(group.start_working.clone())
        .build();
    match result {
        Err(Error::InvalidArgument(msg)) => assert!(msg.contains("transport")),
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("built without a transport"),
    }
}

#[test]
fn test_rejects_invalid_self_address() {
    let group = group();
    for bad in ["", "a 1"] {
        let result = LogReconfirm::new(
            STREAM,
            ReplicaAddress::from(bad),
            ReconfirmConfig::default(),
            group.collaborators().unwrap(),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}

#[test]
fn test_rejects_invalid_config() {
    let group = group();
    let config = ReconfirmConfig {
        max_transitions_per_step: 0,
        ..Default::default()
    };
    assert!(matches!(
        group.reconfirm(STREAM, config),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_status_serializes_for_diagnostics() {
    let group = group();
    let reconfirm = group.reconfirm(STREAM, ReconfirmConfig::default()).unwrap();
    reconfirm.step().unwrap();
    reconfirm.step().unwrap();

    let json = serde_json::to_value(reconfirm.status()).unwrap();
    assert_eq!(json["stream_id"], 7);
    assert_eq!(json["state"], "collecting_prepare_acks");
    assert_eq!(json["majority"], 2);
    assert_eq!(json["followers"].as_array().unwrap().len(), 2);
}
