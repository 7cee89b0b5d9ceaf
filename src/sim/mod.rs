//! In-memory simulation of a paxos group around one reconfirming leader
//!
//! Used by the integration tests and `minilog-reconfirm simulate`.

pub mod memory;
pub mod network;

pub use memory::{
    MemAuthority, MemLogBuffer, MemModeCoordinator, MemStartWorking, MemTransport,
    StaticMembership,
};
pub use network::{spawn_network, SimFollower};

use crate::common::{Lsn, ProposalId, ReconfirmConfig, ReplicaAddress, Result};
use crate::reconfirm::{Collaborators, CollaboratorsBuilder, LogReconfirm};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// Handles to every in-memory collaborator of one leader.
pub struct SimGroup {
    pub self_addr: ReplicaAddress,
    pub membership: Arc<StaticMembership>,
    pub mode: Arc<MemModeCoordinator>,
    pub log: Arc<MemLogBuffer>,
    pub authority: Arc<MemAuthority>,
    pub start_working: Arc<MemStartWorking>,
    pub transport: Arc<MemTransport>,
}

impl SimGroup {
    /// A group of `self_addr` plus `followers`, whose local log ends at
    /// `end_lsn` with its last entry written under `last_proposal_id`.
    pub fn new(
        self_addr: impl Into<ReplicaAddress>,
        followers: &[ReplicaAddress],
        end_lsn: Lsn,
        last_proposal_id: Option<ProposalId>,
    ) -> Self {
        Self::with_transport(
            self_addr.into(),
            followers,
            end_lsn,
            last_proposal_id,
            MemTransport::new(),
        )
    }

    /// Same as [`SimGroup::new`], with prepares forwarded to a network task.
    pub fn networked(
        self_addr: impl Into<ReplicaAddress>,
        followers: &[ReplicaAddress],
        end_lsn: Lsn,
        last_proposal_id: Option<ProposalId>,
    ) -> (Self, UnboundedReceiver<(ReplicaAddress, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let group = Self::with_transport(
            self_addr.into(),
            followers,
            end_lsn,
            last_proposal_id,
            MemTransport::with_outbox(tx),
        );
        (group, rx)
    }

    fn with_transport(
        self_addr: ReplicaAddress,
        followers: &[ReplicaAddress],
        end_lsn: Lsn,
        last_proposal_id: Option<ProposalId>,
        transport: MemTransport,
    ) -> Self {
        let mut members = vec![self_addr.clone()];
        members.extend(followers.iter().cloned());
        Self {
            self_addr,
            membership: Arc::new(StaticMembership::new(members)),
            mode: Arc::new(MemModeCoordinator::new()),
            log: Arc::new(MemLogBuffer::new(end_lsn, last_proposal_id)),
            authority: Arc::new(MemAuthority::new(last_proposal_id, None)),
            start_working: Arc::new(MemStartWorking::new()),
            transport: Arc::new(transport),
        }
    }

    pub fn collaborators(&self) -> Result<Collaborators> {
        CollaboratorsBuilder::new()
            .membership(self.membership.clone())
            .mode(self.mode.clone())
            .log(self.log.clone())
            .authority(self.authority.clone())
            .start_working(self.start_working.clone())
            .transport(self.transport.clone())
            .build()
    }

    pub fn reconfirm(&self, stream_id: u64, config: ReconfirmConfig) -> Result<LogReconfirm> {
        LogReconfirm::new(stream_id, self.self_addr.clone(), config, self.collaborators()?)
    }
}
