//! Services the reconfirm coordinator consumes.
//!
//! Each trait is owned and implemented by the surrounding system. Calls are
//! made while the coordinator holds its round lock, so implementations must
//! answer from local state and never block waiting on the network.

use crate::common::{
    Error, Lsn, PrepareRequest, Progress, ProposalId, ReplicaAddress, Result,
};
use std::sync::Arc;

/// Current paxos group.
pub trait MembershipProvider: Send + Sync {
    /// Members forming the paxos group, self included.
    fn current_members(&self) -> Result<Vec<ReplicaAddress>>;

    /// Configured replica count used for majority arithmetic.
    fn replica_count(&self) -> Result<usize>;
}

/// Reconciles auxiliary leader-mode metadata across the majority.
pub trait ModeCoordinator: Send + Sync {
    fn reconcile(&self) -> Result<Progress>;
}

/// Last flushed entry as seen by the log buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushedInfo {
    pub prev_lsn: Lsn,
    pub end_lsn: Lsn,
    /// Proposal id of the most recently flushed entry, if any
    pub proposal_id: Option<ProposalId>,
}

/// Downstream delivery progress against the committed watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStatus {
    pub all_delivered: bool,
    pub last_delivered_lsn: Lsn,
    pub last_delivered_id: u64,
    pub committed_end_lsn: Lsn,
}

/// Local log tail: flush state, positions, remote fetch.
pub trait LogBuffer: Send + Sync {
    fn max_flushed_info(&self) -> Result<FlushedInfo>;

    fn max_flushed_end(&self) -> Lsn;

    /// True once every locally appended entry is durable.
    fn all_flushed(&self) -> bool;

    /// Id of the oldest entry still retained; grows as entries slide out.
    fn buffer_start_marker(&self) -> u64;

    /// End of everything appended locally, flushed or not.
    fn max_position(&self) -> Lsn;

    /// Ask `target` for the missing suffix up to `upto`. Returns whether the
    /// request was actually sent.
    fn request_fetch(&self, target: &ReplicaAddress, upto: Lsn) -> Result<bool>;

    fn advance_committed_watermark(&self, lsn: Lsn) -> Result<Progress>;

    fn all_committed_delivered(&self) -> DeliveryStatus;
}

/// Source of truth for proposal ids and this node's own promise.
pub trait AuthorityProvider: Send + Sync {
    /// Highest proposal id known locally, covering both log-derived ids and
    /// previously prepared ones.
    fn current_proposal_id(&self) -> ProposalId;

    /// Highest proposal id this node has accepted outside the log buffer
    /// (membership-configuration entries), if any.
    fn accepted_proposal_id(&self) -> Option<ProposalId>;

    fn register_promise(&self, node: &ReplicaAddress, proposal_id: ProposalId) -> Result<()>;
}

/// Append path for the start-working marker.
pub trait StartWorkingAppender: Send + Sync {
    /// Append and replicate the marker for `proposal_id`. Repeated calls for
    /// the same id resend the same entry; `Pending` means no majority yet.
    fn append_start_working_marker(&self, proposal_id: ProposalId) -> Result<Progress>;
}

/// Fire-and-forget delivery of prepare requests.
pub trait PrepareTransport: Send + Sync {
    fn send_prepare(&self, followers: &[ReplicaAddress], request: PrepareRequest) -> Result<()>;
}

/// Bound collaborators of one coordinator.
#[derive(Clone)]
pub struct Collaborators {
    pub membership: Arc<dyn MembershipProvider>,
    pub mode: Arc<dyn ModeCoordinator>,
    pub log: Arc<dyn LogBuffer>,
    pub authority: Arc<dyn AuthorityProvider>,
    pub start_working: Arc<dyn StartWorkingAppender>,
    pub transport: Arc<dyn PrepareTransport>,
}

/// Collects collaborators and validates them once.
#[derive(Default)]
pub struct CollaboratorsBuilder {
    membership: Option<Arc<dyn MembershipProvider>>,
    mode: Option<Arc<dyn ModeCoordinator>>,
    log: Option<Arc<dyn LogBuffer>>,
    authority: Option<Arc<dyn AuthorityProvider>>,
    start_working: Option<Arc<dyn StartWorkingAppender>>,
    transport: Option<Arc<dyn PrepareTransport>>,
}

impl CollaboratorsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn membership(mut self, membership: Arc<dyn MembershipProvider>) -> Self {
        self.membership = Some(membership);
        self
    }

    pub fn mode(mut self, mode: Arc<dyn ModeCoordinator>) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn log(mut self, log: Arc<dyn LogBuffer>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn authority(mut self, authority: Arc<dyn AuthorityProvider>) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn start_working(mut self, start_working: Arc<dyn StartWorkingAppender>) -> Self {
        self.start_working = Some(start_working);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn PrepareTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<Collaborators> {
        fn required<T: ?Sized>(slot: Option<Arc<T>>, name: &str) -> Result<Arc<T>> {
            slot.ok_or_else(|| Error::InvalidArgument(format!("missing {} collaborator", name)))
        }

        Ok(Collaborators {
            membership: required(self.membership, "membership")?,
            mode: required(self.mode, "mode")?,
            log: required(self.log, "log buffer")?,
            authority: required(self.authority, "authority")?,
            start_working: required(self.start_working, "start-working")?,
            transport: required(self.transport, "transport")?,
        })
    }
}
