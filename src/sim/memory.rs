//! In-memory collaborators
//!
//! Each type answers from local state behind a mutex and exposes setters so
//! tests and the simulator can steer it.

use crate::common::{
    Error, Frame, Lsn, PrepareRequest, Progress, ProposalId, ReplicaAddress, Result,
};
use crate::reconfirm::collaborators::{
    AuthorityProvider, DeliveryStatus, FlushedInfo, LogBuffer, MembershipProvider,
    ModeCoordinator, PrepareTransport, StartWorkingAppender,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;

/// Fixed member list with switchable availability.
pub struct StaticMembership {
    members: Mutex<Vec<ReplicaAddress>>,
    replica_count: AtomicUsize,
    unavailable: AtomicBool,
}

impl StaticMembership {
    pub fn new(members: Vec<ReplicaAddress>) -> Self {
        let count = members.len();
        Self {
            members: Mutex::new(members),
            replica_count: AtomicUsize::new(count),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_members(&self, members: Vec<ReplicaAddress>) {
        *self.members.lock().unwrap_or_else(|e| e.into_inner()) = members;
    }

    pub fn set_replica_count(&self, count: usize) {
        self.replica_count.store(count, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl MembershipProvider for StaticMembership {
    fn current_members(&self) -> Result<Vec<ReplicaAddress>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::collaborator("membership", "member list unavailable"));
        }
        Ok(self.members.lock()?.clone())
    }

    fn replica_count(&self) -> Result<usize> {
        Ok(self.replica_count.load(Ordering::SeqCst))
    }
}

/// Reports `Pending` for a configured number of polls, then `Done`.
#[derive(Default)]
pub struct MemModeCoordinator {
    pending_polls: AtomicUsize,
    calls: AtomicUsize,
    failure: Mutex<Option<String>>,
}

impl MemModeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pending_polls(&self, polls: usize) {
        self.pending_polls.store(polls, Ordering::SeqCst);
    }

    pub fn set_failure(&self, reason: Option<String>) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = reason;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModeCoordinator for MemModeCoordinator {
    fn reconcile(&self) -> Result<Progress> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.failure.lock()?.clone() {
            return Err(Error::collaborator("mode", reason));
        }
        let pending = self.pending_polls.load(Ordering::SeqCst);
        if pending > 0 {
            self.pending_polls.store(pending - 1, Ordering::SeqCst);
            return Ok(Progress::Pending);
        }
        Ok(Progress::Done)
    }
}

#[derive(Debug, Clone)]
struct LogBufferState {
    prev_lsn: Lsn,
    flushed_end: Lsn,
    flushed_pid: Option<ProposalId>,
    max_position: Lsn,
    start_marker: u64,
    committed_end: Lsn,
    delivered_lsn: Lsn,
    delivered_id: u64,
    auto_deliver: bool,
    fetch_sendable: bool,
    fetch_fills_log: bool,
    fetch_requests: Vec<(ReplicaAddress, Lsn)>,
}

/// Log tail kept in memory.
///
/// By default a fetch "arrives" immediately, leaving the local tail exactly
/// at the requested position, and every committed entry slides out as soon
/// as the watermark moves.
pub struct MemLogBuffer {
    state: Mutex<LogBufferState>,
}

impl MemLogBuffer {
    pub fn new(end_lsn: Lsn, last_proposal_id: Option<ProposalId>) -> Self {
        Self {
            state: Mutex::new(LogBufferState {
                prev_lsn: Lsn::ZERO,
                flushed_end: end_lsn,
                flushed_pid: last_proposal_id,
                max_position: end_lsn,
                start_marker: 0,
                committed_end: Lsn::ZERO,
                delivered_lsn: Lsn::ZERO,
                delivered_id: 0,
                auto_deliver: true,
                fetch_sendable: true,
                fetch_fills_log: true,
                fetch_requests: Vec::new(),
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut LogBufferState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Everything up to `end_lsn` is durable; the last entry carries `pid`.
    pub fn set_flushed(&self, end_lsn: Lsn, pid: Option<ProposalId>) {
        self.with_state(|s| {
            s.prev_lsn = s.flushed_end;
            s.flushed_end = end_lsn;
            s.flushed_pid = pid;
            s.max_position = end_lsn;
        });
    }

    /// Append an entry that is not durable yet.
    pub fn append_unflushed(&self, end_lsn: Lsn) {
        self.with_state(|s| s.max_position = end_lsn);
    }

    /// Flush everything appended so far.
    pub fn flush_all(&self) {
        self.with_state(|s| {
            if s.max_position > s.flushed_end {
                s.prev_lsn = s.flushed_end;
                s.flushed_end = s.max_position;
            }
        });
    }

    pub fn advance_start_marker(&self, by: u64) {
        self.with_state(|s| s.start_marker += by);
    }

    pub fn set_auto_deliver(&self, auto_deliver: bool) {
        self.with_state(|s| s.auto_deliver = auto_deliver);
    }

    pub fn deliver_up_to(&self, lsn: Lsn) {
        self.with_state(|s| {
            s.delivered_lsn = lsn;
            s.delivered_id += 1;
        });
    }

    pub fn set_fetch_sendable(&self, sendable: bool) {
        self.with_state(|s| s.fetch_sendable = sendable);
    }

    pub fn set_fetch_fills_log(&self, fills: bool) {
        self.with_state(|s| s.fetch_fills_log = fills);
    }

    pub fn fetch_requests(&self) -> Vec<(ReplicaAddress, Lsn)> {
        self.with_state(|s| s.fetch_requests.clone())
    }

    pub fn committed_end(&self) -> Lsn {
        self.with_state(|s| s.committed_end)
    }
}

impl LogBuffer for MemLogBuffer {
    fn max_flushed_info(&self) -> Result<FlushedInfo> {
        let s = self.state.lock()?;
        Ok(FlushedInfo {
            prev_lsn: s.prev_lsn,
            end_lsn: s.flushed_end,
            proposal_id: s.flushed_pid,
        })
    }

    fn max_flushed_end(&self) -> Lsn {
        self.with_state(|s| s.flushed_end)
    }

    fn all_flushed(&self) -> bool {
        self.with_state(|s| s.flushed_end >= s.max_position)
    }

    fn buffer_start_marker(&self) -> u64 {
        self.with_state(|s| s.start_marker)
    }

    fn max_position(&self) -> Lsn {
        self.with_state(|s| s.max_position)
    }

    fn request_fetch(&self, target: &ReplicaAddress, upto: Lsn) -> Result<bool> {
        let mut s = self.state.lock()?;
        if !s.fetch_sendable {
            return Ok(false);
        }
        s.fetch_requests.push((target.clone(), upto));
        if s.fetch_fills_log {
            if upto > s.flushed_end {
                s.prev_lsn = s.flushed_end;
                s.flushed_end = upto;
                s.max_position = s.max_position.max(upto);
            } else if upto < s.flushed_end {
                // The holder's shorter tail wins; drop the local suffix.
                s.prev_lsn = s.prev_lsn.min(upto);
                s.flushed_end = upto;
                s.max_position = upto;
            }
        }
        Ok(true)
    }

    fn advance_committed_watermark(&self, lsn: Lsn) -> Result<Progress> {
        let mut s = self.state.lock()?;
        if lsn > s.committed_end {
            s.committed_end = lsn;
        }
        if s.auto_deliver {
            s.delivered_lsn = s.committed_end;
            s.delivered_id += 1;
        }
        Ok(Progress::Done)
    }

    fn all_committed_delivered(&self) -> DeliveryStatus {
        self.with_state(|s| DeliveryStatus {
            all_delivered: s.delivered_lsn >= s.committed_end,
            last_delivered_lsn: s.delivered_lsn,
            last_delivered_id: s.delivered_id,
            committed_end_lsn: s.committed_end,
        })
    }
}

#[derive(Debug, Default)]
struct AuthorityState {
    current: Option<ProposalId>,
    accepted: Option<ProposalId>,
    promises: Vec<(ReplicaAddress, ProposalId)>,
}

/// Proposal id authority; a promise must exceed every earlier one.
#[derive(Default)]
pub struct MemAuthority {
    state: Mutex<AuthorityState>,
}

impl MemAuthority {
    pub fn new(current: Option<ProposalId>, accepted: Option<ProposalId>) -> Self {
        Self {
            state: Mutex::new(AuthorityState {
                current,
                accepted,
                promises: Vec::new(),
            }),
        }
    }

    pub fn promises(&self) -> Vec<(ReplicaAddress, ProposalId)> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .promises
            .clone()
    }

    /// Raise the current id, as if a newer proposal was observed elsewhere.
    pub fn observe(&self, proposal_id: ProposalId) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.current = Some(s.current.map_or(proposal_id, |c| c.max(proposal_id)));
    }
}

impl AuthorityProvider for MemAuthority {
    fn current_proposal_id(&self) -> ProposalId {
        self.state
            .lock()
            .map(|s| s.current.unwrap_or(ProposalId::INVALID))
            .unwrap_or(ProposalId::INVALID)
    }

    fn accepted_proposal_id(&self) -> Option<ProposalId> {
        self.state.lock().ok().and_then(|s| s.accepted)
    }

    fn register_promise(&self, node: &ReplicaAddress, proposal_id: ProposalId) -> Result<()> {
        let mut s = self.state.lock()?;
        if let Some(current) = s.current {
            if proposal_id <= current {
                return Err(Error::collaborator(
                    "authority",
                    format!("promise {} not above current {}", proposal_id, current),
                ));
            }
        }
        s.current = Some(proposal_id);
        s.promises.push((node.clone(), proposal_id));
        Ok(())
    }
}

/// Start-working append path: `Pending` for N calls, then `Done`.
#[derive(Default)]
pub struct MemStartWorking {
    pending_calls: AtomicUsize,
    calls: Mutex<Vec<ProposalId>>,
    failure: Mutex<Option<String>>,
}

impl MemStartWorking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pending_calls(&self, calls: usize) {
        self.pending_calls.store(calls, Ordering::SeqCst);
    }

    pub fn set_failure(&self, reason: Option<String>) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = reason;
    }

    pub fn calls(&self) -> Vec<ProposalId> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl StartWorkingAppender for MemStartWorking {
    fn append_start_working_marker(&self, proposal_id: ProposalId) -> Result<Progress> {
        self.calls.lock()?.push(proposal_id);
        if let Some(reason) = self.failure.lock()?.clone() {
            return Err(Error::collaborator("start-working", reason));
        }
        let pending = self.pending_calls.load(Ordering::SeqCst);
        if pending > 0 {
            self.pending_calls.store(pending - 1, Ordering::SeqCst);
            return Ok(Progress::Pending);
        }
        Ok(Progress::Done)
    }
}

/// Records prepares and optionally forwards them, encoded, to a network task.
#[derive(Default)]
pub struct MemTransport {
    sent: Mutex<Vec<(Vec<ReplicaAddress>, PrepareRequest)>>,
    outbox: Option<UnboundedSender<(ReplicaAddress, Vec<u8>)>>,
    failing: AtomicBool,
}

impl MemTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outbox(outbox: UnboundedSender<(ReplicaAddress, Vec<u8>)>) -> Self {
        Self {
            outbox: Some(outbox),
            ..Default::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(Vec<ReplicaAddress>, PrepareRequest)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last_proposal_id(&self) -> Option<ProposalId> {
        self.sent().last().map(|(_, req)| req.proposal_id)
    }
}

impl PrepareTransport for MemTransport {
    fn send_prepare(&self, followers: &[ReplicaAddress], request: PrepareRequest) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::collaborator("transport", "send queue closed"));
        }
        if let Some(outbox) = &self.outbox {
            let frame = Frame::Prepare(request.clone()).encode()?;
            for follower in followers {
                if outbox.send((follower.clone(), frame.clone())).is_err() {
                    tracing::warn!("Network task gone, dropping prepare to {}", follower);
                }
            }
        }
        self.sent.lock()?.push((followers.to_vec(), request));
        Ok(())
    }
}
