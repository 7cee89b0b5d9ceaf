//! Reconfirm coordinator
//!
//! Drives a new (or resuming) leader from "needs reconfirmation" to
//! "may accept writes":
//!
//! ```text
//! Initial -> AwaitingLocalFlush -> CollectingPrepareAcks -> ReconcileMode
//!         -> FetchMissingLog -> Reconciling -> AwaitingStartWorkingMajority
//!         -> Finished
//! ```
//!
//! The owner calls [`LogReconfirm::step`] repeatedly; `RetryLater` is the
//! normal answer until the round finishes. Prepare acks arrive on another
//! path through [`LogReconfirm::handle_prepare_ack`]. Both take the same
//! lock for their whole body, and `step()` never waits while holding it.

use crate::common::{
    majority_count, Error, Lsn, PrepareResponse, Progress, ProposalId, ReconfirmConfig,
    ReplicaAddress, Result, TimeInterval,
};
use crate::reconfirm::collaborators::Collaborators;
use crate::reconfirm::prepare::{self, AckOutcome, PrepareContext};
use crate::reconfirm::state::{CandidateTail, ReconfirmState, RoundState};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Minimum gap between two "reconfirm waiting retry" log lines.
const WAITING_LOG_INTERVAL: Duration = Duration::from_millis(10);

/// Answer of one `step()` poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Reconfirmation finished; the leader may accept writes.
    Converged,
    /// Not done yet; poll again later.
    RetryLater,
}

impl StepOutcome {
    pub fn is_converged(self) -> bool {
        matches!(self, StepOutcome::Converged)
    }
}

/// Point-in-time view of a coordinator, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconfirmStatus {
    pub stream_id: u64,
    pub node: ReplicaAddress,
    pub initialized: bool,
    pub state: ReconfirmState,
    pub proposal_id: Option<ProposalId>,
    pub majority: usize,
    pub followers: Vec<ReplicaAddress>,
    pub acks: Vec<ReplicaAddress>,
    pub candidate: Option<CandidateTail>,
    pub saved_end_lsn: Option<Lsn>,
    pub fetch_attempts: u64,
}

/// What a state handler decided.
enum Transition {
    /// Stay in the current state; the poll ends with `RetryLater`.
    Wait,
    /// Move to `next`; with `fall_through` the same poll keeps going.
    Advance {
        next: ReconfirmState,
        fall_through: bool,
    },
}

impl Transition {
    fn to(next: ReconfirmState) -> Self {
        Transition::Advance {
            next,
            fall_through: true,
        }
    }

    fn stop_at(next: ReconfirmState) -> Self {
        Transition::Advance {
            next,
            fall_through: false,
        }
    }
}

struct Inner {
    collaborators: Option<Collaborators>,
    round: RoundState,
    /// Highest prepare id this coordinator registered; survives `reset_state`
    promise_floor: Option<ProposalId>,
    waiting_log: TimeInterval,
    slide_wait_log: TimeInterval,
}

/// Per-stream reconfirm coordinator.
pub struct LogReconfirm {
    stream_id: u64,
    self_addr: ReplicaAddress,
    config: ReconfirmConfig,
    inner: Mutex<Inner>,
}

impl LogReconfirm {
    /// Bind a coordinator to its collaborators. Fails fast on an invalid
    /// self address or configuration.
    pub fn new(
        stream_id: u64,
        self_addr: ReplicaAddress,
        config: ReconfirmConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        if !self_addr.is_valid() {
            return Err(Error::InvalidArgument(format!(
                "invalid self address {:?}",
                self_addr.as_str()
            )));
        }
        config.validate()?;

        tracing::info!("LogReconfirm init success: stream {} on {}", stream_id, self_addr);
        Ok(Self {
            stream_id,
            self_addr,
            inner: Mutex::new(Inner {
                collaborators: Some(collaborators),
                round: RoundState::default(),
                promise_floor: None,
                waiting_log: TimeInterval::new(WAITING_LOG_INTERVAL),
                slide_wait_log: TimeInterval::new(config.slide_wait_log_interval()),
            }),
            config,
        })
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn self_addr(&self) -> &ReplicaAddress {
        &self.self_addr
    }

    pub fn config(&self) -> &ReconfirmConfig {
        &self.config
    }

    /// Diagnostic and teardown paths must still work after a panic
    /// elsewhere poisoned the lock.
    fn lock_unpoisoned(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True exactly while the coordinator sits in the initial state.
    pub fn needs_start_up(&self) -> bool {
        self.lock_unpoisoned().round.state == ReconfirmState::Initial
    }

    pub fn is_initialized(&self) -> bool {
        self.lock_unpoisoned().collaborators.is_some()
    }

    pub fn state(&self) -> ReconfirmState {
        self.lock_unpoisoned().round.state
    }

    pub fn status(&self) -> ReconfirmStatus {
        let inner = self.lock_unpoisoned();
        let round = &inner.round;
        ReconfirmStatus {
            stream_id: self.stream_id,
            node: self.self_addr.clone(),
            initialized: inner.collaborators.is_some(),
            state: round.state,
            proposal_id: round.proposal_id,
            majority: round.majority,
            followers: round.followers.iter().cloned().collect(),
            acks: round.acks.iter().cloned().collect(),
            candidate: round.candidate.clone(),
            saved_end_lsn: round.saved_end_lsn,
            fetch_attempts: round.fetch.attempts(),
        }
    }

    /// Abandon any in-progress round and go back to the initial state.
    /// Collaborator bindings are kept.
    pub fn reset_state(&self) {
        let mut inner = self.lock_unpoisoned();
        if inner.round.state != ReconfirmState::Initial {
            tracing::info!(
                "Reconfirm reset: stream {} leaving {} at round {:?}",
                self.stream_id,
                inner.round.state,
                inner.round.proposal_id
            );
        }
        inner.round = RoundState::default();
        inner.slide_wait_log.reset();
    }

    /// Abandon the round and release collaborator bindings. Idempotent.
    pub fn destroy(&self) {
        let mut inner = self.lock_unpoisoned();
        if inner.collaborators.take().is_some() {
            tracing::info!("LogReconfirm destroyed: stream {}", self.stream_id);
        }
        inner.round = RoundState::default();
        inner.promise_floor = None;
        inner.slide_wait_log.reset();
    }

    /// Advance the state machine as far as collaborators allow.
    ///
    /// Fatal errors (see [`Error::is_fatal`]) mean the owner must step
    /// down; the coordinator keeps its state until reset.
    pub fn step(&self) -> Result<StepOutcome> {
        let mut guard = self.inner.lock()?;
        let inner = &mut *guard;
        let collaborators = inner.collaborators.as_ref().ok_or(Error::NotInitialized)?;

        let mut driver = Driver {
            stream_id: self.stream_id,
            self_addr: &self.self_addr,
            config: &self.config,
            collaborators,
            promise_floor: &mut inner.promise_floor,
            slide_wait_log: &mut inner.slide_wait_log,
        };

        match driver.run(&mut inner.round) {
            Ok(StepOutcome::Converged) => Ok(StepOutcome::Converged),
            Ok(StepOutcome::RetryLater) => {
                if inner.waiting_log.reached() {
                    tracing::info!(
                        "Reconfirm waiting retry: stream {} in {}",
                        self.stream_id,
                        inner.round.state
                    );
                }
                Ok(StepOutcome::RetryLater)
            }
            Err(e) => {
                if e.is_fatal() {
                    tracing::error!(
                        "Reconfirm failed: stream {} in {}: {}",
                        self.stream_id,
                        inner.round.state,
                        e
                    );
                } else {
                    tracing::warn!(
                        "Reconfirm step error: stream {} in {}: {}",
                        self.stream_id,
                        inner.round.state,
                        e
                    );
                }
                Err(e)
            }
        }
    }

    /// Fold a follower's prepare ack into the current round.
    ///
    /// Acks for another round, or arriving outside ack collection, are
    /// rejected with [`Error::StateMismatch`] and change nothing.
    pub fn handle_prepare_ack(
        &self,
        sender: &ReplicaAddress,
        round_proposal_id: ProposalId,
        accept_proposal_id: ProposalId,
        last_lsn: Lsn,
    ) -> Result<AckOutcome> {
        let mut inner = self.inner.lock()?;
        if inner.collaborators.is_none() {
            return Err(Error::NotInitialized);
        }
        let result = prepare::apply_ack(
            &mut inner.round,
            sender,
            round_proposal_id,
            accept_proposal_id,
            last_lsn,
        );
        match &result {
            Ok(_) => tracing::debug!(
                "Prepare ack handled: stream {} from {}, votes {}/{}",
                self.stream_id,
                sender,
                inner.round.votes(),
                inner.round.majority
            ),
            Err(e) => tracing::warn!(
                "Prepare ack dropped: stream {} from {}: {}",
                self.stream_id,
                sender,
                e
            ),
        }
        result
    }

    /// Same as [`handle_prepare_ack`](Self::handle_prepare_ack), taking the
    /// wire envelope.
    pub fn handle_prepare_response(&self, response: &PrepareResponse) -> Result<AckOutcome> {
        if response.stream_id != self.stream_id {
            return Err(Error::InvalidArgument(format!(
                "prepare ack for stream {} delivered to stream {}",
                response.stream_id, self.stream_id
            )));
        }
        self.handle_prepare_ack(
            &response.from,
            response.round,
            response.accept_proposal_id,
            response.last_lsn,
        )
    }
}

/// Borrowed view used for the duration of one `step()`.
struct Driver<'a> {
    stream_id: u64,
    self_addr: &'a ReplicaAddress,
    config: &'a ReconfirmConfig,
    collaborators: &'a Collaborators,
    promise_floor: &'a mut Option<ProposalId>,
    slide_wait_log: &'a mut TimeInterval,
}

impl Driver<'_> {
    fn run(&mut self, round: &mut RoundState) -> Result<StepOutcome> {
        for _ in 0..self.config.max_transitions_per_step {
            if round.state.is_terminal() {
                return Ok(StepOutcome::Converged);
            }

            let from = round.state;
            match self.on_state(round, Instant::now())? {
                Transition::Wait => return Ok(StepOutcome::RetryLater),
                Transition::Advance { next, fall_through } => {
                    round.state = next;
                    tracing::info!(
                        stream_id = self.stream_id,
                        node = %self.self_addr,
                        proposal_id = ?round.proposal_id,
                        "Reconfirm {} -> {}",
                        from,
                        next
                    );
                    if next.is_terminal() {
                        return Ok(StepOutcome::Converged);
                    }
                    if !fall_through {
                        return Ok(StepOutcome::RetryLater);
                    }
                }
            }
        }

        tracing::warn!(
            "Reconfirm hit {} transitions in one step at {}, yielding",
            self.config.max_transitions_per_step,
            round.state
        );
        Ok(StepOutcome::RetryLater)
    }

    fn on_state(&mut self, round: &mut RoundState, now: Instant) -> Result<Transition> {
        match round.state {
            ReconfirmState::Initial => self.on_initial(round),
            ReconfirmState::AwaitingLocalFlush => self.on_awaiting_local_flush(round, now),
            ReconfirmState::CollectingPrepareAcks => self.on_collecting_acks(round, now),
            ReconfirmState::ReconcileMode => self.on_reconcile_mode(),
            ReconfirmState::FetchMissingLog => self.on_fetch_missing_log(round, now),
            ReconfirmState::Reconciling => self.on_reconciling(round),
            ReconfirmState::AwaitingStartWorkingMajority => self.on_start_working(round),
            ReconfirmState::Finished => Ok(Transition::Wait),
        }
    }

    fn on_initial(&mut self, round: &mut RoundState) -> Result<Transition> {
        let membership = &self.collaborators.membership;
        let members = membership
            .current_members()
            .map_err(|e| Error::MembershipUnavailable(e.to_string()))?;
        if !members.contains(self.self_addr) {
            return Err(Error::SelfNotMember {
                node: self.self_addr.clone(),
                members,
            });
        }
        let replica_count = membership
            .replica_count()
            .map_err(|e| Error::MembershipUnavailable(e.to_string()))?;
        if replica_count == 0 {
            return Err(Error::MembershipUnavailable("replica count is zero".into()));
        }

        round.followers = members
            .into_iter()
            .filter(|m| m != self.self_addr)
            .collect();
        round.majority = majority_count(replica_count);
        tracing::info!(
            "Reconfirm init: stream {}, replicas {}, majority {}, followers {:?}",
            self.stream_id,
            replica_count,
            round.majority,
            round.followers
        );
        Ok(Transition::stop_at(ReconfirmState::AwaitingLocalFlush))
    }

    fn on_awaiting_local_flush(&mut self, round: &mut RoundState, now: Instant) -> Result<Transition> {
        if !self.collaborators.log.all_flushed() {
            tracing::debug!("Some logs are still flushing, need retry: stream {}", self.stream_id);
            return Ok(Transition::Wait);
        }
        self.submit_prepare(round, now)?;
        Ok(Transition::stop_at(ReconfirmState::CollectingPrepareAcks))
    }

    fn on_collecting_acks(&mut self, round: &mut RoundState, now: Instant) -> Result<Transition> {
        if round.has_majority() {
            return Ok(Transition::to(ReconfirmState::ReconcileMode));
        }

        let waited = round
            .last_prepare_at
            .map_or(Duration::MAX, |at| now.saturating_duration_since(at));
        if waited >= self.config.prepare_retry_interval() {
            tracing::warn!(
                "Prepare acks not majority within {:?} (votes {}/{}), submitting prepare again",
                waited,
                round.votes(),
                round.majority
            );
            self.submit_prepare(round, now)?;
        }
        Ok(Transition::Wait)
    }

    fn on_reconcile_mode(&mut self) -> Result<Transition> {
        match self.collaborators.mode.reconcile()? {
            Progress::Done => Ok(Transition::to(ReconfirmState::FetchMissingLog)),
            Progress::Pending => Ok(Transition::Wait),
        }
    }

    fn on_fetch_missing_log(&mut self, round: &mut RoundState, now: Instant) -> Result<Transition> {
        let Some(candidate) = round.candidate.clone() else {
            return Err(Error::Internal("candidate tail missing after prepare".into()));
        };
        let log = &self.collaborators.log;
        let flushed_end = log.max_flushed_end();

        // A local tail past the candidate holds unconfirmed entries of an
        // older round; the holder's answer truncates it.
        if candidate.holder == *self.self_addr || flushed_end == candidate.lsn {
            return Ok(Transition::to(ReconfirmState::Reconciling));
        }

        let start_marker = log.buffer_start_marker();
        if !round
            .fetch
            .should_fetch(start_marker, now, self.config.fetch_interval())
        {
            tracing::debug!(
                "No need to fetch log in current round: holder {}, target {}, start marker {}",
                candidate.holder,
                candidate.lsn,
                start_marker
            );
            return Ok(Transition::Wait);
        }

        match log.request_fetch(&candidate.holder, candidate.lsn) {
            Ok(sent) => {
                round.fetch.record(sent, start_marker, now);
                if sent {
                    tracing::info!(
                        "Fetch log sent: stream {} from {} up to {} (local end {})",
                        self.stream_id,
                        candidate.holder,
                        candidate.lsn,
                        flushed_end
                    );
                }
            }
            Err(e) => {
                round.fetch.record(false, start_marker, now);
                tracing::warn!(
                    "Fetch log from {} failed: stream {}: {}",
                    candidate.holder,
                    self.stream_id,
                    e
                );
            }
        }
        Ok(Transition::Wait)
    }

    fn on_reconciling(&mut self, round: &mut RoundState) -> Result<Transition> {
        let log = &self.collaborators.log;
        if !log.all_flushed() {
            tracing::warn!("Logs still flushing before start working, need wait: stream {}", self.stream_id);
            return Ok(Transition::Wait);
        }
        let flushed = log.max_flushed_info()?;
        let proposal_id = current_proposal(round)?;

        match self
            .collaborators
            .start_working
            .append_start_working_marker(proposal_id)?
        {
            Progress::Pending => Ok(Transition::Wait),
            Progress::Done => {
                round.saved_end_lsn = Some(flushed.end_lsn);
                tracing::info!(
                    "Start working submitted: stream {} at {} with {}",
                    self.stream_id,
                    flushed.end_lsn,
                    proposal_id
                );
                Ok(Transition::to(ReconfirmState::AwaitingStartWorkingMajority))
            }
        }
    }

    fn on_start_working(&mut self, round: &mut RoundState) -> Result<Transition> {
        let proposal_id = current_proposal(round)?;
        let saved = round
            .saved_end_lsn
            .ok_or_else(|| Error::Internal("start-working position was not saved".into()))?;

        // Resends reuse the saved id and position, never the current tail.
        if !self
            .collaborators
            .start_working
            .append_start_working_marker(proposal_id)?
            .is_done()
        {
            tracing::debug!("Waiting for start working majority: stream {}", self.stream_id);
            return Ok(Transition::Wait);
        }

        let log = &self.collaborators.log;
        let observed = log.max_position();
        if observed != saved {
            return Err(Error::PositionMismatch { saved, observed });
        }

        if !log.advance_committed_watermark(saved)?.is_done() {
            return Ok(Transition::Wait);
        }

        let delivery = log.all_committed_delivered();
        if !delivery.all_delivered {
            if self.slide_wait_log.reached() {
                tracing::info!(
                    "Some logs have not slided out, need wait: stream {}, last slide {} (id {}), committed end {}",
                    self.stream_id,
                    delivery.last_delivered_lsn,
                    delivery.last_delivered_id,
                    delivery.committed_end_lsn
                );
            }
            return Ok(Transition::Wait);
        }

        Ok(Transition::to(ReconfirmState::Finished))
    }

    fn submit_prepare(&mut self, round: &mut RoundState, now: Instant) -> Result<ProposalId> {
        let ctx = PrepareContext {
            stream_id: self.stream_id,
            self_addr: self.self_addr,
            collaborators: self.collaborators,
            promise_floor: *self.promise_floor,
        };
        let result = prepare::submit_prepare(round, &ctx, now);
        // The id counts as promised once chosen, even if the send failed.
        if let Some(id) = round.proposal_id {
            *self.promise_floor = Some(self.promise_floor.map_or(id, |f| f.max(id)));
        }
        result
    }
}

fn current_proposal(round: &RoundState) -> Result<ProposalId> {
    round
        .proposal_id
        .ok_or_else(|| Error::Internal(format!("no proposal id in state {}", round.state)))
}
