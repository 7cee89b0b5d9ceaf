//! Simulated followers and the network task that carries prepares to them

use crate::common::{Frame, Lsn, PrepareRequest, PrepareResponse, ProposalId, ReplicaAddress};
use crate::reconfirm::LogReconfirm;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Acceptor side of the prepare phase for one follower.
#[derive(Debug, Clone)]
pub struct SimFollower {
    pub addr: ReplicaAddress,
    pub accept_proposal_id: ProposalId,
    pub last_lsn: Lsn,
    promised: Option<ProposalId>,
    /// Unreachable followers swallow prepares
    pub reachable: bool,
}

impl SimFollower {
    pub fn new(addr: impl Into<ReplicaAddress>, accept_proposal_id: ProposalId, last_lsn: Lsn) -> Self {
        Self {
            addr: addr.into(),
            accept_proposal_id,
            last_lsn,
            promised: None,
            reachable: true,
        }
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    pub fn promised(&self) -> Option<ProposalId> {
        self.promised
    }

    /// Promise a strictly newer proposal and report the local tail; older or
    /// repeated proposals get no answer.
    pub fn handle_prepare(&mut self, request: &PrepareRequest) -> Option<PrepareResponse> {
        if !self.reachable {
            return None;
        }
        if self.promised.is_some_and(|p| p >= request.proposal_id) {
            tracing::debug!(
                "{} ignores prepare {} (promised {:?})",
                self.addr,
                request.proposal_id,
                self.promised
            );
            return None;
        }
        self.promised = Some(request.proposal_id);
        Some(PrepareResponse {
            stream_id: request.stream_id,
            from: self.addr.clone(),
            round: request.proposal_id,
            accept_proposal_id: self.accept_proposal_id,
            last_lsn: self.last_lsn,
        })
    }
}

/// Deliver encoded prepares to followers and their acks back to `reconfirm`.
///
/// Each answer is delayed by a random jitter up to `max_jitter`. The task
/// ends when every transport sender is dropped.
pub fn spawn_network(
    reconfirm: Arc<LogReconfirm>,
    followers: Vec<SimFollower>,
    mut inbox: UnboundedReceiver<(ReplicaAddress, Vec<u8>)>,
    max_jitter: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut followers: HashMap<ReplicaAddress, SimFollower> = followers
            .into_iter()
            .map(|f| (f.addr.clone(), f))
            .collect();

        while let Some((to, bytes)) = inbox.recv().await {
            let request = match Frame::decode(&bytes) {
                Ok(Frame::Prepare(request)) => request,
                Ok(other) => {
                    tracing::warn!("Unexpected frame for {}: {:?}", to, other);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Undecodable frame for {}: {}", to, e);
                    continue;
                }
            };
            let Some(follower) = followers.get_mut(&to) else {
                tracing::warn!("No simulated follower at {}", to);
                continue;
            };
            let Some(response) = follower.handle_prepare(&request) else {
                continue;
            };

            let jitter_ms = max_jitter.as_millis() as u64;
            let delay = if jitter_ms == 0 {
                Duration::ZERO
            } else {
                Duration::from_millis(rand::random::<u64>() % (jitter_ms + 1))
            };
            let reconfirm = reconfirm.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let delivered = Frame::PrepareAck(response)
                    .encode()
                    .and_then(|bytes| Frame::decode(&bytes));
                match delivered {
                    Ok(Frame::PrepareAck(ack)) => {
                        if let Err(e) = reconfirm.handle_prepare_response(&ack) {
                            tracing::debug!("Ack from {} not applied: {}", ack.from, e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Ack encoding failed: {}", e),
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepare(pid: u64) -> PrepareRequest {
        PrepareRequest {
            stream_id: 1,
            from: "leader:1".into(),
            proposal_id: ProposalId(pid),
        }
    }

    #[test]
    fn test_follower_promises_only_newer_proposals() {
        let mut follower = SimFollower::new("f1:1", ProposalId(2), Lsn(80));
        let ack = follower.handle_prepare(&prepare(5)).unwrap();
        assert_eq!(ack.round, ProposalId(5));
        assert_eq!(ack.accept_proposal_id, ProposalId(2));
        assert_eq!(ack.last_lsn, Lsn(80));
        assert_eq!(follower.promised(), Some(ProposalId(5)));

        assert!(follower.handle_prepare(&prepare(5)).is_none());
        assert!(follower.handle_prepare(&prepare(4)).is_none());
        assert!(follower.handle_prepare(&prepare(6)).is_some());
    }

    #[test]
    fn test_unreachable_follower_is_silent() {
        let mut follower = SimFollower::new("f1:1", ProposalId(2), Lsn(80)).unreachable();
        assert!(follower.handle_prepare(&prepare(5)).is_none());
        assert_eq!(follower.promised(), None);
    }
}
