//! Prepare-phase envelopes exchanged between a reconfirming leader and its followers

use crate::common::types::{Lsn, ProposalId, ReplicaAddress};
use crate::common::Result;
use serde::{Deserialize, Serialize};

/// Phase-1 request broadcast by the reconfirming leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub stream_id: u64,
    pub from: ReplicaAddress,
    pub proposal_id: ProposalId,
}

/// A follower's answer: its promise for `round` plus its log tail evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub stream_id: u64,
    pub from: ReplicaAddress,
    /// Round this response answers (the leader's prepare id)
    pub round: ProposalId,
    /// Highest proposal id the follower has accepted
    pub accept_proposal_id: ProposalId,
    /// End of the follower's flushed log
    pub last_lsn: Lsn,
}

/// Frames carried by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Prepare(PrepareRequest),
    PrepareAck(PrepareResponse),
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_ack_frame_survives_encoding() {
        let frame = Frame::PrepareAck(PrepareResponse {
            stream_id: 1001,
            from: "10.0.0.2:2882".into(),
            round: ProposalId(5),
            accept_proposal_id: ProposalId(4),
            last_lsn: Lsn(4096),
        });
        let bytes = frame.encode().unwrap();
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_decode_garbage_is_codec_error() {
        let err = Frame::decode(&[0xff, 0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert!(matches!(err, crate::Error::Codec(_)));
    }
}
