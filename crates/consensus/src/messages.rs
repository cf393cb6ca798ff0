use std::time::Duration;

use noirbft_core_types::{
    BitArray, BlockId, Height, NodeId, Part, PartSetHeader, Proposal, Round, Vote, VoteType,
};
use noirbft_proto as proto;
use noirbft_proto::Protobuf;

use crate::round_state::RoundStepType;

/// Everything a consensus reactor can say to another node.
#[derive(Clone, Debug)]
pub enum ConsensusMessage {
    NewRoundStep {
        height: Height,
        round: Round,
        step: RoundStepType,
        seconds_since_start_time: i64,
        last_commit_round: Round,
    },
    NewValidBlock {
        height: Height,
        round: Round,
        block_part_set_header: PartSetHeader,
        block_parts: BitArray,
        is_commit: bool,
    },
    Proposal(Proposal),
    ProposalPol {
        height: Height,
        proposal_pol_round: Round,
        proposal_pol: BitArray,
    },
    BlockPart {
        height: Height,
        round: Round,
        part: Part,
    },
    Vote(Vote),
    HasVote {
        height: Height,
        round: Round,
        vote_type: VoteType,
        index: i32,
    },
    HasProposalBlockPart {
        height: Height,
        round: Round,
        index: i32,
    },
    VoteSetMaj23 {
        height: Height,
        round: Round,
        vote_type: VoteType,
        block_id: BlockId,
    },
    VoteSetBits {
        height: Height,
        round: Round,
        vote_type: VoteType,
        block_id: BlockId,
        votes: BitArray,
    },
}

/// One state-machine input, tagged with the peer it came from. `None`
/// marks messages we generated ourselves.
#[derive(Clone, Debug)]
pub struct MsgInfo {
    pub msg: ConsensusMessage,
    pub peer_id: Option<NodeId>,
}

/// A timeout fired by the ticker for a specific `(height, round, step)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: Height,
    pub round: Round,
    pub step: RoundStepType,
}

/// Broadcasts the state machine asks the reactor to fan out to all peers.
#[derive(Clone, Debug)]
pub enum StateEvent {
    NewRoundStep(ConsensusMessage),
    NewValidBlock(ConsensusMessage),
    HasVote(ConsensusMessage),
}

impl Protobuf for ConsensusMessage {
    type Proto = proto::consensus::Message;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        use proto::consensus::message::Sum;

        let height = |h: i64| {
            Height::try_from(h).map_err(|e| proto::Error::invalid_field("height", e))
        };

        match value.sum.ok_or_else(|| proto::Error::missing_field("sum"))? {
            Sum::NewRoundStep(msg) => Ok(Self::NewRoundStep {
                height: height(msg.height)?,
                round: Round::new(msg.round),
                step: RoundStepType::from_u32(msg.step)
                    .ok_or_else(|| proto::Error::invalid_field("step", msg.step))?,
                seconds_since_start_time: msg.seconds_since_start_time,
                last_commit_round: Round::new(msg.last_commit_round),
            }),
            Sum::NewValidBlock(msg) => Ok(Self::NewValidBlock {
                height: height(msg.height)?,
                round: Round::new(msg.round),
                block_part_set_header: msg
                    .block_part_set_header
                    .map(PartSetHeader::from_proto)
                    .transpose()?
                    .unwrap_or_default(),
                block_parts: msg
                    .block_parts
                    .map(BitArray::from_proto)
                    .transpose()?
                    .unwrap_or_else(|| BitArray::new(0)),
                is_commit: msg.is_commit,
            }),
            Sum::Proposal(msg) => Ok(Self::Proposal(
                msg.proposal
                    .map(Proposal::from_proto)
                    .transpose()?
                    .ok_or_else(|| proto::Error::missing_field("proposal"))?,
            )),
            Sum::ProposalPol(msg) => Ok(Self::ProposalPol {
                height: height(msg.height)?,
                proposal_pol_round: Round::new(msg.proposal_pol_round),
                proposal_pol: msg
                    .proposal_pol
                    .map(BitArray::from_proto)
                    .transpose()?
                    .unwrap_or_else(|| BitArray::new(0)),
            }),
            Sum::BlockPart(msg) => Ok(Self::BlockPart {
                height: height(msg.height)?,
                round: Round::new(msg.round),
                part: msg
                    .part
                    .map(Part::from_proto)
                    .transpose()?
                    .ok_or_else(|| proto::Error::missing_field("part"))?,
            }),
            Sum::Vote(msg) => Ok(Self::Vote(
                msg.vote
                    .map(Vote::from_proto)
                    .transpose()?
                    .ok_or_else(|| proto::Error::missing_field("vote"))?,
            )),
            Sum::HasVote(msg) => Ok(Self::HasVote {
                height: height(msg.height)?,
                round: Round::new(msg.round),
                vote_type: VoteType::from_signed_msg_type(msg.r#type)?,
                index: msg.index,
            }),
            Sum::HasProposalBlockPart(msg) => Ok(Self::HasProposalBlockPart {
                height: height(msg.height)?,
                round: Round::new(msg.round),
                index: msg.index,
            }),
            Sum::VoteSetMaj23(msg) => Ok(Self::VoteSetMaj23 {
                height: height(msg.height)?,
                round: Round::new(msg.round),
                vote_type: VoteType::from_signed_msg_type(msg.r#type)?,
                block_id: msg
                    .block_id
                    .map(BlockId::from_proto)
                    .transpose()?
                    .unwrap_or_default(),
            }),
            Sum::VoteSetBits(msg) => Ok(Self::VoteSetBits {
                height: height(msg.height)?,
                round: Round::new(msg.round),
                vote_type: VoteType::from_signed_msg_type(msg.r#type)?,
                block_id: msg
                    .block_id
                    .map(BlockId::from_proto)
                    .transpose()?
                    .unwrap_or_default(),
                votes: msg
                    .votes
                    .map(BitArray::from_proto)
                    .transpose()?
                    .unwrap_or_else(|| BitArray::new(0)),
            }),
        }
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        use proto::consensus::message::Sum;

        let sum = match self {
            Self::NewRoundStep {
                height,
                round,
                step,
                seconds_since_start_time,
                last_commit_round,
            } => Sum::NewRoundStep(proto::consensus::NewRoundStep {
                height: height.as_i64(),
                round: round.as_i32(),
                step: step.as_u32(),
                seconds_since_start_time: *seconds_since_start_time,
                last_commit_round: last_commit_round.as_i32(),
            }),
            Self::NewValidBlock {
                height,
                round,
                block_part_set_header,
                block_parts,
                is_commit,
            } => Sum::NewValidBlock(proto::consensus::NewValidBlock {
                height: height.as_i64(),
                round: round.as_i32(),
                block_part_set_header: Some(block_part_set_header.to_proto()?),
                block_parts: Some(block_parts.to_proto()?),
                is_commit: *is_commit,
            }),
            Self::Proposal(proposal) => Sum::Proposal(proto::consensus::ProposalMessage {
                proposal: Some(proposal.to_proto()?),
            }),
            Self::ProposalPol {
                height,
                proposal_pol_round,
                proposal_pol,
            } => Sum::ProposalPol(proto::consensus::ProposalPol {
                height: height.as_i64(),
                proposal_pol_round: proposal_pol_round.as_i32(),
                proposal_pol: Some(proposal_pol.to_proto()?),
            }),
            Self::BlockPart {
                height,
                round,
                part,
            } => Sum::BlockPart(proto::consensus::BlockPartMessage {
                height: height.as_i64(),
                round: round.as_i32(),
                part: Some(part.to_proto()?),
            }),
            Self::Vote(vote) => Sum::Vote(proto::consensus::VoteMessage {
                vote: Some(vote.to_proto()?),
            }),
            Self::HasVote {
                height,
                round,
                vote_type,
                index,
            } => Sum::HasVote(proto::consensus::HasVote {
                height: height.as_i64(),
                round: round.as_i32(),
                r#type: vote_type.to_signed_msg_type() as i32,
                index: *index,
            }),
            Self::HasProposalBlockPart {
                height,
                round,
                index,
            } => Sum::HasProposalBlockPart(proto::consensus::HasProposalBlockPart {
                height: height.as_i64(),
                round: round.as_i32(),
                index: *index,
            }),
            Self::VoteSetMaj23 {
                height,
                round,
                vote_type,
                block_id,
            } => Sum::VoteSetMaj23(proto::consensus::VoteSetMaj23 {
                height: height.as_i64(),
                round: round.as_i32(),
                r#type: vote_type.to_signed_msg_type() as i32,
                block_id: Some(block_id.to_proto()?),
            }),
            Self::VoteSetBits {
                height,
                round,
                vote_type,
                block_id,
                votes,
            } => Sum::VoteSetBits(proto::consensus::VoteSetBits {
                height: height.as_i64(),
                round: round.as_i32(),
                r#type: vote_type.to_signed_msg_type() as i32,
                block_id: Some(block_id.to_proto()?),
                votes: Some(votes.to_proto()?),
            }),
        };
        Ok(proto::consensus::Message { sum: Some(sum) })
    }
}

impl MsgInfo {
    pub fn to_wal_proto(&self) -> Result<proto::wal::MsgInfo, proto::Error> {
        Ok(proto::wal::MsgInfo {
            msg: Some(self.msg.to_proto()?),
            peer_id: self
                .peer_id
                .as_ref()
                .map(|id| id.to_string())
                .unwrap_or_default(),
        })
    }

    pub fn from_wal_proto(value: proto::wal::MsgInfo) -> Result<Self, proto::Error> {
        let peer_id = if value.peer_id.is_empty() {
            None
        } else {
            Some(
                value
                    .peer_id
                    .parse()
                    .map_err(|e| proto::Error::invalid_field("peer_id", e))?,
            )
        };
        Ok(Self {
            msg: ConsensusMessage::from_proto(
                value.msg.ok_or_else(|| proto::Error::missing_field("msg"))?,
            )?,
            peer_id,
        })
    }
}

impl TimeoutInfo {
    pub fn to_wal_proto(&self) -> proto::wal::TimeoutInfo {
        proto::wal::TimeoutInfo {
            duration: self.duration.as_nanos() as i64,
            height: self.height.as_i64(),
            round: self.round.as_i32(),
            step: self.step.as_u32(),
        }
    }

    pub fn from_wal_proto(value: proto::wal::TimeoutInfo) -> Result<Self, proto::Error> {
        Ok(Self {
            duration: Duration::from_nanos(value.duration.max(0) as u64),
            height: Height::try_from(value.height)
                .map_err(|e| proto::Error::invalid_field("height", e))?,
            round: Round::new(value.round),
            step: RoundStepType::from_u32(value.step)
                .ok_or_else(|| proto::Error::invalid_field("step", value.step))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_proto_round_trip() {
        let msg = ConsensusMessage::HasVote {
            height: Height::new(7),
            round: Round::new(2),
            vote_type: VoteType::Precommit,
            index: 3,
        };
        let decoded = ConsensusMessage::from_proto(msg.to_proto().unwrap()).unwrap();
        match decoded {
            ConsensusMessage::HasVote {
                height,
                round,
                vote_type,
                index,
            } => {
                assert_eq!(height, Height::new(7));
                assert_eq!(round, Round::new(2));
                assert_eq!(vote_type, VoteType::Precommit);
                assert_eq!(index, 3);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn timeout_info_round_trip() {
        let info = TimeoutInfo {
            duration: Duration::from_millis(1500),
            height: Height::new(4),
            round: Round::new(1),
            step: RoundStepType::PrevoteWait,
        };
        let decoded = TimeoutInfo::from_wal_proto(info.to_wal_proto()).unwrap();
        assert_eq!(info, decoded);
    }
}
