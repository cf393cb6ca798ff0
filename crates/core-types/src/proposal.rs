use core::fmt;

use prost::Message;

use noirbft_proto as proto;
use noirbft_proto::types::SignedMsgType;
use noirbft_proto::Protobuf;

use crate::{BlockId, ChainId, Height, Round, Signature, Timestamp};

/// A proposer's signed offer of a block for one `(height, round)`.
///
/// `pol_round` carries the round of the proof-of-lock when the proposer is
/// re-proposing a block it is locked on, and `Round::NIL` otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal {
    pub height: Height,
    pub round: Round,
    pub pol_round: Round,
    pub block_id: BlockId,
    pub timestamp: Timestamp,
    pub signature: Option<Signature>,
}

impl Proposal {
    pub fn new(
        height: Height,
        round: Round,
        pol_round: Round,
        block_id: BlockId,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            height,
            round,
            pol_round,
            block_id,
            timestamp,
            signature: None,
        }
    }

    pub fn sign_bytes(&self, chain_id: &ChainId) -> Vec<u8> {
        let canonical = proto::canonical::CanonicalProposal {
            r#type: SignedMsgType::Proposal as i32,
            height: self.height.as_i64(),
            round: self.round.as_i32() as i64,
            pol_round: self.pol_round.as_i32() as i64,
            block_id: Some(self.block_id.to_canonical()),
            timestamp: self.timestamp.as_nanos(),
            chain_id: chain_id.clone(),
        };
        canonical.encode_length_delimited_to_vec()
    }
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "proposal {}/{} (pol {}) for {}",
            self.height, self.round, self.pol_round, self.block_id
        )
    }
}

impl Protobuf for Proposal {
    type Proto = proto::types::Proposal;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        let signature = if value.signature.is_empty() {
            None
        } else {
            Some(
                Signature::try_from(value.signature.as_slice())
                    .map_err(|e| proto::Error::invalid_field("signature", e))?,
            )
        };

        Ok(Self {
            height: Height::try_from(value.height)
                .map_err(|e| proto::Error::invalid_field("height", e))?,
            round: Round::new(value.round),
            pol_round: Round::new(value.pol_round),
            block_id: value
                .block_id
                .map(crate::BlockId::from_proto)
                .transpose()?
                .unwrap_or_default(),
            timestamp: Timestamp::from_nanos(value.timestamp),
            signature,
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::types::Proposal {
            r#type: SignedMsgType::Proposal as i32,
            height: self.height.as_i64(),
            round: self.round.as_i32(),
            pol_round: self.pol_round.as_i32(),
            block_id: Some(self.block_id.to_proto()?),
            timestamp: self.timestamp.as_nanos(),
            signature: self
                .signature
                .map(|s| s.as_slice().to_vec())
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PartSetHeader, PrivateKey};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn signature_covers_pol_round() {
        let key = PrivateKey::generate(StdRng::seed_from_u64(11));
        let chain_id = "test-chain".to_string();

        let mut proposal = Proposal::new(
            Height::new(3),
            Round::new(2),
            Round::NIL,
            BlockId::new(vec![5; 32], PartSetHeader::new(1, vec![6; 32])),
            Timestamp::from_nanos(99),
        );
        proposal.signature = Some(key.sign(&proposal.sign_bytes(&chain_id)));

        let sig = proposal.signature.unwrap();
        key.public_key()
            .verify(&proposal.sign_bytes(&chain_id), &sig)
            .unwrap();

        proposal.pol_round = Round::new(1);
        assert!(key
            .public_key()
            .verify(&proposal.sign_bytes(&chain_id), &sig)
            .is_err());
    }
}
