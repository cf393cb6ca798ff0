use noirbft_core_types::NodeId;
use noirbft_proto as proto;
use noirbft_proto::Protobuf;

use crate::{ChannelId, Error};

/// Exchanged right after the secret handshake; a peer goes `Ready` only if
/// this checks out against ours.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub p2p_version: u64,
    pub block_version: u64,
    pub app_version: u64,
    pub node_id: NodeId,
    pub listen_addr: String,
    pub network: String,
    pub version: String,
    pub channels: Vec<ChannelId>,
    pub moniker: String,
}

impl NodeInfo {
    /// Checks that `other` can usefully talk to us.
    pub fn compatible_with(&self, other: &NodeInfo) -> Result<(), Error> {
        if self.block_version != other.block_version {
            return Err(Error::IncompatiblePeer(format!(
                "block version mismatch: ours {}, theirs {}",
                self.block_version, other.block_version
            )));
        }
        if self.network != other.network {
            return Err(Error::IncompatiblePeer(format!(
                "network mismatch: ours {}, theirs {}",
                self.network, other.network
            )));
        }
        if self.node_id == other.node_id {
            return Err(Error::IncompatiblePeer("self connection".to_string()));
        }
        if !self
            .channels
            .iter()
            .any(|channel| other.channels.contains(channel))
        {
            return Err(Error::IncompatiblePeer("no common channels".to_string()));
        }
        Ok(())
    }
}

impl Protobuf for NodeInfo {
    type Proto = proto::p2p::NodeInfo;

    fn from_proto(value: Self::Proto) -> Result<Self, proto::Error> {
        let protocol = value.protocol_version.unwrap_or_default();
        Ok(Self {
            p2p_version: protocol.p2p,
            block_version: protocol.block,
            app_version: protocol.app,
            node_id: value
                .node_id
                .parse()
                .map_err(|e| proto::Error::invalid_field("node_id", e))?,
            listen_addr: value.listen_addr,
            network: value.network,
            version: value.version,
            channels: value.channels.into_iter().map(ChannelId).collect(),
            moniker: value.moniker,
        })
    }

    fn to_proto(&self) -> Result<Self::Proto, proto::Error> {
        Ok(proto::p2p::NodeInfo {
            protocol_version: Some(proto::p2p::ProtocolVersion {
                p2p: self.p2p_version,
                block: self.block_version,
                app: self.app_version,
            }),
            node_id: self.node_id.to_string(),
            listen_addr: self.listen_addr.clone(),
            network: self.network.clone(),
            version: self.version.clone(),
            channels: self.channels.iter().map(|c| c.0).collect(),
            moniker: self.moniker.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels;
    use noirbft_core_types::PrivateKey;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn info(seed: u64, network: &str) -> NodeInfo {
        let key = PrivateKey::generate(StdRng::seed_from_u64(seed));
        NodeInfo {
            p2p_version: 8,
            block_version: 11,
            app_version: 1,
            node_id: NodeId::from_public_key(&key.public_key()),
            listen_addr: "127.0.0.1:26656".to_string(),
            network: network.to_string(),
            version: "0.1.0".to_string(),
            channels: vec![channels::CONSENSUS_STATE, channels::CONSENSUS_VOTE],
            moniker: format!("node-{seed}"),
        }
    }

    #[test]
    fn compatible_peers_accepted() {
        let a = info(1, "noir-test");
        let b = info(2, "noir-test");
        a.compatible_with(&b).unwrap();
    }

    #[test]
    fn network_mismatch_rejected() {
        let a = info(1, "noir-test");
        let b = info(2, "other-net");
        assert!(a.compatible_with(&b).is_err());
    }

    #[test]
    fn self_connection_rejected() {
        let a = info(1, "noir-test");
        assert!(a.compatible_with(&a).is_err());
    }

    #[test]
    fn proto_round_trip() {
        let a = info(3, "noir-test");
        let decoded = NodeInfo::from_proto(a.to_proto().unwrap()).unwrap();
        assert_eq!(a, decoded);
    }
}
