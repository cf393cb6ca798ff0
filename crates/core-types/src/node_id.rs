use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, PublicKey};

/// Identifies a peer on the network: lowercase hex of the first 20 bytes of
/// the SHA-256 of the peer's node key.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub const LENGTH: usize = 20;

    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let digest = Sha256::digest(public_key.as_bytes());
        Self(hex::encode(&digest[..Self::LENGTH]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes =
            hex::decode(s).map_err(|e| Error::InvalidKey(format!("invalid node id: {e}")))?;
        if bytes.len() != Self::LENGTH {
            return Err(Error::InvalidKey(format!(
                "invalid node id length: {}",
                bytes.len()
            )));
        }
        Ok(Self(s.to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PrivateKey;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn derived_from_node_key() {
        let key = PrivateKey::generate(StdRng::seed_from_u64(17));
        let id = NodeId::from_public_key(&key.public_key());
        assert_eq!(id.as_str().len(), NodeId::LENGTH * 2);
        assert_eq!(id.as_str().parse::<NodeId>().unwrap(), id);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!("abcd".parse::<NodeId>().is_err());
        assert!("zz".repeat(20).parse::<NodeId>().is_err());
    }
}
