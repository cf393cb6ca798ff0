use std::path::Path;

use rand::rngs::OsRng;

use noirbft_core_types::{NodeId, PrivateKey};

use crate::Error;

/// The node's long-term transport identity key, persisted as 32 raw bytes.
pub struct NodeKey {
    pub private_key: PrivateKey,
}

impl NodeKey {
    /// Loads the key at `path`, generating and persisting one if absent.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if path.exists() {
            let bytes = std::fs::read(path)?;
            let bytes: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::Config(format!("corrupt node key at {}", path.display())))?;
            return Ok(Self {
                private_key: PrivateKey::from_bytes(bytes),
            });
        }

        let private_key = PrivateKey::generate(OsRng);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, private_key.to_bytes())?;
        Ok(Self { private_key })
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.private_key.public_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node_key");

        let first = NodeKey::load_or_generate(&path).unwrap();
        let second = NodeKey::load_or_generate(&path).unwrap();
        assert_eq!(first.node_id(), second.node_id());
    }

    #[test]
    fn corrupt_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node_key");
        std::fs::write(&path, b"short").unwrap();
        assert!(NodeKey::load_or_generate(&path).is_err());
    }
}
