use core::fmt;

use ed25519_consensus::{SigningKey, VerificationKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Error;

/// First 20 bytes of the SHA-256 of the Ed25519 public key.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address([u8; Self::LENGTH]);

impl Address {
    pub const LENGTH: usize = 20;

    pub const fn new(bytes: [u8; Self::LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let digest = Sha256::digest(public_key.as_bytes());
        let mut bytes = [0; Self::LENGTH];
        bytes.copy_from_slice(&digest[..Self::LENGTH]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0; Self::LENGTH]
    }
}

impl TryFrom<&[u8]> for Address {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; Self::LENGTH] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey(format!("invalid address length: {}", bytes.len())))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", hex::encode(self.0))
    }
}

/// Ed25519 verification key.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PublicKey(VerificationKey);

impl PublicKey {
    pub fn as_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(self)
    }

    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), Error> {
        let sig = ed25519_consensus::Signature::from(signature.to_bytes());
        self.0.verify(&sig, msg).map_err(|_| Error::InvalidSignature)
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        VerificationKey::try_from(bytes)
            .map(Self)
            .map_err(|e| Error::InvalidKey(e.to_string()))
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.as_bytes().cmp(&other.as_bytes())
    }
}

/// Ed25519 signing key.
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    pub fn generate<R: rand::RngCore + rand::CryptoRng>(rng: R) -> Self {
        Self(SigningKey::new(rng))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(SigningKey::from(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verification_key())
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.0.sign(msg).to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// Detached Ed25519 signature.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Signature([u8; Self::LENGTH]);

impl Signature {
    pub const LENGTH: usize = 64;

    pub const fn to_bytes(self) -> [u8; Self::LENGTH] {
        self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Signature {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; Self::LENGTH] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey(format!("invalid signature length: {}", bytes.len())))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0[..8]))
    }
}

/// Holds the key this node signs votes and proposals with.
#[derive(Clone, Debug)]
pub struct PrivValidator {
    private_key: PrivateKey,
}

impl PrivValidator {
    pub fn new(private_key: PrivateKey) -> Self {
        Self { private_key }
    }

    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }

    pub fn address(&self) -> Address {
        self.public_key().address()
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.private_key.sign(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn sign_and_verify() {
        let key = PrivateKey::generate(StdRng::seed_from_u64(42));
        let sig = key.sign(b"payload");
        key.public_key().verify(b"payload", &sig).unwrap();
        assert!(key.public_key().verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn address_is_truncated_key_hash() {
        let key = PrivateKey::generate(StdRng::seed_from_u64(7));
        let address = key.public_key().address();
        assert_eq!(address.as_bytes().len(), Address::LENGTH);
        assert_eq!(format!("{address}").len(), Address::LENGTH * 2);
    }
}
