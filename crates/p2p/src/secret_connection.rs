//! Authenticated, encrypted byte transport.
//!
//! Both ends exchange ephemeral X25519 keys, derive per-direction
//! ChaCha20-Poly1305 keys via HKDF-SHA-256, bind a challenge to the
//! handshake transcript with a Merlin sponge, and prove ownership of their
//! long-term Ed25519 key by signing that challenge. Every subsequent frame
//! is sealed with a per-direction monotonically incrementing nonce.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use prost::Message;
use rand::rngs::OsRng;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use noirbft_core_types::{PrivateKey, PublicKey, Signature};
use noirbft_proto::p2p::AuthSigMessage;

use crate::Error;

/// Total sealed frame size on the wire.
const FRAME_SIZE: usize = 1024;
/// Payload bytes per frame: the first two bytes carry the data length.
pub const DATA_MAX_SIZE: usize = FRAME_SIZE - 2;
const TAG_SIZE: usize = 16;

const KDF_INFO: &[u8] = b"TENDERMINT_SECRET_CONNECTION_KEY_AND_CHALLENGE_GEN";
const TRANSCRIPT_LABEL: &[u8] = b"TENDERMINT_SECRET_CONNECTION_TRANSCRIPT_HASH";

struct Direction {
    cipher: ChaCha20Poly1305,
    nonce: u64,
}

impl Direction {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            nonce: 0,
        }
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&self.nonce.to_le_bytes());
        self.nonce = self.nonce.wrapping_add(1);
        *Nonce::from_slice(&bytes)
    }
}

/// One authenticated connection. Split into halves to run send and receive
/// loops concurrently.
pub struct SecretConnection<S> {
    io: S,
    send: Direction,
    recv: Direction,
    remote_pub_key: PublicKey,
}

impl<S> SecretConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs the handshake from either side; the protocol is symmetric.
    pub async fn handshake(mut io: S, local_key: &PrivateKey) -> Result<Self, Error> {
        // 1. Exchange ephemeral X25519 keys.
        let eph_secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
        let eph_pub = x25519_dalek::PublicKey::from(&eph_secret);

        io.write_all(eph_pub.as_bytes()).await?;
        io.flush().await?;

        let mut remote_eph = [0u8; 32];
        io.read_exact(&mut remote_eph).await?;
        let remote_eph_pub = x25519_dalek::PublicKey::from(remote_eph);

        // 2. Shared secret; abort on a low-order point.
        let dh_secret = eph_secret.diffie_hellman(&remote_eph_pub);
        if dh_secret.as_bytes() == &[0u8; 32] {
            return Err(Error::LowOrderKey);
        }

        // 3. The lexically lower ephemeral key decides key assignment.
        let local_is_low = eph_pub.as_bytes() < remote_eph_pub.as_bytes();
        let (low_eph, high_eph) = if local_is_low {
            (eph_pub.as_bytes(), remote_eph_pub.as_bytes())
        } else {
            (remote_eph_pub.as_bytes(), eph_pub.as_bytes())
        };

        // 4. Expand into per-direction secrets.
        let hkdf = Hkdf::<Sha256>::new(None, dh_secret.as_bytes());
        let mut key_material = [0u8; 96];
        hkdf.expand(KDF_INFO, &mut key_material)
            .map_err(|_| Error::Handshake("HKDF expansion failed".to_string()))?;

        let mut first = [0u8; 32];
        let mut second = [0u8; 32];
        first.copy_from_slice(&key_material[..32]);
        second.copy_from_slice(&key_material[32..64]);
        let (recv_secret, send_secret) = if local_is_low {
            (first, second)
        } else {
            (second, first)
        };

        // 5. Transcript-bound challenge.
        let mut transcript = merlin::Transcript::new(TRANSCRIPT_LABEL);
        transcript.append_message(b"EPHEMERAL_LOWER_PUBLIC_KEY", low_eph);
        transcript.append_message(b"EPHEMERAL_UPPER_PUBLIC_KEY", high_eph);
        transcript.append_message(b"DH_SECRET", dh_secret.as_bytes());
        let mut challenge = [0u8; 32];
        transcript.challenge_bytes(b"SECRET_CONNECTION_MAC", &mut challenge);

        let mut conn = Self {
            io,
            send: Direction::new(&send_secret),
            recv: Direction::new(&recv_secret),
            // Placeholder until the peer authenticates below.
            remote_pub_key: local_key.public_key(),
        };

        // 6. Exchange signed challenges over the now-encrypted stream.
        let auth_sig = AuthSigMessage {
            pub_key: local_key.public_key().as_bytes().to_vec(),
            sig: local_key.sign(&challenge).as_slice().to_vec(),
        };
        conn.write_chunk(&auth_sig.encode_to_vec()).await?;

        let remote_auth_bytes = conn.read_chunk().await?;
        let remote_auth = AuthSigMessage::decode(remote_auth_bytes.as_slice())?;

        let remote_pub_key = PublicKey::try_from(remote_auth.pub_key.as_slice())
            .map_err(|e| Error::Authentication(format!("bad public key: {e}")))?;
        let remote_sig = Signature::try_from(remote_auth.sig.as_slice())
            .map_err(|e| Error::Authentication(format!("bad signature: {e}")))?;
        remote_pub_key
            .verify(&challenge, &remote_sig)
            .map_err(|_| Error::Authentication("challenge signature invalid".to_string()))?;

        conn.remote_pub_key = remote_pub_key;
        Ok(conn)
    }

    /// The peer's authenticated long-term key.
    pub fn remote_pub_key(&self) -> PublicKey {
        self.remote_pub_key
    }

    /// Seals and sends `data` as one or more frames.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), Error> {
        let mut chunks = data.chunks(DATA_MAX_SIZE).peekable();
        if chunks.peek().is_none() {
            return Ok(());
        }
        for chunk in chunks {
            let mut frame = [0u8; FRAME_SIZE];
            frame[..2].copy_from_slice(&(chunk.len() as u16).to_le_bytes());
            frame[2..2 + chunk.len()].copy_from_slice(chunk);

            let nonce = self.send.next_nonce();
            let sealed = self
                .send
                .cipher
                .encrypt(&nonce, frame.as_slice())
                .map_err(|_| Error::Seal)?;
            self.io.write_all(&sealed).await?;
        }
        self.io.flush().await?;
        Ok(())
    }

    /// Receives and opens one frame, returning its payload.
    pub async fn read_chunk(&mut self) -> Result<Vec<u8>, Error> {
        let mut sealed = [0u8; FRAME_SIZE + TAG_SIZE];
        self.io.read_exact(&mut sealed).await?;

        let nonce = self.recv.next_nonce();
        let frame = self
            .recv
            .cipher
            .decrypt(&nonce, sealed.as_slice())
            .map_err(|_| Error::Open)?;

        let length = u16::from_le_bytes(frame[..2].try_into().expect("2 bytes")) as usize;
        if length > DATA_MAX_SIZE {
            return Err(Error::MalformedFrame(format!(
                "frame claims {length} payload bytes"
            )));
        }
        Ok(frame[2..2 + length].to_vec())
    }

    /// Splits into independently owned read and write halves.
    pub fn into_split(self) -> (SecretReadHalf<S>, SecretWriteHalf<S>) {
        let (read, write) = tokio::io::split(self.io);
        (
            SecretReadHalf {
                io: read,
                recv: self.recv,
            },
            SecretWriteHalf {
                io: write,
                send: self.send,
            },
        )
    }
}

pub struct SecretReadHalf<S> {
    io: ReadHalf<S>,
    recv: Direction,
}

impl<S: AsyncRead + AsyncWrite> SecretReadHalf<S> {
    pub async fn read_chunk(&mut self) -> Result<Vec<u8>, Error>
    where
        S: Unpin,
    {
        let mut sealed = [0u8; FRAME_SIZE + TAG_SIZE];
        self.io.read_exact(&mut sealed).await?;

        let nonce = self.recv.next_nonce();
        let frame = self
            .recv
            .cipher
            .decrypt(&nonce, sealed.as_slice())
            .map_err(|_| Error::Open)?;

        let length = u16::from_le_bytes(frame[..2].try_into().expect("2 bytes")) as usize;
        if length > DATA_MAX_SIZE {
            return Err(Error::MalformedFrame(format!(
                "frame claims {length} payload bytes"
            )));
        }
        Ok(frame[2..2 + length].to_vec())
    }
}

pub struct SecretWriteHalf<S> {
    io: WriteHalf<S>,
    send: Direction,
}

impl<S: AsyncRead + AsyncWrite> SecretWriteHalf<S> {
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), Error>
    where
        S: Unpin,
    {
        let mut chunks = data.chunks(DATA_MAX_SIZE).peekable();
        if chunks.peek().is_none() {
            return Ok(());
        }
        for chunk in chunks {
            let mut frame = [0u8; FRAME_SIZE];
            frame[..2].copy_from_slice(&(chunk.len() as u16).to_le_bytes());
            frame[2..2 + chunk.len()].copy_from_slice(chunk);

            let nonce = self.send.next_nonce();
            let sealed = self
                .send
                .cipher
                .encrypt(&nonce, frame.as_slice())
                .map_err(|_| Error::Seal)?;
            self.io.write_all(&sealed).await?;
        }
        self.io.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    async fn pair() -> (SecretConnection<tokio::io::DuplexStream>, SecretConnection<tokio::io::DuplexStream>, PublicKey, PublicKey)
    {
        let key_a = PrivateKey::generate(StdRng::seed_from_u64(1));
        let key_b = PrivateKey::generate(StdRng::seed_from_u64(2));
        let (io_a, io_b) = tokio::io::duplex(64 * 1024);

        let (conn_a, conn_b) = tokio::try_join!(
            SecretConnection::handshake(io_a, &key_a),
            SecretConnection::handshake(io_b, &key_b),
        )
        .unwrap();

        (conn_a, conn_b, key_a.public_key(), key_b.public_key())
    }

    #[tokio::test]
    async fn handshake_authenticates_both_sides() {
        let (conn_a, conn_b, pub_a, pub_b) = pair().await;
        assert_eq!(conn_a.remote_pub_key(), pub_b);
        assert_eq!(conn_b.remote_pub_key(), pub_a);
    }

    #[tokio::test]
    async fn frames_round_trip_both_directions() {
        let (mut conn_a, mut conn_b, _, _) = pair().await;

        conn_a.write_chunk(b"from a").await.unwrap();
        assert_eq!(conn_b.read_chunk().await.unwrap(), b"from a");

        conn_b.write_chunk(b"from b").await.unwrap();
        assert_eq!(conn_a.read_chunk().await.unwrap(), b"from b");
    }

    #[tokio::test]
    async fn large_payload_spans_frames() {
        let (mut conn_a, mut conn_b, _, _) = pair().await;
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        conn_a.write_chunk(&payload).await.unwrap();

        let mut received = Vec::new();
        while received.len() < payload.len() {
            received.extend(conn_b.read_chunk().await.unwrap());
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn split_halves_keep_the_nonce_sequence() {
        let (conn_a, mut conn_b, _, _) = pair().await;
        let (_read_a, mut write_a) = conn_a.into_split();

        for i in 0..5u8 {
            write_a.write_chunk(&[i; 10]).await.unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(conn_b.read_chunk().await.unwrap(), vec![i; 10]);
        }
    }
}
