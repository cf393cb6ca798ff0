use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use prost::Message;

use noirbft_proto::wal::TimedWalMessage;

use crate::{compute_crc, Error};

/// Hard cap on an encoded WAL payload: the largest consensus message (a
/// block part) plus envelope slack.
pub const MAX_MSG_PAYLOAD_BYTES: usize = 1024 * 1024 + 24;

/// Outcome of reading one record.
#[derive(Debug)]
pub enum Decoded {
    /// A well-formed record.
    Msg(TimedWalMessage),
    /// Clean end of file.
    Eof,
    /// The record failed its CRC, length or payload check. `resynced` is
    /// true when the frame header was intact and the reader is positioned
    /// at the next frame boundary.
    Corrupted { reason: String, resynced: bool },
}

/// Reads CRC-framed records back from one WAL file.
pub struct WalDecoder {
    reader: BufReader<File>,
}

impl WalDecoder {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
        })
    }

    /// Reads the next record.
    ///
    /// On a CRC mismatch the payload bytes have already been consumed, so a
    /// caller running in ignore-data-corruption mode can simply call
    /// `decode` again to resynchronize at the next frame.
    pub fn decode(&mut self) -> Result<Decoded, Error> {
        let mut header = [0u8; 8];
        match read_full(&mut self.reader, &mut header) {
            ReadFull::Eof => return Ok(Decoded::Eof),
            ReadFull::Short => {
                return Ok(Decoded::Corrupted {
                    reason: "partial frame header".to_string(),
                    resynced: false,
                })
            }
            ReadFull::Err(e) => return Err(e.into()),
            ReadFull::Ok => {}
        }

        let crc = u32::from_be_bytes(header[0..4].try_into().expect("4 bytes"));
        let length = u32::from_be_bytes(header[4..8].try_into().expect("4 bytes")) as usize;

        if length > MAX_MSG_PAYLOAD_BYTES {
            return Ok(Decoded::Corrupted {
                reason: format!("frame length {length} exceeds cap"),
                resynced: false,
            });
        }

        let mut payload = vec![0u8; length];
        match read_full(&mut self.reader, &mut payload) {
            ReadFull::Eof | ReadFull::Short => {
                return Ok(Decoded::Corrupted {
                    reason: "partial frame payload".to_string(),
                    resynced: false,
                })
            }
            ReadFull::Err(e) => return Err(e.into()),
            ReadFull::Ok => {}
        }

        let actual = compute_crc(&payload);
        if actual != crc {
            return Ok(Decoded::Corrupted {
                reason: format!("CRC mismatch: expected {crc:#010x}, computed {actual:#010x}"),
                resynced: true,
            });
        }

        match TimedWalMessage::decode(payload.as_slice()) {
            Ok(msg) => Ok(Decoded::Msg(msg)),
            Err(e) => Ok(Decoded::Corrupted {
                reason: format!("undecodable payload: {e}"),
                resynced: true,
            }),
        }
    }
}

enum ReadFull {
    Ok,
    Eof,
    Short,
    Err(io::Error),
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> ReadFull {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return ReadFull::Eof,
            Ok(0) => return ReadFull::Short,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return ReadFull::Err(e),
        }
    }
    ReadFull::Ok
}
