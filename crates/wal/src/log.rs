use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use prost::Message;
use tracing::{debug, warn};

use noirbft_proto::wal::{wal_message, TimedWalMessage};

use crate::decoder::{Decoded, WalDecoder, MAX_MSG_PAYLOAD_BYTES};
use crate::{compute_crc, Error, SearchOptions};

pub const WAL_FILE_PREFIX: &str = "cs_wal.";

#[derive(Copy, Clone, Debug)]
pub struct WalOptions {
    /// Rotate the live file once it grows past this many bytes.
    pub rotate_size: u64,
    /// Number of files in the rotation ring.
    pub num_files: usize,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            rotate_size: 10 * 1024 * 1024,
            num_files: 16,
        }
    }
}

/// The rotating write-ahead log. Appends are buffered; durability comes
/// from [`Wal::flush_and_sync`], which the state machine invokes before
/// releasing any signed message.
pub struct Wal {
    dir: PathBuf,
    options: WalOptions,
    index: usize,
    file: File,
}

impl Wal {
    /// Opens the WAL in `dir`, resuming on the most recently written file
    /// or the first unused index.
    pub fn open(dir: impl AsRef<Path>, options: WalOptions) -> io::Result<Self> {
        let dir = dir.as_ref().to_owned();
        fs::create_dir_all(&dir)?;

        let mut index = None;
        let mut latest: Option<(SystemTime, usize)> = None;
        for i in 0..options.num_files {
            let path = Self::file_path(&dir, i);
            match fs::metadata(&path) {
                Err(_) => {
                    if index.is_none() {
                        index = Some(i);
                    }
                }
                Ok(meta) => {
                    let modified = meta.modified()?;
                    if latest.map(|(t, _)| modified > t).unwrap_or(true) {
                        latest = Some((modified, i));
                    }
                }
            }
        }
        let index = match (index, latest) {
            // Prefer resuming the newest existing file over opening a gap.
            (None, Some((_, i))) => i,
            (Some(i), _) => i,
            (None, None) => 0,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::file_path(&dir, index))?;

        debug!(dir = %dir.display(), index, "Opened WAL");

        Ok(Self {
            dir,
            options,
            index,
            file,
        })
    }

    fn file_path(dir: &Path, index: usize) -> PathBuf {
        dir.join(format!("{WAL_FILE_PREFIX}{index}"))
    }

    pub fn path(&self) -> PathBuf {
        Self::file_path(&self.dir, self.index)
    }

    /// Size of the live file in bytes.
    pub fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Appends one record. A failed append truncates the partial frame so
    /// the file never holds a half-written record in the middle.
    pub fn write(&mut self, msg: &TimedWalMessage) -> Result<(), Error> {
        if self.size()? >= self.options.rotate_size {
            self.rotate()?;
        }

        let payload = msg.encode_to_vec();
        if payload.len() > MAX_MSG_PAYLOAD_BYTES {
            return Err(Error::MessageTooBig {
                size: payload.len(),
                max: MAX_MSG_PAYLOAD_BYTES,
            });
        }

        let start = self.size()?;
        let result = (|| -> io::Result<()> {
            self.file.write_all(&compute_crc(&payload).to_be_bytes())?;
            self.file.write_all(&(payload.len() as u32).to_be_bytes())?;
            self.file.write_all(&payload)?;
            Ok(())
        })();

        if let Err(e) = result {
            warn!("Failed to append WAL record, truncating partial frame: {e}");
            self.file.set_len(start)?;
            return Err(e.into());
        }
        Ok(())
    }

    /// Appends one record and fsyncs. Used for the inputs that must be
    /// durable before their effects leave the node (proposals, votes,
    /// end-of-height markers).
    pub fn write_sync(&mut self, msg: &TimedWalMessage) -> Result<(), Error> {
        self.write(msg)?;
        self.flush_and_sync()?;
        Ok(())
    }

    pub fn flush_and_sync(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }

    /// Moves on to the next file in the ring, truncating whatever history
    /// it held.
    fn rotate(&mut self) -> io::Result<()> {
        self.flush_and_sync()?;
        self.index = (self.index + 1) % self.options.num_files;
        let path = Self::file_path(&self.dir, self.index);
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        debug!(index = self.index, "Rotated WAL file");
        Ok(())
    }

    /// File indexes ordered newest first, following the rotation ring
    /// backwards from the live file.
    pub fn reverse_file_index(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for i in 0..self.options.num_files {
            let idx = (self.index + self.options.num_files - i) % self.options.num_files;
            if !Self::file_path(&self.dir, idx).exists() {
                break;
            }
            out.push(idx);
        }
        out
    }

    /// Finds the latest `EndHeight { height }` record and returns every
    /// record written after it, in order — exactly what replay needs to
    /// re-drive the state machine.
    ///
    /// Returns `Ok(None)` when no such marker exists in the retained files.
    pub fn search_for_end_height(
        &self,
        height: i64,
        options: SearchOptions,
    ) -> Result<Option<Vec<TimedWalMessage>>, Error> {
        for index in self.reverse_file_index() {
            let path = Self::file_path(&self.dir, index);
            let mut decoder = WalDecoder::open(&path)?;

            let mut records = Vec::new();
            loop {
                match decoder.decode()? {
                    Decoded::Msg(msg) => records.push(msg),
                    Decoded::Eof => break,
                    Decoded::Corrupted { reason, resynced } => {
                        if options.ignore_data_corruption && resynced {
                            warn!(file = %path.display(), "Skipping corrupted WAL record: {reason}");
                            continue;
                        }
                        if Self::is_trailing_corruption(&mut decoder)? {
                            // A partial tail from a crash mid-append is
                            // expected; everything before it is usable.
                            warn!(file = %path.display(), "Dropping partial WAL tail: {reason}");
                            break;
                        }
                        return Err(Error::Corrupted(reason));
                    }
                }
            }

            let end = records.iter().rposition(|record| {
                matches!(
                    record.msg.as_ref().and_then(|m| m.sum.as_ref()),
                    Some(wal_message::Sum::EndHeight(eh)) if eh.height == height
                )
            });

            if let Some(pos) = end {
                return Ok(Some(records.split_off(pos + 1)));
            }
        }
        Ok(None)
    }

    /// A corrupted record is a benign trailing artifact iff nothing
    /// readable follows it.
    fn is_trailing_corruption(decoder: &mut WalDecoder) -> Result<bool, Error> {
        loop {
            match decoder.decode()? {
                Decoded::Eof => return Ok(true),
                Decoded::Msg(_) => return Ok(false),
                Decoded::Corrupted { resynced: true, .. } => continue,
                Decoded::Corrupted { resynced: false, .. } => return Ok(true),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noirbft_proto::wal::{EndHeight, WalMessage};
    use std::io::{Seek, SeekFrom};

    fn end_height(h: i64) -> TimedWalMessage {
        TimedWalMessage {
            time: h * 10,
            msg: Some(WalMessage {
                sum: Some(wal_message::Sum::EndHeight(EndHeight { height: h })),
            }),
        }
    }

    fn timeout(h: i64) -> TimedWalMessage {
        TimedWalMessage {
            time: h * 10 + 1,
            msg: Some(WalMessage {
                sum: Some(wal_message::Sum::TimeoutInfo(
                    noirbft_proto::wal::TimeoutInfo {
                        duration: 1_000,
                        height: h,
                        round: 0,
                        step: 1,
                    },
                )),
            }),
        }
    }

    fn read_all(path: &Path) -> Vec<TimedWalMessage> {
        let mut decoder = WalDecoder::open(path).unwrap();
        let mut out = Vec::new();
        loop {
            match decoder.decode().unwrap() {
                Decoded::Msg(msg) => out.push(msg),
                Decoded::Eof => return out,
                Decoded::Corrupted { reason, .. } => panic!("corrupted: {reason}"),
            }
        }
    }

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path(), WalOptions::default()).unwrap();

        let messages = vec![end_height(1), timeout(2), end_height(2)];
        for msg in &messages {
            wal.write(msg).unwrap();
        }
        wal.flush_and_sync().unwrap();

        assert_eq!(read_all(&wal.path()), messages);
    }

    #[test]
    fn search_returns_records_after_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path(), WalOptions::default()).unwrap();

        wal.write(&end_height(49)).unwrap();
        wal.write(&end_height(50)).unwrap();
        wal.write(&timeout(51)).unwrap();
        wal.write_sync(&timeout(51)).unwrap();

        let replay = wal
            .search_for_end_height(50, SearchOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(replay.len(), 2);

        assert!(wal
            .search_for_end_height(99, SearchOptions::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn random_tail_bytes_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path(), WalOptions::default()).unwrap();
        wal.write(&end_height(50)).unwrap();
        wal.write_sync(&timeout(51)).unwrap();

        // Crash artifact: garbage appended after the last full frame.
        let mut file = OpenOptions::new().append(true).open(wal.path()).unwrap();
        file.write_all(&[0xab; 100]).unwrap();
        file.sync_all().unwrap();

        let replay = wal
            .search_for_end_height(50, SearchOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(replay.len(), 1);
    }

    #[test]
    fn mid_file_corruption_fails_strict_search() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path(), WalOptions::default()).unwrap();
        wal.write(&end_height(50)).unwrap();
        let offset = wal.size().unwrap();
        wal.write(&timeout(51)).unwrap();
        wal.write_sync(&timeout(52)).unwrap();

        // Flip a payload byte of the middle record.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(wal.path())
            .unwrap();
        file.seek(SeekFrom::Start(offset + 8)).unwrap();
        file.write_all(&[0xff]).unwrap();
        file.sync_all().unwrap();

        let strict = wal.search_for_end_height(50, SearchOptions::default());
        assert!(matches!(strict, Err(Error::Corrupted(_))));

        // Ignore mode resynchronizes and still finds the marker.
        let lenient = wal
            .search_for_end_height(
                50,
                SearchOptions {
                    ignore_data_corruption: true,
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(lenient.len(), 1);
    }

    #[test]
    fn rotation_reuses_the_ring() {
        let dir = tempfile::tempdir().unwrap();
        let options = WalOptions {
            rotate_size: 64,
            num_files: 3,
        };
        let mut wal = Wal::open(dir.path(), options).unwrap();

        for h in 1..=20 {
            wal.write(&end_height(h)).unwrap();
        }
        wal.flush_and_sync().unwrap();

        let files = wal.reverse_file_index();
        assert!(files.len() <= 3);
        assert_eq!(files[0], wal.index);

        // Recent heights survive, ancient ones were overwritten.
        assert!(wal
            .search_for_end_height(20, SearchOptions::default())
            .unwrap()
            .is_some());
        assert!(wal
            .search_for_end_height(1, SearchOptions::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn oversized_message_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path(), WalOptions::default()).unwrap();

        let huge = TimedWalMessage {
            time: 0,
            msg: Some(WalMessage {
                sum: Some(wal_message::Sum::MsgInfo(noirbft_proto::wal::MsgInfo {
                    msg: Some(noirbft_proto::consensus::Message {
                        sum: Some(noirbft_proto::consensus::message::Sum::BlockPart(
                            noirbft_proto::consensus::BlockPartMessage {
                                height: 1,
                                round: 0,
                                part: Some(noirbft_proto::types::Part {
                                    index: 0,
                                    bytes: vec![0u8; 2 * 1024 * 1024].into(),
                                    proof: None,
                                }),
                            },
                        )),
                    }),
                    peer_id: String::new(),
                })),
            }),
        };

        assert!(matches!(
            wal.write(&huge),
            Err(Error::MessageTooBig { .. })
        ));
        assert_eq!(wal.size().unwrap(), 0);
    }
}
