use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use tracing::info;

use crate::compute_crc;
use crate::decoder::MAX_MSG_PAYLOAD_BYTES;

/// Copies the maximal well-formed frame prefix of `src` into `dst`,
/// discarding the trailing partial or corrupted frames. Returns the number
/// of bytes copied.
pub fn repair(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> io::Result<u64> {
    let mut data = Vec::new();
    File::open(&src)?.read_to_end(&mut data)?;

    let mut good = 0usize;
    while data.len() - good >= 8 {
        let crc = u32::from_be_bytes(data[good..good + 4].try_into().expect("4 bytes"));
        let length =
            u32::from_be_bytes(data[good + 4..good + 8].try_into().expect("4 bytes")) as usize;

        if length > MAX_MSG_PAYLOAD_BYTES || data.len() - good - 8 < length {
            break;
        }
        let payload = &data[good + 8..good + 8 + length];
        if compute_crc(payload) != crc {
            break;
        }
        good += 8 + length;
    }

    let mut out = File::create(&dst)?;
    out.write_all(&data[..good])?;
    out.sync_all()?;

    info!(
        src = %src.as_ref().display(),
        dst = %dst.as_ref().display(),
        kept = good,
        dropped = data.len() - good,
        "Repaired WAL file"
    );

    Ok(good as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Wal, WalOptions};
    use noirbft_proto::wal::{wal_message, EndHeight, TimedWalMessage, WalMessage};
    use std::fs::OpenOptions;

    fn end_height(h: i64) -> TimedWalMessage {
        TimedWalMessage {
            time: h,
            msg: Some(WalMessage {
                sum: Some(wal_message::Sum::EndHeight(EndHeight { height: h })),
            }),
        }
    }

    #[test]
    fn repair_keeps_good_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path(), WalOptions::default()).unwrap();
        wal.write(&end_height(1)).unwrap();
        wal.write_sync(&end_height(2)).unwrap();
        let good_size = wal.size().unwrap();

        let mut file = OpenOptions::new().append(true).open(wal.path()).unwrap();
        file.write_all(&[0x5a; 37]).unwrap();
        file.sync_all().unwrap();

        let repaired = dir.path().join("cs_wal.repaired");
        let kept = repair(wal.path(), &repaired).unwrap();

        assert_eq!(kept, good_size);
        assert_eq!(std::fs::metadata(&repaired).unwrap().len(), good_size);
    }

    #[test]
    fn repair_of_clean_file_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path(), WalOptions::default()).unwrap();
        wal.write_sync(&end_height(7)).unwrap();

        let repaired = dir.path().join("clean.repaired");
        let kept = repair(wal.path(), &repaired).unwrap();
        assert_eq!(kept, wal.size().unwrap());
    }
}
