//! Varint length-prefixed framing shared by the client and the test
//! servers.

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Error;

/// Largest frame we are willing to read.
const MAX_FRAME_SIZE: u64 = 32 * 1024 * 1024;

pub async fn write_frame<W, M>(writer: &mut W, msg: &M) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let bytes = msg.encode_length_delimited_to_vec();
    writer.write_all(&bytes).await?;
    Ok(())
}

pub async fn read_frame<R, M>(reader: &mut R) -> Result<Option<M>, Error>
where
    R: AsyncRead + Unpin,
    M: Message + Default,
{
    let length = match read_varint(reader).await? {
        Some(length) => length,
        None => return Ok(None),
    };
    if length > MAX_FRAME_SIZE {
        return Err(Error::Decode(prost::DecodeError::new("frame too large")));
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(M::decode(payload.as_slice())?))
}

/// Reads one LEB128 varint. Returns `None` on a clean EOF before the first
/// byte.
async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<u64>, Error> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte).await {
            Ok(0) if shift == 0 => return Ok(None),
            Ok(0) => return Err(Error::ConnectionClosed),
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::Decode(prost::DecodeError::new("varint overflow")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noirbft_proto::abci::{request, Request, RequestEcho};

    #[tokio::test]
    async fn frame_round_trip() {
        let request = Request {
            value: Some(request::Value::Echo(RequestEcho {
                message: "hello".to_string(),
            })),
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &request).await.unwrap();

        let mut cursor = buf.as_slice();
        let decoded: Request = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded, request);

        // Clean EOF afterwards.
        let eof: Option<Request> = read_frame(&mut cursor).await.unwrap();
        assert!(eof.is_none());
    }
}
