use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::UnixListener;

use noirbft_abci::{
    request, response, Address, Client, Request, RequestCheckTx, RequestDeliverTx, RequestInfo,
    Response, ResponseCheckTx, ResponseCommit, ResponseDeliverTx, ResponseEcho, ResponseFlush,
    ResponseInfo, SocketClient,
};

mod codec_copy {
    // The framing helpers are private to the crate; the test server uses
    // prost directly with the same varint discipline.
    use prost::Message;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    pub async fn write_frame<W: AsyncWrite + Unpin, M: Message>(writer: &mut W, msg: &M) {
        let bytes = msg.encode_length_delimited_to_vec();
        writer.write_all(&bytes).await.unwrap();
        writer.flush().await.unwrap();
    }

    pub async fn read_frame<R: AsyncRead + Unpin, M: Message + Default>(
        reader: &mut R,
    ) -> Option<M> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let mut byte = [0u8; 1];
            match reader.read(&mut byte).await {
                Ok(0) => return None,
                Ok(_) => {}
                Err(_) => return None,
            }
            value |= u64::from(byte[0] & 0x7f) << shift;
            if byte[0] & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut payload = vec![0u8; value as usize];
        reader.read_exact(&mut payload).await.ok()?;
        M::decode(payload.as_slice()).ok()
    }
}

/// A minimal application: echoes, reports height 0, accepts every tx.
async fn serve<S>(stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);
    let mut writer = BufWriter::new(write);
    let mut committed: u64 = 0;

    while let Some(request) = codec_copy::read_frame::<_, Request>(&mut reader).await {
        let value = match request.value {
            Some(request::Value::Echo(echo)) => response::Value::Echo(ResponseEcho {
                message: echo.message,
            }),
            Some(request::Value::Flush(_)) => response::Value::Flush(ResponseFlush {}),
            Some(request::Value::Info(_)) => response::Value::Info(ResponseInfo {
                data: "test-app".to_string(),
                version: "1.0".to_string(),
                app_version: 1,
                last_block_height: 0,
                last_block_app_hash: Vec::new(),
            }),
            Some(request::Value::CheckTx(RequestCheckTx { tx, .. })) => {
                response::Value::CheckTx(ResponseCheckTx {
                    code: if tx.is_empty() { 1 } else { 0 },
                    data: Vec::new(),
                    log: String::new(),
                    gas_wanted: 0,
                    gas_used: 0,
                    events: Vec::new(),
                })
            }
            Some(request::Value::DeliverTx(RequestDeliverTx { tx })) => {
                response::Value::DeliverTx(ResponseDeliverTx {
                    code: 0,
                    data: tx,
                    log: String::new(),
                    gas_wanted: 0,
                    gas_used: 0,
                    events: Vec::new(),
                })
            }
            Some(request::Value::Commit(_)) => {
                committed += 1;
                response::Value::Commit(ResponseCommit {
                    data: committed.to_be_bytes().to_vec(),
                    retain_height: 0,
                })
            }
            other => panic!("unexpected request: {other:?}"),
        };
        codec_copy::write_frame(&mut writer, &Response { value: Some(value) }).await;
    }
}

#[tokio::test]
async fn socket_client_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("app.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        serve(stream).await;
    });

    let address = Address::parse(&format!("unix://{}", socket_path.display())).unwrap();
    let client = SocketClient::connect(&address).await.unwrap();

    let echo = client.echo("ping".to_string()).await.unwrap();
    assert_eq!(echo.message, "ping");

    let info = client
        .info(RequestInfo {
            version: "0.1".to_string(),
            block_version: 11,
            p2p_version: 8,
        })
        .await
        .unwrap();
    assert_eq!(info.last_block_height, 0);
    assert_eq!(info.data, "test-app");

    // Pipelined consensus calls come back in order.
    let tx1 = client
        .deliver_tx(RequestDeliverTx { tx: b"a".to_vec() })
        .await
        .unwrap();
    let tx2 = client
        .deliver_tx(RequestDeliverTx { tx: b"b".to_vec() })
        .await
        .unwrap();
    assert_eq!(tx1.data, b"a");
    assert_eq!(tx2.data, b"b");

    let commit = client.commit().await.unwrap();
    assert_eq!(commit.data, 1u64.to_be_bytes().to_vec());

    let rejected = client
        .check_tx(RequestCheckTx {
            tx: Vec::new(),
            r#type: 0,
        })
        .await
        .unwrap();
    assert_eq!(rejected.code, 1);
}
