use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use noirbft_proto::abci::{request, response, Request, Response};

use crate::client::Client;
use crate::codec::{read_frame, write_frame};
use crate::{Address, Error};

enum Pending {
    Reply(oneshot::Sender<Result<Response, Error>>),
    /// Interleaved Flush responses are matched and dropped.
    Discard,
}

/// Talks the socket ABCI protocol to the application.
///
/// Requests are pipelined: the writer task appends a `Flush` after every
/// request so the application pushes its responses out immediately, and
/// the reader task matches responses to callers strictly in order.
pub struct SocketClient {
    requests: mpsc::Sender<(Request, oneshot::Sender<Result<Response, Error>>)>,
}

impl SocketClient {
    pub async fn connect(address: &Address) -> Result<Self, Error> {
        match address {
            Address::Unix(path) => {
                let stream = UnixStream::connect(path).await?;
                let (read, write) = stream.into_split();
                Ok(Self::spawn(read, write))
            }
            Address::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                let (read, write) = stream.into_split();
                Ok(Self::spawn(read, write))
            }
        }
    }

    fn spawn<R, W>(read: R, write: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (requests_tx, mut requests_rx) =
            mpsc::channel::<(Request, oneshot::Sender<Result<Response, Error>>)>(256);
        let (pending_tx, mut pending_rx) = mpsc::unbounded_channel::<Pending>();

        // Writer: frame every request, chased by a Flush.
        tokio::spawn(async move {
            let mut writer = BufWriter::new(write);
            while let Some((request, reply)) = requests_rx.recv().await {
                if pending_tx.send(Pending::Reply(reply)).is_err() {
                    break;
                }
                if let Err(e) = write_frame(&mut writer, &request).await {
                    error!("Failed to write ABCI request: {e}");
                    break;
                }

                let flush = Request {
                    value: Some(request::Value::Flush(
                        noirbft_proto::abci::RequestFlush {},
                    )),
                };
                if pending_tx.send(Pending::Discard).is_err() {
                    break;
                }
                if let Err(e) = write_frame(&mut writer, &flush).await {
                    error!("Failed to flush ABCI request: {e}");
                    break;
                }
                if let Err(e) = writer.flush().await {
                    error!("Failed to flush ABCI stream: {e}");
                    break;
                }
            }
            debug!("ABCI writer task finished");
        });

        // Reader: deliver responses to callers in FIFO order.
        tokio::spawn(async move {
            let mut reader = BufReader::new(read);
            loop {
                let response: Option<Response> = match read_frame(&mut reader).await {
                    Ok(response) => response,
                    Err(e) => {
                        error!("Failed to read ABCI response: {e}");
                        None
                    }
                };

                match response {
                    Some(response) => match pending_rx.recv().await {
                        Some(Pending::Reply(reply)) => {
                            let _ = reply.send(Ok(response));
                        }
                        Some(Pending::Discard) => {}
                        None => break,
                    },
                    None => {
                        // Connection closed: fail everything still waiting.
                        while let Ok(pending) = pending_rx.try_recv() {
                            if let Pending::Reply(reply) = pending {
                                let _ = reply.send(Err(Error::ConnectionClosed));
                            }
                        }
                        break;
                    }
                }
            }
            debug!("ABCI reader task finished");
        });

        Self {
            requests: requests_tx,
        }
    }

    async fn call(&self, value: request::Value) -> Result<response::Value, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send((Request { value: Some(value) }, reply_tx))
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        let response = reply_rx.await.map_err(|_| Error::ConnectionClosed)??;
        match response.value {
            Some(response::Value::Exception(e)) => Err(Error::Exception(e.error)),
            Some(value) => Ok(value),
            None => Err(Error::UnexpectedResponse {
                expected: "response",
                got: "empty".to_string(),
            }),
        }
    }
}

macro_rules! expect_response {
    ($value:expr, $variant:ident, $expected:literal) => {
        match $value {
            response::Value::$variant(resp) => Ok(resp),
            other => Err(Error::UnexpectedResponse {
                expected: $expected,
                got: format!("{other:?}"),
            }),
        }
    };
}

#[async_trait]
impl Client for SocketClient {
    async fn echo(&self, message: String) -> Result<noirbft_proto::abci::ResponseEcho, Error> {
        let value = self
            .call(request::Value::Echo(noirbft_proto::abci::RequestEcho {
                message,
            }))
            .await?;
        expect_response!(value, Echo, "echo")
    }

    async fn flush(&self) -> Result<(), Error> {
        let value = self
            .call(request::Value::Flush(noirbft_proto::abci::RequestFlush {}))
            .await?;
        expect_response!(value, Flush, "flush").map(|_| ())
    }

    async fn info(
        &self,
        req: noirbft_proto::abci::RequestInfo,
    ) -> Result<noirbft_proto::abci::ResponseInfo, Error> {
        let value = self.call(request::Value::Info(req)).await?;
        expect_response!(value, Info, "info")
    }

    async fn init_chain(
        &self,
        req: noirbft_proto::abci::RequestInitChain,
    ) -> Result<noirbft_proto::abci::ResponseInitChain, Error> {
        let value = self.call(request::Value::InitChain(req)).await?;
        expect_response!(value, InitChain, "init_chain")
    }

    async fn query(
        &self,
        req: noirbft_proto::abci::RequestQuery,
    ) -> Result<noirbft_proto::abci::ResponseQuery, Error> {
        let value = self.call(request::Value::Query(req)).await?;
        expect_response!(value, Query, "query")
    }

    async fn begin_block(
        &self,
        req: noirbft_proto::abci::RequestBeginBlock,
    ) -> Result<noirbft_proto::abci::ResponseBeginBlock, Error> {
        let value = self.call(request::Value::BeginBlock(req)).await?;
        expect_response!(value, BeginBlock, "begin_block")
    }

    async fn check_tx(
        &self,
        req: noirbft_proto::abci::RequestCheckTx,
    ) -> Result<noirbft_proto::abci::ResponseCheckTx, Error> {
        let value = self.call(request::Value::CheckTx(req)).await?;
        expect_response!(value, CheckTx, "check_tx")
    }

    async fn deliver_tx(
        &self,
        req: noirbft_proto::abci::RequestDeliverTx,
    ) -> Result<noirbft_proto::abci::ResponseDeliverTx, Error> {
        let value = self.call(request::Value::DeliverTx(req)).await?;
        expect_response!(value, DeliverTx, "deliver_tx")
    }

    async fn end_block(
        &self,
        req: noirbft_proto::abci::RequestEndBlock,
    ) -> Result<noirbft_proto::abci::ResponseEndBlock, Error> {
        let value = self.call(request::Value::EndBlock(req)).await?;
        expect_response!(value, EndBlock, "end_block")
    }

    async fn commit(&self) -> Result<noirbft_proto::abci::ResponseCommit, Error> {
        let value = self
            .call(request::Value::Commit(noirbft_proto::abci::RequestCommit {}))
            .await?;
        expect_response!(value, Commit, "commit")
    }

    async fn list_snapshots(&self) -> Result<noirbft_proto::abci::ResponseListSnapshots, Error> {
        let value = self
            .call(request::Value::ListSnapshots(
                noirbft_proto::abci::RequestListSnapshots {},
            ))
            .await?;
        expect_response!(value, ListSnapshots, "list_snapshots")
    }

    async fn offer_snapshot(
        &self,
        req: noirbft_proto::abci::RequestOfferSnapshot,
    ) -> Result<noirbft_proto::abci::ResponseOfferSnapshot, Error> {
        let value = self.call(request::Value::OfferSnapshot(req)).await?;
        expect_response!(value, OfferSnapshot, "offer_snapshot")
    }

    async fn load_snapshot_chunk(
        &self,
        req: noirbft_proto::abci::RequestLoadSnapshotChunk,
    ) -> Result<noirbft_proto::abci::ResponseLoadSnapshotChunk, Error> {
        let value = self.call(request::Value::LoadSnapshotChunk(req)).await?;
        expect_response!(value, LoadSnapshotChunk, "load_snapshot_chunk")
    }

    async fn apply_snapshot_chunk(
        &self,
        req: noirbft_proto::abci::RequestApplySnapshotChunk,
    ) -> Result<noirbft_proto::abci::ResponseApplySnapshotChunk, Error> {
        let value = self.call(request::Value::ApplySnapshotChunk(req)).await?;
        expect_response!(value, ApplySnapshotChunk, "apply_snapshot_chunk")
    }
}
