use async_trait::async_trait;

use noirbft_proto::abci::*;

use crate::Error;

/// One method per ABCI call. `check_tx` and `query` surface application
/// error codes to the caller; the consensus-critical calls are checked by
/// the block executor, which halts the node on failure.
#[async_trait]
pub trait Client: Send + Sync {
    async fn echo(&self, message: String) -> Result<ResponseEcho, Error>;
    async fn flush(&self) -> Result<(), Error>;
    async fn info(&self, req: RequestInfo) -> Result<ResponseInfo, Error>;
    async fn init_chain(&self, req: RequestInitChain) -> Result<ResponseInitChain, Error>;
    async fn query(&self, req: RequestQuery) -> Result<ResponseQuery, Error>;
    async fn begin_block(&self, req: RequestBeginBlock) -> Result<ResponseBeginBlock, Error>;
    async fn check_tx(&self, req: RequestCheckTx) -> Result<ResponseCheckTx, Error>;
    async fn deliver_tx(&self, req: RequestDeliverTx) -> Result<ResponseDeliverTx, Error>;
    async fn end_block(&self, req: RequestEndBlock) -> Result<ResponseEndBlock, Error>;
    async fn commit(&self) -> Result<ResponseCommit, Error>;
    async fn list_snapshots(&self) -> Result<ResponseListSnapshots, Error>;
    async fn offer_snapshot(&self, req: RequestOfferSnapshot)
        -> Result<ResponseOfferSnapshot, Error>;
    async fn load_snapshot_chunk(
        &self,
        req: RequestLoadSnapshotChunk,
    ) -> Result<ResponseLoadSnapshotChunk, Error>;
    async fn apply_snapshot_chunk(
        &self,
        req: RequestApplySnapshotChunk,
    ) -> Result<ResponseApplySnapshotChunk, Error>;
}
