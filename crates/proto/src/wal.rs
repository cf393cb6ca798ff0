//! Records persisted in the consensus write-ahead log.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EndHeight {
    #[prost(int64, tag = "1")]
    pub height: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoundStepUpdate {
    #[prost(int64, tag = "1")]
    pub height: i64,
    #[prost(int32, tag = "2")]
    pub round: i32,
    #[prost(uint32, tag = "3")]
    pub step: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MsgInfo {
    #[prost(message, optional, tag = "1")]
    pub msg: Option<crate::consensus::Message>,
    /// Empty for messages we generated ourselves.
    #[prost(string, tag = "2")]
    pub peer_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TimeoutInfo {
    /// Nanoseconds.
    #[prost(int64, tag = "1")]
    pub duration: i64,
    #[prost(int64, tag = "2")]
    pub height: i64,
    #[prost(int32, tag = "3")]
    pub round: i32,
    #[prost(uint32, tag = "4")]
    pub step: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WalMessage {
    #[prost(oneof = "wal_message::Sum", tags = "1, 2, 3, 4")]
    pub sum: Option<wal_message::Sum>,
}

pub mod wal_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Sum {
        #[prost(message, tag = "1")]
        EndHeight(super::EndHeight),
        #[prost(message, tag = "2")]
        RoundStepUpdate(super::RoundStepUpdate),
        #[prost(message, tag = "3")]
        MsgInfo(super::MsgInfo),
        #[prost(message, tag = "4")]
        TimeoutInfo(super::TimeoutInfo),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TimedWalMessage {
    #[prost(int64, tag = "1")]
    pub time: i64,
    #[prost(message, optional, tag = "2")]
    pub msg: Option<WalMessage>,
}
