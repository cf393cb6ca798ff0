use core::fmt;

/// Logical stream id multiplexed over one connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u8);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// What to drop when a bounded peer queue overflows.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Gossip that will be re-sent anyway: shed the oldest entry.
    #[default]
    DropOldest,
    /// Messages that must not be reordered away: refuse the newest.
    DropNewest,
}

/// Static description of one channel.
#[derive(Clone, Debug)]
pub struct ChannelDescriptor {
    pub id: ChannelId,
    pub priority: u32,
    pub send_queue_capacity: usize,
    pub recv_message_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl ChannelDescriptor {
    pub fn new(id: ChannelId, priority: u32) -> Self {
        Self {
            id,
            priority,
            send_queue_capacity: 64,
            recv_message_capacity: 22_020_096, // 21 MiB
            overflow_policy: OverflowPolicy::default(),
        }
    }

    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    pub fn with_recv_message_capacity(mut self, capacity: usize) -> Self {
        self.recv_message_capacity = capacity;
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }
}

/// The channel set the Noir core runs with.
pub fn core_channel_descriptors() -> Vec<ChannelDescriptor> {
    use crate::channels::*;

    vec![
        ChannelDescriptor::new(CONSENSUS_STATE, 6)
            .with_send_queue_capacity(100)
            .with_overflow_policy(OverflowPolicy::DropOldest),
        ChannelDescriptor::new(CONSENSUS_DATA, 10)
            .with_send_queue_capacity(100)
            .with_overflow_policy(OverflowPolicy::DropNewest),
        ChannelDescriptor::new(CONSENSUS_VOTE, 7)
            .with_send_queue_capacity(100)
            .with_overflow_policy(OverflowPolicy::DropNewest),
        ChannelDescriptor::new(MEMPOOL, 5)
            .with_send_queue_capacity(100)
            .with_overflow_policy(OverflowPolicy::DropOldest),
        ChannelDescriptor::new(EVIDENCE, 6)
            .with_send_queue_capacity(10)
            .with_overflow_policy(OverflowPolicy::DropOldest),
        ChannelDescriptor::new(BLOCK_SYNC, 5)
            .with_send_queue_capacity(1000)
            .with_overflow_policy(OverflowPolicy::DropNewest),
    ]
}
