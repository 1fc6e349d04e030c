pub mod channel;
pub mod core;
pub mod join;
pub mod registry;
pub mod streams;

pub use channel::{
    ChannelHandle, ChannelId, ChannelSendError, EVENT_QUEUE_CAPACITY, EventSender, GatewayEvent,
    OUTBOUND_QUEUE_CAPACITY, Outbound, channel_pair,
};
pub use core::{GatewayCore, run};
pub use join::{JoinRequest, TokenTable};
pub use registry::{ParticipantRecord, ParticipantRegistry};
pub use streams::{StreamRecord, StreamTable};
