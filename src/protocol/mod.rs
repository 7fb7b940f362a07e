//! Coordination wire protocol.

pub mod codec;
mod messages;
mod requests;

pub use messages::{
    ChannelCountConfirmRequest, Envelope, Message, PartialValueResponse, Response, SetChannelCountRequest,
    SubscriberAction, SubscriberConfirmRequest, SubscriberIdRequest, TopicRequest,
};
pub use requests::{Reply, Requests};
