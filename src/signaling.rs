//! Signaling wire model exchanged with the external signaling channel

mod messages;
mod types;

pub use messages::{
    IceCandidate, Payload, SEND_EVENT, SdpType, SessionDescription, SignalingEvent,
    SignalingEventType,
};
pub use types::{Identifiable, MemberId, RoomId};
