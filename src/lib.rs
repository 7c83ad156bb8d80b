//! Full-mesh peer negotiation over an external signaling channel
//!
//! A [`Room`] joins a session, keeps one [`Participant`] per remote member
//! and routes inbound [`SignalingEvent`]s to them. Outbound events are
//! dispatched under [`SEND_EVENT`] on a caller-owned [`EventDispatcher`].

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod participant;
pub mod room;
pub mod signaling;

pub use config::{ConfigError, Configuration, DataChannelOptions, IceServer};
pub use connection::{
    ConnectionError, DataMessage, LocalStream, PeerConnection, PeerConnectionEvent,
    PeerConnectionFactory,
};
pub use dispatcher::{Event, EventDispatcher};
pub use error::Error;
pub use participant::{NegotiationState, Participant, ParticipantEvent};
pub use room::{Room, RoomEvent};
pub use signaling::{
    IceCandidate, MemberId, RoomId, SEND_EVENT, SdpType, SessionDescription, SignalingEvent,
    SignalingEventType,
};
