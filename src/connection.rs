//! Capability interface of the peer-connection primitive
//!
//! The crate drives connections through these traits and never implements
//! ICE, DTLS or SDP itself. Notifications from the primitive arrive as
//! [`PeerConnectionEvent`]s on the channel handed to
//! [`PeerConnectionFactory::create`].

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{DataChannelOptions, IceServer};
use crate::signaling::{IceCandidate, SessionDescription};

/// Failures reported by the connection primitive
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("connection closed")]
    Closed,
}

/// Offer/answer exchange status of the primitive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeerConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DataChannelState {
    #[default]
    Connecting,
    Open,
    Closing,
    Closed,
}

/// What to request from the remote side when producing descriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
}

impl Default for OfferOptions {
    fn default() -> Self {
        Self {
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Local media source shared by every participant of a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }
}

/// Remote track announced by the primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackEvent {
    pub track: MediaTrack,
    pub stream_ids: Vec<String>,
}

/// Payload carried over a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl From<&str> for DataMessage {
    fn from(s: &str) -> Self {
        DataMessage::Text(s.to_string())
    }
}

impl From<String> for DataMessage {
    fn from(s: String) -> Self {
        DataMessage::Text(s)
    }
}

impl From<Vec<u8>> for DataMessage {
    fn from(bytes: Vec<u8>) -> Self {
        DataMessage::Binary(bytes)
    }
}

pub type MessageHandler = Box<dyn Fn(DataMessage) + Send + Sync>;

pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn ready_state(&self) -> DataChannelState;

    fn send(&self, message: &DataMessage) -> Result<(), ConnectionError>;

    /// Replace the handler receiving inbound messages
    fn on_message(&self, handler: MessageHandler);

    fn close(&self);
}

/// Notifications emitted by the primitive
pub enum PeerConnectionEvent {
    /// A gathered local candidate; `None` marks the end of gathering
    IceCandidate(Option<IceCandidate>),
    ConnectionStateChange(PeerConnectionState),
    IceConnectionStateChange(IceConnectionState),
    NegotiationNeeded,
    /// A channel opened by the remote side
    DataChannel(Arc<dyn DataChannel>),
    Track(TrackEvent),
}

impl std::fmt::Debug for PeerConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            Self::ConnectionStateChange(s) => {
                f.debug_tuple("ConnectionStateChange").field(s).finish()
            }
            Self::IceConnectionStateChange(s) => {
                f.debug_tuple("IceConnectionStateChange").field(s).finish()
            }
            Self::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            Self::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            Self::Track(t) => f.debug_tuple("Track").field(t).finish(),
        }
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn add_track(&self, track: &MediaTrack, stream: &LocalStream) -> Result<(), ConnectionError>;

    fn create_data_channel(
        &self,
        label: &str,
        options: Option<&DataChannelOptions>,
    ) -> Result<Arc<dyn DataChannel>, ConnectionError>;

    async fn create_offer(
        &self,
        options: &OfferOptions,
    ) -> Result<SessionDescription, ConnectionError>;

    async fn create_answer(
        &self,
        options: &OfferOptions,
    ) -> Result<SessionDescription, ConnectionError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;

    fn local_description(&self) -> Option<SessionDescription>;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> PeerConnectionState;

    fn ice_connection_state(&self) -> IceConnectionState;

    fn close(&self);
}

/// Creates one primitive per participant
pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError>;
}
