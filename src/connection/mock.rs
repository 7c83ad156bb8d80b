//! In-memory primitive that tracks the offer/answer state machine

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use super::{
    ConnectionError, DataChannel, DataChannelState, DataMessage, IceConnectionState, LocalStream,
    MediaTrack, MessageHandler, OfferOptions, PeerConnection, PeerConnectionEvent,
    PeerConnectionFactory, PeerConnectionState, SignalingState,
};
use crate::config::{DataChannelOptions, IceServer};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

#[derive(Default)]
pub(crate) struct MockFactory {
    peers: Mutex<Vec<Arc<MockPeer>>>,
    failing: AtomicBool,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub fn last(&self) -> Arc<MockPeer> {
        self.peers.lock().unwrap().last().cloned().expect("no peer created")
    }
}

impl PeerConnectionFactory for MockFactory {
    fn create(
        &self,
        servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConnectionError::OperationFailed("factory failure".into()));
        }
        let peer = Arc::new(MockPeer::new(servers.to_vec(), events));
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

#[derive(Default)]
struct PeerState {
    signaling: SignalingState,
    connection: PeerConnectionState,
    ice: IceConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<String>,
    channels: Vec<Arc<MockChannel>>,
    candidates: Vec<IceCandidate>,
    offers: u32,
    answers: u32,
    rollbacks: u32,
    closes: u32,
}

struct OfferGate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

pub(crate) struct MockPeer {
    pub servers: Vec<IceServer>,
    events: mpsc::UnboundedSender<PeerConnectionEvent>,
    state: Mutex<PeerState>,
    offer_gate: Mutex<Option<OfferGate>>,
    fail_candidates: AtomicBool,
    fail_answers: AtomicBool,
    fail_remote: AtomicBool,
}

impl MockPeer {
    fn new(servers: Vec<IceServer>, events: mpsc::UnboundedSender<PeerConnectionEvent>) -> Self {
        Self {
            servers,
            events,
            state: Mutex::new(PeerState::default()),
            offer_gate: Mutex::new(None),
            fail_candidates: AtomicBool::new(false),
            fail_answers: AtomicBool::new(false),
            fail_remote: AtomicBool::new(false),
        }
    }

    /// Suspend the next `create_offer` until `release` is notified.
    /// Returns `(entered, release)`.
    pub fn hold_next_offer(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.offer_gate.lock().unwrap() = Some(OfferGate {
            entered: entered.clone(),
            release: release.clone(),
        });
        (entered, release)
    }

    pub fn emit(&self, event: PeerConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_fail_candidates(&self, fail: bool) {
        self.fail_candidates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_answers(&self, fail: bool) {
        self.fail_answers.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_remote(&self, fail: bool) {
        self.fail_remote.store(fail, Ordering::SeqCst);
    }

    pub fn tracks(&self) -> Vec<String> {
        self.state.lock().unwrap().tracks.clone()
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.state.lock().unwrap().channels.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().unwrap().candidates.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }

    pub fn offers(&self) -> u32 {
        self.state.lock().unwrap().offers
    }

    pub fn rollbacks(&self) -> u32 {
        self.state.lock().unwrap().rollbacks
    }

    pub fn closes(&self) -> u32 {
        self.state.lock().unwrap().closes
    }

    fn invalid(kind: SdpType, side: &str, state: SignalingState) -> ConnectionError {
        ConnectionError::InvalidState(format!("cannot apply {} {:?} in {:?}", side, kind, state))
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    fn add_track(&self, track: &MediaTrack, _stream: &LocalStream) -> Result<(), ConnectionError> {
        self.state.lock().unwrap().tracks.push(track.id.clone());
        Ok(())
    }

    fn create_data_channel(
        &self,
        label: &str,
        options: Option<&DataChannelOptions>,
    ) -> Result<Arc<dyn DataChannel>, ConnectionError> {
        let mut state = self.state.lock().unwrap();
        if state.signaling == SignalingState::Closed {
            return Err(ConnectionError::Closed);
        }
        let channel = Arc::new(MockChannel::new(label, options.cloned()));
        state.channels.push(channel.clone());
        Ok(channel)
    }

    async fn create_offer(
        &self,
        _options: &OfferOptions,
    ) -> Result<SessionDescription, ConnectionError> {
        let gate = self.offer_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let mut state = self.state.lock().unwrap();
        if state.signaling == SignalingState::Closed {
            return Err(ConnectionError::Closed);
        }
        state.offers += 1;
        Ok(SessionDescription::offer(format!("mock-offer-{}", state.offers)))
    }

    async fn create_answer(
        &self,
        _options: &OfferOptions,
    ) -> Result<SessionDescription, ConnectionError> {
        if self.fail_answers.load(Ordering::SeqCst) {
            return Err(ConnectionError::OperationFailed("answer failure".into()));
        }
        let mut state = self.state.lock().unwrap();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(ConnectionError::InvalidState(format!(
                "cannot answer in {:?}",
                state.signaling
            )));
        }
        state.answers += 1;
        Ok(SessionDescription::answer(format!("mock-answer-{}", state.answers)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().unwrap();
        let next = match (description.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpType::Answer, SignalingState::HaveRemoteOffer)
            | (SdpType::Answer, SignalingState::HaveLocalPranswer) => SignalingState::Stable,
            (SdpType::Pranswer, SignalingState::HaveRemoteOffer) => {
                SignalingState::HaveLocalPranswer
            }
            (SdpType::Rollback, current @ SignalingState::HaveLocalOffer)
            | (SdpType::Rollback, current @ SignalingState::HaveRemoteOffer) => {
                state.rollbacks += 1;
                if current == SignalingState::HaveRemoteOffer {
                    state.remote = None;
                }
                state.local = None;
                state.signaling = SignalingState::Stable;
                return Ok(());
            }
            (kind, current) => return Err(Self::invalid(kind, "local", current)),
        };
        state.signaling = next;
        state.local = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(ConnectionError::OperationFailed("remote description failure".into()));
        }
        let mut state = self.state.lock().unwrap();
        let next = match (description.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpType::Answer, SignalingState::HaveLocalOffer)
            | (SdpType::Answer, SignalingState::HaveRemotePranswer) => SignalingState::Stable,
            (SdpType::Pranswer, SignalingState::HaveLocalOffer) => {
                SignalingState::HaveRemotePranswer
            }
            (SdpType::Rollback, SignalingState::HaveRemoteOffer) => {
                state.remote = None;
                state.signaling = SignalingState::Stable;
                return Ok(());
            }
            (kind, current) => return Err(Self::invalid(kind, "remote", current)),
        };
        state.signaling = next;
        state.remote = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        if self.fail_candidates.load(Ordering::SeqCst) {
            return Err(ConnectionError::OperationFailed("candidate failure".into()));
        }
        let mut state = self.state.lock().unwrap();
        if state.remote.is_none() {
            return Err(ConnectionError::InvalidState(
                "no remote description".into(),
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().local.clone()
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().unwrap().signaling
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().unwrap().connection
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().unwrap().ice
    }

    fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.closes += 1;
            state.signaling = SignalingState::Closed;
            state.connection = PeerConnectionState::Closed;
            state.ice = IceConnectionState::Closed;
        }
        self.emit(PeerConnectionEvent::ConnectionStateChange(
            PeerConnectionState::Closed,
        ));
    }
}

pub(crate) struct MockChannel {
    label: String,
    pub options: Option<DataChannelOptions>,
    state: Mutex<DataChannelState>,
    sent: Mutex<Vec<DataMessage>>,
    handler: Mutex<Option<MessageHandler>>,
}

impl MockChannel {
    pub fn new(label: &str, options: Option<DataChannelOptions>) -> Self {
        Self {
            label: label.to_string(),
            options,
            state: Mutex::new(DataChannelState::Connecting),
            sent: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
        }
    }

    pub fn open(&self) {
        *self.state.lock().unwrap() = DataChannelState::Open;
    }

    pub fn sent(&self) -> Vec<DataMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn has_handler(&self) -> bool {
        self.handler.lock().unwrap().is_some()
    }

    /// Simulate an inbound message from the remote side
    pub fn deliver(&self, message: DataMessage) {
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler(message);
        }
    }
}

impl DataChannel for MockChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> DataChannelState {
        *self.state.lock().unwrap()
    }

    fn send(&self, message: &DataMessage) -> Result<(), ConnectionError> {
        if self.ready_state() != DataChannelState::Open {
            return Err(ConnectionError::InvalidState("channel not open".into()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn close(&self) {
        *self.state.lock().unwrap() = DataChannelState::Closed;
    }
}
