//! One peer connection to one remote member of a room

mod negotiation;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use negotiation::{NegotiationInput, NegotiationState, Step, Transition};

use crate::connection::{
    ConnectionError, DataChannel, DataChannelState, DataMessage, LocalStream, OfferOptions,
    PeerConnection, PeerConnectionEvent, SignalingState, TrackEvent,
};
use crate::dispatcher::{Event, EventDispatcher};
use crate::error::Error;
use crate::room::RoomContext;
use crate::signaling::{MemberId, SessionDescription, SignalingEvent, SignalingEventType};

pub const DISCONNECTED_EVENT: &str = "disconnected";
pub const ERROR_EVENT: &str = "error";
pub const MESSAGE_EVENT: &str = "message";
pub const TRACK_EVENT: &str = "track";

const HEX_CHARS: &[u8] = b"0123456789abcdef";
const CHANNEL_LABEL_LEN: usize = 13;

/// Local observer events of a participant
#[derive(Debug)]
pub enum ParticipantEvent {
    Disconnected,
    Error(Error),
    Message(DataMessage),
    Track(TrackEvent),
}

impl Event for ParticipantEvent {
    fn name(&self) -> &'static str {
        match self {
            ParticipantEvent::Disconnected => DISCONNECTED_EVENT,
            ParticipantEvent::Error(_) => ERROR_EVENT,
            ParticipantEvent::Message(_) => MESSAGE_EVENT,
            ParticipantEvent::Track(_) => TRACK_EVENT,
        }
    }
}

pub(crate) type ErrorReport = Box<dyn FnOnce(Error) + Send>;

/// Signaling work handled by the participant's event loop in arrival order
pub(crate) enum Inbound {
    Negotiate {
        remote: Option<SessionDescription>,
        /// Takes the failure instead of the participant's `error` event
        report: Option<ErrorReport>,
    },
    Signal(SignalingEvent),
}

enum Work {
    Peer(PeerConnectionEvent),
    Inbound(Inbound),
}

#[derive(Debug, Default)]
struct Negotiation {
    state: NegotiationState,
    /// Bumped whenever a round starts; a stale offer sees a different value
    round: u64,
    /// Bumped whenever a local offer is committed
    committed: u64,
}

pub struct Participant {
    id: MemberId,
    room: Arc<RoomContext>,
    peer: Arc<dyn PeerConnection>,
    channel: Mutex<Option<Arc<dyn DataChannel>>>,
    dispatcher: EventDispatcher<ParticipantEvent>,
    negotiation: tokio::sync::Mutex<Negotiation>,
    options: OfferOptions,
    closed: AtomicBool,
    inbound: mpsc::UnboundedSender<Inbound>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    this: Weak<Participant>,
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Participant {
    /// Create the primitive, attach the room's local stream and start the
    /// event loop. Must run inside a tokio runtime.
    pub(crate) fn new(id: MemberId, room: Arc<RoomContext>) -> Result<Arc<Self>, Error> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let peer = room
            .factory
            .create(room.configuration.servers(), events_tx)?;

        let participant = Arc::new_cyclic(|this| Participant {
            id,
            room,
            peer,
            channel: Mutex::new(None),
            dispatcher: EventDispatcher::new(),
            negotiation: tokio::sync::Mutex::new(Negotiation::default()),
            options: OfferOptions::default(),
            closed: AtomicBool::new(false),
            inbound: inbound_tx,
            event_loop: Mutex::new(None),
            this: this.clone(),
        });

        if let Some(stream) = &participant.room.stream {
            if let Err(e) = participant.add_stream(stream) {
                participant.peer.close();
                return Err(e);
            }
        }

        let handle = tokio::spawn(event_loop(
            Arc::downgrade(&participant),
            events_rx,
            inbound_rx,
        ));
        *participant
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!("Participant {} created in room {}", participant.id, participant.room.id);
        Ok(participant)
    }

    pub fn id(&self) -> &MemberId {
        &self.id
    }

    pub fn on<F>(&self, event: &str, handler: F) -> &Self
    where
        F: Fn(&ParticipantEvent) + Send + Sync + 'static,
    {
        self.dispatcher.register(event, handler);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> NegotiationState {
        if self.is_closed() {
            return NegotiationState::Closed;
        }
        self.negotiation.lock().await.state
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.peer.signaling_state()
    }

    pub fn data_channel_label(&self) -> Option<String> {
        self.channel_slot().as_ref().map(|channel| channel.label())
    }

    /// Attach every track of `stream` to the primitive. A live primitive
    /// answers with a negotiation-needed notification.
    pub fn add_stream(&self, stream: &LocalStream) -> Result<(), Error> {
        if self.is_closed() {
            return Err(ConnectionError::Closed.into());
        }
        for track in &stream.tracks {
            self.peer.add_track(track, stream)?;
        }
        debug!(
            "Participant {}: stream {} attached ({} tracks)",
            self.id,
            stream.id,
            stream.tracks.len()
        );
        Ok(())
    }

    /// Write to the data channel if it is open; otherwise do nothing.
    /// Returns whether the payload was handed to the channel.
    pub fn send(&self, payload: &DataMessage) -> bool {
        let channel = self.channel_slot().clone();
        let Some(channel) = channel else {
            return false;
        };
        if channel.ready_state() != DataChannelState::Open {
            return false;
        }
        match channel.send(payload) {
            Ok(()) => true,
            Err(e) => {
                warn!("Send to {} failed: {}", self.id, e);
                false
            }
        }
    }

    /// Close the channel and the primitive. Every call dispatches
    /// `disconnected`; nothing else is dispatched after the first call.
    pub fn close(&self) {
        let first = !self.closed.swap(true, Ordering::SeqCst);

        if let Some(channel) = self.channel_slot().as_ref() {
            channel.close();
        }
        self.peer.close();

        if let Some(handle) = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        if let Ok(mut negotiation) = self.negotiation.try_lock() {
            negotiation.state = NegotiationState::Closed;
        }

        if first {
            info!("Participant {} closed", self.id);
        }
        self.dispatcher.dispatch(&ParticipantEvent::Disconnected);
    }

    /// Handle an ANSWER or CANDIDATE from this participant's remote member
    pub async fn on_signaling_event(&self, event: &SignalingEvent) {
        if event.caller_id() != Some(&self.id) {
            return;
        }

        match event.kind {
            SignalingEventType::Answer => {
                if let Some(description) = event.description() {
                    self.negotiate_or_report(Some(description.clone())).await;
                }
            }
            SignalingEventType::Candidate => {
                if let Some(candidate) = event.ice_candidate() {
                    if let Err(e) = self.peer.add_ice_candidate(candidate.clone()).await {
                        warn!("Failed to add ICE candidate from {}: {}", self.id, e);
                        self.emit(ParticipantEvent::Error(e.into()));
                    }
                }
            }
            _ => {}
        }
    }

    /// Run one negotiation round.
    ///
    /// Without a remote description this side offers; the offer is only
    /// committed and announced if no other round started while it was being
    /// produced and the primitive is still stable. With a remote offer a
    /// local answer is produced and announced; a remote answer settles the
    /// negotiation. A failed step leaves the state matching the primitive.
    pub async fn renegotiate(&self, remote: Option<SessionDescription>) -> Result<(), Error> {
        let input = remote
            .as_ref()
            .map_or(NegotiationInput::Originate, |d| NegotiationInput::Remote(d.sdp_type));

        let mut negotiation = self.negotiation.lock().await;
        if self.is_closed() {
            negotiation.state = NegotiationState::Closed;
        }

        let previous = negotiation.state;
        let transition = previous.transition(input, self.peer.signaling_state());
        debug!(
            "Participant {}: {:?} + {:?} -> {:?}",
            self.id, previous, input, transition.step
        );

        let description = match (transition.step, remote) {
            (Step::Ignore, _) => {
                negotiation.state = transition.settled;
                return Ok(());
            }
            (Step::Offer, _) => {
                negotiation.state = transition.pending;
                negotiation.round += 1;
                let round = negotiation.round;
                if let Err(e) = self.ensure_data_channel() {
                    negotiation.state = previous.recover(self.peer.signaling_state());
                    return Err(e);
                }
                drop(negotiation);
                return self.offer(round, previous).await;
            }
            (_, Some(description)) => description,
            (_, None) => return Ok(()),
        };

        negotiation.state = transition.pending;
        let result = match transition.step {
            Step::Answer { rollback } => {
                negotiation.round += 1;
                self.answer(description, rollback).await
            }
            _ => self
                .peer
                .set_remote_description(description)
                .await
                .map_err(Error::from),
        };
        negotiation.state = match result {
            Ok(()) => transition.settled,
            Err(_) => previous.recover(self.peer.signaling_state()),
        };
        result
    }

    async fn offer(&self, round: u64, previous: NegotiationState) -> Result<(), Error> {
        let offer = match self.peer.create_offer(&self.options).await {
            Ok(offer) => offer,
            Err(e) => {
                let mut negotiation = self.negotiation.lock().await;
                if negotiation.round == round {
                    negotiation.state = previous.recover(self.peer.signaling_state());
                }
                return Err(e.into());
            }
        };

        let mut negotiation = self.negotiation.lock().await;
        if self.is_closed()
            || negotiation.round != round
            || self.peer.signaling_state() != SignalingState::Stable
        {
            debug!("Participant {}: discarding stale offer", self.id);
            return Ok(());
        }

        if let Err(e) = self.peer.set_local_description(offer.clone()).await {
            negotiation.state = previous.recover(self.peer.signaling_state());
            return Err(e.into());
        }
        negotiation.committed += 1;
        let committed = negotiation.committed;

        let local = self.peer.local_description().unwrap_or(offer);
        self.announce(SignalingEvent::offer(
            self.room.participant_id.clone(),
            self.id.clone(),
            self.room.id.clone(),
            local,
        ));
        drop(negotiation);

        self.arm_timeout(committed);
        Ok(())
    }

    /// Apply a remote offer and announce the local answer. A failure after
    /// the offer was applied rolls it back.
    async fn answer(&self, offer: SessionDescription, rollback: bool) -> Result<(), Error> {
        if rollback {
            debug!("Participant {}: remote offer wins, rolling back", self.id);
            self.peer
                .set_local_description(SessionDescription::rollback())
                .await?;
        }
        self.peer.set_remote_description(offer).await?;

        if let Err(e) = self.reply_with_answer().await {
            if self.peer.signaling_state() == SignalingState::HaveRemoteOffer {
                if let Err(rollback) = self
                    .peer
                    .set_local_description(SessionDescription::rollback())
                    .await
                {
                    warn!("Participant {}: rollback failed: {}", self.id, rollback);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn reply_with_answer(&self) -> Result<(), Error> {
        let answer = self.peer.create_answer(&self.options).await?;
        self.peer.set_local_description(answer.clone()).await?;
        let local = self.peer.local_description().unwrap_or(answer);
        self.announce(SignalingEvent::answer(
            self.room.participant_id.clone(),
            self.id.clone(),
            self.room.id.clone(),
            local,
        ));
        Ok(())
    }

    fn arm_timeout(&self, committed: u64) {
        let Some(timeout) = self.room.configuration.negotiation_timeout() else {
            return;
        };
        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(participant) = this.upgrade() {
                participant.expire_offer(committed, timeout).await;
            }
        });
    }

    async fn expire_offer(&self, committed: u64, timeout: Duration) {
        let mut negotiation = self.negotiation.lock().await;
        if self.is_closed()
            || negotiation.committed != committed
            || negotiation.state != NegotiationState::Offering
            || self.peer.signaling_state() != SignalingState::HaveLocalOffer
        {
            return;
        }

        warn!("Participant {}: no answer within {:?}", self.id, timeout);
        if let Err(e) = self
            .peer
            .set_local_description(SessionDescription::rollback())
            .await
        {
            drop(negotiation);
            self.emit(ParticipantEvent::Error(e.into()));
            return;
        }
        negotiation.state = NegotiationState::Stable;
        drop(negotiation);

        self.emit(ParticipantEvent::Error(Error::NegotiationTimeout {
            member: self.id.clone(),
            timeout,
        }));
    }

    /// Run a negotiation round, reporting failure as an `error` event
    pub(crate) async fn negotiate_or_report(&self, remote: Option<SessionDescription>) {
        if let Err(e) = self.renegotiate(remote).await {
            warn!("Negotiation with {} failed: {}", self.id, e);
            self.emit(ParticipantEvent::Error(e));
        }
    }

    /// Queue work for the event loop without waiting for it
    pub(crate) fn enqueue(&self, work: Inbound) {
        if self.inbound.send(work).is_err() {
            debug!("Participant {}: event loop stopped, dropping work", self.id);
        }
    }

    async fn on_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Negotiate {
                remote,
                report: Some(report),
            } => {
                if let Err(e) = self.renegotiate(remote).await {
                    warn!("Negotiation with {} failed: {}", self.id, e);
                    report(e);
                }
            }
            Inbound::Negotiate { remote, report: None } => self.negotiate_or_report(remote).await,
            Inbound::Signal(event) => self.on_signaling_event(&event).await,
        }
    }

    fn ensure_data_channel(&self) -> Result<(), Error> {
        let mut slot = self.channel_slot();
        if slot.is_some() {
            return Ok(());
        }

        let label = channel_label();
        let channel = self
            .peer
            .create_data_channel(&label, self.room.configuration.data_channel_options())?;
        self.install_message_handler(channel.as_ref());
        debug!("Participant {}: data channel {} created", self.id, label);
        *slot = Some(channel);
        Ok(())
    }

    fn install_message_handler(&self, channel: &dyn DataChannel) {
        let this = self.this.clone();
        channel.on_message(Box::new(move |message| {
            if let Some(participant) = this.upgrade() {
                participant.emit(ParticipantEvent::Message(message));
            }
        }));
    }

    fn on_peer_event(&self, event: PeerConnectionEvent) {
        match event {
            PeerConnectionEvent::IceCandidate(Some(candidate)) => {
                self.announce(SignalingEvent::candidate(
                    self.room.participant_id.clone(),
                    self.id.clone(),
                    self.room.id.clone(),
                    candidate,
                ));
            }
            PeerConnectionEvent::IceCandidate(None) => {
                debug!("Participant {}: ICE gathering complete", self.id);
            }
            PeerConnectionEvent::ConnectionStateChange(state) => {
                debug!("Participant {}: connection {:?}", self.id, state);
                if state.is_terminal() {
                    self.emit(ParticipantEvent::Disconnected);
                }
            }
            PeerConnectionEvent::IceConnectionStateChange(state) => {
                debug!("Participant {}: ICE connection {:?}", self.id, state);
                if state.is_terminal() {
                    self.emit(ParticipantEvent::Disconnected);
                }
            }
            PeerConnectionEvent::NegotiationNeeded => self.enqueue(Inbound::Negotiate {
                remote: None,
                report: None,
            }),
            PeerConnectionEvent::DataChannel(channel) => {
                debug!("Participant {}: inbound data channel {}", self.id, channel.label());
                self.install_message_handler(channel.as_ref());
                *self.channel_slot() = Some(channel);
            }
            PeerConnectionEvent::Track(track) => {
                self.emit(ParticipantEvent::Track(track));
            }
        }
    }

    fn emit(&self, event: ParticipantEvent) {
        if self.is_closed() {
            return;
        }
        self.dispatcher.dispatch(&event);
    }

    fn announce(&self, event: SignalingEvent) {
        if self.is_closed() {
            return;
        }
        debug!("Participant {}: sending {:?}", self.id, event.kind);
        self.room.outbound.dispatch(&event);
    }

    fn channel_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn DataChannel>>> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drain primitive notifications and queued signaling work for as long as
/// the participant is alive. Work for one participant never overlaps.
async fn event_loop(
    participant: Weak<Participant>,
    mut peer_events: mpsc::UnboundedReceiver<PeerConnectionEvent>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
) {
    loop {
        let work = tokio::select! {
            Some(event) = peer_events.recv() => Work::Peer(event),
            Some(work) = inbound.recv() => Work::Inbound(work),
            else => break,
        };
        let Some(participant) = participant.upgrade() else {
            break;
        };
        match work {
            Work::Peer(event) => participant.on_peer_event(event),
            Work::Inbound(work) => participant.on_inbound(work).await,
        }
    }
}

fn channel_label() -> String {
    let mut rng = rand::rng();
    (0..CHANNEL_LABEL_LEN)
        .map(|_| HEX_CHARS[rng.random_range(0..HEX_CHARS.len())] as char)
        .collect()
}
