//! Mesh orchestration: one participant per remote member of a session

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::connection::{DataMessage, LocalStream, PeerConnectionFactory};
use crate::dispatcher::{Event, EventDispatcher};
use crate::error::Error;
use crate::participant::{Inbound, Participant};
use crate::signaling::{
    MemberId, RoomId, SessionDescription, SignalingEvent, SignalingEventType,
};

pub const PARTICIPANT_EVENT: &str = "participant";
pub const ERROR_EVENT: &str = "error";

/// Room state shared read-only with every participant
pub(crate) struct RoomContext {
    pub id: RoomId,
    pub participant_id: MemberId,
    pub configuration: Arc<Configuration>,
    /// Externally owned dispatcher for outbound signaling
    pub outbound: Arc<EventDispatcher<SignalingEvent>>,
    pub stream: Option<LocalStream>,
    pub factory: Arc<dyn PeerConnectionFactory>,
}

/// Local observer events of a room
#[derive(Debug)]
pub enum RoomEvent {
    /// A participant was created; register its handlers here
    Participant(Arc<Participant>),
    Error(Error),
}

impl Event for RoomEvent {
    fn name(&self) -> &'static str {
        match self {
            RoomEvent::Participant(_) => PARTICIPANT_EVENT,
            RoomEvent::Error(_) => ERROR_EVENT,
        }
    }
}

pub struct Room {
    context: Arc<RoomContext>,
    dispatcher: Arc<EventDispatcher<RoomEvent>>,
    /// Insertion-ordered, at most one entry per member id
    participants: Mutex<Vec<Arc<Participant>>>,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.context.id)
            .field("participant_id", &self.context.participant_id)
            .field("participants", &self.participant_ids())
            .finish()
    }
}

impl Room {
    /// Join the session `id` under a fresh member identity.
    ///
    /// Announces CONNECT on `outbound` before returning.
    pub fn new(
        id: impl Into<RoomId>,
        configuration: Arc<Configuration>,
        outbound: Arc<EventDispatcher<SignalingEvent>>,
        factory: Arc<dyn PeerConnectionFactory>,
        stream: Option<LocalStream>,
    ) -> Self {
        let context = Arc::new(RoomContext {
            id: id.into(),
            participant_id: MemberId::generate(),
            configuration,
            outbound,
            stream,
            factory,
        });

        info!("Joining room {} as {}", context.id, context.participant_id);
        context.outbound.dispatch(&SignalingEvent::connect(
            context.participant_id.clone(),
            context.id.clone(),
        ));

        Self {
            context,
            dispatcher: Arc::new(EventDispatcher::new()),
            participants: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.context.id
    }

    pub fn participant_id(&self) -> &MemberId {
        &self.context.participant_id
    }

    pub fn configuration(&self) -> &Configuration {
        &self.context.configuration
    }

    pub fn stream(&self) -> Option<&LocalStream> {
        self.context.stream.as_ref()
    }

    pub fn on<F>(&self, event: &str, handler: F) -> &Self
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        self.dispatcher.register(event, handler);
        self
    }

    pub fn participant(&self, id: &MemberId) -> Option<Arc<Participant>> {
        self.participants().iter().find(|p| p.id() == id).cloned()
    }

    pub fn participant_ids(&self) -> Vec<MemberId> {
        self.participants().iter().map(|p| p.id().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.participants().len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants().is_empty()
    }

    /// Send `payload` to every participant with an open data channel.
    /// Returns how many participants accepted it.
    pub fn send(&self, payload: &DataMessage) -> usize {
        let participants = self.participants().clone();
        participants.iter().filter(|p| p.send(payload)).count()
    }

    /// Announce departure and close every participant
    pub fn disconnect(&self) {
        info!("Leaving room {}", self.context.id);
        self.context.outbound.dispatch(&SignalingEvent::disconnect(
            self.context.participant_id.clone(),
            self.context.id.clone(),
        ));

        let participants = std::mem::take(&mut *self.participants());
        for participant in participants {
            participant.close();
        }
    }

    /// Route one inbound signaling event.
    ///
    /// Negotiation runs on the addressed participant's own event loop, so a
    /// slow member never holds up routing for the others.
    pub fn on_signaling_event(&self, event: &SignalingEvent) {
        if event.room_id() != &self.context.id {
            debug!("Ignoring event for room {}", event.room_id());
            return;
        }
        let Some(caller) = event.caller_id().cloned() else {
            debug!("Ignoring {:?} without caller", event.kind);
            return;
        };
        if caller == self.context.participant_id {
            return;
        }
        if let Some(callee) = event.callee_id()
            && callee != &self.context.participant_id
        {
            debug!("Ignoring {:?} addressed to {}", event.kind, callee);
            return;
        }

        match event.kind {
            SignalingEventType::Connect => self.on_contact(caller, None),
            SignalingEventType::Offer => match event.description() {
                Some(description) => self.on_contact(caller, Some(description.clone())),
                None => debug!("Ignoring OFFER from {} without description", caller),
            },
            SignalingEventType::Answer | SignalingEventType::Candidate => {
                match self.participant(&caller) {
                    Some(participant) => participant.enqueue(Inbound::Signal(event.clone())),
                    None => debug!("Dropping {:?} from unknown member {}", event.kind, caller),
                }
            }
            SignalingEventType::Disconnect => self.on_disconnect(&caller),
        }
    }

    /// Drain inbound events in arrival order until the channel closes
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<SignalingEvent>) {
        while let Some(event) = inbound.recv().await {
            self.on_signaling_event(&event);
        }
        info!("Signaling channel for room {} closed", self.context.id);
    }

    /// CONNECT or OFFER: negotiate with a known member, or admit a new one
    fn on_contact(&self, caller: MemberId, remote: Option<SessionDescription>) {
        match self.find_or_create(caller) {
            Ok((participant, false)) => participant.enqueue(Inbound::Negotiate {
                remote,
                report: None,
            }),
            Ok((participant, true)) => {
                self.dispatcher
                    .dispatch(&RoomEvent::Participant(participant.clone()));
                let dispatcher = self.dispatcher.clone();
                participant.enqueue(Inbound::Negotiate {
                    remote,
                    report: Some(Box::new(move |e: Error| {
                        dispatcher.dispatch(&RoomEvent::Error(e));
                    })),
                });
            }
            Err(e) => {
                warn!("Failed to create participant: {}", e);
                self.dispatcher.dispatch(&RoomEvent::Error(e));
            }
        }
    }

    /// Returns the participant and whether it was just created
    fn find_or_create(&self, caller: MemberId) -> Result<(Arc<Participant>, bool), Error> {
        let mut participants = self.participants();
        if let Some(existing) = participants.iter().find(|p| p.id() == &caller) {
            return Ok((existing.clone(), false));
        }

        let participant = Participant::new(caller, self.context.clone())?;
        participants.push(participant.clone());
        Ok((participant, true))
    }

    fn on_disconnect(&self, caller: &MemberId) {
        let removed = {
            let mut participants = self.participants();
            participants
                .iter()
                .position(|p| p.id() == caller)
                .map(|index| participants.remove(index))
        };

        match removed {
            Some(participant) => {
                info!("Member {} left room {}", caller, self.context.id);
                participant.close();
            }
            None => debug!("DISCONNECT from unknown member {}", caller),
        }
    }

    fn participants(&self) -> MutexGuard<'_, Vec<Arc<Participant>>> {
        self.participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        let participants = std::mem::take(&mut *self.participants());
        for participant in participants {
            participant.close();
        }
    }
}
