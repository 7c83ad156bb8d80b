use serde::{Deserialize, Serialize};

use super::types::{Identifiable, MemberId, RoomId};
use crate::dispatcher::Event;
use crate::error::Error;

/// Name under which outbound signaling events are dispatched
pub const SEND_EVENT: &str = "send";

/// Kind of a signaling message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalingEventType {
    /// A member announces itself to the room
    Connect,
    /// A member leaves the room
    Disconnect,
    Offer,
    Answer,
    Candidate,
}

impl SignalingEventType {
    /// Broadcast kinds carry neither callee nor payload
    pub fn is_broadcast(self) -> bool {
        matches!(self, Self::Connect | Self::Disconnect)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description exchanged in OFFER and ANSWER events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Discards an uncommitted local offer
    pub fn rollback() -> Self {
        Self {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        }
    }
}

/// ICE candidate exchanged in CANDIDATE events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Kind-dependent payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

/// Envelope exchanged with the signaling channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingEvent {
    #[serde(rename = "type")]
    pub kind: SignalingEventType,
    pub caller: Option<Identifiable<MemberId>>,
    pub callee: Option<Identifiable<MemberId>>,
    pub room: Identifiable<RoomId>,
    pub payload: Option<Payload>,
}

impl SignalingEvent {
    pub fn connect(caller: MemberId, room: RoomId) -> Self {
        Self::broadcast(SignalingEventType::Connect, caller, room)
    }

    pub fn disconnect(caller: MemberId, room: RoomId) -> Self {
        Self::broadcast(SignalingEventType::Disconnect, caller, room)
    }

    pub fn offer(
        caller: MemberId,
        callee: MemberId,
        room: RoomId,
        description: SessionDescription,
    ) -> Self {
        Self::directed(
            SignalingEventType::Offer,
            caller,
            callee,
            room,
            Payload::Description(description),
        )
    }

    pub fn answer(
        caller: MemberId,
        callee: MemberId,
        room: RoomId,
        description: SessionDescription,
    ) -> Self {
        Self::directed(
            SignalingEventType::Answer,
            caller,
            callee,
            room,
            Payload::Description(description),
        )
    }

    pub fn candidate(
        caller: MemberId,
        callee: MemberId,
        room: RoomId,
        candidate: IceCandidate,
    ) -> Self {
        Self::directed(
            SignalingEventType::Candidate,
            caller,
            callee,
            room,
            Payload::Candidate(candidate),
        )
    }

    fn broadcast(kind: SignalingEventType, caller: MemberId, room: RoomId) -> Self {
        Self {
            kind,
            caller: Some(caller.into()),
            callee: None,
            room: room.into(),
            payload: None,
        }
    }

    fn directed(
        kind: SignalingEventType,
        caller: MemberId,
        callee: MemberId,
        room: RoomId,
        payload: Payload,
    ) -> Self {
        Self {
            kind,
            caller: Some(caller.into()),
            callee: Some(callee.into()),
            room: room.into(),
            payload: Some(payload),
        }
    }

    pub fn caller_id(&self) -> Option<&MemberId> {
        self.caller.as_ref().map(|c| &c.id)
    }

    pub fn callee_id(&self) -> Option<&MemberId> {
        self.callee.as_ref().map(|c| &c.id)
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room.id
    }

    pub fn description(&self) -> Option<&SessionDescription> {
        match &self.payload {
            Some(Payload::Description(desc)) => Some(desc),
            _ => None,
        }
    }

    pub fn ice_candidate(&self) -> Option<&IceCandidate> {
        match &self.payload {
            Some(Payload::Candidate(candidate)) => Some(candidate),
            _ => None,
        }
    }

    /// Check that the payload shape and identities agree with the kind
    pub fn validate(&self) -> Result<(), Error> {
        if self.caller.is_none() {
            return Err(Error::InvalidEvent(format!("{:?} without caller", self.kind)));
        }

        let payload_ok = match self.kind {
            SignalingEventType::Connect | SignalingEventType::Disconnect => {
                self.payload.is_none()
            }
            SignalingEventType::Offer | SignalingEventType::Answer => self.description().is_some(),
            SignalingEventType::Candidate => self.ice_candidate().is_some(),
        };
        if !payload_ok {
            return Err(Error::InvalidEvent(format!(
                "payload does not match {:?}",
                self.kind
            )));
        }

        if !self.kind.is_broadcast() && self.callee.is_none() {
            return Err(Error::InvalidEvent(format!("{:?} without callee", self.kind)));
        }

        Ok(())
    }

    /// Decode and validate a wire message
    pub fn from_json(text: &str) -> Result<Self, Error> {
        let event: SignalingEvent = serde_json::from_str(text)?;
        event.validate()?;
        Ok(event)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Event for SignalingEvent {
    fn name(&self) -> &'static str {
        SEND_EVENT
    }
}
