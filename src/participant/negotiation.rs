//! Explicit offer/answer state machine

use crate::connection::SignalingState;
use crate::signaling::SdpType;

/// Local negotiation role of a participant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NegotiationState {
    /// No negotiation started
    #[default]
    Idle,
    /// Local offer being produced or awaiting the remote answer
    Offering,
    /// Remote offer applied, local answer in progress
    Answering,
    Stable,
    Closed,
}

/// What triggered a negotiation round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationInput {
    /// This side originates (no remote description)
    Originate,
    /// A remote description of the given type arrived
    Remote(SdpType),
}

/// Work to perform for one input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Produce a local offer and commit it if the primitive is still stable
    Offer,
    /// Apply a remote offer and answer it; `rollback` discards a pending local offer first
    Answer { rollback: bool },
    /// Apply a remote description that needs no reply
    Apply,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub step: Step,
    /// State while the step runs
    pub pending: NegotiationState,
    /// State once the step completed
    pub settled: NegotiationState,
}

impl NegotiationState {
    /// Decide the next step from the current state, the input and the
    /// primitive's signaling status.
    ///
    /// An incoming offer always wins over a local one: when the primitive is
    /// not stable the pending local offer is rolled back before the remote
    /// offer is applied.
    pub fn transition(self, input: NegotiationInput, signaling: SignalingState) -> Transition {
        let ignore = Transition {
            step: Step::Ignore,
            pending: self,
            settled: self,
        };

        if self == NegotiationState::Closed || signaling == SignalingState::Closed {
            return Transition {
                pending: NegotiationState::Closed,
                settled: NegotiationState::Closed,
                ..ignore
            };
        }

        match input {
            NegotiationInput::Originate => Transition {
                step: Step::Offer,
                pending: NegotiationState::Offering,
                settled: NegotiationState::Offering,
            },
            NegotiationInput::Remote(SdpType::Offer) => Transition {
                step: Step::Answer {
                    rollback: signaling != SignalingState::Stable,
                },
                pending: NegotiationState::Answering,
                settled: NegotiationState::Stable,
            },
            NegotiationInput::Remote(SdpType::Answer) | NegotiationInput::Remote(SdpType::Rollback) => {
                Transition {
                    step: Step::Apply,
                    pending: self,
                    settled: NegotiationState::Stable,
                }
            }
            NegotiationInput::Remote(SdpType::Pranswer) => Transition {
                step: Step::Apply,
                pending: self,
                settled: NegotiationState::Offering,
            },
        }
    }

    /// State to fall back to when a step failed, given the state the round
    /// started from and where the primitive ended up.
    pub fn recover(self, signaling: SignalingState) -> NegotiationState {
        match signaling {
            SignalingState::Closed => NegotiationState::Closed,
            SignalingState::HaveLocalOffer | SignalingState::HaveRemotePranswer => {
                NegotiationState::Offering
            }
            SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer => {
                NegotiationState::Answering
            }
            SignalingState::Stable => match self {
                NegotiationState::Idle => NegotiationState::Idle,
                NegotiationState::Closed => NegotiationState::Closed,
                _ => NegotiationState::Stable,
            },
        }
    }
}
