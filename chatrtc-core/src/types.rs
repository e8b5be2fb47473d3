//! Call types and data structures

use crate::identity::ParticipantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a call
///
/// Derived from the sorted participant pair plus a millisecond timestamp, so
/// both sides of a conversation produce the same shape of id and repeated
/// calls between the same pair stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Derive the call id for a call between `a` and `b` started at `at`
    pub fn derive(a: &ParticipantId, b: &ParticipantId, at: DateTime<Utc>) -> Self {
        let (low, high) = ParticipantId::sorted_pair(a, b);
        Self(format!("call_{}_{}_{}", low, high, at.timestamp_millis()))
    }

    /// Wrap a call id received from the wire
    pub fn from_wire(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the negotiation the local participant plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Started the call and sends the offer
    Initiator,
    /// Received the call and sends the answer
    Responder,
}

/// Physical camera selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// User-facing camera
    #[default]
    Front,
    /// Environment-facing camera
    Back,
}

impl FacingMode {
    /// The other camera
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Front => Self::Back,
            Self::Back => Self::Front,
        }
    }
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

/// Call transport used for a session, fixed when the session starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StrategyKind {
    /// Direct peer connection negotiated with offer/answer/ICE
    #[default]
    PeerToPeer,
    /// Hosted conferencing room joined by both parties
    Hosted,
}

/// One negotiation attempt between two participants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    /// Call identifier
    pub call_id: CallId,
    /// Who started the call
    pub initiator_id: ParticipantId,
    /// Who was called
    pub responder_id: ParticipantId,
    /// Local role, never changes
    pub role: Role,
    /// Call transport
    pub strategy: StrategyKind,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    /// Session for a call the local participant starts
    pub fn outgoing(local: ParticipantId, remote: ParticipantId, strategy: StrategyKind) -> Self {
        let created_at = Utc::now();
        Self {
            call_id: CallId::derive(&local, &remote, created_at),
            initiator_id: local,
            responder_id: remote,
            role: Role::Initiator,
            strategy,
            created_at,
        }
    }

    /// Session for a call the remote participant started
    pub fn incoming(
        call_id: CallId,
        local: ParticipantId,
        remote: ParticipantId,
        strategy: StrategyKind,
    ) -> Self {
        Self {
            call_id,
            initiator_id: remote,
            responder_id: local,
            role: Role::Responder,
            strategy,
            created_at: Utc::now(),
        }
    }

    /// The local participant
    pub fn local_id(&self) -> &ParticipantId {
        match self.role {
            Role::Initiator => &self.initiator_id,
            Role::Responder => &self.responder_id,
        }
    }

    /// The remote participant
    pub fn remote_id(&self) -> &ParticipantId {
        match self.role {
            Role::Initiator => &self.responder_id,
            Role::Responder => &self.initiator_id,
        }
    }
}

/// Call lifecycle phase as seen by the local participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CallPhase {
    /// No call
    #[default]
    Idle,
    /// Incoming call waiting for accept or decline
    Ringing,
    /// Capturing local camera and microphone
    AcquiringMedia,
    /// Exchanging descriptions and candidates
    NegotiatingConnection,
    /// Media is flowing
    Active,
    /// Call finished normally
    Ended,
    /// Responder rejected the call
    Declined,
    /// Setup or connectivity failed
    Failed,
}

impl CallPhase {
    /// Ended, Declined and Failed admit no further transitions for the session
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Declined | Self::Failed)
    }

    /// A session exists and has not finished
    pub fn is_in_call(self) -> bool {
        !self.is_terminal() && self != Self::Idle
    }
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Constructed, nothing negotiated yet
    #[default]
    New,
    /// Negotiation or ICE checks in progress
    Connecting,
    /// Media path established
    Connected,
    /// Transient loss of connectivity
    Disconnected,
    /// Unrecoverable ICE or negotiation failure
    Failed,
    /// Torn down locally
    Closed,
}

impl ConnectionState {
    /// Failed and Closed are only left by building a new connection
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// Whether moving from `self` to `next` is allowed
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Closed, Connected, Connecting, Disconnected, Failed, New};
        if self.is_terminal() || self == next {
            return false;
        }
        matches!(
            (self, next),
            (New, Connecting)
                | (Connecting, Connected)
                | (Connected, Disconnected)
                | (Disconnected, Connected)
                | (Disconnected, Connecting)
                | (_, Failed)
                | (_, Closed)
        )
    }
}

/// Failure taxonomy surfaced to users and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Camera and microphone access refused
    PermissionDenied,
    /// Device missing or busy
    DeviceUnavailable,
    /// Offer, answer or description failure
    Negotiation,
    /// ICE or connection reached Failed
    Connectivity,
    /// Malformed signaling payload
    TransportDecode,
    /// Message from a non-participant or for another call
    SessionMismatch,
}

/// User-visible notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notice {
    /// Degraded but continuing
    Warning {
        /// Text shown to the user
        message: String,
    },
    /// Blocking error
    Error {
        /// Failure class
        kind: ErrorKind,
        /// Text shown to the user
        message: String,
        /// Whether the UI should offer a retry action
        retryable: bool,
    },
    /// Positive confirmation
    Success {
        /// Text shown to the user
        message: String,
    },
}

/// Events published to the UI layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// Remote participant is calling; show the pickup prompt
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Caller
        from: ParticipantId,
        /// Call transport requested by the caller
        strategy: StrategyKind,
    },
    /// Lifecycle phase changed
    PhaseChanged {
        /// Call identifier
        call_id: CallId,
        /// New phase
        phase: CallPhase,
    },
    /// Peer connection state changed
    ConnectionStateChanged {
        /// New state
        state: ConnectionState,
    },
    /// First remote stream of the call arrived
    RemoteStreamAdded {
        /// Remote stream identifier
        stream_id: String,
    },
    /// Remote stream is gone
    RemoteStreamEnded,
    /// User-visible notification
    Notice(Notice),
}
