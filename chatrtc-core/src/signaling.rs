//! Call signaling over a chat-message stream
//!
//! Signaling travels as ordinary lines in the chat session between the two
//! participants. [`SignalingTransport`] is the chat system's send/subscribe
//! surface; [`SignalingHandler`] binds it to one session, encodes outgoing
//! messages and filters inbound lines down to the ones meant for us.

use crate::codec::{DecodeError, SignalingCodec};
use crate::identity::ParticipantId;
use crate::peer::IceCandidate;
use crate::types::{CallId, StrategyKind};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

/// Largest payload accepted from the transport (64KB)
const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Signaling messages exchanged between the two participants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Hosted call invitation
    Invite {
        /// Call to join
        call_id: CallId,
    },
    /// SDP offer
    Offer {
        /// SDP text
        sdp: String,
    },
    /// SDP answer
    Answer {
        /// SDP text
        sdp: String,
    },
    /// Trickled ICE candidate
    IceCandidate {
        /// Candidate
        candidate: IceCandidate,
    },
    /// Hosted call accepted
    Accepted,
    /// Call rejected
    Declined {
        /// Flow whose wire literal carries the rejection
        strategy: StrategyKind,
    },
    /// Call finished
    Ended,
}

impl SignalingMessage {
    /// Short name for logs
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Invite { .. } => "invite",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::Accepted => "accepted",
            Self::Declined { .. } => "declined",
            Self::Ended => "ended",
        }
    }

    /// Whether the message ends the call for both sides
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Declined { .. } | Self::Ended)
    }
}

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Chat session unknown to the transport
    #[error("Unknown chat session: {0}")]
    UnknownSession(String),

    /// Sending failed
    #[error("Send error: {0}")]
    SendError(String),

    /// Transport shut down
    #[error("Transport closed")]
    Closed,
}

/// One line received from the chat stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPayload {
    /// Raw line
    pub payload: String,
    /// Author of the line
    pub sender_id: ParticipantId,
}

/// Ordered chat-message stream used as the signaling channel
///
/// Implementations deliver every line of the session, in order, to every
/// subscriber, including lines the subscriber wrote itself.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Post `payload` to the chat session
    async fn send(&self, session_id: &str, payload: String) -> Result<(), TransportError>;

    /// Stream the lines of the chat session from now on
    fn subscribe(&self, session_id: &str) -> BoxStream<'static, InboundPayload>;
}

/// Binds a transport and codec to one chat session and local participant
pub struct SignalingHandler {
    transport: Arc<dyn SignalingTransport>,
    codec: Arc<dyn SignalingCodec>,
    session_id: String,
    local_id: ParticipantId,
}

impl SignalingHandler {
    /// Create a handler for `session_id` as `local_id`
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        codec: Arc<dyn SignalingCodec>,
        session_id: impl Into<String>,
        local_id: ParticipantId,
    ) -> Self {
        Self {
            transport,
            codec,
            session_id: session_id.into(),
            local_id,
        }
    }

    /// Chat session id
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Local participant
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Encode and send a message
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the payload
    #[tracing::instrument(skip(self, message), fields(session = %self.session_id, message_type = message.label()))]
    pub async fn send(&self, message: &SignalingMessage) -> Result<(), TransportError> {
        let payload = self.codec.encode(message);
        tracing::debug!(len = payload.len(), "Sending signaling message");
        self.transport.send(&self.session_id, payload).await
    }

    /// Subscribe to the session's inbound lines
    pub fn subscribe(&self) -> BoxStream<'static, InboundPayload> {
        self.transport.subscribe(&self.session_id)
    }

    /// Turn an inbound line into a message from the remote participant
    ///
    /// Returns `None` for self-echo, ordinary chat text, oversized payloads and
    /// malformed signaling, which is logged and dropped.
    pub fn interpret(&self, inbound: &InboundPayload) -> Option<(ParticipantId, SignalingMessage)> {
        if inbound.sender_id == self.local_id {
            tracing::trace!(session = %self.session_id, "Ignoring self-echo");
            return None;
        }
        if inbound.payload.len() > MAX_PAYLOAD_SIZE {
            tracing::warn!(
                session = %self.session_id,
                len = inbound.payload.len(),
                max = MAX_PAYLOAD_SIZE,
                "Dropping oversized signaling payload"
            );
            return None;
        }
        match self.codec.decode(&inbound.payload) {
            Ok(message) => {
                tracing::debug!(
                    session = %self.session_id,
                    from = %inbound.sender_id,
                    message_type = message.label(),
                    "Received signaling message"
                );
                Some((inbound.sender_id.clone(), message))
            }
            Err(DecodeError::NotSignaling) => None,
            Err(error) => {
                tracing::warn!(
                    session = %self.session_id,
                    from = %inbound.sender_id,
                    %error,
                    "Discarding malformed signaling message"
                );
                None
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::codec::ChatTextCodec;
    use crate::transport::ChatRoom;
    use futures::StreamExt;

    fn handler(room: &ChatRoom, who: &str) -> SignalingHandler {
        SignalingHandler::new(
            Arc::new(room.join(who)),
            Arc::new(ChatTextCodec::default()),
            "chat-1",
            ParticipantId::new(who),
        )
    }

    fn inbound(payload: &str, sender: &str) -> InboundPayload {
        InboundPayload {
            payload: payload.to_string(),
            sender_id: ParticipantId::new(sender),
        }
    }

    #[test]
    fn test_interpret_filters_self_and_noise() {
        let room = ChatRoom::new();
        let alice = handler(&room, "alice");

        assert!(alice.interpret(&inbound("VIDEO_CALL_END", "alice")).is_none());
        assert!(alice.interpret(&inbound("see you at 5", "bob")).is_none());
        assert!(alice.interpret(&inbound("VIDEO_CALL_ICE:{", "bob")).is_none());
        let oversized = format!("VIDEO_CALL_OFFER:{}", "x".repeat(MAX_PAYLOAD_SIZE));
        assert!(alice.interpret(&inbound(&oversized, "bob")).is_none());

        let (from, message) = alice.interpret(&inbound("VIDEO_CALL_END", "bob")).unwrap();
        assert!(message.is_terminal());
        assert_eq!(from.as_str(), "bob");
        assert_eq!(message, SignalingMessage::Ended);
    }

    #[tokio::test]
    async fn test_send_reaches_other_member_in_order() {
        let room = ChatRoom::new();
        let alice = handler(&room, "alice");
        let bob = handler(&room, "bob");
        let mut inbound = bob.subscribe();

        alice.send(&SignalingMessage::Accepted).await.unwrap();
        alice.send(&SignalingMessage::Ended).await.unwrap();

        let first = inbound.next().await.unwrap();
        let second = inbound.next().await.unwrap();
        assert_eq!(bob.interpret(&first).unwrap().1, SignalingMessage::Accepted);
        assert_eq!(bob.interpret(&second).unwrap().1, SignalingMessage::Ended);
    }
}
