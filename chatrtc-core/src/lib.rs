//! ChatRTC - one-to-one calls negotiated over a chat-message stream
//!
//! This library adds audio/video calling to an existing two-person chat. The
//! chat session itself is the signaling channel: offers, answers, ICE
//! candidates and control notices travel as ordinary text lines, and the
//! media flows over a direct WebRTC peer connection. It features:
//!
//! - **Chat-line Signaling**: Prefix plus JSON wire format, tolerant of ordinary chat text
//! - **Race-free Lifecycle**: One call per chat session, duplicate and late triggers are no-ops
//! - **Graceful Media Fallback**: Audio+video first, audio-only when the camera is unavailable
//! - **Camera Switching**: Front/back swap without renegotiation
//! - **Hosted Calls**: Optional invite/accept flow for an external conferencing service
//!
//! # Examples
//!
//! ```rust,no_run
//! use chatrtc_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), CallError> {
//! let room = ChatRoom::new();
//! let alice = CallController::builder("alice", "chat-42", Arc::new(room.join("alice")))
//!     .with_config(CallConfig::default())
//!     .build()?;
//!
//! // Process the chat stream in the background
//! let _listener = alice.spawn();
//!
//! // Place a call to the other chat member
//! let call_id = alice.start("bob").await?;
//! println!("Calling: {call_id}");
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Participant identity
pub mod identity;

/// Core call types and data structures
pub mod types;

/// Call configuration
pub mod config;

/// Event publishing to the UI layer
pub mod notify;

/// Camera and microphone acquisition
pub mod media;

/// Front/back camera switching
pub mod camera;

/// Peer connection negotiation
pub mod peer;

/// `webrtc` crate backend for peer connections
pub mod rtc;

/// Chat-line wire format
pub mod codec;

/// Signaling protocol and handlers
pub mod signaling;

/// In-memory chat transport
pub mod transport;

/// Hosted conferencing service seam
pub mod hosted;

/// Peer-to-peer and hosted call flows
pub mod strategy;

/// Call lifecycle control
pub mod call;

/// Test doubles for the connection and hosted-service seams
pub mod testing;

// Re-export main types at crate root
pub use call::{CallController, CallControllerBuilder, CallError};
pub use camera::CameraSwitcher;
pub use codec::{ChatTextCodec, DecodeError, SignalingCodec};
pub use config::{CallConfig, ConfigError, IceServerConfig};
pub use hosted::{HostedCallClient, HostedError};
pub use identity::ParticipantId;
pub use media::{
    DeviceAccess, LocalStream, LocalTrack, MediaAcquisitionManager, MediaDevices, MediaError,
    MediaState, SyntheticDevices,
};
pub use notify::Notifier;
pub use peer::{
    IceCandidate, NegotiationState, PeerConnectionBackend, PeerConnectionFactory,
    PeerConnectionManager, PeerError, PeerEvent, PeerObserver, SessionDescription,
};
pub use rtc::WebRtcPeerFactory;
pub use signaling::{
    InboundPayload, SignalingHandler, SignalingMessage, SignalingTransport, TransportError,
};
pub use transport::{ChatRoom, ChatRoomMember};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallController, CallError};
    pub use crate::config::CallConfig;
    pub use crate::identity::ParticipantId;
    pub use crate::signaling::{InboundPayload, SignalingMessage, SignalingTransport};
    pub use crate::transport::ChatRoom;
    pub use crate::types::{CallEvent, CallId, CallPhase, Notice, StrategyKind};
}
