//! Peer connection management
//!
//! [`PeerConnectionManager`] drives one peer connection per call session
//! through offer/answer and trickled ICE. Remote candidates that arrive before
//! the remote description are buffered and applied in arrival order once it
//! is set. The connection itself sits behind [`PeerConnectionBackend`] so the
//! negotiation logic runs the same against `webrtc` and in-memory doubles.

use crate::config::IceServerConfig;
use crate::media::{LocalStream, LocalTrack};
use crate::notify::Notifier;
use crate::types::{CallEvent, CallId, ConnectionState, ErrorKind, Role, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

/// Peer connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// No connection has been built yet
    #[error("Peer connection not initialized")]
    NotInitialized,

    /// Operation belongs to the other role
    #[error("Operation not valid for {0:?}")]
    WrongRole(Role),

    /// Connection was torn down
    #[error("Peer connection closed")]
    Closed,

    /// Description does not fit the negotiation step
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// Underlying WebRTC stack failed
    #[error("Peer connection backend error: {0}")]
    Backend(String),
}

/// SDP description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// SDP session description, `{"type": "offer", "sdp": "..."}` on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpType,
    /// SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Trickled ICE candidate in `RTCIceCandidateInit` JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the attribute line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Events raised by a backend connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Local ICE candidate discovered
    LocalCandidate(IceCandidate),
    /// Backend connection state changed
    StateChanged(ConnectionState),
    /// Remote track arrived
    RemoteTrack {
        /// Remote stream the track belongs to
        stream_id: String,
        /// Remote track id
        track_id: String,
        /// Audio or video
        kind: TrackKind,
    },
}

/// What an offer asks to receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    /// Ask the remote side for audio
    pub receive_audio: bool,
    /// Ask the remote side for video
    pub receive_video: bool,
}

impl Default for OfferOptions {
    fn default() -> Self {
        Self {
            receive_audio: true,
            receive_video: true,
        }
    }
}

/// One live peer connection
#[async_trait]
pub trait PeerConnectionBackend: Send + Sync {
    /// Attach a local track
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Swap the sender of the same kind over to `track`
    async fn replace_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Create an offer
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, PeerError>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply a local description
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote description
    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Close the connection
    async fn close(&self) -> Result<(), PeerError>;
}

/// Builds backend connections
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Build a connection that reports through `events`
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnectionBackend>, PeerError>;
}

/// Receives connection callbacks on behalf of the call flow
#[async_trait]
pub trait PeerObserver: Send + Sync {
    /// A local candidate should be sent to the remote party
    async fn on_local_candidate(&self, candidate: IceCandidate);

    /// Connection state changed
    async fn on_connection_state(&self, _state: ConnectionState) {}

    /// First remote stream of the call arrived
    async fn on_remote_stream(&self, _stream_id: &str) {}
}

/// Snapshot of the negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NegotiationState {
    /// Connection state
    pub connection_state: ConnectionState,
    /// A local description has been applied
    pub local_description_set: bool,
    /// A remote description has been applied
    pub remote_description_set: bool,
    /// Remote candidates waiting for the remote description
    pub pending_remote_candidates: usize,
}

#[derive(Default)]
struct PeerInner {
    state: ConnectionState,
    local_description_set: bool,
    remote_description_set: bool,
    pending: VecDeque<IceCandidate>,
    backend: Option<Arc<dyn PeerConnectionBackend>>,
    remote_stream: Option<String>,
    closed: bool,
}

struct Shared {
    call_id: CallId,
    notifier: Notifier,
    inner: Mutex<PeerInner>,
}

impl Shared {
    /// Apply a state transition, publishing it when the machine accepts it
    fn transition(&self, next: ConnectionState) -> bool {
        let previous = {
            let mut inner = self.inner.lock();
            if inner.closed || !inner.state.can_transition_to(next) {
                tracing::trace!(call_id = %self.call_id, from = ?inner.state, to = ?next, "Ignoring connection state");
                return false;
            }
            std::mem::replace(&mut inner.state, next)
        };
        tracing::info!(call_id = %self.call_id, from = ?previous, to = ?next, "Connection state changed");
        self.notifier
            .emit(CallEvent::ConnectionStateChanged { state: next });
        match next {
            ConnectionState::Connected => self.notifier.success("Call connected"),
            ConnectionState::Failed => self.notifier.error(
                ErrorKind::Connectivity,
                "Connection failed. Check your network and try again.",
                true,
            ),
            _ => {}
        }
        true
    }

    async fn handle(&self, event: PeerEvent, observer: &dyn PeerObserver) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if self.inner.lock().closed {
                    return;
                }
                observer.on_local_candidate(candidate).await;
            }
            PeerEvent::StateChanged(state) => {
                if self.transition(state) {
                    observer.on_connection_state(state).await;
                }
            }
            PeerEvent::RemoteTrack {
                stream_id,
                track_id,
                kind,
            } => {
                {
                    let mut inner = self.inner.lock();
                    if inner.closed || inner.remote_stream.is_some() {
                        tracing::debug!(call_id = %self.call_id, %track_id, ?kind, "Additional remote track");
                        return;
                    }
                    inner.remote_stream = Some(stream_id.clone());
                }
                tracing::info!(call_id = %self.call_id, %stream_id, %track_id, ?kind, "Remote stream added");
                self.notifier.emit(CallEvent::RemoteStreamAdded {
                    stream_id: stream_id.clone(),
                });
                observer.on_remote_stream(&stream_id).await;
            }
        }
    }
}

/// Owns the peer connection of one call session
///
/// Created with the session so remote candidates can be buffered before the
/// connection exists. Description and candidate operations are serialized, so
/// candidates are applied in the order they were handed in.
pub struct PeerConnectionManager {
    role: Role,
    factory: Arc<dyn PeerConnectionFactory>,
    ice_servers: Vec<IceServerConfig>,
    shared: Arc<Shared>,
    ops: tokio::sync::Mutex<()>,
    shutdown: Arc<Notify>,
}

impl PeerConnectionManager {
    /// Create a manager for one session
    pub fn new(
        call_id: CallId,
        role: Role,
        factory: Arc<dyn PeerConnectionFactory>,
        ice_servers: Vec<IceServerConfig>,
        notifier: Notifier,
    ) -> Self {
        Self {
            role,
            factory,
            ice_servers,
            shared: Arc::new(Shared {
                call_id,
                notifier,
                inner: Mutex::new(PeerInner::default()),
            }),
            ops: tokio::sync::Mutex::new(()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Local role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Whether a connection has been built
    pub fn is_initialized(&self) -> bool {
        self.shared.inner.lock().backend.is_some()
    }

    /// Remote stream id, once a remote track arrived
    pub fn remote_stream_id(&self) -> Option<String> {
        self.shared.inner.lock().remote_stream.clone()
    }

    /// Snapshot of the negotiation
    pub fn negotiation_state(&self) -> NegotiationState {
        let inner = self.shared.inner.lock();
        NegotiationState {
            connection_state: inner.state,
            local_description_set: inner.local_description_set,
            remote_description_set: inner.remote_description_set,
            pending_remote_candidates: inner.pending.len(),
        }
    }

    /// Build the connection and attach every track of `stream`
    ///
    /// Does nothing if a connection already exists.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be built or the manager was torn down
    #[tracing::instrument(skip_all, fields(call_id = %self.shared.call_id))]
    pub async fn initialize(
        &self,
        stream: &LocalStream,
        observer: Arc<dyn PeerObserver>,
    ) -> Result<(), PeerError> {
        let _ops = self.ops.lock().await;
        {
            let inner = self.shared.inner.lock();
            if inner.closed {
                return Err(PeerError::Closed);
            }
            if inner.backend.is_some() {
                tracing::debug!("Peer connection already initialized");
                return Ok(());
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let backend = self.factory.create(&self.ice_servers, events_tx).await?;

        let installed = {
            let mut inner = self.shared.inner.lock();
            if !inner.closed {
                inner.backend = Some(Arc::clone(&backend));
            }
            !inner.closed
        };
        if !installed {
            let _ = backend.close().await;
            return Err(PeerError::Closed);
        }
        tokio::spawn(pump(
            Arc::clone(&self.shared),
            events_rx,
            observer,
            Arc::clone(&self.shutdown),
        ));

        for track in stream.tracks() {
            backend.add_track(&track).await?;
        }
        tracing::info!(
            tracks = stream.tracks().len(),
            ice_servers = self.ice_servers.len(),
            "Peer connection initialized"
        );
        Ok(())
    }

    /// Create and apply an offer; `None` unless initiator with a connection
    ///
    /// # Errors
    ///
    /// Returns error if offer creation or application fails
    #[tracing::instrument(skip_all, fields(call_id = %self.shared.call_id))]
    pub async fn create_offer_if_initiator(&self) -> Result<Option<SessionDescription>, PeerError> {
        if self.role != Role::Initiator {
            return Ok(None);
        }
        let _ops = self.ops.lock().await;
        let Some(backend) = self.backend()? else {
            return Ok(None);
        };

        let offer = backend.create_offer(OfferOptions::default()).await?;
        backend.set_local_description(offer.clone()).await?;
        self.local_description_applied()?;
        tracing::info!("Created local offer");
        Ok(Some(offer))
    }

    /// Apply the remote offer and return the local answer
    ///
    /// # Errors
    ///
    /// Returns error on the initiator side, before `initialize`, or if the
    /// backend rejects a description
    #[tracing::instrument(skip_all, fields(call_id = %self.shared.call_id))]
    pub async fn apply_remote_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        if self.role != Role::Responder {
            return Err(PeerError::WrongRole(self.role));
        }
        if offer.kind != SdpType::Offer {
            return Err(PeerError::InvalidDescription("expected an offer".to_string()));
        }
        let _ops = self.ops.lock().await;
        let backend = self.backend()?.ok_or(PeerError::NotInitialized)?;

        backend.set_remote_description(offer).await?;
        self.flush_pending(&backend).await?;

        let answer = backend.create_answer().await?;
        backend.set_local_description(answer.clone()).await?;
        self.local_description_applied()?;
        tracing::info!("Applied remote offer and created answer");
        Ok(answer)
    }

    /// Apply the remote answer to our offer
    ///
    /// # Errors
    ///
    /// Returns error on the responder side, without a local offer, or if the
    /// backend rejects the description. A repeated answer is ignored.
    #[tracing::instrument(skip_all, fields(call_id = %self.shared.call_id))]
    pub async fn apply_remote_answer(&self, answer: SessionDescription) -> Result<(), PeerError> {
        if self.role != Role::Initiator {
            return Err(PeerError::WrongRole(self.role));
        }
        if answer.kind != SdpType::Answer {
            return Err(PeerError::InvalidDescription("expected an answer".to_string()));
        }
        let _ops = self.ops.lock().await;
        let backend = self.backend()?.ok_or(PeerError::NotInitialized)?;
        {
            let inner = self.shared.inner.lock();
            if !inner.local_description_set {
                return Err(PeerError::InvalidDescription(
                    "answer received before a local offer".to_string(),
                ));
            }
            if inner.remote_description_set {
                tracing::debug!("Ignoring repeated remote answer");
                return Ok(());
            }
        }

        backend.set_remote_description(answer).await?;
        self.flush_pending(&backend).await?;
        tracing::info!("Applied remote answer");
        Ok(())
    }

    /// Apply a remote candidate, or buffer it until the remote description is set
    ///
    /// # Errors
    ///
    /// Returns error if the manager was torn down or the backend rejects the
    /// candidate
    pub async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let _ops = self.ops.lock().await;
        let backend = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(PeerError::Closed);
            }
            match (&inner.backend, inner.remote_description_set) {
                (Some(backend), true) => Arc::clone(backend),
                _ => {
                    inner.pending.push_back(candidate);
                    tracing::debug!(
                        call_id = %self.shared.call_id,
                        pending = inner.pending.len(),
                        "Buffered remote ICE candidate"
                    );
                    return Ok(());
                }
            }
        };
        backend.add_ice_candidate(candidate).await
    }

    /// Swap the outgoing video over to `track` without renegotiating
    ///
    /// # Errors
    ///
    /// Returns error without a connection or if the backend rejects the track
    pub async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let backend = self.backend()?.ok_or(PeerError::NotInitialized)?;
        backend.replace_track(track).await?;
        tracing::info!(call_id = %self.shared.call_id, track_id = %track.id(), "Replaced outgoing video track");
        Ok(())
    }

    /// Close the connection and drop buffered state; later calls do nothing
    #[tracing::instrument(skip_all, fields(call_id = %self.shared.call_id))]
    pub async fn teardown(&self) {
        let (backend, closed_now) = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            let closed_now = !inner.state.is_terminal();
            if closed_now {
                inner.state = ConnectionState::Closed;
            }
            inner.pending.clear();
            inner.local_description_set = false;
            inner.remote_description_set = false;
            inner.remote_stream = None;
            (inner.backend.take(), closed_now)
        };
        self.shutdown.notify_one();

        if let Some(backend) = backend {
            if let Err(error) = backend.close().await {
                tracing::warn!(%error, "Error closing peer connection");
            }
        }
        if closed_now {
            self.shared.notifier.emit(CallEvent::ConnectionStateChanged {
                state: ConnectionState::Closed,
            });
        }
        self.shared.notifier.emit(CallEvent::RemoteStreamEnded);
        tracing::info!("Peer connection torn down");
    }

    fn backend(&self) -> Result<Option<Arc<dyn PeerConnectionBackend>>, PeerError> {
        let inner = self.shared.inner.lock();
        if inner.closed {
            return Err(PeerError::Closed);
        }
        Ok(inner.backend.clone())
    }

    fn local_description_applied(&self) -> Result<(), PeerError> {
        let first = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(PeerError::Closed);
            }
            !std::mem::replace(&mut inner.local_description_set, true)
        };
        if first {
            self.shared.transition(ConnectionState::Connecting);
        }
        Ok(())
    }

    /// Mark the remote description applied and drain buffered candidates
    ///
    /// Runs under the ops lock, so nothing can be appended meanwhile.
    async fn flush_pending(&self, backend: &Arc<dyn PeerConnectionBackend>) -> Result<(), PeerError> {
        let pending = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(PeerError::Closed);
            }
            inner.remote_description_set = true;
            std::mem::take(&mut inner.pending)
        };
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "Applying buffered ICE candidates");
        }
        for candidate in pending {
            if let Err(error) = backend.add_ice_candidate(candidate).await {
                tracing::warn!(%error, "Buffered ICE candidate rejected");
            }
        }
        Ok(())
    }
}

async fn pump(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    observer: Arc<dyn PeerObserver>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            event = events.recv() => match event {
                Some(event) => shared.handle(event, observer.as_ref()).await,
                None => break,
            },
        }
    }
    tracing::debug!(call_id = %shared.call_id, "Peer event pump stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{AudioConstraints, VideoConstraints};
    use crate::media::{MediaAcquisitionManager, SyntheticDevices};
    use crate::testing::{wait_until, FakePeerFactory};
    use crate::types::FacingMode;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        candidates: Mutex<Vec<IceCandidate>>,
        states: Mutex<Vec<ConnectionState>>,
        streams: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerObserver for Recorder {
        async fn on_local_candidate(&self, candidate: IceCandidate) {
            self.candidates.lock().push(candidate);
        }

        async fn on_connection_state(&self, state: ConnectionState) {
            self.states.lock().push(state);
        }

        async fn on_remote_stream(&self, stream_id: &str) {
            self.streams.lock().push(stream_id.to_string());
        }
    }

    async fn stream() -> Arc<LocalStream> {
        let media = MediaAcquisitionManager::new(
            Arc::new(SyntheticDevices::new()),
            AudioConstraints::default(),
            VideoConstraints::default(),
            Notifier::default(),
        );
        media.acquire(FacingMode::Front).await.unwrap()
    }

    fn manager(role: Role, factory: &Arc<FakePeerFactory>) -> PeerConnectionManager {
        PeerConnectionManager::new(
            CallId::from_wire("call_a_b_1"),
            role,
            Arc::clone(factory) as Arc<dyn PeerConnectionFactory>,
            vec![IceServerConfig::stun("stun:stun.example.org:3478")],
            Notifier::default(),
        )
    }

    #[test]
    fn test_ice_candidate_json_shape() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            })
        );
    }

    #[tokio::test]
    async fn test_initialize_attaches_tracks_once() {
        let factory = Arc::new(FakePeerFactory::new());
        let peer = manager(Role::Initiator, &factory);
        let stream = stream().await;
        let observer = Arc::new(Recorder::default());

        peer.initialize(&stream, observer.clone()).await.unwrap();
        peer.initialize(&stream, observer).await.unwrap();

        assert_eq!(factory.created(), 1);
        let fake = factory.last().unwrap();
        assert_eq!(fake.tracks().len(), 2);
        assert_eq!(fake.ice_servers()[0].urls[0], "stun:stun.example.org:3478");
        assert_eq!(peer.connection_state(), ConnectionState::New);
    }

    #[tokio::test]
    async fn test_offer_only_for_initiator() {
        let factory = Arc::new(FakePeerFactory::new());
        let stream = stream().await;

        let responder = manager(Role::Responder, &factory);
        responder
            .initialize(&stream, Arc::new(Recorder::default()))
            .await
            .unwrap();
        assert_eq!(responder.create_offer_if_initiator().await.unwrap(), None);

        let initiator = manager(Role::Initiator, &factory);
        assert_eq!(initiator.create_offer_if_initiator().await.unwrap(), None);
        initiator
            .initialize(&stream, Arc::new(Recorder::default()))
            .await
            .unwrap();
        let offer = initiator.create_offer_if_initiator().await.unwrap().unwrap();
        assert_eq!(offer.kind, SdpType::Offer);
        assert_eq!(initiator.connection_state(), ConnectionState::Connecting);
        assert!(initiator.negotiation_state().local_description_set);
    }

    #[tokio::test]
    async fn test_candidates_buffer_until_remote_description() {
        let factory = Arc::new(FakePeerFactory::new());
        let responder = manager(Role::Responder, &factory);

        for i in 0..3 {
            responder
                .add_remote_ice_candidate(IceCandidate::new(format!("candidate:{i}")))
                .await
                .unwrap();
        }
        assert_eq!(responder.negotiation_state().pending_remote_candidates, 3);

        responder
            .initialize(&*stream().await, Arc::new(Recorder::default()))
            .await
            .unwrap();
        responder
            .apply_remote_offer(SessionDescription::offer("v=0 remote"))
            .await
            .unwrap();
        responder
            .add_remote_ice_candidate(IceCandidate::new("candidate:3"))
            .await
            .unwrap();

        let applied: Vec<String> = factory
            .last()
            .unwrap()
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(
            applied,
            vec!["candidate:0", "candidate:1", "candidate:2", "candidate:3"]
        );
        assert_eq!(responder.negotiation_state().pending_remote_candidates, 0);
    }

    #[tokio::test]
    async fn test_wrong_role_and_kind_are_rejected() {
        let factory = Arc::new(FakePeerFactory::new());
        let initiator = manager(Role::Initiator, &factory);
        assert_eq!(
            initiator
                .apply_remote_offer(SessionDescription::offer("x"))
                .await
                .unwrap_err(),
            PeerError::WrongRole(Role::Initiator)
        );

        let responder = manager(Role::Responder, &factory);
        assert_eq!(
            responder
                .apply_remote_offer(SessionDescription::offer("x"))
                .await
                .unwrap_err(),
            PeerError::NotInitialized
        );
        assert!(matches!(
            responder
                .apply_remote_offer(SessionDescription::answer("x"))
                .await,
            Err(PeerError::InvalidDescription(_))
        ));
    }

    #[tokio::test]
    async fn test_events_reach_observer_and_state_machine() {
        let factory = Arc::new(FakePeerFactory::new());
        let initiator = manager(Role::Initiator, &factory);
        let observer = Arc::new(Recorder::default());
        initiator
            .initialize(&*stream().await, observer.clone())
            .await
            .unwrap();
        initiator.create_offer_if_initiator().await.unwrap();
        initiator
            .apply_remote_answer(SessionDescription::answer("v=0 answer"))
            .await
            .unwrap();

        assert!(
            wait_until(Duration::from_secs(2), || {
                initiator.connection_state() == ConnectionState::Connected
            })
            .await
        );
        assert!(wait_until(Duration::from_secs(2), || !observer.streams.lock().is_empty()).await);

        assert_eq!(*observer.states.lock(), vec![ConnectionState::Connected]);
        assert_eq!(observer.candidates.lock().len(), 3);
        assert_eq!(observer.streams.lock().len(), 1);
        assert!(initiator.remote_stream_id().is_some());
    }

    #[tokio::test]
    async fn test_repeated_answer_is_ignored() {
        let factory = Arc::new(FakePeerFactory::new());
        let initiator = manager(Role::Initiator, &factory);
        initiator
            .initialize(&*stream().await, Arc::new(Recorder::default()))
            .await
            .unwrap();
        initiator.create_offer_if_initiator().await.unwrap();
        initiator
            .apply_remote_answer(SessionDescription::answer("v=0 first"))
            .await
            .unwrap();
        initiator
            .apply_remote_answer(SessionDescription::answer("v=0 replayed"))
            .await
            .unwrap();

        let fake = factory.last().unwrap();
        assert_eq!(fake.remote_description().unwrap().sdp, "v=0 first");
        assert!(
            wait_until(Duration::from_secs(2), || {
                initiator.connection_state() == ConnectionState::Connected
            })
            .await
        );
    }

    #[tokio::test]
    async fn test_teardown_twice_equals_once() {
        let factory = Arc::new(FakePeerFactory::new());
        let peer = manager(Role::Initiator, &factory);
        let notifier_rx = peer.shared.notifier.subscribe();
        peer.initialize(&*stream().await, Arc::new(Recorder::default()))
            .await
            .unwrap();
        peer.add_remote_ice_candidate(IceCandidate::new("candidate:0"))
            .await
            .unwrap();

        peer.teardown().await;
        let once = peer.negotiation_state();
        peer.teardown().await;

        assert_eq!(peer.negotiation_state(), once);
        assert_eq!(once.connection_state, ConnectionState::Closed);
        assert_eq!(once.pending_remote_candidates, 0);
        assert_eq!(factory.last().unwrap().close_calls(), 1);
        assert!(!peer.is_initialized());

        let mut rx = notifier_rx;
        let mut ended = 0;
        while let Ok(event) = rx.try_recv() {
            if event == CallEvent::RemoteStreamEnded {
                ended += 1;
            }
        }
        assert_eq!(ended, 1);
        assert_eq!(
            peer.add_remote_ice_candidate(IceCandidate::new("late")).await,
            Err(PeerError::Closed)
        );
    }

    #[tokio::test]
    async fn test_failed_is_terminal() {
        let factory = Arc::new(FakePeerFactory::new());
        let peer = manager(Role::Initiator, &factory);
        let observer = Arc::new(Recorder::default());
        peer.initialize(&*stream().await, observer.clone())
            .await
            .unwrap();

        let fake = factory.last().unwrap();
        fake.emit(PeerEvent::StateChanged(ConnectionState::Failed));
        assert!(
            wait_until(Duration::from_secs(2), || {
                peer.connection_state() == ConnectionState::Failed
            })
            .await
        );
        fake.emit(PeerEvent::StateChanged(ConnectionState::Connected));
        peer.teardown().await;

        assert_eq!(peer.connection_state(), ConnectionState::Failed);
        assert_eq!(*observer.states.lock(), vec![ConnectionState::Failed]);
    }
}
