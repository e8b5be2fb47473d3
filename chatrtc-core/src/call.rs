//! Call lifecycle control
//!
//! [`CallController`] owns at most one call session for one chat session. It
//! interprets inbound signaling, drives the session's
//! [`CallTransportStrategy`] and publishes [`CallEvent`]s.
//!
//! The phase field is the race guard: every trigger checks it under the
//! state lock, so duplicate or late triggers are no-ops. Every session also
//! gets a liveness epoch; ending the session bumps it and any setup step still
//! in flight notices after its next suspension point and stops.

use crate::camera::CameraSwitcher;
use crate::codec::{ChatTextCodec, SignalingCodec};
use crate::config::{CallConfig, ConfigError};
use crate::hosted::{HostedCallClient, HostedError};
use crate::identity::ParticipantId;
use crate::media::{MediaAcquisitionManager, MediaDevices, MediaError, MediaState, SyntheticDevices};
use crate::notify::Notifier;
use crate::peer::{NegotiationState, PeerConnectionFactory, PeerConnectionManager, PeerError};
use crate::rtc::WebRtcPeerFactory;
use crate::signaling::{InboundPayload, SignalingHandler, SignalingMessage, SignalingTransport, TransportError};
use crate::strategy::{CallTransportStrategy, HostedFlow, PeerToPeerFlow};
use crate::types::{CallEvent, CallId, CallPhase, CallSession, ErrorKind, StrategyKind};
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Call errors
#[derive(Error, Debug)]
pub enum CallError {
    /// Camera or microphone failure
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Negotiation failure
    #[error("Peer connection error: {0}")]
    Peer(#[from] PeerError),

    /// Signaling could not be sent
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Hosted room failure
    #[error("Hosted call error: {0}")]
    Hosted(#[from] HostedError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Operation not allowed in the current phase
    #[error("Cannot {operation} while {phase:?}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// Phase at the time
        phase: CallPhase,
    },

    /// Peer id unusable for this chat session
    #[error("Invalid peer: {0}")]
    InvalidPeer(String),

    /// Strategy has no backing service
    #[error("{0:?} calls are not available")]
    Unsupported(StrategyKind),

    /// Connection reached Failed
    #[error("Connection failed")]
    Connectivity,

    /// Session ended while the operation was in flight
    #[error("Call setup cancelled")]
    Cancelled,
}

impl CallError {
    /// Failure class for notifications
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Media(e) => e.kind(),
            Self::Hosted(_) | Self::Connectivity => ErrorKind::Connectivity,
            Self::InvalidPeer(_) => ErrorKind::SessionMismatch,
            _ => ErrorKind::Negotiation,
        }
    }

    fn already_surfaced(&self) -> bool {
        // Media and connectivity failures raise their own notices
        matches!(self, Self::Media(_) | Self::Connectivity)
    }
}

/// What to tell the remote participant when a session finishes
enum Farewell {
    Nothing,
    Send(SignalingMessage),
    EndedIfAware,
}

/// How an incoming invite is handled
enum Invitation {
    Ringing,
    Duplicate,
    /// From someone other than the current remote
    Stranger,
    /// Another call from the current remote while one is in progress
    Busy(CallId),
    Unservable(CallError),
}

#[derive(Default)]
struct ControllerState {
    phase: CallPhase,
    session: Option<CallSession>,
    flow: Option<Arc<dyn CallTransportStrategy>>,
    last_peer: Option<(ParticipantId, StrategyKind)>,
    remote_aware: bool,
}

struct ControllerShared {
    local_id: ParticipantId,
    remote: Option<ParticipantId>,
    signaling: SignalingHandler,
    media: Arc<MediaAcquisitionManager>,
    camera: CameraSwitcher,
    peers: Arc<dyn PeerConnectionFactory>,
    hosted: Option<Arc<dyn HostedCallClient>>,
    config: CallConfig,
    notifier: Notifier,
    epoch: AtomicU64,
    state: Mutex<ControllerState>,
}

impl ControllerShared {
    fn is_live(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) == epoch
    }

    fn build_flow(&self, session: &CallSession) -> Result<Arc<dyn CallTransportStrategy>, CallError> {
        match session.strategy {
            StrategyKind::PeerToPeer => {
                let peer = PeerConnectionManager::new(
                    session.call_id.clone(),
                    session.role,
                    Arc::clone(&self.peers),
                    self.config.ice_servers.clone(),
                    self.notifier.clone(),
                );
                Ok(Arc::new(PeerToPeerFlow::new(session.clone(), peer)))
            }
            StrategyKind::Hosted => {
                let client = self
                    .hosted
                    .clone()
                    .ok_or(CallError::Unsupported(StrategyKind::Hosted))?;
                Ok(Arc::new(HostedFlow::new(session.clone(), client)))
            }
        }
    }

    /// Move to a terminal phase and release everything; false if nothing to do
    async fn finish(&self, epoch: Option<u64>, phase: CallPhase, farewell: Farewell) -> bool {
        let (flow, call_id, message) = {
            let mut state = self.state.lock();
            if epoch.is_some_and(|e| !self.is_live(e)) || !state.phase.is_in_call() {
                return false;
            }
            state.phase = phase;
            self.epoch.fetch_add(1, Ordering::AcqRel);
            let message = match farewell {
                Farewell::Nothing => None,
                Farewell::Send(message) => Some(message),
                Farewell::EndedIfAware => state.remote_aware.then_some(SignalingMessage::Ended),
            };
            state.remote_aware = false;
            let call_id = state.session.take().map(|s| s.call_id);
            (state.flow.take(), call_id, message)
        };

        if let Some(call_id) = &call_id {
            self.notifier.emit(CallEvent::PhaseChanged {
                call_id: call_id.clone(),
                phase,
            });
        }
        if let Some(message) = message {
            if let Err(error) = self.signaling.send(&message).await {
                tracing::warn!(%error, "Failed to notify remote participant");
            }
        }
        if let Some(flow) = flow {
            flow.teardown().await;
        }
        self.media.cleanup();
        tracing::info!(call_id = ?call_id.as_ref().map(CallId::as_str), ?phase, "Call finished");
        true
    }

    /// Fail the session `epoch` belongs to, unless it already finished
    async fn fail(&self, epoch: u64, error: &CallError) {
        {
            let state = self.state.lock();
            if !self.is_live(epoch) || !state.phase.is_in_call() {
                tracing::debug!(%error, "Ignoring failure of a finished session");
                return;
            }
        }
        tracing::error!(%error, "Call failed");
        if !error.already_surfaced() {
            self.notifier
                .error(error.kind(), format!("Call setup failed: {error}"), true);
        }
        self.finish(Some(epoch), CallPhase::Failed, Farewell::EndedIfAware)
            .await;
    }

    /// Resolve a setup error: stale sessions report cancellation, live ones fail
    async fn setup_failed(&self, ctx: &FlowContext, error: CallError) -> CallError {
        if matches!(error, CallError::Cancelled) || !ctx.is_live() {
            tracing::debug!(call_id = %ctx.call_id, %error, "Setup step abandoned");
            return CallError::Cancelled;
        }
        self.fail(ctx.epoch, &error).await;
        error
    }
}

/// Handle given to strategies for the session they serve
#[derive(Clone)]
pub struct FlowContext {
    shared: Arc<ControllerShared>,
    epoch: u64,
    call_id: CallId,
}

impl FlowContext {
    /// Call identifier
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Whether the session is still the current one
    pub fn is_live(&self) -> bool {
        self.shared.is_live(self.epoch)
    }

    /// [`CallError::Cancelled`] once the session is over
    ///
    /// # Errors
    ///
    /// Returns error if the session is stale
    pub fn ensure_live(&self) -> Result<(), CallError> {
        if self.is_live() {
            Ok(())
        } else {
            Err(CallError::Cancelled)
        }
    }

    /// Current phase of the controller
    pub fn phase(&self) -> CallPhase {
        self.shared.state.lock().phase
    }

    /// Move the live session to a non-terminal `phase`; false if stale or unchanged
    pub fn advance(&self, phase: CallPhase) -> bool {
        {
            let mut state = self.shared.state.lock();
            if !self.is_live() || !state.phase.is_in_call() || state.phase == phase {
                return false;
            }
            tracing::debug!(call_id = %self.call_id, from = ?state.phase, to = ?phase, "Call phase");
            state.phase = phase;
        }
        self.shared.notifier.emit(CallEvent::PhaseChanged {
            call_id: self.call_id.clone(),
            phase,
        });
        true
    }

    /// Send a message for the live session
    ///
    /// # Errors
    ///
    /// Returns error if the session is stale or the transport fails
    pub async fn send(&self, message: &SignalingMessage) -> Result<(), CallError> {
        self.ensure_live()?;
        self.shared.signaling.send(message).await?;
        let mut state = self.shared.state.lock();
        if self.is_live() {
            state.remote_aware = true;
        }
        Ok(())
    }

    /// Local media manager
    pub fn media(&self) -> &Arc<MediaAcquisitionManager> {
        &self.shared.media
    }

    /// Controller configuration
    pub fn config(&self) -> &CallConfig {
        &self.shared.config
    }

    /// Event publisher
    pub fn notifier(&self) -> &Notifier {
        &self.shared.notifier
    }

    /// Handle that does not keep the controller alive
    pub fn downgrade(&self) -> WeakFlowContext {
        WeakFlowContext {
            shared: Arc::downgrade(&self.shared),
            epoch: self.epoch,
            call_id: self.call_id.clone(),
        }
    }

    /// Fail the session from a callback that must not block on teardown
    pub fn fail_in_background(&self, error: CallError) {
        let shared = Arc::clone(&self.shared);
        let epoch = self.epoch;
        tokio::spawn(async move {
            shared.fail(epoch, &error).await;
        });
    }
}

/// Weak form of [`FlowContext`] held by connection callbacks
#[derive(Clone)]
pub struct WeakFlowContext {
    shared: Weak<ControllerShared>,
    epoch: u64,
    call_id: CallId,
}

impl WeakFlowContext {
    /// Upgrade while the controller exists
    pub fn upgrade(&self) -> Option<FlowContext> {
        Some(FlowContext {
            shared: self.shared.upgrade()?,
            epoch: self.epoch,
            call_id: self.call_id.clone(),
        })
    }
}

/// Call controller for one chat session
///
/// Cloning yields another handle to the same controller.
#[derive(Clone)]
pub struct CallController {
    shared: Arc<ControllerShared>,
}

impl CallController {
    /// Create a builder
    #[must_use]
    pub fn builder(
        local_id: impl Into<ParticipantId>,
        session_id: impl Into<String>,
        transport: Arc<dyn SignalingTransport>,
    ) -> CallControllerBuilder {
        CallControllerBuilder::new(local_id.into(), session_id.into(), transport)
    }

    /// Local participant
    pub fn local_id(&self) -> &ParticipantId {
        &self.shared.local_id
    }

    /// Chat session id
    pub fn session_id(&self) -> &str {
        self.shared.signaling.session_id()
    }

    /// Current phase
    pub fn phase(&self) -> CallPhase {
        self.shared.state.lock().phase
    }

    /// Current session, if a call is in progress
    pub fn session(&self) -> Option<CallSession> {
        self.shared.state.lock().session.clone()
    }

    /// Local capture state
    pub fn media_state(&self) -> MediaState {
        self.shared.media.state()
    }

    /// Negotiation snapshot of a peer-to-peer session
    pub fn negotiation_state(&self) -> Option<NegotiationState> {
        let flow = self.shared.state.lock().flow.clone();
        flow.and_then(|f| f.negotiation())
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.notifier.subscribe()
    }

    /// Start a peer-to-peer call
    ///
    /// # Errors
    ///
    /// See [`Self::start_with`]
    pub async fn start(&self, peer: impl Into<ParticipantId>) -> Result<CallId, CallError> {
        self.start_with(peer, StrategyKind::PeerToPeer).await
    }

    /// Start a call to `peer` and run local setup to completion
    ///
    /// Returns once the offer (or hosted invite) is sent; the call turns
    /// Active when the remote side answers.
    ///
    /// # Errors
    ///
    /// Returns error if a call is already in progress, the peer is invalid,
    /// or setup failed ([`CallError::Cancelled`] if the call ended meanwhile)
    #[tracing::instrument(skip(self, peer), fields(local = %self.shared.local_id))]
    pub async fn start_with(
        &self,
        peer: impl Into<ParticipantId>,
        strategy: StrategyKind,
    ) -> Result<CallId, CallError> {
        let peer = peer.into();
        self.check_peer(&peer)?;

        let session = CallSession::outgoing(self.shared.local_id.clone(), peer.clone(), strategy);
        let flow = self.shared.build_flow(&session)?;
        let ctx = {
            let mut state = self.shared.state.lock();
            if state.phase.is_in_call() {
                return Err(CallError::InvalidState {
                    operation: "start",
                    phase: state.phase,
                });
            }
            let epoch = self.shared.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            state.phase = flow.entry_phase();
            state.session = Some(session.clone());
            state.flow = Some(Arc::clone(&flow));
            state.last_peer = Some((peer.clone(), strategy));
            state.remote_aware = false;
            FlowContext {
                shared: Arc::clone(&self.shared),
                epoch,
                call_id: session.call_id.clone(),
            }
        };
        tracing::info!(call_id = %session.call_id, remote = %peer, ?strategy, "Starting call");
        self.shared.notifier.emit(CallEvent::PhaseChanged {
            call_id: session.call_id.clone(),
            phase: flow.entry_phase(),
        });

        match flow.start(&ctx).await {
            Ok(()) => Ok(session.call_id),
            Err(error) => Err(self.shared.setup_failed(&ctx, error).await),
        }
    }

    /// Show an incoming call without touching any device
    ///
    /// An invite for the call already in progress is ignored, as is one from
    /// anyone but the current remote. A new invite from the current remote
    /// while busy is answered with `Declined`.
    ///
    /// # Errors
    ///
    /// Returns error for invalid callers, unsupported strategies, or if the
    /// automatic decline cannot be sent
    #[tracing::instrument(skip(self), fields(local = %self.shared.local_id))]
    pub async fn receive_invite(
        &self,
        call_id: CallId,
        from: ParticipantId,
        strategy: StrategyKind,
    ) -> Result<(), CallError> {
        self.check_peer(&from)?;

        let session = CallSession::incoming(call_id.clone(), self.shared.local_id.clone(), from.clone(), strategy);
        let flow = self.shared.build_flow(&session);

        let outcome = {
            let mut state = self.shared.state.lock();
            let current = match &state.session {
                Some(current) if state.phase.is_in_call() => {
                    Some((current.call_id.clone(), current.remote_id().clone()))
                }
                _ => None,
            };
            match (current, flow) {
                (Some((current, _)), _) if current == call_id => Invitation::Duplicate,
                (Some((_, remote)), _) if remote != from => Invitation::Stranger,
                (Some((current, _)), _) => Invitation::Busy(current),
                (None, Err(error)) => Invitation::Unservable(error),
                (None, Ok(flow)) => {
                    self.shared.epoch.fetch_add(1, Ordering::AcqRel);
                    state.phase = CallPhase::Ringing;
                    state.session = Some(session);
                    state.flow = Some(flow);
                    state.last_peer = Some((from.clone(), strategy));
                    state.remote_aware = true;
                    Invitation::Ringing
                }
            }
        };

        match outcome {
            Invitation::Duplicate => {
                tracing::debug!("Ignoring duplicate invite");
                Ok(())
            }
            Invitation::Stranger => {
                tracing::warn!(from = %from, kind = ?ErrorKind::SessionMismatch, "Ignoring invite from outside the current call");
                Ok(())
            }
            Invitation::Busy(current) => {
                tracing::warn!(%current, "Declining second invite while in a call");
                self.shared
                    .signaling
                    .send(&SignalingMessage::Declined { strategy })
                    .await?;
                Ok(())
            }
            Invitation::Unservable(error) => {
                tracing::warn!(%error, "Declining call that cannot be served");
                self.shared
                    .signaling
                    .send(&SignalingMessage::Declined { strategy })
                    .await?;
                Err(error)
            }
            Invitation::Ringing => {
                tracing::info!(from = %from, ?strategy, "Incoming call");
                self.shared.notifier.emit(CallEvent::IncomingCall {
                    call_id: call_id.clone(),
                    from,
                    strategy,
                });
                self.shared.notifier.emit(CallEvent::PhaseChanged {
                    call_id,
                    phase: CallPhase::Ringing,
                });
                Ok(())
            }
        }
    }

    /// Accept the ringing call and run local setup
    ///
    /// # Errors
    ///
    /// Returns error unless ringing, or if setup failed
    #[tracing::instrument(skip(self), fields(local = %self.shared.local_id))]
    pub async fn accept(&self) -> Result<(), CallError> {
        let (flow, ctx) = {
            let mut state = self.shared.state.lock();
            let (Some(flow), Some(session), CallPhase::Ringing) =
                (state.flow.clone(), state.session.clone(), state.phase)
            else {
                return Err(CallError::InvalidState {
                    operation: "accept",
                    phase: state.phase,
                });
            };
            state.phase = flow.entry_phase();
            let ctx = FlowContext {
                shared: Arc::clone(&self.shared),
                epoch: self.shared.epoch.load(Ordering::Acquire),
                call_id: session.call_id,
            };
            (flow, ctx)
        };
        tracing::info!(call_id = %ctx.call_id, "Accepting call");
        self.shared.notifier.emit(CallEvent::PhaseChanged {
            call_id: ctx.call_id.clone(),
            phase: flow.entry_phase(),
        });

        match flow.accept(&ctx).await {
            Ok(()) => Ok(()),
            Err(error) => Err(self.shared.setup_failed(&ctx, error).await),
        }
    }

    /// Reject the ringing call
    ///
    /// # Errors
    ///
    /// Returns error unless ringing
    #[tracing::instrument(skip(self), fields(local = %self.shared.local_id))]
    pub async fn decline(&self) -> Result<(), CallError> {
        let (epoch, strategy) = {
            let state = self.shared.state.lock();
            match (&state.session, state.phase) {
                (Some(session), CallPhase::Ringing) => {
                    (self.shared.epoch.load(Ordering::Acquire), session.strategy)
                }
                _ => {
                    return Err(CallError::InvalidState {
                        operation: "decline",
                        phase: state.phase,
                    })
                }
            }
        };
        self.shared
            .finish(
                Some(epoch),
                CallPhase::Declined,
                Farewell::Send(SignalingMessage::Declined { strategy }),
            )
            .await;
        Ok(())
    }

    /// Hang up; does nothing without a call in progress
    #[tracing::instrument(skip(self), fields(local = %self.shared.local_id))]
    pub async fn end(&self) {
        let finished = self
            .shared
            .finish(None, CallPhase::Ended, Farewell::Send(SignalingMessage::Ended))
            .await;
        if !finished {
            tracing::debug!("No call to end");
        }
    }

    /// Start again toward the last peer after a failed call
    ///
    /// # Errors
    ///
    /// Returns error unless the last call failed, or as [`Self::start_with`]
    pub async fn retry(&self) -> Result<CallId, CallError> {
        let (peer, strategy) = {
            let state = self.shared.state.lock();
            match (&state.last_peer, state.phase) {
                (Some((peer, strategy)), CallPhase::Failed) => (peer.clone(), *strategy),
                _ => {
                    return Err(CallError::InvalidState {
                        operation: "retry",
                        phase: state.phase,
                    })
                }
            }
        };
        tracing::info!(remote = %peer, "Retrying call");
        self.start_with(peer, strategy).await
    }

    /// Mute or unmute the microphone; `None` without a microphone track
    pub fn toggle_audio(&self) -> Option<bool> {
        self.shared.media.toggle_audio()
    }

    /// Turn the camera off or on; `None` without a camera track
    pub fn toggle_video(&self) -> Option<bool> {
        self.shared.media.toggle_video()
    }

    /// Switch between front and back camera
    ///
    /// # Errors
    ///
    /// Returns error if the switch failed; the call then continues audio-only
    pub async fn switch_camera(&self) -> Result<(), CallError> {
        let track = self.shared.camera.switch().await?;
        let flow = self.shared.state.lock().flow.clone();
        if let Some(flow) = flow {
            flow.replace_video(&track).await?;
        }
        Ok(())
    }

    /// Process one line from the chat stream
    pub async fn handle_inbound(&self, inbound: InboundPayload) {
        let Some((from, message)) = self.shared.signaling.interpret(&inbound) else {
            return;
        };
        if let Err(error) = self.check_peer(&from) {
            tracing::warn!(%error, kind = ?ErrorKind::SessionMismatch, "Ignoring signaling from outside the session");
            return;
        }

        match message {
            SignalingMessage::Invite { call_id } => {
                if let Err(error) = self.receive_invite(call_id, from, StrategyKind::Hosted).await {
                    tracing::warn!(%error, "Invite not accepted");
                }
            }
            message if message.is_terminal() => {
                self.remote_finished(&from, &message).await;
            }
            SignalingMessage::Offer { .. } => {
                if !self.phase().is_in_call() {
                    // A direct offer doubles as the invitation
                    let call_id = CallId::derive(&self.shared.local_id, &from, Utc::now());
                    if let Err(error) = self
                        .receive_invite(call_id, from.clone(), StrategyKind::PeerToPeer)
                        .await
                    {
                        tracing::warn!(%error, "Offer not accepted");
                        return;
                    }
                }
                self.dispatch(&from, message).await;
            }
            message => self.dispatch(&from, message).await,
        }
    }

    /// Process the chat stream until it closes
    pub async fn run(&self) {
        let inbound = self.shared.signaling.subscribe();
        self.run_stream(inbound).await;
    }

    /// Subscribe now and process the chat stream on a background task
    pub fn spawn(&self) -> JoinHandle<()> {
        let inbound = self.shared.signaling.subscribe();
        let controller = self.clone();
        tokio::spawn(async move { controller.run_stream(inbound).await })
    }

    async fn run_stream(&self, mut inbound: BoxStream<'static, InboundPayload>) {
        tracing::debug!(session = %self.session_id(), "Listening for signaling");
        while let Some(line) = inbound.next().await {
            self.handle_inbound(line).await;
        }
        tracing::debug!(session = %self.session_id(), "Signaling stream closed");
    }

    fn check_peer(&self, peer: &ParticipantId) -> Result<(), CallError> {
        if peer.is_blank() || *peer == self.shared.local_id {
            return Err(CallError::InvalidPeer(peer.to_string()));
        }
        if let Some(remote) = &self.shared.remote {
            if remote != peer {
                return Err(CallError::InvalidPeer(peer.to_string()));
            }
        }
        Ok(())
    }

    async fn remote_finished(&self, from: &ParticipantId, message: &SignalingMessage) {
        let epoch = {
            let state = self.shared.state.lock();
            match &state.session {
                Some(session) if session.remote_id() == from && state.phase.is_in_call() => {
                    self.shared.epoch.load(Ordering::Acquire)
                }
                _ => {
                    tracing::debug!(message_type = message.label(), "No call for remote termination");
                    return;
                }
            }
        };
        let phase = if matches!(message, SignalingMessage::Declined { .. }) {
            CallPhase::Declined
        } else {
            CallPhase::Ended
        };
        tracing::info!(remote = %from, ?phase, "Remote participant finished the call");
        if self.shared.finish(Some(epoch), phase, Farewell::Nothing).await
            && phase == CallPhase::Declined
        {
            self.shared.notifier.warn(format!("{from} declined the call"));
        }
    }

    async fn dispatch(&self, from: &ParticipantId, message: SignalingMessage) {
        let target = {
            let state = self.shared.state.lock();
            match (&state.session, &state.flow) {
                (Some(session), Some(flow))
                    if session.remote_id() == from && state.phase.is_in_call() =>
                {
                    Some((
                        Arc::clone(flow),
                        FlowContext {
                            shared: Arc::clone(&self.shared),
                            epoch: self.shared.epoch.load(Ordering::Acquire),
                            call_id: session.call_id.clone(),
                        },
                    ))
                }
                _ => None,
            }
        };
        let Some((flow, ctx)) = target else {
            tracing::debug!(message_type = message.label(), "No call for message, discarding");
            return;
        };
        if let Err(error) = flow.on_signal(&ctx, message).await {
            let error = self.shared.setup_failed(&ctx, error).await;
            tracing::debug!(call_id = %ctx.call_id, kind = ?error.kind(), %error, "Inbound signaling ended the setup");
        }
    }
}

/// Builder for [`CallController`]
pub struct CallControllerBuilder {
    local_id: ParticipantId,
    session_id: String,
    transport: Arc<dyn SignalingTransport>,
    codec: Arc<dyn SignalingCodec>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    hosted: Option<Arc<dyn HostedCallClient>>,
    remote: Option<ParticipantId>,
    config: CallConfig,
}

impl CallControllerBuilder {
    /// Create a builder with the chat-line codec, synthetic devices and the
    /// `webrtc` backend
    #[must_use]
    pub fn new(local_id: ParticipantId, session_id: String, transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            local_id,
            session_id,
            transport,
            codec: Arc::new(ChatTextCodec::default()),
            devices: Arc::new(SyntheticDevices::new()),
            peers: Arc::new(WebRtcPeerFactory::new()),
            hosted: None,
            remote: None,
            config: CallConfig::default(),
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the signaling codec
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn SignalingCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Set the capture devices
    #[must_use]
    pub fn with_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = devices;
        self
    }

    /// Set the peer connection backend
    #[must_use]
    pub fn with_peer_factory(mut self, peers: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peers = peers;
        self
    }

    /// Enable hosted calls through `client`
    #[must_use]
    pub fn with_hosted_client(mut self, client: Arc<dyn HostedCallClient>) -> Self {
        self.hosted = Some(client);
        self
    }

    /// Only accept signaling from `remote`, the other member of the chat
    #[must_use]
    pub fn with_remote(mut self, remote: impl Into<ParticipantId>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    /// Build the controller
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the local id is blank
    pub fn build(self) -> Result<CallController, CallError> {
        self.config.validate()?;
        if self.local_id.is_blank() {
            return Err(CallError::InvalidPeer(self.local_id.to_string()));
        }

        let notifier = Notifier::new(self.config.event_capacity);
        let media = Arc::new(MediaAcquisitionManager::new(
            self.devices,
            self.config.audio,
            self.config.video,
            notifier.clone(),
        ));
        let signaling = SignalingHandler::new(
            self.transport,
            self.codec,
            self.session_id,
            self.local_id.clone(),
        );

        Ok(CallController {
            shared: Arc::new(ControllerShared {
                local_id: self.local_id,
                remote: self.remote,
                signaling,
                camera: CameraSwitcher::new(Arc::clone(&media)),
                media,
                peers: self.peers,
                hosted: self.hosted,
                config: self.config,
                notifier,
                epoch: AtomicU64::new(0),
                state: Mutex::new(ControllerState::default()),
            }),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::FakePeerFactory;
    use crate::transport::ChatRoom;

    fn controller(room: &ChatRoom, who: &str) -> CallController {
        CallController::builder(who, "chat", Arc::new(room.join(who)))
            .with_peer_factory(Arc::new(FakePeerFactory::new()))
            .with_config(CallConfig {
                offer_delay_ms: 0,
                ..CallConfig::default()
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let room = ChatRoom::new();
        let result = CallController::builder("me", "chat", Arc::new(room.join("me")))
            .with_config(CallConfig {
                event_capacity: 0,
                ..CallConfig::default()
            })
            .build();
        assert!(matches!(result, Err(CallError::Config(_))));
    }

    #[tokio::test]
    async fn test_cannot_call_self_or_blank() {
        let room = ChatRoom::new();
        let alice = controller(&room, "alice");
        assert!(matches!(alice.start("alice").await, Err(CallError::InvalidPeer(_))));
        assert!(matches!(alice.start(" ").await, Err(CallError::InvalidPeer(_))));
        assert_eq!(alice.phase(), CallPhase::Idle);
    }

    #[tokio::test]
    async fn test_accept_and_decline_need_ringing() {
        let room = ChatRoom::new();
        let alice = controller(&room, "alice");
        assert!(matches!(
            alice.accept().await,
            Err(CallError::InvalidState { operation: "accept", phase: CallPhase::Idle })
        ));
        assert!(matches!(
            alice.decline().await,
            Err(CallError::InvalidState { operation: "decline", .. })
        ));
        assert!(matches!(alice.retry().await, Err(CallError::InvalidState { .. })));
        alice.end().await;
        assert_eq!(alice.phase(), CallPhase::Idle);
    }

    #[tokio::test]
    async fn test_hosted_invite_without_client_is_declined() {
        let room = ChatRoom::new();
        let alice = controller(&room, "alice");
        let result = alice
            .receive_invite(CallId::from_wire("call_1"), "bob".into(), StrategyKind::Hosted)
            .await;
        assert!(matches!(result, Err(CallError::Unsupported(StrategyKind::Hosted))));
        assert_eq!(alice.phase(), CallPhase::Idle);
        assert_eq!(room.count_from("chat", "alice", "STREAM_VIDEO_CALL_DECLINED"), 1);
        assert_eq!(room.count_from("chat", "alice", "VIDEO_CALL_DECLINED"), 0);
    }

    #[tokio::test]
    async fn test_remote_restriction() {
        let room = ChatRoom::new();
        let alice = CallController::builder("alice", "chat", Arc::new(room.join("alice")))
            .with_peer_factory(Arc::new(FakePeerFactory::new()))
            .with_remote("bob")
            .build()
            .unwrap();
        assert!(matches!(alice.start("carol").await, Err(CallError::InvalidPeer(_))));

        alice
            .handle_inbound(InboundPayload {
                payload: "VIDEO_CALL_OFFER:{\"type\":\"offer\",\"sdp\":\"v=0\"}".to_string(),
                sender_id: "carol".into(),
            })
            .await;
        assert_eq!(alice.phase(), CallPhase::Idle);
    }
}
