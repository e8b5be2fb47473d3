//! Call transport strategies
//!
//! A session picks its strategy when it starts and keeps it until it ends.
//! [`PeerToPeerFlow`] negotiates a direct connection with offer/answer/ICE;
//! [`HostedFlow`] hands the media to a hosted conferencing room and only
//! exchanges invite/accept lines.

use crate::call::{CallError, FlowContext, WeakFlowContext};
use crate::hosted::HostedCallClient;
use crate::media::{LocalTrack, MediaError};
use crate::peer::{
    IceCandidate, NegotiationState, PeerConnectionManager, PeerObserver, SessionDescription,
};
use crate::signaling::SignalingMessage;
use crate::types::{CallPhase, CallSession, ConnectionState, Role, StrategyKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One way of carrying a call between the two participants
#[async_trait]
pub trait CallTransportStrategy: Send + Sync {
    /// Which strategy this is
    fn kind(&self) -> StrategyKind;

    /// Phase entered when local setup begins
    fn entry_phase(&self) -> CallPhase;

    /// Initiator setup, run after the session was created
    async fn start(&self, ctx: &FlowContext) -> Result<(), CallError>;

    /// Responder setup, run when the local user accepts
    async fn accept(&self, ctx: &FlowContext) -> Result<(), CallError>;

    /// Handle a non-terminal message from the remote participant
    async fn on_signal(&self, ctx: &FlowContext, message: SignalingMessage) -> Result<(), CallError>;

    /// Send a new camera track in place of the current one
    async fn replace_video(&self, track: &LocalTrack) -> Result<(), CallError>;

    /// Release everything the flow holds; called once per session
    async fn teardown(&self);

    /// Negotiation snapshot, for flows that negotiate
    fn negotiation(&self) -> Option<NegotiationState> {
        None
    }
}

/// Map a media failure, treating cancellation by teardown as staleness
fn media_failure(ctx: &FlowContext, error: MediaError) -> CallError {
    if error == MediaError::Cancelled || !ctx.is_live() {
        CallError::Cancelled
    } else {
        CallError::Media(error)
    }
}

#[derive(Debug, Default)]
struct OfferSlot {
    pending: Option<String>,
    local_ready: bool,
    applied: bool,
}

#[derive(Debug, Default)]
struct CandidateGate {
    open: bool,
    queued: Vec<IceCandidate>,
}

/// Direct peer connection negotiated over the chat stream
pub struct PeerToPeerFlow {
    session: CallSession,
    peer: Arc<PeerConnectionManager>,
    offer: parking_lot::Mutex<OfferSlot>,
    gate: Arc<tokio::sync::Mutex<CandidateGate>>,
}

impl PeerToPeerFlow {
    /// Flow for `session` over `peer`
    pub fn new(session: CallSession, peer: PeerConnectionManager) -> Self {
        Self {
            session,
            peer: Arc::new(peer),
            offer: parking_lot::Mutex::new(OfferSlot::default()),
            gate: Arc::new(tokio::sync::Mutex::new(CandidateGate::default())),
        }
    }

    /// The session's peer connection
    pub fn peer(&self) -> &Arc<PeerConnectionManager> {
        &self.peer
    }

    /// Capture media and build the connection; shared by both roles
    async fn prepare(&self, ctx: &FlowContext) -> Result<(), CallError> {
        let stream = ctx
            .media()
            .acquire(ctx.config().default_facing)
            .await
            .map_err(|e| media_failure(ctx, e))?;
        if !ctx.advance(CallPhase::NegotiatingConnection) {
            return Err(CallError::Cancelled);
        }

        let observer = Arc::new(FlowObserver {
            ctx: ctx.downgrade(),
            gate: Arc::clone(&self.gate),
        });
        self.peer.initialize(&stream, observer).await?;
        ctx.ensure_live()
    }

    /// Send a local description, then release candidates gathered meanwhile
    async fn send_description(
        &self,
        ctx: &FlowContext,
        message: SignalingMessage,
    ) -> Result<(), CallError> {
        ctx.send(&message).await?;
        let mut gate = self.gate.lock().await;
        for candidate in std::mem::take(&mut gate.queued) {
            ctx.send(&SignalingMessage::IceCandidate { candidate }).await?;
        }
        gate.open = true;
        Ok(())
    }

    async fn answer(&self, ctx: &FlowContext, sdp: String) -> Result<(), CallError> {
        let answer = self
            .peer
            .apply_remote_offer(SessionDescription::offer(sdp))
            .await?;
        ctx.ensure_live()?;
        self.send_description(ctx, SignalingMessage::Answer { sdp: answer.sdp })
            .await
    }

    /// Take the buffered offer once local setup is done; exactly one caller wins
    fn take_offer(&self, incoming: Option<String>, local_ready: bool) -> Option<String> {
        let mut slot = self.offer.lock();
        if slot.applied {
            if incoming.is_some() {
                tracing::debug!(call_id = %self.session.call_id, "Ignoring repeated offer");
            }
            return None;
        }
        if let Some(sdp) = incoming {
            if slot.pending.is_some() {
                tracing::debug!(call_id = %self.session.call_id, "Ignoring repeated offer");
            } else {
                slot.pending = Some(sdp);
            }
        }
        slot.local_ready |= local_ready;
        if slot.local_ready && slot.pending.is_some() {
            slot.applied = true;
            return slot.pending.take();
        }
        None
    }
}

#[async_trait]
impl CallTransportStrategy for PeerToPeerFlow {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PeerToPeer
    }

    fn entry_phase(&self) -> CallPhase {
        CallPhase::AcquiringMedia
    }

    async fn start(&self, ctx: &FlowContext) -> Result<(), CallError> {
        self.prepare(ctx).await?;

        tokio::time::sleep(ctx.config().offer_delay()).await;
        ctx.ensure_live()?;

        let Some(offer) = self.peer.create_offer_if_initiator().await? else {
            return Err(CallError::InvalidState {
                operation: "offer",
                phase: ctx.phase(),
            });
        };
        ctx.ensure_live()?;
        self.send_description(ctx, SignalingMessage::Offer { sdp: offer.sdp })
            .await
    }

    async fn accept(&self, ctx: &FlowContext) -> Result<(), CallError> {
        self.prepare(ctx).await?;
        match self.take_offer(None, true) {
            Some(sdp) => self.answer(ctx, sdp).await,
            None => {
                tracing::debug!(call_id = %self.session.call_id, "Ready, waiting for remote offer");
                Ok(())
            }
        }
    }

    async fn on_signal(&self, ctx: &FlowContext, message: SignalingMessage) -> Result<(), CallError> {
        match (message, self.peer.role()) {
            (SignalingMessage::Offer { sdp }, Role::Responder) => {
                match self.take_offer(Some(sdp), false) {
                    Some(sdp) => self.answer(ctx, sdp).await,
                    None => Ok(()),
                }
            }
            (SignalingMessage::Answer { sdp }, Role::Initiator) => {
                self.peer
                    .apply_remote_answer(SessionDescription::answer(sdp))
                    .await?;
                Ok(())
            }
            (SignalingMessage::IceCandidate { candidate }, _) => {
                if let Err(error) = self.peer.add_remote_ice_candidate(candidate).await {
                    tracing::warn!(call_id = %self.session.call_id, %error, "Remote ICE candidate rejected");
                }
                Ok(())
            }
            (message, role) => {
                tracing::debug!(
                    call_id = %self.session.call_id,
                    ?role,
                    message_type = message.label(),
                    "Discarding message not expected by this side"
                );
                Ok(())
            }
        }
    }

    async fn replace_video(&self, track: &LocalTrack) -> Result<(), CallError> {
        if !self.peer.is_initialized() {
            return Ok(());
        }
        self.peer.replace_video_track(track).await?;
        Ok(())
    }

    async fn teardown(&self) {
        self.peer.teardown().await;
        let mut gate = self.gate.lock().await;
        gate.queued.clear();
        gate.open = false;
    }

    fn negotiation(&self) -> Option<NegotiationState> {
        Some(self.peer.negotiation_state())
    }
}

/// Connection callbacks for one peer-to-peer session
struct FlowObserver {
    ctx: WeakFlowContext,
    gate: Arc<tokio::sync::Mutex<CandidateGate>>,
}

#[async_trait]
impl PeerObserver for FlowObserver {
    async fn on_local_candidate(&self, candidate: IceCandidate) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        if !ctx.is_live() {
            return;
        }
        let mut gate = self.gate.lock().await;
        if !gate.open {
            gate.queued.push(candidate);
            return;
        }
        if let Err(error) = ctx.send(&SignalingMessage::IceCandidate { candidate }).await {
            tracing::warn!(call_id = %ctx.call_id(), %error, "Failed to send local ICE candidate");
        }
    }

    async fn on_connection_state(&self, state: ConnectionState) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        match state {
            ConnectionState::Connected => {
                ctx.advance(CallPhase::Active);
            }
            ConnectionState::Disconnected => {
                if ctx.is_live() {
                    ctx.notifier().warn("Connection interrupted, trying to reconnect");
                }
            }
            ConnectionState::Failed => ctx.fail_in_background(CallError::Connectivity),
            _ => {}
        }
    }
}

/// Call carried by a hosted conferencing room
pub struct HostedFlow {
    session: CallSession,
    client: Arc<dyn HostedCallClient>,
    joined: AtomicBool,
}

impl HostedFlow {
    /// Flow for `session` through `client`
    pub fn new(session: CallSession, client: Arc<dyn HostedCallClient>) -> Self {
        Self {
            session,
            client,
            joined: AtomicBool::new(false),
        }
    }

    async fn join(&self, ctx: &FlowContext) -> Result<(), CallError> {
        self.client.join(&self.session.call_id).await?;
        self.joined.store(true, Ordering::Release);
        if !ctx.is_live() {
            self.leave().await;
            return Err(CallError::Cancelled);
        }
        tracing::info!(call_id = %self.session.call_id, "Joined hosted call");
        Ok(())
    }

    async fn leave(&self) {
        if self.joined.swap(false, Ordering::AcqRel) {
            if let Err(error) = self.client.leave().await {
                tracing::warn!(call_id = %self.session.call_id, %error, "Failed to leave hosted call");
            }
        }
    }
}

#[async_trait]
impl CallTransportStrategy for HostedFlow {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Hosted
    }

    fn entry_phase(&self) -> CallPhase {
        CallPhase::NegotiatingConnection
    }

    async fn start(&self, ctx: &FlowContext) -> Result<(), CallError> {
        ctx.send(&SignalingMessage::Invite {
            call_id: self.session.call_id.clone(),
        })
        .await?;
        self.join(ctx).await
    }

    async fn accept(&self, ctx: &FlowContext) -> Result<(), CallError> {
        ctx.send(&SignalingMessage::Accepted).await?;
        self.join(ctx).await?;
        ctx.advance(CallPhase::Active);
        Ok(())
    }

    async fn on_signal(&self, ctx: &FlowContext, message: SignalingMessage) -> Result<(), CallError> {
        match (message, self.session.role) {
            (SignalingMessage::Accepted, Role::Initiator) => {
                ctx.advance(CallPhase::Active);
            }
            (message, role) => {
                tracing::debug!(
                    call_id = %self.session.call_id,
                    ?role,
                    message_type = message.label(),
                    "Hosted call ignores message"
                );
            }
        }
        Ok(())
    }

    async fn replace_video(&self, _track: &LocalTrack) -> Result<(), CallError> {
        // The hosted room owns its own capture
        Ok(())
    }

    async fn teardown(&self) {
        self.leave().await;
    }
}
