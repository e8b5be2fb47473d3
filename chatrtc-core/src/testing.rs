//! In-memory doubles for the connection and hosted-service seams
//!
//! [`FakePeerFactory`] builds [`FakePeer`]s that behave like a well-mannered
//! WebRTC stack: local candidates appear once a local description is set,
//! remote candidates are rejected until a remote description is set, and the
//! connection reports Connected once both descriptions are in place.

use crate::config::IceServerConfig;
use crate::hosted::{HostedCallClient, HostedError};
use crate::media::LocalTrack;
use crate::peer::{
    IceCandidate, OfferOptions, PeerConnectionBackend, PeerConnectionFactory, PeerError,
    PeerEvent, SessionDescription,
};
use crate::types::{CallId, ConnectionState, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Behaviour knobs shared by every peer a factory builds
#[derive(Debug, Clone, Copy)]
pub struct FakePeerScript {
    /// Local candidates emitted per local description
    pub local_candidates: usize,
    /// Report Connected once both descriptions are set
    pub auto_connect: bool,
    /// Fail `create_offer`
    pub fail_offer: bool,
    /// Fail `create_answer`
    pub fail_answer: bool,
}

impl Default for FakePeerScript {
    fn default() -> Self {
        Self {
            local_candidates: 3,
            auto_connect: true,
            fail_offer: false,
            fail_answer: false,
        }
    }
}

#[derive(Debug, Default)]
struct FakePeerLog {
    tracks: Vec<(TrackKind, String)>,
    replaced: Vec<String>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    connected: bool,
}

/// A scripted peer connection
#[derive(Debug)]
pub struct FakePeer {
    label: String,
    ice_servers: Vec<IceServerConfig>,
    events: mpsc::UnboundedSender<PeerEvent>,
    script: FakePeerScript,
    log: Mutex<FakePeerLog>,
    close_calls: AtomicUsize,
}

impl FakePeer {
    /// ICE servers the peer was built with
    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        self.ice_servers.clone()
    }

    /// Attached local tracks as (kind, track id)
    pub fn tracks(&self) -> Vec<(TrackKind, String)> {
        self.log.lock().tracks.clone()
    }

    /// Ids of tracks swapped in by `replace_track`
    pub fn replaced_tracks(&self) -> Vec<String> {
        self.log.lock().replaced.clone()
    }

    /// Applied local description
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.log.lock().local.clone()
    }

    /// Applied remote description
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.log.lock().remote.clone()
    }

    /// Remote candidates applied, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.log.lock().applied.clone()
    }

    /// Number of `close` calls
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Acquire)
    }

    /// Inject a backend event
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn maybe_connect(&self, log: &mut FakePeerLog) {
        if !self.script.auto_connect || log.connected || log.local.is_none() || log.remote.is_none() {
            return;
        }
        log.connected = true;
        self.emit(PeerEvent::StateChanged(ConnectionState::Connected));
        self.emit(PeerEvent::RemoteTrack {
            stream_id: format!("{}-stream", self.label),
            track_id: format!("{}-video", self.label),
            kind: TrackKind::Video,
        });
    }
}

#[async_trait]
impl PeerConnectionBackend for FakePeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.log
            .lock()
            .tracks
            .push((track.kind(), track.id().to_string()));
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.log.lock().replaced.push(track.id().to_string());
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, PeerError> {
        if self.script.fail_offer {
            return Err(PeerError::Backend("offer creation failed".to_string()));
        }
        Ok(SessionDescription::offer(format!(
            "v=0 o={} audio={} video={}",
            self.label, options.receive_audio, options.receive_video
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if self.script.fail_answer {
            return Err(PeerError::Backend("answer creation failed".to_string()));
        }
        if self.log.lock().remote.is_none() {
            return Err(PeerError::InvalidDescription("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer(format!("v=0 o={}", self.label)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        let mut log = self.log.lock();
        let first = log.local.is_none();
        log.local = Some(description);
        if first {
            for i in 0..self.script.local_candidates {
                self.emit(PeerEvent::LocalCandidate(IceCandidate {
                    candidate: format!("candidate:{i} 1 udp 2122260223 10.0.0.{i} 5000{i} typ host"),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                    username_fragment: Some(self.label.clone()),
                }));
            }
        }
        self.maybe_connect(&mut log);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let mut log = self.log.lock();
        // A settled connection refuses a second remote description
        if log.remote.is_some() {
            return Err(PeerError::InvalidDescription(
                "remote description already applied".to_string(),
            ));
        }
        log.remote = Some(description);
        self.maybe_connect(&mut log);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut log = self.log.lock();
        if log.remote.is_none() {
            return Err(PeerError::InvalidDescription(
                "remote description not set".to_string(),
            ));
        }
        log.applied.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.close_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Builds [`FakePeer`]s and keeps every one for inspection
#[derive(Debug, Default)]
pub struct FakePeerFactory {
    script: Mutex<FakePeerScript>,
    fail_create: AtomicBool,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    /// Factory with the default script
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose peers follow `script`
    #[must_use]
    pub fn with_script(script: FakePeerScript) -> Self {
        Self {
            script: Mutex::new(script),
            ..Self::default()
        }
    }

    /// Change the script for peers built from now on
    pub fn set_script(&self, script: FakePeerScript) {
        *self.script.lock() = script;
    }

    /// Make `create` fail
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::Release);
    }

    /// Number of peers built
    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    /// Most recently built peer
    pub fn last(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }

    /// Every peer built, oldest first
    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnectionBackend>, PeerError> {
        if self.fail_create.load(Ordering::Acquire) {
            return Err(PeerError::Backend("peer connection unavailable".to_string()));
        }
        let mut peers = self.peers.lock();
        let peer = Arc::new(FakePeer {
            label: format!("fake{}", peers.len()),
            ice_servers: ice_servers.to_vec(),
            events,
            script: *self.script.lock(),
            log: Mutex::new(FakePeerLog::default()),
            close_calls: AtomicUsize::new(0),
        });
        peers.push(Arc::clone(&peer));
        Ok(peer)
    }
}

/// Hosted client that records joins and leaves
#[derive(Debug, Default)]
pub struct StubHostedClient {
    joined: Mutex<Vec<CallId>>,
    leaves: AtomicUsize,
    fail_join: AtomicBool,
}

impl StubHostedClient {
    /// Client that accepts every join
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `join` fail
    pub fn fail_join(&self, fail: bool) {
        self.fail_join.store(fail, Ordering::Release);
    }

    /// Rooms joined, in order
    pub fn joined(&self) -> Vec<CallId> {
        self.joined.lock().clone()
    }

    /// Number of `leave` calls
    pub fn leaves(&self) -> usize {
        self.leaves.load(Ordering::Acquire)
    }
}

#[async_trait]
impl HostedCallClient for StubHostedClient {
    async fn join(&self, call_id: &CallId) -> Result<(), HostedError> {
        if self.fail_join.load(Ordering::Acquire) {
            return Err(HostedError::Join {
                call_id: call_id.clone(),
                reason: "room unavailable".to_string(),
            });
        }
        self.joined.lock().push(call_id.clone());
        Ok(())
    }

    async fn leave(&self) -> Result<(), HostedError> {
        self.leaves.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
