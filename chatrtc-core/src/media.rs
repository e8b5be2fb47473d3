//! Local media capture
//!
//! [`MediaAcquisitionManager`] owns the local camera and microphone stream.
//! Acquisition degrades in tiers: audio and video first, then audio only, then
//! a blocking permission error. The stream's track set is only mutated here
//! and by [`crate::camera::CameraSwitcher`]; peer connections read it.

use crate::config::{AudioConstraints, VideoConstraints};
use crate::notify::Notifier;
use crate::types::{ErrorKind, FacingMode, TrackKind};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User or platform refused access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device missing or busy
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// No local stream has been acquired
    #[error("No local stream")]
    NoStream,

    /// A camera switch is already running
    #[error("Camera switch already in progress")]
    SwitchInProgress,

    /// Superseded by cleanup or a newer acquisition
    #[error("Acquisition cancelled")]
    Cancelled,
}

impl MediaError {
    /// Failure class for user notifications
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            _ => ErrorKind::DeviceUnavailable,
        }
    }
}

/// Camera part of a capture request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoRequest {
    /// Resolution constraints
    pub constraints: VideoConstraints,
    /// Which camera
    pub facing: FacingMode,
}

/// A capture request handed to [`MediaDevices`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaRequest {
    /// Microphone, if requested
    pub audio: Option<AudioConstraints>,
    /// Camera, if requested
    pub video: Option<VideoRequest>,
}

impl MediaRequest {
    /// First tier: camera and microphone
    pub fn audio_video(audio: AudioConstraints, video: VideoConstraints, facing: FacingMode) -> Self {
        Self {
            audio: Some(audio),
            video: Some(VideoRequest {
                constraints: video,
                facing,
            }),
        }
    }

    /// Second tier: microphone only
    pub fn audio_only(audio: AudioConstraints) -> Self {
        Self {
            audio: Some(audio),
            video: None,
        }
    }

    /// Camera only, used when switching cameras mid-call
    pub fn video_only(video: VideoConstraints, facing: FacingMode) -> Self {
        Self {
            audio: None,
            video: Some(VideoRequest {
                constraints: video,
                facing,
            }),
        }
    }
}

/// Host platform capture API
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Capture tracks satisfying `request`; all requested devices or nothing
    async fn get_user_media(&self, request: &MediaRequest) -> Result<Vec<LocalTrack>, MediaError>;
}

/// One captured local track
///
/// Clones share the enabled and live flags.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    facing: Option<FacingMode>,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
    sample: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    /// Create a live, enabled track backed by a sample-fed WebRTC track
    pub fn new(kind: TrackKind, facing: Option<FacingMode>, stream_id: &str) -> Self {
        let id = format!(
            "{}-{}",
            match kind {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            },
            uuid::Uuid::new_v4()
        );
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };
        let sample = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_string(),
        ));
        Self {
            id,
            kind,
            facing: facing.filter(|_| kind == TrackKind::Video),
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
            sample,
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Audio or video
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Camera the track comes from, video only
    pub fn facing(&self) -> Option<FacingMode> {
        self.facing
    }

    /// Whether the track is unmuted
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Whether the device handle is still held
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Track handed to peer connections
    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.sample) as Arc<dyn TrackLocal + Send + Sync>
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Release the device handle; a stopped track never restarts
    pub(crate) fn stop(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            tracing::debug!(track_id = %self.id, kind = ?self.kind, "Stopped local track");
        }
    }
}

/// The local participant's capture stream
#[derive(Debug)]
pub struct LocalStream {
    id: String,
    tracks: RwLock<Vec<LocalTrack>>,
}

impl LocalStream {
    pub(crate) fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks: RwLock::new(tracks),
        }
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of every track
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.tracks.read().clone()
    }

    /// Snapshot of the tracks of one kind
    pub fn tracks_of(&self, kind: TrackKind) -> Vec<LocalTrack> {
        self.tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    /// The current video track, if any
    pub fn video_track(&self) -> Option<LocalTrack> {
        self.tracks_of(TrackKind::Video).into_iter().next()
    }

    pub(crate) fn add_track(&self, track: LocalTrack) {
        self.tracks.write().push(track);
    }

    pub(crate) fn remove_track(&self, track_id: &str) -> Option<LocalTrack> {
        let mut tracks = self.tracks.write();
        let pos = tracks.iter().position(|t| t.id() == track_id)?;
        Some(tracks.remove(pos))
    }

    pub(crate) fn stop_all(&self) {
        for track in self.tracks.read().iter() {
            track.stop();
        }
    }
}

/// Observable capture state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaState {
    /// Camera track present and unmuted
    pub video_enabled: bool,
    /// Microphone track present and unmuted
    pub audio_enabled: bool,
    /// Camera in use or requested
    pub facing_mode: FacingMode,
    /// Some acquisition tier succeeded
    pub permissions_granted: bool,
    /// An acquisition request is in flight
    pub capturing: bool,
}

#[derive(Debug, Default)]
struct MediaInner {
    state: MediaState,
    stream: Option<Arc<LocalStream>>,
}

/// Acquires and controls the local camera and microphone
pub struct MediaAcquisitionManager {
    devices: Arc<dyn MediaDevices>,
    audio: AudioConstraints,
    video: VideoConstraints,
    notifier: Notifier,
    inner: Mutex<MediaInner>,
    generation: AtomicU64,
}

impl MediaAcquisitionManager {
    /// Create a manager over the host capture API
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        audio: AudioConstraints,
        video: VideoConstraints,
        notifier: Notifier,
    ) -> Self {
        Self {
            devices,
            audio,
            video,
            notifier,
            inner: Mutex::new(MediaInner::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Current capture state
    pub fn state(&self) -> MediaState {
        self.inner.lock().state
    }

    /// Current local stream
    pub fn stream(&self) -> Option<Arc<LocalStream>> {
        self.inner.lock().stream.clone()
    }

    /// Acquire the local stream, degrading from audio+video to audio only
    ///
    /// Any previously held stream is stopped first. A [`Self::cleanup`] while
    /// the request is in flight turns its result into [`MediaError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns the audio-only failure when both tiers fail
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self, facing: FacingMode) -> Result<Arc<LocalStream>, MediaError> {
        let generation = self.begin_capture(facing);

        let first = MediaRequest::audio_video(self.audio, self.video, facing);
        match self.devices.get_user_media(&first).await {
            Ok(tracks) => return self.install(generation, tracks, facing),
            Err(error) => {
                if self.is_stale(generation) {
                    return Err(MediaError::Cancelled);
                }
                tracing::warn!(%error, "Camera capture failed, falling back to audio only");
            }
        }

        let second = MediaRequest::audio_only(self.audio);
        match self.devices.get_user_media(&second).await {
            Ok(tracks) => {
                let stream = self.install(generation, tracks, facing)?;
                self.notifier
                    .warn("Camera unavailable, continuing with audio only");
                Ok(stream)
            }
            Err(error) => {
                if self.is_stale(generation) {
                    return Err(MediaError::Cancelled);
                }
                {
                    let mut inner = self.inner.lock();
                    inner.state.capturing = false;
                    inner.state.permissions_granted = false;
                }
                tracing::error!(%error, "Microphone capture failed");
                self.notifier.error(
                    error.kind(),
                    "Camera and microphone access is blocked. Allow access and try again.",
                    true,
                );
                Err(error)
            }
        }
    }

    /// Mute or unmute the camera in place; `None` without a video track
    pub fn toggle_video(&self) -> Option<bool> {
        self.toggle(TrackKind::Video)
    }

    /// Mute or unmute the microphone in place; `None` without an audio track
    pub fn toggle_audio(&self) -> Option<bool> {
        self.toggle(TrackKind::Audio)
    }

    /// Stop every track and reset to defaults; safe to call repeatedly
    pub fn cleanup(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let stream = {
            let mut inner = self.inner.lock();
            inner.state = MediaState::default();
            inner.stream.take()
        };
        if let Some(stream) = stream {
            stream.stop_all();
            tracing::info!(stream_id = %stream.id(), "Released local media");
        }
    }

    fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let mut inner = self.inner.lock();
        let tracks = inner.stream.as_ref()?.tracks_of(kind);
        let track = tracks.first()?;
        let enabled = !track.is_enabled();
        for track in &tracks {
            track.set_enabled(enabled);
        }
        match kind {
            TrackKind::Audio => inner.state.audio_enabled = enabled,
            TrackKind::Video => inner.state.video_enabled = enabled,
        }
        tracing::debug!(?kind, enabled, "Toggled local track");
        Some(enabled)
    }

    fn begin_capture(&self, facing: FacingMode) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let previous = {
            let mut inner = self.inner.lock();
            inner.state.capturing = true;
            inner.state.facing_mode = facing;
            inner.stream.take()
        };
        if let Some(stream) = previous {
            stream.stop_all();
            tracing::debug!(stream_id = %stream.id(), "Stopped previous stream before acquiring");
        }
        generation
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) != generation
    }

    fn install(
        &self,
        generation: u64,
        tracks: Vec<LocalTrack>,
        facing: FacingMode,
    ) -> Result<Arc<LocalStream>, MediaError> {
        let mut inner = self.inner.lock();
        if self.is_stale(generation) {
            drop(inner);
            for track in &tracks {
                track.stop();
            }
            return Err(MediaError::Cancelled);
        }
        let has = |kind| tracks.iter().any(|t: &LocalTrack| t.kind() == kind && t.is_enabled());
        inner.state = MediaState {
            video_enabled: has(TrackKind::Video),
            audio_enabled: has(TrackKind::Audio),
            facing_mode: facing,
            permissions_granted: true,
            capturing: false,
        };
        let stream = Arc::new(LocalStream::new(
            format!("local-{}", uuid::Uuid::new_v4()),
            tracks,
        ));
        tracing::info!(
            stream_id = %stream.id(),
            video = inner.state.video_enabled,
            audio = inner.state.audio_enabled,
            "Acquired local media"
        );
        inner.stream = Some(Arc::clone(&stream));
        Ok(stream)
    }

    // Camera switching hooks, see crate::camera

    pub(crate) fn video_constraints(&self) -> VideoConstraints {
        self.video
    }

    pub(crate) fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub(crate) async fn capture(&self, request: &MediaRequest) -> Result<Vec<LocalTrack>, MediaError> {
        self.devices.get_user_media(request).await
    }

    /// Stop and detach the current camera track, returning the stream, the
    /// camera to switch to and the generation the switch belongs to
    pub(crate) fn detach_video(&self) -> Result<(Arc<LocalStream>, FacingMode, u64), MediaError> {
        let mut inner = self.inner.lock();
        let stream = match (&inner.stream, inner.state.permissions_granted) {
            (Some(stream), true) => Arc::clone(stream),
            _ => return Err(MediaError::NoStream),
        };
        for track in stream.tracks_of(TrackKind::Video) {
            track.stop();
            stream.remove_track(track.id());
        }
        inner.state.video_enabled = false;
        let next = inner.state.facing_mode.opposite();
        Ok((stream, next, self.generation.load(Ordering::Acquire)))
    }

    pub(crate) fn attach_video(
        &self,
        generation: u64,
        stream: &Arc<LocalStream>,
        track: LocalTrack,
    ) -> Result<(), MediaError> {
        let mut inner = self.inner.lock();
        let current = inner
            .stream
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(s, stream));
        if self.is_stale(generation) || !current {
            drop(inner);
            track.stop();
            return Err(MediaError::Cancelled);
        }
        if let Some(facing) = track.facing() {
            inner.state.facing_mode = facing;
        }
        inner.state.video_enabled = track.is_enabled();
        stream.add_track(track);
        Ok(())
    }
}

/// Access policy of one synthetic device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceAccess {
    /// Capture succeeds
    #[default]
    Granted,
    /// User refused access
    Denied,
    /// No such device
    Missing,
}

impl DeviceAccess {
    fn check(self, device: &str) -> Result<(), MediaError> {
        match self {
            Self::Granted => Ok(()),
            Self::Denied => Err(MediaError::PermissionDenied(format!("{device} access denied"))),
            Self::Missing => Err(MediaError::DeviceUnavailable(format!("no {device} found"))),
        }
    }
}

#[derive(Debug, Default)]
struct DevicePolicy {
    microphone: DeviceAccess,
    front_camera: DeviceAccess,
    back_camera: DeviceAccess,
}

/// Capture devices that produce silent sample-fed tracks
///
/// Used where no platform capture exists (headless hosts, the CLI demo,
/// tests). Each device's access can be changed at runtime and every request
/// is recorded.
#[derive(Debug, Default)]
pub struct SyntheticDevices {
    policy: Mutex<DevicePolicy>,
    requests: Mutex<Vec<MediaRequest>>,
    latency: Duration,
}

impl SyntheticDevices {
    /// All devices granted, no latency
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every capture by `latency`
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Set access for both cameras
    pub fn set_camera(&self, access: DeviceAccess) {
        let mut policy = self.policy.lock();
        policy.front_camera = access;
        policy.back_camera = access;
    }

    /// Set access for one camera
    pub fn set_camera_facing(&self, facing: FacingMode, access: DeviceAccess) {
        let mut policy = self.policy.lock();
        match facing {
            FacingMode::Front => policy.front_camera = access,
            FacingMode::Back => policy.back_camera = access,
        }
    }

    /// Set microphone access
    pub fn set_microphone(&self, access: DeviceAccess) {
        self.policy.lock().microphone = access;
    }

    /// Every request received so far, in order
    pub fn requests(&self) -> Vec<MediaRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(&self, request: &MediaRequest) -> Result<Vec<LocalTrack>, MediaError> {
        self.requests.lock().push(*request);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        {
            let policy = self.policy.lock();
            if request.audio.is_some() {
                policy.microphone.check("microphone")?;
            }
            if let Some(video) = &request.video {
                match video.facing {
                    FacingMode::Front => policy.front_camera.check("front camera")?,
                    FacingMode::Back => policy.back_camera.check("back camera")?,
                }
            }
        }

        let stream_id = "synthetic";
        let mut tracks = Vec::new();
        if request.audio.is_some() {
            tracks.push(LocalTrack::new(TrackKind::Audio, None, stream_id));
        }
        if let Some(video) = &request.video {
            tracks.push(LocalTrack::new(TrackKind::Video, Some(video.facing), stream_id));
        }
        Ok(tracks)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{CallEvent, Notice};

    fn manager(devices: Arc<SyntheticDevices>) -> (MediaAcquisitionManager, Notifier) {
        let notifier = Notifier::new(16);
        let manager = MediaAcquisitionManager::new(
            devices,
            AudioConstraints::default(),
            VideoConstraints::default(),
            notifier.clone(),
        );
        (manager, notifier)
    }

    #[tokio::test]
    async fn test_first_tier_captures_audio_and_video() {
        let devices = Arc::new(SyntheticDevices::new());
        let (manager, notifier) = manager(Arc::clone(&devices));
        let mut events = notifier.subscribe();

        let stream = manager.acquire(FacingMode::Front).await.unwrap();

        assert_eq!(stream.tracks().len(), 2);
        let state = manager.state();
        assert!(state.permissions_granted);
        assert!(state.video_enabled);
        assert!(state.audio_enabled);
        assert!(!state.capturing);
        assert_eq!(devices.requests().len(), 1);
        assert!(events.try_recv().is_err(), "tier (a) raises no notice");

        let request = devices.requests()[0];
        let video = request.video.unwrap();
        assert_eq!(video.constraints.ideal_width, 1280);
        assert_eq!(video.constraints.ideal_height, 720);
        assert!(request.audio.unwrap().noise_suppression);
    }

    #[tokio::test]
    async fn test_camera_denied_falls_back_to_audio_once() {
        let devices = Arc::new(SyntheticDevices::new());
        devices.set_camera(DeviceAccess::Denied);
        let (manager, notifier) = manager(Arc::clone(&devices));
        let mut events = notifier.subscribe();

        let stream = manager.acquire(FacingMode::Front).await.unwrap();

        assert_eq!(stream.tracks_of(TrackKind::Audio).len(), 1);
        assert!(stream.video_track().is_none());
        let requests = devices.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].video.is_some());
        assert!(requests[1].video.is_none());
        let state = manager.state();
        assert!(state.permissions_granted);
        assert!(!state.video_enabled);
        assert!(state.audio_enabled);
        assert!(matches!(
            events.try_recv().unwrap(),
            CallEvent::Notice(Notice::Warning { .. })
        ));
    }

    #[tokio::test]
    async fn test_total_denial_reports_blocking_error() {
        let devices = Arc::new(SyntheticDevices::new());
        devices.set_camera(DeviceAccess::Denied);
        devices.set_microphone(DeviceAccess::Denied);
        let (manager, notifier) = manager(Arc::clone(&devices));
        let mut events = notifier.subscribe();

        let err = manager.acquire(FacingMode::Front).await.unwrap_err();

        assert!(matches!(err, MediaError::PermissionDenied(_)));
        assert_eq!(devices.requests().len(), 2);
        let state = manager.state();
        assert!(!state.permissions_granted);
        assert!(!state.capturing);
        assert!(manager.stream().is_none());
        assert!(matches!(
            events.try_recv().unwrap(),
            CallEvent::Notice(Notice::Error {
                kind: ErrorKind::PermissionDenied,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_reacquire_stops_previous_tracks() {
        let devices = Arc::new(SyntheticDevices::new());
        let (manager, _) = manager(devices);

        let first = manager.acquire(FacingMode::Front).await.unwrap();
        let second = manager.acquire(FacingMode::Back).await.unwrap();

        assert!(first.tracks().iter().all(|t| !t.is_live()));
        assert!(second.tracks().iter().all(LocalTrack::is_live));
        assert_eq!(manager.state().facing_mode, FacingMode::Back);
    }

    #[tokio::test]
    async fn test_toggles_flip_enabled_in_place() {
        let devices = Arc::new(SyntheticDevices::new());
        let (manager, _) = manager(devices);
        let stream = manager.acquire(FacingMode::Front).await.unwrap();

        assert_eq!(manager.toggle_video(), Some(false));
        assert!(!stream.video_track().unwrap().is_enabled());
        assert!(stream.video_track().unwrap().is_live());
        assert!(!manager.state().video_enabled);
        assert_eq!(manager.toggle_video(), Some(true));

        assert_eq!(manager.toggle_audio(), Some(false));
        assert!(!manager.state().audio_enabled);
    }

    #[tokio::test]
    async fn test_toggle_without_stream_is_none() {
        let (manager, _) = manager(Arc::new(SyntheticDevices::new()));
        assert_eq!(manager.toggle_video(), None);
        assert_eq!(manager.toggle_audio(), None);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let (manager, _) = manager(Arc::new(SyntheticDevices::new()));
        let stream = manager.acquire(FacingMode::Back).await.unwrap();

        manager.cleanup();
        let once = manager.state();
        manager.cleanup();

        assert_eq!(manager.state(), once);
        assert_eq!(once, MediaState::default());
        assert!(manager.stream().is_none());
        assert!(stream.tracks().iter().all(|t| !t.is_live()));
    }

    #[tokio::test]
    async fn test_cleanup_cancels_in_flight_acquisition() {
        let devices = Arc::new(SyntheticDevices::new().with_latency(Duration::from_millis(50)));
        let (manager, _) = manager(devices);
        let manager = Arc::new(manager);

        let pending = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire(FacingMode::Front).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.cleanup();

        let result = pending.await.unwrap();
        assert_eq!(result.unwrap_err(), MediaError::Cancelled);
        assert!(manager.stream().is_none());
        assert!(!manager.state().permissions_granted);
    }
}
