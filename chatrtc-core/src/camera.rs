//! Front/back camera switching during a call

use crate::media::{LocalTrack, MediaAcquisitionManager, MediaError, MediaRequest};
use crate::types::{ErrorKind, TrackKind};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Swaps the camera track of the local stream for the other camera
///
/// Only the video track changes; the audio track keeps running. If the new
/// camera cannot be opened the call continues audio-only.
pub struct CameraSwitcher {
    media: Arc<MediaAcquisitionManager>,
    switching: Mutex<()>,
}

impl CameraSwitcher {
    /// Create a switcher over the shared media manager
    pub fn new(media: Arc<MediaAcquisitionManager>) -> Self {
        Self {
            media,
            switching: Mutex::new(()),
        }
    }

    /// Switch to the opposite camera and return the new video track
    ///
    /// The caller is responsible for handing the track to any live peer
    /// connection.
    ///
    /// # Errors
    ///
    /// - [`MediaError::NoStream`] without permissions or a stream
    /// - [`MediaError::SwitchInProgress`] while another switch runs
    /// - the capture error if the new camera could not be opened
    #[tracing::instrument(skip(self))]
    pub async fn switch(&self) -> Result<LocalTrack, MediaError> {
        let Ok(_guard) = self.switching.try_lock() else {
            tracing::debug!("Ignoring camera switch while another is running");
            return Err(MediaError::SwitchInProgress);
        };
        let notifier = self.media.notifier();

        let (stream, facing, generation) = match self.media.detach_video() {
            Ok(detached) => detached,
            Err(error) => {
                notifier.error(
                    ErrorKind::DeviceUnavailable,
                    "No camera to switch; start the call with camera access first.",
                    false,
                );
                return Err(error);
            }
        };
        tracing::info!(?facing, "Switching camera");

        let request = MediaRequest::video_only(self.media.video_constraints(), facing);
        let track = match self.media.capture(&request).await {
            Ok(tracks) => tracks.into_iter().find(|t| t.kind() == TrackKind::Video),
            Err(error) => {
                tracing::warn!(%error, "Camera switch failed, continuing audio only");
                notifier.error(
                    error.kind(),
                    "Could not open the other camera. The call continues with audio only.",
                    false,
                );
                return Err(error);
            }
        };
        let Some(track) = track else {
            notifier.error(
                ErrorKind::DeviceUnavailable,
                "Could not open the other camera. The call continues with audio only.",
                false,
            );
            return Err(MediaError::DeviceUnavailable("no video track returned".to_string()));
        };

        self.media.attach_video(generation, &stream, track.clone())?;
        Ok(track)
    }
}
