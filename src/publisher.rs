use std::sync::Arc;

use derivative::Derivative;
use tokio::sync::Mutex;

use crate::{
    error::{Error, MediaErrorKind},
    peer::PeerConnection,
    track::{MediaProvider, TrackHandle, TrackKind, TrackSource},
};

#[derive(Debug, Default)]
struct LocalMediaState {
    camera: Option<TrackHandle>,
    microphone: Option<TrackHandle>,
    screen_video: Option<TrackHandle>,
    screen_audio: Option<TrackHandle>,
}

impl LocalMediaState {
    fn active_video(&self) -> Option<&TrackHandle> {
        self.screen_video.as_ref().or(self.camera.as_ref())
    }

    fn active_audio(&self) -> Option<&TrackHandle> {
        self.screen_audio.as_ref().or(self.microphone.as_ref())
    }
}

/// Owns the local capture tracks and keeps every peer connection fed with
/// the currently active ones. Video source switches (camera to screen and
/// back) go through [`PeerConnection::replace_outgoing_track`], so remote
/// sides keep their existing media line and never renegotiate.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct TrackPublisher {
    #[derivative(Debug = "ignore")]
    provider: Arc<dyn MediaProvider>,
    state: Mutex<LocalMediaState>,
}

impl TrackPublisher {
    pub fn new(provider: Arc<dyn MediaProvider>) -> Self {
        Self {
            provider,
            state: Mutex::new(LocalMediaState::default()),
        }
    }

    /// Acquires camera and microphone. Called once before joining; a
    /// failure here aborts the join so the participant never enters the
    /// room without media.
    pub async fn acquire_local_media(&self) -> Result<(), Error> {
        let camera = self.provider.acquire(TrackSource::Camera).await?;
        let microphone = self.provider.acquire(TrackSource::Microphone).await?;

        let mut state = self.state.lock().await;
        state.camera = camera.into_iter().find(|h| h.kind == TrackKind::Video);
        state.microphone = microphone.into_iter().find(|h| h.kind == TrackKind::Audio);
        Ok(())
    }

    /// Attaches the currently active tracks to a freshly created peer
    /// connection, before its offer or answer is built. A kind that
    /// already has a sender is skipped, so a negotiation retry cannot
    /// attach a second video or audio track.
    pub async fn publish_to(&self, peer: &PeerConnection) -> Result<(), Error> {
        let existing: Vec<TrackKind> = peer
            .outgoing_tracks()
            .await
            .into_iter()
            .map(|(kind, _)| kind)
            .collect();

        let state = self.state.lock().await;
        if let Some(video) = state.active_video() {
            if !existing.contains(&TrackKind::Video) {
                peer.add_local_track(video).await?;
            }
        }
        if let Some(audio) = state.active_audio() {
            if !existing.contains(&TrackKind::Audio) {
                peer.add_local_track(audio).await?;
            }
        }
        Ok(())
    }

    /// The source currently feeding the outgoing video line.
    pub async fn active_video_source(&self) -> Option<TrackSource> {
        let state = self.state.lock().await;
        state.active_video().map(|h| h.source)
    }

    /// Handles a subscriber would render locally (self-view).
    pub async fn preview(&self) -> Vec<TrackHandle> {
        let state = self.state.lock().await;
        state
            .active_video()
            .into_iter()
            .chain(state.active_audio())
            .cloned()
            .collect()
    }

    pub async fn set_audio_enabled(&self, enabled: bool) {
        let state = self.state.lock().await;
        if let Some(audio) = state.active_audio() {
            audio.set_enabled(enabled);
        }
    }

    pub async fn set_video_enabled(&self, enabled: bool) {
        let state = self.state.lock().await;
        if let Some(video) = state.active_video() {
            video.set_enabled(enabled);
        }
    }

    /// Switches the outgoing video from camera to screen capture across
    /// every given peer, returning the screen video handle so the caller
    /// can watch for the capture ending. Acquisition happens before any
    /// state is touched: when it fails, the camera keeps streaming and
    /// this returns the error.
    pub async fn start_screen_share(
        &self,
        peers: &[Arc<PeerConnection>],
    ) -> Result<TrackHandle, Error> {
        {
            let state = self.state.lock().await;
            if state.screen_video.is_some() {
                return Err(Error::new_media(
                    "screen share is already active".to_string(),
                    MediaErrorKind::InvalidSourceError,
                ));
            }
        }

        let handles = self.provider.acquire(TrackSource::Screen).await?;
        let video = handles
            .iter()
            .find(|h| h.kind == TrackKind::Video)
            .cloned()
            .ok_or_else(|| {
                Error::new_media(
                    "screen capture yielded no video track".to_string(),
                    MediaErrorKind::AcquisitionError,
                )
            })?;
        let audio = handles.into_iter().find(|h| h.kind == TrackKind::Audio);

        let mut state = self.state.lock().await;
        state.screen_video = Some(video.clone());
        state.screen_audio = audio.clone();
        drop(state);

        self.fan_out(peers, TrackKind::Video, &video).await;
        if let Some(audio) = &audio {
            self.fan_out(peers, TrackKind::Audio, audio).await;
        }

        tracing::info!("screen share started with track {}", video.id);
        Ok(video)
    }

    /// Switches the outgoing video back to the camera. Idempotent: when
    /// no screen share is active this does nothing. The saved camera
    /// handle is reused while it is still live, otherwise a fresh capture
    /// is acquired.
    pub async fn stop_screen_share(&self, peers: &[Arc<PeerConnection>]) -> Result<(), Error> {
        let (screen_video, screen_audio) = {
            let mut state = self.state.lock().await;
            let Some(video) = state.screen_video.take() else {
                return Ok(());
            };
            (video, state.screen_audio.take())
        };

        let camera = self.reusable_handle(TrackSource::Camera, TrackKind::Video).await?;
        self.fan_out(peers, TrackKind::Video, &camera).await;

        if screen_audio.is_some() {
            let microphone = self
                .reusable_handle(TrackSource::Microphone, TrackKind::Audio)
                .await?;
            self.fan_out(peers, TrackKind::Audio, &microphone).await;
        }

        screen_video.stop();
        if let Some(audio) = screen_audio {
            audio.stop();
        }

        tracing::info!("screen share stopped, camera restored");
        Ok(())
    }

    /// Returns the stored handle for `source` when it is still live,
    /// otherwise acquires a replacement and stores it.
    async fn reusable_handle(
        &self,
        source: TrackSource,
        kind: TrackKind,
    ) -> Result<TrackHandle, Error> {
        {
            let state = self.state.lock().await;
            let stored = match source {
                TrackSource::Camera => state.camera.as_ref(),
                TrackSource::Microphone => state.microphone.as_ref(),
                TrackSource::Screen => None,
            };
            if let Some(handle) = stored {
                if handle.is_live() {
                    return Ok(handle.clone());
                }
            }
        }

        let fresh = self
            .provider
            .acquire(source)
            .await?
            .into_iter()
            .find(|h| h.kind == kind)
            .ok_or_else(|| {
                Error::new_media(
                    format!("{:?} capture yielded no {:?} track", source, kind),
                    MediaErrorKind::AcquisitionError,
                )
            })?;

        let mut state = self.state.lock().await;
        match source {
            TrackSource::Camera => state.camera = Some(fresh.clone()),
            TrackSource::Microphone => state.microphone = Some(fresh.clone()),
            TrackSource::Screen => {}
        }
        Ok(fresh)
    }

    /// Replaces the outgoing track of `kind` on every peer. Per-peer
    /// failures are logged and skipped; one broken connection must not
    /// stall the switch for the rest of the mesh.
    async fn fan_out(&self, peers: &[Arc<PeerConnection>], kind: TrackKind, handle: &TrackHandle) {
        for peer in peers {
            if let Err(err) = peer.replace_outgoing_track(kind, handle).await {
                tracing::warn!(
                    "failed to replace {:?} track for {}: {}",
                    kind,
                    peer.remote_id,
                    err
                );
            }
        }
    }

    /// Stops every capture track and clears the state. Called on leave.
    pub async fn stop_all(&self) {
        let mut state = self.state.lock().await;
        for handle in [
            state.camera.take(),
            state.microphone.take(),
            state.screen_video.take(),
            state.screen_audio.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.stop();
        }
    }
}
