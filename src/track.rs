use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use webrtc::{
    rtp_transceiver::rtp_codec::RTPCodecType,
    track::track_local::TrackLocal,
};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub(crate) fn from_codec_type(codec_type: RTPCodecType) -> Option<Self> {
        match codec_type {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    Camera,
    Microphone,
    Screen,
}

/// A local capture track currently published (or publishable) to peers.
/// The handle carries ownership of the capture resource: `stop` releases
/// it for every clone, and peers only ever hold references through the
/// underlying [`TrackLocal`].
#[derive(Derivative)]
#[derivative(Clone, Debug)]
pub struct TrackHandle {
    pub id: String,
    pub kind: TrackKind,
    pub source: TrackSource,
    #[derivative(Debug = "ignore")]
    track: Arc<dyn TrackLocal + Send + Sync>,
    enabled: Arc<AtomicBool>,
    #[derivative(Debug = "ignore")]
    live: Arc<watch::Sender<bool>>,
}

impl TrackHandle {
    pub fn new(
        kind: TrackKind,
        source: TrackSource,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Self {
        let (live, _) = watch::channel(true);
        let handle = Self {
            id: track.id().to_string(),
            kind,
            source,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(live),
        };
        tracing::debug!("TrackHandle {} ({:?}/{:?}) is created", handle.id, handle.kind, handle.source);
        handle
    }

    pub fn local_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    /// Mute flag. Muting does not unpublish the track; writers are
    /// expected to pause while the handle is disabled.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Releases the capture resource. Idempotent; wakes `ended` waiters.
    pub fn stop(&self) {
        if self.live.send_replace(false) {
            tracing::debug!("TrackHandle {} is stopped", self.id);
        }
    }

    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    /// Resolves once the track has stopped, whether through [`stop`] or
    /// through the capture side ending it (e.g. the platform "Stop
    /// sharing" affordance).
    ///
    /// [`stop`]: TrackHandle::stop
    pub async fn ended(&self) {
        let mut live = self.live.subscribe();
        while *live.borrow_and_update() {
            if live.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Platform capture capability: cameras, microphones and screen capture
/// as fallible async acquisitions. `Camera` and `Microphone` yield one
/// handle; `Screen` yields a video handle plus, when the platform offers
/// system audio, an audio handle.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn acquire(&self, source: TrackSource) -> Result<Vec<TrackHandle>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::media_engine::MIME_TYPE_VP8;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    fn video_handle() -> TrackHandle {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "test-video".to_owned(),
            "meshcall".to_owned(),
        ));
        TrackHandle::new(TrackKind::Video, TrackSource::Camera, track)
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_wakes_waiters() {
        let handle = video_handle();
        assert!(handle.is_live());

        let waiter = handle.clone();
        let waiting = tokio::spawn(async move { waiter.ended().await });

        handle.stop();
        handle.stop();

        assert!(!handle.is_live());
        waiting.await.unwrap();
    }

    #[tokio::test]
    async fn ended_returns_immediately_for_stopped_handle() {
        let handle = video_handle();
        handle.stop();
        handle.ended().await;
    }

    #[test]
    fn mute_flag_is_shared_across_clones() {
        let handle = video_handle();
        let clone = handle.clone();

        handle.set_enabled(false);
        assert!(!clone.is_enabled());
    }
}
