#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use meshcall::config::MeshConfig;
use meshcall::coordinator::{ConferenceCoordinator, ConferenceEvent};
use meshcall::error::{Error, MediaErrorKind, SignalingErrorKind};
use meshcall::signaling::{ParticipantId, Recipient, SignalingEnvelope, SignalingTransport};
use meshcall::track::{MediaProvider, TrackHandle, TrackKind, TrackSource};

/// In-process signaling relay: routes envelopes between attached
/// participants and keeps a log of everything sent, so tests can assert
/// on the wire traffic.
pub struct SignalingHub {
    inner: Mutex<HubInner>,
}

struct HubInner {
    participants: HashMap<ParticipantId, mpsc::UnboundedSender<SignalingEnvelope>>,
    log: Vec<SignalingEnvelope>,
}

impl SignalingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner {
                participants: HashMap::new(),
                log: vec![],
            }),
        })
    }

    /// Registers a participant and returns its transport plus the inbound
    /// message stream.
    pub fn attach(
        self: &Arc<Self>,
        id: ParticipantId,
    ) -> (Arc<HubTransport>, mpsc::UnboundedReceiver<SignalingEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap()
            .participants
            .insert(id.clone(), tx);
        let transport = Arc::new(HubTransport {
            hub: self.clone(),
            id,
        });
        (transport, rx)
    }

    /// Drops a participant's inbound sender, which its coordinator
    /// observes as transport failure.
    pub fn disconnect(&self, id: &ParticipantId) {
        self.inner.lock().unwrap().participants.remove(id);
    }

    /// Routes an envelope as if `envelope.from` had sent it. Used to
    /// script a fake endpoint that misbehaves on purpose.
    pub fn inject(&self, envelope: SignalingEnvelope) {
        self.route(envelope);
    }

    pub fn sent(&self) -> Vec<SignalingEnvelope> {
        self.inner.lock().unwrap().log.clone()
    }

    fn route(&self, envelope: SignalingEnvelope) {
        let inner = &mut *self.inner.lock().unwrap();
        inner.log.push(envelope.clone());
        match &envelope.to {
            Recipient::Broadcast => {
                for (id, tx) in &inner.participants {
                    if *id != envelope.from {
                        let _ = tx.send(envelope.clone());
                    }
                }
            }
            Recipient::Peer(to) => {
                if let Some(tx) = inner.participants.get(to) {
                    let _ = tx.send(envelope);
                }
            }
        }
    }
}

pub struct HubTransport {
    hub: Arc<SignalingHub>,
    id: ParticipantId,
}

#[async_trait]
impl SignalingTransport for HubTransport {
    async fn send(&self, envelope: SignalingEnvelope) -> Result<(), Error> {
        self.hub.route(envelope);
        Ok(())
    }

    async fn close(&self) {
        self.hub.disconnect(&self.id);
    }
}

/// Hub transport that can be told to start failing sends, simulating a
/// relay connection dying while the inbound channel is still open.
pub struct FlakyTransport {
    inner: Arc<HubTransport>,
    pub fail: AtomicBool,
}

impl FlakyTransport {
    pub fn new(inner: Arc<HubTransport>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl SignalingTransport for FlakyTransport {
    async fn send(&self, envelope: SignalingEnvelope) -> Result<(), Error> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(Error::new_signaling(
                "relay connection lost".to_string(),
                SignalingErrorKind::TransportClosedError,
            ));
        }
        self.inner.send(envelope).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

/// Deterministic capture device: every acquisition succeeds with fresh
/// static-sample tracks unless screen capture is told to fail. Issued
/// handles are remembered so tests can check they all get released.
pub struct FakeMedia {
    pub fail_screen: AtomicBool,
    counter: AtomicUsize,
    issued: Mutex<Vec<TrackHandle>>,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_screen: AtomicBool::new(false),
            counter: AtomicUsize::new(0),
            issued: Mutex::new(vec![]),
        })
    }

    pub fn issued(&self) -> Vec<TrackHandle> {
        self.issued.lock().unwrap().clone()
    }

    fn handle(&self, kind: TrackKind, source: TrackSource) -> TrackHandle {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let (mime, label) = match kind {
            TrackKind::Video => (MIME_TYPE_VP8, "video"),
            TrackKind::Audio => (MIME_TYPE_OPUS, "audio"),
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_owned(),
                ..Default::default()
            },
            format!("{:?}-{}-{}", source, label, n).to_lowercase(),
            "meshcall".to_owned(),
        ));
        let handle = TrackHandle::new(kind, source, track);
        self.issued.lock().unwrap().push(handle.clone());
        handle
    }
}

#[async_trait]
impl MediaProvider for FakeMedia {
    async fn acquire(&self, source: TrackSource) -> Result<Vec<TrackHandle>, Error> {
        match source {
            TrackSource::Camera => Ok(vec![self.handle(TrackKind::Video, source)]),
            TrackSource::Microphone => Ok(vec![self.handle(TrackKind::Audio, source)]),
            TrackSource::Screen => {
                if self.fail_screen.load(Ordering::Relaxed) {
                    Err(Error::new_media(
                        "screen capture denied".to_string(),
                        MediaErrorKind::AcquisitionError,
                    ))
                } else {
                    Ok(vec![
                        self.handle(TrackKind::Video, source),
                        self.handle(TrackKind::Audio, source),
                    ])
                }
            }
        }
    }
}

pub async fn start_participant(
    hub: &Arc<SignalingHub>,
    id: &str,
    config: MeshConfig,
) -> (
    Arc<ConferenceCoordinator>,
    mpsc::UnboundedReceiver<ConferenceEvent>,
    Arc<FakeMedia>,
) {
    let media = FakeMedia::new();
    let (transport, inbound) = hub.attach(ParticipantId::new(id));
    let (coordinator, events) = ConferenceCoordinator::start(
        ParticipantId::new(id),
        config,
        transport,
        media.clone(),
        inbound,
    )
    .await
    .unwrap();
    (coordinator, events, media)
}

/// Polls `cond` until it holds or five seconds pass.
pub async fn wait_for<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Drains `events` until one matches `pred`, panicking after five
/// seconds.
pub async fn expect_event<F>(
    events: &mut mpsc::UnboundedReceiver<ConferenceEvent>,
    what: &str,
    mut pred: F,
) -> ConferenceEvent
where
    F: FnMut(&ConferenceEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}
