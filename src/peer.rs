use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};

use derivative::Derivative;
use enclose::enc;
use tokio::sync::mpsc;
use webrtc::{
    api::{media_engine::MediaEngine, APIBuilder},
    ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::rtp_receiver::RTCRtpReceiver,
    rtp_transceiver::RTCRtpTransceiver,
    track::{track_local::TrackLocal, track_remote::TrackRemote},
};

use crate::{
    config::MeshConfig,
    error::{Error, MediaErrorKind, PeerErrorKind},
    ice::IceNegotiator,
    signaling::ParticipantId,
    track::{TrackHandle, TrackKind},
};

/// Which side originates the offer for a pair of participants. Decided
/// once per peer by the registry tie-break, never per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

/// Negotiation lifecycle of one peer connection.
///
/// ```text
/// New --(local offer sent)-----> OfferSent
/// New --(remote offer answered)-> AnswerSent
/// OfferSent --(answer received)-> Connected
/// AnswerSent --(ICE completes)--> Connected
/// * --(leave | failure)---------> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    New,
    OfferSent,
    AnswerSent,
    Connected,
    Closed,
}

/// Completions of async peer callbacks, re-entering the coordinator loop.
/// The generation lets the coordinator drop events that outlived their
/// registry entry.
pub enum PeerEvent {
    LocalCandidate {
        remote_id: ParticipantId,
        generation: u64,
        candidate: RTCIceCandidateInit,
    },
    TrackReceived {
        remote_id: ParticipantId,
        generation: u64,
        track: Arc<TrackRemote>,
    },
    StateChanged {
        remote_id: ParticipantId,
        generation: u64,
        state: RTCPeerConnectionState,
    },
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::LocalCandidate { remote_id, .. } => {
                write!(f, "PeerEvent::LocalCandidate({})", remote_id)
            }
            PeerEvent::TrackReceived { remote_id, .. } => {
                write!(f, "PeerEvent::TrackReceived({})", remote_id)
            }
            PeerEvent::StateChanged {
                remote_id, state, ..
            } => write!(f, "PeerEvent::StateChanged({}, {})", remote_id, state),
        }
    }
}

/// One bidirectional media connection to exactly one remote participant:
/// description exchange, its [`IceNegotiator`], the local tracks attached
/// to it and the negotiation status.
#[derive(Derivative)]
#[derivative(Clone, Debug)]
pub struct PeerConnection {
    pub remote_id: ParticipantId,
    pub role: NegotiationRole,
    pub generation: u64,
    #[derivative(Debug = "ignore")]
    peer_connection: Arc<RTCPeerConnection>,
    ice: Arc<IceNegotiator>,
    status: Arc<Mutex<ConnectionStatus>>,
    closed: Arc<AtomicBool>,
    #[derivative(Debug = "ignore")]
    created_at: Instant,
    #[derivative(Debug = "ignore")]
    event_sender: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerConnection {
    pub(crate) async fn new(
        remote_id: ParticipantId,
        role: NegotiationRole,
        generation: u64,
        config: &MeshConfig,
        event_sender: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<Self>, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_setting_engine(config.setting_engine())
            .build();

        let peer_connection = api.new_peer_connection(config.configuration()).await?;

        let peer = Self {
            remote_id,
            role,
            generation,
            peer_connection: Arc::new(peer_connection),
            ice: Arc::new(IceNegotiator::new()),
            status: Arc::new(Mutex::new(ConnectionStatus::New)),
            closed: Arc::new(AtomicBool::new(false)),
            created_at: Instant::now(),
            event_sender,
        };

        peer.connection_hooks();

        tracing::debug!("PeerConnection for {} is created", peer.remote_id);

        Ok(Arc::new(peer))
    }

    fn connection_hooks(&self) {
        let peer = self.peer_connection.clone();
        let ice = self.ice.clone();
        let sender = self.event_sender.clone();
        let remote_id = self.remote_id.clone();
        let generation = self.generation;

        // Fires as soon as gathering starts; candidates found before the
        // local description went out are parked in the IceNegotiator.
        peer.on_ice_candidate(Box::new(
            enc!( (ice, sender, remote_id) move |candidate: Option<RTCIceCandidate>| {
                Box::pin(enc!( (ice, sender, remote_id) async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            if let Some(init) = ice.push_local(init) {
                                let _ = sender.send(PeerEvent::LocalCandidate {
                                    remote_id,
                                    generation,
                                    candidate: init,
                                });
                            }
                        }
                        Err(err) => {
                            tracing::error!("failed to serialize ICE candidate: {}", err);
                        }
                    }
                }))
            }),
        ));

        let sender = self.event_sender.clone();
        let remote_id = self.remote_id.clone();
        peer.on_track(Box::new(enc!( (sender, remote_id)
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                Box::pin(enc!( (sender, remote_id) async move {
                    tracing::info!("on track {} from {}", track.id(), remote_id);
                    let _ = sender.send(PeerEvent::TrackReceived {
                        remote_id,
                        generation,
                        track,
                    });
                }))
            }
        )));

        let sender = self.event_sender.clone();
        let remote_id = self.remote_id.clone();
        peer.on_peer_connection_state_change(Box::new(enc!( (sender, remote_id)
            move |state: RTCPeerConnectionState| {
                Box::pin(enc!( (sender, remote_id) async move {
                    tracing::debug!("peer connection state for {}: {}", remote_id, state);
                    let _ = sender.send(PeerEvent::StateChanged {
                        remote_id,
                        generation,
                        state,
                    });
                }))
            }
        )));
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    pub(crate) fn set_status(&self, next: ConnectionStatus) {
        let mut status = self.status.lock().expect("status lock poisoned");
        if *status == ConnectionStatus::Closed {
            return;
        }
        tracing::debug!(
            "peer {} status {:?} -> {:?}",
            self.remote_id,
            *status,
            next
        );
        *status = next;
    }

    /// Time spent since creation, used by the negotiation timeout sweep.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::new_peer(
                format!("peer {} is closed", self.remote_id),
                PeerErrorKind::PeerClosedError,
            ));
        }
        Ok(())
    }

    /// Creates and installs the local offer. Returns the offer to send
    /// plus any ICE candidates that were queued before the description
    /// existed, in the order they must go out.
    pub async fn create_offer_sdp(
        &self,
    ) -> Result<(RTCSessionDescription, Vec<RTCIceCandidateInit>), Error> {
        self.ensure_open()?;

        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer).await?;
        let sdp = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                Error::new_peer(
                    "failed to set local description".to_string(),
                    PeerErrorKind::LocalDescriptionError,
                )
            })?;

        let flushed = self.ice.local_description_sent();
        self.set_status(ConnectionStatus::OfferSent);
        Ok((sdp, flushed))
    }

    /// Applies a remote offer and produces the answer. Queued remote
    /// candidates are drained here, immediately after the remote
    /// description lands. A `Connected` peer stays `Connected`
    /// (renegotiation keeps the existing track bindings).
    pub async fn answer_offer(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<(RTCSessionDescription, Vec<RTCIceCandidateInit>), Error> {
        self.ensure_open()?;

        self.peer_connection.set_remote_description(offer).await?;
        self.apply_queued_remote_candidates().await;

        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection.set_local_description(answer).await?;
        let sdp = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                Error::new_peer(
                    "failed to set local description".to_string(),
                    PeerErrorKind::LocalDescriptionError,
                )
            })?;

        let flushed = self.ice.local_description_sent();
        if self.status() != ConnectionStatus::Connected {
            self.set_status(ConnectionStatus::AnswerSent);
        }
        Ok((sdp, flushed))
    }

    /// Applies the remote answer to our offer and marks the peer
    /// `Connected`.
    pub async fn apply_answer(&self, answer: RTCSessionDescription) -> Result<(), Error> {
        self.ensure_open()?;

        self.peer_connection.set_remote_description(answer).await?;
        self.apply_queued_remote_candidates().await;
        self.set_status(ConnectionStatus::Connected);
        Ok(())
    }

    async fn apply_queued_remote_candidates(&self) {
        for candidate in self.ice.remote_description_applied() {
            tracing::debug!("adding pending ICE candidate: {:#?}", candidate);
            if let Err(err) = self.peer_connection.add_ice_candidate(candidate).await {
                tracing::error!("failed to add_ice_candidate: {}", err);
            }
        }
    }

    /// Feeds a remote ICE candidate, applying it immediately once the
    /// remote description is in place and queueing it otherwise.
    pub async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        self.ensure_open()?;

        if let Some(candidate) = self.ice.push_remote(candidate) {
            self.peer_connection.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Attaches a local track to the outgoing side of this connection.
    pub async fn add_local_track(&self, handle: &TrackHandle) -> Result<(), Error> {
        self.ensure_open()?;

        self.peer_connection.add_track(handle.local_track()).await?;
        Ok(())
    }

    /// Replaces the outgoing track of the given kind in place, without
    /// renegotiating the media line. This is what makes a camera/screen
    /// switch imperceptible to the remote side.
    pub async fn replace_outgoing_track(
        &self,
        kind: TrackKind,
        handle: &TrackHandle,
    ) -> Result<(), Error> {
        self.ensure_open()?;

        for sender in self.peer_connection.get_senders().await {
            let Some(current) = sender.track().await else {
                continue;
            };
            if TrackKind::from_codec_type(current.kind()) == Some(kind) {
                sender.replace_track(Some(handle.local_track())).await?;
                return Ok(());
            }
        }

        Err(Error::new_media(
            format!("no outgoing {:?} track for peer {}", kind, self.remote_id),
            MediaErrorKind::TrackNotFoundError,
        ))
    }

    /// Ids of the tracks currently attached to the outgoing senders.
    pub async fn outgoing_tracks(&self) -> Vec<(TrackKind, String)> {
        let mut tracks = vec![];
        for sender in self.peer_connection.get_senders().await {
            if let Some(track) = sender.track().await {
                if let Some(kind) = TrackKind::from_codec_type(track.kind()) {
                    tracks.push((kind, track.id().to_string()));
                }
            }
        }
        tracks
    }

    /// Closes the underlying transport and discards queued candidates.
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.ice.discard_pending();
        self.set_status(ConnectionStatus::Closed);
        self.peer_connection.close().await?;
        Ok(())
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        tracing::debug!("PeerConnection for {} is dropped", self.remote_id);
    }
}
