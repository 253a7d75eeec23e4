use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use derivative::Derivative;
use enclose::enc;
use tokio::sync::{mpsc, watch, Mutex};
use webrtc::{
    peer_connection::peer_connection_state::RTCPeerConnectionState,
    track::track_remote::TrackRemote,
};

use crate::{
    config::MeshConfig,
    error::Error,
    peer::{ConnectionStatus, NegotiationRole, PeerConnection, PeerEvent},
    publisher::TrackPublisher,
    registry::PeerRegistry,
    signaling::{ParticipantId, Recipient, SignalingEnvelope, SignalingPayload, SignalingTransport},
    track::{MediaProvider, TrackHandle, TrackKind, TrackSource},
};

/// A remote participant's media track as rendered state. Streams for a
/// participant disappear from the map the moment the participant leaves
/// or times out.
#[derive(Derivative)]
#[derivative(Clone, Debug)]
pub struct RemoteStream {
    pub participant: ParticipantId,
    pub kind: Option<TrackKind>,
    pub track_id: String,
    #[derivative(Debug = "ignore")]
    pub track: Arc<TrackRemote>,
}

/// Notifications for the embedding application.
#[derive(Debug, Clone)]
pub enum ConferenceEvent {
    ParticipantJoined(ParticipantId),
    ParticipantConnected(ParticipantId),
    ParticipantLeft(ParticipantId),
    StreamAdded(RemoteStream),
    NegotiationTimedOut(ParticipantId),
    ScreenShareEnded,
    TransportFailed,
    Left,
}

/// Runs one participant's side of a mesh conference: owns the registry
/// and publisher, consumes inbound signaling and peer callback
/// completions on a single event loop, and keeps the reactive stream map
/// up to date.
///
/// All mutations of shared state happen on the event loop task or behind
/// the registry lock, so signaling races (glare, late answers, candidates
/// for dead peers) resolve deterministically.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ConferenceCoordinator {
    local_id: ParticipantId,
    config: MeshConfig,
    #[derivative(Debug = "ignore")]
    transport: Arc<dyn SignalingTransport>,
    publisher: Arc<TrackPublisher>,
    registry: Arc<Mutex<PeerRegistry>>,
    #[derivative(Debug = "ignore")]
    peer_event_sender: mpsc::UnboundedSender<PeerEvent>,
    #[derivative(Debug = "ignore")]
    event_sender: mpsc::UnboundedSender<ConferenceEvent>,
    #[derivative(Debug = "ignore")]
    streams: watch::Sender<HashMap<ParticipantId, Vec<RemoteStream>>>,
    #[derivative(Debug = "ignore")]
    shutdown: watch::Sender<bool>,
    left: Arc<AtomicBool>,
}

impl ConferenceCoordinator {
    /// Joins the room: acquires local media, announces the join and
    /// starts the event loop. Media acquisition failure aborts the join
    /// before anything reaches the wire.
    pub async fn start(
        local_id: ParticipantId,
        config: MeshConfig,
        transport: Arc<dyn SignalingTransport>,
        provider: Arc<dyn MediaProvider>,
        inbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ConferenceEvent>), Error> {
        let publisher = Arc::new(TrackPublisher::new(provider));
        publisher.acquire_local_media().await?;

        let (peer_event_sender, peer_events) = mpsc::unbounded_channel();
        let (event_sender, events) = mpsc::unbounded_channel();
        let (streams, _) = watch::channel(HashMap::new());
        let (shutdown, shutdown_signal) = watch::channel(false);

        let coordinator = Arc::new(Self {
            local_id: local_id.clone(),
            config,
            transport,
            publisher,
            registry: Arc::new(Mutex::new(PeerRegistry::new(local_id))),
            peer_event_sender,
            event_sender,
            streams,
            shutdown,
            left: Arc::new(AtomicBool::new(false)),
        });

        coordinator
            .send(SignalingEnvelope::join(
                coordinator.local_id.clone(),
                Recipient::Broadcast,
            ))
            .await;

        tokio::spawn(enc!( (coordinator) async move {
            coordinator
                .event_loop(inbound, peer_events, shutdown_signal)
                .await;
        }));

        tracing::info!("conference started as {}", coordinator.local_id);
        Ok((coordinator, events))
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Remote participants currently known, in no particular order.
    pub async fn participants(&self) -> Vec<ParticipantId> {
        self.registry.lock().await.ids()
    }

    pub async fn peer_status(&self, remote_id: &ParticipantId) -> Option<ConnectionStatus> {
        self.registry
            .lock()
            .await
            .get(remote_id)
            .map(|peer| peer.status())
    }

    pub async fn peer_role(&self, remote_id: &ParticipantId) -> Option<NegotiationRole> {
        self.registry
            .lock()
            .await
            .get(remote_id)
            .map(|peer| peer.role)
    }

    /// Local self-view handles.
    pub async fn preview(&self) -> Vec<TrackHandle> {
        self.publisher.preview().await
    }

    pub async fn active_video_source(&self) -> Option<TrackSource> {
        self.publisher.active_video_source().await
    }

    pub async fn set_audio_enabled(&self, enabled: bool) {
        self.publisher.set_audio_enabled(enabled).await;
    }

    pub async fn set_video_enabled(&self, enabled: bool) {
        self.publisher.set_video_enabled(enabled).await;
    }

    /// Subscribe to the remote stream map. The receiver observes every
    /// change: tracks arriving, participants leaving.
    pub fn streams(&self) -> watch::Receiver<HashMap<ParticipantId, Vec<RemoteStream>>> {
        self.streams.subscribe()
    }

    /// Switches the outgoing video to screen capture on every peer and
    /// watches the capture so that the camera comes back automatically
    /// when the platform ends the share.
    pub async fn start_screen_share(&self) -> Result<(), Error> {
        let peers = self.peer_snapshot().await;
        let screen = self.publisher.start_screen_share(&peers).await?;

        let publisher = self.publisher.clone();
        let registry = self.registry.clone();
        let left = self.left.clone();
        let event_sender = self.event_sender.clone();
        tokio::spawn(async move {
            screen.ended().await;
            if left.load(Ordering::Acquire) {
                return;
            }
            // A user-initiated stop unpublishes the handle before
            // stopping it; only a capture-side end leaves it active.
            let still_published = publisher
                .preview()
                .await
                .iter()
                .any(|h| h.id == screen.id);
            if !still_published {
                return;
            }
            tracing::info!("screen capture ended, restoring camera");
            let peers: Vec<Arc<PeerConnection>> = registry
                .lock()
                .await
                .iter()
                .map(|(_, peer)| peer.clone())
                .collect();
            if let Err(err) = publisher.stop_screen_share(&peers).await {
                tracing::error!("failed to restore camera: {}", err);
            }
            let _ = event_sender.send(ConferenceEvent::ScreenShareEnded);
        });

        Ok(())
    }

    /// Switches the outgoing video back to the camera. Idempotent.
    pub async fn stop_screen_share(&self) -> Result<(), Error> {
        let peers = self.peer_snapshot().await;
        self.publisher.stop_screen_share(&peers).await
    }

    /// Leaves the room in order: announce, release capture, close peers,
    /// drop the stream map, close the transport. Safe to call twice.
    pub async fn leave(&self) {
        if self.left.swap(true, Ordering::AcqRel) {
            return;
        }

        self.send(SignalingEnvelope::leave(self.local_id.clone()))
            .await;
        self.publisher.stop_all().await;

        let peers = self.registry.lock().await.clear();
        for peer in peers {
            if let Err(err) = peer.close().await {
                tracing::warn!("failed to close peer {}: {}", peer.remote_id, err);
            }
        }

        self.streams.send_replace(HashMap::new());
        self.transport.close().await;
        let _ = self.shutdown.send(true);
        let _ = self.event_sender.send(ConferenceEvent::Left);

        tracing::info!("{} left the conference", self.local_id);
    }

    async fn peer_snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.registry
            .lock()
            .await
            .iter()
            .map(|(_, peer)| peer.clone())
            .collect()
    }

    /// An outbound failure means the relay connection is gone; the
    /// conference cannot limp along with peers nobody can signal.
    async fn send(&self, envelope: SignalingEnvelope) {
        if let Err(err) = self.transport.send(envelope).await {
            tracing::error!("signaling send failed: {}", err);
            self.transport_failed().await;
        }
    }

    async fn event_loop(
        &self,
        mut inbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut sweep = tokio::time::interval(self.config.timeout_sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                envelope = inbound.recv() => {
                    match envelope {
                        Some(envelope) => self.dispatch(envelope).await,
                        None => {
                            self.transport_failed().await;
                            break;
                        }
                    }
                }
                Some(event) = peer_events.recv() => {
                    self.handle_peer_event(event).await;
                }
                _ = sweep.tick() => {
                    self.sweep_stalled().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("event loop for {} finished", self.local_id);
    }

    async fn dispatch(&self, envelope: SignalingEnvelope) {
        // Nothing may re-register peers once teardown has started.
        if self.left.load(Ordering::Acquire) {
            return;
        }
        // Broadcast echoes of our own messages come back on some relays.
        if envelope.from == self.local_id {
            return;
        }
        if let Recipient::Peer(to) = &envelope.to {
            if *to != self.local_id {
                return;
            }
        }

        let from = envelope.from.clone();
        match envelope.payload {
            SignalingPayload::Join => self.handle_join(from, envelope.to).await,
            SignalingPayload::Leave => self.handle_leave(from).await,
            SignalingPayload::Offer { sdp } => self.handle_offer(from, sdp).await,
            SignalingPayload::Answer { sdp } => self.handle_answer(from, sdp).await,
            SignalingPayload::IceCandidate { candidate } => {
                self.handle_candidate(from, candidate).await
            }
        }
    }

    /// A broadcast `Join` announces a newcomer; a directed `Join` is an
    /// existing participant introducing itself to us. Either way the peer
    /// gets registered, and the offerer side (by tie-break) starts
    /// negotiating. The directed reply to a broadcast is what teaches a
    /// newcomer the current roster without a tracking server.
    async fn handle_join(&self, from: ParticipantId, to: Recipient) {
        let mut registry = self.registry.lock().await;
        let known = registry.get(&from).is_some();
        let peer = match registry
            .get_or_create(&from, &self.config, self.peer_event_sender.clone())
            .await
        {
            Ok(peer) => peer,
            Err(err) => {
                tracing::error!("failed to create peer for {}: {}", from, err);
                return;
            }
        };
        drop(registry);

        if !known {
            let _ = self
                .event_sender
                .send(ConferenceEvent::ParticipantJoined(from.clone()));
            if to == Recipient::Broadcast {
                self.send(SignalingEnvelope::join(
                    self.local_id.clone(),
                    Recipient::Peer(from.clone()),
                ))
                .await;
            }
        }

        if peer.role == NegotiationRole::Offerer && peer.status() == ConnectionStatus::New {
            self.negotiate(&peer).await;
        }
    }

    async fn negotiate(&self, peer: &Arc<PeerConnection>) {
        if let Err(err) = self.publisher.publish_to(peer).await {
            tracing::error!("failed to publish tracks to {}: {}", peer.remote_id, err);
            return;
        }
        match peer.create_offer_sdp().await {
            Ok((offer, flushed)) => {
                self.send(SignalingEnvelope::offer(
                    self.local_id.clone(),
                    peer.remote_id.clone(),
                    offer,
                ))
                .await;
                for candidate in flushed {
                    self.send(SignalingEnvelope::ice_candidate(
                        self.local_id.clone(),
                        peer.remote_id.clone(),
                        candidate,
                    ))
                    .await;
                }
            }
            Err(err) => {
                tracing::error!("failed to create offer for {}: {}", peer.remote_id, err);
            }
        }
    }

    async fn handle_leave(&self, from: ParticipantId) {
        let removed = self.registry.lock().await.remove(&from);
        let Some(peer) = removed else {
            return;
        };
        if let Err(err) = peer.close().await {
            tracing::warn!("failed to close peer {}: {}", from, err);
        }
        self.streams.send_modify(|map| {
            map.remove(&from);
        });
        let _ = self
            .event_sender
            .send(ConferenceEvent::ParticipantLeft(from));
    }

    async fn handle_offer(
        &self,
        from: ParticipantId,
        sdp: webrtc::peer_connection::sdp::session_description::RTCSessionDescription,
    ) {
        let mut registry = self.registry.lock().await;
        let peer = match registry
            .get_or_create(&from, &self.config, self.peer_event_sender.clone())
            .await
        {
            Ok(peer) => peer,
            Err(err) => {
                tracing::error!("failed to create peer for {}: {}", from, err);
                return;
            }
        };
        drop(registry);

        // Glare: both sides offered. The tie-break offerer ignores the
        // inbound offer and waits for its answer.
        if peer.role == NegotiationRole::Offerer && peer.status() == ConnectionStatus::OfferSent {
            tracing::warn!("discarding glare offer from {}", from);
            return;
        }

        if peer.status() == ConnectionStatus::New {
            if let Err(err) = self.publisher.publish_to(&peer).await {
                tracing::error!("failed to publish tracks to {}: {}", from, err);
                return;
            }
        }

        match peer.answer_offer(sdp).await {
            Ok((answer, flushed)) => {
                self.send(SignalingEnvelope::answer(
                    self.local_id.clone(),
                    from.clone(),
                    answer,
                ))
                .await;
                for candidate in flushed {
                    self.send(SignalingEnvelope::ice_candidate(
                        self.local_id.clone(),
                        from.clone(),
                        candidate,
                    ))
                    .await;
                }
            }
            Err(err) => {
                tracing::error!("failed to answer offer from {}: {}", from, err);
            }
        }
    }

    async fn handle_answer(
        &self,
        from: ParticipantId,
        sdp: webrtc::peer_connection::sdp::session_description::RTCSessionDescription,
    ) {
        let peer = self.registry.lock().await.get(&from);
        let Some(peer) = peer else {
            // Answer for a peer that was removed meanwhile.
            tracing::debug!("discarding answer from unknown peer {}", from);
            return;
        };

        let status = peer.status();
        match status {
            ConnectionStatus::OfferSent | ConnectionStatus::Connected => {
                match peer.apply_answer(sdp).await {
                    Ok(()) => {
                        if status != ConnectionStatus::Connected {
                            let _ = self
                                .event_sender
                                .send(ConferenceEvent::ParticipantConnected(from));
                        }
                    }
                    Err(err) => {
                        tracing::error!("failed to apply answer from {}: {}", from, err);
                    }
                }
            }
            status => {
                tracing::warn!("discarding answer from {} in status {:?}", from, status);
            }
        }
    }

    async fn handle_candidate(
        &self,
        from: ParticipantId,
        candidate: webrtc::ice_transport::ice_candidate::RTCIceCandidateInit,
    ) {
        let peer = self.registry.lock().await.get(&from);
        let Some(peer) = peer else {
            tracing::debug!("discarding candidate from unknown peer {}", from);
            return;
        };
        if let Err(err) = peer.add_remote_candidate(candidate).await {
            tracing::warn!("failed to add candidate from {}: {}", from, err);
        }
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate {
                remote_id,
                generation,
                candidate,
            } => {
                // Candidates of a replaced connection must not leak into
                // the successor's negotiation.
                let current = self.registry.lock().await.get_current(&remote_id, generation);
                if current.is_none() {
                    tracing::debug!("dropping stale candidate for {}", remote_id);
                    return;
                }
                self.send(SignalingEnvelope::ice_candidate(
                    self.local_id.clone(),
                    remote_id,
                    candidate,
                ))
                .await;
            }
            PeerEvent::TrackReceived {
                remote_id,
                generation,
                track,
            } => {
                let current = self.registry.lock().await.get_current(&remote_id, generation);
                if current.is_none() {
                    tracing::debug!("dropping stale track for {}", remote_id);
                    return;
                }
                let stream = RemoteStream {
                    participant: remote_id.clone(),
                    kind: TrackKind::from_codec_type(track.kind()),
                    track_id: track.id(),
                    track,
                };
                self.streams.send_modify(|map| {
                    let entry = map.entry(remote_id).or_default();
                    entry.retain(|s| s.track_id != stream.track_id);
                    entry.push(stream.clone());
                });
                let _ = self.event_sender.send(ConferenceEvent::StreamAdded(stream));
            }
            PeerEvent::StateChanged {
                remote_id,
                generation,
                state,
            } => {
                let current = self.registry.lock().await.get_current(&remote_id, generation);
                let Some(peer) = current else {
                    return;
                };
                match state {
                    RTCPeerConnectionState::Connected => {
                        if peer.status() == ConnectionStatus::AnswerSent {
                            peer.set_status(ConnectionStatus::Connected);
                            let _ = self
                                .event_sender
                                .send(ConferenceEvent::ParticipantConnected(remote_id));
                        }
                    }
                    RTCPeerConnectionState::Failed => {
                        tracing::warn!("connection to {} failed", remote_id);
                        self.handle_leave(remote_id).await;
                    }
                    _ => {}
                }
            }
        }
    }

    /// Removes peers stuck mid-negotiation past the configured timeout.
    /// A later `Join` from the same participant starts over with a fresh
    /// connection and generation.
    async fn sweep_stalled(&self) {
        let stalled = self
            .registry
            .lock()
            .await
            .stalled(self.config.negotiation_timeout);
        for peer in stalled {
            tracing::warn!(
                "negotiation with {} timed out in status {:?}",
                peer.remote_id,
                peer.status()
            );
            self.registry.lock().await.remove(&peer.remote_id);
            if let Err(err) = peer.close().await {
                tracing::warn!("failed to close peer {}: {}", peer.remote_id, err);
            }
            self.streams.send_modify(|map| {
                map.remove(&peer.remote_id);
            });
            let _ = self
                .event_sender
                .send(ConferenceEvent::NegotiationTimedOut(peer.remote_id.clone()));
        }
    }

    /// The signaling channel failed underneath us, inbound (channel
    /// closed) or outbound (send error): tear down every connection and
    /// surface the failure.
    async fn transport_failed(&self) {
        if self.left.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::error!("signaling transport failed, shutting down");

        self.publisher.stop_all().await;
        let peers = self.registry.lock().await.clear();
        for peer in peers {
            if let Err(err) = peer.close().await {
                tracing::warn!("failed to close peer {}: {}", peer.remote_id, err);
            }
        }
        self.streams.send_replace(HashMap::new());
        let _ = self.shutdown.send(true);
        let _ = self.event_sender.send(ConferenceEvent::TransportFailed);
    }
}

impl Drop for ConferenceCoordinator {
    fn drop(&mut self) {
        tracing::debug!("ConferenceCoordinator for {} is dropped", self.local_id);
    }
}
