#![deny(missing_debug_implementations)]
//! # Meshcall
//! Meshcall manages the peer connections of one participant in a
//! full-mesh WebRTC conference: offer/answer negotiation with
//! deterministic glare resolution, trickle ICE buffering, and live
//! switching of the published video source (camera or screen capture)
//! without renegotiation. Signaling delivery is not included, please
//! connect your own relay through the [`signaling::SignalingTransport`]
//! trait and feed inbound messages to the
//! [`coordinator::ConferenceCoordinator`].

/// Configuration for [`coordinator::ConferenceCoordinator`] and every
/// [`peer::PeerConnection`] it creates.
pub mod config;
/// The per-participant event loop, peer lifecycle and stream map.
pub mod coordinator;
pub mod error;
/// Trickle ICE candidate buffering for one peer connection.
pub mod ice;
/// [`webrtc::peer_connection::RTCPeerConnection`] wrapper with the
/// negotiation state machine.
pub mod peer;
/// Local capture tracks and fan-out replacement across peers.
pub mod publisher;
/// Peer bookkeeping and the glare tie-break.
pub mod registry;
/// Message envelope, participant identity and the transport seam.
pub mod signaling;
/// Track handles and the platform media capture seam.
pub mod track;
