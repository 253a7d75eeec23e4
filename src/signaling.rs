use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::session_description::RTCSessionDescription,
};

use crate::error::{Error, SignalingErrorKind};

/// Opaque identity of a call participant, stable for the lifetime of one
/// room session. Ids compare lexicographically, which is what the glare
/// tie-break in [`crate::registry::PeerRegistry`] relies on.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Addressing of a [`SignalingEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Broadcast,
    Peer(ParticipantId),
}

/// One signaling message. Ordering is guaranteed per sender per channel
/// only; the rest of the crate never assumes a global order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    pub from: ParticipantId,
    pub to: Recipient,
    #[serde(flatten)]
    pub payload: SignalingPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "snake_case")]
pub enum SignalingPayload {
    Join,
    Leave,
    Offer { sdp: RTCSessionDescription },
    Answer { sdp: RTCSessionDescription },
    IceCandidate { candidate: RTCIceCandidateInit },
}

impl SignalingEnvelope {
    pub fn join(from: ParticipantId, to: Recipient) -> Self {
        Self {
            from,
            to,
            payload: SignalingPayload::Join,
        }
    }

    pub fn leave(from: ParticipantId) -> Self {
        Self {
            from,
            to: Recipient::Broadcast,
            payload: SignalingPayload::Leave,
        }
    }

    pub fn offer(from: ParticipantId, to: ParticipantId, sdp: RTCSessionDescription) -> Self {
        Self {
            from,
            to: Recipient::Peer(to),
            payload: SignalingPayload::Offer { sdp },
        }
    }

    pub fn answer(from: ParticipantId, to: ParticipantId, sdp: RTCSessionDescription) -> Self {
        Self {
            from,
            to: Recipient::Peer(to),
            payload: SignalingPayload::Answer { sdp },
        }
    }

    pub fn ice_candidate(
        from: ParticipantId,
        to: ParticipantId,
        candidate: RTCIceCandidateInit,
    ) -> Self {
        Self {
            from,
            to: Recipient::Peer(to),
            payload: SignalingPayload::IceCandidate { candidate },
        }
    }

    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|err| {
            Error::new_signaling(
                format!("failed to encode envelope: {}", err),
                SignalingErrorKind::EncodeError,
            )
        })
    }

    pub fn decode(raw: &str) -> Result<Self, Error> {
        serde_json::from_str(raw).map_err(|err| {
            Error::new_signaling(
                format!("failed to decode envelope: {}", err),
                SignalingErrorKind::DecodeError,
            )
        })
    }
}

/// Outbound half of the signaling channel, provided by the embedding
/// application (a relay server connection, one instance per room).
/// Inbound envelopes reach the coordinator through the receiver handed to
/// [`crate::coordinator::ConferenceCoordinator::start`]; closing that
/// channel is treated as transport failure.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, envelope: SignalingEnvelope) -> Result<(), Error>;
    async fn close(&self);
}
