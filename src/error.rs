use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    SignalingError(#[from] SignalingError),
    #[error(transparent)]
    PeerError(#[from] PeerError),
    #[error(transparent)]
    MediaError(#[from] MediaError),
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SignalingError {
    pub kind: SignalingErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct PeerError {
    pub kind: PeerErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct MediaError {
    pub kind: MediaErrorKind,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SignalingErrorKind {
    #[error("envelope decode error")]
    DecodeError,
    #[error("envelope encode error")]
    EncodeError,
    #[error("transport closed error")]
    TransportClosedError,
}

#[derive(Debug, thiserror::Error)]
pub enum PeerErrorKind {
    #[error("peer closed error")]
    PeerClosedError,
    #[error("local description error")]
    LocalDescriptionError,
}

#[derive(Debug, thiserror::Error)]
pub enum MediaErrorKind {
    #[error("media acquisition error")]
    AcquisitionError,
    #[error("track not found error")]
    TrackNotFoundError,
    #[error("invalid source error")]
    InvalidSourceError,
}

impl Error {
    pub fn new_signaling(message: String, kind: SignalingErrorKind) -> Error {
        Error::SignalingError(SignalingError { kind, message })
    }

    pub fn new_peer(message: String, kind: PeerErrorKind) -> Error {
        Error::PeerError(PeerError { kind, message })
    }

    pub fn new_media(message: String, kind: MediaErrorKind) -> Error {
        Error::MediaError(MediaError { kind, message })
    }
}

impl fmt::Debug for SignalingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("meshcall::SignalingError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("meshcall::PeerError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("meshcall::MediaError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}
