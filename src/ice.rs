use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Buffers ICE candidates on both sides of one peer connection until the
/// matching description is in place, hiding the race between candidate
/// discovery and offer/answer exchange.
///
/// Remote candidates arriving before `set_remote_description` are queued
/// and drained exactly once afterwards; anything later is applied
/// immediately. Locally generated candidates are held back until the local
/// description has been handed to signaling, so the remote side never sees
/// a candidate it cannot associate.
#[derive(Debug, Default)]
pub struct IceNegotiator {
    pending_remote: Mutex<Vec<RTCIceCandidateInit>>,
    pending_local: Mutex<Vec<RTCIceCandidateInit>>,
    remote_ready: AtomicBool,
    local_ready: AtomicBool,
}

impl IceNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the candidate when it can be applied right away, `None`
    /// when it was queued. Duplicate deliveries of a queued candidate are
    /// absorbed here.
    pub fn push_remote(&self, candidate: RTCIceCandidateInit) -> Option<RTCIceCandidateInit> {
        if self.remote_ready.load(Ordering::Acquire) {
            return Some(candidate);
        }

        let mut pending = self
            .pending_remote
            .lock()
            .expect("pending_remote lock poisoned");
        if !pending.iter().any(|c| c.candidate == candidate.candidate) {
            pending.push(candidate);
        }
        None
    }

    /// Marks the remote description as applied and drains the queue. The
    /// drain happens once; repeat calls (renegotiation) return nothing.
    pub fn remote_description_applied(&self) -> Vec<RTCIceCandidateInit> {
        if self.remote_ready.swap(true, Ordering::AcqRel) {
            return vec![];
        }
        let mut pending = self
            .pending_remote
            .lock()
            .expect("pending_remote lock poisoned");
        std::mem::take(&mut *pending)
    }

    /// Returns the candidate when the local description has already been
    /// sent, `None` when it was queued for the flush.
    pub fn push_local(&self, candidate: RTCIceCandidateInit) -> Option<RTCIceCandidateInit> {
        if self.local_ready.load(Ordering::Acquire) {
            return Some(candidate);
        }

        let mut pending = self
            .pending_local
            .lock()
            .expect("pending_local lock poisoned");
        pending.push(candidate);
        None
    }

    /// Marks the local description as sent and flushes candidates that
    /// were generated before it went out.
    pub fn local_description_sent(&self) -> Vec<RTCIceCandidateInit> {
        self.local_ready.store(true, Ordering::Release);
        let mut pending = self
            .pending_local
            .lock()
            .expect("pending_local lock poisoned");
        std::mem::take(&mut *pending)
    }

    /// Drops everything still queued. Used when the peer is removed.
    pub fn discard_pending(&self) {
        self.pending_remote
            .lock()
            .expect("pending_remote lock poisoned")
            .clear();
        self.pending_local
            .lock()
            .expect("pending_local lock poisoned")
            .clear();
    }
}
