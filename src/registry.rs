use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
    config::MeshConfig,
    error::Error,
    peer::{ConnectionStatus, NegotiationRole, PeerConnection, PeerEvent},
    signaling::ParticipantId,
};

/// All peer connections of one local participant, keyed by remote id.
/// At most one connection per remote exists at any time; replacing an
/// entry bumps a generation counter so that completions of the replaced
/// connection can be told apart from the live one.
#[derive(Debug)]
pub struct PeerRegistry {
    local_id: ParticipantId,
    peers: HashMap<ParticipantId, Arc<PeerConnection>>,
    next_generation: u64,
}

impl PeerRegistry {
    pub fn new(local_id: ParticipantId) -> Self {
        Self {
            local_id,
            peers: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Glare tie-break: for any pair the lexicographically lower id is
    /// the [`NegotiationRole::Offerer`]. Both sides compute this locally
    /// and agree without coordination.
    pub fn offer_role(&self, remote_id: &ParticipantId) -> NegotiationRole {
        if self.local_id < *remote_id {
            NegotiationRole::Offerer
        } else {
            NegotiationRole::Answerer
        }
    }

    /// Returns the existing connection for `remote_id`, or creates one
    /// with the tie-break role and a fresh generation.
    pub async fn get_or_create(
        &mut self,
        remote_id: &ParticipantId,
        config: &MeshConfig,
        event_sender: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<PeerConnection>, Error> {
        if let Some(peer) = self.peers.get(remote_id) {
            return Ok(peer.clone());
        }

        self.next_generation += 1;
        let peer = PeerConnection::new(
            remote_id.clone(),
            self.offer_role(remote_id),
            self.next_generation,
            config,
            event_sender,
        )
        .await?;
        self.peers.insert(remote_id.clone(), peer.clone());
        tracing::debug!(
            "registered peer {} as {:?} (generation {})",
            remote_id,
            peer.role,
            peer.generation
        );
        Ok(peer)
    }

    pub fn get(&self, remote_id: &ParticipantId) -> Option<Arc<PeerConnection>> {
        self.peers.get(remote_id).cloned()
    }

    /// Resolves a peer only when `generation` still matches the live
    /// entry. Completions carrying a stale generation get `None` and must
    /// be dropped by the caller.
    pub fn get_current(
        &self,
        remote_id: &ParticipantId,
        generation: u64,
    ) -> Option<Arc<PeerConnection>> {
        self.peers
            .get(remote_id)
            .filter(|peer| peer.generation == generation)
            .cloned()
    }

    /// Removes the entry for `remote_id`. Returns whether an entry
    /// existed; removing an absent peer is a no-op.
    pub fn remove(&mut self, remote_id: &ParticipantId) -> Option<Arc<PeerConnection>> {
        let removed = self.peers.remove(remote_id);
        if removed.is_some() {
            tracing::debug!("removed peer {}", remote_id);
        }
        removed
    }

    pub fn ids(&self) -> Vec<ParticipantId> {
        self.peers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParticipantId, &Arc<PeerConnection>)> {
        self.peers.iter()
    }

    pub fn connected(&self) -> Vec<Arc<PeerConnection>> {
        self.peers
            .values()
            .filter(|peer| peer.status() == ConnectionStatus::Connected)
            .cloned()
            .collect()
    }

    /// Peers stuck mid-negotiation longer than `timeout`, candidates for
    /// the coordinator's sweep.
    pub fn stalled(&self, timeout: std::time::Duration) -> Vec<Arc<PeerConnection>> {
        self.peers
            .values()
            .filter(|peer| {
                !matches!(
                    peer.status(),
                    ConnectionStatus::Connected | ConnectionStatus::Closed
                ) && peer.age() > timeout
            })
            .cloned()
            .collect()
    }

    /// Empties the registry, handing back every connection so the caller
    /// can close them in order.
    pub fn clear(&mut self) -> Vec<Arc<PeerConnection>> {
        self.peers.drain().map(|(_, peer)| peer).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(local: &str) -> PeerRegistry {
        PeerRegistry::new(ParticipantId::new(local))
    }

    #[test]
    fn lower_id_offers() {
        let reg = registry("alice");
        assert_eq!(
            reg.offer_role(&ParticipantId::new("bob")),
            NegotiationRole::Offerer
        );

        let reg = registry("zoe");
        assert_eq!(
            reg.offer_role(&ParticipantId::new("bob")),
            NegotiationRole::Answerer
        );
    }

    #[test]
    fn tie_break_is_symmetric() {
        let a = registry("alice");
        let b = registry("bob");
        let role_at_a = a.offer_role(&ParticipantId::new("bob"));
        let role_at_b = b.offer_role(&ParticipantId::new("alice"));

        // Exactly one side offers.
        assert_ne!(role_at_a, role_at_b);
    }

    #[tokio::test]
    async fn get_or_create_never_duplicates() {
        let mut reg = registry("alice");
        let (tx, _rx) = mpsc::unbounded_channel();
        let bob = ParticipantId::new("bob");

        let first = reg
            .get_or_create(&bob, &MeshConfig::default(), tx.clone())
            .await
            .unwrap();
        let second = reg
            .get_or_create(&bob, &MeshConfig::default(), tx)
            .await
            .unwrap();

        assert_eq!(reg.len(), 1);
        assert_eq!(first.generation, second.generation);
    }

    #[tokio::test]
    async fn recreating_a_peer_bumps_the_generation() {
        let mut reg = registry("alice");
        let (tx, _rx) = mpsc::unbounded_channel();
        let bob = ParticipantId::new("bob");

        let first = reg
            .get_or_create(&bob, &MeshConfig::default(), tx.clone())
            .await
            .unwrap();
        reg.remove(&bob);
        let second = reg
            .get_or_create(&bob, &MeshConfig::default(), tx)
            .await
            .unwrap();

        assert!(second.generation > first.generation);
        assert!(reg.get_current(&bob, first.generation).is_none());
        assert!(reg.get_current(&bob, second.generation).is_some());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let mut reg = registry("alice");
        let (tx, _rx) = mpsc::unbounded_channel();
        let bob = ParticipantId::new("bob");

        reg.get_or_create(&bob, &MeshConfig::default(), tx)
            .await
            .unwrap();

        assert!(reg.remove(&bob).is_some());
        assert!(reg.remove(&bob).is_none());
        assert!(reg.is_empty());
    }
}
