use std::time::Duration;

use derivative::Derivative;
use webrtc::{
    api::setting_engine::SettingEngine, peer_connection::configuration::RTCConfiguration,
};
use webrtc_ice::network_type::NetworkType;

/// Configuration for every [`crate::peer::PeerConnection`] managed by the
/// [`crate::coordinator::ConferenceCoordinator`].
#[derive(Derivative)]
#[derivative(Clone, Debug)]
pub struct MeshConfig {
    #[derivative(Debug = "ignore")]
    pub configuration: RTCConfiguration,
    pub ice_disconnected_timeout: Option<Duration>,
    pub ice_failed_timeout: Option<Duration>,
    pub ice_keep_alive_interval: Option<Duration>,
    pub network_types: Vec<NetworkType>,
    /// A peer that has not reached `Connected` within this interval is
    /// removed and its resources are released.
    pub negotiation_timeout: Duration,
    pub timeout_sweep_interval: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            configuration: RTCConfiguration {
                ..Default::default()
            },
            ice_disconnected_timeout: None,
            ice_failed_timeout: None,
            ice_keep_alive_interval: None,
            network_types: vec![],
            negotiation_timeout: Duration::from_secs(15),
            timeout_sweep_interval: Duration::from_secs(3),
        }
    }
}

impl MeshConfig {
    pub fn configuration(&self) -> RTCConfiguration {
        self.configuration.clone()
    }

    pub(crate) fn setting_engine(&self) -> SettingEngine {
        let mut setting_engine = SettingEngine::default();

        if self.ice_disconnected_timeout.is_some()
            || self.ice_failed_timeout.is_some()
            || self.ice_keep_alive_interval.is_some()
        {
            setting_engine.set_ice_timeouts(
                self.ice_disconnected_timeout,
                self.ice_failed_timeout,
                self.ice_keep_alive_interval,
            );
        }

        if !self.network_types.is_empty() {
            setting_engine.set_network_types(self.network_types.clone());
        }

        setting_engine
    }
}
