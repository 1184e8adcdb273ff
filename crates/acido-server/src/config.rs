use std::sync::Arc;
use std::time::Duration;

use acido_core::cloud::CloudProvider;
use acido_core::fleet::FleetController;
use acido_core::network::NetworkStackManager;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;

#[derive(Envconfig)]
pub struct ServerConfig {
    #[envconfig(from = "ACIDO_LISTEN", default = "0.0.0.0:3001")]
    pub listen: String,
    /// Runtime deadline applied to each fleet/run request.
    #[envconfig(from = "ACIDO_REQUEST_DEADLINE_SECS", default = "900")]
    pub request_deadline_secs: u64,
}

pub struct StateInner {
    pub cloud: Arc<dyn CloudProvider>,
    pub controller: FleetController,
    pub stacks: NetworkStackManager,
    pub core_config: acido_core::config::Config,
    pub deadline: Duration,
    pub shutdown: CancellationToken,
}

pub type State = Arc<StateInner>;
