use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::cloud::{CloudError, CloudProvider, PublicIp, SubnetRef};
use crate::error::{Error, Result};

const DESTROY_ATTEMPTS: u32 = 6;
const DESTROY_SPACING: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct StackNames {
    pub ip: String,
    pub vnet: String,
    pub subnet: String,
    pub gateway: String,
}

pub fn stack_names(name: &str) -> StackNames {
    StackNames {
        ip: name.to_owned(),
        vnet: format!("{name}-vnet"),
        subnet: format!("{name}-subnet"),
        gateway: format!("{name}-subnet-nat-gw"),
    }
}

pub fn subnet_ref(name: &str) -> SubnetRef {
    let names = stack_names(name);
    SubnetRef {
        vnet: names.vnet,
        subnet: names.subnet,
    }
}

/// Creates and destroys the public-IP / egress-gateway / vnet / delegated-
/// subnet quadruple that gives a fleet shared egress behind one stable IPv4.
/// Mutations of a given stack are serialized through a per-name lock; the
/// dependency order is load-bearing because the provider refuses to delete a
/// parent whose child still exists.
pub struct NetworkStackManager {
    cloud: Arc<dyn CloudProvider>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NetworkStackManager {
    pub fn new(cloud: Arc<dyn CloudProvider>) -> Self {
        Self {
            cloud,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Ensures the whole stack exists: IP, then gateway referencing it, then
    /// vnet with the delegated subnet, then the gateway-subnet association.
    /// Existing resources with the expected shape are adopted; an
    /// incompatible one surfaces as `Conflict`.
    pub async fn create(&self, name: &str, region: &str) -> Result<PublicIp> {
        let lock = self.lock_for(name).await;
        let _g = lock.lock().await;
        let names = stack_names(name);

        let wrap = |source: CloudError| Error::NetworkStack {
            name: name.to_owned(),
            source,
        };

        info!("creating network stack {name} in {region}");
        let ip = self
            .cloud
            .create_public_ip(&names.ip, region)
            .await
            .map_err(wrap)?;
        self.cloud
            .create_egress_gateway(&names.gateway, region, &names.ip)
            .await
            .map_err(wrap)?;
        self.cloud
            .create_vnet_with_delegated_subnet(&names.vnet, &names.subnet, region)
            .await
            .map_err(wrap)?;
        self.cloud
            .attach_gateway_to_subnet(&names.vnet, &names.subnet, &names.gateway)
            .await
            .map_err(wrap)?;

        info!(
            "network stack {name} ready, egress ip {}",
            ip.address.as_deref().unwrap_or("pending")
        );
        Ok(ip)
    }

    /// Tears the stack down in strict reverse order: gateway, subnet, vnet,
    /// public IP. Conflicts from still-dissociating dependencies are retried
    /// on a bounded schedule; a subnet that still carries container groups
    /// after the retries fails the destroy with `ResourceBusy` and no further
    /// steps run.
    pub async fn destroy(&self, name: &str) -> Result<()> {
        let lock = self.lock_for(name).await;
        let _g = lock.lock().await;
        let names = stack_names(name);

        let wrap = |source: CloudError| Error::NetworkStack {
            name: name.to_owned(),
            source,
        };

        info!("destroying network stack {name}");
        with_conflict_retry(|| self.cloud.delete_egress_gateway(&names.gateway))
            .await
            .map_err(wrap)?;
        with_conflict_retry(|| self.cloud.delete_subnet(&names.vnet, &names.subnet))
            .await
            .map_err(|e| {
                wrap(match e {
                    CloudError::Conflict(msg) => CloudError::ResourceBusy(format!(
                        "subnet {} still has attached container groups: {msg}",
                        names.subnet
                    )),
                    other => other,
                })
            })?;
        with_conflict_retry(|| self.cloud.delete_vnet(&names.vnet))
            .await
            .map_err(wrap)?;
        with_conflict_retry(|| self.cloud.delete_public_ip(&names.ip))
            .await
            .map_err(wrap)?;
        Ok(())
    }

    pub async fn get_ip(&self, name: &str) -> Result<Option<PublicIp>> {
        Ok(self.cloud.get_public_ip(name).await?)
    }
}

/// Runs a delete step, absorbing `NotFound` (already gone) and retrying
/// `Conflict` while the provider dissociates dependent resources.
async fn with_conflict_retry<F, Fut>(mut op: F) -> std::result::Result<(), CloudError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), CloudError>>,
{
    for attempt in 1..=DESTROY_ATTEMPTS {
        match op().await {
            Ok(()) => return Ok(()),
            Err(CloudError::NotFound(msg)) => {
                debug!("already absent: {msg}");
                return Ok(());
            }
            Err(CloudError::Conflict(msg)) if attempt < DESTROY_ATTEMPTS => {
                warn!("delete conflict, retrying in {DESTROY_SPACING:?}: {msg}");
                tokio::time::sleep(DESTROY_SPACING).await;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop returns on the final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;

    #[tokio::test]
    async fn create_orders_dependencies() {
        let cloud = Arc::new(MockProvider::default());
        let mgr = NetworkStackManager::new(cloud.clone());

        let ip = mgr.create("egress1", "westeurope").await.unwrap();
        assert_eq!(ip.name, "egress1");

        let calls = cloud.calls();
        assert_eq!(
            calls,
            vec![
                "create_public_ip egress1",
                "create_egress_gateway egress1-subnet-nat-gw",
                "create_vnet egress1-vnet/egress1-subnet",
                "attach_gateway egress1-subnet <- egress1-subnet-nat-gw",
            ]
        );
    }

    #[tokio::test]
    async fn destroy_runs_in_reverse_order() {
        let cloud = Arc::new(MockProvider::default());
        let mgr = NetworkStackManager::new(cloud.clone());
        mgr.create("egress1", "westeurope").await.unwrap();
        cloud.clear_calls();

        mgr.destroy("egress1").await.unwrap();
        let calls = cloud.calls();
        assert_eq!(
            calls,
            vec![
                "delete_egress_gateway egress1-subnet-nat-gw",
                "delete_subnet egress1-vnet/egress1-subnet",
                "delete_vnet egress1-vnet",
                "delete_public_ip egress1",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_retries_transient_conflicts() {
        let cloud = Arc::new(MockProvider::default());
        let mgr = NetworkStackManager::new(cloud.clone());
        mgr.create("egress1", "westeurope").await.unwrap();

        // gateway dissociation lags by two attempts
        cloud.conflict_deletes("egress1-subnet-nat-gw", 2);
        mgr.destroy("egress1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn busy_subnet_stops_the_destroy() {
        let cloud = Arc::new(MockProvider::default());
        let mgr = NetworkStackManager::new(cloud.clone());
        mgr.create("egress1", "westeurope").await.unwrap();
        cloud.clear_calls();

        // groups keep the subnet pinned past every retry
        cloud.conflict_deletes("egress1-subnet", u32::MAX);
        let err = mgr.destroy("egress1").await.unwrap_err();
        match err {
            Error::NetworkStack { source, .. } => {
                assert!(matches!(source, CloudError::ResourceBusy(_)))
            }
            other => panic!("unexpected error {other:?}"),
        }

        // the vnet and public IP must not have been touched
        let calls = cloud.calls();
        assert!(!calls.iter().any(|c| c.starts_with("delete_vnet")));
        assert!(!calls.iter().any(|c| c.starts_with("delete_public_ip")));
    }

    #[tokio::test]
    async fn destroy_of_absent_stack_is_quiet() {
        let cloud = Arc::new(MockProvider::default());
        let mgr = NetworkStackManager::new(cloud.clone());
        mgr.destroy("ghost").await.unwrap();
    }
}
