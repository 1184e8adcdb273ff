use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::cloud::{
    CloudError, CloudProvider, GroupSpec, GroupSummary, PublicIp,
};
use crate::{ENV_COMPLETION_UUID, ENV_INPUT_UUID};

/// In-memory provider for tests: records every call, serves scripted logs,
/// and injects faults on demand.
pub(crate) struct MockProvider {
    inner: Mutex<Inner>,
}

struct Inner {
    groups: HashMap<String, GroupSummary>,
    blobs: HashMap<String, Vec<u8>>,
    logs: HashMap<String, VecDeque<String>>,
    log_faults: HashMap<String, u32>,
    upload_faults: u32,
    delete_conflicts: HashMap<String, u32>,
    quota_regions: HashMap<String, u32>,
    fatal_creates: HashSet<String>,
    never_complete: HashSet<String>,
    ips: HashMap<String, PublicIp>,
    gateways: HashSet<String>,
    vnets: HashSet<String>,
    subnets: HashSet<String>,
    calls: Vec<String>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                groups: HashMap::new(),
                blobs: HashMap::new(),
                logs: HashMap::new(),
                log_faults: HashMap::new(),
                upload_faults: 0,
                delete_conflicts: HashMap::new(),
                quota_regions: HashMap::new(),
                fatal_creates: HashSet::new(),
                never_complete: HashSet::new(),
                ips: HashMap::new(),
                gateways: HashSet::new(),
                vnets: HashSet::new(),
                subnets: HashSet::new(),
                calls: Vec::new(),
            }),
        }
    }
}

fn log_key(group: &str, instance: &str) -> String {
    format!("{group}/{instance}")
}

fn take_fault(counter: &mut HashMap<String, u32>, key: &str) -> bool {
    match counter.get_mut(key) {
        Some(0) | None => false,
        Some(n) => {
            if *n != u32::MAX {
                *n -= 1;
            }
            true
        }
    }
}

impl MockProvider {
    pub fn seed_group(&self, name: &str, region: &str, state: &str, instances: &[&str]) {
        let mut g = self.inner.lock().unwrap();
        g.groups.insert(
            name.to_owned(),
            GroupSummary {
                name: name.to_owned(),
                region: region.to_owned(),
                state: state.to_owned(),
                instances: instances.iter().map(|s| s.to_string()).collect(),
                created_at: None,
            },
        );
    }

    /// Successive `get_logs` calls step through `stages`, holding at the
    /// last one.
    pub fn script_logs(&self, group: &str, instance: &str, stages: &[&str]) {
        let mut g = self.inner.lock().unwrap();
        g.logs.insert(
            log_key(group, instance),
            stages.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn fail_logs(&self, group: &str, instance: &str, times: u32) {
        let mut g = self.inner.lock().unwrap();
        g.log_faults.insert(log_key(group, instance), times);
    }

    pub fn fail_uploads(&self, times: u32) {
        self.inner.lock().unwrap().upload_faults = times;
    }

    pub fn conflict_deletes(&self, resource: &str, times: u32) {
        let mut g = self.inner.lock().unwrap();
        g.delete_conflicts.insert(resource.to_owned(), times);
    }

    pub fn quota_region(&self, region: &str, times: u32) {
        let mut g = self.inner.lock().unwrap();
        g.quota_regions.insert(region.to_owned(), times);
    }

    pub fn fatal_create(&self, group: &str) {
        self.inner.lock().unwrap().fatal_creates.insert(group.to_owned());
    }

    /// The named instance keeps running: its scripted log never carries the
    /// sentinel.
    pub fn never_complete(&self, instance: &str) {
        self.inner.lock().unwrap().never_complete.insert(instance.to_owned());
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    pub fn blob_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().unwrap().blobs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().unwrap().groups.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    async fn create_group(&self, spec: &GroupSpec) -> Result<GroupSummary, CloudError> {
        let mut g = self.inner.lock().unwrap();
        g.calls
            .push(format!("create_group {}@{}", spec.name, spec.region));

        if take_fault(&mut g.quota_regions, &spec.region) {
            return Err(CloudError::QuotaExceeded(format!(
                "no capacity left in {}",
                spec.region
            )));
        }
        if g.fatal_creates.contains(&spec.name) {
            return Err(CloudError::Fatal("injected provision failure".into()));
        }

        let summary = GroupSummary {
            name: spec.name.clone(),
            region: spec.region.clone(),
            state: "Succeeded".to_owned(),
            instances: spec.containers.iter().map(|c| c.name.clone()).collect(),
            created_at: None,
        };
        for c in &spec.containers {
            let key = log_key(&spec.name, &c.name);
            if g.logs.contains_key(&key) {
                continue;
            }
            let input = c
                .env
                .iter()
                .find(|e| e.name == ENV_INPUT_UUID)
                .map(|e| e.value.clone())
                .unwrap_or_default();
            let log = if g.never_complete.contains(&c.name) {
                format!("scanning {input}\n")
            } else {
                let done = c
                    .env
                    .iter()
                    .find(|e| e.name == ENV_COMPLETION_UUID)
                    .map(|e| e.value.clone())
                    .unwrap_or_default();
                format!("scanning {input}\nACIDO_DONE={done}\n")
            };
            g.logs.insert(key, VecDeque::from([log]));
        }
        g.groups.insert(spec.name.clone(), summary.clone());
        Ok(summary)
    }

    async fn get_group(&self, name: &str) -> Result<GroupSummary, CloudError> {
        let g = self.inner.lock().unwrap();
        g.groups
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(name.to_owned()))
    }

    async fn delete_group(&self, name: &str) -> Result<(), CloudError> {
        let mut g = self.inner.lock().unwrap();
        g.calls.push(format!("delete_group {name}"));
        if take_fault(&mut g.delete_conflicts, name) {
            return Err(CloudError::Conflict(format!("{name} is busy")));
        }
        g.groups
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::NotFound(name.to_owned()))
    }

    async fn list_groups(&self) -> Result<Vec<GroupSummary>, CloudError> {
        let g = self.inner.lock().unwrap();
        let mut out: Vec<GroupSummary> = g.groups.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn get_logs(
        &self,
        group: &str,
        instance: &str,
        _tail: Option<u32>,
        _timestamps: bool,
    ) -> Result<Vec<u8>, CloudError> {
        let mut g = self.inner.lock().unwrap();
        let key = log_key(group, instance);
        if take_fault(&mut g.log_faults, &key) {
            return Err(CloudError::Transient("log endpoint hiccup".into()));
        }
        let Some(stages) = g.logs.get_mut(&key) else {
            return Err(CloudError::NotFound(key));
        };
        let log = if stages.len() > 1 {
            stages.pop_front().unwrap()
        } else {
            stages.front().cloned().unwrap_or_default()
        };
        Ok(log.into_bytes())
    }

    async fn upload_blob(&self, name: &str, data: Vec<u8>) -> Result<(), CloudError> {
        let mut g = self.inner.lock().unwrap();
        g.calls.push(format!("upload_blob {name}"));
        if g.upload_faults > 0 {
            g.upload_faults -= 1;
            return Err(CloudError::Transient("storage hiccup".into()));
        }
        g.blobs.insert(name.to_owned(), data);
        Ok(())
    }

    async fn download_blob(&self, name: &str) -> Result<Vec<u8>, CloudError> {
        let g = self.inner.lock().unwrap();
        g.blobs
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(name.to_owned()))
    }

    async fn delete_blob(&self, name: &str) -> Result<(), CloudError> {
        let mut g = self.inner.lock().unwrap();
        g.calls.push(format!("delete_blob {name}"));
        g.blobs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::NotFound(name.to_owned()))
    }

    async fn create_public_ip(&self, name: &str, region: &str) -> Result<PublicIp, CloudError> {
        let mut g = self.inner.lock().unwrap();
        g.calls.push(format!("create_public_ip {name}"));
        let ip = PublicIp {
            name: name.to_owned(),
            region: region.to_owned(),
            address: Some("203.0.113.7".to_owned()),
        };
        g.ips.insert(name.to_owned(), ip.clone());
        Ok(ip)
    }

    async fn get_public_ip(&self, name: &str) -> Result<Option<PublicIp>, CloudError> {
        Ok(self.inner.lock().unwrap().ips.get(name).cloned())
    }

    async fn list_public_ips(&self) -> Result<Vec<PublicIp>, CloudError> {
        let g = self.inner.lock().unwrap();
        let mut out: Vec<PublicIp> = g.ips.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn create_egress_gateway(
        &self,
        name: &str,
        _region: &str,
        _ip_name: &str,
    ) -> Result<(), CloudError> {
        let mut g = self.inner.lock().unwrap();
        g.calls.push(format!("create_egress_gateway {name}"));
        g.gateways.insert(name.to_owned());
        Ok(())
    }

    async fn create_vnet_with_delegated_subnet(
        &self,
        vnet: &str,
        subnet: &str,
        _region: &str,
    ) -> Result<(), CloudError> {
        let mut g = self.inner.lock().unwrap();
        g.calls.push(format!("create_vnet {vnet}/{subnet}"));
        g.vnets.insert(vnet.to_owned());
        g.subnets.insert(subnet.to_owned());
        Ok(())
    }

    async fn attach_gateway_to_subnet(
        &self,
        _vnet: &str,
        subnet: &str,
        gateway: &str,
    ) -> Result<(), CloudError> {
        let mut g = self.inner.lock().unwrap();
        g.calls.push(format!("attach_gateway {subnet} <- {gateway}"));
        Ok(())
    }

    async fn delete_egress_gateway(&self, name: &str) -> Result<(), CloudError> {
        let mut g = self.inner.lock().unwrap();
        g.calls.push(format!("delete_egress_gateway {name}"));
        if take_fault(&mut g.delete_conflicts, name) {
            return Err(CloudError::Conflict(format!("{name} still associated")));
        }
        if !g.gateways.remove(name) {
            return Err(CloudError::NotFound(name.to_owned()));
        }
        Ok(())
    }

    async fn delete_subnet(&self, vnet: &str, subnet: &str) -> Result<(), CloudError> {
        let mut g = self.inner.lock().unwrap();
        g.calls.push(format!("delete_subnet {vnet}/{subnet}"));
        if take_fault(&mut g.delete_conflicts, subnet) {
            return Err(CloudError::Conflict(format!("{subnet} has attachments")));
        }
        if !g.subnets.remove(subnet) {
            return Err(CloudError::NotFound(subnet.to_owned()));
        }
        Ok(())
    }

    async fn delete_vnet(&self, name: &str) -> Result<(), CloudError> {
        let mut g = self.inner.lock().unwrap();
        g.calls.push(format!("delete_vnet {name}"));
        if take_fault(&mut g.delete_conflicts, name) {
            return Err(CloudError::Conflict(format!("{name} has subnets")));
        }
        if !g.vnets.remove(name) {
            return Err(CloudError::NotFound(name.to_owned()));
        }
        Ok(())
    }

    async fn delete_public_ip(&self, name: &str) -> Result<(), CloudError> {
        let mut g = self.inner.lock().unwrap();
        g.calls.push(format!("delete_public_ip {name}"));
        if take_fault(&mut g.delete_conflicts, name) {
            return Err(CloudError::Conflict(format!("{name} still referenced")));
        }
        if g.ips.remove(name).is_none() {
            return Err(CloudError::NotFound(name.to_owned()));
        }
        Ok(())
    }
}
