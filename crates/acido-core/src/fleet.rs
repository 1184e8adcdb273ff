use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use glob::Pattern;
use log::{error, info, warn};
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregate::{self, InstanceReport, InstanceStatus};
use crate::artifact::ArtifactStore;
use crate::cloud::{
    CloudError, CloudProvider, ContainerSpec, EnvVar, GroupSpec, GroupSummary,
    RegistryCredentials,
};
use crate::config::Config;
use crate::detect::{self, DetectorConfig, Outcome};
use crate::error::{Error, Result};
use crate::network;
use crate::placement;
use crate::{ENV_COMPLETION_UUID, ENV_INPUT_UUID, ENV_TASK, is_valid_name};

pub const MAX_FLEET_INSTANCES: usize = 200;
/// Ephemeral `run` containers are capped at this lifetime.
pub const MAX_RUN_SECONDS: u64 = 900;

const UPLOAD_FANOUT: usize = 16;
const PROVISION_FANOUT: usize = 8;
const POLL_FANOUT: usize = 64;
const QUOTA_SWAPS: u32 = 3;
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(180);

const DEFAULT_CPU: f64 = 1.0;
const DEFAULT_MEMORY_GB: f64 = 1.0;

const NAME_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
    's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

pub fn generate_fleet_name() -> String {
    format!("acido-{}", nanoid::nanoid!(8, &NAME_ALPHABET))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Planned,
    Provisioning,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Removing,
    Removed,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupRecord {
    pub name: String,
    pub region: String,
    pub state: GroupState,
    pub instances: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum FleetInput {
    File(PathBuf),
    Lines(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct FleetRequest {
    pub name: String,
    pub instances: usize,
    pub image: String,
    pub task: String,
    pub input: FleetInput,
    pub regions: Vec<String>,
    pub wait: Option<Duration>,
    pub remove_when_done: bool,
    pub output: Option<PathBuf>,
}

#[derive(Debug)]
pub struct FleetResult {
    pub fleet: String,
    pub groups: Vec<GroupRecord>,
    pub instances: Vec<InstanceReport>,
    pub report: String,
    pub structured: serde_json::Value,
    pub teardown_errors: Vec<String>,
}

impl FleetResult {
    /// Most severe terminal state wins: provisioning failure, then partial
    /// timeout, then teardown trouble.
    pub fn exit_code(&self) -> i32 {
        let any = |s: InstanceStatus| self.instances.iter().any(|i| i.status == s);
        if any(InstanceStatus::Unprovisioned) || any(InstanceStatus::Failed) {
            2
        } else if any(InstanceStatus::TimedOut) {
            3
        } else if !self.teardown_errors.is_empty() {
            4
        } else {
            0
        }
    }
}

fn group_name(fleet: &str, ordinal: usize) -> String {
    format!("{fleet}-{ordinal:02}")
}

fn instance_name(group: &str, ordinal: usize) -> String {
    format!("{group}-{ordinal:02}")
}

struct InstanceMeta {
    name: String,
    completion_uuid: String,
}

/// The central scheduler: shard upload, placement, provisioning, polling,
/// collection and teardown for one orchestration invocation. All overlapping
/// cloud calls run as structured tasks bounded by semaphores; nothing here
/// spawns kernel threads.
pub struct FleetController {
    cloud: Arc<dyn CloudProvider>,
    artifacts: ArtifactStore,
    config: Config,
}

impl FleetController {
    pub fn new(cloud: Arc<dyn CloudProvider>, config: Config) -> Self {
        let artifacts = ArtifactStore::new(cloud.clone());
        Self {
            cloud,
            artifacts,
            config,
        }
    }

    pub async fn fleet(
        &self,
        req: FleetRequest,
        cancel: CancellationToken,
    ) -> Result<FleetResult> {
        // 1. validate before touching anything remote
        if !is_valid_name(&req.name) {
            return Err(Error::Configuration(format!(
                "fleet name {:?} must be lowercase alphanumeric with dashes",
                req.name
            )));
        }
        if req.instances < 1 || req.instances > MAX_FLEET_INSTANCES {
            return Err(Error::Configuration(format!(
                "instance count must be between 1 and {MAX_FLEET_INSTANCES}"
            )));
        }
        let regions = self.config.resolve_regions(&req.regions)?;
        let text = match &req.input {
            FleetInput::File(path) => tokio::fs::read_to_string(path).await?,
            FleetInput::Lines(lines) => lines.join("\n"),
        };
        if !text.trim().is_empty() && !req.task.contains("input") {
            return Err(Error::Configuration(
                "task must reference the downloaded `input` file".into(),
            ));
        }

        // 2. shard
        let shards = crate::shard::shard_lines(&text, req.instances);

        // 3. upload, bounded fan-out, abort pre-provision on failure
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let shard_ids = self.upload_shards(shards).await?;
        info!("uploaded {} shard(s) for fleet {}", shard_ids.len(), req.name);

        // 4. placement
        let plan = placement::plan(shard_ids.len(), &regions);

        // 5. provision groups in parallel
        let mut groups: Vec<GroupRecord> = Vec::with_capacity(plan.len());
        let mut metas: HashMap<String, Vec<InstanceMeta>> = HashMap::new();
        let mut specs = Vec::with_capacity(plan.len());
        for pg in &plan {
            let gname = group_name(&req.name, pg.ordinal);
            let mut containers = Vec::with_capacity(pg.size);
            let mut group_meta = Vec::with_capacity(pg.size);
            for j in 0..pg.size {
                let iname = instance_name(&gname, j + 1);
                let completion_uuid = Uuid::new_v4().to_string();
                containers.push(ContainerSpec {
                    name: iname.clone(),
                    env: vec![
                        EnvVar {
                            name: ENV_INPUT_UUID.to_owned(),
                            value: shard_ids[pg.start + j].clone(),
                        },
                        EnvVar {
                            name: ENV_TASK.to_owned(),
                            value: req.task.clone(),
                        },
                        EnvVar {
                            name: ENV_COMPLETION_UUID.to_owned(),
                            value: completion_uuid.clone(),
                        },
                    ],
                });
                group_meta.push(InstanceMeta {
                    name: iname,
                    completion_uuid,
                });
            }
            metas.insert(gname.clone(), group_meta);
            groups.push(GroupRecord {
                name: gname.clone(),
                region: pg.region.clone(),
                state: GroupState::Planned,
                instances: (1..=pg.size).map(|j| instance_name(&gname, j)).collect(),
            });
            specs.push(GroupSpec {
                name: gname,
                region: pg.region.clone(),
                image: req.image.clone(),
                registry: self.config.registry.as_ref().map(|r| RegistryCredentials {
                    server: r.server.clone(),
                    username: r.username.clone(),
                    password: r.password.clone(),
                }),
                containers,
                cpu: DEFAULT_CPU,
                memory_gb: DEFAULT_MEMORY_GB,
                subnet: self.config.selected_stack.as_deref().map(network::subnet_ref),
            });
        }

        let mut provisioned: Vec<String> = Vec::new();
        let mut provision_errors: HashMap<String, CloudError> = HashMap::new();
        {
            let sem = Arc::new(Semaphore::new(PROVISION_FANOUT));
            let mut set = JoinSet::new();
            for spec in specs {
                // cancellation stops new work; in-flight provisions run to a
                // terminal provider state before we unwind
                if cancel.is_cancelled() {
                    break;
                }
                if let Some(record) = groups.iter_mut().find(|g| g.name == spec.name) {
                    record.state = GroupState::Provisioning;
                }
                let sem = sem.clone();
                let cloud = self.cloud.clone();
                let candidates = regions.clone();
                set.spawn(async move {
                    let _permit = sem.acquire_owned().await.expect("semaphore closed");
                    let name = spec.name.clone();
                    let result = provision_group(cloud, spec, candidates).await;
                    (name, result)
                });
            }
            while let Some(joined) = set.join_next().await {
                let (name, result) = joined.expect("provision task panicked");
                let record = groups
                    .iter_mut()
                    .find(|g| g.name == name)
                    .expect("unknown group");
                match result {
                    Ok(summary) => {
                        record.state = GroupState::Running;
                        record.region = summary.region;
                        provisioned.push(name);
                    }
                    Err(e) => {
                        error!("provisioning {name} failed: {e}");
                        record.state = GroupState::Failed;
                        provision_errors.insert(name, e);
                    }
                }
            }
        }
        provisioned.sort();

        if cancel.is_cancelled() {
            if req.remove_when_done {
                self.teardown(&mut groups, &provisioned, &shard_ids).await;
            }
            return Err(Error::Cancelled);
        }

        // 6. poll every instance of every running group
        let detector = DetectorConfig {
            deadline: req.wait,
            ..DetectorConfig::default()
        };
        let mut detections: HashMap<String, (Outcome, String)> = HashMap::new();
        let mut poll_errors: HashMap<String, CloudError> = HashMap::new();
        let mut cancelled = false;
        {
            let sem = Arc::new(Semaphore::new(POLL_FANOUT));
            let mut set = JoinSet::new();
            for gname in &provisioned {
                for meta in metas.remove(gname).unwrap_or_default() {
                    let sem = sem.clone();
                    let cloud = self.cloud.clone();
                    let gname = gname.clone();
                    let cfg = detector.clone();
                    let cancel = cancel.clone();
                    set.spawn(async move {
                        let _permit = sem.acquire_owned().await.expect("semaphore closed");
                        let detection = tokio::select! {
                            _ = cancel.cancelled() => None,
                            d = detect::wait_for_completion(
                                cloud.as_ref(),
                                &gname,
                                &meta.name,
                                &meta.completion_uuid,
                                &cfg,
                            ) => Some(d),
                        };
                        (meta.name, detection)
                    });
                }
            }
            while let Some(joined) = set.join_next().await {
                let (instance, detection) = joined.expect("poll task panicked");
                match detection {
                    None => cancelled = true,
                    Some(Ok(d)) => {
                        detections.insert(instance, (d.outcome, d.log));
                    }
                    Some(Err(e)) => {
                        error!("polling {instance} failed: {e}");
                        poll_errors.insert(instance, e);
                    }
                }
            }
        }

        if cancelled {
            if req.remove_when_done {
                self.teardown(&mut groups, &provisioned, &shard_ids).await;
            }
            return Err(Error::Cancelled);
        }

        // 7. collect per-instance reports and roll group states up
        let mut reports = Vec::new();
        for record in &mut groups {
            let mut statuses = Vec::new();
            for iname in &record.instances {
                let report = if let Some((outcome, log)) = detections.remove(iname) {
                    let status = match outcome {
                        Outcome::Succeeded => InstanceStatus::Succeeded,
                        Outcome::Failed => InstanceStatus::Failed,
                        Outcome::TimedOut => InstanceStatus::TimedOut,
                    };
                    InstanceReport {
                        name: iname.clone(),
                        status,
                        log,
                        error: None,
                    }
                } else if let Some(e) = poll_errors.remove(iname) {
                    InstanceReport {
                        name: iname.clone(),
                        status: InstanceStatus::Failed,
                        log: String::new(),
                        error: Some(e.class().to_owned()),
                    }
                } else {
                    let class = provision_errors.get(&record.name).map(|e| e.class());
                    InstanceReport {
                        name: iname.clone(),
                        status: InstanceStatus::Unprovisioned,
                        log: String::new(),
                        error: Some(class.unwrap_or("unknown").to_owned()),
                    }
                };
                statuses.push(report.status);
                reports.push(report);
            }
            if record.state == GroupState::Running {
                record.state = if statuses.iter().any(|s| *s == InstanceStatus::Failed) {
                    GroupState::Failed
                } else if statuses.iter().any(|s| *s == InstanceStatus::TimedOut) {
                    GroupState::TimedOut
                } else {
                    GroupState::Succeeded
                };
            }
        }

        // 8. best-effort teardown of everything this run created
        let teardown_errors = if req.remove_when_done {
            self.teardown(&mut groups, &provisioned, &shard_ids).await
        } else {
            Vec::new()
        };

        // 9. assemble
        let report = aggregate::render_text(&reports);
        let structured = aggregate::render_structured(&reports);
        if let Some(path) = &req.output {
            if let Err(e) = aggregate::write_output(path, &report).await {
                warn!("could not write report to {}: {e}", path.display());
            }
        }
        Ok(FleetResult {
            fleet: req.name,
            groups,
            instances: reports,
            report,
            structured,
            teardown_errors,
        })
    }

    /// Single ephemeral container: a degenerate one-instance fleet with an
    /// empty input and a hard lifetime cap.
    pub async fn run(
        &self,
        name: &str,
        image: &str,
        task: &str,
        duration: Duration,
        cleanup: bool,
        regions: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<FleetResult> {
        let duration = duration.min(Duration::from_secs(MAX_RUN_SECONDS));
        self.fleet(
            FleetRequest {
                name: name.to_owned(),
                instances: 1,
                image: image.to_owned(),
                task: task.to_owned(),
                input: FleetInput::Lines(Vec::new()),
                regions,
                wait: Some(duration),
                remove_when_done: cleanup,
                output: None,
            },
            cancel,
        )
        .await
    }

    pub async fn list(&self) -> Result<Vec<GroupSummary>> {
        Ok(self.cloud.list_groups().await?)
    }

    /// Deletes every group whose name matches the glob pattern. Individual
    /// failures are logged, not propagated.
    pub async fn remove(&self, pattern: &str) -> Result<Vec<String>> {
        let pat = Pattern::new(pattern)?;
        let mut removed = Vec::new();
        for group in self.cloud.list_groups().await? {
            if !pat.matches(&group.name) {
                continue;
            }
            match self.cloud.delete_group(&group.name).await {
                Ok(()) => {
                    info!("removed {}", group.name);
                    removed.push(group.name);
                }
                Err(e) => error!("failed to remove {}: {e}", group.name),
            }
        }
        Ok(removed)
    }

    async fn upload_shards(&self, shards: Vec<Vec<u8>>) -> Result<Vec<String>> {
        let count = shards.len();
        let sem = Arc::new(Semaphore::new(UPLOAD_FANOUT));
        let mut set = JoinSet::new();
        for (i, data) in shards.into_iter().enumerate() {
            let sem = sem.clone();
            let store = self.artifacts.clone();
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore closed");
                (i, store.put(data).await)
            });
        }

        let mut ids: Vec<Option<String>> = vec![None; count];
        let mut failure = None;
        while let Some(joined) = set.join_next().await {
            let (i, result) = joined.expect("upload task panicked");
            match result {
                Ok(id) => ids[i] = Some(id),
                Err(e) => failure = Some(e),
            }
        }
        if let Some(e) = failure {
            // nothing is provisioned yet; drop what did land
            for id in ids.into_iter().flatten() {
                self.artifacts.delete(&id).await.ok();
            }
            return Err(Error::ShardUpload(e));
        }
        Ok(ids.into_iter().map(|id| id.expect("missing shard id")).collect())
    }

    async fn teardown(
        &self,
        groups: &mut [GroupRecord],
        provisioned: &[String],
        shard_ids: &[String],
    ) -> Vec<String> {
        let mut errors = Vec::new();
        for name in provisioned {
            if let Some(record) = groups.iter_mut().find(|g| g.name == *name) {
                record.state = GroupState::Removing;
            }
            let mut attempt = 0;
            let outcome = loop {
                attempt += 1;
                match tokio::time::timeout(TEARDOWN_TIMEOUT, self.cloud.delete_group(name)).await
                {
                    Ok(Ok(())) => break Ok(()),
                    Ok(Err(CloudError::NotFound(_))) => break Ok(()),
                    Ok(Err(e)) if attempt < 2 => {
                        warn!("teardown of {name} failed, retrying once: {e}")
                    }
                    Err(_) if attempt < 2 => warn!("teardown of {name} timed out, retrying once"),
                    Ok(Err(e)) => break Err(format!("{name}: {e}")),
                    Err(_) => break Err(format!("{name}: teardown timed out")),
                }
            };
            match outcome {
                Ok(()) => {
                    if let Some(record) = groups.iter_mut().find(|g| g.name == *name) {
                        record.state = GroupState::Removed;
                    }
                }
                Err(msg) => {
                    error!("teardown error: {msg}");
                    errors.push(msg);
                }
            }
        }
        for id in shard_ids {
            if let Err(e) = self.artifacts.delete(id).await {
                if !matches!(e, CloudError::NotFound(_)) {
                    warn!("could not delete shard {id}: {e}");
                }
            }
        }
        errors
    }
}

/// One provisioning attempt chain for a group: transient faults get a single
/// retry, regional quota exhaustion swaps to another candidate region up to
/// three times, with the failing region dropped from this group's pool only.
async fn provision_group(
    cloud: Arc<dyn CloudProvider>,
    mut spec: GroupSpec,
    mut candidates: Vec<String>,
) -> std::result::Result<GroupSummary, CloudError> {
    let mut quota_swaps = 0;
    let mut retried_transient = false;
    loop {
        match cloud.create_group(&spec).await {
            Ok(summary) => return Ok(summary),
            Err(CloudError::QuotaExceeded(msg)) => {
                candidates.retain(|r| *r != spec.region);
                if quota_swaps >= QUOTA_SWAPS || candidates.is_empty() {
                    return Err(CloudError::QuotaExceeded(msg));
                }
                let next = {
                    let mut rng = rand::thread_rng();
                    candidates.choose(&mut rng).cloned().expect("non-empty pool")
                };
                warn!(
                    "quota exhausted in {} for {}, retrying in {next}",
                    spec.region, spec.name
                );
                spec.region = next;
                quota_swaps += 1;
            }
            Err(e) if e.is_transient() && !retried_transient => {
                warn!("provisioning {} hit {e}, retrying once", spec.name);
                retried_transient = true;
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;

    fn controller(cloud: Arc<MockProvider>) -> FleetController {
        let config = Config {
            default_region: Some("westeurope".to_owned()),
            ..Config::default()
        };
        FleetController::new(cloud, config)
    }

    fn request(name: &str, n: usize, targets: &[&str]) -> FleetRequest {
        FleetRequest {
            name: name.to_owned(),
            instances: n,
            image: "scanner".to_owned(),
            task: "echo -iL input".to_owned(),
            input: FleetInput::Lines(targets.iter().map(|s| s.to_string()).collect()),
            regions: Vec::new(),
            wait: None,
            remove_when_done: false,
            output: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn small_fleet_runs_to_completion() {
        let cloud = Arc::new(MockProvider::default());
        let ctl = controller(cloud.clone());

        let result = ctl
            .fleet(
                request("scan", 3, &["a.test", "b.test", "c.test"]),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(cloud.blob_names().len(), 3);
        assert_eq!(result.groups.len(), 1);
        assert_eq!(result.groups[0].name, "scan-01");
        assert_eq!(result.groups[0].state, GroupState::Succeeded);
        assert_eq!(result.instances.len(), 3);
        assert!(result
            .instances
            .iter()
            .all(|i| i.status == InstanceStatus::Succeeded));
        assert!(result.instances.iter().all(|i| i.log.contains("ACIDO_DONE=")));
        assert_eq!(result.report.matches("--- ").count(), 3);
        assert_eq!(result.exit_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fifteen_instances_split_into_two_groups() {
        let cloud = Arc::new(MockProvider::default());
        let ctl = controller(cloud.clone());
        let targets: Vec<String> = (0..15).map(|i| format!("h{i}.test")).collect();
        let refs: Vec<&str> = targets.iter().map(String::as_str).collect();

        let result = ctl
            .fleet(request("scan", 15, &refs), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.groups.len(), 2);
        assert_eq!(result.groups[0].instances.len(), 10);
        assert_eq!(result.groups[1].instances.len(), 5);
        assert_eq!(result.groups[0].instances[0], "scan-01-01");
        assert_eq!(result.groups[0].instances[9], "scan-01-10");
        assert_eq!(result.groups[1].instances[0], "scan-02-01");
        assert_eq!(result.groups[1].instances[4], "scan-02-05");
    }

    #[tokio::test(start_paused = true)]
    async fn quota_exhaustion_swaps_regions() {
        let cloud = Arc::new(MockProvider::default());
        // westeurope is permanently out of capacity; everything lands in the
        // other candidate
        cloud.quota_region("westeurope", u32::MAX);
        let ctl = controller(cloud.clone());

        let targets: Vec<String> = (0..100).map(|i| format!("h{i}.test")).collect();
        let refs: Vec<&str> = targets.iter().map(String::as_str).collect();
        let mut req = request("wide", 100, &refs);
        req.regions = vec!["westeurope".to_owned(), "northeurope".to_owned()];

        let result = ctl.fleet(req, CancellationToken::new()).await.unwrap();
        assert_eq!(result.groups.len(), 10);
        assert!(result.groups.iter().all(|g| g.region == "northeurope"));
        assert!(result
            .instances
            .iter()
            .all(|i| i.status == InstanceStatus::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn quota_on_every_region_fails_the_group_only() {
        let cloud = Arc::new(MockProvider::default());
        cloud.quota_region("westeurope", u32::MAX);
        let ctl = controller(cloud.clone());

        let result = ctl
            .fleet(request("solo", 3, &["a", "b", "c"]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.groups[0].state, GroupState::Failed);
        assert!(result
            .instances
            .iter()
            .all(|i| i.status == InstanceStatus::Unprovisioned));
        assert_eq!(result.instances[0].error.as_deref(), Some("quota"));
        assert_eq!(result.exit_code(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_group_does_not_abort_the_fleet() {
        let cloud = Arc::new(MockProvider::default());
        cloud.fatal_create("scan-01");
        let ctl = controller(cloud.clone());
        let targets: Vec<String> = (0..15).map(|i| format!("h{i}.test")).collect();
        let refs: Vec<&str> = targets.iter().map(String::as_str).collect();

        let result = ctl
            .fleet(request("scan", 15, &refs), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.groups[0].state, GroupState::Failed);
        assert_eq!(result.groups[1].state, GroupState::Succeeded);
        let unprovisioned = result
            .instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Unprovisioned)
            .count();
        assert_eq!(unprovisioned, 10);
        assert_eq!(result.exit_code(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_instance_times_out_alone() {
        let cloud = Arc::new(MockProvider::default());
        cloud.never_complete("scan-01-02");
        let ctl = controller(cloud.clone());

        let mut req = request("scan", 3, &["a.test", "b.test", "c.test"]);
        req.wait = Some(Duration::from_secs(30));
        let result = ctl.fleet(req, CancellationToken::new()).await.unwrap();

        let by_name: HashMap<&str, &InstanceReport> = result
            .instances
            .iter()
            .map(|i| (i.name.as_str(), i))
            .collect();
        assert_eq!(by_name["scan-01-01"].status, InstanceStatus::Succeeded);
        assert_eq!(by_name["scan-01-03"].status, InstanceStatus::Succeeded);
        let stuck = by_name["scan-01-02"];
        assert_eq!(stuck.status, InstanceStatus::TimedOut);
        assert!(stuck.log.contains("scanning"));
        assert_eq!(result.groups[0].state, GroupState::TimedOut);
        assert_eq!(result.exit_code(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_when_done_leaves_nothing_behind() {
        let cloud = Arc::new(MockProvider::default());
        let ctl = controller(cloud.clone());
        let mut req = request("cleanup", 5, &["a", "b", "c", "d", "e"]);
        req.remove_when_done = true;

        let result = ctl.fleet(req, CancellationToken::new()).await.unwrap();
        assert_eq!(result.exit_code(), 0);
        assert!(result.groups.iter().all(|g| g.state == GroupState::Removed));
        assert!(cloud.group_names().is_empty());
        assert!(cloud.blob_names().is_empty());
        assert!(ctl.list().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn upload_failure_aborts_before_provisioning() {
        let cloud = Arc::new(MockProvider::default());
        cloud.fail_uploads(u32::MAX);
        let ctl = controller(cloud.clone());

        let err = ctl
            .fleet(request("scan", 2, &["a", "b"]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShardUpload(_)));
        assert!(cloud.blob_names().is_empty());
        assert!(!cloud.calls().iter().any(|c| c.starts_with("create_group")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_does_nothing() {
        let cloud = Arc::new(MockProvider::default());
        let ctl = controller(cloud.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = ctl
            .fleet(request("scan", 2, &["a", "b"]), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(cloud.group_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn task_must_reference_the_input() {
        let cloud = Arc::new(MockProvider::default());
        let ctl = controller(cloud.clone());
        let mut req = request("scan", 2, &["a", "b"]);
        req.task = "echo hello".to_owned();

        let err = ctl.fleet(req, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_is_a_one_instance_fleet() {
        let cloud = Arc::new(MockProvider::default());
        let ctl = controller(cloud.clone());

        let result = ctl
            .run(
                "probe",
                "scanner",
                "uname -a",
                Duration::from_secs(3600),
                true,
                Vec::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.instances.len(), 1);
        assert_eq!(result.instances[0].name, "probe-01-01");
        assert_eq!(result.exit_code(), 0);
        assert!(cloud.group_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_matches_glob_patterns() {
        let cloud = Arc::new(MockProvider::default());
        cloud.seed_group("scan-01", "westeurope", "Succeeded", &["scan-01-01"]);
        cloud.seed_group("scan-02", "westeurope", "Succeeded", &["scan-02-01"]);
        cloud.seed_group("other-01", "westeurope", "Succeeded", &["other-01-01"]);
        let ctl = controller(cloud.clone());

        let removed = ctl.remove("scan-*").await.unwrap();
        assert_eq!(removed, vec!["scan-01", "scan-02"]);
        assert_eq!(cloud.group_names(), vec!["other-01"]);
    }
}
