use std::time::Duration;

use log::{debug, warn};

use crate::DONE_SENTINEL_PREFIX;
use crate::cloud::{CloudError, CloudProvider};

const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub poll_interval: Duration,
    /// `None` waits forever.
    pub deadline: Option<Duration>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug)]
pub struct Detection {
    pub outcome: Outcome,
    pub log: String,
}

/// Polls one instance's log until the completion sentinel shows up, the
/// group goes provider-terminal `Failed`, or the deadline elapses.
///
/// The sentinel (`ACIDO_DONE=<completion-uuid>`) is the only portable
/// signal that the user process exited: the provider reports `Succeeded`
/// on provisioning, not on process exit.
pub async fn wait_for_completion(
    cloud: &dyn CloudProvider,
    group: &str,
    instance: &str,
    completion_uuid: &str,
    cfg: &DetectorConfig,
) -> Result<Detection, CloudError> {
    let needle = format!("{DONE_SENTINEL_PREFIX}{completion_uuid}");
    let started = tokio::time::Instant::now();
    let mut last_log = String::new();
    let mut failures = 0u32;
    let mut backoff = BACKOFF_BASE;

    loop {
        match cloud.get_logs(group, instance, None, false).await {
            Ok(bytes) => {
                failures = 0;
                backoff = BACKOFF_BASE;
                last_log = String::from_utf8_lossy(&bytes).into_owned();
                if last_log.lines().any(|l| l.trim() == needle) {
                    return Ok(Detection {
                        outcome: Outcome::Succeeded,
                        log: last_log,
                    });
                }
                match cloud.get_group(group).await {
                    Ok(summary) if summary.state == "Failed" => {
                        return Ok(Detection {
                            outcome: Outcome::Failed,
                            log: last_log,
                        });
                    }
                    Ok(_) => {}
                    Err(e) if e.is_transient() => {
                        debug!("group state check for {group} deferred: {e}")
                    }
                    Err(e) => return Err(e),
                }
            }
            // the log endpoint 404s until the container has started
            Err(CloudError::NotFound(msg)) => debug!("{group}/{instance} not ready: {msg}"),
            Err(e) if e.is_transient() => {
                failures += 1;
                warn!(
                    "poll {group}/{instance} failed ({failures}/{MAX_CONSECUTIVE_FAILURES}): {e}"
                );
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    return Ok(Detection {
                        outcome: Outcome::Failed,
                        log: last_log,
                    });
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
                continue;
            }
            Err(e) => return Err(e),
        }

        if let Some(deadline) = cfg.deadline {
            if started.elapsed() + cfg.poll_interval >= deadline {
                return Ok(Detection {
                    outcome: Outcome::TimedOut,
                    log: last_log,
                });
            }
        }
        tokio::time::sleep(cfg.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;
    use std::sync::Arc;

    fn fast() -> DetectorConfig {
        DetectorConfig {
            poll_interval: Duration::from_millis(100),
            deadline: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sentinel_completes_the_instance() {
        let cloud = Arc::new(MockProvider::default());
        cloud.seed_group("f-01", "westeurope", "Succeeded", &["f-01-01"]);
        cloud.script_logs(
            "f-01",
            "f-01-01",
            &["scanning...\n", "scanning...\nACIDO_DONE=abc-123\n"],
        );

        let d = wait_for_completion(&*cloud, "f-01", "f-01-01", "abc-123", &fast())
            .await
            .unwrap();
        assert_eq!(d.outcome, Outcome::Succeeded);
        assert!(d.log.contains("scanning..."));
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_uuid_never_matches() {
        let cloud = Arc::new(MockProvider::default());
        cloud.seed_group("f-01", "westeurope", "Succeeded", &["f-01-01"]);
        cloud.script_logs("f-01", "f-01-01", &["ACIDO_DONE=other-uuid\n"]);

        let cfg = DetectorConfig {
            poll_interval: Duration::from_millis(100),
            deadline: Some(Duration::from_secs(1)),
        };
        let d = wait_for_completion(&*cloud, "f-01", "f-01-01", "abc-123", &cfg)
            .await
            .unwrap();
        assert_eq!(d.outcome, Outcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_returns_partial_log() {
        let cloud = Arc::new(MockProvider::default());
        cloud.seed_group("f-01", "westeurope", "Succeeded", &["f-01-01"]);
        cloud.script_logs("f-01", "f-01-01", &["partial output\n"]);

        let cfg = DetectorConfig {
            poll_interval: Duration::from_secs(10),
            deadline: Some(Duration::from_secs(30)),
        };
        let d = wait_for_completion(&*cloud, "f-01", "f-01-01", "abc-123", &cfg)
            .await
            .unwrap();
        assert_eq!(d.outcome, Outcome::TimedOut);
        assert_eq!(d.log, "partial output\n");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_group_fails_the_instance() {
        let cloud = Arc::new(MockProvider::default());
        cloud.seed_group("f-01", "westeurope", "Failed", &["f-01-01"]);
        cloud.script_logs("f-01", "f-01-01", &["oom\n"]);

        let d = wait_for_completion(&*cloud, "f-01", "f-01-01", "abc-123", &fast())
            .await
            .unwrap();
        assert_eq!(d.outcome, Outcome::Failed);
        assert_eq!(d.log, "oom\n");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_faults_escalate_after_five() {
        let cloud = Arc::new(MockProvider::default());
        cloud.seed_group("f-01", "westeurope", "Succeeded", &["f-01-01"]);
        cloud.fail_logs("f-01", "f-01-01", u32::MAX);

        let d = wait_for_completion(&*cloud, "f-01", "f-01-01", "abc-123", &fast())
            .await
            .unwrap();
        assert_eq!(d.outcome, Outcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_faults_below_the_cap_recover() {
        let cloud = Arc::new(MockProvider::default());
        cloud.seed_group("f-01", "westeurope", "Succeeded", &["f-01-01"]);
        cloud.fail_logs("f-01", "f-01-01", 3);
        cloud.script_logs("f-01", "f-01-01", &["ACIDO_DONE=abc-123\n"]);

        let d = wait_for_completion(&*cloud, "f-01", "f-01-01", "abc-123", &fast())
            .await
            .unwrap();
        assert_eq!(d.outcome, Outcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_logs_wait_for_startup() {
        let cloud = Arc::new(MockProvider::default());
        cloud.seed_group("f-01", "westeurope", "Succeeded", &["f-01-01"]);
        // no log scripted at all: NotFound until the deadline
        let cfg = DetectorConfig {
            poll_interval: Duration::from_millis(100),
            deadline: Some(Duration::from_secs(1)),
        };
        let d = wait_for_completion(&*cloud, "f-01", "f-01-01", "abc-123", &cfg)
            .await
            .unwrap();
        assert_eq!(d.outcome, Outcome::TimedOut);
        assert!(d.log.is_empty());
    }
}
