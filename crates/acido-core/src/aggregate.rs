use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Succeeded,
    Failed,
    TimedOut,
    /// The group never provisioned; the shard was not consumed.
    Unprovisioned,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub name: String,
    pub status: InstanceStatus,
    pub log: String,
    /// Adapter error class for unprovisioned or failed instances.
    pub error: Option<String>,
}

/// Flat text report: every instance's log under a `--- name ---` banner.
/// No deduplication or tool-output parsing; order is whatever the fleet
/// produced.
pub fn render_text(reports: &[InstanceReport]) -> String {
    let mut out = String::new();
    for r in reports {
        out.push_str(&format!("--- {} ---\n", r.name));
        out.push_str(&r.log);
        if !r.log.is_empty() && !r.log.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

/// Structured form: one map of logs and one of statuses, both keyed by
/// instance name.
pub fn render_structured(reports: &[InstanceReport]) -> serde_json::Value {
    let logs: BTreeMap<&str, &str> = reports
        .iter()
        .map(|r| (r.name.as_str(), r.log.as_str()))
        .collect();
    let status: BTreeMap<&str, InstanceStatus> =
        reports.iter().map(|r| (r.name.as_str(), r.status)).collect();
    json!({ "logs": logs, "status": status })
}

pub async fn write_output(path: &Path, text: &str) -> Result<()> {
    tokio::fs::write(path, text).await?;
    Ok(())
}
