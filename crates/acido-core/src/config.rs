use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Region tokens the provider accepts for this tool. Anything else is
/// rejected before any resource is touched.
pub const REGIONS: &[&str] = &[
    "westeurope",
    "northeurope",
    "uksouth",
    "francecentral",
    "germanywestcentral",
    "eastus",
    "eastus2",
    "westus",
    "westus2",
    "centralus",
    "southeastasia",
    "australiaeast",
];

pub fn is_known_region(region: &str) -> bool {
    REGIONS.contains(&region)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    pub server: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub subscription_id: String,
    pub resource_group: String,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Managed-identity resource id; used instead of the client secret
    /// when running inside the provider.
    pub managed_identity: Option<String>,
    pub registry: Option<RegistryConfig>,
    pub storage_account: String,
    pub storage_sas: String,
    #[serde(default = "default_blob_container")]
    pub blob_container: String,
    pub default_region: Option<String>,
    /// Network stack new fleets attach to, set by `ip select`.
    pub selected_stack: Option<String>,
    /// Group-name pattern remembered by `select`.
    pub selected_pattern: Option<String>,
    /// Image-builder tool spawned by `create`.
    pub builder: Option<String>,
}

fn default_blob_container() -> String {
    "acido".to_owned()
}

impl Config {
    pub fn path() -> PathBuf {
        if let Ok(p) = std::env::var("ACIDO_CONFIG") {
            return PathBuf::from(p);
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_owned());
        PathBuf::from(home).join(".acido").join("config.json")
    }

    pub fn load() -> Result<Self> {
        let path = Self::path();
        let contents = fs::read_to_string(&path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let cfg: Config = serde_json::from_str(&contents)?;
        if cfg.resource_group.is_empty() {
            return Err(Error::Configuration("resource_group is not set".into()));
        }
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = File::create(&path)?;
        write!(file, "{}", serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Validates the requested regions against the allow-list. An empty
    /// request falls back to the configured default region; with no default
    /// configured the call is rejected rather than guessing.
    pub fn resolve_regions(&self, requested: &[String]) -> Result<Vec<String>> {
        if requested.is_empty() {
            return match &self.default_region {
                Some(r) if is_known_region(r) => Ok(vec![r.clone()]),
                Some(r) => Err(Error::Configuration(format!(
                    "default region {r:?} is not a recognized region"
                ))),
                None => Err(Error::Configuration(
                    "no regions given and no default region configured".into(),
                )),
            };
        }
        for r in requested {
            if !is_known_region(r) {
                return Err(Error::Configuration(format!(
                    "unknown region {r:?} (recognized: {})",
                    REGIONS.join(", ")
                )));
            }
        }
        Ok(requested.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_region_rejected() {
        let cfg = Config::default();
        let err = cfg.resolve_regions(&["atlantis".to_owned()]).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn empty_regions_need_a_default() {
        let mut cfg = Config::default();
        assert!(cfg.resolve_regions(&[]).is_err());

        cfg.default_region = Some("westeurope".to_owned());
        assert_eq!(cfg.resolve_regions(&[]).unwrap(), vec!["westeurope"]);
    }

    #[test]
    fn explicit_regions_pass_through() {
        let cfg = Config::default();
        let got = cfg
            .resolve_regions(&["eastus".to_owned(), "uksouth".to_owned()])
            .unwrap();
        assert_eq!(got, vec!["eastus", "uksouth"]);
    }
}
