use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::Config;

const MANAGEMENT_BASE: &str = "https://management.azure.com";
const ACI_API: &str = "2023-05-01";
const NETWORK_API: &str = "2023-09-01";

/// How long group creation may stay non-terminal before the adapter gives up.
pub const PROVISION_TIMEOUT: Duration = Duration::from_secs(300);
const PROVISION_POLL: Duration = Duration::from_secs(5);
const NETWORK_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("resource busy: {0}")]
    ResourceBusy(String),
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("provider error: {0}")]
    Fatal(String),
}

impl CloudError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Transient(_))
    }

    /// Short class name used in per-instance status output.
    pub fn class(&self) -> &'static str {
        match self {
            CloudError::Auth(_) => "auth",
            CloudError::QuotaExceeded(_) => "quota",
            CloudError::NotFound(_) => "not_found",
            CloudError::Conflict(_) => "conflict",
            CloudError::ResourceBusy(_) => "resource_busy",
            CloudError::Transient(_) => "transient",
            CloudError::Fatal(_) => "fatal",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone)]
pub struct RegistryCredentials {
    pub server: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct SubnetRef {
    pub vnet: String,
    pub subnet: String,
}

#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub name: String,
    pub region: String,
    pub image: String,
    pub registry: Option<RegistryCredentials>,
    pub containers: Vec<ContainerSpec>,
    pub cpu: f64,
    pub memory_gb: f64,
    pub subnet: Option<SubnetRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSummary {
    pub name: String,
    pub region: String,
    /// Provider provisioning state (`Succeeded`, `Failed`, ...).
    pub state: String,
    pub instances: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicIp {
    pub name: String,
    pub region: String,
    pub address: Option<String>,
}

/// Narrow typed facade over the container-service, blob-store and
/// virtual-network management APIs. Every call is synchronous from the
/// caller's perspective; operations the provider runs asynchronously are
/// awaited internally by polling to a terminal state.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create_group(&self, spec: &GroupSpec) -> Result<GroupSummary, CloudError>;
    async fn get_group(&self, name: &str) -> Result<GroupSummary, CloudError>;
    async fn delete_group(&self, name: &str) -> Result<(), CloudError>;
    async fn list_groups(&self) -> Result<Vec<GroupSummary>, CloudError>;
    async fn get_logs(
        &self,
        group: &str,
        instance: &str,
        tail: Option<u32>,
        timestamps: bool,
    ) -> Result<Vec<u8>, CloudError>;

    async fn upload_blob(&self, name: &str, data: Vec<u8>) -> Result<(), CloudError>;
    async fn download_blob(&self, name: &str) -> Result<Vec<u8>, CloudError>;
    async fn delete_blob(&self, name: &str) -> Result<(), CloudError>;

    async fn create_public_ip(&self, name: &str, region: &str) -> Result<PublicIp, CloudError>;
    async fn get_public_ip(&self, name: &str) -> Result<Option<PublicIp>, CloudError>;
    async fn list_public_ips(&self) -> Result<Vec<PublicIp>, CloudError>;
    async fn create_egress_gateway(
        &self,
        name: &str,
        region: &str,
        ip_name: &str,
    ) -> Result<(), CloudError>;
    async fn create_vnet_with_delegated_subnet(
        &self,
        vnet: &str,
        subnet: &str,
        region: &str,
    ) -> Result<(), CloudError>;
    async fn attach_gateway_to_subnet(
        &self,
        vnet: &str,
        subnet: &str,
        gateway: &str,
    ) -> Result<(), CloudError>;
    async fn delete_egress_gateway(&self, name: &str) -> Result<(), CloudError>;
    async fn delete_subnet(&self, vnet: &str, subnet: &str) -> Result<(), CloudError>;
    async fn delete_vnet(&self, name: &str) -> Result<(), CloudError>;
    async fn delete_public_ip(&self, name: &str) -> Result<(), CloudError>;
}

/// Retries `op` on transient provider faults only, with exponential backoff
/// (base 2 s, cap 30 s). All other error classes surface unchanged.
pub async fn retry_transient<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, CloudError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CloudError>>,
{
    let mut delay = Duration::from_secs(2);
    let mut tried = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && tried + 1 < attempts => {
                tried += 1;
                warn!("transient provider fault (attempt {tried}/{attempts}): {e}");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(30));
            }
            other => return other,
        }
    }
}

struct CachedToken {
    token: String,
    expires_at: std::time::Instant,
}

/// Management-plane REST client. Auth is either a client-credential grant or
/// the instance-metadata endpoint when a managed identity is configured.
pub struct ArmClient {
    http: reqwest::Client,
    config: Config,
    token: RwLock<Option<CachedToken>>,
}

fn quota_coded(body: &str) -> bool {
    body.contains("QuotaExceeded")
        || (body.contains("OperationNotAllowed") && body.to_lowercase().contains("quota"))
}

pub(crate) fn classify_status(status: u16, body: &str) -> CloudError {
    let msg = summarize(body);
    match status {
        401 | 403 => CloudError::Auth(msg),
        404 => CloudError::NotFound(msg),
        409 if quota_coded(body) => CloudError::QuotaExceeded(msg),
        409 => CloudError::Conflict(msg),
        400 if quota_coded(body) => CloudError::QuotaExceeded(msg),
        429 => CloudError::Transient(msg),
        s if s >= 500 => CloudError::Transient(msg),
        _ => CloudError::Fatal(msg),
    }
}

/// Provider error bodies repeat the request; keep the code/message pair.
fn summarize(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        let err = &v["error"];
        if let (Some(code), Some(message)) = (err["code"].as_str(), err["message"].as_str()) {
            return format!("{code}: {message}");
        }
    }
    body.chars().take(300).collect()
}

fn from_reqwest(e: reqwest::Error) -> CloudError {
    if e.is_timeout() || e.is_connect() {
        CloudError::Transient(e.to_string())
    } else {
        CloudError::Fatal(e.to_string())
    }
}

impl ArmClient {
    pub fn new(config: Config) -> Result<Self, CloudError> {
        let http = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(60))
            .use_rustls_tls()
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            http,
            config,
            token: RwLock::new(None),
        })
    }

    fn resource_id(&self, provider: &str, rest: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{provider}/{rest}",
            self.config.subscription_id, self.config.resource_group
        )
    }

    fn provider_url(&self, provider: &str, rest: &str, api: &str) -> String {
        format!(
            "{MANAGEMENT_BASE}{}?api-version={api}",
            self.resource_id(provider, rest)
        )
    }

    fn blob_url(&self, name: &str) -> String {
        format!(
            "https://{}.blob.core.windows.net/{}/{}?{}",
            self.config.storage_account,
            self.config.blob_container,
            name,
            self.config.storage_sas.trim_start_matches('?')
        )
    }

    async fn bearer(&self) -> Result<String, CloudError> {
        {
            let rg = self.token.read().await;
            if let Some(t) = rg.as_ref() {
                if t.expires_at > std::time::Instant::now() + Duration::from_secs(60) {
                    return Ok(t.token.clone());
                }
            }
        }

        let mut wg = self.token.write().await;
        if let Some(t) = wg.as_ref() {
            if t.expires_at > std::time::Instant::now() + Duration::from_secs(60) {
                return Ok(t.token.clone());
            }
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            #[serde(deserialize_with = "flexible_u64")]
            expires_in: u64,
        }

        let resp = if self.config.managed_identity.is_some() {
            // instance-metadata endpoint, only reachable inside the provider
            let mut req = self
                .http
                .get("http://169.254.169.254/metadata/identity/oauth2/token")
                .header("Metadata", "true")
                .query(&[
                    ("api-version", "2018-02-01"),
                    ("resource", "https://management.azure.com/"),
                ]);
            if let Some(client_id) = &self.config.client_id {
                req = req.query(&[("client_id", client_id.as_str())]);
            }
            req.send().await.map_err(from_reqwest)?
        } else {
            let tenant = self
                .config
                .tenant_id
                .as_deref()
                .ok_or_else(|| CloudError::Auth("tenant_id is not configured".into()))?;
            let client_id = self
                .config
                .client_id
                .as_deref()
                .ok_or_else(|| CloudError::Auth("client_id is not configured".into()))?;
            let secret = self
                .config
                .client_secret
                .as_deref()
                .ok_or_else(|| CloudError::Auth("client_secret is not configured".into()))?;
            self.http
                .post(format!(
                    "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token"
                ))
                .form(&[
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id),
                    ("client_secret", secret),
                    ("scope", "https://management.azure.com/.default"),
                ])
                .send()
                .await
                .map_err(from_reqwest)?
        };

        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(CloudError::Auth(summarize(&body)));
        }
        let tok: TokenResponse = resp.json().await.map_err(from_reqwest)?;
        let token = tok.access_token.clone();
        *wg = Some(CachedToken {
            token: tok.access_token,
            expires_at: std::time::Instant::now() + Duration::from_secs(tok.expires_in),
        });
        Ok(token)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, CloudError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let code = status.as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(code, &body))
    }

    async fn put_json(&self, url: &str, body: Value) -> Result<Value, CloudError> {
        let token = self.bearer().await?;
        let resp = self
            .http
            .put(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        let resp = Self::check(resp).await?;
        resp.json().await.map_err(from_reqwest)
    }

    async fn get_json(&self, url: &str) -> Result<Value, CloudError> {
        let token = self.bearer().await?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(from_reqwest)?;
        let resp = Self::check(resp).await?;
        resp.json().await.map_err(from_reqwest)
    }

    async fn delete_url(&self, url: &str) -> Result<(), CloudError> {
        let token = self.bearer().await?;
        let resp = self
            .http
            .delete(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(from_reqwest)?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Polls `url` until `properties.provisioningState` reaches a terminal
    /// value or `timeout` fires.
    async fn await_provisioning(&self, url: &str, timeout: Duration) -> Result<Value, CloudError> {
        let started = std::time::Instant::now();
        loop {
            let body = self.get_json(url).await?;
            let state = body["properties"]["provisioningState"]
                .as_str()
                .unwrap_or("Unknown")
                .to_owned();
            match state.as_str() {
                "Succeeded" => return Ok(body),
                "Failed" | "Canceled" => {
                    return Err(CloudError::Fatal(format!(
                        "provider reported terminal state {state}"
                    )));
                }
                other => debug!("waiting on {url}: {other}"),
            }
            if started.elapsed() > timeout {
                return Err(CloudError::Fatal(format!(
                    "timed out after {}s waiting for provisioning",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(PROVISION_POLL).await;
        }
    }

    fn group_url(&self, name: &str) -> String {
        self.provider_url(
            "Microsoft.ContainerInstance",
            &format!("containerGroups/{name}"),
            ACI_API,
        )
    }

    fn group_body(&self, spec: &GroupSpec) -> Value {
        let containers: Vec<Value> = spec
            .containers
            .iter()
            .map(|c| {
                json!({
                    "name": c.name,
                    "properties": {
                        "image": spec.image,
                        "environmentVariables": c.env,
                        "resources": {
                            "requests": { "cpu": spec.cpu, "memoryInGB": spec.memory_gb }
                        },
                    }
                })
            })
            .collect();

        let mut properties = json!({
            "osType": "Linux",
            "restartPolicy": "Never",
            "containers": containers,
        });
        if let Some(reg) = &spec.registry {
            properties["imageRegistryCredentials"] = json!([{
                "server": reg.server,
                "username": reg.username,
                "password": reg.password,
            }]);
        }
        if let Some(subnet) = &spec.subnet {
            let id = self.resource_id(
                "Microsoft.Network",
                &format!("virtualNetworks/{}/subnets/{}", subnet.vnet, subnet.subnet),
            );
            properties["subnetIds"] = json!([{ "id": id }]);
        }

        let mut body = json!({ "location": spec.region, "properties": properties });
        if let Some(identity) = &self.config.managed_identity {
            let mut assigned = serde_json::Map::new();
            assigned.insert(identity.clone(), json!({}));
            body["identity"] = json!({
                "type": "UserAssigned",
                "userAssignedIdentities": assigned,
            });
        }
        body
    }

    fn parse_group(v: &Value) -> GroupSummary {
        let instances = v["properties"]["containers"]
            .as_array()
            .map(|cs| {
                cs.iter()
                    .filter_map(|c| c["name"].as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        GroupSummary {
            name: v["name"].as_str().unwrap_or_default().to_owned(),
            region: v["location"].as_str().unwrap_or_default().to_owned(),
            state: v["properties"]["provisioningState"]
                .as_str()
                .unwrap_or("Unknown")
                .to_owned(),
            instances,
            created_at: v["systemData"]["createdAt"]
                .as_str()
                .and_then(|s| s.parse().ok()),
        }
    }

    fn parse_ip(v: &Value) -> PublicIp {
        PublicIp {
            name: v["name"].as_str().unwrap_or_default().to_owned(),
            region: v["location"].as_str().unwrap_or_default().to_owned(),
            address: v["properties"]["ipAddress"].as_str().map(str::to_owned),
        }
    }
}

fn flexible_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    // the metadata endpoint returns expires_in as a string
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(u64),
        Str(String),
    }
    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[async_trait]
impl CloudProvider for ArmClient {
    async fn create_group(&self, spec: &GroupSpec) -> Result<GroupSummary, CloudError> {
        let url = self.group_url(&spec.name);
        debug!("creating group {} in {}", spec.name, spec.region);
        self.put_json(&url, self.group_body(spec)).await?;
        let settled = self.await_provisioning(&url, PROVISION_TIMEOUT).await?;
        Ok(Self::parse_group(&settled))
    }

    async fn get_group(&self, name: &str) -> Result<GroupSummary, CloudError> {
        let body = self.get_json(&self.group_url(name)).await?;
        Ok(Self::parse_group(&body))
    }

    async fn delete_group(&self, name: &str) -> Result<(), CloudError> {
        self.delete_url(&self.group_url(name)).await
    }

    async fn list_groups(&self) -> Result<Vec<GroupSummary>, CloudError> {
        let url = self.provider_url("Microsoft.ContainerInstance", "containerGroups", ACI_API);
        let body = self.get_json(&url).await?;
        Ok(body["value"]
            .as_array()
            .map(|vs| vs.iter().map(Self::parse_group).collect())
            .unwrap_or_default())
    }

    async fn get_logs(
        &self,
        group: &str,
        instance: &str,
        tail: Option<u32>,
        timestamps: bool,
    ) -> Result<Vec<u8>, CloudError> {
        let mut url = self.provider_url(
            "Microsoft.ContainerInstance",
            &format!("containerGroups/{group}/containers/{instance}/logs"),
            ACI_API,
        );
        if let Some(n) = tail {
            url.push_str(&format!("&tail={n}"));
        }
        if timestamps {
            url.push_str("&timestamps=true");
        }
        let body = self.get_json(&url).await?;
        Ok(body["content"]
            .as_str()
            .unwrap_or_default()
            .as_bytes()
            .to_vec())
    }

    async fn upload_blob(&self, name: &str, data: Vec<u8>) -> Result<(), CloudError> {
        let resp = self
            .http
            .put(self.blob_url(name))
            .header("x-ms-blob-type", "BlockBlob")
            .body(data)
            .send()
            .await
            .map_err(from_reqwest)?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn download_blob(&self, name: &str) -> Result<Vec<u8>, CloudError> {
        let resp = self
            .http
            .get(self.blob_url(name))
            .send()
            .await
            .map_err(from_reqwest)?;
        let resp = Self::check(resp).await?;
        Ok(resp.bytes().await.map_err(from_reqwest)?.to_vec())
    }

    async fn delete_blob(&self, name: &str) -> Result<(), CloudError> {
        let resp = self
            .http
            .delete(self.blob_url(name))
            .send()
            .await
            .map_err(from_reqwest)?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn create_public_ip(&self, name: &str, region: &str) -> Result<PublicIp, CloudError> {
        let url = self.provider_url(
            "Microsoft.Network",
            &format!("publicIPAddresses/{name}"),
            NETWORK_API,
        );
        self.put_json(
            &url,
            json!({
                "location": region,
                "sku": { "name": "Standard" },
                "properties": {
                    "publicIPAllocationMethod": "Static",
                    "publicIPAddressVersion": "IPv4",
                },
            }),
        )
        .await?;
        let settled = self.await_provisioning(&url, NETWORK_TIMEOUT).await?;
        Ok(Self::parse_ip(&settled))
    }

    async fn get_public_ip(&self, name: &str) -> Result<Option<PublicIp>, CloudError> {
        let url = self.provider_url(
            "Microsoft.Network",
            &format!("publicIPAddresses/{name}"),
            NETWORK_API,
        );
        match self.get_json(&url).await {
            Ok(body) => Ok(Some(Self::parse_ip(&body))),
            Err(CloudError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_public_ips(&self) -> Result<Vec<PublicIp>, CloudError> {
        let url = self.provider_url("Microsoft.Network", "publicIPAddresses", NETWORK_API);
        let body = self.get_json(&url).await?;
        Ok(body["value"]
            .as_array()
            .map(|vs| vs.iter().map(Self::parse_ip).collect())
            .unwrap_or_default())
    }

    async fn create_egress_gateway(
        &self,
        name: &str,
        region: &str,
        ip_name: &str,
    ) -> Result<(), CloudError> {
        let url = self.provider_url(
            "Microsoft.Network",
            &format!("natGateways/{name}"),
            NETWORK_API,
        );
        let ip_id = self.resource_id("Microsoft.Network", &format!("publicIPAddresses/{ip_name}"));
        self.put_json(
            &url,
            json!({
                "location": region,
                "sku": { "name": "Standard" },
                "properties": {
                    "idleTimeoutInMinutes": 4,
                    "publicIpAddresses": [{ "id": ip_id }],
                },
            }),
        )
        .await?;
        self.await_provisioning(&url, NETWORK_TIMEOUT).await?;
        Ok(())
    }

    async fn create_vnet_with_delegated_subnet(
        &self,
        vnet: &str,
        subnet: &str,
        region: &str,
    ) -> Result<(), CloudError> {
        let url = self.provider_url(
            "Microsoft.Network",
            &format!("virtualNetworks/{vnet}"),
            NETWORK_API,
        );
        self.put_json(
            &url,
            json!({
                "location": region,
                "properties": {
                    "addressSpace": { "addressPrefixes": ["10.0.0.0/16"] },
                    "subnets": [{
                        "name": subnet,
                        "properties": {
                            "addressPrefix": "10.0.0.0/24",
                            "delegations": [{
                                "name": "aci-delegation",
                                "properties": {
                                    "serviceName": "Microsoft.ContainerInstance/containerGroups"
                                },
                            }],
                        },
                    }],
                },
            }),
        )
        .await?;
        self.await_provisioning(&url, NETWORK_TIMEOUT).await?;
        Ok(())
    }

    async fn attach_gateway_to_subnet(
        &self,
        vnet: &str,
        subnet: &str,
        gateway: &str,
    ) -> Result<(), CloudError> {
        let url = self.provider_url(
            "Microsoft.Network",
            &format!("virtualNetworks/{vnet}/subnets/{subnet}"),
            NETWORK_API,
        );
        let gw_id = self.resource_id("Microsoft.Network", &format!("natGateways/{gateway}"));
        self.put_json(
            &url,
            json!({
                "properties": {
                    "addressPrefix": "10.0.0.0/24",
                    "natGateway": { "id": gw_id },
                    "delegations": [{
                        "name": "aci-delegation",
                        "properties": {
                            "serviceName": "Microsoft.ContainerInstance/containerGroups"
                        },
                    }],
                },
            }),
        )
        .await?;
        self.await_provisioning(&url, NETWORK_TIMEOUT).await?;
        Ok(())
    }

    async fn delete_egress_gateway(&self, name: &str) -> Result<(), CloudError> {
        self.delete_url(&self.provider_url(
            "Microsoft.Network",
            &format!("natGateways/{name}"),
            NETWORK_API,
        ))
        .await
    }

    async fn delete_subnet(&self, vnet: &str, subnet: &str) -> Result<(), CloudError> {
        self.delete_url(&self.provider_url(
            "Microsoft.Network",
            &format!("virtualNetworks/{vnet}/subnets/{subnet}"),
            NETWORK_API,
        ))
        .await
    }

    async fn delete_vnet(&self, name: &str) -> Result<(), CloudError> {
        self.delete_url(&self.provider_url(
            "Microsoft.Network",
            &format!("virtualNetworks/{name}"),
            NETWORK_API,
        ))
        .await
    }

    async fn delete_public_ip(&self, name: &str) -> Result<(), CloudError> {
        self.delete_url(&self.provider_url(
            "Microsoft.Network",
            &format!("publicIPAddresses/{name}"),
            NETWORK_API,
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(classify_status(401, ""), CloudError::Auth(_)));
        assert!(matches!(classify_status(404, ""), CloudError::NotFound(_)));
        assert!(matches!(classify_status(409, ""), CloudError::Conflict(_)));
        assert!(matches!(
            classify_status(409, r#"{"error":{"code":"QuotaExceeded","message":"too many"}}"#),
            CloudError::QuotaExceeded(_)
        ));
        assert!(classify_status(429, "").is_transient());
        assert!(classify_status(503, "").is_transient());
        assert!(matches!(classify_status(418, ""), CloudError::Fatal(_)));
    }

    #[test]
    fn error_body_summarized() {
        let e = classify_status(
            403,
            r#"{"error":{"code":"AuthorizationFailed","message":"no"}}"#,
        );
        assert_eq!(e.to_string(), "authentication rejected: AuthorizationFailed: no");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_only_transient() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);
        let out = retry_transient(3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CloudError::Transient("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out.unwrap(), 2);

        let calls = AtomicU32::new(0);
        let out: Result<(), _> = retry_transient(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CloudError::Conflict("exists".into())) }
        })
        .await;
        assert!(matches!(out.unwrap_err(), CloudError::Conflict(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
