use std::time::Duration;

use acido_core::Error as CoreError;
use acido_core::fleet::{FleetInput, FleetRequest, MAX_RUN_SECONDS, generate_fleet_name};
use log::{debug, error};
use serde::Serialize;
use serde_json::{Value, json};

use crate::config::State;

#[derive(Debug, Serialize)]
pub struct HandlerResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: Value,
}

impl HandlerResponse {
    fn ok(body: Value) -> Self {
        Self {
            status_code: 200,
            body,
        }
    }

    fn bad_request(body: Value) -> Self {
        Self {
            status_code: 400,
            body,
        }
    }

    fn server_error(message: String) -> Self {
        Self {
            status_code: 500,
            body: json!({ "error": message }),
        }
    }
}

/// Validates a JSON request naming an operation and dispatches it. The
/// response envelope mirrors what a hosted-function runtime expects:
/// `{statusCode, body}` with 200/400/500.
pub async fn handle(state: &State, request: Value) -> HandlerResponse {
    let Some(operation) = request.get("operation").and_then(Value::as_str) else {
        return HandlerResponse::bad_request(json!({ "error": "Invalid operation" }));
    };
    debug!("dispatching operation {operation}");

    match operation {
        "fleet" => op_fleet(state, &request).await,
        "run" => op_run(state, &request).await,
        "ls" => op_ls(state).await,
        "rm" => op_rm(state, &request).await,
        "ip_create" => op_ip_create(state, &request).await,
        "ip_ls" => op_ip_ls(state).await,
        "ip_rm" => op_ip_rm(state, &request).await,
        _ => HandlerResponse::bad_request(json!({ "error": "Invalid operation" })),
    }
}

fn check_required(request: &Value, required: &[&str]) -> Option<HandlerResponse> {
    let missing: Vec<&str> = required
        .iter()
        .filter(|f| request.get(**f).is_none_or(Value::is_null))
        .copied()
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(HandlerResponse::bad_request(json!({
            "error": format!("Missing required fields: {}", missing.join(", ")),
        })))
    }
}

/// `regions` accepts either a singleton string or an array of strings; a
/// bare string is normalized to a one-element array.
fn parse_regions(v: Option<&Value>) -> Result<Vec<String>, HandlerResponse> {
    match v {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|i| {
                i.as_str().map(str::to_owned).ok_or_else(|| {
                    HandlerResponse::bad_request(
                        json!({ "error": "regions must contain only strings" }),
                    )
                })
            })
            .collect(),
        Some(_) => Err(HandlerResponse::bad_request(
            json!({ "error": "regions must be a string or an array of strings" }),
        )),
    }
}

fn parse_string_array(v: &Value, field: &str) -> Result<Vec<String>, HandlerResponse> {
    v.as_array()
        .and_then(|items| {
            items
                .iter()
                .map(|i| i.as_str().map(str::to_owned))
                .collect::<Option<Vec<String>>>()
        })
        .ok_or_else(|| {
            HandlerResponse::bad_request(
                json!({ "error": format!("{field} must be an array of strings") }),
            )
        })
}

fn run_duration(v: Option<&Value>) -> u64 {
    v.and_then(Value::as_u64)
        .unwrap_or(MAX_RUN_SECONDS)
        .min(MAX_RUN_SECONDS)
}

fn map_error(e: CoreError) -> HandlerResponse {
    match e {
        CoreError::Configuration(msg) => {
            HandlerResponse::bad_request(json!({ "error": msg }))
        }
        CoreError::Cancelled => {
            HandlerResponse::server_error("operation cancelled by runtime deadline".into())
        }
        other => {
            error!("operation failed: {other}");
            HandlerResponse::server_error(other.to_string())
        }
    }
}

async fn op_fleet(state: &State, request: &Value) -> HandlerResponse {
    if let Some(resp) = check_required(request, &["image", "targets", "task"]) {
        return resp;
    }
    let targets = match parse_string_array(&request["targets"], "targets") {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let regions = match parse_regions(request.get("regions")) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let name = request["fleet_name"]
        .as_str()
        .map(str::to_owned)
        .unwrap_or_else(generate_fleet_name);
    let num_instances = request["num_instances"]
        .as_u64()
        .map(|n| n as usize)
        .unwrap_or(targets.len());
    let rm_when_done = request["rm_when_done"].as_bool().unwrap_or(true);

    let req = FleetRequest {
        name: name.clone(),
        instances: num_instances,
        image: request["image"].as_str().unwrap_or_default().to_owned(),
        task: request["task"].as_str().unwrap_or_default().to_owned(),
        input: FleetInput::Lines(targets),
        regions,
        wait: None,
        remove_when_done: rm_when_done,
        output: None,
    };

    let cancel = state.shutdown.child_token();
    let watchdog = {
        let cancel = cancel.clone();
        let deadline = state.deadline;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            cancel.cancel();
        })
    };
    let result = state.controller.fleet(req, cancel).await;
    watchdog.abort();

    match result {
        Ok(r) => HandlerResponse::ok(json!({
            "operation": "fleet",
            "fleet": r.fleet,
            "status": r.structured["status"],
            "logs": r.structured["logs"],
            "report": r.report,
            "exit_code": r.exit_code(),
        })),
        Err(e) => map_error(e),
    }
}

async fn op_run(state: &State, request: &Value) -> HandlerResponse {
    if let Some(resp) = check_required(request, &["name", "image", "task"]) {
        return resp;
    }
    let regions = match parse_regions(request.get("regions")) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let duration = run_duration(request.get("duration"));
    let cleanup = request["cleanup"].as_bool().unwrap_or(true);

    let cancel = state.shutdown.child_token();
    let result = state
        .controller
        .run(
            request["name"].as_str().unwrap_or_default(),
            request["image"].as_str().unwrap_or_default(),
            request["task"].as_str().unwrap_or_default(),
            Duration::from_secs(duration),
            cleanup,
            regions,
            cancel,
        )
        .await;

    match result {
        Ok(r) => HandlerResponse::ok(json!({
            "operation": "run",
            "fleet": r.fleet,
            "status": r.structured["status"],
            "logs": r.structured["logs"],
        })),
        Err(e) => map_error(e),
    }
}

async fn op_ls(state: &State) -> HandlerResponse {
    match state.controller.list().await {
        Ok(groups) => HandlerResponse::ok(json!({
            "operation": "ls",
            "groups": groups
                .iter()
                .map(|g| json!({ "group": g.name, "instances": g.instances, "state": g.state }))
                .collect::<Vec<_>>(),
        })),
        Err(e) => map_error(e),
    }
}

async fn op_rm(state: &State, request: &Value) -> HandlerResponse {
    if let Some(resp) = check_required(request, &["name"]) {
        return resp;
    }
    match state
        .controller
        .remove(request["name"].as_str().unwrap_or_default())
        .await
    {
        Ok(removed) => HandlerResponse::ok(json!({ "operation": "rm", "removed": removed })),
        Err(e) => map_error(e),
    }
}

async fn op_ip_create(state: &State, request: &Value) -> HandlerResponse {
    if let Some(resp) = check_required(request, &["name"]) {
        return resp;
    }
    let region = match state.core_config.resolve_regions(&[]) {
        Ok(mut rs) => rs.remove(0),
        Err(e) => return map_error(e),
    };
    match state
        .stacks
        .create(request["name"].as_str().unwrap_or_default(), &region)
        .await
    {
        Ok(ip) => HandlerResponse::ok(json!({
            "operation": "ip_create",
            "name": ip.name,
            "ip": ip.address,
        })),
        Err(e) => map_error(e),
    }
}

async fn op_ip_ls(state: &State) -> HandlerResponse {
    match state.cloud.list_public_ips().await {
        Ok(ips) => HandlerResponse::ok(json!({ "operation": "ip_ls", "ips": ips })),
        Err(e) => map_error(CoreError::Cloud(e)),
    }
}

async fn op_ip_rm(state: &State, request: &Value) -> HandlerResponse {
    if let Some(resp) = check_required(request, &["name"]) {
        return resp;
    }
    let name = request["name"].as_str().unwrap_or_default();
    match state.stacks.destroy(name).await {
        Ok(()) => HandlerResponse::ok(json!({ "operation": "ip_rm", "name": name })),
        Err(e) => map_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateInner;
    use acido_core::cloud::{ArmClient, CloudProvider};
    use acido_core::config::Config;
    use acido_core::fleet::FleetController;
    use acido_core::network::NetworkStackManager;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn test_state() -> State {
        let config = Config::default();
        let cloud: Arc<dyn CloudProvider> = Arc::new(ArmClient::new(config.clone()).unwrap());
        Arc::new(StateInner {
            cloud: cloud.clone(),
            controller: FleetController::new(cloud.clone(), config.clone()),
            stacks: NetworkStackManager::new(cloud),
            core_config: config,
            deadline: Duration::from_secs(900),
            shutdown: CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn unknown_operation_is_rejected() {
        let state = test_state();
        let resp = handle(&state, json!({ "operation": "explode" })).await;
        assert_eq!(resp.status_code, 400);
        assert_eq!(resp.body["error"], "Invalid operation");

        let resp = handle(&state, json!({ "no_operation": true })).await;
        assert_eq!(resp.status_code, 400);
        assert_eq!(resp.body["error"], "Invalid operation");
    }

    #[tokio::test]
    async fn missing_fields_are_listed() {
        let state = test_state();
        let resp = handle(&state, json!({ "operation": "fleet", "image": "scanner" })).await;
        assert_eq!(resp.status_code, 400);
        let msg = resp.body["error"].as_str().unwrap();
        assert!(msg.contains("targets"));
        assert!(msg.contains("task"));
        assert!(!msg.contains("image"));
    }

    #[tokio::test]
    async fn rm_requires_a_name() {
        let state = test_state();
        let resp = handle(&state, json!({ "operation": "rm" })).await;
        assert_eq!(resp.status_code, 400);
        assert!(resp.body["error"].as_str().unwrap().contains("name"));
    }

    #[tokio::test]
    async fn fleet_with_unknown_region_is_a_client_error() {
        let state = test_state();
        let resp = handle(
            &state,
            json!({
                "operation": "fleet",
                "image": "scanner",
                "targets": ["a.test"],
                "task": "echo -iL input",
                "regions": "atlantis",
            }),
        )
        .await;
        assert_eq!(resp.status_code, 400);
    }

    #[test]
    fn singleton_region_is_normalized() {
        let v = json!("westeurope");
        assert_eq!(parse_regions(Some(&v)).unwrap(), vec!["westeurope"]);
        let v = json!(["eastus", "uksouth"]);
        assert_eq!(parse_regions(Some(&v)).unwrap(), vec!["eastus", "uksouth"]);
        assert!(parse_regions(None).unwrap().is_empty());
        let v = json!(42);
        assert!(parse_regions(Some(&v)).is_err());
    }

    #[test]
    fn run_duration_is_capped() {
        assert_eq!(run_duration(None), 900);
        assert_eq!(run_duration(Some(&json!(60))), 60);
        assert_eq!(run_duration(Some(&json!(4000))), 900);
    }
}
