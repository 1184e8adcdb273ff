use std::sync::Arc;
use std::time::Duration;

use acido_core::cloud::{ArmClient, CloudProvider};
use acido_core::fleet::FleetController;
use acido_core::network::NetworkStackManager;
use axum::Router;
use envconfig::Envconfig;
use eyre::Context;
use log::info;
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod handler;

use config::{ServerConfig, State, StateInner};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    pretty_env_logger::init();
    dotenvy::dotenv().ok();

    let server_cfg =
        ServerConfig::init_from_env().context("initialize config from environment")?;
    let core_cfg = acido_core::config::Config::load()?;

    let cloud: Arc<dyn CloudProvider> = Arc::new(ArmClient::new(core_cfg.clone())?);
    let controller = FleetController::new(cloud.clone(), core_cfg.clone());
    let stacks = NetworkStackManager::new(cloud.clone());

    let ct = CancellationToken::new();
    let ct_copy = ct.clone();

    ctrlc::set_handler(move || {
        ct_copy.cancel();
    })?;

    let state = State::new(StateInner {
        cloud,
        controller,
        stacks,
        core_config: core_cfg,
        deadline: Duration::from_secs(server_cfg.request_deadline_secs),
        shutdown: ct.clone(),
    });

    let app = Router::<State>::new()
        .nest("/api", api::router())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&server_cfg.listen).await?;
    info!("listening on {}", server_cfg.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(ct.cancelled_owned())
        .await?;

    Ok(())
}
