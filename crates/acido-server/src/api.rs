use axum::http::StatusCode;
use axum::{Json, Router, extract::State as StateE, routing::post};
use serde_json::Value;

use crate::config::State;
use crate::handler::{self, HandlerResponse};

async fn invoke(
    StateE(state): StateE<State>,
    Json(request): Json<Value>,
) -> (StatusCode, Json<HandlerResponse>) {
    let response = handler::handle(&state, request).await;
    let status =
        StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response))
}

pub fn router() -> Router<State> {
    Router::new().route("/invoke", post(invoke))
}
