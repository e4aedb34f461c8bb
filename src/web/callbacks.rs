//! Boot-service and agent callbacks.
//!
//! Each handler validates its payload through the gateway and answers
//! `202 Accepted` once the event is queued. Outcomes are observed through
//! the job, not the callback response.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::WebState;
use crate::core::gateway::GatewayError;

#[derive(Debug, Deserialize)]
pub struct DiscoverBody {
    pub mac: String,
    pub interface_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LeaseBody {
    pub mac: String,
    pub ip: String,
    #[serde(default)]
    pub interface_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MacBody {
    pub mac: String,
}

#[derive(Debug, Deserialize)]
pub struct ResultBody {
    pub mac: String,
    pub success: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub struct CallbackError(GatewayError);

impl From<GatewayError> for CallbackError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for CallbackError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            GatewayError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        };
        debug!(error = %self.0, status = status.as_u16(), "Callback rejected");
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type CallbackResult = Result<StatusCode, CallbackError>;

pub async fn discover(State(state): State<WebState>, Json(body): Json<DiscoverBody>) -> CallbackResult {
    state.gateway.on_discover(&body.mac, &body.interface_id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn lease(State(state): State<WebState>, Json(body): Json<LeaseBody>) -> CallbackResult {
    state
        .gateway
        .on_lease_assigned(&body.mac, &body.ip, body.interface_id.as_deref())
        .await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn image_delivered(State(state): State<WebState>, Json(body): Json<MacBody>) -> CallbackResult {
    state.gateway.on_image_delivered(&body.mac).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn install_started(State(state): State<WebState>, Json(body): Json<MacBody>) -> CallbackResult {
    state.gateway.on_install_started(&body.mac).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn install_result(State(state): State<WebState>, Json(body): Json<ResultBody>) -> CallbackResult {
    state
        .gateway
        .on_install_result(&body.mac, body.success, body.detail)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn verify_result(State(state): State<WebState>, Json(body): Json<ResultBody>) -> CallbackResult {
    state
        .gateway
        .on_verify_result(&body.mac, body.success, body.detail)
        .await?;
    Ok(StatusCode::ACCEPTED)
}
