//! Sidecar HTTP API.
//!
//! Lets services that cannot embed the middleware ask for admission over
//! HTTP and report outcomes back.

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::admission::{Admission, Rejection};
use crate::breaker::BreakerSnapshot;
use crate::ratelimit::RequestInfo;

/// Breaker consulted when a request names none.
pub const DEFAULT_BREAKER: &str = "global";

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionRequest {
    pub client_addr: Option<String>,
    pub user_id: Option<String>,
    pub path: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub breaker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limiter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutcomeRequest {
    pub breaker: String,
    pub generation: u64,
    pub success: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.into(),
        }),
    )
        .into_response()
}

/// Routes of the sidecar API.
pub fn router(admission: Arc<Admission>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/admission", post(admit))
        .route("/v1/outcome", post(outcome))
        .route("/v1/breakers", get(breakers))
        .with_state(admission)
}

async fn healthz() -> &'static str {
    "ok"
}

#[instrument(skip(admission, request), fields(path = %request.path))]
async fn admit(
    State(admission): State<Arc<Admission>>,
    Json(request): Json<AdmissionRequest>,
) -> Response {
    let mut info = RequestInfo::new(request.method.unwrap_or_default(), request.path);
    if let Some(addr) = request.client_addr {
        match addr.parse::<IpAddr>() {
            Ok(ip) => info.client_addr = Some(ip),
            Err(_) => {
                warn!(client_addr = %addr, "Rejecting admission request with bad address");
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("invalid client_addr '{}'", addr),
                );
            }
        }
    }
    info.user_id = request.user_id;

    let breaker = request
        .breaker
        .unwrap_or_else(|| DEFAULT_BREAKER.to_string());

    match admission.admit(&info, &breaker).await {
        Ok(permit) => {
            // The caller reports the outcome through /v1/outcome.
            let breaker = permit.breaker().to_string();
            let generation = permit.detach();
            let body = AdmissionResponse {
                allowed: true,
                breaker: Some(breaker),
                generation: Some(generation),
                reason: None,
                limiter: None,
                retry_after_secs: None,
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(rejection) => {
            let retry_after_secs = crate::admission::retry_after_secs(&rejection);
            let (status, reason, limiter) = match rejection {
                Rejection::RateLimited { limiter, .. } => {
                    (StatusCode::TOO_MANY_REQUESTS, "rate_limited", Some(limiter))
                }
                Rejection::CircuitOpen { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "circuit_open", None)
                }
            };
            let body = AdmissionResponse {
                allowed: false,
                breaker: Some(breaker),
                generation: None,
                reason: Some(reason.to_string()),
                limiter,
                retry_after_secs,
            };
            (status, Json(body)).into_response()
        }
    }
}

async fn outcome(
    State(admission): State<Arc<Admission>>,
    Json(request): Json<OutcomeRequest>,
) -> Response {
    match admission.breakers().get_existing(&request.breaker) {
        Some(breaker) => {
            debug!(
                breaker = %request.breaker,
                generation = request.generation,
                success = request.success,
                "Outcome reported"
            );
            breaker.after_request(request.generation, request.success);
            StatusCode::NO_CONTENT.into_response()
        }
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("unknown circuit breaker '{}'", request.breaker),
        ),
    }
}

async fn breakers(State(admission): State<Arc<Admission>>) -> Json<Vec<BreakerSnapshot>> {
    Json(admission.breakers().snapshots())
}
