//! Admission middleware for axum.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    extract::{ConnectInfo, MatchedPath},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tower::{Layer, Service};
use tracing::warn;

use super::{Admission, Rejection};
use crate::ratelimit::RequestInfo;

/// Identity of the caller, inserted as a request extension by whatever
/// authenticates requests ahead of the admission layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Builds the response for a rejected request.
pub type RejectionHandler = Arc<dyn Fn(&Rejection) -> Response + Send + Sync>;

#[derive(Debug, Serialize)]
struct RejectionBody {
    success: bool,
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

/// Whole seconds to wait, rounded up so a client never retries early.
pub(crate) fn retry_after_secs(rejection: &Rejection) -> Option<u64> {
    rejection.retry_after().map(|after| {
        let secs = after.as_secs() + u64::from(after.subsec_nanos() > 0);
        secs.max(1)
    })
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let retry_after = retry_after_secs(&self);
        match self {
            Rejection::RateLimited { limiter, .. } => {
                let secs = retry_after.unwrap_or(1);
                let body = RejectionBody {
                    success: false,
                    error: format!("Rate limit '{}' exceeded. Please retry later.", limiter),
                    code: "RATE_LIMITED",
                    retry_after_secs: Some(secs),
                };
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("Retry-After", secs.to_string())],
                    Json(body),
                )
                    .into_response()
            }
            Rejection::CircuitOpen { error, .. } => {
                let body = RejectionBody {
                    success: false,
                    error: error.to_string(),
                    code: "CIRCUIT_OPEN",
                    retry_after_secs: None,
                };
                (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
            }
        }
    }
}

/// Runs every request through an [`Admission`] gate guarding one breaker.
#[derive(Clone)]
pub struct AdmissionLayer {
    admission: Arc<Admission>,
    breaker: Arc<str>,
    on_reject: Option<RejectionHandler>,
}

impl AdmissionLayer {
    pub fn new(admission: Arc<Admission>, breaker: impl Into<String>) -> Self {
        Self {
            admission,
            breaker: Arc::from(breaker.into()),
            on_reject: None,
        }
    }

    /// Replace the default 429/503 JSON responses.
    #[must_use]
    pub fn with_rejection_handler(
        mut self,
        handler: impl Fn(&Rejection) -> Response + Send + Sync + 'static,
    ) -> Self {
        self.on_reject = Some(Arc::new(handler));
        self
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            admission: self.admission.clone(),
            breaker: self.breaker.clone(),
            on_reject: self.on_reject.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    admission: Arc<Admission>,
    breaker: Arc<str>,
    on_reject: Option<RejectionHandler>,
}

type BoxFuture<T, E> =
    std::pin::Pin<Box<dyn std::future::Future<Output = std::result::Result<T, E>> + Send>>;

impl<S, B> Service<Request<B>> for AdmissionService<S>
where
    S: Service<Request<B>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<Response, S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> BoxFuture<Response, S::Error> {
        let admission = self.admission.clone();
        let breaker = self.breaker.clone();
        let on_reject = self.on_reject.clone();
        // The clone may not be ready; keep the ready one for this request.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let info = request_info(&req);

            let permit = match admission.admit(&info, &breaker).await {
                Ok(permit) => permit,
                Err(rejection) => {
                    return Ok(match on_reject {
                        Some(handler) => handler(&rejection),
                        None => rejection.into_response(),
                    });
                }
            };

            let result = inner.call(req).await;
            match &result {
                Ok(response) => {
                    let success = !response.status().is_server_error();
                    if !success {
                        warn!(
                            breaker = %breaker,
                            status = response.status().as_u16(),
                            path = %info.path,
                            "Upstream failure recorded"
                        );
                    }
                    permit.record(success);
                }
                Err(_) => permit.record(false),
            }
            result
        })
    }
}

/// Collect what the key generators need from an inbound request.
fn request_info<B>(req: &Request<B>) -> RequestInfo {
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let mut info = RequestInfo::new(req.method().as_str(), path);
    info.client_addr = client_addr(req);
    info.user_id = req
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|user| user.0.clone());
    info
}

fn client_addr<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.ip());
    }

    // Behind a proxy without connect info, trust the first forwarded hop
    req.headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|hop| hop.trim().parse().ok())
}
