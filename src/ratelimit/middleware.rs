//! Admission middleware that puts a [`RateLimiter`] in front of a handler.

use futures::future::{self, BoxFuture};
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;
use tracing::debug;

use super::decision::Decision;
use super::descriptor::RequestDescriptor;
use super::limiter::RateLimiter;

/// `error` field of every denial body.
pub const DENIAL_ERROR: &str = "Rate limit exceeded";
/// `message` field of every denial body.
pub const DENIAL_MESSAGE: &str = "Too many requests. Please try again later.";

/// JSON body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialBody {
    pub success: bool,
    pub error: &'static str,
    pub message: &'static str,
    pub retry_after: u64,
}

impl DenialBody {
    pub fn new(decision: &Decision) -> Self {
        Self {
            success: false,
            error: DENIAL_ERROR,
            message: DENIAL_MESSAGE,
            retry_after: decision.retry_after_secs.unwrap_or(0),
        }
    }

    pub fn to_json(&self) -> String {
        // Plain string and integer fields always serialize
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Build the 429 response for a denied decision, headers included.
pub fn denial_response<B: From<String>>(decision: &Decision) -> Response<B> {
    let mut response = Response::new(B::from(DenialBody::new(decision).to_json()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    decision.apply_headers(response.headers_mut());
    response
}

/// Count the request and either hand back the decision for stamping or the
/// ready-made denial.
fn admit<ReqBody, ResBody: From<String>>(
    limiter: &RateLimiter,
    request: &Request<ReqBody>,
) -> Result<Decision, Response<ResBody>> {
    let descriptor = RequestDescriptor::from_request(request);
    let decision = limiter.increment(&descriptor);
    if decision.allowed {
        return Ok(decision);
    }

    debug!(
        limiter = %limiter.name(),
        route = %descriptor.route,
        retry_after = decision.retry_after_secs.unwrap_or(0),
        "Request denied"
    );
    Err(denial_response(&decision))
}

/// A layer that enforces a [`RateLimiter`] on every request.
#[derive(Clone, Debug)]
pub struct AdmissionLayer {
    limiter: Arc<RateLimiter>,
}

impl AdmissionLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            limiter: self.limiter.clone(),
        }
    }
}

/// Wrap `service` so that it only sees admitted requests.
pub fn wrap<S>(limiter: Arc<RateLimiter>, service: S) -> AdmissionService<S> {
    AdmissionLayer::new(limiter).layer(service)
}

/// Middleware service produced by [`AdmissionLayer`].
///
/// Denied requests get a 429 without reaching the inner service. Admitted
/// requests are forwarded and, on success, the response gains the
/// `X-RateLimit-*` headers from the decision taken on entry. Response bodies
/// are never inspected and inner errors pass through untouched.
#[derive(Clone, Debug)]
pub struct AdmissionService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S> AdmissionService<S> {
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let decision = match admit::<_, ResBody>(&self.limiter, &request) {
            Ok(decision) => decision,
            Err(denial) => return Box::pin(future::ready(Ok::<_, S::Error>(denial))),
        };

        let response = self.inner.call(request);
        Box::pin(async move {
            let mut response = response.await?;
            decision.apply_headers(response.headers_mut());
            Ok(response)
        })
    }
}

/// Wrap a plain async handler function.
///
/// The returned closure has the handler's shape and can be registered
/// wherever the handler could.
pub fn wrap_handler<H, Fut, ReqBody, ResBody>(
    limiter: Arc<RateLimiter>,
    handler: H,
) -> impl Fn(Request<ReqBody>) -> BoxFuture<'static, Response<ResBody>> + Clone
where
    H: Fn(Request<ReqBody>) -> Fut + Clone,
    Fut: Future<Output = Response<ResBody>> + Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    move |request: Request<ReqBody>| {
        let decision = match admit::<_, ResBody>(&limiter, &request) {
            Ok(decision) => decision,
            Err(denial) => {
                return Box::pin(future::ready(denial)) as BoxFuture<'static, Response<ResBody>>
            }
        };

        let response = handler(request);
        Box::pin(async move {
            let mut response = response.await;
            decision.apply_headers(response.headers_mut());
            response
        })
    }
}
