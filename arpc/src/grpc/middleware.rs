//! gRPC call reporting
//!
//! [`ReportLayer`] logs every call with its latency and gRPC status code. The log level
//! follows the code, see [`report_level`].
//!
//! ```ignore
//! let health = ReportLayer::new("health").layer(health.into_server());
//! server.add_service(health);
//! ```

use http::{HeaderMap, Request, Response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tonic::server::NamedService;
use tonic::Code;
use tower::{Layer, Service};
use tracing::Level;

/// Layer reporting every call of the wrapped service
#[derive(Clone, Debug)]
pub struct ReportLayer {
    name: Arc<str>,
}

impl ReportLayer {
    /// Report calls under the service `name`
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }
}

impl<S> Layer<S> for ReportLayer {
    type Service = ReportService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ReportService {
            inner,
            name: self.name.clone(),
        }
    }
}

/// Service produced by [`ReportLayer`]
#[derive(Clone, Debug)]
pub struct ReportService<S> {
    inner: S,
    name: Arc<str>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ReportService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Take the service that was driven to readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let name = self.name.clone();
        let path = req.uri().path().to_string();

        Box::pin(async move {
            let start = Instant::now();
            let result = inner.call(req).await;
            let latency_ms = millis(start.elapsed());

            let code = match &result {
                Ok(response) => response_code(response.headers()),
                Err(_) => Code::Internal,
            };
            report(&name, &path, latency_ms, code);

            result
        })
    }
}

impl<S: NamedService> NamedService for ReportService<S> {
    const NAME: &'static str = S::NAME;
}

/// Level a call finishing with `code` is reported at
pub fn report_level(code: Code) -> Level {
    match code {
        Code::Ok => Level::INFO,
        Code::Unavailable | Code::Cancelled | Code::Unimplemented => Level::WARN,
        _ => Level::ERROR,
    }
}

/// Code carried by the response headers, OK when absent
///
/// Trailers-only responses carry `grpc-status` in the headers. Otherwise the status
/// arrives in the trailers after the body, which means the call itself succeeded.
fn response_code(headers: &HeaderMap) -> Code {
    headers
        .get("grpc-status")
        .map(|v| Code::from_bytes(v.as_bytes()))
        .unwrap_or(Code::Ok)
}

/// Whole milliseconds in `elapsed`, saturating
fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn report(service: &str, path: &str, latency_ms: u64, code: Code) {
    let code_name = format!("{:?}", code);

    match report_level(code) {
        Level::INFO => tracing::info!(
            service,
            path,
            latency_ms,
            code = %code_name,
            "gRPC call finished"
        ),
        Level::WARN => tracing::warn!(
            service,
            path,
            latency_ms,
            code = %code_name,
            "gRPC call finished"
        ),
        _ => tracing::error!(
            service,
            path,
            latency_ms,
            code = %code_name,
            "gRPC call finished"
        ),
    }
}
