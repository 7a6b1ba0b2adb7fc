//! gRPC health check service
//!
//! Implements the standard gRPC health checking protocol on top of declared dependencies.
//! See: https://github.com/grpc/grpc/blob/master/doc/health-checking.md
//!
//! A service is `SERVING` only if every one of its dependencies is healthy. The empty service
//! name covers every registered dependency. Statuses are recomputed on every query, nothing
//! is cached.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_server::{Health, HealthServer};
use tonic_health::pb::{HealthCheckRequest, HealthCheckResponse};

use crate::config::HealthConfig;
use crate::error::{Error, Result};

/// Lower bound for the watch interval
const MIN_WATCH_INTERVAL: Duration = Duration::from_millis(1);

/// Buffered statuses per watch stream
const WATCH_BUFFER: usize = 4;

/// Probe checking a single dependency. Healthy dependencies return `Ok(())`.
pub type DepCheck = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Probes for every dependency, by name
///
/// Must contain every dependency referenced by a service.
pub type DepCheckCallbacks = HashMap<String, DepCheck>;

/// Dependencies of each gRPC service, by service name
///
/// Only list RPC services here, the overall health (empty name) is handled automatically.
pub type DepCheckServices = HashMap<String, Vec<String>>;

/// Dependency registry backing the health service
#[derive(Clone, Default)]
pub struct DepsCheck {
    /// Probes by dependency name
    pub dependencies: DepCheckCallbacks,
    /// Dependency names by service name
    pub services: DepCheckServices,
}

impl DepsCheck {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dependency probe
    pub fn dependency<F>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dependencies.insert(name.into(), Arc::new(check));
        self
    }

    /// Declare the dependencies of a service
    pub fn service<I, D>(mut self, name: impl Into<String>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        self.services.insert(
            name.into(),
            dependencies.into_iter().map(Into::into).collect(),
        );
        self
    }
}

impl fmt::Debug for DepsCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DepsCheck")
            .field("dependencies", &self.dependencies.keys().collect::<Vec<_>>())
            .field("services", &self.services)
            .finish()
    }
}

/// Health check service implementation
///
/// Cheap to clone; the registry is shared and read-only.
#[derive(Clone)]
pub struct HealthService {
    deps: Arc<DepsCheck>,
    watch_interval: Duration,
    shutdown: CancellationToken,
}

impl HealthService {
    /// Create a new health service
    ///
    /// `watch_interval` is the delay between two statuses on a watch stream.
    pub fn new(deps: DepsCheck, watch_interval: Duration) -> Self {
        Self {
            deps: Arc::new(deps),
            watch_interval: watch_interval.max(MIN_WATCH_INTERVAL),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a health service from configuration
    pub fn from_config(deps: DepsCheck, config: &HealthConfig) -> Self {
        Self::new(deps, config.watch_interval())
    }

    /// End every watch stream with `CANCELLED` once `token` is cancelled
    ///
    /// Pass the server shutdown token so graceful shutdowns are not held by open streams.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Wrap into a tonic service ready to be registered on a server
    pub fn into_server(self) -> HealthServer<Self> {
        HealthServer::new(self)
    }

    /// Delay between two statuses on a watch stream
    pub fn watch_interval(&self) -> Duration {
        self.watch_interval
    }

    fn service_deps(&self, service: &str) -> Result<Vec<&str>> {
        if service.is_empty() {
            return Ok(self.deps.dependencies.keys().map(String::as_str).collect());
        }

        self.deps
            .services
            .get(service)
            .map(|deps| deps.iter().map(String::as_str).collect())
            .ok_or_else(|| Error::UnknownService(service.to_string()))
    }

    /// Compute the current status of a service
    ///
    /// Fails with [`Error::UnknownService`] for unregistered services and with
    /// [`Error::UnknownDependency`] when a service references a dependency without a probe.
    /// A failing probe is not an error, it makes the service `NOT_SERVING`.
    pub fn compute_status(&self, service: &str) -> Result<ServingStatus> {
        for dep in self.service_deps(service)? {
            let check = self
                .deps
                .dependencies
                .get(dep)
                .ok_or_else(|| Error::UnknownDependency(dep.to_string()))?;

            if let Err(e) = check() {
                tracing::debug!(
                    service = %service,
                    dependency = %dep,
                    error = %e,
                    "Dependency unhealthy"
                );
                return Ok(ServingStatus::NotServing);
            }
        }

        Ok(ServingStatus::Serving)
    }

    /// Stream the status of a service, one status per interval
    ///
    /// The first status is sent one full interval after the call. Every tick sends a status,
    /// changed or not. The stream ends with `CANCELLED` when the status cannot be computed or
    /// the shutdown token fires, and silently when the receiver is dropped.
    pub fn watch_status(&self, service: String) -> ReceiverStream<std::result::Result<HealthCheckResponse, Status>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let this = self.clone();

        tokio::spawn(async move { this.drive_watch(service, tx).await });

        ReceiverStream::new(rx)
    }

    async fn drive_watch(
        self,
        service: String,
        tx: mpsc::Sender<std::result::Result<HealthCheckResponse, Status>>,
    ) {
        let period = self.watch_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(service = %service, interval_ms = period.as_millis(), "Watch stream started");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    terminate(&tx).await;
                    return;
                }
                _ = tx.closed() => {
                    tracing::debug!(service = %service, "Watch stream closed by client");
                    return;
                }
                _ = ticker.tick() => {
                    let (item, last) = match self.compute_status(&service) {
                        Ok(status) => (Ok(HealthCheckResponse { status: status.into() }), false),
                        Err(e) => (Err(Status::cancelled(format!("get service status: {}", e))), true),
                    };

                    // A consumer that stopped reading must not hold the stream past shutdown
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => {
                            terminate(&tx).await;
                            return;
                        }
                        sent = tx.send(item) => {
                            if sent.is_err() {
                                tracing::debug!(service = %service, "stream service status: receiver dropped");
                                return;
                            }
                        }
                    }

                    if last {
                        return;
                    }
                }
            }
        }
    }
}

/// End a watch stream with `CANCELLED`, unless the client is already gone
async fn terminate(tx: &mpsc::Sender<std::result::Result<HealthCheckResponse, Status>>) {
    tokio::select! {
        _ = tx.send(Err(Status::cancelled("stream terminated"))) => {}
        _ = tx.closed() => {}
    }
}

impl fmt::Debug for HealthService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthService")
            .field("deps", &self.deps)
            .field("watch_interval", &self.watch_interval)
            .finish()
    }
}

#[async_trait]
impl Health for HealthService {
    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> std::result::Result<Response<HealthCheckResponse>, Status> {
        let status = self.compute_status(&request.get_ref().service)?;

        Ok(Response::new(HealthCheckResponse {
            status: status.into(),
        }))
    }

    type WatchStream = ReceiverStream<std::result::Result<HealthCheckResponse, Status>>;

    async fn watch(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> std::result::Result<Response<Self::WatchStream>, Status> {
        Ok(Response::new(self.watch_status(request.into_inner().service)))
    }
}
