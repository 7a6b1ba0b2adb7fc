//! gRPC server support
//!
//! - [`health`]: dependency-aware implementation of `grpc.health.v1.Health`
//! - [`server`]: listener binding and background serving with graceful shutdown
//! - [`errors`]: mapping application errors to statuses
//! - [`middleware`]: per-call reporting
//!
//! ## Example
//!
//! ```ignore
//! use arpc::grpc::{serve_with_shutdown, start_server, DepsCheck, HealthService, ReportLayer};
//! use tokio_util::sync::CancellationToken;
//! use tower::Layer;
//!
//! let deps = DepsCheck::new()
//!     .dependency("db", || db_ping())
//!     .service("bookstore.v1.Shelves", ["db"]);
//!
//! let shutdown = CancellationToken::new();
//! let health = HealthService::new(deps, Duration::from_secs(5)).with_shutdown(shutdown.clone());
//!
//! let (listener, mut server) = start_server(50051).await?;
//! let router = server.add_service(ReportLayer::new("health").layer(health.into_server()));
//! let handle = serve_with_shutdown(listener, router, shutdown)?;
//! ```

pub mod errors;
pub mod health;
pub mod middleware;
pub mod server;

pub use errors::ErrorMapper;
pub use health::{DepCheck, DepCheckCallbacks, DepCheckServices, DepsCheck, HealthService};
pub use middleware::{report_level, ReportLayer, ReportService};
pub use server::{serve, serve_with_shutdown, start_server, start_server_with_config, ServerHandle};

// Re-export tonic types for convenience
pub use tonic::{Code, Request, Response, Status};
