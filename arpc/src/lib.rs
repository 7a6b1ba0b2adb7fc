//! # arpc
//!
//! gRPC plumbing for services talking to each other.
//!
//! ## Features
//!
//! - **Connection pool**: a new connection per `open`, dialed lazily and tracked for `close`
//! - **Transport security**: plaintext in development, TLS with root certificates
//!   loaded once in release mode
//! - **Call credentials**: ID tokens for the target audience attached to every call
//! - **Health checks**: `grpc.health.v1.Health` aggregated from dependency probes,
//!   with a streaming `Watch`
//! - **Error mapping** and **call reporting** for servers
//!
//! ## Example
//!
//! ```rust,no_run
//! use arpc::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let pool = ConnPool::builder()
//!         .release(config.is_release())
//!         .config(config.pool.clone())
//!         .build();
//!     let conn = pool.open("inventory", 443, Protocol::Https).await?;
//!     let _channel = conn.service();
//!
//!     let health = HealthService::from_config(DepsCheck::new(), &config.health);
//!     let (listener, mut server) = start_server_with_config(&config.service).await?;
//!     let handle = serve(listener, server.add_service(health.into_server()))?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.close().await?;
//!     pool.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod credentials;
pub mod error;
pub mod grpc;
pub mod observability;
pub mod pool;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, HealthConfig, PoolConfig, ServiceConfig};
    pub use crate::credentials::{
        CertificateLoader, Protocol, RootCertificates, StaticTokenSource, Token, TokenSource,
        TokenSourceFactory,
    };
    pub use crate::error::{Error, Result};
    pub use crate::grpc::{
        serve, serve_with_shutdown, start_server, start_server_with_config, Code, DepsCheck,
        ErrorMapper, HealthService, ReportLayer, ServerHandle, Status,
    };
    pub use crate::observability::init_tracing;
    pub use crate::pool::{ClientConnection, ConnPool};

    pub use tracing::{debug, error, info, instrument, trace, warn};
}
