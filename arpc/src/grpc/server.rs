//! gRPC server bootstrap
//!
//! ```ignore
//! let (listener, mut server) = start_server(50051).await?;
//! let router = server.add_service(health.into_server());
//! let handle = serve(listener, router)?;
//! // Graceful shutdown.
//! handle.close().await?;
//! ```

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Router;
use tonic::transport::Server;

use crate::config::ServiceConfig;
use crate::error::{Error, Result};

/// Bind a listener on `port` and create the server to register services on
///
/// A zero port is rejected to prevent accidental misconfigurations.
pub async fn start_server(port: u16) -> Result<(TcpListener, Server)> {
    if port == 0 {
        return Err(Error::PortRequired);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("gRPC listener bound on {}", addr);

    Ok((listener, Server::builder()))
}

/// Same as [`start_server`], applying request timeout and TCP keepalive from configuration
pub async fn start_server_with_config(config: &ServiceConfig) -> Result<(TcpListener, Server)> {
    let (listener, server) = start_server(config.port).await?;

    let server = server
        .timeout(config.timeout())
        .tcp_keepalive(Some(config.tcp_keepalive()));

    Ok((listener, server))
}

/// Serve `router` on `listener` in the background
pub fn serve(listener: TcpListener, router: Router) -> Result<ServerHandle> {
    serve_with_shutdown(listener, router, CancellationToken::new())
}

/// Serve `router` on `listener` until `shutdown` is cancelled
///
/// Share `shutdown` with long-lived streams (see
/// [`HealthService::with_shutdown`](crate::grpc::HealthService::with_shutdown)) so they end
/// before the drain.
pub fn serve_with_shutdown(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<ServerHandle> {
    let local_addr = listener.local_addr()?;
    let signal = shutdown.clone();

    let task = tokio::spawn(async move {
        router
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal.cancelled_owned())
            .await
    });

    tracing::info!("gRPC server listening on {}", local_addr);

    Ok(ServerHandle {
        local_addr,
        shutdown,
        task,
    })
}

/// Handle on a running server
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<std::result::Result<(), tonic::transport::Error>>,
}

impl ServerHandle {
    /// Address the server listens on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Token cancelled when the server shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting connections, drain in-flight requests, then release the listener
    pub async fn close(self) -> Result<()> {
        tracing::info!("Shutting down gRPC server on {}", self.local_addr);
        self.shutdown.cancel();

        match self.task.await {
            Ok(Ok(())) => {
                tracing::info!("gRPC server shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Connect(e)),
            Err(e) => Err(Error::Internal(format!("gRPC server task failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_port_is_required() {
        let err = start_server(0).await.unwrap_err();
        assert!(matches!(err, Error::PortRequired));
    }

    #[tokio::test]
    async fn test_start_and_close() {
        let port = free_port();
        let (listener, mut server) = start_server(port).await.unwrap();

        let health = crate::grpc::HealthService::new(
            crate::grpc::DepsCheck::new(),
            std::time::Duration::from_secs(1),
        );
        let router = server.add_service(health.into_server());
        let handle = serve(listener, router).unwrap();
        assert_eq!(handle.local_addr().port(), port);

        handle.close().await.unwrap();

        // Listener is released after close
        let (listener, _) = start_server(port).await.unwrap();
        drop(listener);
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let port = free_port();
        let (_listener, _) = start_server(port).await.unwrap();

        let err = start_server(port).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_start_with_config() {
        let config = ServiceConfig {
            port: free_port(),
            ..crate::config::Config::default().service
        };

        let (listener, _) = start_server_with_config(&config).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), config.port);
    }
}
