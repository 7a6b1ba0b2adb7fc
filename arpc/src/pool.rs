//! Pool of outbound gRPC connections
//!
//! The pool is thread-safe and meant to be shared for opening connections to every service
//! a process talks to. In release mode it authenticates connections automatically, see
//! [`crate::credentials`].
//!
//! # Known limitation
//!
//! Dialing happens outside the pool lock and the new connection is registered afterwards.
//! If [`ConnPool::close`] runs while an [`ConnPool::open`] is between those two steps, the
//! new connection is not registered and the pool will not close it: it is returned to the
//! caller, who owns it from then on. This keeps the lock off the network path.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;

use crate::config::PoolConfig;
use crate::credentials::{
    CallCredentials, CertificateLoader, CredentialResolver, MetadataTokenSourceFactory, Protocol,
    RootCertificates, SystemCertificateLoader, TokenSourceFactory,
};
use crate::error::{Error, Result};

/// An open connection to a remote service
///
/// Cheap to clone. Use [`ClientConnection::service`] to build tonic clients:
///
/// ```ignore
/// let conn = pool.open("story-service", 443, Protocol::Https).await?;
/// let mut client = StoryClient::new(conn.service());
/// ```
#[derive(Clone)]
pub struct ClientConnection {
    channel: Channel,
    credentials: CallCredentials,
    closed: Arc<AtomicBool>,
    target: String,
}

impl ClientConnection {
    fn new(channel: Channel, credentials: CallCredentials, closed: Arc<AtomicBool>, target: String) -> Self {
        Self {
            channel,
            credentials,
            closed,
            target,
        }
    }

    /// Channel with per-call credentials applied
    pub fn service(&self) -> InterceptedService<Channel, CallCredentials> {
        InterceptedService::new(self.channel.clone(), self.credentials.clone())
    }

    /// URI this connection dials
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether calls are authenticated
    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_authenticated()
    }

    /// Close the connection. Subsequent calls fail with `UNAVAILABLE`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the connection was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("target", &self.target)
            .field("authenticated", &self.is_authenticated())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Default)]
struct PoolState {
    conns: Vec<ClientConnection>,
    certs: Option<RootCertificates>,
    closed: bool,
}

/// Manages client connections to gRPC services
pub struct ConnPool {
    state: Mutex<PoolState>,
    release: bool,
    connect_eagerly: bool,
    resolver: CredentialResolver,
    certificates: Arc<dyn CertificateLoader>,
}

impl ConnPool {
    /// Create a pool with the default strategies and settings
    ///
    /// `release` enables TLS and per-call identity tokens.
    pub fn new(release: bool) -> Self {
        Self::builder().release(release).build()
    }

    /// Create a pool builder
    pub fn builder() -> ConnPoolBuilder {
        ConnPoolBuilder::default()
    }

    /// Open a new connection to `host:port`
    ///
    /// Fails with [`Error::PoolClosed`] once the pool has been closed. In release mode the
    /// root certificates are loaded the first time this is called; a failed load is retried
    /// on the next call.
    pub async fn open(&self, host: &str, port: u16, protocol: Protocol) -> Result<ClientConnection> {
        let certs = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(Error::PoolClosed);
            }

            if self.release {
                Some(self.ensure_certificates(&mut state)?)
            } else {
                None
            }
        };

        let options = self
            .resolver
            .resolve(host, port, protocol, certs.as_ref())
            .await?;
        let target = options.endpoint.uri().to_string();

        let channel = if self.connect_eagerly {
            options.endpoint.connect().await?
        } else {
            options.endpoint.connect_lazy()
        };

        let closed = Arc::new(AtomicBool::new(false));
        let credentials = CallCredentials::new(closed.clone(), options.token_source);
        let conn = ClientConnection::new(channel, credentials, closed, target);

        let mut state = self.state.lock().await;
        if state.closed {
            tracing::warn!(
                target = %conn.target(),
                "Connection pool closed while dialing, connection left to the caller"
            );
        } else {
            state.conns.push(conn.clone());
        }

        tracing::debug!(
            target = %conn.target(),
            authenticated = conn.is_authenticated(),
            "Connection opened"
        );

        Ok(conn)
    }

    /// Close every connection of the pool
    ///
    /// Idempotent. Once closed, the pool cannot open connections anymore.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }

        let count = state.conns.len();
        for conn in state.conns.drain(..) {
            conn.close();
        }
        state.closed = true;

        tracing::info!(connections = count, "Connection pool closed");
    }

    /// Number of registered connections
    pub async fn len(&self) -> usize {
        self.state.lock().await.conns.len()
    }

    /// Whether no connection is registered
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether the pool was closed
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Whether connections are authenticated
    pub fn is_release(&self) -> bool {
        self.release
    }

    fn ensure_certificates(&self, state: &mut PoolState) -> Result<RootCertificates> {
        if let Some(certs) = &state.certs {
            return Ok(certs.clone());
        }

        let certs = self.certificates.load()?;
        tracing::info!(certificates = certs.len(), "Root CA certificates loaded");

        state.certs = Some(certs.clone());
        Ok(certs)
    }
}

impl fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnPool")
            .field("release", &self.release)
            .field("connect_eagerly", &self.connect_eagerly)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ConnPool`]
#[derive(Default)]
pub struct ConnPoolBuilder {
    release: bool,
    config: PoolConfig,
    certificate_loader: Option<Arc<dyn CertificateLoader>>,
    token_source_factory: Option<Arc<dyn TokenSourceFactory>>,
}

impl ConnPoolBuilder {
    /// Enable TLS and per-call identity tokens
    pub fn release(mut self, release: bool) -> Self {
        self.release = release;
        self
    }

    /// Dial settings
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Source of the trusted root certificates
    pub fn certificate_loader(mut self, loader: Arc<dyn CertificateLoader>) -> Self {
        self.certificate_loader = Some(loader);
        self
    }

    /// Source of per-audience identity tokens
    pub fn token_source_factory(mut self, factory: Arc<dyn TokenSourceFactory>) -> Self {
        self.token_source_factory = Some(factory);
        self
    }

    /// Build the pool
    pub fn build(self) -> ConnPool {
        let certificates = self.certificate_loader.unwrap_or_else(|| {
            Arc::new(match &self.config.ca_bundle_path {
                Some(path) => SystemCertificateLoader::with_path(path),
                None => SystemCertificateLoader::new(),
            })
        });

        let token_sources = self
            .token_source_factory
            .unwrap_or_else(|| Arc::new(MetadataTokenSourceFactory::from_config(&self.config)));

        ConnPool {
            state: Mutex::new(PoolState::default()),
            release: self.release,
            connect_eagerly: self.config.connect_eagerly,
            resolver: CredentialResolver::new(token_sources, self.config),
            certificates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{StaticTokenSource, Token, TokenSource};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    const ROOT_CA: &str = include_str!("../testdata/root-ca.pem");

    /// Counts loads, failing the first `failures` of them
    struct CountingLoader {
        calls: AtomicUsize,
        failures: usize,
    }

    impl CountingLoader {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures,
            })
        }
    }

    impl CertificateLoader for CountingLoader {
        fn load(&self) -> Result<RootCertificates> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(Error::Certificates("bundle unavailable".to_string()));
            }
            RootCertificates::from_pem(ROOT_CA)
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenSourceFactory for CountingFactory {
        async fn token_source(&self, _audience: &str) -> Result<Arc<dyn TokenSource>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StaticTokenSource::new(Token::new("secret-access-token"))))
        }
    }

    fn release_pool(loader: Arc<CountingLoader>, factory: Arc<CountingFactory>) -> ConnPool {
        ConnPool::builder()
            .release(true)
            .certificate_loader(loader)
            .token_source_factory(factory)
            .build()
    }

    /// A port nothing listens on
    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_open_plaintext() {
        let pool = ConnPool::new(false);

        let conn = pool.open("127.0.0.1", 8080, Protocol::Https).await.unwrap();
        assert_eq!(conn.target(), "http://127.0.0.1:8080/");
        assert!(!conn.is_authenticated());
        assert!(!conn.is_closed());
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_same_target_opens_separate_connections() {
        let pool = ConnPool::new(false);

        let first = pool.open("127.0.0.1", 8080, Protocol::Http).await.unwrap();
        let second = pool.open("127.0.0.1", 8080, Protocol::Http).await.unwrap();
        assert_eq!(first.target(), second.target());
        assert_eq!(pool.len().await, 2);

        first.close();
        assert!(first.is_closed());
        assert!(!second.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_opens_are_all_registered() {
        let pool = Arc::new(ConnPool::new(false));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.open("127.0.0.1", 8080, Protocol::Http).await })
            })
            .collect();

        let mut opened = 0;
        for handle in handles {
            handle.await.unwrap().unwrap();
            opened += 1;
        }

        assert_eq!(pool.len().await, opened);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let pool = ConnPool::new(false);
        let first = pool.open("127.0.0.1", 8080, Protocol::Http).await.unwrap();
        let second = pool.open("127.0.0.1", 8081, Protocol::Http).await.unwrap();

        pool.close().await;
        assert!(first.is_closed());
        assert!(second.is_closed());
        assert!(pool.is_closed().await);
        assert!(pool.is_empty().await);

        pool.close().await;
        assert!(pool.is_closed().await);
    }

    #[tokio::test]
    async fn test_open_after_close_is_rejected_before_dialing() {
        let config = PoolConfig {
            connect_eagerly: true,
            ..PoolConfig::default()
        };
        let pool = ConnPool::builder().config(config).build();
        pool.close().await;

        // Nothing listens there, but the closed pool must answer first
        let err = pool
            .open("127.0.0.1", closed_port(), Protocol::Http)
            .await
            .unwrap_err();
        assert!(err.is_pool_closed());
    }

    #[tokio::test]
    async fn test_eager_connect_failure_is_not_registered() {
        let config = PoolConfig {
            connect_eagerly: true,
            connect_timeout_secs: 1,
            ..PoolConfig::default()
        };
        let pool = ConnPool::builder().config(config).build();

        let err = pool
            .open("127.0.0.1", closed_port(), Protocol::Http)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connect(_)));
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_host() {
        let pool = ConnPool::new(false);

        let err = pool
            .open("not a host", 8080, Protocol::Http)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEndpoint { .. }));
        assert!(pool.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_release_loads_certificates_once() {
        let loader = CountingLoader::new(0);
        let factory = Arc::new(CountingFactory::default());
        let pool = Arc::new(release_pool(loader.clone(), factory.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.open("localhost", 443, Protocol::Https).await })
            })
            .collect();

        for handle in handles {
            let conn = handle.await.unwrap().unwrap();
            assert!(conn.is_authenticated());
            assert_eq!(conn.target(), "https://localhost:443/");
        }

        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(factory.calls.load(Ordering::SeqCst), 8);
        assert_eq!(pool.len().await, 8);
    }

    #[tokio::test]
    async fn test_failed_certificate_load_is_retried() {
        let loader = CountingLoader::new(1);
        let factory = Arc::new(CountingFactory::default());
        let pool = release_pool(loader.clone(), factory.clone());

        let err = pool
            .open("localhost", 443, Protocol::Https)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Certificates(_)));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 0);

        pool.open("localhost", 443, Protocol::Https).await.unwrap();
        pool.open("localhost", 443, Protocol::Https).await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn test_plaintext_never_loads_certificates() {
        let loader = CountingLoader::new(0);
        let factory = Arc::new(CountingFactory::default());
        let pool = ConnPool::builder()
            .certificate_loader(loader.clone())
            .token_source_factory(factory.clone())
            .build();

        pool.open("localhost", 443, Protocol::Https).await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
        assert_eq!(factory.calls.load(Ordering::SeqCst), 0);
    }
}
