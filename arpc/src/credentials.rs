//! Transport credentials for outbound connections
//!
//! Outside of release environments connections are plaintext and unauthenticated. In release
//! environments every connection is TLS, verified against the root certificates of the host,
//! and every call carries an identity token scoped to the target audience.
//!
//! Both the certificate source and the token source are strategies injected at construction,
//! see [`CertificateLoader`] and [`TokenSourceFactory`].

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::dangerous::insecure_decode;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tonic::service::Interceptor;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint};
use tonic::{Request, Status};

use crate::config::PoolConfig;
use crate::error::{Error, Result};

/// Tokens are refreshed this long before they expire
const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Delay before retrying a failed refresh
const REFRESH_RETRY: Duration = Duration::from_secs(10);

/// Refresh period for tokens that carry no expiry
const DEFAULT_REFRESH: Duration = Duration::from_secs(50 * 60);

/// Scheme used to build the token audience of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Plain HTTP
    Http,
    /// HTTP over TLS
    Https,
}

impl Protocol {
    /// URI scheme
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    /// Build `scheme://host`
    pub fn with_addr(&self, host: &str) -> String {
        format!("{}://{}", self.scheme(), host)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// A validated PEM bundle of trusted root certificates
#[derive(Clone)]
pub struct RootCertificates {
    pem: Vec<u8>,
    len: usize,
}

impl RootCertificates {
    /// Parse a PEM bundle, failing if it holds no certificate
    pub fn from_pem(pem: impl Into<Vec<u8>>) -> Result<Self> {
        let pem = pem.into();

        let len = rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Certificates(format!("parse PEM bundle: {}", e)))?
            .len();

        if len == 0 {
            return Err(Error::Certificates(
                "bundle contains no certificates".to_string(),
            ));
        }

        Ok(Self { pem, len })
    }

    /// Build a bundle from DER-encoded certificates
    pub fn from_der<I, C>(certs: I) -> Result<Self>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        let mut pem = String::new();
        for cert in certs {
            pem.push_str("-----BEGIN CERTIFICATE-----\n");
            let encoded = base64::engine::general_purpose::STANDARD.encode(cert.as_ref());
            let mut rest = encoded.as_str();
            while !rest.is_empty() {
                let (line, tail) = rest.split_at(rest.len().min(64));
                pem.push_str(line);
                pem.push('\n');
                rest = tail;
            }
            pem.push_str("-----END CERTIFICATE-----\n");
        }

        Self::from_pem(pem)
    }

    /// Read and parse a PEM bundle from disk
    pub fn from_file(path: &Path) -> Result<Self> {
        let pem = std::fs::read(path).map_err(|e| {
            Error::Certificates(format!("read '{}': {}", path.display(), e))
        })?;

        Self::from_pem(pem)
    }

    /// Number of certificates in the bundle
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false, empty bundles are rejected on construction
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bundle as a tonic trust anchor
    pub fn certificate(&self) -> Certificate {
        Certificate::from_pem(&self.pem)
    }
}

impl fmt::Debug for RootCertificates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootCertificates")
            .field("len", &self.len)
            .finish()
    }
}

/// Source of the trusted root certificates
pub trait CertificateLoader: Send + Sync {
    /// Load the bundle. Called at most once per pool unless it fails.
    fn load(&self) -> Result<RootCertificates>;
}

/// Loads roots from an explicit path, or from the platform trust store
///
/// The platform lookup honors `SSL_CERT_FILE` and `SSL_CERT_DIR`.
#[derive(Debug, Clone, Default)]
pub struct SystemCertificateLoader {
    path: Option<PathBuf>,
}

impl SystemCertificateLoader {
    /// Loader that only searches the environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader pinned to an explicit bundle path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }
}

impl CertificateLoader for SystemCertificateLoader {
    fn load(&self) -> Result<RootCertificates> {
        if let Some(path) = &self.path {
            return RootCertificates::from_file(path);
        }

        let native = rustls_native_certs::load_native_certs();
        for e in &native.errors {
            tracing::warn!(error = %e, "Skipping unreadable platform root certificates");
        }

        if native.certs.is_empty() {
            let reason = native
                .errors
                .first()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "platform trust store is empty".to_string());
            return Err(Error::Certificates(reason));
        }

        tracing::debug!(certificates = native.certs.len(), "Loading platform root certificates");
        RootCertificates::from_der(&native.certs)
    }
}

/// A bearer credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Raw token value
    pub access_token: String,
    /// Token type, `Bearer` when empty
    pub token_type: String,
    /// When the token stops being valid
    pub expiry: Option<DateTime<Utc>>,
}

impl Token {
    /// Bearer token without expiry
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: String::new(),
            expiry: None,
        }
    }

    /// Set the token type
    pub fn with_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    /// Set the expiry
    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Normalized token type used in the authorization header
    pub fn kind(&self) -> &str {
        if self.token_type.is_empty() || self.token_type.eq_ignore_ascii_case("bearer") {
            "Bearer"
        } else if self.token_type.eq_ignore_ascii_case("mac") {
            "MAC"
        } else if self.token_type.eq_ignore_ascii_case("basic") {
            "Basic"
        } else {
            &self.token_type
        }
    }

    /// Value of the `authorization` header
    pub fn header_value(&self) -> String {
        format!("{} {}", self.kind(), self.access_token)
    }

    /// Whether the token is past its expiry
    pub fn is_expired(&self) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= Utc::now())
    }
}

/// Provides the current token for outgoing calls
///
/// Called synchronously on every RPC, so implementations must serve from a cache.
pub trait TokenSource: Send + Sync {
    /// Current token
    fn token(&self) -> Result<Token>;
}

/// Always returns the same token
#[derive(Debug, Clone)]
pub struct StaticTokenSource(Token);

impl StaticTokenSource {
    /// Wrap a token
    pub fn new(token: Token) -> Self {
        Self(token)
    }
}

impl TokenSource for StaticTokenSource {
    fn token(&self) -> Result<Token> {
        Ok(self.0.clone())
    }
}

/// Creates token sources scoped to an audience
#[async_trait]
pub trait TokenSourceFactory: Send + Sync {
    /// Create a token source for `audience` (`scheme://host`)
    async fn token_source(&self, audience: &str) -> Result<Arc<dyn TokenSource>>;
}

/// Identity tokens from the GCE metadata server
#[derive(Debug, Clone)]
pub struct MetadataTokenSourceFactory {
    client: reqwest::Client,
    url: String,
}

impl MetadataTokenSourceFactory {
    /// Factory querying the given identity endpoint
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Factory configured from the pool settings
    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.metadata_url.clone())
    }
}

impl Default for MetadataTokenSourceFactory {
    fn default() -> Self {
        Self::from_config(&PoolConfig::default())
    }
}

#[async_trait]
impl TokenSourceFactory for MetadataTokenSourceFactory {
    async fn token_source(&self, audience: &str) -> Result<Arc<dyn TokenSource>> {
        let token = fetch_identity_token(&self.client, &self.url, audience).await?;

        let source = Arc::new(RefreshingTokenSource {
            current: RwLock::new(token.clone()),
        });

        tokio::spawn(refresh_identity_token(
            Arc::downgrade(&source),
            self.client.clone(),
            self.url.clone(),
            audience.to_string(),
            token,
        ));

        Ok(source)
    }
}

/// Token source kept up to date by a background task
struct RefreshingTokenSource {
    current: RwLock<Token>,
}

impl TokenSource for RefreshingTokenSource {
    fn token(&self) -> Result<Token> {
        let token = self
            .current
            .read()
            .map_err(|_| Error::Internal("token cache poisoned".to_string()))?
            .clone();

        if token.is_expired() {
            return Err(Error::TokenSource("identity token expired".to_string()));
        }

        Ok(token)
    }
}

/// Refresh loop. Ends once the token source has been dropped.
async fn refresh_identity_token(
    source: Weak<RefreshingTokenSource>,
    client: reqwest::Client,
    url: String,
    audience: String,
    mut token: Token,
) {
    let mut wait = refresh_delay(&token);

    loop {
        tokio::time::sleep(wait).await;

        let Some(source) = source.upgrade() else {
            tracing::debug!(audience = %audience, "Token source dropped, stopping refresh");
            return;
        };

        match fetch_identity_token(&client, &url, &audience).await {
            Ok(fresh) => {
                if let Ok(mut current) = source.current.write() {
                    *current = fresh.clone();
                }
                token = fresh;
                wait = refresh_delay(&token);
                tracing::debug!(audience = %audience, "Identity token refreshed");
            }
            Err(e) => {
                tracing::warn!(audience = %audience, error = %e, "Identity token refresh failed");
                wait = REFRESH_RETRY;
            }
        }
    }
}

fn refresh_delay(token: &Token) -> Duration {
    match token.expiry {
        Some(expiry) => (expiry - Utc::now())
            .to_std()
            .ok()
            .and_then(|remaining| remaining.checked_sub(REFRESH_MARGIN))
            .unwrap_or(REFRESH_RETRY)
            .max(REFRESH_RETRY),
        None => DEFAULT_REFRESH,
    }
}

async fn fetch_identity_token(client: &reqwest::Client, url: &str, audience: &str) -> Result<Token> {
    let response = client
        .get(url)
        .query(&[("audience", audience), ("format", "full")])
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|e| Error::TokenSource(format!("query metadata server: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::TokenSource(format!(
            "metadata server returned {} for audience {}",
            status, audience
        )));
    }

    let jwt = response
        .text()
        .await
        .map_err(|e| Error::TokenSource(format!("read identity token: {}", e)))?;
    let jwt = jwt.trim().to_string();

    let mut token = Token::new(jwt.clone());
    if let Some(expiry) = jwt_expiry(&jwt) {
        token = token.with_expiry(expiry);
    }

    Ok(token)
}

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: i64,
}

/// Read the `exp` claim of a JWT without verifying it
///
/// The token is only forwarded to its audience, which does the verification.
fn jwt_expiry(jwt: &str) -> Option<DateTime<Utc>> {
    let data = insecure_decode::<ExpiryClaim>(jwt).ok()?;
    DateTime::from_timestamp(data.claims.exp, 0)
}

/// Per-call credentials attached to every request of a connection
///
/// Rejects calls once the owning connection has been closed.
#[derive(Clone)]
pub struct CallCredentials {
    closed: Arc<AtomicBool>,
    token_source: Option<Arc<dyn TokenSource>>,
}

impl CallCredentials {
    pub(crate) fn new(closed: Arc<AtomicBool>, token_source: Option<Arc<dyn TokenSource>>) -> Self {
        Self {
            closed,
            token_source,
        }
    }

    /// Whether calls carry an identity token
    pub fn is_authenticated(&self) -> bool {
        self.token_source.is_some()
    }
}

impl fmt::Debug for CallCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallCredentials")
            .field("closed", &self.closed.load(Ordering::Acquire))
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl Interceptor for CallCredentials {
    fn call(&mut self, mut req: Request<()>) -> std::result::Result<Request<()>, Status> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::unavailable("connection closed"));
        }

        if let Some(source) = &self.token_source {
            let token = source
                .token()
                .map_err(|e| Status::unauthenticated(format!("get token: {}", e)))?;

            req.metadata_mut().insert(
                "authorization",
                token
                    .header_value()
                    .parse()
                    .map_err(|_| Status::unauthenticated("token is not a valid header value"))?,
            );
        }

        Ok(req)
    }
}

/// Everything needed to dial a target
pub struct DialOptions {
    /// Configured endpoint
    pub endpoint: Endpoint,
    /// Token source for per-call credentials, set in authenticated mode
    pub token_source: Option<Arc<dyn TokenSource>>,
}

impl fmt::Debug for DialOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialOptions")
            .field("uri", self.endpoint.uri())
            .field("authenticated", &self.token_source.is_some())
            .finish()
    }
}

/// Turns a target into dial options
pub struct CredentialResolver {
    token_sources: Arc<dyn TokenSourceFactory>,
    config: PoolConfig,
}

impl CredentialResolver {
    /// Create a resolver
    pub fn new(token_sources: Arc<dyn TokenSourceFactory>, config: PoolConfig) -> Self {
        Self {
            token_sources,
            config,
        }
    }

    /// Resolve dial options for `host:port`
    ///
    /// `certs` selects the mode: `None` dials in plaintext without any token work, `Some`
    /// dials over TLS trusting only those roots and authenticates every call with a token
    /// scoped to `protocol://host`.
    pub async fn resolve(
        &self,
        host: &str,
        port: u16,
        protocol: Protocol,
        certs: Option<&RootCertificates>,
    ) -> Result<DialOptions> {
        let host_with_port = authority(host, port);

        let Some(certs) = certs else {
            let endpoint = self.endpoint(format!("http://{}", host_with_port))?;
            return Ok(DialOptions {
                endpoint,
                token_source: None,
            });
        };

        let audience = protocol.with_addr(host);
        let token_source = self.token_sources.token_source(&audience).await?;

        let tls = ClientTlsConfig::new()
            .ca_certificate(certs.certificate())
            .domain_name(host.trim_start_matches('[').trim_end_matches(']'));

        let endpoint = self
            .endpoint(format!("https://{}", host_with_port))?
            .tls_config(tls)
            .map_err(|e| Error::Certificates(format!("configure TLS for {}: {}", host_with_port, e)))?;

        Ok(DialOptions {
            endpoint,
            token_source: Some(token_source),
        })
    }

    fn endpoint(&self, uri: String) -> Result<Endpoint> {
        let endpoint = Endpoint::from_shared(uri.clone()).map_err(|e| Error::InvalidEndpoint {
            uri,
            reason: e.to_string(),
        })?;

        Ok(endpoint
            .connect_timeout(self.config.connect_timeout())
            .timeout(self.config.request_timeout()))
    }
}

/// `host:port`, bracketing bare IPv6 literals
fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
