//! Listener wiring
//!
//! In production the gateway runs two public listeners: TLS on `https_port`
//! with a certificate chosen per SNI hostname, and plaintext on `http_port`
//! answering HTTP-01 challenges and redirecting everything else to HTTPS.
//! With `dev = true` a single plaintext listener on `dev_port` serves the
//! full gateway and no certificates are issued.

use crate::acme::{
    validate_cache_dir, AcmeIssuer, CertificateIssuer, CertificateManager, CertificateSettings,
    Http01Challenges, ACME_CHALLENGE_PREFIX,
};
use crate::admin::{AdminServer, AdminState};
use crate::body::{full, BoxError, GatewayBody};
use crate::config::Config;
use crate::error::GatewayError;
use crate::middleware::{AccessLog, AccessLogger, Pipeline, RequestContext};
use crate::proxy::{ProxyClientConfig, ReverseProxyFactory};
use crate::router::Router;
use crate::store::ConfigStore;
use anyhow::Context;
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};

/// Which listener a connection arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listener {
    /// TLS, full gateway
    Tls,
    /// Plaintext, challenges and HTTPS redirect only
    Redirect,
    /// Plaintext, full gateway
    Dev,
}

pub struct Gateway {
    config: Config,
    store: Arc<ConfigStore>,
    router: Router,
    connection: Pipeline,
    challenges: Http01Challenges,
    certificates: Option<Arc<CertificateManager>>,
}

impl Gateway {
    /// Build a gateway that obtains certificates from the configured ACME
    /// directory
    pub fn new(config: Config, store: Arc<ConfigStore>) -> anyhow::Result<Arc<Self>> {
        let cache_dir = validate_cache_dir(&config.acme.cache_dir)?;
        let challenges = Http01Challenges::new();
        let issuer = AcmeIssuer::new(
            config.acme.email.clone(),
            config.acme.directory_url.clone(),
            cache_dir,
            challenges.clone(),
        );
        Self::with_issuer(config, store, Arc::new(issuer), challenges)
    }

    /// Build a gateway around any certificate issuer. `challenges` is the
    /// table the plaintext listener answers HTTP-01 requests from.
    pub fn with_issuer(
        config: Config,
        store: Arc<ConfigStore>,
        issuer: Arc<dyn CertificateIssuer>,
        challenges: Http01Challenges,
    ) -> anyhow::Result<Arc<Self>> {
        let logger = match &config.server.access_log {
            Some(path) => {
                let logger = AccessLogger::open(path)
                    .with_context(|| format!("failed to open access log {}", path))?;
                info!(path = %path, "Access log enabled");
                logger
            }
            None => AccessLogger::disabled(),
        };

        let proxies = ReverseProxyFactory::new(ProxyClientConfig {
            request_timeout: config.server.request_timeout(),
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        })?;

        let certificates = if config.dev {
            None
        } else {
            let cache_dir = validate_cache_dir(&config.acme.cache_dir)?;
            std::fs::create_dir_all(&cache_dir).with_context(|| {
                format!("failed to create certificate cache {}", cache_dir.display())
            })?;
            Some(CertificateManager::new(
                issuer,
                Arc::clone(&store),
                CertificateSettings {
                    cache_dir,
                    renew_before: config.acme.renew_before(),
                },
            ))
        };

        let router = Router::new(Arc::clone(&store), &config.site, proxies);

        Ok(Arc::new(Self {
            config,
            store,
            router,
            connection: Pipeline::new().with(AccessLog::new(Arc::new(logger))),
            challenges,
            certificates,
        }))
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn certificates(&self) -> Option<&Arc<CertificateManager>> {
        self.certificates.as_ref()
    }

    pub fn challenges(&self) -> &Http01Challenges {
        &self.challenges
    }

    /// Bind every configured listener and serve until shutdown
    pub async fn run(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let server = &self.config.server;
        let mut handles = Vec::new();

        if self.config.dev {
            let listener = bind(&server.bind, server.dev_port).await?;
            warn!(port = server.dev_port, "Development mode: serving plaintext, no certificates");
            handles.push(tokio::spawn(
                Arc::clone(&self).serve(listener, Listener::Dev, shutdown_rx.clone()),
            ));
        } else {
            let http = bind(&server.bind, server.http_port).await?;
            let https = bind(&server.bind, server.https_port).await?;
            handles.push(tokio::spawn(
                Arc::clone(&self).serve(http, Listener::Redirect, shutdown_rx.clone()),
            ));
            handles.push(tokio::spawn(
                Arc::clone(&self).serve(https, Listener::Tls, shutdown_rx.clone()),
            ));
        }

        if let Some(certificates) = &self.certificates {
            let interval = self.config.acme.renewal_check_interval();
            tokio::spawn(Arc::clone(certificates).run_renewals(interval, shutdown_rx.clone()));
        }

        if server.admin_port > 0 {
            let listener = bind("127.0.0.1", server.admin_port).await?;
            let auth_token = server.admin_token.clone().unwrap_or_else(|| {
                let token = hex::encode(rand::random::<[u8; 16]>());
                info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
                token
            });
            let admin = AdminServer::new(
                listener.local_addr()?,
                AdminState {
                    store: Arc::clone(&self.store),
                    certificates: self.certificates.clone(),
                    auth_token: Some(auth_token),
                },
                shutdown_rx.clone(),
            );
            handles.push(tokio::spawn(admin.serve(listener)));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Listener failed"),
                Err(e) => error!(error = %e, "Listener task panicked"),
            }
        }
        Ok(())
    }

    /// Accept connections on `listener` until shutdown
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        kind: Listener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        if kind == Listener::Tls && self.certificates.is_none() {
            anyhow::bail!("TLS listener requires a certificate manager");
        }
        info!(addr = %listener.local_addr()?, listener = ?kind, "Gateway listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self);
                            tokio::spawn(async move {
                                gateway.accept(stream, addr, kind).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(listener = ?kind, "Gateway listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn accept(self: Arc<Self>, stream: TcpStream, addr: SocketAddr, kind: Listener) {
        let result = match kind {
            Listener::Tls => match self.handshake(stream).await {
                Ok(tls) => Arc::clone(&self).serve_connection(tls, addr, kind).await,
                Err(e) => {
                    debug!(addr = %addr, error = %e, "TLS handshake failed");
                    return;
                }
            },
            Listener::Redirect | Listener::Dev => {
                Arc::clone(&self).serve_connection(stream, addr, kind).await
            }
        };
        if let Err(e) = result {
            debug!(addr = %addr, error = %e, "Connection error");
        }
    }

    /// Read the ClientHello, then finish the handshake with the certificate
    /// for its SNI hostname
    async fn handshake(&self, stream: TcpStream) -> anyhow::Result<TlsStream<TcpStream>> {
        let certificates = self
            .certificates
            .as_ref()
            .context("no certificate manager")?;
        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream).await?;
        let sni = start
            .client_hello()
            .server_name()
            .map(str::to_string)
            .context("client sent no SNI hostname")?;
        let record = certificates.certificate_for(&sni).await?;
        Ok(start.into_stream(record.server_config()).await?)
    }

    async fn serve_connection<S>(
        self: Arc<Self>,
        stream: S,
        addr: SocketAddr,
        kind: Listener,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req: Request<Incoming>| {
            let gateway = Arc::clone(&self);
            async move { Ok::<_, hyper::Error>(gateway.handle(req, addr, kind).await) }
        });

        AutoBuilder::new(TokioExecutor::new())
            .http1()
            .preserve_header_case(true)
            .http2()
            .max_concurrent_streams(250)
            .serve_connection_with_upgrades(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    /// Handle one request from a listener of the given kind, access-logged
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        remote_addr: SocketAddr,
        kind: Listener,
    ) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let ctx = RequestContext::from_request(&req, remote_addr, kind == Listener::Tls);
        self.connection
            .run(&ctx, async {
                match kind {
                    Listener::Redirect => self.challenge_or_redirect(&req, &ctx).await,
                    Listener::Tls | Listener::Dev => self.router.handle(req, &ctx).await,
                }
            })
            .await
    }

    async fn challenge_or_redirect<B>(
        &self,
        req: &Request<B>,
        ctx: &RequestContext,
    ) -> Response<GatewayBody> {
        let path = req.uri().path();
        if path.starts_with(ACME_CHALLENGE_PREFIX) {
            return match self.challenges.respond(path).await {
                Some(key_auth) => {
                    debug!(path, "Responding to ACME HTTP-01 challenge");
                    let mut response = Response::new(full(key_auth));
                    response
                        .headers_mut()
                        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                    response
                }
                None => GatewayError::NotFound.into_response(),
            };
        }

        match ctx.host.as_deref() {
            Some(host) => https_redirect(host, req.uri(), self.config.server.https_port),
            None => GatewayError::MissingHost.into_response(),
        }
    }
}

async fn bind(host: &str, port: u16) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", host, port))?;
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))
}

/// Host without its port, keeping IPv6 brackets
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}

/// Build an HTTPS redirect response (301 Moved Permanently)
fn https_redirect(host: &str, uri: &Uri, https_port: u16) -> Response<GatewayBody> {
    let host = strip_port(host);
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let location = if https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, https_port, path)
    };

    let Ok(location) = HeaderValue::from_str(&location) else {
        return GatewayError::MissingHost.into_response();
    };
    let mut response = Response::new(full("Redirecting to HTTPS"));
    *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
    response.headers_mut().insert(LOCATION, location);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Run until `shutdown` resolves, then flip the shutdown channel
pub async fn run_until<F>(gateway: Arc<Gateway>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(gateway.run(shutdown_rx));
    shutdown.await;
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
    Ok(())
}
