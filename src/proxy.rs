//! Per-host reverse proxy
//!
//! A [`ReverseProxyFactory`] owns one pooled outbound client and hands out
//! cheap [`ProxyHandler`]s, one per proxied virtual host. Handlers stream the
//! origin's response back without buffering it. Dropping the handler future
//! (client went away) drops the outbound request with it.

use crate::body::{boxed, BoxError, GatewayBody};
use crate::config::{Origin, SubdomainRule};
use crate::error::GatewayError;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that only describe one hop and are never forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

type OriginClient = Client<HttpsConnector<HttpConnector>, GatewayBody>;

/// Outbound client settings
#[derive(Debug, Clone)]
pub struct ProxyClientConfig {
    /// Time allowed for the origin to send response headers
    pub request_timeout: Duration,
    /// Maximum idle connections per origin
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for ProxyClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A proxied virtual host and where its traffic goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    pub match_host: String,
    pub origin_scheme: String,
    pub origin_host: String,
    /// Path prefix of the origin URL, empty for `/`
    pub origin_path: String,
}

impl ProxyRoute {
    pub fn new(match_host: impl Into<String>, origin: &Origin) -> Self {
        Self {
            match_host: match_host.into(),
            origin_scheme: origin.scheme.clone(),
            origin_host: origin.authority.clone(),
            origin_path: origin.base_path.clone(),
        }
    }

    /// `None` for hosts served locally
    pub fn from_rule(rule: &SubdomainRule) -> Option<Self> {
        rule.origin.as_ref().map(|origin| Self::new(&rule.host, origin))
    }

    /// The origin URI for `original`, with the origin's path prefix joined on
    fn target_uri(&self, original: &Uri) -> Result<Uri, GatewayError> {
        let path = original.path();
        let path = if path.starts_with('/') { path } else { "/" };
        let query = original.query().map(|q| format!("?{}", q)).unwrap_or_default();
        format!(
            "{}://{}{}{}{}",
            self.origin_scheme, self.origin_host, self.origin_path, path, query
        )
        .parse()
            .map_err(|e| GatewayError::Internal(format!("invalid origin URI: {}", e)))
    }
}

/// Builds forwarding handlers that share one connection pool
pub struct ReverseProxyFactory {
    client: OriginClient,
    request_timeout: Duration,
}

impl ReverseProxyFactory {
    pub fn new(config: ProxyClientConfig) -> anyhow::Result<Self> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            request_timeout_secs = config.request_timeout.as_secs(),
            "Origin client initialized"
        );

        Ok(Self {
            client,
            request_timeout: config.request_timeout,
        })
    }

    pub fn build(&self, route: ProxyRoute) -> ProxyHandler {
        ProxyHandler {
            route: Arc::new(route),
            client: self.client.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

/// Forwards requests for one virtual host to its origin
#[derive(Clone)]
pub struct ProxyHandler {
    route: Arc<ProxyRoute>,
    client: OriginClient,
    request_timeout: Duration,
}

impl std::fmt::Debug for ProxyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandler")
            .field("route", &self.route)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl ProxyHandler {
    pub fn route(&self) -> &ProxyRoute {
        &self.route
    }

    /// Forward `req` and return the origin's response, or a 502/504
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        match self.try_forward(req, client_addr, is_tls).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }

    async fn try_forward<B>(
        &self,
        mut req: Request<B>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Result<Response<GatewayBody>, GatewayError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let host = &self.route.match_host;
        let upgrade = upgrade_type(req.headers());
        let client_upgrade: Option<OnUpgrade> =
            upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));

        let outbound = self.prepare_request(req, client_addr, is_tls, upgrade.as_ref())?;
        debug!(
            host = %host,
            method = %outbound.method(),
            uri = %outbound.uri(),
            upgrade = upgrade.as_ref().and_then(|v| v.to_str().ok()),
            "Forwarding request"
        );

        let result = tokio::time::timeout(self.request_timeout, self.client.request(outbound)).await;
        let mut response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(host = %host, origin = %self.route.origin_host, error = %e, "Failed to reach origin");
                return Err(GatewayError::OriginUnreachable(e.to_string()));
            }
            Err(_) => {
                warn!(
                    host = %host,
                    origin = %self.route.origin_host,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Origin timed out"
                );
                return Err(GatewayError::OriginTimeout(self.request_timeout.as_secs()));
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            match client_upgrade {
                Some(client_side) => {
                    let origin_side = hyper::upgrade::on(&mut response);
                    tokio::spawn(splice(client_side, origin_side, host.clone()));
                }
                None => {
                    warn!(host = %host, "Origin switched protocols without an upgrade request");
                    return Err(GatewayError::OriginUnreachable(
                        "unexpected 101 response".to_string(),
                    ));
                }
            }
        } else {
            strip_hop_by_hop(response.headers_mut());
        }

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, boxed(body)))
    }

    fn prepare_request<B>(
        &self,
        req: Request<B>,
        client_addr: SocketAddr,
        is_tls: bool,
        upgrade: Option<&HeaderValue>,
    ) -> Result<Request<GatewayBody>, GatewayError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let (mut parts, body) = req.into_parts();

        // HTTP/2 requests carry the host in the URI authority
        let inbound_host = parts
            .headers
            .get(HOST)
            .cloned()
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            })
            .ok_or(GatewayError::MissingHost)?;

        parts.uri = self.route.target_uri(&parts.uri)?;
        parts.version = Version::HTTP_11;

        let headers = &mut parts.headers;
        strip_hop_by_hop(headers);
        if let Some(protocol) = upgrade {
            headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(UPGRADE, protocol.clone());
        }

        let origin_host = HeaderValue::from_str(&self.route.origin_host)
            .map_err(|e| GatewayError::Internal(format!("invalid origin host: {}", e)))?;
        headers.insert(HOST, origin_host);

        // Overwrite rather than append: this gateway is the first trusted hop
        headers.insert(X_FORWARDED_HOST, inbound_host);
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        let proto = if is_tls { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

        Ok(Request::from_parts(parts, boxed(body)))
    }
}

/// Value of the Upgrade header when the request asks for a protocol switch
fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Copy bytes both ways between the upgraded client and origin connections
async fn splice(client: OnUpgrade, origin: OnUpgrade, host: String) {
    let (client, origin) = match tokio::try_join!(client, origin) {
        Ok(pair) => pair,
        Err(e) => {
            debug!(host = %host, error = %e, "Upgrade did not complete");
            return;
        }
    };

    let mut client_io = TokioIo::new(client);
    let mut origin_io = TokioIo::new(origin);
    match tokio::io::copy_bidirectional(&mut client_io, &mut origin_io).await {
        Ok((client_to_origin, origin_to_client)) => {
            debug!(host = %host, client_to_origin, origin_to_client, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(host = %host, error = %e, "Upgraded connection closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{empty, full};
    use http_body_util::BodyExt;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn route(origin: &str) -> ProxyRoute {
        ProxyRoute::new("api.example.com", &Origin::parse(origin).unwrap())
    }

    fn factory(timeout: Duration) -> ReverseProxyFactory {
        ReverseProxyFactory::new(ProxyClientConfig {
            request_timeout: timeout,
            ..Default::default()
        })
        .unwrap()
    }

    fn client_addr() -> SocketAddr {
        "198.51.100.7:40000".parse().unwrap()
    }

    /// Origin that answers with `status` and echoes selected request headers
    async fn spawn_origin(status: StatusCode) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| async move {
                        let mut response = Response::new(full(format!("origin saw {}", req.uri())));
                        *response.status_mut() = status;
                        for name in ["host", "x-forwarded-host", "x-forwarded-for", "x-forwarded-proto"] {
                            if let Some(value) = req.headers().get(name) {
                                let echoed = format!("x-echo-{}", name);
                                response.headers_mut().insert(
                                    HeaderName::from_bytes(echoed.as_bytes()).unwrap(),
                                    value.clone(),
                                );
                            }
                        }
                        response
                            .headers_mut()
                            .insert("keep-alive", HeaderValue::from_static("timeout=5"));
                        Ok::<_, hyper::Error>(response)
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    fn inbound(path: &str) -> Request<GatewayBody> {
        Request::builder()
            .uri(path)
            .header(HOST, "api.example.com")
            .header(X_FORWARDED_FOR, "10.0.0.1")
            .header("proxy-authorization", "Basic Zm9v")
            .body(empty())
            .unwrap()
    }

    #[test]
    fn test_route_from_rule() {
        let local = SubdomainRule {
            host: "www.example.com".to_string(),
            origin: None,
        };
        assert!(ProxyRoute::from_rule(&local).is_none());

        let proxied = SubdomainRule {
            host: "api.example.com".to_string(),
            origin: Some(Origin::parse("https://backend.internal:8443").unwrap()),
        };
        let route = ProxyRoute::from_rule(&proxied).unwrap();
        assert_eq!(route.match_host, "api.example.com");
        assert_eq!(route.origin_scheme, "https");
        assert_eq!(route.origin_host, "backend.internal:8443");
        assert_eq!(route.origin_path, "");
    }

    #[test]
    fn test_target_uri_joins_origin_path() {
        let plain = route("http://127.0.0.1:3000");
        assert_eq!(
            plain.target_uri(&"/x?y=1".parse().unwrap()).unwrap(),
            "http://127.0.0.1:3000/x?y=1"
        );

        let prefixed = route("http://127.0.0.1:3000/app/");
        assert_eq!(prefixed.origin_path, "/app");
        assert_eq!(
            prefixed.target_uri(&"/users?page=2".parse().unwrap()).unwrap(),
            "http://127.0.0.1:3000/app/users?page=2"
        );
        assert_eq!(
            prefixed.target_uri(&"/".parse().unwrap()).unwrap(),
            "http://127.0.0.1:3000/app/"
        );
    }

    #[tokio::test]
    async fn test_prepare_request_rewrites_headers() {
        let handler = factory(Duration::from_secs(5)).build(route("http://127.0.0.1:3000"));
        let mut req = inbound("/x?y=1");
        req.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        req.headers_mut()
            .insert("x-private", HeaderValue::from_static("secret"));

        let out = handler.prepare_request(req, client_addr(), true, None).unwrap();
        assert_eq!(out.uri(), "http://127.0.0.1:3000/x?y=1");
        assert_eq!(out.headers()[HOST], "127.0.0.1:3000");
        assert_eq!(out.headers()[X_FORWARDED_HOST], "api.example.com");
        assert_eq!(out.headers()[X_FORWARDED_FOR], "198.51.100.7");
        assert_eq!(out.headers()[X_FORWARDED_PROTO], "https");
        assert!(!out.headers().contains_key("proxy-authorization"));
        assert!(!out.headers().contains_key("x-private"));
        assert!(!out.headers().contains_key(CONNECTION));
    }

    #[tokio::test]
    async fn test_prepare_request_keeps_upgrade() {
        let handler = factory(Duration::from_secs(5)).build(route("http://127.0.0.1:3000"));
        let mut req = inbound("/ws");
        req.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        req.headers_mut()
            .insert(UPGRADE, HeaderValue::from_static("websocket"));

        let upgrade = upgrade_type(req.headers());
        assert_eq!(upgrade.as_ref().unwrap(), "websocket");
        let out = handler
            .prepare_request(req, client_addr(), false, upgrade.as_ref())
            .unwrap();
        assert_eq!(out.headers()[CONNECTION], "upgrade");
        assert_eq!(out.headers()[UPGRADE], "websocket");
    }

    #[tokio::test]
    async fn test_forwards_and_relays_status() {
        let origin = spawn_origin(StatusCode::SERVICE_UNAVAILABLE).await;
        let handler = factory(Duration::from_secs(5)).build(route(&format!("http://{}", origin)));

        let response = handler.forward(inbound("/x"), client_addr(), false).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["x-echo-x-forwarded-host"], "api.example.com");
        assert_eq!(response.headers()["x-echo-x-forwarded-for"], "198.51.100.7");
        assert_eq!(response.headers()["x-echo-x-forwarded-proto"], "http");
        assert_eq!(response.headers()["x-echo-host"], origin.to_string().as_str());
        assert!(!response.headers().contains_key("keep-alive"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"origin saw /x");
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let handler = factory(Duration::from_secs(5)).build(route(&format!("http://{}", addr)));
        let response = handler.forward(inbound("/"), client_addr(), false).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()["x-gateway-error"], "ORIGIN_UNREACHABLE");
    }

    #[tokio::test]
    async fn test_silent_origin_is_gateway_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let handler =
            factory(Duration::from_millis(200)).build(route(&format!("http://{}", addr)));
        let response = handler.forward(inbound("/"), client_addr(), false).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_client_going_away_closes_origin_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut head = Vec::new();
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let _ = received_tx.send(());
            // Never answer; wait for the gateway side to hang up
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
            let _ = closed_tx.send(());
        });

        let handler = factory(Duration::from_secs(30)).build(route(&format!("http://{}", addr)));
        let forward = tokio::spawn(async move {
            handler.forward(inbound("/slow"), client_addr(), false).await
        });

        tokio::time::timeout(Duration::from_secs(5), received_rx)
            .await
            .expect("origin never saw the request")
            .unwrap();
        forward.abort();

        tokio::time::timeout(Duration::from_secs(5), closed_rx)
            .await
            .expect("origin connection stayed open")
            .unwrap();
    }
}
