//! Operator API: health, version, config reload and certificate status.
//! Binds to loopback only.

use crate::acme::CertificateManager;
use crate::config::ConfigError;
use crate::store::{ConfigStore, ReloadOutcome};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// What the admin endpoints operate on
pub struct AdminState {
    pub store: Arc<ConfigStore>,
    /// `None` in dev mode
    pub certificates: Option<Arc<CertificateManager>>,
    /// Bearer token for reload and certificate endpoints. Without one, those
    /// endpoints are open to anything that can reach the loopback listener.
    pub auth_token: Option<String>,
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, state: AdminState, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state: Arc::new(state),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API listening");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    let state = Arc::clone(&state);
                                    async move { Ok::<_, hyper::Error>(handle_admin_request(req, &state).await) }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(TokioIo::new(stream), service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn check_auth<B>(req: &Request<B>, expected_token: Option<&str>) -> bool {
    let Some(expected_token) = expected_token else {
        return true;
    };
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token == expected_token)
        .unwrap_or(false)
}

pub async fn handle_admin_request<B>(req: Request<B>, state: &AdminState) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    match (method, path) {
        // No auth required
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::POST, "/reload") => {
            if !check_auth(&req, state.auth_token.as_deref()) {
                warn!(path, "Unauthorized admin API request");
                return response(StatusCode::UNAUTHORIZED, "unauthorized");
            }
            match state.store.reload().await {
                Ok(ReloadOutcome::Reloaded { .. }) => response(StatusCode::OK, "reloaded"),
                Ok(ReloadOutcome::Skipped) => {
                    response(StatusCode::CONFLICT, "reload already in progress")
                }
                Err(ConfigError::NoSource) => {
                    response(StatusCode::BAD_REQUEST, "no configuration file to reload from")
                }
                Err(e) => response(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    format!("reload failed, previous configuration kept: {}", e),
                ),
            }
        }

        (&Method::GET, "/certificates") => {
            if !check_auth(&req, state.auth_token.as_deref()) {
                warn!(path, "Unauthorized admin API request");
                return response(StatusCode::UNAUTHORIZED, "unauthorized");
            }
            let statuses = state
                .certificates
                .as_ref()
                .map(|manager| manager.statuses())
                .unwrap_or_default();
            let body = serde_json::json!({
                "count": statuses.len(),
                "certificates": statuses,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RoutingConfig};
    use http_body_util::{BodyExt, Empty};

    fn request(method: Method, path: &str, token: Option<&str>) -> Request<Empty<Bytes>> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Empty::new()).unwrap()
    }

    async fn body_string(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn state_with_file(file: &tempfile::NamedTempFile, token: Option<&str>) -> AdminState {
        let (_, routing) = Config::load_compiled(file.path()).unwrap();
        AdminState {
            store: Arc::new(ConfigStore::with_source(routing, file.path())),
            certificates: None,
            auth_token: token.map(String::from),
        }
    }

    fn toml_file(content: &str) -> tempfile::NamedTempFile {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        std::fs::write(file.path(), content).unwrap();
        file
    }

    #[tokio::test]
    async fn test_health_and_version_need_no_auth() {
        let state = AdminState {
            store: Arc::new(ConfigStore::new(RoutingConfig::default())),
            certificates: None,
            auth_token: Some("secret".to_string()),
        };

        let resp = handle_admin_request(request(Method::GET, "/health", None), &state).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "ok");

        let resp = handle_admin_request(request(Method::GET, "/version", None), &state).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["version"], VERSION);
    }

    #[tokio::test]
    async fn test_reload_requires_token() {
        let file = toml_file("[[subdomains]]\nhost = \"a.example.com\"\n");
        let state = state_with_file(&file, Some("secret"));

        let resp = handle_admin_request(request(Method::POST, "/reload", None), &state).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = handle_admin_request(request(Method::POST, "/reload", Some("wrong")), &state).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_reload_swaps_config() {
        let file = toml_file("[[subdomains]]\nhost = \"a.example.com\"\n");
        let state = state_with_file(&file, Some("secret"));

        std::fs::write(
            file.path(),
            "[[subdomains]]\nhost = \"a.example.com\"\n[[subdomains]]\nhost = \"b.example.com\"\n",
        )
        .unwrap();
        let resp = handle_admin_request(request(Method::POST, "/reload", Some("secret")), &state).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "reloaded");
        assert!(state.store.snapshot().allows_certificate("b.example.com"));
    }

    #[tokio::test]
    async fn test_failed_reload_reports_error() {
        let file = toml_file("[[subdomains]]\nhost = \"a.example.com\"\n");
        let state = state_with_file(&file, None);

        std::fs::write(file.path(), "[[users]]\nname = \"bob\"\npassword_hash = \"x\"\n").unwrap();
        let resp = handle_admin_request(request(Method::POST, "/reload", None), &state).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_string(resp).await.contains("password_hash"));
        assert!(state.store.snapshot().allows_certificate("a.example.com"));
    }

    #[tokio::test]
    async fn test_certificates_without_manager() {
        let state = AdminState {
            store: Arc::new(ConfigStore::new(RoutingConfig::default())),
            certificates: None,
            auth_token: None,
        };
        let resp = handle_admin_request(request(Method::GET, "/certificates", None), &state).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["count"], 0);
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let state = AdminState {
            store: Arc::new(ConfigStore::new(RoutingConfig::default())),
            certificates: None,
            auth_token: None,
        };
        let resp = handle_admin_request(request(Method::GET, "/nope", None), &state).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
