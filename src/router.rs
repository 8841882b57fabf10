//! Host and path dispatch
//!
//! Precedence, first match wins:
//! 1. proxied virtual host
//! 2. `/secured/...` through the access gate
//! 3. `/shared/...` public files
//! 4. site root with security headers

use crate::body::{BoxError, GatewayBody};
use crate::config::{RoutingConfig, SiteConfig};
use crate::error::GatewayError;
use crate::files::{html_response, redirect, SanitizedPath, StaticFiles};
use crate::gate::{AccessGate, Credentials, Decision};
use crate::middleware::{CacheAndCompression, Pipeline, RequestContext, SecurityHeaders};
use crate::proxy::{ProxyRoute, ReverseProxyFactory};
use crate::store::ConfigStore;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use tracing::debug;

const SECURED_PREFIX: &str = "secured";
const SHARED_PREFIX: &str = "shared";

/// Where a request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Proxy(ProxyRoute),
    /// `/secured` without the trailing slash
    SecuredRoot,
    /// Path relative to the secured tree
    Secured(SanitizedPath),
    /// Path relative to the shared tree
    Shared(SanitizedPath),
    /// Path relative to the site root
    Site(SanitizedPath),
    /// The path could not be sanitized
    Rejected,
}

impl Route {
    /// Pick the route for `host` and the raw URI `path`. Proxied hosts win
    /// over every local path.
    pub fn resolve(routing: &RoutingConfig, host: Option<&str>, path: &str) -> Self {
        if let Some(route) = host
            .and_then(|h| routing.subdomain(h))
            .and_then(ProxyRoute::from_rule)
        {
            return Route::Proxy(route);
        }

        let Some(path) = SanitizedPath::parse(path) else {
            return Route::Rejected;
        };

        if let Some(rest) = path.strip_prefix(SECURED_PREFIX) {
            if rest.is_empty() && !rest.trailing_slash {
                return Route::SecuredRoot;
            }
            return Route::Secured(rest);
        }
        if let Some(rest) = path.strip_prefix(SHARED_PREFIX) {
            return Route::Shared(rest);
        }
        Route::Site(path)
    }
}

pub struct Router {
    store: Arc<ConfigStore>,
    proxies: ReverseProxyFactory,
    site: StaticFiles,
    shared: StaticFiles,
    secured: StaticFiles,
    gate: AccessGate,
    site_pipeline: Pipeline,
    file_pipeline: Pipeline,
}

impl Router {
    pub fn new(store: Arc<ConfigStore>, site: &SiteConfig, proxies: ReverseProxyFactory) -> Self {
        let cache = Arc::new(CacheAndCompression::new());
        Self {
            store,
            proxies,
            site: StaticFiles::new(&site.static_dir),
            shared: StaticFiles::new(&site.shared_dir),
            secured: StaticFiles::new(&site.secured_dir),
            gate: AccessGate::new(&site.secured_dir, format!("/{}", SECURED_PREFIX)),
            site_pipeline: Pipeline::new()
                .with(SecurityHeaders::new())
                .with_shared(cache.clone()),
            file_pipeline: Pipeline::new().with_shared(cache),
        }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Dispatch one request against the snapshot current at request start
    pub async fn handle<B>(&self, req: Request<B>, ctx: &RequestContext) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let routing = self.store.snapshot();
        let route = Route::resolve(&routing, ctx.host.as_deref(), req.uri().path());
        debug!(host = ?ctx.host, path = %req.uri().path(), ?route, "Routing request");

        let method = &ctx.method;
        let uri_path = req.uri().path().to_string();

        match route {
            Route::Proxy(route) => {
                self.proxies
                    .build(route)
                    .forward(req, ctx.remote_addr, ctx.is_tls)
                    .await
            }
            Route::SecuredRoot => redirect(&format!("/{}/", SECURED_PREFIX)),
            Route::Secured(path) => {
                let credentials = Credentials::from_headers(req.headers());
                self.serve_secured(&routing, credentials.as_ref(), ctx, &path, &uri_path)
                    .await
            }
            Route::Shared(path) => {
                self.file_pipeline
                    .run(ctx, async {
                        self.shared
                            .serve(method, &path, &uri_path)
                            .await
                            .unwrap_or_else(GatewayError::into_response)
                    })
                    .await
            }
            Route::Site(path) => {
                self.site_pipeline
                    .run(ctx, async {
                        self.site
                            .serve(method, &path, &uri_path)
                            .await
                            .unwrap_or_else(GatewayError::into_response)
                    })
                    .await
            }
            Route::Rejected => {
                self.site_pipeline
                    .run(ctx, async { GatewayError::NotFound.into_response() })
                    .await
            }
        }
    }

    /// Only matched files get cache headers. The 401 challenge and the
    /// per-user listing are rebuilt on every request.
    async fn serve_secured(
        &self,
        routing: &RoutingConfig,
        credentials: Option<&Credentials>,
        ctx: &RequestContext,
        path: &SanitizedPath,
        uri_path: &str,
    ) -> Response<GatewayBody> {
        let method = &ctx.method;
        if method != Method::GET && method != Method::HEAD {
            return GatewayError::MethodNotAllowed.into_response();
        }

        match self.gate.authorize(routing, credentials, path) {
            Decision::Forbidden => GatewayError::Unauthorized.into_response(),
            Decision::FileMatch { attachment, .. } => {
                self.file_pipeline
                    .run(ctx, async {
                        match self.secured.serve(method, path, uri_path).await {
                            Ok(mut response) => {
                                if attachment && response.status() == StatusCode::OK {
                                    force_download(&mut response, path);
                                }
                                response
                            }
                            Err(e) => e.into_response(),
                        }
                    })
                    .await
            }
            Decision::DirectoryListing { entries, .. } => {
                let mut response = html_response(method, self.gate.render_listing(&entries));
                response
                    .headers_mut()
                    .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
                response
            }
        }
    }
}

fn force_download(response: &mut Response<GatewayBody>, path: &SanitizedPath) {
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    let filename = path
        .relative
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .replace(['"', '\\'], "_");
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
        .unwrap_or(HeaderValue::from_static("attachment"));
    headers.insert(CONTENT_DISPOSITION, disposition);
}
