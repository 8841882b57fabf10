use super::{RequestContext, Stage};
use crate::body::GatewayBody;
use async_trait::async_trait;
use hyper::header::{
    HeaderName, HeaderValue, CONTENT_SECURITY_POLICY, REFERRER_POLICY, STRICT_TRANSPORT_SECURITY,
    X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS, X_XSS_PROTECTION,
};
use hyper::Response;

const PERMISSIONS_POLICY: &str = "accelerometer=(), autoplay=(), camera=(), clipboard-read=(), \
    clipboard-write=(), geolocation=(), gyroscope=(), magnetometer=(), microphone=(), payment=(), usb=()";

const CONTENT_SECURITY: &str = "default-src 'self'; script-src 'self'; \
    style-src 'self' 'unsafe-inline'; img-src 'self' data:; font-src 'self'; connect-src 'self'; \
    frame-ancestors 'none'; base-uri 'none'; form-action 'self'";

const HSTS: &str = "max-age=31536000; includeSubDomains; preload";

/// Fixed browser-hardening headers. HSTS is only sent over TLS.
#[derive(Debug, Clone, Default)]
pub struct SecurityHeaders;

impl SecurityHeaders {
    pub fn new() -> Self {
        Self
    }

    fn fixed_headers() -> [(HeaderName, HeaderValue); 10] {
        [
            (X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff")),
            (X_FRAME_OPTIONS, HeaderValue::from_static("DENY")),
            (
                HeaderName::from_static("cross-origin-embedder-policy"),
                HeaderValue::from_static("require-corp; report-to=\"default\""),
            ),
            (
                HeaderName::from_static("cross-origin-opener-policy"),
                HeaderValue::from_static("same-origin; report-to=\"default\""),
            ),
            (
                HeaderName::from_static("cross-origin-resource-policy"),
                HeaderValue::from_static("same-site"),
            ),
            (REFERRER_POLICY, HeaderValue::from_static("strict-origin")),
            // ignored by modern browsers
            (X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block")),
            (
                HeaderName::from_static("permissions-policy"),
                HeaderValue::from_static(PERMISSIONS_POLICY),
            ),
            (CONTENT_SECURITY_POLICY, HeaderValue::from_static(CONTENT_SECURITY)),
            (
                HeaderName::from_static("x-permitted-cross-domain-policies"),
                HeaderValue::from_static("none"),
            ),
        ]
    }
}

#[async_trait]
impl Stage for SecurityHeaders {
    fn name(&self) -> &'static str {
        "security-headers"
    }

    async fn apply(
        &self,
        ctx: &RequestContext,
        mut response: Response<GatewayBody>,
    ) -> Response<GatewayBody> {
        let headers = response.headers_mut();
        for (name, value) in Self::fixed_headers() {
            headers.insert(name, value);
        }
        if ctx.is_tls {
            headers.insert(STRICT_TRANSPORT_SECURITY, HeaderValue::from_static(HSTS));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, ok};
    use super::*;
    use hyper::Method;

    #[tokio::test]
    async fn test_sets_fixed_headers() {
        let ctx = context(Method::GET, "/");
        let response = SecurityHeaders::new().apply(&ctx, ok("x")).await;
        let headers = response.headers();
        assert_eq!(headers.get(X_CONTENT_TYPE_OPTIONS).unwrap(), "nosniff");
        assert_eq!(headers.get(X_FRAME_OPTIONS).unwrap(), "DENY");
        assert_eq!(headers.get(REFERRER_POLICY).unwrap(), "strict-origin");
        assert!(headers
            .get(CONTENT_SECURITY_POLICY)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("default-src 'self'"));
        assert!(headers.contains_key("permissions-policy"));
        assert!(headers.contains_key("cross-origin-opener-policy"));
        assert!(!headers.contains_key(STRICT_TRANSPORT_SECURITY));
    }

    #[tokio::test]
    async fn test_hsts_only_over_tls() {
        let mut ctx = context(Method::GET, "/");
        ctx.is_tls = true;
        let response = SecurityHeaders::new().apply(&ctx, ok("x")).await;
        assert_eq!(response.headers().get(STRICT_TRANSPORT_SECURITY).unwrap(), HSTS);
    }
}
