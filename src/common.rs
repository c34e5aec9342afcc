use crate::error::ProxyError;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::header::{CONNECTION, CONTENT_TYPE, HeaderMap, HeaderValue, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use log::warn;

/// Response body used by the server: either a locally built body or the
/// upstream's streamed body.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub type HttpsClient<B> = Client<HttpsConnector<HttpConnector>, B>;

/// Hop-by-hop headers that never cross the proxy.
pub const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Common response builders for locally generated responses
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Plain-text response with the given status
    pub fn text(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
        let mut response = Response::new(full_body(message.into()));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        response
    }

    /// Empty response with the given status
    pub fn empty(status: StatusCode) -> Response<ProxyBody> {
        let mut response = Response::new(empty_body());
        *response.status_mut() = status;
        response
    }

    pub fn invalid_target() -> Response<ProxyBody> {
        Self::text(
            StatusCode::BAD_REQUEST,
            "Invalid proxy request. Use /https://example.com/path format.",
        )
    }

    pub fn origin_not_allowed() -> Response<ProxyBody> {
        Self::text(StatusCode::FORBIDDEN, "Origin not allowed")
    }

    pub fn proxy_error(message: &str) -> Response<ProxyBody> {
        Self::text(StatusCode::BAD_GATEWAY, format!("Proxy error: {}", message))
    }

    /// Bare status line for a connection that asked to upgrade: no body, no CORS
    /// headers, and the connection is closed once it is written.
    pub fn upgrade_rejection(status: StatusCode) -> Response<ProxyBody> {
        let mut response = Self::empty(status);
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
        response
    }
}

/// True for `Connection: upgrade` + `Upgrade: <protocol>` requests.
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_connection_upgrade = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")));
    has_connection_upgrade && req.headers().contains_key(UPGRADE)
}

/// Removes hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Builds the HTTPS-capable upstream client.
///
/// With `reject_unauthorized = false` upstream certificates and host names are
/// not verified.
pub fn build_https_client<B>(reject_unauthorized: bool) -> Result<HttpsClient<B>, ProxyError>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
{
    let mut http = HttpConnector::new();
    http.enforce_http(false);

    let mut tls = native_tls::TlsConnector::builder();
    if !reject_unauthorized {
        warn!("Upstream TLS certificate verification is disabled");
        tls.danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    let tls = tls
        .build()
        .map_err(|e| ProxyError::Tls(format!("Failed to build upstream TLS connector: {}", e)))?;

    let https = HttpsConnector::from((http, tokio_native_tls::TlsConnector::from(tls)));
    Ok(Client::builder(TokioExecutor::new()).build(https))
}
