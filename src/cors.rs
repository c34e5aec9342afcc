//! Origin allow-list and CORS header emission.

use crate::common::{ProxyBody, ResponseBuilder};
use hyper::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_HEADERS, HeaderMap, HeaderValue, ORIGIN,
    ToStrError, VARY,
};
use hyper::{Method, Response, StatusCode};
use log::debug;
use std::collections::HashSet;

pub const WILDCARD_ORIGIN: &str = "*";
pub const ALLOWED_METHODS: &str = "GET,POST,PUT,PATCH,DELETE,OPTIONS,HEAD";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginPolicy {
    allow_any: bool,
    allowed_origins: HashSet<String>,
}

/// Outcome of applying the policy to a plain (non-upgrade) request.
pub enum CorsDecision {
    /// Forward the request and add these headers to whatever response comes back.
    Forward(HeaderMap),
    /// The policy answered the request itself; do not forward.
    Respond(Response<ProxyBody>),
}

impl OriginPolicy {
    /// Builds the policy from an allow-list. A `*` entry allows every origin.
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed_origins: HashSet<String> = origins
            .into_iter()
            .map(|origin| origin.as_ref().trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();
        let allow_any = allowed_origins.contains(WILDCARD_ORIGIN);
        Self {
            allow_any,
            allowed_origins,
        }
    }

    /// Parses a comma-separated allow-list such as `ALLOWED_ORIGINS`.
    pub fn from_list(list: &str) -> Self {
        Self::new(list.split(','))
    }

    pub fn allow_any() -> Self {
        Self::new([WILDCARD_ORIGIN])
    }

    pub fn allows_any_origin(&self) -> bool {
        self.allow_any
    }

    pub fn allowed_origins(&self) -> impl Iterator<Item = &str> {
        self.allowed_origins.iter().map(String::as_str)
    }

    /// Missing origins are always allowed.
    pub fn is_origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(_) if self.allow_any => true,
            Some(origin) => self.allowed_origins.contains(origin),
        }
    }

    /// Allow/deny for upgrade requests, which get no CORS headers.
    pub fn allows_upgrade(&self, headers: &HeaderMap) -> bool {
        match origin_of(headers) {
            None => true,
            Some(Ok(origin)) => self.is_origin_allowed(Some(origin)),
            Some(Err(_)) => self.allow_any,
        }
    }

    pub fn apply(&self, method: &Method, headers: &HeaderMap) -> CorsDecision {
        let mut cors = HeaderMap::new();

        let origin = match origin_of(headers) {
            None => {
                if self.allow_any {
                    cors.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static(WILDCARD_ORIGIN));
                }
                return CorsDecision::Forward(cors);
            }
            Some(Ok(origin)) if self.is_origin_allowed(Some(origin)) => Some(origin),
            // present but not visible ASCII: only a wildcard policy lets it through
            Some(Err(_)) if self.allow_any => None,
            Some(origin) => {
                debug!("Rejecting request from origin {:?}", origin.ok());
                return CorsDecision::Respond(ResponseBuilder::origin_not_allowed());
            }
        };

        let allow_origin = match (self.allow_any, origin) {
            (true, _) => HeaderValue::from_static(WILDCARD_ORIGIN),
            (false, Some(origin)) => match HeaderValue::from_str(origin) {
                Ok(value) => value,
                Err(_) => return CorsDecision::Respond(ResponseBuilder::origin_not_allowed()),
            },
            (false, None) => return CorsDecision::Respond(ResponseBuilder::origin_not_allowed()),
        };
        cors.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
        cors.insert(VARY, HeaderValue::from_static("Origin"));
        if !self.allow_any {
            cors.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }
        if let Some(requested) = headers.get(ACCESS_CONTROL_REQUEST_HEADERS) {
            cors.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
        cors.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOWED_METHODS));

        if method == Method::OPTIONS {
            let mut response = ResponseBuilder::empty(StatusCode::NO_CONTENT);
            apply_headers(&mut response, &cors);
            return CorsDecision::Respond(response);
        }

        CorsDecision::Forward(cors)
    }
}

impl Default for OriginPolicy {
    fn default() -> Self {
        Self::allow_any()
    }
}

/// `None` when no Origin was sent, `Some(Err(_))` when one was sent but is not
/// a visible-ASCII string.
fn origin_of(headers: &HeaderMap) -> Option<Result<&str, ToStrError>> {
    headers.get(ORIGIN).map(HeaderValue::to_str)
}

/// Copies policy headers onto a response, replacing any upstream values.
/// `Vary` is merged with what the upstream sent.
pub fn apply_headers<B>(response: &mut Response<B>, cors: &HeaderMap) {
    let headers = response.headers_mut();
    for (name, value) in cors {
        if name == VARY {
            let merged = merge_vary(headers, value);
            headers.insert(VARY, merged);
        } else {
            headers.insert(name.clone(), value.clone());
        }
    }
}

fn merge_vary(headers: &HeaderMap, addition: &HeaderValue) -> HeaderValue {
    let existing: Vec<&str> = headers
        .get_all(VARY)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .collect();

    let Ok(added) = addition.to_str() else {
        return addition.clone();
    };
    if existing.is_empty() {
        return addition.clone();
    }
    if existing
        .iter()
        .any(|token| *token == "*" || token.eq_ignore_ascii_case(added))
    {
        return HeaderValue::from_str(&existing.join(", ")).unwrap_or_else(|_| addition.clone());
    }

    let mut tokens = existing;
    tokens.push(added);
    HeaderValue::from_str(&tokens.join(", ")).unwrap_or_else(|_| addition.clone())
}
