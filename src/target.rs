//! Decoding of the destination URL carried in a proxied request's path.

use crate::error::ProxyError;
use percent_encoding::percent_decode_str;
use std::fmt;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl TargetScheme {
    const PREFIXES: [(&'static str, TargetScheme); 4] = [
        ("http://", TargetScheme::Http),
        ("https://", TargetScheme::Https),
        ("ws://", TargetScheme::Ws),
        ("wss://", TargetScheme::Wss),
    ];

    fn from_prefix(candidate: &str) -> Option<Self> {
        Self::PREFIXES.iter().find_map(|(prefix, scheme)| {
            candidate
                .get(..prefix.len())
                .filter(|head| head.eq_ignore_ascii_case(prefix))
                .map(|_| *scheme)
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetScheme::Http => "http",
            TargetScheme::Https => "https",
            TargetScheme::Ws => "ws",
            TargetScheme::Wss => "wss",
        }
    }

    /// The scheme used to open the upstream HTTP connection.
    pub fn transport_scheme(&self) -> &'static str {
        match self {
            TargetScheme::Http | TargetScheme::Ws => "http",
            TargetScheme::Https | TargetScheme::Wss => "https",
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, TargetScheme::Ws | TargetScheme::Wss)
    }
}

impl fmt::Display for TargetScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRequest {
    pub scheme: TargetScheme,
    pub url: Url,
}

impl TargetRequest {
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// The target with `ws`/`wss` replaced by `http`/`https`, ready for an HTTP client.
    pub fn transport_uri(&self) -> Result<hyper::Uri, ProxyError> {
        let mut url = self.url.clone();
        if self.scheme.is_websocket() {
            url.set_scheme(self.scheme.transport_scheme())
                .map_err(|_| ProxyError::InvalidTarget(self.url.to_string()))?;
        }
        Ok(url.as_str().parse::<hyper::Uri>()?)
    }
}

impl fmt::Display for TargetRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Decodes `/<url>` or `/<percent-encoded url>` into the target URL.
pub fn resolve_target(path_and_query: &str) -> Result<TargetRequest, ProxyError> {
    if path_and_query.is_empty() || path_and_query == "/" {
        return Err(ProxyError::InvalidTarget("missing target URL".to_string()));
    }

    let trimmed = path_and_query.strip_prefix('/').unwrap_or(path_and_query);

    let decoded = if has_valid_escapes(trimmed) {
        match percent_decode_str(trimmed).decode_utf8() {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => trimmed.to_string(),
        }
    } else {
        trimmed.to_string()
    };

    let scheme = TargetScheme::from_prefix(&decoded).ok_or_else(|| {
        ProxyError::InvalidTarget(format!("unsupported target scheme in '{}'", decoded))
    })?;

    let url = Url::parse(&decoded)
        .map_err(|e| ProxyError::InvalidTarget(format!("'{}': {}", decoded, e)))?;

    Ok(TargetRequest { scheme, url })
}

/// Every `%` must start a two-hex-digit escape; otherwise the text is left undecoded.
fn has_valid_escapes(text: &str) -> bool {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes
                .get(i + 1..i + 3)
                .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
            if !valid {
                return false;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_target() {
        let target = resolve_target("/https%3A%2F%2Fexample.com%2Fpath%3Fa%3D1").unwrap();
        assert_eq!(target.as_str(), "https://example.com/path?a=1");
        assert_eq!(target.scheme, TargetScheme::Https);
    }

    #[test]
    fn test_raw_target() {
        let target = resolve_target("/http://upstream.local:8080/api?x=1&y=2").unwrap();
        assert_eq!(target.as_str(), "http://upstream.local:8080/api?x=1&y=2");
    }

    #[test]
    fn test_websocket_targets() {
        let target = resolve_target("/ws://example.com/socket").unwrap();
        assert_eq!(target.as_str(), "ws://example.com/socket");
        assert_eq!(target.transport_uri().unwrap().to_string(), "http://example.com/socket");

        let target = resolve_target("/wss://secure.example.com/chat").unwrap();
        assert_eq!(target.as_str(), "wss://secure.example.com/chat");
        assert_eq!(target.transport_uri().unwrap().scheme_str(), Some("https"));
    }

    #[test]
    fn test_scheme_check_is_case_insensitive() {
        let target = resolve_target("/HTTPS://Example.com/A").unwrap();
        assert_eq!(target.as_str(), "https://example.com/A");
    }

    #[test]
    fn test_invalid_targets() {
        assert!(resolve_target("/ftp://example.com").is_err());
        assert!(resolve_target("/").is_err());
        assert!(resolve_target("").is_err());
        assert!(resolve_target("/example.com/path").is_err());
        assert!(resolve_target("/http://").is_err());
    }

    #[test]
    fn test_undecodable_path_falls_back_to_raw() {
        // %FF is not valid UTF-8 once decoded, so the raw text is parsed instead
        let target = resolve_target("/https://example.com/a%FF").unwrap();
        assert_eq!(target.as_str(), "https://example.com/a%FF");

        // malformed escapes leave the whole path undecoded
        assert!(resolve_target("/https%3A%2F%2Fexample.com%2F%ZZ").is_err());
        assert!(resolve_target("/https%3A%2F%2Fexample.com%2F%E0%A4%A").is_err());
        assert!(resolve_target("/https%3A%2F%2Fexample.com%2F%").is_err());
    }
}
