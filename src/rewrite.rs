//! URL rewriting: `https://api.example.com/x` becomes
//! `{protocol}://{host}[:{port}]/https://api.example.com/x` unless a bypass rule
//! says the call should go out directly.

use crate::bypass::BypassMatcher;
use crate::settings::{ProxySettings, DEFAULT_PROTOCOL};
use log::warn;
use url::Url;

/// Builds the proxy prefix, always ending in `/`. `None` when no host is set.
pub fn proxy_base(settings: &ProxySettings) -> Option<String> {
    let host = settings.host.trim();
    if host.is_empty() {
        return None;
    }
    let host = host.strip_suffix('/').unwrap_or(host);
    let protocol = if settings.protocol.is_empty() {
        DEFAULT_PROTOCOL
    } else {
        settings.protocol.as_str()
    };
    let port = if settings.port.is_empty() {
        String::new()
    } else {
        format!(":{}", settings.port)
    };
    Some(format!("{}://{}{}/", protocol, host, port))
}

/// Resolves `input` against `location`. Unresolvable input is returned as given.
pub fn to_absolute_url(input: &str, location: Option<&Url>) -> String {
    let resolved = match location {
        Some(base) => base.join(input),
        None => Url::parse(input),
    };
    match resolved {
        Ok(url) => url.to_string(),
        Err(e) => {
            warn!("[path-proxy] Unable to resolve request URL '{}': {}", input, e);
            input.to_string()
        }
    }
}

/// Rewrites one URL, compiling the settings' bypass list for this call.
pub fn rewrite_url(url: &str, settings: &ProxySettings, location: Option<&Url>) -> String {
    if !settings.is_enabled() {
        return url.to_string();
    }
    let bypass = BypassMatcher::new(&settings.bypass_list);
    rewrite_with(url, settings, &bypass, location)
}

/// Rewrites one URL with an already compiled bypass list.
pub fn rewrite_with(
    url: &str,
    settings: &ProxySettings,
    bypass: &BypassMatcher,
    location: Option<&Url>,
) -> String {
    let Some(base) = proxy_base(settings) else {
        return url.to_string();
    };

    // URL parsing may normalise the proxy's own prefix (host case, default
    // port), so check the raw form before resolving.
    if url.starts_with(&base) {
        return url.to_string();
    }

    let absolute = to_absolute_url(url, location);

    if bypass.should_bypass(&absolute, Some(&base)) {
        return absolute;
    }

    format!("{}{}", base, absolute)
}
