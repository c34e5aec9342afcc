//! Bypass pattern compilation.
//!
//! A raw pattern is classified into exactly one [`BypassPattern`] kind, checked
//! in a fixed priority order:
//!
//! 1. `/body/flags` - a regular expression tested against the full URL
//! 2. anything containing `://` - case-insensitive prefix of the full URL
//! 3. anything containing `*` - host glob matched against `hostname` or `host:port`
//! 4. anything containing `/` - case-insensitive substring of the full URL
//! 5. anything containing `:` - exact `host:port`
//! 6. everything else - hostname or any of its subdomains
//!
//! Once a pattern has the shape of an earlier kind it is never reinterpreted as a
//! later one: a malformed regex literal is rejected, not treated as a path.

use regex::{Regex, RegexBuilder};
use std::collections::HashSet;
use std::sync::OnceLock;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid bypass regex pattern '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid flags '{flags}' in bypass regex pattern '{pattern}'")]
    InvalidFlags { pattern: String, flags: String },
    #[error("invalid wildcard bypass pattern '{pattern}': {source}")]
    InvalidWildcard {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("empty bypass pattern")]
    Empty,
    #[error("unable to parse '{url}' as a URL")]
    UnparsableUrl { url: String },
}

fn regex_literal() -> &'static Regex {
    static LITERAL: OnceLock<Regex> = OnceLock::new();
    LITERAL.get_or_init(|| Regex::new(r"^/(.*)/([a-z]*)$").expect("static regex literal pattern"))
}

/// Which of the six pattern kinds a raw string was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    Regex,
    SchemePrefix,
    Wildcard,
    PathSubstring,
    HostPort,
    Hostname,
}

#[derive(Debug, Clone)]
pub enum BypassPattern {
    Regex { source: String, regex: Regex },
    SchemePrefix(String),
    Wildcard { source: String, regex: Regex },
    PathSubstring(String),
    HostPort(String),
    Hostname(String),
}

impl BypassPattern {
    /// Classifies and compiles one raw pattern. Surrounding whitespace is ignored.
    pub fn compile(raw: &str) -> Result<Self, PatternError> {
        let pattern = raw.trim();
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        if let Some(captures) = regex_literal().captures(pattern) {
            let body = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            let flags = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
            let regex = compile_regex_literal(pattern, body, flags)?;
            return Ok(BypassPattern::Regex {
                source: pattern.to_string(),
                regex,
            });
        }

        let lowered = pattern.to_lowercase();

        if pattern.contains("://") {
            return Ok(BypassPattern::SchemePrefix(lowered));
        }

        if pattern.contains('*') {
            let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
            let regex = RegexBuilder::new(&format!("^{}$", escaped.join(".*")))
                .case_insensitive(true)
                .build()
                .map_err(|source| PatternError::InvalidWildcard {
                    pattern: pattern.to_string(),
                    source,
                })?;
            return Ok(BypassPattern::Wildcard {
                source: pattern.to_string(),
                regex,
            });
        }

        if pattern.contains('/') {
            return Ok(BypassPattern::PathSubstring(lowered));
        }

        if pattern.contains(':') {
            return Ok(BypassPattern::HostPort(lowered));
        }

        Ok(BypassPattern::Hostname(lowered))
    }

    pub fn kind(&self) -> PatternKind {
        match self {
            BypassPattern::Regex { .. } => PatternKind::Regex,
            BypassPattern::SchemePrefix(_) => PatternKind::SchemePrefix,
            BypassPattern::Wildcard { .. } => PatternKind::Wildcard,
            BypassPattern::PathSubstring(_) => PatternKind::PathSubstring,
            BypassPattern::HostPort(_) => PatternKind::HostPort,
            BypassPattern::Hostname(_) => PatternKind::Hostname,
        }
    }

    /// The pattern text as it was compiled (lower-cased for the plain kinds).
    pub fn as_str(&self) -> &str {
        match self {
            BypassPattern::Regex { source, .. } | BypassPattern::Wildcard { source, .. } => source,
            BypassPattern::SchemePrefix(s)
            | BypassPattern::PathSubstring(s)
            | BypassPattern::HostPort(s)
            | BypassPattern::Hostname(s) => s,
        }
    }

    /// Tests the pattern against an absolute URL.
    ///
    /// Host-based kinds need to parse the URL and return
    /// [`PatternError::UnparsableUrl`] when they cannot.
    pub fn matches(&self, url: &str) -> Result<bool, PatternError> {
        match self {
            BypassPattern::Regex { regex, .. } => Ok(regex.is_match(url)),
            BypassPattern::SchemePrefix(prefix) => Ok(url.to_lowercase().starts_with(prefix.as_str())),
            BypassPattern::PathSubstring(needle) => Ok(url.to_lowercase().contains(needle.as_str())),
            BypassPattern::Wildcard { regex, .. } => {
                let parsed = parse_url(url)?;
                let hostname = parsed.host_str().unwrap_or_default();
                Ok(regex.is_match(hostname) || regex.is_match(&host_with_port(&parsed)))
            }
            BypassPattern::HostPort(expected) => {
                let parsed = parse_url(url)?;
                Ok(host_with_port(&parsed).to_lowercase() == *expected)
            }
            BypassPattern::Hostname(expected) => {
                let parsed = parse_url(url)?;
                let hostname = parsed.host_str().unwrap_or_default().to_lowercase();
                Ok(hostname == *expected || hostname.ends_with(&format!(".{}", expected)))
            }
        }
    }
}

fn compile_regex_literal(pattern: &str, body: &str, flags: &str) -> Result<Regex, PatternError> {
    let mut builder = RegexBuilder::new(body);
    let mut seen = HashSet::new();

    for flag in flags.chars() {
        if !seen.insert(flag) {
            return Err(PatternError::InvalidFlags {
                pattern: pattern.to_string(),
                flags: flags.to_string(),
            });
        }
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            // global, sticky, unicode, unicode-sets and indices do not change a single test
            'g' | 'y' | 'u' | 'v' | 'd' => {}
            _ => {
                return Err(PatternError::InvalidFlags {
                    pattern: pattern.to_string(),
                    flags: flags.to_string(),
                });
            }
        }
    }

    // the two unicode modes are mutually exclusive
    if seen.contains(&'u') && seen.contains(&'v') {
        return Err(PatternError::InvalidFlags {
            pattern: pattern.to_string(),
            flags: flags.to_string(),
        });
    }

    builder.build().map_err(|source| PatternError::InvalidRegex {
        pattern: pattern.to_string(),
        source,
    })
}

fn parse_url(url: &str) -> Result<Url, PatternError> {
    Url::parse(url).map_err(|_| PatternError::UnparsableUrl { url: url.to_string() })
}

/// `hostname[:port]`, with the port only when it is explicit and not the scheme default.
pub(crate) fn host_with_port(url: &Url) -> String {
    let hostname = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", hostname, port),
        None => hostname.to_string(),
    }
}

/// Splits a single delimiter-separated string (newlines or commas) into entries.
pub fn split_bypass_text(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    text.split(['\n', ','])
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

/// Trims entries, drops empties and removes duplicates, keeping first-seen order.
pub fn normalise_bypass_list<I, S>(entries: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut result = Vec::new();

    for entry in entries {
        let trimmed = entry.as_ref().trim();
        if trimmed.is_empty() || seen.contains(trimmed) {
            continue;
        }
        seen.insert(trimmed.to_string());
        result.push(trimmed.to_string());
    }

    result
}
