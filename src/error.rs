use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URI error: {0}")]
    Uri(String),

    #[error("Invalid proxy request: {0}")]
    InvalidTarget(String),

    #[error("{0}")]
    Upstream(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl From<hyper::Error> for ProxyError {
    fn from(e: hyper::Error) -> Self {
        ProxyError::Http(e.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for ProxyError {
    fn from(e: hyper_util::client::legacy::Error) -> Self {
        ProxyError::Upstream(upstream_message(&e))
    }
}

impl From<http::uri::InvalidUri> for ProxyError {
    fn from(e: http::uri::InvalidUri) -> Self {
        ProxyError::Uri(e.to_string())
    }
}

/// Flattens a client error and its sources into one line, so "client error
/// (Connect)" also carries the "connection refused" underneath it.
pub fn upstream_message(e: &(dyn std::error::Error + 'static)) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
