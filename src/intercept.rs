//! Interception of outgoing calls.
//!
//! Every place the agent issues network calls goes through one of three
//! primitives: [`Fetch`] (request in, response out), [`OpenSend`] (imperative
//! open, then send) and [`EventStreamFactory`] (long-lived server-push streams).
//! The `Proxied*` wrappers implement the same traits and rewrite the URL through
//! the current [`SettingsSnapshot`](crate::settings::SettingsSnapshot) before
//! delegating. Settings are read on every call, so updates apply to the next call
//! without re-wrapping anything.

use crate::error::ProxyError;
use crate::settings::SettingsAccessor;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri};
use log::{debug, warn};
use url::Url;

/// Promise-style dispatch: one request, one eventual response.
#[async_trait]
pub trait Fetch: Send + Sync {
    type Body: Send + 'static;
    type Response: Send;
    type Error: Send;

    async fn fetch(&self, request: Request<Self::Body>) -> Result<Self::Response, Self::Error>;

    /// Marker set by interceptors so wrapping twice is a no-op.
    fn is_intercepted(&self) -> bool {
        false
    }
}

/// Imperative request object: `open` sets method and URL, `send` performs the call.
#[async_trait]
pub trait OpenSend: Send {
    type Output: Send;

    fn open(&mut self, method: Method, url: &str);

    fn set_request_header(&mut self, name: HeaderName, value: HeaderValue);

    async fn send(&mut self, body: Bytes) -> Result<Self::Output, ProxyError>;

    fn is_intercepted(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

impl ReadyState {
    pub const CONNECTING: u8 = ReadyState::Connecting as u8;
    pub const OPEN: u8 = ReadyState::Open as u8;
    pub const CLOSED: u8 = ReadyState::Closed as u8;

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            _ => ReadyState::Closed,
        }
    }
}

/// A live server-push stream.
pub trait EventStream: Send {
    fn url(&self) -> &str;
    fn ready_state(&self) -> ReadyState;
    fn close(&mut self);
}

#[derive(Debug, Clone, Default)]
pub struct EventStreamOptions {
    pub headers: HeaderMap,
}

/// Opens server-push streams; stands in for the stream constructor.
pub trait EventStreamFactory: Send + Sync {
    type Stream: EventStream;

    fn open(&self, url: &str, options: EventStreamOptions) -> Result<Self::Stream, ProxyError>;

    fn is_intercepted(&self) -> bool {
        false
    }
}

/// Installs interceptors over network primitives. Holds the settings accessor and
/// the document location relative URLs resolve against.
#[derive(Clone)]
pub struct Interceptors {
    settings: SettingsAccessor,
    location: Option<Url>,
}

impl Interceptors {
    pub fn new(settings: SettingsAccessor, location: Option<Url>) -> Self {
        Self { settings, location }
    }

    pub fn fetch<F: Fetch>(&self, inner: F) -> ProxiedFetch<F> {
        if inner.is_intercepted() {
            debug!("Fetch primitive is already intercepted");
        }
        ProxiedFetch {
            inner,
            interceptors: self.clone(),
        }
    }

    pub fn open_send<R: OpenSend>(&self, inner: R) -> ProxiedOpen<R> {
        ProxiedOpen {
            inner,
            interceptors: self.clone(),
        }
    }

    pub fn event_streams<F: EventStreamFactory>(&self, inner: F) -> ProxiedEventStreams<F> {
        ProxiedEventStreams {
            inner,
            interceptors: self.clone(),
        }
    }

    /// The URL a call to `url` should actually go to. `None` when proxying is
    /// disabled, so callers can skip any work.
    pub fn rewrite(&self, url: &str) -> Option<String> {
        let snapshot = self.settings.snapshot();
        if !snapshot.is_enabled() {
            return None;
        }
        Some(snapshot.rewrite(url, self.location.as_ref()))
    }
}

pub struct ProxiedFetch<F> {
    inner: F,
    interceptors: Interceptors,
}

impl<F> ProxiedFetch<F> {
    pub fn inner(&self) -> &F {
        &self.inner
    }

    pub fn into_inner(self) -> F {
        self.inner
    }
}

#[async_trait]
impl<F: Fetch> Fetch for ProxiedFetch<F> {
    type Body = F::Body;
    type Response = F::Response;
    type Error = F::Error;

    async fn fetch(&self, request: Request<Self::Body>) -> Result<Self::Response, Self::Error> {
        if self.inner.is_intercepted() {
            return self.inner.fetch(request).await;
        }

        let current = request.uri().to_string();
        let Some(rewritten) = self.interceptors.rewrite(&current) else {
            return self.inner.fetch(request).await;
        };
        if rewritten == current {
            return self.inner.fetch(request).await;
        }

        let uri = match rewritten.parse::<Uri>() {
            Ok(uri) => uri,
            Err(e) => {
                warn!("[path-proxy] Rewritten URL '{}' is not a valid URI: {}", rewritten, e);
                return self.inner.fetch(request).await;
            }
        };

        debug!("Routing {} through {}", current, uri);
        let (mut parts, body) = request.into_parts();
        parts.uri = uri;
        self.inner.fetch(Request::from_parts(parts, body)).await
    }

    fn is_intercepted(&self) -> bool {
        true
    }
}

pub struct ProxiedOpen<R> {
    inner: R,
    interceptors: Interceptors,
}

impl<R> ProxiedOpen<R> {
    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[async_trait]
impl<R: OpenSend> OpenSend for ProxiedOpen<R> {
    type Output = R::Output;

    fn open(&mut self, method: Method, url: &str) {
        if self.inner.is_intercepted() {
            return self.inner.open(method, url);
        }
        match self.interceptors.rewrite(url) {
            Some(rewritten) => self.inner.open(method, &rewritten),
            None => self.inner.open(method, url),
        }
    }

    fn set_request_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.inner.set_request_header(name, value);
    }

    async fn send(&mut self, body: Bytes) -> Result<Self::Output, ProxyError> {
        self.inner.send(body).await
    }

    fn is_intercepted(&self) -> bool {
        true
    }
}

/// Wraps a stream factory. The streams it hands out are the inner factory's own
/// type, so their constants, identity and `close` behave exactly as unwrapped.
pub struct ProxiedEventStreams<F> {
    inner: F,
    interceptors: Interceptors,
}

impl<F> ProxiedEventStreams<F> {
    pub fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: EventStreamFactory> EventStreamFactory for ProxiedEventStreams<F> {
    type Stream = F::Stream;

    fn open(&self, url: &str, options: EventStreamOptions) -> Result<Self::Stream, ProxyError> {
        if self.inner.is_intercepted() {
            return self.inner.open(url, options);
        }
        match self.interceptors.rewrite(url) {
            Some(rewritten) => self.inner.open(&rewritten, options),
            None => self.inner.open(url, options),
        }
    }

    fn is_intercepted(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ProxySettings, SettingsStore};
    use std::sync::{Arc, Mutex};

    struct RecordingStreams {
        opened: Arc<Mutex<Vec<(String, EventStreamOptions)>>>,
    }

    struct FakeStream {
        url: String,
        state: ReadyState,
    }

    impl EventStream for FakeStream {
        fn url(&self) -> &str {
            &self.url
        }
        fn ready_state(&self) -> ReadyState {
            self.state
        }
        fn close(&mut self) {
            self.state = ReadyState::Closed;
        }
    }

    impl EventStreamFactory for RecordingStreams {
        type Stream = FakeStream;

        fn open(&self, url: &str, options: EventStreamOptions) -> Result<FakeStream, ProxyError> {
            self.opened.lock().unwrap().push((url.to_string(), options));
            Ok(FakeStream {
                url: url.to_string(),
                state: ReadyState::Connecting,
            })
        }
    }

    #[test]
    fn test_ready_state_constants() {
        assert_eq!(ReadyState::CONNECTING, 0);
        assert_eq!(ReadyState::OPEN, 1);
        assert_eq!(ReadyState::CLOSED, 2);
        assert_eq!(ReadyState::from_u8(1), ReadyState::Open);
    }

    #[test]
    fn test_event_streams_are_rewritten_and_keep_options() {
        let store = SettingsStore::new(ProxySettings::new("https", "proxy.local", ""));
        let interceptors = Interceptors::new(store.accessor(), None);
        let opened = Arc::new(Mutex::new(Vec::new()));
        let streams = interceptors.event_streams(RecordingStreams { opened: opened.clone() });

        let mut options = EventStreamOptions::default();
        options.headers.insert("x-token", HeaderValue::from_static("abc"));

        let mut stream = streams.open("https://events.example.com/feed", options).unwrap();
        assert_eq!(stream.url(), "https://proxy.local/https://events.example.com/feed");
        stream.close();
        assert_eq!(stream.ready_state(), ReadyState::Closed);

        let recorded = opened.lock().unwrap();
        assert_eq!(recorded[0].1.headers["x-token"], "abc");
    }

    #[test]
    fn test_event_streams_pass_through_when_disabled() {
        let store = SettingsStore::new(ProxySettings::new("http", "", ""));
        let interceptors = Interceptors::new(store.accessor(), None);
        let opened = Arc::new(Mutex::new(Vec::new()));
        let streams = interceptors.event_streams(RecordingStreams { opened });

        let stream = streams.open("https://events.example.com/feed", EventStreamOptions::default()).unwrap();
        assert_eq!(stream.url(), "https://events.example.com/feed");
    }

    #[test]
    fn test_double_wrapped_factory_rewrites_once() {
        let store = SettingsStore::new(ProxySettings::new("http", "proxy.local", "8787"));
        let interceptors = Interceptors::new(store.accessor(), None);
        let opened = Arc::new(Mutex::new(Vec::new()));
        let once = interceptors.event_streams(RecordingStreams { opened });
        assert!(once.is_intercepted());
        let twice = interceptors.event_streams(once);

        let stream = twice.open("http://a.dev/s", EventStreamOptions::default()).unwrap();
        assert_eq!(stream.url(), "http://proxy.local:8787/http://a.dev/s");
    }
}
