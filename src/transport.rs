//! Concrete network primitives built on the hyper client: a fetcher, an
//! open/send request object and a server-sent events stream. Each one can be
//! wrapped by [`Interceptors`](crate::intercept::Interceptors).

use crate::common::{HttpsClient, build_https_client};
use crate::error::ProxyError;
use crate::intercept::{EventStream, EventStreamFactory, EventStreamOptions, Fetch, OpenSend, ReadyState};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::header::{ACCEPT, CACHE_CONTROL, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Request, Response, StatusCode, Uri};
use log::{debug, warn};
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Plain hyper-backed fetcher.
#[derive(Clone)]
pub struct HyperFetch {
    client: HttpsClient<Full<Bytes>>,
}

impl HyperFetch {
    pub fn new(reject_unauthorized: bool) -> Result<Self, ProxyError> {
        Ok(Self {
            client: build_https_client(reject_unauthorized)?,
        })
    }
}

#[async_trait]
impl Fetch for HyperFetch {
    type Body = Full<Bytes>;
    type Response = Response<Incoming>;
    type Error = ProxyError;

    async fn fetch(&self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>, ProxyError> {
        debug!("{} {}", request.method(), request.uri());
        Ok(self.client.request(request).await?)
    }
}

#[derive(Debug, Clone)]
pub struct XhrResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Imperative request object over any fetcher: `open`, set headers, `send`.
pub struct XhrRequest<F> {
    fetcher: F,
    method: Method,
    url: Option<String>,
    headers: HeaderMap,
}

impl<F> XhrRequest<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            method: Method::GET,
            url: None,
            headers: HeaderMap::new(),
        }
    }

    /// The URL passed to the last `open`.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }
}

#[async_trait]
impl<F, B> OpenSend for XhrRequest<F>
where
    F: Fetch<Body = Full<Bytes>, Response = Response<B>, Error = ProxyError>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Display,
{
    type Output = XhrResponse;

    fn open(&mut self, method: Method, url: &str) {
        self.method = method;
        self.url = Some(url.to_string());
        self.headers.clear();
    }

    fn set_request_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.append(name, value);
    }

    async fn send(&mut self, body: Bytes) -> Result<XhrResponse, ProxyError> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| ProxyError::Http("send() called before open()".to_string()))?;
        let uri: Uri = url.parse()?;

        let mut request = Request::new(Full::new(body));
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = uri;
        *request.headers_mut() = self.headers.clone();

        let response = self.fetcher.fetch(request).await?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::Http(format!("Failed to read response body: {}", e)))?
            .to_bytes();

        Ok(XhrResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` parser. Chunks may split lines (and UTF-8
/// sequences) anywhere.
#[derive(Debug, Default)]
pub struct EventParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    last_event_id: Option<String>,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ServerEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }

        events
    }

    fn process_line(&mut self, line: &str) -> Option<ServerEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => self.last_event_id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<ServerEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(ServerEvent {
            event: event.filter(|e| !e.is_empty()).unwrap_or_else(|| "message".to_string()),
            data,
            id: self.last_event_id.clone(),
        })
    }
}

/// A server-sent events connection. Events arrive through [`recv`](Self::recv).
pub struct HttpEventSource {
    url: String,
    state: Arc<AtomicU8>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    task: JoinHandle<()>,
}

impl HttpEventSource {
    /// Next event, or `None` once the stream has ended or been closed.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }
}

impl EventStream for HttpEventSource {
    fn url(&self) -> &str {
        &self.url
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn close(&mut self) {
        self.task.abort();
        self.state.store(ReadyState::CLOSED, Ordering::SeqCst);
        self.events.close();
    }
}

impl Drop for HttpEventSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Opens [`HttpEventSource`]s. Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct HttpEventSources {
    client: HttpsClient<Full<Bytes>>,
}

impl HttpEventSources {
    pub fn new(reject_unauthorized: bool) -> Result<Self, ProxyError> {
        Ok(Self {
            client: build_https_client(reject_unauthorized)?,
        })
    }
}

impl EventStreamFactory for HttpEventSources {
    type Stream = HttpEventSource;

    fn open(&self, url: &str, options: EventStreamOptions) -> Result<HttpEventSource, ProxyError> {
        let uri: Uri = url.parse()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ProxyError::Connection(format!("No async runtime for event stream: {}", e)))?;

        let mut request = Request::new(Full::new(Bytes::new()));
        *request.uri_mut() = uri;
        *request.headers_mut() = options.headers;
        request
            .headers_mut()
            .insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        request
            .headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let state = Arc::new(AtomicU8::new(ReadyState::CONNECTING));
        let (tx, events) = mpsc::unbounded_channel();
        let task = runtime.spawn(read_events(
            self.client.clone(),
            request,
            url.to_string(),
            state.clone(),
            tx,
        ));

        Ok(HttpEventSource {
            url: url.to_string(),
            state,
            events,
            task,
        })
    }
}

async fn read_events(
    client: HttpsClient<Full<Bytes>>,
    request: Request<Full<Bytes>>,
    url: String,
    state: Arc<AtomicU8>,
    tx: mpsc::UnboundedSender<ServerEvent>,
) {
    let response = match client.request(request).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Event stream {} failed to connect: {}", url, ProxyError::from(e));
            state.store(ReadyState::CLOSED, Ordering::SeqCst);
            return;
        }
    };

    if !response.status().is_success() {
        warn!("Event stream {} answered with status {}", url, response.status());
        state.store(ReadyState::CLOSED, Ordering::SeqCst);
        return;
    }

    state.store(ReadyState::OPEN, Ordering::SeqCst);
    debug!("Event stream {} open", url);

    let mut body = response.into_body();
    let mut parser = EventParser::new();
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                let Ok(data) = frame.into_data() else { continue };
                for event in parser.feed(&data) {
                    if tx.send(event).is_err() {
                        state.store(ReadyState::CLOSED, Ordering::SeqCst);
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("Event stream {} read error: {}", url, e);
                break;
            }
        }
    }

    state.store(ReadyState::CLOSED, Ordering::SeqCst);
    debug!("Event stream {} closed", url);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_dispatches_on_blank_line() {
        let mut parser = EventParser::new();
        let events = parser.feed(b"event: update\nid: 7\ndata: first\ndata: second\n\n");
        assert_eq!(
            events,
            vec![ServerEvent {
                event: "update".to_string(),
                data: "first\nsecond".to_string(),
                id: Some("7".to_string()),
            }]
        );
    }

    #[test]
    fn test_parser_handles_split_chunks_and_crlf() {
        let mut parser = EventParser::new();
        assert!(parser.feed(b"data: hel").is_empty());
        assert!(parser.feed(b"lo\r\n").is_empty());
        let events = parser.feed(b"\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[0].id, None);
    }

    #[test]
    fn test_parser_ignores_comments_and_empty_events() {
        let mut parser = EventParser::new();
        let events = parser.feed(b": keep-alive\n\nevent: ping\n\ndata\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "");
        assert_eq!(events[0].event, "message");
    }

    #[test]
    fn test_parser_keeps_last_event_id() {
        let mut parser = EventParser::new();
        parser.feed(b"id: 1\ndata: a\n\n");
        let events = parser.feed(b"data: b\n\n");
        assert_eq!(events[0].id.as_deref(), Some("1"));
        assert_eq!(parser.last_event_id(), Some("1"));
    }

    #[test]
    fn test_open_requires_valid_url() {
        let factory = HttpEventSources::new(true).unwrap();
        assert!(factory.open("not a url", EventStreamOptions::default()).is_err());
    }

    #[tokio::test]
    async fn test_close_sets_ready_state() {
        let factory = HttpEventSources::new(true).unwrap();
        let mut stream = factory
            .open("http://127.0.0.1:1/events", EventStreamOptions::default())
            .unwrap();
        assert_eq!(stream.url(), "http://127.0.0.1:1/events");
        stream.close();
        assert_eq!(stream.ready_state(), ReadyState::Closed);
        assert!(stream.recv().await.is_none());
    }
}
