use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::HeaderValue;
use hyper::{Method, Request, Response, StatusCode};
use path_proxy::error::ProxyError;
use path_proxy::intercept::{Fetch, Interceptors, OpenSend};
use path_proxy::settings::{ProxySettings, SettingsStore};
use path_proxy::transport::XhrRequest;
use std::sync::{Arc, Mutex};
use url::Url;

/// Records every URI it is asked to fetch and answers with it as the body.
#[derive(Clone, Default)]
struct RecordingFetch {
    seen: Arc<Mutex<Vec<String>>>,
}

impl RecordingFetch {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetch for RecordingFetch {
    type Body = Full<Bytes>;
    type Response = Response<Full<Bytes>>;
    type Error = ProxyError;

    async fn fetch(&self, request: Request<Full<Bytes>>) -> Result<Self::Response, ProxyError> {
        let uri = request.uri().to_string();
        self.seen.lock().unwrap().push(uri.clone());
        Ok(Response::new(Full::new(Bytes::from(uri))))
    }
}

fn get(uri: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .uri(uri)
        .header("x-request-id", "42")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[tokio::test]
async fn test_fetch_is_routed_through_proxy() {
    let store = SettingsStore::new(ProxySettings::new("https", "proxy.local", ""));
    let inner = RecordingFetch::default();
    let fetch = Interceptors::new(store.accessor(), None).fetch(inner.clone());

    fetch.fetch(get("https://api.example.com/x")).await.unwrap();

    assert_eq!(inner.seen(), vec!["https://proxy.local/https://api.example.com/x"]);
}

#[tokio::test]
async fn test_bypass_rules_are_honoured() {
    let settings = ProxySettings::new("http", "proxy.local", "8787")
        .with_bypass_list(["example.com", "/^https://cdn\\./", "*.internal.dev", "localhost:3000"]);
    let store = SettingsStore::new(settings);
    let inner = RecordingFetch::default();
    let fetch = Interceptors::new(store.accessor(), None).fetch(inner.clone());

    for url in [
        "https://EXAMPLE.com/x",
        "https://api.example.com/x",
        "https://cdn.assets.net/app.js",
        "https://build.internal.dev/status",
        "http://localhost:3000/health",
        "https://notexample.com/x",
    ] {
        fetch.fetch(get(url)).await.unwrap();
    }

    assert_eq!(
        inner.seen(),
        vec![
            "https://example.com/x",
            "https://api.example.com/x",
            "https://cdn.assets.net/app.js",
            "https://build.internal.dev/status",
            "http://localhost:3000/health",
            "http://proxy.local:8787/https://notexample.com/x",
        ]
    );
}

#[tokio::test]
async fn test_settings_changes_apply_to_next_call() {
    let store = SettingsStore::new(ProxySettings::new("http", "", ""));
    let inner = RecordingFetch::default();
    let fetch = Interceptors::new(store.accessor(), None).fetch(inner.clone());

    fetch.fetch(get("https://api.example.com/a")).await.unwrap();
    store.update(ProxySettings::new("http", "proxy.local", ""));
    fetch.fetch(get("https://api.example.com/b")).await.unwrap();
    store.modify(|settings| settings.bypass_list = vec!["api.example.com".to_string()]);
    fetch.fetch(get("https://api.example.com/c")).await.unwrap();
    store.reset();
    fetch.fetch(get("https://api.example.com/d")).await.unwrap();

    assert_eq!(
        inner.seen(),
        vec![
            "https://api.example.com/a",
            "http://proxy.local/https://api.example.com/b",
            "https://api.example.com/c",
            "http://localhost:8787/https://api.example.com/d",
        ]
    );
}

#[tokio::test]
async fn test_double_interception_rewrites_once() {
    let store = SettingsStore::new(ProxySettings::new("http", "proxy.local", ""));
    let interceptors = Interceptors::new(store.accessor(), None);
    let inner = RecordingFetch::default();

    let once = interceptors.fetch(inner.clone());
    assert!(once.is_intercepted());
    let twice = interceptors.fetch(once);

    twice.fetch(get("https://api.example.com/x")).await.unwrap();
    assert_eq!(inner.seen(), vec!["http://proxy.local/https://api.example.com/x"]);
}

#[tokio::test]
async fn test_already_proxied_url_is_not_wrapped_again() {
    let store = SettingsStore::new(ProxySettings::new("http", "proxy.local", ""));
    let inner = RecordingFetch::default();
    let fetch = Interceptors::new(store.accessor(), None).fetch(inner.clone());

    fetch
        .fetch(get("http://proxy.local/https://api.example.com/x"))
        .await
        .unwrap();
    assert_eq!(inner.seen(), vec!["http://proxy.local/https://api.example.com/x"]);
}

#[tokio::test]
async fn test_request_parts_survive_rewrite() {
    struct HeaderCheck;

    #[async_trait]
    impl Fetch for HeaderCheck {
        type Body = Full<Bytes>;
        type Response = (Method, Option<HeaderValue>);
        type Error = ProxyError;

        async fn fetch(&self, request: Request<Full<Bytes>>) -> Result<Self::Response, ProxyError> {
            Ok((request.method().clone(), request.headers().get("x-request-id").cloned()))
        }
    }

    let store = SettingsStore::new(ProxySettings::new("http", "proxy.local", ""));
    let fetch = Interceptors::new(store.accessor(), None).fetch(HeaderCheck);
    let mut request = get("https://api.example.com/x");
    *request.method_mut() = Method::PUT;

    let (method, header) = fetch.fetch(request).await.unwrap();
    assert_eq!(method, Method::PUT);
    assert_eq!(header.unwrap(), "42");
}

#[tokio::test]
async fn test_open_send_rewrites_relative_urls() {
    let store = SettingsStore::new(ProxySettings::new("https", "proxy.local", "8443"));
    let location = Url::parse("https://app.example.com/dashboard/").unwrap();
    let inner = RecordingFetch::default();
    let mut xhr = Interceptors::new(store.accessor(), Some(location)).open_send(XhrRequest::new(inner.clone()));

    xhr.open(Method::POST, "../api/session");
    xhr.set_request_header(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    let response = xhr.send(Bytes::from_static(b"{}")).await.unwrap();

    let expected = "https://proxy.local:8443/https://app.example.com/api/session";
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(&response.body[..], expected.as_bytes());
    assert_eq!(xhr.inner().url(), Some(expected));
    assert_eq!(xhr.inner().method(), &Method::POST);
}

#[tokio::test]
async fn test_send_before_open_fails() {
    let mut xhr = XhrRequest::new(RecordingFetch::default());
    assert!(xhr.send(Bytes::new()).await.is_err());
}
