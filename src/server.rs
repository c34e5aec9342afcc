use crate::common::{ProxyBody, ResponseBuilder, is_upgrade_request};
use crate::config::Config;
use crate::cors::{CorsDecision, OriginPolicy, apply_headers};
use crate::error::ProxyError;
use crate::forward::{ErrorHook, Forwarder};
use crate::target::resolve_target;
use crate::tls::create_tls_acceptor;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, info};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// The path-prefix proxy: `/<absolute-url>` in, upstream response out.
#[derive(Clone)]
pub struct ProxyServer {
    listen_addr: SocketAddr,
    policy: Arc<OriginPolicy>,
    forwarder: Arc<Forwarder>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(config: &Config) -> Result<Self, ProxyError> {
        let tls_acceptor = match (&config.private_key, &config.certificate) {
            (Some(key), Some(cert)) => Some(create_tls_acceptor(
                key,
                cert,
                config.ca_certificate.as_deref(),
            )?),
            _ => None,
        };

        Ok(Self {
            listen_addr: config.listen_addr,
            policy: Arc::new(config.origin_policy()),
            forwarder: Arc::new(Forwarder::new(&config.forwarding())?),
            tls_acceptor,
        })
    }

    /// Registers an observer for forwarding failures.
    pub fn with_error_hook(mut self, hook: ErrorHook) -> Self {
        let forwarder = (*self.forwarder).clone().with_error_hook(hook);
        self.forwarder = Arc::new(forwarder);
        self
    }

    pub fn policy(&self) -> &OriginPolicy {
        &self.policy
    }

    pub fn is_tls(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    /// Binds the configured address and serves until the listener fails.
    pub async fn run(self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ProxyError> {
        let addr = listener.local_addr()?;
        let scheme = if self.is_tls() { "https" } else { "http" };
        info!("Path proxy listening on {}://{}", scheme, addr);
        info!("Allowed origins: {}", self.describe_origins());

        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                match &server.tls_acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => server.serve_stream(tls_stream, peer).await,
                        Err(e) => debug!("TLS handshake with {} failed: {}", peer, e),
                    },
                    None => server.serve_stream(stream, peer).await,
                }
            });
        }
    }

    async fn serve_stream<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server = self.clone();
        let service = service_fn(move |req| {
            let server = server.clone();
            async move { Ok::<_, Infallible>(server.handle(req).await) }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            debug!("Error serving connection from {}: {}", peer, e);
        }
    }

    /// Handles one request: resolve the target, apply the origin policy, forward.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let upgrade = is_upgrade_request(&req);
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let target = match resolve_target(path) {
            Ok(target) => target,
            Err(e) => {
                debug!("Rejecting {} {}: {}", req.method(), path, e);
                return if upgrade {
                    ResponseBuilder::upgrade_rejection(StatusCode::BAD_REQUEST)
                } else {
                    ResponseBuilder::invalid_target()
                };
            }
        };

        if upgrade {
            if !self.policy.allows_upgrade(req.headers()) {
                debug!("Rejecting upgrade to {}: origin not allowed", target);
                return ResponseBuilder::upgrade_rejection(StatusCode::FORBIDDEN);
            }
            return self.forwarder.forward_upgrade(&target, req).await;
        }

        match self.policy.apply(req.method(), req.headers()) {
            CorsDecision::Respond(response) => response,
            CorsDecision::Forward(cors) => {
                let mut response = self.forwarder.forward(&target, req).await;
                apply_headers(&mut response, &cors);
                response
            }
        }
    }

    fn describe_origins(&self) -> String {
        if self.policy.allows_any_origin() {
            return "* (all origins)".to_string();
        }
        let mut origins: Vec<&str> = self.policy.allowed_origins().collect();
        origins.sort_unstable();
        origins.join(", ")
    }
}
