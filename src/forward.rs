use crate::common::{
    HttpsClient, ProxyBody, ResponseBuilder, build_https_client, empty_body, strip_hop_by_hop,
};
use crate::error::ProxyError;
use crate::target::TargetRequest;
use futures::future::try_join;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{CONNECTION, HOST, HeaderValue, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, copy_bidirectional};

#[derive(Debug, Clone)]
pub struct ForwardingConfig {
    /// Verify upstream TLS certificates.
    pub reject_unauthorized: bool,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            reject_unauthorized: true,
        }
    }
}

/// Observer invoked with every forwarding failure before it is turned into a 502.
pub type ErrorHook = Arc<dyn Fn(&ProxyError, &TargetRequest) + Send + Sync>;

/// Forwards validated requests to their targets. Holds no per-request state, so a
/// single instance is shared by every connection.
#[derive(Clone)]
pub struct Forwarder {
    client: HttpsClient<Incoming>,
    error_hook: Option<ErrorHook>,
}

impl Forwarder {
    pub fn new(config: &ForwardingConfig) -> Result<Self, ProxyError> {
        Ok(Self {
            client: build_https_client(config.reject_unauthorized)?,
            error_hook: None,
        })
    }

    pub fn with_error_hook(mut self, hook: ErrorHook) -> Self {
        self.error_hook = Some(hook);
        self
    }

    /// Forwards a plain request. Failures become `502 Proxy error: <message>`.
    pub async fn forward(&self, target: &TargetRequest, req: Request<Incoming>) -> Response<ProxyBody> {
        match self.send(target, req, false).await {
            Ok(response) => {
                debug!("Forwarded request to {} - Status: {}", target, response.status());
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                self.report(&e, target);
                ResponseBuilder::proxy_error(&e.to_string())
            }
        }
    }

    /// Forwards an upgrade handshake. When the upstream switches protocols the
    /// two connections are spliced together until either side closes.
    pub async fn forward_upgrade(
        &self,
        target: &TargetRequest,
        mut req: Request<Incoming>,
    ) -> Response<ProxyBody> {
        let client_upgrade = hyper::upgrade::on(&mut req);

        let mut upstream = match self.send(target, req, true).await {
            Ok(response) => response,
            Err(e) => {
                self.report(&e, target);
                return ResponseBuilder::upgrade_rejection(StatusCode::BAD_GATEWAY);
            }
        };

        if upstream.status() != StatusCode::SWITCHING_PROTOCOLS {
            debug!(
                "Upstream {} declined the upgrade with status {}",
                target,
                upstream.status()
            );
            let (parts, body) = upstream.into_parts();
            return Response::from_parts(parts, body.boxed());
        }

        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.headers_mut() = upstream.headers().clone();
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("upgrade"));

        let upstream_upgrade = hyper::upgrade::on(&mut upstream);
        let target_name = target.to_string();
        let hook = self.error_hook.clone();
        let hook_target = target.clone();

        tokio::spawn(async move {
            match try_join(client_upgrade, upstream_upgrade).await {
                Ok((client, upstream)) => {
                    let mut client = TokioIo::new(client);
                    let mut upstream = TokioIo::new(upstream);
                    match copy_bidirectional(&mut client, &mut upstream).await {
                        Ok((sent, received)) => debug!(
                            "Upgrade tunnel to {} closed ({} bytes up, {} bytes down)",
                            target_name, sent, received
                        ),
                        Err(e) => warn!("Upgrade tunnel to {} failed: {}", target_name, e),
                    }
                    let _ = client.shutdown().await;
                    let _ = upstream.shutdown().await;
                }
                Err(e) => {
                    let e = ProxyError::from(e);
                    error!("[proxy] Failed to upgrade connection to {}: {}", target_name, e);
                    if let Some(hook) = hook {
                        hook(&e, &hook_target);
                    }
                }
            }
        });

        info!("Upgraded connection to {}", target);
        response
    }

    async fn send(
        &self,
        target: &TargetRequest,
        req: Request<Incoming>,
        upgrade: bool,
    ) -> Result<Response<Incoming>, ProxyError> {
        let uri = target.transport_uri()?;
        let (mut parts, body) = req.into_parts();

        let upgrade_protocol = parts.headers.get(UPGRADE).cloned();
        strip_hop_by_hop(&mut parts.headers);
        if upgrade {
            if let Some(protocol) = upgrade_protocol {
                parts.headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
                parts.headers.insert(UPGRADE, protocol);
            }
        }

        // the client fills Host in from the target URI
        parts.headers.remove(HOST);
        parts.uri = uri;
        parts.version = hyper::Version::HTTP_11;

        let upstream = Request::from_parts(parts, body);
        Ok(self.client.request(upstream).await?)
    }

    fn report(&self, e: &ProxyError, target: &TargetRequest) {
        error!("[proxy] Failed to forward request to {}: {}", target, e);
        if let Some(hook) = &self.error_hook {
            hook(e, target);
        }
    }
}
