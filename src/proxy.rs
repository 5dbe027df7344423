use crate::classifier::Classifier;
use crate::config::Config;
use crate::cors::CorsPolicy;
use crate::error::{json_error_response, ProxyErrorCode, UNREACHABLE_MESSAGE};
use crate::pool::{OriginPool, PoolConfig, PoolError, ProxyBody};
use crate::supervisor::TaskSupervisor;
use crate::waiting_page::{bypass_href, WaitingPage};
use crate::wake::{Dispatch, WakeDispatcher};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Request handling shared by every connection
pub struct Gateway {
    pool: OriginPool,
    classifier: Classifier,
    cors: CorsPolicy,
    health_path: String,
    request_timeout: Duration,
    waiting_page: WaitingPage,
    show_status: bool,
    dispatcher: Arc<WakeDispatcher>,
    supervisor: TaskSupervisor,
}

impl Gateway {
    pub fn from_config(config: &Config, supervisor: TaskSupervisor) -> anyhow::Result<Self> {
        let pool_config = PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        };

        let classifier = config.proxy.classifier();
        let offline = classifier.offline_statuses();
        if offline.is_empty() {
            warn!("No offline statuses configured, the waiting page will never be served");
        } else {
            debug!(count = offline.len(), "Offline statuses loaded");
        }

        Ok(Self {
            pool: OriginPool::new(&config.proxy.origin_url, pool_config),
            classifier,
            cors: config.proxy.cors_policy(),
            health_path: config.proxy.health_path.clone(),
            request_timeout: config.proxy.request_timeout(),
            waiting_page: config.waiting_page.page(),
            show_status: config.waiting_page.show_status,
            dispatcher: Arc::new(WakeDispatcher::from_config(&config.wake)?),
            supervisor,
        })
    }

    pub fn pool(&self) -> &OriginPool {
        &self.pool
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    /// Handle one inbound request. Always produces a response.
    pub async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "request",
            request_id = %request_id,
            method = %req.method(),
            path = %req.uri().path(),
        );
        self.route(req).instrument(span).await
    }

    async fn route(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        if req.method() == Method::OPTIONS {
            debug!("Answering CORS preflight");
            return self.cors.preflight_response(req.headers());
        }

        if req.uri().path() == self.health_path {
            return health_response();
        }

        // The request is consumed by forwarding
        let headers = req.headers().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(String::from);

        let response = self.forward(req).await;

        let decision = self
            .classifier
            .classify(response.status(), &headers, query.as_deref());

        if !decision.should_serve_waiting_page() {
            if decision.is_offline_signal {
                debug!(
                    status = decision.origin_status.as_u16(),
                    browser = decision.is_browser_caller,
                    bypass = decision.bypass_requested,
                    "Origin offline, passing response through"
                );
            }
            return response;
        }

        info!(
            status = decision.origin_status.as_u16(),
            "Origin looks offline, serving waiting page"
        );

        match self.dispatcher.dispatch(&self.supervisor) {
            Dispatch::Disabled => warn!("No wake URL configured, backend will not be pinged"),
            Dispatch::Suppressed | Dispatch::Spawned => {}
        }

        let href = bypass_href(&path, query.as_deref(), self.classifier.bypass_param());
        let status = self.show_status.then_some(decision.origin_status);
        waiting_page_response(self.waiting_page.render(&href, status))
    }

    async fn forward(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        match tokio::time::timeout(self.request_timeout, self.pool.send_request(req)).await {
            Ok(Ok(response)) => {
                debug!(status = response.status().as_u16(), "Origin responded");
                response
            }
            Ok(Err(PoolError::RequestBuild(e))) => {
                error!(error = %e, "Failed to build origin request");
                json_error_response(ProxyErrorCode::InvalidOriginRequest, e)
            }
            Ok(Err(e)) => {
                warn!(origin = %self.pool.origin(), error = %e, "Origin unreachable");
                json_error_response(ProxyErrorCode::OriginUnreachable, UNREACHABLE_MESSAGE)
            }
            Err(_) => {
                warn!(
                    origin = %self.pool.origin(),
                    timeout_secs = self.request_timeout.as_secs(),
                    "Origin request timed out"
                );
                json_error_response(ProxyErrorCode::OriginTimeout, UNREACHABLE_MESSAGE)
            }
        }
    }
}

fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

fn health_response() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain")
        .body(full_body("OK"))
        .expect("valid response builder")
}

fn waiting_page_response(html: String) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .header(CACHE_CONTROL, "no-store")
        .body(full_body(html))
        .expect("valid response builder")
}

/// Listener that feeds accepted connections to a [`Gateway`]
pub struct ProxyServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, gateway: Arc<Gateway>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = if self.tls_enabled() { "HTTPS" } else { "HTTP" };
        info!(
            addr = %local_addr,
            protocol,
            origin = %self.gateway.pool().origin(),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            let tls_acceptor = self.tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, gateway).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, gateway).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, gateway: Arc<Gateway>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move {
            let (parts, body) = req.into_parts();
            let req = Request::from_parts(parts, body.boxed());
            Ok::<_, Infallible>(gateway.handle(req).await)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
