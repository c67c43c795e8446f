//! HTTP API server module.
//!
//! Exposes every analysis module as `POST /<module-id>`. The body carries
//! the provider configuration, an optional threshold and an optional
//! listener filter:
//!
//! ```json
//! {"config": {"host": "example.com"}, "threshold": 80, "except_listeners": ["slack"]}
//! ```
//!
//! Input errors answer 400, analysis failures 500. Listeners are only
//! notified after a 200 has been produced, in a background task.

use crate::error::{InputError, RegistryError, RunError, ServerError};
use crate::models::{ModuleDescriptor, ModuleKind, ProviderConfig, Report, Service};
use crate::modules::{AnalysisModule, ListenerModule, Module, ModuleRegistry, ServerModule};
use crate::orchestrator::{ListenerFilter, Orchestrator};
use crate::polling::AnalysisContext;
use crate::report::ReportView;
use async_trait::async_trait;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Pause after the first failed `accept`, doubled per consecutive failure.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Origins allowed to call the API from a browser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorsConfig {
    /// Exact origins, or `"*"` for any.
    pub allowed_origins: Vec<String>,
}

impl CorsConfig {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        Self { allowed_origins }
    }

    /// Value of `Access-Control-Allow-Origin` for a request's `Origin`.
    pub fn allow_origin(&self, origin: Option<&str>) -> Option<HeaderValue> {
        if self.allowed_origins.iter().any(|o| o == "*") {
            return Some(HeaderValue::from_static("*"));
        }
        let origin = origin?;
        if self.allowed_origins.iter().any(|o| o == origin) {
            HeaderValue::from_str(origin).ok()
        } else {
            None
        }
    }
}

/// Lifecycle notifications of a running server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Listening(SocketAddr),
    Error(String),
}

/// A running server. Dropping the handle stops accepting connections.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next lifecycle event; `None` once the server stopped.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// Stop accepting connections, then wait for in-flight requests and
    /// the listener notifications they started.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            error!("Server task failed: {}", e);
        }
    }
}

/// Body of `POST /<module-id>`.
#[derive(Debug, Deserialize)]
struct AnalysisRequest {
    config: ProviderConfig,
    #[serde(default)]
    threshold: Option<f64>,
    #[serde(default)]
    except_listeners: Option<Vec<String>>,
    #[serde(default)]
    only_listeners: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

/// Fan-out owed once a response has been sent.
struct Notification {
    report: Arc<Report>,
    filter: ListenerFilter,
}

struct Handled {
    response: Response<Full<Bytes>>,
    notification: Option<Notification>,
}

impl From<Response<Full<Bytes>>> for Handled {
    fn from(response: Response<Full<Bytes>>) -> Self {
        Self {
            response,
            notification: None,
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let (status, json) = match serde_json::to_vec(body) {
        Ok(json) => (status, json),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                br#"{"error":"internal_error","message":"serialization failed"}"#.to_vec(),
            )
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, kind: &str, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(
        status,
        &ErrorBody {
            error: kind,
            message: message.into(),
        },
    )
}

impl From<InputError> for Response<Full<Bytes>> {
    fn from(error: InputError) -> Self {
        debug!("Rejected request: {}", error);
        error_response(StatusCode::BAD_REQUEST, "input_error", error.to_string())
    }
}

impl From<RunError> for Response<Full<Bytes>> {
    fn from(error: RunError) -> Self {
        match error {
            RunError::Input(e) => e.into(),
            RunError::Analysis(e) => {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "analysis_error", e.to_string())
            }
        }
    }
}

/// Connection and notification tasks the server still owes.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<JoinSet<()>>>);

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock();
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                error!("Server task failed: {}", e);
            }
        }
        tasks.spawn(task);
    }

    fn take(&self) -> JoinSet<()> {
        std::mem::take(&mut *self.lock())
    }

    /// Wait for every task, including those spawned while draining.
    async fn drain(&self) {
        loop {
            let mut tasks = self.take();
            if tasks.is_empty() {
                break;
            }
            debug!("Waiting for {} in-flight task(s)", tasks.len());
            while let Some(finished) = tasks.join_next().await {
                if let Err(e) = finished {
                    error!("Server task failed: {}", e);
                }
            }
        }
    }
}

/// Consecutive `accept` failures; only the first of a burst is reported.
#[derive(Debug, Default)]
struct AcceptFailures {
    consecutive: u32,
}

impl AcceptFailures {
    /// Count a failure. True when it starts a new burst.
    fn record(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive == 1
    }

    fn backoff(&self) -> Duration {
        let exponent = self.consecutive.saturating_sub(1).min(16);
        (ACCEPT_BACKOFF * 2u32.pow(exponent)).min(MAX_ACCEPT_BACKOFF)
    }

    fn reset(&mut self) {
        if self.consecutive > 0 {
            info!("Accepting connections again after {} failure(s)", self.consecutive);
        }
        self.consecutive = 0;
    }
}

/// Everything a request handler needs, shared by all connections.
struct ApiState {
    orchestrator: Orchestrator,
    cors: Option<CorsConfig>,
    timeout: Option<Duration>,
    tasks: InFlight,
}

impl ApiState {
    fn new(
        analysis_modules: Vec<Arc<dyn AnalysisModule>>,
        listener_modules: Vec<Arc<dyn ListenerModule>>,
        cors: Option<CorsConfig>,
        timeout: Option<Duration>,
    ) -> Result<Self, RegistryError> {
        let registry = ModuleRegistry::from_modules(analysis_modules, listener_modules)?;
        Ok(Self {
            orchestrator: Orchestrator::new(Arc::new(registry)),
            cors,
            timeout,
            tasks: InFlight::default(),
        })
    }

    async fn handle(&self, method: &Method, path: &str, body: &[u8]) -> Handled {
        if method == Method::OPTIONS {
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::NO_CONTENT;
            return response.into();
        }

        let module_id = path.trim_start_matches('/');
        if module_id.is_empty() || module_id.contains('/') {
            return error_response(StatusCode::NOT_FOUND, "not_found", format!("no route for {}", path))
                .into();
        }

        if method != Method::POST {
            let mut response = error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "method_not_allowed",
                format!("{} is not supported", method),
            );
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("POST, OPTIONS"));
            return response.into();
        }

        match self.analyze(module_id, body).await {
            Ok((report, filter)) => {
                let report = Arc::new(report);
                Handled {
                    response: json_response(StatusCode::OK, &ReportView::from(report.as_ref())),
                    notification: Some(Notification { report, filter }),
                }
            }
            Err(e) => Response::from(e).into(),
        }
    }

    async fn analyze(&self, module_id: &str, body: &[u8]) -> Result<(Report, ListenerFilter), RunError> {
        let request: AnalysisRequest =
            serde_json::from_slice(body).map_err(|e| InputError::Malformed(e.to_string()))?;

        let filter = ListenerFilter::from_options(request.only_listeners, request.except_listeners)?;
        self.orchestrator.validate_filter(&filter)?;

        let ctx = match self.timeout {
            Some(timeout) => AnalysisContext::new().with_timeout(timeout),
            None => AnalysisContext::new(),
        };
        let report = self
            .orchestrator
            .run_analysis(module_id, &request.config, request.threshold, &ctx)
            .await?;

        Ok((report, filter))
    }

    fn apply_cors(&self, origin: Option<&str>, is_preflight: bool, response: &mut Response<Full<Bytes>>) {
        let Some(allowed) = self.cors.as_ref().and_then(|cors| cors.allow_origin(origin)) else {
            return;
        };

        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allowed);
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        if is_preflight {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("POST, OPTIONS"),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("content-type"),
            );
        }
    }
}

async fn handle_request(state: Arc<ApiState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut handled = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(body) => state.handle(&method, &path, &body.to_bytes()).await,
        Err(e) => Response::from(InputError::Malformed(e.to_string())).into(),
    };
    debug!("{} {} -> {}", method, path, handled.response.status());

    state.apply_cors(origin.as_deref(), method == Method::OPTIONS, &mut handled.response);

    if let Some(notification) = handled.notification.take() {
        let orchestrator = state.orchestrator.clone();
        state.tasks.spawn(async move {
            if let Err(e) = orchestrator
                .notify(notification.report, &notification.filter)
                .await
            {
                warn!("Skipped listener notification: {}", e);
            }
        });
    }

    handled.response
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ApiState>,
    events: mpsc::UnboundedSender<ServerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures = AcceptFailures::default();

    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, remote_addr) = match accepted {
            Ok(conn) => {
                failures.reset();
                conn
            }
            Err(e) => {
                if failures.record() {
                    error!("Failed to accept connection: {}", e);
                    let _ = events.send(ServerEvent::Error(e.to_string()));
                } else {
                    debug!("Failed to accept connection ({} in a row): {}", failures.consecutive, e);
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(failures.backoff()) => continue,
                }
            }
        };

        let io = TokioIo::new(stream);
        let tasks = state.tasks.clone();
        let state = Arc::clone(&state);
        let mut shutdown = shutdown.clone();

        tasks.spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(handle_request(state, req).await) }
            });

            let conn = http1::Builder::new().serve_connection(io, service);
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = shutdown.changed() => {
                    conn.as_mut().graceful_shutdown();
                    conn.as_mut().await
                }
            };
            if let Err(err) = result {
                error!("Error serving connection from {}: {}", remote_addr, err);
            }
        });
    }

    drop(listener);
    info!("Server stopped accepting connections");
    state.tasks.drain().await;
    debug!("Server drained");
}

/// The `api` server module.
pub struct ApiServerModule {
    descriptor: ModuleDescriptor,
    timeout: Option<Duration>,
}

impl ApiServerModule {
    pub fn new() -> Self {
        Self {
            descriptor: ModuleDescriptor::new(
                "api",
                "WebGrade API",
                Service::new("WebGrade API"),
                ModuleKind::Server,
            ),
            timeout: None,
        }
    }

    /// Deadline applied to each analysis run through the API.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ApiServerModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for ApiServerModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl ServerModule for ApiServerModule {
    async fn start_server(
        &self,
        analysis_modules: Vec<Arc<dyn AnalysisModule>>,
        listener_modules: Vec<Arc<dyn ListenerModule>>,
        port: u16,
        cors: Option<CorsConfig>,
    ) -> Result<ServerHandle, ServerError> {
        let routes: Vec<String> = analysis_modules.iter().map(|m| format!("/{}", m.id())).collect();
        let state = Arc::new(ApiState::new(
            analysis_modules,
            listener_modules,
            cors,
            self.timeout,
        )?);

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!("WebGrade API listening on http://{}", local_addr);
        info!("Routes: POST {}", routes.join(", POST "));
        let _ = events_tx.send(ServerEvent::Listening(local_addr));

        let task = tokio::spawn(accept_loop(listener, state, events_tx, shutdown_rx));

        Ok(ServerHandle {
            local_addr,
            events: events_rx,
            shutdown: shutdown_tx,
            task,
        })
    }
}
