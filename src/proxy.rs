//! Embedded reverse proxy backend
//!
//! One in-process listener per distinct `ip:port` in the routing table. Each
//! listener owns a [`ServerMap`] that [`Listener::bind`] swaps atomically, so a
//! push never interrupts in-flight requests. HTTP listeners speak HTTP/1.1 and
//! HTTP/2 (optionally over TLS); stream listeners pipe raw TCP to the first
//! wildcard app.

use crate::config::{HealthCheckConfig, ProxyConfig};
use crate::descriptor::{AppKind, Target};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{PoolConfig, UpstreamClient};
use crate::router::{BackendError, ListenerRoutes, ProxyBackend, RoutingTable};
use async_trait::async_trait;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Largest worker response head accepted for a protocol upgrade
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// One routed application on a listener
#[derive(Debug)]
pub struct AppRoute {
    pub app_id: String,
    /// Path prefix ending in `/`
    pub router: String,
    pub targets: Vec<Target>,
    pub backup: Vec<Target>,
    cursor: AtomicUsize,
}

impl AppRoute {
    pub fn new(app_id: impl Into<String>, router: impl Into<String>, targets: Vec<Target>) -> Self {
        Self {
            app_id: app_id.into(),
            router: router.into(),
            targets,
            backup: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Round-robin over the primary targets, falling back to backups when none remain
    pub fn next_target(&self) -> Option<&Target> {
        let pool = if self.targets.is_empty() {
            &self.backup
        } else {
            &self.targets
        };
        if pool.is_empty() {
            return None;
        }
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        pool.get(n % pool.len())
    }
}

/// Host to apps for one listener
#[derive(Debug, Default)]
pub struct ServerMap {
    /// Apps per server name, most recently registered first
    pub servers: HashMap<String, Vec<Arc<AppRoute>>>,
    pub default_server: Option<String>,
}

impl ServerMap {
    pub fn from_routes(listener: &ListenerRoutes) -> Self {
        let servers = listener
            .servers
            .iter()
            .map(|(name, entries)| {
                let apps = entries
                    .iter()
                    .map(|e| {
                        let mut route = AppRoute::new(&e.app_id, &e.router, e.targets.clone());
                        route.backup = e.backup.clone();
                        Arc::new(route)
                    })
                    .collect();
                (name.to_lowercase(), apps)
            })
            .collect();
        Self {
            servers,
            default_server: listener.default_server.clone(),
        }
    }

    /// Find the app serving `host` and `path`.
    ///
    /// The host's own apps are searched first, then the default server's,
    /// then the wildcard list; the first prefix match wins.
    pub fn resolve(&self, host: Option<&str>, path: &str) -> Option<Arc<AppRoute>> {
        let path = normalize_path(path);
        [host, self.default_server.as_deref(), Some("*")]
            .into_iter()
            .flatten()
            .filter_map(|name| self.servers.get(name))
            .find_map(|apps| apps.iter().find(|app| path.starts_with(&app.router)))
            .cloned()
    }

    /// Continue each app's round-robin rotation from the map being replaced
    pub fn inherit_cursors(&self, previous: &ServerMap) {
        let offsets: HashMap<&str, usize> = previous
            .servers
            .values()
            .flatten()
            .map(|app| (app.app_id.as_str(), app.cursor.load(Ordering::Relaxed)))
            .collect();
        for app in self.servers.values().flatten() {
            if let Some(offset) = offsets.get(app.app_id.as_str()) {
                app.cursor.store(*offset, Ordering::Relaxed);
            }
        }
    }

    /// First wildcard app, the only candidate on stream listeners
    pub fn stream_app(&self) -> Option<Arc<AppRoute>> {
        self.servers.get("*").and_then(|apps| apps.first()).cloned()
    }
}

fn normalize_path(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

/// Request-independent settings shared by every listener
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub trace_id_header: Option<String>,
    pub request_timeout: Duration,
    pub health_check: HealthCheckConfig,
    pub index: Option<String>,
}

impl ProxySettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            trace_id_header: config.trace_id_header.as_ref().map(|h| h.to_lowercase()),
            request_timeout: config.request_timeout(),
            health_check: config.health_check.clone(),
            index: config.index.clone(),
        }
    }
}

/// What a listener needs that cannot change without rebinding
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListenerSpec {
    addr: SocketAddr,
    kind: AppKind,
    tls: Option<(String, String)>,
}

/// A running listener
pub struct Listener {
    spec: ListenerSpec,
    local_addr: SocketAddr,
    routes: Arc<RwLock<Arc<ServerMap>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Listener {
    /// Atomically replace the routing map
    pub fn bind(&self, map: ServerMap) {
        let mut routes = self.routes.write();
        map.inherit_cursors(&routes);
        *routes = Arc::new(map);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct Staged {
    specs: BTreeMap<String, ListenerSpec>,
    maps: BTreeMap<String, ServerMap>,
    acceptors: HashMap<String, TlsAcceptor>,
}

/// In-process reverse proxy implementing [`ProxyBackend`]
pub struct EmbeddedBackend {
    settings: Arc<ProxySettings>,
    client: Arc<UpstreamClient>,
    listeners: tokio::sync::Mutex<BTreeMap<String, Listener>>,
    staged: Mutex<Option<Staged>>,
    /// Table rendered but not yet committed
    pending: Mutex<Option<RoutingTable>>,
    committed: Mutex<Option<RoutingTable>>,
}

impl EmbeddedBackend {
    pub fn new(config: &ProxyConfig) -> Self {
        let pool = PoolConfig {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
        };
        Self {
            settings: Arc::new(ProxySettings::from_config(config)),
            client: Arc::new(UpstreamClient::new(pool)),
            listeners: tokio::sync::Mutex::new(BTreeMap::new()),
            staged: Mutex::new(None),
            pending: Mutex::new(None),
            committed: Mutex::new(None),
        }
    }

    /// Bound address of the listener for `ip:port`
    pub async fn local_addr(&self, listener_id: &str) -> Option<SocketAddr> {
        self.listeners
            .lock()
            .await
            .get(listener_id)
            .map(Listener::local_addr)
    }

    pub async fn listener_ids(&self) -> Vec<String> {
        self.listeners.lock().await.keys().cloned().collect()
    }

    async fn start_listener(
        &self,
        spec: ListenerSpec,
        map: ServerMap,
        acceptor: Option<TlsAcceptor>,
    ) -> std::io::Result<Listener> {
        let tcp = TcpListener::bind(spec.addr).await?;
        let local_addr = tcp.local_addr()?;
        let routes = Arc::new(RwLock::new(Arc::new(map)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        match spec.kind {
            AppKind::Stream => {
                info!(addr = %local_addr, "Stream listener started");
                tokio::spawn(run_stream(tcp, Arc::clone(&routes), shutdown_rx));
            }
            _ => {
                let protocol = if acceptor.is_some() { "HTTPS" } else { "HTTP" };
                info!(addr = %local_addr, protocol, "Proxy listener started (HTTP/1.1 and HTTP/2)");
                tokio::spawn(run_http(
                    tcp,
                    Arc::clone(&routes),
                    Arc::clone(&self.settings),
                    Arc::clone(&self.client),
                    acceptor,
                    shutdown_rx,
                ));
            }
        }

        Ok(Listener {
            spec,
            local_addr,
            routes,
            shutdown_tx,
        })
    }

    fn stage(&self, table: &RoutingTable) -> Result<Staged, BackendError> {
        let mut specs = BTreeMap::new();
        let mut maps = BTreeMap::new();
        for (id, listener) in &table.listeners {
            let addr: SocketAddr = id
                .parse()
                .map_err(|e| BackendError::Render(format!("invalid listen address {}: {}", id, e)))?;
            specs.insert(
                id.clone(),
                ListenerSpec {
                    addr,
                    kind: listener.kind,
                    tls: listener.tls_files(),
                },
            );
            maps.insert(id.clone(), ServerMap::from_routes(listener));
        }
        Ok(Staged {
            specs,
            maps,
            acceptors: HashMap::new(),
        })
    }

    /// Apply staged routes: rebinding listeners whose spec changed, swapping maps on the rest
    async fn apply(&self, mut staged: Staged) -> Result<(), BackendError> {
        let mut listeners = self.listeners.lock().await;

        let removed: Vec<String> = listeners
            .iter()
            .filter(|(id, l)| staged.specs.get(*id) != Some(&l.spec))
            .map(|(id, _)| id.clone())
            .collect();
        for id in removed {
            if let Some(listener) = listeners.remove(&id) {
                listener.stop();
                info!(listener = %id, "Listener stopped");
            }
        }

        for (id, spec) in std::mem::take(&mut staged.specs) {
            let map = staged.maps.remove(&id).unwrap_or_default();
            match listeners.get(&id) {
                Some(listener) => listener.bind(map),
                None => {
                    let acceptor = staged.acceptors.remove(&id);
                    let listener = self
                        .start_listener(spec, map, acceptor)
                        .await
                        .map_err(|e| BackendError::Commit(format!("failed to listen on {}: {}", id, e)))?;
                    listeners.insert(id, listener);
                }
            }
        }
        Ok(())
    }

    fn load_acceptors(staged: &mut Staged) -> Result<(), BackendError> {
        for (id, spec) in &staged.specs {
            if let Some((cert, key)) = &spec.tls {
                let acceptor = tls_acceptor(cert, key)
                    .map_err(|e| BackendError::Validate(format!("{}: {}", id, e)))?;
                staged.acceptors.insert(id.clone(), acceptor);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProxyBackend for EmbeddedBackend {
    fn name(&self) -> &'static str {
        "embedded"
    }

    async fn render(&self, table: &RoutingTable) -> Result<(), BackendError> {
        let staged = self.stage(table)?;
        *self.staged.lock() = Some(staged);
        *self.pending.lock() = Some(table.clone());
        Ok(())
    }

    async fn validate(&self) -> Result<(), BackendError> {
        let mut guard = self.staged.lock();
        let staged = guard
            .as_mut()
            .ok_or_else(|| BackendError::Validate("nothing staged".to_string()))?;
        Self::load_acceptors(staged)
    }

    async fn commit(&self) -> Result<(), BackendError> {
        let staged = self
            .staged
            .lock()
            .take()
            .ok_or_else(|| BackendError::Commit("nothing staged".to_string()))?;
        self.apply(staged).await?;
        let table = self.pending.lock().take();
        *self.committed.lock() = table;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), BackendError> {
        self.staged.lock().take();
        // a pending table means commit never finished, listeners may be half-applied
        if self.pending.lock().take().is_none() {
            return Ok(());
        }
        let previous = self.committed.lock().clone().unwrap_or_default();
        let mut staged = self.stage(&previous).map_err(|e| BackendError::Rollback(e.to_string()))?;
        Self::load_acceptors(&mut staged).map_err(|e| BackendError::Rollback(e.to_string()))?;
        self.apply(staged)
            .await
            .map_err(|e| BackendError::Rollback(e.to_string()))
    }

    async fn shutdown(&self) {
        let mut listeners = self.listeners.lock().await;
        for (id, listener) in std::mem::take(&mut *listeners) {
            listener.stop();
            debug!(listener = %id, "Listener stopped");
        }
    }
}

fn tls_acceptor(cert: &str, key: &str) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert)?;
    let key = load_key(key)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path)
}

async fn run_http(
    listener: TcpListener,
    routes: Arc<RwLock<Arc<ServerMap>>>,
    settings: Arc<ProxySettings>,
    client: Arc<UpstreamClient>,
    tls_acceptor: Option<TlsAcceptor>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let routes = Arc::clone(&routes);
                        let settings = Arc::clone(&settings);
                        let client = Arc::clone(&client);
                        let tls_acceptor = tls_acceptor.clone();

                        tokio::spawn(async move {
                            if let Some(acceptor) = tls_acceptor {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        if let Err(e) = handle_connection(tls_stream, addr, routes, settings, client, true).await {
                                            debug!(addr = %addr, error = %e, "TLS connection error");
                                        }
                                    }
                                    Err(e) => {
                                        debug!(addr = %addr, error = %e, "TLS handshake failed");
                                    }
                                }
                            } else if let Err(e) = handle_connection(stream, addr, routes, settings, client, false).await {
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
                    break;
                }
            }
        }
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    routes: Arc<RwLock<Arc<ServerMap>>>,
    settings: Arc<ProxySettings>,
    client: Arc<UpstreamClient>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        // snapshot so one request sees one consistent map
        let map = Arc::clone(&*routes.read());
        let settings = Arc::clone(&settings);
        let client = Arc::clone(&client);
        async move { handle_request(req, map, settings, client, addr, is_tls).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    map: Arc<ServerMap>,
    settings: Arc<ProxySettings>,
    client: Arc<UpstreamClient>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<ProxyResponse, hyper::Error> {
    let request_id = settings
        .trace_id_header
        .as_deref()
        .and_then(|h| req.headers().get(h))
        .or_else(|| req.headers().get(X_REQUEST_ID))
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let hostname = extract_hostname(&req);
    let path = req.uri().path().to_string();

    // Overwrite rather than append: this proxy is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    debug!(hostname = ?hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let Some(app) = map.resolve(hostname.as_deref(), &path) else {
        return Ok(fallback_response(&settings, &path).await);
    };
    let Some(target) = app.next_target().cloned() else {
        return Ok(json_error_response(
            ProxyErrorCode::NoTargets,
            "Application has no live workers",
        ));
    };

    if is_upgrade_request(&req) {
        return handle_upgrade(req, app.app_id.clone(), target, request_id).await;
    }

    let result = tokio::time::timeout(settings.request_timeout, client.send(req, &target)).await;
    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(app_id = %app.app_id, target = %target, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
        Err(_) => {
            warn!(
                app_id = %app.app_id,
                target = %target,
                timeout_secs = settings.request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    settings.request_timeout.as_secs()
                ),
            ))
        }
    }
}

/// Health check, index redirect, or 404 when no app matches
async fn fallback_response(settings: &ProxySettings, path: &str) -> ProxyResponse {
    if path == settings.health_check.router {
        if let Ok(body) = tokio::fs::read(&settings.health_check.file).await {
            return Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "text/html")
                .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
                .expect("valid response builder");
        }
    }
    if path == "/" {
        if let Some(index) = &settings.index {
            if let Ok(location) = HeaderValue::from_str(index) {
                return Response::builder()
                    .status(StatusCode::MOVED_PERMANENTLY)
                    .header(hyper::header::LOCATION, location)
                    .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
                    .expect("valid response builder");
            }
        }
    }
    json_error_response(ProxyErrorCode::RouteNotFound, "No application matches this request")
}

fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())
        .and_then(|h| {
            let hostname = h.split(':').next()?;
            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }
            // alphanumeric, hyphen and dot only, keeps hosts out of log injection
            if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
                return None;
            }
            Some(hostname.to_lowercase())
        })
}

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Raw HTTP/1.1 upgrade request for the worker
fn build_upgrade_request<B>(req: &Request<B>, target: &Target) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    let host = match target {
        Target::Port(port) => format!("127.0.0.1:{}", port),
        Target::Sock(_) => "localhost".to_string(),
    };
    request.push_str(&format!("Host: {}\r\n\r\n", host));
    request.into_bytes()
}

/// Parse the worker's response head: status and headers
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let code = status_line.split(' ').nth(1)?.parse::<u16>().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Some((status, headers))
}

async fn handle_upgrade(
    req: Request<Incoming>,
    app_id: String,
    target: Target,
    request_id: String,
) -> Result<ProxyResponse, hyper::Error> {
    let raw_request = build_upgrade_request(&req, &target);
    match &target {
        Target::Port(port) => match TcpStream::connect(("127.0.0.1", *port)).await {
            Ok(stream) => upgrade_over(req, stream, raw_request, app_id, request_id).await,
            Err(e) => Ok(upgrade_connect_failed(&app_id, &target, e)),
        },
        Target::Sock(path) => match UnixStream::connect(path).await {
            Ok(stream) => upgrade_over(req, stream, raw_request, app_id, request_id).await,
            Err(e) => Ok(upgrade_connect_failed(&app_id, &target, e)),
        },
    }
}

fn upgrade_connect_failed(app_id: &str, target: &Target, e: std::io::Error) -> ProxyResponse {
    error!(app_id, target = %target, error = %e, "Failed to connect to worker for upgrade");
    json_error_response(
        ProxyErrorCode::ConnectionFailed,
        format!("Failed to connect to backend: {}", e),
    )
}

async fn upgrade_over<S>(
    req: Request<Incoming>,
    mut upstream: S,
    raw_request: Vec<u8>,
    app_id: String,
    request_id: String,
) -> Result<ProxyResponse, hyper::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if let Err(e) = upstream.write_all(&raw_request).await {
        error!(app_id, error = %e, "Failed to send upgrade request to worker");
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            format!("Failed to send upgrade request: {}", e),
        ));
    }

    let (head, trailing) = match read_upgrade_head(&mut upstream).await {
        Ok(read) => read,
        Err(e) => {
            error!(app_id, error = %e, "Failed to read upgrade response from worker");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to read backend response: {}", e),
            ));
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            "Invalid upgrade response from backend",
        ));
    };

    let mut response = Response::builder().status(status);
    for (name, value) in &response_headers {
        let lower = name.to_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(app_id, status = %status, "Worker rejected upgrade request");
        return Ok(response);
    }

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => pipe_upgraded(upgraded, upstream, trailing, &app_id, &request_id).await,
            Err(e) => error!(app_id, error = %e, "Failed to upgrade client connection"),
        }
    });

    Ok(response)
}

/// Read the worker's response head up to the blank line, returning it along
/// with any bytes the worker sent right after it
async fn read_upgrade_head<S>(upstream: &mut S) -> std::io::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = upstream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection",
            ));
        }
        // the terminator may straddle two reads
        let scan_from = head.len().saturating_sub(3);
        head.extend_from_slice(&chunk[..n]);
        if let Some(pos) = head[scan_from..].windows(4).position(|w| w == b"\r\n\r\n") {
            let trailing = head.split_off(scan_from + pos + 4);
            return Ok((head, trailing));
        }
        if head.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
    }
}

async fn pipe_upgraded<S>(
    client: Upgraded,
    mut upstream: S,
    trailing: Vec<u8>,
    app_id: &str,
    request_id: &str,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_io = TokioIo::new(client);
    if !trailing.is_empty() {
        if let Err(e) = client_io.write_all(&trailing).await {
            debug!(app_id, request_id, error = %e, "Client went away before upgrade completed");
            return;
        }
    }
    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream).await {
        Ok((to_worker, to_client)) => {
            debug!(app_id, request_id, to_worker, to_client, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(app_id, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

async fn run_stream(
    listener: TcpListener,
    routes: Arc<RwLock<Arc<ServerMap>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((mut inbound, addr)) => {
                        let app = routes.read().stream_app();
                        tokio::spawn(async move {
                            let Some(app) = app else {
                                debug!(addr = %addr, "No stream app bound, closing");
                                return;
                            };
                            let Some(target) = app.next_target().cloned() else {
                                debug!(app_id = %app.app_id, "Stream app has no targets");
                                return;
                            };
                            let copied = match &target {
                                Target::Port(port) => match TcpStream::connect(("127.0.0.1", *port)).await {
                                    Ok(mut upstream) => tokio::io::copy_bidirectional(&mut inbound, &mut upstream).await,
                                    Err(e) => Err(e),
                                },
                                Target::Sock(path) => match UnixStream::connect(path).await {
                                    Ok(mut upstream) => tokio::io::copy_bidirectional(&mut inbound, &mut upstream).await,
                                    Err(e) => Err(e),
                                },
                            };
                            if let Err(e) = copied {
                                debug!(app_id = %app.app_id, target = %target, error = %e, "Stream connection ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept stream connection"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
