//! Worker pool supervision for one application id
//!
//! A [`Supervisor`] owns the current generation of workers and, during a
//! reload, the previous one. All state sits behind one synchronous lock that is
//! never held across an await; long waits (boot, reload, graceful stop) are
//! expressed as oneshot completions settled from worker callbacks.

use crate::alloc::{remove_socket_file, AllocError, SharedPortAllocator, SocketNamespace};
use crate::config::{AppManifest, Config, UpstreamMode};
use crate::descriptor::{ApplicationDescriptor, AppKind, ReadyInfo, Target};
use crate::error::ErrorCode;
use crate::error::ErrorReply;
use crate::ipc::{self, Channel, Endpoint, GroupMembers, HandlerRegistry, Message};
use crate::process::{self, LaunchConfig};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Event a worker sends once it is ready to serve
pub const READY_EVENT: &str = "ready";

/// Event a worker sends to classify its own imminent exit
pub const EXIT_REASON_EVENT: &str = "exit_reason";

pub const ONLINE_EVENT: &str = "online";
/// Carries `{"stop": true}` when the worker itself must exit, otherwise the whole server is draining
pub const OFFLINE_EVENT: &str = "offline";

/// Entries kept in the error-exit record
const MAX_ERROR_EXIT_RECORD: usize = 10;

/// Lifecycle state of one application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Init,
    Starting,
    Online,
    Exception,
    Retry,
    Reload,
    Reloaded,
    Stopping,
    Offline,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Init => "init",
            AppStatus::Starting => "starting",
            AppStatus::Online => "online",
            AppStatus::Exception => "exception",
            AppStatus::Retry => "retry",
            AppStatus::Reload => "reload",
            AppStatus::Reloaded => "reloaded",
            AppStatus::Stopping => "stopping",
            AppStatus::Offline => "offline",
        }
    }

    /// Transition table
    pub fn can_transition_to(self, next: AppStatus) -> bool {
        use AppStatus::*;
        match (self, next) {
            (Stopping, Offline) => true,
            (Stopping, _) | (Offline, Stopping) => false,
            (_, Stopping) => true,
            (Init, Starting) | (Offline, Starting) => true,
            (Starting, Online) | (Starting, Exception) | (Starting, Retry) => true,
            (Online, Exception) | (Online, Reload) => true,
            (Exception, Retry) | (Exception, Online) | (Exception, Reload) => true,
            (Retry, Starting) | (Retry, Exception) => true,
            (Reload, Reloaded) | (Reload, Online) | (Reload, Exception) => true,
            (Reloaded, Online) | (Reloaded, Exception) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a worker exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Normal,
    BootTimeout,
    AppInitError,
    AppImplementationError,
    UnknownRuntimeError,
}

impl ExitReason {
    /// Only exits nobody understands are worth another attempt
    pub fn is_retryable(self) -> bool {
        matches!(self, ExitReason::UnknownRuntimeError)
    }
}

/// One abnormal exit, kept for observability
#[derive(Debug, Clone, Serialize)]
pub struct ExitRecord {
    pub time: DateTime<Local>,
    pub pid: u32,
    pub reason: ExitReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SupervisorError {
    #[error("{app_id} is {status}, cannot {operation}")]
    Busy {
        app_id: String,
        status: AppStatus,
        operation: &'static str,
    },
    #[error("failed to spawn worker for {app_id}: {message}")]
    Spawn { app_id: String, message: String },
    #[error("{app_id} did not become ready in time")]
    BootTimeout { app_id: String },
    #[error("{app_id} worker {pid} failed to initialize")]
    AppInit { app_id: String, pid: u32 },
    #[error("{app_id} worker {pid} exited with an implementation error")]
    AppImplementation { app_id: String, pid: u32 },
    #[error("{app_id} worker exited unexpectedly")]
    UnexpectedExit { app_id: String },
    #[error("reload of {app_id} failed: {reason}")]
    ReloadFailed { app_id: String, reason: String },
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error("{app_id} was stopped")]
    Stopped { app_id: String },
}

impl SupervisorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SupervisorError::Busy { .. } | SupervisorError::Stopped { .. } => ErrorCode::ServerBusy,
            SupervisorError::Spawn { .. } => ErrorCode::SpawnError,
            SupervisorError::BootTimeout { .. } => ErrorCode::BootTimeout,
            SupervisorError::AppInit { .. } => ErrorCode::AppInitError,
            SupervisorError::AppImplementation { .. } => ErrorCode::AppImplementationError,
            SupervisorError::UnexpectedExit { .. } => ErrorCode::UnexpectedExit,
            SupervisorError::ReloadFailed { .. } => ErrorCode::ReloadFailed,
            SupervisorError::Alloc(_) => ErrorCode::AllocExhausted,
        }
    }

    fn from_exit(app_id: &str, pid: u32, reason: ExitReason) -> Self {
        let app_id = app_id.to_string();
        match reason {
            ExitReason::BootTimeout => SupervisorError::BootTimeout { app_id },
            ExitReason::AppInitError => SupervisorError::AppInit { app_id, pid },
            ExitReason::AppImplementationError => SupervisorError::AppImplementation { app_id, pid },
            ExitReason::Normal | ExitReason::UnknownRuntimeError => {
                SupervisorError::UnexpectedExit { app_id }
            }
        }
    }
}

/// Notifications a supervisor raises outside of any caller's operation
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// Routed targets changed after the app was online; `None` means no live target remains
    RouteChanged {
        app_id: String,
        descriptor: Option<ApplicationDescriptor>,
    },
}

/// Collaborators shared by every supervisor of one orchestrator
#[derive(Clone)]
pub struct SupervisorContext {
    pub config: Arc<Config>,
    pub channel: Arc<Channel>,
    /// Command handlers served to workers
    pub handlers: Arc<HandlerRegistry>,
    pub ports: SharedPortAllocator,
    pub events: mpsc::UnboundedSender<SupervisorEvent>,
    /// Cluster snapshot handed to workers
    pub cluster: Value,
}

/// Observable state of one supervisor
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorSnapshot {
    pub app_id: String,
    pub status: AppStatus,
    pub pids: Vec<u32>,
    pub expect_worker_num: usize,
    pub worker_num: usize,
    pub ready_worker_num: usize,
    pub exit_count: u64,
    pub error_exit_count: u64,
    pub error_exit_record: Vec<ExitRecord>,
    pub kind: Option<AppKind>,
}

type BootResult = Result<ApplicationDescriptor, SupervisorError>;

struct WorkerHandle {
    pid: u32,
    target: Option<Target>,
    endpoint: Option<Endpoint>,
    ready: bool,
    reported_exit: Option<ExitReason>,
    boot_timed_out: bool,
    stop_requested: bool,
    stop_tx: Option<oneshot::Sender<Duration>>,
    exited: watch::Receiver<bool>,
    boot_timer: Option<JoinHandle<()>>,
}

struct Generation {
    seq: u64,
    slots: Vec<PathBuf>,
    workers: BTreeMap<u32, WorkerHandle>,
    ready_info: Option<ReadyInfo>,
    ready_fired: bool,
}

impl Generation {
    fn new(seq: u64, slots: Vec<PathBuf>) -> Self {
        Self {
            seq,
            slots,
            workers: BTreeMap::new(),
            ready_info: None,
            ready_fired: false,
        }
    }

    fn ready_count(&self) -> usize {
        self.workers.values().filter(|w| w.ready).count()
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        self.workers
            .values()
            .filter_map(|w| w.endpoint.clone())
            .collect()
    }
}

struct Inner {
    status: AppStatus,
    expect_workers: usize,
    current: Generation,
    previous: Option<Generation>,
    previous_descriptor: Option<ApplicationDescriptor>,
    /// Workers asked to stop, kept until their exit is observed
    retiring: HashMap<u32, WorkerHandle>,
    sockets: SocketNamespace,
    next_seq: u64,
    fatal_count: u32,
    exit_count: u64,
    error_exit_count: u64,
    error_exit_record: VecDeque<ExitRecord>,
    descriptor: Option<ApplicationDescriptor>,
    waiter: Option<oneshot::Sender<BootResult>>,
    ready_timer: Option<JoinHandle<()>>,
    retry_timers: Vec<JoinHandle<()>>,
}

impl Inner {
    fn settle(&mut self, result: BootResult) {
        if let Some(tx) = self.waiter.take() {
            let _ = tx.send(result);
        }
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.ready_timer.take() {
            timer.abort();
        }
        for timer in self.retry_timers.drain(..) {
            timer.abort();
        }
    }

    fn find_worker(&mut self, pid: u32) -> Option<&mut WorkerHandle> {
        if let Some(worker) = self.current.workers.get_mut(&pid) {
            return Some(worker);
        }
        self.previous
            .as_mut()
            .and_then(|g| g.workers.get_mut(&pid))
    }

    fn all_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints = self.current.endpoints();
        if let Some(previous) = &self.previous {
            endpoints.extend(previous.endpoints());
        }
        endpoints
    }

    fn record_error_exit(&mut self, record: ExitRecord) {
        self.error_exit_count += 1;
        self.error_exit_record.push_front(record);
        self.error_exit_record.truncate(MAX_ERROR_EXIT_RECORD);
    }
}

/// Supervises the worker pool of one application id
pub struct Supervisor {
    app_id: String,
    dir: PathBuf,
    manifest: AppManifest,
    ctx: SupervisorContext,
    handlers: Arc<HandlerRegistry>,
    inner: Mutex<Inner>,
}

/// Group view over a supervisor's current workers
struct AppGroup(Weak<Supervisor>);

impl GroupMembers for AppGroup {
    fn members(&self) -> Vec<Endpoint> {
        self.0
            .upgrade()
            .map(|sup| sup.inner.lock().current.endpoints())
            .unwrap_or_default()
    }
}

impl Supervisor {
    pub fn new(
        app_id: impl Into<String>,
        dir: impl Into<PathBuf>,
        manifest: AppManifest,
        ctx: SupervisorContext,
    ) -> Arc<Self> {
        let app_id = app_id.into();
        let sockets = SocketNamespace::new(&ctx.config.server.run_dir, &app_id);
        Arc::new_cyclic(|weak: &Weak<Supervisor>| {
            let mut handlers = ctx.handlers.as_ref().clone();
            let ready = weak.clone();
            handlers.on_event(READY_EVENT, move |pid, data| {
                let sup = ready.upgrade();
                async move {
                    match sup {
                        Some(sup) => sup.on_ready_event(pid, data),
                        None => Ok(Value::Null),
                    }
                }
            });
            let exit = weak.clone();
            handlers.on_event(EXIT_REASON_EVENT, move |pid, data| {
                let sup = exit.upgrade();
                async move {
                    match sup {
                        Some(sup) => sup.on_exit_reason(pid, data),
                        None => Ok(Value::Null),
                    }
                }
            });

            Supervisor {
                app_id,
                dir: dir.into(),
                manifest,
                ctx,
                handlers: Arc::new(handlers),
                inner: Mutex::new(Inner {
                    status: AppStatus::Init,
                    expect_workers: 0,
                    current: Generation::new(0, Vec::new()),
                    previous: None,
                    previous_descriptor: None,
                    retiring: HashMap::new(),
                    sockets,
                    next_seq: 1,
                    fatal_count: 0,
                    exit_count: 0,
                    error_exit_count: 0,
                    error_exit_record: VecDeque::new(),
                    descriptor: None,
                    waiter: None,
                    ready_timer: None,
                    retry_timers: Vec::new(),
                }),
            }
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn status(&self) -> AppStatus {
        self.inner.lock().status
    }

    /// Descriptor of the current generation once it is ready
    pub fn descriptor(&self) -> Option<ApplicationDescriptor> {
        self.inner.lock().descriptor.clone()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.inner.lock().current.workers.keys().copied().collect()
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        let inner = self.inner.lock();
        SupervisorSnapshot {
            app_id: self.app_id.clone(),
            status: inner.status,
            pids: inner.current.workers.keys().copied().collect(),
            expect_worker_num: inner.expect_workers,
            worker_num: inner.current.workers.len(),
            ready_worker_num: inner.current.ready_count(),
            exit_count: inner.exit_count,
            error_exit_count: inner.error_exit_count,
            error_exit_record: inner.error_exit_record.iter().cloned().collect(),
            kind: inner.descriptor.as_ref().map(|d| d.kind),
        }
    }

    /// Forget recorded exits and reset the retry window
    pub fn clean_exit_record(&self) {
        let mut inner = self.inner.lock();
        inner.error_exit_record.clear();
        inner.exit_count = 0;
        inner.error_exit_count = 0;
        inner.fatal_count = 0;
    }

    fn transition(&self, inner: &mut Inner, next: AppStatus) -> bool {
        if inner.status == next {
            return true;
        }
        if !inner.status.can_transition_to(next) {
            warn!(app_id = %self.app_id, from = %inner.status, to = %next, "Illegal status transition");
            return false;
        }
        debug!(app_id = %self.app_id, from = %inner.status, to = %next, "Status transition");
        inner.status = next;
        true
    }

    fn busy(&self, inner: &Inner, operation: &'static str) -> SupervisorError {
        SupervisorError::Busy {
            app_id: self.app_id.clone(),
            status: inner.status,
            operation,
        }
    }

    /// Bring the pool to `processor_num` workers and wait until all are ready
    pub async fn start(self: &Arc<Self>, processor_num: usize) -> BootResult {
        let processor_num = processor_num.max(1);
        let rx = {
            let mut inner = self.inner.lock();
            match inner.status {
                AppStatus::Online => {
                    inner.expect_workers = processor_num;
                    let missing = processor_num.saturating_sub(inner.current.workers.len());
                    for _ in 0..missing {
                        self.spawn_one(&mut inner)?;
                    }
                    if let Some(descriptor) = inner.descriptor.clone() {
                        return Ok(descriptor);
                    }
                    return Err(self.busy(&inner, "start"));
                }
                AppStatus::Init | AppStatus::Offline => {}
                _ => return Err(self.busy(&inner, "start")),
            }

            self.transition(&mut inner, AppStatus::Starting);
            inner.expect_workers = processor_num;
            inner.fatal_count = 0;
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let slots = self.reserve_slots(&mut inner, processor_num);
            inner.current = Generation::new(seq, slots);

            let (tx, rx) = oneshot::channel();
            inner.waiter = Some(tx);
            self.ctx
                .channel
                .bind_group(self.app_id.clone(), Arc::new(AppGroup(Arc::downgrade(self))));

            for _ in 0..processor_num {
                if let Err(e) = self.spawn_one(&mut inner) {
                    error!(app_id = %self.app_id, error = %e, "Failed to start worker");
                    inner.waiter = None;
                    self.transition(&mut inner, AppStatus::Exception);
                    return Err(e);
                }
            }
            self.arm_ready_timer(&mut inner, seq);
            rx
        };

        info!(app_id = %self.app_id, processor_num, "Waiting for workers to become ready");
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::Stopped {
                app_id: self.app_id.clone(),
            }),
        }
    }

    /// Swap in a fresh generation of workers.
    ///
    /// Resolves once the new generation is fully ready; the old generation
    /// keeps serving until [`complete_reload`](Self::complete_reload) runs.
    pub async fn reload(self: &Arc<Self>) -> BootResult {
        let armed = {
            let mut inner = self.inner.lock();
            if !matches!(inner.status, AppStatus::Online | AppStatus::Exception) {
                return Err(self.busy(&inner, "reload"));
            }
            inner.cancel_timers();
            self.transition(&mut inner, AppStatus::Reload);
            inner.fatal_count = 0;

            let size = inner.expect_workers.max(1);
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let slots = self.reserve_slots(&mut inner, size);
            let old = std::mem::replace(&mut inner.current, Generation::new(seq, slots));
            inner.previous = Some(old);
            inner.previous_descriptor = inner.descriptor.take();

            let (tx, rx) = oneshot::channel();
            inner.waiter = Some(tx);

            let spawned: Result<(), SupervisorError> =
                (0..size).try_for_each(|_| self.spawn_one(&mut inner).map(|_| ()));
            match spawned {
                Ok(()) => {
                    self.arm_ready_timer(&mut inner, seq);
                    info!(app_id = %self.app_id, generation = seq, "Reloading workers");
                    Ok(rx)
                }
                Err(e) => {
                    inner.waiter = None;
                    Err(e)
                }
            }
        };
        let rx = match armed {
            Ok(rx) => rx,
            Err(e) => {
                self.rollback_reload().await;
                return Err(SupervisorError::ReloadFailed {
                    app_id: self.app_id.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let outcome = match rx.await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::Stopped {
                app_id: self.app_id.clone(),
            }),
        };
        match outcome {
            Ok(descriptor) => Ok(descriptor),
            Err(e) => {
                warn!(app_id = %self.app_id, error = %e, "New generation failed, rolling back");
                self.rollback_reload().await;
                Err(SupervisorError::ReloadFailed {
                    app_id: self.app_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Finish a reload once the router has (or has not) accepted the new descriptor
    pub async fn complete_reload(self: &Arc<Self>, router_updated: bool) {
        if !router_updated {
            self.rollback_reload().await;
            return;
        }
        let previous = {
            let mut inner = self.inner.lock();
            if inner.status != AppStatus::Reloaded {
                warn!(app_id = %self.app_id, status = %inner.status, "No reload to complete");
                return;
            }
            self.transition(&mut inner, AppStatus::Online);
            inner.previous_descriptor = None;
            inner.previous.take()
        };
        if let Some(previous) = previous {
            info!(app_id = %self.app_id, generation = previous.seq, "Retiring previous generation");
            self.stop_generation(previous).await;
        }
    }

    /// Kill the new generation and put the previous one back in charge
    async fn rollback_reload(self: &Arc<Self>) {
        let exited = {
            let mut inner = self.inner.lock();
            let Some(previous) = inner.previous.take() else {
                return;
            };
            if let Some(timer) = inner.ready_timer.take() {
                timer.abort();
            }
            let failed = std::mem::replace(&mut inner.current, previous);
            inner.descriptor = inner.previous_descriptor.take();
            inner.settle(Err(SupervisorError::ReloadFailed {
                app_id: self.app_id.clone(),
                reason: "rolled back".to_string(),
            }));
            if !matches!(inner.status, AppStatus::Stopping | AppStatus::Offline) {
                inner.status = AppStatus::Online;
            }
            self.remove_slots(&failed);
            failed
                .workers
                .into_values()
                .map(|w| self.retire(&mut inner, w, Duration::ZERO))
                .collect::<Vec<_>>()
        };
        info!(app_id = %self.app_id, killed = exited.len(), "Reload rolled back");
        wait_all(exited).await;
    }

    /// Stop every worker and end in `offline`
    pub async fn stop(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let endpoints = {
            let mut inner = self.inner.lock();
            match inner.status {
                AppStatus::Offline => return Ok(()),
                AppStatus::Stopping => return Err(self.busy(&inner, "stop")),
                _ => {}
            }
            self.transition(&mut inner, AppStatus::Stopping);
            inner.cancel_timers();
            inner.settle(Err(SupervisorError::Stopped {
                app_id: self.app_id.clone(),
            }));
            inner.all_endpoints()
        };
        self.ctx.channel.unbind_group(&self.app_id);
        info!(app_id = %self.app_id, workers = endpoints.len(), "Stopping application");

        self.notify_offline(&endpoints).await;

        let grace = self.ctx.config.supervisor.force_kill_timeout();
        let (exited, generations) = {
            let mut inner = self.inner.lock();
            let current = std::mem::replace(&mut inner.current, Generation::new(0, Vec::new()));
            let mut generations = vec![current];
            generations.extend(inner.previous.take());
            let mut exited = Vec::new();
            for generation in &mut generations {
                let workers = std::mem::take(&mut generation.workers);
                for worker in workers.into_values() {
                    exited.push(self.retire(&mut inner, worker, grace));
                }
            }
            (exited, generations)
        };
        wait_all(exited).await;

        for generation in &generations {
            self.remove_slots(generation);
        }

        let mut inner = self.inner.lock();
        inner.descriptor = None;
        inner.previous_descriptor = None;
        self.transition(&mut inner, AppStatus::Offline);
        info!(app_id = %self.app_id, "Application offline");
        Ok(())
    }

    /// Gracefully stop a generation that is no longer current
    async fn stop_generation(self: &Arc<Self>, mut generation: Generation) {
        self.notify_offline(&generation.endpoints()).await;
        let grace = self.ctx.config.supervisor.force_kill_timeout();
        let exited = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut generation.workers)
                .into_values()
                .map(|w| self.retire(&mut inner, w, grace))
                .collect::<Vec<_>>()
        };
        wait_all(exited).await;
        self.remove_slots(&generation);
    }

    async fn notify_offline(&self, endpoints: &[Endpoint]) {
        let timeout = self.ctx.config.supervisor.offline_ack_timeout();
        let notices = endpoints.iter().map(|endpoint| {
            let message = Message::event(OFFLINE_EVENT, serde_json::json!({ "stop": true }))
                .with_timeout(timeout);
            async move {
                if let Err(e) = self.ctx.channel.send(endpoint, message).await {
                    debug!(app_id = %self.app_id, pid = endpoint.pid(), error = %e, "Offline notice not acknowledged");
                }
            }
        });
        futures::future::join_all(notices).await;
    }

    /// Ask a worker to exit and park its handle until the exit is observed
    fn retire(&self, inner: &mut Inner, mut worker: WorkerHandle, grace: Duration) -> watch::Receiver<bool> {
        worker.stop_requested = true;
        if let Some(timer) = worker.boot_timer.take() {
            timer.abort();
        }
        if let Some(tx) = worker.stop_tx.take() {
            let _ = tx.send(grace);
        }
        let exited = worker.exited.clone();
        inner.retiring.insert(worker.pid, worker);
        exited
    }

    /// Probe a running application
    pub async fn health(&self) -> bool {
        let (status, target) = {
            let inner = self.inner.lock();
            let target = inner
                .current
                .workers
                .values()
                .find(|w| w.ready)
                .and_then(|w| w.target.clone());
            (inner.status, target)
        };
        if matches!(
            status,
            AppStatus::Init
                | AppStatus::Exception
                | AppStatus::Retry
                | AppStatus::Stopping
                | AppStatus::Offline
        ) {
            return false;
        }
        let Some(service) = &self.manifest.service else {
            return true;
        };
        let Some(target) = target else {
            return false;
        };
        let path = service.health_path.as_deref().unwrap_or("/");
        process::check_health(&target, path).await.unwrap_or(false)
    }

    fn launch_config(&self) -> LaunchConfig {
        let server = &self.ctx.config.server;
        LaunchConfig {
            entry: PathBuf::new(),
            app_id: self.app_id.clone(),
            app_root: self.dir.clone(),
            config: self.manifest.config_json(),
            server_root: server.server_root.clone(),
            log_root: server.logs_root.clone(),
            cluster: self.ctx.cluster.clone(),
            target_sock: None,
            target_port: None,
        }
    }

    fn reserve_slots(&self, inner: &mut Inner, size: usize) -> Vec<PathBuf> {
        match self.manifest.upstream {
            UpstreamMode::Sock => inner.sockets.next_generation(size),
            UpstreamMode::Port => Vec::new(),
        }
    }

    fn remove_slots(&self, generation: &Generation) {
        for slot in &generation.slots {
            remove_socket_file(slot);
        }
    }

    fn allocate_target(&self, inner: &mut Inner) -> Result<Target, SupervisorError> {
        match self.manifest.upstream {
            UpstreamMode::Port => Ok(Target::Port(self.ctx.ports.lock().allocate()?)),
            UpstreamMode::Sock => {
                let picked = {
                    let in_use: HashSet<&Path> = inner
                        .current
                        .workers
                        .values()
                        .filter_map(|w| match &w.target {
                            Some(Target::Sock(p)) => Some(p.as_path()),
                            _ => None,
                        })
                        .collect();
                    inner
                        .sockets
                        .pick(&inner.current.slots, &in_use)
                        .map(Path::to_path_buf)
                };
                let path = match picked {
                    Ok(path) => path,
                    Err(_) => {
                        // pool grew past the generation's reservation
                        let extra = inner.sockets.next_generation(1);
                        inner.current.slots.extend(extra.iter().cloned());
                        extra.into_iter().next().ok_or_else(|| AllocError::SocketsExhausted {
                            app_id: self.app_id.clone(),
                        })?
                    }
                };
                remove_socket_file(&path);
                Ok(Target::Sock(path))
            }
        }
    }

    fn release_target(&self, target: &Option<Target>) {
        match target {
            Some(Target::Port(port)) => self.ctx.ports.lock().release(*port),
            Some(Target::Sock(path)) => remove_socket_file(path),
            None => {}
        }
    }

    /// Spawn one worker into the current generation
    fn spawn_one(self: &Arc<Self>, inner: &mut Inner) -> Result<u32, SupervisorError> {
        let seq = inner.current.seq;
        let target = self.allocate_target(inner)?;
        let launch = self.launch_config().with_target(Some(&target));

        let spawned = match process::spawn_worker(&self.manifest, &launch) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.release_target(&Some(target));
                return Err(SupervisorError::Spawn {
                    app_id: self.app_id.clone(),
                    message: e.to_string(),
                });
            }
        };
        let pid = spawned.pid;

        let endpoint = match spawned.link {
            Some(link) => {
                let endpoint = link.endpoint.clone();
                tokio::spawn(ipc::pump(
                    Arc::clone(&self.ctx.channel),
                    link.inbound,
                    link.endpoint,
                    Arc::clone(&self.handlers),
                ));
                Some(endpoint)
            }
            None => {
                tokio::spawn(probe_service(Arc::downgrade(self), pid, target.clone()));
                None
            }
        };

        let boot_timeout = self.ctx.config.supervisor.boot_timeout();
        let weak = Arc::downgrade(self);
        let boot_timer = tokio::spawn(async move {
            tokio::time::sleep(boot_timeout).await;
            if let Some(sup) = weak.upgrade() {
                sup.on_boot_timeout(pid);
            }
        });

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        tokio::spawn(monitor(
            Arc::downgrade(self),
            self.app_id.clone(),
            pid,
            spawned.child,
            stop_rx,
            exited_tx,
        ));

        inner.current.workers.insert(
            pid,
            WorkerHandle {
                pid,
                target: Some(target),
                endpoint,
                ready: false,
                reported_exit: None,
                boot_timed_out: false,
                stop_requested: false,
                stop_tx: Some(stop_tx),
                exited: exited_rx,
                boot_timer: Some(boot_timer),
            },
        );
        debug!(app_id = %self.app_id, pid, generation = seq, "Worker added to generation");
        Ok(pid)
    }

    fn arm_ready_timer(self: &Arc<Self>, inner: &mut Inner, seq: u64) {
        let timeout = self.ctx.config.supervisor.ready_timeout();
        let weak = Arc::downgrade(self);
        inner.ready_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(sup) = weak.upgrade() {
                sup.on_ready_timeout(seq);
            }
        }));
    }

    fn on_ready_timeout(&self, seq: u64) {
        let mut inner = self.inner.lock();
        if inner.current.seq != seq || inner.current.ready_fired {
            return;
        }
        error!(app_id = %self.app_id, generation = seq, "Generation did not become ready in time");
        inner.settle(Err(SupervisorError::BootTimeout {
            app_id: self.app_id.clone(),
        }));
        if inner.status == AppStatus::Starting {
            self.transition(&mut inner, AppStatus::Exception);
        }
    }

    fn on_boot_timeout(&self, pid: u32) {
        let mut inner = self.inner.lock();
        let Some(worker) = inner.current.workers.get_mut(&pid) else {
            return;
        };
        if worker.ready {
            return;
        }
        warn!(app_id = %self.app_id, pid, "Worker did not report ready in time, killing");
        worker.boot_timed_out = true;
        if let Some(tx) = worker.stop_tx.take() {
            let _ = tx.send(Duration::ZERO);
        }
    }

    fn on_ready_event(&self, pid: u32, data: Value) -> ipc::HandlerResult {
        let info: ReadyInfo = if data.is_null() {
            ReadyInfo::default()
        } else {
            serde_json::from_value(data).map_err(|e| {
                ErrorReply::new(ErrorCode::ParamError, format!("invalid ready payload: {}", e))
            })?
        };
        self.mark_ready(pid, info);
        Ok(Value::Null)
    }

    fn on_exit_reason(&self, pid: u32, data: Value) -> ipc::HandlerResult {
        let reason: ExitReason = serde_json::from_value(data["reason"].clone()).map_err(|e| {
            ErrorReply::new(ErrorCode::ParamError, format!("invalid exit reason: {}", e))
        })?;
        let mut inner = self.inner.lock();
        if let Some(worker) = inner.find_worker(pid) {
            debug!(app_id = %self.app_id, pid, ?reason, "Worker reported exit reason");
            worker.reported_exit = Some(reason);
        }
        Ok(Value::Null)
    }

    fn mark_ready(&self, pid: u32, info: ReadyInfo) {
        let mut inner = self.inner.lock();
        let Some(worker) = inner.current.workers.get_mut(&pid) else {
            debug!(app_id = %self.app_id, pid, "Ready from a worker outside the current generation");
            return;
        };
        if worker.ready {
            debug!(app_id = %self.app_id, pid, "Duplicate ready ignored");
            return;
        }
        worker.ready = true;
        if let Some(timer) = worker.boot_timer.take() {
            timer.abort();
        }
        info!(app_id = %self.app_id, pid, "Worker ready");
        inner.fatal_count = 0;
        if inner.current.ready_info.is_none() {
            inner.current.ready_info = Some(info);
        }
        self.check_generation_ready(&mut inner);
    }

    fn build_descriptor(&self, generation: &Generation) -> ApplicationDescriptor {
        let mut targets: Vec<Target> = generation
            .workers
            .values()
            .filter(|w| w.ready)
            .filter_map(|w| w.target.clone())
            .collect();
        targets.sort();
        let info = generation
            .ready_info
            .clone()
            .unwrap_or_else(|| self.service_ready_info());
        ApplicationDescriptor::from_ready(&self.app_id, &info, targets)
    }

    fn service_ready_info(&self) -> ReadyInfo {
        match &self.manifest.service {
            Some(service) => ReadyInfo {
                bind: service.bind.clone(),
                router: service.router.clone(),
                server_name: service.server_name.clone(),
                kind: service.kind,
                param: None,
            },
            None => ReadyInfo::default(),
        }
    }

    /// Fire the aggregate transition once every expected worker is ready
    fn check_generation_ready(&self, inner: &mut Inner) {
        if inner.current.ready_count() < inner.expect_workers {
            return;
        }
        let descriptor = self.build_descriptor(&inner.current);
        let changed = inner.descriptor.as_ref() != Some(&descriptor);
        inner.descriptor = Some(descriptor.clone());

        if !inner.current.ready_fired {
            inner.current.ready_fired = true;
            if let Some(timer) = inner.ready_timer.take() {
                timer.abort();
            }
            match inner.status {
                AppStatus::Starting => {
                    self.transition(inner, AppStatus::Online);
                    info!(app_id = %self.app_id, workers = descriptor.targets.len(), "Application online");
                }
                AppStatus::Reload => {
                    self.transition(inner, AppStatus::Reloaded);
                    info!(app_id = %self.app_id, workers = descriptor.targets.len(), "New generation ready");
                }
                _ => {}
            }
            inner.settle(Ok(descriptor));
            return;
        }

        if matches!(
            inner.status,
            AppStatus::Starting | AppStatus::Retry | AppStatus::Exception
        ) {
            if inner.status == AppStatus::Retry {
                self.transition(inner, AppStatus::Starting);
            }
            self.transition(inner, AppStatus::Online);
            info!(app_id = %self.app_id, "Application recovered");
            self.emit_route(Some(descriptor));
        } else if inner.status == AppStatus::Online && changed {
            info!(app_id = %self.app_id, workers = descriptor.targets.len(), "Worker pool changed");
            self.emit_route(Some(descriptor));
        }
    }

    fn emit_route(&self, descriptor: Option<ApplicationDescriptor>) {
        let _ = self.ctx.events.send(SupervisorEvent::RouteChanged {
            app_id: self.app_id.clone(),
            descriptor,
        });
    }

    fn on_worker_exit(self: &Arc<Self>, pid: u32, status: Option<ExitStatus>) {
        let mut inner = self.inner.lock();
        inner.exit_count += 1;

        if let Some(worker) = inner.retiring.remove(&pid) {
            debug!(app_id = %self.app_id, pid, ?status, "Stopped worker exited");
            self.release_target(&worker.target);
            return;
        }

        let in_previous = inner
            .previous
            .as_ref()
            .is_some_and(|g| g.workers.contains_key(&pid));
        if in_previous {
            if let Some(worker) = inner.previous.as_mut().and_then(|g| g.workers.remove(&pid)) {
                warn!(app_id = %self.app_id, pid, ?status, "Worker of the previous generation exited");
                self.release_target(&worker.target);
            }
            return;
        }

        let Some(mut worker) = inner.current.workers.remove(&pid) else {
            return;
        };
        if let Some(timer) = worker.boot_timer.take() {
            timer.abort();
        }
        self.release_target(&worker.target);

        let reason = if worker.boot_timed_out {
            ExitReason::BootTimeout
        } else if let Some(reported) = worker.reported_exit {
            reported
        } else {
            match status {
                Some(s) if s.success() => ExitReason::Normal,
                _ => ExitReason::UnknownRuntimeError,
            }
        };

        if reason == ExitReason::Normal {
            info!(app_id = %self.app_id, pid, "Worker exited normally");
        } else {
            warn!(app_id = %self.app_id, pid, ?reason, ?status, "Worker exited abnormally");
            inner.record_error_exit(ExitRecord {
                time: Local::now(),
                pid,
                reason,
                code: status.and_then(|s| s.code()),
                signal: status.and_then(exit_signal),
            });
        }

        if matches!(inner.status, AppStatus::Stopping | AppStatus::Offline) {
            return;
        }

        if worker.ready && inner.current.ready_fired && is_serving(inner.status) {
            if inner.status == AppStatus::Online {
                self.transition(&mut inner, AppStatus::Exception);
            }
            let remaining = (inner.current.ready_count() > 0)
                .then(|| self.build_descriptor(&inner.current));
            inner.descriptor = remaining.clone();
            self.emit_route(remaining);
        }

        if reason == ExitReason::Normal {
            return;
        }
        if reason.is_retryable() {
            self.schedule_retry(&mut inner);
            return;
        }

        let err = SupervisorError::from_exit(&self.app_id, pid, reason);
        error!(app_id = %self.app_id, pid, error = %err, "Worker failed, not retrying");
        if !inner.current.ready_fired {
            inner.settle(Err(err));
        }
        if matches!(inner.status, AppStatus::Starting | AppStatus::Online) {
            self.transition(&mut inner, AppStatus::Exception);
        }
    }

    fn schedule_retry(self: &Arc<Self>, inner: &mut Inner) {
        let sup_config = &self.ctx.config.supervisor;
        inner.fatal_count += 1;
        let threshold = sup_config.max_retry * inner.expect_workers.max(1) as u32;
        let delay = if inner.fatal_count < threshold {
            sup_config.retry_delay()
        } else {
            warn!(
                app_id = %self.app_id,
                fatal_count = inner.fatal_count,
                pause_ms = sup_config.pause_after_fatal_ms,
                "Retry threshold reached, pausing before respawn"
            );
            inner.fatal_count = 0;
            sup_config.pause_after_fatal()
        };

        if matches!(inner.status, AppStatus::Starting | AppStatus::Exception) {
            self.transition(inner, AppStatus::Retry);
        }

        let seq = inner.current.seq;
        let weak = Arc::downgrade(self);
        inner.retry_timers.retain(|t| !t.is_finished());
        inner.retry_timers.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sup) = weak.upgrade() {
                sup.respawn(seq);
            }
        }));
    }

    fn respawn(self: &Arc<Self>, seq: u64) {
        let mut inner = self.inner.lock();
        if inner.current.seq != seq {
            return;
        }
        match inner.status {
            AppStatus::Retry => {
                self.transition(&mut inner, AppStatus::Starting);
            }
            AppStatus::Reload | AppStatus::Reloaded | AppStatus::Online | AppStatus::Exception => {}
            _ => {
                debug!(app_id = %self.app_id, status = %inner.status, "Skipping respawn");
                return;
            }
        }
        if inner.current.workers.len() >= inner.expect_workers {
            return;
        }
        match self.spawn_one(&mut inner) {
            Ok(pid) => info!(app_id = %self.app_id, pid, "Worker respawned"),
            Err(e) => {
                error!(app_id = %self.app_id, error = %e, "Respawn failed");
                inner.settle(Err(e));
                if inner.status == AppStatus::Starting {
                    self.transition(&mut inner, AppStatus::Exception);
                }
            }
        }
    }

    fn is_booting(&self, pid: u32) -> bool {
        self.inner
            .lock()
            .current
            .workers
            .get(&pid)
            .is_some_and(|w| !w.ready && !w.stop_requested)
    }
}

fn is_serving(status: AppStatus) -> bool {
    matches!(
        status,
        AppStatus::Online | AppStatus::Exception | AppStatus::Retry | AppStatus::Starting
    )
}

fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

async fn wait_all(exited: Vec<watch::Receiver<bool>>) {
    let waits = exited.into_iter().map(|mut rx| async move {
        let _ = rx.wait_for(|done| *done).await;
    });
    futures::future::join_all(waits).await;
}

/// Own a worker's child handle until it exits or is asked to stop
async fn monitor(
    sup: Weak<Supervisor>,
    app_id: String,
    pid: u32,
    mut child: Child,
    stop_rx: oneshot::Receiver<Duration>,
    exited: watch::Sender<bool>,
) {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        Ok(grace) = stop_rx => process::terminate(&app_id, &mut child, grace).await,
    };
    if let Some(sup) = sup.upgrade() {
        sup.on_worker_exit(pid, status);
    }
    let _ = exited.send(true);
}

/// Readiness for services that do not speak IPC: poll until the target accepts connections
async fn probe_service(sup: Weak<Supervisor>, pid: u32, target: Target) {
    let (interval, attempts) = match sup.upgrade() {
        Some(s) => (
            s.ctx.config.supervisor.service_probe_interval(),
            s.ctx.config.supervisor.service_probe_max_attempts,
        ),
        None => return,
    };
    for _ in 0..attempts {
        tokio::time::sleep(interval).await;
        let Some(s) = sup.upgrade() else {
            return;
        };
        if !s.is_booting(pid) {
            return;
        }
        if process::probe(&target, interval.max(Duration::from_millis(50))).await {
            let info = s.service_ready_info();
            s.mark_ready(pid, info);
            return;
        }
    }
    debug!(pid, "Service never accepted connections");
}
