//! Mount, unmount and reload applications; single writer of the routing table
//!
//! The [`Orchestrator`] owns one [`Router`] and a [`Supervisor`] per mounted
//! app id. Every router mutation goes through `routing`, so operations and the
//! supervisor event loop never interleave a registry check with a push.

use crate::alloc::PortAllocator;
use crate::config::{AppManifest, Config};
use crate::descriptor::{check_app_id, parse_app_id, weight, AppKind};
use crate::error::{ErrorReply, HiveError};
use crate::ipc::{Channel, CommandTag, HandlerRegistry, HandlerResult, Message};
use crate::router::{ProxyBackend, Router};
use crate::supervisor::{
    AppStatus, ExitRecord, Supervisor, SupervisorContext, SupervisorError, SupervisorEvent,
    OFFLINE_EVENT, ONLINE_EVENT,
};
use chrono::{DateTime, Local};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Arguments of a mount request
#[derive(Debug, Clone, Deserialize)]
pub struct MountOptions {
    pub dir: PathBuf,
    /// Overrides the manifest's worker count
    #[serde(default)]
    pub processor_num: Option<usize>,
}

impl MountOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            processor_num: None,
        }
    }

    pub fn processor_num(mut self, n: usize) -> Self {
        self.processor_num = Some(n);
        self
    }
}

/// One row of [`Orchestrator::list`]
#[derive(Debug, Clone, Serialize)]
pub struct AppListing {
    pub name: String,
    pub version: String,
    pub build_num: u32,
    pub status: AppStatus,
    pub pids: Vec<u32>,
    pub expect_worker_num: usize,
    pub worker_num: usize,
    pub exit_count: u64,
    pub error_exit_count: u64,
    pub error_exit_record: Vec<ExitRecord>,
    pub kind: Option<AppKind>,
    /// Highest-weight mounted version of its name
    pub is_curr_working: bool,
    /// Result of the supervisor's health check at listing time
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub start_time: DateTime<Local>,
    pub running_secs: i64,
    pub online: bool,
    pub apps: BTreeMap<String, AppListing>,
}

pub struct Orchestrator {
    config: Arc<Config>,
    router: Router,
    channel: Arc<Channel>,
    ctx: SupervisorContext,
    supervisors: DashMap<String, Arc<Supervisor>>,
    /// Serializes registry checks with router pushes
    routing: Mutex<()>,
    started_at: DateTime<Local>,
    online: AtomicBool,
    event_loop: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build an orchestrator pushing routes to `backend`. Must run inside a tokio runtime.
    pub fn new(config: Config, backend: Arc<dyn ProxyBackend>) -> Arc<Self> {
        let config = Arc::new(config);
        if let Err(e) = std::fs::create_dir_all(&config.server.run_dir) {
            warn!(run_dir = %config.server.run_dir.display(), error = %e, "Failed to create run dir");
        }
        let channel = Channel::new(config.ipc.timeout());
        let router = Router::new(backend, config.proxy.ip.clone(), config.proxy.port);
        let ports = PortAllocator::shared(
            config.supervisor.port_range_start,
            config.supervisor.port_range_end,
            config.supervisor.port_probe_max,
        );
        let cluster = config
            .server
            .cluster_file
            .as_deref()
            .map(read_cluster)
            .unwrap_or(Value::Null);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let orchestrator = Arc::new_cyclic(|weak: &Weak<Orchestrator>| Orchestrator {
            ctx: SupervisorContext {
                config: Arc::clone(&config),
                channel: Arc::clone(&channel),
                handlers: Arc::new(command_handlers(weak.clone())),
                ports,
                events: events_tx,
                cluster,
            },
            config,
            router,
            channel,
            supervisors: DashMap::new(),
            routing: Mutex::new(()),
            started_at: Local::now(),
            online: AtomicBool::new(true),
            event_loop: parking_lot::Mutex::new(None),
        });

        let task = tokio::spawn(run_events(Arc::downgrade(&orchestrator), events_rx));
        *orchestrator.event_loop.lock() = Some(task);
        orchestrator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn supervisor(&self, app_id: &str) -> Option<Arc<Supervisor>> {
        self.supervisors.get(app_id).map(|s| s.value().clone())
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Boot an application and route traffic to it
    pub async fn mount(&self, app_id: &str, options: MountOptions) -> Result<(), HiveError> {
        if app_id.is_empty() {
            return Err(HiveError::ParamMissing("app_id"));
        }
        if !check_app_id(app_id) {
            return Err(HiveError::Param(format!("invalid app id '{}'", app_id)));
        }
        if options.dir.as_os_str().is_empty() {
            return Err(HiveError::ParamMissing("dir"));
        }
        if !options.dir.is_dir() {
            return Err(HiveError::Param(format!(
                "app dir {} does not exist",
                options.dir.display()
            )));
        }
        let manifest = AppManifest::load(&options.dir).map_err(|e| HiveError::Manifest(e.to_string()))?;
        let processor_num = options
            .processor_num
            .or(manifest.processor_num)
            .unwrap_or(1);

        let supervisor = {
            use dashmap::mapref::entry::Entry;
            match self.supervisors.entry(app_id.to_string()) {
                Entry::Occupied(_) => return Err(HiveError::AlreadyMounted(app_id.to_string())),
                Entry::Vacant(slot) => {
                    let sup = Supervisor::new(app_id, &options.dir, manifest, self.ctx.clone());
                    slot.insert(Arc::clone(&sup));
                    sup
                }
            }
        };

        info!(app_id, dir = %options.dir.display(), processor_num, "Mounting application");
        let descriptor = match supervisor.start(processor_num).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                error!(app_id, error = %e, "Application failed to boot");
                self.discard(app_id, &supervisor).await;
                return Err(e.into());
            }
        };

        let pushed = {
            let _routing = self.routing.lock().await;
            if self.is_current(app_id, &supervisor) {
                // a crash between boot and here may already have republished fewer targets
                let descriptor = supervisor.descriptor().unwrap_or(descriptor);
                self.router.register(descriptor).await.map_err(HiveError::from)
            } else {
                Err(SupervisorError::Stopped {
                    app_id: app_id.to_string(),
                }
                .into())
            }
        };
        if let Err(e) = pushed {
            error!(app_id, error = %e, "Failed to route application");
            self.discard(app_id, &supervisor).await;
            return Err(e);
        }
        info!(app_id, "Application mounted");
        Ok(())
    }

    /// Stop routing to an application and stop its workers
    pub async fn unmount(&self, app_id: &str) -> Result<(), HiveError> {
        if app_id.is_empty() {
            return Err(HiveError::ParamMissing("app_id"));
        }
        let supervisor = {
            let _routing = self.routing.lock().await;
            let (_, supervisor) = self
                .supervisors
                .remove(app_id)
                .ok_or_else(|| HiveError::NotMounted(app_id.to_string()))?;
            if let Err(e) = self.router.unregister(app_id).await {
                // the router keeps its previous table; put the app back so state stays consistent
                self.supervisors.insert(app_id.to_string(), supervisor);
                return Err(e.into());
            }
            supervisor
        };
        info!(app_id, "Unmounting application");
        supervisor.stop().await?;
        Ok(())
    }

    /// Swap an application's workers for a fresh generation without dropping traffic
    pub async fn reload(&self, app_id: &str) -> Result<(), HiveError> {
        if app_id.is_empty() {
            return Err(HiveError::ParamMissing("app_id"));
        }
        let supervisor = self
            .supervisor(app_id)
            .ok_or_else(|| HiveError::NotMounted(app_id.to_string()))?;

        info!(app_id, "Reloading application");
        let descriptor = supervisor.reload().await?;

        let pushed = {
            let _routing = self.routing.lock().await;
            if self.is_current(app_id, &supervisor) {
                self.router.register(descriptor).await.map_err(|e| e.to_string())
            } else {
                Err(format!("{} was unmounted during reload", app_id))
            }
        };
        match pushed {
            Ok(_) => {
                supervisor.complete_reload(true).await;
                info!(app_id, "Application reloaded");
                Ok(())
            }
            Err(e) => {
                warn!(app_id, error = %e, "Reloaded app not routed, rolling back");
                supervisor.complete_reload(false).await;
                Err(SupervisorError::ReloadFailed {
                    app_id: app_id.to_string(),
                    reason: e,
                }
                .into())
            }
        }
    }

    pub async fn list(&self) -> BTreeMap<String, AppListing> {
        let supervisors: Vec<Arc<Supervisor>> = self
            .supervisors
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let health = futures::future::join_all(supervisors.iter().map(|sup| sup.health())).await;
        let snapshots: Vec<_> = supervisors
            .iter()
            .zip(health)
            .map(|(sup, healthy)| (sup.snapshot(), healthy))
            .collect();

        let mut best: BTreeMap<String, f64> = BTreeMap::new();
        for (snapshot, _) in &snapshots {
            let identity = parse_app_id(&snapshot.app_id);
            let w = weight(identity.version, identity.build_num);
            let slot = best.entry(identity.name).or_insert(w);
            if w > *slot {
                *slot = w;
            }
        }

        snapshots
            .into_iter()
            .map(|(s, healthy)| {
                let identity = parse_app_id(&s.app_id);
                let w = weight(identity.version, identity.build_num);
                let is_curr_working = best.get(&identity.name).is_some_and(|b| *b == w);
                let listing = AppListing {
                    name: identity.name,
                    version: identity.version.to_string(),
                    build_num: identity.build_num,
                    status: s.status,
                    pids: s.pids,
                    expect_worker_num: s.expect_worker_num,
                    worker_num: s.worker_num,
                    exit_count: s.exit_count,
                    error_exit_count: s.error_exit_count,
                    error_exit_record: s.error_exit_record,
                    kind: s.kind,
                    is_curr_working,
                    healthy,
                };
                (s.app_id, listing)
            })
            .collect()
    }

    pub async fn status(&self) -> StatusSummary {
        StatusSummary {
            start_time: self.started_at,
            running_secs: (Local::now() - self.started_at).num_seconds(),
            online: self.is_online(),
            apps: self.list().await,
        }
    }

    /// Restore the health-check file and tell every worker the server is back
    pub async fn online(&self) -> Result<Value, HiveError> {
        let file = &self.config.proxy.health_check.file;
        write_health_file(file).map_err(|e| {
            HiveError::Param(format!("cannot write health file {}: {}", file.display(), e))
        })?;
        self.online.store(true, Ordering::SeqCst);
        info!(file = %file.display(), "Server online");
        Ok(self.broadcast_event(ONLINE_EVENT).await)
    }

    /// Remove the health-check file so load balancers drain this host
    pub async fn offline(&self) -> Result<Value, HiveError> {
        let file = &self.config.proxy.health_check.file;
        match std::fs::remove_file(file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(HiveError::Param(format!(
                    "cannot remove health file {}: {}",
                    file.display(),
                    e
                )))
            }
        }
        self.online.store(false, Ordering::SeqCst);
        info!(file = %file.display(), "Server offline");
        Ok(self.broadcast_event(OFFLINE_EVENT).await)
    }

    async fn broadcast_event(&self, action: &str) -> Value {
        let app_ids: Vec<String> = self.supervisors.iter().map(|e| e.key().clone()).collect();
        let mut out = serde_json::Map::new();
        for app_id in app_ids {
            let message = Message::event(action, Value::Null)
                .with_timeout(self.config.supervisor.offline_ack_timeout());
            let value = match self.channel.broadcast(&app_id, message).await {
                Ok(results) => Value::Object(
                    results
                        .into_iter()
                        .map(|(pid, result)| (pid.to_string(), result_json(result)))
                        .collect(),
                ),
                Err(e) => {
                    debug!(app_id, error = %e, "No workers to notify");
                    json!({})
                }
            };
            out.insert(app_id, value);
        }
        Value::Object(out)
    }

    pub fn clean_exit_record(&self, app_id: &str) -> Result<(), HiveError> {
        let supervisor = self
            .supervisor(app_id)
            .ok_or_else(|| HiveError::NotMounted(app_id.to_string()))?;
        supervisor.clean_exit_record();
        Ok(())
    }

    pub fn app_pids(&self, app_id: &str) -> Result<Vec<u32>, HiveError> {
        self.supervisor(app_id)
            .map(|s| s.pids())
            .ok_or_else(|| HiveError::NotMounted(app_id.to_string()))
    }

    /// Stop every application, then the proxy backend
    pub async fn shutdown(&self) {
        if let Some(task) = self.event_loop.lock().take() {
            task.abort();
        }
        let supervisors: Vec<Arc<Supervisor>> = self
            .supervisors
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        self.supervisors.clear();
        info!(apps = supervisors.len(), "Stopping all applications");

        let stops = supervisors.iter().map(|sup| async move {
            if let Err(e) = sup.stop().await {
                warn!(app_id = sup.app_id(), error = %e, "Failed to stop application");
            }
        });
        futures::future::join_all(stops).await;
        self.router.shutdown().await;
    }

    /// Whether `supervisor` is still the mounted instance for `app_id` and may be routed.
    /// Callers hold `routing`.
    fn is_current(&self, app_id: &str, supervisor: &Arc<Supervisor>) -> bool {
        self.supervisors
            .get(app_id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), supervisor))
            && !matches!(supervisor.status(), AppStatus::Stopping | AppStatus::Offline)
    }

    /// Tear down a supervisor whose mount did not complete
    async fn discard(&self, app_id: &str, supervisor: &Arc<Supervisor>) {
        if let Err(e) = supervisor.stop().await {
            debug!(app_id, error = %e, "Stop after failed mount");
        }
        self.supervisors
            .remove_if(app_id, |_, current| Arc::ptr_eq(current, supervisor));
    }

    async fn on_event(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::RouteChanged { app_id, descriptor } => {
                let _routing = self.routing.lock().await;
                let Some(supervisor) = self.supervisor(&app_id) else {
                    debug!(app_id, "Route change for unmounted app ignored");
                    return;
                };
                if matches!(supervisor.status(), AppStatus::Stopping | AppStatus::Offline) {
                    return;
                }
                let result = match descriptor {
                    Some(descriptor) => self.router.register(descriptor).await,
                    None => self.router.unregister(&app_id).await,
                };
                if let Err(e) = result {
                    error!(app_id, error = %e, "Failed to republish routes");
                }
            }
        }
    }
}

async fn run_events(orchestrator: Weak<Orchestrator>, mut events: mpsc::UnboundedReceiver<SupervisorEvent>) {
    while let Some(event) = events.recv().await {
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        orchestrator.on_event(event).await;
    }
}

fn result_json(result: HandlerResult) -> Value {
    match result {
        Ok(data) => json!({ "data": data }),
        Err(error) => json!({ "error": error }),
    }
}

fn write_health_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, "ok\n")
}

/// Cluster membership snapshot; an unreadable file yields `null`
pub fn read_cluster(path: &Path) -> Value {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Invalid cluster file");
            Value::Null
        }),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No cluster file");
            Value::Null
        }
    }
}

fn arg_str(args: &[Value], index: usize, name: &'static str) -> Result<String, ErrorReply> {
    match args.get(index).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(HiveError::ParamMissing(name).to_reply()),
    }
}

fn to_json<T: Serialize>(value: &T) -> HandlerResult {
    serde_json::to_value(value).map_err(|e| {
        ErrorReply::new(crate::error::ErrorCode::InternalError, e.to_string())
    })
}

/// Commands workers may call on the orchestrator
fn command_handlers(orchestrator: Weak<Orchestrator>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    let weak = orchestrator.clone();
    registry.on_command(CommandTag::Mount, move |args| {
        let weak = weak.clone();
        async move {
            let orch = upgrade(&weak)?;
            let app_id = arg_str(&args, 0, "app_id")?;
            let options: MountOptions = args
                .get(1)
                .cloned()
                .ok_or_else(|| HiveError::ParamMissing("dir").to_reply())
                .and_then(|v| {
                    serde_json::from_value(v)
                        .map_err(|e| HiveError::Param(e.to_string()).to_reply())
                })?;
            orch.mount(&app_id, options).await.map_err(|e| e.to_reply())?;
            Ok(Value::Null)
        }
    });

    let weak = orchestrator.clone();
    registry.on_command(CommandTag::Unmount, move |args| {
        let weak = weak.clone();
        async move {
            let orch = upgrade(&weak)?;
            let app_id = arg_str(&args, 0, "app_id")?;
            orch.unmount(&app_id).await.map_err(|e| e.to_reply())?;
            Ok(Value::Null)
        }
    });

    let weak = orchestrator.clone();
    registry.on_command(CommandTag::Reload, move |args| {
        let weak = weak.clone();
        async move {
            let orch = upgrade(&weak)?;
            let app_id = arg_str(&args, 0, "app_id")?;
            orch.reload(&app_id).await.map_err(|e| e.to_reply())?;
            Ok(Value::Null)
        }
    });

    let weak = orchestrator.clone();
    registry.on_command(CommandTag::List, move |_| {
        let weak = weak.clone();
        async move { to_json(&upgrade(&weak)?.list().await) }
    });

    let weak = orchestrator.clone();
    registry.on_command(CommandTag::Status, move |_| {
        let weak = weak.clone();
        async move { to_json(&upgrade(&weak)?.status().await) }
    });

    let weak = orchestrator.clone();
    registry.on_command(CommandTag::Online, move |_| {
        let weak = weak.clone();
        async move { upgrade(&weak)?.online().await.map_err(|e| e.to_reply()) }
    });

    let weak = orchestrator.clone();
    registry.on_command(CommandTag::Offline, move |_| {
        let weak = weak.clone();
        async move { upgrade(&weak)?.offline().await.map_err(|e| e.to_reply()) }
    });

    let weak = orchestrator.clone();
    registry.on_command(CommandTag::CleanExitRecord, move |args| {
        let weak = weak.clone();
        async move {
            let orch = upgrade(&weak)?;
            let app_id = arg_str(&args, 0, "app_id")?;
            orch.clean_exit_record(&app_id).map_err(|e| e.to_reply())?;
            Ok(Value::Null)
        }
    });

    let weak = orchestrator;
    registry.on_command(CommandTag::AppPids, move |args| {
        let weak = weak.clone();
        async move {
            let orch = upgrade(&weak)?;
            let app_id = arg_str(&args, 0, "app_id")?;
            let pids = orch.app_pids(&app_id).map_err(|e| e.to_reply())?;
            Ok(json!(pids))
        }
    });

    registry
}

fn upgrade(weak: &Weak<Orchestrator>) -> Result<Arc<Orchestrator>, ErrorReply> {
    weak.upgrade().ok_or_else(|| {
        ErrorReply::new(crate::error::ErrorCode::InternalError, "orchestrator is shutting down")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{BackendError, RoutingTable};
    use async_trait::async_trait;

    #[derive(Default)]
    struct NullBackend {
        pushes: parking_lot::Mutex<Vec<RoutingTable>>,
    }

    #[async_trait]
    impl ProxyBackend for NullBackend {
        fn name(&self) -> &'static str {
            "null"
        }
        async fn render(&self, table: &RoutingTable) -> Result<(), BackendError> {
            self.pushes.lock().push(table.clone());
            Ok(())
        }
        async fn validate(&self) -> Result<(), BackendError> {
            Ok(())
        }
        async fn commit(&self) -> Result<(), BackendError> {
            Ok(())
        }
        async fn rollback(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn orchestrator(dir: &Path) -> Arc<Orchestrator> {
        let mut config = Config::default();
        config.server.run_dir = dir.join("run");
        config.proxy.health_check.file = dir.join("run/health_check.html");
        Orchestrator::new(config, Arc::new(NullBackend::default()))
    }

    #[tokio::test]
    async fn test_mount_rejects_bad_params() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());

        let err = orch.mount("", MountOptions::new(dir.path())).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ParamMissing);

        let err = orch.mount("__hidden", MountOptions::new(dir.path())).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ParamError);

        let err = orch
            .mount("app_1.0.0_1", MountOptions::new(dir.path().join("missing")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ParamError);

        // dir exists but has no manifest
        let err = orch.mount("app_1.0.0_1", MountOptions::new(dir.path())).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ManifestError);
        assert!(orch.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_operations_on_unknown_app() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let code = |e: HiveError| e.code();
        assert_eq!(
            code(orch.unmount("ghost").await.unwrap_err()),
            crate::error::ErrorCode::AppNotMounted
        );
        assert_eq!(
            code(orch.reload("ghost").await.unwrap_err()),
            crate::error::ErrorCode::AppNotMounted
        );
        assert_eq!(
            code(orch.app_pids("ghost").unwrap_err()),
            crate::error::ErrorCode::AppNotMounted
        );
        assert!(orch.clean_exit_record("ghost").is_err());
    }

    #[tokio::test]
    async fn test_online_offline_toggle_health_file() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let file = dir.path().join("run/health_check.html");

        orch.offline().await.unwrap();
        assert!(!file.exists());
        assert!(!orch.status().await.online);

        orch.online().await.unwrap();
        assert!(file.exists());
        assert!(orch.status().await.online);

        // removing an already missing file is fine
        orch.offline().await.unwrap();
        orch.offline().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_summary() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let status = orch.status().await;
        assert!(status.running_secs >= 0);
        assert!(status.apps.is_empty());
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("start_time").is_some());
    }

    #[tokio::test]
    async fn test_command_handlers_registered() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        for tag in CommandTag::ALL {
            assert!(orch.ctx.handlers.has_command(tag), "missing handler for {}", tag);
        }
    }

    #[test]
    fn test_read_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        assert_eq!(read_cluster(&path), Value::Null);
        std::fs::write(&path, r#"{"nodes":["10.0.0.1"]}"#).unwrap();
        assert_eq!(read_cluster(&path)["nodes"][0], "10.0.0.1");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(read_cluster(&path), Value::Null);
    }

    #[test]
    fn test_mount_options_from_json() {
        let options: MountOptions =
            serde_json::from_value(json!({"dir": "/apps/a", "processor_num": 2})).unwrap();
        assert_eq!(options.dir, PathBuf::from("/apps/a"));
        assert_eq!(options.processor_num, Some(2));
    }
}
