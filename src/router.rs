//! Routing table across all mounted applications
//!
//! The [`Router`] is the single writer of the [`RoutingTable`]. Every change
//! recomputes the table from the registered descriptors, diffs it against the
//! committed one, and only talks to the [`ProxyBackend`] when something changed.

use crate::descriptor::{AppKind, ApplicationDescriptor, BindAddr, ProxyParam, RouteStatus, Target};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("render failed: {0}")]
    Render(String),
    #[error("config validation failed: {0}")]
    Validate(String),
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("rollback failed: {0}")]
    Rollback(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("failed to push routes to {backend}: {source}")]
    Push {
        backend: &'static str,
        #[source]
        source: BackendError,
    },
}

/// One application's slot inside a server block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub app_id: String,
    pub name: String,
    /// Path prefix, always ending in `/`
    pub router: String,
    pub targets: Vec<Target>,
    /// Targets of the next-highest version, used only when every primary fails
    pub backup: Vec<Target>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<ProxyParam>,
    /// Registration order; higher is more recent
    pub seq: u64,
}

/// Everything served on one `ip:port`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerRoutes {
    pub ip: String,
    pub port: u16,
    /// The kind that first claimed this listener
    pub kind: AppKind,
    pub ssl: bool,
    /// Server name answering requests whose host matches nothing else
    pub default_server: Option<String>,
    /// Server name to entries, most recently registered first
    pub servers: BTreeMap<String, Vec<RouteEntry>>,
}

impl ListenerRoutes {
    fn new(bind: &BindAddr, kind: AppKind) -> Self {
        Self {
            ip: bind.ip.clone(),
            port: bind.port,
            kind,
            ssl: false,
            default_server: None,
            servers: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// TLS material named by the first entry that carries it
    pub fn tls_files(&self) -> Option<(String, String)> {
        if !self.ssl {
            return None;
        }
        self.servers
            .values()
            .flatten()
            .filter_map(|e| e.param.as_ref())
            .find_map(|p| p.tls_files().map(|(c, k)| (c.to_string(), k.to_string())))
    }
}

/// Computed routing state pushed to a backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoutingTable {
    /// Keyed by `ip:port`
    pub listeners: BTreeMap<String, ListenerRoutes>,
    /// Active app id per application name
    pub active: BTreeMap<String, String>,
}

impl RoutingTable {
    /// Route entries of every active application, deduplicated by app id
    pub fn upstreams(&self) -> BTreeMap<String, RouteEntry> {
        let mut out = BTreeMap::new();
        for listener in self.listeners.values() {
            for entry in listener.servers.values().flatten() {
                out.entry(entry.app_id.clone())
                    .or_insert_with(|| entry.clone());
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Narrow transactional interface every proxy backend implements.
///
/// `render` stages a table; nothing live changes until `commit`. A failed
/// `validate` or `commit` is followed by `rollback`, which must leave the
/// last committed configuration serving.
#[async_trait]
pub trait ProxyBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn render(&self, table: &RoutingTable) -> Result<(), BackendError>;

    async fn validate(&self) -> Result<(), BackendError>;

    async fn commit(&self) -> Result<(), BackendError>;

    async fn rollback(&self) -> Result<(), BackendError>;

    /// Release listeners or external resources
    async fn shutdown(&self) {}
}

/// Runs the render, validate, commit sequence with rollback on failure
#[async_trait]
pub trait Publisher: Sync {
    async fn publish(&self, table: &RoutingTable) -> Result<(), BackendError>;
}

#[async_trait]
impl<T: ProxyBackend + ?Sized> Publisher for T {
    async fn publish(&self, table: &RoutingTable) -> Result<(), BackendError> {
        let staged = async {
            self.render(table).await?;
            self.validate().await?;
            self.commit().await
        }
        .await;
        if let Err(e) = staged {
            if let Err(rollback) = self.rollback().await {
                error!(backend = self.name(), error = %rollback, "Rollback after failed push also failed");
            }
            return Err(e);
        }
        Ok(())
    }
}

/// Result of a recompute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recompute {
    Unchanged,
    Pushed,
}

struct Registered {
    descriptor: ApplicationDescriptor,
    seq: u64,
}

#[derive(Default)]
struct RouterState {
    registered: HashMap<String, Registered>,
    table: RoutingTable,
    next_seq: u64,
    pushes: u64,
}

/// Builds the routing table and drives one proxy backend
pub struct Router {
    backend: Arc<dyn ProxyBackend>,
    default_ip: String,
    default_port: u16,
    state: Mutex<RouterState>,
}

impl Router {
    pub fn new(backend: Arc<dyn ProxyBackend>, default_ip: impl Into<String>, default_port: u16) -> Self {
        Self {
            backend,
            default_ip: default_ip.into(),
            default_port,
            state: Mutex::new(RouterState {
                next_seq: 1,
                ..Default::default()
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn ProxyBackend> {
        &self.backend
    }

    /// Register or replace the descriptor for its app id
    pub async fn register(&self, descriptor: ApplicationDescriptor) -> Result<Recompute, RouterError> {
        let mut state = self.state.lock().await;
        if descriptor.kind == AppKind::Daemon {
            debug!(app_id = %descriptor.app_id, "Daemon apps are not routed");
            return Ok(Recompute::Unchanged);
        }
        let app_id = descriptor.app_id.clone();
        let seq = match state.registered.get(&app_id) {
            Some(existing) => existing.seq,
            None => {
                let seq = state.next_seq;
                state.next_seq += 1;
                seq
            }
        };
        let previous = state
            .registered
            .insert(app_id.clone(), Registered { descriptor, seq });

        let result = self.recompute_locked(&mut state).await;
        if result.is_err() {
            // restore the registry so it matches the committed table
            match previous {
                Some(previous) => {
                    state.registered.insert(app_id, previous);
                }
                None => {
                    state.registered.remove(&app_id);
                }
            }
        }
        result
    }

    /// Drop an app id from routing; unknown ids are a no-op
    pub async fn unregister(&self, app_id: &str) -> Result<Recompute, RouterError> {
        let mut state = self.state.lock().await;
        let Some(previous) = state.registered.remove(app_id) else {
            return Ok(Recompute::Unchanged);
        };
        let result = self.recompute_locked(&mut state).await;
        if result.is_err() {
            state.registered.insert(app_id.to_string(), previous);
        }
        result
    }

    /// Recompute the table from the registered descriptors and push on change
    pub async fn recompute(&self) -> Result<Recompute, RouterError> {
        let mut state = self.state.lock().await;
        self.recompute_locked(&mut state).await
    }

    async fn recompute_locked(&self, state: &mut RouterState) -> Result<Recompute, RouterError> {
        let table = self.build_table(state);
        if table == state.table {
            debug!("Routing table unchanged, skipping push");
            return Ok(Recompute::Unchanged);
        }
        self.backend
            .publish(&table)
            .await
            .map_err(|source| RouterError::Push {
                backend: self.backend.name(),
                source,
            })?;
        state.pushes += 1;
        info!(
            backend = self.backend.name(),
            listeners = table.listeners.len(),
            active = table.active.len(),
            "Routing table pushed"
        );
        state.table = table;
        Ok(Recompute::Pushed)
    }

    fn build_table(&self, state: &RouterState) -> RoutingTable {
        let mut groups: BTreeMap<&str, Vec<&Registered>> = BTreeMap::new();
        for registered in state.registered.values() {
            let d = &registered.descriptor;
            if d.status != RouteStatus::On || d.kind == AppKind::Daemon {
                continue;
            }
            groups.entry(d.name.as_str()).or_default().push(registered);
        }

        let mut active: Vec<(&Registered, Vec<Target>)> = Vec::new();
        let mut table = RoutingTable::default();
        for (name, mut versions) in groups {
            versions.sort_by(|a, b| {
                b.descriptor
                    .weight
                    .total_cmp(&a.descriptor.weight)
                    .then(b.seq.cmp(&a.seq))
            });
            let backup = versions
                .get(1)
                .map(|r| r.descriptor.targets.clone())
                .unwrap_or_default();
            table
                .active
                .insert(name.to_string(), versions[0].descriptor.app_id.clone());
            active.push((versions[0], backup));
        }
        // first registration claims a listener's kind
        active.sort_by_key(|(r, _)| r.seq);

        let default_bind = BindAddr::new(self.default_ip.clone(), self.default_port);
        table
            .listeners
            .insert(default_bind.id(), ListenerRoutes::new(&default_bind, AppKind::Http));

        for (registered, backup) in active {
            let d = &registered.descriptor;
            for bind in d.binds_or(&self.default_ip, self.default_port) {
                let listener = table
                    .listeners
                    .entry(bind.id())
                    .or_insert_with(|| ListenerRoutes::new(&bind, d.kind));
                if listener.kind != d.kind {
                    warn!(
                        app_id = %d.app_id,
                        listener = %bind.id(),
                        claimed = %listener.kind,
                        kind = %d.kind,
                        "Listener already claimed by another kind, skipping"
                    );
                    continue;
                }
                listener.ssl |= bind.ssl;
                if bind.default && listener.default_server.is_none() {
                    listener.default_server = d.server_names.first().cloned();
                }
                for server_name in &d.server_names {
                    listener
                        .servers
                        .entry(server_name.clone())
                        .or_default()
                        .push(RouteEntry {
                            app_id: d.app_id.clone(),
                            name: d.name.clone(),
                            router: d.router.clone(),
                            targets: d.targets.clone(),
                            backup: backup.clone(),
                            param: d.param.clone(),
                            seq: registered.seq,
                        });
                }
            }
        }

        for listener in table.listeners.values_mut() {
            for entries in listener.servers.values_mut() {
                entries.sort_by(|a, b| b.seq.cmp(&a.seq));
            }
        }
        table
    }

    /// The committed table
    pub async fn table(&self) -> RoutingTable {
        self.state.lock().await.table.clone()
    }

    /// App id currently receiving traffic for `name`
    pub async fn active(&self, name: &str) -> Option<String> {
        self.state.lock().await.table.active.get(name).cloned()
    }

    pub async fn is_registered(&self, app_id: &str) -> bool {
        self.state.lock().await.registered.contains_key(app_id)
    }

    /// Number of successful backend pushes
    pub async fn push_count(&self) -> u64 {
        self.state.lock().await.pushes
    }

    pub async fn shutdown(&self) {
        self.backend.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{BindEntry, OneOrMany, ReadyInfo};
    use parking_lot::Mutex as SyncMutex;
    use std::path::PathBuf;

    #[derive(Default)]
    struct RecordingBackend {
        staged: SyncMutex<Option<RoutingTable>>,
        committed: SyncMutex<Vec<RoutingTable>>,
        fail_validate: SyncMutex<bool>,
        rollbacks: SyncMutex<u32>,
    }

    #[async_trait]
    impl ProxyBackend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn render(&self, table: &RoutingTable) -> Result<(), BackendError> {
            *self.staged.lock() = Some(table.clone());
            Ok(())
        }

        async fn validate(&self) -> Result<(), BackendError> {
            if *self.fail_validate.lock() {
                return Err(BackendError::Validate("rejected".into()));
            }
            Ok(())
        }

        async fn commit(&self) -> Result<(), BackendError> {
            let table = self
                .staged
                .lock()
                .take()
                .ok_or_else(|| BackendError::Commit("nothing staged".into()))?;
            self.committed.lock().push(table);
            Ok(())
        }

        async fn rollback(&self) -> Result<(), BackendError> {
            self.staged.lock().take();
            *self.rollbacks.lock() += 1;
            Ok(())
        }
    }

    fn descriptor(app_id: &str, router: &str, sock: &str) -> ApplicationDescriptor {
        let ready = ReadyInfo {
            router: Some(router.to_string()),
            ..Default::default()
        };
        ApplicationDescriptor::from_ready(app_id, &ready, vec![Target::Sock(PathBuf::from(sock))])
    }

    fn router() -> (Router, Arc<RecordingBackend>) {
        let backend = Arc::new(RecordingBackend::default());
        (Router::new(backend.clone(), "0.0.0.0", 8080), backend)
    }

    #[tokio::test]
    async fn test_recompute_is_idempotent() {
        let (router, backend) = router();
        let result = router.register(descriptor("shop_1.0.0_1", "/shop", "/tmp/a.sock")).await.unwrap();
        assert_eq!(result, Recompute::Pushed);
        assert_eq!(router.recompute().await.unwrap(), Recompute::Unchanged);
        assert_eq!(router.recompute().await.unwrap(), Recompute::Unchanged);
        assert_eq!(backend.committed.lock().len(), 1);

        // re-registering the same descriptor changes nothing
        let again = router.register(descriptor("shop_1.0.0_1", "/shop", "/tmp/a.sock")).await.unwrap();
        assert_eq!(again, Recompute::Unchanged);
        assert_eq!(router.push_count().await, 1);
    }

    #[tokio::test]
    async fn test_active_version_is_highest_weight() {
        let (router, _backend) = router();
        router.register(descriptor("shop_1.1.0_1", "/shop", "/tmp/new.sock")).await.unwrap();
        router.register(descriptor("shop_1.0.0_1", "/shop", "/tmp/old.sock")).await.unwrap();
        assert_eq!(router.active("shop").await.as_deref(), Some("shop_1.1.0_1"));

        let table = router.table().await;
        let entries = &table.listeners["0.0.0.0:8080"].servers["*"];
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].app_id, "shop_1.1.0_1");
        assert_eq!(entries[0].backup, vec![Target::Sock(PathBuf::from("/tmp/old.sock"))]);

        router.unregister("shop_1.1.0_1").await.unwrap();
        assert_eq!(router.active("shop").await.as_deref(), Some("shop_1.0.0_1"));
        let table = router.table().await;
        assert!(table.listeners["0.0.0.0:8080"].servers["*"][0].backup.is_empty());
    }

    #[tokio::test]
    async fn test_off_descriptors_are_not_routed() {
        let (router, _backend) = router();
        let mut d = descriptor("shop_1.1.0_1", "/shop", "/tmp/new.sock");
        d.status = RouteStatus::Off;
        router.register(d).await.unwrap();
        router.register(descriptor("shop_1.0.0_1", "/shop", "/tmp/old.sock")).await.unwrap();
        assert_eq!(router.active("shop").await.as_deref(), Some("shop_1.0.0_1"));
    }

    #[tokio::test]
    async fn test_failed_push_rolls_back_registry() {
        let (router, backend) = router();
        router.register(descriptor("shop_1.0.0_1", "/shop", "/tmp/a.sock")).await.unwrap();
        *backend.fail_validate.lock() = true;

        let err = router
            .register(descriptor("blog_1.0.0_1", "/blog", "/tmp/b.sock"))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Push { .. }));
        assert_eq!(*backend.rollbacks.lock(), 1);
        assert!(!router.is_registered("blog_1.0.0_1").await);
        assert!(router.active("blog").await.is_none());

        let err = router.unregister("shop_1.0.0_1").await.unwrap_err();
        assert!(matches!(err, RouterError::Push { .. }));
        assert!(router.is_registered("shop_1.0.0_1").await);

        *backend.fail_validate.lock() = false;
        assert_eq!(router.recompute().await.unwrap(), Recompute::Unchanged);
    }

    #[tokio::test]
    async fn test_entries_most_recent_first() {
        let (router, _backend) = router();
        router.register(descriptor("root_1.0.0_1", "/", "/tmp/root.sock")).await.unwrap();
        router.register(descriptor("api_1.0.0_1", "/api", "/tmp/api.sock")).await.unwrap();
        let table = router.table().await;
        let entries = &table.listeners["0.0.0.0:8080"].servers["*"];
        let ids: Vec<_> = entries.iter().map(|e| e.app_id.as_str()).collect();
        assert_eq!(ids, vec!["api_1.0.0_1", "root_1.0.0_1"]);
        assert_eq!(entries[0].router, "/api/");
    }

    #[tokio::test]
    async fn test_kind_conflict_first_claim_wins() {
        let (router, _backend) = router();
        let web = ReadyInfo {
            bind: Some(OneOrMany::One(BindEntry::Port(9000))),
            router: Some("/".into()),
            ..Default::default()
        };
        let stream = ReadyInfo {
            bind: Some(OneOrMany::One(BindEntry::Port(9000))),
            kind: Some(AppKind::Stream),
            ..Default::default()
        };
        router
            .register(ApplicationDescriptor::from_ready("web_1.0.0_1", &web, vec![Target::Port(1)]))
            .await
            .unwrap();
        router
            .register(ApplicationDescriptor::from_ready("tcp_1.0.0_1", &stream, vec![Target::Port(2)]))
            .await
            .unwrap();

        let table = router.table().await;
        let listener = &table.listeners["0.0.0.0:9000"];
        assert_eq!(listener.kind, AppKind::Http);
        let ids: Vec<_> = listener.servers.values().flatten().map(|e| e.app_id.as_str()).collect();
        assert_eq!(ids, vec!["web_1.0.0_1"]);
    }

    #[tokio::test]
    async fn test_daemons_are_skipped() {
        let (router, backend) = router();
        let daemon = ApplicationDescriptor::from_ready("cron_1.0.0_1", &ReadyInfo::default(), vec![]);
        assert_eq!(router.register(daemon).await.unwrap(), Recompute::Unchanged);
        assert!(backend.committed.lock().is_empty());
    }
}
