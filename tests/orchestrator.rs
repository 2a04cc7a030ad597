//! End-to-end tests driving real worker processes through the orchestrator

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hivegate::config::Config;
use hivegate::descriptor::Target;
use hivegate::error::ErrorCode;
use hivegate::orchestrator::{MountOptions, Orchestrator};
use hivegate::proxy::EmbeddedBackend;
use hivegate::router::{BackendError, ProxyBackend, RoutingTable};
use hivegate::supervisor::AppStatus;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Path to the sample worker built alongside the tests
fn echo_worker() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_hive-echo-worker"))
}

/// Backend that records every committed table and can be told to refuse pushes
#[derive(Default)]
struct RecordingBackend {
    staged: Mutex<Option<RoutingTable>>,
    committed: Mutex<Vec<RoutingTable>>,
    fail: AtomicBool,
    /// Milliseconds each validation takes
    delay_ms: AtomicU64,
}

impl RecordingBackend {
    fn last(&self) -> Option<RoutingTable> {
        self.committed.lock().last().cloned()
    }
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
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(BackendError::Validate("refused by test".into()));
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), BackendError> {
        if let Some(table) = self.staged.lock().take() {
            self.committed.lock().push(table);
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), BackendError> {
        self.staged.lock().take();
        Ok(())
    }
}

fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.server.run_dir = root.join("run");
    config.server.server_root = root.to_path_buf();
    config.server.logs_root = root.join("logs");
    config.supervisor.boot_timeout_ms = 10_000;
    config.supervisor.ready_timeout_ms = 20_000;
    config.supervisor.force_kill_timeout_ms = 2_000;
    config.supervisor.offline_ack_timeout_ms = 1_000;
    config.proxy.ip = "127.0.0.1".into();
    config.proxy.health_check.file = root.join("run/health_check.html");
    config
}

/// Write an app directory whose manifest runs the echo worker
fn write_app(root: &Path, name: &str, extra: &str) -> PathBuf {
    let dir = root.join("apps").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let manifest = format!(
        "command = {:?}\n{}\n",
        echo_worker().display().to_string(),
        extra
    );
    std::fs::write(dir.join("app.toml"), manifest).unwrap();
    dir
}

const ROUTED: &str = "[config]\nrouter = \"/echo\"\n";

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn http_get(port: u16, path: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

async fn wait_until<F: Fn() -> bool>(check: F, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn test_mount_routes_highest_version() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::default());
    let orch = Orchestrator::new(test_config(root.path()), backend.clone());

    let v1 = write_app(root.path(), "echo_v1", ROUTED);
    orch.mount("echo_1.0.0_1", MountOptions::new(&v1).processor_num(2))
        .await
        .unwrap();

    let listing = orch.list().await;
    let app = &listing["echo_1.0.0_1"];
    assert_eq!(app.status, AppStatus::Online);
    assert_eq!(app.pids.len(), 2);
    assert!(app.is_curr_working);
    assert!(app.healthy);
    assert_eq!(orch.router().active("echo").await.as_deref(), Some("echo_1.0.0_1"));

    let table = backend.last().unwrap();
    let entry = &table.upstreams()["echo_1.0.0_1"];
    assert_eq!(entry.router, "/echo/");
    assert_eq!(entry.targets.len(), 2);
    assert!(entry.targets.iter().all(|t| matches!(t, Target::Sock(_))));

    let v2 = write_app(root.path(), "echo_v2", ROUTED);
    orch.mount("echo_1.1.0_1", MountOptions::new(&v2)).await.unwrap();
    assert_eq!(orch.router().active("echo").await.as_deref(), Some("echo_1.1.0_1"));
    let listing = orch.list().await;
    assert!(listing["echo_1.1.0_1"].is_curr_working);
    assert!(!listing["echo_1.0.0_1"].is_curr_working);

    orch.unmount("echo_1.1.0_1").await.unwrap();
    assert_eq!(orch.router().active("echo").await.as_deref(), Some("echo_1.0.0_1"));
    assert!(!orch.list().await.contains_key("echo_1.1.0_1"));

    orch.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_mount_rejected() {
    let root = tempfile::tempdir().unwrap();
    let orch = Orchestrator::new(test_config(root.path()), Arc::new(RecordingBackend::default()));
    let dir = write_app(root.path(), "dup", ROUTED);

    orch.mount("dup_1.0.0_1", MountOptions::new(&dir)).await.unwrap();
    let err = orch.mount("dup_1.0.0_1", MountOptions::new(&dir)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AppAlreadyMounted);
    assert_eq!(err.to_reply().code.as_str(), "APP_ALREADY_MOUNTED");

    orch.shutdown().await;
}

#[tokio::test]
async fn test_init_error_fails_mount_without_retry() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::default());
    let orch = Orchestrator::new(test_config(root.path()), backend.clone());
    let dir = write_app(
        root.path(),
        "broken",
        &format!("{}[env]\nECHO_FAIL = \"init\"\n", ROUTED),
    );

    let err = orch.mount("broken_1.0.0_1", MountOptions::new(&dir)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AppInitError);
    assert!(orch.list().await.is_empty());
    assert!(backend.last().is_none());

    orch.shutdown().await;
}

#[tokio::test]
async fn test_retryable_crash_during_boot_recovers() {
    let root = tempfile::tempdir().unwrap();
    let orch = Orchestrator::new(test_config(root.path()), Arc::new(RecordingBackend::default()));
    let marker = root.path().join("crashed-once");
    let dir = write_app(
        root.path(),
        "flaky",
        &format!("{}[env]\nECHO_CRASH_ONCE_FILE = {:?}\n", ROUTED, marker.display().to_string()),
    );

    orch.mount("flaky_1.0.0_1", MountOptions::new(&dir)).await.unwrap();
    assert!(marker.exists());

    let app = &orch.list().await["flaky_1.0.0_1"];
    assert_eq!(app.status, AppStatus::Online);
    assert_eq!(app.error_exit_count, 1);
    assert_eq!(app.error_exit_record.len(), 1);

    orch.clean_exit_record("flaky_1.0.0_1").unwrap();
    let app = &orch.list().await["flaky_1.0.0_1"];
    assert_eq!(app.error_exit_count, 0);
    assert!(app.error_exit_record.is_empty());

    orch.shutdown().await;
}

#[tokio::test]
async fn test_reload_swaps_generation() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::default());
    let orch = Orchestrator::new(test_config(root.path()), backend.clone());
    let dir = write_app(root.path(), "swap", ROUTED);

    orch.mount("swap_1.0.0_1", MountOptions::new(&dir).processor_num(2))
        .await
        .unwrap();
    let old_pids = orch.app_pids("swap_1.0.0_1").unwrap();
    let old_targets = backend.last().unwrap().upstreams()["swap_1.0.0_1"].targets.clone();

    orch.reload("swap_1.0.0_1").await.unwrap();

    let new_pids = orch.app_pids("swap_1.0.0_1").unwrap();
    assert_eq!(new_pids.len(), 2);
    assert!(new_pids.iter().all(|pid| !old_pids.contains(pid)));
    assert!(
        wait_until(|| old_pids.iter().all(|pid| !process_alive(*pid)), Duration::from_secs(5)).await,
        "previous generation still running"
    );

    // every committed table holds targets of exactly one generation
    let new_targets = backend.last().unwrap().upstreams()["swap_1.0.0_1"].targets.clone();
    assert!(new_targets.iter().all(|t| !old_targets.contains(t)));
    for table in backend.committed.lock().iter() {
        if let Some(entry) = table.upstreams().get("swap_1.0.0_1") {
            let old = entry.targets.iter().filter(|t| old_targets.contains(t)).count();
            assert!(old == 0 || old == entry.targets.len());
        }
    }
    assert_eq!(orch.list().await["swap_1.0.0_1"].status, AppStatus::Online);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_reload_rolls_back_when_router_refuses() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::default());
    let orch = Orchestrator::new(test_config(root.path()), backend.clone());
    let dir = write_app(root.path(), "stay", ROUTED);

    orch.mount("stay_1.0.0_1", MountOptions::new(&dir)).await.unwrap();
    let pids = orch.app_pids("stay_1.0.0_1").unwrap();
    let pushes = backend.committed.lock().len();

    backend.fail.store(true, Ordering::SeqCst);
    let err = orch.reload("stay_1.0.0_1").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ReloadFailed);

    assert_eq!(orch.app_pids("stay_1.0.0_1").unwrap(), pids);
    assert!(pids.iter().all(|pid| process_alive(*pid)));
    assert_eq!(orch.list().await["stay_1.0.0_1"].status, AppStatus::Online);
    assert_eq!(backend.committed.lock().len(), pushes);

    backend.fail.store(false, Ordering::SeqCst);
    orch.shutdown().await;
}

#[tokio::test]
async fn test_unmount_during_reload_leaves_no_route() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::default());
    let orch = Orchestrator::new(test_config(root.path()), backend.clone());
    let slow = write_app(
        root.path(),
        "slow",
        &format!("{}[env]\nECHO_READY_DELAY_MS = \"500\"\n", ROUTED),
    );
    let other = write_app(root.path(), "other", "[config]\nrouter = \"/other\"\n");
    orch.mount("slow_1.0.0_1", MountOptions::new(&slow)).await.unwrap();
    orch.mount("other_1.0.0_1", MountOptions::new(&other)).await.unwrap();

    // hold the routing section long enough for unmount to queue ahead of the reload
    backend.delay_ms.store(1_500, Ordering::SeqCst);
    let reload = tokio::spawn({
        let orch = orch.clone();
        async move { orch.reload("slow_1.0.0_1").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let unmount_other = tokio::spawn({
        let orch = orch.clone();
        async move { orch.unmount("other_1.0.0_1").await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    orch.unmount("slow_1.0.0_1").await.unwrap();
    unmount_other.await.unwrap().unwrap();

    assert!(reload.await.unwrap().is_err());
    assert!(!orch.router().is_registered("slow_1.0.0_1").await);
    assert!(orch.router().active("slow").await.is_none());
    assert!(!backend.last().unwrap().upstreams().contains_key("slow_1.0.0_1"));
    assert!(orch.list().await.is_empty());

    backend.delay_ms.store(0, Ordering::SeqCst);
    orch.shutdown().await;
}

#[tokio::test]
async fn test_daemon_app_is_supervised_but_not_routed() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::default());
    let orch = Orchestrator::new(test_config(root.path()), backend.clone());
    let dir = write_app(root.path(), "cron", "");

    orch.mount("cron_1.0.0_1", MountOptions::new(&dir)).await.unwrap();
    assert_eq!(orch.list().await["cron_1.0.0_1"].status, AppStatus::Online);
    assert!(orch.router().active("cron").await.is_none());
    assert!(backend.last().is_none());

    orch.shutdown().await;
}

#[tokio::test]
async fn test_port_upstream_mode() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::default());
    let mut config = test_config(root.path());
    let start = free_port();
    config.supervisor.port_range_start = start;
    config.supervisor.port_range_end = start.saturating_add(200);
    let orch = Orchestrator::new(config, backend.clone());
    let dir = write_app(root.path(), "tcp", &format!("upstream = \"port\"\n{}", ROUTED));

    orch.mount("tcp_1.0.0_1", MountOptions::new(&dir)).await.unwrap();
    let table = backend.last().unwrap();
    let targets = &table.upstreams()["tcp_1.0.0_1"].targets;
    assert_eq!(targets.len(), 1);
    assert!(matches!(targets[0], Target::Port(_)));

    orch.shutdown().await;
}

#[tokio::test]
async fn test_offline_drains_without_stopping_workers() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let health = config.proxy.health_check.file.clone();
    let orch = Orchestrator::new(config, Arc::new(RecordingBackend::default()));
    let dir = write_app(root.path(), "drain", ROUTED);
    orch.mount("drain_1.0.0_1", MountOptions::new(&dir)).await.unwrap();
    let pids = orch.app_pids("drain_1.0.0_1").unwrap();

    let acks = orch.offline().await.unwrap();
    assert!(!health.exists());
    assert_eq!(acks["drain_1.0.0_1"].as_object().unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pids.iter().all(|pid| process_alive(*pid)));

    orch.online().await.unwrap();
    assert!(health.exists());
    assert!(orch.status().await.online);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_unmount_stops_workers_and_removes_sockets() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::default());
    let orch = Orchestrator::new(test_config(root.path()), backend.clone());
    let dir = write_app(root.path(), "gone", ROUTED);

    orch.mount("gone_1.0.0_1", MountOptions::new(&dir).processor_num(2))
        .await
        .unwrap();
    let pids = orch.app_pids("gone_1.0.0_1").unwrap();
    let sockets: Vec<PathBuf> = backend.last().unwrap().upstreams()["gone_1.0.0_1"]
        .targets
        .iter()
        .filter_map(|t| match t {
            Target::Sock(path) => Some(path.clone()),
            Target::Port(_) => None,
        })
        .collect();

    orch.unmount("gone_1.0.0_1").await.unwrap();
    assert!(pids.iter().all(|pid| !process_alive(*pid)));
    assert!(sockets.iter().all(|path| !path.exists()));
    assert!(orch.router().active("gone").await.is_none());
    assert_eq!(
        orch.unmount("gone_1.0.0_1").await.unwrap_err().code(),
        ErrorCode::AppNotMounted
    );

    orch.shutdown().await;
}

#[tokio::test]
async fn test_embedded_proxy_routes_to_workers() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    let port = free_port();
    config.proxy.port = port;
    let backend = Arc::new(EmbeddedBackend::new(&config.proxy));
    let orch = Orchestrator::new(config, backend.clone());
    let dir = write_app(root.path(), "web", ROUTED);

    orch.mount("web_1.0.0_1", MountOptions::new(&dir).processor_num(2))
        .await
        .unwrap();
    assert_eq!(
        backend.local_addr(&format!("127.0.0.1:{}", port)).await.map(|a| a.port()),
        Some(port)
    );

    let response = http_get(port, "/echo/hello").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("\"app_id\":\"web_1.0.0_1\""));
    assert!(response.contains("\"path\":\"/echo/hello\""));
    assert!(response.to_lowercase().contains("x-forwarded-proto"));

    let response = http_get(port, "/other").await;
    assert!(response.starts_with("HTTP/1.1 404"), "{}", response);

    // round robin reaches both workers
    let pids = orch.app_pids("web_1.0.0_1").unwrap();
    let mut seen = std::collections::HashSet::new();
    for _ in 0..6 {
        let response = http_get(port, "/echo/").await;
        for pid in &pids {
            if response.contains(&format!("\"pid\":{}", pid)) {
                seen.insert(*pid);
            }
        }
    }
    assert_eq!(seen.len(), 2);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_embedded_proxy_passes_upgrades_through() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    let port = free_port();
    config.proxy.port = port;
    let backend = Arc::new(EmbeddedBackend::new(&config.proxy));
    let orch = Orchestrator::new(config, backend);
    let dir = write_app(root.path(), "pipe", ROUTED);
    orch.mount("pipe_1.0.0_1", MountOptions::new(&dir)).await.unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET /echo/raw HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "{}", head);

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");

    orch.shutdown().await;
}
