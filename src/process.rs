//! Launching, watching and stopping one worker OS process

use crate::config::{AppManifest, ServiceConfig};
use crate::descriptor::{parse_app_id, Target};
use crate::link::{self, Link};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Environment variable carrying the JSON [`LaunchConfig`]
pub const APP_CONFIG_ENV: &str = "HIVE_APP_CONFIG";

/// Timeout for each step of an HTTP health probe
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything a worker needs to boot, serialized into [`APP_CONFIG_ENV`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Program the worker was started from
    pub entry: PathBuf,
    pub app_id: String,
    pub app_root: PathBuf,
    #[serde(default)]
    pub config: Value,
    pub server_root: PathBuf,
    pub log_root: PathBuf,
    #[serde(default)]
    pub cluster: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_sock: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
}

impl LaunchConfig {
    pub fn with_target(mut self, target: Option<&Target>) -> Self {
        self.target_sock = None;
        self.target_port = None;
        match target {
            Some(Target::Sock(path)) => self.target_sock = Some(path.clone()),
            Some(Target::Port(port)) => self.target_port = Some(*port),
            None => {}
        }
        self
    }

    pub fn target(&self) -> Option<Target> {
        if let Some(path) = &self.target_sock {
            return Some(Target::Sock(path.clone()));
        }
        self.target_port.map(Target::Port)
    }

    /// Read the launch config a supervisor passed to this process
    pub fn from_env() -> anyhow::Result<Self> {
        let raw = std::env::var(APP_CONFIG_ENV)
            .map_err(|_| anyhow::anyhow!("{} is not set", APP_CONFIG_ENV))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Placeholder values for service command lines
    pub fn vars(&self) -> HashMap<&'static str, String> {
        let identity = parse_app_id(&self.app_id);
        let mut vars = HashMap::new();
        vars.insert("appId", self.app_id.clone());
        vars.insert("name", identity.name);
        vars.insert("version", identity.version.to_string());
        vars.insert("buildNum", identity.build_num.to_string());
        vars.insert("appRoot", self.app_root.display().to_string());
        vars.insert("serverRoot", self.server_root.display().to_string());
        vars.insert("logRoot", self.log_root.display().to_string());
        vars.insert(
            "targetSock",
            self.target_sock
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );
        vars.insert(
            "targetPort",
            self.target_port.map(|p| p.to_string()).unwrap_or_default(),
        );
        vars
    }
}

/// Replace `${name}` placeholders; unknown names are left untouched
pub fn substitute(template: &str, vars: &HashMap<&'static str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match vars.get(key) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// A freshly spawned worker
pub struct Spawned {
    pub pid: u32,
    pub child: Child,
    /// IPC link, absent for service workers
    pub link: Option<Link>,
}

/// Spawn one worker for `manifest` with the given launch config
pub fn spawn_worker(manifest: &AppManifest, launch: &LaunchConfig) -> anyhow::Result<Spawned> {
    match &manifest.service {
        Some(service) => spawn_service(service, launch),
        None => spawn_ipc_worker(manifest, launch),
    }
}

fn resolve_program(program: &str, app_root: &Path) -> PathBuf {
    let path = Path::new(program);
    if path.is_relative() && program.contains('/') {
        app_root.join(path)
    } else {
        path.to_path_buf()
    }
}

fn spawn_ipc_worker(manifest: &AppManifest, launch: &LaunchConfig) -> anyhow::Result<Spawned> {
    let command = manifest
        .command
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("Manifest for {} has no 'command'", launch.app_id))?;
    let entry = resolve_program(command, &launch.app_root);
    let launch = LaunchConfig {
        entry: entry.clone(),
        ..launch.clone()
    };

    info!(app_id = %launch.app_id, command = %entry.display(), "Starting worker");

    let mut cmd = Command::new(&entry);
    cmd.args(&manifest.args);
    cmd.current_dir(&launch.app_root);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    for (key, value) in &manifest.env {
        cmd.env(key, value);
    }
    cmd.env(APP_CONFIG_ENV, serde_json::to_string(&launch)?);

    let (parent_end, child_end) = link::socket_pair()?;
    link::inherit(&mut cmd, &child_end);

    let mut child = cmd.spawn()?;
    drop(child_end);
    let pid = child
        .id()
        .ok_or_else(|| anyhow::anyhow!("Worker for {} exited during spawn", launch.app_id))?;
    pipe_output(&launch.app_id, pid, &mut child);
    info!(app_id = %launch.app_id, pid, "Worker process spawned");

    Ok(Spawned {
        pid,
        child,
        link: Some(link::attach(parent_end, pid)),
    })
}

fn spawn_service(service: &ServiceConfig, launch: &LaunchConfig) -> anyhow::Result<Spawned> {
    let vars = launch.vars();
    let exec = substitute(&service.exec, &vars);
    let entry = resolve_program(&exec, &launch.app_root);

    info!(app_id = %launch.app_id, exec = %entry.display(), "Starting service");

    let mut cmd = Command::new(&entry);
    cmd.args(service.args.iter().map(|a| substitute(a, &vars)));
    cmd.current_dir(&launch.app_root);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    for (key, value) in &service.env {
        cmd.env(key, substitute(value, &vars));
    }

    let mut child = cmd.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| anyhow::anyhow!("Service for {} exited during spawn", launch.app_id))?;
    pipe_output(&launch.app_id, pid, &mut child);
    info!(app_id = %launch.app_id, pid, "Service process spawned");

    Ok(Spawned {
        pid,
        child,
        link: None,
    })
}

/// Re-emit a worker's stdout and stderr lines as tracing events
fn pipe_output(app_id: &str, pid: u32, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let app_id = app_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim_end();
                if !line.is_empty() {
                    info!(target: "worker", app_id = %app_id, pid, stream = "stdout", "{}", line);
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let app_id = app_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim_end();
                if !line.is_empty() {
                    warn!(target: "worker", app_id = %app_id, pid, stream = "stderr", "{}", line);
                }
            }
        });
    }
}

/// Send SIGTERM, wait up to `grace`, then SIGKILL
pub async fn terminate(app_id: &str, child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Some(pid) = child.id() {
        debug!(app_id, pid, "Sending SIGTERM to worker");
        // SAFETY: pid belongs to a child we have not reaped yet
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(app_id, ?status, "Worker exited gracefully");
            Some(status)
        }
        Ok(Err(e)) => {
            warn!(app_id, error = %e, "Error waiting for worker to exit");
            None
        }
        Err(_) => {
            warn!(
                app_id,
                grace_period_ms = grace.as_millis() as u64,
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
            child.wait().await.ok()
        }
    }
}

/// Whether something accepts connections on `target`
pub async fn probe(target: &Target, timeout: Duration) -> bool {
    let attempt = async {
        match target {
            Target::Port(port) => tokio::net::TcpStream::connect(("127.0.0.1", *port))
                .await
                .is_ok(),
            Target::Sock(path) => tokio::net::UnixStream::connect(path).await.is_ok(),
        }
    };
    tokio::time::timeout(timeout, attempt).await.unwrap_or(false)
}

/// Perform an HTTP GET against a worker and require a 2xx answer
pub async fn check_health(target: &Target, path: &str) -> anyhow::Result<bool> {
    match target {
        Target::Port(port) => {
            let host = format!("127.0.0.1:{}", port);
            let connect = tokio::time::timeout(
                HEALTH_CHECK_TIMEOUT,
                tokio::net::TcpStream::connect(&host),
            )
            .await;
            match connect {
                Ok(Ok(stream)) => Ok(http_get_ok(stream, &host, path).await),
                Ok(Err(_)) | Err(_) => Ok(false),
            }
        }
        Target::Sock(sock) => {
            let connect =
                tokio::time::timeout(HEALTH_CHECK_TIMEOUT, tokio::net::UnixStream::connect(sock))
                    .await;
            match connect {
                Ok(Ok(stream)) => Ok(http_get_ok(stream, "localhost", path).await),
                Ok(Err(_)) | Err(_) => Ok(false),
            }
        }
    }
}

async fn http_get_ok<S>(mut stream: S, host: &str, path: &str) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let read_result = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, async {
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    })
    .await;

    match read_result {
        // Format: "HTTP/1.1 200 OK\r\n"
        Ok(Ok(status_line)) => status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .map(|code| (200..300).contains(&code))
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn launch() -> LaunchConfig {
        LaunchConfig {
            entry: PathBuf::from("/apps/demo/server"),
            app_id: "demo_1.2.3_4".to_string(),
            app_root: PathBuf::from("/apps/demo"),
            config: Value::Null,
            server_root: PathBuf::from("/srv"),
            log_root: PathBuf::from("/logs"),
            cluster: Value::Null,
            target_sock: None,
            target_port: Some(20001),
        }
    }

    #[test]
    fn test_substitute_known_and_unknown_vars() {
        let vars = launch().vars();
        assert_eq!(
            substitute("--port=${targetPort} --name=${name}", &vars),
            "--port=20001 --name=demo"
        );
        assert_eq!(substitute("${version}_${buildNum}", &vars), "1.2.3_4");
        assert_eq!(substitute("${nope} ${", &vars), "${nope} ${");
        assert_eq!(substitute("plain", &vars), "plain");
    }

    #[test]
    fn test_launch_config_target() {
        let config = launch();
        assert_eq!(config.target(), Some(Target::Port(20001)));
        let sock = Target::Sock(PathBuf::from("/run/demo.1.sock"));
        let config = config.with_target(Some(&sock));
        assert_eq!(config.target(), Some(sock));
        assert_eq!(config.target_port, None);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["target_sock"], "/run/demo.1.sock");
        assert!(json.get("target_port").is_none());
    }

    #[test]
    fn test_resolve_program() {
        let root = Path::new("/apps/demo");
        assert_eq!(resolve_program("./bin/server", root), PathBuf::from("/apps/demo/./bin/server"));
        assert_eq!(resolve_program("node", root), PathBuf::from("node"));
        assert_eq!(resolve_program("/usr/bin/env", root), PathBuf::from("/usr/bin/env"));
    }

    #[tokio::test]
    async fn test_spawn_service_and_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let manifest: AppManifest = toml::from_str(
            r#"
[service]
exec = "sleep"
args = ["30"]
"#,
        )
        .unwrap();
        let config = LaunchConfig {
            app_root: dir.path().to_path_buf(),
            ..launch()
        };
        let mut spawned = spawn_worker(&manifest, &config).unwrap();
        assert!(spawned.link.is_none());
        assert!(spawned.pid > 0);

        let status = terminate("demo", &mut spawned.child, Duration::from_secs(2)).await;
        assert!(status.is_some());
        assert!(!status.unwrap().success());
    }

    #[tokio::test]
    async fn test_probe_and_health_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("health.sock");
        let target = Target::Sock(sock.clone());
        assert!(!probe(&target, Duration::from_millis(100)).await);

        let listener = tokio::net::UnixListener::bind(&sock).unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 512];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                    .await;
            }
        });

        assert!(probe(&target, Duration::from_millis(500)).await);
        assert!(check_health(&target, "/").await.unwrap());
    }

    #[tokio::test]
    async fn test_health_requires_2xx() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 512];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 503 Service Unavailable\r\n\r\n")
                    .await;
            }
        });
        assert!(!check_health(&Target::Port(port), "/health").await.unwrap());
        assert!(!check_health(&Target::Port(1), "/").await.unwrap());
    }
}
