use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the per-application manifest inside an app directory
pub const MANIFEST_FILE: &str = "app.toml";

/// Global configuration for the orchestrator
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker pool policy shared by every supervisor
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub ipc: IpcConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Applications mounted at startup
    #[serde(default)]
    pub apps: Vec<BootApp>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Root passed to workers as `server_root`
    #[serde(default = "default_server_root")]
    pub server_root: PathBuf,

    /// Directory for worker sockets and runtime state
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,

    /// Root passed to workers as `log_root`
    #[serde(default = "default_logs_root")]
    pub logs_root: PathBuf,

    /// Path to PID file (optional)
    pub pid_file: Option<PathBuf>,

    /// JSON snapshot of cluster membership handed to workers (optional)
    pub cluster_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_root: default_server_root(),
            run_dir: default_run_dir(),
            logs_root: default_logs_root(),
            pid_file: None,
            cluster_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Retryable crashes allowed per worker slot before cooling down
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Cool-down after the retry threshold is reached
    #[serde(default = "default_pause_after_fatal_ms")]
    pub pause_after_fatal_ms: u64,

    /// How long one worker may take to report ready
    #[serde(default = "default_boot_timeout_ms")]
    pub boot_timeout_ms: u64,

    /// How long a whole generation may take to become ready
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_force_kill_timeout_ms")]
    pub force_kill_timeout_ms: u64,

    /// How long to wait for workers to acknowledge an offline notice
    #[serde(default = "default_offline_ack_timeout_ms")]
    pub offline_ack_timeout_ms: u64,

    #[serde(default = "default_service_probe_interval_ms")]
    pub service_probe_interval_ms: u64,

    #[serde(default = "default_service_probe_max_attempts")]
    pub service_probe_max_attempts: u32,

    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    #[serde(default = "default_port_probe_max")]
    pub port_probe_max: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_retry: default_max_retry(),
            retry_delay_ms: default_retry_delay_ms(),
            pause_after_fatal_ms: default_pause_after_fatal_ms(),
            boot_timeout_ms: default_boot_timeout_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            force_kill_timeout_ms: default_force_kill_timeout_ms(),
            offline_ack_timeout_ms: default_offline_ack_timeout_ms(),
            service_probe_interval_ms: default_service_probe_interval_ms(),
            service_probe_max_attempts: default_service_probe_max_attempts(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            port_probe_max: default_port_probe_max(),
        }
    }
}

impl SupervisorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn pause_after_fatal(&self) -> Duration {
        Duration::from_millis(self.pause_after_fatal_ms)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn force_kill_timeout(&self) -> Duration {
        Duration::from_millis(self.force_kill_timeout_ms)
    }

    pub fn offline_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.offline_ack_timeout_ms)
    }

    pub fn service_probe_interval(&self) -> Duration {
        Duration::from_millis(self.service_probe_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IpcConfig {
    /// Default reply window for IPC calls
    #[serde(default = "default_ipc_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_ipc_timeout_ms(),
        }
    }
}

impl IpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Which proxy backend receives routing table pushes
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Embedded,
    Nginx,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Default listen address for apps that name no bind
    #[serde(default = "default_proxy_ip")]
    pub ip: String,

    #[serde(default = "default_proxy_port")]
    pub port: u16,

    /// Redirect target for `/` on the default server
    pub index: Option<String>,

    /// Request id header to propagate instead of generating one
    pub trace_id_header: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per worker port (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub nginx: NginxConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            ip: default_proxy_ip(),
            port: default_proxy_port(),
            index: None,
            trace_id_header: None,
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            health_check: HealthCheckConfig::default(),
            nginx: NginxConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Load balancer health check served by the proxy itself
#[derive(Debug, Deserialize, Clone)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_router")]
    pub router: String,

    /// Present while the server is online, removed when taken offline
    #[serde(default = "default_health_file")]
    pub file: PathBuf,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            router: default_health_router(),
            file: default_health_file(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NginxConfig {
    /// nginx command line, split with shell rules (e.g. `"sudo nginx"`)
    #[serde(default = "default_nginx_bin")]
    pub bin: String,

    #[serde(default = "default_nginx_config")]
    pub config: PathBuf,

    pub prefix: Option<PathBuf>,

    /// Directory owned by the orchestrator; regenerated on every push
    #[serde(default = "default_nginx_include_path")]
    pub include_path: PathBuf,

    #[serde(default = "default_nginx_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default)]
    pub upstream_check: UpstreamCheck,
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            bin: default_nginx_bin(),
            config: default_nginx_config(),
            prefix: None,
            include_path: default_nginx_include_path(),
            command_timeout_secs: default_nginx_command_timeout(),
            upstream_check: UpstreamCheck::default(),
        }
    }
}

impl NginxConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Upstream failure detection rendered into upstream blocks
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpstreamCheck {
    Normal {
        #[serde(default = "default_max_fails")]
        max_fails: u32,
        #[serde(default = "default_fail_timeout")]
        fail_timeout: String,
    },
    UpstreamCheckModule {
        #[serde(default = "default_check")]
        check: String,
        #[serde(default = "default_check_keepalive_requests")]
        check_keepalive_requests: u32,
        #[serde(default = "default_check_http_send")]
        check_http_send: String,
        #[serde(default = "default_check_http_expect_alive")]
        check_http_expect_alive: String,
    },
}

impl Default for UpstreamCheck {
    fn default() -> Self {
        UpstreamCheck::Normal {
            max_fails: default_max_fails(),
            fail_timeout: default_fail_timeout(),
        }
    }
}

/// Application mounted when the daemon starts
#[derive(Debug, Deserialize, Clone)]
pub struct BootApp {
    pub id: String,
    pub dir: PathBuf,
    pub processor_num: Option<usize>,
    #[serde(default = "default_order")]
    pub order: i32,
}

/// How a worker is reached by the proxy
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMode {
    #[default]
    Sock,
    Port,
}

/// Per-application manifest, `<dir>/app.toml`
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppManifest {
    /// Program started for IPC workers (relative paths resolve against the app dir)
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    pub processor_num: Option<usize>,

    #[serde(default = "default_order")]
    pub order: i32,

    #[serde(default)]
    pub upstream: UpstreamMode,

    /// Application config handed to workers verbatim
    #[serde(default)]
    pub config: Option<toml::Value>,

    /// Externally executed service that does not speak IPC
    pub service: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServiceConfig {
    pub exec: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default, alias = "type")]
    pub kind: Option<crate::descriptor::AppKind>,

    #[serde(default)]
    pub bind: Option<crate::descriptor::OneOrMany<crate::descriptor::BindEntry>>,

    pub router: Option<String>,

    #[serde(default)]
    pub server_name: Option<crate::descriptor::OneOrMany<String>>,

    /// Path probed by health checks (default: `/`)
    pub health_path: Option<String>,
}

impl AppManifest {
    /// Load and validate `<dir>/app.toml`
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let manifest: AppManifest = toml::from_str(&content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        match (&self.command, &self.service) {
            (None, None) => errors.push("either 'command' or [service] is required".to_string()),
            (Some(_), Some(_)) => {
                errors.push("'command' and [service] are mutually exclusive".to_string())
            }
            _ => {}
        }
        if let Some(service) = &self.service {
            if service.exec.trim().is_empty() {
                errors.push("[service] requires 'exec'".to_string());
            }
        }
        if self.processor_num == Some(0) {
            errors.push("'processor_num' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Manifest errors:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }

    /// App config as JSON for the worker launch payload
    pub fn config_json(&self) -> serde_json::Value {
        self.config
            .as_ref()
            .and_then(|v| serde_json::to_value(v).ok())
            .unwrap_or(serde_json::Value::Object(Default::default()))
    }
}

// Default value functions
fn default_server_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("./run")
}

fn default_logs_root() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_max_retry() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    50
}

fn default_pause_after_fatal_ms() -> u64 {
    180_000 // 3 minutes
}

fn default_boot_timeout_ms() -> u64 {
    60_000
}

fn default_ready_timeout_ms() -> u64 {
    600_000 // 10 minutes
}

fn default_force_kill_timeout_ms() -> u64 {
    15_000
}

fn default_offline_ack_timeout_ms() -> u64 {
    3_000
}

fn default_service_probe_interval_ms() -> u64 {
    200
}

fn default_service_probe_max_attempts() -> u32 {
    3000
}

fn default_port_range_start() -> u16 {
    20000
}

fn default_port_range_end() -> u16 {
    30000
}

fn default_port_probe_max() -> u32 {
    1000
}

fn default_ipc_timeout_ms() -> u64 {
    10_000
}

fn default_proxy_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_health_router() -> String {
    "/status".to_string()
}

fn default_health_file() -> PathBuf {
    PathBuf::from("./run/health_check.html")
}

fn default_nginx_bin() -> String {
    "/usr/sbin/nginx".to_string()
}

fn default_nginx_config() -> PathBuf {
    PathBuf::from("/etc/nginx/nginx.conf")
}

fn default_nginx_include_path() -> PathBuf {
    PathBuf::from("./nginx")
}

fn default_nginx_command_timeout() -> u64 {
    10
}

fn default_max_fails() -> u32 {
    2
}

fn default_fail_timeout() -> String {
    "10s".to_string()
}

fn default_check() -> String {
    "interval=3000 rise=2 fall=5 timeout=1000 type=http".to_string()
}

fn default_check_keepalive_requests() -> u32 {
    1000
}

fn default_check_http_send() -> String {
    "\"GET /_ HTTP/1.0\\r\\n\\r\\n\"".to_string()
}

fn default_check_http_expect_alive() -> String {
    "http_2xx".to_string()
}

fn default_order() -> i32 {
    1000
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let sup = &self.supervisor;
        if sup.port_range_start == 0 || sup.port_range_end < sup.port_range_start {
            errors.push(format!(
                "supervisor: invalid port range {}-{}",
                sup.port_range_start, sup.port_range_end
            ));
        }
        if sup.max_retry == 0 {
            errors.push("supervisor: 'max_retry' must be greater than 0".to_string());
        }
        if self.proxy.port == 0 {
            errors.push("proxy: 'port' must be greater than 0".to_string());
        }
        if !self.proxy.health_check.router.starts_with('/') {
            errors.push("proxy.health_check: 'router' must start with '/'".to_string());
        }
        if self.proxy.backend == BackendKind::Nginx
            && shell_words::split(&self.proxy.nginx.bin)
                .map(|w| w.is_empty())
                .unwrap_or(true)
        {
            errors.push("proxy.nginx: 'bin' is not a valid command line".to_string());
        }
        for app in &self.apps {
            if !crate::descriptor::check_app_id(&app.id) {
                errors.push(format!("apps: invalid app id '{}'", app.id));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Boot-time apps in mount order
    pub fn boot_apps(&self) -> Vec<BootApp> {
        let mut apps = self.apps.clone();
        apps.sort_by_key(|a| a.order);
        apps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.supervisor.max_retry, 3);
        assert_eq!(config.supervisor.retry_delay(), Duration::from_millis(50));
        assert_eq!(
            config.supervisor.pause_after_fatal(),
            Duration::from_secs(180)
        );
        assert_eq!(config.ipc.timeout(), Duration::from_secs(10));
        assert_eq!(config.proxy.backend, BackendKind::Embedded);
        assert_eq!(config.proxy.port, 8080);
        assert_eq!(config.proxy.health_check.router, "/status");
        assert!(config.apps.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
run_dir = "/var/run/hive"

[supervisor]
max_retry = 5
boot_timeout_ms = 2000

[proxy]
backend = "nginx"
ip = "127.0.0.1"
port = 9000
index = "/portal"

[proxy.nginx]
bin = "sudo /usr/sbin/nginx"
include_path = "/etc/nginx/hive"

[proxy.nginx.upstream_check]
kind = "upstream_check_module"

[[apps]]
id = "b_1.0.0_1"
dir = "/apps/b"
order = 2

[[apps]]
id = "a_1.0.0_1"
dir = "/apps/a"
processor_num = 4
order = 1
"#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.run_dir, PathBuf::from("/var/run/hive"));
        assert_eq!(config.supervisor.max_retry, 5);
        assert_eq!(config.supervisor.boot_timeout(), Duration::from_secs(2));
        assert_eq!(config.proxy.backend, BackendKind::Nginx);
        assert_eq!(config.proxy.index.as_deref(), Some("/portal"));
        assert!(matches!(
            config.proxy.nginx.upstream_check,
            UpstreamCheck::UpstreamCheckModule { check_keepalive_requests: 1000, .. }
        ));

        let boot = config.boot_apps();
        assert_eq!(boot[0].id, "a_1.0.0_1");
        assert_eq!(boot[0].processor_num, Some(4));
        assert_eq!(boot[1].id, "b_1.0.0_1");
    }

    #[test]
    fn test_default_upstream_check() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(
            config.proxy.nginx.upstream_check,
            UpstreamCheck::Normal {
                max_fails: 2,
                fail_timeout: "10s".to_string()
            }
        );
    }

    #[test]
    fn test_validate_collects_errors() {
        let toml = r#"
[supervisor]
port_range_start = 3000
port_range_end = 2000
max_retry = 0

[[apps]]
id = "__reserved"
dir = "/x"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("invalid port range"));
        assert!(err.contains("max_retry"));
        assert!(err.contains("__reserved"));
    }

    #[test]
    fn test_manifest_command() {
        let toml = r#"
command = "./server"
args = ["--verbose"]
processor_num = 2
upstream = "port"

[env]
MODE = "prod"

[config]
greeting = "hi"
"#;
        let manifest: AppManifest = toml::from_str(toml).unwrap();
        manifest.validate().unwrap();
        assert_eq!(manifest.command.as_deref(), Some("./server"));
        assert_eq!(manifest.upstream, UpstreamMode::Port);
        assert_eq!(manifest.env.get("MODE"), Some(&"prod".to_string()));
        assert_eq!(manifest.config_json()["greeting"], "hi");
    }

    #[test]
    fn test_manifest_service() {
        let toml = r#"
[service]
exec = "java"
args = ["-jar", "app.jar", "--server.port=${targetPort}"]
router = "/java"
bind = 8080
"#;
        let manifest: AppManifest = toml::from_str(toml).unwrap();
        manifest.validate().unwrap();
        let service = manifest.service.unwrap();
        assert_eq!(service.exec, "java");
        assert_eq!(service.router.as_deref(), Some("/java"));
        assert!(service.bind.is_some());
    }

    #[test]
    fn test_manifest_requires_command_or_service() {
        let manifest: AppManifest = toml::from_str("processor_num = 0").unwrap();
        let err = manifest.validate().unwrap_err().to_string();
        assert!(err.contains("'command' or [service]"));
        assert!(err.contains("processor_num"));
    }

    #[test]
    fn test_manifest_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "command = \"sleep\"\n").unwrap();
        let manifest = AppManifest::load(dir.path()).unwrap();
        assert_eq!(manifest.command.as_deref(), Some("sleep"));
        assert!(AppManifest::load(&dir.path().join("missing")).is_err());
    }
}
