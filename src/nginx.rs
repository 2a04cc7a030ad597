//! External nginx backend
//!
//! Renders one upstream file plus one file per `{listen, server_name}` pair
//! into a staging directory, validates it with `nginx -t` against a sibling
//! copy of the main config, then swaps it into the live include directory and
//! reloads nginx. The previous directory is kept until the next push so a failed
//! reload can be rolled back.

use crate::config::{HealthCheckConfig, NginxConfig, ProxyConfig, UpstreamCheck};
use crate::descriptor::{AppKind, Target};
use crate::router::{BackendError, ListenerRoutes, ProxyBackend, RouteEntry, RoutingTable};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Comment in nginx.conf's http block where the include is injected
pub const INJECT_MARKER: &str = "# @hivegate";

const UPSTREAM_PREFIX: &str = "hivegate_";
const UPSTREAM_FILE: &str = "all_upstream.conf";
const WEBSOCKET_MAP: &str = "map $http_upgrade $connection_upgrade {default upgrade; \"\" close;}";

/// Options the renderer needs besides the table
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub default_ip: String,
    pub default_port: u16,
    pub index: Option<String>,
    pub health_check: HealthCheckConfig,
    pub upstream_check: UpstreamCheck,
}

impl RenderOptions {
    pub fn from_proxy(proxy: &ProxyConfig) -> Self {
        Self {
            default_ip: proxy.ip.clone(),
            default_port: proxy.port,
            index: proxy.index.clone(),
            health_check: proxy.health_check.clone(),
            upstream_check: proxy.nginx.upstream_check.clone(),
        }
    }

    fn default_key(&self) -> String {
        server_key(&format!("{}:{}", self.default_ip, self.default_port), "*")
    }
}

fn server_key(listener: &str, server_name: &str) -> String {
    format!("{}_{}", listener, server_name)
}

fn upstream_name(name: &str) -> String {
    format!("{}{}", UPSTREAM_PREFIX, name)
}

fn render_upstream(name: &str, entry: &RouteEntry, check: &UpstreamCheck) -> String {
    let mut out = format!("upstream {} {{\n", upstream_name(name));
    match check {
        UpstreamCheck::Normal {
            max_fails,
            fail_timeout,
        } => {
            let server = |t: &Target, backup: bool| {
                format!(
                    "\tserver {} max_fails={} fail_timeout={}{};\n",
                    t.upstream(),
                    max_fails,
                    fail_timeout,
                    if backup { " backup" } else { "" }
                )
            };
            entry.targets.iter().for_each(|t| out.push_str(&server(t, false)));
            entry.backup.iter().for_each(|t| out.push_str(&server(t, true)));
        }
        UpstreamCheck::UpstreamCheckModule {
            check,
            check_keepalive_requests,
            check_http_send,
            check_http_expect_alive,
        } => {
            for t in &entry.targets {
                let _ = writeln!(out, "\tserver {};", t.upstream());
            }
            for t in &entry.backup {
                let _ = writeln!(out, "\tserver {} backup;", t.upstream());
            }
            let _ = writeln!(out, "\tcheck {};", check);
            let _ = writeln!(out, "\tcheck_keepalive_requests {};", check_keepalive_requests);
            let _ = writeln!(out, "\tcheck_http_send {};", check_http_send);
            let _ = writeln!(out, "\tcheck_http_expect_alive {};", check_http_expect_alive);
        }
    }
    out.push('}');
    out
}

enum Location {
    Proxy {
        upstream: String,
        directives: BTreeMap<String, String>,
    },
    File(PathBuf),
    Redirect(String),
}

struct ServerBlock {
    listen: String,
    ssl: bool,
    default: bool,
    server_name: String,
    directives: BTreeMap<String, String>,
    locations: BTreeMap<String, Location>,
}

impl ServerBlock {
    fn new(listener: &ListenerRoutes, server_name: &str, default: bool) -> Self {
        Self {
            listen: listener.id(),
            ssl: false,
            default,
            server_name: if server_name == "*" {
                String::new()
            } else {
                server_name.to_string()
            },
            directives: BTreeMap::new(),
            locations: BTreeMap::new(),
        }
    }

    fn add_reserved(&mut self, options: &RenderOptions) {
        self.locations.insert(
            options.health_check.router.clone(),
            Location::File(options.health_check.file.clone()),
        );
        if let Some(index) = &options.index {
            self.locations
                .insert("/".to_string(), Location::Redirect(index.clone()));
        }
    }

    fn render(&self) -> String {
        let mut out = String::from("server {\n");
        let mut listen = self.listen.clone();
        if self.ssl {
            listen.push_str(" ssl");
        }
        if self.default {
            listen.push_str(" default_server");
        }
        let _ = writeln!(out, "  listen {};", listen);
        if !self.server_name.is_empty() {
            let _ = writeln!(out, "  server_name {};", self.server_name);
        }
        out.push_str("  keepalive_timeout 30;\n");
        for (key, value) in &self.directives {
            let _ = writeln!(out, "  {} {};", key, value);
        }

        // exact-match reserved rules first, then app prefixes longest first
        let mut reserved = Vec::new();
        let mut apps = Vec::new();
        for (router, location) in &self.locations {
            match location {
                Location::Proxy { .. } => apps.push((router.clone(), location)),
                _ => reserved.push((format!("= {}", router), location)),
            }
        }
        reserved.sort_by(|a, b| b.0.cmp(&a.0));
        apps.sort_by(|a, b| b.0.cmp(&a.0));

        for (router, location) in reserved.into_iter().chain(apps) {
            let _ = writeln!(out, "  location {} {{", router);
            match location {
                Location::Proxy {
                    upstream,
                    directives,
                } => {
                    out.push_str("    proxy_http_version 1.1;\n");
                    let _ = writeln!(out, "    proxy_pass http://{};", upstream);
                    for (key, value) in directives {
                        let _ = writeln!(out, "    {} {};", key, value);
                    }
                }
                Location::File(file) => {
                    let _ = writeln!(out, "    alias {};", file.display());
                }
                Location::Redirect(target) => {
                    let target = if target.starts_with("http") {
                        target.clone()
                    } else {
                        format!("$scheme://$http_host{}", target)
                    };
                    let _ = writeln!(out, "    return 301 {};", target);
                }
            }
            out.push_str("  }\n");
        }
        out.push('}');
        out
    }
}

/// Render every config file for `table`, keyed by file name
pub fn render_files(table: &RoutingTable, options: &RenderOptions) -> BTreeMap<String, String> {
    let mut upstreams: BTreeMap<String, String> = BTreeMap::new();
    let mut servers: BTreeMap<String, ServerBlock> = BTreeMap::new();
    let default_key = options.default_key();

    for listener in table.listeners.values() {
        if listener.kind == AppKind::Stream {
            if !listener.servers.is_empty() {
                error!(listener = %listener.id(), "nginx backend does not support stream apps, skipping");
            }
            continue;
        }
        for (server_name, entries) in &listener.servers {
            let key = server_key(&listener.id(), server_name);
            let default = key == default_key
                || listener.default_server.as_deref() == Some(server_name.as_str());
            let block = servers.entry(key.clone()).or_insert_with(|| {
                let mut block = ServerBlock::new(listener, server_name, default);
                if key == default_key {
                    block.add_reserved(options);
                }
                block
            });
            block.ssl = listener.tls_files().is_some();

            for entry in entries {
                upstreams
                    .entry(entry.name.clone())
                    .or_insert_with(|| render_upstream(&entry.name, entry, &options.upstream_check));
                let mut directives = BTreeMap::new();
                if let Some(param) = &entry.param {
                    block
                        .directives
                        .extend(param.server.iter().map(|(k, v)| (k.clone(), v.clone())));
                    directives.extend(param.location.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                block.locations.entry(entry.router.clone()).or_insert(Location::Proxy {
                    upstream: upstream_name(&entry.name),
                    directives,
                });
            }
        }
    }

    if !servers.contains_key(&default_key) {
        let default_listener = ListenerRoutes {
            ip: options.default_ip.clone(),
            port: options.default_port,
            kind: AppKind::Http,
            ssl: false,
            default_server: None,
            servers: BTreeMap::new(),
        };
        let mut block = ServerBlock::new(&default_listener, "*", true);
        block.add_reserved(options);
        servers.insert(default_key, block);
    }

    let mut files = BTreeMap::new();
    files.insert(
        UPSTREAM_FILE.to_string(),
        upstreams.into_values().collect::<Vec<_>>().join("\n"),
    );
    for (key, block) in servers {
        files.insert(format!("server_{}.conf", key), block.render());
    }
    files
}

/// Insert the include line (and websocket map) after the marker comment.
///
/// Returns `None` when the config already includes `include_glob`.
pub fn inject_include(config: &str, include_glob: &str) -> Result<Option<String>, BackendError> {
    let include_line = format!("include {};", include_glob);
    if config.lines().any(|l| l.trim() == include_line) {
        return Ok(None);
    }
    let Some(marker) = config.lines().find(|l| l.trim() == INJECT_MARKER) else {
        return Err(BackendError::Render(format!(
            "nginx config has neither `{}` nor the marker comment `{}` in its http block",
            include_line, INJECT_MARKER
        )));
    };
    let indent: String = marker.chars().take_while(|c| c.is_whitespace()).collect();
    let mut injected = String::new();
    if !config.contains("$connection_upgrade") {
        let _ = writeln!(injected, "{}{}", indent, WEBSOCKET_MAP);
        let _ = writeln!(injected, "{}proxy_set_header Upgrade $http_upgrade;", indent);
        let _ = writeln!(injected, "{}proxy_set_header Connection $connection_upgrade;", indent);
    }
    let _ = writeln!(injected, "{}{}", indent, include_line);

    let mut out = String::with_capacity(config.len() + injected.len());
    let mut done = false;
    for line in config.split_inclusive('\n') {
        out.push_str(line);
        if !done && line.trim() == INJECT_MARKER {
            if !line.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&injected);
            done = true;
        }
    }
    Ok(Some(out))
}

#[derive(Default)]
struct NginxState {
    /// Live directory was replaced by the last commit and `.previous` holds the old one
    swapped: bool,
}

/// Backend driving an external nginx process
pub struct NginxBackend {
    nginx: NginxConfig,
    options: RenderOptions,
    state: Mutex<NginxState>,
}

impl NginxBackend {
    /// Prepare the include directory and wire it into nginx.conf
    pub fn new(proxy: &ProxyConfig) -> Result<Self, BackendError> {
        let backend = Self {
            nginx: proxy.nginx.clone(),
            options: RenderOptions::from_proxy(proxy),
            state: Mutex::new(NginxState::default()),
        };
        std::fs::create_dir_all(backend.live_dir())?;
        let main = std::fs::read_to_string(&backend.nginx.config)?;
        if let Some(patched) = inject_include(&main, &backend.include_glob(&backend.live_dir()))? {
            std::fs::write(&backend.nginx.config, patched)?;
            info!(config = %backend.nginx.config.display(), "Injected include into nginx config");
        }
        Ok(backend)
    }

    fn live_dir(&self) -> PathBuf {
        self.nginx.include_path.join("http")
    }

    fn staging_dir(&self) -> PathBuf {
        self.nginx.include_path.join(".staging")
    }

    fn previous_dir(&self) -> PathBuf {
        self.nginx.include_path.join(".previous")
    }

    fn check_config_path(&self) -> PathBuf {
        let mut name = self
            .nginx
            .config
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".hivegate-check");
        self.nginx.config.with_file_name(name)
    }

    fn error_backup_dir(&self) -> PathBuf {
        let parent = self
            .nginx
            .include_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        parent
            .join("nginx_error_config")
            .join(chrono::Local::now().format("%Y%m%d_%H%M%S_%3f").to_string())
    }

    fn include_glob(&self, dir: &Path) -> String {
        format!("{}/*.conf", dir.display())
    }

    /// Run the configured nginx binary with `args`
    async fn run(&self, args: &[&str]) -> Result<(), String> {
        let mut argv = shell_words::split(&self.nginx.bin).map_err(|e| e.to_string())?;
        if argv.is_empty() {
            return Err("empty nginx command".to_string());
        }
        let program = argv.remove(0);
        let mut cmd = Command::new(&program);
        cmd.args(&argv).args(args).kill_on_drop(true);
        if let Some(prefix) = &self.nginx.prefix {
            cmd.arg("-p").arg(prefix);
        }
        debug!(program, ?args, "Running nginx");
        let output = tokio::time::timeout(self.nginx.command_timeout(), cmd.output())
            .await
            .map_err(|_| format!("nginx did not finish within {}s", self.nginx.command_timeout_secs))?
            .map_err(|e| format!("failed to run {}: {}", program, e))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    fn backup_failed(&self, dir: &Path) {
        if !dir.exists() {
            return;
        }
        let backup = self.error_backup_dir();
        let moved = backup
            .parent()
            .map(std::fs::create_dir_all)
            .transpose()
            .and_then(|_| std::fs::rename(dir, &backup));
        match moved {
            Ok(()) => warn!(backup = %backup.display(), "Saved failed nginx config"),
            Err(e) => {
                warn!(error = %e, "Failed to back up nginx config, discarding");
                let _ = std::fs::remove_dir_all(dir);
            }
        }
    }
}

#[async_trait]
impl ProxyBackend for NginxBackend {
    fn name(&self) -> &'static str {
        "nginx"
    }

    async fn render(&self, table: &RoutingTable) -> Result<(), BackendError> {
        let staging = self.staging_dir();
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;
        let files = render_files(table, &self.options);
        for (name, content) in &files {
            std::fs::write(staging.join(name), content)?;
        }
        debug!(files = files.len(), dir = %staging.display(), "Rendered nginx config");
        Ok(())
    }

    async fn validate(&self) -> Result<(), BackendError> {
        let main = std::fs::read_to_string(&self.nginx.config)?;
        let live = format!("include {};", self.include_glob(&self.live_dir()));
        let staged = format!("include {};", self.include_glob(&self.staging_dir()));
        let check_path = self.check_config_path();
        std::fs::write(&check_path, main.replace(&live, &staged))?;

        let config = check_path.to_string_lossy().to_string();
        let result = self.run(&["-t", "-c", &config]).await;
        let _ = std::fs::remove_file(&check_path);
        result.map_err(|stderr| {
            error!(stderr = %stderr, "nginx rejected the generated config");
            BackendError::Validate(stderr)
        })
    }

    async fn commit(&self) -> Result<(), BackendError> {
        let live = self.live_dir();
        let previous = self.previous_dir();
        if previous.exists() {
            std::fs::remove_dir_all(&previous)?;
        }
        if live.exists() {
            std::fs::rename(&live, &previous)?;
        }
        std::fs::rename(self.staging_dir(), &live)?;
        self.state.lock().swapped = true;

        let config = self.nginx.config.to_string_lossy().to_string();
        self.run(&["-s", "reload", "-c", &config])
            .await
            .map_err(|stderr| {
                error!(stderr = %stderr, "nginx reload failed");
                BackendError::Commit(stderr)
            })?;
        self.state.lock().swapped = false;
        info!("nginx reloaded");
        Ok(())
    }

    async fn rollback(&self) -> Result<(), BackendError> {
        self.backup_failed(&self.staging_dir());

        let swapped = std::mem::take(&mut self.state.lock().swapped);
        if !swapped {
            return Ok(());
        }
        let live = self.live_dir();
        self.backup_failed(&live);
        let previous = self.previous_dir();
        if previous.exists() {
            std::fs::rename(&previous, &live)?;
        } else {
            std::fs::create_dir_all(&live)?;
        }
        let config = self.nginx.config.to_string_lossy().to_string();
        self.run(&["-s", "reload", "-c", &config])
            .await
            .map_err(BackendError::Rollback)?;
        warn!("Restored previous nginx config");
        Ok(())
    }
}
