//! Application identity and routing descriptors
//!
//! An app id has the shape `name[_x.y.z][_build]`. The derived weight orders
//! versions of the same app so the router can pick the active one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tracing::{error, warn};

/// Positional base for version components in [`weight`]
const WEIGHT_BASE: f64 = 10000.0;

/// Semantic version triple, `0.0.0` when absent from the app id
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a strict `x.y.z` triple of decimal numbers
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let major = parse_digits(parts.next()?)?;
        let minor = parse_digits(parts.next()?)?;
        let patch = parse_digits(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn parse_digits(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Identity facts parsed from an app id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub name: String,
    pub version: Version,
    pub build_num: u32,
}

/// Split an app id into name, version and build number.
///
/// Accepted shapes, tried in order: `name_x.y.z_b`, `name_x.y.z`, `name_b`.
/// Anything else is treated as a bare name at version `0.0.0`, build `0`.
pub fn parse_app_id(app_id: &str) -> AppIdentity {
    let bare = || AppIdentity {
        name: app_id.to_string(),
        version: Version::default(),
        build_num: 0,
    };

    let Some((head, last)) = app_id.rsplit_once('_') else {
        return bare();
    };

    if let Some(build_num) = parse_digits(last) {
        if let Some((name, version)) = head.rsplit_once('_') {
            if let Some(version) = Version::parse(version) {
                if !name.is_empty() {
                    return AppIdentity {
                        name: name.to_string(),
                        version,
                        build_num,
                    };
                }
            }
        }
        if !head.is_empty() {
            return AppIdentity {
                name: head.to_string(),
                version: Version::default(),
                build_num,
            };
        }
        return bare();
    }

    match Version::parse(last) {
        Some(version) if !head.is_empty() => AppIdentity {
            name: head.to_string(),
            version,
            build_num: 0,
        },
        _ => bare(),
    }
}

/// Validate an app id supplied to mount/unmount.
///
/// Ids start with a letter, use `[A-Za-z0-9_.-]`, and may not use the
/// reserved `__` prefix.
pub fn check_app_id(app_id: &str) -> bool {
    if app_id.len() < 2 || app_id.starts_with("__") {
        return false;
    }
    let mut chars = app_id.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    first_ok
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Ordering key for versions of one app: a base-10000 positional value of the
/// version triple, with the build number as a fractional tiebreak
pub fn weight(version: Version, build_num: u32) -> f64 {
    version.major as f64 * WEIGHT_BASE * WEIGHT_BASE
        + version.minor as f64 * WEIGHT_BASE
        + version.patch as f64
        + build_num as f64 / WEIGHT_BASE
}

/// How traffic reaches an application
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    #[default]
    Http,
    #[serde(alias = "socket")]
    Stream,
    /// Supervised but never routed
    Daemon,
}

impl fmt::Display for AppKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppKind::Http => "http",
            AppKind::Stream => "stream",
            AppKind::Daemon => "daemon",
        };
        f.write_str(s)
    }
}

/// Address a worker listens on
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    Port(u16),
    Sock(PathBuf),
}

impl Target {
    /// Upstream form used in rendered proxy configs
    pub fn upstream(&self) -> String {
        match self {
            Target::Port(port) => format!("127.0.0.1:{}", port),
            Target::Sock(path) => format!("unix:{}", path.display()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.upstream())
    }
}

/// One normalized listen address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BindAddr {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub default: bool,
}

impl BindAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            ssl: false,
            default: false,
        }
    }

    /// Listener key, `ip:port`
    pub fn id(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// A value given either once or as a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v.clone()],
            OneOrMany::Many(v) => v.clone(),
        }
    }
}

/// Bind entry as written by an app: a port, `"port"`, `"ip:port"`,
/// `"*:port"`, or a full table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BindEntry {
    Port(u16),
    Text(String),
    Full {
        #[serde(default)]
        ip: Option<String>,
        port: u16,
        #[serde(default)]
        ssl: bool,
        #[serde(default)]
        default: bool,
    },
}

impl BindEntry {
    pub fn normalize(&self) -> Option<BindAddr> {
        match self {
            BindEntry::Port(port) => Some(BindAddr::new("0.0.0.0", *port)),
            BindEntry::Text(text) => parse_bind_text(text.trim()),
            BindEntry::Full {
                ip,
                port,
                ssl,
                default,
            } => {
                let ip = match ip.as_deref() {
                    None | Some("*") | Some("") => "0.0.0.0".to_string(),
                    Some(ip) => ip.to_string(),
                };
                Some(BindAddr {
                    ip,
                    port: *port,
                    ssl: *ssl,
                    default: *default,
                })
            }
        }
    }
}

fn parse_bind_text(text: &str) -> Option<BindAddr> {
    if let Some(port) = parse_digits(text) {
        return u16::try_from(port).ok().map(|p| BindAddr::new("0.0.0.0", p));
    }
    let (ip, port) = text.split_once(':')?;
    let port = u16::try_from(parse_digits(port.trim())?).ok()?;
    let ip = ip.trim();
    if ip == "*" {
        return Some(BindAddr::new("0.0.0.0", port));
    }
    let octets: Vec<&str> = ip.split('.').collect();
    let is_ipv4 = octets.len() == 4 && octets.iter().all(|o| parse_digits(o).is_some());
    is_ipv4.then(|| BindAddr::new(ip, port))
}

/// Normalize a list of bind entries, dropping invalid ones
pub fn normalize_binds(app_id: &str, entries: &[BindEntry]) -> Vec<BindAddr> {
    entries
        .iter()
        .filter_map(|entry| {
            let bind = entry.normalize();
            if bind.is_none() {
                error!(app_id, ?entry, "Invalid bind entry, ignoring");
            }
            bind
        })
        .collect()
}

/// Normalize a router prefix so it always ends with `/`
pub fn normalize_router(router: Option<&str>) -> String {
    match router.map(str::trim) {
        None | Some("") => "/".to_string(),
        Some(r) => {
            let mut r = if r.starts_with('/') {
                r.to_string()
            } else {
                format!("/{}", r)
            };
            if !r.ends_with('/') {
                r.push('/');
            }
            r
        }
    }
}

/// Normalize server names; empty means wildcard
pub fn normalize_server_names(app_id: &str, names: &[String]) -> Vec<String> {
    let mut out: Vec<String> = names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .filter(|n| {
            let ok = n
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '*'));
            if !ok {
                error!(app_id, server_name = n, "Illegal server name, ignoring");
            }
            ok
        })
        .map(String::from)
        .collect();
    if out.is_empty() {
        out.push("*".to_string());
    }
    out
}

/// Extra proxy directives an app asks for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyParam {
    /// Server-level directives, e.g. `ssl_certificate`
    #[serde(default)]
    pub server: BTreeMap<String, String>,
    /// Location-level directives
    #[serde(default)]
    pub location: BTreeMap<String, String>,
}

impl ProxyParam {
    pub fn tls_files(&self) -> Option<(&str, &str)> {
        let cert = self.server.get("ssl_certificate")?;
        let key = self.server.get("ssl_certificate_key")?;
        Some((cert.as_str(), key.as_str()))
    }
}

/// Routing facts a worker reports in its `ready` message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadyInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<OneOrMany<BindEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router: Option<String>,
    #[serde(default, alias = "serverName", skip_serializing_if = "Option::is_none")]
    pub server_name: Option<OneOrMany<String>>,
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<AppKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<ProxyParam>,
}

impl ReadyInfo {
    /// A worker that names no bind, router or server name serves no traffic
    pub fn is_daemon(&self) -> bool {
        self.kind == Some(AppKind::Daemon)
            || (self.bind.is_none() && self.router.is_none() && self.server_name.is_none())
    }
}

/// Whether a registered descriptor takes part in routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteStatus {
    On,
    Off,
}

/// Identity and routing facts for one running version of one application
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationDescriptor {
    pub app_id: String,
    pub name: String,
    pub version: Version,
    pub build_num: u32,
    pub weight: f64,
    pub kind: AppKind,
    /// `None` routes through the proxy's default listener
    pub bind: Option<Vec<BindAddr>>,
    pub router: String,
    pub server_names: Vec<String>,
    pub targets: Vec<Target>,
    pub status: RouteStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<ProxyParam>,
}

impl ApplicationDescriptor {
    /// Build a descriptor from a worker's ready info and the generation's targets
    pub fn from_ready(app_id: &str, ready: &ReadyInfo, targets: Vec<Target>) -> Self {
        let identity = parse_app_id(app_id);
        let kind = if ready.is_daemon() {
            AppKind::Daemon
        } else {
            ready.kind.unwrap_or_default()
        };
        let server_names = if kind == AppKind::Stream {
            vec!["*".to_string()]
        } else {
            let names = ready
                .server_name
                .as_ref()
                .map(OneOrMany::to_vec)
                .unwrap_or_default();
            normalize_server_names(app_id, &names)
        };
        let bind = ready.bind.as_ref().map(|b| {
            let binds = normalize_binds(app_id, &b.to_vec());
            if binds.is_empty() {
                warn!(app_id, "No valid bind entries, using default listener");
            }
            binds
        });
        let bind = bind.filter(|b| !b.is_empty());

        Self {
            app_id: app_id.to_string(),
            weight: weight(identity.version, identity.build_num),
            name: identity.name,
            version: identity.version,
            build_num: identity.build_num,
            kind,
            bind,
            router: normalize_router(ready.router.as_deref()),
            server_names,
            targets,
            status: RouteStatus::On,
            param: ready.param.clone(),
        }
    }

    /// Resolve the bind list against the proxy defaults
    pub fn binds_or(&self, default_ip: &str, default_port: u16) -> Vec<BindAddr> {
        match &self.bind {
            Some(binds) => binds.clone(),
            None => vec![BindAddr::new(default_ip, default_port)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_app_id() {
        let id = parse_app_id("simple-app_1.2.3_4");
        assert_eq!(id.name, "simple-app");
        assert_eq!(id.version, Version::new(1, 2, 3));
        assert_eq!(id.build_num, 4);
    }

    #[test]
    fn test_parse_partial_app_ids() {
        let id = parse_app_id("simple-app_1.2.3");
        assert_eq!(id.name, "simple-app");
        assert_eq!(id.version, Version::new(1, 2, 3));
        assert_eq!(id.build_num, 0);

        let id = parse_app_id("simple_app_7");
        assert_eq!(id.name, "simple_app");
        assert_eq!(id.version, Version::default());
        assert_eq!(id.build_num, 7);

        let id = parse_app_id("simple-app");
        assert_eq!(id.name, "simple-app");
        assert_eq!(id.build_num, 0);

        let id = parse_app_id("app_1.2_3");
        assert_eq!(id.name, "app_1.2");
        assert_eq!(id.build_num, 3);
    }

    #[test]
    fn test_check_app_id() {
        assert!(check_app_id("simple-app_1.0.0_1"));
        assert!(check_app_id("ab"));
        assert!(!check_app_id("__admin__"));
        assert!(!check_app_id("1app"));
        assert!(!check_app_id("a"));
        assert!(!check_app_id("app/../x"));
    }

    #[test]
    fn test_weight_orders_versions_then_builds() {
        let a = weight(Version::new(1, 0, 0), 1);
        let b = weight(Version::new(1, 1, 0), 1);
        let c = weight(Version::new(1, 1, 0), 2);
        let d = weight(Version::new(2, 0, 0), 0);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
        // components never overflow into each other
        assert!(weight(Version::new(0, 9999, 9999), 9999) < weight(Version::new(1, 0, 0), 0));
    }

    #[test]
    fn test_bind_normalization() {
        let entries: OneOrMany<BindEntry> =
            serde_json::from_str(r#"[8080, "9090", "127.0.0.1:7000", "*:6000", "bad:port", {"port": 443, "ssl": true}]"#)
                .unwrap();
        let binds = normalize_binds("app", &entries.to_vec());
        assert_eq!(binds.len(), 5);
        assert_eq!(binds[0], BindAddr::new("0.0.0.0", 8080));
        assert_eq!(binds[1], BindAddr::new("0.0.0.0", 9090));
        assert_eq!(binds[2], BindAddr::new("127.0.0.1", 7000));
        assert_eq!(binds[3], BindAddr::new("0.0.0.0", 6000));
        assert!(binds[4].ssl);
        assert_eq!(binds[4].id(), "0.0.0.0:443");
    }

    #[test]
    fn test_router_normalization() {
        assert_eq!(normalize_router(None), "/");
        assert_eq!(normalize_router(Some("/example")), "/example/");
        assert_eq!(normalize_router(Some("api")), "/api/");
        assert_eq!(normalize_router(Some("/a/")), "/a/");
    }

    #[test]
    fn test_server_name_normalization() {
        assert_eq!(normalize_server_names("app", &[]), vec!["*"]);
        let names = vec![" a.com ".to_string(), "b c".to_string()];
        assert_eq!(normalize_server_names("app", &names), vec!["a.com"]);
    }

    #[test]
    fn test_descriptor_from_ready() {
        let ready: ReadyInfo = serde_json::from_str(
            r#"{"bind": "8080", "router": "/example", "serverName": ["a.com"]}"#,
        )
        .unwrap();
        let targets = vec![Target::Sock(PathBuf::from("/run/app.1.sock"))];
        let desc = ApplicationDescriptor::from_ready("example_1.0.0_2", &ready, targets);
        assert_eq!(desc.name, "example");
        assert_eq!(desc.kind, AppKind::Http);
        assert_eq!(desc.router, "/example/");
        assert_eq!(desc.server_names, vec!["a.com"]);
        assert_eq!(desc.bind, Some(vec![BindAddr::new("0.0.0.0", 8080)]));
        assert_eq!(desc.status, RouteStatus::On);
        assert_eq!(desc.targets.len(), 1);
    }

    #[test]
    fn test_empty_ready_is_daemon() {
        let ready = ReadyInfo::default();
        assert!(ready.is_daemon());
        let desc = ApplicationDescriptor::from_ready("cron_1.0.0_1", &ready, vec![]);
        assert_eq!(desc.kind, AppKind::Daemon);
    }

    #[test]
    fn test_stream_kind_forces_wildcard() {
        let ready: ReadyInfo =
            serde_json::from_str(r#"{"bind": 6000, "type": "socket", "serverName": "x.com"}"#)
                .unwrap();
        let desc = ApplicationDescriptor::from_ready("tcp_1.0.0_1", &ready, vec![Target::Port(20001)]);
        assert_eq!(desc.kind, AppKind::Stream);
        assert_eq!(desc.server_names, vec!["*"]);
    }

    #[test]
    fn test_target_serde() {
        let t: Vec<Target> = serde_json::from_str(r#"[3000, "/tmp/a.sock"]"#).unwrap();
        assert_eq!(t[0], Target::Port(3000));
        assert_eq!(t[1], Target::Sock(PathBuf::from("/tmp/a.sock")));
        assert_eq!(t[0].upstream(), "127.0.0.1:3000");
        assert_eq!(t[1].upstream(), "unix:/tmp/a.sock");
    }
}
