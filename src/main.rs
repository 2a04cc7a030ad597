use hivegate::config::{BackendKind, Config};
use hivegate::nginx::NginxBackend;
use hivegate::orchestrator::{MountOptions, Orchestrator};
use hivegate::proxy::EmbeddedBackend;
use hivegate::router::ProxyBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// File under `run_dir` naming the state SIGUSR2 switches to
const SERVER_STATUS_FILE: &str = "server.status";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hivegate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("hivegate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    std::fs::create_dir_all(&config.server.run_dir).map_err(|e| {
        anyhow::anyhow!(
            "Failed to create run dir '{}': {}",
            config.server.run_dir.display(),
            e
        )
    })?;

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.clone();
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let backend: Arc<dyn ProxyBackend> = match config.proxy.backend {
        BackendKind::Embedded => Arc::new(EmbeddedBackend::new(&config.proxy)),
        BackendKind::Nginx => Arc::new(NginxBackend::new(&config.proxy)?),
    };
    info!(backend = backend.name(), "Proxy backend selected");

    let boot_apps = config.boot_apps();
    let orchestrator = Orchestrator::new(config, backend);

    // the default server and health route exist before any app mounts
    if let Err(e) = orchestrator.router().recompute().await {
        error!(error = %e, "Failed to publish initial routes");
        orchestrator.shutdown().await;
        return Err(e.into());
    }
    if let Err(e) = orchestrator.online().await {
        warn!(error = %e, "Failed to write health check file");
    }

    for app in boot_apps {
        let mut options = MountOptions::new(&app.dir);
        options.processor_num = app.processor_num;
        match orchestrator.mount(&app.id, options).await {
            Ok(()) => info!(app_id = %app.id, "Boot app mounted"),
            Err(e) => {
                error!(app_id = %app.id, code = e.code().as_str(), error = %e, "Boot app failed to mount")
            }
        }
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or an online/offline toggle (SIGUSR2)
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigusr2 = signal(SignalKind::user_defined2())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sigusr2.recv() => {
                    let status_file = orchestrator.config().server.run_dir.join(SERVER_STATUS_FILE);
                    let go_online = wants_online(&status_file, orchestrator.is_online());
                    info!(path = %status_file.display(), online = go_online, "Received SIGUSR2, switching server state");
                    let result = if go_online {
                        orchestrator.online().await
                    } else {
                        orchestrator.offline().await
                    };
                    if let Err(e) = result {
                        error!(error = %e, "Failed to switch server state");
                    }
                }
            }
        }
    }

    orchestrator.shutdown().await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Target state named by the status file, or the opposite of `online` when it names none
fn wants_online(path: &Path, online: bool) -> bool {
    match std::fs::read_to_string(path) {
        Ok(content) => match content.trim() {
            "online" => true,
            "offline" => false,
            other => {
                warn!(path = %path.display(), content = other, "Unrecognized server status, toggling");
                !online
            }
        },
        Err(_) => !online,
    }
}

/// PID file handle that maintains an exclusive lock
struct PidFile {
    _file: std::fs::File,
}

impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting application orchestrator");
    info!(
        server_root = %config.server.server_root.display(),
        run_dir = %config.server.run_dir.display(),
        logs_root = %config.server.logs_root.display(),
        "Server paths"
    );
    info!(
        backend = ?config.proxy.backend,
        ip = %config.proxy.ip,
        port = config.proxy.port,
        health_check = %config.proxy.health_check.router,
        "Proxy settings"
    );
    info!(
        max_retry = config.supervisor.max_retry,
        boot_timeout_ms = config.supervisor.boot_timeout_ms,
        ready_timeout_ms = config.supervisor.ready_timeout_ms,
        force_kill_timeout_ms = config.supervisor.force_kill_timeout_ms,
        "Supervisor policy"
    );
    info!(
        app_count = config.apps.len(),
        apps = ?config.apps.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(),
        "Boot applications"
    );
}
