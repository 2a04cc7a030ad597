//! Transport address allocation for workers
//!
//! Socket workers get `<run_dir>/<app_id>.<n>.sock`, with `n` drawn from a
//! counter that only moves forward, so a reload generation never reuses a path
//! still held by the generation it replaces. Port workers lease ports from a
//! shared range.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Connect timeout used when checking whether a port is taken
const PORT_CHECK_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, thiserror::Error)]
pub enum AllocError {
    #[error("no free socket slot for {app_id}")]
    SocketsExhausted { app_id: String },
    #[error("no free port in {start}-{end} after {probes} probes")]
    PortsExhausted { start: u16, end: u16, probes: u32 },
}

/// Socket path namespace for one application
#[derive(Debug)]
pub struct SocketNamespace {
    run_dir: PathBuf,
    app_id: String,
    next_index: u32,
}

impl SocketNamespace {
    pub fn new(run_dir: impl Into<PathBuf>, app_id: impl Into<String>) -> Self {
        Self {
            run_dir: run_dir.into(),
            app_id: app_id.into(),
            next_index: 1,
        }
    }

    /// Path for slot `n`
    pub fn path(&self, n: u32) -> PathBuf {
        self.run_dir.join(format!("{}.{}.sock", self.app_id, n))
    }

    /// Reserve `size` fresh socket paths for a new generation
    pub fn next_generation(&mut self, size: usize) -> Vec<PathBuf> {
        let start = self.next_index;
        self.next_index += size as u32;
        (start..self.next_index).map(|n| self.path(n)).collect()
    }

    /// First slot of the generation not held by a live worker
    pub fn pick<'a>(
        &self,
        slots: &'a [PathBuf],
        in_use: &HashSet<&Path>,
    ) -> Result<&'a Path, AllocError> {
        slots
            .iter()
            .map(PathBuf::as_path)
            .find(|p| !in_use.contains(p))
            .ok_or_else(|| AllocError::SocketsExhausted {
                app_id: self.app_id.clone(),
            })
    }
}

/// Remove a socket file left behind by a worker, ignoring missing files
pub fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed socket file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "Failed to remove socket file"),
    }
}

/// Port range shared by every supervisor on the host
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    max_probe: u32,
    cursor: u16,
    leased: HashSet<u16>,
}

pub type SharedPortAllocator = Arc<Mutex<PortAllocator>>;

impl PortAllocator {
    pub fn new(start: u16, end: u16, max_probe: u32) -> Self {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        Self {
            start,
            end,
            max_probe,
            cursor: start,
            leased: HashSet::new(),
        }
    }

    pub fn shared(start: u16, end: u16, max_probe: u32) -> SharedPortAllocator {
        Arc::new(Mutex::new(Self::new(start, end, max_probe)))
    }

    /// Lease the next free port, probing linearly with wraparound
    pub fn allocate(&mut self) -> Result<u16, AllocError> {
        let range_len = u32::from(self.end - self.start) + 1;
        let probes = self.max_probe.min(range_len);
        for _ in 0..probes {
            let port = self.cursor;
            self.cursor = if self.cursor >= self.end {
                self.start
            } else {
                self.cursor + 1
            };
            if self.leased.contains(&port) {
                continue;
            }
            if port_is_free(port) {
                self.leased.insert(port);
                debug!(port, "Leased port");
                return Ok(port);
            }
        }
        Err(AllocError::PortsExhausted {
            start: self.start,
            end: self.end,
            probes,
        })
    }

    pub fn release(&mut self, port: u16) {
        self.leased.remove(&port);
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.leased.contains(&port)
    }
}

/// A port is free when nothing accepts a connection on it
fn port_is_free(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, PORT_CHECK_TIMEOUT).is_err()
}
