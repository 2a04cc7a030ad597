//! Hivegate - a single-host application supervisor and reverse-proxy orchestrator
//!
//! This library:
//! - Runs each mounted application version as a pool of worker processes
//! - Restarts crashed workers with bounded retries and a cool-down
//! - Swaps worker generations on reload without dropping traffic
//! - Routes by host and path prefix to the highest version of each app
//! - Drives either an embedded hyper proxy or an external nginx
//! - Talks to workers over a request/reply IPC channel on inherited sockets

pub mod alloc;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod ipc;
pub mod link;
pub mod nginx;
pub mod orchestrator;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod router;
pub mod supervisor;
pub mod worker;
