//! Newline-delimited JSON transport for IPC envelopes over a unix stream
//!
//! The orchestrator creates a socket pair per worker and hands the child end
//! to the worker as fd 3. Each side then runs one reader and one writer task.

use crate::ipc::{Endpoint, Envelope};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

/// File descriptor a worker finds its end of the link on
pub const IPC_FD: RawFd = 3;

/// Environment variable announcing the link fd to a worker
pub const IPC_FD_ENV: &str = "HIVE_IPC_FD";

/// A peer sending a longer frame is disconnected
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A running link to one peer
pub struct Link {
    /// Outgoing side, cloneable
    pub endpoint: Endpoint,
    /// Incoming envelopes; yields `None` once the peer disconnects
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}

/// Start reader and writer tasks for `stream` and return the link handles
pub fn attach(stream: UnixStream, peer_pid: u32) -> Link {
    attach_with_limit(stream, peer_pid, MAX_FRAME_LEN)
}

fn attach_with_limit(stream: UnixStream, peer_pid: u32, max_frame_len: usize) -> Link {
    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Envelope>();

    tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            let mut frame = match serde_json::to_vec(&envelope) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(peer_pid, error = %e, "Failed to encode envelope");
                    continue;
                }
            };
            frame.push(b'\n');
            if let Err(e) = write_half.write_all(&frame).await {
                debug!(peer_pid, error = %e, "IPC write failed, closing link");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    tokio::spawn(async move {
        let mut frames = FramedRead::new(read_half, LinesCodec::new_with_max_length(max_frame_len));
        while let Some(frame) = frames.next().await {
            let line = match frame {
                Ok(line) => line,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(peer_pid, limit = max_frame_len, "Oversized IPC frame, closing link");
                    break;
                }
                Err(LinesCodecError::Io(e)) => {
                    debug!(peer_pid, error = %e, "IPC read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Envelope>(&line) {
                Ok(envelope) => {
                    if in_tx.send(envelope).is_err() {
                        break;
                    }
                }
                Err(e) => debug!(peer_pid, error = %e, "Ignoring unrecognized IPC frame"),
            }
        }
    });

    Link {
        endpoint: Endpoint::new(peer_pid, out_tx),
        inbound: in_rx,
    }
}

/// Create a connected pair: the parent end ready for [`attach`], the child
/// end to be inherited by a worker
pub fn socket_pair() -> io::Result<(UnixStream, std::os::unix::net::UnixStream)> {
    let (parent, child) = std::os::unix::net::UnixStream::pair()?;
    parent.set_nonblocking(true)?;
    Ok((UnixStream::from_std(parent)?, child))
}

/// Arrange for `child_end` to appear as [`IPC_FD`] in the process `cmd` spawns
pub fn inherit(cmd: &mut Command, child_end: &std::os::unix::net::UnixStream) {
    let fd = child_end.as_raw_fd();
    cmd.env(IPC_FD_ENV, IPC_FD.to_string());
    // SAFETY: only async-signal-safe libc calls run between fork and exec
    unsafe {
        cmd.pre_exec(move || {
            if fd == IPC_FD {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(io::Error::last_os_error());
                }
            } else if libc::dup2(fd, IPC_FD) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Open the link a worker inherited from its supervisor
pub fn from_env() -> io::Result<UnixStream> {
    let fd: RawFd = std::env::var(IPC_FD_ENV)
        .map_err(|_| io::Error::new(io::ErrorKind::NotFound, format!("{} is not set", IPC_FD_ENV)))?
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("{} is not a number", IPC_FD_ENV)))?;
    // SAFETY: the supervisor hands exactly one socket to each worker on this fd
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Body, Channel, CommandTag, HandlerRegistry, DEFAULT_TIMEOUT};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_envelopes_cross_the_socket() {
        let (a, b) = UnixStream::pair().unwrap();
        let left = attach(a, 2);
        let mut right = attach(b, 1);

        left.endpoint
            .post(Envelope::notify("ready", json!({ "router": "/x" })))
            .unwrap();
        let received = right.inbound.recv().await.unwrap();
        match received.body {
            Body::Event { action, data } => {
                assert_eq!(action, "ready");
                assert_eq!(data["router"], "/x");
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_peer_close_ends_inbound() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut link = attach(a, 2);
        drop(b);
        assert!(link.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_garbage_lines_are_skipped() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut link = attach(a, 2);
        let valid = serde_json::to_string(&Envelope::notify("ping", json!(1))).unwrap();
        b.write_all(format!("not json\n\n{}\n", valid).as_bytes())
            .await
            .unwrap();
        let envelope = link.inbound.recv().await.unwrap();
        assert!(matches!(envelope.body, Body::Event { ref action, .. } if action == "ping"));
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_link() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut link = attach_with_limit(a, 2, 128);
        let valid = serde_json::to_string(&Envelope::notify("ping", json!(1))).unwrap();
        b.write_all(format!("{}\n", valid).as_bytes()).await.unwrap();
        assert!(link.inbound.recv().await.is_some());

        // no newline ever arrives; the reader must give up at the limit
        b.write_all(&[b'x'; 4096]).await.unwrap();
        let closed = tokio::time::timeout(std::time::Duration::from_secs(5), link.inbound.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
        drop(b);
    }

    #[tokio::test]
    async fn test_call_over_socket_pair() {
        let (a, b) = UnixStream::pair().unwrap();
        let master_link = attach(a, 200);
        let worker_link = attach(b, 100);

        let master = Channel::with_pid(100, DEFAULT_TIMEOUT);
        let worker = Channel::with_pid(200, DEFAULT_TIMEOUT);
        let mut handlers = HandlerRegistry::new();
        handlers.on_command(CommandTag::List, |_| async { Ok(json!({ "apps": 0 })) });

        tokio::spawn(crate::ipc::pump(
            Arc::clone(&master),
            master_link.inbound,
            master_link.endpoint.clone(),
            Arc::new(handlers),
        ));
        tokio::spawn(crate::ipc::pump(
            Arc::clone(&worker),
            worker_link.inbound,
            worker_link.endpoint.clone(),
            Arc::new(HandlerRegistry::new()),
        ));

        let reply = worker
            .call(&worker_link.endpoint, CommandTag::List, vec![])
            .await
            .unwrap();
        assert_eq!(reply["apps"], 0);
    }
}
