//! Worker-side runtime
//!
//! A worker process started by a supervisor calls [`Worker::connect`] to pick
//! up its launch config and IPC link, serves traffic on
//! [`Worker::target`], announces itself with [`Worker::ready`] and exits once
//! [`Worker::stopped`] resolves.

use crate::descriptor::{ReadyInfo, Target};
use crate::ipc::{self, Channel, CommandTag, Endpoint, HandlerRegistry, IpcError, Message};
use crate::link;
use crate::process::LaunchConfig;
use crate::supervisor::{ExitReason, EXIT_REASON_EVENT, OFFLINE_EVENT, ONLINE_EVENT, READY_EVENT};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Time allowed for the supervisor to acknowledge an exit reason
const EXIT_REPORT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Worker {
    launch: LaunchConfig,
    channel: Arc<Channel>,
    parent: Endpoint,
    serving: watch::Receiver<bool>,
    stopped: watch::Receiver<bool>,
}

impl Worker {
    /// Attach to the supervisor that spawned this process
    pub fn connect() -> anyhow::Result<Self> {
        let launch = LaunchConfig::from_env()?;
        let stream = link::from_env()?;
        Ok(Self::attach(launch, stream, std::os::unix::process::parent_id()))
    }

    /// Attach over an already open link; `connect` uses this with the inherited fd
    pub fn attach(launch: LaunchConfig, stream: tokio::net::UnixStream, parent_pid: u32) -> Self {
        let link = link::attach(stream, parent_pid);
        let channel = Channel::new(ipc::DEFAULT_TIMEOUT);
        let (serving_tx, serving) = watch::channel(true);
        let (stopped_tx, stopped) = watch::channel(false);
        let serving_tx = Arc::new(serving_tx);
        let stopped_tx = Arc::new(stopped_tx);

        let mut handlers = HandlerRegistry::new();
        let (serving_off, stop) = (Arc::clone(&serving_tx), Arc::clone(&stopped_tx));
        handlers.on_event(OFFLINE_EVENT, move |_, data| {
            let stop_requested = data["stop"].as_bool().unwrap_or(false);
            if stop_requested {
                info!("Stop requested by supervisor");
                let _ = stop.send(true);
            } else {
                info!("Server offline");
            }
            let _ = serving_off.send(false);
            async { Ok(Value::Null) }
        });
        let serving_on = Arc::clone(&serving_tx);
        handlers.on_event(ONLINE_EVENT, move |_, _| {
            info!("Server online");
            let _ = serving_on.send(true);
            async { Ok(Value::Null) }
        });

        let pump = ipc::pump(
            Arc::clone(&channel),
            link.inbound,
            link.endpoint.clone(),
            Arc::new(handlers),
        );
        tokio::spawn(async move {
            pump.await;
            // supervisor gone; nothing left to serve for
            let _ = stopped_tx.send(true);
        });

        Self {
            launch,
            channel,
            parent: link.endpoint,
            serving,
            stopped,
        }
    }

    pub fn launch(&self) -> &LaunchConfig {
        &self.launch
    }

    pub fn app_id(&self) -> &str {
        &self.launch.app_id
    }

    /// Transport this worker must listen on
    pub fn target(&self) -> Option<Target> {
        self.launch.target()
    }

    /// Tell the supervisor this worker serves traffic; sent once
    pub async fn ready(&self, info: ReadyInfo) -> Result<(), IpcError> {
        let data = serde_json::to_value(&info).unwrap_or(Value::Null);
        self.channel
            .send(&self.parent, Message::event(READY_EVENT, data))
            .await?;
        debug!(app_id = %self.launch.app_id, "Ready acknowledged");
        Ok(())
    }

    /// Classify the exit this worker is about to make
    pub async fn report_exit(&self, reason: ExitReason) -> Result<(), IpcError> {
        let message = Message::event(EXIT_REASON_EVENT, json!({ "reason": reason }))
            .with_timeout(EXIT_REPORT_TIMEOUT);
        self.channel.send(&self.parent, message).await?;
        Ok(())
    }

    /// Call an orchestrator command
    pub async fn call(&self, command: CommandTag, args: Vec<Value>) -> Result<Value, IpcError> {
        self.channel.call(&self.parent, command, args).await
    }

    /// Whether the server is currently taking traffic
    pub fn is_serving(&self) -> bool {
        *self.serving.borrow()
    }

    /// Resolves once the supervisor asks this worker to stop or the link drops
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        let _ = stopped.wait_for(|s| *s).await;
    }
}
