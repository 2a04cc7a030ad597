//! Request/reply and group messaging between the orchestrator and its workers
//!
//! Each process owns one [`Channel`]. Calls are tracked by id in a pending
//! table and resolved exactly once: by the matching reply, by a synthesized
//! send failure, or by their own timeout. Anything else arriving on a link is
//! classified by [`Channel::receive`]:
//!
//! 1. a reply whose id is pending resolves that call
//! 2. a reply whose id is no longer pending (late or unknown) is dropped
//! 3. an envelope addressed to a group is fanned out to every member, and one
//!    aggregated reply is returned once all members have answered
//! 4. a call runs the handler registered for its [`CommandTag`]
//! 5. an event runs the handler registered for its action name
//!
//! Envelopes nobody handles are ignored.

use crate::error::{ErrorCode, ErrorReply};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// Reply window used when neither the message nor the channel sets one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, thiserror::Error)]
pub enum IpcError {
    #[error("no reply from pid {pid} for '{action}' within {timeout_ms}ms")]
    Timeout {
        pid: u32,
        action: String,
        timeout_ms: u64,
    },
    #[error("failed to send '{action}' to pid {pid}: link closed")]
    SendFailed { pid: u32, action: String },
    #[error("reply listener dropped")]
    Closed,
    #[error("unknown group: {0}")]
    UnknownGroup(String),
    #[error("{0}")]
    Remote(ErrorReply),
}

impl IpcError {
    pub fn code(&self) -> ErrorCode {
        match self {
            IpcError::Timeout { .. } => ErrorCode::Timeout,
            IpcError::SendFailed { .. } => ErrorCode::IpcSendFailed,
            IpcError::Closed => ErrorCode::IpcClosed,
            IpcError::UnknownGroup(_) => ErrorCode::ParamError,
            IpcError::Remote(reply) => reply.code,
        }
    }

    pub fn to_reply(&self) -> ErrorReply {
        match self {
            IpcError::Remote(reply) => reply.clone(),
            other => ErrorReply::new(other.code(), other.to_string()),
        }
    }
}

/// Closed set of commands a worker may invoke on the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandTag {
    Mount,
    Unmount,
    Reload,
    List,
    Status,
    Online,
    Offline,
    CleanExitRecord,
    AppPids,
}

impl CommandTag {
    pub const ALL: [CommandTag; 9] = [
        CommandTag::Mount,
        CommandTag::Unmount,
        CommandTag::Reload,
        CommandTag::List,
        CommandTag::Status,
        CommandTag::Online,
        CommandTag::Offline,
        CommandTag::CleanExitRecord,
        CommandTag::AppPids,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandTag::Mount => "mount",
            CommandTag::Unmount => "unmount",
            CommandTag::Reload => "reload",
            CommandTag::List => "list",
            CommandTag::Status => "status",
            CommandTag::Online => "online",
            CommandTag::Offline => "offline",
            CommandTag::CleanExitRecord => "clean_exit_record",
            CommandTag::AppPids => "app_pids",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_str() == s)
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    Call {
        command: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Event {
        action: String,
        #[serde(default)]
        data: Value,
    },
    Reply {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorReply>,
        #[serde(default)]
        data: Value,
    },
}

impl Body {
    fn label(&self) -> &str {
        match self {
            Body::Call { command, .. } => command,
            Body::Event { action, .. } => action,
            Body::Reply { .. } => "reply",
        }
    }
}

/// One frame on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    #[serde(flatten)]
    pub body: Body,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub from: u32,
    #[serde(default)]
    pub to: u32,
}

impl Envelope {
    /// One-way event with a fresh id, no reply expected
    pub fn notify(action: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            body: Body::Event {
                action: action.into(),
                data,
            },
            group: None,
            timeout_ms: None,
            from: std::process::id(),
            to: 0,
        }
    }

    /// Reply to `request`, addressed back to its sender
    pub fn reply_to(request: &Envelope, from: u32, result: Result<Value, ErrorReply>) -> Self {
        let body = match result {
            Ok(data) => Body::Reply { error: None, data },
            Err(error) => Body::Reply {
                error: Some(error),
                data: Value::Null,
            },
        };
        Self {
            id: request.id,
            body,
            group: None,
            timeout_ms: None,
            from,
            to: request.from,
        }
    }
}

/// Outgoing message before an id is assigned
#[derive(Debug, Clone)]
pub struct Message {
    pub body: Body,
    pub group: Option<String>,
    pub timeout: Option<Duration>,
}

impl Message {
    pub fn call(command: CommandTag, args: Vec<Value>) -> Self {
        Self {
            body: Body::Call {
                command: command.as_str().to_string(),
                args,
            },
            group: None,
            timeout: None,
        }
    }

    pub fn event(action: impl Into<String>, data: Value) -> Self {
        Self {
            body: Body::Event {
                action: action.into(),
                data,
            },
            group: None,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Address the message to every member of a group on the receiving side
    pub fn to_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Write side of a link to one peer process.
///
/// `post` is the raw primitive: single shot, no acknowledgement.
#[derive(Clone)]
pub struct Endpoint {
    pid: u32,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint").field("pid", &self.pid).finish()
    }
}

impl Endpoint {
    pub fn new(pid: u32, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { pid, tx }
    }

    /// Endpoint backed by an in-memory queue, for wiring channels together
    pub fn pair(pid: u32) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(pid, tx), rx)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn post(&self, envelope: Envelope) -> Result<(), IpcError> {
        let action = envelope.body.label().to_string();
        self.tx.send(envelope).map_err(|_| IpcError::SendFailed {
            pid: self.pid,
            action,
        })
    }
}

/// Resolves a group name to its current members
pub trait GroupMembers: Send + Sync {
    fn members(&self) -> Vec<Endpoint>;
}

pub type HandlerResult = Result<Value, ErrorReply>;
type CommandHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
type EventHandler = Arc<dyn Fn(u32, Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Typed handlers for incoming calls and events
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    commands: HashMap<CommandTag, CommandHandler>,
    events: HashMap<String, EventHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_command<F, Fut>(&mut self, tag: CommandTag, handler: F) -> &mut Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.commands
            .insert(tag, Arc::new(move |args| Box::pin(handler(args))));
        self
    }

    /// Register an event handler; it receives the sender's pid and the payload
    pub fn on_event<F, Fut>(&mut self, action: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(u32, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.events.insert(
            action.into(),
            Arc::new(move |pid, data| Box::pin(handler(pid, data))),
        );
        self
    }

    pub fn has_command(&self, tag: CommandTag) -> bool {
        self.commands.contains_key(&tag)
    }
}

/// How [`Channel::receive`] classified an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Resolved,
    LateReply,
    GroupFanOut(String),
    Command(CommandTag),
    UnknownCommand(String),
    Event(String),
    Ignored,
}

struct Pending {
    tx: oneshot::Sender<HandlerResult>,
}

/// Per-process IPC channel
pub struct Channel {
    local_pid: u32,
    default_timeout: Duration,
    pending: DashMap<Uuid, Pending>,
    groups: DashMap<String, Arc<dyn GroupMembers>>,
}

impl Channel {
    pub fn new(default_timeout: Duration) -> Arc<Self> {
        Self::with_pid(std::process::id(), default_timeout)
    }

    pub fn with_pid(local_pid: u32, default_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            local_pid,
            default_timeout,
            pending: DashMap::new(),
            groups: DashMap::new(),
        })
    }

    pub fn local_pid(&self) -> u32 {
        self.local_pid
    }

    /// Number of calls still waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a message and wait for its reply
    pub async fn send(&self, target: &Endpoint, message: Message) -> Result<Value, IpcError> {
        let timeout = message.timeout.unwrap_or(self.default_timeout);
        let id = Uuid::new_v4();
        let action = message.body.label().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Pending { tx });

        let envelope = Envelope {
            id,
            body: message.body,
            group: message.group,
            timeout_ms: Some(timeout.as_millis() as u64),
            from: self.local_pid,
            to: target.pid(),
        };
        if let Err(e) = target.post(envelope) {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(data))) => Ok(data),
            Ok(Ok(Err(reply))) => Err(IpcError::Remote(reply)),
            Ok(Err(_)) => Err(IpcError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                warn!(pid = target.pid(), action, "IPC call timed out");
                Err(IpcError::Timeout {
                    pid: target.pid(),
                    action,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    pub async fn call(
        &self,
        target: &Endpoint,
        command: CommandTag,
        args: Vec<Value>,
    ) -> Result<Value, IpcError> {
        self.send(target, Message::call(command, args)).await
    }

    pub fn bind_group(&self, group: impl Into<String>, members: Arc<dyn GroupMembers>) {
        self.groups.insert(group.into(), members);
    }

    pub fn unbind_group(&self, group: &str) {
        self.groups.remove(group);
    }

    /// Send to every member of a locally bound group and collect one result per member
    pub async fn broadcast(
        &self,
        group: &str,
        message: Message,
    ) -> Result<BTreeMap<u32, HandlerResult>, IpcError> {
        let members = self
            .groups
            .get(group)
            .map(|g| g.members())
            .ok_or_else(|| IpcError::UnknownGroup(group.to_string()))?;
        Ok(self.fan_out(&members, message).await)
    }

    async fn fan_out(&self, members: &[Endpoint], message: Message) -> BTreeMap<u32, HandlerResult> {
        let calls = members.iter().map(|member| {
            let message = Message {
                group: None,
                ..message.clone()
            };
            async move {
                let result = self.send(member, message).await.map_err(|e| e.to_reply());
                (member.pid(), result)
            }
        });
        futures::future::join_all(calls).await.into_iter().collect()
    }

    /// Classify and dispatch one incoming envelope from `source`
    pub fn receive(
        self: &Arc<Self>,
        envelope: Envelope,
        source: &Endpoint,
        handlers: &HandlerRegistry,
    ) -> Received {
        if let Body::Reply { error, data } = &envelope.body {
            return match self.pending.remove(&envelope.id) {
                Some((_, pending)) => {
                    let result = match error {
                        Some(e) => Err(e.clone()),
                        None => Ok(data.clone()),
                    };
                    let _ = pending.tx.send(result);
                    Received::Resolved
                }
                None => {
                    debug!(id = %envelope.id, from = envelope.from, "Ignoring late or unknown reply");
                    Received::LateReply
                }
            };
        }

        if let Some(group) = envelope.group.clone() {
            return self.dispatch_group(envelope, group, source);
        }

        match &envelope.body {
            Body::Call { command, args } => {
                let handler = CommandTag::parse(command)
                    .and_then(|tag| handlers.commands.get(&tag).cloned().map(|h| (tag, h)));
                let Some((tag, handler)) = handler else {
                    warn!(command, from = envelope.from, "Unknown IPC command");
                    let reply = Envelope::reply_to(
                        &envelope,
                        self.local_pid,
                        Err(ErrorReply::new(
                            ErrorCode::UnknownCommand,
                            format!("unknown command: {}", command),
                        )),
                    );
                    let _ = source.post(reply);
                    return Received::UnknownCommand(command.clone());
                };
                let fut = handler(args.clone());
                self.spawn_reply(envelope, source.clone(), fut);
                Received::Command(tag)
            }
            Body::Event { action, data } => {
                let Some(handler) = handlers.events.get(action).cloned() else {
                    debug!(action, from = envelope.from, "No handler for IPC event");
                    return Received::Ignored;
                };
                let action = action.clone();
                let fut = handler(source.pid(), data.clone());
                self.spawn_reply(envelope, source.clone(), fut);
                Received::Event(action)
            }
            Body::Reply { .. } => Received::Ignored,
        }
    }

    fn dispatch_group(self: &Arc<Self>, envelope: Envelope, group: String, source: &Endpoint) -> Received {
        let Some(members) = self.groups.get(&group).map(|g| g.members()) else {
            let reply = Envelope::reply_to(
                &envelope,
                self.local_pid,
                Err(IpcError::UnknownGroup(group.clone()).to_reply()),
            );
            let _ = source.post(reply);
            return Received::Ignored;
        };

        let channel = Arc::clone(self);
        let source = source.clone();
        let timeout = envelope.timeout_ms.map(Duration::from_millis);
        let message = Message {
            body: envelope.body.clone(),
            group: None,
            timeout,
        };
        tokio::spawn(async move {
            let results = channel.fan_out(&members, message).await;
            let aggregate: serde_json::Map<String, Value> = results
                .into_iter()
                .map(|(pid, result)| {
                    let value = match result {
                        Ok(data) => serde_json::json!({ "data": data }),
                        Err(error) => serde_json::json!({ "error": error }),
                    };
                    (pid.to_string(), value)
                })
                .collect();
            let reply = Envelope::reply_to(&envelope, channel.local_pid, Ok(Value::Object(aggregate)));
            if let Err(e) = source.post(reply) {
                debug!(error = %e, "Failed to deliver group reply");
            }
        });
        Received::GroupFanOut(group)
    }

    fn spawn_reply(
        &self,
        request: Envelope,
        source: Endpoint,
        fut: BoxFuture<'static, HandlerResult>,
    ) {
        let local_pid = self.local_pid;
        tokio::spawn(async move {
            let result = fut.await;
            let reply = Envelope::reply_to(&request, local_pid, result);
            if let Err(e) = source.post(reply) {
                debug!(error = %e, "Failed to deliver reply");
            }
        });
    }
}

/// Feed every envelope arriving on `inbound` into `channel` until the link closes
pub async fn pump(
    channel: Arc<Channel>,
    mut inbound: mpsc::UnboundedReceiver<Envelope>,
    source: Endpoint,
    handlers: Arc<HandlerRegistry>,
) {
    while let Some(envelope) = inbound.recv().await {
        channel.receive(envelope, &source, &handlers);
    }
    debug!(pid = source.pid(), "IPC link closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Wire two channels together through in-memory endpoints
    fn connect(
        a: &Arc<Channel>,
        a_handlers: HandlerRegistry,
        b: &Arc<Channel>,
        b_handlers: HandlerRegistry,
    ) -> (Endpoint, Endpoint) {
        let (to_b, b_inbound) = Endpoint::pair(b.local_pid());
        let (to_a, a_inbound) = Endpoint::pair(a.local_pid());
        tokio::spawn(pump(Arc::clone(b), b_inbound, to_a.clone(), Arc::new(b_handlers)));
        tokio::spawn(pump(Arc::clone(a), a_inbound, to_b.clone(), Arc::new(a_handlers)));
        (to_b, to_a)
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope {
            id: Uuid::nil(),
            body: Body::Call {
                command: "list".to_string(),
                args: vec![],
            },
            group: None,
            timeout_ms: Some(10),
            from: 1,
            to: 2,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "call");
        assert_eq!(json["command"], "list");
        assert!(json.get("group").is_none());

        let parsed: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_command_tag_parse() {
        for tag in CommandTag::ALL {
            assert_eq!(CommandTag::parse(tag.as_str()), Some(tag));
        }
        assert_eq!(CommandTag::parse("$mount"), None);
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let master = Channel::with_pid(1, DEFAULT_TIMEOUT);
        let worker = Channel::with_pid(2, DEFAULT_TIMEOUT);
        let mut handlers = HandlerRegistry::new();
        handlers.on_command(CommandTag::AppPids, |args| async move {
            Ok(json!({ "app": args.first().cloned().unwrap_or(Value::Null), "pids": [10, 11] }))
        });
        let (_to_worker, to_master) = connect(&master, handlers, &worker, HandlerRegistry::new());

        let reply = worker
            .call(&to_master, CommandTag::AppPids, vec![json!("app_1.0.0_1")])
            .await
            .unwrap();
        assert_eq!(reply["app"], "app_1.0.0_1");
        assert_eq!(reply["pids"], json!([10, 11]));
        assert_eq!(worker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_command_replies_error() {
        let master = Channel::with_pid(1, DEFAULT_TIMEOUT);
        let worker = Channel::with_pid(2, DEFAULT_TIMEOUT);
        let (_to_worker, to_master) =
            connect(&master, HandlerRegistry::new(), &worker, HandlerRegistry::new());

        let err = worker
            .call(&to_master, CommandTag::Reload, vec![])
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownCommand);
    }

    #[tokio::test]
    async fn test_handler_error_is_remote() {
        let master = Channel::with_pid(1, DEFAULT_TIMEOUT);
        let worker = Channel::with_pid(2, DEFAULT_TIMEOUT);
        let mut handlers = HandlerRegistry::new();
        handlers.on_command(CommandTag::Unmount, |_| async {
            Err(ErrorReply::new(ErrorCode::AppNotMounted, "nope"))
        });
        let (_to_worker, to_master) = connect(&master, handlers, &worker, HandlerRegistry::new());

        let err = worker
            .call(&to_master, CommandTag::Unmount, vec![json!("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Remote(ref r) if r.code == ErrorCode::AppNotMounted));
    }

    #[tokio::test]
    async fn test_timeout_fires_once_and_late_reply_is_ignored() {
        let channel = Channel::with_pid(1, DEFAULT_TIMEOUT);
        let (target, mut outbox) = Endpoint::pair(2);

        let message = Message::event("slow", Value::Null).with_timeout(Duration::from_millis(50));
        let err = channel.send(&target, message).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert_eq!(err.to_reply().code, ErrorCode::Timeout);
        assert_eq!(channel.pending_count(), 0);

        let request = outbox.recv().await.unwrap();
        let late = Envelope::reply_to(&request, 2, Ok(json!("too late")));
        let (source, _rx) = Endpoint::pair(2);
        let outcome = channel.receive(late, &source, &HandlerRegistry::new());
        assert_eq!(outcome, Received::LateReply);
    }

    #[tokio::test]
    async fn test_send_failure_is_immediate() {
        let channel = Channel::with_pid(1, DEFAULT_TIMEOUT);
        let (target, outbox) = Endpoint::pair(2);
        drop(outbox);

        let started = std::time::Instant::now();
        let err = channel
            .send(&target, Message::event("ping", Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::IpcSendFailed);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unhandled_event_is_ignored() {
        let channel = Channel::with_pid(1, DEFAULT_TIMEOUT);
        let (source, _rx) = Endpoint::pair(2);
        let envelope = Envelope::notify("whatever", Value::Null);
        assert_eq!(
            channel.receive(envelope, &source, &HandlerRegistry::new()),
            Received::Ignored
        );
    }

    struct StaticGroup(Vec<Endpoint>);

    impl GroupMembers for StaticGroup {
        fn members(&self) -> Vec<Endpoint> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_broadcast_collects_every_member() {
        let master = Channel::with_pid(1, DEFAULT_TIMEOUT);
        let mut members = Vec::new();
        for pid in [11, 12, 13] {
            let worker = Channel::with_pid(pid, DEFAULT_TIMEOUT);
            let mut handlers = HandlerRegistry::new();
            handlers.on_event("offline", move |_, _| async move { Ok(json!(pid)) });
            let (to_worker, _to_master) = connect(&master, HandlerRegistry::new(), &worker, handlers);
            members.push(to_worker);
        }
        master.bind_group("app", Arc::new(StaticGroup(members)));

        let results = master
            .broadcast("app", Message::event("offline", Value::Null))
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[&12].as_ref().unwrap(), &json!(12));

        let err = master
            .broadcast("missing", Message::event("offline", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::UnknownGroup(_)));
    }

    #[tokio::test]
    async fn test_group_message_aggregates_replies() {
        let master = Channel::with_pid(1, DEFAULT_TIMEOUT);
        let mut members = Vec::new();
        for pid in [21, 22] {
            let worker = Channel::with_pid(pid, DEFAULT_TIMEOUT);
            let mut handlers = HandlerRegistry::new();
            handlers.on_event("flush", move |_, _| async move { Ok(json!({ "flushed": pid })) });
            let (to_worker, _) = connect(&master, HandlerRegistry::new(), &worker, handlers);
            members.push(to_worker);
        }
        master.bind_group("app", Arc::new(StaticGroup(members)));

        let caller = Channel::with_pid(30, DEFAULT_TIMEOUT);
        let (_to_caller, to_master) =
            connect(&master, HandlerRegistry::new(), &caller, HandlerRegistry::new());
        let reply = caller
            .send(&to_master, Message::event("flush", Value::Null).to_group("app"))
            .await
            .unwrap();
        assert_eq!(reply["21"]["data"]["flushed"], 21);
        assert_eq!(reply["22"]["data"]["flushed"], 22);
    }
}
