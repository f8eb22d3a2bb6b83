//! gRPC bridge to extensions living in a separate process.
//!
//! Has no teacher analogue (`trovochat` has no RPC layer); the transport
//! choice is grounded in the `tonic`/`prost` toolchain used for this exact
//! "bidirectional stream, proto-defined messages" shape elsewhere in the
//! retrieval pack. The bridge reuses the local [`crate::event::EventDispatcher`]
//! and [`crate::command::CommandDispatcher`] verbatim: a remote registration
//! is just a local registration whose handler serializes and forwards
//! instead of running the extension's code in-process.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};

use crate::command::{CommandDispatcher, CommandSpec, Handler};
use crate::event::{EventDispatcher, EventHandler};
use crate::provider::{CmdEvent, IrcEvent, Writer};

pub mod pb {
    tonic::include_proto!("botcore");
}

const STREAM_ID_SPACE: u32 = u16::MAX as u32 + 1;

/// Allocates 16-bit stream ids for one extension: a wrapping counter that
/// skips any id still live in that extension's outstanding map.
#[derive(Default)]
struct StreamIdAllocator {
    next: AtomicU16,
}

impl StreamIdAllocator {
    fn allocate(&self, live: &HashSet<u16>) -> Option<u16> {
        if live.len() as u32 >= STREAM_ID_SPACE {
            return None;
        }
        loop {
            let candidate = self.next.fetch_add(1, Ordering::Relaxed);
            if !live.contains(&candidate) {
                return Some(candidate);
            }
        }
    }
}

/// Per-extension bookkeeping: every registration id it owns (for
/// `onDisconnect`), the writer each live stream id routes output back to,
/// and the channel feeding its outbound gRPC stream.
struct ExtensionHandle {
    name: String,
    owned_event_ids: SyncRwLock<HashSet<u64>>,
    owned_command_ids: SyncRwLock<HashSet<u64>>,
    stream_writers: SyncRwLock<HashMap<u16, Arc<dyn Writer>>>,
    stream_ids: StreamIdAllocator,
    /// Set by whichever of the `Events`/`Commands` RPCs the extension has
    /// opened. Independent of each other and of registration: a fresh
    /// handle is created the first time either stream connects, and
    /// re-connecting (e.g. Events before Commands) must not clobber a
    /// channel the other stream already installed.
    events_tx: SyncRwLock<Option<mpsc::Sender<Result<pb::IrcEventResponse, Status>>>>,
    commands_tx: SyncRwLock<Option<mpsc::Sender<Result<pb::CmdEventResponse, Status>>>>,
}

impl ExtensionHandle {
    fn allocate_stream(&self, writer: Arc<dyn Writer>) -> Option<u16> {
        let mut writers = self.stream_writers.write();
        let live: HashSet<u16> = writers.keys().copied().collect();
        let id = self.stream_ids.allocate(&live)?;
        writers.insert(id, writer);
        Some(id)
    }

    /// An empty `msg` signals end-of-stream for that id; reap it.
    fn route_write(&self, stream_id: u16, msg: &[u8]) {
        if msg.is_empty() {
            self.stream_writers.write().remove(&stream_id);
            return;
        }
        let writer = self.stream_writers.read().get(&stream_id).cloned();
        match writer {
            Some(w) => {
                let _ = w.write(msg);
            }
            None => log::warn!(
                "extension {:?} wrote to unknown stream id {}",
                self.name,
                stream_id
            ),
        }
    }
}

fn to_pb_event(event: &IrcEvent) -> pb::IrcEvent {
    pb::IrcEvent {
        name: event.name.clone(),
        sender: event.sender.clone(),
        args: event.args.clone(),
        time_unix_seconds: event.time_unix_seconds as i64,
        net: event.network_id.clone(),
    }
}

fn to_pb_cmd_event(event: &CmdEvent) -> pb::CmdEvent {
    pb::CmdEvent {
        irc_event: event.event.as_ref().map(to_pb_event),
        user: event.user.as_ref().map(|u| pb::User {
            nick: u.nick.clone(),
            user: u.user.clone(),
            host: u.host.clone(),
        }),
        stored_user: event.stored_user.as_ref().map(|u| pb::StoredUser {
            username: u.username.clone(),
        }),
        user_chan_modes: event.user_modes.as_ref().map(|m| pb::UserModes {
            modes: m.0.iter().collect(),
        }),
        channel: event.channel.as_ref().map(|c| pb::Channel { name: c.name.clone() }),
        target_channel: event.target_channel.as_ref().map(|c| pb::Channel { name: c.name.clone() }),
        target_users: event
            .target_users
            .iter()
            .map(|(k, u)| {
                (
                    k.clone(),
                    pb::User {
                        nick: u.nick.clone(),
                        user: u.user.clone(),
                        host: u.host.clone(),
                    },
                )
            })
            .collect(),
        target_stored_users: event
            .target_stored_users
            .iter()
            .map(|(k, u)| (k.clone(), pb::StoredUser { username: u.username.clone() }))
            .collect(),
        target_variadic_users: event
            .target_var_users
            .iter()
            .map(|u| pb::User {
                nick: u.nick.clone(),
                user: u.user.clone(),
                host: u.host.clone(),
            })
            .collect(),
        target_variadic_stored_users: event
            .target_var_stored_users
            .iter()
            .map(|u| pb::StoredUser { username: u.username.clone() })
            .collect(),
        args: event.args.clone(),
    }
}

/// A raw-event subscription proxied to a remote extension: instead of
/// running locally, it serializes the event and pushes it onto the
/// extension's outbound stream.
struct RemoteEventProxy {
    /// Set once, right after the trie hands back the registration id —
    /// the proxy needs to know its own id to stamp outgoing envelopes,
    /// but the id doesn't exist until after this value is already moved
    /// into the trie.
    id: Arc<AtomicU64>,
    handle: Arc<ExtensionHandle>,
}

#[async_trait]
impl EventHandler for RemoteEventProxy {
    async fn handle(&self, writer: Arc<dyn Writer>, event: IrcEvent) {
        let Some(stream_id) = self.handle.allocate_stream(writer) else {
            log::error!("extension {:?} has exhausted its stream id space", self.handle.name);
            return;
        };
        let envelope = pb::IrcEventResponse {
            id: self.id.load(Ordering::Relaxed),
            event: Some(to_pb_event(&event)),
            stream_id: stream_id as u32,
        };
        let tx = self.handle.events_tx.read().clone();
        match tx {
            Some(tx) => {
                if tx.send(Ok(envelope)).await.is_err() {
                    log::warn!("extension {:?} event stream closed", self.handle.name);
                }
            }
            None => log::warn!("extension {:?} has no open event stream", self.handle.name),
        }
    }

    fn source_file(&self) -> &'static str {
        "src/remote/mod.rs"
    }
}

/// A command registration proxied to a remote extension.
struct RemoteCommandProxy {
    id: Arc<AtomicU64>,
    handle: Arc<ExtensionHandle>,
}

#[async_trait]
impl Handler for RemoteCommandProxy {
    async fn cmd(&self, name: &str, writer: Arc<dyn Writer>, event: CmdEvent) {
        let Some(stream_id) = self.handle.allocate_stream(writer) else {
            log::error!("extension {:?} has exhausted its stream id space", self.handle.name);
            return;
        };
        let envelope = pb::CmdEventResponse {
            id: self.id.load(Ordering::Relaxed),
            name: name.to_string(),
            event: Some(to_pb_cmd_event(&event)),
            stream_id: stream_id as u32,
        };
        let tx = self.handle.commands_tx.read().clone();
        match tx {
            Some(tx) => {
                if tx.send(Ok(envelope)).await.is_err() {
                    log::warn!("extension {:?} command stream closed", self.handle.name);
                }
            }
            None => log::warn!("extension {:?} has no open command stream", self.handle.name),
        }
    }

    fn source_file(&self) -> &'static str {
        "src/remote/mod.rs"
    }
}

/// Tracks connected extensions and proxies their registrations into the
/// local event/command dispatchers.
pub struct RemoteBridge {
    extensions: SyncRwLock<HashMap<String, Arc<ExtensionHandle>>>,
}

impl Default for RemoteBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteBridge {
    pub fn new() -> Self {
        Self {
            extensions: SyncRwLock::new(HashMap::new()),
        }
    }

    /// Fetches the bookkeeping handle for an extension, creating it on
    /// first contact. `Events` and `Commands` are two independent streams
    /// opened by the same extension; either may connect first, so this
    /// must not replace a handle the other stream already installed.
    fn get_or_create(&self, extension: &str) -> Arc<ExtensionHandle> {
        if let Some(existing) = self.extensions.read().get(extension).cloned() {
            return existing;
        }
        self.extensions
            .write()
            .entry(extension.to_string())
            .or_insert_with(|| {
                Arc::new(ExtensionHandle {
                    name: extension.to_string(),
                    owned_event_ids: SyncRwLock::new(HashSet::new()),
                    owned_command_ids: SyncRwLock::new(HashSet::new()),
                    stream_writers: SyncRwLock::new(HashMap::new()),
                    stream_ids: StreamIdAllocator::default(),
                    events_tx: SyncRwLock::new(None),
                    commands_tx: SyncRwLock::new(None),
                })
            })
            .clone()
    }

    /// Installs the outbound channel for the `Events` RPC and returns the
    /// receiver half for the gRPC service to hand back as the server
    /// stream.
    fn connect_events(&self, extension: &str) -> mpsc::Receiver<Result<pb::IrcEventResponse, Status>> {
        let handle = self.get_or_create(extension);
        let (tx, rx) = mpsc::channel(64);
        *handle.events_tx.write() = Some(tx);
        rx
    }

    fn connect_commands(&self, extension: &str) -> mpsc::Receiver<Result<pb::CmdEventResponse, Status>> {
        let handle = self.get_or_create(extension);
        let (tx, rx) = mpsc::channel(64);
        *handle.commands_tx.write() = Some(tx);
        rx
    }

    fn handle_for(&self, extension: &str) -> Option<Arc<ExtensionHandle>> {
        self.extensions.read().get(extension).cloned()
    }

    pub fn register_event(
        &self,
        dispatcher: &EventDispatcher,
        extension: &str,
        network: &str,
        channel: &str,
        event: &str,
    ) -> Option<u64> {
        let handle = self.handle_for(extension)?;
        let id_cell = Arc::new(AtomicU64::new(0));
        let id = dispatcher.register(
            network,
            channel,
            event,
            Box::new(RemoteEventProxy {
                id: id_cell.clone(),
                handle: handle.clone(),
            }),
        );
        id_cell.store(id, Ordering::Relaxed);
        handle.owned_event_ids.write().insert(id);
        Some(id)
    }

    pub fn register_command(
        &self,
        dispatcher: &CommandDispatcher,
        extension: &str,
        network: &str,
        channel: &str,
        spec_parts: RemoteCommandParts,
    ) -> Option<Result<u64, crate::command::RegisterError>> {
        let handle = self.handle_for(extension)?;
        let id_cell = Arc::new(AtomicU64::new(0));
        let proxy: Arc<dyn Handler> = Arc::new(RemoteCommandProxy {
            id: id_cell.clone(),
            handle: handle.clone(),
        });
        let mut builder = CommandSpec::builder(spec_parts.name, extension, spec_parts.description, proxy)
            .args(&spec_parts.args.iter().map(String::as_str).collect::<Vec<_>>());
        if spec_parts.require_auth {
            builder = builder.require_auth(spec_parts.req_level, spec_parts.req_flags);
        }
        let spec = match builder.build() {
            Ok(s) => s,
            Err(e) => return Some(Err(e)),
        };
        let result = dispatcher.register(network, channel, spec);
        if let Ok(id) = result {
            id_cell.store(id, Ordering::Relaxed);
            handle.owned_command_ids.write().insert(id);
        }
        Some(result)
    }

    /// An extension disconnected: unregister everything it owned from
    /// both dispatchers and drop its bookkeeping.
    pub fn on_disconnect(&self, extension: &str, events: &EventDispatcher, commands: &CommandDispatcher) {
        let Some(handle) = self.extensions.write().remove(extension) else {
            return;
        };
        for id in handle.owned_event_ids.read().iter() {
            events.unregister(*id);
        }
        for id in handle.owned_command_ids.read().iter() {
            commands.unregister(*id);
        }
        log::warn!("extension {:?} disconnected, unregistered its handlers", extension);
    }

    pub fn route_write_request(&self, extension: &str, stream_id: u16, msg: &[u8]) {
        if let Some(handle) = self.handle_for(extension) {
            handle.route_write(stream_id, msg);
        }
    }
}

/// The caller-facing fields needed to proxy a `RegisterCmdRequest` into a
/// local [`CommandSpec`]; kept separate from the generated `pb` type so
/// callers outside the gRPC service impl can use it too.
pub struct RemoteCommandParts {
    pub name: String,
    pub description: String,
    pub args: Vec<String>,
    pub require_auth: bool,
    pub req_level: u8,
    pub req_flags: String,
}

/// The gRPC service: wires incoming RPCs to [`RemoteBridge`] plus the two
/// local dispatchers.
pub struct DispatcherService {
    pub events: Arc<EventDispatcher>,
    pub commands: Arc<CommandDispatcher>,
    pub bridge: Arc<RemoteBridge>,
}

fn extension_of<T>(request: &Request<T>) -> Result<String, Status> {
    request
        .metadata()
        .get("x-extension")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| Status::invalid_argument("missing x-extension metadata"))
}

#[tonic::async_trait]
impl pb::dispatcher_server::Dispatcher for DispatcherService {
    type EventsStream = Pin<Box<dyn Stream<Item = Result<pb::IrcEventResponse, Status>> + Send + 'static>>;
    type CommandsStream = Pin<Box<dyn Stream<Item = Result<pb::CmdEventResponse, Status>> + Send + 'static>>;

    async fn register(&self, request: Request<pb::RegisterRequest>) -> Result<Response<pb::RegisterResponse>, Status> {
        let req = request.into_inner();
        let id = self
            .bridge
            .register_event(&self.events, &req.extension, &req.network, &req.channel, &req.event)
            .ok_or_else(|| Status::failed_precondition("extension has not connected its stream yet"))?;
        Ok(Response::new(pb::RegisterResponse { id }))
    }

    async fn register_cmd(
        &self,
        request: Request<pb::RegisterCmdRequest>,
    ) -> Result<Response<pb::RegisterResponse>, Status> {
        let req = request.into_inner();
        let parts = RemoteCommandParts {
            name: req.name,
            description: req.description,
            args: req.args,
            require_auth: req.require_auth,
            req_level: req.req_level.min(u8::MAX as u32) as u8,
            req_flags: req.req_flags,
        };
        match self
            .bridge
            .register_command(&self.commands, &req.extension, &req.network, &req.channel, parts)
        {
            None => Err(Status::failed_precondition("extension has not connected its stream yet")),
            Some(Err(e)) => Err(Status::invalid_argument(e.to_string())),
            Some(Ok(id)) => Ok(Response::new(pb::RegisterResponse { id })),
        }
    }

    async fn unregister(&self, request: Request<pb::UnregisterRequest>) -> Result<Response<pb::OpResult>, Status> {
        let req = request.into_inner();
        let ok = self.events.unregister(req.id) || self.commands.unregister(req.id);
        Ok(Response::new(pb::OpResult { ok }))
    }

    async fn unregister_all(
        &self,
        request: Request<pb::UnregisterAllRequest>,
    ) -> Result<Response<pb::OpResult>, Status> {
        let req = request.into_inner();
        self.bridge.on_disconnect(&req.extension, &self.events, &self.commands);
        Ok(Response::new(pb::OpResult { ok: true }))
    }

    async fn events(
        &self,
        request: Request<Streaming<pb::WriteRequest>>,
    ) -> Result<Response<Self::EventsStream>, Status> {
        let extension = extension_of(&request)?;
        let rx = self.bridge.connect_events(&extension);
        let bridge = self.bridge.clone();
        let mut inbound = request.into_inner();
        tokio::spawn(async move {
            while let Ok(Some(msg)) = inbound.message().await {
                bridge.route_write_request(&extension, msg.stream_id as u16, &msg.msg);
            }
        });
        let stream: Self::EventsStream = Box::pin(ReceiverStream::new(rx));
        Ok(Response::new(stream))
    }

    async fn commands(
        &self,
        request: Request<Streaming<pb::WriteRequest>>,
    ) -> Result<Response<Self::CommandsStream>, Status> {
        let extension = extension_of(&request)?;
        let rx = self.bridge.connect_commands(&extension);
        let bridge = self.bridge.clone();
        let mut inbound = request.into_inner();
        tokio::spawn(async move {
            while let Ok(Some(msg)) = inbound.message().await {
                bridge.route_write_request(&extension, msg.stream_id as u16, &msg.msg);
            }
        });
        let stream: Self::CommandsStream = Box::pin(ReceiverStream::new(rx));
        Ok(Response::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ids_skip_live_collisions() {
        let alloc = StreamIdAllocator::default();
        let mut live = HashSet::new();
        let a = alloc.allocate(&live).unwrap();
        live.insert(a);
        let b = alloc.allocate(&live).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn stream_ids_refuse_when_space_is_exhausted() {
        let alloc = StreamIdAllocator::default();
        let live: HashSet<u16> = (0..=u16::MAX).collect();
        assert!(alloc.allocate(&live).is_none());
    }

    #[tokio::test]
    async fn route_write_reaps_stream_on_empty_message() {
        use crate::provider::RecordingWriter;

        let bridge = RemoteBridge::new();
        let handle = bridge.get_or_create("ext");
        let writer: Arc<dyn Writer> = Arc::new(RecordingWriter::new());
        let id = handle.allocate_stream(writer).unwrap();

        handle.route_write(id, b"hello");
        handle.route_write(id, b"");
        assert!(handle.stream_writers.read().get(&id).is_none());
    }

    #[tokio::test]
    async fn remote_event_proxy_forwards_into_the_event_stream() {
        use crate::core::DispatchCore;
        use crate::ids::IdAllocator;
        use crate::provider::{PrefixNetworkInfo, RecordingWriter};
        use crate::event::EventDispatcher;

        let bridge = RemoteBridge::new();
        let mut rx = bridge.connect_events("ext");

        let events = EventDispatcher::new(IdAllocator::new(), DispatchCore::new());
        let id = bridge.register_event(&events, "ext", "net", "", "join").unwrap();
        assert_ne!(id, 0);

        let writer: Arc<dyn Writer> = Arc::new(RecordingWriter::new());
        events.dispatch(
            writer,
            IrcEvent {
                name: "JOIN".into(),
                sender: "nick!u@h".into(),
                args: vec!["#chan".into()],
                time_unix_seconds: 0,
                network_id: "net".into(),
                network_info: Arc::new(PrefixNetworkInfo::default()),
            },
        );
        events.wait_for_handlers().await;

        let envelope = rx.recv().await.unwrap().unwrap();
        assert_eq!(envelope.id, id);
        assert_eq!(envelope.event.unwrap().name, "JOIN");
    }

    #[tokio::test]
    async fn on_disconnect_unregisters_everything_the_extension_owned() {
        use crate::core::DispatchCore;
        use crate::event::EventDispatcher;
        use crate::ids::IdAllocator;

        let bridge = RemoteBridge::new();
        let _rx = bridge.connect_events("ext");
        let events = EventDispatcher::new(IdAllocator::new(), DispatchCore::new());
        let commands = CommandDispatcher::new(IdAllocator::new(), DispatchCore::new(), Arc::new(|_: &str, _: &str| '.'));
        let id = bridge.register_event(&events, "ext", "net", "", "join").unwrap();

        bridge.on_disconnect("ext", &events, &commands);

        assert!(!events.unregister(id));
    }
}
