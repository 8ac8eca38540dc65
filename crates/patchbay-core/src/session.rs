//! Session/core frontend (C9).
//!
//! Accepts connections on a well-known local socket and runs the
//! Hello/Sync/GetRegistry/CreateObject/Destroy handshake on the core
//! object (id 0), per §4.9 and §6's bootstrap opcode table. `CreateObject`
//! is also where nodes and links enter the shared [`crate::graph::Graph`]:
//! a `factory` of `"node"` allocates a node with one port described by
//! its props, and `"link"` negotiates a link between two existing ports.
//! Once bound, a node or link's own object id accepts the C5/C6/C8
//! requests in [`patchbay_proto::opcodes::NodeRequest`].
//!
//! Grounded on a `tokio::net::UnixListener` accept loop in the style of
//! the teacher's async control-plane entry point, adapted from a ZMQ
//! ROUTER socket to the local stream-socket transport `patchbay_proto`
//! defines.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use patchbay_conf::PatchbayConfig;
use patchbay_proto::opcodes::{CoreEvent, CoreRequest, NodeEvent, NodeRequest, RegistryEvent, RegistryRequest, CORE_ID};
use patchbay_proto::{pod, Connection, Frame, Message, Property, Value};

use crate::buffer::{BufferPool, MetaRequest};
use crate::error::CoreError;
use crate::graph::Graph;
use crate::primitives::{BufferLayout, Direction, Node, ObjectId, Port, PortFlags, PortRef, PortState};
use crate::registry::{Registry, Role};
use crate::shm::ShmPool;

/// Read/write/execute permission bits checked per binding, per §4.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Permissions {
    pub const ALL: Permissions = Permissions { read: true, write: true, execute: true };
    pub const NONE: Permissions = Permissions { read: false, write: false, execute: false };
}

/// A currently-visible server-side global, announced to new registries
/// via `global` events (§6).
#[derive(Debug, Clone)]
pub struct Global {
    pub id: u32,
    pub interface: String,
    pub version: u32,
    pub props: HashMap<String, String>,
}

/// Shared server state reachable from every connection: the globals
/// currently announced on the registry, the media graph they describe,
/// and the shared memory/buffer pools backing negotiated links. Guarded
/// by a single `Mutex` per §5 - this belongs to the main loop's
/// single-threaded registry discipline, not the realtime driver, which
/// only ever takes the same lock briefly at cycle boundaries.
pub struct SessionState {
    pub globals: Vec<Global>,
    pub graph: Graph,
    pub shm: ShmPool,
    pub buffer_pools: HashMap<(ObjectId, u32), BufferPool>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self { globals: Vec::new(), graph: Graph::new(), shm: ShmPool::new(), buffer_pools: HashMap::new() }
    }
}

/// Well-known property keys carried in `CreateObject`'s props Object,
/// specific to the `"node"` and `"link"` factories this daemon
/// implements (§6's bootstrap table leaves the props schema to the
/// factory).
mod prop_key {
    pub const PORT_DIRECTION: u32 = 1;
    pub const PORT_FORMATS: u32 = 2;
    pub const DRIVER_CANDIDATE: u32 = 3;
    pub const OUTPUT_NODE: u32 = 10;
    pub const OUTPUT_PORT: u32 = 11;
    pub const INPUT_NODE: u32 = 12;
    pub const INPUT_PORT: u32 = 13;
    pub const FILTER: u32 = 14;
}

/// One accepted client connection and its local registry.
pub struct PeerSession {
    connection: Connection,
    registry: Registry,
    registry_bound: bool,
    /// The id the client proposed for the registry resource in
    /// `GetRegistry`; messages addressed here are registry requests,
    /// everything else bound in `registry` is a node/link object.
    registry_id: Option<ObjectId>,
}

impl PeerSession {
    pub fn new(stream: UnixStream) -> std::io::Result<Self> {
        let connection = Connection::new(stream.into_std()?);
        let mut registry = Registry::new();
        registry.register_core(Role::Resource);
        Ok(Self { connection, registry, registry_bound: false, registry_id: None })
    }

    /// Checks the peer's credentials against the server's permission
    /// policy. The default policy grants full access to same-uid
    /// peers and denies everyone else, per §4.9 "the peer's credentials
    /// determine which globals are visible".
    pub fn permissions(&self) -> Result<Permissions, CoreError> {
        let creds = self.connection.peer_credentials()?;
        let ours = nix::unistd::Uid::current().as_raw();
        Ok(if creds.uid() == ours { Permissions::ALL } else { Permissions::NONE })
    }

    /// Handle a single incoming message addressed to the core object, a
    /// bound registry, or a node/link object created via `CreateObject`.
    pub async fn handle_message(
        &mut self,
        msg: Message,
        state: &Arc<Mutex<SessionState>>,
    ) -> Result<(), CoreError> {
        if msg.object_id == CORE_ID {
            self.handle_core_request(msg, state).await
        } else if self.registry_bound && self.registry_id == Some(msg.object_id) {
            self.handle_registry_request(msg)
        } else if self.registry.contains(msg.object_id) {
            self.handle_node_request(msg, state).await
        } else {
            Err(CoreError::NotFound(format!("object {}", msg.object_id)))
        }
    }

    async fn handle_core_request(
        &mut self,
        msg: Message,
        state: &Arc<Mutex<SessionState>>,
    ) -> Result<(), CoreError> {
        let payload = pod::decode(&msg.payload)?;
        if msg.opcode == CoreRequest::Hello as u16 {
            info!("client said hello");
            Ok(())
        } else if msg.opcode == CoreRequest::Sync as u16 {
            let (_target_id, token) = decode_sync_args(&payload)?;
            self.send_event(CORE_ID, CoreEvent::Done as u16, &[Value::Int(token)])
        } else if msg.opcode == CoreRequest::GetRegistry as u16 {
            let (_version, new_id) = decode_get_registry_args(&payload)?;
            self.registry_bound = true;
            self.registry_id = Some(new_id);
            let globals = state.lock().await.globals.clone();
            for g in globals {
                self.emit_global(&g)?;
            }
            Ok(())
        } else if msg.opcode == CoreRequest::CreateObject as u16 {
            let args = decode_create_object_args(&payload)?;
            let new_id = match args.factory.as_str() {
                "node" => self.create_node(&args, state).await?,
                "link" => self.create_link(&args, state).await?,
                _ => self.registry.allocate(Role::Resource, args.type_name.clone(), args.version)?,
            };
            self.send_event(CORE_ID, CoreEvent::Done as u16, &[Value::Int(new_id as i32)])
        } else if msg.opcode == CoreRequest::Destroy as u16 {
            let id = decode_destroy_arg(&payload)?;
            self.registry.destroy(id)?;
            Ok(())
        } else {
            Err(CoreError::Malformed(format!("unknown core opcode {}", msg.opcode)))
        }
    }

    /// §6's `node` factory: one port per call, described by
    /// `prop_key::PORT_DIRECTION` and `prop_key::PORT_FORMATS`. A fuller
    /// multi-port node is built by issuing one `CreateObject` per port
    /// and linking them under a shared `node_id` - out of scope for this
    /// slice (see DESIGN.md).
    async fn create_node(
        &mut self,
        args: &CreateObjectArgs,
        state: &Arc<Mutex<SessionState>>,
    ) -> Result<ObjectId, CoreError> {
        let direction = match prop_value(&args.props, prop_key::PORT_DIRECTION) {
            None | Some(Value::Id(0)) => Direction::Output,
            Some(Value::Id(_)) => Direction::Input,
            Some(_) => return Err(CoreError::InvalidParam("direction prop must be an id".into())),
        };
        let formats = match prop_value(&args.props, prop_key::PORT_FORMATS) {
            None => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(_) => return Err(CoreError::InvalidParam("formats prop must be an array".into())),
        };
        let driver_candidate = matches!(prop_value(&args.props, prop_key::DRIVER_CANDIDATE), Some(Value::Bool(true)));

        let id = self.registry.allocate(Role::Resource, args.type_name.clone(), args.version)?;
        let mut node = Node::new(id);
        node.driver_candidate = driver_candidate;
        let mut port = Port::new(id, direction, 0, PortFlags::CAN_ALLOC_BUFFERS);
        port.state = PortState::Configure;
        port.supported_formats = formats;
        match direction {
            Direction::Output => node.output_ports.push(port),
            Direction::Input => node.input_ports.push(port),
        }

        let mut guard = state.lock().await;
        guard.graph.add_node(node);
        guard.globals.push(Global { id, interface: args.type_name.clone(), version: args.version, props: HashMap::new() });
        Ok(id)
    }

    /// §6's `link` factory and §4.7 `create_link`: negotiates formats on
    /// both named ports and adds the topology edge. The registry id is
    /// allocated before the graph call so a cycle/format rejection can
    /// roll it back through the same acknowledged-free path a normal
    /// `Destroy` uses (§4.4), rather than leaking it.
    async fn create_link(
        &mut self,
        args: &CreateObjectArgs,
        state: &Arc<Mutex<SessionState>>,
    ) -> Result<ObjectId, CoreError> {
        let output = port_ref_from_props(&args.props, prop_key::OUTPUT_NODE, prop_key::OUTPUT_PORT)?;
        let input = port_ref_from_props(&args.props, prop_key::INPUT_NODE, prop_key::INPUT_PORT)?;
        let filter = prop_value(&args.props, prop_key::FILTER);

        let link_id = self.registry.allocate(Role::Resource, "link", 1)?;
        let mut guard = state.lock().await;
        if let Err(e) = guard.graph.create_link_with_id(link_id, output, input, filter) {
            drop(guard);
            let _ = self.registry.destroy(link_id);
            self.registry.ack_free(link_id);
            return Err(e);
        }
        guard.globals.push(Global { id: link_id, interface: "link".into(), version: 1, props: HashMap::new() });
        Ok(link_id)
    }

    fn handle_registry_request(&mut self, msg: Message) -> Result<(), CoreError> {
        if msg.opcode == RegistryRequest::Bind as u16 {
            Ok(())
        } else {
            Err(CoreError::Malformed(format!("unknown registry opcode {}", msg.opcode)))
        }
    }

    /// C5/C6/C8 requests on a bound node or link object (§4.5, §4.6,
    /// §4.8). `object_id` addresses the node (or link); `port_id` where
    /// relevant is carried in the request payload, per `PortRef`'s
    /// (node_id, port_id) addressing.
    async fn handle_node_request(
        &mut self,
        msg: Message,
        state: &Arc<Mutex<SessionState>>,
    ) -> Result<(), CoreError> {
        let object_id = msg.object_id;
        let payload = pod::decode(&msg.payload)?;

        if msg.opcode == NodeRequest::EnumParams as u16 {
            let port_id = decode_port_id_arg(&payload)?;
            let mut guard = state.lock().await;
            let node = guard.graph.node_mut(object_id).ok_or_else(|| CoreError::NotFound(format!("node {object_id}")))?;
            let port = node
                .port(Direction::Output, port_id)
                .or_else(|| node.port(Direction::Input, port_id))
                .ok_or_else(|| CoreError::NotFound(format!("port {port_id}")))?;
            let formats = port.supported_formats.clone();
            drop(guard);
            for format in formats {
                self.send_event(object_id, NodeEvent::Param as u16, &[Value::Int(port_id as i32), format])?;
            }
            self.send_event(object_id, NodeEvent::Done as u16, &[])
        } else if msg.opcode == NodeRequest::SetParam as u16 {
            let (port_id, requested) = decode_set_param_args(&payload)?;
            let mut guard = state.lock().await;
            let node = guard.graph.node_mut(object_id).ok_or_else(|| CoreError::NotFound(format!("node {object_id}")))?;
            let port = match node.port_mut(Direction::Output, port_id) {
                Some(p) => p,
                None => node
                    .port_mut(Direction::Input, port_id)
                    .ok_or_else(|| CoreError::NotFound(format!("port {port_id}")))?,
            };
            let narrowed = crate::param::choose_format(&port.supported_formats, &requested).ok_or(CoreError::NoFormat)?;
            crate::param::set_format(port, narrowed.clone())?;
            drop(guard);
            self.send_event(object_id, NodeEvent::Param as u16, &[Value::Int(port_id as i32), narrowed])
        } else if msg.opcode == NodeRequest::UseBuffers as u16 {
            let (port_id, layout) = decode_use_buffers_args(&payload)?;
            let mut guard = state.lock().await;
            {
                let node = guard.graph.node_mut(object_id).ok_or_else(|| CoreError::NotFound(format!("node {object_id}")))?;
                let port = match node.port_mut(Direction::Output, port_id) {
                    Some(p) => p,
                    None => node
                        .port_mut(Direction::Input, port_id)
                        .ok_or_else(|| CoreError::NotFound(format!("port {port_id}")))?,
                };
                port.buffer_layout = Some(layout);
                port.state = PortState::Ready;
            }
            let SessionState { shm, buffer_pools, .. } = &mut *guard;
            let pool = BufferPool::build(shm, layout, &[MetaRequest::Header])?;
            buffer_pools.insert((object_id, port_id), pool);
            drop(guard);
            self.send_event(object_id, NodeEvent::Done as u16, &[Value::Int(port_id as i32)])
        } else if msg.opcode == NodeRequest::SetIo as u16 {
            let port_id = decode_port_id_arg(&payload)?;
            let guard = state.lock().await;
            guard.graph.node(object_id).ok_or_else(|| CoreError::NotFound(format!("node {object_id}")))?;
            drop(guard);
            // The link's IoArea is already shared via the Arc created in
            // `create_link_with_id`; SetIo only confirms the port is
            // bound to it.
            self.send_event(object_id, NodeEvent::Done as u16, &[Value::Int(port_id as i32)])
        } else if msg.opcode == NodeRequest::SetActive as u16 {
            let active = decode_set_active_arg(&payload)?;
            let mut guard = state.lock().await;
            let node = guard.graph.node_mut(object_id).ok_or_else(|| CoreError::NotFound(format!("node {object_id}")))?;
            node.state = if active { crate::primitives::NodeState::Running } else { crate::primitives::NodeState::Idle };
            drop(guard);
            self.send_event(object_id, NodeEvent::Done as u16, &[Value::Bool(active)])
        } else {
            Err(CoreError::Malformed(format!("unknown node opcode {}", msg.opcode)))
        }
    }

    fn emit_global(&mut self, global: &Global) -> Result<(), CoreError> {
        self.send_event(
            CORE_ID,
            RegistryEvent::Global as u16,
            &[
                Value::Int(global.id as i32),
                Value::String(global.interface.clone()),
                Value::Int(global.version as i32),
            ],
        )
    }

    fn send_event(&mut self, object_id: u32, opcode: u16, args: &[Value]) -> Result<(), CoreError> {
        let payload = pod::encode(&Value::Struct(args.to_vec()));
        let frame = Frame::new(object_id, opcode, payload)?;
        self.connection.queue_send(frame, &[])?;
        self.connection.flush()?;
        Ok(())
    }

    /// Drop this connection's registry entries, returning the ids so the
    /// caller can notify survivors with `global_removed` (§4.9, §8
    /// boundary scenario 4).
    pub fn close(mut self) -> Vec<u32> {
        self.registry.drain()
    }
}

struct CreateObjectArgs {
    factory: String,
    type_name: String,
    version: u32,
    props: Vec<Property>,
}

fn decode_sync_args(payload: &Value) -> Result<(i32, i32), CoreError> {
    match payload {
        Value::Struct(fields) if fields.len() == 2 => match (&fields[0], &fields[1]) {
            (Value::Int(target), Value::Int(token)) => Ok((*target, *token)),
            _ => Err(CoreError::Malformed("Sync args must be (int, int)".into())),
        },
        _ => Err(CoreError::Malformed("Sync requires a 2-field struct".into())),
    }
}

fn decode_get_registry_args(payload: &Value) -> Result<(u32, ObjectId), CoreError> {
    match payload {
        Value::Struct(fields) if fields.len() == 2 => match (&fields[0], &fields[1]) {
            (Value::Int(version), Value::Int(new_id)) => Ok((*version as u32, *new_id as ObjectId)),
            _ => Err(CoreError::Malformed("GetRegistry args must be (int, int)".into())),
        },
        _ => Err(CoreError::Malformed("GetRegistry requires a 2-field struct".into())),
    }
}

fn decode_destroy_arg(payload: &Value) -> Result<u32, CoreError> {
    match payload {
        Value::Struct(fields) if fields.len() == 1 => match &fields[0] {
            Value::Int(id) => Ok(*id as u32),
            _ => Err(CoreError::Malformed("Destroy arg must be int".into())),
        },
        _ => Err(CoreError::Malformed("Destroy requires a 1-field struct".into())),
    }
}

fn decode_create_object_args(payload: &Value) -> Result<CreateObjectArgs, CoreError> {
    match payload {
        Value::Struct(fields) if fields.len() == 5 => {
            let factory = match &fields[0] {
                Value::String(s) => s.clone(),
                _ => return Err(CoreError::Malformed("CreateObject factory must be a string".into())),
            };
            let type_name = match &fields[1] {
                Value::String(s) => s.clone(),
                _ => return Err(CoreError::Malformed("CreateObject type must be a string".into())),
            };
            let version = match &fields[2] {
                Value::Int(v) => *v as u32,
                _ => return Err(CoreError::Malformed("CreateObject version must be an int".into())),
            };
            let props = match &fields[3] {
                Value::Object { properties, .. } => properties.clone(),
                Value::None => Vec::new(),
                _ => return Err(CoreError::Malformed("CreateObject props must be an object".into())),
            };
            // fields[4] is the caller-proposed new_id; the registry stays
            // authoritative over id assignment, so it is decoded for
            // shape-validation only and otherwise ignored.
            match &fields[4] {
                Value::Int(_) => {}
                _ => return Err(CoreError::Malformed("CreateObject new_id must be an int".into())),
            }
            Ok(CreateObjectArgs { factory, type_name, version, props })
        }
        _ => Err(CoreError::Malformed("CreateObject requires a 5-field struct".into())),
    }
}

fn prop_value(props: &[Property], key: u32) -> Option<&Value> {
    props.iter().find(|p| p.key_id == key && !p.is_unset()).map(|p| &p.value)
}

fn port_ref_from_props(props: &[Property], node_key: u32, port_key: u32) -> Result<PortRef, CoreError> {
    let node_id = match prop_value(props, node_key) {
        Some(Value::Int(v)) => *v as ObjectId,
        _ => return Err(CoreError::InvalidParam("link requires a node id prop".into())),
    };
    let port_id = match prop_value(props, port_key) {
        Some(Value::Int(v)) => *v as u32,
        _ => return Err(CoreError::InvalidParam("link requires a port id prop".into())),
    };
    Ok(PortRef::new(node_id, port_id))
}

fn decode_port_id_arg(payload: &Value) -> Result<u32, CoreError> {
    match payload {
        Value::Struct(fields) if !fields.is_empty() => match &fields[0] {
            Value::Int(v) => Ok(*v as u32),
            _ => Err(CoreError::Malformed("port id must be an int".into())),
        },
        _ => Err(CoreError::Malformed("request requires a port id".into())),
    }
}

fn decode_set_param_args(payload: &Value) -> Result<(u32, Value), CoreError> {
    match payload {
        Value::Struct(fields) if fields.len() == 2 => match &fields[0] {
            Value::Int(port_id) => Ok((*port_id as u32, fields[1].clone())),
            _ => Err(CoreError::Malformed("SetParam port id must be an int".into())),
        },
        _ => Err(CoreError::Malformed("SetParam requires a (port id, value) struct".into())),
    }
}

fn decode_use_buffers_args(payload: &Value) -> Result<(u32, BufferLayout), CoreError> {
    match payload {
        Value::Struct(fields) if fields.len() == 6 => {
            let ints: Result<Vec<i32>, CoreError> = fields
                .iter()
                .map(|f| match f {
                    Value::Int(v) => Ok(*v),
                    _ => Err(CoreError::Malformed("UseBuffers args must all be ints".into())),
                })
                .collect();
            let ints = ints?;
            let port_id = ints[0] as u32;
            let layout = BufferLayout {
                buffers: ints[1] as u32,
                blocks: ints[2] as u32,
                size: ints[3] as u32,
                stride: ints[4] as u32,
                align: ints[5] as u32,
            };
            Ok((port_id, layout))
        }
        _ => Err(CoreError::Malformed("UseBuffers requires a 6-field struct".into())),
    }
}

fn decode_set_active_arg(payload: &Value) -> Result<bool, CoreError> {
    match payload {
        Value::Struct(fields) if fields.len() == 1 => match &fields[0] {
            Value::Bool(b) => Ok(*b),
            _ => Err(CoreError::Malformed("SetActive arg must be a bool".into())),
        },
        _ => Err(CoreError::Malformed("SetActive requires a 1-field struct".into())),
    }
}

/// Runs the accept loop on the socket named by `config`'s runtime
/// directory and `REMOTE` override (§6 Env).
pub async fn serve(config: PatchbayConfig, state: Arc<Mutex<SessionState>>) -> std::io::Result<()> {
    let socket_path = config.infra.paths.socket_path();
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;
    info!(path = %socket_path.display(), "listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_peer(stream, state).await {
                warn!(error = %e, "peer session ended with error");
            }
        });
    }
}

async fn run_peer(stream: UnixStream, state: Arc<Mutex<SessionState>>) -> Result<(), CoreError> {
    let mut session = PeerSession::new(stream)?;
    let permissions = session.permissions()?;
    if !permissions.read {
        return Err(CoreError::PermissionDenied("peer has no read access".into()));
    }

    loop {
        let msg = match session.connection.read_message() {
            Ok(msg) => msg,
            Err(e) => {
                let err: CoreError = e.into();
                if err.is_connection_fatal() {
                    let freed = session.close();
                    info!(count = freed.len(), "connection closed, resources freed");
                    return Ok(());
                }
                error!(error = %err, "non-fatal transport error");
                continue;
            }
        };

        if let Err(e) = session.handle_message(msg, &state).await {
            if e.is_connection_fatal() {
                session.close();
                return Err(e);
            }
            error!(error = %e, "request failed, connection remains open");
        }
    }
}
