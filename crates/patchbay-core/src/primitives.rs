//! Core data model (§3): nodes, ports, links, buffers, and the IO areas
//! that connect them. These are in-process representations; the wire
//! encoding of the `Format`/`Buffers`/`Meta` objects that negotiate them
//! is `patchbay_proto::pod::Value`.

use std::sync::atomic::Ordering;

use patchbay_proto::Value;
use portable_atomic::{AtomicU32, AtomicU64};

/// Registry id of an object. Ids are allocated per spec.md §3's
/// "Registry entry": monotonic per peer, private per connection, never
/// exceeding `2^31` (testable property 3).
pub type ObjectId = u32;

pub const MAX_OBJECT_ID: ObjectId = 1 << 31;

/// Sentinel written into an [`IoArea`] slot meaning "no buffer queued".
pub const NO_BUFFER: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Input => Direction::Output,
            Direction::Output => Direction::Input,
        }
    }
}

/// Node lifecycle state (§3 Node).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Error,
    Creating,
    Suspended,
    Idle,
    Running,
}

/// Port negotiation state (§3 Port, §4.5). Ordered so `>=` comparisons
/// in invariant checks (e.g. "every resource... owned by a port whose
/// state >= Paused") read naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PortState {
    Error,
    Init,
    Configure,
    Ready,
    Paused,
    Streaming,
}

bitflags::bitflags! {
    /// Port info flags (§3 Port).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortFlags: u32 {
        const REMOVABLE              = 1 << 0;
        const OPTIONAL                = 1 << 1;
        const CAN_ALLOC_BUFFERS       = 1 << 2;
        const CAN_USE_PROVIDED_BUFFERS = 1 << 3;
        const IN_PLACE_POSSIBLE       = 1 << 4;
        const DOES_NOT_REF_BUFFER     = 1 << 5;
    }
}

/// Concrete buffer layout negotiated by `Buffers` (§4.5 step 2).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferLayout {
    pub buffers: u32,
    pub blocks: u32,
    pub size: u32,
    pub stride: u32,
    pub align: u32,
}

/// A shared-memory record used for lock-free producer/consumer exchange
/// on a link (§3 IO area). Loads/stores use release/acquire ordering at
/// the producer's store of `buffer_id` and the consumer's load, per §5's
/// ordering guarantee.
#[derive(Debug)]
pub struct IoArea {
    input_buffer_id: AtomicU32,
    output_buffer_id: AtomicU32,
    clock_position: AtomicU64,
    latency: AtomicU64,
    control: AtomicU32,
}

impl Default for IoArea {
    fn default() -> Self {
        Self::new()
    }
}

impl IoArea {
    pub fn new() -> Self {
        Self {
            input_buffer_id: AtomicU32::new(NO_BUFFER),
            output_buffer_id: AtomicU32::new(NO_BUFFER),
            clock_position: AtomicU64::new(0),
            latency: AtomicU64::new(0),
            control: AtomicU32::new(0),
        }
    }

    /// Producer publishes a filled buffer's index.
    pub fn publish_output(&self, buffer_id: u32) {
        self.output_buffer_id.store(buffer_id, Ordering::Release);
    }

    /// Consumer observes the currently published output buffer.
    pub fn load_output(&self) -> Option<u32> {
        match self.output_buffer_id.load(Ordering::Acquire) {
            NO_BUFFER => None,
            id => Some(id),
        }
    }

    /// Consumer marks the input slot queued with a buffer to process.
    pub fn queue_input(&self, buffer_id: u32) {
        self.input_buffer_id.store(buffer_id, Ordering::Release);
    }

    /// Producer-side consumer of its own downstream queue slot: returns
    /// the queued buffer id and resets the slot to the sentinel,
    /// matching §4.6's "queued by the consumer by zeroing the field".
    pub fn take_input(&self) -> Option<u32> {
        let id = self.input_buffer_id.swap(NO_BUFFER, Ordering::AcqRel);
        if id == NO_BUFFER {
            None
        } else {
            Some(id)
        }
    }

    pub fn has_input_available(&self) -> bool {
        self.input_buffer_id.load(Ordering::Acquire) != NO_BUFFER
    }

    pub fn set_clock_position(&self, position: u64) {
        self.clock_position.store(position, Ordering::Release);
    }

    pub fn clock_position(&self) -> u64 {
        self.clock_position.load(Ordering::Acquire)
    }

    pub fn set_latency(&self, latency_ns: u64) {
        self.latency.store(latency_ns, Ordering::Release);
    }

    pub fn latency(&self) -> u64 {
        self.latency.load(Ordering::Acquire)
    }

    pub fn set_control(&self, value: u32) {
        self.control.store(value, Ordering::Release);
    }

    pub fn control(&self) -> u32 {
        self.control.load(Ordering::Acquire)
    }
}

/// A typed endpoint on a node through which buffers flow (§3 Port).
#[derive(Debug)]
pub struct Port {
    pub node_id: ObjectId,
    pub direction: Direction,
    pub port_id: u32,
    pub flags: PortFlags,
    pub state: PortState,
    /// `EnumFormat`: the candidate formats this port advertises.
    pub supported_formats: Vec<Value>,
    /// Non-null iff `state >= Ready` (§3 invariant).
    pub current_format: Option<Value>,
    pub buffer_layout: Option<BufferLayout>,
    pub io_area: Option<std::sync::Arc<IoArea>>,
}

impl Port {
    pub fn new(node_id: ObjectId, direction: Direction, port_id: u32, flags: PortFlags) -> Self {
        Self {
            node_id,
            direction,
            port_id,
            flags,
            state: PortState::Init,
            supported_formats: Vec::new(),
            current_format: None,
            buffer_layout: None,
            io_area: None,
        }
    }

    pub fn can_allocate(&self) -> bool {
        self.flags.contains(PortFlags::CAN_ALLOC_BUFFERS)
    }
}

/// `(id, direction-set, input_ports, output_ports, state, ...)` (§3 Node).
#[derive(Debug)]
pub struct Node {
    pub id: ObjectId,
    pub state: NodeState,
    pub input_ports: Vec<Port>,
    pub output_ports: Vec<Port>,
    /// Whether this node may be chosen as the graph driver (§4.8).
    pub driver_candidate: bool,
    pub active_quantum_ns: Option<u64>,
    pub info_props: std::collections::HashMap<String, String>,
}

impl Node {
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            state: NodeState::Creating,
            input_ports: Vec::new(),
            output_ports: Vec::new(),
            driver_candidate: false,
            active_quantum_ns: None,
            info_props: std::collections::HashMap::new(),
        }
    }

    pub fn port(&self, direction: Direction, port_id: u32) -> Option<&Port> {
        let ports = match direction {
            Direction::Input => &self.input_ports,
            Direction::Output => &self.output_ports,
        };
        ports.iter().find(|p| p.port_id == port_id)
    }

    pub fn port_mut(&mut self, direction: Direction, port_id: u32) -> Option<&mut Port> {
        let ports = match direction {
            Direction::Input => &mut self.input_ports,
            Direction::Output => &mut self.output_ports,
        };
        ports.iter_mut().find(|p| p.port_id == port_id)
    }
}

/// One endpoint of a [`Link`]: a specific port on a specific node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRef {
    pub node_id: ObjectId,
    pub port_id: u32,
}

impl PortRef {
    pub fn new(node_id: ObjectId, port_id: u32) -> Self {
        Self { node_id, port_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Negotiating,
    Paused,
    Streaming,
    Error,
}

/// `(id, output, input, state, negotiated_format, ...)` (§3 Link). A
/// link owns no buffers itself - they live in the allocator side's pool.
#[derive(Debug)]
pub struct Link {
    pub id: ObjectId,
    pub output: PortRef,
    pub input: PortRef,
    pub state: LinkState,
    pub negotiated_format: Option<Value>,
    pub allocator_side: Direction,
    pub io_area: std::sync::Arc<IoArea>,
}

/// Clock/driver info published once per cycle by the driving node (§3).
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockInfo {
    pub rate: u32,
    pub position: u64,
    pub duration: u64,
    pub next_position: u64,
    pub delay: u64,
    pub xrun_count: u32,
}
