//! Wire protocol for the patchbay media daemon.
//!
//! This crate is the ABI between client and server processes: the typed
//! payload codec (C1, [`pod`]), the framed local-socket transport (C3,
//! [`frame`] + [`transport`]), and the bootstrap opcode numbering (§6,
//! [`opcodes`]) that every connection starts from before any further
//! interface is bound. Nothing in here touches the graph, the registry,
//! or shared memory - those live in `patchbay-core` and are built on top
//! of what this crate exposes.

pub mod error;
pub mod frame;
pub mod opcodes;
pub mod pod;
pub mod transport;

pub use error::{PodError, TransportError};
pub use frame::{Frame, FrameHeader, HEADER_LEN, MAX_PAYLOAD_LEN};
pub use opcodes::{CoreEvent, CoreRequest, RegistryEvent, RegistryRequest, CORE_ID};
pub use pod::{decode, encode, ChoiceKind, Fraction, Property, Rectangle, Tag, Value};
pub use transport::{Connection, Message, MAX_FDS_PER_MESSAGE};
