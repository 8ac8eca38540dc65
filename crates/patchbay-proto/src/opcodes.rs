//! Bootstrap opcode table (§6).
//!
//! These are the opcodes available on the core object (id 0) and the
//! registry object before any further objects have been bound. Every
//! other object type defines its own opcode space starting from the
//! same numbering convention; this module only carries the handful
//! that bootstrap the connection.

/// Client-to-server opcodes on the core object.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreRequest {
    /// Exchange version/application info, opening the connection.
    Hello = 0,
    /// Ask for a `Done` once all requests issued so far are processed.
    Sync = 1,
    /// Bind the registry object, to start receiving `Global` events.
    GetRegistry = 2,
    /// Ask a factory to create an object.
    CreateObject = 3,
    /// Destroy a previously created or bound object.
    Destroy = 4,
}

/// Server-to-client opcodes on the core object.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreEvent {
    /// Reply to a `Sync` request, echoing its caller-supplied token.
    Done = 0,
    /// Reports a failure tied to a specific object id.
    Error = 1,
    /// Keepalive request; a `Pong` is the expected reply.
    Ping = 2,
    /// Reply to a `Ping`.
    Pong = 3,
}

/// Server-to-client opcodes on the registry object.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A new global object appeared; carries id, type, and properties.
    Global = 0,
    /// A previously announced global disappeared.
    GlobalRemoved = 1,
}

/// Client-to-server opcodes on the registry object.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryRequest {
    /// Bind a proxy to a global by id, instantiating the matching interface.
    Bind = 0,
}

/// Client-to-server opcodes on a bound node or port object (§4.5, §4.8).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRequest {
    /// List the candidate formats/params a port advertises.
    EnumParams = 0,
    /// Narrow a port's format by intersecting against a requested value.
    SetParam = 1,
    /// Negotiate the concrete buffer layout for a port (§4.6).
    UseBuffers = 2,
    /// Hand over (or acknowledge) the shared `IoArea` for a port's link.
    SetIo = 3,
    /// Flip a node between `Idle` and `Running` (§4.8).
    SetActive = 4,
}

/// Server-to-client opcodes on a bound node or port object.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// Reports a negotiated or enumerated param value.
    Param = 0,
    /// Reply to a request that carries no other event of its own.
    Done = 1,
}

/// Reserved object id of the core singleton, bound implicitly at connect time.
pub const CORE_ID: u32 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values_are_stable() {
        assert_eq!(CoreRequest::Hello as u16, 0);
        assert_eq!(CoreRequest::Sync as u16, 1);
        assert_eq!(CoreRequest::GetRegistry as u16, 2);
        assert_eq!(CoreRequest::CreateObject as u16, 3);
        assert_eq!(CoreRequest::Destroy as u16, 4);

        assert_eq!(CoreEvent::Done as u16, 0);
        assert_eq!(CoreEvent::Error as u16, 1);
        assert_eq!(CoreEvent::Ping as u16, 2);
        assert_eq!(CoreEvent::Pong as u16, 3);

        assert_eq!(RegistryEvent::Global as u16, 0);
        assert_eq!(RegistryEvent::GlobalRemoved as u16, 1);
        assert_eq!(RegistryRequest::Bind as u16, 0);

        assert_eq!(NodeRequest::EnumParams as u16, 0);
        assert_eq!(NodeRequest::SetParam as u16, 1);
        assert_eq!(NodeRequest::UseBuffers as u16, 2);
        assert_eq!(NodeRequest::SetIo as u16, 3);
        assert_eq!(NodeRequest::SetActive as u16, 4);

        assert_eq!(NodeEvent::Param as u16, 0);
        assert_eq!(NodeEvent::Done as u16, 1);
    }

    #[test]
    fn core_is_object_zero() {
        assert_eq!(CORE_ID, 0);
    }
}
