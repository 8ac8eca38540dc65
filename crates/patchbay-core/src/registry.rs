//! Object registry (C4).
//!
//! Each side of a connection holds a dense map from id to entry.
//! `Registry` is that map for one side: ids allocate monotonically from
//! a per-peer counter, and a freed id is reusable only after the peer
//! has acknowledged its destruction, to avoid stale-id races against
//! in-flight events (§4.4).
//!
//! Grounded on the dense-vector-plus-generation discipline spec.md §9
//! recommends in place of intrusive lists; `petgraph`'s own stable index
//! handling (vacant slots reused only after compaction) is the model
//! this mirrors, applied here to a plain `Vec<Slot>`.

use std::collections::{HashMap, VecDeque};

use crate::error::CoreError;
use crate::primitives::ObjectId;

/// Which side of the proxy/resource split an entry is (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client-side stub: serializes method calls, receives events.
    Proxy,
    /// Server-side peer: receives method calls, emits events.
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Live,
    /// Destroyed locally; waiting for the peer's destroy-ack before the
    /// id can be reused.
    PendingFree,
}

struct Slot {
    role: Role,
    interface: String,
    version: u32,
    state: SlotState,
}

/// Dense id -> entry map for one side of one connection.
pub struct Registry {
    slots: HashMap<ObjectId, Slot>,
    next_id: ObjectId,
    /// Ids acknowledged as freed, available for `allocate` to hand back
    /// out before it bumps `next_id` (§4.4 "reuse only after the id has
    /// been acknowledged as freed").
    free_ids: VecDeque<ObjectId>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// `first_id` lets the core object own id 0 (§6) while every other
    /// registration starts counting from 1.
    pub fn new() -> Self {
        Self { slots: HashMap::new(), next_id: 1, free_ids: VecDeque::new() }
    }

    /// Register the well-known core object at id 0 (§6 "core resource
    /// (id 0)").
    pub fn register_core(&mut self, role: Role) {
        self.slots.insert(0, Slot { role, interface: "core".into(), version: 1, state: SlotState::Live });
    }

    /// Allocate a fresh id for `interface`/`version` and register it.
    /// Never returns an id `>= crate::primitives::MAX_OBJECT_ID`
    /// (testable property 3).
    pub fn allocate(&mut self, role: Role, interface: impl Into<String>, version: u32) -> Result<ObjectId, CoreError> {
        let id = if let Some(reused) = self.free_ids.pop_front() {
            reused
        } else {
            if self.next_id >= crate::primitives::MAX_OBJECT_ID {
                return Err(CoreError::NoSpace("registry id space exhausted".into()));
            }
            let id = self.next_id;
            self.next_id += 1;
            id
        };
        self.slots.insert(id, Slot { role, interface: interface.into(), version, state: SlotState::Live });
        Ok(id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        matches!(self.slots.get(&id), Some(s) if s.state == SlotState::Live)
    }

    pub fn role(&self, id: ObjectId) -> Option<Role> {
        self.slots.get(&id).map(|s| s.role)
    }

    pub fn interface(&self, id: ObjectId) -> Option<(&str, u32)> {
        self.slots.get(&id).map(|s| (s.interface.as_str(), s.version))
    }

    /// Local-side destroy (§4.4: "triggers an asynchronous destroy event
    /// to the peer"). The slot is marked pending until [`Registry::ack_free`]
    /// is called for it, so a message racing the destroy event cannot
    /// land on a reused id.
    pub fn destroy(&mut self, id: ObjectId) -> Result<(), CoreError> {
        match self.slots.get_mut(&id) {
            Some(slot) if slot.state == SlotState::Live => {
                slot.state = SlotState::PendingFree;
                Ok(())
            }
            // §8 idempotence: destroying an already-destroyed id is a
            // no-op that returns success.
            Some(_) => Ok(()),
            None => Ok(()),
        }
    }

    /// The peer has acknowledged the destroy; the id is dropped and
    /// pushed onto the free-list so a later `allocate` can hand it back
    /// out, per §4.4's id-reuse policy. Id 0 (the core object) is never
    /// queued for reuse.
    pub fn ack_free(&mut self, id: ObjectId) {
        if self.slots.remove(&id).is_some() && id != 0 {
            self.free_ids.push_back(id);
        }
    }

    /// Drop every entry, returning the ids that were live - used when a
    /// connection closes so its owner can emit `global_removed` for
    /// each one (§4.9, §8 boundary scenario 4).
    pub fn drain(&mut self) -> Vec<ObjectId> {
        let ids: Vec<ObjectId> = self.slots.keys().copied().collect();
        self.slots.clear();
        ids
    }

    /// Dispatch an incoming `(object_id, opcode)` pair to its handler
    /// identity: the caller matches on `(interface, opcode)` to invoke
    /// the right method, per §4.4 "every incoming message is dispatched
    /// by looking up object_id and invoking the opcode-specified
    /// handler for that interface".
    pub fn resolve(&self, object_id: ObjectId) -> Result<(&str, u32, Role), CoreError> {
        let slot = self
            .slots
            .get(&object_id)
            .filter(|s| s.state == SlotState::Live)
            .ok_or_else(|| CoreError::NotFound(format!("object {object_id}")))?;
        Ok((slot.interface.as_str(), slot.version, slot.role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_below_max() {
        let mut reg = Registry::new();
        let a = reg.allocate(Role::Resource, "node", 1).unwrap();
        let b = reg.allocate(Role::Resource, "node", 1).unwrap();
        assert!(b > a);
        assert!(b < crate::primitives::MAX_OBJECT_ID);
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut reg = Registry::new();
        let id = reg.allocate(Role::Resource, "node", 1).unwrap();
        reg.destroy(id).unwrap();
        reg.destroy(id).unwrap();
    }

    #[test]
    fn id_unreachable_after_destroy_until_explicit_ack() {
        let mut reg = Registry::new();
        let id = reg.allocate(Role::Resource, "node", 1).unwrap();
        reg.destroy(id).unwrap();
        // Still resolvable as "pending" is not "live": lookups fail
        // immediately, matching the stale-id guard.
        assert!(reg.resolve(id).is_err());
        reg.ack_free(id);
        assert!(!reg.contains(id));
    }

    #[test]
    fn freed_id_is_reused_before_the_counter_advances() {
        let mut reg = Registry::new();
        let a = reg.allocate(Role::Resource, "node", 1).unwrap();
        reg.destroy(a).unwrap();
        reg.ack_free(a);
        let b = reg.allocate(Role::Resource, "node", 1).unwrap();
        assert_eq!(a, b, "acknowledged-free id should be handed back out, not skipped");
        let c = reg.allocate(Role::Resource, "node", 1).unwrap();
        assert!(c > b);
    }

    #[test]
    fn core_id_zero_is_never_queued_for_reuse() {
        let mut reg = Registry::new();
        reg.register_core(Role::Resource);
        reg.ack_free(0);
        let a = reg.allocate(Role::Resource, "node", 1).unwrap();
        assert_ne!(a, 0);
    }

    #[test]
    fn drain_returns_all_live_ids() {
        let mut reg = Registry::new();
        reg.register_core(Role::Resource);
        let a = reg.allocate(Role::Resource, "node", 1).unwrap();
        let mut ids = reg.drain();
        ids.sort();
        assert_eq!(ids, vec![0, a]);
    }
}
