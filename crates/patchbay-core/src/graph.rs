//! Graph and link manager (C7).
//!
//! Maintains nodes, ports, and links, and recomputes a topological order
//! over the driver's follower set whenever a link is added or removed.
//!
//! Grounded on the teacher's `petgraph::stable_graph::StableGraph` +
//! `toposort` usage, generalized from an audio edge carrying a gain
//! scalar to a link carrying a negotiated format and an IO area.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::Direction as PetDirection;

use patchbay_proto::Value;

use crate::error::CoreError;
use crate::param;
use crate::primitives::{Direction, IoArea, Link, LinkState, Node, ObjectId, Port, PortRef};

/// Topology graph node: one media-graph [`Node`] plus its petgraph index.
struct GraphNode {
    node: Node,
    index: NodeIndex,
}

/// Owns the full graph state: nodes (with their ports embedded, per §3),
/// links, and the petgraph topology used to order scheduling.
pub struct Graph {
    nodes: HashMap<ObjectId, GraphNode>,
    links: HashMap<ObjectId, Link>,
    topology: StableGraph<ObjectId, ObjectId>,
    next_link_id: ObjectId,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self { nodes: HashMap::new(), links: HashMap::new(), topology: StableGraph::new(), next_link_id: 1 }
    }

    pub fn add_node(&mut self, node: Node) {
        let id = node.id;
        let index = self.topology.add_node(id);
        self.nodes.insert(id, GraphNode { node, index });
    }

    pub fn remove_node(&mut self, id: ObjectId) {
        if let Some(gn) = self.nodes.remove(&id) {
            self.topology.remove_node(gn.index);
        }
        self.links.retain(|_, link| link.output.node_id != id && link.input.node_id != id);
    }

    pub fn node(&self, id: ObjectId) -> Option<&Node> {
        self.nodes.get(&id).map(|gn| &gn.node)
    }

    pub fn node_mut(&mut self, id: ObjectId) -> Option<&mut Node> {
        self.nodes.get_mut(&id).map(|gn| &mut gn.node)
    }

    pub fn link(&self, id: ObjectId) -> Option<&Link> {
        self.links.get(&id)
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    /// §4.7 `create_link(out, in, filter?)`. Runs format intersection for
    /// both endpoints, picks the allocator side, and adds the topology
    /// edge. Rejects the link synchronously if no common format exists
    /// or if adding it would close a cycle.
    pub fn create_link(
        &mut self,
        output: PortRef,
        input: PortRef,
        filter: Option<&Value>,
    ) -> Result<ObjectId, CoreError> {
        let link_id = self.next_link_id;
        self.create_link_with_id(link_id, output, input, filter)?;
        Ok(link_id)
    }

    /// As [`Graph::create_link`], but the caller (the object registry,
    /// which owns the wire-visible id space) supplies `link_id` instead
    /// of letting the graph mint its own. The internal counter is bumped
    /// past `link_id` so auto-assigned ids never collide with it.
    pub fn create_link_with_id(
        &mut self,
        link_id: ObjectId,
        output: PortRef,
        input: PortRef,
        filter: Option<&Value>,
    ) -> Result<(), CoreError> {
        let out_index = self.node_index(output.node_id)?;
        let in_index = self.node_index(input.node_id)?;

        let (out_formats, out_can_alloc) = {
            let port = self.port(output)?;
            (port.supported_formats.clone(), port.can_allocate())
        };
        let (in_formats, in_can_alloc) = {
            let port = self.port(input)?;
            (port.supported_formats.clone(), port.can_allocate())
        };

        let negotiated = negotiate(&out_formats, &in_formats, filter)?;
        let allocator_side = param::choose_allocator(out_can_alloc, in_can_alloc)?;

        // tentatively add the edge, check for a cycle, roll back if so
        let edge = self.topology.add_edge(out_index, in_index, 0);
        if toposort(&self.topology, None).is_err() {
            self.topology.remove_edge(edge);
            return Err(CoreError::InvalidParam("link would create a cycle".into()));
        }

        self.next_link_id = self.next_link_id.max(link_id + 1);
        self.topology.update_edge(out_index, in_index, link_id);

        let link = Link {
            id: link_id,
            output,
            input,
            state: LinkState::Negotiating,
            negotiated_format: Some(negotiated.clone()),
            allocator_side,
            io_area: Arc::new(IoArea::new()),
        };
        self.links.insert(link_id, link);

        if let Some(port) = self.port_mut(output) {
            param::set_format(port, negotiated.clone())?;
        }
        if let Some(port) = self.port_mut(input) {
            param::set_format(port, negotiated)?;
        }

        Ok(())
    }

    /// Idempotent per §5: destroying an already-destroyed link is a
    /// no-op.
    pub fn destroy_link(&mut self, link_id: ObjectId) {
        if let Some(link) = self.links.remove(&link_id) {
            if let (Ok(a), Ok(b)) = (self.node_index(link.output.node_id), self.node_index(link.input.node_id)) {
                if let Some(edge) = self.topology.find_edge(a, b) {
                    self.topology.remove_edge(edge);
                }
            }
        }
    }

    /// Put a link into `Error` state on a runtime failure (format
    /// renegotiation required, buffer lost, peer gone) per §4.7's
    /// failure semantics. The session/policy layer decides whether to
    /// heal or destroy it afterward.
    pub fn fault_link(&mut self, link_id: ObjectId) {
        if let Some(link) = self.links.get_mut(&link_id) {
            link.state = LinkState::Error;
        }
    }

    /// Remove every link, node, and port touching `node_id` - used on
    /// peer disconnect (§8 boundary scenario 4).
    pub fn disconnect_node(&mut self, node_id: ObjectId) -> Vec<ObjectId> {
        let affected: Vec<ObjectId> = self
            .links
            .values()
            .filter(|l| l.output.node_id == node_id || l.input.node_id == node_id)
            .map(|l| l.id)
            .collect();
        for link_id in &affected {
            self.fault_link(*link_id);
        }
        self.remove_node(node_id);
        affected
    }

    /// Kahn-style topological order over the driver's follower set: the
    /// transitive closure of nodes reachable from `driver` via link
    /// edges in *either* direction, per §4.7 ("input→output or
    /// output→input edges") - a sink driver must still reach its
    /// upstream producers, not just its (nonexistent) downstream.
    pub fn follower_order(&self, driver: ObjectId) -> Result<Vec<ObjectId>, CoreError> {
        let driver_index = self.node_index(driver)?;
        let mut reachable = std::collections::HashSet::new();
        let mut stack = vec![driver_index];
        while let Some(idx) = stack.pop() {
            if !reachable.insert(idx) {
                continue;
            }
            for neighbor in self.topology.neighbors_directed(idx, PetDirection::Outgoing) {
                stack.push(neighbor);
            }
            for neighbor in self.topology.neighbors_directed(idx, PetDirection::Incoming) {
                stack.push(neighbor);
            }
        }

        let order = toposort(&self.topology, None)
            .map_err(|_| CoreError::Fatal("graph contains a cycle".into()))?;

        Ok(order
            .into_iter()
            .filter(|idx| reachable.contains(idx) && *idx != driver_index)
            .map(|idx| self.topology[idx])
            .collect())
    }

    /// Ids of nodes currently eligible to drive a cycle: marked as a
    /// driver candidate at creation (§4.8) and in the `Running` state.
    /// Used by the scheduler loop to decide which drivers need a cycle
    /// this tick without it having to walk node internals itself.
    pub fn running_drivers(&self) -> Vec<ObjectId> {
        self.nodes
            .values()
            .filter(|gn| gn.node.driver_candidate && gn.node.state == crate::primitives::NodeState::Running)
            .map(|gn| gn.node.id)
            .collect()
    }

    fn node_index(&self, id: ObjectId) -> Result<NodeIndex, CoreError> {
        self.nodes.get(&id).map(|gn| gn.index).ok_or_else(|| CoreError::NotFound(format!("node {id}")))
    }

    fn port(&self, port_ref: PortRef) -> Result<&Port, CoreError> {
        let node = self.nodes.get(&port_ref.node_id).ok_or_else(|| CoreError::NotFound(format!("node {}", port_ref.node_id)))?;
        node.node
            .port(Direction::Output, port_ref.port_id)
            .or_else(|| node.node.port(Direction::Input, port_ref.port_id))
            .ok_or_else(|| CoreError::NotFound(format!("port {}", port_ref.port_id)))
    }

    fn port_mut(&mut self, port_ref: PortRef) -> Option<&mut Port> {
        let node = self.nodes.get_mut(&port_ref.node_id)?;
        let has_output = node.node.port(Direction::Output, port_ref.port_id).is_some();
        if has_output {
            node.node.port_mut(Direction::Output, port_ref.port_id)
        } else {
            node.node.port_mut(Direction::Input, port_ref.port_id)
        }
    }
}

fn negotiate(out_formats: &[Value], in_formats: &[Value], filter: Option<&Value>) -> Result<Value, CoreError> {
    let out_candidates: Vec<Value> = match filter {
        Some(f) => param::enumerate_matches(out_formats, f),
        None => out_formats.to_vec(),
    };
    for candidate in &out_candidates {
        if let Some(negotiated) = param::choose_format(in_formats, candidate) {
            return Ok(negotiated);
        }
    }
    Err(CoreError::NoFormat)
}

/// Is every port on `link` at or past `min`? Used by the invariant
/// checker in §8 ("for every link in state >= Paused...").
pub fn link_reached(link: &Link, min: LinkState) -> bool {
    rank(link.state) >= rank(min)
}

fn rank(state: LinkState) -> u8 {
    match state {
        LinkState::Error => 0,
        LinkState::Negotiating => 1,
        LinkState::Paused => 2,
        LinkState::Streaming => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{PortFlags, PortState as PState};
    use patchbay_proto::ChoiceKind;

    fn s16_48k_stereo() -> Value {
        Value::Choice { kind: ChoiceKind::Enum, alternatives: vec![Value::Int(48000)] }
    }

    fn make_node(id: ObjectId, direction: Direction, formats: Vec<Value>) -> Node {
        let mut node = Node::new(id);
        let mut port = Port::new(id, direction, 0, PortFlags::CAN_ALLOC_BUFFERS);
        port.state = PState::Configure;
        port.supported_formats = formats;
        match direction {
            Direction::Output => node.output_ports.push(port),
            Direction::Input => node.input_ports.push(port),
        }
        node
    }

    #[test]
    fn passthrough_negotiates_common_format() {
        let mut graph = Graph::new();
        graph.add_node(make_node(1, Direction::Output, vec![s16_48k_stereo()]));
        graph.add_node(make_node(2, Direction::Input, vec![s16_48k_stereo()]));

        let link_id = graph
            .create_link(PortRef::new(1, 0), PortRef::new(2, 0), None)
            .unwrap();
        let link = graph.link(link_id).unwrap();
        assert_eq!(link.state, LinkState::Negotiating);
        assert!(link.negotiated_format.is_some());
    }

    #[test]
    fn mismatched_rates_fail_synchronously() {
        let mut graph = Graph::new();
        let a = Value::Choice { kind: ChoiceKind::Enum, alternatives: vec![Value::Int(44100)] };
        let b = Value::Choice { kind: ChoiceKind::Enum, alternatives: vec![Value::Int(48000)] };
        graph.add_node(make_node(1, Direction::Output, vec![a]));
        graph.add_node(make_node(2, Direction::Input, vec![b]));

        let result = graph.create_link(PortRef::new(1, 0), PortRef::new(2, 0), None);
        assert!(matches!(result, Err(CoreError::NoFormat)));
    }

    #[test]
    fn cycle_is_rejected() {
        let mut graph = Graph::new();
        graph.add_node(make_node(1, Direction::Output, vec![s16_48k_stereo()]));
        graph.nodes.get_mut(&1).unwrap().node.input_ports.push(Port::new(1, Direction::Input, 1, PortFlags::CAN_ALLOC_BUFFERS));
        graph.nodes.get_mut(&1).unwrap().node.input_ports[0].supported_formats = vec![s16_48k_stereo()];
        graph.add_node(make_node(2, Direction::Input, vec![s16_48k_stereo()]));
        graph.nodes.get_mut(&2).unwrap().node.output_ports.push(Port::new(2, Direction::Output, 1, PortFlags::CAN_ALLOC_BUFFERS));
        graph.nodes.get_mut(&2).unwrap().node.output_ports[0].supported_formats = vec![s16_48k_stereo()];

        graph.create_link(PortRef::new(1, 0), PortRef::new(2, 0), None).unwrap();
        let back = graph.create_link(PortRef::new(2, 1), PortRef::new(1, 1), None);
        assert!(back.is_err());
    }

    #[test]
    fn destroy_link_is_idempotent() {
        let mut graph = Graph::new();
        graph.add_node(make_node(1, Direction::Output, vec![s16_48k_stereo()]));
        graph.add_node(make_node(2, Direction::Input, vec![s16_48k_stereo()]));
        let link_id = graph.create_link(PortRef::new(1, 0), PortRef::new(2, 0), None).unwrap();
        graph.destroy_link(link_id);
        graph.destroy_link(link_id);
        assert!(graph.link(link_id).is_none());
    }

    #[test]
    fn follower_order_excludes_driver_and_unreachable_nodes() {
        let mut graph = Graph::new();
        graph.add_node(make_node(1, Direction::Output, vec![s16_48k_stereo()]));
        graph.add_node(make_node(2, Direction::Input, vec![s16_48k_stereo()]));
        graph.add_node(Node::new(3)); // disconnected
        graph.create_link(PortRef::new(1, 0), PortRef::new(2, 0), None).unwrap();

        let order = graph.follower_order(1).unwrap();
        assert_eq!(order, vec![2]);
    }

    #[test]
    fn running_drivers_excludes_non_candidates_and_idle_nodes() {
        let mut graph = Graph::new();
        let mut driver = Node::new(1);
        driver.driver_candidate = true;
        driver.state = crate::primitives::NodeState::Running;
        graph.add_node(driver);

        let mut idle_candidate = Node::new(2);
        idle_candidate.driver_candidate = true;
        graph.add_node(idle_candidate);

        graph.add_node(Node::new(3));

        assert_eq!(graph.running_drivers(), vec![1]);
    }

    #[test]
    fn follower_order_reaches_upstream_producers_when_driver_is_a_sink() {
        let mut graph = Graph::new();
        graph.add_node(make_node(1, Direction::Output, vec![s16_48k_stereo()]));
        graph.add_node(make_node(2, Direction::Input, vec![s16_48k_stereo()]));
        graph.create_link(PortRef::new(1, 0), PortRef::new(2, 0), None).unwrap();

        // node 2 (the sink) is the driver; it must still see node 1
        // (its upstream producer) in its follower set.
        let order = graph.follower_order(2).unwrap();
        assert_eq!(order, vec![1]);
    }
}
