//! Boundary scenarios from §8: format negotiation across two nodes,
//! failure on incompatible formats, and idempotent link teardown.

use patchbay_core::graph::Graph;
use patchbay_core::primitives::{Direction, Node, Port, PortFlags, PortRef, PortState};
use patchbay_core::CoreError;
use patchbay_proto::{ChoiceKind, Value};

fn enum_rate(rates: &[i32]) -> Value {
    Value::Choice { kind: ChoiceKind::Enum, alternatives: rates.iter().map(|r| Value::Int(*r)).collect() }
}

fn source_node(id: u32, rates: &[i32]) -> Node {
    let mut node = Node::new(id);
    let mut port = Port::new(id, Direction::Output, 0, PortFlags::CAN_ALLOC_BUFFERS);
    port.state = PortState::Configure;
    port.supported_formats = vec![enum_rate(rates)];
    node.output_ports.push(port);
    node
}

fn sink_node(id: u32, rates: &[i32]) -> Node {
    let mut node = Node::new(id);
    let mut port = Port::new(id, Direction::Input, 0, PortFlags::empty());
    port.state = PortState::Configure;
    port.supported_formats = vec![enum_rate(rates)];
    node.input_ports.push(port);
    node
}

#[test]
fn two_client_audio_passthrough_negotiates_48k() {
    let mut graph = Graph::new();
    graph.add_node(source_node(1, &[44100, 48000]));
    graph.add_node(sink_node(2, &[48000]));

    let link_id = graph.create_link(PortRef::new(1, 0), PortRef::new(2, 0), None).unwrap();
    let link = graph.link(link_id).unwrap();

    match &link.negotiated_format {
        Some(Value::Choice { alternatives, .. }) => {
            assert_eq!(alternatives, &vec![Value::Int(48000)]);
        }
        other => panic!("expected a narrowed rate choice, got {other:?}"),
    }
}

#[test]
fn format_negotiation_failure_reported_synchronously() {
    let mut graph = Graph::new();
    graph.add_node(source_node(1, &[44100]));
    graph.add_node(sink_node(2, &[48000]));

    let result = graph.create_link(PortRef::new(1, 0), PortRef::new(2, 0), None);
    assert!(matches!(result, Err(CoreError::NoFormat)));
    assert!(graph.links().next().is_none());
}

#[test]
fn create_destroy_create_reaches_same_state() {
    let mut graph = Graph::new();
    graph.add_node(source_node(1, &[48000]));
    graph.add_node(sink_node(2, &[48000]));

    let first = graph.create_link(PortRef::new(1, 0), PortRef::new(2, 0), None).unwrap();
    graph.destroy_link(first);
    let second = graph.create_link(PortRef::new(1, 0), PortRef::new(2, 0), None).unwrap();

    assert_eq!(graph.link(second).unwrap().negotiated_format, graph.node(1).unwrap().output_ports[0].current_format);
}

#[test]
fn peer_disconnect_faults_link_and_removes_node() {
    let mut graph = Graph::new();
    graph.add_node(source_node(1, &[48000]));
    graph.add_node(sink_node(2, &[48000]));
    let link_id = graph.create_link(PortRef::new(1, 0), PortRef::new(2, 0), None).unwrap();

    let affected = graph.disconnect_node(1);
    assert_eq!(affected, vec![link_id]);
    assert!(graph.node(1).is_none());
    assert!(graph.node(2).is_some());
}
