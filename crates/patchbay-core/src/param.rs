//! Parameter/port state machine (C5): format intersection over
//! `patchbay_proto::pod::Value` and the Init..Streaming transitions of
//! §4.5.
//!
//! Grounded directly on the `Choice` narrowing already implemented in
//! `patchbay_proto::pod` - this module adds no new wire representation,
//! only the matching algorithm spec.md §4.5 describes as "choice
//! narrowing: Enum∩Enum, Range∩Range, Step∩Range, None∩x=x".

use patchbay_proto::{ChoiceKind, Value};

use crate::error::CoreError;
use crate::primitives::{Direction, Port, PortState};

/// Intersect a port's candidate `EnumFormat` entries with a requested
/// `Format`. Returns every candidate compatible with `requested`,
/// narrowed to the overlap, in the candidates' own enumeration order
/// (the tie-break rule in §4.5: "prefer the caller's enumeration
/// order for categorical parameters").
pub fn enumerate_matches(candidates: &[Value], requested: &Value) -> Vec<Value> {
    candidates
        .iter()
        .filter_map(|candidate| intersect(candidate, requested))
        .collect()
}

/// Pick the single best match per the §4.5 tie-break chain: caller
/// enumeration order first (so the first entry in `candidates` that
/// intersects at all wins), highest common step/range for continuous
/// parameters, lowest latency last. Latency is not represented in the
/// `Format` POD itself, so this resolves to "first candidate that
/// intersects, narrowed to the overlap".
pub fn choose_format(candidates: &[Value], requested: &Value) -> Option<Value> {
    candidates.iter().find_map(|candidate| intersect(candidate, requested))
}

/// Intersect two POD values per the choice-narrowing rules. `None`
/// intersected with anything yields the other operand unchanged.
/// Incompatible tags, or ranges/steps/enums with empty overlap, yield
/// `None` (no match).
pub fn intersect(a: &Value, b: &Value) -> Option<Value> {
    match (a, b) {
        (Value::None, other) | (other, Value::None) => Some(other.clone()),
        (Value::Choice { kind: ka, alternatives: xs }, Value::Choice { kind: kb, alternatives: ys }) => {
            intersect_choices(*ka, xs, *kb, ys)
        }
        (Value::Choice { kind, alternatives }, scalar) | (scalar, Value::Choice { kind, alternatives }) => {
            intersect_choice_scalar(*kind, alternatives, scalar)
        }
        (Value::Struct(xs), Value::Struct(ys)) if xs.len() == ys.len() => {
            let merged: Option<Vec<Value>> =
                xs.iter().zip(ys.iter()).map(|(x, y)| intersect(x, y)).collect();
            merged.map(Value::Struct)
        }
        (Value::Object { object_type: ta, object_id: ida, properties: pa },
         Value::Object { object_type: tb, object_id: idb, properties: pb })
            if ta == tb && ida == idb =>
        {
            intersect_objects(*ta, *ida, pa, pb)
        }
        (x, y) if values_equal(x, y) => Some(x.clone()),
        _ => None,
    }
}

fn intersect_choices(ka: ChoiceKind, xs: &[Value], kb: ChoiceKind, ys: &[Value]) -> Option<Value> {
    use ChoiceKind::*;
    match (ka, kb) {
        (Enum, Enum) => {
            let overlap: Vec<Value> = xs.iter().filter(|x| ys.iter().any(|y| values_equal(x, y))).cloned().collect();
            if overlap.is_empty() { Option::None } else { Some(Value::Choice { kind: Enum, alternatives: overlap }) }
        }
        (Range, Range) => {
            let (a_lo, a_hi) = range_bounds(xs)?;
            let (b_lo, b_hi) = range_bounds(ys)?;
            let lo = numeric_max(&a_lo, &b_lo)?;
            let hi = numeric_min(&a_hi, &b_hi)?;
            if numeric_cmp(&lo, &hi)?.is_gt() {
                Option::None
            } else {
                Some(Value::Choice { kind: Range, alternatives: vec![lo.clone(), lo, hi] })
            }
        }
        (Step, Range) | (Range, Step) => {
            let (step_alts, range_alts) = if ka == Step { (xs, ys) } else { (ys, xs) };
            let (r_lo, r_hi) = range_bounds(range_alts)?;
            let default = step_alts.first()?;
            let lo = step_alts.get(1).unwrap_or(default);
            let hi = step_alts.get(2).unwrap_or(default);
            let step = step_alts.get(3).unwrap_or(default);
            let new_lo = numeric_max(lo, &r_lo)?;
            let new_hi = numeric_min(hi, &r_hi)?;
            if numeric_cmp(&new_lo, &new_hi)?.is_gt() {
                Option::None
            } else {
                Some(Value::Choice {
                    kind: Step,
                    alternatives: vec![new_lo.clone(), new_lo, new_hi, step.clone()],
                })
            }
        }
        (Flags, Flags) => {
            let a = xs.first()?;
            let b = ys.first()?;
            and_flags(a, b).map(|v| Value::Choice { kind: Flags, alternatives: vec![v] })
        }
        _ => Option::None,
    }
}

fn intersect_choice_scalar(kind: ChoiceKind, alternatives: &[Value], scalar: &Value) -> Option<Value> {
    use ChoiceKind::*;
    match kind {
        Enum => alternatives.iter().find(|v| values_equal(v, scalar)).cloned(),
        Range => {
            let (lo, hi) = range_bounds(alternatives)?;
            let in_range = numeric_cmp(&lo, scalar)?.is_le() && numeric_cmp(scalar, &hi)?.is_le();
            in_range.then(|| scalar.clone())
        }
        Step => {
            let default = alternatives.first()?;
            let lo = alternatives.get(1).unwrap_or(default);
            let hi = alternatives.get(2).unwrap_or(default);
            let in_range = numeric_cmp(lo, scalar)?.is_le() && numeric_cmp(scalar, hi)?.is_le();
            in_range.then(|| scalar.clone())
        }
        Flags => and_flags(alternatives.first()?, scalar),
        None => Some(scalar.clone()),
    }
}

fn range_bounds(alternatives: &[Value]) -> Option<(Value, Value)> {
    // Choice.Range layout: [default, min, max].
    let lo = alternatives.get(1).or_else(|| alternatives.first())?.clone();
    let hi = alternatives.get(2).or_else(|| alternatives.first())?.clone();
    Some((lo, hi))
}

fn and_flags(a: &Value, b: &Value) -> Option<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(Value::Int(x & y)),
        (Value::Long(x), Value::Long(y)) => Some(Value::Long(x & y)),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    use Value::*;
    match (a, b) {
        (None, None) => true,
        (Bool(x), Bool(y)) => x == y,
        (Id(x), Id(y)) => x == y,
        (Int(x), Int(y)) => x == y,
        (Long(x), Long(y)) => x == y,
        (Float(x), Float(y)) => x == y,
        (Double(x), Double(y)) => x == y,
        (String(x), String(y)) => x == y,
        (Bytes(x), Bytes(y)) => x == y,
        (Pointer(x), Pointer(y)) => x == y,
        (Fd(x), Fd(y)) => x == y,
        (Rectangle(x), Rectangle(y)) => x == y,
        (Fraction(x), Fraction(y)) => x == y,
        (Bitmap(x), Bitmap(y)) => x == y,
        (Array(x), Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b)),
        (Struct(x), Struct(y)) => x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b)),
        _ => false,
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Long(x), Value::Long(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Double(x), Value::Double(y)) => x.partial_cmp(y),
        _ => None,
    }
}

fn numeric_max(a: &Value, b: &Value) -> Option<Value> {
    match numeric_cmp(a, b)? {
        std::cmp::Ordering::Less => Some(b.clone()),
        _ => Some(a.clone()),
    }
}

fn numeric_min(a: &Value, b: &Value) -> Option<Value> {
    match numeric_cmp(a, b)? {
        std::cmp::Ordering::Greater => Some(b.clone()),
        _ => Some(a.clone()),
    }
}

fn intersect_objects(
    object_type: u32,
    object_id: u32,
    pa: &[patchbay_proto::Property],
    pb: &[patchbay_proto::Property],
) -> Option<Value> {
    let mut properties = Vec::new();
    for prop_a in pa {
        if prop_a.is_unset() {
            continue;
        }
        match pb.iter().find(|p| p.key_id == prop_a.key_id) {
            Some(prop_b) if !prop_b.is_unset() => {
                let merged = intersect(&prop_a.value, &prop_b.value)?;
                properties.push(patchbay_proto::Property::new(prop_a.key_id, merged));
            }
            Some(_) | None => properties.push(prop_a.clone()),
        }
    }
    for prop_b in pb {
        if !prop_b.is_unset() && !properties.iter().any(|p| p.key_id == prop_b.key_id) {
            properties.push(prop_b.clone());
        }
    }
    Some(Value::Object { object_type, object_id, properties })
}

/// Apply `set_param(Format, chosen)` to `port`, running the Init/Ready
/// renegotiation rule from §4.5 step 5: any state transitions back to
/// `Configure`, except that setting the format already in effect is a
/// no-op per the idempotence law in §8.
pub fn set_format(port: &mut Port, chosen: Value) -> Result<(), CoreError> {
    if port.current_format.as_ref() == Some(&chosen) {
        return Ok(());
    }
    if enumerate_matches(&port.supported_formats, &chosen).is_empty()
        && !port.supported_formats.is_empty()
    {
        return Err(CoreError::NoFormat);
    }
    port.current_format = Some(chosen);
    port.state = PortState::Configure;
    Ok(())
}

/// §4.5 step 2: caller has picked concrete buffer parameters and calls
/// `use_buffers`. Advances Configure -> Ready.
pub fn use_buffers(port: &mut Port, layout: crate::primitives::BufferLayout) -> Result<(), CoreError> {
    if port.state != PortState::Configure {
        return Err(CoreError::InvalidParam(format!(
            "use_buffers requires Configure, port is {:?}",
            port.state
        )));
    }
    port.buffer_layout = Some(layout);
    port.state = PortState::Ready;
    Ok(())
}

/// §4.5 step 3: activation attaches the IO area. Ready -> Paused.
pub fn activate(port: &mut Port, io_area: std::sync::Arc<crate::primitives::IoArea>) -> Result<(), CoreError> {
    if port.state != PortState::Ready {
        return Err(CoreError::InvalidParam(format!("activate requires Ready, port is {:?}", port.state)));
    }
    port.io_area = Some(io_area);
    port.state = PortState::Paused;
    Ok(())
}

/// §4.5 step 4: `Start` command. Paused -> Streaming.
pub fn start(port: &mut Port) -> Result<(), CoreError> {
    if port.state != PortState::Paused {
        return Err(CoreError::InvalidParam(format!("start requires Paused, port is {:?}", port.state)));
    }
    port.state = PortState::Streaming;
    Ok(())
}

/// §4.5 step 5: `Suspend` resets to Init from any state.
pub fn suspend(port: &mut Port) {
    port.current_format = None;
    port.buffer_layout = None;
    port.io_area = None;
    port.state = PortState::Init;
}

/// §4.5's "output-side port wins unless only one side can" allocator
/// rule. `out_can_alloc`/`in_can_alloc` come from each port's
/// `PortFlags::CAN_ALLOC_BUFFERS`.
pub fn choose_allocator(out_can_alloc: bool, in_can_alloc: bool) -> Result<Direction, CoreError> {
    match (out_can_alloc, in_can_alloc) {
        (true, _) => Ok(Direction::Output),
        (false, true) => Ok(Direction::Input),
        (false, false) => Err(CoreError::NotSupported("neither port can allocate buffers".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchbay_proto::Property;

    fn enum_choice(values: Vec<Value>) -> Value {
        Value::Choice { kind: ChoiceKind::Enum, alternatives: values }
    }

    #[test]
    fn enum_intersect_overlap() {
        let a = enum_choice(vec![Value::Int(44100), Value::Int(48000)]);
        let b = enum_choice(vec![Value::Int(48000)]);
        let result = intersect(&a, &b).unwrap();
        assert_eq!(result, enum_choice(vec![Value::Int(48000)]));
    }

    #[test]
    fn enum_intersect_empty_is_no_format() {
        let a = enum_choice(vec![Value::Int(44100)]);
        let b = enum_choice(vec![Value::Int(48000)]);
        assert!(intersect(&a, &b).is_none());
    }

    #[test]
    fn range_intersect_narrows_bounds() {
        let a = Value::Choice { kind: ChoiceKind::Range, alternatives: vec![Value::Int(10), Value::Int(0), Value::Int(100)] };
        let b = Value::Choice { kind: ChoiceKind::Range, alternatives: vec![Value::Int(10), Value::Int(50), Value::Int(200)] };
        let result = intersect(&a, &b).unwrap();
        match result {
            Value::Choice { alternatives, .. } => {
                assert_eq!(alternatives[1], Value::Int(50));
                assert_eq!(alternatives[2], Value::Int(100));
            }
            _ => panic!("expected choice"),
        }
    }

    #[test]
    fn none_intersect_passes_through() {
        let requested = Value::Int(48000);
        assert_eq!(intersect(&Value::None, &requested), Some(requested));
    }

    #[test]
    fn audio_passthrough_negotiation() {
        let source = Value::Object {
            object_type: 1,
            object_id: 1,
            properties: vec![
                Property::new(1, Value::Id(1)),
                Property::new(2, enum_choice(vec![Value::Int(44100), Value::Int(48000)])),
                Property::new(3, Value::Int(2)),
            ],
        };
        let sink = Value::Object {
            object_type: 1,
            object_id: 1,
            properties: vec![
                Property::new(1, Value::Id(1)),
                Property::new(2, Value::Int(48000)),
                Property::new(3, Value::Int(2)),
            ],
        };
        let negotiated = intersect(&source, &sink).unwrap();
        match negotiated {
            Value::Object { properties, .. } => {
                assert_eq!(properties.iter().find(|p| p.key_id == 2).unwrap().value, Value::Int(48000));
            }
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn allocator_side_prefers_output() {
        assert_eq!(choose_allocator(true, true).unwrap(), Direction::Output);
        assert_eq!(choose_allocator(false, true).unwrap(), Direction::Input);
        assert!(choose_allocator(false, false).is_err());
    }

    #[test]
    fn set_format_idempotent_when_unchanged() {
        use crate::primitives::PortFlags;
        let mut port = Port::new(1, Direction::Output, 0, PortFlags::empty());
        port.current_format = Some(Value::Int(48000));
        port.state = PortState::Ready;
        set_format(&mut port, Value::Int(48000)).unwrap();
        assert_eq!(port.state, PortState::Ready);
    }
}
