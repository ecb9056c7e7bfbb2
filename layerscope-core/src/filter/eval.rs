//! Evaluation of filter expressions against a packet stack.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::attr::{Attr, Value};
use crate::layer::{Layer, PacketStack};
use crate::stream::StreamLayer;

use super::ast::{CompareOp, FilterExpr, Literal, Predicate};

/// Result of evaluating a filter against one packet.
#[derive(Debug, Clone, Default)]
pub struct FilterMatch<'a> {
    pub matched: bool,
    /// Attributes that satisfied leaf predicates, for highlighting. Empty
    /// when the packet did not match.
    pub attrs: Vec<&'a Attr>,
}

impl<'a> FilterMatch<'a> {
    fn miss() -> Self {
        Self::default()
    }

    fn hit(attrs: Vec<&'a Attr>) -> Self {
        Self {
            matched: true,
            attrs,
        }
    }
}

/// Evaluate `expr` against `stack`.
///
/// Combinators short-circuit left to right. Identifiers that appear nowhere
/// in the stack simply do not match. Attributes under `not` are never
/// reported, since a negated match has no satisfying attribute.
pub fn evaluate<'a>(expr: &FilterExpr, stack: &'a PacketStack) -> FilterMatch<'a> {
    let layers: Vec<&Layer> = stack.layers.iter().collect();
    evaluate_layers(expr, &layers)
}

/// Evaluate `expr` against `stack` together with the stream layers its
/// packet completed. Stream layers are searched after the packet's own.
pub fn evaluate_with_streams<'a>(
    expr: &FilterExpr,
    stack: &'a PacketStack,
    streams: &'a [Arc<StreamLayer>],
) -> FilterMatch<'a> {
    let layers: Vec<&Layer> = stack
        .layers
        .iter()
        .chain(streams.iter().map(|s| &s.layer))
        .collect();
    evaluate_layers(expr, &layers)
}

/// Evaluate `expr` against a single layer.
pub fn evaluate_layer<'a>(expr: &FilterExpr, layer: &'a Layer) -> FilterMatch<'a> {
    evaluate_layers(expr, &[layer])
}

fn evaluate_layers<'a>(expr: &FilterExpr, layers: &[&'a Layer]) -> FilterMatch<'a> {
    match expr {
        FilterExpr::Predicate(predicate) => evaluate_predicate(predicate, layers),
        FilterExpr::Not(inner) => {
            if evaluate_layers(inner, layers).matched {
                FilterMatch::miss()
            } else {
                FilterMatch::hit(Vec::new())
            }
        }
        FilterExpr::And(left, right) => {
            let left = evaluate_layers(left, layers);
            if !left.matched {
                return FilterMatch::miss();
            }
            let right = evaluate_layers(right, layers);
            if !right.matched {
                return FilterMatch::miss();
            }
            let mut attrs = left.attrs;
            attrs.extend(right.attrs);
            FilterMatch::hit(attrs)
        }
        FilterExpr::Or(left, right) => {
            let left = evaluate_layers(left, layers);
            if left.matched {
                return left;
            }
            evaluate_layers(right, layers)
        }
    }
}

fn attrs<'a, 'b>(layers: &'b [&'a Layer], id: &'b str) -> impl Iterator<Item = &'a Attr> + 'b
where
    'a: 'b,
{
    layers
        .iter()
        .copied()
        .flat_map(Layer::walk)
        .filter(move |a| a.id() == id)
}

fn evaluate_predicate<'a>(predicate: &Predicate, layers: &[&'a Layer]) -> FilterMatch<'a> {
    match predicate {
        Predicate::Present(field) => {
            let found: Vec<&Attr> = attrs(layers, field).collect();
            if !found.is_empty() {
                FilterMatch::hit(found)
            } else if layers.iter().any(|l| l.tag() == field.as_str()) {
                FilterMatch::hit(Vec::new())
            } else {
                FilterMatch::miss()
            }
        }
        Predicate::Compare { field, op, value } => {
            let found: Vec<&Attr> = attrs(layers, field)
                .filter(|attr| compare(attr.value(), *op, value))
                .collect();
            if found.is_empty() {
                FilterMatch::miss()
            } else {
                FilterMatch::hit(found)
            }
        }
    }
}

/// Compare an attribute value with a literal. Mismatched types never match.
fn compare(actual: &Value, op: CompareOp, literal: &Literal) -> bool {
    if op == CompareOp::Contains {
        return contains(actual, literal);
    }
    let ordering = match (actual, literal) {
        (Value::Int(_) | Value::Flags(_), Literal::Int(expected)) => {
            actual.as_i64().map(|v| v.cmp(expected))
        }
        (Value::Int(_) | Value::Flags(_) | Value::Float(_), Literal::Float(expected)) => {
            actual.as_f64().and_then(|v| v.partial_cmp(expected))
        }
        (Value::Float(v), Literal::Int(expected)) => v.partial_cmp(&(*expected as f64)),
        (Value::Str(s), Literal::Str(expected)) => Some(s.as_str().cmp(expected.as_str())),
        (Value::Bool(b), Literal::Bool(expected)) => Some(b.cmp(expected)),
        (Value::Bool(b), Literal::Int(expected)) => Some(i64::from(*b).cmp(expected)),
        (Value::Bytes(bytes), Literal::Bytes(expected)) => Some(bytes.as_ref().cmp(expected.as_slice())),
        (Value::Bytes(bytes), Literal::Str(expected)) => Some(bytes.as_ref().cmp(expected.as_bytes())),
        _ => None,
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
        CompareOp::Contains => false,
    }
}

fn contains(actual: &Value, literal: &Literal) -> bool {
    let needle: &[u8] = match literal {
        Literal::Str(s) => s.as_bytes(),
        Literal::Bytes(b) => b,
        _ => return false,
    };
    let haystack: &[u8] = match actual {
        Value::Str(s) => s.as_bytes(),
        Value::Bytes(b) => b,
        _ => return false,
    };
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::stream::{Endpoint, StreamTag};
    use bytes::Bytes;

    fn stack() -> PacketStack {
        let data = Bytes::from_static(&[0u8; 40]);
        PacketStack {
            index: 1,
            timestamp_ns: 0,
            link_type: 101,
            original_len: 40,
            data,
            layers: vec![
                Layer::new("ipv4", 0..20)
                    .with_attr(Attr::new("ipv4.ttl", 64u8, 8..9))
                    .with_attr(Attr::new("ipv4.src", "10.0.0.1", 12..16))
                    .with_payload(20..40),
                Layer::new("tcp", 20..40)
                    .with_attr(Attr::new("tcp.dstport", 80u16, 22..24))
                    .with_attr(Attr::flags(
                        "tcp.flags",
                        0x12,
                        33..34,
                        &[("syn", 0x02), ("ack", 0x10), ("rst", 0x04)],
                    ))
                    .with_attr(Attr::new("tcp.options", Value::bytes(&[1, 1, 8, 10]), 34..38)),
            ],
        }
    }

    fn eval(filter: &str) -> (bool, Vec<String>) {
        let stack = stack();
        let filter = Filter::compile(filter).unwrap();
        let result = filter.evaluate(&stack);
        (
            result.matched,
            result.attrs.iter().map(|a| a.id().to_string()).collect(),
        )
    }

    // Test 1: Presence of layers and attributes
    #[test]
    fn test_presence() {
        assert_eq!(eval("tcp"), (true, vec![]));
        assert_eq!(eval("ipv4.ttl"), (true, vec!["ipv4.ttl".to_string()]));
        assert!(!eval("udp").0);
    }

    // Test 2: Comparisons across value types
    #[test]
    fn test_comparisons() {
        assert!(eval("tcp.dstport == 80").0);
        assert!(eval("tcp.dstport != 443").0);
        assert!(eval("ipv4.ttl > 10 && ipv4.ttl <= 64").0);
        assert!(!eval("ipv4.ttl < 64").0);
        assert!(eval("ipv4.ttl >= 63.5").0);
        assert!(eval("ipv4.src == \"10.0.0.1\"").0);
        assert!(eval("ipv4.src contains \"0.0\"").0);
        assert!(eval("tcp.options contains 08:0a").0);
        assert!(eval("tcp.flags == 0x12").0);
    }

    // Test 3: Flag children are addressable
    #[test]
    fn test_flags() {
        assert!(eval("tcp.flags.syn == true").0);
        assert!(eval("tcp.flags.rst == false").0);
        assert!(eval("tcp.flags.syn and not tcp.flags.rst == true").0);
    }

    // Test 4: Unknown identifiers and mismatched types do not match
    #[test]
    fn test_unknown_identifiers() {
        assert_eq!(eval("http.request.method == \"GET\""), (false, vec![]));
        assert!(!eval("ipv4.src == 10").0);
        assert!(eval("not dns").0);
        assert!(eval("dns or tcp").0);
    }

    // Test 5: Highlighted attributes follow the matching branches
    #[test]
    fn test_highlights() {
        let (matched, attrs) = eval("ipv4.ttl == 64 and tcp.dstport == 80");
        assert!(matched);
        assert_eq!(attrs, vec!["ipv4.ttl", "tcp.dstport"]);

        // Or stops at the first matching branch
        let (_, attrs) = eval("ipv4.ttl == 64 or tcp.dstport == 80");
        assert_eq!(attrs, vec!["ipv4.ttl"]);

        // Negated matches highlight nothing
        let (matched, attrs) = eval("not tcp.dstport == 443");
        assert!(matched);
        assert!(attrs.is_empty());

        // No match, no highlights
        let (matched, attrs) = eval("ipv4.ttl == 64 and udp");
        assert!(!matched);
        assert!(attrs.is_empty());
    }

    // Test 6: Stream layers completed by the packet are searched too
    #[test]
    fn test_stream_layers() {
        let stack = stack();
        let tag = StreamTag::new(
            "tcp",
            Endpoint::new(&[10, 0, 0, 1], 40000),
            Endpoint::new(&[10, 0, 0, 2], 80),
        );
        let streams = vec![Arc::new(StreamLayer {
            stream: tag.id,
            sequence: 1,
            packet_index: 1,
            stream_range: 0..5,
            layer: Layer::new("line", 0..5).with_attr(Attr::new("line.text", "hello", 0..5)),
        })];
        let filter = Filter::compile("line.text == \"hello\" and tcp.dstport == 80").unwrap();

        assert!(!filter.matches(&stack));
        let result = filter.evaluate_with_streams(&stack, &streams);
        assert!(result.matched);
        assert_eq!(
            result.attrs.iter().map(|a| a.id()).collect::<Vec<_>>(),
            vec!["line.text", "tcp.dstport"]
        );
        assert!(filter.matches_with_streams(&stack, &streams));
        assert!(Filter::compile("line").unwrap().matches_with_streams(&stack, &streams));
        assert!(!Filter::compile("http").unwrap().matches_with_streams(&stack, &streams));

        // A stream layer on its own
        assert!(Filter::compile("line.text contains \"ell\"").unwrap().matches_layer(&streams[0].layer));
        assert!(!Filter::compile("tcp").unwrap().matches_layer(&streams[0].layer));
    }
}
