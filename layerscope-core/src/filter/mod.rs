//! Filter expressions over packet stacks.
//!
//! A filter tests a [`PacketStack`] against a predicate tree of attribute
//! comparisons and boolean combinators, and reports which attributes
//! satisfied it so renderers can highlight them.
//!
//! # Example
//!
//! ```rust
//! use layerscope_core::filter::Filter;
//!
//! let filter = Filter::compile("tcp.dstport == 80 and not tcp.flags.rst == true").unwrap();
//! assert_eq!(filter.expression(), "tcp.dstport == 80 and not tcp.flags.rst == true");
//! ```
//!
//! # Supported Syntax
//!
//! ## Presence
//! - `tcp` - a layer with this tag exists
//! - `tcp.flags.syn` - an attribute with this identifier exists
//!
//! ## Comparisons
//! - `==`, `!=`, `<`, `<=`, `>`, `>=`
//! - `contains` - substring or byte subsequence
//!
//! ## Literals
//! - Integers: `80`, `-1`, `0x12`
//! - Floats: `1.5`
//! - Strings: `"GET"`
//! - Booleans: `true`, `false`
//! - Byte strings: `de:ad:be:ef`
//!
//! ## Logical operators
//! - `and`, `&&` - Logical AND
//! - `or`, `||` - Logical OR
//! - `not`, `!` - Logical NOT
//! - Parentheses for grouping: `(tcp or udp) and ipv4.ttl < 5`

mod ast;
mod error;
mod eval;
mod parser;

use std::sync::Arc;

use crate::layer::{Layer, PacketStack};
use crate::stream::StreamLayer;

pub use ast::{CompareOp, FilterExpr, Literal, Predicate};
pub use error::FilterError;
pub use eval::{evaluate, evaluate_layer, evaluate_with_streams, FilterMatch};
pub use parser::parse_filter;

/// A compiled filter expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    expression: String,
    expr: FilterExpr,
}

impl Filter {
    /// Compile a filter expression.
    pub fn compile(expression: &str) -> Result<Self, FilterError> {
        let expr = parse_filter(expression)?;
        Ok(Self {
            expression: expression.trim().to_string(),
            expr,
        })
    }

    /// The source text, trimmed.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn expr(&self) -> &FilterExpr {
        &self.expr
    }

    /// Whether the packet satisfies the filter.
    pub fn matches(&self, stack: &PacketStack) -> bool {
        evaluate(&self.expr, stack).matched
    }

    /// Evaluate, collecting the attributes that satisfied leaf predicates.
    pub fn evaluate<'a>(&self, stack: &'a PacketStack) -> FilterMatch<'a> {
        evaluate(&self.expr, stack)
    }

    /// Whether the packet, together with the stream layers it completed,
    /// satisfies the filter.
    pub fn matches_with_streams(&self, stack: &PacketStack, streams: &[Arc<StreamLayer>]) -> bool {
        evaluate_with_streams(&self.expr, stack, streams).matched
    }

    /// Whether a single layer satisfies the filter.
    pub fn matches_layer(&self, layer: &Layer) -> bool {
        evaluate_layer(&self.expr, layer).matched
    }

    /// Evaluate over the packet and its completed stream layers.
    pub fn evaluate_with_streams<'a>(
        &self,
        stack: &'a PacketStack,
        streams: &'a [Arc<StreamLayer>],
    ) -> FilterMatch<'a> {
        evaluate_with_streams(&self.expr, stack, streams)
    }
}

impl std::str::FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Filter::compile(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile() {
        let filter = Filter::compile("  tcp and udp ").unwrap();
        assert_eq!(filter.expression(), "tcp and udp");
        assert!(matches!(filter.expr(), FilterExpr::And(_, _)));
    }

    #[test]
    fn test_compile_error() {
        assert!(Filter::compile("").is_err());
        assert!("tcp ==".parse::<Filter>().is_err());
    }
}
