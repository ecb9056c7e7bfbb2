//! AST types for filter expressions.

use std::fmt;

/// Literal on the right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    /// Byte string written as `aa:bb:cc`
    Bytes(Vec<u8>),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(v) => write!(f, "{v}"),
            Literal::Float(v) => write!(f, "{v}"),
            Literal::Str(s) => write!(f, "{s:?}"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Bytes(bytes) => {
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Substring or byte subsequence
    Contains,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Contains => "contains",
        }
    }
}

/// Leaf predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Bare identifier: a layer with this tag or an attribute with this id exists
    Present(String),
    /// `field op literal`
    Compare {
        field: String,
        op: CompareOp,
        value: Literal,
    },
}

/// Boolean expression combining predicates.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    /// A leaf predicate
    Predicate(Predicate),
    /// Logical NOT
    Not(Box<FilterExpr>),
    /// Logical AND
    And(Box<FilterExpr>, Box<FilterExpr>),
    /// Logical OR
    Or(Box<FilterExpr>, Box<FilterExpr>),
}

impl FilterExpr {
    /// Create a NOT expression.
    pub fn negate(expr: FilterExpr) -> Self {
        FilterExpr::Not(Box::new(expr))
    }

    /// Create an AND expression.
    pub fn and(left: FilterExpr, right: FilterExpr) -> Self {
        FilterExpr::And(Box::new(left), Box::new(right))
    }

    /// Create an OR expression.
    pub fn or(left: FilterExpr, right: FilterExpr) -> Self {
        FilterExpr::Or(Box::new(left), Box::new(right))
    }

    pub fn present(field: &str) -> Self {
        FilterExpr::Predicate(Predicate::Present(field.to_string()))
    }

    pub fn compare(field: &str, op: CompareOp, value: Literal) -> Self {
        FilterExpr::Predicate(Predicate::Compare {
            field: field.to_string(),
            op,
            value,
        })
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterExpr::Predicate(Predicate::Present(field)) => f.write_str(field),
            FilterExpr::Predicate(Predicate::Compare { field, op, value }) => {
                write!(f, "{field} {} {value}", op.as_str())
            }
            FilterExpr::Not(inner) => write!(f, "not ({inner})"),
            FilterExpr::And(l, r) => write!(f, "({l} and {r})"),
            FilterExpr::Or(l, r) => write!(f, "({l} or {r})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expr_display() {
        let expr = FilterExpr::or(
            FilterExpr::and(
                FilterExpr::present("tcp"),
                FilterExpr::compare("tcp.dstport", CompareOp::Eq, Literal::Int(80)),
            ),
            FilterExpr::negate(FilterExpr::compare(
                "eth.src",
                CompareOp::Contains,
                Literal::Bytes(vec![0xde, 0xad]),
            )),
        );
        assert_eq!(
            expr.to_string(),
            "((tcp and tcp.dstport == 80) or not (eth.src contains de:ad))"
        );
    }

    #[test]
    fn test_literal_display() {
        assert_eq!(Literal::Str("GET".into()).to_string(), "\"GET\"");
        assert_eq!(Literal::Float(1.5).to_string(), "1.5");
        assert_eq!(Literal::Bool(true).to_string(), "true");
    }
}
