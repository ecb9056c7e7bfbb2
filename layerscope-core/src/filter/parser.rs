//! Filter expression parser using nom.
//!
//! Grammar (operator precedence: NOT > AND > OR):
//! ```text
//! filter     = expr
//! expr       = term (("or" | "||") term)*
//! term       = factor (("and" | "&&") factor)*
//! factor     = ("not" | "!") factor | "(" expr ")" | predicate
//! predicate  = field [op literal]
//! op         = "==" | "!=" | "<" | "<=" | ">" | ">=" | "contains"
//! literal    = string | bytes | hex | float | int | "true" | "false"
//! ```

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while_m_n},
    character::complete::{char, digit1, hex_digit1, multispace0, satisfy},
    combinator::{all_consuming, map, map_res, not, opt, recognize, value},
    error::{Error as NomError, ErrorKind},
    multi::{many0, many1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

use super::ast::{CompareOp, FilterExpr, Literal, Predicate};
use super::error::FilterError;

/// Deepest nesting of `not` and parentheses a filter may use.
pub const MAX_NESTING: usize = 256;

/// Parse a complete filter expression.
pub fn parse_filter(input: &str) -> Result<FilterExpr, FilterError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(FilterError::EmptyFilter);
    }

    match all_consuming(delimited(multispace0, |i| expr(i, 0), multispace0))(input) {
        Ok((_, expr)) => Ok(expr),
        Err(nom::Err::Failure(e)) if e.code == ErrorKind::TooLarge => Err(FilterError::TooDeep {
            limit: MAX_NESTING,
        }),
        Err(e) => Err(FilterError::parse_error(format!("{e}"))),
    }
}

// =============================================================================
// Expression Parsers (handle operator precedence)
// =============================================================================

/// Parse an expression (OR level - lowest precedence).
fn expr(input: &str, depth: usize) -> IResult<&str, FilterExpr> {
    let (input, first) = term(input, depth)?;
    let (input, rest) = many0(preceded(
        delimited(multispace0, alt((keyword("or"), tag("||"))), multispace0),
        |i| term(i, depth),
    ))(input)?;

    Ok((input, rest.into_iter().fold(first, FilterExpr::or)))
}

/// Parse a term (AND level).
fn term(input: &str, depth: usize) -> IResult<&str, FilterExpr> {
    let (input, first) = factor(input, depth)?;
    let (input, rest) = many0(preceded(
        delimited(multispace0, alt((keyword("and"), tag("&&"))), multispace0),
        |i| factor(i, depth),
    ))(input)?;

    Ok((input, rest.into_iter().fold(first, FilterExpr::and)))
}

/// Parse a factor (NOT and parentheses).
///
/// Fails without backtracking once nesting passes [`MAX_NESTING`].
fn factor(input: &str, depth: usize) -> IResult<&str, FilterExpr> {
    if depth > MAX_NESTING {
        return Err(nom::Err::Failure(NomError::new(input, ErrorKind::TooLarge)));
    }
    alt((
        |i| not_expr(i, depth + 1),
        |i| paren_expr(i, depth + 1),
        predicate,
    ))(input)
}

/// Parse NOT expression.
fn not_expr(input: &str, depth: usize) -> IResult<&str, FilterExpr> {
    let (input, _) = alt((keyword("not"), tag("!")))(input)?;
    let (input, _) = multispace0(input)?;
    let (input, expr) = factor(input, depth)?;
    Ok((input, FilterExpr::negate(expr)))
}

/// Parse parenthesized expression.
fn paren_expr(input: &str, depth: usize) -> IResult<&str, FilterExpr> {
    delimited(
        pair(char('('), multispace0),
        |i| expr(i, depth),
        pair(multispace0, char(')')),
    )(input)
}

/// Parse a presence test or a comparison.
fn predicate(input: &str) -> IResult<&str, FilterExpr> {
    let (input, field) = identifier(input)?;
    let (input, comparison) = opt(pair(
        delimited(multispace0, compare_op, multispace0),
        literal,
    ))(input)?;

    let predicate = match comparison {
        Some((op, value)) => Predicate::Compare {
            field: field.to_string(),
            op,
            value,
        },
        None => Predicate::Present(field.to_string()),
    };
    Ok((input, FilterExpr::Predicate(predicate)))
}

// =============================================================================
// Helper Parsers
// =============================================================================

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Match a keyword that is not the prefix of a longer identifier.
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag_no_case(word), not(satisfy(is_ident_char)))
}

/// Parse a dotted identifier: `tcp`, `tcp.flags.syn`.
fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(is_ident_char),
    ))(input)
}

/// Parse a comparison operator.
fn compare_op(input: &str) -> IResult<&str, CompareOp> {
    alt((
        value(CompareOp::Eq, tag("==")),
        value(CompareOp::Ne, tag("!=")),
        value(CompareOp::Le, tag("<=")),
        value(CompareOp::Ge, tag(">=")),
        value(CompareOp::Lt, tag("<")),
        value(CompareOp::Gt, tag(">")),
        value(CompareOp::Contains, keyword("contains")),
    ))(input)
}

/// Parse a literal value.
fn literal(input: &str) -> IResult<&str, Literal> {
    alt((
        map(string_literal, Literal::Str),
        map(bytes_literal, Literal::Bytes),
        map(hex_literal, Literal::Int),
        map(float_literal, Literal::Float),
        map(int_literal, Literal::Int),
        value(Literal::Bool(true), keyword("true")),
        value(Literal::Bool(false), keyword("false")),
    ))(input)
}

/// Parse a double-quoted string with `\"`, `\\`, `\n` and `\t` escapes.
fn string_literal(input: &str) -> IResult<&str, String> {
    let (rest, _) = char('"')(input)?;
    let mut out = String::new();
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((&rest[i + 1..], out)),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, escaped)) => out.push(escaped),
                None => break,
            },
            c => out.push(c),
        }
    }
    // Unterminated string
    Err(nom::Err::Error(NomError::new(input, ErrorKind::Char)))
}

/// Parse one byte as two hex digits.
fn hex_byte(input: &str) -> IResult<&str, u8> {
    map_res(
        take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
        |s: &str| u8::from_str_radix(s, 16),
    )(input)
}

/// Parse a colon-separated byte string of at least two bytes: `de:ad:be:ef`.
fn bytes_literal(input: &str) -> IResult<&str, Vec<u8>> {
    let (input, first) = hex_byte(input)?;
    let (input, rest) = many1(preceded(char(':'), hex_byte))(input)?;
    let mut bytes = Vec::with_capacity(rest.len() + 1);
    bytes.push(first);
    bytes.extend(rest);
    Ok((input, bytes))
}

/// Parse a hex integer: `0x12`.
fn hex_literal(input: &str) -> IResult<&str, i64> {
    preceded(
        tag_no_case("0x"),
        map_res(hex_digit1, |s: &str| i64::from_str_radix(s, 16)),
    )(input)
}

/// Parse a decimal float: `1.5`, `-0.25`.
fn float_literal(input: &str) -> IResult<&str, f64> {
    map_res(
        recognize(tuple((opt(char('-')), digit1, char('.'), digit1))),
        |s: &str| s.parse::<f64>(),
    )(input)
}

/// Parse a decimal integer.
fn int_literal(input: &str) -> IResult<&str, i64> {
    map_res(recognize(pair(opt(char('-')), digit1)), |s: &str| {
        s.parse::<i64>()
    })(input)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_presence() {
        let expr = parse_filter("tcp").unwrap();
        assert_eq!(expr, FilterExpr::present("tcp"));

        let expr = parse_filter("tcp.flags.syn").unwrap();
        assert_eq!(expr, FilterExpr::present("tcp.flags.syn"));
    }

    #[test]
    fn test_parse_comparisons() {
        let cases = [
            ("tcp.dstport == 80", CompareOp::Eq, Literal::Int(80)),
            ("ipv4.ttl!=64", CompareOp::Ne, Literal::Int(64)),
            ("ipv4.ttl < 10", CompareOp::Lt, Literal::Int(10)),
            ("ipv4.ttl <= 10", CompareOp::Le, Literal::Int(10)),
            ("tcp.window > 0x100", CompareOp::Gt, Literal::Int(256)),
            ("frame.delta >= -1.5", CompareOp::Ge, Literal::Float(-1.5)),
            (
                "http.request.uri contains \"/api\"",
                CompareOp::Contains,
                Literal::Str("/api".into()),
            ),
        ];
        for (input, op, value) in cases {
            let expr = parse_filter(input).unwrap();
            let FilterExpr::Predicate(Predicate::Compare { op: got, value: v, .. }) = expr else {
                panic!("expected comparison for {input}");
            };
            assert_eq!(got, op, "{input}");
            assert_eq!(v, value, "{input}");
        }
    }

    #[test]
    fn test_parse_bytes_and_bool() {
        let expr = parse_filter("eth.src == de:ad:be:ef:00:01").unwrap();
        assert_eq!(
            expr,
            FilterExpr::compare(
                "eth.src",
                CompareOp::Eq,
                Literal::Bytes(vec![0xde, 0xad, 0xbe, 0xef, 0x00, 0x01])
            )
        );

        let expr = parse_filter("tcp.flags.syn == true").unwrap();
        assert_eq!(
            expr,
            FilterExpr::compare("tcp.flags.syn", CompareOp::Eq, Literal::Bool(true))
        );
    }

    #[test]
    fn test_parse_string_escapes() {
        let expr = parse_filter(r#"http.user_agent == "say \"hi\"""#).unwrap();
        assert_eq!(
            expr,
            FilterExpr::compare(
                "http.user_agent",
                CompareOp::Eq,
                Literal::Str("say \"hi\"".into())
            )
        );
        assert!(parse_filter(r#"http.host == "unterminated"#).is_err());
    }

    #[test]
    fn test_parse_and_or() {
        let expr = parse_filter("tcp and udp").unwrap();
        assert_eq!(
            expr,
            FilterExpr::and(FilterExpr::present("tcp"), FilterExpr::present("udp"))
        );

        let expr = parse_filter("tcp || udp").unwrap();
        assert_eq!(
            expr,
            FilterExpr::or(FilterExpr::present("tcp"), FilterExpr::present("udp"))
        );

        let expr = parse_filter("tcp&&udp").unwrap();
        assert!(matches!(expr, FilterExpr::And(_, _)));
    }

    #[test]
    fn test_parse_not() {
        let expr = parse_filter("not tcp").unwrap();
        assert_eq!(expr, FilterExpr::negate(FilterExpr::present("tcp")));

        let expr = parse_filter("!tcp.flags.rst").unwrap();
        assert_eq!(expr, FilterExpr::negate(FilterExpr::present("tcp.flags.rst")));

        // A field starting with a keyword is still a field
        let expr = parse_filter("notify").unwrap();
        assert_eq!(expr, FilterExpr::present("notify"));
    }

    #[test]
    fn test_parse_precedence() {
        // a or b and c => a or (b and c)
        let expr = parse_filter("udp or tcp and http").unwrap();
        assert_eq!(
            expr,
            FilterExpr::or(
                FilterExpr::present("udp"),
                FilterExpr::and(FilterExpr::present("tcp"), FilterExpr::present("http"))
            )
        );

        let expr = parse_filter("(udp or tcp) and http").unwrap();
        assert!(matches!(expr, FilterExpr::And(_, _)));
    }

    #[test]
    fn test_parse_case_insensitive_keywords() {
        let expr = parse_filter("NOT tcp AND udp").unwrap();
        assert_eq!(
            expr,
            FilterExpr::and(
                FilterExpr::negate(FilterExpr::present("tcp")),
                FilterExpr::present("udp")
            )
        );
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(parse_filter(""), Err(FilterError::EmptyFilter));
        assert_eq!(parse_filter("   "), Err(FilterError::EmptyFilter));
    }

    #[test]
    fn test_parse_nesting_limit() {
        let nested = format!("{}tcp{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(parse_filter(&nested).is_ok());

        let deep = format!("{}tcp", "!".repeat(200_000));
        assert_eq!(parse_filter(&deep), Err(FilterError::TooDeep { limit: MAX_NESTING }));

        let deep = format!("{}tcp{}", "(".repeat(10_000), ")".repeat(10_000));
        assert_eq!(parse_filter(&deep), Err(FilterError::TooDeep { limit: MAX_NESTING }));

        let deep = format!("udp or {}tcp", "not ".repeat(MAX_NESTING + 1));
        assert_eq!(parse_filter(&deep), Err(FilterError::TooDeep { limit: MAX_NESTING }));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_filter("tcp ==").is_err());
        assert!(parse_filter("tcp and").is_err());
        assert!(parse_filter("(tcp").is_err());
        assert!(parse_filter("== 80").is_err());
        assert!(parse_filter("ipv4.src == 10.0.0.1").is_err());
        assert!(parse_filter("invalid @#$ filter").is_err());
    }
}
