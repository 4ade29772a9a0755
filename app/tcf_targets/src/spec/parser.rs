/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Parsing target selection expressions.
//!
//! The grammar, lowest precedence first:
//!
//! ```text
//! EXPR ::= EXPR 'or' EXPR
//!        | EXPR 'and' EXPR
//!        | 'not' EXPR
//!        | '(' EXPR ')'
//!        | SYMBOL ('==' | '!=') CONST
//!        | SYMBOL ('<' | '>' | '<=' | '>=') NUMBER
//!        | SYMBOL 'in' LIST
//!        | SYMBOL 'in' SYMBOL
//!        | CONST 'in' SYMBOL
//!        | SYMBOL ':' STRING
//!        | SYMBOL
//!
//! LIST   ::= '[' CONST ( ',' CONST ) * ']'
//! CONST  ::= STRING | NUMBER
//! NUMBER ::= '0x' "0-9a-fA-F" + | "0-9" +
//! STRING ::= '"' ... '"' | '\'' ... '\''
//! SYMBOL ::= "A-Za-z_" "-/.0-9A-Za-z_" *      (except and, or, not, in)
//! ```
//!
//! String contents are kept verbatim, backslash escapes included, so regex
//! patterns don't need double escaping.

use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::bytes::complete::take_while;
use nom::bytes::complete::take_while1;
use nom::character::complete::anychar;
use nom::character::complete::char;
use nom::character::complete::multispace0;
use nom::character::complete::none_of;
use nom::character::complete::satisfy;
use nom::combinator::all_consuming;
use nom::combinator::cut;
use nom::combinator::map;
use nom::combinator::map_res;
use nom::combinator::not;
use nom::combinator::opt;
use nom::combinator::recognize;
use nom::combinator::value;
use nom::combinator::verify;
use nom::error::ContextError;
use nom::error::FromExternalError;
use nom::error::ParseError;
use nom::error::VerboseError;
use nom::error::context;
use nom::error::convert_error;
use nom::multi::many0;
use nom::multi::separated_list1;
use nom::sequence::delimited;
use nom::sequence::pair;
use nom::sequence::preceded;
use nom::sequence::terminated;

type NomResult<'a, O, E> = IResult<&'a str, O, E>;

// Type alias.
trait NomParseError<'a>:
    ParseError<&'a str>
    + ContextError<&'a str>
    + FromExternalError<&'a str, std::num::ParseIntError>
    + 'a
{
}

impl<'a, E> NomParseError<'a> for E where
    E: ParseError<&'a str>
        + ContextError<&'a str>
        + FromExternalError<&'a str, std::num::ParseIntError>
        + 'a
{
}

const RESERVED: &[&str] = &["and", "or", "not", "in"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Const {
    Str(String),
    Int(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Symbol(String),
    Const(Const),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare {
        symbol: String,
        op: CompareOp,
        value: Const,
    },
    InList {
        symbol: String,
        list: Vec<Const>,
    },
    /// `needle in haystack`, where the haystack is a field holding a list,
    /// an object or a string.
    Contains {
        needle: Operand,
        haystack: String,
    },
    Match {
        symbol: String,
        pattern: String,
    },
    Exists(String),
}

impl Expr {
    /// Visits every regex pattern in the tree.
    pub(crate) fn patterns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Or(l, r) | Expr::And(l, r) => {
                l.patterns(out);
                r.patterns(out);
            }
            Expr::Not(e) => e.patterns(out),
            Expr::Match { pattern, .. } => out.push(pattern),
            Expr::Compare { .. }
            | Expr::InList { .. }
            | Expr::Contains { .. }
            | Expr::Exists(_) => {}
        }
    }
}

/// Parses a whole expression; on error returns a printable description of
/// where parsing failed.
pub(crate) fn parse_expr(input: &str) -> Result<Expr, String> {
    // Parse with fast error (`()`) first,
    // and on error reparse again with `VerboseError` to get detailed errors.
    match all_consuming(ws(expr_or::<()>))(input) {
        Ok((_, expr)) => Ok(expr),
        Err(_) => match all_consuming(ws(expr_or::<VerboseError<&str>>))(input) {
            Ok((_, expr)) => Ok(expr),
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(convert_error(input, e)),
            Err(nom::Err::Incomplete(..)) => Err("Unexpected end of expression".to_owned()),
        },
    }
}

fn ws<'a, O, E: NomParseError<'a>, F>(inner: F) -> impl FnMut(&'a str) -> NomResult<'a, O, E>
where
    F: FnMut(&'a str) -> NomResult<'a, O, E>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_symbol_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_symbol_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '/' | '.' | '_')
}

/// A reserved word, not followed by anything that would make it a symbol.
fn keyword<'a, E: NomParseError<'a>>(
    kw: &'static str,
) -> impl FnMut(&'a str) -> NomResult<'a, &'a str, E> {
    terminated(tag(kw), not(satisfy(is_symbol_char)))
}

fn expr_or<'a, E: NomParseError<'a>>(input: &'a str) -> NomResult<'a, Expr, E> {
    let (input, first) = expr_and(input)?;
    let (input, rest) = many0(preceded(ws(keyword("or")), cut(expr_and)))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, e| Expr::Or(Box::new(acc), Box::new(e))),
    ))
}

fn expr_and<'a, E: NomParseError<'a>>(input: &'a str) -> NomResult<'a, Expr, E> {
    let (input, first) = expr_not(input)?;
    let (input, rest) = many0(preceded(ws(keyword("and")), cut(expr_not)))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, e| Expr::And(Box::new(acc), Box::new(e))),
    ))
}

fn expr_not<'a, E: NomParseError<'a>>(input: &'a str) -> NomResult<'a, Expr, E> {
    alt((
        map(preceded(ws(keyword("not")), cut(expr_not)), |e| {
            Expr::Not(Box::new(e))
        }),
        expr_primary,
    ))(input)
}

fn expr_primary<'a, E: NomParseError<'a>>(input: &'a str) -> NomResult<'a, Expr, E> {
    context(
        "expression",
        alt((
            preceded(
                ws(char('(')),
                cut(terminated(expr_or, ws(char(')')))),
            ),
            const_in_symbol,
            symbol_predicate,
        )),
    )(input)
}

/// `CONST in SYMBOL`
fn const_in_symbol<'a, E: NomParseError<'a>>(input: &'a str) -> NomResult<'a, Expr, E> {
    let (input, needle) = ws(constant)(input)?;
    let (input, haystack) = cut(preceded(ws(keyword("in")), ws(symbol)))(input)?;
    Ok((
        input,
        Expr::Contains {
            needle: Operand::Const(needle),
            haystack: haystack.to_owned(),
        },
    ))
}

enum Tail {
    Compare(CompareOp, Const),
    InList(Vec<Const>),
    InSymbol(String),
    Match(String),
}

/// Everything that starts with a symbol.
fn symbol_predicate<'a, E: NomParseError<'a>>(input: &'a str) -> NomResult<'a, Expr, E> {
    let (input, name) = ws(symbol)(input)?;
    let (input, tail) = opt(alt((
        map(pair(ws(equality_op), cut(ws(constant))), |(op, c)| {
            Tail::Compare(op, c)
        }),
        map(pair(ws(ordering_op), cut(ws(number))), |(op, n)| {
            Tail::Compare(op, Const::Int(n))
        }),
        preceded(
            ws(keyword("in")),
            cut(alt((
                map(ws(list), Tail::InList),
                map(ws(symbol), |s| Tail::InSymbol(s.to_owned())),
            ))),
        ),
        map(preceded(ws(char(':')), cut(ws(string))), Tail::Match),
    )))(input)?;

    let symbol = name.to_owned();
    let expr = match tail {
        None => Expr::Exists(symbol),
        Some(Tail::Compare(op, value)) => Expr::Compare { symbol, op, value },
        Some(Tail::InList(list)) => Expr::InList { symbol, list },
        Some(Tail::InSymbol(haystack)) => Expr::Contains {
            needle: Operand::Symbol(symbol),
            haystack,
        },
        Some(Tail::Match(pattern)) => Expr::Match { symbol, pattern },
    };
    Ok((input, expr))
}

fn equality_op<'a, E: NomParseError<'a>>(input: &'a str) -> NomResult<'a, CompareOp, E> {
    alt((
        value(CompareOp::Eq, tag("==")),
        value(CompareOp::Ne, tag("!=")),
    ))(input)
}

fn ordering_op<'a, E: NomParseError<'a>>(input: &'a str) -> NomResult<'a, CompareOp, E> {
    // Two character operators first.
    alt((
        value(CompareOp::Le, tag("<=")),
        value(CompareOp::Ge, tag(">=")),
        value(CompareOp::Lt, tag("<")),
        value(CompareOp::Gt, tag(">")),
    ))(input)
}

fn symbol<'a, E: NomParseError<'a>>(input: &'a str) -> NomResult<'a, &'a str, E> {
    context(
        "symbol",
        verify(
            recognize(pair(satisfy(is_symbol_start), take_while(is_symbol_char))),
            |s: &str| !RESERVED.contains(&s),
        ),
    )(input)
}

fn list<'a, E: NomParseError<'a>>(input: &'a str) -> NomResult<'a, Vec<Const>, E> {
    context(
        "list",
        preceded(
            char('['),
            cut(terminated(
                separated_list1(char(','), ws(constant)),
                char(']'),
            )),
        ),
    )(input)
}

fn constant<'a, E: NomParseError<'a>>(input: &'a str) -> NomResult<'a, Const, E> {
    alt((map(string, Const::Str), map(number, Const::Int)))(input)
}

fn number<'a, E: NomParseError<'a>>(input: &'a str) -> NomResult<'a, i64, E> {
    context(
        "number",
        alt((
            map_res(
                preceded(
                    tag("0x"),
                    cut(take_while1(|c: char| c.is_ascii_hexdigit())),
                ),
                |digits: &str| i64::from_str_radix(digits, 16),
            ),
            map_res(
                terminated(
                    take_while1(|c: char| c.is_ascii_digit()),
                    not(satisfy(is_symbol_char)),
                ),
                |digits: &str| digits.parse::<i64>(),
            ),
        )),
    )(input)
}

fn string<'a, E: NomParseError<'a>>(input: &'a str) -> NomResult<'a, String, E> {
    fn quoted<'a, E: NomParseError<'a>>(
        quote: char,
        forbidden: &'static str,
    ) -> impl FnMut(&'a str) -> NomResult<'a, &'a str, E> {
        preceded(
            char(quote),
            cut(terminated(
                recognize(many0(alt((
                    recognize(pair(char('\\'), anychar)),
                    recognize(none_of(forbidden)),
                )))),
                char(quote),
            )),
        )
    }

    context(
        "string",
        map(alt((quoted('"', "\\\"\n"), quoted('\'', "\\'\n"))), |s| {
            s.to_owned()
        }),
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> String {
        s.to_owned()
    }

    #[test]
    fn test_precedence() {
        // not > and > or
        assert_eq!(
            Ok(Expr::Or(
                Box::new(Expr::Exists(sym("a"))),
                Box::new(Expr::And(
                    Box::new(Expr::Not(Box::new(Expr::Exists(sym("b"))))),
                    Box::new(Expr::Exists(sym("c"))),
                )),
            )),
            parse_expr("a or not b and c")
        );
        assert_eq!(
            Ok(Expr::And(
                Box::new(Expr::Or(
                    Box::new(Expr::Exists(sym("a"))),
                    Box::new(Expr::Exists(sym("b"))),
                )),
                Box::new(Expr::Exists(sym("c"))),
            )),
            parse_expr("(a or b) and c")
        );
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(
            Ok(Expr::Compare {
                symbol: sym("bsp_model"),
                op: CompareOp::Eq,
                value: Const::Str(sym("arc")),
            }),
            parse_expr(" bsp_model == 'arc' ")
        );
        assert_eq!(
            Ok(Expr::Compare {
                symbol: sym("N5"),
                op: CompareOp::Le,
                value: Const::Int(256),
            }),
            parse_expr("N5<=0x100")
        );
        assert_eq!(
            Ok(Expr::InList {
                symbol: sym("A.there"),
                list: vec![Const::Int(1), Const::Str(sym("2")), Const::Int(3)],
            }),
            parse_expr("A.there in [ 1, \"2\", 3 ]")
        );
        assert_eq!(
            Ok(Expr::Contains {
                needle: Operand::Const(Const::Str(sym("string1"))),
                haystack: sym("list_of_things"),
            }),
            parse_expr("'string1' in list_of_things")
        );
        assert_eq!(
            Ok(Expr::Contains {
                needle: Operand::Symbol(sym("interconnects.nwa")),
                haystack: sym("value_dict"),
            }),
            parse_expr("interconnects.nwa in value_dict")
        );
        assert_eq!(
            Ok(Expr::Match {
                symbol: sym("type"),
                pattern: sym("^qemu-\\w+$"),
            }),
            parse_expr("type : '^qemu-\\w+$'")
        );
    }

    #[test]
    fn test_keywords_inside_symbols() {
        assert_eq!(Ok(Expr::Exists(sym("nothing"))), parse_expr("nothing"));
        assert_eq!(
            Ok(Expr::And(
                Box::new(Expr::Exists(sym("android"))),
                Box::new(Expr::Exists(sym("order"))),
            )),
            parse_expr("android and order")
        );
    }

    #[test]
    fn test_malformed() {
        for text in [
            "",
            "a ==",
            "a == b",
            "a < 'x'",
            "(a",
            "a and",
            "a in [",
            "a in []",
            "'x' == a",
            "1abc",
            "a b",
            "type : \"unterminated",
            "and",
        ] {
            assert!(parse_expr(text).is_err(), "`{}` should not parse", text);
        }
    }
}
