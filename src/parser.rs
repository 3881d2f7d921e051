//! Template markup parser using nom.
//!
//! # Syntax Overview
//!
//! ```text
//! SELECT [[distinct]]
//!   T.id AS trip_code,
//!   [[group:vesselType columns=vessel_type]]V.type AS vessel_type,[[/group]]
//!   [[anchor:afterVesselType]]
//!   T.comments
//! FROM trip T
//! WHERE T.program_fk = &programId
//! ```
//!
//! Anything that is not a directive or a `&name` placeholder is SQL text.
//! A lone `[` or an `&` not followed by an identifier stays text.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{is_not, tag, take_while},
    character::complete::{char, multispace1, satisfy},
    combinator::{map, not, recognize, value},
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded, terminated},
};

use crate::ast::{Group, Node, Template};
use crate::error::TemplateError;

/// Parse a template body read from `path`.
pub fn parse(path: &str, input: &str) -> Result<Template, TemplateError> {
    match parse_nodes(input) {
        Ok(("", nodes)) => Ok(Template {
            path: path.to_string(),
            nodes,
        }),
        Ok((remaining, _)) => Err(TemplateError::Syntax {
            path: path.to_string(),
            line: line_of(input, remaining),
            message: describe(remaining),
        }),
        Err(e) => Err(TemplateError::Syntax {
            path: path.to_string(),
            line: 1,
            message: format!("Parse failed: {:?}", e),
        }),
    }
}

/// Parse a sequence of nodes, merging adjacent text runs.
fn parse_nodes(input: &str) -> IResult<&str, Vec<Node>> {
    let (input, nodes) = many0(parse_node)(input)?;
    Ok((input, merge_text(nodes)))
}

fn parse_node(input: &str) -> IResult<&str, Node> {
    alt((
        parse_group,
        parse_anchor,
        value(Node::Distinct, tag("[[distinct]]")),
        parse_bind,
        parse_text,
    ))(input)
}

/// Parse `[[group:name attrs...]] body [[/group]]`.
fn parse_group(input: &str) -> IResult<&str, Node> {
    let (input, _) = tag("[[group:")(input)?;
    let (input, name) = parse_identifier(input)?;
    let (input, attrs) = many0(preceded(multispace1, parse_group_attr))(input)?;
    let (input, _) = tag("]]")(input)?;
    let (input, children) = parse_nodes(input)?;
    let (input, _) = tag("[[/group]]")(input)?;

    let mut group = Group {
        name: name.to_string(),
        enabled: true,
        columns: Vec::new(),
        children,
    };
    for attr in attrs {
        match attr {
            GroupAttr::Enabled(enabled) => group.enabled = enabled,
            GroupAttr::Columns(columns) => group.columns.extend(columns),
        }
    }

    Ok((input, Node::Group(group)))
}

#[derive(Debug, Clone)]
enum GroupAttr {
    Enabled(bool),
    Columns(Vec<String>),
}

fn parse_group_attr(input: &str) -> IResult<&str, GroupAttr> {
    alt((
        value(GroupAttr::Enabled(false), tag("off")),
        value(GroupAttr::Enabled(true), tag("on")),
        map(
            preceded(tag("columns="), separated_list1(char(','), parse_identifier)),
            |cols: Vec<&str>| GroupAttr::Columns(cols.into_iter().map(String::from).collect()),
        ),
    ))(input)
}

/// Parse `[[anchor:name]]`.
fn parse_anchor(input: &str) -> IResult<&str, Node> {
    map(
        delimited(tag("[[anchor:"), parse_identifier, tag("]]")),
        |name: &str| Node::Anchor(name.to_string()),
    )(input)
}

/// Parse `&name`.
fn parse_bind(input: &str) -> IResult<&str, Node> {
    map(preceded(char('&'), parse_identifier), |name: &str| {
        Node::Bind(name.to_string())
    })(input)
}

/// Parse plain SQL up to the next `[` or `&`, or a single `[`/`&` that
/// does not open a directive or placeholder.
fn parse_text(input: &str) -> IResult<&str, Node> {
    map(
        alt((
            is_not("[&"),
            recognize(terminated(char('['), not(char('[')))),
            recognize(terminated(char('&'), not(satisfy(is_ident_start)))),
        )),
        |s: &str| Node::Text(s.to_string()),
    )(input)
}

/// Parse an identifier (group, anchor or placeholder name).
fn parse_identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(satisfy(is_ident_start), take_while(is_ident_char)))(input)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn merge_text(nodes: Vec<Node>) -> Vec<Node> {
    let mut merged: Vec<Node> = Vec::with_capacity(nodes.len());
    for node in nodes {
        match (merged.last_mut(), node) {
            (Some(Node::Text(prev)), Node::Text(next)) => prev.push_str(&next),
            (_, node) => merged.push(node),
        }
    }
    merged
}

fn line_of(input: &str, remaining: &str) -> usize {
    let offset = input.len() - remaining.len();
    input[..offset].matches('\n').count() + 1
}

fn describe(remaining: &str) -> String {
    let directive: String = remaining
        .split("]]")
        .next()
        .unwrap_or(remaining)
        .chars()
        .take(40)
        .collect();
    if remaining.starts_with("[[/group]]") {
        "[[/group]] without a matching [[group:...]]".to_string()
    } else if remaining.starts_with("[[group:") {
        format!("Unterminated or malformed group '{}]]'", directive)
    } else {
        format!("Unknown directive '{}]]'", directive)
    }
}
