//! Boolean predicate language over resource nodes.
//!
//! A constraint is a JSON object with exactly one key: `properties`,
//! `hostlist`, `ranks`, or one of the combinators `and`/`or`/`not`.
//! The spec compiles once into a [`Constraint`] and is then matched per
//! rnode; matchers are pure and re-entrant.

use rgrid_core::{Hostlist, IdSet};
use serde_json::Value;

use crate::error::RsetError;
use crate::rnode::Rnode;

/// Characters rejected in property queries. `^` stays legal as the leading
/// negation shorthand.
const RESERVED_QUERY_CHARS: &[char] = &['!', '&', '\'', '"', '`', '|', '(', ')'];

/// Compiled constraint predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// Matches every node (the empty object).
    Empty,
    /// Every listed property must match; `^` negates, and an entry also
    /// matches the node hostname.
    Properties(Vec<String>),
    /// Node hostname must appear in one of the hostlists.
    Hosts(Hostlist),
    /// Node rank must appear in one of the idsets.
    Ranks(IdSet),
    And(Vec<Constraint>),
    Or(Vec<Constraint>),
    Not(Vec<Constraint>),
}

impl Constraint {
    /// Compile an RFC 31-style JSON spec.
    pub fn parse(spec: &Value) -> Result<Constraint, RsetError> {
        let obj = spec
            .as_object()
            .ok_or_else(|| RsetError::InvalidArgument("constraint must be a JSON object".into()))?;
        if obj.len() > 1 {
            return Err(RsetError::InvalidArgument(
                "constraint must only contain 1 element".into(),
            ));
        }
        let Some((op, values)) = obj.iter().next() else {
            return Ok(Constraint::Empty);
        };
        match op.as_str() {
            "properties" => parse_properties(values),
            "hostlist" => parse_hostlist(values),
            "ranks" => parse_ranks(values),
            "and" | "or" | "not" => {
                let arr = values.as_array().ok_or_else(|| {
                    RsetError::InvalidArgument(format!("{op} operator value must be an array"))
                })?;
                let sub = arr
                    .iter()
                    .map(Constraint::parse)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(match op.as_str() {
                    "and" => Constraint::And(sub),
                    "or" => Constraint::Or(sub),
                    _ => Constraint::Not(sub),
                })
            }
            other => Err(RsetError::InvalidArgument(format!(
                "unknown constraint operator: {other}"
            ))),
        }
    }

    /// Compile from a JSON string.
    pub fn parse_str(spec: &str) -> Result<Constraint, RsetError> {
        let v: Value = serde_json::from_str(spec)
            .map_err(|e| RsetError::InvalidArgument(e.to_string()))?;
        Constraint::parse(&v)
    }

    /// Match one resource node.
    pub fn matches(&self, n: &Rnode) -> bool {
        match self {
            Constraint::Empty => true,
            Constraint::Properties(props) => props.iter().all(|p| property_matches(n, p)),
            Constraint::Hosts(hl) => n
                .hostname
                .as_deref()
                .is_some_and(|h| hl.find(h).is_some()),
            Constraint::Ranks(ids) => ids.test(n.rank),
            Constraint::And(sub) => sub.iter().all(|c| c.matches(n)),
            // `or` over an empty list matches everything
            Constraint::Or(sub) => sub.is_empty() || sub.iter().any(|c| c.matches(n)),
            Constraint::Not(sub) => !sub.iter().all(|c| c.matches(n)),
        }
    }
}

/// A property entry matches when the node has the property or the entry
/// equals the node hostname; a leading `^` flips the result.
fn property_matches(n: &Rnode, prop: &str) -> bool {
    let (negate, name) = match prop.strip_prefix('^') {
        Some(rest) => (true, rest),
        None => (false, prop),
    };
    let hit = n.has_property(name) || n.hostname.as_deref() == Some(name);
    negate != hit
}

fn parse_properties(values: &Value) -> Result<Constraint, RsetError> {
    let arr = values
        .as_array()
        .ok_or_else(|| RsetError::InvalidArgument("properties value must be an array".into()))?;
    let mut props = Vec::with_capacity(arr.len());
    for entry in arr {
        let s = entry
            .as_str()
            .ok_or_else(|| RsetError::InvalidArgument("non-string property specified".into()))?;
        if let Some(c) = s.chars().find(|c| RESERVED_QUERY_CHARS.contains(c)) {
            return Err(RsetError::InvalidArgument(format!(
                "invalid character '{c}' in property \"{s}\""
            )));
        }
        props.push(s.to_string());
    }
    Ok(Constraint::Properties(props))
}

fn parse_hostlist(values: &Value) -> Result<Constraint, RsetError> {
    let arr = values
        .as_array()
        .ok_or_else(|| RsetError::InvalidArgument("hostlist value must be an array".into()))?;
    let mut hl = Hostlist::new();
    for entry in arr {
        let s = entry
            .as_str()
            .ok_or_else(|| RsetError::InvalidArgument("non-string hostlist specified".into()))?;
        hl.append(s)
            .map_err(|e| RsetError::InvalidArgument(e.to_string()))?;
    }
    Ok(Constraint::Hosts(hl))
}

fn parse_ranks(values: &Value) -> Result<Constraint, RsetError> {
    let arr = values
        .as_array()
        .ok_or_else(|| RsetError::InvalidArgument("ranks value must be an array".into()))?;
    let mut ids = IdSet::new();
    for entry in arr {
        let s = entry
            .as_str()
            .ok_or_else(|| RsetError::InvalidArgument("non-string idset specified".into()))?;
        let set =
            IdSet::decode(s).map_err(|e| RsetError::InvalidArgument(format!("invalid idset: {e}")))?;
        ids.add(&set).expect("autogrow");
    }
    Ok(Constraint::Ranks(ids))
}
