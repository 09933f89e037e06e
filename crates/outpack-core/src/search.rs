//! Query evaluation over the index.
//!
//! Every node evaluates to a set of packet ids drawn from the candidate
//! universe. Comparisons against a missing value are false rather than an
//! error, and negation is the complement within the universe, so
//! `!(parameter:x == 1)` also matches packets that have no `x` at all.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use outpack_domain::{
    BooleanOperator, Literal, Lookup, MetadataCore, Operand, OutpackError, ParameterValue,
    Parameters, Query, QueryNode, TestOperator,
};
use tracing::debug;

use crate::location::pull_metadata;
use crate::root::Root;

/// Which packets a search may consider.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchOptions {
    /// Restrict candidates to packets known at these locations.
    pub location: Option<Vec<String>>,
    /// Include packets that are known but not unpacked locally.
    pub allow_remote: bool,
    /// Refresh metadata from the selected locations first.
    pub pull_metadata: bool,
}

pub fn search(
    root: &Root,
    query: &str,
    options: &SearchOptions,
    this: Option<&Parameters>,
) -> Result<BTreeSet<String>> {
    let query = Query::parse(query)?;
    search_query(root, &query, options, this)
}

/// Resolve `query` to exactly one packet id.
pub fn search_unique(
    root: &Root,
    query: &str,
    options: &SearchOptions,
    this: Option<&Parameters>,
) -> Result<String> {
    let query = Query::parse(query)?;
    if !query.is_single_valued() {
        return Err(OutpackError::NotSingleValued(query.text.clone()).into());
    }
    let found = search_query(root, &query, options, this)?;
    let mut ids = found.into_iter();
    match (ids.next(), ids.next()) {
        (Some(id), None) => Ok(id),
        (None, _) => Err(OutpackError::NoMatch(query.text.clone()).into()),
        (Some(_), Some(_)) => Err(OutpackError::AmbiguousResult {
            query: query.text.clone(),
            count: ids.count() + 2,
        }
        .into()),
    }
}

fn search_query(
    root: &Root,
    query: &Query,
    options: &SearchOptions,
    this: Option<&Parameters>,
) -> Result<BTreeSet<String>> {
    if options.pull_metadata {
        pull_metadata(root, options.location.as_deref())?;
    }
    let locations = match &options.location {
        Some(names) => {
            for name in names {
                if root.config().location(name).is_none() {
                    return Err(OutpackError::UnknownLocation(name.clone()).into());
                }
            }
            names.clone()
        }
        None => root.config().location_names(),
    };

    let data = root.index().snapshot()?;
    let unpacked = data.unpacked();
    let universe: BTreeSet<String> = locations
        .iter()
        .filter_map(|name| data.location.get(name))
        .flat_map(|records| records.keys())
        .filter(|id| options.allow_remote || unpacked.contains(*id))
        .filter(|id| data.metadata.contains_key(*id))
        .cloned()
        .collect();

    let evaluator = Evaluator {
        query: &query.text,
        universe: &universe,
        metadata: &data.metadata,
        this,
    };
    let found = evaluator.eval(&query.node)?;
    debug!(query = %query.text, candidates = universe.len(), found = found.len(), "evaluated query");
    Ok(found)
}

struct Evaluator<'a> {
    query: &'a str,
    universe: &'a BTreeSet<String>,
    metadata: &'a BTreeMap<String, Arc<MetadataCore>>,
    this: Option<&'a Parameters>,
}

#[derive(Clone, Debug, PartialEq)]
enum Value<'a> {
    Str(&'a str),
    Num(f64),
    Bool(bool),
}

impl<'a> Value<'a> {
    fn from_literal(literal: &'a Literal) -> Self {
        match literal {
            Literal::String(value) => Self::Str(value),
            Literal::Number(value) => Self::Num(*value),
            Literal::Bool(value) => Self::Bool(*value),
        }
    }

    fn from_parameter(value: &'a ParameterValue) -> Self {
        match value {
            ParameterValue::Bool(value) => Self::Bool(*value),
            ParameterValue::String(value) => Self::Str(value),
            ParameterValue::Integer(value) => Self::Num(*value as f64),
            ParameterValue::Float(value) => Self::Num(*value),
        }
    }
}

impl<'a> Evaluator<'a> {
    fn eval(&self, node: &QueryNode) -> Result<BTreeSet<String>> {
        match node {
            QueryNode::Latest(inner) => {
                let ids = match inner {
                    Some(inner) => self.eval(inner)?,
                    None => self.universe.clone(),
                };
                Ok(ids.into_iter().next_back().into_iter().collect())
            }
            QueryNode::Single(inner) => {
                let ids = self.eval(inner)?;
                if ids.len() == 1 {
                    Ok(ids)
                } else {
                    Err(OutpackError::AmbiguousResult {
                        query: self.query.to_string(),
                        count: ids.len(),
                    }
                    .into())
                }
            }
            QueryNode::Test { op, lhs, rhs } => {
                let mut ids = BTreeSet::new();
                for id in self.universe {
                    let Some(meta) = self.metadata.get(id) else {
                        continue;
                    };
                    let left = self.resolve(lhs, meta)?;
                    let right = self.resolve(rhs, meta)?;
                    if let (Some(left), Some(right)) = (left, right) {
                        if compare(*op, &left, &right) {
                            ids.insert(id.clone());
                        }
                    }
                }
                Ok(ids)
            }
            QueryNode::Boolean { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                Ok(match op {
                    BooleanOperator::And => lhs.intersection(&rhs).cloned().collect(),
                    BooleanOperator::Or => lhs.union(&rhs).cloned().collect(),
                })
            }
            QueryNode::Negation(inner) => {
                let excluded = self.eval(inner)?;
                Ok(self.universe.difference(&excluded).cloned().collect())
            }
            QueryNode::Brackets(inner) => self.eval(inner),
        }
    }

    fn resolve<'m>(&'m self, operand: &'m Operand, meta: &'m MetadataCore) -> Result<Option<Value<'m>>> {
        let lookup = match operand {
            Operand::Literal(literal) => return Ok(Some(Value::from_literal(literal))),
            Operand::Lookup(lookup) => lookup,
        };
        Ok(match lookup {
            Lookup::Id => Some(Value::Str(&meta.id)),
            Lookup::Name => Some(Value::Str(&meta.name)),
            Lookup::Parameter(name) => meta.parameters.get(name).map(Value::from_parameter),
            Lookup::This(name) => {
                let this = self.this.ok_or_else(|| OutpackError::InvalidQuery {
                    query: self.query.to_string(),
                    reason: format!("'this:{name}' can only be used while running a packet"),
                })?;
                let value = this.get(name).ok_or_else(|| OutpackError::InvalidQuery {
                    query: self.query.to_string(),
                    reason: format!("'this:{name}' is not a parameter of the running packet"),
                })?;
                Some(Value::from_parameter(value))
            }
            Lookup::Environment(name) => {
                return Err(OutpackError::NotImplemented(format!(
                    "environment lookups ('environment:{name}')"
                ))
                .into())
            }
        })
    }
}

fn compare(op: TestOperator, lhs: &Value<'_>, rhs: &Value<'_>) -> bool {
    if op.is_ordering() {
        let (Value::Num(lhs), Value::Num(rhs)) = (lhs, rhs) else {
            return false;
        };
        return match op {
            TestOperator::Lt => lhs < rhs,
            TestOperator::Le => lhs <= rhs,
            TestOperator::Gt => lhs > rhs,
            TestOperator::Ge => lhs >= rhs,
            TestOperator::Eq | TestOperator::Ne => false,
        };
    }
    match op {
        TestOperator::Eq => lhs == rhs,
        TestOperator::Ne => lhs != rhs,
        _ => false,
    }
}
