//! The packet query language.
//!
//! ```text
//! latest(name == "data" && parameter:x > 1)
//! single(id == "20240101-120000-0000abcd")
//! !(parameter:x == this:x) || name != 'other'
//! ```

mod parse;

use std::fmt;

pub use parse::parse_query;

use crate::id::is_valid_id;

/// A parsed query together with the text it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub text: String,
    pub node: QueryNode,
}

impl Query {
    /// Parse query text. A bare packet id is shorthand for `id == "<id>"`.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let trimmed = text.trim();
        let node = if is_valid_id(trimmed) {
            QueryNode::Test {
                op: TestOperator::Eq,
                lhs: Operand::Lookup(Lookup::Id),
                rhs: Operand::Literal(Literal::String(trimmed.to_string())),
            }
        } else {
            parse_query(text)?
        };
        Ok(Self {
            text: text.to_string(),
            node,
        })
    }

    /// Whether the query can only ever select at most one packet, judged
    /// from its top-level form alone.
    #[must_use]
    pub fn is_single_valued(&self) -> bool {
        match &self.node {
            QueryNode::Latest(_) | QueryNode::Single(_) => true,
            QueryNode::Test {
                op: TestOperator::Eq,
                lhs,
                rhs,
            } => matches!(
                (lhs, rhs),
                (Operand::Lookup(Lookup::Id), Operand::Literal(_))
                    | (Operand::Literal(_), Operand::Lookup(Lookup::Id))
            ),
            _ => false,
        }
    }

    /// Whether any part of the query refers to `this:` parameters.
    #[must_use]
    pub fn uses_this(&self) -> bool {
        self.node.any_lookup(&|lookup| matches!(lookup, Lookup::This(_)))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueryNode {
    Latest(Option<Box<QueryNode>>),
    Single(Box<QueryNode>),
    Test {
        op: TestOperator,
        lhs: Operand,
        rhs: Operand,
    },
    Boolean {
        op: BooleanOperator,
        lhs: Box<QueryNode>,
        rhs: Box<QueryNode>,
    },
    Negation(Box<QueryNode>),
    Brackets(Box<QueryNode>),
}

impl QueryNode {
    fn any_lookup(&self, pred: &dyn Fn(&Lookup) -> bool) -> bool {
        let operand = |operand: &Operand| matches!(operand, Operand::Lookup(lookup) if pred(lookup));
        match self {
            Self::Latest(None) => false,
            Self::Latest(Some(inner))
            | Self::Single(inner)
            | Self::Negation(inner)
            | Self::Brackets(inner) => inner.any_lookup(pred),
            Self::Test { lhs, rhs, .. } => operand(lhs) || operand(rhs),
            Self::Boolean { lhs, rhs, .. } => lhs.any_lookup(pred) || rhs.any_lookup(pred),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestOperator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl TestOperator {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    #[must_use]
    pub fn is_ordering(self) -> bool {
        matches!(self, Self::Lt | Self::Le | Self::Gt | Self::Ge)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BooleanOperator {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Literal(Literal),
    Lookup(Lookup),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    String(String),
    Number(f64),
    Bool(bool),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    Id,
    Name,
    Parameter(String),
    This(String),
    Environment(String),
}
