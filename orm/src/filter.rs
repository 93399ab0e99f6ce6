use crate::error::Result;
use crate::value::EntityValue;

use anyhow::anyhow;

/// A scalar comparison inside an operator bag. Bags emit in declaration
/// order, joined with AND.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Eq(EntityValue),
    Ne(EntityValue),
    In(Vec<EntityValue>),
    Nin(Vec<EntityValue>),
    Like(String),
    Gt(EntityValue),
    Gte(EntityValue),
    Lt(EntityValue),
    Lte(EntityValue),
}

impl FilterOp {
    pub fn sql_operator(&self) -> &'static str {
        match self {
            Self::Eq(_) => "=",
            Self::Ne(_) => "!=",
            Self::In(_) => "IN",
            Self::Nin(_) => "NOT IN",
            Self::Like(_) => "LIKE",
            Self::Gt(_) => ">",
            Self::Gte(_) => ">=",
            Self::Lt(_) => "<",
            Self::Lte(_) => "<=",
        }
    }
}

/// What a filter key maps to.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Plain equality; null values turn into IS NULL.
    Value(EntityValue),
    /// A bare array is an IN list.
    List(Vec<EntityValue>),
    /// An operator bag, e.g. `{$gt: 1, $lt: 5}`.
    Ops(Vec<FilterOp>),
    /// A nested filter under a relation-valued key.
    Related(Filter),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Field { name: String, condition: Condition },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    /// Correlated EXISTS per (relation, inner filter) pair.
    Exists(Vec<(String, Filter)>),
    NotExists(Vec<(String, Filter)>),
}

/// A declarative filter tree; the public query input. Keys are property
/// names, relation names, or `$` operator sentinels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub(crate) nodes: Vec<FilterNode>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn field(mut self, name: impl Into<String>, condition: Condition) -> Self {
        self.nodes.push(FilterNode::Field {
            name: name.into(),
            condition,
        });
        self
    }

    pub fn where_eq(name: impl Into<String>, value: impl Into<EntityValue>) -> Self {
        Self::new().field(name, Condition::Value(value.into()))
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Self {
            nodes: vec![FilterNode::And(filters)],
        }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Self {
            nodes: vec![FilterNode::Or(filters)],
        }
    }

    pub fn exists(relation: impl Into<String>, inner: Filter) -> Self {
        Self {
            nodes: vec![FilterNode::Exists(vec![(relation.into(), inner)])],
        }
    }

    pub fn not_exists(relation: impl Into<String>, inner: Filter) -> Self {
        Self {
            nodes: vec![FilterNode::NotExists(vec![(relation.into(), inner)])],
        }
    }

    pub fn related(mut self, name: impl Into<String>, inner: Filter) -> Self {
        self.nodes.push(FilterNode::Field {
            name: name.into(),
            condition: Condition::Related(inner),
        });
        self
    }

    /// Parses the public record format, e.g.
    /// `{"email": "a@b", "age": {"$gt": 21}, "$or": [...]}`.
    pub fn from_json(json: &serde_json::Value) -> Result<Filter> {
        let fields = json
            .as_object()
            .ok_or_else(|| anyhow!("filter must be a JSON object, got {json}"))?;

        let mut nodes = vec![];
        for (key, value) in fields {
            match key.as_str() {
                "$and" => nodes.push(FilterNode::And(parse_group(value)?)),
                "$or" => nodes.push(FilterNode::Or(parse_group(value)?)),
                "$exists" => nodes.push(FilterNode::Exists(parse_relation_map(value)?)),
                "$nexists" => nodes.push(FilterNode::NotExists(parse_relation_map(value)?)),
                _ => nodes.push(parse_field(key, value)?),
            }
        }
        Ok(Filter { nodes })
    }
}

fn parse_group(value: &serde_json::Value) -> Result<Vec<Filter>> {
    let items = value
        .as_array()
        .ok_or_else(|| anyhow!("logical operator expects an array of filters"))?;
    items.iter().map(Filter::from_json).collect()
}

fn parse_relation_map(value: &serde_json::Value) -> Result<Vec<(String, Filter)>> {
    let fields = value
        .as_object()
        .ok_or_else(|| anyhow!("$exists expects an object keyed by relation names"))?;
    fields
        .iter()
        .map(|(rel, inner)| Ok((rel.clone(), Filter::from_json(inner)?)))
        .collect()
}

fn parse_field(key: &str, value: &serde_json::Value) -> Result<FilterNode> {
    let condition = match value {
        serde_json::Value::Array(items) => {
            Condition::List(items.iter().map(EntityValue::from_json).collect())
        }
        serde_json::Value::Object(fields)
            if !fields.is_empty() && fields.keys().all(|k| k.starts_with('$')) =>
        {
            // `{rel: {$exists: {...}}}` is sugar for `{$exists: {rel: {...}}}`.
            if let Some(inner) = fields.get("$exists") {
                return Ok(FilterNode::Exists(vec![(
                    key.to_string(),
                    Filter::from_json(inner)?,
                )]));
            }
            if let Some(inner) = fields.get("$nexists") {
                return Ok(FilterNode::NotExists(vec![(
                    key.to_string(),
                    Filter::from_json(inner)?,
                )]));
            }
            let mut ops = vec![];
            for (op, arg) in fields {
                ops.push(parse_operator(op, arg)?);
            }
            Condition::Ops(ops)
        }
        serde_json::Value::Object(_) => Condition::Related(Filter::from_json(value)?),
        scalar => Condition::Value(EntityValue::from_json(scalar)),
    };
    Ok(FilterNode::Field {
        name: key.to_string(),
        condition,
    })
}

fn parse_operator(op: &str, arg: &serde_json::Value) -> Result<FilterOp> {
    let scalar = || EntityValue::from_json(arg);
    let list = || -> Result<Vec<EntityValue>> {
        arg.as_array()
            .map(|items| items.iter().map(EntityValue::from_json).collect())
            .ok_or_else(|| anyhow!("`{op}` expects an array").into())
    };
    let parsed = match op {
        "$eq" => FilterOp::Eq(scalar()),
        "$ne" => FilterOp::Ne(scalar()),
        "$in" => FilterOp::In(list()?),
        "$nin" => FilterOp::Nin(list()?),
        "$like" => FilterOp::Like(
            arg.as_str()
                .ok_or_else(|| anyhow!("`$like` expects a string pattern"))?
                .to_string(),
        ),
        "$gt" => FilterOp::Gt(scalar()),
        "$gte" => FilterOp::Gte(scalar()),
        "$lt" => FilterOp::Lt(scalar()),
        "$lte" => FilterOp::Lte(scalar()),
        other => return Err(anyhow!("unknown filter operator `{other}`").into()),
    };
    Ok(parsed)
}
