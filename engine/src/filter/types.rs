//! Filter expression tree accepted from the query layer.

use crate::error::{QueryError, QueryResult};
use serde_json::Value;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,  // eq, =
    Ne,  // ne, !=
    In,  // in
    Gt,  // gt, >
    Gte, // gte, >=
    Lt,  // lt, <
    Lte, // lte, <=
}

impl FromStr for Operator {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eq" | "=" => Ok(Operator::Eq),
            "ne" | "!=" => Ok(Operator::Ne),
            "in" => Ok(Operator::In),
            "gt" | ">" => Ok(Operator::Gt),
            "gte" | ">=" => Ok(Operator::Gte),
            "lt" | "<" => Ok(Operator::Lt),
            "lte" | "<=" => Ok(Operator::Lte),
            _ => Err(QueryError::InvalidFilter(format!("Unknown operator: {}", s))),
        }
    }
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::In => "in",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Compare {
        op: Operator,
        field: String,
        value: Value,
    },
    /// Keyword search over text fields; empty `fields` means all searchable fields.
    Search { keyword: String, fields: Vec<String> },
    /// Documents lacking `field`. Built internally; not part of the JSON shape.
    Missing { field: String },
}

impl FilterExpr {
    /// Parses the JSON filter shape. `null` and `{}` mean "no filter".
    pub fn from_json(value: &Value) -> QueryResult<Option<FilterExpr>> {
        let obj = match value {
            Value::Null => return Ok(None),
            Value::Object(obj) => obj,
            other => {
                return Err(QueryError::InvalidFilter(format!(
                    "Filter must be an object, got {}",
                    other
                )))
            }
        };

        let mut entries = obj.iter();
        let (key, body) = match (entries.next(), entries.next()) {
            (None, _) => return Ok(None),
            (Some(entry), None) => entry,
            (Some(_), Some(_)) => {
                return Err(QueryError::InvalidFilter(
                    "Filter node must have exactly one operator".to_string(),
                ))
            }
        };

        if key.eq_ignore_ascii_case("and") || key.eq_ignore_ascii_case("or") {
            let children = parse_children(key, body)?;
            return Ok(Some(if key.eq_ignore_ascii_case("and") {
                FilterExpr::And(children)
            } else {
                FilterExpr::Or(children)
            }));
        }

        if key.eq_ignore_ascii_case("search") {
            return parse_search(body).map(Some);
        }

        let op: Operator = key.parse()?;
        let leaf = body.as_object().ok_or_else(|| {
            QueryError::InvalidFilter(format!("Operator {} expects a {{field: value}} object", key))
        })?;
        if leaf.len() != 1 {
            return Err(QueryError::InvalidFilter(format!(
                "Operator {} expects exactly one field, got {}",
                key,
                leaf.len()
            )));
        }
        let (field, value) = leaf
            .iter()
            .next()
            .ok_or_else(|| QueryError::InvalidFilter("Empty leaf".to_string()))?;

        Ok(Some(FilterExpr::Compare {
            op,
            field: field.clone(),
            value: value.clone(),
        }))
    }

    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        FilterExpr::Compare {
            op: Operator::Eq,
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn ne(field: &str, value: impl Into<Value>) -> Self {
        FilterExpr::Compare {
            op: Operator::Ne,
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn missing(field: &str) -> Self {
        FilterExpr::Missing {
            field: field.to_string(),
        }
    }

    pub fn in_list<I, S>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FilterExpr::Compare {
            op: Operator::In,
            field: field.to_string(),
            value: Value::Array(values.into_iter().map(|v| Value::String(v.into())).collect()),
        }
    }

    /// ANDs two optional filters without nesting when one side is absent.
    pub fn and_optional(left: Option<FilterExpr>, right: FilterExpr) -> FilterExpr {
        match left {
            Some(left) => FilterExpr::And(vec![left, right]),
            None => right,
        }
    }
}

fn parse_children(key: &str, body: &Value) -> QueryResult<Vec<FilterExpr>> {
    let items = match body {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        _ => {
            return Err(QueryError::InvalidFilter(format!(
                "{} expects an array of filters",
                key
            )))
        }
    };
    let mut children = Vec::with_capacity(items.len());
    for item in items {
        if let Some(child) = FilterExpr::from_json(item)? {
            children.push(child);
        }
    }
    Ok(children)
}

fn parse_search(body: &Value) -> QueryResult<FilterExpr> {
    let keyword = body
        .get("keyword")
        .and_then(Value::as_str)
        .ok_or_else(|| QueryError::InvalidFilter("search requires a keyword".to_string()))?;
    let fields = match body.get("fields") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(single)) => vec![single.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|f| {
                f.as_str().map(str::to_string).ok_or_else(|| {
                    QueryError::InvalidFilter("search fields must be strings".to_string())
                })
            })
            .collect::<QueryResult<Vec<_>>>()?,
        Some(_) => {
            return Err(QueryError::InvalidFilter(
                "search fields must be a string or an array".to_string(),
            ))
        }
    };
    Ok(FilterExpr::Search {
        keyword: keyword.to_string(),
        fields,
    })
}
