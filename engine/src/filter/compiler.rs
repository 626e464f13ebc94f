use super::types::{FilterExpr, Operator};
use crate::error::{QueryError, QueryResult};
use crate::schema::{FieldDescriptor, FieldKind, IndexSchema};
use serde_json::{json, Map, Value};

/// Translates filter trees into native boolean/term/range/nested clauses for
/// one index.
pub struct FilterCompiler<'a> {
    schema: &'a IndexSchema,
    missing_alias: Option<&'a str>,
    analyzed_suffix: &'a str,
}

impl<'a> FilterCompiler<'a> {
    pub fn new(
        schema: &'a IndexSchema,
        missing_alias: Option<&'a str>,
        analyzed_suffix: &'a str,
    ) -> Self {
        Self {
            schema,
            missing_alias,
            analyzed_suffix,
        }
    }

    /// Compiles `expr` and ANDs `extra` in at the top level. `None` means no
    /// restriction; an empty boolean clause is never produced.
    pub fn compile(
        &self,
        expr: Option<&FilterExpr>,
        exclude_field: Option<&str>,
        filter_self: bool,
        extra: Option<&FilterExpr>,
    ) -> QueryResult<Option<Value>> {
        let user = match expr {
            Some(expr) => self.compile_node(expr, exclude_field, filter_self, &[])?,
            None => None,
        };
        let scope = match extra {
            Some(extra) => self.compile_node(extra, None, true, &[])?,
            None => None,
        };

        Ok(match (user, scope) {
            (Some(user), Some(scope)) => Some(all_of(vec![user, scope])),
            (Some(clause), None) | (None, Some(clause)) => Some(clause),
            (None, None) => None,
        })
    }

    /// `opened` lists the nested scopes an enclosing combinator already wraps.
    /// A combinator whose leaves all live under a deeper common nested path
    /// is wrapped once at that path, so its leaves match the same element.
    fn compile_node(
        &self,
        expr: &FilterExpr,
        exclude_field: Option<&str>,
        filter_self: bool,
        opened: &[String],
    ) -> QueryResult<Option<Value>> {
        match expr {
            FilterExpr::And(children) | FilterExpr::Or(children) => {
                let scope = match self.shared_nested(expr, exclude_field, filter_self) {
                    Some(shared) if shared.len() > opened.len() => shared,
                    _ => opened,
                };
                let mut clauses = Vec::with_capacity(children.len());
                for child in children {
                    if let Some(clause) =
                        self.compile_node(child, exclude_field, filter_self, scope)?
                    {
                        clauses.push(clause);
                    }
                }
                if clauses.is_empty() {
                    return Ok(None);
                }
                let combined = match expr {
                    FilterExpr::And(_) => all_of(clauses),
                    _ => any_of(clauses),
                };
                Ok(Some(wrap_nested(unopened(scope, opened), combined)))
            }
            FilterExpr::Compare { op, field, value } => {
                if !filter_self && exclude_field == Some(field.as_str()) {
                    return Ok(None);
                }
                let descriptor = self.schema.field(field).ok_or_else(|| {
                    QueryError::InvalidFilter(format!(
                        "Unknown field {} for index {}",
                        field, self.schema.index
                    ))
                })?;
                self.compile_compare(*op, descriptor, value, opened).map(Some)
            }
            FilterExpr::Search { keyword, fields } => self.compile_search(keyword, fields),
            FilterExpr::Missing { field } => {
                if !filter_self && exclude_field == Some(field.as_str()) {
                    return Ok(None);
                }
                let descriptor = self.schema.field(field).ok_or_else(|| {
                    QueryError::InvalidFilter(format!(
                        "Unknown field {} for index {}",
                        field, self.schema.index
                    ))
                })?;
                Ok(Some(none_of(vec![wrap_nested(
                    unopened(&descriptor.nested_path, opened),
                    exists(&descriptor.name),
                )])))
            }
        }
    }

    /// Longest nested path shared by every leaf that survives exclusion.
    /// `None` when no leaf contributes a clause.
    fn shared_nested(
        &self,
        expr: &FilterExpr,
        exclude_field: Option<&str>,
        filter_self: bool,
    ) -> Option<&'a [String]> {
        match expr {
            FilterExpr::And(children) | FilterExpr::Or(children) => children
                .iter()
                .filter_map(|child| self.shared_nested(child, exclude_field, filter_self))
                .reduce(|a, b| {
                    let common = a.iter().zip(b).take_while(|(x, y)| x == y).count();
                    &a[..common]
                }),
            FilterExpr::Compare { field, .. } | FilterExpr::Missing { field } => {
                if !filter_self && exclude_field == Some(field.as_str()) {
                    return None;
                }
                Some(
                    self.schema
                        .field(field)
                        .map(|d| d.nested_path.as_slice())
                        .unwrap_or(&[]),
                )
            }
            FilterExpr::Search { keyword, .. } => {
                if keyword.trim().is_empty() {
                    None
                } else {
                    Some(&[][..])
                }
            }
        }
    }

    fn compile_compare(
        &self,
        op: Operator,
        field: &FieldDescriptor,
        value: &Value,
        opened: &[String],
    ) -> QueryResult<Value> {
        let name = field.name.as_str();
        let nested = unopened(&field.nested_path, opened);

        match (op, field.kind) {
            (Operator::Eq, FieldKind::Text) => {
                let value = text_value(name, value)?;
                if self.is_missing_alias(&value) {
                    return Ok(none_of(vec![wrap_nested(nested, exists(name))]));
                }
                Ok(wrap_nested(nested, term(name, Value::String(value))))
            }
            (Operator::Eq, FieldKind::Numeric) => {
                Ok(wrap_nested(nested, term(name, numeric_value(name, value)?)))
            }
            (Operator::Ne, FieldKind::Text) => {
                let value = text_value(name, value)?;
                if self.is_missing_alias(&value) {
                    return Ok(wrap_nested(nested, exists(name)));
                }
                Ok(none_of(vec![wrap_nested(
                    nested,
                    term(name, Value::String(value)),
                )]))
            }
            (Operator::Ne, FieldKind::Numeric) => Ok(none_of(vec![wrap_nested(
                nested,
                term(name, numeric_value(name, value)?),
            )])),
            (Operator::In, FieldKind::Text) => self.compile_in(name, nested, value),
            (Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte, FieldKind::Numeric) => {
                Ok(wrap_nested(
                    nested,
                    range(name, op.as_str(), numeric_value(name, value)?),
                ))
            }
            (
                Operator::In | Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte,
                kind,
            ) => Err(QueryError::InvalidFilter(format!(
                "Operator {} is not supported for {:?} field {}",
                op.as_str(),
                kind,
                name
            ))),
        }
    }

    fn compile_in(&self, name: &str, nested: &[String], value: &Value) -> QueryResult<Value> {
        let items = value.as_array().ok_or_else(|| {
            QueryError::InvalidFilter(format!("Operator in on {} expects an array", name))
        })?;

        let mut values = Vec::with_capacity(items.len());
        let mut wants_missing = false;
        for item in items {
            let v = text_value(name, item)?;
            if self.is_missing_alias(&v) {
                wants_missing = true;
            } else {
                values.push(Value::String(v));
            }
        }

        let membership = wrap_nested(nested, json!({ "terms": { name: values } }));
        if !wants_missing {
            return Ok(membership);
        }
        let missing = none_of(vec![wrap_nested(nested, exists(name))]);
        if values.is_empty() {
            return Ok(missing);
        }
        Ok(any_of(vec![membership, missing]))
    }

    fn compile_search(&self, keyword: &str, fields: &[String]) -> QueryResult<Option<Value>> {
        if keyword.trim().is_empty() {
            return Ok(None);
        }

        let targets: Vec<&str> = if fields.is_empty() {
            self.schema.searchable_fields()
        } else {
            fields
                .iter()
                .map(|f| match self.schema.field(f) {
                    Some(d) if d.searchable => Ok(d.name.as_str()),
                    Some(_) => Err(QueryError::InvalidFilter(format!(
                        "Field {} is not text-searchable",
                        f
                    ))),
                    None => Err(QueryError::InvalidFilter(format!(
                        "Unknown field {} for index {}",
                        f, self.schema.index
                    ))),
                })
                .collect::<QueryResult<Vec<_>>>()?
        };
        if targets.is_empty() {
            return Err(QueryError::InvalidFilter(format!(
                "Index {} has no text-searchable fields",
                self.schema.index
            )));
        }

        let analyzed: Vec<String> = targets
            .iter()
            .map(|f| format!("{}.{}", f, self.analyzed_suffix))
            .collect();
        Ok(Some(json!({
            "multi_match": {
                "query": keyword,
                "fields": analyzed,
            }
        })))
    }

    fn is_missing_alias(&self, value: &str) -> bool {
        self.missing_alias == Some(value)
    }
}

pub fn all_of(clauses: Vec<Value>) -> Value {
    json!({ "bool": { "must": clauses } })
}

pub fn any_of(clauses: Vec<Value>) -> Value {
    json!({ "bool": { "should": clauses, "minimum_should_match": 1 } })
}

fn none_of(clauses: Vec<Value>) -> Value {
    json!({ "bool": { "must_not": clauses } })
}

fn term(field: &str, value: Value) -> Value {
    json!({ "term": { field: value } })
}

fn exists(field: &str) -> Value {
    json!({ "exists": { "field": field } })
}

pub(crate) fn range(field: &str, bound: &str, value: Value) -> Value {
    let mut bounds = Map::new();
    bounds.insert(bound.to_string(), value);
    json!({ "range": { field: bounds } })
}

/// The part of `path` not already covered by the `opened` scopes.
fn unopened<'p>(path: &'p [String], opened: &[String]) -> &'p [String] {
    path.get(opened.len()..).unwrap_or(&[])
}

/// Wraps `clause` in nested scopes, innermost path first.
pub(crate) fn wrap_nested(nested_path: &[String], clause: Value) -> Value {
    nested_path.iter().rev().fold(clause, |inner, path| {
        json!({ "nested": { "path": path, "query": inner } })
    })
}

fn text_value(field: &str, value: &Value) -> QueryResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(QueryError::InvalidFilter(format!(
            "Invalid value {} for text field {}",
            other, field
        ))),
    }
}

fn numeric_value(field: &str, value: &Value) -> QueryResult<Value> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| {
                QueryError::InvalidFilter(format!(
                    "Invalid numeric value {:?} for field {}",
                    s, field
                ))
            }),
        other => Err(QueryError::InvalidFilter(format!(
            "Invalid value {} for numeric field {}",
            other, field
        ))),
    }
}
