use crate::error::{QueryError, QueryResult};
use crate::schema::IndexSchema;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    fn parse(field: &str, value: &Value) -> QueryResult<Self> {
        match value.as_str() {
            Some("asc") => Ok(Direction::Asc),
            Some("desc") => Ok(Direction::Desc),
            _ => Err(QueryError::InvalidSort(format!(
                "Sort direction for {} must be asc or desc, got {}",
                field, value
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }
}

/// Validates a sort request and renders native sort clauses.
///
/// Accepts `[{"field": "asc"}, ...]` or `{"field": "asc", ...}`; object key
/// order is kept as given. Fields under nested objects sort by their nearest
/// enclosing nested path.
pub struct SortCompiler<'a> {
    schema: &'a IndexSchema,
}

impl<'a> SortCompiler<'a> {
    pub fn new(schema: &'a IndexSchema) -> Self {
        Self { schema }
    }

    pub fn compile(&self, sorting: &Value) -> QueryResult<Option<Vec<Value>>> {
        let pairs = match sorting {
            Value::Null => return Ok(None),
            Value::Object(map) => map.iter().collect::<Vec<_>>(),
            Value::Array(items) => {
                let mut pairs = Vec::with_capacity(items.len());
                for item in items {
                    let entry = item
                        .as_object()
                        .filter(|o| o.len() == 1)
                        .and_then(|o| o.iter().next())
                        .ok_or_else(|| {
                            QueryError::InvalidSort(format!(
                                "Each sort entry must be a single {{field: direction}} object, got {}",
                                item
                            ))
                        })?;
                    pairs.push(entry);
                }
                pairs
            }
            other => {
                return Err(QueryError::InvalidSort(format!(
                    "Sort must be an object or an array, got {}",
                    other
                )))
            }
        };

        let mut clauses = Vec::with_capacity(pairs.len());
        for (field, direction) in pairs {
            clauses.push(self.clause(field, direction)?);
        }
        Ok(Some(clauses))
    }

    fn clause(&self, field: &str, direction: &Value) -> QueryResult<Value> {
        let descriptor = self.schema.field(field).ok_or_else(|| {
            QueryError::InvalidSort(format!(
                "Unknown field {} for index {}",
                field, self.schema.index
            ))
        })?;
        let direction = Direction::parse(field, direction)?;

        let mut body = Map::new();
        body.insert("order".to_string(), json!(direction.as_str()));
        if let Some(nearest) = descriptor.nested_path.last() {
            body.insert("nested".to_string(), json!({ "path": nearest }));
        }
        Ok(json!({ field: body }))
    }
}
