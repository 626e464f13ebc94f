//! Test fixtures: an in-memory search backend that evaluates the subset of
//! the native query language the engine emits, and a static policy oracle.

use crate::auth::{Grant, PolicyOracle};
use crate::backend::SearchBackend;
use crate::config::{Config, IndexConfig};
use crate::schema::{IndexSchema, SchemaRegistry};
use crate::tier::AccessLevel;
use crate::QueryContext;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn subject_mapping() -> Value {
    json!({
        "subject": {
            "mappings": {
                "properties": {
                    "auth_resource_path": {"type": "keyword"},
                    "gender": {"type": "keyword", "fields": {"analyzed": {"type": "text"}}},
                    "project_id": {"type": "keyword", "fields": {"analyzed": {"type": "text"}}},
                    "age": {"type": "long"},
                    "bmi": {"type": "double"},
                    "sensitive": {"type": "keyword"},
                    "created": {"type": "date"},
                    "demographics": {
                        "properties": {
                            "race": {"type": "keyword"}
                        }
                    },
                    "visits": {
                        "type": "nested",
                        "properties": {
                            "visit_label": {"type": "keyword"},
                            "flagged": {"type": "keyword"},
                            "labs": {
                                "type": "nested",
                                "properties": {
                                    "result": {"type": "double"}
                                }
                            }
                        }
                    }
                }
            }
        }
    })
}

pub fn subject_schema() -> IndexSchema {
    IndexSchema::build("subject", None, &subject_mapping(), &[], "analyzed").unwrap()
}

pub fn index_config(index: &str) -> IndexConfig {
    IndexConfig {
        index: index.to_string(),
        doc_type: None,
        tier_access_level: Some(AccessLevel::Regular),
        array_fields: Vec::new(),
    }
}

/// Site-wide `level` with a tier limit of 20 over the `subject` index.
pub fn test_config(level: AccessLevel) -> Config {
    let mut config: Config = toml::from_str(&format!(
        r#"
[backend]
endpoint = "http://localhost:9200"

[policy]
endpoint = "http://arborist"

[tier]
level = "{}"
limit = 20

[[indices]]
index = "subject"
"#,
        level
    ))
    .unwrap();
    config.validate().unwrap();
    config.aggregation.timeout_seconds = 5;
    config
}

pub fn doc(resource: &str, gender: Option<&str>, age: f64) -> Value {
    let mut doc = json!({
        "auth_resource_path": resource,
        "age": age,
        "project_id": resource.trim_start_matches("/programs/"),
    });
    if let Some(gender) = gender {
        doc["gender"] = json!(gender);
    }
    doc
}

/// Context over `backend` with the subject schema already loaded.
pub fn context(backend: Arc<MemoryBackend>, config: &Config) -> QueryContext {
    let registry = SchemaRegistry::new(config.indices.clone(), &config.aggregation.analyzed_suffix);
    registry.insert(subject_schema()).unwrap();
    QueryContext::new(backend, Arc::new(registry), config)
}

#[derive(Default)]
pub struct MemoryBackend {
    mappings: Mutex<HashMap<String, Value>>,
    docs: Mutex<HashMap<String, Vec<Value>>>,
    requests: Mutex<Vec<(String, Value)>>,
    fail_search: AtomicBool,
    /// Searches past the first `n` sleep for the given duration.
    slow_after: Mutex<Option<(usize, Duration)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mapping(&self, index: &str, mapping: Value) {
        self.mappings
            .lock()
            .unwrap()
            .insert(index.to_string(), mapping);
    }

    pub fn add_docs(&self, index: &str, docs: Vec<Value>) {
        self.docs
            .lock()
            .unwrap()
            .entry(index.to_string())
            .or_default()
            .extend(docs);
    }

    pub fn fail_searches(&self, fail: bool) {
        self.fail_search.store(fail, AtomicOrdering::SeqCst);
    }

    pub fn slow_searches_after(&self, served: usize, delay: Duration) {
        *self.slow_after.lock().unwrap() = Some((served, delay));
    }

    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }
}

#[async_trait]
impl SearchBackend for MemoryBackend {
    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn mapping(&self, index: &str) -> anyhow::Result<Value> {
        self.mappings
            .lock()
            .unwrap()
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Index not found: {}", index))
    }

    async fn search(&self, index: &str, body: Value) -> anyhow::Result<Value> {
        self.requests
            .lock()
            .unwrap()
            .push((index.to_string(), body.clone()));
        let seen = self.requests.lock().unwrap().len();
        let slow = *self.slow_after.lock().unwrap();
        if let Some((served, delay)) = slow {
            if seen > served {
                tokio::time::sleep(delay).await;
            }
        }
        if self.fail_search.load(AtomicOrdering::SeqCst) {
            anyhow::bail!("connection refused");
        }

        let all = self
            .docs
            .lock()
            .unwrap()
            .get(index)
            .cloned()
            .unwrap_or_default();
        let query = body.get("query").cloned().unwrap_or(Value::Null);
        let matched: Vec<&Value> = all.iter().filter(|d| matches(d, &query)).collect();

        let mut response = json!({
            "hits": {
                "total": {"value": matched.len(), "relation": "eq"},
                "hits": hits(&matched, &body),
            }
        });
        if let Some(aggs) = body.get("aggs").and_then(Value::as_object) {
            response["aggregations"] = run_aggs(&matched, aggs);
        }
        Ok(response)
    }
}

fn hits(docs: &[&Value], body: &Value) -> Value {
    let size = body.get("size").and_then(Value::as_u64).unwrap_or(10) as usize;
    let from = body.get("from").and_then(Value::as_u64).unwrap_or(0) as usize;
    let mut sorted: Vec<&Value> = docs.to_vec();

    if let Some(sort) = body.get("sort").and_then(Value::as_array) {
        for clause in sort.iter().rev() {
            let Some((field, agg)) = clause.as_object().and_then(|o| o.iter().next()) else {
                continue;
            };
            let desc = agg.get("order").and_then(Value::as_str) == Some("desc");
            sorted.sort_by(|a, b| {
                let ord = compare_keys(
                    values_at(a, field).first().copied().unwrap_or(&Value::Null),
                    values_at(b, field).first().copied().unwrap_or(&Value::Null),
                );
                if desc {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
    }

    let includes: Option<Vec<&str>> = body
        .get("_source")
        .and_then(Value::as_array)
        .map(|fields| fields.iter().filter_map(Value::as_str).collect());

    let rows: Vec<Value> = sorted
        .into_iter()
        .skip(from)
        .take(size)
        .map(|doc| {
            let source = match (&includes, doc.as_object()) {
                (Some(fields), Some(obj)) => Value::Object(
                    obj.iter()
                        .filter(|(k, _)| fields.contains(&k.as_str()))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                ),
                _ => doc.clone(),
            };
            json!({ "_source": source })
        })
        .collect();
    Value::Array(rows)
}

/// Values at a dotted path, flattening arrays along the way.
fn values_at<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![doc];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value.get(segment) {
                Some(Value::Array(items)) => next.extend(items.iter()),
                Some(Value::Null) | None => {}
                Some(v) => next.push(v),
            }
        }
        current = next
            .into_iter()
            .flat_map(|v| match v {
                Value::Array(items) => items.iter().collect::<Vec<_>>(),
                other => vec![other],
            })
            .collect();
    }
    current.retain(|v| !v.is_null());
    current
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => match (a, b) {
            (Value::Bool(x), Value::String(y)) | (Value::String(y), Value::Bool(x)) => {
                x.to_string() == *y
            }
            _ => a == b,
        },
    }
}

fn matches(doc: &Value, query: &Value) -> bool {
    let Some((kind, body)) = query.as_object().and_then(|o| o.iter().next()) else {
        return true;
    };
    match kind.as_str() {
        "bool" => {
            let clauses = |key: &str| -> Vec<Value> {
                body.get(key)
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
            };
            let should = clauses("should");
            clauses("must").iter().all(|c| matches(doc, c))
                && clauses("filter").iter().all(|c| matches(doc, c))
                && (should.is_empty() || should.iter().any(|c| matches(doc, c)))
                && !clauses("must_not").iter().any(|c| matches(doc, c))
        }
        "term" => {
            let (field, expected) = first_entry(body);
            values_at(doc, field).iter().any(|v| json_eq(v, expected))
        }
        "terms" => {
            let (field, expected) = first_entry(body);
            let expected = expected.as_array().cloned().unwrap_or_default();
            values_at(doc, field)
                .iter()
                .any(|v| expected.iter().any(|e| json_eq(v, e)))
        }
        "range" => {
            let (field, bounds) = first_entry(body);
            values_at(doc, field).iter().filter_map(|v| v.as_f64()).any(|v| {
                bounds.as_object().unwrap().iter().all(|(op, bound)| {
                    let bound = bound.as_f64().unwrap();
                    match op.as_str() {
                        "gt" => v > bound,
                        "gte" => v >= bound,
                        "lt" => v < bound,
                        "lte" => v <= bound,
                        other => panic!("unsupported range bound {}", other),
                    }
                })
            })
        }
        "exists" => {
            let field = body["field"].as_str().unwrap();
            !values_at(doc, field).is_empty()
        }
        "nested" => {
            let path = body["path"].as_str().unwrap();
            values_at(doc, path)
                .into_iter()
                .any(|element| matches(&scoped_to(doc, path, element), &body["query"]))
        }
        "match_all" => true,
        "multi_match" => {
            let needle = body["query"].as_str().unwrap().to_lowercase();
            body["fields"].as_array().unwrap().iter().any(|f| {
                let field = f.as_str().unwrap().trim_end_matches(".analyzed");
                values_at(doc, field)
                    .iter()
                    .filter_map(|v| v.as_str())
                    .any(|s| s.to_lowercase().contains(&needle))
            })
        }
        other => panic!("unsupported query clause {}", other),
    }
}

/// Copy of `doc` where the nested array at `path` holds only `element`.
fn scoped_to(doc: &Value, path: &str, element: &Value) -> Value {
    let segments: Vec<&str> = path.split('.').collect();
    replace_at(doc, &segments, element)
}

fn replace_at(value: &Value, segments: &[&str], element: &Value) -> Value {
    let Some((head, rest)) = segments.split_first() else {
        return element.clone();
    };
    match value {
        Value::Object(map) => {
            let mut map = map.clone();
            if let Some(child) = map.get(*head).cloned() {
                map.insert(head.to_string(), replace_at(&child, rest, element));
            }
            Value::Object(map)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| replace_at(item, segments, element))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn first_entry(body: &Value) -> (&str, &Value) {
    let (k, v) = body.as_object().unwrap().iter().next().unwrap();
    (k.as_str(), v)
}

fn run_aggs(docs: &[&Value], aggs: &Map<String, Value>) -> Value {
    let mut out = Map::new();
    for (name, agg) in aggs {
        out.insert(name.clone(), run_agg(docs, agg));
    }
    Value::Object(out)
}

fn run_agg(docs: &[&Value], agg: &Value) -> Value {
    if let Some(stats) = agg.get("stats") {
        return stats_of(docs, stats["field"].as_str().unwrap());
    }
    if let Some(histogram) = agg.get("histogram") {
        return histogram_of(docs, histogram, agg.get("aggs").and_then(Value::as_object));
    }
    if let Some(composite) = agg.get("composite") {
        return composite_of(docs, composite);
    }
    if agg.get("nested").is_some() {
        let mut out = match agg.get("aggs").and_then(Value::as_object) {
            Some(sub) => run_aggs(docs, sub),
            None => json!({}),
        };
        out["doc_count"] = json!(docs.len());
        return out;
    }
    panic!("unsupported aggregation {}", agg)
}

fn stats_of(docs: &[&Value], field: &str) -> Value {
    let values: Vec<f64> = docs
        .iter()
        .flat_map(|d| values_at(d, field))
        .filter_map(Value::as_f64)
        .collect();
    if values.is_empty() {
        return json!({"count": 0, "min": null, "max": null, "avg": null, "sum": 0.0});
    }
    let sum: f64 = values.iter().sum();
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    json!({
        "count": values.len(),
        "min": min,
        "max": max,
        "avg": sum / values.len() as f64,
        "sum": sum,
    })
}

fn histogram_of(docs: &[&Value], agg: &Value, sub: Option<&Map<String, Value>>) -> Value {
    let field = agg["field"].as_str().unwrap();
    let interval = agg["interval"].as_f64().unwrap();
    let offset = agg.get("offset").and_then(Value::as_f64).unwrap_or(0.0);

    let mut buckets: Vec<(i64, Vec<&Value>)> = Vec::new();
    for doc in docs {
        let mut seen = Vec::new();
        for v in values_at(doc, field).into_iter().filter_map(Value::as_f64) {
            let k = ((v - offset) / interval).floor() as i64;
            if seen.contains(&k) {
                continue;
            }
            seen.push(k);
            match buckets.iter_mut().find(|(bk, _)| *bk == k) {
                Some((_, members)) => members.push(doc),
                None => buckets.push((k, vec![doc])),
            }
        }
    }
    buckets.sort_by_key(|(k, _)| *k);

    let (Some(first), Some(last)) = (buckets.first().map(|b| b.0), buckets.last().map(|b| b.0))
    else {
        return json!({"buckets": []});
    };
    let rendered: Vec<Value> = (first..=last)
        .map(|k| {
            let members: Vec<&Value> = buckets
                .iter()
                .find(|(bk, _)| *bk == k)
                .map(|(_, m)| m.clone())
                .unwrap_or_default();
            let mut bucket = match sub {
                Some(sub) => run_aggs(&members, sub),
                None => json!({}),
            };
            bucket["key"] = json!(k as f64 * interval + offset);
            bucket["doc_count"] = json!(members.len());
            bucket
        })
        .collect();
    json!({ "buckets": rendered })
}

fn composite_of(docs: &[&Value], agg: &Value) -> Value {
    let size = agg["size"].as_u64().unwrap() as usize;
    let (source_name, source) = first_entry(&agg["sources"][0]);
    let field = source["terms"]["field"].as_str().unwrap();
    let missing_bucket = source["terms"]
        .get("missing_bucket")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut counts: Vec<(Value, usize)> = Vec::new();
    for doc in docs {
        let mut keys: Vec<Value> = values_at(doc, field).into_iter().cloned().collect();
        keys.dedup();
        if keys.is_empty() && missing_bucket {
            keys.push(Value::Null);
        }
        for key in keys {
            match counts.iter_mut().find(|(k, _)| *k == key) {
                Some((_, n)) => *n += 1,
                None => counts.push((key, 1)),
            }
        }
    }
    counts.sort_by(|a, b| compare_keys(&a.0, &b.0));

    let after = agg.get("after").map(|a| a[source_name].clone());
    let page: Vec<(Value, usize)> = counts
        .into_iter()
        .filter(|(k, _)| match &after {
            Some(after) => compare_keys(k, after) == Ordering::Greater,
            None => true,
        })
        .take(size)
        .collect();

    let buckets: Vec<Value> = page
        .iter()
        .map(|(k, n)| json!({"key": {source_name: k}, "doc_count": n}))
        .collect();
    let mut out = json!({ "buckets": buckets });
    if let Some((last, _)) = page.last() {
        out["after_key"] = json!({ source_name: last });
    }
    out
}

fn compare_keys(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Number(_) => 1,
            Value::Bool(_) => 2,
            _ => 3,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Oracle returning a fixed grant table.
pub struct StaticOracle {
    mapping: HashMap<String, Vec<Grant>>,
    fail: bool,
    calls: AtomicUsize,
}

impl StaticOracle {
    pub fn granting(paths: &[&str]) -> Self {
        let mapping = paths
            .iter()
            .map(|p| {
                (
                    p.to_string(),
                    vec![Grant {
                        service: "guppy".to_string(),
                        method: "read".to_string(),
                    }],
                )
            })
            .collect();
        Self {
            mapping,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_grants(mapping: HashMap<String, Vec<Grant>>) -> Self {
        Self {
            mapping,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            mapping: HashMap::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl PolicyOracle for StaticOracle {
    async fn auth_mapping(&self, _token: &str) -> anyhow::Result<HashMap<String, Vec<Grant>>> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        if self.fail {
            anyhow::bail!("policy service timed out");
        }
        Ok(self.mapping.clone())
    }
}
