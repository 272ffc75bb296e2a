//! Configuration values.
//!
//! A [`Value`] is what a resource's `config` and `outputs` maps hold. Plain
//! scalars, lists and tables map one-to-one onto TOML and JSON. The extra
//! [`Value::Ref`] variant, written `{ ref = "database.endpoint" }`, points at
//! another resource's output and is resolved by the executor once that
//! producer is active.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A configuration or output value.
///
/// Serialized untagged so that topology files stay plain TOML. `Ref` must
/// stay ahead of `Map` so that `{ ref = "..." }` tables are read as
/// references rather than single-key maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Ref(AttributeRef),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_attribute_ref(&self) -> Option<&AttributeRef> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// All references contained in this value, depth-first.
    pub fn refs(&self) -> Vec<&AttributeRef> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a AttributeRef>) {
        match self {
            Value::Ref(r) => out.push(r),
            Value::List(items) => items.iter().for_each(|v| v.collect_refs(out)),
            Value::Map(map) => map.values().for_each(|v| v.collect_refs(out)),
            _ => {}
        }
    }

    /// Replace every reference with the value `lookup` returns for it.
    ///
    /// Fails with the first reference `lookup` cannot satisfy.
    pub fn resolve<F>(&self, lookup: &F) -> Result<Value, AttributeRef>
    where
        F: Fn(&AttributeRef) -> Option<Value>,
    {
        match self {
            Value::Ref(r) => lookup(r).ok_or_else(|| r.clone()),
            Value::List(items) => items
                .iter()
                .map(|v| v.resolve(lookup))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Value::Map(map) => map
                .iter()
                .map(|(k, v)| v.resolve(lookup).map(|v| (k.clone(), v)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Value::Map),
            other => Ok(other.clone()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<AttributeRef> for Value {
    fn from(r: AttributeRef) -> Self {
        Value::Ref(r)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(items: Vec<V>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Ref(r) => write!(f, "${{{r}}}"),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k} = {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

/// Reference to `producer.outputs[attribute]`.
///
/// The attribute may be a dotted path into nested outputs
/// (`vpc.private_subnet_ids.0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RefRepr", into = "RefRepr")]
pub struct AttributeRef {
    pub resource: String,
    pub attribute: String,
}

impl AttributeRef {
    pub fn new(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            attribute: attribute.into(),
        }
    }

    /// Parse `"resource.attribute[.more]"`.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s.split_once('.') {
            Some((resource, attribute)) if !resource.is_empty() && !attribute.is_empty() => {
                Ok(Self::new(resource, attribute))
            }
            _ => Err(CoreError::InvalidReference(s.to_string())),
        }
    }

    /// Look this reference's attribute path up in a producer's outputs.
    pub fn lookup(&self, outputs: &BTreeMap<String, Value>) -> Option<Value> {
        let mut segments = self.attribute.split('.');
        let mut current = outputs.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Map(map) => map.get(segment)?,
                Value::List(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.attribute)
    }
}

/// Wire form of an [`AttributeRef`]: `{ ref = "resource.attribute" }`.
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RefRepr {
    #[serde(rename = "ref")]
    target: String,
}

impl TryFrom<RefRepr> for AttributeRef {
    type Error = CoreError;

    fn try_from(repr: RefRepr) -> Result<Self, Self::Error> {
        AttributeRef::parse(&repr.target)
    }
}

impl From<AttributeRef> for RefRepr {
    fn from(r: AttributeRef) -> Self {
        RefRepr {
            target: r.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> BTreeMap<String, Value> {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn scalars_parse_from_toml() {
        let map = parse(
            r#"
port = 5432
ratio = 0.5
multi_az = true
engine = "postgres"
"#,
        );
        assert_eq!(map["port"], Value::Int(5432));
        assert_eq!(map["ratio"], Value::Float(0.5));
        assert_eq!(map["multi_az"], Value::Bool(true));
        assert_eq!(map["engine"], Value::from("postgres"));
    }

    #[test]
    fn ref_table_parses_as_reference() {
        let map = parse(r#"host = { ref = "database.endpoint" }"#);
        assert_eq!(
            map["host"],
            Value::Ref(AttributeRef::new("database", "endpoint"))
        );
    }

    #[test]
    fn table_with_extra_keys_is_a_map() {
        let map = parse(r#"env = { ref = "x.y", other = 1 }"#);
        assert!(matches!(map["env"], Value::Map(_)));
    }

    #[test]
    fn malformed_ref_is_rejected() {
        let result: Result<BTreeMap<String, Value>, _> = toml::from_str(r#"x = { ref = "nodot" }"#);
        // Falls through to the map variant, which still holds a plain string.
        let map = result.unwrap();
        assert!(matches!(map["x"], Value::Map(_)));
        assert!(AttributeRef::parse("nodot").is_err());
        assert!(AttributeRef::parse(".attr").is_err());
    }

    #[test]
    fn refs_are_collected_recursively() {
        let map = parse(
            r#"
[env]
DB = { ref = "database.endpoint" }
CACHE = { ref = "cache.endpoint" }
[other]
subnets = [{ ref = "vpc.private_subnet_ids" }]
"#,
        );
        let value = Value::Map(map);
        let mut refs: Vec<String> = value.refs().iter().map(|r| r.to_string()).collect();
        refs.sort();
        assert_eq!(
            refs,
            vec!["cache.endpoint", "database.endpoint", "vpc.private_subnet_ids"]
        );
    }

    #[test]
    fn resolve_replaces_refs() {
        let value = Value::List(vec![
            Value::from("literal"),
            Value::Ref(AttributeRef::new("db", "endpoint")),
        ]);
        let resolved = value
            .resolve(&|r: &AttributeRef| (r.resource == "db").then(|| Value::from("db:5432")))
            .unwrap();
        assert_eq!(resolved, Value::from(vec!["literal", "db:5432"]));
    }

    #[test]
    fn resolve_reports_missing_ref() {
        let value = Value::Ref(AttributeRef::new("db", "endpoint"));
        let err = value.resolve(&|_: &AttributeRef| None).unwrap_err();
        assert_eq!(err.to_string(), "db.endpoint");
    }

    #[test]
    fn lookup_walks_nested_paths() {
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "private_subnet_ids".to_string(),
            Value::from(vec!["subnet-a", "subnet-b"]),
        );
        let r = AttributeRef::parse("vpc.private_subnet_ids.1").unwrap();
        assert_eq!(r.lookup(&outputs), Some(Value::from("subnet-b")));
        let r = AttributeRef::parse("vpc.private_subnet_ids.9").unwrap();
        assert_eq!(r.lookup(&outputs), None);
    }

    #[test]
    fn json_round_trip_keeps_refs() {
        let value = Value::Ref(AttributeRef::new("lb", "dns_name"));
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"ref":"lb.dns_name"}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}
