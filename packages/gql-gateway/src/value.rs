//! Gateway-side value model
//!
//! `GenericValue` is the flat, UI-facing counterpart of `EngineValue`.
//! Graph elements appear both inline (as `Vertex`/`Edge`/`Path`) and, after
//! normalization, as records in the per-row side-lists.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::engine::EngineDuration;

/// Sentinel rendered for the engine's `Empty` value.
pub const EMPTY_SENTINEL: &str = "_EMPTY_";

/// Client-scoped parameter bindings (`:param name => value`).
pub type ParameterMap = BTreeMap<String, GenericValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Vertex,
    Edge,
    Path,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VertexRecord {
    pub vid: GenericValue,
    #[serde(rename = "type")]
    pub kind: ElementKind,
    pub labels: Vec<String>,
    pub properties: BTreeMap<String, GenericValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeRecord {
    #[serde(rename = "type")]
    pub kind: ElementKind,
    #[serde(rename = "srcID")]
    pub src_id: GenericValue,
    #[serde(rename = "dstID")]
    pub dst_id: GenericValue,
    #[serde(rename = "edgeName")]
    pub edge_name: String,
    pub rank: i64,
    pub properties: BTreeMap<String, GenericValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathRecord {
    #[serde(rename = "type")]
    pub kind: ElementKind,
    /// Id of the first node; `Null` for an empty path.
    #[serde(rename = "srcID")]
    pub src_id: GenericValue,
    pub nodes: Vec<VertexRecord>,
    pub relationships: Vec<EdgeRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenericValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    Duration(EngineDuration),
    Vertex(Box<VertexRecord>),
    Edge(Box<EdgeRecord>),
    Path(Box<PathRecord>),
    List(Vec<GenericValue>),
    Set(Vec<GenericValue>),
    Map(BTreeMap<String, GenericValue>),
    Empty,
    /// Text rendering of a value with no structured decoding.
    Opaque(String),
}

impl GenericValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            GenericValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            GenericValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_empty_sentinel(&self) -> bool {
        matches!(self, GenericValue::Empty)
    }
}

impl Serialize for GenericValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            GenericValue::Null => serializer.serialize_none(),
            GenericValue::Bool(b) => serializer.serialize_bool(*b),
            GenericValue::Int(i) => serializer.serialize_i64(*i),
            GenericValue::Float(x) => serializer.serialize_f64(*x),
            GenericValue::String(s) => serializer.serialize_str(s),
            GenericValue::Date(d) => serializer.collect_str(d),
            GenericValue::Time(t) => serializer.collect_str(t),
            GenericValue::DateTime(dt) => serializer.collect_str(dt),
            GenericValue::Duration(d) => serializer.collect_str(d),
            GenericValue::Vertex(v) => v.serialize(serializer),
            GenericValue::Edge(e) => e.serialize(serializer),
            GenericValue::Path(p) => p.serialize(serializer),
            GenericValue::List(items) | GenericValue::Set(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            GenericValue::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            GenericValue::Empty => serializer.serialize_str(EMPTY_SENTINEL),
            GenericValue::Opaque(text) => serializer.serialize_str(text),
        }
    }
}

impl From<serde_json::Value> for GenericValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => GenericValue::Null,
            serde_json::Value::Bool(b) => GenericValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => GenericValue::Int(i),
                None => GenericValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => GenericValue::String(s),
            serde_json::Value::Array(items) => {
                GenericValue::List(items.into_iter().map(GenericValue::from).collect())
            }
            serde_json::Value::Object(entries) => GenericValue::Map(
                entries.into_iter().map(|(k, v)| (k, GenericValue::from(v))).collect(),
            ),
        }
    }
}

impl From<&str> for GenericValue {
    fn from(s: &str) -> Self {
        GenericValue::String(s.to_string())
    }
}

impl From<i64> for GenericValue {
    fn from(i: i64) -> Self {
        GenericValue::Int(i)
    }
}
