//! Result normalization - engine `ResultSet` to UI-consumable tables
//!
//! Every cell goes through one recursive visitor (`Normalizer::convert`)
//! that both produces the cell's `GenericValue` and harvests every vertex,
//! edge and path it meets, at any nesting depth, into the row's side-lists.
//!
//! # Output shape
//!
//! ```text
//! headers: ["p", "n"]
//! tables:  [{ "p": {...}, "n": 3,
//!             "_pathsParsedList": [...] }]      <- only when non-empty
//! ```
//!
//! Side-list keys never collide with real columns, so UI code can tell
//! harvested graph elements apart from projected values.

use std::collections::{BTreeMap, HashMap};

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::engine::{EngineValue, Node, Path, Relationship, ResultSet};
use crate::error::{GatewayError, Result};
use crate::value::{EdgeRecord, ElementKind, GenericValue, ParameterMap, PathRecord, VertexRecord};

pub const VERTICES_KEY: &str = "_verticesParsedList";
pub const EDGES_KEY: &str = "_edgesParsedList";
pub const PATHS_KEY: &str = "_pathsParsedList";

/// Headers used for plan-description results.
pub const PLAN_HEADERS: [&str; 2] = ["key", "value"];

/// Default cap on container nesting the visitor descends into.
pub const DEFAULT_MAX_DEPTH: usize = 64;

// ============================================================================
// Output types
// ============================================================================

/// One output row: projected cells in header order plus harvested elements.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    cells: Vec<(String, GenericValue)>,
    pub vertices: Vec<VertexRecord>,
    pub edges: Vec<EdgeRecord>,
    pub paths: Vec<PathRecord>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&GenericValue> {
        self.cells.iter().find(|(name, _)| name == column).map(|(_, v)| v)
    }

    pub fn cells(&self) -> &[(String, GenericValue)] {
        &self.cells
    }

    pub fn column_count(&self) -> usize {
        self.cells.len()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let extra = [!self.vertices.is_empty(), !self.edges.is_empty(), !self.paths.is_empty()]
            .iter()
            .filter(|present| **present)
            .count();
        let mut map = serializer.serialize_map(Some(self.cells.len() + extra))?;
        for (name, value) in &self.cells {
            map.serialize_entry(name, value)?;
        }
        if !self.vertices.is_empty() {
            map.serialize_entry(VERTICES_KEY, &self.vertices)?;
        }
        if !self.edges.is_empty() {
            map.serialize_entry(EDGES_KEY, &self.edges)?;
        }
        if !self.paths.is_empty() {
            map.serialize_entry(PATHS_KEY, &self.paths)?;
        }
        map.end()
    }
}

/// Normalized answer to one statement.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedResult {
    pub headers: Vec<String>,
    #[serde(rename = "tables")]
    pub rows: Vec<Row>,
    /// Engine-side execution time in microseconds.
    pub time_cost: i64,
    /// Parameter snapshot, set only for local commands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_params: Option<ParameterMap>,
}

impl NormalizedResult {
    /// Result of a local command: no table, just the parameter snapshot.
    pub fn local(params: ParameterMap) -> Self {
        Self { local_params: Some(params), ..Self::default() }
    }
}

// ============================================================================
// Normalizer
// ============================================================================

#[derive(Default)]
struct Harvest {
    vertices: Vec<VertexRecord>,
    edges: Vec<EdgeRecord>,
    paths: Vec<PathRecord>,
}

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    max_depth: usize,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl Normalizer {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Normalize one engine result.
    ///
    /// A failed status becomes `GatewayError::Query`; a failing cell accessor
    /// aborts the whole result with `GatewayError::Normalize` (no partial
    /// rows).
    pub fn normalize(&self, rs: &ResultSet) -> Result<NormalizedResult> {
        if !rs.is_succeeded() {
            return Err(GatewayError::Query(rs.status().to_string()));
        }
        if let Some(entries) = rs.plan_description() {
            return Ok(Self::normalize_plan(entries, rs.latency()));
        }

        let headers = unique_headers(rs.column_names());
        let mut rows = Vec::with_capacity(rs.row_count());

        for row_idx in 0..rs.row_count() {
            let mut harvest = Harvest::default();
            let mut cells = Vec::with_capacity(headers.len());
            for (col_idx, header) in headers.iter().enumerate() {
                let raw = rs
                    .cell(row_idx, col_idx)
                    .map_err(|e| GatewayError::Normalize(e.to_string()))?;
                let value = self.convert(raw, 0, Some(&mut harvest));
                cells.push((header.clone(), value));
            }
            rows.push(Row {
                cells,
                vertices: harvest.vertices,
                edges: harvest.edges,
                paths: harvest.paths,
            });
        }

        Ok(NormalizedResult {
            headers,
            rows,
            time_cost: rs.latency(),
            local_params: None,
        })
    }

    fn normalize_plan(entries: &[(String, String)], latency: i64) -> NormalizedResult {
        let rows = entries
            .iter()
            .map(|(key, value)| Row {
                cells: vec![
                    (PLAN_HEADERS[0].to_string(), GenericValue::String(key.clone())),
                    (PLAN_HEADERS[1].to_string(), GenericValue::String(value.clone())),
                ],
                ..Row::default()
            })
            .collect();
        NormalizedResult {
            headers: PLAN_HEADERS.iter().map(|h| h.to_string()).collect(),
            rows,
            time_cost: latency,
            local_params: None,
        }
    }

    /// The visitor. `harvest` is `None` where graph elements are part of an
    /// enclosing record (path members, element properties) and must not be
    /// reported a second time.
    fn convert(&self, value: &EngineValue, depth: usize, mut harvest: Option<&mut Harvest>) -> GenericValue {
        if depth > self.max_depth {
            // Fixed text: rendering the subtree would recurse without bound.
            return GenericValue::Opaque(format!("<nested {}>", value.type_name()));
        }
        match value {
            EngineValue::Empty => GenericValue::Empty,
            EngineValue::Null => GenericValue::Null,
            EngineValue::Bool(b) => GenericValue::Bool(*b),
            EngineValue::Int(i) => GenericValue::Int(*i),
            EngineValue::Float(x) => GenericValue::Float(*x),
            EngineValue::String(s) => GenericValue::String(s.clone()),
            EngineValue::Date(d) => GenericValue::Date(*d),
            EngineValue::LocalTime(t) => GenericValue::Time(*t),
            EngineValue::LocalDateTime(dt) => GenericValue::DateTime(*dt),
            EngineValue::Duration(d) => GenericValue::Duration(*d),
            EngineValue::Node(node) => {
                let record = self.vertex_record(node, depth);
                if let Some(h) = harvest {
                    h.vertices.push(record.clone());
                }
                GenericValue::Vertex(Box::new(record))
            }
            EngineValue::Edge(rel) => {
                let record = self.edge_record(rel, depth);
                if let Some(h) = harvest {
                    h.edges.push(record.clone());
                }
                GenericValue::Edge(Box::new(record))
            }
            EngineValue::Path(path) => {
                let record = self.path_record(path, depth);
                if let Some(h) = harvest {
                    h.paths.push(record.clone());
                }
                GenericValue::Path(Box::new(record))
            }
            EngineValue::List(items) => GenericValue::List(
                items
                    .iter()
                    .map(|item| self.convert(item, depth + 1, harvest.as_deref_mut()))
                    .collect(),
            ),
            EngineValue::Set(items) => GenericValue::Set(
                items
                    .iter()
                    .map(|item| self.convert(item, depth + 1, harvest.as_deref_mut()))
                    .collect(),
            ),
            EngineValue::Map(entries) => GenericValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), self.convert(v, depth + 1, harvest.as_deref_mut())))
                    .collect(),
            ),
            EngineValue::Geography(text) => GenericValue::String(text.clone()),
            EngineValue::Opaque { text, .. } => GenericValue::Opaque(text.clone()),
        }
    }

    fn properties(&self, props: &BTreeMap<String, EngineValue>, depth: usize) -> BTreeMap<String, GenericValue> {
        props
            .iter()
            .map(|(k, v)| (k.clone(), self.convert(v, depth + 1, None)))
            .collect()
    }

    fn vertex_record(&self, node: &Node, depth: usize) -> VertexRecord {
        VertexRecord {
            vid: self.convert(&node.id, depth + 1, None),
            kind: ElementKind::Vertex,
            labels: node.labels.clone(),
            properties: self.properties(&node.properties, depth),
        }
    }

    fn edge_record(&self, rel: &Relationship, depth: usize) -> EdgeRecord {
        EdgeRecord {
            kind: ElementKind::Edge,
            src_id: self.convert(&rel.src, depth + 1, None),
            dst_id: self.convert(&rel.dst, depth + 1, None),
            edge_name: rel.name.clone(),
            rank: rel.rank,
            properties: self.properties(&rel.properties, depth),
        }
    }

    fn path_record(&self, path: &Path, depth: usize) -> PathRecord {
        let nodes: Vec<VertexRecord> = path.nodes.iter().map(|n| self.vertex_record(n, depth + 1)).collect();
        let relationships = path
            .relationships
            .iter()
            .map(|r| self.edge_record(r, depth + 1))
            .collect();
        let src_id = nodes.first().map(|n| n.vid.clone()).unwrap_or(GenericValue::Null);
        PathRecord {
            kind: ElementKind::Path,
            src_id,
            nodes,
            relationships,
        }
    }
}

/// Suffix repeated column names so every header is unique.
///
/// `["a", "a", "b", "a"]` becomes `["a", "a_1", "b", "a_2"]`.
pub fn unique_headers(columns: &[String]) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    let mut out: Vec<String> = Vec::with_capacity(columns.len());
    for column in columns {
        let count = seen.entry(column.as_str()).or_insert(0);
        if *count == 0 {
            out.push(column.clone());
        } else {
            let mut candidate = format!("{}_{}", column, count);
            while columns.contains(&candidate) || out.contains(&candidate) {
                *count += 1;
                candidate = format!("{}_{}", column, count);
            }
            out.push(candidate);
        }
        *count += 1;
    }
    out
}
