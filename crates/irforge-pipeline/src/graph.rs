use crate::{PipelineError, RawNode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub const META_NAME: &str = "name";
pub const META_LAYOUT: &str = "layout";
pub const META_IR_VERSION: &str = "ir_version";
pub const META_FRAMEWORK: &str = "fw";
pub const META_CMD_PARAMS: &str = "cmd_params";
pub const META_VARIABLES: &str = "variables_values";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F32,
    F16,
    I32,
    I64,
    Bool,
}

impl ElementType {
    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F16)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::Bool => "bool",
        }
    }
}

impl FromStr for ElementType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "f32" | "float" | "float32" | "dt_float" => Ok(Self::F32),
            "f16" | "half" | "float16" | "dt_half" => Ok(Self::F16),
            "i32" | "int32" | "dt_int32" => Ok(Self::I32),
            "i64" | "int64" | "dt_int64" => Ok(Self::I64),
            "bool" | "dt_bool" => Ok(Self::Bool),
            other => Err(format!("unsupported element type '{other}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorValue {
    pub element_type: ElementType,
    pub shape: Vec<i64>,
    pub data: Vec<f64>,
}

impl TensorValue {
    pub fn new(element_type: ElementType, shape: Vec<i64>, data: Vec<f64>) -> Self {
        Self {
            element_type,
            shape,
            data,
        }
    }

    pub fn element_count(&self) -> usize {
        self.data.len()
    }

    /// Number of elements the shape describes. Fails on a negative
    /// dimension or when the product does not fit in `usize`.
    pub fn shape_element_count(&self) -> Result<usize, String> {
        self.shape.iter().try_fold(1usize, |count, dim| {
            let dim = usize::try_from(*dim)
                .map_err(|_| format!("shape {:?} has negative dimension {dim}", self.shape))?;
            count
                .checked_mul(dim)
                .ok_or_else(|| format!("shape {:?} describes too many elements", self.shape))
        })
    }
}

/// Attribute and metadata value. Serialized untagged so raw model files can
/// spell values naturally; variant order decides how ambiguous JSON decodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<AttrValue>),
    Tensor(TensorValue),
    Map(BTreeMap<String, AttrValue>),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[AttrValue]> {
        match self {
            Self::List(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_i64_list(&self) -> Option<Vec<i64>> {
        self.as_list()?.iter().map(AttrValue::as_i64).collect()
    }

    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Self::Tensor(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, AttrValue>> {
        match self {
            Self::Map(values) => Some(values),
            _ => None,
        }
    }

    pub fn int_list(values: impl IntoIterator<Item = i64>) -> Self {
        Self::List(values.into_iter().map(Self::Integer).collect())
    }

    pub fn to_string_value(&self) -> String {
        match self {
            Self::Boolean(value) => value.to_string(),
            Self::Integer(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::String(value) => value.clone(),
            Self::List(values) => format!(
                "[{}]",
                values
                    .iter()
                    .map(AttrValue::to_string_value)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Self::Tensor(tensor) => format!(
                "tensor<{}>{:?}",
                tensor.element_type.as_str(),
                tensor.shape
            ),
            Self::Map(values) => format!("{{{} keys}}", values.len()),
        }
    }
}

/// Attribute map that remembers which keys an extractor produced, so a
/// re-extraction replaces only those. Keys written by other means are never
/// overwritten by an extractor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    values: BTreeMap<String, AttrValue>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    extracted_keys: BTreeSet<String>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &BTreeMap<String, AttrValue> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn set(&mut self, key: impl Into<String>, value: AttrValue) {
        let key = key.into();
        self.extracted_keys.remove(&key);
        self.values.insert(key, value);
    }

    pub fn set_extracted(&mut self, key: impl Into<String>, value: AttrValue) {
        let key = key.into();
        self.extracted_keys.insert(key.clone());
        self.values.insert(key, value);
    }

    pub fn clear_extracted(&mut self) {
        for key in std::mem::take(&mut self.extracted_keys) {
            self.values.remove(&key);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<AttrValue> {
        self.extracted_keys.remove(key);
        self.values.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(AttrValue::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(AttrValue::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(AttrValue::as_i64)
    }

    pub fn is_extracted(&self, key: &str) -> bool {
        self.extracted_keys.contains(key)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    #[serde(rename = "NHWC")]
    Nhwc,
    #[serde(rename = "NCHW")]
    Nchw,
}

impl Layout {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nhwc => "NHWC",
            Self::Nchw => "NCHW",
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layout {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "NHWC" => Ok(Self::Nhwc),
            "NCHW" => Ok(Self::Nchw),
            other => Err(format!("unknown layout '{other}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    id: String,
    pub op: String,
    pub attrs: Attributes,
    /// Framework node this one was built from; absent for nodes added by passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<RawNode>,
}

impl Node {
    pub fn new(id: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            op: op.into(),
            attrs: Attributes::new(),
            raw: None,
        }
    }

    pub fn from_raw(raw: RawNode) -> Self {
        Self {
            id: raw.name.clone(),
            op: raw.op.clone(),
            attrs: Attributes::new(),
            raw: Some(raw),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Data,
    Control,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub from_port: usize,
    pub to: String,
    pub to_port: usize,
    pub kind: EdgeKind,
}

impl Edge {
    pub fn data(
        from: impl Into<String>,
        from_port: usize,
        to: impl Into<String>,
        to_port: usize,
    ) -> Self {
        Self {
            from: from.into(),
            from_port,
            to: to.into(),
            to_port,
            kind: EdgeKind::Data,
        }
    }

    pub fn control(from: impl Into<String>, to: impl Into<String>, to_port: usize) -> Self {
        Self {
            from: from.into(),
            from_port: 0,
            to: to.into(),
            to_port,
            kind: EdgeKind::Control,
        }
    }

    pub fn is_control(&self) -> bool {
        self.kind == EdgeKind::Control
    }

    pub fn is_data(&self) -> bool {
        self.kind == EdgeKind::Data
    }

    pub fn touches(&self, node_id: &str) -> bool {
        self.from == node_id || self.to == node_id
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EdgeFilter {
    #[default]
    All,
    DataOnly,
}

impl EdgeFilter {
    fn accepts(self, edge: &Edge) -> bool {
        match self {
            Self::All => true,
            Self::DataOnly => edge.is_data(),
        }
    }
}

/// Mutable directed multigraph. Nodes and edges are private so every
/// mutation goes through methods that keep edge endpoints referring to
/// existing nodes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub meta: Attributes,
    nodes: BTreeMap<String, Node>,
    edges: Vec<Edge>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        let mut graph = Self::default();
        graph
            .meta
            .set(META_NAME, AttrValue::String(name.into()));
        graph
    }

    pub fn name(&self) -> Option<&str> {
        self.meta.get_str(META_NAME)
    }

    pub fn layout(&self) -> Option<Layout> {
        self.meta.get_str(META_LAYOUT)?.parse().ok()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(node_id)
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn add_node(&mut self, node: Node) -> Result<&mut Node, PipelineError> {
        if self.nodes.contains_key(&node.id) {
            return Err(PipelineError::DuplicateNode { node_id: node.id });
        }
        let id = node.id.clone();
        Ok(self.nodes.entry(id).or_insert(node))
    }

    pub fn add_edge(&mut self, edge: Edge) -> Result<(), PipelineError> {
        for endpoint in [&edge.from, &edge.to] {
            if !self.nodes.contains_key(endpoint) {
                return Err(PipelineError::UnknownNode {
                    node_id: endpoint.clone(),
                });
            }
        }
        self.edges.push(edge);
        Ok(())
    }

    pub fn connect(
        &mut self,
        from: &str,
        from_port: usize,
        to: &str,
        to_port: usize,
    ) -> Result<(), PipelineError> {
        self.add_edge(Edge::data(from, from_port, to, to_port))
    }

    /// Removes a node together with every edge incident to it.
    pub fn remove_node(&mut self, node_id: &str) -> Result<Node, PipelineError> {
        let node = self
            .nodes
            .remove(node_id)
            .ok_or_else(|| PipelineError::UnknownNode {
                node_id: node_id.to_string(),
            })?;
        self.edges.retain(|edge| !edge.touches(node_id));
        Ok(node)
    }

    /// Removes one occurrence of `edge`; parallel duplicates stay.
    pub fn remove_edge(&mut self, edge: &Edge) -> bool {
        match self.edges.iter().position(|candidate| candidate == edge) {
            Some(index) => {
                self.edges.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn remove_edges_where(&mut self, mut predicate: impl FnMut(&Edge) -> bool) -> usize {
        let before = self.edges.len();
        self.edges.retain(|edge| !predicate(edge));
        before - self.edges.len()
    }

    pub fn rename_node(&mut self, old_id: &str, new_id: &str) -> Result<(), PipelineError> {
        if old_id == new_id {
            return Ok(());
        }
        if self.nodes.contains_key(new_id) {
            return Err(PipelineError::DuplicateNode {
                node_id: new_id.to_string(),
            });
        }
        let mut node = self
            .nodes
            .remove(old_id)
            .ok_or_else(|| PipelineError::UnknownNode {
                node_id: old_id.to_string(),
            })?;
        node.id = new_id.to_string();
        self.nodes.insert(new_id.to_string(), node);

        for edge in &mut self.edges {
            if edge.from == old_id {
                edge.from = new_id.to_string();
            }
            if edge.to == old_id {
                edge.to = new_id.to_string();
            }
        }
        Ok(())
    }

    pub fn incident_edges<'a>(
        &'a self,
        node_id: &'a str,
        filter: EdgeFilter,
    ) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges
            .iter()
            .filter(move |edge| edge.touches(node_id) && filter.accepts(edge))
    }

    pub fn in_edges<'a>(
        &'a self,
        node_id: &'a str,
        filter: EdgeFilter,
    ) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges
            .iter()
            .filter(move |edge| edge.to == node_id && filter.accepts(edge))
    }

    pub fn out_edges<'a>(
        &'a self,
        node_id: &'a str,
        filter: EdgeFilter,
    ) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges
            .iter()
            .filter(move |edge| edge.from == node_id && filter.accepts(edge))
    }

    pub fn check_empty_graph(&self, context: &str) -> Result<(), PipelineError> {
        if self.nodes.is_empty() {
            return Err(PipelineError::EmptyGraph {
                context: context.to_string(),
            });
        }
        Ok(())
    }

    pub fn require_metadata(&self, keys: &[&str]) -> Result<(), PipelineError> {
        for key in keys {
            if !self.meta.contains_key(key) {
                return Err(PipelineError::MissingMetadata {
                    key: (*key).to_string(),
                });
            }
        }
        Ok(())
    }

    /// Deterministic topological order over all edges; ties break by node
    /// id. Nodes caught in cycles are appended in id order.
    pub fn topological_order(&self) -> Vec<String> {
        let mut in_degree: BTreeMap<&str, usize> =
            self.nodes.keys().map(|id| (id.as_str(), 0)).collect();
        for edge in &self.edges {
            if let Some(count) = in_degree.get_mut(edge.to.as_str()) {
                *count += 1;
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut emitted = BTreeSet::new();

        while let Some(node_id) = ready.pop_first() {
            order.push(node_id.to_string());
            emitted.insert(node_id);
            for edge in self.edges.iter().filter(|edge| edge.from == node_id) {
                if let Some(count) = in_degree.get_mut(edge.to.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(edge.to.as_str());
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            order.extend(
                self.nodes
                    .keys()
                    .filter(|id| !emitted.contains(id.as_str()))
                    .cloned(),
            );
        }
        order
    }
}
