// Graph intermediate representation
//
// An export graph is an ordered list of nodes over named tensors. The node
// order is always a valid execution order: `add_node` refuses a node whose
// inputs are not yet available, and every pass preserves the property. A
// petgraph view is built on demand for whole-graph DAG validation.

use super::ops::OpKind;
use super::shape::{concrete_dims, Shape, SymbolTable};
use super::tensor::{DataType, TensorData};
use crate::{ExportError, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute value attached to a node
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    String(String),
    Tensor(TensorData),
}

/// An operator instance
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub op: OpKind,
    /// Input tensor names; an empty name marks an omitted optional input
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: BTreeMap<String, AttrValue>,
}

impl Node {
    pub fn new(name: impl Into<String>, op: OpKind) -> Self {
        Self {
            name: name.into(),
            op,
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_inputs<S: AsRef<str>>(mut self, inputs: &[S]) -> Self {
        self.inputs = inputs.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_outputs<S: AsRef<str>>(mut self, outputs: &[S]) -> Self {
        self.outputs = outputs.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_attr(mut self, name: &str, value: AttrValue) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }

    pub fn attr_int(&self, name: &str) -> Option<i64> {
        match self.attributes.get(name) {
            Some(AttrValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn attr_int_or(&self, name: &str, default: i64) -> i64 {
        self.attr_int(name).unwrap_or(default)
    }

    pub fn attr_ints(&self, name: &str) -> Option<&[i64]> {
        match self.attributes.get(name) {
            Some(AttrValue::Ints(v)) => Some(v),
            _ => None,
        }
    }

    pub fn attr_float(&self, name: &str) -> Option<f32> {
        match self.attributes.get(name) {
            Some(AttrValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn attr_string(&self, name: &str) -> Option<&str> {
        match self.attributes.get(name) {
            Some(AttrValue::String(v)) => Some(v),
            _ => None,
        }
    }

    pub fn attr_tensor(&self, name: &str) -> Option<&TensorData> {
        match self.attributes.get(name) {
            Some(AttrValue::Tensor(v)) => Some(v),
            _ => None,
        }
    }

    /// Input name at `slot`, or `None` if absent or omitted
    pub fn input(&self, slot: usize) -> Option<&str> {
        self.inputs.get(slot).map(String::as_str).filter(|s| !s.is_empty())
    }
}

/// Metadata of a tensor (no data)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorInfo {
    /// Element type; `None` until shape binding resolves it
    pub dtype: Option<DataType>,
    /// Shape; `None` until shape binding resolves it
    pub shape: Option<Shape>,
}

impl TensorInfo {
    pub fn new(dtype: DataType, shape: Shape) -> Self {
        Self {
            dtype: Some(dtype),
            shape: Some(shape),
        }
    }
}

/// Detection export graph
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    pub name: String,
    nodes: Vec<Node>,
    tensors: FxHashMap<String, TensorInfo>,
    initializers: BTreeMap<String, TensorData>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    /// Symbolic dimensions referenced by tensor shapes
    pub symbols: SymbolTable,
    /// String properties written to the artifact
    pub metadata: BTreeMap<String, String>,
}

impl Graph {
    /// Create a new empty graph
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Declare a graph input
    pub fn add_input(&mut self, name: &str, dtype: DataType, shape: Shape) -> Result<()> {
        if self.tensors.contains_key(name) {
            return Err(ExportError::InvalidModel(format!("duplicate tensor '{}'", name)));
        }
        self.inputs.push(name.to_string());
        self.tensors.insert(name.to_string(), TensorInfo::new(dtype, shape));
        Ok(())
    }

    /// Add a constant tensor; returns its name
    pub fn add_initializer(&mut self, name: &str, data: TensorData) -> Result<String> {
        if self.tensors.contains_key(name) {
            return Err(ExportError::InvalidModel(format!("duplicate tensor '{}'", name)));
        }
        self.set_initializer(name, data);
        Ok(name.to_string())
    }

    /// Insert or replace a constant tensor
    pub(crate) fn set_initializer(&mut self, name: &str, data: TensorData) {
        let info = TensorInfo::new(data.dtype(), data.dims().into_iter().map(Into::into).collect());
        self.tensors.insert(name.to_string(), info);
        self.initializers.insert(name.to_string(), data);
    }

    pub(crate) fn remove_initializer(&mut self, name: &str) -> Option<TensorData> {
        let removed = self.initializers.remove(name);
        if removed.is_some() {
            self.tensors.remove(name);
        }
        removed
    }

    /// Append a node; all of its inputs must already be available
    pub fn add_node(&mut self, node: Node) -> Result<()> {
        for input in node.inputs.iter().filter(|i| !i.is_empty()) {
            if !self.tensors.contains_key(input) {
                return Err(ExportError::InvalidModel(format!(
                    "node '{}' consumes '{}' before it is produced",
                    node.name, input
                )));
            }
        }
        for output in &node.outputs {
            if self.tensors.contains_key(output) {
                return Err(ExportError::InvalidModel(format!(
                    "node '{}' redefines tensor '{}'",
                    node.name, output
                )));
            }
        }
        for output in &node.outputs {
            self.tensors.insert(output.clone(), TensorInfo::default());
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Mark a tensor as a graph output
    pub fn add_output(&mut self, name: &str) -> Result<()> {
        if !self.tensors.contains_key(name) {
            return Err(ExportError::InvalidModel(format!("unknown graph output '{}'", name)));
        }
        if !self.outputs.iter().any(|o| o == name) {
            self.outputs.push(name.to_string());
        }
        Ok(())
    }

    /// Replace the graph output list
    pub fn set_outputs(&mut self, outputs: Vec<String>) -> Result<()> {
        self.outputs.clear();
        for output in outputs {
            self.add_output(&output)?;
        }
        Ok(())
    }

    /// A tensor name not used anywhere in the graph, derived from `base`
    pub fn unique_name(&self, base: &str) -> String {
        if !self.tensors.contains_key(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{}_{}", base, i))
            .find(|candidate| !self.tensors.contains_key(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn initializers(&self) -> &BTreeMap<String, TensorData> {
        &self.initializers
    }

    pub fn initializer(&self, name: &str) -> Option<&TensorData> {
        self.initializers.get(name)
    }

    pub fn is_initializer(&self, name: &str) -> bool {
        self.initializers.contains_key(name)
    }

    pub fn is_graph_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|i| i == name)
    }

    pub fn is_graph_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o == name)
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.get(name)
    }

    pub fn tensors(&self) -> &FxHashMap<String, TensorInfo> {
        &self.tensors
    }

    pub fn tensor_shape(&self, name: &str) -> Option<&Shape> {
        self.tensors.get(name).and_then(|t| t.shape.as_ref())
    }

    /// Fully concrete dims of a tensor, if known
    pub fn concrete_shape(&self, name: &str) -> Option<Vec<i64>> {
        self.tensor_shape(name).and_then(|s| concrete_dims(s))
    }

    pub(crate) fn set_tensor_info(&mut self, name: &str, info: TensorInfo) {
        self.tensors.insert(name.to_string(), info);
    }

    /// Map from tensor name to the index of its producing node
    pub fn producer_index(&self) -> FxHashMap<&str, usize> {
        let mut producers = FxHashMap::default();
        for (idx, node) in self.nodes.iter().enumerate() {
            for output in &node.outputs {
                producers.insert(output.as_str(), idx);
            }
        }
        producers
    }

    /// Indices of nodes that read `tensor`
    pub fn consumers(&self, tensor: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.inputs.iter().any(|i| i == tensor))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Number of reads of `tensor`, counting graph outputs
    pub fn use_count(&self, tensor: &str) -> usize {
        let node_uses: usize = self
            .nodes
            .iter()
            .map(|n| n.inputs.iter().filter(|i| *i == tensor).count())
            .sum();
        node_uses + usize::from(self.is_graph_output(tensor))
    }

    // ------------------------------------------------------------------
    // Rewriting (used by passes)
    // ------------------------------------------------------------------

    /// Replace the node at `index` in place
    pub(crate) fn replace_node(&mut self, index: usize, node: Node) {
        for output in &node.outputs {
            self.tensors.entry(output.clone()).or_default();
        }
        self.nodes[index] = node;
    }

    /// Remove the nodes at the given indices, dropping metadata of tensors
    /// that no longer have a producer
    pub(crate) fn remove_nodes(&mut self, indices: &FxHashSet<usize>) {
        if indices.is_empty() {
            return;
        }
        let mut removed_outputs = Vec::new();
        let mut idx = 0;
        self.nodes.retain(|node| {
            let keep = !indices.contains(&idx);
            if !keep {
                removed_outputs.extend(node.outputs.iter().cloned());
            }
            idx += 1;
            keep
        });
        for output in removed_outputs {
            let still_defined = self.initializers.contains_key(&output)
                || self.nodes.iter().any(|n| n.outputs.contains(&output));
            if !still_defined {
                self.tensors.remove(&output);
            }
        }
    }

    /// Rewire every node that reads `old` to read `new` instead
    pub(crate) fn replace_all_uses(&mut self, old: &str, new: &str) {
        for node in &mut self.nodes {
            for input in &mut node.inputs {
                if input == old {
                    *input = new.to_string();
                }
            }
        }
    }

    /// Drop tensor metadata for names that are neither inputs, initializers
    /// nor node outputs
    pub(crate) fn prune_tensor_infos(&mut self) -> usize {
        let mut live: FxHashSet<String> = self.inputs.iter().cloned().collect();
        live.extend(self.initializers.keys().cloned());
        for node in &self.nodes {
            live.extend(node.outputs.iter().cloned());
        }
        let before = self.tensors.len();
        self.tensors.retain(|name, _| live.contains(name));
        before - self.tensors.len()
    }

    // ------------------------------------------------------------------
    // Validation and statistics
    // ------------------------------------------------------------------

    /// Producer→consumer dependency graph over node indices
    pub fn dependency_graph(&self) -> DiGraph<usize, String> {
        let mut dag = DiGraph::new();
        let ids: Vec<NodeIndex> = (0..self.nodes.len()).map(|i| dag.add_node(i)).collect();
        let producers = self.producer_index();
        for (consumer, node) in self.nodes.iter().enumerate() {
            for input in node.inputs.iter().filter(|i| !i.is_empty()) {
                if let Some(&producer) = producers.get(input.as_str()) {
                    dag.add_edge(ids[producer], ids[consumer], input.clone());
                }
            }
        }
        dag
    }

    /// Check the DAG invariant; returns a description of the first violation
    pub fn validate_dag(&self) -> std::result::Result<(), String> {
        let dag = self.dependency_graph();
        if let Err(cycle) = toposort(&dag, None) {
            let idx = dag[cycle.node_id()];
            return Err(format!("node '{}' is part of a cycle", self.nodes[idx].name));
        }

        let mut available: FxHashSet<&str> = self.inputs.iter().map(String::as_str).collect();
        available.extend(self.initializers.keys().map(String::as_str));
        for node in &self.nodes {
            for input in node.inputs.iter().filter(|i| !i.is_empty()) {
                if !available.contains(input.as_str()) {
                    return Err(format!(
                        "tensor '{}' is consumed by '{}' before it is produced",
                        input, node.name
                    ));
                }
            }
            for output in &node.outputs {
                if !available.insert(output.as_str()) {
                    return Err(format!("tensor '{}' has more than one producer", output));
                }
            }
        }
        for output in &self.outputs {
            if !available.contains(output.as_str()) {
                return Err(format!("graph output '{}' is never produced", output));
            }
        }
        Ok(())
    }

    /// Count nodes per operator kind
    pub fn op_histogram(&self) -> BTreeMap<&'static str, usize> {
        let mut histogram = BTreeMap::new();
        for node in &self.nodes {
            *histogram.entry(node.op.as_str()).or_insert(0) += 1;
        }
        histogram
    }

    pub fn statistics(&self) -> GraphStatistics {
        GraphStatistics {
            total_nodes: self.nodes.len(),
            total_edges: self.dependency_graph().edge_count(),
            initializers: self.initializers.len(),
            parameters: self.initializers.values().map(TensorData::len).sum(),
        }
    }
}

/// Size summary of a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphStatistics {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub initializers: usize,
    pub parameters: usize,
}

impl fmt::Display for GraphStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} nodes, {} edges, {} initializers ({} parameters)",
            self.total_nodes, self.total_edges, self.initializers, self.parameters
        )
    }
}
