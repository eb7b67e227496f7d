//! Intermediate representation for compiled module graphs.
//!
//! The IR is a directed graph where:
//! - **Nodes** (`IrNode`) are operators (e.g., `aten::conv2d`, `aten::relu`)
//! - **Values** (`IrValue`) are the named data flowing between operators
//!
//! A value is either produced at runtime (graph input or operator output) or
//! refers to module state by name: a parameter or a packed parameter context.
//! Rewrite passes splice nodes in and out; consumers are rewired through
//! `replace_all_uses`.

use crate::types::AttributeValue;
use crate::{Error, Result};
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::{EdgeRef, Topo};

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Type alias for IR node identifiers (backed by petgraph NodeIndex).
pub type IrNodeId = NodeIndex;

/// Unique identifier for a value in the IR graph.
///
/// This is an index into the graph's value table. Value IDs stay valid across
/// node removal; values are never removed, only left without consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IrValueId(pub usize);

impl IrValueId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

// ──────────────────────────────── IrGraph ────────────────────────────────

/// Intermediate representation graph.
///
/// Nodes are operators; values are stored in a side-table. petgraph edges
/// exist solely for topological ordering and always mirror the
/// producer/consumer tables.
#[derive(Debug, Clone)]
pub struct IrGraph {
    /// The graph structure (nodes only, no edge data).
    graph: StableGraph<IrNode, ()>,

    /// Value metadata side-table.
    values: Vec<IrValue>,

    /// Lookup table: value name -> value ID.
    value_by_name: HashMap<String, IrValueId>,

    /// Lookup table: value ID -> producing node ID.
    value_producer: HashMap<IrValueId, IrNodeId>,

    /// Lookup table: value ID -> consuming node IDs.
    value_consumers: HashMap<IrValueId, Vec<IrNodeId>>,

    /// Graph input value IDs.
    pub inputs: Vec<IrValueId>,

    /// Graph output value IDs.
    pub outputs: Vec<IrValueId>,
}

impl IrGraph {
    /// Create a new empty IR graph.
    pub fn new() -> Self {
        Self {
            graph: StableGraph::new(),
            values: Vec::new(),
            value_by_name: HashMap::new(),
            value_producer: HashMap::new(),
            value_consumers: HashMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    // ── Node access ──

    /// Get an immutable reference to a node.
    pub fn node(&self, id: IrNodeId) -> Result<&IrNode> {
        self.graph
            .node_weight(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Node {:?} not found", id)))
    }

    /// Get a mutable reference to a node.
    ///
    /// Callers must not edit `inputs`/`outputs` through this reference; use
    /// `set_node_inputs` so the lookup tables stay consistent.
    pub fn node_mut(&mut self, id: IrNodeId) -> Result<&mut IrNode> {
        self.graph
            .node_weight_mut(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Node {:?} not found", id)))
    }

    /// Iterate over all nodes in the graph.
    pub fn nodes(&self) -> impl Iterator<Item = (IrNodeId, &IrNode)> {
        self.graph
            .node_indices()
            .filter_map(|id| self.graph.node_weight(id).map(|node| (id, node)))
    }

    /// Nodes with the given operator type, in topological order.
    pub fn nodes_of_type(&self, op_type: &str) -> Vec<IrNodeId> {
        self.topological_order()
            .into_iter()
            .filter(|&id| {
                self.graph
                    .node_weight(id)
                    .is_some_and(|node| node.op_type == op_type)
            })
            .collect()
    }

    // ── Value access ──

    /// Get an immutable reference to a value.
    pub fn value(&self, id: IrValueId) -> Result<&IrValue> {
        self.values
            .get(id.index())
            .ok_or_else(|| Error::InvalidGraph(format!("Value {:?} not found", id)))
    }

    /// Look up a value by name.
    pub fn value_by_name(&self, name: &str) -> Option<IrValueId> {
        self.value_by_name.get(name).copied()
    }

    /// Get the node that produces a value, if any.
    pub fn value_producer(&self, id: IrValueId) -> Option<IrNodeId> {
        self.value_producer.get(&id).copied()
    }

    /// Get the nodes that consume a value.
    pub fn value_consumers(&self, id: IrValueId) -> Vec<IrNodeId> {
        self.value_consumers.get(&id).cloned().unwrap_or_default()
    }

    /// Check if a value is one of the graph outputs.
    pub fn is_graph_output(&self, id: IrValueId) -> bool {
        self.outputs.contains(&id)
    }

    /// Check if a value is used by anything: a node or the graph outputs.
    pub fn has_uses(&self, id: IrValueId) -> bool {
        self.is_graph_output(id)
            || self
                .value_consumers
                .get(&id)
                .is_some_and(|consumers| !consumers.is_empty())
    }

    // ── Graph mutation ──

    /// Add a new value to the graph and return its ID.
    ///
    /// Value names must be unique; adding a name twice is an error.
    pub fn add_value(&mut self, value: IrValue) -> Result<IrValueId> {
        if self.value_by_name.contains_key(&value.name) {
            return Err(Error::InvalidGraph(format!(
                "Value '{}' already exists",
                value.name
            )));
        }
        let id = IrValueId::new(self.values.len());
        self.value_by_name.insert(value.name.clone(), id);
        self.values.push(value);
        Ok(id)
    }

    /// Return a value name derived from `base` that is not used yet.
    pub fn unique_value_name(&self, base: &str) -> String {
        if !self.value_by_name.contains_key(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{}.{}", base, i))
            .find(|candidate| !self.value_by_name.contains_key(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    /// Get the value referring to a module parameter, creating it if needed.
    pub fn parameter_value(&mut self, parameter: &str) -> Result<IrValueId> {
        self.state_value(ValueKind::Parameter(parameter.to_string()))
    }

    /// Get the value referring to a packed context, creating it if needed.
    pub fn packed_value(&mut self, packed: &str) -> Result<IrValueId> {
        self.state_value(ValueKind::Packed(packed.to_string()))
    }

    fn state_value(&mut self, kind: ValueKind) -> Result<IrValueId> {
        if let Some(index) = self.values.iter().position(|v| v.kind == kind) {
            return Ok(IrValueId::new(index));
        }
        let base = match &kind {
            ValueKind::Parameter(name) => format!("self.{}", name),
            ValueKind::Packed(name) => format!("self.{}", name),
            ValueKind::Runtime => "value".to_string(),
        };
        let name = self.unique_value_name(&base);
        self.add_value(IrValue { name, kind })
    }

    /// Add a new node to the graph and return its ID.
    ///
    /// This also updates the producer/consumer lookup tables and adds petgraph
    /// edges for topological ordering. Every input must already be produced
    /// (or be a graph input / module state value); a value may only have one
    /// producer.
    pub fn add_node(&mut self, mut node: IrNode) -> Result<IrNodeId> {
        for &id in node.inputs.iter().chain(node.outputs.iter()) {
            self.value(id)?;
        }
        for &output_id in &node.outputs {
            if self.value_producer.contains_key(&output_id) {
                return Err(Error::InvalidGraph(format!(
                    "Value '{}' already has a producer",
                    self.values[output_id.index()].name
                )));
            }
        }

        let node_id = self.graph.add_node(IrNode::new(String::new()));
        node.node_index = node_id;

        // Register producer/consumer relationships
        for &output_id in &node.outputs {
            self.value_producer.insert(output_id, node_id);
            // Consumers added before this producer existed
            for consumer in self.value_consumers(output_id) {
                self.graph.add_edge(node_id, consumer, ());
            }
        }

        for &input_id in &node.inputs {
            self.value_consumers
                .entry(input_id)
                .or_default()
                .push(node_id);

            // Add petgraph edge for topological ordering
            if let Some(&producer_id) = self.value_producer.get(&input_id) {
                self.graph.add_edge(producer_id, node_id, ());
            }
        }

        // Replace the placeholder with the real node
        if let Some(slot) = self.graph.node_weight_mut(node_id) {
            *slot = node;
        }

        Ok(node_id)
    }

    /// Remove a node from the graph.
    ///
    /// This also removes the node from producer/consumer lookup tables. With
    /// `StableGraph`, other node indices remain valid.
    pub fn remove_node(&mut self, id: IrNodeId) -> Result<IrNode> {
        let node = self.node(id)?.clone();

        for &output_id in &node.outputs {
            self.value_producer.remove(&output_id);
        }

        for &input_id in &node.inputs {
            if let Some(consumers) = self.value_consumers.get_mut(&input_id) {
                consumers.retain(|&c| c != id);
            }
        }

        // Removing the node drops its petgraph edges too
        self.graph.remove_node(id);

        Ok(node)
    }

    /// Replace a node's inputs, keeping the lookup tables and ordering edges
    /// consistent.
    pub fn set_node_inputs(&mut self, id: IrNodeId, inputs: Vec<IrValueId>) -> Result<()> {
        for &input in &inputs {
            self.value(input)?;
        }
        let old_inputs = self.node(id)?.inputs.clone();

        for input_id in &old_inputs {
            if let Some(consumers) = self.value_consumers.get_mut(input_id) {
                if let Some(pos) = consumers.iter().position(|&c| c == id) {
                    consumers.remove(pos);
                }
            }
        }
        for &input_id in &inputs {
            self.value_consumers.entry(input_id).or_default().push(id);
        }

        self.node_mut(id)?.inputs = inputs;
        self.reconnect(id);
        Ok(())
    }

    /// Point every consumer of `old` (and the graph outputs) at `new`.
    ///
    /// Returns the number of uses that were rewired.
    pub fn replace_all_uses(&mut self, old: IrValueId, new: IrValueId) -> Result<usize> {
        self.value(old)?;
        self.value(new)?;
        if old == new {
            return Ok(0);
        }

        let mut rewired = 0;
        let consumers = self.value_consumers.remove(&old).unwrap_or_default();
        for &consumer in &consumers {
            let node = self.node_mut(consumer)?;
            for input in node.inputs.iter_mut().filter(|input| **input == old) {
                *input = new;
                rewired += 1;
            }
        }

        let mut unique = consumers;
        unique.sort();
        unique.dedup();
        for consumer in unique {
            let uses = self
                .node(consumer)?
                .inputs
                .iter()
                .filter(|&&input| input == new)
                .count();
            let entry = self.value_consumers.entry(new).or_default();
            let existing = entry.iter().filter(|&&c| c == consumer).count();
            for _ in existing..uses {
                entry.push(consumer);
            }
            self.reconnect(consumer);
        }

        for output in self.outputs.iter_mut().filter(|output| **output == old) {
            *output = new;
            rewired += 1;
        }

        Ok(rewired)
    }

    /// Rebuild the incoming ordering edges of a node from its inputs.
    fn reconnect(&mut self, id: IrNodeId) {
        let incoming: Vec<_> = self
            .graph
            .edges_directed(id, Direction::Incoming)
            .map(|edge| edge.id())
            .collect();
        for edge in incoming {
            self.graph.remove_edge(edge);
        }

        let producers: BTreeSet<IrNodeId> = self
            .graph
            .node_weight(id)
            .map(|node| {
                node.inputs
                    .iter()
                    .filter_map(|input| self.value_producer.get(input).copied())
                    .collect()
            })
            .unwrap_or_default();
        for producer in producers {
            self.graph.add_edge(producer, id, ());
        }
    }

    // ── Graph queries ──

    /// Get the topological order of nodes in the graph.
    ///
    /// Returns nodes in an order such that all inputs to a node are produced
    /// before the node itself.
    pub fn topological_order(&self) -> Vec<IrNodeId> {
        let mut topo = Topo::new(&self.graph);
        let mut order = Vec::new();

        while let Some(id) = topo.next(&self.graph) {
            if self.graph.node_weight(id).is_some() {
                order.push(id);
            }
        }

        order
    }

    /// Get the number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of values in the graph.
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Distinct operator types referenced by the graph.
    pub fn op_types(&self) -> BTreeSet<String> {
        self.nodes().map(|(_, node)| node.op_type.clone()).collect()
    }

    /// Names of module parameters consumed by nodes or returned as outputs.
    pub fn referenced_parameters(&self) -> BTreeSet<String> {
        self.referenced_state(|kind| match kind {
            ValueKind::Parameter(name) => Some(name),
            _ => None,
        })
    }

    /// Names of packed contexts consumed by nodes or returned as outputs.
    pub fn referenced_packed(&self) -> BTreeSet<String> {
        self.referenced_state(|kind| match kind {
            ValueKind::Packed(name) => Some(name),
            _ => None,
        })
    }

    fn referenced_state<'a>(
        &'a self,
        select: impl Fn(&'a ValueKind) -> Option<&'a String>,
    ) -> BTreeSet<String> {
        self.values
            .iter()
            .enumerate()
            .filter(|(index, _)| self.has_uses(IrValueId::new(*index)))
            .filter_map(|(_, value)| select(&value.kind).cloned())
            .collect()
    }

    /// Structural snapshot of the graph in topological order.
    ///
    /// Two graphs with equal topology have the same operators, attributes and
    /// value wiring, regardless of how their node indices were allocated.
    pub fn topology(&self) -> Vec<NodeSignature> {
        let name_of = |id: &IrValueId| {
            self.values
                .get(id.index())
                .map(|v| v.name.clone())
                .unwrap_or_default()
        };
        let mut signature: Vec<NodeSignature> = self
            .topological_order()
            .into_iter()
            .filter_map(|id| self.graph.node_weight(id))
            .map(|node| NodeSignature {
                op_type: node.op_type.clone(),
                inputs: node.inputs.iter().map(name_of).collect(),
                outputs: node.outputs.iter().map(name_of).collect(),
                attributes: node.attributes.clone(),
            })
            .collect();
        signature.push(NodeSignature {
            op_type: "return".to_string(),
            inputs: self.outputs.iter().map(name_of).collect(),
            outputs: self.inputs.iter().map(name_of).collect(),
            attributes: BTreeMap::new(),
        });
        signature
    }

    /// Find a node by its name.
    ///
    /// # Errors
    ///
    /// Returns an error if no node with the given name exists.
    pub fn find_node_by_name(&self, name: &str) -> Result<IrNodeId> {
        self.nodes()
            .find(|(_, node)| node.name == name)
            .map(|(id, _)| id)
            .ok_or_else(|| Error::InvalidGraph(format!("Node '{}' not found", name)))
    }
}

impl Default for IrGraph {
    fn default() -> Self {
        Self::new()
    }
}

// ──────────────────────────────── IrNode ─────────────────────────────────

/// A node in the IR graph: an operator application.
#[derive(Debug, Clone)]
pub struct IrNode {
    /// Node name (may be empty).
    pub name: String,

    /// Operator type in `namespace::name` form (e.g., "aten::conv2d").
    pub op_type: String,

    /// Operator attributes (e.g., stride, eps, clamp bounds).
    pub attributes: BTreeMap<String, AttributeValue>,

    /// Input value IDs.
    pub inputs: Vec<IrValueId>,

    /// Output value IDs.
    pub outputs: Vec<IrValueId>,

    /// The graph node index.
    pub node_index: IrNodeId,
}

impl IrNode {
    /// Create a new operator node.
    pub fn new(op_type: String) -> Self {
        Self {
            name: String::new(),
            op_type,
            attributes: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            node_index: NodeIndex::default(),
        }
    }

    /// Get the operator type.
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn inputs(&self) -> &[IrValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[IrValueId] {
        &self.outputs
    }

    pub fn add_input(&mut self, value_id: IrValueId) {
        self.inputs.push(value_id);
    }

    pub fn add_output(&mut self, value_id: IrValueId) {
        self.outputs.push(value_id);
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: AttributeValue) {
        self.attributes.insert(key.into(), value);
    }

    pub fn get_attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }
}

// ──────────────────────────────── IrValue ────────────────────────────────

/// Where a value's data comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    /// Produced at runtime: a graph input or an operator output.
    Runtime,

    /// The module parameter with this name.
    Parameter(String),

    /// The packed parameter context with this name.
    Packed(String),
}

/// A named value flowing between operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrValue {
    /// Value name (unique within the graph).
    pub name: String,

    pub kind: ValueKind,
}

impl IrValue {
    /// Create a runtime value.
    pub fn runtime(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ValueKind::Runtime,
        }
    }

    /// The parameter name, if this value refers to one.
    pub fn parameter_name(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::Parameter(name) => Some(name),
            _ => None,
        }
    }

    /// The packed context name, if this value refers to one.
    pub fn packed_name(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::Packed(name) => Some(name),
            _ => None,
        }
    }
}

/// One entry of `IrGraph::topology()`.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSignature {
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: BTreeMap<String, AttributeValue>,
}
