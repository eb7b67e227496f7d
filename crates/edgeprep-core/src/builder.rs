//! Build IR graphs operator by operator.

use crate::ir::{IrGraph, IrNode, IrValue, IrValueId};
use crate::types::AttributeValue;
use crate::Result;

/// Incremental graph construction.
///
/// Operator outputs get TorchScript-style names (`%0`, `%1`, ...). Parameters
/// are referenced by name and resolved against the module's parameter store.
///
/// # Example
///
/// ```
/// use edgeprep_core::{AttributeValue, GraphBuilder};
///
/// # fn main() -> edgeprep_core::Result<()> {
/// let mut builder = GraphBuilder::new();
/// let x = builder.input("x")?;
/// let w = builder.param("fc.weight")?;
/// let y = builder.op("aten::linear", &[x, w])?;
/// let z = builder.op_with("aten::dropout", &[y], [("p", AttributeValue::Float(0.5))])?;
/// builder.output(z);
/// let graph = builder.finish();
/// assert_eq!(graph.node_count(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: IrGraph,
    next_value: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a graph input.
    pub fn input(&mut self, name: &str) -> Result<IrValueId> {
        let id = self.graph.add_value(IrValue::runtime(name))?;
        self.graph.inputs.push(id);
        Ok(id)
    }

    /// Reference a module parameter.
    pub fn param(&mut self, name: &str) -> Result<IrValueId> {
        self.graph.parameter_value(name)
    }

    /// Append a single-output operator without attributes.
    pub fn op(&mut self, op_type: &str, inputs: &[IrValueId]) -> Result<IrValueId> {
        self.op_with(op_type, inputs, Vec::<(&str, AttributeValue)>::new())
    }

    /// Append a single-output operator with attributes.
    pub fn op_with<'a>(
        &mut self,
        op_type: &str,
        inputs: &[IrValueId],
        attributes: impl IntoIterator<Item = (&'a str, AttributeValue)>,
    ) -> Result<IrValueId> {
        let name = self.graph.unique_value_name(&format!("%{}", self.next_value));
        self.next_value += 1;
        let output = self.graph.add_value(IrValue::runtime(name))?;

        let mut node = IrNode::new(op_type.to_string());
        for &input in inputs {
            node.add_input(input);
        }
        node.add_output(output);
        for (key, value) in attributes {
            node.set_attribute(key, value);
        }
        self.graph.add_node(node)?;

        Ok(output)
    }

    /// Mark a value as a graph output.
    pub fn output(&mut self, value: IrValueId) {
        self.graph.outputs.push(value);
    }

    pub fn finish(self) -> IrGraph {
        self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_names_outputs() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("x").unwrap();
        let a = builder.op("aten::relu", &[x]).unwrap();
        let b = builder.op("aten::tanh", &[a]).unwrap();
        builder.output(b);
        let graph = builder.finish();

        assert_eq!(graph.value(a).unwrap().name, "%0");
        assert_eq!(graph.value(b).unwrap().name, "%1");
        assert_eq!(graph.inputs, vec![x]);
        assert_eq!(graph.outputs, vec![b]);
    }

    #[test]
    fn test_builder_attributes() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("x").unwrap();
        let y = builder
            .op_with("aten::batch_norm", &[x], [("eps", AttributeValue::Float(1e-5))])
            .unwrap();
        let graph = builder.finish();

        let node = graph.value_producer(y).unwrap();
        assert_eq!(
            graph.node(node).unwrap().get_attribute("eps"),
            Some(&AttributeValue::Float(1e-5))
        );
    }

    #[test]
    fn test_builder_unknown_input_fails() {
        let mut builder = GraphBuilder::new();
        assert!(builder.op("aten::relu", &[IrValueId::new(7)]).is_err());
    }
}
