//! DOT graph visualization for module graphs.
//!
//! Generates Graphviz DOT format showing operators, the values flowing
//! between them and the module state (parameters, packed contexts) they read.

use crate::ir::{IrGraph, ValueKind};
use std::fmt::Write;

/// Generate a DOT graph from an IR graph.
///
/// # Example
///
/// ```ignore
/// let dot = to_dot(module.graph());
/// std::fs::write("module.dot", dot)?;
/// // Render with: dot -Tpng module.dot -o module.png
/// ```
pub fn to_dot(graph: &IrGraph) -> String {
    let mut dot = String::new();
    dot.push_str("digraph module_graph {\n");
    dot.push_str("  rankdir=TB;\n");
    dot.push_str("  node [shape=box, style=rounded];\n\n");

    for (position, &input) in graph.inputs.iter().enumerate() {
        if let Ok(value) = graph.value(input) {
            let _ = writeln!(
                dot,
                "  in_{} [label=\"INPUT({})\", shape=ellipse];",
                position,
                escape(&value.name)
            );
        }
    }

    let order = graph.topological_order();
    for (position, &id) in order.iter().enumerate() {
        let Ok(node) = graph.node(id) else { continue };
        let label = if node.name.is_empty() {
            escape(&node.op_type)
        } else {
            format!("{}\\n{}", escape(&node.op_type), escape(&node.name))
        };
        let _ = writeln!(dot, "  op_{} [label=\"{}\"];", id.index(), label);

        for &input in node.inputs() {
            let Ok(value) = graph.value(input) else { continue };
            let source = match (&value.kind, graph.value_producer(input)) {
                (_, Some(producer)) => format!("op_{}", producer.index()),
                (ValueKind::Parameter(name) | ValueKind::Packed(name), None) => {
                    let state = format!("state_{}_{}", position, input.index());
                    let _ = writeln!(
                        dot,
                        "  {} [label=\"{}\", shape=note];",
                        state,
                        escape(name)
                    );
                    state
                }
                (ValueKind::Runtime, None) => match graph.inputs.iter().position(|&i| i == input)
                {
                    Some(index) => format!("in_{}", index),
                    None => continue,
                },
            };
            let _ = writeln!(
                dot,
                "  {} -> op_{} [label=\"{}\"];",
                source,
                id.index(),
                escape(&value.name)
            );
        }
    }

    for (position, &output) in graph.outputs.iter().enumerate() {
        let Ok(value) = graph.value(output) else { continue };
        let _ = writeln!(
            dot,
            "  out_{} [label=\"OUTPUT({})\", shape=ellipse];",
            position,
            escape(&value.name)
        );
        let source = match graph.value_producer(output) {
            Some(producer) => format!("op_{}", producer.index()),
            // Graph inputs returned unchanged
            None => match graph.inputs.iter().position(|&i| i == output) {
                Some(index) => format!("in_{}", index),
                None => continue,
            },
        };
        let _ = writeln!(dot, "  {} -> out_{};", source, position);
    }

    dot.push_str("}\n");
    dot
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;

    #[test]
    fn test_dot_contains_operators_and_state() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("x").unwrap();
        let w = builder.param("fc.weight").unwrap();
        let y = builder.op("aten::linear", &[x, w]).unwrap();
        builder.output(y);

        let dot = to_dot(&builder.finish());
        assert!(dot.starts_with("digraph module_graph {"));
        assert!(dot.contains("aten::linear"));
        assert!(dot.contains("INPUT(x)"));
        assert!(dot.contains("fc.weight"));
        assert!(dot.contains("OUTPUT(%0)"));
    }

    #[test]
    fn test_passthrough_output_is_linked_to_input() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("x").unwrap();
        let y = builder.op("aten::relu", &[x]).unwrap();
        builder.output(y);
        builder.output(x);

        let dot = to_dot(&builder.finish());
        assert!(dot.contains("in_0 -> out_1;"));
        assert!(dot.contains("-> out_0;"));
    }
}
