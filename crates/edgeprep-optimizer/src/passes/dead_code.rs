//! Dead code elimination pass.

use crate::pass::Pass;
use crate::selector::MobileOptimizerType;
use edgeprep_core::{Result, ScriptModule};
use tracing::debug;

/// Operators kept even when their results are unused.
pub const SIDE_EFFECT_OPS: [&str; 3] = ["prim::Print", "prim::RaiseException", "aten::warn"];

/// Pass that removes operators whose results never reach a graph output.
///
/// Nodes are visited in reverse topological order so a whole dead chain goes
/// in one sweep. Afterwards parameters and packed contexts no remaining node
/// reads are dropped from the module.
pub struct DeadCodeEliminationPass;

impl DeadCodeEliminationPass {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DeadCodeEliminationPass {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for DeadCodeEliminationPass {
    fn kind(&self) -> MobileOptimizerType {
        MobileOptimizerType::DeadCodeElimination
    }

    fn run(&self, module: &mut ScriptModule) -> Result<bool> {
        let graph = module.graph_mut();
        let mut removed_nodes = 0;

        for node_id in graph.topological_order().into_iter().rev() {
            let node = graph.node(node_id)?;
            if SIDE_EFFECT_OPS.contains(&node.op_type.as_str()) {
                continue;
            }
            if node.outputs.iter().any(|&output| graph.has_uses(output)) {
                continue;
            }
            graph.remove_node(node_id)?;
            removed_nodes += 1;
        }

        let live_parameters = graph.referenced_parameters();
        let live_packed = graph.referenced_packed();

        let parameters_before = module.parameters().len();
        module
            .parameters_mut()
            .retain(|name, _| live_parameters.contains(name));
        let removed_parameters = parameters_before - module.parameters().len();

        let packed_before = module.packed_params().len();
        module
            .packed_params_mut()
            .retain(|name, _| live_packed.contains(name));
        let removed_packed = packed_before - module.packed_params().len();

        debug!(
            removed_nodes,
            removed_parameters,
            removed_packed,
            "eliminated dead code"
        );
        Ok(removed_nodes + removed_parameters + removed_packed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::test_util::params;
    use edgeprep_core::{GraphBuilder, ParameterStore};

    #[test]
    fn test_removes_dead_chain_and_state() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("x").unwrap();
        let w = builder.param("live.weight").unwrap();
        let dead_w = builder.param("dead.weight").unwrap();
        let y = builder.op("aten::linear", &[x, w]).unwrap();
        let d1 = builder.op("aten::linear", &[x, dead_w]).unwrap();
        builder.op("aten::relu", &[d1]).unwrap();
        builder.output(y);
        let store = params(&[
            ("live.weight", vec![2, 2], 1.0),
            ("dead.weight", vec![2, 2], 1.0),
            ("unused", vec![1], 0.0),
        ]);
        let mut module = ScriptModule::new("m", builder.finish(), store);

        assert!(DeadCodeEliminationPass::new().run(&mut module).unwrap());

        assert_eq!(module.graph().node_count(), 1);
        let names: Vec<_> = module.parameters().names().collect();
        assert_eq!(names, vec!["live.weight"]);
    }

    #[test]
    fn test_keeps_side_effects() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("x").unwrap();
        builder.op("prim::Print", &[x]).unwrap();
        let y = builder.op("aten::relu", &[x]).unwrap();
        builder.output(y);
        let mut module = ScriptModule::new("m", builder.finish(), ParameterStore::new());

        assert!(!DeadCodeEliminationPass::new().run(&mut module).unwrap());
        assert!(module.operator_names().contains("prim::Print"));
    }

    #[test]
    fn test_live_graph_is_unchanged() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("x").unwrap();
        let a = builder.op("aten::relu", &[x]).unwrap();
        let b = builder.op("aten::tanh", &[a]).unwrap();
        builder.output(b);
        let mut module = ScriptModule::new("m", builder.finish(), ParameterStore::new());
        let before = module.graph().topology();

        assert!(!DeadCodeEliminationPass::new().run(&mut module).unwrap());
        assert_eq!(module.graph().topology(), before);
    }
}
