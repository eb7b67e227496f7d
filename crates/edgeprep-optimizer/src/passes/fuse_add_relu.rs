//! Add + ReLU fusion pass.

use super::sole_consumer;
use crate::pass::Pass;
use crate::selector::MobileOptimizerType;
use edgeprep_core::{Result, ScriptModule};
use tracing::debug;

/// Fused operator emitted for `relu(add(a, b))`.
pub const ADD_RELU_OP: &str = "aten::_add_relu";

const ADD_OPS: [&str; 2] = ["aten::add", "aten::add_"];
const RELU_OPS: [&str; 2] = ["aten::relu", "aten::relu_"];

/// Pass that fuses an `add` into the `relu` reading its result.
///
/// The add keeps its inputs and attributes (e.g. `alpha`) and becomes
/// `aten::_add_relu`; the relu is removed and its users read the fused result.
/// The add output must not be used anywhere else, graph outputs included.
pub struct FuseAddReluPass;

impl FuseAddReluPass {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FuseAddReluPass {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for FuseAddReluPass {
    fn kind(&self) -> MobileOptimizerType {
        MobileOptimizerType::FuseAddRelu
    }

    fn run(&self, module: &mut ScriptModule) -> Result<bool> {
        let graph = module.graph_mut();
        let mut fused = 0;

        for add_id in graph.topological_order() {
            // Relus fused earlier in this sweep are gone
            let Ok(add) = graph.node(add_id) else {
                continue;
            };
            if !ADD_OPS.contains(&add.op_type.as_str()) {
                continue;
            }
            let Some(&sum) = add.outputs.first() else {
                continue;
            };
            let Some(relu_id) = sole_consumer(graph, sum) else {
                continue;
            };
            let relu = graph.node(relu_id)?;
            if !RELU_OPS.contains(&relu.op_type.as_str()) {
                continue;
            }
            let Some(&activated) = relu.outputs.first() else {
                continue;
            };

            graph.node_mut(add_id)?.op_type = ADD_RELU_OP.to_string();
            graph.replace_all_uses(activated, sum)?;
            graph.remove_node(relu_id)?;
            fused += 1;
        }

        debug!(fused, "fused add + relu");
        Ok(fused > 0)
    }
}
