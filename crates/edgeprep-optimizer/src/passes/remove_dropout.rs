//! Dropout removal pass.

use crate::pass::Pass;
use crate::selector::MobileOptimizerType;
use edgeprep_core::{Result, ScriptModule};
use tracing::debug;

/// Dropout operators; all are identities at inference time.
pub const DROPOUT_OPS: [&str; 6] = [
    "aten::dropout",
    "aten::dropout_",
    "aten::feature_dropout",
    "aten::feature_dropout_",
    "aten::alpha_dropout",
    "aten::alpha_dropout_",
];

/// Pass that removes dropout operators.
///
/// Every user of a dropout's output is rewired to the dropout's input,
/// including graph outputs, and the dropout node is deleted.
pub struct RemoveDropoutPass;

impl RemoveDropoutPass {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RemoveDropoutPass {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for RemoveDropoutPass {
    fn kind(&self) -> MobileOptimizerType {
        MobileOptimizerType::RemoveDropout
    }

    fn run(&self, module: &mut ScriptModule) -> Result<bool> {
        let graph = module.graph_mut();
        let mut removed = 0;

        for node_id in graph.topological_order() {
            let node = graph.node(node_id)?;
            if !DROPOUT_OPS.contains(&node.op_type.as_str()) {
                continue;
            }
            let (Some(&input), Some(&output)) = (node.inputs.first(), node.outputs.first()) else {
                continue;
            };

            graph.replace_all_uses(output, input)?;
            graph.remove_node(node_id)?;
            removed += 1;
        }

        debug!(removed, "removed dropout operators");
        Ok(removed > 0)
    }
}
