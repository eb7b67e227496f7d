//! Prepacked mobile kernel insertion.
//!
//! `aten::conv2d` and `aten::linear` nodes whose weights are module parameters
//! are rewritten to the prepacked run operators. The weights are packed once,
//! here, into a packed context stored on the module, so the packing work is
//! folded out of the runtime graph. A trailing `relu` or `hardtanh` that only
//! reads the result is absorbed into the run operator's clamp bounds.

use super::{parameter_input, sole_consumer};
use crate::pass::Pass;
use crate::selector::MobileOptimizerType;
use edgeprep_core::{
    AttributeValue, IrGraph, IrNodeId, PackedOp, PackedParams, Result, ScriptModule,
};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Attribute holding the lower clamp bound of a prepacked run operator.
pub const OUTPUT_MIN: &str = "output_min";

/// Attribute holding the upper clamp bound of a prepacked run operator.
pub const OUTPUT_MAX: &str = "output_max";

const RELU_OPS: [&str; 2] = ["aten::relu", "aten::relu_"];
const HARDTANH_OPS: [&str; 2] = ["aten::hardtanh", "aten::hardtanh_"];

/// Pass that replaces convolutions and linear layers with prepacked kernels.
pub struct InsertFoldPrepackOpsPass;

impl InsertFoldPrepackOpsPass {
    pub fn new() -> Self {
        Self
    }

    /// Pack the weights of `node_id` and rewrite it to the run operator.
    ///
    /// Returns false if the node's weights are not module parameters.
    fn prepack_node(&self, module: &mut ScriptModule, node_id: IrNodeId, op: PackedOp) -> Result<bool> {
        let node = module.graph().node(node_id)?.clone();
        let Some(&input) = node.inputs.first() else {
            return Ok(false);
        };
        let Some(weight_name) = parameter_input(module.graph(), &node, 1) else {
            trace!(node = ?node_id, "weight is not a parameter");
            return Ok(false);
        };
        let Some(weight) = module.parameters().get(&weight_name).map(|p| p.value.clone()) else {
            return Ok(false);
        };
        let bias = match node.inputs.len() {
            2 => None,
            3 => {
                let bias = parameter_input(module.graph(), &node, 2)
                    .and_then(|name| module.parameters().get(&name))
                    .map(|p| p.value.clone());
                match bias {
                    Some(bias) => Some(bias),
                    None => {
                        trace!(node = ?node_id, "bias is not a parameter");
                        return Ok(false);
                    }
                }
            }
            _ => return Ok(false),
        };

        let packed_name = unique_packed_name(module.packed_params(), &weight_name);
        module.packed_params_mut().insert(
            packed_name.clone(),
            PackedParams {
                op,
                weight,
                bias,
                attributes: node.attributes.clone(),
            },
        );

        let graph = module.graph_mut();
        let context = graph.packed_value(&packed_name)?;
        graph.set_node_inputs(node_id, vec![input, context])?;
        let run = graph.node_mut(node_id)?;
        run.op_type = op.run_op_type().to_string();
        run.attributes = BTreeMap::new();

        fuse_clamp(graph, node_id)?;
        Ok(true)
    }
}

impl Default for InsertFoldPrepackOpsPass {
    fn default() -> Self {
        Self::new()
    }
}

fn unique_packed_name(existing: &BTreeMap<String, PackedParams>, weight_name: &str) -> String {
    let base = format!("{}_packed", weight_name);
    if !existing.contains_key(&base) {
        return base;
    }
    (1..)
        .map(|i| format!("{}_{}", base, i))
        .find(|candidate| !existing.contains_key(candidate))
        .unwrap_or(base)
}

/// Absorb an exclusive trailing relu/hardtanh into the run operator's clamp.
fn fuse_clamp(graph: &mut IrGraph, run_id: IrNodeId) -> Result<bool> {
    let Some(&output) = graph.node(run_id)?.outputs.first() else {
        return Ok(false);
    };
    let Some(clamp_id) = sole_consumer(graph, output) else {
        return Ok(false);
    };
    let clamp = graph.node(clamp_id)?.clone();

    let (min, max) = if RELU_OPS.contains(&clamp.op_type.as_str()) {
        (0.0, None)
    } else if HARDTANH_OPS.contains(&clamp.op_type.as_str()) {
        let bound = |key: &str, default: f32| {
            clamp
                .get_attribute(key)
                .and_then(AttributeValue::as_float)
                .unwrap_or(default)
        };
        (bound("min_val", -1.0), Some(bound("max_val", 1.0)))
    } else {
        return Ok(false);
    };
    let Some(&clamp_output) = clamp.outputs.first() else {
        return Ok(false);
    };

    let run = graph.node_mut(run_id)?;
    run.set_attribute(OUTPUT_MIN, AttributeValue::Float(min));
    if let Some(max) = max {
        run.set_attribute(OUTPUT_MAX, AttributeValue::Float(max));
    }
    graph.replace_all_uses(clamp_output, output)?;
    graph.remove_node(clamp_id)?;
    trace!(clamp = %clamp.op_type, "fused clamp into prepacked op");
    Ok(true)
}

impl Pass for InsertFoldPrepackOpsPass {
    fn kind(&self) -> MobileOptimizerType {
        MobileOptimizerType::InsertFoldPrepackOps
    }

    fn run(&self, module: &mut ScriptModule) -> Result<bool> {
        let mut packed = 0;

        for node_id in module.graph().topological_order() {
            // Clamps absorbed earlier in this sweep are gone
            let Ok(node) = module.graph().node(node_id) else {
                continue;
            };
            let op_type = node.op_type.as_str();
            let Some(op) = [PackedOp::Conv2d, PackedOp::Linear]
                .into_iter()
                .find(|op| op.source_op_type() == op_type)
            else {
                continue;
            };
            if self.prepack_node(module, node_id, op)? {
                packed += 1;
            }
        }

        debug!(packed, "inserted prepacked operators");
        Ok(packed > 0)
    }
}
