//! Built-in rewrite passes.

mod channels_last;
mod conv_bn_fusion;
mod dead_code;
mod fuse_add_relu;
mod prepack;
mod remove_dropout;

pub use channels_last::ChannelsLastPass;
pub use conv_bn_fusion::ConvBnFusionPass;
pub use dead_code::DeadCodeEliminationPass;
pub use fuse_add_relu::FuseAddReluPass;
pub use prepack::InsertFoldPrepackOpsPass;
pub use remove_dropout::{DROPOUT_OPS, RemoveDropoutPass};

use edgeprep_core::{IrGraph, IrNode, IrNodeId, IrValueId};

/// The node that is the only user of `value`.
///
/// Returns `None` if the value is a graph output or has zero or several uses.
pub(crate) fn sole_consumer(graph: &IrGraph, value: IrValueId) -> Option<IrNodeId> {
    if graph.is_graph_output(value) {
        return None;
    }
    match graph.value_consumers(value)[..] {
        [consumer] => Some(consumer),
        _ => None,
    }
}

/// Name of the parameter wired into input `slot` of `node`, if any.
pub(crate) fn parameter_input(graph: &IrGraph, node: &IrNode, slot: usize) -> Option<String> {
    let value = graph.value(*node.inputs.get(slot)?).ok()?;
    value.parameter_name().map(str::to_string)
}
