//! Convolution / batch norm folding pass.
//!
//! At inference time batch norm is a per-channel affine transform, so when it
//! directly follows a convolution it can be folded into that convolution's
//! weight and bias:
//!
//! ```text
//! scale[c] = gamma[c] / sqrt(var[c] + eps)
//! W'[c]    = W[c] * scale[c]
//! b'[c]    = (b[c] - mean[c]) * scale[c] + beta[c]
//! ```

use super::{parameter_input, sole_consumer};
use crate::pass::Pass;
use crate::selector::MobileOptimizerType;
use edgeprep_core::{IrNode, IrNodeId, IrValueId, Parameter, Result, ScriptModule, Tensor};
use tracing::{debug, trace};

const DEFAULT_EPS: f32 = 1e-5;

/// Pass that folds `aten::batch_norm` into a preceding `aten::conv2d`.
///
/// The batch norm must be the only user of the convolution output, and all
/// normalization statistics must be module parameters with one entry per
/// output channel. Anything else is left alone.
pub struct ConvBnFusionPass;

/// A matched conv -> batch_norm pair, ready to fold.
struct FoldSite {
    conv: IrNodeId,
    bn: IrNodeId,
    conv_input: IrValueId,
    conv_output: IrValueId,
    bn_output: IrValueId,
    weight_name: String,
    weight: Tensor,
    bias: Option<Tensor>,
    gamma: Tensor,
    beta: Tensor,
    mean: Tensor,
    var: Tensor,
    eps: f32,
}

impl ConvBnFusionPass {
    pub fn new() -> Self {
        Self
    }

    /// Match the conv -> batch_norm pattern ending at `bn`.
    fn match_site(&self, module: &ScriptModule, bn_id: IrNodeId, bn: &IrNode) -> Option<FoldSite> {
        let graph = module.graph();
        let params = module.parameters();

        let bn_input = *bn.inputs.first()?;
        let bn_output = *bn.outputs.first()?;
        let conv_id = graph.value_producer(bn_input)?;
        let conv = graph.node(conv_id).ok()?;
        if conv.op_type != "aten::conv2d" || sole_consumer(graph, bn_input)? != bn_id {
            return None;
        }

        let tensor_at = |node: &IrNode, slot: usize| -> Option<Tensor> {
            let name = parameter_input(graph, node, slot)?;
            params.get(&name).map(|p| p.value.clone())
        };

        let weight_name = parameter_input(graph, conv, 1)?;
        let weight = params.get(&weight_name)?.value.clone();
        let bias = match conv.inputs.len() {
            2 => None,
            3 => Some(tensor_at(conv, 2)?),
            _ => return None,
        };

        Some(FoldSite {
            conv: conv_id,
            bn: bn_id,
            conv_input: *conv.inputs.first()?,
            conv_output: bn_input,
            bn_output,
            weight_name,
            weight,
            bias,
            gamma: tensor_at(bn, 1)?,
            beta: tensor_at(bn, 2)?,
            mean: tensor_at(bn, 3)?,
            var: tensor_at(bn, 4)?,
            eps: bn
                .get_attribute("eps")
                .and_then(|eps| eps.as_float())
                .unwrap_or(DEFAULT_EPS),
        })
    }
}

impl Default for ConvBnFusionPass {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the folded convolution weight and bias.
///
/// Returns `None` if the statistics do not have one entry per output channel.
pub(crate) fn fold_conv_bn(
    weight: &Tensor,
    bias: Option<&Tensor>,
    gamma: &Tensor,
    beta: &Tensor,
    mean: &Tensor,
    var: &Tensor,
    eps: f32,
) -> Option<(Tensor, Tensor)> {
    let out_channels = *weight.shape.first()?;
    if out_channels == 0
        || weight.numel() % out_channels != 0
        || [gamma, beta, mean, var]
            .iter()
            .any(|stat| stat.numel() != out_channels)
        || bias.is_some_and(|b| b.numel() != out_channels)
    {
        return None;
    }

    let scale: Vec<f32> = (0..out_channels)
        .map(|c| gamma.data[c] / (var.data[c] + eps).sqrt())
        .collect();

    // Output channel is the outermost dimension in both memory formats.
    let per_channel = weight.numel() / out_channels;
    if per_channel == 0 {
        return None;
    }
    let mut folded_weight = weight.clone();
    for (c, block) in folded_weight.data.chunks_mut(per_channel).enumerate() {
        for w in block {
            *w *= scale[c];
        }
    }

    let folded_bias = (0..out_channels)
        .map(|c| {
            let b = bias.map_or(0.0, |b| b.data[c]);
            (b - mean.data[c]) * scale[c] + beta.data[c]
        })
        .collect();

    Some((
        folded_weight,
        Tensor::new(vec![out_channels], folded_bias).ok()?,
    ))
}

impl Pass for ConvBnFusionPass {
    fn kind(&self) -> MobileOptimizerType {
        MobileOptimizerType::ConvBnFusion
    }

    fn run(&self, module: &mut ScriptModule) -> Result<bool> {
        let mut folded = 0;

        for bn_id in module.graph().nodes_of_type("aten::batch_norm") {
            let bn = module.graph().node(bn_id)?.clone();
            let Some(site) = self.match_site(module, bn_id, &bn) else {
                trace!(node = ?bn_id, "batch_norm does not follow an exclusive conv2d");
                continue;
            };
            let Some((weight, bias)) = fold_conv_bn(
                &site.weight,
                site.bias.as_ref(),
                &site.gamma,
                &site.beta,
                &site.mean,
                &site.var,
                site.eps,
            ) else {
                debug!(weight = %site.weight_name, "skipping conv-bn fold: channel count mismatch");
                continue;
            };

            let weight_name = module
                .parameters()
                .unique_name(&format!("{}_bn_folded", site.weight_name));
            module
                .parameters_mut()
                .insert(weight_name.clone(), Parameter::frozen(weight));
            let bias_name = module
                .parameters()
                .unique_name(&format!("{}_bn_folded_bias", site.weight_name));
            module
                .parameters_mut()
                .insert(bias_name.clone(), Parameter::frozen(bias));

            let graph = module.graph_mut();
            let weight_value = graph.parameter_value(&weight_name)?;
            let bias_value = graph.parameter_value(&bias_name)?;
            graph.set_node_inputs(site.conv, vec![site.conv_input, weight_value, bias_value])?;
            graph.replace_all_uses(site.bn_output, site.conv_output)?;
            graph.remove_node(site.bn)?;
            folded += 1;
        }

        debug!(folded, "folded batch norm into convolutions");
        Ok(folded > 0)
    }
}
