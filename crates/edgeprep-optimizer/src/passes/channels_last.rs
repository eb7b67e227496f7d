//! Channels-last layout conversion pass.

use crate::pass::Pass;
use crate::selector::MobileOptimizerType;
use edgeprep_core::{AttributeValue, MemoryFormat, PackedOp, Result, ScriptModule, ValueKind};
use tracing::debug;

/// Node attribute recording the weight layout a convolution was prepared for.
pub const MEMORY_FORMAT_ATTR: &str = "memory_format";

const CONV_OPS: [&str; 2] = ["aten::conv2d", "prepacked::conv2d_clamp_run"];

/// Pass that stores 4-D convolution weights in NHWC order.
///
/// Converts the weights of packed convolution contexts and of parameters used
/// as an `aten::conv2d` weight, then tags every convolution reading them with
/// `memory_format = "channels_last"`. Logical shapes do not change.
pub struct ChannelsLastPass;

impl ChannelsLastPass {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ChannelsLastPass {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for ChannelsLastPass {
    fn kind(&self) -> MobileOptimizerType {
        MobileOptimizerType::ChannelsLast
    }

    fn run(&self, module: &mut ScriptModule) -> Result<bool> {
        let mut converted = 0;
        let mut tagged = 0;

        for node_id in module.graph().topological_order() {
            let node = module.graph().node(node_id)?;
            if !CONV_OPS.contains(&node.op_type.as_str()) {
                continue;
            }
            let Some(&weight_input) = node.inputs.get(1) else {
                continue;
            };
            let already_tagged = node
                .get_attribute(MEMORY_FORMAT_ATTR)
                .and_then(AttributeValue::as_str)
                == Some(MemoryFormat::ChannelsLast.as_str());

            let weight = match module.graph().value(weight_input)?.kind.clone() {
                ValueKind::Packed(name) => module
                    .packed_params_mut()
                    .get_mut(&name)
                    .filter(|context| context.op == PackedOp::Conv2d)
                    .map(|context| &mut context.weight),
                ValueKind::Parameter(name) => module
                    .parameters_mut()
                    .get_mut(&name)
                    .map(|parameter| &mut parameter.value),
                ValueKind::Runtime => None,
            };
            let Some(weight) = weight.filter(|w| w.ndim() == 4) else {
                continue;
            };
            if !weight.is_channels_last() {
                *weight = weight.to_channels_last()?;
                converted += 1;
            }

            if !already_tagged {
                module.graph_mut().node_mut(node_id)?.set_attribute(
                    MEMORY_FORMAT_ATTR,
                    AttributeValue::String(MemoryFormat::ChannelsLast.as_str().to_string()),
                );
                tagged += 1;
            }
        }

        debug!(converted, tagged, "converted convolution weights to channels-last");
        Ok(converted + tagged > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::InsertFoldPrepackOpsPass;
    use crate::passes::test_util::params;
    use edgeprep_core::{GraphBuilder, Parameter, Tensor};

    fn conv_module() -> ScriptModule {
        let mut builder = GraphBuilder::new();
        let x = builder.input("x").unwrap();
        let w = builder.param("conv.weight").unwrap();
        let y = builder.op("aten::conv2d", &[x, w]).unwrap();
        builder.output(y);
        let mut store = params(&[]);
        let data: Vec<f32> = (0..8).map(|v| v as f32).collect();
        store.insert(
            "conv.weight",
            Parameter::new(Tensor::new(vec![2, 2, 1, 2], data).unwrap()),
        );
        ScriptModule::new("m", builder.finish(), store)
    }

    #[test]
    fn test_converts_conv_parameter() {
        let mut module = conv_module();
        let original = module.parameters().get("conv.weight").unwrap().value.clone();

        assert!(ChannelsLastPass::new().run(&mut module).unwrap());

        let weight = &module.parameters().get("conv.weight").unwrap().value;
        assert!(weight.is_channels_last());
        assert_eq!(weight.shape, original.shape);
        assert_eq!(
            weight.get4([1, 1, 0, 1]).unwrap(),
            original.get4([1, 1, 0, 1]).unwrap()
        );

        let conv = module.graph().nodes_of_type("aten::conv2d")[0];
        assert_eq!(
            module.graph().node(conv).unwrap().get_attribute(MEMORY_FORMAT_ATTR),
            Some(&AttributeValue::String("channels_last".to_string()))
        );

        // Second run is a no-op
        assert!(!ChannelsLastPass::new().run(&mut module).unwrap());
    }

    #[test]
    fn test_converts_packed_context() {
        let mut module = conv_module();
        InsertFoldPrepackOpsPass::new().run(&mut module).unwrap();

        assert!(ChannelsLastPass::new().run(&mut module).unwrap());

        let context = &module.packed_params()["conv.weight_packed"];
        assert!(context.weight.is_channels_last());
        let run = module.graph().nodes_of_type("prepacked::conv2d_clamp_run")[0];
        assert!(module
            .graph()
            .node(run)
            .unwrap()
            .get_attribute(MEMORY_FORMAT_ATTR)
            .is_some());
    }

    #[test]
    fn test_truncated_weight_is_a_shape_error() {
        let mut module = conv_module();
        module
            .parameters_mut()
            .get_mut("conv.weight")
            .unwrap()
            .value
            .data
            .truncate(1);

        let err = ChannelsLastPass::new().run(&mut module).unwrap_err();
        assert!(matches!(err, edgeprep_core::Error::Shape(_)));
    }

    #[test]
    fn test_linear_is_untouched() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("x").unwrap();
        let w = builder.param("fc.weight").unwrap();
        let y = builder.op("aten::linear", &[x, w]).unwrap();
        builder.output(y);
        let store = params(&[("fc.weight", vec![4, 4], 1.0)]);
        let mut module = ScriptModule::new("m", builder.finish(), store);

        assert!(!ChannelsLastPass::new().run(&mut module).unwrap());
        assert!(!module.parameters().get("fc.weight").unwrap().value.is_channels_last());
    }
}
