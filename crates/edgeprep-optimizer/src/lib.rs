//! Graph rewriting pipeline that prepares compiled modules for on-device
//! execution.
//!
//! `optimize_for_mobile` takes a compiled module and returns a new, frozen
//! module whose graph has been rewritten by a selectable set of passes:
//! 1. **RemoveDropout** - drop training-only dropout operators
//! 2. **ConvBnFusion** - fold batch norm into the preceding convolution
//! 3. **InsertFoldPrepackOps** - switch to prepacked mobile kernels with fused clamps
//! 4. **FuseAddRelu** - fuse `add` + `relu`
//! 5. **DeadCodeElimination** - drop unused operators and state
//! 6. **ChannelsLast** - store convolution weights in NHWC order
//!
//! Passes always run in this order, whatever order the selector lists them in.
//!
//! # Example
//!
//! ```
//! use edgeprep_core::{GraphBuilder, Parameter, ParameterStore, ScriptModule, Tensor};
//! use edgeprep_optimizer::{optimize_for_mobile, PassSelector};
//!
//! # fn main() -> edgeprep_core::Result<()> {
//! let mut builder = GraphBuilder::new();
//! let x = builder.input("x")?;
//! let w = builder.param("fc.weight")?;
//! let y = builder.op("aten::linear", &[x, w])?;
//! let z = builder.op("aten::dropout", &[y])?;
//! builder.output(z);
//!
//! let mut params = ParameterStore::new();
//! params.insert("fc.weight", Parameter::new(Tensor::zeros(vec![4, 4])));
//! let module = ScriptModule::new("__torch__.Net", builder.finish(), params);
//!
//! let optimized = optimize_for_mobile(&module, &PassSelector::default())?;
//! assert!(!optimized.is_training());
//! assert!(optimized.operator_names().contains("prepacked::linear_clamp_run"));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod pass;
pub mod passes;
pub mod selector;

pub use config::OptimizerConfig;
pub use engine::{GraphEngine, RewriteEngine};
pub use pass::Pass;
pub use selector::{MobileOptimizerType, PassSelector};

use edgeprep_core::module::{BUNDLED_INPUT_METHODS, FORWARD_METHOD};
use edgeprep_core::{Error, ModuleInput, Result, ScriptModule};
use std::collections::BTreeSet;
use tracing::debug;

/// Optimize a compiled module for mobile execution.
///
/// Runs the passes `selector` enables (all of them for an empty selector) on
/// a copy of `module` and returns the copy, in inference mode with gradient
/// tracking disabled. `module` is not modified.
///
/// # Errors
///
/// * `Error::Type` if `module` is not a compiled module.
/// * `Error::UnsupportedPass` if the selector enables a pass the engine lacks.
/// * Any error raised by a pass on a malformed graph.
pub fn optimize_for_mobile<M>(module: &M, selector: &PassSelector) -> Result<ScriptModule>
where
    M: ModuleInput + ?Sized,
{
    optimize_with_config(module, &OptimizerConfig::new(selector.clone()))
}

/// Optimize a module with the built-in `RewriteEngine`.
pub fn optimize_with_config<M>(module: &M, config: &OptimizerConfig) -> Result<ScriptModule>
where
    M: ModuleInput + ?Sized,
{
    optimize_with_engine(module, config, &RewriteEngine::new())
}

/// Optimize a module with a custom engine.
///
/// Everything is validated before the first pass runs: the module type, the
/// selected passes against `engine.supported_passes()`, and the preserved
/// methods against the module's method table.
///
/// # Errors
///
/// As `optimize_for_mobile`, plus `Error::MissingMethod` for a preserved
/// method the module does not export.
#[tracing::instrument(skip_all, fields(module = tracing::field::Empty))]
pub fn optimize_with_engine<M>(
    module: &M,
    config: &OptimizerConfig,
    engine: &dyn GraphEngine,
) -> Result<ScriptModule>
where
    M: ModuleInput + ?Sized,
{
    let module = module.as_script_module()?;
    tracing::Span::current().record("module", module.name());

    let passes = config.selector.resolve(engine.supported_passes())?;
    let keep = methods_to_keep(module, &config.preserved_methods)?;
    debug!(passes = ?passes, preserved = ?keep, "optimizing module");

    let rewritten = engine.apply_passes(module, &passes)?;
    let (graph, parameters, packed_params) = rewritten.into_parts();

    let mut optimized = ScriptModule::from_parts(module, graph, parameters, packed_params);
    optimized.eval().freeze_parameters();
    optimized.retain_methods(&keep);

    debug!(
        nodes_before = module.graph().node_count(),
        nodes_after = optimized.graph().node_count(),
        "optimization finished"
    );
    Ok(optimized)
}

/// Methods that survive freezing: `forward`, bundled-input support and the
/// caller's preserved methods.
fn methods_to_keep(module: &ScriptModule, preserved: &[String]) -> Result<BTreeSet<String>> {
    let mut keep = BTreeSet::from([FORWARD_METHOD.to_string()]);
    if module.has_bundled_input_support() {
        keep.extend(
            BUNDLED_INPUT_METHODS
                .iter()
                .filter(|method| module.has_method(method))
                .map(|method| method.to_string()),
        );
    }
    for method in preserved {
        if !module.has_method(method) {
            return Err(Error::MissingMethod(method.clone()));
        }
        keep.insert(method.clone());
    }
    Ok(keep)
}
