//! Compiled modules and the typed boundary that accepts them.
//!
//! A `ScriptModule` pairs a computation graph with the state it reads:
//! parameters, packed parameter contexts, exported methods and optional
//! bundled sample inputs. The optimizer and the linter only ever accept a
//! module through `ModuleInput`, so handing them anything that is not a
//! compiled module is either a compile-time error or, at the `AnyModule`
//! boundary, an `Error::Type`.

use crate::ir::IrGraph;
use crate::types::{PackedParams, Parameter, ParameterStore, Tensor};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Name of the entry-point method every compiled module exports.
pub const FORWARD_METHOD: &str = "forward";

/// Method whose presence marks a module as able to produce bundled inputs.
pub const GENERATE_BUNDLED_INPUTS_METHOD: &str = "_generate_bundled_inputs";

/// Methods registered by `ScriptModule::attach_bundled_inputs`.
pub const BUNDLED_INPUT_METHODS: [&str; 3] = [
    GENERATE_BUNDLED_INPUTS_METHOD,
    "get_all_bundled_inputs",
    "get_num_bundled_inputs",
];

/// One sample invocation: a tensor per graph input.
pub type BundledInput = Vec<Tensor>;

/// A compiled, graph-based module.
#[derive(Debug, Clone)]
pub struct ScriptModule {
    /// Qualified type name (e.g., "__torch__.MobileNet").
    name: String,

    /// Training mode flag.
    training: bool,

    graph: IrGraph,
    parameters: ParameterStore,
    packed_params: BTreeMap<String, PackedParams>,
    methods: BTreeSet<String>,
    bundled_inputs: Option<Vec<BundledInput>>,
}

impl ScriptModule {
    /// Create a module in training mode exporting only `forward`.
    pub fn new(name: impl Into<String>, graph: IrGraph, parameters: ParameterStore) -> Self {
        Self {
            name: name.into(),
            training: true,
            graph,
            parameters,
            packed_params: BTreeMap::new(),
            methods: BTreeSet::from([FORWARD_METHOD.to_string()]),
            bundled_inputs: None,
        }
    }

    /// Wrap a rewritten graph and its state into a module.
    ///
    /// Metadata (name, methods, bundled inputs, mode) is taken from `template`,
    /// the module the graph was derived from.
    pub fn from_parts(
        template: &ScriptModule,
        graph: IrGraph,
        parameters: ParameterStore,
        packed_params: BTreeMap<String, PackedParams>,
    ) -> Self {
        Self {
            name: template.name.clone(),
            training: template.training,
            graph,
            parameters,
            packed_params,
            methods: template.methods.clone(),
            bundled_inputs: template.bundled_inputs.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &IrGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut IrGraph {
        &mut self.graph
    }

    pub fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.parameters
    }

    pub fn packed_params(&self) -> &BTreeMap<String, PackedParams> {
        &self.packed_params
    }

    pub fn packed_params_mut(&mut self) -> &mut BTreeMap<String, PackedParams> {
        &mut self.packed_params
    }

    /// Split the module into graph, parameters and packed contexts.
    pub fn into_parts(self) -> (IrGraph, ParameterStore, BTreeMap<String, PackedParams>) {
        (self.graph, self.parameters, self.packed_params)
    }

    // ── Introspection ──

    /// Iterate over `(name, parameter)` pairs in insertion order.
    pub fn named_parameters(&self) -> impl Iterator<Item = (&str, &Parameter)> {
        self.parameters.iter()
    }

    /// Distinct operator names referenced by the graph, sorted.
    pub fn operator_names(&self) -> BTreeSet<String> {
        self.graph.op_types()
    }

    /// Check if the module can produce bundled example inputs.
    pub fn has_bundled_input_support(&self) -> bool {
        self.methods.contains(GENERATE_BUNDLED_INPUTS_METHOD)
    }

    pub fn bundled_inputs(&self) -> Option<&[BundledInput]> {
        self.bundled_inputs.as_deref()
    }

    // ── Methods ──

    pub fn methods(&self) -> &BTreeSet<String> {
        &self.methods
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains(name)
    }

    /// Export an additional method.
    pub fn add_method(&mut self, name: impl Into<String>) {
        self.methods.insert(name.into());
    }

    /// Keep only the listed methods (plus `forward`).
    ///
    /// Methods are entries in the exported method table, by name only. The
    /// module graph is the `forward` body and is not touched here.
    pub fn retain_methods(&mut self, keep: &BTreeSet<String>) {
        self.methods
            .retain(|method| method == FORWARD_METHOD || keep.contains(method));
    }

    // ── Mode ──

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Switch to training mode.
    pub fn train(&mut self) -> &mut Self {
        self.training = true;
        self
    }

    /// Switch to inference mode.
    pub fn eval(&mut self) -> &mut Self {
        self.training = false;
        self
    }

    /// Disable gradient tracking on every parameter.
    pub fn freeze_parameters(&mut self) -> &mut Self {
        for (_, parameter) in self.parameters.iter_mut() {
            parameter.requires_grad = false;
        }
        self
    }

    // ── Bundled inputs ──

    /// Attach sample inputs for testing and benchmarking after export.
    ///
    /// Every sample must carry one tensor per graph input. Registers the
    /// bundled-input methods on success.
    pub fn attach_bundled_inputs(&mut self, inputs: Vec<BundledInput>) -> Result<()> {
        if inputs.is_empty() {
            return Err(Error::BundledInput(
                "at least one sample input is required".to_string(),
            ));
        }
        let arity = self.graph.inputs.len();
        for (index, sample) in inputs.iter().enumerate() {
            if sample.len() != arity {
                return Err(Error::BundledInput(format!(
                    "sample {} has {} tensors, but the graph takes {} inputs",
                    index,
                    sample.len(),
                    arity
                )));
            }
        }

        debug!(module = %self.name, samples = inputs.len(), "attached bundled inputs");
        self.bundled_inputs = Some(inputs);
        for method in BUNDLED_INPUT_METHODS {
            self.methods.insert(method.to_string());
        }
        Ok(())
    }
}

// ──────────────────────────────── Boundary ───────────────────────────────

/// A module handed across an API boundary whose kind is only known at runtime.
#[derive(Debug, Clone)]
pub enum AnyModule {
    /// A compiled module.
    Script(ScriptModule),

    /// Anything else, identified by its type name.
    Other { type_name: String },
}

impl AnyModule {
    /// Describe a non-module value of type `T`.
    pub fn other<T: ?Sized>() -> Self {
        AnyModule::Other {
            type_name: std::any::type_name::<T>().to_string(),
        }
    }
}

impl From<ScriptModule> for AnyModule {
    fn from(module: ScriptModule) -> Self {
        AnyModule::Script(module)
    }
}

mod sealed {
    pub trait Sealed {}

    impl Sealed for super::ScriptModule {}
    impl Sealed for super::AnyModule {}
}

/// Values accepted where a compiled module is expected.
///
/// Sealed: only `ScriptModule` (always valid) and `AnyModule` (checked at
/// runtime) implement it.
pub trait ModuleInput: sealed::Sealed {
    /// Borrow the compiled module, or fail with `Error::Type`.
    fn as_script_module(&self) -> Result<&ScriptModule>;
}

impl ModuleInput for ScriptModule {
    fn as_script_module(&self) -> Result<&ScriptModule> {
        Ok(self)
    }
}

impl ModuleInput for AnyModule {
    fn as_script_module(&self) -> Result<&ScriptModule> {
        match self {
            AnyModule::Script(module) => Ok(module),
            AnyModule::Other { type_name } => Err(Error::Type {
                got: type_name.clone(),
            }),
        }
    }
}
