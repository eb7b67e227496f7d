//! Graph transformation engines.

use crate::pass::Pass;
use crate::passes::{
    ChannelsLastPass, ConvBnFusionPass, DeadCodeEliminationPass, FuseAddReluPass,
    InsertFoldPrepackOpsPass, RemoveDropoutPass,
};
use crate::selector::MobileOptimizerType;
use edgeprep_core::{Result, ScriptModule};

/// A backend that applies rewrite passes to a module.
///
/// The optimizer resolves the caller's selector against
/// `supported_passes()` before calling `apply_passes()`, so an engine is only
/// ever asked for passes it advertised, in execution order.
pub trait GraphEngine: Send + Sync {
    /// Passes this engine can apply.
    fn supported_passes(&self) -> &[MobileOptimizerType];

    /// Apply `passes` to a copy of `module` and return the rewritten copy.
    ///
    /// `module` itself must be left untouched.
    fn apply_passes(
        &self,
        module: &ScriptModule,
        passes: &[MobileOptimizerType],
    ) -> Result<ScriptModule>;
}

/// The built-in engine: an ordered list of `Pass` objects.
///
/// Passes run in the order of their kind; passes sharing a kind run in the
/// order they were added.
pub struct RewriteEngine {
    /// Passes ordered by (kind, registration order).
    passes: Vec<Box<dyn Pass>>,

    /// Distinct kinds covered by `passes`, sorted.
    supported: Vec<MobileOptimizerType>,
}

impl RewriteEngine {
    /// Create an engine with every built-in pass.
    pub fn new() -> Self {
        let mut engine = Self::empty();
        engine
            .add_pass(RemoveDropoutPass::new())
            .add_pass(ConvBnFusionPass::new())
            .add_pass(InsertFoldPrepackOpsPass::new())
            .add_pass(FuseAddReluPass::new())
            .add_pass(DeadCodeEliminationPass::new())
            .add_pass(ChannelsLastPass::new());
        engine
    }

    /// Create an engine without any pass.
    pub fn empty() -> Self {
        Self {
            passes: Vec::new(),
            supported: Vec::new(),
        }
    }

    /// Add a pass to the engine.
    ///
    /// # Returns
    ///
    /// Returns a mutable reference to self for method chaining.
    pub fn add_pass(&mut self, pass: impl Pass + 'static) -> &mut Self {
        let kind = pass.kind();
        self.passes.push(Box::new(pass));
        // Stable sort keeps registration order within a kind
        self.passes.sort_by_key(|p| p.kind());
        if let Err(position) = self.supported.binary_search(&kind) {
            self.supported.insert(position, kind);
        }
        self
    }

    /// Names of the registered passes, in execution order.
    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }
}

impl Default for RewriteEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphEngine for RewriteEngine {
    fn supported_passes(&self) -> &[MobileOptimizerType] {
        &self.supported
    }

    #[tracing::instrument(skip_all, fields(module = module.name(), passes = passes.len()))]
    fn apply_passes(
        &self,
        module: &ScriptModule,
        passes: &[MobileOptimizerType],
    ) -> Result<ScriptModule> {
        let mut working = module.clone();

        for pass in self.passes.iter().filter(|p| passes.contains(&p.kind())) {
            let _span =
                tracing::debug_span!("pass", name = pass.name(), kind = ?pass.kind()).entered();
            let changed = pass.run(&mut working)?;
            tracing::debug!(changed, nodes = working.graph().node_count(), "pass finished");
        }

        Ok(working)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeprep_core::{GraphBuilder, ParameterStore};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPass {
        kind: MobileOptimizerType,
        runs: Arc<AtomicUsize>,
    }

    impl Pass for CountingPass {
        fn kind(&self) -> MobileOptimizerType {
            self.kind
        }

        fn run(&self, _module: &mut ScriptModule) -> Result<bool> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
    }

    fn dropout_module() -> ScriptModule {
        let mut builder = GraphBuilder::new();
        let x = builder.input("x").unwrap();
        let y = builder.op("aten::dropout", &[x]).unwrap();
        builder.output(y);
        ScriptModule::new("m", builder.finish(), ParameterStore::new())
    }

    #[test]
    fn test_builtin_passes_in_execution_order() {
        let engine = RewriteEngine::new();
        assert_eq!(engine.supported_passes(), &MobileOptimizerType::ALL);
        assert_eq!(
            engine.pass_names(),
            vec![
                "remove_dropout",
                "conv_bn_fusion",
                "insert_fold_prepack_ops",
                "fuse_add_relu",
                "dead_code_elimination",
                "channels_last",
            ]
        );
    }

    #[test]
    fn test_add_pass_sorts_by_kind() {
        let mut engine = RewriteEngine::empty();
        engine
            .add_pass(ChannelsLastPass::new())
            .add_pass(RemoveDropoutPass::new());
        assert_eq!(engine.pass_names(), vec!["remove_dropout", "channels_last"]);
        assert_eq!(
            engine.supported_passes(),
            &[MobileOptimizerType::RemoveDropout, MobileOptimizerType::ChannelsLast]
        );
    }

    #[test]
    fn test_only_requested_passes_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut engine = RewriteEngine::empty();
        engine.add_pass(CountingPass {
            kind: MobileOptimizerType::FuseAddRelu,
            runs: runs.clone(),
        });

        let module = dropout_module();
        engine.apply_passes(&module, &[]).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        engine
            .apply_passes(&module, &[MobileOptimizerType::FuseAddRelu])
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_apply_passes_leaves_input_untouched() {
        let module = dropout_module();
        let before = module.graph().topology();

        let rewritten = RewriteEngine::new()
            .apply_passes(&module, &[MobileOptimizerType::RemoveDropout])
            .unwrap();

        assert_eq!(module.graph().topology(), before);
        assert_eq!(rewritten.graph().node_count(), 0);
        assert_eq!(rewritten.graph().outputs, rewritten.graph().inputs);
    }
}
