//! Rewrite pass trait.

use crate::selector::MobileOptimizerType;
use edgeprep_core::{Result, ScriptModule};

/// A graph rewrite run by `RewriteEngine`.
///
/// Passes receive the whole working module rather than just the graph: folding
/// and pruning rewrites add, replace and drop parameters and packed contexts
/// alongside the nodes that read them.
///
/// # Return Value
///
/// `run()` returns `Ok(true)` if the pass changed the module and `Ok(false)`
/// if its pattern never matched. A pattern that does not match is not an
/// error.
///
/// # Example
///
/// ```ignore
/// struct StripPrintPass;
///
/// impl Pass for StripPrintPass {
///     fn kind(&self) -> MobileOptimizerType {
///         MobileOptimizerType::DeadCodeElimination
///     }
///
///     fn run(&self, module: &mut ScriptModule) -> Result<bool> {
///         let graph = module.graph_mut();
///         let prints = graph.nodes_of_type("prim::Print");
///         for &id in &prints {
///             graph.remove_node(id)?;
///         }
///         Ok(!prints.is_empty())
///     }
/// }
/// ```
pub trait Pass: Send + Sync {
    /// Get the pass name (used for logging and debugging).
    fn name(&self) -> &str {
        self.kind().as_str()
    }

    /// The selector entry that enables this pass; also fixes its position in
    /// the pipeline.
    fn kind(&self) -> MobileOptimizerType;

    /// Run the pass on the working module.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` if the pass made changes.
    /// * `Ok(false)` if no changes were made.
    /// * `Err(_)` if the graph was malformed.
    fn run(&self, module: &mut ScriptModule) -> Result<bool>;
}
