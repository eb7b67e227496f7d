//! Static deployment lints for compiled modules.
//!
//! `generate_module_lints` inspects a module's exported methods, parameters
//! and operator set for mistakes that commonly slip into a mobile export:
//! missing sample inputs, parameters still tracking gradients, and
//! training-only operators. The module is never modified.
//!
//! # Example
//!
//! ```
//! use edgeprep_core::{GraphBuilder, ParameterStore, ScriptModule};
//! use edgeprep_lint::{generate_module_lints, LintCode};
//!
//! # fn main() -> edgeprep_core::Result<()> {
//! let mut builder = GraphBuilder::new();
//! let x = builder.input("x")?;
//! let y = builder.op("aten::dropout", &[x])?;
//! builder.output(y);
//! let module = ScriptModule::new("__torch__.Net", builder.finish(), ParameterStore::new());
//!
//! let codes: Vec<_> = generate_module_lints(&module)?
//!     .into_iter()
//!     .map(|finding| finding.code)
//!     .collect();
//! assert_eq!(codes, vec![LintCode::BundledInput, LintCode::Dropout]);
//! # Ok(())
//! # }
//! ```

use edgeprep_core::{ModuleInput, Result};
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Category of a lint finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LintCode {
    /// The module cannot produce sample inputs.
    BundledInput,

    /// A parameter still tracks gradients.
    RequiresGrad,

    /// A dropout operator is present.
    Dropout,

    /// A batch norm operator is present.
    #[serde(rename = "BATCHNORM")]
    BatchNorm,
}

impl LintCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LintCode::BundledInput => "BUNDLED_INPUT",
            LintCode::RequiresGrad => "REQUIRES_GRAD",
            LintCode::Dropout => "DROPOUT",
            LintCode::BatchNorm => "BATCHNORM",
        }
    }
}

impl fmt::Display for LintCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One diagnostic. Serializes as `{"name": "<CODE>", "message": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LintFinding {
    #[serde(rename = "name")]
    pub code: LintCode,
    pub message: String,
}

impl LintFinding {
    fn new(code: LintCode, message: String) -> Self {
        Self { code, message }
    }
}

impl fmt::Display for LintFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Lint a compiled module.
///
/// Every check runs; findings come out in a fixed order: the bundled-input
/// check, then one finding per gradient-tracking parameter in insertion
/// order, then dropout operators, then batch norm operators (each sorted by
/// name). An empty result means nothing was found.
///
/// # Errors
///
/// Returns `Error::Type` if `module` is not a compiled module.
#[tracing::instrument(skip_all)]
pub fn generate_module_lints<M>(module: &M) -> Result<Vec<LintFinding>>
where
    M: ModuleInput + ?Sized,
{
    let module = module.as_script_module()?;
    let mut findings = Vec::new();

    if !module.has_bundled_input_support() {
        findings.push(LintFinding::new(
            LintCode::BundledInput,
            "No bundled input, please add bundled inputs before saving the module using \
             ScriptModule::attach_bundled_inputs."
                .to_string(),
        ));
    }

    for (name, parameter) in module.named_parameters() {
        if parameter.requires_grad {
            findings.push(LintFinding::new(
                LintCode::RequiresGrad,
                format!(
                    "Param {} requires grad, please disable gradient tracking to reduce memory \
                     usage and improve computation speed during inference phase.",
                    name
                ),
            ));
        }
    }

    let operators = module.operator_names();
    for op in operators.iter().filter(|op| op.contains("dropout")) {
        findings.push(LintFinding::new(
            LintCode::Dropout,
            format!(
                "Operator {} exists, remember to call eval() before saving the module.",
                op
            ),
        ));
    }
    for op in operators.iter().filter(|op| op.contains("batch_norm")) {
        findings.push(LintFinding::new(
            LintCode::BatchNorm,
            format!(
                "Operator {} exists, remember to call eval() before saving the module and call \
                 optimize_for_mobile to drop batch_norm operator.",
                op
            ),
        ));
    }

    debug!(module = module.name(), findings = findings.len(), "lint finished");
    Ok(findings)
}
