//! Module representation and graph IR shared by the edgeprep optimizer and linter.
//!
//! This crate provides the foundational abstractions that the other edgeprep crates
//! depend on:
//! - Graph-based IR (`IrGraph`, `IrNode`, `IrValue`)
//! - Tensors, parameters and packed parameter contexts
//! - The compiled module (`ScriptModule`) with its introspection and wrapping API
//! - The capability-typed boundary (`ModuleInput`, `AnyModule`)

pub mod builder;
pub mod dot;
pub mod ir;
pub mod module;
pub mod types;

// Re-export commonly used types
pub use builder::GraphBuilder;
pub use dot::to_dot;
pub use ir::{IrGraph, IrNode, IrNodeId, IrValue, IrValueId, NodeSignature, ValueKind};
pub use module::{AnyModule, BundledInput, ModuleInput, ScriptModule};
pub use types::{
    AttributeValue, MemoryFormat, PackedOp, PackedParams, Parameter, ParameterStore, Tensor,
};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for edgeprep operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Got {got}, but ScriptModule is expected.")]
    Type { got: String },

    #[error("Unsupported optimization pass: {0}")]
    UnsupportedPass(String),

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Method '{0}' is not defined on the module")]
    MissingMethod(String),

    #[error("Invalid bundled input: {0}")]
    BundledInput(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
