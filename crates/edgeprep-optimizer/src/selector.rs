//! Optimization pass identifiers and the caller-facing pass selector.

use edgeprep_core::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Identifier of a rewrite pass.
///
/// The declaration order is the execution order: later passes rely on the
/// graph shape established by earlier ones (dropout is gone before fusion
/// looks for adjacent operators, batch norm is folded before convolutions are
/// prepacked, dead state is pruned before layouts are converted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MobileOptimizerType {
    /// Remove training-only dropout operators.
    RemoveDropout,

    /// Fold batch norm into the preceding convolution.
    ConvBnFusion,

    /// Replace convolutions and linear layers with prepacked mobile kernels,
    /// folding the packing and any trailing clamp into the graph.
    InsertFoldPrepackOps,

    /// Fuse `add` followed by `relu` into a single operator.
    FuseAddRelu,

    /// Remove operators whose results are never used, and the state they held.
    DeadCodeElimination,

    /// Store convolution weights in channels-last memory format.
    ChannelsLast,
}

impl MobileOptimizerType {
    /// Every pass, in execution order.
    pub const ALL: [MobileOptimizerType; 6] = [
        MobileOptimizerType::RemoveDropout,
        MobileOptimizerType::ConvBnFusion,
        MobileOptimizerType::InsertFoldPrepackOps,
        MobileOptimizerType::FuseAddRelu,
        MobileOptimizerType::DeadCodeElimination,
        MobileOptimizerType::ChannelsLast,
    ];

    /// Stable configuration name of the pass.
    pub fn as_str(&self) -> &'static str {
        match self {
            MobileOptimizerType::RemoveDropout => "remove_dropout",
            MobileOptimizerType::ConvBnFusion => "conv_bn_fusion",
            MobileOptimizerType::InsertFoldPrepackOps => "insert_fold_prepack_ops",
            MobileOptimizerType::FuseAddRelu => "fuse_add_relu",
            MobileOptimizerType::DeadCodeElimination => "dead_code_elimination",
            MobileOptimizerType::ChannelsLast => "channels_last",
        }
    }
}

impl fmt::Display for MobileOptimizerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MobileOptimizerType {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        MobileOptimizerType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| Error::UnsupportedPass(name.to_string()))
    }
}

/// Enable/disable map over optimization passes.
///
/// An empty selector runs every pass the engine supports. A populated
/// selector runs exactly the passes mapped to `true`.
///
/// Selectors are plain values; build a fresh one per call.
///
/// # Example
///
/// ```
/// use edgeprep_optimizer::{MobileOptimizerType, PassSelector};
///
/// let selector = PassSelector::default()
///     .with(MobileOptimizerType::ConvBnFusion, true)
///     .with(MobileOptimizerType::ChannelsLast, false);
/// assert!(selector.is_enabled(MobileOptimizerType::ConvBnFusion));
/// assert!(!selector.is_enabled(MobileOptimizerType::RemoveDropout));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSelector {
    entries: BTreeMap<MobileOptimizerType, bool>,
}

impl PassSelector {
    /// Selector that runs every supported pass.
    pub fn all() -> Self {
        Self::default()
    }

    /// Selector that runs no pass at all.
    pub fn all_disabled() -> Self {
        MobileOptimizerType::ALL
            .into_iter()
            .map(|kind| (kind, false))
            .collect()
    }

    /// Selector that runs exactly the given passes.
    pub fn only(kinds: impl IntoIterator<Item = MobileOptimizerType>) -> Self {
        kinds.into_iter().map(|kind| (kind, true)).collect()
    }

    /// Return a copy with `kind` mapped to `enabled`.
    pub fn with(mut self, kind: MobileOptimizerType, enabled: bool) -> Self {
        self.entries.insert(kind, enabled);
        self
    }

    /// Build a selector from pass names.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedPass` for a name that is not a known pass.
    pub fn from_names<'a>(entries: impl IntoIterator<Item = (&'a str, bool)>) -> Result<Self> {
        entries
            .into_iter()
            .map(|(name, enabled)| Ok((name.parse::<MobileOptimizerType>()?, enabled)))
            .collect()
    }

    /// Check if no pass was mentioned (meaning "run everything").
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of passes mentioned, enabled or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the selector lets `kind` run.
    pub fn is_enabled(&self, kind: MobileOptimizerType) -> bool {
        self.is_empty() || self.entries.get(&kind).copied().unwrap_or(false)
    }

    /// Resolve the selector against the passes an engine supports.
    ///
    /// Returns the passes to run, in execution order. Disabling a pass the
    /// engine does not know is harmless; enabling one is not.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedPass` if an enabled pass is not in `supported`.
    pub fn resolve(&self, supported: &[MobileOptimizerType]) -> Result<Vec<MobileOptimizerType>> {
        let mut passes: Vec<MobileOptimizerType> = if self.is_empty() {
            supported.to_vec()
        } else {
            let mut enabled = Vec::new();
            for (&kind, &on) in &self.entries {
                if !on {
                    continue;
                }
                if !supported.contains(&kind) {
                    return Err(Error::UnsupportedPass(kind.to_string()));
                }
                enabled.push(kind);
            }
            enabled
        };
        passes.sort();
        passes.dedup();
        Ok(passes)
    }
}

impl FromIterator<(MobileOptimizerType, bool)> for PassSelector {
    fn from_iter<I: IntoIterator<Item = (MobileOptimizerType, bool)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
