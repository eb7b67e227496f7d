//! Optimizer configuration.
//!
//! Configuration can be built in code or loaded from TOML:
//!
//! ```toml
//! preserved_methods = ["encode"]
//!
//! [passes]
//! conv_bn_fusion = true
//! remove_dropout = true
//! ```
//!
//! An absent or empty `[passes]` table selects every pass.

use crate::selector::PassSelector;
use edgeprep_core::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Options for one `optimize_with_config` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizerConfig {
    /// Which passes to run.
    pub selector: PassSelector,

    /// Methods to keep on the optimized module besides `forward`.
    pub preserved_methods: Vec<String>,
}

/// On-disk shape of the configuration; pass names are validated afterwards.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    passes: BTreeMap<String, bool>,
    preserved_methods: Vec<String>,
}

impl OptimizerConfig {
    pub fn new(selector: PassSelector) -> Self {
        Self {
            selector,
            preserved_methods: Vec::new(),
        }
    }

    /// Keep the given methods on the optimized module.
    pub fn with_preserved_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preserved_methods
            .extend(methods.into_iter().map(Into::into));
        self
    }

    /// Parse a TOML configuration document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for malformed TOML or unknown keys, and
    /// `Error::UnsupportedPass` for an unknown name in `[passes]`.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.message().to_string()))?;
        let selector = PassSelector::from_names(
            raw.passes
                .iter()
                .map(|(name, &enabled)| (name.as_str(), enabled)),
        )?;
        Ok(Self {
            selector,
            preserved_methods: raw.preserved_methods,
        })
    }

    /// Load a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::MobileOptimizerType;

    #[test]
    fn test_parse_full_config() {
        let config = OptimizerConfig::from_toml_str(
            r#"
            preserved_methods = ["encode", "decode"]

            [passes]
            conv_bn_fusion = true
            remove_dropout = true
            channels_last = false
            "#,
        )
        .unwrap();

        assert_eq!(config.preserved_methods, vec!["encode", "decode"]);
        assert!(config.selector.is_enabled(MobileOptimizerType::ConvBnFusion));
        assert!(config.selector.is_enabled(MobileOptimizerType::RemoveDropout));
        assert!(!config.selector.is_enabled(MobileOptimizerType::ChannelsLast));
        assert!(!config.selector.is_enabled(MobileOptimizerType::FuseAddRelu));
    }

    #[test]
    fn test_empty_config_selects_everything() {
        let config = OptimizerConfig::from_toml_str("").unwrap();
        assert_eq!(config, OptimizerConfig::default());
        assert!(config.selector.is_empty());
    }

    #[test]
    fn test_unknown_pass_name() {
        let err = OptimizerConfig::from_toml_str("[passes]\nfold_everything = true\n").unwrap_err();
        assert!(matches!(err, Error::UnsupportedPass(name) if name == "fold_everything"));
    }

    #[test]
    fn test_malformed_config() {
        let err = OptimizerConfig::from_toml_str("passes = 3").unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = OptimizerConfig::from_toml_str("optimise = true").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = OptimizerConfig::from_file("/nonexistent/edgeprep.toml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_builder() {
        let config = OptimizerConfig::new(PassSelector::all_disabled())
            .with_preserved_methods(["encode"]);
        assert_eq!(config.preserved_methods, vec!["encode".to_string()]);
        assert!(!config.selector.is_enabled(MobileOptimizerType::RemoveDropout));
    }
}
