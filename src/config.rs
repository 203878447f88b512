//! Configuration file support for low-precision transformations
//!
//! Loads transformation settings from TOML files.
//!
//! # Config File Locations
//!
//! [`LowPrecisionConfig::find_and_load`] searches in the following order:
//! 1. `./lpt.toml` (current directory)
//! 2. `./.hologram-lpt.toml` (dotfile)
//! 3. `~/.config/hologram/lpt.toml` (user config)
//!
//! # Example Config File
//!
//! ```toml
//! [low-precision]
//! # Set low-precision output types on rewritten nodes (default: true)
//! update_precisions = true
//!
//! # Allow zero points in dequantization chains (default: true)
//! support_asymmetric_quantization = true
//!
//! # Precisions accepted on activations, in preference order (default: ["u8", "i8"])
//! precisions_on_activations = ["u8", "i8"]
//!
//! # Operation types whose transformations are removed from the registry
//! disabled_transformations = ["MatMul"]
//! ```

use crate::graph::{ElementType, OpType};
use crate::low_precision::LayerParams;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration that can contain sections for different tools
///
/// Supports both a `[low-precision]` section and the same keys at the root.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RootConfig {
    #[serde(rename = "low-precision", skip_serializing_if = "Option::is_none")]
    pub low_precision: Option<LowPrecisionConfig>,

    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub direct: Option<LowPrecisionConfig>,
}

/// Low-precision configuration loaded from TOML file
///
/// All fields are optional; [`LowPrecisionConfig::resolve`] fills in defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LowPrecisionConfig {
    /// Set low-precision output types on rewritten nodes (default: true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_precisions: Option<bool>,

    /// Allow zero points in dequantization chains (default: true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub support_asymmetric_quantization: Option<bool>,

    /// Precisions accepted on activations, in preference order
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precisions_on_activations: Option<Vec<String>>,

    /// Operation types removed from the transformation registry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_transformations: Option<Vec<String>>,
}

impl LowPrecisionConfig {
    /// Load config from TOML file
    ///
    /// # Example
    ///
    /// ```no_run
    /// use hologram_lpt::config::LowPrecisionConfig;
    ///
    /// let config = LowPrecisionConfig::load("lpt.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::IoError(path.as_ref().to_path_buf(), e))?;

        let root: RootConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(path.as_ref().to_path_buf(), e))?;

        // Prefer sectioned format, fall back to direct format
        Ok(root.low_precision.or(root.direct).unwrap_or_default())
    }

    /// Find and load config file from standard locations
    ///
    /// Returns `None` if no config file found.
    pub fn find_and_load() -> Result<Option<Self>, ConfigError> {
        let candidates = [PathBuf::from("./lpt.toml"), PathBuf::from("./.hologram-lpt.toml")];
        for candidate in candidates {
            if candidate.exists() {
                return Ok(Some(Self::load(&candidate)?));
            }
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".config/hologram/lpt.toml");
            if user_config.exists() {
                return Ok(Some(Self::load(&user_config)?));
            }
        }

        Ok(None)
    }

    /// Save config to TOML file under the `[low-precision]` section
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let root = RootConfig {
            low_precision: Some(self.clone()),
            direct: None,
        };
        let contents = toml::to_string_pretty(&root).map_err(ConfigError::SerializeError)?;

        std::fs::write(path.as_ref(), contents).map_err(|e| ConfigError::IoError(path.as_ref().to_path_buf(), e))?;

        Ok(())
    }

    /// Concrete transformation parameters with defaults applied
    pub fn resolve(&self) -> Result<LayerParams, ConfigError> {
        let defaults = LayerParams::default();

        let precisions_on_activations = match &self.precisions_on_activations {
            Some(names) => names
                .iter()
                .map(|name| {
                    name.parse::<ElementType>()
                        .map_err(|_| ConfigError::UnknownPrecision(name.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => defaults.precisions_on_activations,
        };

        Ok(LayerParams {
            update_precisions: self.update_precisions.unwrap_or(defaults.update_precisions),
            support_asymmetric_quantization: self
                .support_asymmetric_quantization
                .unwrap_or(defaults.support_asymmetric_quantization),
            precisions_on_activations,
        })
    }

    /// Operation types listed in `disabled_transformations`
    pub fn disabled_op_types(&self) -> Result<Vec<OpType>, ConfigError> {
        self.disabled_transformations
            .iter()
            .flatten()
            .map(|name| {
                name.parse::<OpType>()
                    .map_err(|_| ConfigError::UnknownOperation(name.clone()))
            })
            .collect()
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, #[source] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config file {0}: {1}")]
    ParseError(PathBuf, #[source] toml::de::Error),

    /// Failed to serialize config
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[source] toml::ser::Error),

    #[error("Unknown precision: {0}")]
    UnknownPrecision(String),

    #[error("Unknown operation type: {0}")]
    UnknownOperation(String),
}
