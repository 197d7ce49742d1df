//! Renderer configuration.
//!
//! Configuration is read from a TOML file. Every field has a default, so an
//! empty file (or no file at all) yields a usable configuration:
//!
//! ```toml
//! backend = "headless"
//! descriptors_per_page = 256
//! upload_page_size = 2097152
//! ```

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Which GPU backend the context should create.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Software timeline, no GPU required.
    #[default]
    Headless,
    /// Vulkan 1.3 through ash.
    Vulkan,
}

/// Tunables for the GPU lifecycle core.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RendererConfig {
    /// Backend to create.
    pub backend: BackendKind,
    /// Enable API validation layers when the backend supports them.
    pub validation: bool,
    /// Slots per CPU descriptor allocator page.
    pub descriptors_per_page: u32,
    /// Bytes per upload buffer page.
    pub upload_page_size: u64,
    /// Slots per shader-visible descriptor heap used by the dynamic heaps.
    pub dynamic_descriptors_per_heap: u32,
    /// Frames the CPU may run ahead of the GPU.
    pub frames_in_flight: u32,
    /// Fallback tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Headless,
            validation: cfg!(debug_assertions),
            descriptors_per_page: 256,
            upload_page_size: 2 * 1024 * 1024,
            dynamic_descriptors_per_heap: 1024,
            frames_in_flight: 2,
            log_filter: "info,lumen=debug".to_string(),
        }
    }
}

impl RendererConfig {
    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file, falling back to defaults if it is missing.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("Config {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Checks values that parse but cannot be used.
    pub fn validate(&self) -> Result<()> {
        if self.descriptors_per_page == 0 {
            return Err(Error::Config(
                "descriptors_per_page must be greater than 0".to_string(),
            ));
        }
        if self.upload_page_size == 0 {
            return Err(Error::Config(
                "upload_page_size must be greater than 0".to_string(),
            ));
        }
        if self.dynamic_descriptors_per_heap == 0 {
            return Err(Error::Config(
                "dynamic_descriptors_per_heap must be greater than 0".to_string(),
            ));
        }
        if !(1..=4).contains(&self.frames_in_flight) {
            return Err(Error::Config(format!(
                "frames_in_flight must be between 1 and 4, got {}",
                self.frames_in_flight
            )));
        }
        Ok(())
    }
}
