//! Core utilities for the Lumen renderer core.
//!
//! This crate provides foundational types shared by every other crate:
//! - Error types and result aliases
//! - Logging initialization
//! - Frame timing
//! - Configuration loading

mod config;
mod error;
mod logging;
mod timer;

pub use config::{BackendKind, RendererConfig};
pub use error::{Error, Result};
pub use logging::{init_logging, init_logging_with};
pub use timer::FrameTimer;
