//! Scene-side data fed to the renderer.
//!
//! Currently only lights: a closed [`Light`] variant over directional, point
//! and spot lights, and the [`GpuLight`] layout shaders read.

pub mod light;

pub use light::{
    DirectionalLight, GpuLight, Light, LightError, LightKind, LightResult, PointLight, SpotLight,
};
