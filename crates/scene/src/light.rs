//! Scene lights.
//!
//! A [`Light`] is one of three kinds. Properties that only some kinds have
//! (position, direction, range, cone angles) are read as `Option` and written
//! through methods that return [`LightError::NotApplicable`] for the other
//! kinds, so an editor can offer every field and report what does not apply.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use thiserror::Error;

/// The kind of a [`Light`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LightKind {
    Directional,
    Point,
    Spot,
}

impl LightKind {
    /// Tag written into [`GpuLight::kind`].
    pub fn gpu_tag(self) -> u32 {
        match self {
            Self::Directional => 0,
            Self::Point => 1,
            Self::Spot => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Directional => "directional",
            Self::Point => "point",
            Self::Spot => "spot",
        }
    }
}

/// Errors raised when editing a light.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LightError {
    #[error("{property} does not apply to {} lights", .kind.name())]
    NotApplicable {
        property: &'static str,
        kind: LightKind,
    },

    #[error("Invalid {property}: {value}")]
    InvalidValue { property: &'static str, value: f32 },

    #[error("Direction must be non-zero")]
    ZeroDirection,

    #[error("Inner cone angle {inner} exceeds outer angle {outer}")]
    InvalidCone { inner: f32, outer: f32 },
}

pub type LightResult<T> = std::result::Result<T, LightError>;

/// A light infinitely far away (sun-like).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DirectionalLight {
    /// Normalized direction the light travels in.
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::NEG_Y,
            color: Vec3::ONE,
            intensity: 1.0,
        }
    }
}

/// An omnidirectional light.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointLight {
    pub position: Vec3,
    /// Attenuation radius.
    pub range: f32,
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for PointLight {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            range: 10.0,
            color: Vec3::ONE,
            intensity: 1.0,
        }
    }
}

/// A cone-shaped light. Angles are half-angles in radians.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpotLight {
    pub position: Vec3,
    pub direction: Vec3,
    pub range: f32,
    pub color: Vec3,
    pub intensity: f32,
    pub inner_angle: f32,
    pub outer_angle: f32,
}

impl Default for SpotLight {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            direction: Vec3::NEG_Y,
            range: 10.0,
            color: Vec3::ONE,
            intensity: 1.0,
            inner_angle: 25f32.to_radians(),
            outer_angle: 37f32.to_radians(),
        }
    }
}

/// A scene light.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Light {
    Directional(DirectionalLight),
    Point(PointLight),
    Spot(SpotLight),
}

impl Light {
    pub fn directional(direction: Vec3) -> LightResult<Self> {
        Ok(Self::Directional(DirectionalLight {
            direction: normalized(direction)?,
            ..Default::default()
        }))
    }

    pub fn point(position: Vec3, range: f32) -> LightResult<Self> {
        Ok(Self::Point(PointLight {
            position,
            range: positive("range", range)?,
            ..Default::default()
        }))
    }

    pub fn spot(position: Vec3, direction: Vec3, range: f32) -> LightResult<Self> {
        Ok(Self::Spot(SpotLight {
            position,
            direction: normalized(direction)?,
            range: positive("range", range)?,
            ..Default::default()
        }))
    }

    pub fn kind(&self) -> LightKind {
        match self {
            Self::Directional(_) => LightKind::Directional,
            Self::Point(_) => LightKind::Point,
            Self::Spot(_) => LightKind::Spot,
        }
    }

    pub fn color(&self) -> Vec3 {
        match self {
            Self::Directional(light) => light.color,
            Self::Point(light) => light.color,
            Self::Spot(light) => light.color,
        }
    }

    pub fn set_color(&mut self, color: Vec3) {
        match self {
            Self::Directional(light) => light.color = color,
            Self::Point(light) => light.color = color,
            Self::Spot(light) => light.color = color,
        }
    }

    pub fn intensity(&self) -> f32 {
        match self {
            Self::Directional(light) => light.intensity,
            Self::Point(light) => light.intensity,
            Self::Spot(light) => light.intensity,
        }
    }

    pub fn set_intensity(&mut self, intensity: f32) -> LightResult<()> {
        if !(intensity >= 0.0 && intensity.is_finite()) {
            return Err(LightError::InvalidValue {
                property: "intensity",
                value: intensity,
            });
        }
        match self {
            Self::Directional(light) => light.intensity = intensity,
            Self::Point(light) => light.intensity = intensity,
            Self::Spot(light) => light.intensity = intensity,
        }
        Ok(())
    }

    /// World-space position; `None` for directional lights.
    pub fn position(&self) -> Option<Vec3> {
        match self {
            Self::Directional(_) => None,
            Self::Point(light) => Some(light.position),
            Self::Spot(light) => Some(light.position),
        }
    }

    pub fn set_position(&mut self, position: Vec3) -> LightResult<()> {
        match self {
            Self::Point(light) => light.position = position,
            Self::Spot(light) => light.position = position,
            Self::Directional(_) => return Err(not_applicable("position", LightKind::Directional)),
        }
        Ok(())
    }

    /// Normalized direction; `None` for point lights.
    pub fn direction(&self) -> Option<Vec3> {
        match self {
            Self::Directional(light) => Some(light.direction),
            Self::Spot(light) => Some(light.direction),
            Self::Point(_) => None,
        }
    }

    pub fn set_direction(&mut self, direction: Vec3) -> LightResult<()> {
        if let Self::Point(_) = self {
            return Err(not_applicable("direction", LightKind::Point));
        }
        let direction = normalized(direction)?;
        match self {
            Self::Directional(light) => light.direction = direction,
            Self::Spot(light) => light.direction = direction,
            Self::Point(_) => {}
        }
        Ok(())
    }

    /// Attenuation radius; `None` for directional lights.
    pub fn range(&self) -> Option<f32> {
        match self {
            Self::Directional(_) => None,
            Self::Point(light) => Some(light.range),
            Self::Spot(light) => Some(light.range),
        }
    }

    pub fn set_range(&mut self, range: f32) -> LightResult<()> {
        if let Self::Directional(_) = self {
            return Err(not_applicable("range", LightKind::Directional));
        }
        let range = positive("range", range)?;
        match self {
            Self::Point(light) => light.range = range,
            Self::Spot(light) => light.range = range,
            Self::Directional(_) => {}
        }
        Ok(())
    }

    /// Inner and outer cone half-angles in radians; spot lights only.
    pub fn cone_angles(&self) -> Option<(f32, f32)> {
        match self {
            Self::Spot(light) => Some((light.inner_angle, light.outer_angle)),
            _ => None,
        }
    }

    pub fn set_cone_angles(&mut self, inner: f32, outer: f32) -> LightResult<()> {
        let kind = self.kind();
        let Self::Spot(light) = self else {
            return Err(not_applicable("cone angles", kind));
        };
        if !(0.0..std::f32::consts::FRAC_PI_2).contains(&outer) {
            return Err(LightError::InvalidValue {
                property: "outer angle",
                value: outer,
            });
        }
        if !(inner >= 0.0 && inner <= outer) {
            return Err(LightError::InvalidCone { inner, outer });
        }
        light.inner_angle = inner;
        light.outer_angle = outer;
        Ok(())
    }

    /// Packs the light for a shader constant buffer.
    pub fn to_gpu(&self) -> GpuLight {
        let mut gpu = GpuLight {
            kind: self.kind().gpu_tag(),
            color: self.color(),
            intensity: self.intensity(),
            ..GpuLight::zeroed()
        };
        match self {
            Self::Directional(light) => {
                gpu.direction = light.direction;
            }
            Self::Point(light) => {
                gpu.position = light.position;
                gpu.range = light.range;
            }
            Self::Spot(light) => {
                gpu.position = light.position;
                gpu.range = light.range;
                gpu.direction = light.direction;
                gpu.cos_inner = light.inner_angle.cos();
                gpu.cos_outer = light.outer_angle.cos();
            }
        }
        gpu
    }
}

impl Default for Light {
    fn default() -> Self {
        Self::Directional(DirectionalLight::default())
    }
}

/// Shader-side light layout, 16-byte aligned rows.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GpuLight {
    pub position: Vec3,
    pub range: f32,
    pub direction: Vec3,
    pub kind: u32,
    pub color: Vec3,
    pub intensity: f32,
    pub cos_inner: f32,
    pub cos_outer: f32,
    pub _pad: [f32; 2],
}

fn not_applicable(property: &'static str, kind: LightKind) -> LightError {
    LightError::NotApplicable { property, kind }
}

fn normalized(direction: Vec3) -> LightResult<Vec3> {
    direction.try_normalize().ok_or(LightError::ZeroDirection)
}

fn positive(property: &'static str, value: f32) -> LightResult<f32> {
    if value > 0.0 && value.is_finite() {
        Ok(value)
    } else {
        Err(LightError::InvalidValue { property, value })
    }
}
