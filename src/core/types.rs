use glam::{Mat3, Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Position and orientation of a body. Orientation is kept unit length by
/// the integrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub orientation: Quat,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
        }
    }
}

impl Transform {
    pub fn new(position: Vec3, orientation: Quat) -> Self {
        Self {
            position,
            orientation,
        }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Maps a point from this transform's object space to world space.
    pub fn to_world(&self, local: Vec3) -> Vec3 {
        self.position + self.orientation * local
    }

    /// Maps a world-space point into this transform's object space.
    pub fn to_local(&self, world: Vec3) -> Vec3 {
        self.orientation.conjugate() * (world - self.position)
    }

    /// Composition: `self` applied after `child`.
    pub fn combine(&self, child: &Transform) -> Transform {
        Transform {
            position: self.position + self.orientation * child.position,
            orientation: (self.orientation * child.orientation).normalize(),
        }
    }
}

/// Linear and angular velocity of a rigid body.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Velocity {
    pub linear: Vec3,
    pub angular: Vec3,
}

/// Extra scalar angular velocity about the body's local x-axis, used by
/// tire-like bodies to track wheel rotation precisely. The integrated angle
/// wraps at 2π into a turn counter so precision does not degrade as the
/// wheel accumulates revolutions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Spin {
    /// Angular rate in radians per second.
    pub rate: f32,
    /// Residual angle in `[0, 2π)`.
    pub angle: f32,
    /// Whole revolutions accumulated.
    pub turns: i64,
}

impl Spin {
    pub fn integrate(&mut self, dt: f32) {
        use std::f32::consts::TAU;
        self.angle += self.rate * dt;
        while self.angle >= TAU {
            self.angle -= TAU;
            self.turns += 1;
        }
        while self.angle < 0.0 {
            self.angle += TAU;
            self.turns -= 1;
        }
    }

    /// Total angle including full turns, for presentation only.
    pub fn total_angle(&self) -> f64 {
        self.turns as f64 * std::f64::consts::TAU + self.angle as f64
    }
}

/// Mass and inertia, with the inverses the solver needs. For static and
/// kinematic bodies all inverses are zero.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MassProperties {
    pub mass: f32,
    pub inverse_mass: f32,
    pub inertia: Mat3,
    pub inverse_inertia: Mat3,
    /// `R · I⁻¹ · Rᵀ`, refreshed from the orientation every step.
    pub inverse_inertia_world: Mat3,
}

impl Default for MassProperties {
    fn default() -> Self {
        Self {
            mass: 1.0,
            inverse_mass: 1.0,
            inertia: Mat3::IDENTITY,
            inverse_inertia: Mat3::IDENTITY,
            inverse_inertia_world: Mat3::IDENTITY,
        }
    }
}

impl MassProperties {
    pub fn new(mass: f32, inertia: Mat3) -> Self {
        let inverse_mass = if mass.is_finite() && mass > f32::EPSILON {
            1.0 / mass
        } else {
            0.0
        };
        let inverse_inertia = if inverse_mass > 0.0 && inertia.determinant().abs() > f32::EPSILON {
            inertia.inverse()
        } else {
            Mat3::ZERO
        };
        Self {
            mass,
            inverse_mass,
            inertia,
            inverse_inertia,
            inverse_inertia_world: inverse_inertia,
        }
    }

    /// Infinite mass for static and kinematic bodies.
    pub fn infinite() -> Self {
        Self {
            mass: f32::INFINITY,
            inverse_mass: 0.0,
            inertia: Mat3::ZERO,
            inverse_inertia: Mat3::ZERO,
            inverse_inertia_world: Mat3::ZERO,
        }
    }

    pub fn update_world_inertia(&mut self, orientation: Quat) {
        let rot = Mat3::from_quat(orientation);
        self.inverse_inertia_world = rot * self.inverse_inertia * rot.transpose();
    }
}

/// Surface response of a body. A body without a material is a sensor: it
/// tracks overlaps but generates no solver rows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Material {
    pub restitution: f32,
    pub friction: f32,
    pub spin_friction: f32,
    pub roll_friction: f32,
    pub stiffness: f32,
    pub damping: f32,
    /// Identifier for per-pair overrides in the [`MaterialMixTable`].
    pub id: Option<u32>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            restitution: 0.0,
            friction: 0.5,
            spin_friction: 0.0,
            roll_friction: 0.0,
            stiffness: LARGE_STIFFNESS,
            damping: LARGE_DAMPING,
            id: None,
        }
    }
}

/// Stiffness above this is treated as rigid; below it the contact normal row
/// becomes a spring-damper.
pub const LARGE_STIFFNESS: f32 = 1e18;
pub const LARGE_DAMPING: f32 = 1e10;

impl Material {
    pub fn is_rigid(&self) -> bool {
        self.stiffness >= LARGE_STIFFNESS
    }
}

/// Mixed coefficients applied to a single contact point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContactMaterial {
    pub restitution: f32,
    pub friction: f32,
    pub spin_friction: f32,
    pub roll_friction: f32,
    pub stiffness: f32,
    pub damping: f32,
}

impl Default for ContactMaterial {
    fn default() -> Self {
        Self::from_base(&Material::default())
    }
}

impl ContactMaterial {
    /// Product rule for restitution and friction; series combination for the
    /// spring coefficients so the softer surface dominates.
    pub fn mix(a: &Material, b: &Material) -> Self {
        Self {
            restitution: a.restitution * b.restitution,
            friction: a.friction * b.friction,
            spin_friction: a.spin_friction * b.spin_friction,
            roll_friction: a.roll_friction * b.roll_friction,
            stiffness: 1.0 / (1.0 / a.stiffness + 1.0 / b.stiffness),
            damping: 1.0 / (1.0 / a.damping + 1.0 / b.damping),
        }
    }

    pub fn from_base(base: &Material) -> Self {
        Self {
            restitution: base.restitution,
            friction: base.friction,
            spin_friction: base.spin_friction,
            roll_friction: base.roll_friction,
            stiffness: base.stiffness,
            damping: base.damping,
        }
    }

    pub fn is_rigid(&self) -> bool {
        self.stiffness >= LARGE_STIFFNESS
    }
}

/// Per-pair material overrides keyed on an unordered pair of material ids.
/// When a pair is registered, the override wins over the default mixing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaterialMixTable {
    overrides: HashMap<(u32, u32), Material>,
}

impl MaterialMixTable {
    fn key(id0: u32, id1: u32) -> (u32, u32) {
        if id0 <= id1 {
            (id0, id1)
        } else {
            (id1, id0)
        }
    }

    pub fn insert(&mut self, id0: u32, id1: u32, material: Material) {
        self.overrides.insert(Self::key(id0, id1), material);
    }

    pub fn contains(&self, id0: u32, id1: u32) -> bool {
        self.overrides.contains_key(&Self::key(id0, id1))
    }

    pub fn get(&self, id0: u32, id1: u32) -> Option<&Material> {
        self.overrides.get(&Self::key(id0, id1))
    }

    /// Mixes two materials, honoring a registered pair override.
    pub fn mix(&self, a: &Material, b: &Material) -> ContactMaterial {
        if let (Some(ida), Some(idb)) = (a.id, b.id) {
            if let Some(base) = self.get(ida, idb) {
                return ContactMaterial::from_base(base);
            }
        }
        ContactMaterial::mix(a, b)
    }
}

/// Interpolated transform for rendering. The presentation transform trails
/// the simulation by up to one fixed step and is advanced by the
/// coordinator using the body's velocity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Presentation {
    pub transform: Transform,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_wraps_into_turn_counter() {
        let mut spin = Spin {
            rate: std::f32::consts::TAU * 2.5,
            ..Default::default()
        };
        spin.integrate(1.0);
        assert_eq!(spin.turns, 2);
        assert!((spin.angle - std::f32::consts::PI).abs() < 1e-4);

        spin.rate = -spin.rate;
        spin.integrate(2.0);
        assert_eq!(spin.turns, -3);
    }

    #[test]
    fn pair_override_wins_over_product_mixing() {
        let a = Material {
            restitution: 0.5,
            id: Some(1),
            ..Default::default()
        };
        let b = Material {
            restitution: 0.5,
            id: Some(2),
            ..Default::default()
        };

        let mut table = MaterialMixTable::default();
        assert!((table.mix(&a, &b).restitution - 0.25).abs() < 1e-6);

        table.insert(
            2,
            1,
            Material {
                restitution: 0.9,
                ..Default::default()
            },
        );
        assert!((table.mix(&a, &b).restitution - 0.9).abs() < 1e-6);
    }

    #[test]
    fn infinite_mass_has_zero_inverses() {
        let props = MassProperties::infinite();
        assert_eq!(props.inverse_mass, 0.0);
        assert_eq!(props.inverse_inertia, Mat3::ZERO);
    }
}
