use crate::config::CONTACT_BREAKING_THRESHOLD;
use crate::core::graph::NodeIndex;
use crate::core::types::{MassProperties, Material, Presentation, Spin, Transform, Velocity};
use crate::shapes::{inertia, RotatedMesh, Shape};
use crate::utils::allocator::EntityId;
use glam::{Mat3, Quat, Vec3};
use serde::{Deserialize, Serialize};

/// How the solver treats a body. Static and kinematic bodies have infinite
/// mass; a kinematic body's velocity is application controlled while a
/// static body's is forced to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyKind {
    Dynamic,
    Kinematic,
    Static,
}

/// Group/mask pair filtering which bodies may interact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CollisionFilter {
    pub group: u32,
    pub mask: u32,
}

impl Default for CollisionFilter {
    fn default() -> Self {
        Self {
            group: 1,
            mask: u32::MAX,
        }
    }
}

impl CollisionFilter {
    /// Bodies may interact only if each one's group intersects the other's
    /// mask.
    pub fn test(&self, other: &CollisionFilter) -> bool {
        (self.group & other.mask) != 0 && (other.group & self.mask) != 0
    }
}

/// All components of one rigid body entity.
#[derive(Debug, Clone)]
pub struct RigidBody {
    pub id: EntityId,
    pub kind: BodyKind,
    pub transform: Transform,
    pub velocity: Velocity,
    /// Present on spin-enabled (tire-like) bodies.
    pub spin: Option<Spin>,
    pub mass: MassProperties,
    pub shape: Shape,
    pub aabb: crate::shapes::Aabb,
    pub filter: CollisionFilter,
    /// Absent for sensors: overlap is tracked but no solver rows are made.
    pub material: Option<Material>,
    pub presentation: Option<Presentation>,
    pub sleeping_disabled: bool,
    /// World-space copy of a polyhedron's vertices, private to this body.
    pub rotated: Option<RotatedMesh>,
    /// Back-link into the entity graph.
    pub(crate) node: NodeIndex,
    /// Dynamic bodies reside in exactly one island.
    pub(crate) island: Option<EntityId>,
    /// Static/kinematic bodies may reside in many islands.
    pub(crate) multi_islands: Vec<EntityId>,
}

impl RigidBody {
    pub fn is_dynamic(&self) -> bool {
        self.kind == BodyKind::Dynamic
    }

    pub fn is_static(&self) -> bool {
        self.kind == BodyKind::Static
    }

    pub fn is_sensor(&self) -> bool {
        self.material.is_none()
    }

    /// The island a dynamic body resides in.
    pub fn island(&self) -> Option<EntityId> {
        self.island
    }

    /// Islands a static or kinematic body is shared with.
    pub fn islands(&self) -> &[EntityId] {
        &self.multi_islands
    }

    pub fn apply_impulse(&mut self, impulse: Vec3, point: Vec3) {
        if !self.is_dynamic() {
            return;
        }
        self.velocity.linear += impulse * self.mass.inverse_mass;
        let torque = (point - self.transform.position).cross(impulse);
        self.velocity.angular += self.mass.inverse_inertia_world * torque;
    }

    /// Refreshes the world AABB, inflated by the contact-breaking margin so
    /// contacts are discovered slightly before shapes touch.
    pub fn update_aabb(&mut self) {
        self.aabb = self
            .shape
            .aabb(&self.transform)
            .inflated(CONTACT_BREAKING_THRESHOLD);
    }

    pub fn update_world_inertia(&mut self) {
        self.mass.update_world_inertia(self.transform.orientation);
    }

    pub fn update_rotated_mesh(&mut self) {
        if let (Some(rotated), Shape::Polyhedron { mesh }) = (&mut self.rotated, &self.shape) {
            rotated.update(mesh, self.transform.orientation);
        }
    }

    /// Angular velocity including the scalar spin component about the local
    /// x-axis, used where spin-coupled rows need the full rate.
    pub fn effective_angular_velocity(&self) -> Vec3 {
        match &self.spin {
            Some(spin) => {
                let spin_axis = self.transform.orientation * Vec3::X;
                self.velocity.angular + spin_axis * spin.rate
            }
            None => self.velocity.angular,
        }
    }
}

/// Builder for rigid bodies. Inertia is derived from the shape unless
/// overridden.
#[derive(Debug, Clone)]
pub struct RigidBodyDef {
    pub position: Vec3,
    pub orientation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub mass: f32,
    pub inertia: Option<Mat3>,
    pub shape: Shape,
    pub material: Option<Material>,
    pub filter: CollisionFilter,
    pub kind: BodyKind,
    pub presentation: bool,
    pub spin_enabled: bool,
    pub sleeping_disabled: bool,
}

impl Default for RigidBodyDef {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            mass: 1.0,
            inertia: None,
            shape: Shape::Sphere { radius: 1.0 },
            material: Some(Material::default()),
            filter: CollisionFilter::default(),
            kind: BodyKind::Dynamic,
            presentation: false,
            spin_enabled: false,
            sleeping_disabled: false,
        }
    }
}

impl RigidBodyDef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    pub fn orientation(mut self, orientation: Quat) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn linear_velocity(mut self, velocity: Vec3) -> Self {
        self.linear_velocity = velocity;
        self
    }

    pub fn angular_velocity(mut self, velocity: Vec3) -> Self {
        self.angular_velocity = velocity;
        self
    }

    pub fn mass(mut self, mass: f32) -> Self {
        self.mass = mass;
        self
    }

    pub fn inertia(mut self, inertia: Mat3) -> Self {
        self.inertia = Some(inertia);
        self
    }

    pub fn shape(mut self, shape: Shape) -> Self {
        self.shape = shape;
        self
    }

    pub fn material(mut self, material: Material) -> Self {
        self.material = Some(material);
        self
    }

    /// Makes the body a sensor: overlaps are reported, nothing is solved.
    pub fn sensor(mut self) -> Self {
        self.material = None;
        self
    }

    pub fn filter(mut self, group: u32, mask: u32) -> Self {
        self.filter = CollisionFilter { group, mask };
        self
    }

    pub fn kind(mut self, kind: BodyKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn presentation(mut self, enabled: bool) -> Self {
        self.presentation = enabled;
        self
    }

    pub fn spin_enabled(mut self, enabled: bool) -> Self {
        self.spin_enabled = enabled;
        self
    }

    pub fn sleeping_disabled(mut self, disabled: bool) -> Self {
        self.sleeping_disabled = disabled;
        self
    }

    pub(crate) fn build(self) -> RigidBody {
        debug_assert!(
            self.kind != BodyKind::Dynamic || self.mass > 0.0,
            "dynamic bodies require positive mass"
        );

        let mass = match self.kind {
            BodyKind::Dynamic => {
                let inertia = self
                    .inertia
                    .unwrap_or_else(|| inertia::moment_of_inertia(&self.shape, self.mass));
                MassProperties::new(self.mass, inertia)
            }
            BodyKind::Kinematic | BodyKind::Static => MassProperties::infinite(),
        };

        let rotated = match &self.shape {
            Shape::Polyhedron { .. } => Some(RotatedMesh::default()),
            _ => None,
        };

        let velocity = match self.kind {
            BodyKind::Static => Velocity::default(),
            _ => Velocity {
                linear: self.linear_velocity,
                angular: self.angular_velocity,
            },
        };

        let transform = Transform::new(self.position, self.orientation.normalize());

        let mut body = RigidBody {
            id: EntityId::default(),
            kind: self.kind,
            transform,
            velocity,
            spin: self.spin_enabled.then(Spin::default),
            mass,
            shape: self.shape,
            aabb: crate::shapes::Aabb::empty(),
            filter: self.filter,
            material: self.material,
            presentation: self.presentation.then(|| Presentation {
                transform,
            }),
            sleeping_disabled: self.sleeping_disabled,
            rotated,
            node: u32::MAX,
            island: None,
            multi_islands: Vec::new(),
        };
        body.update_world_inertia();
        body.update_rotated_mesh();
        body.update_aabb();
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_bodies_have_zero_inverse_mass() {
        let body = RigidBodyDef::new()
            .kind(BodyKind::Static)
            .shape(Shape::Plane {
                normal: Vec3::Y,
                constant: 0.0,
            })
            .build();
        assert_eq!(body.mass.inverse_mass, 0.0);
        assert_eq!(body.mass.inverse_inertia, Mat3::ZERO);
    }

    #[test]
    fn inertia_is_derived_from_shape() {
        let body = RigidBodyDef::new()
            .mass(1.0)
            .shape(Shape::Sphere { radius: 0.5 })
            .build();
        assert!((body.mass.inertia.x_axis.x - 0.1).abs() < 1e-6);
    }

    #[test]
    fn filters_must_agree_both_ways() {
        let a = CollisionFilter { group: 1, mask: 2 };
        let b = CollisionFilter { group: 2, mask: 1 };
        let c = CollisionFilter { group: 4, mask: 4 };
        assert!(a.test(&b));
        assert!(!a.test(&c));
    }

    #[test]
    fn aabb_carries_breaking_margin() {
        let body = RigidBodyDef::new()
            .shape(Shape::Sphere { radius: 0.5 })
            .build();
        assert!((body.aabb.max.x - (0.5 + CONTACT_BREAKING_THRESHOLD)).abs() < 1e-6);
    }
}
