use archipelago::*;

const DT: f32 = 1.0 / 60.0;

fn attached_registry() -> Registry {
    let mut registry = Registry::new();
    let mut config = SimulationConfig::default();
    config.settings.paused = true;
    config.num_worker_threads = 2;
    attach(&mut registry, config);
    registry
}

fn ground_plane(registry: &mut Registry, restitution: f32, friction: f32) -> EntityId {
    make_rigidbody(
        registry,
        RigidBodyDef::new()
            .kind(BodyKind::Static)
            .shape(Shape::Plane {
                normal: Vec3::Y,
                constant: 0.0,
            })
            .material(Material {
                restitution,
                friction,
                ..Default::default()
            }),
    )
}

#[test]
fn free_fall_matches_analytic_solution() {
    let mut registry = attached_registry();
    let ball = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.0, 10.0, 0.0))
            .mass(1.0)
            .shape(Shape::Sphere { radius: 0.5 }),
    );

    for _ in 0..60 {
        step_simulation(&mut registry);
    }

    let body = registry.body(ball).unwrap();
    // Symplectic Euler lands slightly below the continuous solution of
    // 10 - g/2 = 5.095.
    assert!(
        (body.transform.position.y - 5.095).abs() < 0.1,
        "y = {}",
        body.transform.position.y
    );
    assert!((body.velocity.linear.y + 9.81).abs() < 1e-3);

    detach(&mut registry);
}

#[test]
fn box_rests_on_plane_and_sleeps() {
    let mut registry = attached_registry();
    ground_plane(&mut registry, 0.0, 0.5);
    let cube = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.0, 0.5, 0.0))
            .mass(1.0)
            .shape(Shape::Box {
                half_extents: Vec3::splat(0.5),
            })
            .material(Material {
                restitution: 0.0,
                friction: 0.5,
                ..Default::default()
            }),
    );

    for _ in 0..300 {
        step_simulation(&mut registry);
    }

    let body = registry.body(cube).unwrap();
    assert!(
        body.transform.position.y > 0.499 && body.transform.position.y < 0.501,
        "box settled at y = {}",
        body.transform.position.y
    );
    assert!(body.velocity.linear.length() < 1e-3);

    let island = body.island().expect("dynamic body must reside in an island");
    assert!(registry.island(island).unwrap().is_sleeping());

    detach(&mut registry);
}

#[test]
fn elastic_bounce_preserves_speed() {
    let mut registry = attached_registry();
    ground_plane(&mut registry, 1.0, 0.0);
    let ball = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.0, 5.0, 0.0))
            .mass(1.0)
            .shape(Shape::Sphere { radius: 0.5 })
            .material(Material {
                restitution: 1.0,
                friction: 0.0,
                ..Default::default()
            }),
    );

    let mut previous_vy = 0.0f32;
    let mut bounce_checked = false;
    for _ in 0..240 {
        step_simulation(&mut registry);
        let vy = registry.body(ball).unwrap().velocity.linear.y;
        if previous_vy < -1.0 && vy > 0.0 {
            // The bounce step first applies gravity, then reflects.
            let expected = -previous_vy + 9.81 * DT;
            assert!(
                (vy - expected).abs() < 1e-3,
                "pre {previous_vy} post {vy} expected {expected}"
            );
            bounce_checked = true;
            break;
        }
        previous_vy = vy;
    }
    assert!(bounce_checked, "sphere never bounced");

    detach(&mut registry);
}

#[test]
fn rejecting_filters_never_create_a_manifold() {
    let mut registry = attached_registry();
    let a = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::ZERO)
            .shape(Shape::Sphere { radius: 0.5 })
            .filter(1, 2),
    );
    let b = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.25, 0.0, 0.0))
            .shape(Shape::Sphere { radius: 0.5 })
            .filter(1, 2),
    );

    let y_before_a = registry.body(a).unwrap().transform.position.y;
    for _ in 0..30 {
        step_simulation(&mut registry);
        assert!(!manifold_exists(&registry, a, b));
    }

    // Both fell freely and identically.
    let body_a = registry.body(a).unwrap();
    let body_b = registry.body(b).unwrap();
    assert!(body_a.transform.position.y < y_before_a);
    assert!((body_a.transform.position.y - body_b.transform.position.y).abs() < 1e-6);

    detach(&mut registry);
}

#[test]
fn zero_velocity_body_without_forces_stays_exactly_still() {
    let mut registry = attached_registry();
    set_gravity(&mut registry, Vec3::ZERO);
    let ball = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(1.0, 2.0, 3.0))
            .shape(Shape::Sphere { radius: 0.5 }),
    );

    for _ in 0..10 {
        step_simulation(&mut registry);
    }

    let body = registry.body(ball).unwrap();
    assert_eq!(body.transform.position, Vec3::new(1.0, 2.0, 3.0));
    assert_eq!(body.velocity.linear, Vec3::ZERO);
    assert_eq!(body.velocity.angular, Vec3::ZERO);

    detach(&mut registry);
}

#[test]
fn orientations_stay_unit_and_world_inertia_tracks_rotation() {
    let mut registry = attached_registry();
    set_gravity(&mut registry, Vec3::ZERO);
    let body_id = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .shape(Shape::Box {
                half_extents: Vec3::new(1.0, 0.2, 0.4),
            })
            .angular_velocity(Vec3::new(3.0, 7.0, -2.0)),
    );

    for _ in 0..120 {
        step_simulation(&mut registry);
        let body = registry.body(body_id).unwrap();
        assert!((body.transform.orientation.length() - 1.0).abs() < 1e-5);

        let rot = Mat3::from_quat(body.transform.orientation);
        let expected = rot * body.mass.inverse_inertia * rot.transpose();
        let actual = body.mass.inverse_inertia_world;
        let diff = (actual.x_axis - expected.x_axis).length()
            + (actual.y_axis - expected.y_axis).length()
            + (actual.z_axis - expected.z_axis).length();
        assert!(diff < 1e-4);
    }

    detach(&mut registry);
}

#[test]
fn manifold_points_stay_bounded_with_unit_normals() {
    let mut registry = attached_registry();
    ground_plane(&mut registry, 0.0, 0.5);
    let a = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.0, 0.5, 0.0))
            .shape(Shape::Box {
                half_extents: Vec3::splat(0.5),
            }),
    );
    let b = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.3, 1.5, 0.0))
            .shape(Shape::Box {
                half_extents: Vec3::splat(0.5),
            }),
    );

    for _ in 0..120 {
        step_simulation(&mut registry);
        for id in [a, b] {
            visit_edges(&registry, id, |entity, kind| {
                if kind == EdgeKind::Manifold {
                    let manifold = registry.manifold(entity).unwrap();
                    assert!(manifold.num_points() <= 4);
                    for point in manifold.points() {
                        assert!((point.normal.length() - 1.0).abs() < 1e-4);
                    }
                }
            });
        }
    }

    detach(&mut registry);
}

#[test]
fn sensors_overlap_without_response()
{
    let mut registry = attached_registry();
    ground_plane(&mut registry, 0.0, 0.5);
    let sensor = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.0, 0.4, 0.0))
            .shape(Shape::Sphere { radius: 0.5 })
            .sensor(),
    );

    for _ in 0..30 {
        step_simulation(&mut registry);
    }

    // The sensor fell through the ground: overlap is tracked, nothing
    // pushes back.
    let body = registry.body(sensor).unwrap();
    assert!(body.transform.position.y < 0.0);

    detach(&mut registry);
}

#[test]
fn attach_then_detach_leaves_no_engine_components() {
    let mut registry = attached_registry();
    ground_plane(&mut registry, 0.0, 0.5);
    make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.0, 0.5, 0.0))
            .shape(Shape::Box {
                half_extents: Vec3::splat(0.5),
            }),
    );
    for _ in 0..10 {
        step_simulation(&mut registry);
    }
    assert!(registry.num_manifolds() > 0);
    assert!(registry.num_islands() > 0);

    detach(&mut registry);
    assert_eq!(registry.num_manifolds(), 0);
    assert_eq!(registry.num_islands(), 0);
    // Application bodies survive.
    assert_eq!(registry.num_bodies(), 2);
    for body in registry.bodies() {
        assert!(body.island().is_none());
        assert!(body.islands().is_empty());
    }
}

#[test]
fn material_pair_override_changes_contact_response() {
    let mut registry = attached_registry();

    // Dead pair by default, bouncy through the override table.
    insert_material_mixing(
        &mut registry,
        7,
        9,
        Material {
            restitution: 1.0,
            friction: 0.0,
            ..Default::default()
        },
    );

    make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .kind(BodyKind::Static)
            .shape(Shape::Plane {
                normal: Vec3::Y,
                constant: 0.0,
            })
            .material(Material {
                restitution: 0.0,
                id: Some(7),
                ..Default::default()
            }),
    );
    let ball = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.0, 3.0, 0.0))
            .shape(Shape::Sphere { radius: 0.5 })
            .material(Material {
                restitution: 0.0,
                id: Some(9),
                ..Default::default()
            }),
    );

    let mut bounced = false;
    for _ in 0..240 {
        step_simulation(&mut registry);
        if registry.body(ball).unwrap().velocity.linear.y > 1.0 {
            bounced = true;
            break;
        }
    }
    assert!(bounced, "override restitution should make the sphere bounce");

    detach(&mut registry);
}
