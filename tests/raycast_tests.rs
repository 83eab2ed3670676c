use archipelago::*;

fn attached_registry() -> Registry {
    let mut registry = Registry::new();
    let mut config = SimulationConfig::default();
    config.settings.paused = true;
    config.settings.gravity = Vec3::ZERO;
    config.num_worker_threads = 2;
    attach(&mut registry, config);
    registry
}

#[test]
fn raycast_through_compound_reports_left_child() {
    let mut registry = attached_registry();
    let compound = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .kind(BodyKind::Static)
            .shape(Shape::Compound {
                children: vec![
                    CompoundChild {
                        transform: Transform::from_position(Vec3::new(-1.0, 0.0, 0.0)),
                        shape: Shape::Cylinder {
                            radius: 0.5,
                            half_length: 0.5,
                        },
                    },
                    CompoundChild {
                        transform: Transform::from_position(Vec3::new(1.0, 0.0, 0.0)),
                        shape: Shape::Cylinder {
                            radius: 0.5,
                            half_length: 0.5,
                        },
                    },
                ],
            }),
    );

    // Broadphase proxies appear on the first step.
    step_simulation(&mut registry);

    let hit = raycast(
        &registry,
        Vec3::new(-2.0, 0.1, 0.0),
        Vec3::new(2.0, 0.1, 0.0),
    )
    .expect("segment should hit the compound");

    assert_eq!(hit.entity, compound);
    // Left cylinder cap at x = -1.5, four units of segment.
    assert!((hit.fraction - 0.125).abs() < 1e-3, "fraction {}", hit.fraction);
    assert_eq!(hit.feature, Some(0));

    detach(&mut registry);
}

#[test]
fn raycast_picks_the_nearest_of_several_bodies() {
    let mut registry = attached_registry();
    let near = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(2.0, 0.0, 0.0))
            .shape(Shape::Sphere { radius: 0.5 }),
    );
    make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(5.0, 0.0, 0.0))
            .shape(Shape::Sphere { radius: 0.5 }),
    );
    step_simulation(&mut registry);

    let hit = raycast(
        &registry,
        Vec3::new(0.0, 0.0, 0.0),
        Vec3::new(10.0, 0.0, 0.0),
    )
    .unwrap();
    assert_eq!(hit.entity, near);
    assert!((hit.fraction - 0.15).abs() < 1e-3);

    detach(&mut registry);
}

#[test]
fn raycast_misses_return_none() {
    let mut registry = attached_registry();
    make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.0, 5.0, 0.0))
            .shape(Shape::Sphere { radius: 0.5 }),
    );
    step_simulation(&mut registry);

    assert!(raycast(
        &registry,
        Vec3::new(0.0, 0.0, 0.0),
        Vec3::new(10.0, 0.0, 0.0),
    )
    .is_none());

    detach(&mut registry);
}

#[test]
fn query_aabb_returns_overlapping_bodies() {
    let mut registry = attached_registry();
    let inside = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.0, 0.0, 0.0))
            .shape(Shape::Sphere { radius: 0.5 }),
    );
    make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(50.0, 0.0, 0.0))
            .shape(Shape::Sphere { radius: 0.5 }),
    );
    step_simulation(&mut registry);

    let found = query_aabb(
        &registry,
        &Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0)),
    );
    assert!(found.contains(&inside));
    assert_eq!(found.len(), 1);

    detach(&mut registry);
}

#[test]
fn raycast_against_triangle_mesh() {
    let mut registry = attached_registry();
    let mesh = TriangleMesh::new(
        vec![
            Vec3::new(-5.0, 0.0, -5.0),
            Vec3::new(5.0, 0.0, -5.0),
            Vec3::new(5.0, 0.0, 5.0),
            Vec3::new(-5.0, 0.0, 5.0),
        ],
        vec![0, 2, 1, 0, 3, 2],
    );
    make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .kind(BodyKind::Static)
            .shape(Shape::Mesh {
                mesh: std::sync::Arc::new(mesh),
            }),
    );
    step_simulation(&mut registry);

    let hit = raycast(
        &registry,
        Vec3::new(0.5, 2.0, 0.5),
        Vec3::new(0.5, -2.0, 0.5),
    )
    .unwrap();
    assert!((hit.fraction - 0.5).abs() < 1e-4);
    assert!(hit.normal.y > 0.99);
    assert!(hit.feature.is_some());

    detach(&mut registry);
}
