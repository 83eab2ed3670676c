use archipelago::dynamics::constraints::DistanceJoint;
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

fn chain_link(registry: &mut Registry, x: f32) -> EntityId {
    make_rigidbody(
        registry,
        RigidBodyDef::new()
            .position(Vec3::new(x, 0.0, 0.0))
            .shape(Shape::Sphere { radius: 0.1 })
            .filter(1, 0), // keep contacts out of the picture
    )
}

fn link_joint(registry: &mut Registry, a: EntityId, b: EntityId) -> EntityId {
    make_constraint(
        registry,
        a,
        b,
        Joint::Distance(DistanceJoint {
            pivot_a: Vec3::ZERO,
            pivot_b: Vec3::ZERO,
            distance: 1.0,
            impulse: 0.0,
        }),
    )
}

#[test]
fn chain_forms_one_island_then_splits_in_two() {
    let mut registry = attached_registry();

    let bodies: Vec<EntityId> = (0..6).map(|i| chain_link(&mut registry, i as f32)).collect();
    let mut joints = Vec::new();
    for i in 0..5 {
        joints.push(link_joint(&mut registry, bodies[i], bodies[i + 1]));
    }

    step_simulation(&mut registry);
    assert_eq!(registry.num_islands(), 1, "chain should form one island");

    destroy_constraint(&mut registry, joints[2]);
    step_simulation(&mut registry);

    assert_eq!(registry.num_islands(), 2, "cut chain should split");
    let mut sizes: Vec<usize> = registry
        .islands()
        .map(|(_, island)| island.nodes.len())
        .collect();
    sizes.sort();
    assert_eq!(sizes, vec![3, 3]);

    // Every body resides in exactly one island and that island knows it.
    for &body_id in &bodies {
        let body = registry.body(body_id).unwrap();
        let island_id = body.island().expect("dynamic body without island");
        assert!(registry
            .island(island_id)
            .unwrap()
            .nodes
            .contains(&body_id));
    }

    detach(&mut registry);
}

#[test]
fn merge_then_split_restores_the_partition() {
    let mut registry = attached_registry();

    let a0 = chain_link(&mut registry, 0.0);
    let a1 = chain_link(&mut registry, 1.0);
    let b0 = chain_link(&mut registry, 10.0);
    let b1 = chain_link(&mut registry, 11.0);
    link_joint(&mut registry, a0, a1);
    link_joint(&mut registry, b0, b1);

    step_simulation(&mut registry);
    assert_eq!(registry.num_islands(), 2);

    let bridge = link_joint(&mut registry, a1, b0);
    step_simulation(&mut registry);
    assert_eq!(registry.num_islands(), 1, "bridge joint should merge");

    destroy_constraint(&mut registry, bridge);
    step_simulation(&mut registry);
    assert_eq!(registry.num_islands(), 2, "removing the bridge should split");

    let mut partitions: Vec<Vec<EntityId>> = registry
        .islands()
        .map(|(_, island)| {
            let mut nodes = island.nodes.clone();
            nodes.sort();
            nodes
        })
        .collect();
    partitions.sort();
    let mut expected = vec![vec![a0, a1], vec![b0, b1]];
    for p in &mut expected {
        p.sort();
    }
    expected.sort();
    assert_eq!(partitions, expected);

    detach(&mut registry);
}

#[test]
fn static_bodies_are_shared_between_islands() {
    let mut registry = attached_registry();
    set_gravity(&mut registry, Vec3::new(0.0, -9.81, 0.0));

    let ground = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .kind(BodyKind::Static)
            .shape(Shape::Plane {
                normal: Vec3::Y,
                constant: 0.0,
            }),
    );
    // Two boxes far apart, both resting on the same ground.
    for x in [0.0, 100.0] {
        make_rigidbody(
            &mut registry,
            RigidBodyDef::new()
                .position(Vec3::new(x, 0.5, 0.0))
                .shape(Shape::Box {
                    half_extents: Vec3::splat(0.5),
                }),
        );
    }

    for _ in 0..5 {
        step_simulation(&mut registry);
    }

    assert_eq!(registry.num_islands(), 2);
    let ground_body = registry.body(ground).unwrap();
    assert!(ground_body.island().is_none());
    assert_eq!(ground_body.islands().len(), 2);

    detach(&mut registry);
}

#[test]
fn destroying_a_body_cascades_to_its_edges() {
    let mut registry = attached_registry();

    let a = chain_link(&mut registry, 0.0);
    let b = chain_link(&mut registry, 1.0);
    let c = chain_link(&mut registry, 2.0);
    link_joint(&mut registry, a, b);
    link_joint(&mut registry, b, c);
    step_simulation(&mut registry);
    assert_eq!(registry.num_islands(), 1);

    destroy_rigidbody(&mut registry, b);
    step_simulation(&mut registry);

    assert_eq!(registry.num_islands(), 2);
    let mut edge_count = 0;
    visit_edges(&registry, a, |_, _| edge_count += 1);
    assert_eq!(edge_count, 0);

    detach(&mut registry);
}

#[test]
fn waking_a_sleeping_island_through_external_write() {
    let mut registry = attached_registry();
    set_gravity(&mut registry, Vec3::new(0.0, -9.81, 0.0));

    make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .kind(BodyKind::Static)
            .shape(Shape::Plane {
                normal: Vec3::Y,
                constant: 0.0,
            }),
    );
    let cube = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.0, 0.5, 0.0))
            .shape(Shape::Box {
                half_extents: Vec3::splat(0.5),
            }),
    );

    for _ in 0..300 {
        step_simulation(&mut registry);
    }
    let island_id = registry.body(cube).unwrap().island().unwrap();
    assert!(registry.island(island_id).unwrap().is_sleeping());

    // Kick it through the public mutable accessor.
    registry.body_mut(cube).unwrap().velocity.linear = Vec3::new(0.0, 5.0, 0.0);
    step_simulation(&mut registry);

    let island_id = registry.body(cube).unwrap().island().unwrap();
    assert!(!registry.island(island_id).unwrap().is_sleeping());
    assert!(registry.body(cube).unwrap().velocity.linear.y > 0.0);

    detach(&mut registry);
}

#[test]
fn sleeping_disabled_vetoes_island_sleep() {
    let mut registry = attached_registry();
    set_gravity(&mut registry, Vec3::new(0.0, -9.81, 0.0));

    make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .kind(BodyKind::Static)
            .shape(Shape::Plane {
                normal: Vec3::Y,
                constant: 0.0,
            }),
    );
    let cube = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.0, 0.5, 0.0))
            .shape(Shape::Box {
                half_extents: Vec3::splat(0.5),
            })
            .sleeping_disabled(true),
    );

    for _ in 0..300 {
        step_simulation(&mut registry);
    }

    let island_id = registry.body(cube).unwrap().island().unwrap();
    assert!(!registry.island(island_id).unwrap().is_sleeping());

    detach(&mut registry);
}
