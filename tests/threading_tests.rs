use archipelago::*;
use std::time::{Duration, Instant};

#[test]
fn registry_is_send_and_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Registry>();
}

#[test]
fn background_workers_advance_the_simulation() {
    let mut registry = Registry::new();
    let mut config = SimulationConfig::default();
    config.num_worker_threads = 2;
    attach(&mut registry, config);

    let ball = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.0, 100.0, 0.0))
            .shape(Shape::Sphere { radius: 0.5 }),
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut fell = false;
    while Instant::now() < deadline {
        update_now(&mut registry);
        std::thread::sleep(Duration::from_millis(10));
        if registry.body(ball).unwrap().transform.position.y < 99.0 {
            fell = true;
            break;
        }
    }
    assert!(fell, "worker never stepped the island");

    detach(&mut registry);
}

#[test]
fn settings_changes_propagate_to_workers() {
    let mut registry = Registry::new();
    let mut config = SimulationConfig::default();
    config.num_worker_threads = 2;
    attach(&mut registry, config);

    let ball = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.0, 10.0, 0.0))
            .shape(Shape::Sphere { radius: 0.5 }),
    );

    // Let the island reach a worker first, then reverse gravity so the
    // change has to travel through a settings message.
    update_now(&mut registry);
    std::thread::sleep(Duration::from_millis(20));
    update_now(&mut registry);
    set_gravity(&mut registry, Vec3::new(0.0, 9.81, 0.0));

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut rose = false;
    while Instant::now() < deadline {
        update_now(&mut registry);
        std::thread::sleep(Duration::from_millis(10));
        if registry.body(ball).unwrap().transform.position.y > 11.0 {
            rose = true;
            break;
        }
    }
    assert!(rose, "reversed gravity never took effect");

    detach(&mut registry);
}

#[test]
fn paused_workers_do_not_advance() {
    let mut registry = Registry::new();
    let mut config = SimulationConfig::default();
    config.num_worker_threads = 2;
    attach(&mut registry, config);
    set_paused(&mut registry, true);

    let ball = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.0, 10.0, 0.0))
            .shape(Shape::Sphere { radius: 0.5 }),
    );

    for _ in 0..10 {
        update_now(&mut registry);
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(registry.body(ball).unwrap().transform.position.y, 10.0);

    // While paused, explicit stepping still advances the world.
    step_simulation(&mut registry);
    assert!(registry.body(ball).unwrap().transform.position.y < 10.0);

    detach(&mut registry);
}

#[test]
fn detach_joins_the_worker_pool() {
    let mut registry = Registry::new();
    let mut config = SimulationConfig::default();
    config.num_worker_threads = 2;
    attach(&mut registry, config);

    make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.0, 10.0, 0.0))
            .shape(Shape::Sphere { radius: 0.5 }),
    );
    for _ in 0..5 {
        update_now(&mut registry);
        std::thread::sleep(Duration::from_millis(5));
    }

    // Must return even with live workers, and leave the registry clean.
    detach(&mut registry);
    assert_eq!(registry.num_islands(), 0);
}
