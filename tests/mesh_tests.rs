use archipelago::*;
use glam::Vec3;
use std::sync::Arc;

fn grid_mesh(size: u32) -> TriangleMesh {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    for z in 0..=size {
        for x in 0..=size {
            vertices.push(Vec3::new(x as f32, ((x + z) % 3) as f32 * 0.1, z as f32));
        }
    }
    let stride = size + 1;
    for z in 0..size {
        for x in 0..size {
            let v0 = z * stride + x;
            let v1 = v0 + 1;
            let v2 = v0 + stride + 1;
            let v3 = v0 + stride;
            indices.extend_from_slice(&[v0, v2, v1, v0, v3, v2]);
        }
    }
    TriangleMesh::new(vertices, indices)
}

#[test]
fn triangle_mesh_round_trips_byte_identically() {
    let mesh = grid_mesh(8);
    let mut bytes = Vec::new();
    mesh.write_to(&mut bytes).unwrap();

    let decoded = TriangleMesh::read_from(&mut bytes.as_slice()).unwrap();
    assert_eq!(mesh, decoded);

    let mut bytes_again = Vec::new();
    decoded.write_to(&mut bytes_again).unwrap();
    assert_eq!(bytes, bytes_again, "serialization must be byte-stable");
}

#[test]
fn truncated_mesh_data_is_rejected() {
    let mesh = grid_mesh(2);
    let mut bytes = Vec::new();
    mesh.write_to(&mut bytes).unwrap();
    bytes.truncate(bytes.len() / 2);
    assert!(TriangleMesh::read_from(&mut bytes.as_slice()).is_err());
}

#[test]
fn embedded_paged_mesh_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("terrain.apm");

    let pages = vec![grid_mesh(4), grid_mesh(6)];
    PagedTriangleMesh::write_embedded(&pages, &path).unwrap();

    let paged = PagedTriangleMesh::open_embedded(&path).unwrap();
    assert_eq!(paged.num_pages(), 2);
    assert!(!paged.is_loaded(0));

    // A query over an unloaded page sees nothing but requests the load.
    let query = Aabb::new(Vec3::splat(-1.0), Vec3::splat(10.0));
    let mut visited = 0;
    paged.visit_triangles(&query, |_, _, _| visited += 1);
    assert_eq!(visited, 0);

    paged.load_pending();
    let loaded = paged.drain_loaded_events();
    assert!(!loaded.is_empty());

    let mut visited = 0;
    paged.visit_triangles(&query, |_, _, _| visited += 1);
    assert!(visited > 0);

    for page in 0..paged.num_pages() {
        if paged.is_loaded(page) {
            assert_eq!(
                *paged.submesh(page).unwrap(),
                pages[page],
                "page {page} should decode to its source mesh"
            );
        }
    }
}

#[test]
fn external_paged_mesh_loads_sibling_files() {
    let dir = tempfile::tempdir().unwrap();
    let index_path = dir.path().join("terrain.apx");

    let pages = vec![grid_mesh(3), grid_mesh(5), grid_mesh(4)];
    PagedTriangleMesh::write_external(&pages, &index_path).unwrap();

    let paged = PagedTriangleMesh::open_external(&index_path).unwrap();
    assert_eq!(paged.num_pages(), 3);

    let query = Aabb::new(Vec3::splat(-1.0), Vec3::splat(10.0));
    paged.visit_triangles(&query, |_, _, _| {});
    paged.load_pending();
    paged.drain_loaded_events();

    for page in 0..paged.num_pages() {
        assert!(paged.is_loaded(page));
        assert_eq!(*paged.submesh(page).unwrap(), pages[page]);
    }
}

#[test]
fn missing_page_file_leaves_area_empty() {
    let dir = tempfile::tempdir().unwrap();
    let index_path = dir.path().join("terrain.apx");

    let pages = vec![grid_mesh(3)];
    PagedTriangleMesh::write_external(&pages, &index_path).unwrap();
    std::fs::remove_file(dir.path().join("terrain.0")).unwrap();

    let paged = PagedTriangleMesh::open_external(&index_path).unwrap();
    let query = Aabb::new(Vec3::splat(-1.0), Vec3::splat(10.0));
    paged.visit_triangles(&query, |_, _, _| panic!("nothing should be loaded"));
    paged.load_pending();

    // The failed load leaves the page unloaded; queries keep treating the
    // area as empty.
    assert!(!paged.is_loaded(0));
    assert!(paged.drain_loaded_events().is_empty());
    paged.visit_triangles(&query, |_, _, _| panic!("load failed, still empty"));
}

#[test]
fn bodies_collide_with_paged_meshes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ground.apm");
    let flat = TriangleMesh::new(
        vec![
            Vec3::new(-10.0, 0.0, -10.0),
            Vec3::new(10.0, 0.0, -10.0),
            Vec3::new(10.0, 0.0, 10.0),
            Vec3::new(-10.0, 0.0, 10.0),
        ],
        vec![0, 2, 1, 0, 3, 2],
    );
    PagedTriangleMesh::write_embedded(&[flat], &path).unwrap();
    let paged = Arc::new(PagedTriangleMesh::open_embedded(&path).unwrap());

    let mut registry = Registry::new();
    let mut config = SimulationConfig::default();
    config.settings.paused = true;
    config.num_worker_threads = 2;
    attach(&mut registry, config);

    make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .kind(BodyKind::Static)
            .shape(Shape::PagedMesh { mesh: paged }),
    );
    let ball = make_rigidbody(
        &mut registry,
        RigidBodyDef::new()
            .position(Vec3::new(0.0, 2.0, 0.0))
            .shape(Shape::Sphere { radius: 0.5 }),
    );

    for _ in 0..300 {
        step_simulation(&mut registry);
    }

    let y = registry.body(ball).unwrap().transform.position.y;
    assert!(y > 0.45 && y < 0.55, "sphere should rest on the page, y = {y}");

    detach(&mut registry);
}
