use super::Aabb;
use glam::Vec3;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Errors produced while decoding a serialized triangle mesh.
#[derive(Debug, Error)]
pub enum MeshDecodeError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("array length {0} exceeds sane bounds")]
    LengthOutOfBounds(u64),
    #[error("triangle index {index} out of bounds for {vertices} vertices")]
    IndexOutOfBounds { index: u32, vertices: usize },
}

/// Bit set packed 32 bits per word, the layout used on disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackedBits {
    words: Vec<u32>,
    len: usize,
}

impl PackedBits {
    pub fn with_len(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(32)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set(&mut self, index: usize, value: bool) {
        let word = index / 32;
        let bit = 1u32 << (index % 32);
        if value {
            self.words[word] |= bit;
        } else {
            self.words[word] &= !bit;
        }
    }

    pub fn get(&self, index: usize) -> bool {
        self.words[index / 32] & (1 << (index % 32)) != 0
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }
}

/// One node of the static triangle tree. Leaves store a triangle index;
/// internal nodes store their second child (the first child follows the
/// node directly in depth-first order).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangleTreeNode {
    pub bounds: Aabb,
    /// `u32::MAX` for internal nodes.
    pub triangle: u32,
    /// Index of the right child for internal nodes, unused in leaves.
    pub right_child: u32,
}

const TREE_NULL: u32 = u32::MAX;

/// Immutable triangle mesh with the adjacency tables narrowphase relies on:
/// per-edge vertices and faces, per-vertex edges, the normals of the faces
/// adjacent to each edge, and bit sets flagging boundary and convex edges.
/// Shared by reference; never mutated after construction.
#[derive(Debug, Clone, Default)]
pub struct TriangleMesh {
    vertices: Vec<Vec3>,
    indices: Vec<u32>,
    normals: Vec<Vec3>,
    edge_vertices: Vec<[u32; 2]>,
    vertex_edge_offsets: Vec<u32>,
    vertex_edge_indices: Vec<u32>,
    adjacent_normals: Vec<[Vec3; 2]>,
    face_edges: Vec<[u32; 3]>,
    edge_faces: Vec<[u32; 2]>,
    boundary_edges: PackedBits,
    convex_edges: PackedBits,
    tree: Vec<TriangleTreeNode>,
    bounds: Aabb,
}

impl TriangleMesh {
    pub fn new(vertices: Vec<Vec3>, indices: Vec<u32>) -> Self {
        debug_assert!(indices.len() % 3 == 0);
        let mut mesh = Self {
            vertices,
            indices,
            ..Default::default()
        };
        mesh.build_tables();
        mesh.build_tree();
        mesh
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_triangles(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn num_edges(&self) -> usize {
        self.edge_vertices.len()
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn vertex(&self, index: usize) -> Vec3 {
        self.vertices[index]
    }

    pub fn triangle_vertices(&self, tri: usize) -> [Vec3; 3] {
        [
            self.vertices[self.indices[tri * 3] as usize],
            self.vertices[self.indices[tri * 3 + 1] as usize],
            self.vertices[self.indices[tri * 3 + 2] as usize],
        ]
    }

    pub fn triangle_normal(&self, tri: usize) -> Vec3 {
        self.normals[tri]
    }

    pub fn edge_vertices(&self, edge: usize) -> [Vec3; 2] {
        let [a, b] = self.edge_vertices[edge];
        [self.vertices[a as usize], self.vertices[b as usize]]
    }

    pub fn is_boundary_edge(&self, edge: usize) -> bool {
        self.boundary_edges.get(edge)
    }

    pub fn is_convex_edge(&self, edge: usize) -> bool {
        self.convex_edges.get(edge)
    }

    pub fn adjacent_normals(&self, edge: usize) -> [Vec3; 2] {
        self.adjacent_normals[edge]
    }

    pub fn vertex_edges(&self, vertex: usize) -> &[u32] {
        let start = self.vertex_edge_offsets[vertex] as usize;
        let end = self
            .vertex_edge_offsets
            .get(vertex + 1)
            .map(|&o| o as usize)
            .unwrap_or(self.vertex_edge_indices.len());
        &self.vertex_edge_indices[start..end]
    }

    pub fn face_edges(&self, tri: usize) -> [u32; 3] {
        self.face_edges[tri]
    }

    pub fn edge_faces(&self, edge: usize) -> [u32; 2] {
        self.edge_faces[edge]
    }

    /// Visits every triangle whose bounds overlap `aabb`.
    pub fn visit_triangles(&self, aabb: &Aabb, mut f: impl FnMut(usize)) {
        if self.tree.is_empty() {
            return;
        }
        let mut stack = vec![0u32];
        while let Some(index) = stack.pop() {
            let node = &self.tree[index as usize];
            if !node.bounds.overlaps(aabb) {
                continue;
            }
            if node.triangle != TREE_NULL {
                f(node.triangle as usize);
            } else {
                stack.push(index + 1);
                stack.push(node.right_child);
            }
        }
    }

    /// Visits triangles intersected by the segment, in tree order.
    pub fn visit_triangles_segment(&self, p0: Vec3, p1: Vec3, mut f: impl FnMut(usize)) {
        if self.tree.is_empty() {
            return;
        }
        let mut stack = vec![0u32];
        while let Some(index) = stack.pop() {
            let node = &self.tree[index as usize];
            if node.bounds.intersect_segment(p0, p1).is_none() {
                continue;
            }
            if node.triangle != TREE_NULL {
                f(node.triangle as usize);
            } else {
                stack.push(index + 1);
                stack.push(node.right_child);
            }
        }
    }

    fn build_tables(&mut self) {
        let num_tris = self.num_triangles();
        self.normals = (0..num_tris)
            .map(|tri| {
                let [a, b, c] = self.triangle_vertices(tri);
                (b - a).cross(c - a).normalize_or_zero()
            })
            .collect();

        // Edges are unordered vertex pairs shared by up to two faces.
        let mut edge_map: HashMap<(u32, u32), u32> = HashMap::new();
        self.face_edges = vec![[0; 3]; num_tris];
        for tri in 0..num_tris {
            for corner in 0..3 {
                let v0 = self.indices[tri * 3 + corner];
                let v1 = self.indices[tri * 3 + (corner + 1) % 3];
                let key = if v0 < v1 { (v0, v1) } else { (v1, v0) };
                let edge = *edge_map.entry(key).or_insert_with(|| {
                    self.edge_vertices.push([key.0, key.1]);
                    self.edge_faces.push([TREE_NULL, TREE_NULL]);
                    (self.edge_vertices.len() - 1) as u32
                });
                self.face_edges[tri][corner] = edge;
                let faces = &mut self.edge_faces[edge as usize];
                if faces[0] == TREE_NULL {
                    faces[0] = tri as u32;
                } else {
                    faces[1] = tri as u32;
                }
            }
        }

        let num_edges = self.edge_vertices.len();
        self.boundary_edges = PackedBits::with_len(num_edges);
        self.convex_edges = PackedBits::with_len(num_edges);
        self.adjacent_normals = vec![[Vec3::ZERO; 2]; num_edges];

        for edge in 0..num_edges {
            let [f0, f1] = self.edge_faces[edge];
            if f1 == TREE_NULL {
                self.boundary_edges.set(edge, true);
                // Boundary edges behave as convex so their voronoi region is
                // not pruned during deep-contact checks.
                self.convex_edges.set(edge, true);
                let n0 = self.normals[f0 as usize];
                self.adjacent_normals[edge] = [n0, n0];
                self.edge_faces[edge][1] = f0;
            } else {
                let n0 = self.normals[f0 as usize];
                let n1 = self.normals[f1 as usize];
                self.adjacent_normals[edge] = [n0, n1];

                // The edge is convex when the second face lies behind the
                // first face's plane.
                let [a, b] = self.edge_vertices[edge];
                let on_edge = self.vertices[a as usize];
                let other = self.opposite_vertex(f1 as usize, a, b);
                let convex = n0.dot(other - on_edge) < 1e-6;
                self.convex_edges.set(edge, convex);
            }
        }

        // Vertex to incident edges, as an offset table over a flat list.
        let mut per_vertex: Vec<Vec<u32>> = vec![Vec::new(); self.vertices.len()];
        for (edge, [a, b]) in self.edge_vertices.iter().enumerate() {
            per_vertex[*a as usize].push(edge as u32);
            per_vertex[*b as usize].push(edge as u32);
        }
        self.vertex_edge_offsets = Vec::with_capacity(self.vertices.len());
        self.vertex_edge_indices.clear();
        for edges in &per_vertex {
            self.vertex_edge_offsets
                .push(self.vertex_edge_indices.len() as u32);
            self.vertex_edge_indices.extend_from_slice(edges);
        }

        self.bounds = Aabb::from_points(self.vertices.iter().copied());
    }

    fn opposite_vertex(&self, tri: usize, a: u32, b: u32) -> Vec3 {
        for corner in 0..3 {
            let v = self.indices[tri * 3 + corner];
            if v != a && v != b {
                return self.vertices[v as usize];
            }
        }
        self.vertices[a as usize]
    }

    fn build_tree(&mut self) {
        self.tree.clear();
        let num_tris = self.num_triangles();
        if num_tris == 0 {
            return;
        }
        let mut tris: Vec<u32> = (0..num_tris as u32).collect();
        let bounds: Vec<Aabb> = (0..num_tris)
            .map(|tri| Aabb::from_points(self.triangle_vertices(tri)))
            .collect();
        self.build_tree_node(&mut tris, &bounds);
    }

    /// Median split on the longest axis; one triangle per leaf. Children are
    /// laid out depth first so the left child is implicit.
    fn build_tree_node(&mut self, tris: &mut [u32], bounds: &[Aabb]) -> u32 {
        let mut node_bounds = Aabb::empty();
        for &tri in tris.iter() {
            node_bounds = node_bounds.union(&bounds[tri as usize]);
        }

        let index = self.tree.len() as u32;
        if tris.len() == 1 {
            self.tree.push(TriangleTreeNode {
                bounds: node_bounds,
                triangle: tris[0],
                right_child: TREE_NULL,
            });
            return index;
        }

        self.tree.push(TriangleTreeNode {
            bounds: node_bounds,
            triangle: TREE_NULL,
            right_child: TREE_NULL,
        });

        let extent = node_bounds.max - node_bounds.min;
        let axis = if extent.x >= extent.y && extent.x >= extent.z {
            0
        } else if extent.y >= extent.z {
            1
        } else {
            2
        };
        tris.sort_by(|&a, &b| {
            bounds[a as usize].center()[axis]
                .partial_cmp(&bounds[b as usize].center()[axis])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mid = tris.len() / 2;
        let (left, right) = tris.split_at_mut(mid);
        self.build_tree_node(left, bounds);
        let right_index = self.build_tree_node(right, bounds);
        self.tree[index as usize].right_child = right_index;
        index
    }

    /// Writes the mesh in its on-disk layout: vertices, indices, normals,
    /// edge→vertex, vertex→edge, adjacent-face normals, face→edge,
    /// edge→face, boundary bitset, convex bitset, triangle tree. Every
    /// array is prefixed by a 64-bit element count.
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        write_vec3_array(w, &self.vertices)?;
        write_u32_array(w, &self.indices)?;
        write_vec3_array(w, &self.normals)?;

        write_count(w, self.edge_vertices.len())?;
        for pair in &self.edge_vertices {
            write_u32(w, pair[0])?;
            write_u32(w, pair[1])?;
        }

        write_u32_array(w, &self.vertex_edge_offsets)?;
        write_u32_array(w, &self.vertex_edge_indices)?;

        write_count(w, self.adjacent_normals.len())?;
        for pair in &self.adjacent_normals {
            write_vec3(w, pair[0])?;
            write_vec3(w, pair[1])?;
        }

        write_count(w, self.face_edges.len())?;
        for edges in &self.face_edges {
            for &e in edges {
                write_u32(w, e)?;
            }
        }

        write_count(w, self.edge_faces.len())?;
        for faces in &self.edge_faces {
            write_u32(w, faces[0])?;
            write_u32(w, faces[1])?;
        }

        write_bits(w, &self.boundary_edges)?;
        write_bits(w, &self.convex_edges)?;

        write_count(w, self.tree.len())?;
        for node in &self.tree {
            write_vec3(w, node.bounds.min)?;
            write_vec3(w, node.bounds.max)?;
            write_u32(w, node.triangle)?;
            write_u32(w, node.right_child)?;
        }

        Ok(())
    }

    pub fn read_from(r: &mut impl Read) -> Result<Self, MeshDecodeError> {
        let vertices = read_vec3_array(r)?;
        let indices = read_u32_array(r)?;
        for &index in &indices {
            if index as usize >= vertices.len() {
                return Err(MeshDecodeError::IndexOutOfBounds {
                    index,
                    vertices: vertices.len(),
                });
            }
        }
        let normals = read_vec3_array(r)?;

        let num_edges = read_count(r)?;
        let mut edge_vertices = Vec::with_capacity(num_edges);
        for _ in 0..num_edges {
            edge_vertices.push([read_u32(r)?, read_u32(r)?]);
        }

        let vertex_edge_offsets = read_u32_array(r)?;
        let vertex_edge_indices = read_u32_array(r)?;

        let num_adjacent = read_count(r)?;
        let mut adjacent_normals = Vec::with_capacity(num_adjacent);
        for _ in 0..num_adjacent {
            adjacent_normals.push([read_vec3(r)?, read_vec3(r)?]);
        }

        let num_faces = read_count(r)?;
        let mut face_edges = Vec::with_capacity(num_faces);
        for _ in 0..num_faces {
            face_edges.push([read_u32(r)?, read_u32(r)?, read_u32(r)?]);
        }

        let num_edge_faces = read_count(r)?;
        let mut edge_faces = Vec::with_capacity(num_edge_faces);
        for _ in 0..num_edge_faces {
            edge_faces.push([read_u32(r)?, read_u32(r)?]);
        }

        let boundary_edges = read_bits(r)?;
        let convex_edges = read_bits(r)?;

        let num_nodes = read_count(r)?;
        let mut tree = Vec::with_capacity(num_nodes);
        for _ in 0..num_nodes {
            tree.push(TriangleTreeNode {
                bounds: Aabb::new(read_vec3(r)?, read_vec3(r)?),
                triangle: read_u32(r)?,
                right_child: read_u32(r)?,
            });
        }

        let bounds = Aabb::from_points(vertices.iter().copied());
        Ok(Self {
            vertices,
            indices,
            normals,
            edge_vertices,
            vertex_edge_offsets,
            vertex_edge_indices,
            adjacent_normals,
            face_edges,
            edge_faces,
            boundary_edges,
            convex_edges,
            tree,
            bounds,
        })
    }
}

impl PartialEq for TriangleMesh {
    fn eq(&self, other: &Self) -> bool {
        self.vertices == other.vertices
            && self.indices == other.indices
            && self.normals == other.normals
            && self.edge_vertices == other.edge_vertices
            && self.vertex_edge_offsets == other.vertex_edge_offsets
            && self.vertex_edge_indices == other.vertex_edge_indices
            && self.adjacent_normals == other.adjacent_normals
            && self.face_edges == other.face_edges
            && self.edge_faces == other.edge_faces
            && self.boundary_edges == other.boundary_edges
            && self.convex_edges == other.convex_edges
            && self.tree == other.tree
    }
}

const MAX_ARRAY_LEN: u64 = 1 << 32;

fn write_count(w: &mut impl Write, count: usize) -> io::Result<()> {
    w.write_all(&(count as u64).to_le_bytes())
}

fn read_count(r: &mut impl Read) -> Result<usize, MeshDecodeError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    let count = u64::from_le_bytes(buf);
    if count > MAX_ARRAY_LEN {
        return Err(MeshDecodeError::LengthOutOfBounds(count));
    }
    Ok(count as usize)
}

fn write_u32(w: &mut impl Write, value: u32) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

fn read_u32(r: &mut impl Read) -> Result<u32, MeshDecodeError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_f32(w: &mut impl Write, value: f32) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

fn read_f32(r: &mut impl Read) -> Result<f32, MeshDecodeError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn write_vec3(w: &mut impl Write, v: Vec3) -> io::Result<()> {
    write_f32(w, v.x)?;
    write_f32(w, v.y)?;
    write_f32(w, v.z)
}

fn read_vec3(r: &mut impl Read) -> Result<Vec3, MeshDecodeError> {
    Ok(Vec3::new(read_f32(r)?, read_f32(r)?, read_f32(r)?))
}

fn write_vec3_array(w: &mut impl Write, array: &[Vec3]) -> io::Result<()> {
    write_count(w, array.len())?;
    for &v in array {
        write_vec3(w, v)?;
    }
    Ok(())
}

fn read_vec3_array(r: &mut impl Read) -> Result<Vec<Vec3>, MeshDecodeError> {
    let count = read_count(r)?;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(read_vec3(r)?);
    }
    Ok(out)
}

fn write_u32_array(w: &mut impl Write, array: &[u32]) -> io::Result<()> {
    write_count(w, array.len())?;
    for &v in array {
        write_u32(w, v)?;
    }
    Ok(())
}

fn read_u32_array(r: &mut impl Read) -> Result<Vec<u32>, MeshDecodeError> {
    let count = read_count(r)?;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(read_u32(r)?);
    }
    Ok(out)
}

/// Bool arrays are written as their logical length followed by 32-bit words.
fn write_bits(w: &mut impl Write, bits: &PackedBits) -> io::Result<()> {
    write_count(w, bits.len())?;
    for &word in bits.words() {
        write_u32(w, word)?;
    }
    Ok(())
}

fn read_bits(r: &mut impl Read) -> Result<PackedBits, MeshDecodeError> {
    let len = read_count(r)?;
    let mut bits = PackedBits::with_len(len);
    for word in bits.words.iter_mut() {
        *word = read_u32(r)?;
    }
    Ok(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_mesh() -> TriangleMesh {
        // Two triangles sharing the diagonal edge, forming a unit quad.
        TriangleMesh::new(
            vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 1.0),
                Vec3::new(0.0, 0.0, 1.0),
            ],
            vec![0, 2, 1, 0, 3, 2],
        )
    }

    #[test]
    fn quad_has_five_edges_one_interior() {
        let mesh = quad_mesh();
        assert_eq!(mesh.num_edges(), 5);
        let boundary_count = (0..mesh.num_edges())
            .filter(|&e| mesh.is_boundary_edge(e))
            .count();
        assert_eq!(boundary_count, 4);
    }

    #[test]
    fn coplanar_interior_edge_is_convex() {
        let mesh = quad_mesh();
        let interior = (0..mesh.num_edges())
            .find(|&e| !mesh.is_boundary_edge(e))
            .unwrap();
        assert!(mesh.is_convex_edge(interior));
        let [n0, n1] = mesh.adjacent_normals(interior);
        assert!(n0.dot(n1) > 0.999);
    }

    #[test]
    fn tree_query_finds_overlapping_triangles() {
        let mesh = quad_mesh();
        let mut hits = Vec::new();
        mesh.visit_triangles(
            &Aabb::new(Vec3::new(0.8, -0.1, 0.1), Vec3::new(0.9, 0.1, 0.2)),
            |tri| hits.push(tri),
        );
        assert!(!hits.is_empty());
    }

    #[test]
    fn serialization_round_trips_byte_identically() {
        let mesh = quad_mesh();
        let mut bytes = Vec::new();
        mesh.write_to(&mut bytes).unwrap();

        let decoded = TriangleMesh::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(mesh, decoded);

        let mut bytes_again = Vec::new();
        decoded.write_to(&mut bytes_again).unwrap();
        assert_eq!(bytes, bytes_again);
    }
}
