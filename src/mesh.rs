// Mesh loading from OBJ files
//
// Faces with more than three corners are fan-triangulated from their first
// corner. Vertices are deduplicated on their exact attribute bits and keep
// first-occurrence order, so a given file always produces the same arrays.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{RenderError, RenderResult};

/// Vertex as the vertex shader pulls it: 8 tightly packed floats
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
}

impl Vertex {
    fn key(&self) -> [u32; 8] {
        [
            self.position.x.to_bits(),
            self.position.y.to_bits(),
            self.position.z.to_bits(),
            self.normal.x.to_bits(),
            self.normal.y.to_bits(),
            self.normal.z.to_bits(),
            self.uv.x.to_bits(),
            self.uv.y.to_bits(),
        ]
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn load(path: &Path) -> RenderResult<Self> {
        let file = File::open(path).map_err(|source| RenderError::MeshOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let mesh = Self::from_obj_reader(&mut BufReader::new(file)).map_err(|source| {
            RenderError::MeshLoad {
                path: path.to_path_buf(),
                source,
            }
        })?;

        log::info!(
            "Loaded mesh {:?}: {} vertices, {} indices",
            path,
            mesh.vertices.len(),
            mesh.indices.len()
        );
        Ok(mesh)
    }

    /// Parse OBJ text; materials are ignored
    pub fn from_obj_reader<R: BufRead>(reader: &mut R) -> Result<Self, tobj::LoadError> {
        let (models, _) = tobj::load_obj_buf(
            reader,
            &tobj::LoadOptions {
                triangulate: true,
                single_index: false,
                ignore_points: true,
                ignore_lines: true,
                ..Default::default()
            },
            |_| Ok(Default::default()),
        )?;

        let mut mesh = Mesh::default();
        let mut unique_vertices: HashMap<[u32; 8], u32> = HashMap::new();

        for model in &models {
            let source = &model.mesh;
            for (corner, &position_index) in source.indices.iter().enumerate() {
                let vertex = Vertex {
                    position: vec3_at(&source.positions, position_index),
                    normal: source
                        .normal_indices
                        .get(corner)
                        .map_or(Vec3::ZERO, |&i| vec3_at(&source.normals, i)),
                    uv: source
                        .texcoord_indices
                        .get(corner)
                        .map_or(Vec2::ZERO, |&i| vec2_at(&source.texcoords, i)),
                };

                let next = mesh.vertices.len() as u32;
                let index = *unique_vertices.entry(vertex.key()).or_insert_with(|| {
                    mesh.vertices.push(vertex);
                    next
                });
                mesh.indices.push(index);
            }
        }

        Ok(mesh)
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}

fn vec3_at(data: &[f32], index: u32) -> Vec3 {
    let base = 3 * index as usize;
    match data.get(base..base + 3) {
        Some(v) => Vec3::new(v[0], v[1], v[2]),
        None => Vec3::ZERO,
    }
}

fn vec2_at(data: &[f32], index: u32) -> Vec2 {
    let base = 2 * index as usize;
    match data.get(base..base + 2) {
        Some(v) => Vec2::new(v[0], v[1]),
        None => Vec2::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUAD: &str = "\
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vn 0 0 1
vt 0 0
vt 1 0
vt 1 1
vt 0 1
f 1/1/1 2/2/1 3/3/1 4/4/1
";

    fn parse(text: &str) -> Mesh {
        Mesh::from_obj_reader(&mut text.as_bytes()).unwrap()
    }

    #[test]
    fn vertex_is_eight_floats() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
    }

    #[test]
    fn quad_is_fan_triangulated() {
        let mesh = parse(QUAD);
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices, vec![0, 1, 2, 0, 2, 3]);
        assert_eq!(mesh.vertices[2].position, Vec3::new(1.0, 1.0, 0.0));
        assert_eq!(mesh.vertices[2].uv, Vec2::new(1.0, 1.0));
        assert_eq!(mesh.vertices[0].normal, Vec3::Z);
    }

    #[test]
    fn pentagon_fans_from_first_corner() {
        let mesh = parse(
            "v 0 0 0\nv 1 0 0\nv 2 1 0\nv 1 2 0\nv 0 1 0\nf 1 2 3 4 5\n",
        );
        assert_eq!(mesh.vertices.len(), 5);
        assert_eq!(mesh.indices, vec![0, 1, 2, 0, 2, 3, 0, 3, 4]);
    }

    #[test]
    fn shared_corners_are_deduplicated() {
        // Two triangles sharing an edge, written out with repeated positions
        let mesh = parse("v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nf 1 2 3\nf 1 3 4\n");
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices.len(), 6);
        assert_eq!(mesh.vertex_bytes().len(), 4 * 32);
        assert_eq!(mesh.index_bytes().len(), 6 * 4);
    }

    #[test]
    fn same_position_different_normal_stays_distinct() {
        let mesh = parse(
            "v 0 0 0\nv 1 0 0\nv 0 1 0\nvn 0 0 1\nvn 0 0 -1\nf 1//1 2//1 3//1\nf 1//2 3//2 2//2\n",
        );
        assert_eq!(mesh.vertices.len(), 6);
    }

    #[test]
    fn loading_is_idempotent() {
        let first = parse(QUAD);
        let second = parse(QUAD);
        assert_eq!(first, second);
    }

    #[test]
    fn missing_file_keeps_the_io_error() {
        let err = Mesh::load(Path::new("assets/no-such-mesh.obj")).unwrap_err();
        match err {
            RenderError::MeshOpen { path, source } => {
                assert_eq!(path, Path::new("assets/no-such-mesh.obj"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected MeshOpen, got {:?}", other),
        }
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let path = std::env::temp_dir().join(format!("render-box-bad-{}.obj", std::process::id()));
        std::fs::write(&path, "v zero one two\nf 1 1 1\n").unwrap();
        let result = Mesh::load(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(RenderError::MeshLoad { .. })));
    }
}
