//! Wavefront OBJ import and mesh upload layout.

use std::path::Path;

use glam::Vec3;

use super::error::{RenderError, RenderResult};

/// Per-axis scale applied to positions on upload. Y is flipped.
pub const UPLOAD_SCALE: [f32; 3] = [0.01, -0.01, 0.01];

/// Indexed triangle mesh in left-handed coordinates.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeshData {
    pub indices: Vec<u16>,
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub texcoords: Vec<[f32; 2]>,
}

/// Import the first model of an OBJ file.
pub fn load_mesh(path: &Path) -> RenderResult<MeshData> {
    let import_error = |reason: String| RenderError::Import {
        path: path.to_path_buf(),
        reason,
    };

    let (models, _materials) = tobj::load_obj(path, &tobj::GPU_LOAD_OPTIONS).map_err(|e| import_error(e.to_string()))?;
    let model = models
        .first()
        .ok_or_else(|| import_error("file contains no models".to_string()))?;

    let mesh = MeshData::from_obj(&model.mesh).map_err(import_error)?;
    log::info!(
        "Loaded mesh {:?} ({}): {} vertices, {} triangles",
        path,
        model.name,
        mesh.vertex_count(),
        mesh.triangle_count()
    );
    Ok(mesh)
}

impl MeshData {
    /// Convert a single-index, triangulated tobj mesh.
    ///
    /// Z is negated for positions and normals, triangle winding is reversed
    /// and V is flipped. Missing normals are generated.
    pub fn from_obj(mesh: &tobj::Mesh) -> Result<Self, String> {
        let vertex_count = mesh.positions.len() / 3;
        if vertex_count > u16::MAX as usize + 1 {
            return Err(format!("{} vertices exceed 16-bit indices", vertex_count));
        }

        let positions: Vec<[f32; 3]> = mesh.positions.chunks_exact(3).map(|p| [p[0], p[1], -p[2]]).collect();

        let mut indices = Vec::with_capacity(mesh.indices.len());
        for triangle in mesh.indices.chunks(3) {
            let &[a, b, c] = triangle else {
                return Err(format!("{} indices is not a whole number of triangles", mesh.indices.len()));
            };
            for index in [a, c, b] {
                if index as usize >= vertex_count {
                    return Err(format!("index {} out of range for {} vertices", index, vertex_count));
                }
                indices.push(index as u16);
            }
        }

        let normals = if mesh.normals.len() == mesh.positions.len() {
            mesh.normals.chunks_exact(3).map(|n| [n[0], n[1], -n[2]]).collect()
        } else {
            log::debug!("Mesh has no usable normals, generating them");
            generate_normals(&positions, &indices)
        };

        let texcoords = if mesh.texcoords.len() == vertex_count * 2 {
            mesh.texcoords.chunks_exact(2).map(|t| [t[0], 1.0 - t[1]]).collect()
        } else {
            vec![[0.0, 0.0]; vertex_count]
        };

        let data = Self {
            indices,
            positions,
            normals,
            texcoords,
        };
        data.validate()?;
        Ok(data)
    }

    pub fn vertex_count(&self) -> u32 {
        self.positions.len() as u32
    }

    pub fn triangle_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.indices.is_empty() || self.positions.is_empty() {
            return Err("mesh has no triangles".to_string());
        }
        if self.indices.len() % 3 != 0 {
            return Err(format!("{} indices is not a whole number of triangles", self.indices.len()));
        }
        if self.normals.len() != self.positions.len() {
            return Err(format!(
                "{} normals for {} positions",
                self.normals.len(),
                self.positions.len()
            ));
        }
        if let Some(&bad) = self.indices.iter().find(|&&i| i as usize >= self.positions.len()) {
            return Err(format!("index {} out of range", bad));
        }
        Ok(())
    }

    pub fn upload_layout(&self) -> UploadLayout {
        UploadLayout {
            index_bytes: (self.indices.len() * std::mem::size_of::<u16>()) as u64,
            vertex_bytes: (self.positions.len() * std::mem::size_of::<[f32; 3]>()) as u64,
            normal_bytes: (self.normals.len() * std::mem::size_of::<[f32; 3]>()) as u64,
        }
    }

    /// Indices, scaled positions and normals, packed back to back.
    pub fn staging_bytes(&self) -> Vec<u8> {
        let layout = self.upload_layout();
        let mut bytes = Vec::with_capacity(layout.total() as usize);
        bytes.extend_from_slice(bytemuck::cast_slice(&self.indices));
        for p in &self.positions {
            let scaled = [p[0] * UPLOAD_SCALE[0], p[1] * UPLOAD_SCALE[1], p[2] * UPLOAD_SCALE[2]];
            bytes.extend_from_slice(bytemuck::cast_slice(&scaled));
        }
        bytes.extend_from_slice(bytemuck::cast_slice(&self.normals));
        bytes
    }
}

/// Byte sizes of the three mesh buffers, and their offsets in the staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLayout {
    pub index_bytes: u64,
    pub vertex_bytes: u64,
    pub normal_bytes: u64,
}

impl UploadLayout {
    pub fn index_offset(&self) -> u64 {
        0
    }

    pub fn vertex_offset(&self) -> u64 {
        self.index_bytes
    }

    pub fn normal_offset(&self) -> u64 {
        self.index_bytes + self.vertex_bytes
    }

    pub fn total(&self) -> u64 {
        self.index_bytes + self.vertex_bytes + self.normal_bytes
    }
}

/// Area-weighted vertex normals.
fn generate_normals(positions: &[[f32; 3]], indices: &[u16]) -> Vec<[f32; 3]> {
    let mut accumulated = vec![Vec3::ZERO; positions.len()];
    for triangle in indices.chunks_exact(3) {
        let [a, b, c] = [triangle[0], triangle[1], triangle[2]].map(|i| i as usize);
        let (pa, pb, pc) = (Vec3::from(positions[a]), Vec3::from(positions[b]), Vec3::from(positions[c]));
        let face = (pb - pa).cross(pc - pa);
        for i in [a, b, c] {
            accumulated[i] += face;
        }
    }
    accumulated
        .into_iter()
        .map(|n| n.try_normalize().unwrap_or(Vec3::Y).to_array())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    const QUAD: &str = "\
o quad
v 0.0 0.0 1.0
v 1.0 0.0 1.0
v 1.0 1.0 1.0
v 0.0 1.0 1.0
vt 0.0 0.0
vt 1.0 0.0
vt 1.0 1.0
vt 0.0 1.0
f 1/1 2/2 3/3 4/4
";

    fn write_obj(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".obj").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_quad_left_handed() {
        let file = write_obj(QUAD);
        let mesh = load_mesh(file.path()).unwrap();
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.triangle_count(), 2);
        assert!(mesh.positions.iter().all(|p| p[2] == -1.0));
        // Winding reversed: the face normal flips with Z, so it still points at -Z.
        for n in &mesh.normals {
            assert_relative_eq!(n[2], -1.0, epsilon = 1e-6);
        }
        assert_eq!(mesh.texcoords[0], [0.0, 1.0]);
        assert_eq!(&mesh.indices[..3], &[0, 2, 1]);
    }

    #[test]
    fn test_missing_file_is_import_error() {
        let err = load_mesh(Path::new("/nonexistent/mesh.obj")).unwrap_err();
        assert!(matches!(err, RenderError::Import { .. }));
    }

    #[test]
    fn test_empty_obj_is_import_error() {
        let file = write_obj("# nothing here\n");
        assert!(matches!(load_mesh(file.path()), Err(RenderError::Import { .. })));
    }

    #[test]
    fn test_too_many_vertices_rejected() {
        let mesh = tobj::Mesh {
            positions: vec![0.0; 3 * 70_000],
            indices: vec![0, 1, 69_999],
            ..Default::default()
        };
        let err = MeshData::from_obj(&mesh).unwrap_err();
        assert!(err.contains("16-bit"));
    }

    #[test]
    fn test_staging_layout_and_scale() {
        let mesh = MeshData {
            indices: vec![0, 1, 2],
            positions: vec![[100.0, 200.0, 300.0], [0.0; 3], [0.0; 3]],
            normals: vec![[0.0, 1.0, 0.0]; 3],
            texcoords: vec![[0.0; 2]; 3],
        };
        let layout = mesh.upload_layout();
        assert_eq!(layout.index_bytes, 6);
        assert_eq!(layout.vertex_offset(), 6);
        assert_eq!(layout.normal_offset(), 6 + 36);
        assert_eq!(layout.total(), 6 + 36 + 36);

        let bytes = mesh.staging_bytes();
        assert_eq!(bytes.len() as u64, layout.total());
        let first: [f32; 3] = bytemuck::pod_read_unaligned(&bytes[6..18]);
        assert_relative_eq!(first[0], 1.0);
        assert_relative_eq!(first[1], -2.0);
        assert_relative_eq!(first[2], 3.0);
    }
}
