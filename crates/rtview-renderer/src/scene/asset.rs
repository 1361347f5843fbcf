//! The viewed model on the GPU: mesh buffers, four textures and the
//! bottom-level acceleration structure built from them.

use std::path::{Path, PathBuf};

use crate::gfx::immediate::submit_immediate;
use crate::gfx::{
    AccelId, AccelLevel, BufferBarrier, BufferCopyRegion, BufferDesc, BufferId, BufferUsage, DescriptorResource,
    DescriptorTableId, GraphicsDevice, IndexFormat, MemoryLocation, TriangleGeometry, VertexFormat,
};

use super::error::{GfxResultExt, RenderError, RenderResult};
use super::mesh::{load_mesh, MeshData};
use super::texture::{Texture, TexturePolicy};

/// Descriptor slot holding the four asset textures.
pub const TEXTURE_SLOT: u32 = 2;
pub const TEXTURE_COUNT: usize = 4;

pub struct Asset {
    index_buffer: BufferId,
    vertex_buffer: BufferId,
    normal_buffer: BufferId,
    textures: [Texture; TEXTURE_COUNT],
    blas: AccelId,
    blas_buffer: BufferId,
    vertex_count: u32,
    triangle_count: u32,
}

impl Asset {
    /// Import the mesh and textures and build the bottom-level structure.
    pub fn load<G: GraphicsDevice>(
        gfx: &mut G,
        mesh_path: &Path,
        texture_paths: &[PathBuf; TEXTURE_COUNT],
        policy: TexturePolicy,
    ) -> RenderResult<Self> {
        let mesh = load_mesh(mesh_path)?;
        let mut textures = Vec::with_capacity(TEXTURE_COUNT);
        for path in texture_paths {
            match Texture::load(gfx, path, policy) {
                Ok(texture) => textures.push(texture),
                Err(e) => {
                    release_textures(gfx, textures);
                    return Err(e);
                }
            }
        }
        Self::from_parts(gfx, &mesh, textures)
    }

    /// Upload `mesh`, take ownership of `textures` and build the BLAS.
    ///
    /// Mesh copies, their barriers and the build share one submission. On
    /// failure every object created here, and the textures, are released.
    pub fn from_parts<G: GraphicsDevice>(gfx: &mut G, mesh: &MeshData, textures: Vec<Texture>) -> RenderResult<Self> {
        let textures: [Texture; TEXTURE_COUNT] = match textures.try_into() {
            Ok(textures) => textures,
            Err(textures) => {
                let count = textures.len();
                release_textures(gfx, textures);
                return Err(RenderError::Build(format!(
                    "asset needs {} textures, got {}",
                    TEXTURE_COUNT, count
                )));
            }
        };

        let mut created = Created::default();
        let parts = match upload_and_build(gfx, mesh, &mut created) {
            Ok(parts) => parts,
            Err(e) => {
                created.release(gfx);
                release_textures(gfx, textures);
                return Err(e);
            }
        };

        Ok(Self {
            index_buffer: parts.index_buffer,
            vertex_buffer: parts.vertex_buffer,
            normal_buffer: parts.normal_buffer,
            textures,
            blas: parts.blas,
            blas_buffer: parts.blas_buffer,
            vertex_count: mesh.vertex_count(),
            triangle_count: mesh.triangle_count(),
        })
    }

    pub fn blas(&self) -> AccelId {
        self.blas
    }

    /// Buffer backing the BLAS, for barriers ahead of top-level builds.
    pub fn blas_buffer(&self) -> BufferId {
        self.blas_buffer
    }

    pub fn blas_address<G: GraphicsDevice>(&self, gfx: &G) -> RenderResult<u64> {
        Ok(gfx.acceleration_structure_address(self.blas)?)
    }

    pub fn textures(&self) -> &[Texture; TEXTURE_COUNT] {
        &self.textures
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn triangle_count(&self) -> u32 {
        self.triangle_count
    }

    /// Write the texture views into [`TEXTURE_SLOT`] of `table`.
    pub fn bind<G: GraphicsDevice>(&self, gfx: &mut G, table: DescriptorTableId) -> RenderResult<()> {
        for (index, texture) in self.textures.iter().enumerate() {
            gfx.write_descriptor(table, TEXTURE_SLOT, index as u32, DescriptorResource::Texture(texture.view))?;
        }
        Ok(())
    }

    pub fn destroy<G: GraphicsDevice>(self, gfx: &mut G) {
        gfx.destroy_acceleration_structure(self.blas);
        gfx.destroy_buffer(self.blas_buffer);
        for texture in self.textures {
            texture.destroy(gfx);
        }
        gfx.destroy_buffer(self.normal_buffer);
        gfx.destroy_buffer(self.vertex_buffer);
        gfx.destroy_buffer(self.index_buffer);
    }
}

/// Objects `upload_and_build` has created so far.
#[derive(Default)]
struct Created {
    buffers: Vec<BufferId>,
    blas: Option<AccelId>,
}

impl Created {
    fn release<G: GraphicsDevice>(self, gfx: &mut G) {
        if let Some(blas) = self.blas {
            gfx.destroy_acceleration_structure(blas);
        }
        for buffer in self.buffers.into_iter().rev() {
            gfx.destroy_buffer(buffer);
        }
    }
}

struct AssetParts {
    index_buffer: BufferId,
    vertex_buffer: BufferId,
    normal_buffer: BufferId,
    blas: AccelId,
    blas_buffer: BufferId,
}

fn release_textures<G: GraphicsDevice>(gfx: &mut G, textures: impl IntoIterator<Item = Texture>) {
    for texture in textures {
        texture.destroy(gfx);
    }
}

fn upload_and_build<G: GraphicsDevice>(gfx: &mut G, mesh: &MeshData, created: &mut Created) -> RenderResult<AssetParts> {
    mesh.validate().map_err(RenderError::Build)?;

    let layout = mesh.upload_layout();
    let input_usage = BufferUsage::COPY_DST | BufferUsage::ACCELERATION_STRUCTURE_INPUT;
    let index_buffer = gfx
        .create_buffer(&BufferDesc {
            size: layout.index_bytes,
            usage: input_usage | BufferUsage::INDEX_BUFFER,
            location: MemoryLocation::GpuOnly,
            name: "index buffer",
        })
        .creating("index buffer")?;
    created.buffers.push(index_buffer);
    let vertex_buffer = gfx
        .create_buffer(&BufferDesc {
            size: layout.vertex_bytes,
            usage: input_usage | BufferUsage::VERTEX_BUFFER,
            location: MemoryLocation::GpuOnly,
            name: "vertex buffer",
        })
        .creating("vertex buffer")?;
    created.buffers.push(vertex_buffer);
    let normal_buffer = gfx
        .create_buffer(&BufferDesc {
            size: layout.normal_bytes,
            usage: input_usage | BufferUsage::VERTEX_BUFFER,
            location: MemoryLocation::GpuOnly,
            name: "normal buffer",
        })
        .creating("normal buffer")?;
    created.buffers.push(normal_buffer);
    let staging = gfx
        .create_buffer(&BufferDesc {
            size: layout.total(),
            usage: BufferUsage::COPY_SRC,
            location: MemoryLocation::Upload,
            name: "mesh staging",
        })
        .creating("mesh staging buffer")?;
    created.buffers.push(staging);
    gfx.write_buffer(staging, 0, &mesh.staging_bytes())?;

    let geometry = TriangleGeometry {
        vertex_address: gfx.buffer_address(vertex_buffer)?,
        vertex_stride: std::mem::size_of::<[f32; 3]>() as u64,
        vertex_count: mesh.vertex_count(),
        vertex_format: VertexFormat::Rgb32Float,
        index_address: gfx.buffer_address(index_buffer)?,
        index_format: IndexFormat::U16,
        triangle_count: mesh.triangle_count(),
        opaque: true,
    };
    let sizes = gfx.blas_build_sizes(&[geometry]).building()?;
    log::debug!(
        "BLAS for {} triangles: {} bytes, {} scratch",
        geometry.triangle_count,
        sizes.result_size,
        sizes.scratch_size
    );

    let scratch = gfx
        .create_buffer(&BufferDesc {
            size: sizes.scratch_size,
            usage: BufferUsage::STORAGE_BUFFER,
            location: MemoryLocation::GpuOnly,
            name: "BLAS scratch",
        })
        .creating("BLAS scratch buffer")?;
    created.buffers.push(scratch);
    let blas_buffer = gfx
        .create_buffer(&BufferDesc {
            size: sizes.result_size,
            usage: BufferUsage::ACCELERATION_STRUCTURE_BUFFER,
            location: MemoryLocation::GpuOnly,
            name: "BLAS",
        })
        .creating("BLAS buffer")?;
    created.buffers.push(blas_buffer);
    let blas = gfx
        .create_acceleration_structure(blas_buffer, 0, sizes.result_size, AccelLevel::Bottom)
        .building()?;
    created.blas = Some(blas);
    let scratch_address = gfx.buffer_address(scratch)?;

    let copies = [
        (index_buffer, layout.index_offset(), layout.index_bytes),
        (vertex_buffer, layout.vertex_offset(), layout.vertex_bytes),
        (normal_buffer, layout.normal_offset(), layout.normal_bytes),
    ];
    let built = submit_immediate(gfx, |gfx, cmd| -> RenderResult<()> {
        for (dst, src_offset, size) in copies {
            gfx.cmd_copy_buffer(
                cmd,
                staging,
                dst,
                BufferCopyRegion {
                    src_offset,
                    dst_offset: 0,
                    size,
                },
            )?;
        }
        gfx.cmd_buffer_barriers(cmd, &copies.map(|(buffer, _, _)| BufferBarrier::copy_to_build_input(buffer)))?;
        gfx.cmd_build_blas(cmd, &[geometry], blas, scratch_address).building()
    });
    gfx.destroy_buffer(scratch);
    gfx.destroy_buffer(staging);
    created.buffers.retain(|&b| b != scratch && b != staging);
    built?;

    log::info!(
        "Asset ready: {} vertices, {} triangles, BLAS at {:#x}",
        mesh.vertex_count(),
        mesh.triangle_count(),
        gfx.acceleration_structure_address(blas)?
    );

    Ok(AssetParts {
        index_buffer,
        vertex_buffer,
        normal_buffer,
        blas,
        blas_buffer,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gfx::mock::{Command, MockDevice};
    use crate::scene::texture::DecodedImage;
    use approx::assert_relative_eq;

    /// A 10x10 vertex grid: 100 vertices, 300 indices.
    pub(crate) fn grid_mesh() -> MeshData {
        let mut positions = Vec::new();
        for z in 0..10 {
            for x in 0..10 {
                positions.push([x as f32 * 10.0, 0.0, z as f32 * 10.0]);
            }
        }
        let mut indices = Vec::new();
        'outer: for z in 0..9u16 {
            for x in 0..9u16 {
                if indices.len() == 300 {
                    break 'outer;
                }
                let i = z * 10 + x;
                indices.extend_from_slice(&[i, i + 10, i + 1, i + 1, i + 10, i + 11]);
            }
        }
        MeshData {
            indices,
            normals: vec![[0.0, 1.0, 0.0]; positions.len()],
            texcoords: vec![[0.0, 0.0]; positions.len()],
            positions,
        }
    }

    pub(crate) fn textures(gfx: &mut MockDevice, size: u32) -> Vec<Texture> {
        (0..TEXTURE_COUNT)
            .map(|i| {
                let image = DecodedImage {
                    width: size,
                    height: size,
                    pixels: vec![i as u8; (size * size * 4) as usize],
                };
                Texture::upload(gfx, &image).unwrap()
            })
            .collect()
    }

    pub(crate) fn test_asset(gfx: &mut MockDevice) -> Asset {
        let tex = textures(gfx, 64);
        Asset::from_parts(gfx, &grid_mesh(), tex).unwrap()
    }

    #[test]
    fn test_grid_mesh_shape() {
        let mesh = grid_mesh();
        assert_eq!(mesh.positions.len(), 100);
        assert_eq!(mesh.indices.len(), 300);
        mesh.validate().unwrap();
    }

    #[test]
    fn test_asset_builds_blas_once() {
        let mut gfx = MockDevice::new();
        let asset = test_asset(&mut gfx);

        assert_ne!(asset.blas_address(&gfx).unwrap(), 0);
        assert!(gfx.is_built(asset.blas()));
        assert_eq!(asset.triangle_count(), 100);

        let builds: usize = gfx
            .submissions()
            .iter()
            .flatten()
            .filter(|c| matches!(c, Command::BuildBlas { .. }))
            .count();
        assert_eq!(builds, 1);
        // Mesh buffers, BLAS storage; staging and scratch released.
        assert_eq!(gfx.live_buffers(), 4);
    }

    #[test]
    fn test_copies_barrier_before_build() {
        let mut gfx = MockDevice::new();
        test_asset(&mut gfx);
        let last = gfx.submissions().last().unwrap();
        let kinds: Vec<&str> = last
            .iter()
            .map(|c| match c {
                Command::CopyBuffer { .. } => "copy",
                Command::BufferBarriers(b) => {
                    assert_eq!(b.len(), 3);
                    "barrier"
                }
                Command::BuildBlas { .. } => "build",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, ["copy", "copy", "copy", "barrier", "build"]);
    }

    #[test]
    fn test_vertices_uploaded_scaled() {
        let mut gfx = MockDevice::new();
        let asset = test_asset(&mut gfx);
        let vertices = gfx.buffer_data(asset.vertex_buffer).unwrap();
        let last: [f32; 3] = bytemuck::pod_read_unaligned(&vertices[99 * 12..100 * 12]);
        assert_relative_eq!(last[0], 0.9, epsilon = 1e-6);
        assert_relative_eq!(last[1], 0.0, epsilon = 1e-6);
        assert_relative_eq!(last[2], 0.9, epsilon = 1e-6);
    }

    #[test]
    fn test_second_asset_is_independent() {
        let mut gfx = MockDevice::new();
        let first = test_asset(&mut gfx);
        let second = test_asset(&mut gfx);
        assert_ne!(first.blas(), second.blas());
        assert_ne!(first.blas_address(&gfx).unwrap(), second.blas_address(&gfx).unwrap());
        second.destroy(&mut gfx);
        assert!(gfx.is_built(first.blas()));
    }

    #[test]
    fn test_size_query_failure_is_build_error() {
        let mut gfx = MockDevice::new();
        let tex = textures(&mut gfx, 4);
        gfx.fail_build_queries(true);
        let result = Asset::from_parts(&mut gfx, &grid_mesh(), tex);
        assert!(matches!(result, Err(RenderError::Build(_))));
    }

    #[test]
    fn test_buffer_allocation_failure() {
        let mut gfx = MockDevice::new();
        let tex = textures(&mut gfx, 4);
        gfx.fail_allocations_after(1);
        let result = Asset::from_parts(&mut gfx, &grid_mesh(), tex);
        assert!(matches!(result, Err(RenderError::ResourceCreation { what: "vertex buffer", .. })));
    }

    #[test]
    fn test_failed_build_releases_everything() {
        let mut gfx = MockDevice::new();
        let tex = textures(&mut gfx, 4);
        gfx.fail_build_queries(true);
        assert!(Asset::from_parts(&mut gfx, &grid_mesh(), tex).is_err());
        assert_eq!(gfx.live_buffers(), 0);
        assert_eq!(gfx.live_textures(), 0);

        let mut gfx = MockDevice::new();
        let tex = textures(&mut gfx, 4);
        // Mesh buffers, staging and scratch succeed; the BLAS buffer fails.
        gfx.fail_allocations_after(5);
        let result = Asset::from_parts(&mut gfx, &grid_mesh(), tex);
        assert!(matches!(result, Err(RenderError::ResourceCreation { what: "BLAS buffer", .. })));
        assert_eq!(gfx.live_buffers(), 0);
        assert_eq!(gfx.live_textures(), 0);
        assert_eq!(gfx.live_acceleration_structures(), 0);
    }

    #[test]
    fn test_wrong_texture_count_releases_textures() {
        let mut gfx = MockDevice::new();
        let mut tex = textures(&mut gfx, 4);
        tex.pop();
        assert!(matches!(
            Asset::from_parts(&mut gfx, &grid_mesh(), tex),
            Err(RenderError::Build(_))
        ));
        assert_eq!(gfx.live_textures(), 0);
    }

    #[test]
    fn test_bind_writes_texture_slot() {
        let mut gfx = MockDevice::new();
        let asset = test_asset(&mut gfx);
        let table = gfx
            .create_descriptor_table(&crate::scene::pipeline::BINDING_LAYOUT)
            .unwrap();
        asset.bind(&mut gfx, table).unwrap();
        for (i, texture) in asset.textures().iter().enumerate() {
            assert_eq!(
                gfx.descriptor(table, TEXTURE_SLOT, i as u32),
                Some(DescriptorResource::Texture(texture.view))
            );
        }
    }
}
