//! Shader binding table: one record each for ray generation, miss and the
//! triangle hit group, every region starting on the table alignment.

use crate::gfx::{
    BufferDesc, BufferId, BufferUsage, DispatchRaysDesc, Extent2D, GraphicsDevice, MemoryLocation, PipelineId,
    SbtInfo, StridedRegion,
};

use super::error::{GfxResultExt, RenderError, RenderResult};
use super::slab::{align_up, AlignedSlab};

/// Region order inside the table and inside the identifier blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbtRegion {
    RayGeneration = 0,
    Miss = 1,
    HitGroup = 2,
}

pub const REGION_COUNT: usize = 3;

pub fn region_layout(info: SbtInfo) -> AlignedSlab {
    AlignedSlab::new(info.entry_size as u64, info.table_start_alignment as u64, REGION_COUNT)
}

/// Copy identifier `i` of the blob to the start of region `i`.
pub fn pack(identifiers: &[u8], info: SbtInfo) -> Result<Vec<u8>, String> {
    let entry = info.entry_size as usize;
    if identifiers.len() < entry * REGION_COUNT {
        return Err(format!(
            "pipeline exposes {} identifier bytes, need {}",
            identifiers.len(),
            entry * REGION_COUNT
        ));
    }

    let layout = region_layout(info);
    let mut table = vec![0u8; layout.total_size() as usize];
    for (region, slot) in layout.slots().enumerate() {
        let src = &identifiers[region * entry..(region + 1) * entry];
        let start = slot.offset as usize;
        table[start..start + entry].copy_from_slice(src);
    }
    Ok(table)
}

pub struct ShaderBindingTable {
    buffer: BufferId,
    layout: AlignedSlab,
    record_size: u64,
    base_address: u64,
}

impl ShaderBindingTable {
    pub fn create<G: GraphicsDevice>(gfx: &mut G, pipeline: PipelineId) -> RenderResult<Self> {
        let info = gfx.sbt_info();
        let identifiers = gfx.shader_identifiers(pipeline)?;
        let table = pack(&identifiers, info).map_err(RenderError::Build)?;
        let layout = region_layout(info);

        let buffer = gfx
            .create_buffer(&BufferDesc {
                size: layout.total_size(),
                usage: BufferUsage::SHADER_BINDING_TABLE,
                location: MemoryLocation::Upload,
                name: "shader binding table",
            })
            .creating("shader binding table")?;
        gfx.write_buffer(buffer, 0, &table)?;

        let base_address = gfx.buffer_address(buffer)?;
        if base_address % info.table_start_alignment as u64 != 0 {
            return Err(RenderError::Build(format!(
                "shader binding table at {:#x} is not {}-byte aligned",
                base_address, info.table_start_alignment
            )));
        }

        log::debug!(
            "SBT: {} regions of {} bytes at {:#x}",
            REGION_COUNT,
            layout.stride(),
            base_address
        );
        Ok(Self {
            buffer,
            layout,
            record_size: align_up(info.entry_size as u64, info.entry_alignment as u64),
            base_address,
        })
    }

    pub fn region(&self, region: SbtRegion) -> StridedRegion {
        let offset = self.layout.slot(region as usize).map_or(0, |slot| slot.offset);
        StridedRegion {
            address: self.base_address + offset,
            size: self.record_size,
            stride: self.record_size,
        }
    }

    /// Dispatch covering `extent` with depth 1.
    pub fn dispatch_desc(&self, extent: Extent2D) -> DispatchRaysDesc {
        DispatchRaysDesc {
            raygen: self.region(SbtRegion::RayGeneration),
            miss: self.region(SbtRegion::Miss),
            hit_group: self.region(SbtRegion::HitGroup),
            width: extent.width,
            height: extent.height,
            depth: 1,
        }
    }

    pub fn destroy<G: GraphicsDevice>(self, gfx: &mut G) {
        gfx.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO: SbtInfo = SbtInfo {
        entry_size: 32,
        entry_alignment: 32,
        table_start_alignment: 64,
    };

    #[test]
    fn test_pack_places_identifiers_at_region_starts() {
        let identifiers: Vec<u8> = (0..3u8).flat_map(|g| [g + 1; 32]).collect();
        let table = pack(&identifiers, INFO).unwrap();
        assert_eq!(table.len(), 192);
        assert!(table[0..32].iter().all(|&b| b == 1));
        assert!(table[32..64].iter().all(|&b| b == 0));
        assert!(table[64..96].iter().all(|&b| b == 2));
        assert!(table[128..160].iter().all(|&b| b == 3));
    }

    #[test]
    fn test_pack_rejects_short_blob() {
        assert!(pack(&[0u8; 64], INFO).is_err());
    }

    #[test]
    fn test_region_stride_is_aligned() {
        let layout = region_layout(SbtInfo {
            entry_size: 32,
            entry_alignment: 32,
            table_start_alignment: 256,
        });
        assert_eq!(layout.stride(), 256);
        assert_eq!(layout.slot(2).unwrap().offset, 512);
    }

    #[test]
    fn test_dispatch_regions() {
        use crate::gfx::mock::MockDevice;
        use crate::gfx::{RaytracingPipelineDesc, RaytracingShaderType, RootSignatureDesc, ShaderExport, HitGroupDesc};

        let mut gfx = MockDevice::new();
        let root = gfx
            .create_root_signature(&RootSignatureDesc {
                push_constant_bytes: 4,
                push_descriptors: &[],
                bindings: &[],
            })
            .unwrap();
        let library = gfx.create_shader(&[1, 2, 3, 4]).unwrap();
        let exports = [
            ShaderExport { entry_point: "RayGeneration", shader_type: RaytracingShaderType::Raygen },
            ShaderExport { entry_point: "Miss", shader_type: RaytracingShaderType::Miss },
            ShaderExport { entry_point: "ClosestHit", shader_type: RaytracingShaderType::ClosestHit },
        ];
        let pipeline = gfx
            .create_raytracing_pipeline(&RaytracingPipelineDesc {
                root_signature: root,
                library,
                exports: &exports,
                hit_groups: &[HitGroupDesc { closest_hit_export: 2 }],
                max_recursion_depth: 1,
                max_payload_size: 24,
                max_attribute_size: 8,
            })
            .unwrap();

        let sbt = ShaderBindingTable::create(&mut gfx, pipeline).unwrap();
        let desc = sbt.dispatch_desc(Extent2D::new(640, 480));
        assert_eq!(desc.miss.address - desc.raygen.address, 64);
        assert_eq!(desc.hit_group.address - desc.raygen.address, 128);
        assert_eq!(desc.raygen.size, 32);
        assert_eq!(desc.hit_group.stride, 32);
        assert_eq!((desc.width, desc.height, desc.depth), (640, 480, 1));

        let data = gfx.buffer_data(sbt.buffer).unwrap();
        assert_eq!(data[64], 2);
        assert_eq!(data[128], 3);
    }
}
