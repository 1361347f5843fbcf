//! Top-level acceleration structure over the single asset instance.

use crate::gfx::immediate::submit_immediate;
use crate::gfx::{
    AccelId, AccelLevel, AccelerationInstance, BufferBarrier, BufferDesc, BufferId, BufferUsage, GraphicsDevice,
    InstanceFlags, MemoryLocation, TlasBuildDesc,
};

use super::asset::Asset;
use super::error::{GfxResultExt, RenderResult};

/// Identity transform, mask 0xFF, back-face culling off.
pub fn single_instance(blas_address: u64) -> AccelerationInstance {
    AccelerationInstance::new(
        AccelerationInstance::IDENTITY,
        0,
        0xFF,
        0,
        InstanceFlags::TRIANGLE_CULL_DISABLE,
        blas_address,
    )
}

pub struct TopLevelStructure {
    accel: AccelId,
    storage: BufferId,
}

impl TopLevelStructure {
    /// Build over one instance of `asset` and wait for the GPU.
    pub fn build<G: GraphicsDevice>(gfx: &mut G, asset: &Asset) -> RenderResult<Self> {
        let instance = single_instance(asset.blas_address(gfx)?);

        let instances = gfx
            .create_buffer(&BufferDesc {
                size: std::mem::size_of::<AccelerationInstance>() as u64,
                usage: BufferUsage::ACCELERATION_STRUCTURE_INPUT,
                location: MemoryLocation::Upload,
                name: "TLAS instances",
            })
            .creating("TLAS instance buffer")?;
        gfx.write_buffer(instances, 0, bytemuck::bytes_of(&instance))?;

        let desc = TlasBuildDesc {
            instance_address: gfx.buffer_address(instances)?,
            instance_count: 1,
            update: false,
        };
        let sizes = gfx.tlas_build_sizes(&desc).building()?;

        let scratch = gfx
            .create_buffer(&BufferDesc {
                size: sizes.scratch_size,
                usage: BufferUsage::STORAGE_BUFFER,
                location: MemoryLocation::GpuOnly,
                name: "TLAS scratch",
            })
            .creating("TLAS scratch buffer")?;
        let storage = gfx
            .create_buffer(&BufferDesc {
                size: sizes.result_size,
                usage: BufferUsage::ACCELERATION_STRUCTURE_BUFFER,
                location: MemoryLocation::GpuOnly,
                name: "TLAS",
            })
            .creating("TLAS buffer")?;
        let accel = gfx
            .create_acceleration_structure(storage, 0, sizes.result_size, AccelLevel::Top)
            .building()?;
        let scratch_address = gfx.buffer_address(scratch)?;

        let blas_buffer = asset.blas_buffer();
        let built = submit_immediate(gfx, |gfx, cmd| -> RenderResult<()> {
            gfx.cmd_buffer_barriers(cmd, &[BufferBarrier::blas_to_tlas(blas_buffer)])?;
            gfx.cmd_build_tlas(cmd, &desc, accel, scratch_address).building()
        });
        gfx.destroy_buffer(scratch);
        gfx.destroy_buffer(instances);
        built?;

        log::info!("TLAS built ({} bytes)", sizes.result_size);
        Ok(Self { accel, storage })
    }

    pub fn accel(&self) -> AccelId {
        self.accel
    }

    pub fn destroy<G: GraphicsDevice>(self, gfx: &mut G) {
        gfx.destroy_acceleration_structure(self.accel);
        gfx.destroy_buffer(self.storage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::mock::{Command, MockDevice};
    use crate::scene::asset::tests::test_asset;

    #[test]
    fn test_single_instance_record() {
        let instance = single_instance(0x4000);
        assert_eq!(instance.transform, AccelerationInstance::IDENTITY);
        assert_eq!(instance.mask(), 0xFF);
        assert_eq!(instance.instance_id(), 0);
        assert_eq!(instance.sbt_offset_and_flags & 0x00FF_FFFF, 0);
        assert_eq!(instance.flags(), InstanceFlags::TRIANGLE_CULL_DISABLE);
    }

    #[test]
    fn test_build_references_blas() {
        let mut gfx = MockDevice::new();
        let asset = test_asset(&mut gfx);
        let tlas = TopLevelStructure::build(&mut gfx, &asset).unwrap();

        assert!(gfx.is_built(tlas.accel()));
        let instances = gfx.tlas_instances(tlas.accel()).unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].acceleration_structure, asset.blas_address(&gfx).unwrap());

        let last = gfx.submissions().last().unwrap();
        assert!(matches!(&last[0], Command::BufferBarriers(b) if b[0].buffer == asset.blas_buffer()));
        assert!(matches!(last[1], Command::BuildTlas { .. }));
    }
}
