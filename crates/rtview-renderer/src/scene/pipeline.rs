//! Ray tracing pipeline, its binding layout and the sampler.

use std::path::{Path, PathBuf};

use crate::gfx::{
    AddressMode, DescriptorBinding, DescriptorKind, DescriptorResource, DescriptorTableId, Filter, GraphicsDevice,
    HitGroupDesc, PipelineId, RaytracingPipelineDesc, RaytracingShaderType, RootSignatureDesc, RootSignatureId,
    SamplerDesc, SamplerId, ShaderExport, ShaderId,
};
use crate::FLIGHT_FRAMES;

use super::asset::TEXTURE_COUNT;
use super::error::{GfxResultExt, RenderError, RenderResult};
use super::sbt::ShaderBindingTable;

pub const OUTPUT_SLOT: u32 = 0;
pub const TLAS_SLOT: u32 = 1;
pub const SAMPLER_SLOT: u32 = 3;
/// Push descriptor slot of the camera constant buffer.
pub const CAMERA_SLOT: u32 = 0;

pub const BINDING_LAYOUT: [DescriptorBinding; 4] = [
    DescriptorBinding {
        kind: DescriptorKind::StorageTexture,
        count: FLIGHT_FRAMES as u32,
    },
    DescriptorBinding {
        kind: DescriptorKind::AccelerationStructure,
        count: 1,
    },
    DescriptorBinding {
        kind: DescriptorKind::Texture,
        count: TEXTURE_COUNT as u32,
    },
    DescriptorBinding {
        kind: DescriptorKind::Sampler,
        count: 1,
    },
];

/// Frame index, one `u32`.
pub const PUSH_CONSTANT_BYTES: u32 = 4;

/// Where the build script compiled the shader library, if it ran.
pub const BUILT_SHADER_DIR: Option<&str> = option_env!("RTVIEW_BUILT_SHADER_DIR");

pub const SHADER_LIBRARY: &str = "raytracing.lib";
pub const RAYGEN_ENTRY: &str = "RayGeneration";
pub const MISS_ENTRY: &str = "Miss";
pub const CLOSEST_HIT_ENTRY: &str = "ClosestHit";

pub const MAX_RECURSION_DEPTH: u32 = 1;
pub const MAX_PAYLOAD_SIZE: u32 = 24;
pub const MAX_ATTRIBUTE_SIZE: u32 = 8;

pub fn shader_path(dir: &Path, extension: &str) -> PathBuf {
    dir.join(format!("{}.{}", SHADER_LIBRARY, extension))
}

/// Read the compiled shader library for backend `G`.
pub fn load_shader<G: GraphicsDevice>(dir: &Path) -> RenderResult<Vec<u8>> {
    let path = shader_path(dir, G::SHADER_EXTENSION);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RenderError::ShaderNotFound(path)),
        Err(e) => Err(RenderError::Import {
            path,
            reason: e.to_string(),
        }),
    }
}

/// Trilinear, repeating, first two mip levels.
pub fn texture_sampler() -> SamplerDesc {
    SamplerDesc {
        min_filter: Filter::Linear,
        mag_filter: Filter::Linear,
        mip_filter: Filter::Linear,
        anisotropic: false,
        max_anisotropy: 1.0,
        address_u: AddressMode::Repeat,
        address_v: AddressMode::Repeat,
        address_w: AddressMode::Repeat,
        min_lod: 0.0,
        max_lod: 1.0,
        mip_lod_bias: 0.0,
    }
}

pub struct RaytracingPipeline {
    pub root_signature: RootSignatureId,
    pub descriptor_table: DescriptorTableId,
    pub sampler: SamplerId,
    pub pipeline: PipelineId,
    pub sbt: ShaderBindingTable,
    library: ShaderId,
}

impl RaytracingPipeline {
    pub fn create<G: GraphicsDevice>(gfx: &mut G, shader_dir: &Path) -> RenderResult<Self> {
        let bytecode = load_shader::<G>(shader_dir)?;

        let sampler = gfx.create_sampler(&texture_sampler()).creating("sampler")?;
        let root_signature = gfx
            .create_root_signature(&RootSignatureDesc {
                push_constant_bytes: PUSH_CONSTANT_BYTES,
                push_descriptors: &[DescriptorKind::ConstantBuffer],
                bindings: &BINDING_LAYOUT,
            })
            .creating("root signature")?;
        let descriptor_table = gfx
            .create_descriptor_table(&BINDING_LAYOUT)
            .creating("descriptor table")?;
        gfx.write_descriptor(descriptor_table, SAMPLER_SLOT, 0, DescriptorResource::Sampler(sampler))?;

        let library = gfx.create_shader(&bytecode).creating("shader library")?;
        let exports = [
            ShaderExport {
                entry_point: RAYGEN_ENTRY,
                shader_type: RaytracingShaderType::Raygen,
            },
            ShaderExport {
                entry_point: MISS_ENTRY,
                shader_type: RaytracingShaderType::Miss,
            },
            ShaderExport {
                entry_point: CLOSEST_HIT_ENTRY,
                shader_type: RaytracingShaderType::ClosestHit,
            },
        ];
        let pipeline = gfx
            .create_raytracing_pipeline(&RaytracingPipelineDesc {
                root_signature,
                library,
                exports: &exports,
                hit_groups: &[HitGroupDesc { closest_hit_export: 2 }],
                max_recursion_depth: MAX_RECURSION_DEPTH,
                max_payload_size: MAX_PAYLOAD_SIZE,
                max_attribute_size: MAX_ATTRIBUTE_SIZE,
            })
            .creating("ray tracing pipeline")?;
        let sbt = ShaderBindingTable::create(gfx, pipeline)?;

        log::info!("Ray tracing pipeline created from {:?}", shader_path(shader_dir, G::SHADER_EXTENSION));
        Ok(Self {
            root_signature,
            descriptor_table,
            sampler,
            pipeline,
            sbt,
            library,
        })
    }

    pub fn destroy<G: GraphicsDevice>(self, gfx: &mut G) {
        self.sbt.destroy(gfx);
        gfx.destroy_pipeline(self.pipeline);
        gfx.destroy_shader(self.library);
        gfx.destroy_descriptor_table(self.descriptor_table);
        gfx.destroy_root_signature(self.root_signature);
        gfx.destroy_sampler(self.sampler);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gfx::mock::MockDevice;

    /// A shader directory holding a dummy library for the mock backend.
    pub(crate) fn shader_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(shader_path(dir.path(), MockDevice::SHADER_EXTENSION), [0x03, 0x02, 0x23, 0x07]).unwrap();
        dir
    }

    #[test]
    fn test_shader_path() {
        assert_eq!(
            shader_path(Path::new("out"), "spv"),
            Path::new("out").join("raytracing.lib.spv")
        );
    }

    #[test]
    fn test_missing_shader_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_shader::<MockDevice>(dir.path()).unwrap_err();
        match err {
            RenderError::ShaderNotFound(path) => assert!(path.ends_with("raytracing.lib.spv")),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_pipeline_binds_sampler() {
        let dir = shader_dir();
        let mut gfx = MockDevice::new();
        let pipeline = RaytracingPipeline::create(&mut gfx, dir.path()).unwrap();
        assert_eq!(
            gfx.descriptor(pipeline.descriptor_table, SAMPLER_SLOT, 0),
            Some(DescriptorResource::Sampler(pipeline.sampler))
        );
    }

    #[test]
    fn test_sampler_settings() {
        let desc = texture_sampler();
        assert_eq!(desc.min_filter, Filter::Linear);
        assert_eq!(desc.address_w, AddressMode::Repeat);
        assert_eq!((desc.min_lod, desc.max_lod), (0.0, 1.0));
        assert!(!desc.anisotropic);
    }
}
