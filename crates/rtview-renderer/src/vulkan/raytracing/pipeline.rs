//! Ray tracing pipeline creation and shader group handles.

use ash::khr::ray_tracing_pipeline;
use ash::vk;
use std::ffi::CString;

use crate::gfx::{GfxError, RaytracingPipelineDesc, RaytracingShaderType};

pub struct RaytracingPipelineObject {
    pub handle: vk::Pipeline,
    pub group_count: u32,
}

fn stage_flags(shader_type: RaytracingShaderType) -> vk::ShaderStageFlags {
    match shader_type {
        RaytracingShaderType::Raygen => vk::ShaderStageFlags::RAYGEN_KHR,
        RaytracingShaderType::Miss => vk::ShaderStageFlags::MISS_KHR,
        RaytracingShaderType::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
    }
}

/// General groups for raygen and miss exports in export order, then one
/// triangle group per hit group.
pub fn shader_groups(desc: &RaytracingPipelineDesc) -> Result<Vec<vk::RayTracingShaderGroupCreateInfoKHR<'static>>, GfxError> {
    let mut groups = Vec::with_capacity(desc.exports.len() + desc.hit_groups.len());

    for (index, export) in desc.exports.iter().enumerate() {
        if export.shader_type == RaytracingShaderType::ClosestHit {
            continue;
        }
        groups.push(
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(index as u32)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
        );
    }

    for hit_group in desc.hit_groups {
        let export = desc.exports.get(hit_group.closest_hit_export as usize).ok_or_else(|| {
            GfxError::Validation(format!(
                "hit group references export {} of {}",
                hit_group.closest_hit_export,
                desc.exports.len()
            ))
        })?;
        if export.shader_type != RaytracingShaderType::ClosestHit {
            return Err(GfxError::Validation(format!(
                "hit group export '{}' is not a closest hit shader",
                export.entry_point
            )));
        }
        groups.push(
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(hit_group.closest_hit_export)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
        );
    }

    Ok(groups)
}

/// Payload and attribute sizes are implied by the SPIR-V and not passed to Vulkan.
pub unsafe fn create(
    loader: &ray_tracing_pipeline::Device,
    layout: vk::PipelineLayout,
    module: vk::ShaderModule,
    desc: &RaytracingPipelineDesc,
    max_recursion_limit: u32,
) -> Result<RaytracingPipelineObject, GfxError> {
    if desc.max_recursion_depth > max_recursion_limit {
        return Err(GfxError::Validation(format!(
            "recursion depth {} exceeds device limit {}",
            desc.max_recursion_depth, max_recursion_limit
        )));
    }

    let names = desc
        .exports
        .iter()
        .map(|export| CString::new(export.entry_point))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GfxError::Validation(format!("bad entry point name: {}", e)))?;

    let stages: Vec<_> = desc
        .exports
        .iter()
        .zip(&names)
        .map(|(export, name)| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(stage_flags(export.shader_type))
                .module(module)
                .name(name.as_c_str())
        })
        .collect();

    let groups = shader_groups(desc)?;

    let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
        .stages(&stages)
        .groups(&groups)
        .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
        .layout(layout);

    let pipelines = loader
        .create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            &[create_info],
            None,
        )
        .map_err(|(_, e)| super::super::vk_error("Failed to create ray tracing pipeline", e))?;

    let handle = pipelines
        .into_iter()
        .next()
        .ok_or_else(|| GfxError::Backend("driver returned no pipeline".to_string()))?;

    log::debug!(
        "Ray tracing pipeline: {} stages, {} groups, payload {} bytes",
        stages.len(),
        groups.len(),
        desc.max_payload_size
    );

    Ok(RaytracingPipelineObject {
        handle,
        group_count: groups.len() as u32,
    })
}

pub unsafe fn shader_group_handles(
    loader: &ray_tracing_pipeline::Device,
    pipeline: &RaytracingPipelineObject,
    handle_size: u32,
) -> Result<Vec<u8>, GfxError> {
    loader
        .get_ray_tracing_shader_group_handles(
            pipeline.handle,
            0,
            pipeline.group_count,
            (pipeline.group_count * handle_size) as usize,
        )
        .map_err(|e| super::super::vk_error("Failed to get shader group handles", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::{HitGroupDesc, RootSignatureId, ShaderExport, ShaderId};

    fn exports() -> [ShaderExport<'static>; 3] {
        [
            ShaderExport {
                entry_point: "RayGeneration",
                shader_type: RaytracingShaderType::Raygen,
            },
            ShaderExport {
                entry_point: "ClosestHit",
                shader_type: RaytracingShaderType::ClosestHit,
            },
            ShaderExport {
                entry_point: "Miss",
                shader_type: RaytracingShaderType::Miss,
            },
        ]
    }

    fn desc<'a>(exports: &'a [ShaderExport<'a>], hit_groups: &'a [HitGroupDesc]) -> RaytracingPipelineDesc<'a> {
        RaytracingPipelineDesc {
            root_signature: RootSignatureId(0),
            library: ShaderId(0),
            exports,
            hit_groups,
            max_recursion_depth: 1,
            max_payload_size: 24,
            max_attribute_size: 8,
        }
    }

    #[test]
    fn test_general_groups_precede_hit_groups() {
        let exports = exports();
        let hit_groups = [HitGroupDesc { closest_hit_export: 1 }];
        let groups = shader_groups(&desc(&exports, &hit_groups)).unwrap();

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(groups[0].general_shader, 0);
        assert_eq!(groups[1].general_shader, 2);
        assert_eq!(groups[2].ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(groups[2].closest_hit_shader, 1);
        assert_eq!(groups[2].general_shader, vk::SHADER_UNUSED_KHR);
    }

    #[test]
    fn test_hit_group_must_name_closest_hit() {
        let exports = exports();
        let hit_groups = [HitGroupDesc { closest_hit_export: 0 }];
        assert!(matches!(
            shader_groups(&desc(&exports, &hit_groups)),
            Err(GfxError::Validation(_))
        ));

        let hit_groups = [HitGroupDesc { closest_hit_export: 7 }];
        assert!(shader_groups(&desc(&exports, &hit_groups)).is_err());
    }
}
