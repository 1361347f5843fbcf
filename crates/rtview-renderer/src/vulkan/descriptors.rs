//! Descriptor pool, set layouts and pipeline layouts.
//!
//! A root signature maps onto a pipeline layout with two sets: set 0 is the
//! descriptor table, set 1 a push descriptor set, plus one push constant range.

use ash::vk;

use super::VulkanContext;
use crate::gfx::{DescriptorBinding, DescriptorKind, GfxError, RootSignatureDesc};

/// Set index of the descriptor table.
pub const TABLE_SET: u32 = 0;
/// Set index of the push descriptors.
pub const PUSH_SET: u32 = 1;

/// Stages that see every binding.
pub const RAYTRACING_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw(),
);

pub fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorKind::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        DescriptorKind::Texture => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
        DescriptorKind::ConstantBuffer => vk::DescriptorType::UNIFORM_BUFFER,
    }
}

/// A pipeline layout and the set layouts it owns.
pub struct PipelineLayout {
    pub layout: vk::PipelineLayout,
    pub set_layouts: [vk::DescriptorSetLayout; 2],
}

/// An allocated descriptor set and the slot kinds it was created with.
pub struct DescriptorTable {
    pub set: vk::DescriptorSet,
    pub layout: vk::DescriptorSetLayout,
    pub bindings: Vec<DescriptorBinding>,
}

pub struct DescriptorManager {
    pool: vk::DescriptorPool,
    device: ash::Device,
}

impl DescriptorManager {
    pub unsafe fn new(ctx: &VulkanContext) -> Result<Self, String> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: 16,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: 8,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: 32,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: 8,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 8,
            },
        ];

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(8)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        let pool = ctx
            .device
            .create_descriptor_pool(&pool_info, None)
            .map_err(|e| format!("Failed to create descriptor pool: {:?}", e))?;

        Ok(Self {
            pool,
            device: ctx.device.clone(),
        })
    }

    /// Binding `i` of the layout is slot `i` of `bindings`.
    unsafe fn create_set_layout(
        &self,
        bindings: &[DescriptorBinding],
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> Result<vk::DescriptorSetLayout, GfxError> {
        let vk_bindings: Vec<_> = bindings
            .iter()
            .enumerate()
            .map(|(slot, binding)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(slot as u32)
                    .descriptor_type(descriptor_type(binding.kind))
                    .descriptor_count(binding.count)
                    .stage_flags(RAYTRACING_STAGES)
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(flags)
            .bindings(&vk_bindings);

        self.device
            .create_descriptor_set_layout(&layout_info, None)
            .map_err(|e| super::vk_error("Failed to create descriptor set layout", e))
    }

    pub unsafe fn create_pipeline_layout(&self, desc: &RootSignatureDesc) -> Result<PipelineLayout, GfxError> {
        let table_layout = self.create_set_layout(desc.bindings, vk::DescriptorSetLayoutCreateFlags::empty())?;

        let push_bindings: Vec<_> = desc
            .push_descriptors
            .iter()
            .map(|&kind| DescriptorBinding { kind, count: 1 })
            .collect();
        let push_layout =
            match self.create_set_layout(&push_bindings, vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR) {
                Ok(layout) => layout,
                Err(e) => {
                    self.device.destroy_descriptor_set_layout(table_layout, None);
                    return Err(e);
                }
            };

        let set_layouts = [table_layout, push_layout];
        let push_ranges = [vk::PushConstantRange {
            stage_flags: RAYTRACING_STAGES,
            offset: 0,
            size: desc.push_constant_bytes,
        }];
        let ranges: &[vk::PushConstantRange] = if desc.push_constant_bytes > 0 {
            &push_ranges
        } else {
            &[]
        };

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(ranges);

        match self.device.create_pipeline_layout(&layout_info, None) {
            Ok(layout) => Ok(PipelineLayout { layout, set_layouts }),
            Err(e) => {
                for set_layout in set_layouts {
                    self.device.destroy_descriptor_set_layout(set_layout, None);
                }
                Err(super::vk_error("Failed to create pipeline layout", e))
            }
        }
    }

    pub unsafe fn destroy_pipeline_layout(&self, layout: PipelineLayout) {
        self.device.destroy_pipeline_layout(layout.layout, None);
        for set_layout in layout.set_layouts {
            self.device.destroy_descriptor_set_layout(set_layout, None);
        }
    }

    pub unsafe fn create_table(&self, bindings: &[DescriptorBinding]) -> Result<DescriptorTable, GfxError> {
        let layout = self.create_set_layout(bindings, vk::DescriptorSetLayoutCreateFlags::empty())?;
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        match self.device.allocate_descriptor_sets(&alloc_info) {
            Ok(sets) => Ok(DescriptorTable {
                set: sets[0],
                layout,
                bindings: bindings.to_vec(),
            }),
            Err(e) => {
                self.device.destroy_descriptor_set_layout(layout, None);
                Err(super::vk_error("Failed to allocate descriptor set", e))
            }
        }
    }

    pub unsafe fn destroy_table(&self, table: DescriptorTable) {
        let _ = self.device.free_descriptor_sets(self.pool, &[table.set]);
        self.device.destroy_descriptor_set_layout(table.layout, None);
    }

    pub unsafe fn destroy(&mut self) {
        self.device.destroy_descriptor_pool(self.pool, None);
        self.pool = vk::DescriptorPool::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_types() {
        assert_eq!(
            descriptor_type(DescriptorKind::StorageTexture),
            vk::DescriptorType::STORAGE_IMAGE
        );
        assert_eq!(
            descriptor_type(DescriptorKind::ConstantBuffer),
            vk::DescriptorType::UNIFORM_BUFFER
        );
    }

    #[test]
    fn test_raytracing_stages() {
        assert!(RAYTRACING_STAGES.contains(vk::ShaderStageFlags::RAYGEN_KHR));
        assert!(RAYTRACING_STAGES.contains(vk::ShaderStageFlags::CLOSEST_HIT_KHR));
        assert!(!RAYTRACING_STAGES.contains(vk::ShaderStageFlags::FRAGMENT));
    }
}
