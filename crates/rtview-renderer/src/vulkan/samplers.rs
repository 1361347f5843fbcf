//! Sampler descriptions to Vulkan create infos.

use ash::vk;

use crate::gfx::{AddressMode, Filter, SamplerDesc};

fn filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

fn mipmap_mode(filter: Filter) -> vk::SamplerMipmapMode {
    match filter {
        Filter::Nearest => vk::SamplerMipmapMode::NEAREST,
        Filter::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
    }
}

/// `max_anisotropy_limit` is the device limit; requests above it are clamped.
pub fn sampler_create_info(desc: &SamplerDesc, max_anisotropy_limit: f32) -> vk::SamplerCreateInfo<'static> {
    vk::SamplerCreateInfo::default()
        .mag_filter(filter(desc.mag_filter))
        .min_filter(filter(desc.min_filter))
        .mipmap_mode(mipmap_mode(desc.mip_filter))
        .address_mode_u(address_mode(desc.address_u))
        .address_mode_v(address_mode(desc.address_v))
        .address_mode_w(address_mode(desc.address_w))
        .mip_lod_bias(desc.mip_lod_bias)
        .anisotropy_enable(desc.anisotropic)
        .max_anisotropy(desc.max_anisotropy.clamp(1.0, max_anisotropy_limit.max(1.0)))
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .min_lod(desc.min_lod)
        .max_lod(desc.max_lod)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::pipeline::texture_sampler;

    #[test]
    fn test_texture_sampler_is_trilinear_repeat() {
        let info = sampler_create_info(&texture_sampler(), 16.0);
        assert_eq!(info.min_filter, vk::Filter::LINEAR);
        assert_eq!(info.mipmap_mode, vk::SamplerMipmapMode::LINEAR);
        assert_eq!(info.address_mode_u, vk::SamplerAddressMode::REPEAT);
        assert_eq!(info.max_lod, 1.0);
        assert_eq!(info.anisotropy_enable, vk::FALSE);
    }

    #[test]
    fn test_anisotropy_clamped_to_limit() {
        let mut desc = texture_sampler();
        desc.anisotropic = true;
        desc.max_anisotropy = 64.0;
        let info = sampler_create_info(&desc, 16.0);
        assert_eq!(info.max_anisotropy, 16.0);
    }
}
