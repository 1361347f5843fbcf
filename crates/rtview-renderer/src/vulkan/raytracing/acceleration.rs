//! Acceleration structure geometry, size queries and build recording.

use ash::khr::acceleration_structure;
use ash::vk;

use crate::gfx::{AccelBuildSizes, AccelLevel, GfxError, IndexFormat, TlasBuildDesc, TriangleGeometry, VertexFormat};

/// An acceleration structure placed inside a device buffer.
pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub level: AccelLevel,
    pub device_address: vk::DeviceAddress,
}

pub fn accel_type(level: AccelLevel) -> vk::AccelerationStructureTypeKHR {
    match level {
        AccelLevel::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelLevel::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

fn index_type(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::U16 => vk::IndexType::UINT16,
        IndexFormat::U32 => vk::IndexType::UINT32,
    }
}

fn vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Rgb32Float => vk::Format::R32G32B32_SFLOAT,
    }
}

pub fn triangle_geometry(geometry: &TriangleGeometry) -> vk::AccelerationStructureGeometryKHR<'static> {
    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
        .vertex_format(vertex_format(geometry.vertex_format))
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: geometry.vertex_address,
        })
        .vertex_stride(geometry.vertex_stride)
        .max_vertex(geometry.vertex_count.saturating_sub(1))
        .index_type(index_type(geometry.index_format))
        .index_data(vk::DeviceOrHostAddressConstKHR {
            device_address: geometry.index_address,
        });

    let flags = if geometry.opaque {
        vk::GeometryFlagsKHR::OPAQUE
    } else {
        vk::GeometryFlagsKHR::empty()
    };

    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
        .flags(flags)
}

pub fn instance_geometry(desc: &TlasBuildDesc) -> vk::AccelerationStructureGeometryKHR<'static> {
    let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
        .array_of_pointers(false)
        .data(vk::DeviceOrHostAddressConstKHR {
            device_address: desc.instance_address,
        });

    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
}

fn build_info<'a>(
    level: AccelLevel,
    update: bool,
    geometries: &'a [vk::AccelerationStructureGeometryKHR<'a>],
) -> vk::AccelerationStructureBuildGeometryInfoKHR<'a> {
    let mode = if update {
        vk::BuildAccelerationStructureModeKHR::UPDATE
    } else {
        vk::BuildAccelerationStructureModeKHR::BUILD
    };

    vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(accel_type(level))
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(mode)
        .geometries(geometries)
}

unsafe fn query_sizes(
    loader: &acceleration_structure::Device,
    info: &vk::AccelerationStructureBuildGeometryInfoKHR,
    primitive_counts: &[u32],
) -> Result<AccelBuildSizes, GfxError> {
    let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
    loader.get_acceleration_structure_build_sizes(
        vk::AccelerationStructureBuildTypeKHR::DEVICE,
        info,
        primitive_counts,
        &mut size_info,
    );

    if size_info.acceleration_structure_size == 0 {
        return Err(GfxError::Validation(
            "driver reported a zero-sized acceleration structure".to_string(),
        ));
    }

    Ok(AccelBuildSizes {
        result_size: size_info.acceleration_structure_size,
        scratch_size: size_info.build_scratch_size,
    })
}

pub unsafe fn blas_build_sizes(
    loader: &acceleration_structure::Device,
    geometry: &[TriangleGeometry],
) -> Result<AccelBuildSizes, GfxError> {
    let geometries: Vec<_> = geometry.iter().map(triangle_geometry).collect();
    let counts: Vec<u32> = geometry.iter().map(|g| g.triangle_count).collect();
    query_sizes(loader, &build_info(AccelLevel::Bottom, false, &geometries), &counts)
}

pub unsafe fn tlas_build_sizes(
    loader: &acceleration_structure::Device,
    desc: &TlasBuildDesc,
) -> Result<AccelBuildSizes, GfxError> {
    let geometries = [instance_geometry(desc)];
    query_sizes(
        loader,
        &build_info(AccelLevel::Top, desc.update, &geometries),
        &[desc.instance_count],
    )
}

pub unsafe fn create(
    loader: &acceleration_structure::Device,
    buffer: vk::Buffer,
    offset: u64,
    size: u64,
    level: AccelLevel,
) -> Result<AccelerationStructure, GfxError> {
    let create_info = vk::AccelerationStructureCreateInfoKHR::default()
        .buffer(buffer)
        .offset(offset)
        .size(size)
        .ty(accel_type(level));

    let handle = loader
        .create_acceleration_structure(&create_info, None)
        .map_err(|e| super::super::vk_error("Failed to create acceleration structure", e))?;

    let addr_info = vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
    let device_address = loader.get_acceleration_structure_device_address(&addr_info);

    Ok(AccelerationStructure {
        handle,
        level,
        device_address,
    })
}

pub unsafe fn cmd_build_blas(
    loader: &acceleration_structure::Device,
    cmd: vk::CommandBuffer,
    geometry: &[TriangleGeometry],
    dst: vk::AccelerationStructureKHR,
    scratch_address: u64,
) {
    let geometries: Vec<_> = geometry.iter().map(triangle_geometry).collect();
    let info = build_info(AccelLevel::Bottom, false, &geometries)
        .dst_acceleration_structure(dst)
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: scratch_address,
        });

    let ranges: Vec<_> = geometry
        .iter()
        .map(|g| {
            vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(g.triangle_count)
                .primitive_offset(0)
                .first_vertex(0)
                .transform_offset(0)
        })
        .collect();

    loader.cmd_build_acceleration_structures(cmd, &[info], &[&ranges]);
}

pub unsafe fn cmd_build_tlas(
    loader: &acceleration_structure::Device,
    cmd: vk::CommandBuffer,
    desc: &TlasBuildDesc,
    dst: vk::AccelerationStructureKHR,
    scratch_address: u64,
) {
    let geometries = [instance_geometry(desc)];
    let mut info = build_info(AccelLevel::Top, desc.update, &geometries)
        .dst_acceleration_structure(dst)
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: scratch_address,
        });
    if desc.update {
        info = info.src_acceleration_structure(dst);
    }

    let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
        .primitive_count(desc.instance_count)
        .primitive_offset(0)
        .first_vertex(0)
        .transform_offset(0);

    loader.cmd_build_acceleration_structures(cmd, &[info], &[std::slice::from_ref(&range)]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangle_geometry_uses_highest_vertex_index() {
        let geometry = triangle_geometry(&TriangleGeometry {
            vertex_address: 0x1000,
            vertex_stride: 12,
            vertex_count: 100,
            vertex_format: VertexFormat::Rgb32Float,
            index_address: 0x2000,
            index_format: IndexFormat::U16,
            triangle_count: 100,
            opaque: true,
        });
        assert_eq!(geometry.geometry_type, vk::GeometryTypeKHR::TRIANGLES);
        assert_eq!(geometry.flags, vk::GeometryFlagsKHR::OPAQUE);
        let triangles = unsafe { geometry.geometry.triangles };
        assert_eq!(triangles.max_vertex, 99);
        assert_eq!(triangles.index_type, vk::IndexType::UINT16);
        assert_eq!(triangles.vertex_stride, 12);
    }

    #[test]
    fn test_accel_type_mapping() {
        assert_eq!(accel_type(AccelLevel::Top), vk::AccelerationStructureTypeKHR::TOP_LEVEL);
        assert_eq!(
            accel_type(AccelLevel::Bottom),
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL
        );
    }
}
