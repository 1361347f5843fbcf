//! Graphics device seam.
//!
//! The scene code never talks to Vulkan directly. It drives a
//! [`GraphicsDevice`] through opaque handles and records explicit barriers for
//! every state change, and it reads presentable images from a
//! [`PresentationSurface`]. The Vulkan backend lives in [`crate::vulkan`]; the
//! recording device in [`mock`] backs the unit tests.

pub mod barrier;
pub mod immediate;
#[cfg(any(test, feature = "mock-gfx"))]
pub mod mock;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

pub use barrier::{BarrierSync, BufferBarrier, ResourceAccess, TextureBarrier, TextureState};

macro_rules! handles {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub usize);
        )*
    };
}

handles!(
    /// Handle to a GPU buffer.
    BufferId,
    /// Handle to a 2D image.
    TextureId,
    /// Handle to a shader-visible view of a texture.
    ViewId,
    /// Handle to a sampler.
    SamplerId,
    /// Handle to a bottom- or top-level acceleration structure.
    AccelId,
    /// Handle to a resettable command list.
    CommandListId,
    /// Handle to a timeline fence.
    FenceId,
    /// Handle to a compiled shader library.
    ShaderId,
    /// Handle to a ray tracing pipeline.
    PipelineId,
    /// Handle to a pipeline binding layout (push constants, push descriptors, table).
    RootSignatureId,
    /// Handle to a descriptor table.
    DescriptorTableId,
);

/// Device-level failure.
#[derive(Debug, Error)]
pub enum GfxError {
    #[error("out of device memory: {0}")]
    OutOfMemory(String),
    #[error("invalid {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: usize },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0}")]
    Backend(String),
}

impl From<String> for GfxError {
    fn from(message: String) -> Self {
        GfxError::Backend(message)
    }
}

pub type GfxResult<T> = Result<T, GfxError>;

/// 2D extent in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Width over height. Zero-height extents report 1.0.
    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

bitflags! {
    /// How a buffer is used by the GPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const INDEX_BUFFER = 1 << 2;
        const VERTEX_BUFFER = 1 << 3;
        const CONSTANT_BUFFER = 1 << 4;
        const STORAGE_BUFFER = 1 << 5;
        const ACCELERATION_STRUCTURE_INPUT = 1 << 6;
        const ACCELERATION_STRUCTURE_BUFFER = 1 << 7;
        const SHADER_BINDING_TABLE = 1 << 8;
    }
}

impl BufferUsage {
    /// Usages that need a GPU virtual address.
    pub const ADDRESSABLE: BufferUsage = BufferUsage::STORAGE_BUFFER
        .union(BufferUsage::ACCELERATION_STRUCTURE_INPUT)
        .union(BufferUsage::ACCELERATION_STRUCTURE_BUFFER)
        .union(BufferUsage::SHADER_BINDING_TABLE);
}

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Device-local, not CPU visible.
    GpuOnly,
    /// CPU-visible and persistently mapped.
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
    pub name: &'static str,
}

/// Texel formats used by the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Rgba8Unorm,
    Bgra8Unorm,
}

impl Format {
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Format::Rgba8Unorm | Format::Bgra8Unorm => 4,
        }
    }
}

bitflags! {
    /// How a texture is used by the GPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const SHADER_RESOURCE = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub extent: Extent2D,
    pub format: Format,
    pub usage: TextureUsage,
    pub name: &'static str,
}

/// Kind of view created over a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    /// Read-only sampled view.
    ShaderResource,
    /// Read-write storage view.
    UnorderedAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mip_filter: Filter,
    pub anisotropic: bool,
    pub max_anisotropy: f32,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub min_lod: f32,
    pub max_lod: f32,
    pub mip_lod_bias: f32,
}

/// Kind of resource a descriptor slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    StorageTexture,
    AccelerationStructure,
    Texture,
    Sampler,
    ConstantBuffer,
}

/// One slot of a descriptor table: a kind and an array length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub kind: DescriptorKind,
    pub count: u32,
}

/// A resource written into a descriptor table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorResource {
    StorageTexture(ViewId),
    AccelerationStructure(AccelId),
    Texture(ViewId),
    Sampler(SamplerId),
}

impl DescriptorResource {
    pub fn kind(&self) -> DescriptorKind {
        match self {
            DescriptorResource::StorageTexture(_) => DescriptorKind::StorageTexture,
            DescriptorResource::AccelerationStructure(_) => DescriptorKind::AccelerationStructure,
            DescriptorResource::Texture(_) => DescriptorKind::Texture,
            DescriptorResource::Sampler(_) => DescriptorKind::Sampler,
        }
    }
}

/// Binding layout of a pipeline.
#[derive(Debug, Clone, Copy)]
pub struct RootSignatureDesc<'a> {
    /// Size in bytes of the push constant block.
    pub push_constant_bytes: u32,
    /// Descriptors pushed per dispatch instead of living in the table.
    pub push_descriptors: &'a [DescriptorKind],
    /// Descriptor table slots, in slot order.
    pub bindings: &'a [DescriptorBinding],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferCopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub const fn size(self) -> u64 {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Rgb32Float,
}

/// Triangle geometry input of a bottom-level build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_address: u64,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub vertex_format: VertexFormat,
    pub index_address: u64,
    pub index_format: IndexFormat,
    pub triangle_count: u32,
    pub opaque: bool,
}

/// Result of an acceleration structure size query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelBuildSizes {
    pub result_size: u64,
    pub scratch_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelLevel {
    Bottom,
    Top,
}

/// Top-level build input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlasBuildDesc {
    pub instance_address: u64,
    pub instance_count: u32,
    /// Refit an existing structure. Not used by the viewer; always false.
    pub update: bool,
}

bitflags! {
    /// Per-instance flags. Bit values match the hardware instance record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u8 {
        const TRIANGLE_CULL_DISABLE = 0x1;
        const TRIANGLE_FRONT_COUNTERCLOCKWISE = 0x2;
        const FORCE_OPAQUE = 0x4;
        const FORCE_NON_OPAQUE = 0x8;
    }
}

/// Hardware instance record read by top-level builds (64 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AccelerationInstance {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [[f32; 4]; 3],
    /// Custom index in the low 24 bits, visibility mask in the high 8.
    pub instance_id_and_mask: u32,
    /// Hit group offset in the low 24 bits, [`InstanceFlags`] in the high 8.
    pub sbt_offset_and_flags: u32,
    /// Device address of the referenced bottom-level structure.
    pub acceleration_structure: u64,
}

impl AccelerationInstance {
    pub const IDENTITY: [[f32; 4]; 3] = [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
    ];

    pub fn new(
        transform: [[f32; 4]; 3],
        instance_id: u32,
        mask: u8,
        sbt_offset: u32,
        flags: InstanceFlags,
        blas_address: u64,
    ) -> Self {
        Self {
            transform,
            instance_id_and_mask: ((mask as u32) << 24) | (instance_id & 0x00FF_FFFF),
            sbt_offset_and_flags: ((flags.bits() as u32) << 24) | (sbt_offset & 0x00FF_FFFF),
            acceleration_structure: blas_address,
        }
    }

    pub fn mask(&self) -> u8 {
        (self.instance_id_and_mask >> 24) as u8
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id_and_mask & 0x00FF_FFFF
    }

    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_truncate((self.sbt_offset_and_flags >> 24) as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaytracingShaderType {
    Raygen,
    Miss,
    ClosestHit,
}

/// A named entry point of the shader library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderExport<'a> {
    pub entry_point: &'a str,
    pub shader_type: RaytracingShaderType,
}

/// A triangle hit group built from exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitGroupDesc {
    /// Index into [`RaytracingPipelineDesc::exports`].
    pub closest_hit_export: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RaytracingPipelineDesc<'a> {
    pub root_signature: RootSignatureId,
    pub library: ShaderId,
    pub exports: &'a [ShaderExport<'a>],
    pub hit_groups: &'a [HitGroupDesc],
    pub max_recursion_depth: u32,
    pub max_payload_size: u32,
    pub max_attribute_size: u32,
}

/// Shader identifier geometry reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtInfo {
    /// Size of one shader identifier in bytes.
    pub entry_size: u32,
    /// Required alignment of a record within a table.
    pub entry_alignment: u32,
    /// Required alignment of each table's start address.
    pub table_start_alignment: u32,
}

/// A GPU address range walked with a fixed stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StridedRegion {
    pub address: u64,
    pub size: u64,
    pub stride: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchRaysDesc {
    pub raygen: StridedRegion,
    pub miss: StridedRegion,
    pub hit_group: StridedRegion,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// The graphics device the renderer core drives.
///
/// Resources are addressed through handles owned by the device. Recording
/// methods (`cmd_*`) append to a command list that is between
/// [`reset_command_list`](Self::reset_command_list) and
/// [`close_command_list`](Self::close_command_list).
pub trait GraphicsDevice {
    /// File extension of compiled shader libraries for this backend.
    const SHADER_EXTENSION: &'static str;

    fn create_buffer(&mut self, desc: &BufferDesc) -> GfxResult<BufferId>;
    /// Copy bytes into an [`MemoryLocation::Upload`] buffer.
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> GfxResult<()>;
    fn buffer_address(&self, buffer: BufferId) -> GfxResult<u64>;
    fn destroy_buffer(&mut self, buffer: BufferId);

    fn create_texture(&mut self, desc: &TextureDesc) -> GfxResult<TextureId>;
    fn create_texture_view(&mut self, texture: TextureId, kind: ViewKind) -> GfxResult<ViewId>;
    /// Destroy a texture and every view created over it.
    fn destroy_texture(&mut self, texture: TextureId);

    fn create_sampler(&mut self, desc: &SamplerDesc) -> GfxResult<SamplerId>;
    fn destroy_sampler(&mut self, sampler: SamplerId);

    fn create_root_signature(&mut self, desc: &RootSignatureDesc) -> GfxResult<RootSignatureId>;
    fn destroy_root_signature(&mut self, root: RootSignatureId);
    fn create_descriptor_table(&mut self, bindings: &[DescriptorBinding]) -> GfxResult<DescriptorTableId>;
    fn write_descriptor(
        &mut self,
        table: DescriptorTableId,
        slot: u32,
        index: u32,
        resource: DescriptorResource,
    ) -> GfxResult<()>;
    fn destroy_descriptor_table(&mut self, table: DescriptorTableId);

    fn create_command_list(&mut self) -> GfxResult<CommandListId>;
    /// Discard previous contents and start recording.
    fn reset_command_list(&mut self, cmd: CommandListId) -> GfxResult<()>;
    fn close_command_list(&mut self, cmd: CommandListId) -> GfxResult<()>;
    fn destroy_command_list(&mut self, cmd: CommandListId);
    /// Submit closed command lists to the single queue.
    fn execute(&mut self, lists: &[CommandListId]) -> GfxResult<()>;

    fn create_fence(&mut self) -> GfxResult<FenceId>;
    /// Queue-side signal of `value` after all previously submitted work.
    fn signal_fence(&mut self, fence: FenceId, value: u64) -> GfxResult<()>;
    /// Block the CPU until the fence reaches `value`.
    fn wait_fence(&mut self, fence: FenceId, value: u64) -> GfxResult<()>;
    fn destroy_fence(&mut self, fence: FenceId);
    /// Block the CPU until the queue is idle.
    fn wait_idle(&mut self) -> GfxResult<()>;

    fn cmd_copy_buffer(
        &mut self,
        cmd: CommandListId,
        src: BufferId,
        dst: BufferId,
        region: BufferCopyRegion,
    ) -> GfxResult<()>;
    /// Copy a tightly packed buffer into mip 0 of a texture in `CopyDest` state.
    fn cmd_copy_buffer_to_texture(
        &mut self,
        cmd: CommandListId,
        src: BufferId,
        dst: TextureId,
        extent: Extent2D,
    ) -> GfxResult<()>;
    /// Exact-extent copy between two textures of the same format.
    fn cmd_copy_texture(
        &mut self,
        cmd: CommandListId,
        src: TextureId,
        dst: TextureId,
        extent: Extent2D,
    ) -> GfxResult<()>;
    fn cmd_buffer_barriers(&mut self, cmd: CommandListId, barriers: &[BufferBarrier]) -> GfxResult<()>;
    fn cmd_texture_barriers(&mut self, cmd: CommandListId, barriers: &[TextureBarrier]) -> GfxResult<()>;

    fn blas_build_sizes(&self, geometry: &[TriangleGeometry]) -> GfxResult<AccelBuildSizes>;
    fn tlas_build_sizes(&self, desc: &TlasBuildDesc) -> GfxResult<AccelBuildSizes>;
    /// Place an acceleration structure inside `buffer`.
    fn create_acceleration_structure(
        &mut self,
        buffer: BufferId,
        offset: u64,
        size: u64,
        level: AccelLevel,
    ) -> GfxResult<AccelId>;
    fn acceleration_structure_address(&self, accel: AccelId) -> GfxResult<u64>;
    fn destroy_acceleration_structure(&mut self, accel: AccelId);
    fn cmd_build_blas(
        &mut self,
        cmd: CommandListId,
        geometry: &[TriangleGeometry],
        dst: AccelId,
        scratch_address: u64,
    ) -> GfxResult<()>;
    fn cmd_build_tlas(
        &mut self,
        cmd: CommandListId,
        desc: &TlasBuildDesc,
        dst: AccelId,
        scratch_address: u64,
    ) -> GfxResult<()>;

    fn create_shader(&mut self, bytecode: &[u8]) -> GfxResult<ShaderId>;
    fn destroy_shader(&mut self, shader: ShaderId);
    fn create_raytracing_pipeline(&mut self, desc: &RaytracingPipelineDesc) -> GfxResult<PipelineId>;
    fn destroy_pipeline(&mut self, pipeline: PipelineId);
    /// Shader identifiers of every group, raygen and miss groups in export
    /// order followed by hit groups, each [`SbtInfo::entry_size`] bytes.
    fn shader_identifiers(&self, pipeline: PipelineId) -> GfxResult<Vec<u8>>;
    fn sbt_info(&self) -> SbtInfo;

    fn cmd_set_pipeline(&mut self, cmd: CommandListId, pipeline: PipelineId) -> GfxResult<()>;
    fn cmd_push_constants(&mut self, cmd: CommandListId, root: RootSignatureId, data: &[u8]) -> GfxResult<()>;
    fn cmd_push_constant_buffer(
        &mut self,
        cmd: CommandListId,
        root: RootSignatureId,
        slot: u32,
        buffer: BufferId,
        offset: u64,
        size: u64,
    ) -> GfxResult<()>;
    fn cmd_bind_descriptor_table(
        &mut self,
        cmd: CommandListId,
        root: RootSignatureId,
        table: DescriptorTableId,
    ) -> GfxResult<()>;
    fn cmd_dispatch_rays(&mut self, cmd: CommandListId, desc: &DispatchRaysDesc) -> GfxResult<()>;
}

/// The rotating set of presentable images.
pub trait PresentationSurface<G: GraphicsDevice> {
    fn format(&self) -> Format;
    fn extent(&self) -> Extent2D;
    /// Make the next image writable and return its in-flight frame index.
    fn acquire(&mut self, gfx: &mut G) -> GfxResult<usize>;
    /// Frame index returned by the last [`acquire`](Self::acquire).
    fn current_frame(&self) -> usize;
    /// Image backing a frame index, in `Present` state outside a frame.
    fn texture(&self, frame_index: usize) -> TextureId;
    /// Queue the current image for display.
    fn present(&mut self, gfx: &mut G) -> GfxResult<()>;
    fn resize(&mut self, gfx: &mut G, width: u32, height: u32) -> GfxResult<()>;
    /// Drain outstanding presentation work before shutdown.
    fn throttle(&mut self, gfx: &mut G) -> GfxResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_record_layout() {
        assert_eq!(std::mem::size_of::<AccelerationInstance>(), 64);
        let instance = AccelerationInstance::new(
            AccelerationInstance::IDENTITY,
            0,
            0xFF,
            0,
            InstanceFlags::TRIANGLE_CULL_DISABLE,
            0xDEAD_BEEF,
        );
        assert_eq!(instance.mask(), 0xFF);
        assert_eq!(instance.instance_id(), 0);
        assert_eq!(instance.flags(), InstanceFlags::TRIANGLE_CULL_DISABLE);
        assert_eq!(instance.sbt_offset_and_flags, 0x0100_0000);
        assert_eq!(instance.acceleration_structure, 0xDEAD_BEEF);
    }

    #[test]
    fn test_instance_id_truncated_to_24_bits() {
        let instance = AccelerationInstance::new(
            AccelerationInstance::IDENTITY,
            0x1234_5678,
            0x0F,
            0,
            InstanceFlags::empty(),
            0,
        );
        assert_eq!(instance.instance_id(), 0x34_5678);
        assert_eq!(instance.mask(), 0x0F);
    }

    #[test]
    fn test_aspect_ratio() {
        assert_eq!(Extent2D::new(800, 600).aspect_ratio(), 800.0 / 600.0);
        assert_eq!(Extent2D::new(10, 0).aspect_ratio(), 1.0);
    }
}
