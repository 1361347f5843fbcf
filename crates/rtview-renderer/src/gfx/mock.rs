//! Recording graphics device.
//!
//! `MockDevice` keeps every resource in host memory and replays recorded
//! command lists at `execute`. Replay moves bytes between buffers and textures
//! and tracks texture states. It rejects barriers whose `state_before` does not
//! match the tracked state, copies out of or into the wrong state, and
//! dispatches that would read storage images not in `UnorderedAccess`.

use std::collections::HashMap;

use super::immediate::transition_textures;
use super::*;

const ADDRESS_BASE: u64 = 0x1_0000_0000;
const ADDRESS_ALIGNMENT: u64 = 256;
const IDENTIFIER_SIZE: u32 = 32;

/// A recorded command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CopyBuffer { src: BufferId, dst: BufferId, region: BufferCopyRegion },
    CopyBufferToTexture { src: BufferId, dst: TextureId, extent: Extent2D },
    CopyTexture { src: TextureId, dst: TextureId, extent: Extent2D },
    BufferBarriers(Vec<BufferBarrier>),
    TextureBarriers(Vec<TextureBarrier>),
    BuildBlas { dst: AccelId, triangle_count: u32, scratch_address: u64 },
    BuildTlas { dst: AccelId, desc: TlasBuildDesc, scratch_address: u64 },
    SetPipeline(PipelineId),
    PushConstants(Vec<u8>),
    PushConstantBuffer { slot: u32, buffer: BufferId, offset: u64, size: u64 },
    BindDescriptorTable(DescriptorTableId),
    DispatchRays(DispatchRaysDesc),
}

/// What a dispatch saw when it was replayed.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub desc: DispatchRaysDesc,
    pub pipeline: PipelineId,
    pub push_constants: Vec<u8>,
    /// Buffer, offset and size of the pushed constant buffer.
    pub constant_buffer: Option<(BufferId, u64, u64)>,
    /// Bytes of the pushed constant buffer at replay time.
    pub constants: Vec<u8>,
}

struct MockBuffer {
    desc: BufferDesc,
    address: u64,
    data: Vec<u8>,
}

struct MockTexture {
    desc: TextureDesc,
    state: TextureState,
    data: Vec<u8>,
}

struct MockTable {
    bindings: Vec<DescriptorBinding>,
    entries: HashMap<(u32, u32), DescriptorResource>,
}

struct MockAccel {
    level: AccelLevel,
    buffer: BufferId,
    address: u64,
    built: bool,
    instances: Vec<AccelerationInstance>,
}

struct MockCommandList {
    recording: bool,
    commands: Vec<Command>,
}

struct MockPipeline {
    group_count: usize,
}

#[derive(Default)]
struct ReplayState {
    pipeline: Option<PipelineId>,
    table: Option<DescriptorTableId>,
    push_constants: Vec<u8>,
    constant_buffer: Option<(BufferId, u64, u64)>,
}

/// Host-memory [`GraphicsDevice`] that validates what it replays.
pub struct MockDevice {
    next_id: usize,
    next_address: u64,
    buffers: HashMap<BufferId, MockBuffer>,
    textures: HashMap<TextureId, MockTexture>,
    views: HashMap<ViewId, (TextureId, ViewKind)>,
    samplers: HashMap<SamplerId, SamplerDesc>,
    root_signatures: HashMap<RootSignatureId, u32>,
    tables: HashMap<DescriptorTableId, MockTable>,
    command_lists: HashMap<CommandListId, MockCommandList>,
    fences: HashMap<FenceId, u64>,
    accels: HashMap<AccelId, MockAccel>,
    shaders: HashMap<ShaderId, usize>,
    pipelines: HashMap<PipelineId, MockPipeline>,
    submissions: Vec<Vec<Command>>,
    dispatches: Vec<DispatchRecord>,
    allocations_left: Option<usize>,
    fail_build_queries: bool,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            next_address: ADDRESS_BASE,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            views: HashMap::new(),
            samplers: HashMap::new(),
            root_signatures: HashMap::new(),
            tables: HashMap::new(),
            command_lists: HashMap::new(),
            fences: HashMap::new(),
            accels: HashMap::new(),
            shaders: HashMap::new(),
            pipelines: HashMap::new(),
            submissions: Vec::new(),
            dispatches: Vec::new(),
            allocations_left: None,
            fail_build_queries: false,
        }
    }

    /// Fail buffer and texture creation once `count` more have succeeded.
    pub fn fail_allocations_after(&mut self, count: usize) {
        self.allocations_left = Some(count);
    }

    /// Make acceleration structure size queries fail.
    pub fn fail_build_queries(&mut self, fail: bool) {
        self.fail_build_queries = fail;
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.len()
    }

    pub fn submissions(&self) -> &[Vec<Command>] {
        &self.submissions
    }

    pub fn dispatches(&self) -> &[DispatchRecord] {
        &self.dispatches
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_command_lists(&self) -> usize {
        self.command_lists.len()
    }

    pub fn live_fences(&self) -> usize {
        self.fences.len()
    }

    pub fn live_acceleration_structures(&self) -> usize {
        self.accels.len()
    }

    pub fn texture_state(&self, texture: TextureId) -> Option<TextureState> {
        self.textures.get(&texture).map(|t| t.state)
    }

    pub fn texture_extent(&self, texture: TextureId) -> Option<Extent2D> {
        self.textures.get(&texture).map(|t| t.desc.extent)
    }

    pub fn texture_data(&self, texture: TextureId) -> Option<&[u8]> {
        self.textures.get(&texture).map(|t| t.data.as_slice())
    }

    pub fn buffer_data(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|b| b.data.as_slice())
    }

    pub fn buffer_desc(&self, buffer: BufferId) -> Option<BufferDesc> {
        self.buffers.get(&buffer).map(|b| b.desc)
    }

    pub fn is_built(&self, accel: AccelId) -> bool {
        self.accels.get(&accel).is_some_and(|a| a.built)
    }

    /// Instances read by the last build of a top-level structure.
    pub fn tlas_instances(&self, accel: AccelId) -> Option<&[AccelerationInstance]> {
        self.accels.get(&accel).map(|a| a.instances.as_slice())
    }

    pub fn descriptor(&self, table: DescriptorTableId, slot: u32, index: u32) -> Option<DescriptorResource> {
        self.tables.get(&table).and_then(|t| t.entries.get(&(slot, index)).copied())
    }

    /// Texture a view was created over.
    pub fn view_texture(&self, view: ViewId) -> Option<TextureId> {
        self.views.get(&view).map(|(texture, _)| *texture)
    }

    fn next_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn take_allocation(&mut self, what: &str) -> GfxResult<()> {
        match self.allocations_left.as_mut() {
            Some(0) => Err(GfxError::OutOfMemory(format!("injected failure creating {}", what))),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn record(&mut self, cmd: CommandListId, command: Command) -> GfxResult<()> {
        let list = self
            .command_lists
            .get_mut(&cmd)
            .ok_or(GfxError::InvalidHandle { kind: "command list", id: cmd.0 })?;
        if !list.recording {
            return Err(GfxError::Validation(format!("command list {} is not recording", cmd.0)));
        }
        list.commands.push(command);
        Ok(())
    }

    fn buffer(&self, buffer: BufferId) -> GfxResult<&MockBuffer> {
        self.buffers.get(&buffer).ok_or(GfxError::InvalidHandle { kind: "buffer", id: buffer.0 })
    }

    fn texture(&self, texture: TextureId) -> GfxResult<&MockTexture> {
        self.textures.get(&texture).ok_or(GfxError::InvalidHandle { kind: "texture", id: texture.0 })
    }

    /// Buffer holding `address` and the offset of `address` inside it.
    fn resolve_address(&self, address: u64) -> Option<(BufferId, usize)> {
        self.buffers.iter().find_map(|(&id, buffer)| {
            let end = buffer.address + buffer.desc.size;
            (address >= buffer.address && address < end).then(|| (id, (address - buffer.address) as usize))
        })
    }

    fn expect_state(&self, texture: TextureId, expected: TextureState, what: &str) -> GfxResult<()> {
        let actual = self.texture(texture)?.state;
        if actual != expected {
            return Err(GfxError::Validation(format!(
                "{}: texture {} is {:?}, expected {:?}",
                what, texture.0, actual, expected
            )));
        }
        Ok(())
    }

    fn replay(&mut self, commands: &[Command]) -> GfxResult<()> {
        let mut state = ReplayState::default();
        for command in commands {
            match command {
                Command::CopyBuffer { src, dst, region } => {
                    let start = region.src_offset as usize;
                    let end = start + region.size as usize;
                    let bytes = self
                        .buffer(*src)?
                        .data
                        .get(start..end)
                        .ok_or_else(|| GfxError::Validation(format!("copy reads past buffer {}", src.0)))?
                        .to_vec();
                    let target = self.buffers.get_mut(dst).ok_or(GfxError::InvalidHandle { kind: "buffer", id: dst.0 })?;
                    let dst_start = region.dst_offset as usize;
                    target
                        .data
                        .get_mut(dst_start..dst_start + bytes.len())
                        .ok_or_else(|| GfxError::Validation(format!("copy writes past buffer {}", dst.0)))?
                        .copy_from_slice(&bytes);
                }
                Command::CopyBufferToTexture { src, dst, extent } => {
                    self.expect_state(*dst, TextureState::CopyDest, "buffer to texture copy")?;
                    let texture = self.texture(*dst)?;
                    if texture.desc.extent != *extent {
                        return Err(GfxError::Validation("buffer to texture copy extent mismatch".into()));
                    }
                    let len = texture.data.len();
                    let bytes = self
                        .buffer(*src)?
                        .data
                        .get(..len)
                        .ok_or_else(|| GfxError::Validation(format!("buffer {} too small for texture", src.0)))?
                        .to_vec();
                    if let Some(texture) = self.textures.get_mut(dst) {
                        texture.data.copy_from_slice(&bytes);
                    }
                }
                Command::CopyTexture { src, dst, extent } => {
                    self.expect_state(*src, TextureState::CopySource, "texture copy source")?;
                    self.expect_state(*dst, TextureState::CopyDest, "texture copy destination")?;
                    let source = self.texture(*src)?;
                    let target = self.texture(*dst)?;
                    if source.desc.extent != *extent || target.desc.extent != *extent {
                        return Err(GfxError::Validation(format!(
                            "texture copy extent {:?} does not match {:?} -> {:?}",
                            extent, source.desc.extent, target.desc.extent
                        )));
                    }
                    if source.desc.format != target.desc.format {
                        return Err(GfxError::Validation("texture copy between formats".into()));
                    }
                    let bytes = source.data.clone();
                    if let Some(texture) = self.textures.get_mut(dst) {
                        texture.data = bytes;
                    }
                }
                Command::BufferBarriers(barriers) => {
                    for barrier in barriers {
                        self.buffer(barrier.buffer)?;
                    }
                }
                Command::TextureBarriers(barriers) => {
                    for barrier in barriers {
                        let current = self.texture(barrier.texture)?.state;
                        if barrier.state_before != TextureState::Undefined && barrier.state_before != current {
                            return Err(GfxError::Validation(format!(
                                "barrier on texture {} expects {:?} but it is {:?}",
                                barrier.texture.0, barrier.state_before, current
                            )));
                        }
                        if let Some(texture) = self.textures.get_mut(&barrier.texture) {
                            texture.state = barrier.state_after;
                        }
                    }
                }
                Command::BuildBlas { dst, scratch_address, .. } => {
                    if self.resolve_address(*scratch_address).is_none() {
                        return Err(GfxError::Validation("scratch address outside any buffer".into()));
                    }
                    let accel = self.accels.get_mut(dst).ok_or(GfxError::InvalidHandle { kind: "acceleration structure", id: dst.0 })?;
                    if accel.built {
                        return Err(GfxError::Validation(format!("acceleration structure {} rebuilt", dst.0)));
                    }
                    accel.built = true;
                }
                Command::BuildTlas { dst, desc, scratch_address } => {
                    if self.resolve_address(*scratch_address).is_none() {
                        return Err(GfxError::Validation("scratch address outside any buffer".into()));
                    }
                    let instances = self.read_instances(desc)?;
                    for instance in &instances {
                        let referenced = self
                            .accels
                            .values()
                            .any(|a| a.level == AccelLevel::Bottom && a.built && a.address == instance.acceleration_structure);
                        if !referenced {
                            return Err(GfxError::Validation(format!(
                                "instance references unbuilt structure at {:#x}",
                                instance.acceleration_structure
                            )));
                        }
                    }
                    let accel = self.accels.get_mut(dst).ok_or(GfxError::InvalidHandle { kind: "acceleration structure", id: dst.0 })?;
                    if accel.built {
                        return Err(GfxError::Validation(format!("acceleration structure {} rebuilt", dst.0)));
                    }
                    accel.built = true;
                    accel.instances = instances;
                }
                Command::SetPipeline(pipeline) => state.pipeline = Some(*pipeline),
                Command::PushConstants(data) => state.push_constants = data.clone(),
                Command::PushConstantBuffer { buffer, offset, size, .. } => {
                    state.constant_buffer = Some((*buffer, *offset, *size));
                }
                Command::BindDescriptorTable(table) => state.table = Some(*table),
                Command::DispatchRays(desc) => self.replay_dispatch(&state, desc)?,
            }
        }
        Ok(())
    }

    fn read_instances(&self, desc: &TlasBuildDesc) -> GfxResult<Vec<AccelerationInstance>> {
        let (buffer, offset) = self
            .resolve_address(desc.instance_address)
            .ok_or_else(|| GfxError::Validation("instance address outside any buffer".into()))?;
        let size = std::mem::size_of::<AccelerationInstance>();
        let bytes = self
            .buffer(buffer)?
            .data
            .get(offset..offset + size * desc.instance_count as usize)
            .ok_or_else(|| GfxError::Validation("instance buffer too small".into()))?;
        Ok(bytes.chunks_exact(size).map(bytemuck::pod_read_unaligned).collect())
    }

    fn replay_dispatch(&mut self, state: &ReplayState, desc: &DispatchRaysDesc) -> GfxResult<()> {
        let pipeline = state
            .pipeline
            .ok_or_else(|| GfxError::Validation("dispatch without a pipeline".into()))?;
        let table = state
            .table
            .and_then(|t| self.tables.get(&t))
            .ok_or_else(|| GfxError::Validation("dispatch without a descriptor table".into()))?;

        for resource in table.entries.values() {
            match resource {
                DescriptorResource::StorageTexture(view) => {
                    let (texture, _) = self.views.get(view).ok_or(GfxError::InvalidHandle { kind: "view", id: view.0 })?;
                    self.expect_state(*texture, TextureState::UnorderedAccess, "dispatch output")?;
                }
                DescriptorResource::AccelerationStructure(accel) => {
                    if !self.is_built(*accel) {
                        return Err(GfxError::Validation("dispatch reads an unbuilt acceleration structure".into()));
                    }
                }
                DescriptorResource::Texture(_) | DescriptorResource::Sampler(_) => {}
            }
        }

        let constants = match state.constant_buffer {
            Some((buffer, offset, size)) => self
                .buffer(buffer)?
                .data
                .get(offset as usize..(offset + size) as usize)
                .ok_or_else(|| GfxError::Validation("constant buffer range past end".into()))?
                .to_vec(),
            None => Vec::new(),
        };

        self.dispatches.push(DispatchRecord {
            desc: *desc,
            pipeline,
            push_constants: state.push_constants.clone(),
            constant_buffer: state.constant_buffer,
            constants,
        });
        Ok(())
    }
}

impl GraphicsDevice for MockDevice {
    const SHADER_EXTENSION: &'static str = "spv";

    fn create_buffer(&mut self, desc: &BufferDesc) -> GfxResult<BufferId> {
        if desc.size == 0 {
            return Err(GfxError::Validation(format!("zero-sized buffer {}", desc.name)));
        }
        self.take_allocation(desc.name)?;
        let id = BufferId(self.next_id());
        let address = self.next_address;
        self.next_address += desc.size.div_ceil(ADDRESS_ALIGNMENT) * ADDRESS_ALIGNMENT + ADDRESS_ALIGNMENT;
        self.buffers.insert(
            id,
            MockBuffer {
                desc: *desc,
                address,
                data: vec![0; desc.size as usize],
            },
        );
        Ok(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> GfxResult<()> {
        let target = self.buffers.get_mut(&buffer).ok_or(GfxError::InvalidHandle { kind: "buffer", id: buffer.0 })?;
        if target.desc.location != MemoryLocation::Upload {
            return Err(GfxError::Validation(format!("{} is not CPU visible", target.desc.name)));
        }
        let start = offset as usize;
        target
            .data
            .get_mut(start..start + data.len())
            .ok_or_else(|| GfxError::Validation(format!("write past end of {}", buffer.0)))?
            .copy_from_slice(data);
        Ok(())
    }

    fn buffer_address(&self, buffer: BufferId) -> GfxResult<u64> {
        let b = self.buffer(buffer)?;
        if !b.desc.usage.intersects(BufferUsage::ADDRESSABLE) {
            return Err(GfxError::Validation(format!("{} has no device address", b.desc.name)));
        }
        Ok(b.address)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> GfxResult<TextureId> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(GfxError::Validation(format!("zero-sized texture {}", desc.name)));
        }
        self.take_allocation(desc.name)?;
        let id = TextureId(self.next_id());
        let len = (desc.extent.width * desc.extent.height * desc.format.bytes_per_pixel()) as usize;
        self.textures.insert(
            id,
            MockTexture {
                desc: *desc,
                state: TextureState::Undefined,
                data: vec![0; len],
            },
        );
        Ok(id)
    }

    fn create_texture_view(&mut self, texture: TextureId, kind: ViewKind) -> GfxResult<ViewId> {
        let usage = self.texture(texture)?.desc.usage;
        let required = match kind {
            ViewKind::ShaderResource => TextureUsage::SHADER_RESOURCE,
            ViewKind::UnorderedAccess => TextureUsage::UNORDERED_ACCESS,
        };
        if !usage.contains(required) {
            return Err(GfxError::Validation(format!("texture {} lacks {:?}", texture.0, required)));
        }
        let id = ViewId(self.next_id());
        self.views.insert(id, (texture, kind));
        Ok(id)
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
        self.views.retain(|_, (t, _)| *t != texture);
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> GfxResult<SamplerId> {
        let id = SamplerId(self.next_id());
        self.samplers.insert(id, *desc);
        Ok(id)
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) {
        self.samplers.remove(&sampler);
    }

    fn create_root_signature(&mut self, desc: &RootSignatureDesc) -> GfxResult<RootSignatureId> {
        let id = RootSignatureId(self.next_id());
        self.root_signatures.insert(id, desc.push_constant_bytes);
        Ok(id)
    }

    fn destroy_root_signature(&mut self, root: RootSignatureId) {
        self.root_signatures.remove(&root);
    }

    fn create_descriptor_table(&mut self, bindings: &[DescriptorBinding]) -> GfxResult<DescriptorTableId> {
        let id = DescriptorTableId(self.next_id());
        self.tables.insert(
            id,
            MockTable {
                bindings: bindings.to_vec(),
                entries: HashMap::new(),
            },
        );
        Ok(id)
    }

    fn write_descriptor(
        &mut self,
        table: DescriptorTableId,
        slot: u32,
        index: u32,
        resource: DescriptorResource,
    ) -> GfxResult<()> {
        let valid = match resource {
            DescriptorResource::StorageTexture(view) | DescriptorResource::Texture(view) => self.views.contains_key(&view),
            DescriptorResource::AccelerationStructure(accel) => self.accels.contains_key(&accel),
            DescriptorResource::Sampler(sampler) => self.samplers.contains_key(&sampler),
        };
        if !valid {
            return Err(GfxError::Validation(format!("stale resource {:?}", resource)));
        }
        let entry = self
            .tables
            .get_mut(&table)
            .ok_or(GfxError::InvalidHandle { kind: "descriptor table", id: table.0 })?;
        let binding = entry
            .bindings
            .get(slot as usize)
            .ok_or_else(|| GfxError::Validation(format!("slot {} out of range", slot)))?;
        if binding.kind != resource.kind() || index >= binding.count {
            return Err(GfxError::Validation(format!(
                "{:?} does not fit slot {} index {} ({:?} x{})",
                resource, slot, index, binding.kind, binding.count
            )));
        }
        entry.entries.insert((slot, index), resource);
        Ok(())
    }

    fn destroy_descriptor_table(&mut self, table: DescriptorTableId) {
        self.tables.remove(&table);
    }

    fn create_command_list(&mut self) -> GfxResult<CommandListId> {
        let id = CommandListId(self.next_id());
        self.command_lists.insert(
            id,
            MockCommandList {
                recording: false,
                commands: Vec::new(),
            },
        );
        Ok(id)
    }

    fn reset_command_list(&mut self, cmd: CommandListId) -> GfxResult<()> {
        let list = self
            .command_lists
            .get_mut(&cmd)
            .ok_or(GfxError::InvalidHandle { kind: "command list", id: cmd.0 })?;
        list.recording = true;
        list.commands.clear();
        Ok(())
    }

    fn close_command_list(&mut self, cmd: CommandListId) -> GfxResult<()> {
        let list = self
            .command_lists
            .get_mut(&cmd)
            .ok_or(GfxError::InvalidHandle { kind: "command list", id: cmd.0 })?;
        if !list.recording {
            return Err(GfxError::Validation(format!("command list {} closed twice", cmd.0)));
        }
        list.recording = false;
        Ok(())
    }

    fn destroy_command_list(&mut self, cmd: CommandListId) {
        self.command_lists.remove(&cmd);
    }

    fn execute(&mut self, lists: &[CommandListId]) -> GfxResult<()> {
        for cmd in lists {
            let list = self
                .command_lists
                .get(cmd)
                .ok_or(GfxError::InvalidHandle { kind: "command list", id: cmd.0 })?;
            if list.recording {
                return Err(GfxError::Validation(format!("command list {} executed while open", cmd.0)));
            }
            let commands = list.commands.clone();
            self.replay(&commands)?;
            self.submissions.push(commands);
        }
        Ok(())
    }

    fn create_fence(&mut self) -> GfxResult<FenceId> {
        let id = FenceId(self.next_id());
        self.fences.insert(id, 0);
        Ok(id)
    }

    fn signal_fence(&mut self, fence: FenceId, value: u64) -> GfxResult<()> {
        let current = self.fences.get_mut(&fence).ok_or(GfxError::InvalidHandle { kind: "fence", id: fence.0 })?;
        *current = value;
        Ok(())
    }

    fn wait_fence(&mut self, fence: FenceId, value: u64) -> GfxResult<()> {
        let current = *self.fences.get(&fence).ok_or(GfxError::InvalidHandle { kind: "fence", id: fence.0 })?;
        if current < value {
            return Err(GfxError::Validation(format!(
                "fence {} is at {} and never reaches {}",
                fence.0, current, value
            )));
        }
        Ok(())
    }

    fn destroy_fence(&mut self, fence: FenceId) {
        self.fences.remove(&fence);
    }

    fn wait_idle(&mut self) -> GfxResult<()> {
        Ok(())
    }

    fn cmd_copy_buffer(
        &mut self,
        cmd: CommandListId,
        src: BufferId,
        dst: BufferId,
        region: BufferCopyRegion,
    ) -> GfxResult<()> {
        self.record(cmd, Command::CopyBuffer { src, dst, region })
    }

    fn cmd_copy_buffer_to_texture(
        &mut self,
        cmd: CommandListId,
        src: BufferId,
        dst: TextureId,
        extent: Extent2D,
    ) -> GfxResult<()> {
        self.record(cmd, Command::CopyBufferToTexture { src, dst, extent })
    }

    fn cmd_copy_texture(
        &mut self,
        cmd: CommandListId,
        src: TextureId,
        dst: TextureId,
        extent: Extent2D,
    ) -> GfxResult<()> {
        self.record(cmd, Command::CopyTexture { src, dst, extent })
    }

    fn cmd_buffer_barriers(&mut self, cmd: CommandListId, barriers: &[BufferBarrier]) -> GfxResult<()> {
        self.record(cmd, Command::BufferBarriers(barriers.to_vec()))
    }

    fn cmd_texture_barriers(&mut self, cmd: CommandListId, barriers: &[TextureBarrier]) -> GfxResult<()> {
        self.record(cmd, Command::TextureBarriers(barriers.to_vec()))
    }

    fn blas_build_sizes(&self, geometry: &[TriangleGeometry]) -> GfxResult<AccelBuildSizes> {
        if self.fail_build_queries {
            return Err(GfxError::Backend("bottom-level size query rejected".into()));
        }
        let triangles: u64 = geometry.iter().map(|g| g.triangle_count as u64).sum();
        Ok(AccelBuildSizes {
            result_size: 256 + 64 * triangles,
            scratch_size: 128 + 32 * triangles,
        })
    }

    fn tlas_build_sizes(&self, desc: &TlasBuildDesc) -> GfxResult<AccelBuildSizes> {
        if self.fail_build_queries {
            return Err(GfxError::Backend("top-level size query rejected".into()));
        }
        let instances = desc.instance_count as u64;
        Ok(AccelBuildSizes {
            result_size: 128 + 64 * instances,
            scratch_size: 64 + 16 * instances,
        })
    }

    fn create_acceleration_structure(
        &mut self,
        buffer: BufferId,
        offset: u64,
        size: u64,
        level: AccelLevel,
    ) -> GfxResult<AccelId> {
        let storage = self.buffer(buffer)?;
        if !storage.desc.usage.contains(BufferUsage::ACCELERATION_STRUCTURE_BUFFER) {
            return Err(GfxError::Validation(format!("{} cannot hold acceleration structures", storage.desc.name)));
        }
        if offset + size > storage.desc.size {
            return Err(GfxError::Validation("acceleration structure exceeds its buffer".into()));
        }
        let address = storage.address + offset;
        let id = AccelId(self.next_id());
        self.accels.insert(
            id,
            MockAccel {
                level,
                buffer,
                address,
                built: false,
                instances: Vec::new(),
            },
        );
        Ok(id)
    }

    fn acceleration_structure_address(&self, accel: AccelId) -> GfxResult<u64> {
        let a = self
            .accels
            .get(&accel)
            .ok_or(GfxError::InvalidHandle { kind: "acceleration structure", id: accel.0 })?;
        if !self.buffers.contains_key(&a.buffer) {
            return Err(GfxError::Validation("acceleration structure outlived its buffer".into()));
        }
        Ok(a.address)
    }

    fn destroy_acceleration_structure(&mut self, accel: AccelId) {
        self.accels.remove(&accel);
    }

    fn cmd_build_blas(
        &mut self,
        cmd: CommandListId,
        geometry: &[TriangleGeometry],
        dst: AccelId,
        scratch_address: u64,
    ) -> GfxResult<()> {
        for g in geometry {
            if self.resolve_address(g.vertex_address).is_none() || self.resolve_address(g.index_address).is_none() {
                return Err(GfxError::Validation("geometry address outside any buffer".into()));
            }
        }
        let triangle_count = geometry.iter().map(|g| g.triangle_count).sum();
        self.record(cmd, Command::BuildBlas { dst, triangle_count, scratch_address })
    }

    fn cmd_build_tlas(
        &mut self,
        cmd: CommandListId,
        desc: &TlasBuildDesc,
        dst: AccelId,
        scratch_address: u64,
    ) -> GfxResult<()> {
        self.record(cmd, Command::BuildTlas { dst, desc: *desc, scratch_address })
    }

    fn create_shader(&mut self, bytecode: &[u8]) -> GfxResult<ShaderId> {
        if bytecode.is_empty() {
            return Err(GfxError::Validation("empty shader bytecode".into()));
        }
        let id = ShaderId(self.next_id());
        self.shaders.insert(id, bytecode.len());
        Ok(id)
    }

    fn destroy_shader(&mut self, shader: ShaderId) {
        self.shaders.remove(&shader);
    }

    fn create_raytracing_pipeline(&mut self, desc: &RaytracingPipelineDesc) -> GfxResult<PipelineId> {
        if !self.root_signatures.contains_key(&desc.root_signature) {
            return Err(GfxError::InvalidHandle { kind: "root signature", id: desc.root_signature.0 });
        }
        if !self.shaders.contains_key(&desc.library) {
            return Err(GfxError::InvalidHandle { kind: "shader", id: desc.library.0 });
        }
        for group in desc.hit_groups {
            let export = desc
                .exports
                .get(group.closest_hit_export as usize)
                .ok_or_else(|| GfxError::Validation("hit group names a missing export".into()))?;
            if export.shader_type != RaytracingShaderType::ClosestHit {
                return Err(GfxError::Validation(format!("{} is not a closest-hit shader", export.entry_point)));
            }
        }
        let general = desc
            .exports
            .iter()
            .filter(|e| e.shader_type != RaytracingShaderType::ClosestHit)
            .count();
        let id = PipelineId(self.next_id());
        self.pipelines.insert(
            id,
            MockPipeline {
                group_count: general + desc.hit_groups.len(),
            },
        );
        Ok(id)
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        self.pipelines.remove(&pipeline);
    }

    fn shader_identifiers(&self, pipeline: PipelineId) -> GfxResult<Vec<u8>> {
        let p = self
            .pipelines
            .get(&pipeline)
            .ok_or(GfxError::InvalidHandle { kind: "pipeline", id: pipeline.0 })?;
        Ok((0..p.group_count)
            .flat_map(|group| std::iter::repeat((group + 1) as u8).take(IDENTIFIER_SIZE as usize))
            .collect())
    }

    fn sbt_info(&self) -> SbtInfo {
        SbtInfo {
            entry_size: IDENTIFIER_SIZE,
            entry_alignment: IDENTIFIER_SIZE,
            table_start_alignment: 64,
        }
    }

    fn cmd_set_pipeline(&mut self, cmd: CommandListId, pipeline: PipelineId) -> GfxResult<()> {
        if !self.pipelines.contains_key(&pipeline) {
            return Err(GfxError::InvalidHandle { kind: "pipeline", id: pipeline.0 });
        }
        self.record(cmd, Command::SetPipeline(pipeline))
    }

    fn cmd_push_constants(&mut self, cmd: CommandListId, root: RootSignatureId, data: &[u8]) -> GfxResult<()> {
        let limit = *self
            .root_signatures
            .get(&root)
            .ok_or(GfxError::InvalidHandle { kind: "root signature", id: root.0 })?;
        if data.len() as u32 > limit {
            return Err(GfxError::Validation(format!("{} push constant bytes exceed {}", data.len(), limit)));
        }
        self.record(cmd, Command::PushConstants(data.to_vec()))
    }

    fn cmd_push_constant_buffer(
        &mut self,
        cmd: CommandListId,
        root: RootSignatureId,
        slot: u32,
        buffer: BufferId,
        offset: u64,
        size: u64,
    ) -> GfxResult<()> {
        if !self.root_signatures.contains_key(&root) {
            return Err(GfxError::InvalidHandle { kind: "root signature", id: root.0 });
        }
        if offset + size > self.buffer(buffer)?.desc.size {
            return Err(GfxError::Validation("constant buffer range past end".into()));
        }
        self.record(cmd, Command::PushConstantBuffer { slot, buffer, offset, size })
    }

    fn cmd_bind_descriptor_table(
        &mut self,
        cmd: CommandListId,
        root: RootSignatureId,
        table: DescriptorTableId,
    ) -> GfxResult<()> {
        if !self.root_signatures.contains_key(&root) {
            return Err(GfxError::InvalidHandle { kind: "root signature", id: root.0 });
        }
        self.record(cmd, Command::BindDescriptorTable(table))
    }

    fn cmd_dispatch_rays(&mut self, cmd: CommandListId, desc: &DispatchRaysDesc) -> GfxResult<()> {
        self.record(cmd, Command::DispatchRays(*desc))
    }
}

/// Two-image presentation surface over [`MockDevice`] textures.
pub struct MockSurface {
    images: Vec<TextureId>,
    format: Format,
    extent: Extent2D,
    frame: usize,
    acquired: bool,
    presents: usize,
    /// Largest extent the window system allows.
    max_extent: Option<Extent2D>,
    /// Extent the surface recreates itself at on the next acquire.
    out_of_date: Option<Extent2D>,
}

impl MockSurface {
    pub const IMAGE_COUNT: usize = 2;

    pub fn new(gfx: &mut MockDevice, extent: Extent2D) -> GfxResult<Self> {
        let mut surface = Self {
            images: Vec::new(),
            format: Format::Bgra8Unorm,
            extent,
            frame: 0,
            acquired: false,
            presents: 0,
            max_extent: None,
            out_of_date: None,
        };
        surface.create_images(gfx)?;
        Ok(surface)
    }

    pub fn present_count(&self) -> usize {
        self.presents
    }

    /// Clamp later resizes to `max`, the way a window system caps a swapchain.
    pub fn set_max_extent(&mut self, max: Extent2D) {
        self.max_extent = Some(max);
    }

    /// Recreate at `extent` on the next acquire, as an out-of-date swapchain does.
    pub fn invalidate(&mut self, extent: Extent2D) {
        self.out_of_date = Some(extent);
    }

    fn recreate(&mut self, gfx: &mut MockDevice, width: u32, height: u32) -> GfxResult<()> {
        for image in self.images.drain(..) {
            gfx.destroy_texture(image);
        }
        let (width, height) = match self.max_extent {
            Some(max) => (width.min(max.width), height.min(max.height)),
            None => (width, height),
        };
        self.extent = Extent2D::new(width.max(1), height.max(1));
        self.frame = 0;
        self.create_images(gfx)
    }

    fn create_images(&mut self, gfx: &mut MockDevice) -> GfxResult<()> {
        let mut barriers = Vec::with_capacity(Self::IMAGE_COUNT);
        for _ in 0..Self::IMAGE_COUNT {
            let image = gfx.create_texture(&TextureDesc {
                extent: self.extent,
                format: self.format,
                usage: TextureUsage::COPY_DST,
                name: "presentation image",
            })?;
            barriers.push(TextureBarrier::transition(
                image,
                (BarrierSync::None, TextureState::Undefined),
                (BarrierSync::None, TextureState::Present),
            ));
            self.images.push(image);
        }
        transition_textures(gfx, &barriers)
    }
}

impl PresentationSurface<MockDevice> for MockSurface {
    fn format(&self) -> Format {
        self.format
    }

    fn extent(&self) -> Extent2D {
        self.extent
    }

    fn acquire(&mut self, gfx: &mut MockDevice) -> GfxResult<usize> {
        if self.acquired {
            return Err(GfxError::Validation("image acquired twice".into()));
        }
        if let Some(extent) = self.out_of_date.take() {
            self.recreate(gfx, extent.width, extent.height)?;
        }
        self.acquired = true;
        Ok(self.frame)
    }

    fn current_frame(&self) -> usize {
        self.frame
    }

    fn texture(&self, frame_index: usize) -> TextureId {
        self.images[frame_index % self.images.len()]
    }

    fn present(&mut self, gfx: &mut MockDevice) -> GfxResult<()> {
        if !self.acquired {
            return Err(GfxError::Validation("present without acquire".into()));
        }
        gfx.expect_state(self.texture(self.frame), TextureState::Present, "present")?;
        self.acquired = false;
        self.presents += 1;
        self.frame = (self.frame + 1) % self.images.len();
        Ok(())
    }

    fn resize(&mut self, gfx: &mut MockDevice, width: u32, height: u32) -> GfxResult<()> {
        self.acquired = false;
        self.recreate(gfx, width, height)
    }

    fn throttle(&mut self, gfx: &mut MockDevice) -> GfxResult<()> {
        gfx.wait_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::immediate::submit_immediate;

    fn texture(gfx: &mut MockDevice) -> TextureId {
        gfx.create_texture(&TextureDesc {
            extent: Extent2D::new(2, 2),
            format: Format::Rgba8Unorm,
            usage: TextureUsage::COPY_DST | TextureUsage::SHADER_RESOURCE,
            name: "t",
        })
        .unwrap()
    }

    #[test]
    fn test_barrier_state_mismatch_rejected() {
        let mut gfx = MockDevice::new();
        let t = texture(&mut gfx);
        let result = transition_textures(
            &mut gfx,
            &[TextureBarrier::transition(
                t,
                (BarrierSync::Copy, TextureState::CopyDest),
                (BarrierSync::Raytracing, TextureState::ShaderResource),
            )],
        );
        assert!(matches!(result, Err(GfxError::Validation(_))));
        assert_eq!(gfx.texture_state(t), Some(TextureState::Undefined));
    }

    #[test]
    fn test_buffer_copy_moves_bytes() {
        let mut gfx = MockDevice::new();
        let src = gfx
            .create_buffer(&BufferDesc {
                size: 8,
                usage: BufferUsage::COPY_SRC,
                location: MemoryLocation::Upload,
                name: "src",
            })
            .unwrap();
        let dst = gfx
            .create_buffer(&BufferDesc {
                size: 8,
                usage: BufferUsage::COPY_DST,
                location: MemoryLocation::GpuOnly,
                name: "dst",
            })
            .unwrap();
        gfx.write_buffer(src, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        submit_immediate::<_, _, GfxError, _>(&mut gfx, |gfx, cmd| {
            gfx.cmd_copy_buffer(cmd, src, dst, BufferCopyRegion { src_offset: 4, dst_offset: 0, size: 4 })
        })
        .unwrap();
        assert_eq!(&gfx.buffer_data(dst).unwrap()[..4], &[5, 6, 7, 8]);
        assert!(gfx.write_buffer(dst, 0, &[0]).is_err());
    }

    #[test]
    fn test_allocation_failure_injection() {
        let mut gfx = MockDevice::new();
        gfx.fail_allocations_after(1);
        texture(&mut gfx);
        let result = gfx.create_texture(&TextureDesc {
            extent: Extent2D::new(1, 1),
            format: Format::Rgba8Unorm,
            usage: TextureUsage::COPY_DST,
            name: "second",
        });
        assert!(matches!(result, Err(GfxError::OutOfMemory(_))));
    }

    #[test]
    fn test_surface_alternates_frames() {
        let mut gfx = MockDevice::new();
        let mut surface = MockSurface::new(&mut gfx, Extent2D::new(4, 4)).unwrap();
        assert_eq!(surface.acquire(&mut gfx).unwrap(), 0);
        surface.present(&mut gfx).unwrap();
        assert_eq!(surface.acquire(&mut gfx).unwrap(), 1);
        surface.present(&mut gfx).unwrap();
        assert_eq!(surface.acquire(&mut gfx).unwrap(), 0);
        assert!(surface.acquire(&mut gfx).is_err());
    }

    #[test]
    fn test_wait_on_unsignaled_fence_fails() {
        let mut gfx = MockDevice::new();
        let fence = gfx.create_fence().unwrap();
        assert!(gfx.wait_fence(fence, 1).is_err());
        gfx.signal_fence(fence, 1).unwrap();
        assert!(gfx.wait_fence(fence, 1).is_ok());
    }
}
