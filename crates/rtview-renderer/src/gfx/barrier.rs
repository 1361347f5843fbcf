//! Explicit barrier vocabulary.
//!
//! Every barrier names the pipeline work it waits on and blocks, the memory
//! access on both sides and, for textures, the layout before and after.

use super::{BufferId, TextureId};

/// Pipeline stages a barrier synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierSync {
    None,
    All,
    Copy,
    Raytracing,
    BuildAccelerationStructure,
}

/// Memory access on one side of a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceAccess {
    NoAccess,
    CopySource,
    CopyDest,
    UnorderedAccess,
    ShaderResource,
    ConstantBuffer,
    AccelerationStructureRead,
    AccelerationStructureWrite,
}

/// Layout of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureState {
    /// Contents are discarded. Valid as a barrier source from any state.
    Undefined,
    UnorderedAccess,
    CopySource,
    CopyDest,
    ShaderResource,
    Present,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureBarrier {
    pub texture: TextureId,
    pub sync_before: BarrierSync,
    pub sync_after: BarrierSync,
    pub access_before: ResourceAccess,
    pub access_after: ResourceAccess,
    pub state_before: TextureState,
    pub state_after: TextureState,
}

impl TextureBarrier {
    /// Layout transition with the access implied by each state.
    pub fn transition(
        texture: TextureId,
        (sync_before, state_before): (BarrierSync, TextureState),
        (sync_after, state_after): (BarrierSync, TextureState),
    ) -> Self {
        Self {
            texture,
            sync_before,
            sync_after,
            access_before: state_before.implied_access(),
            access_after: state_after.implied_access(),
            state_before,
            state_after,
        }
    }
}

impl TextureState {
    /// The access a texture in this state is used for.
    pub fn implied_access(self) -> ResourceAccess {
        match self {
            TextureState::Undefined | TextureState::Present => ResourceAccess::NoAccess,
            TextureState::UnorderedAccess => ResourceAccess::UnorderedAccess,
            TextureState::CopySource => ResourceAccess::CopySource,
            TextureState::CopyDest => ResourceAccess::CopyDest,
            TextureState::ShaderResource => ResourceAccess::ShaderResource,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: BufferId,
    pub sync_before: BarrierSync,
    pub sync_after: BarrierSync,
    pub access_before: ResourceAccess,
    pub access_after: ResourceAccess,
}

impl BufferBarrier {
    /// Make a finished copy into `buffer` visible to acceleration structure builds.
    pub fn copy_to_build_input(buffer: BufferId) -> Self {
        Self {
            buffer,
            sync_before: BarrierSync::Copy,
            sync_after: BarrierSync::BuildAccelerationStructure,
            access_before: ResourceAccess::CopyDest,
            access_after: ResourceAccess::ShaderResource,
        }
    }

    /// Order a finished bottom-level build before a top-level build reads it.
    pub fn blas_to_tlas(buffer: BufferId) -> Self {
        Self {
            buffer,
            sync_before: BarrierSync::BuildAccelerationStructure,
            sync_after: BarrierSync::BuildAccelerationStructure,
            access_before: ResourceAccess::AccelerationStructureWrite,
            access_after: ResourceAccess::AccelerationStructureRead,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_derives_access() {
        let barrier = TextureBarrier::transition(
            TextureId(3),
            (BarrierSync::None, TextureState::Undefined),
            (BarrierSync::Copy, TextureState::CopyDest),
        );
        assert_eq!(barrier.access_before, ResourceAccess::NoAccess);
        assert_eq!(barrier.access_after, ResourceAccess::CopyDest);
        assert_eq!(barrier.state_after, TextureState::CopyDest);
    }
}
