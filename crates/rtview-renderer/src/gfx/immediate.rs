//! One-shot GPU submissions.
//!
//! Setup work (uploads, layout transitions, acceleration structure builds) is
//! recorded into a throwaway command list, submitted and waited on before
//! returning. The command list and fence are released on every exit path.

use super::{CommandListId, FenceId, GfxError, GraphicsDevice, TextureBarrier};

/// Record with `record`, submit, and block until the GPU has finished.
///
/// Errors from `record` abandon the submission; the transient objects are
/// released either way.
pub fn submit_immediate<G, T, E, F>(gfx: &mut G, record: F) -> Result<T, E>
where
    G: GraphicsDevice,
    E: From<GfxError>,
    F: FnOnce(&mut G, CommandListId) -> Result<T, E>,
{
    let cmd = gfx.create_command_list()?;
    let fence = match gfx.create_fence() {
        Ok(fence) => fence,
        Err(e) => {
            gfx.destroy_command_list(cmd);
            return Err(e.into());
        }
    };

    let result = record_and_wait(gfx, cmd, fence, record);

    gfx.destroy_fence(fence);
    gfx.destroy_command_list(cmd);
    result
}

fn record_and_wait<G, T, E, F>(gfx: &mut G, cmd: CommandListId, fence: FenceId, record: F) -> Result<T, E>
where
    G: GraphicsDevice,
    E: From<GfxError>,
    F: FnOnce(&mut G, CommandListId) -> Result<T, E>,
{
    gfx.reset_command_list(cmd)?;
    let value = record(gfx, cmd)?;
    gfx.close_command_list(cmd)?;
    gfx.execute(&[cmd])?;
    gfx.signal_fence(fence, 1)?;
    gfx.wait_fence(fence, 1)?;
    Ok(value)
}

/// Apply texture barriers in their own submission.
pub fn transition_textures<G: GraphicsDevice>(gfx: &mut G, barriers: &[TextureBarrier]) -> Result<(), GfxError> {
    submit_immediate(gfx, |gfx, cmd| gfx.cmd_texture_barriers(cmd, barriers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::mock::MockDevice;
    use crate::gfx::{BarrierSync, Extent2D, Format, TextureDesc, TextureState, TextureUsage};

    #[test]
    fn test_immediate_runs_and_releases() {
        let mut gfx = MockDevice::new();
        let value: Result<u32, GfxError> = submit_immediate(&mut gfx, |_, _| Ok(7));
        assert_eq!(value.unwrap(), 7);
        assert_eq!(gfx.live_command_lists(), 0);
        assert_eq!(gfx.live_fences(), 0);
        assert_eq!(gfx.submission_count(), 1);
    }

    #[test]
    fn test_immediate_releases_on_record_failure() {
        let mut gfx = MockDevice::new();
        let result: Result<(), GfxError> =
            submit_immediate(&mut gfx, |_, _| Err(GfxError::Validation("boom".into())));
        assert!(matches!(result, Err(GfxError::Validation(_))));
        assert_eq!(gfx.live_command_lists(), 0);
        assert_eq!(gfx.live_fences(), 0);
        assert_eq!(gfx.submission_count(), 0);
    }

    #[test]
    fn test_transition_textures_updates_state() {
        let mut gfx = MockDevice::new();
        let texture = gfx
            .create_texture(&TextureDesc {
                extent: Extent2D::new(4, 4),
                format: Format::Rgba8Unorm,
                usage: TextureUsage::UNORDERED_ACCESS,
                name: "t",
            })
            .unwrap();
        transition_textures(
            &mut gfx,
            &[TextureBarrier::transition(
                texture,
                (BarrierSync::None, TextureState::Undefined),
                (BarrierSync::Raytracing, TextureState::UnorderedAccess),
            )],
        )
        .unwrap();
        assert_eq!(gfx.texture_state(texture), Some(TextureState::UnorderedAccess));
    }
}
