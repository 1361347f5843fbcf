//! Orbit camera.
//!
//! The camera orbits the origin at `radius`, oriented by pitch (about +X) and
//! yaw (about +Y, applied last). Shaders read the inverse view and inverse
//! projection to turn pixel coordinates into world-space rays.
//!
//! Recomputation is memoized with generation counters: every orientation or
//! distance change bumps `view_generation`, every projection change bumps
//! `projection_generation`, and the cached inverse view remembers the
//! generation it was computed at.

use std::f32::consts::{FRAC_PI_2, PI, TAU};

use bytemuck::{Pod, Zeroable};
use glam::{EulerRot, Mat4, Quat, Vec3};

pub const DEFAULT_PITCH: f32 = 0.733_371_5;
pub const DEFAULT_YAW: f32 = -3.880_099;
pub const DEFAULT_RADIUS: f32 = 8.0;

pub const MIN_RADIUS: f32 = 1.0;
pub const MAX_RADIUS: f32 = 10.0;
pub const PITCH_LIMIT: f32 = 0.995 * FRAC_PI_2;

pub const FIELD_OF_VIEW: f32 = 60.0 * PI / 180.0;
pub const NEAR_PLANE: f32 = 0.1;
pub const FAR_PLANE: f32 = 100.0;

/// Camera block read by the ray generation shader, column-major.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraConstants {
    pub inv_view: [[f32; 4]; 4],
    pub inv_projection: [[f32; 4]; 4],
}

impl CameraConstants {
    pub const SIZE: usize = std::mem::size_of::<CameraConstants>();
}

#[derive(Debug, Clone, Copy)]
struct Memo {
    generation: u64,
    value: Mat4,
}

#[derive(Debug, Clone)]
pub struct Camera {
    pitch: f32,
    yaw: f32,
    radius: f32,
    view_generation: u64,
    projection_generation: u64,
    inv_view: Option<Memo>,
    inv_projection: Mat4,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new()
    }
}

impl Camera {
    pub fn new() -> Self {
        let mut camera = Self {
            pitch: 0.0,
            yaw: 0.0,
            radius: DEFAULT_RADIUS,
            view_generation: 0,
            projection_generation: 0,
            inv_view: None,
            inv_projection: Mat4::IDENTITY,
        };
        camera.reset_orientation();
        camera.set_perspective(FIELD_OF_VIEW, 1.0, NEAR_PLANE, FAR_PLANE);
        camera
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    pub fn yaw(&self) -> f32 {
        self.yaw
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    /// Changes whenever the constants written by [`write_constants`](Self::write_constants) would change.
    pub fn generation(&self) -> u64 {
        self.view_generation.wrapping_add(self.projection_generation)
    }

    /// Add to pitch and yaw, in radians.
    pub fn rotate(&mut self, pitch: f32, yaw: f32) {
        self.set_orientation(self.pitch + pitch, self.yaw + yaw);
    }

    /// Move toward the origin by `amount`, staying within [1, 10].
    pub fn zoom(&mut self, amount: f32) {
        self.radius = (self.radius - amount).clamp(MIN_RADIUS, MAX_RADIUS);
        self.view_generation += 1;
    }

    pub fn reset_orientation(&mut self) {
        self.radius = DEFAULT_RADIUS;
        self.set_orientation(DEFAULT_PITCH, DEFAULT_YAW);
    }

    pub fn zero_orientation(&mut self) {
        self.set_orientation(0.0, 0.0);
    }

    pub fn set_perspective(&mut self, fov_y: f32, aspect: f32, near: f32, far: f32) {
        self.inv_projection = Mat4::perspective_lh(fov_y, aspect, near, far).inverse();
        self.projection_generation += 1;
    }

    /// Eye position in world space.
    pub fn position(&self) -> Vec3 {
        self.rotation() * Vec3::new(0.0, 0.0, -self.radius)
    }

    /// Inverse view and inverse projection, recomputing the view only if it
    /// changed since it was last computed.
    pub fn constants(&mut self) -> CameraConstants {
        let inv_view = self.inverse_view();
        CameraConstants {
            inv_view: inv_view.to_cols_array_2d(),
            inv_projection: self.inv_projection.to_cols_array_2d(),
        }
    }

    /// Copy [`constants`](Self::constants) into the first 128 bytes of `destination`.
    ///
    /// # Panics
    ///
    /// Panics if `destination` is shorter than [`CameraConstants::SIZE`].
    pub fn write_constants(&mut self, destination: &mut [u8]) {
        let constants = self.constants();
        destination[..CameraConstants::SIZE].copy_from_slice(bytemuck::bytes_of(&constants));
    }

    fn set_orientation(&mut self, pitch: f32, yaw: f32) {
        self.yaw = wrap_angle(yaw);
        self.pitch = wrap_angle(pitch).clamp(-PITCH_LIMIT, PITCH_LIMIT);
        self.view_generation += 1;
    }

    fn rotation(&self) -> Quat {
        Quat::from_euler(EulerRot::YXZ, self.yaw, self.pitch, 0.0)
    }

    fn inverse_view(&mut self) -> Mat4 {
        match self.inv_view {
            Some(memo) if memo.generation == self.view_generation => memo.value,
            _ => {
                let position = self.position();
                let value = Mat4::look_to_lh(position, -position.normalize(), Vec3::Y).inverse();
                self.inv_view = Some(Memo {
                    generation: self.view_generation,
                    value,
                });
                value
            }
        }
    }
}

/// Wrap an angle into (-pi, pi].
fn wrap_angle(angle: f32) -> f32 {
    let wrapped = PI - (PI - angle).rem_euclid(TAU);
    if wrapped <= -PI {
        wrapped + TAU
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use glam::Mat3;

    #[test]
    fn test_constants_are_128_bytes() {
        assert_eq!(CameraConstants::SIZE, 128);
    }

    #[test]
    fn test_wrap_angle() {
        assert_relative_eq!(wrap_angle(0.5), 0.5);
        assert_relative_eq!(wrap_angle(PI), PI);
        assert_relative_eq!(wrap_angle(-PI), PI);
        assert_relative_eq!(wrap_angle(3.0 * PI / 2.0), -PI / 2.0, epsilon = 1e-5);
        assert_relative_eq!(wrap_angle(DEFAULT_YAW), DEFAULT_YAW + TAU, epsilon = 1e-5);
    }

    #[test]
    fn test_rotation_stays_in_bounds() {
        let mut camera = Camera::new();
        let steps = [0.3, -7.9, 12.5, 100.0, -0.001, 3.2, -250.0, 6.3];
        for (i, &a) in steps.iter().enumerate() {
            let b = steps[(i + 3) % steps.len()];
            camera.rotate(a, b);
            assert!(camera.yaw() > -PI && camera.yaw() <= PI, "yaw {}", camera.yaw());
            assert!(camera.pitch().abs() <= PITCH_LIMIT, "pitch {}", camera.pitch());
        }
    }

    #[test]
    fn test_zoom_bounds() {
        let mut camera = Camera::new();
        for amount in [3.0, 100.0, -2.5, -1000.0, 0.25, 9.0] {
            camera.zoom(amount);
            assert!((MIN_RADIUS..=MAX_RADIUS).contains(&camera.radius()));
        }
        camera.zoom(100.0);
        assert_eq!(camera.radius(), MIN_RADIUS);
        camera.zoom(-100.0);
        assert_eq!(camera.radius(), MAX_RADIUS);
    }

    #[test]
    fn test_write_constants_idempotent() {
        let mut camera = Camera::new();
        camera.rotate(0.2, -0.4);
        let mut first = [0u8; 256];
        let mut second = [0u8; 256];
        camera.write_constants(&mut first);
        let generation = camera.generation();
        camera.write_constants(&mut second);
        assert_eq!(first, second);
        assert_eq!(camera.generation(), generation);
        assert_eq!(&first[128..], &[0u8; 128][..]);
    }

    #[test]
    fn test_view_memoized_until_changed() {
        let mut camera = Camera::new();
        camera.constants();
        let memo = camera.inv_view.expect("computed");
        assert_eq!(memo.generation, camera.view_generation);

        camera.set_perspective(1.0, 2.0, 0.1, 100.0);
        camera.constants();
        assert_eq!(camera.inv_view.expect("computed").generation, memo.generation);

        camera.zoom(1.0);
        camera.constants();
        assert!(camera.inv_view.expect("computed").generation > memo.generation);
    }

    #[test]
    fn test_default_camera_matches_reference() {
        let mut camera = Camera::new();
        camera.set_perspective(FIELD_OF_VIEW, 800.0 / 600.0, NEAR_PLANE, FAR_PLANE);
        let constants = camera.constants();
        let inv_view = Mat4::from_cols_array_2d(&constants.inv_view);
        let inv_projection = Mat4::from_cols_array_2d(&constants.inv_projection);

        // Rx(pitch) then Ry(yaw) applied to (0, 0, -r).
        let (p, y, r) = (DEFAULT_PITCH, DEFAULT_YAW, DEFAULT_RADIUS);
        let eye = Vec3::new(-r * p.cos() * y.sin(), r * p.sin(), -r * p.cos() * y.cos());

        assert_abs_diff_eq!(inv_view.w_axis.truncate(), eye, epsilon = 1e-4);
        assert_abs_diff_eq!(inv_view.z_axis.truncate(), -eye.normalize(), epsilon = 1e-5);
        assert_abs_diff_eq!(inv_view.x_axis.truncate().dot(Vec3::Y), 0.0, epsilon = 1e-5);
        let basis = Mat3::from_mat4(inv_view);
        assert_abs_diff_eq!(basis.transpose() * basis, Mat3::IDENTITY, epsilon = 1e-5);
        assert_abs_diff_eq!(
            inv_projection * Mat4::perspective_lh(FIELD_OF_VIEW, 800.0 / 600.0, NEAR_PLANE, FAR_PLANE),
            Mat4::IDENTITY,
            epsilon = 1e-4
        );
    }

    #[test]
    fn test_view_basis_orthonormal_at_any_radius() {
        let mut camera = Camera::new();
        for (pitch, yaw, zoom) in [(0.0, 0.0, 0.0), (0.3, -1.2, 3.0), (-0.5, 2.0, -20.0)] {
            camera.rotate(pitch, yaw);
            camera.zoom(zoom);
            let inv_view = Mat4::from_cols_array_2d(&camera.constants().inv_view);
            let basis = Mat3::from_mat4(inv_view);
            assert_abs_diff_eq!(basis.transpose() * basis, Mat3::IDENTITY, epsilon = 1e-5);
            assert_relative_eq!(inv_view.w_axis.truncate().length(), camera.radius(), epsilon = 1e-4);
        }
    }

    #[test]
    fn test_reset_and_zero_orientation() {
        let mut camera = Camera::new();
        camera.rotate(1.0, 1.0);
        camera.zoom(4.0);
        camera.reset_orientation();
        assert_relative_eq!(camera.pitch(), DEFAULT_PITCH);
        assert_relative_eq!(camera.yaw(), wrap_angle(DEFAULT_YAW));
        assert_eq!(camera.radius(), DEFAULT_RADIUS);

        camera.zero_orientation();
        assert_abs_diff_eq!(camera.position(), Vec3::new(0.0, 0.0, -DEFAULT_RADIUS), epsilon = 1e-5);
    }
}
