//! Camera and the per-traversal view snapshot

use crate::core::types::{Mat4, Quat, Vec3};
use crate::math::Frustum;

/// Distances closer than this are clamped so a camera inside a node
/// still yields a finite projected size.
pub const MIN_VIEW_DISTANCE: f32 = 1e-3;

/// Perspective camera with position, rotation, and projection parameters
#[derive(Clone, Copy, Debug)]
pub struct Camera {
    /// World position
    pub position: Vec3,
    /// Rotation as quaternion
    pub rotation: Quat,
    /// Vertical field of view in radians
    pub fov_y: f32,
    /// Aspect ratio (width / height)
    pub aspect: f32,
    /// Near clip plane
    pub near: f32,
    /// Far clip plane
    pub far: f32,
}

impl Camera {
    /// Create a new camera looking down -Z
    pub fn new(position: Vec3, fov_y_degrees: f32, aspect: f32) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near: 0.1,
            far: 10_000.0,
        }
    }

    /// Create camera looking at a target
    pub fn look_at(position: Vec3, target: Vec3, up: Vec3) -> Self {
        let forward = (target - position).normalize();
        let right = forward.cross(up).normalize();
        let up = right.cross(forward);

        let rotation = Quat::from_mat3(&glam::Mat3::from_cols(right, up, -forward));

        Self {
            rotation,
            ..Self::new(position, 60.0, 16.0 / 9.0)
        }
    }

    /// Get view matrix (world to camera space)
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::from_quat(self.rotation.conjugate()) * Mat4::from_translation(-self.position)
    }

    /// Get projection matrix (camera to clip space)
    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    /// Get combined view-projection matrix
    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Get forward direction (negative Z in camera space)
    pub fn forward(&self) -> Vec3 {
        self.rotation * -Vec3::Z
    }

    /// Frustum of this camera in world space
    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(&self.view_projection())
    }

    /// Snapshot the camera for one visibility traversal
    pub fn view_state(&self, screen_height: f32) -> ViewState {
        ViewState {
            position: self.position,
            fov_y: self.fov_y,
            screen_height,
            frustum: self.frustum(),
        }
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::new(0.0, 0.0, 10.0), 60.0, 16.0 / 9.0)
    }
}

/// Everything a traversal needs to know about the viewer.
///
/// Captured once per traversal so the loader thread never observes a
/// half-updated camera.
#[derive(Clone, Copy, Debug)]
pub struct ViewState {
    /// Camera position in world space
    pub position: Vec3,
    /// Vertical field of view in radians
    pub fov_y: f32,
    /// Viewport height in pixels
    pub screen_height: f32,
    /// World-space view frustum
    pub frustum: Frustum,
}

impl ViewState {
    /// Screen-space size in pixels of a sphere of `radius` at `distance`.
    pub fn projected_size(&self, radius: f32, distance: f32) -> f32 {
        let distance = distance.max(MIN_VIEW_DISTANCE);
        let slope = (self.fov_y * 0.5).tan();
        (self.screen_height * 0.5) * radius / (slope * distance)
    }
}
