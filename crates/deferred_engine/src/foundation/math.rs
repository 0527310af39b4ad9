//! Math utilities and types
//!
//! Provides the nalgebra aliases used for camera, light and per-object data,
//! plus the alignment arithmetic used when packing GPU buffers.

pub use nalgebra::{Matrix3, Matrix4, Vector2, Vector3, Vector4};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 3x3 matrix type
pub type Mat3 = Matrix3<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// Size in bytes of a column-major 4x4 float matrix as the GPU sees it
pub const MAT4_SIZE: usize = std::mem::size_of::<[[f32; 4]; 4]>();

/// Round `size` up to the next multiple of `alignment`.
///
/// An alignment of zero leaves the size untouched.
pub const fn round_up(size: usize, alignment: usize) -> usize {
    if alignment == 0 {
        size
    } else {
        size.div_ceil(alignment) * alignment
    }
}

/// Normalize a vector, mapping degenerate (near zero) input to zero instead of NaN
pub fn normalize_or_zero(v: &Vec3) -> Vec3 {
    let length = v.norm();
    if length > f32::EPSILON {
        v / length
    } else {
        Vec3::zeros()
    }
}

/// Column-major array form of a matrix, matching GLSL `mat4` memory layout
pub fn mat4_to_cols(m: &Mat4) -> [[f32; 4]; 4] {
    (*m).into()
}

/// Extension trait for Mat4 with additional convenience methods
pub trait Mat4Ext {
    /// Create a perspective projection matrix with Vulkan depth range [0, 1]
    fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4;

    /// Create a right-handed look-at view matrix
    fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4;
}

impl Mat4Ext for Mat4 {
    fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
        let tan_half_fovy = (fov_y * 0.5).tan();

        let mut result = Mat4::zeros();
        result[(0, 0)] = 1.0 / (aspect * tan_half_fovy);
        result[(1, 1)] = 1.0 / tan_half_fovy;
        result[(2, 2)] = far / (far - near);
        result[(2, 3)] = -(near * far) / (far - near);
        result[(3, 2)] = 1.0;
        result
    }

    fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4 {
        let forward = (target - eye).normalize();
        let right = forward.cross(&up).normalize();
        let camera_up = right.cross(&forward);

        let translation = Mat4::new(
            1.0, 0.0, 0.0, -eye.x,
            0.0, 1.0, 0.0, -eye.y,
            0.0, 0.0, 1.0, -eye.z,
            0.0, 0.0, 0.0, 1.0,
        );

        let rotation = Mat4::new(
            right.x, right.y, right.z, 0.0,
            camera_up.x, camera_up.y, camera_up.z, 0.0,
            -forward.x, -forward.y, -forward.z, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );

        rotation * translation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(64, 256), 256);
        assert_eq!(round_up(64, 64), 64);
        assert_eq!(round_up(64, 48), 96);
        assert_eq!(round_up(65, 16), 80);
        assert_eq!(round_up(64, 0), 64);
    }

    #[test]
    fn test_normalize_or_zero() {
        let n = normalize_or_zero(&Vec3::new(0.0, 3.0, 4.0));
        assert_relative_eq!(n.norm(), 1.0, epsilon = 1e-6);
        assert_relative_eq!(n.z, 0.8, epsilon = 1e-6);
        assert_eq!(normalize_or_zero(&Vec3::zeros()), Vec3::zeros());
    }

    #[test]
    fn test_mat4_columns_are_column_major() {
        let m = Mat4::new_translation(&Vec3::new(1.0, 2.0, 3.0));
        let cols = mat4_to_cols(&m);
        assert_eq!(cols[3], [1.0, 2.0, 3.0, 1.0]);
        assert_eq!(MAT4_SIZE, 64);
    }

    #[test]
    fn test_look_at_moves_eye_to_origin() {
        let eye = Vec3::new(0.0, 0.0, 5.0);
        let view = Mat4::look_at(eye, Vec3::zeros(), Vec3::y());
        let p = view.transform_point(&nalgebra::Point3::from(eye));
        assert_relative_eq!(p.coords.norm(), 0.0, epsilon = 1e-5);
    }
}
