//! Math utilities and helpers.

use glam::{Mat4, Quat, Vec3};

/// Compose an instance's world transform.
///
/// The composition is `rotation * translation * scale`: the mesh is scaled
/// in model space, moved to `position`, then the result is rotated about the
/// world origin.
#[inline]
pub fn compose_transform(position: Vec3, size: Vec3, rotation: Quat) -> Mat4 {
    Mat4::from_quat(rotation) * Mat4::from_translation(position) * Mat4::from_scale(size)
}

/// Round `value` up to the next multiple of `alignment`.
///
/// An alignment of zero leaves the value untouched.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn identity_inputs_give_identity() {
        let m = compose_transform(Vec3::ZERO, Vec3::ONE, Quat::IDENTITY);
        assert_eq!(m, Mat4::IDENTITY);
    }

    #[test]
    fn scale_applies_before_translation() {
        let m = compose_transform(Vec3::new(1.0, 2.0, 3.0), Vec3::splat(2.0), Quat::IDENTITY);
        let p = m.transform_point3(Vec3::ONE);
        assert_relative_eq!(p.x, 3.0);
        assert_relative_eq!(p.y, 4.0);
        assert_relative_eq!(p.z, 5.0);
    }

    #[test]
    fn rotation_applies_after_translation() {
        let m = compose_transform(Vec3::X, Vec3::ONE, Quat::from_rotation_z(FRAC_PI_2));
        let p = m.transform_point3(Vec3::ZERO);
        assert_relative_eq!(p.x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(p.y, 1.0, epsilon = 1e-6);
        assert_relative_eq!(p.z, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(17, 0), 17);
    }
}
