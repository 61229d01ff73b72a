//! Math types for Irisonic

pub use glam::{Mat4, Quat, Vec3, Vec4};

/// Frames rendered per mixer invocation, at most.
pub const BUFFER_SIZE: usize = 1024;

/// Fixed-point playback position fraction bits (16.16 stepping).
pub const FRACTION_BITS: u32 = 16;
pub const FRACTION_ONE: u32 = 1 << FRACTION_BITS;
pub const FRACTION_MASK: u32 = FRACTION_ONE - 1;

/// Largest pitch multiplier a voice can step at.
pub const MAX_PITCH: u32 = 255;

/// Ceiling for any single mixing gain after parameter calculation.
pub const GAIN_MIX_MAX: f32 = 16.0;

pub const SPEED_OF_SOUND_METERS_PER_SEC: f32 = 343.3;

/// Per-meter high-frequency gain of air at the reference absorption factor.
pub const AIR_ABSORB_GAIN_HF: f32 = 0.994_26;

/// -60 dB, the level a reverb tail is considered decayed at.
pub const REVERB_DECAY_GAIN: f32 = 0.001;

#[inline]
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[inline]
pub fn db_to_gain(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

/// Build the world-to-listener transform from the listener placement. The
/// at/up pair is orthonormalized; right = normalize(at x up). Columns are
/// (right, up, -at) with the translation folded in, so transforming a world
/// position yields head-relative coordinates.
pub fn listener_matrix(position: Vec3, at: Vec3, up: Vec3) -> Mat4 {
    let n = at.normalize_or_zero();
    let v = up.normalize_or_zero();
    let u = n.cross(v).normalize_or_zero();

    let rotate = Mat4::from_cols(
        Vec4::new(u.x, v.x, -n.x, 0.0),
        Vec4::new(u.y, v.y, -n.y, 0.0),
        Vec4::new(u.z, v.z, -n.z, 0.0),
        Vec4::new(0.0, 0.0, 0.0, 1.0),
    );
    let p = rotate.transform_point3(position);
    let mut matrix = rotate;
    matrix.w_axis = Vec4::new(-p.x, -p.y, -p.z, 1.0);
    matrix
}

#[cfg(test)]
pub(crate) fn assert_close(a: f32, b: f32, eps: f32) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} (eps {eps}, diff {})",
        (a - b).abs()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_matrix_identity_at_origin() {
        let m = listener_matrix(Vec3::ZERO, -Vec3::Z, Vec3::Y);
        let p = m.transform_point3(Vec3::new(1.0, 2.0, -3.0));
        assert_close(p.x, 1.0, 1e-6);
        assert_close(p.y, 2.0, 1e-6);
        assert_close(p.z, -3.0, 1e-6);
    }

    #[test]
    fn listener_matrix_turns_world_into_head_space() {
        // Listener at +X origin offset, facing +X: a source further along
        // +X sits straight ahead (-Z in head space).
        let m = listener_matrix(Vec3::new(1.0, 0.0, 0.0), Vec3::X, Vec3::Y);
        let p = m.transform_point3(Vec3::new(3.0, 0.0, 0.0));
        assert_close(p.x, 0.0, 1e-6);
        assert_close(p.y, 0.0, 1e-6);
        assert_close(p.z, -2.0, 1e-6);
    }

    #[test]
    fn listener_matrix_orthonormalizes_skewed_up() {
        let m = listener_matrix(Vec3::ZERO, -Vec3::Z, Vec3::new(0.3, 1.0, 0.0).normalize());
        // A point straight ahead must stay ahead regardless of the skew.
        let p = m.transform_point3(Vec3::new(0.0, 0.0, -5.0));
        assert_close(p.z, -5.0, 1e-5);
    }
}
