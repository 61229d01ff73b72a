//! Ambisonic coefficient tables and direction encoding.
//!
//! Channels are handled in ACN order with N3D normalization internally.
//! The tables here convert from FuMa/SN3D content and project encoded
//! directions onto mixing buses.

use glam::Vec3;

pub const MAX_AMBI_ORDER: usize = 3;
pub const MAX_AMBI_COEFFS: usize = (MAX_AMBI_ORDER + 1) * (MAX_AMBI_ORDER + 1);
pub const MAX_AMBI2D_COEFFS: usize = MAX_AMBI_ORDER * 2 + 1;

/// Conversion scales into N3D, indexed by ACN.
pub mod scale {
    use super::MAX_AMBI_COEFFS;

    pub const FROM_N3D: [f32; MAX_AMBI_COEFFS] = [1.0; MAX_AMBI_COEFFS];

    /// N3D = SN3D * sqrt(2*l + 1).
    pub const FROM_SN3D: [f32; MAX_AMBI_COEFFS] = [
        1.000000000, // ACN  0, order 0
        1.732050808, // ACN  1, order 1
        1.732050808, // ACN  2, order 1
        1.732050808, // ACN  3, order 1
        2.236067977, // ACN  4, order 2
        2.236067977, // ACN  5, order 2
        2.236067977, // ACN  6, order 2
        2.236067977, // ACN  7, order 2
        2.236067977, // ACN  8, order 2
        2.645751311, // ACN  9, order 3
        2.645751311, // ACN 10, order 3
        2.645751311, // ACN 11, order 3
        2.645751311, // ACN 12, order 3
        2.645751311, // ACN 13, order 3
        2.645751311, // ACN 14, order 3
        2.645751311, // ACN 15, order 3
    ];

    pub const FROM_FUMA: [f32; MAX_AMBI_COEFFS] = [
        1.414213562, // ACN  0 (W), sqrt(2)
        1.732050808, // ACN  1 (Y), sqrt(3)
        1.732050808, // ACN  2 (Z), sqrt(3)
        1.732050808, // ACN  3 (X), sqrt(3)
        1.936491673, // ACN  4 (V), sqrt(15)/2
        1.936491673, // ACN  5 (T), sqrt(15)/2
        2.236067977, // ACN  6 (R), sqrt(5)
        1.936491673, // ACN  7 (S), sqrt(15)/2
        1.936491673, // ACN  8 (U), sqrt(15)/2
        2.091650066, // ACN  9 (Q), sqrt(35/8)
        1.972026594, // ACN 10 (O), sqrt(35)/3
        2.231093404, // ACN 11 (M), sqrt(224/45)
        2.645751311, // ACN 12 (K), sqrt(7)
        2.231093404, // ACN 13 (L), sqrt(224/45)
        1.972026594, // ACN 14 (N), sqrt(35)/3
        2.091650066, // ACN 15 (P), sqrt(35/8)
    ];
}

/// ACN index maps for foreign channel orderings.
pub mod index {
    use super::{MAX_AMBI2D_COEFFS, MAX_AMBI_COEFFS};

    /// FuMa channel order (WXYZ RSTUV KLMNOPQ) to ACN.
    pub const FROM_FUMA: [usize; MAX_AMBI_COEFFS] =
        [0, 3, 1, 2, 6, 7, 5, 8, 4, 12, 13, 11, 14, 10, 15, 9];

    /// ACN to ACN, for layouts already in canonical order.
    pub const FROM_ACN: [usize; MAX_AMBI_COEFFS] =
        [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

    /// The ACNs with horizontal-only (m = +-l) components, for 2D content.
    pub const FROM_2D: [usize; MAX_AMBI2D_COEFFS] = [0, 1, 3, 4, 8, 9, 15];
}

pub const fn channels_for_order(order: usize) -> usize {
    (order + 1) * (order + 1)
}

/// The ambisonic order an ACN belongs to.
pub const fn acn_order(acn: usize) -> usize {
    if acn >= 9 {
        3
    } else if acn >= 4 {
        2
    } else if acn >= 1 {
        1
    } else {
        0
    }
}

/// One input channel of an ambisonic mixing bus: which ACN it carries and
/// the scale to apply when projecting coefficients onto it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BFChannelConfig {
    pub scale: f32,
    pub index: usize,
}

impl Default for BFChannelConfig {
    fn default() -> Self {
        Self {
            scale: 0.0,
            index: 0,
        }
    }
}

impl BFChannelConfig {
    pub fn new(scale: f32, index: usize) -> Self {
        Self { scale, index }
    }
}

/// Encode a direction (and optional angular spread) as N3D spherical
/// harmonic coefficients up to third order.
///
/// The direction is in listener space: +x right, +y up, -z forward. A
/// spread of `2*pi` turns the source into a uniform sphere around the
/// listener; intermediate values blur the higher orders progressively.
pub fn calc_ambi_coeffs(dir: Vec3, spread: f32) -> [f32; MAX_AMBI_COEFFS] {
    // Convert to the (y, z, x) component order the harmonics are written in.
    let (x, y, z) = (-dir.z, -dir.x, dir.y);

    let mut coeffs = [0.0f32; MAX_AMBI_COEFFS];
    // Zeroth-order
    coeffs[0] = 1.0; // ACN 0 = 1
    // First-order
    coeffs[1] = 1.732050808 * y; // ACN 1 = sqrt(3) * Y
    coeffs[2] = 1.732050808 * z; // ACN 2 = sqrt(3) * Z
    coeffs[3] = 1.732050808 * x; // ACN 3 = sqrt(3) * X
    // Second-order
    coeffs[4] = 3.872983346 * x * y; // ACN 4 = sqrt(15) * X * Y
    coeffs[5] = 3.872983346 * y * z; // ACN 5 = sqrt(15) * Y * Z
    coeffs[6] = 1.118033989 * (z * z * 3.0 - 1.0); // ACN 6 = sqrt(5)/2 * (3*Z*Z - 1)
    coeffs[7] = 3.872983346 * x * z; // ACN 7 = sqrt(15) * X * Z
    coeffs[8] = 1.936491673 * (x * x - y * y); // ACN 8 = sqrt(15)/2 * (X*X - Y*Y)
    // Third-order
    coeffs[9] = 2.091650066 * y * (x * x * 3.0 - y * y); // ACN  9 = sqrt(35/8) * Y * (3*X*X - Y*Y)
    coeffs[10] = 10.246950766 * z * x * y; // ACN 10 = sqrt(105) * Z * X * Y
    coeffs[11] = 1.620185175 * y * (z * z * 5.0 - 1.0); // ACN 11 = sqrt(21/8) * Y * (5*Z*Z - 1)
    coeffs[12] = 1.322875656 * z * (z * z * 5.0 - 3.0); // ACN 12 = sqrt(7)/2 * Z * (5*Z*Z - 3)
    coeffs[13] = 1.620185175 * x * (z * z * 5.0 - 1.0); // ACN 13 = sqrt(21/8) * X * (5*Z*Z - 1)
    coeffs[14] = 5.123475383 * z * (x * x - y * y); // ACN 14 = sqrt(105)/2 * Z * (X*X - Y*Y)
    coeffs[15] = 2.091650066 * x * (x * x - y * y * 3.0); // ACN 15 = sqrt(35/8) * X * (X*X - 3*Y*Y)

    if spread > 0.0 {
        // Model the spread as a spherical cap subtending it, blurring each
        // order by the cap's zonal harmonic response. Gains are normalized
        // so loudness is independent of the spread, with up to +3dB kept
        // for a full-sphere source.
        let ca = (spread * 0.5).cos();
        let scale = (1.0 + spread / std::f32::consts::TAU).sqrt();

        let zh0_norm = scale;
        let zh1_norm = 0.5 * (ca + 1.0) * scale;
        let zh2_norm = 0.5 * (ca + 1.0) * ca * scale;
        let zh3_norm = 0.125 * (ca + 1.0) * (5.0 * ca * ca - 1.0) * scale;

        coeffs[0] *= zh0_norm;
        for c in &mut coeffs[1..4] {
            *c *= zh1_norm;
        }
        for c in &mut coeffs[4..9] {
            *c *= zh2_norm;
        }
        for c in &mut coeffs[9..16] {
            *c *= zh3_norm;
        }
    }

    coeffs
}

/// Encode an (azimuth, elevation) pair, angles in radians with azimuth
/// clockwise from front.
pub fn calc_angle_coeffs(azimuth: f32, elevation: f32, spread: f32) -> [f32; MAX_AMBI_COEFFS] {
    let dir = Vec3::new(
        azimuth.sin() * elevation.cos(),
        elevation.sin(),
        -(azimuth.cos() * elevation.cos()),
    );
    calc_ambi_coeffs(dir, spread)
}

/// Widen a frontal azimuth by `scale`, saturating at +-pi/2. Used by the
/// stereo-pair render mode so hard left/right actually reach the speakers.
pub fn scale_azimuth_front(azimuth: f32, scale: f32) -> f32 {
    const HALF_PI: f32 = std::f32::consts::FRAC_PI_2;
    if azimuth.abs() > HALF_PI {
        azimuth
    } else {
        (azimuth * scale).clamp(-HALF_PI, HALF_PI)
    }
}

/// Project direction coefficients onto a bus channel map, producing one
/// gain per bus channel. Channels past `gains.len()` are ignored.
pub fn compute_pan_gains(
    chan_map: &[BFChannelConfig],
    coeffs: &[f32; MAX_AMBI_COEFFS],
    ingain: f32,
    gains: &mut [f32],
) {
    for (gain, chan) in gains.iter_mut().zip(chan_map.iter()) {
        *gain = chan.scale * coeffs[chan.index] * ingain;
    }
    for gain in gains.iter_mut().skip(chan_map.len()) {
        *gain = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::assert_close;

    fn order_energy(coeffs: &[f32; MAX_AMBI_COEFFS], order: usize) -> f32 {
        (0..MAX_AMBI_COEFFS)
            .filter(|&acn| acn_order(acn) == order)
            .map(|acn| coeffs[acn] * coeffs[acn])
            .sum()
    }

    #[test]
    fn harmonic_energy_per_order_is_constant() {
        // For any unit direction, an N3D-normalized order contributes
        // 2*l + 1 total energy.
        let dirs = [
            Vec3::new(0.0, 0.0, -1.0),
            Vec3::new(1.0, 0.0, 0.0).normalize(),
            Vec3::new(0.3, -0.8, 0.52).normalize(),
            Vec3::new(-0.57735, 0.57735, 0.57735),
        ];
        for dir in dirs {
            let coeffs = calc_ambi_coeffs(dir, 0.0);
            for order in 0..=MAX_AMBI_ORDER {
                let want = (2 * order + 1) as f32;
                assert_close(order_energy(&coeffs, order), want, 1e-4);
            }
        }
    }

    #[test]
    fn front_direction_has_no_lateral_terms() {
        let coeffs = calc_angle_coeffs(0.0, 0.0, 0.0);
        assert_close(coeffs[0], 1.0, 1e-6);
        assert_close(coeffs[1], 0.0, 1e-6); // Y
        assert_close(coeffs[2], 0.0, 1e-6); // Z
        assert_close(coeffs[3], 1.732050808, 1e-5); // X
    }

    #[test]
    fn right_azimuth_points_down_positive_y_harmonic() {
        // Azimuth +90deg clockwise = hard right = -Y harmonic component.
        let coeffs = calc_angle_coeffs(std::f32::consts::FRAC_PI_2, 0.0, 0.0);
        assert_close(coeffs[1], -1.732050808, 1e-5);
        assert_close(coeffs[3], 0.0, 1e-5);
    }

    #[test]
    fn full_spread_washes_out_direction() {
        let coeffs = calc_ambi_coeffs(Vec3::new(0.0, 0.0, -1.0), std::f32::consts::TAU);
        // Only W survives a full-sphere spread, boosted by +3dB.
        assert_close(coeffs[0], 2.0f32.sqrt(), 1e-5);
        for &c in &coeffs[1..] {
            assert_close(c, 0.0, 1e-5);
        }
    }

    #[test]
    fn pan_gains_respect_channel_scales() {
        let map = [
            BFChannelConfig::new(1.0, 0),
            BFChannelConfig::new(0.5, 3),
        ];
        let coeffs = calc_angle_coeffs(0.0, 0.0, 0.0);
        let mut gains = [0.0f32; 4];
        compute_pan_gains(&map, &coeffs, 2.0, &mut gains);
        assert_close(gains[0], 2.0, 1e-6);
        assert_close(gains[1], 1.732050808, 1e-5);
        assert_close(gains[2], 0.0, 1e-6);
        assert_close(gains[3], 0.0, 1e-6);
    }

    #[test]
    fn azimuth_widening_saturates() {
        assert_close(
            scale_azimuth_front(std::f32::consts::FRAC_PI_3, 1.5),
            std::f32::consts::FRAC_PI_2,
            1e-6,
        );
        let behind = 2.5f32;
        assert_close(scale_azimuth_front(behind, 1.5), behind, 1e-6);
    }
}
