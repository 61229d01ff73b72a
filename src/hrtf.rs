//! HRTF storage, lookup, and binaural mixing.
//!
//! HRIR data files are out of scope; a store is either handed in as raw
//! tables or synthesized from a spherical-head model. Lookup blends the
//! four grid responses around a direction, with the source spread fading
//! the response toward the diffuse average.

use glam::Vec3;

use crate::ambi::MAX_AMBI_COEFFS;
use crate::error::{IrisonicError, Result};
use crate::math::SPEED_OF_SOUND_METERS_PER_SEC;

/// Filter taps per ear.
pub const HRIR_LENGTH: usize = 32;
/// Input history kept for delayed convolution; power of two.
pub const HRTF_HISTORY_LENGTH: usize = 128;
const HRTF_HISTORY_MASK: usize = HRTF_HISTORY_LENGTH - 1;
/// Upper bound on stored per-ear delays, in samples.
pub const MAX_HRIR_DELAY: u32 = 64;

pub type HrirCoeffs = [[f32; 2]; HRIR_LENGTH];

/// A set of head-related impulse responses on an elevation/azimuth grid.
///
/// Elevations span -90 to +90 degrees in `elev_count` uniform steps, each
/// ring holding `azi_count` responses with azimuth clockwise from front.
pub struct HrtfStore {
    sample_rate: u32,
    ir_size: usize,
    /// Measurement distance in meters, used as the near-field reference.
    distance: f32,
    elev_count: usize,
    azi_count: usize,
    irs: Vec<HrirCoeffs>,
    delays: Vec<[u32; 2]>,
    diffuse: HrirCoeffs,
    diffuse_delay: f32,
}

impl HrtfStore {
    pub fn from_raw(
        sample_rate: u32,
        ir_size: usize,
        distance: f32,
        elev_count: usize,
        azi_count: usize,
        irs: Vec<HrirCoeffs>,
        delays: Vec<[u32; 2]>,
    ) -> Result<Self> {
        if ir_size == 0 || ir_size > HRIR_LENGTH {
            return Err(IrisonicError::InvalidParameter(format!(
                "HRIR size {ir_size} outside 1..={HRIR_LENGTH}"
            )));
        }
        if elev_count < 2 || azi_count < 1 || irs.len() != elev_count * azi_count {
            return Err(IrisonicError::InvalidParameter(
                "HRTF grid dimensions do not match the response count".into(),
            ));
        }
        if delays.len() != irs.len() {
            return Err(IrisonicError::InvalidParameter(
                "HRTF delay count does not match the response count".into(),
            ));
        }
        if let Some(bad) = delays.iter().flatten().find(|&&d| d > MAX_HRIR_DELAY) {
            return Err(IrisonicError::InvalidParameter(format!(
                "HRIR delay {bad} exceeds {MAX_HRIR_DELAY}"
            )));
        }

        let mut diffuse = [[0.0f32; 2]; HRIR_LENGTH];
        let mut diffuse_delay = 0.0f64;
        for (ir, delay) in irs.iter().zip(delays.iter()) {
            for (acc, tap) in diffuse.iter_mut().zip(ir.iter()) {
                acc[0] += tap[0];
                acc[1] += tap[1];
            }
            diffuse_delay += (delay[0] + delay[1]) as f64 * 0.5;
        }
        let scale = 1.0 / irs.len() as f32;
        for tap in &mut diffuse {
            tap[0] *= scale;
            tap[1] *= scale;
        }
        diffuse_delay /= irs.len() as f64;

        Ok(Self {
            sample_rate,
            ir_size,
            distance,
            elev_count,
            azi_count,
            irs,
            delays,
            diffuse,
            diffuse_delay: diffuse_delay as f32,
        })
    }

    /// Build a store from a rigid-sphere head model: interaural time
    /// difference from the Woodworth formula and a first-order head-shadow
    /// low-pass on the far ear. Good enough to exercise the binaural path
    /// without measured data.
    pub fn synthetic(sample_rate: u32) -> Self {
        const ELEV_COUNT: usize = 19;
        const AZI_COUNT: usize = 24;
        const HEAD_RADIUS: f32 = 0.0875;

        let fs = sample_rate as f32;
        let itd_scale = HEAD_RADIUS / SPEED_OF_SOUND_METERS_PER_SEC * fs;
        let base_delay = 2.0f32;

        let mut irs = Vec::with_capacity(ELEV_COUNT * AZI_COUNT);
        let mut delays = Vec::with_capacity(ELEV_COUNT * AZI_COUNT);
        for ei in 0..ELEV_COUNT {
            let elev = -std::f32::consts::FRAC_PI_2
                + std::f32::consts::PI * ei as f32 / (ELEV_COUNT - 1) as f32;
            for ai in 0..AZI_COUNT {
                let azi = std::f32::consts::TAU * ai as f32 / AZI_COUNT as f32;
                // Lateral offset: positive toward the right ear.
                let lateral = (azi.sin() * elev.cos()).clamp(-1.0, 1.0);
                let angle = lateral.asin();

                // Woodworth: the near ear leads, the far ear trails by
                // (a/c)*(angle + sin(angle)).
                let itd = itd_scale * (angle.abs() + angle.abs().sin());
                let (dl, dr) = if lateral >= 0.0 {
                    (base_delay + itd, base_delay)
                } else {
                    (base_delay, base_delay + itd)
                };

                // Head shadow: the far ear's response loses high end as the
                // source moves behind the head.
                let shadow = |same_side: bool| -> (f32, f32) {
                    let occlusion = if same_side { 0.0 } else { lateral.abs() };
                    let gain = 1.0 - 0.4 * occlusion;
                    let pole = 0.6 * occlusion;
                    (gain, pole)
                };
                let (gl, pl) = shadow(lateral <= 0.0);
                let (gr, pr) = shadow(lateral >= 0.0);

                let mut ir = [[0.0f32; 2]; HRIR_LENGTH];
                let mut accum_l = gl * (1.0 - pl);
                let mut accum_r = gr * (1.0 - pr);
                for tap in ir.iter_mut().take(16) {
                    tap[0] = accum_l;
                    tap[1] = accum_r;
                    accum_l *= pl;
                    accum_r *= pr;
                    if pl == 0.0 {
                        accum_l = 0.0;
                    }
                    if pr == 0.0 {
                        accum_r = 0.0;
                    }
                }

                irs.push(ir);
                delays.push([dl.round() as u32, dr.round() as u32]);
            }
        }

        Self::from_raw(sample_rate, 16, 1.0, ELEV_COUNT, AZI_COUNT, irs, delays)
            .expect("synthetic grid is well formed")
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn ir_size(&self) -> usize {
        self.ir_size
    }

    pub fn distance(&self) -> f32 {
        self.distance
    }

    fn index(&self, ei: usize, ai: usize) -> usize {
        ei * self.azi_count + ai % self.azi_count
    }

    /// Fetch the blended coefficients and per-ear delays for a direction.
    /// Angles in radians, azimuth clockwise from front; `spread` fades the
    /// response toward the diffuse average.
    pub fn get_coeffs(
        &self,
        elevation: f32,
        azimuth: f32,
        spread: f32,
        coeffs: &mut HrirCoeffs,
        delays: &mut [u32; 2],
    ) {
        let dirfact = (1.0 - spread / std::f32::consts::TAU).clamp(0.0, 1.0);

        // Grid coordinates with bilinear weights.
        let ef = (elevation.clamp(-std::f32::consts::FRAC_PI_2, std::f32::consts::FRAC_PI_2)
            + std::f32::consts::FRAC_PI_2)
            / std::f32::consts::PI
            * (self.elev_count - 1) as f32;
        let e0 = (ef as usize).min(self.elev_count - 2);
        let emu = ef - e0 as f32;

        let af = azimuth.rem_euclid(std::f32::consts::TAU) / std::f32::consts::TAU
            * self.azi_count as f32;
        let a0 = (af as usize) % self.azi_count;
        let amu = af - af.floor();

        let corners = [
            (self.index(e0, a0), (1.0 - emu) * (1.0 - amu)),
            (self.index(e0, a0 + 1), (1.0 - emu) * amu),
            (self.index(e0 + 1, a0), emu * (1.0 - amu)),
            (self.index(e0 + 1, a0 + 1), emu * amu),
        ];

        let mut blend_delay = [0.0f32; 2];
        let mut blended = [[0.0f32; 2]; HRIR_LENGTH];
        for &(idx, weight) in &corners {
            let ir = &self.irs[idx];
            let delay = &self.delays[idx];
            for (acc, tap) in blended.iter_mut().zip(ir.iter()) {
                acc[0] += tap[0] * weight;
                acc[1] += tap[1] * weight;
            }
            blend_delay[0] += delay[0] as f32 * weight;
            blend_delay[1] += delay[1] as f32 * weight;
        }

        for (out, (dir, diff)) in coeffs
            .iter_mut()
            .zip(blended.iter().zip(self.diffuse.iter()))
        {
            out[0] = diff[0] + (dir[0] - diff[0]) * dirfact;
            out[1] = diff[1] + (dir[1] - diff[1]) * dirfact;
        }
        for (out, &dir) in delays.iter_mut().zip(blend_delay.iter()) {
            let blended = self.diffuse_delay + (dir - self.diffuse_delay) * dirfact;
            *out = (blended.round() as u32).min(MAX_HRIR_DELAY);
        }
    }
}

/// Per-channel direct HRTF rendering state for the device post stage: one
/// input history ring plus accumulated coefficients per dry-bus channel.
pub struct DirectHrtfState {
    pub ir_size: usize,
    offset: usize,
    channels: Vec<DirectHrtfChannel>,
}

struct DirectHrtfChannel {
    history: [f32; HRTF_HISTORY_LENGTH],
    coeffs: HrirCoeffs,
    delays: [u32; 2],
}

impl DirectHrtfState {
    pub fn new(num_channels: usize) -> Self {
        Self {
            ir_size: HRIR_LENGTH,
            offset: 0,
            channels: (0..num_channels)
                .map(|_| DirectHrtfChannel {
                    history: [0.0; HRTF_HISTORY_LENGTH],
                    coeffs: [[0.0; 2]; HRIR_LENGTH],
                    delays: [0; 2],
                })
                .collect(),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }
}

/// Convolve the dry ambisonic bus against the per-channel responses,
/// accumulating binaural output onto `left`/`right`.
pub fn mix_direct_hrtf(
    left: &mut [f32],
    right: &mut [f32],
    dry: &[Vec<f32>],
    state: &mut DirectHrtfState,
    frames: usize,
) {
    let ir_size = state.ir_size;
    let base_offset = state.offset;
    for (chan, input) in state.channels.iter_mut().zip(dry.iter()) {
        let mut offset = base_offset;
        for i in 0..frames {
            chan.history[offset & HRTF_HISTORY_MASK] = input[i];
            let mut acc = [0.0f32; 2];
            for (ear, acc_value) in acc.iter_mut().enumerate() {
                let read_base = offset
                    .wrapping_sub(chan.delays[ear] as usize)
                    .wrapping_add(HRTF_HISTORY_LENGTH * 2);
                for (tap, coeff) in chan.coeffs.iter().take(ir_size).enumerate() {
                    *acc_value +=
                        coeff[ear] * chan.history[read_base.wrapping_sub(tap) & HRTF_HISTORY_MASK];
                }
            }
            left[i] += acc[0];
            right[i] += acc[1];
            offset = offset.wrapping_add(1);
        }
    }
    state.offset = base_offset.wrapping_add(frames) & HRTF_HISTORY_MASK;
}

/// The virtual speaker layout used to render an ambisonic mix through the
/// HRTF: twenty directions with a matching third-order decode matrix.
/// Elevation/azimuth pairs are in degrees, azimuth clockwise.
pub const AMBI_POINTS: [[f32; 2]; 20] = [
    [35.264390, -45.000000],
    [35.264390, 45.000000],
    [35.264390, 135.000000],
    [35.264390, -135.000000],
    [-35.264390, -45.000000],
    [-35.264390, 45.000000],
    [-35.264390, 135.000000],
    [-35.264390, -135.000000],
    [0.000000, -20.905157],
    [0.000000, 20.905157],
    [0.000000, 159.094843],
    [0.000000, -159.094843],
    [20.905157, -90.000000],
    [-20.905157, -90.000000],
    [-20.905157, 90.000000],
    [20.905157, 90.000000],
    [69.094843, 0.000000],
    [-69.094843, 0.000000],
    [-69.094843, 180.000000],
    [69.094843, 180.000000],
];

#[rustfmt::skip]
pub const AMBI_MATRIX: [[f32; MAX_AMBI_COEFFS]; 20] = [
    [ 5.000_000_0e-2,  5.000_000_0e-2,  5.000_000_0e-2,  5.000_000_0e-2,  6.454_972_2e-2,  6.454_972_2e-2,  0.0,  6.454_972_2e-2,  0.0,  1.482_646_4e-2,  6.338_656_9e-2,  1.011_266_8e-1, -7.364_853_8e-2, -1.092_600_7e-2,  7.086_833_9e-2, -1.016_221_0e-1],
    [ 5.000_000_0e-2, -5.000_000_0e-2,  5.000_000_0e-2,  5.000_000_0e-2, -6.454_972_2e-2, -6.454_972_2e-2,  0.0,  6.454_972_2e-2,  0.0, -1.482_646_4e-2, -6.338_656_9e-2, -1.011_266_8e-1, -7.364_853_8e-2, -1.092_600_7e-2,  7.086_833_9e-2, -1.016_221_0e-1],
    [ 5.000_000_0e-2, -5.000_000_0e-2,  5.000_000_0e-2, -5.000_000_0e-2,  6.454_972_2e-2, -6.454_972_2e-2,  0.0, -6.454_972_2e-2,  0.0, -1.482_646_4e-2,  6.338_656_9e-2, -1.011_266_8e-1, -7.364_853_8e-2,  1.092_600_7e-2,  7.086_833_9e-2,  1.016_221_0e-1],
    [ 5.000_000_0e-2,  5.000_000_0e-2,  5.000_000_0e-2, -5.000_000_0e-2, -6.454_972_2e-2,  6.454_972_2e-2,  0.0, -6.454_972_2e-2,  0.0,  1.482_646_4e-2, -6.338_656_9e-2,  1.011_266_8e-1, -7.364_853_8e-2,  1.092_600_7e-2,  7.086_833_9e-2,  1.016_221_0e-1],
    [ 5.000_000_0e-2,  5.000_000_0e-2, -5.000_000_0e-2,  5.000_000_0e-2,  6.454_972_2e-2, -6.454_972_2e-2,  0.0, -6.454_972_2e-2,  0.0,  1.482_646_4e-2, -6.338_656_9e-2,  1.011_266_8e-1,  7.364_853_8e-2, -1.092_600_7e-2, -7.086_833_9e-2, -1.016_221_0e-1],
    [ 5.000_000_0e-2, -5.000_000_0e-2, -5.000_000_0e-2,  5.000_000_0e-2, -6.454_972_2e-2,  6.454_972_2e-2,  0.0, -6.454_972_2e-2,  0.0, -1.482_646_4e-2,  6.338_656_9e-2, -1.011_266_8e-1,  7.364_853_8e-2, -1.092_600_7e-2, -7.086_833_9e-2, -1.016_221_0e-1],
    [ 5.000_000_0e-2, -5.000_000_0e-2, -5.000_000_0e-2, -5.000_000_0e-2,  6.454_972_2e-2,  6.454_972_2e-2,  0.0,  6.454_972_2e-2,  0.0, -1.482_646_4e-2, -6.338_656_9e-2, -1.011_266_8e-1,  7.364_853_8e-2,  1.092_600_7e-2, -7.086_833_9e-2,  1.016_221_0e-1],
    [ 5.000_000_0e-2,  5.000_000_0e-2, -5.000_000_0e-2, -5.000_000_0e-2, -6.454_972_2e-2, -6.454_972_2e-2,  0.0,  6.454_972_2e-2,  0.0,  1.482_646_4e-2,  6.338_656_9e-2,  1.011_266_8e-1,  7.364_853_8e-2,  1.092_600_7e-2, -7.086_833_9e-2,  1.016_221_0e-1],
    [ 5.000_000_0e-2,  3.090_169_9e-2,  0.0,  8.090_169_9e-2,  6.454_972_2e-2,  0.0, -5.590_169_9e-2,  0.0,  7.216_878_4e-2,  7.763_237_5e-2,  0.0, -1.497_759_3e-1,  0.0, -2.950_836_6e-2,  0.0,  7.763_237_5e-2],
    [ 5.000_000_0e-2, -3.090_169_9e-2,  0.0,  8.090_169_9e-2, -6.454_972_2e-2,  0.0, -5.590_169_9e-2,  0.0,  7.216_878_4e-2, -7.763_237_5e-2,  0.0,  1.497_759_3e-1,  0.0, -2.950_836_6e-2,  0.0,  7.763_237_5e-2],
    [ 5.000_000_0e-2, -3.090_169_9e-2,  0.0, -8.090_169_9e-2,  6.454_972_2e-2,  0.0, -5.590_169_9e-2,  0.0,  7.216_878_4e-2, -7.763_237_5e-2,  0.0,  1.497_759_3e-1,  0.0,  2.950_836_6e-2,  0.0, -7.763_237_5e-2],
    [ 5.000_000_0e-2,  3.090_169_9e-2,  0.0, -8.090_169_9e-2, -6.454_972_2e-2,  0.0, -5.590_169_9e-2,  0.0,  7.216_878_4e-2,  7.763_237_5e-2,  0.0, -1.497_759_3e-1,  0.0,  2.950_836_6e-2,  0.0, -7.763_237_5e-2],
    [ 5.000_000_0e-2,  8.090_169_9e-2,  3.090_169_9e-2,  0.0,  0.0,  6.454_972_2e-2, -3.454_915_0e-2,  0.0, -8.449_668_4e-2, -4.797_944_7e-2,  0.0, -6.779_013_3e-2,  3.034_486_7e-2,  0.0, -1.659_481_9e-1,  0.0],
    [ 5.000_000_0e-2,  8.090_169_9e-2, -3.090_169_9e-2,  0.0,  0.0, -6.454_972_2e-2, -3.454_915_0e-2,  0.0, -8.449_668_4e-2, -4.797_944_7e-2,  0.0, -6.779_013_3e-2, -3.034_486_7e-2,  0.0,  1.659_481_9e-1,  0.0],
    [ 5.000_000_0e-2, -8.090_169_9e-2, -3.090_169_9e-2,  0.0,  0.0,  6.454_972_2e-2, -3.454_915_0e-2,  0.0, -8.449_668_4e-2,  4.797_944_7e-2,  0.0,  6.779_013_3e-2, -3.034_486_7e-2,  0.0,  1.659_481_9e-1,  0.0],
    [ 5.000_000_0e-2, -8.090_169_9e-2,  3.090_169_9e-2,  0.0,  0.0, -6.454_972_2e-2, -3.454_915_0e-2,  0.0, -8.449_668_4e-2,  4.797_944_7e-2,  0.0,  6.779_013_3e-2,  3.034_486_7e-2,  0.0, -1.659_481_9e-1,  0.0],
    [ 5.000_000_0e-2,  0.0,  8.090_169_9e-2,  3.090_169_9e-2,  0.0,  0.0,  9.045_085_0e-2,  6.454_972_2e-2,  1.232_790_0e-2,  0.0,  0.0,  0.0,  7.944_389_2e-2,  1.126_112_1e-1, -2.421_151_5e-2,  1.256_118_2e-1],
    [ 5.000_000_0e-2,  0.0, -8.090_169_9e-2,  3.090_169_9e-2,  0.0,  0.0,  9.045_085_0e-2, -6.454_972_2e-2,  1.232_790_0e-2,  0.0,  0.0,  0.0, -7.944_389_2e-2,  1.126_112_1e-1,  2.421_151_5e-2,  1.256_118_2e-1],
    [ 5.000_000_0e-2,  0.0, -8.090_169_9e-2, -3.090_169_9e-2,  0.0,  0.0,  9.045_085_0e-2,  6.454_972_2e-2,  1.232_790_0e-2,  0.0,  0.0,  0.0, -7.944_389_2e-2, -1.126_112_1e-1,  2.421_151_5e-2, -1.256_118_2e-1],
    [ 5.000_000_0e-2,  0.0,  8.090_169_9e-2, -3.090_169_9e-2,  0.0,  0.0,  9.045_085_0e-2, -6.454_972_2e-2,  1.232_790_0e-2,  0.0,  0.0,  0.0,  7.944_389_2e-2, -1.126_112_1e-1, -2.421_151_5e-2, -1.256_118_2e-1],
];

/// Per-order high-frequency correction when decoding first-order content
/// through the virtual array.
pub const AMBI_ORDER_HF_GAIN_FOA: [f32; 4] = [3.162_277_7, 1.825_741_9, 0.0, 0.0];
/// The same for a second-order bus feeding the array.
pub const AMBI_ORDER_HF_GAIN_HOA: [f32; 4] = [2.357_022_6, 1.825_741_9, 0.942_809_0, 0.0];

/// Populate a [`DirectHrtfState`] by rendering the virtual speaker array:
/// each dry-bus channel's response is the decode-matrix-weighted sum of the
/// speakers' HRIRs, aligned to the smallest delay in the set.
pub fn build_bformat_hrtf(
    hrtf: &HrtfStore,
    state: &mut DirectHrtfState,
    num_channels: usize,
    order_gains: &[f32; 4],
) {
    let mut min_delay = u32::MAX;
    let mut speaker_irs = Vec::with_capacity(AMBI_POINTS.len());
    for point in AMBI_POINTS.iter() {
        let elev = point[0].to_radians();
        let azi = point[1].to_radians();
        let mut coeffs = [[0.0f32; 2]; HRIR_LENGTH];
        let mut delays = [0u32; 2];
        hrtf.get_coeffs(elev, azi, 0.0, &mut coeffs, &mut delays);
        min_delay = min_delay.min(delays[0]).min(delays[1]);
        speaker_irs.push((coeffs, delays));
    }

    for (c, chan) in state.channels.iter_mut().take(num_channels).enumerate() {
        chan.coeffs = [[0.0; 2]; HRIR_LENGTH];
        chan.delays = [0; 2];
        let order = crate::ambi::acn_order(c);
        let gain = order_gains[order];
        for (k, (ir, delays)) in speaker_irs.iter().enumerate() {
            let weight = AMBI_MATRIX[k][c] * gain;
            for ear in 0..2 {
                let shift = (delays[ear] - min_delay) as usize;
                for t in 0..hrtf.ir_size().min(HRIR_LENGTH - shift) {
                    chan.coeffs[t + shift][ear] += ir[t][ear] * weight;
                }
            }
        }
    }
    state.ir_size = HRIR_LENGTH;
}

/// Decompose a listener-space direction into the elevation/azimuth pair
/// used for HRTF lookup.
pub fn dir_to_angles(dir: Vec3) -> (f32, f32) {
    let elevation = dir.y.clamp(-1.0, 1.0).asin();
    let azimuth = dir.x.atan2(-dir.z);
    (elevation, azimuth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::assert_close;

    #[test]
    fn synthetic_store_has_sane_shape() {
        let hrtf = HrtfStore::synthetic(44100);
        assert!(hrtf.ir_size() <= HRIR_LENGTH);
        assert!(hrtf.distance() > 0.0);
        assert_eq!(hrtf.sample_rate(), 44100);
    }

    #[test]
    fn front_direction_is_symmetric() {
        let hrtf = HrtfStore::synthetic(44100);
        let mut coeffs = [[0.0; 2]; HRIR_LENGTH];
        let mut delays = [0u32; 2];
        hrtf.get_coeffs(0.0, 0.0, 0.0, &mut coeffs, &mut delays);
        assert_eq!(delays[0], delays[1]);
        for tap in coeffs.iter() {
            assert_close(tap[0], tap[1], 1e-6);
        }
    }

    #[test]
    fn right_source_reaches_right_ear_first() {
        let hrtf = HrtfStore::synthetic(44100);
        let mut coeffs = [[0.0; 2]; HRIR_LENGTH];
        let mut delays = [0u32; 2];
        hrtf.get_coeffs(0.0, std::f32::consts::FRAC_PI_2, 0.0, &mut coeffs, &mut delays);
        assert!(
            delays[1] < delays[0],
            "right-ear delay {} should beat left-ear {}",
            delays[1],
            delays[0]
        );
        // And louder: the left ear response is shadowed.
        let energy = |ear: usize| -> f32 { coeffs.iter().map(|t| t[ear] * t[ear]).sum() };
        assert!(energy(1) > energy(0));
    }

    #[test]
    fn full_spread_collapses_to_diffuse() {
        let hrtf = HrtfStore::synthetic(44100);
        let mut front = [[0.0; 2]; HRIR_LENGTH];
        let mut side = [[0.0; 2]; HRIR_LENGTH];
        let mut delays_f = [0u32; 2];
        let mut delays_s = [0u32; 2];
        hrtf.get_coeffs(0.0, 0.0, std::f32::consts::TAU, &mut front, &mut delays_f);
        hrtf.get_coeffs(
            0.3,
            -std::f32::consts::FRAC_PI_2,
            std::f32::consts::TAU,
            &mut side,
            &mut delays_s,
        );
        // Any direction at full spread yields the same diffuse response.
        for (a, b) in front.iter().zip(side.iter()) {
            assert_close(a[0], b[0], 1e-6);
            assert_close(a[1], b[1], 1e-6);
        }
        assert_eq!(delays_f, delays_s);
    }

    #[test]
    fn direct_mix_of_silence_is_silence() {
        let hrtf = HrtfStore::synthetic(44100);
        let mut state = DirectHrtfState::new(4);
        build_bformat_hrtf(&hrtf, &mut state, 4, &AMBI_ORDER_HF_GAIN_FOA);
        let dry = vec![vec![0.0f32; 64]; 4];
        let mut left = vec![0.0f32; 64];
        let mut right = vec![0.0f32; 64];
        mix_direct_hrtf(&mut left, &mut right, &dry, &mut state, 64);
        assert!(left.iter().all(|&s| s == 0.0));
        assert!(right.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn direct_mix_is_stateful_across_calls() {
        let hrtf = HrtfStore::synthetic(44100);
        let make_state = || {
            let mut state = DirectHrtfState::new(1);
            build_bformat_hrtf(&hrtf, &mut state, 1, &AMBI_ORDER_HF_GAIN_FOA);
            state
        };
        let input: Vec<f32> = (0..128).map(|i| (i as f32 * 0.17).sin()).collect();

        let mut whole = make_state();
        let dry = vec![input.clone()];
        let mut left_a = vec![0.0f32; 128];
        let mut right_a = vec![0.0f32; 128];
        mix_direct_hrtf(&mut left_a, &mut right_a, &dry, &mut whole, 128);

        let mut split = make_state();
        let mut left_b = vec![0.0f32; 128];
        let mut right_b = vec![0.0f32; 128];
        let first = vec![input[..80].to_vec()];
        mix_direct_hrtf(&mut left_b[..80], &mut right_b[..80], &first, &mut split, 80);
        let second = vec![input[80..].to_vec()];
        mix_direct_hrtf(&mut left_b[80..], &mut right_b[80..], &second, &mut split, 48);

        for i in 0..128 {
            assert_close(left_a[i], left_b[i], 1e-5);
            assert_close(right_a[i], right_b[i], 1e-5);
        }
    }

    #[test]
    fn angles_roundtrip_cardinal_directions() {
        let (elev, azi) = dir_to_angles(glam::Vec3::new(0.0, 0.0, -1.0));
        assert_close(elev, 0.0, 1e-6);
        assert_close(azi, 0.0, 1e-6);
        let (_, azi) = dir_to_angles(glam::Vec3::new(1.0, 0.0, 0.0));
        assert_close(azi, std::f32::consts::FRAC_PI_2, 1e-6);
    }
}
