//! Biquad filter, direct form II transposed.
//!
//! Coefficient formulas follow the Bristow-Johnson audio EQ cookbook. For
//! the shelf types the configured gain is the gain at the reference
//! frequency, the centerpoint of the transition band; to set the gain of
//! the shelf itself, pass the square root of the desired linear gain.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiquadType {
    /// Low-pass style shelf, specifying a gain and reference frequency.
    HighShelf,
    /// High-pass style shelf, specifying a gain and reference frequency.
    LowShelf,
    /// Peaking filter, specifying a gain and center frequency.
    Peaking,
    /// Low-pass cut-off filter, specifying a cut-off frequency.
    LowPass,
    /// High-pass cut-off filter, specifying a cut-off frequency.
    HighPass,
    /// Band-pass filter, specifying a center frequency.
    BandPass,
}

#[derive(Debug, Clone)]
pub struct BiquadFilter {
    // Last two delayed components.
    z1: f32,
    z2: f32,
    // Transfer function coefficients; the denominator a0 is pre-applied.
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl Default for BiquadFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl BiquadFilter {
    /// A pass-through filter until parameters are set.
    pub fn new() -> Self {
        Self {
            z1: 0.0,
            z2: 0.0,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }

    /// Zero the filter history, keeping coefficients.
    pub fn clear(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    /// Configure the filter response.
    ///
    /// `gain` applies to the Shelf and Peaking types only. `f0norm` is the
    /// reference frequency over the sample rate, the center of the
    /// transition band (or the cutoff for LowPass/HighPass). `rcp_q` is
    /// 1/Q for the transition band, from [`calc_rcp_q_from_slope`] or
    /// [`calc_rcp_q_from_bandwidth`].
    pub fn set_params(&mut self, ftype: BiquadType, gain: f32, f0norm: f32, rcp_q: f32) {
        // Limit gain to -100dB. The callers already clamp to -60dB, this
        // keeps the math finite for anything that slips through.
        let mut gain = gain.max(0.000_01);

        let w0 = std::f32::consts::TAU * f0norm;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / 2.0 * rcp_q;

        let (b, a): ([f32; 3], [f32; 3]) = match ftype {
            BiquadType::HighShelf => {
                let sqrtgain_alpha_2 = 2.0 * gain.sqrt() * alpha;
                (
                    [
                        gain * ((gain + 1.0) + (gain - 1.0) * cos_w0 + sqrtgain_alpha_2),
                        -2.0 * gain * ((gain - 1.0) + (gain + 1.0) * cos_w0),
                        gain * ((gain + 1.0) + (gain - 1.0) * cos_w0 - sqrtgain_alpha_2),
                    ],
                    [
                        (gain + 1.0) - (gain - 1.0) * cos_w0 + sqrtgain_alpha_2,
                        2.0 * ((gain - 1.0) - (gain + 1.0) * cos_w0),
                        (gain + 1.0) - (gain - 1.0) * cos_w0 - sqrtgain_alpha_2,
                    ],
                )
            }
            BiquadType::LowShelf => {
                let sqrtgain_alpha_2 = 2.0 * gain.sqrt() * alpha;
                (
                    [
                        gain * ((gain + 1.0) - (gain - 1.0) * cos_w0 + sqrtgain_alpha_2),
                        2.0 * gain * ((gain - 1.0) - (gain + 1.0) * cos_w0),
                        gain * ((gain + 1.0) - (gain - 1.0) * cos_w0 - sqrtgain_alpha_2),
                    ],
                    [
                        (gain + 1.0) + (gain - 1.0) * cos_w0 + sqrtgain_alpha_2,
                        -2.0 * ((gain - 1.0) + (gain + 1.0) * cos_w0),
                        (gain + 1.0) + (gain - 1.0) * cos_w0 - sqrtgain_alpha_2,
                    ],
                )
            }
            BiquadType::Peaking => {
                gain = gain.sqrt();
                (
                    [1.0 + alpha * gain, -2.0 * cos_w0, 1.0 - alpha * gain],
                    [1.0 + alpha / gain, -2.0 * cos_w0, 1.0 - alpha / gain],
                )
            }
            BiquadType::LowPass => (
                [
                    (1.0 - cos_w0) / 2.0,
                    1.0 - cos_w0,
                    (1.0 - cos_w0) / 2.0,
                ],
                [1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha],
            ),
            BiquadType::HighPass => (
                [
                    (1.0 + cos_w0) / 2.0,
                    -(1.0 + cos_w0),
                    (1.0 + cos_w0) / 2.0,
                ],
                [1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha],
            ),
            BiquadType::BandPass => (
                [alpha, 0.0, -alpha],
                [1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha],
            ),
        };

        self.a1 = a[1] / a[0];
        self.a2 = a[2] / a[0];
        self.b0 = b[0] / a[0];
        self.b1 = b[1] / a[0];
        self.b2 = b[2] / a[0];
    }

    /// Copy coefficients but not history.
    pub fn copy_params_from(&mut self, other: &BiquadFilter) {
        self.b0 = other.b0;
        self.b1 = other.b1;
        self.b2 = other.b2;
        self.a1 = other.a1;
        self.a2 = other.a2;
    }

    #[inline]
    pub fn process_one(&mut self, input: f32) -> f32 {
        let out = input * self.b0 + self.z1;
        self.z1 = input * self.b1 - out * self.a1 + self.z2;
        self.z2 = input * self.b2 - out * self.a2;
        out
    }

    /// Filter `src` into `dst`. Stateful across calls: the result matches
    /// an equal number of single-sample invocations.
    pub fn process(&mut self, dst: &mut [f32], src: &[f32]) {
        for (out, &input) in dst.iter_mut().zip(src.iter()) {
            *out = self.process_one(input);
        }
    }

    /// Run the state forward as if processing `count` samples of the
    /// signal unfiltered, keeping history sensible for a bypassed block.
    pub fn passthru(&mut self, count: usize) {
        if count >= 2 {
            self.z1 = 0.0;
            self.z2 = 0.0;
        } else if count == 1 {
            self.z1 = self.z2;
            self.z2 = 0.0;
        }
    }
}

/// 1/Q for shelving filters from the reference gain and shelf slope
/// (`0 < slope <= 1`).
pub fn calc_rcp_q_from_slope(gain: f32, slope: f32) -> f32 {
    ((gain + 1.0 / gain) * (1.0 / slope - 1.0) + 2.0).sqrt()
}

/// 1/Q from a normalized reference frequency (`0 < f0norm < 0.5`) and a
/// bandwidth in octaves.
pub fn calc_rcp_q_from_bandwidth(f0norm: f32, bandwidth: f32) -> f32 {
    let w0 = std::f32::consts::TAU * f0norm;
    2.0 * (std::f32::consts::LN_2 / 2.0 * bandwidth * w0 / w0.sin()).sinh()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::assert_close;

    #[test]
    fn cleared_filter_maps_zeros_to_zeros() {
        let mut filter = BiquadFilter::new();
        filter.set_params(BiquadType::HighShelf, 0.25, 0.2, calc_rcp_q_from_slope(0.25, 1.0));
        let noise: Vec<f32> = (0..64).map(|i| ((i * 37) % 13) as f32 - 6.0).collect();
        let mut out = vec![0.0; 64];
        filter.process(&mut out, &noise);

        filter.clear();
        let zeros = vec![0.0f32; 64];
        filter.process(&mut out, &zeros);
        for &s in &out {
            assert_eq!(s, 0.0);
        }
    }

    #[test]
    fn block_processing_matches_per_sample() {
        let mut block = BiquadFilter::new();
        let mut single = BiquadFilter::new();
        let rcp_q = calc_rcp_q_from_bandwidth(0.1, 1.0);
        block.set_params(BiquadType::BandPass, 1.0, 0.1, rcp_q);
        single.copy_params_from(&block);

        let src: Vec<f32> = (0..128).map(|i| (i as f32 * 0.3).sin()).collect();
        let mut dst_block = vec![0.0; 128];
        block.process(&mut dst_block, &src);
        for (i, &input) in src.iter().enumerate() {
            assert_close(dst_block[i], single.process_one(input), 1e-6);
        }
    }

    #[test]
    fn unity_shelf_is_transparent() {
        let mut filter = BiquadFilter::new();
        filter.set_params(BiquadType::LowShelf, 1.0, 0.05, calc_rcp_q_from_slope(1.0, 1.0));
        let src: Vec<f32> = (0..256).map(|i| (i as f32 * 0.11).sin()).collect();
        let mut dst = vec![0.0; 256];
        filter.process(&mut dst, &src);
        for (out, input) in dst.iter().zip(src.iter()) {
            assert_close(*out, *input, 1e-5);
        }
    }

    #[test]
    fn high_shelf_attenuates_high_frequencies() {
        let mut filter = BiquadFilter::new();
        // -12dB above ~2kHz at 44.1kHz.
        filter.set_params(
            BiquadType::HighShelf,
            0.25,
            2000.0 / 44100.0,
            calc_rcp_q_from_slope(0.25, 1.0),
        );
        // A high-frequency tone well above the shelf corner.
        let tone: Vec<f32> = (0..2048)
            .map(|i| (std::f32::consts::TAU * 10_000.0 * i as f32 / 44100.0).sin())
            .collect();
        let mut out = vec![0.0; tone.len()];
        filter.process(&mut out, &tone);
        let peak_in = tone.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
        let peak_out = out[1024..].iter().fold(0.0f32, |m, &s| m.max(s.abs()));
        assert!(
            peak_out < peak_in * 0.35,
            "shelf should attenuate: in {peak_in}, out {peak_out}"
        );
    }

    #[test]
    fn copy_params_leaves_history_alone() {
        let mut src_filter = BiquadFilter::new();
        src_filter.set_params(BiquadType::LowPass, 1.0, 0.1, 1.0);
        let mut dst_filter = BiquadFilter::new();
        // Prime some history in dst.
        dst_filter.set_params(BiquadType::LowPass, 1.0, 0.3, 1.0);
        dst_filter.process_one(1.0);
        let z_before = (dst_filter.z1, dst_filter.z2);
        dst_filter.copy_params_from(&src_filter);
        assert_eq!((dst_filter.z1, dst_filter.z2), z_before);
        assert_eq!(dst_filter.b0, src_filter.b0);
    }
}
