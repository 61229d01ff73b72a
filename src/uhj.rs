//! Two-channel UHJ encoding of the first-order ambisonic mix.
//!
//! The encoder takes FuMa-scaled W/X/Y and produces a stereo-compatible
//! signal:
//!
//! ```text
//! S = 0.9396926*W + 0.1855740*X
//! D = j(-0.3420201*W + 0.5098604*X) + 0.6554516*Y
//! L = (S + D)/2,  R = (S - D)/2
//! ```
//!
//! The broadband +90 degree shift `j` is realized with two parallel
//! four-stage all-pass chains whose outputs hold a 90 degree phase offset
//! from each other; the first chain's output is taken one sample late to
//! line the pair up.

/// Largest chunk processed per inner iteration.
const MAX_UPDATE_SAMPLES: usize = 128;

const FILTER1_COEFF_SQR: [f32; 4] = [
    0.479400865589,
    0.876218493539,
    0.976597589508,
    0.997499255936,
];
const FILTER2_COEFF_SQR: [f32; 4] = [
    0.161758498368,
    0.733028932341,
    0.945349700329,
    0.990599156685,
];

#[derive(Debug, Clone, Copy, Default)]
struct AllPassState {
    z: [f32; 2],
}

fn allpass_process(state: &mut AllPassState, dst: &mut [f32], src: &[f32], aa: f32) {
    let mut z1 = state.z[0];
    let mut z2 = state.z[1];
    for (out, &input) in dst.iter_mut().zip(src.iter()) {
        let output = input * aa + z1;
        z1 = z2;
        z2 = output * aa - input;
        *out = output;
    }
    state.z[0] = z1;
    state.z[1] = z2;
}

#[derive(Debug, Default)]
pub struct Uhj2Encoder {
    filter1_y: [AllPassState; 4],
    filter2_wx: [AllPassState; 4],
    filter1_wx: [AllPassState; 4],
    /// Filter1 outputs need a one sample delay; these hold the last sample
    /// from the previous call.
    last_y: f32,
    last_wx: f32,
    /// Optional sqrt(2) boost on the W input. Reference material disagrees
    /// on whether the scaling belongs in the encoding; off matches the
    /// original Gerzon formulation.
    w_boost: f32,
}

impl Uhj2Encoder {
    pub fn new(w_boost: bool) -> Self {
        Self {
            w_boost: if w_boost { std::f32::consts::SQRT_2 } else { 1.0 },
            ..Default::default()
        }
    }

    /// Encode `w`/`x`/`y` (FuMa scale) into the stereo pair, accumulating
    /// onto `left`/`right`.
    pub fn encode(
        &mut self,
        left: &mut [f32],
        right: &mut [f32],
        w: &[f32],
        x: &[f32],
        y: &[f32],
        frames: usize,
    ) {
        let mut temp_a = [0.0f32; MAX_UPDATE_SAMPLES];
        let mut temp_b = [0.0f32; MAX_UPDATE_SAMPLES];
        let mut side = [0.0f32; MAX_UPDATE_SAMPLES];
        let mut diff = [0.0f32; MAX_UPDATE_SAMPLES];

        let mut base = 0usize;
        while base < frames {
            let todo = (frames - base).min(MAX_UPDATE_SAMPLES);

            // D = 0.6554516*Y, through Filter1 with its one sample delay.
            for i in 0..todo {
                temp_a[i] = 0.6554516 * y[base + i];
            }
            run_chain(&mut self.filter1_y, &FILTER1_COEFF_SQR, &mut temp_a, &mut temp_b, todo);
            diff[0] = self.last_y;
            for i in 1..todo {
                diff[i] = temp_a[i - 1];
            }
            self.last_y = temp_a[todo - 1];

            // D += j(-0.3420201*W + 0.5098604*X) via Filter2.
            for i in 0..todo {
                temp_a[i] = -0.3420201 * self.w_boost * w[base + i] + 0.5098604 * x[base + i];
            }
            run_chain(&mut self.filter2_wx, &FILTER2_COEFF_SQR, &mut temp_a, &mut temp_b, todo);
            for i in 0..todo {
                diff[i] += temp_a[i];
            }

            // S = 0.9396926*W + 0.1855740*X, through Filter1, delayed.
            for i in 0..todo {
                temp_a[i] = 0.9396926 * self.w_boost * w[base + i] + 0.1855740 * x[base + i];
            }
            run_chain(&mut self.filter1_wx, &FILTER1_COEFF_SQR, &mut temp_a, &mut temp_b, todo);
            side[0] = self.last_wx;
            for i in 1..todo {
                side[i] = temp_a[i - 1];
            }
            self.last_wx = temp_a[todo - 1];

            for i in 0..todo {
                left[base + i] += (side[i] + diff[i]) * 0.5;
                right[base + i] += (side[i] - diff[i]) * 0.5;
            }

            base += todo;
        }
    }
}

/// Run the four all-pass stages, ping-ponging between `a` and `b`; the
/// final result lands back in `a`.
fn run_chain(
    states: &mut [AllPassState; 4],
    coeffs: &[f32; 4],
    a: &mut [f32; MAX_UPDATE_SAMPLES],
    b: &mut [f32; MAX_UPDATE_SAMPLES],
    todo: usize,
) {
    allpass_process(&mut states[0], &mut b[..todo], &a[..todo], coeffs[0]);
    allpass_process(&mut states[1], &mut a[..todo], &b[..todo], coeffs[1]);
    allpass_process(&mut states[2], &mut b[..todo], &a[..todo], coeffs[2]);
    allpass_process(&mut states[3], &mut a[..todo], &b[..todo], coeffs[3]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::assert_close;

    #[test]
    fn silence_encodes_to_silence() {
        let mut enc = Uhj2Encoder::new(false);
        let zeros = vec![0.0f32; 256];
        let mut left = vec![0.0f32; 256];
        let mut right = vec![0.0f32; 256];
        enc.encode(&mut left, &mut right, &zeros, &zeros, &zeros, 256);
        assert!(left.iter().all(|&s| s == 0.0));
        assert!(right.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn dc_on_w_settles_at_sum_difference_targets() {
        // Each all-pass stage maps DC to -1, so four stages pass DC with
        // unity gain on both chains. W-only DC input settles with the mid
        // signal at the S-path weight and the side signal at the D-path
        // weight: (L+R)/2 = 0.9396926*0.5 and L-R = -0.3420201.
        let mut enc = Uhj2Encoder::new(false);
        let n = 8192;
        let w = vec![1.0f32; n];
        let zeros = vec![0.0f32; n];
        let mut left = vec![0.0f32; n];
        let mut right = vec![0.0f32; n];
        enc.encode(&mut left, &mut right, &w, &zeros, &zeros, n);
        assert_close((left[n - 1] + right[n - 1]) * 0.5, 0.9396926 * 0.5, 1e-3);
        assert_close(left[n - 1] - right[n - 1], -0.3420201, 1e-3);
    }

    #[test]
    fn chunked_and_whole_encodes_match() {
        let n = 300; // crosses the internal chunk boundary
        let w: Vec<f32> = (0..n).map(|i| (i as f32 * 0.1).sin()).collect();
        let x: Vec<f32> = (0..n).map(|i| (i as f32 * 0.23).cos()).collect();
        let y: Vec<f32> = (0..n).map(|i| (i as f32 * 0.07).sin()).collect();

        let mut enc_a = Uhj2Encoder::new(false);
        let mut la = vec![0.0f32; n];
        let mut ra = vec![0.0f32; n];
        enc_a.encode(&mut la, &mut ra, &w, &x, &y, n);

        let mut enc_b = Uhj2Encoder::new(false);
        let mut lb = vec![0.0f32; n];
        let mut rb = vec![0.0f32; n];
        // Same signal fed in two uneven pieces.
        let split = 137;
        enc_b.encode(&mut lb[..split], &mut rb[..split], &w[..split], &x[..split], &y[..split], split);
        enc_b.encode(
            &mut lb[split..],
            &mut rb[split..],
            &w[split..],
            &x[split..],
            &y[split..],
            n - split,
        );
        for i in 0..n {
            assert_close(la[i], lb[i], 1e-5);
            assert_close(ra[i], rb[i], 1e-5);
        }
    }

    #[test]
    fn w_boost_scales_w_contribution() {
        let n = 4096;
        let w = vec![0.5f32; n];
        let zeros = vec![0.0f32; n];
        let mut left = vec![0.0f32; n];
        let mut right = vec![0.0f32; n];
        let mut enc = Uhj2Encoder::new(true);
        enc.encode(&mut left, &mut right, &w, &zeros, &zeros, n);
        assert_close(
            (left[n - 1] + right[n - 1]) * 0.5,
            0.9396926 * 0.5 * 0.5 * std::f32::consts::SQRT_2,
            1e-3,
        );
    }
}
