//! Band splitter and phase-matching all-pass.
//!
//! The splitter decomposes a signal into complementary low- and high-
//! frequency bands around a crossover, Linkwitz-Riley style: a two-stage
//! one-pole low-pass paired with a first-order all-pass, with the high
//! band recovered by subtraction so the bands sum back to an all-passed
//! copy of the input.

#[derive(Debug, Clone, Copy, Default)]
pub struct BandSplitter {
    coeff: f32,
    lp_z1: f32,
    lp_z2: f32,
    ap_z1: f32,
}

impl BandSplitter {
    /// `f0norm` is the crossover frequency over the sample rate.
    pub fn new(f0norm: f32) -> Self {
        let mut splitter = Self::default();
        splitter.init(f0norm);
        splitter
    }

    pub fn init(&mut self, f0norm: f32) {
        let w = f0norm * std::f32::consts::TAU;
        let cw = w.cos();
        self.coeff = if cw > f32::EPSILON {
            (w.sin() - 1.0) / cw
        } else {
            cw * -0.5
        };
        self.clear();
    }

    pub fn clear(&mut self) {
        self.lp_z1 = 0.0;
        self.lp_z2 = 0.0;
        self.ap_z1 = 0.0;
    }

    /// Split `input` into `hf` and `lf`. The two outputs are phase matched:
    /// `hf[i] + lf[i]` reconstructs an all-passed input.
    pub fn process(&mut self, hf: &mut [f32], lf: &mut [f32], input: &[f32]) {
        let ap_coeff = self.coeff;
        let lp_coeff = self.coeff * 0.5 + 0.5;
        for ((hp_out, lp_out), &sample) in hf.iter_mut().zip(lf.iter_mut()).zip(input.iter()) {
            // Two cascaded one-pole low-pass stages.
            let mut d = (sample - self.lp_z1) * lp_coeff;
            let mut lp_y = self.lp_z1 + d;
            self.lp_z1 = lp_y + d;

            d = (lp_y - self.lp_z2) * lp_coeff;
            lp_y = self.lp_z2 + d;
            self.lp_z2 = lp_y + d;

            *lp_out = lp_y;

            // All-pass, then remove the low band to get the high band.
            let ap_y = sample * ap_coeff + self.ap_z1;
            self.ap_z1 = sample - ap_y * ap_coeff;
            *hp_out = ap_y - lp_y;
        }
    }
}

/// The all-pass half of the splitter on its own, used to keep channels
/// phase-aligned with band-split ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllPassSplitter {
    coeff: f32,
    z1: f32,
}

impl AllPassSplitter {
    pub fn new(f0norm: f32) -> Self {
        let mut ap = Self::default();
        ap.init(f0norm);
        ap
    }

    pub fn init(&mut self, f0norm: f32) {
        let w = f0norm * std::f32::consts::TAU;
        let cw = w.cos();
        self.coeff = if cw > f32::EPSILON {
            (w.sin() - 1.0) / cw
        } else {
            cw * -0.5
        };
        self.z1 = 0.0;
    }

    pub fn clear(&mut self) {
        self.z1 = 0.0;
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            let y = *sample * self.coeff + self.z1;
            self.z1 = *sample - y * self.coeff;
            *sample = y;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::assert_close;

    #[test]
    fn bands_sum_to_allpassed_input() {
        let f0 = 400.0 / 44100.0;
        let mut splitter = BandSplitter::new(f0);
        let mut allpass = AllPassSplitter::new(f0);

        let input: Vec<f32> = (0..512)
            .map(|i| (i as f32 * 0.05).sin() + 0.3 * (i as f32 * 0.61).cos())
            .collect();
        let mut hf = vec![0.0; input.len()];
        let mut lf = vec![0.0; input.len()];
        splitter.process(&mut hf, &mut lf, &input);

        let mut reference = input.clone();
        allpass.process(&mut reference);
        for i in 0..input.len() {
            assert_close(hf[i] + lf[i], reference[i], 1e-5);
        }
    }

    #[test]
    fn dc_lands_in_the_low_band() {
        let mut splitter = BandSplitter::new(400.0 / 44100.0);
        let input = vec![1.0f32; 4096];
        let mut hf = vec![0.0; input.len()];
        let mut lf = vec![0.0; input.len()];
        splitter.process(&mut hf, &mut lf, &input);
        // After settling, the low band carries the DC and the high band
        // decays to nothing.
        assert_close(lf[4095], 1.0, 1e-3);
        assert_close(hf[4095], 0.0, 1e-3);
    }

    #[test]
    fn silence_stays_silent() {
        let mut splitter = BandSplitter::new(0.01);
        let input = vec![0.0f32; 64];
        let mut hf = vec![1.0; 64];
        let mut lf = vec![1.0; 64];
        splitter.process(&mut hf, &mut lf, &input);
        assert!(hf.iter().all(|&s| s == 0.0));
        assert!(lf.iter().all(|&s| s == 0.0));
    }
}
