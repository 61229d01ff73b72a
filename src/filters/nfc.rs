//! Near-field control filters.
//!
//! Reproducing an ambisonic field over speakers at a finite distance bends
//! low frequencies: spherical wavefronts carry a proximity boost that grows
//! with ambisonic order. These filters pair a bass boost at the source
//! distance (`w0`) with a matching cut at the speaker distance (`w1`), one
//! progressively steeper section chain per order. Coefficients come from
//! factoring the reverse Bessel polynomial of each order into first- and
//! second-order sections.
//!
//! `w` values are normalized angular frequencies:
//! `w = speed_of_sound / (distance * sample_rate)`.

// Reverse Bessel polynomial factors per order: [order][section coeff].
// Order 2 factors as one quadratic; order 3 as a quadratic times a linear.
const B: [[f32; 3]; 4] = [
    [0.0, 0.0, 0.0],
    [1.0, 0.0, 0.0],
    [3.0, 3.0, 0.0],
    [3.6778, 6.4595, 2.3222],
];

#[derive(Debug, Clone, Copy, Default)]
struct FirstOrderSection {
    base_gain: f32,
    gain: f32,
    b1: f32,
    a1: f32,
    z1: f32,
}

impl FirstOrderSection {
    fn init(&mut self, w1: f32, coeff: f32) {
        self.base_gain = 1.0;
        self.gain = 1.0;
        self.z1 = 0.0;

        // Speaker-distance bass cut, fixed at creation.
        let r = 0.5 * w1;
        let b_00 = coeff * r;
        let g_0 = 1.0 + b_00;
        self.base_gain /= g_0;
        self.a1 = 2.0 * b_00 / g_0;

        self.adjust(0.0, coeff);
    }

    fn adjust(&mut self, w0: f32, coeff: f32) {
        // Source-distance bass boost, retuned per quantum.
        let r = 0.5 * w0;
        let b_00 = coeff * r;
        let g_0 = 1.0 + b_00;
        self.gain = self.base_gain * g_0;
        self.b1 = 2.0 * b_00 / g_0;
    }

    #[inline]
    fn process_one(&mut self, input: f32) -> f32 {
        let y = input * self.gain - self.a1 * self.z1;
        let out = y + self.b1 * self.z1;
        self.z1 += y;
        out
    }

    fn clear(&mut self) {
        self.z1 = 0.0;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SecondOrderSection {
    base_gain: f32,
    gain: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
}

impl SecondOrderSection {
    fn init(&mut self, w1: f32, c0: f32, c1: f32) {
        self.base_gain = 1.0;
        self.gain = 1.0;
        self.z1 = 0.0;
        self.z2 = 0.0;

        let r = 0.5 * w1;
        let b_10 = c0 * r;
        let b_11 = c1 * r * r;
        let g_1 = 1.0 + b_10 + b_11;
        self.base_gain /= g_1;
        self.a1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        self.a2 = 4.0 * b_11 / g_1;

        self.adjust(0.0, c0, c1);
    }

    fn adjust(&mut self, w0: f32, c0: f32, c1: f32) {
        let r = 0.5 * w0;
        let b_10 = c0 * r;
        let b_11 = c1 * r * r;
        let g_1 = 1.0 + b_10 + b_11;
        self.gain = self.base_gain * g_1;
        self.b1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        self.b2 = 4.0 * b_11 / g_1;
    }

    #[inline]
    fn process_one(&mut self, input: f32) -> f32 {
        let y = input * self.gain - self.a1 * self.z1 - self.a2 * self.z2;
        let out = y + self.b1 * self.z1 + self.b2 * self.z2;
        self.z2 += self.z1;
        self.z1 += y;
        out
    }

    fn clear(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// Progressive near-field filter for one bus channel, covering orders 1-3.
/// The caller picks `process1`/`process2`/`process3` by the ACN's order.
#[derive(Debug, Clone, Copy, Default)]
pub struct NfcFilter {
    w1: f32,
    first: FirstOrderSection,
    second: SecondOrderSection,
    third_second: SecondOrderSection,
    third_first: FirstOrderSection,
}

impl NfcFilter {
    /// `w1` is the control (speaker) distance frequency the boost is
    /// referenced against.
    pub fn new(w1: f32) -> Self {
        let mut filter = Self {
            w1,
            ..Default::default()
        };
        filter.first.init(w1, B[1][0]);
        filter.second.init(w1, B[2][0], B[2][1]);
        filter.third_second.init(w1, B[3][0], B[3][1]);
        filter.third_first.init(w1, B[3][2]);
        filter
    }

    /// Retune the source-distance side of every section. `w0 == w1` makes
    /// the filter a pass-through while still advancing history.
    pub fn adjust(&mut self, w0: f32) {
        self.first.adjust(w0, B[1][0]);
        self.second.adjust(w0, B[2][0], B[2][1]);
        self.third_second.adjust(w0, B[3][0], B[3][1]);
        self.third_first.adjust(w0, B[3][2]);
    }

    pub fn control_w(&self) -> f32 {
        self.w1
    }

    pub fn clear(&mut self) {
        self.first.clear();
        self.second.clear();
        self.third_second.clear();
        self.third_first.clear();
    }

    /// First-order channels (ACN 1-3).
    pub fn process1(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            *sample = self.first.process_one(*sample);
        }
    }

    /// Second-order channels (ACN 4-8).
    pub fn process2(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            *sample = self.second.process_one(*sample);
        }
    }

    /// Third-order channels (ACN 9-15).
    pub fn process3(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            let mid = self.third_second.process_one(*sample);
            *sample = self.third_first.process_one(mid);
        }
    }

    /// Apply the section chain appropriate to an ambisonic order. Order 0
    /// (and anything past 3) is untouched.
    pub fn process_order(&mut self, order: usize, samples: &mut [f32]) {
        match order {
            1 => self.process1(samples),
            2 => self.process2(samples),
            3 => self.process3(samples),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::assert_close;

    #[test]
    fn matched_distances_pass_through() {
        let w1 = 0.03;
        let mut filter = NfcFilter::new(w1);
        filter.adjust(w1);
        let mut samples: Vec<f32> = (0..512).map(|i| (i as f32 * 0.21).sin()).collect();
        let reference = samples.clone();
        filter.process1(&mut samples);
        for (out, want) in samples.iter().zip(reference.iter()) {
            assert_close(*out, *want, 1e-4);
        }
    }

    #[test]
    fn near_source_boosts_bass_on_first_order() {
        let mut filter = NfcFilter::new(0.01);
        // Source much closer than the speakers: stronger proximity boost.
        filter.adjust(0.08);
        let dc = vec![1.0f32; 8192];
        let mut out = dc.clone();
        filter.process1(&mut out);
        assert!(
            out[8191] > 1.5,
            "close source should boost low frequencies, got {}",
            out[8191]
        );
    }

    #[test]
    fn silence_in_silence_out_all_orders() {
        let mut filter = NfcFilter::new(0.02);
        filter.adjust(0.05);
        for order in 1..=3 {
            let mut samples = vec![0.0f32; 128];
            filter.process_order(order, &mut samples);
            assert!(samples.iter().all(|&s| s == 0.0), "order {order}");
        }
    }

    #[test]
    fn higher_orders_boost_harder() {
        let dc = vec![1.0f32; 16384];
        let mut gains = [0.0f32; 3];
        for order in 1..=3usize {
            let mut filter = NfcFilter::new(0.005);
            filter.adjust(0.05);
            let mut out = dc.clone();
            filter.process_order(order, &mut out);
            gains[order - 1] = out[16383];
        }
        assert!(gains[1] > gains[0]);
        assert!(gains[2] > gains[1]);
    }
}
