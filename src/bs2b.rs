//! Bauer stereophonic-to-binaural crossfeed.
//!
//! Feeds a low-passed, attenuated, slightly delayed copy of each stereo
//! channel into the other, approximating how a speaker pair reaches both
//! ears. Level presets trade crossfeed strength against stereo width; the
//! cut frequency and feed attenuation per level follow the bs2b reference
//! presets (700Hz/4.5dB, 700Hz/6dB, 650Hz/9.5dB and their "easy" variants).

/// Default preset: closest to virtual speaker placement.
pub const BS2B_DEFAULT_LEVEL: u8 = 3;

#[derive(Debug, Clone, Copy, Default)]
struct ChannelState {
    lo: f32,
    hi: f32,
}

#[derive(Debug, Clone)]
pub struct Bs2b {
    level: u8,
    srate: u32,
    // First-order coefficients for the low-pass feed and high "level" path.
    a0_lo: f32,
    b1_lo: f32,
    a0_hi: f32,
    a1_hi: f32,
    b1_hi: f32,
    gain: f32,
    history: [ChannelState; 2],
}

impl Bs2b {
    pub fn new(level: u8, srate: u32) -> Self {
        let mut filter = Self {
            level: 0,
            srate: 0,
            a0_lo: 0.0,
            b1_lo: 0.0,
            a0_hi: 0.0,
            a1_hi: 0.0,
            b1_hi: 0.0,
            gain: 0.0,
            history: [ChannelState::default(); 2],
        };
        filter.set_params(level, srate);
        filter
    }

    /// Configure the crossfeed level (1..=6) and sample rate. Out-of-range
    /// levels clamp to the nearest preset.
    pub fn set_params(&mut self, level: u8, srate: u32) {
        let level = level.clamp(1, 6);
        let srate = srate.max(1);
        if level == self.level && srate == self.srate {
            return;
        }
        self.level = level;
        self.srate = srate;

        // (cut frequency Hz, feed level in tenths of dB)
        let (fcut, feed_db10) = match level {
            1 => (700.0f32, 60.0f32),
            2 => (700.0, 45.0),
            3 => (650.0, 95.0),
            4 => (700.0, 78.0),
            5 => (660.0, 82.0),
            6 => (590.0, 70.0),
            _ => unreachable!(),
        };

        // Feed gain, half-level per channel pair.
        let g = 10.0f32.powf(-feed_db10 / 10.0 / 20.0);
        // Level difference between the direct and crossfed paths at DC.
        let g_full = 1.0 / (1.0 - g * 0.5);

        let fs = srate as f32;
        let x = (-std::f32::consts::TAU * fcut / fs).exp();
        self.b1_lo = x;
        self.a0_lo = g * (1.0 - x);

        let x_hi = (-std::f32::consts::TAU * fcut * g_full / fs).exp();
        self.b1_hi = x_hi;
        self.a0_hi = 1.0 - g * 0.5 * (1.0 - x_hi);
        self.a1_hi = -(x_hi - g * 0.5 * (1.0 - x_hi));

        self.gain = 1.0 / (1.0 + g * 0.5);
        self.clear();
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn clear(&mut self) {
        self.history = [ChannelState::default(); 2];
    }

    #[inline]
    fn step(&mut self, left: f32, right: f32) -> (f32, f32) {
        // Low-pass the opposite channel for the feed.
        self.history[0].lo = left * self.a0_lo + self.history[0].lo * self.b1_lo;
        self.history[1].lo = right * self.a0_lo + self.history[1].lo * self.b1_lo;

        // High path keeps the direct channel's level response flat.
        let hi_l = left * self.a0_hi + self.history[0].hi;
        self.history[0].hi = left * self.a1_hi + hi_l * self.b1_hi;
        let hi_r = right * self.a0_hi + self.history[1].hi;
        self.history[1].hi = right * self.a1_hi + hi_r * self.b1_hi;

        (
            (hi_l + self.history[1].lo) * self.gain,
            (hi_r + self.history[0].lo) * self.gain,
        )
    }

    /// Crossfeed `frames` samples in place.
    pub fn cross_feed(&mut self, left: &mut [f32], right: &mut [f32], frames: usize) {
        for i in 0..frames {
            let (l, r) = self.step(left[i], right[i]);
            left[i] = l;
            right[i] = r;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::assert_close;

    #[test]
    fn silence_stays_silent() {
        let mut filter = Bs2b::new(BS2B_DEFAULT_LEVEL, 44100);
        let mut left = vec![0.0f32; 256];
        let mut right = vec![0.0f32; 256];
        filter.cross_feed(&mut left, &mut right, 256);
        assert!(left.iter().all(|&s| s == 0.0));
        assert!(right.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn mono_content_passes_through_centered(){
        // Identical L/R content must stay identical; crossfeed only
        // reshapes the side signal.
        let mut filter = Bs2b::new(2, 48000);
        let src: Vec<f32> = (0..512).map(|i| (i as f32 * 0.13).sin()).collect();
        let mut left = src.clone();
        let mut right = src.clone();
        filter.cross_feed(&mut left, &mut right, 512);
        for i in 0..512 {
            assert_close(left[i], right[i], 1e-6);
        }
    }

    #[test]
    fn hard_panned_signal_leaks_into_other_ear() {
        let mut filter = Bs2b::new(BS2B_DEFAULT_LEVEL, 44100);
        let mut left = vec![1.0f32; 4096];
        let mut right = vec![0.0f32; 4096];
        filter.cross_feed(&mut left, &mut right, 4096);
        // After the low-pass settles, the right ear hears the feed.
        assert!(right[4095] > 0.05, "expected crossfeed, got {}", right[4095]);
        assert!(left[4095] > right[4095], "direct path must dominate");
    }

    #[test]
    fn level_clamps_into_preset_range() {
        let filter = Bs2b::new(0, 44100);
        assert_eq!(filter.level(), 1);
        let filter = Bs2b::new(9, 44100);
        assert_eq!(filter.level(), 6);
    }
}
