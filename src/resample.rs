//! Buffer-rate to device-rate resampling.
//!
//! Playback position advances in 16.16 fixed point. Five kernels are
//! offered per voice: point, linear, 4-point cubic, and two band-limited
//! sinc variants (12- and 24-point base width). The sinc tables are built
//! once per process at first use: per scale index a Kaiser-windowed sinc
//! filter bank over all fractional phases, plus delta rows so the kernel
//! can interpolate across phase and scale without table lookups per tap.

use std::sync::OnceLock;

use crate::math::{FRACTION_BITS, FRACTION_MASK, FRACTION_ONE};

/// Interpolator selection, per voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resampler {
    Point,
    #[default]
    Linear,
    Cubic,
    BSinc12,
    BSinc24,
}

/// History samples a kernel may read before/after the current position.
/// Sized for the widest bsinc24 filter at its lowest scale.
pub const MAX_RESAMPLER_PADDING: usize = 24;

const BSINC_PHASE_BITS: u32 = 4;
const BSINC_PHASE_COUNT: usize = 1 << BSINC_PHASE_BITS;
const BSINC_SCALE_COUNT: usize = 16;

/// Sub-table stride: filter, scale-delta, phase-delta, scale-phase-delta.
const BSINC_SUBTABLES: usize = 4;

pub struct BsincTable {
    scale_base: f32,
    /// Reciprocal of the covered scale span, for index mapping.
    scale_range: f32,
    m: [usize; BSINC_SCALE_COUNT],
    filter_offset: [usize; BSINC_SCALE_COUNT],
    tab: Vec<f32>,
}

/// Per-voice sinc state chosen from the increment.
#[derive(Clone, Copy)]
pub struct BsincState {
    sf: f32,
    m: usize,
    l: usize,
    filter_offset: usize,
    table: &'static BsincTable,
}

impl Default for BsincState {
    fn default() -> Self {
        bsinc_prepare(FRACTION_ONE, bsinc12_table())
    }
}

impl std::fmt::Debug for BsincState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BsincState")
            .field("sf", &self.sf)
            .field("m", &self.m)
            .field("l", &self.l)
            .finish()
    }
}

fn bessel_i0(x: f64) -> f64 {
    // Series expansion; converges quickly for the beta range used here.
    let mut term = 1.0;
    let mut sum = 1.0;
    let x2 = x * x / 4.0;
    for k in 1..64 {
        term *= x2 / (k as f64 * k as f64);
        sum += term;
        if term < sum * 1e-18 {
            break;
        }
    }
    sum
}

fn kaiser(x: f64, beta: f64) -> f64 {
    if x.abs() > 1.0 {
        return 0.0;
    }
    bessel_i0(beta * (1.0 - x * x).sqrt()) / bessel_i0(beta)
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-9 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

/// One tap of the ideal low-pass at relative cutoff `scale`, windowed to
/// half-width `half_width`.
fn kernel_tap(scale: f64, half_width: f64, t: f64, beta: f64) -> f64 {
    scale * sinc(scale * t) * kaiser(t / half_width, beta)
}

fn scale_for_index(scale_base: f64, si: usize) -> f64 {
    scale_base + (1.0 - scale_base) * si as f64 / (BSINC_SCALE_COUNT - 1) as f64
}

fn generate_bsinc_table(points: usize, beta: f64) -> BsincTable {
    // Filters stay fully band-limited down to 2:1 downsampling; below that
    // the widest filter is reused and aliasing rejection degrades.
    let scale_base = 0.5f64;

    let mut m = [0usize; BSINC_SCALE_COUNT];
    let mut filter_offset = [0usize; BSINC_SCALE_COUNT];
    let mut total = 0usize;
    for si in 0..BSINC_SCALE_COUNT {
        let scale = scale_for_index(scale_base, si);
        let l = ((points / 2) as f64 / scale).ceil() as usize;
        let l = l.min(points);
        m[si] = 2 * l;
        filter_offset[si] = total;
        total += BSINC_PHASE_COUNT * BSINC_SUBTABLES * m[si];
    }

    let mut tab = vec![0.0f32; total];

    // Evaluate the kernel for scale `si` on the tap grid of width `m_grid`
    // (the grid of whichever scale block the row belongs to).
    let eval_row = |si: usize, phase: f64, l_grid: usize, m_grid: usize| -> Vec<f64> {
        let scale = scale_for_index(scale_base, si);
        let half_width = ((points / 2) as f64 / scale).min(points as f64);
        let mut row: Vec<f64> = (0..m_grid)
            .map(|j| kernel_tap(scale, half_width, j as f64 - l_grid as f64 - phase, beta))
            .collect();
        let sum: f64 = row.iter().sum();
        if sum.abs() > 1e-12 {
            for tap in &mut row {
                *tap /= sum;
            }
        }
        row
    };

    for si in 0..BSINC_SCALE_COUNT {
        let msi = m[si];
        let l = msi / 2;
        for pi in 0..BSINC_PHASE_COUNT {
            let phase = pi as f64 / BSINC_PHASE_COUNT as f64;
            let next_phase = (pi + 1) as f64 / BSINC_PHASE_COUNT as f64;

            let fil = eval_row(si, phase, l, msi);
            let fil_next_phase = eval_row(si, next_phase, l, msi);
            let (fil_next_scale, fil_next_both) = if si + 1 < BSINC_SCALE_COUNT {
                (
                    eval_row(si + 1, phase, l, msi),
                    eval_row(si + 1, next_phase, l, msi),
                )
            } else {
                (fil.clone(), fil_next_phase.clone())
            };

            let base = filter_offset[si] + pi * BSINC_SUBTABLES * msi;
            for j in 0..msi {
                let f = fil[j];
                let scd = fil_next_scale[j] - f;
                let phd = fil_next_phase[j] - f;
                let spd = (fil_next_both[j] - fil_next_phase[j]) - scd;
                tab[base + j] = f as f32;
                tab[base + msi + j] = scd as f32;
                tab[base + 2 * msi + j] = phd as f32;
                tab[base + 3 * msi + j] = spd as f32;
            }
        }
    }

    BsincTable {
        scale_base: scale_base as f32,
        scale_range: 1.0 / (1.0 - scale_base as f32),
        m,
        filter_offset,
        tab,
    }
}

pub fn bsinc12_table() -> &'static BsincTable {
    static TABLE: OnceLock<BsincTable> = OnceLock::new();
    TABLE.get_or_init(|| generate_bsinc_table(12, 6.0))
}

pub fn bsinc24_table() -> &'static BsincTable {
    static TABLE: OnceLock<BsincTable> = OnceLock::new();
    TABLE.get_or_init(|| generate_bsinc_table(24, 8.6))
}

/// Pick the filter set for a playback increment.
///
/// Downsampling selects a lower scale index (wider, lower-cutoff filter).
/// The fractional part of the index becomes the scale interpolation factor,
/// fit to a diagonally-symmetric curve to reduce the transition ripple
/// between adjacent filter scales.
pub fn bsinc_prepare(increment: u32, table: &'static BsincTable) -> BsincState {
    let mut si = BSINC_SCALE_COUNT - 1;
    let mut sf = 0.0f32;

    if increment > FRACTION_ONE {
        sf = FRACTION_ONE as f32 / increment as f32;
        sf = ((BSINC_SCALE_COUNT - 1) as f32 * (sf - table.scale_base) * table.scale_range)
            .max(0.0);
        si = sf as usize;
        sf = 1.0 - (sf - si as f32).asin().cos();
    }

    BsincState {
        sf,
        m: table.m[si],
        l: table.m[si] / 2,
        filter_offset: table.filter_offset[si],
        table,
    }
}

/// Advance a 16.16 position by `increment`, returning (whole, frac).
#[inline]
fn advance(pos: usize, frac: u32, increment: u32) -> (usize, u32) {
    let frac = frac + increment;
    (pos + (frac >> FRACTION_BITS) as usize, frac & FRACTION_MASK)
}

/// Resample `dst.len()` output samples from `src`, starting at integer
/// position `base` with fraction `frac` (16.16), stepping by `increment`.
///
/// `src` must hold `MAX_RESAMPLER_PADDING` valid samples before `base` and
/// after the final read position; the mixer's staging buffer guarantees it.
pub fn resample(
    kind: Resampler,
    state: &BsincState,
    src: &[f32],
    base: usize,
    frac: u32,
    increment: u32,
    dst: &mut [f32],
) {
    match kind {
        Resampler::Point => {
            let (mut pos, mut pfrac) = (base, frac);
            for out in dst.iter_mut() {
                *out = src[pos];
                (pos, pfrac) = advance(pos, pfrac, increment);
            }
        }
        Resampler::Linear => {
            let (mut pos, mut pfrac) = (base, frac);
            for out in dst.iter_mut() {
                let mu = pfrac as f32 / FRACTION_ONE as f32;
                *out = src[pos] + (src[pos + 1] - src[pos]) * mu;
                (pos, pfrac) = advance(pos, pfrac, increment);
            }
        }
        Resampler::Cubic => {
            let (mut pos, mut pfrac) = (base, frac);
            for out in dst.iter_mut() {
                let mu = pfrac as f32 / FRACTION_ONE as f32;
                let (s0, s1, s2, s3) = (src[pos - 1], src[pos], src[pos + 1], src[pos + 2]);
                // Catmull-Rom through the four neighbors.
                let a0 = -0.5 * s0 + 1.5 * s1 - 1.5 * s2 + 0.5 * s3;
                let a1 = s0 - 2.5 * s1 + 2.0 * s2 - 0.5 * s3;
                let a2 = -0.5 * s0 + 0.5 * s2;
                *out = ((a0 * mu + a1) * mu + a2) * mu + s1;
                (pos, pfrac) = advance(pos, pfrac, increment);
            }
        }
        Resampler::BSinc12 | Resampler::BSinc24 => {
            resample_bsinc(state, src, base, frac, increment, dst);
        }
    }
}

fn resample_bsinc(
    state: &BsincState,
    src: &[f32],
    base: usize,
    frac: u32,
    increment: u32,
    dst: &mut [f32],
) {
    const PHASE_SHIFT: u32 = FRACTION_BITS - BSINC_PHASE_BITS;
    const PHASE_FRAC_ONE: u32 = 1 << PHASE_SHIFT;
    const PHASE_FRAC_MASK: u32 = PHASE_FRAC_ONE - 1;

    let (m, l, sf) = (state.m, state.l, state.sf);
    let tab = &state.table.tab;
    let (mut pos, mut pfrac) = (base, frac);
    for out in dst.iter_mut() {
        let pi = (pfrac >> PHASE_SHIFT) as usize;
        let pf = (pfrac & PHASE_FRAC_MASK) as f32 / PHASE_FRAC_ONE as f32;

        let row = state.filter_offset + pi * BSINC_SUBTABLES * m;
        let fil = &tab[row..row + m];
        let scd = &tab[row + m..row + 2 * m];
        let phd = &tab[row + 2 * m..row + 3 * m];
        let spd = &tab[row + 3 * m..row + 4 * m];

        let window = &src[pos - l..pos - l + m];
        let mut acc = 0.0f32;
        for j in 0..m {
            acc += (fil[j] + sf * scd[j] + pf * (phd[j] + sf * spd[j])) * window[j];
        }
        *out = acc;
        (pos, pfrac) = advance(pos, pfrac, increment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::assert_close;

    fn staging(samples: &[f32]) -> (Vec<f32>, usize) {
        let mut buf = vec![0.0f32; MAX_RESAMPLER_PADDING];
        buf.extend_from_slice(samples);
        buf.extend(std::iter::repeat(0.0).take(MAX_RESAMPLER_PADDING * 2));
        (buf, MAX_RESAMPLER_PADDING)
    }

    #[test]
    fn unity_increment_point_is_identity() {
        let src: Vec<f32> = (0..32).map(|i| i as f32).collect();
        let (buf, base) = staging(&src);
        let mut dst = vec![0.0f32; 32];
        let state = BsincState::default();
        resample(Resampler::Point, &state, &buf, base, 0, FRACTION_ONE, &mut dst);
        assert_eq!(&dst[..], &src[..]);
    }

    #[test]
    fn unity_increment_linear_is_identity() {
        let src: Vec<f32> = (0..32).map(|i| (i as f32 * 0.7).sin()).collect();
        let (buf, base) = staging(&src);
        let mut dst = vec![0.0f32; 32];
        let state = BsincState::default();
        resample(Resampler::Linear, &state, &buf, base, 0, FRACTION_ONE, &mut dst);
        for (out, want) in dst.iter().zip(src.iter()) {
            assert_close(*out, *want, 1e-6);
        }
    }

    #[test]
    fn linear_halfway_interpolates() {
        let src = [0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let (buf, base) = staging(&src);
        let mut dst = vec![0.0f32; 4];
        let state = BsincState::default();
        resample(
            Resampler::Linear,
            &state,
            &buf,
            base,
            FRACTION_ONE / 2,
            FRACTION_ONE,
            &mut dst,
        );
        for (i, &out) in dst.iter().enumerate() {
            assert_close(out, i as f32 + 0.5, 1e-5);
        }
    }

    #[test]
    fn cubic_reproduces_linear_ramps_exactly() {
        let src: Vec<f32> = (0..32).map(|i| 0.25 * i as f32).collect();
        let (buf, base) = staging(&src);
        let mut dst = vec![0.0f32; 16];
        let state = BsincState::default();
        // Step at 1.5x through the interior of the ramp.
        resample(
            Resampler::Cubic,
            &state,
            &buf,
            base + 4,
            0,
            3 * FRACTION_ONE / 2,
            &mut dst,
        );
        for (i, &out) in dst.iter().enumerate() {
            assert_close(out, 0.25 * (4.0 + 1.5 * i as f32), 1e-5);
        }
    }

    #[test]
    fn bsinc_tables_have_unity_dc_response() {
        for table in [bsinc12_table(), bsinc24_table()] {
            for si in 0..BSINC_SCALE_COUNT {
                let m = table.m[si];
                for pi in 0..BSINC_PHASE_COUNT {
                    let base = table.filter_offset[si] + pi * BSINC_SUBTABLES * m;
                    let sum: f32 = table.tab[base..base + m].iter().sum();
                    assert_close(sum, 1.0, 1e-4);
                }
            }
        }
    }

    #[test]
    fn bsinc_passes_dc_at_unity_rate() {
        let src = vec![0.75f32; 96];
        let (buf, base) = staging(&src);
        let state = bsinc_prepare(FRACTION_ONE, bsinc12_table());
        let mut dst = vec![0.0f32; 32];
        resample(
            Resampler::BSinc12,
            &state,
            &buf,
            base + MAX_RESAMPLER_PADDING,
            0,
            FRACTION_ONE,
            &mut dst,
        );
        for &out in &dst {
            assert_close(out, 0.75, 1e-3);
        }
    }

    #[test]
    fn bsinc_downsampling_rejects_above_nyquist() {
        // A tone at 0.9 of the *input* Nyquist, downsampled 2:1, aliases
        // unless the filter removes it.
        let src: Vec<f32> = (0..512)
            .map(|i| (std::f32::consts::PI * 0.9 * i as f32).sin())
            .collect();
        let (buf, base) = staging(&src);
        let increment = 2 * FRACTION_ONE;
        let state = bsinc_prepare(increment, bsinc24_table());
        let mut dst = vec![0.0f32; 128];
        resample(
            Resampler::BSinc24,
            &state,
            &buf,
            base + MAX_RESAMPLER_PADDING,
            0,
            increment,
            &mut dst,
        );
        let peak = dst[32..96].iter().fold(0.0f32, |acc, &s| acc.max(s.abs()));
        assert!(peak < 0.05, "aliased tone should be attenuated, peak {peak}");
    }

    #[test]
    fn bsinc_prepare_scale_selection() {
        let unity = bsinc_prepare(FRACTION_ONE, bsinc12_table());
        assert_eq!(unity.m, bsinc12_table().m[BSINC_SCALE_COUNT - 1]);
        assert_eq!(unity.sf, 0.0);

        let halved = bsinc_prepare(2 * FRACTION_ONE, bsinc12_table());
        assert_eq!(halved.m, bsinc12_table().m[0]);
        assert!(halved.l >= 12);
    }
}
