//! Ambisonic-to-speaker decoding.
//!
//! A decoder is built either from one of the built-in layout matrices or
//! from a [`DecoderPreset`] describing a custom speaker rig. Dual-band
//! presets decode the low and high bands through separate matrices around
//! a crossover for better psychoacoustic localization. The upsampler mixes
//! first-order content into a higher-order bus with per-order counter
//! scales so a subsequent higher-order decode reproduces the first-order
//! response.

use crate::ambi::{
    self, calc_ambi_coeffs, compute_pan_gains, BFChannelConfig, MAX_AMBI2D_COEFFS,
    MAX_AMBI_COEFFS,
};
use crate::devformat::{AmbiNorm, Channel, ChannelLayout};
use crate::error::{IrisonicError, Result};
use crate::filters::{AllPassSplitter, BandSplitter};
use crate::math::BUFFER_SIZE;
use glam::Vec3;

const HF_BAND: usize = 0;
const LF_BAND: usize = 1;
const NUM_BANDS: usize = 2;

/// Cube of virtual sampling points used to derive upsampler gains.
/// Coordinates are listener-space (+x right, +y up, -z front).
const AMBI3D_POINTS: [[f32; 3]; 8] = [
    [-0.577350269, 0.577350269, -0.577350269],
    [0.577350269, 0.577350269, -0.577350269],
    [-0.577350269, 0.577350269, 0.577350269],
    [0.577350269, 0.577350269, 0.577350269],
    [-0.577350269, -0.577350269, -0.577350269],
    [0.577350269, -0.577350269, -0.577350269],
    [-0.577350269, -0.577350269, 0.577350269],
    [0.577350269, -0.577350269, 0.577350269],
];
/// First-order decode matrix for the cube.
const AMBI3D_DECODER: [[f32; 4]; 8] = [
    [0.125, 0.125, 0.125, 0.125],
    [0.125, -0.125, 0.125, 0.125],
    [0.125, 0.125, 0.125, -0.125],
    [0.125, -0.125, 0.125, -0.125],
    [0.125, 0.125, -0.125, 0.125],
    [0.125, -0.125, -0.125, 0.125],
    [0.125, 0.125, -0.125, -0.125],
    [0.125, -0.125, -0.125, -0.125],
];
/// High-frequency correction for the cube decode, per FOA channel.
const AMBI3D_DECODER_HF_SCALE: [f32; 4] = [2.0, 1.15470054, 1.15470054, 1.15470054];

/// Crossover used when upsampling first-order content.
pub const UPSAMPLE_XOVER_FREQ: f32 = 400.0;

/// One speaker of a decoder preset. `name` uses the conventional ambdec
/// labels (LF, RF, CE, LS, RS, LB, RB, CB, AUX0..) so it can be matched to
/// a device output channel.
#[derive(Debug, Clone)]
pub struct SpeakerConf {
    pub name: String,
    /// Distance from the listening point in meters; feeds delay
    /// compensation.
    pub distance: f32,
    /// One coefficient per bit set in the preset's channel mask.
    pub hf_row: Vec<f32>,
    pub lf_row: Vec<f32>,
}

/// An in-code ambisonic decoder description, mirroring what an ambdec
/// preset file carries.
#[derive(Debug, Clone)]
pub struct DecoderPreset {
    pub speakers: Vec<SpeakerConf>,
    /// Bitmask of ambisonic channels (by ACN) the matrix rows cover.
    pub chan_mask: u32,
    pub freq_bands: u8,
    pub xover_freq: f32,
    /// Band balance in dB; the HF matrix is boosted and the LF matrix cut
    /// by half this amount each.
    pub xover_ratio: f32,
    pub coeff_scale: AmbiNorm,
    pub hf_order_gain: [f32; 4],
    pub lf_order_gain: [f32; 4],
}

/// Bits above first order in a channel mask.
pub const AMBI_PERIPHONIC_MASK: u32 = 0xfe09_fcb2;
const AMBI_1ORDER_MASK: u32 = 0xf;
const AMBI_2ORDER_MASK: u32 = 0x1ff;

impl DecoderPreset {
    pub fn is_periphonic(&self) -> bool {
        (self.chan_mask & AMBI_PERIPHONIC_MASK) != 0
    }

    /// Ambisonic channel count the preset's mask implies on the dry bus.
    pub fn bus_channels(&self) -> usize {
        if self.is_periphonic() {
            if self.chan_mask > AMBI_2ORDER_MASK {
                16
            } else if self.chan_mask > AMBI_1ORDER_MASK {
                9
            } else {
                4
            }
        } else if self.chan_mask > AMBI_2ORDER_MASK {
            7
        } else if self.chan_mask > AMBI_1ORDER_MASK {
            5
        } else {
            3
        }
    }

    pub fn order(&self) -> usize {
        if self.chan_mask > AMBI_2ORDER_MASK {
            3
        } else if self.chan_mask > AMBI_1ORDER_MASK {
            2
        } else {
            1
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.speakers.is_empty() {
            return Err(IrisonicError::DecoderPreset("preset has no speakers".into()));
        }
        if self.freq_bands != 1 && self.freq_bands != 2 {
            return Err(IrisonicError::DecoderPreset(format!(
                "unsupported band count {}",
                self.freq_bands
            )));
        }
        let coeff_count = self.chan_mask.count_ones() as usize;
        for speaker in &self.speakers {
            if speaker.hf_row.len() < coeff_count
                || (self.freq_bands == 2 && speaker.lf_row.len() < coeff_count)
            {
                return Err(IrisonicError::DecoderPreset(format!(
                    "speaker \"{}\" matrix row is short",
                    speaker.name
                )));
            }
        }
        Ok(())
    }
}

/// Resolve each preset speaker to an index into the device's real output
/// channels. 5.1 configurations accept back labels for side speakers and
/// vice versa, so presets written for either arrangement work on both.
pub fn make_speaker_map(
    layout: ChannelLayout,
    channels: &[Channel],
    preset: &DecoderPreset,
) -> Result<Vec<usize>> {
    let find = |ch: Channel| channels.iter().position(|&have| have == ch);
    let mut map = Vec::with_capacity(preset.speakers.len());
    for speaker in &preset.speakers {
        let ch = match speaker.name.as_str() {
            "LF" => Channel::FrontLeft,
            "RF" => Channel::FrontRight,
            "CE" => Channel::FrontCenter,
            "LS" => {
                if layout == ChannelLayout::X51Rear {
                    Channel::BackLeft
                } else {
                    Channel::SideLeft
                }
            }
            "RS" => {
                if layout == ChannelLayout::X51Rear {
                    Channel::BackRight
                } else {
                    Channel::SideRight
                }
            }
            "LB" => {
                if layout == ChannelLayout::X51 {
                    Channel::SideLeft
                } else {
                    Channel::BackLeft
                }
            }
            "RB" => {
                if layout == ChannelLayout::X51 {
                    Channel::SideRight
                } else {
                    Channel::BackRight
                }
            }
            "CB" => Channel::BackCenter,
            other => {
                let aux = other
                    .strip_prefix("AUX")
                    .and_then(|n| n.parse::<u8>().ok())
                    .filter(|&n| n < 16);
                match aux {
                    Some(n) => Channel::Aux(n),
                    None => {
                        return Err(IrisonicError::DecoderPreset(format!(
                            "speaker label \"{}\" not recognized",
                            speaker.name
                        )))
                    }
                }
            }
        };
        let idx = find(ch).ok_or_else(|| {
            IrisonicError::DecoderPreset(format!(
                "no {} output for preset speaker \"{}\"",
                ch.label(),
                speaker.name
            ))
        })?;
        map.push(idx);
    }
    Ok(map)
}

fn scales_for(norm: AmbiNorm) -> &'static [f32; MAX_AMBI_COEFFS] {
    match norm {
        AmbiNorm::FuMa => &ambi::scale::FROM_FUMA,
        AmbiNorm::SN3D => &ambi::scale::FROM_SN3D,
        AmbiNorm::N3D => &ambi::scale::FROM_N3D,
    }
}

fn order_gain(gains: &[f32; 4], acn: usize) -> f32 {
    gains[ambi::acn_order(acn)]
}

#[derive(Clone)]
struct UpSampler {
    xover: BandSplitter,
    gains: [f32; NUM_BANDS],
}

enum Matrix {
    Single(Vec<[f32; MAX_AMBI_COEFFS]>),
    Dual(Vec<[[f32; MAX_AMBI_COEFFS]; NUM_BANDS]>),
}

/// B-format bus to speaker-feed decoder.
pub struct BFormatDec {
    enabled: u32,
    num_channels: usize,
    matrix: Matrix,
    xover: Vec<BandSplitter>,
    samples_hf: Vec<Vec<f32>>,
    samples_lf: Vec<Vec<f32>>,
    up_sampler: Vec<UpSampler>,
    up_hf: Vec<f32>,
    up_lf: Vec<f32>,
    channel_mix: Vec<f32>,
}

impl BFormatDec {
    /// Build a single-band decoder from per-speaker coefficient rows in
    /// the 2D channel order of the dry bus. Used for the built-in layout
    /// matrices.
    pub fn from_matrix(
        coeff_count: usize,
        xover_norm: f32,
        rows: &[(usize, [f32; MAX_AMBI2D_COEFFS])],
        num_outputs: usize,
    ) -> Self {
        let mut matrix = vec![[0.0f32; MAX_AMBI_COEFFS]; num_outputs];
        let mut enabled = 0u32;
        for &(out_idx, row) in rows {
            enabled |= 1 << out_idx;
            matrix[out_idx][..coeff_count].copy_from_slice(&row[..coeff_count]);
        }
        Self {
            enabled,
            num_channels: coeff_count,
            matrix: Matrix::Single(matrix),
            xover: Vec::new(),
            samples_hf: Vec::new(),
            samples_lf: Vec::new(),
            up_sampler: Self::build_upsamplers(coeff_count, false, xover_norm),
            up_hf: vec![0.0; BUFFER_SIZE],
            up_lf: vec![0.0; BUFFER_SIZE],
            channel_mix: vec![0.0; BUFFER_SIZE],
        }
    }

    /// Build a decoder from a custom preset. `chanmap` maps preset
    /// speakers to real output indices (see [`make_speaker_map`]).
    pub fn from_preset(
        preset: &DecoderPreset,
        srate: u32,
        chanmap: &[usize],
        num_outputs: usize,
    ) -> Result<Self> {
        preset.validate()?;
        let periphonic = preset.is_periphonic();
        let num_channels = preset.bus_channels();
        let coeff_scale = scales_for(preset.coeff_scale);

        let mut enabled = 0u32;
        for &chan in chanmap {
            enabled |= 1 << chan;
        }

        let coeff_count = if periphonic {
            MAX_AMBI_COEFFS
        } else {
            MAX_AMBI2D_COEFFS
        };

        let dual_band = preset.freq_bands == 2;
        let matrix = if !dual_band {
            let mut matrix = vec![[0.0f32; MAX_AMBI_COEFFS]; num_outputs];
            for (speaker, &out_idx) in preset.speakers.iter().zip(chanmap.iter()) {
                let row = &mut matrix[out_idx];
                let mut k = 0usize;
                for j in 0..coeff_count {
                    let acn = if periphonic { j } else { ambi::index::FROM_2D[j] };
                    if preset.chan_mask & (1 << acn) == 0 {
                        continue;
                    }
                    row[j] = speaker.hf_row[k] / coeff_scale[acn]
                        * order_gain(&preset.hf_order_gain, acn);
                    k += 1;
                }
            }
            Matrix::Single(matrix)
        } else {
            let ratio = 10.0f32.powf(preset.xover_ratio / 40.0);
            let mut matrix = vec![[[0.0f32; MAX_AMBI_COEFFS]; NUM_BANDS]; num_outputs];
            for (speaker, &out_idx) in preset.speakers.iter().zip(chanmap.iter()) {
                let row = &mut matrix[out_idx];
                let mut k = 0usize;
                for j in 0..coeff_count {
                    let acn = if periphonic { j } else { ambi::index::FROM_2D[j] };
                    if preset.chan_mask & (1 << acn) == 0 {
                        continue;
                    }
                    row[HF_BAND][j] = speaker.hf_row[k] / coeff_scale[acn]
                        * order_gain(&preset.hf_order_gain, acn)
                        * ratio;
                    row[LF_BAND][j] = speaker.lf_row[k] / coeff_scale[acn]
                        * order_gain(&preset.lf_order_gain, acn)
                        / ratio;
                    k += 1;
                }
            }
            Matrix::Dual(matrix)
        };

        let (xover, samples_hf, samples_lf) = if dual_band {
            (
                vec![BandSplitter::new(preset.xover_freq / srate as f32); num_channels],
                vec![vec![0.0f32; BUFFER_SIZE]; num_channels],
                vec![vec![0.0f32; BUFFER_SIZE]; num_channels],
            )
        } else {
            (Vec::new(), Vec::new(), Vec::new())
        };

        Ok(Self {
            enabled,
            num_channels,
            matrix,
            xover,
            samples_hf,
            samples_lf,
            up_sampler: Self::build_upsamplers(
                num_channels,
                periphonic,
                UPSAMPLE_XOVER_FREQ / srate as f32,
            ),
            up_hf: vec![0.0; BUFFER_SIZE],
            up_lf: vec![0.0; BUFFER_SIZE],
            channel_mix: vec![0.0; BUFFER_SIZE],
        })
    }

    /// Derive the first-order injection gains: encode the virtual cube,
    /// decode it first-order, and fold both into one in-to-out gain per
    /// FOA channel, with the HF band counter-scaled.
    fn build_upsamplers(chancount: usize, periphonic: bool, xover_norm: f32) -> Vec<UpSampler> {
        let mut gains = [[0.0f32; NUM_BANDS]; 4];
        if periphonic || chancount >= 4 {
            for (i, gain) in gains.iter_mut().enumerate() {
                let mut sum = 0.0f64;
                for (k, point) in AMBI3D_POINTS.iter().enumerate() {
                    let coeffs =
                        calc_ambi_coeffs(Vec3::new(point[0], point[1], point[2]), 0.0);
                    sum += AMBI3D_DECODER[k][i] as f64 * coeffs[i] as f64;
                }
                gain[HF_BAND] = (sum * AMBI3D_DECODER_HF_SCALE[i] as f64) as f32;
                gain[LF_BAND] = sum as f32;
            }
        } else {
            // 2D bus: W and the two horizontal first-order channels only.
            for c in 0..3usize {
                let acn = ambi::index::FROM_2D[c];
                let mut sum = 0.0f64;
                for (k, point) in AMBI3D_POINTS.iter().enumerate() {
                    let coeffs =
                        calc_ambi_coeffs(Vec3::new(point[0], point[1], point[2]), 0.0);
                    sum += AMBI3D_DECODER[k][acn] as f64 * coeffs[acn] as f64;
                }
                gains[c][HF_BAND] = (sum * AMBI3D_DECODER_HF_SCALE[acn] as f64) as f32;
                gains[c][LF_BAND] = sum as f32;
            }
        }
        gains
            .iter()
            .map(|&g| UpSampler {
                xover: BandSplitter::new(xover_norm),
                gains: g,
            })
            .collect()
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Decode the ambisonic input into the speaker feeds, accumulating.
    pub fn process(&mut self, output: &mut [Vec<f32>], input: &[Vec<f32>], frames: usize) {
        match &self.matrix {
            Matrix::Dual(matrix) => {
                for (chan, splitter) in self.xover.iter_mut().enumerate().take(self.num_channels)
                {
                    splitter.process(
                        &mut self.samples_hf[chan][..frames],
                        &mut self.samples_lf[chan][..frames],
                        &input[chan][..frames],
                    );
                }

                for (out_idx, out) in output.iter_mut().enumerate() {
                    if self.enabled & (1 << out_idx) == 0 {
                        continue;
                    }
                    let mix = &mut self.channel_mix[..frames];
                    mix.fill(0.0);
                    for chan in 0..self.num_channels {
                        let hf_gain = matrix[out_idx][HF_BAND][chan];
                        let lf_gain = matrix[out_idx][LF_BAND][chan];
                        for (acc, (&hf, &lf)) in mix
                            .iter_mut()
                            .zip(self.samples_hf[chan].iter().zip(self.samples_lf[chan].iter()))
                        {
                            *acc += hf * hf_gain + lf * lf_gain;
                        }
                    }
                    for (out_sample, &mixed) in out.iter_mut().zip(mix.iter()) {
                        *out_sample += mixed;
                    }
                }
            }
            Matrix::Single(matrix) => {
                for (out_idx, out) in output.iter_mut().enumerate() {
                    if self.enabled & (1 << out_idx) == 0 {
                        continue;
                    }
                    let row = &matrix[out_idx];
                    for chan in 0..self.num_channels {
                        let gain = row[chan];
                        if gain == 0.0 {
                            continue;
                        }
                        for (out_sample, &in_sample) in
                            out.iter_mut().zip(input[chan][..frames].iter())
                        {
                            *out_sample += in_sample * gain;
                        }
                    }
                }
            }
        }
    }

    /// Mix a first-order bus into the higher-order input bus this decoder
    /// consumes, band-splitting each FOA channel and applying the counter
    /// scales.
    pub fn up_sample(&mut self, output: &mut [Vec<f32>], input: &[Vec<f32>], frames: usize) {
        for (i, up) in self.up_sampler.iter_mut().enumerate().take(input.len().min(4)) {
            up.xover.process(
                &mut self.up_hf[..frames],
                &mut self.up_lf[..frames],
                &input[i][..frames],
            );
            let (hf_gain, lf_gain) = (up.gains[HF_BAND], up.gains[LF_BAND]);
            for ((out, &hf), &lf) in output[i]
                .iter_mut()
                .zip(self.up_hf[..frames].iter())
                .zip(self.up_lf[..frames].iter())
            {
                *out += hf * hf_gain + lf * lf_gain;
            }
        }
    }
}

/// Standalone first-order to device-bus upsampler, for devices whose dry
/// bus is higher-order ambisonic output (no speaker decode).
pub struct AmbiUpsampler {
    xover: Vec<BandSplitter>,
    gains: [[f32; NUM_BANDS]; 4],
    scratch_hf: Vec<f32>,
    scratch_lf: Vec<f32>,
}

impl AmbiUpsampler {
    pub fn new(srate: u32, dry_map: &[BFChannelConfig]) -> Self {
        let xover_norm = UPSAMPLE_XOVER_FREQ / srate as f32;

        // Encode the cube into the dry bus, fold with the first-order
        // decode, and counter-scale the HF band.
        let mut encgains = vec![[0.0f32; MAX_AMBI_COEFFS]; AMBI3D_POINTS.len()];
        for (point, gains) in AMBI3D_POINTS.iter().zip(encgains.iter_mut()) {
            let coeffs = calc_ambi_coeffs(Vec3::new(point[0], point[1], point[2]), 0.0);
            let mut row = vec![0.0f32; dry_map.len()];
            compute_pan_gains(dry_map, &coeffs, 1.0, &mut row);
            gains[..dry_map.len()].copy_from_slice(&row);
        }

        let mut gains = [[0.0f32; NUM_BANDS]; 4];
        for (i, gain) in gains.iter_mut().enumerate() {
            let mut sum = 0.0f64;
            for k in 0..AMBI3D_POINTS.len() {
                sum += AMBI3D_DECODER[k][i] as f64 * encgains[k][i] as f64;
            }
            gain[HF_BAND] = (sum * AMBI3D_DECODER_HF_SCALE[i] as f64) as f32;
            gain[LF_BAND] = sum as f32;
        }

        Self {
            xover: vec![BandSplitter::new(xover_norm); 4],
            gains,
            scratch_hf: vec![0.0; BUFFER_SIZE],
            scratch_lf: vec![0.0; BUFFER_SIZE],
        }
    }

    pub fn process(&mut self, output: &mut [Vec<f32>], input: &[Vec<f32>], frames: usize) {
        for (i, splitter) in self.xover.iter_mut().enumerate().take(input.len().min(4)) {
            splitter.process(
                &mut self.scratch_hf[..frames],
                &mut self.scratch_lf[..frames],
                &input[i][..frames],
            );
            let (hf_gain, lf_gain) = (self.gains[i][HF_BAND], self.gains[i][LF_BAND]);
            if i < output.len() {
                for ((out, &hf), &lf) in output[i]
                    .iter_mut()
                    .zip(self.scratch_hf[..frames].iter())
                    .zip(self.scratch_lf[..frames].iter())
                {
                    *out += hf * hf_gain + lf * lf_gain;
                }
            }
        }
    }
}

/// Re-anchors the center image for surround layouts: the front pair is
/// band-split, every other channel all-passed to stay phase aligned, and
/// the sum/difference repartitioned across left, right and center.
pub struct FrontStabilizer {
    ap: Vec<AllPassSplitter>,
    left_filter: BandSplitter,
    right_filter: BandSplitter,
    lsplit: [Vec<f32>; 2],
    rsplit: [Vec<f32>; 2],
}

/// Crossover for the stabilizer's front band split.
pub const STABILIZER_XOVER_FREQ: f32 = 300.0;

impl FrontStabilizer {
    pub fn new(num_channels: usize, srate: u32) -> Self {
        let f0norm = STABILIZER_XOVER_FREQ / srate as f32;
        Self {
            ap: vec![AllPassSplitter::new(f0norm); num_channels],
            left_filter: BandSplitter::new(f0norm),
            right_filter: BandSplitter::new(f0norm),
            lsplit: [vec![0.0; BUFFER_SIZE], vec![0.0; BUFFER_SIZE]],
            rsplit: [vec![0.0; BUFFER_SIZE], vec![0.0; BUFFER_SIZE]],
        }
    }

    pub fn apply(
        &mut self,
        buffer: &mut [Vec<f32>],
        lidx: usize,
        ridx: usize,
        cidx: usize,
        frames: usize,
    ) {
        // All-pass everything but the front pair so relative phase holds.
        for (i, filter) in self.ap.iter_mut().enumerate() {
            if i == lidx || i == ridx {
                continue;
            }
            filter.process(&mut buffer[i][..frames]);
        }

        let [lsplit_lf, lsplit_hf] = &mut self.lsplit;
        let [rsplit_lf, rsplit_hf] = &mut self.rsplit;
        self.left_filter
            .process(&mut lsplit_hf[..frames], &mut lsplit_lf[..frames], &buffer[lidx][..frames]);
        self.right_filter
            .process(&mut rsplit_hf[..frames], &mut rsplit_lf[..frames], &buffer[ridx][..frames]);

        // Low band leans 1/3rd toward center, high band 1/4th; keeps the
        // phantom image from wandering with listener position.
        let lf_pan = std::f32::consts::FRAC_PI_2 / 3.0;
        let hf_pan = std::f32::consts::FRAC_PI_2 / 4.0;
        let (lf_cos, lf_sin) = (lf_pan.cos(), lf_pan.sin());
        let (hf_cos, hf_sin) = (hf_pan.cos(), hf_pan.sin());

        for i in 0..frames {
            let lfsum = lsplit_lf[i] + rsplit_lf[i];
            let hfsum = lsplit_hf[i] + rsplit_hf[i];
            let side = lsplit_lf[i] + lsplit_hf[i] - rsplit_lf[i] - rsplit_hf[i];

            let mid = lfsum * lf_cos + hfsum * hf_cos;
            let center = lfsum * lf_sin + hfsum * hf_sin;

            // Center adds to whatever is already there; left/right replace.
            buffer[lidx][i] = (mid + side) * 0.5;
            buffer[ridx][i] = (mid - side) * 0.5;
            buffer[cidx][i] += center * 0.5;
        }
    }
}

/// Built-in decode matrix for a speaker layout: (output index, row) pairs
/// with rows in the dry bus's 2D channel order. The coefficients are the
/// stock pseudoinverse matrices for the standard ITU speaker angles.
pub fn layout_rows(layout: ChannelLayout) -> Vec<(usize, [f32; MAX_AMBI2D_COEFFS])> {
    let channels = layout.channels();
    let pos = |ch: Channel| channels.iter().position(|&have| have == ch).unwrap();
    let row = |coeffs: &[f32]| {
        let mut full = [0.0f32; MAX_AMBI2D_COEFFS];
        full[..coeffs.len()].copy_from_slice(coeffs);
        full
    };
    use Channel::*;
    match layout {
        ChannelLayout::Mono => vec![(pos(FrontCenter), row(&[1.0]))],
        ChannelLayout::Stereo => vec![
            (pos(FrontLeft), row(&[5.000_000_0e-1, 2.886_751_3e-1, 5.523_056_4e-2])),
            (pos(FrontRight), row(&[5.000_000_0e-1, -2.886_751_3e-1, 5.523_056_4e-2])),
        ],
        ChannelLayout::Quad => vec![
            (pos(BackLeft), row(&[3.535_533_9e-1, 2.041_241_5e-1, -2.041_241_5e-1])),
            (pos(FrontLeft), row(&[3.535_533_9e-1, 2.041_241_5e-1, 2.041_241_5e-1])),
            (pos(FrontRight), row(&[3.535_533_9e-1, -2.041_241_5e-1, 2.041_241_5e-1])),
            (pos(BackRight), row(&[3.535_533_9e-1, -2.041_241_5e-1, -2.041_241_5e-1])),
        ],
        ChannelLayout::X51 => vec![
            (pos(SideLeft), row(&[3.330_007_8e-1, 1.890_848_0e-1, -2.000_423_8e-1, -2.123_077_7e-2, -1.145_798_9e-2])),
            (pos(FrontLeft), row(&[1.885_428_6e-1, 1.277_092_9e-1, 1.662_957_0e-1, 7.305_715_2e-2, 2.109_011_8e-2])),
            (pos(FrontRight), row(&[1.885_428_6e-1, -1.277_092_9e-1, 1.662_957_0e-1, -7.305_715_2e-2, 2.109_011_8e-2])),
            (pos(SideRight), row(&[3.330_007_8e-1, -1.890_848_0e-1, -2.000_423_8e-1, 2.123_077_7e-2, -1.145_798_9e-2])),
        ],
        ChannelLayout::X51Rear => vec![
            (pos(BackLeft), row(&[3.330_007_8e-1, 1.890_848_0e-1, -2.000_423_8e-1, -2.123_077_7e-2, -1.145_798_9e-2])),
            (pos(FrontLeft), row(&[1.885_428_6e-1, 1.277_092_9e-1, 1.662_957_0e-1, 7.305_715_2e-2, 2.109_011_8e-2])),
            (pos(FrontRight), row(&[1.885_428_6e-1, -1.277_092_9e-1, 1.662_957_0e-1, -7.305_715_2e-2, 2.109_011_8e-2])),
            (pos(BackRight), row(&[3.330_007_8e-1, -1.890_848_0e-1, -2.000_423_8e-1, 2.123_077_7e-2, -1.145_798_9e-2])),
        ],
        ChannelLayout::X61 => vec![
            (pos(SideLeft), row(&[2.044_603_4e-1, 2.171_779_3e-1, -4.399_967_8e-2, -2.607_902_7e-2, -6.872_398_0e-2])),
            (pos(FrontLeft), row(&[1.589_231_6e-1, 9.217_726_8e-2, 1.596_588_0e-1, 6.662_780_8e-2, 3.846_868_5e-2])),
            (pos(FrontRight), row(&[1.589_231_6e-1, -9.217_726_8e-2, 1.596_588_0e-1, -6.662_780_8e-2, 3.846_868_5e-2])),
            (pos(SideRight), row(&[2.044_603_4e-1, -2.171_779_3e-1, -4.399_967_8e-2, 2.607_902_7e-2, -6.872_398_0e-2])),
            (pos(BackCenter), row(&[2.500_016_9e-1, 0.0, -2.500_000_9e-1, 0.0, 6.051_334_0e-2])),
        ],
        ChannelLayout::X71 => vec![
            (pos(BackLeft), row(&[2.041_241_5e-1, 1.088_802_5e-1, -1.885_861_2e-1, -1.290_994_4e-1, 7.453_559_9e-2, 3.734_607_9e-2, 0.0])),
            (pos(SideLeft), row(&[2.041_241_5e-1, 2.177_605_0e-1, 0.0, 0.0, -1.490_712_0e-1, -3.734_607_9e-2, 0.0])),
            (pos(FrontLeft), row(&[2.041_241_5e-1, 1.088_802_5e-1, 1.885_861_2e-1, 1.290_994_4e-1, 7.453_559_9e-2, 3.734_607_9e-2, 0.0])),
            (pos(FrontRight), row(&[2.041_241_5e-1, -1.088_802_5e-1, 1.885_861_2e-1, -1.290_994_4e-1, 7.453_559_9e-2, -3.734_607_9e-2, 0.0])),
            (pos(SideRight), row(&[2.041_241_5e-1, -2.177_605_0e-1, 0.0, 0.0, -1.490_712_0e-1, 3.734_607_9e-2, 0.0])),
            (pos(BackRight), row(&[2.041_241_5e-1, -1.088_802_5e-1, -1.885_861_2e-1, 1.290_994_4e-1, 7.453_559_9e-2, -3.734_607_9e-2, 0.0])),
        ],
        ChannelLayout::Ambi3D => Vec::new(),
    }
}

/// 2D ambisonic coefficients the built-in matrix for a layout consumes.
pub fn layout_coeff_count(layout: ChannelLayout) -> usize {
    match layout {
        ChannelLayout::Mono => 1,
        ChannelLayout::Stereo | ChannelLayout::Quad => 3,
        ChannelLayout::X51 | ChannelLayout::X51Rear | ChannelLayout::X61 => 5,
        ChannelLayout::X71 => 7,
        ChannelLayout::Ambi3D => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::assert_close;

    fn bus(channels: usize, frames: usize) -> Vec<Vec<f32>> {
        vec![vec![0.0f32; frames]; channels]
    }

    fn stereo_decoder() -> BFormatDec {
        BFormatDec::from_matrix(
            3,
            UPSAMPLE_XOVER_FREQ / 44100.0,
            &layout_rows(ChannelLayout::Stereo),
            2,
        )
    }

    #[test]
    fn w_only_signal_spreads_evenly() {
        let mut dec = stereo_decoder();
        let frames = 64;
        let mut input = bus(3, frames);
        input[0].iter_mut().for_each(|s| *s = 1.0);
        let mut output = bus(2, frames);
        dec.process(&mut output, &input, frames);
        for i in 0..frames {
            assert_close(output[0][i], output[1][i], 1e-6);
            assert_close(output[0][i], 0.5, 1e-6);
        }
    }

    #[test]
    fn silence_decodes_to_silence() {
        let mut dec = stereo_decoder();
        let frames = 128;
        let input = bus(3, frames);
        let mut output = bus(2, frames);
        dec.process(&mut output, &input, frames);
        assert!(output.iter().flatten().all(|&s| s == 0.0));
    }

    #[test]
    fn preset_speaker_map_substitutes_side_rear() {
        let preset = DecoderPreset {
            speakers: vec![
                SpeakerConf {
                    name: "LB".into(),
                    distance: 1.0,
                    hf_row: vec![0.3; 3],
                    lf_row: vec![0.3; 3],
                },
                SpeakerConf {
                    name: "RB".into(),
                    distance: 1.0,
                    hf_row: vec![0.3; 3],
                    lf_row: vec![0.3; 3],
                },
            ],
            chan_mask: 0b1011,
            freq_bands: 1,
            xover_freq: 400.0,
            xover_ratio: 0.0,
            coeff_scale: AmbiNorm::N3D,
            hf_order_gain: [1.0; 4],
            lf_order_gain: [1.0; 4],
        };
        // On plain 5.1 the "back" labels land on the side speakers.
        let channels = ChannelLayout::X51.channels();
        let map = make_speaker_map(ChannelLayout::X51, channels, &preset).unwrap();
        assert_eq!(channels[map[0]], Channel::SideLeft);
        assert_eq!(channels[map[1]], Channel::SideRight);
    }

    #[test]
    fn unknown_speaker_label_is_rejected() {
        let preset = DecoderPreset {
            speakers: vec![SpeakerConf {
                name: "XX".into(),
                distance: 1.0,
                hf_row: vec![0.3; 3],
                lf_row: vec![0.3; 3],
            }],
            chan_mask: 0b1011,
            freq_bands: 1,
            xover_freq: 400.0,
            xover_ratio: 0.0,
            coeff_scale: AmbiNorm::N3D,
            hf_order_gain: [1.0; 4],
            lf_order_gain: [1.0; 4],
        };
        let channels = ChannelLayout::Stereo.channels();
        assert!(make_speaker_map(ChannelLayout::Stereo, channels, &preset).is_err());
    }

    #[test]
    fn upsampled_foa_reaches_higher_order_bus() {
        let mut dec = stereo_decoder();
        let frames = 256;
        let mut foa = bus(4, frames);
        foa[0].iter_mut().for_each(|s| *s = 0.25);
        let mut hoa = bus(9, frames);
        dec.up_sample(&mut hoa, &foa, frames);
        // W content lands on the bus W channel; after the split settles the
        // DC sits in the LF band with unity counter-scale.
        let tail = hoa[0][frames - 1];
        assert_close(tail, 0.25, 5e-2);
        assert!(hoa[4..].iter().flatten().all(|&s| s == 0.0));
    }

    #[test]
    fn stabilizer_preserves_silence() {
        let mut stab = FrontStabilizer::new(6, 44100);
        let mut buffer = bus(6, 64);
        stab.apply(&mut buffer, 0, 1, 2, 64);
        assert!(buffer.iter().flatten().all(|&s| s == 0.0));
    }

    #[test]
    fn stabilizer_moves_correlated_content_to_center() {
        let mut stab = FrontStabilizer::new(6, 44100);
        let frames = 512;
        let mut buffer = bus(6, frames);
        for i in 0..frames {
            let s = (i as f32 * 0.21).sin();
            buffer[0][i] = s;
            buffer[1][i] = s;
        }
        stab.apply(&mut buffer, 0, 1, 2, frames);
        let center_energy: f32 = buffer[2].iter().map(|s| s * s).sum();
        assert!(center_energy > 0.0, "center channel should receive the sum");
        // Fully correlated input has no side component, so L equals R.
        for i in 0..frames {
            assert_close(buffer[0][i], buffer[1][i], 1e-5);
        }
    }
}
