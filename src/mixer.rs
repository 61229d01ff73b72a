//! Per-voice rendering: resample, filter, and accumulate into the buses.
//!
//! Rendering a voice is split into passes so the driver can borrow one
//! destination at a time: [`render_voice_channels`] stages and resamples
//! every input channel into a caller-owned cache (advancing playback
//! state), then [`mix_voice_direct`] filters and accumulates the direct
//! path and [`mix_voice_send`] does the same per auxiliary send. HRTF
//! voices convolve into the real left/right pair, interpolating
//! coefficients and delays toward their targets across the quantum.

use std::cell::RefCell;

use crate::hrtf::{HRIR_LENGTH, HRTF_HISTORY_LENGTH};
use crate::math::{BUFFER_SIZE, FRACTION_BITS, FRACTION_MASK};
use crate::resample::{resample, MAX_RESAMPLER_PADDING};
use crate::voice::{
    MixTarget, TargetGains, Voice, VoiceHrtfState, FILTER_HIGH_PASS, FILTER_LOW_PASS,
    MAX_OUTPUT_CHANNELS,
};

// Scratch for staging and filtering; thread-local so the mixer allocates
// at most once per thread.
thread_local! {
    static STAGING: RefCell<Vec<f32>> = RefCell::new(Vec::new());
    static FILTERED: RefCell<Vec<f32>> = RefCell::new(Vec::new());
    static NFC_SCRATCH: RefCell<Vec<f32>> = RefCell::new(Vec::new());
}

/// Stage and resample `frames` samples of every input channel into
/// `cache`, advancing the playback position. Gains snap to their targets
/// on a voice's first quantum instead of ramping from stale values.
///
/// Returns false once the queue ran dry on a non-looping voice; the tail
/// of the cache is silence padding and the caller should retire the voice
/// after mixing it.
pub fn render_voice_channels(voice: &mut Voice, cache: &mut [Vec<f32>], frames: usize) -> bool {
    debug_assert!(frames <= BUFFER_SIZE);
    if voice.queue.is_empty() {
        return false;
    }
    if voice.step == 0 {
        // A fully doppler-compressed voice plays silence but stays alive.
        for chan in cache.iter_mut() {
            chan[..frames].fill(0.0);
        }
        return true;
    }

    let num_channels = active_channels(voice);
    if num_channels == 0 {
        // Parameters not computed yet (updates held); stay silent.
        for chan in cache.iter_mut() {
            chan[..frames].fill(0.0);
        }
        return true;
    }

    if voice.fresh {
        for chan in voice.direct.params.iter_mut().take(num_channels) {
            chan.gains.current = chan.gains.target;
            chan.hrtf.current = chan.hrtf.target;
        }
        for send in voice.sends.iter_mut() {
            for chan in send.params.iter_mut().take(num_channels) {
                chan.gains.current = chan.gains.target;
            }
        }
        voice.fresh = false;
    }

    let total_advance =
        ((voice.position_frac as u64 + voice.step as u64 * frames as u64) >> FRACTION_BITS)
            as usize;
    let src_needed = total_advance + MAX_RESAMPLER_PADDING + 1;

    let mut exhausted = false;
    STAGING.with(|staging_cell| {
        let mut staging = staging_cell.borrow_mut();
        staging.resize(MAX_RESAMPLER_PADDING + src_needed, 0.0);

        for chan in 0..num_channels {
            staging[..MAX_RESAMPLER_PADDING].copy_from_slice(&voice.prev_samples[chan]);
            let copied = gather_source(voice, chan, &mut staging[MAX_RESAMPLER_PADDING..]);
            if copied < src_needed && !voice.props.looping {
                exhausted = true;
            }

            resample(
                voice.resampler,
                &voice.bsinc,
                &staging,
                MAX_RESAMPLER_PADDING,
                voice.position_frac,
                voice.step,
                &mut cache[chan][..frames],
            );

            voice.prev_samples[chan].copy_from_slice(
                &staging[total_advance..total_advance + MAX_RESAMPLER_PADDING],
            );
        }
    });

    advance_position(voice, total_advance);
    let frac = voice.position_frac as u64 + voice.step as u64 * frames as u64;
    voice.position_frac = (frac & FRACTION_MASK as u64) as u32;

    !exhausted
}

/// Input channels the voice renders, bounded by its buffer content.
pub fn active_channels(voice: &Voice) -> usize {
    if voice.queue.is_empty() {
        return 0;
    }
    let buffer = voice.queue_index.min(voice.queue.len() - 1);
    voice
        .direct
        .channel_count
        .min(voice.queue[buffer].format().channels())
        .min(voice.direct.params.len())
}

/// Filter and accumulate the cached channels into the direct target.
/// `real_left`/`real_right` index the binaural pair for HRTF voices.
pub fn mix_voice_direct(
    voice: &mut Voice,
    cache: &[Vec<f32>],
    direct: &mut [Vec<f32>],
    real_left: usize,
    real_right: usize,
    frames: usize,
) {
    if voice.step == 0 {
        return;
    }
    let num_channels = active_channels(voice).min(cache.len());
    FILTERED.with(|filtered_cell| {
        let mut filtered = filtered_cell.borrow_mut();
        filtered.resize(frames, 0.0);

        for chan in 0..num_channels {
            let mask = voice.direct.filter_mask;
            {
                let chan_params = &mut voice.direct.params[chan];
                apply_filters(
                    mask,
                    &mut chan_params.low_pass,
                    &mut chan_params.high_pass,
                    &mut filtered[..frames],
                    &cache[chan][..frames],
                );
            }

            if voice.has_hrtf {
                mix_hrtf_channel(
                    &mut voice.direct.params[chan].hrtf,
                    direct,
                    real_left,
                    real_right,
                    &filtered[..frames],
                    frames,
                );
            } else if voice.has_nfc && voice.direct.target != MixTarget::Real {
                mix_nfc_channel(voice, chan, direct, &filtered[..frames], frames);
            } else {
                let gains = &mut voice.direct.params[chan].gains;
                mix_ramped(direct, gains, &filtered[..frames], frames, 0, usize::MAX);
            }
        }
    });
}

/// Filter and accumulate the cached channels into one send's wet bus.
pub fn mix_voice_send(
    voice: &mut Voice,
    send_idx: usize,
    cache: &[Vec<f32>],
    wet: &mut [Vec<f32>],
    frames: usize,
) {
    if voice.step == 0 {
        return;
    }
    let num_channels = active_channels(voice).min(cache.len());
    FILTERED.with(|filtered_cell| {
        let mut filtered = filtered_cell.borrow_mut();
        filtered.resize(frames, 0.0);

        let send = &mut voice.sends[send_idx];
        let mask = send.filter_mask;
        for chan in 0..num_channels.min(send.params.len()) {
            {
                let chan_params = &mut send.params[chan];
                apply_filters(
                    mask,
                    &mut chan_params.low_pass,
                    &mut chan_params.high_pass,
                    &mut filtered[..frames],
                    &cache[chan][..frames],
                );
            }
            mix_ramped(
                wet,
                &mut send.params[chan].gains,
                &filtered[..frames],
                frames,
                0,
                usize::MAX,
            );
        }
    });
}

/// Copy source frames for `chan` starting at the voice's position into
/// `dst`, following the queue and wrapping when looping. Returns how many
/// real (non-padding) samples were written; the rest is zero filled.
fn gather_source(voice: &Voice, chan: usize, dst: &mut [f32]) -> usize {
    let mut written = 0usize;
    let mut queue_index = voice.queue_index;
    let mut position = voice.position;

    while written < dst.len() {
        if queue_index >= voice.queue.len() {
            if voice.props.looping && !voice.queue.is_empty() {
                queue_index = 0;
                position = 0;
                continue;
            }
            break;
        }
        let buffer = &voice.queue[queue_index];
        let channels = buffer.format().channels();
        let read_chan = chan.min(channels - 1);
        let frames_left = buffer.frames().saturating_sub(position);
        let todo = frames_left.min(dst.len() - written);
        for i in 0..todo {
            dst[written + i] = buffer.sample(position + i, read_chan);
        }
        written += todo;
        position += todo;
        if position >= buffer.frames() {
            queue_index += 1;
            position = 0;
        }
    }

    dst[written..].fill(0.0);
    written
}

/// Walk the playback position forward by `frames`, hopping queue entries
/// and wrapping for looping sources.
fn advance_position(voice: &mut Voice, frames: usize) {
    let mut remaining = frames;
    loop {
        if voice.queue_index >= voice.queue.len() {
            if voice.props.looping && !voice.queue.is_empty() {
                voice.queue_index = 0;
                voice.position = 0;
            } else {
                voice.queue_index = voice.queue.len();
                voice.position = 0;
                return;
            }
        }
        let frames_left = voice.queue[voice.queue_index]
            .frames()
            .saturating_sub(voice.position);
        if remaining < frames_left {
            voice.position += remaining;
            return;
        }
        remaining -= frames_left;
        voice.queue_index += 1;
        voice.position = 0;
    }
}

fn apply_filters(
    mask: u8,
    low_pass: &mut crate::filters::BiquadFilter,
    high_pass: &mut crate::filters::BiquadFilter,
    dst: &mut [f32],
    src: &[f32],
) {
    match (mask & FILTER_LOW_PASS != 0, mask & FILTER_HIGH_PASS != 0) {
        (true, true) => {
            low_pass.process(dst, src);
            for sample in dst.iter_mut() {
                *sample = high_pass.process_one(*sample);
            }
        }
        (true, false) => {
            low_pass.process(dst, src);
            high_pass.passthru(src.len());
        }
        (false, true) => {
            high_pass.process(dst, src);
            low_pass.passthru(src.len());
        }
        (false, false) => {
            dst.copy_from_slice(src);
            low_pass.passthru(src.len());
            high_pass.passthru(src.len());
        }
    }
}

/// Accumulate `src` into every output channel whose current or target
/// gain is live, ramping linearly across the quantum. Channels outside
/// `[chan_offset, chan_offset + chan_limit)` are skipped (used by the
/// near-field path to mix one order band at a time).
fn mix_ramped(
    output: &mut [Vec<f32>],
    gains: &mut TargetGains,
    src: &[f32],
    frames: usize,
    chan_offset: usize,
    chan_limit: usize,
) {
    const SILENCE: f32 = 1e-10;
    let end = output
        .len()
        .min(MAX_OUTPUT_CHANNELS)
        .min(chan_offset.saturating_add(chan_limit));
    for out_idx in chan_offset..end {
        let current = gains.current[out_idx];
        let target = gains.target[out_idx];
        if current.abs() < SILENCE && target.abs() < SILENCE {
            gains.current[out_idx] = target;
            continue;
        }
        let out = &mut output[out_idx];
        if (target - current).abs() < SILENCE {
            for (out_sample, &in_sample) in out.iter_mut().zip(src.iter()).take(frames) {
                *out_sample += in_sample * target;
            }
        } else {
            let step = (target - current) / frames as f32;
            let mut gain = current;
            for (out_sample, &in_sample) in out.iter_mut().zip(src.iter()).take(frames) {
                gain += step;
                *out_sample += in_sample * gain;
            }
        }
        gains.current[out_idx] = target;
    }
}

/// Near-field mixing: order 0 mixes the signal untouched, each higher
/// order mixes a progressively shelf-compensated copy into its band of
/// bus channels.
fn mix_nfc_channel(
    voice: &mut Voice,
    chan: usize,
    output: &mut [Vec<f32>],
    src: &[f32],
    frames: usize,
) {
    NFC_SCRATCH.with(|scratch_cell| {
        let mut scratch = scratch_cell.borrow_mut();
        scratch.resize(frames, 0.0);

        let channels_per_order = voice.direct.channels_per_order;
        let params = &mut voice.direct.params[chan];

        let mut offset = channels_per_order[0];
        mix_ramped(output, &mut params.gains, src, frames, 0, offset);

        for (order, &count) in channels_per_order.iter().enumerate().skip(1) {
            if count == 0 {
                break;
            }
            scratch[..frames].copy_from_slice(src);
            params.nfc.process_order(order, &mut scratch[..frames]);
            mix_ramped(output, &mut params.gains, &scratch[..frames], frames, offset, count);
            offset += count;
        }
    });
}

/// Convolve one input channel against its interpolating binaural filter,
/// accumulating into the real output pair.
fn mix_hrtf_channel(
    hrtf: &mut VoiceHrtfState,
    output: &mut [Vec<f32>],
    left_idx: usize,
    right_idx: usize,
    src: &[f32],
    frames: usize,
) {
    const HISTORY_MASK: usize = HRTF_HISTORY_LENGTH - 1;
    debug_assert!(left_idx != right_idx);
    let inv_frames = 1.0 / frames as f32;

    let mut offset = hrtf.offset;
    for (i, &input) in src.iter().enumerate().take(frames) {
        hrtf.history[offset & HISTORY_MASK] = input;
        let t = (i + 1) as f32 * inv_frames;

        let gain = hrtf.current.gain + (hrtf.target.gain - hrtf.current.gain) * t;
        let mut acc = [0.0f32; 2];
        for (ear, acc_value) in acc.iter_mut().enumerate() {
            let delay_now = hrtf.current.delays[ear] as f32
                + (hrtf.target.delays[ear] as f32 - hrtf.current.delays[ear] as f32) * t;
            let delay = delay_now.round() as usize;
            let read_base = offset.wrapping_sub(delay);
            for tap in 0..HRIR_LENGTH {
                let coeff = hrtf.current.coeffs[tap][ear]
                    + (hrtf.target.coeffs[tap][ear] - hrtf.current.coeffs[tap][ear]) * t;
                if coeff == 0.0 {
                    continue;
                }
                *acc_value += coeff * hrtf.history[read_base.wrapping_sub(tap) & HISTORY_MASK];
            }
        }

        output[left_idx][i] += acc[0] * gain;
        output[right_idx][i] += acc[1] * gain;
        offset = offset.wrapping_add(1);
    }
    hrtf.offset = offset & HISTORY_MASK;
    hrtf.current = hrtf.target;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{assert_close, FRACTION_ONE};
    use crate::source::{AudioBuffer, BufferFormat, SourceProps};
    use crate::voice::{DirectChannelParams, SendChannelParams, VoiceDirect, VoiceSend};

    fn cache(frames: usize) -> Vec<Vec<f32>> {
        vec![vec![0.0f32; frames]; 2]
    }

    fn simple_voice(samples: Vec<f32>, looping: bool) -> Voice {
        let buffer = AudioBuffer::new(samples, BufferFormat::Mono, 44100).unwrap();
        let mut props = SourceProps::default();
        props.looping = looping;
        let mut voice = Voice {
            props,
            queue: vec![buffer],
            queue_index: 0,
            position: 0,
            position_frac: 0,
            step: FRACTION_ONE,
            resampler: crate::resample::Resampler::Point,
            bsinc: Default::default(),
            has_hrtf: false,
            has_nfc: false,
            fresh: true,
            direct: VoiceDirect {
                channel_count: 1,
                params: vec![DirectChannelParams::default(); 2],
                ..Default::default()
            },
            sends: vec![VoiceSend {
                params: vec![SendChannelParams::default(); 2],
                ..Default::default()
            }],
            prev_samples: vec![[0.0; MAX_RESAMPLER_PADDING]; 2],
        };
        voice.direct.params[0].gains.target[0] = 1.0;
        voice
    }

    fn render_and_mix(voice: &mut Voice, bufs: &mut [Vec<f32>], frames: usize) -> bool {
        let mut channel_cache = cache(frames);
        let alive = render_voice_channels(voice, &mut channel_cache, frames);
        mix_voice_direct(voice, &channel_cache, bufs, 0, 1, frames);
        alive
    }

    #[test]
    fn unit_gain_point_playback_is_bit_exact() {
        let src: Vec<f32> = (0..64).map(|i| (i as f32 * 0.37).sin()).collect();
        let mut voice = simple_voice(src.clone(), false);
        let mut bufs = vec![vec![0.0f32; 64], vec![0.0f32; 64]];
        let alive = render_and_mix(&mut voice, &mut bufs, 64);
        for (got, want) in bufs[0].iter().zip(src.iter()) {
            assert_eq!(got, want);
        }
        assert!(bufs[1].iter().all(|&s| s == 0.0));
        // Queue drained exactly: the voice reports exhaustion.
        assert!(!alive);
    }

    #[test]
    fn looping_voice_wraps_and_stays_alive() {
        let src: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let mut voice = simple_voice(src, true);
        let mut bufs = vec![vec![0.0f32; 40], vec![0.0f32; 40]];
        let alive = render_and_mix(&mut voice, &mut bufs, 40);
        assert!(alive);
        for i in 0..40 {
            assert_close(bufs[0][i], (i % 16) as f32, 1e-6);
        }
        assert_eq!(voice.position, 40 % 16);
    }

    #[test]
    fn exhausted_voice_pads_with_silence() {
        let src = vec![1.0f32; 10];
        let mut voice = simple_voice(src, false);
        let mut bufs = vec![vec![0.0f32; 32], vec![0.0f32; 32]];
        let alive = render_and_mix(&mut voice, &mut bufs, 32);
        assert!(!alive);
        for i in 0..10 {
            assert_close(bufs[0][i], 1.0, 1e-6);
        }
        for i in 10..32 {
            assert_close(bufs[0][i], 0.0, 1e-6);
        }
    }

    #[test]
    fn gain_ramp_is_linear_across_quantum() {
        let src = vec![1.0f32; 32];
        let mut voice = simple_voice(src, true);
        // Prime the current gain, then ramp to a different target.
        voice.fresh = false;
        voice.direct.params[0].gains.current[0] = 0.0;
        voice.direct.params[0].gains.target[0] = 1.0;
        let mut bufs = vec![vec![0.0f32; 32], vec![0.0f32; 32]];
        render_and_mix(&mut voice, &mut bufs, 32);
        // Sample k carries gain (k+1)/32.
        for (k, &sample) in bufs[0].iter().enumerate() {
            assert_close(sample, (k + 1) as f32 / 32.0, 1e-5);
        }
        assert_close(voice.direct.params[0].gains.current[0], 1.0, 1e-6);
    }

    #[test]
    fn step_zero_emits_silence_and_survives() {
        let src = vec![1.0f32; 16];
        let mut voice = simple_voice(src, false);
        voice.step = 0;
        let mut bufs = vec![vec![0.0f32; 16], vec![0.0f32; 16]];
        assert!(render_and_mix(&mut voice, &mut bufs, 16));
        assert!(bufs[0].iter().all(|&s| s == 0.0));
        assert_eq!(voice.position, 0);
    }

    #[test]
    fn double_speed_reads_every_other_sample() {
        let src: Vec<f32> = (0..64).map(|i| i as f32).collect();
        let mut voice = simple_voice(src, false);
        voice.step = 2 * FRACTION_ONE;
        let mut bufs = vec![vec![0.0f32; 16], vec![0.0f32; 16]];
        render_and_mix(&mut voice, &mut bufs, 16);
        for (k, &sample) in bufs[0].iter().enumerate() {
            assert_close(sample, (2 * k) as f32, 1e-6);
        }
        assert_eq!(voice.position, 32);
    }

    #[test]
    fn send_mixes_into_wet_buffer() {
        let src = vec![0.5f32; 16];
        let mut voice = simple_voice(src, true);
        voice.sends[0].slot = Some(0);
        voice.sends[0].channel_count = 1;
        voice.sends[0].params[0].gains.target[0] = 1.0;
        let mut channel_cache = cache(16);
        render_voice_channels(&mut voice, &mut channel_cache, 16);
        let mut wet = vec![vec![0.0f32; 16]];
        mix_voice_send(&mut voice, 0, &channel_cache, &mut wet, 16);
        for &sample in &wet[0] {
            assert_close(sample, 0.5, 1e-6);
        }
    }

    #[test]
    fn state_carries_across_quanta() {
        let src: Vec<f32> = (0..96).map(|i| i as f32).collect();
        let mut voice = simple_voice(src, false);
        let mut first = vec![vec![0.0f32; 48], vec![0.0f32; 48]];
        assert!(render_and_mix(&mut voice, &mut first, 48));
        let mut second = vec![vec![0.0f32; 48], vec![0.0f32; 48]];
        render_and_mix(&mut voice, &mut second, 48);
        for i in 0..48 {
            assert_close(first[0][i], i as f32, 1e-6);
            assert_close(second[0][i], (48 + i) as f32, 1e-6);
        }
    }

    #[test]
    fn hrtf_coefficients_interpolate_linearly() {
        // One tap, no delay: each output sample carries the coefficient's
        // momentary value, which must sit on the segment between current
        // and target.
        let mut hrtf = crate::voice::VoiceHrtfState::default();
        hrtf.current.gain = 1.0;
        hrtf.target.gain = 1.0;
        hrtf.target.coeffs[0] = [1.0, 1.0];
        let src = vec![1.0f32; 32];
        let mut out = vec![vec![0.0f32; 32], vec![0.0f32; 32]];
        mix_hrtf_channel(&mut hrtf, &mut out, 0, 1, &src, 32);
        for (i, &sample) in out[0].iter().enumerate() {
            let expect = (i + 1) as f32 / 32.0;
            assert_close(sample, expect, 1e-5);
        }
        // The frame end lands on the target and stays there.
        assert_close(hrtf.current.coeffs[0][0], 1.0, 0.0);
    }

    #[test]
    fn filtered_voice_attenuates_highs() {
        use crate::filters::{calc_rcp_q_from_slope, BiquadType};
        // A high tone near Nyquist through a -12dB high shelf.
        let src: Vec<f32> = (0..256)
            .map(|i| (std::f32::consts::PI * 0.9 * i as f32).sin())
            .collect();
        let mut voice = simple_voice(src.clone(), false);
        voice.direct.filter_mask = FILTER_LOW_PASS;
        voice.direct.params[0].low_pass.set_params(
            BiquadType::HighShelf,
            0.25,
            0.1,
            calc_rcp_q_from_slope(0.25, 1.0),
        );
        let mut bufs = vec![vec![0.0f32; 256], vec![0.0f32; 256]];
        render_and_mix(&mut voice, &mut bufs, 256);
        let peak_in = src.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
        let peak_out = bufs[0][128..].iter().fold(0.0f32, |m, &s| m.max(s.abs()));
        assert!(peak_out < peak_in * 0.5);
    }
}
