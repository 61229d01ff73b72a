//! Output device: mixing buses, post-processing selection, and the render
//! quantum driver.
//!
//! `mix_data` is the render contract: it fills interleaved samples of the
//! device format, driving updates, voice mixing, effects, post stages,
//! and output conversion in frame blocks of at most `BUFFER_SIZE`. The
//! whole quantum runs on the caller's (audio) thread; the device mix lock
//! is only ever taken by that thread, while API threads communicate
//! through the contexts' update slots and atomics.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::ambi::{self, BFChannelConfig};
use crate::bformatdec::{
    layout_coeff_count, layout_rows, make_speaker_map, AmbiUpsampler, BFormatDec, DecoderPreset,
    FrontStabilizer, UPSAMPLE_XOVER_FREQ,
};
use crate::bs2b::Bs2b;
use crate::calc::{calc_source_params, CalcDevice, SendTarget};
use crate::config::{DeviceDesc, EngineConfig, StereoMode};
use crate::context::{ContextMix, ContextShared, SlotShared};
use crate::devformat::{AmbiLayout, AmbiNorm, Channel, ChannelLayout, RenderMode, SampleType};
use crate::effects::{EffectTarget, SlotMixState, SlotParams};
use crate::error::{IrisonicError, Result};
use crate::events::{AsyncEvent, DisconnectMsg, EVENT_TYPE_DISCONNECTED};
use crate::hrtf::{
    build_bformat_hrtf, mix_direct_hrtf, DirectHrtfState, HrtfStore, AMBI_ORDER_HF_GAIN_FOA,
};
use crate::math::{BUFFER_SIZE, SPEED_OF_SOUND_METERS_PER_SEC};
use crate::mixer::{mix_voice_direct, mix_voice_send, render_voice_channels};
use crate::output::{apply_dither, write_interleaved};
use crate::source::MAX_SENDS;
use crate::uhj::Uhj2Encoder;
use crate::voice::{MixTarget, MAX_INPUT_CHANNELS};

/// Hard-knee peak limiter keeping the mix inside the converter's range.
pub struct Compressor {
    ceiling: f32,
    attack_coeff: f32,
    release_coeff: f32,
    envelope: f32,
}

impl Compressor {
    pub fn new(srate: u32, ceiling: f32) -> Self {
        let fs = srate as f32;
        Self {
            ceiling,
            // ~1ms attack, ~200ms release.
            attack_coeff: (-1.0 / (0.001 * fs)).exp(),
            release_coeff: (-1.0 / (0.2 * fs)).exp(),
            envelope: 0.0,
        }
    }

    pub fn process(&mut self, buffers: &mut [Vec<f32>], frames: usize) {
        for i in 0..frames {
            let mut peak = 0.0f32;
            for chan in buffers.iter() {
                peak = peak.max(chan[i].abs());
            }
            let coeff = if peak > self.envelope {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.envelope = peak + (self.envelope - peak) * coeff;

            if self.envelope > self.ceiling {
                let gain = self.ceiling / self.envelope;
                for chan in buffers.iter_mut() {
                    chan[i] *= gain;
                }
            }
        }
    }
}

/// Fixed integer-sample delay plus gain per output channel, compensating
/// mismatched speaker distances.
struct ChannelDelay {
    gain: f32,
    /// Delay line; empty when this channel needs no delay.
    buffer: Vec<f32>,
}

enum PostProcess {
    Hrtf {
        state: DirectHrtfState,
    },
    AmbiDec {
        decoder: BFormatDec,
    },
    AmbiUp {
        upsampler: AmbiUpsampler,
    },
    Uhj {
        encoder: Uhj2Encoder,
    },
    Bs2b {
        decoder: BFormatDec,
        filter: Bs2b,
    },
    None,
}

/// Mixer-thread-owned device state.
struct DeviceMixState {
    dry_map: Vec<BFChannelConfig>,
    dry_bufs: Vec<Vec<f32>>,
    /// First-order bus map; aliases the head of the dry bus when no
    /// dedicated first-order bus exists.
    foa_map: Vec<BFChannelConfig>,
    foa_bufs: Vec<Vec<f32>>,
    real_bufs: Vec<Vec<f32>>,
    post: PostProcess,
    stabilizer: Option<FrontStabilizer>,
    limiter: Option<Compressor>,
    channel_delay: Vec<ChannelDelay>,
    delay_scratch: Vec<f32>,
    channel_cache: Vec<Vec<f32>>,
    dither_seed: u32,
    dither_depth: f32,
    render_mode: RenderMode,
    avg_speaker_dist: f32,
    channels_per_order: [usize; 4],
}

pub struct Device {
    desc: DeviceDesc,
    config: EngineConfig,
    connected: AtomicBool,
    /// Odd while a render quantum is in flight; two equal even reads
    /// bracket a quantum-free window.
    mix_count: AtomicU32,
    samples_done: AtomicU32,
    clock_base_sec: AtomicU64,
    contexts: Mutex<Vec<Arc<ContextShared>>>,
    mix: Mutex<DeviceMixState>,
    real_channels: Vec<Channel>,
    real_left: usize,
    real_right: usize,
    num_sends: usize,
    hrtf: Option<Arc<HrtfStore>>,
}

impl Device {
    pub fn new(desc: DeviceDesc) -> Result<Arc<Self>> {
        Self::with_config(desc, EngineConfig::from_env())
    }

    pub fn with_config(desc: DeviceDesc, config: EngineConfig) -> Result<Arc<Self>> {
        if desc.frequency == 0 {
            return Err(IrisonicError::InvalidParameter(
                "device frequency must be positive".into(),
            ));
        }
        if desc.layout == ChannelLayout::Ambi3D && desc.ambi_order > 3 {
            return Err(IrisonicError::InvalidParameter(format!(
                "ambisonic order {} not supported",
                desc.ambi_order
            )));
        }
        let num_sends = desc.num_aux_sends.min(MAX_SENDS);

        let real_channels: Vec<Channel> = desc.layout.channels().to_vec();
        let find = |ch: Channel| real_channels.iter().position(|&have| have == ch);
        let real_left = find(Channel::FrontLeft).unwrap_or(0);
        let real_right =
            find(Channel::FrontRight).unwrap_or(real_channels.len().saturating_sub(1).max(1));

        let use_hrtf =
            desc.layout == ChannelLayout::Stereo && desc.stereo_mode == StereoMode::Hrtf;
        let hrtf = if use_hrtf {
            Some(Arc::new(HrtfStore::synthetic(desc.frequency)))
        } else {
            None
        };

        // Shared per process; built here so the mixer never has to.
        crate::resample::bsinc12_table();
        crate::resample::bsinc24_table();

        let mix = Self::build_mix_state(&desc, hrtf.as_deref(), &config);

        log::info!(
            "Device ready: {:?} @ {} Hz, {:?}, {} aux sends, render mode {:?}",
            desc.layout,
            desc.frequency,
            desc.sample_type,
            num_sends,
            mix.render_mode,
        );

        Ok(Arc::new(Self {
            desc,
            config,
            connected: AtomicBool::new(true),
            mix_count: AtomicU32::new(0),
            samples_done: AtomicU32::new(0),
            clock_base_sec: AtomicU64::new(0),
            contexts: Mutex::new(Vec::new()),
            mix: Mutex::new(mix),
            real_channels,
            real_left,
            real_right,
            num_sends,
            hrtf,
        }))
    }

    fn build_mix_state(
        desc: &DeviceDesc,
        hrtf: Option<&HrtfStore>,
        config: &EngineConfig,
    ) -> DeviceMixState {
        let bus = |channels: usize| vec![vec![0.0f32; BUFFER_SIZE]; channels];
        let acn_map = |count: usize| -> Vec<BFChannelConfig> {
            (0..count).map(|acn| BFChannelConfig::new(1.0, acn)).collect()
        };
        let map_2d = |count: usize| -> Vec<BFChannelConfig> {
            ambi::index::FROM_2D[..count]
                .iter()
                .map(|&acn| BFChannelConfig::new(1.0, acn))
                .collect()
        };

        let mut state = DeviceMixState {
            dry_map: Vec::new(),
            dry_bufs: Vec::new(),
            foa_map: Vec::new(),
            foa_bufs: Vec::new(),
            real_bufs: bus(desc.layout.channels().len()),
            post: PostProcess::None,
            stabilizer: None,
            limiter: if desc.limiter {
                Some(Compressor::new(desc.frequency, 1.0))
            } else {
                None
            },
            channel_delay: Vec::new(),
            delay_scratch: vec![0.0; BUFFER_SIZE],
            channel_cache: bus(MAX_INPUT_CHANNELS),
            dither_seed: 22_222,
            dither_depth: desc.sample_type.dither_depth(),
            render_mode: RenderMode::Normal,
            avg_speaker_dist: 0.0,
            channels_per_order: [1, 3, 5, 7],
        };

        match desc.layout {
            ChannelLayout::Ambi3D => {
                let count = ambi::channels_for_order(desc.ambi_order as usize);
                let layout_map: &[usize] = match desc.ambi_layout {
                    AmbiLayout::Acn => &ambi::index::FROM_ACN,
                    AmbiLayout::FuMa => &ambi::index::FROM_FUMA,
                };
                let scales: &[f32] = match desc.ambi_norm {
                    AmbiNorm::N3D => &ambi::scale::FROM_N3D,
                    AmbiNorm::SN3D => &ambi::scale::FROM_SN3D,
                    AmbiNorm::FuMa => &ambi::scale::FROM_FUMA,
                };
                state.dry_map = layout_map[..count]
                    .iter()
                    .map(|&acn| BFChannelConfig::new(1.0 / scales[acn], acn))
                    .collect();
                state.dry_bufs = bus(count);
                if desc.ambi_order >= 2 {
                    state.foa_map = acn_map(4);
                    state.foa_bufs = bus(4);
                    state.post = PostProcess::AmbiUp {
                        upsampler: AmbiUpsampler::new(desc.frequency, &state.dry_map),
                    };
                }
                if desc.nfc_ref_delay > 0.0 {
                    let delay = desc.nfc_ref_delay.clamp(0.001, 1000.0);
                    state.avg_speaker_dist = (delay * SPEED_OF_SOUND_METERS_PER_SEC).min(10.0);
                }
                // The bus itself is the output.
                state.real_bufs = Vec::new();
            }
            ChannelLayout::Stereo if desc.stereo_mode == StereoMode::Hrtf => {
                let hrtf = hrtf.expect("HRTF store prepared for HRTF stereo mode");
                state.render_mode = RenderMode::Hrtf;
                state.dry_map = acn_map(4);
                state.dry_bufs = bus(4);
                let mut direct = DirectHrtfState::new(4);
                build_bformat_hrtf(hrtf, &mut direct, 4, &AMBI_ORDER_HF_GAIN_FOA);
                state.post = PostProcess::Hrtf { state: direct };
                state.avg_speaker_dist = hrtf.distance().min(10.0);
                state.channels_per_order = [1, 3, 0, 0];
            }
            ChannelLayout::Stereo if desc.stereo_mode == StereoMode::Uhj => {
                // The encoder wants FuMa-scaled W/X/Y on the bus.
                state.dry_map = ambi::index::FROM_FUMA[..3]
                    .iter()
                    .map(|&acn| BFChannelConfig::new(1.0 / ambi::scale::FROM_FUMA[acn], acn))
                    .collect();
                state.dry_bufs = bus(3);
                state.post = PostProcess::Uhj {
                    encoder: Uhj2Encoder::new(config.uhj_w_boost),
                };
            }
            layout => {
                let mut coeff_count = layout_coeff_count(layout);
                state.dry_map = map_2d(coeff_count);
                if layout == ChannelLayout::Stereo {
                    state.render_mode = RenderMode::StereoPair;
                }

                let decoder = desc
                    .decoder_preset
                    .as_ref()
                    .and_then(|preset| Self::preset_decoder(desc, preset, &mut state));
                let decoder = decoder.unwrap_or_else(|| {
                    // Built-in matrix path; the preset may have replaced
                    // the bus shape already, so rebuild it.
                    coeff_count = layout_coeff_count(layout);
                    state.dry_map = map_2d(coeff_count);
                    state.foa_bufs = Vec::new();
                    state.foa_map = Vec::new();
                    BFormatDec::from_matrix(
                        coeff_count,
                        UPSAMPLE_XOVER_FREQ / desc.frequency as f32,
                        &layout_rows(layout),
                        layout.channels().len(),
                    )
                });
                state.dry_bufs = bus(state.dry_map.len());

                if layout == ChannelLayout::Stereo && desc.bs2b_level > 0 {
                    state.post = PostProcess::Bs2b {
                        decoder,
                        filter: Bs2b::new(desc.bs2b_level, desc.frequency),
                    };
                } else {
                    state.post = PostProcess::AmbiDec { decoder };
                }

                if desc.front_stabilizer && layout.has_front_triplet() {
                    state.stabilizer = Some(FrontStabilizer::new(
                        layout.channels().len(),
                        desc.frequency,
                    ));
                }
            }
        }

        // Panned B-format content lands on the first-order slice of the
        // dry bus when no dedicated first-order bus exists.
        if state.foa_map.is_empty() {
            state.foa_map = state
                .dry_map
                .iter()
                .filter(|config| config.index < 4)
                .take(4)
                .cloned()
                .collect();
        }

        state
    }

    /// Build a decoder from a custom preset, reshaping the dry bus to the
    /// preset's channel mask. Any validation failure falls back to the
    /// built-in matrix.
    fn preset_decoder(
        desc: &DeviceDesc,
        preset: &DecoderPreset,
        state: &mut DeviceMixState,
    ) -> Option<BFormatDec> {
        let channels = desc.layout.channels();
        let result = make_speaker_map(desc.layout, channels, preset).and_then(|chanmap| {
            BFormatDec::from_preset(preset, desc.frequency, &chanmap, channels.len())
                .map(|decoder| (decoder, chanmap))
        });
        let (decoder, chanmap) = match result {
            Ok(pair) => pair,
            Err(err) => {
                log::warn!("Decoder preset rejected ({err}); using the built-in matrix");
                return None;
            }
        };

        let count = preset.bus_channels();
        state.dry_map = if preset.is_periphonic() {
            (0..count).map(|acn| BFChannelConfig::new(1.0, acn)).collect()
        } else {
            ambi::index::FROM_2D[..count]
                .iter()
                .map(|&acn| BFChannelConfig::new(1.0, acn))
                .collect()
        };
        if preset.order() > 1 {
            // Dedicated first-order bus; the decoder's upsampler folds it
            // into the wider dry bus each quantum.
            let foa_count = if preset.is_periphonic() { 4 } else { 3 };
            state.foa_map = state.dry_map[..foa_count].to_vec();
            state.foa_bufs = vec![vec![0.0f32; BUFFER_SIZE]; foa_count];
        }

        let avg_dist =
            preset.speakers.iter().map(|s| s.distance).sum::<f32>() / preset.speakers.len() as f32;
        if avg_dist > 0.0 {
            state.avg_speaker_dist = avg_dist.min(10.0);
            state.channels_per_order = if preset.is_periphonic() {
                [1, 3, 5, 7]
            } else {
                [1, 2, 2, 2]
            };
            log::debug!("Near-field reference distance: {avg_dist:.2} meters");
        }

        Self::init_distance_comp(desc, preset, &chanmap, state);
        Some(decoder)
    }

    fn init_distance_comp(
        desc: &DeviceDesc,
        preset: &DecoderPreset,
        chanmap: &[usize],
        state: &mut DeviceMixState,
    ) {
        let max_dist = preset
            .speakers
            .iter()
            .map(|s| s.distance)
            .fold(0.0f32, f32::max);
        if max_dist <= 0.0 {
            return;
        }

        let srate = desc.frequency as f32;
        let mut delays: Vec<ChannelDelay> = (0..desc.layout.channels().len())
            .map(|_| ChannelDelay {
                gain: 1.0,
                buffer: Vec::new(),
            })
            .collect();
        for (speaker, &chan) in preset.speakers.iter().zip(chanmap.iter()) {
            // Delays land on whole samples; at 48kHz that is steps of
            // about 7 millimeters.
            let delay = ((max_dist - speaker.distance) / SPEED_OF_SOUND_METERS_PER_SEC * srate
                + 0.5)
                .floor()
                .clamp(0.0, (BUFFER_SIZE - 1) as f32) as usize;
            // Round up to 4 samples to keep the lines aligned.
            let length = delay.div_ceil(4) * 4;
            delays[chan].gain = speaker.distance / max_dist;
            delays[chan].buffer = vec![0.0; length];
            log::debug!(
                "Channel {chan} \"{}\" distance compensation: {delay} samples, {:.3} gain",
                speaker.name,
                delays[chan].gain
            );
        }
        state.channel_delay = delays;
    }

    pub fn desc(&self) -> &DeviceDesc {
        &self.desc
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn frequency(&self) -> u32 {
        self.desc.frequency
    }

    pub fn num_sends(&self) -> usize {
        self.num_sends
    }

    /// Interleaved output channel count.
    pub fn channel_count(&self) -> usize {
        self.desc.layout.count(self.desc.ambi_order)
    }

    pub fn sample_type(&self) -> SampleType {
        self.desc.sample_type
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Even while no quantum is in flight.
    pub fn mix_count(&self) -> u32 {
        self.mix_count.load(Ordering::Acquire)
    }

    /// Render clock: whole seconds and the samples into the current one,
    /// read consistently against a running mixer.
    pub fn clock(&self) -> (u64, u32) {
        loop {
            let count = self.mix_count.load(Ordering::Acquire);
            let secs = self.clock_base_sec.load(Ordering::Acquire);
            let samples = self.samples_done.load(Ordering::Acquire);
            if count % 2 == 0 && self.mix_count.load(Ordering::Acquire) == count {
                return (secs, samples);
            }
            std::hint::spin_loop();
        }
    }

    pub(crate) fn register_context(&self, ctx: Arc<ContextShared>) {
        self.contexts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(ctx);
    }

    pub(crate) fn unregister_context(&self, ctx: &Arc<ContextShared>) {
        let mut contexts = self
            .contexts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        contexts.retain(|have| !Arc::ptr_eq(have, ctx));
    }

    /// Mark the device lost: retire every voice, broadcast the disconnect,
    /// and make further renders produce silence until a reset.
    pub fn handle_disconnect(&self, message: &str) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        log::error!("Device disconnected: {message}");

        let contexts = self
            .contexts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for ctx in contexts {
            let mut ctx_mix = ctx
                .mix
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if ctx_mix.events.enabled(EVENT_TYPE_DISCONNECTED) {
                ctx_mix
                    .events
                    .post(AsyncEvent::Disconnected(DisconnectMsg::new(message)));
            }
            for (index, slot) in ctx.voices.slots().iter().enumerate() {
                // Whoever zeroes the source id owns the release.
                let sid = slot.source_id.swap(0, Ordering::AcqRel);
                if sid == 0 {
                    continue;
                }
                slot.playing.store(false, Ordering::Release);
                ctx.voices.release(index);
                ctx_mix.events.post_source_stopped(sid);
            }
        }
    }

    /// Render `frames` frames. With a buffer, fills
    /// `frames * channel_count()` samples of the device sample type
    /// (native endian, interleaved); without one, drives the engine with
    /// no capture.
    pub fn mix_data(&self, mut out: Option<&mut [u8]>, frames: usize) -> Result<()> {
        let channels = self.channel_count();
        if let Some(ref buffer) = out {
            let needed = frames * channels * self.desc.sample_type.bytes();
            if buffer.len() < needed {
                return Err(IrisonicError::InvalidParameter(format!(
                    "output buffer holds {} bytes, need {needed}",
                    buffer.len()
                )));
            }
        }

        if !self.is_connected() {
            if let Some(buffer) = out {
                Self::write_silence(self.desc.sample_type, buffer, frames * channels);
            }
            return Ok(());
        }

        let mut mix_guard = self
            .mix
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mix = &mut *mix_guard;

        let mut done = 0usize;
        while done < frames {
            let todo = (frames - done).min(BUFFER_SIZE);

            for buffer in mix
                .dry_bufs
                .iter_mut()
                .chain(mix.foa_bufs.iter_mut())
                .chain(mix.real_bufs.iter_mut())
            {
                buffer[..todo].fill(0.0);
            }

            // Odd while contexts are being processed.
            self.mix_count.fetch_add(1, Ordering::AcqRel);

            {
                let contexts = self
                    .contexts
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                for ctx in contexts.iter() {
                    self.process_context(ctx, mix, todo);
                }
            }

            // Advance the clock, rolling whole seconds into the base so
            // large sample counts can't overflow the remainder.
            let mut samples = self.samples_done.load(Ordering::Relaxed) + todo as u32;
            if samples >= self.desc.frequency {
                self.clock_base_sec
                    .fetch_add((samples / self.desc.frequency) as u64, Ordering::AcqRel);
                samples %= self.desc.frequency;
            }
            self.samples_done.store(samples, Ordering::Release);

            self.mix_count.fetch_add(1, Ordering::AcqRel);

            self.run_post_process(mix, todo);

            {
                let DeviceMixState {
                    dry_bufs,
                    real_bufs,
                    stabilizer,
                    limiter,
                    channel_delay,
                    delay_scratch,
                    dither_seed,
                    dither_depth,
                    ..
                } = mix;

                if let Some(stabilizer) = stabilizer.as_mut() {
                    if let Some(cidx) = self
                        .real_channels
                        .iter()
                        .position(|&ch| ch == Channel::FrontCenter)
                    {
                        stabilizer.apply(real_bufs, self.real_left, self.real_right, cidx, todo);
                    }
                }

                let out_bufs: &mut Vec<Vec<f32>> = if real_bufs.is_empty() {
                    dry_bufs
                } else {
                    real_bufs
                };

                if let Some(limiter) = limiter.as_mut() {
                    limiter.process(out_bufs, todo);
                }

                apply_distance_comp(out_bufs, channel_delay, delay_scratch, todo);

                if *dither_depth > 0.0 {
                    apply_dither(out_bufs, dither_seed, *dither_depth, todo);
                }

                if let Some(buffer) = out.as_deref_mut() {
                    write_interleaved(self.desc.sample_type, out_bufs, buffer, done, todo);
                }
            }

            done += todo;
        }

        Ok(())
    }

    fn write_silence(sample_type: SampleType, out: &mut [u8], samples: usize) {
        // Zero bytes are silence for signed and float formats; unsigned
        // formats sit at the midpoint instead.
        match sample_type {
            SampleType::U8 => out[..samples].fill(0x80),
            SampleType::U16 => {
                for chunk in out[..samples * 2].chunks_exact_mut(2) {
                    chunk.copy_from_slice(&0x8000u16.to_ne_bytes());
                }
            }
            SampleType::U32 => {
                for chunk in out[..samples * 4].chunks_exact_mut(4) {
                    chunk.copy_from_slice(&0x8000_0000u32.to_ne_bytes());
                }
            }
            other => out[..samples * other.bytes()].fill(0),
        }
    }

    fn run_post_process(&self, mix: &mut DeviceMixState, frames: usize) {
        let DeviceMixState {
            dry_bufs,
            foa_bufs,
            real_bufs,
            post,
            ..
        } = mix;
        match post {
            PostProcess::Hrtf { state } => {
                let (left, right) = split_pair(real_bufs, self.real_left, self.real_right);
                mix_direct_hrtf(left, right, dry_bufs, state, frames);
            }
            PostProcess::AmbiDec { decoder } => {
                if !foa_bufs.is_empty() {
                    decoder.up_sample(dry_bufs, foa_bufs, frames);
                }
                decoder.process(real_bufs, dry_bufs, frames);
            }
            PostProcess::AmbiUp { upsampler } => {
                upsampler.process(dry_bufs, foa_bufs, frames);
            }
            PostProcess::Uhj { encoder } => {
                let (left, right) = split_pair(real_bufs, self.real_left, self.real_right);
                encoder.encode(left, right, &dry_bufs[0], &dry_bufs[1], &dry_bufs[2], frames);
            }
            PostProcess::Bs2b { decoder, filter } => {
                decoder.process(real_bufs, dry_bufs, frames);
                let (left, right) = split_pair(real_bufs, self.real_left, self.real_right);
                filter.cross_feed(left, right, frames);
            }
            PostProcess::None => {}
        }
    }

    /// One context's share of the quantum: parameter updates, wet-buffer
    /// clears, voice mixing, and effect processing.
    fn process_context(&self, ctx: &ContextShared, mix: &mut DeviceMixState, frames: usize) {
        let slots = ctx
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut ctx_mix = ctx
            .mix
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        ctx.update_count.fetch_add(1, Ordering::AcqRel);
        if !ctx.hold_updates.load(Ordering::Acquire) {
            self.process_updates(ctx, slots.as_slice(), &mut ctx_mix, mix);
        }
        ctx.update_count.fetch_add(1, Ordering::AcqRel);

        for slot in slots.iter() {
            slot.mix
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clear_wet_buffer(frames);
        }

        // Voices.
        for (index, voice_slot) in ctx.voices.slots().iter().enumerate() {
            if !voice_slot.playing.load(Ordering::Acquire) {
                continue;
            }
            let sid = voice_slot.source_id.load(Ordering::Relaxed);
            if sid == 0 {
                continue;
            }
            let mut voice = voice_slot
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            let alive = render_voice_channels(&mut voice, &mut mix.channel_cache, frames);

            match voice.direct.target {
                MixTarget::Dry => {
                    mix_voice_direct(&mut voice, &mix.channel_cache, &mut mix.dry_bufs, 0, 1, frames)
                }
                MixTarget::Foa => {
                    if mix.foa_bufs.is_empty() {
                        mix_voice_direct(
                            &mut voice,
                            &mix.channel_cache,
                            &mut mix.dry_bufs,
                            0,
                            1,
                            frames,
                        )
                    } else {
                        mix_voice_direct(
                            &mut voice,
                            &mix.channel_cache,
                            &mut mix.foa_bufs,
                            0,
                            1,
                            frames,
                        )
                    }
                }
                MixTarget::Real => mix_voice_direct(
                    &mut voice,
                    &mix.channel_cache,
                    &mut mix.real_bufs,
                    self.real_left,
                    self.real_right,
                    frames,
                ),
            }

            for send_idx in 0..voice.sends.len() {
                let Some(slot_id) = voice.sends[send_idx].slot else {
                    continue;
                };
                let Some(slot) = slots.get(slot_id) else {
                    continue;
                };
                let mut slot_mix = slot
                    .mix
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                mix_voice_send(
                    &mut voice,
                    send_idx,
                    &mix.channel_cache,
                    &mut slot_mix.wet_buffer,
                    frames,
                );
            }

            if !alive {
                drop(voice);
                // Whoever zeroes the source id owns the release.
                if voice_slot.source_id.swap(0, Ordering::AcqRel) == sid {
                    voice_slot.playing.store(false, Ordering::Release);
                    ctx.voices.release(index);
                    ctx_mix.events.post_source_stopped(sid);
                }
            }
        }

        // Effects, producers before the slots they feed.
        if slots.is_empty() {
            return;
        }
        ctx_mix.slot_targets.clear();
        for slot in slots.iter() {
            let params = slot
                .mix
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .params;
            ctx_mix.slot_targets.push(params.target);
        }
        let ContextMix {
            sorted_slots,
            slot_targets,
            ..
        } = &mut *ctx_mix;
        crate::effects::sort_slots(sorted_slots, slot_targets);

        for &slot_id in sorted_slots.iter() {
            match slot_targets[slot_id] {
                Some(target_id) if target_id != slot_id && target_id < slots.len() => {
                    let (low, high) = if slot_id < target_id {
                        (slot_id, target_id)
                    } else {
                        (target_id, slot_id)
                    };
                    let (head, tail) = slots.split_at(high);
                    let (low_slot, high_slot) = (&head[low], &tail[0]);
                    let (src_slot, dst_slot) = if slot_id < target_id {
                        (low_slot, high_slot)
                    } else {
                        (high_slot, low_slot)
                    };
                    let mut src = src_slot
                        .mix
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    let mut dst = dst_slot
                        .mix
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    let SlotMixState {
                        wet_buffer, state, ..
                    } = &mut *src;
                    state.process(frames, wet_buffer, &mut dst.wet_buffer);
                }
                _ => {
                    let mut src = slots[slot_id]
                        .mix
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    let SlotMixState {
                        wet_buffer, state, ..
                    } = &mut *src;
                    state.process(frames, wet_buffer, &mut mix.dry_bufs);
                }
            }
        }
    }

    fn process_updates(
        &self,
        ctx: &ContextShared,
        slots: &[Arc<SlotShared>],
        ctx_mix: &mut ContextMix,
        mix: &mut DeviceMixState,
    ) {
        let mut force = false;
        if let Some(block) = ctx.world_update.consume() {
            ctx_mix.listener.apply_world(&block.props, &self.config);
            ctx.world_pool.recycle(block);
            force = true;
        }
        if let Some(block) = ctx.listener_update.consume() {
            ctx_mix.listener.apply_listener(&block.props);
            ctx.listener_pool.recycle(block);
            force = true;
        }

        ctx_mix
            .slot_props
            .resize(slots.len(), crate::effects::EffectProps::Null);
        for (slot_id, slot) in slots.iter().enumerate() {
            let consumed = slot.update.consume();
            if consumed.is_none() && !force {
                continue;
            }
            let mut slot_mix = slot
                .mix
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(mut block) = consumed {
                slot_mix.params = SlotParams::digest(&block.props);
                ctx_mix.slot_props[slot_id] = block.props.props;
                if let Some(new_state) = block.props.state.take() {
                    let old = std::mem::replace(&mut slot_mix.state, new_state);
                    // The old state must not be destroyed on this thread.
                    // Hand it to the dispatch side, or park it in the
                    // recycled block for the API side to clean up later.
                    if let Err(AsyncEvent::ReleaseEffectState(old)) =
                        ctx_mix.events.try_post(AsyncEvent::ReleaseEffectState(old))
                    {
                        block.props.state = Some(old);
                    }
                }
                ctx.slot_pool.recycle(block);
            }

            let gain = slot_mix.params.gain;
            let has_target = slot_mix.params.target.is_some();
            let props = ctx_mix.slot_props[slot_id];
            let SlotMixState {
                state, chan_map, ..
            } = &mut *slot_mix;
            let ambi_map: &[BFChannelConfig] = if has_target { chan_map } else { &mix.dry_map };
            state.update(gain, &props, &EffectTarget { ambi_map });
        }

        // Voices: consume snapshots and recompute mixing parameters.
        for voice_slot in ctx.voices.slots() {
            if !voice_slot.playing.load(Ordering::Acquire) {
                continue;
            }
            if voice_slot.source_id.load(Ordering::Relaxed) == 0 {
                continue;
            }
            let consumed = voice_slot.update.consume();
            if consumed.is_none() && !force {
                continue;
            }
            let mut voice = voice_slot
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(block) = consumed {
                voice.props = block.props.clone();
                ctx.source_pool.recycle(block);
            }

            let Some(first) = voice.queue.first() else {
                continue;
            };
            let (format, buffer_hz) = (first.format(), first.frequency());

            // Resolve send targets, holding each slot's state for the
            // duration of the recalculation.
            let mut send_guards: [Option<MutexGuard<'_, SlotMixState>>; MAX_SENDS] =
                [None, None, None, None];
            let mut send_ids: [Option<usize>; MAX_SENDS] = [None; MAX_SENDS];
            for i in 0..self.num_sends.min(MAX_SENDS) {
                let mut slot_id = voice.props.sends[i].slot;
                if slot_id.is_none() && i == 0 {
                    slot_id = ctx.default_slot();
                }
                let Some(slot_id) = slot_id else { continue };
                if slot_id >= slots.len() {
                    continue;
                }
                // A slot claimed by an earlier send stays with that send;
                // doubling a slot across sends would self-deadlock here.
                if send_ids[..i].iter().flatten().any(|&have| have == slot_id) {
                    continue;
                }
                let guard = slots[slot_id]
                    .mix
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if guard.params.is_null {
                    continue;
                }
                send_ids[i] = Some(slot_id);
                send_guards[i] = Some(guard);
            }
            let mut targets: [Option<SendTarget<'_>>; MAX_SENDS] = [None; MAX_SENDS];
            for ((target, guard), id) in targets
                .iter_mut()
                .zip(send_guards.iter())
                .zip(send_ids.iter())
            {
                if let (Some(guard), Some(id)) = (guard, id) {
                    *target = Some(SendTarget {
                        slot: *id,
                        params: &guard.params,
                        chan_map: &guard.chan_map,
                    });
                }
            }

            let calc_device = CalcDevice {
                frequency: self.desc.frequency,
                render_mode: mix.render_mode,
                avg_speaker_dist: mix.avg_speaker_dist,
                num_sends: self.num_sends,
                dry_map: &mix.dry_map,
                foa_map: &mix.foa_map,
                real_channels: &self.real_channels,
                channels_per_order: mix.channels_per_order,
                hrtf: self.hrtf.as_deref(),
            };
            calc_source_params(
                &mut voice,
                format,
                buffer_hz,
                &ctx_mix.listener,
                &calc_device,
                &targets,
                &self.config,
            );
        }
    }
}

fn split_pair(buffers: &mut [Vec<f32>], left: usize, right: usize) -> (&mut [f32], &mut [f32]) {
    debug_assert!(left != right);
    if left < right {
        let (head, tail) = buffers.split_at_mut(right);
        (&mut head[left], &mut tail[0])
    } else {
        let (head, tail) = buffers.split_at_mut(left);
        (&mut tail[0], &mut head[right])
    }
}

fn apply_distance_comp(
    buffers: &mut [Vec<f32>],
    delays: &mut [ChannelDelay],
    scratch: &mut [f32],
    frames: usize,
) {
    for (buffer, delay) in buffers.iter_mut().zip(delays.iter_mut()) {
        let gain = delay.gain;
        let length = delay.buffer.len();
        if length == 0 {
            if gain < 1.0 {
                for sample in buffer.iter_mut().take(frames) {
                    *sample *= gain;
                }
            }
            continue;
        }

        if frames >= length {
            // Old line contents lead, then the input shifted by the delay;
            // the line keeps the input tail.
            scratch[..length].copy_from_slice(&delay.buffer);
            scratch[length..frames].copy_from_slice(&buffer[..frames - length]);
            delay.buffer.copy_from_slice(&buffer[frames - length..frames]);
        } else {
            scratch[..frames].copy_from_slice(&delay.buffer[..frames]);
            delay.buffer.rotate_left(frames);
            delay.buffer[length - frames..].copy_from_slice(&buffer[..frames]);
        }
        for (sample, &delayed) in buffer.iter_mut().zip(scratch.iter()).take(frames) {
            *sample = delayed * gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressor_limits_peaks() {
        let mut comp = Compressor::new(44100, 1.0);
        let mut bufs = vec![vec![4.0f32; 2048]];
        comp.process(&mut bufs, 2048);
        // After the attack settles, output holds near the ceiling.
        assert!(bufs[0][2047].abs() <= 1.05);
        assert!(bufs[0][2047] > 0.5);
    }

    #[test]
    fn compressor_passes_quiet_signal() {
        let mut comp = Compressor::new(44100, 1.0);
        let mut bufs = vec![vec![0.25f32; 64]];
        comp.process(&mut bufs, 64);
        assert!(bufs[0].iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn distance_comp_delays_by_line_length() {
        let mut delays = vec![ChannelDelay {
            gain: 1.0,
            buffer: vec![0.0; 4],
        }];
        let mut bufs = vec![vec![0.0f32; 16]];
        bufs[0][0] = 1.0;
        let mut scratch = vec![0.0f32; 16];
        apply_distance_comp(&mut bufs, &mut delays, &mut scratch, 16);
        assert_eq!(bufs[0][0], 0.0);
        assert_eq!(bufs[0][4], 1.0);
    }

    #[test]
    fn distance_comp_survives_small_quanta() {
        let mut delays = vec![ChannelDelay {
            gain: 1.0,
            buffer: vec![0.0; 8],
        }];
        let mut scratch = vec![0.0f32; 16];
        // Impulse crosses two 4-frame quanta before emerging.
        let mut first = vec![vec![0.0f32; 4]];
        first[0][0] = 1.0;
        apply_distance_comp(&mut first, &mut delays, &mut scratch, 4);
        assert!(first[0].iter().all(|&s| s == 0.0));
        let mut second = vec![vec![0.0f32; 4]];
        apply_distance_comp(&mut second, &mut delays, &mut scratch, 4);
        assert!(second[0].iter().all(|&s| s == 0.0));
        let mut third = vec![vec![0.0f32; 4]];
        apply_distance_comp(&mut third, &mut delays, &mut scratch, 4);
        assert_eq!(third[0][0], 1.0);
    }

    #[test]
    fn split_pair_returns_disjoint_channels() {
        let mut bufs = vec![vec![1.0f32; 4], vec![2.0f32; 4]];
        let (left, right) = split_pair(&mut bufs, 0, 1);
        assert_eq!(left[0], 1.0);
        assert_eq!(right[0], 2.0);
        let (left, right) = split_pair(&mut bufs, 1, 0);
        assert_eq!(left[0], 2.0);
        assert_eq!(right[0], 1.0);
    }
}
