//! Mixer-side voices and the bounded voice pool.
//!
//! A voice shadows one playing source. API threads claim a voice from the
//! pool, seed its playback state under the per-voice lock, publish a
//! property snapshot, and flip `playing`; from then on the mixer owns the
//! inner state until playback ends. Releases push the index back onto a
//! Treiber stack of free slots, tagged with a generation counter so a
//! concurrent pop can't be fooled by reuse.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::ambi::MAX_AMBI_ORDER;
use crate::effects::SlotId;
use crate::filters::{BiquadFilter, NfcFilter};
use crate::hrtf::{HrirCoeffs, HRIR_LENGTH, HRTF_HISTORY_LENGTH};
use crate::resample::{BsincState, Resampler, MAX_RESAMPLER_PADDING};
use crate::source::{AudioBuffer, SourceProps};
use crate::update::UpdateSlot;

/// Ceiling on mixing-bus and real output channels.
pub const MAX_OUTPUT_CHANNELS: usize = 16;
/// Widest buffer content a voice accepts.
pub const MAX_INPUT_CHANNELS: usize = 8;

/// Direct-path filter selection, set per quantum by the calculator.
pub const FILTER_LOW_PASS: u8 = 1 << 0;
pub const FILTER_HIGH_PASS: u8 = 1 << 1;

/// Which device buffer group the direct path feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MixTarget {
    #[default]
    Dry,
    /// The first-order bus, for B-format content on higher-order devices.
    Foa,
    /// Real outputs, for direct-channel and HRTF rendering.
    Real,
}

/// Gain ramp endpoints for one input channel against every output.
#[derive(Debug, Clone, Copy)]
pub struct TargetGains {
    pub current: [f32; MAX_OUTPUT_CHANNELS],
    pub target: [f32; MAX_OUTPUT_CHANNELS],
}

impl Default for TargetGains {
    fn default() -> Self {
        Self {
            current: [0.0; MAX_OUTPUT_CHANNELS],
            target: [0.0; MAX_OUTPUT_CHANNELS],
        }
    }
}

/// One binaural filter setting: per-tap stereo coefficients, per-ear
/// delays, and an overall gain.
#[derive(Debug, Clone, Copy)]
pub struct HrtfFilter {
    pub coeffs: HrirCoeffs,
    pub delays: [u32; 2],
    pub gain: f32,
}

impl Default for HrtfFilter {
    fn default() -> Self {
        Self {
            coeffs: [[0.0; 2]; HRIR_LENGTH],
            delays: [0; 2],
            gain: 0.0,
        }
    }
}

/// Per-channel binaural state: the interpolation endpoints plus an input
/// history ring for the delayed convolution.
#[derive(Clone)]
pub struct VoiceHrtfState {
    pub current: HrtfFilter,
    pub target: HrtfFilter,
    pub history: [f32; HRTF_HISTORY_LENGTH],
    pub offset: usize,
}

impl Default for VoiceHrtfState {
    fn default() -> Self {
        Self {
            current: HrtfFilter::default(),
            target: HrtfFilter::default(),
            history: [0.0; HRTF_HISTORY_LENGTH],
            offset: 0,
        }
    }
}

/// Direct-path mixing state for one input channel.
#[derive(Clone, Default)]
pub struct DirectChannelParams {
    pub low_pass: BiquadFilter,
    pub high_pass: BiquadFilter,
    pub nfc: NfcFilter,
    pub hrtf: VoiceHrtfState,
    pub gains: TargetGains,
}

/// Send-path mixing state for one input channel.
#[derive(Clone, Default)]
pub struct SendChannelParams {
    pub low_pass: BiquadFilter,
    pub high_pass: BiquadFilter,
    pub gains: TargetGains,
}

#[derive(Default)]
pub struct VoiceDirect {
    pub target: MixTarget,
    pub filter_mask: u8,
    pub channel_count: usize,
    pub channels_per_order: [usize; MAX_AMBI_ORDER + 1],
    pub params: Vec<DirectChannelParams>,
}

#[derive(Default)]
pub struct VoiceSend {
    pub slot: Option<SlotId>,
    pub filter_mask: u8,
    pub channel_count: usize,
    pub params: Vec<SendChannelParams>,
}

/// Everything the mixer reads and writes while rendering one voice.
pub struct Voice {
    pub props: SourceProps,
    pub queue: Vec<Arc<AudioBuffer>>,
    pub queue_index: usize,
    /// Frame position inside the current queue entry.
    pub position: usize,
    pub position_frac: u32,
    /// 16.16 playback step.
    pub step: u32,
    pub resampler: Resampler,
    pub bsinc: BsincState,
    pub has_hrtf: bool,
    pub has_nfc: bool,
    /// Snap gains to target instead of ramping on the first mixed quantum.
    pub fresh: bool,
    pub direct: VoiceDirect,
    pub sends: Vec<VoiceSend>,
    /// Resampler history per input channel, newest sample last.
    pub prev_samples: Vec<[f32; MAX_RESAMPLER_PADDING]>,
}

impl Voice {
    fn new(num_sends: usize) -> Self {
        let mut sends = Vec::with_capacity(num_sends);
        for _ in 0..num_sends {
            sends.push(VoiceSend {
                params: vec![SendChannelParams::default(); MAX_INPUT_CHANNELS],
                ..Default::default()
            });
        }
        Self {
            props: SourceProps::default(),
            queue: Vec::new(),
            queue_index: 0,
            position: 0,
            position_frac: 0,
            step: 0,
            resampler: Resampler::default(),
            bsinc: BsincState::default(),
            has_hrtf: false,
            has_nfc: false,
            fresh: true,
            direct: VoiceDirect {
                params: vec![DirectChannelParams::default(); MAX_INPUT_CHANNELS],
                ..Default::default()
            },
            sends,
            prev_samples: vec![[0.0; MAX_RESAMPLER_PADDING]; MAX_INPUT_CHANNELS],
        }
    }

    /// Reset playback state for a new source binding.
    pub fn prepare(&mut self, queue: Vec<Arc<AudioBuffer>>, props: SourceProps) {
        self.props = props;
        self.queue = queue;
        self.queue_index = 0;
        self.position = 0;
        self.position_frac = 0;
        self.step = 0;
        self.fresh = true;
        self.has_hrtf = false;
        self.has_nfc = false;
        for history in &mut self.prev_samples {
            history.fill(0.0);
        }
        for chan in &mut self.direct.params {
            chan.low_pass.clear();
            chan.high_pass.clear();
            chan.hrtf = VoiceHrtfState::default();
            chan.gains = TargetGains::default();
        }
        for send in &mut self.sends {
            send.slot = None;
            for chan in &mut send.params {
                chan.low_pass.clear();
                chan.high_pass.clear();
                chan.gains = TargetGains::default();
            }
        }
    }

    /// Total frames across the queue, for diagnostics.
    pub fn queued_frames(&self) -> usize {
        self.queue.iter().map(|buffer| buffer.frames()).sum()
    }
}

/// One pool entry. The atomics are the cross-thread handshake; `inner` is
/// only locked by the API while idle and by the mixer while playing.
pub struct VoiceSlot {
    pub source_id: AtomicU32,
    pub playing: AtomicBool,
    pub update: UpdateSlot<SourceProps>,
    /// Claim order stamp, for the steal policy.
    pub serial: AtomicU64,
    pub inner: Mutex<Voice>,
}

impl VoiceSlot {
    fn new(num_sends: usize) -> Self {
        Self {
            source_id: AtomicU32::new(0),
            playing: AtomicBool::new(false),
            update: UpdateSlot::new(),
            serial: AtomicU64::new(0),
            inner: Mutex::new(Voice::new(num_sends)),
        }
    }
}

const FREE_NONE: u32 = u32::MAX;

/// Bounded voice pool with a lock-free free list.
pub struct VoicePool {
    slots: Box<[VoiceSlot]>,
    /// Packed (generation << 32) | head-index.
    free_head: AtomicU64,
    free_next: Box<[AtomicU32]>,
    next_serial: AtomicU64,
}

impl VoicePool {
    pub fn new(count: usize, num_sends: usize) -> Self {
        assert!(count > 0 && count < FREE_NONE as usize);
        let slots: Box<[VoiceSlot]> = (0..count).map(|_| VoiceSlot::new(num_sends)).collect();
        let free_next: Box<[AtomicU32]> = (0..count)
            .map(|i| {
                if i + 1 < count {
                    AtomicU32::new(i as u32 + 1)
                } else {
                    AtomicU32::new(FREE_NONE)
                }
            })
            .collect();
        Self {
            slots,
            free_head: AtomicU64::new(0),
            free_next,
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[VoiceSlot] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> &VoiceSlot {
        &self.slots[index]
    }

    /// Stamp a claim with the next serial.
    pub fn stamp(&self, index: usize) {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        self.slots[index].serial.store(serial, Ordering::Relaxed);
    }

    /// Pop a free voice index.
    pub fn allocate(&self) -> Option<usize> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let index = (head & 0xffff_ffff) as u32;
            if index == FREE_NONE {
                return None;
            }
            let next = self.free_next[index as usize].load(Ordering::Acquire);
            let generation = head >> 32;
            let replacement = ((generation + 1) << 32) | next as u64;
            match self.free_head.compare_exchange_weak(
                head,
                replacement,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index as usize),
                Err(current) => head = current,
            }
        }
    }

    /// Return a voice index to the pool. Called by whichever side retired
    /// the voice; never blocks.
    pub fn release(&self, index: usize) {
        debug_assert!(index < self.slots.len());
        let mut head = self.free_head.load(Ordering::Relaxed);
        loop {
            let generation = head >> 32;
            self.free_next[index].store((head & 0xffff_ffff) as u32, Ordering::Release);
            let replacement = ((generation + 1) << 32) | index as u64;
            match self.free_head.compare_exchange_weak(
                head,
                replacement,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// The playing voice with the oldest claim stamp, for stealing when
    /// the pool runs dry.
    pub fn oldest_playing(&self) -> Option<usize> {
        let mut best: Option<(u64, usize)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.playing.load(Ordering::Acquire) {
                continue;
            }
            let serial = slot.serial.load(Ordering::Relaxed);
            if best.map(|(s, _)| serial < s).unwrap_or(true) {
                best = Some((serial, index));
            }
        }
        best.map(|(_, index)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_allocates_every_slot_once() {
        let pool = VoicePool::new(4, 2);
        let mut got = Vec::new();
        while let Some(index) = pool.allocate() {
            got.push(index);
        }
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert!(pool.allocate().is_none());
    }

    #[test]
    fn released_voices_come_back() {
        let pool = VoicePool::new(2, 2);
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());
        pool.release(a);
        assert_eq!(pool.allocate(), Some(a));
    }

    #[test]
    fn oldest_playing_tracks_claim_order() {
        let pool = VoicePool::new(3, 2);
        for _ in 0..3 {
            let index = pool.allocate().unwrap();
            pool.stamp(index);
            pool.slot(index).playing.store(true, Ordering::Release);
            pool.slot(index)
                .source_id
                .store(index as u32 + 1, Ordering::Relaxed);
        }
        // The first claim has the lowest serial.
        assert_eq!(pool.oldest_playing(), Some(0));
        pool.slot(0).playing.store(false, Ordering::Release);
        assert_eq!(pool.oldest_playing(), Some(1));
    }

    #[test]
    fn concurrent_alloc_release_stays_consistent() {
        let pool = Arc::new(VoicePool::new(8, 1));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            threads.push(std::thread::spawn(move || {
                for _ in 0..2000 {
                    if let Some(index) = pool.allocate() {
                        pool.release(index);
                    }
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }
        // All 8 slots must still be allocatable exactly once.
        let mut got = Vec::new();
        while let Some(index) = pool.allocate() {
            got.push(index);
        }
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn prepare_resets_playback_state() {
        let mut voice = Voice::new(2);
        voice.position = 99;
        voice.position_frac = 1234;
        voice.queue_index = 1;
        let buffer = AudioBuffer::new(vec![0.0; 8], crate::source::BufferFormat::Mono, 44100)
            .unwrap();
        voice.prepare(vec![buffer], SourceProps::default());
        assert_eq!(voice.position, 0);
        assert_eq!(voice.position_frac, 0);
        assert_eq!(voice.queue_index, 0);
        assert!(voice.fresh);
        assert_eq!(voice.queued_frames(), 8);
    }
}
